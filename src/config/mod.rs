// Required external crates for configuration management and serialization
use serde::Deserialize;
use std::path::PathBuf;
use config::{Config, ConfigError, Environment, File};

/// Configuration for the bundled model artifact and its writable home
#[derive(Debug, Deserialize, Clone)]
pub struct ModelConfig {
    /// Read-only source file the application ships with
    pub bundled_path: PathBuf,
    /// Writable private directory holding the extracted artifact,
    /// its fingerprint sidecar and the preference file
    pub data_dir: PathBuf,
}

/// Configuration for text generation parameters
#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    /// Controls randomness in generation (0.0-1.0)
    pub temperature: f32,
    /// Maximum number of tokens to generate per call
    pub max_tokens: usize,
    /// Size of the context window for inference
    pub context_size: usize,
}

/// Configuration for backend selection and tuning
#[derive(Debug, Deserialize, Clone)]
pub struct BackendConfig {
    /// Which backend to construct: "auto", "stub" or "llama"
    pub kind: String,
    /// Number of layers to offload to the GPU
    pub n_gpu_layers: u32,
    /// Whether to memory-map the model weights
    pub use_mmap: bool,
    /// Whether to lock the model weights in memory
    pub use_mlock: bool,
}

/// Configuration for application logging
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Log level (debug, info, warn, error)
    pub level: String,
    /// Optional log file directory
    pub file: Option<PathBuf>,
}

/// Main settings struct that contains all configuration
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    /// Model artifact settings
    pub model: ModelConfig,
    /// Generation settings
    pub generation: GenerationConfig,
    /// Backend settings
    pub backend: BackendConfig,
    /// Logging settings
    pub logging: LoggingConfig,
}

/// Implementation for loading and parsing configuration
impl Settings {
    /// Creates a new Settings instance by loading config from multiple sources
    /// in the following order of precedence (highest to lowest):
    /// 1. Environment variables prefixed with PLAINLY_
    /// 2. Local config file (local.toml) if present
    /// 3. Default config file (default.toml)
    pub fn new() -> Result<Self, ConfigError> {
        // Check if current directory exists
        let config_dir = std::env::current_dir()
            .map_err(|e| ConfigError::Message(
                format!("Failed to get current directory: {}", e)
            ))?
            .join("config");

        // Check if config directory exists
        if !config_dir.exists() {
            return Err(ConfigError::Message(
                format!("Config directory not found at: {}", config_dir.display())
            ));
        }

        // Check if default.toml exists
        let default_config = config_dir.join("default.toml");
        if !default_config.exists() {
            return Err(ConfigError::Message(
                format!("Default configuration file not found at: {}", default_config.display())
            ));
        }

        // Create the local config path
        let local_config = config_dir.join("local.toml");

        // Convert paths to strings and keep them alive
        let default_config_path = default_config.to_string_lossy();
        let local_config_path = local_config.to_string_lossy();

        // Load and validate configuration
        let settings = Config::builder()
            .add_source(File::with_name(&default_config_path))
            .add_source(File::with_name(&local_config_path).required(false))
            .add_source(Environment::with_prefix("PLAINLY").separator("_"))
            .build()?
            .try_deserialize::<Settings>()?;

        // Validate settings after loading
        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration values
    fn validate(&self) -> Result<(), ConfigError> {
        // Create the data directory if it doesn't exist
        if !self.model.data_dir.exists() {
            std::fs::create_dir_all(&self.model.data_dir).map_err(|e| {
                ConfigError::Message(format!(
                    "Failed to create data directory at {}: {}",
                    self.model.data_dir.display(), e
                ))
            })?;
        }

        // Validate temperature range
        if !(0.0..=1.0).contains(&self.generation.temperature) {
            return Err(ConfigError::Message(
                format!("Temperature must be between 0.0 and 1.0, got: {}", self.generation.temperature)
            ));
        }

        // Validate max_tokens
        if self.generation.max_tokens == 0 {
            return Err(ConfigError::Message(
                "max_tokens must be greater than 0".to_string()
            ));
        }

        // Validate context_size
        if self.generation.context_size == 0 {
            return Err(ConfigError::Message(
                "context_size must be greater than 0".to_string()
            ));
        }

        // Validate backend kind
        match self.backend.kind.to_lowercase().as_str() {
            "auto" | "stub" | "llama" => Ok(()),
            _ => Err(ConfigError::Message(
                format!("Invalid backend kind: {}. Must be one of: auto, stub, llama",
                    self.backend.kind)
            )),
        }?;

        // Validate logging level
        match self.logging.level.to_lowercase().as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => Ok(()),
            _ => Err(ConfigError::Message(
                format!("Invalid logging level: {}. Must be one of: error, warn, info, debug, trace",
                    self.logging.level)
            )),
        }?;

        // Create log file directory if configured and doesn't exist
        if let Some(log_file) = &self.logging.file {
            if !log_file.exists() {
                std::fs::create_dir_all(log_file).map_err(|e| {
                    ConfigError::Message(format!(
                        "Failed to create log directory at {}: {}",
                        log_file.display(), e
                    ))
                })?;
            }
        }

        Ok(())
    }
}

/// Builds a settings value the way tests need one, bypassing file loading.
#[cfg(test)]
pub(crate) fn test_settings(data_dir: PathBuf) -> Settings {
    Settings {
        model: ModelConfig {
            bundled_path: data_dir.join("bundled.gguf"),
            data_dir,
        },
        generation: GenerationConfig {
            temperature: 0.7,
            max_tokens: 256,
            context_size: 2048,
        },
        backend: BackendConfig {
            kind: "stub".to_string(),
            n_gpu_layers: 0,
            use_mmap: true,
            use_mlock: false,
        },
        logging: LoggingConfig {
            level: "info".to_string(),
            file: None,
        },
    }
}
