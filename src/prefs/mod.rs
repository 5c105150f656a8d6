use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use async_trait::async_trait;
use tracing::warn;

/// Name of the preference file inside the data directory
const PREFERENCES_FILE: &str = "preferences.json";

/// Flag set once the engine has completed its first successful initialization
pub const FIRST_LAUNCH_COMPLETE: &str = "first_launch_complete";

/// Flag gating all telemetry collection; off until the user opts in
pub const TELEMETRY_ENABLED: &str = "telemetry_enabled";

/// A boolean key-value store for user-scoped flags.
///
/// Unknown keys read as false. Implementations never surface storage
/// failures to callers; they degrade to the default value instead.
#[async_trait]
pub trait PreferenceStore: Send + Sync {
    /// Reads a flag, returning false when the key is absent.
    async fn get_bool(&self, key: &str) -> bool;

    /// Writes a flag.
    async fn set_bool(&self, key: &str, value: bool);
}

/// In-memory preference store for tests and ephemeral runs.
pub struct MemoryPreferences {
    values: RwLock<HashMap<String, bool>>,
}

impl MemoryPreferences {
    pub fn new() -> Self {
        Self {
            values: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryPreferences {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PreferenceStore for MemoryPreferences {
    async fn get_bool(&self, key: &str) -> bool {
        self.values
            .read()
            .map(|values| values.get(key).copied().unwrap_or(false))
            .unwrap_or(false)
    }

    async fn set_bool(&self, key: &str, value: bool) {
        if let Ok(mut values) = self.values.write() {
            values.insert(key.to_string(), value);
        }
    }
}

/// File-backed preference store persisted as pretty JSON under the data
/// directory. Values are cached in memory and written through on change.
pub struct JsonPreferences {
    path: PathBuf,
    values: RwLock<HashMap<String, bool>>,
}

impl JsonPreferences {
    /// Opens the preference file inside `data_dir`, tolerating a missing or
    /// unreadable file by starting from defaults.
    pub fn open(data_dir: &Path) -> Self {
        let path = data_dir.join(PREFERENCES_FILE);
        let values = match fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(values) => values,
                Err(e) => {
                    warn!("Ignoring unreadable preference file {}: {}", path.display(), e);
                    HashMap::new()
                }
            },
            // A missing file is the normal first run
            Err(_) => HashMap::new(),
        };

        Self {
            path,
            values: RwLock::new(values),
        }
    }

    fn persist(&self, values: &HashMap<String, bool>) {
        match serde_json::to_string_pretty(values) {
            Ok(content) => {
                if let Err(e) = fs::write(&self.path, content) {
                    warn!("Failed to write preferences to {}: {}", self.path.display(), e);
                }
            }
            Err(e) => warn!("Failed to serialize preferences: {}", e),
        }
    }
}

#[async_trait]
impl PreferenceStore for JsonPreferences {
    async fn get_bool(&self, key: &str) -> bool {
        self.values
            .read()
            .map(|values| values.get(key).copied().unwrap_or(false))
            .unwrap_or(false)
    }

    async fn set_bool(&self, key: &str, value: bool) {
        if let Ok(mut values) = self.values.write() {
            values.insert(key.to_string(), value);
            self.persist(&values);
        }
    }
}
