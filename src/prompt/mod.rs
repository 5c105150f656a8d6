use std::error::Error;

/// Placeholder the user text is substituted into
pub const INPUT_PLACEHOLDER: &str = "{{INPUT}}";

/// Marker the model emits when it considers the rewrite complete
pub const END_MARKER: &str = "### End";

/// The default (version 1) template shipped with the crate
const TEMPLATE_V1: &str = include_str!("template_v1.txt");

/// A fixed prompt template with exactly one input placeholder.
///
/// Templates are validated on construction so rendering can never silently
/// drop or duplicate the user text.
#[derive(Debug, Clone)]
pub struct PromptTemplate {
    template: String,
}

impl PromptTemplate {
    /// Creates a template, verifying it contains the placeholder exactly once.
    pub fn new(template: &str) -> Result<Self, Box<dyn Error + Send + Sync>> {
        match template.matches(INPUT_PLACEHOLDER).count() {
            1 => Ok(Self {
                template: template.to_string(),
            }),
            0 => Err(format!("Prompt template is missing the {} placeholder", INPUT_PLACEHOLDER).into()),
            n => Err(format!("Prompt template contains {} placeholder {} times", INPUT_PLACEHOLDER, n).into()),
        }
    }

    /// Returns the embedded version 1 template.
    pub fn default_v1() -> Self {
        // Validity of the embedded resource is covered by a unit test
        Self {
            template: TEMPLATE_V1.to_string(),
        }
    }

    /// Substitutes the input text into the template.
    pub fn render(&self, input: &str) -> String {
        self.template.replace(INPUT_PLACEHOLDER, input)
    }
}

/// Removes the end marker and surrounding whitespace from completed output.
///
/// Everything from the first occurrence of the marker onwards is dropped;
/// output without a marker is only trimmed.
pub fn strip_end_marker(text: &str) -> String {
    match text.find(END_MARKER) {
        Some(idx) => text[..idx].trim().to_string(),
        None => text.trim().to_string(),
    }
}
