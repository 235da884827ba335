/// Marker replaced by the job token in a command template.
pub const PLACEHOLDER: &str = "{}";

/// One line of input waiting to be executed somewhere in the fleet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    /// Position in the input stream, starting at 0.
    pub seq: u64,
    pub token: String,
}

impl Job {
    pub fn new(seq: u64, token: impl Into<String>) -> Self {
        Self {
            seq,
            token: token.into(),
        }
    }
}

/// Command text with an optional `{}` placeholder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTemplate {
    template: String,
}

impl CommandTemplate {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }

    pub fn has_placeholder(&self) -> bool {
        self.template.contains(PLACEHOLDER)
    }

    /// Substitute `token` for every placeholder, verbatim.
    pub fn render(&self, token: &str) -> String {
        self.template.replace(PLACEHOLDER, token)
    }
}
