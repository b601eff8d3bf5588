use serde::Serialize;

/// A degraded-but-valid outcome: processing continued with a fallback.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Diagnostic {
    /// What the fallback applies to, e.g. `CH1-470` or `running`.
    pub scope: String,
    pub message: String,
}

impl Diagnostic {
    /// Create and log at warn level.
    pub fn warn(scope: impl Into<String>, message: impl Into<String>) -> Self {
        let diagnostic = Self {
            scope: scope.into(),
            message: message.into(),
        };
        log::warn!("{}: {}", diagnostic.scope, diagnostic.message);
        diagnostic
    }
}
