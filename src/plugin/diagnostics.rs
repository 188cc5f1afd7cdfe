use super::codec::attribute_path;
use super::tfplugin6::{diagnostic::Severity, Diagnostic};

/// A validation or runtime finding reported back to the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finding {
    pub severity: Severity,
    pub summary: String,
    pub detail: String,
    pub attribute: Option<String>,
}

impl Finding {
    pub fn error(summary: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            summary: summary.into(),
            detail: String::new(),
            attribute: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = detail.into();
        self
    }

    pub fn at(mut self, attribute: &str) -> Self {
        self.attribute = Some(attribute.to_string());
        self
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

impl From<Finding> for Diagnostic {
    fn from(finding: Finding) -> Self {
        Diagnostic {
            severity: finding.severity as i32,
            summary: finding.summary,
            detail: finding.detail,
            attribute: finding.attribute.as_deref().map(attribute_path),
        }
    }
}

/// Turn an error chain into a single error diagnostic.
/// The outermost context is the summary, the causes form the detail.
pub fn from_error(err: &anyhow::Error) -> Diagnostic {
    let detail = err
        .chain()
        .skip(1)
        .map(|cause| cause.to_string())
        .collect::<Vec<_>>()
        .join(": ");
    Finding::error(err.to_string()).with_detail(detail).into()
}

pub fn has_errors(diagnostics: &[Diagnostic]) -> bool {
    diagnostics
        .iter()
        .any(|d| d.severity == Severity::Error as i32)
}
