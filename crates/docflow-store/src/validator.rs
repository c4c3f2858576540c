//! Pluggable per-document validation.

use docflow_types::Document;

/// Validates documents on their way into a store.
///
/// Implementations must be `Send + Sync` for use behind `Arc<dyn Validator>`.
pub trait Validator: Send + Sync {
    /// Reasons the document is invalid; empty means valid.
    fn validation_errors(&self, doc: &Document) -> Vec<String>;

    /// Whether the document passes validation.
    fn is_valid(&self, doc: &Document) -> bool {
        self.validation_errors(doc).is_empty()
    }
}

/// Rejects documents missing any of a fixed set of fields.
pub struct RequiredFieldsValidator {
    required: Vec<String>,
}

impl RequiredFieldsValidator {
    #[must_use]
    pub fn new(required: Vec<String>) -> Self {
        Self { required }
    }
}

impl Validator for RequiredFieldsValidator {
    fn validation_errors(&self, doc: &Document) -> Vec<String> {
        self.required
            .iter()
            .filter(|f| !doc.contains(f))
            .map(|f| format!("missing required field '{f}'"))
            .collect()
    }
}
