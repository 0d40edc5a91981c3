use thiserror::Error;

/// Single error surface for the whole pipeline.
///
/// Query-service failures are wrapped into the same fatal surface as
/// template syntax errors so callers handle one kind. A branch element
/// that cannot be grounded is not an error at all, it is a Skip decision
/// inside the binder.
#[derive(Debug, Error)]
pub enum TemplateError {
    /// Malformed template, variable name, or event-stream structure.
    #[error("template syntax error: {0}")]
    Syntax(String),
    /// The backing query service failed.
    #[error("query evaluation failed: {0}")]
    Evaluation(String),
    /// Malformed XML in the template source.
    #[error("malformed XML in template: {0}")]
    Xml(#[from] quick_xml::Error),
}

impl TemplateError {
    pub(crate) fn syntax(msg: impl Into<String>) -> Self {
        Self::Syntax(msg.into())
    }

    pub(crate) fn evaluation(err: impl std::fmt::Display) -> Self {
        Self::Evaluation(err.to_string())
    }
}
