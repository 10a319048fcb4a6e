use thiserror::Error;

#[derive(Error, Debug)]
pub enum FactbaseError {
    #[error("Schema conflict: {ident} is already declared as {existing}, cannot redeclare as {requested}")]
    SchemaConflict { ident: String, existing: String, requested: String },
    #[error("Undeclared attribute: {0}")]
    UndeclaredAttribute(String),
    #[error("Unknown attribute: {0}")]
    UnknownAttribute(String),
    #[error("Reserved attribute: {0}")]
    ReservedAttribute(String),
    #[error("Type mismatch: {0}")]
    TypeMismatch(String),
    #[error("Cardinality violation: {0}")]
    CardinalityViolation(String),
    #[error("Unresolved reference: {0}")]
    UnresolvedReference(String),
    #[error("Invalid temporary id: {0}")]
    InvalidTempId(String),
    #[error("Unknown variable: {0}")]
    UnknownVariable(String),
    #[error("Invalid query: {0}")]
    InvalidQuery(String),
    #[error("Config error: {0}")]
    Config(String),
    #[error("Persistence error: {0}")]
    Persistence(String),
    #[error("Data corruption: {message}")]
    DataCorruption { message: String },
    #[error("Parse error: {message}")]
    Parse { message: String, line: Option<usize>, col: Option<usize> },
    #[error("Execution error: {0}")]
    Execution(String),
    #[error("Internal invariant violated: {0}")]
    Invariant(String),
    #[error("Lock poisoned: {0}")]
    Lock(String),
}

impl FactbaseError {
    /// Errors caused by the submitted data rather than by the store itself.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::SchemaConflict { .. }
                | Self::UndeclaredAttribute(_)
                | Self::UnknownAttribute(_)
                | Self::ReservedAttribute(_)
                | Self::TypeMismatch(_)
                | Self::CardinalityViolation(_)
                | Self::UnresolvedReference(_)
                | Self::InvalidTempId(_)
                | Self::UnknownVariable(_)
                | Self::InvalidQuery(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, FactbaseError>;

// Helper conversions
impl From<rusqlite::Error> for FactbaseError {
    fn from(e: rusqlite::Error) -> Self { Self::Persistence(e.to_string()) }
}

impl From<config::ConfigError> for FactbaseError {
    fn from(e: config::ConfigError) -> Self { Self::Config(e.to_string()) }
}

impl<T> From<std::sync::PoisonError<T>> for FactbaseError {
    fn from(e: std::sync::PoisonError<T>) -> Self { Self::Lock(e.to_string()) }
}
