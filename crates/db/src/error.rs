/// Errors surfaced by the executor. Everything else propagates as the
/// underlying `SchemaError` / `ParseError` / `DriverError` inside the anyhow
/// chain.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DbError {
    #[error("insert is missing required columns: {}", .0.join(", "))]
    MissingRequiredColumns(Vec<String>),
    #[error("not authorized: {0}")]
    AuthorizationDenied(String),
    #[error("invalid input: {0}")]
    Validation(String),
}
