use thiserror::Error;

/// Result type for runtime operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the load / materialize / execute pipeline.
///
/// Every fallible step returns one of these; the first failure propagates
/// verbatim to the caller. Recoverable errors never panic.
#[derive(Debug, Error)]
pub enum Error {
    #[error("storage accessor construction failed: {0}")]
    AccessorConstruction(String),

    #[error("program parse failed: {0}")]
    ProgramParse(String),

    #[error("unknown method: {0}")]
    MethodNotFound(String),

    #[error("invalid method metadata: {0}")]
    Metadata(String),

    #[error("memory allocation failed: {0}")]
    MemoryAllocation(String),

    #[error("method materialization failed: {0}")]
    MethodMaterialization(String),

    #[error("input binding failed: {0}")]
    InputBinding(String),

    #[error("execution failed: {0}")]
    Execution(String),

    #[error("output retrieval failed: {0}")]
    OutputRetrieval(String),
}
