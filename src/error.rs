//! Error types for acoplar

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Operation not found in graph: '{name}'")]
    OpNotFound { name: String },

    #[error("Operation '{name}' already exists in graph")]
    DuplicateOp { name: String },

    #[error("Missing operation: expected an op named '{name}'")]
    MissingOperation { name: String },

    #[error("Expected a rank 2 output, found rank {found}")]
    OutputRank { found: usize },

    #[error("No value fed for placeholder '{name}'")]
    MissingFeed { name: String },

    #[error("Variable '{name}' has not been initialized")]
    VariableUninitialized { name: String },

    #[error("Fetched tensor count mismatch: requested {requested}, found {fetched}")]
    FetchCountMismatch { requested: usize, fetched: usize },

    #[error("Cannot marshal tensors bigger than {max} bytes, found {found}")]
    TensorTooLarge { found: u64, max: u64 },

    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch { expected: Vec<u64>, got: Vec<u64> },

    #[error("Data length mismatch: expected {expected} bytes, got {got}")]
    LengthMismatch { expected: usize, got: usize },

    #[error("Unsupported element kind {dtype} for operation '{op}'")]
    UnsupportedDType { op: String, dtype: &'static str },

    #[error("Element kind mismatch for '{op}': expected {expected}, got {got}")]
    DTypeMismatch {
        op: String,
        expected: &'static str,
        got: &'static str,
    },

    #[error("Feature id mapping is not a bijection: {0}")]
    MappingNotBijective(String),

    #[error("Model is closed, the state has gone")]
    ModelClosed,

    #[error("Unknown version {found} for {class_name}, at most version {max} is supported")]
    UnsupportedVersion {
        class_name: String,
        found: u32,
        max: u32,
    },

    #[error("Unknown model class '{class_name}'")]
    UnknownModelClass { class_name: String },

    #[error("Output domain does not match converter: found {output} and {converter}")]
    ConverterMismatch { output: String, converter: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
