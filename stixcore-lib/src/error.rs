#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("Not enough bytes")]
    NotEnoughData { actual: usize, minimum: usize },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// No registered product variant matched and no default is configured.
    #[error("No product type matches: {0}")]
    NoMatch(String),
    /// More than one registered product variant claimed the same attributes.
    #[error("Too many candidate product types identified ({count}): {names:?}")]
    MultipleMatch { count: usize, names: Vec<String> },
    /// Combining products of different variants.
    #[error("Products must be of the same type, not {left} and {right}")]
    TypeMismatch { left: String, right: String },
    #[error("Cannot derive {to} from {from} for {kind}")]
    Transition {
        from: String,
        to: String,
        kind: String,
    },

    #[error("Table schema error: {0}")]
    Schema(String),
    #[error("Referential integrity violated: {0}")]
    Integrity(String),
    #[error("Missing table {0}")]
    MissingTable(String),
    #[error("Invalid header: {0}")]
    Header(String),
    #[error("Packet decode error: {0}")]
    Decode(String),
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error("Time conversion error: {0}")]
    Time(String),
}

pub type Result<T> = std::result::Result<T, Error>;
