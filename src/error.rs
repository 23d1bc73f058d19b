use crate::chunk::ChunkError;
use std::fmt;

/// Result alias for string-pool and pull-parser operations.
pub type XmlResult<T> = Result<T, XmlError>;

/// Errors surfaced by the managed resource layer.
#[derive(Debug)]
pub enum XmlError {
    /// Pull-parser protocol violation, qualified with a position
    /// description of the form `Binary XML file line #N`.
    Parser { message: String, position: String },
    /// An attribute or string index outside the valid range.
    IndexOutOfRange(usize),
    /// A pull-parser operation this implementation rejects by contract.
    Unsupported(&'static str),
    /// The owning pool was already closed.
    PoolClosed,
    /// Corruption reported by the chunk decoder.
    Chunk(ChunkError),
}

impl XmlError {
    pub(crate) fn parser(message: impl Into<String>, line: i32) -> Self {
        XmlError::Parser {
            message: message.into(),
            position: position_description(line),
        }
    }
}

/// Formats a source position the way the resource runtime reports it.
/// Column numbers are not tracked and always read as `-1` elsewhere.
pub fn position_description(line: i32) -> String {
    format!("Binary XML file line #{line}")
}

impl fmt::Display for XmlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            XmlError::Parser { message, position } => write!(f, "{position}: {message}"),
            XmlError::IndexOutOfRange(index) => write!(f, "index {index} out of range"),
            XmlError::Unsupported(op) => write!(f, "operation '{op}' is not supported"),
            XmlError::PoolClosed => write!(f, "string pool is closed"),
            XmlError::Chunk(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for XmlError {}

impl From<ChunkError> for XmlError {
    fn from(value: ChunkError) -> Self {
        XmlError::Chunk(value)
    }
}
