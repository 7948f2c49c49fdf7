use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BencodeError {
    #[error("unexpected end of input at offset {offset}")]
    UnexpectedEof { offset: usize },

    #[error("invalid integer at offset {offset}: {reason}")]
    InvalidInteger { offset: usize, reason: String },

    #[error("invalid string length at offset {offset}")]
    InvalidStringLength { offset: usize },

    #[error("unexpected character {found:?} at offset {offset}")]
    UnexpectedChar { offset: usize, found: char },

    #[error("dictionary key at offset {offset} is not a byte string")]
    NonStringKey { offset: usize },

    #[error("trailing data after value at offset {offset}")]
    TrailingData { offset: usize },

    #[error("nesting too deep at offset {offset}")]
    NestingTooDeep { offset: usize },
}

impl BencodeError {
    /// Byte offset into the input at which the error was detected.
    pub fn offset(&self) -> usize {
        match self {
            BencodeError::UnexpectedEof { offset }
            | BencodeError::InvalidInteger { offset, .. }
            | BencodeError::InvalidStringLength { offset }
            | BencodeError::UnexpectedChar { offset, .. }
            | BencodeError::NonStringKey { offset }
            | BencodeError::TrailingData { offset }
            | BencodeError::NestingTooDeep { offset } => *offset,
        }
    }
}
