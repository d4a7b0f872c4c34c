use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid key length: expected 16 bytes, got {0}")]
    InvalidKeyLength(usize),

    #[error("invalid payload length: expected {expected} bits, got {got}")]
    InvalidPayloadLength { expected: usize, got: usize },

    #[error("invalid parameters: {0}")]
    InvalidParams(String),
}

pub type Result<T> = std::result::Result<T, Error>;
