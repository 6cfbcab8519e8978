use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("Invalid threshold policy: t={t} n={n}")]
    InvalidPolicy { t: u8, n: u8 },

    #[error("Malformed event: {0}")]
    MalformedEvent(String),

    #[error("Serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),

    #[error("Crypto error: {0}")]
    Crypto(#[from] ll_crypto::CryptoError),
}
