//! Crypto error types.

/// Errors from the key exchange.
#[derive(Debug, thiserror::Error)]
pub enum KexError {
    #[error("invalid ephemeral public key length: expected 32, got {0}")]
    InvalidKeyLength(usize),

    #[error("random number generator failure: {0}")]
    Rng(String),

    #[error("signing failed: {0}")]
    Sign(#[from] ssh_key::Error),

    #[error("signature verification failed")]
    BadSignature,
}

/// Errors from handling SSH key material.
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("key data is not valid UTF-8")]
    InvalidEncoding,

    #[error("empty authorized key entry")]
    Empty,

    #[error("invalid public key: {0}")]
    InvalidKey(#[from] ssh_key::Error),
}
