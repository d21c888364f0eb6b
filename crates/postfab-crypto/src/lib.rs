//! Cryptographic primitives for the postfab fabric.
//!
//! ## What lives here
//!
//! - **kex**: ephemeral X25519 key exchange plus the signed transcript by
//!   which a client proves it controls the private half of its declared
//!   public key. The shared secret never crosses the wire; both sides
//!   derive it independently and bind it into the transcript.
//! - **keys**: OpenSSH key material — authorized-key line parsing,
//!   `SHA256:` fingerprints, marshalling.

pub mod error;
pub mod kex;
pub mod keys;

pub use error::{KexError, KeyError};
pub use kex::{generate_nonce, EphemeralKeyPair, Transcript, NONCE_LEN};
pub use keys::{fingerprint_sha256, marshal_public_key, parse_authorized_key, ParsedKey};
