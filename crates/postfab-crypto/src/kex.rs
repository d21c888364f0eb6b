//! curve25519 key exchange with a signed transcript.
//!
//! Both peers generate an ephemeral keypair and exchange public keys, from
//! which each derives the shared secret. The client then signs a transcript
//! binding the session (nonce + both ephemerals) to its claimed identity
//! (long-term public key + shared secret) and the relay verifies that
//! signature against the key declared at connect time.

use rand::rngs::OsRng;
use rand::RngCore;
use ssh_key::{HashAlg, LineEnding, PrivateKey, PublicKey, SshSig};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::Zeroize;

use crate::error::KexError;

/// Domain separation namespace for transcript signatures.
const SIG_NAMESPACE: &str = "postfab";

/// Nonce length in bytes.
pub const NONCE_LEN: usize = 8;

/// An ephemeral X25519 keypair, generated fresh for every handshake.
pub struct EphemeralKeyPair {
    secret: StaticSecret,
    public: X25519Public,
}

impl EphemeralKeyPair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = X25519Public::from(&secret);
        Self { secret, public }
    }

    /// Our public key bytes to send to the peer.
    pub fn public_bytes(&self) -> [u8; 32] {
        *self.public.as_bytes()
    }

    /// Complete the exchange with the peer's ephemeral public key.
    pub fn shared_secret(&self, peer_public: &[u8]) -> Result<[u8; 32], KexError> {
        let arr: [u8; 32] = peer_public
            .try_into()
            .map_err(|_| KexError::InvalidKeyLength(peer_public.len()))?;
        let peer = X25519Public::from(arr);
        Ok(self.secret.diffie_hellman(&peer).to_bytes())
    }
}

/// Generate the handshake nonce from the operating system CSPRNG.
pub fn generate_nonce() -> Result<[u8; NONCE_LEN], KexError> {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng
        .try_fill_bytes(&mut nonce)
        .map_err(|e| KexError::Rng(e.to_string()))?;
    Ok(nonce)
}

/// The byte sequences a handshake signature covers.
///
/// Each side assembles this from the exact bytes it sent and received, never
/// from re-encoded forms, so any in-transit mutation of the exchange breaks
/// verification.
pub struct Transcript {
    pub nonce: Vec<u8>,
    pub server_ephemeral: Vec<u8>,
    pub client_ephemeral: Vec<u8>,
    /// The client's long-term public key exactly as transmitted.
    pub client_key: Vec<u8>,
    pub shared_secret: Vec<u8>,
}

impl Transcript {
    fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(
            self.nonce.len()
                + self.server_ephemeral.len()
                + self.client_ephemeral.len()
                + self.client_key.len()
                + self.shared_secret.len(),
        );
        buf.extend_from_slice(&self.nonce);
        buf.extend_from_slice(&self.server_ephemeral);
        buf.extend_from_slice(&self.client_ephemeral);
        buf.extend_from_slice(&self.client_key);
        buf.extend_from_slice(&self.shared_secret);
        buf
    }

    /// Sign the transcript with the client's long-term private key.
    /// Returns the signature in PEM-armored SSHSIG form.
    pub fn sign(&self, key: &PrivateKey) -> Result<Vec<u8>, KexError> {
        let mut msg = self.to_bytes();
        let sig = key.sign(SIG_NAMESPACE, HashAlg::Sha256, &msg)?;
        msg.zeroize();
        let pem = sig.to_pem(LineEnding::LF)?;
        Ok(pem.into_bytes())
    }

    /// Verify a transcript signature against the client's long-term public
    /// key.
    pub fn verify(&self, key: &PublicKey, signature: &[u8]) -> Result<(), KexError> {
        let pem = std::str::from_utf8(signature).map_err(|_| KexError::BadSignature)?;
        let sig = SshSig::from_pem(pem).map_err(|_| KexError::BadSignature)?;
        let mut msg = self.to_bytes();
        let result = key
            .verify(SIG_NAMESPACE, &msg, &sig)
            .map_err(|_| KexError::BadSignature);
        msg.zeroize();
        result
    }
}

impl Drop for Transcript {
    fn drop(&mut self) {
        self.shared_secret.zeroize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ssh_key::Algorithm;

    fn transcript(shared: &[u8; 32], client_key: &PrivateKey) -> Transcript {
        Transcript {
            nonce: vec![1, 2, 3, 4, 5, 6, 7, 8],
            server_ephemeral: vec![0xaa; 32],
            client_ephemeral: vec![0xbb; 32],
            client_key: client_key.public_key().to_openssh().unwrap().into_bytes(),
            shared_secret: shared.to_vec(),
        }
    }

    #[test]
    fn both_sides_derive_the_same_secret() {
        let server = EphemeralKeyPair::generate();
        let client = EphemeralKeyPair::generate();

        let a = server.shared_secret(&client.public_bytes()).unwrap();
        let b = client.shared_secret(&server.public_bytes()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn shared_secret_rejects_wrong_length() {
        let pair = EphemeralKeyPair::generate();
        assert!(matches!(
            pair.shared_secret(&[0u8; 16]),
            Err(KexError::InvalidKeyLength(16))
        ));
        assert!(matches!(
            pair.shared_secret(&[]),
            Err(KexError::InvalidKeyLength(0))
        ));
    }

    #[test]
    fn ephemeral_keys_are_unique() {
        let a = EphemeralKeyPair::generate();
        let b = EphemeralKeyPair::generate();
        assert_ne!(a.public_bytes(), b.public_bytes());
    }

    #[test]
    fn nonce_is_eight_random_bytes() {
        let a = generate_nonce().unwrap();
        let b = generate_nonce().unwrap();
        assert_eq!(a.len(), NONCE_LEN);
        assert_ne!(a, b);
    }

    #[test]
    fn sign_verify_round_trip() {
        let key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
        let shared = [7u8; 32];
        let t = transcript(&shared, &key);

        let sig = t.sign(&key).unwrap();
        t.verify(key.public_key(), &sig).unwrap();
    }

    #[test]
    fn mutating_any_transcript_field_breaks_verification() {
        let key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
        let shared = [7u8; 32];
        let t = transcript(&shared, &key);
        let sig = t.sign(&key).unwrap();

        let mutations: Vec<Box<dyn Fn(&mut Transcript)>> = vec![
            Box::new(|t| t.nonce[0] ^= 1),
            Box::new(|t| t.server_ephemeral[0] ^= 1),
            Box::new(|t| t.client_ephemeral[0] ^= 1),
            Box::new(|t| t.client_key[0] ^= 1),
            Box::new(|t| t.shared_secret[0] ^= 1),
        ];
        for mutate in mutations {
            let mut tampered = transcript(&shared, &key);
            mutate(&mut tampered);
            assert!(matches!(
                tampered.verify(key.public_key(), &sig),
                Err(KexError::BadSignature)
            ));
        }
    }

    #[test]
    fn wrong_key_fails_verification() {
        let key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
        let other = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
        let t = transcript(&[7u8; 32], &key);
        let sig = t.sign(&key).unwrap();
        assert!(t.verify(other.public_key(), &sig).is_err());
    }

    #[test]
    fn garbage_signature_is_rejected() {
        let key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
        let t = transcript(&[7u8; 32], &key);
        assert!(matches!(
            t.verify(key.public_key(), b"not a signature"),
            Err(KexError::BadSignature)
        ));
    }
}
