//! Client-side key exchange state.

use std::sync::Mutex;

use postfab_crypto::kex::{EphemeralKeyPair, Transcript};
use postfab_mux::RpcError;
use ssh_key::PrivateKey;

struct Exchanged {
    server_ephemeral: Vec<u8>,
    pair: EphemeralKeyPair,
}

/// Holds the ephemeral exchange between `ExchangeKeys` and `Sign`.
#[derive(Default)]
pub(crate) struct KeyExchangeState {
    exchanged: Mutex<Option<Exchanged>>,
}

impl KeyExchangeState {
    /// Record the server's ephemeral key and generate ours. Returns our
    /// ephemeral public key bytes to send back.
    pub fn complete(&self, server_ephemeral: Vec<u8>) -> Result<Vec<u8>, RpcError> {
        let mut exchanged = self.exchanged.lock().expect("kex state poisoned");
        if exchanged.is_some() {
            return Err(RpcError::failed_precondition(
                "keys have already been exchanged",
            ));
        }
        if server_ephemeral.len() != 32 {
            return Err(RpcError::invalid_argument(
                "invalid server ephemeral public key",
            ));
        }
        let pair = EphemeralKeyPair::generate();
        let public = pair.public_bytes().to_vec();
        *exchanged = Some(Exchanged {
            server_ephemeral,
            pair,
        });
        Ok(public)
    }

    /// Sign the handshake transcript over the relay's nonce with the
    /// client's long-term key.
    pub fn sign(
        &self,
        key: &PrivateKey,
        client_key_wire: &[u8],
        nonce: Vec<u8>,
    ) -> Result<Vec<u8>, RpcError> {
        let exchanged = self.exchanged.lock().expect("kex state poisoned");
        let Some(exchanged) = exchanged.as_ref() else {
            return Err(RpcError::failed_precondition(
                "keys have not been exchanged",
            ));
        };

        let shared = exchanged
            .pair
            .shared_secret(&exchanged.server_ephemeral)
            .map_err(|e| RpcError::internal(e.to_string()))?;

        let transcript = Transcript {
            nonce,
            server_ephemeral: exchanged.server_ephemeral.clone(),
            client_ephemeral: exchanged.pair.public_bytes().to_vec(),
            client_key: client_key_wire.to_vec(),
            shared_secret: shared.to_vec(),
        };
        transcript
            .sign(key)
            .map_err(|e| RpcError::internal(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;
    use ssh_key::Algorithm;

    #[test]
    fn sign_before_exchange_is_rejected() {
        let key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
        let state = KeyExchangeState::default();
        let err = state.sign(&key, b"key", vec![0; 8]).unwrap_err();
        assert_eq!(
            err.code(),
            postfab_proto::v1::ErrorCode::FailedPrecondition
        );
    }

    #[test]
    fn second_exchange_is_rejected() {
        let state = KeyExchangeState::default();
        let server = EphemeralKeyPair::generate();
        state.complete(server.public_bytes().to_vec()).unwrap();
        let err = state
            .complete(server.public_bytes().to_vec())
            .unwrap_err();
        assert_eq!(
            err.code(),
            postfab_proto::v1::ErrorCode::FailedPrecondition
        );
    }

    #[test]
    fn exchange_then_sign_verifies_against_relay_view() {
        use postfab_crypto::kex::{generate_nonce, Transcript};

        let key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
        let wire = key.public_key().to_openssh().unwrap().into_bytes();

        // Relay side
        let server_pair = EphemeralKeyPair::generate();
        let server_public = server_pair.public_bytes().to_vec();

        // Client side
        let state = KeyExchangeState::default();
        let client_public = state.complete(server_public.clone()).unwrap();
        let nonce = generate_nonce().unwrap().to_vec();
        let signature = state.sign(&key, &wire, nonce.clone()).unwrap();

        // Relay verifies with its independently derived secret.
        let shared = server_pair.shared_secret(&client_public).unwrap();
        let transcript = Transcript {
            nonce,
            server_ephemeral: server_public,
            client_ephemeral: client_public,
            client_key: wire,
            shared_secret: shared.to_vec(),
        };
        transcript.verify(key.public_key(), &signature).unwrap();
    }

    #[test]
    fn rejects_short_server_key() {
        let state = KeyExchangeState::default();
        let err = state.complete(vec![0; 16]).unwrap_err();
        assert_eq!(
            err.code(),
            postfab_proto::v1::ErrorCode::InvalidArgument
        );
    }
}
