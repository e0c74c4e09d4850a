//! Secure-session key exchange.
//!
//! A three-message mutually-authenticated handshake between two static
//! X25519 keypairs, one per peer. The transport wrapper frames these
//! messages; this module is the pure state machine.
//!
//! ```text
//! client                                server
//!   │ hello: version, client id, eph_c   │
//!   ├───────────────────────────────────►│
//!   │        response: eph_s, confirm_s  │
//!   │◄───────────────────────────────────┤
//!   │ confirm_c                          │
//!   ├───────────────────────────────────►│
//! ```
//!
//! Key schedule: three X25519 agreements (ephemeral–ephemeral,
//! server-static–client-ephemeral, client-static–server-ephemeral) feed
//! HKDF-SHA256 salted with the transcript hash. Confirmation messages are
//! AEAD seals under a derived confirmation key with the transcript as
//! associated data, so any identity or transcript mismatch fails closed.

use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::aead;
use crate::error::CryptoError;
use crate::kdf;

const VERSION: u8 = 0x01;
const SERVER_OK: &[u8] = b"opal-session-server-ok";
const CLIENT_OK: &[u8] = b"opal-session-client-ok";

/// Directional session keys established by the handshake.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SessionKeys {
    pub client_to_server: [u8; 32],
    pub server_to_client: [u8; 32],
}

impl std::fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionKeys").finish_non_exhaustive()
    }
}

fn transcript(client_id: &[u8], server_id: &[u8], eph_c: &[u8; 32], eph_s: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(b"opal-session-v1");
    hasher.update((client_id.len() as u32).to_be_bytes());
    hasher.update(client_id);
    hasher.update((server_id.len() as u32).to_be_bytes());
    hasher.update(server_id);
    hasher.update(eph_c);
    hasher.update(eph_s);
    hasher.finalize().into()
}

struct Derived {
    keys: SessionKeys,
    confirm_key: Zeroizing<[u8; 32]>,
    transcript: [u8; 32],
}

fn derive(
    dh1: &[u8],
    dh2: &[u8],
    dh3: &[u8],
    transcript: [u8; 32],
) -> Result<Derived, CryptoError> {
    let mut ikm = Zeroizing::new(Vec::with_capacity(96));
    ikm.extend_from_slice(dh1);
    ikm.extend_from_slice(dh2);
    ikm.extend_from_slice(dh3);

    let root = Zeroizing::new(kdf::derive_key(&ikm, &transcript, b"root")?);
    let keys = SessionKeys {
        client_to_server: kdf::derive_key(&root[..], &transcript, b"client-to-server")?,
        server_to_client: kdf::derive_key(&root[..], &transcript, b"server-to-client")?,
    };
    let confirm_key = Zeroizing::new(kdf::derive_key(&root[..], &transcript, b"confirm")?);
    Ok(Derived { keys, confirm_key, transcript })
}

// ── Client side ──────────────────────────────────────────────────────────

/// In-flight client handshake, produced by [`initiate`].
pub struct ClientHandshake {
    client_id: Vec<u8>,
    server_id: Vec<u8>,
    eph: StaticSecret,
}

/// Build the hello message and the state needed to finish the handshake.
pub fn initiate(client_id: &[u8], server_id: &[u8]) -> Result<(Vec<u8>, ClientHandshake), CryptoError> {
    if client_id.is_empty() || client_id.len() > 256 {
        return Err(CryptoError::Handshake("client id length out of range".into()));
    }
    let eph = StaticSecret::random_from_rng(OsRng);
    let eph_pub = PublicKey::from(&eph);

    let mut hello = Vec::with_capacity(3 + client_id.len() + 32);
    hello.push(VERSION);
    hello.extend_from_slice(&(client_id.len() as u16).to_be_bytes());
    hello.extend_from_slice(client_id);
    hello.extend_from_slice(eph_pub.as_bytes());

    let state = ClientHandshake {
        client_id: client_id.to_vec(),
        server_id: server_id.to_vec(),
        eph,
    };
    Ok((hello, state))
}

impl ClientHandshake {
    /// Process the server response; returns the confirmation message and
    /// the established keys. Consumes the handshake either way.
    pub fn finish(
        self,
        client_static: &StaticSecret,
        server_static_pub: &PublicKey,
        response: &[u8],
    ) -> Result<(Vec<u8>, SessionKeys), CryptoError> {
        if response.len() < 32 + aead::OVERHEAD {
            return Err(CryptoError::Handshake("short server response".into()));
        }
        let eph_s_bytes: [u8; 32] = response[..32].try_into().unwrap();
        let eph_s = PublicKey::from(eph_s_bytes);
        let confirm_s = &response[32..];

        let eph_pub_c = PublicKey::from(&self.eph).to_bytes();
        let transcript = transcript(&self.client_id, &self.server_id, &eph_pub_c, &eph_s_bytes);

        let dh1 = self.eph.diffie_hellman(&eph_s);
        let dh2 = self.eph.diffie_hellman(server_static_pub);
        let dh3 = client_static.diffie_hellman(&eph_s);
        let derived = derive(dh1.as_bytes(), dh2.as_bytes(), dh3.as_bytes(), transcript)?;

        let plaintext = aead::decrypt(&derived.confirm_key, confirm_s, &derived.transcript)
            .map_err(|_| CryptoError::Handshake("server confirmation rejected".into()))?;
        if &plaintext[..] != SERVER_OK {
            return Err(CryptoError::Handshake("server confirmation rejected".into()));
        }

        let confirm_c = aead::encrypt(&derived.confirm_key, CLIENT_OK, &derived.transcript)?;
        Ok((confirm_c, derived.keys))
    }
}

// ── Server side ──────────────────────────────────────────────────────────

/// Parsed hello message: `(client id, client ephemeral public key)`.
pub fn parse_hello(hello: &[u8]) -> Result<(Vec<u8>, [u8; 32]), CryptoError> {
    if hello.len() < 3 || hello[0] != VERSION {
        return Err(CryptoError::Handshake("bad hello version".into()));
    }
    let id_len = u16::from_be_bytes([hello[1], hello[2]]) as usize;
    if id_len == 0 || id_len > 256 || hello.len() != 3 + id_len + 32 {
        return Err(CryptoError::Handshake("malformed hello".into()));
    }
    let client_id = hello[3..3 + id_len].to_vec();
    let eph_pub: [u8; 32] = hello[3 + id_len..].try_into().unwrap();
    Ok((client_id, eph_pub))
}

/// In-flight server handshake, produced by [`respond`].
pub struct ServerPending {
    keys: Option<SessionKeys>,
    confirm_key: Zeroizing<[u8; 32]>,
    transcript: [u8; 32],
}

/// Build the response message after the client's identity has been
/// resolved to its static public key.
pub fn respond(
    server_id: &[u8],
    server_static: &StaticSecret,
    client_id: &[u8],
    client_static_pub: &PublicKey,
    client_eph_pub: &[u8; 32],
) -> Result<(Vec<u8>, ServerPending), CryptoError> {
    let eph = StaticSecret::random_from_rng(OsRng);
    let eph_pub_s = PublicKey::from(&eph).to_bytes();
    let eph_c = PublicKey::from(*client_eph_pub);

    let transcript = transcript(client_id, server_id, client_eph_pub, &eph_pub_s);

    let dh1 = eph.diffie_hellman(&eph_c);
    let dh2 = server_static.diffie_hellman(&eph_c);
    let dh3 = eph.diffie_hellman(client_static_pub);
    let derived = derive(dh1.as_bytes(), dh2.as_bytes(), dh3.as_bytes(), transcript)?;

    let confirm_s = aead::encrypt(&derived.confirm_key, SERVER_OK, &derived.transcript)?;

    let mut response = Vec::with_capacity(32 + confirm_s.len());
    response.extend_from_slice(&eph_pub_s);
    response.extend_from_slice(&confirm_s);

    let pending = ServerPending {
        keys: Some(derived.keys),
        confirm_key: derived.confirm_key,
        transcript: derived.transcript,
    };
    Ok((response, pending))
}

impl ServerPending {
    /// Verify the client confirmation and hand out the session keys.
    pub fn finish(mut self, client_confirm: &[u8]) -> Result<SessionKeys, CryptoError> {
        let plaintext = aead::decrypt(&self.confirm_key, client_confirm, &self.transcript)
            .map_err(|_| CryptoError::Handshake("client confirmation rejected".into()))?;
        if &plaintext[..] != CLIENT_OK {
            return Err(CryptoError::Handshake("client confirmation rejected".into()));
        }
        Ok(self.keys.take().expect("keys present until finish"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keypair::KeyPair;

    fn pubkey(pair: &KeyPair) -> PublicKey {
        PublicKey::from(pair.public_bytes())
    }

    #[test]
    fn full_handshake_agrees_on_keys() {
        let client = KeyPair::generate();
        let server = KeyPair::generate();

        let (hello, client_hs) = initiate(b"client_one", b"opal_server").unwrap();
        let (client_id, eph_c) = parse_hello(&hello).unwrap();
        assert_eq!(client_id, b"client_one");

        let (response, pending) =
            respond(b"opal_server", server.secret(), &client_id, &pubkey(&client), &eph_c).unwrap();
        let (confirm, client_keys) = client_hs
            .finish(client.secret(), &pubkey(&server), &response)
            .unwrap();
        let server_keys = pending.finish(&confirm).unwrap();

        assert_eq!(client_keys.client_to_server, server_keys.client_to_server);
        assert_eq!(client_keys.server_to_client, server_keys.server_to_client);
        assert_ne!(client_keys.client_to_server, client_keys.server_to_client);
    }

    #[test]
    fn wrong_server_identity_fails_closed() {
        let client = KeyPair::generate();
        let server = KeyPair::generate();
        let imposter = KeyPair::generate();

        let (hello, client_hs) = initiate(b"client_one", b"opal_server").unwrap();
        let (client_id, eph_c) = parse_hello(&hello).unwrap();

        // Server responds, but the client expected a different static key.
        let (response, _pending) =
            respond(b"opal_server", server.secret(), &client_id, &pubkey(&client), &eph_c).unwrap();
        let err = client_hs
            .finish(client.secret(), &pubkey(&imposter), &response)
            .unwrap_err();
        assert!(matches!(err, CryptoError::Handshake(_)));
    }

    #[test]
    fn wrong_client_identity_fails_closed() {
        let client = KeyPair::generate();
        let server = KeyPair::generate();
        let imposter = KeyPair::generate();

        let (hello, client_hs) = initiate(b"client_one", b"opal_server").unwrap();
        let (client_id, eph_c) = parse_hello(&hello).unwrap();

        // Server resolved the id to a key the connecting peer does not hold.
        let (response, pending) =
            respond(b"opal_server", server.secret(), &client_id, &pubkey(&imposter), &eph_c).unwrap();

        // The client rejects the server confirmation (transcript keys differ);
        // even a forged confirm must not pass server verification.
        assert!(client_hs
            .finish(client.secret(), &pubkey(&server), &response)
            .is_err());
        assert!(pending.finish(b"forged confirmation bytes....").is_err());
    }

    #[test]
    fn malformed_hello_rejected() {
        assert!(parse_hello(&[]).is_err());
        assert!(parse_hello(&[0x02, 1, b'x']).is_err());
        let (mut hello, _) = initiate(b"client_one", b"srv").unwrap();
        hello.pop();
        assert!(parse_hello(&hello).is_err());
    }
}
