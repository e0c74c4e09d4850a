//! Poison records.
//!
//! A poison record is an ordinary encrypted cell sealed to a dedicated
//! keypair that no legitimate client holds. Nothing distinguishes it from
//! real data on the wire; the only way to notice one is to decrypt it,
//! which is exactly what an attacker exfiltrating whole tables will do.

use rand::rngs::OsRng;
use rand::Rng;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::cell;
use crate::error::CryptoError;

const MIN_PAYLOAD: usize = 100;
const MAX_PAYLOAD: usize = 200;

/// Seal a poison record with a random payload of unremarkable size.
pub fn make_record(poison_pub: &PublicKey) -> Result<Vec<u8>, CryptoError> {
    let len = OsRng.gen_range(MIN_PAYLOAD..=MAX_PAYLOAD);
    let mut payload = vec![0u8; len];
    OsRng.fill(&mut payload[..]);
    cell::seal(poison_pub, &payload)
}

/// True when the cell at the start of `data` decrypts under the poison key.
pub fn matches(poison_secret: &StaticSecret, data: &[u8]) -> bool {
    cell::open(poison_secret, data).is_ok()
}
