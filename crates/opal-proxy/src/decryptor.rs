//! Row decryptor.
//!
//! Runs over every column value of every result row. Two modes:
//!
//! - **whole-cell**: the entire value is either one encrypted cell or
//!   plaintext; a magic-prefix test decides.
//! - **injected-cell**: cells may sit at arbitrary offsets inside a larger
//!   buffer; a memmem scan finds candidates and anything that fails to
//!   parse passes through untouched.
//!
//! Zone mode makes key selection row-local: a zone-id block seen earlier
//! in the same row selects that zone's private key for the next cell.
//! Every candidate cell is additionally tried against the poison keypair;
//! a match latches a flag the pipeline reads after each row.

use std::sync::Arc;

use memchr::memmem;

use opal_core::ClientId;
use opal_crypto::{cell, poison, zone, CellHeader, KeyPair};
use opal_keystore::{FsKeyStore, KeyKind, KeystoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecryptorMode {
    WholeCell,
    InjectedCell,
}

pub struct RowDecryptor {
    mode: DecryptorMode,
    zone_mode: bool,
    keystore: Arc<FsKeyStore>,
    client_id: ClientId,
    poison_key: Option<KeyPair>,
    current_zone: Option<Vec<u8>>,
    poison_detected: bool,
}

impl RowDecryptor {
    pub fn new(
        mode: DecryptorMode,
        zone_mode: bool,
        keystore: Arc<FsKeyStore>,
        client_id: ClientId,
        poison_detect: bool,
    ) -> Result<Self, KeystoreError> {
        let poison_key = if poison_detect {
            Some(load_poison_key(&keystore)?)
        } else {
            None
        };
        Ok(Self {
            mode,
            zone_mode,
            keystore,
            client_id,
            poison_key,
            current_zone: None,
            poison_detected: false,
        })
    }

    /// Zone selection is transient per row.
    pub fn on_row_start(&mut self) {
        self.current_zone = None;
    }

    /// True once since the last call; poison handling runs exactly once
    /// per occurrence.
    pub fn take_poison_detected(&mut self) -> bool {
        std::mem::take(&mut self.poison_detected)
    }

    /// Process one column value. `None` means the value is unchanged.
    pub fn process_value(&mut self, data: &[u8]) -> Option<Vec<u8>> {
        match self.mode {
            DecryptorMode::WholeCell => self.process_whole(data),
            DecryptorMode::InjectedCell => self.process_injected(data),
        }
    }

    fn process_whole(&mut self, data: &[u8]) -> Option<Vec<u8>> {
        if self.zone_mode && data.len() == zone::ZONE_BLOCK_LEN {
            if let Some(id) = zone::parse_block(data) {
                self.current_zone = Some(id.to_vec());
                return None;
            }
        }

        let header = CellHeader::parse(data).ok()?;
        if header.total_len() != data.len() as u64 {
            return None;
        }
        self.try_open(data)
    }

    fn process_injected(&mut self, data: &[u8]) -> Option<Vec<u8>> {
        let cell_finder = memmem::Finder::new(&cell::CELL_MAGIC);
        let zone_finder = memmem::Finder::new(&zone::ZONE_MAGIC);

        let mut out = Vec::with_capacity(data.len());
        let mut changed = false;
        let mut pos = 0usize;

        while pos < data.len() {
            let rest = &data[pos..];
            let next_cell = cell_finder.find(rest).map(|o| pos + o);
            let next_zone = if self.zone_mode {
                zone_finder.find(rest).map(|o| pos + o)
            } else {
                None
            };

            let (at, is_zone) = match (next_cell, next_zone) {
                (None, None) => break,
                (Some(c), None) => (c, false),
                (None, Some(z)) => (z, true),
                (Some(c), Some(z)) => {
                    if z < c {
                        (z, true)
                    } else {
                        (c, false)
                    }
                }
            };

            out.extend_from_slice(&data[pos..at]);
            pos = at;

            if is_zone {
                if let Some(id) = zone::parse_block(&data[at..]) {
                    self.current_zone = Some(id.to_vec());
                    // Zone blocks stay in the row; only the key changes.
                    out.extend_from_slice(&data[at..at + zone::ZONE_BLOCK_LEN]);
                    pos = at + zone::ZONE_BLOCK_LEN;
                } else {
                    out.push(data[at]);
                    pos = at + 1;
                }
                continue;
            }

            match self.try_open(&data[at..]) {
                Some(plaintext) => {
                    let total = CellHeader::parse(&data[at..])
                        .expect("parsed in try_open")
                        .total_len() as usize;
                    out.extend_from_slice(&plaintext);
                    pos = at + total;
                    changed = true;
                }
                None => {
                    out.push(data[at]);
                    pos = at + 1;
                }
            }
        }

        if changed {
            out.extend_from_slice(&data[pos..]);
            Some(out)
        } else {
            None
        }
    }

    fn try_open(&mut self, data: &[u8]) -> Option<Vec<u8>> {
        if CellHeader::parse(data).is_err() {
            return None;
        }

        let opened = match self.resolve_key() {
            Ok(key) => cell::open(key.secret(), data).ok(),
            Err(e) => {
                tracing::debug!(client_id = %self.client_id, error = %e, "no key for cell");
                None
            }
        };

        // Poison is checked after every attempt, success or failure.
        if let Some(poison_key) = &self.poison_key {
            if poison::matches(poison_key.secret(), data) {
                self.poison_detected = true;
            }
        }

        opened
    }

    fn resolve_key(&self) -> Result<KeyPair, KeystoreError> {
        let secret = match (self.zone_mode, &self.current_zone) {
            (true, Some(zone_id)) => self.keystore.get_private_key(KeyKind::Zone, zone_id)?,
            _ => self
                .keystore
                .get_private_key(KeyKind::ClientStorage, self.client_id.as_bytes())?,
        };
        KeyPair::from_secret_bytes(&secret)
            .map_err(|e| KeystoreError::Corrupt(e.to_string()))
    }
}

/// The poison keypair is created on first use so deployments get tripwire
/// coverage without an explicit provisioning step.
fn load_poison_key(keystore: &FsKeyStore) -> Result<KeyPair, KeystoreError> {
    let secret = match keystore.get_private_key(KeyKind::Poison, b"") {
        Ok(secret) => secret,
        Err(KeystoreError::NotFound) => {
            match keystore.generate_key_pair(KeyKind::Poison, b"", false) {
                Ok(()) | Err(KeystoreError::Exists) => {}
                Err(e) => return Err(e),
            }
            keystore.get_private_key(KeyKind::Poison, b"")?
        }
        Err(e) => return Err(e),
    };
    KeyPair::from_secret_bytes(&secret).map_err(|e| KeystoreError::Corrupt(e.to_string()))
}
