//! Filesystem key storage.
//!
//! Layout inside the keystore directory:
//!
//! | kind | private | public |
//! |---|---|---|
//! | client storage | `<id>_storage` | `<id>_storage.pub` |
//! | zone | `<id>_zone` | `<id>_zone.pub` |
//! | server transport | `<id>_server` | `<id>_server.pub` |
//! | connector transport | `<id>` | `<id>.pub` |
//! | poison | `poison_key` | `poison_key.pub` |
//!
//! Private files hold the master-key envelope with the file name as
//! associated data; public files are stored plain. Generation writes to a
//! temporary name in the same directory and renames, so a crash never
//! leaves a half-written key behind.

use std::io::Write;
use std::path::{Path, PathBuf};

use zeroize::Zeroizing;

use opal_crypto::{aead, KeyPair};

use crate::cache::KeyCache;
use crate::error::KeystoreError;
use crate::master_key::MASTER_KEY_LEN;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    /// Per-tenant storage keys that open encrypted cells.
    ClientStorage,
    /// Per-zone keys selected by a zone-id header inside a row.
    Zone,
    /// The server's own secure-session transport keypair.
    TransportServer,
    /// Connector transport keys, looked up by peer identity during the
    /// secure-session handshake.
    TransportConnector,
    /// The poison-record tripwire keypair. The id is ignored.
    Poison,
}

impl KeyKind {
    fn file_name(self, id: &[u8]) -> String {
        let id = String::from_utf8_lossy(id);
        match self {
            KeyKind::ClientStorage => format!("{id}_storage"),
            KeyKind::Zone => format!("{id}_zone"),
            KeyKind::TransportServer => format!("{id}_server"),
            KeyKind::TransportConnector => id.into_owned(),
            KeyKind::Poison => "poison_key".to_string(),
        }
    }
}

pub struct FsKeyStore {
    dir: PathBuf,
    master_key: Zeroizing<[u8; MASTER_KEY_LEN]>,
    cache: KeyCache,
}

impl FsKeyStore {
    /// Open (creating if needed) a keystore rooted at `dir`.
    pub fn new(
        dir: impl Into<PathBuf>,
        master_key: Zeroizing<[u8; MASTER_KEY_LEN]>,
        cache_size: i64,
    ) -> Result<Self, KeystoreError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o700))?;
        }
        Ok(Self {
            dir,
            master_key,
            cache: KeyCache::new(cache_size),
        })
    }

    /// Fetch and decrypt a private key. Cache hits skip the filesystem;
    /// the decrypted buffer wipes itself when dropped.
    pub fn get_private_key(
        &self,
        kind: KeyKind,
        id: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>, KeystoreError> {
        let name = kind.file_name(id);
        let path = self.dir.join(&name);

        let encrypted = self
            .cache
            .get_or_load(&name, || read_key_file(&path))?;

        let decrypted = aead::decrypt(&self.master_key, &encrypted, name.as_bytes())
            .map_err(|_| KeystoreError::Corrupt(name.clone()))?;
        Ok(Zeroizing::new(decrypted.to_vec()))
    }

    /// Fetch a public key. Stored plain; only absence is an error.
    pub fn get_public_key(&self, kind: KeyKind, id: &[u8]) -> Result<Vec<u8>, KeystoreError> {
        let path = self.dir.join(format!("{}.pub", kind.file_name(id)));
        match std::fs::read(&path) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(KeystoreError::NotFound),
            Err(e) => Err(e.into()),
        }
    }

    /// Generate a keypair. Atomic: both halves are written to temporary
    /// names and renamed. Fails with `Exists` unless `overwrite` is set.
    pub fn generate_key_pair(
        &self,
        kind: KeyKind,
        id: &[u8],
        overwrite: bool,
    ) -> Result<(), KeystoreError> {
        let name = kind.file_name(id);
        let pair = KeyPair::generate();

        let secret = Zeroizing::new(pair.secret_bytes().to_vec());
        let envelope = aead::encrypt(&self.master_key, &secret, name.as_bytes())
            .map_err(|e| KeystoreError::Corrupt(e.to_string()))?;

        self.write_atomic(&name, &envelope, overwrite, true)?;
        self.write_atomic(&format!("{name}.pub"), &pair.public_bytes(), overwrite, false)?;
        Ok(())
    }

    /// Forget every cached key; the next lookup re-reads the filesystem.
    pub fn reset_cache(&self) {
        self.cache.clear();
    }

    fn write_atomic(
        &self,
        name: &str,
        contents: &[u8],
        overwrite: bool,
        private: bool,
    ) -> Result<(), KeystoreError> {
        let dest = self.dir.join(name);
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(contents)?;
        tmp.flush()?;
        #[cfg(unix)]
        if private {
            use std::os::unix::fs::PermissionsExt;
            tmp.as_file()
                .set_permissions(std::fs::Permissions::from_mode(0o600))?;
        }
        #[cfg(not(unix))]
        let _ = private;

        if overwrite {
            tmp.persist(&dest).map_err(|e| KeystoreError::Io(e.error))?;
        } else {
            tmp.persist_noclobber(&dest).map_err(|e| {
                if e.error.kind() == std::io::ErrorKind::AlreadyExists {
                    KeystoreError::Exists
                } else {
                    KeystoreError::Io(e.error)
                }
            })?;
        }
        Ok(())
    }
}

fn read_key_file(path: &Path) -> Result<Vec<u8>, KeystoreError> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(bytes),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(KeystoreError::NotFound),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(cache_size: i64) -> (tempfile::TempDir, FsKeyStore) {
        let dir = tempfile::tempdir().unwrap();
        let master = Zeroizing::new([0x42u8; MASTER_KEY_LEN]);
        let store = FsKeyStore::new(dir.path(), master, cache_size).unwrap();
        (dir, store)
    }

    #[test]
    fn generate_and_fetch_roundtrip() {
        let (_dir, store) = store(0);
        store
            .generate_key_pair(KeyKind::ClientStorage, b"client_one", false)
            .unwrap();

        let secret = store
            .get_private_key(KeyKind::ClientStorage, b"client_one")
            .unwrap();
        assert_eq!(secret.len(), 32);

        let public = store
            .get_public_key(KeyKind::ClientStorage, b"client_one")
            .unwrap();
        let restored = KeyPair::from_secret_bytes(&secret).unwrap();
        assert_eq!(restored.public_bytes().to_vec(), public);
    }

    #[test]
    fn missing_key_is_not_found() {
        let (_dir, store) = store(0);
        assert!(matches!(
            store.get_private_key(KeyKind::ClientStorage, b"nobody"),
            Err(KeystoreError::NotFound)
        ));
        assert!(matches!(
            store.get_public_key(KeyKind::Zone, b"nozone"),
            Err(KeystoreError::NotFound)
        ));
    }

    #[test]
    fn garbage_file_is_corrupt_not_missing() {
        let (dir, store) = store(0);
        std::fs::write(dir.path().join("client_one_storage"), b"not an envelope").unwrap();
        assert!(matches!(
            store.get_private_key(KeyKind::ClientStorage, b"client_one"),
            Err(KeystoreError::Corrupt(_))
        ));
    }

    #[test]
    fn wrong_master_key_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let store_a =
            FsKeyStore::new(dir.path(), Zeroizing::new([1u8; MASTER_KEY_LEN]), -1).unwrap();
        store_a
            .generate_key_pair(KeyKind::ClientStorage, b"client_one", false)
            .unwrap();

        let store_b =
            FsKeyStore::new(dir.path(), Zeroizing::new([2u8; MASTER_KEY_LEN]), -1).unwrap();
        assert!(matches!(
            store_b.get_private_key(KeyKind::ClientStorage, b"client_one"),
            Err(KeystoreError::Corrupt(_))
        ));
    }

    #[test]
    fn generate_refuses_overwrite_by_default() {
        let (_dir, store) = store(0);
        store
            .generate_key_pair(KeyKind::Zone, b"zone_one", false)
            .unwrap();
        assert!(matches!(
            store.generate_key_pair(KeyKind::Zone, b"zone_one", false),
            Err(KeystoreError::Exists)
        ));
        store
            .generate_key_pair(KeyKind::Zone, b"zone_one", true)
            .unwrap();
    }

    #[test]
    fn cache_hit_skips_filesystem() {
        let (dir, store) = store(0);
        store
            .generate_key_pair(KeyKind::ClientStorage, b"client_one", false)
            .unwrap();
        let first = store
            .get_private_key(KeyKind::ClientStorage, b"client_one")
            .unwrap();

        // Remove the file; the cached envelope must still serve the key.
        std::fs::remove_file(dir.path().join("client_one_storage")).unwrap();
        let second = store
            .get_private_key(KeyKind::ClientStorage, b"client_one")
            .unwrap();
        assert_eq!(&first[..], &second[..]);
    }

    #[test]
    fn disabled_cache_always_reads_disk() {
        let (dir, store) = store(-1);
        store
            .generate_key_pair(KeyKind::ClientStorage, b"client_one", false)
            .unwrap();
        store
            .get_private_key(KeyKind::ClientStorage, b"client_one")
            .unwrap();

        std::fs::remove_file(dir.path().join("client_one_storage")).unwrap();
        assert!(matches!(
            store.get_private_key(KeyKind::ClientStorage, b"client_one"),
            Err(KeystoreError::NotFound)
        ));
    }

    #[test]
    fn reset_cache_forces_reread() {
        let (dir, store) = store(0);
        store
            .generate_key_pair(KeyKind::ClientStorage, b"client_one", false)
            .unwrap();
        store
            .get_private_key(KeyKind::ClientStorage, b"client_one")
            .unwrap();

        store.reset_cache();
        std::fs::remove_file(dir.path().join("client_one_storage")).unwrap();
        assert!(matches!(
            store.get_private_key(KeyKind::ClientStorage, b"client_one"),
            Err(KeystoreError::NotFound)
        ));
    }

    #[test]
    fn bounded_cache_evicts_oldest_key() {
        let (dir, store) = store(1);
        store
            .generate_key_pair(KeyKind::ClientStorage, b"first", false)
            .unwrap();
        store
            .generate_key_pair(KeyKind::ClientStorage, b"second", false)
            .unwrap();

        store.get_private_key(KeyKind::ClientStorage, b"first").unwrap();
        store.get_private_key(KeyKind::ClientStorage, b"second").unwrap();

        // "first" was evicted by "second"; with its file gone it is lost.
        std::fs::remove_file(dir.path().join("first_storage")).unwrap();
        assert!(store.get_private_key(KeyKind::ClientStorage, b"first").is_err());
        // "second" still lives in the cache.
        std::fs::remove_file(dir.path().join("second_storage")).unwrap();
        assert!(store.get_private_key(KeyKind::ClientStorage, b"second").is_ok());
    }

    #[test]
    fn poison_kind_ignores_id() {
        let (_dir, store) = store(0);
        store.generate_key_pair(KeyKind::Poison, b"", false).unwrap();
        assert!(store.get_private_key(KeyKind::Poison, b"anything").is_ok());
    }

    #[test]
    fn transport_kinds_have_distinct_files() {
        let (_dir, store) = store(0);
        store
            .generate_key_pair(KeyKind::TransportServer, b"acra_server", false)
            .unwrap();
        store
            .generate_key_pair(KeyKind::TransportConnector, b"acra_server", false)
            .unwrap();

        let server = store
            .get_private_key(KeyKind::TransportServer, b"acra_server")
            .unwrap();
        let connector = store
            .get_private_key(KeyKind::TransportConnector, b"acra_server")
            .unwrap();
        assert_ne!(&server[..], &connector[..]);
    }
}
