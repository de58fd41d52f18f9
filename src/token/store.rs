use std::path::{Path, PathBuf};

use aws_lc_rs::{
    aead::{AES_256_GCM, Aad, LessSafeKey, NONCE_LEN, Nonce, UnboundKey},
    digest::{SHA256, digest},
    rand::{SecureRandom, SystemRandom},
};
use base64ct::{Base64UrlUnpadded, Encoding};
use thiserror::Error;
use tracing::{debug, trace};

use super::bundle::TokenBundle;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to write token store: {0}")]
    Write(std::io::Error),
    #[error("failed to rename token store into place: {0}")]
    Rename(std::io::Error),
}

/// Encrypted at-rest persistence for the Token Bundle.
///
/// The symmetric key is derived deterministically from `client_id` (§4.1):
/// the substring after the last `-`, SHA-256 hashed, URL-safe base64 encoded.
/// That text is the canonical key representation; decoding it back to bytes
/// gives the 32-byte key fed to AES-256-GCM.
pub struct TokenStore {
    path: PathBuf,
    key: LessSafeKey,
}

impl TokenStore {
    pub fn new(path: impl Into<PathBuf>, client_id: &str) -> Self {
        let key_material = Self::derive_key_material(client_id);
        let key_bytes = Base64UrlUnpadded::decode_vec(&key_material)
            .expect("derived key material is valid base64");
        let unbound = UnboundKey::new(&AES_256_GCM, &key_bytes).expect("key is 32 bytes");

        Self {
            path: path.into(),
            key: LessSafeKey::new(unbound),
        }
    }

    fn derive_key_material(client_id: &str) -> String {
        let suffix = client_id.rsplit('-').next().unwrap_or(client_id);
        let hash = digest(&SHA256, suffix.as_bytes());
        Base64UrlUnpadded::encode_string(hash.as_ref())
    }

    /// Loads the bundle; any decryption, decoding, or parse failure is
    /// treated as "no bundle present" rather than propagated, per §4.1.
    pub fn load(&self) -> Option<TokenBundle> {
        let raw = std::fs::read(&self.path).ok()?;
        if raw.len() < NONCE_LEN {
            trace!("token store file too short to contain a nonce");
            return None;
        }

        let (nonce_bytes, ciphertext) = raw.split_at(NONCE_LEN);
        let nonce = Nonce::try_assume_unique_for_key(nonce_bytes).ok()?;
        let mut buffer = ciphertext.to_vec();

        let plaintext = self
            .key
            .open_in_place(nonce, Aad::empty(), &mut buffer)
            .ok()?;

        serde_json::from_slice(plaintext).ok()
    }

    /// Saves the bundle atomically: the new contents are written to a
    /// temporary file in the same directory and renamed into place, so a
    /// concurrent `load` never observes a partial write.
    pub fn save(&self, bundle: &TokenBundle) -> bool {
        match self.try_save(bundle) {
            Ok(()) => true,
            Err(err) => {
                debug!("failed to save token store: {err}");
                false
            }
        }
    }

    fn try_save(&self, bundle: &TokenBundle) -> Result<(), StoreError> {
        let plaintext = serde_json::to_vec(bundle).map_err(|e| {
            StoreError::Write(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        })?;

        let rng = SystemRandom::new();
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rng.fill(&mut nonce_bytes)
            .map_err(|_| StoreError::Write(std::io::Error::other("failed to generate nonce")))?;
        let nonce = Nonce::try_assume_unique_for_key(&nonce_bytes)
            .map_err(|_| StoreError::Write(std::io::Error::other("invalid nonce")))?;

        let mut in_out = plaintext;
        self.key
            .seal_in_place_append_tag(nonce, Aad::empty(), &mut in_out)
            .map_err(|_| StoreError::Write(std::io::Error::other("encryption failed")))?;

        let mut out = Vec::with_capacity(NONCE_LEN + in_out.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&in_out);

        let tmp_path = Self::tmp_path(&self.path);
        std::fs::write(&tmp_path, &out).map_err(StoreError::Write)?;
        std::fs::rename(&tmp_path, &self.path).map_err(StoreError::Rename)?;

        Ok(())
    }

    fn tmp_path(path: &Path) -> PathBuf {
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        PathBuf::from(tmp)
    }
}

#[cfg(test)]
mod test {
    use std::collections::BTreeSet;

    use chrono::Utc;

    use super::*;

    fn sample_bundle() -> TokenBundle {
        TokenBundle {
            access_token: "access".into(),
            refresh_token: "refresh".into(),
            expires_in: 3600,
            last_refresh: Utc::now(),
            scopes: BTreeSet::from(["Mail.Send".to_string()]),
            extra: Default::default(),
        }
    }

    #[test]
    fn round_trips_through_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token.bin");
        let store = TokenStore::new(&path, "00000000-0000-0000-0000-abcdef123456");

        let bundle = sample_bundle();
        assert!(store.save(&bundle));

        let loaded = store.load().expect("bundle should load back");
        assert_eq!(loaded.access_token, bundle.access_token);
        assert_eq!(loaded.refresh_token, bundle.refresh_token);
    }

    #[test]
    fn load_is_absent_when_file_missing() {
        let dir = tempfile::tempdir().unwrap();
        let store = TokenStore::new(dir.path().join("missing.bin"), "client-id");
        assert!(store.load().is_none());
    }

    #[test]
    fn load_is_absent_on_tamper() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token.bin");
        let store = TokenStore::new(&path, "client-id");
        store.save(&sample_bundle());

        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        std::fs::write(&path, bytes).unwrap();

        assert!(store.load().is_none());
    }

    #[test]
    fn different_client_id_cannot_decrypt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token.bin");
        let store = TokenStore::new(&path, "client-one");
        store.save(&sample_bundle());

        let other = TokenStore::new(&path, "client-two");
        assert!(other.load().is_none());
    }
}
