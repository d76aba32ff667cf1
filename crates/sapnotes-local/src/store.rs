use sapnotes_core::{Error, Result, SessionRecord};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// On-disk copy of the last successful session.
///
/// The file is always read and written as one whole record; a missing or unreadable file
/// simply means "no cached session".
#[derive(Debug, Clone)]
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<Option<SessionRecord>> {
        match fs::read(&self.path) {
            Ok(b) => Ok(self.decode(&b)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Store(format!("read {}: {e}", self.path.display()))),
        }
    }

    /// `load` without blocking the runtime thread.
    pub async fn load_async(&self) -> Result<Option<SessionRecord>> {
        match tokio::fs::read(&self.path).await {
            Ok(b) => Ok(self.decode(&b)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Store(format!("read {}: {e}", self.path.display()))),
        }
    }

    fn decode(&self, bytes: &[u8]) -> Option<SessionRecord> {
        match serde_json::from_slice::<SessionRecord>(bytes) {
            Ok(r) if !r.session_material.trim().is_empty() => Some(r),
            Ok(_) => None,
            Err(e) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "ignoring unreadable credential file"
                );
                None
            }
        }
    }

    /// Replace the stored record. Written to a sibling temp file and renamed into place so a
    /// reader never observes a half-written record.
    pub fn save(&self, record: &SessionRecord) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| Error::Store(e.to_string()))?;
            }
        }
        let bytes = serde_json::to_vec_pretty(record).map_err(|e| Error::Store(e.to_string()))?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, &bytes).map_err(|e| Error::Store(e.to_string()))?;
        restrict_permissions(&tmp);
        fs::rename(&tmp, &self.path).map_err(|e| Error::Store(e.to_string()))?;
        Ok(())
    }

    pub fn clear(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Store(e.to_string())),
        }
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    let _ = fs::set_permissions(path, fs::Permissions::from_mode(0o600));
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) {}

#[cfg(test)]
mod tests {
    use super::*;
    use sapnotes_core::Cookie;

    fn record() -> SessionRecord {
        SessionRecord::new(
            vec![
                Cookie::new("JSESSIONID", "abc", ".sap.com"),
                Cookie::new("MYSAPSSO2", "xyz", ".sap.com"),
            ],
            1_700_000_000_000,
            12 * 3600 * 1000,
        )
    }

    #[test]
    fn save_then_load_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(tmp.path().join("nested").join("token-cache.json"));
        let r = record();
        store.save(&r).unwrap();

        let got = store.load().unwrap().expect("record");
        assert_eq!(got.session_material, r.session_material);
        assert_eq!(got.expires_at_ms, r.expires_at_ms);
        assert_eq!(got.cookies, r.cookies);
    }

    #[tokio::test]
    async fn async_load_matches_sync_load() {
        let tmp = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(tmp.path().join("token-cache.json"));
        assert_eq!(store.load_async().await.unwrap(), None);
        store.save(&record()).unwrap();
        assert_eq!(store.load_async().await.unwrap(), store.load().unwrap());
        std::fs::write(store.path(), b"[]").unwrap();
        assert_eq!(store.load_async().await.unwrap(), None);
    }

    #[test]
    fn missing_file_is_not_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(tmp.path().join("absent.json"));
        assert_eq!(store.load().unwrap(), None);
    }

    #[test]
    fn corrupt_file_reads_as_absent() {
        let tmp = tempfile::tempdir().unwrap();
        let p = tmp.path().join("token-cache.json");
        std::fs::write(&p, b"{not json").unwrap();
        let store = CredentialStore::new(p);
        assert_eq!(store.load().unwrap(), None);
    }

    #[test]
    fn reads_file_written_by_other_tools() {
        let tmp = tempfile::tempdir().unwrap();
        let p = tmp.path().join("token-cache.json");
        std::fs::write(
            &p,
            br#"{"access_token":"a=1; b=2","cookies":[],"expiresAt":1999999999999}"#,
        )
        .unwrap();
        let got = CredentialStore::new(p).load().unwrap().unwrap();
        assert_eq!(got.session_material, "a=1; b=2");
        assert!(got.cookies.is_empty());
        assert_eq!(got.expires_at_ms, 1_999_999_999_999);
    }

    #[test]
    fn clear_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(tmp.path().join("token-cache.json"));
        store.save(&record()).unwrap();
        store.clear().unwrap();
        store.clear().unwrap();
        assert_eq!(store.load().unwrap(), None);
    }

    #[cfg(unix)]
    #[test]
    fn credential_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let tmp = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(tmp.path().join("token-cache.json"));
        store.save(&record()).unwrap();
        let mode = std::fs::metadata(store.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
