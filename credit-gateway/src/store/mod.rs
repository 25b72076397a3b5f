use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use ledger_client::domain::{clamp_credit, CreditAccount};
use serde::{Deserialize, Serialize};
use tokio::{fs, io::AsyncWriteExt, sync::Mutex};

/// The one lock serializing every read-modify-write of the cache file.
/// Never hold it across ledger, meter or relay I/O.
pub type SharedCache = Arc<Mutex<LocalCacheStore>>;

#[derive(thiserror::Error, Debug)]
pub enum CacheError {
    #[error("cache file {} is corrupt: {reason}", path.display())]
    Corrupt { path: PathBuf, reason: String },
    #[error("cache io error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("refusing to persist invalid account: {0}")]
    Invalid(String),
    #[error("local state unrecoverable: {0}")]
    Unrecoverable(String),
}

impl CacheError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Unrecoverable(_))
    }
}

/// On-disk layout shared by the cache and backup files. Rooms other than
/// ours are carried through untouched.
#[derive(Debug, Default, Serialize, Deserialize)]
struct CacheDocument {
    #[serde(rename = "Rooms")]
    rooms: BTreeMap<String, serde_json::Value>,
}

/// Durable single-account store backed by a JSON cache file plus a backup
/// copy of the previously committed contents.
///
/// All methods are plain file operations; callers serialize
/// read-modify-write sequences with the scheduler's cache lock.
#[derive(Debug, Clone)]
pub struct LocalCacheStore {
    path: PathBuf,
    backup_path: PathBuf,
    room_id: String,
}

impl LocalCacheStore {
    pub fn new(path: impl Into<PathBuf>, backup_path: impl Into<PathBuf>, room_id: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            backup_path: backup_path.into(),
            room_id: room_id.into(),
        }
    }

    pub fn into_shared(self) -> SharedCache {
        Arc::new(Mutex::new(self))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn backup_path(&self) -> &Path {
        &self.backup_path
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// Reads the account from the primary cache file.
    ///
    /// A missing, unparsable or invalid file is reported as
    /// [`CacheError::Corrupt`].
    pub async fn read(&self) -> Result<CreditAccount, CacheError> {
        let (_, account) = self.read_file(&self.path).await?;
        Ok(account)
    }

    /// Commits `account` to the primary file.
    ///
    /// The current primary contents are first copied to the backup file (only
    /// when they decode cleanly), then the new document is written to a
    /// temporary file and renamed over the primary.
    pub async fn write(&self, account: &CreditAccount) -> Result<(), CacheError> {
        let mut account = account.clone();
        account.current_credit = clamp_credit(account.current_credit);
        account.check().map_err(CacheError::Invalid)?;

        let mut doc = match self.read_file(&self.path).await {
            Ok((doc, _)) => {
                let bytes = encode(&doc)?;
                atomic_write(&self.backup_path, &bytes).await?;
                doc
            }
            Err(e) => {
                tracing::warn!(error = %e, "primary cache unreadable before write, keeping previous backup");
                CacheDocument::default()
            }
        };

        let value = serde_json::to_value(&account).map_err(|e| CacheError::Invalid(e.to_string()))?;
        doc.rooms.insert(self.room_id.clone(), value);
        atomic_write(&self.path, &encode(&doc)?).await
    }

    /// Replaces the primary file with the backup contents.
    ///
    /// Only meant for recovering from [`CacheError::Corrupt`]; any failure
    /// here is [`CacheError::Unrecoverable`].
    pub async fn restore(&self) -> Result<CreditAccount, CacheError> {
        let (doc, account) = self
            .read_file(&self.backup_path)
            .await
            .map_err(|e| CacheError::Unrecoverable(format!("backup unusable: {e}")))?;
        let bytes = encode(&doc).map_err(|e| CacheError::Unrecoverable(e.to_string()))?;
        atomic_write(&self.path, &bytes)
            .await
            .map_err(|e| CacheError::Unrecoverable(format!("failed to reinstate backup: {e}")))?;

        metrics::counter!("cache_restores_total").increment(1);
        tracing::warn!(
            path = %self.path.display(),
            credit = account.current_credit,
            "restored local cache from backup"
        );
        Ok(account)
    }

    /// `read()`, falling back to `restore()` when the primary is corrupt.
    pub async fn load(&self) -> Result<CreditAccount, CacheError> {
        match self.read().await {
            Ok(account) => Ok(account),
            Err(e) => {
                tracing::warn!(error = %e, "local cache unreadable, attempting restore from backup");
                self.restore().await
            }
        }
    }

    async fn read_file(&self, path: &Path) -> Result<(CacheDocument, CreditAccount), CacheError> {
        let corrupt = |reason: String| CacheError::Corrupt {
            path: path.to_path_buf(),
            reason,
        };

        let bytes = fs::read(path).await.map_err(|e| corrupt(e.to_string()))?;
        let doc: CacheDocument = serde_json::from_slice(&bytes).map_err(|e| corrupt(e.to_string()))?;
        let value = doc
            .rooms
            .get(&self.room_id)
            .cloned()
            .ok_or_else(|| corrupt(format!("room {} not present", self.room_id)))?;
        let account: CreditAccount = serde_json::from_value(value).map_err(|e| corrupt(e.to_string()))?;
        account.check().map_err(corrupt)?;
        Ok((doc, account))
    }
}

fn encode(doc: &CacheDocument) -> Result<Vec<u8>, CacheError> {
    serde_json::to_vec_pretty(doc).map_err(|e| CacheError::Invalid(e.to_string()))
}

/// Writes `bytes` next to `path` and renames into place, so readers see
/// either the old or the new contents, never a prefix.
async fn atomic_write(path: &Path, bytes: &[u8]) -> Result<(), CacheError> {
    let io_err = |source: std::io::Error| CacheError::Io {
        path: path.to_path_buf(),
        source,
    };

    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);

    let mut file = fs::File::create(&tmp_path).await.map_err(io_err)?;
    file.write_all(bytes).await.map_err(io_err)?;
    file.sync_all().await.map_err(io_err)?;
    drop(file);

    fs::rename(&tmp_path, path).await.map_err(io_err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledger_client::domain::LogTimestamp;
    use time::macros::datetime;

    fn store(dir: &tempfile::TempDir) -> LocalCacheStore {
        LocalCacheStore::new(
            dir.path().join("account.json"),
            dir.path().join("account_backup.json"),
            "Room-1",
        )
    }

    fn account(credit: f64) -> CreditAccount {
        let mut a = CreditAccount::new(credit, 11.0, 5.0);
        a.power_consumption
            .record(LogTimestamp::new(datetime!(2024-02-01 09:30:00)), 0.0001234);
        a
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir);
        let a = account(42.5);

        s.write(&a).await.unwrap();
        assert_eq!(s.read().await.unwrap(), a);
    }

    #[tokio::test]
    async fn file_uses_rooms_layout() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir);
        s.write(&account(3.0)).await.unwrap();

        let raw: serde_json::Value =
            serde_json::from_slice(&std::fs::read(s.path()).unwrap()).unwrap();
        assert_eq!(raw["Rooms"]["Room-1"]["CurrentCredit"], 3.0);
        assert_eq!(raw["Rooms"]["Room-1"]["PowerConsumption"]["02-01-2024 09:30:00"], 0.0001234);
    }

    #[tokio::test]
    async fn write_backs_up_previous_contents() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir);
        s.write(&account(10.0)).await.unwrap();
        assert!(!s.backup_path().exists());

        s.write(&account(8.0)).await.unwrap();
        let backup = LocalCacheStore::new(s.backup_path(), dir.path().join("unused.json"), "Room-1");
        assert_eq!(backup.read().await.unwrap().current_credit, 10.0);
        assert_eq!(s.read().await.unwrap().current_credit, 8.0);
    }

    #[tokio::test]
    async fn corrupt_primary_restores_backed_up_account() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir);
        let committed = account(10.0);
        s.write(&committed).await.unwrap();
        s.write(&account(9.5)).await.unwrap();

        // Torn write on the primary.
        std::fs::write(s.path(), b"{\"Rooms\": {\"Room-1\": {\"CurrentCre").unwrap();
        assert!(matches!(s.read().await, Err(CacheError::Corrupt { .. })));

        let restored = s.restore().await.unwrap();
        assert_eq!(restored, committed);
        assert_eq!(s.read().await.unwrap(), committed);
    }

    #[tokio::test]
    async fn load_falls_back_to_backup() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir);
        s.write(&account(10.0)).await.unwrap();
        s.write(&account(7.0)).await.unwrap();
        std::fs::write(s.path(), b"not json").unwrap();

        assert_eq!(s.load().await.unwrap().current_credit, 10.0);
    }

    #[tokio::test]
    async fn restore_without_backup_is_unrecoverable() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir);
        std::fs::write(s.path(), b"garbage").unwrap();

        let err = s.load().await.unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn missing_room_is_corrupt_not_default() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir);
        std::fs::write(s.path(), br#"{"Rooms": {"Room-2": {}}}"#).unwrap();
        assert!(matches!(s.read().await, Err(CacheError::Corrupt { .. })));
    }

    #[tokio::test]
    async fn negative_credit_is_clamped_on_write() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir);
        let mut a = account(1.0);
        a.current_credit = -4.0;
        s.write(&a).await.unwrap();
        assert_eq!(s.read().await.unwrap().current_credit, 0.0);
    }

    #[tokio::test]
    async fn other_rooms_are_preserved() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir);
        std::fs::write(
            s.path(),
            br#"{"Rooms": {
                "Room-1": {"CurrentCredit": 1, "ElectricityPrice": 2, "CreditCriticalLevel": 0, "PowerConsumption": {}},
                "Room-2": {"CurrentCredit": 99}
            }}"#,
        )
        .unwrap();

        s.write(&account(5.0)).await.unwrap();
        let raw: serde_json::Value =
            serde_json::from_slice(&std::fs::read(s.path()).unwrap()).unwrap();
        assert_eq!(raw["Rooms"]["Room-2"]["CurrentCredit"], 99);
        assert_eq!(raw["Rooms"]["Room-1"]["CurrentCredit"], 5.0);
    }
}
