//! File-backed store.
//!
//! State lives in two files inside the data directory:
//!
//! - `cacheout-state.json`: a snapshot of every table, tagged with the
//!   sequence number of the last batch it contains
//! - `cacheout-log.jsonl`: one line per batch applied since that snapshot
//!
//! [`Store::apply`] appends a single line and syncs it, so the cost of a write
//! is proportional to the batch rather than to the whole state. Every
//! `compact_every` batches the tables are written to a temporary snapshot,
//! synced, renamed over the previous one and the log is truncated. Log records
//! at or below the snapshot's sequence number are skipped on replay, so a
//! crash between rename and truncate loses nothing.
//!
//! [`Store::load`] always re-reads both files. A torn last line (a crash in
//! the middle of an append) is discarded; a damaged line anywhere else is an
//! error.
//!
//! File I/O runs on the blocking pool and owns the store lock for the whole
//! operation. A caller that stops waiting (e.g. a storage timeout) does not
//! cancel the write, so the in-process tables never drift from the files.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{Snapshot, Store, WriteBatch};
use crate::error::{CoordinatorError, Result};

const SNAPSHOT_FILE: &str = "cacheout-state.json";
const LOG_FILE: &str = "cacheout-log.jsonl";
const DEFAULT_COMPACT_EVERY: usize = 1_000;

fn poison_err<T>(_: PoisonError<T>) -> CoordinatorError {
    CoordinatorError::storage("file store lock poisoned")
}

fn join_err(e: tokio::task::JoinError) -> CoordinatorError {
    CoordinatorError::storage(format!("file store task failed: {e}"))
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SnapshotDocument {
    seq: u64,
    tables: Snapshot,
}

/// One log line. Written from a borrowed batch, read back into an owned one.
#[derive(Debug, Serialize, Deserialize)]
struct LogRecord<B> {
    seq: u64,
    batch: B,
}

/// What is on disk right now.
struct DiskState {
    tables: Snapshot,
    seq: u64,
    replayed: usize,
    /// Length of the log prefix made of complete records.
    valid_log_len: u64,
}

#[derive(Debug)]
struct Inner {
    snapshot_path: PathBuf,
    log_path: PathBuf,
    log: File,
    tables: Snapshot,
    seq: u64,
    /// Records appended since the last compaction.
    appended: usize,
    compact_every: usize,
}

impl Inner {
    fn open(dir: &Path, compact_every: usize) -> Result<Self> {
        let snapshot_path = dir.join(SNAPSHOT_FILE);
        let log_path = dir.join(LOG_FILE);
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)?;

        let mut inner = Self {
            snapshot_path,
            log_path,
            log,
            tables: Snapshot::default(),
            seq: 0,
            appended: 0,
            compact_every,
        };
        inner.reload()?;
        Ok(inner)
    }

    fn read_disk(&self) -> Result<DiskState> {
        let document: SnapshotDocument = match std::fs::read(&self.snapshot_path) {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => SnapshotDocument::default(),
            Err(e) => return Err(e.into()),
        };
        let log = std::fs::read_to_string(&self.log_path)?;

        let mut disk = DiskState {
            tables: document.tables,
            seq: document.seq,
            replayed: 0,
            valid_log_len: 0,
        };
        let mut offset = 0u64;
        let mut lines = log.split_inclusive('\n').peekable();
        while let Some(line) = lines.next() {
            let is_last = lines.peek().is_none();
            offset += line.len() as u64;
            if line.trim().is_empty() {
                disk.valid_log_len = offset;
                continue;
            }

            // Only the last line can lack its newline.
            let complete = line.ends_with('\n');
            let record: LogRecord<WriteBatch> = match serde_json::from_str(line) {
                Ok(record) if complete => record,
                Err(e) if !is_last => {
                    return Err(CoordinatorError::storage(format!(
                        "corrupt log record after byte {}: {e}",
                        disk.valid_log_len
                    )))
                }
                _ => {
                    tracing::warn!(
                        path = %self.log_path.display(),
                        bytes = line.len(),
                        "Discarding torn record at the end of the log"
                    );
                    break;
                }
            };
            disk.valid_log_len = offset;
            if record.seq <= disk.seq {
                continue;
            }
            disk.tables.apply(&record.batch);
            disk.seq = record.seq;
            disk.replayed += 1;
        }
        Ok(disk)
    }

    /// Replace the in-process tables with what is on disk.
    fn reload(&mut self) -> Result<Snapshot> {
        let disk = self.read_disk()?;
        if self.log.metadata()?.len() > disk.valid_log_len {
            self.log.set_len(disk.valid_log_len)?;
            self.log.sync_all()?;
        }
        self.tables = disk.tables;
        self.seq = disk.seq;
        self.appended = disk.replayed;
        tracing::debug!(seq = self.seq, replayed = disk.replayed, "File store loaded");

        if self.appended >= self.compact_every {
            self.compact()?;
        }
        Ok(self.tables.clone())
    }

    fn append(&mut self, batch: &WriteBatch) -> Result<()> {
        let seq = self.seq + 1;
        let mut line = serde_json::to_vec(&LogRecord { seq, batch })?;
        line.push(b'\n');

        let len_before = self.log.metadata()?.len();
        if let Err(e) = self.log.write_all(&line).and_then(|()| self.log.sync_data()) {
            // Leave no partial record behind for the next append to follow.
            if let Err(truncate) = self.log.set_len(len_before) {
                tracing::error!(error = %truncate, "Failed to drop partial log record");
            }
            return Err(e.into());
        }

        self.tables.apply(batch);
        self.seq = seq;
        self.appended += 1;

        if self.appended >= self.compact_every {
            // The batch is already durable in the log; a failed compaction
            // is retried after the next append.
            if let Err(e) = self.compact() {
                tracing::warn!(error = %e, "Log compaction failed");
            }
        }
        Ok(())
    }

    fn compact(&mut self) -> Result<()> {
        let document = SnapshotDocument {
            seq: self.seq,
            tables: self.tables.clone(),
        };
        let bytes = serde_json::to_vec(&document)?;
        let tmp = self.snapshot_path.with_extension("json.tmp");

        let mut file = File::create(&tmp)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        drop(file);
        std::fs::rename(&tmp, &self.snapshot_path)?;

        self.log.set_len(0)?;
        self.log.sync_all()?;
        tracing::info!(
            seq = self.seq,
            records = self.appended,
            "Compacted store log into snapshot"
        );
        self.appended = 0;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
    inner: Arc<Mutex<Inner>>,
}

impl FileStore {
    /// Open (or create) the store inside `dir`.
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_compaction(dir, DEFAULT_COMPACT_EVERY).await
    }

    /// Open the store, folding the log into a new snapshot every
    /// `compact_every` batches.
    pub async fn open_with_compaction(
        dir: impl AsRef<Path>,
        compact_every: usize,
    ) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;

        let open_dir = dir.clone();
        let inner =
            tokio::task::spawn_blocking(move || Inner::open(&open_dir, compact_every.max(1)))
                .await
                .map_err(join_err)??;

        tracing::info!(path = %dir.display(), seq = inner.seq, "Opened file store");
        Ok(Self {
            dir,
            inner: Arc::new(Mutex::new(inner)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }
}

#[async_trait]
impl Store for FileStore {
    async fn load(&self) -> Result<Snapshot> {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || inner.lock().map_err(poison_err)?.reload())
            .await
            .map_err(join_err)?
    }

    async fn apply(&self, batch: &WriteBatch) -> Result<()> {
        let inner = self.inner.clone();
        let batch = batch.clone();
        tokio::task::spawn_blocking(move || inner.lock().map_err(poison_err)?.append(&batch))
            .await
            .map_err(join_err)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{Account, Credits};
    use chrono::Utc;

    fn account_batch(id: &str, micros: u64) -> WriteBatch {
        let mut batch = WriteBatch::new();
        batch.put_account(Account::new(id, Credits::from_micros(micros), Utc::now()));
        batch
    }

    fn log_lines(dir: &Path) -> usize {
        std::fs::read_to_string(dir.join(LOG_FILE))
            .unwrap()
            .lines()
            .count()
    }

    #[tokio::test]
    async fn state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();

        {
            let store = FileStore::open(dir.path()).await.unwrap();
            store.apply(&account_batch("alice", 42_000_000)).await.unwrap();
            store.apply(&account_batch("bob", 7)).await.unwrap();
        }

        let reopened = FileStore::open(dir.path()).await.unwrap();
        let snapshot = reopened.load().await.unwrap();
        assert_eq!(
            snapshot.accounts.get("alice").map(|a| a.balance),
            Some(Credits::from_micros(42_000_000))
        );
        assert_eq!(snapshot.accounts.len(), 2);
    }

    #[tokio::test]
    async fn empty_directory_loads_empty_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path().join("nested")).await.unwrap();
        assert_eq!(store.load().await.unwrap(), Snapshot::default());
    }

    #[tokio::test]
    async fn load_reads_the_files_not_a_cached_copy() {
        let dir = tempfile::tempdir().unwrap();
        let reader = FileStore::open(dir.path()).await.unwrap();
        assert!(reader.load().await.unwrap().accounts.is_empty());

        let writer = FileStore::open(dir.path()).await.unwrap();
        writer.apply(&account_batch("alice", 1)).await.unwrap();

        let snapshot = reader.load().await.unwrap();
        assert!(snapshot.accounts.contains_key("alice"));
    }

    #[tokio::test]
    async fn writes_append_to_log_until_compaction() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open_with_compaction(dir.path(), 3).await.unwrap();

        store.apply(&account_batch("a", 1)).await.unwrap();
        store.apply(&account_batch("b", 1)).await.unwrap();
        assert_eq!(log_lines(dir.path()), 2);
        assert!(!dir.path().join(SNAPSHOT_FILE).exists());

        store.apply(&account_batch("c", 1)).await.unwrap();
        assert_eq!(log_lines(dir.path()), 0);
        assert!(dir.path().join(SNAPSHOT_FILE).exists());

        store.apply(&account_batch("d", 1)).await.unwrap();
        assert_eq!(log_lines(dir.path()), 1);

        let reopened = FileStore::open(dir.path()).await.unwrap();
        let accounts = reopened.load().await.unwrap().accounts;
        assert_eq!(
            accounts.keys().cloned().collect::<Vec<_>>(),
            vec!["a", "b", "c", "d"]
        );
    }

    #[tokio::test]
    async fn torn_last_record_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FileStore::open(dir.path()).await.unwrap();
            store.apply(&account_batch("a", 1)).await.unwrap();
            store.apply(&account_batch("b", 1)).await.unwrap();
        }
        let mut log = OpenOptions::new()
            .append(true)
            .open(dir.path().join(LOG_FILE))
            .unwrap();
        log.write_all(br#"{"seq":3,"batch":{"acco"#).unwrap();
        drop(log);

        let store = FileStore::open(dir.path()).await.unwrap();
        assert_eq!(store.load().await.unwrap().accounts.len(), 2);

        // The next record lands on a clean line.
        store.apply(&account_batch("c", 1)).await.unwrap();
        let reopened = FileStore::open(dir.path()).await.unwrap();
        assert_eq!(reopened.load().await.unwrap().accounts.len(), 3);
    }

    #[tokio::test]
    async fn corrupt_record_before_the_end_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FileStore::open(dir.path()).await.unwrap();
            store.apply(&account_batch("a", 1)).await.unwrap();
        }
        let log_path = dir.path().join(LOG_FILE);
        let valid = std::fs::read_to_string(&log_path).unwrap();
        std::fs::write(&log_path, format!("not json\n{valid}")).unwrap();

        assert!(matches!(
            FileStore::open(dir.path()).await,
            Err(CoordinatorError::Storage(_))
        ));
    }
}
