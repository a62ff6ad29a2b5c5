//! JsonFile — append-only JSON-lines store with tail and follow support.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio_stream::Stream;
use parking_lot::Mutex;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, warn};

use super::{ReadConfig, StoreError, StoredEntry};

const FOLLOW_CAPACITY: usize = 1024;

impl StoredEntry {
    pub fn new(log: &[u8], stream: &str, timestamp_nanos: i64) -> Self {
        Self {
            log: String::from_utf8_lossy(log).into_owned(),
            stream: stream.to_string(),
            time: DateTime::<Utc>::from_timestamp_nanos(timestamp_nanos),
        }
    }
}

struct Writer {
    file: Option<File>,
    /// Number of complete lines in the file; the index of the next write.
    lines: u64,
    followers: Option<broadcast::Sender<(u64, StoredEntry)>>,
}

pub struct LocalStore {
    path: PathBuf,
    writer: Mutex<Writer>,
}

impl LocalStore {
    /// Open (or create) the store file, appending after existing content.
    pub fn open(path: impl Into<PathBuf>) -> Result<Arc<Self>, StoreError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let lines = match std::fs::read(&path) {
            Ok(content) => content.iter().filter(|b| **b == b'\n').count() as u64,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let (followers, _) = broadcast::channel(FOLLOW_CAPACITY);
        debug!(path = %path.display(), lines, "Opened local log store");

        Ok(Arc::new(Self {
            path,
            writer: Mutex::new(Writer {
                file: Some(file),
                lines,
                followers: Some(followers),
            }),
        }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write(&self, entry: &StoredEntry) -> Result<(), StoreError> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');

        let mut writer = self.writer.lock();
        let file = writer.file.as_mut().ok_or(StoreError::Closed)?;
        file.write_all(&line)?;
        let seq = writer.lines;
        writer.lines += 1;
        if let Some(followers) = &writer.followers {
            // No receivers is fine.
            let _ = followers.send((seq, entry.clone()));
        }
        Ok(())
    }

    /// Stop accepting writes and end every follower. Idempotent.
    pub fn close(&self) {
        let mut writer = self.writer.lock();
        if let Some(mut file) = writer.file.take() {
            if let Err(e) = file.flush() {
                warn!(path = %self.path.display(), error = %e, "Failed to flush log store");
            }
        }
        writer.followers = None;
    }

    pub fn is_closed(&self) -> bool {
        self.writer.lock().file.is_none()
    }

    /// Stream stored entries matching `config`: history first, then live
    /// writes when following, until the store closes or `until` passes.
    pub fn watch(
        &self,
        config: ReadConfig,
    ) -> impl Stream<Item = Result<StoredEntry, StoreError>> + Send + 'static {
        // Subscribe before reading history so no write falls in between.
        let live = if config.follow {
            self.writer.lock().followers.as_ref().map(|tx| tx.subscribe())
        } else {
            None
        };
        let path = self.path.clone();

        async_stream::try_stream! {
            let (history, seen) = read_history(&path).await?;

            let admitted: Vec<StoredEntry> = history
                .into_iter()
                .filter(|entry| config.admits(entry))
                .collect();
            let skip = if config.tail < 0 {
                0
            } else {
                admitted.len().saturating_sub(config.tail as usize)
            };
            for entry in admitted.into_iter().skip(skip) {
                yield entry;
            }

            if let Some(mut live) = live {
                loop {
                    match live.recv().await {
                        Ok((seq, entry)) => {
                            if seq < seen {
                                continue;
                            }
                            if config.is_past_until(&entry) {
                                break;
                            }
                            if config.admits(&entry) {
                                yield entry;
                            }
                        }
                        Err(RecvError::Lagged(missed)) => {
                            warn!(missed, "Log follower fell behind, entries skipped");
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            }
        }
    }
}

/// Parse every complete line; returns the entries and the line count.
async fn read_history(path: &Path) -> Result<(Vec<StoredEntry>, u64), StoreError> {
    let content = match tokio::fs::read(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
        Err(e) => return Err(e.into()),
    };

    let mut entries = Vec::new();
    let mut lines = 0u64;
    // A trailing fragment without newline is an in-progress write.
    for raw in content.split_inclusive(|b| *b == b'\n') {
        if raw.last() != Some(&b'\n') {
            break;
        }
        lines += 1;
        match serde_json::from_slice::<StoredEntry>(&raw[..raw.len() - 1]) {
            Ok(entry) => entries.push(entry),
            Err(e) => warn!(path = %path.display(), line = lines, error = %e, "Skipping corrupt log store line"),
        }
    }
    Ok((entries, lines))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use std::time::Duration;

    fn entry(log: &str, secs: i64) -> StoredEntry {
        StoredEntry::new(log.as_bytes(), "stdout", secs * 1_000_000_000)
    }

    async fn collect(store: &LocalStore, config: ReadConfig) -> Vec<String> {
        store
            .watch(config)
            .map(|r| r.unwrap().log)
            .collect()
            .await
    }

    fn open_temp() -> (tempfile::TempDir, Arc<LocalStore>) {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(dir.path().join("abc").join("json.log")).unwrap();
        (dir, store)
    }

    // ── write ───────────────────────────────────────────────────

    #[test]
    fn test_write_json_lines() {
        let (_dir, store) = open_temp();
        store.write(&entry("hello", 1)).unwrap();
        let content = std::fs::read_to_string(store.path()).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(content.trim_end()).unwrap();
        assert_eq!(parsed["log"], "hello");
        assert_eq!(parsed["stream"], "stdout");
        assert_eq!(parsed["time"], "1970-01-01T00:00:01Z");
    }

    #[test]
    fn test_write_after_close_fails() {
        let (_dir, store) = open_temp();
        store.close();
        store.close();
        assert!(store.is_closed());
        assert!(matches!(store.write(&entry("late", 1)), Err(StoreError::Closed)));
    }

    #[test]
    fn test_reopen_appends() {
        let (dir, store) = open_temp();
        store.write(&entry("one", 1)).unwrap();
        store.close();
        let store = LocalStore::open(dir.path().join("abc").join("json.log")).unwrap();
        store.write(&entry("two", 2)).unwrap();
        let content = std::fs::read_to_string(store.path()).unwrap();
        assert_eq!(content.lines().count(), 2);
    }

    // ── read back ───────────────────────────────────────────────

    #[tokio::test]
    async fn test_tail_semantics() {
        let (_dir, store) = open_temp();
        for (i, log) in ["a", "b", "c", "d"].iter().enumerate() {
            store.write(&entry(log, i as i64)).unwrap();
        }

        let all = collect(&store, ReadConfig::default()).await;
        assert_eq!(all, vec!["a", "b", "c", "d"]);

        let none = collect(&store, ReadConfig { tail: 0, ..ReadConfig::default() }).await;
        assert!(none.is_empty());

        let last_two = collect(&store, ReadConfig { tail: 2, ..ReadConfig::default() }).await;
        assert_eq!(last_two, vec!["c", "d"]);

        let more = collect(&store, ReadConfig { tail: 10, ..ReadConfig::default() }).await;
        assert_eq!(more.len(), 4);
    }

    #[tokio::test]
    async fn test_since_until_window() {
        let (_dir, store) = open_temp();
        for (i, log) in ["a", "b", "c", "d"].iter().enumerate() {
            store.write(&entry(log, i as i64 * 10)).unwrap();
        }
        let config = ReadConfig {
            since: DateTime::from_timestamp(10, 0),
            until: DateTime::from_timestamp(20, 0),
            ..ReadConfig::default()
        };
        assert_eq!(collect(&store, config).await, vec!["b", "c"]);
    }

    #[tokio::test]
    async fn test_corrupt_line_is_skipped() {
        let (_dir, store) = open_temp();
        store.write(&entry("good", 1)).unwrap();
        {
            let mut file = OpenOptions::new().append(true).open(store.path()).unwrap();
            file.write_all(b"{not json}\n").unwrap();
        }
        let logs = collect(&store, ReadConfig::default()).await;
        assert_eq!(logs, vec!["good"]);
    }

    #[tokio::test]
    async fn test_follow_sees_new_writes_and_ends_on_close() {
        let (_dir, store) = open_temp();
        store.write(&entry("before", 1)).unwrap();

        let mut stream = Box::pin(store.watch(ReadConfig { follow: true, ..ReadConfig::default() }));
        assert_eq!(stream.next().await.unwrap().unwrap().log, "before");

        store.write(&entry("after", 2)).unwrap();
        let next = tokio::time::timeout(Duration::from_secs(1), stream.next()).await.unwrap();
        assert_eq!(next.unwrap().unwrap().log, "after");

        store.close();
        let end = tokio::time::timeout(Duration::from_secs(1), stream.next()).await.unwrap();
        assert!(end.is_none());
    }

    #[tokio::test]
    async fn test_follow_on_closed_store_returns_history() {
        let (_dir, store) = open_temp();
        store.write(&entry("only", 1)).unwrap();
        store.close();
        let logs = collect(&store, ReadConfig { follow: true, ..ReadConfig::default() }).await;
        assert_eq!(logs, vec!["only"]);
    }
}
