use crate::error::{Error, Result};
use crate::operation::{OperationId, PendingOperation};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// One line of the pending-operation journal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum JournalRecord {
    /// Written first after compaction so ids stay monotonic across restarts.
    Checkpoint { next_id: OperationId },
    Enqueued { operation: PendingOperation },
    Updated {
        id: OperationId,
        attempts: u32,
        last_error: Option<String>,
        last_attempt_at: Option<DateTime<Utc>>,
    },
    Removed { id: OperationId },
}

/// Append-only JSON-lines journal. Every append is flushed to disk before
/// returning.
#[derive(Debug)]
pub struct Storage {
    data_dir: PathBuf,
    name: String,
    file: Option<File>,
}

impl Storage {
    pub fn new<P: AsRef<Path>>(data_dir: P, name: &str) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
            name: sanitize_component(name),
            file: None,
        }
    }

    pub fn journal_path(&self) -> PathBuf {
        self.data_dir.join(format!("{}.jsonl", self.name))
    }

    /// Reads every record in write order. A torn final line, left by a crash
    /// in the middle of an append, is cut off so later appends start clean.
    pub fn load(&mut self) -> Result<Vec<JournalRecord>> {
        let path = self.journal_path();
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut records = Vec::new();
        let mut valid_len = 0usize;
        let mut offset = 0usize;
        let mut lines = text.split_inclusive('\n').enumerate().peekable();
        while let Some((idx, raw)) = lines.next() {
            offset += raw.len();
            let is_last = lines.peek().is_none();
            let line = raw.trim_end_matches(['\n', '\r']);
            if line.trim().is_empty() {
                valid_len = offset;
                continue;
            }
            match serde_json::from_str::<JournalRecord>(line) {
                Ok(record) if raw.ends_with('\n') => {
                    records.push(record);
                    valid_len = offset;
                }
                Ok(_) | Err(_) if is_last => {
                    tracing::warn!(
                        path = %path.display(),
                        line = idx + 1,
                        "dropping torn journal tail"
                    );
                }
                Ok(_) | Err(_) => {
                    return Err(Error::CorruptJournal {
                        path,
                        line: idx + 1,
                    });
                }
            }
        }

        if valid_len < text.len() {
            let file = OpenOptions::new().write(true).open(&path)?;
            file.set_len(valid_len as u64)?;
            file.sync_all()?;
        }

        Ok(records)
    }

    pub fn append(&mut self, record: &JournalRecord) -> Result<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        let file = self.handle()?;
        file.write_all(&line)?;
        file.sync_data()?;
        Ok(())
    }

    /// Atomically replaces the journal with `records`.
    pub fn rewrite(&mut self, records: &[JournalRecord]) -> Result<()> {
        fs::create_dir_all(&self.data_dir)?;
        let path = self.journal_path();
        let tmp = path.with_extension("jsonl.tmp");
        {
            let mut file = File::create(&tmp)?;
            for record in records {
                serde_json::to_writer(&mut file, record)?;
                file.write_all(b"\n")?;
            }
            file.sync_all()?;
        }
        self.file = None;
        fs::rename(&tmp, &path)?;
        sync_dir(&self.data_dir);
        Ok(())
    }

    fn handle(&mut self) -> Result<&mut File> {
        if self.file.is_none() {
            fs::create_dir_all(&self.data_dir)?;
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.journal_path())?;
            self.file = Some(file);
        }
        self.file
            .as_mut()
            .ok_or_else(|| Error::Io(io::Error::other("journal handle unavailable")))
    }
}

#[cfg(unix)]
fn sync_dir(dir: &Path) {
    if let Err(err) = File::open(dir).and_then(|d| d.sync_all()) {
        tracing::debug!(dir = %dir.display(), %err, "directory fsync failed");
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}

fn sanitize_component(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
            out.push(ch);
        } else {
            out.push('_');
        }
    }
    if out.is_empty() {
        "pending".to_string()
    } else {
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::OperationKind;

    fn enqueued(id: u64) -> JournalRecord {
        JournalRecord::Enqueued {
            operation: PendingOperation {
                id: OperationId(id),
                kind: OperationKind::AdjustStock,
                payload: serde_json::json!({ "product_id": "beer", "delta": -1, "reason": "spill" }),
                created_at: Utc::now(),
                attempts: 0,
                last_error: None,
                last_attempt_at: None,
            },
        }
    }

    #[test]
    fn appends_survive_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut storage = Storage::new(dir.path(), "pending");
        storage.append(&enqueued(1)).expect("append");
        storage.append(&JournalRecord::Removed { id: OperationId(1) }).expect("append");
        drop(storage);

        let mut reopened = Storage::new(dir.path(), "pending");
        let records = reopened.load().expect("load");
        assert_eq!(records.len(), 2);
        assert_eq!(records[1], JournalRecord::Removed { id: OperationId(1) });
    }

    #[test]
    fn torn_tail_is_truncated() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut storage = Storage::new(dir.path(), "pending");
        storage.append(&enqueued(1)).expect("append");
        let path = storage.journal_path();
        drop(storage);

        let mut file = OpenOptions::new().append(true).open(&path).expect("open");
        file.write_all(b"{\"record\":\"enqueued\",\"operat").expect("write");
        drop(file);

        let mut storage = Storage::new(dir.path(), "pending");
        assert_eq!(storage.load().expect("load").len(), 1);
        storage.append(&enqueued(2)).expect("append");

        let mut reopened = Storage::new(dir.path(), "pending");
        assert_eq!(reopened.load().expect("load").len(), 2);
    }

    #[test]
    fn corrupt_middle_line_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut storage = Storage::new(dir.path(), "pending");
        let path = storage.journal_path();
        fs::create_dir_all(dir.path()).expect("mkdir");
        let good = serde_json::to_string(&enqueued(1)).expect("serialize");
        fs::write(&path, format!("garbage\n{good}\n")).expect("write");
        assert!(matches!(
            storage.load(),
            Err(Error::CorruptJournal { line: 1, .. })
        ));
    }

    #[test]
    fn rewrite_replaces_contents() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut storage = Storage::new(dir.path(), "pending");
        for id in 1..=5 {
            storage.append(&enqueued(id)).expect("append");
        }
        let compacted = vec![
            JournalRecord::Checkpoint { next_id: OperationId(6) },
            enqueued(5),
        ];
        storage.rewrite(&compacted).expect("rewrite");
        storage.append(&JournalRecord::Removed { id: OperationId(5) }).expect("append");

        let records = Storage::new(dir.path(), "pending").load().expect("load");
        assert_eq!(records.len(), 3);
        assert_eq!(records[0], compacted[0]);
    }

    #[test]
    fn names_are_sanitized() {
        assert_eq!(sanitize_component("bar 1/../x"), "bar_1____x");
        assert_eq!(sanitize_component(""), "pending");
    }
}
