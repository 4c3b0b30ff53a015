//! Durable keyed tables backing the instance table, the message log and the
//! topology configuration records.
//!
//! Three backends: an in-memory `BTreeMap` for tests and embedded use, a
//! JSON file rewritten atomically on every mutation for small tables, and an
//! append-only journal for tables written on every message.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{ReplError, Result};

/// Keyed table of records.
///
/// Implementations must make each single call atomic; callers that need a
/// check-then-write sequence provide their own serialisation.
pub trait Table<V>: Send + Sync {
    /// Get a record by key. Returns None if the key doesn't exist.
    fn get(&self, key: &str) -> Result<Option<V>>;

    /// Insert or overwrite a record.
    fn put(&self, key: &str, value: V) -> Result<()>;

    /// Delete a record. Returns true if it existed.
    fn delete(&self, key: &str) -> Result<bool>;

    /// Returns true if the key exists.
    fn contains(&self, key: &str) -> Result<bool>;

    /// All records in key order.
    fn values(&self) -> Result<Vec<V>>;
}

/// In-memory table. Thread-safe via RwLock; does not persist across restarts.
pub struct MemoryTable<V> {
    data: RwLock<BTreeMap<String, V>>,
}

impl<V> MemoryTable<V> {
    /// Creates a new empty table.
    pub fn new() -> Self {
        Self {
            data: RwLock::new(BTreeMap::new()),
        }
    }
}

impl<V> Default for MemoryTable<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Clone + Send + Sync> Table<V> for MemoryTable<V> {
    fn get(&self, key: &str) -> Result<Option<V>> {
        Ok(self.data.read().get(key).cloned())
    }

    fn put(&self, key: &str, value: V) -> Result<()> {
        self.data.write().insert(key.to_string(), value);
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.data.write().remove(key).is_some())
    }

    fn contains(&self, key: &str) -> Result<bool> {
        Ok(self.data.read().contains_key(key))
    }

    fn values(&self) -> Result<Vec<V>> {
        Ok(self.data.read().values().cloned().collect())
    }
}

/// Table persisted as a single JSON document.
pub struct JsonFileTable<V> {
    path: PathBuf,
    data: Mutex<BTreeMap<String, V>>,
    _marker: PhantomData<fn() -> V>,
}

impl<V: Clone + Serialize + DeserializeOwned + Send + Sync> JsonFileTable<V> {
    /// Opens the table at `path`, creating parent directories. A missing file
    /// is an empty table.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let data = if path.exists() {
            let contents = fs::read(&path)?;
            if contents.is_empty() {
                BTreeMap::new()
            } else {
                serde_json::from_slice(&contents)?
            }
        } else {
            BTreeMap::new()
        };
        debug!(path = %path.display(), records = data.len(), "opened json table");
        Ok(Self {
            path,
            data: Mutex::new(data),
            _marker: PhantomData,
        })
    }

    /// Location of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, data: &BTreeMap<String, V>) -> Result<()> {
        let tmp = self.path.with_extension("tmp");
        let bytes = serde_json::to_vec(data)?;
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path).map_err(|e| {
            ReplError::store(format!("rename {}: {}", self.path.display(), e))
        })
    }
}

impl<V: Clone + Serialize + DeserializeOwned + Send + Sync> Table<V> for JsonFileTable<V> {
    fn get(&self, key: &str) -> Result<Option<V>> {
        Ok(self.data.lock().get(key).cloned())
    }

    fn put(&self, key: &str, value: V) -> Result<()> {
        let mut data = self.data.lock();
        let previous = data.insert(key.to_string(), value);
        if let Err(e) = self.persist(&data) {
            match previous {
                Some(v) => data.insert(key.to_string(), v),
                None => data.remove(key),
            };
            return Err(e);
        }
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<bool> {
        let mut data = self.data.lock();
        let Some(previous) = data.remove(key) else {
            return Ok(false);
        };
        if let Err(e) = self.persist(&data) {
            data.insert(key.to_string(), previous);
            return Err(e);
        }
        Ok(true)
    }

    fn contains(&self, key: &str) -> Result<bool> {
        Ok(self.data.lock().contains_key(key))
    }

    fn values(&self) -> Result<Vec<V>> {
        Ok(self.data.lock().values().cloned().collect())
    }
}

/// Journal length below which it is never compacted.
const COMPACT_MIN_ENTRIES: usize = 1024;

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum JournalOp<V> {
    Put { key: String, value: V },
    Delete { key: String },
}

struct JournalState<V> {
    data: BTreeMap<String, V>,
    file: File,
    entries: usize,
}

/// Table persisted as an append-only journal of JSON lines.
///
/// Each mutation appends one synced line. The journal is rewritten to the
/// live records on open and whenever dead entries outnumber live ones. A
/// torn last line, left by a crash during an append, is dropped on open.
pub struct JournalTable<V> {
    path: PathBuf,
    state: Mutex<JournalState<V>>,
}

impl<V: Clone + Serialize + DeserializeOwned + Send + Sync> JournalTable<V> {
    /// Opens the journal at `path`, creating parent directories, and replays
    /// it. A missing file is an empty table.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let data = if path.exists() {
            replay(&path, &fs::read(&path)?)?
        } else {
            BTreeMap::new()
        };
        let file = rewrite(&path, &data)?;
        debug!(path = %path.display(), records = data.len(), "opened journal table");
        Ok(Self {
            path,
            state: Mutex::new(JournalState {
                entries: data.len(),
                data,
                file,
            }),
        })
    }

    /// Location of the journal.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, state: &mut JournalState<V>, op: &JournalOp<V>) -> Result<()> {
        let mut line = serde_json::to_vec(op)?;
        line.push(b'\n');
        state.file.write_all(&line)?;
        state.file.sync_data()?;
        state.entries += 1;
        Ok(())
    }

    /// Put the journal back in line with `state.data` after a failed append.
    fn repair(&self, state: &mut JournalState<V>) {
        match rewrite(&self.path, &state.data) {
            Ok(file) => {
                state.file = file;
                state.entries = state.data.len();
            }
            Err(e) => warn!(path = %self.path.display(), error = %e, "journal repair failed"),
        }
    }

    fn maybe_compact(&self, state: &mut JournalState<V>) {
        if state.entries <= COMPACT_MIN_ENTRIES || state.entries <= 2 * state.data.len() {
            return;
        }
        let before = state.entries;
        match rewrite(&self.path, &state.data) {
            Ok(file) => {
                state.file = file;
                state.entries = state.data.len();
                info!(path = %self.path.display(), before, after = state.entries, "journal compacted");
            }
            Err(e) => warn!(path = %self.path.display(), error = %e, "journal compaction failed"),
        }
    }
}

fn replay<V: DeserializeOwned>(path: &Path, contents: &[u8]) -> Result<BTreeMap<String, V>> {
    let mut data = BTreeMap::new();
    let lines: Vec<&[u8]> = contents
        .split(|b| *b == b'\n')
        .filter(|line| !line.is_empty())
        .collect();
    for (n, line) in lines.iter().enumerate() {
        match serde_json::from_slice::<JournalOp<V>>(line) {
            Ok(JournalOp::Put { key, value }) => {
                data.insert(key, value);
            }
            Ok(JournalOp::Delete { key }) => {
                data.remove(&key);
            }
            Err(e) if n + 1 == lines.len() => {
                warn!(path = %path.display(), line = n + 1, error = %e, "dropping torn journal entry");
            }
            Err(e) => {
                return Err(ReplError::store(format!(
                    "{}: bad journal entry at line {}: {}",
                    path.display(),
                    n + 1,
                    e
                )))
            }
        }
    }
    Ok(data)
}

/// Write `data` as a fresh journal next to `path`, sync it and move it into
/// place. Returns the handle to append to.
fn rewrite<V: Clone + Serialize>(path: &Path, data: &BTreeMap<String, V>) -> Result<File> {
    let tmp = path.with_extension("tmp");
    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&tmp)?;
    let mut writer = BufWriter::new(file);
    for (key, value) in data {
        let op = JournalOp::Put {
            key: key.clone(),
            value: value.clone(),
        };
        serde_json::to_writer(&mut writer, &op)?;
        writer.write_all(b"\n")?;
    }
    let file = writer.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;
    fs::rename(&tmp, path)
        .map_err(|e| ReplError::store(format!("rename {}: {}", path.display(), e)))?;
    Ok(file)
}

impl<V: Clone + Serialize + DeserializeOwned + Send + Sync> Table<V> for JournalTable<V> {
    fn get(&self, key: &str) -> Result<Option<V>> {
        Ok(self.state.lock().data.get(key).cloned())
    }

    fn put(&self, key: &str, value: V) -> Result<()> {
        let mut state = self.state.lock();
        let op = JournalOp::Put {
            key: key.to_string(),
            value: value.clone(),
        };
        if let Err(e) = self.append(&mut state, &op) {
            self.repair(&mut state);
            return Err(e);
        }
        state.data.insert(key.to_string(), value);
        self.maybe_compact(&mut state);
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<bool> {
        let mut state = self.state.lock();
        if !state.data.contains_key(key) {
            return Ok(false);
        }
        let op = JournalOp::Delete {
            key: key.to_string(),
        };
        if let Err(e) = self.append(&mut state, &op) {
            self.repair(&mut state);
            return Err(e);
        }
        state.data.remove(key);
        self.maybe_compact(&mut state);
        Ok(true)
    }

    fn contains(&self, key: &str) -> Result<bool> {
        Ok(self.state.lock().data.contains_key(key))
    }

    fn values(&self) -> Result<Vec<V>> {
        Ok(self.state.lock().data.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Row {
        name: String,
        n: u32,
    }

    fn row(name: &str, n: u32) -> Row {
        Row {
            name: name.to_string(),
            n,
        }
    }

    #[test]
    fn test_memory_put_get_delete() {
        let table = MemoryTable::new();
        table.put("a", row("a", 1)).unwrap();
        assert_eq!(table.get("a").unwrap(), Some(row("a", 1)));
        assert!(table.contains("a").unwrap());
        assert!(table.delete("a").unwrap());
        assert!(!table.delete("a").unwrap());
        assert!(table.get("a").unwrap().is_none());
    }

    #[test]
    fn test_memory_values_sorted_by_key() {
        let table = MemoryTable::new();
        table.put("b", row("b", 2)).unwrap();
        table.put("a", row("a", 1)).unwrap();
        let names: Vec<_> = table.values().unwrap().into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn test_json_file_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rows.json");
        {
            let table: JsonFileTable<Row> = JsonFileTable::open(&path).unwrap();
            table.put("x", row("x", 7)).unwrap();
            table.put("y", row("y", 8)).unwrap();
            table.delete("y").unwrap();
        }
        let table: JsonFileTable<Row> = JsonFileTable::open(&path).unwrap();
        assert_eq!(table.get("x").unwrap(), Some(row("x", 7)));
        assert!(!table.contains("y").unwrap());
        assert_eq!(table.values().unwrap().len(), 1);
    }

    #[test]
    fn test_json_file_written_compact_without_leftovers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rows.json");
        let table: JsonFileTable<Row> = JsonFileTable::open(&path).unwrap();
        table.put("x", row("x", 7)).unwrap();
        table.put("y", row("y", 8)).unwrap();
        let contents = fs::read_to_string(&path).unwrap();
        assert!(!contents.contains('\n'));
        assert!(!path.with_extension("tmp").exists());
    }

    fn lines(path: &Path) -> usize {
        fs::read_to_string(path).unwrap().lines().count()
    }

    #[test]
    fn test_journal_reopen_after_many_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rows.journal");
        let mut expected = BTreeMap::new();
        {
            let table: JournalTable<Row> = JournalTable::open(&path).unwrap();
            for n in 0..3000u32 {
                let key = format!("k{}", n % 200);
                if n % 7 == 0 {
                    let existed = expected.remove(&key).is_some();
                    assert_eq!(table.delete(&key).unwrap(), existed);
                } else {
                    table.put(&key, row(&key, n)).unwrap();
                    expected.insert(key, row("", n));
                }
            }
            // Dead entries are compacted away while running.
            assert!(lines(&path) <= 2 * COMPACT_MIN_ENTRIES);
        }

        let table: JournalTable<Row> = JournalTable::open(&path).unwrap();
        let values = table.values().unwrap();
        assert_eq!(values.len(), expected.len());
        for (key, want) in &expected {
            assert_eq!(table.get(key).unwrap().unwrap().n, want.n);
        }
        assert_eq!(lines(&path), expected.len());
    }

    #[test]
    fn test_journal_drops_torn_tail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rows.journal");
        {
            let table: JournalTable<Row> = JournalTable::open(&path).unwrap();
            table.put("a", row("a", 1)).unwrap();
            table.put("b", row("b", 2)).unwrap();
        }
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(br#"{"op":"put","key":"c","val"#).unwrap();
        drop(file);

        let table: JournalTable<Row> = JournalTable::open(&path).unwrap();
        assert_eq!(table.values().unwrap().len(), 2);
        assert!(!table.contains("c").unwrap());
        table.put("c", row("c", 3)).unwrap();
        drop(table);

        let table: JournalTable<Row> = JournalTable::open(&path).unwrap();
        assert_eq!(table.get("c").unwrap(), Some(row("c", 3)));
    }

    #[test]
    fn test_journal_rejects_corrupt_middle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rows.journal");
        fs::write(
            &path,
            concat!(
                r#"{"op":"put","key":"a","value":{"name":"a","n":1}}"#,
                "\n",
                "garbage\n",
                r#"{"op":"delete","key":"a"}"#,
                "\n"
            ),
        )
        .unwrap();
        let result: Result<JournalTable<Row>> = JournalTable::open(&path);
        assert!(matches!(result, Err(ReplError::Store { .. })));
    }

    #[test]
    fn test_json_file_missing_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let table: JsonFileTable<Row> =
            JsonFileTable::open(dir.path().join("nested/none.json")).unwrap();
        assert!(table.values().unwrap().is_empty());
    }
}
