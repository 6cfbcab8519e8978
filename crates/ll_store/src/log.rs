//! Seam to the replicated append-only log.
//!
//! The log itself is an external collaborator; this crate only needs it to accept entries,
//! return them in append order and notify on new ones. Two providers ship here: an
//! in-memory one used by tests and the threshold simulations, and a JSON-lines file per
//! address protected by a SHA-256 hash chain.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use ll_proto::{EntryBody, Manifest, StoredEntry};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::broadcast;

use crate::error::StoreError;

const CHAIN_START: &str = "CHAIN_START";
const NOTIFY_CAPACITY: usize = 256;

#[async_trait]
pub trait ReplicatedLog: Send + Sync {
    fn address(&self) -> &str;

    fn manifest(&self) -> &Manifest;

    /// Every entry in append order.
    async fn entries(&self) -> Result<Vec<StoredEntry>, StoreError>;

    async fn append(&self, key: &str, body: EntryBody) -> Result<StoredEntry, StoreError>;

    fn subscribe(&self) -> broadcast::Receiver<StoredEntry>;
}

#[async_trait]
pub trait LogProvider: Send + Sync {
    /// Open the log for `manifest`, creating it if it does not exist yet.
    async fn create(&self, manifest: &Manifest) -> Result<Arc<dyn ReplicatedLog>, StoreError>;

    /// Open an existing log by address.
    async fn open(&self, address: &str) -> Result<Arc<dyn ReplicatedLog>, StoreError>;
}

// ── In-memory ────────────────────────────────────────────────────────────────

pub struct MemoryLog {
    address: String,
    manifest: Manifest,
    entries: Mutex<Vec<StoredEntry>>,
    notify: broadcast::Sender<StoredEntry>,
}

impl MemoryLog {
    fn new(manifest: Manifest) -> Self {
        let (notify, _) = broadcast::channel(NOTIFY_CAPACITY);
        Self {
            address: manifest.address(),
            manifest,
            entries: Mutex::new(Vec::new()),
            notify,
        }
    }
}

#[async_trait]
impl ReplicatedLog for MemoryLog {
    fn address(&self) -> &str {
        &self.address
    }

    fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    async fn entries(&self) -> Result<Vec<StoredEntry>, StoreError> {
        Ok(self.entries.lock().clone())
    }

    async fn append(&self, key: &str, body: EntryBody) -> Result<StoredEntry, StoreError> {
        let entry = {
            let mut entries = self.entries.lock();
            let entry = StoredEntry::new(entries.len() as u64 + 1, key, body);
            entries.push(entry.clone());
            entry
        };
        // No subscribers is fine.
        let _ = self.notify.send(entry.clone());
        Ok(entry)
    }

    fn subscribe(&self) -> broadcast::Receiver<StoredEntry> {
        self.notify.subscribe()
    }
}

#[derive(Default, Clone)]
pub struct MemoryLogProvider {
    logs: Arc<Mutex<HashMap<String, Arc<MemoryLog>>>>,
}

impl MemoryLogProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LogProvider for MemoryLogProvider {
    async fn create(&self, manifest: &Manifest) -> Result<Arc<dyn ReplicatedLog>, StoreError> {
        let mut logs = self.logs.lock();
        let log = logs
            .entry(manifest.address())
            .or_insert_with(|| Arc::new(MemoryLog::new(manifest.clone())))
            .clone();
        Ok(log)
    }

    async fn open(&self, address: &str) -> Result<Arc<dyn ReplicatedLog>, StoreError> {
        match self.logs.lock().get(address) {
            Some(log) => Ok(log.clone()),
            None => Err(StoreError::NotFound(address.to_string())),
        }
    }
}

// ── JSON lines on disk ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChainedLine {
    entry: StoredEntry,
    prev_hash: String,
    chain_hash: String,
}

fn chain_hash(prev_hash: &str, entry: &StoredEntry) -> Result<String, StoreError> {
    let mut hasher = Sha256::new();
    hasher.update(prev_hash.as_bytes());
    hasher.update(serde_json::to_vec(entry)?);
    Ok(hex::encode(hasher.finalize()))
}

struct FileLogState {
    entries: Vec<StoredEntry>,
    last_hash: String,
}

pub struct FileLog {
    address: String,
    manifest: Manifest,
    path: PathBuf,
    state: Mutex<FileLogState>,
    notify: broadcast::Sender<StoredEntry>,
}

impl FileLog {
    fn load(dir: &Path, manifest: Manifest) -> Result<Self, StoreError> {
        let address = manifest.address();
        let path = dir.join("entries.jsonl");
        let mut entries = Vec::new();
        let mut last_hash = CHAIN_START.to_string();
        if path.exists() {
            let reader = BufReader::new(File::open(&path)?);
            for (idx, line) in reader.lines().enumerate() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                let chained: ChainedLine = serde_json::from_str(&line)?;
                let corrupt = |reason: &str| StoreError::CorruptLog {
                    address: address.clone(),
                    line: idx + 1,
                    reason: reason.to_string(),
                };
                if chained.prev_hash != last_hash {
                    return Err(corrupt("broken hash chain"));
                }
                if chain_hash(&last_hash, &chained.entry)? != chained.chain_hash {
                    return Err(corrupt("chain hash mismatch"));
                }
                last_hash = chained.chain_hash;
                entries.push(chained.entry);
            }
        }
        let (notify, _) = broadcast::channel(NOTIFY_CAPACITY);
        Ok(Self {
            address,
            manifest,
            path,
            state: Mutex::new(FileLogState { entries, last_hash }),
            notify,
        })
    }
}

#[async_trait]
impl ReplicatedLog for FileLog {
    fn address(&self) -> &str {
        &self.address
    }

    fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    async fn entries(&self) -> Result<Vec<StoredEntry>, StoreError> {
        Ok(self.state.lock().entries.clone())
    }

    async fn append(&self, key: &str, body: EntryBody) -> Result<StoredEntry, StoreError> {
        let entry = {
            let mut state = self.state.lock();
            let entry = StoredEntry::new(state.entries.len() as u64 + 1, key, body);
            let line = ChainedLine {
                chain_hash: chain_hash(&state.last_hash, &entry)?,
                prev_hash: state.last_hash.clone(),
                entry: entry.clone(),
            };
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)?;
            writeln!(file, "{}", serde_json::to_string(&line)?)?;
            file.flush()?;
            state.last_hash = line.chain_hash;
            state.entries.push(entry.clone());
            entry
        };
        let _ = self.notify.send(entry.clone());
        Ok(entry)
    }

    fn subscribe(&self) -> broadcast::Receiver<StoredEntry> {
        self.notify.subscribe()
    }
}

/// One directory per address under `root`, holding `manifest.json` and `entries.jsonl`.
#[derive(Clone)]
pub struct FileLogProvider {
    root: PathBuf,
    open_logs: Arc<Mutex<HashMap<String, Arc<FileLog>>>>,
}

impl FileLogProvider {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            open_logs: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    fn dir_for(&self, address: &str) -> PathBuf {
        let id = address.rsplit('/').next().unwrap_or(address);
        self.root.join(id)
    }
}

#[async_trait]
impl LogProvider for FileLogProvider {
    async fn create(&self, manifest: &Manifest) -> Result<Arc<dyn ReplicatedLog>, StoreError> {
        let address = manifest.address();
        let mut open_logs = self.open_logs.lock();
        if let Some(log) = open_logs.get(&address) {
            return Ok(log.clone());
        }
        let dir = self.dir_for(&address);
        fs::create_dir_all(&dir)?;
        let manifest_path = dir.join("manifest.json");
        if !manifest_path.exists() {
            fs::write(&manifest_path, serde_json::to_vec_pretty(manifest)?)?;
        }
        let log = Arc::new(FileLog::load(&dir, manifest.clone())?);
        open_logs.insert(address, log.clone());
        Ok(log)
    }

    async fn open(&self, address: &str) -> Result<Arc<dyn ReplicatedLog>, StoreError> {
        let mut open_logs = self.open_logs.lock();
        if let Some(log) = open_logs.get(address) {
            return Ok(log.clone());
        }
        let dir = self.dir_for(address);
        let manifest_path = dir.join("manifest.json");
        if !manifest_path.exists() {
            return Err(StoreError::NotFound(address.to_string()));
        }
        let manifest: Manifest = serde_json::from_slice(&fs::read(&manifest_path)?)?;
        if manifest.address() != address {
            return Err(StoreError::NotFound(address.to_string()));
        }
        let log = Arc::new(FileLog::load(&dir, manifest)?);
        open_logs.insert(address.to_string(), log.clone());
        Ok(log)
    }
}
