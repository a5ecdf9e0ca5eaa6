//! The write-back stripe cache (§4.3): a bounded, LRU-by-row, whole-cell
//! cache fronting the partition clients. Read-your-writes: a read
//! immediately following a write to the same cell returns the cached
//! content even before any flush.
//!
//! A single dedicated OS thread (not a tokio task — see [`crate::partition`]
//! for why partition calls stay blocking) owns all cache state: the row
//! maps, the timestamp ordering and the per-row backing files. Callers
//! submit requests over a bounded channel and block on a one-shot reply,
//! matching "the background flusher via locks + condvars... prefer a typed
//! channel/queue + a dedicated worker task" design note.

use std::collections::{BTreeSet, HashMap};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write as IoWrite};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, RecvTimeoutError, Sender, SyncSender};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{debug, error, warn};

use crate::error::{Error, Result};
use crate::partition::PartitionClient;

const REQUEST_QUEUE_CAPACITY: usize = 4096;
const DEFAULT_FLUSH_POLICY_SECS: u64 = 10;

#[derive(Debug, Clone, Copy, Default)]
struct RowEntry {
    timestamp: u64,
    dirty: bool,
}

enum Request {
    Read {
        row: u64,
        column: u64,
        size: u32,
        offset: u32,
        reply: Sender<Result<Vec<u8>>>,
    },
    Write {
        row: u64,
        column: u64,
        data: Vec<u8>,
        offset: u32,
        reply: Sender<Result<()>>,
    },
}

struct WorkerState {
    root: PathBuf,
    limit: usize,
    flush_policy: Duration,
    block_size: usize,
    partitions: Vec<Arc<dyn PartitionClient>>,
    rows: HashMap<u64, RowEntry>,
    /// Ordered `(timestamp, row)` multimap; `BTreeSet` gives ascending
    /// iteration without a second index since `row` breaks ties.
    timestamps: BTreeSet<(u64, u64)>,
    pending: Arc<AtomicUsize>,
}

/// Configuration for a [`StripeCache`].
pub struct CacheConfig {
    pub root: PathBuf,
    pub limit: usize,
    pub flush_policy: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("cache"),
            limit: 256,
            flush_policy: Duration::from_secs(DEFAULT_FLUSH_POLICY_SECS),
        }
    }
}

/// The cache's public, blocking handle. Cheap to clone (an `Arc` of the
/// channel sender); `Drop` on the last handle joins the worker after a
/// final forced flush.
pub struct StripeCache {
    sender: SyncSender<Request>,
    pending: Arc<AtomicUsize>,
    worker: Option<std::thread::JoinHandle<()>>,
}

impl StripeCache {
    pub fn new(
        config: CacheConfig,
        partitions: Vec<Arc<dyn PartitionClient>>,
        block_size: usize,
    ) -> Result<Self> {
        cleanpath(&config.root);
        std::fs::create_dir_all(&config.root)
            .map_err(|e| Error::IoError(format!("failed to create cache root: {e}")))?;

        let (sender, receiver) = sync_channel(REQUEST_QUEUE_CAPACITY);
        let pending = Arc::new(AtomicUsize::new(0));

        let state = WorkerState {
            root: config.root,
            limit: config.limit,
            flush_policy: config.flush_policy,
            block_size,
            partitions,
            rows: HashMap::new(),
            timestamps: BTreeSet::new(),
            pending: pending.clone(),
        };

        let worker = std::thread::Builder::new()
            .name("stripe-cache".into())
            .spawn(move || worker_loop(receiver, state))
            .map_err(|e| Error::IoError(format!("failed to spawn cache worker: {e}")))?;

        Ok(Self {
            sender,
            pending,
            worker: Some(worker),
        })
    }

    pub fn read(&self, row: u64, column: u64, size: u32, offset: u32) -> Result<Vec<u8>> {
        let (reply_tx, reply_rx) = std::sync::mpsc::channel();
        self.pending.fetch_add(1, Ordering::AcqRel);
        self.sender
            .send(Request::Read {
                row,
                column,
                size,
                offset,
                reply: reply_tx,
            })
            .map_err(|_| Error::IoError("cache worker is not running".into()))?;
        reply_rx
            .recv()
            .map_err(|_| Error::IoError("cache worker dropped the request".into()))?
    }

    pub fn write(&self, row: u64, column: u64, data: &[u8], offset: u32) -> Result<()> {
        let (reply_tx, reply_rx) = std::sync::mpsc::channel();
        self.pending.fetch_add(1, Ordering::AcqRel);
        self.sender
            .send(Request::Write {
                row,
                column,
                data: data.to_vec(),
                offset,
                reply: reply_tx,
            })
            .map_err(|_| Error::IoError("cache worker is not running".into()))?;
        reply_rx
            .recv()
            .map_err(|_| Error::IoError("cache worker dropped the request".into()))?
    }
}

impl Drop for StripeCache {
    fn drop(&mut self) {
        // Dropping the sender disconnects the channel; the worker sees
        // `RecvTimeoutError::Disconnected`, performs a forced flush of
        // every dirty row with no timeout, wipes the root, and exits.
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn row_path(root: &Path, row: u64) -> PathBuf {
    root.join(row.to_string())
}

/// Wipes every regular file directly under `folder` (never recurses) —
/// the cache root is ephemeral, wiped at startup and shutdown.
fn cleanpath(folder: &Path) {
    let Ok(entries) = std::fs::read_dir(folder) else {
        return;
    };
    for entry in entries.flatten() {
        if entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
            let _ = std::fs::remove_file(entry.path());
        }
    }
}

/// Linear scan of a row file for `column`'s payload.
fn read_file_block(path: &Path, column: u64, block_size: usize) -> Option<Vec<u8>> {
    let mut file = File::open(path).ok()?;
    let mut idx_buf = [0u8; 8];
    let mut payload = vec![0u8; block_size];
    loop {
        if file.read_exact(&mut idx_buf).is_err() {
            return None;
        }
        let idx = u64::from_le_bytes(idx_buf);
        if idx == column {
            return file.read_exact(&mut payload).ok().map(|_| payload);
        }
        file.seek(SeekFrom::Current(block_size as i64)).ok()?;
    }
}

/// Overwrites `column`'s record in place if present, else appends one.
fn write_file_block(path: &Path, column: u64, payload: &[u8]) -> std::io::Result<()> {
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?;

    let record_len = 8 + payload.len() as u64;
    let mut idx_buf = [0u8; 8];
    let mut offset = 0u64;
    loop {
        file.seek(SeekFrom::Start(offset))?;
        match file.read_exact(&mut idx_buf) {
            Ok(()) => {
                let idx = u64::from_le_bytes(idx_buf);
                if idx == column {
                    file.write_all(payload)?;
                    return Ok(());
                }
                offset += record_len;
            }
            Err(_) => break,
        }
    }

    file.seek(SeekFrom::End(0))?;
    file.write_all(&column.to_le_bytes())?;
    file.write_all(payload)?;
    Ok(())
}

fn touch(state: &mut WorkerState, row: u64, set_dirty: bool) {
    let now = now_secs();
    if let Some(entry) = state.rows.get_mut(&row) {
        state.timestamps.remove(&(entry.timestamp, row));
        entry.timestamp = now;
        if set_dirty {
            entry.dirty = true;
        }
    } else {
        state.rows.insert(
            row,
            RowEntry {
                timestamp: now,
                dirty: set_dirty,
            },
        );
    }
    state.timestamps.insert((now, row));

    if state.rows.len() > state.limit {
        evict_oldest(state);
    }
}

fn read_impl(state: &mut WorkerState, row: u64, column: u64, size: u32, offset: u32) -> Result<Vec<u8>> {
    let path = row_path(&state.root, row);
    let full = match read_file_block(&path, column, state.block_size) {
        Some(buf) => buf,
        None => {
            let partition = state
                .partitions
                .get(column as usize)
                .ok_or_else(|| Error::IoError(format!("no partition bound for column {column}")))?;
            let fetched = partition.read_block(row, 0, state.block_size as u32)?;
            if let Err(e) = write_file_block(&path, column, &fetched) {
                warn!(row, column, "failed to seed cache file after fetch: {e}");
            }
            fetched
        }
    };

    touch(state, row, false);

    let start = offset as usize;
    let end = start + size as usize;
    if end > full.len() {
        return Err(Error::IoError("cache read out of cell bounds".into()));
    }
    Ok(full[start..end].to_vec())
}

fn write_impl(
    state: &mut WorkerState,
    row: u64,
    column: u64,
    data: &[u8],
    offset: u32,
) -> Result<()> {
    let full = if data.len() == state.block_size && offset == 0 {
        data.to_vec()
    } else {
        let mut buf = read_impl(state, row, column, state.block_size as u32, 0)?;
        let start = offset as usize;
        buf[start..start + data.len()].copy_from_slice(data);
        buf
    };

    let path = row_path(&state.root, row);
    write_file_block(&path, column, &full)
        .map_err(|e| Error::IoError(format!("failed to write cache file: {e}")))?;
    touch(state, row, true);
    Ok(())
}

/// Writes every cached column of `row` back to its partition. Fails fast
/// on the first partition write error, leaving the row dirty for a later
/// retry.
fn flush_row(state: &WorkerState, row: u64) -> Result<()> {
    let path = row_path(&state.root, row);
    let mut file =
        File::open(&path).map_err(|e| Error::IoError(format!("failed to open row file: {e}")))?;
    let mut idx_buf = [0u8; 8];
    let mut payload = vec![0u8; state.block_size];

    loop {
        match file.read_exact(&mut idx_buf) {
            Ok(()) => {
                let column = u64::from_le_bytes(idx_buf);
                file.read_exact(&mut payload)
                    .map_err(|e| Error::IoError(format!("truncated cache record: {e}")))?;
                let partition = state.partitions.get(column as usize).ok_or_else(|| {
                    Error::IoError(format!("no partition bound for column {column}"))
                })?;
                partition.write_block(row, 0, &payload)?;
            }
            Err(_) => break,
        }
    }
    Ok(())
}

/// Writes back every dirty row older than `flush_policy` (or, if `force`,
/// every dirty row regardless of age — used on shutdown). Yields between
/// rows if requests have queued up in the meantime, so write-back never
/// starves read-your-writes latency.
fn flush(state: &mut WorkerState, force: bool) -> bool {
    let now = now_secs();
    let cutoff = now.saturating_sub(state.flush_policy.as_secs());
    let candidates: Vec<(u64, u64)> = state.timestamps.iter().cloned().collect();

    let mut all = true;
    for (ts, row) in candidates {
        if !force && ts > cutoff {
            break; // ascending order: nothing older remains
        }
        let dirty = state.rows.get(&row).map(|e| e.dirty).unwrap_or(false);
        if !dirty {
            continue;
        }
        match flush_row(state, row) {
            Ok(()) => {
                if let Some(entry) = state.rows.get_mut(&row) {
                    entry.dirty = false;
                }
            }
            Err(e) => {
                warn!(row, "cache write-back failed, will retry next tick: {e}");
                all = false;
            }
        }
        if !force && state.pending.load(Ordering::Acquire) > 0 {
            all = false;
            break;
        }
    }
    all
}

/// Evicts the single oldest row. A dirty oldest row is flushed first (via
/// the same non-forced pass a timer tick would run); if it's still dirty
/// afterwards, the row is left in place and eviction tries the next oldest
/// candidate instead of dropping unflushed data.
fn evict_oldest(state: &mut WorkerState) {
    let before = state.rows.len();
    let mut attempted_flush = false;

    for (ts, row) in state.timestamps.clone() {
        let Some(entry) = state.rows.get(&row).copied() else {
            state.timestamps.remove(&(ts, row));
            continue;
        };

        if entry.dirty && !attempted_flush {
            flush(state, false);
            attempted_flush = true;
        }

        let still_dirty = state.rows.get(&row).map(|e| e.dirty).unwrap_or(false);
        if still_dirty {
            continue;
        }

        let path = row_path(&state.root, row);
        let _ = std::fs::remove_file(&path);
        state.rows.remove(&row);
        state.timestamps.remove(&(ts, row));
        break;
    }

    if state.rows.len() == before {
        debug!("eviction found no clean candidate this pass");
    }
}

fn worker_loop(receiver: Receiver<Request>, mut state: WorkerState) {
    eprintln!("DEBUG worker_loop started");
    loop {
        let wait = state.flush_policy;
        match receiver.recv_timeout(wait) {
            Ok(req) => {
                eprintln!("DEBUG worker got request");
                state.pending.fetch_sub(1, Ordering::AcqRel);
                handle_request(&mut state, req);
                eprintln!("DEBUG worker handled request");
                flush(&mut state, false);
            }
            Err(RecvTimeoutError::Timeout) => {
                flush(&mut state, false);
            }
            Err(RecvTimeoutError::Disconnected) => { eprintln!("DEBUG disconnected, breaking"); break; }
        }
    }
    eprintln!("DEBUG entering shutdown drain");

    // Shutdown: drain anything still queued, then a final forced flush
    // with no timeout, then wipe the (now ephemeral) cache root.
    while let Ok(req) = receiver.try_recv() {
        handle_request(&mut state, req);
    }
    eprintln!("DEBUG drain done, forcing flush");
    if !flush(&mut state, true) {
        error!("cache shutdown: some dirty rows could not be flushed");
    }
    eprintln!("DEBUG flush done, cleanpath");
    cleanpath(&state.root);
    eprintln!("DEBUG worker_loop exiting");
}

fn handle_request(state: &mut WorkerState, req: Request) {
    match req {
        Request::Read {
            row,
            column,
            size,
            offset,
            reply,
        } => {
            let result = read_impl(state, row, column, size, offset);
            let _ = reply.send(result);
        }
        Request::Write {
            row,
            column,
            data,
            offset,
            reply,
        } => {
            let result = write_impl(state, row, column, &data, offset);
            let _ = reply.send(result);
        }
    }
}
