//! The partition client contract (§4.2): a stateless remote block store for
//! one column of one volume, reached over HTTP with relay fallback.
//!
//! `PartitionClient` itself is a plain, blocking, object-safe trait — the
//! core treats every call as synchronous (§5: "PartitionClient calls are
//! synchronous from the core's perspective via `AsyncResult::Wait` with a
//! timeout"). [`AsyncResult`] is the one-shot completion primitive the HTTP
//! implementation uses internally to bridge the async `reqwest` call back
//! into that synchronous contract, per the "prefer a one-shot future"
//! design note.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use tokio::runtime::Runtime;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// A one-shot, timeout-observable completion handle, matching the
/// `AsyncResult` collaborator named throughout §4.2/§5/§9.
pub struct AsyncResult<T> {
    rx: oneshot::Receiver<T>,
}

pub struct AsyncResultHandle<T> {
    tx: oneshot::Sender<T>,
}

impl<T: Send + 'static> AsyncResult<T> {
    pub fn new() -> (AsyncResultHandle<T>, AsyncResult<T>) {
        let (tx, rx) = oneshot::channel();
        (AsyncResultHandle { tx }, AsyncResult { rx })
    }

    /// Waits up to `timeout` for completion; `None` on expiry or a dropped
    /// completer (both treated as `Timeout`/`IoError` by callers).
    pub async fn wait(self, timeout: Duration) -> Option<T> {
        tokio::time::timeout(timeout, self.rx).await.ok()?.ok()
    }
}

impl<T> AsyncResultHandle<T> {
    pub fn complete(self, value: T) {
        let _ = self.tx.send(value);
    }
}

/// Stateless remote block store for exactly one column of one volume.
///
/// Sizes are in `[1, block_size]`; `offset in [0, block_size)`;
/// `offset + size <= block_size`. Implementations must be safe to call
/// concurrently — the cache worker and direct (uncached) Volume callers
/// may both be in flight against the same partition.
pub trait PartitionClient: Send + Sync {
    /// Cheap liveness check for repair purposes: an absent cell counts as
    /// not intact.
    fn verify_block(&self, row: u64) -> bool;

    fn read_block(&self, row: u64, offset: u32, size: u32) -> Result<Vec<u8>>;

    fn write_block(&self, row: u64, offset: u32, data: &[u8]) -> Result<usize>;

    /// Removes the backing storage on the provider; called when a volume
    /// is deleted.
    fn delete(&self) -> Result<bool>;
}

/// One provider endpoint plus its DHT-discovered relay fallbacks.
#[derive(Debug, Clone)]
pub struct PartitionEndpoint {
    pub name: String,
    pub provider_url: String,
    pub relays: Vec<String>,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl PartitionEndpoint {
    fn per_call_timeout(&self) -> Duration {
        let attempts = (self.relays.len() + 1) as u32;
        (self.connect_timeout + self.request_timeout) * attempts
    }
}

/// HTTP-backed [`PartitionClient`]. Each call POSTs to the partition's
/// `/api/host/Partitions/<name>/<Op>` endpoint per §6's wire shapes. A
/// connectivity-class failure (resolve/connect/timeout/send) on the primary
/// endpoint falls back through the relay list in stable order; the relay
/// that first succeeds becomes sticky for subsequent calls. A response
/// carrying an HTTP 4xx/5xx status is never retried through a relay.
pub struct HttpPartitionClient {
    endpoint: PartitionEndpoint,
    client: reqwest::Client,
    runtime: Runtime,
    /// Index into `endpoint.relays`, or `usize::MAX` to mean "primary".
    sticky: AtomicUsize,
}

const STICKY_PRIMARY: usize = usize::MAX;

impl HttpPartitionClient {
    pub fn new(endpoint: PartitionEndpoint) -> Result<Self> {
        let runtime = Runtime::new()
            .map_err(|e| Error::IoError(format!("failed to start partition runtime: {e}")))?;
        Ok(Self {
            endpoint,
            client: reqwest::Client::new(),
            runtime,
            sticky: AtomicUsize::new(STICKY_PRIMARY),
        })
    }

    fn base_urls_from_sticky(&self) -> Vec<(usize, String)> {
        let sticky = self.sticky.load(Ordering::Acquire);
        let mut order = Vec::with_capacity(self.endpoint.relays.len() + 1);
        if sticky == STICKY_PRIMARY {
            order.push((STICKY_PRIMARY, self.endpoint.provider_url.clone()));
            for (i, relay) in self.endpoint.relays.iter().enumerate() {
                order.push((i, relay.clone()));
            }
        } else {
            order.push((sticky, self.endpoint.relays[sticky].clone()));
            order.push((STICKY_PRIMARY, self.endpoint.provider_url.clone()));
            for (i, relay) in self.endpoint.relays.iter().enumerate() {
                if i != sticky {
                    order.push((i, relay.clone()));
                }
            }
        }
        order
    }

    fn call(&self, op: &str, form: Vec<(&str, String)>) -> Result<serde_json::Value> {
        let timeout = self.endpoint.per_call_timeout();
        let name = self.endpoint.name.clone();
        let order = self.base_urls_from_sticky();
        let client = self.client.clone();

        self.runtime.block_on(async move {
            let mut last_err: Option<Error> = None;

            for (relay_idx, base) in order {
                let url = format!("{base}/api/host/Partitions/{name}/{op}");
                let (handle, result) = AsyncResult::new();

                let req = client.post(&url).form(&form);

                tokio::spawn(async move {
                    handle.complete(req.send().await);
                });

                match result.wait(timeout).await {
                    Some(Ok(resp)) => {
                        let status = resp.status();
                        if status.is_success() {
                            if relay_idx != STICKY_PRIMARY {
                                self.sticky.store(relay_idx, Ordering::Release);
                            } else {
                                self.sticky.store(STICKY_PRIMARY, Ordering::Release);
                            }
                            return resp
                                .json::<serde_json::Value>()
                                .await
                                .map_err(|e| Error::IoError(format!("bad response body: {e}")));
                        }
                        // HTTP 4xx/5xx: not a connectivity failure, don't fall back.
                        return Err(Error::IoError(format!(
                            "partition '{name}' returned status {status}"
                        )));
                    }
                    Some(Err(e)) => {
                        if e.is_connect() || e.is_timeout() || e.is_request() {
                            warn!(partition = %name, url = %url, "connectivity failure, trying next relay");
                            last_err = Some(Error::IoError(format!("transport error: {e}")));
                            continue;
                        }
                        return Err(Error::IoError(format!("request error: {e}")));
                    }
                    None => {
                        last_err = Some(Error::Timeout(timeout));
                        continue;
                    }
                }
            }

            Err(last_err.unwrap_or_else(|| Error::IoError("no endpoints available".into())))
        })
    }
}

impl PartitionClient for HttpPartitionClient {
    fn verify_block(&self, row: u64) -> bool {
        // A cheap liveness probe: a zero-size read succeeds iff the cell
        // and the provider are both reachable.
        self.read_block(row, 0, 0).is_ok()
    }

    fn read_block(&self, row: u64, offset: u32, size: u32) -> Result<Vec<u8>> {
        let form = vec![
            ("block", serde_json::to_string(&row).unwrap()),
            ("offset", serde_json::to_string(&offset).unwrap()),
            ("size", serde_json::to_string(&size).unwrap()),
        ];
        let value = self.call("ReadBlock", form)?;
        let encoded = value
            .as_str()
            .ok_or_else(|| Error::IoError("ReadBlock response was not a JSON string".into()))?;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| Error::IoError(format!("bad base64 payload: {e}")))?;
        if bytes.len() != size as usize {
            return Err(Error::IoError(format!(
                "short read: expected {size} bytes, got {}",
                bytes.len()
            )));
        }
        Ok(bytes)
    }

    fn write_block(&self, row: u64, offset: u32, data: &[u8]) -> Result<usize> {
        let encoded = base64::engine::general_purpose::STANDARD.encode(data);
        let form = vec![
            ("block", serde_json::to_string(&row).unwrap()),
            ("offset", serde_json::to_string(&offset).unwrap()),
            ("data", encoded),
        ];
        let value = self.call("WriteBlock", form)?;
        let written = value
            .as_u64()
            .ok_or_else(|| Error::IoError("WriteBlock response was not a JSON integer".into()))?;
        if written as usize != data.len() {
            return Err(Error::IoError(format!(
                "short write: expected {} bytes, wrote {written}",
                data.len()
            )));
        }
        Ok(written as usize)
    }

    fn delete(&self) -> Result<bool> {
        let value = self.call("Delete", Vec::new())?;
        value
            .as_bool()
            .ok_or_else(|| Error::IoError("Delete response was not a JSON boolean".into()))
    }
}

/// An in-memory stand-in used by tests: no network, a `Vec<u8>` per row.
/// Supports simulating per-row `IoError` so repair paths can be exercised
/// deterministically (§8 scenarios 3-5).
///
/// A failure marked via `fail` is persistent — `verify_block` and
/// `read_block` keep failing for that row until a `write_block` lands (the
/// repair path healing it by storing fresh data) or the test calls `clear`
/// explicitly. This matters for decode: a one-shot failure consumed by the
/// liveness probe in `Row::verify` would never actually be observed by the
/// gather loop inside `Row::decode`, making "N cells missing" scenarios
/// silently test fewer losses than intended.
pub struct MockPartitionClient {
    block_size: usize,
    rows: std::sync::Mutex<std::collections::HashMap<u64, Vec<u8>>>,
    failing_rows: std::sync::Mutex<std::collections::HashSet<u64>>,
}

impl MockPartitionClient {
    pub fn new(block_size: usize) -> Arc<Self> {
        Arc::new(Self {
            block_size,
            rows: std::sync::Mutex::new(std::collections::HashMap::new()),
            failing_rows: std::sync::Mutex::new(std::collections::HashSet::new()),
        })
    }

    /// Marks `row` as failing verify/read calls until healed by a write or
    /// explicitly cleared.
    pub fn fail(&self, row: u64) {
        self.failing_rows.lock().unwrap().insert(row);
    }

    /// Removes a simulated failure without requiring a write.
    pub fn clear(&self, row: u64) {
        self.failing_rows.lock().unwrap().remove(&row);
    }

    /// Whether `row` is still marked failing — useful in tests to confirm a
    /// repair actually wrote fresh data (which heals the mark) rather than
    /// reading straight through.
    pub fn is_failing(&self, row: u64) -> bool {
        self.failing_rows.lock().unwrap().contains(&row)
    }
}

impl PartitionClient for MockPartitionClient {
    fn verify_block(&self, row: u64) -> bool {
        if self.is_failing(row) {
            return false;
        }
        self.rows.lock().unwrap().contains_key(&row)
    }

    fn read_block(&self, row: u64, offset: u32, size: u32) -> Result<Vec<u8>> {
        if self.is_failing(row) {
            return Err(Error::IoError(format!("simulated failure on row {row}")));
        }
        let rows = self.rows.lock().unwrap();
        let cell = rows
            .get(&row)
            .cloned()
            .unwrap_or_else(|| vec![0u8; self.block_size]);
        let start = offset as usize;
        let end = start + size as usize;
        if end > cell.len() {
            return Err(Error::IoError("read out of cell bounds".into()));
        }
        Ok(cell[start..end].to_vec())
    }

    fn write_block(&self, row: u64, offset: u32, data: &[u8]) -> Result<usize> {
        let mut rows = self.rows.lock().unwrap();
        let cell = rows
            .entry(row)
            .or_insert_with(|| vec![0u8; self.block_size]);
        let start = offset as usize;
        let end = start + data.len();
        if end > cell.len() {
            return Err(Error::IoError("write out of cell bounds".into()));
        }
        cell[start..end].copy_from_slice(data);
        drop(rows);
        self.clear(row);
        debug!(row, bytes = data.len(), "mock partition write");
        Ok(data.len())
    }

    fn delete(&self) -> Result<bool> {
        self.rows.lock().unwrap().clear();
        self.failing_rows.lock().unwrap().clear();
        Ok(true)
    }
}
