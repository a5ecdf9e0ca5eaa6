//! The block-device callback surface (§6): what an external NBD/proxy shim
//! holds one of per mounted volume. `read`/`write` delegate to the
//! encrypted-at-rest path; `discard`/`flush`/`trim` are no-ops in the
//! baseline, matching the distilled spec's external-interface contract
//! exactly.

use std::sync::Arc;

use crate::error::Result;
use crate::volume::Volume;

/// Thin, cloneable wrapper a block-device shim can hold one of per mounted
/// volume and forward OS callbacks to directly.
#[derive(Clone)]
pub struct BlockDevice {
    volume: Arc<Volume>,
}

impl BlockDevice {
    pub fn new(volume: Arc<Volume>) -> Self {
        Self { volume }
    }

    pub fn capacity(&self) -> u64 {
        self.volume.capacity()
    }

    /// `read(buf, size, offset, ctx) -> 0 | -1` in the spec's callback
    /// shape; realized as a `Result` rather than a status code since there
    /// is no `ctx` to thread through in safe Rust.
    pub fn read(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        self.volume.read_decrypt(buf, offset)
    }

    /// `write(buf, size, offset, ctx) -> 0 | -1`.
    pub fn write(&self, data: &[u8], offset: u64) -> Result<()> {
        self.volume.write_encrypt(data, offset)
    }

    /// `discard(ctx)` — no-op in the baseline.
    pub fn discard(&self) {}

    /// `flush(ctx) -> int` — no-op in the baseline; the stripe cache runs
    /// its own background write-back policy independent of OS flush hints.
    pub fn flush(&self) -> i32 {
        0
    }

    /// `trim(from, len, ctx) -> int` — no-op in the baseline.
    pub fn trim(&self, _from: u64, _len: u64) -> i32 {
        0
    }
}
