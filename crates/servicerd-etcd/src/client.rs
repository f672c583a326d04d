//! Store contract required by the lease-backed registry
//!
//! The registry only needs lease grant/revoke/keep-alive, single-key
//! put/get/delete, a prefix read, and a prefix watch. Streams are plain
//! channels owned by a background task; dropping the stream stops that task.

use std::time::Duration;

use async_trait::async_trait;
use servicerd_common::Result;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};

pub type LeaseId = i64;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
    /// Lease the key is attached to, 0 for none
    pub lease: LeaseId,
}

/// Acknowledgement of one lease renewal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KeepAliveResponse {
    pub id: LeaseId,
    pub ttl: Duration,
}

/// Renewal acknowledgements for one lease. Ends when the lease is lost or the
/// connection carrying it drops.
pub struct KeepAliveStream {
    rx: mpsc::Receiver<KeepAliveResponse>,
    _guard: DropGuard,
}

impl KeepAliveStream {
    /// `cancel` is fired when the stream is dropped so the producer can stop.
    pub fn new(rx: mpsc::Receiver<KeepAliveResponse>, cancel: CancellationToken) -> Self {
        Self {
            rx,
            _guard: cancel.drop_guard(),
        }
    }

    pub async fn message(&mut self) -> Option<KeepAliveResponse> {
        self.rx.recv().await
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatchEventKind {
    Put,
    Delete,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: WatchEventKind,
    pub key: String,
}

/// Change notifications for a key prefix.
pub struct WatchStream {
    rx: mpsc::Receiver<WatchEvent>,
    _guard: DropGuard,
}

impl WatchStream {
    pub fn new(rx: mpsc::Receiver<WatchEvent>, cancel: CancellationToken) -> Self {
        Self {
            rx,
            _guard: cancel.drop_guard(),
        }
    }

    pub async fn message(&mut self) -> Option<WatchEvent> {
        self.rx.recv().await
    }

    /// Take an already-delivered event without waiting.
    pub fn try_message(&mut self) -> Option<WatchEvent> {
        self.rx.try_recv().ok()
    }
}

#[async_trait]
pub trait LeaseClient: Send + Sync + 'static {
    /// Grant a lease that expires after `ttl` unless renewed.
    async fn grant(&self, ttl: Duration) -> Result<LeaseId>;

    /// Revoke a lease, deleting every key attached to it. Revoking an
    /// unknown lease succeeds.
    async fn revoke(&self, lease: LeaseId) -> Result<()>;

    /// Keep `lease` alive until the returned stream is dropped.
    async fn keep_alive(&self, lease: LeaseId) -> Result<KeepAliveStream>;

    /// Write `key`, attached to `lease` when given.
    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<KeyValue>>;

    /// Every key starting with `prefix`.
    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Watch every key starting with `prefix`.
    async fn watch_prefix(&self, prefix: &str) -> Result<WatchStream>;
}
