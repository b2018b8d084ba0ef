// Copyright 2022 TiKV Project Authors. Licensed under Apache-2.0.

//! Durable per-vbucket ownership and checkpoint metadata.
//!
//! Blobs are plain JSON documents in the metadata bucket, keyed
//! `<prefix><app>::vb::<vb>`. Fields this crate does not know about must
//! survive a read-modify-write, so every unrecognised field lands in
//! [`VbucketMetaBlob::extra`].

use std::{collections::HashMap, fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::{
    errors::{Error, Result},
    metrics,
    utils::{retry, FixedBackoff},
};

/// Stream status values, doubling as ownership-history operation names the
/// way the wire format shares the constants.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamStatus {
    #[default]
    #[serde(rename = "")]
    Unset,
    Bootstrap,
    Requested,
    Running,
    Stopped,
    RequestFailed,
}

impl fmt::Display for StreamStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StreamStatus::Unset => "",
            StreamStatus::Bootstrap => "bootstrap",
            StreamStatus::Requested => "requested",
            StreamStatus::Running => "running",
            StreamStatus::Stopped => "stopped",
            StreamStatus::RequestFailed => "request_failed",
        };
        f.write_str(s)
    }
}

/// One append-only entry in a vbucket's ownership history.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct OwnershipEntry {
    #[serde(default)]
    pub assigned_worker: String,
    #[serde(default)]
    pub current_vb_owner: String,
    #[serde(default)]
    pub operation: StreamStatus,
    #[serde(default)]
    pub seq_no: u64,
    #[serde(default)]
    pub timestamp: String,
}

impl OwnershipEntry {
    pub fn new(worker: &str, owner: &str, operation: StreamStatus, seq_no: u64) -> Self {
        OwnershipEntry {
            assigned_worker: worker.to_owned(),
            current_vb_owner: owner.to_owned(),
            operation,
            seq_no,
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

/// The persisted per-vbucket metadata document.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct VbucketMetaBlob {
    #[serde(default)]
    pub vb_id: u16,
    #[serde(default)]
    pub assigned_worker: String,
    #[serde(default)]
    pub current_vb_owner: String,
    #[serde(default)]
    pub node_uuid: String,
    #[serde(default)]
    pub vb_uuid: u64,
    #[serde(default)]
    pub dcp_stream_status: StreamStatus,
    #[serde(default)]
    pub last_processed_seq_no: u64,
    #[serde(default)]
    pub previous_assigned_worker: String,
    #[serde(default)]
    pub previous_node_uuid: String,
    #[serde(default)]
    pub previous_vb_owner: String,
    #[serde(default)]
    pub ownership_history: Vec<OwnershipEntry>,
    #[serde(default)]
    pub seq_no_at_stream_end: u64,
    #[serde(default)]
    pub seq_no_after_close_stream: u64,
    #[serde(default)]
    pub last_checkpoint_time: String,
    // Timer bookkeeping, opaque to the streaming control plane.
    #[serde(default)]
    pub currently_processed_doc_id_timer: String,
    #[serde(default)]
    pub last_processed_doc_id_timer_event: String,
    #[serde(default)]
    pub next_doc_id_timer_to_process: String,
    /// Fields written by newer builds survive our read-modify-write.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Key of a vbucket blob: `<prefix><app>::vb::<vb>`.
pub fn vb_blob_key(prefix: &str, app: &str, vb: u16) -> String {
    format!("{}{}::vb::{}", prefix, app, vb)
}

/// Durable key-value access to the metadata bucket.
#[async_trait]
pub trait MetaStore: Send + Sync + 'static {
    /// Returns `(bytes, cas)`, or `None` when the key does not exist.
    async fn get(&self, key: &str) -> Result<Option<(Vec<u8>, u64)>>;
    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()>;
    /// Compare-and-swap; `expected == 0` asserts the key is absent.
    async fn cas(&self, key: &str, expected: u64, value: Vec<u8>) -> Result<()>;
}

/// In-memory [`MetaStore`], enough for tests and local tooling.
#[derive(Default)]
pub struct MemStore {
    inner: Mutex<MemStoreInner>,
}

#[derive(Default)]
struct MemStoreInner {
    docs: HashMap<String, (Vec<u8>, u64)>,
    next_cas: u64,
}

impl MemStoreInner {
    fn bump(&mut self) -> u64 {
        self.next_cas += 1;
        self.next_cas
    }
}

#[async_trait]
impl MetaStore for MemStore {
    async fn get(&self, key: &str) -> Result<Option<(Vec<u8>, u64)>> {
        let inner = self.inner.lock().await;
        Ok(inner.docs.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let cas = inner.bump();
        inner.docs.insert(key.to_owned(), (value, cas));
        Ok(())
    }

    async fn cas(&self, key: &str, expected: u64, value: Vec<u8>) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let current = inner.docs.get(key).map(|(_, cas)| *cas).unwrap_or(0);
        if current != expected {
            return Err(Error::CasMismatch(key.to_owned()));
        }
        let cas = inner.bump();
        inner.docs.insert(key.to_owned(), (value, cas));
        Ok(())
    }
}

/// Read/modify/write of vbucket blobs with the fixed-backoff retry policy.
/// Transient remote failures are swallowed here; exhaustion surfaces the
/// single `RetryTimeout` sentinel that callers propagate unchanged.
#[derive(Clone)]
pub struct Checkpointer {
    store: Arc<dyn MetaStore>,
    backoff: FixedBackoff,
    retry_count: usize,
    metadata_prefix: String,
    app_name: String,
    worker_name: String,
    host_port_addr: String,
    node_uuid: String,
}

/// Identity of the consumer on whose behalf the checkpointer writes.
#[derive(Clone, Debug, Default)]
pub struct CheckpointIdentity {
    pub metadata_prefix: String,
    pub app_name: String,
    pub worker_name: String,
    pub host_port_addr: String,
    pub node_uuid: String,
}

impl Checkpointer {
    pub fn new(
        store: Arc<dyn MetaStore>,
        backoff: Duration,
        retry_count: usize,
        identity: CheckpointIdentity,
    ) -> Self {
        Checkpointer {
            store,
            backoff: FixedBackoff(backoff),
            retry_count,
            metadata_prefix: identity.metadata_prefix,
            app_name: identity.app_name,
            worker_name: identity.worker_name,
            host_port_addr: identity.host_port_addr,
            node_uuid: identity.node_uuid,
        }
    }

    pub fn vb_key(&self, vb: u16) -> String {
        vb_blob_key(&self.metadata_prefix, &self.app_name, vb)
    }

    /// Fetch the blob at `key`. A missing key counts as a transient failure
    /// and burns the retry budget; use
    /// [`Checkpointer::get_vb_blob_or_absent`] during bootstrap.
    pub async fn get_vb_blob(&self, key: &str) -> Result<(VbucketMetaBlob, u64)> {
        metrics::CHECKPOINT_OPS.with_label_values(&["get"]).inc();
        retry(self.backoff, self.retry_count, || async move {
            match self.store.get(key).await? {
                Some((bytes, cas)) => {
                    let blob: VbucketMetaBlob = serde_json::from_slice(&bytes)?;
                    Ok((blob, cas))
                }
                None => Err(Error::KeyMissing(key.to_owned())),
            }
        })
        .await
    }

    /// Fetch the blob at `key`, tolerating absence. Returns a default blob
    /// with `absent == true` when the key does not exist.
    pub async fn get_vb_blob_or_absent(
        &self,
        key: &str,
    ) -> Result<(VbucketMetaBlob, u64, bool)> {
        metrics::CHECKPOINT_OPS.with_label_values(&["get"]).inc();
        retry(self.backoff, self.retry_count, || async move {
            match self.store.get(key).await? {
                Some((bytes, cas)) => {
                    let blob: VbucketMetaBlob = serde_json::from_slice(&bytes)?;
                    Ok((blob, cas, false))
                }
                None => Ok((VbucketMetaBlob::default(), 0, true)),
            }
        })
        .await
    }

    pub async fn set_vb_blob(&self, key: &str, blob: &VbucketMetaBlob) -> Result<()> {
        metrics::CHECKPOINT_OPS.with_label_values(&["set"]).inc();
        let bytes = serde_json::to_vec(blob)?;
        retry(self.backoff, self.retry_count, || {
            let bytes = bytes.clone();
            async move { self.store.set(key, bytes).await }
        })
        .await
    }

    /// Persist the caller's view of the blob as the checkpoint of a stream
    /// that is stopping: the owner claim is released, the previous owner
    /// filed, and `last_checkpoint_time` stamped. A single whole-document
    /// write, so the seqno fields land atomically with respect to any
    /// history append.
    pub async fn update_checkpoint(&self, key: &str, blob: &mut VbucketMetaBlob) -> Result<()> {
        blob.assigned_worker = String::new();
        blob.current_vb_owner = String::new();
        blob.node_uuid = String::new();
        blob.dcp_stream_status = StreamStatus::Stopped;
        blob.previous_assigned_worker = self.worker_name.clone();
        blob.previous_vb_owner = self.host_port_addr.clone();
        blob.previous_node_uuid = self.node_uuid.clone();
        blob.last_checkpoint_time = Utc::now().to_rfc3339();
        self.set_vb_blob(key, blob).await
    }

    /// Append an ownership-history entry.
    pub async fn append_history(&self, key: &str, entry: OwnershipEntry) -> Result<()> {
        self.append_history_with(key, entry, |_| {}).await
    }

    /// Append an ownership-history entry and apply `mutate` to the rest of
    /// the blob in the same document version. Runs a cas loop; a cas
    /// mismatch counts as a transient failure and goes back through the
    /// retry budget.
    pub async fn append_history_with(
        &self,
        key: &str,
        entry: OwnershipEntry,
        mutate: impl Fn(&mut VbucketMetaBlob) + Send + Sync,
    ) -> Result<()> {
        metrics::CHECKPOINT_OPS
            .with_label_values(&["append_history"])
            .inc();
        let entry = &entry;
        let mutate = &mutate;
        retry(self.backoff, self.retry_count, || async move {
            let (mut blob, cas) = match self.store.get(key).await? {
                Some((bytes, cas)) => (serde_json::from_slice(&bytes)?, cas),
                None => (VbucketMetaBlob::default(), 0),
            };
            blob.ownership_history.push(entry.clone());
            mutate(&mut blob);
            let bytes = serde_json::to_vec(&blob)?;
            self.store.cas(key, cas, bytes).await
        })
        .await
    }

    /// Clear the owner fields so another node may claim the vbucket, filing
    /// the previous owner and a `stopped` history entry. The blob itself is
    /// never deleted.
    pub async fn clear_ownership(&self, key: &str) -> Result<()> {
        let entry = OwnershipEntry::new(
            &self.worker_name,
            &self.host_port_addr,
            StreamStatus::Stopped,
            0,
        );
        self.append_history_with(key, entry, |blob| {
            blob.assigned_worker = String::new();
            blob.current_vb_owner = String::new();
            blob.node_uuid = String::new();
            blob.dcp_stream_status = StreamStatus::Stopped;
            blob.previous_assigned_worker = self.worker_name.clone();
            blob.previous_vb_owner = self.host_port_addr.clone();
            blob.previous_node_uuid = self.node_uuid.clone();
        })
        .await?;
        let (mut blob, _) = self.get_vb_blob(key).await?;
        self.update_checkpoint(key, &mut blob).await
    }
}
