// Copyright 2022 TiKV Project Authors. Licensed under Apache-2.0.

//! The in-memory per-vbucket runtime state store.
//!
//! One mutex per vbucket: readers and the single writer of a given vbucket
//! serialise on that entry alone, and writes to distinct vbuckets never
//! contend. Nothing here is persisted; the checkpointer reflects selected
//! fields to the metadata bucket.

use std::sync::Mutex;

use crate::metadata::StreamStatus;

/// Runtime attributes of one vbucket.
#[derive(Clone, Debug, Default)]
pub struct VbRuntimeState {
    pub last_read_seq_no: u64,
    pub last_processed_seq_no: u64,
    pub last_checkpointed_seq_no: u64,
    pub start_seq_no: u64,
    pub seq_no_at_stream_end: u64,
    pub seq_no_after_close_stream: u64,
    pub vb_uuid: u64,
    pub dcp_stream_status: StreamStatus,
    pub assigned_worker: String,
    pub current_vb_owner: String,
    pub node_uuid: String,
    pub host_name: String,
    pub ever_owned_vb: bool,
    pub dcp_stream_requested: bool,
    pub dcp_stream_requested_worker: String,
    pub dcp_stream_requested_node_uuid: String,
    /// Set by the stream request processor once the `requested` history
    /// entry is durable; the router spin-waits on it before acting on a
    /// STREAMREQ response.
    pub vb_stream_request_metadata_updated: bool,
    pub timestamp: String,
}

pub struct VbStateStore {
    slots: Vec<Mutex<VbRuntimeState>>,
}

impl VbStateStore {
    pub fn new(num_vbuckets: u16) -> Self {
        let mut slots = Vec::with_capacity(num_vbuckets as usize);
        for _ in 0..num_vbuckets {
            slots.push(Mutex::new(VbRuntimeState::default()));
        }
        VbStateStore { slots }
    }

    pub fn num_vbuckets(&self) -> u16 {
        self.slots.len() as u16
    }

    /// Mutate the entry for `vb` under its lock.
    pub fn update<R>(&self, vb: u16, f: impl FnOnce(&mut VbRuntimeState) -> R) -> R {
        let mut guard = self.slots[vb as usize].lock().unwrap();
        f(&mut guard)
    }

    /// Read the entry for `vb` under its lock.
    pub fn read<R>(&self, vb: u16, f: impl FnOnce(&VbRuntimeState) -> R) -> R {
        let guard = self.slots[vb as usize].lock().unwrap();
        f(&guard)
    }

    /// A point-in-time copy of the entry for `vb`.
    pub fn snapshot(&self, vb: u16) -> VbRuntimeState {
        self.read(vb, |s| s.clone())
    }

    /// Vbuckets currently owned by this worker on this node, ascending.
    pub fn owned_vbs(&self, worker: &str, node_uuid: &str) -> Vec<u16> {
        let mut owned = Vec::new();
        for vb in 0..self.slots.len() as u16 {
            let is_owned = self.read(vb, |s| {
                s.assigned_worker == worker && s.node_uuid == node_uuid
            });
            if is_owned {
                owned.push(vb);
            }
        }
        owned
    }
}
