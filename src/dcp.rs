// Copyright 2022 TiKV Project Authors. Licensed under Apache-2.0.

//! The DCP event model and the trait seams over the wire client.
//!
//! The real client lives outside this crate; the consumer only depends on
//! the contracts below, which keeps the whole streaming control plane
//! testable against in-memory fakes.

use std::{collections::HashMap, fmt, sync::Arc};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::errors::{Error, Result};

/// The open-ended end seqno used on every stream request.
pub const END_SEQ_NO: u64 = u64::MAX;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DcpOpcode {
    Mutation,
    Deletion,
    StreamReq,
    StreamEnd,
}

impl DcpOpcode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DcpOpcode::Mutation => "mutation",
            DcpOpcode::Deletion => "deletion",
            DcpOpcode::StreamReq => "streamreq",
            DcpOpcode::StreamEnd => "streamend",
        }
    }
}

impl fmt::Display for DcpOpcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status carried on a STREAMREQ response.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DcpStatus {
    Success,
    KeyEexists,
    Rollback,
    Other(u16),
}

impl fmt::Display for DcpStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DcpStatus::Success => f.write_str("success"),
            DcpStatus::KeyEexists => f.write_str("key_eexists"),
            DcpStatus::Rollback => f.write_str("rollback"),
            DcpStatus::Other(code) => write!(f, "status({})", code),
        }
    }
}

/// Datatype flags on a mutation value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DcpDatatype {
    Raw,
    /// 0x01
    Json,
    /// 0x05
    JsonXattr,
}

/// The upstream failover log for one vbucket: `(vbuuid, seqno)` pairs, most
/// recent epoch first.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FailoverLog(pub Vec<(u64, u64)>);

impl FailoverLog {
    /// The latest `(vbuuid, seqno)` entry. Errors on an empty log so callers
    /// fall back to re-enqueueing the vbucket.
    pub fn latest(&self, vb: u16) -> Result<(u64, u64)> {
        self.0.first().copied().ok_or(Error::EmptyFailoverLog(vb))
    }
}

/// One event drained from a DCP feed.
#[derive(Clone, Debug)]
pub struct DcpEvent {
    pub opcode: DcpOpcode,
    pub vbucket: u16,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub seqno: u64,
    pub cas: u64,
    pub datatype: DcpDatatype,
    pub failover_log: Option<FailoverLog>,
    pub status: DcpStatus,
}

impl Default for DcpEvent {
    fn default() -> Self {
        DcpEvent {
            opcode: DcpOpcode::Mutation,
            vbucket: 0,
            key: Vec::new(),
            value: Vec::new(),
            seqno: 0,
            cas: 0,
            datatype: DcpDatatype::Json,
            failover_log: None,
            status: DcpStatus::Success,
        }
    }
}

/// Parameters of one STREAMREQ call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamRequest {
    pub vb: u16,
    pub opaque: u16,
    pub flags: u32,
    pub vb_uuid: u64,
    pub start_seq_no: u64,
    pub end_seq_no: u64,
    pub snap_start: u64,
    pub snap_end: u64,
}

impl StreamRequest {
    /// The shape every caller uses: opaque mirrors the vbucket, flags zero,
    /// open-ended, snapshot collapsed onto the start.
    pub fn open_ended(vb: u16, vb_uuid: u64, start_seq_no: u64) -> Self {
        StreamRequest {
            vb,
            opaque: vb,
            flags: 0,
            vb_uuid,
            start_seq_no,
            end_seq_no: END_SEQ_NO,
            snap_start: start_seq_no,
            snap_end: start_seq_no,
        }
    }
}

/// Feed names follow `<hostPort>_<kvHost>_<workerName>`.
pub fn feed_name(host_port: &str, kv_host: &str, worker_name: &str) -> String {
    format!("{}_{}_{}", host_port, kv_host, worker_name)
}

/// One DCP connection to a KV host, multiplexing streams for every vbucket
/// that host serves.
#[async_trait]
pub trait DcpFeed: Send + Sync {
    async fn request_stream(&self, req: StreamRequest) -> Result<()>;
    async fn close_stream(&self, vb: u16, opaque: u16) -> Result<()>;
    /// Tear the whole feed down; its event channel closes afterwards.
    fn close(&self);
    fn name(&self) -> &str;
}

/// The upstream DCP client.
#[async_trait]
pub trait DcpClient: Send + Sync + 'static {
    /// Refresh and return the `vb -> kv host` map.
    async fn refresh_vb_map(&self) -> Result<HashMap<u16, String>>;
    /// Open a named feed against `kv_host`. The receiver carries every event
    /// the feed produces, in source order.
    async fn start_feed(
        &self,
        name: String,
        kv_host: &str,
    ) -> Result<(Arc<dyn DcpFeed>, mpsc::Receiver<DcpEvent>)>;
    /// Fetch the current failover log for `vb`.
    async fn failover_log(&self, vb: u16) -> Result<FailoverLog>;
    /// Current high seqno per vbucket, used by the `from_now` stream
    /// boundary.
    async fn high_seqnos(&self) -> Result<HashMap<u16, u64>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failover_log_latest() {
        let flog = FailoverLog(vec![(77, 100), (42, 20)]);
        assert_eq!(flog.latest(3).unwrap(), (77, 100));
        assert!(matches!(
            FailoverLog::default().latest(3),
            Err(Error::EmptyFailoverLog(3))
        ));
    }

    #[test]
    fn test_open_ended_request_shape() {
        let req = StreamRequest::open_ended(9, 77, 500);
        assert_eq!(req.opaque, 9);
        assert_eq!(req.flags, 0);
        assert_eq!(req.end_seq_no, END_SEQ_NO);
        assert_eq!((req.snap_start, req.snap_end), (500, 500));
    }

    #[test]
    fn test_feed_name() {
        assert_eq!(
            feed_name("10.1.1.2:8096", "10.1.1.5:11210", "worker_3"),
            "10.1.1.2:8096_10.1.1.5:11210_worker_3"
        );
    }
}
