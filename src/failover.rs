// Copyright 2022 TiKV Project Authors. Licensed under Apache-2.0.

//! The failover-log handler: drains stream-protocol outcomes posted by the
//! router and decides retry versus accept. Retries re-read the persisted
//! blob, fetch a fresh failover log, persist the new vbuuid, and queue a
//! new stream request; a ROLLBACK honours the server-dictated rewind point.

use tokio::sync::mpsc;

use crate::{
    consumer::{Consumer, StreamRequestInfo, VbFlogEntry},
    dcp::DcpStatus,
    errors::{Error, Result},
    utils::{retry, FixedBackoff},
};

pub(crate) async fn run(
    consumer: Consumer,
    mut entries: mpsc::Receiver<VbFlogEntry>,
    mut stop: mpsc::Receiver<()>,
) -> Result<()> {
    let worker = consumer.config.worker_name.clone();
    loop {
        tokio::select! {
            _ = stop.recv() => {
                info!("exiting failover log handling routine"; "worker" => %worker);
                return Ok(());
            }
            entry = entries.recv() => {
                let entry = match entry {
                    Some(entry) => entry,
                    None => {
                        info!("failover log channel closed"; "worker" => %worker);
                        return Ok(());
                    }
                };
                on_entry(&consumer, entry).await?;
            }
        }
    }
}

async fn on_entry(consumer: &Consumer, entry: VbFlogEntry) -> Result<()> {
    let worker = &consumer.config.worker_name;
    let vb = entry.vb;
    debug!("got entry from failover log channel";
        "worker" => %worker, "vb" => vb, "status" => %entry.status,
        "retry" => entry.stream_req_retry, "stream_end" => entry.signal_stream_end);

    if consumer.inflight_dcp_streams.remove(&vb).is_some() {
        debug!("purged entry from inflight_dcp_streams"; "worker" => %worker, "vb" => vb);
    }

    if entry.signal_stream_end {
        info!("stream end acknowledged"; "worker" => %worker, "vb" => vb);
        return Ok(());
    }

    if !entry.stream_req_retry && entry.status == DcpStatus::Success {
        info!("dcp stream created"; "worker" => %worker, "vb" => vb);
        return Ok(());
    }

    if !entry.stream_req_retry {
        return Ok(());
    }

    let key = consumer.checkpointer.vb_key(vb);
    let (mut blob, _cas, _absent) = consumer.checkpointer.get_vb_blob_or_absent(&key).await?;

    let flog = retry(
        FixedBackoff(consumer.config.bucket_op_backoff),
        consumer.config.retry_count,
        || async move { consumer.dcp.failover_log(vb).await },
    )
    .await?;

    let (vb_uuid, latest_seq_no) = match flog.latest(vb) {
        Ok(latest) => latest,
        Err(err) => {
            err.report(format_args!("reading failover log of vb {}", vb));
            consumer.push_vb_to_restream(vb);
            return Ok(());
        }
    };
    blob.vb_uuid = vb_uuid;

    let start_seq_no = if entry.status == DcpStatus::Rollback {
        info!("rollback requested by dcp, honouring server-dictated seqno";
            "worker" => %worker, "vb" => vb, "vb_uuid" => vb_uuid,
            "rollback_seq_no" => entry.seq_no, "flog_seq_no" => latest_seq_no);
        entry.seq_no
    } else {
        info!("retrying dcp stream start";
            "worker" => %worker, "vb" => vb, "vb_uuid" => vb_uuid, "start_seq_no" => latest_seq_no);
        latest_seq_no
    };

    if consumer.check_if_already_enqueued(vb) {
        return Ok(());
    }
    consumer.add_to_enqueue_map(vb);

    // The stream will resume from `start_seq_no`; the checkpoint written on
    // the next STREAMREQ success must agree, notably after a rewind.
    blob.last_processed_seq_no = start_seq_no;
    consumer.state.update(vb, |s| {
        s.start_seq_no = start_seq_no;
        s.last_processed_seq_no = start_seq_no;
        s.timestamp = chrono::Utc::now().to_rfc3339();
    });
    consumer
        .req_stream_tx
        .send(StreamRequestInfo {
            vb,
            vb_blob: blob,
            start_seq_no,
        })
        .await
        .map_err(|_| Error::ChannelClosed("req_stream"))
}
