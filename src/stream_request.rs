// Copyright 2022 TiKV Project Authors. Licensed under Apache-2.0.

//! The stream request processor: a single task draining the request
//! channel and issuing DCP STREAMREQs one at a time.

use std::{sync::atomic::Ordering, time::Duration};

use tokio::sync::mpsc;

use crate::{
    consumer::{Consumer, StreamRequestInfo},
    dcp::StreamRequest,
    errors::{Error, Result},
    metadata::{OwnershipEntry, StreamStatus, VbucketMetaBlob},
    metrics,
};

/// Sleep before requeueing a request that raced a running planner round.
const PLANNER_WAIT: Duration = Duration::from_secs(1);

pub(crate) async fn run(
    consumer: Consumer,
    mut requests: mpsc::Receiver<StreamRequestInfo>,
    mut stop: mpsc::Receiver<()>,
) -> Result<()> {
    let worker = consumer.config.worker_name.clone();
    loop {
        tokio::select! {
            _ = stop.recv() => {
                info!("exiting stream request processing routine"; "worker" => %worker);
                return Ok(());
            }
            msg = requests.recv() => {
                let msg = match msg {
                    Some(msg) => msg,
                    None => {
                        info!("stream request channel closed"; "worker" => %worker);
                        return Ok(());
                    }
                };
                process_request(&consumer, msg).await?;
            }
        }
    }
}

async fn process_request(consumer: &Consumer, msg: StreamRequestInfo) -> Result<()> {
    let worker = &consumer.config.worker_name;
    let vb = msg.vb;
    debug!("got request to stream"; "worker" => %worker, "vb" => vb, "start_seq_no" => msg.start_seq_no);

    consumer.delete_from_enqueue_map(vb);

    if !consumer.should_own(vb) {
        info!("skipping stream request, plan assigns vb elsewhere"; "worker" => %worker, "vb" => vb);
        return match consumer.cleanup_vb_metadata(vb).await {
            Err(Error::RetryTimeout) => Err(Error::RetryTimeout),
            Err(err) => {
                err.report(format_args!("cleaning up metadata of vb {}", vb));
                Ok(())
            }
            Ok(()) => Ok(()),
        };
    }

    if consumer.vb_owned_by_self(vb) {
        debug!("skipping stream request, vb already owned"; "worker" => %worker, "vb" => vb);
        return Ok(());
    }

    if consumer.planner.is_running() {
        info!("planner running, requeueing vb"; "worker" => %worker, "vb" => vb);
        tokio::time::sleep(PLANNER_WAIT).await;
        consumer.push_vb_to_restream(vb);
        consumer.push_vb_to_cleanup(vb);
        return Ok(());
    }

    if consumer.inflight_dcp_streams.contains(&vb) {
        debug!("skipping stream request, one already in flight"; "worker" => %worker, "vb" => vb);
        return Ok(());
    }

    // STREAMREQ issuing is serialised: finish this one before taking the
    // next item off the channel.
    match dcp_request_stream_handle(consumer, vb, &msg.vb_blob, msg.start_seq_no).await {
        Ok(()) => {
            debug!("dcp stream successfully requested"; "worker" => %worker, "vb" => vb);
            Ok(())
        }
        Err(Error::RetryTimeout) => Err(Error::RetryTimeout),
        Err(err) => {
            err.report(format_args!("requesting stream for vb {}", vb));
            consumer.push_vb_to_restream(vb);
            Ok(())
        }
    }
}

/// Issue one DCP STREAMREQ for `vb`, creating the host feed on demand.
///
/// On success `vb` sits in `inflight_dcp_streams`, a `requested` history
/// entry is durable, and the metadata-updated flag is set for the router.
/// On failure the vbucket is returned to the restream queue when the plan
/// still assigns it here; an invalid-vbucket error propagates untouched,
/// any other stream error additionally drops the feed and its host mapping.
pub(crate) async fn dcp_request_stream_handle(
    consumer: &Consumer,
    vb: u16,
    vb_blob: &VbucketMetaBlob,
    start_seq_no: u64,
) -> Result<()> {
    let worker = &consumer.config.worker_name;
    if consumer.is_terminate_running.load(Ordering::SeqCst) {
        return Ok(());
    }

    consumer.refresh_kv_vb_map().await?;
    let kv_host = consumer.kv_host_of(vb).ok_or(Error::NoKvHost(vb))?;

    // Closing feeds for KV hosts no longer present in the vb map.
    consumer.cleanup_stale_feeds().await?;

    let feed = consumer.ensure_feed(&kv_host).await?;
    consumer.feeds.bind_vb(vb, feed.clone());

    if consumer.dcp_feeds_closed.load(Ordering::SeqCst) {
        return Err(Error::FeedsClosed);
    }

    if !consumer.vb_stream_requested.insert(vb) {
        info!("skipping DcpRequestStream call, one already in progress";
            "worker" => %worker, "vb" => vb);
        return Ok(());
    }

    if consumer.is_terminate_running.load(Ordering::SeqCst) {
        consumer.vb_stream_requested.remove(&vb);
        return Err(Error::Terminating);
    }

    info!("issuing dcp stream request";
        "worker" => %worker, "vb" => vb, "kv_host" => %kv_host,
        "vb_uuid" => vb_blob.vb_uuid, "start_seq_no" => start_seq_no);
    consumer.counters.stream_reqs.fetch_add(1, Ordering::Relaxed);

    let req = StreamRequest::open_ended(vb, vb_blob.vb_uuid, start_seq_no);
    match feed.request_stream(req).await {
        Err(err) => {
            consumer
                .counters
                .stream_req_errs
                .fetch_add(1, Ordering::Relaxed);
            metrics::STREAM_REQUESTS.with_label_values(&["err"]).inc();
            warn!("STREAMREQ call failed on feed";
                "worker" => %worker, "vb" => vb, "feed" => feed.name(), "err" => %err);

            consumer.vb_stream_requested.remove(&vb);
            if consumer.should_own(vb) {
                consumer.push_vb_to_restream(vb);
            }
            if let Error::InvalidVbucket(_) = err {
                return Err(err);
            }
            feed.close();
            consumer.feeds.remove_host(&kv_host);
            info!("closed and dropped feed mapping after failed STREAMREQ";
                "worker" => %worker, "vb" => vb, "kv_host" => %kv_host);
            Err(err)
        }
        Ok(()) => {
            metrics::STREAM_REQUESTS.with_label_values(&["ok"]).inc();
            consumer.inflight_dcp_streams.insert(vb);

            let entry = OwnershipEntry::new(
                worker,
                &consumer.config.host_port_addr,
                StreamStatus::Requested,
                start_seq_no,
            );
            let key = consumer.checkpointer.vb_key(vb);
            consumer.checkpointer.append_history(&key, entry).await?;

            consumer.state.update(vb, |s| {
                s.vb_stream_request_metadata_updated = true;
                s.dcp_stream_requested = true;
                s.dcp_stream_requested_worker = worker.clone();
                s.dcp_stream_requested_node_uuid = consumer.config.node_uuid.clone();
            });
            debug!("checkpoint updated to record issued STREAMREQ"; "worker" => %worker, "vb" => vb);
            Ok(())
        }
    }
}
