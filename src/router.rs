// Copyright 2022 TiKV Project Authors. Licensed under Apache-2.0.

//! The event router: a single task draining the aggregated DCP channel,
//! classifying events by opcode, updating per-vbucket state, checkpointing,
//! and handing mutations and deletions to the JS execution worker.
//!
//! Mutations carrying the handler's own xattr are suppressed when both the
//! cas and the crc32 digest match what this handler last wrote, which stops
//! a handler from recursing over its own output.

use std::{sync::atomic::Ordering, time::Duration};

use byteorder::{BigEndian, ByteOrder};
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::{
    consumer::{Consumer, FilterData, VbFlogEntry},
    dcp::{DcpDatatype, DcpEvent, DcpOpcode, DcpStatus},
    errors::{Error, Result},
    metadata::{OwnershipEntry, StreamStatus},
    metrics,
    utils::condense,
    worker::TimerEvent,
};

/// Sleep quantum while a downstream worker queue is over its cap.
const BACKPRESSURE_QUANTUM: Duration = Duration::from_millis(10);
/// Sleep quantum while waiting for the stream request processor to finish
/// persisting the `requested` history entry.
const METADATA_WAIT_QUANTUM: Duration = Duration::from_secs(1);

pub(crate) async fn run(
    consumer: Consumer,
    mut agg_feed: mpsc::Receiver<DcpEvent>,
    mut filter_data: mpsc::Receiver<FilterData>,
    mut timers: mpsc::Receiver<TimerEvent>,
    mut stop: mpsc::Receiver<()>,
) -> Result<()> {
    let worker = consumer.config.worker_name.clone();
    let mut stats_tick = tokio::time::interval(consumer.config.stats_tick_interval);
    stats_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    stats_tick.tick().await; // the first tick completes immediately

    loop {
        let sizes = consumer.sink.queue_sizes();
        if sizes.agg_queue_size > consumer.config.worker_queue_cap
            || sizes.timer_queue_size > consumer.config.timer_queue_cap
            || sizes.agg_queue_mem > consumer.config.worker_queue_mem_cap
        {
            tokio::time::sleep(BACKPRESSURE_QUANTUM).await;
        }

        tokio::select! {
            _ = stop.recv() => {
                info!("exiting event router routine"; "worker" => %worker);
                return Ok(());
            }
            event = agg_feed.recv() => {
                let event = match event {
                    Some(event) => event,
                    None => {
                        info!("aggregated dcp channel closed"; "worker" => %worker);
                        let _ = consumer.stop_checkpointing_tx.try_send(());
                        return Ok(());
                    }
                };
                let bytes = event.value.len() as i64;
                consumer.agg_feed_bytes.fetch_sub(bytes, Ordering::Relaxed);
                metrics::AGG_FEED_BYTES.sub(bytes);
                on_event(&consumer, event).await?;
            }
            fd = filter_data.recv() => {
                let fd = match fd {
                    Some(fd) => fd,
                    None => {
                        info!("filter data channel closed"; "worker" => %worker);
                        let _ = consumer.stop_checkpointing_tx.try_send(());
                        return Ok(());
                    }
                };
                on_filter_data(&consumer, fd).await?;
            }
            timer = timers.recv() => {
                if let Some(timer) = timer {
                    consumer.counters.timers.fetch_add(1, Ordering::Relaxed);
                    metrics::EVENTS_FORWARDED.with_label_values(&["timer"]).inc();
                    consumer.sink.send_timer(&timer);
                }
            }
            _ = stats_tick.tick() => {
                on_stats_tick(&consumer);
            }
        }
    }
}

async fn on_event(consumer: &Consumer, event: DcpEvent) -> Result<()> {
    consumer.counters.note_dcp_message(event.opcode.as_str());
    metrics::DCP_MESSAGES_PROCESSED
        .with_label_values(&[event.opcode.as_str()])
        .inc();

    match event.opcode {
        DcpOpcode::Mutation => on_mutation(consumer, event),
        DcpOpcode::Deletion => on_deletion(consumer, event),
        DcpOpcode::StreamReq => on_stream_req(consumer, event).await?,
        DcpOpcode::StreamEnd => on_stream_end(consumer, event).await?,
    }
    Ok(())
}

fn on_mutation(consumer: &Consumer, mut event: DcpEvent) {
    let vb = event.vbucket;
    if consumer.filter_vb_events.contains(&vb) {
        metrics::EVENTS_SUPPRESSED
            .with_label_values(&["filtered"])
            .inc();
        return;
    }
    consumer
        .state
        .update(vb, |s| s.last_read_seq_no = event.seqno);
    trace!("got DCP_MUTATION"; "vb" => vb, "seqno" => event.seqno, "datatype" => ?event.datatype);

    match event.datatype {
        DcpDatatype::Json => forward_mutation(consumer, &event),
        DcpDatatype::JsonXattr => {
            let uuid = consumer.config.handler_uuid.to_string();
            match parse_eventing_xattr(&event.value, &uuid) {
                None => {
                    warn!("malformed xattr section, forwarding value untouched";
                        "vb" => vb, "seqno" => event.seqno);
                    forward_mutation(consumer, &event);
                }
                Some((strip, Some(meta))) if !meta.cas.is_empty() => {
                    let cas = match parse_cas(&meta.cas) {
                        Ok(cas) => cas,
                        Err(err) => {
                            warn!("failed to decode cas from eventing xattr";
                                "vb" => vb, "cas" => %meta.cas, "err" => %err);
                            return;
                        }
                    };
                    if cas == event.cas {
                        metrics::EVENTS_SUPPRESSED
                            .with_label_values(&["recursion"])
                            .inc();
                        consumer.counters.suppressed.fetch_add(1, Ordering::Relaxed);
                        return;
                    }
                    event.value.drain(..strip);
                    if crc32fast::hash(&event.value) == meta.digest {
                        metrics::EVENTS_SUPPRESSED
                            .with_label_values(&["recursion"])
                            .inc();
                        consumer.counters.suppressed.fetch_add(1, Ordering::Relaxed);
                        return;
                    }
                    forward_mutation(consumer, &event);
                }
                Some((strip, _)) => {
                    // No eventing xattr on the doc: strip the region and
                    // forward unconditionally.
                    event.value.drain(..strip);
                    forward_mutation(consumer, &event);
                }
            }
        }
        DcpDatatype::Raw => {}
    }
}

fn forward_mutation(consumer: &Consumer, event: &DcpEvent) {
    consumer.counters.mutations.fetch_add(1, Ordering::Relaxed);
    metrics::EVENTS_FORWARDED
        .with_label_values(&["mutation"])
        .inc();
    consumer.sink.send_mutation(event);
}

fn on_deletion(consumer: &Consumer, event: DcpEvent) {
    let vb = event.vbucket;
    if consumer.filter_vb_events.contains(&vb) {
        metrics::EVENTS_SUPPRESSED
            .with_label_values(&["filtered"])
            .inc();
        return;
    }
    consumer
        .state
        .update(vb, |s| s.last_read_seq_no = event.seqno);
    consumer.counters.deletions.fetch_add(1, Ordering::Relaxed);
    metrics::EVENTS_FORWARDED
        .with_label_values(&["deletion"])
        .inc();
    consumer.sink.send_deletion(&event);
}

async fn on_stream_req(consumer: &Consumer, event: DcpEvent) -> Result<()> {
    let worker = &consumer.config.worker_name;
    let vb = event.vbucket;
    info!("got STREAMREQ response"; "worker" => %worker, "vb" => vb, "status" => %event.status);

    // The stream request processor persists the `requested` history entry
    // after issuing the STREAMREQ; the response may beat that write here.
    // Hold this event until the metadata is durable so the persisted vbuuid
    // always reflects the request that produced this response.
    loop {
        let updated = consumer
            .state
            .read(vb, |s| s.vb_stream_request_metadata_updated);
        if updated {
            consumer
                .state
                .update(vb, |s| s.vb_stream_request_metadata_updated = false);
            break;
        }
        debug!("waiting for stream request metadata to persist"; "worker" => %worker, "vb" => vb);
        tokio::time::sleep(METADATA_WAIT_QUANTUM).await;
    }

    match event.status {
        DcpStatus::Success => {
            let key = consumer.checkpointer.vb_key(vb);
            let latest = event
                .failover_log
                .as_ref()
                .and_then(|flog| flog.latest(vb).ok());
            let vb_flog = VbFlogEntry {
                vb,
                status: DcpStatus::Success,
                stream_req_retry: false,
                signal_stream_end: false,
                failover_log: None,
                seq_no: 0,
            };
            let (vb_uuid, _) = match latest {
                Some(latest) => latest,
                None => {
                    warn!("STREAMREQ success without usable failover log"; "worker" => %worker, "vb" => vb);
                    return send_flog(consumer, vb_flog).await;
                }
            };
            consumer.state.update(vb, |s| s.vb_uuid = vb_uuid);

            let start_seq_no = consumer.state.read(vb, |s| s.last_processed_seq_no);
            let entry = OwnershipEntry::new(
                worker,
                &consumer.config.host_port_addr,
                StreamStatus::Running,
                start_seq_no,
            );
            let config = &consumer.config;
            consumer
                .checkpointer
                .append_history_with(&key, entry, |blob| {
                    blob.assigned_worker = config.worker_name.clone();
                    blob.current_vb_owner = config.host_port_addr.clone();
                    blob.node_uuid = config.node_uuid.clone();
                    blob.vb_uuid = vb_uuid;
                    blob.dcp_stream_status = StreamStatus::Running;
                    blob.last_processed_seq_no = start_seq_no;
                })
                .await?;

            consumer.state.update(vb, |s| {
                s.assigned_worker = config.worker_name.clone();
                s.current_vb_owner = config.host_port_addr.clone();
                s.node_uuid = config.node_uuid.clone();
                s.host_name = config.host_port_addr.clone();
                s.dcp_stream_status = StreamStatus::Running;
                s.ever_owned_vb = true;
                s.last_checkpointed_seq_no = start_seq_no;
                s.dcp_stream_requested_worker = config.worker_name.clone();
                s.dcp_stream_requested_node_uuid = config.node_uuid.clone();
                s.timestamp = chrono::Utc::now().to_rfc3339();
            });

            // The plan may have moved on while the request was in flight.
            if !consumer.should_own(vb) {
                consumer.push_vb_to_close(vb);
                consumer.filter_vb_events.insert(vb);
                info!("vb acquired but no longer assigned here, queueing close";
                    "worker" => %worker, "vb" => vb);
            }
            send_flog(consumer, vb_flog).await
        }
        DcpStatus::KeyEexists => {
            send_flog(
                consumer,
                VbFlogEntry {
                    vb,
                    status: DcpStatus::KeyEexists,
                    stream_req_retry: false,
                    signal_stream_end: false,
                    failover_log: None,
                    seq_no: 0,
                },
            )
            .await
        }
        status => {
            if consumer.vb_stream_requested.remove(&vb).is_some() {
                info!("STREAMREQ failed, purged entry from vb_stream_requested";
                    "worker" => %worker, "vb" => vb);
            }
            let entry = OwnershipEntry::new(
                worker,
                &consumer.config.host_port_addr,
                StreamStatus::RequestFailed,
                0,
            );
            let key = consumer.checkpointer.vb_key(vb);
            consumer.checkpointer.append_history(&key, entry).await?;
            send_flog(
                consumer,
                VbFlogEntry {
                    vb,
                    status,
                    stream_req_retry: true,
                    signal_stream_end: false,
                    failover_log: event.failover_log.clone(),
                    seq_no: event.seqno,
                },
            )
            .await
        }
    }
}

async fn on_stream_end(consumer: &Consumer, event: DcpEvent) -> Result<()> {
    let vb = event.vbucket;
    info!("got STREAMEND"; "worker" => %consumer.config.worker_name, "vb" => vb);
    let last_read = consumer.state.read(vb, |s| s.last_read_seq_no);
    consumer.state.update(vb, |s| {
        s.seq_no_at_stream_end = last_read;
        s.timestamp = chrono::Utc::now().to_rfc3339();
    });
    consumer
        .filter_data_tx
        .send(FilterData {
            vb,
            seq_no: last_read,
        })
        .await
        .map_err(|_| Error::ChannelClosed("filter_data"))
}

async fn on_filter_data(consumer: &Consumer, fd: FilterData) -> Result<()> {
    let worker = &consumer.config.worker_name;
    let vb = fd.vb;
    info!("received on filter data channel"; "worker" => %worker, "vb" => vb, "seq_no" => fd.seq_no);

    if consumer.vb_stream_requested.remove(&vb).is_some() {
        debug!("purged entry from vb_stream_requested"; "worker" => %worker, "vb" => vb);
    }

    if consumer.config.free_timer_store_on_stream_end {
        // Hook for releasing the vbucket's timer store; stays inert until
        // the timer store grows a dormant API.
        debug!("timer store release requested but the hook is disabled"; "vb" => vb);
    }

    let key = consumer.checkpointer.vb_key(vb);
    let last_read = consumer.state.read(vb, |s| s.last_read_seq_no);
    let entry = OwnershipEntry::new(
        worker,
        &consumer.config.host_port_addr,
        StreamStatus::Stopped,
        last_read,
    );
    consumer.checkpointer.append_history(&key, entry).await?;

    consumer.filter_vb_events.remove(&vb);
    consumer
        .state
        .update(vb, |s| s.last_processed_seq_no = fd.seq_no);

    let (mut blob, _) = consumer.checkpointer.get_vb_blob(&key).await?;
    blob.last_processed_seq_no = fd.seq_no;
    blob.seq_no_at_stream_end = consumer.state.read(vb, |s| s.seq_no_at_stream_end);
    consumer.checkpointer.update_checkpoint(&key, &mut blob).await?;

    consumer.state.update(vb, |s| {
        s.assigned_worker = String::new();
        s.current_vb_owner = String::new();
        s.node_uuid = String::new();
        s.dcp_stream_status = StreamStatus::Stopped;
    });

    if consumer.should_own(vb) {
        info!("stream ended but plan still assigns vb here, reclaiming";
            "worker" => %worker, "vb" => vb);
        send_flog(
            consumer,
            VbFlogEntry {
                vb,
                status: DcpStatus::Success,
                stream_req_retry: false,
                signal_stream_end: true,
                failover_log: None,
                seq_no: 0,
            },
        )
        .await?;

        if consumer.inflight_dcp_streams.remove(&vb).is_some() {
            debug!("purged entry from inflight_dcp_streams"; "worker" => %worker, "vb" => vb);
        }

        let (mut blob, _) = consumer.checkpointer.get_vb_blob(&key).await?;
        consumer.checkpointer.update_checkpoint(&key, &mut blob).await?;
        consumer.push_vb_to_restream(vb);
    }
    Ok(())
}

async fn send_flog(consumer: &Consumer, entry: VbFlogEntry) -> Result<()> {
    debug!("posting entry to failover log channel"; "vb" => entry.vb, "status" => %entry.status);
    consumer
        .vb_flog_tx
        .send(entry)
        .await
        .map_err(|_| Error::ChannelClosed("vb_flog"))
}

fn on_stats_tick(consumer: &Consumer) {
    let owned = consumer.owned_vbs();
    if owned.is_empty() {
        return;
    }
    info!("consumer processing counters";
        "worker" => %consumer.config.worker_name,
        "dcp_ops" => consumer.counters.dcp_ops_total(),
        "mutations" => consumer.counters.mutations.load(Ordering::Relaxed),
        "deletions" => consumer.counters.deletions.load(Ordering::Relaxed),
        "timers" => consumer.counters.timers.load(Ordering::Relaxed),
        "suppressed" => consumer.counters.suppressed.load(Ordering::Relaxed),
        "vbs_owned" => owned.len(),
        "vbs" => %condense(&owned));
}

/// The object a handler writes into its own xattr frame.
#[derive(Clone, Debug, Default, Deserialize)]
pub(crate) struct XattrMetadata {
    #[serde(default)]
    pub cas: String,
    #[serde(default)]
    pub digest: u32,
}

/// Decode the leading xattr section of a `json+xattr` value.
///
/// Layout: a 4-byte big-endian total length `L`, then an io-vector of
/// `{4-byte big-endian frame length F; F bytes = key NUL value NUL}` pairs.
/// The frame whose key equals the ASCII handler uuid carries the eventing
/// metadata as JSON after the separator byte.
///
/// Returns `(strip_offset, eventing_metadata)` where `value[strip_offset..]`
/// is the document body, or `None` when the section is malformed.
pub(crate) fn parse_eventing_xattr(
    value: &[u8],
    uuid: &str,
) -> Option<(usize, Option<XattrMetadata>)> {
    if value.len() < 4 {
        return None;
    }
    let total = BigEndian::read_u32(&value[..4]) as usize;
    if total == 0 || value.len() < 4 + total {
        return None;
    }
    let strip = 4 + total;
    let mut data = &value[4..4 + total - 1];
    let mut found = None;
    let mut decoded = 0usize;

    while decoded < total {
        if data.len() < 4 {
            break;
        }
        let frame_len = BigEndian::read_u32(&data[..4]) as usize;
        decoded += 4;
        if frame_len == 0 || data.len() < 4 + frame_len - 1 {
            break;
        }
        let frame = &data[4..4 + frame_len - 1];
        decoded += frame_len;
        if frame.len() > uuid.len() && &frame[..uuid.len()] == uuid.as_bytes() {
            let to_parse = &frame[uuid.len() + 1..];
            if let Ok(meta) = serde_json::from_slice::<XattrMetadata>(to_parse) {
                found = Some(meta);
            }
        }
        if decoded < total {
            if data.len() < 4 + frame_len {
                break;
            }
            data = &data[4 + frame_len..];
        }
    }
    Some((strip, found))
}

/// Decode the cas a handler stamped into its xattr, a `0x`-prefixed hex
/// string.
pub(crate) fn parse_cas(cas: &str) -> Result<u64> {
    let digits = cas.strip_prefix("0x").unwrap_or(cas);
    u64::from_str_radix(digits, 16)
        .map_err(|err| Error::Other(format!("bad cas {:?}: {}", cas, err)))
}
