// Copyright 2022 TiKV Project Authors. Licensed under Apache-2.0.

//! The control routine: one task multiplexing cluster-state changes,
//! settings changes, the restart-stream tick, and shutdown.

use std::sync::atomic::Ordering;

use tokio::sync::mpsc;

use crate::{
    config::Settings,
    consumer::Consumer,
    errors::{Error, Result},
    logging,
    utils::{condense, retry, vbs_diff, FixedBackoff},
};

/// Bound on the in-tick retry of the restream queue. Work left after this
/// many passes stays queued for the next tick instead of spinning on a
/// persistently oscillating plan.
const RESTREAM_RETRY_MAX: usize = 8;

pub(crate) async fn run(
    consumer: Consumer,
    mut cluster_change: mpsc::Receiver<()>,
    mut settings_change: mpsc::Receiver<()>,
    mut stop: mpsc::Receiver<()>,
) -> Result<()> {
    let worker = consumer.config.worker_name.clone();
    let mut restart_tick = tokio::time::interval(consumer.config.restart_tick_interval);
    restart_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    restart_tick.tick().await; // the first tick completes immediately

    loop {
        tokio::select! {
            _ = stop.recv() => {
                info!("exiting control routine"; "worker" => %worker);
                return Ok(());
            }
            notified = cluster_change.recv() => {
                if notified.is_none() {
                    return Ok(());
                }
                on_cluster_state_change(&consumer).await?;
            }
            notified = settings_change.recv() => {
                if notified.is_none() {
                    return Ok(());
                }
                on_settings_change(&consumer).await;
            }
            _ = restart_tick.tick() => {
                on_restart_tick(&consumer).await?;
            }
        }
    }
}

async fn on_cluster_state_change(consumer: &Consumer) -> Result<()> {
    let worker = &consumer.config.worker_name;
    info!("got notification that cluster state has changed"; "worker" => %worker);

    retry(
        FixedBackoff(consumer.config.cluster_op_backoff),
        consumer.config.retry_count,
        || async move { consumer.planner.eventing_node_addrs().await },
    )
    .await?;

    // Fresh stop channels for the giveup/takeover routines of this round.
    let giveup = consumer.giveup_routine_count.load(Ordering::Relaxed).max(1);
    let takeover = consumer
        .takeover_routine_count
        .load(Ordering::Relaxed)
        .max(1);
    let (giveup_tx, giveup_rx) = mpsc::channel(giveup);
    let (takeover_tx, takeover_rx) = mpsc::channel(takeover);
    *consumer.giveup_stop_tx.lock().unwrap() = Some(giveup_tx);
    *consumer.giveup_stop_rx.lock().unwrap() = Some(giveup_rx);
    *consumer.takeover_stop_tx.lock().unwrap() = Some(takeover_tx);
    *consumer.takeover_stop_rx.lock().unwrap() = Some(takeover_rx);

    consumer.vbs_stream_closed.clear();
    consumer.is_rebalance_ongoing.store(true, Ordering::SeqCst);
    let update_running = consumer.vbs_state_update_running.load(Ordering::SeqCst);
    info!("updated rebalance state";
        "worker" => %worker, "is_rebalance_ongoing" => true, "vbs_state_update_running" => update_running);

    if !update_running {
        info!("kicking off vbs state update routine"; "worker" => %worker);
        let _ = consumer.vbs_state_update_tx.try_send(());
    }
    Ok(())
}

async fn on_settings_change(consumer: &Consumer) {
    let worker = &consumer.config.worker_name;
    info!("got notification for settings change"; "worker" => %worker);

    let path = consumer.config.settings_path();
    let data = match consumer.config_store.get(&path).await {
        Ok(data) => data,
        Err(err) => {
            err.report(format_args!("fetching settings from {}", path));
            return;
        }
    };
    let settings = match Settings::parse(&data) {
        Ok(settings) => settings,
        Err(err) => {
            err.report(format_args!("unmarshalling settings from {}", path));
            return;
        }
    };

    if let Some(value) = settings.log_level {
        match value.as_str() {
            Some(level) => {
                logging::set_level(logging::parse_level(level));
                *consumer.log_level.write().unwrap() = level.to_owned();
                consumer.sink.send_log_level(level);
                info!("applied log_level setting"; "worker" => %worker, "log_level" => level);
            }
            None => warn!("log_level setting has wrong type, ignoring"; "value" => %value),
        }
    }
    apply_count_setting(
        &settings.skip_timer_threshold,
        "skip_timer_threshold",
        |v| consumer.skip_timer_threshold.store(v, Ordering::Relaxed),
    );
    apply_count_setting(
        &settings.vb_ownership_giveup_routine_count,
        "vb_ownership_giveup_routine_count",
        |v| consumer.giveup_routine_count.store(v, Ordering::Relaxed),
    );
    apply_count_setting(
        &settings.vb_ownership_takeover_routine_count,
        "vb_ownership_takeover_routine_count",
        |v| consumer.takeover_routine_count.store(v, Ordering::Relaxed),
    );
}

fn apply_count_setting(
    value: &Option<serde_json::Value>,
    name: &str,
    apply: impl FnOnce(usize),
) {
    if let Some(value) = value {
        match value.as_u64() {
            Some(v) => apply(v as usize),
            None => warn!("setting has wrong type, ignoring"; "setting" => name, "value" => %value),
        }
    }
}

async fn on_restart_tick(consumer: &Consumer) -> Result<()> {
    let worker = &consumer.config.worker_name;
    let mut pass = 0usize;

    loop {
        let mut vbs_to_restream = consumer.vbs_remaining_to_restream();
        let vbs_to_close = consumer.vbs_remaining_to_close();
        if vbs_to_restream.is_empty() && vbs_to_close.is_empty() {
            return Ok(());
        }

        // QE flushes the source bucket right after undeploy; do not reopen
        // streams for an app that is gone.
        let deployed = consumer.planner.is_deployed(&consumer.config.app_name);
        if !deployed && !consumer.is_bootstrapping.load(Ordering::SeqCst) {
            {
                consumer.vbs_remaining_to_restream.lock().unwrap().clear();
                consumer.vbs_remaining_to_close.lock().unwrap().clear();
            }
            info!("discarding restream and close queues, app undeployed";
                "worker" => %worker,
                "to_restream" => %condense(&vbs_to_restream),
                "to_close" => %condense(&vbs_to_close));
            return Ok(());
        }

        close_pending_streams(consumer, vbs_to_close).await?;

        vbs_to_restream.sort_unstable();
        info!("vbs remaining to restream"; "worker" => %worker,
            "len" => vbs_to_restream.len(), "vbs" => %condense(&vbs_to_restream));

        let mut failed: Vec<u16> = Vec::new();
        for &vb in &vbs_to_restream {
            if consumer.vb_owned_by_self(vb) {
                continue;
            }
            // During an eventing+kv swap rebalance a STREAMEND from an
            // outgoing KV node queues the vb here even though the fresh plan
            // may not assign it to this worker any more.
            if !consumer.should_own(vb) {
                continue;
            }

            let key = consumer.checkpointer.vb_key(vb);
            info!("reclaiming vb by restarting dcp stream"; "worker" => %worker, "vb" => vb);
            let (blob, _cas) = consumer.checkpointer.get_vb_blob(&key).await?;

            match consumer.update_vb_owner_and_start_stream(vb, blob).await {
                Ok(()) => {}
                Err(Error::RetryTimeout) => return Err(Error::RetryTimeout),
                Err(err) => {
                    err.report(format_args!("restarting stream for vb {}", vb));
                    if consumer.vb_stream_requested.remove(&vb).is_some() {
                        debug!("purged entry from vb_stream_requested"; "worker" => %worker, "vb" => vb);
                    }
                    failed.push(vb);
                }
            }
        }

        if !failed.is_empty() {
            info!("vbs failed to start stream"; "worker" => %worker, "vbs" => %condense(&failed));
        }
        let handled = vbs_diff(&failed, &vbs_to_restream);

        let remaining = {
            let mut queue = consumer.vbs_remaining_to_restream.lock().unwrap();
            let next = vbs_diff(&handled, &queue);
            *queue = next;
            queue.clone()
        };

        if remaining.is_empty() {
            return Ok(());
        }
        pass += 1;
        if pass >= RESTREAM_RETRY_MAX {
            warn!("restream queue did not converge this tick, deferring";
                "worker" => %worker, "remaining" => %condense(&remaining));
            return Ok(());
        }
        info!("retrying vbs to restream"; "worker" => %worker, "remaining" => %condense(&remaining));
    }
}

async fn close_pending_streams(consumer: &Consumer, mut vbs_to_close: Vec<u16>) -> Result<()> {
    let worker = &consumer.config.worker_name;
    vbs_to_close.sort_unstable();
    if !vbs_to_close.is_empty() {
        info!("vbs remaining to close"; "worker" => %worker,
            "len" => vbs_to_close.len(), "vbs" => %condense(&vbs_to_close));
    }

    for vb in vbs_to_close {
        if !consumer.vb_owned_by_self(vb) {
            continue;
        }
        if consumer.should_own(vb) {
            continue;
        }

        match consumer.feeds.feed_for_vb(vb) {
            Some(feed) => match feed.close_stream(vb, vb).await {
                Ok(()) => {
                    info!("issued dcp close stream, plan assigns vb elsewhere";
                        "worker" => %worker, "vb" => vb);
                    consumer.vbs_stream_closed.insert(vb);
                }
                Err(err) => {
                    err.report(format_args!("closing dcp stream of vb {}", vb));
                }
            },
            None => {
                warn!("no feed bound to vb while closing"; "worker" => %worker, "vb" => vb);
            }
        }

        let last_read = consumer.state.read(vb, |s| s.last_read_seq_no);
        consumer.state.update(vb, |s| {
            s.seq_no_after_close_stream = last_read;
            s.timestamp = chrono::Utc::now().to_rfc3339();
        });

        let key = consumer.checkpointer.vb_key(vb);
        let (mut blob, _cas) = consumer.checkpointer.get_vb_blob(&key).await?;
        blob.seq_no_after_close_stream = last_read;
        consumer
            .checkpointer
            .update_checkpoint(&key, &mut blob)
            .await?;
    }
    Ok(())
}
