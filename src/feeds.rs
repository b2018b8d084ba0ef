// Copyright 2022 TiKV Project Authors. Licensed under Apache-2.0.

//! The DCP feed multiplexer: one feed per KV host serving an owned
//! vbucket, each with an attached reader task copying its events into the
//! aggregated channel under a memory-bounded backpressure cap.

use std::{
    collections::HashSet,
    panic::AssertUnwindSafe,
    sync::{atomic::Ordering, Arc},
    time::Duration,
};

use dashmap::DashMap;
use futures::FutureExt;
use tokio::sync::mpsc;

use crate::{
    consumer::Consumer,
    dcp::{self, DcpEvent, DcpFeed},
    errors::{Error, Result},
    metrics,
    utils::{retry, FixedBackoff},
};

/// Sleep quantum while the aggregated channel is over its byte cap.
const BACKPRESSURE_QUANTUM: Duration = Duration::from_millis(10);

/// Feeds currently open, indexed by KV host for creation and cleanup, and
/// by vbucket for stream closes.
#[derive(Default)]
pub struct FeedRegistry {
    by_host: DashMap<String, Arc<dyn DcpFeed>>,
    by_vb: DashMap<u16, Arc<dyn DcpFeed>>,
}

impl FeedRegistry {
    pub fn feed_for_host(&self, kv_host: &str) -> Option<Arc<dyn DcpFeed>> {
        self.by_host.get(kv_host).map(|f| f.value().clone())
    }

    pub fn feed_for_vb(&self, vb: u16) -> Option<Arc<dyn DcpFeed>> {
        self.by_vb.get(&vb).map(|f| f.value().clone())
    }

    pub fn bind_vb(&self, vb: u16, feed: Arc<dyn DcpFeed>) {
        self.by_vb.insert(vb, feed);
    }

    pub fn hosts(&self) -> Vec<String> {
        self.by_host.iter().map(|e| e.key().clone()).collect()
    }

    /// Vbuckets currently routed through the feed named `feed_name`.
    pub fn vbs_of_feed(&self, feed_name: &str) -> Vec<u16> {
        let mut vbs: Vec<u16> = self
            .by_vb
            .iter()
            .filter(|e| e.value().name() == feed_name)
            .map(|e| *e.key())
            .collect();
        vbs.sort_unstable();
        vbs
    }

    pub fn insert_host(&self, kv_host: String, feed: Arc<dyn DcpFeed>) {
        self.by_host.insert(kv_host, feed);
    }

    pub fn remove_host(&self, kv_host: &str) -> Option<Arc<dyn DcpFeed>> {
        self.by_host.remove(kv_host).map(|(_, f)| f)
    }

    /// Remove the host mapping only while it still points at the feed named
    /// `feed_name`; a reader noticing its channel closed must not unmap a
    /// replacement feed that was opened in the meantime.
    pub fn remove_host_if_named(&self, kv_host: &str, feed_name: &str) {
        self.by_host
            .remove_if(kv_host, |_, feed| feed.name() == feed_name);
    }

    pub fn remove_vb(&self, vb: u16) {
        self.by_vb.remove(&vb);
    }

    pub fn close_all(&self) {
        self.by_host.retain(|_, feed| {
            feed.close();
            false
        });
        self.by_vb.clear();
    }
}

impl Consumer {
    /// Ensure a feed exists for `kv_host`, spawning its reader task on
    /// creation. Idempotent.
    pub(crate) async fn ensure_feed(&self, kv_host: &str) -> Result<Arc<dyn DcpFeed>> {
        if let Some(feed) = self.feeds.feed_for_host(kv_host) {
            return Ok(feed);
        }
        let name = dcp::feed_name(
            &self.config.host_port_addr,
            kv_host,
            &self.config.worker_name,
        );
        let (feed, events) = retry(
            FixedBackoff(self.config.bucket_op_backoff),
            self.config.retry_count,
            || {
                let name = name.clone();
                async move { self.dcp.start_feed(name, kv_host).await }
            },
        )
        .await?;
        self.feeds.insert_host(kv_host.to_owned(), feed.clone());
        self.spawn_agg_reader(kv_host.to_owned(), feed.name().to_owned(), events);
        info!("started dcp feed and its reader";
            "worker" => %self.config.worker_name, "kv_host" => kv_host, "feed" => feed.name());
        Ok(feed)
    }

    /// Attach a reader that drains one feed into the aggregated channel.
    /// A panic inside the reader is isolated to that task; peers keep
    /// running.
    pub(crate) fn spawn_agg_reader(
        &self,
        kv_host: String,
        feed_name: String,
        events: mpsc::Receiver<DcpEvent>,
    ) {
        let consumer = self.clone();
        tokio::spawn(async move {
            let host = kv_host.clone();
            let run = AssertUnwindSafe(consumer.agg_reader_loop(kv_host, feed_name, events));
            if let Err(panic) = run.catch_unwind().await {
                error!("dcp feed reader panicked";
                    "kv_host" => %host, "panic" => ?panic_message(&panic));
            }
        });
    }

    async fn agg_reader_loop(
        self,
        kv_host: String,
        feed_name: String,
        mut events: mpsc::Receiver<DcpEvent>,
    ) {
        loop {
            match events.recv().await {
                Some(event) => {
                    while self.agg_feed_bytes.load(Ordering::Relaxed)
                        > self.config.agg_feed_mem_cap
                    {
                        tokio::time::sleep(BACKPRESSURE_QUANTUM).await;
                    }
                    if self.is_terminate_running.load(Ordering::SeqCst) {
                        continue;
                    }
                    let bytes = event.value.len() as i64;
                    self.agg_feed_bytes.fetch_add(bytes, Ordering::Relaxed);
                    metrics::AGG_FEED_BYTES.add(bytes);
                    if self.agg_feed_tx.send(event).await.is_err() {
                        return;
                    }
                }
                None => {
                    info!("dcp feed channel closed, detaching reader";
                        "worker" => %self.config.worker_name, "kv_host" => %kv_host);
                    self.feeds.remove_host_if_named(&kv_host, &feed_name);
                    return;
                }
            }
        }
    }

    /// Close feeds whose KV host no longer serves any vbucket in the current
    /// vb map, clearing the ownership metadata of vbuckets that were bound
    /// to them.
    pub async fn cleanup_stale_feeds(&self) -> Result<()> {
        let hosts_in_map: HashSet<String> = self
            .kv_vb_map
            .read()
            .unwrap()
            .values()
            .cloned()
            .collect();
        let stale: Vec<String> = self
            .feeds
            .hosts()
            .into_iter()
            .filter(|host| !hosts_in_map.contains(host))
            .collect();

        for kv_host in stale {
            let feed = match self.feeds.remove_host(&kv_host) {
                Some(feed) => feed,
                None => continue,
            };
            info!("cleaning up stale dcp feed";
                "worker" => %self.config.worker_name, "kv_host" => %kv_host, "feed" => feed.name());
            feed.close();
            let orphaned = self.feeds.vbs_of_feed(feed.name());
            for vb in orphaned {
                self.feeds.remove_vb(vb);
                match self.clear_ownership_from_meta(vb).await {
                    Ok(()) => {}
                    Err(Error::RetryTimeout) => return Err(Error::RetryTimeout),
                    Err(err) => {
                        err.report(format_args!("clearing ownership of vb {}", vb));
                    }
                }
            }
        }
        Ok(())
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}
