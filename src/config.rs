// Copyright 2022 TiKV Project Authors. Licensed under Apache-2.0.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::Result;

/// Where to begin a vbucket's very first stream.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamBoundary {
    /// Stream the whole history, starting from seqno 0.
    #[default]
    Everything,
    /// Stream only changes made after deployment.
    FromNow,
}

/// Static configuration of one consumer. The dynamic knobs (log level, timer
/// threshold, giveup/takeover routine counts) live on the consumer itself and
/// are refreshed from the config store on a settings-change notification.
#[derive(Clone, Debug)]
pub struct ConsumerConfig {
    pub app_name: String,
    /// The handler's uuid; its ASCII form keys the eventing xattr frame.
    pub handler_uuid: u32,
    pub worker_name: String,
    pub node_uuid: String,
    /// host:port of the eventing node this consumer runs on.
    pub host_port_addr: String,
    pub source_bucket: String,
    /// Prefix applied to every metadata bucket key.
    pub metadata_prefix: String,
    /// Settings documents live at `<app_settings_path><app_name>`.
    pub app_settings_path: String,

    pub num_vbuckets: u16,
    pub stream_boundary: StreamBoundary,

    /// Attempts per remote operation before `RetryTimeout` escapes.
    pub retry_count: usize,
    pub bucket_op_backoff: Duration,
    pub cluster_op_backoff: Duration,

    /// Capacity of the aggregated DCP event channel.
    pub agg_feed_chan_size: usize,
    /// In-flight byte cap on the aggregated channel; feed readers sleep while
    /// above it.
    pub agg_feed_mem_cap: i64,
    /// JS worker queue caps consulted by the router's softened backpressure.
    pub worker_queue_cap: u64,
    pub timer_queue_cap: u64,
    pub worker_queue_mem_cap: u64,

    pub restart_tick_interval: Duration,
    pub stats_tick_interval: Duration,

    pub vb_ownership_giveup_routine_count: usize,
    pub vb_ownership_takeover_routine_count: usize,
    pub skip_timer_threshold: usize,

    /// Whether timer stores are in use at all; gates timer bookkeeping at
    /// bootstrap.
    pub using_timer: bool,
    /// Hook for releasing a vbucket's timer store when its stream ends.
    /// Disabled until the timer store grows a dormant API.
    pub free_timer_store_on_stream_end: bool,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        ConsumerConfig {
            app_name: "app".to_owned(),
            handler_uuid: 0,
            worker_name: "worker_0".to_owned(),
            node_uuid: String::new(),
            host_port_addr: "127.0.0.1:8096".to_owned(),
            source_bucket: "default".to_owned(),
            metadata_prefix: String::new(),
            app_settings_path: "/eventing/settings/".to_owned(),
            num_vbuckets: 1024,
            stream_boundary: StreamBoundary::Everything,
            retry_count: 30,
            bucket_op_backoff: Duration::from_millis(100),
            cluster_op_backoff: Duration::from_millis(100),
            agg_feed_chan_size: 10000,
            agg_feed_mem_cap: 64 << 20,
            worker_queue_cap: 100_000,
            timer_queue_cap: 100_000,
            worker_queue_mem_cap: 1 << 30,
            restart_tick_interval: Duration::from_secs(1),
            stats_tick_interval: Duration::from_secs(60),
            vb_ownership_giveup_routine_count: 1,
            vb_ownership_takeover_routine_count: 1,
            skip_timer_threshold: 86400,
            using_timer: false,
            free_timer_store_on_stream_end: false,
        }
    }
}

impl ConsumerConfig {
    pub fn settings_path(&self) -> String {
        format!("{}{}", self.app_settings_path, self.app_name)
    }
}

/// Read access to the cluster config store (the metakv analog) holding the
/// per-app settings document.
#[async_trait]
pub trait ConfigStore: Send + Sync + 'static {
    async fn get(&self, path: &str) -> Result<Vec<u8>>;
}

/// The dynamic settings document. Recognised keys only; unknown keys in the
/// stored JSON are ignored, and wrongly-typed values are rejected by the
/// control routine rather than coerced.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct Settings {
    pub log_level: Option<serde_json::Value>,
    pub skip_timer_threshold: Option<serde_json::Value>,
    pub vb_ownership_giveup_routine_count: Option<serde_json::Value>,
    pub vb_ownership_takeover_routine_count: Option<serde_json::Value>,
}

impl Settings {
    pub fn parse(data: &[u8]) -> Result<Settings> {
        Ok(serde_json::from_slice(data)?)
    }
}
