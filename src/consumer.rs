// Copyright 2022 TiKV Project Authors. Licensed under Apache-2.0.

//! The consumer: shared state for every routine of the streaming control
//! plane, plus the bootstrap path that opens the initial streams.

use std::{
    collections::HashMap,
    ops::Deref,
    sync::{
        atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex as StdMutex, RwLock as StdRwLock,
    },
};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashSet;
use tokio::{sync::mpsc, task::JoinHandle};

use crate::{
    config::{ConfigStore, ConsumerConfig, StreamBoundary},
    control,
    dcp::{DcpClient, DcpEvent, DcpStatus, FailoverLog},
    errors::{Error, Result},
    failover,
    feeds::FeedRegistry,
    metadata::{
        Checkpointer, CheckpointIdentity, MetaStore, OwnershipEntry, StreamStatus,
        VbucketMetaBlob,
    },
    router, state::VbStateStore, stream_request,
    utils::{push_dedup, retry, FixedBackoff},
    worker::{TimerEvent, WorkerSink},
};

/// The planner's view of this consumer, consulted on every ownership
/// decision. Implemented by the surrounding host.
#[async_trait]
pub trait Planner: Send + Sync + 'static {
    /// Whether the current plan assigns `vb` to this consumer.
    fn should_own(&self, vb: u16) -> bool;
    /// Whether a planning round is in flight right now.
    fn is_running(&self) -> bool;
    /// Whether `app` is deployed on this node.
    fn is_deployed(&self, app: &str) -> bool;
    /// Refresh and return the eventing node addresses.
    async fn eventing_node_addrs(&self) -> Result<Vec<String>>;
}

/// Work item for the stream request processor.
#[derive(Clone, Debug)]
pub struct StreamRequestInfo {
    pub vb: u16,
    pub vb_blob: VbucketMetaBlob,
    pub start_seq_no: u64,
}

/// Outcome of a stream request or stream end, routed to the failover-log
/// handler.
#[derive(Clone, Debug)]
pub struct VbFlogEntry {
    pub vb: u16,
    pub status: DcpStatus,
    pub stream_req_retry: bool,
    pub signal_stream_end: bool,
    pub failover_log: Option<FailoverLog>,
    pub seq_no: u64,
}

/// `(vb, last seqno read)` emitted by the router when a stream ends, drained
/// by the router itself on a separate channel.
#[derive(Clone, Copy, Debug)]
pub struct FilterData {
    pub vb: u16,
    pub seq_no: u64,
}

/// External collaborators handed to [`Consumer::new`].
pub struct Deps {
    pub dcp: Arc<dyn DcpClient>,
    pub meta_store: Arc<dyn MetaStore>,
    pub config_store: Arc<dyn ConfigStore>,
    pub planner: Arc<dyn Planner>,
    pub sink: Arc<dyn WorkerSink>,
}

/// Receivers the host drains: the kick for the (external) vbucket-state
/// update routine and the stop signal for the (external) periodic
/// checkpointing task.
pub struct ConsumerHandles {
    pub vbs_state_update: mpsc::Receiver<()>,
    pub checkpointing_stop: mpsc::Receiver<()>,
}

/// In-memory processing counters, dumped on the router's stats tick.
#[derive(Default)]
pub struct Counters {
    pub dcp_messages: StdMutex<HashMap<&'static str, u64>>,
    pub mutations: AtomicU64,
    pub deletions: AtomicU64,
    pub timers: AtomicU64,
    pub suppressed: AtomicU64,
    pub stream_reqs: AtomicU64,
    pub stream_req_errs: AtomicU64,
}

impl Counters {
    pub fn note_dcp_message(&self, opcode: &'static str) {
        let mut map = self.dcp_messages.lock().unwrap();
        *map.entry(opcode).or_insert(0) += 1;
    }

    pub fn dcp_ops_total(&self) -> u64 {
        self.dcp_messages.lock().unwrap().values().sum()
    }
}

pub(crate) struct RoutineInputs {
    pub agg_feed_rx: mpsc::Receiver<DcpEvent>,
    pub filter_data_rx: mpsc::Receiver<FilterData>,
    pub timer_rx: mpsc::Receiver<TimerEvent>,
    pub vb_flog_rx: mpsc::Receiver<VbFlogEntry>,
    pub req_stream_rx: mpsc::Receiver<StreamRequestInfo>,
    pub cluster_change_rx: mpsc::Receiver<()>,
    pub settings_change_rx: mpsc::Receiver<()>,
    pub stop_router_rx: mpsc::Receiver<()>,
    pub stop_stream_req_rx: mpsc::Receiver<()>,
    pub stop_failover_rx: mpsc::Receiver<()>,
    pub stop_control_rx: mpsc::Receiver<()>,
}

pub struct ConsumerInner {
    pub config: ConsumerConfig,

    pub(crate) dcp: Arc<dyn DcpClient>,
    pub(crate) planner: Arc<dyn Planner>,
    pub(crate) sink: Arc<dyn WorkerSink>,
    pub(crate) config_store: Arc<dyn ConfigStore>,
    pub(crate) checkpointer: Checkpointer,
    pub(crate) state: VbStateStore,
    pub(crate) feeds: FeedRegistry,

    // Vbuckets mid-transition. Each set has a single concern; none is ever
    // held while taking another.
    pub(crate) vb_stream_requested: DashSet<u16>,
    pub(crate) inflight_dcp_streams: DashSet<u16>,
    pub(crate) filter_vb_events: DashSet<u16>,
    pub(crate) vbs_stream_closed: DashSet<u16>,
    pub(crate) enqueue_map: DashSet<u16>,

    // Pending-work queues drained by the restart tick, ordered, deduped.
    pub(crate) vbs_remaining_to_restream: StdMutex<Vec<u16>>,
    pub(crate) vbs_remaining_to_close: StdMutex<Vec<u16>>,
    pub(crate) vbs_remaining_to_cleanup: StdMutex<Vec<u16>>,

    pub(crate) kv_vb_map: StdRwLock<HashMap<u16, String>>,

    pub(crate) agg_feed_bytes: AtomicI64,
    pub(crate) is_terminate_running: AtomicBool,
    pub(crate) dcp_feeds_closed: AtomicBool,
    pub(crate) is_rebalance_ongoing: AtomicBool,
    pub(crate) vbs_state_update_running: AtomicBool,
    pub(crate) is_bootstrapping: AtomicBool,

    // Dynamic settings, refreshed by the control routine.
    pub(crate) log_level: StdRwLock<String>,
    pub(crate) skip_timer_threshold: AtomicUsize,
    pub(crate) giveup_routine_count: AtomicUsize,
    pub(crate) takeover_routine_count: AtomicUsize,

    // Stop channels for the (external) giveup/takeover routines, recreated
    // on every cluster-state change.
    pub(crate) giveup_stop_tx: StdMutex<Option<mpsc::Sender<()>>>,
    pub(crate) giveup_stop_rx: StdMutex<Option<mpsc::Receiver<()>>>,
    pub(crate) takeover_stop_tx: StdMutex<Option<mpsc::Sender<()>>>,
    pub(crate) takeover_stop_rx: StdMutex<Option<mpsc::Receiver<()>>>,

    pub(crate) counters: Counters,

    pub(crate) agg_feed_tx: mpsc::Sender<DcpEvent>,
    pub(crate) filter_data_tx: mpsc::Sender<FilterData>,
    pub(crate) timer_tx: mpsc::Sender<TimerEvent>,
    pub(crate) vb_flog_tx: mpsc::Sender<VbFlogEntry>,
    pub(crate) req_stream_tx: mpsc::Sender<StreamRequestInfo>,
    pub(crate) cluster_change_tx: mpsc::Sender<()>,
    pub(crate) settings_change_tx: mpsc::Sender<()>,
    pub(crate) vbs_state_update_tx: mpsc::Sender<()>,
    pub(crate) stop_checkpointing_tx: mpsc::Sender<()>,

    pub(crate) stop_router_tx: mpsc::Sender<()>,
    pub(crate) stop_stream_req_tx: mpsc::Sender<()>,
    pub(crate) stop_failover_tx: mpsc::Sender<()>,
    pub(crate) stop_control_tx: mpsc::Sender<()>,

    pub(crate) inputs: StdMutex<Option<RoutineInputs>>,
}

#[derive(Clone)]
pub struct Consumer {
    inner: Arc<ConsumerInner>,
}

impl Deref for Consumer {
    type Target = ConsumerInner;

    fn deref(&self) -> &ConsumerInner {
        &self.inner
    }
}

impl Consumer {
    pub fn new(config: ConsumerConfig, deps: Deps) -> (Consumer, ConsumerHandles) {
        let checkpointer = Checkpointer::new(
            deps.meta_store,
            config.bucket_op_backoff,
            config.retry_count,
            CheckpointIdentity {
                metadata_prefix: config.metadata_prefix.clone(),
                app_name: config.app_name.clone(),
                worker_name: config.worker_name.clone(),
                host_port_addr: config.host_port_addr.clone(),
                node_uuid: config.node_uuid.clone(),
            },
        );
        let state = VbStateStore::new(config.num_vbuckets);

        let (agg_feed_tx, agg_feed_rx) = mpsc::channel(config.agg_feed_chan_size);
        let (filter_data_tx, filter_data_rx) = mpsc::channel(config.num_vbuckets as usize);
        let (timer_tx, timer_rx) = mpsc::channel(config.agg_feed_chan_size);
        let (vb_flog_tx, vb_flog_rx) = mpsc::channel(config.num_vbuckets as usize);
        let (req_stream_tx, req_stream_rx) = mpsc::channel(config.num_vbuckets as usize);
        let (cluster_change_tx, cluster_change_rx) = mpsc::channel(4);
        let (settings_change_tx, settings_change_rx) = mpsc::channel(4);
        let (vbs_state_update_tx, vbs_state_update) = mpsc::channel(4);
        let (stop_checkpointing_tx, checkpointing_stop) = mpsc::channel(4);
        let (stop_router_tx, stop_router_rx) = mpsc::channel(1);
        let (stop_stream_req_tx, stop_stream_req_rx) = mpsc::channel(1);
        let (stop_failover_tx, stop_failover_rx) = mpsc::channel(1);
        let (stop_control_tx, stop_control_rx) = mpsc::channel(1);

        let inputs = RoutineInputs {
            agg_feed_rx,
            filter_data_rx,
            timer_rx,
            vb_flog_rx,
            req_stream_rx,
            cluster_change_rx,
            settings_change_rx,
            stop_router_rx,
            stop_stream_req_rx,
            stop_failover_rx,
            stop_control_rx,
        };

        let inner = ConsumerInner {
            skip_timer_threshold: AtomicUsize::new(config.skip_timer_threshold),
            giveup_routine_count: AtomicUsize::new(config.vb_ownership_giveup_routine_count),
            takeover_routine_count: AtomicUsize::new(config.vb_ownership_takeover_routine_count),
            config,
            dcp: deps.dcp,
            planner: deps.planner,
            sink: deps.sink,
            config_store: deps.config_store,
            checkpointer,
            state,
            feeds: FeedRegistry::default(),
            vb_stream_requested: DashSet::new(),
            inflight_dcp_streams: DashSet::new(),
            filter_vb_events: DashSet::new(),
            vbs_stream_closed: DashSet::new(),
            enqueue_map: DashSet::new(),
            vbs_remaining_to_restream: StdMutex::new(Vec::new()),
            vbs_remaining_to_close: StdMutex::new(Vec::new()),
            vbs_remaining_to_cleanup: StdMutex::new(Vec::new()),
            kv_vb_map: StdRwLock::new(HashMap::new()),
            agg_feed_bytes: AtomicI64::new(0),
            is_terminate_running: AtomicBool::new(false),
            dcp_feeds_closed: AtomicBool::new(false),
            is_rebalance_ongoing: AtomicBool::new(false),
            vbs_state_update_running: AtomicBool::new(false),
            is_bootstrapping: AtomicBool::new(true),
            log_level: StdRwLock::new("INFO".to_owned()),
            giveup_stop_tx: StdMutex::new(None),
            giveup_stop_rx: StdMutex::new(None),
            takeover_stop_tx: StdMutex::new(None),
            takeover_stop_rx: StdMutex::new(None),
            counters: Counters::default(),
            agg_feed_tx,
            filter_data_tx,
            timer_tx,
            vb_flog_tx,
            req_stream_tx,
            cluster_change_tx,
            settings_change_tx,
            vbs_state_update_tx,
            stop_checkpointing_tx,
            stop_router_tx,
            stop_stream_req_tx,
            stop_failover_tx,
            stop_control_tx,
            inputs: StdMutex::new(Some(inputs)),
        };

        (
            Consumer {
                inner: Arc::new(inner),
            },
            ConsumerHandles {
                vbs_state_update,
                checkpointing_stop,
            },
        )
    }

    /// Spawn the four long-lived routines. Callable once; a second call
    /// returns an empty vec.
    pub fn start(&self) -> Vec<JoinHandle<()>> {
        let inputs = match self.inputs.lock().unwrap().take() {
            Some(inputs) => inputs,
            None => return Vec::new(),
        };
        let RoutineInputs {
            agg_feed_rx,
            filter_data_rx,
            timer_rx,
            vb_flog_rx,
            req_stream_rx,
            cluster_change_rx,
            settings_change_rx,
            stop_router_rx,
            stop_stream_req_rx,
            stop_failover_rx,
            stop_control_rx,
        } = inputs;

        let mut handles = Vec::with_capacity(4);
        handles.push(spawn_routine(
            "router",
            router::run(
                self.clone(),
                agg_feed_rx,
                filter_data_rx,
                timer_rx,
                stop_router_rx,
            ),
        ));
        handles.push(spawn_routine(
            "stream_request",
            stream_request::run(self.clone(), req_stream_rx, stop_stream_req_rx),
        ));
        handles.push(spawn_routine(
            "failover",
            failover::run(self.clone(), vb_flog_rx, stop_failover_rx),
        ));
        handles.push(spawn_routine(
            "control",
            control::run(
                self.clone(),
                cluster_change_rx,
                settings_change_rx,
                stop_control_rx,
            ),
        ));
        handles
    }

    /// Stop every routine and close every feed. Routines finish the event in
    /// hand before exiting.
    pub fn stop(&self) {
        info!("stopping consumer"; "worker" => %self.config.worker_name);
        self.is_terminate_running.store(true, Ordering::SeqCst);
        self.dcp_feeds_closed.store(true, Ordering::SeqCst);
        self.feeds.close_all();
        for tx in [
            &self.stop_router_tx,
            &self.stop_stream_req_tx,
            &self.stop_failover_tx,
            &self.stop_control_tx,
        ] {
            let _ = tx.try_send(());
        }
    }

    pub async fn notify_cluster_state_change(&self) {
        let _ = self.cluster_change_tx.send(()).await;
    }

    pub async fn notify_settings_change(&self) {
        let _ = self.settings_change_tx.send(()).await;
    }

    pub async fn send_timer_event(&self, timer: TimerEvent) -> Result<()> {
        self.timer_tx
            .send(timer)
            .await
            .map_err(|_| Error::ChannelClosed("timer"))
    }

    /// Mark bootstrap as finished; until then the restart tick keeps working
    /// even if the app reads as undeployed.
    pub fn set_bootstrap_done(&self) {
        self.is_bootstrapping.store(false, Ordering::SeqCst);
    }

    pub fn is_rebalance_ongoing(&self) -> bool {
        self.is_rebalance_ongoing.load(Ordering::SeqCst)
    }

    /// Host API: the (external) vbucket-state-update routine reports whether
    /// it is running so the control routine does not kick it twice.
    pub fn set_vbs_state_update_running(&self, running: bool) {
        self.vbs_state_update_running.store(running, Ordering::SeqCst);
    }

    /// Take the stop channel for the giveup routines created by the last
    /// cluster-state change.
    pub fn take_giveup_stop(&self) -> Option<mpsc::Receiver<()>> {
        self.giveup_stop_rx.lock().unwrap().take()
    }

    pub fn take_takeover_stop(&self) -> Option<mpsc::Receiver<()>> {
        self.takeover_stop_rx.lock().unwrap().take()
    }

    // ---- ownership helpers ----

    pub(crate) fn should_own(&self, vb: u16) -> bool {
        self.planner.should_own(vb)
    }

    /// Whether `vb` currently runs on this worker of this node.
    pub(crate) fn vb_owned_by_self(&self, vb: u16) -> bool {
        self.state.read(vb, |s| {
            s.assigned_worker == self.config.worker_name
                && s.node_uuid == self.config.node_uuid
                && s.dcp_stream_status == StreamStatus::Running
        })
    }

    pub fn owned_vbs(&self) -> Vec<u16> {
        self.state
            .owned_vbs(&self.config.worker_name, &self.config.node_uuid)
    }

    // ---- enqueue-map helpers ----

    pub(crate) fn check_if_already_enqueued(&self, vb: u16) -> bool {
        self.enqueue_map.contains(&vb)
    }

    pub(crate) fn add_to_enqueue_map(&self, vb: u16) {
        self.enqueue_map.insert(vb);
    }

    pub(crate) fn delete_from_enqueue_map(&self, vb: u16) {
        self.enqueue_map.remove(&vb);
    }

    // ---- pending queues ----

    /// Host API: queue vbuckets whose streams must be closed because the
    /// plan moved them away.
    pub fn enqueue_vbs_for_close(&self, vbs: &[u16]) {
        let mut queue = self.vbs_remaining_to_close.lock().unwrap();
        for &vb in vbs {
            push_dedup(&mut queue, vb);
        }
    }

    /// Host API: queue vbuckets whose streams must be (re)opened on this
    /// node.
    pub fn enqueue_vbs_for_restream(&self, vbs: &[u16]) {
        let mut queue = self.vbs_remaining_to_restream.lock().unwrap();
        for &vb in vbs {
            push_dedup(&mut queue, vb);
        }
    }

    pub fn vbs_remaining_to_restream(&self) -> Vec<u16> {
        self.vbs_remaining_to_restream.lock().unwrap().clone()
    }

    pub fn vbs_remaining_to_close(&self) -> Vec<u16> {
        self.vbs_remaining_to_close.lock().unwrap().clone()
    }

    /// Host API: drain the cleanup queue for the (external) vbucket-state
    /// update routine.
    pub fn take_vbs_remaining_to_cleanup(&self) -> Vec<u16> {
        std::mem::take(&mut *self.vbs_remaining_to_cleanup.lock().unwrap())
    }

    pub(crate) fn push_vb_to_restream(&self, vb: u16) {
        push_dedup(&mut self.vbs_remaining_to_restream.lock().unwrap(), vb);
    }

    pub(crate) fn push_vb_to_close(&self, vb: u16) {
        push_dedup(&mut self.vbs_remaining_to_close.lock().unwrap(), vb);
    }

    pub(crate) fn push_vb_to_cleanup(&self, vb: u16) {
        push_dedup(&mut self.vbs_remaining_to_cleanup.lock().unwrap(), vb);
    }

    // ---- metadata transitions ----

    /// Queue a stream request that reclaims `vb`, resuming from the blob's
    /// checkpoint.
    pub(crate) async fn update_vb_owner_and_start_stream(
        &self,
        vb: u16,
        blob: VbucketMetaBlob,
    ) -> Result<()> {
        if self.check_if_already_enqueued(vb) {
            return Ok(());
        }
        self.add_to_enqueue_map(vb);
        let start_seq_no = blob.last_processed_seq_no;
        self.state.update(vb, |s| {
            s.start_seq_no = start_seq_no;
            s.last_processed_seq_no = start_seq_no;
            s.timestamp = Utc::now().to_rfc3339();
        });
        info!("queueing stream request to reclaim vb";
            "worker" => %self.config.worker_name, "vb" => vb, "start_seq_no" => start_seq_no);
        self.req_stream_tx
            .send(StreamRequestInfo {
                vb,
                vb_blob: blob,
                start_seq_no,
            })
            .await
            .map_err(|_| Error::ChannelClosed("req_stream"))
    }

    /// A stream request arrived for a vbucket the plan no longer assigns
    /// here: release the metadata claim if the blob still names us.
    pub(crate) async fn cleanup_vb_metadata(&self, vb: u16) -> Result<()> {
        let key = self.checkpointer.vb_key(vb);
        let (blob, _cas, absent) = self.checkpointer.get_vb_blob_or_absent(&key).await?;
        if absent {
            return Ok(());
        }
        if blob.assigned_worker == self.config.worker_name
            && blob.node_uuid == self.config.node_uuid
        {
            self.clear_ownership_from_meta(vb).await?;
        }
        Ok(())
    }

    /// Clear the persisted owner fields and the in-memory ownership
    /// attributes for `vb`.
    pub(crate) async fn clear_ownership_from_meta(&self, vb: u16) -> Result<()> {
        let key = self.checkpointer.vb_key(vb);
        self.checkpointer.clear_ownership(&key).await?;
        self.state.update(vb, |s| {
            s.assigned_worker = String::new();
            s.current_vb_owner = String::new();
            s.node_uuid = String::new();
            s.dcp_stream_status = StreamStatus::Stopped;
        });
        Ok(())
    }

    // ---- kv vb map ----

    /// Refresh the cached `vb -> kv host` map from the DCP client.
    pub async fn refresh_kv_vb_map(&self) -> Result<()> {
        let map = retry(
            FixedBackoff(self.config.cluster_op_backoff),
            self.config.retry_count,
            || async move { self.dcp.refresh_vb_map().await },
        )
        .await?;
        *self.kv_vb_map.write().unwrap() = map;
        Ok(())
    }

    pub(crate) fn kv_host_of(&self, vb: u16) -> Option<String> {
        self.kv_vb_map.read().unwrap().get(&vb).cloned()
    }

    // ---- bootstrap ----

    /// Open the initial streams for the vbuckets in `flogs`. Creates the
    /// metadata blob when missing; resumes from the persisted checkpoint
    /// when present and the blob names this node (or nobody).
    pub async fn start_dcp(&self, flogs: HashMap<u16, FailoverLog>) -> Result<()> {
        if self.is_terminate_running.load(Ordering::SeqCst) {
            return Err(Error::Terminating);
        }
        let worker = self.config.worker_name.clone();
        info!("starting dcp streams"; "worker" => %worker, "vbs" => flogs.len());

        retry(
            FixedBackoff(self.config.cluster_op_backoff),
            self.config.retry_count,
            || async move { self.planner.eventing_node_addrs().await },
        )
        .await?;

        let high_seqnos = match self.config.stream_boundary {
            StreamBoundary::FromNow => {
                retry(
                    FixedBackoff(self.config.bucket_op_backoff),
                    self.config.retry_count,
                    || async move { self.dcp.high_seqnos().await },
                )
                .await?
            }
            StreamBoundary::Everything => HashMap::new(),
        };

        let mut flog_vbs: Vec<u16> = flogs.keys().copied().collect();
        flog_vbs.sort_unstable();

        let mut requested: Vec<u16> = Vec::new();
        for vb in flog_vbs {
            let flog = &flogs[&vb];
            let (vb_uuid, _) = match flog.latest(vb) {
                Ok(latest) => latest,
                Err(err) => {
                    err.report(format_args!("grabbing latest failover log for vb {}", vb));
                    continue;
                }
            };

            let key = self.checkpointer.vb_key(vb);
            let (mut blob, _cas, absent) =
                self.checkpointer.get_vb_blob_or_absent(&key).await?;

            if absent {
                blob.vb_id = vb;
                blob.vb_uuid = vb_uuid;
                blob.assigned_worker = worker.clone();
                blob.current_vb_owner = self.config.host_port_addr.clone();
                blob.previous_assigned_worker = worker.clone();
                blob.previous_vb_owner = self.config.host_port_addr.clone();
                blob.previous_node_uuid = self.config.node_uuid.clone();
                blob.ownership_history.push(OwnershipEntry::new(
                    &worker,
                    &self.config.host_port_addr,
                    StreamStatus::Bootstrap,
                    0,
                ));
                if self.config.using_timer {
                    let now = Utc::now();
                    blob.currently_processed_doc_id_timer = now.to_rfc3339();
                    blob.last_processed_doc_id_timer_event = now.to_rfc3339();
                    blob.next_doc_id_timer_to_process =
                        (now + chrono::Duration::seconds(1)).to_rfc3339();
                }
                self.checkpointer.set_vb_blob(&key, &blob).await?;
                info!("created initial metadata blob"; "worker" => %worker, "vb" => vb);

                if self.check_if_already_enqueued(vb) {
                    continue;
                }
                self.add_to_enqueue_map(vb);
                requested.push(vb);

                let start_seq_no = match self.config.stream_boundary {
                    StreamBoundary::Everything => 0,
                    StreamBoundary::FromNow => high_seqnos.get(&vb).copied().unwrap_or(0),
                };
                self.state.update(vb, |s| {
                    s.start_seq_no = start_seq_no;
                    s.last_processed_seq_no = start_seq_no;
                    s.timestamp = Utc::now().to_rfc3339();
                });
                self.req_stream_tx
                    .send(StreamRequestInfo {
                        vb,
                        vb_blob: blob,
                        start_seq_no,
                    })
                    .await
                    .map_err(|_| Error::ChannelClosed("req_stream"))?;
            } else {
                debug!("checkpoint blob pre-existed";
                    "vb" => vb, "node_uuid" => %blob.node_uuid, "assigned_worker" => %blob.assigned_worker);
                let claimable = (blob.node_uuid == self.config.node_uuid
                    || blob.node_uuid.is_empty())
                    && (blob.assigned_worker == worker || blob.assigned_worker.is_empty());
                if !claimable {
                    continue;
                }
                if self.check_if_already_enqueued(vb) {
                    continue;
                }
                self.add_to_enqueue_map(vb);
                requested.push(vb);

                let start_seq_no = blob.last_processed_seq_no;
                self.state.update(vb, |s| {
                    s.start_seq_no = start_seq_no;
                    s.last_processed_seq_no = start_seq_no;
                    s.timestamp = Utc::now().to_rfc3339();
                });
                self.req_stream_tx
                    .send(StreamRequestInfo {
                        vb,
                        vb_blob: blob,
                        start_seq_no,
                    })
                    .await
                    .map_err(|_| Error::ChannelClosed("req_stream"))?;
            }
        }

        // Wait until a STREAMREQ has actually been issued for everything we
        // queued; the processor works the queue one item at a time.
        retry(
            FixedBackoff(self.config.bucket_op_backoff),
            self.config.retry_count,
            || {
                let requested = requested.clone();
                async move {
                    let pending: Vec<u16> = requested
                        .iter()
                        .copied()
                        .filter(|&vb| !self.state.read(vb, |s| s.dcp_stream_requested))
                        .collect();
                    if pending.is_empty() {
                        Ok(())
                    } else {
                        Err(Error::Other(format!(
                            "streams not yet requested for {:?}",
                            pending
                        )))
                    }
                }
            },
        )
        .await
    }

    /// Post an event into the aggregated channel the way a feed reader does.
    /// Useful to hosts replaying events in tests and tooling.
    pub async fn inject_event(&self, event: DcpEvent) -> Result<()> {
        self.agg_feed_tx
            .send(event)
            .await
            .map_err(|_| Error::ChannelClosed("agg_feed"))
    }
}

fn spawn_routine(
    name: &'static str,
    fut: impl std::future::Future<Output = Result<()>> + Send + 'static,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        match fut.await {
            Ok(()) => info!("routine exited"; "routine" => name),
            Err(Error::RetryTimeout) => {
                error!("routine exiting due to retry timeout"; "routine" => name)
            }
            Err(err) => err.report(format_args!("routine {}", name)),
        }
    })
}
