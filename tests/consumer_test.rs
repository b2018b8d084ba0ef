// Copyright 2022 TiKV Project Authors. Licensed under Apache-2.0.

//! End-to-end scenarios for the streaming control plane, driven through
//! in-memory fakes: a scriptable DCP client, an in-memory metadata store,
//! a flippable planner, and a collecting worker sink.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use eventing_consumer::{
    config::{ConfigStore, ConsumerConfig},
    consumer::{Consumer, ConsumerHandles, Deps, Planner},
    dcp::{
        DcpClient, DcpEvent, DcpFeed, DcpOpcode, DcpStatus, FailoverLog, StreamRequest,
    },
    errors::{Error, Result},
    metadata::{MemStore, MetaStore, StreamStatus, VbucketMetaBlob},
    worker::{TimerEvent, WorkerQueueSizes, WorkerSink},
};
use tokio::sync::mpsc;

// ---- fakes ----

/// A scripted STREAMREQ response.
#[derive(Clone, Copy, Debug)]
struct Script {
    status: DcpStatus,
    seqno: u64,
}

struct DcpShared {
    vb_map: Mutex<HashMap<u16, String>>,
    flogs: Mutex<HashMap<u16, FailoverLog>>,
    scripts: Mutex<HashMap<u16, VecDeque<Script>>>,
    high_seqnos: Mutex<HashMap<u16, u64>>,
    auto_respond: AtomicBool,
}

struct MockFeed {
    name: String,
    kv_host: String,
    shared: Arc<DcpShared>,
    events_tx: mpsc::Sender<DcpEvent>,
    requests: Mutex<Vec<StreamRequest>>,
    stream_closes: Mutex<Vec<u16>>,
    closed: AtomicBool,
}

impl MockFeed {
    fn respond_stream_req(&self, vb: u16, script: Script) {
        let flog = self.shared.flogs.lock().unwrap().get(&vb).cloned();
        let event = DcpEvent {
            opcode: DcpOpcode::StreamReq,
            vbucket: vb,
            seqno: script.seqno,
            status: script.status,
            failover_log: flog,
            ..Default::default()
        };
        let tx = self.events_tx.clone();
        tokio::spawn(async move {
            let _ = tx.send(event).await;
        });
    }

    async fn send_event(&self, event: DcpEvent) {
        self.events_tx.send(event).await.expect("feed channel open");
    }
}

#[async_trait]
impl DcpFeed for MockFeed {
    async fn request_stream(&self, req: StreamRequest) -> Result<()> {
        self.requests.lock().unwrap().push(req);
        if self.shared.auto_respond.load(Ordering::SeqCst) {
            let script = self
                .shared
                .scripts
                .lock()
                .unwrap()
                .get_mut(&req.vb)
                .and_then(|q| q.pop_front())
                .unwrap_or(Script {
                    status: DcpStatus::Success,
                    seqno: 0,
                });
            self.respond_stream_req(req.vb, script);
        }
        Ok(())
    }

    async fn close_stream(&self, vb: u16, _opaque: u16) -> Result<()> {
        self.stream_closes.lock().unwrap().push(vb);
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[derive(Default)]
struct MockDcp {
    shared: Arc<DcpShared>,
    feeds: Mutex<Vec<Arc<MockFeed>>>,
}

impl Default for DcpShared {
    fn default() -> Self {
        DcpShared {
            vb_map: Mutex::new(HashMap::new()),
            flogs: Mutex::new(HashMap::new()),
            scripts: Mutex::new(HashMap::new()),
            high_seqnos: Mutex::new(HashMap::new()),
            auto_respond: AtomicBool::new(true),
        }
    }
}

impl MockDcp {
    fn set_vb_map(&self, map: &[(u16, &str)]) {
        let mut vb_map = self.shared.vb_map.lock().unwrap();
        vb_map.clear();
        for (vb, host) in map {
            vb_map.insert(*vb, (*host).to_owned());
        }
    }

    fn set_flog(&self, vb: u16, flog: FailoverLog) {
        self.shared.flogs.lock().unwrap().insert(vb, flog);
    }

    fn push_script(&self, vb: u16, status: DcpStatus, seqno: u64) {
        self.shared
            .scripts
            .lock()
            .unwrap()
            .entry(vb)
            .or_default()
            .push_back(Script { status, seqno });
    }

    fn feed_for_host(&self, kv_host: &str) -> Option<Arc<MockFeed>> {
        self.feeds
            .lock()
            .unwrap()
            .iter()
            .find(|f| f.kv_host == kv_host && !f.closed.load(Ordering::SeqCst))
            .cloned()
    }

    fn feed_serving_vb(&self, vb: u16) -> Option<Arc<MockFeed>> {
        let host = self.shared.vb_map.lock().unwrap().get(&vb).cloned()?;
        self.feed_for_host(&host)
    }

    /// Manual-mode reply to the latest STREAMREQ for `vb`.
    fn respond(&self, vb: u16, status: DcpStatus, seqno: u64) {
        let feed = self.feed_serving_vb(vb).expect("a feed serves the vb");
        feed.respond_stream_req(vb, Script { status, seqno });
    }

    fn requests_for(&self, vb: u16) -> Vec<StreamRequest> {
        self.feeds
            .lock()
            .unwrap()
            .iter()
            .flat_map(|f| {
                f.requests
                    .lock()
                    .unwrap()
                    .iter()
                    .copied()
                    .filter(|r| r.vb == vb)
                    .collect::<Vec<_>>()
            })
            .collect()
    }
}

#[async_trait]
impl DcpClient for MockDcp {
    async fn refresh_vb_map(&self) -> Result<HashMap<u16, String>> {
        Ok(self.shared.vb_map.lock().unwrap().clone())
    }

    async fn start_feed(
        &self,
        name: String,
        kv_host: &str,
    ) -> Result<(Arc<dyn DcpFeed>, mpsc::Receiver<DcpEvent>)> {
        let (events_tx, events_rx) = mpsc::channel(1024);
        let feed = Arc::new(MockFeed {
            name,
            kv_host: kv_host.to_owned(),
            shared: self.shared.clone(),
            events_tx,
            requests: Mutex::new(Vec::new()),
            stream_closes: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });
        self.feeds.lock().unwrap().push(feed.clone());
        Ok((feed, events_rx))
    }

    async fn failover_log(&self, vb: u16) -> Result<FailoverLog> {
        self.shared
            .flogs
            .lock()
            .unwrap()
            .get(&vb)
            .cloned()
            .ok_or(Error::EmptyFailoverLog(vb))
    }

    async fn high_seqnos(&self) -> Result<HashMap<u16, u64>> {
        Ok(self.shared.high_seqnos.lock().unwrap().clone())
    }
}

struct TestPlanner {
    owned: Mutex<HashSet<u16>>,
    running: AtomicBool,
    deployed: AtomicBool,
}

impl TestPlanner {
    fn owning(vbs: &[u16]) -> Arc<TestPlanner> {
        Arc::new(TestPlanner {
            owned: Mutex::new(vbs.iter().copied().collect()),
            running: AtomicBool::new(false),
            deployed: AtomicBool::new(true),
        })
    }

    fn drop_vb(&self, vb: u16) {
        self.owned.lock().unwrap().remove(&vb);
    }
}

#[async_trait]
impl Planner for TestPlanner {
    fn should_own(&self, vb: u16) -> bool {
        self.owned.lock().unwrap().contains(&vb)
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn is_deployed(&self, _app: &str) -> bool {
        self.deployed.load(Ordering::SeqCst)
    }

    async fn eventing_node_addrs(&self) -> Result<Vec<String>> {
        Ok(vec!["127.0.0.1:8096".to_owned()])
    }
}

#[derive(Default)]
struct CollectingSink {
    mutations: Mutex<Vec<(u16, u64, Vec<u8>)>>,
    deletions: Mutex<Vec<(u16, u64)>>,
    timers: Mutex<Vec<TimerEvent>>,
    log_levels: Mutex<Vec<String>>,
}

impl CollectingSink {
    fn mutations_for(&self, vb: u16) -> Vec<(u16, u64, Vec<u8>)> {
        self.mutations
            .lock()
            .unwrap()
            .iter()
            .filter(|(m_vb, ..)| *m_vb == vb)
            .cloned()
            .collect()
    }
}

impl WorkerSink for CollectingSink {
    fn send_mutation(&self, event: &DcpEvent) {
        self.mutations
            .lock()
            .unwrap()
            .push((event.vbucket, event.seqno, event.value.clone()));
    }

    fn send_deletion(&self, event: &DcpEvent) {
        self.deletions
            .lock()
            .unwrap()
            .push((event.vbucket, event.seqno));
    }

    fn send_timer(&self, timer: &TimerEvent) {
        self.timers.lock().unwrap().push(timer.clone());
    }

    fn send_log_level(&self, level: &str) {
        self.log_levels.lock().unwrap().push(level.to_owned());
    }

    fn queue_sizes(&self) -> WorkerQueueSizes {
        WorkerQueueSizes::default()
    }
}

struct StaticConfigStore {
    docs: Mutex<HashMap<String, Vec<u8>>>,
}

#[async_trait]
impl ConfigStore for StaticConfigStore {
    async fn get(&self, path: &str) -> Result<Vec<u8>> {
        self.docs
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| Error::ConfigStore(format!("no document at {}", path)))
    }
}

// ---- harness ----

struct Harness {
    consumer: Consumer,
    dcp: Arc<MockDcp>,
    planner: Arc<TestPlanner>,
    sink: Arc<CollectingSink>,
    store: Arc<MemStore>,
    config_store: Arc<StaticConfigStore>,
    _handles: ConsumerHandles,
}

fn test_config() -> ConsumerConfig {
    ConsumerConfig {
        app_name: "credit_score".to_owned(),
        handler_uuid: 777,
        worker_name: "worker_0".to_owned(),
        node_uuid: "node-1".to_owned(),
        host_port_addr: "127.0.0.1:8096".to_owned(),
        num_vbuckets: 16,
        retry_count: 40,
        bucket_op_backoff: Duration::from_millis(10),
        cluster_op_backoff: Duration::from_millis(10),
        restart_tick_interval: Duration::from_millis(50),
        stats_tick_interval: Duration::from_secs(600),
        ..Default::default()
    }
}

fn harness(planner: Arc<TestPlanner>) -> Harness {
    let dcp = Arc::new(MockDcp::default());
    let sink = Arc::new(CollectingSink::default());
    let store = Arc::new(MemStore::default());
    let config_store = Arc::new(StaticConfigStore {
        docs: Mutex::new(HashMap::new()),
    });
    let (consumer, handles) = Consumer::new(
        test_config(),
        Deps {
            dcp: dcp.clone(),
            meta_store: store.clone(),
            config_store: config_store.clone(),
            planner: planner.clone(),
            sink: sink.clone(),
        },
    );
    consumer.start();
    Harness {
        consumer,
        dcp,
        planner,
        sink,
        store,
        config_store,
        _handles: handles,
    }
}

async fn wait_for(mut cond: impl FnMut() -> bool, what: &str) {
    for _ in 0..400 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {}", what);
}

async fn blob_of(store: &MemStore, app: &str, vb: u16) -> VbucketMetaBlob {
    let key = format!("{}::vb::{}", app, vb);
    let (bytes, _) = store
        .get(&key)
        .await
        .unwrap()
        .unwrap_or_else(|| panic!("blob missing for {}", key));
    serde_json::from_slice(&bytes).unwrap()
}

async fn wait_for_blob(
    store: &MemStore,
    vb: u16,
    cond: impl Fn(&VbucketMetaBlob) -> bool,
    what: &str,
) {
    let key = format!("credit_score::vb::{}", vb);
    for _ in 0..400 {
        if let Some((bytes, _)) = store.get(&key).await.unwrap() {
            let blob: VbucketMetaBlob = serde_json::from_slice(&bytes).unwrap();
            if cond(&blob) {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {}", what);
}

async fn wait_for_running(h: &Harness, vb: u16) {
    wait_for_blob(
        &h.store,
        vb,
        |blob| blob.dcp_stream_status == StreamStatus::Running,
        "vb blob to reach running",
    )
    .await;
}

// ---- scenarios ----

#[tokio::test(flavor = "multi_thread")]
async fn test_cold_bootstrap() {
    let h = harness(TestPlanner::owning(&[7]));
    h.dcp.set_vb_map(&[(7, "kv1:11210")]);
    h.dcp.set_flog(7, FailoverLog(vec![(0xAB, 0)]));

    h.consumer
        .start_dcp(HashMap::from([(7u16, FailoverLog(vec![(0xAB, 0)]))]))
        .await
        .unwrap();
    wait_for_running(&h, 7).await;

    let blob = blob_of(&h.store, "credit_score", 7).await;
    assert_eq!(blob.dcp_stream_status, StreamStatus::Running);
    assert_eq!(blob.assigned_worker, "worker_0");
    assert_eq!(blob.node_uuid, "node-1");
    assert_eq!(blob.vb_uuid, 0xAB);
    let ops: Vec<StreamStatus> = blob
        .ownership_history
        .iter()
        .map(|e| e.operation)
        .collect();
    assert_eq!(
        ops,
        vec![
            StreamStatus::Bootstrap,
            StreamStatus::Requested,
            StreamStatus::Running
        ]
    );

    let requests = h.dcp.requests_for(7);
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].start_seq_no, 0);
    assert_eq!(requests[0].vb_uuid, 0xAB);
    assert_eq!(requests[0].opaque, 7);
    assert_eq!(h.consumer.owned_vbs(), vec![7]);

    h.consumer.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_mutations_flow_to_worker() {
    let h = harness(TestPlanner::owning(&[2]));
    h.dcp.set_vb_map(&[(2, "kv1:11210")]);
    h.dcp.set_flog(2, FailoverLog(vec![(5, 0)]));

    h.consumer
        .start_dcp(HashMap::from([(2u16, FailoverLog(vec![(5, 0)]))]))
        .await
        .unwrap();
    wait_for_running(&h, 2).await;

    let feed = h.dcp.feed_serving_vb(2).unwrap();
    feed.send_event(DcpEvent {
        opcode: DcpOpcode::Mutation,
        vbucket: 2,
        key: b"doc-1".to_vec(),
        value: br#"{"n":1}"#.to_vec(),
        seqno: 4,
        cas: 100,
        ..Default::default()
    })
    .await;
    feed.send_event(DcpEvent {
        opcode: DcpOpcode::Deletion,
        vbucket: 2,
        key: b"doc-2".to_vec(),
        seqno: 5,
        ..Default::default()
    })
    .await;

    let sink = h.sink.clone();
    wait_for(
        move || {
            sink.mutations_for(2).len() == 1 && !sink.deletions.lock().unwrap().is_empty()
        },
        "mutation and deletion forwards",
    )
    .await;

    h.consumer.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_rebalance_out_closes_stream_and_clears_owner() {
    let h = harness(TestPlanner::owning(&[3]));
    h.dcp.set_vb_map(&[(3, "kv1:11210")]);
    h.dcp.set_flog(3, FailoverLog(vec![(9, 0)]));

    h.consumer
        .start_dcp(HashMap::from([(3u16, FailoverLog(vec![(9, 0)]))]))
        .await
        .unwrap();
    wait_for_running(&h, 3).await;

    let feed = h.dcp.feed_serving_vb(3).unwrap();
    feed.send_event(DcpEvent {
        opcode: DcpOpcode::Mutation,
        vbucket: 3,
        key: b"doc".to_vec(),
        value: br#"{"n":9}"#.to_vec(),
        seqno: 9,
        ..Default::default()
    })
    .await;
    let sink = h.sink.clone();
    wait_for(move || sink.mutations_for(3).len() == 1, "mutation forward").await;

    // The planner moves vb 3 away; the (external) state update routine
    // queues the close, and the restart tick issues it.
    h.planner.drop_vb(3);
    h.consumer.enqueue_vbs_for_close(&[3]);

    let feed_for_close = feed.clone();
    wait_for(
        move || feed_for_close.stream_closes.lock().unwrap().contains(&3),
        "dcp close stream",
    )
    .await;

    wait_for_blob(
        &h.store,
        3,
        |blob| blob.seq_no_after_close_stream == 9,
        "seq_no_after_close_stream checkpoint",
    )
    .await;

    // The server terminates the stream; owner fields clear and no reclaim
    // happens because the plan assigns the vb elsewhere. Processing the
    // same STREAMEND twice is idempotent.
    for _ in 0..2 {
        feed.send_event(DcpEvent {
            opcode: DcpOpcode::StreamEnd,
            vbucket: 3,
            ..Default::default()
        })
        .await;
        wait_for_blob(
            &h.store,
            3,
            |blob| {
                blob.assigned_worker.is_empty()
                    && blob.dcp_stream_status == StreamStatus::Stopped
            },
            "owner fields cleared",
        )
        .await;
    }

    let blob = blob_of(&h.store, "credit_score", 3).await;
    assert_eq!(blob.previous_assigned_worker, "worker_0");
    assert_eq!(blob.last_processed_seq_no, 9);
    assert!(blob.node_uuid.is_empty());

    // No restream happened: one STREAMREQ total, and nothing more arrives
    // at the worker.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(h.dcp.requests_for(3).len(), 1);
    assert_eq!(h.sink.mutations_for(3).len(), 1);

    h.consumer.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stream_end_with_reownership_restreams_once() {
    let h = harness(TestPlanner::owning(&[4]));
    h.dcp.set_vb_map(&[(4, "kv1:11210")]);
    h.dcp.set_flog(4, FailoverLog(vec![(11, 0)]));

    h.consumer
        .start_dcp(HashMap::from([(4u16, FailoverLog(vec![(11, 0)]))]))
        .await
        .unwrap();
    wait_for_running(&h, 4).await;

    let feed = h.dcp.feed_serving_vb(4).unwrap();
    feed.send_event(DcpEvent {
        opcode: DcpOpcode::Mutation,
        vbucket: 4,
        key: b"doc".to_vec(),
        value: br#"{"n":5}"#.to_vec(),
        seqno: 5,
        ..Default::default()
    })
    .await;
    let sink = h.sink.clone();
    wait_for(move || sink.mutations_for(4).len() == 1, "mutation forward").await;

    // KV drops the stream while the plan still assigns the vb here: the
    // consumer reclaims it with a new STREAMREQ resuming at the last
    // processed seqno.
    feed.send_event(DcpEvent {
        opcode: DcpOpcode::StreamEnd,
        vbucket: 4,
        ..Default::default()
    })
    .await;

    let dcp = h.dcp.clone();
    wait_for(move || dcp.requests_for(4).len() == 2, "second stream request").await;
    wait_for_running(&h, 4).await;

    let requests = h.dcp.requests_for(4);
    assert_eq!(requests[1].start_seq_no, 5);

    // The restream queue is idempotent: no third request sneaks in.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(h.dcp.requests_for(4).len(), 2);

    h.consumer.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_rollback_honours_server_seqno() {
    let h = harness(TestPlanner::owning(&[9]));
    h.dcp.set_vb_map(&[(9, "kv1:11210")]);
    h.dcp.set_flog(9, FailoverLog(vec![(0xDEAD, 100)]));
    h.dcp.push_script(9, DcpStatus::Rollback, 100);

    // A pre-existing checkpoint at seqno 500 under the previous vbuuid.
    let blob = VbucketMetaBlob {
        vb_id: 9,
        vb_uuid: 0xB01D,
        last_processed_seq_no: 500,
        ..Default::default()
    };
    h.store
        .set("credit_score::vb::9", serde_json::to_vec(&blob).unwrap())
        .await
        .unwrap();

    h.consumer
        .start_dcp(HashMap::from([(9u16, FailoverLog(vec![(0xDEAD, 100)]))]))
        .await
        .unwrap();

    let dcp = h.dcp.clone();
    wait_for(move || dcp.requests_for(9).len() == 2, "retried stream request").await;
    wait_for_running(&h, 9).await;

    let requests = h.dcp.requests_for(9);
    assert_eq!(requests[0].start_seq_no, 500);
    // The retry honours the server-dictated rewind and the fresh vbuuid.
    assert_eq!(requests[1].start_seq_no, 100);
    assert_eq!(requests[1].vb_uuid, 0xDEAD);

    let blob = blob_of(&h.store, "credit_score", 9).await;
    assert_eq!(blob.vb_uuid, 0xDEAD);
    let ops: Vec<StreamStatus> = blob
        .ownership_history
        .iter()
        .map(|e| e.operation)
        .collect();
    assert!(ops.contains(&StreamStatus::RequestFailed));
    assert_eq!(*ops.last().unwrap(), StreamStatus::Running);

    h.consumer.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_ownership_handoff_filters_inflight_events() {
    let h = harness(TestPlanner::owning(&[6]));
    h.dcp.set_vb_map(&[(6, "kv1:11210")]);
    h.dcp.set_flog(6, FailoverLog(vec![(21, 0)]));
    h.dcp.shared.auto_respond.store(false, Ordering::SeqCst);

    let consumer = h.consumer.clone();
    let start = tokio::spawn(async move {
        consumer
            .start_dcp(HashMap::from([(6u16, FailoverLog(vec![(21, 0)]))]))
            .await
    });

    let dcp = h.dcp.clone();
    wait_for(move || dcp.requests_for(6).len() == 1, "stream request issued").await;
    start.await.unwrap().unwrap();

    // The plan moves the vb away before the STREAMREQ response lands: the
    // router must queue a close and drop every in-flight event.
    h.planner.drop_vb(6);
    h.dcp.respond(6, DcpStatus::Success, 0);

    let consumer = h.consumer.clone();
    wait_for(
        move || consumer.vbs_remaining_to_close().contains(&6),
        "vb queued for close",
    )
    .await;

    let feed = h.dcp.feed_serving_vb(6).unwrap();
    feed.send_event(DcpEvent {
        opcode: DcpOpcode::Mutation,
        vbucket: 6,
        key: b"doc".to_vec(),
        value: br#"{"n":1}"#.to_vec(),
        seqno: 3,
        ..Default::default()
    })
    .await;

    let feed_for_close = feed.clone();
    wait_for(
        move || feed_for_close.stream_closes.lock().unwrap().contains(&6),
        "close issued",
    )
    .await;
    assert!(h.sink.mutations_for(6).is_empty());

    h.consumer.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_feed_cleanup_on_vbmap_change() {
    let h = harness(TestPlanner::owning(&[1, 2]));
    h.dcp.set_vb_map(&[(1, "kvA:11210"), (2, "kvB:11210")]);
    h.dcp.set_flog(1, FailoverLog(vec![(31, 0)]));
    h.dcp.set_flog(2, FailoverLog(vec![(32, 0)]));

    h.consumer
        .start_dcp(HashMap::from([
            (1u16, FailoverLog(vec![(31, 0)])),
            (2u16, FailoverLog(vec![(32, 0)])),
        ]))
        .await
        .unwrap();
    wait_for_running(&h, 1).await;
    wait_for_running(&h, 2).await;

    let feed_b = h.dcp.feed_for_host("kvB:11210").unwrap();

    // kvB leaves the vb map; its feed must be closed and the vbuckets that
    // were bound to it released in the metadata bucket.
    h.dcp.set_vb_map(&[(1, "kvA:11210"), (2, "kvA:11210")]);
    h.consumer.refresh_kv_vb_map().await.unwrap();
    h.consumer.cleanup_stale_feeds().await.unwrap();

    assert!(feed_b.closed.load(Ordering::SeqCst));
    let blob = blob_of(&h.store, "credit_score", 2).await;
    assert!(blob.assigned_worker.is_empty());
    assert_eq!(blob.dcp_stream_status, StreamStatus::Stopped);
    assert_eq!(blob.previous_assigned_worker, "worker_0");

    // The kvA feed is untouched.
    let feed_a = h.dcp.feed_for_host("kvA:11210").unwrap();
    assert!(!feed_a.closed.load(Ordering::SeqCst));

    h.consumer.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_restream_enqueue_is_idempotent() {
    let h = harness(TestPlanner::owning(&[5]));
    h.dcp.set_vb_map(&[(5, "kv1:11210")]);
    h.dcp.set_flog(5, FailoverLog(vec![(41, 0)]));

    let blob = VbucketMetaBlob {
        vb_id: 5,
        last_processed_seq_no: 77,
        ..Default::default()
    };
    h.store
        .set("credit_score::vb::5", serde_json::to_vec(&blob).unwrap())
        .await
        .unwrap();

    h.consumer.enqueue_vbs_for_restream(&[5, 5]);
    h.consumer.enqueue_vbs_for_restream(&[5]);

    let dcp = h.dcp.clone();
    wait_for(move || !dcp.requests_for(5).is_empty(), "stream request").await;
    wait_for_running(&h, 5).await;

    tokio::time::sleep(Duration::from_millis(300)).await;
    let requests = h.dcp.requests_for(5);
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].start_seq_no, 77);

    h.consumer.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_self_recursion_suppression_end_to_end() {
    use byteorder::{BigEndian, ByteOrder};

    let h = harness(TestPlanner::owning(&[8]));
    h.dcp.set_vb_map(&[(8, "kv1:11210")]);
    h.dcp.set_flog(8, FailoverLog(vec![(51, 0)]));

    h.consumer
        .start_dcp(HashMap::from([(8u16, FailoverLog(vec![(51, 0)]))]))
        .await
        .unwrap();
    wait_for_running(&h, 8).await;

    let body = br#"{"score":10}"#;
    let cas = 0x4242u64;
    let digest = crc32fast::hash(body);
    let meta = format!(r#"{{"cas":"0x{:x}","digest":{}}}"#, cas, digest);
    let mut frame = Vec::new();
    frame.extend_from_slice(b"777");
    frame.push(0);
    frame.extend_from_slice(meta.as_bytes());
    frame.push(0);
    let mut section = Vec::new();
    let mut len = [0u8; 4];
    BigEndian::write_u32(&mut len, frame.len() as u32);
    section.extend_from_slice(&len);
    section.extend_from_slice(&frame);
    let mut value = Vec::new();
    BigEndian::write_u32(&mut len, section.len() as u32);
    value.extend_from_slice(&len);
    value.extend_from_slice(&section);
    value.extend_from_slice(body);

    let feed = h.dcp.feed_serving_vb(8).unwrap();
    // The handler's own write: xattr cas matches the event cas.
    feed.send_event(DcpEvent {
        opcode: DcpOpcode::Mutation,
        vbucket: 8,
        key: b"doc".to_vec(),
        value: value.clone(),
        seqno: 10,
        cas,
        datatype: eventing_consumer::dcp::DcpDatatype::JsonXattr,
        ..Default::default()
    })
    .await;
    // A foreign write of the same document: different cas, different body.
    let mut foreign = value.clone();
    foreign.truncate(value.len() - body.len());
    foreign.extend_from_slice(br#"{"score":11}"#);
    feed.send_event(DcpEvent {
        opcode: DcpOpcode::Mutation,
        vbucket: 8,
        key: b"doc".to_vec(),
        value: foreign,
        seqno: 11,
        cas: cas + 1,
        datatype: eventing_consumer::dcp::DcpDatatype::JsonXattr,
        ..Default::default()
    })
    .await;

    let sink = h.sink.clone();
    wait_for(move || sink.mutations_for(8).len() == 1, "foreign forward").await;
    // Only the foreign mutation reached the worker, with the xattr region
    // stripped off.
    let forwards = h.sink.mutations_for(8);
    assert_eq!(forwards.len(), 1);
    assert_eq!(forwards[0].1, 11);
    assert_eq!(forwards[0].2, br#"{"score":11}"#.to_vec());

    h.consumer.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_settings_change_applies_known_keys() {
    let h = harness(TestPlanner::owning(&[]));
    h.config_store.docs.lock().unwrap().insert(
        "/eventing/settings/credit_score".to_owned(),
        br#"{"log_level":"DEBUG","skip_timer_threshold":120,"vb_ownership_giveup_routine_count":3,"unknown_key":true}"#
            .to_vec(),
    );

    h.consumer.notify_settings_change().await;

    let sink = h.sink.clone();
    wait_for(
        move || sink.log_levels.lock().unwrap().contains(&"DEBUG".to_owned()),
        "log level echoed to worker",
    )
    .await;

    h.consumer.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_timer_events_forward_to_worker() {
    let h = harness(TestPlanner::owning(&[]));
    h.consumer
        .send_timer_event(TimerEvent {
            vb: 1,
            seq_no: 10,
            doc_id: "doc-1".to_owned(),
            callback: "onTimer".to_owned(),
        })
        .await
        .unwrap();

    let sink = h.sink.clone();
    wait_for(
        move || !sink.timers.lock().unwrap().is_empty(),
        "timer forward",
    )
    .await;
    assert_eq!(h.sink.timers.lock().unwrap()[0].doc_id, "doc-1");

    h.consumer.stop();
}
