// Copyright 2022 TiKV Project Authors. Licensed under Apache-2.0.

use lazy_static::lazy_static;
use prometheus::{
    register_int_counter_vec, register_int_gauge, IntCounterVec, IntGauge,
};

lazy_static! {
    pub static ref DCP_MESSAGES_PROCESSED: IntCounterVec = register_int_counter_vec!(
        "eventing_consumer_dcp_messages_total",
        "Total DCP messages drained from the aggregated feed, by opcode.",
        &["opcode"]
    )
    .unwrap();
    pub static ref STREAM_REQUESTS: IntCounterVec = register_int_counter_vec!(
        "eventing_consumer_stream_requests_total",
        "STREAMREQ calls issued to upstream feeds, by result.",
        &["result"]
    )
    .unwrap();
    pub static ref EVENTS_FORWARDED: IntCounterVec = register_int_counter_vec!(
        "eventing_consumer_events_forwarded_total",
        "Events handed to the JS execution worker, by kind.",
        &["kind"]
    )
    .unwrap();
    pub static ref EVENTS_SUPPRESSED: IntCounterVec = register_int_counter_vec!(
        "eventing_consumer_events_suppressed_total",
        "Events dropped before the JS worker, by reason.",
        &["reason"]
    )
    .unwrap();
    pub static ref AGG_FEED_BYTES: IntGauge = register_int_gauge!(
        "eventing_consumer_agg_feed_bytes",
        "In-flight bytes sitting in the aggregated DCP event channel."
    )
    .unwrap();
    pub static ref CHECKPOINT_OPS: IntCounterVec = register_int_counter_vec!(
        "eventing_consumer_checkpoint_ops_total",
        "Metadata bucket operations issued by the checkpointer, by op.",
        &["op"]
    )
    .unwrap();
}
