// Copyright 2022 TiKV Project Authors. Licensed under Apache-2.0.

//! Per-node eventing consumer core: the vbucket ownership and DCP streaming
//! control plane.
//!
//! A [`consumer::Consumer`] owns a subset of a source bucket's vbuckets,
//! keeps one DCP stream per owned vbucket against the upstream data service,
//! forwards mutations and deletions to an external JS execution worker, and
//! persists per-vbucket ownership and checkpoint metadata so that a planner
//! may redistribute vbuckets across nodes without losing or duplicating
//! work.
//!
//! The long-lived routines and their channels:
//!
//! ```text
//!  per-KV-host DCP feeds --(aggregated event channel)--> router
//!  router --(vb flog channel)--> failover-log handler
//!  failover-log handler --(stream request channel)--> stream request processor
//!  stream request processor --(DCP STREAMREQ)--> upstream, back to router
//!  cluster/settings/tick --> control routine --> pending close/restream queues
//! ```
//!
//! Cycles are broken at channel boundaries only; no routine calls another
//! directly.

#[macro_use]
pub mod logging;

pub mod config;
pub mod consumer;
pub mod control;
pub mod dcp;
pub mod errors;
pub mod failover;
pub mod feeds;
pub mod metadata;
pub mod metrics;
pub mod router;
pub mod state;
pub mod stream_request;
pub mod utils;
pub mod worker;

pub use crate::{
    consumer::{Consumer, ConsumerHandles, Deps, Planner},
    errors::{Error, Result},
};
