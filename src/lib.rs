//! Flywheel — a cycle-dispatch workload engine.
//!
//! Flywheel drives numbered *cycles* of a user-defined action at a
//! controlled rate across a pool of worker threads, while observing
//! latency, tracking per-cycle outcomes, and supporting online
//! reconfiguration (rate changes, stride changes, start/stop).
//!
//! # Architecture
//!
//! The main building blocks are:
//!
//! - [`ActivityDef`] / [`Activity`]: the key/value configuration of an
//!   activity and the shared substrate (rate limiters, metrics) its
//!   workers run against.
//! - [`Input`]: produces batches of cycle numbers ([`CycleSegment`]s) for
//!   workers; [`AtomicInput`] hands out a contiguous interval exactly once
//!   across any number of threads.
//! - [`Action`]: the workload itself — [`SyncAction`] processes one cycle
//!   in the worker thread, [`AsyncAction`] accepts enqueued operations and
//!   completes them later.
//! - [`CoreMotor`]: the per-thread iteration harness tying input, rate
//!   limiters, action and output together; one motor per slot.
//! - Rate limiters ([`AverageRateLimiter`], [`StrictRateLimiter`],
//!   [`TokenPool`]/[`TokenFiller`]): nanosecond-precision pacing with a
//!   strictness blend between isochronous and bursty dispatch.
//! - [`CoreTracker`]: a ring of byte-marker extents recording per-cycle
//!   results, delivering them downstream strictly in cycle order with
//!   backpressure in both directions.
//! - [`MetricsRegistry`]: an explicitly threaded handle to the `cycles`,
//!   `phases`, `strides` and `read_input` timers and the
//!   `cco-delay-<label>` gauges.
//!
//! Data flows `Input → CoreMotor → RateLimiter → Action → Output`; an
//! external controller mutates the activity definition and the running
//! components retune in place, without restart.
//!
//! # Design goals
//!
//! - Lock-free hot paths: grant scheduling is a single atomic fetch-add;
//!   blocking happens in the calling thread, outside critical sections.
//! - Strict ordering downstream: consumers always observe cycle results in
//!   ascending cycle order, regardless of completion order in the action.
//! - Small, explicit seams: actions, inputs and outputs are plain traits;
//!   there is no global registry and no runtime discovery.
//!
//! # Where to start
//!
//! Read the docs for [`CoreMotor`], [`RateLimiter`] and [`CoreTracker`].
//! The motor tests in `src/motor/mod.rs` show complete sync and async
//! activities wired end to end.

pub mod action;
pub mod activity;
pub mod cycles;
pub mod error;
pub mod metrics;
pub mod motor;
pub mod rates;

pub use action::{Action, AsyncAction, DynError, Output, SyncAction};
pub use activity::{Activity, ActivityDef, ActivityDefObserver};
pub use cycles::{
    AtomicInput, ByteTrackerExtent, CoreTracker, CycleResult, CycleResultSegmentBuffer,
    CycleResultsSegment, CycleSegment, Input, TrackerConfig,
};
pub use error::{Error, Result};
pub use metrics::{MetricsRegistry, Timer};
pub use motor::{CoreMotor, MotorHandle, OpContext, RunState, SlotStateTracker, StrideTracker};
pub use rates::{
    AverageRateLimiter, NanoClock, RateLimiter, RateSpec, StrictRateLimiter, SystemClock,
    TestClock, TokenFiller, TokenPool,
};
