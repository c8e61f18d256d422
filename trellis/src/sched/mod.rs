//! Two-level admission control: lane pools and per-session queues.
//!
//! A [`Lane`](lanes::Lane) bounds how many runs of one workload class
//! (`main`, `subagent`, `delegate`, `cron`) execute at once. A
//! [`SessionQueues`](session_queue::SessionQueues) table serializes runs per
//! session key and applies the configured collision policy when a message
//! arrives for a session that is already running.

pub mod lanes;
pub mod session_queue;

pub use lanes::{LaneError, LanePool, LaneStats, LANE_CRON, LANE_DELEGATE, LANE_MAIN, LANE_SUBAGENT};
pub use session_queue::{QueueMode, SessionGuard, SessionQueues, SessionQueuesConfig, Admission};
