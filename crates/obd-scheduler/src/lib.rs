//! OBD-II Scheduler for Adaptive PID Sampling
//!
//! Polls the supported PIDs in fast / medium / slow groups with per-bus
//! cadences, demotes PIDs that keep missing, and publishes a carried-forward
//! snapshot after every fast-group pass.

mod scheduler;

pub use scheduler::{
    Cadence, CadenceTable, Demotion, PidScheduler, PollGroup, ScheduledPid, SchedulerConfig,
    SnapshotSink,
};
