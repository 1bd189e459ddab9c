//! PID Scheduler Implementation
//!
//! PIDs are split into fast / medium / slow groups, each with its own poll
//! interval and inter-command gap. A PID that keeps missing is demoted one
//! group at a time; the core PIDs (RPM, speed) never are.

use metrics::counter;
use obd_protocol::{BusClass, CarData, ObdClient, ObdError, ObdResponse, PidDecoder, PidRegistry};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Cadence tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PollGroup {
    /// Engine speed critical values
    Fast,
    /// Temperatures, load, airflow
    Medium,
    /// Counters and slowly changing values
    Slow,
}

impl PollGroup {
    /// Poll order within one tick
    pub const ALL: [PollGroup; 3] = [PollGroup::Fast, PollGroup::Medium, PollGroup::Slow];

    /// The next slower group, if any
    pub fn demoted(self) -> Option<PollGroup> {
        match self {
            PollGroup::Fast => Some(PollGroup::Medium),
            PollGroup::Medium => Some(PollGroup::Slow),
            PollGroup::Slow => None,
        }
    }
}

impl fmt::Display for PollGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PollGroup::Fast => "fast",
            PollGroup::Medium => "medium",
            PollGroup::Slow => "slow",
        };
        f.write_str(name)
    }
}

/// Interval and gap for one group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cadence {
    /// Minimum time between two polls of the group
    pub interval_ms: u64,
    /// Pause between two commands inside the group
    pub gap_ms: u64,
}

impl Cadence {
    const fn new(interval_ms: u64, gap_ms: u64) -> Self {
        Self { interval_ms, gap_ms }
    }
}

/// Cadences for the three groups on one bus family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CadenceTable {
    /// Fast group
    pub fast: Cadence,
    /// Medium group
    pub medium: Cadence,
    /// Slow group
    pub slow: Cadence,
}

impl CadenceTable {
    /// Cadence of `group`
    pub fn get(&self, group: PollGroup) -> Cadence {
        match group {
            PollGroup::Fast => self.fast,
            PollGroup::Medium => self.medium,
            PollGroup::Slow => self.slow,
        }
    }
}

fn codes(list: &[&str]) -> Vec<String> {
    list.iter().map(|code| code.to_string()).collect()
}

/// Configuration for the PID scheduler
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Cadences on CAN buses
    pub can: CadenceTable,
    /// Cadences on ISO 9141 / KWP buses
    pub iso: CadenceTable,
    /// Consecutive misses before demotion on CAN
    pub can_strike_limit: u32,
    /// Consecutive misses before demotion on ISO / KWP
    pub iso_strike_limit: u32,
    /// Misses forgiven per successful read
    pub strike_decay: u32,
    /// Never demoted
    pub core_pids: Vec<String>,
    /// Initial fast group members
    pub fast_pids: Vec<String>,
    /// Initial medium group members (unlisted PIDs land here too)
    pub medium_pids: Vec<String>,
    /// Initial slow group members
    pub slow_pids: Vec<String>,
    /// Polled when the vehicle profile names no preference
    pub default_pids: Vec<String>,
    /// Shortest sleep between two ticks
    pub min_tick_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            can: CadenceTable {
                fast: Cadence::new(120, 10),
                medium: Cadence::new(300, 15),
                slow: Cadence::new(900, 20),
            },
            iso: CadenceTable {
                fast: Cadence::new(160, 40),
                medium: Cadence::new(400, 60),
                slow: Cadence::new(1100, 80),
            },
            can_strike_limit: 3,
            iso_strike_limit: 10,
            strike_decay: 1,
            core_pids: codes(&["010C", "010D"]),
            fast_pids: codes(&["010C", "0111", "010D"]),
            medium_pids: codes(&["0105", "010F", "0104", "010B", "010E", "0110", "0133", "0122"]),
            slow_pids: codes(&[
                "012F", "015C", "010A", "012C", "012D", "012E", "0132", "0121", "0131", "0130",
                "0123",
            ]),
            default_pids: codes(&[
                "010C", "010D", "0111", "0105", "010F", "0104", "010B", "010E", "0110", "0133",
                "012F", "015C", "0142", "0146",
            ]),
            min_tick_ms: 5,
        }
    }
}

impl SchedulerConfig {
    /// Cadence table for a bus family; unknown buses get the slower table
    pub fn cadences(&self, bus: BusClass) -> &CadenceTable {
        if bus.is_can() {
            &self.can
        } else {
            &self.iso
        }
    }

    /// Demotion threshold for a bus family
    pub fn strike_limit(&self, bus: BusClass) -> u32 {
        if bus.is_can() {
            self.can_strike_limit
        } else {
            self.iso_strike_limit
        }
    }

    /// Initial group of `pid`
    pub fn initial_group(&self, pid: &str) -> PollGroup {
        let listed = |list: &[String]| list.iter().any(|p| p.eq_ignore_ascii_case(pid));
        if listed(&self.fast_pids) {
            PollGroup::Fast
        } else if listed(&self.slow_pids) {
            PollGroup::Slow
        } else {
            PollGroup::Medium
        }
    }

    fn is_core(&self, pid: &str) -> bool {
        self.core_pids.iter().any(|p| p.eq_ignore_ascii_case(pid))
    }
}

/// A PID moved to a slower group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Demotion {
    /// PID code
    pub pid: String,
    /// Previous group
    pub from: PollGroup,
    /// New group
    pub to: PollGroup,
}

/// Receives scheduler output. Called synchronously from the poll loop, so
/// implementations must be cheap.
pub trait SnapshotSink: Send {
    /// A fresh copy of the running snapshot
    fn publish(&mut self, snapshot: &CarData);

    /// A PID was demoted
    fn demoted(&mut self, _demotion: &Demotion) {}
}

/// A scheduled PID with its group and strike count
pub struct ScheduledPid {
    /// PID code, uppercase
    pub pid: String,
    /// Current group
    pub group: PollGroup,
    /// Consecutive-miss counter (decays on success)
    pub misses: u32,
    /// Exempt from demotion
    pub core: bool,
    decoder: Box<dyn PidDecoder>,
}

impl fmt::Debug for ScheduledPid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduledPid")
            .field("pid", &self.pid)
            .field("group", &self.group)
            .field("misses", &self.misses)
            .field("core", &self.core)
            .finish()
    }
}

/// PID Scheduler for managing OBD-II queries
pub struct PidScheduler {
    config: SchedulerConfig,
    bus: BusClass,
    pids: Vec<ScheduledPid>,
    last_polled: HashMap<PollGroup, Instant>,
    snapshot: CarData,
}

impl PidScheduler {
    /// Build the schedule.
    ///
    /// `desired` (or the configured defaults when empty) is intersected with
    /// `supported`; PIDs without a registered decoder are skipped.
    pub fn new(
        config: SchedulerConfig,
        bus: BusClass,
        desired: &[String],
        supported: impl Fn(&str) -> bool,
        registry: &PidRegistry,
    ) -> Self {
        let desired = if desired.is_empty() {
            &config.default_pids
        } else {
            desired
        };

        let mut pids: Vec<ScheduledPid> = Vec::new();
        for code in desired {
            let code = code.trim().to_ascii_uppercase();
            if pids.iter().any(|p| p.pid == code) {
                continue;
            }
            if !supported(&code) {
                debug!(pid = %code, "Skipping unsupported PID");
                continue;
            }
            let Some(decoder) = registry.try_create(&code) else {
                warn!(pid = %code, "No decoder registered, skipping");
                continue;
            };
            pids.push(ScheduledPid {
                group: config.initial_group(&code),
                core: config.is_core(&code),
                misses: 0,
                pid: code,
                decoder,
            });
        }

        info!(
            pids = pids.len(),
            ?bus,
            fast = pids.iter().filter(|p| p.group == PollGroup::Fast).count(),
            "PID scheduler created"
        );

        Self {
            config,
            bus,
            pids,
            last_polled: HashMap::new(),
            snapshot: CarData::new(),
        }
    }

    /// Number of scheduled PIDs
    pub fn pid_count(&self) -> usize {
        self.pids.len()
    }

    /// Scheduled PIDs in poll order
    pub fn pids(&self) -> &[ScheduledPid] {
        &self.pids
    }

    /// Current group of `pid`
    pub fn group_of(&self, pid: &str) -> Option<PollGroup> {
        self.find(pid).map(|idx| self.pids[idx].group)
    }

    /// Codes currently in `group`
    pub fn pids_in(&self, group: PollGroup) -> Vec<String> {
        self.pids
            .iter()
            .filter(|p| p.group == group)
            .map(|p| p.pid.clone())
            .collect()
    }

    /// Running snapshot (last known value of every field)
    pub fn snapshot(&self) -> &CarData {
        &self.snapshot
    }

    /// Account one poll result for `pid`.
    ///
    /// A success decays the miss counter; a miss increments it and demotes
    /// the PID once the bus strike limit is reached. The counter restarts
    /// after each demotion, so every step down takes a full set of misses.
    pub fn record_result(&mut self, pid: &str, success: bool) -> Option<Demotion> {
        let idx = self.find(pid)?;
        self.record_at(idx, success)
    }

    fn record_at(&mut self, idx: usize, success: bool) -> Option<Demotion> {
        let limit = self.config.strike_limit(self.bus);
        let decay = self.config.strike_decay;
        let entry = &mut self.pids[idx];

        if success {
            entry.misses = entry.misses.saturating_sub(decay);
            return None;
        }

        entry.misses = entry.misses.saturating_add(1).min(limit);
        if entry.core || entry.misses < limit {
            return None;
        }
        let to = entry.group.demoted()?;
        let demotion = Demotion {
            pid: entry.pid.clone(),
            from: entry.group,
            to,
        };
        entry.group = to;
        entry.misses = 0;
        warn!(pid = %demotion.pid, from = %demotion.from, to = %demotion.to, "PID demoted");
        Some(demotion)
    }

    /// Run one tick: poll every due group, publish after the fast group.
    ///
    /// Returns the time until the next group is due.
    pub async fn poll_due(
        &mut self,
        client: &ObdClient,
        sink: &mut dyn SnapshotSink,
        cancel: &CancellationToken,
    ) -> Result<Duration, ObdError> {
        let has_fast = self.has_members(PollGroup::Fast);
        for group in PollGroup::ALL {
            if !self.is_due(group, Instant::now()) {
                continue;
            }
            self.last_polled.insert(group, Instant::now());
            self.poll_group(group, client, sink, cancel).await?;
            if group == PollGroup::Fast || !has_fast {
                counter!("obd_snapshots_published_total").increment(1);
                sink.publish(&self.snapshot);
            }
        }
        Ok(self.until_next_due(Instant::now()))
    }

    /// Poll until cancelled or the transport fails
    pub async fn run(
        &mut self,
        client: &ObdClient,
        sink: &mut dyn SnapshotSink,
        cancel: &CancellationToken,
    ) -> Result<(), ObdError> {
        info!(pids = self.pids.len(), bus = ?self.bus, "Starting PID scheduler");
        let min_tick = Duration::from_millis(self.config.min_tick_ms);

        let result = loop {
            let wait = match self.poll_due(client, sink, cancel).await {
                Ok(wait) => wait,
                Err(ObdError::Cancelled) => break Ok(()),
                Err(e) => break Err(e),
            };
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break Ok(()),
                _ = tokio::time::sleep(wait.max(min_tick)) => {}
            }
        };

        match &result {
            Ok(()) => info!("PID scheduler stopped"),
            Err(e) => warn!(error = %e, "PID scheduler aborted"),
        }
        result
    }

    async fn poll_group(
        &mut self,
        group: PollGroup,
        client: &ObdClient,
        sink: &mut dyn SnapshotSink,
        cancel: &CancellationToken,
    ) -> Result<(), ObdError> {
        let gap = Duration::from_millis(self.config.cadences(self.bus).get(group).gap_ms);
        let members: Vec<usize> = (0..self.pids.len())
            .filter(|idx| self.pids[*idx].group == group)
            .collect();

        for (n, idx) in members.into_iter().enumerate() {
            if n > 0 {
                cancellable(cancel, async {
                    tokio::time::sleep(gap).await;
                    Ok(())
                })
                .await?;
            }

            let pid = self.pids[idx].pid.clone();
            let response = query(client, &pid, cancel).await?;
            counter!("obd_poll_total").increment(1);

            let entry = &mut self.pids[idx];
            entry.decoder.parse(&response.raw);
            let success = entry.decoder.has_value();
            if success {
                entry.decoder.apply_to(&mut self.snapshot);
            } else {
                counter!("obd_poll_miss_total").increment(1);
                debug!(pid = %pid, raw = %response.raw, misses = entry.misses + 1, "Poll miss");
            }

            if let Some(demotion) = self.record_at(idx, success) {
                counter!("obd_pid_demotions_total").increment(1);
                sink.demoted(&demotion);
            }
        }
        Ok(())
    }

    fn find(&self, pid: &str) -> Option<usize> {
        self.pids
            .iter()
            .position(|p| p.pid.eq_ignore_ascii_case(pid.trim()))
    }

    fn has_members(&self, group: PollGroup) -> bool {
        self.pids.iter().any(|p| p.group == group)
    }

    fn interval(&self, group: PollGroup) -> Duration {
        Duration::from_millis(self.config.cadences(self.bus).get(group).interval_ms)
    }

    fn is_due(&self, group: PollGroup, now: Instant) -> bool {
        if !self.has_members(group) {
            return false;
        }
        match self.last_polled.get(&group) {
            Some(last) => now.duration_since(*last) >= self.interval(group),
            None => true,
        }
    }

    fn until_next_due(&self, now: Instant) -> Duration {
        PollGroup::ALL
            .into_iter()
            .filter(|group| self.has_members(*group))
            .map(|group| match self.last_polled.get(&group) {
                Some(last) => (*last + self.interval(group)).saturating_duration_since(now),
                None => Duration::ZERO,
            })
            .min()
            .unwrap_or_else(|| self.interval(PollGroup::Slow))
    }
}

/// One query with a single immediate retry on an empty / `NO DATA` reply
async fn query(
    client: &ObdClient,
    pid: &str,
    cancel: &CancellationToken,
) -> Result<ObdResponse, ObdError> {
    let response = cancellable(cancel, client.query_pid(pid)).await?;
    if !response.is_no_data() {
        return Ok(response);
    }
    debug!(pid, raw = %response.raw, "No data, retrying once");
    cancellable(cancel, client.query_pid(pid)).await
}

async fn cancellable<T, F>(cancel: &CancellationToken, fut: F) -> Result<T, ObdError>
where
    F: Future<Output = Result<T, ObdError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ObdError::Cancelled),
        result = fut => result,
    }
}
