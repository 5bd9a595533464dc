//! SLA monitoring: latency percentiles, uptime accounting, queue depth.
//!
//! Workers append latency samples through a single lock; request
//! handlers only ever read snapshots. Background loops drive the
//! self-heartbeat, the queue-depth sampler, and the periodic text report
//! appended to `sla_report.txt`.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::state::InstanceContext;

/// p95 end-to-end latency target, seconds.
pub const TARGET_P95_SECS: f64 = 2.0;
/// Minimum acceptable uptime ratio.
pub const TARGET_UPTIME_RATIO: f64 = 0.99;
/// Queue depth must stay below this.
pub const TARGET_QUEUE_DEPTH: usize = 50;

/// Rolling window over the most recent latency samples.
struct LatencyWindow {
    samples: VecDeque<f64>,
    capacity: usize,
}

impl LatencyWindow {
    fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity.min(4096)),
            capacity,
        }
    }

    fn record(&mut self, secs: f64) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(secs);
    }

    fn percentile(sorted: &[f64], p: f64) -> f64 {
        if sorted.is_empty() {
            return 0.0;
        }
        let idx = ((p * sorted.len() as f64) as usize).min(sorted.len() - 1);
        sorted[idx]
    }

    fn summarize(&self) -> LatencySummary {
        if self.samples.is_empty() {
            return LatencySummary::default();
        }
        let mut sorted: Vec<f64> = self.samples.iter().copied().collect();
        sorted.sort_by(|a, b| a.total_cmp(b));
        LatencySummary {
            p95: Self::percentile(&sorted, 0.95),
            p99: Self::percentile(&sorted, 0.99),
            mean: sorted.iter().sum::<f64>() / sorted.len() as f64,
            count: sorted.len(),
        }
    }
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct LatencySummary {
    pub p95: f64,
    pub p99: f64,
    pub mean: f64,
    pub count: usize,
}

/// Downtime accounting driven by a self-heartbeat. A beat arriving more
/// than twice the interval after the previous one means the instance was
/// stalled; the overdue portion counts as downtime.
struct UptimeTracker {
    started: Instant,
    last_beat: Instant,
    downtime: Duration,
}

impl UptimeTracker {
    fn new(now: Instant) -> Self {
        Self {
            started: now,
            last_beat: now,
            downtime: Duration::ZERO,
        }
    }

    fn beat_at(&mut self, now: Instant, interval: Duration) {
        let gap = now.saturating_duration_since(self.last_beat);
        if gap > interval * 2 {
            self.downtime += gap - interval;
            warn!(gap_secs = gap.as_secs_f64(), "missed heartbeat, counting downtime");
        }
        self.last_beat = now;
    }

    fn ratio_at(&self, now: Instant) -> f64 {
        let total = now.saturating_duration_since(self.started);
        if total.is_zero() {
            return 1.0;
        }
        let up = total.saturating_sub(self.downtime);
        up.as_secs_f64() / total.as_secs_f64()
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct DepthTracker {
    current: usize,
    max: usize,
}

/// Whether each SLA target currently holds.
#[derive(Debug, Clone, serde::Serialize)]
pub struct TargetsMet {
    pub latency_p95: bool,
    pub uptime: bool,
    pub queue_depth: bool,
}

/// Read-only view served by `/sla` and folded into reports.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SlaSnapshot {
    pub p95: f64,
    pub p99: f64,
    pub mean: f64,
    pub count: usize,
    pub uptime_ratio: f64,
    pub uptime_seconds: u64,
    pub queue_depth: usize,
    pub queue_depth_max: usize,
    pub targets_met: TargetsMet,
}

/// Per-instance SLA monitor. Writers go through the appender locks;
/// readers take snapshots.
pub struct SlaMonitor {
    latency: Mutex<LatencyWindow>,
    uptime: Mutex<UptimeTracker>,
    depth: Mutex<DepthTracker>,
    heartbeat_interval: Duration,
    started: Instant,
}

impl SlaMonitor {
    pub fn new(latency_window: usize, heartbeat_interval: Duration) -> Self {
        let now = Instant::now();
        Self {
            latency: Mutex::new(LatencyWindow::new(latency_window)),
            uptime: Mutex::new(UptimeTracker::new(now)),
            depth: Mutex::new(DepthTracker::default()),
            heartbeat_interval,
            started: now,
        }
    }

    /// Append one end-to-end latency sample (enqueue → terminal status).
    pub fn record_latency(&self, secs: f64) {
        self.latency.lock().unwrap().record(secs);
    }

    pub fn heartbeat(&self) {
        self.uptime
            .lock()
            .unwrap()
            .beat_at(Instant::now(), self.heartbeat_interval);
    }

    pub fn sample_depth(&self, depth: usize) {
        let mut tracker = self.depth.lock().unwrap();
        tracker.current = depth;
        tracker.max = tracker.max.max(depth);
    }

    pub fn uptime_ratio(&self) -> f64 {
        self.uptime.lock().unwrap().ratio_at(Instant::now())
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    pub fn latency_summary(&self) -> LatencySummary {
        self.latency.lock().unwrap().summarize()
    }

    pub fn snapshot(&self) -> SlaSnapshot {
        let latency = self.latency_summary();
        let uptime_ratio = self.uptime_ratio();
        let depth = *self.depth.lock().unwrap();

        SlaSnapshot {
            targets_met: TargetsMet {
                latency_p95: latency.p95 < TARGET_P95_SECS,
                uptime: uptime_ratio >= TARGET_UPTIME_RATIO,
                queue_depth: depth.current < TARGET_QUEUE_DEPTH,
            },
            p95: latency.p95,
            p99: latency.p99,
            mean: latency.mean,
            count: latency.count,
            uptime_ratio,
            uptime_seconds: self.uptime_seconds(),
            queue_depth: depth.current,
            queue_depth_max: depth.max,
        }
    }
}

fn yes_no(met: bool) -> &'static str {
    if met {
        "YES"
    } else {
        "NO"
    }
}

/// Render one timestamped report block.
pub fn render_report(environment: &str, snapshot: &SlaSnapshot) -> String {
    let now = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
    format!(
        "\nSLA Report - {now}\n\
         Environment: {environment}\n\
         =====================================\n\
         \n\
         Reservation Processing SLA (Target: 95% < {TARGET_P95_SECS} seconds):\n\
         - 95th Percentile: {p95:.3} seconds\n\
         - 99th Percentile: {p99:.3} seconds\n\
         - Average Time: {mean:.3} seconds\n\
         - Total Processed: {count}\n\
         - SLA Met: {latency_met}\n\
         \n\
         System Availability SLA (Target: {uptime_target:.0}% uptime):\n\
         - Uptime Ratio: {uptime:.2}%\n\
         - SLA Met: {uptime_met}\n\
         \n\
         Queue Depth SLA (Target: < {depth_target} pending):\n\
         - Current Queue: {depth} (max observed: {depth_max})\n\
         - SLA Met: {depth_met}\n\
         \n\
         =====================================\n",
        p95 = snapshot.p95,
        p99 = snapshot.p99,
        mean = snapshot.mean,
        count = snapshot.count,
        latency_met = yes_no(snapshot.targets_met.latency_p95),
        uptime_target = TARGET_UPTIME_RATIO * 100.0,
        uptime = snapshot.uptime_ratio * 100.0,
        uptime_met = yes_no(snapshot.targets_met.uptime),
        depth_target = TARGET_QUEUE_DEPTH,
        depth = snapshot.queue_depth,
        depth_max = snapshot.queue_depth_max,
        depth_met = yes_no(snapshot.targets_met.queue_depth),
    )
}

/// Report file inside the instance data directory.
pub fn report_path(data_dir: &str) -> PathBuf {
    Path::new(data_dir).join("sla_report.txt")
}

fn append_report(path: &Path, block: &str) -> std::io::Result<()> {
    use std::io::Write;
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    file.write_all(block.as_bytes())
}

/// Self-heartbeat loop; stalls between ticks show up as downtime.
pub async fn run_heartbeat(ctx: Arc<InstanceContext>, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(ctx.config.heartbeat_interval_duration());
    loop {
        tokio::select! {
            _ = interval.tick() => ctx.monitor.heartbeat(),
            _ = shutdown.changed() => return,
        }
    }
}

/// Queue-depth sampler loop.
pub async fn run_depth_sampler(ctx: Arc<InstanceContext>, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(ctx.config.depth_sample_interval_duration());
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let depth = ctx.queue.depth().await;
                ctx.monitor.sample_depth(depth);
            }
            _ = shutdown.changed() => return,
        }
    }
}

/// Periodic report emission, independent of request flow.
pub async fn run_reporter(ctx: Arc<InstanceContext>, mut shutdown: watch::Receiver<bool>) {
    let path = report_path(&ctx.config.data_dir);
    let mut interval = tokio::time::interval(ctx.config.sla_report_interval_duration());
    // The first tick of a tokio interval fires immediately; skip it so
    // the first report covers a full interval.
    interval.tick().await;
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let block = render_report(&ctx.config.environment, &ctx.monitor.snapshot());
                match append_report(&path, &block) {
                    Ok(()) => info!(path = %path.display(), "SLA report appended"),
                    Err(e) => error!(path = %path.display(), error = %e, "failed to write SLA report"),
                }
            }
            _ = shutdown.changed() => return,
        }
    }
}
