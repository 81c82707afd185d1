//! Master-degradation detection.
//!
//! Each instance's ordering throughput is tracked with a windowed,
//! revival-spike-resistant EMA: idle windows feed zeros into the
//! average, so a burst right after an idle stretch cannot make a
//! stale master look healthy. Per-client ordering latency is a plain
//! EMA. The master is degraded when its smoothed throughput falls
//! below the backup median by factor `delta`, or its latency exceeds
//! the backup median by `lambda`, sustained for the monitor timeout.
//! Firing publishes an InstanceChange proposal; it is advisory only.

use std::collections::HashMap;
use std::time::Duration;

use tracing::info;

/// Seconds on the shared protocol clock.
pub type Seconds = u64;

const THROUGHPUT_WINDOW_SECS: u64 = 15;
const THROUGHPUT_MIN_WINDOWS: usize = 16;
const LATENCY_MIN_SAMPLES: usize = 20;

/// Windowed EMA over ordered-request throughput.
pub struct ThroughputMeasurement {
    window_size: u64,
    min_windows: usize,
    alpha: f64,
    started_at: Option<Seconds>,
    window_start: Seconds,
    reqs_in_window: u64,
    ema: f64,
    windows_seen: usize,
}

impl ThroughputMeasurement {
    pub fn new() -> Self {
        Self {
            window_size: THROUGHPUT_WINDOW_SECS,
            min_windows: THROUGHPUT_MIN_WINDOWS,
            alpha: 2.0 / (THROUGHPUT_MIN_WINDOWS as f64 + 1.0),
            started_at: None,
            window_start: 0,
            reqs_in_window: 0,
            ema: 0.0,
            windows_seen: 0,
        }
    }

    fn roll_windows(&mut self, now: Seconds) {
        if self.started_at.is_none() {
            self.started_at = Some(now);
            self.window_start = now;
            return;
        }
        while now >= self.window_start + self.window_size {
            let throughput = self.reqs_in_window as f64 / self.window_size as f64;
            self.ema = if self.windows_seen == 0 {
                throughput
            } else {
                self.alpha * throughput + (1.0 - self.alpha) * self.ema
            };
            self.windows_seen += 1;
            self.reqs_in_window = 0;
            self.window_start += self.window_size;
        }
    }

    pub fn add_requests(&mut self, now: Seconds, count: u64) {
        self.roll_windows(now);
        self.reqs_in_window += count;
    }

    /// Smoothed throughput; masked until enough windows accumulated.
    pub fn throughput(&mut self, now: Seconds) -> Option<f64> {
        self.roll_windows(now);
        if self.windows_seen < self.min_windows {
            None
        } else {
            Some(self.ema)
        }
    }
}

/// Per-client ordering latency EMA.
pub struct LatencyMeasurement {
    alpha: f64,
    min_samples: usize,
    per_client: HashMap<String, (f64, usize)>,
}

impl LatencyMeasurement {
    pub fn new() -> Self {
        Self {
            alpha: 2.0 / (LATENCY_MIN_SAMPLES as f64 + 1.0),
            min_samples: LATENCY_MIN_SAMPLES,
            per_client: HashMap::new(),
        }
    }

    pub fn add_duration(&mut self, client: &str, seconds: f64) {
        let entry = self.per_client.entry(client.to_owned()).or_insert((0.0, 0));
        entry.0 = if entry.1 == 0 {
            seconds
        } else {
            self.alpha * seconds + (1.0 - self.alpha) * entry.0
        };
        entry.1 += 1;
    }

    /// Average of the per-client EMAs with enough samples.
    pub fn average(&self) -> Option<f64> {
        let mature: Vec<f64> = self
            .per_client
            .values()
            .filter(|(_, n)| *n >= self.min_samples)
            .map(|(ema, _)| *ema)
            .collect();
        if mature.is_empty() {
            None
        } else {
            Some(mature.iter().sum::<f64>() / mature.len() as f64)
        }
    }
}

struct InstanceMetrics {
    throughput: ThroughputMeasurement,
    latency: LatencyMeasurement,
}

/// Watches the master instance against its backups.
pub struct Monitor {
    instances: Vec<InstanceMetrics>,
    delta: f64,
    lambda: Duration,
    acc_timeout: Duration,
    degraded_since: Option<Seconds>,
}

impl Monitor {
    pub fn new(num_instances: usize, delta: f64, lambda: Duration, acc_timeout: Duration) -> Self {
        let instances = (0..num_instances)
            .map(|_| InstanceMetrics {
                throughput: ThroughputMeasurement::new(),
                latency: LatencyMeasurement::new(),
            })
            .collect();
        Self { instances, delta, lambda, acc_timeout, degraded_since: None }
    }

    pub fn request_ordered(&mut self, inst_id: usize, now: Seconds, count: u64) {
        if let Some(metrics) = self.instances.get_mut(inst_id) {
            metrics.throughput.add_requests(now, count);
        }
    }

    pub fn request_latency(&mut self, inst_id: usize, client: &str, seconds: f64) {
        if let Some(metrics) = self.instances.get_mut(inst_id) {
            metrics.latency.add_duration(client, seconds);
        }
    }

    fn backup_median(values: &mut Vec<f64>) -> Option<f64> {
        if values.is_empty() {
            return None;
        }
        values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        Some(values[values.len() / 2])
    }

    /// The instantaneous ΔΛ condition, ignoring the sustain window.
    fn is_condition_met(&mut self, now: Seconds) -> bool {
        // degradation is judged against backups; with none there is
        // no baseline
        let (master, backups) = match self.instances.split_first_mut() {
            Some((master, backups)) if !backups.is_empty() => (master, backups),
            _ => return false,
        };

        let master_throughput = master.throughput.throughput(now);
        let mut backup_throughputs: Vec<f64> =
            backups.iter_mut().filter_map(|b| b.throughput.throughput(now)).collect();
        let throughput_degraded = match (master_throughput, Self::backup_median(&mut backup_throughputs))
        {
            (Some(m), Some(median)) => m < self.delta * median,
            // warm-up: never degraded on missing data
            _ => false,
        };

        let master_latency = master.latency.average();
        let mut backup_latencies: Vec<f64> =
            backups.iter().filter_map(|b| b.latency.average()).collect();
        let latency_degraded = match (master_latency, Self::backup_median(&mut backup_latencies)) {
            (Some(m), Some(median)) => m > median + self.lambda.as_secs_f64(),
            _ => false,
        };

        throughput_degraded || latency_degraded
    }

    /// Sustained degradation check; drives InstanceChange proposals.
    pub fn is_master_degraded(&mut self, now: Seconds) -> bool {
        if !self.is_condition_met(now) {
            self.degraded_since = None;
            return false;
        }
        let since = *self.degraded_since.get_or_insert(now);
        let sustained = now.saturating_sub(since) >= self.acc_timeout.as_secs();
        if sustained {
            info!(since, now, "master degradation sustained past the monitor timeout");
        }
        sustained
    }
}
