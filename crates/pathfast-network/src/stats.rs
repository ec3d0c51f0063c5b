//! Probe Statistics
//!
//! Cumulative latency record kept by a [`LatencyProbe`](crate::LatencyProbe).
//! Samples are kept in arrival order so jitter can be computed from
//! consecutive pairs; min and max stay `None` until the first sample.

use std::fmt;
use std::time::Duration;

/// Cumulative probe statistics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Stats {
    /// Successful exchanges
    pub count: u64,
    /// Failed exchanges
    pub errors: u64,
    /// Sum of all successful latencies
    pub sum: Duration,
    /// Fastest sample
    pub min: Option<Duration>,
    /// Slowest sample
    pub max: Option<Duration>,
    /// Samples in arrival order
    pub latencies: Vec<Duration>,
    /// Time taken by the last connect (survives reset)
    pub connect_time: Option<Duration>,
}

impl Stats {
    /// Record a successful exchange
    pub fn record_latency(&mut self, latency: Duration) {
        self.count += 1;
        self.sum += latency;
        self.min = Some(self.min.map_or(latency, |m| m.min(latency)));
        self.max = Some(self.max.map_or(latency, |m| m.max(latency)));
        self.latencies.push(latency);
    }

    /// Record a failed exchange
    pub fn record_error(&mut self) {
        self.errors += 1;
    }

    /// Clear all counters except the connect time
    pub fn reset(&mut self) {
        *self = Self {
            connect_time: self.connect_time,
            ..Self::default()
        };
    }

    /// Total exchanges attempted
    pub fn sent(&self) -> u64 {
        self.count + self.errors
    }

    /// Percentage of attempted exchanges that failed
    pub fn loss_percent(&self) -> f64 {
        let sent = self.sent();
        if sent == 0 {
            return 0.0;
        }
        self.errors as f64 / sent as f64 * 100.0
    }

    pub fn mean(&self) -> Option<Duration> {
        if self.count == 0 {
            return None;
        }
        Some(Duration::from_nanos((self.sum.as_nanos() / self.count as u128) as u64))
    }

    /// Element at `len / 2` of the sorted samples
    pub fn median(&self) -> Option<Duration> {
        if self.latencies.is_empty() {
            return None;
        }
        let mut sorted = self.latencies.clone();
        sorted.sort_unstable();
        Some(sorted[sorted.len() / 2])
    }

    /// Mean absolute difference between consecutive samples
    pub fn jitter(&self) -> Option<Duration> {
        if self.latencies.len() < 2 {
            return None;
        }
        let total: Duration = self
            .latencies
            .windows(2)
            .map(|pair| pair[1].abs_diff(pair[0]))
            .sum();
        Some(total / (self.latencies.len() - 1) as u32)
    }

    /// Population standard deviation of the samples
    pub fn std_dev(&self) -> Option<Duration> {
        if self.latencies.is_empty() {
            return None;
        }
        let n = self.latencies.len() as f64;
        let mean = self.latencies.iter().map(Duration::as_secs_f64).sum::<f64>() / n;
        let variance = self
            .latencies
            .iter()
            .map(|l| {
                let d = l.as_secs_f64() - mean;
                d * d
            })
            .sum::<f64>()
            / n;
        Some(Duration::from_secs_f64(variance.sqrt()))
    }

    /// Build a printable summary
    pub fn summary(&self) -> StatsSummary {
        StatsSummary {
            connect_time: self.connect_time,
            sent: self.sent(),
            received: self.count,
            loss_percent: self.loss_percent(),
            min: self.min,
            max: self.max,
            mean: self.mean(),
            median: self.median(),
            jitter: self.jitter(),
            std_dev: self.std_dev(),
        }
    }
}

/// Derived view of [`Stats`]
#[derive(Debug, Clone, PartialEq)]
pub struct StatsSummary {
    pub connect_time: Option<Duration>,
    pub sent: u64,
    pub received: u64,
    pub loss_percent: f64,
    pub min: Option<Duration>,
    pub max: Option<Duration>,
    pub mean: Option<Duration>,
    pub median: Option<Duration>,
    pub jitter: Option<Duration>,
    pub std_dev: Option<Duration>,
}

fn fmt_ms(value: Option<Duration>) -> String {
    match value {
        Some(d) => format!("{:.2}ms", d.as_secs_f64() * 1000.0),
        None => "-".to_string(),
    }
}

impl fmt::Display for StatsSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "connect: {}", fmt_ms(self.connect_time))?;
        writeln!(
            f,
            "packets: {} sent, {} received, {:.1}% loss",
            self.sent, self.received, self.loss_percent
        )?;
        writeln!(
            f,
            "rtt min/avg/median/max: {}/{}/{}/{}",
            fmt_ms(self.min),
            fmt_ms(self.mean),
            fmt_ms(self.median),
            fmt_ms(self.max)
        )?;
        write!(
            f,
            "jitter: {}, stddev: {}",
            fmt_ms(self.jitter),
            fmt_ms(self.std_dev)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    fn stats_from(samples: &[u64]) -> Stats {
        let mut stats = Stats::default();
        for s in samples {
            stats.record_latency(ms(*s));
        }
        stats
    }

    #[test]
    fn test_empty_stats() {
        let stats = Stats::default();
        assert_eq!(stats.min, None);
        assert_eq!(stats.max, None);
        assert_eq!(stats.mean(), None);
        assert_eq!(stats.median(), None);
        assert_eq!(stats.jitter(), None);
        assert_eq!(stats.loss_percent(), 0.0);
    }

    #[test]
    fn test_zero_latency_is_a_sample() {
        let stats = stats_from(&[0]);
        assert_eq!(stats.min, Some(Duration::ZERO));
        assert_eq!(stats.count, 1);
    }

    #[test]
    fn test_aggregates() {
        let samples = [30, 10, 20, 10, 50];
        let stats = stats_from(&samples);

        assert_eq!(stats.count, 5);
        assert_eq!(stats.sum, ms(120));
        assert_eq!(stats.min, Some(ms(10)));
        assert_eq!(stats.max, Some(ms(50)));
        for s in samples {
            assert!(stats.min.unwrap() <= ms(s) && ms(s) <= stats.max.unwrap());
        }
        assert_eq!(stats.mean(), Some(ms(24)));
        // sorted: 10 10 20 30 50
        assert_eq!(stats.median(), Some(ms(20)));
        // |10-30| + |20-10| + |10-20| + |50-10| = 80 over 4 pairs
        assert_eq!(stats.jitter(), Some(ms(20)));
    }

    #[test]
    fn test_median_even_and_duplicates() {
        assert_eq!(stats_from(&[40, 10, 30, 20]).median(), Some(ms(30)));
        assert_eq!(stats_from(&[7, 7, 7]).median(), Some(ms(7)));
    }

    #[test]
    fn test_std_dev() {
        let stats = stats_from(&[10, 10, 10]);
        assert_eq!(stats.std_dev(), Some(Duration::ZERO));

        let stats = stats_from(&[10, 30]);
        let dev = stats.std_dev().unwrap().as_secs_f64() * 1000.0;
        assert!((dev - 10.0).abs() < 0.001);
    }

    #[test]
    fn test_reset_keeps_connect_time() {
        let mut stats = stats_from(&[5, 6]);
        stats.record_error();
        stats.connect_time = Some(ms(3));

        stats.reset();

        assert_eq!(stats.count, 0);
        assert_eq!(stats.errors, 0);
        assert!(stats.latencies.is_empty());
        assert_eq!(stats.min, None);
        assert_eq!(stats.connect_time, Some(ms(3)));
    }

    #[test]
    fn test_loss_and_summary() {
        let mut stats = stats_from(&[10, 20, 30]);
        stats.record_error();

        assert_eq!(stats.sent(), 4);
        assert_eq!(stats.loss_percent(), 25.0);

        let summary = stats.summary();
        assert_eq!(summary.received, 3);
        let text = summary.to_string();
        assert!(text.contains("4 sent, 3 received, 25.0% loss"));
    }
}
