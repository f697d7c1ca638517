//! Progress accounting for a single transfer.

use std::fmt;
use std::time::{Duration, Instant};
use tracing::debug;

const BAR_WIDTH: usize = 20;

/// Tracks bytes moved against an expected total and emits periodic reports.
#[derive(Debug)]
pub struct TransferProgress {
    label: String,
    started: Instant,
    expected: u64,
    moved: u64,
    report_every: u64,
    last_report: u64,
}

impl TransferProgress {
    pub fn new(label: impl Into<String>, expected: u64, report_every: u64) -> Self {
        Self {
            label: label.into(),
            started: Instant::now(),
            expected,
            moved: 0,
            report_every: report_every.max(1),
            last_report: 0,
        }
    }

    pub fn moved(&self) -> u64 {
        self.moved
    }

    pub fn expected(&self) -> u64 {
        self.expected
    }

    /// Record `bytes` more moved. Returns a report when another
    /// `report_every` bytes have passed since the last one.
    pub fn advance(&mut self, bytes: u64) -> Option<ProgressReport> {
        self.moved += bytes;
        if self.moved >= self.last_report + self.report_every {
            self.last_report = self.moved;
            let report = self.report();
            debug!(transfer = %self.label, "{report}");
            Some(report)
        } else {
            None
        }
    }

    /// Final report, emitted unconditionally.
    pub fn finish(&mut self) -> ProgressReport {
        self.last_report = self.moved;
        let report = self.report();
        debug!(transfer = %self.label, "{report}");
        report
    }

    pub fn report(&self) -> ProgressReport {
        ProgressReport {
            moved: self.moved,
            expected: self.expected,
            elapsed: self.started.elapsed(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressReport {
    pub moved: u64,
    pub expected: u64,
    pub elapsed: Duration,
}

impl ProgressReport {
    pub fn bits_per_second(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        8.0 * self.moved as f64 / secs
    }

    /// Remaining time at the average rate so far.
    pub fn eta(&self) -> Option<Duration> {
        if self.moved == 0 {
            return None;
        }
        let remaining = self.expected.saturating_sub(self.moved) as f64;
        let per_byte = self.elapsed.as_secs_f64() / self.moved as f64;
        Some(Duration::from_secs_f64(per_byte * remaining))
    }

    pub fn bar(&self) -> String {
        let fraction = if self.expected == 0 {
            1.0
        } else {
            (self.moved as f64 / self.expected as f64).min(1.0)
        };
        let done = (fraction * BAR_WIDTH as f64).round() as usize;
        format!("[{}{}]", "#".repeat(done), "-".repeat(BAR_WIDTH - done))
    }
}

impl fmt::Display for ProgressReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let eta = match self.eta() {
            Some(eta) => format_clock(eta),
            None => "-:--:--".to_string(),
        };
        write!(
            f,
            "{} {}, ETA: {}, {} / {}",
            self.bar(),
            format_rate(self.bits_per_second()),
            eta,
            format_size(self.moved),
            format_size(self.expected)
        )
    }
}

/// Decimal size, e.g. `1.5GB`.
pub fn format_size(bytes: u64) -> String {
    let b = bytes as f64;
    if b < 1e3 {
        format!("{bytes}B")
    } else if b < 1e6 {
        format!("{:.1}KB", b / 1e3)
    } else if b < 1e9 {
        format!("{:.1}MB", b / 1e6)
    } else {
        format!("{:.1}GB", b / 1e9)
    }
}

/// Bit rate, e.g. `80.0 Mb/s`.
pub fn format_rate(bits_per_second: f64) -> String {
    if bits_per_second < 1e3 {
        format!("{bits_per_second:.1} b/s")
    } else if bits_per_second < 1e6 {
        format!("{:.1} Kb/s", bits_per_second / 1e3)
    } else if bits_per_second < 1e9 {
        format!("{:.1} Mb/s", bits_per_second / 1e6)
    } else {
        format!("{:.2} Gb/s", bits_per_second / 1e9)
    }
}

fn format_clock(duration: Duration) -> String {
    let total = duration.as_secs_f64().round() as u64;
    format!("{}:{:02}:{:02}", total / 3600, (total % 3600) / 60, total % 60)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_periodic_reports_follow_threshold() {
        let mut progress = TransferProgress::new("test", 100, 40);
        assert!(progress.advance(10).is_none());
        assert!(progress.advance(30).is_some());
        assert!(progress.advance(30).is_none());
        assert!(progress.advance(30).is_some());
        assert_eq!(progress.moved(), 100);
        assert_eq!(progress.finish().moved, 100);
    }

    #[test]
    fn test_report_rendering() {
        let report = ProgressReport {
            moved: 10_000_000,
            expected: 20_000_000,
            elapsed: Duration::from_secs(1),
        };
        assert_eq!(report.bar(), "[##########----------]");
        assert!((report.eta().unwrap().as_secs_f64() - 1.0).abs() < 1e-6);
        assert_eq!(
            report.to_string(),
            "[##########----------] 80.0 Mb/s, ETA: 0:00:01, 10.0MB / 20.0MB"
        );
    }

    #[test]
    fn test_format_helpers() {
        assert_eq!(format_size(512), "512B");
        assert_eq!(format_size(1_500_000_000), "1.5GB");
        assert_eq!(format_rate(2.5e9), "2.50 Gb/s");
        assert_eq!(format_clock(Duration::from_secs(3725)), "1:02:05");
    }
}
