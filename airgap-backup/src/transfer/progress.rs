//! Byte-level progress tracking for streaming operations.
//!
//! Disk images take minutes to hours to copy; the tracker turns raw byte
//! counts into periodic log lines with speed and ETA.

use std::time::{Duration, Instant};
use tracing::info;

/// Progress information for a streaming copy
#[derive(Debug, Clone)]
pub struct TransferProgress {
    /// Total bytes to transfer (0 when unknown)
    pub total_bytes: u64,

    /// Bytes transferred so far
    pub transferred_bytes: u64,

    /// Current transfer speed in bytes/second
    pub bytes_per_second: u64,

    /// Estimated time remaining (seconds)
    pub eta_seconds: u64,

    /// Percentage complete (0-100)
    pub percent_complete: f64,
}

impl TransferProgress {
    pub fn new(total_bytes: u64) -> Self {
        Self {
            total_bytes,
            transferred_bytes: 0,
            bytes_per_second: 0,
            eta_seconds: 0,
            percent_complete: 0.0,
        }
    }

    /// Update progress with new transferred bytes
    pub fn update(&mut self, transferred_bytes: u64) {
        self.transferred_bytes = transferred_bytes;
        self.percent_complete = if self.total_bytes > 0 {
            (self.transferred_bytes as f64 / self.total_bytes as f64 * 100.0).min(100.0)
        } else {
            0.0
        };
    }

    pub fn is_complete(&self) -> bool {
        self.transferred_bytes >= self.total_bytes
    }
}

/// Progress tracker with time-based speed calculation and rate-limited logging
pub struct ProgressTracker {
    label: String,
    start_time: Instant,
    last_update_time: Instant,
    last_report_time: Instant,
    report_interval: Duration,
    last_bytes: u64,
    progress: TransferProgress,
}

impl ProgressTracker {
    pub fn new(label: impl Into<String>, total_bytes: u64, report_interval: Duration) -> Self {
        let now = Instant::now();
        Self {
            label: label.into(),
            start_time: now,
            last_update_time: now,
            last_report_time: now,
            report_interval,
            last_bytes: 0,
            progress: TransferProgress::new(total_bytes),
        }
    }

    /// Update progress and calculate speed
    pub fn update(&mut self, transferred_bytes: u64) -> &TransferProgress {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_update_time).as_secs_f64();

        if elapsed > 0.0 {
            let bytes_diff = transferred_bytes.saturating_sub(self.last_bytes);
            self.progress.bytes_per_second = (bytes_diff as f64 / elapsed) as u64;
        }

        if self.progress.bytes_per_second > 0 {
            let remaining_bytes = self.progress.total_bytes.saturating_sub(transferred_bytes);
            self.progress.eta_seconds = remaining_bytes / self.progress.bytes_per_second;
        }

        self.progress.update(transferred_bytes);
        self.last_update_time = now;
        self.last_bytes = transferred_bytes;

        &self.progress
    }

    /// Record `transferred_bytes` and log a progress line if the interval elapsed.
    pub fn advance(&mut self, transferred_bytes: u64) {
        if self.last_report_time.elapsed() < self.report_interval {
            return;
        }
        self.update(transferred_bytes);
        self.last_report_time = Instant::now();

        let p = &self.progress;
        if p.total_bytes > 0 {
            info!(
                "{}: {:.1}% ({} / {}) at {}, ETA {}",
                self.label,
                p.percent_complete,
                format_bytes(p.transferred_bytes),
                format_bytes(p.total_bytes),
                format_speed(p.bytes_per_second),
                format_duration(p.eta_seconds)
            );
        } else {
            info!(
                "{}: {} at {}",
                self.label,
                format_bytes(p.transferred_bytes),
                format_speed(p.bytes_per_second)
            );
        }
    }

    /// Log the final line for this stream.
    pub fn finish(&mut self, transferred_bytes: u64) {
        self.progress.update(transferred_bytes);
        info!(
            "{}: {} in {} (average {})",
            self.label,
            format_bytes(transferred_bytes),
            format_duration(self.elapsed().as_secs()),
            format_speed(self.average_speed())
        );
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Get average speed since start
    pub fn average_speed(&self) -> u64 {
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            (self.progress.transferred_bytes as f64 / elapsed) as u64
        } else {
            0
        }
    }

    pub fn progress(&self) -> &TransferProgress {
        &self.progress
    }
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

/// Format speed as human-readable string
pub fn format_speed(bytes_per_second: u64) -> String {
    format!("{}/s", format_bytes(bytes_per_second))
}

/// Format duration as human-readable string
pub fn format_duration(seconds: u64) -> String {
    if seconds < 60 {
        format!("{}s", seconds)
    } else if seconds < 3600 {
        format!("{}m {}s", seconds / 60, seconds % 60)
    } else {
        format!("{}h {}m", seconds / 3600, (seconds % 3600) / 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_transfer_progress_update() {
        let mut progress = TransferProgress::new(1000);
        progress.update(500);
        assert_eq!(progress.transferred_bytes, 500);
        assert!((progress.percent_complete - 50.0).abs() < 0.01);
        assert!(!progress.is_complete());

        progress.update(1000);
        assert!(progress.is_complete());
    }

    #[test]
    fn test_percent_caps_at_hundred() {
        // Devices can report slightly less than what is actually read.
        let mut progress = TransferProgress::new(1000);
        progress.update(1500);
        assert!((progress.percent_complete - 100.0).abs() < 0.01);
    }

    #[test]
    fn test_progress_tracker_speed() {
        // Large total so the remaining bytes take well over a second at the measured rate.
        let mut tracker = ProgressTracker::new("copy", 10_000_000, Duration::from_secs(5));
        tracker.update(100);
        thread::sleep(Duration::from_millis(100));
        let prog = tracker.update(500);
        assert_eq!(prog.transferred_bytes, 500);
        assert!(prog.bytes_per_second > 0);
        assert!(prog.eta_seconds >= 1);
    }

    #[test]
    fn test_advance_respects_interval() {
        let mut tracker = ProgressTracker::new("copy", 1000, Duration::from_secs(3600));
        tracker.advance(400);
        // Interval not reached, nothing recorded yet.
        assert_eq!(tracker.progress().transferred_bytes, 0);
        tracker.finish(1000);
        assert!(tracker.progress().is_complete());
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0.00 B");
        assert_eq!(format_bytes(1023), "1023.00 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1024 * 1024), "1.00 MB");
        assert_eq!(format_bytes(1024 * 1024 * 1024), "1.00 GB");
    }

    #[test]
    fn test_format_speed() {
        assert_eq!(format_speed(1024), "1.00 KB/s");
        assert_eq!(format_speed(1024 * 1024), "1.00 MB/s");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(30), "30s");
        assert_eq!(format_duration(90), "1m 30s");
        assert_eq!(format_duration(3665), "1h 1m");
    }
}
