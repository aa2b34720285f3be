//! Quota/rate-limit exhaustion detection from child log tails.
//!
//! A child that died against an exhausted upstream should not be relaunched
//! on the next tick; the detector turns its log tail into a wait long enough
//! to outlive the exhaustion window.

use regex::Regex;
use std::path::Path;
use tracing::warn;

/// Markers (matched case-insensitively) that identify an exhaustion failure,
/// including the error envelopes upstream providers return.
const QUOTA_MARKERS: &[&str] = &[
    "quota",
    "rate limit",
    "rate_limit",
    "exhausted",
    "resource_exhausted",
    "too many requests",
    "429",
];

/// How many trailing log lines are scanned.
const TAIL_LINES: usize = 50;

/// Scans a completed child's log tail for quota exhaustion and derives a
/// cooldown in seconds.
#[derive(Debug)]
pub struct QuotaErrorDetector {
    max_seconds: u64,
    margin_percent: u64,
    retry_hint: Regex,
    retry_delay_field: Regex,
}

impl QuotaErrorDetector {
    pub fn new(max_seconds: u64, margin_percent: u64) -> Self {
        Self {
            max_seconds,
            margin_percent,
            // "retry after 30 seconds", "retrying in 2m", "retry in 90s"
            retry_hint: Regex::new(
                r"(?i)retry(?:ing)?\s+(?:after|in)\s+(\d+)\s*(seconds?|secs?|s|minutes?|mins?|m|hours?|hrs?|h)?",
            )
            .expect("retry hint pattern is valid"),
            // Google-style error payloads: "retryDelay": "21s"
            retry_delay_field: Regex::new(r#"(?i)"retryDelay"\s*:\s*"(\d+)s""#)
                .expect("retryDelay pattern is valid"),
        }
    }

    /// Derive a cooldown from a log file, or `None` when no quota pattern
    /// matches. Unreadable files are treated as no-match.
    pub fn detect_from_file(&self, log_file_path: &Path) -> Option<u64> {
        let contents = match std::fs::read_to_string(log_file_path) {
            Ok(c) => c,
            Err(e) => {
                warn!(
                    path = %log_file_path.display(),
                    error = %e,
                    "failed to read log for quota detection"
                );
                return None;
            }
        };
        self.detect(&contents)
    }

    /// Same as [`Self::detect_from_file`] for in-memory log text.
    pub fn detect(&self, log_text: &str) -> Option<u64> {
        let lines: Vec<&str> = log_text.lines().collect();
        let tail_start = lines.len().saturating_sub(TAIL_LINES);
        let tail = &lines[tail_start..];

        let matched = tail.iter().rev().find(|line| {
            let lower = line.to_ascii_lowercase();
            QUOTA_MARKERS.iter().any(|marker| lower.contains(marker))
        })?;

        // Prefer a hint on the matched line, then anywhere in the tail.
        if let Some(seconds) = self.parse_retry_hint(matched) {
            return Some(seconds);
        }
        for line in tail.iter().rev() {
            if let Some(seconds) = self.parse_retry_hint(line) {
                return Some(seconds);
            }
        }

        // No hint: wait out the full window plus the configured margin.
        Some(self.max_seconds * (100 + self.margin_percent) / 100)
    }

    fn parse_retry_hint(&self, line: &str) -> Option<u64> {
        if let Some(caps) = self.retry_delay_field.captures(line) {
            return caps[1].parse().ok();
        }
        let caps = self.retry_hint.captures(line)?;
        let value: u64 = caps[1].parse().ok()?;
        let unit = caps.get(2).map(|m| m.as_str().to_ascii_lowercase());
        let seconds = match unit.as_deref() {
            Some(u) if u.starts_with('m') => value * 60,
            Some(u) if u.starts_with('h') => value * 3600,
            _ => value,
        };
        Some(seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn detector() -> QuotaErrorDetector {
        QuotaErrorDetector::new(3600, 10)
    }

    #[test]
    fn clean_log_yields_none() {
        assert_eq!(detector().detect("task finished\nall good\n"), None);
        assert_eq!(detector().detect(""), None);
    }

    #[test]
    fn quota_marker_without_hint_uses_margin() {
        let seconds = detector()
            .detect("working...\nError: Quota exceeded for model\n")
            .unwrap();
        assert_eq!(seconds, 3960); // 3600 * 1.10
    }

    #[test]
    fn retry_after_hint_is_parsed() {
        let seconds = detector()
            .detect("[API Error: rate limit reached, retry after 42 seconds]\n")
            .unwrap();
        assert_eq!(seconds, 42);
    }

    #[test]
    fn minute_and_hour_units_scale() {
        assert_eq!(
            detector().detect("rate limit hit, retrying in 2m\n").unwrap(),
            120
        );
        assert_eq!(
            detector().detect("quota window resets, retry in 1h\n").unwrap(),
            3600
        );
    }

    #[test]
    fn bare_status_429_is_detected() {
        let seconds = detector().detect("request failed with HTTP 429\n").unwrap();
        assert_eq!(seconds, 3960);
    }

    #[test]
    fn retry_delay_envelope_is_parsed() {
        let log = r#"{"error":{"code":429,"status":"RESOURCE_EXHAUSTED","details":[{"retryDelay": "21s"}]}}"#;
        assert_eq!(detector().detect(log).unwrap(), 21);
    }

    #[test]
    fn only_the_tail_is_scanned() {
        let mut log = String::from("quota exceeded way back\n");
        for i in 0..60 {
            log.push_str(&format!("progress line {i}\n"));
        }
        assert_eq!(detector().detect(&log), None);
    }

    #[test]
    fn detect_from_file_reads_tail() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "doing work").unwrap();
        writeln!(file, "Error: resource_exhausted, retry after 9 seconds").unwrap();
        assert_eq!(detector().detect_from_file(file.path()), Some(9));
    }

    #[test]
    fn missing_file_is_no_match() {
        assert_eq!(
            detector().detect_from_file(Path::new("/nonexistent/run.log")),
            None
        );
    }
}
