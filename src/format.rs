//! Output formatting utilities

use crate::proof::{AttachState, ProofPhase};
use crate::types::UploadStatus;
use crate::upload::UploadState;
use std::time::Duration;

/// Format file size in human-readable format
pub fn format_size(bytes: u64) -> String {
    human_bytes::human_bytes(bytes as f64)
}

/// Format duration in human-readable format
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs_f64();
    format_duration_secs(secs)
}

/// Format duration from seconds
pub fn format_duration_secs(secs: f64) -> String {
    if secs < 1.0 {
        format!("{:.0}ms", secs * 1000.0)
    } else if secs < 60.0 {
        format!("{:.1}s", secs)
    } else if secs < 3600.0 {
        let mins = (secs / 60.0).floor();
        let remaining = secs - mins * 60.0;
        format!("{}m {:.0}s", mins as u64, remaining)
    } else {
        let hours = (secs / 3600.0).floor();
        let remaining = secs - hours * 3600.0;
        let mins = (remaining / 60.0).floor();
        format!("{}h {}m", hours as u64, mins as u64)
    }
}

/// Format transfer rate in human-readable format
pub fn format_rate(bytes_per_sec: f64) -> String {
    format!("{}/s", human_bytes::human_bytes(bytes_per_sec))
}

/// Format a count with a unit
pub fn format_count(count: u64, singular: &str, plural: &str) -> String {
    if count == 1 {
        format!("{} {}", count, singular)
    } else {
        format!("{} {}", count, plural)
    }
}

/// Format a file count
pub fn format_files(count: u64) -> String {
    format_count(count, "file", "files")
}

/// Summary printed after an upload run
#[derive(Debug, Default, PartialEq)]
pub struct UploadReport {
    pub duration_secs: f64,
    pub completed: u64,
    pub failed: u64,
    pub aborted: u64,
    pub bytes_total: u64,
    /// Bytes sent by the final attempts; resumed uploads skip what the server held
    pub bytes_sent: u64,
    pub proofs_created: u64,
    pub proofs_failed: u64,
    pub proofs_attached: u64,
    pub dry_run: bool,
}

impl UploadReport {
    /// Tally settled uploads
    pub fn from_states(states: &[UploadState], duration: Duration, dry_run: bool) -> Self {
        let mut report = UploadReport {
            duration_secs: duration.as_secs_f64(),
            dry_run,
            ..Default::default()
        };

        for state in states {
            match state.status {
                UploadStatus::Complete => {
                    report.completed += 1;
                    report.bytes_total += state.progress.total_bytes;
                    report.bytes_sent += state.bytes_sent;
                }
                UploadStatus::Failed if state.failure_reason.as_deref() == Some("") => {
                    report.aborted += 1;
                }
                _ => report.failed += 1,
            }
            match state.proof.phase {
                ProofPhase::PendingConfirmation | ProofPhase::Confirmed => report.proofs_created += 1,
                ProofPhase::Failed => report.proofs_failed += 1,
                _ => {}
            }
            if state.proof.attachment == AttachState::Attached {
                report.proofs_attached += 1;
            }
        }
        report
    }

    /// Uploads that did not complete
    pub fn unsuccessful(&self) -> u64 {
        self.failed + self.aborted
    }

    /// Format the upload report
    pub fn format(&self) -> String {
        let mut lines = Vec::new();

        if self.dry_run {
            lines.push("=== Dry Run Complete ===".to_string());
        } else {
            lines.push("=== Upload Complete ===".to_string());
        }
        lines.push(String::new());
        lines.push(format!("Duration:     {}", format_duration_secs(self.duration_secs)));
        lines.push(String::new());

        lines.push(format!("Uploaded:     {}", format_files(self.completed)));
        if self.failed > 0 {
            lines.push(format!("Failed:       {}", format_files(self.failed)));
        }
        if self.aborted > 0 {
            lines.push(format!("Aborted:      {}", format_files(self.aborted)));
        }

        if self.proofs_created + self.proofs_failed > 0 {
            lines.push(format!(
                "Proofs:       {} created, {} attached, {} failed",
                self.proofs_created, self.proofs_attached, self.proofs_failed
            ));
        }

        lines.push(String::new());
        lines.push(format!("Data uploaded:    {}", format_size(self.bytes_total)));
        if self.bytes_sent < self.bytes_total {
            lines.push(format!(
                "Resumed:          {} already on server",
                format_size(self.bytes_total - self.bytes_sent)
            ));
        }

        if self.duration_secs > 0.0 {
            let rate = self.bytes_sent as f64 / self.duration_secs;
            lines.push(format!("Transfer rate:    {}", format_rate(rate)));
        }

        lines.join("\n")
    }

    /// Print the report to stdout
    pub fn print(&self) {
        println!("{}", self.format());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proof::ProofState;
    use crate::types::TransferProgress;

    fn state(status: UploadStatus, reason: Option<&str>, total: u64, sent: u64) -> UploadState {
        UploadState {
            status,
            fingerprint: None,
            transfer_offset: total - sent,
            bytes_sent: sent,
            failure_reason: reason.map(str::to_string),
            proof: ProofState::default(),
            progress: TransferProgress {
                total_bytes: total,
                ..Default::default()
            },
            attempts: 1,
        }
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(0), "0 B");
        // human_bytes uses binary prefixes (KiB, MiB)
        assert!(format_size(1024).contains("1"));
        assert!(format_size(1024 * 1024).contains("1"));
    }

    #[test]
    fn test_format_duration_secs() {
        assert_eq!(format_duration_secs(0.5), "500ms");
        assert_eq!(format_duration_secs(45.0), "45.0s");
        assert_eq!(format_duration_secs(90.0), "1m 30s");
        assert_eq!(format_duration_secs(3700.0), "1h 1m");
    }

    #[test]
    fn test_format_files() {
        assert_eq!(format_files(1), "1 file");
        assert_eq!(format_files(5), "5 files");
    }

    #[test]
    fn test_report_tally() {
        let states = vec![
            state(UploadStatus::Complete, None, 100, 100),
            state(UploadStatus::Complete, None, 100, 40),
            state(UploadStatus::Failed, Some("503 Service Unavailable"), 10, 0),
            state(UploadStatus::Failed, Some(""), 10, 0),
        ];
        let report = UploadReport::from_states(&states, Duration::from_secs(2), false);
        assert_eq!(report.completed, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.aborted, 1);
        assert_eq!(report.unsuccessful(), 2);
        assert_eq!(report.bytes_total, 200);
        assert_eq!(report.bytes_sent, 140);

        let text = report.format();
        assert!(text.contains("Uploaded:     2 files"));
        assert!(text.contains("already on server"));
    }
}
