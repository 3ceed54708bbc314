//! Progress display for uploads

use crate::format::{format_duration, format_rate};
use crate::proof::{AttachState, ProofPhase};
use crate::types::{UploadEvent, UploadId, UploadStatus};
use crate::upload::Upload;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::time::Duration;

/// One bar per upload, driven by uploader events
pub struct ProgressTracker {
    /// Multi-progress container
    multi: MultiProgress,
    /// Bars and display names by upload
    bars: HashMap<UploadId, (ProgressBar, String)>,
    /// Whether progress is enabled
    enabled: bool,
}

impl ProgressTracker {
    /// Create a new progress tracker
    pub fn new(enabled: bool) -> Self {
        Self {
            multi: MultiProgress::new(),
            bars: HashMap::new(),
            enabled,
        }
    }

    fn style() -> ProgressStyle {
        ProgressStyle::default_bar()
            .template("{spinner:.green} {prefix:>9.bold} {wide_msg:.dim} [{bar:30.cyan/blue}] {bytes}/{total_bytes}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=>-")
    }

    /// Start tracking an upload
    pub fn add(&mut self, upload: &Upload) {
        let bar = if self.enabled {
            let pb = self.multi.add(ProgressBar::new(upload.len()));
            pb.set_style(Self::style());
            pb.set_prefix(upload.status().as_str());
            pb.enable_steady_tick(Duration::from_millis(100));
            pb
        } else {
            ProgressBar::hidden()
        };
        let name = truncate_filename(upload.display_name(), 30);
        bar.set_message(name.clone());
        self.bars.insert(upload.id(), (bar, name));
    }

    /// Apply one event to the matching bar
    pub fn handle(&self, event: &UploadEvent) {
        let Some((bar, name)) = self.bars.get(&event.id()) else {
            return;
        };

        match event {
            UploadEvent::StatusChanged { to, .. } => {
                bar.set_prefix(to.as_str());
                match to {
                    UploadStatus::Uploading => bar.set_position(0),
                    UploadStatus::Complete => {
                        bar.set_message(name.clone());
                        bar.set_position(bar.length().unwrap_or(0));
                        bar.finish();
                    }
                    UploadStatus::Failed => bar.abandon(),
                    _ => {}
                }
            }
            UploadEvent::Hashing { fraction, .. } => {
                let len = bar.length().unwrap_or(0);
                bar.set_position((len as f64 * fraction) as u64);
            }
            UploadEvent::Progress { progress, .. } => {
                bar.set_position(progress.bytes_acknowledged);
                if let (Some(rate), Some(remaining)) = (progress.throughput, progress.remaining) {
                    bar.set_message(format!(
                        "{}  {} ETA {}",
                        name,
                        format_rate(rate),
                        format_duration(remaining)
                    ));
                }
            }
            UploadEvent::ProofChanged {
                phase, attachment, ..
            } => {
                let note = match (phase, attachment) {
                    (_, AttachState::Failed(_)) => Some("proof not attached"),
                    (_, AttachState::Attached) => Some("proof attached"),
                    (ProofPhase::Failed, _) => Some("no proof"),
                    _ => None,
                };
                if let Some(note) = note {
                    self.println(&format!("  {}: {}", name, note));
                }
            }
        }
    }

    /// Finish all progress bars
    pub fn finish(&self) {
        for (bar, _) in self.bars.values() {
            if !bar.is_finished() {
                bar.abandon();
            }
        }
    }

    /// Print a message (works with progress bars)
    pub fn println(&self, msg: &str) {
        if self.enabled {
            self.multi.println(msg).ok();
        } else {
            println!("{}", msg);
        }
    }
}

/// Truncate a filename for display
fn truncate_filename(name: &str, max_len: usize) -> String {
    let count = name.chars().count();
    if count <= max_len {
        name.to_string()
    } else {
        let tail: String = name.chars().skip(count - max_len + 3).collect();
        format!("...{}", tail)
    }
}
