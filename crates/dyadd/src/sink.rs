//! Trial logs written as one pretty-printed JSON file per session.

use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use serde::Serialize;

use dyad_core::trial::TrialLog;
use dyad_core::wire::PeerRole;
use dyad_services::TrialSink;

pub struct JsonTrialSink {
    dir: PathBuf,
    role: PeerRole,
    written: Option<PathBuf>,
}

#[derive(Serialize)]
struct SessionFile<'a> {
    role: PeerRole,
    written_at: u64,
    trials_completed: usize,
    total_score: u32,
    trials: &'a [TrialLog],
}

impl JsonTrialSink {
    pub fn new(dir: PathBuf, role: PeerRole) -> Self {
        Self {
            dir,
            role,
            written: None,
        }
    }

    /// Path of the last file written.
    pub fn written(&self) -> Option<&PathBuf> {
        self.written.as_ref()
    }
}

impl TrialSink for JsonTrialSink {
    fn persist(&mut self, logs: &[TrialLog]) -> Result<()> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create {}", self.dir.display()))?;

        let path = self.dir.join(format!("dyad_{}_{}.json", self.role, now));
        let file = std::fs::File::create(&path)
            .with_context(|| format!("failed to create {}", path.display()))?;
        let body = SessionFile {
            role: self.role,
            written_at: now,
            trials_completed: logs.len(),
            total_score: logs.last().map(|l| l.total_score).unwrap_or(0),
            trials: logs,
        };
        serde_json::to_writer_pretty(file, &body)
            .with_context(|| format!("failed to write {}", path.display()))?;

        tracing::info!(path = %path.display(), trials = logs.len(), "trial log written");
        self.written = Some(path);
        Ok(())
    }
}
