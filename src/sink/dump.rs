use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use super::{Delivery, Sink};
use crate::spill::snapshot::Snapshot;

/// One-shot sink: writes the first snapshot to a file and asks to stop.
#[derive(Debug)]
pub struct DumpFile {
    path: PathBuf,
}

impl DumpFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Sink for DumpFile {
    fn name(&self) -> &str {
        "dump"
    }

    fn publish(&mut self, snapshot: &Snapshot) -> Result<Delivery> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)
                .with_context(|| format!("creating dump directory {}", dir.display()))?;
        }

        let body = snapshot.to_json_pretty().context("serializing snapshot")?;
        fs::write(&self.path, body)
            .with_context(|| format!("writing dump file {}", self.path.display()))?;

        tracing::info!(
            path = %self.path.display(),
            spill = snapshot.spill_number,
            "snapshot dumped",
        );

        Ok(Delivery::Finished)
    }
}
