pub mod dump;
pub mod tcp;

use anyhow::Result;

use crate::spill::snapshot::Snapshot;

/// Outcome of handing one snapshot to a sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Sent to `delivered` subscribers; `dropped` missed it.
    Published { delivered: usize, dropped: usize },
    /// The sink wants no more snapshots; the process should wind down.
    Finished,
}

/// Sink receives finished spill snapshots.
pub trait Sink: Send {
    /// Returns the sink's name for logging.
    fn name(&self) -> &str;

    /// Delivers one snapshot. Errors are fatal to the pipeline; slow or
    /// broken receivers are the sink's own business and must not block.
    fn publish(&mut self, snapshot: &Snapshot) -> Result<Delivery>;
}

/// Discards every snapshot; used when publishing is disabled.
#[derive(Debug, Default)]
pub struct NullSink;

impl Sink for NullSink {
    fn name(&self) -> &str {
        "null"
    }

    fn publish(&mut self, snapshot: &Snapshot) -> Result<Delivery> {
        tracing::debug!(
            spill = snapshot.spill_number,
            "publishing disabled, snapshot discarded"
        );
        Ok(Delivery::Published {
            delivered: 0,
            dropped: 0,
        })
    }
}
