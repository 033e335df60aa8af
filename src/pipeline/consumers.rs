use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;

use super::{Consumer, Flow};
use crate::export::health::HealthMetrics;
use crate::sink::{Delivery, Sink};
use crate::source::event::{TriggerEvent, TriggerKind};
use crate::spill::report::ScalerMonitor;
use crate::spill::{SpillPhase, SpillTracker};

/// Lock serializing multi-line console output and snapshot emission.
pub type ConsoleLock = Arc<Mutex<()>>;

/// Feeds the spill tracker and publishes a snapshot at every end of spill.
pub struct SpillAccumulator {
    tracker: SpillTracker,
    sink: Box<dyn Sink>,
    clock_hz: f64,
    health: Arc<HealthMetrics>,
    console: ConsoleLock,
}

impl SpillAccumulator {
    pub fn new(
        tracker: SpillTracker,
        sink: Box<dyn Sink>,
        clock_hz: f64,
        health: Arc<HealthMetrics>,
        console: ConsoleLock,
    ) -> Self {
        Self {
            tracker,
            sink,
            clock_hz,
            health,
            console,
        }
    }
}

impl Consumer for SpillAccumulator {
    fn name(&self) -> &str {
        "spill"
    }

    fn consume(&mut self, event: &TriggerEvent) -> Result<Flow> {
        let phase_before = self.tracker.phase();
        let snapshot = self.tracker.handle(event).context("tracking spill")?;
        self.health.set_phase(self.tracker.phase());

        let Some(snapshot) = snapshot else {
            if event.kind == TriggerKind::EndOfSpill && phase_before == SpillPhase::Unknown {
                self.health.spills_skipped.inc();
            }
            return Ok(Flow::Continue);
        };

        self.health.spills_completed.inc();
        self.health
            .spill_duration
            .observe(f64::from(snapshot.spill_duration) / self.clock_hz);

        let _console = self.console.lock();
        tracing::info!(
            spill = snapshot.spill_number,
            duration_ticks = snapshot.spill_duration,
            hits = snapshot.total_counted(),
            sink = self.sink.name(),
            "spill complete",
        );

        match self.sink.publish(&snapshot) {
            Ok(Delivery::Published { delivered, dropped }) => {
                self.health
                    .deliveries
                    .with_label_values(&["delivered"])
                    .inc_by(delivered as f64);
                self.health
                    .deliveries
                    .with_label_values(&["dropped"])
                    .inc_by(dropped as f64);
                Ok(Flow::Continue)
            }
            Ok(Delivery::Finished) => Ok(Flow::Stop),
            Err(e) => {
                self.health.publish_errors.inc();
                Err(e.context(format!("publishing spill {}", snapshot.spill_number)))
            }
        }
    }
}

/// Prints a scaler table after every fully observed spill.
pub struct ReportConsumer {
    monitor: ScalerMonitor,
    console: ConsoleLock,
}

impl ReportConsumer {
    pub fn new(monitor: ScalerMonitor, console: ConsoleLock) -> Self {
        Self { monitor, console }
    }
}

impl Consumer for ReportConsumer {
    fn name(&self) -> &str {
        "monitor"
    }

    fn consume(&mut self, event: &TriggerEvent) -> Result<Flow> {
        if let Some(report) = self.monitor.handle(event) {
            let _console = self.console.lock();
            for ch in &report.channels {
                tracing::info!(
                    spill = report.spill,
                    channel = %ch.name,
                    hits = ch.hits,
                    scaler = ch.scaler,
                    offspill = ch.offspill,
                    rate_hz = ch.rate_hz,
                    duration_secs = report.duration_secs,
                    "scaler report",
                );
            }
            print!("{report}");
        }
        Ok(Flow::Continue)
    }
}
