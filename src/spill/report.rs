//! Per-spill scaler report.
//!
//! Compares, for every channel, the hits delivered as timestamps against the
//! increments of the channel's hardware scaler over the same spill. The two
//! disagree when hits are lost between the scaler and the timing readout.

use std::fmt;

use crate::counter::WrapCounter;
use crate::source::event::{Channel, TriggerEvent, TriggerKind, NUM_CHANNELS};

use super::SpillPhase;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct Tally {
    hits: u64,
    scaler: u64,
    offspill: u64,
}

/// Counts of one channel over a finished spill.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelReport {
    pub name: String,
    pub hits: u64,
    pub scaler: u64,
    pub offspill: u64,
    /// Scaler rate over the spill in Hz; 0 for an empty spill.
    pub rate_hz: f64,
}

/// Summary of one finished spill.
#[derive(Debug, Clone, PartialEq)]
pub struct SpillReport {
    pub spill: u64,
    pub duration_ticks: i32,
    pub duration_secs: f64,
    pub channels: Vec<ChannelReport>,
}

impl fmt::Display for SpillReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "spill {} ({:.3} s, {} ticks)",
            self.spill, self.duration_secs, self.duration_ticks
        )?;
        writeln!(
            f,
            "  {:<16} {:>10} {:>10} {:>10} {:>12}",
            "channel", "hits", "scaler", "offspill", "rate [Hz]"
        )?;
        for ch in &self.channels {
            writeln!(
                f,
                "  {:<16} {:>10} {:>10} {:>10} {:>12.1}",
                ch.name, ch.hits, ch.scaler, ch.offspill, ch.rate_hz
            )?;
        }
        Ok(())
    }
}

/// Accumulates hit and scaler counts per spill, independent of the histograms.
#[derive(Debug)]
pub struct ScalerMonitor {
    names: Vec<String>,
    clock_hz: f64,
    phase: SpillPhase,
    tallies: [Tally; NUM_CHANNELS],
    bos_ts: u32,
    spills: u64,
    begins: u64,
}

impl ScalerMonitor {
    pub fn new(names: Vec<String>, clock_hz: f64) -> Self {
        Self {
            names,
            clock_hz,
            phase: SpillPhase::Unknown,
            tallies: [Tally::default(); NUM_CHANNELS],
            bos_ts: 0,
            spills: 0,
            begins: 0,
        }
    }

    /// Consumes one event; returns a report when a fully observed spill ends.
    pub fn handle(&mut self, event: &TriggerEvent) -> Option<SpillReport> {
        let index = event.kind.channel().index();
        let scaler = u64::from(event.ecl_increment.unwrap_or(0));

        match event.kind {
            TriggerKind::BeginOfSpill => {
                self.begins += 1;
                self.bos_ts = event.clock;
                for tally in &mut self.tallies {
                    tally.hits = 0;
                    tally.scaler = 0;
                }
                self.tallies[index].hits += event.hits() as u64;
                self.phase = SpillPhase::InSpill;
                None
            }
            TriggerKind::EndOfSpill => {
                let report = if self.phase == SpillPhase::InSpill {
                    let tally = &mut self.tallies[index];
                    tally.hits += event.hits() as u64;
                    tally.scaler += scaler;
                    Some(self.report(event.clock))
                } else {
                    None
                };
                for tally in &mut self.tallies {
                    tally.offspill = 0;
                }
                self.phase = SpillPhase::OffSpill;
                report
            }
            TriggerKind::Channel(_) => {
                let tally = &mut self.tallies[index];
                match self.phase {
                    SpillPhase::InSpill => {
                        tally.hits += event.hits() as u64;
                        tally.scaler += scaler;
                    }
                    SpillPhase::OffSpill => tally.offspill += event.hits() as u64,
                    SpillPhase::Unknown => {}
                }
                None
            }
        }
    }

    fn report(&mut self, eos_ts: u32) -> SpillReport {
        self.spills += 1;
        let duration_ticks = WrapCounter::<32>::calc_diff(eos_ts, self.bos_ts);
        let duration_secs = f64::from(duration_ticks) / self.clock_hz;

        let channels = Channel::all()
            .map(|ch| {
                let tally = self.tallies[ch.index()];
                let rate_hz = if duration_secs > 0.0 {
                    tally.scaler as f64 / duration_secs
                } else {
                    0.0
                };
                ChannelReport {
                    name: self
                        .names
                        .get(ch.index())
                        .cloned()
                        .unwrap_or_else(|| ch.to_string()),
                    hits: tally.hits,
                    scaler: tally.scaler,
                    offspill: tally.offspill,
                    rate_hz,
                }
            })
            .collect();

        SpillReport {
            spill: self.spills,
            duration_ticks,
            duration_secs,
            channels,
        }
    }

    /// Begin-of-spill triggers seen so far.
    pub fn begins(&self) -> u64 {
        self.begins
    }

    /// Spills reported so far.
    pub fn spills(&self) -> u64 {
        self.spills
    }
}
