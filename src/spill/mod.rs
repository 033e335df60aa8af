//! Spill phase tracking and per-channel accumulation.
//!
//! [`SpillTracker`] consumes unpacked trigger events in stream order. Spill
//! boundary triggers move it between phases; regular channel triggers fill
//! the micro (inter-hit interval) and macro (time in spill) histograms of
//! their channel. Each end of spill yields one [`Snapshot`].

pub mod macrospill;
pub mod microspill;
pub mod report;
pub mod snapshot;
pub mod ticks;

use std::fmt;

use thiserror::Error;

use self::macrospill::MacroHistogram;
use self::microspill::{MicroHistogram, Sample};
use self::snapshot::Snapshot;
use crate::counter::WrapCounter;
use crate::source::event::{Channel, TriggerEvent, TriggerKind, NUM_CHANNELS};

/// Rejected histogram settings.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SettingError {
    #[error("micro bin count {0} outside 6..=256")]
    MicroBins(usize),

    #[error("micro range {0} ticks must exceed 100")]
    MicroRange(u32),

    #[error("macro bin width {0} s outside [0.05, 2.0)")]
    MacroBinWidth(f64),

    #[error("clock rate {0} Hz must be positive")]
    ClockRate(f64),
}

/// Violations of spill bookkeeping. Always fatal.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SpillError {
    #[error("negative spill duration: begin {bos}, end {eos}, {ticks} ticks")]
    NegativeDuration { bos: u32, eos: u32, ticks: i32 },
}

/// Where the stream currently is relative to the beam spill.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SpillPhase {
    /// No boundary seen since startup.
    #[default]
    Unknown,
    InSpill,
    OffSpill,
}

impl SpillPhase {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::InSpill => "in_spill",
            Self::OffSpill => "off_spill",
        }
    }
}

impl fmt::Display for SpillPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Histogram settings of one channel.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelSettings {
    pub alias: String,
    pub nbins: usize,
    pub max_range: u32,
    pub bin_width: f64,
}

impl ChannelSettings {
    /// Default settings under the hardware input name.
    pub fn for_channel(channel: Channel) -> Self {
        Self {
            alias: default_alias(channel),
            nbins: microspill::DEFAULT_BINS,
            max_range: microspill::DEFAULT_MAX_RANGE,
            bin_width: macrospill::DEFAULT_BIN_WIDTH,
        }
    }
}

/// Name of the scaler input a channel is wired to.
pub fn default_alias(channel: Channel) -> String {
    format!("ECL_IN({})", channel.number())
}

/// Settings for all four channels.
#[derive(Debug, Clone, PartialEq)]
pub struct SpillSettings {
    /// Rate of the hardware clock that stamps events and hits.
    pub clock_hz: f64,
    pub channels: Vec<ChannelSettings>,
}

impl Default for SpillSettings {
    fn default() -> Self {
        Self {
            clock_hz: DEFAULT_CLOCK_HZ,
            channels: Channel::all().map(ChannelSettings::for_channel).collect(),
        }
    }
}

/// 100 MHz, 10 ns per tick.
pub const DEFAULT_CLOCK_HZ: f64 = 1e8;

/// Phase state machine plus the histograms of every channel.
#[derive(Debug)]
pub struct SpillTracker {
    phase: SpillPhase,
    micro: Vec<MicroHistogram>,
    macros: Vec<MacroHistogram>,
    spill_number: u32,
    bos_ts: u32,
    eos_ts: u32,
}

impl SpillTracker {
    pub fn new(settings: &SpillSettings) -> Result<Self, SettingError> {
        let mut micro = Vec::with_capacity(NUM_CHANNELS);
        let mut macros = Vec::with_capacity(NUM_CHANNELS);

        for channel in Channel::all() {
            let cfg = settings
                .channels
                .get(channel.index())
                .cloned()
                .unwrap_or_else(|| ChannelSettings::for_channel(channel));
            micro.push(MicroHistogram::new(
                cfg.alias,
                cfg.nbins,
                cfg.max_range,
                settings.clock_hz,
            )?);
            macros.push(MacroHistogram::new(cfg.bin_width, settings.clock_hz)?);
        }

        Ok(Self {
            phase: SpillPhase::Unknown,
            micro,
            macros,
            spill_number: 0,
            bos_ts: 0,
            eos_ts: 0,
        })
    }

    /// Feeds one event through the phase machine.
    ///
    /// Returns the finished spill's snapshot on an end-of-spill trigger that
    /// closes a spill whose beginning was observed.
    pub fn handle(&mut self, event: &TriggerEvent) -> Result<Option<Snapshot>, SpillError> {
        let sample = Sample {
            ecl: event.ecl,
            clock: event.clock,
        };

        match event.kind {
            TriggerKind::BeginOfSpill => {
                self.bos_ts = event.clock;
                for (micro, macro_hist) in self.micro.iter_mut().zip(&mut self.macros) {
                    macro_hist.set_bos(event.clock);
                    macro_hist.init();
                    micro.clear();
                }

                let first = &mut self.micro[Channel::FIRST.index()];
                if first.fill(&event.deltas) > 0 {
                    first.mark_start(sample);
                }
                self.macros[Channel::FIRST.index()].fill(&event.deltas);

                if self.phase == SpillPhase::InSpill {
                    tracing::warn!(clock = event.clock, "begin of spill while already in spill");
                }
                self.phase = SpillPhase::InSpill;
                tracing::debug!(clock = event.clock, "begin of spill");

                Ok(None)
            }

            TriggerKind::EndOfSpill => {
                self.eos_ts = event.clock;
                for macro_hist in &mut self.macros {
                    macro_hist.set_eos(event.clock);
                }

                let first = &mut self.micro[Channel::FIRST.index()];
                if first.fill(&event.deltas) > 0 {
                    first.mark_end(sample);
                }
                self.macros[Channel::FIRST.index()].fill(&event.deltas);

                let snapshot = match self.phase {
                    SpillPhase::Unknown => {
                        tracing::info!(clock = event.clock, "skipping partial spill seen at startup");
                        None
                    }
                    phase => {
                        if phase == SpillPhase::OffSpill {
                            tracing::warn!(clock = event.clock, "end of spill while off spill");
                        }
                        Some(self.finish_spill(event)?)
                    }
                };

                for macro_hist in &mut self.macros {
                    macro_hist.reset();
                }
                self.phase = SpillPhase::OffSpill;

                Ok(snapshot)
            }

            TriggerKind::Channel(channel) => {
                let i = channel.index();
                match self.phase {
                    SpillPhase::InSpill => {
                        let micro = &mut self.micro[i];
                        micro.fill(&event.deltas);
                        micro.mark_start(sample);
                        micro.mark_end(sample);
                        self.macros[i].fill(&event.deltas);
                    }
                    SpillPhase::OffSpill => self.macros[i].fill_offspill(event.hits()),
                    SpillPhase::Unknown => {}
                }
                Ok(None)
            }
        }
    }

    fn finish_spill(&mut self, event: &TriggerEvent) -> Result<Snapshot, SpillError> {
        let duration = WrapCounter::<32>::calc_diff(self.eos_ts, self.bos_ts);
        if duration < 0 {
            return Err(SpillError::NegativeDuration {
                bos: self.bos_ts,
                eos: self.eos_ts,
                ticks: duration,
            });
        }

        self.spill_number += 1;
        let timestamp = snapshot::spill_timestamp(event.white_rabbit);

        snapshot::build(
            self.spill_number,
            duration,
            timestamp,
            &self.micro,
            &self.macros,
        )
    }

    pub fn phase(&self) -> SpillPhase {
        self.phase
    }

    pub fn spill_number(&self) -> u32 {
        self.spill_number
    }

    pub fn micro(&self, channel: Channel) -> &MicroHistogram {
        &self.micro[channel.index()]
    }

    pub fn macro_hist(&self, channel: Channel) -> &MacroHistogram {
        &self.macros[channel.index()]
    }
}
