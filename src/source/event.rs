use std::fmt;

use thiserror::Error;

/// Number of regular input channels.
pub const NUM_CHANNELS: usize = 4;

/// Maximum number of hit timestamps in one timing list.
pub const MAX_TIMING_ITEMS: usize = 1024;

/// Hit timestamps carry their value in the low 31 bits.
pub const HIT_TIME_BITS: u32 = 31;

/// Bit 31 of a hit timestamp: at least one hit was lost before this one.
pub const LOST_HIT_FLAG: u32 = 0x8000_0000;

/// Input channel 1..=4, stored zero-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Channel(u8);

impl Channel {
    /// Channel 1, which also carries the spill boundary triggers.
    pub const FIRST: Channel = Channel(0);

    /// Builds a channel from its zero-based index.
    pub fn from_index(index: usize) -> Option<Self> {
        (index < NUM_CHANNELS).then_some(Self(index as u8))
    }

    /// Builds a channel from its one-based number as printed on the hardware.
    pub fn from_number(number: u32) -> Option<Self> {
        match number {
            1..=4 => Some(Self((number - 1) as u8)),
            _ => None,
        }
    }

    pub const fn index(self) -> usize {
        self.0 as usize
    }

    pub const fn number(self) -> u32 {
        self.0 as u32 + 1
    }

    /// All channels in ascending order.
    pub fn all() -> impl Iterator<Item = Channel> {
        (0..NUM_CHANNELS as u8).map(Channel)
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ch{}", self.number())
    }
}

/// Trigger category of an event.
/// Raw values match the acquisition trigger numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TriggerKind {
    /// Regular readout of one input channel (raw 1..=4).
    Channel(Channel),
    /// Begin-of-spill marker (raw 12).
    BeginOfSpill,
    /// End-of-spill marker (raw 13).
    EndOfSpill,
}

/// A trigger category outside the known set. Always fatal.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("unknown trigger category {raw}")]
    UnknownTrigger { raw: u32 },
}

impl TriggerKind {
    pub const BEGIN_OF_SPILL_RAW: u32 = 12;
    pub const END_OF_SPILL_RAW: u32 = 13;

    /// Classifies a raw trigger number.
    pub fn from_raw(raw: u32) -> Result<Self, ProtocolError> {
        match raw {
            Self::BEGIN_OF_SPILL_RAW => Ok(Self::BeginOfSpill),
            Self::END_OF_SPILL_RAW => Ok(Self::EndOfSpill),
            _ => Channel::from_number(raw)
                .map(Self::Channel)
                .ok_or(ProtocolError::UnknownTrigger { raw }),
        }
    }

    pub const fn raw(self) -> u32 {
        match self {
            Self::Channel(ch) => ch.number(),
            Self::BeginOfSpill => Self::BEGIN_OF_SPILL_RAW,
            Self::EndOfSpill => Self::END_OF_SPILL_RAW,
        }
    }

    /// Channel whose counters this trigger reads out.
    /// Spill boundaries are wired to channel 1.
    pub const fn channel(self) -> Channel {
        match self {
            Self::Channel(ch) => ch,
            Self::BeginOfSpill | Self::EndOfSpill => Channel::FIRST,
        }
    }

    pub const fn is_boundary(self) -> bool {
        matches!(self, Self::BeginOfSpill | Self::EndOfSpill)
    }

    /// Label used in logs and metrics.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Channel(ch) => match ch.index() {
                0 => "ch1",
                1 => "ch2",
                2 => "ch3",
                _ => "ch4",
            },
            Self::BeginOfSpill => "begin_of_spill",
            Self::EndOfSpill => "end_of_spill",
        }
    }
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One event as delivered by the acquisition server.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawEvent {
    pub trigger: u32,
    /// Free-running 32-bit clock, 10 ns ticks.
    pub clock: u32,
    /// Scaler (ECL input) reading of the triggering channel.
    pub ecl: u32,
    pub wr_hi: u32,
    pub wr_lo: u32,
    /// Hit timestamps read out of the extra block; unpacked first.
    pub timing_extra: Vec<u32>,
    pub timing: Vec<u32>,
}

impl RawEvent {
    /// White Rabbit timestamp in TAI nanoseconds; `None` when the pair is zero.
    pub fn white_rabbit(&self) -> Option<u64> {
        if self.wr_hi == 0 && self.wr_lo == 0 {
            return None;
        }
        Some((u64::from(self.wr_hi) << 32) | u64::from(self.wr_lo))
    }

    pub fn hit_items(&self) -> usize {
        self.timing_extra.len() + self.timing.len()
    }
}

/// An event after unpacking: classified, with wrap-corrected increments and
/// inter-hit deltas. Read-only once built.
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerEvent {
    pub kind: TriggerKind,
    pub clock: u32,
    pub ecl: u32,
    /// Scaler increment since the previous event of this category's channel.
    pub ecl_increment: Option<u32>,
    pub clock_increment: Option<u32>,
    /// Inter-hit intervals in clock ticks, in arrival order.
    pub deltas: Vec<u32>,
    pub white_rabbit: Option<u64>,
    /// Nanoseconds since the previous White Rabbit stamp.
    pub white_rabbit_increment: u64,
}

impl TriggerEvent {
    /// An event with no hits and no counter history.
    pub fn new(kind: TriggerKind, clock: u32, ecl: u32) -> Self {
        Self {
            kind,
            clock,
            ecl,
            ecl_increment: None,
            clock_increment: None,
            deltas: Vec::new(),
            white_rabbit: None,
            white_rabbit_increment: 0,
        }
    }

    pub fn with_deltas(mut self, deltas: Vec<u32>) -> Self {
        self.deltas = deltas;
        self
    }

    pub fn hits(&self) -> usize {
        self.deltas.len()
    }
}
