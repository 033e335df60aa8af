//! Turns raw events into [`TriggerEvent`]s.
//!
//! Each channel owns a scaler counter, a clock counter and a hit-time
//! counter. Hit timestamps arrive as absolute 31-bit clock readings; the
//! unpacker converts them into inter-hit deltas, drops the trigger's own
//! echo on spill boundary events and interpolates over lost hits.

use serde::Deserialize;

use super::event::{
    ProtocolError, RawEvent, TriggerEvent, TriggerKind, LOST_HIT_FLAG, NUM_CHANNELS,
};
use crate::counter::WrapCounter;

/// Hit timestamps are 31-bit readings of the channel clock.
pub type HitClock = WrapCounter<31>;

/// Open window, in ticks before the clock sample, where a boundary trigger
/// sees its own input echo in the hit list.
const TRIGGER_ECHO_WINDOW: (i32, i32) = (490, 512);

/// How the interval in front of a hit flagged as "lost hit before" is split
/// into fake hits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LostHitPolicy {
    /// Two hits of `dt/2` each; the summed interval equals `dt`.
    #[default]
    EvenSplit,
    /// A hit of `dt/2` followed by a hit of `dt`.
    HalfThenFull,
}

impl LostHitPolicy {
    fn expand(self, dt: u32, deltas: &mut Vec<u32>) {
        let half = dt / 2;
        match self {
            Self::EvenSplit => {
                deltas.push(half);
                deltas.push(dt - half);
            }
            Self::HalfThenFull => {
                deltas.push(half);
                deltas.push(dt);
            }
        }
    }
}

/// Rolling counters of one input channel.
#[derive(Debug, Clone, Default)]
pub struct ChannelState {
    pub ecl: WrapCounter<32>,
    pub clock: WrapCounter<32>,
    pub hit_time: HitClock,
}

/// Unpacks raw events, owning all per-channel counter state.
#[derive(Debug)]
pub struct Unpacker {
    channels: [ChannelState; NUM_CHANNELS],
    policy: LostHitPolicy,
    white_rabbit_prev: u64,
    anomalies: u64,
}

impl Unpacker {
    pub fn new(policy: LostHitPolicy) -> Self {
        Self {
            channels: Default::default(),
            policy,
            white_rabbit_prev: 0,
            anomalies: 0,
        }
    }

    /// Classifies and unpacks one raw event.
    ///
    /// Unknown trigger categories are rejected before any counter moves.
    pub fn unpack(&mut self, raw: &RawEvent) -> Result<TriggerEvent, ProtocolError> {
        let kind = TriggerKind::from_raw(raw.trigger)?;

        if kind == TriggerKind::BeginOfSpill {
            for state in &mut self.channels {
                state.hit_time.reseed();
            }
        }

        let state = &mut self.channels[kind.channel().index()];

        let ecl_increment = state.ecl.advance(raw.ecl);
        let mut anomalies = u64::from(ecl_increment.is_some() && state.ecl.went_backwards());
        let clock_increment = state.clock.advance(raw.clock);
        anomalies += u64::from(clock_increment.is_some() && state.clock.went_backwards());

        let mut echo = kind.is_boundary().then_some(raw.clock);
        let mut deltas = Vec::with_capacity(raw.hit_items() + 2);
        for list in [&raw.timing_extra, &raw.timing] {
            anomalies += unpack_timing(
                list,
                &mut state.hit_time,
                &mut echo,
                self.policy,
                &mut deltas,
            );
        }

        let white_rabbit = raw.white_rabbit();
        let white_rabbit_increment = match white_rabbit {
            Some(ts) => {
                let inc = ts.wrapping_sub(self.white_rabbit_prev);
                self.white_rabbit_prev = ts;
                inc
            }
            None => 0,
        };

        self.anomalies += anomalies;

        Ok(TriggerEvent {
            kind,
            clock: raw.clock,
            ecl: raw.ecl,
            ecl_increment,
            clock_increment,
            deltas,
            white_rabbit,
            white_rabbit_increment,
        })
    }

    /// Returns and clears the number of counters seen going backwards.
    pub fn take_anomalies(&mut self) -> u64 {
        std::mem::take(&mut self.anomalies)
    }

    pub fn policy(&self) -> LostHitPolicy {
        self.policy
    }

    pub fn channel_state(&self, index: usize) -> Option<&ChannelState> {
        self.channels.get(index)
    }
}

impl Default for Unpacker {
    fn default() -> Self {
        Self::new(LostHitPolicy::default())
    }
}

/// Converts one list of absolute hit timestamps into deltas.
///
/// `echo` holds the boundary clock sample until the trigger echo has been
/// dropped; it is shared across both lists of an event so at most one hit is
/// removed. Returns the number of backwards steps seen.
fn unpack_timing(
    items: &[u32],
    hit_time: &mut HitClock,
    echo: &mut Option<u32>,
    policy: LostHitPolicy,
    deltas: &mut Vec<u32>,
) -> u64 {
    let mut anomalies = 0;

    for &item in items {
        if let Some(clock) = *echo {
            let before = HitClock::calc_diff(clock, item);
            if before > TRIGGER_ECHO_WINDOW.0 && before < TRIGGER_ECHO_WINDOW.1 {
                *echo = None;
                continue;
            }
        }

        let Some(dt) = hit_time.advance(item) else {
            continue;
        };
        if hit_time.went_backwards() {
            anomalies += 1;
        }

        if item & LOST_HIT_FLAG != 0 {
            policy.expand(dt, deltas);
        } else {
            deltas.push(dt);
        }
    }

    anomalies
}
