//! Real-time spill structure monitor for beam-timing trigger event streams.
//!
//! Events flow from an [`source::EventSource`] through the
//! [`source::unpack::Unpacker`] into a threaded [`pipeline::Pipeline`], whose
//! consumers accumulate per-spill histograms ([`spill::SpillTracker`]) and hand
//! finished [`spill::snapshot::Snapshot`]s to a [`sink::Sink`].

pub mod agent;
pub mod config;
pub mod counter;
pub mod export;
pub mod pipeline;
pub mod sink;
pub mod source;
pub mod spill;
