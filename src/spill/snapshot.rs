use chrono::{DateTime, Local, TimeZone, Utc};
use serde::Serialize;

use super::macrospill::MacroHistogram;
use super::microspill::MicroHistogram;
use super::ticks::{count_ticks, time_ticks};
use super::SpillError;

/// TAI runs ahead of UTC by a 10 s base offset plus 27 leap seconds.
pub const TAI_UTC_OFFSET_SECS: u64 = 37;

/// Everything one channel contributes to a spill snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelSnapshot {
    pub name: String,
    pub counted: u32,
    pub lost_hits: u64,
    pub overflows: u32,
    /// Clock ticks between the first and last hit-bearing event.
    pub elapsed_time: i32,
    pub binx: Vec<f64>,
    pub biny: Vec<f64>,
    pub poisson_x: Vec<f64>,
    pub poisson_y: Vec<f64>,
    pub xticks_major: Vec<f64>,
    pub xticks_major_label: Vec<String>,
    pub xticks_minor: Vec<f64>,
    pub yticks_major: Vec<f64>,
    pub yticks_major_label: Vec<String>,
    pub yticks_minor: Vec<f64>,
    pub offspill: u32,
    pub macro_x: Vec<f64>,
    pub macro_y: Vec<u32>,
    pub macro_errors: u32,
}

/// Summary of one completed spill. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot {
    pub data: Vec<ChannelSnapshot>,
    pub spill_number: u32,
    /// Clock ticks from begin to end of spill.
    pub spill_duration: i32,
    pub timestamp: String,
}

impl Snapshot {
    /// Compact single-line JSON; NaN placeholders become `null`.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// JSON indented by four spaces, for dump files.
    pub fn to_json_pretty(&self) -> serde_json::Result<Vec<u8>> {
        let mut out = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut ser = serde_json::Serializer::with_formatter(&mut out, formatter);
        self.serialize(&mut ser)?;
        Ok(out)
    }

    /// Hits counted over all channels.
    pub fn total_counted(&self) -> u64 {
        self.data.iter().map(|c| u64::from(c.counted)).sum()
    }
}

/// Assembles the snapshot of a finished spill from its histograms.
pub fn build(
    spill_number: u32,
    spill_duration: i32,
    timestamp: String,
    micro: &[MicroHistogram],
    macros: &[MacroHistogram],
) -> Result<Snapshot, SpillError> {
    let data = micro
        .iter()
        .zip(macros)
        .map(|(m, mac)| channel_snapshot(m, mac))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Snapshot {
        data,
        spill_number,
        spill_duration,
        timestamp,
    })
}

fn channel_snapshot(
    micro: &MicroHistogram,
    macro_hist: &MacroHistogram,
) -> Result<ChannelSnapshot, SpillError> {
    let plot = micro.plot();
    let xticks = time_ticks(&plot.bin_x);
    let yticks = count_ticks(&plot.bin_y);
    let (macro_x, macro_y) = macro_hist.xy()?;

    Ok(ChannelSnapshot {
        name: micro.name().to_string(),
        counted: micro.hits_counted(),
        lost_hits: micro.lost_hits(),
        overflows: micro.overflows(),
        elapsed_time: micro.elapsed_ticks(),
        binx: plot.bin_x,
        biny: plot.bin_y,
        poisson_x: plot.poisson_x,
        poisson_y: plot.poisson_y,
        xticks_major: xticks.major,
        xticks_major_label: xticks.major_labels,
        xticks_minor: xticks.minor,
        yticks_major: yticks.major,
        yticks_major_label: yticks.major_labels,
        yticks_minor: yticks.minor,
        offspill: macro_hist.offspill(),
        macro_x,
        macro_y,
        macro_errors: macro_hist.errors(),
    })
}

/// Converts a White Rabbit (TAI) stamp to UTC.
pub fn white_rabbit_utc(tai_ns: u64) -> DateTime<Utc> {
    let utc_ns = tai_ns.saturating_sub(TAI_UTC_OFFSET_SECS * 1_000_000_000);
    DateTime::from_timestamp_nanos(i64::try_from(utc_ns).unwrap_or(i64::MAX))
}

/// Local-time label of a spill: the White Rabbit stamp when the event carries
/// one, the wall clock otherwise.
pub fn spill_timestamp(white_rabbit: Option<u64>) -> String {
    let utc = white_rabbit.map_or_else(Utc::now, white_rabbit_utc);
    format_timestamp(&utc.with_timezone(&Local))
}

/// `Tue Mar 05 2024 14:07:09.34`: seconds carry two-digit centiseconds.
pub fn format_timestamp<Tz>(time: &DateTime<Tz>) -> String
where
    Tz: TimeZone,
    Tz::Offset: std::fmt::Display,
{
    format!(
        "{}.{:02}",
        time.format("%a %b %d %Y %H:%M:%S"),
        time.timestamp_subsec_millis() / 10
    )
}
