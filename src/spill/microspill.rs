use std::fmt;

use crate::counter::WrapCounter;

use super::SettingError;

/// Capacity of the bin array.
pub const MAX_BINS: usize = 256;

/// Smallest configurable bin count.
pub const MIN_BINS: usize = 6;

/// Default number of bins.
pub const DEFAULT_BINS: usize = 100;

/// Default upper edge of the histogram, in clock ticks (100 ms at 100 MHz).
pub const DEFAULT_MAX_RANGE: u32 = 10_000_000;

/// The upper edge must exceed this many ticks.
pub const MIN_MAX_RANGE: u32 = 100;

/// Added to every non-empty log10 height so single counts stand above empty bins.
pub const DISPLAY_OFFSET: f64 = std::f64::consts::LOG10_2;

/// Trimmed window reported for a histogram without any hits.
pub const EMPTY_BOUNDS: (usize, usize) = (2, 4);

/// Poisson overlay starts at the first bin centred above ~25 ns (log10 seconds).
const POISSON_CUTOFF_LOG_SECONDS: f64 = -7.6;

/// Bins past the trimmed right edge covered by the overlay.
const POISSON_TAIL_BINS: usize = 3;

/// Fewer counted hits than this yield the NaN placeholder instead of an overlay.
const POISSON_MIN_HITS: u32 = 11;

pub fn validate_bins(nbins: usize) -> Result<(), SettingError> {
    if (MIN_BINS..=MAX_BINS).contains(&nbins) {
        Ok(())
    } else {
        Err(SettingError::MicroBins(nbins))
    }
}

pub fn validate_range(max_range: u32) -> Result<(), SettingError> {
    if max_range > MIN_MAX_RANGE {
        Ok(())
    } else {
        Err(SettingError::MicroRange(max_range))
    }
}

/// Scaler and clock readings taken together at one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sample {
    pub ecl: u32,
    pub clock: u32,
}

/// Series ready for plotting: trimmed bars plus the Poisson overlay.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MicroPlot {
    pub bin_x: Vec<f64>,
    pub bin_y: Vec<f64>,
    pub poisson_x: Vec<f64>,
    pub poisson_y: Vec<f64>,
}

/// Log-time histogram of inter-hit intervals for one channel and one spill.
///
/// A value `v` (ticks) lands in bin `floor(nbins * log10(v) / log10(max_range))`;
/// anything at or above `max_range` is an overflow. The scaler/clock samples
/// of the first and last hit of the spill bracket the histogram so that the
/// scaler's own count can be compared against the hits seen.
pub struct MicroHistogram {
    name: String,
    bins: [u32; MAX_BINS],
    nbins: usize,
    max_range: u32,
    max_range_log: f64,
    /// log10 of the clock period in seconds.
    tick_log: f64,
    cutoff: usize,
    hits_counted: u32,
    overflows: u32,
    first: Option<Sample>,
    last: Option<Sample>,
}

impl MicroHistogram {
    /// Creates an empty histogram for a clock running at `clock_hz`.
    pub fn new(
        name: impl Into<String>,
        nbins: usize,
        max_range: u32,
        clock_hz: f64,
    ) -> Result<Self, SettingError> {
        validate_bins(nbins)?;
        validate_range(max_range)?;
        if !(clock_hz.is_finite() && clock_hz > 0.0) {
            return Err(SettingError::ClockRate(clock_hz));
        }

        let mut hist = Self {
            name: name.into(),
            bins: [0; MAX_BINS],
            nbins,
            max_range,
            max_range_log: f64::from(max_range).log10(),
            tick_log: -clock_hz.log10(),
            cutoff: 0,
            hits_counted: 0,
            overflows: 0,
            first: None,
            last: None,
        };
        hist.update_cutoff();
        Ok(hist)
    }

    pub fn set_bins(&mut self, nbins: usize) -> Result<(), SettingError> {
        validate_bins(nbins)?;
        self.nbins = nbins;
        self.update_cutoff();
        Ok(())
    }

    pub fn set_range(&mut self, max_range: u32) -> Result<(), SettingError> {
        validate_range(max_range)?;
        self.max_range = max_range;
        self.max_range_log = f64::from(max_range).log10();
        self.update_cutoff();
        Ok(())
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    /// Empties the histogram and forgets the spill bracket.
    pub fn clear(&mut self) {
        self.bins = [0; MAX_BINS];
        self.hits_counted = 0;
        self.overflows = 0;
        self.first = None;
        self.last = None;
    }

    /// Adds every delta; returns how many were offered.
    pub fn fill(&mut self, deltas: &[u32]) -> usize {
        for &value in deltas {
            let bin = self.bin_index(value);
            match self.bins.get_mut(bin) {
                Some(slot) if bin < self.nbins => {
                    *slot += 1;
                    self.hits_counted += 1;
                }
                _ => self.overflows += 1,
            }
        }
        deltas.len()
    }

    /// Bin for a value in ticks; `nbins` or above means overflow.
    pub fn bin_index(&self, value: u32) -> usize {
        let scaled = self.nbins as f64 * log10_or_zero(f64::from(value)) / self.max_range_log;
        scaled.floor() as usize
    }

    /// Records the opening sample unless one is already set this spill.
    pub fn mark_start(&mut self, sample: Sample) {
        if self.first.is_none() {
            self.first = Some(sample);
        }
    }

    /// Records the latest closing sample, superseding earlier ones.
    pub fn mark_end(&mut self, sample: Sample) {
        self.last = Some(sample);
    }

    pub fn has_start(&self) -> bool {
        self.first.is_some()
    }

    /// Clock ticks between the first and the last bracketing sample.
    pub fn elapsed_ticks(&self) -> i32 {
        match (self.first, self.last) {
            (Some(first), Some(last)) => WrapCounter::<32>::calc_diff(last.clock, first.clock),
            _ => 0,
        }
    }

    /// Hits the scaler counted between the bracketing samples.
    pub fn scaler_hits(&self) -> i64 {
        match (self.first, self.last) {
            (Some(first), Some(last)) => {
                i64::from(WrapCounter::<32>::calc_diff(last.ecl, first.ecl))
            }
            _ => 0,
        }
    }

    /// Disagreement between the scaler count and the hits binned here.
    pub fn lost_hits(&self) -> u64 {
        (i64::from(self.hits_counted) - self.scaler_hits()).unsigned_abs()
    }

    /// Bin range worth plotting: leading and trailing empty bins trimmed, one
    /// empty bin kept on each side where there is one.
    pub fn bounds(&self) -> (usize, usize) {
        let used = &self.bins[..self.nbins];
        let first = used.iter().position(|&c| c != 0);
        let last = used.iter().rposition(|&c| c != 0);
        match (first, last) {
            (Some(first), Some(last)) => (
                first.saturating_sub(1),
                (last + 1).min(self.nbins - 1),
            ),
            _ => EMPTY_BOUNDS,
        }
    }

    /// Centre of bin `index` in log10(seconds).
    pub fn bin_center(&self, index: usize) -> f64 {
        self.bin_width() * (index as f64 + 0.5) + self.tick_log
    }

    /// Builds the trimmed bars and the Poisson overlay.
    pub fn plot(&self) -> MicroPlot {
        let (left, right) = self.bounds();

        let bin_x = (left..=right).map(|i| self.bin_center(i)).collect();
        let bin_y = self.bins[left..=right]
            .iter()
            .map(|&count| match count {
                0 => 0.0,
                n => f64::from(n).log10() + DISPLAY_OFFSET,
            })
            .collect();

        let (poisson_x, poisson_y) = if self.hits_counted < POISSON_MIN_HITS {
            (vec![f64::NAN], vec![f64::NAN])
        } else {
            let end = (right + POISSON_TAIL_BINS).min(MAX_BINS - 1);
            let total = f64::from(self.elapsed_ticks());
            (self.cutoff..end)
                .map(|bin| {
                    let expected = poisson_log_expected(
                        bin,
                        f64::from(self.hits_counted),
                        total,
                        self.bin_width(),
                    );
                    (self.bin_center(bin), (expected + DISPLAY_OFFSET).max(0.0))
                })
                .unzip()
        };

        MicroPlot {
            bin_x,
            bin_y,
            poisson_x,
            poisson_y,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn nbins(&self) -> usize {
        self.nbins
    }

    pub fn max_range(&self) -> u32 {
        self.max_range
    }

    pub fn hits_counted(&self) -> u32 {
        self.hits_counted
    }

    pub fn overflows(&self) -> u32 {
        self.overflows
    }

    pub fn cutoff(&self) -> usize {
        self.cutoff
    }

    /// Counts of the configured bins.
    pub fn bins(&self) -> &[u32] {
        &self.bins[..self.nbins]
    }

    /// Width of one bin in decades.
    fn bin_width(&self) -> f64 {
        self.max_range_log / self.nbins as f64
    }

    fn update_cutoff(&mut self) {
        self.cutoff = (0..self.nbins)
            .find(|&bin| self.bin_center(bin) > POISSON_CUTOFF_LOG_SECONDS)
            .unwrap_or(self.nbins);
    }
}

impl fmt::Debug for MicroHistogram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MicroHistogram")
            .field("name", &self.name)
            .field("nbins", &self.nbins)
            .field("max_range", &self.max_range)
            .field("hits_counted", &self.hits_counted)
            .field("overflows", &self.overflows)
            .field("first", &self.first)
            .field("last", &self.last)
            .finish()
    }
}

/// Expected `log10(count)` in log bin `bin` for `hits` Poisson-distributed
/// arrivals over `total_ticks`, bins being `width` decades wide.
///
/// Unclamped: bins expecting less than one hit come out negative (or `-inf`
/// once the probability underflows). The plot clamps after adding the display
/// offset.
pub fn poisson_log_expected(bin: usize, hits: f64, total_ticks: f64, width: f64) -> f64 {
    let rate = hits / total_ticks;
    let lower = (-rate * 10f64.powf(bin as f64 * width)).exp();
    let upper = (-rate * 10f64.powf((bin + 1) as f64 * width)).exp();
    hits.log10() + (lower - upper).log10()
}

fn log10_or_zero(value: f64) -> f64 {
    if value == 0.0 {
        0.0
    } else {
        value.log10()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CLOCK_HZ: f64 = 1e8;

    fn hist() -> MicroHistogram {
        MicroHistogram::new("ch1", DEFAULT_BINS, DEFAULT_MAX_RANGE, CLOCK_HZ).unwrap()
    }

    #[test]
    fn test_bin_index() {
        let h = hist();
        // log10(1e7) = 7 decades over 100 bins.
        assert_eq!(h.bin_index(0), 0);
        assert_eq!(h.bin_index(1), 0);
        assert_eq!(h.bin_index(10), 14);
        assert_eq!(h.bin_index(1_000), 42);
        assert_eq!(h.bin_index(9_999_999), 99);
        assert_eq!(h.bin_index(10_000_000), 100);
    }

    #[test]
    fn test_fill_conserves_hits() {
        let mut h = hist();
        let deltas = [0, 5, 100, 9_999_999, 10_000_000, u32::MAX, 42];
        assert_eq!(h.fill(&deltas), deltas.len());
        assert_eq!(h.hits_counted(), 5);
        assert_eq!(h.overflows(), 2);
        assert_eq!(
            (h.hits_counted() + h.overflows()) as usize,
            deltas.len()
        );
        assert_eq!(h.bins().iter().sum::<u32>(), h.hits_counted());
    }

    #[test]
    fn test_clear() {
        let mut h = hist();
        h.fill(&[10, 20, 1 << 30]);
        h.mark_start(Sample { ecl: 1, clock: 2 });
        h.clear();
        assert_eq!(h.hits_counted(), 0);
        assert_eq!(h.overflows(), 0);
        assert!(h.bins().iter().all(|&c| c == 0));
        assert!(!h.has_start());
        assert_eq!(h.elapsed_ticks(), 0);
    }

    #[test]
    fn test_settings_validated() {
        assert_eq!(
            MicroHistogram::new("x", 5, DEFAULT_MAX_RANGE, CLOCK_HZ).unwrap_err(),
            SettingError::MicroBins(5)
        );
        assert!(MicroHistogram::new("x", 257, DEFAULT_MAX_RANGE, CLOCK_HZ).is_err());
        assert!(MicroHistogram::new("x", 256, 101, CLOCK_HZ).is_ok());
        assert_eq!(
            MicroHistogram::new("x", 6, 100, CLOCK_HZ).unwrap_err(),
            SettingError::MicroRange(100)
        );

        let mut h = hist();
        assert!(h.set_bins(300).is_err());
        assert_eq!(h.nbins(), DEFAULT_BINS);
        h.set_range(1_000_000).unwrap();
        assert_eq!(h.bin_index(1_000_000), DEFAULT_BINS);
    }

    #[test]
    fn test_bounds_keep_one_empty_bin() {
        let mut h = hist();
        assert_eq!(h.bounds(), EMPTY_BOUNDS);

        h.fill(&[10, 1_000]);
        assert_eq!(h.bounds(), (13, 43));

        let mut h = hist();
        h.fill(&[1, 9_999_999]);
        assert_eq!(h.bounds(), (0, 99));
    }

    #[test]
    fn test_cutoff_near_25ns() {
        let h = hist();
        // Bin width 0.07 decades; centre of bin 5 is 0.385 - 8 = -7.615.
        assert_eq!(h.cutoff(), 6);
        assert!(h.bin_center(6) > -7.6);
    }

    #[test]
    fn test_bracket() {
        let mut h = hist();
        h.mark_start(Sample { ecl: 100, clock: 1_000 });
        h.mark_end(Sample { ecl: 105, clock: 1_500 });
        h.mark_start(Sample { ecl: 999, clock: 9_999 });
        h.mark_end(Sample { ecl: 110, clock: 2_000 });
        assert_eq!(h.elapsed_ticks(), 1_000);
        assert_eq!(h.scaler_hits(), 10);

        h.fill(&[50, 60, 70]);
        assert_eq!(h.lost_hits(), 7);
    }

    #[test]
    fn test_plot_placeholder_below_eleven_hits() {
        let mut h = hist();
        h.fill(&[100; 10]);
        let plot = h.plot();
        assert_eq!(plot.poisson_x.len(), 1);
        assert!(plot.poisson_x[0].is_nan());
        assert!(plot.poisson_y[0].is_nan());
        assert_eq!(plot.bin_x.len(), plot.bin_y.len());
    }

    #[test]
    fn test_plot_series() {
        let mut h = hist();
        h.mark_start(Sample { ecl: 0, clock: 0 });
        h.mark_end(Sample { ecl: 20, clock: 20_000 });
        h.fill(&[1_000; 20]);

        let plot = h.plot();
        // Bars for bins 41..=43, the middle one holding all 20 hits.
        assert_eq!(plot.bin_x.len(), 3);
        assert_eq!(plot.bin_y[0], 0.0);
        assert!((plot.bin_y[1] - (20f64.log10() + DISPLAY_OFFSET)).abs() < 1e-12);
        assert!((plot.bin_x[1] - h.bin_center(42)).abs() < 1e-12);

        // Overlay from the cutoff bin to three past the right edge.
        assert_eq!(plot.poisson_x.len(), 46 - h.cutoff());
        assert!(plot.poisson_y.iter().all(|&y| y >= 0.0));

        // Tail bins expecting well under one hit sit on the axis, not at the offset.
        assert_eq!(plot.poisson_y[0], 0.0);
        let bin = |b: usize| plot.poisson_y[b - h.cutoff()];
        assert_eq!(bin(27), 0.0);
        let raw = poisson_log_expected(38, 20.0, 20_000.0, 0.07);
        assert!(raw < 0.0 && raw + DISPLAY_OFFSET > 0.0);
        assert!((bin(38) - (raw + DISPLAY_OFFSET)).abs() < 1e-12);
    }

    #[test]
    fn test_plot_overlay_stops_before_last_bin() {
        let mut h = MicroHistogram::new("ch1", MAX_BINS, DEFAULT_MAX_RANGE, CLOCK_HZ).unwrap();
        h.mark_start(Sample { ecl: 0, clock: 0 });
        h.mark_end(Sample { ecl: 12, clock: 200_000_000 });
        h.fill(&[9_999_999; 12]);
        assert_eq!(h.bounds().1, MAX_BINS - 1);

        let plot = h.plot();
        assert_eq!(plot.poisson_x.len(), MAX_BINS - 1 - h.cutoff());
        let last = plot.poisson_x.last().copied().unwrap();
        assert!((last - h.bin_center(MAX_BINS - 2)).abs() < 1e-12);
    }

    #[test]
    fn test_poisson_peak_near_mean_interval() {
        // 1000 hits over 1e6 ticks: mean interval 1e3 ticks = 3 decades.
        let width = 7.0 / 100.0;
        let at = |bin: usize| poisson_log_expected(bin, 1_000.0, 1e6, width);
        let peak = (0..100).max_by(|&a, &b| at(a).total_cmp(&at(b))).unwrap();
        assert!((40..=45).contains(&peak), "peak at {peak}");
        assert!(at(peak) > 1.0);
        assert!(at(99) < 0.0);
    }
}
