use crate::counter::WrapCounter;

use super::{SettingError, SpillError};

/// Regular bins; index `MAX_BINS` is the error bin.
pub const MAX_BINS: usize = 1001;

/// Default bin width in seconds.
pub const DEFAULT_BIN_WIDTH: f64 = 0.1;

/// Allowed bin widths, seconds, lower bound inclusive.
pub const BIN_WIDTH_RANGE: (f64, f64) = (0.05, 2.0);

pub fn validate_bin_width(width: f64) -> Result<(), SettingError> {
    if width >= BIN_WIDTH_RANGE.0 && width < BIN_WIDTH_RANGE.1 {
        Ok(())
    } else {
        Err(SettingError::MacroBinWidth(width))
    }
}

/// Linear histogram of hit arrival time within a spill, plus a counter of
/// hits arriving between spills.
#[derive(Debug, Clone)]
pub struct MacroHistogram {
    bins: Vec<u32>,
    bin_width: f64,
    clock_hz: f64,
    time_in_spill: f64,
    offspill: u32,
    bos_ts: u32,
    eos_ts: u32,
}

impl MacroHistogram {
    pub fn new(bin_width: f64, clock_hz: f64) -> Result<Self, SettingError> {
        validate_bin_width(bin_width)?;
        if !(clock_hz.is_finite() && clock_hz > 0.0) {
            return Err(SettingError::ClockRate(clock_hz));
        }
        Ok(Self {
            bins: vec![0; MAX_BINS + 1],
            bin_width,
            clock_hz,
            time_in_spill: 0.0,
            offspill: 0,
            bos_ts: 0,
            eos_ts: 0,
        })
    }

    pub fn set_bin_width(&mut self, width: f64) -> Result<(), SettingError> {
        validate_bin_width(width)?;
        self.bin_width = width;
        Ok(())
    }

    /// Begin of spill: empty the bins and restart the time cursor.
    pub fn init(&mut self) {
        self.bins.fill(0);
        self.time_in_spill = 0.0;
    }

    /// End of spill: restart the off-spill count.
    pub fn reset(&mut self) {
        self.offspill = 0;
    }

    pub fn set_bos(&mut self, clock: u32) {
        self.bos_ts = clock;
    }

    pub fn set_eos(&mut self, clock: u32) {
        self.eos_ts = clock;
    }

    /// Advances the time cursor by each delta and counts a hit at each step.
    pub fn fill(&mut self, deltas: &[u32]) {
        for &dt in deltas {
            self.time_in_spill += f64::from(dt) / self.clock_hz;
            let bin = ((self.time_in_spill / self.bin_width) as usize).min(MAX_BINS);
            self.bins[bin] += 1;
        }
    }

    pub fn fill_offspill(&mut self, hits: usize) {
        self.offspill = self.offspill.saturating_add(hits as u32);
    }

    /// Clock ticks from begin to end of spill.
    pub fn spill_ticks(&self) -> Result<i32, SpillError> {
        let ticks = WrapCounter::<32>::calc_diff(self.eos_ts, self.bos_ts);
        if ticks < 0 {
            return Err(SpillError::NegativeDuration {
                bos: self.bos_ts,
                eos: self.eos_ts,
                ticks,
            });
        }
        Ok(ticks)
    }

    /// Bin centres (seconds) and counts from bin 0 up to the bin holding the
    /// end of the spill.
    pub fn xy(&self) -> Result<(Vec<f64>, Vec<u32>), SpillError> {
        let length = f64::from(self.spill_ticks()?) / self.clock_hz;
        let last = ((length / self.bin_width) as usize).min(MAX_BINS - 1);

        let xs = (0..=last)
            .map(|i| (i as f64 + 0.5) * self.bin_width)
            .collect();
        let ys = self.bins[..=last].to_vec();
        Ok((xs, ys))
    }

    /// Hits that landed past the last regular bin.
    pub fn errors(&self) -> u32 {
        self.bins[MAX_BINS]
    }

    pub fn offspill(&self) -> u32 {
        self.offspill
    }

    /// Every hit binned this spill, error bin included.
    pub fn in_spill_hits(&self) -> u64 {
        self.bins.iter().map(|&c| u64::from(c)).sum()
    }

    pub fn time_in_spill(&self) -> f64 {
        self.time_in_spill
    }

    pub fn bin_width(&self) -> f64 {
        self.bin_width
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hist() -> MacroHistogram {
        MacroHistogram::new(DEFAULT_BIN_WIDTH, 1e8).unwrap()
    }

    #[test]
    fn test_bin_width_validated() {
        assert!(MacroHistogram::new(0.05, 1e8).is_ok());
        assert!(MacroHistogram::new(1.99, 1e8).is_ok());
        assert_eq!(
            MacroHistogram::new(2.0, 1e8).unwrap_err(),
            SettingError::MacroBinWidth(2.0)
        );
        assert!(MacroHistogram::new(0.049, 1e8).is_err());
        assert!(MacroHistogram::new(f64::NAN, 1e8).is_err());
    }

    #[test]
    fn test_fill_advances_time() {
        let mut h = hist();
        // 0.05 s, then 0.1 s more, then 0.01 s more.
        h.fill(&[5_000_000, 10_000_000, 1_000_000]);
        assert!((h.time_in_spill() - 0.16).abs() < 1e-9);
        h.set_bos(0);
        h.set_eos(20_000_000);
        let (xs, ys) = h.xy().unwrap();
        assert_eq!(ys, vec![1, 2, 0]);
        assert!((xs[0] - 0.05).abs() < 1e-12);
        assert!((xs[2] - 0.25).abs() < 1e-12);
    }

    #[test]
    fn test_late_hits_go_to_error_bin() {
        let mut h = hist();
        // ~43 s per step: bins 429 and 858, then past the last regular bin.
        h.fill(&[u32::MAX, u32::MAX, u32::MAX]);
        assert!(h.time_in_spill() > 100.0);
        assert_eq!(h.errors(), 1);
        assert_eq!(h.in_spill_hits(), 3);
    }

    #[test]
    fn test_init_and_reset_touch_different_state() {
        let mut h = hist();
        h.fill(&[100]);
        h.fill_offspill(7);

        h.reset();
        assert_eq!(h.offspill(), 0);
        assert_eq!(h.in_spill_hits(), 1);

        h.fill_offspill(3);
        h.init();
        assert_eq!(h.in_spill_hits(), 0);
        assert_eq!(h.time_in_spill(), 0.0);
        assert_eq!(h.offspill(), 3);
    }

    #[test]
    fn test_negative_spill_is_error() {
        let mut h = hist();
        h.set_bos(2_000);
        h.set_eos(1_000);
        assert_eq!(
            h.xy().unwrap_err(),
            SpillError::NegativeDuration {
                bos: 2_000,
                eos: 1_000,
                ticks: -1_000
            }
        );
    }

    #[test]
    fn test_xy_across_clock_wrap() {
        let mut h = hist();
        h.set_bos(u32::MAX - 4_999_999);
        h.set_eos(5_000_000);
        assert_eq!(h.spill_ticks().unwrap(), 10_000_000);
        let (xs, _) = h.xy().unwrap();
        assert_eq!(xs.len(), 2);
    }

    #[test]
    fn test_xy_capped_at_last_regular_bin() {
        // A slow clock makes the spill longer than 1001 bins.
        let mut h = MacroHistogram::new(0.05, 1e6).unwrap();
        h.set_bos(0);
        h.set_eos(2_000_000_000);
        let (xs, ys) = h.xy().unwrap();
        assert_eq!(xs.len(), MAX_BINS);
        assert_eq!(ys.len(), MAX_BINS);
    }
}
