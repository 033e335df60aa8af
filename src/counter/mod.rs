//! Fixed-width rolling counters.
//!
//! Hardware scalers and clocks are sampled as N-bit values that silently roll
//! over. [`WrapCounter`] keeps the last two samples of such a counter and
//! turns them into wrap-corrected increments and signed differences.

use std::fmt;

/// `previous` value of a counter that has never been assigned.
const INIT_PREVIOUS: u32 = u32::MAX;

/// `current` value of a counter that has never been assigned.
const INIT_CURRENT: u32 = 0xeeee_eeee;

/// N-bit rolling counter (N in `1..=32`).
///
/// Both stored samples are masked to N bits, except in the sentinel state
/// reported by [`WrapCounter::is_in_init`].
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct WrapCounter<const N: u32> {
    previous: u32,
    current: u32,
}

impl<const N: u32> WrapCounter<N> {
    /// `2^N`.
    const MODULUS: i64 = 1i64 << N;

    /// Largest representable value, `2^N - 1`.
    pub const MASK: u32 = (Self::MODULUS - 1) as u32;

    /// A backwards step shorter than this is treated as the counter going
    /// backwards rather than rolling over.
    const WRAP_POINT: u32 = 1u32 << (N - 2);

    /// Half the modulus; signed differences live in `[-HALF, HALF)`.
    const HALF: i64 = 1i64 << (N - 1);

    /// Creates a counter in the uninitialized sentinel state.
    pub const fn new() -> Self {
        Self {
            previous: INIT_PREVIOUS,
            current: INIT_CURRENT,
        }
    }

    /// Shifts the current sample into `previous` and stores the masked raw value.
    pub fn assign(&mut self, raw: u32) {
        self.previous = self.current;
        self.current = raw & Self::MASK;
    }

    /// Increment from the previous sample to the current one.
    ///
    /// A step backwards shorter than a quarter of the modulus is not a
    /// rollover; it is reported and answered with [`Self::MASK`].
    pub fn calc_increment(&self) -> u32 {
        if self.current >= self.previous {
            return self.current - self.previous;
        }

        let backwards = self.previous - self.current;
        if backwards < Self::WRAP_POINT {
            tracing::warn!(
                bits = N,
                previous = self.previous,
                current = self.current,
                "counter went backwards",
            );
            return Self::MASK;
        }

        (Self::MODULUS + i64::from(self.current) - i64::from(self.previous)) as u32
    }

    /// True when the last assign stepped backwards instead of rolling over,
    /// i.e. when [`Self::calc_increment`] answers with the sentinel.
    pub fn went_backwards(&self) -> bool {
        self.current < self.previous && self.previous - self.current < Self::WRAP_POINT
    }

    /// Signed difference `x - y` of two N-bit samples, corrected by one
    /// modulus when it reaches half the modulus in either direction.
    pub fn calc_diff(x: u32, y: u32) -> i32 {
        let mut diff = i64::from(x & Self::MASK) - i64::from(y & Self::MASK);
        if diff >= Self::HALF {
            diff -= Self::MODULUS;
        } else if diff < -Self::HALF {
            diff += Self::MODULUS;
        }
        diff as i32
    }

    /// True only while the counter holds the never-assigned sentinel.
    ///
    /// At `N = 32` the sentinel pair is also a reachable sample pair
    /// (`u32::MAX` then `0xeeeeeeee`); such a step is read as a fresh
    /// counter and its increment suppressed. The collision is accepted.
    pub fn is_in_init(&self) -> bool {
        self.previous == INIT_PREVIOUS && self.current == INIT_CURRENT
    }

    /// Assigns `raw` and returns the increment, except for the first sample
    /// after construction or [`Self::reseed`].
    pub fn advance(&mut self, raw: u32) -> Option<u32> {
        let fresh = self.is_in_init();
        self.assign(raw);
        if fresh {
            None
        } else {
            Some(self.calc_increment())
        }
    }

    /// Returns the counter to the sentinel state.
    pub fn reseed(&mut self) {
        *self = Self::new();
    }

    pub fn current(&self) -> u32 {
        self.current
    }

    pub fn previous(&self) -> u32 {
        self.previous
    }
}

impl<const N: u32> Default for WrapCounter<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: u32> fmt::Debug for WrapCounter<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_in_init() {
            return write!(f, "WrapCounter<{N}>(init)");
        }
        f.debug_struct("WrapCounter")
            .field("bits", &N)
            .field("previous", &self.previous)
            .field("current", &self.current)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Scaler32 = WrapCounter<32>;
    type Stamp31 = WrapCounter<31>;

    #[test]
    fn test_new_is_in_init() {
        let c = Scaler32::new();
        assert!(c.is_in_init());
        assert_eq!(c.previous(), 0xffff_ffff);
        assert_eq!(c.current(), 0xeeee_eeee);
    }

    #[test]
    fn test_first_assign_leaves_init_and_suppresses_increment() {
        let mut c = Stamp31::new();
        assert_eq!(c.advance(1234), None);
        assert!(!c.is_in_init());
        assert_eq!(c.advance(1334), Some(100));
    }

    #[test]
    fn test_assign_masks_to_width() {
        let mut c = Stamp31::new();
        c.assign(0xffff_fff0);
        assert_eq!(c.current(), 0x7fff_fff0);
    }

    #[test]
    fn test_plain_increment() {
        let mut c = Scaler32::new();
        c.assign(10);
        c.assign(25);
        assert_eq!(c.calc_increment(), 15);
    }

    #[test]
    fn test_wrap_31_bit_resolves_small_positive() {
        let mut c = Stamp31::new();
        c.assign(0xffff_fff0);
        c.assign(5);
        assert_eq!(c.calc_increment(), 21);
        assert_eq!(Stamp31::calc_diff(5, 0xffff_fff0), 21);
    }

    #[test]
    fn test_wrap_32_bit() {
        let mut c = Scaler32::new();
        c.assign(u32::MAX - 9);
        c.assign(20);
        assert_eq!(c.calc_increment(), 30);
    }

    #[test]
    fn test_backwards_counting_returns_sentinel() {
        let mut c = Scaler32::new();
        c.assign(1_000);
        c.assign(900);
        assert_eq!(c.calc_increment(), Scaler32::MASK);
        assert!(c.went_backwards());

        let mut c = Stamp31::new();
        c.assign(1_000);
        c.assign(900);
        assert_eq!(c.calc_increment(), Stamp31::MASK);
    }

    #[test]
    fn test_diff_matches_increment_for_forward_wraps() {
        for prev in [0u32, 17, 0x7fff_0000, 0xffff_ff00, 0xffff_ffff] {
            for step in [0u32, 1, 255, 1 << 20, (1 << 31) - 1] {
                let curr = prev.wrapping_add(step);
                let mut c = Scaler32::new();
                c.assign(prev);
                c.assign(curr);
                assert_eq!(
                    i64::from(Scaler32::calc_diff(curr, prev)),
                    i64::from(c.calc_increment()),
                    "prev={prev:#x} step={step:#x}",
                );
            }
        }
    }

    #[test]
    fn test_diff_antisymmetric() {
        let samples = [0u32, 1, 500, 0x3fff_ffff, 0x4000_0001, 0x7fff_fffe, 0x7fff_ffff];
        for &a in &samples {
            for &b in &samples {
                if (i64::from(a) - i64::from(b)).abs() == 1 << 30 {
                    continue;
                }
                assert_eq!(
                    Stamp31::calc_diff(a, b),
                    -Stamp31::calc_diff(b, a),
                    "a={a:#x} b={b:#x}",
                );
            }
        }
    }

    #[test]
    fn test_diff_tie_resolves_negative() {
        let half = 1u32 << 30;
        assert_eq!(Stamp31::calc_diff(half, 0), -(1 << 30));
        assert_eq!(Stamp31::calc_diff(0, half), -(1 << 30));
        assert_eq!(Scaler32::calc_diff(1 << 31, 0), i32::MIN);
    }

    #[test]
    fn test_reseed_returns_to_init() {
        let mut c = Stamp31::new();
        c.assign(1);
        c.assign(2);
        c.reseed();
        assert!(c.is_in_init());
        assert_eq!(c.advance(9), None);
    }

    #[test]
    fn test_sentinel_pair_collides_only_at_full_width() {
        let mut c = Scaler32::new();
        c.assign(u32::MAX);
        c.assign(0xeeee_eeee);
        assert!(c.is_in_init());
        assert_eq!(c.advance(0xeeee_ef00), None);

        let mut c = Stamp31::new();
        c.assign(u32::MAX);
        c.assign(0xeeee_eeee);
        assert!(!c.is_in_init());
    }
}
