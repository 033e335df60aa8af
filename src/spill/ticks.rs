//! Axis ticks for log-scale plots.
//!
//! Both axes of the micro-spill plot are decades: the x axis holds
//! `log10(seconds)`, the y axis `log10(count)` shifted by the display offset.
//! Labels are mathtext strings ready for the plotting client.

use serde::Serialize;

use super::microspill::DISPLAY_OFFSET;

/// Headroom above the tallest bar before the last y major tick.
const Y_HEADROOM: f64 = 1.08;

/// Major ticks, their labels and the minor ticks in between.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Ticks {
    pub major: Vec<f64>,
    pub major_labels: Vec<String>,
    pub minor: Vec<f64>,
}

/// Ticks for an ascending series of `log10(seconds)` positions.
pub fn time_ticks(xs: &[f64]) -> Ticks {
    let (Some(&first), Some(&last)) = (xs.first(), xs.last()) else {
        return Ticks::default();
    };

    let lo = first.floor() as i32;
    let hi = (last.ceil() as i32).max(lo);

    let major: Vec<f64> = (lo..=hi).map(f64::from).collect();
    let major_labels = (lo..=hi).map(|d| time_label(d).to_string()).collect();
    let minor = minors_between(&major);

    Ticks {
        major,
        major_labels,
        minor,
    }
}

/// Ticks for bar heights in offset `log10(count)` units.
pub fn count_ticks(ys: &[f64]) -> Ticks {
    let max = ys.iter().copied().filter(|y| !y.is_nan()).fold(0.0, f64::max);
    let top = (max * Y_HEADROOM).floor().max(0.0) as i32;

    let major: Vec<f64> = (0..=top).map(|k| f64::from(k) + DISPLAY_OFFSET).collect();
    let major_labels = (0..=top).map(count_label).collect();

    let mut minor = minors_between(&major);
    if let Some(&last) = major.last() {
        minor.extend(
            decade_steps()
                .map(|step| last + step)
                .take_while(|&tick| tick < max),
        );
    }

    Ticks {
        major,
        major_labels,
        minor,
    }
}

/// Label for a decade of seconds.
pub fn time_label(decade: i32) -> &'static str {
    match decade {
        0 => "1 s",
        -1 => "100 ms",
        -2 => "10 ms",
        -3 => "1 ms",
        -4 => r"100 $\mathrm{\mu}$s",
        -5 => r"10 $\mathrm{\mu}$s",
        -6 => r"1 $\mathrm{\mu}$s",
        -7 => "100 ns",
        -8 => "10 ns",
        -9 => "1 ns",
        _ => "NaN",
    }
}

fn count_label(decade: i32) -> String {
    match decade {
        0 => "$1$".to_string(),
        1 => "$10$".to_string(),
        k => format!("$10^{{{k}}}$"),
    }
}

/// `log10(2..=9)`.
fn decade_steps() -> impl Iterator<Item = f64> {
    (2..10).map(|j| f64::from(j).log10())
}

/// Minor ticks inside every decade but the last.
fn minors_between(major: &[f64]) -> Vec<f64> {
    let decades = major.len().saturating_sub(1);
    major[..decades]
        .iter()
        .flat_map(|&m| decade_steps().map(move |step| m + step))
        .collect()
}
