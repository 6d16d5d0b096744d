/// Linear-interpolated percentile of an already ascending slice; `p` is in `[0, 100]`.
pub fn percentile_sorted(values: &[f64], p: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }

    let n = values.len();
    if n == 1 {
        return values[0];
    }

    let rank = (p.clamp(0.0, 100.0) / 100.0) * (n as f64 - 1.0);
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;

    if lower == upper {
        values[lower]
    } else {
        let w = rank - lower as f64;
        values[lower] * (1.0 - w) + values[upper] * w
    }
}

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Rebuilds `count` evenly spread samples from quantile markers taken at `levels`.
///
/// Samples below the first level or above the last are pinned to the outer markers. The
/// output is ascending whenever `markers` is.
pub fn reconstruct_from_markers(levels: &[f64], markers: &[f64], count: usize) -> Vec<f64> {
    if count == 0 || markers.is_empty() || levels.len() != markers.len() {
        return Vec::new();
    }

    (0..count)
        .map(|i| {
            let p = (i as f64 + 0.5) / count as f64 * 100.0;
            interpolate_marker(levels, markers, p)
        })
        .collect()
}

fn interpolate_marker(levels: &[f64], markers: &[f64], p: f64) -> f64 {
    let last = levels.len() - 1;
    if p <= levels[0] {
        return markers[0];
    }
    if p >= levels[last] {
        return markers[last];
    }
    for i in 0..last {
        let (lo, hi) = (levels[i], levels[i + 1]);
        if p <= hi {
            let w = if hi > lo { (p - lo) / (hi - lo) } else { 0.0 };
            return markers[i] * (1.0 - w) + markers[i + 1] * w;
        }
    }
    markers[last]
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::{prop_assert, proptest};

    const EPS: f64 = 1e-9;

    fn assert_approx(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() <= EPS,
            "expected {expected}, got {actual}"
        );
    }

    #[test]
    fn percentile_interpolates_between_ranks() {
        let values = [10.0, 20.0, 30.0, 40.0];
        assert_approx(percentile_sorted(&values, 0.0), 10.0);
        assert_approx(percentile_sorted(&values, 50.0), 25.0);
        assert_approx(percentile_sorted(&values, 100.0), 40.0);
    }

    #[test]
    fn percentile_of_empty_slice_is_zero() {
        assert_approx(percentile_sorted(&[], 50.0), 0.0);
    }

    #[test]
    fn reconstruction_pins_tails_to_outer_markers() {
        let levels = [5.0, 25.0, 50.0, 75.0, 95.0];
        let markers = [1.0, 2.0, 3.0, 4.0, 5.0];
        let rebuilt = reconstruct_from_markers(&levels, &markers, 100);
        assert_eq!(rebuilt.len(), 100);
        assert_approx(rebuilt[0], 1.0);
        assert_approx(rebuilt[99], 5.0);
        assert_approx(percentile_sorted(&rebuilt, 50.0), 3.0);
    }

    proptest! {
        #![proptest_config(proptest::test_runner::Config::with_cases(48))]

        #[test]
        fn prop_percentiles_are_monotone_in_p(
            values in proptest::collection::vec(-1.0e6f64..1.0e6, 1..64),
            p_lo in 0.0f64..100.0,
            p_gap in 0.0f64..100.0
        ) {
            let mut sorted = values;
            sorted.sort_by(|a, b| a.total_cmp(b));
            let p_hi = (p_lo + p_gap).min(100.0);
            let lo = percentile_sorted(&sorted, p_lo);
            prop_assert!(lo <= percentile_sorted(&sorted, p_hi) + EPS);
        }
    }
}
