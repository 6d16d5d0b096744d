use log::warn;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;

use super::types::{
    AllocationWeights, CapitalMarketAssumptions, Correlations, GlidePoint, ReturnDistribution,
    ReturnSource, SamplingMode,
};

/// Seed used when the caller does not pin one.
pub const DEFAULT_SEED: u64 = 0x5EED_2024_0C0F_FEE5;

/// Per-scenario stream of standard normals and the annual returns built from them.
pub struct ReturnGenerator {
    rng: ChaCha8Rng,
    mirrored: bool,
}

impl ReturnGenerator {
    pub fn new(seed: u64, mirrored: bool) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
            mirrored,
        }
    }

    /// Generator for the scenario at `scenario_index` in the global run order.
    ///
    /// Under antithetic sampling scenarios `2k` and `2k + 1` share a stream and the odd one
    /// negates every draw.
    pub fn for_scenario(
        base_seed: Option<u64>,
        scenario_index: u64,
        sampling: SamplingMode,
    ) -> Self {
        let base = base_seed.unwrap_or(DEFAULT_SEED);
        let (stream, mirrored) = match sampling {
            SamplingMode::PseudoRandom => (scenario_index, false),
            SamplingMode::Antithetic => (scenario_index / 2, scenario_index % 2 == 1),
        };
        Self::new(derive_seed(base, stream), mirrored)
    }

    pub fn standard_normal(&mut self) -> f64 {
        let z: f64 = self.rng.sample(StandardNormal);
        if self.mirrored { -z } else { z }
    }

    /// Draws `years` nominal annual portfolio returns. Year `k` of the path sits
    /// `years_to_retirement - k` years before retirement.
    pub fn draw_path(
        &mut self,
        source: &ReturnSource,
        distribution: ReturnDistribution,
        years: usize,
        years_to_retirement: i64,
    ) -> Vec<f64> {
        match source {
            ReturnSource::Scalar {
                expected_return,
                volatility,
            } => (0..years)
                .map(|_| {
                    let z = self.standard_normal();
                    shape_return(*expected_return, *volatility, z, distribution)
                })
                .collect(),
            ReturnSource::Allocation {
                weights,
                assumptions,
            } => {
                let factor = correlation_factor(&assumptions.correlations);
                let weights = weights.normalized();
                (0..years)
                    .map(|_| {
                        let classes = self.draw_classes(assumptions, &factor, distribution);
                        blend(weights, classes)
                    })
                    .collect()
            }
            ReturnSource::GlidePath {
                schedule,
                assumptions,
            } => {
                let factor = correlation_factor(&assumptions.correlations);
                (0..years)
                    .map(|year| {
                        let classes = self.draw_classes(assumptions, &factor, distribution);
                        let ytr = years_to_retirement - year as i64;
                        blend(glide_weights(schedule, ytr), classes)
                    })
                    .collect()
            }
        }
    }

    fn draw_classes(
        &mut self,
        cma: &CapitalMarketAssumptions,
        factor: &[[f64; 3]; 3],
        distribution: ReturnDistribution,
    ) -> [f64; 3] {
        let z = [
            self.standard_normal(),
            self.standard_normal(),
            self.standard_normal(),
        ];
        let mut correlated = [0.0; 3];
        for (row, out) in factor.iter().zip(correlated.iter_mut()) {
            *out = row[0] * z[0] + row[1] * z[1] + row[2] * z[2];
        }
        let classes = [cma.equities, cma.bonds, cma.cash];
        std::array::from_fn(|i| {
            shape_return(
                classes[i].expected_return,
                classes[i].volatility,
                correlated[i],
                distribution,
            )
        })
    }
}

/// Turns a standard normal draw into an annual return with the given arithmetic mean and
/// standard deviation.
pub fn shape_return(mean: f64, volatility: f64, z: f64, distribution: ReturnDistribution) -> f64 {
    match distribution {
        ReturnDistribution::Normal => mean + volatility * z,
        ReturnDistribution::LogNormal => {
            let gross_mean = 1.0 + mean;
            if gross_mean <= 0.0 {
                return mean + volatility * z;
            }
            let sigma_sq = (1.0 + (volatility / gross_mean).powi(2)).ln();
            let mu = gross_mean.ln() - sigma_sq / 2.0;
            (mu + sigma_sq.sqrt() * z).exp() - 1.0
        }
    }
}

fn blend(weights: AllocationWeights, classes: [f64; 3]) -> f64 {
    weights
        .as_array()
        .iter()
        .zip(classes)
        .map(|(w, r)| w * r)
        .sum()
}

/// Allocation in effect `years_to_retirement` years out, interpolated between schedule points.
/// The schedule is ordered from furthest out to furthest past retirement.
pub fn glide_weights(schedule: &[GlidePoint], years_to_retirement: i64) -> AllocationWeights {
    let Some(first) = schedule.first() else {
        return AllocationWeights {
            equities: 1.0,
            bonds: 0.0,
            cash: 0.0,
        };
    };
    if years_to_retirement >= first.years_to_retirement as i64 {
        return first.weights.normalized();
    }
    for pair in schedule.windows(2) {
        let (outer, inner) = (&pair[0], &pair[1]);
        let hi = outer.years_to_retirement as i64;
        let lo = inner.years_to_retirement as i64;
        if years_to_retirement <= hi && years_to_retirement >= lo {
            let span = (hi - lo) as f64;
            let w = if span > 0.0 {
                (hi - years_to_retirement) as f64 / span
            } else {
                1.0
            };
            let a = outer.weights.normalized();
            let b = inner.weights.normalized();
            return AllocationWeights {
                equities: a.equities * (1.0 - w) + b.equities * w,
                bonds: a.bonds * (1.0 - w) + b.bonds * w,
                cash: a.cash * (1.0 - w) + b.cash * w,
            };
        }
    }
    schedule
        .last()
        .map(|p| p.weights.normalized())
        .unwrap_or(first.weights)
}

/// Lower-triangular Cholesky factor of the 3x3 correlation matrix, or identity when the
/// matrix is not positive definite.
fn correlation_factor(c: &Correlations) -> [[f64; 3]; 3] {
    match cholesky3(c.equity_bond, c.equity_cash, c.bond_cash) {
        Some(factor) => factor,
        None => {
            warn!(
                "correlation matrix ({}, {}, {}) is not positive definite; drawing independently",
                c.equity_bond, c.equity_cash, c.bond_cash
            );
            [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]]
        }
    }
}

fn cholesky3(c01: f64, c02: f64, c12: f64) -> Option<[[f64; 3]; 3]> {
    let l11_sq = 1.0 - c01 * c01;
    if l11_sq <= 1e-12 {
        return None;
    }
    let l11 = l11_sq.sqrt();
    let l21 = (c12 - c02 * c01) / l11;
    let l22_sq = 1.0 - c02 * c02 - l21 * l21;
    if l22_sq <= 1e-12 {
        return None;
    }
    Some([
        [1.0, 0.0, 0.0],
        [c01, l11, 0.0],
        [c02, l21, l22_sq.sqrt()],
    ])
}

pub fn derive_seed(base_seed: u64, stream: u64) -> u64 {
    splitmix64(base_seed ^ splitmix64(stream))
}

fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E3779B97F4A7C15);
    let mut z = x;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
    z ^ (z >> 31)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::stats::mean;
    use proptest::prelude::{any, prop_assert, prop_assert_eq, proptest};

    fn allocation_source(correlation: f64) -> ReturnSource {
        let mut assumptions = CapitalMarketAssumptions::default();
        assumptions.correlations.equity_bond = correlation;
        ReturnSource::Allocation {
            weights: AllocationWeights {
                equities: 0.6,
                bonds: 0.4,
                cash: 0.0,
            },
            assumptions,
        }
    }

    #[test]
    fn scalar_path_matches_requested_moments() {
        let source = ReturnSource::Scalar {
            expected_return: 0.07,
            volatility: 0.15,
        };
        let mut generator = ReturnGenerator::new(11, false);
        let path = generator.draw_path(&source, ReturnDistribution::Normal, 20_000, 0);
        let m = mean(&path);
        let sd = (path.iter().map(|r| (r - m).powi(2)).sum::<f64>() / path.len() as f64).sqrt();
        assert!((m - 0.07).abs() < 0.005, "mean {m}");
        assert!((sd - 0.15).abs() < 0.005, "sd {sd}");
    }

    #[test]
    fn lognormal_path_keeps_arithmetic_mean_and_stays_above_minus_one() {
        let source = ReturnSource::Scalar {
            expected_return: 0.07,
            volatility: 0.25,
        };
        let mut generator = ReturnGenerator::new(5, false);
        let path = generator.draw_path(&source, ReturnDistribution::LogNormal, 20_000, 0);
        assert!(path.iter().all(|r| *r > -1.0));
        assert!((mean(&path) - 0.07).abs() < 0.01);
    }

    #[test]
    fn antithetic_pair_mirrors_draws() {
        let mut even = ReturnGenerator::for_scenario(Some(99), 4, SamplingMode::Antithetic);
        let mut odd = ReturnGenerator::for_scenario(Some(99), 5, SamplingMode::Antithetic);
        for _ in 0..16 {
            assert_eq!(even.standard_normal(), -odd.standard_normal());
        }
    }

    #[test]
    fn zero_volatility_returns_the_mean_exactly() {
        let source = ReturnSource::Scalar {
            expected_return: 0.05,
            volatility: 0.0,
        };
        let mut generator = ReturnGenerator::new(1, false);
        let path = generator.draw_path(&source, ReturnDistribution::Normal, 10, 3);
        assert!(path.iter().all(|r| *r == 0.05));
    }

    #[test]
    fn singular_correlations_fall_back_to_independent_draws() {
        assert!(cholesky3(1.0, 0.0, 0.0).is_none());
        let source = allocation_source(1.0);
        let mut generator = ReturnGenerator::new(3, false);
        let path = generator.draw_path(&source, ReturnDistribution::Normal, 8, 0);
        assert_eq!(path.len(), 8);
        assert!(path.iter().all(|r| r.is_finite()));
    }

    #[test]
    fn glide_weights_interpolate_between_points() {
        let schedule = vec![
            GlidePoint {
                years_to_retirement: 20,
                weights: AllocationWeights {
                    equities: 0.9,
                    bonds: 0.1,
                    cash: 0.0,
                },
            },
            GlidePoint {
                years_to_retirement: 0,
                weights: AllocationWeights {
                    equities: 0.5,
                    bonds: 0.5,
                    cash: 0.0,
                },
            },
        ];
        assert!((glide_weights(&schedule, 30).equities - 0.9).abs() < 1e-12);
        assert!((glide_weights(&schedule, 10).equities - 0.7).abs() < 1e-12);
        assert!((glide_weights(&schedule, -5).equities - 0.5).abs() < 1e-12);
    }

    proptest! {
        #![proptest_config(proptest::test_runner::Config::with_cases(32))]

        #[test]
        fn prop_same_seed_reproduces_path(
            seed in any::<u64>(),
            index in 0u64..10_000,
            years in 1usize..60
        ) {
            let source = allocation_source(0.3);
            let sampling = SamplingMode::PseudoRandom;
            let mut a = ReturnGenerator::for_scenario(Some(seed), index, sampling);
            let mut b = ReturnGenerator::for_scenario(Some(seed), index, sampling);
            let left = a.draw_path(&source, ReturnDistribution::Normal, years, 10);
            let right = b.draw_path(&source, ReturnDistribution::Normal, years, 10);
            prop_assert_eq!(left, right);
        }

        #[test]
        fn prop_path_prefix_does_not_depend_on_length(
            seed in any::<u64>(),
            short in 1usize..30,
            extra in 1usize..30
        ) {
            let source = ReturnSource::default();
            let mut a = ReturnGenerator::new(seed, false);
            let mut b = ReturnGenerator::new(seed, false);
            let short_path = a.draw_path(&source, ReturnDistribution::Normal, short, 0);
            let long_path = b.draw_path(&source, ReturnDistribution::Normal, short + extra, 0);
            prop_assert!(short_path[..] == long_path[..short]);
        }
    }
}
