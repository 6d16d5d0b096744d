use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

use log::{debug, info, warn};
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use serde::{Deserialize, Serialize};

use super::engine::simulate_scenario;
use super::error::EngineError;
use super::returns::ReturnGenerator;
use super::stats::{mean, percentile_sorted, reconstruct_from_markers};
use super::types::{
    AggregateResult, BandYear, DollarMode, EndingBalanceSummary, MODEL_VERSION, PercentileBands,
    ScenarioOutcome, SimulationParams,
};
use super::validation::sanitize;

pub const DEFAULT_MAX_WORKERS: usize = 8;
pub const MIN_WORKERS: usize = 2;
/// Bands stop at this age.
pub const DEFAULT_MAX_BAND_AGE: u32 = 93;

const BAND_LEVELS: [f64; 5] = [5.0, 25.0, 50.0, 75.0, 95.0];
const ENDING_LEVELS: [f64; 3] = [10.0, 50.0, 90.0];

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MergeStrategy {
    /// Workers ship every per-year value; percentiles are exact.
    #[default]
    Exact,
    /// Workers ship quantile markers only; the merge approximates.
    MarkerApproximation,
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PoolConfig {
    pub max_workers: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_workers: DEFAULT_MAX_WORKERS,
        }
    }
}

impl PoolConfig {
    pub fn worker_count(&self) -> usize {
        let hardware = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(MIN_WORKERS);
        hardware.min(self.max_workers.max(1)).max(MIN_WORKERS)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunConfig {
    pub runs: u32,
    /// Whether ending below the legacy goal counts as failure.
    pub include_legacy_goal_in_success: bool,
    #[serde(default)]
    pub collect_bands: bool,
    #[serde(default)]
    pub merge: MergeStrategy,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default = "default_max_band_age")]
    pub max_band_age: u32,
}

fn default_max_band_age() -> u32 {
    DEFAULT_MAX_BAND_AGE
}

impl RunConfig {
    pub fn new(runs: u32, include_legacy_goal_in_success: bool) -> Self {
        Self {
            runs,
            include_legacy_goal_in_success,
            collect_bands: false,
            merge: MergeStrategy::Exact,
            pool: PoolConfig::default(),
            max_band_age: DEFAULT_MAX_BAND_AGE,
        }
    }

    pub fn with_bands(mut self, merge: MergeStrategy) -> Self {
        self.collect_bands = true;
        self.merge = merge;
        self
    }
}

/// Contiguous slice of the global scenario order handled by one worker.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ChunkSpec {
    pub index: usize,
    pub offset: u64,
    pub runs: usize,
}

/// Splits `total` runs into at most `chunks` pieces; earlier chunks absorb the remainder.
pub fn partition_runs(total: usize, chunks: usize) -> Vec<ChunkSpec> {
    let chunks = chunks.max(1).min(total.max(1));
    let base = total / chunks;
    let remainder = total % chunks;
    let mut offset = 0u64;
    let mut specs = Vec::with_capacity(chunks);
    for index in 0..chunks {
        let runs = base + usize::from(index < remainder);
        specs.push(ChunkSpec {
            index,
            offset,
            runs,
        });
        offset += runs as u64;
    }
    specs
}

pub fn build_pool(workers: usize) -> Result<ThreadPool, EngineError> {
    let pool = ThreadPoolBuilder::new()
        .num_threads(workers)
        .thread_name(|i| format!("nestegg-worker-{i}"))
        .build()?;
    Ok(pool)
}

/// Runs `task` for every chunk on `pool`. A panicking task becomes
/// [`EngineError::WorkerFailed`] for its chunk.
pub fn dispatch<T, F>(
    pool: &ThreadPool,
    chunks: &[ChunkSpec],
    task: F,
) -> Result<Vec<T>, EngineError>
where
    T: Send,
    F: Fn(&ChunkSpec) -> T + Sync,
{
    pool.install(|| {
        chunks
            .par_iter()
            .map(|chunk| {
                panic::catch_unwind(AssertUnwindSafe(|| task(chunk))).map_err(|payload| {
                    EngineError::WorkerFailed {
                        chunk: chunk.index,
                        reason: panic_message(payload.as_ref()),
                    }
                })
            })
            .collect()
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "worker panicked".to_string()
    }
}

/// Per-year or ending-balance values as shipped from a worker.
#[derive(Clone, Debug, PartialEq)]
pub enum Sample {
    Raw(Vec<f64>),
    Markers {
        quantiles: Vec<f64>,
        mean: f64,
        count: usize,
    },
}

impl Sample {
    fn summarize(mut values: Vec<f64>, levels: &[f64]) -> Self {
        values.sort_by(|a, b| a.total_cmp(b));
        Sample::Markers {
            quantiles: levels.iter().map(|p| percentile_sorted(&values, *p)).collect(),
            mean: mean(&values),
            count: values.len(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct PartialAggregate {
    pub chunk: usize,
    pub successes: u64,
    pub runs: u64,
    pub ending: Sample,
    /// One entry per year index, up to the band age cap.
    pub years: Vec<Sample>,
}

struct ChunkAccumulator {
    successes: u64,
    runs: u64,
    endings: Vec<f64>,
    years: Vec<Vec<f64>>,
    max_band_age: Option<u32>,
}

impl ChunkAccumulator {
    fn new(expected_runs: usize, max_band_age: Option<u32>) -> Self {
        Self {
            successes: 0,
            runs: 0,
            endings: Vec::with_capacity(expected_runs),
            years: Vec::new(),
            max_band_age,
        }
    }

    fn fold(&mut self, outcome: ScenarioOutcome) {
        self.runs += 1;
        if outcome.success {
            self.successes += 1;
        }
        self.endings.push(outcome.ending_balance);
        let Some(max_age) = self.max_band_age else {
            return;
        };
        for year in outcome.years.iter().take_while(|y| y.age <= max_age) {
            let index = year.year_index as usize;
            if self.years.len() <= index {
                self.years.resize_with(index + 1, Vec::new);
            }
            self.years[index].push(year.end_balance);
        }
    }

    fn finish(self, chunk: usize, merge: MergeStrategy) -> PartialAggregate {
        let (ending, years) = match merge {
            MergeStrategy::Exact => (
                Sample::Raw(self.endings),
                self.years.into_iter().map(Sample::Raw).collect(),
            ),
            MergeStrategy::MarkerApproximation => (
                Sample::summarize(self.endings, &ENDING_LEVELS),
                self.years
                    .into_iter()
                    .map(|values| Sample::summarize(values, &BAND_LEVELS))
                    .collect(),
            ),
        };
        PartialAggregate {
            chunk,
            successes: self.successes,
            runs: self.runs,
            ending,
            years,
        }
    }
}

fn run_chunk(params: &SimulationParams, chunk: &ChunkSpec, config: &RunConfig) -> PartialAggregate {
    let band_age = config.collect_bands.then_some(config.max_band_age);
    let mut acc = ChunkAccumulator::new(chunk.runs, band_age);
    for i in 0..chunk.runs {
        let scenario_index = chunk.offset + i as u64;
        let mut rng = ReturnGenerator::for_scenario(params.seed, scenario_index, params.sampling);
        acc.fold(simulate_scenario(
            params,
            &mut rng,
            config.include_legacy_goal_in_success,
        ));
    }
    debug!("chunk {} finished {} runs", chunk.index, chunk.runs);
    acc.finish(chunk.index, config.merge)
}

/// Runs the Monte Carlo and merges worker results into one aggregate.
///
/// Scenario seeds depend on the global scenario index only, so the result does not change with
/// the worker count. A fresh pool is built per call and dropped when the call returns.
pub fn run_simulation(
    params: &SimulationParams,
    config: &RunConfig,
) -> Result<AggregateResult, EngineError> {
    let sanitized = sanitize(params);
    let params = sanitized.params;

    let runs = if config.runs == 0 {
        warn!("run count 0 requested; running a single scenario");
        1
    } else {
        config.runs as usize
    };
    let workers = config.pool.worker_count();
    let chunks = partition_runs(runs, workers);
    let pool = build_pool(workers)?;
    info!(
        "running {runs} scenarios on {workers} workers in {} chunks",
        chunks.len()
    );

    let partials = dispatch(&pool, &chunks, |chunk| run_chunk(&params, chunk, config))?;

    Ok(merge_partials(
        partials,
        config,
        params.current_age,
        params.dollar_mode,
    ))
}

pub fn merge_partials(
    mut partials: Vec<PartialAggregate>,
    config: &RunConfig,
    current_age: u32,
    dollar_mode: DollarMode,
) -> AggregateResult {
    partials.sort_by_key(|p| p.chunk);
    let runs: u64 = partials.iter().map(|p| p.runs).sum();
    let successes: u64 = partials.iter().map(|p| p.successes).sum();
    let success_probability = if runs > 0 {
        successes as f64 / runs as f64
    } else {
        0.0
    };

    let ending_balance = merge_ending(partials.iter().map(|p| &p.ending));
    let bands = config.collect_bands.then(|| {
        let year_count = partials.iter().map(|p| p.years.len()).max().unwrap_or(0);
        let years = (0..year_count)
            .filter_map(|index| {
                let samples = partials.iter().filter_map(|p| p.years.get(index));
                merge_band_year(samples, index, current_age)
            })
            .collect();
        PercentileBands { years }
    });

    AggregateResult {
        runs,
        success_probability,
        ending_balance,
        bands,
        dollar_mode,
        model_version: MODEL_VERSION.to_string(),
    }
}

fn merge_ending<'a>(samples: impl Iterator<Item = &'a Sample>) -> EndingBalanceSummary {
    let mut raw = Vec::new();
    let mut weighted = [0.0; 3];
    let mut weighted_mean = 0.0;
    let mut marker_count = 0usize;
    for sample in samples {
        match sample {
            Sample::Raw(values) => raw.extend_from_slice(values),
            Sample::Markers {
                quantiles,
                mean,
                count,
            } => {
                for (slot, q) in weighted.iter_mut().zip(quantiles) {
                    *slot += q * *count as f64;
                }
                weighted_mean += mean * *count as f64;
                marker_count += count;
            }
        }
    }

    if marker_count == 0 {
        raw.sort_by(|a, b| a.total_cmp(b));
        return EndingBalanceSummary {
            p10: percentile_sorted(&raw, ENDING_LEVELS[0]),
            p50: percentile_sorted(&raw, ENDING_LEVELS[1]),
            p90: percentile_sorted(&raw, ENDING_LEVELS[2]),
            mean: mean(&raw),
        };
    }

    if !raw.is_empty()
        && let Sample::Markers {
            quantiles,
            mean,
            count,
        } = Sample::summarize(raw, &ENDING_LEVELS)
    {
        for (slot, q) in weighted.iter_mut().zip(&quantiles) {
            *slot += q * count as f64;
        }
        weighted_mean += mean * count as f64;
        marker_count += count;
    }
    let n = marker_count as f64;
    EndingBalanceSummary {
        p10: weighted[0] / n,
        p50: weighted[1] / n,
        p90: weighted[2] / n,
        mean: weighted_mean / n,
    }
}

fn merge_band_year<'a>(
    samples: impl Iterator<Item = &'a Sample>,
    index: usize,
    current_age: u32,
) -> Option<BandYear> {
    let mut pooled = Vec::new();
    for sample in samples {
        match sample {
            Sample::Raw(values) => pooled.extend_from_slice(values),
            Sample::Markers {
                quantiles, count, ..
            } => pooled.extend(reconstruct_from_markers(&BAND_LEVELS, quantiles, *count)),
        }
    }
    if pooled.is_empty() {
        return None;
    }
    pooled.sort_by(|a, b| a.total_cmp(b));
    let [p05, p25, p50, p75, p95] = BAND_LEVELS.map(|p| percentile_sorted(&pooled, p));
    Some(BandYear {
        year_index: index as u32,
        age: current_age + index as u32,
        p05,
        p25,
        p50,
        p75,
        p95,
        scenarios: pooled.len() as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{AssetBuckets, WithdrawalPolicy};
    use proptest::prelude::{prop_assert, prop_assert_eq, proptest};

    fn assert_bands_ordered(result: &AggregateResult) {
        let bands = result.bands.as_ref().expect("bands requested");
        assert!(!bands.years.is_empty());
        for year in &bands.years {
            assert!(year.p05 <= year.p25, "{year:?}");
            assert!(year.p25 <= year.p50, "{year:?}");
            assert!(year.p50 <= year.p75, "{year:?}");
            assert!(year.p75 <= year.p95, "{year:?}");
            assert!(year.age <= DEFAULT_MAX_BAND_AGE);
        }
    }

    fn baseline() -> SimulationParams {
        SimulationParams {
            seed: Some(2024),
            ..SimulationParams::default()
        }
    }

    #[test]
    fn baseline_success_is_a_probability() {
        let result = run_simulation(&baseline(), &RunConfig::new(400, false)).expect("run");
        assert_eq!(result.runs, 400);
        assert!((0.0..=1.0).contains(&result.success_probability));
        assert!(result.ending_balance.p10 <= result.ending_balance.p50);
        assert!(result.ending_balance.p50 <= result.ending_balance.p90);
        assert_eq!(result.model_version, MODEL_VERSION);
        assert!(result.bands.is_none());
    }

    #[test]
    fn exact_bands_are_ordered_and_capped() {
        let config = RunConfig::new(300, false).with_bands(MergeStrategy::Exact);
        let result = run_simulation(&baseline(), &config).expect("run");
        assert_bands_ordered(&result);
        let bands = result.bands.expect("bands");
        assert_eq!(bands.years.last().map(|y| y.age), Some(90));
        assert!(bands.years.iter().all(|y| y.scenarios == 300));
    }

    #[test]
    fn marker_bands_are_ordered_and_close_to_exact() {
        let exact = run_simulation(
            &baseline(),
            &RunConfig::new(2_000, false).with_bands(MergeStrategy::Exact),
        )
        .expect("exact run");
        let approx = run_simulation(
            &baseline(),
            &RunConfig::new(2_000, false).with_bands(MergeStrategy::MarkerApproximation),
        )
        .expect("approx run");
        assert_bands_ordered(&approx);
        assert_eq!(exact.success_probability, approx.success_probability);
        let exact_mid = &exact.bands.as_ref().expect("bands").years[20];
        let approx_mid = &approx.bands.as_ref().expect("bands").years[20];
        let tolerance = 0.15 * exact_mid.p50.abs().max(1.0);
        assert!((exact_mid.p50 - approx_mid.p50).abs() <= tolerance);
    }

    #[test]
    fn bands_stop_at_the_age_cap() {
        let mut params = baseline();
        params.life_expectancy = 100;
        let config = RunConfig::new(50, false).with_bands(MergeStrategy::Exact);
        let result = run_simulation(&params, &config).expect("run");
        let bands = result.bands.expect("bands");
        assert_eq!(bands.years.last().map(|y| y.age), Some(DEFAULT_MAX_BAND_AGE));
    }

    #[test]
    fn result_does_not_depend_on_worker_count() {
        let params = baseline();
        let mut two = RunConfig::new(257, false);
        two.pool.max_workers = 2;
        let mut eight = RunConfig::new(257, false);
        eight.pool.max_workers = 8;
        let a = run_simulation(&params, &two).expect("run");
        let b = run_simulation(&params, &eight).expect("run");
        assert_eq!(a, b);
    }

    #[test]
    fn zero_runs_are_clamped_to_one() {
        let result = run_simulation(&baseline(), &RunConfig::new(0, false)).expect("run");
        assert_eq!(result.runs, 1);
    }

    #[test]
    fn panicking_worker_surfaces_as_error() {
        let pool = build_pool(2).expect("pool");
        let chunks = partition_runs(10, 4);
        let result = dispatch(&pool, &chunks, |chunk| {
            if chunk.index == 2 {
                panic!("simulated worker crash");
            }
            chunk.runs
        });
        match result {
            Err(EngineError::WorkerFailed { chunk, reason }) => {
                assert_eq!(chunk, 2);
                assert!(reason.contains("simulated worker crash"));
            }
            other => panic!("expected worker failure, got {other:?}"),
        }
    }

    #[test]
    fn higher_spending_never_raises_success() {
        let mut frugal = baseline();
        frugal.withdrawal_policy = WithdrawalPolicy::SpendingTarget;
        let mut lavish = frugal.clone();
        lavish.annual_spending += 20_000.0;
        let config = RunConfig::new(300, false);
        let a = run_simulation(&frugal, &config).expect("run");
        let b = run_simulation(&lavish, &config).expect("run");
        assert!(b.success_probability <= a.success_probability);
    }

    #[test]
    fn more_assets_never_lower_success() {
        let mut poorer = baseline();
        poorer.withdrawal_policy = WithdrawalPolicy::SpendingTarget;
        let mut richer = poorer.clone();
        richer.buckets = AssetBuckets {
            cash: poorer.buckets.cash + 250_000.0,
            ..poorer.buckets.clone()
        };
        let config = RunConfig::new(300, false);
        let a = run_simulation(&poorer, &config).expect("run");
        let b = run_simulation(&richer, &config).expect("run");
        assert!(b.success_probability >= a.success_probability);
    }

    proptest! {
        #![proptest_config(proptest::test_runner::Config::with_cases(64))]

        #[test]
        fn prop_partition_covers_every_run_once(total in 0usize..10_000, chunks in 1usize..32) {
            let specs = partition_runs(total, chunks);
            prop_assert_eq!(specs.iter().map(|c| c.runs).sum::<usize>(), total);
            let mut expected_offset = 0u64;
            for spec in &specs {
                prop_assert_eq!(spec.offset, expected_offset);
                expected_offset += spec.runs as u64;
            }
            let max = specs.iter().map(|c| c.runs).max().unwrap_or(0);
            let min = specs.iter().map(|c| c.runs).min().unwrap_or(0);
            prop_assert!(max - min <= 1);
        }
    }
}
