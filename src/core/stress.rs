use log::info;
use serde::{Deserialize, Serialize};

use super::aggregate::{RunConfig, run_simulation};
use super::error::EngineError;
use super::types::{AggregateResult, LongevityModel, SimulationParams};
use super::validation::{MAX_AGE, MIN_ASSET_BALANCE};

pub const MAX_CRASH_DROP: f64 = 0.95;
/// Share of a crash's drop added to volatility.
pub const CRASH_VOLATILITY_SHARE: f64 = 0.25;
/// Share of a healthcare increase passed on to general spending.
pub const HEALTHCARE_SPILLOVER: f64 = 0.15;
/// Expected returns are never pushed below this floor by a return reduction.
pub const RETURN_FLOOR: f64 = 0.01;
/// Balance haircut per year of lost savings and growth under early retirement.
pub const EARLY_RETIREMENT_HAIRCUT_PER_YEAR: f64 = 0.03;
pub const MAX_EARLY_RETIREMENT_HAIRCUT: f64 = 0.5;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ShockKind {
    MarketCrash,
    InflationSpike,
    Longevity,
    HealthcareCost,
    SocialSecurityCut,
    TaxIncrease,
    ReturnReduction,
    EarlyRetirement,
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CrashTiming {
    /// Balances drop today.
    #[default]
    Immediate,
    /// The first retirement year's return is forced to `-drop`.
    AtRetirement,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShockSpec {
    pub kind: ShockKind,
    /// Fraction, rate increase or years depending on `kind`.
    pub magnitude: f64,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    #[serde(default)]
    pub crash_timing: CrashTiming,
}

fn enabled_by_default() -> bool {
    true
}

impl ShockSpec {
    pub fn new(kind: ShockKind, magnitude: f64) -> Self {
        Self {
            kind,
            magnitude,
            enabled: true,
            crash_timing: CrashTiming::Immediate,
        }
    }
}

/// Returns a stressed copy of `base`; the input is never touched. A zero magnitude is the
/// identity for every shock kind.
pub fn apply_shock(base: &SimulationParams, shock: &ShockSpec) -> SimulationParams {
    let mut p = base.clone();
    let m = if shock.magnitude.is_finite() {
        shock.magnitude
    } else {
        0.0
    };
    if m == 0.0 {
        return p;
    }

    match shock.kind {
        ShockKind::MarketCrash => {
            let drop = m.clamp(0.0, MAX_CRASH_DROP);
            match shock.crash_timing {
                CrashTiming::Immediate => p.buckets.scale(1.0 - drop),
                CrashTiming::AtRetirement => p.first_retirement_year_return = Some(-drop),
            }
            p.return_source.add_volatility(drop * CRASH_VOLATILITY_SHARE);
        }
        ShockKind::InflationSpike => {
            p.inflation.general += m;
            p.inflation.healthcare += m;
        }
        ShockKind::Longevity => {
            let years = m.round().clamp(0.0, MAX_AGE as f64) as u32;
            p.life_expectancy = p.life_expectancy.saturating_add(years).min(MAX_AGE);
            if let Some(spouse) = p.spouse.as_mut() {
                spouse.life_expectancy = spouse.life_expectancy.saturating_add(years).min(MAX_AGE);
            }
            if let LongevityModel::Stochastic { max_age, .. } = &mut p.longevity {
                *max_age = max_age.saturating_add(years).min(MAX_AGE);
            }
        }
        ShockKind::HealthcareCost => {
            p.annual_healthcare_cost *= 1.0 + m;
            p.annual_spending *= 1.0 + HEALTHCARE_SPILLOVER * m;
        }
        ShockKind::SocialSecurityCut => {
            let cut = m.clamp(0.0, 1.0);
            p.guaranteed_income.social_security.annual_amount *= 1.0 - cut;
        }
        ShockKind::TaxIncrease => {
            p.tax.rate_multiplier *= 1.0 + m;
        }
        ShockKind::ReturnReduction => {
            p.return_source.reduce_expected_return(m, RETURN_FLOOR);
        }
        ShockKind::EarlyRetirement => {
            let years = m.abs().round() as u32;
            let new_age = p.retirement_age.saturating_sub(years).max(p.current_age);
            let lost_years = p.retirement_age.saturating_sub(new_age);
            p.retirement_age = new_age;
            if lost_years > 0 {
                let haircut = (EARLY_RETIREMENT_HAIRCUT_PER_YEAR * lost_years as f64)
                    .min(MAX_EARLY_RETIREMENT_HAIRCUT);
                p.buckets.scale(1.0 - haircut);
                let total = p.buckets.total();
                if total < MIN_ASSET_BALANCE {
                    p.buckets.cash += MIN_ASSET_BALANCE - total;
                }
            }
        }
    }
    p
}

/// Applies every enabled shock in order.
pub fn apply_shocks(base: &SimulationParams, shocks: &[ShockSpec]) -> SimulationParams {
    shocks
        .iter()
        .filter(|shock| shock.enabled)
        .fold(base.clone(), |params, shock| apply_shock(&params, shock))
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StressRequest {
    pub shocks: Vec<ShockSpec>,
    #[serde(default = "enabled_by_default")]
    pub include_combined: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShockOutcome {
    pub kind: ShockKind,
    pub magnitude: f64,
    pub result: AggregateResult,
    /// Change in success probability versus baseline, in percentage points.
    pub success_delta_pp: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CombinedOutcome {
    pub kinds: Vec<ShockKind>,
    pub result: AggregateResult,
    pub success_delta_pp: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StressReport {
    pub baseline: AggregateResult,
    pub shocks: Vec<ShockOutcome>,
    pub combined: Option<CombinedOutcome>,
}

fn delta_pp(stressed: &AggregateResult, baseline: &AggregateResult) -> f64 {
    (stressed.success_probability - baseline.success_probability) * 100.0
}

/// Runs the baseline, each enabled shock on its own, and the combination when more than one
/// shock is enabled. Every run shares the baseline seed.
pub fn run_stress_test(
    base: &SimulationParams,
    request: &StressRequest,
    config: &RunConfig,
) -> Result<StressReport, EngineError> {
    let baseline = run_simulation(base, config)?;
    let enabled: Vec<&ShockSpec> = request.shocks.iter().filter(|s| s.enabled).collect();
    info!("stress test with {} enabled shocks", enabled.len());

    let mut shocks = Vec::with_capacity(enabled.len());
    for shock in &enabled {
        let result = run_simulation(&apply_shock(base, shock), config)?;
        shocks.push(ShockOutcome {
            kind: shock.kind,
            magnitude: shock.magnitude,
            success_delta_pp: delta_pp(&result, &baseline),
            result,
        });
    }

    let combined = if request.include_combined && enabled.len() > 1 {
        let result = run_simulation(&apply_shocks(base, &request.shocks), config)?;
        Some(CombinedOutcome {
            kinds: enabled.iter().map(|s| s.kind).collect(),
            success_delta_pp: delta_pp(&result, &baseline),
            result,
        })
    } else {
        None
    };

    Ok(StressReport {
        baseline,
        shocks,
        combined,
    })
}
