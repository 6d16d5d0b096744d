use log::warn;

use super::types::{
    AllocationWeights, CapitalMarketAssumptions, LongevityModel, ReturnSource, SimulationParams,
    WithdrawalPolicy,
};

/// Floor on total investable assets; anything below is topped up in cash.
pub const MIN_ASSET_BALANCE: f64 = 1.0;
pub const MAX_AGE: u32 = 120;
pub const MAX_VOLATILITY: f64 = 1.0;
pub const MAX_CORRELATION: f64 = 0.99;

#[derive(Clone, Debug, PartialEq)]
pub struct Correction {
    pub field: &'static str,
    pub message: String,
}

#[derive(Clone, Debug)]
pub struct Sanitized {
    pub params: SimulationParams,
    pub corrections: Vec<Correction>,
}

/// Repairs out-of-domain inputs instead of rejecting them. Every repair is reported.
pub fn sanitize(params: &SimulationParams) -> Sanitized {
    let mut fixer = Fixer::default();
    let mut p = params.clone();

    p.current_age = fixer.at_most("currentAge", p.current_age, MAX_AGE);
    if p.retirement_age < p.current_age {
        fixer.note(
            "retirementAge",
            format!(
                "{} is before current age {}; retiring now",
                p.retirement_age, p.current_age
            ),
        );
        p.retirement_age = p.current_age;
    }
    p.retirement_age = fixer.at_most("retirementAge", p.retirement_age, MAX_AGE);
    if p.life_expectancy < p.retirement_age {
        fixer.note(
            "lifeExpectancy",
            format!(
                "{} is before retirement age {}; using retirement age",
                p.life_expectancy, p.retirement_age
            ),
        );
        p.life_expectancy = p.retirement_age;
    }
    p.life_expectancy = fixer.at_most("lifeExpectancy", p.life_expectancy, MAX_AGE);
    if let Some(spouse) = p.spouse.as_mut() {
        spouse.current_age = fixer.at_most("spouse.currentAge", spouse.current_age, MAX_AGE);
        if spouse.life_expectancy < spouse.current_age {
            fixer.note(
                "spouse.lifeExpectancy",
                format!(
                    "{} is before spouse age {}; using spouse age",
                    spouse.life_expectancy, spouse.current_age
                ),
            );
            spouse.life_expectancy = spouse.current_age;
        }
        spouse.life_expectancy =
            fixer.at_most("spouse.lifeExpectancy", spouse.life_expectancy, MAX_AGE);
    }

    let b = &mut p.buckets;
    b.tax_deferred = fixer.non_negative("buckets.taxDeferred", b.tax_deferred);
    b.tax_free = fixer.non_negative("buckets.taxFree", b.tax_free);
    b.taxable = fixer.non_negative("buckets.taxable", b.taxable);
    b.cash = fixer.non_negative("buckets.cash", b.cash);
    b.taxable_basis = fixer.non_negative("buckets.taxableBasis", b.taxable_basis);
    if b.taxable_basis > b.taxable {
        fixer.note(
            "buckets.taxableBasis",
            format!("{} exceeds taxable balance; capped", b.taxable_basis),
        );
        b.taxable_basis = b.taxable;
    }
    let total = b.total();
    if total < MIN_ASSET_BALANCE {
        fixer.note(
            "buckets",
            format!("total {total} below minimum {MIN_ASSET_BALANCE}; topped up in cash"),
        );
        b.cash += MIN_ASSET_BALANCE - total;
    }

    p.annual_savings = fixer.non_negative("annualSavings", p.annual_savings);
    p.annual_spending = fixer.non_negative("annualSpending", p.annual_spending);
    p.annual_healthcare_cost =
        fixer.non_negative("annualHealthcareCost", p.annual_healthcare_cost);

    let income = &mut p.guaranteed_income;
    income.social_security.annual_amount = fixer.non_negative(
        "socialSecurity.annualAmount",
        income.social_security.annual_amount,
    );
    income.pension.annual_amount =
        fixer.non_negative("pension.annualAmount", income.pension.annual_amount);
    income.part_time.annual_amount =
        fixer.non_negative("partTime.annualAmount", income.part_time.annual_amount);

    sanitize_return_source(&mut fixer, &mut p.return_source);
    p.cash_yield = fixer.clamped("cashYield", p.cash_yield, 0.0, -0.5, 0.5);

    let inflation = &mut p.inflation;
    inflation.general = fixer.clamped("inflation.general", inflation.general, 0.025, -0.05, 0.5);
    inflation.healthcare = fixer.clamped(
        "inflation.healthcare",
        inflation.healthcare,
        0.05,
        -0.05,
        0.5,
    );
    inflation.social_security_cola = fixer.clamped(
        "inflation.socialSecurityCola",
        inflation.social_security_cola,
        0.025,
        -0.05,
        0.5,
    );

    match &mut p.withdrawal_policy {
        WithdrawalPolicy::FixedPercentage { rate } => {
            *rate = fixer.clamped("withdrawalPolicy.rate", *rate, 0.04, 0.0, 1.0);
        }
        WithdrawalPolicy::SpendingTarget => {}
        WithdrawalPolicy::Guardrails(config) => {
            config.upper_band =
                fixer.clamped("guardrails.upperBand", config.upper_band, 0.2, 0.0, 1.0);
            config.lower_band =
                fixer.clamped("guardrails.lowerBand", config.lower_band, 0.2, 0.0, 1.0);
            config.cut = fixer.clamped("guardrails.cut", config.cut, 0.1, 0.0, 1.0);
            config.raise = fixer.clamped("guardrails.raise", config.raise, 0.1, 0.0, 1.0);
        }
    }

    let tax = &mut p.tax;
    tax.rate_multiplier =
        fixer.clamped("tax.rateMultiplier", tax.rate_multiplier, 1.0, 0.0, 10.0);
    tax.state = tax.state.trim().to_ascii_uppercase();
    if let Some(rate) = tax.state_rate_override {
        let rate = fixer.clamped("tax.stateRateOverride", rate, 0.0, 0.0, 0.5);
        tax.state_rate_override = Some(rate);
    }

    if let Some(goal) = p.legacy_goal
        && !(goal.is_finite() && goal >= 0.0)
    {
        fixer.note("legacyGoal", format!("{goal} is not a valid amount; ignored"));
        p.legacy_goal = None;
    }

    let life_expectancy = p.life_expectancy;
    if let LongevityModel::Stochastic {
        std_dev_years,
        max_age,
    } = &mut p.longevity
    {
        *std_dev_years = fixer.clamped("longevity.stdDevYears", *std_dev_years, 0.0, 0.0, 30.0);
        if *max_age < life_expectancy {
            fixer.note(
                "longevity.maxAge",
                format!("{max_age} is below life expectancy; using {life_expectancy}"),
            );
            *max_age = life_expectancy;
        }
        *max_age = fixer.at_most("longevity.maxAge", *max_age, MAX_AGE);
    }

    if let Some(forced) = p.first_retirement_year_return
        && !(forced.is_finite() && forced > -1.0)
    {
        fixer.note(
            "firstRetirementYearReturn",
            format!("{forced} is not a valid return; ignored"),
        );
        p.first_retirement_year_return = None;
    }

    for correction in &fixer.corrections {
        warn!("corrected {}: {}", correction.field, correction.message);
    }

    Sanitized {
        params: p,
        corrections: fixer.corrections,
    }
}

fn sanitize_return_source(fixer: &mut Fixer, source: &mut ReturnSource) {
    match source {
        ReturnSource::Scalar {
            expected_return,
            volatility,
        } => {
            *expected_return = fixer.clamped("expectedReturn", *expected_return, 0.05, -0.5, 1.0);
            *volatility = fixer.clamped("volatility", *volatility, 0.15, 0.0, MAX_VOLATILITY);
        }
        ReturnSource::Allocation {
            weights,
            assumptions,
        } => {
            *weights = fixer.weights("allocation.weights", *weights);
            sanitize_assumptions(fixer, assumptions);
        }
        ReturnSource::GlidePath {
            schedule,
            assumptions,
        } => {
            if schedule.is_empty() {
                fixer.note(
                    "glidePath.schedule",
                    "empty schedule; using scalar defaults".to_string(),
                );
                *source = ReturnSource::default();
                return;
            }
            schedule.sort_by(|a, b| b.years_to_retirement.cmp(&a.years_to_retirement));
            for point in schedule.iter_mut() {
                point.weights = fixer.weights("glidePath.weights", point.weights);
            }
            sanitize_assumptions(fixer, assumptions);
        }
    }
}

fn sanitize_assumptions(fixer: &mut Fixer, cma: &mut CapitalMarketAssumptions) {
    let defaults = CapitalMarketAssumptions::default();
    for (class, fallback, name) in [
        (&mut cma.equities, defaults.equities, "equities"),
        (&mut cma.bonds, defaults.bonds, "bonds"),
        (&mut cma.cash, defaults.cash, "cash"),
    ] {
        class.expected_return = fixer.clamped(
            name,
            class.expected_return,
            fallback.expected_return,
            -0.5,
            1.0,
        );
        class.volatility = fixer.clamped(
            name,
            class.volatility,
            fallback.volatility,
            0.0,
            MAX_VOLATILITY,
        );
    }
    let c = &mut cma.correlations;
    c.equity_bond = fixer.clamped(
        "correlations.equityBond",
        c.equity_bond,
        0.0,
        -MAX_CORRELATION,
        MAX_CORRELATION,
    );
    c.equity_cash = fixer.clamped(
        "correlations.equityCash",
        c.equity_cash,
        0.0,
        -MAX_CORRELATION,
        MAX_CORRELATION,
    );
    c.bond_cash = fixer.clamped(
        "correlations.bondCash",
        c.bond_cash,
        0.0,
        -MAX_CORRELATION,
        MAX_CORRELATION,
    );
}

#[derive(Default)]
struct Fixer {
    corrections: Vec<Correction>,
}

impl Fixer {
    fn note(&mut self, field: &'static str, message: String) {
        self.corrections.push(Correction { field, message });
    }

    fn non_negative(&mut self, field: &'static str, value: f64) -> f64 {
        if !value.is_finite() {
            self.note(field, format!("{value} is not finite; using 0"));
            return 0.0;
        }
        if value < 0.0 {
            self.note(field, format!("{value} is negative; using 0"));
            return 0.0;
        }
        value
    }

    fn clamped(&mut self, field: &'static str, value: f64, fallback: f64, lo: f64, hi: f64) -> f64 {
        if !value.is_finite() {
            self.note(field, format!("{value} is not finite; using {fallback}"));
            return fallback;
        }
        let bounded = value.clamp(lo, hi);
        if bounded != value {
            self.note(field, format!("{value} outside [{lo}, {hi}]; using {bounded}"));
        }
        bounded
    }

    fn at_most(&mut self, field: &'static str, value: u32, max: u32) -> u32 {
        if value > max {
            self.note(field, format!("{value} above {max}; capped"));
            return max;
        }
        value
    }

    fn weights(&mut self, field: &'static str, weights: AllocationWeights) -> AllocationWeights {
        let finite = [weights.equities, weights.bonds, weights.cash]
            .iter()
            .all(|w| w.is_finite());
        let raw = if finite {
            weights
        } else {
            self.note(field, "non-finite weight; using 100% equities".to_string());
            AllocationWeights {
                equities: 1.0,
                bonds: 0.0,
                cash: 0.0,
            }
        };
        let normalized = raw.normalized();
        if (raw.equities + raw.bonds + raw.cash - 1.0).abs() > 1e-9 {
            self.note(field, "weights do not sum to 1; rescaled".to_string());
        }
        normalized
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{GlidePoint, SpouseProfile};

    #[test]
    fn defaults_need_no_corrections() {
        let sanitized = sanitize(&SimulationParams::default());
        assert!(
            sanitized.corrections.is_empty(),
            "unexpected corrections: {:?}",
            sanitized.corrections
        );
        assert_eq!(sanitized.params, SimulationParams::default());
    }

    #[test]
    fn empty_portfolio_is_topped_up_to_minimum() {
        let mut params = SimulationParams::default();
        params.buckets = Default::default();
        let sanitized = sanitize(&params);
        assert!((sanitized.params.buckets.total() - MIN_ASSET_BALANCE).abs() < 1e-12);
        assert!(sanitized.corrections.iter().any(|c| c.field == "buckets"));
    }

    #[test]
    fn invalid_numbers_are_replaced() {
        let mut params = SimulationParams::default();
        params.buckets.taxable = -5.0;
        params.annual_spending = f64::NAN;
        params.return_source = ReturnSource::Scalar {
            expected_return: 0.07,
            volatility: 3.0,
        };
        params.legacy_goal = Some(f64::INFINITY);
        let sanitized = sanitize(&params);
        let p = &sanitized.params;
        assert_eq!(p.buckets.taxable, 0.0);
        assert_eq!(p.buckets.taxable_basis, 0.0);
        assert_eq!(p.annual_spending, 0.0);
        assert_eq!(p.legacy_goal, None);
        assert!(matches!(
            p.return_source,
            ReturnSource::Scalar { volatility, .. } if volatility == MAX_VOLATILITY
        ));
        assert!(sanitized.corrections.len() >= 4);
    }

    #[test]
    fn ages_are_put_in_order() {
        let mut params = SimulationParams::default();
        params.current_age = 70;
        params.retirement_age = 60;
        params.life_expectancy = 65;
        params.spouse = Some(SpouseProfile {
            current_age: 68,
            life_expectancy: 50,
        });
        let p = sanitize(&params).params;
        assert_eq!(p.retirement_age, 70);
        assert_eq!(p.life_expectancy, 70);
        let spouse = p.spouse.expect("spouse kept");
        assert_eq!(spouse.life_expectancy, 68);
    }

    #[test]
    fn glide_path_is_sorted_and_normalized() {
        let mut params = SimulationParams::default();
        params.return_source = ReturnSource::GlidePath {
            schedule: vec![
                GlidePoint {
                    years_to_retirement: 0,
                    weights: AllocationWeights {
                        equities: 2.0,
                        bonds: 2.0,
                        cash: 0.0,
                    },
                },
                GlidePoint {
                    years_to_retirement: 20,
                    weights: AllocationWeights {
                        equities: 0.9,
                        bonds: 0.1,
                        cash: 0.0,
                    },
                },
            ],
            assumptions: CapitalMarketAssumptions::default(),
        };
        let p = sanitize(&params).params;
        let ReturnSource::GlidePath { schedule, .. } = p.return_source else {
            panic!("glide path should be kept");
        };
        assert_eq!(schedule[0].years_to_retirement, 20);
        assert!((schedule[1].weights.equities - 0.5).abs() < 1e-12);
    }
}
