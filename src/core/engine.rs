use super::guardrails::{GuardrailAdjuster, GuardrailInput};
use super::returns::ReturnGenerator;
use super::tax::{IncomeSources, TaxContext, WithdrawalPlan, plan_for_gross, plan_for_need};
use super::types::{
    BucketDraws, DollarMode, GuardrailTag, LongevityModel, Phase, ScenarioOutcome, SimulationParams,
    TaxBreakdown, WithdrawalPolicy, YearlyCashFlow,
};

/// Portfolio totals at or below this are treated as exhausted.
pub const DEPLETION_EPSILON: f64 = 0.01;

/// Converts today's-dollar amounts into the dollars a scenario is reported in.
#[derive(Copy, Clone, Debug)]
struct DollarBasis {
    mode: DollarMode,
    inflation: f64,
}

impl DollarBasis {
    fn price_index(self, year: i32) -> f64 {
        (1.0 + self.inflation).powi(year)
    }

    /// `base` grown at `growth` for `year` years, then deflated in real mode.
    fn amount(self, base: f64, growth: f64, year: i32) -> f64 {
        let nominal = base * (1.0 + growth).powi(year);
        match self.mode {
            DollarMode::Nominal => nominal,
            DollarMode::Real => nominal / self.price_index(year),
        }
    }

    fn to_today(self, value: f64, year: i32) -> f64 {
        match self.mode {
            DollarMode::Nominal => value / self.price_index(year),
            DollarMode::Real => value,
        }
    }

    fn rate(self, nominal: f64) -> f64 {
        match self.mode {
            DollarMode::Nominal => nominal,
            DollarMode::Real => (1.0 + nominal) / (1.0 + self.inflation) - 1.0,
        }
    }

    /// Scale for brackets and thresholds that are fixed in today's dollars.
    fn index_factor(self, year: i32) -> f64 {
        match self.mode {
            DollarMode::Nominal => self.price_index(year),
            DollarMode::Real => 1.0,
        }
    }
}

/// Last age simulated for this scenario, on the primary's age scale.
///
/// `longevity_z` shifts the horizon under the stochastic model; the result never falls before
/// retirement.
pub fn resolve_horizon_age(params: &SimulationParams, longevity_z: f64) -> u32 {
    let planned = params.planned_horizon_age();
    match &params.longevity {
        LongevityModel::Fixed => planned,
        LongevityModel::Stochastic {
            std_dev_years,
            max_age,
        } => {
            let drawn = (planned as f64 + std_dev_years * longevity_z).round();
            let floor = params.retirement_age.max(params.current_age) as f64;
            let ceiling = (*max_age).max(planned) as f64;
            drawn.clamp(floor, ceiling) as u32
        }
    }
}

fn spending_need(params: &SimulationParams, dollars: DollarBasis, year: i32) -> f64 {
    dollars.amount(params.annual_spending, params.inflation.general, year)
        + dollars.amount(params.annual_healthcare_cost, params.inflation.healthcare, year)
}

fn guaranteed_income(
    params: &SimulationParams,
    dollars: DollarBasis,
    age: u32,
    year: i32,
) -> IncomeSources {
    let income = &params.guaranteed_income;
    let inflation = &params.inflation;

    let ss = &income.social_security;
    let social_security = if age >= ss.claim_age {
        let cola = if ss.cola {
            inflation.social_security_cola
        } else {
            0.0
        };
        dollars.amount(ss.annual_amount, cola, year)
    } else {
        0.0
    };

    let pension = &income.pension;
    let pension_income = if age >= pension.start_age {
        let cola = if pension.cola { inflation.general } else { 0.0 };
        dollars.amount(pension.annual_amount, cola, year)
    } else {
        0.0
    };

    let part_time = &income.part_time;
    let other_ordinary = if age >= part_time.start_age && age <= part_time.end_age {
        dollars.amount(part_time.annual_amount, inflation.general, year)
    } else {
        0.0
    };

    IncomeSources {
        social_security,
        pension: pension_income,
        other_ordinary,
    }
}

/// Runs one household scenario year by year.
///
/// The longevity draw comes first, then the whole return path is drawn upfront. A scenario
/// sees the same market whatever its retirement or life-expectancy inputs.
pub fn simulate_scenario(
    params: &SimulationParams,
    rng: &mut ReturnGenerator,
    include_legacy_goal: bool,
) -> ScenarioOutcome {
    let longevity_z = rng.standard_normal();
    let horizon_age = resolve_horizon_age(params, longevity_z).max(params.current_age);
    let planned_horizon = params.planned_horizon_age();
    let years = (horizon_age - params.current_age + 1) as usize;
    let years_to_retirement = params.retirement_age as i64 - params.current_age as i64;
    let returns = rng.draw_path(
        &params.return_source,
        params.return_distribution,
        years,
        years_to_retirement,
    );

    let dollars = DollarBasis {
        mode: params.dollar_mode,
        inflation: params.inflation.general,
    };
    let cash_return = dollars.rate(params.cash_yield);
    let mut adjuster = match &params.withdrawal_policy {
        WithdrawalPolicy::Guardrails(config) => Some(GuardrailAdjuster::new(config.clone())),
        _ => None,
    };

    let mut buckets = params.buckets.clone();
    let mut phase = Phase::Accumulation;
    let mut fixed_gross_today: Option<f64> = None;
    let mut first_retirement_year = true;
    let mut failed = false;
    let mut depletion_age = None;
    let mut trace = Vec::with_capacity(years);

    for (index, age) in (params.current_age..=horizon_age).enumerate() {
        let year = index as i32;
        if phase == Phase::Accumulation && age >= params.retirement_age {
            phase = Phase::RetirementActive;
        }
        let spouse_age = params
            .spouse
            .as_ref()
            .map(|spouse| spouse.current_age + index as u32);
        let mut nominal_return = returns[index];
        let start_balance = buckets.total();

        let row = match phase {
            Phase::Accumulation => {
                let contribution =
                    dollars.amount(params.annual_savings, params.inflation.general, year);
                buckets.deposit(contribution, &params.savings_split);
                buckets.grow(dollars.rate(nominal_return), cash_return);
                YearlyCashFlow {
                    year_index: index as u32,
                    age,
                    phase,
                    start_balance,
                    end_balance: buckets.total(),
                    contributions: contribution,
                    gross_withdrawal: 0.0,
                    draws: BucketDraws::default(),
                    taxes: TaxBreakdown::default(),
                    guaranteed_income: 0.0,
                    spending_need: 0.0,
                    net_spendable: 0.0,
                    net_cash_flow: contribution,
                    market_return: nominal_return,
                    guardrail: None,
                }
            }
            Phase::RetirementActive => {
                if first_retirement_year {
                    if let Some(forced) = params.first_retirement_year_return {
                        nominal_return = forced;
                    }
                    first_retirement_year = false;
                }
                let income = guaranteed_income(params, dollars, age, year);
                let need = spending_need(params, dollars, year);
                let ctx = TaxContext::new(&params.tax, age, spouse_age, dollars.index_factor(year));
                let order = params.withdrawal_order;

                let mut guardrail = None;
                let (plan, household_need) = match &params.withdrawal_policy {
                    WithdrawalPolicy::FixedPercentage { rate } => {
                        let gross_today = *fixed_gross_today
                            .get_or_insert_with(|| rate * dollars.to_today(start_balance, year));
                        let gross = dollars.amount(gross_today, params.inflation.general, year);
                        (plan_for_gross(gross, &income, &buckets, &ctx, order), need)
                    }
                    WithdrawalPolicy::SpendingTarget => {
                        (plan_for_need(need, &income, &buckets, &ctx, order), need)
                    }
                    WithdrawalPolicy::Guardrails(_) => {
                        let adjusted = match adjuster.as_mut() {
                            Some(adjuster) => {
                                let decision = adjuster.adjust(GuardrailInput {
                                    portfolio_value: start_balance,
                                    base_need: need,
                                    guaranteed_income: income.total(),
                                    years_remaining: planned_horizon.saturating_sub(age),
                                });
                                guardrail = decision.tag;
                                decision.spending_need
                            }
                            None => need,
                        };
                        (plan_for_need(adjusted, &income, &buckets, &ctx, order), adjusted)
                    }
                };

                buckets.withdraw(&plan.draws);
                buckets.grow(dollars.rate(nominal_return), cash_return);

                if plan.shortfall || buckets.total() <= DEPLETION_EPSILON {
                    buckets.clear();
                    depletion_age = Some(age);
                    phase = Phase::Depleted;
                    if plan.net_spendable + 1e-6 < household_need {
                        failed = true;
                    }
                }

                retirement_row(
                    index,
                    age,
                    Phase::RetirementActive,
                    start_balance,
                    buckets.total(),
                    &plan,
                    household_need,
                    nominal_return,
                    guardrail,
                )
            }
            Phase::Depleted | Phase::HorizonEnd => {
                let income = guaranteed_income(params, dollars, age, year);
                let need = spending_need(params, dollars, year);
                let ctx = TaxContext::new(&params.tax, age, spouse_age, dollars.index_factor(year));
                let plan = plan_for_need(need, &income, &buckets, &ctx, params.withdrawal_order);
                if plan.shortfall {
                    failed = true;
                }
                retirement_row(
                    index,
                    age,
                    Phase::Depleted,
                    0.0,
                    0.0,
                    &plan,
                    need,
                    nominal_return,
                    None,
                )
            }
        };
        trace.push(row);
    }

    let ending_balance = buckets.total();
    let legacy_met = !include_legacy_goal
        || params.legacy_goal.is_none_or(|goal| {
            ending_balance + 1e-6 >= dollars.amount(goal, params.inflation.general, years as i32)
        });

    ScenarioOutcome {
        years: trace,
        success: !failed && legacy_met,
        ending_balance,
        depletion_age,
        terminal_phase: if depletion_age.is_some() {
            Phase::Depleted
        } else {
            Phase::HorizonEnd
        },
        guardrail_adjustments: adjuster.as_ref().map_or(0, GuardrailAdjuster::adjustments),
        dollar_mode: params.dollar_mode,
    }
}

#[allow(clippy::too_many_arguments)]
fn retirement_row(
    index: usize,
    age: u32,
    phase: Phase,
    start_balance: f64,
    end_balance: f64,
    plan: &WithdrawalPlan,
    spending_need: f64,
    market_return: f64,
    guardrail: Option<GuardrailTag>,
) -> YearlyCashFlow {
    YearlyCashFlow {
        year_index: index as u32,
        age,
        phase,
        start_balance,
        end_balance,
        contributions: 0.0,
        gross_withdrawal: plan.gross_withdrawal,
        draws: plan.draws,
        taxes: plan.taxes,
        guaranteed_income: plan.guaranteed_income,
        spending_need,
        net_spendable: plan.net_spendable,
        net_cash_flow: -plan.gross_withdrawal,
        market_return,
        guardrail,
    }
}
