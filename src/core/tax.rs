use super::types::{
    AssetBuckets, BucketDraws, FilingStatus, TaxBreakdown, TaxProfile, WithdrawalOrder,
};

/// Cap on any single statutory rate after the rate multiplier is applied.
pub const MAX_MARGINAL_RATE: f64 = 0.50;
/// Flat rate for states without an entry below.
pub const DEFAULT_STATE_RATE: f64 = 0.05;
pub const GROSS_UP_ITERATIONS: usize = 60;

const NET_TOLERANCE: f64 = 1e-6;

// 2024 federal ordinary brackets: (upper bound of taxable income, rate).
const SINGLE_ORDINARY: [(f64, f64); 7] = [
    (11_600.0, 0.10),
    (47_150.0, 0.12),
    (100_525.0, 0.22),
    (191_950.0, 0.24),
    (243_725.0, 0.32),
    (609_350.0, 0.35),
    (f64::INFINITY, 0.37),
];
const JOINT_ORDINARY: [(f64, f64); 7] = [
    (23_200.0, 0.10),
    (94_300.0, 0.12),
    (201_050.0, 0.22),
    (383_900.0, 0.24),
    (487_450.0, 0.32),
    (731_200.0, 0.35),
    (f64::INFINITY, 0.37),
];
const SINGLE_CAPITAL_GAINS: [(f64, f64); 3] = [
    (47_025.0, 0.0),
    (518_900.0, 0.15),
    (f64::INFINITY, 0.20),
];
const JOINT_CAPITAL_GAINS: [(f64, f64); 3] = [
    (94_050.0, 0.0),
    (583_750.0, 0.15),
    (f64::INFINITY, 0.20),
];

const NO_INCOME_TAX_STATES: [&str; 9] = ["AK", "FL", "NV", "NH", "SD", "TN", "TX", "WA", "WY"];
const FLAT_STATE_RATES: [(&str, f64); 12] = [
    ("AZ", 0.025),
    ("CO", 0.044),
    ("GA", 0.0539),
    ("ID", 0.058),
    ("IL", 0.0495),
    ("IN", 0.0305),
    ("KY", 0.04),
    ("MA", 0.05),
    ("MI", 0.0425),
    ("NC", 0.045),
    ("PA", 0.0307),
    ("UT", 0.0465),
];

/// Effective state income tax rate before the rate multiplier. No-income-tax states stay at
/// zero even with an override.
pub fn state_rate(code: &str, rate_override: Option<f64>) -> f64 {
    let code = code.trim().to_ascii_uppercase();
    if NO_INCOME_TAX_STATES.contains(&code.as_str()) {
        return 0.0;
    }
    if let Some(rate) = rate_override {
        return rate.max(0.0);
    }
    FLAT_STATE_RATES
        .iter()
        .find(|(state, _)| *state == code)
        .map(|(_, rate)| *rate)
        .unwrap_or(DEFAULT_STATE_RATE)
}

/// Everything about a tax year that does not depend on the withdrawal.
#[derive(Clone, Debug)]
pub struct TaxContext {
    pub filing_status: FilingStatus,
    pub primary_age: u32,
    pub spouse_age: Option<u32>,
    /// Scale applied to brackets, deductions and thresholds (1.0 in real dollars).
    pub index_factor: f64,
    pub rate_multiplier: f64,
    state_rate: f64,
}

impl TaxContext {
    pub fn new(
        profile: &TaxProfile,
        primary_age: u32,
        spouse_age: Option<u32>,
        index_factor: f64,
    ) -> Self {
        Self {
            filing_status: profile.filing_status,
            primary_age,
            spouse_age,
            index_factor,
            rate_multiplier: profile.rate_multiplier,
            state_rate: state_rate(&profile.state, profile.state_rate_override),
        }
    }

    fn capped(&self, rate: f64) -> f64 {
        (rate * self.rate_multiplier).clamp(0.0, MAX_MARGINAL_RATE)
    }

    fn joint(&self) -> bool {
        self.filing_status == FilingStatus::MarriedFilingJointly
    }

    pub fn standard_deduction(&self) -> f64 {
        let (base, extra) = if self.joint() {
            (29_200.0, 1_550.0)
        } else {
            (14_600.0, 1_950.0)
        };
        let mut seniors = u32::from(self.primary_age >= 65);
        if self.joint() && self.spouse_age.is_some_and(|age| age >= 65) {
            seniors += 1;
        }
        (base + extra * seniors as f64) * self.index_factor
    }

    pub fn effective_state_rate(&self) -> f64 {
        self.capped(self.state_rate)
    }
}

/// Income that arrives regardless of portfolio withdrawals.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct IncomeSources {
    pub social_security: f64,
    pub pension: f64,
    /// Part-time earnings and any other ordinary income.
    pub other_ordinary: f64,
}

impl IncomeSources {
    pub fn total(&self) -> f64 {
        self.social_security + self.pension + self.other_ordinary
    }
}

/// Federal, capital-gains and state tax for one year.
pub fn assess(
    income: &IncomeSources,
    deferred_draw: f64,
    realized_gain: f64,
    ctx: &TaxContext,
) -> TaxBreakdown {
    let ordinary_excl_ss = income.pension + income.other_ordinary + deferred_draw;
    let taxable_ss = taxable_social_security(
        income.social_security,
        ordinary_excl_ss + realized_gain,
        ctx,
    );
    let gross_ordinary = ordinary_excl_ss + taxable_ss;
    let deduction = ctx.standard_deduction();
    let ordinary_taxable = (gross_ordinary - deduction).max(0.0);
    let unused_deduction = (deduction - gross_ordinary).max(0.0);
    let gains_taxable = (realized_gain - unused_deduction).max(0.0);

    let (ordinary_table, gains_table): (&[(f64, f64)], &[(f64, f64)]) = if ctx.joint() {
        (&JOINT_ORDINARY[..], &JOINT_CAPITAL_GAINS[..])
    } else {
        (&SINGLE_ORDINARY[..], &SINGLE_CAPITAL_GAINS[..])
    };

    let federal = stacked_tax(0.0, ordinary_taxable, ordinary_table, ctx);
    let capital_gains = stacked_tax(ordinary_taxable, gains_taxable, gains_table, ctx);
    let state_base = (ordinary_excl_ss + realized_gain - deduction).max(0.0);
    let state = state_base * ctx.effective_state_rate();

    TaxBreakdown {
        federal,
        capital_gains,
        state,
    }
}

/// Tax on `amount` of income stacked on top of `floor` already-taxed income.
fn stacked_tax(floor: f64, amount: f64, table: &[(f64, f64)], ctx: &TaxContext) -> f64 {
    if amount <= 0.0 {
        return 0.0;
    }
    let top = floor + amount;
    let mut lower = 0.0;
    let mut tax = 0.0;
    for &(upper, rate) in table {
        let upper = upper * ctx.index_factor;
        let overlap = top.min(upper) - floor.max(lower);
        if overlap > 0.0 {
            tax += overlap * ctx.capped(rate);
        }
        if top <= upper {
            break;
        }
        lower = upper;
    }
    tax
}

/// Portion of a Social Security benefit that is federally taxable.
pub fn taxable_social_security(benefit: f64, other_income: f64, ctx: &TaxContext) -> f64 {
    if benefit <= 0.0 {
        return 0.0;
    }
    let (first, second) = if ctx.joint() {
        (32_000.0, 44_000.0)
    } else {
        (25_000.0, 34_000.0)
    };
    let first = first * ctx.index_factor;
    let second = second * ctx.index_factor;
    let provisional = other_income + 0.5 * benefit;

    if provisional <= first {
        0.0
    } else if provisional <= second {
        (0.5 * (provisional - first)).min(0.5 * benefit)
    } else {
        let lower_tier = (0.5 * benefit).min(0.5 * (second - first));
        (0.85 * (provisional - second) + lower_tier).min(0.85 * benefit)
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct WithdrawalPlan {
    pub gross_withdrawal: f64,
    pub draws: BucketDraws,
    pub taxes: TaxBreakdown,
    pub guaranteed_income: f64,
    pub net_spendable: f64,
    /// The requested need or gross could not be met from the buckets.
    pub shortfall: bool,
}

/// Splits a gross withdrawal across buckets following `order`. `gross` must not exceed the
/// bucket total.
pub fn allocate_draws(gross: f64, buckets: &AssetBuckets, order: WithdrawalOrder) -> BucketDraws {
    let mut draws = BucketDraws::default();
    if gross <= 0.0 {
        return draws;
    }
    match order {
        WithdrawalOrder::ProRata => {
            let total = buckets.total();
            if total <= 0.0 {
                return draws;
            }
            let share = (gross / total).min(1.0);
            draws.cash = buckets.cash * share;
            draws.taxable = buckets.taxable * share;
            draws.tax_deferred = buckets.tax_deferred * share;
            draws.tax_free = buckets.tax_free * share;
        }
        WithdrawalOrder::TaxEfficient | WithdrawalOrder::DeferredFirst => {
            let mut remaining = gross;
            let mut take = |balance: f64| {
                let amount = remaining.min(balance).max(0.0);
                remaining -= amount;
                amount
            };
            draws.cash = take(buckets.cash);
            if order == WithdrawalOrder::TaxEfficient {
                draws.taxable = take(buckets.taxable);
                draws.tax_deferred = take(buckets.tax_deferred);
            } else {
                draws.tax_deferred = take(buckets.tax_deferred);
                draws.taxable = take(buckets.taxable);
            }
            draws.tax_free = take(buckets.tax_free);
        }
    }
    draws
}

fn evaluate(
    gross: f64,
    income: &IncomeSources,
    buckets: &AssetBuckets,
    ctx: &TaxContext,
    order: WithdrawalOrder,
) -> WithdrawalPlan {
    let draws = allocate_draws(gross, buckets, order);
    let realized_gain = draws.taxable * buckets.taxable_gain_fraction();
    let taxes = assess(income, draws.tax_deferred, realized_gain, ctx);
    let guaranteed = income.total();
    WithdrawalPlan {
        gross_withdrawal: draws.total(),
        draws,
        taxes,
        guaranteed_income: guaranteed,
        net_spendable: guaranteed + draws.total() - taxes.total(),
        shortfall: false,
    }
}

/// Smallest gross withdrawal whose after-tax proceeds, together with guaranteed income, cover
/// `need`. Withdraws everything and flags a shortfall when even that is not enough.
pub fn plan_for_need(
    need: f64,
    income: &IncomeSources,
    buckets: &AssetBuckets,
    ctx: &TaxContext,
    order: WithdrawalOrder,
) -> WithdrawalPlan {
    let base = evaluate(0.0, income, buckets, ctx, order);
    if base.net_spendable + NET_TOLERANCE >= need {
        return base;
    }

    let available = buckets.total();
    let full = evaluate(available, income, buckets, ctx, order);
    if full.net_spendable + NET_TOLERANCE < need {
        return WithdrawalPlan {
            shortfall: true,
            ..full
        };
    }

    let mut lo = 0.0;
    let mut hi = available;
    for _ in 0..GROSS_UP_ITERATIONS {
        let mid = 0.5 * (lo + hi);
        if evaluate(mid, income, buckets, ctx, order).net_spendable < need {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    evaluate(hi, income, buckets, ctx, order)
}

/// Plan for a predetermined gross withdrawal, capped at what the buckets hold.
pub fn plan_for_gross(
    gross: f64,
    income: &IncomeSources,
    buckets: &AssetBuckets,
    ctx: &TaxContext,
    order: WithdrawalOrder,
) -> WithdrawalPlan {
    let available = buckets.total();
    let requested = gross.max(0.0);
    let plan = evaluate(requested.min(available), income, buckets, ctx, order);
    WithdrawalPlan {
        shortfall: requested > available + NET_TOLERANCE,
        ..plan
    }
}
