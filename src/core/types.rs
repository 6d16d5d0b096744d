use serde::{Deserialize, Serialize};

/// Tag attached to every aggregate so cached results can be invalidated when the model changes.
pub const MODEL_VERSION: &str = "nestegg-mc-1";

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DollarMode {
    /// Every amount is expressed in today's dollars.
    #[default]
    Real,
    Nominal,
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FilingStatus {
    #[default]
    Single,
    MarriedFilingJointly,
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WithdrawalOrder {
    /// Cash, then taxable, then tax-deferred, tax-free last.
    #[default]
    TaxEfficient,
    /// Cash, then tax-deferred, then taxable, tax-free last.
    DeferredFirst,
    ProRata,
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SamplingMode {
    #[default]
    PseudoRandom,
    /// Scenario `2k + 1` replays scenario `2k` with every normal draw negated.
    Antithetic,
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReturnDistribution {
    #[default]
    Normal,
    LogNormal,
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetClass {
    pub expected_return: f64,
    pub volatility: f64,
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Correlations {
    pub equity_bond: f64,
    pub equity_cash: f64,
    pub bond_cash: f64,
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CapitalMarketAssumptions {
    pub equities: AssetClass,
    pub bonds: AssetClass,
    pub cash: AssetClass,
    pub correlations: Correlations,
}

impl Default for CapitalMarketAssumptions {
    fn default() -> Self {
        Self {
            equities: AssetClass {
                expected_return: 0.08,
                volatility: 0.17,
            },
            bonds: AssetClass {
                expected_return: 0.04,
                volatility: 0.06,
            },
            cash: AssetClass {
                expected_return: 0.025,
                volatility: 0.01,
            },
            correlations: Correlations {
                equity_bond: 0.1,
                equity_cash: 0.0,
                bond_cash: 0.2,
            },
        }
    }
}

impl CapitalMarketAssumptions {
    fn classes_mut(&mut self) -> [&mut AssetClass; 3] {
        [&mut self.equities, &mut self.bonds, &mut self.cash]
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocationWeights {
    pub equities: f64,
    pub bonds: f64,
    pub cash: f64,
}

impl AllocationWeights {
    /// Weights rescaled to sum to one; an all-zero vector becomes 100% equities.
    pub fn normalized(self) -> Self {
        let equities = self.equities.max(0.0);
        let bonds = self.bonds.max(0.0);
        let cash = self.cash.max(0.0);
        let sum = equities + bonds + cash;
        if sum <= 1e-12 {
            return Self {
                equities: 1.0,
                bonds: 0.0,
                cash: 0.0,
            };
        }
        Self {
            equities: equities / sum,
            bonds: bonds / sum,
            cash: cash / sum,
        }
    }

    pub fn as_array(self) -> [f64; 3] {
        [self.equities, self.bonds, self.cash]
    }
}

/// One point of a glide path. Negative `years_to_retirement` means years since retirement.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlidePoint {
    pub years_to_retirement: i32,
    pub weights: AllocationWeights,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ReturnSource {
    Scalar {
        expected_return: f64,
        volatility: f64,
    },
    Allocation {
        weights: AllocationWeights,
        assumptions: CapitalMarketAssumptions,
    },
    GlidePath {
        schedule: Vec<GlidePoint>,
        assumptions: CapitalMarketAssumptions,
    },
}

impl Default for ReturnSource {
    fn default() -> Self {
        ReturnSource::Scalar {
            expected_return: 0.07,
            volatility: 0.15,
        }
    }
}

impl ReturnSource {
    pub fn add_volatility(&mut self, extra: f64) {
        match self {
            ReturnSource::Scalar { volatility, .. } => *volatility = (*volatility + extra).max(0.0),
            ReturnSource::Allocation { assumptions, .. }
            | ReturnSource::GlidePath { assumptions, .. } => {
                for class in assumptions.classes_mut() {
                    class.volatility = (class.volatility + extra).max(0.0);
                }
            }
        }
    }

    /// Lowers every expected return by `reduction`, never below `floor` (a mean already under
    /// the floor is left where it is).
    pub fn reduce_expected_return(&mut self, reduction: f64, floor: f64) {
        let lower = |mean: &mut f64| {
            *mean = (*mean - reduction).max(floor.min(*mean));
        };
        match self {
            ReturnSource::Scalar {
                expected_return, ..
            } => lower(expected_return),
            ReturnSource::Allocation { assumptions, .. }
            | ReturnSource::GlidePath { assumptions, .. } => {
                for class in assumptions.classes_mut() {
                    lower(&mut class.expected_return);
                }
            }
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AssetBuckets {
    pub tax_deferred: f64,
    pub tax_free: f64,
    pub taxable: f64,
    /// Cost basis of the taxable bucket; never above `taxable`.
    pub taxable_basis: f64,
    pub cash: f64,
}

impl AssetBuckets {
    pub fn total(&self) -> f64 {
        self.tax_deferred + self.tax_free + self.taxable + self.cash
    }

    /// Share of the taxable bucket that is unrealized gain, in `[0, 1]`.
    pub fn taxable_gain_fraction(&self) -> f64 {
        if self.taxable <= 0.0 {
            return 0.0;
        }
        ((self.taxable - self.taxable_basis) / self.taxable).clamp(0.0, 1.0)
    }

    pub fn scale(&mut self, factor: f64) {
        let factor = factor.max(0.0);
        self.tax_deferred *= factor;
        self.tax_free *= factor;
        self.taxable *= factor;
        self.taxable_basis *= factor;
        self.cash *= factor;
    }

    pub fn deposit(&mut self, amount: f64, split: &BucketWeights) {
        if amount <= 0.0 {
            return;
        }
        let split = split.normalized();
        self.tax_deferred += amount * split.tax_deferred;
        self.tax_free += amount * split.tax_free;
        let to_taxable = amount * split.taxable;
        self.taxable += to_taxable;
        self.taxable_basis += to_taxable;
        self.cash += amount * split.cash;
    }

    pub fn withdraw(&mut self, draws: &BucketDraws) {
        let taxable_before = self.taxable;
        self.cash = (self.cash - draws.cash).max(0.0);
        self.tax_deferred = (self.tax_deferred - draws.tax_deferred).max(0.0);
        self.tax_free = (self.tax_free - draws.tax_free).max(0.0);
        self.taxable = (self.taxable - draws.taxable).max(0.0);
        if taxable_before > 0.0 {
            let sold_share = (draws.taxable / taxable_before).clamp(0.0, 1.0);
            self.taxable_basis *= 1.0 - sold_share;
        }
        self.taxable_basis = self.taxable_basis.clamp(0.0, self.taxable);
    }

    /// Compounds invested buckets at `invested_return` and cash at `cash_return`.
    pub fn grow(&mut self, invested_return: f64, cash_return: f64) {
        self.tax_deferred = (self.tax_deferred * (1.0 + invested_return)).max(0.0);
        self.tax_free = (self.tax_free * (1.0 + invested_return)).max(0.0);
        self.taxable = (self.taxable * (1.0 + invested_return)).max(0.0);
        self.cash = (self.cash * (1.0 + cash_return)).max(0.0);
        self.taxable_basis = self.taxable_basis.min(self.taxable);
    }

    pub fn clear(&mut self) {
        *self = AssetBuckets::default();
    }
}

/// How pre-retirement savings are split across buckets.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BucketWeights {
    pub tax_deferred: f64,
    pub tax_free: f64,
    pub taxable: f64,
    pub cash: f64,
}

impl Default for BucketWeights {
    fn default() -> Self {
        Self {
            tax_deferred: 0.5,
            tax_free: 0.2,
            taxable: 0.3,
            cash: 0.0,
        }
    }
}

impl BucketWeights {
    pub fn normalized(&self) -> Self {
        let parts = [
            self.tax_deferred.max(0.0),
            self.tax_free.max(0.0),
            self.taxable.max(0.0),
            self.cash.max(0.0),
        ];
        let sum: f64 = parts.iter().sum();
        if sum <= 1e-12 {
            return Self {
                tax_deferred: 1.0,
                tax_free: 0.0,
                taxable: 0.0,
                cash: 0.0,
            };
        }
        Self {
            tax_deferred: parts[0] / sum,
            tax_free: parts[1] / sum,
            taxable: parts[2] / sum,
            cash: parts[3] / sum,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SocialSecurity {
    pub annual_amount: f64,
    pub claim_age: u32,
    pub cola: bool,
}

impl Default for SocialSecurity {
    fn default() -> Self {
        Self {
            annual_amount: 0.0,
            claim_age: 67,
            cola: true,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Pension {
    pub annual_amount: f64,
    pub start_age: u32,
    pub cola: bool,
}

impl Default for Pension {
    fn default() -> Self {
        Self {
            annual_amount: 0.0,
            start_age: 65,
            cola: false,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PartTimeIncome {
    pub annual_amount: f64,
    pub start_age: u32,
    pub end_age: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GuaranteedIncome {
    pub social_security: SocialSecurity,
    pub pension: Pension,
    pub part_time: PartTimeIncome,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct InflationRates {
    pub general: f64,
    pub healthcare: f64,
    pub social_security_cola: f64,
}

impl Default for InflationRates {
    fn default() -> Self {
        Self {
            general: 0.025,
            healthcare: 0.05,
            social_security_cola: 0.025,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GuardrailConfig {
    /// Cut spending once the withdrawal rate exceeds the initial rate by this fraction.
    pub upper_band: f64,
    /// Raise spending once the withdrawal rate falls below the initial rate by this fraction.
    pub lower_band: f64,
    pub cut: f64,
    pub raise: f64,
    /// No capital-preservation cuts when fewer years than this remain.
    pub preservation_sunset_years: u32,
}

impl Default for GuardrailConfig {
    fn default() -> Self {
        Self {
            upper_band: 0.20,
            lower_band: 0.20,
            cut: 0.10,
            raise: 0.10,
            preservation_sunset_years: 15,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum WithdrawalPolicy {
    /// Gross withdrawal fixed at `rate` times the balance at the start of retirement, held
    /// constant in real terms.
    FixedPercentage { rate: f64 },
    /// Withdraw whatever the after-tax spending need requires.
    SpendingTarget,
    Guardrails(GuardrailConfig),
}

impl Default for WithdrawalPolicy {
    fn default() -> Self {
        WithdrawalPolicy::FixedPercentage { rate: 0.04 }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TaxProfile {
    pub filing_status: FilingStatus,
    /// Two-letter state code.
    pub state: String,
    pub state_rate_override: Option<f64>,
    /// Multiplier on every statutory rate; resulting rates are capped.
    pub rate_multiplier: f64,
}

impl Default for TaxProfile {
    fn default() -> Self {
        Self {
            filing_status: FilingStatus::Single,
            state: "FL".to_string(),
            state_rate_override: None,
            rate_multiplier: 1.0,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum LongevityModel {
    #[default]
    Fixed,
    /// Horizon drawn per scenario from a normal around life expectancy.
    Stochastic { std_dev_years: f64, max_age: u32 },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpouseProfile {
    pub current_age: u32,
    pub life_expectancy: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SimulationParams {
    pub current_age: u32,
    pub retirement_age: u32,
    pub life_expectancy: u32,
    pub spouse: Option<SpouseProfile>,
    pub buckets: AssetBuckets,
    pub annual_savings: f64,
    pub savings_split: BucketWeights,
    /// Real after-tax spending, excluding healthcare.
    pub annual_spending: f64,
    /// Real healthcare spending, grown at healthcare inflation.
    pub annual_healthcare_cost: f64,
    pub guaranteed_income: GuaranteedIncome,
    pub return_source: ReturnSource,
    pub return_distribution: ReturnDistribution,
    /// Nominal yield on the cash bucket.
    pub cash_yield: f64,
    pub inflation: InflationRates,
    pub withdrawal_policy: WithdrawalPolicy,
    pub withdrawal_order: WithdrawalOrder,
    pub tax: TaxProfile,
    pub legacy_goal: Option<f64>,
    pub longevity: LongevityModel,
    /// Nominal return forced on the first retirement year.
    pub first_retirement_year_return: Option<f64>,
    pub seed: Option<u64>,
    pub sampling: SamplingMode,
    pub dollar_mode: DollarMode,
}

impl Default for SimulationParams {
    fn default() -> Self {
        Self {
            current_age: 45,
            retirement_age: 65,
            life_expectancy: 90,
            spouse: None,
            buckets: AssetBuckets {
                tax_deferred: 300_000.0,
                tax_free: 50_000.0,
                taxable: 100_000.0,
                taxable_basis: 70_000.0,
                cash: 50_000.0,
            },
            annual_savings: 10_000.0,
            savings_split: BucketWeights::default(),
            annual_spending: 72_000.0,
            annual_healthcare_cost: 8_000.0,
            guaranteed_income: GuaranteedIncome {
                social_security: SocialSecurity {
                    annual_amount: 30_000.0,
                    claim_age: 67,
                    cola: true,
                },
                ..GuaranteedIncome::default()
            },
            return_source: ReturnSource::default(),
            return_distribution: ReturnDistribution::Normal,
            cash_yield: 0.03,
            inflation: InflationRates::default(),
            withdrawal_policy: WithdrawalPolicy::default(),
            withdrawal_order: WithdrawalOrder::TaxEfficient,
            tax: TaxProfile::default(),
            legacy_goal: None,
            longevity: LongevityModel::Fixed,
            first_retirement_year_return: None,
            seed: None,
            sampling: SamplingMode::PseudoRandom,
            dollar_mode: DollarMode::Real,
        }
    }
}

impl SimulationParams {
    /// Planning horizon on the primary's age scale: the later of the two life expectancies.
    pub fn planned_horizon_age(&self) -> u32 {
        let own = self.life_expectancy;
        match &self.spouse {
            Some(spouse) => {
                let spouse_years_left = spouse.life_expectancy.saturating_sub(spouse.current_age);
                own.max(self.current_age + spouse_years_left)
            }
            None => own,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    Accumulation,
    RetirementActive,
    Depleted,
    HorizonEnd,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GuardrailTag {
    CapitalPreservation,
    Prosperity,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BucketDraws {
    pub cash: f64,
    pub taxable: f64,
    pub tax_deferred: f64,
    pub tax_free: f64,
}

impl BucketDraws {
    pub fn total(&self) -> f64 {
        self.cash + self.taxable + self.tax_deferred + self.tax_free
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaxBreakdown {
    pub federal: f64,
    pub capital_gains: f64,
    pub state: f64,
}

impl TaxBreakdown {
    pub fn total(&self) -> f64 {
        self.federal + self.capital_gains + self.state
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct YearlyCashFlow {
    pub year_index: u32,
    pub age: u32,
    pub phase: Phase,
    pub start_balance: f64,
    pub end_balance: f64,
    pub contributions: f64,
    pub gross_withdrawal: f64,
    pub draws: BucketDraws,
    pub taxes: TaxBreakdown,
    pub guaranteed_income: f64,
    pub spending_need: f64,
    /// Guaranteed income plus gross withdrawal, less taxes.
    pub net_spendable: f64,
    /// Contributions less gross withdrawal.
    pub net_cash_flow: f64,
    pub market_return: f64,
    pub guardrail: Option<GuardrailTag>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioOutcome {
    pub years: Vec<YearlyCashFlow>,
    pub success: bool,
    pub ending_balance: f64,
    pub depletion_age: Option<u32>,
    pub terminal_phase: Phase,
    pub guardrail_adjustments: u32,
    pub dollar_mode: DollarMode,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EndingBalanceSummary {
    pub p10: f64,
    pub p50: f64,
    pub p90: f64,
    pub mean: f64,
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BandYear {
    pub year_index: u32,
    pub age: u32,
    pub p05: f64,
    pub p25: f64,
    pub p50: f64,
    pub p75: f64,
    pub p95: f64,
    pub scenarios: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PercentileBands {
    pub years: Vec<BandYear>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateResult {
    pub runs: u64,
    pub success_probability: f64,
    pub ending_balance: EndingBalanceSummary,
    pub bands: Option<PercentileBands>,
    pub dollar_mode: DollarMode,
    pub model_version: String,
}
