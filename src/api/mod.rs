use axum::{
    Router,
    extract::Json,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use clap::{Args, Parser, Subcommand, ValueEnum};
use log::{error, info};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tokio::net::TcpListener;

use crate::core::{
    AssetBuckets, CrashTiming, DollarMode, FilingStatus, GuaranteedIncome, GuardrailConfig,
    InflationRates, LongevityModel, MODEL_VERSION, MergeStrategy, PartTimeIncome, Pension,
    PoolConfig, ReturnDistribution, ReturnGenerator, ReturnSource, RunConfig, SamplingMode,
    ShockKind, ShockSpec, SimulationParams, SocialSecurity, SpouseProfile, StressRequest,
    TaxProfile, WithdrawalOrder, WithdrawalPolicy, run_simulation, run_stress_test, sanitize,
    simulate_scenario,
};

/// Upper bound on runs accepted from callers.
pub const MAX_RUNS: u32 = 100_000;

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CliWithdrawalOrder {
    TaxEfficient,
    DeferredFirst,
    ProRata,
}

impl From<CliWithdrawalOrder> for WithdrawalOrder {
    fn from(value: CliWithdrawalOrder) -> Self {
        match value {
            CliWithdrawalOrder::TaxEfficient => WithdrawalOrder::TaxEfficient,
            CliWithdrawalOrder::DeferredFirst => WithdrawalOrder::DeferredFirst,
            CliWithdrawalOrder::ProRata => WithdrawalOrder::ProRata,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CliWithdrawalPolicy {
    #[serde(alias = "fixed-percentage")]
    Fixed,
    SpendingTarget,
    Guardrails,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CliFilingStatus {
    Single,
    #[serde(alias = "married-filing-jointly")]
    Joint,
}

impl From<CliFilingStatus> for FilingStatus {
    fn from(value: CliFilingStatus) -> Self {
        match value {
            CliFilingStatus::Single => FilingStatus::Single,
            CliFilingStatus::Joint => FilingStatus::MarriedFilingJointly,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum CliShockKind {
    MarketCrash,
    InflationSpike,
    Longevity,
    HealthcareCost,
    SocialSecurityCut,
    TaxIncrease,
    ReturnReduction,
    EarlyRetirement,
}

impl From<CliShockKind> for ShockKind {
    fn from(value: CliShockKind) -> Self {
        match value {
            CliShockKind::MarketCrash => ShockKind::MarketCrash,
            CliShockKind::InflationSpike => ShockKind::InflationSpike,
            CliShockKind::Longevity => ShockKind::Longevity,
            CliShockKind::HealthcareCost => ShockKind::HealthcareCost,
            CliShockKind::SocialSecurityCut => ShockKind::SocialSecurityCut,
            CliShockKind::TaxIncrease => ShockKind::TaxIncrease,
            CliShockKind::ReturnReduction => ShockKind::ReturnReduction,
            CliShockKind::EarlyRetirement => ShockKind::EarlyRetirement,
        }
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "nestegg",
    about = "Household retirement Monte Carlo (tax-aware withdrawals, guardrails, stress tests)"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Serve the JSON API
    Serve {
        #[arg(long, default_value_t = 8080)]
        port: u16,
    },
    /// Run the Monte Carlo and print the aggregate as JSON
    Simulate(PlanArgs),
    /// Print the year-by-year trace of a single scenario
    Trace {
        #[command(flatten)]
        plan: PlanArgs,
        #[arg(long, default_value_t = 0, help = "Scenario index in the run order")]
        scenario: u64,
    },
    /// Run the baseline, each shock alone, and the shocks combined
    Stress {
        #[command(flatten)]
        plan: PlanArgs,
        #[arg(
            long = "shock",
            value_parser = parse_shock,
            help = "kind=magnitude, e.g. market-crash=0.3; append @retirement to delay a crash"
        )]
        shocks: Vec<ShockSpec>,
        #[arg(long, help = "Skip the combined-shock run")]
        no_combined: bool,
    },
}

#[derive(Args, Debug, Clone)]
pub struct PlanArgs {
    #[arg(long, default_value_t = 45)]
    pub current_age: u32,
    #[arg(long, default_value_t = 65)]
    pub retirement_age: u32,
    #[arg(long, default_value_t = 90)]
    pub life_expectancy: u32,
    #[arg(long)]
    pub spouse_age: Option<u32>,
    #[arg(long)]
    pub spouse_life_expectancy: Option<u32>,
    #[arg(
        long,
        help = "Standard deviation of the lifespan in years; enables stochastic longevity"
    )]
    pub longevity_std_dev: Option<f64>,
    #[arg(long, default_value_t = 105)]
    pub longevity_max_age: u32,

    #[arg(long, default_value_t = 300_000.0, help = "401(k)/traditional IRA balance")]
    pub tax_deferred: f64,
    #[arg(long, default_value_t = 50_000.0, help = "Roth balance")]
    pub tax_free: f64,
    #[arg(long, default_value_t = 100_000.0, help = "Brokerage balance")]
    pub taxable: f64,
    #[arg(long, help = "Brokerage cost basis; defaults to the balance")]
    pub taxable_basis: Option<f64>,
    #[arg(long, default_value_t = 50_000.0)]
    pub cash: f64,
    #[arg(long, default_value_t = 10_000.0)]
    pub annual_savings: f64,

    #[arg(long, default_value_t = 72_000.0, help = "After-tax spending excluding healthcare")]
    pub annual_spending: f64,
    #[arg(long, default_value_t = 8_000.0)]
    pub healthcare_cost: f64,
    #[arg(long, default_value_t = 30_000.0)]
    pub social_security: f64,
    #[arg(long, default_value_t = 67)]
    pub social_security_age: u32,
    #[arg(long)]
    pub no_social_security_cola: bool,
    #[arg(long, default_value_t = 0.0)]
    pub pension: f64,
    #[arg(long, default_value_t = 65)]
    pub pension_start_age: u32,
    #[arg(long)]
    pub pension_cola: bool,
    #[arg(long, default_value_t = 0.0, help = "Part-time income from retirement onwards")]
    pub part_time_income: f64,
    #[arg(long, default_value_t = 0, help = "Last age with part-time income")]
    pub part_time_end_age: u32,

    #[arg(long, default_value_t = 7.0, help = "Expected nominal annual return in percent")]
    pub expected_return: f64,
    #[arg(long, default_value_t = 15.0, help = "Annual return volatility in percent")]
    pub volatility: f64,
    #[arg(long, help = "Draw log-normal instead of normal returns")]
    pub lognormal: bool,
    #[arg(long, default_value_t = 3.0, help = "Cash bucket yield in percent")]
    pub cash_yield: f64,
    #[arg(long, default_value_t = 2.5, help = "General inflation in percent")]
    pub inflation: f64,
    #[arg(long, default_value_t = 5.0, help = "Healthcare inflation in percent")]
    pub healthcare_inflation: f64,

    #[arg(long, value_enum, default_value_t = CliWithdrawalPolicy::Fixed)]
    pub withdrawal_policy: CliWithdrawalPolicy,
    #[arg(long, default_value_t = 4.0, help = "Fixed withdrawal rate in percent")]
    pub withdrawal_rate: f64,
    #[arg(long, default_value_t = 20.0, help = "Guardrail band in percent of the initial rate")]
    pub guardrail_band: f64,
    #[arg(long, default_value_t = 10.0, help = "Guardrail cut/raise in percent")]
    pub guardrail_adjustment: f64,
    #[arg(long, value_enum, default_value_t = CliWithdrawalOrder::TaxEfficient)]
    pub withdrawal_order: CliWithdrawalOrder,

    #[arg(long, value_enum, default_value_t = CliFilingStatus::Single)]
    pub filing_status: CliFilingStatus,
    #[arg(long, default_value = "FL", help = "Two-letter state code")]
    pub state: String,
    #[arg(long, help = "State income tax rate in percent, overriding the built-in table")]
    pub state_rate: Option<f64>,

    #[arg(long)]
    pub legacy_goal: Option<f64>,
    #[arg(long, help = "Count ending below the legacy goal as failure")]
    pub include_legacy_goal: bool,

    #[arg(long, default_value_t = 5_000)]
    pub runs: u32,
    #[arg(long)]
    pub seed: Option<u64>,
    #[arg(long)]
    pub antithetic: bool,
    #[arg(long, help = "Report nominal instead of today's dollars")]
    pub nominal: bool,
    #[arg(long, help = "Collect percentile bands")]
    pub bands: bool,
    #[arg(long, help = "Merge bands from per-worker markers instead of raw values")]
    pub marker_merge: bool,
    #[arg(long, default_value_t = 8)]
    pub max_workers: usize,
    #[arg(
        long,
        help = "JSON file with full simulation params; replaces the household flags above"
    )]
    pub params_file: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct SimulatePayload {
    current_age: Option<u32>,
    retirement_age: Option<u32>,
    life_expectancy: Option<u32>,
    spouse_age: Option<u32>,
    spouse_life_expectancy: Option<u32>,
    longevity_std_dev: Option<f64>,
    longevity_max_age: Option<u32>,

    tax_deferred: Option<f64>,
    tax_free: Option<f64>,
    taxable: Option<f64>,
    taxable_basis: Option<f64>,
    cash: Option<f64>,
    annual_savings: Option<f64>,

    annual_spending: Option<f64>,
    healthcare_cost: Option<f64>,
    social_security: Option<f64>,
    social_security_age: Option<u32>,
    social_security_cola: Option<bool>,
    pension: Option<f64>,
    pension_start_age: Option<u32>,
    pension_cola: Option<bool>,
    part_time_income: Option<f64>,
    part_time_end_age: Option<u32>,

    expected_return: Option<f64>,
    volatility: Option<f64>,
    lognormal: Option<bool>,
    cash_yield: Option<f64>,
    inflation: Option<f64>,
    healthcare_inflation: Option<f64>,

    withdrawal_policy: Option<CliWithdrawalPolicy>,
    withdrawal_rate: Option<f64>,
    guardrail_band: Option<f64>,
    guardrail_adjustment: Option<f64>,
    withdrawal_order: Option<CliWithdrawalOrder>,

    filing_status: Option<CliFilingStatus>,
    state: Option<String>,
    state_rate: Option<f64>,

    legacy_goal: Option<f64>,
    include_legacy_goal_in_success: Option<bool>,

    runs: Option<u32>,
    seed: Option<u64>,
    antithetic: Option<bool>,
    nominal: Option<bool>,
    bands: Option<bool>,
    marker_merge: Option<bool>,
    max_workers: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct StressPayload {
    #[serde(flatten)]
    plan: SimulatePayload,
    shocks: Vec<ShockSpec>,
    include_combined: Option<bool>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    model_version: &'static str,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

fn percent(value: f64, flag: &str) -> Result<f64, String> {
    if !value.is_finite() {
        return Err(format!("{flag} must be a finite number"));
    }
    Ok(value / 100.0)
}

fn non_negative(value: f64, flag: &str) -> Result<f64, String> {
    if !value.is_finite() || value < 0.0 {
        return Err(format!("{flag} must be >= 0"));
    }
    Ok(value)
}

fn build_plan(args: PlanArgs) -> Result<(SimulationParams, RunConfig), String> {
    if args.retirement_age < args.current_age {
        return Err("--retirement-age must be >= --current-age".to_string());
    }
    if args.life_expectancy < args.retirement_age {
        return Err("--life-expectancy must be >= --retirement-age".to_string());
    }
    if args.runs == 0 || args.runs > MAX_RUNS {
        return Err(format!("--runs must be between 1 and {MAX_RUNS}"));
    }
    if args.max_workers == 0 {
        return Err("--max-workers must be > 0".to_string());
    }

    let spouse = match (args.spouse_age, args.spouse_life_expectancy) {
        (Some(current_age), Some(life_expectancy)) => {
            if life_expectancy < current_age {
                return Err("--spouse-life-expectancy must be >= --spouse-age".to_string());
            }
            Some(SpouseProfile {
                current_age,
                life_expectancy,
            })
        }
        (None, None) => None,
        _ => {
            return Err(
                "--spouse-age and --spouse-life-expectancy must be given together".to_string(),
            );
        }
    };

    let taxable = non_negative(args.taxable, "--taxable")?;
    let taxable_basis = non_negative(args.taxable_basis.unwrap_or(taxable), "--taxable-basis")?;
    if taxable_basis > taxable {
        return Err("--taxable-basis must be <= --taxable".to_string());
    }

    let volatility = percent(args.volatility, "--volatility")?;
    if volatility < 0.0 {
        return Err("--volatility must be >= 0".to_string());
    }
    let withdrawal_rate = percent(args.withdrawal_rate, "--withdrawal-rate")?;
    if !(0.0..=1.0).contains(&withdrawal_rate) {
        return Err("--withdrawal-rate must be between 0 and 100".to_string());
    }
    let guardrail_band = percent(args.guardrail_band, "--guardrail-band")?;
    let guardrail_adjustment = percent(args.guardrail_adjustment, "--guardrail-adjustment")?;
    if !(0.0..1.0).contains(&guardrail_band) || !(0.0..1.0).contains(&guardrail_adjustment) {
        return Err(
            "--guardrail-band and --guardrail-adjustment must be between 0 and 100".to_string(),
        );
    }

    let withdrawal_policy = match args.withdrawal_policy {
        CliWithdrawalPolicy::Fixed => WithdrawalPolicy::FixedPercentage {
            rate: withdrawal_rate,
        },
        CliWithdrawalPolicy::SpendingTarget => WithdrawalPolicy::SpendingTarget,
        CliWithdrawalPolicy::Guardrails => WithdrawalPolicy::Guardrails(GuardrailConfig {
            upper_band: guardrail_band,
            lower_band: guardrail_band,
            cut: guardrail_adjustment,
            raise: guardrail_adjustment,
            ..GuardrailConfig::default()
        }),
    };

    let longevity = match args.longevity_std_dev {
        Some(std_dev_years) => {
            let std_dev_years = non_negative(std_dev_years, "--longevity-std-dev")?;
            if args.longevity_max_age < args.life_expectancy {
                return Err("--longevity-max-age must be >= --life-expectancy".to_string());
            }
            LongevityModel::Stochastic {
                std_dev_years,
                max_age: args.longevity_max_age,
            }
        }
        None => LongevityModel::Fixed,
    };

    let state_rate_override = args
        .state_rate
        .map(|rate| percent(rate, "--state-rate"))
        .transpose()?;

    let params = SimulationParams {
        current_age: args.current_age,
        retirement_age: args.retirement_age,
        life_expectancy: args.life_expectancy,
        spouse,
        buckets: AssetBuckets {
            tax_deferred: non_negative(args.tax_deferred, "--tax-deferred")?,
            tax_free: non_negative(args.tax_free, "--tax-free")?,
            taxable,
            taxable_basis,
            cash: non_negative(args.cash, "--cash")?,
        },
        annual_savings: non_negative(args.annual_savings, "--annual-savings")?,
        annual_spending: non_negative(args.annual_spending, "--annual-spending")?,
        annual_healthcare_cost: non_negative(args.healthcare_cost, "--healthcare-cost")?,
        guaranteed_income: GuaranteedIncome {
            social_security: SocialSecurity {
                annual_amount: non_negative(args.social_security, "--social-security")?,
                claim_age: args.social_security_age,
                cola: !args.no_social_security_cola,
            },
            pension: Pension {
                annual_amount: non_negative(args.pension, "--pension")?,
                start_age: args.pension_start_age,
                cola: args.pension_cola,
            },
            part_time: PartTimeIncome {
                annual_amount: non_negative(args.part_time_income, "--part-time-income")?,
                start_age: args.retirement_age,
                end_age: args.part_time_end_age,
            },
        },
        return_source: ReturnSource::Scalar {
            expected_return: percent(args.expected_return, "--expected-return")?,
            volatility,
        },
        return_distribution: if args.lognormal {
            ReturnDistribution::LogNormal
        } else {
            ReturnDistribution::Normal
        },
        cash_yield: percent(args.cash_yield, "--cash-yield")?,
        inflation: InflationRates {
            general: percent(args.inflation, "--inflation")?,
            healthcare: percent(args.healthcare_inflation, "--healthcare-inflation")?,
            social_security_cola: percent(args.inflation, "--inflation")?,
        },
        withdrawal_policy,
        withdrawal_order: args.withdrawal_order.into(),
        tax: TaxProfile {
            filing_status: args.filing_status.into(),
            state: args.state.trim().to_ascii_uppercase(),
            state_rate_override,
            rate_multiplier: 1.0,
        },
        legacy_goal: args
            .legacy_goal
            .map(|goal| non_negative(goal, "--legacy-goal"))
            .transpose()?,
        longevity,
        seed: args.seed,
        sampling: if args.antithetic {
            SamplingMode::Antithetic
        } else {
            SamplingMode::PseudoRandom
        },
        dollar_mode: if args.nominal {
            DollarMode::Nominal
        } else {
            DollarMode::Real
        },
        ..SimulationParams::default()
    };

    let params = match &args.params_file {
        Some(path) => read_params_file(path)?,
        None => params,
    };

    let mut config = RunConfig::new(args.runs, args.include_legacy_goal);
    if args.bands {
        let merge = if args.marker_merge {
            MergeStrategy::MarkerApproximation
        } else {
            MergeStrategy::Exact
        };
        config = config.with_bands(merge);
    }
    config.pool = PoolConfig {
        max_workers: args.max_workers,
    };

    Ok((params, config))
}

fn read_params_file(path: &Path) -> Result<SimulationParams, String> {
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("failed to read --params-file {}: {e}", path.display()))?;
    serde_json::from_str(&raw)
        .map_err(|e| format!("invalid --params-file {}: {e}", path.display()))
}

/// Parses `kind=magnitude`, optionally suffixed with `@retirement` for market crashes.
pub fn parse_shock(raw: &str) -> Result<ShockSpec, String> {
    let (kind, rest) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected kind=magnitude, got '{raw}'"))?;
    let (magnitude, at_retirement) = match rest.split_once('@') {
        Some((magnitude, "retirement")) => (magnitude, true),
        Some((_, other)) => return Err(format!("unknown shock timing '{other}'")),
        None => (rest, false),
    };
    let kind = CliShockKind::from_str(kind.trim(), true)?;
    let magnitude: f64 = magnitude
        .trim()
        .parse()
        .map_err(|e| format!("invalid shock magnitude '{magnitude}': {e}"))?;
    if !magnitude.is_finite() {
        return Err(format!("shock magnitude must be finite, got '{magnitude}'"));
    }
    if at_retirement && kind != CliShockKind::MarketCrash {
        return Err("@retirement only applies to market-crash".to_string());
    }

    let mut shock = ShockSpec::new(kind.into(), magnitude);
    if at_retirement {
        shock.crash_timing = CrashTiming::AtRetirement;
    }
    Ok(shock)
}

/// Runs a non-server command and returns its JSON output.
pub fn run_batch(command: Command) -> Result<String, String> {
    match command {
        Command::Serve { .. } => Err("serve is not a batch command".to_string()),
        Command::Simulate(plan) => {
            let (params, config) = build_plan(plan)?;
            let result = run_simulation(&params, &config).map_err(|e| e.to_string())?;
            to_json(&result)
        }
        Command::Trace { plan, scenario } => {
            let (params, config) = build_plan(plan)?;
            let params = sanitize(&params).params;
            let mut rng = ReturnGenerator::for_scenario(params.seed, scenario, params.sampling);
            let outcome =
                simulate_scenario(&params, &mut rng, config.include_legacy_goal_in_success);
            to_json(&outcome)
        }
        Command::Stress {
            plan,
            shocks,
            no_combined,
        } => {
            let (params, config) = build_plan(plan)?;
            let request = StressRequest {
                shocks,
                include_combined: !no_combined,
            };
            let report = run_stress_test(&params, &request, &config).map_err(|e| e.to_string())?;
            to_json(&report)
        }
    }
}

fn to_json<T: Serialize>(value: &T) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|e| format!("failed to encode output: {e}"))
}

pub fn router() -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/simulate", post(simulate_handler))
        .route("/api/stress", post(stress_handler))
        .fallback(not_found_handler)
}

pub async fn run_http_server(port: u16) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!("nestegg API listening on http://{addr}");

    axum::serve(listener, router()).await
}

async fn health_handler() -> Response {
    json_response(
        StatusCode::OK,
        HealthResponse {
            status: "ok",
            model_version: MODEL_VERSION,
        },
    )
}

async fn not_found_handler() -> Response {
    error_response(StatusCode::NOT_FOUND, "Not found")
}

async fn simulate_handler(Json(payload): Json<SimulatePayload>) -> Response {
    let (params, config) = match plan_from_payload(payload) {
        Ok(plan) => plan,
        Err(msg) => return error_response(StatusCode::BAD_REQUEST, &msg),
    };

    match tokio::task::spawn_blocking(move || run_simulation(&params, &config)).await {
        Ok(Ok(result)) => json_response(StatusCode::OK, result),
        Ok(Err(e)) => {
            error!("simulation failed: {e}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string())
        }
        Err(e) => {
            error!("simulation task aborted: {e}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "simulation task aborted")
        }
    }
}

async fn stress_handler(Json(payload): Json<StressPayload>) -> Response {
    let (params, config, request) = match stress_from_payload(payload) {
        Ok(plan) => plan,
        Err(msg) => return error_response(StatusCode::BAD_REQUEST, &msg),
    };

    match tokio::task::spawn_blocking(move || run_stress_test(&params, &request, &config)).await {
        Ok(Ok(report)) => json_response(StatusCode::OK, report),
        Ok(Err(e)) => {
            error!("stress test failed: {e}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string())
        }
        Err(e) => {
            error!("stress task aborted: {e}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "stress task aborted")
        }
    }
}

fn json_response<T: Serialize>(status: StatusCode, body: T) -> Response {
    let mut response = (status, Json(body)).into_response();
    response.headers_mut().insert(
        header::CACHE_CONTROL,
        header::HeaderValue::from_static("no-store"),
    );
    response
}

fn error_response(status: StatusCode, msg: &str) -> Response {
    json_response(
        status,
        ErrorResponse {
            error: msg.to_string(),
        },
    )
}

fn set<T>(slot: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *slot = value;
    }
}

fn set_some<T>(slot: &mut Option<T>, value: Option<T>) {
    if value.is_some() {
        *slot = value;
    }
}

fn plan_from_payload(payload: SimulatePayload) -> Result<(SimulationParams, RunConfig), String> {
    let Some(include_legacy_goal) = payload.include_legacy_goal_in_success else {
        return Err("includeLegacyGoalInSuccess is required".to_string());
    };

    let mut args = default_args();
    args.include_legacy_goal = include_legacy_goal;

    set(&mut args.current_age, payload.current_age);
    set(&mut args.retirement_age, payload.retirement_age);
    set(&mut args.life_expectancy, payload.life_expectancy);
    set_some(&mut args.spouse_age, payload.spouse_age);
    set_some(&mut args.spouse_life_expectancy, payload.spouse_life_expectancy);
    set_some(&mut args.longevity_std_dev, payload.longevity_std_dev);
    set(&mut args.longevity_max_age, payload.longevity_max_age);

    set(&mut args.tax_deferred, payload.tax_deferred);
    set(&mut args.tax_free, payload.tax_free);
    set(&mut args.taxable, payload.taxable);
    set_some(&mut args.taxable_basis, payload.taxable_basis);
    set(&mut args.cash, payload.cash);
    set(&mut args.annual_savings, payload.annual_savings);

    set(&mut args.annual_spending, payload.annual_spending);
    set(&mut args.healthcare_cost, payload.healthcare_cost);
    set(&mut args.social_security, payload.social_security);
    set(&mut args.social_security_age, payload.social_security_age);
    if let Some(cola) = payload.social_security_cola {
        args.no_social_security_cola = !cola;
    }
    set(&mut args.pension, payload.pension);
    set(&mut args.pension_start_age, payload.pension_start_age);
    set(&mut args.pension_cola, payload.pension_cola);
    set(&mut args.part_time_income, payload.part_time_income);
    set(&mut args.part_time_end_age, payload.part_time_end_age);

    set(&mut args.expected_return, payload.expected_return);
    set(&mut args.volatility, payload.volatility);
    set(&mut args.lognormal, payload.lognormal);
    set(&mut args.cash_yield, payload.cash_yield);
    set(&mut args.inflation, payload.inflation);
    set(&mut args.healthcare_inflation, payload.healthcare_inflation);

    set(&mut args.withdrawal_policy, payload.withdrawal_policy);
    set(&mut args.withdrawal_rate, payload.withdrawal_rate);
    set(&mut args.guardrail_band, payload.guardrail_band);
    set(&mut args.guardrail_adjustment, payload.guardrail_adjustment);
    set(&mut args.withdrawal_order, payload.withdrawal_order);

    set(&mut args.filing_status, payload.filing_status);
    set(&mut args.state, payload.state);
    set_some(&mut args.state_rate, payload.state_rate);

    set_some(&mut args.legacy_goal, payload.legacy_goal);

    set(&mut args.runs, payload.runs);
    set_some(&mut args.seed, payload.seed);
    set(&mut args.antithetic, payload.antithetic);
    set(&mut args.nominal, payload.nominal);
    set(&mut args.bands, payload.bands);
    set(&mut args.marker_merge, payload.marker_merge);
    set(&mut args.max_workers, payload.max_workers);

    build_plan(args)
}

fn stress_from_payload(
    payload: StressPayload,
) -> Result<(SimulationParams, RunConfig, StressRequest), String> {
    if payload.shocks.is_empty() {
        return Err("shocks must list at least one shock".to_string());
    }
    if let Some(bad) = payload.shocks.iter().find(|s| !s.magnitude.is_finite()) {
        return Err(format!("shock {:?} has a non-finite magnitude", bad.kind));
    }
    let (params, config) = plan_from_payload(payload.plan)?;
    let request = StressRequest {
        shocks: payload.shocks,
        include_combined: payload.include_combined.unwrap_or(true),
    };
    Ok((params, config, request))
}

fn default_args() -> PlanArgs {
    PlanArgs {
        current_age: 45,
        retirement_age: 65,
        life_expectancy: 90,
        spouse_age: None,
        spouse_life_expectancy: None,
        longevity_std_dev: None,
        longevity_max_age: 105,
        tax_deferred: 300_000.0,
        tax_free: 50_000.0,
        taxable: 100_000.0,
        taxable_basis: None,
        cash: 50_000.0,
        annual_savings: 10_000.0,
        annual_spending: 72_000.0,
        healthcare_cost: 8_000.0,
        social_security: 30_000.0,
        social_security_age: 67,
        no_social_security_cola: false,
        pension: 0.0,
        pension_start_age: 65,
        pension_cola: false,
        part_time_income: 0.0,
        part_time_end_age: 0,
        expected_return: 7.0,
        volatility: 15.0,
        lognormal: false,
        cash_yield: 3.0,
        inflation: 2.5,
        healthcare_inflation: 5.0,
        withdrawal_policy: CliWithdrawalPolicy::Fixed,
        withdrawal_rate: 4.0,
        guardrail_band: 20.0,
        guardrail_adjustment: 10.0,
        withdrawal_order: CliWithdrawalOrder::TaxEfficient,
        filing_status: CliFilingStatus::Single,
        state: "FL".to_string(),
        state_rate: None,
        legacy_goal: None,
        include_legacy_goal: false,
        runs: 5_000,
        seed: None,
        antithetic: false,
        nominal: false,
        bands: false,
        marker_merge: false,
        max_workers: 8,
        params_file: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 1e-9;

    fn assert_approx(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() <= EPS,
            "expected {expected}, got {actual}"
        );
    }

    fn payload_from_json(json: &str) -> Result<(SimulationParams, RunConfig), String> {
        let payload = serde_json::from_str::<SimulatePayload>(json)
            .map_err(|e| format!("Invalid API JSON payload: {e}"))?;
        plan_from_payload(payload)
    }

    #[test]
    fn cli_defaults_match_api_defaults() {
        let cli = Cli::try_parse_from(["nestegg", "simulate"]).expect("defaults parse");
        let Command::Simulate(args) = cli.command else {
            panic!("simulate subcommand expected");
        };
        let (from_cli, _) = build_plan(args).expect("valid");
        let (from_api, _) = build_plan(default_args()).expect("valid");
        assert_eq!(from_cli, from_api);
    }

    #[test]
    fn default_plan_matches_engine_defaults() {
        let (params, config) = build_plan(default_args()).expect("valid");
        let mut expected = SimulationParams::default();
        expected.buckets.taxable_basis = expected.buckets.taxable;
        expected.guaranteed_income.part_time.start_age = expected.retirement_age;
        assert_eq!(params, expected);
        assert_eq!(config.runs, 5_000);
        assert!(!config.include_legacy_goal_in_success);
    }

    #[test]
    fn build_plan_converts_percent_flags() {
        let mut args = default_args();
        args.expected_return = 6.0;
        args.state_rate = Some(4.5);
        args.state = " ca ".to_string();
        let (params, _) = build_plan(args).expect("valid");
        assert!(matches!(
            params.return_source,
            ReturnSource::Scalar { expected_return, .. } if (expected_return - 0.06).abs() < EPS
        ));
        assert_eq!(params.tax.state, "CA");
        assert_approx(params.tax.state_rate_override.unwrap_or_default(), 0.045);
    }

    #[test]
    fn build_plan_rejects_retirement_before_current_age() {
        let mut args = default_args();
        args.retirement_age = 40;
        let err = build_plan(args).expect_err("must reject");
        assert!(err.contains("--retirement-age"));
    }

    #[test]
    fn build_plan_rejects_half_a_spouse() {
        let mut args = default_args();
        args.spouse_age = Some(50);
        let err = build_plan(args).expect_err("must reject");
        assert!(err.contains("--spouse-life-expectancy"));
    }

    #[test]
    fn build_plan_rejects_basis_above_balance() {
        let mut args = default_args();
        args.taxable_basis = Some(args.taxable + 1.0);
        let err = build_plan(args).expect_err("must reject");
        assert!(err.contains("--taxable-basis"));
    }

    #[test]
    fn payload_requires_legacy_flag() {
        let err = payload_from_json(r#"{"currentAge": 50}"#).expect_err("flag is required");
        assert!(err.contains("includeLegacyGoalInSuccess"));
    }

    #[test]
    fn payload_overrides_defaults() {
        let (params, config) = payload_from_json(
            r#"{
              "includeLegacyGoalInSuccess": true,
              "currentAge": 50,
              "withdrawalPolicy": "guardrails",
              "withdrawalOrder": "pro-rata",
              "filingStatus": "joint",
              "spouseAge": 48,
              "spouseLifeExpectancy": 94,
              "legacyGoal": 100000,
              "bands": true,
              "markerMerge": true,
              "runs": 250
            }"#,
        )
        .expect("json should parse");
        assert_eq!(params.current_age, 50);
        assert!(matches!(params.withdrawal_policy, WithdrawalPolicy::Guardrails(_)));
        assert_eq!(params.withdrawal_order, WithdrawalOrder::ProRata);
        assert_eq!(params.tax.filing_status, FilingStatus::MarriedFilingJointly);
        assert_eq!(params.planned_horizon_age(), 96);
        assert_eq!(params.legacy_goal, Some(100_000.0));
        assert!(config.include_legacy_goal_in_success);
        assert!(config.collect_bands);
        assert_eq!(config.merge, MergeStrategy::MarkerApproximation);
        assert_eq!(config.runs, 250);
    }

    #[test]
    fn payload_rejects_excessive_runs() {
        let err = payload_from_json(r#"{"includeLegacyGoalInSuccess": false, "runs": 1000000}"#)
            .expect_err("must reject");
        assert!(err.contains("--runs"));
    }

    #[test]
    fn stress_payload_parses_shocks() {
        let payload = serde_json::from_str::<StressPayload>(
            r#"{
              "includeLegacyGoalInSuccess": false,
              "shocks": [
                {"kind": "market-crash", "magnitude": 0.3, "crashTiming": "at-retirement"},
                {"kind": "social-security-cut", "magnitude": 0.2, "enabled": false}
              ]
            }"#,
        )
        .expect("json should parse");
        let (_, _, request) = stress_from_payload(payload).expect("valid");
        assert_eq!(request.shocks.len(), 2);
        assert_eq!(request.shocks[0].crash_timing, CrashTiming::AtRetirement);
        assert!(!request.shocks[1].enabled);
        assert!(request.include_combined);
    }

    #[test]
    fn parse_shock_reads_kind_magnitude_and_timing() {
        let crash = parse_shock("market-crash=0.3@retirement").expect("valid");
        assert_eq!(crash.kind, ShockKind::MarketCrash);
        assert_eq!(crash.crash_timing, CrashTiming::AtRetirement);
        assert_approx(crash.magnitude, 0.3);

        let early = parse_shock("early-retirement=-2").expect("valid");
        assert_eq!(early.kind, ShockKind::EarlyRetirement);
        assert_approx(early.magnitude, -2.0);

        assert!(parse_shock("inflation-spike").is_err());
        assert!(parse_shock("tax-increase=0.1@retirement").is_err());
        assert!(parse_shock("meteor=1").is_err());
    }

    #[test]
    fn batch_simulate_emits_camel_case_json() {
        let cli = Cli::try_parse_from([
            "nestegg", "simulate", "--runs", "40", "--seed", "9", "--bands",
        ])
        .expect("args parse");
        let json = run_batch(cli.command).expect("simulation runs");
        assert!(json.contains("\"successProbability\""));
        assert!(json.contains("\"modelVersion\""));
        assert!(json.contains("\"p95\""));
    }

    #[test]
    fn params_file_replaces_household_flags() {
        let path = std::env::temp_dir().join(format!("nestegg-params-{}.json", std::process::id()));
        fs::write(&path, r#"{"currentAge": 60, "retirementAge": 60, "lifeExpectancy": 85}"#)
            .expect("write params file");
        let mut args = default_args();
        args.params_file = Some(path.clone());
        let result = build_plan(args);
        let _ = fs::remove_file(&path);
        let (params, _) = result.expect("valid");
        assert_eq!(params.current_age, 60);
        assert_eq!(params.life_expectancy, 85);
        assert_eq!(params.buckets, SimulationParams::default().buckets);
    }

    #[test]
    fn missing_params_file_is_reported() {
        let mut args = default_args();
        args.params_file = Some(PathBuf::from("/nonexistent/nestegg/params.json"));
        let err = build_plan(args).expect_err("must fail");
        assert!(err.contains("--params-file"));
    }

    #[test]
    fn batch_trace_repairs_degenerate_params_file() {
        let path = std::env::temp_dir().join(format!("nestegg-trace-{}.json", std::process::id()));
        let raw = r#"{
            "currentAge": 70,
            "retirementAge": 60,
            "buckets": {"cash": -50000, "taxable": 1000, "taxableBasis": 5000},
            "withdrawalPolicy": {"kind": "fixed-percentage", "rate": 5.0}
        }"#;
        fs::write(&path, raw).expect("write params file");
        let cli = Cli::try_parse_from([
            "nestegg",
            "trace",
            "--params-file",
            path.to_str().expect("utf-8 temp path"),
        ])
        .expect("args parse");
        let result = run_batch(cli.command);
        let _ = fs::remove_file(&path);
        let json = result.expect("trace runs");
        let value: serde_json::Value = serde_json::from_str(&json).expect("valid json");
        let years = value["years"].as_array().expect("years array");
        assert_eq!(years.len(), 90 - 70 + 1);
        assert_eq!(years[0]["age"].as_u64(), Some(70));
        for year in years {
            let start = year["startBalance"].as_f64().expect("start balance");
            let end = year["endBalance"].as_f64().expect("end balance");
            assert!(start >= 0.0 && end >= 0.0, "negative balance in {year}");
            let gross = year["grossWithdrawal"].as_f64().expect("gross withdrawal");
            assert!(gross <= start + 1e-9);
        }
    }

    #[test]
    fn batch_trace_emits_one_row_per_year() {
        let cli = Cli::try_parse_from([
            "nestegg",
            "trace",
            "--current-age",
            "60",
            "--retirement-age",
            "62",
            "--life-expectancy",
            "70",
            "--runs",
            "1",
        ])
        .expect("args parse");
        let json = run_batch(cli.command).expect("trace runs");
        let value: serde_json::Value = serde_json::from_str(&json).expect("valid json");
        assert_eq!(value["years"].as_array().map(Vec::len), Some(11));
    }
}
