mod aggregate;
mod engine;
mod error;
mod guardrails;
mod returns;
mod stats;
mod stress;
mod tax;
mod types;
mod validation;

pub use aggregate::{MergeStrategy, PoolConfig, RunConfig, run_simulation};
pub use engine::simulate_scenario;
pub use error::EngineError;
pub use returns::ReturnGenerator;
pub use stress::{
    CrashTiming, ShockKind, ShockSpec, StressReport, StressRequest, apply_shock, apply_shocks,
    run_stress_test,
};
pub use tax::state_rate;
pub use types::{
    AggregateResult, AssetBuckets, DollarMode, FilingStatus, GuaranteedIncome, GuardrailConfig,
    InflationRates, LongevityModel, MODEL_VERSION, PartTimeIncome, Pension, ReturnDistribution,
    ReturnSource, SamplingMode, ScenarioOutcome, SimulationParams, SocialSecurity, SpouseProfile,
    TaxProfile, WithdrawalOrder, WithdrawalPolicy,
};
pub use validation::{Correction, Sanitized, sanitize};
