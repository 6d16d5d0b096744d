use super::types::{GuardrailConfig, GuardrailTag};

#[derive(Copy, Clone, Debug)]
pub struct GuardrailInput {
    pub portfolio_value: f64,
    /// Spending need before any guardrail adjustment.
    pub base_need: f64,
    pub guaranteed_income: f64,
    pub years_remaining: u32,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct GuardrailDecision {
    pub spending_need: f64,
    pub spending_factor: f64,
    pub tag: Option<GuardrailTag>,
}

/// Guaranteed income moving by more than this share of base need re-bases the initial rate.
pub const INCOME_SHIFT_TOLERANCE: f64 = 0.02;

/// Carries the spending factor and the initial withdrawal rate across the retirement years of
/// one scenario.
#[derive(Clone, Debug)]
pub struct GuardrailAdjuster {
    config: GuardrailConfig,
    initial_rate: Option<f64>,
    income_share: f64,
    spending_factor: f64,
    adjustments: u32,
}

impl GuardrailAdjuster {
    pub fn new(config: GuardrailConfig) -> Self {
        Self {
            config,
            initial_rate: None,
            income_share: 0.0,
            spending_factor: 1.0,
            adjustments: 0,
        }
    }

    pub fn adjustments(&self) -> u32 {
        self.adjustments
    }

    /// The first call fixes the initial withdrawal rate and never adjusts. A step in guaranteed
    /// income (a claim starting, part-time work ending) re-bases the initial rate the same way.
    pub fn adjust(&mut self, input: GuardrailInput) -> GuardrailDecision {
        let current_rate = withdrawal_rate(
            input.base_need * self.spending_factor,
            input.guaranteed_income,
            input.portfolio_value,
        );
        let income_share = if input.base_need > 0.0 {
            input.guaranteed_income / input.base_need
        } else {
            0.0
        };
        let income_shifted = (income_share - self.income_share).abs() > INCOME_SHIFT_TOLERANCE;
        self.income_share = income_share;

        let initial = match self.initial_rate {
            Some(initial) if !income_shifted => initial,
            _ => {
                self.initial_rate = Some(current_rate);
                return self.decision(input.base_need, None);
            }
        };

        let mut tag = None;
        if initial > 0.0 && initial.is_finite() {
            let upper = initial * (1.0 + self.config.upper_band);
            let lower = initial * (1.0 - self.config.lower_band);
            let preserving = input.years_remaining >= self.config.preservation_sunset_years;
            if current_rate > upper && preserving {
                self.spending_factor *= 1.0 - self.config.cut;
                tag = Some(GuardrailTag::CapitalPreservation);
            } else if current_rate < lower {
                self.spending_factor *= 1.0 + self.config.raise;
                tag = Some(GuardrailTag::Prosperity);
            }
        }
        if tag.is_some() {
            self.adjustments += 1;
        }
        self.decision(input.base_need, tag)
    }

    fn decision(&self, base_need: f64, tag: Option<GuardrailTag>) -> GuardrailDecision {
        GuardrailDecision {
            spending_need: base_need * self.spending_factor,
            spending_factor: self.spending_factor,
            tag,
        }
    }
}

/// Share of the portfolio needed to fill the gap between spending and guaranteed income.
/// An empty portfolio reports an infinite rate when there is a gap to fill.
pub fn withdrawal_rate(need: f64, guaranteed_income: f64, portfolio_value: f64) -> f64 {
    let gap = (need - guaranteed_income).max(0.0);
    if portfolio_value <= 0.0 {
        return if gap > 0.0 { f64::INFINITY } else { 0.0 };
    }
    gap / portfolio_value
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::{prop_assert, proptest};

    fn input(portfolio_value: f64, years_remaining: u32) -> GuardrailInput {
        GuardrailInput {
            portfolio_value,
            base_need: 60_000.0,
            guaranteed_income: 20_000.0,
            years_remaining,
        }
    }

    #[test]
    fn first_year_sets_initial_rate_without_adjusting() {
        let mut adjuster = GuardrailAdjuster::new(GuardrailConfig::default());
        let decision = adjuster.adjust(input(1_000_000.0, 30));
        assert_eq!(decision.tag, None);
        assert_eq!(decision.spending_need, 60_000.0);
        assert_eq!(adjuster.adjustments(), 0);
    }

    #[test]
    fn falling_portfolio_triggers_preservation_cut() {
        let mut adjuster = GuardrailAdjuster::new(GuardrailConfig::default());
        adjuster.adjust(input(1_000_000.0, 30));
        let decision = adjuster.adjust(input(600_000.0, 29));
        assert_eq!(decision.tag, Some(GuardrailTag::CapitalPreservation));
        assert!((decision.spending_need - 54_000.0).abs() < 1e-9);
        assert_eq!(adjuster.adjustments(), 1);
    }

    #[test]
    fn preservation_is_skipped_near_the_horizon() {
        let mut adjuster = GuardrailAdjuster::new(GuardrailConfig::default());
        adjuster.adjust(input(1_000_000.0, 20));
        let decision = adjuster.adjust(input(600_000.0, 10));
        assert_eq!(decision.tag, None);
        assert_eq!(decision.spending_factor, 1.0);
    }

    #[test]
    fn rising_portfolio_triggers_prosperity_raise() {
        let mut adjuster = GuardrailAdjuster::new(GuardrailConfig::default());
        adjuster.adjust(input(1_000_000.0, 30));
        let decision = adjuster.adjust(input(1_500_000.0, 29));
        assert_eq!(decision.tag, Some(GuardrailTag::Prosperity));
        assert!((decision.spending_factor - 1.1).abs() < 1e-12);
    }

    #[test]
    fn income_onset_rebases_instead_of_raising() {
        let mut adjuster = GuardrailAdjuster::new(GuardrailConfig::default());
        let no_income = |portfolio_value| GuardrailInput {
            guaranteed_income: 0.0,
            ..input(portfolio_value, 30)
        };
        adjuster.adjust(no_income(1_000_000.0));
        adjuster.adjust(no_income(950_000.0));
        let onset = adjuster.adjust(input(900_000.0, 28));
        assert_eq!(onset.tag, None);
        assert_eq!(onset.spending_factor, 1.0);
        let steady = adjuster.adjust(input(880_000.0, 27));
        assert_eq!(steady.tag, None);
        assert_eq!(adjuster.adjustments(), 0);
    }

    #[test]
    fn empty_portfolio_with_gap_reads_as_infinite_rate() {
        assert!(withdrawal_rate(50_000.0, 10_000.0, 0.0).is_infinite());
        assert_eq!(withdrawal_rate(5_000.0, 10_000.0, 0.0), 0.0);
    }

    proptest! {
        #![proptest_config(proptest::test_runner::Config::with_cases(48))]

        #[test]
        fn prop_factor_stays_positive_and_counts_match_tags(
            values in proptest::collection::vec(50_000u32..3_000_000, 2..40)
        ) {
            let mut adjuster = GuardrailAdjuster::new(GuardrailConfig::default());
            let mut tagged = 0;
            for (i, value) in values.iter().enumerate() {
                let decision = adjuster.adjust(input(*value as f64, 40 - i as u32));
                if decision.tag.is_some() {
                    tagged += 1;
                }
                prop_assert!(decision.spending_factor > 0.0);
            }
            prop_assert!(adjuster.adjustments() == tagged);
        }
    }
}
