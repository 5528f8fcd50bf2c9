use super::defaults::TAX_FREE_FRACTION;
use super::growth::{grow_year, grow_year_with_ledger};
use super::income::{external_income_for_year, total_lump_sums};
use super::tax::calculate_tax;
use super::types::{
    ChartPoint, DrawdownInputs, ExternalIncomeStream, InflationAdjustment, PlanConfig,
    PotConfiguration, PotSplit, Projection, ProjectionTotals, YearLedger, YearProjection,
};

/// "2031/32" for the tax year starting April 2031.
pub fn tax_year_label(year: i32) -> String {
    format!("{year}/{:02}", (i64::from(year) + 1).rem_euclid(100))
}

/// Tax-free share is capped, then topped up with every stream's lump sum.
pub fn split_pots(pot: &PotConfiguration, streams: &[ExternalIncomeStream]) -> PotSplit {
    let capital = pot.capital.max(0.0);
    let capped = (capital * TAX_FREE_FRACTION).min(pot.tax_free_cap.max(0.0));
    PotSplit {
        tax_free: capped + total_lump_sums(streams),
        taxable: capital - capped,
    }
}

/// Discounts a nominal figure back to `reference_year` money. Years at or
/// before the reference are returned unchanged.
pub fn adjust_for_inflation(value: f64, year: i32, adjustment: InflationAdjustment) -> f64 {
    let years_from_reference = year.saturating_sub(adjustment.reference_year);
    if years_from_reference <= 0 {
        return value;
    }
    value / (1.0 + adjustment.rate).powi(years_from_reference)
}

impl YearProjection {
    pub fn in_real_terms(&self, adjustment: InflationAdjustment) -> YearProjection {
        let real = |value: f64| adjust_for_inflation(value, self.year, adjustment);
        let mut external_income = self.external_income.clone();
        for stream in &mut external_income.breakdown {
            stream.gross_income = real(stream.gross_income);
        }
        external_income.total = real(external_income.total);

        YearProjection {
            year: self.year,
            tax_year: self.tax_year.clone(),
            requested_tax_free: real(self.requested_tax_free),
            requested_taxable: real(self.requested_taxable),
            tax_free_drawdown: real(self.tax_free_drawdown),
            taxable_drawdown: real(self.taxable_drawdown),
            external_income,
            taxable_income: real(self.taxable_income),
            gross_income: real(self.gross_income),
            annual_tax: real(self.annual_tax),
            monthly_tax: real(self.monthly_tax),
            annual_net_income: real(self.annual_net_income),
            monthly_net_income: real(self.monthly_net_income),
            tax_free_interest: real(self.tax_free_interest),
            taxable_interest: real(self.taxable_interest),
            tax_free_start_of_year: real(self.tax_free_start_of_year),
            taxable_start_of_year: real(self.taxable_start_of_year),
            tax_free_remaining: real(self.tax_free_remaining),
            taxable_remaining: real(self.taxable_remaining),
        }
    }

    fn chart_point(&self, inflation: Option<InflationAdjustment>) -> ChartPoint {
        let real = |value: f64| match inflation {
            Some(adjustment) => adjust_for_inflation(value, self.year, adjustment),
            None => value,
        };
        ChartPoint {
            year: self.year,
            tax_year: self.tax_year.clone(),
            net_income: real(self.annual_net_income),
            gross_income: real(self.gross_income),
            external_income: real(self.external_income.total),
            tax_free_remaining: real(self.tax_free_remaining),
            taxable_remaining: real(self.taxable_remaining),
            inflation_adjusted: inflation.is_some(),
        }
    }
}

/// Runs every tax year of the horizon, carrying both pot balances forward.
///
/// Years missing from `inputs` draw nothing. Only the taxable-pot withdrawal
/// and external income are taxed; the tax-free withdrawal is added to net
/// income untouched. `inflation`, when given, only affects the chart points.
pub fn run_projection(
    config: &PlanConfig,
    inputs: &DrawdownInputs,
    inflation: Option<InflationAdjustment>,
) -> Projection {
    let split = split_pots(&config.pot, &config.streams);
    let rate = config.pot.growth_rate;

    let mut tax_free = split.tax_free;
    let mut taxable = split.taxable;
    let mut totals = ProjectionTotals {
        initial_tax_free: split.tax_free,
        initial_taxable: split.taxable,
        ..ProjectionTotals::default()
    };
    let mut years = Vec::with_capacity(config.horizon.len() as usize);
    let mut chart = Vec::with_capacity(config.horizon.len() as usize);

    for year in config.horizon.years() {
        let request = inputs.get(&year).copied().unwrap_or_default();

        let tax_free_year = grow_year(tax_free, rate, request.tax_free);
        let taxable_year = grow_year(taxable, rate, request.taxable);
        let external_income = external_income_for_year(&config.streams, year);

        let tax_free_drawdown = tax_free_year.total_drawdown;
        let taxable_drawdown = taxable_year.total_drawdown;
        let taxable_income = taxable_drawdown + external_income.total;
        let annual_tax = calculate_tax(taxable_income, &config.tax).total_tax;
        let gross_income = tax_free_drawdown + taxable_income;
        let annual_net_income = gross_income - annual_tax;

        totals.total_tax_free_drawn += tax_free_drawdown;
        totals.total_taxable_drawn += taxable_drawdown;
        totals.total_external_income += external_income.total;
        totals.total_tax_paid += annual_tax;
        totals.total_net_income += annual_net_income;

        let projection = YearProjection {
            year,
            tax_year: tax_year_label(year),
            requested_tax_free: request.tax_free,
            requested_taxable: request.taxable,
            tax_free_drawdown,
            taxable_drawdown,
            external_income,
            taxable_income,
            gross_income,
            annual_tax,
            monthly_tax: annual_tax / 12.0,
            annual_net_income,
            monthly_net_income: annual_net_income / 12.0,
            tax_free_interest: tax_free_year.total_interest,
            taxable_interest: taxable_year.total_interest,
            tax_free_start_of_year: tax_free,
            taxable_start_of_year: taxable,
            tax_free_remaining: tax_free_year.end_balance,
            taxable_remaining: taxable_year.end_balance,
        };

        tax_free = tax_free_year.end_balance;
        taxable = taxable_year.end_balance;

        chart.push(projection.chart_point(inflation));
        years.push(projection);
    }

    totals.tax_free_remaining = tax_free;
    totals.taxable_remaining = taxable;

    Projection {
        years,
        totals,
        chart,
    }
}

/// Replays the plan up to `year` and returns that year's monthly ledger for
/// both pots, or `None` when `year` is outside the horizon.
pub fn year_ledger(
    config: &PlanConfig,
    inputs: &DrawdownInputs,
    year: i32,
) -> Option<YearLedger> {
    if !config.horizon.years().contains(&year) {
        return None;
    }
    let split = split_pots(&config.pot, &config.streams);
    let rate = config.pot.growth_rate;
    let mut tax_free = split.tax_free;
    let mut taxable = split.taxable;

    for earlier in config.horizon.start_year..year {
        let request = inputs.get(&earlier).copied().unwrap_or_default();
        tax_free = grow_year(tax_free, rate, request.tax_free).end_balance;
        taxable = grow_year(taxable, rate, request.taxable).end_balance;
    }

    let request = inputs.get(&year).copied().unwrap_or_default();
    Some(YearLedger {
        year,
        tax_year: tax_year_label(year),
        tax_free: grow_year_with_ledger(tax_free, rate, request.tax_free),
        taxable: grow_year_with_ledger(taxable, rate, request.taxable),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::defaults::{default_plan_config, default_tax_config};
    use crate::core::growth::annual_growth_factor;
    use crate::core::types::{DrawdownInput, PlanHorizon};
    use proptest::prelude::{prop_assert, prop_assert_eq, proptest};

    const EPS: f64 = 1e-6;

    fn assert_approx(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() <= EPS,
            "expected {expected}, got {actual}"
        );
    }

    fn bare_config() -> PlanConfig {
        PlanConfig {
            pot: PotConfiguration {
                capital: 400_000.0,
                growth_rate: 0.0,
                tax_free_cap: 268_275.0,
            },
            tax: default_tax_config(),
            streams: Vec::new(),
            horizon: PlanHorizon {
                start_year: 2031,
                end_year: 2036,
            },
        }
    }

    fn flat_inputs(config: &PlanConfig, tax_free: f64, taxable: f64) -> DrawdownInputs {
        config
            .horizon
            .years()
            .map(|year| (year, DrawdownInput { tax_free, taxable }))
            .collect()
    }

    #[test]
    fn tax_year_labels_wrap_the_century() {
        assert_eq!(tax_year_label(2031), "2031/32");
        assert_eq!(tax_year_label(2099), "2099/00");
        assert_eq!(tax_year_label(2008), "2008/09");
    }

    #[test]
    fn extreme_years_saturate_instead_of_overflowing() {
        assert_eq!(tax_year_label(i32::MAX), format!("{}/48", i32::MAX));
        let widest = PlanHorizon {
            start_year: i32::MIN,
            end_year: i32::MAX,
        };
        assert_eq!(widest.len(), u32::MAX);
        let adjustment = InflationAdjustment {
            rate: 0.03,
            reference_year: i32::MIN,
        };
        assert!(adjust_for_inflation(1_000.0, i32::MAX, adjustment) >= 0.0);
    }

    #[test]
    fn split_caps_tax_free_share_and_adds_lump_sums() {
        let config = default_plan_config();
        let split = split_pots(&config.pot, &config.streams);
        assert_approx(split.tax_free, 215_750.0 + 21_775.15 + 12_180.11);
        assert_approx(split.taxable, 863_000.0 - 215_750.0);

        let capped = PotConfiguration {
            capital: 1_500_000.0,
            growth_rate: 0.04,
            tax_free_cap: 268_275.0,
        };
        let split = split_pots(&capped, &[]);
        assert_approx(split.tax_free, 268_275.0);
        assert_approx(split.taxable, 1_500_000.0 - 268_275.0);

        let small = PotConfiguration {
            capital: 100_000.0,
            growth_rate: 0.04,
            tax_free_cap: 268_275.0,
        };
        let split = split_pots(&small, &[]);
        assert_approx(split.tax_free, 25_000.0);
        assert_approx(split.taxable, 75_000.0);
    }

    #[test]
    fn inflation_discounts_only_after_reference_year() {
        let adjustment = InflationAdjustment {
            rate: 0.05,
            reference_year: 2030,
        };
        assert_approx(adjust_for_inflation(1_000.0, 2029, adjustment), 1_000.0);
        assert_approx(adjust_for_inflation(1_000.0, 2030, adjustment), 1_000.0);
        assert_approx(adjust_for_inflation(1_050.0, 2031, adjustment), 1_000.0);
        assert_approx(adjust_for_inflation(1_102.5, 2032, adjustment), 1_000.0);
    }

    #[test]
    fn zero_growth_projection_matches_hand_calculation() {
        let config = bare_config();
        let inputs = flat_inputs(&config, 10_000.0, 20_000.0);
        let projection = run_projection(&config, &inputs, None);

        assert_eq!(projection.years.len(), 5);
        let first = &projection.years[0];
        assert_eq!(first.tax_year, "2031/32");
        assert_approx(first.tax_free_start_of_year, 100_000.0);
        assert_approx(first.taxable_start_of_year, 300_000.0);
        assert_approx(first.tax_free_drawdown, 10_000.0);
        assert_approx(first.taxable_drawdown, 20_000.0);
        assert_approx(first.taxable_income, 20_000.0);
        assert_approx(first.annual_tax, 1_486.0);
        assert_approx(first.monthly_tax, 1_486.0 / 12.0);
        assert_approx(first.gross_income, 30_000.0);
        assert_approx(first.annual_net_income, 28_514.0);
        assert_approx(first.tax_free_remaining, 90_000.0);
        assert_approx(first.taxable_remaining, 280_000.0);

        let totals = projection.totals;
        assert_approx(totals.total_tax_free_drawn, 50_000.0);
        assert_approx(totals.total_taxable_drawn, 100_000.0);
        assert_approx(totals.total_tax_paid, 5.0 * 1_486.0);
        assert_approx(totals.total_net_income, 5.0 * 28_514.0);
        assert_approx(totals.tax_free_remaining, 50_000.0);
        assert_approx(totals.taxable_remaining, 200_000.0);
    }

    #[test]
    fn balances_carry_forward_between_years() {
        let mut config = bare_config();
        config.pot.growth_rate = 0.05;
        let inputs = flat_inputs(&config, 12_000.0, 30_000.0);
        let projection = run_projection(&config, &inputs, None);
        for pair in projection.years.windows(2) {
            assert_approx(pair[1].tax_free_start_of_year, pair[0].tax_free_remaining);
            assert_approx(pair[1].taxable_start_of_year, pair[0].taxable_remaining);
        }
    }

    #[test]
    fn missing_years_draw_nothing_but_still_grow() {
        let mut config = bare_config();
        config.pot.growth_rate = 0.04;
        let projection = run_projection(&config, &DrawdownInputs::new(), None);
        let first = &projection.years[0];
        assert_approx(first.requested_tax_free, 0.0);
        assert_approx(first.taxable_drawdown, 0.0);
        assert_approx(first.annual_tax, 0.0);
        assert_approx(
            first.taxable_remaining,
            300_000.0 * annual_growth_factor(0.04),
        );
    }

    #[test]
    fn over_requests_are_capped_to_the_balance() {
        let config = bare_config();
        let inputs = flat_inputs(&config, 60_000.0, 0.0);
        let projection = run_projection(&config, &inputs, None);
        assert_approx(projection.years[0].tax_free_drawdown, 60_000.0);
        assert_approx(projection.years[1].requested_tax_free, 60_000.0);
        assert_approx(projection.years[1].tax_free_drawdown, 40_000.0);
        assert_approx(projection.years[2].tax_free_drawdown, 0.0);
        assert_approx(projection.totals.total_tax_free_drawn, 100_000.0);
    }

    #[test]
    fn external_income_is_taxed_but_not_drawn_from_pots() {
        let mut config = bare_config();
        config.streams = vec![ExternalIncomeStream {
            id: "db".to_string(),
            name: "DB".to_string(),
            owner: "primary".to_string(),
            lump_sum: 5_000.0,
            annual_income: 12_570.0,
            start_year: 2031,
            start_month: 4,
            index_rate: 0.0,
            is_state_pension: false,
        }];
        let inputs = flat_inputs(&config, 0.0, 10_000.0);
        let projection = run_projection(&config, &inputs, None);
        let first = &projection.years[0];

        assert_approx(first.tax_free_start_of_year, 105_000.0);
        assert_approx(first.external_income.total, 12_570.0);
        assert_approx(first.taxable_income, 22_570.0);
        // Allowance is used up by the DB income, so the whole draw is basic rate.
        assert_approx(first.annual_tax, 2_000.0);
        assert_approx(first.annual_net_income, 22_570.0 - 2_000.0);
        assert_approx(first.taxable_remaining, 290_000.0);
        assert_approx(projection.totals.total_external_income, 5.0 * 12_570.0);
    }

    #[test]
    fn chart_points_apply_inflation_when_requested() {
        let config = bare_config();
        let inputs = flat_inputs(&config, 10_000.0, 20_000.0);
        let adjustment = InflationAdjustment {
            rate: 0.10,
            reference_year: 2031,
        };
        let nominal = run_projection(&config, &inputs, None);
        let real = run_projection(&config, &inputs, Some(adjustment));

        assert!(!nominal.chart[1].inflation_adjusted);
        assert!(real.chart[1].inflation_adjusted);
        assert_approx(real.chart[0].net_income, nominal.chart[0].net_income);
        assert_approx(real.chart[1].net_income, nominal.chart[1].net_income / 1.1);
        assert_eq!(real.years, nominal.years);

        let table_row = nominal.years[1].in_real_terms(adjustment);
        assert_approx(table_row.annual_net_income, real.chart[1].net_income);
        assert_approx(table_row.taxable_remaining, real.chart[1].taxable_remaining);
    }

    #[test]
    fn ledger_matches_projection_row() {
        let mut config = bare_config();
        config.pot.growth_rate = 0.05;
        let inputs = flat_inputs(&config, 12_000.0, 30_000.0);
        let projection = run_projection(&config, &inputs, None);
        let ledger = year_ledger(&config, &inputs, 2033).expect("inside horizon");
        let row = &projection.years[2];

        assert_eq!(ledger.tax_year, "2033/34");
        assert_eq!(ledger.taxable.months.len(), 12);
        assert_approx(ledger.taxable.start_balance, row.taxable_start_of_year);
        assert_approx(ledger.taxable.end_balance, row.taxable_remaining);
        assert_approx(ledger.tax_free.end_balance, row.tax_free_remaining);
        let drawn: f64 = ledger.taxable.months.iter().map(|m| m.drawdown).sum();
        assert_approx(drawn, row.taxable_drawdown);

        assert!(year_ledger(&config, &inputs, 2030).is_none());
        assert!(year_ledger(&config, &inputs, 2036).is_none());
    }

    #[test]
    fn empty_horizon_yields_no_years() {
        let mut config = bare_config();
        config.horizon.end_year = config.horizon.start_year;
        let projection = run_projection(&config, &DrawdownInputs::new(), None);
        assert!(projection.years.is_empty());
        assert_approx(projection.totals.taxable_remaining, 300_000.0);
    }

    #[test]
    fn reruns_are_identical() {
        let config = default_plan_config();
        let inputs = flat_inputs(&config, 15_000.0, 35_000.0);
        let a = run_projection(&config, &inputs, None);
        let b = run_projection(&config, &inputs, None);
        assert_eq!(
            serde_json::to_string(&a).expect("serialize"),
            serde_json::to_string(&b).expect("serialize")
        );
    }

    proptest! {
        #![proptest_config(proptest::test_runner::Config::with_cases(32))]

        #[test]
        fn prop_projection_outputs_are_finite_and_conserving(
            capital in 0u32..2_000_000,
            rate_bp in 0u32..1_000,
            tax_free in 0u32..80_000,
            taxable in 0u32..150_000
        ) {
            let mut config = default_plan_config();
            config.pot.capital = capital as f64;
            config.pot.growth_rate = rate_bp as f64 / 10_000.0;
            let inputs = flat_inputs(&config, tax_free as f64, taxable as f64);
            let projection = run_projection(&config, &inputs, None);

            prop_assert_eq!(projection.years.len(), config.horizon.len() as usize);
            for year in &projection.years {
                prop_assert!(year.tax_free_remaining >= 0.0);
                prop_assert!(year.taxable_remaining >= 0.0);
                prop_assert!(year.tax_free_drawdown <= year.requested_tax_free + 1e-6);
                prop_assert!(year.taxable_drawdown <= year.requested_taxable + 1e-6);
                prop_assert!(year.annual_tax <= year.taxable_income + 1e-6);
                prop_assert!(year.annual_net_income.is_finite());
                let rebuilt = year.tax_free_start_of_year + year.tax_free_interest
                    - year.tax_free_drawdown;
                prop_assert!((rebuilt - year.tax_free_remaining).abs() <= 1e-4);
            }
        }
    }
}
