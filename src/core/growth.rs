use super::types::{GrowthYear, MonthLedger};

const MONTHS_PER_YEAR: u32 = 12;

/// Twelve months of interest-then-withdrawal on a single pot.
///
/// Each month accrues `annual_rate / 12` on the running balance and then
/// withdraws `min(monthly_drawdown, balance)`. Once the pot hits zero the
/// remaining months are skipped. The ledger is only populated when
/// `with_ledger` is set; the optimizer calls this in tight loops.
pub fn compound_monthly(
    start_balance: f64,
    annual_rate: f64,
    monthly_drawdown: f64,
    with_ledger: bool,
) -> GrowthYear {
    if start_balance <= 0.0 {
        return GrowthYear {
            start_balance: 0.0,
            end_balance: 0.0,
            total_interest: 0.0,
            total_drawdown: 0.0,
            months: Vec::new(),
        };
    }

    let monthly_rate = annual_rate / MONTHS_PER_YEAR as f64;
    let requested = monthly_drawdown.max(0.0);
    let mut balance = start_balance;
    let mut total_interest = 0.0;
    let mut total_drawdown = 0.0;
    let mut months = if with_ledger {
        Vec::with_capacity(MONTHS_PER_YEAR as usize)
    } else {
        Vec::new()
    };

    for month in 1..=MONTHS_PER_YEAR {
        let month_start = balance;

        let interest = balance * monthly_rate;
        balance += interest;
        total_interest += interest;

        let drawdown = requested.min(balance);
        balance -= drawdown;
        total_drawdown += drawdown;

        if with_ledger {
            months.push(MonthLedger {
                month,
                start_balance: month_start,
                interest,
                drawdown,
                end_balance: balance.max(0.0),
            });
        }

        if balance <= 0.0 {
            balance = 0.0;
            break;
        }
    }

    GrowthYear {
        start_balance,
        end_balance: balance.max(0.0),
        total_interest,
        total_drawdown,
        months,
    }
}

/// Year-level wrapper: spreads `annual_drawdown` evenly over twelve months.
pub fn grow_year(start_balance: f64, annual_rate: f64, annual_drawdown: f64) -> GrowthYear {
    compound_monthly(
        start_balance,
        annual_rate,
        annual_drawdown / MONTHS_PER_YEAR as f64,
        false,
    )
}

pub fn grow_year_with_ledger(
    start_balance: f64,
    annual_rate: f64,
    annual_drawdown: f64,
) -> GrowthYear {
    compound_monthly(
        start_balance,
        annual_rate,
        annual_drawdown / MONTHS_PER_YEAR as f64,
        true,
    )
}

/// Effective annual growth factor of monthly compounding, `(1 + r/12)^12`.
pub fn annual_growth_factor(annual_rate: f64) -> f64 {
    (1.0 + annual_rate / MONTHS_PER_YEAR as f64).powi(MONTHS_PER_YEAR as i32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::{prop_assert, proptest};

    const EPS: f64 = 1e-6;

    fn assert_approx(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() <= EPS,
            "expected {expected}, got {actual}"
        );
    }

    #[test]
    fn non_positive_start_balance_is_all_zero() {
        for start in [0.0, -500.0] {
            let year = compound_monthly(start, 0.04, 100.0, true);
            assert_approx(year.start_balance, 0.0);
            assert_approx(year.end_balance, 0.0);
            assert_approx(year.total_interest, 0.0);
            assert_approx(year.total_drawdown, 0.0);
            assert!(year.months.is_empty());
        }
    }

    #[test]
    fn zero_rate_reduces_balance_linearly() {
        let year = grow_year_with_ledger(12_000.0, 0.0, 6_000.0);
        assert_approx(year.end_balance, 6_000.0);
        assert_approx(year.total_interest, 0.0);
        assert_approx(year.total_drawdown, 6_000.0);
        assert_eq!(year.months.len(), 12);
        for (idx, month) in year.months.iter().enumerate() {
            assert_approx(month.drawdown, 500.0);
            assert_approx(month.end_balance, 12_000.0 - 500.0 * (idx as f64 + 1.0));
        }
    }

    #[test]
    fn interest_is_applied_before_drawdown() {
        let year = grow_year_with_ledger(1_200.0, 0.12, 0.0);
        let first = year.months[0];
        assert_approx(first.interest, 12.0);
        assert_approx(first.end_balance, 1_212.0);
        assert_approx(year.end_balance, 1_200.0 * annual_growth_factor(0.12));
    }

    #[test]
    fn first_month_interest_is_available_to_draw() {
        // 100 grows to 101 before the 101 withdrawal, so the pot empties exactly.
        let year = compound_monthly(100.0, 0.12, 101.0, true);
        assert_approx(year.total_drawdown, 101.0);
        assert_approx(year.end_balance, 0.0);
        assert_eq!(year.months.len(), 1);
    }

    #[test]
    fn exhausted_pot_stops_processing_remaining_months() {
        let year = grow_year_with_ledger(1_000.0, 0.0, 12_000.0);
        assert_eq!(year.months.len(), 1);
        assert_approx(year.total_drawdown, 1_000.0);
        assert_approx(year.end_balance, 0.0);
    }

    #[test]
    fn ledger_is_skipped_without_request() {
        let year = grow_year(50_000.0, 0.05, 12_000.0);
        assert!(year.months.is_empty());
        let ledgered = grow_year_with_ledger(50_000.0, 0.05, 12_000.0);
        assert_approx(year.end_balance, ledgered.end_balance);
        assert_approx(year.total_interest, ledgered.total_interest);
    }

    #[test]
    fn ledger_totals_match_summary() {
        let year = grow_year_with_ledger(80_000.0, 0.04, 30_000.0);
        let interest: f64 = year.months.iter().map(|m| m.interest).sum();
        let drawdown: f64 = year.months.iter().map(|m| m.drawdown).sum();
        assert_approx(interest, year.total_interest);
        assert_approx(drawdown, year.total_drawdown);
        assert_approx(
            year.end_balance,
            year.start_balance + year.total_interest - year.total_drawdown,
        );
    }

    proptest! {
        #![proptest_config(proptest::test_runner::Config::with_cases(64))]

        #[test]
        fn prop_end_balance_non_decreasing_in_start_balance(
            start in 0u32..2_000_000,
            extra in 0u32..500_000,
            rate_bp in 0u32..1_500,
            drawdown in 0u32..200_000
        ) {
            let rate = rate_bp as f64 / 10_000.0;
            let low = grow_year(start as f64, rate, drawdown as f64);
            let high = grow_year(start as f64 + extra as f64, rate, drawdown as f64);
            prop_assert!(high.end_balance + 1e-6 >= low.end_balance);
        }

        #[test]
        fn prop_end_balance_non_increasing_in_drawdown(
            start in 0u32..2_000_000,
            rate_bp in 0u32..1_500,
            drawdown in 0u32..200_000,
            extra in 0u32..100_000
        ) {
            let rate = rate_bp as f64 / 10_000.0;
            let low = grow_year(start as f64, rate, drawdown as f64);
            let high = grow_year(start as f64, rate, drawdown as f64 + extra as f64);
            prop_assert!(high.end_balance <= low.end_balance + 1e-6);
        }

        #[test]
        fn prop_drawdown_never_exceeds_request(
            start in 0u32..2_000_000,
            rate_bp in 0u32..1_500,
            monthly in 0u32..50_000
        ) {
            let rate = rate_bp as f64 / 10_000.0;
            let year = compound_monthly(start as f64, rate, monthly as f64, false);
            prop_assert!(year.end_balance >= 0.0);
            prop_assert!(year.total_drawdown <= monthly as f64 * 12.0 + 1e-6);
            if year.end_balance > 0.0 {
                prop_assert!((year.total_drawdown - monthly as f64 * 12.0).abs() <= 1e-6);
            }
        }
    }
}
