use super::types::{TaxBandCharge, TaxConfiguration, TaxResult};

/// Personal allowance after the taper: £1 lost for every full £2 of income
/// above the threshold, never below zero.
pub fn personal_allowance(income: f64, base_allowance: f64, taper_threshold: f64) -> f64 {
    if income <= taper_threshold {
        return base_allowance;
    }
    let reduction = ((income - taper_threshold) / 2.0).floor();
    (base_allowance - reduction).max(0.0)
}

pub fn calculate_tax(gross_income: f64, config: &TaxConfiguration) -> TaxResult {
    if gross_income <= 0.0 {
        return TaxResult {
            gross_income: 0.0,
            personal_allowance: config.personal_allowance,
            taxable_income: 0.0,
            total_tax: 0.0,
            effective_rate: 0.0,
            breakdown: Vec::new(),
        };
    }

    let allowance = personal_allowance(
        gross_income,
        config.personal_allowance,
        config.taper_threshold,
    );
    let taxable_income = (gross_income - allowance).max(0.0);

    let mut breakdown = Vec::new();
    let mut total_tax = 0.0;
    for band in &config.bands {
        if taxable_income <= band.lower {
            break;
        }
        let top = band.upper.map_or(taxable_income, |upper| upper.min(taxable_income));
        let amount = top - band.lower;
        if amount <= 0.0 {
            continue;
        }
        let tax = amount * band.rate;
        total_tax += tax;
        breakdown.push(TaxBandCharge {
            band: band.name.clone(),
            taxable_amount: amount,
            rate: band.rate,
            tax,
        });
    }

    TaxResult {
        gross_income,
        personal_allowance: allowance,
        taxable_income,
        total_tax,
        effective_rate: total_tax / gross_income,
        breakdown,
    }
}

pub fn net_income(gross_income: f64, tax: f64) -> f64 {
    gross_income - tax
}

pub fn monthly_tax(annual_income: f64, config: &TaxConfiguration) -> f64 {
    calculate_tax(annual_income, config).total_tax / 12.0
}

/// Band boundaries must start at zero, touch each other, and only the last
/// band may be open-ended.
pub fn validate_bands(config: &TaxConfiguration) -> Result<(), String> {
    let Some(first) = config.bands.first() else {
        return Err("tax bands must not be empty".to_string());
    };
    if first.lower != 0.0 {
        return Err(format!(
            "tax band '{}' must start at 0 taxable income",
            first.name
        ));
    }

    let last_idx = config.bands.len() - 1;
    for (idx, band) in config.bands.iter().enumerate() {
        if !(0.0..=1.0).contains(&band.rate) {
            return Err(format!("tax band '{}' rate must be between 0 and 1", band.name));
        }
        match band.upper {
            Some(upper) => {
                if upper <= band.lower {
                    return Err(format!(
                        "tax band '{}' upper bound must exceed its lower bound",
                        band.name
                    ));
                }
                if let Some(next) = config.bands.get(idx + 1) {
                    if next.lower != upper {
                        return Err(format!(
                            "tax band '{}' must start where '{}' ends",
                            next.name, band.name
                        ));
                    }
                }
            }
            None if idx != last_idx => {
                return Err(format!(
                    "only the last tax band may be unbounded, '{}' is not last",
                    band.name
                ));
            }
            None => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::defaults::default_tax_config;
    use crate::core::types::TaxBand;
    use proptest::prelude::{prop_assert, proptest};

    fn assert_close(actual: f64, expected: f64, tol: f64) {
        assert!(
            (actual - expected).abs() <= tol,
            "expected {expected}, got {actual}, tolerance {tol}"
        );
    }

    #[test]
    fn allowance_is_full_up_to_threshold() {
        assert_close(personal_allowance(50_000.0, 12_570.0, 100_000.0), 12_570.0, 0.0);
        assert_close(personal_allowance(100_000.0, 12_570.0, 100_000.0), 12_570.0, 0.0);
    }

    #[test]
    fn allowance_tapers_and_floors_at_zero() {
        assert_close(personal_allowance(102_000.0, 12_570.0, 100_000.0), 11_570.0, 0.0);
        assert_close(personal_allowance(110_000.0, 12_570.0, 100_000.0), 7_570.0, 0.0);
        assert_close(personal_allowance(125_140.0, 12_570.0, 100_000.0), 0.0, 0.0);
        assert_close(personal_allowance(150_000.0, 12_570.0, 100_000.0), 0.0, 0.0);
    }

    #[test]
    fn allowance_taper_rounds_down_odd_pounds() {
        assert_close(personal_allowance(100_001.0, 12_570.0, 100_000.0), 12_570.0, 0.0);
        assert_close(personal_allowance(100_003.0, 12_570.0, 100_000.0), 12_569.0, 0.0);
    }

    #[test]
    fn income_within_allowance_is_untaxed() {
        let config = default_tax_config();
        let result = calculate_tax(12_570.0, &config);
        assert_close(result.total_tax, 0.0, 0.0);
        assert!(result.breakdown.is_empty());
    }

    #[test]
    fn zero_and_negative_income_yield_empty_result() {
        let config = default_tax_config();
        for income in [0.0, -1_000.0] {
            let result = calculate_tax(income, &config);
            assert_close(result.gross_income, 0.0, 0.0);
            assert_close(result.total_tax, 0.0, 0.0);
            assert_close(result.effective_rate, 0.0, 0.0);
            assert!(result.breakdown.is_empty());
        }
    }

    #[test]
    fn basic_rate_case() {
        let result = calculate_tax(20_000.0, &default_tax_config());
        assert_close(result.total_tax, 1_486.0, 0.01);
        assert_close(result.taxable_income, 7_430.0, 1e-9);
    }

    #[test]
    fn higher_rate_case_with_breakdown() {
        let result = calculate_tax(60_000.0, &default_tax_config());
        assert_close(result.total_tax, 11_432.0, 0.01);
        assert_eq!(result.breakdown.len(), 2);
        assert_eq!(result.breakdown[0].band, "Basic Rate");
        assert_close(result.breakdown[0].taxable_amount, 37_700.0, 1e-9);
        assert_eq!(result.breakdown[1].band, "Higher Rate");
        assert_close(result.breakdown[1].taxable_amount, 9_730.0, 1e-9);
    }

    #[test]
    fn additional_rate_case_fully_tapered() {
        let result = calculate_tax(150_000.0, &default_tax_config());
        assert_close(result.personal_allowance, 0.0, 0.0);
        assert_close(result.total_tax, 54_331.5, 0.01);
        assert_eq!(result.breakdown.len(), 3);
        assert_close(result.effective_rate, 54_331.5 / 150_000.0, 1e-9);
    }

    #[test]
    fn partially_tapered_case() {
        let result = calculate_tax(110_000.0, &default_tax_config());
        assert_close(result.personal_allowance, 7_570.0, 0.0);
        assert_close(result.total_tax, 33_432.0, 0.01);
    }

    #[test]
    fn net_and_monthly_helpers() {
        let config = default_tax_config();
        let result = calculate_tax(50_000.0, &config);
        assert_close(
            net_income(50_000.0, result.total_tax),
            50_000.0 - result.total_tax,
            0.0,
        );
        assert_close(net_income(10_000.0, 0.0), 10_000.0, 0.0);
        assert_close(monthly_tax(60_000.0, &config), 11_432.0 / 12.0, 0.01);
    }

    #[test]
    fn marginal_pound_matches_band_rate() {
        let config = default_tax_config();
        // Just inside basic, higher and additional rate bands.
        for (income, rate) in [(30_000.0, 0.20), (80_000.0, 0.40), (200_000.0, 0.45)] {
            let delta = calculate_tax(income + 1.0, &config).total_tax
                - calculate_tax(income, &config).total_tax;
            assert_close(delta, rate, 1e-6);
        }
        // First pound over the allowance.
        let delta = calculate_tax(12_571.0, &config).total_tax
            - calculate_tax(12_570.0, &config).total_tax;
        assert_close(delta, 0.20, 1e-6);
    }

    #[test]
    fn validate_bands_accepts_defaults_and_rejects_gaps() {
        let mut config = default_tax_config();
        assert!(validate_bands(&config).is_ok());

        config.bands[1].lower = 40_000.0;
        let err = validate_bands(&config).expect_err("gap must be rejected");
        assert!(err.contains("Higher Rate"));

        let mut open_middle = default_tax_config();
        open_middle.bands[0].upper = None;
        assert!(validate_bands(&open_middle).is_err());

        let empty = TaxConfiguration {
            personal_allowance: 12_570.0,
            taper_threshold: 100_000.0,
            bands: Vec::<TaxBand>::new(),
        };
        assert!(validate_bands(&empty).is_err());
    }

    proptest! {
        #![proptest_config(proptest::test_runner::Config::with_cases(128))]

        #[test]
        fn prop_tax_is_non_decreasing_in_income(
            income in 0u32..400_000,
            extra in 0u32..20_000
        ) {
            let config = default_tax_config();
            let low = calculate_tax(income as f64, &config);
            let high = calculate_tax(income as f64 + extra as f64, &config);
            prop_assert!(high.total_tax + 1e-9 >= low.total_tax);
            prop_assert!(low.total_tax <= low.gross_income);
        }

        #[test]
        fn prop_breakdown_sums_to_total(income in 0u32..400_000) {
            let config = default_tax_config();
            let result = calculate_tax(income as f64, &config);
            let sum: f64 = result.breakdown.iter().map(|b| b.tax).sum();
            let taxed: f64 = result.breakdown.iter().map(|b| b.taxable_amount).sum();
            prop_assert!((sum - result.total_tax).abs() <= 1e-6);
            prop_assert!((taxed - result.taxable_income).abs() <= 1e-6);
        }
    }
}
