use super::types::{
    ExternalIncomeStream, OptimizerConfiguration, PlanConfig, PlanHorizon, PotConfiguration,
    TaxBand, TaxConfiguration,
};

pub const TAX_FREE_FRACTION: f64 = 0.25;
pub const ALLOWANCE_TAPER_THRESHOLD: f64 = 100_000.0;

pub const DEFAULT_CAPITAL: f64 = 863_000.0;
pub const DEFAULT_GROWTH_RATE: f64 = 0.04;
pub const DEFAULT_TAX_FREE_CAP: f64 = 268_275.0;
pub const DEFAULT_PERSONAL_ALLOWANCE: f64 = 12_570.0;

pub const START_YEAR: i32 = 2031;
pub const END_YEAR: i32 = 2071;

pub const DEFAULT_TAX_FREE_DRAWDOWN: f64 = 15_000.0;
pub const DEFAULT_TAXABLE_DRAWDOWN: f64 = 35_000.0;

pub const DEFAULT_TARGET_YEAR: i32 = 2056;
pub const DEFAULT_TARGET_RESIDUAL: f64 = 100_000.0;
pub const DEFAULT_BIAS_PCT: f64 = 20.0;

pub const DEFAULT_INFLATION_RATE: f64 = 0.0326;
pub const DEFAULT_REFERENCE_YEAR: i32 = 2026;

pub fn default_pot_config() -> PotConfiguration {
    PotConfiguration {
        capital: DEFAULT_CAPITAL,
        growth_rate: DEFAULT_GROWTH_RATE,
        tax_free_cap: DEFAULT_TAX_FREE_CAP,
    }
}

/// 2024/25 rUK bands expressed over taxable income.
pub fn default_tax_config() -> TaxConfiguration {
    TaxConfiguration {
        personal_allowance: DEFAULT_PERSONAL_ALLOWANCE,
        taper_threshold: ALLOWANCE_TAPER_THRESHOLD,
        bands: vec![
            TaxBand {
                name: "Basic Rate".to_string(),
                lower: 0.0,
                upper: Some(37_700.0),
                rate: 0.20,
            },
            TaxBand {
                name: "Higher Rate".to_string(),
                lower: 37_700.0,
                upper: Some(112_570.0),
                rate: 0.40,
            },
            TaxBand {
                name: "Additional Rate".to_string(),
                lower: 112_570.0,
                upper: None,
                rate: 0.45,
            },
        ],
    }
}

pub fn default_horizon() -> PlanHorizon {
    PlanHorizon {
        start_year: START_YEAR,
        end_year: END_YEAR,
    }
}

pub fn default_optimizer_config() -> OptimizerConfiguration {
    OptimizerConfiguration {
        target_year: DEFAULT_TARGET_YEAR,
        target_residual: DEFAULT_TARGET_RESIDUAL,
        bias_pct: DEFAULT_BIAS_PCT,
    }
}

impl Default for PotConfiguration {
    fn default() -> Self {
        default_pot_config()
    }
}

impl Default for OptimizerConfiguration {
    fn default() -> Self {
        default_optimizer_config()
    }
}

fn stream(
    id: &str,
    name: &str,
    owner: &str,
    lump_sum: f64,
    annual_income: f64,
    start: (i32, u32),
    is_state_pension: bool,
) -> ExternalIncomeStream {
    ExternalIncomeStream {
        id: id.to_string(),
        name: name.to_string(),
        owner: owner.to_string(),
        lump_sum,
        annual_income,
        start_year: start.0,
        start_month: start.1,
        index_rate: 0.04,
        is_state_pension,
    }
}

pub fn default_streams() -> Vec<ExternalIncomeStream> {
    vec![
        stream(
            "primary-council-db",
            "Primary Council DB",
            "primary",
            21_775.15,
            7_258.38,
            (2031, 4),
            false,
        ),
        stream(
            "partner-council-db",
            "Partner Council DB",
            "partner",
            12_180.11,
            13_628.19,
            (2047, 1),
            false,
        ),
        stream(
            "primary-rail-db",
            "Primary Rail DB",
            "primary",
            0.0,
            5_632.00,
            (2036, 4),
            false,
        ),
        stream(
            "primary-state",
            "Primary State Pension",
            "primary",
            0.0,
            11_541.90,
            (2038, 4),
            true,
        ),
        stream(
            "partner-state",
            "Partner State Pension",
            "partner",
            0.0,
            11_541.90,
            (2047, 1),
            true,
        ),
    ]
}

pub fn default_plan_config() -> PlanConfig {
    PlanConfig {
        pot: default_pot_config(),
        tax: default_tax_config(),
        streams: default_streams(),
        horizon: default_horizon(),
    }
}
