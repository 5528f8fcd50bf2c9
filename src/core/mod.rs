pub mod defaults;
mod engine;
mod growth;
mod income;
mod solver;
mod tax;
mod types;

pub use engine::{adjust_for_inflation, run_projection, split_pots, tax_year_label, year_ledger};
pub use growth::{annual_growth_factor, compound_monthly, grow_year, grow_year_with_ledger};
pub use income::{
    external_income_for_year, external_income_total, grouped_milestones, pension_milestones,
    project_external_income, start_tax_year, stream_income_for_year, total_lump_sums,
};
pub use solver::{BOOSTED_YEARS, MAX_ITERATIONS, TOLERANCE, bias_multiplier, optimize_plan};
pub use tax::{calculate_tax, monthly_tax, net_income, personal_allowance, validate_bands};
pub use types::{
    ChartPoint, DrawdownInput, DrawdownInputs, ExternalIncome, ExternalIncomeStream, GrowthYear,
    InflationAdjustment, MilestoneKind, MonthLedger, OptimizerConfiguration, OptimizerResult,
    PensionMilestone, PlanConfig, PlanHorizon, PotConfiguration, PotSplit, Projection,
    ProjectionTotals, StreamYearIncome, TaxBand, TaxBandCharge, TaxConfiguration, TaxResult,
    YearLedger, YearProjection,
};
