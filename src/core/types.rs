use std::collections::BTreeMap;
use std::ops::Range;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PotConfiguration {
    pub capital: f64,
    pub growth_rate: f64,
    pub tax_free_cap: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PotSplit {
    pub tax_free: f64,
    pub taxable: f64,
}

/// One progressive band, bounded in taxable-income terms (income above the
/// personal allowance). `upper: None` is the open top band.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaxBand {
    pub name: String,
    pub lower: f64,
    pub upper: Option<f64>,
    pub rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaxConfiguration {
    pub personal_allowance: f64,
    #[serde(default = "default_taper_threshold")]
    pub taper_threshold: f64,
    pub bands: Vec<TaxBand>,
}

fn default_taper_threshold() -> f64 {
    super::defaults::ALLOWANCE_TAPER_THRESHOLD
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaxBandCharge {
    pub band: String,
    pub taxable_amount: f64,
    pub rate: f64,
    pub tax: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaxResult {
    pub gross_income: f64,
    pub personal_allowance: f64,
    pub taxable_income: f64,
    pub total_tax: f64,
    pub effective_rate: f64,
    pub breakdown: Vec<TaxBandCharge>,
}

/// A defined-benefit or state pension paid independently of the pots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalIncomeStream {
    pub id: String,
    pub name: String,
    pub owner: String,
    pub lump_sum: f64,
    pub annual_income: f64,
    pub start_year: i32,
    /// Calendar month, 1 = January.
    pub start_month: u32,
    pub index_rate: f64,
    #[serde(default)]
    pub is_state_pension: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamYearIncome {
    pub stream_id: String,
    pub name: String,
    pub gross_income: f64,
    pub is_partial_year: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalIncome {
    pub breakdown: Vec<StreamYearIncome>,
    pub total: f64,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MilestoneKind {
    Db,
    State,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PensionMilestone {
    pub year: i32,
    pub tax_year: String,
    pub name: String,
    pub kind: MilestoneKind,
}

/// Requested annual withdrawals for one tax year.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DrawdownInput {
    pub tax_free: f64,
    pub taxable: f64,
}

pub type DrawdownInputs = BTreeMap<i32, DrawdownInput>;

/// Tax years `start_year..end_year`, end exclusive.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanHorizon {
    pub start_year: i32,
    pub end_year: i32,
}

impl PlanHorizon {
    pub fn years(self) -> Range<i32> {
        self.start_year..self.end_year.max(self.start_year)
    }

    pub fn len(self) -> u32 {
        (i64::from(self.end_year) - i64::from(self.start_year)).max(0) as u32
    }

    pub fn is_empty(self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InflationAdjustment {
    pub rate: f64,
    pub reference_year: i32,
}

/// Immutable snapshot of everything the engine and optimizer read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanConfig {
    pub pot: PotConfiguration,
    pub tax: TaxConfiguration,
    pub streams: Vec<ExternalIncomeStream>,
    pub horizon: PlanHorizon,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonthLedger {
    pub month: u32,
    pub start_balance: f64,
    pub interest: f64,
    pub drawdown: f64,
    pub end_balance: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GrowthYear {
    pub start_balance: f64,
    pub end_balance: f64,
    pub total_interest: f64,
    pub total_drawdown: f64,
    pub months: Vec<MonthLedger>,
}

/// Month-by-month detail for both pots in one tax year.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct YearLedger {
    pub year: i32,
    pub tax_year: String,
    pub tax_free: GrowthYear,
    pub taxable: GrowthYear,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct YearProjection {
    pub year: i32,
    pub tax_year: String,
    pub requested_tax_free: f64,
    pub requested_taxable: f64,
    pub tax_free_drawdown: f64,
    pub taxable_drawdown: f64,
    pub external_income: ExternalIncome,
    pub taxable_income: f64,
    pub gross_income: f64,
    pub annual_tax: f64,
    pub monthly_tax: f64,
    pub annual_net_income: f64,
    pub monthly_net_income: f64,
    pub tax_free_interest: f64,
    pub taxable_interest: f64,
    pub tax_free_start_of_year: f64,
    pub taxable_start_of_year: f64,
    pub tax_free_remaining: f64,
    pub taxable_remaining: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartPoint {
    pub year: i32,
    pub tax_year: String,
    pub net_income: f64,
    pub gross_income: f64,
    pub external_income: f64,
    pub tax_free_remaining: f64,
    pub taxable_remaining: f64,
    pub inflation_adjusted: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectionTotals {
    pub initial_tax_free: f64,
    pub initial_taxable: f64,
    pub tax_free_remaining: f64,
    pub taxable_remaining: f64,
    pub total_tax_free_drawn: f64,
    pub total_taxable_drawn: f64,
    pub total_external_income: f64,
    pub total_tax_paid: f64,
    pub total_net_income: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Projection {
    pub years: Vec<YearProjection>,
    pub totals: ProjectionTotals,
    pub chart: Vec<ChartPoint>,
}

/// Missing fields fall back to the defaults when deserialized.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct OptimizerConfiguration {
    /// First tax year after the plan window; both pot targets apply at the
    /// end of `target_year - 1`.
    pub target_year: i32,
    pub target_residual: f64,
    pub bias_pct: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimizerResult {
    pub plan: DrawdownInputs,
    pub base_income: f64,
    pub boosted_income: f64,
    pub boosted_years: u32,
    pub tax_free_annual_drawdown: f64,
    /// Level income the post-boost years can sustain from where the boosted
    /// years leave the pots. Tracks `base_income` once the search converges.
    pub phase_two_income: f64,
    pub projected_taxable_at_target: f64,
    pub projected_tax_free_at_target: f64,
    pub converged: bool,
}
