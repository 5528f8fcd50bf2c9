use std::collections::BTreeMap;

use super::engine::tax_year_label;
use super::types::{
    ExternalIncome, ExternalIncomeStream, MilestoneKind, PensionMilestone, StreamYearIncome,
};

const TAX_YEAR_FIRST_MONTH: u32 = 4;
const PARTIAL_YEAR_FRACTION: f64 = 3.0 / 12.0;

/// UK tax years start in April, so a January to March start belongs to the
/// tax year numbered one below its calendar year.
pub fn start_tax_year(stream: &ExternalIncomeStream) -> i32 {
    if stream.start_month >= TAX_YEAR_FIRST_MONTH {
        stream.start_year
    } else {
        stream.start_year.saturating_sub(1)
    }
}

/// Base income compounded once per year since the calendar start year.
pub fn indexed_income(stream: &ExternalIncomeStream, year: i32) -> f64 {
    let years_of_growth = year.saturating_sub(stream.start_year);
    if years_of_growth <= 0 {
        return stream.annual_income;
    }
    stream.annual_income * (1.0 + stream.index_rate).powi(years_of_growth)
}

pub fn stream_income_for_year(
    stream: &ExternalIncomeStream,
    tax_year: i32,
) -> Option<StreamYearIncome> {
    let first_tax_year = start_tax_year(stream);
    if tax_year < first_tax_year {
        return None;
    }

    let indexed = indexed_income(stream, tax_year);
    let is_partial_year =
        tax_year == first_tax_year && stream.start_month < TAX_YEAR_FIRST_MONTH;
    let gross_income = if is_partial_year {
        indexed * PARTIAL_YEAR_FRACTION
    } else {
        indexed
    };

    Some(StreamYearIncome {
        stream_id: stream.id.clone(),
        name: stream.name.clone(),
        gross_income,
        is_partial_year,
    })
}

pub fn external_income_for_year(streams: &[ExternalIncomeStream], tax_year: i32) -> ExternalIncome {
    let mut income = ExternalIncome::default();
    for stream in streams {
        if let Some(year_income) = stream_income_for_year(stream, tax_year) {
            if year_income.gross_income > 0.0 {
                income.total += year_income.gross_income;
                income.breakdown.push(year_income);
            }
        }
    }
    income
}

/// Total only; used by the optimizer's inner loops.
pub fn external_income_total(streams: &[ExternalIncomeStream], tax_year: i32) -> f64 {
    streams
        .iter()
        .filter_map(|stream| stream_income_for_year(stream, tax_year))
        .map(|income| income.gross_income)
        .filter(|gross| *gross > 0.0)
        .sum()
}

/// Inclusive of both `start_year` and `end_year`.
pub fn project_external_income(
    streams: &[ExternalIncomeStream],
    start_year: i32,
    end_year: i32,
) -> BTreeMap<i32, ExternalIncome> {
    (start_year..=end_year)
        .map(|year| (year, external_income_for_year(streams, year)))
        .collect()
}

pub fn total_lump_sums(streams: &[ExternalIncomeStream]) -> f64 {
    streams.iter().map(|stream| stream.lump_sum.max(0.0)).sum()
}

pub fn pension_milestones(streams: &[ExternalIncomeStream]) -> Vec<PensionMilestone> {
    streams
        .iter()
        .map(|stream| {
            let year = start_tax_year(stream);
            PensionMilestone {
                year,
                tax_year: tax_year_label(year),
                name: stream.name.clone(),
                kind: if stream.is_state_pension {
                    MilestoneKind::State
                } else {
                    MilestoneKind::Db
                },
            }
        })
        .collect()
}

pub fn grouped_milestones(
    streams: &[ExternalIncomeStream],
) -> BTreeMap<i32, Vec<PensionMilestone>> {
    let mut grouped: BTreeMap<i32, Vec<PensionMilestone>> = BTreeMap::new();
    for milestone in pension_milestones(streams) {
        grouped.entry(milestone.year).or_default().push(milestone);
    }
    grouped
}
