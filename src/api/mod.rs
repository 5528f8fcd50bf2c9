use axum::{
    Router,
    extract::{Json, Query, State},
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::core::defaults::{
    ALLOWANCE_TAPER_THRESHOLD, DEFAULT_CAPITAL, DEFAULT_PERSONAL_ALLOWANCE,
    DEFAULT_REFERENCE_YEAR, DEFAULT_TARGET_RESIDUAL, DEFAULT_TARGET_YEAR, DEFAULT_TAX_FREE_CAP,
    END_YEAR, START_YEAR, default_streams, default_tax_config,
};
use crate::core::{
    DrawdownInput, DrawdownInputs, ExternalIncome, ExternalIncomeStream, InflationAdjustment,
    OptimizerConfiguration, OptimizerResult, PensionMilestone, PlanConfig, PlanHorizon,
    PotConfiguration, Projection, TaxBand, TaxConfiguration, TaxResult, YearLedger, YearProjection,
    calculate_tax, grouped_milestones, net_income, optimize_plan, pension_milestones,
    project_external_income, run_projection, validate_bands, year_ledger,
};
use crate::store::{
    OptimizerUpdate, PlannerState, PotUpdate, SnapshotStore, StoreError, initial_drawdown_inputs,
};

pub type SharedStore = Arc<dyn SnapshotStore>;

const MAX_INCOME_RANGE_YEARS: i64 = 200;
const MAX_HORIZON_YEARS: i32 = 200;
const EARLIEST_YEAR: i32 = 1900;
const LATEST_YEAR: i32 = 2300;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "drawdown",
    about = "UK pension drawdown projector and two-pot withdrawal optimizer"
)]
struct Cli {
    #[arg(long, default_value_t = DEFAULT_CAPITAL, help = "Total pension capital")]
    capital: f64,
    #[arg(
        long,
        default_value_t = 4.0,
        help = "Annual nominal growth rate in percent, e.g. 4"
    )]
    growth_rate: f64,
    #[arg(
        long,
        default_value_t = DEFAULT_TAX_FREE_CAP,
        help = "Cap on the tax-free share of capital"
    )]
    tax_free_cap: f64,
    #[arg(long, default_value_t = DEFAULT_PERSONAL_ALLOWANCE)]
    personal_allowance: f64,
    #[arg(
        long,
        default_value_t = ALLOWANCE_TAPER_THRESHOLD,
        help = "Income above which the personal allowance is withdrawn"
    )]
    allowance_taper_threshold: f64,
    #[arg(
        long,
        default_value_t = 37_700.0,
        help = "Taxable income where the higher rate starts"
    )]
    basic_rate_limit: f64,
    #[arg(
        long,
        default_value_t = 112_570.0,
        help = "Taxable income where the additional rate starts"
    )]
    higher_rate_limit: f64,
    #[arg(long, default_value_t = 20.0, help = "Basic rate in percent")]
    basic_rate: f64,
    #[arg(long, default_value_t = 40.0, help = "Higher rate in percent")]
    higher_rate: f64,
    #[arg(long, default_value_t = 45.0, help = "Additional rate in percent")]
    additional_rate: f64,
    #[arg(long, default_value_t = START_YEAR, help = "First tax year of the plan")]
    start_year: i32,
    #[arg(
        long,
        default_value_t = END_YEAR,
        help = "Tax year after the last planned year"
    )]
    end_year: i32,
    #[arg(
        long,
        default_value_t = DEFAULT_TARGET_YEAR,
        help = "Tax year by which both pot targets are met"
    )]
    target_year: i32,
    #[arg(
        long,
        default_value_t = DEFAULT_TARGET_RESIDUAL,
        help = "Taxable pot balance to leave at the target year"
    )]
    target_residual: f64,
    #[arg(
        long,
        default_value_t = 20.0,
        help = "Extra income in the boosted years, percent over base income"
    )]
    bias_pct: f64,
    #[arg(long, help = "Report chart figures in reference-year money")]
    real_terms: bool,
    #[arg(long, default_value_t = 3.26, help = "Inflation rate in percent")]
    inflation_rate: f64,
    #[arg(long, default_value_t = DEFAULT_REFERENCE_YEAR)]
    reference_year: i32,
    #[arg(long, help = "JSON file with the external income streams to use")]
    streams_file: Option<PathBuf>,
    #[arg(long, help = "Plan without any external income streams")]
    no_default_streams: bool,
    #[arg(skip)]
    streams: Option<Vec<ExternalIncomeStream>>,
}

#[derive(Debug, Clone, PartialEq)]
struct RunRequest {
    config: PlanConfig,
    optimizer: OptimizerConfiguration,
    inflation: Option<InflationAdjustment>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct PlanPayload {
    capital: Option<f64>,
    growth_rate: Option<f64>,
    tax_free_cap: Option<f64>,
    personal_allowance: Option<f64>,
    allowance_taper_threshold: Option<f64>,
    basic_rate_limit: Option<f64>,
    higher_rate_limit: Option<f64>,
    basic_rate: Option<f64>,
    higher_rate: Option<f64>,
    additional_rate: Option<f64>,
    start_year: Option<i32>,
    end_year: Option<i32>,
    target_year: Option<i32>,
    target_residual: Option<f64>,
    bias_pct: Option<f64>,
    real_terms: Option<bool>,
    inflation_rate: Option<f64>,
    reference_year: Option<i32>,
    streams: Option<Vec<ExternalIncomeStream>>,
    drawdown_inputs: Option<Vec<(i32, DrawdownInput)>>,
    ledger_year: Option<i32>,
    apply: Option<bool>,
}

#[derive(Debug)]
struct ApiRequest {
    run: RunRequest,
    inputs: Option<DrawdownInputs>,
    ledger_year: Option<i32>,
    apply: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ProjectResponse {
    projection: Projection,
    /// Table rows in reference-year money; present when real terms are on.
    #[serde(skip_serializing_if = "Option::is_none")]
    real_terms_years: Option<Vec<YearProjection>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ledger: Option<YearLedger>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct OptimizeResponse {
    optimizer: OptimizerResult,
    #[serde(skip_serializing_if = "Option::is_none")]
    projection: Option<Projection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    applied_years: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TaxQuery {
    income: f64,
    personal_allowance: Option<f64>,
    taper_threshold: Option<f64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TaxResponse {
    #[serde(flatten)]
    result: TaxResult,
    monthly_tax: f64,
    net_income: f64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IncomeQuery {
    start_year: Option<i32>,
    end_year: Option<i32>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MilestonesResponse {
    milestones: Vec<PensionMilestone>,
    by_year: BTreeMap<i32, Vec<PensionMilestone>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DrawdownUpdate {
    year: i32,
    tax_free: f64,
    taxable: f64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct SettingsPayload {
    pot: Option<PotUpdate>,
    tax: Option<TaxConfiguration>,
    optimizer: Option<OptimizerUpdate>,
    bias_pct: Option<f64>,
    show_real_terms: Option<bool>,
    inflation_rate: Option<f64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CliReport {
    optimizer: OptimizerResult,
    projection: Projection,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

fn validate_streams(streams: &[ExternalIncomeStream]) -> Result<(), String> {
    for stream in streams {
        if stream.id.trim().is_empty() {
            return Err("streams: every stream needs a non-empty id".to_string());
        }
        if !(EARLIEST_YEAR..=LATEST_YEAR).contains(&stream.start_year) {
            return Err(format!(
                "streams: '{}' startYear must be between {EARLIEST_YEAR} and {LATEST_YEAR}",
                stream.id
            ));
        }
        if !(1..=12).contains(&stream.start_month) {
            return Err(format!(
                "streams: '{}' startMonth must be between 1 and 12",
                stream.id
            ));
        }
        if !stream.annual_income.is_finite() || stream.annual_income < 0.0 {
            return Err(format!("streams: '{}' annualIncome must be >= 0", stream.id));
        }
        if !stream.lump_sum.is_finite() || stream.lump_sum < 0.0 {
            return Err(format!("streams: '{}' lumpSum must be >= 0", stream.id));
        }
        if !stream.index_rate.is_finite() || stream.index_rate <= -1.0 {
            return Err(format!("streams: '{}' indexRate must be > -1", stream.id));
        }
    }
    Ok(())
}

fn validate_horizon(horizon: PlanHorizon) -> Result<(), String> {
    for (field, year) in [("startYear", horizon.start_year), ("endYear", horizon.end_year)] {
        if !(EARLIEST_YEAR..=LATEST_YEAR).contains(&year) {
            return Err(format!(
                "horizon {field} must be between {EARLIEST_YEAR} and {LATEST_YEAR}"
            ));
        }
    }
    if horizon.end_year < horizon.start_year {
        return Err("horizon endYear must be >= startYear".to_string());
    }
    if horizon.end_year - horizon.start_year > MAX_HORIZON_YEARS {
        return Err(format!(
            "horizon must not span more than {MAX_HORIZON_YEARS} years"
        ));
    }
    Ok(())
}

/// Checks every value the engine and optimizer read. Rates are fractions
/// here, not percentages.
fn validate_plan(
    config: &PlanConfig,
    optimizer: &OptimizerConfiguration,
    inflation: InflationAdjustment,
) -> Result<(), String> {
    let pot = &config.pot;
    if !pot.capital.is_finite() || pot.capital < 0.0 {
        return Err("capital must be >= 0".to_string());
    }
    if !(-1.0..=1.0).contains(&pot.growth_rate) {
        return Err("growthRate must be between -1 and 1".to_string());
    }
    if !pot.tax_free_cap.is_finite() || pot.tax_free_cap < 0.0 {
        return Err("taxFreeCap must be >= 0".to_string());
    }

    let tax = &config.tax;
    if !tax.personal_allowance.is_finite() || tax.personal_allowance < 0.0 {
        return Err("personalAllowance must be >= 0".to_string());
    }
    if !tax.taper_threshold.is_finite() || tax.taper_threshold < 0.0 {
        return Err("taperThreshold must be >= 0".to_string());
    }
    validate_bands(tax)?;
    validate_streams(&config.streams)?;
    validate_horizon(config.horizon)?;

    let horizon = config.horizon;
    if optimizer.target_year < horizon.start_year || optimizer.target_year > horizon.end_year {
        return Err("targetYear must lie within the plan horizon".to_string());
    }
    if !optimizer.target_residual.is_finite() || optimizer.target_residual < 0.0 {
        return Err("targetResidual must be >= 0".to_string());
    }
    if !(0.0..=100.0).contains(&optimizer.bias_pct) {
        return Err("biasPct must be between 0 and 100".to_string());
    }

    if !(-0.5..=1.0).contains(&inflation.rate) {
        return Err("inflationRate must be between -0.5 and 1".to_string());
    }
    if !(EARLIEST_YEAR..=LATEST_YEAR).contains(&inflation.reference_year) {
        return Err(format!(
            "referenceYear must be between {EARLIEST_YEAR} and {LATEST_YEAR}"
        ));
    }
    Ok(())
}

fn load_streams(cli: &Cli) -> Result<Vec<ExternalIncomeStream>, String> {
    if let Some(streams) = &cli.streams {
        return Ok(streams.clone());
    }
    if let Some(path) = &cli.streams_file {
        let raw = fs::read_to_string(path)
            .map_err(|e| format!("--streams-file {}: {e}", path.display()))?;
        return serde_json::from_str(&raw)
            .map_err(|e| format!("--streams-file {}: {e}", path.display()));
    }
    if cli.no_default_streams {
        return Ok(Vec::new());
    }
    Ok(default_streams())
}

fn build_request(cli: Cli) -> Result<RunRequest, String> {
    if !cli.capital.is_finite() || cli.capital < 0.0 {
        return Err("--capital must be >= 0".to_string());
    }

    if !(-100.0..=100.0).contains(&cli.growth_rate) {
        return Err("--growth-rate must be between -100 and 100".to_string());
    }

    if !cli.tax_free_cap.is_finite() || cli.tax_free_cap < 0.0 {
        return Err("--tax-free-cap must be >= 0".to_string());
    }

    if !cli.personal_allowance.is_finite() || cli.personal_allowance < 0.0 {
        return Err("--personal-allowance must be >= 0".to_string());
    }

    if !cli.allowance_taper_threshold.is_finite() || cli.allowance_taper_threshold < 0.0 {
        return Err("--allowance-taper-threshold must be >= 0".to_string());
    }

    if cli.basic_rate_limit <= 0.0 {
        return Err("--basic-rate-limit must be > 0".to_string());
    }

    if cli.higher_rate_limit <= cli.basic_rate_limit {
        return Err("--higher-rate-limit must be > --basic-rate-limit".to_string());
    }

    for (flag, rate) in [
        ("--basic-rate", cli.basic_rate),
        ("--higher-rate", cli.higher_rate),
        ("--additional-rate", cli.additional_rate),
    ] {
        if !(0.0..=100.0).contains(&rate) {
            return Err(format!("{flag} must be between 0 and 100"));
        }
    }

    if !(EARLIEST_YEAR..=LATEST_YEAR).contains(&cli.start_year) {
        return Err(format!(
            "--start-year must be between {EARLIEST_YEAR} and {LATEST_YEAR}"
        ));
    }

    if cli.end_year < cli.start_year {
        return Err("--end-year must be >= --start-year".to_string());
    }

    if i64::from(cli.end_year) - i64::from(cli.start_year) > i64::from(MAX_HORIZON_YEARS) {
        return Err(format!(
            "--end-year must be at most {MAX_HORIZON_YEARS} years after --start-year"
        ));
    }

    if cli.target_year < cli.start_year || cli.target_year > cli.end_year {
        return Err("--target-year must be between --start-year and --end-year".to_string());
    }

    if !cli.target_residual.is_finite() || cli.target_residual < 0.0 {
        return Err("--target-residual must be >= 0".to_string());
    }

    if !(0.0..=100.0).contains(&cli.bias_pct) {
        return Err("--bias-pct must be between 0 and 100".to_string());
    }

    if !(-50.0..=100.0).contains(&cli.inflation_rate) {
        return Err("--inflation-rate must be between -50 and 100".to_string());
    }

    if !(EARLIEST_YEAR..=LATEST_YEAR).contains(&cli.reference_year) {
        return Err(format!(
            "--reference-year must be between {EARLIEST_YEAR} and {LATEST_YEAR}"
        ));
    }

    if cli.streams_file.is_some() && cli.no_default_streams {
        return Err("--streams-file cannot be combined with --no-default-streams".to_string());
    }

    let streams = load_streams(&cli)?;

    let tax = TaxConfiguration {
        personal_allowance: cli.personal_allowance,
        taper_threshold: cli.allowance_taper_threshold,
        bands: vec![
            TaxBand {
                name: "Basic Rate".to_string(),
                lower: 0.0,
                upper: Some(cli.basic_rate_limit),
                rate: cli.basic_rate / 100.0,
            },
            TaxBand {
                name: "Higher Rate".to_string(),
                lower: cli.basic_rate_limit,
                upper: Some(cli.higher_rate_limit),
                rate: cli.higher_rate / 100.0,
            },
            TaxBand {
                name: "Additional Rate".to_string(),
                lower: cli.higher_rate_limit,
                upper: None,
                rate: cli.additional_rate / 100.0,
            },
        ],
    };

    let request = RunRequest {
        config: PlanConfig {
            pot: PotConfiguration {
                capital: cli.capital,
                growth_rate: cli.growth_rate / 100.0,
                tax_free_cap: cli.tax_free_cap,
            },
            tax,
            streams,
            horizon: PlanHorizon {
                start_year: cli.start_year,
                end_year: cli.end_year,
            },
        },
        optimizer: OptimizerConfiguration {
            target_year: cli.target_year,
            target_residual: cli.target_residual,
            bias_pct: cli.bias_pct,
        },
        inflation: cli.real_terms.then_some(InflationAdjustment {
            rate: cli.inflation_rate / 100.0,
            reference_year: cli.reference_year,
        }),
    };
    validate_plan(
        &request.config,
        &request.optimizer,
        InflationAdjustment {
            rate: cli.inflation_rate / 100.0,
            reference_year: cli.reference_year,
        },
    )?;
    Ok(request)
}

/// Runs the optimizer for the given command line and returns the plan plus
/// its projection as pretty JSON. `--help` output comes back as `Ok`.
pub fn run_cli<I, T>(args: I) -> Result<String, String>
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    let cli = match Cli::try_parse_from(args) {
        Ok(cli) => cli,
        Err(e) => {
            use clap::error::ErrorKind;
            return match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => Ok(e.to_string()),
                _ => Err(e.to_string()),
            };
        }
    };
    let request = build_request(cli)?;
    let optimizer = optimize_plan(&request.config, &request.optimizer);
    let projection = run_projection(&request.config, &optimizer.plan, request.inflation);
    serde_json::to_string_pretty(&CliReport {
        optimizer,
        projection,
    })
    .map_err(|e| format!("failed to serialize report: {e}"))
}

pub fn router(store: SharedStore) -> Router {
    Router::new()
        .route("/api/defaults", get(defaults_handler))
        .route("/api/project", post(project_handler))
        .route("/api/optimize", post(optimize_handler))
        .route("/api/tax", get(tax_handler))
        .route("/api/income", get(income_handler))
        .route("/api/milestones", get(milestones_handler))
        .route(
            "/api/state",
            get(get_state_handler)
                .put(put_state_handler)
                .delete(delete_state_handler),
        )
        .route("/api/state/drawdown", post(update_drawdown_handler))
        .route("/api/state/settings", post(update_settings_handler))
        .route("/api/state/reset", post(reset_state_handler))
        .route("/api/state/projection", get(state_projection_handler))
        .route("/api/state/optimize", post(state_optimize_handler))
        .fallback(not_found_handler)
        .with_state(store)
}

pub async fn run_http_server(port: u16, store: SharedStore) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let app = router(store);

    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "drawdown HTTP API listening");
    info!("local access: http://127.0.0.1:{port}/api/defaults");

    axum::serve(listener, app).await
}

async fn not_found_handler() -> Response {
    error_response(StatusCode::NOT_FOUND, "Not found")
}

async fn defaults_handler() -> Response {
    json_response(StatusCode::OK, PlannerState::default())
}

async fn project_handler(Json(payload): Json<PlanPayload>) -> Response {
    let request = match api_request_from_payload(payload) {
        Ok(request) => request,
        Err(msg) => return error_response(StatusCode::BAD_REQUEST, &msg),
    };
    let config = &request.run.config;
    let inputs = request
        .inputs
        .unwrap_or_else(|| initial_drawdown_inputs(config.horizon));

    let ledger = match request.ledger_year {
        Some(year) => match year_ledger(config, &inputs, year) {
            Some(ledger) => Some(ledger),
            None => {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    &format!("ledgerYear {year} is outside the plan horizon"),
                );
            }
        },
        None => None,
    };

    json_response(
        StatusCode::OK,
        projection_response(config, &inputs, request.run.inflation, ledger),
    )
}

fn projection_response(
    config: &PlanConfig,
    inputs: &DrawdownInputs,
    inflation: Option<InflationAdjustment>,
    ledger: Option<YearLedger>,
) -> ProjectResponse {
    let projection = run_projection(config, inputs, inflation);
    let real_terms_years = inflation.map(|adjustment| {
        projection
            .years
            .iter()
            .map(|year| year.in_real_terms(adjustment))
            .collect()
    });
    ProjectResponse {
        projection,
        real_terms_years,
        ledger,
    }
}

async fn optimize_handler(Json(payload): Json<PlanPayload>) -> Response {
    let request = match api_request_from_payload(payload) {
        Ok(request) => request,
        Err(msg) => return error_response(StatusCode::BAD_REQUEST, &msg),
    };
    let run = &request.run;
    let optimizer = optimize_plan(&run.config, &run.optimizer);
    let projection = request
        .apply
        .then(|| run_projection(&run.config, &optimizer.plan, run.inflation));

    json_response(
        StatusCode::OK,
        OptimizeResponse {
            optimizer,
            projection,
            applied_years: None,
        },
    )
}

async fn tax_handler(Query(query): Query<TaxQuery>) -> Response {
    if !query.income.is_finite() {
        return error_response(StatusCode::BAD_REQUEST, "income must be a finite number");
    }
    let mut tax = default_tax_config();
    if let Some(v) = query.personal_allowance {
        tax.personal_allowance = v;
    }
    if let Some(v) = query.taper_threshold {
        tax.taper_threshold = v;
    }

    let result = calculate_tax(query.income, &tax);
    let response = TaxResponse {
        monthly_tax: result.total_tax / 12.0,
        net_income: net_income(result.gross_income, result.total_tax),
        result,
    };
    json_response(StatusCode::OK, response)
}

async fn income_handler(
    State(store): State<SharedStore>,
    Query(query): Query<IncomeQuery>,
) -> Response {
    let state = match store.load_or_default() {
        Ok(state) => state,
        Err(err) => return store_failure(err),
    };
    let start = query.start_year.unwrap_or(state.horizon.start_year);
    let end = query
        .end_year
        .unwrap_or(state.horizon.end_year.saturating_sub(1));
    if end < start {
        return error_response(StatusCode::BAD_REQUEST, "endYear must be >= startYear");
    }
    if i64::from(end) - i64::from(start) > MAX_INCOME_RANGE_YEARS {
        return error_response(
            StatusCode::BAD_REQUEST,
            &format!("year range must not exceed {MAX_INCOME_RANGE_YEARS} years"),
        );
    }

    let income: BTreeMap<i32, ExternalIncome> =
        project_external_income(&state.streams, start, end);
    json_response(StatusCode::OK, income)
}

async fn milestones_handler(State(store): State<SharedStore>) -> Response {
    match store.load_or_default() {
        Ok(state) => json_response(
            StatusCode::OK,
            MilestonesResponse {
                milestones: pension_milestones(&state.streams),
                by_year: grouped_milestones(&state.streams),
            },
        ),
        Err(err) => store_failure(err),
    }
}

async fn get_state_handler(State(store): State<SharedStore>) -> Response {
    match store.load_or_default() {
        Ok(state) => json_response(StatusCode::OK, state),
        Err(err) => store_failure(err),
    }
}

async fn put_state_handler(
    State(store): State<SharedStore>,
    Json(state): Json<PlannerState>,
) -> Response {
    if let Err(msg) = validate_state(&state) {
        return error_response(StatusCode::BAD_REQUEST, &msg);
    }
    let saved = store.save(&state).map(|()| state);
    state_response(saved)
}

async fn delete_state_handler(State(store): State<SharedStore>) -> Response {
    match store.clear() {
        Ok(()) => json_response(StatusCode::OK, PlannerState::default()),
        Err(err) => store_failure(err),
    }
}

async fn update_drawdown_handler(
    State(store): State<SharedStore>,
    Json(update): Json<DrawdownUpdate>,
) -> Response {
    if !(update.tax_free >= 0.0 && update.taxable >= 0.0) {
        return error_response(
            StatusCode::BAD_REQUEST,
            "taxFree and taxable must be >= 0",
        );
    }
    let year = update.year;
    let input = DrawdownInput {
        tax_free: update.tax_free,
        taxable: update.taxable,
    };
    let updated = store.update(&mut |state: &mut PlannerState| {
        if state.update_drawdown(year, input) {
            Ok(())
        } else {
            Err(StoreError::UnknownYear(year))
        }
    });
    state_response(updated)
}

async fn update_settings_handler(
    State(store): State<SharedStore>,
    Json(payload): Json<SettingsPayload>,
) -> Response {
    let updated = store.update(&mut |state: &mut PlannerState| {
        apply_settings(state, &payload);
        validate_state(state).map_err(StoreError::Invalid)
    });
    state_response(updated)
}

fn apply_settings(state: &mut PlannerState, payload: &SettingsPayload) {
    if let Some(update) = payload.pot {
        state.update_pot(update);
    }
    if let Some(tax) = &payload.tax {
        state.update_tax(tax.clone());
    }
    if let Some(update) = payload.optimizer {
        state.update_optimizer(update);
    }
    if let Some(v) = payload.bias_pct {
        state.set_bias_pct(v);
    }
    if let Some(v) = payload.show_real_terms {
        state.set_show_real_terms(v);
    }
    if let Some(v) = payload.inflation_rate {
        state.set_inflation_rate(v);
    }
}

async fn reset_state_handler(State(store): State<SharedStore>) -> Response {
    state_response(store.update(&mut |state: &mut PlannerState| {
        state.reset();
        Ok(())
    }))
}

async fn state_projection_handler(State(store): State<SharedStore>) -> Response {
    let state = match store.load_or_default() {
        Ok(state) => state,
        Err(err) => return store_failure(err),
    };
    if let Err(msg) = validate_state(&state) {
        return store_failure(stored_state_invalid(msg));
    }
    json_response(
        StatusCode::OK,
        projection_response(
            &state.plan_config(),
            &state.drawdown_inputs,
            state.inflation(),
            None,
        ),
    )
}

/// Optimizes the stored configuration and writes the plan back into the
/// stored drawdown inputs in one store update.
async fn state_optimize_handler(State(store): State<SharedStore>) -> Response {
    let mut outcome = None;
    let updated = store.update(&mut |state: &mut PlannerState| {
        validate_state(state).map_err(stored_state_invalid)?;
        let optimizer = optimize_plan(&state.plan_config(), &state.optimizer);
        let applied = state.apply_plan(&optimizer.plan);
        outcome = Some((optimizer, applied));
        Ok(())
    });
    let state = match updated {
        Ok(state) => state,
        Err(err) => return store_failure(err),
    };
    let Some((optimizer, applied)) = outcome else {
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "optimizer did not run");
    };

    let projection =
        run_projection(&state.plan_config(), &state.drawdown_inputs, state.inflation());
    json_response(
        StatusCode::OK,
        OptimizeResponse {
            optimizer,
            projection: Some(projection),
            applied_years: Some(applied),
        },
    )
}

fn validate_state(state: &PlannerState) -> Result<(), String> {
    validate_plan(
        &state.plan_config(),
        &state.optimizer,
        InflationAdjustment {
            rate: state.inflation_rate,
            reference_year: state.reference_year,
        },
    )?;
    let negative = state
        .drawdown_inputs
        .iter()
        .find(|(_, input)| !(input.tax_free >= 0.0 && input.taxable >= 0.0));
    if let Some((year, _)) = negative {
        return Err(format!("drawdownInputs for {year} must not be negative"));
    }
    Ok(())
}

fn stored_state_invalid(msg: String) -> StoreError {
    StoreError::Invalid(format!("stored state is invalid: {msg}"))
}

fn state_response(result: Result<PlannerState, StoreError>) -> Response {
    match result {
        Ok(state) => json_response(StatusCode::OK, state),
        Err(err) => store_failure(err),
    }
}

fn store_failure(err: StoreError) -> Response {
    match err {
        StoreError::Invalid(msg) => error_response(StatusCode::BAD_REQUEST, &msg),
        StoreError::UnknownYear(_) => error_response(StatusCode::NOT_FOUND, &err.to_string()),
        err => {
            warn!(error = %err, "planner store failure");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string())
        }
    }
}

fn json_response<T: Serialize>(status: StatusCode, body: T) -> Response {
    let mut response = (status, Json(body)).into_response();
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
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

#[cfg(test)]
fn api_request_from_json(json: &str) -> Result<ApiRequest, String> {
    let payload = serde_json::from_str::<PlanPayload>(json)
        .map_err(|e| format!("Invalid API JSON payload: {e}"))?;
    api_request_from_payload(payload)
}

fn api_request_from_payload(payload: PlanPayload) -> Result<ApiRequest, String> {
    let mut cli = default_cli_for_api();

    if let Some(v) = payload.capital {
        cli.capital = v;
    }
    if let Some(v) = payload.growth_rate {
        cli.growth_rate = v;
    }
    if let Some(v) = payload.tax_free_cap {
        cli.tax_free_cap = v;
    }
    if let Some(v) = payload.personal_allowance {
        cli.personal_allowance = v;
    }
    if let Some(v) = payload.allowance_taper_threshold {
        cli.allowance_taper_threshold = v;
    }
    if let Some(v) = payload.basic_rate_limit {
        cli.basic_rate_limit = v;
    }
    if let Some(v) = payload.higher_rate_limit {
        cli.higher_rate_limit = v;
    }
    if let Some(v) = payload.basic_rate {
        cli.basic_rate = v;
    }
    if let Some(v) = payload.higher_rate {
        cli.higher_rate = v;
    }
    if let Some(v) = payload.additional_rate {
        cli.additional_rate = v;
    }
    if let Some(v) = payload.start_year {
        cli.start_year = v;
    }
    if let Some(v) = payload.end_year {
        cli.end_year = v;
    }
    if let Some(v) = payload.target_year {
        cli.target_year = v;
    }
    if let Some(v) = payload.target_residual {
        cli.target_residual = v;
    }
    if let Some(v) = payload.bias_pct {
        cli.bias_pct = v;
    }
    if let Some(v) = payload.real_terms {
        cli.real_terms = v;
    }
    if let Some(v) = payload.inflation_rate {
        cli.inflation_rate = v;
    }
    if let Some(v) = payload.reference_year {
        cli.reference_year = v;
    }
    cli.streams = payload.streams;

    let run = build_request(cli)?;

    let inputs = match payload.drawdown_inputs {
        Some(pairs) => {
            if pairs
                .iter()
                .any(|(_, input)| !(input.tax_free >= 0.0 && input.taxable >= 0.0))
            {
                return Err("drawdownInputs must not contain negative requests".to_string());
            }
            Some(pairs.into_iter().collect())
        }
        None => None,
    };

    Ok(ApiRequest {
        run,
        inputs,
        ledger_year: payload.ledger_year,
        apply: payload.apply.unwrap_or(false),
    })
}

fn default_cli_for_api() -> Cli {
    Cli {
        capital: DEFAULT_CAPITAL,
        growth_rate: 4.0,
        tax_free_cap: DEFAULT_TAX_FREE_CAP,
        personal_allowance: DEFAULT_PERSONAL_ALLOWANCE,
        allowance_taper_threshold: ALLOWANCE_TAPER_THRESHOLD,
        basic_rate_limit: 37_700.0,
        higher_rate_limit: 112_570.0,
        basic_rate: 20.0,
        higher_rate: 40.0,
        additional_rate: 45.0,
        start_year: START_YEAR,
        end_year: END_YEAR,
        target_year: DEFAULT_TARGET_YEAR,
        target_residual: DEFAULT_TARGET_RESIDUAL,
        bias_pct: 20.0,
        real_terms: false,
        inflation_rate: 3.26,
        reference_year: DEFAULT_REFERENCE_YEAR,
        streams_file: None,
        no_default_streams: false,
        streams: None,
    }
}
