//! Persisted planner settings.
//!
//! The engine never touches this state directly: callers read a
//! [`PlannerState`], build a [`PlanConfig`] from it, and write back a
//! replacement through a [`SnapshotStore`].

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::defaults::{
    DEFAULT_INFLATION_RATE, DEFAULT_REFERENCE_YEAR, DEFAULT_TAX_FREE_DRAWDOWN,
    DEFAULT_TAXABLE_DRAWDOWN, default_horizon, default_pot_config, default_streams,
    default_tax_config,
};
use crate::core::{
    DrawdownInput, DrawdownInputs, ExternalIncomeStream, InflationAdjustment,
    OptimizerConfiguration, PlanConfig, PlanHorizon, PotConfiguration, TaxConfiguration,
};

pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialize(serde_json::Error),

    #[error("Parse error: {0}")]
    Parse(serde_json::Error),

    #[error("Unsupported snapshot version {0}")]
    UnsupportedVersion(u32),

    #[error("Store lock poisoned")]
    Lock,

    #[error("{0}")]
    Invalid(String),

    #[error("year {0} is not in the stored plan")]
    UnknownYear(i32),
}

/// Every horizon year seeded with the default requests.
pub fn initial_drawdown_inputs(horizon: PlanHorizon) -> DrawdownInputs {
    horizon
        .years()
        .map(|year| {
            (
                year,
                DrawdownInput {
                    tax_free: DEFAULT_TAX_FREE_DRAWDOWN,
                    taxable: DEFAULT_TAXABLE_DRAWDOWN,
                },
            )
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PlannerState {
    pub pot: PotConfiguration,
    pub tax: TaxConfiguration,
    pub streams: Vec<ExternalIncomeStream>,
    pub horizon: PlanHorizon,
    #[serde(with = "year_pairs")]
    pub drawdown_inputs: DrawdownInputs,
    pub optimizer: OptimizerConfiguration,
    pub show_real_terms: bool,
    pub inflation_rate: f64,
    pub reference_year: i32,
}

impl Default for PlannerState {
    fn default() -> Self {
        let horizon = default_horizon();
        Self {
            pot: default_pot_config(),
            tax: default_tax_config(),
            streams: default_streams(),
            horizon,
            drawdown_inputs: initial_drawdown_inputs(horizon),
            optimizer: OptimizerConfiguration::default(),
            show_real_terms: false,
            inflation_rate: DEFAULT_INFLATION_RATE,
            reference_year: DEFAULT_REFERENCE_YEAR,
        }
    }
}

/// Partial pot update; `None` keeps the current value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PotUpdate {
    pub capital: Option<f64>,
    pub growth_rate: Option<f64>,
    pub tax_free_cap: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct OptimizerUpdate {
    pub target_year: Option<i32>,
    pub target_residual: Option<f64>,
    pub bias_pct: Option<f64>,
}

impl PlannerState {
    pub fn plan_config(&self) -> PlanConfig {
        PlanConfig {
            pot: self.pot,
            tax: self.tax.clone(),
            streams: self.streams.clone(),
            horizon: self.horizon,
        }
    }

    /// Inflation adjustment for display, only when real terms are switched on.
    pub fn inflation(&self) -> Option<InflationAdjustment> {
        self.show_real_terms.then_some(InflationAdjustment {
            rate: self.inflation_rate,
            reference_year: self.reference_year,
        })
    }

    pub fn update_pot(&mut self, update: PotUpdate) {
        if let Some(v) = update.capital {
            self.pot.capital = v;
        }
        if let Some(v) = update.growth_rate {
            self.pot.growth_rate = v;
        }
        if let Some(v) = update.tax_free_cap {
            self.pot.tax_free_cap = v;
        }
    }

    pub fn update_tax(&mut self, tax: TaxConfiguration) {
        self.tax = tax;
    }

    /// Overwrites one year's requests. Years outside the stored plan are
    /// ignored; returns whether anything changed.
    pub fn update_drawdown(&mut self, year: i32, input: DrawdownInput) -> bool {
        match self.drawdown_inputs.get_mut(&year) {
            Some(existing) => {
                *existing = input;
                true
            }
            None => false,
        }
    }

    /// Copies an optimizer plan over the stored years it shares with them.
    pub fn apply_plan(&mut self, plan: &DrawdownInputs) -> usize {
        let mut applied = 0;
        for (year, input) in plan {
            if self.update_drawdown(*year, *input) {
                applied += 1;
            }
        }
        debug!(applied, offered = plan.len(), "applied drawdown plan");
        applied
    }

    pub fn set_bias_pct(&mut self, bias_pct: f64) {
        self.optimizer.bias_pct = bias_pct;
    }

    pub fn update_optimizer(&mut self, update: OptimizerUpdate) {
        if let Some(v) = update.target_year {
            self.optimizer.target_year = v;
        }
        if let Some(v) = update.target_residual {
            self.optimizer.target_residual = v;
        }
        if let Some(v) = update.bias_pct {
            self.optimizer.bias_pct = v;
        }
    }

    pub fn set_show_real_terms(&mut self, value: bool) {
        self.show_real_terms = value;
    }

    pub fn set_inflation_rate(&mut self, rate: f64) {
        self.inflation_rate = rate;
    }

    pub fn reset(&mut self) {
        *self = PlannerState::default();
    }
}

#[derive(Serialize)]
struct SnapshotRef<'a> {
    version: u32,
    state: &'a PlannerState,
}

#[derive(Deserialize)]
struct Snapshot {
    #[serde(default = "current_version")]
    version: u32,
    #[serde(default)]
    state: PlannerState,
}

fn current_version() -> u32 {
    SNAPSHOT_VERSION
}

pub fn encode_snapshot(state: &PlannerState) -> Result<String, StoreError> {
    serde_json::to_string_pretty(&SnapshotRef {
        version: SNAPSHOT_VERSION,
        state,
    })
    .map_err(StoreError::Serialize)
}

pub fn decode_snapshot(raw: &str) -> Result<PlannerState, StoreError> {
    let snapshot: Snapshot = serde_json::from_str(raw).map_err(StoreError::Parse)?;
    if snapshot.version > SNAPSHOT_VERSION {
        return Err(StoreError::UnsupportedVersion(snapshot.version));
    }
    Ok(snapshot.state)
}

pub trait SnapshotStore: Send + Sync {
    /// `Ok(None)` when nothing has been saved yet.
    fn load(&self) -> Result<Option<PlannerState>, StoreError>;
    fn save(&self, state: &PlannerState) -> Result<(), StoreError>;
    fn clear(&self) -> Result<(), StoreError>;

    /// Loads (or defaults), applies `edit` and saves, all under one lock.
    /// Nothing is written when `edit` fails.
    fn update(
        &self,
        edit: &mut dyn FnMut(&mut PlannerState) -> Result<(), StoreError>,
    ) -> Result<PlannerState, StoreError>;

    fn load_or_default(&self) -> Result<PlannerState, StoreError> {
        Ok(self.load()?.unwrap_or_default())
    }
}

/// One JSON file on disk, replaced wholesale on every save. Access is
/// serialized within this process only.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    guard: Mutex<()>,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            guard: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<Option<PlannerState>, StoreError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&self.path)?;
        debug!(path = %self.path.display(), bytes = raw.len(), "loaded planner snapshot");
        decode_snapshot(&raw).map(Some)
    }

    fn write(&self, state: &PlannerState) -> Result<(), StoreError> {
        let encoded = encode_snapshot(state)?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, &encoded)?;
        fs::rename(&tmp, &self.path)?;
        debug!(path = %self.path.display(), bytes = encoded.len(), "saved planner snapshot");
        Ok(())
    }
}

impl SnapshotStore for JsonFileStore {
    fn load(&self) -> Result<Option<PlannerState>, StoreError> {
        let _guard = self.guard.lock().map_err(|_| StoreError::Lock)?;
        self.read()
    }

    fn save(&self, state: &PlannerState) -> Result<(), StoreError> {
        let _guard = self.guard.lock().map_err(|_| StoreError::Lock)?;
        self.write(state)
    }

    fn update(
        &self,
        edit: &mut dyn FnMut(&mut PlannerState) -> Result<(), StoreError>,
    ) -> Result<PlannerState, StoreError> {
        let _guard = self.guard.lock().map_err(|_| StoreError::Lock)?;
        let mut state = self.read()?.unwrap_or_default();
        edit(&mut state)?;
        self.write(&state)?;
        Ok(state)
    }

    fn clear(&self) -> Result<(), StoreError> {
        let _guard = self.guard.lock().map_err(|_| StoreError::Lock)?;
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Keeps the encoded snapshot in memory; used by the server when no file is
/// configured.
#[derive(Debug, Default)]
pub struct MemoryStore {
    encoded: Mutex<Option<String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SnapshotStore for MemoryStore {
    fn load(&self) -> Result<Option<PlannerState>, StoreError> {
        let guard = self.encoded.lock().map_err(|_| StoreError::Lock)?;
        guard.as_deref().map(decode_snapshot).transpose()
    }

    fn save(&self, state: &PlannerState) -> Result<(), StoreError> {
        let encoded = encode_snapshot(state)?;
        let mut guard = self.encoded.lock().map_err(|_| StoreError::Lock)?;
        *guard = Some(encoded);
        Ok(())
    }

    fn update(
        &self,
        edit: &mut dyn FnMut(&mut PlannerState) -> Result<(), StoreError>,
    ) -> Result<PlannerState, StoreError> {
        let mut guard = self.encoded.lock().map_err(|_| StoreError::Lock)?;
        let mut state = guard
            .as_deref()
            .map(decode_snapshot)
            .transpose()?
            .unwrap_or_default();
        edit(&mut state)?;
        *guard = Some(encode_snapshot(&state)?);
        Ok(state)
    }

    fn clear(&self) -> Result<(), StoreError> {
        let mut guard = self.encoded.lock().map_err(|_| StoreError::Lock)?;
        *guard = None;
        Ok(())
    }
}

/// Drawdown map as an ordered list of `[year, entry]` pairs.
mod year_pairs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use crate::core::{DrawdownInput, DrawdownInputs};

    pub fn serialize<S>(inputs: &DrawdownInputs, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let pairs: Vec<(i32, DrawdownInput)> =
            inputs.iter().map(|(year, input)| (*year, *input)).collect();
        pairs.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DrawdownInputs, D::Error>
    where
        D: Deserializer<'de>,
    {
        let pairs = Vec::<(i32, DrawdownInput)>::deserialize(deserializer)?;
        Ok(pairs.into_iter().collect())
    }
}
