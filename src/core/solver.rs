use tracing::{debug, trace, warn};

use super::engine::split_pots;
use super::growth::grow_year;
use super::income::external_income_total;
use super::types::{
    DrawdownInput, DrawdownInputs, OptimizerConfiguration, OptimizerResult, PlanConfig,
};

pub const BOOSTED_YEARS: u32 = 10;
pub const MAX_ITERATIONS: u32 = 50;
pub const TOLERANCE: f64 = 100.0;
const MAX_BRACKET_EXPANSIONS: u32 = 16;

/// A single-parameter search problem whose residual (achieved minus goal)
/// never increases as the candidate withdrawal grows.
pub trait MonotoneObjective {
    fn residual(&self, candidate: f64) -> f64;
    /// Initial upper end of the bracket; the lower end is always zero.
    fn upper_bound(&self) -> f64;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchOutcome {
    pub value: f64,
    pub converged: bool,
    pub iterations: u32,
}

/// Bounded bisection over `[0, upper]`.
///
/// Returns zero when no withdrawal at all already lands at or below the goal;
/// that is only converged when zero lands within `TOLERANCE` of it. Stops as
/// soon as the residual is within `TOLERANCE`; otherwise returns the last
/// midpoint after `MAX_ITERATIONS`.
pub fn bisect<O: MonotoneObjective>(objective: &O, label: &'static str) -> SearchOutcome {
    let at_zero = objective.residual(0.0);
    if at_zero < TOLERANCE {
        let converged = at_zero > -TOLERANCE;
        if !converged {
            warn!(
                search = label,
                residual = at_zero,
                "goal unreachable even with zero withdrawal"
            );
        }
        return SearchOutcome {
            value: 0.0,
            converged,
            iterations: 0,
        };
    }

    let mut low = 0.0;
    let mut high = objective.upper_bound().max(TOLERANCE);
    let mut expansions = 0;
    while objective.residual(high) > 0.0 && expansions < MAX_BRACKET_EXPANSIONS {
        low = high;
        high *= 2.0;
        expansions += 1;
    }

    let mut best = high;
    for iteration in 1..=MAX_ITERATIONS {
        let mid = (low + high) * 0.5;
        let residual = objective.residual(mid);
        trace!(search = label, iteration, candidate = mid, residual, "bisection step");

        if residual.abs() < TOLERANCE {
            return SearchOutcome {
                value: mid,
                converged: true,
                iterations: iteration,
            };
        }
        if residual > 0.0 {
            low = mid;
        } else {
            high = mid;
        }
        best = mid;
    }

    warn!(
        search = label,
        value = best,
        "bisection reached the iteration cap; using last estimate"
    );
    SearchOutcome {
        value: best,
        converged: false,
        iterations: MAX_ITERATIONS,
    }
}

/// Constant annual withdrawal from one pot over `years`, paid monthly.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LevelWithdrawal {
    pub start_balance: f64,
    pub annual_rate: f64,
    pub years: u32,
    pub target: f64,
}

impl LevelWithdrawal {
    /// Closed-form monthly annuity: the withdrawal that takes the balance to
    /// `target` if the pot never runs dry. Zero growth falls back to a
    /// straight-line split.
    pub fn annuity_estimate(&self) -> f64 {
        if self.years == 0 {
            return 0.0;
        }
        let months = (self.years * 12) as i32;
        let monthly_rate = self.annual_rate / 12.0;
        if monthly_rate.abs() < 1e-12 {
            return (self.start_balance - self.target) / self.years as f64;
        }
        let growth = (1.0 + monthly_rate).powi(months);
        let withdrawable = self.start_balance * growth - self.target;
        let annuity_factor = (growth - 1.0) / monthly_rate;
        12.0 * withdrawable / annuity_factor
    }

    /// End balance net of any withdrawal the pot could not cover, so the
    /// result keeps falling after the pot is exhausted.
    pub fn simulate(&self, annual_withdrawal: f64) -> f64 {
        let mut balance = self.start_balance;
        let mut shortfall = 0.0;
        for _ in 0..self.years {
            let year = grow_year(balance, self.annual_rate, annual_withdrawal);
            shortfall += annual_withdrawal - year.total_drawdown;
            balance = year.end_balance;
        }
        balance - shortfall
    }
}

impl MonotoneObjective for LevelWithdrawal {
    fn residual(&self, candidate: f64) -> f64 {
        self.simulate(candidate) - self.target
    }

    fn upper_bound(&self) -> f64 {
        self.annuity_estimate().max(0.0) * 3.0
    }
}

pub fn solve_level_withdrawal(problem: &LevelWithdrawal) -> SearchOutcome {
    if problem.years == 0 {
        return SearchOutcome {
            value: 0.0,
            converged: true,
            iterations: 0,
        };
    }
    bisect(problem, "level-withdrawal")
}

/// Both pot balances plus any taxable request the pot failed to cover.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PotState {
    pub tax_free: f64,
    pub taxable: f64,
    pub shortfall: f64,
}

impl PotState {
    pub fn signed_taxable(&self) -> f64 {
        self.taxable - self.shortfall
    }
}

/// One simulated year: the tax-free pot pays its fixed amount, external
/// income counts next, and the taxable pot is asked for the remaining gap.
fn step_year(
    state: PotState,
    annual_rate: f64,
    tax_free_annual: f64,
    income_target: f64,
    external: f64,
) -> (PotState, DrawdownInput) {
    let tax_free_request = if state.tax_free > 0.0 {
        tax_free_annual
    } else {
        0.0
    };
    let tax_free_year = grow_year(state.tax_free, annual_rate, tax_free_request);
    let taxable_request = (income_target - external - tax_free_year.total_drawdown).max(0.0);
    let taxable_year = grow_year(state.taxable, annual_rate, taxable_request);

    let next = PotState {
        tax_free: tax_free_year.end_balance,
        taxable: taxable_year.end_balance,
        shortfall: state.shortfall + (taxable_request - taxable_year.total_drawdown),
    };
    let request = DrawdownInput {
        tax_free: tax_free_request,
        taxable: taxable_request,
    };
    (next, request)
}

/// Constant income target across `externals.len()` years.
pub fn simulate_income_phase(
    entry: PotState,
    annual_rate: f64,
    tax_free_annual: f64,
    income_target: f64,
    externals: &[f64],
) -> PotState {
    externals.iter().fold(entry, |state, external| {
        step_year(state, annual_rate, tax_free_annual, income_target, *external).0
    })
}

/// Boosted income for the first `boosted_years`, base income afterwards.
/// Requests are appended to `record` when given.
pub fn simulate_two_phase(
    entry: PotState,
    schedule: &TwoPhaseSchedule<'_>,
    boosted_income: f64,
    base_income: f64,
    mut record: Option<&mut Vec<DrawdownInput>>,
) -> PotState {
    let mut state = entry;
    for (idx, external) in schedule.externals.iter().enumerate() {
        let income_target = if idx < schedule.boosted_years {
            boosted_income
        } else {
            base_income
        };
        let (next, request) = step_year(
            state,
            schedule.annual_rate,
            schedule.tax_free_annual,
            income_target,
            *external,
        );
        if let Some(requests) = record.as_deref_mut() {
            requests.push(request);
        }
        state = next;
    }
    state
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TwoPhaseSchedule<'a> {
    pub annual_rate: f64,
    pub tax_free_annual: f64,
    /// External income for each year of the window, in order.
    pub externals: &'a [f64],
    pub boosted_years: usize,
}

/// Income seed: the taxable pot's level annuity plus what the tax-free pot
/// and external streams contribute on average.
fn income_seed(taxable: &LevelWithdrawal, tax_free_annual: f64, externals: &[f64]) -> f64 {
    let mean_external = if externals.is_empty() {
        0.0
    } else {
        externals.iter().sum::<f64>() / externals.len() as f64
    };
    taxable.annuity_estimate().max(0.0) + tax_free_annual + mean_external
}

/// The constant income the later years can sustain from a given entry state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhaseTwoIncome<'a> {
    pub entry: PotState,
    pub annual_rate: f64,
    pub tax_free_annual: f64,
    pub externals: &'a [f64],
    pub target: f64,
}

impl MonotoneObjective for PhaseTwoIncome<'_> {
    fn residual(&self, candidate: f64) -> f64 {
        simulate_income_phase(
            self.entry,
            self.annual_rate,
            self.tax_free_annual,
            candidate,
            self.externals,
        )
        .signed_taxable()
            - self.target
    }

    fn upper_bound(&self) -> f64 {
        let level = LevelWithdrawal {
            start_balance: self.entry.taxable,
            annual_rate: self.annual_rate,
            years: self.externals.len() as u32,
            target: self.target,
        };
        income_seed(&level, self.tax_free_annual, self.externals) * 3.0
    }
}

/// Outer search over the boosted income. Base income is tied to it through
/// the bias multiplier, so one figure fixes the whole taxable schedule and
/// the terminal taxable balance falls as it rises.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoostedIncome<'a> {
    pub entry: PotState,
    pub schedule: TwoPhaseSchedule<'a>,
    pub bias_multiplier: f64,
    pub target: f64,
}

impl BoostedIncome<'_> {
    pub fn base_income(&self, boosted_income: f64) -> f64 {
        boosted_income / self.bias_multiplier
    }

    fn phase_split(&self) -> usize {
        self.schedule.boosted_years.min(self.schedule.externals.len())
    }

    /// Pot state once the boosted years are over.
    pub fn phase_one_exit(&self, boosted_income: f64) -> PotState {
        simulate_income_phase(
            self.entry,
            self.schedule.annual_rate,
            self.schedule.tax_free_annual,
            boosted_income,
            &self.schedule.externals[..self.phase_split()],
        )
    }

    /// Level income the remaining years can sustain after boosting at
    /// `boosted_income`. Zero when every year is boosted.
    pub fn phase_two_income(&self, boosted_income: f64) -> f64 {
        let split = self.phase_split();
        if split == self.schedule.externals.len() {
            return 0.0;
        }
        let problem = PhaseTwoIncome {
            entry: self.phase_one_exit(boosted_income),
            annual_rate: self.schedule.annual_rate,
            tax_free_annual: self.schedule.tax_free_annual,
            externals: &self.schedule.externals[split..],
            target: self.target,
        };
        bisect(&problem, "phase-two-income").value
    }

    pub fn terminal(&self, boosted_income: f64) -> PotState {
        simulate_two_phase(
            self.entry,
            &self.schedule,
            boosted_income,
            self.base_income(boosted_income),
            None,
        )
    }
}

impl MonotoneObjective for BoostedIncome<'_> {
    fn residual(&self, candidate: f64) -> f64 {
        self.terminal(candidate).signed_taxable() - self.target
    }

    fn upper_bound(&self) -> f64 {
        let level = LevelWithdrawal {
            start_balance: self.entry.taxable,
            annual_rate: self.schedule.annual_rate,
            years: self.schedule.externals.len() as u32,
            target: self.target,
        };
        income_seed(&level, self.schedule.tax_free_annual, self.schedule.externals)
            * 3.0
            * self.bias_multiplier
    }
}

pub fn bias_multiplier(bias_pct: f64) -> f64 {
    (1.0 + bias_pct / 100.0).max(f64::EPSILON)
}

/// Solves the two-pot plan and lays it over the whole horizon.
///
/// Years from the target year onwards get zero requests from both pots.
/// Replaying the returned plan through `run_projection` reproduces the
/// simulated balances exactly.
pub fn optimize_plan(config: &PlanConfig, optimizer: &OptimizerConfiguration) -> OptimizerResult {
    let split = split_pots(&config.pot, &config.streams);
    let annual_rate = config.pot.growth_rate;
    let start_year = config.horizon.start_year;
    let total_years = optimizer.target_year.saturating_sub(start_year).max(0) as u32;
    let boosted_years = BOOSTED_YEARS.min(total_years);
    let multiplier = bias_multiplier(optimizer.bias_pct);
    let target = optimizer.target_residual.max(0.0);

    let externals: Vec<f64> = (0..total_years as i32)
        .map(|offset| external_income_total(&config.streams, start_year + offset))
        .collect();

    let tax_free = solve_level_withdrawal(&LevelWithdrawal {
        start_balance: split.tax_free,
        annual_rate,
        years: total_years,
        target: 0.0,
    });

    let entry = PotState {
        tax_free: split.tax_free,
        taxable: split.taxable,
        shortfall: 0.0,
    };
    let schedule = TwoPhaseSchedule {
        annual_rate,
        tax_free_annual: tax_free.value,
        externals: &externals,
        boosted_years: boosted_years as usize,
    };
    let boosted_problem = BoostedIncome {
        entry,
        schedule,
        bias_multiplier: multiplier,
        target,
    };

    let boosted = if total_years == 0 {
        SearchOutcome {
            value: 0.0,
            converged: true,
            iterations: 0,
        }
    } else {
        bisect(&boosted_problem, "boosted-income")
    };
    let boosted_income = boosted.value;
    let base_income = boosted_problem.base_income(boosted_income);
    let phase_two_income = boosted_problem.phase_two_income(boosted_income);

    let mut requests = Vec::with_capacity(total_years as usize);
    let terminal = simulate_two_phase(
        entry,
        &schedule,
        boosted_income,
        base_income,
        Some(&mut requests),
    );

    let mut plan = DrawdownInputs::new();
    for year in config.horizon.years() {
        let offset = (year - start_year) as usize;
        plan.insert(year, requests.get(offset).copied().unwrap_or_default());
    }

    debug!(
        total_years,
        boosted_income,
        base_income,
        phase_two_income,
        tax_free_annual = tax_free.value,
        taxable_at_target = terminal.taxable,
        tax_free_at_target = terminal.tax_free,
        "optimized drawdown plan"
    );

    OptimizerResult {
        plan,
        base_income,
        boosted_income,
        boosted_years,
        tax_free_annual_drawdown: tax_free.value,
        phase_two_income,
        projected_taxable_at_target: terminal.taxable,
        projected_tax_free_at_target: terminal.tax_free,
        converged: tax_free.converged && boosted.converged,
    }
}
