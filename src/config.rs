use crate::fitness::Reduction;
use crate::model::{ActionSet, ActionSpec, Externality, Utility};
use crate::output::LogMode;
use crate::policy::{Kernel, ParamSpace, ParamValue, Policy};
use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::{fmt::Debug, fs, ops::RangeBounds, path::Path};

/// Name of the fine schedule policy parameter.
pub const FINE_VECTOR: &str = "fine_vector";
/// Name of the redistribution fraction policy parameter.
pub const TRANSFERS: &str = "transfers";

/// Simulation and search configuration parameters.
///
/// Loaded from a TOML file and validated before use.
/// See [`Config::from_file`] for loading.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Seed of the run's random source (drawn from the OS when absent).
    #[serde(default)]
    pub seed: Option<u64>,
    /// Label prefixed to log file names.
    #[serde(default = "default_tag")]
    pub tag: String,

    pub model: ModelConfig,
    pub agents: AgentConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
    pub fitness: FitnessConfig,
    pub search: SearchConfig,
    #[serde(default)]
    pub simulate: SimulateConfig,
}

/// Environment of the commons game.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelConfig {
    /// Number of agents.
    pub n_agents: usize,
    /// Number of periods per run.
    pub steps: usize,
    /// Fraction of the mean fine rebated to every agent.
    #[serde(default)]
    pub transfers: f64,
    /// Number of cells of the spatial landscape.
    #[serde(default = "default_landscape_size")]
    pub landscape_size: usize,
    pub externality: Externality,
}

/// Agent decisions and learning traits.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentConfig {
    pub action_set: ActionSet,
    /// Distance within which an agent sees others.
    #[serde(default = "default_vision")]
    pub vision: usize,
    #[serde(default = "default_explore_decay")]
    pub explore_decay: f64,
    #[serde(default)]
    pub min_explore_rate: f64,
    #[serde(default)]
    pub altruism: Altruism,
    #[serde(default)]
    pub recency_bias: Option<f64>,
    #[serde(default)]
    pub similarity: bool,
    #[serde(default)]
    pub utility: Utility,
}

/// Weight on total population felicity, shared or per agent.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Altruism {
    Shared(f64),
    PerAgent(Vec<f64>),
}

impl Default for Altruism {
    fn default() -> Self {
        Self::Shared(0.0)
    }
}

impl Altruism {
    pub fn weight(&self, id: usize) -> Option<f64> {
        match self {
            Self::Shared(weight) => Some(*weight),
            Self::PerAgent(weights) => weights.get(id).copied(),
        }
    }
}

/// Domains of the searched policy parameters.
#[derive(Debug, PartialEq, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyConfig {
    #[serde(default)]
    pub params: ParamSpace,
}

/// How one policy is scored.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FitnessConfig {
    /// Independent runs averaged per evaluation.
    pub n_trials: usize,
    /// Threads used to run trials.
    #[serde(default = "default_cores")]
    pub cores: usize,
    #[serde(default)]
    pub objective: Reduction,
    /// Also report mean lifetime felicity per agent.
    #[serde(default)]
    pub indv_welfare: bool,
    /// Also report every trial's final-period choices.
    #[serde(default)]
    pub final_choices: bool,
}

/// Hillclimbing and iterated local search.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SearchConfig {
    /// Perturbed candidates per hillclimb depth.
    pub pop_size: usize,
    /// Hillclimb depth.
    pub depth: usize,
    /// Threads used to evaluate candidates.
    #[serde(default = "default_cores")]
    pub cores: usize,
    /// Decimal places kept in policy values.
    #[serde(default = "default_decimals")]
    pub decimals: u32,
    /// Starting point of the first hillclimb (uniform draw when absent).
    #[serde(default)]
    pub start: Option<Policy>,
    pub kernel: Kernel,
    pub ils: IlsConfig,
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IlsConfig {
    /// Number of hillclimbs, the first included.
    pub depth: usize,
    /// Scale of regressions accepted as new home base (never when absent).
    #[serde(default)]
    pub downhill_coeff: Option<f64>,
    pub kernel: Kernel,
}

/// Standalone simulation runs.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SimulateConfig {
    /// Fixed fine schedule (no fines when absent).
    #[serde(default)]
    pub fine_vector: Option<Vec<f64>>,
    #[serde(default = "default_n_trials")]
    pub n_trials: usize,
    #[serde(default)]
    pub log: LogMode,
    /// Periods at which choice probabilities are recorded.
    #[serde(default)]
    pub snapshot_periods: Vec<usize>,
}

impl Default for SimulateConfig {
    fn default() -> Self {
        Self {
            fine_vector: None,
            n_trials: default_n_trials(),
            log: LogMode::default(),
            snapshot_periods: Vec::new(),
        }
    }
}

fn default_tag() -> String {
    "commons".to_string()
}

fn default_landscape_size() -> usize {
    1
}

fn default_vision() -> usize {
    1
}

fn default_explore_decay() -> f64 {
    0.0005
}

fn default_cores() -> usize {
    1
}

fn default_decimals() -> u32 {
    2
}

fn default_n_trials() -> usize {
    1
}

impl Config {
    /// Load a [`Config`] from a TOML file.
    ///
    /// Performs validation on all parameters before returning.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, deserialized,
    /// or if the configuration values are invalid.
    pub fn from_file<P: AsRef<Path>>(file: P) -> Result<Self> {
        let file = file.as_ref();
        let contents =
            fs::read_to_string(file).with_context(|| format!("failed to read {file:?}"))?;
        Self::from_toml(&contents)
    }

    /// Parse and validate a [`Config`] from a TOML string.
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents).context("failed to deserialize config")?;

        config.validate().context("failed to validate config")?;

        Ok(config)
    }

    /// Domain of the fine schedule parameter, if one is searched.
    pub fn fine_domain(&self) -> Option<(f64, f64)> {
        self.policy
            .params
            .get(FINE_VECTOR)
            .map(|spec| (spec.min, spec.max))
    }

    fn validate(&self) -> Result<()> {
        self.model.validate().context("invalid model")?;
        self.agents
            .validate(self.model.n_agents)
            .context("invalid agents")?;

        let n_levels = self.agents.harvest_levels()?;
        self.validate_policy(n_levels).context("invalid policy")?;

        check_num(self.fitness.n_trials, 1..100_000).context("invalid number of trials")?;
        check_num(self.fitness.cores, 1..1_024).context("invalid number of fitness cores")?;

        self.search.validate().context("invalid search")?;
        if let Some(start) = &self.search.start {
            self.policy
                .params
                .check(start)
                .context("invalid search starting point")?;
        }

        let sim = &self.simulate;
        check_num(sim.n_trials, 1..100_000).context("invalid number of simulation trials")?;
        if let Some(fines) = &sim.fine_vector {
            check_len(fines, n_levels).context("invalid simulation fine vector")?;
        }
        if sim.snapshot_periods.iter().any(|&period| period >= self.model.steps) {
            bail!("snapshot periods must be below the number of steps");
        }

        Ok(())
    }

    fn validate_policy(&self, n_levels: usize) -> Result<()> {
        for (name, spec) in self.policy.params.iter() {
            if !(spec.min <= spec.max) {
                bail!("parameter {name:?} must have min <= max");
            }
            match (name, spec.size) {
                (FINE_VECTOR, Some(size)) => {
                    if size != n_levels {
                        bail!("{FINE_VECTOR} must have one entry per harvest level ({n_levels})");
                    }
                }
                (TRANSFERS, None) => {
                    check_num(spec.min, 0.0..=1.0).context("invalid transfers minimum")?;
                    check_num(spec.max, 0.0..=1.0).context("invalid transfers maximum")?;
                }
                (FINE_VECTOR | TRANSFERS, _) => bail!("parameter {name:?} has the wrong shape"),
                _ => bail!("unknown policy parameter {name:?}"),
            }
        }
        Ok(())
    }
}

impl ModelConfig {
    fn validate(&self) -> Result<()> {
        check_num(self.n_agents, 1..10_000).context("invalid number of agents")?;
        check_num(self.steps, 1..100_000_000).context("invalid number of steps")?;
        check_num(self.transfers, 0.0..=1.0).context("invalid transfers")?;
        check_num(self.landscape_size, 1..1_000_000).context("invalid landscape size")?;
        match self.externality {
            Externality::NegativeExternality { alpha, beta } => {
                check_num(alpha, 0.0..1e6).context("invalid externality alpha")?;
                check_num(beta, 0.0..1e6).context("invalid externality beta")?;
            }
        }
        Ok(())
    }
}

impl AgentConfig {
    fn validate(&self, n_agents: usize) -> Result<()> {
        let decisions = self.action_set.decisions()?;
        for (decision, spec) in &decisions {
            check_spec(spec).with_context(|| format!("invalid {} actions", decision.name()))?;
            if !decision.is_harvest() && (spec.min, spec.max, spec.grain) != (0.0, 1.0, 1.0) {
                bail!("{} actions must be 0 (stay) and 1 (move)", decision.name());
            }
        }

        check_num(self.vision, 0..1_000_000).context("invalid vision")?;
        check_num(self.explore_decay, 0.0..1e6).context("invalid explore decay")?;
        check_num(self.min_explore_rate, 0.0..=1.0).context("invalid minimum explore rate")?;

        match &self.altruism {
            Altruism::Shared(weight) => {
                check_num(*weight, 0.0..=1.0).context("invalid altruism")?;
            }
            Altruism::PerAgent(weights) => {
                check_len(weights, n_agents).context("invalid altruism per agent")?;
                for &weight in weights {
                    check_num(weight, 0.0..=1.0).context("invalid altruism")?;
                }
            }
        }

        if let Some(lambda) = self.recency_bias {
            check_num(lambda, 0.0..=1.0).context("invalid recency bias")?;
            if lambda == 0.0 {
                bail!("recency bias must be positive");
            }
        }

        if let Utility::Power { exponent } = self.utility {
            check_num(exponent, 0.0..=1.0).context("invalid utility exponent")?;
            if exponent == 0.0 {
                bail!("utility exponent must be positive");
            }
        }

        Ok(())
    }

    /// Number of harvest levels, which every harvest decision must share.
    pub fn harvest_levels(&self) -> Result<usize> {
        let decisions = self.action_set.decisions()?;
        let mut levels = decisions
            .iter()
            .filter(|(decision, _)| decision.is_harvest())
            .map(|(_, spec)| spec.n_actions());
        let n_levels = levels.next().context("no harvest decision")?;
        if levels.any(|n| n != n_levels) {
            bail!("harvest decisions must have the same number of levels");
        }
        Ok(n_levels)
    }
}

impl SearchConfig {
    fn validate(&self) -> Result<()> {
        check_num(self.pop_size, 0..100_000).context("invalid population size")?;
        check_num(self.depth, 1..10_000_000).context("invalid hillclimb depth")?;
        check_num(self.cores, 1..1_024).context("invalid number of search cores")?;
        check_num(self.decimals, 0..=12).context("invalid number of decimals")?;
        check_kernel(&self.kernel).context("invalid hillclimb kernel")?;

        check_num(self.ils.depth, 1..100_000).context("invalid ILS depth")?;
        check_kernel(&self.ils.kernel).context("invalid ILS kernel")?;
        if let Some(coeff) = self.ils.downhill_coeff {
            check_num(coeff, 0.0..1e6).context("invalid downhill coefficient")?;
            if coeff == 0.0 {
                bail!("downhill coefficient must be positive");
            }
        }
        Ok(())
    }
}

/// Literal policy holding a fixed fine schedule.
pub fn fine_policy(fines: Vec<f64>) -> Policy {
    Policy::new().with(FINE_VECTOR, ParamValue::Vector(fines))
}

fn check_num<T, R>(num: T, range: R) -> Result<()>
where
    T: PartialOrd + Debug,
    R: RangeBounds<T> + Debug,
{
    if !range.contains(&num) {
        bail!("number must be in the range {range:?}, but is {num:?}");
    }
    Ok(())
}

fn check_len(vec: &[f64], exp_len: usize) -> Result<()> {
    let len = vec.len();
    if len != exp_len {
        bail!("vector length must be {exp_len}, but is {len}");
    }
    if vec.iter().any(|ele| !ele.is_finite()) {
        bail!("vector must have only finite elements");
    }
    Ok(())
}

fn check_spec(spec: &ActionSpec) -> Result<()> {
    check_num(spec.min, 0.0..1e6).context("invalid minimum action")?;
    check_num(spec.grain, 1e-6..1e6).context("invalid grain")?;
    if !(spec.max >= spec.min) {
        bail!("maximum action must not be below the minimum");
    }
    let steps = (spec.max - spec.min) / spec.grain;
    if (steps - steps.round()).abs() > 1e-6 {
        bail!("action range must be a whole number of grains");
    }
    check_num(spec.n_actions(), 1..10_000).context("invalid number of actions")?;
    Ok(())
}

fn check_kernel(kernel: &Kernel) -> Result<()> {
    check_num(kernel.explore_range, 0.0..1e6).context("invalid explore range")?;
    check_num(kernel.prob_mutate, 0.0..=1.0).context("invalid mutation probability")?;
    Ok(())
}
