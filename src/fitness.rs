use crate::config::{AgentConfig, Config, FINE_VECTOR, FitnessConfig, ModelConfig, TRANSFERS};
use crate::engine::{Engine, FinalChoices, RunSummary};
use crate::model::FineSchedule;
use crate::policy::{ParamValue, Policy};
use crate::pool::TaskPool;
use crate::stats::{Accumulator, VecAccumulator};
use anyhow::{Context, Result, bail};
use rand::prelude::*;
use rand_chacha::ChaCha12Rng;
use serde::{Deserialize, Serialize};

/// Scalar each run is reduced to before averaging over trials.
#[derive(Debug, PartialEq, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reduction {
    /// Social welfare summed over the whole run.
    #[default]
    LifetimeWelfare,
    /// Average felicity of the last period.
    FinalFelicity,
}

impl Reduction {
    pub fn apply(self, summary: &RunSummary) -> f64 {
        match self {
            Self::LifetimeWelfare => summary.social_welfare,
            Self::FinalFelicity => summary.final_felicity,
        }
    }
}

/// Expected fitness of one policy and its optional payloads.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct Outcome {
    /// Mean over trials.
    pub fitness: f64,
    pub std_dev: f64,
    /// Mean lifetime felicity of each agent.
    pub indv_welfare: Option<Vec<f64>>,
    /// Final choices of every trial.
    pub final_choices: Option<Vec<FinalChoices>>,
}

/// Noisy objective maximized by the search.
pub trait Objective: Sync {
    /// Evaluate `policy`; the same `seed` reproduces the same outcome.
    fn evaluate(&self, policy: &Policy, seed: u64) -> Result<Outcome>;
}

/// Expected welfare of the commons game under a policy.
pub struct Commons {
    model: ModelConfig,
    agents: AgentConfig,
    fitness: FitnessConfig,
    fine_domain: Option<(f64, f64)>,
    pool: TaskPool,
}

impl Commons {
    pub fn new(cfg: &Config) -> Result<Self> {
        let pool = TaskPool::new(cfg.fitness.cores).context("failed to construct trial pool")?;
        Ok(Self {
            model: cfg.model.clone(),
            agents: cfg.agents.clone(),
            fitness: cfg.fitness.clone(),
            fine_domain: cfg.fine_domain(),
            pool,
        })
    }

    /// Build a fresh engine running under `policy`.
    pub fn engine(&self, policy: &Policy, seed: u64) -> Result<Engine> {
        let fines = match policy.get(FINE_VECTOR) {
            None => None,
            Some(ParamValue::Vector(levels)) => Some(
                FineSchedule::new(levels.clone(), self.fine_domain)
                    .context("invalid fine schedule")?,
            ),
            Some(ParamValue::Scalar(_)) => bail!("{FINE_VECTOR} must be a vector"),
        };
        let transfers = match policy.get(TRANSFERS) {
            None => self.model.transfers,
            Some(ParamValue::Scalar(transfers)) => *transfers,
            Some(ParamValue::Vector(_)) => bail!("{TRANSFERS} must be a scalar"),
        };
        Engine::new(&self.model, &self.agents, fines, transfers, seed)
    }

    pub fn run_trial(&self, policy: &Policy, seed: u64) -> Result<RunSummary> {
        self.engine(policy, seed)?.run()
    }
}

impl Objective for Commons {
    fn evaluate(&self, policy: &Policy, seed: u64) -> Result<Outcome> {
        let seeds = trial_seeds(seed, self.fitness.n_trials);
        let summaries = self
            .pool
            .run(seeds, |seed| self.run_trial(policy, seed))
            .context("failed to run trials")?;

        let mut fitness = Accumulator::new();
        let mut indv_welfare = VecAccumulator::new();
        for summary in &summaries {
            fitness.add(self.fitness.objective.apply(summary));
            if self.fitness.indv_welfare {
                indv_welfare.add(&summary.indv_welfare);
            }
        }
        let report = fitness.report();

        Ok(Outcome {
            fitness: report.mean,
            std_dev: report.std_dev,
            indv_welfare: self.fitness.indv_welfare.then(|| indv_welfare.means()),
            final_choices: self.fitness.final_choices.then(|| {
                summaries
                    .into_iter()
                    .map(|summary| summary.final_choices)
                    .collect()
            }),
        })
    }
}

/// Independent per-trial seeds derived from one evaluation seed.
pub fn trial_seeds(seed: u64, n_trials: usize) -> Vec<u64> {
    let mut rng = ChaCha12Rng::seed_from_u64(seed);
    (0..n_trials).map(|_| rng.random()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::fine_policy;
    use crate::config::tests::base;

    fn policy() -> Policy {
        fine_policy(vec![0.0, 0.0, 0.0, 0.99, 1.7, 10.0])
    }

    #[test]
    fn same_seed_same_outcome() {
        let commons = Commons::new(&base()).unwrap();
        let a = commons.evaluate(&policy(), 5).unwrap();
        let b = commons.evaluate(&policy(), 5).unwrap();
        assert_eq!(a, b);
        assert!(a.fitness.is_finite());
    }

    #[test]
    fn parallel_trials_match_sequential_trials() {
        let mut cfg = base();
        cfg.fitness.n_trials = 6;
        cfg.fitness.indv_welfare = true;
        cfg.fitness.final_choices = true;

        cfg.fitness.cores = 1;
        let sequential = Commons::new(&cfg).unwrap().evaluate(&policy(), 17).unwrap();
        cfg.fitness.cores = 3;
        let parallel = Commons::new(&cfg).unwrap().evaluate(&policy(), 17).unwrap();

        assert!((sequential.fitness - parallel.fitness).abs() < 1e-9);
        assert_eq!(sequential.final_choices, parallel.final_choices);
        assert_eq!(parallel.indv_welfare.map(|vec| vec.len()), Some(2));
        assert_eq!(parallel.final_choices.map(|vec| vec.len()), Some(6));
    }

    #[test]
    fn fitness_is_mean_of_trial_reductions() {
        let mut cfg = base();
        cfg.fitness.objective = Reduction::FinalFelicity;
        let commons = Commons::new(&cfg).unwrap();
        let seeds = trial_seeds(8, cfg.fitness.n_trials);
        let mean = seeds
            .iter()
            .map(|&seed| commons.run_trial(&policy(), seed).unwrap().final_felicity)
            .sum::<f64>()
            / seeds.len() as f64;
        let outcome = commons.evaluate(&policy(), 8).unwrap();
        assert!((outcome.fitness - mean).abs() < 1e-9);
        assert_eq!(outcome.indv_welfare, None);
    }

    #[test]
    fn fines_outside_domain_fail() {
        let commons = Commons::new(&base()).unwrap();
        let err = commons.evaluate(&fine_policy(vec![20.0; 6]), 0).unwrap_err();
        assert!(format!("{err:#}").contains("invalid fine schedule"));
    }
}
