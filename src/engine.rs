use crate::agent::{Agent, Learning};
use crate::config::{AgentConfig, ModelConfig};
use crate::model::{Externality, FineSchedule, PayoffBounds};
use crate::stats::Accumulator;
use anyhow::{Context, Result, bail};
use rand::prelude::*;
use rand_chacha::ChaCha12Rng;
use serde::{Deserialize, Serialize};

/// Final-period choices of every agent.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct FinalChoices {
    pub harvest: Vec<f64>,
    /// Whether each agent moved, spatial runs only.
    pub moved: Option<Vec<bool>>,
}

/// Population-average harvest choice distribution at one period.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub period: usize,
    pub probs: Vec<f64>,
}

/// Aggregates of one complete run.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    /// Sum over periods of the average felicity.
    pub social_welfare: f64,
    /// Average felicity of the last period.
    pub final_felicity: f64,
    /// Total harvest per agent over the run.
    pub avg_lifetime_harvest: f64,
    /// Total fines per agent over the run.
    pub avg_lifetime_fines: f64,
    /// Mean fraction of agents seen per period.
    pub monitoring_rate: f64,
    /// Lifetime felicity of each agent.
    pub indv_welfare: Vec<f64>,
    pub final_choices: FinalChoices,
    pub snapshots: Vec<Snapshot>,
}

/// Simulation engine.
///
/// Holds the environment, the agent population, and the random number
/// generator of one independent run of the commons game.
pub struct Engine {
    learning: Learning,
    externality: Externality,
    fines: Option<FineSchedule>,
    transfers: f64,
    landscape_size: usize,
    vision: usize,
    steps: usize,

    agents: Vec<Agent>,
    rng: ChaCha12Rng,
    period: usize,

    lifetime_harvest: f64,
    lifetime_fines: f64,
    social_welfare: f64,
    last_felicity: f64,
    last_monitoring_rate: f64,
    monitoring: Accumulator,

    snapshot_periods: Vec<usize>,
    snapshots: Vec<Snapshot>,
}

impl Engine {
    /// Create an engine with a fresh population and payoff bounds fixed up front.
    pub fn new(
        model: &ModelConfig,
        agent_cfg: &AgentConfig,
        fines: Option<FineSchedule>,
        transfers: f64,
        seed: u64,
    ) -> Result<Self> {
        let decisions = agent_cfg.action_set.decisions()?;
        let spatial = agent_cfg.action_set.is_spatial();

        let mut harvests = Vec::new();
        for (decision, spec) in decisions.iter().filter(|(dec, _)| dec.is_harvest()) {
            harvests.extend((0..spec.n_actions()).map(|idx| spec.value(idx)));
            if let Some(fines) = &fines {
                let (n_fines, n_actions) = (fines.levels().len(), spec.n_actions());
                if n_fines != n_actions {
                    bail!(
                        "fine schedule has {n_fines} levels but {} has {n_actions} actions",
                        decision.name()
                    );
                }
            }
        }

        let bounds = PayoffBounds::compute(
            &model.externality,
            model.n_agents,
            &harvests,
            fines.as_ref(),
            transfers,
            spatial,
        );
        let learning = Learning {
            decisions,
            explore_decay: agent_cfg.explore_decay,
            min_explore_rate: agent_cfg.min_explore_rate,
            recency_bias: agent_cfg.recency_bias,
            similarity: agent_cfg.similarity,
            utility: agent_cfg.utility,
            bounds,
        };

        let mut rng = ChaCha12Rng::seed_from_u64(seed);
        let mut agents = Vec::with_capacity(model.n_agents);
        for id in 0..model.n_agents {
            let altruism = agent_cfg
                .altruism
                .weight(id)
                .with_context(|| format!("no altruism weight for agent {id}"))?;
            let pos = if spatial {
                rng.random_range(0..model.landscape_size)
            } else {
                0
            };
            agents.push(Agent::new(id, pos, altruism, &learning));
        }

        Ok(Self {
            learning,
            externality: model.externality,
            fines,
            transfers,
            landscape_size: model.landscape_size,
            vision: agent_cfg.vision,
            steps: model.steps,
            agents,
            rng,
            period: 0,
            lifetime_harvest: 0.0,
            lifetime_fines: 0.0,
            social_welfare: 0.0,
            last_felicity: 0.0,
            last_monitoring_rate: 0.0,
            monitoring: Accumulator::new(),
            snapshot_periods: Vec::new(),
            snapshots: Vec::new(),
        })
    }

    /// Record choice probabilities at the start of each of `periods`.
    pub fn with_snapshots(mut self, periods: Vec<usize>) -> Self {
        self.snapshot_periods = periods;
        self
    }

    pub fn learning(&self) -> &Learning {
        &self.learning
    }

    pub fn agents(&self) -> &[Agent] {
        &self.agents
    }

    pub fn landscape_size(&self) -> usize {
        self.landscape_size
    }

    /// Number of completed periods.
    pub fn period(&self) -> usize {
        self.period
    }

    pub fn is_done(&self) -> bool {
        self.period == self.steps
    }

    pub fn social_welfare(&self) -> f64 {
        self.social_welfare
    }

    /// Average felicity of the latest period.
    pub fn period_felicity(&self) -> f64 {
        self.last_felicity
    }

    /// Fraction of agents seen in the latest period.
    pub fn period_monitoring_rate(&self) -> f64 {
        self.last_monitoring_rate
    }

    /// Agents per landscape cell.
    pub fn pop_density(&self) -> f64 {
        self.agents.len() as f64 / self.landscape_size as f64
    }

    /// Run every remaining period and summarize the run.
    pub fn run(mut self) -> Result<RunSummary> {
        while !self.is_done() {
            self.step()
                .with_context(|| format!("failed to perform period {}", self.period))?;
        }
        Ok(self.finish())
    }

    /// Advance the simulation by one period.
    pub fn step(&mut self) -> Result<()> {
        if self.is_done() {
            bail!("run already completed {} periods", self.steps);
        }

        if self.snapshot_periods.contains(&self.period) {
            self.take_snapshot();
        }

        self.decide_strategies()
            .context("failed to decide strategies")?;
        self.resolve_period()
    }

    /// Summarize a run, completed or not.
    pub fn finish(self) -> RunSummary {
        let n_agents = self.agents.len() as f64;
        let spatial = self.learning.is_spatial();
        RunSummary {
            social_welfare: self.social_welfare,
            final_felicity: self.last_felicity,
            avg_lifetime_harvest: self.lifetime_harvest / n_agents,
            avg_lifetime_fines: self.lifetime_fines / n_agents,
            monitoring_rate: self.monitoring.mean(),
            indv_welfare: self.agents.iter().map(Agent::lifetime_felicity).collect(),
            final_choices: FinalChoices {
                harvest: self.agents.iter().map(Agent::harvest).collect(),
                moved: spatial.then(|| self.agents.iter().map(Agent::moved).collect()),
            },
            snapshots: self.snapshots,
        }
    }

    fn decide_strategies(&mut self) -> Result<()> {
        for agent in &mut self.agents {
            agent.decide_strategy(&self.learning, self.period, &mut self.rng)?;
        }
        Ok(())
    }

    /// Everything that follows once every agent has chosen its strategy.
    fn resolve_period(&mut self) -> Result<()> {
        if self.learning.is_spatial() {
            self.move_agents();
            for idx in 0..self.agents.len() {
                let seen = self.is_seen(idx);
                self.agents[idx].observe(seen);
            }
        }

        for agent in &mut self.agents {
            agent.apply_harvest(&self.learning);
        }

        let n_agents = self.agents.len();
        let total_harvest: f64 = self.agents.iter().map(Agent::harvest).sum();
        let externality = self.externality.eval(total_harvest, n_agents);
        for agent in &mut self.agents {
            agent.set_payoff(agent.harvest() - externality);
        }

        let mut total_fines = 0.0;
        if let Some(fines) = &self.fines {
            // Unseen agents escape the fine; without a landscape everyone is seen.
            for agent in self.agents.iter_mut().filter(|agent| agent.seen()) {
                let fine = fines.fine(agent.harvest_level());
                agent.charge(fine);
                total_fines += fine;
            }
            let rebate = self.transfers * total_fines / n_agents as f64;
            if rebate != 0.0 {
                for agent in &mut self.agents {
                    agent.charge(-rebate);
                }
            }
        }

        let bounds = self.learning.bounds;
        for agent in &self.agents {
            if !bounds.contains(agent.payoff()) {
                bail!(
                    "payoff {} of agent {} in period {} is outside [{}, {}]",
                    agent.payoff(),
                    agent.id(),
                    self.period,
                    bounds.min,
                    bounds.max
                );
            }
        }

        for agent in &mut self.agents {
            agent.compute_selfish_felicity(&self.learning);
        }
        let total_selfish: f64 = self.agents.iter().map(Agent::selfish_felicity).sum();
        for agent in &mut self.agents {
            agent.compute_felicity(total_selfish);
            agent.update_memory(&self.learning);
        }

        let avg_felicity =
            self.agents.iter().map(Agent::felicity).sum::<f64>() / n_agents as f64;
        let n_seen = self.agents.iter().filter(|agent| agent.seen()).count();
        let monitoring_rate = n_seen as f64 / n_agents as f64;

        self.lifetime_harvest += total_harvest;
        self.lifetime_fines += total_fines;
        self.social_welfare += avg_felicity;
        self.last_felicity = avg_felicity;
        self.last_monitoring_rate = monitoring_rate;
        self.monitoring.add(monitoring_rate);

        log::trace!(
            "period {}: harvest {total_harvest}, fines {total_fines}, felicity {avg_felicity}",
            self.period
        );

        self.period += 1;

        Ok(())
    }

    fn is_seen(&self, idx: usize) -> bool {
        let pos = self.agents[idx].pos();
        self.agents
            .iter()
            .enumerate()
            .any(|(other, agent)| other != idx && agent.pos().abs_diff(pos) <= self.vision)
    }

    /// Relocate movers, in shuffled order, to random unoccupied cells.
    ///
    /// Each agent looks around just before its turn, so earlier movers
    /// change what later ones see.
    fn move_agents(&mut self) {
        let mut occupancy = vec![0usize; self.landscape_size];
        for agent in &self.agents {
            occupancy[agent.pos()] += 1;
        }

        let mut order: Vec<usize> = (0..self.agents.len()).collect();
        order.shuffle(&mut self.rng);

        for idx in order {
            let seen = self.is_seen(idx);
            self.agents[idx].observe_before_move(seen);
            if !self.agents[idx].wants_to_move(&self.learning) {
                continue;
            }
            let free: Vec<usize> = (0..self.landscape_size)
                .filter(|&cell| occupancy[cell] == 0)
                .collect();
            let Some(&cell) = free.choose(&mut self.rng) else {
                continue;
            };
            occupancy[self.agents[idx].pos()] -= 1;
            occupancy[cell] += 1;
            self.agents[idx].relocate(cell);
        }
    }

    fn take_snapshot(&mut self) {
        let n_agents = self.agents.len() as f64;
        let mut probs: Vec<f64> = Vec::new();
        for agent in &self.agents {
            let harvest = agent
                .snapshot_choice_probabilities(&self.learning, self.period)
                .swap_remove(0);
            if probs.is_empty() {
                probs = vec![0.0; harvest.len()];
            }
            for (sum, prob) in probs.iter_mut().zip(harvest) {
                *sum += prob / n_agents;
            }
        }
        self.snapshots.push(Snapshot {
            period: self.period,
            probs,
        });
    }
}
