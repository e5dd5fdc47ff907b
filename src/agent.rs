use crate::model::{ActionSpec, Decision, PayoffBounds, Utility};
use anyhow::{Context, Result};
use rand::prelude::*;
use rand_distr::weighted::WeightedIndex;

/// Position of `harvest_if_seen` in [`Learning::decisions`].
const HARVEST_SLOT: usize = 0;

/// Learning rules and traits shared by every agent of a simulation.
#[derive(Debug, Clone)]
pub struct Learning {
    /// Decision dimensions, `harvest_if_seen` first.
    pub decisions: Vec<(Decision, ActionSpec)>,
    pub explore_decay: f64,
    pub min_explore_rate: f64,
    /// Weight of the latest reward; running mean when absent.
    pub recency_bias: Option<f64>,
    pub similarity: bool,
    pub utility: Utility,
    pub bounds: PayoffBounds,
}

impl Learning {
    pub fn slot(&self, decision: Decision) -> Option<usize> {
        self.decisions.iter().position(|(dec, _)| *dec == decision)
    }

    pub fn is_spatial(&self) -> bool {
        self.slot(Decision::MoveIfSeen).is_some()
    }

    /// Probability of exploring at `period`, non-increasing towards `min_explore_rate`.
    pub fn explore_rate(&self, period: usize) -> f64 {
        let min = self.min_explore_rate;
        let rate = min + (1.0 - min) * (-self.explore_decay * period as f64).exp();
        (rate.max(min) * 1000.0).round() / 1000.0
    }

    fn harvest_slot(&self, seen: bool) -> usize {
        match self.slot(Decision::HarvestIfUnseen) {
            Some(slot) if !seen => slot,
            _ => HARVEST_SLOT,
        }
    }

    fn move_slot(&self, seen_before_move: bool) -> Option<usize> {
        self.slot(if seen_before_move {
            Decision::MoveIfSeen
        } else {
            Decision::MoveIfUnseen
        })
    }
}

/// Value estimates and visit counts of one decision dimension.
#[derive(Debug, Clone)]
struct Memory {
    values: Vec<f64>,
    counts: Vec<u64>,
}

impl Memory {
    fn new(n_actions: usize, init: f64) -> Self {
        Self {
            values: vec![init; n_actions],
            counts: vec![0; n_actions],
        }
    }

    /// Every action tied for the highest value estimate.
    fn maximizers(&self) -> Vec<usize> {
        let max = self.values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        (0..self.values.len())
            .filter(|&idx| self.values[idx] == max)
            .collect()
    }
}

/// Learning participant of the commons game.
#[derive(Debug, Clone)]
pub struct Agent {
    id: usize,
    pos: usize,
    altruism: f64,

    memory: Vec<Memory>,
    strategy: Vec<usize>,
    explore_rate: f64,

    seen_before_move: bool,
    seen: bool,
    moved: bool,

    harvest_level: usize,
    harvest: f64,
    payoff: f64,
    selfish_felicity: f64,
    felicity: f64,
    lifetime_felicity: f64,
}

impl Agent {
    /// Create an agent whose value estimates all start at the payoff span.
    pub fn new(id: usize, pos: usize, altruism: f64, learning: &Learning) -> Self {
        let init = learning.bounds.span();
        let memory = learning
            .decisions
            .iter()
            .map(|(_, spec)| Memory::new(spec.n_actions(), init))
            .collect();
        Self {
            id,
            pos,
            altruism,
            memory,
            strategy: vec![0; learning.decisions.len()],
            explore_rate: 1.0,
            // Without a landscape every agent counts as seen.
            seen_before_move: true,
            seen: true,
            moved: false,
            harvest_level: 0,
            harvest: 0.0,
            payoff: 0.0,
            selfish_felicity: 0.0,
            felicity: 0.0,
            lifetime_felicity: 0.0,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn seen(&self) -> bool {
        self.seen
    }

    pub fn moved(&self) -> bool {
        self.moved
    }

    pub fn explore_rate(&self) -> f64 {
        self.explore_rate
    }

    pub fn harvest_level(&self) -> usize {
        self.harvest_level
    }

    pub fn harvest(&self) -> f64 {
        self.harvest
    }

    pub fn payoff(&self) -> f64 {
        self.payoff
    }

    pub fn selfish_felicity(&self) -> f64 {
        self.selfish_felicity
    }

    pub fn felicity(&self) -> f64 {
        self.felicity
    }

    pub fn lifetime_felicity(&self) -> f64 {
        self.lifetime_felicity
    }

    /// Chosen grid position of the decision in `slot` this period.
    pub fn strategy(&self, slot: usize) -> usize {
        self.strategy[slot]
    }

    #[cfg(test)]
    pub fn force_strategy(&mut self, slot: usize, idx: usize) {
        self.strategy[slot] = idx;
    }

    /// First grid position with the highest value estimate in `slot`.
    pub fn best_action(&self, slot: usize) -> usize {
        self.memory[slot].maximizers().first().copied().unwrap_or(0)
    }

    /// Pick this period's action for every decision dimension.
    ///
    /// Explores with probability given by the explore rate, drawing actions
    /// weighted by squared value estimates. Otherwise exploits, breaking ties
    /// between maximizers at random.
    pub fn decide_strategy<R: Rng + ?Sized>(
        &mut self,
        learning: &Learning,
        period: usize,
        rng: &mut R,
    ) -> Result<()> {
        self.explore_rate = learning.explore_rate(period);

        for (slot, mem) in self.memory.iter().enumerate() {
            let idx = if rng.random::<f64>() < self.explore_rate {
                let weights: Vec<f64> = mem.values.iter().map(|val| val * val).collect();
                if weights.iter().sum::<f64>() > 0.0 {
                    WeightedIndex::new(&weights)
                        .context("failed to build exploration weights")?
                        .sample(rng)
                } else {
                    rng.random_range(0..weights.len())
                }
            } else {
                *mem.maximizers()
                    .choose(rng)
                    .context("failed to choose a maximizing action")?
            };
            self.strategy[slot] = idx;
        }

        Ok(())
    }

    /// Record whether the agent was visible before movement and reset movement.
    pub fn observe_before_move(&mut self, seen: bool) {
        self.seen_before_move = seen;
        self.moved = false;
    }

    /// Whether this period's strategy asks to move given prior visibility.
    pub fn wants_to_move(&self, learning: &Learning) -> bool {
        learning
            .move_slot(self.seen_before_move)
            .is_some_and(|slot| learning.decisions[slot].1.value(self.strategy[slot]) == 1.0)
    }

    pub fn relocate(&mut self, pos: usize) {
        self.pos = pos;
        self.moved = true;
    }

    pub fn observe(&mut self, seen: bool) {
        self.seen = seen;
    }

    /// Realize the harvest of the decision matching current visibility.
    pub fn apply_harvest(&mut self, learning: &Learning) {
        let slot = learning.harvest_slot(self.seen);
        self.harvest_level = self.strategy[slot];
        self.harvest = learning.decisions[slot].1.value(self.harvest_level);
    }

    pub fn set_payoff(&mut self, payoff: f64) {
        self.payoff = payoff;
    }

    /// Subtract `amount` from this period's payoff (negative for a rebate).
    pub fn charge(&mut self, amount: f64) {
        self.payoff -= amount;
    }

    /// Felicity from own consumption only.
    pub fn compute_selfish_felicity(&mut self, learning: &Learning) {
        let surplus = (self.payoff - learning.bounds.min).max(0.0);
        self.selfish_felicity = learning.utility.apply(surplus);
    }

    /// Blend own felicity with the population total according to altruism.
    pub fn compute_felicity(&mut self, total_selfish_felicity: f64) {
        self.felicity = if self.altruism > 0.0 {
            self.altruism * total_selfish_felicity + (1.0 - self.altruism) * self.selfish_felicity
        } else {
            self.selfish_felicity
        };
        self.lifetime_felicity += self.felicity;
    }

    /// Update value estimates of the actions taken this period with this period's felicity.
    pub fn update_memory(&mut self, learning: &Learning) {
        let reward = self.felicity;
        if let Some(slot) = learning.move_slot(self.seen_before_move) {
            self.learn(learning, slot, reward, false);
        }
        let slot = learning.harvest_slot(self.seen);
        self.learn(learning, slot, reward, learning.similarity);
    }

    fn learn(&mut self, learning: &Learning, slot: usize, reward: f64, similarity: bool) {
        let grain = learning.decisions[slot].1.grain;
        let idx = self.strategy[slot];
        let mem = &mut self.memory[slot];

        mem.counts[idx] += 1;
        if let Some(lambda) = learning.recency_bias {
            mem.values[idx] = (1.0 - lambda) * mem.values[idx] + lambda * reward;
            return;
        }

        let n = mem.counts[idx] as f64;
        mem.values[idx] = ((n - 1.0) / n) * mem.values[idx] + reward / n;

        if !similarity {
            return;
        }
        // Neighbouring actions are nudged as if by a fractional visit that is
        // not added to their count.
        let weight = (-grain).exp();
        let lower = idx.checked_sub(1);
        let upper = Some(idx + 1).filter(|&nbr| nbr < mem.values.len());
        for nbr in [lower, upper].into_iter().flatten() {
            let n = mem.counts[nbr] as f64 + weight;
            mem.values[nbr] = ((n - weight) / n) * mem.values[nbr] + (weight / n) * reward;
        }
    }

    /// Probability of choosing each action of every decision at `period`.
    ///
    /// Explore mass is spread in proportion to squared value estimates and
    /// exploit mass split evenly among maximizers. Learning state is untouched.
    pub fn snapshot_choice_probabilities(&self, learning: &Learning, period: usize) -> Vec<Vec<f64>> {
        let p_explore = learning.explore_rate(period);
        self.memory
            .iter()
            .map(|mem| {
                let n_actions = mem.values.len();
                let weights: Vec<f64> = mem.values.iter().map(|val| val * val).collect();
                let weight_sum: f64 = weights.iter().sum();
                let mut probs: Vec<f64> = if weight_sum > 0.0 {
                    weights.iter().map(|w| p_explore * w / weight_sum).collect()
                } else {
                    vec![p_explore / n_actions as f64; n_actions]
                };
                let maximizers = mem.maximizers();
                let p_exploit = (1.0 - p_explore) / maximizers.len() as f64;
                for idx in maximizers {
                    probs[idx] += p_exploit;
                }
                probs
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Externality, FineSchedule};
    use rand::SeedableRng;
    use rand_chacha::ChaCha12Rng;

    const HARVEST: ActionSpec = ActionSpec {
        min: 0.0,
        max: 5.0,
        grain: 1.0,
    };

    const GRID: [f64; 6] = [0.0, 1.0, 2.0, 3.0, 4.0, 5.0];

    fn learning() -> Learning {
        let externality = Externality::NegativeExternality {
            alpha: 0.8,
            beta: 0.05,
        };
        Learning {
            decisions: vec![(Decision::HarvestIfSeen, HARVEST)],
            explore_decay: 0.01,
            min_explore_rate: 0.05,
            recency_bias: None,
            similarity: false,
            utility: Utility::Identity,
            bounds: PayoffBounds::compute(&externality, 2, &GRID, None, 0.0, false),
        }
    }

    fn reward(agent: &mut Agent, learning: &Learning, idx: usize, felicity: f64) {
        agent.strategy[HARVEST_SLOT] = idx;
        agent.selfish_felicity = felicity;
        agent.compute_felicity(0.0);
        agent.update_memory(learning);
    }

    #[test]
    fn memory_starts_at_payoff_span() {
        let learning = learning();
        let agent = Agent::new(0, 0, 0.0, &learning);
        let span = learning.bounds.span();
        assert!(agent.memory[HARVEST_SLOT].values.iter().all(|&val| val == span));
    }

    #[test]
    fn explore_rate_decays_to_minimum() {
        let learning = learning();
        assert_eq!(learning.explore_rate(0), 1.0);
        let mut prev = 1.0;
        for period in 0..5_000 {
            let rate = learning.explore_rate(period);
            assert!(rate <= prev);
            assert!(rate >= learning.min_explore_rate);
            prev = rate;
        }
        assert_eq!(prev, 0.05);
    }

    #[test]
    fn running_mean_update() {
        let learning = learning();
        let mut agent = Agent::new(0, 0, 0.0, &learning);
        reward(&mut agent, &learning, 2, 3.0);
        reward(&mut agent, &learning, 2, 1.0);
        assert_eq!(agent.memory[HARVEST_SLOT].values[2], 2.0);
        assert_eq!(agent.memory[HARVEST_SLOT].counts[2], 2);
        assert_eq!(agent.lifetime_felicity(), 4.0);
    }

    #[test]
    fn recency_weighted_update() {
        let learning = Learning {
            recency_bias: Some(0.25),
            ..learning()
        };
        let mut agent = Agent::new(0, 0, 0.0, &learning);
        let init = learning.bounds.span();
        reward(&mut agent, &learning, 1, 1.0);
        let expected = 0.75 * init + 0.25;
        assert!((agent.memory[HARVEST_SLOT].values[1] - expected).abs() < 1e-12);
    }

    #[test]
    fn similarity_updates_neighbours_within_range() {
        let learning = Learning {
            similarity: true,
            ..learning()
        };
        let init = learning.bounds.span();

        let mut agent = Agent::new(0, 0, 0.0, &learning);
        reward(&mut agent, &learning, 5, 0.0);
        let mem = &agent.memory[HARVEST_SLOT];
        assert_eq!(mem.values[5], 0.0);
        assert_eq!(mem.counts[4], 0);
        assert!(mem.values[4].abs() < 1e-12);
        assert_eq!(mem.values[3], init);

        let mut agent = Agent::new(0, 0, 0.0, &learning);
        reward(&mut agent, &learning, 0, 0.0);
        let mem = &agent.memory[HARVEST_SLOT];
        assert_eq!(mem.counts[1], 0);
        assert!(mem.values[1].abs() < 1e-12);
        assert_eq!(mem.values[2], init);
    }

    #[test]
    fn neighbour_nudges_do_not_count_as_visits() {
        let learning = Learning {
            similarity: true,
            ..learning()
        };
        let mut agent = Agent::new(0, 0, 0.0, &learning);
        reward(&mut agent, &learning, 5, 0.0);
        reward(&mut agent, &learning, 5, 0.0);
        assert_eq!(agent.memory[HARVEST_SLOT].counts[4], 0);

        // The first real visit to action 4 replaces its estimate outright.
        reward(&mut agent, &learning, 4, 3.0);
        let mem = &agent.memory[HARVEST_SLOT];
        assert_eq!(mem.counts[4], 1);
        assert!((mem.values[4] - 3.0).abs() < 1e-12);
    }

    #[test]
    fn exploit_picks_among_maximizers() {
        let learning = Learning {
            min_explore_rate: 0.0,
            explore_decay: 1.0,
            ..learning()
        };
        let mut agent = Agent::new(0, 0, 0.0, &learning);
        agent.memory[HARVEST_SLOT].values = vec![0.0, 3.0, 1.0, 3.0, 0.0, 0.0];
        let mut rng = ChaCha12Rng::seed_from_u64(7);
        let mut hits = [0; 6];
        for _ in 0..400 {
            // Explore rate rounds to zero this late.
            agent.decide_strategy(&learning, 10_000, &mut rng).unwrap();
            hits[agent.strategy(HARVEST_SLOT)] += 1;
        }
        assert_eq!(hits[0] + hits[2] + hits[4] + hits[5], 0);
        assert!(hits[1] > 100 && hits[3] > 100);
    }

    #[test]
    fn exploration_never_picks_zero_weight_actions() {
        let learning = learning();
        let mut agent = Agent::new(0, 0, 0.0, &learning);
        agent.memory[HARVEST_SLOT].values = vec![0.0, 0.0, 2.0, 0.0, 0.0, 1.0];
        let mut rng = ChaCha12Rng::seed_from_u64(8);
        for _ in 0..200 {
            agent.decide_strategy(&learning, 0, &mut rng).unwrap();
            assert!(matches!(agent.strategy(HARVEST_SLOT), 2 | 5));
        }
    }

    #[test]
    fn choice_probabilities_sum_to_one() {
        let learning = learning();
        let mut agent = Agent::new(0, 0, 0.0, &learning);
        agent.memory[HARVEST_SLOT].values = vec![1.0, 2.0, 2.0, 0.5, 0.0, 0.0];
        let period = 100;
        let probs = agent.snapshot_choice_probabilities(&learning, period);
        let harvest = &probs[HARVEST_SLOT];
        assert!((harvest.iter().sum::<f64>() - 1.0).abs() < 1e-12);

        let p_explore = learning.explore_rate(period);
        let expected = p_explore * 4.0 / 9.25 + (1.0 - p_explore) / 2.0;
        assert!((harvest[1] - expected).abs() < 1e-12);
        assert_eq!(harvest[4], 0.0);
    }

    #[test]
    fn altruism_blends_population_felicity() {
        let learning = learning();
        let mut agent = Agent::new(0, 0, 0.25, &learning);
        agent.selfish_felicity = 2.0;
        agent.compute_felicity(10.0);
        assert_eq!(agent.felicity(), 0.25 * 10.0 + 0.75 * 2.0);
    }

    #[test]
    fn fined_payoff_is_measured_from_minimum() {
        let externality = Externality::NegativeExternality {
            alpha: 0.8,
            beta: 0.05,
        };
        let fines = FineSchedule::new(vec![0.0; 6], Some((0.0, 10.0))).unwrap();
        let learning = Learning {
            bounds: PayoffBounds::compute(&externality, 2, &GRID, Some(&fines), 0.0, false),
            utility: Utility::Sqrt,
            ..learning()
        };
        let mut agent = Agent::new(0, 0, 0.0, &learning);
        agent.set_payoff(learning.bounds.min + 4.0);
        agent.compute_selfish_felicity(&learning);
        assert!((agent.selfish_felicity() - 2.0).abs() < 1e-12);
    }
}
