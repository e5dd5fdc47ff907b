//! Environment building blocks shared by agents and the engine.

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

/// Decision dimension an agent learns independently.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    HarvestIfSeen,
    HarvestIfUnseen,
    MoveIfSeen,
    MoveIfUnseen,
}

impl Decision {
    pub fn name(self) -> &'static str {
        match self {
            Self::HarvestIfSeen => "harvest_if_seen",
            Self::HarvestIfUnseen => "harvest_if_unseen",
            Self::MoveIfSeen => "move_if_seen",
            Self::MoveIfUnseen => "move_if_unseen",
        }
    }

    pub fn is_harvest(self) -> bool {
        matches!(self, Self::HarvestIfSeen | Self::HarvestIfUnseen)
    }
}

/// Discretized action grid `min, min + grain, ..., max`.
#[derive(Debug, PartialEq, Clone, Copy, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ActionSpec {
    pub min: f64,
    pub max: f64,
    pub grain: f64,
}

impl ActionSpec {
    /// Number of actions on the grid.
    pub fn n_actions(&self) -> usize {
        ((self.max - self.min) / self.grain).round() as usize + 1
    }

    /// Whether actions on the grid are whole numbers.
    pub fn is_integer(&self) -> bool {
        self.min.fract() == 0.0 && self.grain.fract() == 0.0
    }

    /// Value of the action at grid position `idx`.
    pub fn value(&self, idx: usize) -> f64 {
        let val = self.min + idx as f64 * self.grain;
        if self.is_integer() { val.round() } else { val }
    }
}

/// Configured action grids, one per decision dimension.
///
/// `harvest_if_seen` is always required. The remaining three decisions make
/// the model spatial and must be given together.
#[derive(Debug, PartialEq, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ActionSet {
    pub harvest_if_seen: Option<ActionSpec>,
    pub harvest_if_unseen: Option<ActionSpec>,
    pub move_if_seen: Option<ActionSpec>,
    pub move_if_unseen: Option<ActionSpec>,
}

impl ActionSet {
    /// Resolve the configured decisions, harvest-if-seen first.
    pub fn decisions(&self) -> Result<Vec<(Decision, ActionSpec)>> {
        let Some(harvest) = self.harvest_if_seen else {
            bail!(
                "action set must define the {} decision",
                Decision::HarvestIfSeen.name()
            );
        };
        match (
            self.harvest_if_unseen,
            self.move_if_seen,
            self.move_if_unseen,
        ) {
            (None, None, None) => Ok(vec![(Decision::HarvestIfSeen, harvest)]),
            (Some(harvest_unseen), Some(move_seen), Some(move_unseen)) => Ok(vec![
                (Decision::HarvestIfSeen, harvest),
                (Decision::HarvestIfUnseen, harvest_unseen),
                (Decision::MoveIfSeen, move_seen),
                (Decision::MoveIfUnseen, move_unseen),
            ]),
            _ => bail!(
                "decisions {}, {} and {} must be defined together",
                Decision::HarvestIfUnseen.name(),
                Decision::MoveIfSeen.name(),
                Decision::MoveIfUnseen.name()
            ),
        }
    }

    pub fn is_spatial(&self) -> bool {
        self.move_if_seen.is_some()
    }
}

/// Payoff deduction as a function of aggregate harvest, selected by `kind`.
#[derive(Debug, PartialEq, Clone, Copy, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", deny_unknown_fields)]
pub enum Externality {
    /// `alpha * avg + beta * avg^2` with `avg` the mean harvest per agent.
    NegativeExternality { alpha: f64, beta: f64 },
}

impl Externality {
    pub fn eval(&self, total_harvest: f64, n_agents: usize) -> f64 {
        match *self {
            Self::NegativeExternality { alpha, beta } => {
                let avg = total_harvest / n_agents as f64;
                alpha * avg + beta * avg.powi(2)
            }
        }
    }
}

/// Transform applied to an agent's payoff above the minimum.
#[derive(Debug, PartialEq, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", deny_unknown_fields)]
pub enum Utility {
    #[default]
    Identity,
    Sqrt,
    /// `ln(1 + x)`.
    Log,
    Power {
        exponent: f64,
    },
}

impl Utility {
    pub fn apply(&self, x: f64) -> f64 {
        match *self {
            Self::Identity => x,
            Self::Sqrt => x.sqrt(),
            Self::Log => x.ln_1p(),
            Self::Power { exponent } => x.powf(exponent),
        }
    }
}

/// One fine per harvest level, level 0 meaning harvesting nothing.
#[derive(Debug, PartialEq, Clone)]
pub struct FineSchedule {
    levels: Vec<f64>,
    lo: f64,
    hi: f64,
}

impl FineSchedule {
    /// Create a schedule whose fines lie within `domain`.
    ///
    /// The domain fixes the payoff bounds, so every schedule drawn from the
    /// same parameter domain shares them. Without one, the schedule's own
    /// extremes are used.
    pub fn new(levels: Vec<f64>, domain: Option<(f64, f64)>) -> Result<Self> {
        if levels.is_empty() {
            bail!("fine schedule must not be empty");
        }
        if levels.iter().any(|fine| !fine.is_finite()) {
            bail!("fine schedule must only contain finite values");
        }
        let own_lo = levels.iter().copied().fold(f64::INFINITY, f64::min);
        let own_hi = levels.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let (lo, hi) = domain.unwrap_or((own_lo, own_hi));
        if own_lo < lo || own_hi > hi {
            bail!("fines must be in the range [{lo}, {hi}], but span [{own_lo}, {own_hi}]");
        }
        Ok(Self { levels, lo, hi })
    }

    pub fn fine(&self, level: usize) -> f64 {
        self.levels[level]
    }

    pub fn levels(&self) -> &[f64] {
        &self.levels
    }
}

/// Range every realized payoff must stay within.
#[derive(Debug, PartialEq, Clone, Copy, Serialize, Deserialize)]
pub struct PayoffBounds {
    pub min: f64,
    pub max: f64,
}

impl PayoffBounds {
    const TOL: f64 = 1e-9;

    /// Worst and best case payoffs given the environment.
    ///
    /// `harvests` lists every harvest value any decision allows. The externality
    /// grows with total harvest, so the worst case has everyone else harvesting
    /// the most and the best case everyone else the least. When `spatial`,
    /// unseen agents pay nothing, so a zero fine is also reachable.
    pub fn compute(
        externality: &Externality,
        n_agents: usize,
        harvests: &[f64],
        fines: Option<&FineSchedule>,
        transfers: f64,
        spatial: bool,
    ) -> Self {
        let h_min = harvests.iter().copied().fold(f64::INFINITY, f64::min);
        let h_max = harvests.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let others = (n_agents - 1) as f64;
        let own = |h: f64, others_total: f64| h - externality.eval(h + others_total, n_agents);

        let mut min = harvests
            .iter()
            .map(|&h| own(h, others * h_max))
            .fold(f64::INFINITY, f64::min);
        let mut max = harvests
            .iter()
            .map(|&h| own(h, others * h_min))
            .fold(f64::NEG_INFINITY, f64::max);

        if let Some(fines) = fines {
            let (fine_lo, fine_hi) = if spatial {
                (fines.lo.min(0.0), fines.hi.max(0.0))
            } else {
                (fines.lo, fines.hi)
            };
            // Rebate per agent is `transfers` times the mean fine paid.
            min += -fine_hi + transfers * fine_lo;
            max += -fine_lo + transfers * fine_hi;
        }

        Self { min, max }
    }

    pub fn contains(&self, payoff: f64) -> bool {
        payoff >= self.min - Self::TOL * (1.0 + self.min.abs())
            && payoff <= self.max + Self::TOL * (1.0 + self.max.abs())
    }

    pub fn span(&self) -> f64 {
        self.max - self.min
    }
}
