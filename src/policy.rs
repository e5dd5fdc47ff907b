//! Policies, their parameter domains and the perturbation kernels used to search them.

use anyhow::{Context, Result, bail};
use rand::prelude::*;
use rand_distr::{Distribution as _, Normal};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Value of one policy parameter.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Scalar(f64),
    Vector(Vec<f64>),
}

/// Named parameter values, ordered by name.
#[derive(Debug, PartialEq, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Policy {
    params: BTreeMap<String, ParamValue>,
}

impl Policy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, val: ParamValue) -> Self {
        self.params.insert(name.to_string(), val);
        self
    }

    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.params.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.params.keys().map(String::as_str)
    }

    /// All values flattened in column order (see [`ParamSpace::columns`]).
    pub fn flat_values(&self) -> Vec<f64> {
        let mut vals = Vec::new();
        for val in self.params.values() {
            match val {
                ParamValue::Scalar(val) => vals.push(*val),
                ParamValue::Vector(vec) => vals.extend_from_slice(vec),
            }
        }
        vals
    }
}

/// Domain of one parameter: a scalar, or a vector of `size` entries, in `[min, max]`.
#[derive(Debug, PartialEq, Clone, Copy, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ParamSpec {
    pub min: f64,
    pub max: f64,
    #[serde(default)]
    pub size: Option<usize>,
}

impl ParamSpec {
    pub fn range(&self) -> f64 {
        self.max - self.min
    }
}

/// Domains of every searched parameter.
#[derive(Debug, PartialEq, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParamSpace {
    params: BTreeMap<String, ParamSpec>,
}

impl ParamSpace {
    #[cfg(test)]
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn with(mut self, name: &str, spec: ParamSpec) -> Self {
        self.params.insert(name.to_string(), spec);
        self
    }

    pub fn get(&self, name: &str) -> Option<&ParamSpec> {
        self.params.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParamSpec)> {
        self.params.iter().map(|(name, spec)| (name.as_str(), spec))
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Column names, vector parameters expanded to one column per index.
    pub fn columns(&self) -> Vec<String> {
        let mut cols = Vec::new();
        for (name, spec) in &self.params {
            match spec.size {
                None => cols.push(name.clone()),
                Some(size) => cols.extend((0..size).map(|idx| format!("{name}_{idx}"))),
            }
        }
        cols
    }

    /// Draw every parameter independently and uniformly over its domain.
    pub fn sample_uniform<R: Rng + ?Sized>(&self, rng: &mut R, decimals: u32) -> Policy {
        let mut policy = Policy::new();
        for (name, spec) in &self.params {
            let mut draw = || round_to(draw_between(rng, spec.min, spec.max), decimals);
            let val = match spec.size {
                None => ParamValue::Scalar(draw()),
                Some(size) => ParamValue::Vector((0..size).map(|_| draw()).collect()),
            };
            policy.params.insert(name.clone(), val);
        }
        policy
    }

    /// Check that `policy` has exactly this space's parameters, shapes and ranges.
    pub fn check(&self, policy: &Policy) -> Result<()> {
        if let Some(name) = policy.names().find(|name| self.get(name).is_none()) {
            bail!("policy parameter {name:?} has no domain");
        }
        for (name, spec) in &self.params {
            let val = policy
                .get(name)
                .with_context(|| format!("policy is missing parameter {name:?}"))?;
            let vals = match (val, spec.size) {
                (ParamValue::Scalar(val), None) => std::slice::from_ref(val),
                (ParamValue::Vector(vec), Some(size)) if vec.len() == size => vec.as_slice(),
                _ => bail!("parameter {name:?} does not match its domain shape"),
            };
            if vals.iter().any(|val| !(spec.min..=spec.max).contains(val)) {
                bail!(
                    "parameter {name:?} must be in the range [{}, {}]",
                    spec.min,
                    spec.max
                );
            }
        }
        Ok(())
    }
}

#[derive(Debug, PartialEq, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Distribution {
    /// Offset of uniform magnitude in `[0, explore_range]` and random sign.
    Uniform,
    /// Normal offset with standard deviation `explore_range` times the domain width.
    Normal,
}

/// Perturbation kernel applied to an incumbent policy.
#[derive(Debug, PartialEq, Clone, Copy, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Kernel {
    pub distribution: Distribution,
    #[serde(default = "default_explore_range")]
    pub explore_range: f64,
    #[serde(default = "default_prob_mutate")]
    pub prob_mutate: f64,
}

fn default_explore_range() -> f64 {
    1.0
}

fn default_prob_mutate() -> f64 {
    0.5
}

impl Kernel {
    /// Perturb every value of `incumbent` independently with probability `prob_mutate`.
    ///
    /// Values that land outside the domain are redrawn uniformly between the
    /// old value and the violated boundary. Unmutated values are copied.
    pub fn perturb<R: Rng + ?Sized>(
        &self,
        space: &ParamSpace,
        incumbent: &Policy,
        decimals: u32,
        rng: &mut R,
    ) -> Result<Policy> {
        space.check(incumbent).context("invalid incumbent")?;

        let mut policy = Policy::new();
        for (name, spec) in &space.params {
            let val = match &incumbent.params[name] {
                ParamValue::Scalar(old) => {
                    ParamValue::Scalar(self.perturb_value(spec, *old, decimals, rng)?)
                }
                ParamValue::Vector(vec) => ParamValue::Vector(
                    vec.iter()
                        .map(|&old| self.perturb_value(spec, old, decimals, rng))
                        .collect::<Result<_>>()?,
                ),
            };
            policy.params.insert(name.clone(), val);
        }
        Ok(policy)
    }

    fn perturb_value<R: Rng + ?Sized>(
        &self,
        spec: &ParamSpec,
        old: f64,
        decimals: u32,
        rng: &mut R,
    ) -> Result<f64> {
        if rng.random::<f64>() >= self.prob_mutate {
            return Ok(old);
        }

        let eps = match self.distribution {
            Distribution::Uniform => {
                let mag = draw_between(rng, 0.0, self.explore_range);
                if rng.random_bool(0.5) { mag } else { -mag }
            }
            Distribution::Normal => {
                let normal = Normal::new(0.0, spec.range() * self.explore_range)
                    .context("invalid normal kernel")?;
                normal.sample(rng)
            }
        };

        let mut val = round_to(old + eps, decimals);
        if val < spec.min {
            val = round_to(draw_between(rng, spec.min, old), decimals);
        } else if val > spec.max {
            val = round_to(draw_between(rng, old, spec.max), decimals);
        }
        // Rounding may step just past a boundary with more decimals than kept.
        Ok(val.clamp(spec.min, spec.max))
    }
}

fn draw_between<R: Rng + ?Sized>(rng: &mut R, lo: f64, hi: f64) -> f64 {
    if hi <= lo { lo } else { rng.random_range(lo..=hi) }
}

pub fn round_to(val: f64, decimals: u32) -> f64 {
    let scale = 10f64.powi(decimals as i32);
    (val * scale).round() / scale
}
