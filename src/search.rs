//! Steepest-ascent hillclimbing wrapped in iterated local search.

use crate::config::SearchConfig;
use crate::context::RunContext;
use crate::engine::FinalChoices;
use crate::fitness::Objective;
use crate::policy::{ParamSpace, Policy};
use crate::pool::TaskPool;
use anyhow::{Context, Result, bail};
use rand::prelude::*;
use serde::{Deserialize, Serialize};

/// Best policy found so far and its fitness.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct Memory {
    pub policy: Policy,
    pub fitness: f64,
    pub final_choices: Option<Vec<FinalChoices>>,
}

impl Memory {
    fn improves_on(&self, other: Option<&Memory>) -> bool {
        other.is_none_or(|other| self.fitness > other.fitness)
    }
}

pub struct Searcher<'a, O: Objective> {
    space: &'a ParamSpace,
    cfg: &'a SearchConfig,
    objective: &'a O,
    pool: TaskPool,
}

impl<'a, O: Objective> Searcher<'a, O> {
    pub fn new(space: &'a ParamSpace, cfg: &'a SearchConfig, objective: &'a O) -> Result<Self> {
        if space.is_empty() {
            bail!("parameter space must not be empty");
        }
        let pool = TaskPool::new(cfg.cores).context("failed to construct candidate pool")?;
        log::debug!("evaluating candidates on {} threads", pool.n_threads());
        Ok(Self {
            space,
            cfg,
            objective,
            pool,
        })
    }

    /// Steepest-ascent hillclimb from `start`, or from a uniform draw when absent.
    ///
    /// Every depth evaluates the incumbent again together with `pop_size`
    /// perturbations of it and keeps the best strictly improving candidate.
    pub fn hillclimb(
        &self,
        ctx: &mut RunContext,
        start: Option<Policy>,
        label: &str,
    ) -> Result<Memory> {
        if let Some(start) = &start {
            self.space.check(start).context("invalid starting point")?;
        }
        let mut log = ctx
            .search_log(&format!("{label}_hc_log"), &self.space.columns())
            .context("failed to create hillclimb log")?;

        let mut best: Option<Memory> = None;
        for depth in 0..self.cfg.depth {
            let incumbent = best.as_ref().map(|mem| &mem.policy).or(start.as_ref());
            let candidates = self.candidates(ctx, incumbent)?;

            let tasks: Vec<(Policy, u64)> = candidates
                .into_iter()
                .map(|policy| (policy, ctx.draw_seed()))
                .collect();
            let results = self
                .pool
                .run(tasks, |(policy, seed)| {
                    let outcome = self
                        .objective
                        .evaluate(&policy, seed)
                        .context("failed to evaluate candidate")?;
                    Ok(Memory {
                        policy,
                        fitness: outcome.fitness,
                        final_choices: outcome.final_choices,
                    })
                })
                .with_context(|| format!("failed to evaluate depth {depth}"))?;

            for result in results {
                if result.improves_on(best.as_ref()) {
                    best = Some(result);
                }
            }

            let best = best.as_ref().context("no candidate was evaluated")?;
            if let Some(log) = &mut log {
                log.write_row(depth, &best.policy, best.fitness)?;
            }
            log::info!("{label} depth {depth}: fitness {:.6}", best.fitness);
        }

        best.context("hillclimb ran no depths")
    }

    fn candidates(&self, ctx: &mut RunContext, incumbent: Option<&Policy>) -> Result<Vec<Policy>> {
        let decimals = self.cfg.decimals;
        match incumbent {
            Some(incumbent) => {
                let mut candidates = Vec::with_capacity(self.cfg.pop_size + 1);
                candidates.push(incumbent.clone());
                for _ in 0..self.cfg.pop_size {
                    let policy = self
                        .cfg
                        .kernel
                        .perturb(self.space, incumbent, decimals, ctx.rng())
                        .context("failed to perturb incumbent")?;
                    candidates.push(policy);
                }
                Ok(candidates)
            }
            None => Ok((0..self.cfg.pop_size.max(1))
                .map(|_| self.space.sample_uniform(ctx.rng(), decimals))
                .collect()),
        }
    }

    /// Restart hillclimbs from perturbed home bases and return the best peak seen.
    pub fn iterated_local_search(
        &self,
        ctx: &mut RunContext,
        start: Option<Policy>,
    ) -> Result<Memory> {
        let ils = &self.cfg.ils;
        let columns = self.space.columns();
        let mut optima_log = ctx
            .search_log("local_optimum_log", &columns)
            .context("failed to create local optimum log")?;
        let mut home_log = ctx
            .search_log("home_base_log", &columns)
            .context("failed to create home base log")?;

        let mut home = self
            .hillclimb(ctx, start, "ils0")
            .context("failed to run initial hillclimb")?;
        let mut best = home.clone();
        for log in [&mut optima_log, &mut home_log].into_iter().flatten() {
            log.write_row(0, &home.policy, home.fitness)?;
        }
        self.write_best_peak(ctx, &best)?;

        for iter in 1..ils.depth {
            let start = ils
                .kernel
                .perturb(self.space, &home.policy, self.cfg.decimals, ctx.rng())
                .context("failed to perturb home base")?;
            let peak = self
                .hillclimb(ctx, Some(start), &format!("ils{iter}"))
                .with_context(|| format!("failed to run hillclimb {iter}"))?;
            if let Some(log) = &mut optima_log {
                log.write_row(iter, &peak.policy, peak.fitness)?;
            }

            if peak.improves_on(Some(&best)) {
                best = peak.clone();
                self.write_best_peak(ctx, &best)?;
            }

            let delta = peak.fitness - home.fitness;
            if accept(delta, ils.downhill_coeff, ctx.rng()) {
                log::info!("ils {iter}: new home base (change {delta:.6})");
                home = peak;
            }
            if let Some(log) = &mut home_log {
                log.write_row(iter, &home.policy, home.fitness)?;
            }
            log::info!(
                "ils {iter}: home {:.6}, best {:.6}",
                home.fitness,
                best.fitness
            );
        }

        Ok(best)
    }

    fn write_best_peak(&self, ctx: &RunContext, best: &Memory) -> Result<()> {
        if let Some(mut log) = ctx
            .search_log("best_peak", &self.space.columns())
            .context("failed to create best peak log")?
        {
            log.write_row(0, &best.policy, best.fitness)?;
        }
        Ok(())
    }
}

/// Whether a new local optimum with fitness change `delta` becomes the home base.
///
/// Improvements always do. Anything else only with a downhill coefficient.
pub fn accept<R: Rng + ?Sized>(delta: f64, downhill_coeff: Option<f64>, rng: &mut R) -> bool {
    if delta > 0.0 {
        return true;
    }
    match downhill_coeff {
        None => false,
        Some(coeff) => rng.random::<f64>() < downhill_probability(delta, coeff),
    }
}

/// `max(0.5, exp(delta / coeff))`, or zero when the exponential is not finite.
pub fn downhill_probability(delta: f64, coeff: f64) -> f64 {
    let prob = (delta / coeff).exp();
    if prob.is_finite() { prob.max(0.5) } else { 0.0 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::base;
    use crate::config::{IlsConfig, fine_policy};
    use crate::fitness::{Commons, Outcome};
    use crate::policy::{Distribution, Kernel, ParamSpec, ParamValue};
    use rand::SeedableRng;
    use rand_chacha::ChaCha12Rng;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Negative squared distance to `peak`, optionally with seeded noise.
    struct Bowl {
        peak: f64,
        noise: f64,
        calls: AtomicUsize,
    }

    impl Bowl {
        fn new(peak: f64, noise: f64) -> Self {
            Self {
                peak,
                noise,
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl Objective for Bowl {
        fn evaluate(&self, policy: &Policy, seed: u64) -> Result<Outcome> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            let mut rng = ChaCha12Rng::seed_from_u64(seed);
            let dist: f64 = policy
                .flat_values()
                .iter()
                .map(|val| (val - self.peak).powi(2))
                .sum();
            Ok(Outcome {
                fitness: -dist + self.noise * rng.random_range(-1.0..1.0),
                std_dev: 0.0,
                indv_welfare: None,
                final_choices: None,
            })
        }
    }

    fn space() -> ParamSpace {
        ParamSpace::new().with(
            "x",
            ParamSpec {
                min: 0.0,
                max: 10.0,
                size: Some(3),
            },
        )
    }

    fn search_cfg(pop_size: usize, depth: usize, ils_depth: usize) -> SearchConfig {
        SearchConfig {
            pop_size,
            depth,
            cores: 2,
            decimals: 2,
            start: None,
            kernel: Kernel {
                distribution: Distribution::Normal,
                explore_range: 0.1,
                prob_mutate: 0.5,
            },
            ils: IlsConfig {
                depth: ils_depth,
                downhill_coeff: None,
                kernel: Kernel {
                    distribution: Distribution::Uniform,
                    explore_range: 3.0,
                    prob_mutate: 1.0,
                },
            },
        }
    }

    fn ctx(seed: u64) -> RunContext {
        RunContext::new(Some(seed), None, "test").unwrap()
    }

    #[test]
    fn optimum_start_is_kept() {
        let space = space();
        let cfg = search_cfg(0, 1, 1);
        let bowl = Bowl::new(4.0, 0.0);
        let searcher = Searcher::new(&space, &cfg, &bowl).unwrap();

        let start = Policy::new().with("x", ParamValue::Vector(vec![4.0; 3]));
        let result = searcher.hillclimb(&mut ctx(0), Some(start.clone()), "hc").unwrap();
        assert_eq!(result.policy, start);
        assert_eq!(result.fitness, 0.0);
        assert_eq!(bowl.calls.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn logged_fitness_never_decreases() {
        let space = space();
        let cfg = search_cfg(3, 25, 1);
        let bowl = Bowl::new(2.0, 1.0);
        let searcher = Searcher::new(&space, &cfg, &bowl).unwrap();

        let out_dir = std::env::temp_dir().join(format!("commons-search-{}", std::process::id()));
        std::fs::create_dir_all(&out_dir).unwrap();
        let mut ctx = RunContext::new(Some(2), Some(out_dir.clone()), "test").unwrap();
        let result = searcher.hillclimb(&mut ctx, None, "hc").unwrap();

        let text = std::fs::read_to_string(out_dir.join("test_hc_hc_log.csv")).unwrap();
        let fitness: Vec<f64> = text
            .lines()
            .skip(1)
            .map(|line| line.rsplit(',').next().unwrap().parse().unwrap())
            .collect();
        assert_eq!(fitness.len(), 25);
        assert!(fitness.windows(2).all(|pair| pair[1] >= pair[0]));
        assert_eq!(fitness.last(), Some(&result.fitness));

        std::fs::remove_dir_all(&out_dir).unwrap();
    }

    #[test]
    fn no_downhill_moves_without_coefficient() {
        let mut rng = ChaCha12Rng::seed_from_u64(3);
        for _ in 0..1_000 {
            let delta = -rng.random_range(1e-9..100.0);
            assert!(!accept(delta, None, &mut rng));
            assert!(accept(-delta, None, &mut rng));
        }
    }

    #[test]
    fn ils_without_coefficient_never_moves_home_downhill() {
        let space = space();
        let cfg = search_cfg(3, 3, 6);
        let bowl = Bowl::new(5.0, 2.0);
        let searcher = Searcher::new(&space, &cfg, &bowl).unwrap();

        let out_dir = std::env::temp_dir().join(format!("commons-ils-{}", std::process::id()));
        std::fs::create_dir_all(&out_dir).unwrap();
        for seed in 0..5 {
            let mut ctx = RunContext::new(Some(seed), Some(out_dir.clone()), "test").unwrap();
            let best = searcher.iterated_local_search(&mut ctx, None).unwrap();
            space.check(&best.policy).unwrap();

            let text = std::fs::read_to_string(out_dir.join("test_home_base_log.csv")).unwrap();
            let home: Vec<f64> = text
                .lines()
                .skip(1)
                .map(|line| line.rsplit(',').next().unwrap().parse().unwrap())
                .collect();
            assert_eq!(home.len(), 6);
            assert!(home.windows(2).all(|pair| pair[1] >= pair[0]));
            assert!(home.iter().all(|&fitness| fitness <= best.fitness));
        }
        std::fs::remove_dir_all(&out_dir).unwrap();
    }

    #[test]
    fn downhill_probability_is_floored_and_overflow_safe() {
        assert_eq!(downhill_probability(-100.0, 1.0), 0.5);
        assert_eq!(downhill_probability(0.0, 1.0), 1.0);
        assert_eq!(downhill_probability(f64::MAX, 1e-300), 0.0);
        assert_eq!(downhill_probability(f64::NAN, 1.0), 0.0);
    }

    #[test]
    fn searches_commons_fines() {
        let cfg = base();
        let commons = Commons::new(&cfg).unwrap();
        let searcher = Searcher::new(&cfg.policy.params, &cfg.search, &commons).unwrap();
        let start = fine_policy(vec![0.0, 0.0, 0.0, 0.99, 1.7, 10.0]);
        let best = searcher
            .iterated_local_search(&mut ctx(6), Some(start))
            .unwrap();
        cfg.policy.params.check(&best.policy).unwrap();
    }
}
