use crate::config::{Config, fine_policy};
use crate::context::RunContext;
use crate::engine::{FinalChoices, Snapshot};
use crate::fitness::Commons;
use crate::output::LogMode;
use crate::policy::Policy;
use crate::search::Searcher;
use crate::stats::{Accumulator, AccumulatorReport, VecAccumulator};
use anyhow::{Context, Result, bail};
use glob::glob;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};

/// Aggregates of the simulate command over all trials.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct SimReport {
    pub n_trials: usize,
    pub social_welfare: AccumulatorReport,
    pub final_felicity: AccumulatorReport,
    pub avg_lifetime_harvest: AccumulatorReport,
    pub avg_lifetime_fines: AccumulatorReport,
    pub monitoring_rate: AccumulatorReport,
    /// Mean lifetime felicity of each agent.
    pub indv_welfare: Vec<f64>,
    pub final_choices: Vec<FinalChoices>,
    /// Mean over trials of each snapshot.
    pub snapshots: Vec<Snapshot>,
}

pub struct Manager {
    sim_dir: PathBuf,
    cfg: Config,
}

impl Manager {
    pub fn new<P: AsRef<Path>>(sim_dir: P) -> Result<Self> {
        let sim_dir = sim_dir.as_ref().to_path_buf();

        let cfg =
            Config::from_file(sim_dir.join("config.toml")).context("failed to construct cfg")?;
        log::info!("{cfg:#?}");

        Ok(Self { sim_dir, cfg })
    }

    /// Run the configured policy for every simulation trial.
    pub fn simulate(&self) -> Result<()> {
        let run_dir = self.create_run_dir()?;
        let mut ctx = RunContext::new(self.cfg.seed, Some(run_dir.clone()), &self.cfg.tag)
            .context("failed to construct run context")?;

        let sim = &self.cfg.simulate;
        let policy = sim
            .fine_vector
            .clone()
            .map(fine_policy)
            .unwrap_or_else(Policy::new);
        let commons = Commons::new(&self.cfg).context("failed to construct fitness")?;

        let decisions = self.cfg.agents.action_set.decisions()?;
        let mut sim_log = match sim.log {
            LogMode::None => None,
            LogMode::PerPeriod | LogMode::Final => ctx
                .sim_log(&decisions)
                .context("failed to create simulation log")?,
        };

        let mut social_welfare = Accumulator::new();
        let mut final_felicity = Accumulator::new();
        let mut harvest = Accumulator::new();
        let mut fines = Accumulator::new();
        let mut monitoring = Accumulator::new();
        let mut indv_welfare = VecAccumulator::new();
        let mut snapshots = vec![VecAccumulator::new(); sim.snapshot_periods.len()];
        let mut final_choices = Vec::with_capacity(sim.n_trials);

        for trial in 0..sim.n_trials {
            let mut engine = commons
                .engine(&policy, ctx.draw_seed())
                .context("failed to construct engine")?
                .with_snapshots(sim.snapshot_periods.clone());

            while !engine.is_done() {
                engine
                    .step()
                    .with_context(|| format!("failed to simulate trial {trial}"))?;
                let write = match sim.log {
                    LogMode::None => false,
                    LogMode::PerPeriod => true,
                    LogMode::Final => engine.is_done(),
                };
                if let (true, Some(log)) = (write, &mut sim_log) {
                    log.write_period(trial, &engine)?;
                }
            }

            let summary = engine.finish();
            log::info!(
                "trial {trial}: social welfare {:.6}, fines {:.6}",
                summary.social_welfare,
                summary.avg_lifetime_fines
            );

            social_welfare.add(summary.social_welfare);
            final_felicity.add(summary.final_felicity);
            harvest.add(summary.avg_lifetime_harvest);
            fines.add(summary.avg_lifetime_fines);
            monitoring.add(summary.monitoring_rate);
            indv_welfare.add(&summary.indv_welfare);
            for (acc, snapshot) in snapshots.iter_mut().zip(&summary.snapshots) {
                acc.add(&snapshot.probs);
            }
            final_choices.push(summary.final_choices);
        }

        if let Some(log) = &mut sim_log {
            log.flush()?;
        }

        let report = SimReport {
            n_trials: sim.n_trials,
            social_welfare: social_welfare.report(),
            final_felicity: final_felicity.report(),
            avg_lifetime_harvest: harvest.report(),
            avg_lifetime_fines: fines.report(),
            monitoring_rate: monitoring.report(),
            indv_welfare: indv_welfare.means(),
            final_choices,
            snapshots: sim
                .snapshot_periods
                .iter()
                .zip(&snapshots)
                .map(|(&period, acc)| Snapshot {
                    period,
                    probs: acc.means(),
                })
                .collect(),
        };
        log::info!("{report:#?}");

        ctx.save("results.msgpack", &report)
            .context("failed to save results")?;

        Ok(())
    }

    /// Search the policy space for the fines with the highest expected welfare.
    pub fn optimize(&self) -> Result<()> {
        let space = &self.cfg.policy.params;
        if space.is_empty() {
            bail!("no policy parameters to optimize");
        }

        let run_dir = self.create_run_dir()?;
        let mut ctx = RunContext::new(self.cfg.seed, Some(run_dir), &self.cfg.tag)
            .context("failed to construct run context")?;

        let commons = Commons::new(&self.cfg).context("failed to construct fitness")?;
        let searcher = Searcher::new(space, &self.cfg.search, &commons)
            .context("failed to construct searcher")?;

        let best = searcher
            .iterated_local_search(&mut ctx, self.cfg.search.start.clone())
            .context("failed to run iterated local search")?;
        log::info!("{best:#?}");

        ctx.save("best.msgpack", &best)
            .context("failed to save best result")?;

        Ok(())
    }

    /// Remove every run directory.
    pub fn clean(&self) -> Result<()> {
        for run_dir in self.run_dirs()? {
            fs::remove_dir_all(&run_dir)
                .with_context(|| format!("failed to remove {run_dir:?}"))?;
            log::info!("removed {run_dir:?}");
        }
        Ok(())
    }

    fn create_run_dir(&self) -> Result<PathBuf> {
        let run_idx = self.run_dirs().context("failed to count run dirs")?.len();
        let run_dir = self.sim_dir.join(format!("run-{run_idx:04}"));
        fs::create_dir_all(&run_dir).with_context(|| format!("failed to create {run_dir:?}"))?;
        log::info!("created {run_dir:?}");
        Ok(run_dir)
    }

    fn run_dirs(&self) -> Result<Vec<PathBuf>> {
        let pattern = self.sim_dir.join("run-*");
        let pattern = pattern.to_str().context("pattern is not valid UTF-8")?;
        let dirs = glob(pattern)
            .context("failed to glob run dirs")?
            .filter_map(Result::ok)
            .filter(|p| p.is_dir())
            .collect();
        Ok(dirs)
    }
}
