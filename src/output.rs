//! Comma-separated logs for external reporting.

use crate::engine::Engine;
use crate::model::{ActionSpec, Decision};
use crate::policy::Policy;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::io::Write;

/// Which periods of a simulation are written to the per-period log.
#[derive(Debug, PartialEq, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogMode {
    #[default]
    None,
    PerPeriod,
    Final,
}

/// One row per search depth with the incumbent's values and fitness.
pub struct SearchLog<W: Write> {
    writer: W,
}

impl<W: Write> SearchLog<W> {
    pub fn new(mut writer: W, columns: &[String]) -> Result<Self> {
        writeln!(writer, "depth,{},fitness", columns.join(",")).context("failed to write header")?;
        writer.flush().context("failed to flush writer stream")?;
        Ok(Self { writer })
    }

    pub fn write_row(&mut self, depth: usize, policy: &Policy, fitness: f64) -> Result<()> {
        let vals: Vec<String> = policy.flat_values().iter().map(f64::to_string).collect();
        writeln!(self.writer, "{depth},{},{fitness}", vals.join(",")).context("failed to write row")?;
        self.writer.flush().context("failed to flush writer stream")?;
        Ok(())
    }
}

/// One row per agent per period of a simulation.
///
/// Every row also carries the period aggregates. Spatial runs add the
/// position and visibility columns, the population density and the
/// monitoring rate.
pub struct SimLog<W: Write> {
    writer: W,
    spatial: bool,
}

impl<W: Write> SimLog<W> {
    pub fn new(mut writer: W, decisions: &[(Decision, ActionSpec)]) -> Result<Self> {
        let spatial = decisions
            .iter()
            .any(|(decision, _)| *decision == Decision::MoveIfSeen);

        let mut cols = vec!["trial", "period", "n_agents", "landscape_size", "agent"]
            .into_iter()
            .map(String::from)
            .collect::<Vec<_>>();
        if spatial {
            cols.extend(["pos", "seen", "moved"].map(String::from));
        }
        for (decision, _) in decisions {
            cols.push(decision.name().to_string());
            cols.push(format!("best_{}", decision.name()));
        }
        cols.extend(
            ["explore_rate", "harvest", "payoff", "felicity", "avg_felicity", "social_welfare"]
                .map(String::from),
        );
        if spatial {
            cols.extend(["pop_density", "monitoring_rate"].map(String::from));
        }

        writeln!(writer, "{}", cols.join(",")).context("failed to write header")?;
        Ok(Self { writer, spatial })
    }

    /// Write the state of every agent after the engine's latest period.
    pub fn write_period(&mut self, trial: usize, engine: &Engine) -> Result<()> {
        let period = engine.period().saturating_sub(1);
        let n_agents = engine.agents().len();
        let decisions = &engine.learning().decisions;

        for agent in engine.agents() {
            let mut row = format!(
                "{trial},{period},{n_agents},{},{}",
                engine.landscape_size(),
                agent.id()
            );
            if self.spatial {
                row += &format!(
                    ",{},{},{}",
                    agent.pos(),
                    u8::from(agent.seen()),
                    u8::from(agent.moved())
                );
            }
            for (slot, (_, spec)) in decisions.iter().enumerate() {
                row += &format!(
                    ",{},{}",
                    spec.value(agent.strategy(slot)),
                    spec.value(agent.best_action(slot))
                );
            }
            row += &format!(
                ",{},{},{},{},{},{}",
                agent.explore_rate(),
                agent.harvest(),
                agent.payoff(),
                agent.felicity(),
                engine.period_felicity(),
                engine.social_welfare()
            );
            if self.spatial {
                row += &format!(
                    ",{},{}",
                    engine.pop_density(),
                    engine.period_monitoring_rate()
                );
            }
            writeln!(self.writer, "{row}").context("failed to write row")?;
        }

        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush().context("failed to flush writer stream")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::base;
    use crate::policy::{ParamSpace, ParamSpec, ParamValue};

    #[test]
    fn search_log_expands_vector_columns() {
        let space = ParamSpace::new().with(
            "fine_vector",
            ParamSpec {
                min: 0.0,
                max: 10.0,
                size: Some(3),
            },
        );
        let policy = Policy::new().with("fine_vector", ParamValue::Vector(vec![0.5, 1.0, 2.25]));

        let mut log = SearchLog::new(Vec::new(), &space.columns()).unwrap();
        log.write_row(0, &policy, 12.5).unwrap();

        let text = String::from_utf8(log.writer).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "depth,fine_vector_0,fine_vector_1,fine_vector_2,fitness");
        assert_eq!(lines[1], "0,0.5,1,2.25,12.5");
    }

    #[test]
    fn sim_log_writes_one_row_per_agent() {
        let cfg = base();
        let decisions = cfg.agents.action_set.decisions().unwrap();
        let mut engine = Engine::new(&cfg.model, &cfg.agents, None, 0.0, 3).unwrap();
        engine.step().unwrap();

        let mut log = SimLog::new(Vec::new(), &decisions).unwrap();
        log.write_period(0, &engine).unwrap();

        let text = String::from_utf8(log.writer).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 1 + cfg.model.n_agents);
        assert_eq!(
            lines[0],
            "trial,period,n_agents,landscape_size,agent,harvest_if_seen,best_harvest_if_seen,\
             explore_rate,harvest,payoff,felicity,avg_felicity,social_welfare"
        );
        let header_len = lines[0].split(',').count();
        assert!(lines[1..].iter().all(|line| line.split(',').count() == header_len));
        assert!(lines[1].starts_with("0,0,2,1,0,"));

        let avg_felicity: Vec<f64> = lines[1..]
            .iter()
            .map(|line| line.split(',').nth(header_len - 2).unwrap().parse().unwrap())
            .collect();
        assert!(avg_felicity.iter().all(|&val| val == engine.period_felicity()));
        let mean_own = engine.agents().iter().map(|agent| agent.felicity()).sum::<f64>()
            / cfg.model.n_agents as f64;
        assert!((engine.period_felicity() - mean_own).abs() < 1e-12);
    }

    #[test]
    fn spatial_sim_log_reports_density_and_monitoring() {
        let mut cfg = base();
        let stay_or_move = ActionSpec {
            min: 0.0,
            max: 1.0,
            grain: 1.0,
        };
        let harvest = cfg.agents.action_set.harvest_if_seen;
        cfg.agents.action_set.harvest_if_unseen = harvest;
        cfg.agents.action_set.move_if_seen = Some(stay_or_move);
        cfg.agents.action_set.move_if_unseen = Some(stay_or_move);
        cfg.model.landscape_size = 4;
        let decisions = cfg.agents.action_set.decisions().unwrap();
        let mut engine = Engine::new(&cfg.model, &cfg.agents, None, 0.0, 5).unwrap();
        engine.step().unwrap();

        let mut log = SimLog::new(Vec::new(), &decisions).unwrap();
        log.write_period(0, &engine).unwrap();

        let text = String::from_utf8(log.writer).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert!(lines[0].starts_with("trial,period,n_agents,landscape_size,agent,pos,seen,moved,"));
        assert!(lines[0].ends_with(",avg_felicity,social_welfare,pop_density,monitoring_rate"));

        let n_seen = engine.agents().iter().filter(|agent| agent.seen()).count();
        for line in &lines[1..] {
            let fields: Vec<&str> = line.split(',').collect();
            let density: f64 = fields[fields.len() - 2].parse().unwrap();
            let monitoring: f64 = fields[fields.len() - 1].parse().unwrap();
            assert_eq!(density, 0.5);
            assert_eq!(monitoring, n_seen as f64 / 2.0);
        }
    }
}
