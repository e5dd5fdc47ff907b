use crate::model::{ActionSpec, Decision};
use crate::output::{SearchLog, SimLog};
use anyhow::{Context, Result};
use rand::prelude::*;
use rand_chacha::ChaCha12Rng;
use rmp_serde::encode;
use serde::Serialize;
use std::{
    fs::File,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

/// Random source and output files of one command invocation.
///
/// Without an output directory nothing is written.
pub struct RunContext {
    rng: ChaCha12Rng,
    out_dir: Option<PathBuf>,
    tag: String,
}

impl RunContext {
    /// Create a context seeded with `seed`, or from the OS when absent.
    pub fn new(seed: Option<u64>, out_dir: Option<PathBuf>, tag: &str) -> Result<Self> {
        let rng = match seed {
            Some(seed) => ChaCha12Rng::seed_from_u64(seed),
            None => ChaCha12Rng::try_from_os_rng().context("failed to seed from the OS")?,
        };
        Ok(Self {
            rng,
            out_dir,
            tag: tag.to_string(),
        })
    }

    pub fn rng(&mut self) -> &mut ChaCha12Rng {
        &mut self.rng
    }

    /// Fresh seed for an independent evaluation.
    pub fn draw_seed(&mut self) -> u64 {
        self.rng.random()
    }

    pub fn search_log(
        &self,
        name: &str,
        columns: &[String],
    ) -> Result<Option<SearchLog<BufWriter<File>>>> {
        let Some(writer) = self.create(&format!("{}_{name}.csv", self.tag))? else {
            return Ok(None);
        };
        SearchLog::new(writer, columns).map(Some)
    }

    pub fn sim_log(
        &self,
        decisions: &[(Decision, ActionSpec)],
    ) -> Result<Option<SimLog<BufWriter<File>>>> {
        let Some(writer) = self.create(&format!("{}_sim_log.csv", self.tag))? else {
            return Ok(None);
        };
        SimLog::new(writer, decisions).map(Some)
    }

    /// Serialize `value` as MessagePack into `name`.
    pub fn save<T: Serialize>(&self, name: &str, value: &T) -> Result<()> {
        let Some(mut writer) = self.create(name)? else {
            return Ok(());
        };
        encode::write(&mut writer, value).context("failed to serialize value")?;
        writer.flush().context("failed to flush writer stream")?;
        Ok(())
    }

    fn create(&self, name: &str) -> Result<Option<BufWriter<File>>> {
        let Some(out_dir) = &self.out_dir else {
            return Ok(None);
        };
        let file = out_dir.join(name);
        let writer = create_file(&file)?;
        log::debug!("created {file:?}");
        Ok(Some(writer))
    }
}

fn create_file(file: &Path) -> Result<BufWriter<File>> {
    let file = File::create(file).with_context(|| format!("failed to create {file:?}"))?;
    Ok(BufWriter::new(file))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeded_contexts_agree() {
        let mut a = RunContext::new(Some(4), None, "t").unwrap();
        let mut b = RunContext::new(Some(4), None, "t").unwrap();
        assert_eq!(a.draw_seed(), b.draw_seed());
        assert!(a.search_log("x", &[]).unwrap().is_none());
        a.save("x.msgpack", &1.0).unwrap();
    }
}
