use crate::analysis::Analyzer;
use crate::config::Config;
use crate::runtime::Runtime;
use crate::trace::TraceWriter;
use anyhow::{Context, Result};
use glob::glob;
use std::{
    fs,
    path::{Path, PathBuf},
};

const SUMMARY_FILE: &str = "summary.toml";

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

    /// Run a complete optimization into a new run directory.
    pub fn create_run(&self) -> Result<()> {
        let run_idx = self.count_run_dirs().context("failed to count run dirs")?;

        let run_dir = self.run_dir(run_idx);
        fs::create_dir_all(&run_dir).with_context(|| format!("failed to create {run_dir:?}"))?;
        log::info!("created {run_dir:?}");

        let trace = TraceWriter::create(&run_dir).context("failed to create trace files")?;
        log::info!(
            "tracing to {:?} and {:?}",
            trace.generations_file(),
            trace.individuals_file()
        );
        let runtime =
            Runtime::build(self.cfg.clone(), Some(trace)).context("failed to build runtime")?;

        let history = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("failed to build async runtime")?
            .block_on(runtime.run())
            .context("failed to run evaluation")?;

        let max_generations = self.cfg.evolution.max_generations;
        if self.cfg.evolution.auto_run && history.len() < max_generations {
            log::warn!("stopped after {} of {max_generations} generations", history.len());
        }
        if let Some(best) = history
            .iter()
            .max_by(|a, b| a.best_fitness.total_cmp(&b.best_fitness))
        {
            log::info!(
                "best fitness {:.4} in generation {} [{}]",
                best.best_fitness,
                best.generation,
                best.best_genes
            );
        }

        Ok(())
    }

    pub fn analyze_sim(&self) -> Result<()> {
        for run_dir in self.run_dirs().context("failed to list run dirs")? {
            let mut analyzer = Analyzer::new();

            analyzer.add_run(&run_dir).context("failed to add run")?;

            let results_file = run_dir.join(SUMMARY_FILE);
            analyzer
                .save_results(&results_file)
                .context("failed to save results")?;
            log::info!("wrote {results_file:?}");
        }

        Ok(())
    }

    pub fn clean_sim(&self) -> Result<()> {
        for run_dir in self.run_dirs().context("failed to list run dirs")? {
            fs::remove_dir_all(&run_dir).with_context(|| format!("failed to remove {run_dir:?}"))?;
            log::info!("removed {run_dir:?}");
        }

        Ok(())
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

    fn count_run_dirs(&self) -> Result<usize> {
        Ok(self.run_dirs()?.len())
    }

    fn run_dir(&self, run_idx: usize) -> PathBuf {
        self.sim_dir.join(format!("run-{run_idx:04}"))
    }
}
