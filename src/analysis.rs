use crate::genes::{GeneKind, Genes};
use crate::stats::{Accumulator, AccumulatorReport};
use crate::trace::{
    GENERATIONS_FILE, GenerationRow, INDIVIDUALS_FILE, read_generations, read_individuals,
};
use anyhow::{Context, Result};
use serde::Serialize;
use std::{collections::BTreeMap, fs, path::Path};

pub trait Obs {
    fn update(&mut self, row: &GenerationRow);
    fn report(&self) -> Result<(&'static str, toml::Value)>;
}

/// Best individual seen across all generations.
#[derive(Default)]
pub struct Champion {
    best: Option<GenerationRow>,
}

#[derive(Serialize)]
struct ChampionReport {
    generation: usize,
    fitness: f64,
    genes: BTreeMap<&'static str, f64>,
}

impl Obs for Champion {
    fn update(&mut self, row: &GenerationRow) {
        // ties keep the earliest generation
        if self
            .best
            .as_ref()
            .is_none_or(|best| row.best_fitness > best.best_fitness)
        {
            self.best = Some(row.clone());
        }
    }

    fn report(&self) -> Result<(&'static str, toml::Value)> {
        let report = self.best.as_ref().map(|row| ChampionReport {
            generation: row.generation,
            fitness: row.best_fitness,
            genes: named_genes(&row.best_genes),
        });
        let value = match report {
            Some(report) => toml::Value::try_from(report)?,
            None => toml::Value::Table(toml::Table::new()),
        };
        Ok(("champion", value))
    }
}

/// Statistics of per-generation fitness over the whole run.
#[derive(Default)]
pub struct FitnessProgress {
    best: Accumulator,
    avg: Accumulator,
    first_avg: Option<f64>,
    last_avg: Option<f64>,
}

#[derive(Serialize)]
struct ProgressReport {
    n_generations: usize,
    best_fitness_mean: f64,
    best_fitness_std_dev: f64,
    avg_fitness_mean: f64,
    avg_fitness_std_dev: f64,
    /// Change in average fitness between the first and last generation.
    avg_fitness_gain: f64,
}

impl Obs for FitnessProgress {
    fn update(&mut self, row: &GenerationRow) {
        self.best.add(row.best_fitness);
        self.avg.add(row.avg_fitness);
        self.first_avg.get_or_insert(row.avg_fitness);
        self.last_avg = Some(row.avg_fitness);
    }

    fn report(&self) -> Result<(&'static str, toml::Value)> {
        let best = self.best.report();
        let avg = self.avg.report();
        let gain = match (self.first_avg, self.last_avg) {
            (Some(first), Some(last)) => last - first,
            _ => 0.0,
        };
        let report = ProgressReport {
            n_generations: avg.n_vals,
            best_fitness_mean: best.mean,
            best_fitness_std_dev: best.std_dev,
            avg_fitness_mean: avg.mean,
            avg_fitness_std_dev: avg.std_dev,
            avg_fitness_gain: gain,
        };
        Ok(("progress", toml::Value::try_from(report)?))
    }
}

fn named_genes(genes: &Genes) -> BTreeMap<&'static str, f64> {
    GeneKind::ALL
        .iter()
        .map(|&kind| (kind.name(), genes.get(kind)))
        .collect()
}

pub struct Analyzer {
    obs_ptr_vec: Vec<Box<dyn Obs>>,
    final_spread: BTreeMap<&'static str, AccumulatorReport>,
}

impl Default for Analyzer {
    fn default() -> Self {
        Self::new()
    }
}

impl Analyzer {
    pub fn new() -> Self {
        let obs_ptr_vec: Vec<Box<dyn Obs>> = vec![
            Box::new(Champion::default()),
            Box::new(FitnessProgress::default()),
        ];
        Self {
            obs_ptr_vec,
            final_spread: BTreeMap::new(),
        }
    }

    /// Add the traces of one run directory.
    pub fn add_run<P: AsRef<Path>>(&mut self, run_dir: P) -> Result<()> {
        let run_dir = run_dir.as_ref();
        let rows = read_generations(run_dir.join(GENERATIONS_FILE))
            .context("failed to read generations")?;
        for row in &rows {
            for obs in &mut self.obs_ptr_vec {
                obs.update(row);
            }
        }

        if let Some(last) = rows.last() {
            let genes = read_individuals(run_dir.join(INDIVIDUALS_FILE), last.generation)
                .context("failed to read individuals")?;
            self.add_final_population(&genes);
        }
        Ok(())
    }

    /// Per-gene spread of the last evaluated population.
    fn add_final_population(&mut self, genes: &[Genes]) {
        self.final_spread = GeneKind::ALL
            .iter()
            .map(|&kind| {
                let mut acc = Accumulator::new();
                genes.iter().for_each(|g| acc.add(g.get(kind)));
                (kind.name(), acc.report())
            })
            .collect();
    }

    pub fn summary(&self) -> Result<toml::Table> {
        let mut table = toml::Table::new();
        for obs in &self.obs_ptr_vec {
            let (name, value) = obs.report().context("failed to report observable")?;
            table.insert(name.to_string(), value);
        }
        table.insert(
            "final_spread".to_string(),
            toml::Value::try_from(&self.final_spread).context("failed to report gene spread")?,
        );
        Ok(table)
    }

    pub fn save_results<P: AsRef<Path>>(&self, file: P) -> Result<()> {
        let file = file.as_ref();
        let contents =
            toml::to_string_pretty(&self.summary()?).context("failed to serialize summary")?;
        fs::write(file, contents).with_context(|| format!("failed to write {file:?}"))?;
        Ok(())
    }
}
