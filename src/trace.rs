use crate::genes::{GeneKind, Genes};
use crate::population::{GenerationStats, Population};
use anyhow::{Context, Result};
use serde::Deserialize;
use std::{
    fs::{File, OpenOptions},
    path::{Path, PathBuf},
};

/// Number of decimals written for every float column.
pub const TRACE_DECIMALS: usize = 6;

pub const GENERATIONS_FILE: &str = "generations.csv";
pub const INDIVIDUALS_FILE: &str = "individuals.csv";

/// A parsed row of the generations trace.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRow {
    pub generation: usize,
    pub best_fitness: f64,
    pub avg_fitness: f64,
    pub best_genes: Genes,
}

#[derive(Debug, Deserialize)]
struct GenerationRecord {
    generation: usize,
    best_fitness: f64,
    avg_fitness: f64,
    separation_weight: f64,
    alignment_weight: f64,
    cohesion_weight: f64,
    obstacle_avoid_weight: f64,
    base_speed: f64,
    separation_radius: f64,
}

#[derive(Debug, Deserialize)]
struct IndividualRecord {
    generation: usize,
    separation_weight: f64,
    alignment_weight: f64,
    cohesion_weight: f64,
    obstacle_avoid_weight: f64,
    base_speed: f64,
    separation_radius: f64,
}

impl From<GenerationRecord> for GenerationRow {
    fn from(rec: GenerationRecord) -> Self {
        Self {
            generation: rec.generation,
            best_fitness: rec.best_fitness,
            avg_fitness: rec.avg_fitness,
            best_genes: Genes::new([
                rec.separation_weight,
                rec.alignment_weight,
                rec.cohesion_weight,
                rec.obstacle_avoid_weight,
                rec.base_speed,
                rec.separation_radius,
            ]),
        }
    }
}

impl IndividualRecord {
    fn genes(&self) -> Genes {
        Genes::new([
            self.separation_weight,
            self.alignment_weight,
            self.cohesion_weight,
            self.obstacle_avoid_weight,
            self.base_speed,
            self.separation_radius,
        ])
    }
}

pub struct TraceWriter {
    generations: PathBuf,
    individuals: PathBuf,
}

impl TraceWriter {
    /// Create both trace files in `dir` and write their headers.
    pub fn create<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        let writer = Self {
            generations: dir.join(GENERATIONS_FILE),
            individuals: dir.join(INDIVIDUALS_FILE),
        };
        write_header(&writer.generations, &["generation", "best_fitness", "avg_fitness"])?;
        write_header(&writer.individuals, &["generation", "individual"])?;
        Ok(writer)
    }

    pub fn generations_file(&self) -> &Path {
        &self.generations
    }

    pub fn individuals_file(&self) -> &Path {
        &self.individuals
    }

    /// Append one row per individual of `population`.
    pub fn write_individuals(&self, generation: usize, population: &Population) -> Result<()> {
        let mut writer = append(&self.individuals)?;
        for (i_ind, ind) in population.individuals().iter().enumerate() {
            let mut record = vec![generation.to_string(), i_ind.to_string()];
            record.extend(gene_fields(ind.genes()));
            writer.write_record(&record).context("failed to write individual")?;
        }
        writer.flush().context("failed to flush writer stream")?;
        Ok(())
    }

    pub fn write_generation(&self, stats: &GenerationStats) -> Result<()> {
        let mut writer = append(&self.generations)?;
        let mut record = vec![
            stats.generation.to_string(),
            format_float(stats.best_fitness),
            format_float(stats.avg_fitness),
        ];
        record.extend(gene_fields(&stats.best_genes));
        writer.write_record(&record).context("failed to write generation")?;
        writer.flush().context("failed to flush writer stream")?;
        Ok(())
    }
}

fn write_header(file: &Path, leading: &[&str]) -> Result<()> {
    let mut writer =
        csv::Writer::from_path(file).with_context(|| format!("failed to create {file:?}"))?;
    let columns = leading
        .iter()
        .copied()
        .chain(GeneKind::ALL.iter().map(|kind| kind.name()));
    writer.write_record(columns).context("failed to write header")?;
    writer.flush().context("failed to flush writer stream")?;
    Ok(())
}

fn append(file: &Path) -> Result<csv::Writer<File>> {
    let handle = OpenOptions::new()
        .append(true)
        .open(file)
        .with_context(|| format!("failed to open {file:?}"))?;
    Ok(csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(handle))
}

fn format_float(value: f64) -> String {
    format!("{value:.TRACE_DECIMALS$}")
}

fn gene_fields(genes: &Genes) -> impl Iterator<Item = String> + '_ {
    genes.values().iter().map(|&value| format_float(value))
}

fn reader(file: &Path) -> Result<csv::Reader<File>> {
    csv::Reader::from_path(file).with_context(|| format!("failed to open {file:?}"))
}

/// Read every data row of a generations trace.
pub fn read_generations<P: AsRef<Path>>(file: P) -> Result<Vec<GenerationRow>> {
    let mut reader = reader(file.as_ref())?;
    let mut rows = Vec::new();
    for (i_row, record) in reader.deserialize::<GenerationRecord>().enumerate() {
        let record = record.with_context(|| format!("invalid generation row {i_row}"))?;
        rows.push(record.into());
    }
    Ok(rows)
}

/// Read the gene vectors of one generation from an individuals trace.
pub fn read_individuals<P: AsRef<Path>>(file: P, generation: usize) -> Result<Vec<Genes>> {
    let mut reader = reader(file.as_ref())?;
    let mut genes = Vec::new();
    for (i_row, record) in reader.deserialize::<IndividualRecord>().enumerate() {
        let record = record.with_context(|| format!("invalid individual row {i_row}"))?;
        if record.generation == generation {
            genes.push(record.genes());
        }
    }
    Ok(genes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::genes::N_GENES;
    use crate::population::Individual;
    use rand::SeedableRng;
    use rand_chacha::ChaCha12Rng;
    use std::{env, fs};

    fn temp_dir(name: &str) -> PathBuf {
        let dir = env::temp_dir().join(format!("boidtune-trace-{name}-{}", std::process::id()));
        fs::remove_dir_all(&dir).ok();
        fs::create_dir_all(&dir).expect("failed to create test directory");
        dir
    }

    #[test]
    fn population_round_trips_within_precision() {
        let dir = temp_dir("round-trip");
        let trace = TraceWriter::create(&dir).unwrap();
        let mut rng = ChaCha12Rng::seed_from_u64(31);
        let pop = Population::random(5, &mut rng);

        trace.write_individuals(0, &pop).unwrap();
        trace.write_individuals(1, &Population::random(5, &mut rng)).unwrap();

        let parsed = read_individuals(trace.individuals_file(), 0).unwrap();
        assert_eq!(parsed.len(), pop.len());
        let tol = 0.5 * 10f64.powi(-(TRACE_DECIMALS as i32)) + 1e-12;
        for (genes, ind) in parsed.iter().zip(pop.individuals()) {
            for kind in GeneKind::ALL {
                assert!((genes.get(kind) - ind.genes().get(kind)).abs() <= tol);
            }
        }
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn generation_rows_are_parsed_back() {
        let dir = temp_dir("generations");
        let trace = TraceWriter::create(&dir).unwrap();
        let pop = Population::from_individuals(vec![
            Individual::scored(Genes::default(), 0.25),
            Individual::scored(Genes::new([1.0, 1.0, 1.0, 1.0, 1.0, 1.0]), 0.75),
        ]);
        trace.write_generation(&pop.stats(0).unwrap()).unwrap();
        trace.write_generation(&pop.stats(1).unwrap()).unwrap();

        let rows = read_generations(trace.generations_file()).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].generation, 1);
        assert_eq!(rows[0].best_fitness, 0.75);
        assert_eq!(rows[0].avg_fitness, 0.5);
        assert_eq!(rows[0].best_genes, Genes::new([1.0; N_GENES]));
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn header_lists_gene_names() {
        let dir = temp_dir("header");
        let trace = TraceWriter::create(&dir).unwrap();
        let header = fs::read_to_string(trace.generations_file()).unwrap();
        assert_eq!(
            header.trim(),
            "generation,best_fitness,avg_fitness,separation_weight,alignment_weight,\
cohesion_weight,obstacle_avoid_weight,base_speed,separation_radius"
        );
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn rejects_short_rows() {
        let dir = temp_dir("short");
        let trace = TraceWriter::create(&dir).unwrap();
        let mut contents = fs::read_to_string(trace.generations_file()).unwrap();
        contents.push_str("0,0.5,0.5,1.0\n");
        fs::write(trace.generations_file(), contents).unwrap();
        assert!(read_generations(trace.generations_file()).is_err());
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn blank_lines_are_skipped() {
        let dir = temp_dir("blank");
        let trace = TraceWriter::create(&dir).unwrap();
        let pop = Population::random(3, &mut ChaCha12Rng::seed_from_u64(32));
        trace.write_individuals(0, &pop).unwrap();

        let mut contents = fs::read_to_string(trace.individuals_file()).unwrap();
        contents.push_str("\n\n");
        fs::write(trace.individuals_file(), contents).unwrap();

        assert_eq!(read_individuals(trace.individuals_file(), 0).unwrap().len(), 3);
        fs::remove_dir_all(&dir).ok();
    }
}
