use crate::model::Obstacle;
use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::{fmt::Debug, fs, ops::RangeBounds, path::Path, time::Duration};

/// Optimizer configuration.
///
/// Loaded from a TOML file and validated before use.
/// See [`Config::from_file`] for loading.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct Config {
    pub evolution: EvolutionConfig,
    pub flock: FlockConfig,
    #[serde(default)]
    pub force: ForceConfig,
    pub evaluation: EvaluationConfig,
    #[serde(default)]
    pub fitness: FitnessConfig,
    /// Scoring service; when absent every individual is scored locally.
    pub server: Option<ServerConfig>,
}

/// Genetic algorithm parameters.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct EvolutionConfig {
    /// Number of individuals per generation.
    pub population_size: usize,
    /// Number of top individuals carried unchanged into the next generation.
    pub elite_count: usize,
    /// Probability that two parents are recombined.
    pub crossover_rate: f64,
    /// Probability that a child is mutated.
    pub mutation_rate: f64,
    /// Standard deviation of mutation noise, relative to each gene's range.
    pub mutation_strength: f64,
    /// Number of generations to evaluate before halting.
    pub max_generations: usize,
    /// Start the next generation automatically once one completes.
    #[serde(default = "default_true")]
    pub auto_run: bool,
    /// Seed for the random number generator (OS entropy when absent).
    pub seed: Option<u64>,
}

/// Simulated flock and arena.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct FlockConfig {
    pub n_agents: usize,
    /// Radius of the neighbor and obstacle spatial query.
    pub detection_radius: f64,
    /// Cap on the number of nearest neighbors used for alignment.
    pub alignment_neighbors: usize,
    /// Maximum heading change in radians per second.
    pub turn_rate: f64,
    /// Velocity responsiveness per second.
    pub acceleration: f64,
    pub agent_radius: f64,
    /// Radius of the cylindrical tank confining the flock.
    pub arena_radius: f64,
    #[serde(default)]
    pub obstacles: Vec<Obstacle>,
}

#[derive(Debug, Default, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForceVariant {
    #[default]
    Flocking,
    LeaderFollowing,
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct ForceConfig {
    pub variant: ForceVariant,
    /// Weight of the current heading in the blended steering vector.
    pub forward_bias: f64,
}

impl Default for ForceConfig {
    fn default() -> Self {
        Self {
            variant: ForceVariant::Flocking,
            forward_bias: 0.1,
        }
    }
}

/// Timing of a single individual's evaluation window.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct EvaluationConfig {
    /// Simulation tick period in milliseconds.
    pub tick_ms: u64,
    /// Number of ticks recorded per episode.
    pub frames_per_segment: usize,
    /// Time allowed from preparation until a score must arrive.
    pub score_timeout_ms: u64,
    pub health_poll_interval_ms: u64,
    /// Spawn placement retry budget per agent.
    pub spawn_attempts: usize,
}

impl EvaluationConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn tick_secs(&self) -> f64 {
        self.tick_ms as f64 / 1000.0
    }

    pub fn score_timeout(&self) -> Duration {
        Duration::from_millis(self.score_timeout_ms)
    }

    pub fn health_poll_interval(&self) -> Duration {
        Duration::from_millis(self.health_poll_interval_ms)
    }
}

/// Weights of the local fitness proxies used when no score arrives.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct FitnessConfig {
    pub cohesion_weight: f64,
    pub smoothness_weight: f64,
    pub speed_stability_weight: f64,
    /// Fitness subtracted per obstacle collision.
    pub collision_penalty: f64,
}

impl Default for FitnessConfig {
    fn default() -> Self {
        Self {
            cohesion_weight: 0.4,
            smoothness_weight: 0.3,
            speed_stability_weight: 0.3,
            collision_penalty: 0.05,
        }
    }
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub base_url: String,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_upload_attempts")]
    pub upload_attempts: u32,
    #[serde(default = "default_upload_retry_delay_ms")]
    pub upload_retry_delay_ms: u64,
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn upload_retry_delay(&self) -> Duration {
        Duration::from_millis(self.upload_retry_delay_ms)
    }
}

fn default_true() -> bool {
    true
}

fn default_request_timeout_ms() -> u64 {
    120_000
}

fn default_upload_attempts() -> u32 {
    3
}

fn default_upload_retry_delay_ms() -> u64 {
    1_000
}

impl Config {
    /// Load a [`Config`] from a TOML file.
    ///
    /// Performs validation on all parameters before returning.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, deserialized,
    /// or if the configuration values are invalid.
    pub fn from_file<P: AsRef<Path>>(file: P) -> Result<Self> {
        let file = file.as_ref();
        let contents =
            fs::read_to_string(file).with_context(|| format!("failed to read {file:?}"))?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents).context("failed to deserialize config")?;

        config.validate().context("failed to validate config")?;

        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let evo = &self.evolution;
        check_num(evo.population_size, 2..10_000).context("invalid population size")?;
        check_num(evo.elite_count, 0..evo.population_size).context("invalid elite count")?;
        check_num(evo.crossover_rate, 0.0..=1.0).context("invalid crossover rate")?;
        check_num(evo.mutation_rate, 0.0..=1.0).context("invalid mutation rate")?;
        check_num(evo.mutation_strength, 0.0..=1.0).context("invalid mutation strength")?;
        check_num(evo.max_generations, 1..1_000_000).context("invalid maximum generations")?;

        let flock = &self.flock;
        check_num(flock.n_agents, 1..10_000).context("invalid number of agents")?;
        check_num(flock.detection_radius, 0.1..1_000.0).context("invalid detection radius")?;
        check_num(flock.alignment_neighbors, 1..1_000)
            .context("invalid number of alignment neighbors")?;
        check_num(flock.turn_rate, 0.01..100.0).context("invalid turn rate")?;
        check_num(flock.acceleration, 0.01..1_000.0).context("invalid acceleration")?;
        check_num(flock.agent_radius, 0.0..10.0).context("invalid agent radius")?;
        check_num(flock.arena_radius, 1.0..100_000.0).context("invalid arena radius")?;
        for (i_obs, obstacle) in flock.obstacles.iter().enumerate() {
            obstacle
                .validate()
                .with_context(|| format!("invalid obstacle {i_obs}"))?;
        }

        check_num(self.force.forward_bias, 0.0..10.0).context("invalid forward bias")?;

        let eval = &self.evaluation;
        check_num(eval.tick_ms, 1..10_000).context("invalid tick period")?;
        check_num(eval.frames_per_segment, 1..1_000_000).context("invalid frames per segment")?;
        check_num(eval.score_timeout_ms, 1..86_400_000).context("invalid score timeout")?;
        check_num(eval.health_poll_interval_ms, 1..3_600_000)
            .context("invalid health poll interval")?;
        check_num(eval.spawn_attempts, 1..10_000).context("invalid spawn attempts")?;
        if eval.frames_per_segment as u64 * eval.tick_ms >= eval.score_timeout_ms {
            bail!("score timeout must exceed the recording time of one segment");
        }

        let fit = &self.fitness;
        check_num(fit.cohesion_weight, 0.0..=10.0).context("invalid cohesion weight")?;
        check_num(fit.smoothness_weight, 0.0..=10.0).context("invalid smoothness weight")?;
        check_num(fit.speed_stability_weight, 0.0..=10.0)
            .context("invalid speed stability weight")?;
        check_num(fit.collision_penalty, 0.0..=10.0).context("invalid collision penalty")?;

        if let Some(server) = &self.server {
            if !server.base_url.starts_with("http://") && !server.base_url.starts_with("https://") {
                bail!("server url must start with http:// or https://");
            }
            check_num(server.request_timeout_ms, 1..3_600_000)
                .context("invalid request timeout")?;
            check_num(server.upload_attempts, 1..100).context("invalid upload attempts")?;
        }

        Ok(())
    }
}

pub fn check_num<T, R>(num: T, range: R) -> Result<()>
where
    T: PartialOrd + Debug,
    R: RangeBounds<T> + Debug,
{
    if !range.contains(&num) {
        bail!("number must be in the range {range:?}, but is {num:?}");
    }
    Ok(())
}
