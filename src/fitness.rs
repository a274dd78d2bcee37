use crate::config::FitnessConfig;
use crate::geometry::EPSILON;
use crate::stats::Accumulator;

#[derive(Debug, Clone, Default)]
pub struct AgentFitness {
    /// Fraction of the rest of the flock within detection range.
    density: Accumulator,
    /// Heading change per tick relative to the maximum allowed turn.
    turning: Accumulator,
    speed: Accumulator,
    collisions: u32,
}

impl AgentFitness {
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn record_tick(&mut self, neighbor_fraction: f64, relative_turn: f64, speed: f64) {
        self.density.add(neighbor_fraction.clamp(0.0, 1.0));
        self.turning.add(relative_turn.clamp(0.0, 1.0));
        self.speed.add(speed.max(0.0));
    }

    pub fn record_collision(&mut self) {
        self.collisions += 1;
    }

    pub fn ticks(&self) -> usize {
        self.density.n_vals()
    }

    /// Weighted blend of cohesion density, motion smoothness and speed
    /// stability, minus the collision penalty, floored at zero.
    pub fn proxy(&self, cfg: &FitnessConfig) -> f64 {
        if self.ticks() == 0 {
            return 0.0;
        }
        let cohesion = self.density.mean();
        let smoothness = 1.0 - self.turning.mean();
        let speed_stability = {
            let mean = self.speed.mean();
            let std_dev = self.speed.std_dev();
            if mean < EPSILON || std_dev.is_nan() {
                0.0
            } else {
                1.0 / (1.0 + std_dev / mean)
            }
        };
        let value = cfg.cohesion_weight * cohesion
            + cfg.smoothness_weight * smoothness
            + cfg.speed_stability_weight * speed_stability
            - cfg.collision_penalty * self.collisions as f64;
        value.max(0.0)
    }
}

/// Mean proxy over every agent of the flock.
pub fn fallback_fitness<'a, I>(agents: I, cfg: &FitnessConfig) -> f64
where
    I: IntoIterator<Item = &'a AgentFitness>,
{
    let mut acc = Accumulator::new();
    for fitness in agents {
        acc.add(fitness.proxy(cfg));
    }
    if acc.n_vals() == 0 { 0.0 } else { acc.mean() }
}
