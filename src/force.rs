use crate::config::{ForceConfig, ForceVariant};
use crate::genes::Genes;
use crate::geometry::{EPSILON, Vec3};

/// Lower bound on distances used as inverse-distance divisors.
pub const MIN_DISTANCE: f64 = 0.05;

/// A neighboring agent as seen by the perceiving agent.
#[derive(Debug, Clone, Copy)]
pub struct Neighbor {
    pub position: Vec3,
    pub velocity: Vec3,
    pub distance: f64,
    pub is_leader: bool,
}

/// Closest point of an obstacle surface within detection range.
#[derive(Debug, Clone, Copy)]
pub struct ObstacleHit {
    pub point: Vec3,
    pub distance: f64,
}

/// Everything an agent knows when deciding where to go next.
#[derive(Debug, Clone, Default)]
pub struct Perception {
    pub position: Vec3,
    pub velocity: Vec3,
    pub forward: Vec3,
    pub is_leader: bool,
    /// Neighbors sorted by ascending distance.
    pub neighbors: Vec<Neighbor>,
    pub obstacles: Vec<ObstacleHit>,
}

pub trait ForceModel {
    fn desired_heading(&self, perception: &Perception, genes: &Genes) -> Vec3;
}

/// Classic separation / alignment / cohesion / avoidance blend.
#[derive(Debug, Clone)]
pub struct Flocking {
    pub forward_bias: f64,
    pub alignment_neighbors: usize,
}

impl Flocking {
    fn separation(&self, p: &Perception, genes: &Genes) -> Vec3 {
        let radius = genes.separation_radius();
        let mut sum = Vec3::ZERO;
        let mut count = 0;
        for n in p.neighbors.iter().filter(|n| n.distance < radius) {
            let away = (p.position - n.position).normalize_or(-p.forward);
            sum += away / n.distance.max(MIN_DISTANCE);
            count += 1;
        }
        if count == 0 {
            return Vec3::ZERO;
        }
        sum / count as f64 * genes.separation_weight()
    }

    fn alignment(&self, p: &Perception, genes: &Genes) -> Vec3 {
        let nearest = &p.neighbors[..p.neighbors.len().min(self.alignment_neighbors)];
        if nearest.is_empty() {
            return Vec3::ZERO;
        }
        let mut sum = Vec3::ZERO;
        for n in nearest {
            sum += n.velocity;
        }
        let mean = sum / nearest.len() as f64;
        (mean - p.velocity) * genes.alignment_weight()
    }

    fn cohesion_toward(&self, p: &Perception, target: Vec3, genes: &Genes) -> Vec3 {
        (target - p.position).normalize_or(Vec3::ZERO) * genes.cohesion_weight()
    }

    fn cohesion(&self, p: &Perception, genes: &Genes) -> Vec3 {
        let radius = genes.separation_radius();
        let mut sum = Vec3::ZERO;
        let mut count = 0;
        for n in p.neighbors.iter().filter(|n| n.distance > radius) {
            sum += n.position;
            count += 1;
        }
        if count == 0 {
            return Vec3::ZERO;
        }
        self.cohesion_toward(p, sum / count as f64, genes)
    }

    fn obstacle_avoidance(&self, p: &Perception, genes: &Genes) -> Vec3 {
        let radius = genes.separation_radius();
        let mut sum = Vec3::ZERO;
        for hit in p.obstacles.iter().filter(|hit| hit.distance < radius) {
            let away = (p.position - hit.point).normalize_or(-p.forward);
            sum += away / hit.distance.max(MIN_DISTANCE);
        }
        sum * genes.obstacle_avoid_weight()
    }

    fn blend(&self, p: &Perception, steering: Vec3) -> Vec3 {
        let forward = p.forward.flatten().normalize_or(Vec3::FORWARD);
        let combined = (steering + forward * self.forward_bias).flatten();
        if combined.length() < EPSILON {
            return forward;
        }
        combined.normalize_or(forward)
    }
}

impl ForceModel for Flocking {
    fn desired_heading(&self, p: &Perception, genes: &Genes) -> Vec3 {
        let steering = self.separation(p, genes)
            + self.alignment(p, genes)
            + self.cohesion(p, genes)
            + self.obstacle_avoidance(p, genes);
        self.blend(p, steering)
    }
}

/// Flocking where cohesion steers toward the leader when it is in view.
#[derive(Debug, Clone)]
pub struct LeaderFollowing {
    pub flocking: Flocking,
}

impl ForceModel for LeaderFollowing {
    fn desired_heading(&self, p: &Perception, genes: &Genes) -> Vec3 {
        let f = &self.flocking;
        let leader = p.neighbors.iter().find(|n| n.is_leader);
        let cohesion = match leader {
            Some(leader) if !p.is_leader => f.cohesion_toward(p, leader.position, genes),
            _ => f.cohesion(p, genes),
        };
        let steering = f.separation(p, genes)
            + f.alignment(p, genes)
            + cohesion
            + f.obstacle_avoidance(p, genes);
        f.blend(p, steering)
    }
}

/// Force model strategy selected by configuration.
#[derive(Debug, Clone)]
pub enum Steering {
    Flocking(Flocking),
    LeaderFollowing(LeaderFollowing),
}

impl Steering {
    pub fn from_config(cfg: &ForceConfig, alignment_neighbors: usize) -> Self {
        let flocking = Flocking {
            forward_bias: cfg.forward_bias,
            alignment_neighbors,
        };
        match cfg.variant {
            ForceVariant::Flocking => Steering::Flocking(flocking),
            ForceVariant::LeaderFollowing => Steering::LeaderFollowing(LeaderFollowing { flocking }),
        }
    }
}

impl ForceModel for Steering {
    fn desired_heading(&self, perception: &Perception, genes: &Genes) -> Vec3 {
        match self {
            Steering::Flocking(model) => model.desired_heading(perception, genes),
            Steering::LeaderFollowing(model) => model.desired_heading(perception, genes),
        }
    }
}
