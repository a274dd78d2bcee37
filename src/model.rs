use crate::config::{FitnessConfig, FlockConfig, ForceConfig};
use crate::fitness::{self, AgentFitness};
use crate::force::{ForceModel, Neighbor, ObstacleHit, Perception, Steering};
use crate::genes::Genes;
use crate::geometry::{EPSILON, Vec3, wrap_angle};
use crate::spawn::{Pose, SpawnPlacer};
use anyhow::{Result, bail};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Obstacle {
    /// Solid ball; agents stay outside.
    Sphere { center: Vec3, radius: f64 },
    /// Vertical cylinder wall; agents stay inside.
    Tank { center: Vec3, radius: f64 },
}

impl Obstacle {
    pub fn validate(&self) -> Result<()> {
        let (Obstacle::Sphere { radius, .. } | Obstacle::Tank { radius, .. }) = self;
        if !(radius.is_finite() && *radius > 0.0) {
            bail!("radius must be positive and finite, but is {radius}");
        }
        Ok(())
    }

    /// Horizontal distance from `position` to the surface on the free side.
    ///
    /// Negative when `position` is inside the obstacle.
    pub fn clearance(&self, position: Vec3) -> f64 {
        match *self {
            Obstacle::Sphere { center, radius } => (position - center).flatten().length() - radius,
            Obstacle::Tank { center, radius } => radius - (position - center).flatten().length(),
        }
    }

    /// Closest surface point to `position`.
    pub fn nearest_surface(&self, position: Vec3) -> Vec3 {
        let (center, radius) = match *self {
            Obstacle::Sphere { center, radius } | Obstacle::Tank { center, radius } => {
                (center, radius)
            }
        };
        let offset = (position - center).flatten();
        let direction = offset.normalize_or(Vec3::new(1.0, 0.0, 0.0));
        Vec3::new(center.x, position.y, center.z) + direction * radius
    }

    pub fn hit(&self, position: Vec3) -> ObstacleHit {
        ObstacleHit {
            point: self.nearest_surface(position),
            distance: self.clearance(position).max(0.0),
        }
    }

    /// Position moved back out so that its clearance equals `margin`.
    fn push_out(&self, position: Vec3, margin: f64) -> Vec3 {
        let surface = self.nearest_surface(position);
        let inward = match *self {
            Obstacle::Sphere { center, .. } => (position - center).flatten(),
            Obstacle::Tank { center, .. } => (center - position).flatten(),
        };
        surface + inward.normalize_or(Vec3::new(1.0, 0.0, 0.0)) * margin
    }
}

#[derive(Debug, Clone)]
pub struct Agent {
    pub position: Vec3,
    pub velocity: Vec3,
    pub heading: Vec3,
    genes: Arc<Genes>,
    fitness: AgentFitness,
    in_contact: bool,
}

impl Agent {
    fn new(genes: Arc<Genes>) -> Self {
        Self {
            position: Vec3::ZERO,
            velocity: Vec3::ZERO,
            heading: Vec3::FORWARD,
            genes,
            fitness: AgentFitness::default(),
            in_contact: false,
        }
    }

    #[cfg(test)]
    pub fn genes(&self) -> &Arc<Genes> {
        &self.genes
    }

    pub fn fitness(&self) -> &AgentFitness {
        &self.fitness
    }

    fn reset(&mut self, pose: Pose) {
        self.position = pose.position;
        self.heading = pose.heading;
        self.velocity = pose.heading * self.genes.base_speed();
        self.fitness.reset();
        self.in_contact = false;
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub collisions: u32,
}

/// Flock of agents sharing one gene vector, plus the static obstacles.
#[derive(Debug, Clone)]
pub struct World {
    cfg: FlockConfig,
    steering: Steering,
    agents: Vec<Agent>,
    obstacles: Vec<Obstacle>,
}

impl World {
    pub fn new(flock: &FlockConfig, force: &ForceConfig, genes: Arc<Genes>) -> Self {
        let agents = (0..flock.n_agents)
            .map(|_| Agent::new(Arc::clone(&genes)))
            .collect();

        let mut obstacles = vec![Obstacle::Tank {
            center: Vec3::ZERO,
            radius: flock.arena_radius,
        }];
        obstacles.extend(flock.obstacles.iter().cloned());

        Self {
            cfg: flock.clone(),
            steering: Steering::from_config(force, flock.alignment_neighbors),
            agents,
            obstacles,
        }
    }

    pub fn agents(&self) -> &[Agent] {
        &self.agents
    }

    pub fn obstacles(&self) -> &[Obstacle] {
        &self.obstacles
    }

    /// Point every agent at `genes`. Only called between evaluation windows.
    pub fn apply_genes(&mut self, genes: &Arc<Genes>) {
        for agent in &mut self.agents {
            agent.genes = Arc::clone(genes);
        }
    }

    /// Reset every agent to a fresh spawn pose and clear its fitness
    /// accumulators. Returns the number of placement failures.
    pub fn respawn<P, R>(&mut self, placer: &P, attempts: usize, rng: &mut R) -> usize
    where
        P: SpawnPlacer,
        R: Rng + ?Sized,
    {
        let mut occupied = Vec::with_capacity(self.agents.len());
        let mut failures = 0;
        for (i_agt, agent) in self.agents.iter_mut().enumerate() {
            let pose = (0..attempts).find_map(|_| placer.try_spawn_pose(rng, &occupied));
            let pose = match pose {
                Some(pose) => pose,
                None => {
                    failures += 1;
                    log::warn!(
                        "placement failure for agent {i_agt}: no collision-free pose in {attempts} attempts"
                    );
                    placer.unchecked_pose(rng)
                }
            };
            occupied.push(pose.position);
            agent.reset(pose);
        }
        failures
    }

    /// Gather what agent `i_agt` sees within the detection radius.
    pub fn perceive(&self, i_agt: usize) -> Perception {
        let agent = &self.agents[i_agt];
        let radius = self.cfg.detection_radius;

        let mut neighbors: Vec<_> = self
            .agents
            .iter()
            .enumerate()
            .filter(|&(j_agt, _)| j_agt != i_agt)
            .filter_map(|(j_agt, other)| {
                let distance = other.position.distance(agent.position);
                (distance <= radius).then_some(Neighbor {
                    position: other.position,
                    velocity: other.velocity,
                    distance,
                    is_leader: j_agt == 0,
                })
            })
            .collect();
        neighbors.sort_by(|a, b| a.distance.total_cmp(&b.distance));

        let obstacles = self
            .obstacles
            .iter()
            .map(|obs| obs.hit(agent.position))
            .filter(|hit| hit.distance <= radius)
            .collect();

        Perception {
            position: agent.position,
            velocity: agent.velocity,
            forward: agent.heading,
            is_leader: i_agt == 0,
            neighbors,
            obstacles,
        }
    }

    /// Advance the flock by `dt` seconds.
    pub fn step(&mut self, dt: f64) -> TickReport {
        let perceptions: Vec<_> = (0..self.agents.len()).map(|i| self.perceive(i)).collect();

        let mut report = TickReport::default();
        let max_turn = self.cfg.turn_rate * dt;
        let others = self.agents.len().saturating_sub(1).max(1) as f64;
        let blend = (self.cfg.acceleration * dt).min(1.0);

        for (agent, perception) in self.agents.iter_mut().zip(&perceptions) {
            let desired = self.steering.desired_heading(perception, &agent.genes);

            let current_yaw = agent.heading.yaw();
            let turn = wrap_angle(desired.yaw() - current_yaw).clamp(-max_turn, max_turn);
            agent.heading = Vec3::from_yaw(current_yaw + turn);

            let target = agent.heading * agent.genes.base_speed();
            agent.velocity = agent.velocity.lerp(target, blend).flatten();
            agent.position += agent.velocity * dt;

            let margin = self.cfg.agent_radius;
            let mut touching = false;
            for obs in &self.obstacles {
                if obs.clearance(agent.position) < margin {
                    agent.position = obs.push_out(agent.position, margin);
                    touching = true;
                }
            }
            if touching && !agent.in_contact {
                agent.fitness.record_collision();
                report.collisions += 1;
            }
            agent.in_contact = touching;

            let relative_turn = if max_turn > EPSILON { turn.abs() / max_turn } else { 0.0 };
            agent.fitness.record_tick(
                perception.neighbors.len() as f64 / others,
                relative_turn,
                agent.velocity.length(),
            );
        }

        report
    }

    /// Mean intrinsic fitness proxy over the flock.
    pub fn fallback_fitness(&self, cfg: &FitnessConfig) -> f64 {
        fitness::fallback_fitness(self.agents.iter().map(Agent::fitness), cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::offline_config;
    use crate::spawn::ArenaSpawner;
    use rand::SeedableRng;
    use rand_chacha::ChaCha12Rng;

    fn world() -> World {
        let cfg = offline_config();
        World::new(&cfg.flock, &cfg.force, Arc::new(Genes::default()))
    }

    fn spawner(world: &World, cfg: &FlockConfig) -> ArenaSpawner {
        ArenaSpawner::new(
            Vec3::ZERO,
            cfg.arena_radius,
            cfg.agent_radius,
            world.obstacles().to_vec(),
        )
    }

    #[test]
    fn tank_clearance_is_positive_inside() {
        let tank = Obstacle::Tank {
            center: Vec3::ZERO,
            radius: 10.0,
        };
        assert_eq!(tank.clearance(Vec3::new(3.0, 0.0, 4.0)), 5.0);
        assert!(tank.clearance(Vec3::new(11.0, 0.0, 0.0)) < 0.0);
        let surface = tank.nearest_surface(Vec3::new(3.0, 0.0, 4.0));
        assert!(surface.distance(Vec3::new(6.0, 0.0, 8.0)) < 1e-12);
    }

    #[test]
    fn sphere_push_out_restores_margin() {
        let sphere = Obstacle::Sphere {
            center: Vec3::ZERO,
            radius: 2.0,
        };
        let moved = sphere.push_out(Vec3::new(1.0, 0.0, 0.0), 0.25);
        assert!((sphere.clearance(moved) - 0.25).abs() < 1e-12);
    }

    #[test]
    fn apply_genes_shares_one_vector() {
        let mut world = world();
        let genes = Arc::new(Genes::new([1.0, 2.0, 3.0, 4.0, 5.0, 1.0]));
        world.apply_genes(&genes);
        assert!(world.agents().iter().all(|a| Arc::ptr_eq(a.genes(), &genes)));
        assert_eq!(Arc::strong_count(&genes), 1 + world.agents().len());
    }

    #[test]
    fn respawn_clears_accumulators() {
        let cfg = offline_config();
        let mut world = world();
        let spawner = spawner(&world, &cfg.flock);
        let mut rng = ChaCha12Rng::seed_from_u64(5);

        assert_eq!(world.respawn(&spawner, 20, &mut rng), 0);
        for _ in 0..10 {
            world.step(0.02);
        }
        assert!(world.agents().iter().all(|a| a.fitness().ticks() == 10));

        world.respawn(&spawner, 20, &mut rng);
        assert!(world.agents().iter().all(|a| a.fitness().ticks() == 0));
    }

    #[test]
    fn respawn_falls_back_when_no_pose_fits() {
        let cfg = offline_config();
        let mut world = world();
        let blocked = ArenaSpawner::new(
            Vec3::ZERO,
            cfg.flock.arena_radius,
            cfg.flock.agent_radius,
            vec![Obstacle::Sphere {
                center: Vec3::ZERO,
                radius: 100.0,
            }],
        );
        let mut rng = ChaCha12Rng::seed_from_u64(6);
        let failures = world.respawn(&blocked, 3, &mut rng);
        assert_eq!(failures, cfg.flock.n_agents);
    }

    #[test]
    fn agents_stay_in_tank_and_move_planar() {
        let cfg = offline_config();
        let mut world = world();
        let spawner = spawner(&world, &cfg.flock);
        let mut rng = ChaCha12Rng::seed_from_u64(7);
        world.respawn(&spawner, 20, &mut rng);

        for _ in 0..500 {
            world.step(0.02);
        }
        for agent in world.agents() {
            assert!(agent.position.flatten().length() <= cfg.flock.arena_radius + 1e-9);
            assert_eq!(agent.position.y, 0.0);
            assert!((agent.heading.length() - 1.0).abs() < 1e-9);
        }
        let fallback = world.fallback_fitness(&cfg.fitness);
        assert!(fallback.is_finite() && fallback >= 0.0);
    }

    #[test]
    fn heading_turns_at_bounded_rate() {
        let cfg = offline_config();
        let mut world = world();
        let spawner = spawner(&world, &cfg.flock);
        let mut rng = ChaCha12Rng::seed_from_u64(8);
        world.respawn(&spawner, 20, &mut rng);

        let before: Vec<_> = world.agents().iter().map(|a| a.heading.yaw()).collect();
        let dt = 0.02;
        world.step(dt);
        for (agent, yaw) in world.agents().iter().zip(before) {
            let turned = wrap_angle(agent.heading.yaw() - yaw).abs();
            assert!(turned <= cfg.flock.turn_rate * dt + 1e-9);
        }
    }
}
