use crate::geometry::Vec3;
use crate::model::Obstacle;
use rand::Rng;
use std::f64::consts::TAU;

/// Fraction of the arena radius in which agents are spawned.
const SPAWN_FRACTION: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pose {
    pub position: Vec3,
    pub heading: Vec3,
}

pub trait SpawnPlacer {
    /// Sample one pose, or `None` if it collides with an obstacle or with an
    /// already placed agent.
    fn try_spawn_pose<R: Rng + ?Sized>(&self, rng: &mut R, occupied: &[Vec3]) -> Option<Pose>;

    /// Sample a pose without any collision check.
    fn unchecked_pose<R: Rng + ?Sized>(&self, rng: &mut R) -> Pose;
}

/// Uniform placement in a disc around the arena center.
#[derive(Debug, Clone)]
pub struct ArenaSpawner {
    center: Vec3,
    radius: f64,
    min_clearance: f64,
    obstacles: Vec<Obstacle>,
}

impl ArenaSpawner {
    pub fn new(center: Vec3, arena_radius: f64, agent_radius: f64, obstacles: Vec<Obstacle>) -> Self {
        Self {
            center,
            radius: arena_radius * SPAWN_FRACTION,
            min_clearance: (2.0 * agent_radius).max(0.1),
            obstacles,
        }
    }
}

impl SpawnPlacer for ArenaSpawner {
    fn try_spawn_pose<R: Rng + ?Sized>(&self, rng: &mut R, occupied: &[Vec3]) -> Option<Pose> {
        let pose = self.unchecked_pose(rng);
        let blocked = self
            .obstacles
            .iter()
            .any(|obs| obs.clearance(pose.position) < self.min_clearance)
            || occupied
                .iter()
                .any(|&other| other.distance(pose.position) < self.min_clearance);
        if blocked { None } else { Some(pose) }
    }

    fn unchecked_pose<R: Rng + ?Sized>(&self, rng: &mut R) -> Pose {
        // sqrt for uniform density over the disc
        let r = self.radius * rng.random::<f64>().sqrt();
        let angle = rng.random_range(0.0..TAU);
        let position = self.center + Vec3::new(r * angle.cos(), 0.0, r * angle.sin());
        let heading = Vec3::from_yaw(rng.random_range(0.0..TAU));
        Pose { position, heading }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha12Rng;

    #[test]
    fn spawned_poses_are_inside_spawn_disc() {
        let spawner = ArenaSpawner::new(Vec3::ZERO, 10.0, 0.25, Vec::new());
        let mut rng = ChaCha12Rng::seed_from_u64(1);
        for _ in 0..100 {
            let pose = spawner.unchecked_pose(&mut rng);
            assert!(pose.position.length() <= 5.0 + 1e-9);
            assert_eq!(pose.position.y, 0.0);
            assert!((pose.heading.length() - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn rejects_poses_inside_obstacles() {
        // obstacle covers the whole spawn disc
        let obstacles = vec![Obstacle::Sphere {
            center: Vec3::ZERO,
            radius: 20.0,
        }];
        let spawner = ArenaSpawner::new(Vec3::ZERO, 10.0, 0.25, obstacles);
        let mut rng = ChaCha12Rng::seed_from_u64(2);
        assert!((0..50).all(|_| spawner.try_spawn_pose(&mut rng, &[]).is_none()));
    }

    #[test]
    fn keeps_distance_from_occupied_positions() {
        let spawner = ArenaSpawner::new(Vec3::ZERO, 10.0, 0.25, Vec::new());
        let mut rng = ChaCha12Rng::seed_from_u64(3);
        let mut occupied = Vec::new();
        for _ in 0..20 {
            if let Some(pose) = spawner.try_spawn_pose(&mut rng, &occupied) {
                assert!(occupied.iter().all(|p: &Vec3| p.distance(pose.position) >= 0.5));
                occupied.push(pose.position);
            }
        }
        assert!(!occupied.is_empty());
    }
}
