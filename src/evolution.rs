use crate::config::EvolutionConfig;
use crate::genes::{GeneKind, Genes, N_GENES};
use crate::population::{Individual, Population};
use anyhow::{Context, Result};
use rand::prelude::*;
use rand_distr::{StandardNormal, weighted::WeightedIndex};

/// Blend factor of BLX-α crossover.
pub const BLX_ALPHA: f64 = 0.5;

/// Per-gene probability of receiving noise once a child is selected for mutation.
const GENE_MUTATION_PROB: f64 = 0.5;

/// Build the next population from a scored one.
///
/// Elites are copied with fitness reset; the rest is filled with
/// roulette-selected parents, recombined and mutated.
pub fn next_generation<R: Rng + ?Sized>(
    current: &Population,
    cfg: &EvolutionConfig,
    rng: &mut R,
) -> Result<Population> {
    let size = current.len();
    let ranking = current.ranking();

    let mut next: Vec<Individual> = Vec::with_capacity(size);
    for &i_ind in ranking.iter().take(cfg.elite_count.min(size)) {
        next.push(Individual::new(*current.individuals()[i_ind].genes()));
    }

    let selector = ParentSelector::new(current).context("failed to build parent selector")?;

    while next.len() < size {
        let p1 = current.individuals()[selector.pick(rng)].genes();
        let p2 = current.individuals()[selector.pick(rng)].genes();

        let (mut c1, mut c2) = if rng.random_bool(cfg.crossover_rate) {
            blx_crossover(p1, p2, BLX_ALPHA, rng)
        } else {
            (*p1, *p2)
        };
        mutate(&mut c1, cfg, rng);
        mutate(&mut c2, cfg, rng);

        next.push(Individual::new(c1));
        if next.len() < size {
            next.push(Individual::new(c2));
        }
    }

    Ok(Population::from_individuals(next))
}

/// Fitness-proportional selection, uniform when there is no positive fitness.
enum ParentSelector {
    Roulette(WeightedIndex<f64>),
    Uniform(usize),
}

impl ParentSelector {
    fn new(population: &Population) -> Result<Self> {
        let weights: Vec<f64> = population
            .individuals()
            .iter()
            .map(|ind| ind.fitness().max(0.0))
            .collect();
        let total: f64 = weights.iter().sum();
        if total > 0.0 && total.is_finite() {
            Ok(Self::Roulette(WeightedIndex::new(&weights)?))
        } else {
            Ok(Self::Uniform(population.len()))
        }
    }

    fn pick<R: Rng + ?Sized>(&self, rng: &mut R) -> usize {
        match self {
            Self::Roulette(dist) => dist.sample(rng),
            Self::Uniform(n) => rng.random_range(0..*n),
        }
    }
}

/// BLX-α blend crossover, each gene sampled independently for both children.
pub fn blx_crossover<R: Rng + ?Sized>(
    p1: &Genes,
    p2: &Genes,
    alpha: f64,
    rng: &mut R,
) -> (Genes, Genes) {
    let mut c1 = [0.0; N_GENES];
    let mut c2 = [0.0; N_GENES];
    for kind in GeneKind::ALL {
        let (a, b) = (p1.get(kind), p2.get(kind));
        let (lo, hi) = (a.min(b), a.max(b));
        let spread = alpha * (hi - lo);
        let (lo, hi) = (lo - spread, hi + spread);
        c1[kind.index()] = rng.random_range(lo..=hi);
        c2[kind.index()] = rng.random_range(lo..=hi);
    }
    (Genes::new(c1), Genes::new(c2))
}

/// With probability `mutation_rate`, perturb each gene with probability one
/// half by Gaussian noise scaled to the gene's range.
pub fn mutate<R: Rng + ?Sized>(genes: &mut Genes, cfg: &EvolutionConfig, rng: &mut R) {
    if !rng.random_bool(cfg.mutation_rate) {
        return;
    }
    for kind in GeneKind::ALL {
        if rng.random_bool(GENE_MUTATION_PROB) {
            let noise: f64 = rng.sample(StandardNormal);
            let value = genes.get(kind) + noise * cfg.mutation_strength * kind.range();
            genes.set(kind, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_chacha::ChaCha12Rng;

    fn cfg(population_size: usize, elite_count: usize) -> EvolutionConfig {
        EvolutionConfig {
            population_size,
            elite_count,
            crossover_rate: 0.8,
            mutation_rate: 0.5,
            mutation_strength: 0.2,
            max_generations: 10,
            auto_run: true,
            seed: None,
        }
    }

    fn scored(fitness: &[f64], rng: &mut ChaCha12Rng) -> Population {
        Population::from_individuals(
            fitness
                .iter()
                .map(|&f| Individual::scored(Genes::random(rng), f))
                .collect(),
        )
    }

    #[test]
    fn preserves_population_size() {
        let mut rng = ChaCha12Rng::seed_from_u64(21);
        for size in [2, 3, 4, 7, 10] {
            for elite_count in [0, 1, size - 1] {
                let fitness: Vec<f64> = (0..size).map(|i| i as f64 * 0.1).collect();
                let pop = scored(&fitness, &mut rng);
                let next = next_generation(&pop, &cfg(size, elite_count), &mut rng).unwrap();
                assert_eq!(next.len(), size);
                assert!(next.individuals().iter().all(|ind| !ind.is_evaluated()));
            }
        }
    }

    #[test]
    fn best_individual_is_carried_as_elite() {
        let mut rng = ChaCha12Rng::seed_from_u64(22);
        let pop = scored(&[0.8, 0.6, 0.4, 0.2], &mut rng);
        let next = next_generation(&pop, &cfg(4, 1), &mut rng).unwrap();

        let elite = &next.individuals()[0];
        assert_eq!(elite.genes(), pop.individuals()[0].genes());
        assert_eq!(elite.fitness(), 0.0);
        assert!(!elite.is_evaluated());
    }

    #[test]
    fn elites_follow_fitness_order() {
        let mut rng = ChaCha12Rng::seed_from_u64(23);
        let pop = scored(&[0.1, 0.9, 0.5, 0.9, 0.3], &mut rng);
        let next = next_generation(&pop, &cfg(5, 3), &mut rng).unwrap();
        let expected = [1, 3, 2];
        for (i_elite, &i_src) in expected.iter().enumerate() {
            assert_eq!(next.individuals()[i_elite].genes(), pop.individuals()[i_src].genes());
        }
    }

    #[test]
    fn zero_fitness_falls_back_to_uniform_selection() {
        let mut rng = ChaCha12Rng::seed_from_u64(24);
        let pop = scored(&[0.0, 0.0, 0.0], &mut rng);
        let next = next_generation(&pop, &cfg(3, 0), &mut rng).unwrap();
        assert_eq!(next.len(), 3);
    }

    #[test]
    fn blx_on_identical_parents_returns_parent() {
        let mut rng = ChaCha12Rng::seed_from_u64(25);
        for _ in 0..20 {
            let parent = Genes::random(&mut rng);
            let (c1, c2) = blx_crossover(&parent, &parent, BLX_ALPHA, &mut rng);
            assert_eq!(c1, parent);
            assert_eq!(c2, parent);
        }
    }

    #[test]
    fn blx_children_stay_in_expanded_interval_and_bounds() {
        let mut rng = ChaCha12Rng::seed_from_u64(26);
        for _ in 0..200 {
            let p1 = Genes::random(&mut rng);
            let p2 = Genes::random(&mut rng);
            let (c1, c2) = blx_crossover(&p1, &p2, BLX_ALPHA, &mut rng);
            for kind in GeneKind::ALL {
                let (a, b) = (p1.get(kind), p2.get(kind));
                let spread = BLX_ALPHA * (a - b).abs();
                let (min, max) = kind.bounds();
                for child in [&c1, &c2] {
                    let v = child.get(kind);
                    assert!(v >= (a.min(b) - spread).max(min) - 1e-12);
                    assert!(v <= (a.max(b) + spread).min(max) + 1e-12);
                }
            }
        }
    }

    #[test]
    fn mutation_respects_bounds_and_rate() {
        let mut rng = ChaCha12Rng::seed_from_u64(27);
        let mut strong = cfg(4, 0);
        strong.mutation_rate = 1.0;
        strong.mutation_strength = 1.0;
        for _ in 0..200 {
            let mut genes = Genes::random(&mut rng);
            mutate(&mut genes, &strong, &mut rng);
            assert_eq!(genes, Genes::new(*genes.values()));
        }

        let mut never = cfg(4, 0);
        never.mutation_rate = 0.0;
        let original = Genes::random(&mut rng);
        let mut genes = original;
        mutate(&mut genes, &never, &mut rng);
        assert_eq!(genes, original);
    }
}
