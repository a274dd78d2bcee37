use crate::genes::Genes;
use crate::stats::Accumulator;
use anyhow::{Result, bail};
use rand::Rng;
use std::sync::Arc;

/// One gene vector and its fitness for the current generation.
#[derive(Debug, Clone, PartialEq)]
pub struct Individual {
    genes: Arc<Genes>,
    fitness: f64,
    evaluated: bool,
}

impl Individual {
    pub fn new(genes: Genes) -> Self {
        Self {
            genes: Arc::new(genes),
            fitness: 0.0,
            evaluated: false,
        }
    }

    pub fn genes(&self) -> &Genes {
        &self.genes
    }

    /// Shared handle to the gene vector, handed to simulated agents.
    pub fn shared_genes(&self) -> &Arc<Genes> {
        &self.genes
    }

    pub fn fitness(&self) -> f64 {
        self.fitness
    }

    pub fn is_evaluated(&self) -> bool {
        self.evaluated
    }

    /// Store the fitness for this generation. Fails if already recorded.
    pub fn record_fitness(&mut self, fitness: f64) -> Result<()> {
        if self.evaluated {
            bail!("fitness already recorded as {}", self.fitness);
        }
        self.fitness = fitness;
        self.evaluated = true;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn scored(genes: Genes, fitness: f64) -> Self {
        Self {
            genes: Arc::new(genes),
            fitness,
            evaluated: true,
        }
    }
}

/// Summary of a fully scored generation.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationStats {
    pub generation: usize,
    pub best_fitness: f64,
    pub avg_fitness: f64,
    pub best_genes: Genes,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Population {
    individuals: Vec<Individual>,
}

impl Population {
    pub fn random<R: Rng + ?Sized>(size: usize, rng: &mut R) -> Self {
        let individuals = (0..size).map(|_| Individual::new(Genes::random(rng))).collect();
        Self { individuals }
    }

    pub fn from_individuals(individuals: Vec<Individual>) -> Self {
        Self { individuals }
    }

    pub fn len(&self) -> usize {
        self.individuals.len()
    }

    pub fn individuals(&self) -> &[Individual] {
        &self.individuals
    }

    pub fn get(&self, i_ind: usize) -> Option<&Individual> {
        self.individuals.get(i_ind)
    }

    pub fn get_mut(&mut self, i_ind: usize) -> Option<&mut Individual> {
        self.individuals.get_mut(i_ind)
    }

    /// Index of the first individual without a recorded fitness at or after `start`.
    pub fn next_unevaluated(&self, start: usize) -> Option<usize> {
        (start..self.len()).find(|&i_ind| !self.individuals[i_ind].evaluated)
    }

    /// Indices sorted by fitness descending; ties keep population order.
    pub fn ranking(&self) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.len()).collect();
        order.sort_by(|&a, &b| {
            self.individuals[b]
                .fitness
                .total_cmp(&self.individuals[a].fitness)
        });
        order
    }

    pub fn stats(&self, generation: usize) -> Option<GenerationStats> {
        let best = *self.ranking().first()?;
        let mut acc = Accumulator::new();
        self.individuals.iter().for_each(|ind| acc.add(ind.fitness));
        Some(GenerationStats {
            generation,
            best_fitness: self.individuals[best].fitness,
            avg_fitness: acc.mean(),
            best_genes: *self.individuals[best].genes,
        })
    }
}
