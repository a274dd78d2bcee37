use rand::Rng;
use serde::{Deserialize, Serialize};
use std::{fmt, ops::Index};

/// Tunable parameters of the force model, in gene-vector order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeneKind {
    SeparationWeight,
    AlignmentWeight,
    CohesionWeight,
    ObstacleAvoidWeight,
    BaseSpeed,
    SeparationRadius,
}

impl GeneKind {
    pub const ALL: [GeneKind; N_GENES] = [
        GeneKind::SeparationWeight,
        GeneKind::AlignmentWeight,
        GeneKind::CohesionWeight,
        GeneKind::ObstacleAvoidWeight,
        GeneKind::BaseSpeed,
        GeneKind::SeparationRadius,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    /// Column name used in the CSV trace.
    pub fn name(self) -> &'static str {
        match self {
            GeneKind::SeparationWeight => "separation_weight",
            GeneKind::AlignmentWeight => "alignment_weight",
            GeneKind::CohesionWeight => "cohesion_weight",
            GeneKind::ObstacleAvoidWeight => "obstacle_avoid_weight",
            GeneKind::BaseSpeed => "base_speed",
            GeneKind::SeparationRadius => "separation_radius",
        }
    }

    /// Inclusive `(min, max)` domain of the gene.
    pub fn bounds(self) -> (f64, f64) {
        match self {
            GeneKind::SeparationWeight => (0.0, 5.0),
            GeneKind::AlignmentWeight => (0.0, 5.0),
            GeneKind::CohesionWeight => (0.0, 5.0),
            GeneKind::ObstacleAvoidWeight => (0.0, 10.0),
            GeneKind::BaseSpeed => (0.5, 6.0),
            GeneKind::SeparationRadius => (0.3, 4.0),
        }
    }

    pub fn range(self) -> f64 {
        let (min, max) = self.bounds();
        max - min
    }

    /// Clamp `value` into the gene's domain.
    ///
    /// Non-finite values collapse to the lower bound.
    pub fn clamp(self, value: f64) -> f64 {
        let (min, max) = self.bounds();
        if !value.is_finite() {
            return min;
        }
        value.clamp(min, max)
    }
}

pub const N_GENES: usize = 6;

/// Fixed-length gene vector. Every stored component lies within its bounds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Genes([f64; N_GENES]);

impl Genes {
    /// Build a gene vector, clamping every component into its domain.
    pub fn new(values: [f64; N_GENES]) -> Self {
        let mut genes = Self(values);
        genes.clamp_all();
        genes
    }

    /// Sample every gene uniformly within its bounds.
    pub fn random<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let values = GeneKind::ALL.map(|kind| {
            let (min, max) = kind.bounds();
            rng.random_range(min..=max)
        });
        Self(values)
    }

    pub fn get(&self, kind: GeneKind) -> f64 {
        self.0[kind.index()]
    }

    pub fn set(&mut self, kind: GeneKind, value: f64) {
        self.0[kind.index()] = kind.clamp(value);
    }

    pub fn values(&self) -> &[f64; N_GENES] {
        &self.0
    }

    pub fn separation_weight(&self) -> f64 {
        self.get(GeneKind::SeparationWeight)
    }

    pub fn alignment_weight(&self) -> f64 {
        self.get(GeneKind::AlignmentWeight)
    }

    pub fn cohesion_weight(&self) -> f64 {
        self.get(GeneKind::CohesionWeight)
    }

    pub fn obstacle_avoid_weight(&self) -> f64 {
        self.get(GeneKind::ObstacleAvoidWeight)
    }

    pub fn base_speed(&self) -> f64 {
        self.get(GeneKind::BaseSpeed)
    }

    pub fn separation_radius(&self) -> f64 {
        self.get(GeneKind::SeparationRadius)
    }

    fn clamp_all(&mut self) {
        for kind in GeneKind::ALL {
            self.0[kind.index()] = kind.clamp(self.0[kind.index()]);
        }
    }
}

impl Default for Genes {
    /// Midpoint of every domain.
    fn default() -> Self {
        Self(GeneKind::ALL.map(|kind| {
            let (min, max) = kind.bounds();
            0.5 * (min + max)
        }))
    }
}

impl Index<GeneKind> for Genes {
    type Output = f64;

    fn index(&self, kind: GeneKind) -> &f64 {
        &self.0[kind.index()]
    }
}

impl fmt::Display for Genes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i_gene, kind) in GeneKind::ALL.iter().enumerate() {
            if i_gene > 0 {
                write!(f, " ")?;
            }
            write!(f, "{}={:.3}", kind.name(), self.get(*kind))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha12Rng;

    fn assert_in_bounds(genes: &Genes) {
        for kind in GeneKind::ALL {
            let (min, max) = kind.bounds();
            let value = genes.get(kind);
            assert!(
                (min..=max).contains(&value),
                "{} = {value} outside [{min}, {max}]",
                kind.name()
            );
        }
    }

    #[test]
    fn clamp_keeps_every_component_in_bounds() {
        let extremes = [
            [-1e9, 1e9, f64::NAN, f64::INFINITY, f64::NEG_INFINITY, 0.0],
            [1e9, -1e9, 2.5, -0.1, 100.0, 5.0],
            [0.0; N_GENES],
        ];
        for values in extremes {
            assert_in_bounds(&Genes::new(values));
        }

        let mut rng = ChaCha12Rng::seed_from_u64(7);
        for _ in 0..200 {
            let values: [f64; N_GENES] = std::array::from_fn(|_| rng.random_range(-50.0..50.0));
            assert_in_bounds(&Genes::new(values));
        }
    }

    #[test]
    fn non_finite_values_collapse_to_lower_bound() {
        for value in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let genes = Genes::new([value; N_GENES]);
            for kind in GeneKind::ALL {
                assert_eq!(genes[kind], kind.bounds().0, "{kind:?} from {value}");
            }
        }
    }

    #[test]
    fn random_genes_are_in_bounds() {
        let mut rng = ChaCha12Rng::seed_from_u64(11);
        for _ in 0..100 {
            assert_in_bounds(&Genes::random(&mut rng));
        }
    }

    #[test]
    fn set_clamps() {
        let mut genes = Genes::default();
        genes.set(GeneKind::BaseSpeed, 100.0);
        assert_eq!(genes.base_speed(), 6.0);
        genes.set(GeneKind::SeparationRadius, -3.0);
        assert_eq!(genes[GeneKind::SeparationRadius], 0.3);
    }
}
