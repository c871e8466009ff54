//! Random synthesis of candidate packet functions

use log::debug;
use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;

use super::expr::{BinaryOp, PacketFunction, UnaryOp};

/// Binary operations used when none are configured
pub const DEFAULT_BINARY_OPS: [BinaryOp; 1] = [BinaryOp::Xor];

/// Feature extractions used when none are configured
pub const DEFAULT_UNARY_OPS: [UnaryOp; 4] = [
    UnaryOp::LeftBytes(1),
    UnaryOp::LeftBytes(2),
    UnaryOp::RightBytes(1),
    UnaryOp::RightBytes(2),
];

/// Grows a function population by composing existing members
#[derive(Debug, Clone)]
pub struct FunctionSynthesizer {
    featext_probability: f64,
    binary_ops: Vec<BinaryOp>,
    unary_ops: Vec<UnaryOp>,
}

impl Default for FunctionSynthesizer {
    fn default() -> Self {
        Self::new(0.1, DEFAULT_BINARY_OPS.to_vec(), DEFAULT_UNARY_OPS.to_vec())
    }
}

impl FunctionSynthesizer {
    /// Empty operator sets fall back to the defaults
    pub fn new(featext_probability: f64, binary_ops: Vec<BinaryOp>, unary_ops: Vec<UnaryOp>) -> Self {
        Self {
            featext_probability: featext_probability.clamp(0.0, 1.0),
            binary_ops: if binary_ops.is_empty() {
                DEFAULT_BINARY_OPS.to_vec()
            } else {
                binary_ops
            },
            unary_ops: if unary_ops.is_empty() {
                DEFAULT_UNARY_OPS.to_vec()
            } else {
                unary_ops
            },
        }
    }

    /// Append `n` synthesized functions to `seeds` and return the whole population.
    ///
    /// With probability `featext_probability` a step applies a feature
    /// extraction to one member, otherwise it combines two members with a
    /// binary operation. Members are picked with weight 1/cost², so cheap
    /// functions are reused more often than deep ones.
    pub fn generate<R: Rng + ?Sized>(
        &self,
        n: usize,
        seeds: Vec<PacketFunction>,
        rng: &mut R,
    ) -> Vec<PacketFunction> {
        let mut population = seeds;
        if population.is_empty() {
            return population;
        }
        population.reserve(n);

        for _ in 0..n {
            let next = if rng.gen::<f64>() > self.featext_probability {
                let a = select_function(&population, rng);
                let b = select_function(&population, rng);
                let op = self.binary_ops[rng.gen_range(0..self.binary_ops.len())];
                PacketFunction::binary(op, &population[a], &population[b])
            } else {
                let a = select_function(&population, rng);
                let op = self.unary_ops[rng.gen_range(0..self.unary_ops.len())];
                PacketFunction::unary(op, &population[a])
            };
            population.push(next);
        }

        debug!(
            "Synthesized {} functions, max cost {}",
            n,
            population.iter().map(|f| f.cost()).max().unwrap_or(0)
        );
        population
    }
}

/// Pick a population index with probability proportional to 1/cost²
pub fn select_function<R: Rng + ?Sized>(population: &[PacketFunction], rng: &mut R) -> usize {
    let weights = population.iter().map(|f| {
        let cost = f.cost().max(1) as f64;
        1.0 / (cost * cost)
    });
    match WeightedIndex::new(weights) {
        Ok(dist) => dist.sample(rng),
        Err(_) => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::Field;
    use crate::synthesis::expr::initial_set;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_generate_appends_n_functions() {
        let mut rng = StdRng::seed_from_u64(7);
        let population = FunctionSynthesizer::default().generate(200, initial_set(), &mut rng);
        assert_eq!(population.len(), 207);
        assert_eq!(population[..7], initial_set()[..]);
        assert!(population[7..].iter().all(|f| f.cost() >= 2));
    }

    #[test]
    fn test_generation_is_reproducible() {
        let synth = FunctionSynthesizer::default();
        let a = synth.generate(50, initial_set(), &mut StdRng::seed_from_u64(42));
        let b = synth.generate(50, initial_set(), &mut StdRng::seed_from_u64(42));
        assert_eq!(a, b);
    }

    #[test]
    fn test_only_unary_when_probability_is_one() {
        let synth = FunctionSynthesizer::new(1.0, vec![], vec![UnaryOp::ShiftRight(3)]);
        let population = synth.generate(20, vec![PacketFunction::seed(Field::Seq)], &mut StdRng::seed_from_u64(1));
        // Every step extends a chain of shifts, one more operator each time
        assert!(population[1..]
            .iter()
            .all(|f| f.expr().children().len() == 1));
    }

    #[test]
    fn test_selection_favours_cheap_functions() {
        let cheap = PacketFunction::seed(Field::Seq);
        let mut deep = cheap.clone();
        for _ in 0..9 {
            deep = PacketFunction::unary(UnaryOp::ShiftLeft(1), &deep);
        }
        assert_eq!(deep.cost(), 10);

        let population = vec![cheap, deep];
        let mut rng = StdRng::seed_from_u64(3);
        let cheap_picks = (0..10_000)
            .filter(|_| select_function(&population, &mut rng) == 0)
            .count();
        // Expected share is 1 / (1 + 1/100) ≈ 0.99
        assert!(cheap_picks > 9_700, "cheap picked {} times", cheap_picks);
    }

    #[test]
    fn test_empty_seed_set() {
        let population = FunctionSynthesizer::default().generate(10, Vec::new(), &mut StdRng::seed_from_u64(0));
        assert!(population.is_empty());
    }
}
