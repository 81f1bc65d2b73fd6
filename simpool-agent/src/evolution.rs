//! Population-search trainer over flat policy genomes.
use crate::mat::gaussian;
use crate::Mlp;
use anyhow::Result;
use log::info;
use serde::{Deserialize, Serialize};
use simpool_core::record::{Record, RecordValue};
use std::{
    fs::File,
    io::{BufReader, Write},
    path::Path,
};

/// Configuration of [`PopulationTrainer`].
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct EvolutionConfig {
    /// Genomes per generation.
    pub population: usize,

    /// Fraction of the population carried over unchanged.
    pub elite_frac: f32,

    /// Tournament size for parent selection.
    pub tournament: usize,

    /// Per-parameter mutation probability.
    pub mutation_prob: f32,

    /// Standard deviation of the Gaussian mutation.
    pub mutation_std: f32,

    /// Mutated parameters are clamped to `[-bound, bound]`.
    pub mutation_bound: f32,

    /// Episodes averaged per fitness evaluation.
    pub episodes_per_eval: usize,

    /// Seed for genome initialization and the evolution loop.
    pub seed: u64,
}

impl Default for EvolutionConfig {
    fn default() -> Self {
        Self {
            population: 32,
            elite_frac: 0.125,
            tournament: 3,
            mutation_prob: 0.05,
            mutation_std: 0.1,
            mutation_bound: 5.0,
            episodes_per_eval: 1,
            seed: 0,
        }
    }
}

impl EvolutionConfig {
    /// Sets the population size.
    pub fn population(mut self, v: usize) -> Self {
        self.population = v;
        self
    }

    /// Sets the elite fraction.
    pub fn elite_frac(mut self, v: f32) -> Self {
        self.elite_frac = v;
        self
    }

    /// Sets the tournament size.
    pub fn tournament(mut self, v: usize) -> Self {
        self.tournament = v;
        self
    }

    /// Sets the per-parameter mutation probability.
    pub fn mutation_prob(mut self, v: f32) -> Self {
        self.mutation_prob = v;
        self
    }

    /// Sets the episodes averaged per evaluation.
    pub fn episodes_per_eval(mut self, v: usize) -> Self {
        self.episodes_per_eval = v;
        self
    }

    /// Sets the seed.
    pub fn seed(mut self, v: u64) -> Self {
        self.seed = v;
        self
    }

    /// Constructs [`EvolutionConfig`] from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path)?;
        let rdr = BufReader::new(file);
        let config = serde_yaml::from_reader(rdr)?;
        Ok(config)
    }

    /// Saves the configuration as YAML.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut file = File::create(path)?;
        file.write_all(serde_yaml::to_string(&self)?.as_bytes())?;
        Ok(())
    }
}

/// Evolves a population of policy networks by fitness ranking.
///
/// Each genome is the flat parameter vector of an [`Mlp`] with a fixed
/// architecture. A generation is: evaluate every genome, rank by mean episode
/// fitness, carry the elites over unchanged, and fill the remainder with
/// tournament-selected crossover children under bounded Gaussian mutation.
/// The best genome ever seen is kept aside as the champion and never mutated.
pub struct PopulationTrainer {
    config: EvolutionConfig,
    dims: Vec<usize>,
    genomes: Vec<Vec<f32>>,
    fitness: Vec<f32>,
    champion: Option<(Vec<f32>, f32)>,
    generation: usize,
    rng: fastrand::Rng,
}

impl PopulationTrainer {
    /// Seeds a population of networks with layer sizes `dims`.
    pub fn new(config: EvolutionConfig, dims: &[usize]) -> Self {
        let genomes = (0..config.population)
            .map(|i| Mlp::new(dims, config.seed.wrapping_add(i as u64)).params())
            .collect();
        Self {
            rng: fastrand::Rng::with_seed(config.seed ^ 0x9e37),
            dims: dims.to_vec(),
            genomes,
            fitness: vec![f32::NEG_INFINITY; config.population],
            champion: None,
            generation: 0,
            config,
        }
    }

    /// Completed generations.
    pub fn generation(&self) -> usize {
        self.generation
    }

    /// Current genomes.
    pub fn genomes(&self) -> &[Vec<f32>] {
        &self.genomes
    }

    /// Fitness of the last evaluation, index-aligned with [`genomes`].
    ///
    /// [`genomes`]: Self::genomes
    pub fn fitness(&self) -> &[f32] {
        &self.fitness
    }

    /// The best genome ever evaluated and its fitness.
    pub fn champion(&self) -> Option<(&[f32], f32)> {
        self.champion.as_ref().map(|(g, f)| (g.as_slice(), *f))
    }

    /// The champion rebuilt as a network.
    pub fn champion_policy(&self) -> Option<Mlp> {
        self.champion.as_ref().map(|(g, _)| {
            let mut mlp = Mlp::new(&self.dims, 0);
            mlp.set_params(g);
            mlp
        })
    }

    /// Genome `index` as a network.
    pub fn policy(&self, index: usize) -> Mlp {
        let mut mlp = Mlp::new(&self.dims, 0);
        mlp.set_params(&self.genomes[index]);
        mlp
    }

    /// Evaluates every genome with `episode`, averaging over
    /// `episodes_per_eval` calls; non-finite fitness ranks last.
    pub fn evaluate(&mut self, mut episode: impl FnMut(&Mlp) -> f32) {
        let n = self.config.episodes_per_eval.max(1);
        for i in 0..self.genomes.len() {
            let mlp = self.policy(i);
            let mut total = 0.0;
            for _ in 0..n {
                total += episode(&mlp);
            }
            let mean = total / n as f32;
            self.fitness[i] = if mean.is_finite() {
                mean
            } else {
                f32::NEG_INFINITY
            };
        }
    }

    /// Produces the next generation from the last evaluation.
    pub fn evolve(&mut self) -> Record {
        let mut order: Vec<usize> = (0..self.genomes.len()).collect();
        order.sort_by(|a, b| {
            self.fitness[*b]
                .partial_cmp(&self.fitness[*a])
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let best = order[0];
        let improved = match &self.champion {
            Some((_, f)) => self.fitness[best] > *f,
            None => self.fitness[best].is_finite(),
        };
        if improved {
            self.champion = Some((self.genomes[best].clone(), self.fitness[best]));
        }

        let n_elite = ((self.config.elite_frac * self.genomes.len() as f32).ceil()
            as usize)
            .clamp(1, self.genomes.len());
        let mut next: Vec<Vec<f32>> = order[..n_elite]
            .iter()
            .map(|i| self.genomes[*i].clone())
            .collect();
        while next.len() < self.genomes.len() {
            let a = self.tournament_pick();
            let b = self.tournament_pick();
            let mut child = self.crossover(a, b);
            self.mutate(&mut child);
            next.push(child);
        }
        self.genomes = next;
        self.generation += 1;

        let mean =
            self.fitness.iter().sum::<f32>() / self.fitness.len().max(1) as f32;
        info!(
            "generation {}: best {:.3}, mean {:.3}",
            self.generation, self.fitness[best], mean
        );
        let mut record = Record::from_scalar("best_fitness", self.fitness[best]);
        record.insert("mean_fitness", RecordValue::Scalar(mean));
        record.insert("generation", RecordValue::Scalar(self.generation as f32));
        record
    }

    /// Index of the fittest out of `tournament` random draws.
    fn tournament_pick(&self) -> usize {
        let mut best = self.rng.usize(..self.genomes.len());
        for _ in 1..self.config.tournament.max(1) {
            let challenger = self.rng.usize(..self.genomes.len());
            if self.fitness[challenger] > self.fitness[best] {
                best = challenger;
            }
        }
        best
    }

    /// Uniform per-parameter crossover.
    fn crossover(&self, a: usize, b: usize) -> Vec<f32> {
        self.genomes[a]
            .iter()
            .zip(self.genomes[b].iter())
            .map(|(x, y)| if self.rng.bool() { *x } else { *y })
            .collect()
    }

    /// Bounded Gaussian mutation at a fixed per-parameter probability.
    fn mutate(&self, genome: &mut [f32]) {
        let bound = self.config.mutation_bound;
        for g in genome.iter_mut() {
            if self.rng.f32() < self.config.mutation_prob {
                *g = (*g + self.config.mutation_std * gaussian(&self.rng))
                    .clamp(-bound, bound);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> EvolutionConfig {
        EvolutionConfig::default()
            .population(8)
            .elite_frac(0.25)
            .mutation_prob(1.0)
            .seed(5)
    }

    /// Fitness that prefers parameters close to zero.
    fn norm_fitness(mlp: &Mlp) -> f32 {
        -mlp.params().iter().map(|p| p * p).sum::<f32>()
    }

    #[test]
    fn config_round_trips_through_yaml() {
        let config = small_config();
        let dir = tempdir::TempDir::new("evolution_config").unwrap();
        let path = dir.path().join("evolution.yaml");
        config.save(&path).unwrap();
        assert_eq!(EvolutionConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn elites_survive_a_generation_unchanged() {
        let mut trainer = PopulationTrainer::new(small_config(), &[4, 8, 2]);
        trainer.evaluate(norm_fitness);

        let mut ranked: Vec<usize> = (0..8).collect();
        ranked.sort_by(|a, b| {
            trainer.fitness[*b].partial_cmp(&trainer.fitness[*a]).unwrap()
        });
        let elites: Vec<Vec<f32>> =
            ranked[..2].iter().map(|i| trainer.genomes[*i].clone()).collect();

        trainer.evolve();
        assert_eq!(&trainer.genomes()[..2], elites.as_slice());
    }

    #[test]
    fn champion_fitness_never_decreases() {
        let mut trainer = PopulationTrainer::new(small_config(), &[4, 8, 2]);
        let mut last = f32::NEG_INFINITY;
        for _ in 0..10 {
            trainer.evaluate(norm_fitness);
            trainer.evolve();
            let (_, f) = trainer.champion().unwrap();
            assert!(f >= last, "champion regressed: {} < {}", f, last);
            last = f;
        }
    }

    #[test]
    fn non_finite_fitness_ranks_last() {
        let mut trainer = PopulationTrainer::new(small_config(), &[2, 2]);
        let mut calls = 0;
        trainer.evaluate(|_mlp| {
            calls += 1;
            if calls == 1 {
                f32::NAN
            } else {
                1.0
            }
        });
        assert_eq!(trainer.fitness()[0], f32::NEG_INFINITY);
        assert!(trainer.fitness()[1..].iter().all(|f| *f == 1.0));
    }

    #[test]
    fn mutation_respects_the_bound() {
        let mut config = small_config();
        config.mutation_std = 100.0;
        config.mutation_bound = 2.0;
        let mut trainer = PopulationTrainer::new(config, &[4, 4]);
        trainer.evaluate(norm_fitness);
        trainer.evolve();
        // Elites are carried verbatim; every child parameter was mutated
        // (probability 1.0) and must land inside the bound.
        for genome in &trainer.genomes()[2..] {
            assert!(genome.iter().all(|g| g.abs() <= 2.0 + 1e-6));
        }
    }

    #[test]
    fn champion_policy_rebuilds_the_stored_genome() {
        let mut trainer = PopulationTrainer::new(small_config(), &[3, 4, 1]);
        trainer.evaluate(norm_fitness);
        trainer.evolve();
        let (genome, _) = trainer.champion().unwrap();
        let mlp = trainer.champion_policy().unwrap();
        assert_eq!(mlp.params(), genome);
    }

    #[test]
    fn population_size_is_stable_across_generations() {
        let mut trainer = PopulationTrainer::new(small_config(), &[2, 2]);
        for _ in 0..3 {
            trainer.evaluate(norm_fitness);
            let record = trainer.evolve();
            assert_eq!(trainer.genomes().len(), 8);
            assert!(record.get_scalar("best_fitness").is_some());
        }
    }
}
