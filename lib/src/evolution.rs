//! Differential Evolution over normalized agents, and the worker pool
//! evaluating populations in parallel.

use std::{
    sync::mpsc,
    thread,
    time::{Duration, Instant},
};

use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

/// A chromosome with every component in `[0, 1]`.
pub type Agent = Vec<f64>;

/// Linear bounds decoding agents into physical values.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub min: Vec<f64>,
    pub max: Vec<f64>,
}

impl Bounds {
    pub fn push(&mut self, min: f64, max: f64) {
        self.min.push(min);
        self.max.push(max);
    }

    pub fn dim(&self) -> usize {
        self.min.len()
    }

    pub fn decode(&self, agent: &[f64]) -> Vec<f64> {
        agent
            .iter()
            .zip(self.min.iter().zip(&self.max))
            .map(|(u, (min, max))| min + u * (max - min))
            .collect()
    }

    /// Inverse of [`Bounds::decode`], clamped into the unit cube.
    pub fn encode(&self, values: &[f64]) -> Agent {
        values
            .iter()
            .zip(self.min.iter().zip(&self.max))
            .map(|(x, (min, max))| {
                if max > min {
                    ((x - min) / (max - min)).clamp(0.0, 1.0)
                } else {
                    0.0
                }
            })
            .collect()
    }
}

pub fn clamp_agent(agent: &mut [f64]) {
    for u in agent {
        *u = if u.is_nan() { 0.5 } else { u.clamp(0.0, 1.0) };
    }
}

pub fn random_agent(dim: usize, rng: &mut impl Rng) -> Agent {
    (0..dim).map(|_| rng.gen::<f64>()).collect()
}

/// Index and value of the smallest finite entry.
pub fn finite_min(values: &[f64]) -> Option<(usize, f64)> {
    values
        .iter()
        .copied()
        .enumerate()
        .filter(|(_, v)| v.is_finite())
        .min_by(|a, b| a.1.total_cmp(&b.1))
}

/// Mean of the finite entries.
pub fn finite_mean(values: &[f64]) -> Option<f64> {
    let (sum, count) = values
        .iter()
        .filter(|v| v.is_finite())
        .fold((0.0, 0usize), |(sum, count), v| (sum + v, count + 1));
    (count > 0).then(|| sum / count as f64)
}

/// `a` is at least as good as `b`, NaN ranking worst.
pub fn no_worse(a: f64, b: f64) -> bool {
    !a.is_nan() && (b.is_nan() || a <= b)
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeSettings {
    /// Population size is `population_base + population_per_patch *
    /// patches`.
    pub population_base: usize,
    pub population_per_patch: usize,
    /// Differential weight.
    pub f: f64,
    /// Crossover probability.
    pub cr: f64,
    /// Stop once `(mean - best) / |best|` drops below this.
    pub gap_tolerance: f64,
    pub max_generations: usize,
    /// Wall clock budget, checked between generations.
    pub max_duration: Duration,
    pub seed: u64,
    /// Worker threads, `None` for `min(cores - 1, 4)`.
    pub threads: Option<usize>,
}

impl Default for DeSettings {
    fn default() -> Self {
        Self {
            population_base: 25,
            population_per_patch: 25,
            f: 0.3,
            cr: 0.9,
            gap_tolerance: 0.01,
            max_generations: 500,
            max_duration: Duration::from_secs(120),
            seed: 0x5eed,
            threads: None,
        }
    }
}

impl DeSettings {
    pub fn population_size(&self, patches: usize) -> usize {
        self.population_base + self.population_per_patch * patches
    }

    pub fn rng(&self) -> StdRng {
        StdRng::seed_from_u64(self.seed)
    }
}

fn distinct_index(n: usize, exclude: &[usize], rng: &mut impl Rng) -> usize {
    loop {
        let k = rng.gen_range(0..n);
        if !exclude.contains(&k) {
            break k;
        }
    }
}

/// DE/rand/1/bin trial vector for agent `i`.
pub fn de_trial(agents: &[Agent], i: usize, f: f64, cr: f64, rng: &mut impl Rng) -> Agent {
    let target = &agents[i];
    let dim = target.len();
    if agents.len() < 4 || dim == 0 {
        return target.clone();
    }
    let a = distinct_index(agents.len(), &[i], rng);
    let b = distinct_index(agents.len(), &[i, a], rng);
    let c = distinct_index(agents.len(), &[i, a, b], rng);
    let jrand = rng.gen_range(0..dim);
    (0..dim)
        .map(|j| {
            if j == jrand || rng.gen::<f64>() < cr {
                (agents[a][j] + f * (agents[b][j] - agents[c][j])).clamp(0.0, 1.0)
            } else {
                target[j]
            }
        })
        .collect()
}

/// Fork-join pool over scoped threads.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct WorkerPool {
    threads: usize,
}

impl WorkerPool {
    pub const MAX_THREADS: usize = 4;

    pub fn new(threads: Option<usize>) -> Self {
        let threads = threads
            .unwrap_or_else(|| {
                thread::available_parallelism()
                    .map_or(1, |n| n.get().saturating_sub(1))
                    .min(Self::MAX_THREADS)
            })
            .max(1);
        Self { threads }
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Apply `f(index, item, rng)` to every item.
    ///
    /// Items are split into one contiguous chunk per thread; each chunk
    /// gets its own RNG seeded from `rng`, and the results come back in
    /// item order.
    pub fn map<T, R, F>(&self, items: &[T], rng: &mut StdRng, f: F) -> Vec<R>
    where
        T: Sync,
        R: Send,
        F: Fn(usize, &T, &mut StdRng) -> R + Sync,
    {
        let chunk_len = items.len().div_ceil(self.threads).max(1);
        let seeds = items
            .chunks(chunk_len)
            .map(|_| rng.gen::<u64>())
            .collect::<Vec<_>>();

        let run_chunk = |idx: usize, chunk: &[T], seed: u64| {
            let mut rng = StdRng::seed_from_u64(seed);
            chunk
                .iter()
                .enumerate()
                .map(|(j, item)| f(idx * chunk_len + j, item, &mut rng))
                .collect::<Vec<_>>()
        };

        if seeds.len() <= 1 {
            return items
                .chunks(chunk_len)
                .zip(seeds)
                .flat_map(|(chunk, seed)| run_chunk(0, chunk, seed))
                .collect();
        }

        let (tx, rx) = mpsc::channel();
        thread::scope(|s| {
            for (idx, (chunk, seed)) in items.chunks(chunk_len).zip(seeds).enumerate() {
                let tx = tx.clone();
                let run_chunk = &run_chunk;
                s.spawn(move || {
                    // the receiver outlives the scope
                    let _ = tx.send((idx, run_chunk(idx, chunk, seed)));
                });
            }
        });
        drop(tx);

        let mut results = rx.into_iter().collect::<Vec<_>>();
        results.sort_unstable_by_key(|(idx, _)| *idx);
        results.into_iter().flat_map(|(_, out)| out).collect()
    }
}

/// A DE population and its fitness values.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Population {
    pub agents: Vec<Agent>,
    pub fitness: Vec<f64>,
    pub generation: usize,
}

impl Population {
    /// Evaluate `agents` on the pool.
    pub fn evaluate<F>(agents: Vec<Agent>, fitness: &F, pool: &WorkerPool, rng: &mut StdRng) -> Self
    where
        F: Fn(&[f64]) -> f64 + Sync,
    {
        let values = pool.map(&agents, rng, |_, agent, _| fitness(agent));
        Self {
            agents,
            fitness: values,
            generation: 0,
        }
    }

    /// The best agent with finite fitness.
    pub fn best(&self) -> Option<(&Agent, f64)> {
        finite_min(&self.fitness).map(|(i, fit)| (&self.agents[i], fit))
    }

    /// Relative gap between mean and best fitness, infinite when no
    /// agent is finite.
    pub fn gap(&self) -> f64 {
        match (finite_min(&self.fitness), finite_mean(&self.fitness)) {
            (Some((_, best)), Some(mean)) => (mean - best) / best.abs().max(f64::MIN_POSITIVE),
            _ => f64::INFINITY,
        }
    }
}

/// Run DE generations until the gap, generation or wall clock limit is
/// hit. The best agent never gets worse.
pub fn evolve<F>(
    mut population: Population,
    fitness: &F,
    settings: &DeSettings,
    pool: &WorkerPool,
    rng: &mut StdRng,
) -> Population
where
    F: Fn(&[f64]) -> f64 + Sync,
{
    let start = Instant::now();
    while population.generation < settings.max_generations {
        let gap = population.gap();
        if gap < settings.gap_tolerance {
            debug!(
                "evolve: converged after {} generations (gap {gap:e})",
                population.generation
            );
            break;
        }
        if start.elapsed() > settings.max_duration {
            warn!(
                "evolve: wall clock budget of {:?} exhausted after {} generations",
                settings.max_duration, population.generation
            );
            break;
        }

        let agents = &population.agents;
        let trials = pool.map(agents, rng, |i, _, rng| {
            let trial = de_trial(agents, i, settings.f, settings.cr, rng);
            let fit = fitness(&trial);
            (trial, fit)
        });
        for (i, (trial, fit)) in trials.into_iter().enumerate() {
            if no_worse(fit, population.fitness[i]) {
                population.agents[i] = trial;
                population.fitness[i] = fit;
            }
        }
        population.generation += 1;
        trace!(
            "evolve: generation {}, best {:?}, gap {}",
            population.generation,
            population.best().map(|(_, fit)| fit),
            population.gap()
        );
    }
    population
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;

    use super::*;

    #[test]
    fn bounds() {
        let mut bounds = Bounds::default();
        bounds.push(10.0, 20.0);
        bounds.push(-1.0, 1.0);
        assert_eq!(bounds.decode(&[0.5, 0.0]), vec![15.0, -1.0]);
        assert_eq!(bounds.encode(&[25.0, 0.0]), vec![1.0, 0.5]);
    }

    #[test]
    fn nan_filtering() {
        let values = [3.0, f64::NAN, 1.0, f64::INFINITY, 2.0];
        assert_eq!(finite_min(&values), Some((2, 1.0)));
        assert_eq!(finite_mean(&values), Some(2.0));
        assert_eq!(finite_min(&[f64::NAN]), None);
        assert!(no_worse(1.0, f64::NAN));
        assert!(!no_worse(f64::NAN, 1.0));
    }

    #[test]
    fn pool_keeps_order_and_seeds() {
        let items = (0..103).collect::<Vec<usize>>();
        let pool = WorkerPool::new(Some(3));
        let mut rng = StdRng::seed_from_u64(7);
        let out = pool.map(&items, &mut rng, |i, item, rng| (i, *item, rng.gen::<u32>()));
        assert!(out.iter().enumerate().all(|(k, (i, item, _))| k == *i && k == *item));

        let mut rng = StdRng::seed_from_u64(7);
        let again = pool.map(&items, &mut rng, |i, item, rng| (i, *item, rng.gen::<u32>()));
        assert_eq!(out, again);
    }

    #[test]
    fn sphere() {
        let fitness = |x: &[f64]| x.iter().map(|u| (u - 0.3).powi(2)).sum::<f64>();
        let settings = DeSettings {
            gap_tolerance: 1e-6,
            threads: Some(2),
            ..Default::default()
        };
        let pool = WorkerPool::new(settings.threads);
        let mut rng = settings.rng();
        let agents = (0..30).map(|_| random_agent(3, &mut rng)).collect();
        let population = Population::evaluate(agents, &fitness, &pool, &mut rng);
        let initial_best = population.best().unwrap().1;
        let population = evolve(population, &fitness, &settings, &pool, &mut rng);
        let (best, fit) = population.best().unwrap();
        assert!(fit <= initial_best);
        assert!(fit < 1e-6);
        for u in best {
            assert_abs_diff_eq!(*u, 0.3, epsilon = 1e-2);
        }
    }
}
