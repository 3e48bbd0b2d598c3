use std::{env, fs, num::NonZeroUsize};

use anyhow::{Context, Result, bail};
use log::info;
use rand::{Rng, SeedableRng, rngs::StdRng};
use rand_distr::{Distribution, Normal};
use serde::Deserialize;

use sharded_training::{
    AsyncGraphGroup, GroupConfig,
    config::SchedulerSpec,
    model::{LinearBatch, LinearReplica, Replica},
    scheduling::BasicScheduler,
};

/// A synthetic regression run on top of a group configuration.
#[derive(Debug, Deserialize)]
struct DemoConfig {
    #[serde(flatten)]
    group: GroupConfig,
    #[serde(default = "default_dim")]
    dim: usize,
    #[serde(default = "default_rows")]
    rows: usize,
    #[serde(default = "default_batches")]
    batches: usize,
    #[serde(default)]
    noise: f32,
    #[serde(default)]
    seed: u64,
}

fn default_dim() -> usize {
    16
}

fn default_rows() -> usize {
    32
}

fn default_batches() -> usize {
    2000
}

/// Draws batches of `y = w · x + b + noise` for a fixed hidden model.
struct Synthetic {
    weights: Vec<f32>,
    bias: f32,
    noise: Normal<f32>,
    features: Normal<f32>,
    rng: StdRng,
}

impl Synthetic {
    fn new(dim: usize, noise: f32, seed: u64) -> Result<Self> {
        let mut rng = StdRng::seed_from_u64(seed);
        let features = Normal::new(0., 1.)?;

        Ok(Self {
            weights: (0..dim).map(|_| features.sample(&mut rng)).collect(),
            bias: rng.random_range(-1.0..1.0),
            noise: Normal::new(0., noise)?,
            features,
            rng,
        })
    }

    fn batch(&mut self, rows: usize) -> LinearBatch {
        let dim = self.weights.len();
        let mut features = Vec::with_capacity(rows * dim);
        let mut targets = Vec::with_capacity(rows);

        for _ in 0..rows {
            let row: Vec<f32> = (0..dim).map(|_| self.features.sample(&mut self.rng)).collect();
            let y = row.iter().zip(&self.weights).map(|(x, w)| x * w).sum::<f32>()
                + self.bias
                + self.noise.sample(&mut self.rng);

            features.extend(row);
            targets.push(y);
        }

        LinearBatch::new(dim, features, targets)
    }
}

fn main() -> Result<()> {
    env_logger::init();

    let Some(path) = env::args().nth(1) else {
        bail!("usage: sharded_training <config.json>");
    };

    let raw = fs::read_to_string(&path).with_context(|| format!("reading {path}"))?;
    let demo: DemoConfig = serde_json::from_str(&raw).with_context(|| format!("parsing {path}"))?;
    demo.group.validate()?;

    let mut data = Synthetic::new(demo.dim, demo.noise, demo.seed)?;
    let holdout = data.batch(demo.rows * 4);

    let mut init = StdRng::seed_from_u64(demo.seed.wrapping_add(1));
    let base = LinearReplica::normal(0, demo.dim, 0.01, &mut init)?;
    let replicas = demo
        .group
        .devices
        .iter()
        .map(|&device| {
            let mut replica = LinearReplica::new(device, demo.dim);
            replica.params_mut().copy_from_slice(base.params());
            replica
        })
        .collect();

    let spec = demo.group.scheduler.unwrap_or(SchedulerSpec {
        disp_freq: NonZeroUsize::new(100),
        ..Default::default()
    });
    let scheduler = BasicScheduler::new(spec)
        .with_validator(move |replica: &LinearReplica| replica.loss(&holdout));

    let mut group = AsyncGraphGroup::new(demo.group, replicas, Some(scheduler))?;
    if group.load()? {
        info!("resumed from {}", group.config().model.display());
    }

    for _ in 0..demo.batches {
        group.update(data.batch(demo.rows))?;
    }

    let stats = group.collect_stats();
    info!(dim = stats.dim, params = stats.params; "replica statistics");

    let stats = group.finish()?;
    group.save(true)?;

    info!(
        batches = stats.batches, pushes = stats.pushes(), clamped = stats.clamped_shards();
        "training done"
    );
    Ok(())
}
