use std::{
    env, fs,
    num::NonZeroUsize,
    panic::{self, AssertUnwindSafe},
    path::PathBuf,
    process,
    sync::{Arc, Barrier},
    thread,
};

use parking_lot::Mutex;
use rand::{SeedableRng, rngs::StdRng};
use rand_distr::{Distribution, Normal};

use sharded_training::{
    AsyncGraphGroup, GroupConfig, TrainErr,
    checkpoint::{self, Checkpointer},
    config::{DropKernelSpec, MovingAverageSpec, OptimizerSpec, SchedulerSpec},
    model::{Batch, LinearBatch, LinearReplica, Replica},
    scheduling::BasicScheduler,
};

const SGD: OptimizerSpec = OptimizerSpec::GradientDescent { learning_rate: 1. };

/// A batch that dictates the gradient the replica reports.
#[derive(Debug, Clone)]
struct ScriptedBatch {
    grad: Vec<f32>,
    words: usize,
    explode: bool,
    /// Builds wait `holds` times on the gate before returning.
    gate: Option<Arc<Barrier>>,
    holds: usize,
}

impl ScriptedBatch {
    fn new(grad: &[f32], words: usize) -> Self {
        Self {
            grad: grad.to_vec(),
            words,
            explode: false,
            gate: None,
            holds: 0,
        }
    }

    fn gated(grad: &[f32], gate: &Arc<Barrier>, holds: usize) -> Self {
        Self {
            gate: Some(Arc::clone(gate)),
            holds,
            ..Self::new(grad, 1)
        }
    }
}

impl Batch for ScriptedBatch {
    fn words(&self) -> usize {
        self.words
    }
}

/// Reports scripted gradients and records the parameters seen by every build.
struct ScriptedReplica {
    device: usize,
    params: Vec<f32>,
    grads: Vec<f32>,
    batch: Option<ScriptedBatch>,
    seen: Arc<Mutex<Vec<Vec<f32>>>>,
}

impl ScriptedReplica {
    fn new(device: usize, params: &[f32]) -> Self {
        Self {
            device,
            params: params.to_vec(),
            grads: vec![0.; params.len()],
            batch: None,
            seen: Arc::default(),
        }
    }
}

impl Replica for ScriptedReplica {
    type Batch = ScriptedBatch;
    type Stats = usize;

    fn device(&self) -> usize {
        self.device
    }

    fn build(&mut self, batch: &ScriptedBatch) {
        self.seen.lock().push(self.params.clone());
        self.batch = Some(batch.clone());

        if let Some(gate) = &batch.gate {
            for _ in 0..batch.holds {
                gate.wait();
            }
        }
    }

    fn forward(&mut self) -> f32 {
        let batch = self.batch.as_ref().unwrap();
        if batch.explode {
            panic!("scripted failure");
        }
        batch.grad.iter().sum()
    }

    fn backward(&mut self) {
        let batch = self.batch.as_ref().unwrap();
        self.grads.copy_from_slice(&batch.grad);
    }

    fn params(&self) -> &[f32] {
        &self.params
    }

    fn params_mut(&mut self) -> &mut [f32] {
        &mut self.params
    }

    fn grads(&self) -> &[f32] {
        &self.grads
    }

    fn collect_stats(&self) -> usize {
        self.params.len()
    }
}

type ScriptedGroup = AsyncGraphGroup<ScriptedReplica, BasicScheduler<ScriptedReplica>>;

fn scratch_model(name: &str) -> PathBuf {
    let dir = env::temp_dir().join(format!("sharded-training-it-{name}-{}", process::id()));
    fs::create_dir_all(&dir).unwrap();
    dir.join("model.bin")
}

fn wait_for_versions(group: &ScriptedGroup, version: usize) {
    while group.store().versions().iter().any(|&v| v < version) {
        thread::yield_now();
    }
}

fn config(devices: usize, tau: usize) -> GroupConfig {
    let mut config = GroupConfig::new((0..devices).collect(), SGD);
    config.tau = NonZeroUsize::new(tau).unwrap();
    config
}

#[test]
fn accumulated_window_matches_single_summed_push() {
    let mut accumulated = config(1, 3);
    accumulated.scale_lr = true;
    accumulated.average_batch_words = 10.;

    let replica = ScriptedReplica::new(0, &[0.; 3]);
    let seen = Arc::clone(&replica.seen);

    let mut group = ScriptedGroup::new(accumulated.clone(), vec![replica], None).unwrap();
    group.update(ScriptedBatch::new(&[1., 0., 2.], 2)).unwrap();
    group.update(ScriptedBatch::new(&[0., 1., 1.], 3)).unwrap();
    group.update(ScriptedBatch::new(&[1., 1., 0.], 5)).unwrap();
    let stats = group.finish().unwrap();

    assert_eq!(stats.versions, [1]);
    assert_eq!(stats.workers[0].dense_fetches, 1);
    assert_eq!(*seen.lock(), vec![vec![0.; 3]; 3]);

    let mut single = accumulated;
    single.tau = NonZeroUsize::MIN;

    let mut reference =
        ScriptedGroup::new(single, vec![ScriptedReplica::new(0, &[0.; 3])], None).unwrap();
    reference
        .update(ScriptedBatch::new(&[2., 2., 3.], 10))
        .unwrap();
    reference.finish().unwrap();

    assert_eq!(group.store().snapshot(), reference.store().snapshot());
    assert_eq!(group.store().snapshot(), [-2., -2., -3.]);
}

#[test]
fn validation_sees_shadow_and_training_keeps_live_parameters() {
    let mut config = config(1, 2);
    config.moving_average = Some(MovingAverageSpec { decay: 0.5 });

    let validated = Arc::new(Mutex::new(Vec::new()));
    let scheduler = {
        let validated = Arc::clone(&validated);
        BasicScheduler::new(SchedulerSpec {
            valid_freq: NonZeroUsize::new(1),
            ..Default::default()
        })
        .with_validator(move |replica: &ScriptedReplica| {
            validated.lock().push(replica.params()[0]);
            0.
        })
    };

    let replica = ScriptedReplica::new(0, &[0.]);
    let seen = Arc::clone(&replica.seen);

    let mut group = AsyncGraphGroup::new(config, vec![replica], Some(scheduler)).unwrap();
    for _ in 0..6 {
        group.update(ScriptedBatch::new(&[1.], 1)).unwrap();
    }
    group.finish().unwrap();

    let seen: Vec<f32> = seen.lock().iter().map(|params| params[0]).collect();
    assert_eq!(seen, [0., 0., -2., -2., -4., -4.]);

    // decay after three batches is 4 / 13
    let blended = 4. / 13. * -2. + 9. / 13. * -4.;
    let validated = validated.lock();
    assert_eq!(validated.len(), 6);
    assert_eq!(validated[..3], [0., -2., -2.]);
    assert!((validated[3] - blended).abs() < 1e-5);
    assert!((validated[4] - blended).abs() < 1e-5);

    let scheduler = group.scheduler().unwrap().read();
    assert_eq!(scheduler.state().validations, 6);
}

#[test]
fn compressed_training_converges_and_saves_shadow() {
    let model = scratch_model("compressed");
    let dim = 4;

    let mut config = GroupConfig::new(
        vec![0, 1],
        OptimizerSpec::GradientDescent { learning_rate: 0.05 },
    );
    config.drop_rate = 0.4;
    config.drop_kernel = DropKernelSpec::Residual;
    config.moving_average = Some(MovingAverageSpec { decay: 0.9 });
    config.model = model.clone();

    let mut rng = StdRng::seed_from_u64(11);
    let normal = Normal::new(0f32, 1.).unwrap();
    let hidden: Vec<f32> = (0..dim).map(|_| normal.sample(&mut rng)).collect();

    let mut batch = |rows: usize| {
        let features: Vec<f32> = (0..rows * dim).map(|_| normal.sample(&mut rng)).collect();
        let targets = features
            .chunks(dim)
            .map(|row| row.iter().zip(&hidden).map(|(x, w)| x * w).sum::<f32>() + 0.5)
            .collect();
        LinearBatch::new(dim, features, targets)
    };

    let holdout = batch(64);
    let replicas = vec![LinearReplica::new(0, dim), LinearReplica::new(1, dim)];
    let initial = replicas[0].loss(&holdout);

    let mut group: AsyncGraphGroup<LinearReplica> =
        AsyncGraphGroup::new(config, replicas, None).unwrap();
    for _ in 0..400 {
        group.update(batch(16)).unwrap();
    }

    let stats = group.finish().unwrap();
    assert_eq!(stats.batches, 400);
    assert_eq!(stats.steps(), 400);
    assert_eq!(stats.pushes(), 400);
    assert_eq!(stats.versions, [400, 400]);
    assert_eq!(stats.workers.len(), 2);
    for worker in &stats.workers {
        assert_eq!(worker.dense_fetches, 1);
        assert!(worker.sparse_fetches > 0);
        assert_eq!(worker.dense_fetches + worker.sparse_fetches, worker.steps);
    }
    assert_eq!(group.collect_stats().params, dim + 1);

    let mut trained = LinearReplica::new(0, dim);
    trained
        .params_mut()
        .copy_from_slice(&group.store().snapshot());
    assert!(trained.loss(&holdout) < initial / 10.);

    group.save(true).unwrap();
    let saved = Checkpointer::new(&model, false).load().unwrap().unwrap();
    assert_eq!(saved.len(), dim + 1);

    let mut shadow = group.store().snapshot();
    group
        .store()
        .moving_average()
        .unwrap()
        .pull(group.store().layout(), &mut shadow);
    assert_eq!(saved, shadow);

    fs::remove_dir_all(model.parent().unwrap()).unwrap();
}

#[test]
fn compressed_windows_fetch_dense_once_then_sparse() {
    let mut config = config(1, 3);
    config.drop_rate = 0.5;

    let mut group =
        ScriptedGroup::new(config, vec![ScriptedReplica::new(0, &[0.; 4])], None).unwrap();
    for _ in 0..9 {
        group.update(ScriptedBatch::new(&[1., -2., 0.5, 4.], 1)).unwrap();
    }
    let stats = group.finish().unwrap();

    let worker = &stats.workers[0];
    assert_eq!(worker.steps, 9);
    assert_eq!(worker.pushes, 3);
    assert_eq!(worker.dense_fetches, 1);
    assert_eq!(worker.sparse_fetches, 9 / 3 - 1);
    assert_eq!(worker.clamped_shards, 0);
    assert_eq!(stats.versions, [3]);
}

#[test]
fn stale_workers_clamp_to_the_retained_history() {
    let mut config = config(2, 1);
    config.drop_rate = 0.5;
    config.history = NonZeroUsize::new(2);

    let replicas = vec![
        ScriptedReplica::new(0, &[0.; 4]),
        ScriptedReplica::new(1, &[0.; 4]),
    ];
    let mut group = ScriptedGroup::new(config, replicas, None).unwrap();
    let grad = [1., -1., 2., -2.];

    // one worker holds version 0 while the other pushes three versions
    let held = Arc::new(Barrier::new(2));
    group.update(ScriptedBatch::gated(&grad, &held, 2)).unwrap();
    held.wait();

    for _ in 0..3 {
        group.update(ScriptedBatch::new(&grad, 1)).unwrap();
    }
    wait_for_versions(&group, 3);
    held.wait();
    wait_for_versions(&group, 4);

    // the worker holding version 0 and the one holding version 2 both fall behind
    let busy = Arc::new(Barrier::new(2));
    group.update(ScriptedBatch::gated(&grad, &busy, 1)).unwrap();
    group.update(ScriptedBatch::new(&grad, 1)).unwrap();
    busy.wait();

    let stats = group.finish().unwrap();
    assert_eq!(stats.batches, 6);
    assert_eq!(stats.clamped_shards(), 4);
    for worker in &stats.workers {
        assert_eq!(worker.clamped_shards, 2);
        assert_eq!(worker.dense_fetches, 1);
    }
}

#[test]
fn save_then_load_restores_parameters_and_progress() {
    let model = scratch_model("round-trip");

    let mut config = config(2, 1);
    config.model = model.clone();

    let scheduler = || BasicScheduler::<ScriptedReplica>::new(SchedulerSpec::default());
    let replicas = || {
        vec![
            ScriptedReplica::new(0, &[1., 2., 3.]),
            ScriptedReplica::new(1, &[1., 2., 3.]),
        ]
    };

    let mut group = AsyncGraphGroup::new(config.clone(), replicas(), Some(scheduler())).unwrap();
    assert!(!group.load().unwrap());
    for _ in 0..4 {
        group.update(ScriptedBatch::new(&[0.25, 0.5, -1.], 1)).unwrap();
    }
    group.finish().unwrap();
    group.save(true).unwrap();

    let trained = group.store().snapshot();
    assert_eq!(trained, [0., 0., 7.]);

    let restored = AsyncGraphGroup::new(config.clone(), replicas(), Some(scheduler())).unwrap();
    assert!(restored.load().unwrap());
    assert_eq!(restored.store().snapshot(), trained);
    assert_eq!(restored.scheduler().unwrap().read().state().batches, 4);

    config.no_reload = true;
    let fresh = AsyncGraphGroup::new(config, replicas(), Some(scheduler())).unwrap();
    assert!(!fresh.load().unwrap());
    assert_eq!(fresh.store().snapshot(), [1., 2., 3.]);

    fresh.update(ScriptedBatch::new(&[0.; 3], 1)).unwrap();
    drop(fresh);

    fs::remove_dir_all(model.parent().unwrap()).unwrap();
}

#[test]
fn scheduled_saves_write_complete_versions() {
    let model = scratch_model("scheduled");

    let mut config = config(1, 1);
    config.model = model.clone();

    let scheduler = BasicScheduler::new(SchedulerSpec {
        save_freq: NonZeroUsize::new(2),
        ..Default::default()
    });

    let mut group =
        AsyncGraphGroup::new(config, vec![ScriptedReplica::new(0, &[0., 1.])], Some(scheduler))
            .unwrap();
    for _ in 0..5 {
        group.update(ScriptedBatch::new(&[1., -1.], 1)).unwrap();
    }
    group.finish().unwrap();

    let load = |path: PathBuf| Checkpointer::new(path, false).load().unwrap().unwrap();
    assert_eq!(load(checkpoint::iteration_path(&model, 2)), [-2., 3.]);
    assert_eq!(load(checkpoint::iteration_path(&model, 4)), [-4., 5.]);
    assert_eq!(load(model.clone()), [-4., 5.]);
    assert!(!checkpoint::iteration_path(&model, 5).exists());
    assert!(checkpoint::progress_path(&model).exists());

    fs::remove_dir_all(model.parent().unwrap()).unwrap();
}

#[test]
fn scheduler_is_built_from_the_configuration() {
    let mut config = config(1, 1);
    let group = ScriptedGroup::from_config(config.clone(), vec![ScriptedReplica::new(0, &[0.])])
        .unwrap();
    assert!(group.scheduler().is_none());
    drop(group);

    config.scheduler = Some(SchedulerSpec::default());
    let mut group =
        ScriptedGroup::from_config(config, vec![ScriptedReplica::new(0, &[0.])]).unwrap();
    for _ in 0..3 {
        group.update(ScriptedBatch::new(&[1.], 2)).unwrap();
    }
    group.finish().unwrap();

    let scheduler = group.scheduler().unwrap().read();
    assert_eq!(scheduler.state().batches, 3);
    assert_eq!(scheduler.state().words, 6);
}

#[test]
fn load_after_training_started_is_rejected() {
    let mut group = ScriptedGroup::new(config(1, 1), vec![ScriptedReplica::new(0, &[0.])], None)
        .unwrap();

    group.update(ScriptedBatch::new(&[1.], 1)).unwrap();
    assert!(matches!(group.load(), Err(TrainErr::AlreadyStarted)));

    group.finish().unwrap();
    assert!(matches!(
        group.update(ScriptedBatch::new(&[1.], 1)),
        Err(TrainErr::Finished)
    ));
    assert!(matches!(group.finish(), Err(TrainErr::Finished)));
}

#[test]
fn mismatched_replicas_are_rejected() {
    let res = ScriptedGroup::new(config(2, 1), vec![ScriptedReplica::new(0, &[0.])], None);
    assert!(matches!(
        res,
        Err(TrainErr::ReplicaCount {
            expected: 2,
            got: 1
        })
    ));

    let replicas = vec![
        ScriptedReplica::new(0, &[0., 0.]),
        ScriptedReplica::new(1, &[0.]),
    ];
    let res = ScriptedGroup::new(config(2, 1), replicas, None);
    assert!(matches!(
        res,
        Err(TrainErr::ReplicaSize {
            replica: 1,
            got: 1,
            expected: 2
        })
    ));

    let mut invalid = config(1, 1);
    invalid.drop_rate = 2.;
    let res = ScriptedGroup::new(invalid, vec![ScriptedReplica::new(0, &[0.])], None);
    assert!(matches!(res, Err(TrainErr::InvalidConfig(_))));
}

#[test]
fn worker_panic_poisons_the_group() {
    let mut group = ScriptedGroup::new(config(1, 1), vec![ScriptedReplica::new(0, &[0.])], None)
        .unwrap();

    let mut explode = ScriptedBatch::new(&[1.], 1);
    explode.explode = true;
    group.update(explode).unwrap();

    let poisoned = (0..100_000)
        .map(|_| group.update(ScriptedBatch::new(&[1.], 1)))
        .find_map(Result::err);
    assert!(matches!(poisoned, Some(TrainErr::PoolPoisoned)));

    let res = panic::catch_unwind(AssertUnwindSafe(|| group.finish()));
    assert!(res.is_err());
}
