use std::{
    mem,
    num::NonZeroUsize,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use log::{info, warn};
use parking_lot::{Mutex, RwLock};

use super::{
    ReplicaBinder, WorkerPool,
    worker::{Shared, WorkerLoop},
};
use crate::{
    checkpoint::Checkpointer,
    config::GroupConfig,
    error::{Result, TrainErr},
    metrics::GroupStats,
    model::Replica,
    optimization::{Optimizer, ShardOptimizer},
    scheduling::{BasicScheduler, Scheduler},
    storage::ParameterStore,
};

/// Trains a set of replicas asynchronously against a sharded parameter store.
///
/// Each device gets a worker thread, a replica and a shard of the parameters. Batches
/// submitted through `update` are picked up by whichever worker is free.
pub struct AsyncGraphGroup<R, S = BasicScheduler<R>, O = ShardOptimizer>
where
    R: Replica + Send + 'static,
    R::Batch: Send + 'static,
    S: Scheduler<R> + Send + Sync + 'static,
    O: Optimizer + Send + 'static,
{
    shared: Arc<Shared<R, S, O>>,
    pool: Option<WorkerPool<R::Batch>>,
    submitted: AtomicUsize,
}

impl<R, S> AsyncGraphGroup<R, S, ShardOptimizer>
where
    R: Replica + Send + 'static,
    R::Batch: Send + 'static,
    S: Scheduler<R> + Send + Sync + 'static,
{
    /// Creates a new group with the optimizer described by the configuration.
    ///
    /// # Arguments
    /// * `config` - The group's configuration.
    /// * `replicas` - One replica per device, in device order.
    /// * `scheduler` - An optional scheduler shared by every worker.
    ///
    /// # Returns
    /// An error if the configuration is invalid or doesn't match the replicas.
    pub fn new(config: GroupConfig, replicas: Vec<R>, scheduler: Option<S>) -> Result<Self> {
        let spec = config.optimizer;
        Self::with_optimizer(config, replicas, scheduler, move |len| {
            ShardOptimizer::from_spec(&spec, len)
        })
    }
}

impl<R> AsyncGraphGroup<R>
where
    R: Replica + Send + 'static,
    R::Batch: Send + 'static,
{
    /// Creates a new group whose `BasicScheduler`, if any, is described by the
    /// configuration's `scheduler` entry.
    ///
    /// # Arguments
    /// * `config` - The group's configuration.
    /// * `replicas` - One replica per device, in device order.
    pub fn from_config(config: GroupConfig, replicas: Vec<R>) -> Result<Self> {
        let scheduler = config.scheduler.map(BasicScheduler::new);
        Self::new(config, replicas, scheduler)
    }
}

impl<R, S, O> AsyncGraphGroup<R, S, O>
where
    R: Replica + Send + 'static,
    R::Batch: Send + 'static,
    S: Scheduler<R> + Send + Sync + 'static,
    O: Optimizer + Send + 'static,
{
    /// Creates a new group with a custom optimizer per shard.
    ///
    /// The parameters of the first replica become the initial parameters of the store.
    ///
    /// # Arguments
    /// * `config` - The group's configuration.
    /// * `replicas` - One replica per device, in device order.
    /// * `scheduler` - An optional scheduler shared by every worker.
    /// * `optimizer_factory` - An `Optimizer` factory closure, given each shard's length.
    pub fn with_optimizer<OF>(
        config: GroupConfig,
        replicas: Vec<R>,
        scheduler: Option<S>,
        optimizer_factory: OF,
    ) -> Result<Self>
    where
        OF: FnMut(usize) -> O,
    {
        config.validate()?;

        if replicas.len() != config.devices.len() {
            return Err(TrainErr::ReplicaCount {
                expected: config.devices.len(),
                got: replicas.len(),
            });
        }

        let Some(first) = replicas.first() else {
            return Err(TrainErr::InvalidConfig("at least one replica is required".into()));
        };
        let len = first.params().len();

        for (i, replica) in replicas.iter().enumerate() {
            for got in [replica.params().len(), replica.grads().len()] {
                if got != len {
                    return Err(TrainErr::ReplicaSize {
                        replica: i,
                        got,
                        expected: len,
                    });
                }
            }

            if replica.device() != config.devices[i] {
                warn!(
                    replica = i, device = replica.device(), configured = config.devices[i];
                    "replica lives on a different device than configured"
                );
            }
        }

        let devices = NonZeroUsize::new(config.devices.len())
            .ok_or_else(|| TrainErr::InvalidConfig("at least one device is required".into()))?;

        let mut store = ParameterStore::new(
            first.params(),
            devices,
            config.history(),
            optimizer_factory,
        );
        if config.scale_lr {
            store = store.with_lr_scaling(config.average_batch_words);
        }
        if let Some(spec) = config.moving_average {
            store = store.with_moving_average(spec.decay);
        }

        info!(
            devices = devices.get(), params = len, history = store.history().get(),
            tau = config.tau.get(), drop_rate = config.drop_rate;
            "starting async graph group"
        );

        let shared = Arc::new(Shared {
            checkpointer: Checkpointer::new(config.model.clone(), config.overwrite),
            binder: ReplicaBinder::new(replicas.len()),
            replicas: replicas.into_iter().map(Mutex::new).collect(),
            scheduler: scheduler.map(RwLock::new),
            batches: AtomicUsize::new(0),
            finished: Mutex::new(Vec::with_capacity(devices.get())),
            store,
            config,
        });

        let pool = {
            let shared = Arc::clone(&shared);
            WorkerPool::new(devices, shared.config.queue_capacity(), move |id| {
                WorkerLoop::new(id, Arc::clone(&shared))
            })?
        };

        Ok(Self {
            shared,
            pool: Some(pool),
            submitted: AtomicUsize::new(0),
        })
    }

    /// Submits a batch, blocking while the queue is full.
    ///
    /// # Returns
    /// `PoolPoisoned` if a worker failed, `Finished` after `finish`.
    pub fn update(&self, batch: R::Batch) -> Result<()> {
        let pool = self.pool.as_ref().ok_or(TrainErr::Finished)?;
        self.submitted.fetch_add(1, Ordering::Relaxed);
        pool.submit(batch)
    }

    /// Restores the parameters and scheduler progress from the model checkpoint.
    ///
    /// # Returns
    /// Whether a checkpoint was loaded, or `AlreadyStarted` if a batch was already submitted.
    pub fn load(&self) -> Result<bool> {
        let shared = &self.shared;

        if shared.config.no_reload {
            info!("reloading disabled, starting from the initial parameters");
            return Ok(false);
        }

        if self.submitted.load(Ordering::Relaxed) > 0 || shared.store.started() {
            return Err(TrainErr::AlreadyStarted);
        }

        let Some(params) = shared.checkpointer.load()? else {
            info!("no checkpoint at {}, starting from scratch", shared.config.model.display());
            return Ok(false);
        };

        if params.len() != shared.store.len() {
            return Err(TrainErr::CheckpointSize {
                got: params.len(),
                expected: shared.store.len(),
            });
        }

        shared.store.load(&params);

        if let Some(scheduler) = &shared.scheduler {
            scheduler.write().load(shared.checkpointer.model())?;
        }

        Ok(true)
    }

    /// Saves the current parameters, the shadow ones when moving averages are on.
    ///
    /// # Arguments
    /// * `last` - Whether this is the save at the end of training, which skips the
    ///   iteration numbered copy.
    pub fn save(&self, last: bool) -> Result<()> {
        let batches = self
            .shared
            .scheduler
            .as_ref()
            .map(|scheduler| scheduler.read().number_of_batches());

        self.shared.save(batches, last)
    }

    /// The statistics of the first replica.
    pub fn collect_stats(&self) -> R::Stats {
        self.shared.replicas[0].lock().collect_stats()
    }

    pub fn config(&self) -> &GroupConfig {
        &self.shared.config
    }

    pub fn store(&self) -> &ParameterStore<O> {
        &self.shared.store
    }

    pub fn scheduler(&self) -> Option<&RwLock<S>> {
        self.shared.scheduler.as_ref()
    }

    /// Batches fully processed so far.
    pub fn batches(&self) -> usize {
        self.shared.batches.load(Ordering::Acquire)
    }

    /// Drains the pending batches and joins every worker.
    ///
    /// The store stays readable afterwards, so the final parameters can still be saved.
    ///
    /// # Returns
    /// The metrics of the run, the first error a worker returned, or `Finished` if the
    /// group was already finished.
    ///
    /// # Panics
    /// Resumes the first panic raised by a worker.
    pub fn finish(&mut self) -> Result<GroupStats> {
        let pool = self.pool.take().ok_or(TrainErr::Finished)?;
        pool.join()?;

        let shared = &self.shared;
        let mut workers = mem::take(&mut *shared.finished.lock());
        workers.sort_by_key(|metrics| metrics.replica);

        let stats = GroupStats {
            batches: shared.batches.load(Ordering::Acquire),
            versions: shared.store.versions(),
            workers,
        };

        info!(batches = stats.batches, pushes = stats.pushes(); "async graph group finished");
        Ok(stats)
    }
}
