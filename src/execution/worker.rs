//! The per thread training loop.
//!
//! Lock order, outermost first:
//! - the bind mutex is only ever held alone;
//! - replica, then shard, then shadow (fetch and push);
//! - replica, then scheduler, then shadow (validate);
//! - replica, then shard, then shadow, then scheduler (save).
//!
//! Shard mutexes never nest and the scheduler lock is never held while waiting on a
//! shard mutex.

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Instant,
};

use log::{debug, info};
use parking_lot::{Mutex, RwLock, RwLockUpgradableReadGuard, RwLockWriteGuard};

use super::{GradientAccumulator, ReplicaBinder, TaskHandler};
use crate::{
    checkpoint::Checkpointer,
    compression::{self, GradientSparsifier, SparseDelta},
    config::GroupConfig,
    error::Result,
    metrics::WorkerMetrics,
    model::{Batch, Replica},
    optimization::Optimizer,
    scheduling::Scheduler,
    storage::{FetchState, ParameterStore},
};

/// The state every worker thread of a group shares.
pub(crate) struct Shared<R: Replica, S, O: Optimizer> {
    pub(crate) config: GroupConfig,
    pub(crate) store: ParameterStore<O>,
    pub(crate) replicas: Box<[Mutex<R>]>,
    pub(crate) binder: ReplicaBinder,
    pub(crate) scheduler: Option<RwLock<S>>,
    pub(crate) checkpointer: Checkpointer,
    /// Batches processed by the whole group.
    pub(crate) batches: AtomicUsize,
    pub(crate) finished: Mutex<Vec<WorkerMetrics>>,
}

impl<R, S, O> Shared<R, S, O>
where
    R: Replica,
    S: Scheduler<R>,
    O: Optimizer + Send,
{
    /// Checkpoints the latest parameters of the store, the shadow ones when moving
    /// averages are on, along with the scheduler's progress.
    ///
    /// Takes the shard and shadow locks, so it must not be called with the scheduler
    /// lock held.
    pub(crate) fn save(&self, batches: Option<usize>, last: bool) -> Result<()> {
        let mut params = self.store.snapshot();
        if let Some(average) = self.store.moving_average() {
            average.pull(self.store.layout(), &mut params);
        }

        self.checkpointer.save(&params, batches, last)?;

        if let Some(scheduler) = &self.scheduler {
            scheduler.read().save(self.checkpointer.model())?;
        }

        Ok(())
    }
}

/// Runs the training steps of a single pool thread.
///
/// The loop starts unbound and claims a replica on its first batch, from then on every
/// batch goes through fetch, compute and a flush every `tau` steps.
pub(crate) struct WorkerLoop<R: Replica, S, O: Optimizer> {
    id: usize,
    shared: Arc<Shared<R, S, O>>,
    bound: Option<Bound>,
}

/// The context of a worker bound to a replica.
struct Bound {
    replica: usize,
    t: usize,
    fetch_state: FetchState,
    accumulator: GradientAccumulator,
    push: Option<(GradientSparsifier, SparseDelta)>,
    backup: Vec<f32>,
    metrics: WorkerMetrics,
}

impl<R: Replica, S, O: Optimizer> WorkerLoop<R, S, O> {
    pub(crate) fn new(id: usize, shared: Arc<Shared<R, S, O>>) -> Self {
        Self {
            id,
            shared,
            bound: None,
        }
    }
}

impl Bound {
    fn bind<R: Replica, S, O: Optimizer + Send>(shared: &Shared<R, S, O>, worker: usize) -> Self {
        let Some(replica) = shared.binder.bind(worker) else {
            panic!("worker {worker} found every replica already bound");
        };

        let config = &shared.config;
        let store = &shared.store;
        let len = store.len();

        let (fetch_state, push) = if config.compresses() {
            let fetch_state = FetchState::sparse(store.layout(), config.drop_rate);

            let kernel = compression::build_kernel(config.drop_kernel, len);
            let sparsifier = GradientSparsifier::new(config.drop_rate, kernel);
            let delta = sparsifier.allocate(len);

            (fetch_state, Some((sparsifier, delta)))
        } else {
            (FetchState::dense(store.layout().shard_count()), None)
        };

        let device = shared.replicas[replica].lock().device();

        Self {
            replica,
            t: 0,
            fetch_state,
            accumulator: GradientAccumulator::new(len),
            push,
            backup: Vec::new(),
            metrics: WorkerMetrics::new(replica, device),
        }
    }

    fn step<R, S, O>(&mut self, shared: &Shared<R, S, O>, batch: &R::Batch) -> Result<()>
    where
        R: Replica,
        S: Scheduler<R>,
        O: Optimizer + Send,
    {
        let tau = shared.config.tau.get();
        let mut replica = shared.replicas[self.replica].lock();

        if self.t % tau == 0 {
            self.fetch(&shared.store, replica.params_mut());
        }

        let start = Instant::now();
        replica.build(batch);
        let loss = replica.forward();
        replica.backward();
        self.metrics.bump_step(batch.words(), start.elapsed());

        self.accumulator.add(replica.grads(), batch.words());
        self.t += 1;
        // the moving average counts the batches completed before this one
        let before = shared.batches.fetch_add(1, Ordering::AcqRel);

        if self.t % tau == 0 {
            self.flush(&shared.store, before);
        }

        match &shared.scheduler {
            Some(scheduler) => self.notify(shared, scheduler, &mut *replica, loss, batch),
            None => Ok(()),
        }
    }

    fn fetch<O: Optimizer + Send>(&mut self, store: &ParameterStore<O>, params: &mut [f32]) {
        if self.fetch_state.is_sparse() && self.t > 0 {
            let report = store.fetch_sparse(params, &mut self.fetch_state);
            self.metrics.bump_sparse_fetch(report.clamped);
            debug!(
                replica = self.replica, refreshed = report.refreshed, clamped = report.clamped;
                "sparse fetch"
            );
        } else {
            store.fetch_dense(params, self.fetch_state.versions_mut());
            self.metrics.bump_dense_fetch();
            debug!(replica = self.replica; "dense fetch");
        }
    }

    fn flush<O: Optimizer + Send>(&mut self, store: &ParameterStore<O>, batches: usize) {
        let words = self.accumulator.words();

        match &mut self.push {
            Some((sparsifier, delta)) => {
                sparsifier.sparsify(self.accumulator.grads(), delta);
                store.push_sparse(delta, words, batches);
            }
            None => store.push(self.accumulator.grads(), words, batches),
        }

        debug!(
            replica = self.replica, steps = self.accumulator.steps(), words = words;
            "flushed accumulated gradient"
        );

        self.accumulator.reset();
        self.metrics.bump_push();
    }

    /// Reports the step to the scheduler and runs the saves and validations it asks for.
    ///
    /// Validation sees the shadow parameters when moving averages are on. Checkpoints
    /// are written from the store once the scheduler lock is released.
    fn notify<R, S, O>(
        &mut self,
        shared: &Shared<R, S, O>,
        scheduler: &RwLock<S>,
        replica: &mut R,
        loss: f32,
        batch: &R::Batch,
    ) -> Result<()>
    where
        R: Replica,
        S: Scheduler<R>,
        O: Optimizer + Send,
    {
        let mut guard = RwLockUpgradableReadGuard::upgrade(scheduler.upgradable_read());
        guard.update(loss, batch);
        let guard = RwLockWriteGuard::downgrade_to_upgradable(guard);

        let saving = guard.saving();
        let batches = guard.number_of_batches();

        if guard.validating() {
            let mut guard = RwLockUpgradableReadGuard::upgrade(guard);
            let swapped = self.swap_in_shadow(&shared.store, replica);

            guard.validate(replica);

            if swapped {
                replica.params_mut().copy_from_slice(&self.backup);
            }
        } else {
            drop(guard);
        }

        if saving {
            shared.save(Some(batches), false)?;
        }

        Ok(())
    }

    /// Replaces the replica's parameters with the shadow ones, keeping a backup.
    ///
    /// # Returns
    /// Whether the parameters were replaced.
    fn swap_in_shadow<R: Replica, O: Optimizer + Send>(
        &mut self,
        store: &ParameterStore<O>,
        replica: &mut R,
    ) -> bool {
        let Some(average) = store.moving_average() else {
            return false;
        };

        self.backup.clear();
        self.backup.extend_from_slice(replica.params());
        average.pull(store.layout(), replica.params_mut());
        true
    }
}

impl<R, S, O> TaskHandler<R::Batch> for WorkerLoop<R, S, O>
where
    R: Replica,
    S: Scheduler<R>,
    O: Optimizer + Send,
{
    fn run(&mut self, batch: R::Batch) -> Result<()> {
        let shared: &Shared<R, S, O> = &self.shared;
        let bound = self
            .bound
            .get_or_insert_with(|| Bound::bind(shared, self.id));

        bound.step(shared, &batch)
    }

    fn terminate(self) {
        let Some(bound) = self.bound else {
            debug!(worker = self.id; "worker exiting without a replica");
            return;
        };

        info!(
            worker = self.id, replica = bound.replica, steps = bound.metrics.steps;
            "worker finished"
        );
        self.shared.finished.lock().push(bound.metrics);
    }
}
