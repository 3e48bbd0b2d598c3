use log::info;
use parking_lot::Mutex;

/// Hands out replicas to worker threads, each replica at most once.
///
/// The bind mutex is never held while acquiring any other lock.
#[derive(Debug)]
pub struct ReplicaBinder {
    next: Mutex<usize>,
    replicas: usize,
}

impl ReplicaBinder {
    /// Creates a new `ReplicaBinder`.
    ///
    /// # Arguments
    /// * `replicas` - The amount of replicas to hand out.
    pub fn new(replicas: usize) -> Self {
        Self {
            next: Mutex::new(0),
            replicas,
        }
    }

    /// Claims the next unassigned replica.
    ///
    /// # Arguments
    /// * `worker` - The id of the claiming worker thread, only used for logging.
    ///
    /// # Returns
    /// The index of the replica, or `None` once every replica has been claimed.
    pub fn bind(&self, worker: usize) -> Option<usize> {
        let mut next = self.next.lock();
        if *next == self.replicas {
            return None;
        }

        let replica = *next;
        *next += 1;
        info!(worker = worker, replica = replica; "worker bound to replica");

        Some(replica)
    }

    /// The amount of replicas claimed so far.
    pub fn bound(&self) -> usize {
        *self.next.lock()
    }
}
