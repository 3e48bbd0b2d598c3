mod accumulator;
mod binder;
mod group;
mod pool;
mod worker;

pub use accumulator::GradientAccumulator;
pub use binder::ReplicaBinder;
pub use group::AsyncGraphGroup;
pub use pool::{TaskHandler, WorkerPool};
