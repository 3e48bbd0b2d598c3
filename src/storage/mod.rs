mod fetch;
mod layout;
mod shard;
mod store;
mod versions;

pub use fetch::{DeltaFetch, FetchReport, FetchState};
pub use layout::ShardLayout;
pub use shard::VersionedShard;
pub use store::ParameterStore;
pub use versions::VersionTable;
