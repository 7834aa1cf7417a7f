/// 检查点与回滚

pub mod coordinator;
pub mod probe;
pub mod store;

pub use coordinator::{CheckpointCoordinator, NewCheckpoint, SnapshotRestorer};
pub use probe::{ConnectivityProbe, ContainerHealthProbe, HealthProbe};
pub use store::CheckpointStore;
