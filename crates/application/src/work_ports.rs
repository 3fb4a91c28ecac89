mod in_flight;
mod lock;
mod storage;

pub use in_flight::InFlightAssignment;
pub use lock::LockBackend;
pub use storage::{WorkStorageProxy, WorkloadModifier};
