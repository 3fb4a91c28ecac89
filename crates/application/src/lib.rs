//! Application services and ports.

#![forbid(unsafe_code)]

mod distributed_lock;
mod token_batch_ports;
mod token_batch_service;
mod work_distributor;
mod work_ports;

#[cfg(test)]
mod test_support;

pub use distributed_lock::{DistributedLock, LockFactory, LockOptions};
pub use token_batch_ports::{DeviceTokenRepository, PushNotificationSink, TokenBatchJobRegistry};
pub use token_batch_service::{ConsumeSummary, TokenBatchDistributor, TokenBatchOptions};
pub use work_distributor::{AssignmentOutcome, WorkDistributor};
pub use work_ports::{InFlightAssignment, LockBackend, WorkStorageProxy, WorkloadModifier};
