//! Domain entities and invariants.

#![forbid(unsafe_code)]

mod assignment;
mod campaign;
mod workload;

pub use assignment::Assignment;
pub use campaign::{MessageInput, PushNotiMessage, TokenBatchJob};
pub use workload::Workload;
