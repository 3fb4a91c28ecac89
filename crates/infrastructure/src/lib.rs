//! Infrastructure adapters for application ports.

#![forbid(unsafe_code)]

mod console_push_notification_sink;
mod http_device_token_repository;
mod in_memory_lock_backend;
mod in_memory_work_storage_proxy;
mod redis_lock_backend;
mod redis_token_batch_job_registry;
mod redis_work_storage_proxy;

pub use console_push_notification_sink::ConsolePushNotificationSink;
pub use http_device_token_repository::HttpDeviceTokenRepository;
pub use in_memory_lock_backend::InMemoryLockBackend;
pub use in_memory_work_storage_proxy::InMemoryWorkStorageProxy;
pub use redis_lock_backend::RedisLockBackend;
pub use redis_token_batch_job_registry::RedisTokenBatchJobRegistry;
pub use redis_work_storage_proxy::RedisWorkStorageProxy;
