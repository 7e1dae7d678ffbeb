pub mod redis_keys;
pub mod types;

pub use redis_keys::{
    heartbeat_key, job_key, keys, lock_key, queue_key, reload_status_key, state_key, status_key,
    ttl, validate_job_id, validate_resource_id,
};
pub use types::*;
