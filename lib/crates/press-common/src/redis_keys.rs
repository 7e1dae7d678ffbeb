use crate::types::Priority;

/// Valkey key prefixes for agent state
pub mod keys {
    /// Per-priority job queues (lists of job ids)
    /// Format: press:queue:{high|default|low}
    pub const QUEUE: &str = "press:queue";

    /// Job payloads
    /// Format: press:job:{job_id}
    /// Value: JSON-serialized JobPayload
    pub const JOB: &str = "press:job";

    /// Bare status string used as the atomic claim/cancel cell
    /// Format: press:state:{job_id}
    pub const STATE: &str = "press:state";

    /// Full status records
    /// Format: press:status:{job_id}
    /// Value: JSON-serialized StatusRecord
    pub const STATUS: &str = "press:status";

    /// Set of job ids currently in `running`
    pub const RUNNING: &str = "press:running";

    /// Resource locks
    /// Format: press:lock:{resource_id}
    /// Value: id of the job holding the lock
    pub const LOCK: &str = "press:lock";

    /// Reload requests not yet picked up by the coordinator
    pub const RELOAD_PENDING: &str = "press:reload:pending";

    /// Reload requests delivered to the coordinator but not yet acknowledged
    pub const RELOAD_PROCESSING: &str = "press:reload:processing";

    /// Coordinator state and last cycle report
    /// Value: JSON-serialized CoordinatorReport
    pub const RELOAD_STATE: &str = "press:reload:state";

    /// Per-job reload outcome
    /// Format: press:reload:status:{job_id}
    pub const RELOAD_STATUS: &str = "press:reload:status";

    /// Liveness markers
    /// Format: press:heartbeat:{component}:{instance}
    pub const HEARTBEAT: &str = "press:heartbeat";
}

/// TTL constants
pub mod ttl {
    /// Terminal status records and payloads are kept for a week
    pub const TERMINAL_RECORD_SECS: u64 = 7 * 86400;

    /// Per-job reload outcome (24 hours)
    pub const RELOAD_STATUS_SECS: u64 = 86400;
}

pub fn queue_key(priority: Priority) -> String {
    format!("{}:{}", keys::QUEUE, priority.as_str())
}

pub fn job_key(job_id: &str) -> String {
    format!("{}:{}", keys::JOB, job_id)
}

pub fn state_key(job_id: &str) -> String {
    format!("{}:{}", keys::STATE, job_id)
}

pub fn status_key(job_id: &str) -> String {
    format!("{}:{}", keys::STATUS, job_id)
}

pub fn lock_key(resource_id: &str) -> String {
    format!("{}:{}", keys::LOCK, resource_id)
}

pub fn reload_status_key(job_id: &str) -> String {
    format!("{}:{}", keys::RELOAD_STATUS, job_id)
}

pub fn heartbeat_key(component: &str, instance: &str) -> String {
    format!("{}:{}:{}", keys::HEARTBEAT, component, instance)
}

/// Maximum length accepted for job and resource identifiers.
pub const MAX_ID_LEN: usize = 128;

/// Validate a job id before it is used to build keys.
///
/// Accepts 1..=128 characters from `[A-Za-z0-9._-]`. Rejects `:` and
/// whitespace so ids cannot escape their key namespace.
pub fn validate_job_id(job_id: &str) -> Result<(), &'static str> {
    validate_identifier(job_id, "job id")
}

/// Validate a resource id (bench or site name, e.g. `site-a.example.com`).
pub fn validate_resource_id(resource_id: &str) -> Result<(), &'static str> {
    validate_identifier(resource_id, "resource id")
}

fn validate_identifier(value: &str, _what: &'static str) -> Result<(), &'static str> {
    if value.is_empty() {
        return Err("identifier must not be empty");
    }
    if value.len() > MAX_ID_LEN {
        return Err("identifier must be at most 128 characters");
    }
    if value.starts_with('.') {
        return Err("identifier must not start with '.'");
    }
    if !value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
    {
        return Err("identifier may only contain [A-Za-z0-9._-]");
    }
    Ok(())
}
