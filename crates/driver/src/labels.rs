//! Container and volume label conventions.
//!
//! Strict orphan-container GC depends on these names matching exactly —
//! see `bay_driver::DriverError` callers in the orchestrator crate.

use std::collections::HashMap;

pub const LABEL_SESSION_ID: &str = "bay.session_id";
pub const LABEL_SANDBOX_ID: &str = "bay.sandbox_id";
pub const LABEL_CARGO_ID: &str = "bay.cargo_id";
pub const LABEL_INSTANCE_ID: &str = "bay.instance_id";
pub const LABEL_MANAGED: &str = "bay.managed";
pub const LABEL_OWNER: &str = "bay.owner";

/// Container name prefix required by strict orphan-container GC.
pub const SESSION_CONTAINER_PREFIX: &str = "bay-session-";

/// All labels a sandbox-backing container must carry, exactly.
pub const REQUIRED_CONTAINER_LABELS: &[&str] = &[
    LABEL_SESSION_ID,
    LABEL_SANDBOX_ID,
    LABEL_CARGO_ID,
    LABEL_INSTANCE_ID,
    LABEL_MANAGED,
];

pub fn session_container_name(session_id: &str) -> String {
    format!("{SESSION_CONTAINER_PREFIX}{session_id}")
}

pub fn cargo_volume_name(cargo_id: &str) -> String {
    format!("bay-cargo-{cargo_id}")
}

pub fn container_labels(
    session_id: &str,
    sandbox_id: &str,
    cargo_id: &str,
    instance_id: &str,
) -> HashMap<String, String> {
    let mut labels = HashMap::with_capacity(5);
    labels.insert(LABEL_SESSION_ID.to_string(), session_id.to_string());
    labels.insert(LABEL_SANDBOX_ID.to_string(), sandbox_id.to_string());
    labels.insert(LABEL_CARGO_ID.to_string(), cargo_id.to_string());
    labels.insert(LABEL_INSTANCE_ID.to_string(), instance_id.to_string());
    labels.insert(LABEL_MANAGED.to_string(), "true".to_string());
    labels
}

pub fn volume_labels(owner: &str, cargo_id: &str) -> HashMap<String, String> {
    let mut labels = HashMap::with_capacity(3);
    labels.insert(LABEL_OWNER.to_string(), owner.to_string());
    labels.insert(LABEL_CARGO_ID.to_string(), cargo_id.to_string());
    labels.insert(LABEL_MANAGED.to_string(), "true".to_string());
    labels
}
