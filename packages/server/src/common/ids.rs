//! Identifier generation.
//!
//! Ids embed the creation time in epoch milliseconds followed by a random
//! suffix, so lexicographic order within one millisecond is stable and ids
//! remain unique across processes.

use chrono::Utc;
use uuid::Uuid;

fn timestamped(prefix: &str) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}_{}_{}", prefix, Utc::now().timestamp_millis(), &suffix[..8])
}

/// New job id, e.g. `job_1717243200123_9f8a7b6c`.
pub fn job_id() -> String {
    timestamped("job")
}

/// New internal instance id, e.g. `inst_1717243200123_0c1d2e3f`.
pub fn instance_id() -> String {
    timestamped("inst")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_have_expected_shape() {
        let id = job_id();
        assert!(id.starts_with("job_"));
        let parts: Vec<&str> = id.split('_').collect();
        assert_eq!(parts.len(), 3);
        assert!(parts[1].parse::<i64>().is_ok());
        assert_eq!(parts[2].len(), 8);
    }

    #[test]
    fn test_ids_are_unique() {
        let a = instance_id();
        let b = instance_id();
        assert_ne!(a, b);
    }
}
