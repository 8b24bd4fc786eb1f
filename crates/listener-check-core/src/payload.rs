//! Unique test payloads.

use chrono::Utc;
use uuid::Uuid;

/// Build a payload no earlier run can have produced.
///
/// The timestamp keeps the payload readable when it shows up in a console
/// consumer; the run id keeps two runs in the same second apart.
pub fn unique_payload(prefix: &str) -> String {
    let run_id = Uuid::new_v4().simple().to_string();
    format!("{} / {} / {}", prefix, Utc::now().to_rfc2822(), &run_id[..12])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_starts_with_prefix() {
        let payload = unique_payload("foo");
        assert!(payload.starts_with("foo / "));
        assert_eq!(payload.split(" / ").count(), 3);
    }

    #[test]
    fn test_back_to_back_payloads_differ() {
        let a = unique_payload("foo");
        let b = unique_payload("foo");
        assert_ne!(a, b);
    }
}
