use rand::RngCore;

/// Allocate an opaque identifier: `<prefix>_<12 lowercase hex chars>`.
///
/// The hex tail comes from the thread-local CSPRNG, so ids are safe to
/// allocate from any task without coordination.
pub fn generate_id(prefix: &str) -> String {
    let mut bytes = [0u8; 6];
    rand::rng().fill_bytes(&mut bytes);
    let mut out = String::with_capacity(prefix.len() + 13);
    out.push_str(prefix);
    out.push('_');
    for b in bytes {
        use std::fmt::Write;
        let _ = write!(out, "{b:02x}");
    }
    out
}

pub const PROJECT_PREFIX: &str = "proj";
pub const SESSION_PREFIX: &str = "sess";
pub const QUEUE_PREFIX: &str = "que";
pub const TASK_PREFIX: &str = "task";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shape_is_prefix_underscore_12_hex() {
        let id = generate_id(TASK_PREFIX);
        let (prefix, tail) = id.split_once('_').unwrap();
        assert_eq!(prefix, "task");
        assert_eq!(tail.len(), 12);
        assert!(tail.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn ids_are_distinct() {
        let a = generate_id(QUEUE_PREFIX);
        let b = generate_id(QUEUE_PREFIX);
        assert_ne!(a, b);
    }
}
