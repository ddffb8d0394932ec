// ── Atoms: Sortable IDs (§4.1) ───────────────────────────────────────────
// 20-character lexicographically ordered tokens generated from
// (time, process, counter): sort order = creation order. Plain ASCII
// lowercase-alphanumeric so IDs are safe as autonomous-task IDs (§3) and
// as primary keys without escaping.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

const ALPHABET: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

static COUNTER: AtomicU32 = AtomicU32::new(0);

fn encode_base36(mut value: u128, width: usize) -> String {
    let mut buf = vec![b'0'; width];
    for slot in buf.iter_mut().rev() {
        *slot = ALPHABET[(value % 36) as usize];
        value /= 36;
    }
    String::from_utf8(buf).expect("base36 alphabet is ASCII")
}

/// Generate a new 20-character sortable ID.
///
/// Layout: 9 chars of millisecond timestamp, 3 chars of process id, 8 chars
/// of a monotonic per-process counter (wraps at 36^8, which is large enough
/// that wraparound inside one process lifetime is not a practical concern).
pub fn new_sortable_id() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let pid = std::process::id() as u128 % 36u128.pow(3);
    let seq = COUNTER.fetch_add(1, Ordering::Relaxed) as u128 % 36u128.pow(8);

    let mut id = encode_base36(millis, 9);
    id.push_str(&encode_base36(pid, 3));
    id.push_str(&encode_base36(seq, 8));
    id
}

/// True iff `id` matches the autonomous-task ID shape: at most 20 lowercase
/// alphanumeric-dash characters (§3).
pub fn is_valid_task_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= crate::atoms::constants::AUTONOMOUS_TASK_ID_MAX_LEN
        && id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_twenty_chars_and_sorted_by_creation() {
        let a = new_sortable_id();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = new_sortable_id();
        assert_eq!(a.len(), 20);
        assert_eq!(b.len(), 20);
        assert!(a < b, "later id {b:?} should sort after earlier id {a:?}");
    }

    #[test]
    fn ids_are_unique_within_same_millisecond() {
        let ids: Vec<String> = (0..50).map(|_| new_sortable_id()).collect();
        let unique: std::collections::HashSet<_> = ids.iter().collect();
        assert_eq!(unique.len(), ids.len());
    }

    #[test]
    fn task_id_validation() {
        assert!(is_valid_task_id("daily-refill-9"));
        assert!(!is_valid_task_id(""));
        assert!(!is_valid_task_id("Has-Uppercase"));
        assert!(!is_valid_task_id(&"a".repeat(21)));
    }
}
