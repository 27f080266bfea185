//! Lexicographically sortable template ids.
//!
//! Ids from one process are strictly increasing, even within the same
//! millisecond.

use chrono::{DateTime, TimeZone, Utc};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use ::ulid::{Generator, Ulid};

static GENERATOR: Lazy<Mutex<Generator>> = Lazy::new(|| Mutex::new(Generator::new()));

/// Generate a fresh, monotone id.
pub fn new_id() -> String {
    match GENERATOR.lock().generate() {
        Ok(id) => id.to_string(),
        // The random part overflowed within one millisecond.
        Err(_) => Ulid::new().to_string(),
    }
}

/// Millisecond timestamp carried by an id.
pub fn timestamp_ms(id: &str) -> Option<u64> {
    Ulid::from_string(id).ok().map(|u| u.timestamp_ms())
}

/// Creation date carried by an id.
pub fn parse_time(id: &str) -> Option<DateTime<Utc>> {
    let ms = timestamp_ms(id)?;
    Utc.timestamp_millis_opt(ms as i64).single()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_sorted_by_creation() {
        let ids: Vec<String> = (0..200).map(|_| new_id()).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
        sorted.dedup();
        assert_eq!(sorted.len(), 200);
        assert!(ids.iter().all(|id| id.len() == 26));
    }

    #[test]
    fn creation_time_is_read_back() {
        let before = Utc::now().timestamp_millis() as u64;
        let id = new_id();
        assert!(timestamp_ms(&id).unwrap() >= before);
        assert!(parse_time(&id).is_some());
        assert_eq!(parse_time("not-an-id"), None);
    }
}
