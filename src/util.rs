use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use crate::error::VmError;

static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Generate a 16-hex-char document id.
///
/// FNV-1a over the current time, the process id and a process-wide counter,
/// so ids minted in the same millisecond still differ.
pub fn new_id() -> String {
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    let count = ID_COUNTER.fetch_add(1, Ordering::Relaxed);

    let mut hash: u64 = 0xcbf29ce484222325;
    let mut feed = |bytes: &[u8]| {
        for b in bytes {
            hash ^= *b as u64;
            hash = hash.wrapping_mul(0x100000001b3);
        }
    };
    feed(&nanos.to_le_bytes());
    feed(&std::process::id().to_le_bytes());
    feed(&count.to_le_bytes());
    format!("{hash:016x}")
}

/// Format epoch millis as `YYYY-MM-DD HH:MM:SS` (UTC).
pub fn format_timestamp(ms: u64) -> String {
    let secs = ms / 1000;
    let days = (secs / 86400) as i64;
    let time_of_day = secs % 86400;
    let hours = time_of_day / 3600;
    let minutes = (time_of_day % 3600) / 60;
    let seconds = time_of_day % 60;

    // civil_from_days (Howard Hinnant)
    let z = days + 719468;
    let era = if z >= 0 { z } else { z - 146096 } / 146097;
    let doe = (z - era * 146097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146096) / 365;
    let y = yoe as i64 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    let y = if m <= 2 { y + 1 } else { y };

    format!("{y:04}-{m:02}-{d:02} {hours:02}:{minutes:02}:{seconds:02}")
}

/// Parse a `KEY=VALUE` pair. The value may itself contain `=`.
pub fn parse_env_pair(s: &str) -> Result<(String, String), VmError> {
    match s.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(VmError::validation(format!(
            "environment entry must look like KEY=VALUE (got '{s}')"
        ))),
    }
}

/// One 1-based page of `items`. A `limit` of 0 returns everything; page 0
/// is read as page 1.
pub fn paginate<T>(items: Vec<T>, page: usize, limit: usize) -> Vec<T> {
    if limit == 0 {
        return items;
    }
    let skip = page.saturating_sub(1).saturating_mul(limit);
    items.into_iter().skip(skip).take(limit).collect()
}

/// Number of pages `total` items fill at `limit` per page.
pub fn page_count(total: usize, limit: usize) -> usize {
    if limit == 0 {
        return usize::from(total > 0);
    }
    total.div_ceil(limit)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique_and_hex() {
        let a = new_id();
        let b = new_id();
        assert_ne!(a, b);
        assert_eq!(a.len(), 16);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn format_epoch() {
        assert_eq!(format_timestamp(0), "1970-01-01 00:00:00");
    }

    #[test]
    fn format_known_instant() {
        // 2024-02-29T12:34:56Z
        assert_eq!(format_timestamp(1_709_210_096_000), "2024-02-29 12:34:56");
    }

    #[test]
    fn env_pair_keeps_equals_in_value() {
        assert_eq!(
            parse_env_pair("OPTS=a=b").unwrap(),
            ("OPTS".to_string(), "a=b".to_string())
        );
    }

    #[test]
    fn env_pair_rejects_missing_key() {
        assert!(parse_env_pair("=x").is_err());
        assert!(parse_env_pair("novalue").is_err());
    }

    #[test]
    fn pages_are_one_based() {
        let items: Vec<u32> = (1..=25).collect();
        assert_eq!(paginate(items.clone(), 1, 10), (1..=10).collect::<Vec<_>>());
        assert_eq!(paginate(items.clone(), 3, 10), (21..=25).collect::<Vec<_>>());
        assert!(paginate(items.clone(), 4, 10).is_empty());
        assert_eq!(paginate(items.clone(), 0, 10).first(), Some(&1));
        assert_eq!(paginate(items, 2, 0).len(), 25);
    }

    #[test]
    fn page_counts() {
        assert_eq!(page_count(25, 10), 3);
        assert_eq!(page_count(20, 10), 2);
        assert_eq!(page_count(0, 10), 0);
        assert_eq!(page_count(7, 0), 1);
    }
}
