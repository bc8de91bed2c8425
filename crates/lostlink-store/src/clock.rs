//! Process-wide message clock.
//!
//! Wall-clock time can step backwards (NTP adjustments, VM migration).
//! Message timestamps must not, so every reading is clamped to be no
//! earlier than the previous one handed out in this process. Equal
//! readings are allowed; the message id breaks ties.

use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};

static LAST_MICROS: AtomicI64 = AtomicI64::new(i64::MIN);

/// Current time, never earlier than any previous call.
pub fn now() -> DateTime<Utc> {
    let wall = Utc::now().timestamp_micros();
    let prev = LAST_MICROS.fetch_max(wall, Ordering::AcqRel);
    let micros = wall.max(prev);
    Utc.timestamp_micros(micros)
        .single()
        .unwrap_or_else(Utc::now)
}

/// Fixed-width RFC 3339 rendering (`2024-05-01T09:30:00.123456Z`), so that
/// lexical order of the stored text equals chronological order.
pub fn to_db_text(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_is_non_decreasing() {
        let mut last = now();
        for _ in 0..1_000 {
            let next = now();
            assert!(next >= last);
            last = next;
        }
    }

    #[test]
    fn test_db_text_sorts_like_time() {
        let a = Utc.timestamp_micros(1_700_000_000_000_001).unwrap();
        let b = Utc.timestamp_micros(1_700_000_000_100_000).unwrap();
        assert!(to_db_text(&a) < to_db_text(&b));
        assert_eq!(to_db_text(&a).len(), to_db_text(&b).len());
    }
}
