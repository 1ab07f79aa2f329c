use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{TimeZone, Utc};

/// Scheduler timestamps are micros since the Unix epoch.
pub fn current_timestamp_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time before Unix epoch")
        .as_micros() as u64
}

/// Render a scheduler timestamp for log output, keeping the raw value so
/// entries can be correlated with solver debug files.
pub fn timestamp_us_str(timestamp_us: u64) -> String {
    let secs = (timestamp_us / 1_000_000) as i64;
    let micros = (timestamp_us % 1_000_000) as u32;
    match Utc.timestamp_opt(secs, micros * 1000) {
        chrono::LocalResult::Single(dt) => {
            format!("{}({})", dt.format("%Y-%m-%dT%T%.6f"), timestamp_us)
        }
        _ => format!("({})", timestamp_us),
    }
}

#[cfg(test)]
mod tests {
    use crate::utils::clock::{Clock, WallClock};
    use crate::utils::date_time::timestamp_us_str;

    #[test]
    pub fn timestamp_us_str_test() {
        assert_eq!(timestamp_us_str(0), "1970-01-01T00:00:00.000000(0)");
        assert_eq!(
            timestamp_us_str(1_500_000),
            "1970-01-01T00:00:01.500000(1500000)"
        );
    }

    #[test]
    pub fn wall_clock_reads_epoch_micros_test() {
        let clock = WallClock::default();
        let a = clock.now_us();
        let b = clock.now_us();
        // past the epoch and never running backwards
        assert!(a > 1_000_000_000_000_000);
        assert!(b >= a);
    }
}
