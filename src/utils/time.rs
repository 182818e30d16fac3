use chrono::{Local, NaiveTime, Offset, TimeZone};

pub const MINUTE_MS: i64 = 60 * 1000;
pub const HOUR_MS: i64 = 60 * MINUTE_MS;
pub const DAY_MS: i64 = 24 * HOUR_MS;

/// Truncates an epoch-millisecond timestamp to the start of its minute.
pub fn minute_start(timestamp_ms: i64) -> i64 {
    timestamp_ms - timestamp_ms.rem_euclid(MINUTE_MS)
}

/// Truncates an epoch-millisecond timestamp to the start of its hour.
pub fn hour_start(timestamp_ms: i64) -> i64 {
    timestamp_ms - timestamp_ms.rem_euclid(HOUR_MS)
}

/// Truncates an epoch-millisecond timestamp to the start of its *local*
/// calendar day. Plain modulo against the UTC epoch is wrong in non-UTC
/// zones near day boundaries, so the day is rebuilt from the local date.
/// The offset is re-derived on every call since it changes across DST
/// transitions.
pub fn day_start(timestamp_ms: i64) -> i64 {
    let Some(local) = Local.timestamp_millis_opt(timestamp_ms).single() else {
        // Timestamp outside chrono's representable range. Nothing the
        // sampler produces gets here, but the function stays total.
        return timestamp_ms - timestamp_ms.rem_euclid(DAY_MS);
    };

    let midnight = local.date_naive().and_time(NaiveTime::MIN);
    match Local.from_local_datetime(&midnight).earliest() {
        Some(start) => start.timestamp_millis(),
        None => {
            // Midnight doesn't exist in this zone today (DST gap). Truncate
            // through the instant's own offset instead.
            let offset_ms = local.offset().fix().local_minus_utc() as i64 * 1000;
            let shifted = timestamp_ms + offset_ms;
            shifted - shifted.rem_euclid(DAY_MS) - offset_ms
        }
    }
}
