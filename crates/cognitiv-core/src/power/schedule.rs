//! Quiet-hours arithmetic. Pure functions over Unix seconds and local offsets.

const SECONDS_PER_DAY: i64 = 24 * 60 * 60;

/// Whether `hour:minute` falls in the window starting at `start` (inclusive)
/// and ending at `wake` (exclusive). A window with `start > wake` wraps past
/// midnight; `start == wake` is an empty window.
pub fn is_quiet_hours(
    hour: u8,
    minute: u8,
    start_hour: u8,
    start_minute: u8,
    wake_hour: u8,
    wake_minute: u8,
) -> bool {
    let now = minute_of_day(hour, minute);
    let start = minute_of_day(start_hour, start_minute);
    let wake = minute_of_day(wake_hour, wake_minute);

    if start < wake {
        now >= start && now < wake
    } else if start > wake {
        now >= start || now < wake
    } else {
        false
    }
}

const fn minute_of_day(hour: u8, minute: u8) -> u16 {
    hour as u16 * 60 + minute as u16
}

/// Local `(hour, minute)` of a Unix timestamp.
pub fn local_time_of_day(unix: u64, offset_secs: i64) -> (u8, u8) {
    let seconds = (unix as i64 + offset_secs).rem_euclid(SECONDS_PER_DAY);
    ((seconds / 3600) as u8, (seconds % 3600 / 60) as u8)
}

/// Next Unix time whose local clock reads `wake_hour:wake_minute` and which
/// is strictly after `now`.
pub fn calculate_wake_target(now: u64, offset_secs: i64, wake_hour: u8, wake_minute: u8) -> u64 {
    let local = now as i64 + offset_secs;
    let midnight = local - local.rem_euclid(SECONDS_PER_DAY);
    let mut target = midnight + wake_hour as i64 * 3600 + wake_minute as i64 * 60;
    if target <= local {
        target += SECONDS_PER_DAY;
    }
    (target - offset_secs) as u64
}

/// How a quiet period is cut into chained sleeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlan {
    /// Full-length segments slept before the final one.
    pub full_chunks: u32,
    /// Length of the final, time-corrected segment.
    pub final_secs: u32,
}

/// Split `remaining_secs` into whole chunks plus a final segment.
///
/// The final segment is never empty: an exact multiple leaves one whole
/// chunk for the final, resynchronized sleep.
pub fn plan_chunks(remaining_secs: u32, chunk_secs: u32) -> ChunkPlan {
    let chunk_secs = chunk_secs.max(1);
    let mut full_chunks = remaining_secs / chunk_secs;
    let mut final_secs = remaining_secs % chunk_secs;
    if final_secs == 0 && full_chunks > 0 {
        full_chunks -= 1;
        final_secs = chunk_secs;
    }
    ChunkPlan {
        full_chunks,
        final_secs,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // 2024-06-10 00:00:00 UTC
    const DAY_N: u64 = 1_717_977_600;

    #[test]
    fn test_quiet_hours_boundaries_wrap_midnight() {
        assert!(is_quiet_hours(16, 0, 16, 0, 7, 55));
        assert!(!is_quiet_hours(7, 55, 16, 0, 7, 55));
        assert!(!is_quiet_hours(15, 59, 16, 0, 7, 55));
        assert!(is_quiet_hours(23, 59, 16, 0, 7, 55));
        assert!(is_quiet_hours(0, 0, 16, 0, 7, 55));
        assert!(is_quiet_hours(7, 54, 16, 0, 7, 55));
        assert!(!is_quiet_hours(12, 0, 16, 0, 7, 55));
    }

    #[test]
    fn test_quiet_hours_same_day_window() {
        assert!(is_quiet_hours(12, 0, 12, 0, 13, 30));
        assert!(is_quiet_hours(13, 29, 12, 0, 13, 30));
        assert!(!is_quiet_hours(13, 30, 12, 0, 13, 30));
        assert!(!is_quiet_hours(11, 59, 12, 0, 13, 30));
    }

    #[test]
    fn test_empty_window_is_never_quiet() {
        assert!(!is_quiet_hours(8, 0, 8, 0, 8, 0));
        assert!(!is_quiet_hours(20, 0, 8, 0, 8, 0));
    }

    #[test]
    fn test_wake_target_rolls_to_next_day() {
        let now = DAY_N + 22 * 3600;
        let target = calculate_wake_target(now, 0, 7, 55);
        assert_eq!(target, DAY_N + 86_400 + 7 * 3600 + 55 * 60);
    }

    #[test]
    fn test_wake_target_later_same_day() {
        let now = DAY_N + 3 * 3600;
        assert_eq!(
            calculate_wake_target(now, 0, 7, 55),
            DAY_N + 7 * 3600 + 55 * 60
        );
        // exactly at the wake time: the next one is tomorrow
        let now = DAY_N + 7 * 3600 + 55 * 60;
        assert_eq!(calculate_wake_target(now, 0, 7, 55), now + 86_400);
    }

    #[test]
    fn test_wake_target_honours_local_offset() {
        // 22:00 local at UTC+2 is 20:00 UTC
        let now = DAY_N + 20 * 3600;
        let target = calculate_wake_target(now, 7200, 7, 55);
        assert_eq!(local_time_of_day(target, 7200), (7, 55));
        assert_eq!(target, DAY_N + 86_400 + 5 * 3600 + 55 * 60);
    }

    #[test]
    fn test_local_time_of_day() {
        assert_eq!(local_time_of_day(DAY_N + 16 * 3600, 0), (16, 0));
        assert_eq!(local_time_of_day(DAY_N + 30 * 60, -3600), (23, 30));
    }

    #[test]
    fn test_overnight_chunk_plan() {
        let plan = plan_chunks(15 * 3600 + 55 * 60, 7200);
        assert_eq!(
            plan,
            ChunkPlan {
                full_chunks: 7,
                final_secs: 3600 + 55 * 60
            }
        );
    }

    #[test]
    fn test_chunk_plan_edges() {
        assert_eq!(
            plan_chunks(3000, 7200),
            ChunkPlan {
                full_chunks: 0,
                final_secs: 3000
            }
        );
        assert_eq!(
            plan_chunks(14_400, 7200),
            ChunkPlan {
                full_chunks: 1,
                final_secs: 7200
            }
        );
    }
}
