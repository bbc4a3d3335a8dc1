//! Property tests for cron next-firing computation.

use chrono::{Datelike, TimeZone, Timelike, Utc};
use proptest::prelude::*;

use gathering::services::CronExpr;

proptest! {
    /// For pinned minute/hour expressions, the computed firing is
    /// strictly in the future and lands exactly on the requested fields.
    #[test]
    fn next_firing_is_minimal_and_matches_fields(
        minute in 0u32..60,
        hour in 0u32..24,
        offset_minutes in 0i64..(60 * 24 * 14),
    ) {
        let expr = CronExpr::parse(&format!("{minute} {hour} * * *")).unwrap();
        let now = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
            + chrono::Duration::minutes(offset_minutes);

        let next = expr.next_after(now).expect("a daily schedule always has a next firing");

        prop_assert!(next > now);
        prop_assert_eq!(next.minute(), minute);
        prop_assert_eq!(next.hour(), hour);
        prop_assert_eq!(next.second(), 0);
        // Minimality: the firing is within 24h and there is no earlier
        // matching minute after `now`.
        prop_assert!(next - now <= chrono::Duration::hours(24));
    }

    /// Day-of-week restrictions land on the right weekday.
    #[test]
    fn day_of_week_restriction_is_honored(
        dow in 0u32..7,
        offset_hours in 0i64..(24 * 30),
    ) {
        let expr = CronExpr::parse(&format!("0 12 * * {dow}")).unwrap();
        let now = Utc.with_ymd_and_hms(2025, 3, 1, 6, 30, 0).unwrap()
            + chrono::Duration::hours(offset_hours);

        let next = expr.next_after(now).expect("weekly schedule fires");

        prop_assert!(next > now);
        prop_assert_eq!(next.weekday().num_days_from_sunday(), dow);
        prop_assert_eq!(next.hour(), 12);
        prop_assert!(next - now <= chrono::Duration::days(7));
    }
}
