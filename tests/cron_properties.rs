// tests/cron_properties.rs

use chrono::{DateTime, TimeDelta, TimeZone, Timelike, Utc};
use proptest::prelude::*;

use fleetcast::cron::{self, CronField, CronSchedule};

fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
}

#[test]
fn nightly_pattern_fires_at_two() {
    let next = cron::next_occurrences("0 2 * * *", at(2024, 1, 1, 0, 0), 3).unwrap();
    assert_eq!(
        next,
        vec![at(2024, 1, 1, 2, 0), at(2024, 1, 2, 2, 0), at(2024, 1, 3, 2, 0)]
    );
}

#[test]
fn occurrences_are_strictly_after_from() {
    let s = CronSchedule::parse("0 2 * * *").unwrap();
    assert_eq!(s.next_after(at(2024, 1, 1, 2, 0)), Some(at(2024, 1, 2, 2, 0)));
}

#[test]
fn weekday_and_day_of_month_are_ored() {
    // 13th of the month or any Friday.
    let s = CronSchedule::parse("0 0 13 * 5").unwrap();
    // 2024-09-06 is a Friday, 2024-09-13 is also a Friday.
    let next = s.next_occurrences(at(2024, 9, 1, 0, 0), 3);
    assert_eq!(
        next,
        vec![at(2024, 9, 6, 0, 0), at(2024, 9, 13, 0, 0), at(2024, 9, 20, 0, 0)]
    );
}

#[test]
fn impossible_dates_yield_nothing() {
    let s = CronSchedule::parse("0 0 31 2 *").unwrap();
    assert_eq!(s.next_after(at(2024, 1, 1, 0, 0)), None);
}

#[test]
fn malformed_expressions_name_the_field() {
    let cases = [
        ("0 2 * *", CronField::Expression),
        ("60 2 * * *", CronField::Minute),
        ("0 24 * * *", CronField::Hour),
        ("0 2 0 * *", CronField::DayOfMonth),
        ("0 2 * 13 *", CronField::Month),
        ("0 2 * * 7", CronField::Weekday),
        ("0 5-2 * * *", CronField::Hour),
        ("x 2 * * *", CronField::Minute),
    ];
    for (expr, field) in cases {
        let err = cron::parse(expr).unwrap_err();
        assert_eq!(err.field, field, "{expr}");
    }
}

fn field_strategy(lo: u32, hi: u32) -> impl Strategy<Value = String> {
    prop_oneof![
        Just("*".to_string()),
        (lo..=hi).prop_map(|v| v.to_string()),
        (lo..=hi, lo..=hi).prop_map(|(a, b)| format!("{}-{}", a.min(b), a.max(b))),
        proptest::collection::vec(lo..=hi, 1..4).prop_map(|vs| {
            vs.iter().map(u32::to_string).collect::<Vec<_>>().join(",")
        }),
    ]
}

fn expr_strategy() -> impl Strategy<Value = String> {
    (
        field_strategy(0, 59),
        field_strategy(0, 23),
        // Keep day-of-month small enough to occur in every month.
        field_strategy(1, 28),
        field_strategy(1, 12),
        field_strategy(0, 6),
    )
        .prop_map(|(mi, h, dom, mo, dow)| format!("{mi} {h} {dom} {mo} {dow}"))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn occurrences_increase_and_match(
        expr in expr_strategy(),
        offset_minutes in 0i64..(366 * 24 * 60),
    ) {
        let schedule = CronSchedule::parse(&expr).unwrap();
        let from = at(2024, 1, 1, 0, 0) + TimeDelta::minutes(offset_minutes);
        let next = schedule.next_occurrences(from, 3);

        prop_assert_eq!(next.len(), 3);
        let mut prev = from;
        for t in &next {
            prop_assert!(*t > prev);
            prop_assert_eq!(t.second(), 0);
            prop_assert!(schedule.matches(t));
            prev = *t;
        }

        // No matching minute is skipped between `from` and the first result.
        let mut t = from + TimeDelta::minutes(1);
        let limit = next[0].min(t + TimeDelta::days(2));
        while t < limit {
            prop_assert!(!schedule.matches(&t), "{} matched before {}", t, next[0]);
            t += TimeDelta::minutes(1);
        }
    }
}
