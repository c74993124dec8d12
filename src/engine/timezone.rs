// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Timezone and DST reconciliation.
//!
//! Grounded on `meross_device.py`'s `_check_device_timerules`: the device
//! reports a `timeRule` table (epoch boundary, UTC offset, DST flag) it
//! expects to use going forward. The engine verifies that table against the
//! host's IANA tz-database entry for the device's configured timezone, using
//! the same `bisect_right`-style lookup the original implementation uses —
//! here, `slice::partition_point` — and peeks one rule ahead so a mismatch
//! that would only appear at the *next* DST transition is caught before it
//! happens rather than after.

use std::time::Duration;

use chrono::{Datelike, Offset, TimeZone, Utc};
use chrono_tz::Tz;

use crate::codec::{Envelope, Method};
use crate::engine::descriptor::TimeRule;

/// How often to re-check timezone agreement once the last check agreed
/// (`check-ok-period`).
pub const CHECK_OK_PERIOD: Duration = Duration::from_secs(6 * 3600);
/// How often to re-check once the last check found (and reissued for) a
/// mismatch, so a just-pushed correction gets confirmed promptly
/// (`check-notok-period`).
pub const CHECK_NOTOK_PERIOD: Duration = Duration::from_secs(10 * 60);
/// How far ahead to peek for an upcoming DST transition the current rule
/// table might not already cover.
const TRANSITION_PEEK_AHEAD: Duration = Duration::from_secs(7 * 24 * 3600);
/// How many days to scan, at most, when searching for a DST transition.
const MAX_TRANSITION_SEARCH_DAYS: i64 = 366;

/// Finds the rule the device's own `timeRule` table says should be in effect
/// at `at_epoch`, via a binary search equivalent to Python's
/// `bisect.bisect_right`.
#[must_use]
pub fn rule_at(rules: &[TimeRule], at_epoch: i64) -> Option<&TimeRule> {
    if rules.is_empty() {
        return None;
    }
    let idx = rules.partition_point(|r| r.start <= at_epoch);
    if idx == 0 { None } else { Some(&rules[idx - 1]) }
}

/// Finds the offset (minutes) the device's own `timeRule` table says should
/// be in effect at `at_epoch`.
#[must_use]
pub fn offset_from_time_rule(rules: &[TimeRule], at_epoch: i64) -> Option<i32> {
    rule_at(rules, at_epoch).map(|r| r.offset_minutes)
}

/// Looks up the UTC offset, and whether it is the DST-adjusted one, that the
/// host's tz-database says should be in effect for `timezone_name` at
/// `at_epoch`. Returns `None` if the name is not a recognized IANA zone.
///
/// `chrono_tz` doesn't expose a DST flag directly, so this approximates it by
/// comparing the offset at `at_epoch` against the zone's standard-time offset
/// (sampled at noon UTC on January 1st of the same year, a date outside any
/// real-world DST window): if they differ, `at_epoch` is in DST.
#[must_use]
pub fn host_offset_and_dst(timezone_name: &str, at_epoch: i64) -> Option<(i32, bool)> {
    let tz: Tz = timezone_name.parse().ok()?;
    let utc_dt = Utc.timestamp_opt(at_epoch, 0).single()?;
    let offset = tz.from_utc_datetime(&utc_dt.naive_utc()).offset().fix().local_minus_utc() / 60;

    let jan1 = Utc.with_ymd_and_hms(utc_dt.year(), 1, 1, 12, 0, 0).single()?;
    let standard = tz.from_utc_datetime(&jan1.naive_utc()).offset().fix().local_minus_utc() / 60;

    Some((offset, offset != standard))
}

/// Cross-checks the device's `timeRule` table against the host's tz-database
/// entry at `at_epoch`. Returns `true` if both the offset and the DST flag
/// agree (or the device's timezone name isn't a recognized IANA zone, which
/// is treated as unverifiable rather than mismatched).
#[must_use]
pub fn verify(rules: &[TimeRule], timezone_name: &str, at_epoch: i64) -> bool {
    let Some((expected_offset, expected_dst)) = host_offset_and_dst(timezone_name, at_epoch) else {
        return true;
    };
    match rule_at(rules, at_epoch) {
        Some(rule) => rule.offset_minutes == expected_offset && rule.is_dst == expected_dst,
        None => true,
    }
}

/// The result of a full reconciliation pass: whether the device's table
/// still agrees with the host, now and through the peek-ahead window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckOutcome {
    /// The device's table agrees with the host, both now and at the next
    /// peeked-ahead instant.
    Agrees,
    /// A mismatch was found, now or within the peek-ahead window; a fresh
    /// `SYSTEM_TIME SET` should be issued.
    Mismatch,
}

/// Runs a full reconciliation pass: checks agreement at `now_epoch`, then
/// peeks `TRANSITION_PEEK_AHEAD` into the future to catch a DST transition
/// the device's table doesn't yet account for before it actually happens.
#[must_use]
pub fn check_timerules(rules: &[TimeRule], timezone_name: &str, now_epoch: i64) -> CheckOutcome {
    if !verify(rules, timezone_name, now_epoch) {
        return CheckOutcome::Mismatch;
    }
    let peek_epoch = now_epoch + TRANSITION_PEEK_AHEAD.as_secs() as i64;
    if !verify(rules, timezone_name, peek_epoch) {
        return CheckOutcome::Mismatch;
    }
    CheckOutcome::Agrees
}

fn dst_at(timezone_name: &str, epoch: i64) -> Option<bool> {
    host_offset_and_dst(timezone_name, epoch).map(|(_, dst)| dst)
}

/// Scans backward in day steps from `at_epoch` for the most recent DST
/// transition (a day whose DST flag differs from the day before it).
fn last_transition_before(timezone_name: &str, at_epoch: i64) -> Option<i64> {
    let mut day = at_epoch;
    let mut dst = dst_at(timezone_name, day)?;
    for _ in 0..MAX_TRANSITION_SEARCH_DAYS {
        let prev = day - 86_400;
        let prev_dst = dst_at(timezone_name, prev)?;
        if prev_dst != dst {
            return Some(day);
        }
        day = prev;
        dst = prev_dst;
    }
    None
}

/// Scans forward in day steps from `at_epoch` for the next DST transition.
fn next_transition_after(timezone_name: &str, at_epoch: i64) -> Option<i64> {
    let mut day = at_epoch;
    let mut dst = dst_at(timezone_name, day)?;
    for _ in 0..MAX_TRANSITION_SEARCH_DAYS {
        let next = day + 86_400;
        let next_dst = dst_at(timezone_name, next)?;
        if next_dst != dst {
            return Some(next);
        }
        day = next;
        dst = next_dst;
    }
    None
}

/// Rebuilds the two-entry `timeRule` table a `SYSTEM_TIME SET` should carry:
/// the last past transition and the next future one, both read straight from
/// the host's tz-database. Returns `None` if the zone is unrecognized or has
/// no DST transition within a year in either direction (nothing to rebuild).
#[must_use]
pub fn rebuild_time_rule(timezone_name: &str, at_epoch: i64) -> Option<Vec<TimeRule>> {
    let past = last_transition_before(timezone_name, at_epoch)?;
    let future = next_transition_after(timezone_name, at_epoch)?;
    let (past_offset, past_dst) = host_offset_and_dst(timezone_name, past)?;
    let (future_offset, future_dst) = host_offset_and_dst(timezone_name, future)?;
    Some(vec![
        TimeRule { start: past, offset_minutes: past_offset, is_dst: past_dst },
        TimeRule { start: future, offset_minutes: future_offset, is_dst: future_dst },
    ])
}

/// Builds the `Appliance.System.Time SET` envelope that reissues `rules` to
/// the device.
#[must_use]
pub fn build_system_time_set(rules: &[TimeRule], key: &str, from: &str, timestamp: i64) -> Envelope {
    let time_rule: Vec<_> = rules
        .iter()
        .map(|r| serde_json::json!([r.start, r.offset_minutes, i32::from(r.is_dst)]))
        .collect();
    Envelope::build(
        "Appliance.System.Time",
        Method::Set,
        serde_json::json!({ "time": { "timeRule": time_rule } }),
        key,
        from,
        timestamp,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules() -> Vec<TimeRule> {
        vec![
            TimeRule { start: 0, offset_minutes: 60, is_dst: false },
            TimeRule { start: 1_700_000_000, offset_minutes: 120, is_dst: true },
        ]
    }

    #[test]
    fn offset_lookup_picks_latest_rule_not_exceeding_epoch() {
        assert_eq!(offset_from_time_rule(&rules(), 100), Some(60));
        assert_eq!(offset_from_time_rule(&rules(), 1_700_000_000), Some(120));
        assert_eq!(offset_from_time_rule(&rules(), 1_800_000_000), Some(120));
    }

    #[test]
    fn offset_lookup_before_first_rule_is_none() {
        assert_eq!(offset_from_time_rule(&rules(), -1), None);
    }

    #[test]
    fn empty_rules_is_none() {
        assert_eq!(offset_from_time_rule(&[], 0), None);
    }

    #[test]
    fn host_offset_for_unknown_zone_is_none() {
        assert_eq!(host_offset_and_dst("Not/AZone", 0), None);
    }

    #[test]
    fn host_offset_for_utc_is_zero_and_never_dst() {
        assert_eq!(host_offset_and_dst("UTC", 1_700_000_000), Some((0, false)));
    }

    #[test]
    fn verify_treats_unrecognized_zone_as_unverifiable() {
        assert!(verify(&rules(), "Not/AZone", 1_700_000_000));
    }

    #[test]
    fn verify_agrees_when_device_offset_and_dst_match_host() {
        let rules = vec![TimeRule { start: 0, offset_minutes: 0, is_dst: false }];
        assert!(verify(&rules, "UTC", 1_700_000_000));
    }

    #[test]
    fn verify_flags_offset_mismatch() {
        let rules = vec![TimeRule { start: 0, offset_minutes: 999, is_dst: false }];
        assert!(!verify(&rules, "UTC", 1_700_000_000));
    }

    #[test]
    fn verify_flags_dst_flag_mismatch_even_with_matching_offset() {
        let rules = vec![TimeRule { start: 0, offset_minutes: 0, is_dst: true }];
        assert!(!verify(&rules, "UTC", 1_700_000_000));
    }

    #[test]
    fn check_timerules_agrees_for_utc() {
        let rules = vec![TimeRule { start: 0, offset_minutes: 0, is_dst: false }];
        assert_eq!(
            check_timerules(&rules, "UTC", 1_700_000_000),
            CheckOutcome::Agrees
        );
    }

    #[test]
    fn check_timerules_flags_current_mismatch() {
        let rules = vec![TimeRule { start: 0, offset_minutes: 999, is_dst: false }];
        assert_eq!(
            check_timerules(&rules, "UTC", 1_700_000_000),
            CheckOutcome::Mismatch
        );
    }

    #[test]
    fn rebuild_time_rule_is_none_for_unrecognized_zone() {
        assert_eq!(rebuild_time_rule("Not/AZone", 1_700_000_000), None);
    }

    #[test]
    fn rebuild_time_rule_is_none_for_a_zone_with_no_dst() {
        assert_eq!(rebuild_time_rule("UTC", 1_700_000_000), None);
    }

    #[test]
    fn build_system_time_set_carries_rule_table() {
        let rules = vec![TimeRule { start: 0, offset_minutes: 60, is_dst: false }];
        let envelope = build_system_time_set(&rules, "key", "/appliance/abc/publish", 1_700_000_000);
        assert_eq!(envelope.header.namespace, "Appliance.System.Time");
        assert_eq!(
            envelope.payload["time"]["timeRule"][0],
            serde_json::json!([0, 60, 0])
        );
    }
}
