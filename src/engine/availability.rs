use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, TimeZone};
use chrono_tz::Tz;

use crate::model::*;

// ── Local time → instants ────────────────────────────────────────

/// Resolve a tenant-local wall-clock time to an instant.
///
/// Ambiguous times (DST fall-back) take the earliest mapping. Times inside
/// a DST gap resolve to the first valid minute after the gap.
pub fn local_to_ms(tz: Tz, local: NaiveDateTime) -> Ms {
    if let Some(dt) = tz.from_local_datetime(&local).earliest() {
        return dt.timestamp_millis();
    }
    let mut probe = local;
    for _ in 0..(24 * 60) {
        let Some(next) = probe.checked_add_signed(Duration::minutes(1)) else {
            break;
        };
        probe = next;
        if let Some(dt) = tz.from_local_datetime(&probe).earliest() {
            return dt.timestamp_millis();
        }
    }
    local.and_utc().timestamp_millis()
}

/// The whole local day `[date 00:00, date+1 00:00)`.
pub fn day_span(date: NaiveDate, tz: Tz) -> Span {
    let start = local_to_ms(tz, date.and_time(NaiveTime::MIN));
    let next = date.succ_opt().unwrap_or(date);
    let end = local_to_ms(tz, next.and_time(NaiveTime::MIN));
    Span::new(start, end.max(start + 1))
}

/// The local calendar date an instant falls on.
pub fn local_date(tz: Tz, at: Ms) -> Option<NaiveDate> {
    tz.timestamp_millis_opt(at)
        .single()
        .map(|dt| dt.date_naive())
}

/// Working window for `date` under `rule`, or `None` on a day off.
pub fn working_window(rule: &AvailabilityRule, date: NaiveDate, tz: Tz) -> Option<Span> {
    if !rule.is_working {
        return None;
    }
    let start = local_to_ms(tz, date.and_time(rule.start_time));
    let end = local_to_ms(tz, date.and_time(rule.end_time));
    (start < end).then(|| Span::new(start, end))
}

/// Blocked span of a time-off entry. Missing times mean day boundaries.
pub fn time_off_span(time_off: &TimeOff, tz: Tz) -> Option<Span> {
    let start = local_to_ms(
        tz,
        time_off
            .start_date
            .and_time(time_off.start_time.unwrap_or(NaiveTime::MIN)),
    );
    let end = match time_off.end_time {
        Some(t) => local_to_ms(tz, time_off.end_date.and_time(t)),
        None => local_to_ms(tz, time_off.end_date.succ_opt()?.and_time(NaiveTime::MIN)),
    };
    (start < end).then(|| Span::new(start, end))
}

// ── Availability Algorithm ───────────────────────────────────────

/// Free sub-windows of a staff member's working day: the weekday's working
/// window, minus the union of time-off, minus confirmed bookings.
pub fn free_windows(state: &StaffState, date: NaiveDate, tz: Tz) -> Vec<Span> {
    let Some(rule) = state.member.rule_for(date.weekday()) else {
        return Vec::new();
    };
    let Some(window) = working_window(rule, date, tz) else {
        return Vec::new();
    };
    let mut free = vec![window];

    // Step 1: time-off, clipped to the window and unioned
    let mut blocked: Vec<Span> = state
        .time_off_between(date, date)
        .filter_map(|t| time_off_span(t, tz))
        .filter_map(|s| s.clamp_to(&window))
        .collect();
    if !blocked.is_empty() {
        blocked.sort_by_key(|s| s.start);
        free = subtract_intervals(&free, &merge_overlapping(&blocked));
    }

    // Step 2: confirmed bookings (already sorted and disjoint)
    let booked: Vec<Span> = state.overlapping(&window).map(|b| b.span).collect();
    if !booked.is_empty() {
        free = subtract_intervals(&free, &booked);
    }

    free
}

/// Candidate slots inside each free window: starts at `window.start + k*step`
/// whose full duration fits, dropping any that start before `not_before`.
pub fn generate_slots(free: &[Span], duration: Ms, step: Ms, not_before: Ms) -> Vec<Span> {
    let mut slots = Vec::new();
    if duration <= 0 || step <= 0 {
        return slots;
    }
    for w in free {
        let mut start = w.start;
        if start < not_before {
            let behind = not_before - start;
            start += (behind + step - 1) / step * step;
        }
        while start + duration <= w.end {
            slots.push(Span::new(start, start + duration));
            start += step;
        }
    }
    slots
}

/// Bookable slots for one staff member on one local date.
pub fn slots_for_day(
    state: &StaffState,
    date: NaiveDate,
    tz: Tz,
    duration: Ms,
    step: Ms,
    now: Ms,
) -> Vec<Span> {
    let free = free_windows(state, date, tz);
    generate_slots(&free, duration, step, now)
}

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end {
                last.end = last.end.max(span.end);
                continue;
            }
        merged.push(span);
    }
    merged
}

/// Remove sorted, disjoint `to_remove` spans from sorted, disjoint `base`.
pub fn subtract_intervals(base: &[Span], to_remove: &[Span]) -> Vec<Span> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut current_start = b.start;
        let current_end = b.end;

        while ri < to_remove.len() && to_remove[ri].end <= current_start {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < current_end {
            let r = &to_remove[j];
            if r.start > current_start {
                result.push(Span::new(current_start, r.start));
            }
            current_start = current_start.max(r.end);
            j += 1;
        }

        if current_start < current_end {
            result.push(Span::new(current_start, current_end));
        }
    }

    result
}
