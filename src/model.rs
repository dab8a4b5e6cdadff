use chrono::{NaiveDate, NaiveTime, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. Every instant in the crate uses this.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    /// Intersection of two spans, if non-empty.
    pub fn clamp_to(&self, window: &Span) -> Option<Span> {
        let start = self.start.max(window.start);
        let end = self.end.min(window.end);
        (start < end).then(|| Span::new(start, end))
    }
}

// ── Tenant directory ─────────────────────────────────────────────

/// A business account. Everything else hangs off one of these.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tenant {
    pub id: Ulid,
    /// Public booking slug. Lowercase ASCII alphanumeric, immutable once claimed.
    pub subdomain: String,
    pub name: String,
    pub timezone: Tz,
    /// Spacing between candidate slot starts. `None` steps by the service duration.
    pub slot_step_minutes: Option<u32>,
    pub headline: Option<String>,
    pub description: Option<String>,
    pub address: Option<String>,
    pub logo_url: Option<String>,
}

// ── Catalog ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub id: Ulid,
    pub name: String,
    pub duration_minutes: u32,
    pub price_cents: i64,
}

impl Service {
    pub fn duration_ms(&self) -> Ms {
        self.duration_minutes as Ms * MINUTE_MS
    }
}

/// Working hours for one weekday, in the tenant's local wall-clock time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityRule {
    pub day: Weekday,
    pub is_working: bool,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaffMember {
    pub id: Ulid,
    pub name: String,
    pub title: String,
    pub photo_url: Option<String>,
    /// At most one rule per weekday, ordered Monday first.
    pub availability: Vec<AvailabilityRule>,
}

impl StaffMember {
    pub fn rule_for(&self, day: Weekday) -> Option<&AvailabilityRule> {
        self.availability.iter().find(|r| r.day == day)
    }

    /// Insert or replace the rule for `rule.day`.
    pub fn set_rule(&mut self, rule: AvailabilityRule) {
        let key = rule.day.num_days_from_monday();
        match self
            .availability
            .binary_search_by_key(&key, |r| r.day.num_days_from_monday())
        {
            Ok(pos) => self.availability[pos] = rule,
            Err(pos) => self.availability.insert(pos, rule),
        }
    }
}

/// A staff absence over an inclusive date range in the tenant's zone.
/// `start_time`/`end_time` narrow the first and last day; absent means
/// the whole day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeOff {
    pub id: Ulid,
    pub staff_id: Ulid,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub start_time: Option<NaiveTime>,
    pub end_time: Option<NaiveTime>,
    pub reason: Option<String>,
}

// ── Ledger ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingStatus {
    Confirmed,
    Cancelled { at: Ms },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub tenant_id: Ulid,
    pub staff_id: Ulid,
    pub service_id: Ulid,
    pub customer_name: String,
    pub customer_email: String,
    /// `[booking_time, booking_time + service duration)`.
    pub span: Span,
    pub status: BookingStatus,
    pub created_at: Ms,
}

impl Booking {
    pub fn is_confirmed(&self) -> bool {
        self.status == BookingStatus::Confirmed
    }
}

/// Everything the engine tracks for one staff member. Guarded by a single
/// lock, which is the serialization scope for reservations.
#[derive(Debug, Clone)]
pub struct StaffState {
    pub member: StaffMember,
    pub time_off: Vec<TimeOff>,
    /// Confirmed bookings, sorted by `span.start`, pairwise non-overlapping.
    pub bookings: Vec<Booking>,
    /// Cancelled bookings, kept for history.
    pub history: Vec<Booking>,
}

impl StaffState {
    pub fn new(member: StaffMember) -> Self {
        Self {
            member,
            time_off: Vec::new(),
            bookings: Vec::new(),
            history: Vec::new(),
        }
    }

    /// Insert booking maintaining sort order by span.start.
    pub fn insert_booking(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .binary_search_by_key(&booking.span.start, |b| b.span.start)
            .unwrap_or_else(|e| e);
        self.bookings.insert(pos, booking);
    }

    /// Move a confirmed booking into history.
    pub fn cancel_booking(&mut self, id: Ulid, at: Ms) -> Option<Booking> {
        let pos = self.bookings.iter().position(|b| b.id == id)?;
        let mut booking = self.bookings.remove(pos);
        booking.status = BookingStatus::Cancelled { at };
        self.history.push(booking.clone());
        Some(booking)
    }

    pub fn find_booking(&self, id: &Ulid) -> Option<&Booking> {
        self.bookings
            .iter()
            .chain(self.history.iter())
            .find(|b| b.id == *id)
    }

    /// Confirmed bookings whose span overlaps the query window.
    /// Uses binary search to skip bookings starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Booking> {
        let right_bound = self
            .bookings
            .partition_point(|b| b.span.start < query.end);
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| b.span.end > query.start)
    }

    pub fn insert_time_off(&mut self, time_off: TimeOff) {
        let pos = self
            .time_off
            .binary_search_by_key(&time_off.start_date, |t| t.start_date)
            .unwrap_or_else(|e| e);
        self.time_off.insert(pos, time_off);
    }

    pub fn remove_time_off(&mut self, id: Ulid) -> Option<TimeOff> {
        let pos = self.time_off.iter().position(|t| t.id == id)?;
        Some(self.time_off.remove(pos))
    }

    /// Time-off entries whose date range includes any of `[from, to]`.
    pub fn time_off_between(&self, from: NaiveDate, to: NaiveDate) -> impl Iterator<Item = &TimeOff> {
        self.time_off
            .iter()
            .take_while(move |t| t.start_date <= to)
            .filter(move |t| t.end_date >= from)
    }
}

/// WAL record format for a tenant engine. Flat, one variant per mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ServiceUpserted {
        service: Service,
    },
    ServiceRemoved {
        id: Ulid,
    },
    StaffCreated {
        member: StaffMember,
    },
    StaffUpdated {
        id: Ulid,
        name: String,
        title: String,
        photo_url: Option<String>,
    },
    StaffRemoved {
        id: Ulid,
    },
    AvailabilitySet {
        staff_id: Ulid,
        rule: AvailabilityRule,
    },
    TimeOffAdded {
        time_off: TimeOff,
    },
    TimeOffRemoved {
        id: Ulid,
        staff_id: Ulid,
    },
    BookingConfirmed {
        booking: Booking,
    },
    BookingCancelled {
        id: Ulid,
        staff_id: Ulid,
        at: Ms,
    },
}

impl Event {
    /// The staff member whose state this event touches, if any.
    pub fn staff_id(&self) -> Option<Ulid> {
        match self {
            Event::StaffCreated { member } => Some(member.id),
            Event::StaffUpdated { id, .. } | Event::StaffRemoved { id } => Some(*id),
            Event::AvailabilitySet { staff_id, .. }
            | Event::TimeOffRemoved { staff_id, .. }
            | Event::BookingCancelled { staff_id, .. } => Some(*staff_id),
            Event::TimeOffAdded { time_off } => Some(time_off.staff_id),
            Event::BookingConfirmed { booking } => Some(booking.staff_id),
            Event::ServiceUpserted { .. } | Event::ServiceRemoved { .. } => None,
        }
    }
}
