use std::collections::BTreeMap;

use chrono::NaiveDate;
use chrono_tz::Tz;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::availability::{day_span, local_date, slots_for_day};
use super::conflict::validate_date;
use super::{Engine, EngineError};

/// Confirmed bookings starting on one local date.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DensityRow {
    pub date: NaiveDate,
    pub count: u32,
}

impl Engine {
    pub fn get_service(&self, id: &Ulid) -> Option<Service> {
        self.services.get(id).map(|e| e.value().clone())
    }

    pub fn list_services(&self) -> Vec<Service> {
        let mut out: Vec<Service> = self.services.iter().map(|e| e.value().clone()).collect();
        out.sort_by_key(|s| s.id);
        out
    }

    pub async fn get_staff(&self, id: &Ulid) -> Option<StaffMember> {
        let st = self.get_staff_state(id)?;
        let guard = st.read().await;
        Some(guard.member.clone())
    }

    pub async fn list_staff(&self) -> Vec<StaffMember> {
        let states: Vec<_> = self.staff.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(states.len());
        for st in states {
            out.push(st.read().await.member.clone());
        }
        out.sort_by_key(|m| m.id);
        out
    }

    pub async fn get_availability(
        &self,
        staff_id: Ulid,
    ) -> Result<Vec<AvailabilityRule>, EngineError> {
        let st = self
            .get_staff_state(&staff_id)
            .ok_or(EngineError::NotFound(staff_id))?;
        let guard = st.read().await;
        Ok(guard.member.availability.clone())
    }

    pub async fn get_time_off(&self, staff_id: Ulid) -> Result<Vec<TimeOff>, EngineError> {
        let st = self
            .get_staff_state(&staff_id)
            .ok_or(EngineError::NotFound(staff_id))?;
        let guard = st.read().await;
        Ok(guard.time_off.clone())
    }

    /// Bookable slots for one staff member, one service and one local date.
    ///
    /// `step_minutes` is the tenant's slot step; `None` steps by the service
    /// duration. Only the read lock is taken and it is released on return.
    pub async fn compute_slots(
        &self,
        staff_id: Ulid,
        service_id: Ulid,
        date: NaiveDate,
        tz: Tz,
        step_minutes: Option<u32>,
        now: Ms,
    ) -> Result<Vec<Span>, EngineError> {
        validate_date(date)?;
        let service = self
            .get_service(&service_id)
            .ok_or(EngineError::NotFound(service_id))?;
        let st = self
            .get_staff_state(&staff_id)
            .ok_or(EngineError::NotFound(staff_id))?;

        let duration = service.duration_ms();
        let step = match step_minutes {
            Some(m) => m.clamp(MIN_SLOT_STEP_MINUTES, MAX_SLOT_STEP_MINUTES) as Ms * MINUTE_MS,
            None => duration,
        };

        let guard = st.read().await;
        Ok(slots_for_day(&guard, date, tz, duration, step, now))
    }

    /// Every booking (confirmed and cancelled), optionally for one staff member,
    /// ordered by start.
    pub async fn get_bookings(&self, staff_id: Option<Ulid>) -> Result<Vec<Booking>, EngineError> {
        let states: Vec<_> = match staff_id {
            Some(id) => vec![self.get_staff_state(&id).ok_or(EngineError::NotFound(id))?],
            None => self.staff.iter().map(|e| e.value().clone()).collect(),
        };
        let mut out = Vec::new();
        for st in states {
            let guard = st.read().await;
            out.extend(guard.bookings.iter().cloned());
            out.extend(guard.history.iter().cloned());
        }
        out.sort_by_key(|b| (b.span.start, b.id));
        Ok(out)
    }

    pub async fn get_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        let staff_id = self
            .get_staff_for_entity(&id)
            .ok_or(EngineError::NotFound(id))?;
        let st = self
            .get_staff_state(&staff_id)
            .ok_or(EngineError::NotFound(id))?;
        let guard = st.read().await;
        guard.find_booking(&id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// Confirmed bookings per local date over `[from, to]` (inclusive).
    /// Dates without bookings are omitted.
    pub async fn booking_density(
        &self,
        tz: Tz,
        from: NaiveDate,
        to: NaiveDate,
        staff_id: Option<Ulid>,
    ) -> Result<Vec<DensityRow>, EngineError> {
        validate_date(from)?;
        validate_date(to)?;
        if from > to {
            return Err(EngineError::Invalid("from must not be after to"));
        }
        if (to - from).num_days() + 1 > MAX_DENSITY_WINDOW_DAYS {
            return Err(EngineError::LimitExceeded("density window too wide"));
        }
        let window = Span::new(day_span(from, tz).start, day_span(to, tz).end);

        let states: Vec<_> = match staff_id {
            Some(id) => vec![self.get_staff_state(&id).ok_or(EngineError::NotFound(id))?],
            None => self.staff.iter().map(|e| e.value().clone()).collect(),
        };

        let mut counts: BTreeMap<NaiveDate, u32> = BTreeMap::new();
        for st in states {
            let guard = st.read().await;
            for b in guard.overlapping(&window) {
                if b.span.start < window.start {
                    continue;
                }
                if let Some(date) = local_date(tz, b.span.start) {
                    *counts.entry(date).or_default() += 1;
                }
            }
        }

        Ok(counts
            .into_iter()
            .map(|(date, count)| DensityRow { date, count })
            .collect())
    }
}
