use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{check_no_conflict, validate_span};
use super::{Engine, EngineError};

/// A reservation request as the ledger sees it: references already resolved
/// to this tenant, start already checked against the slot list.
#[derive(Debug, Clone)]
pub struct NewBooking {
    pub id: Ulid,
    pub staff_id: Ulid,
    pub service_id: Ulid,
    pub start: Ms,
    pub customer_name: String,
    pub customer_email: String,
}

impl Engine {
    /// Reserve `[start, start + service duration)` for a staff member.
    ///
    /// The overlap check, the WAL append and the in-memory insert all happen
    /// under the staff member's write lock, so of two overlapping requests
    /// exactly one wins and the other sees `Conflict`.
    pub async fn reserve(&self, req: NewBooking, now: Ms) -> Result<Booking, EngineError> {
        if req.customer_name.trim().is_empty() {
            return Err(EngineError::Invalid("customer name is empty"));
        }
        if req.customer_name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("customer name too long"));
        }
        if !req.customer_email.contains('@') {
            return Err(EngineError::Invalid("customer email is malformed"));
        }
        if req.customer_email.len() > MAX_EMAIL_LEN {
            return Err(EngineError::LimitExceeded("customer email too long"));
        }

        let service = self
            .get_service(&req.service_id)
            .ok_or(EngineError::NotFound(req.service_id))?;
        let span = Span::new(req.start, req.start + service.duration_ms());
        validate_span(&span)?;

        let st = self
            .get_staff_state(&req.staff_id)
            .ok_or(EngineError::NotFound(req.staff_id))?;
        let mut guard = st.write().await;
        // Removed while we waited for the lock.
        if !self.staff.contains_key(&req.staff_id) {
            return Err(EngineError::NotFound(req.staff_id));
        }
        if guard.bookings.len() >= MAX_BOOKINGS_PER_STAFF {
            return Err(EngineError::LimitExceeded("too many bookings on staff member"));
        }

        check_no_conflict(&guard, &span)?;

        let booking = Booking {
            id: req.id,
            tenant_id: self.tenant_id,
            staff_id: req.staff_id,
            service_id: req.service_id,
            customer_name: req.customer_name,
            customer_email: req.customer_email,
            span,
            status: BookingStatus::Confirmed,
            created_at: now,
        };
        // Booking ids are unique across staff members, whose locks are independent.
        self.claim_entity(booking.id, booking.staff_id)?;
        let event = Event::BookingConfirmed { booking: booking.clone() };
        if let Err(e) = self.persist_and_apply(booking.staff_id, &mut guard, &event).await {
            self.entity_to_staff.remove(&booking.id);
            return Err(e);
        }
        Ok(booking)
    }

    /// Soft-cancel a booking. Cancelling an already cancelled booking returns
    /// it unchanged without writing anything.
    pub async fn cancel_booking(&self, id: Ulid, now: Ms) -> Result<Booking, EngineError> {
        let (staff_id, mut guard) = self.resolve_entity_write(&id).await?;
        let existing = guard
            .find_booking(&id)
            .cloned()
            .ok_or(EngineError::NotFound(id))?;
        if !existing.is_confirmed() {
            return Ok(existing);
        }

        let event = Event::BookingCancelled { id, staff_id, at: now };
        self.persist_and_apply(staff_id, &mut guard, &event).await?;
        guard
            .find_booking(&id)
            .cloned()
            .ok_or(EngineError::NotFound(id))
    }
}
