use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::directory::DirectoryError;
use crate::engine::{local_date, now_ms, EngineError, NewBooking};
use crate::model::*;
use crate::tenant::TenantManager;

/// Counter: booking attempts. Labels: outcome.
pub const BOOKING_ATTEMPTS_TOTAL: &str = "chairbook_booking_attempts_total";

#[derive(Debug, thiserror::Error)]
pub enum BookingError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("slot unavailable")]
    SlotUnavailable,
    #[error("invalid reference: {0}")]
    InvalidReference(String),
    #[error("invalid request: {0}")]
    Invalid(String),
    #[error("storage failure: {0}")]
    StorageFailure(String),
}

impl BookingError {
    fn outcome(&self) -> &'static str {
        match self {
            BookingError::NotFound(_) => "not_found",
            BookingError::SlotUnavailable => "slot_unavailable",
            BookingError::InvalidReference(_) => "invalid_reference",
            BookingError::Invalid(_) => "invalid",
            BookingError::StorageFailure(_) => "storage_failure",
        }
    }
}

impl From<DirectoryError> for BookingError {
    fn from(e: DirectoryError) -> Self {
        match e {
            DirectoryError::NotFound(slug) => BookingError::NotFound(format!("tenant {slug:?}")),
            DirectoryError::Storage(msg) => BookingError::StorageFailure(msg),
            other => BookingError::Invalid(other.to_string()),
        }
    }
}

impl From<EngineError> for BookingError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::Conflict(_) => BookingError::SlotUnavailable,
            EngineError::NotFound(id) => BookingError::NotFound(id.to_string()),
            EngineError::WalError(msg) => BookingError::StorageFailure(msg),
            other => BookingError::Invalid(other.to_string()),
        }
    }
}

/// Runs after a booking is durably confirmed. Failures are logged, never
/// surfaced to the customer: the booking already exists.
#[async_trait]
pub trait BookingHook: Send + Sync {
    async fn on_booking_confirmed(&self, tenant: &Tenant, booking: &Booking) -> Result<(), String>;
}

/// One customer's booking request against a public subdomain.
#[derive(Debug, Clone)]
pub struct BookingRequest {
    pub tenant_slug: String,
    pub service_id: Ulid,
    pub staff_id: Ulid,
    /// Client-chosen id; a retry with the same id is refused, never doubled.
    pub booking_id: Ulid,
    pub start: Ms,
    pub customer_name: String,
    pub customer_email: String,
}

/// Orchestrates directory → calculator → ledger for a single request.
pub struct BookingService {
    tenants: Arc<TenantManager>,
    hooks: Vec<Arc<dyn BookingHook>>,
    clock: fn() -> Ms,
}

impl BookingService {
    pub fn new(tenants: Arc<TenantManager>) -> Self {
        Self {
            tenants,
            hooks: Vec::new(),
            clock: now_ms,
        }
    }

    /// Replace the wall clock. Slots before "now" are never offered.
    pub fn with_clock(mut self, clock: fn() -> Ms) -> Self {
        self.clock = clock;
        self
    }

    pub fn add_hook(&mut self, hook: Arc<dyn BookingHook>) {
        self.hooks.push(hook);
    }

    pub fn tenants(&self) -> &Arc<TenantManager> {
        &self.tenants
    }

    pub fn now(&self) -> Ms {
        (self.clock)()
    }

    /// Bookable slots for a staff member, a service and one local date.
    pub async fn available_slots(
        &self,
        slug: &str,
        staff_id: Ulid,
        service_id: Ulid,
        date: NaiveDate,
    ) -> Result<Vec<Span>, BookingError> {
        let (tenant, engine) = self.tenants.resolve(slug)?;
        if engine.get_service(&service_id).is_none() {
            return Err(BookingError::InvalidReference(format!("service {service_id}")));
        }
        if engine.get_staff_state(&staff_id).is_none() {
            return Err(BookingError::InvalidReference(format!("staff {staff_id}")));
        }
        let slots = engine
            .compute_slots(
                staff_id,
                service_id,
                date,
                tenant.timezone,
                tenant.slot_step_minutes,
                self.now(),
            )
            .await?;
        Ok(slots)
    }

    /// Book one slot. Either a confirmed booking is returned or nothing was written.
    pub async fn book(&self, req: BookingRequest) -> Result<Booking, BookingError> {
        debug!(
            tenant = %req.tenant_slug,
            staff = %req.staff_id,
            service = %req.service_id,
            start = req.start,
            "booking pending"
        );
        let result = self.try_book(&req).await;
        match &result {
            Ok((tenant, booking)) => {
                metrics::counter!(BOOKING_ATTEMPTS_TOTAL, "outcome" => "confirmed").increment(1);
                info!(tenant = %tenant.subdomain, booking = %booking.id, "booking confirmed");
            }
            Err(e) => {
                metrics::counter!(BOOKING_ATTEMPTS_TOTAL, "outcome" => e.outcome()).increment(1);
                match e {
                    BookingError::StorageFailure(_) => {
                        tracing::error!(tenant = %req.tenant_slug, booking = %req.booking_id, "booking rejected: {e}")
                    }
                    _ => warn!(tenant = %req.tenant_slug, booking = %req.booking_id, "booking rejected: {e}"),
                }
            }
        }
        let (tenant, booking) = result?;

        for hook in &self.hooks {
            if let Err(e) = hook.on_booking_confirmed(&tenant, &booking).await {
                warn!(booking = %booking.id, "booking hook failed: {e}");
            }
        }
        Ok(booking)
    }

    async fn try_book(&self, req: &BookingRequest) -> Result<(Tenant, Booking), BookingError> {
        let (tenant, engine) = self.tenants.resolve(&req.tenant_slug)?;

        if engine.get_service(&req.service_id).is_none() {
            return Err(BookingError::InvalidReference(format!("service {}", req.service_id)));
        }
        if engine.get_staff_state(&req.staff_id).is_none() {
            return Err(BookingError::InvalidReference(format!("staff {}", req.staff_id)));
        }

        let now = self.now();
        let date = local_date(tenant.timezone, req.start)
            .ok_or_else(|| BookingError::Invalid("start is out of range".into()))?;
        let slots = engine
            .compute_slots(
                req.staff_id,
                req.service_id,
                date,
                tenant.timezone,
                tenant.slot_step_minutes,
                now,
            )
            .await?;
        if !slots.iter().any(|s| s.start == req.start) {
            return Err(BookingError::SlotUnavailable);
        }

        // The slot list was computed under a read lock that is now released;
        // reserve re-checks overlap under the write lock.
        let booking = engine
            .reserve(
                NewBooking {
                    id: req.booking_id,
                    staff_id: req.staff_id,
                    service_id: req.service_id,
                    start: req.start,
                    customer_name: req.customer_name.clone(),
                    customer_email: req.customer_email.clone(),
                },
                now,
            )
            .await?;
        Ok((tenant, booking))
    }

    pub async fn cancel(&self, slug: &str, booking_id: Ulid) -> Result<Booking, BookingError> {
        let (tenant, engine) = self.tenants.resolve(slug)?;
        let booking = engine.cancel_booking(booking_id, self.now()).await?;
        info!(tenant = %tenant.subdomain, booking = %booking.id, "booking cancelled");
        Ok(booking)
    }
}
