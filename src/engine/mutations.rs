use std::sync::Arc;

use tokio::sync::{oneshot, RwLock};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::validate_date;
use super::{Engine, EngineError, WalCommand};

fn check_len(value: &str, max: usize, what: &'static str) -> Result<(), EngineError> {
    if value.len() > max {
        return Err(EngineError::LimitExceeded(what));
    }
    Ok(())
}

fn check_url(url: &Option<String>) -> Result<(), EngineError> {
    if let Some(u) = url {
        check_len(u, MAX_URL_LEN, "url too long")?;
    }
    Ok(())
}

impl Engine {
    /// Create or replace a service. Existing bookings keep their original span.
    pub async fn upsert_service(&self, service: Service) -> Result<Service, EngineError> {
        if service.name.trim().is_empty() {
            return Err(EngineError::Invalid("service name is empty"));
        }
        check_len(&service.name, MAX_NAME_LEN, "service name too long")?;
        if service.duration_minutes == 0 {
            return Err(EngineError::Invalid("service duration must be positive"));
        }
        if service.duration_minutes > MAX_SERVICE_DURATION_MINUTES {
            return Err(EngineError::LimitExceeded("service duration too long"));
        }
        if service.price_cents < 0 {
            return Err(EngineError::Invalid("price must not be negative"));
        }

        let _catalog = self.catalog_lock.lock().await;
        if !self.services.contains_key(&service.id)
            && self.services.len() >= MAX_SERVICES_PER_TENANT
        {
            return Err(EngineError::LimitExceeded("too many services"));
        }
        let event = Event::ServiceUpserted { service: service.clone() };
        self.wal_append(&event).await?;
        self.services.insert(service.id, service.clone());
        Ok(service)
    }

    pub async fn remove_service(&self, id: Ulid) -> Result<Service, EngineError> {
        let _catalog = self.catalog_lock.lock().await;
        let service = self.get_service(&id).ok_or(EngineError::NotFound(id))?;
        self.wal_append(&Event::ServiceRemoved { id }).await?;
        self.services.remove(&id);
        Ok(service)
    }

    pub async fn create_staff(
        &self,
        id: Ulid,
        name: String,
        title: String,
        photo_url: Option<String>,
    ) -> Result<StaffMember, EngineError> {
        if name.trim().is_empty() {
            return Err(EngineError::Invalid("staff name is empty"));
        }
        check_len(&name, MAX_NAME_LEN, "staff name too long")?;
        check_len(&title, MAX_NAME_LEN, "staff title too long")?;
        check_url(&photo_url)?;

        let _catalog = self.catalog_lock.lock().await;
        if self.staff.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        if self.staff.len() >= MAX_STAFF_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many staff members"));
        }

        let member = StaffMember {
            id,
            name,
            title,
            photo_url,
            availability: Vec::new(),
        };
        let event = Event::StaffCreated { member: member.clone() };
        self.wal_append(&event).await?;
        self.staff
            .insert(id, Arc::new(RwLock::new(StaffState::new(member.clone()))));
        self.notify.send(id, &event);
        Ok(member)
    }

    pub async fn update_staff(
        &self,
        id: Ulid,
        name: String,
        title: String,
        photo_url: Option<String>,
    ) -> Result<StaffMember, EngineError> {
        if name.trim().is_empty() {
            return Err(EngineError::Invalid("staff name is empty"));
        }
        check_len(&name, MAX_NAME_LEN, "staff name too long")?;
        check_len(&title, MAX_NAME_LEN, "staff title too long")?;
        check_url(&photo_url)?;

        let st = self.get_staff_state(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = st.write().await;
        let event = Event::StaffUpdated { id, name, title, photo_url };
        self.persist_and_apply(id, &mut guard, &event).await?;
        Ok(guard.member.clone())
    }

    /// Refused while the staff member still has confirmed bookings ending after `now`.
    pub async fn remove_staff(&self, id: Ulid, now: Ms) -> Result<(), EngineError> {
        let _catalog = self.catalog_lock.lock().await;
        let st = self.get_staff_state(&id).ok_or(EngineError::NotFound(id))?;
        let guard = st.write().await;
        if guard.bookings.iter().any(|b| b.span.end > now) {
            return Err(EngineError::HasBookings(id));
        }

        let event = Event::StaffRemoved { id };
        self.wal_append(&event).await?;
        self.notify.send(id, &event);
        // Unmapped before the lock is released so a queued writer sees it gone.
        self.forget_staff(&id);
        drop(guard);
        Ok(())
    }

    pub async fn set_availability(
        &self,
        staff_id: Ulid,
        rule: AvailabilityRule,
    ) -> Result<AvailabilityRule, EngineError> {
        if rule.is_working && rule.start_time >= rule.end_time {
            return Err(EngineError::Invalid("start_time must be before end_time"));
        }
        let st = self
            .get_staff_state(&staff_id)
            .ok_or(EngineError::NotFound(staff_id))?;
        let mut guard = st.write().await;
        let event = Event::AvailabilitySet { staff_id, rule };
        self.persist_and_apply(staff_id, &mut guard, &event).await?;
        Ok(rule)
    }

    pub async fn add_time_off(&self, time_off: TimeOff) -> Result<TimeOff, EngineError> {
        validate_date(time_off.start_date)?;
        validate_date(time_off.end_date)?;
        if time_off.start_date > time_off.end_date {
            return Err(EngineError::Invalid("start_date must not be after end_date"));
        }
        let days = (time_off.end_date - time_off.start_date).num_days() + 1;
        if days > MAX_TIME_OFF_DAYS {
            return Err(EngineError::LimitExceeded("time off too long"));
        }
        if time_off.start_date == time_off.end_date
            && let (Some(s), Some(e)) = (time_off.start_time, time_off.end_time)
            && s >= e
        {
            return Err(EngineError::Invalid("start_time must be before end_time"));
        }
        if let Some(ref r) = time_off.reason {
            check_len(r, MAX_TEXT_LEN, "reason too long")?;
        }
        let staff_id = time_off.staff_id;
        let st = self
            .get_staff_state(&staff_id)
            .ok_or(EngineError::NotFound(staff_id))?;
        let mut guard = st.write().await;
        if guard.time_off.len() >= MAX_TIME_OFF_PER_STAFF {
            return Err(EngineError::LimitExceeded("too many time off entries"));
        }
        self.claim_entity(time_off.id, staff_id)?;
        let event = Event::TimeOffAdded { time_off: time_off.clone() };
        if let Err(e) = self.persist_and_apply(staff_id, &mut guard, &event).await {
            self.entity_to_staff.remove(&time_off.id);
            return Err(e);
        }
        Ok(time_off)
    }

    pub async fn remove_time_off(&self, id: Ulid) -> Result<TimeOff, EngineError> {
        let (staff_id, mut guard) = self.resolve_entity_write(&id).await?;
        let existing = guard
            .time_off
            .iter()
            .find(|t| t.id == id)
            .cloned()
            .ok_or(EngineError::NotFound(id))?;
        let event = Event::TimeOffRemoved { id, staff_id };
        self.persist_and_apply(staff_id, &mut guard, &event).await?;
        Ok(existing)
    }

    /// Rewrite the WAL with only the events needed to recreate the current state.
    ///
    /// Holds the catalog lock and every staff read lock until the writer has
    /// swapped files, so no acknowledged write can fall between snapshot and swap.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _catalog = self.catalog_lock.lock().await;
        let mut events = Vec::new();

        let mut services: Vec<Service> = self.services.iter().map(|e| e.value().clone()).collect();
        services.sort_by_key(|s| s.id);
        events.extend(services.into_iter().map(|service| Event::ServiceUpserted { service }));

        let mut staff: Vec<_> = self
            .staff
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        staff.sort_by_key(|(id, _)| *id);

        let mut guards = Vec::with_capacity(staff.len());
        for (_, st) in staff {
            guards.push(st.read_owned().await);
        }

        for guard in &guards {
            events.push(Event::StaffCreated { member: guard.member.clone() });
            for t in &guard.time_off {
                events.push(Event::TimeOffAdded { time_off: t.clone() });
            }
            for b in guard.bookings.iter().chain(guard.history.iter()) {
                events.push(Event::BookingConfirmed { booking: b.clone() });
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
