mod availability;
mod conflict;
mod error;
mod ledger;
mod mutations;
mod queries;
#[cfg(test)]
mod tests;

pub use availability::{
    day_span, free_windows, generate_slots, local_date, local_to_ms, merge_overlapping,
    slots_for_day, subtract_intervals, time_off_span, working_window,
};
pub use conflict::now_ms;
pub use error::EngineError;
pub use ledger::NewBooking;
pub use queries::DensityRow;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedStaffState = Arc<RwLock<StaffState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders with the shared result.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE)
                    .record(batch.len() as f64);
                let flush_start = std::time::Instant::now();
                let result = flush_batch(&mut wal, &batch);
                metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                    .record(flush_start.elapsed().as_secs_f64());
                respond_batch(batch, &result);

                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

/// Commit the whole batch or none of it. On any error the log is truncated
/// back to where the batch started, so no caller told "failed" reappears on replay.
fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event))
        .and_then(|()| wal.flush_sync());
    if let Err(ref e) = result {
        tracing::error!(path = %wal.path().display(), events = batch.len(), "WAL batch failed: {e}");
        wal.rollback_logged();
    }
    result
}

fn respond_batch(batch: Vec<(Event, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the caller"),
    }
}

/// One tenant's services, staff calendars and bookings, backed by its own WAL.
pub struct Engine {
    pub tenant_id: Ulid,
    pub(super) services: DashMap<Ulid, Service>,
    pub(super) staff: DashMap<Ulid, SharedStaffState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    /// Reverse lookup: booking / time-off id → staff id.
    pub(super) entity_to_staff: DashMap<Ulid, Ulid>,
    /// Serializes catalog-level changes (services, staff membership) and compaction.
    pub(super) catalog_lock: Mutex<()>,
}

/// Apply an event to a staff member's state (no locking, the caller holds the lock).
fn apply_to_staff(st: &mut StaffState, event: &Event, entity_map: &DashMap<Ulid, Ulid>) {
    match event {
        Event::StaffUpdated { name, title, photo_url, .. } => {
            st.member.name = name.clone();
            st.member.title = title.clone();
            st.member.photo_url = photo_url.clone();
        }
        Event::AvailabilitySet { rule, .. } => st.member.set_rule(*rule),
        Event::TimeOffAdded { time_off } => {
            st.insert_time_off(time_off.clone());
            entity_map.insert(time_off.id, time_off.staff_id);
        }
        Event::TimeOffRemoved { id, .. } => {
            st.remove_time_off(*id);
            entity_map.remove(id);
        }
        Event::BookingConfirmed { booking } => match booking.status {
            BookingStatus::Confirmed => {
                if let Some(existing) = st.overlapping(&booking.span).next() {
                    tracing::warn!(
                        booking = %booking.id,
                        existing = %existing.id,
                        "skipping confirmed booking that overlaps an existing one"
                    );
                    return;
                }
                entity_map.insert(booking.id, booking.staff_id);
                st.insert_booking(booking.clone());
            }
            // Compacted history
            BookingStatus::Cancelled { .. } => {
                entity_map.insert(booking.id, booking.staff_id);
                st.history.push(booking.clone());
            }
        },
        Event::BookingCancelled { id, at, .. } => {
            // Cancelled bookings stay addressable for history lookups.
            st.cancel_booking(*id, *at);
        }
        // Creation/removal of staff and services are handled at the map level.
        Event::StaffCreated { .. }
        | Event::StaffRemoved { .. }
        | Event::ServiceUpserted { .. }
        | Event::ServiceRemoved { .. } => {}
    }
}

impl Engine {
    pub fn new(tenant_id: Ulid, wal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        let events: Vec<Event> = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            tenant_id,
            services: DashMap::new(),
            staff: DashMap::new(),
            wal_tx,
            notify,
            entity_to_staff: DashMap::new(),
            catalog_lock: Mutex::new(()),
        };

        // Replay: we're the sole owner of these Arcs, so try_write always
        // succeeds instantly. Never block here; this may run inside an async
        // context (lazy tenant load).
        for event in &events {
            match event {
                Event::ServiceUpserted { service } => {
                    engine.services.insert(service.id, service.clone());
                }
                Event::ServiceRemoved { id } => {
                    engine.services.remove(id);
                }
                Event::StaffCreated { member } => {
                    let st = StaffState::new(member.clone());
                    engine.staff.insert(member.id, Arc::new(RwLock::new(st)));
                }
                Event::StaffRemoved { id } => {
                    engine.forget_staff(id);
                }
                other => {
                    if let Some(staff_id) = other.staff_id()
                        && let Some(entry) = engine.staff.get(&staff_id) {
                            let st = entry.clone();
                            let mut guard = st.try_write().expect("replay: uncontended write");
                            apply_to_staff(&mut guard, other, &engine.entity_to_staff);
                        }
                }
            }
        }

        tracing::debug!(
            tenant = %tenant_id,
            events = events.len(),
            staff = engine.staff.len(),
            services = engine.services.len(),
            "engine replayed"
        );
        Ok(engine)
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_staff_state(&self, id: &Ulid) -> Option<SharedStaffState> {
        self.staff.get(id).map(|e| e.value().clone())
    }

    pub fn get_staff_for_entity(&self, entity_id: &Ulid) -> Option<Ulid> {
        self.entity_to_staff.get(entity_id).map(|e| *e.value())
    }

    /// WAL-append + apply + notify. Nothing is applied if the append fails.
    pub(super) async fn persist_and_apply(
        &self,
        staff_id: Ulid,
        st: &mut StaffState,
        event: &Event,
    ) -> Result<(), EngineError> {
        // Removed while the caller waited for the lock.
        if !self.staff.contains_key(&staff_id) {
            return Err(EngineError::NotFound(staff_id));
        }
        self.wal_append(event).await?;
        apply_to_staff(st, event, &self.entity_to_staff);
        self.notify.send(staff_id, event);
        Ok(())
    }

    /// Lookup entity → staff member, acquire that staff member's write lock.
    pub(super) async fn resolve_entity_write(
        &self,
        entity_id: &Ulid,
    ) -> Result<(Ulid, tokio::sync::OwnedRwLockWriteGuard<StaffState>), EngineError> {
        let staff_id = self
            .get_staff_for_entity(entity_id)
            .ok_or(EngineError::NotFound(*entity_id))?;
        let st = self
            .get_staff_state(&staff_id)
            .ok_or(EngineError::NotFound(staff_id))?;
        Ok((staff_id, st.write_owned().await))
    }

    /// Take `id` in the reverse index for `staff_id`, failing if anyone owns it.
    pub(super) fn claim_entity(&self, id: Ulid, staff_id: Ulid) -> Result<(), EngineError> {
        match self.entity_to_staff.entry(id) {
            Entry::Occupied(_) => Err(EngineError::AlreadyExists(id)),
            Entry::Vacant(slot) => {
                slot.insert(staff_id);
                Ok(())
            }
        }
    }

    /// Drop a staff member and every index entry pointing at them.
    pub(super) fn forget_staff(&self, id: &Ulid) {
        self.staff.remove(id);
        self.entity_to_staff.retain(|_, owner| owner != id);
        self.notify.remove(id);
    }
}
