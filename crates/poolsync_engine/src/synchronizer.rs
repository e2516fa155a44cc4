//! Full load plus the incremental event poll loop.

use crate::error::{EngineError, EngineResult};
use crate::membership::MembershipTracker;
use crate::transport::{LongPoll, Transport};
use parking_lot::{Mutex, RwLock};
use poolsync_core::{ObjectKey, ObjectStore};
use poolsync_protocol::{
    Event, EventBatch, EventOperation, ObjectRecord, ObjectRef, ObjectType, ProtocolError,
    SyncToken, Value,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

/// Notification published on the connection's broadcast channel.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncNotice {
    /// A full load finished.
    Reloaded {
        /// Objects loaded.
        objects: usize,
        /// Token the poll loop starts from.
        token: SyncToken,
    },
    /// One event was applied to the store.
    Applied {
        /// Event id.
        id: u64,
        /// Class of the target.
        class: ObjectType,
        /// Target object.
        reference: ObjectRef,
        /// What happened.
        operation: EventOperation,
    },
    /// An event was not applied.
    Skipped {
        /// Why.
        reason: String,
    },
    /// The event stream stopped. The store is stale until a reconnect succeeds.
    ConnectionLost {
        /// Cause.
        reason: String,
    },
    /// A reconnect succeeded and the store was reloaded.
    Reconnected {
        /// Address now connected to.
        address: String,
    },
}

/// Counters for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStats {
    /// Completed full loads.
    pub full_loads: u64,
    /// Non-empty poll responses.
    pub batches: u64,
    /// Events applied.
    pub applied: u64,
    /// Events skipped, malformed or out of order.
    pub skipped: u64,
    /// Long polls that returned nothing.
    pub timeouts: u64,
}

/// Outcome of one poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollStep {
    /// A batch arrived and the token advanced.
    Applied {
        /// Events applied.
        applied: usize,
        /// Events skipped.
        skipped: usize,
    },
    /// Nothing new; the token is unchanged.
    TimedOut,
}

/// Why the poll loop stopped.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncExit {
    /// The owner asked it to stop.
    Shutdown,
    /// The session or transport failed; a reconnect and full load are needed.
    ConnectionLost(EngineError),
}

/// Applies one event to a store.
///
/// `Added`/`Modified` put the snapshot; `Deleted` removes the target, which is
/// a no-op if the target is unknown. Returns false if the store refused it.
pub fn apply_event(store: &ObjectStore, event: &Event) -> bool {
    match event.operation {
        EventOperation::Added | EventOperation::Modified => match &event.snapshot {
            Some(snapshot) => store.put(event.class.clone(), event.target.clone(), snapshot.clone()),
            None => false,
        },
        EventOperation::Deleted => {
            store.remove(&event.class, &event.target);
            true
        }
    }
}

/// Keeps an [`ObjectStore`] current for one connection epoch.
///
/// A synchronizer is built per session. Its tokens carry the session's epoch
/// and it refuses to poll with a token from any other.
pub struct EventSynchronizer {
    store: Arc<ObjectStore>,
    transport: Transport,
    classes: Vec<ObjectType>,
    poll_timeout: Duration,
    epoch: u64,
    token: RwLock<Option<SyncToken>>,
    /// Highest event id applied per object, for the ordering guard.
    last_applied: Mutex<HashMap<ObjectKey, u64>>,
    stats: Mutex<SyncStats>,
    notices: broadcast::Sender<SyncNotice>,
    membership: Arc<MembershipTracker>,
}

impl EventSynchronizer {
    /// Creates a synchronizer.
    pub fn new(
        store: Arc<ObjectStore>,
        transport: Transport,
        classes: Vec<ObjectType>,
        poll_timeout: Duration,
        epoch: u64,
        notices: broadcast::Sender<SyncNotice>,
        membership: Arc<MembershipTracker>,
    ) -> Self {
        Self {
            store,
            transport,
            classes,
            poll_timeout,
            epoch,
            token: RwLock::new(None),
            last_applied: Mutex::new(HashMap::new()),
            stats: Mutex::new(SyncStats::default()),
            notices,
            membership,
        }
    }

    /// Returns the current token, if a full load has completed.
    pub fn token(&self) -> Option<SyncToken> {
        self.token.read().clone()
    }

    /// Resumes polling from a previously obtained token without a full load.
    ///
    /// The store is not touched. A token issued under another epoch is kept
    /// but the next poll refuses it with [`EngineError::ReloadRequired`].
    pub fn resume_from(&self, token: SyncToken) {
        debug!(%token, epoch = self.epoch, "resuming from token");
        *self.token.write() = Some(token);
    }

    /// Returns how many objects the ordering guard currently remembers.
    pub fn tracked_objects(&self) -> usize {
        self.last_applied.lock().len()
    }

    /// Returns the epoch this synchronizer's tokens belong to.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Returns a copy of the counters.
    pub fn stats(&self) -> SyncStats {
        *self.stats.lock()
    }

    /// Returns the transport the synchronizer polls through.
    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    fn notify(&self, notice: SyncNotice) {
        // No subscribers is fine.
        let _ = self.notices.send(notice);
    }

    fn classes_value(&self) -> Value {
        Value::Array(
            self.classes
                .iter()
                .map(|c| Value::from(c.wire_name().to_ascii_lowercase()))
                .collect(),
        )
    }

    /// Loads every tracked class, then obtains a token.
    ///
    /// Each class is installed with one atomic replace. The token call is made
    /// only after every class is loaded, so the token is never older than
    /// the snapshot.
    pub async fn full_load(&self) -> EngineResult<SyncToken> {
        self.token.write().take();
        self.last_applied.lock().clear();

        let mut objects = 0;
        for class in &self.classes {
            let value = self
                .transport
                .call(&class.get_all_records_method(), Vec::new())
                .await?;
            let map = value.as_map().ok_or(ProtocolError::UnexpectedShape {
                expected: "map of reference to record",
            })?;

            let mut records = Vec::with_capacity(map.len());
            for (reference, raw) in map {
                let Some(reference) = ObjectRef::parse(reference) else {
                    continue;
                };
                match ObjectRecord::from_value(class.clone(), raw) {
                    Ok(record) => records.push((reference, record)),
                    Err(error) => warn!(%class, %reference, %error, "skipping malformed record"),
                }
            }
            let loaded = self.store.replace_type(class.clone(), records);
            debug!(%class, loaded, "loaded class");
            objects += loaded;
        }

        let response = self
            .transport
            .call(
                "event.from",
                vec![Value::Array(Vec::new()), Value::from(""), Value::Float(0.0)],
            )
            .await?;
        let batch = EventBatch::from_value(&response)?;
        let token = SyncToken::new(batch.token, self.epoch);

        *self.token.write() = Some(token.clone());
        self.store.mark_fresh();
        self.membership.refresh(&self.store);
        self.stats.lock().full_loads += 1;

        info!(objects, %token, "full load complete");
        self.notify(SyncNotice::Reloaded {
            objects,
            token: token.clone(),
        });
        Ok(token)
    }

    /// Applies one event unless an event with a higher id has already been
    /// applied to the same object.
    fn apply_ordered(&self, event: &Event) -> bool {
        let key = ObjectKey::new(event.class.clone(), event.target.clone());
        let mut last_applied = self.last_applied.lock();
        if let Some(&last) = last_applied.get(&key) {
            if event.id < last {
                return false;
            }
        }
        if !apply_event(&self.store, event) {
            return false;
        }
        last_applied.insert(key, event.id);
        true
    }

    /// Issues one long poll and applies whatever it returns.
    ///
    /// A timed-out poll changes nothing. A batch is applied in id order and
    /// the token advances only after every event has been handled.
    pub async fn poll_once(&self) -> EngineResult<PollStep> {
        let token = self
            .token()
            .ok_or_else(|| EngineError::ReloadRequired("no token; full load has not completed".into()))?;
        if !token.is_issued_by(self.epoch) {
            return Err(EngineError::ReloadRequired(format!(
                "token {token} was issued by another connection"
            )));
        }

        let params = vec![
            self.classes_value(),
            Value::from(token.value()),
            Value::Float(self.poll_timeout.as_secs_f64()),
        ];
        let value = match self
            .transport
            .long_poll("event.from", params, self.poll_timeout)
            .await?
        {
            LongPoll::TimedOut => {
                self.stats.lock().timeouts += 1;
                return Ok(PollStep::TimedOut);
            }
            LongPoll::Ready(value) => value,
        };

        let batch = EventBatch::from_value(&value)?;
        let (events, errors) = batch.parse_events();
        let mut skipped = errors.len();
        for error in errors {
            warn!(%error, "skipping malformed event");
            self.notify(SyncNotice::Skipped {
                reason: error.to_string(),
            });
        }

        // Entries older than the whole batch cannot reject any of its events.
        if let Some(first) = events.first() {
            self.last_applied.lock().retain(|_, last| *last >= first.id);
        }

        let mut applied = 0;
        let mut membership_touched = false;
        for event in &events {
            if self.apply_ordered(event) {
                applied += 1;
                membership_touched |= event.class.affects_membership();
                self.notify(SyncNotice::Applied {
                    id: event.id,
                    class: event.class.clone(),
                    reference: event.target.clone(),
                    operation: event.operation,
                });
            } else {
                skipped += 1;
                debug!(id = event.id, class = %event.class, target = %event.target, "event not applied");
                self.notify(SyncNotice::Skipped {
                    reason: format!("event {} for {} not applied", event.id, event.target),
                });
            }
        }

        if membership_touched {
            self.membership.refresh(&self.store);
        }
        *self.token.write() = Some(token.advance(batch.token));

        let mut stats = self.stats.lock();
        if !batch.events.is_empty() {
            stats.batches += 1;
        }
        stats.applied += applied as u64;
        stats.skipped += skipped as u64;
        drop(stats);

        debug!(applied, skipped, "applied event batch");
        Ok(PollStep::Applied { applied, skipped })
    }

    /// Polls until told to stop or the connection fails.
    ///
    /// Failure is always announced with [`SyncNotice::ConnectionLost`] before
    /// this returns.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> SyncExit {
        loop {
            if *shutdown.borrow() {
                return SyncExit::Shutdown;
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!(epoch = self.epoch, "poll loop stopped");
                        return SyncExit::Shutdown;
                    }
                }
                step = self.poll_once() => {
                    if let Err(error) = step {
                        warn!(epoch = self.epoch, %error, "event stream lost");
                        self.store.mark_stale();
                        self.notify(SyncNotice::ConnectionLost {
                            reason: error.to_string(),
                        });
                        return SyncExit::ConnectionLost(error);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use poolsync_protocol::ObjectRecord;

    fn host(name: &str) -> ObjectRecord {
        ObjectRecord::new(ObjectType::Host).field("name_label", name)
    }

    fn r(s: &str) -> ObjectRef {
        ObjectRef::new(s)
    }

    #[test]
    fn apply_added_and_deleted() {
        let store = ObjectStore::new();
        assert!(apply_event(&store, &Event::added(1, r("OpaqueRef:h1"), host("a"))));
        assert!(store.contains(&ObjectType::Host, &r("OpaqueRef:h1")));

        assert!(apply_event(
            &store,
            &Event::deleted(2, ObjectType::Host, r("OpaqueRef:h1"))
        ));
        assert!(store.is_empty());
    }

    #[test]
    fn delete_of_unknown_is_noop() {
        let store = ObjectStore::new();
        store.put(ObjectType::Host, r("OpaqueRef:h1"), host("a"));
        let revision = store.revision();

        assert!(apply_event(
            &store,
            &Event::deleted(9, ObjectType::Host, r("OpaqueRef:ghost"))
        ));
        assert_eq!(store.total_len(), 1);
        assert_eq!(store.revision(), revision);
    }

    #[test]
    fn modified_without_snapshot_is_refused() {
        let store = ObjectStore::new();
        let mut event = Event::modified(1, r("OpaqueRef:h1"), host("a"));
        event.snapshot = None;
        assert!(!apply_event(&store, &event));
        assert!(store.is_empty());
    }
}
