//! The object registry and session tables.
//!
//! One registry per server process: live dataset handles keyed by stable
//! 128-bit ids with reference counts, in-flight subscriptions keyed by
//! call id, and client sessions holding at most one live subscription
//! each. Registry operations are infrequent relative to streaming
//! throughput, so a single mutex per manager suffices; handles are minted
//! from a per-process random seed plus a monotone counter and never
//! reused within a process lifetime.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use pdq_common::{global_metrics, CallId, ObjectId, PdqError, Result, SessionId};
use pdq_dataset::SubscriptionHandle;
use tracing::{debug, warn};

use crate::target::DataTarget;

struct ObjectEntry {
    target: Arc<dyn DataTarget>,
    refcount: u32,
}

struct SessionEntry {
    target: Option<ObjectId>,
    subscription: Option<SubscriptionHandle>,
}

struct ManagerState {
    objects: HashMap<ObjectId, ObjectEntry>,
    calls: HashMap<i64, SubscriptionHandle>,
    sessions: HashMap<SessionId, SessionEntry>,
    next_low: i64,
}

/// Thread-safe registry of live dataset handles, calls, and sessions.
pub struct RpcObjectManager {
    high_seed: i64,
    state: Mutex<ManagerState>,
}

impl RpcObjectManager {
    /// A fresh registry with a random per-process id seed.
    pub fn new() -> Self {
        let (seed, _) = uuid::Uuid::new_v4().as_u64_pair();
        let mut high_seed = seed as i64;
        // The zero high half is reserved for the well-known initial handle.
        if high_seed == 0 {
            high_seed = 1;
        }
        Self {
            high_seed,
            state: Mutex::new(ManagerState {
                objects: HashMap::new(),
                calls: HashMap::new(),
                sessions: HashMap::new(),
                next_low: 0,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ManagerState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Installs the well-known bootstrap handle at [`ObjectId::INITIAL`].
    pub fn install_initial(&self, target: Arc<dyn DataTarget>) -> ObjectId {
        let mut state = self.lock();
        let fresh = state
            .objects
            .insert(
                ObjectId::INITIAL,
                ObjectEntry {
                    target,
                    refcount: 1,
                },
            )
            .is_none();
        if fresh {
            global_metrics().adjust_registered_objects(1);
        }
        debug!("installed initial bootstrap handle");
        ObjectId::INITIAL
    }

    /// Registers a produced handle under a freshly minted id.
    pub fn insert(&self, target: Arc<dyn DataTarget>) -> ObjectId {
        let mut state = self.lock();
        state.next_low += 1;
        let id = ObjectId::new(self.high_seed, state.next_low);
        debug!(object = %id, target = %target.describe(), "registered dataset handle");
        state.objects.insert(
            id,
            ObjectEntry {
                target,
                refcount: 1,
            },
        );
        global_metrics().adjust_registered_objects(1);
        id
    }

    /// Looks up a live handle.
    pub fn lookup(&self, id: ObjectId) -> Result<Arc<dyn DataTarget>> {
        self.lock()
            .objects
            .get(&id)
            .map(|entry| entry.target.clone())
            .ok_or_else(|| PdqError::ObjectNotFound(format!("no dataset handle {id}")))
    }

    /// Adds one reference to a live handle.
    pub fn retain(&self, id: ObjectId) -> Result<()> {
        let mut state = self.lock();
        let entry = state
            .objects
            .get_mut(&id)
            .ok_or_else(|| PdqError::ObjectNotFound(format!("no dataset handle {id}")))?;
        entry.refcount += 1;
        Ok(())
    }

    /// Releases one reference; the handle is removed when the count hits
    /// zero. Returns whether the handle was removed.
    pub fn prune(&self, id: ObjectId) -> bool {
        let mut state = self.lock();
        match state.objects.get_mut(&id) {
            Some(entry) => {
                entry.refcount = entry.refcount.saturating_sub(1);
                if entry.refcount == 0 {
                    state.objects.remove(&id);
                    global_metrics().adjust_registered_objects(-1);
                    debug!(object = %id, "pruned dataset handle");
                    true
                } else {
                    false
                }
            }
            None => {
                warn!(object = %id, "prune for unknown handle");
                false
            }
        }
    }

    /// Removes a handle unconditionally.
    pub fn remove(&self, id: ObjectId) {
        if self.lock().objects.remove(&id).is_some() {
            global_metrics().adjust_registered_objects(-1);
        }
    }

    /// Number of live handles.
    pub fn object_count(&self) -> usize {
        self.lock().objects.len()
    }

    /// Records an in-flight subscription under its call id. If the call
    /// was already unsubscribed before the producer started, the handle
    /// is disposed immediately.
    pub fn register_call(&self, call: CallId, handle: SubscriptionHandle) {
        let mut state = self.lock();
        let tombstoned = state
            .calls
            .get(&call.0)
            .map(|existing| existing.is_disposed())
            .unwrap_or(false);
        if tombstoned {
            state.calls.remove(&call.0);
            drop(state);
            handle.dispose();
            debug!(%call, "call was unsubscribed before it started");
            return;
        }
        state.calls.insert(call.0, handle);
        global_metrics().adjust_active_subscriptions(1);
    }

    /// Frees a terminal call's subscription entry.
    pub fn finish_call(&self, call: CallId) {
        if self.lock().calls.remove(&call.0).is_some() {
            global_metrics().adjust_active_subscriptions(-1);
        }
    }

    /// Disposes the subscription registered under `call`. Returns whether
    /// a live subscription was found; an unknown call leaves a disposed
    /// marker so a late registration is cancelled on arrival.
    pub fn unsubscribe(&self, call: CallId) -> bool {
        let mut state = self.lock();
        match state.calls.entry(call.0) {
            std::collections::hash_map::Entry::Occupied(entry) => {
                entry.get().dispose();
                debug!(%call, "disposed in-flight subscription");
                true
            }
            std::collections::hash_map::Entry::Vacant(entry) => {
                entry.insert(SubscriptionHandle::disposed());
                false
            }
        }
    }

    /// Number of registered, not-yet-disposed subscriptions.
    pub fn live_subscriptions(&self) -> usize {
        self.lock()
            .calls
            .values()
            .filter(|handle| !handle.is_disposed())
            .count()
    }

    /// Opens a client session.
    pub fn add_session(&self, session: SessionId) {
        let mut state = self.lock();
        state.sessions.insert(
            session,
            SessionEntry {
                target: None,
                subscription: None,
            },
        );
        global_metrics().adjust_open_sessions(1);
    }

    /// Closes a session, disposing any live subscription it holds.
    pub fn remove_session(&self, session: &SessionId) {
        let entry = self.lock().sessions.remove(session);
        if let Some(entry) = entry {
            if let Some(subscription) = entry.subscription {
                subscription.dispose();
            }
            global_metrics().adjust_open_sessions(-1);
        }
    }

    /// Claims the session's single in-flight slot for a new operation.
    pub fn begin_session_call(
        &self,
        session: &SessionId,
        handle: SubscriptionHandle,
    ) -> Result<()> {
        let mut state = self.lock();
        let entry = state
            .sessions
            .get_mut(session)
            .ok_or_else(|| PdqError::ObjectNotFound(format!("no session {session}")))?;
        if let Some(existing) = &entry.subscription {
            if !existing.is_disposed() {
                return Err(PdqError::SessionBusy(format!(
                    "session {session} already has an in-flight operation"
                )));
            }
        }
        entry.subscription = Some(handle);
        Ok(())
    }

    /// Releases the session's in-flight slot.
    pub fn end_session_call(&self, session: &SessionId) {
        if let Some(entry) = self.lock().sessions.get_mut(session) {
            entry.subscription = None;
        }
    }

    /// The session's live subscription, if any.
    pub fn session_subscription(&self, session: &SessionId) -> Option<SubscriptionHandle> {
        self.lock()
            .sessions
            .get(session)
            .and_then(|entry| entry.subscription.clone())
    }

    /// Associates a dataset handle with the session for follow-up
    /// operations.
    pub fn set_session_target(&self, session: &SessionId, target: ObjectId) {
        if let Some(entry) = self.lock().sessions.get_mut(session) {
            entry.target = Some(target);
        }
    }

    /// The session's associated dataset handle.
    pub fn session_target(&self, session: &SessionId) -> Option<ObjectId> {
        self.lock()
            .sessions
            .get(session)
            .and_then(|entry| entry.target)
    }
}

impl Default for RpcObjectManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pdq_dataset::DataSet;

    use crate::target::{OpLibrary, TypedTarget};

    fn target() -> Arc<dyn DataTarget> {
        TypedTarget::wrap(DataSet::local(1i64), Arc::new(OpLibrary::new()))
    }

    #[test]
    fn minted_ids_are_unique_and_resolvable() {
        let manager = RpcObjectManager::new();
        let a = manager.insert(target());
        let b = manager.insert(target());
        assert_ne!(a, b);
        assert!(manager.lookup(a).is_ok());
        assert!(manager.lookup(b).is_ok());
        assert!(matches!(
            manager.lookup(ObjectId::new(7, 7)),
            Err(PdqError::ObjectNotFound(_))
        ));
    }

    #[test]
    fn prune_removes_only_at_zero_refcount() {
        let manager = RpcObjectManager::new();
        let id = manager.insert(target());
        manager.retain(id).expect("retain");
        assert!(!manager.prune(id));
        assert!(manager.lookup(id).is_ok());
        assert!(manager.prune(id));
        assert!(manager.lookup(id).is_err());
    }

    #[test]
    fn unsubscribe_before_registration_leaves_tombstone() {
        let manager = RpcObjectManager::new();
        let call = CallId(99);
        assert!(!manager.unsubscribe(call));
        let handle = SubscriptionHandle::from_token(Default::default());
        manager.register_call(call, handle.clone());
        assert!(handle.is_disposed());
        assert_eq!(manager.live_subscriptions(), 0);
    }

    #[test]
    fn session_allows_one_in_flight_call() {
        let manager = RpcObjectManager::new();
        let session = SessionId::mint();
        manager.add_session(session.clone());

        let first = SubscriptionHandle::from_token(Default::default());
        manager
            .begin_session_call(&session, first.clone())
            .expect("first call");
        let second = SubscriptionHandle::from_token(Default::default());
        assert!(matches!(
            manager.begin_session_call(&session, second),
            Err(PdqError::SessionBusy(_))
        ));
        // The first operation is untouched by the rejection.
        assert!(!first.is_disposed());

        manager.end_session_call(&session);
        let third = SubscriptionHandle::from_token(Default::default());
        manager
            .begin_session_call(&session, third)
            .expect("after release");
    }

    #[test]
    fn removing_session_disposes_its_subscription() {
        let manager = RpcObjectManager::new();
        let session = SessionId::mint();
        manager.add_session(session.clone());
        let handle = SubscriptionHandle::from_token(Default::default());
        manager
            .begin_session_call(&session, handle.clone())
            .expect("begin");
        manager.remove_session(&session);
        assert!(handle.is_disposed());
    }
}
