//! Server-side id assignment and liveness bookkeeping.
//!
//! Every tracked object gets an id the first time it is serialized by
//! reference. A record holds a strong handle to the object, the time it was
//! last referenced or pinged, and the sessions subscribed to its events.
//! Ids are never reused.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;

use crate::error::{LiveObjError, Result};
use crate::protocol::ObjectId;
use crate::value::Object;

/// Id of a connected session.
pub type AgentId = u64;

#[derive(Debug, Clone, Copy)]
enum Liveness {
    /// Kept until unpinned (root and named objects).
    Pinned,
    Touched(Instant),
}

struct ObjectRecord {
    object: Object,
    liveness: Liveness,
    subscriptions: HashMap<String, HashSet<AgentId>>,
}

#[derive(Default)]
struct DirectoryState {
    records: HashMap<ObjectId, ObjectRecord>,
    by_key: HashMap<usize, ObjectId>,
    next_id: ObjectId,
}

impl DirectoryState {
    fn id_or_insert(&mut self, object: &Object, liveness: Liveness) -> ObjectId {
        if let Some(&id) = self.by_key.get(&object.key()) {
            if let Some(record) = self.records.get_mut(&id) {
                record.liveness = match (record.liveness, liveness) {
                    (Liveness::Pinned, _) | (_, Liveness::Pinned) => Liveness::Pinned,
                    (_, touched) => touched,
                };
            }
            return id;
        }

        let id = self.next_id;
        self.next_id += 1;
        self.by_key.insert(object.key(), id);
        self.records.insert(
            id,
            ObjectRecord {
                object: object.clone(),
                liveness,
                subscriptions: HashMap::new(),
            },
        );
        id
    }
}

/// Id table shared by all sessions of a server.
#[derive(Default)]
pub struct ObjectDirectory {
    state: Mutex<DirectoryState>,
}

impl ObjectDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, DirectoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Id of `object`, assigning one if it has none. Refreshes its liveness.
    pub fn record_of(&self, object: &Object) -> ObjectId {
        self.lock()
            .id_or_insert(object, Liveness::Touched(Instant::now()))
    }

    /// Assign an id that survives every collection until [`Self::unpin`].
    pub fn pin(&self, object: &Object) -> ObjectId {
        self.lock().id_or_insert(object, Liveness::Pinned)
    }

    pub fn unpin(&self, id: ObjectId) {
        if let Some(record) = self.lock().records.get_mut(&id) {
            record.liveness = Liveness::Touched(Instant::now());
        }
    }

    /// Resolve an id; a hit counts as a reference.
    pub fn by_id(&self, id: ObjectId) -> Option<Object> {
        let mut state = self.lock();
        let record = state.records.get_mut(&id)?;
        if let Liveness::Touched(_) = record.liveness {
            record.liveness = Liveness::Touched(Instant::now());
        }
        Some(record.object.clone())
    }

    pub fn id_of(&self, object: &Object) -> Option<ObjectId> {
        self.lock().by_key.get(&object.key()).copied()
    }

    pub fn contains(&self, id: ObjectId) -> bool {
        self.lock().records.contains_key(&id)
    }

    /// Refresh liveness for a ping. Returns false for unknown ids.
    pub fn touch(&self, id: ObjectId) -> bool {
        match self.lock().records.get_mut(&id) {
            Some(record) => {
                if let Liveness::Touched(_) = record.liveness {
                    record.liveness = Liveness::Touched(Instant::now());
                }
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sorted ids of every tracked object.
    pub fn ids(&self) -> Vec<ObjectId> {
        let mut ids: Vec<_> = self.lock().records.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Pinned objects, the starting points of the reachability walk.
    pub fn roots(&self) -> Vec<Object> {
        self.lock()
            .records
            .values()
            .filter(|r| matches!(r.liveness, Liveness::Pinned))
            .map(|r| r.object.clone())
            .collect()
    }

    // ========================================================================
    // Subscriptions
    // ========================================================================

    pub fn subscribe(&self, id: ObjectId, event: &str, agent: AgentId) -> Result<()> {
        let mut state = self.lock();
        let record = state
            .records
            .get_mut(&id)
            .ok_or(LiveObjError::UnknownReference { id })?;
        record
            .subscriptions
            .entry(event.to_string())
            .or_default()
            .insert(agent);
        Ok(())
    }

    /// Returns true if a subscription was removed.
    pub fn unsubscribe(&self, id: ObjectId, event: &str, agent: AgentId) -> bool {
        let mut state = self.lock();
        let Some(record) = state.records.get_mut(&id) else {
            return false;
        };
        let Some(agents) = record.subscriptions.get_mut(event) else {
            return false;
        };
        let removed = agents.remove(&agent);
        if agents.is_empty() {
            record.subscriptions.remove(event);
        }
        removed
    }

    /// Sorted sessions subscribed to `event` on `id`.
    pub fn subscribers(&self, id: ObjectId, event: &str) -> Vec<AgentId> {
        let state = self.lock();
        let mut agents: Vec<_> = state
            .records
            .get(&id)
            .and_then(|r| r.subscriptions.get(event))
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default();
        agents.sort_unstable();
        agents
    }

    /// Drop every subscription held by a closed session.
    pub fn remove_agent(&self, agent: AgentId) {
        let mut state = self.lock();
        for record in state.records.values_mut() {
            record.subscriptions.retain(|_, agents| {
                agents.remove(&agent);
                !agents.is_empty()
            });
        }
    }

    // ========================================================================
    // Collection
    // ========================================================================

    /// Forget every record that is not pinned, not in `reachable`, and not
    /// referenced within `timeout`. Returns the sorted surviving ids.
    pub fn sweep(&self, reachable: &HashSet<ObjectId>, timeout: Duration) -> Vec<ObjectId> {
        let now = Instant::now();
        let mut state = self.lock();

        let expired: Vec<ObjectId> = state
            .records
            .iter()
            .filter(|(id, record)| match record.liveness {
                Liveness::Pinned => false,
                Liveness::Touched(at) => {
                    !reachable.contains(id) && now.duration_since(at) > timeout
                }
            })
            .map(|(id, _)| *id)
            .collect();

        for id in expired {
            if let Some(record) = state.records.remove(&id) {
                state.by_key.remove(&record.object.key());
            }
        }

        let mut alive: Vec<_> = state.records.keys().copied().collect();
        alive.sort_unstable();
        alive
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Instance;

    fn thing() -> Object {
        Object::new(Instance::new("Thing"))
    }

    #[test]
    fn test_ids_are_stable_and_unique() {
        let dir = ObjectDirectory::new();
        let a = thing();
        let b = thing();

        let id_a = dir.record_of(&a);
        let id_b = dir.record_of(&b);
        assert_ne!(id_a, id_b);
        assert_eq!(dir.record_of(&a), id_a);
        assert_eq!(dir.id_of(&b), Some(id_b));
        assert!(dir.by_id(id_a).unwrap().ptr_eq(&a));
    }

    #[test]
    fn test_first_pin_gets_id_zero() {
        let dir = ObjectDirectory::new();
        let root = thing();
        assert_eq!(dir.pin(&root), 0);
        assert_eq!(dir.roots().len(), 1);
    }

    #[test]
    fn test_subscriptions() {
        let dir = ObjectDirectory::new();
        let obj = thing();
        let id = dir.record_of(&obj);

        dir.subscribe(id, "tick", 2).unwrap();
        dir.subscribe(id, "tick", 1).unwrap();
        dir.subscribe(id, "tick", 1).unwrap();
        assert_eq!(dir.subscribers(id, "tick"), vec![1, 2]);
        assert!(dir.subscribers(id, "tock").is_empty());

        assert!(dir.unsubscribe(id, "tick", 1));
        assert!(!dir.unsubscribe(id, "tick", 1));
        assert_eq!(dir.subscribers(id, "tick"), vec![2]);

        dir.remove_agent(2);
        assert!(dir.subscribers(id, "tick").is_empty());

        match dir.subscribe(999, "tick", 1) {
            Err(LiveObjError::UnknownReference { id }) => assert_eq!(id, 999),
            other => panic!("Expected UnknownReference, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_respects_timeout_reachability_and_pins() {
        let dir = ObjectDirectory::new();
        let root = thing();
        let reachable_obj = thing();
        let stale = thing();
        let pinged = thing();

        let root_id = dir.pin(&root);
        let reachable_id = dir.record_of(&reachable_obj);
        let stale_id = dir.record_of(&stale);
        let pinged_id = dir.record_of(&pinged);

        tokio::time::advance(Duration::from_secs(100)).await;
        assert!(dir.touch(pinged_id));
        tokio::time::advance(Duration::from_secs(100)).await;

        let reachable = HashSet::from([reachable_id]);
        let alive = dir.sweep(&reachable, Duration::from_secs(180));

        assert_eq!(alive, vec![root_id, reachable_id, pinged_id]);
        assert!(!dir.contains(stale_id));
        assert!(dir.id_of(&stale).is_none());

        // a swept object gets a fresh id, never the old one
        let again = dir.record_of(&stale);
        assert!(again > pinged_id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unpin_makes_collectable() {
        let dir = ObjectDirectory::new();
        let obj = thing();
        let id = dir.pin(&obj);

        dir.unpin(id);
        tokio::time::advance(Duration::from_secs(10)).await;
        let alive = dir.sweep(&HashSet::new(), Duration::from_secs(5));
        assert!(alive.is_empty());
    }
}
