//! The session registry.
//!
//! Two mappings over the same reference-counted sessions: one keyed by the
//! host's opaque handle (pointer identity), one keyed by the numeric session
//! id the script sees. Both are guarded by a single registry lock that is
//! held only for map mutation and lookup, never across a script call-in.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::host::HostHandle;
use crate::session::Session;

/// Pointer identity of a host handle, used as the map key.
fn handle_key(handle: &HostHandle) -> usize {
    Arc::as_ptr(handle) as *const () as usize
}

#[derive(Default)]
struct Maps {
    by_handle: HashMap<usize, Arc<Session>>,
    by_id: HashMap<u32, Arc<Session>>,
}

/// Thread-safe handle→session and id→session registry.
#[derive(Default)]
pub(crate) struct SessionRegistry {
    maps: Mutex<Maps>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Maps> {
        self.maps.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocate a session with a registry-unique random id and insert it
    /// into both mappings. Id 0 is reserved.
    pub fn insert(&self, handle: HostHandle) -> Arc<Session> {
        let mut maps = self.lock();
        let mut id = 0u32;
        while id == 0 || maps.by_id.contains_key(&id) {
            id = rand::random::<u32>();
        }
        let session = Arc::new(Session::new(id, handle));
        maps.by_handle.insert(handle_key(session.handle()), Arc::clone(&session));
        maps.by_id.insert(id, Arc::clone(&session));
        session
    }

    /// Look up by the host's opaque handle. Returns a fresh reference or
    /// nothing; never a destroyed session.
    pub fn by_handle(&self, handle: &HostHandle) -> Option<Arc<Session>> {
        self.lock()
            .by_handle
            .get(&handle_key(handle))
            .filter(|s| !s.is_destroyed())
            .cloned()
    }

    /// Look up by numeric session id.
    pub fn by_id(&self, id: u32) -> Option<Arc<Session>> {
        self.lock()
            .by_id
            .get(&id)
            .filter(|s| !s.is_destroyed())
            .cloned()
    }

    /// Remove both entries for `handle` and return the session, marking it
    /// destroyed. The session object lives on until its other reference
    /// holders (recipient relations, in-flight workers) let go.
    pub fn remove(&self, handle: &HostHandle) -> Option<Arc<Session>> {
        let mut maps = self.lock();
        let session = maps.by_handle.remove(&handle_key(handle))?;
        maps.by_id.remove(&session.id());
        session.mark_destroyed();
        Some(session)
    }

    /// Drop every entry. Shutdown only.
    pub fn clear(&self) {
        let mut maps = self.lock();
        for session in maps.by_id.values() {
            session.mark_destroyed();
        }
        maps.by_handle.clear();
        maps.by_id.clear();
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.lock().by_id.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::thread;

    fn new_handle() -> HostHandle {
        Arc::new(()) as HostHandle
    }

    #[test]
    fn lookups_agree_until_destroy_then_return_nothing() {
        let registry = SessionRegistry::new();
        let handle = new_handle();
        let session = registry.insert(Arc::clone(&handle));
        let id = session.id();

        let by_handle = registry.by_handle(&handle).expect("handle lookup");
        let by_id = registry.by_id(id).expect("id lookup");
        assert!(Arc::ptr_eq(&by_handle, &by_id));
        assert!(Arc::ptr_eq(&by_handle, &session));

        let removed = registry.remove(&handle).expect("remove");
        assert!(removed.is_destroyed());
        assert!(registry.by_handle(&handle).is_none());
        assert!(registry.by_id(id).is_none());
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn remove_unknown_handle_is_none() {
        let registry = SessionRegistry::new();
        assert!(registry.remove(&new_handle()).is_none());
    }

    #[test]
    fn concurrent_creates_never_assign_duplicate_ids() {
        let registry = Arc::new(SessionRegistry::new());
        let mut threads = Vec::new();
        for _ in 0..8 {
            let registry = Arc::clone(&registry);
            threads.push(thread::spawn(move || {
                (0..200)
                    .map(|_| registry.insert(new_handle()).id())
                    .collect::<Vec<u32>>()
            }));
        }
        let mut all = Vec::new();
        for t in threads {
            all.extend(t.join().expect("creator thread"));
        }
        let unique: HashSet<u32> = all.iter().copied().collect();
        assert_eq!(unique.len(), all.len());
        assert!(!unique.contains(&0));
        assert_eq!(registry.len(), all.len());
    }

    #[test]
    fn session_object_outlives_registry_entry() {
        let registry = SessionRegistry::new();
        let handle = new_handle();
        let session = registry.insert(Arc::clone(&handle));
        let held = Arc::clone(&session);
        registry.remove(&handle);
        // The held clone is still usable even though both lookups are gone.
        assert_eq!(held.id(), session.id());
        assert!(held.is_destroyed());
    }
}
