//! Fault injection for crash and conflict testing.
//!
//! [`FaultInjectingStore`] wraps any [`DocumentStore`] and can:
//!
//! 1. **Crash after N mutations** - every later call fails as if the process died
//! 2. **Fail transiently** - the next N mutations return a temporary error
//! 3. **Inject a CAS race** - the next mutation of a given key sees a stale CAS
//!
//! Mutations are `write` and `remove`; reads are never counted.
//!
//! ## Usage
//!
//! ```rust,ignore
//! let store = Arc::new(FaultInjectingStore::new(InMemoryStore::new()));
//! store.crash_after_writes(3);
//! // run an attempt until it fails, then sweep with store.inner()
//! ```

use doctxn_store::{
    Cas, CollectionRef, DocumentStore, DocumentWrite, DurabilityLevel, StoreError, StoreResult,
    StoredDocument,
};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// A store wrapper that can simulate crashes and failures.
pub struct FaultInjectingStore<S: DocumentStore> {
    inner: S,
    crash_after: AtomicUsize,
    mutations: AtomicUsize,
    crashed: AtomicBool,
    transient_failures: AtomicUsize,
    cas_races: Mutex<HashSet<(CollectionRef, String)>>,
}

impl<S: DocumentStore> FaultInjectingStore<S> {
    /// Wraps `inner` with no faults armed.
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            crash_after: AtomicUsize::new(usize::MAX),
            mutations: AtomicUsize::new(0),
            crashed: AtomicBool::new(false),
            transient_failures: AtomicUsize::new(0),
            cas_races: Mutex::new(HashSet::new()),
        }
    }

    /// Returns the wrapped store, which never fails.
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Lets `count` more mutations succeed, then fails everything.
    pub fn crash_after_writes(&self, count: usize) {
        let done = self.mutations.load(Ordering::SeqCst);
        self.crash_after
            .store(done.saturating_add(count), Ordering::SeqCst);
    }

    /// Fails the next `count` mutations with a temporary error.
    pub fn fail_next_writes_transiently(&self, count: usize) {
        self.transient_failures.store(count, Ordering::SeqCst);
    }

    /// Makes the next mutation of `key` fail with a CAS mismatch, as if a
    /// concurrent writer got there first.
    pub fn inject_cas_race(&self, collection: &CollectionRef, key: &str) {
        self.cas_races
            .lock()
            .insert((collection.clone(), key.to_string()));
    }

    /// Clears every armed fault and the crashed flag.
    pub fn reset(&self) {
        self.crash_after.store(usize::MAX, Ordering::SeqCst);
        self.crashed.store(false, Ordering::SeqCst);
        self.transient_failures.store(0, Ordering::SeqCst);
        self.cas_races.lock().clear();
    }

    /// Returns whether the simulated crash has happened.
    pub fn has_crashed(&self) -> bool {
        self.crashed.load(Ordering::SeqCst)
    }

    /// Returns the number of mutations that reached the inner store.
    pub fn mutation_count(&self) -> usize {
        self.mutations.load(Ordering::SeqCst)
    }

    fn check_alive(&self) -> StoreResult<()> {
        if self.has_crashed() {
            return Err(StoreError::unavailable("simulated crash"));
        }
        Ok(())
    }

    /// Applies armed faults before a mutation reaches the inner store.
    fn before_mutation(&self, collection: &CollectionRef, key: &str) -> StoreResult<()> {
        self.check_alive()?;

        if self.mutations.load(Ordering::SeqCst) >= self.crash_after.load(Ordering::SeqCst) {
            self.crashed.store(true, Ordering::SeqCst);
            return Err(StoreError::unavailable("simulated crash during write"));
        }

        let armed = self
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if armed {
            return Err(StoreError::temporary("simulated transient failure"));
        }

        if self
            .cas_races
            .lock()
            .remove(&(collection.clone(), key.to_string()))
        {
            return Err(StoreError::CasMismatch);
        }
        Ok(())
    }
}

impl<S: DocumentStore> DocumentStore for FaultInjectingStore<S> {
    fn read(&self, collection: &CollectionRef, key: &str) -> StoreResult<StoredDocument> {
        self.check_alive()?;
        self.inner.read(collection, key)
    }

    fn write(
        &self,
        collection: &CollectionRef,
        key: &str,
        write: DocumentWrite,
        expected: Option<Cas>,
    ) -> StoreResult<Cas> {
        self.before_mutation(collection, key)?;
        let cas = self.inner.write(collection, key, write, expected)?;
        self.mutations.fetch_add(1, Ordering::SeqCst);
        Ok(cas)
    }

    fn remove(
        &self,
        collection: &CollectionRef,
        key: &str,
        expected: Cas,
        durability: DurabilityLevel,
    ) -> StoreResult<()> {
        self.before_mutation(collection, key)?;
        self.inner.remove(collection, key, expected, durability)?;
        self.mutations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn keys(&self, collection: &CollectionRef) -> StoreResult<Vec<String>> {
        self.check_alive()?;
        self.inner.keys(collection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use doctxn_store::InMemoryStore;
    use serde_json::json;

    fn c() -> CollectionRef {
        CollectionRef::in_default_scope("c")
    }

    #[test]
    fn crash_after_writes() {
        let store = FaultInjectingStore::new(InMemoryStore::new());
        store.crash_after_writes(1);

        store.write(&c(), "a", DocumentWrite::body(json!(1)), None).unwrap();
        assert!(!store.has_crashed());

        let err = store.write(&c(), "b", DocumentWrite::body(json!(2)), None).unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
        assert!(store.has_crashed());
        assert!(store.read(&c(), "a").is_err());

        // The data written before the crash is still there
        assert_eq!(store.inner().get(&c(), "a"), Some(json!(1)));
        assert_eq!(store.inner().get(&c(), "b"), None);

        store.reset();
        assert!(store.read(&c(), "a").is_ok());
    }

    #[test]
    fn transient_failures_run_out() {
        let store = FaultInjectingStore::new(InMemoryStore::new());
        store.fail_next_writes_transiently(2);

        for _ in 0..2 {
            let err = store.write(&c(), "a", DocumentWrite::body(json!(1)), None).unwrap_err();
            assert!(err.is_retryable());
        }
        store.write(&c(), "a", DocumentWrite::body(json!(1)), None).unwrap();
        assert_eq!(store.mutation_count(), 1);
    }

    #[test]
    fn cas_race_fires_once() {
        let store = FaultInjectingStore::new(InMemoryStore::new());
        let cas = store.write(&c(), "a", DocumentWrite::body(json!(1)), None).unwrap();
        store.inject_cas_race(&c(), "a");

        let err = store
            .write(&c(), "a", DocumentWrite::body(json!(2)), Some(cas))
            .unwrap_err();
        assert!(matches!(err, StoreError::CasMismatch));
        store.write(&c(), "a", DocumentWrite::body(json!(2)), Some(cas)).unwrap();
    }
}
