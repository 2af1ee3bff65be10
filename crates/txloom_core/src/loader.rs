//! Request-scoped batching loader.
//!
//! # Responsibility
//! - Coalesce by-key loads issued within one cooperative tick into a single
//!   batch fetch.
//! - Cache resolved values for the loader's lifetime; accept primed values.
//!
//! # Invariants
//! - A key appears at most once per dispatched batch.
//! - A key missing from a batch result fails only that key's load.
//! - Failed loads are never cached.
//! - No `RefCell` borrow is held across an await point.

use futures::future::{FutureExt, LocalBoxFuture, Shared};
use std::cell::RefCell;
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};
use thiserror::Error;

/// Fetches many keys in one round trip.
pub trait BatchFn<K, V> {
    type Error: Clone;

    /// Returns the values found for `keys`; absent keys are simply left out.
    fn load_batch<'a>(&'a self, keys: &'a [K]) -> LocalBoxFuture<'a, Result<HashMap<K, V>, Self::Error>>;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadError<E> {
    #[error("key not returned by batch fetch")]
    Missing,
    #[error("batch fetch failed: {0}")]
    Batch(E),
}

type BatchOutput<K, V, E> = Rc<Result<HashMap<K, V>, E>>;
type SharedBatch<K, V, E> = Shared<LocalBoxFuture<'static, BatchOutput<K, V, E>>>;

struct PendingBatch<K, V, E> {
    keys: Vec<K>,
    dispatched: Option<SharedBatch<K, V, E>>,
}

type PendingHandle<K, V, E> = Rc<RefCell<PendingBatch<K, V, E>>>;

struct LoaderState<K, V, E> {
    cache: HashMap<K, V>,
    pending: Option<PendingHandle<K, V, E>>,
    in_flight: HashMap<K, SharedBatch<K, V, E>>,
}

enum Ticket<K, V, E> {
    Joined(SharedBatch<K, V, E>),
    Queued(PendingHandle<K, V, E>),
}

/// Batching, caching loader over one `BatchFn`.
pub struct BatchLoader<K, V, F>
where
    F: BatchFn<K, V>,
{
    fetch: Rc<F>,
    state: RefCell<LoaderState<K, V, F::Error>>,
}

impl<K, V, F> BatchLoader<K, V, F>
where
    K: Eq + Hash + Clone + 'static,
    V: Clone + 'static,
    F: BatchFn<K, V> + 'static,
    F::Error: 'static,
{
    pub fn new(fetch: F) -> Self {
        Self {
            fetch: Rc::new(fetch),
            state: RefCell::new(LoaderState {
                cache: HashMap::new(),
                pending: None,
                in_flight: HashMap::new(),
            }),
        }
    }

    /// Loads one key, joining the batch of the current tick.
    pub async fn load(&self, key: K) -> Result<V, LoadError<F::Error>> {
        let ticket = {
            let mut state = self.state.borrow_mut();
            if let Some(value) = state.cache.get(&key) {
                return Ok(value.clone());
            }
            match state.in_flight.get(&key) {
                Some(batch) => Ticket::Joined(batch.clone()),
                None => {
                    let pending = state
                        .pending
                        .get_or_insert_with(|| {
                            Rc::new(RefCell::new(PendingBatch {
                                keys: Vec::new(),
                                dispatched: None,
                            }))
                        })
                        .clone();
                    {
                        let mut batch = pending.borrow_mut();
                        if !batch.keys.contains(&key) {
                            batch.keys.push(key.clone());
                        }
                    }
                    Ticket::Queued(pending)
                }
            }
        };

        let batch = match ticket {
            Ticket::Joined(batch) => batch,
            Ticket::Queued(pending) => {
                YieldNow::default().await;
                self.dispatch(&pending)
            }
        };
        let output = batch.clone().await;
        self.resolve(&key, &batch, &output)
    }

    /// Loads several keys; results keep the order of `keys`.
    pub async fn load_many(&self, keys: Vec<K>) -> Vec<Result<V, LoadError<F::Error>>> {
        futures::future::join_all(keys.into_iter().map(|key| self.load(key))).await
    }

    /// Inserts or overwrites a cached value without fetching.
    pub fn prime(&self, key: K, value: V) {
        self.state.borrow_mut().cache.insert(key, value);
    }

    pub fn clear(&self, key: &K) {
        self.state.borrow_mut().cache.remove(key);
    }

    pub fn clear_all(&self) {
        self.state.borrow_mut().cache.clear();
    }

    /// Returns the cached value, if any, without fetching.
    pub fn cached(&self, key: &K) -> Option<V> {
        self.state.borrow().cache.get(key).cloned()
    }

    fn dispatch(&self, pending: &PendingHandle<K, V, F::Error>) -> SharedBatch<K, V, F::Error> {
        let (keys, batch) = {
            let mut queued = pending.borrow_mut();
            if let Some(batch) = queued.dispatched.as_ref() {
                return batch.clone();
            }
            let keys = std::mem::take(&mut queued.keys);
            let fetch = Rc::clone(&self.fetch);
            let batch_keys = keys.clone();
            let batch = async move { Rc::new(fetch.load_batch(&batch_keys).await) }
                .boxed_local()
                .shared();
            queued.dispatched = Some(batch.clone());
            (keys, batch)
        };

        let mut state = self.state.borrow_mut();
        if state
            .pending
            .as_ref()
            .is_some_and(|current| Rc::ptr_eq(current, pending))
        {
            state.pending = None;
        }
        for key in keys {
            state.in_flight.insert(key, batch.clone());
        }
        batch
    }

    fn resolve(
        &self,
        key: &K,
        batch: &SharedBatch<K, V, F::Error>,
        output: &BatchOutput<K, V, F::Error>,
    ) -> Result<V, LoadError<F::Error>> {
        let mut state = self.state.borrow_mut();
        state.in_flight.retain(|_, other| !other.ptr_eq(batch));
        match output.as_ref() {
            Ok(found) => {
                // Values primed while the batch was in flight are newer.
                for (found_key, value) in found {
                    state
                        .cache
                        .entry(found_key.clone())
                        .or_insert_with(|| value.clone());
                }
                state.cache.get(key).cloned().ok_or(LoadError::Missing)
            }
            Err(err) => Err(LoadError::Batch(err.clone())),
        }
    }
}

/// Completes on its second poll, letting sibling futures enqueue first.
#[derive(Default)]
struct YieldNow {
    yielded: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            Poll::Ready(())
        } else {
            self.yielded = true;
            cx.waker().wake_by_ref();
            Poll::Pending
        }
    }
}
