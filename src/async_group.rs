use std::future::Future;
use std::hash::Hash;
use std::marker::PhantomData;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{instrument, trace};

use crate::call::AsyncCall;
use crate::registry::Registry;
use crate::{Flight, Options, SharedError};

/// AsyncGroup is like [`Group`](crate::Group) but for futures: joiners
/// suspend instead of blocking their thread.
///
/// If the task driving a call is dropped before the future finishes, every
/// joiner receives [`Error::Aborted`](crate::Error::Aborted) and the key is
/// released.
pub struct AsyncGroup<K, V, E = SharedError, R = DashMap<K, Arc<AsyncCall<V, E>>>> {
    calls: Arc<R>,
    _marker: PhantomData<fn(K) -> (V, E)>,
}

impl<K, V, E, R> Clone for AsyncGroup<K, V, E, R> {
    fn clone(&self) -> Self {
        Self {
            calls: self.calls.clone(),
            _marker: PhantomData,
        }
    }
}

impl<K, V, E, R: Default> Default for AsyncGroup<K, V, E, R> {
    fn default() -> Self {
        Self::with_registry(R::default())
    }
}

impl<K, V, E> AsyncGroup<K, V, E>
where
    K: Eq + Hash,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: Options) -> Self {
        Self::with_registry(options.build())
    }
}

impl<K, V, E, R> AsyncGroup<K, V, E, R> {
    pub fn with_registry(registry: R) -> Self {
        Self {
            calls: Arc::new(registry),
            _marker: PhantomData,
        }
    }
}

struct Cleanup<'a, K, V, E, R>
where
    R: Registry<K, AsyncCall<V, E>>,
{
    calls: &'a R,
    key: K,
    call: &'a Arc<AsyncCall<V, E>>,
}

impl<K, V, E, R> Drop for Cleanup<'_, K, V, E, R>
where
    R: Registry<K, AsyncCall<V, E>>,
{
    fn drop(&mut self) {
        if self.calls.compare_and_remove(&self.key, self.call) {
            trace!("Entry removed");
        } else {
            trace!("Entry already forgotten");
        }
    }
}

impl<K, V, E, R> AsyncGroup<K, V, E, R>
where
    K: Eq + Hash + Clone,
    V: Clone,
    E: Clone,
    R: Registry<K, AsyncCall<V, E>>,
{
    /// work is like [`Group::work`](crate::Group::work) but awaits `fut`
    /// instead of calling a function. Only the first caller's future is
    /// polled; the futures of callers that join are dropped unpolled.
    #[instrument(level = "trace", skip_all)]
    pub async fn work<Fut>(&self, key: K, fut: Fut) -> Flight<V, E>
    where
        Fut: Future<Output = Result<V, E>>,
    {
        let (call, joined) = self
            .calls
            .insert_if_absent(key.clone(), Arc::new(AsyncCall::default()));
        if joined {
            drop(fut);
            trace!("Joined in-flight call, waiting...");
            let (result, _) = call.wait().await;
            trace!("Work done noticed");
            return Flight {
                result,
                shared: true,
            };
        }

        let _cleanup = Cleanup {
            calls: &*self.calls,
            key,
            call: &call,
        };
        trace!("working...");
        let (result, callers) = call.drive(fut).await;
        trace!(callers, "Work done");
        Flight {
            result,
            shared: callers > 1,
        }
    }

    #[instrument(level = "trace", skip_all)]
    pub fn forget(&self, key: &K) {
        if self.calls.remove(key) {
            trace!("Entry forgotten");
        }
    }

    pub fn in_flight(&self) -> usize {
        self.calls.len()
    }
}
