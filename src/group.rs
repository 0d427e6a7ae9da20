use std::hash::Hash;
use std::marker::PhantomData;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{instrument, trace};

use crate::call::Call;
use crate::registry::Registry;
use crate::{Flight, Options, SharedError};

/// Group represents a class of work and creates a space in which units of work
/// can be executed with duplicate suppression.
///
/// Clones share the same in-flight calls. The default value is ready to use.
pub struct Group<K, V, E = SharedError, R = DashMap<K, Arc<Call<V, E>>>> {
    calls: Arc<R>,
    _marker: PhantomData<fn(K) -> (V, E)>,
}

impl<K, V, E, R> Clone for Group<K, V, E, R> {
    fn clone(&self) -> Self {
        Self {
            calls: self.calls.clone(),
            _marker: PhantomData,
        }
    }
}

impl<K, V, E, R: Default> Default for Group<K, V, E, R> {
    fn default() -> Self {
        Self::with_registry(R::default())
    }
}

impl<K, V, E> Group<K, V, E>
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

impl<K, V, E, R> Group<K, V, E, R> {
    /// Creates a group keeping its in-flight calls in `registry`.
    pub fn with_registry(registry: R) -> Self {
        Self {
            calls: Arc::new(registry),
            _marker: PhantomData,
        }
    }
}

/// Deregisters the owner's call when the owner is done with it, including
/// while unwinding.
struct Cleanup<'a, K, V, E, R>
where
    R: Registry<K, Call<V, E>>,
{
    calls: &'a R,
    key: K,
    call: &'a Arc<Call<V, E>>,
}

impl<K, V, E, R> Drop for Cleanup<'_, K, V, E, R>
where
    R: Registry<K, Call<V, E>>,
{
    fn drop(&mut self) {
        if self.calls.compare_and_remove(&self.key, self.call) {
            trace!("Entry removed");
        } else {
            trace!("Entry already forgotten");
        }
    }
}

impl<K, V, E, R> Group<K, V, E, R>
where
    K: Eq + Hash + Clone,
    V: Clone,
    E: Clone,
    R: Registry<K, Call<V, E>>,
{
    /// work executes and returns the results of the given function, making
    /// sure that only one execution is in-flight for a given key at a
    /// time. If a duplicate comes in, the duplicate caller waits for the
    /// original to complete and receives the same results.
    ///
    /// The returned [`Flight::shared`] indicates whether the result was given
    /// to multiple callers. The caller that ran `work` may see `true` too, when
    /// others joined before it finished.
    #[instrument(level = "trace", skip_all)]
    pub fn work<F>(&self, key: K, work: F) -> Flight<V, E>
    where
        F: FnOnce() -> Result<V, E>,
    {
        let (call, joined) = self
            .calls
            .insert_if_absent(key.clone(), Arc::new(Call::default()));
        if joined {
            trace!("Joined in-flight call, waiting...");
            let (result, _) = call.wait();
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
        let (result, callers) = call.drive(work);
        trace!(callers, "Work done");
        Flight {
            result,
            shared: callers > 1,
        }
    }

    /// forget tells the group to stop tracking `key`. Callers already waiting
    /// on the call still receive its result; later calls to [`Group::work`]
    /// for `key` run their function again instead of joining it.
    #[instrument(level = "trace", skip_all)]
    pub fn forget(&self, key: &K) {
        if self.calls.remove(key) {
            trace!("Entry forgotten");
        }
    }

    /// Number of calls currently in flight.
    pub fn in_flight(&self) -> usize {
        self.calls.len()
    }
}
