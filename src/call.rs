use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::OnceLock;

use futures::FutureExt;
use tokio::sync::watch;
use tracing::error;

use crate::Error;

pub(crate) type Outcome<V, E> = Result<V, Error<E>>;

/// Counts a caller as attached for as long as it is alive.
struct Attached<'a>(&'a AtomicUsize);

impl<'a> Attached<'a> {
    fn new(callers: &'a AtomicUsize) -> Self {
        callers.fetch_add(1, Ordering::AcqRel);
        Attached(callers)
    }

    fn callers(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }
}

impl Drop for Attached<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A single in-flight execution for blocking callers.
///
/// The owner computes the outcome exactly once; joiners park on the same cell
/// and each get a clone of it.
#[derive(Debug)]
pub struct Call<V, E> {
    callers: AtomicUsize,
    outcome: OnceLock<Outcome<V, E>>,
}

impl<V, E> Default for Call<V, E> {
    fn default() -> Self {
        Self {
            callers: AtomicUsize::new(0),
            outcome: OnceLock::new(),
        }
    }
}

impl<V, E> Call<V, E>
where
    V: Clone,
    E: Clone,
{
    /// Runs `work` as this call's single execution.
    ///
    /// Returns the outcome and the number of callers attached when it was
    /// read. If `work` panics, joiners receive [`Error::Aborted`] and the
    /// panic is resumed on this thread.
    pub(crate) fn drive<F>(&self, work: F) -> (Outcome<V, E>, usize)
    where
        F: FnOnce() -> Result<V, E>,
    {
        let attached = Attached::new(&self.callers);
        let mut payload = None;
        let mut callers = None;
        let outcome = self.outcome.get_or_init(|| {
            let outcome = match panic::catch_unwind(AssertUnwindSafe(work)) {
                Ok(result) => result.map_err(Error::Operation),
                Err(p) => {
                    let err = Error::from_panic(&*p);
                    payload = Some(p);
                    Err(err)
                }
            };
            // Joiners stay attached until the cell is set.
            callers = Some(attached.callers());
            outcome
        });
        if let Some(p) = payload {
            error!("operation panicked, aborting in-flight call");
            panic::resume_unwind(p);
        }
        let callers = callers.unwrap_or_else(|| attached.callers());
        (outcome.clone(), callers)
    }

    /// Blocks until the owner has stored the outcome.
    pub(crate) fn wait(&self) -> (Outcome<V, E>, usize) {
        let attached = Attached::new(&self.callers);
        let outcome = self.outcome.wait().clone();
        (outcome, attached.callers())
    }
}

/// A single in-flight execution for async callers.
///
/// The outcome is published once on a watch channel; any number of joiners
/// subscribe and wake when it lands.
#[derive(Debug)]
pub struct AsyncCall<V, E> {
    callers: AtomicUsize,
    outcome: watch::Sender<Option<Outcome<V, E>>>,
}

impl<V, E> Default for AsyncCall<V, E> {
    fn default() -> Self {
        Self {
            callers: AtomicUsize::new(0),
            outcome: watch::Sender::new(None),
        }
    }
}

/// Publishes [`Error::Aborted`] if the owner goes away before publishing.
struct Publish<'a, V, E>(&'a AsyncCall<V, E>);

impl<V, E> Drop for Publish<'_, V, E> {
    fn drop(&mut self) {
        let published = self.0.outcome.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(Err(Error::Aborted(
                "owner dropped before completion".to_owned(),
            )));
            true
        });
        if published {
            error!("owner dropped, aborting in-flight call");
        }
    }
}

impl<V, E> AsyncCall<V, E>
where
    V: Clone,
    E: Clone,
{
    /// Awaits `work` as this call's single execution.
    pub(crate) async fn drive<Fut>(&self, work: Fut) -> (Outcome<V, E>, usize)
    where
        Fut: Future<Output = Result<V, E>>,
    {
        let attached = Attached::new(&self.callers);
        let publish = Publish(self);
        let outcome = match AssertUnwindSafe(work).catch_unwind().await {
            Ok(result) => result.map_err(Error::Operation),
            Err(p) => {
                self.outcome.send_replace(Some(Err(Error::from_panic(&*p))));
                drop(publish);
                error!("operation panicked, aborting in-flight call");
                panic::resume_unwind(p);
            }
        };
        let callers = attached.callers();
        self.outcome.send_replace(Some(outcome.clone()));
        drop(publish);
        (outcome, callers)
    }

    /// Waits until the owner has published the outcome.
    pub(crate) async fn wait(&self) -> (Outcome<V, E>, usize) {
        let attached = Attached::new(&self.callers);
        let mut rx = self.outcome.subscribe();
        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(slot) => slot.clone(),
            Err(_) => None,
        };
        let outcome = outcome
            .unwrap_or_else(|| Err(Error::Aborted("call closed before completion".to_owned())));
        (outcome, attached.callers())
    }
}

#[cfg(test)]
mod tests {
    use std::panic;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use tracing_test::traced_test;

    use super::{AsyncCall, Call};
    use crate::Error;

    #[test]
    #[traced_test]
    fn test_joiners_see_owner_outcome() {
        let call = Arc::new(Call::<u32, String>::default());

        let joiners: Vec<_> = (0..4)
            .map(|_| {
                let call = call.clone();
                thread::spawn(move || call.wait())
            })
            .collect();

        thread::sleep(Duration::from_millis(20));
        let (outcome, callers) = call.drive(|| Ok(7));
        assert_eq!(outcome, Ok(7));
        assert!(callers >= 1);

        for joiner in joiners {
            let (outcome, callers) = joiner.join().unwrap();
            assert_eq!(outcome, Ok(7));
            assert!(callers >= 1);
        }
    }

    #[test]
    #[traced_test]
    fn test_callers_count_includes_waiting_joiners() {
        let call = Arc::new(Call::<u32, String>::default());
        let joiner = {
            let call = call.clone();
            thread::spawn(move || call.wait())
        };
        // Give the joiner time to attach before the owner finishes.
        let (_, owner_callers) = call.drive(|| {
            thread::sleep(Duration::from_millis(50));
            Ok(1)
        });
        let (_, joiner_callers) = joiner.join().unwrap();

        // Each side reads the count before detaching, so at least one of
        // them sees the other still attached.
        assert_eq!(owner_callers.max(joiner_callers), 2);
        assert_eq!(call.callers.load(Ordering::Acquire), 0);
    }

    #[test]
    #[traced_test]
    fn test_drive_runs_once() {
        let call = Call::<u32, String>::default();
        let runs = AtomicUsize::new(0);
        let (first, _) = call.drive(|| {
            runs.fetch_add(1, Ordering::SeqCst);
            Err("nope".to_owned())
        });
        let (second, _) = call.drive(|| {
            runs.fetch_add(1, Ordering::SeqCst);
            Ok(1)
        });
        assert_eq!(first, Err(Error::Operation("nope".to_owned())));
        assert_eq!(second, first);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    #[traced_test]
    fn test_panic_aborts_joiners() {
        let call = Arc::new(Call::<u32, String>::default());
        let joiner = {
            let call = call.clone();
            thread::spawn(move || call.wait())
        };

        let owner = panic::catch_unwind(panic::AssertUnwindSafe(|| {
            call.drive(|| -> Result<u32, String> { panic!("backend exploded") })
        }));
        assert!(owner.is_err());

        let (outcome, _) = joiner.join().unwrap();
        assert_eq!(outcome, Err(Error::Aborted("backend exploded".to_owned())));
        assert!(logs_contain("operation panicked"));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_async_joiner_sees_outcome() {
        let call = Arc::new(AsyncCall::<u32, String>::default());
        let joiner = {
            let call = call.clone();
            tokio::spawn(async move { call.wait().await })
        };

        let (outcome, _) = call
            .drive(async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok(3)
            })
            .await;
        assert_eq!(outcome, Ok(3));

        let (outcome, _) = joiner.await.unwrap();
        assert_eq!(outcome, Ok(3));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_dropped_owner_aborts_joiners() {
        let call = Arc::new(AsyncCall::<u32, String>::default());
        let joiner = {
            let call = call.clone();
            tokio::spawn(async move { call.wait().await })
        };

        let owner = call.drive(std::future::pending());
        let timed_out = tokio::time::timeout(Duration::from_millis(20), owner).await;
        assert!(timed_out.is_err());

        let (outcome, _) = joiner.await.unwrap();
        assert!(outcome.unwrap_err().is_aborted());
        assert!(logs_contain("owner dropped"));
    }
}
