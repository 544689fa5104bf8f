use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, Scope};
use std::time::Duration;

use tracing::{debug, trace};

use super::cancel::CancelToken;
use super::task::Preference;
use crate::resources::Resources;

/// How a queued job competes for admission.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Admission {
    pub(crate) req: Resources,
    pub(crate) priority: i64,
    pub(crate) preference: Preference,
}

struct Queued<P> {
    priority: i64,
    seq: Reverse<u64>,
    payload: P,
}

impl<P> Queued<P> {
    fn rank(&self) -> (i64, Reverse<u64>) {
        (self.priority, self.seq)
    }
}

impl<P> PartialEq for Queued<P> {
    fn eq(&self, other: &Self) -> bool {
        self.rank() == other.rank()
    }
}

impl<P> Eq for Queued<P> {}

impl<P> PartialOrd for Queued<P> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<P> Ord for Queued<P> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank().cmp(&other.rank())
    }
}

type Key = (Preference, Resources);

struct State<P> {
    /// Jobs bucketed by what they need; each bucket is ordered by priority
    /// then arrival.
    queues: HashMap<Key, BinaryHeap<Queued<P>>>,
    usage: Resources,
    in_flight: usize,
    seq: u64,
    shutdown: bool,
}

impl<P> State<P> {
    /// Best admissible job for a worker of the given preference.
    fn pick(&mut self, preference: Preference, capacity: &Resources) -> Option<(Resources, P)> {
        let key = self
            .queues
            .iter()
            .filter(|((_, req), heap)| !heap.is_empty() && req.fits(&self.usage, capacity))
            .filter_map(|(key, heap)| heap.peek().map(|top| (*key, top.rank())))
            .max_by_key(|((pref, _), rank)| (*pref == preference, *rank))
            .map(|(key, _)| key)?;

        let job = self.queues.get_mut(&key)?.pop()?;
        Some((key.1, job.payload))
    }

    fn queued(&self) -> usize {
        self.queues.values().map(BinaryHeap::len).sum()
    }
}

struct Shared<P> {
    state: Mutex<State<P>>,
    wake: Condvar,
    capacity: Resources,
    cancel: CancelToken,
    poll: Duration,
}

impl<P> Shared<P> {
    fn lock(&self) -> MutexGuard<'_, State<P>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct PoolConfig {
    pub(crate) capacity: Resources,
    pub(crate) base_workers: usize,
    pub(crate) service_workers: usize,
    pub(crate) poll: Duration,
}

impl PoolConfig {
    pub(crate) fn workers(&self) -> usize {
        self.base_workers + self.service_workers
    }
}

/// Fixed set of worker threads admitting jobs against a capacity vector.
///
/// A job is started only when its requirement fits next to what running
/// jobs hold, so the sum of running requirements never exceeds capacity in
/// any dimension. Jobs that do not fit stay queued and are reconsidered on
/// every completion. No job is admitted once the cancel token reports a
/// stop.
pub(crate) struct WorkerPool<P> {
    shared: Arc<Shared<P>>,
}

impl<P: Send + 'static> WorkerPool<P> {
    /// Spawns the workers inside `scope`; each runs `handler` on admitted
    /// payloads and sends what it returns to `done`.
    pub(crate) fn start<'scope, 'env, R, H>(
        scope: &'scope Scope<'scope, 'env>,
        config: PoolConfig,
        cancel: CancelToken,
        handler: &'env H,
        done: Sender<R>,
    ) -> Self
    where
        R: Send + 'env,
        H: Fn(P) -> R + Sync,
    {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                queues: HashMap::new(),
                usage: Resources::ZERO,
                in_flight: 0,
                seq: 0,
                shutdown: false,
            }),
            wake: Condvar::new(),
            capacity: config.capacity,
            cancel,
            poll: config.poll,
        });

        for n in 0..config.workers() {
            let preference = if n < config.base_workers {
                Preference::Base
            } else {
                Preference::Service
            };
            let shared = shared.clone();
            let done = done.clone();
            scope.spawn(move || worker(n, preference, &shared, handler, &done));
        }

        debug!(
            workers = config.workers(),
            capacity = %config.capacity,
            "started worker pool"
        );
        Self { shared }
    }
}

impl<P> WorkerPool<P> {
    pub(crate) fn submit(&self, admission: Admission, payload: P) {
        let req = admission.req.clamp_to(&self.shared.capacity);
        let mut state = self.shared.lock();
        state.seq += 1;
        let seq = Reverse(state.seq);
        state
            .queues
            .entry((admission.preference, req))
            .or_default()
            .push(Queued {
                priority: admission.priority,
                seq,
                payload,
            });
        drop(state);
        self.shared.wake.notify_all();
    }

    /// Jobs that are running right now.
    pub(crate) fn in_flight(&self) -> usize {
        self.shared.lock().in_flight
    }

    pub(crate) fn queued(&self) -> usize {
        self.shared.lock().queued()
    }

    /// Removes every job that was never admitted.
    pub(crate) fn drain(&self) -> Vec<P> {
        let mut state = self.shared.lock();
        let mut drained = Vec::new();
        for (_, heap) in state.queues.drain() {
            drained.extend(heap.into_sorted_vec().into_iter().rev().map(|q| q.payload));
        }
        drained
    }

    /// Nudge idle workers to recheck the cancel token.
    pub(crate) fn wake(&self) {
        self.shared.wake.notify_all();
    }

    pub(crate) fn shutdown(&self) {
        self.shared.lock().shutdown = true;
        self.shared.wake.notify_all();
    }
}

impl<P> Drop for WorkerPool<P> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker<P, R, H>(
    n: usize,
    preference: Preference,
    shared: &Shared<P>,
    handler: &H,
    done: &Sender<R>,
) where
    H: Fn(P) -> R,
{
    loop {
        let (req, payload) = {
            let mut state = shared.lock();
            loop {
                if state.shutdown {
                    trace!(worker = n, "worker exiting");
                    return;
                }
                if !shared.cancel.is_stopping()
                    && let Some((req, payload)) = state.pick(preference, &shared.capacity)
                {
                    state.usage += req;
                    state.in_flight += 1;
                    break (req, payload);
                }
                state = match shared.wake.wait_timeout(state, shared.poll) {
                    Ok((state, _)) => state,
                    Err(e) => e.into_inner().0,
                };
            }
        };

        let result = handler(payload);

        // Report before releasing capacity so the scheduler never sees an
        // idle pool with an unreported result.
        let _ = done.send(result);

        {
            let mut state = shared.lock();
            state.usage -= req;
            state.in_flight -= 1;
        }
        shared.wake.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use std::sync::mpsc::channel;

    use super::*;

    fn config(cpu: u32, workers: usize) -> PoolConfig {
        PoolConfig {
            capacity: Resources {
                cpu,
                io: 1,
                ..Resources::ZERO
            },
            base_workers: workers,
            service_workers: 1,
            poll: Duration::from_millis(5),
        }
    }

    #[test]
    fn running_jobs_never_exceed_capacity() {
        let usage = Mutex::new(Resources::ZERO);
        let violations = AtomicUsize::new(0);
        let capacity = config(3, 6).capacity;

        let handler = |req: Resources| {
            {
                let mut usage = usage.lock().unwrap();
                *usage += req;
                if !Resources::ZERO.fits(&usage, &capacity) {
                    violations.fetch_add(1, AtomicOrdering::SeqCst);
                }
            }
            thread::sleep(Duration::from_millis(2));
            *usage.lock().unwrap() -= req;
            req
        };

        let finished = thread::scope(|scope| {
            let (tx, rx) = channel();
            let pool = WorkerPool::start(scope, config(3, 6), CancelToken::new(), &handler, tx);
            let reqs = [Resources::cpu(1), Resources::cpu(2), Resources::io(1), Resources::cpu(3)];
            for i in 0..40 {
                let req = reqs[i % reqs.len()];
                let admission = Admission {
                    req,
                    priority: 0,
                    preference: Preference::Base,
                };
                pool.submit(admission, req);
            }
            let finished = rx.iter().take(40).count();
            pool.shutdown();
            finished
        });

        assert_eq!(finished, 40);
        assert_eq!(violations.load(AtomicOrdering::SeqCst), 0);
    }

    #[test]
    fn priority_then_fifo() {
        let order = Mutex::new(Vec::new());
        let handler = |id: u32| {
            order.lock().unwrap().push(id);
            id
        };
        let cancel = CancelToken::new();

        thread::scope(|scope| {
            let (tx, rx) = channel();
            let pool = WorkerPool::start(
                scope,
                PoolConfig {
                    base_workers: 1,
                    service_workers: 0,
                    ..config(1, 1)
                },
                cancel.clone(),
                &handler,
                tx,
            );

            // Hold admission until every job is queued.
            cancel.request_stop("hold");
            let jobs = [(1, 0), (2, 5), (3, 0), (4, 5)];
            for (id, priority) in jobs {
                let admission = Admission {
                    req: Resources::cpu(1),
                    priority,
                    preference: Preference::Base,
                };
                pool.submit(admission, id);
            }
            assert_eq!(pool.queued(), 4);
            let drained = pool.drain();
            assert_eq!(drained, vec![2, 4, 1, 3]);
            drop(rx);
            pool.shutdown();
        });

        assert!(order.lock().unwrap().is_empty());
    }

    #[test]
    fn admission_respects_order_when_running() {
        let order = Mutex::new(Vec::new());
        let handler = |id: u32| {
            if id == 0 {
                thread::sleep(Duration::from_millis(50));
            }
            order.lock().unwrap().push(id);
            id
        };
        let job = |priority| Admission {
            req: Resources::cpu(1),
            priority,
            preference: Preference::Base,
        };

        thread::scope(|scope| {
            let (tx, rx) = channel();
            let pool = WorkerPool::start(
                scope,
                PoolConfig {
                    base_workers: 2,
                    service_workers: 0,
                    ..config(1, 1)
                },
                CancelToken::new(),
                &handler,
                tx,
            );

            // Occupy the only cpu so the rest queue up behind it.
            pool.submit(job(0), 0);
            while pool.in_flight() == 0 {
                thread::sleep(Duration::from_millis(1));
            }
            for (id, priority) in [(1, 0), (2, 0), (3, 9)] {
                pool.submit(job(priority), id);
            }
            let _: Vec<u32> = rx.iter().take(4).collect();
            pool.shutdown();
        });

        assert_eq!(*order.lock().unwrap(), vec![0, 3, 1, 2]);
    }

    #[test]
    fn stop_prevents_admission() {
        let ran = AtomicUsize::new(0);
        let handler = |_: u32| {
            ran.fetch_add(1, AtomicOrdering::SeqCst);
        };
        let cancel = CancelToken::new();
        cancel.request_stop("test");

        thread::scope(|scope| {
            let (tx, _rx) = channel();
            let pool = WorkerPool::start(scope, config(2, 2), cancel.clone(), &handler, tx);
            pool.submit(
                Admission {
                    req: Resources::cpu(1),
                    priority: 0,
                    preference: Preference::Base,
                },
                1,
            );
            thread::sleep(Duration::from_millis(30));
            assert_eq!(pool.in_flight(), 0);
            assert_eq!(pool.drain(), vec![1]);
            pool.shutdown();
        });

        assert_eq!(ran.load(AtomicOrdering::SeqCst), 0);
    }
}
