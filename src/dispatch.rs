//! Concurrent dispatch engine.
//!
//! A fixed set of worker threads races on one shared sequence counter. Every
//! value a worker draws is one send attempt; a worker that draws a value above
//! the total cap stops for good. Each drawn value is attempted at most once,
//! so the attempted values are exactly `1..=min(total_cap, workers * per_worker)`.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::thread::{self, JoinHandle};

use crate::{Compose, Config, Error, Message, Result, Transport};

/// How much work to hand out and how.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Plan {
    pub workers: usize,
    pub per_worker: u64,
    pub total_cap: u64,
    pub reuse_connection: bool,
}

impl From<&Config> for Plan {
    fn from(config: &Config) -> Self {
        Plan {
            workers: config.workers,
            per_worker: config.per_worker,
            total_cap: config.total_cap,
            reuse_connection: config.connection_reuse,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Connected { worker: String },
    ConnectFailed { worker: String, error: Error },
    Sent { sequence: u64, worker: String },
    Failed { sequence: u64, worker: String, error: Error },
    Closed { worker: String },
}

/// Receives outcomes from all workers, concurrently.
pub trait Reporter: Send + Sync {
    fn event(&self, event: Event);
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Summary {
    pub attempted: u64,
    pub succeeded: u64,
    pub failed: u64,
    /// Last value handed out by the sequence counter. May exceed the cap by
    /// up to one draw per worker.
    pub peak_sequence: u64,
    /// Successful sends per worker. Workers without a success are absent.
    pub per_worker: BTreeMap<String, u64>,
}

/// Successful sends keyed by worker name. Entries are created on a worker's
/// first success.
#[derive(Default)]
struct Tally {
    counts: RwLock<HashMap<String, AtomicU64>>,
}

impl Tally {
    fn increment(&self, worker: &str) {
        {
            let counts = self.counts.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(count) = counts.get(worker) {
                count.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }
        let mut counts = self.counts.write().unwrap_or_else(PoisonError::into_inner);
        counts
            .entry(worker.to_string())
            .or_default()
            .fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> BTreeMap<String, u64> {
        self.counts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(worker, count)| (worker.clone(), count.load(Ordering::Relaxed)))
            .collect()
    }
}

struct Shared<T, C> {
    plan: Plan,
    transport: T,
    composer: C,
    reporter: Arc<dyn Reporter>,
    sequence: AtomicU64,
    attempted: AtomicU64,
    failed: AtomicU64,
    tally: Tally,
}

/// A worker's reused connection. Closed when dropped, whichever way the
/// worker loop ends.
struct Session<'a, T>
where
    T: Transport,
{
    transport: &'a T,
    connection: Option<T::Connection>,
    reporter: &'a dyn Reporter,
    worker: &'a str,
}

impl<'a, T> Session<'a, T>
where
    T: Transport,
{
    fn open(transport: &'a T, reporter: &'a dyn Reporter, worker: &'a str) -> Result<Self> {
        let connection = transport.connect()?;
        Ok(Session {
            transport,
            connection: Some(connection),
            reporter,
            worker,
        })
    }

    fn send(&mut self, message: &Message) -> Result<()> {
        match self.connection.as_mut() {
            Some(connection) => self.transport.send_via(connection, message),
            None => Err(Error::Network),
        }
    }
}

impl<T> Drop for Session<'_, T>
where
    T: Transport,
{
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            if let Err(error) = self.transport.close(connection) {
                tracing::warn!(worker = self.worker, %error, "failed to close connection");
            }
            self.reporter.event(Event::Closed {
                worker: self.worker.to_string(),
            });
        }
    }
}

impl<T, C> Shared<T, C>
where
    T: Transport,
    C: Compose,
{
    fn run_worker(&self, worker: &str) {
        tracing::debug!(worker, "worker started");
        if self.plan.reuse_connection {
            let reporter = self.reporter.as_ref();
            let mut session = match Session::open(&self.transport, reporter, worker) {
                Ok(session) => session,
                Err(error) => {
                    tracing::error!(worker, %error, "connection failed, abandoning quota");
                    reporter.event(Event::ConnectFailed {
                        worker: worker.to_string(),
                        error,
                    });
                    return;
                }
            };
            reporter.event(Event::Connected {
                worker: worker.to_string(),
            });
            self.send_loop(worker, |message| session.send(message));
        } else {
            self.send_loop(worker, |message| self.transport.send(message));
        }
        tracing::debug!(worker, "worker finished");
    }

    fn send_loop<F>(&self, worker: &str, mut deliver: F)
    where
        F: FnMut(&Message) -> Result<()>,
    {
        for _ in 0..self.plan.per_worker {
            let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
            if sequence > self.plan.total_cap {
                break;
            }
            self.attempted.fetch_add(1, Ordering::Relaxed);

            match self
                .composer
                .compose(sequence)
                .and_then(|message| deliver(&message))
            {
                Ok(()) => {
                    self.tally.increment(worker);
                    self.reporter.event(Event::Sent {
                        sequence,
                        worker: worker.to_string(),
                    });
                }
                Err(error) => {
                    self.failed.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(worker, sequence, %error, "send failed");
                    self.reporter.event(Event::Failed {
                        sequence,
                        worker: worker.to_string(),
                        error,
                    });
                }
            }
        }
    }

    fn summary(&self) -> Summary {
        let per_worker = self.tally.snapshot();
        Summary {
            attempted: self.attempted.load(Ordering::SeqCst),
            succeeded: per_worker.values().sum(),
            failed: self.failed.load(Ordering::SeqCst),
            peak_sequence: self.sequence.load(Ordering::SeqCst),
            per_worker,
        }
    }
}

pub struct Dispatcher<T, C> {
    shared: Arc<Shared<T, C>>,
}

impl<T, C> Dispatcher<T, C>
where
    T: Transport + 'static,
    C: Compose + 'static,
{
    pub fn new(plan: Plan, transport: T, composer: C, reporter: Arc<dyn Reporter>) -> Self {
        Dispatcher {
            shared: Arc::new(Shared {
                plan,
                transport,
                composer,
                reporter,
                sequence: AtomicU64::new(0),
                attempted: AtomicU64::new(0),
                failed: AtomicU64::new(0),
                tally: Tally::default(),
            }),
        }
    }

    /// Spawns one thread per worker and returns without waiting for them.
    /// Dropping the returned handle detaches the workers; they still run to
    /// completion.
    pub fn start(self) -> Result<Dispatch<T, C>> {
        let plan = self.shared.plan;
        tracing::info!(
            workers = plan.workers,
            per_worker = plan.per_worker,
            total_cap = plan.total_cap,
            reuse_connection = plan.reuse_connection,
            "starting dispatch"
        );

        let mut workers = Vec::with_capacity(plan.workers);
        for index in 1..=plan.workers {
            let name = format!("mailer-worker-{}", index);
            let shared = Arc::clone(&self.shared);
            let worker = name.clone();
            let handle = thread::Builder::new()
                .name(name)
                .spawn(move || shared.run_worker(&worker))
                .map_err(|e| Error::Worker(e.to_string()))?;
            workers.push(handle);
        }

        Ok(Dispatch {
            workers,
            shared: self.shared,
        })
    }
}

/// Handle on a running dispatch.
pub struct Dispatch<T, C> {
    workers: Vec<JoinHandle<()>>,
    shared: Arc<Shared<T, C>>,
}

impl<T, C> Dispatch<T, C>
where
    T: Transport,
    C: Compose,
{
    pub fn is_finished(&self) -> bool {
        self.workers.iter().all(JoinHandle::is_finished)
    }

    /// Blocks until every worker is done.
    pub fn wait(self) -> Summary {
        for handle in self.workers {
            let name = handle.thread().name().unwrap_or("worker").to_string();
            if handle.join().is_err() {
                tracing::error!(worker = %name, "worker panicked");
            }
        }
        let summary = self.shared.summary();
        tracing::info!(
            attempted = summary.attempted,
            succeeded = summary.succeeded,
            failed = summary.failed,
            "dispatch finished"
        );
        summary
    }
}
