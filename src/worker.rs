//! Cooperative client scheduler.
//!
//! A fixed set of worker tasks each owns a set of clients and repeatedly
//! invokes their `process` callbacks. Callbacks must return promptly and
//! say when they next want to run; anything blocking (DNS, connect)
//! belongs on a detached task that wakes the client when it finishes.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::{Notify, mpsc};

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

/// Longest a worker sleeps between schedule checks.
const IDLE_SLEEP: Duration = Duration::from_millis(500);

/// What a client wants after one `process` call.
#[derive(Debug)]
pub enum Control {
    /// Run again after the given delay.
    Reschedule(Duration),
    /// Remove the client from the pool; `release` semantics run in Drop.
    Remove,
}

/// Scheduling context handed to every `process` call.
#[derive(Debug)]
pub struct Tick {
    /// Monotonic time of this scheduler pass.
    pub now: Instant,
}

/// A cooperatively scheduled client.
pub trait Client: Send + 'static {
    /// One scheduler visit. Must not block.
    fn process(&mut self, tick: &Tick) -> Control;
}

enum WorkerMsg {
    Add {
        id: u64,
        client: Box<dyn Client>,
        due: Instant,
    },
    Wake(u64),
    Shutdown,
}

/// Handle for waking one client out of its scheduled sleep.
#[derive(Clone)]
pub struct ClientHandle {
    id: u64,
    tx: mpsc::UnboundedSender<WorkerMsg>,
    notify: Arc<Notify>,
}

impl ClientHandle {
    /// Makes the client due immediately and pokes its worker.
    pub fn wake(&self) {
        let _ = self.tx.send(WorkerMsg::Wake(self.id));
        self.notify.notify_one();
    }

    /// Identifier of the client this handle wakes.
    pub fn id(&self) -> u64 {
        self.id
    }
}

struct WorkerRef {
    tx: mpsc::UnboundedSender<WorkerMsg>,
    notify: Arc<Notify>,
}

/// Pool of cooperative workers.
pub struct WorkerPool {
    workers: Vec<WorkerRef>,
    next: AtomicUsize,
}

impl WorkerPool {
    /// Spawns `count` worker tasks on the current tokio runtime.
    pub fn new(count: usize) -> Self {
        let mut workers = Vec::with_capacity(count.max(1));
        for _ in 0..count.max(1) {
            let (tx, rx) = mpsc::unbounded_channel();
            let notify = Arc::new(Notify::new());
            tokio::spawn(run_worker(rx, Arc::clone(&notify)));
            workers.push(WorkerRef { tx, notify });
        }
        Self {
            workers,
            next: AtomicUsize::new(0),
        }
    }

    /// Adds a client to the least recently used worker. The builder gets
    /// the client's own wake handle so it can be woken by detached work.
    pub fn add_client<F>(&self, build: F) -> ClientHandle
    where
        F: FnOnce(ClientHandle) -> Box<dyn Client>,
    {
        let at = self.next.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        let worker = &self.workers[at];
        let handle = ClientHandle {
            id: NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed),
            tx: worker.tx.clone(),
            notify: Arc::clone(&worker.notify),
        };
        let client = build(handle.clone());
        let _ = worker.tx.send(WorkerMsg::Add {
            id: handle.id,
            client,
            due: Instant::now(),
        });
        worker.notify.notify_one();
        handle
    }

    /// Asks every worker task to finish.
    pub fn shutdown(&self) {
        for worker in &self.workers {
            let _ = worker.tx.send(WorkerMsg::Shutdown);
            worker.notify.notify_one();
        }
    }
}

struct Entry {
    id: u64,
    due: Instant,
    client: Box<dyn Client>,
}

async fn run_worker(mut rx: mpsc::UnboundedReceiver<WorkerMsg>, notify: Arc<Notify>) {
    let mut clients: Vec<Entry> = Vec::new();

    loop {
        // drain control messages first
        loop {
            match rx.try_recv() {
                Ok(WorkerMsg::Add { id, client, due }) => clients.push(Entry { id, due, client }),
                Ok(WorkerMsg::Wake(id)) => {
                    let now = Instant::now();
                    if let Some(entry) = clients.iter_mut().find(|c| c.id == id) {
                        entry.due = now;
                    }
                }
                Ok(WorkerMsg::Shutdown) => return,
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => return,
            }
        }

        // run everything that is due
        let now = Instant::now();
        let tick = Tick { now };
        let mut at = 0;
        while at < clients.len() {
            if clients[at].due <= now {
                match clients[at].client.process(&tick) {
                    Control::Reschedule(delay) => {
                        clients[at].due = now + delay;
                        at += 1;
                    }
                    Control::Remove => {
                        clients.swap_remove(at);
                    }
                }
            } else {
                at += 1;
            }
        }

        // sleep until the next deadline or an explicit wake
        let sleep_for = clients
            .iter()
            .map(|c| c.due.saturating_duration_since(now))
            .min()
            .unwrap_or(IDLE_SLEEP)
            .min(IDLE_SLEEP);
        tokio::select! {
            () = notify.notified() => {}
            () = tokio::time::sleep(sleep_for) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    struct CountingClient {
        ticks: Arc<AtomicUsize>,
        limit: usize,
    }

    impl Client for CountingClient {
        fn process(&mut self, _tick: &Tick) -> Control {
            let seen = self.ticks.fetch_add(1, Ordering::SeqCst) + 1;
            if seen >= self.limit {
                Control::Remove
            } else {
                Control::Reschedule(Duration::from_millis(1))
            }
        }
    }

    #[tokio::test]
    async fn clients_run_until_they_remove_themselves() {
        let pool = WorkerPool::new(2);
        let ticks = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&ticks);
        pool.add_client(move |_| {
            Box::new(CountingClient {
                ticks: seen,
                limit: 5,
            })
        });
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 5);
        pool.shutdown();
    }

    struct SleepyClient {
        woken: Arc<Mutex<Vec<Instant>>>,
    }

    impl Client for SleepyClient {
        fn process(&mut self, tick: &Tick) -> Control {
            self.woken.lock().unwrap().push(tick.now);
            // effectively parked until woken
            Control::Reschedule(Duration::from_secs(3600))
        }
    }

    #[tokio::test]
    async fn wake_overrides_a_long_reschedule() {
        let pool = WorkerPool::new(1);
        let woken = Arc::new(Mutex::new(Vec::new()));
        let shared = Arc::clone(&woken);
        let handle = pool.add_client(move |_| Box::new(SleepyClient { woken: shared }));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(woken.lock().unwrap().len(), 1);

        handle.wake();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(woken.lock().unwrap().len(), 2);
        pool.shutdown();
    }
}
