//! Cooperative background worker for prefetch tasks
//!
//! One thread services any number of [`TimeSliceClient`]s. Each call to
//! `use_time_slice` performs one bounded unit of work and says how long the
//! client can wait before it needs the thread again. Clients can be woken
//! early, for example after a seek.

use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

use ballad_core::domain::audio::{AudioError, Result};

/// Longest the worker sleeps while it has clients
const MAX_IDLE: Duration = Duration::from_millis(100);

/// Work scheduled on a [`PrefetchWorker`]
pub trait TimeSliceClient: Send + Sync {
    /// Do one bounded unit of work
    ///
    /// Returns the delay before the next call, `Duration::ZERO` to be called
    /// again as soon as possible, or `None` to be removed from the worker.
    fn use_time_slice(&self) -> Option<Duration>;

    /// Name used in logs
    fn name(&self) -> &str {
        "client"
    }
}

/// Registration handle of a client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(u64);

enum Command {
    Register(ClientId, Arc<dyn TimeSliceClient>),
    Unregister(ClientId),
    Wake(ClientId),
    Shutdown,
}

/// Cheap handle that wakes one client early
#[derive(Clone)]
pub struct WorkerWaker {
    id: ClientId,
    commands: Sender<Command>,
}

impl WorkerWaker {
    pub fn wake(&self) {
        // A dead worker has nothing left to wake
        let _ = self.commands.send(Command::Wake(self.id));
    }
}

impl std::fmt::Debug for WorkerWaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerWaker").field("id", &self.id).finish()
    }
}

/// Background thread servicing time-slice clients
pub struct PrefetchWorker {
    name: String,
    commands: Sender<Command>,
    next_id: AtomicU64,
    thread: Option<JoinHandle<()>>,
}

impl PrefetchWorker {
    /// Spawn the worker thread
    pub fn spawn(name: &str) -> Result<Self> {
        let (commands, receiver) = unbounded();

        let thread = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || run(receiver))
            .map_err(AudioError::Io)?;

        info!(worker = name, "Prefetch worker started");

        Ok(Self {
            name: name.to_string(),
            commands,
            next_id: AtomicU64::new(0),
            thread: Some(thread),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add a client; its first slice runs immediately
    pub fn register(&self, client: Arc<dyn TimeSliceClient>) -> ClientId {
        let id = ClientId(self.next_id.fetch_add(1, Ordering::Relaxed));
        debug!(worker = %self.name, client = client.name(), ?id, "Registering client");
        self.send(Command::Register(id, client));
        id
    }

    /// Remove a client; a slice already running finishes first
    pub fn unregister(&self, id: ClientId) {
        self.send(Command::Unregister(id));
    }

    /// Run a client's next slice as soon as possible
    pub fn wake(&self, id: ClientId) {
        self.send(Command::Wake(id));
    }

    pub fn waker(&self, id: ClientId) -> WorkerWaker {
        WorkerWaker {
            id,
            commands: self.commands.clone(),
        }
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            warn!(worker = %self.name, "Prefetch worker is no longer running");
        }
    }
}

impl Drop for PrefetchWorker {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Shutdown);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!(worker = %self.name, "Prefetch worker panicked");
            }
        }
        info!(worker = %self.name, "Prefetch worker stopped");
    }
}

impl std::fmt::Debug for PrefetchWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrefetchWorker").field("name", &self.name).finish()
    }
}

// ============================================================================
// WORKER LOOP
// ============================================================================

struct Entry {
    id: ClientId,
    client: Arc<dyn TimeSliceClient>,
    due: Instant,
}

/// Apply one command; returns `false` on shutdown
fn handle(command: Command, clients: &mut Vec<Entry>) -> bool {
    match command {
        Command::Register(id, client) => clients.push(Entry {
            id,
            client,
            due: Instant::now(),
        }),
        Command::Unregister(id) => clients.retain(|e| e.id != id),
        Command::Wake(id) => {
            if let Some(entry) = clients.iter_mut().find(|e| e.id == id) {
                entry.due = Instant::now();
            }
        }
        Command::Shutdown => return false,
    }
    true
}

fn run(commands: Receiver<Command>) {
    let mut clients: Vec<Entry> = Vec::new();

    loop {
        // Drain pending commands without blocking
        while let Ok(command) = commands.try_recv() {
            if !handle(command, &mut clients) {
                return;
            }
        }

        // One pass over every client that is due
        let now = Instant::now();
        let mut i = 0;
        while i < clients.len() {
            if clients[i].due > now {
                i += 1;
                continue;
            }

            let client = Arc::clone(&clients[i].client);
            match catch_unwind(AssertUnwindSafe(|| client.use_time_slice())) {
                Ok(Some(delay)) => {
                    clients[i].due = Instant::now() + delay;
                    i += 1;
                }
                Ok(None) => {
                    trace!(client = client.name(), "Client finished");
                    clients.remove(i);
                }
                Err(_) => {
                    error!(client = client.name(), "Client panicked, removing it");
                    clients.remove(i);
                }
            }
        }

        // Sleep until the earliest deadline or the next command
        let next_due = clients.iter().map(|e| e.due).min();
        let command = match next_due {
            None => match commands.recv() {
                Ok(command) => command,
                Err(_) => return,
            },
            Some(due) => {
                let wait = due.saturating_duration_since(Instant::now()).min(MAX_IDLE);
                if wait.is_zero() {
                    continue;
                }
                match commands.recv_timeout(wait) {
                    Ok(command) => command,
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => return,
                }
            }
        };

        if !handle(command, &mut clients) {
            return;
        }
    }
}
