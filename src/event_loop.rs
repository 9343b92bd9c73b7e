//! Single-threaded event loop with a cross-thread task queue.
//!
//! Each [`crate::connection::TcpConnection`] is pinned to exactly one
//! [`EventLoop`]. The loop alternates between an I/O readiness wait, the
//! dispatch of readiness events to connections, draining the task queue,
//! and a once-per-second tick of the idle-expiry [`TimingWheel`].
//!
//! A [`LoopHandle`] is the cheap, `Send + Sync` face of the loop: any
//! thread may submit work through it, and work submitted from the loop
//! thread itself via [`LoopHandle::run_in_loop`] runs immediately. This is
//! the only cross-thread channel in the engine; everything a connection
//! owns is touched exclusively on the loop thread.

use std::collections::HashMap;
use std::io::{Error, ErrorKind};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};
use mio::{Events, Poll, Registry, Token, Waker};
use tracing::{error, trace, warn};

use crate::connection::TcpConnection;
use crate::timing_wheel::TimingWheel;

/// Reserved token for the cross-thread waker; connection tokens start at 1.
const WAKER_TOKEN: Token = Token(0);

type Task = Box<dyn FnOnce() + Send + 'static>;

/// Lock a mutex, absorbing poison: the engine assumes user callbacks do
/// not panic, and a poisoned guard here would otherwise cascade an
/// unrelated panic through every connection on the loop.
pub(crate) fn lock_ignore_poison<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct LoopShared {
    task_tx: Sender<Task>,
    waker: Waker,
    registry: Registry,
    thread_id: OnceLock<ThreadId>,
    connections: Mutex<HashMap<Token, Arc<TcpConnection>>>,
    next_token: AtomicUsize,
    wheel: Arc<Mutex<TimingWheel>>,
    quit: AtomicBool,
}

/// The loop itself. Construct it, hand out [`LoopHandle`]s, then move it
/// to its thread and call [`EventLoop::run`].
pub struct EventLoop {
    poll: Poll,
    events: Events,
    task_rx: Receiver<Task>,
    shared: Arc<LoopShared>,
}

impl EventLoop {
    pub fn new() -> Result<Self, Error> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;
        let registry = poll.registry().try_clone()?;
        let (task_tx, task_rx) = unbounded();
        Ok(Self {
            poll,
            events: Events::with_capacity(1024),
            task_rx,
            shared: Arc::new(LoopShared {
                task_tx,
                waker,
                registry,
                thread_id: OnceLock::new(),
                connections: Mutex::new(HashMap::new()),
                next_token: AtomicUsize::new(1),
                wheel: Arc::new(Mutex::new(TimingWheel::default())),
                quit: AtomicBool::new(false),
            }),
        })
    }

    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            shared: self.shared.clone(),
        }
    }

    /// Run until [`LoopHandle::quit`] is called. The calling thread becomes
    /// the loop thread.
    pub fn run(&mut self) {
        let _ = self.shared.thread_id.set(thread::current().id());
        let tick = Duration::from_secs(1);
        let mut next_tick = Instant::now() + tick;
        while !self.shared.quit.load(Ordering::Acquire) {
            let timeout = next_tick.saturating_duration_since(Instant::now());
            if let Err(err) = self.poll.poll(&mut self.events, Some(timeout)) {
                if err.kind() == ErrorKind::Interrupted {
                    continue;
                }
                error!("poll error: {}", err);
                break;
            }
            for event in self.events.iter() {
                let token = event.token();
                if token == WAKER_TOKEN {
                    continue;
                }
                let conn = lock_ignore_poison(&self.shared.connections)
                    .get(&token)
                    .cloned();
                match conn {
                    Some(conn) => {
                        if event.is_error() {
                            conn.handle_error();
                        }
                        if event.is_readable() || event.is_read_closed() {
                            conn.handle_read();
                        }
                        if event.is_writable() {
                            conn.handle_write();
                        }
                    }
                    None => trace!("readiness for unknown token {:?}", token),
                }
            }
            while let Ok(task) = self.task_rx.try_recv() {
                task();
            }
            while Instant::now() >= next_tick {
                // entries dropped outside the wheel lock: their destructors
                // re-enter the engine to force idle connections closed
                let expired = lock_ignore_poison(&self.shared.wheel).advance();
                drop(expired);
                next_tick += tick;
            }
        }
    }
}

/// Cheap, cloneable, `Send + Sync` handle to an [`EventLoop`].
#[derive(Clone)]
pub struct LoopHandle {
    shared: Arc<LoopShared>,
}

impl LoopHandle {
    /// True when the caller is on the thread running the loop.
    pub fn in_loop_thread(&self) -> bool {
        self.shared.thread_id.get() == Some(&thread::current().id())
    }

    /// Invariant check for code that must only run on the loop thread.
    pub fn assert_in_loop_thread(&self) {
        debug_assert!(
            self.in_loop_thread(),
            "called off the owning event-loop thread"
        );
    }

    /// Run `task` immediately when called from the loop thread, otherwise
    /// enqueue it.
    pub fn run_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        if self.in_loop_thread() {
            task();
        } else {
            self.queue_in_loop(task);
        }
    }

    /// Always enqueue `task` for the next loop iteration, even when called
    /// from the loop thread.
    pub fn queue_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        if self.shared.task_tx.send(Box::new(task)).is_err() {
            warn!("event loop is gone, dropping task");
            return;
        }
        if let Err(err) = self.shared.waker.wake() {
            error!("failed to wake event loop: {}", err);
        }
    }

    /// Ask the loop to exit after the current iteration.
    pub fn quit(&self) {
        self.shared.quit.store(true, Ordering::Release);
        self.shared.waker.wake().ok();
    }

    /// The idle-expiry wheel owned by this loop, ticked once per second.
    pub fn timing_wheel(&self) -> Arc<Mutex<TimingWheel>> {
        self.shared.wheel.clone()
    }

    pub(crate) fn registry_clone(&self) -> Result<Registry, Error> {
        self.shared.registry.try_clone()
    }

    pub(crate) fn next_token(&self) -> Token {
        Token(self.shared.next_token.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn insert_connection(&self, token: Token, conn: Arc<TcpConnection>) {
        lock_ignore_poison(&self.shared.connections).insert(token, conn);
    }

    pub(crate) fn remove_connection(&self, token: Token) {
        lock_ignore_poison(&self.shared.connections).remove(&token);
    }
}
