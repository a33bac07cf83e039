//! Leader/follower worker pool
//!
//! Socket I/O runs on the async I/O runtime. Whenever a read or accept
//! completes, the completion is queued here and one pool thread runs the
//! owning handler's callback. Exactly one idle thread, the leader, waits on the
//! ready queue; the rest wait to be promoted. The leader promotes a follower
//! before it runs the callback, so dispatch never holds up the next
//! completion.

use std::collections::{HashMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle, ThreadId};

use meridian_core::BasicStream;
use parking_lot::{Condvar, Mutex};
use tokio::sync::watch;
use tracing::{debug, error, warn};

use crate::config::ThreadPoolConfig;
use crate::error::Error;
use crate::transport::Transceiver;

pub type HandlerId = u64;

/// What the async I/O side wants from a registered handler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    /// Registered but not reading (holding)
    Paused,
    Reading,
    /// Unregistering; I/O tasks must stop
    Finished,
}

/// Completion state of a registration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerStatus {
    /// No I/O requested
    Inactive,
    /// I/O outstanding on the async I/O runtime
    Pending,
    /// A completion sits in the ready queue
    Ready,
}

/// Result of an asynchronous I/O operation handed to a handler
pub enum IoCompletion {
    /// A complete frame, positioned at its end
    Frame(BasicStream),
    /// A newly accepted transceiver
    Accepted(Box<dyn Transceiver>),
}

/// Object whose I/O completions are processed by a [`ThreadPool`]
pub trait EventHandler: Send + Sync {
    /// A completion is ready. Runs on a pool thread after a follower has been
    /// promoted, so it may dispatch user code.
    fn message(self: Arc<Self>, completion: IoCompletion);

    /// The handler's I/O failed
    fn exception(self: Arc<Self>, err: Error);

    /// Unregistration finished: no further callback will run
    fn finished(self: Arc<Self>);

    fn description(&self) -> String;
}

type Job = Box<dyn FnOnce() + Send>;

enum WorkItem {
    Completion(HandlerId, IoCompletion),
    Exception(HandlerId, Error),
    Finished(HandlerId),
    Job(Job),
}

impl WorkItem {
    fn handler(&self) -> Option<HandlerId> {
        match self {
            WorkItem::Completion(id, _) | WorkItem::Exception(id, _) | WorkItem::Finished(id) => {
                Some(*id)
            }
            WorkItem::Job(_) => None,
        }
    }
}

struct Registration {
    handler: Arc<dyn EventHandler>,
    interest: watch::Sender<Interest>,
    status: HandlerStatus,
    /// Queued or running work items of this handler
    outstanding: usize,
    finishing: bool,
}

#[derive(Default)]
struct PoolState {
    queue: VecDeque<WorkItem>,
    handlers: HashMap<HandlerId, Registration>,
    next_id: HandlerId,
    has_leader: bool,
    running: usize,
    in_use: usize,
    next_thread: usize,
    warned: bool,
    destroyed: bool,
}

pub struct ThreadPool {
    name: String,
    config: ThreadPoolConfig,
    state: Mutex<PoolState>,
    /// The leader waits here for work
    work_ready: Condvar,
    /// Followers wait here for promotion
    follower_ready: Condvar,
    threads: Mutex<Vec<JoinHandle<()>>>,
    thread_ids: Mutex<Vec<ThreadId>>,
    weak: Weak<ThreadPool>,
}

impl ThreadPool {
    pub fn new(name: impl Into<String>, config: ThreadPoolConfig) -> Arc<Self> {
        let mut config = config;
        config.size = config.size.max(1);
        config.size_max = config.size_max.max(config.size);
        let pool = Arc::new_cyclic(|weak| Self {
            name: name.into(),
            config,
            state: Mutex::new(PoolState {
                next_id: 1,
                ..PoolState::default()
            }),
            work_ready: Condvar::new(),
            follower_ready: Condvar::new(),
            threads: Mutex::new(Vec::new()),
            thread_ids: Mutex::new(Vec::new()),
            weak: weak.clone(),
        });
        {
            let mut state = pool.state.lock();
            for _ in 0..pool.config.size {
                pool.spawn_thread(&mut state);
            }
        }
        pool
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Threads currently alive
    pub fn running(&self) -> usize {
        self.state.lock().running
    }

    /// Threads currently running a callback
    pub fn in_use(&self) -> usize {
        self.state.lock().in_use
    }

    fn spawn_thread(&self, state: &mut PoolState) {
        let Some(pool) = self.weak.upgrade() else {
            return;
        };
        let name = format!("{}-{}", self.name, state.next_thread);
        state.next_thread += 1;
        match thread::Builder::new()
            .name(name.clone())
            .spawn(move || pool.run())
        {
            Ok(handle) => {
                state.running += 1;
                self.thread_ids.lock().push(handle.thread().id());
                self.threads.lock().push(handle);
                debug!(target: "meridian::thread_pool", pool = %self.name, "started thread {name}");
            }
            Err(e) => error!(target: "meridian::thread_pool", pool = %self.name, "cannot create thread: {e}"),
        }
    }

    /// Register `handler`; the receiver tells its I/O tasks what to do.
    pub fn register(
        &self,
        handler: Arc<dyn EventHandler>,
    ) -> (HandlerId, watch::Receiver<Interest>) {
        let (interest, rx) = watch::channel(Interest::Paused);
        let mut state = self.state.lock();
        let id = state.next_id;
        state.next_id += 1;
        state.handlers.insert(
            id,
            Registration {
                handler,
                interest,
                status: HandlerStatus::Inactive,
                outstanding: 0,
                finishing: false,
            },
        );
        (id, rx)
    }

    /// Start or stop reading for a handler that is not finishing
    pub fn set_interest(&self, id: HandlerId, interest: Interest) {
        let mut state = self.state.lock();
        if let Some(registration) = state.handlers.get_mut(&id) {
            if registration.finishing {
                return;
            }
            registration.status = match interest {
                Interest::Reading => HandlerStatus::Pending,
                _ if registration.status == HandlerStatus::Ready => HandlerStatus::Ready,
                _ => HandlerStatus::Inactive,
            };
            registration.interest.send_replace(interest);
        }
    }

    pub fn status(&self, id: HandlerId) -> Option<HandlerStatus> {
        self.state.lock().handlers.get(&id).map(|r| r.status)
    }

    /// An I/O operation of `id` completed
    pub fn ready(&self, id: HandlerId, completion: IoCompletion) {
        self.enqueue_for(id, WorkItem::Completion(id, completion));
    }

    /// An I/O operation of `id` failed
    pub fn exception(&self, id: HandlerId, err: Error) {
        self.enqueue_for(id, WorkItem::Exception(id, err));
    }

    fn enqueue_for(&self, id: HandlerId, item: WorkItem) {
        let mut state = self.state.lock();
        let Some(registration) = state.handlers.get_mut(&id) else {
            return;
        };
        if registration.finishing {
            return;
        }
        registration.outstanding += 1;
        registration.status = HandlerStatus::Ready;
        state.queue.push_back(item);
        self.work_ready.notify_one();
    }

    /// Unregister `id`. Its I/O tasks are told to stop, and `finished()` runs
    /// on a pool thread once every completion already queued was processed.
    pub fn finish(&self, id: HandlerId) {
        let mut state = self.state.lock();
        let Some(registration) = state.handlers.get_mut(&id) else {
            return;
        };
        if registration.finishing {
            return;
        }
        registration.finishing = true;
        registration.status = HandlerStatus::Inactive;
        registration.interest.send_replace(Interest::Finished);
        if registration.outstanding == 0 {
            registration.outstanding = 1;
            state.queue.push_back(WorkItem::Finished(id));
            self.work_ready.notify_one();
        }
    }

    /// Run `job` on a pool thread
    pub fn dispatch(&self, job: impl FnOnce() + Send + 'static) {
        let mut state = self.state.lock();
        state.queue.push_back(WorkItem::Job(Box::new(job)));
        self.work_ready.notify_one();
    }

    /// Whether the calling thread belongs to this pool
    pub fn is_pool_thread(&self) -> bool {
        let current = thread::current().id();
        self.thread_ids.lock().contains(&current)
    }

    /// Stop accepting work. Threads exit once the queue is drained.
    pub fn destroy(&self) {
        let mut state = self.state.lock();
        if state.destroyed {
            return;
        }
        state.destroyed = true;
        self.work_ready.notify_all();
        self.follower_ready.notify_all();
    }

    /// Wait for every pool thread to terminate. The calling thread is skipped
    /// if it belongs to the pool.
    pub fn join_with_all_threads(&self) {
        let current = thread::current().id();
        let handles: Vec<_> = self.threads.lock().drain(..).collect();
        for handle in handles {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                error!(target: "meridian::thread_pool", pool = %self.name, "pool thread panicked");
            }
        }
    }

    fn run(self: Arc<Self>) {
        loop {
            let Some(item) = self.next_item() else {
                return;
            };
            let handler = item.handler();
            self.execute(item);
            self.done(handler);
        }
    }

    /// Become the leader, wait for work, promote a follower.
    fn next_item(&self) -> Option<WorkItem> {
        let mut state = self.state.lock();
        while state.has_leader {
            if state.destroyed && state.queue.is_empty() {
                return self.exit(&mut state);
            }
            let timed_out = self
                .follower_ready
                .wait_for(&mut state, self.config.idle_timeout)
                .timed_out();
            if timed_out && state.has_leader && state.running > self.config.size {
                return self.exit(&mut state);
            }
        }
        state.has_leader = true;

        let item = loop {
            if let Some(item) = state.queue.pop_front() {
                break item;
            }
            if state.destroyed {
                state.has_leader = false;
                self.follower_ready.notify_one();
                return self.exit(&mut state);
            }
            let timed_out = self
                .work_ready
                .wait_for(&mut state, self.config.idle_timeout)
                .timed_out();
            if timed_out && state.queue.is_empty() && state.running > self.config.size {
                state.has_leader = false;
                self.follower_ready.notify_one();
                return self.exit(&mut state);
            }
        };

        // Promote a follower before running the item
        state.has_leader = false;
        state.in_use += 1;
        if state.in_use == state.running && state.running < self.config.size_max && !state.destroyed
        {
            debug!(target: "meridian::thread_pool", pool = %self.name, "growing thread pool to {} threads", state.running + 1);
            self.spawn_thread(&mut state);
        }
        if self.config.size_warn > 0 && state.in_use >= self.config.size_warn && !state.warned {
            state.warned = true;
            warn!(
                target: "meridian::thread_pool",
                pool = %self.name,
                "thread pool is running low on threads: size={} size_max={} size_warn={}",
                self.config.size, self.config.size_max, self.config.size_warn
            );
        }
        if let Some(id) = item.handler() {
            if let Some(registration) = state.handlers.get_mut(&id) {
                if registration.status == HandlerStatus::Ready && registration.outstanding == 1 {
                    registration.status = if registration.finishing {
                        HandlerStatus::Inactive
                    } else {
                        match *registration.interest.borrow() {
                            Interest::Reading => HandlerStatus::Pending,
                            _ => HandlerStatus::Inactive,
                        }
                    };
                }
            }
        }
        self.follower_ready.notify_one();
        Some(item)
    }

    fn exit(&self, state: &mut PoolState) -> Option<WorkItem> {
        state.running -= 1;
        debug!(target: "meridian::thread_pool", pool = %self.name, "thread exiting, {} left", state.running);
        None
    }

    fn execute(&self, item: WorkItem) {
        let result = panic::catch_unwind(AssertUnwindSafe(|| match item {
            WorkItem::Completion(id, completion) => {
                if let Some(handler) = self.handler(id) {
                    handler.message(completion);
                }
            }
            WorkItem::Exception(id, err) => {
                if let Some(handler) = self.handler(id) {
                    handler.exception(err);
                }
            }
            WorkItem::Finished(id) => {
                let handler = self.state.lock().handlers.remove(&id).map(|r| r.handler);
                if let Some(handler) = handler {
                    handler.finished();
                }
            }
            WorkItem::Job(job) => job(),
        }));
        if result.is_err() {
            warn!(target: "meridian::thread_pool", pool = %self.name, "callback panicked; the panic was swallowed");
        }
    }

    fn handler(&self, id: HandlerId) -> Option<Arc<dyn EventHandler>> {
        self.state.lock().handlers.get(&id).map(|r| r.handler.clone())
    }

    fn done(&self, handler: Option<HandlerId>) {
        let mut state = self.state.lock();
        state.in_use -= 1;
        let Some(id) = handler else {
            return;
        };
        let Some(registration) = state.handlers.get_mut(&id) else {
            return;
        };
        registration.outstanding -= 1;
        if registration.finishing && registration.outstanding == 0 {
            registration.outstanding = 1;
            state.queue.push_back(WorkItem::Finished(id));
            self.work_ready.notify_one();
        }
    }
}

pub(crate) async fn wait_finished(interest: &mut watch::Receiver<Interest>) {
    let _ = interest.wait_for(|i| *i == Interest::Finished).await;
}

/// Wait until reading is wanted; false once the handler is finished.
pub(crate) async fn wait_reading(interest: &mut watch::Receiver<Interest>) -> bool {
    let interest = interest
        .wait_for(|i| *i != Interest::Paused)
        .await
        .map(|i| *i);
    matches!(interest, Ok(Interest::Reading))
}
