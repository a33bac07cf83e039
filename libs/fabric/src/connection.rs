//! Connection state machine
//!
//! A connection owns one transceiver. Its reader and writer run as tasks on
//! the async I/O runtime; complete frames are handed to a thread pool which
//! calls back into [`EventHandler::message`]. All protocol state lives behind
//! one lock. Callbacks into invocations and servants always run after that
//! lock is released.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};

use meridian_core::protocol::{
    self, Header, MessageType, COMPRESSION_COMPRESSED, HEADER_SIZE, REQUEST_ID_OFFSET,
};
use meridian_core::BasicStream;
use parking_lot::{Condvar, Mutex};
use tokio::sync::{watch, Notify};
use tracing::{debug, trace, warn};

use crate::adapter::ObjectAdapter;
use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::incoming::{self, ResponseHandler};
use crate::instance::Instance;
use crate::outgoing::{BatchOutgoing, OutgoingMessageCallback};
use crate::thread_pool::{
    wait_finished, wait_reading, EventHandler, HandlerId, Interest, IoCompletion, ThreadPool,
};
use crate::transport::{Transceiver, TransceiverReader, TransceiverWriter, MAX_DATAGRAM_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum State {
    NotValidated,
    Active,
    Holding,
    Closing,
    Closed,
}

/// Why a connection is being shut down by its owner
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DestructionReason {
    ObjectAdapterDeactivated(String),
    CommunicatorDestroyed,
}

impl From<DestructionReason> for Error {
    fn from(reason: DestructionReason) -> Self {
        match reason {
            DestructionReason::ObjectAdapterDeactivated(name) => Error::ObjectAdapterDeactivated(name),
            DestructionReason::CommunicatorDestroyed => Error::CommunicatorDestroyed,
        }
    }
}

struct PendingRequest {
    out: Arc<dyn OutgoingMessageCallback>,
    /// The writer has picked the request up, so the peer may have it
    sent: bool,
}

struct OutgoingMessage {
    stream: BasicStream,
    out: Option<Arc<dyn OutgoingMessageCallback>>,
    /// Twoway request id, 0 for everything else
    request_id: i32,
    heartbeat: bool,
}

impl OutgoingMessage {
    fn control(stream: BasicStream) -> Self {
        Self {
            stream,
            out: None,
            request_id: 0,
            heartbeat: false,
        }
    }
}

#[derive(Default)]
struct BatchBuffer {
    stream: BasicStream,
    in_use: bool,
    request_count: i32,
    /// End of the last committed request
    mark: usize,
}

impl BatchBuffer {
    fn clear(&mut self) {
        self.stream.reset();
        self.request_count = 0;
        self.mark = 0;
    }
}

struct Inner {
    state: State,
    exception: Option<Error>,
    next_request_id: i32,
    requests: HashMap<i32, PendingRequest>,
    send_queue: VecDeque<OutgoingMessage>,
    batch: BatchBuffer,
    dispatch_count: usize,
    last_activity: Instant,
    last_write: Instant,
    adapter: Option<Arc<ObjectAdapter>>,
    consecutive_timeouts: u32,
    shutdown_initiated: bool,
    finished: bool,
}

impl Inner {
    fn allocate_request_id(&mut self) -> i32 {
        loop {
            let id = self.next_request_id;
            self.next_request_id = if id == i32::MAX { 1 } else { id + 1 };
            if !self.requests.contains_key(&id) {
                return id;
            }
        }
    }
}

enum Action {
    None,
    Reply(Arc<dyn OutgoingMessageCallback>),
    Dispatch {
        adapter: Option<Arc<ObjectAdapter>>,
        request_id: i32,
        count: usize,
    },
}

enum NextMessage {
    Write(OutgoingMessage),
    Wait,
    Stop,
}

pub struct Connection {
    instance: Arc<Instance>,
    pool: Arc<ThreadPool>,
    handler_id: OnceLock<HandlerId>,
    interest: Mutex<Option<watch::Receiver<Interest>>>,
    transceiver: Mutex<Option<Box<dyn Transceiver>>>,
    endpoint: Endpoint,
    description: String,
    datagram: bool,
    incoming: bool,
    inner: Mutex<Inner>,
    cond: Condvar,
    writer_wakeup: Notify,
    weak: Weak<Connection>,
}

impl Connection {
    pub(crate) fn new(
        instance: Arc<Instance>,
        transceiver: Box<dyn Transceiver>,
        endpoint: Endpoint,
        adapter: Option<Arc<ObjectAdapter>>,
        incoming: bool,
    ) -> Arc<Self> {
        let pool = if incoming {
            instance.server_pool().clone()
        } else {
            instance.client_pool().clone()
        };
        let now = Instant::now();
        let connection = Arc::new_cyclic(|weak| Self {
            pool,
            handler_id: OnceLock::new(),
            interest: Mutex::new(None),
            description: transceiver.description(),
            datagram: transceiver.datagram(),
            transceiver: Mutex::new(Some(transceiver)),
            endpoint,
            incoming,
            inner: Mutex::new(Inner {
                state: State::NotValidated,
                exception: None,
                next_request_id: 1,
                requests: HashMap::new(),
                send_queue: VecDeque::new(),
                batch: BatchBuffer::default(),
                dispatch_count: 0,
                last_activity: now,
                last_write: now,
                adapter,
                consecutive_timeouts: 0,
                shutdown_initiated: false,
                finished: false,
            }),
            cond: Condvar::new(),
            writer_wakeup: Notify::new(),
            weak: weak.clone(),
            instance,
        });
        let (id, interest) = connection.pool.register(connection.clone());
        let _ = connection.handler_id.set(id);
        *connection.interest.lock() = Some(interest);
        connection
    }

    fn handler_id(&self) -> HandlerId {
        self.handler_id.get().copied().unwrap_or_default()
    }

    /// Validate the connection and start its I/O tasks.
    ///
    /// Outgoing connections end up active, incoming ones holding until their
    /// adapter activates them.
    pub(crate) async fn start(self: &Arc<Self>) -> Result<()> {
        let transceiver = self.transceiver.lock().take();
        let interest = self.interest.lock().take();
        let (Some(transceiver), Some(interest)) = (transceiver, interest) else {
            return Err(Error::Protocol("connection already started".into()));
        };
        let (mut reader, mut writer) = transceiver.split();

        let timeout = self
            .endpoint
            .timeout
            .unwrap_or(self.instance.config().connect_timeout);
        let validated = tokio::time::timeout(timeout, self.validate(&mut *reader, &mut *writer))
            .await
            .unwrap_or(Err(Error::ConnectionTimeout));

        let handle = self.instance.handle();
        handle.spawn(write_loop(self.clone(), writer, interest.clone()));
        if let Err(e) = validated {
            self.fail(e.clone());
            return Err(e);
        }
        handle.spawn(read_loop(self.clone(), reader, interest));

        let mut inner = self.inner.lock();
        if inner.state == State::NotValidated {
            let state = if self.incoming {
                State::Holding
            } else {
                State::Active
            };
            self.transition(&mut inner, state, None);
        }
        if let Some(e) = &inner.exception {
            return Err(e.clone());
        }
        debug!(
            target: "meridian::network",
            "{} {} connection\n{}",
            if self.incoming { "accepted" } else { "established" },
            self.endpoint.transport.as_str(),
            self.description
        );
        Ok(())
    }

    async fn validate(
        &self,
        reader: &mut dyn TransceiverReader,
        writer: &mut dyn TransceiverWriter,
    ) -> Result<()> {
        if self.datagram {
            return Ok(());
        }
        if self.incoming {
            let os = protocol::header_only(MessageType::ValidateConnection);
            writer.write(&os).await?;
            trace!(target: "meridian::protocol", "sent validate connection\n{}", self.description);
        } else {
            let mut is = BasicStream::with_capacity(HEADER_SIZE);
            is.resize(HEADER_SIZE);
            reader.read(&mut is).await?;
            let header = Header::decode(is.as_bytes(), HEADER_SIZE)?;
            if header.message_type != MessageType::ValidateConnection {
                return Err(Error::Protocol(format!(
                    "received {} instead of validate connection",
                    header.message_type
                )));
            }
            trace!(target: "meridian::protocol", "received validate connection\n{}", self.description);
        }
        Ok(())
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn datagram(&self) -> bool {
        self.datagram
    }

    pub fn incoming(&self) -> bool {
        self.incoming
    }

    pub fn state(&self) -> State {
        self.inner.lock().state
    }

    /// The failure that closed or is closing the connection
    pub fn failure(&self) -> Option<Error> {
        self.inner.lock().exception.clone()
    }

    /// Validated and neither closing nor closed
    pub fn is_active_or_holding(&self) -> bool {
        matches!(self.inner.lock().state, State::Active | State::Holding)
    }

    /// The thread pool has released the connection
    pub fn is_finished(&self) -> bool {
        self.inner.lock().finished
    }

    /// Requests awaiting a reply
    pub fn pending_requests(&self) -> usize {
        self.inner.lock().requests.len()
    }

    /// Wait for a twoway reply at most this long
    pub fn timeout(&self) -> Option<Duration> {
        self.endpoint
            .timeout
            .or(self.instance.config().invocation_timeout)
    }

    /// Route requests arriving on this connection to `adapter`
    pub fn set_adapter(&self, adapter: Option<Arc<ObjectAdapter>>) {
        self.inner.lock().adapter = adapter;
    }

    pub fn adapter(&self) -> Option<Arc<ObjectAdapter>> {
        self.inner.lock().adapter.clone()
    }

    pub fn activate(&self) {
        let mut inner = self.inner.lock();
        self.transition(&mut inner, State::Active, None);
    }

    pub fn hold(&self) {
        let mut inner = self.inner.lock();
        self.transition(&mut inner, State::Holding, None);
    }

    /// Gracefully shut down on behalf of the owner. Pending requests fail with
    /// the reason once the connection is closed.
    pub fn destroy(&self, reason: DestructionReason) {
        let mut inner = self.inner.lock();
        self.transition(&mut inner, State::Closing, Some(reason.into()));
    }

    /// Close the connection. A graceful close first waits for every pending
    /// request to complete.
    pub fn close(&self, force: bool) {
        let mut inner = self.inner.lock();
        if force {
            self.transition(&mut inner, State::Closed, Some(Error::ForcedCloseConnection));
            return;
        }
        while !inner.requests.is_empty() && inner.state < State::Closing {
            self.cond.wait(&mut inner);
        }
        self.transition(&mut inner, State::Closing, Some(Error::CloseConnection));
    }

    /// Wait until no dispatch is running and the connection stopped reading
    pub fn wait_until_holding(&self) {
        let mut inner = self.inner.lock();
        while inner.state < State::Holding || inner.dispatch_count > 0 {
            self.cond.wait(&mut inner);
        }
    }

    /// Wait until the connection is closed and the thread pool released it
    pub fn wait_until_finished(&self) {
        let mut inner = self.inner.lock();
        while !inner.finished {
            self.cond.wait(&mut inner);
        }
    }

    fn max_message_size(&self) -> usize {
        let max = self.instance.config().message_size_max;
        if self.datagram {
            max.min(MAX_DATAGRAM_SIZE)
        } else {
            max
        }
    }

    /// Queue a request frame for writing.
    ///
    /// Twoway requests get the next free request id patched into the frame and
    /// an entry in the pending table; the returned id is 0 for oneways. An
    /// error means nothing was queued, so the request cannot have executed.
    pub fn send_request(
        &self,
        os: &mut BasicStream,
        out: Option<Arc<dyn OutgoingMessageCallback>>,
        response: bool,
    ) -> Result<i32> {
        let mut inner = self.inner.lock();
        if let Some(e) = &inner.exception {
            return Err(e.clone());
        }
        if response && self.datagram {
            return Err(Error::FeatureNotSupported(
                "twoway invocations over datagram connections".into(),
            ));
        }
        let reply_target = if response {
            let Some(callback) = out.clone() else {
                return Err(Error::Protocol("twoway request without a reply target".into()));
            };
            Some(callback)
        } else {
            None
        };
        let max = self.max_message_size();
        if os.len() > max {
            return Err(meridian_core::Error::MemoryLimit {
                size: os.len(),
                max,
            }
            .into());
        }

        let request_id = if response {
            let id = inner.allocate_request_id();
            os.rewrite_i32(id, REQUEST_ID_OFFSET);
            id
        } else {
            os.rewrite_i32(0, REQUEST_ID_OFFSET);
            0
        };
        protocol::finish_message(os)?;

        let mut stream = self.instance.stream_pool().take();
        stream.write_blob(os.as_bytes());
        if let Some(callback) = reply_target {
            inner.requests.insert(
                request_id,
                PendingRequest {
                    out: callback,
                    sent: false,
                },
            );
        }
        trace!(
            target: "meridian::protocol",
            request_id,
            "queueing request ({} bytes) to {}",
            stream.len(),
            self.endpoint
        );
        inner.send_queue.push_back(OutgoingMessage {
            stream,
            out,
            request_id,
            heartbeat: false,
        });
        inner.last_activity = Instant::now();
        self.writer_wakeup.notify_one();
        Ok(request_id)
    }

    /// Give up waiting for the reply of `request_id`.
    ///
    /// Returns false if the reply (or a failure) is already being delivered.
    /// Enough consecutive timeouts mark the connection as dead.
    pub fn abandon_request(&self, request_id: i32) -> bool {
        let mut inner = self.inner.lock();
        if inner.requests.remove(&request_id).is_none() {
            return false;
        }
        inner.send_queue.retain(|m| m.request_id != request_id);
        inner.consecutive_timeouts += 1;
        let limit = self.instance.config().timeouts_before_close;
        if limit > 0 && inner.consecutive_timeouts >= limit {
            debug!(target: "meridian::network", "closing connection after {limit} consecutive timeouts\n{}", self.description);
            self.transition(&mut inner, State::Closed, Some(Error::ConnectionTimeout));
        }
        self.cond.notify_all();
        true
    }

    /// Take the batch buffer to append one request to it.
    ///
    /// Only one batch request is marshaled at a time; concurrent callers
    /// wait. The stream must come back through [`finish_batch_request`] or
    /// [`abort_batch_request`].
    ///
    /// [`finish_batch_request`]: Connection::finish_batch_request
    /// [`abort_batch_request`]: Connection::abort_batch_request
    pub fn prepare_batch_request(&self) -> Result<BasicStream> {
        let mut inner = self.inner.lock();
        while inner.batch.in_use && inner.exception.is_none() {
            self.cond.wait(&mut inner);
        }
        if let Some(e) = &inner.exception {
            return Err(e.clone());
        }
        if inner.batch.stream.is_empty() {
            Header::write(MessageType::RequestBatch, &mut inner.batch.stream);
            inner.batch.stream.write_i32(0);
            inner.batch.request_count = 0;
            inner.batch.mark = inner.batch.stream.len();
        }
        inner.batch.in_use = true;
        Ok(std::mem::take(&mut inner.batch.stream))
    }

    /// Commit the request appended to `os`
    pub fn finish_batch_request(&self, mut os: BasicStream) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.batch.in_use = false;
        self.cond.notify_all();
        if let Some(e) = &inner.exception {
            let e = e.clone();
            inner.batch.clear();
            return Err(e);
        }

        let max = self.max_message_size();
        if os.len() > max {
            let mark = inner.batch.mark;
            let request = os.as_bytes()[mark..].to_vec();
            let fits_alone = HEADER_SIZE + 4 + request.len() <= max;
            if !(self.instance.config().batch_auto_flush
                && inner.batch.request_count > 0
                && fits_alone)
            {
                os.truncate(mark);
                inner.batch.stream = os;
                return Err(meridian_core::Error::MemoryLimit {
                    size: HEADER_SIZE + 4 + request.len(),
                    max,
                }
                .into());
            }
            // Send what was batched so far; the new request starts a batch
            os.truncate(mark);
            inner.batch.stream = os;
            self.queue_batch(&mut inner, None)?;
            let mut fresh = self.instance.stream_pool().take();
            Header::write(MessageType::RequestBatch, &mut fresh);
            fresh.write_i32(0);
            fresh.write_blob(&request);
            os = fresh;
        }
        inner.batch.request_count += 1;
        inner.batch.mark = os.len();
        inner.batch.stream = os;
        Ok(())
    }

    /// Drop whatever was appended to `os` since the last committed request
    pub fn abort_batch_request(&self, mut os: BasicStream) {
        let mut inner = self.inner.lock();
        if inner.batch.request_count == 0 {
            os.reset();
            inner.batch.mark = 0;
        } else {
            os.truncate(inner.batch.mark);
        }
        inner.batch.stream = os;
        inner.batch.in_use = false;
        self.cond.notify_all();
    }

    /// Number of committed batch requests awaiting a flush
    pub fn batch_request_count(&self) -> usize {
        self.inner.lock().batch.request_count as usize
    }

    /// Send the batched requests as one frame and wait until it is written
    pub fn flush_batch_requests(&self) -> Result<()> {
        BatchOutgoing::flush(self)
    }

    /// Queue the batch as one frame. Returns false when there was nothing
    /// to send.
    pub(crate) fn flush_batch(&self, out: Option<Arc<dyn OutgoingMessageCallback>>) -> Result<bool> {
        let mut inner = self.inner.lock();
        while inner.batch.in_use && inner.exception.is_none() {
            self.cond.wait(&mut inner);
        }
        if let Some(e) = &inner.exception {
            return Err(e.clone());
        }
        self.queue_batch(&mut inner, out)
    }

    fn queue_batch(
        &self,
        inner: &mut Inner,
        out: Option<Arc<dyn OutgoingMessageCallback>>,
    ) -> Result<bool> {
        if inner.batch.request_count == 0 {
            return Ok(false);
        }
        let mut stream = std::mem::take(&mut inner.batch.stream);
        stream.rewrite_i32(inner.batch.request_count, REQUEST_ID_OFFSET);
        protocol::finish_message(&mut stream)?;
        trace!(
            target: "meridian::protocol",
            "queueing batch of {} requests ({} bytes) to {}",
            inner.batch.request_count,
            stream.len(),
            self.endpoint
        );
        inner.batch.clear();
        inner.send_queue.push_back(OutgoingMessage {
            stream,
            out,
            request_id: 0,
            heartbeat: false,
        });
        inner.last_activity = Instant::now();
        self.writer_wakeup.notify_one();
        Ok(true)
    }

    /// Periodic housekeeping: heartbeats and idle closure
    pub fn monitor(&self, now: Instant) {
        let mut inner = self.inner.lock();
        if inner.state != State::Active {
            return;
        }
        let config = self.instance.config();
        if let Some(heartbeat) = config.connection_heartbeat {
            if !self.datagram
                && inner.send_queue.is_empty()
                && now.saturating_duration_since(inner.last_write) >= heartbeat
            {
                let mut msg =
                    OutgoingMessage::control(protocol::header_only(MessageType::ValidateConnection));
                msg.heartbeat = true;
                inner.send_queue.push_back(msg);
                self.writer_wakeup.notify_one();
            }
        }
        if let Some(idle) = config.connection_idle_time {
            let quiet = inner.requests.is_empty()
                && inner.dispatch_count == 0
                && !inner.batch.in_use
                && inner.batch.request_count == 0;
            if quiet && now.saturating_duration_since(inner.last_activity) >= idle {
                debug!(target: "meridian::network", "closing idle connection\n{}", self.description);
                self.transition(&mut inner, State::Closing, Some(Error::ConnectionTimeout));
            }
        }
    }

    /// Record a failure and close
    fn fail(&self, err: Error) {
        let mut inner = self.inner.lock();
        self.transition(&mut inner, State::Closed, Some(err));
    }

    fn transition(&self, inner: &mut Inner, mut state: State, reason: Option<Error>) {
        // Nothing to shut down gracefully before validation
        if state == State::Closing && inner.state == State::NotValidated {
            state = State::Closed;
        }
        if inner.state == state {
            return;
        }
        match state {
            State::NotValidated => return,
            State::Active => {
                if !matches!(inner.state, State::Holding | State::NotValidated) {
                    return;
                }
                self.pool.set_interest(self.handler_id(), Interest::Reading);
            }
            State::Holding => {
                if !matches!(inner.state, State::Active | State::NotValidated) {
                    return;
                }
                self.pool.set_interest(self.handler_id(), Interest::Paused);
            }
            State::Closing => {
                if inner.state >= State::Closing {
                    return;
                }
                // Keep reading to see the peer's close
                self.pool.set_interest(self.handler_id(), Interest::Reading);
            }
            State::Closed => {
                self.pool.finish(self.handler_id());
            }
        }

        if let Some(e) = reason {
            if inner.exception.is_none() {
                let warn_connections = self.instance.config().warn_connections;
                if warn_connections && !e.is_shutdown() && inner.state < State::Closing {
                    warn!(target: "meridian::network", "connection exception: {e}\n{}", self.description);
                } else {
                    debug!(target: "meridian::network", "closing {} connection: {e}\n{}", self.endpoint.transport.as_str(), self.description);
                }
                inner.exception = Some(e);
            }
        }
        trace!(target: "meridian::network", "connection state {:?} -> {:?}", inner.state, state);
        inner.state = state;
        self.cond.notify_all();
        self.writer_wakeup.notify_one();

        if state == State::Closing && inner.dispatch_count == 0 {
            self.initiate_shutdown(inner);
        }
    }

    fn initiate_shutdown(&self, inner: &mut Inner) {
        if inner.shutdown_initiated {
            return;
        }
        inner.shutdown_initiated = true;
        if self.datagram {
            self.transition(inner, State::Closed, None);
            return;
        }
        inner
            .send_queue
            .push_back(OutgoingMessage::control(protocol::header_only(
                MessageType::CloseConnection,
            )));
        self.writer_wakeup.notify_one();

        let weak = self.weak.clone();
        let timeout = self.instance.config().close_timeout;
        self.instance.handle().spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(connection) = weak.upgrade() {
                let mut inner = connection.inner.lock();
                if inner.state == State::Closing {
                    connection.transition(&mut inner, State::Closed, Some(Error::CloseTimeout));
                }
            }
        });
    }

    fn after_dispatch(&self, inner: &mut Inner) {
        if inner.dispatch_count == 0 {
            if inner.state == State::Closing {
                self.initiate_shutdown(inner);
            }
            self.cond.notify_all();
        }
    }

    fn parse_message(&self, inner: &mut Inner, stream: &mut BasicStream) -> Result<Action> {
        let header = Header::decode(stream.as_bytes(), self.max_message_size())?;
        if header.compression == COMPRESSION_COMPRESSED {
            return Err(Error::FeatureNotSupported("compressed messages".into()));
        }
        stream.set_pos(HEADER_SIZE);
        inner.last_activity = Instant::now();
        trace!(
            target: "meridian::protocol",
            "received {} ({} bytes) via {}",
            header.message_type,
            header.size,
            self.endpoint
        );

        match header.message_type {
            MessageType::CloseConnection => {
                if self.datagram {
                    debug!(target: "meridian::network", "ignoring close connection message for datagram connection");
                } else {
                    self.transition(inner, State::Closed, Some(Error::CloseConnection));
                }
                Ok(Action::None)
            }
            MessageType::Request => {
                if inner.state >= State::Closing {
                    trace!(target: "meridian::protocol", "received request during closing (ignored by server, client will retry)");
                    return Ok(Action::None);
                }
                let mut request_id = stream.read_i32()?;
                if self.datagram {
                    request_id = 0;
                }
                inner.dispatch_count += 1;
                Ok(Action::Dispatch {
                    adapter: inner.adapter.clone(),
                    request_id,
                    count: 1,
                })
            }
            MessageType::RequestBatch => {
                if inner.state >= State::Closing {
                    trace!(target: "meridian::protocol", "received batch request during closing (ignored by server, client will retry)");
                    return Ok(Action::None);
                }
                let count = stream.read_i32()?;
                if count < 0 {
                    return Err(meridian_core::Error::NegativeSize(count).into());
                }
                inner.dispatch_count += count as usize;
                Ok(Action::Dispatch {
                    adapter: inner.adapter.clone(),
                    request_id: 0,
                    count: count as usize,
                })
            }
            MessageType::Reply => {
                let request_id = stream.read_i32()?;
                inner.consecutive_timeouts = 0;
                match inner.requests.remove(&request_id) {
                    Some(pending) => {
                        self.cond.notify_all();
                        Ok(Action::Reply(pending.out))
                    }
                    None => {
                        trace!(target: "meridian::protocol", request_id, "ignoring reply for abandoned request");
                        Ok(Action::None)
                    }
                }
            }
            MessageType::ValidateConnection => Ok(Action::None),
        }
    }

    fn next_message(&self) -> NextMessage {
        let mut inner = self.inner.lock();
        if inner.state == State::Closed {
            return NextMessage::Stop;
        }
        match inner.send_queue.pop_front() {
            Some(msg) => {
                if msg.request_id != 0 {
                    if let Some(pending) = inner.requests.get_mut(&msg.request_id) {
                        pending.sent = true;
                    }
                }
                NextMessage::Write(msg)
            }
            None => NextMessage::Wait,
        }
    }

    fn message_written(&self, msg: OutgoingMessage) {
        {
            let mut inner = self.inner.lock();
            let now = Instant::now();
            inner.last_write = now;
            if !msg.heartbeat {
                inner.last_activity = now;
            }
        }
        if let Some(out) = msg.out {
            out.sent();
        }
        self.instance.stream_pool().give(msg.stream);
    }

    fn write_failed(&self, msg: OutgoingMessage, err: Error) {
        self.fail(err.clone());
        // Twoway requests are failed with the others once the pool lets go
        if msg.request_id == 0 {
            if let Some(out) = msg.out {
                out.failed(err, true);
            }
        }
    }

    async fn read_frame(
        &self,
        reader: &mut dyn TransceiverReader,
        stream: &mut BasicStream,
    ) -> Result<()> {
        if self.datagram {
            loop {
                reader.read(stream).await?;
                match Header::decode(stream.as_bytes(), self.max_message_size()) {
                    Ok(header) if header.size == stream.len() => return Ok(()),
                    Ok(header) => warn!(
                        target: "meridian::network",
                        "ignoring datagram: declared size {} but received {} bytes",
                        header.size,
                        stream.len()
                    ),
                    Err(e) => warn!(target: "meridian::network", "ignoring invalid datagram: {e}"),
                }
            }
        }
        stream.reset();
        stream.resize(HEADER_SIZE);
        reader.read(stream).await?;
        let header = Header::decode(stream.as_bytes(), self.max_message_size())?;
        stream.resize(header.size);
        reader.read(stream).await?;
        Ok(())
    }
}

impl EventHandler for Connection {
    fn message(self: Arc<Self>, completion: IoCompletion) {
        let IoCompletion::Frame(mut stream) = completion else {
            return;
        };
        let action = {
            let mut inner = self.inner.lock();
            match self.parse_message(&mut inner, &mut stream) {
                Ok(action) => action,
                Err(e) => {
                    self.transition(&mut inner, State::Closed, Some(e));
                    Action::None
                }
            }
        };

        match action {
            Action::None => self.instance.stream_pool().give(stream),
            Action::Reply(out) => out.finished(stream),
            Action::Dispatch {
                adapter,
                request_id,
                count,
            } => {
                let description = self.description.clone();
                incoming::dispatch_requests(
                    &self.instance,
                    self.clone(),
                    adapter,
                    stream,
                    request_id,
                    count,
                    Some(description),
                );
            }
        }
    }

    fn exception(self: Arc<Self>, err: Error) {
        self.fail(err);
    }

    fn finished(self: Arc<Self>) {
        let (requests, queued, exception) = {
            let mut inner = self.inner.lock();
            inner.finished = true;
            let exception = inner.exception.clone().unwrap_or(Error::ConnectionLost);
            let requests: Vec<_> = inner.requests.drain().map(|(_, p)| p).collect();
            let queued: Vec<_> = inner.send_queue.drain(..).collect();
            inner.batch.clear();
            inner.batch.in_use = false;
            self.cond.notify_all();
            (requests, queued, exception)
        };

        // Never started: close the transceiver here
        if let Some(transceiver) = self.transceiver.lock().take() {
            let (_, mut writer) = transceiver.split();
            self.instance.handle().spawn(async move {
                let _ = writer.close().await;
            });
        }

        for msg in queued {
            if msg.request_id == 0 {
                if let Some(out) = msg.out {
                    out.failed(exception.clone(), false);
                }
            }
        }
        for pending in requests {
            pending.out.failed(exception.clone(), pending.sent);
        }
        debug!(target: "meridian::network", "connection finished\n{}", self.description);
    }

    fn description(&self) -> String {
        self.description.clone()
    }
}

impl ResponseHandler for Connection {
    fn send_response(&self, mut os: BasicStream) {
        let mut inner = self.inner.lock();
        inner.dispatch_count = inner.dispatch_count.saturating_sub(1);
        if inner.state < State::Closed {
            match protocol::finish_message(&mut os) {
                Ok(()) => {
                    inner.send_queue.push_back(OutgoingMessage::control(os));
                    self.writer_wakeup.notify_one();
                }
                Err(e) => warn!(target: "meridian::protocol", "cannot send reply: {e}"),
            }
        }
        self.after_dispatch(&mut inner);
    }

    fn send_no_response(&self) {
        let mut inner = self.inner.lock();
        inner.dispatch_count = inner.dispatch_count.saturating_sub(1);
        self.after_dispatch(&mut inner);
    }

    fn invoke_exception(&self, err: Error, remaining: usize) {
        let mut inner = self.inner.lock();
        self.transition(&mut inner, State::Closed, Some(err));
        inner.dispatch_count = inner.dispatch_count.saturating_sub(remaining);
        self.after_dispatch(&mut inner);
    }

    fn max_reply_size(&self) -> usize {
        self.max_message_size()
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("endpoint", &self.endpoint)
            .field("incoming", &self.incoming)
            .field("state", &self.state())
            .finish()
    }
}

async fn read_loop(
    connection: Arc<Connection>,
    mut reader: Box<dyn TransceiverReader>,
    mut interest: watch::Receiver<Interest>,
) {
    let id = connection.handler_id();
    loop {
        if !wait_reading(&mut interest).await {
            return;
        }
        let mut stream = connection.instance.stream_pool().take();
        let result = tokio::select! {
            result = connection.read_frame(&mut *reader, &mut stream) => result,
            _ = wait_finished(&mut interest) => return,
        };
        match result {
            Ok(()) => connection.pool.ready(id, IoCompletion::Frame(stream)),
            Err(e) => {
                connection.pool.exception(id, e);
                return;
            }
        }
    }
}

async fn write_loop(
    connection: Arc<Connection>,
    mut writer: Box<dyn TransceiverWriter>,
    mut interest: watch::Receiver<Interest>,
) {
    loop {
        match connection.next_message() {
            NextMessage::Write(msg) => {
                if let Err(e) = writer.write(&msg.stream).await {
                    connection.write_failed(msg, e);
                    break;
                }
                connection.message_written(msg);
            }
            NextMessage::Wait => {
                tokio::select! {
                    _ = connection.writer_wakeup.notified() => {}
                    _ = wait_finished(&mut interest) => break,
                }
            }
            NextMessage::Stop => break,
        }
    }
    let _ = writer.close().await;
}
