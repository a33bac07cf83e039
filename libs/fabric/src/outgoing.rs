//! Synchronous invocations

use std::sync::Arc;
use std::time::Instant;

use meridian_core::protocol::{Header, MessageType, ReplyStatus, RequestHeader};
use meridian_core::{BasicStream, Context, Identity, OperationMode};
use parking_lot::{Condvar, Mutex};

use crate::connection::Connection;
use crate::error::{Error, RequestFailed, Result};
use crate::reference::Reference;
use crate::request_handler::RequestHandler;

/// Receives the outcome of a request queued on a connection.
///
/// Exactly one of `finished` and `failed` is called, and only by whoever
/// removed the request from the connection's pending table.
pub trait OutgoingMessageCallback: Send + Sync {
    /// The frame was written to the transport
    fn sent(&self) {}

    /// The reply arrived; `reply` is positioned after the request id
    fn finished(&self, reply: BasicStream);

    /// The request failed. `sent` is true if the peer may have received it.
    fn failed(&self, err: Error, sent: bool);
}

/// Write a complete request frame with a zero request id placeholder
pub(crate) fn write_request(
    os: &mut BasicStream,
    reference: &Reference,
    operation: &str,
    mode: OperationMode,
    context: Option<&Context>,
    params: &[u8],
) -> Result<()> {
    Header::write(MessageType::Request, os);
    os.write_i32(0);
    write_request_body(os, reference, operation, mode, context, params)
}

/// Write one request without frame header or request id, as found in
/// batches
pub(crate) fn write_request_body(
    os: &mut BasicStream,
    reference: &Reference,
    operation: &str,
    mode: OperationMode,
    context: Option<&Context>,
    params: &[u8],
) -> Result<()> {
    RequestHeader::write(
        os,
        &reference.identity,
        &reference.facet,
        operation,
        mode,
        context.unwrap_or(&reference.context),
    );
    os.write_encaps(params)?;
    Ok(())
}

/// Turn a reply body into the operation's outcome
pub fn decode_reply(is: &mut BasicStream) -> Result<Vec<u8>> {
    let status = ReplyStatus::try_from(is.read_u8()?)?;
    match status {
        ReplyStatus::Ok => Ok(is.read_encaps()?),
        ReplyStatus::UserException => Err(Error::UserException(is.read_encaps()?)),
        ReplyStatus::ObjectNotExist
        | ReplyStatus::FacetNotExist
        | ReplyStatus::OperationNotExist => {
            let identity = Identity::read(is)?;
            let facet = is.read_string_seq()?.into_iter().next().unwrap_or_default();
            let operation = is.read_string()?;
            let failed = RequestFailed {
                identity,
                facet,
                operation,
            };
            Err(match status {
                ReplyStatus::ObjectNotExist => Error::ObjectNotExist(failed),
                ReplyStatus::FacetNotExist => Error::FacetNotExist(failed),
                _ => Error::OperationNotExist(failed),
            })
        }
        ReplyStatus::UnknownLocalException => Err(Error::UnknownLocal(is.read_string()?)),
        ReplyStatus::UnknownUserException => Err(Error::UnknownUser(is.read_string()?)),
        ReplyStatus::UnknownException => Err(Error::Unknown(is.read_string()?)),
    }
}

enum Progress {
    InProgress,
    Sent,
    Done(Result<Vec<u8>>),
}

/// A blocking invocation
///
/// The calling thread waits on a condition variable until the reply (or a
/// failure) is delivered from a pool thread.
pub struct Outgoing {
    progress: Mutex<Progress>,
    cond: Condvar,
}

impl Outgoing {
    fn new() -> Self {
        Self {
            progress: Mutex::new(Progress::InProgress),
            cond: Condvar::new(),
        }
    }

    /// Send the request frame in `os` through `handler` and wait.
    ///
    /// Twoway calls wait for the reply, oneways until the frame is written.
    /// When the handler's timeout elapses first the request is abandoned and
    /// the call fails with a non-repeatable [`Error::Timeout`].
    pub fn invoke(
        handler: &dyn RequestHandler,
        os: &mut BasicStream,
        response: bool,
    ) -> Result<Vec<u8>> {
        let out = Arc::new(Outgoing::new());
        let sent = handler.send_request(os, out.clone(), response)?;

        let mut deadline = handler.timeout().map(|t| Instant::now() + t);
        let mut progress = out.progress.lock();
        loop {
            match &*progress {
                Progress::Done(_) => break,
                Progress::Sent if !response => return Ok(Vec::new()),
                _ => {}
            }
            let Some(at) = deadline else {
                out.cond.wait(&mut progress);
                continue;
            };
            if !out.cond.wait_until(&mut progress, at).timed_out() {
                continue;
            }
            if matches!(*progress, Progress::Done(_)) {
                break;
            }
            drop(progress);
            let abandoned = match &sent.connection {
                Some(connection) if response => connection.abandon_request(sent.request_id),
                _ => true,
            };
            if abandoned {
                return Err(Error::Timeout.non_repeatable());
            }
            // The outcome is being delivered right now
            deadline = None;
            progress = out.progress.lock();
        }

        match std::mem::replace(&mut *progress, Progress::InProgress) {
            Progress::Done(result) => result,
            _ => Err(Error::Protocol("invocation completed without a result".into())),
        }
    }
}

impl OutgoingMessageCallback for Outgoing {
    fn sent(&self) {
        let mut progress = self.progress.lock();
        if matches!(*progress, Progress::InProgress) {
            *progress = Progress::Sent;
            self.cond.notify_all();
        }
    }

    fn finished(&self, mut reply: BasicStream) {
        let result = decode_reply(&mut reply);
        *self.progress.lock() = Progress::Done(result);
        self.cond.notify_all();
    }

    fn failed(&self, err: Error, sent: bool) {
        let err = if sent { err.non_repeatable() } else { err };
        *self.progress.lock() = Progress::Done(Err(err));
        self.cond.notify_all();
    }
}

/// Batched oneway requests and their flush
pub struct BatchOutgoing {
    result: Mutex<Option<Result<()>>>,
    cond: Condvar,
}

impl BatchOutgoing {
    /// Append one request to the batch of `handler`'s connection. A request
    /// that fails halfway is cut back out of the batch.
    pub fn invoke(
        handler: &dyn RequestHandler,
        reference: &Reference,
        operation: &str,
        mode: OperationMode,
        context: Option<&Context>,
        params: &[u8],
    ) -> Result<()> {
        let mut os = handler.prepare_batch_request()?;
        match write_request_body(&mut os, reference, operation, mode, context, params) {
            Ok(()) => handler.finish_batch_request(os),
            Err(e) => {
                handler.abort_batch_request(os);
                Err(e)
            }
        }
    }

    /// Send the batch of `connection` and wait until it was written
    pub fn flush(connection: &Connection) -> Result<()> {
        let out = Arc::new(BatchOutgoing {
            result: Mutex::new(None),
            cond: Condvar::new(),
        });
        if !connection.flush_batch(Some(out.clone()))? {
            return Ok(());
        }
        let mut result = out.result.lock();
        loop {
            if let Some(result) = result.take() {
                return result;
            }
            out.cond.wait(&mut result);
        }
    }
}

impl OutgoingMessageCallback for BatchOutgoing {
    fn sent(&self) {
        *self.result.lock() = Some(Ok(()));
        self.cond.notify_all();
    }

    fn finished(&self, _reply: BasicStream) {}

    fn failed(&self, err: Error, sent: bool) {
        let err = if sent { err.non_repeatable() } else { err };
        *self.result.lock() = Some(Err(err));
        self.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply(status: ReplyStatus, body: impl FnOnce(&mut BasicStream)) -> BasicStream {
        let mut os = BasicStream::new();
        os.write_u8(status as u8);
        body(&mut os);
        os.set_pos(0);
        os
    }

    #[test]
    fn ok_reply_yields_params() {
        let mut is = reply(ReplyStatus::Ok, |os| os.write_encaps(&[7, 8]).unwrap());
        assert_eq!(decode_reply(&mut is).unwrap(), vec![7, 8]);
    }

    #[test]
    fn object_not_exist_carries_identity() {
        let mut is = reply(ReplyStatus::ObjectNotExist, |os| {
            Identity::new("bar").write(os);
            os.write_size(0);
            os.write_string("op");
        });
        match decode_reply(&mut is) {
            Err(Error::ObjectNotExist(failed)) => {
                assert_eq!(failed.identity, Identity::new("bar"));
                assert_eq!(failed.facet, "");
                assert_eq!(failed.operation, "op");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn unknown_exception_carries_text() {
        let mut is = reply(ReplyStatus::UnknownException, |os| os.write_string("boom"));
        assert!(matches!(decode_reply(&mut is), Err(Error::Unknown(text)) if text == "boom"));
    }

    #[test]
    fn failure_after_send_is_non_repeatable() {
        let out = Outgoing::new();
        out.failed(Error::ConnectionLost, true);
        match &*out.progress.lock() {
            Progress::Done(Err(e)) => assert!(e.is_non_repeatable()),
            _ => panic!("outcome not recorded"),
        };
    }
}
