//! Server side of an invocation
//!
//! Requests are read from the frame, routed to a servant of the adapter and
//! the outcome is written back as a reply status plus payload.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use meridian_core::protocol::{Header, MessageType, ReplyStatus, RequestHeader};
use meridian_core::{BasicStream, Context, Identity, OperationMode};
use tracing::warn;

use crate::adapter::{Located, ObjectAdapter};
use crate::error::Error;
use crate::instance::Instance;

/// Information about the request being dispatched
#[derive(Debug, Clone)]
pub struct Current {
    /// Name of the adapter the servant lives in
    pub adapter: Option<String>,
    /// Description of the connection the request arrived on, if any
    pub connection: Option<String>,
    pub id: Identity,
    pub facet: String,
    pub operation: String,
    pub mode: OperationMode,
    pub ctx: Context,
    /// 0 for oneway, batched and collocated oneway requests
    pub request_id: i32,
}

/// How a dispatch failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// An encoded user exception
    User(Vec<u8>),
    OperationNotExist,
    UnknownLocal(String),
    UnknownUser(String),
    Unknown(String),
}

/// Output parameters of a successful dispatch, or why it failed
pub type DispatchResult = std::result::Result<Vec<u8>, DispatchError>;

/// Target of requests
pub trait Servant: Send + Sync {
    /// Run `current.operation` with the encoded input `params`
    fn dispatch(&self, current: &Current, params: &[u8]) -> DispatchResult;
}

impl<F> Servant for F
where
    F: Fn(&Current, &[u8]) -> DispatchResult + Send + Sync,
{
    fn dispatch(&self, current: &Current, params: &[u8]) -> DispatchResult {
        self(current, params)
    }
}

/// Sends dispatch outcomes back to where the requests came from
pub trait ResponseHandler: Send + Sync {
    /// Send a reply frame; its size is patched by the handler
    fn send_response(&self, os: BasicStream);

    /// A request without reply finished
    fn send_no_response(&self);

    /// Reading the request frame failed. `remaining` requests of the frame,
    /// including the current one, will not be dispatched.
    fn invoke_exception(&self, err: Error, remaining: usize);

    /// Largest reply the handler can carry
    fn max_reply_size(&self) -> usize;
}

enum Outcome {
    Dispatched(DispatchResult),
    ObjectNotExist,
    FacetNotExist,
}

/// Dispatch the `count` requests of a request or batch frame positioned
/// after its header and request id (or request count).
pub(crate) fn dispatch_requests(
    instance: &Instance,
    handler: Arc<dyn ResponseHandler>,
    adapter: Option<Arc<ObjectAdapter>>,
    mut is: BasicStream,
    request_id: i32,
    count: usize,
    connection: Option<String>,
) {
    let warn_dispatch = instance.config().warn_dispatch;
    for done in 0..count {
        let (header, params) = match read_request(&mut is) {
            Ok(request) => request,
            Err(e) => {
                handler.invoke_exception(e, count - done);
                break;
            }
        };
        let current = Current {
            adapter: adapter.as_ref().map(|a| a.name().to_string()),
            connection: connection.clone(),
            id: header.identity,
            facet: header.facet,
            operation: header.operation,
            mode: header.mode,
            ctx: header.context,
            request_id,
        };

        let outcome = invoke(adapter.as_deref(), &current, &params);
        if warn_dispatch {
            if let Outcome::Dispatched(Err(
                DispatchError::UnknownLocal(reason)
                | DispatchError::UnknownUser(reason)
                | DispatchError::Unknown(reason),
            )) = &outcome
            {
                warn!(target: "meridian::protocol", "dispatch of `{}` on `{}` failed: {reason}", current.operation, current.id);
            }
        }

        if request_id == 0 {
            handler.send_no_response();
            continue;
        }
        let mut os = instance.stream_pool().take();
        let failure = match write_reply(&mut os, request_id, &current, &outcome) {
            Err(e) => Some(format!("cannot marshal reply: {e}")),
            Ok(()) if os.len() > handler.max_reply_size() => Some(format!(
                "reply of {} bytes exceeds the message size limit",
                os.len()
            )),
            Ok(()) => None,
        };
        if let Some(reason) = failure {
            os.reset();
            let fallback = Outcome::Dispatched(Err(DispatchError::UnknownLocal(reason)));
            if let Err(e) = write_reply(&mut os, request_id, &current, &fallback) {
                instance.stream_pool().give(os);
                handler.invoke_exception(e.into(), count - done);
                break;
            }
        }
        handler.send_response(os);
    }
    instance.stream_pool().give(is);
}

fn read_request(is: &mut BasicStream) -> Result<(RequestHeader, Vec<u8>), Error> {
    let header = RequestHeader::read(is)?;
    let params = is.read_encaps()?;
    Ok((header, params))
}

fn invoke(adapter: Option<&ObjectAdapter>, current: &Current, params: &[u8]) -> Outcome {
    let Some(adapter) = adapter else {
        return Outcome::ObjectNotExist;
    };
    let servant = match adapter.locate(&current.id, &current.facet) {
        Located::Servant(servant) => servant,
        Located::FacetNotExist => return Outcome::FacetNotExist,
        Located::ObjectNotExist => return Outcome::ObjectNotExist,
    };
    if current.operation == "ice_ping" {
        return Outcome::Dispatched(Ok(Vec::new()));
    }
    match panic::catch_unwind(AssertUnwindSafe(|| servant.dispatch(current, params))) {
        Ok(result) => Outcome::Dispatched(result),
        Err(payload) => {
            let reason = panic_message(payload.as_ref());
            warn!(target: "meridian::protocol", "servant for `{}` panicked in `{}`: {reason}", current.id, current.operation);
            Outcome::Dispatched(Err(DispatchError::Unknown(reason)))
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic".to_string()
    }
}

fn write_reply(
    os: &mut BasicStream,
    request_id: i32,
    current: &Current,
    outcome: &Outcome,
) -> Result<(), meridian_core::Error> {
    Header::write(MessageType::Reply, os);
    os.write_i32(request_id);
    let status = match outcome {
        Outcome::Dispatched(Ok(_)) => ReplyStatus::Ok,
        Outcome::Dispatched(Err(DispatchError::User(_))) => ReplyStatus::UserException,
        Outcome::ObjectNotExist => ReplyStatus::ObjectNotExist,
        Outcome::FacetNotExist => ReplyStatus::FacetNotExist,
        Outcome::Dispatched(Err(DispatchError::OperationNotExist)) => ReplyStatus::OperationNotExist,
        Outcome::Dispatched(Err(DispatchError::UnknownLocal(_))) => ReplyStatus::UnknownLocalException,
        Outcome::Dispatched(Err(DispatchError::UnknownUser(_))) => ReplyStatus::UnknownUserException,
        Outcome::Dispatched(Err(DispatchError::Unknown(_))) => ReplyStatus::UnknownException,
    };
    os.write_u8(status as u8);
    match outcome {
        Outcome::Dispatched(Ok(payload)) | Outcome::Dispatched(Err(DispatchError::User(payload))) => {
            os.write_encaps(payload)?;
        }
        Outcome::ObjectNotExist
        | Outcome::FacetNotExist
        | Outcome::Dispatched(Err(DispatchError::OperationNotExist)) => {
            current.id.write(os);
            if current.facet.is_empty() {
                os.write_size(0);
            } else {
                os.write_string_seq(&[&current.facet]);
            }
            os.write_string(&current.operation);
        }
        Outcome::Dispatched(Err(
            DispatchError::UnknownLocal(reason)
            | DispatchError::UnknownUser(reason)
            | DispatchError::Unknown(reason),
        )) => os.write_string(reason),
    }
    Ok(())
}
