use std::sync::Arc;
use std::time::Duration;

use meridian_core::protocol::HEADER_SIZE;
use meridian_core::BasicStream;

use crate::adapter::ObjectAdapter;
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::incoming::{self, ResponseHandler};
use crate::instance::Instance;
use crate::outgoing::OutgoingMessageCallback;
use crate::outgoing_async::OutgoingAsync;
use crate::reference::Reference;
use crate::request_handler::{RequestHandler, SentRequest};

/// Dispatches requests to a servant of an adapter in this communicator
/// without going through a transport.
pub struct CollocatedRequestHandler {
    reference: Reference,
    instance: Arc<Instance>,
    adapter: Arc<ObjectAdapter>,
}

/// Delivers the reply of a collocated request straight to its invocation
struct CollocatedResponse {
    out: Arc<dyn OutgoingMessageCallback>,
    max_reply_size: usize,
}

impl ResponseHandler for CollocatedResponse {
    fn send_response(&self, mut os: BasicStream) {
        os.set_pos(HEADER_SIZE + 4);
        self.out.finished(os);
    }

    fn send_no_response(&self) {}

    fn invoke_exception(&self, err: Error, _remaining: usize) {
        self.out.failed(err, false);
    }

    fn max_reply_size(&self) -> usize {
        self.max_reply_size
    }
}

impl CollocatedRequestHandler {
    pub fn new(reference: Reference, instance: Arc<Instance>, adapter: Arc<ObjectAdapter>) -> Self {
        Self {
            reference,
            instance,
            adapter,
        }
    }

    /// Run the request frame in `os` through the regular dispatch path
    fn dispatch(&self, os: &BasicStream, out: Arc<dyn OutgoingMessageCallback>, response: bool) {
        let request_id = if response { 1 } else { 0 };
        let mut is = self.instance.stream_pool().take();
        is.write_blob(os.as_bytes());
        is.set_pos(HEADER_SIZE + 4);
        let handler = Arc::new(CollocatedResponse {
            out: out.clone(),
            max_reply_size: self.instance.config().message_size_max,
        });
        incoming::dispatch_requests(
            &self.instance,
            handler,
            Some(self.adapter.clone()),
            is,
            request_id,
            1,
            None,
        );
        if !response {
            out.sent();
        }
    }
}

impl RequestHandler for CollocatedRequestHandler {
    fn reference(&self) -> &Reference {
        &self.reference
    }

    fn send_request(
        &self,
        os: &mut BasicStream,
        out: Arc<dyn OutgoingMessageCallback>,
        response: bool,
    ) -> Result<SentRequest> {
        if self.adapter.is_deactivated() {
            return Err(Error::ObjectAdapterDeactivated(self.adapter.name().to_string()));
        }
        self.dispatch(os, out, response);
        Ok(SentRequest {
            connection: None,
            request_id: 0,
        })
    }

    fn send_async_request(&self, out: &Arc<OutgoingAsync>) -> Result<()> {
        if self.adapter.is_deactivated() {
            return Err(Error::ObjectAdapterDeactivated(self.adapter.name().to_string()));
        }
        let handler = CollocatedRequestHandler::new(
            self.reference.clone(),
            self.instance.clone(),
            self.adapter.clone(),
        );
        let out = out.clone();
        let response = self.reference.mode.expects_reply();
        self.instance.server_pool().dispatch(move || {
            let callback: Arc<dyn OutgoingMessageCallback> = out.clone();
            let os = out.request_frame();
            handler.dispatch(&os, callback, response);
        });
        Ok(())
    }

    fn prepare_batch_request(&self) -> Result<BasicStream> {
        Err(Error::FeatureNotSupported(
            "batch requests on collocated references".into(),
        ))
    }

    fn finish_batch_request(&self, _os: BasicStream) -> Result<()> {
        Err(Error::FeatureNotSupported(
            "batch requests on collocated references".into(),
        ))
    }

    fn abort_batch_request(&self, _os: BasicStream) {}

    fn connection(&self, _wait: bool) -> Result<Option<Arc<Connection>>> {
        Ok(None)
    }

    fn timeout(&self) -> Option<Duration> {
        self.reference
            .timeout
            .or(self.instance.config().invocation_timeout)
    }

    fn is_valid(&self) -> bool {
        !self.adapter.is_deactivated()
    }
}
