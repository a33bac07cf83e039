//! Everything one communicator owns
//!
//! Passed explicitly to the components that need it; there is no global
//! state.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use meridian_core::StreamPool;
use parking_lot::Mutex;
use tokio::runtime::{Handle, Runtime};
use tracing::debug;

use crate::adapter::ObjectAdapterFactory;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::factory::OutgoingConnectionFactory;
use crate::incoming::panic_message;
use crate::monitor::ConnectionMonitor;
use crate::request_handler::RequestHandlerFactory;
use crate::retry::RetryQueue;
use crate::thread_pool::ThreadPool;

pub struct Instance {
    config: Config,
    runtime: Mutex<Option<Runtime>>,
    handle: Handle,
    client_pool: Arc<ThreadPool>,
    server_pool: Arc<ThreadPool>,
    stream_pool: StreamPool,
    retry_queue: Arc<RetryQueue>,
    outgoing_factory: Arc<OutgoingConnectionFactory>,
    handler_factory: RequestHandlerFactory,
    adapter_factory: ObjectAdapterFactory,
    monitor: Mutex<Option<ConnectionMonitor>>,
    destroyed: AtomicBool,
}

impl Instance {
    pub(crate) fn new(config: Config) -> Result<Arc<Self>> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(config.io_threads.max(1))
            .thread_name("meridian-io")
            .enable_all()
            .build()?;
        let handle = runtime.handle().clone();
        let client_pool = ThreadPool::new("meridian-client", config.client_pool.clone());
        let server_pool = ThreadPool::new("meridian-server", config.server_pool.clone());
        let retry_queue = RetryQueue::new(handle.clone());

        let instance = Arc::new_cyclic(|weak| Self {
            runtime: Mutex::new(Some(runtime)),
            handle: handle.clone(),
            client_pool,
            server_pool,
            stream_pool: StreamPool::default(),
            retry_queue,
            outgoing_factory: Arc::new(OutgoingConnectionFactory::new(weak.clone())),
            handler_factory: RequestHandlerFactory::new(weak.clone()),
            adapter_factory: ObjectAdapterFactory::default(),
            monitor: Mutex::new(None),
            destroyed: AtomicBool::new(false),
            config,
        });
        let monitor = ConnectionMonitor::start(
            Arc::downgrade(&instance),
            &handle,
            instance.config.monitor_interval,
        );
        *instance.monitor.lock() = Some(monitor);
        Ok(instance)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Handle of the async I/O runtime
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    pub fn client_pool(&self) -> &Arc<ThreadPool> {
        &self.client_pool
    }

    pub fn server_pool(&self) -> &Arc<ThreadPool> {
        &self.server_pool
    }

    pub fn stream_pool(&self) -> &StreamPool {
        &self.stream_pool
    }

    pub fn retry_queue(&self) -> &Arc<RetryQueue> {
        &self.retry_queue
    }

    pub fn outgoing_connection_factory(&self) -> &Arc<OutgoingConnectionFactory> {
        &self.outgoing_factory
    }

    pub fn request_handler_factory(&self) -> &RequestHandlerFactory {
        &self.handler_factory
    }

    pub fn adapter_factory(&self) -> &ObjectAdapterFactory {
        &self.adapter_factory
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// Run `future` on the I/O runtime and block the calling thread until it
    /// completes. Must not be called from a runtime thread.
    ///
    /// A panic inside `future` surfaces as `UnknownLocal`; a runtime shut
    /// down before the future finished as `CommunicatorDestroyed`.
    pub fn block_on<F>(&self, future: F) -> Result<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let (tx, rx) = std::sync::mpsc::sync_channel(1);
        let task = self.handle.spawn(future);
        self.handle.spawn(async move {
            let outcome = match task.await {
                Ok(output) => Ok(output),
                Err(e) if e.is_panic() => Err(Error::UnknownLocal(format!(
                    "runtime task panicked: {}",
                    panic_message(e.into_panic().as_ref())
                ))),
                Err(_) => Err(Error::CommunicatorDestroyed),
            };
            let _ = tx.send(outcome);
        });
        rx.recv().unwrap_or(Err(Error::CommunicatorDestroyed))
    }

    /// Tear everything down in dependency order. Returns false if the
    /// instance was already destroyed.
    pub(crate) fn destroy(&self) -> bool {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return false;
        }
        debug!(target: "meridian::network", "destroying communicator");

        let adapters = self.adapter_factory.destroy();
        self.outgoing_factory.destroy();
        for adapter in adapters {
            adapter.wait_for_deactivate();
        }
        self.outgoing_factory.wait_until_finished();
        self.handler_factory.clear();
        self.retry_queue.destroy();

        if let Some(monitor) = self.monitor.lock().take() {
            monitor.stop();
        }
        self.client_pool.destroy();
        self.server_pool.destroy();
        self.client_pool.join_with_all_threads();
        self.server_pool.join_with_all_threads();

        if let Some(runtime) = self.runtime.lock().take() {
            runtime.shutdown_background();
        }
        true
    }
}
