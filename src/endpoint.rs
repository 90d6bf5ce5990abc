//! Public server facade: worker pool lifecycle plus the accept loop.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use tracing::{debug, warn};

use crate::config::{Config, TcpFlags};
use crate::error::Error;
use crate::http::{HttpHandler, ServerHandler};
use crate::listener;
use crate::reactor::Reactor;
use crate::transport::Transport;

struct Worker {
    reactor: Arc<Reactor>,
    transport: Arc<Transport>,
    join: thread::JoinHandle<Result<(), Error>>,
}

/// An HTTP endpoint: one listening socket, one acceptor, N worker reactors.
///
/// Lifecycle: [`new`](Endpoint::new) → [`set_handler`](Endpoint::set_handler)
/// → [`serve`](Endpoint::serve) (blocks) → [`shutdown`](Endpoint::shutdown)
/// (from another thread or a signal) unblocks it. Handler tables are frozen
/// before `serve` and shared read-only by every worker.
pub struct Endpoint {
    addr: SocketAddr,
    config: Config,
    handler: Mutex<Option<Arc<dyn HttpHandler>>>,
    listen_fd: AtomicI32,
    shutdown_flag: AtomicBool,
}

impl Endpoint {
    pub fn new(addr: SocketAddr, config: Config) -> Endpoint {
        Endpoint {
            addr,
            config,
            handler: Mutex::new(None),
            listen_fd: AtomicI32::new(-1),
            shutdown_flag: AtomicBool::new(false),
        }
    }

    /// Install the request handler invoked for every parsed request.
    pub fn set_handler(&self, handler: Arc<dyn HttpHandler>) {
        *self.handler.lock().unwrap() = Some(handler);
    }

    pub fn address(&self) -> SocketAddr {
        self.addr
    }

    /// Spin up the workers, bind the listening socket, and run the accept
    /// loop on the calling thread until [`shutdown`](Endpoint::shutdown) or a
    /// termination signal. Joins every worker before returning.
    pub fn serve(&self) -> Result<(), Error> {
        let handler = self
            .handler
            .lock()
            .unwrap()
            .clone()
            .ok_or(Error::MissingHandler)?;

        self.shutdown_flag.store(false, Ordering::Release);
        listener::reset_signal_shutdown();
        listener::ignore_sigpipe();
        if self.config.flags.contains(TcpFlags::INSTALL_SIGNAL_HANDLER) {
            listener::install_signal_handler()?;
        }

        let worker_count = self.config.worker_count();
        let mut workers = Vec::with_capacity(worker_count);
        for worker_id in 0..worker_count {
            workers.push(self.spawn_worker(worker_id, handler.clone())?);
        }
        let transports: Vec<Arc<Transport>> =
            workers.iter().map(|w| w.transport.clone()).collect();

        let listen_fd = match listener::bind_listener(self.addr, &self.config) {
            Ok(fd) => fd,
            Err(err) => {
                // Workers are already parked in their loops; don't leak them.
                self.join_workers(workers);
                return Err(err);
            }
        };
        self.listen_fd.store(listen_fd, Ordering::Release);
        debug!(addr = %self.addr, workers = worker_count, "serving");

        listener::run_acceptor(listen_fd, &transports, &self.config, &self.shutdown_flag);

        self.listen_fd.store(-1, Ordering::Release);
        unsafe {
            libc::close(listen_fd);
        }

        self.join_workers(workers);
        Ok(())
    }

    /// Request a graceful stop: wakes the accept loop, which then tears the
    /// workers down. Safe from any thread, including a signal-driven one.
    pub fn shutdown(&self) {
        self.shutdown_flag.store(true, Ordering::Release);
        let fd = self.listen_fd.load(Ordering::Acquire);
        if fd != -1 {
            // Unblocks a pending accept4; serve() closes the fd afterwards.
            unsafe {
                libc::shutdown(fd, libc::SHUT_RDWR);
            }
        }
    }

    fn spawn_worker(
        &self,
        worker_id: usize,
        handler: Arc<dyn HttpHandler>,
    ) -> Result<Worker, Error> {
        let reactor = Arc::new(Reactor::new()?);
        let server_handler = Box::new(ServerHandler::new(handler));
        let transport = Transport::new(reactor.clone(), server_handler, self.config.max_payload);
        transport.bind_poller()?;

        let pin = self.config.pin_workers;
        let core = self.config.core_offset + worker_id;
        let thread_reactor = reactor.clone();
        let thread_transport = transport.clone();

        let join = thread::Builder::new()
            .name(format!("edgeline-worker-{worker_id}"))
            .spawn(move || {
                if pin {
                    listener::pin_to_core(core)?;
                }
                thread_reactor.mark_thread();
                thread_reactor.run(&thread_transport)
            })
            .map_err(Error::Io)?;

        Ok(Worker {
            reactor,
            transport,
            join,
        })
    }

    fn join_workers(&self, workers: Vec<Worker>) {
        for worker in &workers {
            if let Err(err) = worker.reactor.wake_shutdown() {
                warn!(error = %err, "could not wake worker for shutdown");
            }
        }
        for worker in workers {
            match worker.join.join() {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(error = %err, "worker exited with error"),
                Err(_) => warn!("worker panicked"),
            }
            drop(worker.transport);
        }
    }
}
