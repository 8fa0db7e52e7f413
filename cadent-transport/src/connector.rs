//! Connection factory: owns the opened device, accepts or initiates the
//! TCP side channel, and keeps the connection registry.

use std::io;
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;

use crate::buffer::BufferPool;
use crate::connection::{Connection, PollerType, RdmaEventHandler};
use crate::device::RdmaDevice;
use crate::error::Result;
use crate::region::SharedRegion;

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(10);

pub struct RdmaConnector {
    device: Arc<RdmaDevice>,
    pool: BufferPool,
    handler: Arc<dyn RdmaEventHandler>,
    poller_type: PollerType,
    connections: Arc<Mutex<Vec<Arc<Connection>>>>,
    accept_stop: Arc<AtomicBool>,
    accept_thread: Mutex<Option<JoinHandle<()>>>,
}

impl RdmaConnector {
    /// Opens the named device. Failing to find it is fatal to startup.
    pub fn new(
        dev_name: &str,
        pool: BufferPool,
        handler: Arc<dyn RdmaEventHandler>,
        poller_type: PollerType,
    ) -> Result<Self> {
        Ok(Self {
            device: Arc::new(RdmaDevice::open(dev_name)?),
            pool,
            handler,
            poller_type,
            connections: Arc::new(Mutex::new(Vec::new())),
            accept_stop: Arc::new(AtomicBool::new(false)),
            accept_thread: Mutex::new(None),
        })
    }

    pub fn device(&self) -> &Arc<RdmaDevice> {
        &self.device
    }

    /// Binds the TCP side channel and accepts peers on a background
    /// thread. Every accepted connection publishes `region`, which marks
    /// this side as the server. Bring-up failures abort the process.
    pub fn listen_tcp(&self, port: u16, region: Arc<SharedRegion>) -> Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", port))?;
        listener.set_nonblocking(true)?;
        log::info!("tcp side channel listening on port {port}");

        let device = Arc::clone(&self.device);
        let pool = self.pool.clone();
        let handler = Arc::clone(&self.handler);
        let poller_type = self.poller_type;
        let connections = Arc::clone(&self.connections);
        let stop = Arc::clone(&self.accept_stop);

        let handle = thread::Builder::new()
            .name("cadent-tcp-accept".to_string())
            .spawn(move || {
                loop {
                    if stop.load(Ordering::Acquire) {
                        break;
                    }
                    match listener.accept() {
                        Ok((stream, peer)) => {
                            log::info!("accepted tcp peer {peer}");
                            match Connection::establish(
                                Arc::clone(&device),
                                stream,
                                Some(Arc::clone(&region)),
                                pool.clone(),
                                Arc::clone(&handler),
                                poller_type,
                            ) {
                                Ok(conn) => connections.lock().push(conn),
                                Err(error) => {
                                    log::error!("connection bring-up failed: {error}");
                                    std::process::abort();
                                }
                            }
                        }
                        Err(error) if error.kind() == io::ErrorKind::WouldBlock => {
                            thread::sleep(ACCEPT_POLL_INTERVAL);
                        }
                        Err(error) => {
                            log::error!("tcp accept failed: {error}");
                            std::process::abort();
                        }
                    }
                }
            })?;
        *self.accept_thread.lock() = Some(handle);
        Ok(())
    }

    /// Connects to a listening peer and runs the client-side bring-up to
    /// completion, including receipt of the peer's memory region.
    pub fn connect_tcp(&self, host: &str, port: u16) -> Result<Arc<Connection>> {
        log::info!("connecting tcp side channel to {host}:{port}");
        let stream = TcpStream::connect((host, port))?;
        let conn = Connection::establish(
            Arc::clone(&self.device),
            stream,
            None,
            self.pool.clone(),
            Arc::clone(&self.handler),
            self.poller_type,
        )?;
        self.connections.lock().push(Arc::clone(&conn));
        Ok(conn)
    }

    /// The first live connection, if any.
    pub fn connection(&self) -> Option<Arc<Connection>> {
        self.connections.lock().first().cloned()
    }

    /// Stops accepting and shuts down every connection; each poller thread
    /// is joined before its verbs resources are released.
    pub fn stop(&self) {
        self.accept_stop.store(true, Ordering::Release);
        let handle = self.accept_thread.lock().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        for conn in self.connections.lock().iter() {
            conn.shutdown();
        }
    }
}

impl Drop for RdmaConnector {
    fn drop(&mut self) {
        self.stop();
    }
}
