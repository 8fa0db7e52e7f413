//! Loopback coverage for the RDMA transport: bring-up handshake, two-sided
//! echo, and a one-sided read. Needs a real RDMA NIC; set
//! `CADENT_RDMA_IT_NIC` (and optionally `CADENT_RDMA_IT_BASE_PORT`) to run.

use std::env;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use rand::Rng;

use cadent_transport::{
    BufferPool, Connection, OwnedBlock, PollerType, RdmaConnector, RdmaEventHandler, SharedRegion,
};

const ENV_RDMA_NIC: &str = "CADENT_RDMA_IT_NIC";
const ENV_BASE_PORT: &str = "CADENT_RDMA_IT_BASE_PORT";
const WAIT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Default)]
struct Events {
    connected: usize,
    recv_frames: Vec<Vec<u8>>,
    read_frames: Vec<Vec<u8>>,
    sent: usize,
}

#[derive(Default)]
struct RecordingHandler {
    events: Mutex<Events>,
    cv: Condvar,
}

impl RecordingHandler {
    fn wait_until(&self, pred: impl Fn(&Events) -> bool) -> bool {
        let deadline = Instant::now() + WAIT_TIMEOUT;
        let mut events = self.events.lock();
        while !pred(&events) {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            self.cv.wait_for(&mut events, deadline - now);
        }
        true
    }
}

impl RdmaEventHandler for RecordingHandler {
    fn on_connected(&self, _conn: &Arc<Connection>) {
        self.events.lock().connected += 1;
        self.cv.notify_all();
    }

    fn on_recv(&self, _conn: &Arc<Connection>, mut buf: OwnedBlock) {
        let payload = buf.message_view().payload().to_vec();
        self.events.lock().recv_frames.push(payload);
        self.cv.notify_all();
    }

    fn on_sent(&self, _conn: &Arc<Connection>, _buf: OwnedBlock) {
        self.events.lock().sent += 1;
        self.cv.notify_all();
    }

    fn on_rdma_read_complete(&self, _conn: &Arc<Connection>, mut buf: OwnedBlock) {
        let payload = buf.message_view().payload().to_vec();
        self.events.lock().read_frames.push(payload);
        self.cv.notify_all();
    }
}

fn read_env(name: &str) -> Option<String> {
    env::var(name).ok().and_then(|value| {
        let trimmed = value.trim().to_string();
        if trimmed.is_empty() { None } else { Some(trimmed) }
    })
}

#[test]
#[ignore = "requires an RDMA NIC; set CADENT_RDMA_IT_NIC"]
fn it_loopback_bringup_echo_and_read() -> Result<(), Box<dyn std::error::Error>> {
    cadent_transport::logging::ensure_initialized();
    let Some(nic_name) = read_env(ENV_RDMA_NIC) else {
        eprintln!("skip: {ENV_RDMA_NIC} is not set");
        return Ok(());
    };
    let port = read_env(ENV_BASE_PORT)
        .as_deref()
        .unwrap_or("57010")
        .parse::<u16>()?;

    // Bring-up: the server publishes a 4 KiB region, the client connects.
    let region = Arc::new(SharedRegion::new(4096));
    let server_handler = Arc::new(RecordingHandler::default());
    let server = RdmaConnector::new(
        &nic_name,
        BufferPool::new(20, 12),
        server_handler.clone(),
        PollerType::Blocking,
    )?;
    server.listen_tcp(port, Arc::clone(&region))?;

    let client_pool = BufferPool::new(20, 12);
    let client_handler = Arc::new(RecordingHandler::default());
    let client = RdmaConnector::new(
        &nic_name,
        client_pool.clone(),
        client_handler.clone(),
        PollerType::Blocking,
    )?;
    let conn = client.connect_tcp("127.0.0.1", port)?;

    assert!(server_handler.wait_until(|e| e.connected == 1));
    assert!(client_handler.wait_until(|e| e.connected == 1));

    // The accept thread registers the connection just after on_connected.
    let deadline = Instant::now() + WAIT_TIMEOUT;
    let server_conn = loop {
        if let Some(server_conn) = server.connection() {
            break server_conn;
        }
        assert!(Instant::now() < deadline, "server connection not registered");
        std::thread::sleep(Duration::from_millis(1));
    };
    let published = server_conn.published_region().expect("published region");
    assert_eq!(published.size, 4096);
    assert_eq!(conn.remote_memory_region(), Some(published));

    // Echo over SEND/RECV: a 64-byte payload arrives intact.
    let mut payload = vec![0_u8; 64];
    rand::thread_rng().fill(&mut payload[..]);
    let mut block = client_pool.allocate().expect("send block");
    block.message_view().write_payload(&payload);
    conn.async_send(block)?;
    assert!(server_handler.wait_until(|e| !e.recv_frames.is_empty()));
    {
        let events = server_handler.events.lock();
        assert_eq!(events.recv_frames[0].len(), 64);
        assert_eq!(events.recv_frames[0], payload);
    }
    assert!(client_handler.wait_until(|e| e.sent == 1));

    // One-sided READ of a marker the server wrote into its region.
    let marker = 0xdead_beef_u32.to_le_bytes();
    region.write_at(16, &marker);
    conn.async_read(16, 4)?;
    assert!(client_handler.wait_until(|e| !e.read_frames.is_empty()));
    {
        let events = client_handler.events.lock();
        assert_eq!(events.read_frames[0], marker);
    }

    // Teardown with receives still pending: pollers join cleanly before
    // the memory regions are released.
    client.stop();
    server.stop();
    Ok(())
}
