//! One RDMA connection: reliable-connected queue-pair bring-up over a TCP
//! side channel, work-request lifecycle, and completion polling.
//!
//! Bring-up is a fixed sequence: PD, CQ (with a completion channel when the
//! blocking poller is selected), RC QP, INIT, memory registration, ConnInfo
//! exchange, RTR, RTS, then the server publishes its memory-region
//! descriptor and the client stores it. Both peers start a dedicated poller
//! thread and keep a fixed backlog of receives posted.
//!
//! Every posted work request is recorded in the WR table before the verbs
//! post call returns; the completion handler removes the entry exactly once
//! and the buffer ownership travels with it, so blocks return to the pool
//! on every path.

use std::collections::HashMap;
use std::mem::MaybeUninit;
use std::net::TcpStream;
use std::os::raw::c_void;
use std::ptr::{NonNull, null_mut};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use rdma_mummy_sys::{
    ibv_access_flags, ibv_ack_cq_events, ibv_comp_channel, ibv_cq, ibv_create_comp_channel,
    ibv_create_cq, ibv_create_qp, ibv_destroy_comp_channel, ibv_destroy_cq, ibv_destroy_qp,
    ibv_get_cq_event, ibv_modify_qp, ibv_mtu, ibv_poll_cq, ibv_post_recv, ibv_post_send, ibv_qp,
    ibv_qp_attr, ibv_qp_attr_mask, ibv_qp_init_attr, ibv_qp_state, ibv_qp_type, ibv_query_qp,
    ibv_recv_wr, ibv_req_notify_cq, ibv_send_flags, ibv_send_wr, ibv_sge, ibv_wc, ibv_wc_opcode,
    ibv_wc_status, ibv_wr_opcode,
};
use sideway::ibverbs::AccessFlags;
use sideway::ibverbs::address::Gid;
use sideway::ibverbs::memory_region::MemoryRegion;
use sideway::ibverbs::protection_domain::ProtectionDomain;

use crate::buffer::{BufferPool, OwnedBlock};
use crate::device::RdmaDevice;
use crate::error::{Result, TransportError};
use crate::region::SharedRegion;
use crate::wire::ConnectorMessage;

/// Receives kept posted per connection at all times.
pub const RECV_BACKLOG: usize = 16;

const CQ_ENTRIES: i32 = 100;
const MAX_SEND_WR: u32 = 1024;
const MAX_RECV_WR: u32 = 1024;
const MAX_SEND_SGE: u32 = 16;
const MAX_RECV_SGE: u32 = 16;
const POLL_TIMEOUT_MS: i32 = 1;
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerType {
    /// Sleeps on the completion channel fd, 1 ms granularity.
    Blocking,
    /// Busy-polls the CQ with a CPU pause between empty polls.
    Spinning,
}

/// Callbacks invoked from the connection's poller thread (and, for
/// `on_connected`, from the thread driving bring-up). Implementations that
/// touch executor-owned state must post back onto the executor.
pub trait RdmaEventHandler: Send + Sync {
    fn on_connected(&self, _conn: &Arc<Connection>) {}
    fn on_recv(&self, conn: &Arc<Connection>, buf: OwnedBlock);
    fn on_sent(&self, _conn: &Arc<Connection>, _buf: OwnedBlock) {}
    fn on_rdma_read_complete(&self, _conn: &Arc<Connection>, _buf: OwnedBlock) {}
}

/// Descriptor of a peer's published memory region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteRegion {
    pub addr: u64,
    pub size: u64,
    pub rkey: u32,
}

struct PeerIdentity {
    lid: u16,
    gid: [u8; 16],
    qp_num: u32,
}

struct CompChannel {
    channel: NonNull<ibv_comp_channel>,
}

impl Drop for CompChannel {
    fn drop(&mut self) {
        unsafe {
            ibv_destroy_comp_channel(self.channel.as_ptr());
        }
    }
}

unsafe impl Send for CompChannel {}
unsafe impl Sync for CompChannel {}

struct CompletionQueue {
    cq: NonNull<ibv_cq>,
}

impl Drop for CompletionQueue {
    fn drop(&mut self) {
        unsafe {
            ibv_destroy_cq(self.cq.as_ptr());
        }
    }
}

unsafe impl Send for CompletionQueue {}
unsafe impl Sync for CompletionQueue {}

struct QueuePairHandle {
    qp: NonNull<ibv_qp>,
}

impl Drop for QueuePairHandle {
    fn drop(&mut self) {
        unsafe {
            ibv_destroy_qp(self.qp.as_ptr());
        }
    }
}

unsafe impl Send for QueuePairHandle {}
unsafe impl Sync for QueuePairHandle {}

/// Per-outstanding-WR record; owns the buffer until completion.
struct WorkRequestContext {
    buf: OwnedBlock,
}

pub struct Connection {
    // Field order is drop order: the WR table releases its buffers first,
    // then MRs, QP, CQ, channel, PD, and the device context last.
    wr_table: Mutex<HashMap<u64, WorkRequestContext>>,
    remote_mr: Mutex<Option<RemoteRegion>>,
    local_mr: Arc<MemoryRegion>,
    published_mr: Option<Arc<MemoryRegion>>,
    qp: QueuePairHandle,
    cq: CompletionQueue,
    comp_channel: Option<CompChannel>,
    _pd: Arc<ProtectionDomain>,
    pool: BufferPool,
    region: Option<Arc<SharedRegion>>,
    handler: Arc<dyn RdmaEventHandler>,
    tcp: Mutex<TcpStream>,
    device: Arc<RdmaDevice>,
    poller_type: PollerType,
    next_wr_id: AtomicU64,
    is_connected: AtomicBool,
    poller_stop: AtomicBool,
    poller_thread: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    /// Builds the verbs resources, runs the bring-up handshake over `tcp`,
    /// and leaves the connection live with its poller running. A non-empty
    /// `region` marks this side as the server that publishes the region.
    pub(crate) fn establish(
        device: Arc<RdmaDevice>,
        tcp: TcpStream,
        region: Option<Arc<SharedRegion>>,
        pool: BufferPool,
        handler: Arc<dyn RdmaEventHandler>,
        poller_type: PollerType,
    ) -> Result<Arc<Connection>> {
        tcp.set_nodelay(true)?;
        tcp.set_read_timeout(Some(HANDSHAKE_TIMEOUT))?;

        let ctx_ptr = device.context().context().as_ptr();
        let pd = device
            .context()
            .alloc_pd()
            .map_err(|error| TransportError::Backend(error.to_string()))?;

        let comp_channel = match poller_type {
            PollerType::Blocking => {
                let raw = unsafe { ibv_create_comp_channel(ctx_ptr) };
                let channel = NonNull::new(raw)
                    .ok_or_else(|| TransportError::verbs_os("ibv_create_comp_channel"))?;
                set_nonblocking(unsafe { channel.as_ref().fd })?;
                Some(CompChannel { channel })
            }
            PollerType::Spinning => None,
        };

        let channel_ptr = comp_channel
            .as_ref()
            .map_or(null_mut(), |c| c.channel.as_ptr());
        let raw_cq = unsafe { ibv_create_cq(ctx_ptr, CQ_ENTRIES, null_mut(), channel_ptr, 0) };
        let cq = CompletionQueue {
            cq: NonNull::new(raw_cq).ok_or_else(|| TransportError::verbs_os("ibv_create_cq"))?,
        };

        let mut qp_init = unsafe { MaybeUninit::<ibv_qp_init_attr>::zeroed().assume_init() };
        qp_init.send_cq = cq.cq.as_ptr();
        qp_init.recv_cq = cq.cq.as_ptr();
        qp_init.qp_type = ibv_qp_type::IBV_QPT_RC;
        qp_init.cap.max_send_wr = MAX_SEND_WR;
        qp_init.cap.max_recv_wr = MAX_RECV_WR;
        qp_init.cap.max_send_sge = MAX_SEND_SGE;
        qp_init.cap.max_recv_sge = MAX_RECV_SGE;
        let raw_qp = unsafe { ibv_create_qp(pd.pd().as_ptr(), &raw mut qp_init) };
        let qp = QueuePairHandle {
            qp: NonNull::new(raw_qp).ok_or_else(|| TransportError::verbs_os("ibv_create_qp"))?,
        };

        transit_to_init(qp.qp.as_ptr(), device.port_num())?;

        let local_mr = unsafe {
            pd.reg_mr(pool.region_addr(), pool.region_len(), AccessFlags::LocalWrite)
        }
        .map_err(|error| TransportError::Backend(error.to_string()))?;

        let published_mr = match region.as_ref() {
            Some(region) => Some(
                unsafe {
                    pd.reg_mr(
                        region.as_ptr() as usize,
                        region.len(),
                        AccessFlags::LocalWrite | AccessFlags::RemoteWrite | AccessFlags::RemoteRead,
                    )
                }
                .map_err(|error| TransportError::Backend(error.to_string()))?,
            ),
            None => None,
        };

        let conn = Arc::new(Connection {
            wr_table: Mutex::new(HashMap::new()),
            remote_mr: Mutex::new(None),
            local_mr,
            published_mr,
            qp,
            cq,
            comp_channel,
            _pd: pd,
            pool,
            region,
            handler,
            tcp: Mutex::new(tcp),
            device,
            poller_type,
            next_wr_id: AtomicU64::new(1),
            is_connected: AtomicBool::new(false),
            poller_stop: AtomicBool::new(false),
            poller_thread: Mutex::new(None),
        });

        conn.send_conn_info()?;
        let peer = conn.recv_conn_info()?;
        conn.transit_to_rtr(&peer)?;
        conn.transit_to_rts()?;

        if conn.region.is_some() {
            conn.mark_connected()?;
            conn.handler.on_connected(&conn);
            conn.send_memory_region()?;
        } else {
            let remote = conn.recv_memory_region()?;
            *conn.remote_mr.lock() = Some(remote);
            conn.mark_connected()?;
            conn.handler.on_connected(&conn);
        }
        // The side channel is idle from here on.
        conn.tcp.lock().set_read_timeout(None)?;
        Ok(conn)
    }

    pub fn is_connected(&self) -> bool {
        self.is_connected.load(Ordering::Acquire)
    }

    /// The peer's published region, once the client side is connected.
    pub fn remote_memory_region(&self) -> Option<RemoteRegion> {
        *self.remote_mr.lock()
    }

    /// The descriptor this (server) side published to its peer.
    pub fn published_region(&self) -> Option<RemoteRegion> {
        let mr = self.published_mr.as_ref()?;
        let region = self.region.as_ref()?;
        Some(RemoteRegion {
            addr: region.as_ptr() as u64,
            size: region.len() as u64,
            rkey: mr.rkey(),
        })
    }

    /// Posts one receive backed by a fresh pool block.
    pub fn post_receive(&self) -> Result<()> {
        let block = self.pool.allocate().ok_or(TransportError::PoolExhausted)?;
        let wr_id = self.next_wr_id.fetch_add(1, Ordering::Relaxed);

        let mut sge = ibv_sge {
            addr: block.addr(),
            length: block.len() as u32,
            lkey: self.local_mr.lkey(),
        };
        let mut wr = unsafe { MaybeUninit::<ibv_recv_wr>::zeroed().assume_init() };
        wr.wr_id = wr_id;
        wr.next = null_mut();
        wr.sg_list = &raw mut sge;
        wr.num_sge = 1;

        self.wr_table
            .lock()
            .insert(wr_id, WorkRequestContext { buf: block });

        let mut bad_wr: *mut ibv_recv_wr = null_mut();
        let ret = unsafe { ibv_post_recv(self.qp.qp.as_ptr(), &raw mut wr, &raw mut bad_wr) };
        if ret != 0 {
            self.wr_table.lock().remove(&wr_id);
            return Err(TransportError::verbs("ibv_post_recv", ret));
        }
        log::trace!("posted RECV wr #{wr_id}");
        Ok(())
    }

    /// Sends the block's message frame (length prefix plus payload) to the
    /// peer. The block stays owned by the WR table until the completion.
    pub fn async_send(&self, mut block: OwnedBlock) -> Result<()> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        let frame_len = block.message_view().frame_len();
        let wr_id = self.next_wr_id.fetch_add(1, Ordering::Relaxed);

        let mut sge = ibv_sge {
            addr: block.addr(),
            length: frame_len as u32,
            lkey: self.local_mr.lkey(),
        };
        let mut wr = unsafe { MaybeUninit::<ibv_send_wr>::zeroed().assume_init() };
        wr.wr_id = wr_id;
        wr.next = null_mut();
        wr.sg_list = &raw mut sge;
        wr.num_sge = 1;
        wr.opcode = ibv_wr_opcode::IBV_WR_SEND;
        wr.send_flags = ibv_send_flags::IBV_SEND_SIGNALED.0;

        self.wr_table
            .lock()
            .insert(wr_id, WorkRequestContext { buf: block });

        let mut bad_wr: *mut ibv_send_wr = null_mut();
        let ret = unsafe { ibv_post_send(self.qp.qp.as_ptr(), &raw mut wr, &raw mut bad_wr) };
        if ret != 0 {
            self.wr_table.lock().remove(&wr_id);
            return Err(TransportError::verbs("ibv_post_send", ret));
        }
        log::trace!("posted SEND wr #{wr_id}, frame_len={frame_len}");
        Ok(())
    }

    /// Reads `length` bytes at `offset` into a scratch block from the
    /// peer's published region. The completion surfaces the block through
    /// `on_rdma_read_complete` with the view's length already set.
    pub fn async_read(&self, offset: u64, length: usize) -> Result<()> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        let remote = *self.remote_mr.lock();
        let Some(remote) = remote else {
            return Err(TransportError::NotConnected);
        };
        if offset
            .checked_add(length as u64)
            .is_none_or(|end| end > remote.size)
        {
            return Err(TransportError::InvalidArgument(
                "read exceeds the remote memory region",
            ));
        }

        let mut block = self.pool.allocate().ok_or(TransportError::PoolExhausted)?;
        let payload_addr = {
            let mut view = block.message_view();
            if length > view.max_payload() {
                return Err(TransportError::InvalidArgument(
                    "read exceeds the block capacity",
                ));
            }
            view.set_payload_len(length);
            view.payload_addr()
        };
        let wr_id = self.next_wr_id.fetch_add(1, Ordering::Relaxed);

        let mut sge = ibv_sge {
            addr: payload_addr,
            length: length as u32,
            lkey: self.local_mr.lkey(),
        };
        let mut wr = unsafe { MaybeUninit::<ibv_send_wr>::zeroed().assume_init() };
        wr.wr_id = wr_id;
        wr.next = null_mut();
        wr.sg_list = &raw mut sge;
        wr.num_sge = 1;
        wr.opcode = ibv_wr_opcode::IBV_WR_RDMA_READ;
        wr.send_flags = ibv_send_flags::IBV_SEND_SIGNALED.0;
        wr.wr.rdma.remote_addr = remote.addr + offset;
        wr.wr.rdma.rkey = remote.rkey;

        self.wr_table
            .lock()
            .insert(wr_id, WorkRequestContext { buf: block });

        let mut bad_wr: *mut ibv_send_wr = null_mut();
        let ret = unsafe { ibv_post_send(self.qp.qp.as_ptr(), &raw mut wr, &raw mut bad_wr) };
        if ret != 0 {
            self.wr_table.lock().remove(&wr_id);
            return Err(TransportError::verbs("ibv_post_send", ret));
        }
        log::trace!("posted READ wr #{wr_id}, offset={offset:#x}, length={length}");
        Ok(())
    }

    /// Stops the poller and joins it. Verbs resources are released when the
    /// last handle drops, strictly after the join.
    pub fn shutdown(&self) {
        self.is_connected.store(false, Ordering::Release);
        self.poller_stop.store(true, Ordering::Release);
        let handle = self.poller_thread.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }

    fn send_conn_info(&self) -> Result<()> {
        let (lid, gid) = self.device.local_identity()?;
        let qp_num = unsafe { self.qp.qp.as_ref().qp_num };
        log::debug!("local ConnInfo: qp_num={qp_num}, lid={lid}");
        ConnectorMessage::ConnInfo { lid, gid, qp_num }.write_to(&mut self.tcp.lock())
    }

    fn recv_conn_info(&self) -> Result<PeerIdentity> {
        match ConnectorMessage::read_from(&mut self.tcp.lock())? {
            ConnectorMessage::ConnInfo { lid, gid, qp_num } => {
                log::debug!("peer ConnInfo: qp_num={qp_num}, lid={lid}");
                Ok(PeerIdentity { lid, gid, qp_num })
            }
            ConnectorMessage::MemoryRegion { .. } => Err(TransportError::Protocol(
                "expected ConnInfo during bring-up",
            )),
        }
    }

    fn send_memory_region(&self) -> Result<()> {
        let descriptor = self.published_region().ok_or(TransportError::Protocol(
            "server connection has no published region",
        ))?;
        log::debug!(
            "publishing memory region: addr={:#x}, size={}, rkey={:#x}",
            descriptor.addr,
            descriptor.size,
            descriptor.rkey
        );
        ConnectorMessage::MemoryRegion {
            addr: descriptor.addr,
            size: descriptor.size,
            rkey: descriptor.rkey,
        }
        .write_to(&mut self.tcp.lock())
    }

    fn recv_memory_region(&self) -> Result<RemoteRegion> {
        match ConnectorMessage::read_from(&mut self.tcp.lock())? {
            ConnectorMessage::MemoryRegion { addr, size, rkey } => {
                log::debug!("peer memory region: addr={addr:#x}, size={size}, rkey={rkey:#x}");
                Ok(RemoteRegion { addr, size, rkey })
            }
            ConnectorMessage::ConnInfo { .. } => Err(TransportError::Protocol(
                "expected MemoryRegion during bring-up",
            )),
        }
    }

    fn transit_to_rtr(&self, peer: &PeerIdentity) -> Result<()> {
        let mut attr = unsafe { MaybeUninit::<ibv_qp_attr>::zeroed().assume_init() };
        attr.qp_state = ibv_qp_state::IBV_QPS_RTR;
        attr.path_mtu = ibv_mtu::IBV_MTU_1024;
        attr.dest_qp_num = peer.qp_num;
        attr.rq_psn = 0;
        attr.max_dest_rd_atomic = 1;
        attr.min_rnr_timer = 12; // 0.64 ms
        attr.ah_attr.port_num = self.device.port_num();
        if peer.lid > 0 {
            attr.ah_attr.dlid = peer.lid;
        } else {
            // A fabric without LIDs routes by GID.
            attr.ah_attr.is_global = 1;
            attr.ah_attr.grh.dgid = Gid { raw: peer.gid }.into();
            attr.ah_attr.grh.hop_limit = 1;
        }

        let mask = (ibv_qp_attr_mask::IBV_QP_STATE.0
            | ibv_qp_attr_mask::IBV_QP_AV.0
            | ibv_qp_attr_mask::IBV_QP_PATH_MTU.0
            | ibv_qp_attr_mask::IBV_QP_DEST_QPN.0
            | ibv_qp_attr_mask::IBV_QP_RQ_PSN.0
            | ibv_qp_attr_mask::IBV_QP_MAX_DEST_RD_ATOMIC.0
            | ibv_qp_attr_mask::IBV_QP_MIN_RNR_TIMER.0) as i32;
        let ret = unsafe { ibv_modify_qp(self.qp.qp.as_ptr(), &raw mut attr, mask) };
        if ret != 0 {
            return Err(TransportError::verbs("QP INIT->RTR", ret));
        }
        Ok(())
    }

    fn transit_to_rts(&self) -> Result<()> {
        let mut attr = unsafe { MaybeUninit::<ibv_qp_attr>::zeroed().assume_init() };
        attr.qp_state = ibv_qp_state::IBV_QPS_RTS;
        attr.sq_psn = 0;
        attr.timeout = 8; // 1.048 ms
        // Infinite retry: a stuck peer is detected by upper-layer deadlines,
        // not by the HCA.
        attr.retry_cnt = 7;
        attr.rnr_retry = 7;
        attr.max_rd_atomic = 1;

        let mask = (ibv_qp_attr_mask::IBV_QP_STATE.0
            | ibv_qp_attr_mask::IBV_QP_SQ_PSN.0
            | ibv_qp_attr_mask::IBV_QP_TIMEOUT.0
            | ibv_qp_attr_mask::IBV_QP_RETRY_CNT.0
            | ibv_qp_attr_mask::IBV_QP_RNR_RETRY.0
            | ibv_qp_attr_mask::IBV_QP_MAX_QP_RD_ATOMIC.0) as i32;
        let ret = unsafe { ibv_modify_qp(self.qp.qp.as_ptr(), &raw mut attr, mask) };
        if ret != 0 {
            return Err(TransportError::verbs("QP RTR->RTS", ret));
        }
        Ok(())
    }

    fn mark_connected(self: &Arc<Self>) -> Result<()> {
        let mut attr = unsafe { MaybeUninit::<ibv_qp_attr>::zeroed().assume_init() };
        let mut init = unsafe { MaybeUninit::<ibv_qp_init_attr>::zeroed().assume_init() };
        let ret = unsafe {
            ibv_query_qp(
                self.qp.qp.as_ptr(),
                &raw mut attr,
                ibv_qp_attr_mask::IBV_QP_STATE.0 as i32,
                &raw mut init,
            )
        };
        if ret != 0 {
            return Err(TransportError::verbs("ibv_query_qp", ret));
        }
        if attr.qp_state != ibv_qp_state::IBV_QPS_RTS {
            return Err(TransportError::Protocol(
                "queue pair did not reach RTS during bring-up",
            ));
        }

        if self.comp_channel.is_some() {
            let ret = unsafe { ibv_req_notify_cq(self.cq.cq.as_ptr(), 0) };
            if ret != 0 {
                return Err(TransportError::verbs("ibv_req_notify_cq", ret));
            }
        }

        let poller = {
            let conn = Arc::clone(self);
            thread::Builder::new()
                .name("cadent-cq-poller".to_string())
                .spawn(move || match conn.poller_type {
                    PollerType::Blocking => conn.poll_completions_blocking(),
                    PollerType::Spinning => conn.poll_completions_spinning(),
                })?
        };
        *self.poller_thread.lock() = Some(poller);

        for _ in 0..RECV_BACKLOG {
            self.post_receive()?;
        }
        self.is_connected.store(true, Ordering::Release);
        Ok(())
    }

    fn poll_completions_blocking(self: Arc<Self>) {
        let channel = self
            .comp_channel
            .as_ref()
            .expect("blocking poller requires a completion channel");
        let mut fds = libc::pollfd {
            fd: unsafe { channel.channel.as_ref().fd },
            events: libc::POLLIN,
            revents: 0,
        };

        while !self.poller_stop.load(Ordering::Acquire) {
            let mut ret;
            loop {
                ret = unsafe { libc::poll(&raw mut fds, 1, POLL_TIMEOUT_MS) };
                if ret != 0 || self.poller_stop.load(Ordering::Acquire) {
                    break;
                }
            }
            if ret < 0 {
                log::error!(
                    "completion channel poll failed: {}",
                    std::io::Error::last_os_error()
                );
                std::process::abort();
            }
            if self.poller_stop.load(Ordering::Acquire) {
                break;
            }

            let mut cq_out: *mut ibv_cq = null_mut();
            let mut cq_ctx: *mut c_void = null_mut();
            let ret = unsafe {
                ibv_get_cq_event(channel.channel.as_ptr(), &raw mut cq_out, &raw mut cq_ctx)
            };
            if ret < 0 {
                // Non-blocking fd: the event can already be consumed.
                continue;
            }
            unsafe {
                ibv_ack_cq_events(cq_out, 1);
            }
            let ret = unsafe { ibv_req_notify_cq(cq_out, 0) };
            if ret != 0 {
                log::warn!("ibv_req_notify_cq failed with {ret}");
                continue;
            }
            self.drain_completion_queue(cq_out);
        }
    }

    fn poll_completions_spinning(self: Arc<Self>) {
        let cq = self.cq.cq.as_ptr();
        while !self.poller_stop.load(Ordering::Acquire) {
            self.drain_completion_queue(cq);
            std::hint::spin_loop();
        }
    }

    fn drain_completion_queue(self: &Arc<Self>, cq: *mut ibv_cq) {
        let mut wc = unsafe { MaybeUninit::<ibv_wc>::zeroed().assume_init() };
        while !self.poller_stop.load(Ordering::Acquire)
            && unsafe { ibv_poll_cq(cq, 1, &raw mut wc) } > 0
        {
            self.handle_work_completion(&wc);
        }
    }

    fn handle_work_completion(self: &Arc<Self>, wc: &ibv_wc) {
        if wc.status != ibv_wc_status::IBV_WC_SUCCESS {
            log::error!(
                "work completion failed: wr_id=#{}, status={:?}, opcode={:?}, vendor_err={}",
                wc.wr_id,
                wc.status,
                wc.opcode,
                wc.vendor_err
            );
            std::process::abort();
        }

        let ctx = self.wr_table.lock().remove(&wc.wr_id);
        let Some(ctx) = ctx else {
            log::error!("no work request context for wr_id #{}", wc.wr_id);
            std::process::abort();
        };

        match wc.opcode {
            opcode if opcode == ibv_wc_opcode::IBV_WC_RECV => {
                // Refill the backlog before handing the frame up.
                if let Err(error) = self.post_receive() {
                    log::error!("failed to repost receive: {error}");
                    std::process::abort();
                }
                self.handler.on_recv(self, ctx.buf);
            }
            opcode if opcode == ibv_wc_opcode::IBV_WC_SEND => {
                self.handler.on_sent(self, ctx.buf);
            }
            opcode if opcode == ibv_wc_opcode::IBV_WC_RDMA_READ => {
                self.handler.on_rdma_read_complete(self, ctx.buf);
            }
            opcode => {
                log::error!("dropping completion with unhandled opcode {opcode:?} (wr_id #{})", wc.wr_id);
            }
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        // The poller owns a strong handle while it runs, so reaching drop
        // means it has either been joined or already exited on its own.
        self.poller_stop.store(true, Ordering::Release);
        let handle = self.poller_thread.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

fn transit_to_init(qp: *mut ibv_qp, port_num: u8) -> Result<()> {
    let mut attr = unsafe { MaybeUninit::<ibv_qp_attr>::zeroed().assume_init() };
    attr.qp_state = ibv_qp_state::IBV_QPS_INIT;
    attr.pkey_index = 0;
    attr.port_num = port_num;
    attr.qp_access_flags = (ibv_access_flags::IBV_ACCESS_LOCAL_WRITE.0
        | ibv_access_flags::IBV_ACCESS_REMOTE_READ.0
        | ibv_access_flags::IBV_ACCESS_REMOTE_WRITE.0
        | ibv_access_flags::IBV_ACCESS_REMOTE_ATOMIC.0) as u32;

    let mask = (ibv_qp_attr_mask::IBV_QP_STATE.0
        | ibv_qp_attr_mask::IBV_QP_PKEY_INDEX.0
        | ibv_qp_attr_mask::IBV_QP_PORT.0
        | ibv_qp_attr_mask::IBV_QP_ACCESS_FLAGS.0) as i32;
    let ret = unsafe { ibv_modify_qp(qp, &raw mut attr, mask) };
    if ret != 0 {
        return Err(TransportError::verbs("QP RESET->INIT", ret));
    }
    Ok(())
}

fn set_nonblocking(fd: i32) -> Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(TransportError::verbs_os("fcntl(F_GETFL)"));
    }
    let ret = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if ret < 0 {
        return Err(TransportError::verbs_os("fcntl(F_SETFL)"));
    }
    Ok(())
}
