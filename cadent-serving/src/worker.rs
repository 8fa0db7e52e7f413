//! The dispatcher model worker: accepts dispatch requests from frontends
//! over RDMA, stamps timing clocks, assigns global ids, and routes each
//! query into its per-model entrance. A reply is sent only on failure;
//! the success path answers through the eventual inference result.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use cadent_transport::{
    BufferPool, Connection, Executor, OwnedBlock, PollerType, RdmaConnector, RdmaEventHandler,
    SharedRegion, wall_clock_ns,
};
use crossbeam::sync::ShardedLock;
use parking_lot::Mutex;

use crate::control::ControlMessage;
use crate::cpu;
use crate::error::Result;
use crate::types::{
    DispatchReply, DispatchRequest, DispatchStatus, GlobalIdIssuer, ModelIndex, QueryStamp,
};

const SMALL_BUFFER_POOL_BITS: u32 = 24;
const SMALL_BUFFER_BLOCK_BITS: u32 = 12;
const SCRATCH_REGION_BYTES: usize = 4096;

/// Opaque endpoint of the upstream rank scheduler; accepts one query for
/// one model index.
pub trait QueryEntrance: Send + Sync {
    fn enqueue_query(&self, request: DispatchRequest) -> DispatchStatus;
}

/// The dispatch core, separated from the transport so it can be exercised
/// directly.
pub struct QueryDispatcher {
    entrances: ShardedLock<Vec<Option<Arc<dyn QueryEntrance>>>>,
    global_ids: Arc<GlobalIdIssuer>,
}

impl QueryDispatcher {
    pub fn new(global_ids: Arc<GlobalIdIssuer>) -> Self {
        Self {
            entrances: ShardedLock::new(Vec::new()),
            global_ids,
        }
    }

    pub fn register_entrance(&self, model_index: ModelIndex, entrance: Arc<dyn QueryEntrance>) {
        let mut table = self.entrances.write().expect("entrance table poisoned");
        let index = model_index.0 as usize;
        if table.len() <= index {
            table.resize_with(index + 1, || None);
        }
        table[index] = Some(entrance);
    }

    /// Stamps the clock and the global id, enqueues the query, and returns
    /// a reply only when the enqueue fails.
    pub fn handle_dispatch(
        &self,
        mut request: DispatchRequest,
        dispatcher_recv_ns: i64,
    ) -> Option<DispatchReply> {
        request.query.clock.dispatcher_recv_ns = dispatcher_recv_ns;
        request.query.clock.dispatcher_sched_ns = wall_clock_ns();
        request.query.global_id = self.global_ids.next_id().0;

        // The request moves into the entrance below; latch everything a
        // failure reply echoes first.
        let model_index = request.model_index;
        let query_id = request.query.query_id;
        let clock = request.query.clock;

        let entrance = {
            let table = self.entrances.read().expect("entrance table poisoned");
            table.get(model_index.0 as usize).cloned().flatten()
        };
        // An unknown model index is an upstream misconfiguration, not a
        // recoverable dispatch failure.
        let entrance =
            entrance.unwrap_or_else(|| panic!("no entrance registered for model {model_index}"));

        let status = entrance.enqueue_query(request);
        if status == DispatchStatus::Ok {
            return None;
        }
        Some(DispatchReply {
            status,
            model_index,
            query_list: vec![QueryStamp { query_id, clock }],
        })
    }
}

struct WorkerRdmaHandler {
    dispatcher: Arc<QueryDispatcher>,
    reply_pool: BufferPool,
}

impl WorkerRdmaHandler {
    fn send_reply(&self, conn: &Arc<Connection>, reply: DispatchReply) {
        let Some(mut block) = self.reply_pool.allocate() else {
            log::error!("reply buffer pool exhausted; dropping DispatchReply");
            return;
        };
        block
            .message_view()
            .write_payload(&ControlMessage::DispatchReply(reply).encode());
        if let Err(error) = conn.async_send(block) {
            log::error!("failed to send DispatchReply: {error}");
            std::process::abort();
        }
    }
}

impl RdmaEventHandler for WorkerRdmaHandler {
    fn on_recv(&self, conn: &Arc<Connection>, mut buf: OwnedBlock) {
        let dispatcher_recv_ns = wall_clock_ns();
        let message = {
            let view = buf.message_view();
            ControlMessage::decode(view.payload())
        };
        let Some(message) = message else {
            log::error!("dropping malformed control frame");
            return;
        };
        match message {
            ControlMessage::Dispatch(request) => {
                if let Some(reply) = self.dispatcher.handle_dispatch(request, dispatcher_recv_ns) {
                    self.send_reply(conn, reply);
                }
            }
            other => {
                log::error!("model worker cannot handle control message: {other:?}");
                std::process::abort();
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct ModelWorkerConfig {
    pub rdma_device: String,
    pub tcp_port: u16,
    pub pin_cpu: Option<usize>,
    pub poller_type: PollerType,
}

pub struct ModelWorker {
    config: ModelWorkerConfig,
    executor: Executor,
    dispatcher: Arc<QueryDispatcher>,
    connector: Arc<RdmaConnector>,
    scratch_region: Arc<SharedRegion>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl ModelWorker {
    pub fn new(config: ModelWorkerConfig, global_ids: Arc<GlobalIdIssuer>) -> Result<Self> {
        let executor = Executor::new();
        let dispatcher = Arc::new(QueryDispatcher::new(global_ids));
        // One pool serves both receive buffers and outgoing replies.
        let reply_pool = BufferPool::new(SMALL_BUFFER_POOL_BITS, SMALL_BUFFER_BLOCK_BITS);
        let handler = Arc::new(WorkerRdmaHandler {
            dispatcher: Arc::clone(&dispatcher),
            reply_pool: reply_pool.clone(),
        });
        let connector = Arc::new(RdmaConnector::new(
            &config.rdma_device,
            reply_pool,
            handler,
            config.poller_type,
        )?);
        Ok(Self {
            config,
            executor,
            dispatcher,
            connector,
            scratch_region: Arc::new(SharedRegion::new(SCRATCH_REGION_BYTES)),
            thread: Mutex::new(None),
        })
    }

    /// Registers the entrance for one model session. The table update is
    /// marshalled onto the worker's executor thread.
    pub fn add_model_session(&self, model_index: ModelIndex, entrance: Arc<dyn QueryEntrance>) {
        let dispatcher = Arc::clone(&self.dispatcher);
        self.executor
            .post(move || dispatcher.register_entrance(model_index, entrance));
    }

    pub fn start(&self) {
        let executor = self.executor.clone();
        let connector = Arc::clone(&self.connector);
        let region = Arc::clone(&self.scratch_region);
        let tcp_port = self.config.tcp_port;
        let pin_cpu = self.config.pin_cpu;
        let handle = thread::Builder::new()
            .name("cadent-model-worker".to_string())
            .spawn(move || {
                if let Err(error) = connector.listen_tcp(tcp_port, region) {
                    log::error!("model worker failed to listen on port {tcp_port}: {error}");
                    std::process::abort();
                }
                if let Some(core) = pin_cpu {
                    cpu::pin_current_thread(core);
                    log::info!("model worker pinned on cpu {core}");
                }
                log::info!("starting model worker, listening on port {tcp_port}");
                executor.run_event_loop();
            })
            .expect("spawn model worker thread");
        *self.thread.lock() = Some(handle);
    }

    pub fn stop(&self) {
        self.executor.stop_event_loop();
        self.connector.stop();
    }

    pub fn join(&self) {
        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::{QueryDispatcher, QueryEntrance};
    use crate::types::{
        DispatchRequest, DispatchStatus, GlobalIdIssuer, ModelIndex, QueryClock, QueryWithoutInput,
    };

    struct StaticEntrance {
        status: DispatchStatus,
        seen: Mutex<Vec<DispatchRequest>>,
    }

    impl StaticEntrance {
        fn new(status: DispatchStatus) -> Arc<Self> {
            Arc::new(Self {
                status,
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    impl QueryEntrance for StaticEntrance {
        fn enqueue_query(&self, request: DispatchRequest) -> DispatchStatus {
            self.seen.lock().push(request);
            self.status
        }
    }

    fn request(model_index: u32, query_id: u64) -> DispatchRequest {
        DispatchRequest {
            model_index: ModelIndex(model_index),
            query: QueryWithoutInput {
                query_id,
                global_id: 0,
                clock: QueryClock {
                    frontend_send_ns: 1_000,
                    dispatcher_recv_ns: 0,
                    dispatcher_sched_ns: 0,
                },
            },
        }
    }

    #[test]
    fn successful_dispatch_sends_no_reply() {
        let dispatcher = QueryDispatcher::new(Arc::new(GlobalIdIssuer::new()));
        let entrance = StaticEntrance::new(DispatchStatus::Ok);
        dispatcher.register_entrance(ModelIndex(0), entrance.clone());

        let reply = dispatcher.handle_dispatch(request(0, 11), 5_000);
        assert!(reply.is_none());

        let seen = entrance.seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].query.query_id, 11);
        assert_eq!(seen[0].query.global_id, 1);
        assert_eq!(seen[0].query.clock.dispatcher_recv_ns, 5_000);
        assert!(seen[0].query.clock.dispatcher_sched_ns >= 5_000);
    }

    #[test]
    fn failed_dispatch_echoes_the_query_and_its_clock() {
        let dispatcher = QueryDispatcher::new(Arc::new(GlobalIdIssuer::new()));
        dispatcher.register_entrance(
            ModelIndex(2),
            StaticEntrance::new(DispatchStatus::ModelOverloaded),
        );

        let recv_ns = cadent_transport::wall_clock_ns();
        let reply = dispatcher
            .handle_dispatch(request(2, 7), recv_ns)
            .expect("failure reply");
        assert_eq!(reply.status, DispatchStatus::ModelOverloaded);
        assert_eq!(reply.model_index, ModelIndex(2));
        assert_eq!(reply.query_list.len(), 1);

        let stamp = &reply.query_list[0];
        assert_eq!(stamp.query_id, 7);
        assert_eq!(stamp.clock.dispatcher_recv_ns, recv_ns);
        assert!(stamp.clock.dispatcher_sched_ns >= stamp.clock.dispatcher_recv_ns);
    }

    #[test]
    fn global_ids_increase_across_dispatches() {
        let dispatcher = QueryDispatcher::new(Arc::new(GlobalIdIssuer::new()));
        let entrance = StaticEntrance::new(DispatchStatus::Ok);
        dispatcher.register_entrance(ModelIndex(0), entrance.clone());

        dispatcher.handle_dispatch(request(0, 1), 1);
        dispatcher.handle_dispatch(request(0, 2), 2);

        let seen = entrance.seen.lock();
        assert!(seen[1].query.global_id > seen[0].query.global_id);
    }

    #[test]
    #[should_panic(expected = "no entrance registered")]
    fn unknown_model_index_is_a_misconfiguration() {
        let dispatcher = QueryDispatcher::new(Arc::new(GlobalIdIssuer::new()));
        dispatcher.handle_dispatch(request(9, 1), 1);
    }
}
