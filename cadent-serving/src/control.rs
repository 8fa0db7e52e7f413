//! Control-plane messages carried in the length-prefixed frames between
//! frontends and the dispatcher. Fields are fixed-width little-endian.

use crate::types::{
    DispatchReply, DispatchRequest, DispatchStatus, ModelIndex, QueryClock, QueryStamp,
    QueryWithoutInput,
};

const KIND_DISPATCH: u8 = 1;
const KIND_DISPATCH_REPLY: u8 = 2;

const CLOCK_BYTES: usize = 8 * 3;
const QUERY_BYTES: usize = 8 + 8 + CLOCK_BYTES;
const DISPATCH_BYTES: usize = 4 + QUERY_BYTES;
const STAMP_BYTES: usize = 8 + CLOCK_BYTES;
const REPLY_HEADER_BYTES: usize = 1 + 4 + 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    Dispatch(DispatchRequest),
    DispatchReply(DispatchReply),
}

impl ControlMessage {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            ControlMessage::Dispatch(request) => {
                let mut bytes = Vec::with_capacity(1 + DISPATCH_BYTES);
                bytes.push(KIND_DISPATCH);
                bytes.extend_from_slice(&request.model_index.0.to_le_bytes());
                encode_query(&mut bytes, &request.query);
                bytes
            }
            ControlMessage::DispatchReply(reply) => {
                let mut bytes =
                    Vec::with_capacity(1 + REPLY_HEADER_BYTES + reply.query_list.len() * STAMP_BYTES);
                bytes.push(KIND_DISPATCH_REPLY);
                bytes.push(reply.status as u8);
                bytes.extend_from_slice(&reply.model_index.0.to_le_bytes());
                bytes.extend_from_slice(&(reply.query_list.len() as u16).to_le_bytes());
                for stamp in &reply.query_list {
                    bytes.extend_from_slice(&stamp.query_id.to_le_bytes());
                    encode_clock(&mut bytes, &stamp.clock);
                }
                bytes
            }
        }
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let (&kind, payload) = bytes.split_first()?;
        match kind {
            KIND_DISPATCH => {
                if payload.len() != DISPATCH_BYTES {
                    return None;
                }
                Some(ControlMessage::Dispatch(DispatchRequest {
                    model_index: ModelIndex(u32::from_le_bytes(payload[..4].try_into().ok()?)),
                    query: decode_query(&payload[4..])?,
                }))
            }
            KIND_DISPATCH_REPLY => {
                if payload.len() < 1 + 4 + 2 {
                    return None;
                }
                let status = DispatchStatus::from_u8(payload[0])?;
                let model_index = ModelIndex(u32::from_le_bytes(payload[1..5].try_into().ok()?));
                let count = u16::from_le_bytes(payload[5..7].try_into().ok()?) as usize;
                let entries = &payload[7..];
                if entries.len() != count * STAMP_BYTES {
                    return None;
                }
                let mut query_list = Vec::with_capacity(count);
                for chunk in entries.chunks_exact(STAMP_BYTES) {
                    query_list.push(QueryStamp {
                        query_id: u64::from_le_bytes(chunk[..8].try_into().ok()?),
                        clock: decode_clock(&chunk[8..])?,
                    });
                }
                Some(ControlMessage::DispatchReply(DispatchReply {
                    status,
                    model_index,
                    query_list,
                }))
            }
            _ => None,
        }
    }
}

fn encode_clock(out: &mut Vec<u8>, clock: &QueryClock) {
    out.extend_from_slice(&clock.frontend_send_ns.to_le_bytes());
    out.extend_from_slice(&clock.dispatcher_recv_ns.to_le_bytes());
    out.extend_from_slice(&clock.dispatcher_sched_ns.to_le_bytes());
}

fn decode_clock(bytes: &[u8]) -> Option<QueryClock> {
    if bytes.len() != CLOCK_BYTES {
        return None;
    }
    Some(QueryClock {
        frontend_send_ns: i64::from_le_bytes(bytes[..8].try_into().ok()?),
        dispatcher_recv_ns: i64::from_le_bytes(bytes[8..16].try_into().ok()?),
        dispatcher_sched_ns: i64::from_le_bytes(bytes[16..24].try_into().ok()?),
    })
}

fn encode_query(out: &mut Vec<u8>, query: &QueryWithoutInput) {
    out.extend_from_slice(&query.query_id.to_le_bytes());
    out.extend_from_slice(&query.global_id.to_le_bytes());
    encode_clock(out, &query.clock);
}

fn decode_query(bytes: &[u8]) -> Option<QueryWithoutInput> {
    if bytes.len() != QUERY_BYTES {
        return None;
    }
    Some(QueryWithoutInput {
        query_id: u64::from_le_bytes(bytes[..8].try_into().ok()?),
        global_id: u64::from_le_bytes(bytes[8..16].try_into().ok()?),
        clock: decode_clock(&bytes[16..])?,
    })
}

#[cfg(test)]
mod tests {
    use super::ControlMessage;
    use crate::types::{
        DispatchReply, DispatchRequest, DispatchStatus, ModelIndex, QueryClock, QueryStamp,
        QueryWithoutInput,
    };

    fn dispatch() -> ControlMessage {
        ControlMessage::Dispatch(DispatchRequest {
            model_index: ModelIndex(3),
            query: QueryWithoutInput {
                query_id: 42,
                global_id: 0,
                clock: QueryClock {
                    frontend_send_ns: 1_000,
                    dispatcher_recv_ns: 0,
                    dispatcher_sched_ns: 0,
                },
            },
        })
    }

    #[test]
    fn dispatch_roundtrips() {
        let message = dispatch();
        assert_eq!(ControlMessage::decode(&message.encode()), Some(message));
    }

    #[test]
    fn dispatch_reply_roundtrips() {
        let message = ControlMessage::DispatchReply(DispatchReply {
            status: DispatchStatus::ModelOverloaded,
            model_index: ModelIndex(2),
            query_list: vec![
                QueryStamp {
                    query_id: 7,
                    clock: QueryClock {
                        frontend_send_ns: 1,
                        dispatcher_recv_ns: 2,
                        dispatcher_sched_ns: 3,
                    },
                },
                QueryStamp {
                    query_id: 8,
                    clock: QueryClock::default(),
                },
            ],
        });
        assert_eq!(ControlMessage::decode(&message.encode()), Some(message));
    }

    #[test]
    fn decode_rejects_malformed_frames() {
        assert_eq!(ControlMessage::decode(&[]), None);
        assert_eq!(ControlMessage::decode(&[99, 0, 0, 0]), None);

        let mut truncated = dispatch().encode();
        truncated.pop();
        assert_eq!(ControlMessage::decode(&truncated), None);

        // A reply whose entry count disagrees with its length is invalid.
        let mut reply = ControlMessage::DispatchReply(DispatchReply {
            status: DispatchStatus::Ok,
            model_index: ModelIndex(0),
            query_list: vec![],
        })
        .encode();
        reply[6] = 2;
        assert_eq!(ControlMessage::decode(&reply), None);
    }
}
