//! Connector bring-up messages carried over the TCP side channel.
//!
//! Exactly two messages exist: the queue-pair identity exchanged before the
//! RTR transition, and the memory-region descriptor the server publishes
//! once its queue pair is ready to send. Fields are fixed-width
//! little-endian; both peers are assumed to agree on endianness.

use std::io::{Read, Write};
use std::net::TcpStream;

use crate::error::{Result, TransportError};

const KIND_CONN_INFO: u8 = 1;
const KIND_MEMORY_REGION: u8 = 2;

const CONN_INFO_BYTES: usize = 2 + 16 + 4;
const MEMORY_REGION_BYTES: usize = 8 + 8 + 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorMessage {
    /// Queue-pair identity: LID for InfiniBand routing, GID for RoCE
    /// (queried only when the port reports no LID), and the QP number.
    ConnInfo {
        lid: u16,
        gid: [u8; 16],
        qp_num: u32,
    },
    /// Descriptor of the region the server exposes for one-sided access.
    MemoryRegion { addr: u64, size: u64, rkey: u32 },
}

impl ConnectorMessage {
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(1 + CONN_INFO_BYTES.max(MEMORY_REGION_BYTES));
        match self {
            ConnectorMessage::ConnInfo { lid, gid, qp_num } => {
                bytes.push(KIND_CONN_INFO);
                bytes.extend_from_slice(&lid.to_le_bytes());
                bytes.extend_from_slice(gid);
                bytes.extend_from_slice(&qp_num.to_le_bytes());
            }
            ConnectorMessage::MemoryRegion { addr, size, rkey } => {
                bytes.push(KIND_MEMORY_REGION);
                bytes.extend_from_slice(&addr.to_le_bytes());
                bytes.extend_from_slice(&size.to_le_bytes());
                bytes.extend_from_slice(&rkey.to_le_bytes());
            }
        }
        bytes
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let (&kind, payload) = bytes.split_first()?;
        match kind {
            KIND_CONN_INFO => {
                if payload.len() != CONN_INFO_BYTES {
                    return None;
                }
                let mut gid = [0_u8; 16];
                gid.copy_from_slice(&payload[2..18]);
                Some(ConnectorMessage::ConnInfo {
                    lid: u16::from_le_bytes(payload[..2].try_into().ok()?),
                    gid,
                    qp_num: u32::from_le_bytes(payload[18..22].try_into().ok()?),
                })
            }
            KIND_MEMORY_REGION => {
                if payload.len() != MEMORY_REGION_BYTES {
                    return None;
                }
                Some(ConnectorMessage::MemoryRegion {
                    addr: u64::from_le_bytes(payload[..8].try_into().ok()?),
                    size: u64::from_le_bytes(payload[8..16].try_into().ok()?),
                    rkey: u32::from_le_bytes(payload[16..20].try_into().ok()?),
                })
            }
            _ => None,
        }
    }

    /// Writes the full frame to the side channel.
    pub fn write_to(&self, stream: &mut TcpStream) -> Result<()> {
        stream.write_all(&self.encode())?;
        Ok(())
    }

    /// Reads exactly one frame from the side channel.
    pub fn read_from(stream: &mut TcpStream) -> Result<Self> {
        let mut kind = [0_u8; 1];
        stream.read_exact(&mut kind)?;
        let payload_len = match kind[0] {
            KIND_CONN_INFO => CONN_INFO_BYTES,
            KIND_MEMORY_REGION => MEMORY_REGION_BYTES,
            _ => return Err(TransportError::Protocol("unknown connector message kind")),
        };
        let mut frame = vec![0_u8; 1 + payload_len];
        frame[0] = kind[0];
        stream.read_exact(&mut frame[1..])?;
        Self::decode(&frame).ok_or(TransportError::Protocol("malformed connector message"))
    }
}
