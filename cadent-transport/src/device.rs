//! InfiniBand device selection.

use std::io;
use std::mem::MaybeUninit;
use std::sync::Arc;

use rdma_mummy_sys::{ibv_port_attr, ibv_query_port};
use sideway::ibverbs::device::{DeviceInfo, DeviceList};
use sideway::ibverbs::device_context::{DeviceContext, PortState};

use crate::error::{Result, TransportError};

/// An opened verbs device pinned to one active port.
pub struct RdmaDevice {
    name: String,
    ctx: Arc<DeviceContext>,
    port_num: u8,
}

impl RdmaDevice {
    /// Opens the named device and retains its first `ACTIVE` port. Only the
    /// first device whose name matches is kept; later duplicates are left
    /// untouched. Failing to find the named device with an active port is
    /// fatal to startup.
    pub fn open(name: &str) -> Result<Self> {
        let device_list =
            DeviceList::new().map_err(|error| TransportError::Backend(error.to_string()))?;

        let mut opened: Option<(Arc<DeviceContext>, u8)> = None;
        for device in device_list.iter() {
            let ctx = device
                .open()
                .map_err(|error| TransportError::Backend(error.to_string()))?;
            let dev_attr = ctx
                .query_device()
                .map_err(|error| TransportError::Backend(error.to_string()))?;

            let mut active_ports = Vec::new();
            for port_num in 1..=dev_attr.phys_port_cnt() {
                let port_attr = ctx
                    .query_port(port_num)
                    .map_err(|error| TransportError::Backend(error.to_string()))?;
                if port_attr.port_state() == PortState::Active {
                    active_ports.push(port_num);
                }
            }
            log::info!(
                "found ibv device: name={}, active_ports={:?}",
                device.name(),
                active_ports
            );

            if device.name() == name && opened.is_none() {
                let port_num = *active_ports
                    .first()
                    .ok_or_else(|| TransportError::NoActivePort(name.to_string()))?;
                opened = Some((ctx, port_num));
            }
        }

        let (ctx, port_num) =
            opened.ok_or_else(|| TransportError::DeviceNotFound(name.to_string()))?;
        log::info!("opened ibv device {name} at port {port_num}");
        Ok(Self {
            name: name.to_string(),
            ctx,
            port_num,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn context(&self) -> &Arc<DeviceContext> {
        &self.ctx
    }

    pub fn port_num(&self) -> u8 {
        self.port_num
    }

    /// Local identity for the ConnInfo exchange: the port LID, and the GID
    /// at index 0 when the fabric has no LIDs (RoCE).
    pub(crate) fn local_identity(&self) -> Result<(u16, [u8; 16])> {
        let mut raw_port = unsafe { MaybeUninit::<ibv_port_attr>::zeroed().assume_init() };
        let ret =
            unsafe { ibv_query_port(self.ctx.context().as_ptr(), self.port_num, &raw mut raw_port) };
        if ret != 0 {
            return Err(TransportError::Backend(format!(
                "query raw port attr failed: {}",
                io::Error::from_raw_os_error(ret)
            )));
        }

        let mut gid = [0_u8; 16];
        if raw_port.lid == 0 {
            let queried = self
                .ctx
                .query_gid(self.port_num, 0)
                .map_err(|error| TransportError::Backend(error.to_string()))?;
            gid = queried.raw;
        }
        Ok((raw_port.lid, gid))
    }
}
