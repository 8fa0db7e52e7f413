mod buffer;
mod connection;
mod connector;
mod device;
mod error;
mod executor;
pub mod logging;
mod region;
mod wire;

pub use buffer::{BufferPool, MessageView, OwnedBlock};
pub use connection::{Connection, PollerType, RECV_BACKLOG, RdmaEventHandler, RemoteRegion};
pub use connector::RdmaConnector;
pub use device::RdmaDevice;
pub use error::{Result, TransportError};
pub use executor::{Executor, Timer, TimerStatus, wall_clock_ns};
pub use region::SharedRegion;
pub use wire::ConnectorMessage;
