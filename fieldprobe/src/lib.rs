//! Modbus field device discovery.
//!
//! Finds devices on network sockets and shared serial buses, identifies the
//! model that answered and exposes its registers as typed, age-tracked
//! values.
//!
//! # Target Descriptors
//!
//! ```text
//! <method>:<address>:<port or rate>[:<unit>]
//! ```
//!
//! Where:
//! - `<method>` - `tcp`, `udp`, or `rtu`
//! - `<address>` - Host name or IP, or a serial device (`ttyUSB0`, `/dev/ttyUSB0`)
//! - `<port or rate>` - Network port, or serial line rate in bps
//! - `<unit>` - Modbus unit address; `0` or absent tries every candidate

pub mod config;
pub mod device;
pub mod discovery;
pub mod error;
pub mod meter;
pub mod modbus;
pub mod pool;
pub mod probe;
pub mod register;
pub mod scan;
pub mod target;
pub mod transport;

pub use device::{Device, DeviceConstructor, DeviceModel, constructor};
pub use error::{ProbeError, Result};
pub use pool::{ConnectionPool, PooledConnection};
pub use probe::{DeviceTypeHandler, HandlerRegistry, ProbeOutcome, ProbeReport, Prober};
pub use register::{Register, Value};
pub use target::{ConnectionTarget, Method};
