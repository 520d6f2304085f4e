//! Identified devices.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::error::{ProbeError, Result};
use crate::pool::{ConnectionPool, PooledConnection};
use crate::register::Register;
use crate::target::ConnectionTarget;
use crate::transport::Access;

/// Plug-in device object created by a handler's constructor.
///
/// The probe engine only holds on to it; everything model specific lives
/// behind this trait.
pub trait DeviceModel: Send + Sync {
    fn vendor_name(&self) -> &str;

    fn device_type(&self) -> &str;

    /// Registers polled by [`Device::refresh`].
    fn registers(&self) -> Vec<Register> {
        Vec::new()
    }
}

/// Builds a device object from `(target, connection, model name)`.
pub type DeviceConstructor = Arc<
    dyn Fn(&ConnectionTarget, &Arc<PooledConnection>, &str) -> Box<dyn DeviceModel> + Send + Sync,
>;

/// Wrap a typed constructor function.
pub fn constructor<D, F>(f: F) -> DeviceConstructor
where
    D: DeviceModel + 'static,
    F: Fn(&ConnectionTarget, &Arc<PooledConnection>, &str) -> D + Send + Sync + 'static,
{
    Arc::new(
        move |target: &ConnectionTarget,
              conn: &Arc<PooledConnection>,
              model: &str|
              -> Box<dyn DeviceModel> { Box::new(f(target, conn, model)) },
    )
}

/// A device found by the probe engine.
///
/// Holds its own counted reference to the connection; hand it back with
/// [`Device::release`] when done.
pub struct Device {
    pub(crate) handler: String,
    pub(crate) model: String,
    pub(crate) target: ConnectionTarget,
    pub(crate) access: Access,
    pub(crate) connection: Arc<PooledConnection>,
    pub(crate) inner: Box<dyn DeviceModel>,
    pub(crate) registers: Vec<Register>,
    pub(crate) latency: Duration,
    pub(crate) timeout: Duration,
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("handler", &self.handler)
            .field("model", &self.model)
            .field("target", &self.target)
            .field("latency", &self.latency)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl Device {
    /// Name of the handler that identified this device.
    pub fn handler(&self) -> &str {
        &self.handler
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn vendor_name(&self) -> &str {
        self.inner.vendor_name()
    }

    pub fn device_type(&self) -> &str {
        self.inner.device_type()
    }

    /// Target including the unit that answered.
    pub fn target(&self) -> &ConnectionTarget {
        &self.target
    }

    pub fn unit(&self) -> u8 {
        self.target.unit
    }

    pub fn connection(&self) -> &Arc<PooledConnection> {
        &self.connection
    }

    pub fn inner(&self) -> &dyn DeviceModel {
        self.inner.as_ref()
    }

    /// Round trip of the identification exchange.
    pub fn latency(&self) -> Duration {
        self.latency
    }

    /// Timeout used for regular polling.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn registers(&self) -> &[Register] {
        &self.registers
    }

    /// Read one register, store its value and fire its change callback.
    ///
    /// Returns whether the value changed.
    pub async fn read_register(&self, reg: &mut Register) -> Result<bool> {
        read_into(
            &self.connection,
            self.target.unit,
            reg.bank().unwrap_or(self.access),
            self.timeout,
            reg,
        )
        .await
    }

    /// Write the staged value of a writable register.
    pub async fn write_register(&self, reg: &Register) -> Result<()> {
        if !reg.is_writable() {
            return Err(ProbeError::ReadOnly(
                reg.name.clone().unwrap_or_else(|| format!("{:#06x}", reg.base)),
            ));
        }

        let words = reg.encode()?;
        let mut txn = self.connection.transaction().await?;
        let mut transport = txn.with_timeout(self.timeout);
        transport
            .write_registers(self.target.unit, reg.base, &words)
            .await?;
        Ok(())
    }

    /// Read every register of the device model; returns how many changed.
    ///
    /// Registers that fail to read keep their previous value and go stale.
    pub async fn refresh(&mut self) -> Result<usize> {
        let mut changed = 0;
        for reg in self.registers.iter_mut() {
            let access = reg.bank().unwrap_or(self.access);
            match read_into(&self.connection, self.target.unit, access, self.timeout, reg).await {
                Ok(true) => changed += 1,
                Ok(false) => {}
                Err(ProbeError::Decode(e)) => {
                    debug!(register = ?reg.name, error = %e, "Register did not decode");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(changed)
    }

    /// Give the connection reference back to the pool.
    pub fn release(self, pool: &ConnectionPool) {
        pool.release(&self.connection);
    }
}

async fn read_into(
    conn: &PooledConnection,
    unit: u8,
    access: Access,
    timeout: Duration,
    reg: &mut Register,
) -> Result<bool> {
    let words = {
        let mut txn = conn.transaction().await?;
        let mut transport = txn.with_timeout(timeout);
        transport
            .read_registers(unit, access, reg.base, reg.count)
            .await?
    };

    let changed = reg.decode_and_update(&words)?;
    if changed {
        reg.notify();
    }
    Ok(changed)
}
