//! Reference-counted connection pool.
//!
//! Network targets get a fresh handle per acquisition. Serial lines are a
//! shared multidrop bus, so every caller asking for the same tty receives
//! the same [`PooledConnection`] and transactions on it are serialized.

use crc::{CRC_16_MODBUS, Crc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{ProbeError, Result};
use crate::target::{ConnectionTarget, Method};
use crate::transport::{Connector, RegisterTransport, TransportError};

/// Number of broadcast frames sent after opening a serial line.
pub const WARMUP_FRAMES: usize = 12;

/// Pause between warm-up frames.
pub const WARMUP_INTERVAL: Duration = Duration::from_millis(100);

const MODBUS_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// Harmless broadcast frame (diagnostics, return query data) with its CRC.
///
/// Devices with automatic rate detection lock on to the line rate while
/// these go by.
pub fn warmup_frame() -> Vec<u8> {
    let mut frame = vec![0x00, 0x08, 0x00, 0x00, 0x55, 0x55];
    let crc = MODBUS_CRC.checksum(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());
    frame
}

#[derive(Debug)]
struct ConnState {
    refcount: usize,
    in_transaction: bool,
    close_pending: bool,
    closed: bool,
}

/// One pooled transport handle.
pub struct PooledConnection {
    target: ConnectionTarget,
    state: Mutex<ConnState>,
    transport: tokio::sync::Mutex<Box<dyn RegisterTransport>>,
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("target", &self.target)
            .field("state", &*self.state.lock())
            .finish()
    }
}

impl PooledConnection {
    fn new(target: ConnectionTarget, transport: Box<dyn RegisterTransport>) -> Self {
        Self {
            target,
            state: Mutex::new(ConnState {
                refcount: 1,
                in_transaction: false,
                close_pending: false,
                closed: false,
            }),
            transport: tokio::sync::Mutex::new(transport),
        }
    }

    /// Target this connection was opened for (unit not significant).
    pub fn target(&self) -> &ConnectionTarget {
        &self.target
    }

    pub fn method(&self) -> Method {
        self.target.method
    }

    pub fn refcount(&self) -> usize {
        self.state.lock().refcount
    }

    pub fn in_transaction(&self) -> bool {
        self.state.lock().in_transaction
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Take an additional reference.
    pub fn get(self: &Arc<Self>) -> Arc<Self> {
        self.state.lock().refcount += 1;
        Arc::clone(self)
    }

    /// Drop one reference; returns true when the count reached zero.
    fn put(&self) -> bool {
        let mut state = self.state.lock();
        state.refcount = state.refcount.saturating_sub(1);
        if state.refcount > 0 {
            return false;
        }
        if state.closed {
            return true;
        }

        if state.in_transaction {
            state.close_pending = true;
        } else {
            match self.transport.try_lock() {
                Ok(mut transport) => {
                    transport.close();
                    state.closed = true;
                    debug!(target = %self.target, "Connection closed");
                }
                // Someone is between taking the lock and flagging the transaction.
                Err(_) => state.close_pending = true,
            }
        }
        true
    }

    /// Start an exclusive exchange on this connection.
    ///
    /// Waits for any other transaction on the same handle to finish. A
    /// release that drops the last reference while the returned guard is
    /// alive defers closing until the guard is dropped.
    pub async fn transaction(&self) -> std::result::Result<Transaction<'_>, TransportError> {
        let transport = self.transport.lock().await;
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(TransportError::Closed);
            }
            state.in_transaction = true;
        }
        Ok(Transaction {
            conn: self,
            transport,
        })
    }
}

/// Exclusive access to a pooled transport for the duration of one exchange.
pub struct Transaction<'a> {
    conn: &'a PooledConnection,
    transport: tokio::sync::MutexGuard<'a, Box<dyn RegisterTransport>>,
}

impl Transaction<'_> {
    /// Override the transport timeout until the returned guard is dropped.
    pub fn with_timeout(&mut self, timeout: Duration) -> ScopedTimeout<'_> {
        let transport: &mut dyn RegisterTransport = &mut **self.transport;
        let previous = transport.timeout();
        transport.set_timeout(timeout);
        ScopedTimeout {
            transport,
            previous,
        }
    }
}

impl Deref for Transaction<'_> {
    type Target = dyn RegisterTransport;

    fn deref(&self) -> &Self::Target {
        &**self.transport
    }
}

impl DerefMut for Transaction<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut **self.transport
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        let mut state = self.conn.state.lock();
        state.in_transaction = false;
        if state.close_pending && !state.closed {
            state.close_pending = false;
            state.closed = true;
            self.transport.close();
            debug!(target = %self.conn.target, "Deferred close after transaction");
        }
    }
}

/// Transport timeout override, restored on drop.
pub struct ScopedTimeout<'t> {
    transport: &'t mut dyn RegisterTransport,
    previous: Duration,
}

impl<'t> Deref for ScopedTimeout<'t> {
    type Target = dyn RegisterTransport + 't;

    fn deref(&self) -> &Self::Target {
        &*self.transport
    }
}

impl<'t> DerefMut for ScopedTimeout<'t> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut *self.transport
    }
}

impl Drop for ScopedTimeout<'_> {
    fn drop(&mut self) {
        self.transport.set_timeout(self.previous);
    }
}

/// Pool of open connections, indexed by serial line.
pub struct ConnectionPool {
    connector: Arc<dyn Connector>,
    serial: Mutex<HashMap<String, Arc<PooledConnection>>>,
}

impl ConnectionPool {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            serial: Mutex::new(HashMap::new()),
        }
    }

    /// Acquire a connection for `target`.
    pub async fn acquire(&self, target: &ConnectionTarget) -> Result<Arc<PooledConnection>> {
        let target = target.with_unit(0);

        if !target.method.is_serial() {
            let transport = self
                .connector
                .open(&target)
                .await
                .map_err(|e| ProbeError::connect_failed(&target, e))?;
            return Ok(Arc::new(PooledConnection::new(target, transport)));
        }

        if let Some(conn) = self.lookup_serial(&target)? {
            return Ok(conn);
        }

        let mut transport = self
            .connector
            .open(&target)
            .await
            .map_err(|e| ProbeError::connect_failed(&target, e))?;

        if let Err(e) = transport.connect().await {
            transport.close();
            return Err(ProbeError::connect_failed(&target, e));
        }

        let conn = Arc::new(PooledConnection::new(target.clone(), transport));

        // Hold the transaction before publishing the handle so other callers
        // queue behind the warm-up.
        let mut txn = conn.transaction().await?;

        {
            let mut serial = self.serial.lock();
            if serial.contains_key(target.serial_key()) {
                drop(serial);
                drop(txn);
                conn.put();
                return self.lookup_serial(&target)?.ok_or_else(|| {
                    ProbeError::connect_failed(&target, "line closed while opening")
                });
            }
            serial.insert(target.serial_key().to_string(), Arc::clone(&conn));
        }

        info!(path = %target.device_path(), rate = target.rate, "Opened serial line");

        let frame = warmup_frame();
        for i in 0..WARMUP_FRAMES {
            if let Err(e) = txn.send_raw(&frame).await {
                warn!(path = %target.device_path(), error = %e, "Bus warm-up write failed");
                break;
            }
            if i + 1 < WARMUP_FRAMES {
                tokio::time::sleep(WARMUP_INTERVAL).await;
            }
        }
        drop(txn);

        Ok(conn)
    }

    fn lookup_serial(&self, target: &ConnectionTarget) -> Result<Option<Arc<PooledConnection>>> {
        let serial = self.serial.lock();
        let Some(conn) = serial.get(target.serial_key()) else {
            return Ok(None);
        };

        if conn.target.rate != target.rate {
            return Err(ProbeError::RateMismatch {
                path: target.serial_key().to_string(),
                open: conn.target.rate,
                requested: target.rate,
            });
        }

        Ok(Some(conn.get()))
    }

    /// Drop one reference to `conn`, closing it when none remain.
    pub fn release(&self, conn: &Arc<PooledConnection>) {
        if !conn.method().is_serial() {
            conn.put();
            return;
        }

        let mut serial = self.serial.lock();
        if conn.put() {
            let key = conn.target.serial_key();
            if serial.get(key).is_some_and(|c| Arc::ptr_eq(c, conn)) {
                serial.remove(key);
                debug!(path = %key, "Serial line removed from pool");
            }
        }
    }

    /// The open connection for a serial line, if any.
    pub fn serial_connection(&self, tty: &str) -> Option<Arc<PooledConnection>> {
        let key = tty.rsplit('/').next().unwrap_or(tty);
        self.serial.lock().get(key).cloned()
    }

    /// Number of serial lines currently open.
    pub fn open_serial_count(&self) -> usize {
        self.serial.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_warmup_frame_crc() {
        assert_eq!(
            warmup_frame(),
            vec![0x00, 0x08, 0x00, 0x00, 0x55, 0x55, 0x1e, 0xb5]
        );
    }

    #[test]
    fn test_warmup_timing() {
        assert_eq!(WARMUP_FRAMES, 12);
        assert_eq!(WARMUP_INTERVAL, Duration::from_millis(100));
    }
}
