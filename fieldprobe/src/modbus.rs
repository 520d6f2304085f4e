//! Modbus implementation of the register transport.
//!
//! TCP and RTU go through `tokio-modbus`; serial lines are opened with
//! `tokio-serial`. Modbus/UDP has no client in `tokio-modbus`, so it is a
//! small MBAP exchange over a connected datagram socket.

use async_trait::async_trait;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::UdpSocket;
use tokio_modbus::client::Context;
use tokio_modbus::prelude::*;
use tokio_serial::SerialStream;
use tracing::debug;

use crate::target::{ConnectionTarget, Method};
use crate::transport::{Access, Connector, DEFAULT_TIMEOUT, RegisterTransport, TransportError};

/// Connector producing Modbus transports.
#[derive(Debug, Clone, Default)]
pub struct ModbusConnector;

#[async_trait]
impl Connector for ModbusConnector {
    async fn open(
        &self,
        target: &ConnectionTarget,
    ) -> Result<Box<dyn RegisterTransport>, TransportError> {
        let transport: Box<dyn RegisterTransport> = match target.method {
            Method::Tcp => Box::new(TcpTransport::new(&target.address, target.port)),
            Method::Udp => Box::new(UdpTransport::new(&target.address, target.port)),
            Method::Rtu => Box::new(RtuTransport::new(target.device_path(), target.rate)),
        };
        Ok(transport)
    }
}

async fn resolve(host: &str, port: u16) -> Result<SocketAddr, TransportError> {
    tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| TransportError::Connection(format!("Invalid address {}: {}", host, e)))?
        .next()
        .ok_or_else(|| TransportError::Connection(format!("No address for {}", host)))
}

/// Run one `tokio-modbus` request with a deadline and flatten its nested result.
async fn exchange<T, F>(timeout: Duration, request: F) -> Result<T, TransportError>
where
    F: std::future::Future<Output = tokio_modbus::Result<T>>,
{
    tokio::time::timeout(timeout, request)
        .await
        .map_err(|_| TransportError::Timeout(timeout))?
        .map_err(|e| TransportError::Io(e.to_string()))?
        .map_err(|e| TransportError::Exception(format!("{:?}", e)))
}

async fn read_context(
    ctx: &mut Context,
    timeout: Duration,
    unit: u8,
    access: Access,
    base: u16,
    count: u16,
) -> Result<Vec<u16>, TransportError> {
    ctx.set_slave(Slave(unit));
    match access {
        Access::Holding => exchange(timeout, ctx.read_holding_registers(base, count)).await,
        Access::Input => exchange(timeout, ctx.read_input_registers(base, count)).await,
    }
}

/// Modbus/TCP transport.
pub struct TcpTransport {
    host: String,
    port: u16,
    ctx: Option<Context>,
    timeout: Duration,
}

impl TcpTransport {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
            ctx: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    fn context(&mut self) -> Result<&mut Context, TransportError> {
        self.ctx.as_mut().ok_or(TransportError::Closed)
    }
}

#[async_trait]
impl RegisterTransport for TcpTransport {
    async fn connect(&mut self) -> Result<(), TransportError> {
        if self.ctx.is_some() {
            return Ok(());
        }

        let addr = resolve(&self.host, self.port).await?;
        let ctx = tokio::time::timeout(self.timeout, tcp::connect_slave(addr, Slave(0)))
            .await
            .map_err(|_| TransportError::Connection("Connection timeout".to_string()))?
            .map_err(|e| TransportError::Connection(e.to_string()))?;

        debug!(%addr, "Modbus/TCP connected");
        self.ctx = Some(ctx);
        Ok(())
    }

    async fn read_registers(
        &mut self,
        unit: u8,
        access: Access,
        base: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError> {
        self.connect().await?;
        let timeout = self.timeout;
        let result = read_context(self.context()?, timeout, unit, access, base, count).await;
        if matches!(result, Err(TransportError::Io(_))) {
            self.ctx = None;
        }
        result
    }

    async fn write_registers(
        &mut self,
        unit: u8,
        base: u16,
        words: &[u16],
    ) -> Result<(), TransportError> {
        self.connect().await?;
        let timeout = self.timeout;
        let ctx = self.context()?;
        ctx.set_slave(Slave(unit));
        exchange(timeout, ctx.write_multiple_registers(base, words)).await
    }

    async fn send_raw(&mut self, _frame: &[u8]) -> Result<(), TransportError> {
        Err(TransportError::Unsupported("raw frames on Modbus/TCP"))
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    fn close(&mut self) {
        self.ctx = None;
    }
}

enum RtuState {
    Closed,
    /// Line is open but no Modbus context is attached yet; raw writes allowed.
    Open(SerialStream),
    Attached(Context),
}

/// Modbus RTU transport over a serial line.
pub struct RtuTransport {
    path: String,
    rate: u32,
    state: RtuState,
    timeout: Duration,
}

impl RtuTransport {
    pub fn new(path: String, rate: u32) -> Self {
        Self {
            path,
            rate,
            state: RtuState::Closed,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Attach a Modbus context to the open line, consuming raw access.
    fn attach(&mut self) -> Result<&mut Context, TransportError> {
        if let RtuState::Open(_) = self.state {
            if let RtuState::Open(serial) = std::mem::replace(&mut self.state, RtuState::Closed) {
                self.state = RtuState::Attached(rtu::attach_slave(serial, Slave(0)));
            }
        }

        match &mut self.state {
            RtuState::Attached(ctx) => Ok(ctx),
            _ => Err(TransportError::Closed),
        }
    }
}

#[async_trait]
impl RegisterTransport for RtuTransport {
    async fn connect(&mut self) -> Result<(), TransportError> {
        if !matches!(self.state, RtuState::Closed) {
            return Ok(());
        }

        let builder = tokio_serial::new(&self.path, self.rate)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .data_bits(tokio_serial::DataBits::Eight);

        let serial = SerialStream::open(&builder)
            .map_err(|e| TransportError::Connection(format!("Serial open failed: {}", e)))?;

        debug!(path = %self.path, rate = self.rate, "Serial line opened");
        self.state = RtuState::Open(serial);
        Ok(())
    }

    async fn read_registers(
        &mut self,
        unit: u8,
        access: Access,
        base: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError> {
        self.connect().await?;
        let timeout = self.timeout;
        read_context(self.attach()?, timeout, unit, access, base, count).await
    }

    async fn write_registers(
        &mut self,
        unit: u8,
        base: u16,
        words: &[u16],
    ) -> Result<(), TransportError> {
        self.connect().await?;
        let timeout = self.timeout;
        let ctx = self.attach()?;
        ctx.set_slave(Slave(unit));
        exchange(timeout, ctx.write_multiple_registers(base, words)).await
    }

    async fn send_raw(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        match &mut self.state {
            RtuState::Open(serial) => {
                serial.write_all(frame).await?;
                serial.flush().await?;
                Ok(())
            }
            RtuState::Attached(_) => Err(TransportError::Unsupported(
                "raw frames after the Modbus context is attached",
            )),
            RtuState::Closed => Err(TransportError::Closed),
        }
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    fn close(&mut self) {
        self.state = RtuState::Closed;
    }
}

const MBAP_HEADER_LEN: usize = 7;
const FC_READ_HOLDING: u8 = 0x03;
const FC_READ_INPUT: u8 = 0x04;
const FC_WRITE_MULTIPLE: u8 = 0x10;

/// Modbus/UDP transport (MBAP framing over datagrams).
pub struct UdpTransport {
    host: String,
    port: u16,
    socket: Option<UdpSocket>,
    transaction_id: u16,
    timeout: Duration,
}

impl UdpTransport {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
            socket: None,
            transaction_id: 0,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Send one PDU and wait for the reply with the matching transaction id.
    async fn request(&mut self, unit: u8, pdu: &[u8]) -> Result<Vec<u8>, TransportError> {
        self.connect().await?;
        self.transaction_id = self.transaction_id.wrapping_add(1);
        let tid = self.transaction_id;
        let frame = encode_mbap(tid, unit, pdu);
        let timeout = self.timeout;
        let socket = self.socket.as_ref().ok_or(TransportError::Closed)?;

        socket.send(&frame).await?;

        let mut buf = [0u8; 260];
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let len = tokio::time::timeout_at(deadline, socket.recv(&mut buf))
                .await
                .map_err(|_| TransportError::Timeout(timeout))??;

            match decode_mbap(&buf[..len]) {
                Some((rx_tid, rx_unit, body)) if rx_tid == tid && rx_unit == unit => {
                    return check_exception(pdu[0], body);
                }
                _ => debug!(len, "Discarding unrelated Modbus/UDP datagram"),
            }
        }
    }
}

fn encode_mbap(tid: u16, unit: u8, pdu: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(MBAP_HEADER_LEN + pdu.len());
    frame.extend_from_slice(&tid.to_be_bytes());
    frame.extend_from_slice(&0u16.to_be_bytes());
    frame.extend_from_slice(&((pdu.len() + 1) as u16).to_be_bytes());
    frame.push(unit);
    frame.extend_from_slice(pdu);
    frame
}

fn decode_mbap(frame: &[u8]) -> Option<(u16, u8, &[u8])> {
    if frame.len() <= MBAP_HEADER_LEN {
        return None;
    }
    let tid = u16::from_be_bytes([frame[0], frame[1]]);
    let proto = u16::from_be_bytes([frame[2], frame[3]]);
    let len = u16::from_be_bytes([frame[4], frame[5]]) as usize;
    if proto != 0 || len < 2 || frame.len() < 6 + len {
        return None;
    }
    Some((tid, frame[6], &frame[MBAP_HEADER_LEN..6 + len]))
}

fn check_exception(function: u8, body: &[u8]) -> Result<Vec<u8>, TransportError> {
    match body.first() {
        Some(&fc) if fc == function => Ok(body[1..].to_vec()),
        Some(&fc) if fc == function | 0x80 => Err(TransportError::Exception(format!(
            "code {}",
            body.get(1).copied().unwrap_or(0)
        ))),
        _ => Err(TransportError::Io("malformed Modbus/UDP reply".to_string())),
    }
}

#[async_trait]
impl RegisterTransport for UdpTransport {
    async fn connect(&mut self) -> Result<(), TransportError> {
        if self.socket.is_some() {
            return Ok(());
        }

        let addr = resolve(&self.host, self.port).await?;
        let bind: SocketAddr = if addr.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };
        let socket = UdpSocket::bind(bind)
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;
        socket
            .connect(addr)
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;

        self.socket = Some(socket);
        Ok(())
    }

    async fn read_registers(
        &mut self,
        unit: u8,
        access: Access,
        base: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError> {
        let function = match access {
            Access::Holding => FC_READ_HOLDING,
            Access::Input => FC_READ_INPUT,
        };
        let mut pdu = vec![function];
        pdu.extend_from_slice(&base.to_be_bytes());
        pdu.extend_from_slice(&count.to_be_bytes());

        let body = self.request(unit, &pdu).await?;
        let data = body.get(1..).unwrap_or_default();
        let expected = count as usize * 2;
        if body.first().map(|n| *n as usize) != Some(expected) || data.len() < expected {
            return Err(TransportError::Io("short Modbus/UDP reply".to_string()));
        }

        Ok(data
            .chunks_exact(2)
            .take(count as usize)
            .map(|c| u16::from_be_bytes([c[0], c[1]]))
            .collect())
    }

    async fn write_registers(
        &mut self,
        unit: u8,
        base: u16,
        words: &[u16],
    ) -> Result<(), TransportError> {
        let mut pdu = vec![FC_WRITE_MULTIPLE];
        pdu.extend_from_slice(&base.to_be_bytes());
        pdu.extend_from_slice(&(words.len() as u16).to_be_bytes());
        pdu.push((words.len() * 2) as u8);
        for w in words {
            pdu.extend_from_slice(&w.to_be_bytes());
        }

        self.request(unit, &pdu).await.map(|_| ())
    }

    async fn send_raw(&mut self, _frame: &[u8]) -> Result<(), TransportError> {
        Err(TransportError::Unsupported("raw frames on Modbus/UDP"))
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    fn close(&mut self) {
        self.socket = None;
    }
}
