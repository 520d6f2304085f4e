//! Scripted in-memory register transport.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use fieldprobe::device::{DeviceModel, constructor};
use fieldprobe::probe::DeviceTypeHandler;
use fieldprobe::register::Register;
use fieldprobe::target::ConnectionTarget;
use fieldprobe::transport::{Access, Connector, DEFAULT_TIMEOUT, RegisterTransport, TransportError};

/// Something a mock transport did.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Open(String),
    Connect,
    Raw(Vec<u8>),
    Read {
        unit: u8,
        access: Access,
        base: u16,
        timeout: Duration,
    },
    Write {
        unit: u8,
        base: u16,
        words: Vec<u16>,
    },
    Close,
}

type Reply = Result<Vec<u16>, TransportError>;

/// Shared script and event log for every transport a [`MockConnector`] opens.
#[derive(Default)]
pub struct Bus {
    replies: Mutex<HashMap<(u8, Access, u16), Reply>>,
    events: Mutex<Vec<Event>>,
    latency: Mutex<Duration>,
    live_rate: Mutex<Option<u32>>,
    fail_open: Mutex<bool>,
    fail_connect: Mutex<bool>,
}

impl Bus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Answer reads of `(unit, access, base)` with `reply`.
    pub fn reply(&self, unit: u8, access: Access, base: u16, reply: Reply) {
        self.replies.lock().insert((unit, access, base), reply);
    }

    /// Answer holding register reads with `words`.
    pub fn holding(&self, unit: u8, base: u16, words: &[u16]) {
        self.reply(unit, Access::Holding, base, Ok(words.to_vec()));
    }

    /// Simulated round trip per read.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    /// Only serial transports opened at `rate` get answers.
    pub fn set_live_rate(&self, rate: u32) {
        *self.live_rate.lock() = Some(rate);
    }

    pub fn fail_open(&self) {
        *self.fail_open.lock() = true;
    }

    pub fn fail_connect(&self) {
        *self.fail_connect.lock() = true;
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn count(&self, pred: impl Fn(&Event) -> bool) -> usize {
        self.events.lock().iter().filter(|e| pred(e)).count()
    }

    pub fn opens(&self) -> usize {
        self.count(|e| matches!(e, Event::Open(_)))
    }

    pub fn closes(&self) -> usize {
        self.count(|e| matches!(e, Event::Close))
    }

    pub fn raw_frames(&self) -> Vec<Vec<u8>> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                Event::Raw(frame) => Some(frame.clone()),
                _ => None,
            })
            .collect()
    }

    /// `(unit, base)` of every read, in order.
    pub fn reads(&self) -> Vec<(u8, u16)> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                Event::Read { unit, base, .. } => Some((*unit, *base)),
                _ => None,
            })
            .collect()
    }

    fn log(&self, event: Event) {
        self.events.lock().push(event);
    }
}

pub struct MockTransport {
    bus: Arc<Bus>,
    target: ConnectionTarget,
    timeout: Duration,
}

#[async_trait]
impl RegisterTransport for MockTransport {
    async fn connect(&mut self) -> Result<(), TransportError> {
        self.bus.log(Event::Connect);
        if *self.bus.fail_connect.lock() {
            return Err(TransportError::Connection("no such device".to_string()));
        }
        Ok(())
    }

    async fn read_registers(
        &mut self,
        unit: u8,
        access: Access,
        base: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError> {
        self.bus.log(Event::Read {
            unit,
            access,
            base,
            timeout: self.timeout,
        });

        let latency = *self.bus.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let live_rate = *self.bus.live_rate.lock();
        if self.target.method.is_serial() && live_rate.is_some_and(|r| r != self.target.rate) {
            return Err(TransportError::Timeout(self.timeout));
        }

        let reply = self.bus.replies.lock().get(&(unit, access, base)).cloned();
        match reply {
            Some(Ok(words)) if words.len() == count as usize => Ok(words),
            Some(Ok(_)) => Err(TransportError::Exception("illegal data address".to_string())),
            Some(Err(e)) => Err(e),
            None => Err(TransportError::Timeout(self.timeout)),
        }
    }

    async fn write_registers(
        &mut self,
        unit: u8,
        base: u16,
        words: &[u16],
    ) -> Result<(), TransportError> {
        self.bus.log(Event::Write {
            unit,
            base,
            words: words.to_vec(),
        });
        Ok(())
    }

    async fn send_raw(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        self.bus.log(Event::Raw(frame.to_vec()));
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    fn close(&mut self) {
        self.bus.log(Event::Close);
    }
}

pub struct MockConnector {
    bus: Arc<Bus>,
}

impl MockConnector {
    pub fn new(bus: &Arc<Bus>) -> Arc<Self> {
        Arc::new(Self {
            bus: Arc::clone(bus),
        })
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn open(
        &self,
        target: &ConnectionTarget,
    ) -> Result<Box<dyn RegisterTransport>, TransportError> {
        self.bus.log(Event::Open(target.to_string()));
        if *self.bus.fail_open.lock() {
            return Err(TransportError::Connection("refused".to_string()));
        }
        Ok(Box::new(MockTransport {
            bus: Arc::clone(&self.bus),
            target: target.clone(),
            timeout: DEFAULT_TIMEOUT,
        }))
    }
}

/// Minimal device object polling plain u16 registers.
#[derive(Debug)]
pub struct TestDevice {
    pub bases: Vec<u16>,
}

impl DeviceModel for TestDevice {
    fn vendor_name(&self) -> &str {
        "Acme"
    }

    fn device_type(&self) -> &str {
        "test device"
    }

    fn registers(&self) -> Vec<Register> {
        self.bases
            .iter()
            .map(|&base| Register::u16(base).named(format!("/Reg/{}", base)))
            .collect()
    }
}

/// Handler identifying `model` when the u16 at `base` reads `value`.
pub fn handler(name: &str, base: u16, value: u16, model: &str) -> DeviceTypeHandler {
    handler_with_registers(name, base, value, model, &[])
}

/// Like [`handler`], with devices polling u16 registers at `bases`.
pub fn handler_with_registers(
    name: &str,
    base: u16,
    value: u16,
    model: &str,
    bases: &'static [u16],
) -> DeviceTypeHandler {
    DeviceTypeHandler::new(name, Register::u16(base)).model(
        value,
        model,
        Access::Holding,
        constructor(move |_, _, _| TestDevice {
            bases: bases.to_vec(),
        }),
    )
}
