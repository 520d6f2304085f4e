//! Device identification.
//!
//! A [`DeviceTypeHandler`] knows one identification register and the model
//! values it may hold. The [`Prober`] walks the registered handlers in
//! order against each target and returns the first match.

use std::collections::BTreeSet;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::device::{Device, DeviceConstructor, DeviceModel};
use crate::error::ProbeError;
use crate::pool::{ConnectionPool, PooledConnection};
use crate::register::{Register, Value};
use crate::target::{ConnectionTarget, Method};
use crate::transport::{Access, DEFAULT_TIMEOUT, TransportError};

/// Lower bound for the polling timeout of an identified device.
pub const DEFAULT_MIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Polling timeout is this many times the identification latency.
const LATENCY_FACTOR: u32 = 4;

/// One model a handler can identify.
#[derive(Clone)]
pub struct ModelEntry {
    pub model: String,
    pub constructor: DeviceConstructor,
    pub default_access: Access,
}

impl std::fmt::Debug for ModelEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelEntry")
            .field("model", &self.model)
            .field("default_access", &self.default_access)
            .finish_non_exhaustive()
    }
}

/// A successful identification exchange.
struct Identified {
    inner: Box<dyn DeviceModel>,
    model: String,
    access: Access,
    latency: Duration,
}

/// Identifies one family of devices by a single register.
#[derive(Debug)]
pub struct DeviceTypeHandler {
    name: String,
    id_register: Register,
    models: Vec<(Value, ModelEntry)>,
    methods: Vec<Method>,
    units: Vec<u8>,
    rates: Vec<u32>,
    timeout: Duration,
    min_timeout: Duration,
}

impl DeviceTypeHandler {
    pub fn new(name: impl Into<String>, id_register: Register) -> Self {
        Self {
            name: name.into(),
            id_register,
            models: Vec::new(),
            methods: Vec::new(),
            units: Vec::new(),
            rates: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
            min_timeout: DEFAULT_MIN_TIMEOUT,
        }
    }

    /// Map an identification value to a model.
    pub fn model(
        mut self,
        value: impl Into<Value>,
        model: impl Into<String>,
        default_access: Access,
        constructor: DeviceConstructor,
    ) -> Self {
        self.models.push((
            value.into(),
            ModelEntry {
                model: model.into(),
                constructor,
                default_access,
            },
        ));
        self
    }

    /// Transports this handler applies to. Empty means all.
    pub fn methods(mut self, methods: impl IntoIterator<Item = Method>) -> Self {
        self.methods = methods.into_iter().collect();
        self
    }

    /// Unit addresses tried when a target does not pin one.
    pub fn units(mut self, units: impl IntoIterator<Item = u8>) -> Self {
        self.units = units.into_iter().collect();
        self
    }

    /// Serial rates the devices may run at.
    pub fn rates(mut self, rates: impl IntoIterator<Item = u32>) -> Self {
        self.rates = rates.into_iter().collect();
        self
    }

    /// Timeout for the identification read.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn min_timeout(mut self, timeout: Duration) -> Self {
        self.min_timeout = timeout;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id_register(&self) -> &Register {
        &self.id_register
    }

    /// `(value, model name)` for every known model.
    pub fn models(&self) -> impl Iterator<Item = (&Value, &str)> {
        self.models.iter().map(|(v, e)| (v, e.model.as_str()))
    }

    pub fn supports(&self, method: Method) -> bool {
        self.methods.is_empty() || self.methods.contains(&method)
    }

    fn lists(&self, method: Method) -> bool {
        self.methods.contains(&method)
    }

    /// Banks to try for the identification read, in order.
    fn access_modes(&self) -> Vec<Access> {
        if let Some(access) = self.id_register.bank() {
            return vec![access];
        }
        let mut modes = Vec::new();
        for (_, entry) in &self.models {
            if !modes.contains(&entry.default_access) {
                modes.push(entry.default_access);
            }
        }
        if modes.is_empty() {
            modes.push(Access::Holding);
        }
        modes
    }

    fn lookup(&self, value: &Value) -> Option<&ModelEntry> {
        self.models
            .iter()
            .find(|(v, _)| v == value)
            .map(|(_, entry)| entry)
    }

    /// Read the identification register of `target.unit` and match it.
    ///
    /// `Ok(None)` means the unit answered with something this handler does
    /// not know, including a Modbus exception. Any other transport failure
    /// is returned so the caller can give up on this handler.
    async fn identify(
        &self,
        conn: &Arc<PooledConnection>,
        target: &ConnectionTarget,
        timeout: Duration,
    ) -> Result<Option<Identified>, TransportError> {
        let reg = &self.id_register;
        let start = Instant::now();

        let read = {
            let mut txn = conn.transaction().await?;
            let mut transport = txn.with_timeout(timeout);
            transport.connect().await?;

            let mut read = Err(TransportError::Closed);
            for access in self.access_modes() {
                read = transport
                    .read_registers(target.unit, access, reg.base, reg.count)
                    .await
                    .map(|words| (access, words));
                if read.is_ok() {
                    break;
                }
            }
            read
        };
        let latency = start.elapsed();

        let (access, words) = match read {
            Ok(read) => read,
            Err(TransportError::Exception(e)) => {
                debug!(handler = %self.name, unit = target.unit, "Exception response: {}", e);
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let value = match reg.decode(&words) {
            Ok(Some(value)) => value,
            Ok(None) => return Ok(None),
            Err(e) => {
                debug!(
                    handler = %self.name,
                    unit = target.unit,
                    error = %e,
                    "Identification value did not decode"
                );
                return Ok(None);
            }
        };

        let Some(entry) = self.lookup(&value) else {
            debug!(handler = %self.name, unit = target.unit, %value, "Unknown model");
            return Ok(None);
        };

        Ok(Some(Identified {
            inner: (entry.constructor)(target, conn, &entry.model),
            model: entry.model.clone(),
            access,
            latency,
        }))
    }
}

/// Ordered set of device type handlers.
#[derive(Debug, Clone, Default)]
pub struct HandlerRegistry {
    handlers: Vec<Arc<DeviceTypeHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a handler. Returns false if one with the same name exists.
    pub fn register(&mut self, handler: DeviceTypeHandler) -> bool {
        if self.handlers.iter().any(|h| h.name == handler.name) {
            warn!(handler = %handler.name, "Handler already registered");
            return false;
        }
        self.handlers.push(Arc::new(handler));
        true
    }

    pub fn handlers(&self) -> &[Arc<DeviceTypeHandler>] {
        &self.handlers
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Every unit address named by handlers listing `method`.
    pub fn units(&self, method: Method) -> BTreeSet<u8> {
        self.handlers
            .iter()
            .filter(|h| h.lists(method))
            .flat_map(|h| h.units.iter().copied())
            .collect()
    }

    /// Every rate named by handlers listing `method`.
    pub fn rates(&self, method: Method) -> BTreeSet<u32> {
        self.handlers
            .iter()
            .filter(|h| h.lists(method))
            .flat_map(|h| h.rates.iter().copied())
            .collect()
    }
}

/// Result of probing one target.
#[derive(Debug)]
pub enum ProbeOutcome {
    Identified(Device),
    NotFound,
    ConnectError,
}

/// Devices found and targets that yielded none.
#[derive(Debug, Default)]
pub struct ProbeReport {
    pub found: Vec<Device>,
    /// Targets that could not be opened or where no handler matched.
    pub failed: Vec<ConnectionTarget>,
    /// The progress callback asked to stop early.
    pub aborted: bool,
}

type TargetFilter = Arc<dyn Fn(&ConnectionTarget) -> bool + Send + Sync>;

/// Runs identification against targets.
#[derive(Clone)]
pub struct Prober {
    pool: Arc<ConnectionPool>,
    registry: Arc<HandlerRegistry>,
    timeout: Option<Duration>,
    filter: Option<TargetFilter>,
}

impl Prober {
    pub fn new(pool: Arc<ConnectionPool>, registry: Arc<HandlerRegistry>) -> Self {
        Self {
            pool,
            registry,
            timeout: None,
            filter: None,
        }
    }

    /// Override every handler's identification timeout.
    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Skip `(target, unit)` candidates for which `filter` returns false.
    pub fn filter(
        mut self,
        filter: impl Fn(&ConnectionTarget) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.filter = Some(Arc::new(filter));
        self
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    /// Probe a single target.
    pub async fn probe(&self, target: &ConnectionTarget) -> ProbeOutcome {
        let conn = match self.pool.acquire(target).await {
            Ok(conn) => conn,
            Err(e @ ProbeError::RateMismatch { .. }) => {
                error!(%target, "{}", e);
                return ProbeOutcome::ConnectError;
            }
            Err(e) => {
                warn!(%target, "{}", e);
                return ProbeOutcome::ConnectError;
            }
        };

        let device = self.identify(target, &conn).await;
        self.pool.release(&conn);

        match device {
            Some(device) => ProbeOutcome::Identified(device),
            None => ProbeOutcome::NotFound,
        }
    }

    async fn identify(
        &self,
        target: &ConnectionTarget,
        conn: &Arc<PooledConnection>,
    ) -> Option<Device> {
        for handler in self.registry.handlers() {
            if !handler.supports(target.method) {
                continue;
            }

            debug!(handler = %handler.name, %target, "Probing");

            let units = if target.unit > 0 {
                vec![target.unit]
            } else {
                handler.units.clone()
            };
            let timeout = self.timeout.unwrap_or(handler.timeout);

            for unit in units {
                let candidate = target.with_unit(unit);
                if let Some(filter) = &self.filter
                    && !filter(&candidate)
                {
                    continue;
                }

                match handler.identify(conn, &candidate, timeout).await {
                    Ok(Some(found)) => {
                        let device = Device {
                            handler: handler.name.clone(),
                            model: found.model,
                            target: candidate,
                            access: found.access,
                            connection: conn.get(),
                            registers: found.inner.registers(),
                            inner: found.inner,
                            latency: found.latency,
                            timeout: handler.min_timeout.max(found.latency * LATENCY_FACTOR),
                        };
                        info!(
                            "Found {}: {} {} at {}",
                            device.device_type(),
                            device.vendor_name(),
                            device.model,
                            device.target
                        );
                        return Some(device);
                    }
                    Ok(None) => {}
                    Err(e) => {
                        debug!(
                            handler = %handler.name,
                            target = %candidate,
                            error = %e,
                            "Reading failed"
                        );
                        break;
                    }
                }
            }
        }
        None
    }

    /// Probe `targets` in order.
    ///
    /// `progress` is called with the number of targets processed since the
    /// last call, together with each device found, every `interval` targets,
    /// and once more at the end for any remainder. Returning
    /// [`ControlFlow::Break`] stops the run.
    pub async fn probe_all<I, F>(
        &self,
        targets: I,
        mut progress: F,
        interval: usize,
    ) -> ProbeReport
    where
        I: IntoIterator<Item = ConnectionTarget>,
        F: FnMut(usize, Option<&Device>) -> ControlFlow<()>,
    {
        let interval = interval.max(1);
        let mut report = ProbeReport::default();
        let mut probed = 0;

        for target in targets {
            let found = match self.probe(&target).await {
                ProbeOutcome::Identified(device) => {
                    report.found.push(device);
                    report.found.last()
                }
                ProbeOutcome::NotFound | ProbeOutcome::ConnectError => {
                    report.failed.push(target);
                    None
                }
            };

            probed += 1;
            if found.is_some() || probed == interval {
                let flow = progress(probed, found);
                probed = 0;
                if flow.is_break() {
                    report.aborted = true;
                    return report;
                }
            }
        }

        if probed > 0 && progress(probed, None).is_break() {
            report.aborted = true;
        }

        report
    }
}
