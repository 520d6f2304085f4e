//! Background bus scanners.

use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::ops::ControlFlow;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{info, warn};

use crate::device::Device;
use crate::probe::Prober;
use crate::target::{ConnectionTarget, Method, TargetParseError};

pub const UNIT_MIN: u8 = 1;
pub const UNIT_MAX: u8 = 247;

/// Identification timeout on serial lines.
pub const SERIAL_SCAN_TIMEOUT: Duration = Duration::from_millis(100);

/// Identification timeout on network hosts.
pub const NET_SCAN_TIMEOUT: Duration = Duration::from_millis(250);

/// Hosts probed concurrently by [`NetScanner`].
const NET_WORKERS: usize = 8;

/// Widest network a [`Subnet`] may describe.
const MIN_PREFIX: u8 = 16;

/// An IPv4 network in CIDR notation, e.g. `192.168.1.0/24`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subnet {
    network: u32,
    prefix: u8,
}

impl Subnet {
    /// Host addresses, without the network and broadcast addresses on
    /// networks that have them.
    pub fn hosts(&self) -> impl Iterator<Item = Ipv4Addr> + use<> {
        let size = 1u64 << (32 - self.prefix);
        let first = u64::from(self.network);
        let (start, end) = if size > 2 {
            (first + 1, first + size - 2)
        } else {
            (first, first + size - 1)
        };
        (start..=end).map(|a| Ipv4Addr::from(a as u32))
    }
}

impl FromStr for Subnet {
    type Err = TargetParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || TargetParseError::Subnet(s.to_string());
        let (addr, prefix) = s.split_once('/').ok_or_else(invalid)?;
        let addr: Ipv4Addr = addr.parse().map_err(|_| invalid())?;
        let prefix: u8 = prefix.parse().map_err(|_| invalid())?;
        if !(MIN_PREFIX..=32).contains(&prefix) {
            return Err(invalid());
        }
        let mask = u32::MAX << (32 - u32::from(prefix));
        Ok(Self {
            network: u32::from(addr) & mask,
            prefix,
        })
    }
}

/// Progress and results shared between a scanner and its task.
#[derive(Debug, Default)]
struct ScanState {
    running: AtomicBool,
    done: AtomicUsize,
    total: AtomicUsize,
    devices: Mutex<Vec<Device>>,
}

impl ScanState {
    fn begin(&self, total: usize) -> bool {
        if self.running.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.done.store(0, Ordering::SeqCst);
        self.total.store(total, Ordering::SeqCst);
        true
    }

    /// Progress callback for [`Prober::probe_all`].
    fn progress(&self, n: usize) -> ControlFlow<()> {
        if !self.running.load(Ordering::SeqCst) {
            return ControlFlow::Break(());
        }
        self.done.fetch_add(n, Ordering::SeqCst);
        ControlFlow::Continue(())
    }

    fn collect(&self, devices: Vec<Device>) {
        if !devices.is_empty() {
            self.devices.lock().extend(devices);
        }
    }

    fn finish(&self, started: Instant, aborted: bool) {
        if aborted || !self.running.load(Ordering::SeqCst) {
            info!("Scan aborted");
        } else {
            info!("Scan completed in {} seconds", started.elapsed().as_secs());
        }
        self.running.store(false, Ordering::SeqCst);
    }
}

macro_rules! scanner_common {
    () => {
        /// Ask the scan to stop at its next progress report.
        pub fn stop(&self) {
            self.state.running.store(false, Ordering::SeqCst);
        }

        pub fn is_running(&self) -> bool {
            self.state.running.load(Ordering::SeqCst)
        }

        /// `(targets done, targets expected)`.
        pub fn progress(&self) -> (usize, usize) {
            (
                self.state.done.load(Ordering::SeqCst),
                self.state.total.load(Ordering::SeqCst),
            )
        }

        /// Drain the devices found so far.
        pub fn take_devices(&self) -> Vec<Device> {
            std::mem::take(&mut *self.state.devices.lock())
        }
    };
}

/// Scans one serial line over its candidate rates and units.
#[derive(Clone)]
pub struct SerialScanner {
    prober: Prober,
    tty: String,
    rates: Vec<u32>,
    full: bool,
    state: Arc<ScanState>,
}

impl SerialScanner {
    /// `rates` empty means every rate the registered handlers name.
    pub fn new(
        prober: &Prober,
        tty: impl Into<String>,
        rates: Vec<u32>,
        timeout: Duration,
    ) -> Self {
        Self {
            prober: prober.clone().timeout(Some(timeout)),
            tty: tty.into(),
            rates,
            full: false,
            state: Arc::default(),
        }
    }

    /// Follow the quick scan with every unit address.
    pub fn full(mut self, full: bool) -> Self {
        self.full = full;
        self
    }

    scanner_common!();

    /// Start scanning in a background task. Returns `None` if already running.
    pub fn start(&self) -> Option<JoinHandle<()>> {
        if !self.state.begin(UNIT_MAX as usize) {
            return None;
        }
        let scanner = self.clone();
        Some(tokio::spawn(async move {
            let started = Instant::now();
            let aborted = scanner.scan().await;
            scanner.state.finish(started, aborted);
        }))
    }

    /// Returns true if the scan was aborted.
    async fn scan(&self) -> bool {
        let registry = self.prober.registry();
        let units: BTreeSet<u8> = registry.units(Method::Rtu);
        let mut rates = if self.rates.is_empty() {
            registry.rates(Method::Rtu).into_iter().collect()
        } else {
            self.rates.clone()
        };

        let mut found_units = BTreeSet::new();
        for &rate in &rates {
            info!("Scanning {} @ {} bps (quick)", self.tty, rate);
            let (found, aborted) = self.scan_units(&units, rate).await;
            if aborted {
                return true;
            }
            if !found.is_empty() {
                found_units = found;
                rates = vec![rate];
                break;
            }
        }

        if !self.full {
            return false;
        }

        let remaining: BTreeSet<u8> = (UNIT_MIN..=UNIT_MAX)
            .filter(|u| !found_units.contains(u))
            .collect();

        for &rate in &rates {
            info!("Scanning {} @ {} bps (full)", self.tty, rate);
            if self.scan_units(&remaining, rate).await.1 {
                return true;
            }
        }
        false
    }

    /// Probe `units` at `rate`; returns the units that answered.
    async fn scan_units(&self, units: &BTreeSet<u8>, rate: u32) -> (BTreeSet<u8>, bool) {
        let line = ConnectionTarget::rtu(&self.tty, rate);
        let pool = self.prober.pool();

        // Keep the line open across units so it is warmed up only once.
        let hold = match pool.acquire(&line).await {
            Ok(conn) => conn,
            Err(e) => {
                warn!("Unable to scan {} @ {} bps: {}", self.tty, rate, e);
                return (BTreeSet::new(), false);
            }
        };

        let targets: Vec<ConnectionTarget> = units.iter().map(|&u| line.with_unit(u)).collect();
        let report = self
            .prober
            .probe_all(targets, |n, _| self.state.progress(n), 1)
            .await;
        pool.release(&hold);

        let found = report.found.iter().map(Device::unit).collect();
        self.state.collect(report.found);
        (found, report.aborted)
    }
}

/// Probes Modbus/TCP and Modbus/UDP on a list of hosts.
#[derive(Clone)]
pub struct NetScanner {
    prober: Prober,
    hosts: Vec<String>,
    port: u16,
    state: Arc<ScanState>,
}

impl NetScanner {
    pub fn new(prober: &Prober, hosts: Vec<String>, port: u16) -> Self {
        Self {
            prober: prober.clone().timeout(Some(NET_SCAN_TIMEOUT)),
            hosts,
            port,
            state: Arc::default(),
        }
    }

    /// Scan every host of `subnets` except the `exclude`d addresses.
    pub fn for_subnets(
        prober: &Prober,
        subnets: &[Subnet],
        exclude: &[Ipv4Addr],
        port: u16,
    ) -> Self {
        let hosts = subnets
            .iter()
            .flat_map(Subnet::hosts)
            .filter(|ip| !exclude.contains(ip))
            .map(|ip| ip.to_string())
            .collect();
        Self::new(prober, hosts, port)
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.prober = self.prober.timeout(Some(timeout));
        self
    }

    scanner_common!();

    /// Start scanning in a background task. Returns `None` if already running
    /// or there is nothing to scan.
    pub fn start(&self) -> Option<JoinHandle<()>> {
        if self.hosts.is_empty() {
            warn!("No hosts to scan");
            return None;
        }
        if !self.state.begin(2 * self.hosts.len()) {
            return None;
        }
        let scanner = self.clone();
        Some(tokio::spawn(async move {
            let started = Instant::now();
            let aborted = scanner.scan().await;
            scanner.state.finish(started, aborted);
        }))
    }

    async fn scan(&self) -> bool {
        info!("Scanning {} host(s)", self.hosts.len());

        let mut workers = JoinSet::new();
        let mut aborted = false;

        for host in &self.hosts {
            if !self.is_running() {
                aborted = true;
                break;
            }
            while workers.len() >= NET_WORKERS {
                if let Some(Ok(true)) = workers.join_next().await {
                    aborted = true;
                }
            }

            let prober = self.prober.clone();
            let state = Arc::clone(&self.state);
            let targets = [
                ConnectionTarget::tcp(host, self.port),
                ConnectionTarget::udp(host, self.port),
            ];
            workers.spawn(async move {
                let report = prober
                    .probe_all(targets, |n, _| state.progress(n), 10)
                    .await;
                state.collect(report.found);
                report.aborted
            });
        }

        while let Some(result) = workers.join_next().await {
            if let Ok(true) = result {
                aborted = true;
            }
        }
        aborted
    }
}
