//! Modbus field device discovery.
//!
//! Probes statically configured targets, serial lines and targets found
//! over mDNS, printing one JSON line per identified device.

use anyhow::{Context, Result};
use clap::Parser;
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::ops::ControlFlow;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

use fieldprobe::config::FieldProbeConfig;
use fieldprobe::discovery::{Discovery, DnsSdCodec};
use fieldprobe::meter::{ENERGY_METER_SERVICE, energy_meter_handler};
use fieldprobe::modbus::ModbusConnector;
use fieldprobe::scan::{NetScanner, SERIAL_SCAN_TIMEOUT, SerialScanner, Subnet};
use fieldprobe::target::DEFAULT_PORT;
use fieldprobe::{ConnectionPool, ConnectionTarget, Device, HandlerRegistry, Prober};

/// Modbus field device discovery.
#[derive(Parser, Debug)]
#[command(name = "fieldprobe")]
#[command(about = "Finds and identifies Modbus devices")]
#[command(version)]
struct Args {
    /// Path to configuration file (JSON5 format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override log level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,

    /// mDNS service to look for, e.g. _modbus._tcp (repeatable, enables discovery)
    #[arg(long = "service")]
    services: Vec<String>,

    /// Scan a serial line for devices (repeatable)
    #[arg(long = "scan-serial")]
    scan_serial: Vec<String>,

    /// Try every unit address when scanning serial lines
    #[arg(long)]
    full_scan: bool,

    /// Scan an IPv4 subnet such as 192.168.1.0/24 over TCP and UDP (repeatable)
    #[arg(long = "scan-net")]
    scan_net: Vec<Subnet>,

    /// Address to leave out of subnet scans, e.g. this host (repeatable)
    #[arg(long)]
    exclude: Vec<Ipv4Addr>,

    /// Port used for subnet scans
    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Targets as method:address:port_or_rate[:unit]
    targets: Vec<ConnectionTarget>,
}

fn print_device(device: &Device) {
    let line = serde_json::json!({
        "handler": device.handler(),
        "vendor": device.vendor_name(),
        "type": device.device_type(),
        "model": device.model(),
        "target": device.target().to_string(),
        "unit": device.unit(),
        "latency_ms": device.latency().as_millis() as u64,
        "timeout_ms": device.timeout().as_millis() as u64,
    });
    println!("{}", line);
}

async fn probe_targets(
    prober: &Prober,
    targets: Vec<ConnectionTarget>,
    interval: usize,
    devices: &mut Vec<Device>,
) {
    if targets.is_empty() {
        return;
    }

    let total = targets.len();
    let mut done = 0;
    let report = prober
        .probe_all(
            targets,
            |n, found| {
                done += n;
                if let Some(device) = found {
                    print_device(device);
                }
                info!("Probed {}/{} target(s)", done, total);
                ControlFlow::Continue(())
            },
            interval,
        )
        .await;

    for target in &report.failed {
        warn!("No device identified at {}", target);
    }
    devices.extend(report.found);
}

async fn scan_serial(prober: &Prober, ttys: &[String], full: bool, devices: &mut Vec<Device>) {
    for tty in ttys {
        let scanner = SerialScanner::new(prober, tty, Vec::new(), SERIAL_SCAN_TIMEOUT).full(full);
        let Some(task) = scanner.start() else {
            continue;
        };
        if let Err(e) = task.await {
            error!("Scan of {} failed: {}", tty, e);
        }
        for device in scanner.take_devices() {
            print_device(&device);
            devices.push(device);
        }
    }
}

async fn scan_subnets(prober: &Prober, args: &Args, devices: &mut Vec<Device>) {
    if args.scan_net.is_empty() {
        return;
    }
    let scanner = NetScanner::for_subnets(prober, &args.scan_net, &args.exclude, args.port);
    let Some(task) = scanner.start() else {
        return;
    };
    if let Err(e) = task.await {
        error!("Network scan failed: {}", e);
    }
    for device in scanner.take_devices() {
        print_device(&device);
        devices.push(device);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let mut config = match &args.config {
        Some(path) => FieldProbeConfig::load_from_file(path)
            .with_context(|| format!("Failed to load config from {:?}", path))?,
        None => FieldProbeConfig::default(),
    };

    // Initialize logging
    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }
    fieldprobe_common::init_tracing(&config.logging)
        .map_err(|e| anyhow::anyhow!("Failed to init tracing: {}", e))?;

    info!("Starting fieldprobe");

    // Handlers: built-in first, then configured ones in file order
    let mut registry = HandlerRegistry::new();
    registry.register(energy_meter_handler());
    for handler in &config.handlers {
        registry.register(handler.to_handler()?);
    }

    let pool = Arc::new(ConnectionPool::new(Arc::new(ModbusConnector::default())));
    let prober = Prober::new(Arc::clone(&pool), Arc::new(registry)).timeout(config.probe.timeout());
    let interval = config.probe.progress_interval;

    let mut targets = config.connection_targets();
    targets.extend(args.targets.iter().cloned());

    let mut devices = Vec::new();
    let mut probed: HashSet<ConnectionTarget> = targets.iter().cloned().collect();

    probe_targets(&prober, targets, interval, &mut devices).await;
    scan_serial(&prober, &args.scan_serial, args.full_scan, &mut devices).await;
    scan_subnets(&prober, &args, &mut devices).await;

    let mut services = config.discovery.services.clone();
    services.extend(args.services.iter().cloned());

    if config.discovery.enabled || !services.is_empty() {
        let mut discovery = Discovery::bind(DnsSdCodec).context("Failed to bind mDNS socket")?;
        discovery.add_service(ENERGY_METER_SERVICE);
        for service in &services {
            discovery.add_service(service);
        }
        let discovery = Arc::new(discovery);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let listener = Arc::clone(&discovery);
        let listen_task = tokio::spawn(async move {
            listener.listen(shutdown_rx).await;
        });

        info!("Listening for {} service(s)", discovery.services().len());

        let announce_every = Duration::from_secs(config.discovery.announce_interval_secs);
        let drain_every = Duration::from_secs(config.discovery.drain_interval_secs);
        let mut announce = tokio::time::interval(announce_every);
        let mut drain = tokio::time::interval(drain_every);

        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);

        loop {
            tokio::select! {
                _ = announce.tick() => {
                    discovery.announce().await;
                }
                _ = drain.tick() => {
                    let fresh: Vec<_> = discovery
                        .drain_found()
                        .into_iter()
                        .filter(|t| probed.insert(t.clone()))
                        .collect();
                    probe_targets(&prober, fresh, interval, &mut devices).await;
                }
                _ = &mut ctrl_c => {
                    info!("Received shutdown signal");
                    break;
                }
            }
        }

        let _ = shutdown_tx.send(true);
        if let Err(e) = listen_task.await {
            error!("Discovery listener failed: {}", e);
        }
        discovery.leave();
    }

    info!("Found {} device(s)", devices.len());
    for device in devices {
        device.release(&pool);
    }

    Ok(())
}
