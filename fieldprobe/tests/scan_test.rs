//! Background scanners against a scripted bus.

mod common;

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use common::{Bus, MockConnector, handler};
use fieldprobe::scan::{NetScanner, SerialScanner, Subnet, UNIT_MAX};
use fieldprobe::{ConnectionPool, HandlerRegistry, Method, Prober};

fn prober(bus: &Arc<Bus>, registry: HandlerRegistry) -> Prober {
    let pool = Arc::new(ConnectionPool::new(MockConnector::new(bus)));
    Prober::new(pool, Arc::new(registry))
}

#[tokio::test(start_paused = true)]
async fn test_serial_quick_scan_pins_rate() {
    let bus = Bus::new();
    bus.set_live_rate(19200);
    bus.holding(2, 0x1000, &[1]);

    let mut registry = HandlerRegistry::new();
    registry.register(
        handler("h", 0x1000, 1, "M")
            .methods([Method::Rtu])
            .units([1, 2])
            .rates([9600, 19200, 38400]),
    );
    let prober = prober(&bus, registry);

    let scanner = SerialScanner::new(&prober, "ttyX", Vec::new(), Duration::from_millis(100));
    let task = scanner.start().unwrap();
    assert!(scanner.start().is_none());
    task.await.unwrap();

    assert!(!scanner.is_running());
    let devices = scanner.take_devices();
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].target().rate, 19200);
    assert_eq!(devices[0].unit(), 2);
    assert!(scanner.take_devices().is_empty());

    // Two rates tried, two units each; 38400 never opened.
    assert_eq!(scanner.progress(), (4, UNIT_MAX as usize));
    assert_eq!(bus.opens(), 2);

    for device in devices {
        device.release(prober.pool());
    }
    assert_eq!(prober.pool().open_serial_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_serial_full_scan_skips_found_units() {
    let bus = Bus::new();
    bus.holding(2, 0x1000, &[1]);
    bus.holding(200, 0x1000, &[1]);

    let mut registry = HandlerRegistry::new();
    registry.register(
        handler("h", 0x1000, 1, "M")
            .methods([Method::Rtu])
            .units([2])
            .rates([9600]),
    );
    let prober = prober(&bus, registry);

    let scanner =
        SerialScanner::new(&prober, "ttyX", vec![9600], Duration::from_millis(10)).full(true);
    scanner.start().unwrap().await.unwrap();

    let mut units: Vec<u8> = scanner.take_devices().iter().map(|d| d.unit()).collect();
    units.sort();
    assert_eq!(units, vec![2, 200]);
    assert_eq!(bus.reads().iter().filter(|(u, _)| *u == 2).count(), 1);
    assert_eq!(scanner.progress().0, 1 + (UNIT_MAX as usize - 1));
}

#[tokio::test(start_paused = true)]
async fn test_stop_aborts_scan() {
    let bus = Bus::new();
    let mut registry = HandlerRegistry::new();
    registry.register(
        handler("h", 0x1000, 1, "M")
            .methods([Method::Rtu])
            .units([1])
            .rates([9600]),
    );
    let prober = prober(&bus, registry);

    let scanner =
        SerialScanner::new(&prober, "ttyX", Vec::new(), Duration::from_millis(10)).full(true);
    scanner.stop();
    let task = scanner.start().unwrap();
    scanner.stop();
    task.await.unwrap();

    assert!(!scanner.is_running());
    assert!(scanner.progress().0 < UNIT_MAX as usize);
}

#[tokio::test]
async fn test_net_scanner_probes_tcp_and_udp() {
    let bus = Bus::new();
    bus.holding(1, 0x1000, &[1]);

    let mut registry = HandlerRegistry::new();
    registry.register(handler("h", 0x1000, 1, "M").methods([Method::Udp]).units([1]));
    let prober = prober(&bus, registry);

    let hosts = vec!["10.0.0.1".to_string(), "10.0.0.2".to_string()];
    let scanner = NetScanner::new(&prober, hosts, 502);
    scanner.start().unwrap().await.unwrap();

    let devices = scanner.take_devices();
    assert_eq!(devices.len(), 2);
    assert!(devices.iter().all(|d| d.target().method == Method::Udp));
    assert_eq!(scanner.progress(), (4, 4));

    for device in devices {
        device.release(prober.pool());
    }
}

#[tokio::test]
async fn test_net_scanner_without_hosts() {
    let bus = Bus::new();
    let prober = prober(&bus, HandlerRegistry::new());
    let scanner = NetScanner::new(&prober, Vec::new(), 502);
    assert!(scanner.start().is_none());
    assert!(!scanner.is_running());
}

#[test]
fn test_subnet_hosts() {
    let net: Subnet = "192.168.1.77/30".parse().unwrap();
    let hosts: Vec<_> = net.hosts().collect();
    assert_eq!(
        hosts,
        vec![Ipv4Addr::new(192, 168, 1, 77), Ipv4Addr::new(192, 168, 1, 78)]
    );

    let net: Subnet = "10.0.0.0/24".parse().unwrap();
    assert_eq!(net.hosts().count(), 254);

    let single: Subnet = "10.0.0.9/32".parse().unwrap();
    assert_eq!(single.hosts().collect::<Vec<_>>(), vec![Ipv4Addr::new(10, 0, 0, 9)]);

    assert!("10.0.0.0".parse::<Subnet>().is_err());
    assert!("10.0.0.0/8".parse::<Subnet>().is_err());
    assert!("10.0.0.0/33".parse::<Subnet>().is_err());
    assert!("fe80::/64".parse::<Subnet>().is_err());
}

#[tokio::test]
async fn test_net_scanner_over_subnet_skips_excluded() {
    let bus = Bus::new();
    let mut registry = HandlerRegistry::new();
    registry.register(handler("h", 0x1000, 1, "M").units([1]));
    let prober = prober(&bus, registry);

    let net: Subnet = "10.0.0.0/29".parse().unwrap();
    let exclude = [Ipv4Addr::new(10, 0, 0, 3)];
    let scanner = NetScanner::for_subnets(&prober, &[net], &exclude, 502);
    scanner.start().unwrap().await.unwrap();

    // Six hosts less the excluded one, over tcp and udp.
    assert_eq!(scanner.progress(), (10, 10));
    assert_eq!(bus.opens(), 10);
    assert!(bus.events().iter().all(|e| !format!("{e:?}").contains("10.0.0.3:")));
}
