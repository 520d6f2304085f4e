//! Probe engine behaviour against a scripted transport.

mod common;

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

use common::{Bus, Event, MockConnector, TestDevice, handler, handler_with_registers};
use fieldprobe::probe::DEFAULT_MIN_TIMEOUT;
use fieldprobe::register::Value;
use fieldprobe::transport::{Access, TransportError};
use fieldprobe::{
    ConnectionPool, ConnectionTarget, DeviceTypeHandler, HandlerRegistry, Method, ProbeError,
    ProbeOutcome, Prober, Register, constructor,
};

fn prober(bus: &Arc<Bus>, registry: HandlerRegistry) -> Prober {
    let pool = Arc::new(ConnectionPool::new(MockConnector::new(bus)));
    Prober::new(pool, Arc::new(registry))
}

#[tokio::test]
async fn test_first_registered_handler_wins() {
    let bus = Bus::new();
    bus.holding(1, 0x100, &[7]);
    bus.holding(1, 0x200, &[9]);

    let mut registry = HandlerRegistry::new();
    registry.register(handler("first", 0x100, 7, "F-7").units([1]));
    registry.register(handler("second", 0x200, 9, "S-9").units([1]));
    let prober = prober(&bus, registry);

    let target = ConnectionTarget::tcp("10.0.0.1", 502);
    let ProbeOutcome::Identified(device) = prober.probe(&target).await else {
        panic!("expected a device");
    };
    assert_eq!(device.handler(), "first");
    assert_eq!(device.model(), "F-7");
    assert_eq!(device.unit(), 1);
    assert_eq!(device.vendor_name(), "Acme");
    assert_eq!(bus.reads(), vec![(1, 0x100)]);

    device.release(prober.pool());
}

#[tokio::test]
async fn test_read_error_aborts_handler_units() {
    let bus = Bus::new();
    bus.reply(1, Access::Holding, 0x100, Err(TransportError::Io("broken pipe".to_string())));
    bus.holding(2, 0x100, &[7]);
    bus.holding(2, 0x200, &[9]);

    let mut registry = HandlerRegistry::new();
    registry.register(handler("first", 0x100, 7, "F-7").units([1, 2]));
    registry.register(handler("second", 0x200, 9, "S-9").units([2]));
    let prober = prober(&bus, registry);

    let target = ConnectionTarget::tcp("10.0.0.1", 502);
    let ProbeOutcome::Identified(device) = prober.probe(&target).await else {
        panic!("expected a device");
    };
    assert_eq!(device.handler(), "second");
    assert_eq!(device.unit(), 2);
    // Unit 2 of the first handler was never tried.
    assert_eq!(bus.reads(), vec![(1, 0x100), (2, 0x200)]);

    device.release(prober.pool());
}

#[tokio::test]
async fn test_exception_and_unknown_value_advance_to_next_unit() {
    let bus = Bus::new();
    let exception = TransportError::Exception("illegal function".to_string());
    bus.reply(1, Access::Holding, 0x100, Err(exception));
    bus.holding(2, 0x100, &[0x55]);
    bus.holding(3, 0x100, &[7]);

    let mut registry = HandlerRegistry::new();
    registry.register(handler("first", 0x100, 7, "F-7").units([1, 2, 3]));
    let prober = prober(&bus, registry);

    let target = ConnectionTarget::tcp("10.0.0.1", 502);
    let ProbeOutcome::Identified(device) = prober.probe(&target).await else {
        panic!("expected a device");
    };
    assert_eq!(device.unit(), 3);
    assert_eq!(bus.reads(), vec![(1, 0x100), (2, 0x100), (3, 0x100)]);

    device.release(prober.pool());
}

#[tokio::test(start_paused = true)]
async fn test_udp_target_latency_and_timeout() {
    let bus = Bus::new();
    bus.holding(1, 0x1000, &[0xa1b1]);
    bus.set_latency(Duration::from_millis(50));

    let mut registry = HandlerRegistry::new();
    registry.register(
        handler("meter", 0x1000, 0xa1b1, "VM-3P75CT")
            .methods([Method::Udp])
            .units([1])
            .min_timeout(Duration::from_millis(100)),
    );
    let prober = prober(&bus, registry);

    let target: ConnectionTarget = "udp:10.0.0.5:502".parse().unwrap();
    let report = prober
        .probe_all([target], |_, _| ControlFlow::Continue(()), 10)
        .await;

    assert_eq!(report.found.len(), 1);
    assert!(report.failed.is_empty());
    let device = &report.found[0];
    assert_eq!(device.target(), &ConnectionTarget::udp("10.0.0.5", 502).with_unit(1));
    assert_eq!(device.latency(), Duration::from_millis(50));
    assert_eq!(device.timeout(), Duration::from_millis(200));

    for device in report.found {
        device.release(prober.pool());
    }
}

#[tokio::test(start_paused = true)]
async fn test_min_timeout_floor() {
    let bus = Bus::new();
    bus.holding(1, 0x1000, &[1]);
    bus.set_latency(Duration::from_millis(10));

    let mut registry = HandlerRegistry::new();
    registry.register(handler("h", 0x1000, 1, "M").units([1]));
    let prober = prober(&bus, registry);

    let target = ConnectionTarget::udp("10.0.0.5", 502);
    let ProbeOutcome::Identified(device) = prober.probe(&target).await else {
        panic!("expected a device");
    };
    assert_eq!(device.timeout(), DEFAULT_MIN_TIMEOUT);
    device.release(prober.pool());
}

#[tokio::test]
async fn test_timeout_override_applies_to_identification() {
    let bus = Bus::new();
    bus.holding(1, 0x1000, &[1]);

    let mut registry = HandlerRegistry::new();
    registry.register(
        handler("h", 0x1000, 1, "M")
            .units([1])
            .timeout(Duration::from_millis(800)),
    );
    let prober = prober(&bus, registry).timeout(Some(Duration::from_millis(150)));

    let target = ConnectionTarget::tcp("10.0.0.5", 502);
    let ProbeOutcome::Identified(device) = prober.probe(&target).await else {
        panic!("expected a device");
    };
    assert!(bus.events().contains(&Event::Read {
        unit: 1,
        access: Access::Holding,
        base: 0x1000,
        timeout: Duration::from_millis(150),
    }));
    device.release(prober.pool());
}

#[tokio::test]
async fn test_not_found_flushes_progress() {
    let bus = Bus::new();
    let mut registry = HandlerRegistry::new();
    registry.register(handler("h", 0x1000, 1, "M").units([1]));
    let prober = prober(&bus, registry);

    let targets: Vec<_> = (1..=3)
        .map(|i| ConnectionTarget::tcp(format!("10.0.0.{i}"), 502))
        .collect();
    let mut calls = Vec::new();
    let report = prober
        .probe_all(
            targets.clone(),
            |n, found| {
                calls.push((n, found.is_some()));
                ControlFlow::Continue(())
            },
            10,
        )
        .await;

    assert!(report.found.is_empty());
    assert_eq!(report.failed, targets);
    assert!(!report.aborted);
    assert_eq!(calls, vec![(3, false)]);
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_udp_target_is_reported_failed() {
    let bus = Bus::new();
    let mut registry = HandlerRegistry::new();
    registry.register(handler("meter", 0x1000, 0xa1b1, "VM-3P75CT").units([1]));
    let prober = prober(&bus, registry);

    let target = ConnectionTarget::udp("10.0.0.9", 502);
    let report = prober
        .probe_all([target.clone()], |_, _| ControlFlow::Continue(()), 10)
        .await;

    assert!(report.found.is_empty());
    assert_eq!(report.failed, vec![target]);
    assert_eq!(bus.reads().len(), 1);
}

#[tokio::test]
async fn test_break_on_final_flush_marks_aborted() {
    let bus = Bus::new();
    let mut registry = HandlerRegistry::new();
    registry.register(handler("h", 0x1000, 1, "M").units([1]));
    let prober = prober(&bus, registry);

    let targets = vec![ConnectionTarget::tcp("a", 502), ConnectionTarget::tcp("b", 502)];
    let report = prober
        .probe_all(targets, |_, _| ControlFlow::Break(()), 10)
        .await;

    assert!(report.aborted);
    assert_eq!(report.failed.len(), 2);
}

#[tokio::test]
async fn test_progress_interval_and_found_reports() {
    let bus = Bus::new();
    bus.holding(1, 0x1000, &[1]);
    let mut registry = HandlerRegistry::new();
    registry.register(handler("h", 0x1000, 1, "M").units([1]));
    let prober = prober(&bus, registry);

    let targets = vec![
        ConnectionTarget::tcp("a", 502),
        ConnectionTarget::tcp("b", 502).with_unit(2),
        ConnectionTarget::tcp("c", 502).with_unit(2),
        ConnectionTarget::tcp("d", 502),
        ConnectionTarget::tcp("e", 502).with_unit(2),
    ];
    let mut calls = Vec::new();
    let report = prober
        .probe_all(
            targets,
            |n, found| {
                calls.push((n, found.map(|d| d.target().address.clone())));
                ControlFlow::Continue(())
            },
            2,
        )
        .await;

    assert_eq!(
        calls,
        vec![
            (1, Some("a".to_string())),
            (2, None),
            (1, Some("d".to_string())),
            (1, None),
        ]
    );
    assert_eq!(report.found.len(), 2);
    for device in report.found {
        device.release(prober.pool());
    }
}

#[tokio::test]
async fn test_connect_error_is_recorded_as_failed() {
    let bus = Bus::new();
    bus.fail_open();
    let mut registry = HandlerRegistry::new();
    registry.register(handler("h", 0x1000, 1, "M").units([1]));
    let prober = prober(&bus, registry);

    let target = ConnectionTarget::tcp("10.0.0.1", 502);
    assert!(matches!(prober.probe(&target).await, ProbeOutcome::ConnectError));

    let mut calls = Vec::new();
    let report = prober
        .probe_all(
            [target.clone()],
            |n, _| {
                calls.push(n);
                ControlFlow::Continue(())
            },
            10,
        )
        .await;
    assert_eq!(report.failed, vec![target]);
    assert_eq!(calls, vec![1]);
}

#[tokio::test]
async fn test_break_aborts_run() {
    let bus = Bus::new();
    bus.holding(1, 0x1000, &[1]);
    let mut registry = HandlerRegistry::new();
    registry.register(handler("h", 0x1000, 1, "M").units([1]));
    let prober = prober(&bus, registry);

    let targets = vec![ConnectionTarget::tcp("a", 502), ConnectionTarget::tcp("b", 502)];
    let report = prober
        .probe_all(targets, |_, _| ControlFlow::Break(()), 10)
        .await;

    assert!(report.aborted);
    assert_eq!(report.found.len(), 1);
    assert_eq!(bus.opens(), 1);
    for device in report.found {
        device.release(prober.pool());
    }
}

#[tokio::test]
async fn test_method_filter_unit_override_and_candidate_filter() {
    let bus = Bus::new();
    bus.holding(4, 0x1000, &[1]);
    bus.holding(5, 0x1000, &[1]);

    let mut registry = HandlerRegistry::new();
    registry.register(handler("rtu-only", 0x2000, 1, "R").methods([Method::Rtu]).units([4]));
    registry.register(handler("h", 0x1000, 1, "M").units([1, 4, 5]));
    let prober = prober(&bus, registry).filter(|t| t.unit != 4);

    // Explicit unit wins over the handler's candidates.
    let ProbeOutcome::Identified(device) = prober
        .probe(&ConnectionTarget::tcp("10.0.0.1", 502).with_unit(5))
        .await
    else {
        panic!("expected a device");
    };
    assert_eq!(device.unit(), 5);
    assert_eq!(bus.reads(), vec![(5, 0x1000)]);
    device.release(prober.pool());

    // Unit 1 times out and aborts the handler before the filtered unit 4.
    assert!(matches!(
        prober.probe(&ConnectionTarget::tcp("10.0.0.1", 502)).await,
        ProbeOutcome::NotFound
    ));
    assert_eq!(bus.reads(), vec![(5, 0x1000), (1, 0x1000)]);
}

#[tokio::test]
async fn test_filter_skips_units_without_reading() {
    let bus = Bus::new();
    bus.holding(5, 0x1000, &[1]);

    let mut registry = HandlerRegistry::new();
    registry.register(handler("h", 0x1000, 1, "M").units([1, 4, 5]));
    let prober = prober(&bus, registry).filter(|t| t.unit == 5);

    let target = ConnectionTarget::tcp("10.0.0.1", 502);
    let ProbeOutcome::Identified(device) = prober.probe(&target).await else {
        panic!("expected a device");
    };
    assert_eq!(device.unit(), 5);
    assert_eq!(bus.reads(), vec![(5, 0x1000)]);
    device.release(prober.pool());
}

#[tokio::test]
async fn test_input_bank_fallback() {
    let bus = Bus::new();
    bus.reply(1, Access::Input, 0x1000, Ok(vec![2]));

    let mut registry = HandlerRegistry::new();
    let test_device = || constructor(|_, _, _| TestDevice { bases: Vec::new() });
    registry.register(
        DeviceTypeHandler::new("h", Register::u16(0x1000))
            .model(1u16, "holding-model", Access::Holding, test_device())
            .model(2u16, "input-model", Access::Input, test_device())
            .units([1]),
    );
    let prober = prober(&bus, registry);

    // Holding times out, but the handler still moves on to the next bank.
    let target = ConnectionTarget::tcp("10.0.0.1", 502);
    let ProbeOutcome::Identified(device) = prober.probe(&target).await else {
        panic!("expected a device");
    };
    assert_eq!(device.model(), "input-model");
    device.release(prober.pool());
}

#[tokio::test]
async fn test_connection_lifetime_follows_device() {
    let bus = Bus::new();
    bus.holding(1, 0x1000, &[1]);
    let mut registry = HandlerRegistry::new();
    registry.register(handler("h", 0x1000, 1, "M").units([1]));
    let prober = prober(&bus, registry);

    assert!(matches!(
        prober.probe(&ConnectionTarget::tcp("10.0.0.2", 502).with_unit(3)).await,
        ProbeOutcome::NotFound
    ));
    assert_eq!(bus.closes(), 1);

    let target = ConnectionTarget::tcp("10.0.0.1", 502);
    let ProbeOutcome::Identified(device) = prober.probe(&target).await else {
        panic!("expected a device");
    };
    assert_eq!(device.connection().refcount(), 1);
    assert_eq!(bus.closes(), 1);

    let conn = Arc::clone(device.connection());
    device.release(prober.pool());
    assert!(conn.is_closed());
    assert_eq!(bus.closes(), 2);
}

#[tokio::test]
async fn test_device_register_access() {
    let bus = Bus::new();
    bus.holding(1, 0x1000, &[1]);
    bus.holding(1, 0x20, &[230]);
    bus.holding(1, 0x21, &[50]);

    let mut registry = HandlerRegistry::new();
    registry.register(handler_with_registers("h", 0x1000, 1, "M", &[0x20, 0x21]).units([1]));
    let prober = prober(&bus, registry);

    let target = ConnectionTarget::tcp("10.0.0.1", 502);
    let ProbeOutcome::Identified(mut device) = prober.probe(&target).await else {
        panic!("expected a device");
    };

    assert_eq!(assert_ok!(device.refresh().await), 2);
    assert_eq!(device.registers()[0].value(), Some(&Value::Number(230.0)));
    // Nothing changed on the second pass.
    assert_eq!(assert_ok!(device.refresh().await), 0);

    let mut reg = Register::u16(0x20).scale(10.0);
    assert!(assert_ok!(device.read_register(&mut reg).await));
    assert_eq!(reg.value(), Some(&Value::Number(23.0)));

    let err = assert_err!(device.write_register(&reg).await);
    assert!(matches!(err, ProbeError::ReadOnly(_)));

    let mut setpoint = Register::u16(0x30).named("/Setpoint").scale(10.0).writable();
    setpoint.set_value(12.5);
    assert_ok!(device.write_register(&setpoint).await);
    assert!(bus.events().contains(&Event::Write {
        unit: 1,
        base: 0x30,
        words: vec![125],
    }));

    let mut missing = Register::u16(0x40);
    assert!(matches!(
        device.read_register(&mut missing).await,
        Err(ProbeError::Transport(TransportError::Timeout(_)))
    ));

    device.release(prober.pool());
}
