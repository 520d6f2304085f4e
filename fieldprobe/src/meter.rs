//! Built-in handler for the Victron Energy VM-3P75CT energy meter.
//!
//! The meter answers Modbus/UDP on unit 1 and announces itself over mDNS.

use std::sync::Arc;

use crate::device::{DeviceModel, constructor};
use crate::pool::PooledConnection;
use crate::probe::DeviceTypeHandler;
use crate::register::{DisplayFormat, Register, TextEncoding};
use crate::target::{ConnectionTarget, Method};
use crate::transport::Access;

/// mDNS service the meter announces.
pub const ENERGY_METER_SERVICE: &str = "_victron-energy-meter._udp";

/// Product id register.
const PRODUCT_ID_REGISTER: u16 = 0x1000;

const VM_3P75CT: u16 = 0xa1b1;

/// Phase sequence labels, indexed by the raw register value.
const PHASE_SEQUENCES: [&str; 2] = ["L1-L2-L3", "L1-L3-L2"];

/// A three-phase energy meter.
#[derive(Debug)]
pub struct EnergyMeter {
    target: ConnectionTarget,
    model: String,
}

impl EnergyMeter {
    fn new(target: &ConnectionTarget, _conn: &Arc<PooledConnection>, model: &str) -> Self {
        Self {
            target: target.clone(),
            model: model.to_string(),
        }
    }

    pub fn target(&self) -> &ConnectionTarget {
        &self.target
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn phase_registers(n: u16) -> Vec<Register> {
        let base = 0x3040 + 8 * (n - 1);
        let power = 0x3082 + 4 * (n - 1);
        vec![
            Register::s16(base)
                .named(format!("/Ac/L{}/Voltage", n))
                .scale(100.0)
                .display(DisplayFormat::units(1, "V")),
            Register::s16(base + 1)
                .named(format!("/Ac/L{}/Current", n))
                .scale(100.0)
                .display(DisplayFormat::units(1, "A")),
            Register::u32(base + 2)
                .named(format!("/Ac/L{}/Energy/Forward", n))
                .scale(100.0)
                .invalid(0xffff_ffff)
                .display(DisplayFormat::units(1, "kWh")),
            Register::u32(base + 4)
                .named(format!("/Ac/L{}/Energy/Reverse", n))
                .scale(100.0)
                .invalid(0xffff_ffff)
                .display(DisplayFormat::units(1, "kWh")),
            Register::s32(power)
                .named(format!("/Ac/L{}/Power", n))
                .display(DisplayFormat::units(1, "W")),
        ]
    }
}

impl DeviceModel for EnergyMeter {
    fn vendor_name(&self) -> &str {
        "Victron Energy"
    }

    fn device_type(&self) -> &str {
        "energy meter"
    }

    fn registers(&self) -> Vec<Register> {
        let mut regs = vec![
            Register::text(0x1001, 8).named("/Serial"),
            Register::u16(0x100b).named("/HardwareVersion"),
            Register::text(0x2002, 32)
                .named("/CustomName")
                .encoding(TextEncoding::Utf8),
            Register::u16(0x3032)
                .named("/Ac/Frequency")
                .scale(100.0)
                .display(DisplayFormat::units(1, "Hz")),
            Register::s16(0x3033)
                .named("/Ac/PENVoltage")
                .scale(100.0)
                .display(DisplayFormat::units(1, "V")),
            Register::u32(0x3034)
                .named("/Ac/Energy/Forward")
                .scale(100.0)
                .invalid(0xffff_ffff)
                .display(DisplayFormat::units(1, "kWh")),
            Register::u32(0x3036)
                .named("/Ac/Energy/Reverse")
                .scale(100.0)
                .invalid(0xffff_ffff)
                .display(DisplayFormat::units(1, "kWh")),
            Register::u16(0x3038).named("/ErrorCode"),
            Register::s32(0x3080)
                .named("/Ac/Power")
                .display(DisplayFormat::units(1, "W")),
            Register::u16(0x303b)
                .named("/PhaseSequence")
                .invalid(0xff)
                .display(DisplayFormat::labels(PHASE_SEQUENCES)),
        ];
        for n in 1..=3 {
            regs.extend(Self::phase_registers(n));
        }
        regs
    }
}

/// Handler identifying the meter by its product id.
pub fn energy_meter_handler() -> DeviceTypeHandler {
    DeviceTypeHandler::new("victron-energy-meter", Register::u16(PRODUCT_ID_REGISTER))
        .model(
            VM_3P75CT,
            "VM-3P75CT",
            Access::Holding,
            constructor(EnergyMeter::new),
        )
        .methods([Method::Udp])
        .units([1])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::register::Value;

    #[test]
    fn test_handler_shape() {
        let handler = energy_meter_handler();
        assert_eq!(handler.name(), "victron-energy-meter");
        assert!(handler.supports(Method::Udp));
        assert!(!handler.supports(Method::Tcp));
        assert_eq!(handler.id_register().base, 0x1000);

        let models: Vec<_> = handler.models().collect();
        assert_eq!(models, vec![(&Value::from(0xa1b1u16), "VM-3P75CT")]);
    }

    #[test]
    fn test_register_names_unique() {
        let meter = EnergyMeter {
            target: ConnectionTarget::udp("10.0.0.5", 502).with_unit(1),
            model: "VM-3P75CT".to_string(),
        };
        let regs = meter.registers();
        let mut names: Vec<_> = regs.iter().filter_map(|r| r.name.clone()).collect();
        let total = names.len();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), total);
        assert!(names.iter().any(|n| n == "/Ac/L3/Power"));
    }

    #[test]
    fn test_fast_registers_use_short_age_limit() {
        let meter = EnergyMeter {
            target: ConnectionTarget::udp("10.0.0.5", 502).with_unit(1),
            model: "VM-3P75CT".to_string(),
        };
        let regs = meter.registers();
        let power = regs
            .iter()
            .find(|r| r.name.as_deref() == Some("/Ac/Power"))
            .unwrap();
        assert_eq!(power.limit(), crate::register::AGE_LIMIT_FAST);

        let freq = regs
            .iter()
            .find(|r| r.name.as_deref() == Some("/Ac/Frequency"))
            .unwrap();
        assert_eq!(freq.limit(), crate::register::AGE_LIMIT_DEFAULT);
    }
}
