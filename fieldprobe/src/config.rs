//! Configuration for the fieldprobe binary.

use fieldprobe_common::LoggingConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::device::{DeviceModel, constructor};
use crate::probe::DeviceTypeHandler;
use crate::register::{NumFormat, Register, Value};
use crate::target::{ConnectionTarget, DEFAULT_PORT, Method};
use crate::transport::Access;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Load(#[from] fieldprobe_common::Error),
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Complete configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FieldProbeConfig {
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Identification settings
    #[serde(default)]
    pub probe: ProbeConfig,

    /// mDNS discovery settings
    #[serde(default)]
    pub discovery: DiscoveryConfig,

    /// Static targets to probe
    #[serde(default)]
    pub targets: Vec<TargetConfig>,

    /// Additional device type handlers
    #[serde(default)]
    pub handlers: Vec<HandlerConfig>,
}

/// Probe engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeConfig {
    /// Override every handler's identification timeout (milliseconds)
    #[serde(default)]
    pub timeout_ms: Option<u64>,

    /// Report progress every this many targets
    #[serde(default = "default_progress_interval")]
    pub progress_interval: usize,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            timeout_ms: None,
            progress_interval: default_progress_interval(),
        }
    }
}

impl ProbeConfig {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

fn default_progress_interval() -> usize {
    10
}

/// mDNS discovery settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Run the mDNS listener
    #[serde(default)]
    pub enabled: bool,

    /// Service names to query, e.g. "_modbus._tcp"
    #[serde(default)]
    pub services: Vec<String>,

    /// Seconds between announcements
    #[serde(default = "default_announce_interval")]
    pub announce_interval_secs: u64,

    /// Seconds between draining discovered targets
    #[serde(default = "default_drain_interval")]
    pub drain_interval_secs: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            services: Vec::new(),
            announce_interval_secs: default_announce_interval(),
            drain_interval_secs: default_drain_interval(),
        }
    }
}

fn default_announce_interval() -> u64 {
    10
}

fn default_drain_interval() -> u64 {
    1
}

/// A statically configured target.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TargetConfig {
    /// Modbus/TCP
    Tcp {
        host: String,
        #[serde(default = "default_modbus_port")]
        port: u16,
        /// 0 tries every unit the handlers name
        #[serde(default)]
        unit: u8,
    },
    /// Modbus/UDP
    Udp {
        host: String,
        #[serde(default = "default_modbus_port")]
        port: u16,
        #[serde(default)]
        unit: u8,
    },
    /// Modbus RTU on a serial line
    Rtu {
        /// Serial port, e.g. "/dev/ttyUSB0" or "ttyUSB0"
        port: String,
        #[serde(default = "default_baud_rate")]
        baud_rate: u32,
        #[serde(default)]
        unit: u8,
    },
}

fn default_modbus_port() -> u16 {
    DEFAULT_PORT
}

fn default_baud_rate() -> u32 {
    9600
}

impl TargetConfig {
    pub fn to_target(&self) -> ConnectionTarget {
        match self {
            TargetConfig::Tcp { host, port, unit } => {
                ConnectionTarget::tcp(host, *port).with_unit(*unit)
            }
            TargetConfig::Udp { host, port, unit } => {
                ConnectionTarget::udp(host, *port).with_unit(*unit)
            }
            TargetConfig::Rtu {
                port,
                baud_rate,
                unit,
            } => ConnectionTarget::rtu(port, *baud_rate).with_unit(*unit),
        }
    }
}

/// Identification register data type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdDataType {
    #[default]
    U16,
    U32,
    Text,
}

impl IdDataType {
    /// Largest identifier a numeric type can hold.
    fn max_id(self) -> u64 {
        match self {
            IdDataType::U16 => u16::MAX as u64,
            IdDataType::U32 => u32::MAX as u64,
            IdDataType::Text => 0,
        }
    }
}

/// Register bank.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegisterType {
    #[default]
    Holding,
    Input,
}

impl From<RegisterType> for Access {
    fn from(t: RegisterType) -> Self {
        match t {
            RegisterType::Holding => Access::Holding,
            RegisterType::Input => Access::Input,
        }
    }
}

/// A device type handler defined in configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandlerConfig {
    /// Handler name (unique)
    pub name: String,

    /// Identification register address
    pub address: u16,

    #[serde(default)]
    pub data_type: IdDataType,

    /// Register count for text identifiers
    #[serde(default = "default_count")]
    pub count: u16,

    /// Register bank holding the identifier
    #[serde(rename = "type", default)]
    pub register_type: RegisterType,

    /// Transports ("tcp", "udp", "rtu"); empty means all
    #[serde(default)]
    pub methods: Vec<String>,

    /// Candidate unit addresses
    #[serde(default = "default_units")]
    pub units: Vec<u8>,

    /// Candidate serial rates
    #[serde(default)]
    pub rates: Vec<u32>,

    /// Identification timeout in milliseconds
    #[serde(default)]
    pub timeout_ms: Option<u64>,

    /// Known models
    pub models: Vec<ModelConfig>,
}

fn default_count() -> u16 {
    1
}

fn default_units() -> Vec<u8> {
    vec![1]
}

/// One identifiable model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Identifier value: a number, or a string for text identifiers
    pub value: serde_json::Value,
    pub model: String,
    #[serde(default)]
    pub vendor: String,
    #[serde(default)]
    pub device_type: String,
}

/// Device object for configured models.
#[derive(Debug, Clone)]
pub struct ConfiguredDevice {
    vendor: String,
    device_type: String,
}

impl DeviceModel for ConfiguredDevice {
    fn vendor_name(&self) -> &str {
        &self.vendor
    }

    fn device_type(&self) -> &str {
        &self.device_type
    }
}

impl HandlerConfig {
    fn id_register(&self) -> Register {
        let reg = match self.data_type {
            IdDataType::U16 => Register::u16(self.address),
            IdDataType::U32 => Register::numeric(self.address, NumFormat::U32),
            IdDataType::Text => Register::text(self.address, self.count),
        };
        reg.access(self.register_type.into())
    }

    fn model_value(&self, model: &ModelConfig) -> Result<Value, ConfigError> {
        let invalid = || {
            ConfigError::Validation(format!(
                "Handler '{}': model '{}' has an unusable value {}",
                self.name, model.model, model.value
            ))
        };
        match (self.data_type, &model.value) {
            (IdDataType::Text, serde_json::Value::String(s)) => Ok(Value::Text(s.clone())),
            (IdDataType::U16 | IdDataType::U32, serde_json::Value::Number(n)) => n
                .as_u64()
                .filter(|&v| v <= self.data_type.max_id())
                .map(|v| Value::Number(v as f64))
                .ok_or_else(invalid),
            // Hex strings such as "0xa1b1" for numeric identifiers
            (IdDataType::U16 | IdDataType::U32, serde_json::Value::String(s)) => s
                .strip_prefix("0x")
                .and_then(|hex| u64::from_str_radix(hex, 16).ok())
                .filter(|&v| v <= self.data_type.max_id())
                .map(|v| Value::Number(v as f64))
                .ok_or_else(invalid),
            _ => Err(invalid()),
        }
    }

    /// Build the handler.
    pub fn to_handler(&self) -> Result<DeviceTypeHandler, ConfigError> {
        let methods = self
            .methods
            .iter()
            .map(|m| {
                m.parse::<Method>()
                    .map_err(|e| ConfigError::Validation(format!("Handler '{}': {}", self.name, e)))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut handler = DeviceTypeHandler::new(&self.name, self.id_register())
            .methods(methods)
            .units(self.units.iter().copied())
            .rates(self.rates.iter().copied());

        if let Some(ms) = self.timeout_ms {
            handler = handler.timeout(Duration::from_millis(ms));
        }

        for model in &self.models {
            let value = self.model_value(model)?;
            let device = ConfiguredDevice {
                vendor: model.vendor.clone(),
                device_type: model.device_type.clone(),
            };
            handler = handler.model(
                value,
                &model.model,
                self.register_type.into(),
                constructor(move |_, _, _| device.clone()),
            );
        }

        Ok(handler)
    }
}

impl FieldProbeConfig {
    /// Load configuration from a JSON5 file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: FieldProbeConfig = fieldprobe_common::load_config(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.probe.progress_interval == 0 {
            return Err(ConfigError::Validation(
                "probe.progress_interval must be at least 1".to_string(),
            ));
        }

        if self.discovery.announce_interval_secs == 0 || self.discovery.drain_interval_secs == 0 {
            return Err(ConfigError::Validation(
                "discovery intervals must be at least 1 second".to_string(),
            ));
        }

        for service in &self.discovery.services {
            if !service.starts_with('_') || !service.contains('.') {
                return Err(ConfigError::Validation(format!(
                    "invalid service name '{}' (expected e.g. _modbus._tcp)",
                    service
                )));
            }
        }

        for target in &self.targets {
            match target {
                TargetConfig::Tcp { host, .. } | TargetConfig::Udp { host, .. }
                    if host.is_empty() =>
                {
                    return Err(ConfigError::Validation(
                        "target host cannot be empty".to_string(),
                    ));
                }
                TargetConfig::Rtu { port, baud_rate, .. } if port.is_empty() || *baud_rate == 0 => {
                    return Err(ConfigError::Validation(format!(
                        "RTU target '{}': port and baud_rate are required",
                        port
                    )));
                }
                _ => {}
            }
        }

        for (i, handler) in self.handlers.iter().enumerate() {
            if handler.name.is_empty() {
                return Err(ConfigError::Validation(
                    "Handler name cannot be empty".to_string(),
                ));
            }
            if self.handlers[..i].iter().any(|h| h.name == handler.name) {
                return Err(ConfigError::Validation(format!(
                    "Duplicate handler '{}'",
                    handler.name
                )));
            }
            if handler.models.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "Handler '{}': at least one model is required",
                    handler.name
                )));
            }
            handler.to_handler()?;
        }

        Ok(())
    }

    /// Static targets as connection targets.
    pub fn connection_targets(&self) -> Vec<ConnectionTarget> {
        self.targets.iter().map(TargetConfig::to_target).collect()
    }
}
