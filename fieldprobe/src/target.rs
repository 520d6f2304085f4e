//! Connection target descriptors.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Default Modbus network port.
pub const DEFAULT_PORT: u16 = 502;

/// Transport method used to reach a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Method {
    /// Stream socket (Modbus/TCP).
    Tcp,
    /// Datagram socket (Modbus/UDP).
    Udp,
    /// Shared multidrop serial line (Modbus RTU).
    Rtu,
}

impl Method {
    /// Return the string name for this method.
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Tcp => "tcp",
            Method::Udp => "udp",
            Method::Rtu => "rtu",
        }
    }

    /// Whether this method talks over a serial line.
    pub fn is_serial(&self) -> bool {
        matches!(self, Method::Rtu)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = TargetParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Method::Tcp),
            "udp" => Ok(Method::Udp),
            "rtu" => Ok(Method::Rtu),
            other => Err(TargetParseError::Method(other.to_string())),
        }
    }
}

/// Errors from parsing a target string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TargetParseError {
    #[error("unknown transport method '{0}'")]
    Method(String),
    #[error("expected method:address:port[:unit], got '{0}'")]
    Format(String),
    #[error("invalid subnet '{0}', expected a.b.c.d/16..32")]
    Subnet(String),
    #[error("invalid number '{0}'")]
    Number(String),
}

/// Where and how to reach a device.
///
/// For network methods `port` is meaningful and `rate` is zero; for serial
/// methods `address` is the tty and `rate` the baud rate. A `unit` of zero
/// means "unspecified": the probe engine falls back to the handler's
/// candidate list.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionTarget {
    pub method: Method,
    pub address: String,
    pub port: u16,
    pub rate: u32,
    pub unit: u8,
}

impl ConnectionTarget {
    /// A Modbus/TCP target.
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self::network(Method::Tcp, host, port)
    }

    /// A Modbus/UDP target.
    pub fn udp(host: impl Into<String>, port: u16) -> Self {
        Self::network(Method::Udp, host, port)
    }

    fn network(method: Method, host: impl Into<String>, port: u16) -> Self {
        Self {
            method,
            address: host.into(),
            port,
            rate: 0,
            unit: 0,
        }
    }

    /// A Modbus RTU target on a serial line.
    pub fn rtu(tty: impl Into<String>, rate: u32) -> Self {
        Self {
            method: Method::Rtu,
            address: tty.into(),
            port: 0,
            rate,
            unit: 0,
        }
    }

    /// Same target with a different unit address.
    pub fn with_unit(&self, unit: u8) -> Self {
        Self {
            unit,
            ..self.clone()
        }
    }

    /// Key used to share one serial line between callers.
    ///
    /// `/dev/ttyUSB0` and `ttyUSB0` name the same line.
    pub fn serial_key(&self) -> &str {
        self.address.rsplit('/').next().unwrap_or(&self.address)
    }

    /// Filesystem path of the serial device.
    pub fn device_path(&self) -> String {
        if self.address.contains('/') {
            self.address.clone()
        } else {
            format!("/dev/{}", self.address)
        }
    }
}

impl fmt::Display for ConnectionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let param = if self.method.is_serial() {
            self.rate
        } else {
            self.port as u32
        };
        write!(f, "{}:{}:{}", self.method, self.address, param)?;
        if self.unit > 0 {
            write!(f, ":{}", self.unit)?;
        }
        Ok(())
    }
}

impl FromStr for ConnectionTarget {
    type Err = TargetParseError;

    /// Parse `method:address:port_or_rate[:unit]`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() < 3 || parts.len() > 4 || parts[1].is_empty() {
            return Err(TargetParseError::Format(s.to_string()));
        }

        let method: Method = parts[0].parse()?;
        let param: u32 = parts[2]
            .parse()
            .map_err(|_| TargetParseError::Number(parts[2].to_string()))?;
        let unit: u8 = match parts.get(3) {
            Some(u) => u
                .parse()
                .map_err(|_| TargetParseError::Number(u.to_string()))?,
            None => 0,
        };

        let target = if method.is_serial() {
            ConnectionTarget::rtu(parts[1], param)
        } else {
            let port =
                u16::try_from(param).map_err(|_| TargetParseError::Number(parts[2].to_string()))?;
            ConnectionTarget::network(method, parts[1], port)
        };

        Ok(target.with_unit(unit))
    }
}
