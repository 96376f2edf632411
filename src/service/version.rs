//! Service names and versions.

use crate::error::NodeError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Dotted version. Fewer components act as a prefix pattern when requested,
/// so `1.0` fits `1.0.5`; no components fits any version.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceVersion {
    parts: Vec<u32>,
}

impl ServiceVersion {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn new(parts: &[u32]) -> Self {
        Self {
            parts: parts.to_vec(),
        }
    }

    pub fn is_any(&self) -> bool {
        self.parts.is_empty()
    }

    pub fn parts(&self) -> &[u32] {
        &self.parts
    }

    /// Whether an available version satisfies this requested one.
    pub fn fits(&self, available: &ServiceVersion) -> bool {
        available.parts.starts_with(&self.parts)
    }
}

impl FromStr for ServiceVersion {
    type Err = NodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() || s == "*" {
            return Ok(Self::any());
        }
        let parts = s
            .split('.')
            .map(|p| {
                p.parse::<u32>().map_err(|_| {
                    NodeError::InvalidArgument(format!("invalid version component '{}' in '{}'", p, s))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { parts })
    }
}

impl fmt::Display for ServiceVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.parts.is_empty() {
            return write!(f, "*");
        }
        let parts: Vec<String> = self.parts.iter().map(u32::to_string).collect();
        write!(f, "{}", parts.join("."))
    }
}

/// `name@version` identifier of a service
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceNameVersion {
    name: String,
    version: ServiceVersion,
}

impl ServiceNameVersion {
    pub fn new(name: &str, version: ServiceVersion) -> Self {
        Self {
            name: name.to_string(),
            version,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &ServiceVersion {
        &self.version
    }

    /// Whether `available` satisfies this request.
    pub fn fits(&self, available: &ServiceNameVersion) -> bool {
        self.name == available.name && self.version.fits(&available.version)
    }
}

impl FromStr for ServiceNameVersion {
    type Err = NodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, version) = match s.split_once('@') {
            Some((name, version)) => (name.trim(), version.parse()?),
            None => (s.trim(), ServiceVersion::any()),
        };
        if name.is_empty() {
            return Err(NodeError::InvalidArgument(format!(
                "service identifier '{}' has no name",
                s
            )));
        }
        Ok(Self::new(name, version))
    }
}

impl fmt::Display for ServiceNameVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.version.is_any() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}@{}", self.name, self.version)
        }
    }
}
