//! Tunnel destination

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Errors produced when parsing a destination from its textual form
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DestinationParseError {
    #[error("Invalid destination '{0}': expected project/zone/instance:port")]
    Malformed(String),

    #[error("Invalid remote port in destination '{0}'")]
    InvalidPort(String),
}

/// A VM instance and remote port that a tunnel forwards to.
///
/// Destinations are plain values: two destinations are equal iff project,
/// zone, instance name and remote port all match. They are used as the key
/// of the tunnel registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Destination {
    pub project_id: String,
    pub zone: String,
    pub instance_name: String,
    pub remote_port: u16,
}

impl Destination {
    pub fn new(
        project_id: impl Into<String>,
        zone: impl Into<String>,
        instance_name: impl Into<String>,
        remote_port: u16,
    ) -> Self {
        Self {
            project_id: project_id.into(),
            zone: zone.into(),
            instance_name: instance_name.into(),
            remote_port,
        }
    }

    /// Internal DNS name of the instance (zonal DNS)
    pub fn zonal_dns_name(&self) -> String {
        format!(
            "{}.{}.c.{}.internal",
            self.instance_name, self.zone, self.project_id
        )
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}:{}",
            self.project_id, self.zone, self.instance_name, self.remote_port
        )
    }
}

impl FromStr for Destination {
    type Err = DestinationParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (path, port) = s
            .rsplit_once(':')
            .ok_or_else(|| DestinationParseError::Malformed(s.to_string()))?;

        let remote_port = port
            .parse::<u16>()
            .map_err(|_| DestinationParseError::InvalidPort(s.to_string()))?;

        let parts: Vec<&str> = path.split('/').collect();
        match parts.as_slice() {
            [project, zone, instance]
                if !project.is_empty() && !zone.is_empty() && !instance.is_empty() =>
            {
                Ok(Destination::new(*project, *zone, *instance, remote_port))
            }
            _ => Err(DestinationParseError::Malformed(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_structural_equality() {
        let a = Destination::new("proj-1", "us-central1-a", "vm-1", 3389);
        let b = Destination::new("proj-1".to_string(), "us-central1-a", "vm-1", 3389);
        let c = Destination::new("proj-1", "us-central1-a", "vm-1", 22);

        assert_eq!(a, b);
        assert_ne!(a, c);

        let mut set = HashSet::new();
        set.insert(a.clone());
        set.insert(b);
        set.insert(c);
        assert_eq!(set.len(), 2);
        assert!(set.contains(&a));
    }

    #[test]
    fn test_display_and_parse() {
        let destination = Destination::new("proj-1", "us-central1-a", "vm-1", 3389);
        assert_eq!(destination.to_string(), "proj-1/us-central1-a/vm-1:3389");

        let parsed: Destination = "proj-1/us-central1-a/vm-1:3389".parse().unwrap();
        assert_eq!(parsed, destination);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(matches!(
            "vm-1:22".parse::<Destination>(),
            Err(DestinationParseError::Malformed(_))
        ));
        assert!(matches!(
            "p/z/vm-1".parse::<Destination>(),
            Err(DestinationParseError::Malformed(_))
        ));
        assert!(matches!(
            "p/z/vm-1:99999".parse::<Destination>(),
            Err(DestinationParseError::InvalidPort(_))
        ));
        assert!(matches!(
            "p//vm-1:22".parse::<Destination>(),
            Err(DestinationParseError::Malformed(_))
        ));
    }

    #[test]
    fn test_zonal_dns_name() {
        let destination = Destination::new("proj-1", "us-central1-a", "vm-1", 22);
        assert_eq!(
            destination.zonal_dns_name(),
            "vm-1.us-central1-a.c.proj-1.internal"
        );
    }
}
