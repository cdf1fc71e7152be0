//! Addressing of the executor that runs a job.

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::DomainError;
use crate::resource::ResourceId;
use crate::status::RunMode;

const PROCESS_SCHEME: &str = "process://";
const CLUSTER_SCHEME: &str = "cluster://";

/// Opaque string identifying a dispatched executor.
///
/// Persisted in its `Display` form:
/// - `process://{host}:{port}/{pid}/{name}`
/// - `cluster://{region}/{group}/{namespace}/{name}`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ExecutorIdentifier {
    Process {
        host: String,
        port: u16,
        pid: u32,
        name: String,
    },
    Cluster(ResourceId),
}

impl ExecutorIdentifier {
    pub fn run_mode(&self) -> RunMode {
        match self {
            ExecutorIdentifier::Process { .. } => RunMode::Process,
            ExecutorIdentifier::Cluster(_) => RunMode::Cluster,
        }
    }

    /// Endpoint derivable from the identifier alone (process executors only).
    pub fn static_endpoint(&self) -> Option<String> {
        match self {
            ExecutorIdentifier::Process { host, port, .. } => Some(format!("http://{host}:{port}")),
            ExecutorIdentifier::Cluster(_) => None,
        }
    }

    fn parse_process(rest: &str) -> Result<Self, DomainError> {
        let bad = || DomainError::invalid_id(format!("process executor '{rest}'"));
        let mut parts = rest.splitn(3, '/');
        let authority = parts.next().ok_or_else(bad)?;
        let pid = parts.next().ok_or_else(bad)?;
        let name = parts.next().ok_or_else(bad)?;
        let (host, port) = authority.rsplit_once(':').ok_or_else(bad)?;
        if host.is_empty() || name.is_empty() {
            return Err(bad());
        }
        Ok(ExecutorIdentifier::Process {
            host: host.to_string(),
            port: port.parse().map_err(|_| bad())?,
            pid: pid.parse().map_err(|_| bad())?,
            name: name.to_string(),
        })
    }
}

impl fmt::Display for ExecutorIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutorIdentifier::Process {
                host,
                port,
                pid,
                name,
            } => write!(f, "{PROCESS_SCHEME}{host}:{port}/{pid}/{name}"),
            ExecutorIdentifier::Cluster(id) => write!(f, "{CLUSTER_SCHEME}{id}"),
        }
    }
}

impl FromStr for ExecutorIdentifier {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(rest) = s.strip_prefix(PROCESS_SCHEME) {
            Self::parse_process(rest)
        } else if let Some(rest) = s.strip_prefix(CLUSTER_SCHEME) {
            Ok(ExecutorIdentifier::Cluster(rest.parse()?))
        } else {
            Err(DomainError::invalid_id(format!("executor identifier '{s}'")))
        }
    }
}

impl TryFrom<String> for ExecutorIdentifier {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ExecutorIdentifier> for String {
    fn from(value: ExecutorIdentifier) -> Self {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::ResourceLocation;

    #[test]
    fn process_identifier_parses() {
        let id: ExecutorIdentifier = "process://worker-1:41234/9001/taskfleet-7".parse().unwrap();
        assert_eq!(
            id,
            ExecutorIdentifier::Process {
                host: "worker-1".into(),
                port: 41234,
                pid: 9001,
                name: "taskfleet-7".into(),
            }
        );
        assert_eq!(id.run_mode(), RunMode::Process);
        assert_eq!(id.static_endpoint().as_deref(), Some("http://worker-1:41234"));
        assert_eq!(id.to_string(), "process://worker-1:41234/9001/taskfleet-7");
    }

    #[test]
    fn cluster_identifier_parses() {
        let id: ExecutorIdentifier = "cluster://eu/batch/jobs/job-7".parse().unwrap();
        let expected = ResourceId::new(ResourceLocation::new("eu", "batch"), "jobs", "job-7").unwrap();
        assert_eq!(id, ExecutorIdentifier::Cluster(expected));
        assert_eq!(id.run_mode(), RunMode::Cluster);
        assert_eq!(id.static_endpoint(), None);
    }

    #[test]
    fn malformed_identifiers_are_rejected() {
        for raw in [
            "",
            "ftp://x",
            "process://host/1/name",
            "process://host:notaport/1/name",
            "process://host:80/pid/name",
            "cluster://eu/batch/jobs",
        ] {
            assert!(raw.parse::<ExecutorIdentifier>().is_err(), "{raw}");
        }
    }

    #[test]
    fn serializes_as_string() {
        let id: ExecutorIdentifier = "cluster://eu/batch/jobs/job-7".parse().unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, r#""cluster://eu/batch/jobs/job-7""#);
        assert_eq!(serde_json::from_str::<ExecutorIdentifier>(&json).unwrap(), id);
    }
}
