//! Cluster resources backing CLUSTER-mode executors.

use core::fmt;
use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DomainError;
use crate::id::ResourceRowId;

/// Where a resource lives (region + group of clusters).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceLocation {
    pub region: String,
    pub group: String,
}

impl ResourceLocation {
    pub fn new(region: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            group: group.into(),
        }
    }
}

/// Composite identity of a cluster resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceId {
    pub location: ResourceLocation,
    pub namespace: String,
    pub name: String,
}

impl ResourceId {
    pub fn new(
        location: ResourceLocation,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Result<Self, DomainError> {
        let id = Self {
            location,
            namespace: namespace.into(),
            name: name.into(),
        };
        id.validate()?;
        Ok(id)
    }

    fn validate(&self) -> Result<(), DomainError> {
        let parts = [
            &self.location.region,
            &self.location.group,
            &self.namespace,
            &self.name,
        ];
        if parts.iter().any(|p| p.is_empty() || p.contains('/')) {
            return Err(DomainError::invalid_id(format!(
                "resource id segments must be non-empty and free of '/': {self}"
            )));
        }
        Ok(())
    }
}

/// `region/group/namespace/name`
impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.location.region, self.location.group, self.namespace, self.name
        )
    }
}

impl FromStr for ResourceId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('/');
        match (parts.next(), parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(region), Some(group), Some(namespace), Some(name), None) => {
                ResourceId::new(ResourceLocation::new(region, group), namespace, name)
            }
            _ => Err(DomainError::invalid_id(format!("resource id '{s}'"))),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResourceState {
    Creating,
    Available,
    Abandoned,
}

impl ResourceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceState::Creating => "CREATING",
            ResourceState::Available => "AVAILABLE",
            ResourceState::Abandoned => "ABANDONED",
        }
    }
}

impl fmt::Display for ResourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceState {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CREATING" => Ok(ResourceState::Creating),
            "AVAILABLE" => Ok(ResourceState::Available),
            "ABANDONED" => Ok(ResourceState::Abandoned),
            other => Err(DomainError::validation(format!("unknown resource state '{other}'"))),
        }
    }
}

/// A registry row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub row_id: ResourceRowId,
    pub resource_id: ResourceId,
    pub resource_type: String,
    pub status: ResourceState,
    pub endpoint: Option<String>,
    pub create_time: DateTime<Utc>,
}
