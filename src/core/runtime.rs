use uuid::Uuid;

use crate::utils::hash::hash64;

#[derive(
    Copy, Clone, Serialize, Deserialize, Debug, Eq, PartialEq, Hash, Default, Ord, PartialOrd,
)]
pub struct TaskId(pub u64);

impl std::ops::Deref for TaskId {
    type Target = u64;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(
    Copy, Clone, Serialize, Deserialize, Debug, Eq, PartialEq, Hash, Default, Ord, PartialOrd,
)]
pub struct JobId(pub u64);

impl std::ops::Deref for JobId {
    type Target = u64;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Label identifying tasks or resources the cost model treats as
/// interchangeable.
#[derive(
    Copy, Clone, Serialize, Deserialize, Debug, Eq, PartialEq, Hash, Default, Ord, PartialOrd,
)]
pub struct EquivClass(pub u64);

impl std::fmt::Display for EquivClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Flow-graph node handle.
#[derive(
    Copy, Clone, Serialize, Deserialize, Debug, Eq, PartialEq, Hash, Default, Ord, PartialOrd,
)]
pub struct NodeId(pub u64);

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Universally unique resource identifier with a deterministic 64-bit digest.
#[derive(Copy, Clone, Serialize, Deserialize, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ResourceId(pub Uuid);

impl ResourceId {
    pub fn generate() -> Self {
        ResourceId(Uuid::new_v4())
    }

    /// stable digest, usable as a map key across restarts and processes
    pub fn handle(&self) -> u64 {
        hash64(self.0.as_bytes())
    }
}

impl Default for ResourceId {
    fn default() -> Self {
        ResourceId(Uuid::nil())
    }
}

impl std::fmt::Display for ResourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for ResourceId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let uuid = Uuid::parse_str(s).map_err(|e| anyhow!("invalid resource id {}: {}", s, e))?;
        Ok(ResourceId(uuid))
    }
}

#[cfg(test)]
mod tests {
    use crate::core::runtime::ResourceId;

    #[test]
    pub fn resource_id_handle_test() {
        let res_id = ResourceId::generate();
        assert_eq!(res_id.handle(), res_id.handle());

        let other = ResourceId::generate();
        assert_ne!(res_id.handle(), other.handle());
    }

    #[test]
    pub fn resource_id_round_trip_test() {
        let res_id = ResourceId::generate();
        let parsed: ResourceId = res_id.to_string().parse().unwrap();
        assert_eq!(res_id, parsed);
    }
}
