//! Instance identity, network role and per-instance registration settings.

use std::fmt;

pub use nebula_config::{NetworkLod, TickingPolicy};

/// Identity of a predicted instance.
///
/// Negative ids are provisional: assigned by a client before the authority
/// confirms the instance, then remapped exactly once to a positive id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InstanceId(pub i32);

impl InstanceId {
    /// Whether this is a client-assigned placeholder id.
    pub fn is_provisional(self) -> bool {
        self.0 < 0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of a client connection on the authority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(pub u32);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Network role of an instance in this world.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum NetRole {
    /// Not networked; never ticked.
    #[default]
    None,
    /// This world owns the authoritative state.
    Authority,
    /// Owning client: predicts locally and sends input to the authority.
    AutonomousProxy,
    /// Observing client.
    SimulatedProxy,
}

/// Settings captured when an instance is registered or reconfigured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstanceConfig {
    /// Network role in this world.
    pub role: NetRole,
    /// On the authority: whether a remote client drives this instance.
    pub has_connection: bool,
    /// Ticking policy.
    pub policy: TickingPolicy,
    /// Presentation LOD used when this world is an observer.
    pub lod: NetworkLod,
    /// Opt into the fixed-tick smoothing service.
    pub smoothing: bool,
}

impl InstanceConfig {
    /// Config for an instance owned by this world with no remote controller.
    pub fn authority() -> Self {
        Self {
            role: NetRole::Authority,
            ..Self::default()
        }
    }

    /// Config for an instance owned by this world, driven by a remote client.
    pub fn authority_connected() -> Self {
        Self {
            role: NetRole::Authority,
            has_connection: true,
            ..Self::default()
        }
    }

    /// Config for the owning client's copy.
    pub fn autonomous_proxy() -> Self {
        Self {
            role: NetRole::AutonomousProxy,
            ..Self::default()
        }
    }

    /// Config for an observer's copy at the given LOD.
    pub fn simulated_proxy(lod: NetworkLod) -> Self {
        Self {
            role: NetRole::SimulatedProxy,
            lod,
            ..Self::default()
        }
    }

    pub fn with_policy(mut self, policy: TickingPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_smoothing(mut self, smoothing: bool) -> Self {
        self.smoothing = smoothing;
        self
    }
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            role: NetRole::None,
            has_connection: false,
            policy: TickingPolicy::Fixed,
            lod: NetworkLod::Interpolated,
            smoothing: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provisional_ids_are_negative() {
        assert!(InstanceId(-3).is_provisional());
        assert!(!InstanceId(0).is_provisional());
        assert!(!InstanceId(12).is_provisional());
    }

    #[test]
    fn test_config_builders() {
        let cfg = InstanceConfig::simulated_proxy(NetworkLod::ForwardPredict)
            .with_policy(TickingPolicy::Independent)
            .with_smoothing(true);
        assert_eq!(cfg.role, NetRole::SimulatedProxy);
        assert_eq!(cfg.lod, NetworkLod::ForwardPredict);
        assert_eq!(cfg.policy, TickingPolicy::Independent);
        assert!(cfg.smoothing);
        assert!(InstanceConfig::authority_connected().has_connection);
        assert!(!InstanceConfig::authority().has_connection);
    }
}
