//! Membership of instances whose input is sent to the authority.
//!
//! The send itself is host-driven (input batches for fixed ticking,
//! per-instance payloads for independent ticking); this service only tracks
//! which instances take part.

use std::collections::BTreeSet;

use crate::instance::InstanceId;
use crate::services::ServiceMembers;

#[derive(Debug, Clone, Default)]
pub struct ServerRpcMembers {
    members: BTreeSet<InstanceId>,
}

impl ServiceMembers for ServerRpcMembers {
    fn register(&mut self, id: InstanceId) {
        self.members.insert(id);
    }

    fn unregister(&mut self, id: InstanceId) {
        self.members.remove(&id);
    }

    fn members(&self) -> &BTreeSet<InstanceId> {
        &self.members
    }
}
