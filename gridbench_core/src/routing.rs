//! Hop-by-hop routing through the component hierarchy.
//!
//! ```text
//!   destination deeper than me, inside my subtree  -> Children(..)
//!   destination is me (wildcards allowed)          -> Local
//!   anything else                                  -> Parent
//! ```

use gridbench_env::{AddressLevel, ResponseType, SimulatorAddress};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoutingError {
    #[error("{local} has no parent to forward {destination} to")]
    NoParent {
        local: SimulatorAddress,
        destination: SimulatorAddress,
    },
}

/// Which children a message is forwarded to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildSelector {
    All,
    One(u32),
}

impl ChildSelector {
    pub fn matches(self, index: u32) -> bool {
        match self {
            ChildSelector::All => true,
            ChildSelector::One(n) => n == index,
        }
    }
}

/// Where a message goes next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextHop {
    /// Execute in this process
    Local,
    /// Forward to the matching child processes
    Children(ChildSelector),
    /// Forward towards the coordinator
    Parent,
}

/// Computes the next hop for `destination` as seen from `local`.
pub fn next_hop(
    local: SimulatorAddress,
    destination: SimulatorAddress,
) -> Result<NextHop, RoutingError> {
    let in_subtree = destination
        .ancestor_at(local.level())
        .map(|ancestor| ancestor.covers(&local))
        .unwrap_or(false);

    if in_subtree {
        if destination.level() == local.level() {
            return Ok(NextHop::Local);
        }
        if let Some(child_level) = local.level().child() {
            let index = destination.index_at(child_level).unwrap_or(0);
            let selector = if index == 0 {
                ChildSelector::All
            } else {
                ChildSelector::One(index)
            };
            return Ok(NextHop::Children(selector));
        }
    }

    if local.level() == AddressLevel::Coordinator {
        return Err(RoutingError::NoParent { local, destination });
    }
    Ok(NextHop::Parent)
}

/// Response type reported when no component exists at `level`.
pub fn not_found(level: AddressLevel) -> ResponseType {
    match level {
        AddressLevel::Coordinator => ResponseType::FailureCoordinatorNotFound,
        AddressLevel::Agent => ResponseType::FailureAgentNotFound,
        AddressLevel::Worker => ResponseType::FailureWorkerNotFound,
        AddressLevel::Test => ResponseType::FailureTestNotFound,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coordinator_forwards_down() {
        let c = SimulatorAddress::coordinator();
        assert_eq!(next_hop(c, c), Ok(NextHop::Local));
        assert_eq!(
            next_hop(c, SimulatorAddress::worker(2, 1)),
            Ok(NextHop::Children(ChildSelector::One(2)))
        );
        assert_eq!(
            next_hop(c, SimulatorAddress::test(0, 0, 4)),
            Ok(NextHop::Children(ChildSelector::All))
        );
    }

    #[test]
    fn test_agent_routes() {
        let agent = SimulatorAddress::agent(2);
        assert_eq!(next_hop(agent, SimulatorAddress::agent(2)), Ok(NextHop::Local));
        assert_eq!(next_hop(agent, SimulatorAddress::ALL_AGENTS), Ok(NextHop::Local));
        assert_eq!(
            next_hop(agent, SimulatorAddress::worker(2, 3)),
            Ok(NextHop::Children(ChildSelector::One(3)))
        );
        assert_eq!(
            next_hop(agent, SimulatorAddress::test(0, 0, 1)),
            Ok(NextHop::Children(ChildSelector::All))
        );
        assert_eq!(next_hop(agent, SimulatorAddress::coordinator()), Ok(NextHop::Parent));
        assert_eq!(next_hop(agent, SimulatorAddress::worker(3, 1)), Ok(NextHop::Parent));
    }

    #[test]
    fn test_worker_routes() {
        let worker = SimulatorAddress::worker(1, 2);
        assert_eq!(next_hop(worker, SimulatorAddress::worker(0, 0)), Ok(NextHop::Local));
        assert_eq!(
            next_hop(worker, SimulatorAddress::test(1, 2, 5)),
            Ok(NextHop::Children(ChildSelector::One(5)))
        );
        assert_eq!(next_hop(worker, SimulatorAddress::worker(1, 3)), Ok(NextHop::Parent));
    }

    #[test]
    fn test_not_found_mapping() {
        assert_eq!(not_found(AddressLevel::Agent), ResponseType::FailureAgentNotFound);
        assert_eq!(not_found(AddressLevel::Test), ResponseType::FailureTestNotFound);
    }
}
