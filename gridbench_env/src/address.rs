//! Hierarchical addressing for Coordinator, Agent, Worker and Test endpoints.
//!
//! Every endpoint in a benchmark run is identified by a [`SimulatorAddress`]:
//!
//! ```text
//! C                 coordinator
//! └── A1            agent 1
//!     └── A1_W2     worker 2 on agent 1
//!         └── A1_W2_T3   test 3 hosted by that worker
//! ```
//!
//! An index of `0` (rendered `*`) is a wildcard at its level, so `A*_W*_T1`
//! addresses test 1 on every worker of every agent.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Raised when an address string cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Malformed address '{input}': {reason}")]
pub struct FormatError {
    /// The offending text
    pub input: String,

    /// What was wrong with it
    pub reason: String,
}

impl FormatError {
    fn new(input: &str, reason: impl Into<String>) -> Self {
        Self {
            input: input.to_string(),
            reason: reason.into(),
        }
    }
}

/// Depth of an address in the hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AddressLevel {
    Coordinator,
    Agent,
    Worker,
    Test,
}

impl AddressLevel {
    /// Returns the level one step deeper, if any.
    pub fn child(self) -> Option<AddressLevel> {
        match self {
            AddressLevel::Coordinator => Some(AddressLevel::Agent),
            AddressLevel::Agent => Some(AddressLevel::Worker),
            AddressLevel::Worker => Some(AddressLevel::Test),
            AddressLevel::Test => None,
        }
    }

    /// Returns the level one step shallower, if any.
    pub fn parent(self) -> Option<AddressLevel> {
        match self {
            AddressLevel::Coordinator => None,
            AddressLevel::Agent => Some(AddressLevel::Coordinator),
            AddressLevel::Worker => Some(AddressLevel::Agent),
            AddressLevel::Test => Some(AddressLevel::Worker),
        }
    }

    /// Returns a human readable name.
    pub fn name(self) -> &'static str {
        match self {
            AddressLevel::Coordinator => "Coordinator",
            AddressLevel::Agent => "Agent",
            AddressLevel::Worker => "Worker",
            AddressLevel::Test => "Test",
        }
    }
}

impl fmt::Display for AddressLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Immutable hierarchical address.
///
/// Invariant: every index deeper than `level` is zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SimulatorAddress {
    level: AddressLevel,
    agent_index: u32,
    worker_index: u32,
    test_index: u32,
}

impl SimulatorAddress {
    /// Broadcast address for all agents.
    pub const ALL_AGENTS: SimulatorAddress = SimulatorAddress::agent(0);

    /// Broadcast address for all workers of all agents.
    pub const ALL_WORKERS: SimulatorAddress = SimulatorAddress::worker(0, 0);

    /// Creates an address, validating the level invariant.
    pub fn new(
        level: AddressLevel,
        agent_index: u32,
        worker_index: u32,
        test_index: u32,
    ) -> Result<Self, FormatError> {
        let address = Self {
            level,
            agent_index,
            worker_index,
            test_index,
        };
        let deeper_populated = match level {
            AddressLevel::Coordinator => agent_index != 0 || worker_index != 0 || test_index != 0,
            AddressLevel::Agent => worker_index != 0 || test_index != 0,
            AddressLevel::Worker => test_index != 0,
            AddressLevel::Test => false,
        };
        if deeper_populated {
            return Err(FormatError::new(
                &format!("{:?}({}, {}, {})", level, agent_index, worker_index, test_index),
                format!("indices below the {} level must be zero", level),
            ));
        }
        Ok(address)
    }

    /// The coordinator address.
    pub const fn coordinator() -> Self {
        Self {
            level: AddressLevel::Coordinator,
            agent_index: 0,
            worker_index: 0,
            test_index: 0,
        }
    }

    /// An agent address.
    pub const fn agent(agent_index: u32) -> Self {
        Self {
            level: AddressLevel::Agent,
            agent_index,
            worker_index: 0,
            test_index: 0,
        }
    }

    /// A worker address.
    pub const fn worker(agent_index: u32, worker_index: u32) -> Self {
        Self {
            level: AddressLevel::Worker,
            agent_index,
            worker_index,
            test_index: 0,
        }
    }

    /// A test address.
    pub const fn test(agent_index: u32, worker_index: u32, test_index: u32) -> Self {
        Self {
            level: AddressLevel::Test,
            agent_index,
            worker_index,
            test_index,
        }
    }

    pub fn level(&self) -> AddressLevel {
        self.level
    }

    pub fn agent_index(&self) -> u32 {
        self.agent_index
    }

    pub fn worker_index(&self) -> u32 {
        self.worker_index
    }

    pub fn test_index(&self) -> u32 {
        self.test_index
    }

    /// Returns the index stored at `level`, or `None` if that level is
    /// deeper than this address or is the coordinator level.
    pub fn index_at(&self, level: AddressLevel) -> Option<u32> {
        if level > self.level {
            return None;
        }
        match level {
            AddressLevel::Coordinator => None,
            AddressLevel::Agent => Some(self.agent_index),
            AddressLevel::Worker => Some(self.worker_index),
            AddressLevel::Test => Some(self.test_index),
        }
    }

    /// Returns the parent address (the last populated level zeroed out).
    pub fn parent(&self) -> Option<SimulatorAddress> {
        match self.level {
            AddressLevel::Coordinator => None,
            AddressLevel::Agent => Some(Self::coordinator()),
            AddressLevel::Worker => Some(Self::agent(self.agent_index)),
            AddressLevel::Test => Some(Self::worker(self.agent_index, self.worker_index)),
        }
    }

    /// Returns the ancestor (or self) at the given level.
    pub fn ancestor_at(&self, level: AddressLevel) -> Option<SimulatorAddress> {
        let mut current = *self;
        while current.level > level {
            current = current.parent()?;
        }
        (current.level == level).then_some(current)
    }

    /// Creates the child address with the given index.
    pub fn child(&self, index: u32) -> Option<SimulatorAddress> {
        match self.level {
            AddressLevel::Coordinator => Some(Self::agent(index)),
            AddressLevel::Agent => Some(Self::worker(self.agent_index, index)),
            AddressLevel::Worker => Some(Self::test(self.agent_index, self.worker_index, index)),
            AddressLevel::Test => None,
        }
    }

    /// True if any populated index is a wildcard.
    pub fn is_wildcard(&self) -> bool {
        [AddressLevel::Agent, AddressLevel::Worker, AddressLevel::Test]
            .into_iter()
            .filter_map(|level| self.index_at(level))
            .any(|index| index == 0)
    }

    /// True if `other` lies at or below this address, honouring wildcards
    /// on this side.
    ///
    /// `A*_W1` covers `A3_W1` and `A3_W1_T7`, but not `A3_W2`.
    pub fn covers(&self, other: &SimulatorAddress) -> bool {
        if other.level < self.level {
            return false;
        }
        [AddressLevel::Agent, AddressLevel::Worker, AddressLevel::Test]
            .into_iter()
            .filter(|level| *level <= self.level)
            .all(|level| {
                let mine = self.index_at(level).unwrap_or(0);
                mine == 0 || Some(mine) == other.index_at(level)
            })
    }
}

fn write_index(f: &mut fmt::Formatter<'_>, prefix: char, index: u32) -> fmt::Result {
    if index == 0 {
        write!(f, "{}*", prefix)
    } else {
        write!(f, "{}{}", prefix, index)
    }
}

impl fmt::Display for SimulatorAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.level == AddressLevel::Coordinator {
            return write!(f, "C");
        }
        write_index(f, 'A', self.agent_index)?;
        if self.level >= AddressLevel::Worker {
            write!(f, "_")?;
            write_index(f, 'W', self.worker_index)?;
        }
        if self.level == AddressLevel::Test {
            write!(f, "_")?;
            write_index(f, 'T', self.test_index)?;
        }
        Ok(())
    }
}

fn parse_index(input: &str, token: &str, prefix: char) -> Result<u32, FormatError> {
    let rest = token
        .strip_prefix(prefix)
        .ok_or_else(|| FormatError::new(input, format!("expected '{}<n>' but found '{}'", prefix, token)))?;
    if rest == "*" {
        return Ok(0);
    }
    if rest.is_empty() || !rest.bytes().all(|b| b.is_ascii_digit()) {
        return Err(FormatError::new(
            input,
            format!("'{}' does not carry a numeric index", token),
        ));
    }
    rest.parse::<u32>()
        .map_err(|e| FormatError::new(input, format!("index in '{}' is out of range: {}", token, e)))
}

impl FromStr for SimulatorAddress {
    type Err = FormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(FormatError::new(s, "address is empty"));
        }
        if trimmed == "C" {
            return Ok(Self::coordinator());
        }
        let body = trimmed.strip_prefix("C_").unwrap_or(trimmed);
        let tokens: Vec<&str> = body.split('_').collect();
        if tokens.len() > 3 {
            return Err(FormatError::new(s, "too many levels"));
        }

        let agent = parse_index(s, tokens[0], 'A')?;
        match tokens.len() {
            1 => Ok(Self::agent(agent)),
            2 => Ok(Self::worker(agent, parse_index(s, tokens[1], 'W')?)),
            _ => Ok(Self::test(
                agent,
                parse_index(s, tokens[1], 'W')?,
                parse_index(s, tokens[2], 'T')?,
            )),
        }
    }
}

impl TryFrom<String> for SimulatorAddress {
    type Error = FormatError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SimulatorAddress> for String {
    fn from(address: SimulatorAddress) -> Self {
        address.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_format_levels() {
        assert_eq!(SimulatorAddress::coordinator().to_string(), "C");
        assert_eq!(SimulatorAddress::agent(3).to_string(), "A3");
        assert_eq!(SimulatorAddress::worker(3, 1).to_string(), "A3_W1");
        assert_eq!(SimulatorAddress::test(3, 1, 9).to_string(), "A3_W1_T9");
        assert_eq!(SimulatorAddress::test(0, 0, 2).to_string(), "A*_W*_T2");
    }

    #[test]
    fn test_parse_accepts_coordinator_prefix() {
        let address: SimulatorAddress = "C_A2_W5".parse().unwrap();
        assert_eq!(address, SimulatorAddress::worker(2, 5));
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for input in ["", "X1", "A1_T2", "A1_W", "A1_Wx", "A1_W1_T1_Q1", "W1", "A-1"] {
            assert!(input.parse::<SimulatorAddress>().is_err(), "'{}' should fail", input);
        }
    }

    #[test]
    fn test_parent_and_child() {
        let test = SimulatorAddress::test(1, 2, 3);
        assert_eq!(test.parent(), Some(SimulatorAddress::worker(1, 2)));
        assert_eq!(test.parent().and_then(|w| w.parent()), Some(SimulatorAddress::agent(1)));
        assert_eq!(SimulatorAddress::coordinator().parent(), None);
        assert_eq!(SimulatorAddress::agent(1).child(2), Some(SimulatorAddress::worker(1, 2)));
        assert_eq!(test.child(1), None);
        assert_eq!(test.ancestor_at(AddressLevel::Agent), Some(SimulatorAddress::agent(1)));
    }

    #[test]
    fn test_new_enforces_invariant() {
        assert!(SimulatorAddress::new(AddressLevel::Agent, 1, 2, 0).is_err());
        assert!(SimulatorAddress::new(AddressLevel::Coordinator, 1, 0, 0).is_err());
        assert!(SimulatorAddress::new(AddressLevel::Worker, 1, 2, 0).is_ok());
    }

    #[test]
    fn test_covers_with_wildcards() {
        let all_test_one = SimulatorAddress::test(0, 0, 1);
        assert!(all_test_one.covers(&SimulatorAddress::test(4, 2, 1)));
        assert!(!all_test_one.covers(&SimulatorAddress::test(4, 2, 2)));
        assert!(SimulatorAddress::ALL_WORKERS.covers(&SimulatorAddress::worker(7, 7)));
        assert!(!SimulatorAddress::worker(1, 1).covers(&SimulatorAddress::worker(1, 2)));
        assert!(SimulatorAddress::coordinator().covers(&SimulatorAddress::agent(1)));
        assert!(!SimulatorAddress::agent(1).covers(&SimulatorAddress::coordinator()));
    }

    #[test]
    fn test_serde_uses_text_form() {
        let json = serde_json::to_string(&SimulatorAddress::worker(1, 2)).unwrap();
        assert_eq!(json, "\"A1_W2\"");
        let back: SimulatorAddress = serde_json::from_str(&json).unwrap();
        assert_eq!(back, SimulatorAddress::worker(1, 2));
    }

    fn arb_address() -> impl Strategy<Value = SimulatorAddress> {
        prop_oneof![
            Just(SimulatorAddress::coordinator()),
            any::<u32>().prop_map(SimulatorAddress::agent),
            (any::<u32>(), any::<u32>()).prop_map(|(a, w)| SimulatorAddress::worker(a, w)),
            (any::<u32>(), any::<u32>(), any::<u32>())
                .prop_map(|(a, w, t)| SimulatorAddress::test(a, w, t)),
        ]
    }

    proptest! {
        #[test]
        fn test_parse_round_trip(address in arb_address()) {
            let text = address.to_string();
            let parsed: SimulatorAddress = text.parse().unwrap();
            prop_assert_eq!(parsed, address);
        }
    }
}
