//! Target expressions: choosing which components receive a message.
//!
//! An expression is a comma separated list of `Level=mode` selectors in the
//! order `Agent`, `Worker`, `Test`. Leading levels may be omitted and are
//! then treated as `*`.
//!
//! | mode | meaning |
//! |------|---------|
//! | `*`  | every live component at that level |
//! | `R`  | one live component, chosen uniformly at random |
//! | `O`  | the oldest live component |
//! | `n`  | the component with index `n` |
//!
//! At the `Worker` level a trailing `m` (`*m`, `Rm`, `Om`) restricts the
//! choice to member workers. Each level selects among the children of the
//! components chosen by the level before, so `Agent=R,Worker=*` reaches every
//! worker of one random agent.

use crate::registry::ComponentRegistry;
use gridbench_env::{AddressLevel, SimulatorAddress};
use rand::seq::SliceRandom;
use rand::Rng;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TargetError {
    #[error("Invalid target token '{token}': {reason}")]
    Parse { token: String, reason: String },

    #[error("Target '{expression}' matched no live component at the {level} level")]
    NoTargets {
        expression: String,
        level: AddressLevel,
    },
}

impl TargetError {
    fn parse(token: &str, reason: impl Into<String>) -> Self {
        TargetError::Parse {
            token: token.to_string(),
            reason: reason.into(),
        }
    }
}

/// How one level chooses among its candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectorMode {
    All,
    Random,
    Oldest,
    Index(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LevelSelector {
    pub mode: SelectorMode,

    /// Only consider member workers (worker level only)
    pub members_only: bool,
}

impl LevelSelector {
    pub const ALL: LevelSelector = LevelSelector {
        mode: SelectorMode::All,
        members_only: false,
    };

    pub fn new(mode: SelectorMode) -> Self {
        Self {
            mode,
            members_only: false,
        }
    }

    pub fn members(mode: SelectorMode) -> Self {
        Self {
            mode,
            members_only: true,
        }
    }
}

impl fmt::Display for LevelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.mode {
            SelectorMode::All => write!(f, "*")?,
            SelectorMode::Random => write!(f, "R")?,
            SelectorMode::Oldest => write!(f, "O")?,
            SelectorMode::Index(n) => write!(f, "{}", n)?,
        }
        if self.members_only {
            write!(f, "m")?;
        }
        Ok(())
    }
}

/// A parsed target expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetExpression {
    agent: LevelSelector,
    worker: Option<LevelSelector>,
    test: Option<LevelSelector>,
}

/// A candidate at some level together with its age.
#[derive(Debug, Clone, Copy)]
struct Candidate {
    address: SimulatorAddress,
    sequence: u64,
}

impl TargetExpression {
    /// Every agent.
    pub fn all_agents() -> Self {
        Self {
            agent: LevelSelector::ALL,
            worker: None,
            test: None,
        }
    }

    /// Every worker of every agent.
    pub fn all_workers() -> Self {
        Self::all_agents().with_worker(LevelSelector::ALL)
    }

    pub fn with_agent(mut self, selector: LevelSelector) -> Self {
        self.agent = selector;
        self
    }

    pub fn with_worker(mut self, selector: LevelSelector) -> Self {
        self.worker = Some(selector);
        self
    }

    /// Adds a test level; implies `Worker=*` if no worker level is set.
    pub fn with_test(mut self, selector: LevelSelector) -> Self {
        if self.worker.is_none() {
            self.worker = Some(LevelSelector::ALL);
        }
        self.test = Some(selector);
        self
    }

    /// Deepest level this expression addresses.
    pub fn level(&self) -> AddressLevel {
        if self.test.is_some() {
            AddressLevel::Test
        } else if self.worker.is_some() {
            AddressLevel::Worker
        } else {
            AddressLevel::Agent
        }
    }

    /// Resolves the expression against the live components of `registry`.
    ///
    /// Returns the concrete addresses, sorted and without duplicates, or
    /// [`TargetError::NoTargets`] if some level has nothing to choose from.
    pub fn resolve<R: Rng + ?Sized>(
        &self,
        registry: &ComponentRegistry,
        rng: &mut R,
    ) -> Result<Vec<SimulatorAddress>, TargetError> {
        let agents: Vec<Candidate> = registry
            .agents()
            .iter()
            .map(|a| Candidate {
                address: a.address,
                sequence: a.agent_index() as u64,
            })
            .collect();
        let mut selected = self.select(AddressLevel::Agent, self.agent, agents, rng)?;

        if let Some(selector) = self.worker {
            let workers: Vec<Candidate> = registry
                .workers()
                .iter()
                .filter(|w| !selector.members_only || w.is_member())
                .filter(|w| selected.iter().any(|a| a.covers(&w.address)))
                .map(|w| Candidate {
                    address: w.address,
                    sequence: w.sequence,
                })
                .collect();
            selected = self.select(AddressLevel::Worker, selector, workers, rng)?;
        }

        if let Some(selector) = self.test {
            let tests: Vec<Candidate> = selected
                .iter()
                .flat_map(|worker| {
                    registry.tests().iter().map(move |t| Candidate {
                        address: SimulatorAddress::test(
                            worker.agent_index(),
                            worker.worker_index(),
                            t.test_index,
                        ),
                        sequence: t.test_index as u64,
                    })
                })
                .collect();
            selected = self.select(AddressLevel::Test, selector, tests, rng)?;
        }

        selected.sort();
        selected.dedup();
        Ok(selected)
    }

    fn select<R: Rng + ?Sized>(
        &self,
        level: AddressLevel,
        selector: LevelSelector,
        candidates: Vec<Candidate>,
        rng: &mut R,
    ) -> Result<Vec<SimulatorAddress>, TargetError> {
        let chosen: Vec<SimulatorAddress> = match selector.mode {
            SelectorMode::All => candidates.iter().map(|c| c.address).collect(),
            SelectorMode::Random => candidates.choose(rng).map(|c| c.address).into_iter().collect(),
            SelectorMode::Oldest => candidates
                .iter()
                .min_by_key(|c| c.sequence)
                .map(|c| c.address)
                .into_iter()
                .collect(),
            SelectorMode::Index(n) => candidates
                .iter()
                .filter(|c| c.address.index_at(level) == Some(n))
                .map(|c| c.address)
                .collect(),
        };
        if chosen.is_empty() {
            return Err(TargetError::NoTargets {
                expression: self.to_string(),
                level,
            });
        }
        Ok(chosen)
    }
}

impl fmt::Display for TargetExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Agent={}", self.agent)?;
        if let Some(worker) = self.worker {
            write!(f, ",Worker={}", worker)?;
        }
        if let Some(test) = self.test {
            write!(f, ",Test={}", test)?;
        }
        Ok(())
    }
}

fn parse_level(name: &str, token: &str) -> Result<AddressLevel, TargetError> {
    match name.trim().to_ascii_lowercase().as_str() {
        "agent" => Ok(AddressLevel::Agent),
        "worker" => Ok(AddressLevel::Worker),
        "test" => Ok(AddressLevel::Test),
        _ => Err(TargetError::parse(token, format!("unknown level '{}'", name.trim()))),
    }
}

fn parse_selector(level: AddressLevel, value: &str, token: &str) -> Result<LevelSelector, TargetError> {
    let value = value.trim();
    let (body, members_only) = match value.strip_suffix('m') {
        Some(body) => (body, true),
        None => (value, false),
    };
    if members_only && level != AddressLevel::Worker {
        return Err(TargetError::parse(token, "the 'm' suffix is only valid on the Worker level"));
    }
    let mode = match body {
        "*" => SelectorMode::All,
        "R" => SelectorMode::Random,
        "O" => SelectorMode::Oldest,
        "" => return Err(TargetError::parse(token, "missing mode")),
        digits if digits.bytes().all(|b| b.is_ascii_digit()) => {
            if members_only {
                return Err(TargetError::parse(token, "the 'm' suffix cannot follow an index"));
            }
            match digits.parse::<u32>() {
                Ok(0) | Err(_) => {
                    return Err(TargetError::parse(token, "index must be a positive number"))
                }
                Ok(n) => SelectorMode::Index(n),
            }
        }
        other => return Err(TargetError::parse(token, format!("unknown mode '{}'", other))),
    };
    Ok(LevelSelector { mode, members_only })
}

impl FromStr for TargetExpression {
    type Err = TargetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().is_empty() {
            return Err(TargetError::parse(s, "expression is empty"));
        }

        let mut selectors: Vec<(AddressLevel, LevelSelector)> = Vec::new();
        for token in s.split(',') {
            let (name, value) = token
                .split_once('=')
                .ok_or_else(|| TargetError::parse(token, "expected Level=mode"))?;
            let level = parse_level(name, token)?;
            if let Some((previous, _)) = selectors.last() {
                if level.parent() != Some(*previous) {
                    return Err(TargetError::parse(
                        token,
                        format!("{} cannot follow {}", level, previous),
                    ));
                }
            }
            selectors.push((level, parse_selector(level, value, token)?));
        }

        let mut expression = TargetExpression::all_agents();
        for (level, selector) in selectors {
            match level {
                AddressLevel::Agent => expression.agent = selector,
                AddressLevel::Worker => expression.worker = Some(selector),
                AddressLevel::Test => {
                    if expression.worker.is_none() {
                        expression.worker = Some(LevelSelector::ALL);
                    }
                    expression.test = Some(selector)
                }
                AddressLevel::Coordinator => {}
            }
        }
        Ok(expression)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launcher::{WorkerProcessSettings, WorkerType};
    use crate::test_case::TestCase;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn registry(agents: u32, workers_per_agent: u32) -> ComponentRegistry {
        let mut registry = ComponentRegistry::new();
        for _ in 0..agents {
            let agent = registry.add_agent("pub", "priv");
            for w in 0..workers_per_agent {
                let address = registry.next_worker_address(&agent).unwrap();
                let worker_type = if w == 0 { WorkerType::Member } else { WorkerType::Client };
                registry
                    .add_worker(address, WorkerProcessSettings::new(address.worker_index(), worker_type))
                    .unwrap();
            }
        }
        registry
    }

    fn rng() -> ChaCha8Rng {
        ChaCha8Rng::seed_from_u64(42)
    }

    #[test]
    fn test_broadcast_returns_every_agent_once() {
        for n in 0..5u32 {
            let registry = registry(n, 1);
            let result = "Agent=*".parse::<TargetExpression>().unwrap().resolve(&registry, &mut rng());
            if n == 0 {
                assert!(matches!(result, Err(TargetError::NoTargets { .. })));
            } else {
                let addresses = result.unwrap();
                assert_eq!(addresses.len(), n as usize);
            }
        }
    }

    #[test]
    fn test_random_returns_one_live_agent() {
        let registry = registry(4, 1);
        let expression: TargetExpression = "Agent=R".parse().unwrap();
        let mut rng = rng();
        for _ in 0..20 {
            let addresses = expression.resolve(&registry, &mut rng).unwrap();
            assert_eq!(addresses.len(), 1);
            assert!(registry.agent(addresses[0].agent_index()).is_some());
        }
        let empty = ComponentRegistry::new();
        assert!(matches!(
            expression.resolve(&empty, &mut rng),
            Err(TargetError::NoTargets { level: AddressLevel::Agent, .. })
        ));
    }

    #[test]
    fn test_chained_random_agent_broadcast_workers() {
        let registry = registry(3, 2);
        let addresses = "Agent=R,Worker=*"
            .parse::<TargetExpression>()
            .unwrap()
            .resolve(&registry, &mut rng())
            .unwrap();
        assert_eq!(addresses.len(), 2);
        assert_eq!(addresses[0].agent_index(), addresses[1].agent_index());
    }

    #[test]
    fn test_member_qualified_selection() {
        let registry = registry(2, 3);
        let members = "Worker=*m".parse::<TargetExpression>().unwrap().resolve(&registry, &mut rng()).unwrap();
        assert_eq!(members, vec![SimulatorAddress::worker(1, 1), SimulatorAddress::worker(2, 1)]);

        let oldest = "Agent=*,Worker=Om".parse::<TargetExpression>().unwrap().resolve(&registry, &mut rng()).unwrap();
        assert_eq!(oldest, vec![SimulatorAddress::worker(1, 1)]);
    }

    #[test]
    fn test_explicit_index_and_tests() {
        let mut registry = registry(2, 2);
        registry.add_test(TestCase::new("foo")).unwrap();
        let addresses = "Agent=2,Worker=*,Test=*"
            .parse::<TargetExpression>()
            .unwrap()
            .resolve(&registry, &mut rng())
            .unwrap();
        assert_eq!(
            addresses,
            vec![SimulatorAddress::test(2, 1, 1), SimulatorAddress::test(2, 2, 1)]
        );
        let missing = "Agent=9".parse::<TargetExpression>().unwrap().resolve(&registry, &mut rng());
        assert!(missing.is_err());
    }

    #[test]
    fn test_parse_errors_name_the_token() {
        let cases = [
            ("Agent=X", "Agent=X"),
            ("Worker=*,Agent=*", "Agent=*"),
            ("Agent=*,Test=*", "Test=*"),
            ("Agent=Rm", "Agent=Rm"),
            ("Agent=*,Planet=1", "Planet=1"),
            ("Agent", "Agent"),
            ("Agent=0", "Agent=0"),
        ];
        for (input, token) in cases {
            match input.parse::<TargetExpression>() {
                Err(TargetError::Parse { token: t, .. }) => assert_eq!(t, token, "input {}", input),
                other => panic!("{} should fail to parse, got {:?}", input, other),
            }
        }
    }

    #[test]
    fn test_display_round_trip() {
        for text in ["Agent=*", "Agent=R,Worker=Rm", "Agent=*,Worker=*m,Test=*", "Agent=3,Worker=O"] {
            let expression: TargetExpression = text.parse().unwrap();
            assert_eq!(expression.to_string(), text);
        }
        let implied: TargetExpression = "Worker=R".parse().unwrap();
        assert_eq!(implied.to_string(), "Agent=*,Worker=R");
        assert_eq!(implied.level(), AddressLevel::Worker);
    }
}
