//! Test lifecycle phases.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// One step of a test's lifecycle.
///
/// The declaration order is the only legal progression. Global phases run on
/// a single worker once every worker has finished the preceding phase; all
/// other phases run on every worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TestPhase {
    Setup,
    LocalPrepare,
    GlobalPrepare,
    Run,
    GlobalVerify,
    LocalVerify,
    LocalTeardown,
    GlobalTeardown,
}

const ALL_PHASES: [TestPhase; 8] = [
    TestPhase::Setup,
    TestPhase::LocalPrepare,
    TestPhase::GlobalPrepare,
    TestPhase::Run,
    TestPhase::GlobalVerify,
    TestPhase::LocalVerify,
    TestPhase::LocalTeardown,
    TestPhase::GlobalTeardown,
];

impl TestPhase {
    /// All phases in execution order.
    pub fn all() -> &'static [TestPhase] {
        &ALL_PHASES
    }

    /// The final phase; completing it completes the test.
    pub fn last() -> TestPhase {
        TestPhase::GlobalTeardown
    }

    /// True for phases executed by a single worker for the whole cluster.
    pub fn is_global(self) -> bool {
        matches!(
            self,
            TestPhase::GlobalPrepare | TestPhase::GlobalVerify | TestPhase::GlobalTeardown
        )
    }

    /// Position in the lifecycle (0-based).
    pub fn ordinal(self) -> usize {
        self as usize
    }

    pub fn next(self) -> Option<TestPhase> {
        ALL_PHASES.get(self.ordinal() + 1).copied()
    }

    pub fn name(self) -> &'static str {
        match self {
            TestPhase::Setup => "SETUP",
            TestPhase::LocalPrepare => "LOCAL_PREPARE",
            TestPhase::GlobalPrepare => "GLOBAL_PREPARE",
            TestPhase::Run => "RUN",
            TestPhase::GlobalVerify => "GLOBAL_VERIFY",
            TestPhase::LocalVerify => "LOCAL_VERIFY",
            TestPhase::LocalTeardown => "LOCAL_TEARDOWN",
            TestPhase::GlobalTeardown => "GLOBAL_TEARDOWN",
        }
    }
}

impl fmt::Display for TestPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for TestPhase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase().replace('-', "_");
        ALL_PHASES
            .iter()
            .copied()
            .find(|phase| phase.name() == normalized)
            .ok_or_else(|| format!("Unknown test phase: {}", s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_order() {
        let phases = TestPhase::all();
        assert_eq!(phases.first(), Some(&TestPhase::Setup));
        assert_eq!(phases.last(), Some(&TestPhase::last()));
        assert!(phases.windows(2).all(|w| w[0] < w[1]));
        assert!(TestPhase::LocalPrepare < TestPhase::GlobalPrepare);
        assert_eq!(TestPhase::Run.next(), Some(TestPhase::GlobalVerify));
        assert_eq!(TestPhase::GlobalTeardown.next(), None);
    }

    #[test]
    fn test_global_phases() {
        let global: Vec<_> = TestPhase::all().iter().filter(|p| p.is_global()).collect();
        assert_eq!(global.len(), 3);
        assert!(!TestPhase::Run.is_global());
    }

    #[test]
    fn test_parse_and_serde() {
        assert_eq!("local_prepare".parse::<TestPhase>(), Ok(TestPhase::LocalPrepare));
        assert!("warmup".parse::<TestPhase>().is_err());
        let json = serde_json::to_string(&TestPhase::GlobalVerify).unwrap();
        assert_eq!(json, "\"GLOBAL_VERIFY\"");
    }
}
