//! Built-in test classes.
//!
//! Small workloads that exercise the lifecycle without a data grid: used by
//! the simulator scenarios and available to every worker binary.
//!
//! | class | behavior |
//! |---|---|
//! | `SuccessTest` | counts timestep calls, optional `sleepMicros` per call |
//! | `IdleTest` | no timestep; RUN completes on its own |
//! | `FailingTest` | returns an error in `failPhase` (default RUN) |
//! | `PanickingTest` | panics in `panicPhase` (default RUN) |
//! | `SlowTest` | sleeps `sleepMs` in `slowPhase` (default SETUP) |

use crate::definition::{TestCatalog, TestDefinition, TestError};
use crate::phase::TestPhase;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Default)]
pub struct SuccessTest {
    sleep_micros: u64,
    operations: AtomicU64,
}

impl SuccessTest {
    pub fn operations(&self) -> u64 {
        self.operations.load(Ordering::Relaxed)
    }

    fn definition() -> TestDefinition<Self> {
        TestDefinition::new("SuccessTest")
            .property("sleepMicros", |t: &mut SuccessTest, v: u64| t.sleep_micros = v)
            .timestep(|t| {
                if t.sleep_micros > 0 {
                    std::thread::sleep(Duration::from_micros(t.sleep_micros));
                }
                t.operations.fetch_add(1, Ordering::Relaxed);
                Ok(())
            })
            .on(TestPhase::LocalVerify, |t, ctx| {
                tracing::debug!(test = %ctx.address(), operations = t.operations(), "Timestep count");
                Ok(())
            })
    }
}

#[derive(Default)]
pub struct IdleTest;

pub struct FailingTest {
    fail_phase: TestPhase,
    message: String,
}

impl Default for FailingTest {
    fn default() -> Self {
        Self {
            fail_phase: TestPhase::Run,
            message: "intentional failure".to_string(),
        }
    }
}

impl FailingTest {
    fn definition() -> TestDefinition<Self> {
        let definition = TestDefinition::new("FailingTest")
            .property("failPhase", |t: &mut FailingTest, v: TestPhase| t.fail_phase = v)
            .property("message", |t: &mut FailingTest, v: String| t.message = v);
        TestPhase::all().iter().fold(definition, |definition, &phase| {
            definition.on(phase, move |t, _| {
                if t.fail_phase == phase {
                    Err(TestError::failed(format!("{} in {}", t.message, phase)))
                } else {
                    Ok(())
                }
            })
        })
    }
}

pub struct PanickingTest {
    panic_phase: TestPhase,
}

impl Default for PanickingTest {
    fn default() -> Self {
        Self {
            panic_phase: TestPhase::Run,
        }
    }
}

impl PanickingTest {
    fn definition() -> TestDefinition<Self> {
        let definition = TestDefinition::new("PanickingTest")
            .property("panicPhase", |t: &mut PanickingTest, v: TestPhase| t.panic_phase = v);
        TestPhase::all().iter().fold(definition, |definition, &phase| {
            definition.on(phase, move |t, _| {
                if t.panic_phase == phase {
                    panic!("test panicked in {}", phase);
                }
                Ok(())
            })
        })
    }
}

pub struct SlowTest {
    slow_phase: TestPhase,
    sleep_ms: u64,
}

impl Default for SlowTest {
    fn default() -> Self {
        Self {
            slow_phase: TestPhase::Setup,
            sleep_ms: 1000,
        }
    }
}

impl SlowTest {
    fn definition() -> TestDefinition<Self> {
        let definition = TestDefinition::new("SlowTest")
            .property("slowPhase", |t: &mut SlowTest, v: TestPhase| t.slow_phase = v)
            .property("sleepMs", |t: &mut SlowTest, v: u64| t.sleep_ms = v);
        TestPhase::all().iter().fold(definition, |definition, &phase| {
            definition.on(phase, move |t, _| {
                if t.slow_phase == phase {
                    std::thread::sleep(Duration::from_millis(t.sleep_ms));
                }
                Ok(())
            })
        })
    }
}

/// Catalog with every built-in class.
pub fn builtin_catalog() -> TestCatalog {
    let mut catalog = TestCatalog::new();
    catalog
        .register_default(SuccessTest::definition())
        .register_default(TestDefinition::<IdleTest>::new("IdleTest"))
        .register_default(FailingTest::definition())
        .register_default(PanickingTest::definition())
        .register_default(SlowTest::definition());
    catalog
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{BindError, TestContext};
    use crate::test_case::TestCase;
    use gridbench_env::SimulatorAddress;

    fn context() -> TestContext {
        TestContext::new("t", SimulatorAddress::test(1, 1, 1))
    }

    #[test]
    fn test_catalog_has_all_classes() {
        let catalog = builtin_catalog();
        assert_eq!(catalog.class_names(), vec!["FailingTest", "IdleTest", "PanickingTest", "SlowTest", "SuccessTest"]);
    }

    #[test]
    fn test_success_counts_steps() {
        let bound = builtin_catalog()
            .create(&TestCase::new("t").with_class("SuccessTest"))
            .unwrap();
        assert!(bound.has_timestep());
        let mut step = bound.thread_step(0).unwrap();
        for _ in 0..3 {
            step(&context()).unwrap();
        }
    }

    #[test]
    fn test_failing_phase_is_configurable() {
        let bound = builtin_catalog()
            .create(
                &TestCase::new("t")
                    .with_class("FailingTest")
                    .with_property("failPhase", "LOCAL_VERIFY")
                    .with_property("message", "boom"),
            )
            .unwrap();
        let ctx = context();
        for (phase, expect_error) in [(TestPhase::Run, false), (TestPhase::LocalVerify, true)] {
            let failed = bound
                .callbacks(phase)
                .any(|callback| callback(&ctx).is_err());
            assert_eq!(failed, expect_error, "{}", phase);
        }
    }

    #[test]
    fn test_bad_phase_property() {
        let err = builtin_catalog()
            .create(&TestCase::new("t").with_class("FailingTest").with_property("failPhase", "LATER"))
            .unwrap_err();
        assert!(matches!(err, BindError::InvalidValue { .. }));
        assert_eq!(err.key(), "failPhase");
    }

    #[test]
    fn test_idle_has_no_timestep() {
        let bound = builtin_catalog()
            .create(&TestCase::new("t").with_class("IdleTest"))
            .unwrap();
        assert!(!bound.has_timestep());
    }
}
