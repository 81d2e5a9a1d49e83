//! Test definitions, property binding and the test catalog.
//!
//! A benchmark test is a plain struct plus a [`TestDefinition`] that
//! registers, explicitly and in order:
//!
//! - named property setters (`keyCount` -> `fn(&mut T, u64)`),
//! - callbacks per [`TestPhase`],
//! - an optional timestep in one of three shapes ([`TimeStep`]).
//!
//! ```text
//!   TestCase{class=Map, keyCount=1000}
//!        │  TestCatalog::create
//!        ▼
//!   TestDefinition<MapTest>::bind(MapTest::default())
//!        │  setters applied, instance shared
//!        ▼
//!   BoundTest (type erased, owned by a TestContainer)
//! ```
//!
//! A definition can extend a base definition with [`TestDefinition::with_base`];
//! its own callbacks run before the base's callbacks of the same phase.

use crate::performance::DEFAULT_PROBE_NAME;
use crate::phase::TestPhase;
use crate::test_case::{TestCase, CLASS_PROPERTY, ITERATIONS_PROPERTY, THREAD_COUNT_PROPERTY};
use gridbench_env::SimulatorAddress;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Raised when a test case cannot be turned into a test instance.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BindError {
    #[error("Test case '{test_id}' has no '{key}' property")]
    MissingProperty { test_id: String, key: String },

    #[error("Unknown test class '{class}'")]
    UnknownClass { class: String },

    #[error("Property '{key}' does not exist on {class}")]
    UnknownProperty { class: String, key: String },

    #[error("Property '{key}' has invalid value '{value}': {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },
}

impl BindError {
    /// The property the error is about.
    pub fn key(&self) -> &str {
        match self {
            BindError::MissingProperty { key, .. } => key,
            BindError::UnknownClass { .. } => CLASS_PROPERTY,
            BindError::UnknownProperty { key, .. } => key,
            BindError::InvalidValue { key, .. } => key,
        }
    }
}

/// Error returned by test code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TestError {
    #[error("{0}")]
    Failed(String),

    #[error("panicked: {0}")]
    Panicked(String),
}

impl TestError {
    pub fn failed(message: impl Into<String>) -> Self {
        TestError::Failed(message.into())
    }
}

/// Fails with `message` unless `condition` holds.
pub fn ensure(condition: bool, message: impl FnOnce() -> String) -> Result<(), TestError> {
    if condition {
        Ok(())
    } else {
        Err(TestError::Failed(message()))
    }
}

// =============================================================================
// RUNTIME CONTEXT
// =============================================================================

/// Cooperative cancellation flag for the RUN phase.
#[derive(Debug, Clone, Default)]
pub struct StopToken(Arc<AtomicBool>);

impl StopToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::Release);
    }

    #[inline]
    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// What a running test can see of its environment.
#[derive(Debug)]
pub struct TestContext {
    test_id: String,
    address: SimulatorAddress,
    stop: StopToken,
}

impl TestContext {
    pub fn new(test_id: impl Into<String>, address: SimulatorAddress) -> Self {
        Self {
            test_id: test_id.into(),
            address,
            stop: StopToken::new(),
        }
    }

    pub fn test_id(&self) -> &str {
        &self.test_id
    }

    /// Address of the test container on this worker.
    pub fn address(&self) -> SimulatorAddress {
        self.address
    }

    #[inline]
    pub fn is_stopped(&self) -> bool {
        self.stop.is_stopped()
    }

    /// Ends the RUN phase from inside the test.
    pub fn stop(&self) {
        self.stop.stop();
    }

    pub fn stop_token(&self) -> StopToken {
        self.stop.clone()
    }
}

// =============================================================================
// PROPERTY VALUES
// =============================================================================

/// Conversion from a property string to a field value.
pub trait FromPropertyValue: Sized {
    fn from_property(value: &str) -> Result<Self, String>;
}

macro_rules! from_str_property {
    ($($ty:ty),*) => {
        $(
            impl FromPropertyValue for $ty {
                fn from_property(value: &str) -> Result<Self, String> {
                    value.parse::<$ty>().map_err(|e| e.to_string())
                }
            }
        )*
    };
}

from_str_property!(i32, i64, u32, u64, usize, f64);

impl FromPropertyValue for String {
    fn from_property(value: &str) -> Result<Self, String> {
        Ok(value.to_string())
    }
}

impl FromPropertyValue for bool {
    fn from_property(value: &str) -> Result<Self, String> {
        match value.to_ascii_lowercase().as_str() {
            "true" => Ok(true),
            "false" => Ok(false),
            other => Err(format!("'{}' is not a boolean", other)),
        }
    }
}

impl FromPropertyValue for TestPhase {
    fn from_property(value: &str) -> Result<Self, String> {
        value.parse()
    }
}

// =============================================================================
// DEFINITION
// =============================================================================

type Setter<T> = Arc<dyn Fn(&mut T, &str) -> Result<(), String> + Send + Sync>;
type PhaseFn<T> = Arc<dyn Fn(&T, &TestContext) -> Result<(), TestError> + Send + Sync>;

/// One timestep invocation on a dedicated thread.
pub type ThreadStep<'a> = Box<dyn FnMut(&TestContext) -> Result<(), TestError> + Send + 'a>;

type StateStep<T> = Box<dyn FnMut(&T, &TestContext) -> Result<(), TestError> + Send>;

/// The shapes a timestep can take.
pub enum TimeStep<T> {
    /// `fn(&T)`
    NoArg(Arc<dyn Fn(&T) -> Result<(), TestError> + Send + Sync>),

    /// Per-thread state created by a factory (thread index as argument)
    WithState(Arc<dyn Fn(&T, usize) -> StateStep<T> + Send + Sync>),

    /// `fn(&T, &TestContext)`
    WithContext(PhaseFn<T>),
}

impl<T> Clone for TimeStep<T> {
    fn clone(&self) -> Self {
        match self {
            TimeStep::NoArg(f) => TimeStep::NoArg(Arc::clone(f)),
            TimeStep::WithState(f) => TimeStep::WithState(Arc::clone(f)),
            TimeStep::WithContext(f) => TimeStep::WithContext(Arc::clone(f)),
        }
    }
}

/// Describes how to configure and drive one test class.
pub struct TestDefinition<T> {
    class_name: String,
    setters: BTreeMap<String, Setter<T>>,
    phases: Vec<(TestPhase, PhaseFn<T>)>,
    timestep: Option<TimeStep<T>>,
    probe_name: String,
}

impl<T: Send + Sync + 'static> TestDefinition<T> {
    pub fn new(class_name: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            setters: BTreeMap::new(),
            phases: Vec::new(),
            timestep: None,
            probe_name: DEFAULT_PROBE_NAME.to_string(),
        }
    }

    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    /// Registers a typed property setter.
    pub fn property<V, F>(mut self, name: &str, setter: F) -> Self
    where
        V: FromPropertyValue,
        F: Fn(&mut T, V) + Send + Sync + 'static,
    {
        let setter: Setter<T> = Arc::new(move |test: &mut T, raw: &str| {
            let value = V::from_property(raw)?;
            setter(test, value);
            Ok(())
        });
        self.setters.insert(name.to_string(), setter);
        self
    }

    /// Appends a callback for `phase`. Callbacks of a phase run in
    /// registration order.
    pub fn on<F>(mut self, phase: TestPhase, callback: F) -> Self
    where
        F: Fn(&T, &TestContext) -> Result<(), TestError> + Send + Sync + 'static,
    {
        self.phases.push((phase, Arc::new(callback)));
        self
    }

    /// Timestep without arguments.
    pub fn timestep<F>(mut self, step: F) -> Self
    where
        F: Fn(&T) -> Result<(), TestError> + Send + Sync + 'static,
    {
        self.timestep = Some(TimeStep::NoArg(Arc::new(step)));
        self
    }

    /// Timestep with a state object owned by each thread.
    pub fn timestep_with_state<S, I, F>(mut self, init: I, step: F) -> Self
    where
        S: Send + 'static,
        I: Fn(&T, usize) -> S + Send + Sync + 'static,
        F: Fn(&T, &mut S) -> Result<(), TestError> + Send + Sync + 'static,
    {
        let step = Arc::new(step);
        let factory = move |test: &T, thread_index: usize| -> StateStep<T> {
            let mut state = init(test, thread_index);
            let step = Arc::clone(&step);
            Box::new(move |test: &T, _ctx: &TestContext| step(test, &mut state))
        };
        self.timestep = Some(TimeStep::WithState(Arc::new(factory)));
        self
    }

    /// Timestep receiving the test context.
    pub fn timestep_with_context<F>(mut self, step: F) -> Self
    where
        F: Fn(&T, &TestContext) -> Result<(), TestError> + Send + Sync + 'static,
    {
        self.timestep = Some(TimeStep::WithContext(Arc::new(step)));
        self
    }

    /// Names the latency probe of the timestep.
    pub fn probe(mut self, name: impl Into<String>) -> Self {
        self.probe_name = name.into();
        self
    }

    /// Extends a base definition.
    ///
    /// Own callbacks run before the base's, own setters shadow the base's,
    /// and the base timestep is used only if none was registered here.
    pub fn with_base(mut self, base: TestDefinition<T>) -> Self {
        self.phases.extend(base.phases);
        for (name, setter) in base.setters {
            self.setters.entry(name).or_insert(setter);
        }
        if self.timestep.is_none() {
            self.timestep = base.timestep;
        }
        self
    }

    /// Number of callbacks registered for a phase.
    pub fn callback_count(&self, phase: TestPhase) -> usize {
        self.phases.iter().filter(|(p, _)| *p == phase).count()
    }

    /// Applies the test case to `instance` and produces a runnable test.
    pub fn bind(&self, mut instance: T, test_case: &TestCase) -> Result<BoundTest, BindError> {
        let thread_count = reserved(test_case, THREAD_COUNT_PROPERTY, 1usize)?;
        if thread_count == 0 {
            return Err(BindError::InvalidValue {
                key: THREAD_COUNT_PROPERTY.to_string(),
                value: "0".to_string(),
                reason: "at least one thread is required".to_string(),
            });
        }
        let iterations = reserved(test_case, ITERATIONS_PROPERTY, 0u64)?;

        for (key, value) in test_case.test_properties() {
            let setter = self.setters.get(key).ok_or_else(|| BindError::UnknownProperty {
                class: self.class_name.clone(),
                key: key.to_string(),
            })?;
            setter(&mut instance, value).map_err(|reason| BindError::InvalidValue {
                key: key.to_string(),
                value: value.to_string(),
                reason,
            })?;
        }

        let instance = Arc::new(instance);
        let phases = self
            .phases
            .iter()
            .map(|(phase, callback)| {
                let test = Arc::clone(&instance);
                let callback = Arc::clone(callback);
                let erased: BoundPhaseFn = Box::new(move |ctx: &TestContext| callback(&test, ctx));
                (*phase, erased)
            })
            .collect();

        let timestep = self.timestep.clone().map(|timestep| {
            let test = Arc::clone(&instance);
            let factory: StepFactory = Box::new(move |thread_index| -> ThreadStep<'static> {
                let test = Arc::clone(&test);
                match &timestep {
                    TimeStep::NoArg(f) => {
                        let f = Arc::clone(f);
                        Box::new(move |_ctx: &TestContext| f(&test))
                    }
                    TimeStep::WithState(factory) => {
                        let mut step = factory(&test, thread_index);
                        Box::new(move |ctx: &TestContext| step(&test, ctx))
                    }
                    TimeStep::WithContext(f) => {
                        let f = Arc::clone(f);
                        Box::new(move |ctx: &TestContext| f(&test, ctx))
                    }
                }
            });
            factory
        });

        Ok(BoundTest {
            class_name: self.class_name.clone(),
            probe_name: self.probe_name.clone(),
            thread_count,
            iterations,
            phases,
            timestep,
        })
    }
}

fn reserved<V: FromPropertyValue>(test_case: &TestCase, key: &str, default: V) -> Result<V, BindError> {
    match test_case.property(key) {
        None => Ok(default),
        Some(raw) => V::from_property(raw).map_err(|reason| BindError::InvalidValue {
            key: key.to_string(),
            value: raw.to_string(),
            reason,
        }),
    }
}

type BoundPhaseFn = Box<dyn Fn(&TestContext) -> Result<(), TestError> + Send + Sync>;
type StepFactory = Box<dyn Fn(usize) -> ThreadStep<'static> + Send + Sync>;

/// A configured test instance, ready to be driven through its phases.
pub struct BoundTest {
    class_name: String,
    probe_name: String,
    thread_count: usize,
    iterations: u64,
    phases: Vec<(TestPhase, BoundPhaseFn)>,
    timestep: Option<StepFactory>,
}

impl BoundTest {
    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    pub fn probe_name(&self) -> &str {
        &self.probe_name
    }

    pub fn thread_count(&self) -> usize {
        self.thread_count
    }

    /// Iteration cap per thread, `0` for unlimited.
    pub fn iterations(&self) -> u64 {
        self.iterations
    }

    pub fn has_timestep(&self) -> bool {
        self.timestep.is_some()
    }

    /// Callbacks of `phase` in execution order.
    pub fn callbacks(
        &self,
        phase: TestPhase,
    ) -> impl Iterator<Item = &(dyn Fn(&TestContext) -> Result<(), TestError> + Send + Sync)> {
        self.phases
            .iter()
            .filter(move |(p, _)| *p == phase)
            .map(|(_, callback)| &**callback)
    }

    /// Creates the timestep for one thread.
    pub fn thread_step(&self, thread_index: usize) -> Option<ThreadStep<'static>> {
        self.timestep.as_ref().map(|factory| factory(thread_index))
    }
}

// =============================================================================
// CATALOG
// =============================================================================

/// Creates bound tests of one class.
pub trait TestFactory: Send + Sync + 'static {
    fn class_name(&self) -> &str;

    fn create(&self, test_case: &TestCase) -> Result<BoundTest, BindError>;
}

struct DefinitionFactory<T, F> {
    definition: TestDefinition<T>,
    make: F,
}

impl<T, F> TestFactory for DefinitionFactory<T, F>
where
    T: Send + Sync + 'static,
    F: Fn() -> T + Send + Sync + 'static,
{
    fn class_name(&self) -> &str {
        self.definition.class_name()
    }

    fn create(&self, test_case: &TestCase) -> Result<BoundTest, BindError> {
        self.definition.bind((self.make)(), test_case)
    }
}

/// Maps class names to test factories.
#[derive(Clone, Default)]
pub struct TestCatalog {
    factories: HashMap<String, Arc<dyn TestFactory>>,
}

impl TestCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a definition with a constructor for fresh instances.
    pub fn register<T, F>(&mut self, definition: TestDefinition<T>, make: F) -> &mut Self
    where
        T: Send + Sync + 'static,
        F: Fn() -> T + Send + Sync + 'static,
    {
        let factory = Arc::new(DefinitionFactory { definition, make });
        self.factories.insert(factory.class_name().to_string(), factory);
        self
    }

    /// Registers a definition whose instances start from `T::default()`.
    pub fn register_default<T>(&mut self, definition: TestDefinition<T>) -> &mut Self
    where
        T: Default + Send + Sync + 'static,
    {
        self.register(definition, T::default)
    }

    pub fn contains(&self, class_name: &str) -> bool {
        self.factories.contains_key(class_name)
    }

    pub fn class_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Looks up the test case's class and binds a new instance.
    pub fn create(&self, test_case: &TestCase) -> Result<BoundTest, BindError> {
        let class = test_case
            .class_name()
            .ok_or_else(|| BindError::MissingProperty {
                test_id: test_case.id().to_string(),
                key: CLASS_PROPERTY.to_string(),
            })?;
        let factory = self
            .factories
            .get(class)
            .ok_or_else(|| BindError::UnknownClass {
                class: class.to_string(),
            })?;
        factory.create(test_case)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    // `unwrap_err` requires `Debug` on the `Ok` type; the boxed closures rule out a derive.
    impl std::fmt::Debug for BoundTest {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("BoundTest")
                .field("class_name", &self.class_name)
                .field("probe_name", &self.probe_name)
                .finish_non_exhaustive()
        }
    }

    #[derive(Default)]
    struct MapTest {
        key_count: u64,
        name: String,
        log: Mutex<Vec<String>>,
    }

    fn definition() -> TestDefinition<MapTest> {
        TestDefinition::new("MapTest")
            .property("keyCount", |t: &mut MapTest, v: u64| t.key_count = v)
            .property("name", |t: &mut MapTest, v: String| t.name = v)
            .on(TestPhase::Setup, |t, _| {
                t.log.lock().push(format!("setup {}", t.key_count));
                Ok(())
            })
    }

    fn test_case() -> TestCase {
        TestCase::new("t1").with_class("MapTest")
    }

    #[test]
    fn test_bind_applies_properties() {
        let bound = definition()
            .on(TestPhase::Setup, |t, _| {
                ensure(t.name == "m", || format!("name was {}", t.name))
            })
            .bind(
                MapTest::default(),
                &test_case()
                    .with_property("keyCount", "25")
                    .with_property("name", "m")
                    .with_property("threadCount", "3"),
            )
            .unwrap();
        assert_eq!(bound.thread_count(), 3);
        assert_eq!(bound.iterations(), 0);
        let ctx = TestContext::new("t1", SimulatorAddress::test(1, 1, 1));
        for callback in bound.callbacks(TestPhase::Setup) {
            callback(&ctx).unwrap();
        }
    }

    #[test]
    fn test_unknown_property_names_key() {
        let err = definition()
            .bind(MapTest::default(), &test_case().with_property("valueSize", "10"))
            .unwrap_err();
        assert_eq!(err.key(), "valueSize");
        assert!(matches!(err, BindError::UnknownProperty { .. }));
    }

    #[test]
    fn test_mistyped_property_names_key() {
        let err = definition()
            .bind(MapTest::default(), &test_case().with_property("keyCount", "lots"))
            .unwrap_err();
        assert_eq!(err.key(), "keyCount");
        assert!(matches!(err, BindError::InvalidValue { .. }));

        let err = definition()
            .bind(MapTest::default(), &test_case().with_property("threadCount", "0"))
            .unwrap_err();
        assert_eq!(err.key(), "threadCount");
    }

    #[test]
    fn test_subclass_callbacks_run_before_base() {
        let base = TestDefinition::<MapTest>::new("Base").on(TestPhase::Setup, |t, _| {
            t.log.lock().push("base".to_string());
            Ok(())
        });
        let derived = TestDefinition::<MapTest>::new("Derived")
            .on(TestPhase::Setup, |t, _| {
                t.log.lock().push("derived".to_string());
                Ok(())
            })
            .with_base(base);
        assert_eq!(derived.callback_count(TestPhase::Setup), 2);

        let shared = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&shared);
        let bound = derived
            .on(TestPhase::Setup, move |t, _| {
                sink.lock().extend(t.log.lock().drain(..));
                Ok(())
            })
            .bind(MapTest::default(), &TestCase::new("t").with_class("Derived"))
            .unwrap();
        let ctx = TestContext::new("t", SimulatorAddress::test(1, 1, 1));
        for callback in bound.callbacks(TestPhase::Setup) {
            callback(&ctx).unwrap();
        }
        assert_eq!(*shared.lock(), vec!["derived".to_string(), "base".to_string()]);
    }

    #[test]
    fn test_state_timestep_is_per_thread() {
        let bound = TestDefinition::<MapTest>::new("Counter")
            .timestep_with_state(
                |_, thread| (thread, 0u64),
                |_, state: &mut (usize, u64)| {
                    state.1 += 1;
                    ensure(state.1 <= 2, || format!("thread {} ran too often", state.0))
                },
            )
            .bind(MapTest::default(), &TestCase::new("t").with_class("Counter"))
            .unwrap();
        let ctx = TestContext::new("t", SimulatorAddress::test(1, 1, 1));
        let mut first = bound.thread_step(0).unwrap();
        let mut second = bound.thread_step(1).unwrap();
        assert!(first(&ctx).is_ok());
        assert!(first(&ctx).is_ok());
        assert!(second(&ctx).is_ok());
        assert!(first(&ctx).is_err());
    }

    #[test]
    fn test_catalog_lookup() {
        let mut catalog = TestCatalog::new();
        catalog.register_default(definition());
        assert!(catalog.contains("MapTest"));
        assert!(catalog.create(&test_case()).is_ok());

        let missing_class = catalog.create(&TestCase::new("x")).unwrap_err();
        assert_eq!(missing_class.key(), "class");
        let unknown = catalog
            .create(&TestCase::new("x").with_class("Nope"))
            .unwrap_err();
        assert_eq!(unknown, BindError::UnknownClass { class: "Nope".to_string() });
    }

    #[test]
    fn test_stop_token_is_shared() {
        let ctx = TestContext::new("t", SimulatorAddress::test(1, 1, 1));
        let token = ctx.stop_token();
        assert!(!ctx.is_stopped());
        token.stop();
        assert!(ctx.is_stopped());
    }
}
