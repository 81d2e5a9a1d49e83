//! Test case descriptions.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Property naming the registered test class.
pub const CLASS_PROPERTY: &str = "class";

/// Property holding the number of timestep threads.
pub const THREAD_COUNT_PROPERTY: &str = "threadCount";

/// Property capping the iterations per timestep thread (0 = unlimited).
pub const ITERATIONS_PROPERTY: &str = "iterations";

/// Properties consumed by the runtime instead of the test itself.
pub const RESERVED_PROPERTIES: [&str; 3] = [CLASS_PROPERTY, THREAD_COUNT_PROPERTY, ITERATIONS_PROPERTY];

/// Identifies a test and carries the properties it is configured with.
///
/// Property values are trimmed on insertion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCase {
    id: String,
    properties: BTreeMap<String, String>,
}

impl TestCase {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            properties: BTreeMap::new(),
        }
    }

    /// Adds (or replaces) a property.
    pub fn with_property(mut self, key: impl Into<String>, value: impl AsRef<str>) -> Self {
        self.set_property(key, value);
        self
    }

    /// Shorthand for setting the `class` property.
    pub fn with_class(self, class_name: impl AsRef<str>) -> Self {
        self.with_property(CLASS_PROPERTY, class_name)
    }

    pub fn set_property(&mut self, key: impl Into<String>, value: impl AsRef<str>) {
        self.properties
            .insert(key.into().trim().to_string(), value.as_ref().trim().to_string());
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn class_name(&self) -> Option<&str> {
        self.property(CLASS_PROPERTY)
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    pub fn properties(&self) -> &BTreeMap<String, String> {
        &self.properties
    }

    /// Properties that are not consumed by the runtime.
    pub fn test_properties(&self) -> impl Iterator<Item = (&str, &str)> {
        self.properties
            .iter()
            .filter(|(k, _)| !RESERVED_PROPERTIES.contains(&k.as_str()))
            .map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl fmt::Display for TestCase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TestCase{{id={}", self.id)?;
        for (key, value) in &self.properties {
            write!(f, ", {}={}", key, value)?;
        }
        write!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_values_are_trimmed() {
        let test_case = TestCase::new("foo")
            .with_class("  SuccessTest ")
            .with_property("threadCount", " 4\n");
        assert_eq!(test_case.class_name(), Some("SuccessTest"));
        assert_eq!(test_case.property("threadCount"), Some("4"));
    }

    #[test]
    fn test_reserved_properties_are_filtered() {
        let test_case = TestCase::new("foo")
            .with_class("SuccessTest")
            .with_property("threadCount", "2")
            .with_property("keyCount", "100");
        let props: Vec<_> = test_case.test_properties().collect();
        assert_eq!(props, vec![("keyCount", "100")]);
    }

    #[test]
    fn test_display_lists_properties() {
        let test_case = TestCase::new("foo").with_class("SuccessTest");
        assert_eq!(test_case.to_string(), "TestCase{id=foo, class=SuccessTest}");
    }
}
