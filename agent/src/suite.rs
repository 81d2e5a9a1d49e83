//! Test suites read from TOML files.
//!
//! Every table under `tests` is one test case; its keys become the test's
//! properties, with non-string values written out as TOML literals.
//!
//! ```toml
//! [tests.warmup]
//! class = "SuccessTest"
//! threadCount = 2
//!
//! [tests.verify]
//! class = "FailingTest"
//! failPhase = "LOCAL_VERIFY"
//! ```

use anyhow::{bail, Context, Result};
use gridbench_core::TestCase;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Deserialize)]
struct SuiteFile {
    #[serde(default)]
    tests: BTreeMap<String, BTreeMap<String, toml::Value>>,
}

/// Parses a suite; tests come back ordered by id.
pub fn parse_suite(text: &str) -> Result<Vec<TestCase>> {
    let file: SuiteFile = toml::from_str(text).context("Invalid test suite")?;
    let mut tests = Vec::with_capacity(file.tests.len());
    for (id, properties) in file.tests {
        let mut test_case = TestCase::new(id.as_str());
        for (key, value) in properties {
            let value = match value {
                toml::Value::String(s) => s,
                toml::Value::Table(_) | toml::Value::Array(_) => {
                    bail!("Property '{}' of test '{}' must be a scalar", key, id)
                }
                other => other.to_string(),
            };
            test_case.set_property(key, value);
        }
        tests.push(test_case);
    }
    Ok(tests)
}

pub fn load_suite(path: &Path) -> Result<Vec<TestCase>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Could not read test suite {}", path.display()))?;
    parse_suite(&text).with_context(|| format!("In {}", path.display()))
}

/// Parses a `key=value` command line property.
pub fn parse_property(arg: &str) -> Result<(String, String), String> {
    match arg.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => Ok((key.trim().to_string(), value.trim().to_string())),
        _ => Err(format!("expected key=value, got '{}'", arg)),
    }
}
