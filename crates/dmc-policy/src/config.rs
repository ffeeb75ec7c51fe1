//! Key/value configuration surface of the policy.
//!
//! The table-parsing front end passes `<key> <value>` pairs through
//! [`HintsPolicy::set_config_value`](crate::HintsPolicy::set_config_value)
//! and echoes [`PolicyConfig::to_pairs`] back when reporting the table.

use dmc_error::{PolicyError, Result};
use serde::{Deserialize, Serialize};

/// The only key this policy understands.
pub const HINT_SIZE_KEY: &str = "hint_size";

/// Policy name as registered with the cache target.
pub const POLICY_NAME: &str = "hints";

pub const POLICY_VERSION: [u32; 3] = [1, 0, 0];

/// A parsed configuration pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigValue {
    HintSize(usize),
}

impl ConfigValue {
    pub fn parse(key: &str, value: &str) -> Result<Self> {
        match key {
            HINT_SIZE_KEY => value
                .parse::<usize>()
                .map(Self::HintSize)
                .map_err(|_| {
                    PolicyError::InvalidArgument(format!(
                        "{HINT_SIZE_KEY} expects an unsigned integer, got {value:?}"
                    ))
                }),
            other => Err(PolicyError::InvalidArgument(format!(
                "unknown config key {other:?}"
            ))),
        }
    }
}

/// Current configuration as reported back to the front end.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyConfig {
    pub hint_size: Option<usize>,
}

impl PolicyConfig {
    /// Configured pairs; empty until the hint width is set.
    #[must_use]
    pub fn to_pairs(&self) -> Vec<(&'static str, String)> {
        self.hint_size
            .map(|size| (HINT_SIZE_KEY, size.to_string()))
            .into_iter()
            .collect()
    }
}

/// Describes the policy type to registration front ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PolicyDescriptor {
    pub name: &'static str,
    pub version: [u32; 3],
    pub hint_size: Option<usize>,
}
