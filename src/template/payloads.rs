//! Payload expansion: turns declared payload lists into deterministic
//! iteration tuples per the request's attack strategy.

use serde::{Deserialize, Serialize};

use crate::error::CompileError;

/// Combinator selecting iteration semantics over the payload lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttackStrategy {
    /// All names iterate together on the same index; length is the
    /// shortest list
    #[default]
    Batteringram,
    /// Lockstep iteration; all lists must have equal length
    Pitchfork,
    /// Cartesian product in declaration order, first name slowest
    Clusterbomb,
}

/// One concrete binding of every payload name for a single dispatch.
pub type PayloadTuple = Vec<(String, String)>;

/// Compiled payload lists in declaration order.
#[derive(Debug, Clone, Default)]
pub struct PayloadGenerator {
    names: Vec<String>,
    lists: Vec<Vec<String>>,
    strategy: AttackStrategy,
}

impl PayloadGenerator {
    /// Canonicalizes the decoded payload mapping. `iterate_all` forces
    /// clusterbomb semantics regardless of the declared strategy.
    pub fn new(
        payloads: &serde_yaml::Mapping,
        strategy: AttackStrategy,
        iterate_all: bool,
    ) -> Result<Self, CompileError> {
        let mut names = Vec::new();
        let mut lists = Vec::new();

        for (key, value) in payloads {
            let name = yaml_scalar(key);
            let list: Vec<String> = match value {
                serde_yaml::Value::Sequence(seq) => seq.iter().map(yaml_scalar).collect(),
                other => vec![yaml_scalar(other)],
            };
            if list.is_empty() {
                return Err(CompileError::EmptyPayload(name));
            }
            names.push(name);
            lists.push(list);
        }

        let strategy = if iterate_all {
            AttackStrategy::Clusterbomb
        } else {
            strategy
        };

        if strategy == AttackStrategy::Pitchfork && !lists.is_empty() {
            let expected = lists[0].len();
            for (name, list) in names.iter().zip(&lists) {
                if list.len() != expected {
                    return Err(CompileError::PayloadLengthMismatch {
                        name: name.clone(),
                        len: list.len(),
                        expected,
                    });
                }
            }
        }

        Ok(Self {
            names,
            lists,
            strategy,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Number of tuples iteration will produce; `1` with no payloads so
    /// the request still dispatches once.
    pub fn total(&self) -> usize {
        if self.lists.is_empty() {
            return 1;
        }
        match self.strategy {
            AttackStrategy::Batteringram | AttackStrategy::Pitchfork => {
                self.lists.iter().map(Vec::len).min().unwrap_or(0)
            }
            AttackStrategy::Clusterbomb => self.lists.iter().map(Vec::len).product(),
        }
    }

    /// Materializes the full tuple sequence. Deterministic: declaration
    /// order of names, first name varying slowest for clusterbomb.
    pub fn tuples(&self) -> Vec<PayloadTuple> {
        if self.lists.is_empty() {
            return vec![Vec::new()];
        }
        match self.strategy {
            AttackStrategy::Batteringram | AttackStrategy::Pitchfork => {
                let len = self.lists.iter().map(Vec::len).min().unwrap_or(0);
                (0..len)
                    .map(|i| {
                        self.names
                            .iter()
                            .zip(&self.lists)
                            .map(|(name, list)| (name.clone(), list[i].clone()))
                            .collect()
                    })
                    .collect()
            }
            AttackStrategy::Clusterbomb => {
                let total: usize = self.lists.iter().map(Vec::len).product();
                // Strides make the first declared name vary slowest.
                let mut strides = vec![1usize; self.lists.len()];
                for i in (0..self.lists.len().saturating_sub(1)).rev() {
                    strides[i] = strides[i + 1] * self.lists[i + 1].len();
                }
                (0..total)
                    .map(|index| {
                        self.names
                            .iter()
                            .zip(&self.lists)
                            .zip(&strides)
                            .map(|((name, list), stride)| {
                                (name.clone(), list[(index / stride) % list.len()].clone())
                            })
                            .collect()
                    })
                    .collect()
            }
        }
    }
}

fn yaml_scalar(value: &serde_yaml::Value) -> String {
    match value {
        serde_yaml::Value::String(s) => s.clone(),
        serde_yaml::Value::Number(n) => n.to_string(),
        serde_yaml::Value::Bool(b) => b.to_string(),
        other => serde_yaml::to_string(other)
            .unwrap_or_default()
            .trim()
            .to_string(),
    }
}
