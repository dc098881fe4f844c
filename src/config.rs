//! Construction-time parameterization of every queue kind (component C6,
//! ambient configuration layer). [`DispatcherConfig::balanced`] scales every
//! kind's defaults off `std::thread::available_parallelism()`.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::DispatchError;
use crate::kind::DispatcherKind;

/// Per-kind admission parameters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DispatcherEntry {
    pub max_parallel_degree: usize,
    #[serde(default)]
    pub use_weight: bool,
}

impl DispatcherEntry {
    fn normalized(mut self) -> Self {
        self.max_parallel_degree = self.max_parallel_degree.max(1);
        self
    }
}

/// A table of [`DispatcherEntry`] values, one per [`DispatcherKind`], plus the
/// parallelism figure defaults were scaled from.
///
/// Deserializable from TOML:
///
/// ```toml
/// [kinds.cpu]
/// max_parallel_degree = 16
/// use_weight = true
///
/// [kinds.choose_worker_cpu]
/// max_parallel_degree = 4
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    #[serde(default)]
    kinds: HashMap<DispatcherKind, DispatcherEntry>,
    #[serde(skip)]
    fallback: DispatcherEntry,
}

impl DispatcherConfig {
    /// Scales every kind's `max_parallel_degree` off a single parallelism
    /// figure, typically `std::thread::available_parallelism()`.
    pub fn balanced(available_parallelism: usize) -> Self {
        let p = available_parallelism.max(1);
        let mut kinds = HashMap::new();
        for kind in DispatcherKind::ALL {
            let entry = if kind.is_choose_worker() {
                DispatcherEntry {
                    max_parallel_degree: p.clamp(1, 4),
                    use_weight: false,
                }
            } else {
                DispatcherEntry {
                    max_parallel_degree: p,
                    use_weight: true,
                }
            };
            kinds.insert(kind, entry.normalized());
        }
        Self {
            kinds,
            fallback: DispatcherEntry {
                max_parallel_degree: p,
                use_weight: true,
            },
        }
    }

    /// Parses an explicit override file. Kinds absent from the table fall
    /// back to `DispatcherConfig::balanced`'s defaults for that kind; unknown
    /// keys under `[kinds]` are a parse error (caught by serde's untagged-enum
    /// rejection of unrecognized `DispatcherKind` variants).
    pub fn from_toml_str(available_parallelism: usize, s: &str) -> Result<Self, DispatchError> {
        let mut config = Self::balanced(available_parallelism);
        let parsed: PartialConfig =
            toml::from_str(s).map_err(|e| DispatchError::ConfigInvalid {
                reason: e.to_string(),
            })?;
        for (kind, entry) in parsed.kinds {
            config.kinds.insert(kind, entry.normalized());
        }
        Ok(config)
    }

    pub fn entry(&self, kind: DispatcherKind) -> DispatcherEntry {
        self.kinds.get(&kind).copied().unwrap_or(self.fallback)
    }

    pub fn set_entry(&mut self, kind: DispatcherKind, entry: DispatcherEntry) {
        self.kinds.insert(kind, entry.normalized());
    }
}

#[derive(Debug, Deserialize)]
struct PartialConfig {
    #[serde(default)]
    kinds: HashMap<DispatcherKind, DispatcherEntry>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn balanced_clamps_every_kind_to_at_least_one() {
        let config = DispatcherConfig::balanced(0);
        for kind in DispatcherKind::ALL {
            assert!(config.entry(kind).max_parallel_degree >= 1);
        }
    }

    #[test]
    fn choose_worker_kinds_default_to_unweighted() {
        let config = DispatcherConfig::balanced(8);
        assert!(!config.entry(DispatcherKind::ChooseWorkerCpu).use_weight);
        assert!(config.entry(DispatcherKind::Cpu).use_weight);
    }

    #[test]
    fn from_toml_overrides_only_named_kinds() {
        let toml = r#"
            [kinds.cpu]
            max_parallel_degree = 16
            use_weight = true
        "#;
        let config = DispatcherConfig::from_toml_str(4, toml).unwrap();
        assert_eq!(config.entry(DispatcherKind::Cpu).max_parallel_degree, 16);
        // Untouched kind still uses the balanced default.
        assert_eq!(config.entry(DispatcherKind::Io).max_parallel_degree, 4);
    }

    #[test]
    fn from_toml_rejects_garbage() {
        let err = DispatcherConfig::from_toml_str(4, "not valid toml {{{").unwrap_err();
        assert!(matches!(err, DispatchError::ConfigInvalid { .. }));
    }

    #[test]
    fn zero_max_parallel_degree_is_clamped_to_one() {
        let mut config = DispatcherConfig::balanced(4);
        config.set_entry(
            DispatcherKind::Io,
            DispatcherEntry {
                max_parallel_degree: 0,
                use_weight: false,
            },
        );
        assert_eq!(config.entry(DispatcherKind::Io).max_parallel_degree, 1);
    }
}
