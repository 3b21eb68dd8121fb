// Engine configuration
//
// Defaults: rayon's global pool, operands evaluated on the current thread,
// primitive names under the `physl` scheme. Two environment variables
// override them:
//
//   PHYSL_WORKER_THREADS   size of a dedicated worker pool
//   PHYSL_ASYNC_OPERANDS   "1"/"true"/"yes"/"on" spawns operand evaluation

use crate::compiler::DEFAULT_SCHEME;
use crate::error::{Error, Result};

pub const WORKER_THREADS_VAR: &str = "PHYSL_WORKER_THREADS";
pub const ASYNC_OPERANDS_VAR: &str = "PHYSL_ASYNC_OPERANDS";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Dedicated pool size; `None` uses the global pool.
    pub worker_threads: Option<usize>,
    pub async_operands: bool,
    pub scheme: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_threads: None,
            async_operands: false,
            scheme: DEFAULT_SCHEME.to_string(),
        }
    }
}

impl EngineConfig {
    /// Defaults overridden from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Defaults overridden by `lookup`, which maps a variable name to its
    /// value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(text) = lookup(WORKER_THREADS_VAR) {
            let threads: usize = text
                .trim()
                .parse()
                .map_err(|_| Error::Config(format!("{WORKER_THREADS_VAR} must be a positive integer, got '{text}'")))?;
            if threads == 0 {
                return Err(Error::Config(format!("{WORKER_THREADS_VAR} must be at least 1")));
            }
            config.worker_threads = Some(threads);
        }
        if let Some(text) = lookup(ASYNC_OPERANDS_VAR) {
            config.async_operands = match text.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" | "" => false,
                _ => {
                    return Err(Error::Config(format!(
                        "{ASYNC_OPERANDS_VAR} must be a boolean, got '{text}'"
                    )))
                }
            };
        }
        Ok(config)
    }

    pub fn with_worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = Some(threads);
        self
    }

    pub fn with_async_operands(mut self, enabled: bool) -> Self {
        self.async_operands = enabled;
        self
    }

    pub fn with_scheme(mut self, scheme: impl Into<String>) -> Self {
        self.scheme = scheme.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from(vars: &[(&str, &str)]) -> Result<EngineConfig> {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        EngineConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn unset_variables_keep_defaults() {
        assert_eq!(from(&[]).unwrap(), EngineConfig::default());
    }

    #[test]
    fn variables_override_defaults() {
        let config = from(&[(WORKER_THREADS_VAR, "3"), (ASYNC_OPERANDS_VAR, "Yes")]).unwrap();
        assert_eq!(config.worker_threads, Some(3));
        assert!(config.async_operands);
        assert_eq!(config.scheme, "physl");
    }

    #[test]
    fn malformed_values_are_rejected() {
        assert!(matches!(from(&[(WORKER_THREADS_VAR, "many")]), Err(Error::Config(_))));
        assert!(matches!(from(&[(WORKER_THREADS_VAR, "0")]), Err(Error::Config(_))));
        assert!(matches!(from(&[(ASYNC_OPERANDS_VAR, "maybe")]), Err(Error::Config(_))));
    }
}
