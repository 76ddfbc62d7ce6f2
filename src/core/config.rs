// Code generation options. CodegenConfig carries the knobs that change what the generator
// emits without changing the input program: the number of warps per thread block (which
// fixes the thread count of every layout and the cross-warp reduction width), whether
// asynchronous global-to-shared copies may be used, and whether the low-level IR verifier
// runs after each function. Defaults come from environment variables so that test harnesses
// and the command line driver can flip them without code changes.

//! Code generation configuration.

use std::env;

/// Environment variable holding the default number of warps per thread block.
pub const NUM_WARPS_VAR: &str = "TILEGEN_NUM_WARPS";
/// Set to `0` to lower `load_async` through synchronous loads.
pub const ASYNC_COPY_VAR: &str = "TILEGEN_ASYNC_COPY";
/// Set to `0` to skip structural verification of the produced IR.
pub const VERIFY_VAR: &str = "TILEGEN_VERIFY";

pub const DEFAULT_NUM_WARPS: u32 = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodegenConfig {
    /// Warps per thread block.
    pub num_warps: u32,
    /// Allow `cp.async` when the target supports it.
    pub async_copy: bool,
    /// Run the structural verifier on every produced function.
    pub verify: bool,
}

impl Default for CodegenConfig {
    fn default() -> Self {
        Self {
            num_warps: DEFAULT_NUM_WARPS,
            async_copy: true,
            verify: true,
        }
    }
}

impl CodegenConfig {
    /// Build a configuration from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a configuration from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(warps) = lookup(NUM_WARPS_VAR) {
            match warps.trim().parse::<u32>() {
                Ok(n) if n > 0 => config.num_warps = n,
                _ => log::warn!("ignoring invalid {NUM_WARPS_VAR}={warps:?}"),
            }
        }
        if let Some(flag) = lookup(ASYNC_COPY_VAR) {
            config.async_copy = flag_enabled(&flag);
        }
        if let Some(flag) = lookup(VERIFY_VAR) {
            config.verify = flag_enabled(&flag);
        }
        config
    }

    pub fn with_num_warps(mut self, num_warps: u32) -> Self {
        self.num_warps = num_warps;
        self
    }

    pub fn with_async_copy(mut self, enabled: bool) -> Self {
        self.async_copy = enabled;
        self
    }

    pub fn with_verify(mut self, enabled: bool) -> Self {
        self.verify = enabled;
        self
    }

    /// Threads per block.
    pub fn num_threads(&self) -> u32 {
        self.num_warps * 32
    }
}

fn flag_enabled(value: &str) -> bool {
    !matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "0" | "false" | "off" | "no"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_without_environment() {
        let config = CodegenConfig::from_lookup(lookup(&[]));
        assert_eq!(config, CodegenConfig::default());
        assert_eq!(config.num_threads(), 128);
    }

    #[test]
    fn test_environment_overrides() {
        let config = CodegenConfig::from_lookup(lookup(&[
            (NUM_WARPS_VAR, "8"),
            (ASYNC_COPY_VAR, "0"),
            (VERIFY_VAR, "off"),
        ]));
        assert_eq!(config.num_warps, 8);
        assert!(!config.async_copy);
        assert!(!config.verify);
    }

    #[test]
    fn test_invalid_warp_count_is_ignored() {
        let config = CodegenConfig::from_lookup(lookup(&[(NUM_WARPS_VAR, "zero")]));
        assert_eq!(config.num_warps, DEFAULT_NUM_WARPS);
    }
}
