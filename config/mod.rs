//! Configuration management
//!
//! This module handles configuration for the hypervisor context: the
//! values reported through the parameter hypercall and runtime settings
//! such as the log level.

use log::LevelFilter;

use crate::{Error, Result};

/// Global hypervisor configuration
#[derive(Debug, Clone)]
pub struct HypervisorConfig {
    /// Number of virtual CPUs reported to the kernel
    pub ncpu: usize,
    /// Host name reported to the kernel
    pub hostname: String,
    /// Maximum level of log records
    pub log_level: LevelFilter,
    /// Fall back to the host environment for unknown parameters
    pub env_params: bool,
}

impl Default for HypervisorConfig {
    fn default() -> Self {
        Self {
            ncpu: 1,
            hostname: String::from("rump"),
            log_level: default_log_level(),
            env_params: true,
        }
    }
}

impl HypervisorConfig {
    /// Validate the configuration
    ///
    /// The fiber backend provides exactly one virtual CPU.
    pub fn validate(&self) -> Result<()> {
        if self.ncpu != 1 {
            return Err(Error::InvalidArgument);
        }

        if self.hostname.is_empty() || self.hostname.contains('\0') {
            return Err(Error::InvalidArgument);
        }

        Ok(())
    }
}

/// Get the log level selected by the build features
pub fn default_log_level() -> LevelFilter {
    if cfg!(feature = "verbose") {
        LevelFilter::Trace
    } else if cfg!(feature = "debug") {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = HypervisorConfig::default();
        assert_eq!(config.ncpu, 1);
        assert_eq!(config.hostname, "rump");
        assert!(config.env_params);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = HypervisorConfig::default();
        config.ncpu = 0;
        assert_eq!(config.validate(), Err(Error::InvalidArgument));

        let mut config = HypervisorConfig::default();
        config.hostname.clear();
        assert_eq!(config.validate(), Err(Error::InvalidArgument));
    }
}
