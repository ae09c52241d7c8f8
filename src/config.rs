// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 rsa-shm contributors
//
// Configuration keys and defaults for the shared-memory transport.

use std::time::Duration;

use crate::endpoint::Properties;
use crate::error::{Result, RsaError};

/// Property naming the server-side shared segment.
pub const RSA_SHM_SERVER_NAME_KEY: &str = "rsaShmServerName";

/// Property sizing the pooled message segment, in bytes.
pub const RSA_SHM_POOL_SIZE_KEY: &str = "rsaShmPoolSize";
pub const RSA_SHM_POOL_SIZE_DEFAULT: usize = 1024 * 256;

/// Property bounding how long a requester waits for a reply, in seconds.
pub const RSA_SHM_MSG_TIMEOUT_KEY: &str = "rsaShmMsgTimeout";
pub const RSA_SHM_MSG_TIMEOUT_DEFAULT_IN_S: u64 = 30;

/// Property bounding concurrent in-flight invocations per channel.
pub const RSA_SHM_MAX_CONCURRENT_INVOCATIONS_KEY: &str = "rsaShmCctIvNum";
pub const RSA_SHM_MAX_CONCURRENT_INVOCATIONS_DEFAULT: usize = 32;
/// Hard ceiling: the slot pool is tracked in one 64-bit mask.
pub const RSA_SHM_MAX_CONCURRENT_INVOCATIONS_LIMIT: usize = 64;

/// Body capacity each slot must at least offer for a reply.
pub const EXPECT_MSG_RESPONSE_SIZE_DEFAULT: usize = 512;

/// Default rpc type bindings select factories and invokers by.
pub const RSA_RPC_TYPE_DEFAULT: &str = "rsa_json_rpc";

/// Failure count after which an exported service is considered broken.
pub const RSA_SHM_MAX_INVOKED_SVC_FAILURES: u32 = 15;
/// How long a broken service stays out of rotation, in seconds.
pub const RSA_SHM_MAX_SVC_BREAKED_TIME_IN_S: u64 = 60;

/// Resolved transport configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RsaShmConfig {
    pub server_name: String,
    pub pool_size: usize,
    pub msg_timeout: Duration,
    pub max_concurrent: usize,
}

impl RsaShmConfig {
    /// Configuration with defaults for everything but the segment name.
    pub fn new(server_name: impl Into<String>) -> Self {
        Self {
            server_name: server_name.into(),
            pool_size: RSA_SHM_POOL_SIZE_DEFAULT,
            msg_timeout: Duration::from_secs(RSA_SHM_MSG_TIMEOUT_DEFAULT_IN_S),
            max_concurrent: RSA_SHM_MAX_CONCURRENT_INVOCATIONS_DEFAULT,
        }
    }

    /// Resolve a configuration from a property map.
    ///
    /// Unparsable values fall back to their defaults with a warning rather
    /// than failing resolution; only a missing server name is an error.
    pub fn from_properties(props: &Properties) -> Result<Self> {
        let server_name = props
            .get(RSA_SHM_SERVER_NAME_KEY)
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                RsaError::InvalidArgument(format!(
                    "property {RSA_SHM_SERVER_NAME_KEY} is missing"
                ))
            })?;

        let mut config = Self::new(server_name);
        if let Some(v) = props.get(RSA_SHM_POOL_SIZE_KEY) {
            match v.trim().parse::<usize>() {
                Ok(n) if n > 0 => config.pool_size = n,
                _ => log::warn!(
                    "Invalid {RSA_SHM_POOL_SIZE_KEY} value {v:?}, using default {}.",
                    RSA_SHM_POOL_SIZE_DEFAULT
                ),
            }
        }
        if let Some(v) = props.get(RSA_SHM_MSG_TIMEOUT_KEY) {
            match v.trim().parse::<u64>() {
                Ok(n) if n > 0 => config.msg_timeout = Duration::from_secs(n),
                _ => log::warn!(
                    "Invalid {RSA_SHM_MSG_TIMEOUT_KEY} value {v:?}, using default {}s.",
                    RSA_SHM_MSG_TIMEOUT_DEFAULT_IN_S
                ),
            }
        }
        if let Some(v) = props.get(RSA_SHM_MAX_CONCURRENT_INVOCATIONS_KEY) {
            match v.trim().parse::<usize>() {
                Ok(n) if (1..=RSA_SHM_MAX_CONCURRENT_INVOCATIONS_LIMIT).contains(&n) => {
                    config.max_concurrent = n
                }
                _ => log::warn!(
                    "Invalid {RSA_SHM_MAX_CONCURRENT_INVOCATIONS_KEY} value {v:?}, \
                     using default {}.",
                    RSA_SHM_MAX_CONCURRENT_INVOCATIONS_DEFAULT
                ),
            }
        }
        Ok(config)
    }

    /// Check the invariants channel construction relies on.
    pub fn validate(&self) -> Result<()> {
        if self.server_name.trim().is_empty() {
            return Err(RsaError::InvalidArgument("server name is empty".into()));
        }
        if self.max_concurrent == 0
            || self.max_concurrent > RSA_SHM_MAX_CONCURRENT_INVOCATIONS_LIMIT
        {
            return Err(RsaError::InvalidArgument(format!(
                "max concurrent invocations {} is outside 1..={}",
                self.max_concurrent, RSA_SHM_MAX_CONCURRENT_INVOCATIONS_LIMIT
            )));
        }
        if self.msg_timeout.is_zero() {
            return Err(RsaError::InvalidArgument("message timeout is zero".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let c = RsaShmConfig::new("srv");
        assert_eq!(c.pool_size, 262144);
        assert_eq!(c.msg_timeout, Duration::from_secs(30));
        assert_eq!(c.max_concurrent, 32);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn from_properties_parses_and_falls_back() {
        let mut p = Properties::new();
        p.insert(RSA_SHM_SERVER_NAME_KEY.into(), "srv".into());
        p.insert(RSA_SHM_POOL_SIZE_KEY.into(), "524288".into());
        p.insert(RSA_SHM_MSG_TIMEOUT_KEY.into(), "nonsense".into());
        p.insert(RSA_SHM_MAX_CONCURRENT_INVOCATIONS_KEY.into(), "70".into());
        let c = RsaShmConfig::from_properties(&p).unwrap();
        assert_eq!(c.pool_size, 524288);
        assert_eq!(c.msg_timeout, Duration::from_secs(30));
        assert_eq!(c.max_concurrent, 32);
    }

    #[test]
    fn missing_server_name_fails() {
        assert!(RsaShmConfig::from_properties(&Properties::new()).is_err());
    }

    #[test]
    fn validate_bounds() {
        let mut c = RsaShmConfig::new("srv");
        c.max_concurrent = 0;
        assert!(c.validate().is_err());
        c.max_concurrent = 65;
        assert!(c.validate().is_err());
        c.max_concurrent = 64;
        assert!(c.validate().is_ok());
    }
}
