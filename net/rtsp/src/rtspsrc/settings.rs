// RTSP Source 2 - Settings
//
// Copyright (C) 2023 Tim-Philipp Müller <tim centricular com>
// Copyright (C) 2023-2024 Nirbheek Chauhan <nirbheek centricular com>
//
// This Source Code Form is subject to the terms of the Mozilla Public License, v2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at
// <https://mozilla.org/MPL/2.0/>.
//
// SPDX-License-Identifier: MPL-2.0

use std::fmt;
use std::time::Duration;

use bitflags::bitflags;
use serde::{Deserialize, Deserializer};

use super::error::ConfigurationError;
use super::retry::RetryConfig;

pub const DEFAULT_PORT_START: u16 = 0;
pub const DEFAULT_PORT_RETRY: u16 = 20;
pub const DEFAULT_TCP_TIMEOUT: Duration = Duration::from_secs(20);
pub const DEFAULT_UDP_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_LATENCY: Duration = Duration::from_millis(2000);
pub const DEFAULT_UDP_RECONNECT: bool = true;
pub const DEFAULT_USER_AGENT: &str = concat!("rtspsrc2/", env!("CARGO_PKG_VERSION"));

bitflags! {
    /// Lower transports the client may negotiate.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Protocols: u8 {
        const UDP_MCAST = 0b001;
        const UDP = 0b010;
        const TCP = 0b100;
    }
}

impl Protocols {
    /// Parses a comma-separated list such as `udp-mcast,udp,tcp`.
    pub fn parse(s: &str) -> Result<Self, ConfigurationError> {
        if s.trim().is_empty() {
            return Err(ConfigurationError::InvalidParameter {
                parameter: "protocols".to_string(),
                reason: "Protocols list is empty".to_string(),
            });
        }
        let mut acc = Protocols::empty();
        for each in s.split(',') {
            match each.trim() {
                "udp-mcast" => acc |= Protocols::UDP_MCAST,
                "udp" => acc |= Protocols::UDP,
                "tcp" => acc |= Protocols::TCP,
                other => {
                    return Err(ConfigurationError::InvalidParameter {
                        parameter: "protocols".to_string(),
                        reason: format!("Unsupported RTSP protocol: {other}"),
                    })
                }
            }
        }
        Ok(acc)
    }

    /// Single protocols contained in `self`, in the order they are offered to the server.
    pub fn priority_order(self) -> impl Iterator<Item = Protocols> {
        [Protocols::UDP_MCAST, Protocols::UDP, Protocols::TCP]
            .into_iter()
            .filter(move |p| self.contains(*p))
    }
}

impl fmt::Display for Protocols {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = self
            .priority_order()
            .map(|p| {
                if p == Protocols::UDP_MCAST {
                    "udp-mcast"
                } else if p == Protocols::UDP {
                    "udp"
                } else {
                    "tcp"
                }
            })
            .collect::<Vec<_>>();
        write!(f, "{}", names.join(","))
    }
}

/// Configuration of an [`RtspSrc`](super::RtspSrc).
///
/// Durations are given in milliseconds when deserialized.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Settings {
    #[serde(deserialize_with = "deserialize_protocols")]
    pub protocols: Protocols,
    /// First local UDP port to try, 0 lets the OS choose.
    pub port_start: u16,
    /// How many port pairs to try before giving up on UDP for a stream.
    pub port_retry: u16,
    #[serde(rename = "tcp-timeout-ms", with = "duration_ms")]
    pub tcp_timeout: Duration,
    #[serde(rename = "udp-timeout-ms", with = "duration_ms")]
    pub udp_timeout: Duration,
    /// Passed on to the RTP session manager.
    #[serde(rename = "latency-ms", with = "duration_ms")]
    pub latency: Duration,
    pub user_id: Option<String>,
    pub user_pw: Option<String>,
    pub user_agent: String,
    /// Reopen the control connection when the server closes it while streaming over UDP.
    pub udp_reconnect: bool,
    pub retry: RetryConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            protocols: Protocols::all(),
            port_start: DEFAULT_PORT_START,
            port_retry: DEFAULT_PORT_RETRY,
            tcp_timeout: DEFAULT_TCP_TIMEOUT,
            udp_timeout: DEFAULT_UDP_TIMEOUT,
            latency: DEFAULT_LATENCY,
            user_id: None,
            user_pw: None,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            udp_reconnect: DEFAULT_UDP_RECONNECT,
            retry: RetryConfig::default(),
        }
    }
}

impl Settings {
    pub fn set_protocols(&mut self, protocols: &str) -> Result<(), ConfigurationError> {
        self.protocols = Protocols::parse(protocols)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.protocols.is_empty() {
            return Err(ConfigurationError::InvalidParameter {
                parameter: "protocols".to_string(),
                reason: "no lower transport allowed".to_string(),
            });
        }
        if self.tcp_timeout.is_zero() {
            return Err(ConfigurationError::InvalidParameter {
                parameter: "tcp-timeout-ms".to_string(),
                reason: "must be greater than 0".to_string(),
            });
        }
        if self.port_start % 2 != 0 {
            return Err(ConfigurationError::InvalidParameter {
                parameter: "port-start".to_string(),
                reason: format!("RTP port {} must be even", self.port_start),
            });
        }
        Ok(())
    }
}

fn deserialize_protocols<'de, D>(deserializer: D) -> Result<Protocols, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    Protocols::parse(&s).map_err(serde::de::Error::custom)
}

pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_protocols() {
        assert_eq!(Protocols::parse("udp-mcast,udp,tcp").unwrap(), Protocols::all());
        assert_eq!(
            Protocols::parse("tcp, udp").unwrap(),
            Protocols::TCP | Protocols::UDP
        );
        assert!(Protocols::parse("").is_err());
        assert!(Protocols::parse("udp,http").is_err());
    }

    #[test]
    fn test_priority_order() {
        let order = (Protocols::TCP | Protocols::UDP_MCAST)
            .priority_order()
            .collect::<Vec<_>>();
        assert_eq!(order, vec![Protocols::UDP_MCAST, Protocols::TCP]);
        assert_eq!(Protocols::all().to_string(), "udp-mcast,udp,tcp");
    }

    #[test]
    fn test_validate() {
        let mut settings = Settings::default();
        assert!(settings.validate().is_ok());
        settings.port_start = 5001;
        assert!(settings.validate().is_err());
        settings.port_start = 5000;
        settings.protocols = Protocols::empty();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_deserialize_from_toml() {
        let settings: Settings = toml::from_str(
            r#"
            protocols = "tcp"
            port-start = 6000
            udp-timeout-ms = 2500
            user-id = "admin"
            udp-reconnect = false

            [retry]
            strategy = "linear"
            max-attempts = 5
            initial-delay-ms = 100
            "#,
        )
        .unwrap();
        assert_eq!(settings.protocols, Protocols::TCP);
        assert_eq!(settings.port_start, 6000);
        assert_eq!(settings.udp_timeout, Duration::from_millis(2500));
        assert_eq!(settings.tcp_timeout, DEFAULT_TCP_TIMEOUT);
        assert_eq!(settings.user_id.as_deref(), Some("admin"));
        assert!(!settings.udp_reconnect);
        assert_eq!(
            settings.retry.strategy,
            super::super::retry::RetryStrategy::Linear
        );
        assert_eq!(settings.retry.max_attempts, 5);
        assert_eq!(settings.retry.initial_delay, Duration::from_millis(100));
    }
}
