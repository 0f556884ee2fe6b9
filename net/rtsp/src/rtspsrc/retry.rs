// RTSP Source 2 - Connection retry logic
//
// Copyright (C) 2025 GStreamer developers
//
// This Source Code Form is subject to the terms of the Mozilla Public License, v2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at
// <https://mozilla.org/MPL/2.0/>.
//
// SPDX-License-Identifier: MPL-2.0

use std::time::Duration;

use rand::Rng;
use serde::Deserialize;
use tracing::debug;

use super::settings::duration_ms;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RetryStrategy {
    None,
    Immediate,
    Linear,
    Exponential,
    #[default]
    ExponentialJitter,
}

impl RetryStrategy {
    pub fn from_string(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "none" => Some(RetryStrategy::None),
            "immediate" => Some(RetryStrategy::Immediate),
            "linear" => Some(RetryStrategy::Linear),
            "exponential" => Some(RetryStrategy::Exponential),
            "exponential-jitter" => Some(RetryStrategy::ExponentialJitter),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RetryStrategy::None => "none",
            RetryStrategy::Immediate => "immediate",
            RetryStrategy::Linear => "linear",
            RetryStrategy::Exponential => "exponential",
            RetryStrategy::ExponentialJitter => "exponential-jitter",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct RetryConfig {
    pub strategy: RetryStrategy,
    /// -1 for infinite
    pub max_attempts: i32,
    #[serde(rename = "initial-delay-ms", with = "duration_ms")]
    pub initial_delay: Duration,
    #[serde(rename = "max-delay-ms", with = "duration_ms")]
    pub max_delay: Duration,
    #[serde(rename = "linear-step-ms", with = "duration_ms")]
    pub linear_step: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            strategy: RetryStrategy::default(),
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            linear_step: Duration::from_secs(1),
        }
    }
}

#[derive(Debug)]
pub struct RetryCalculator {
    config: RetryConfig,
    attempt: u32,
}

impl RetryCalculator {
    pub fn new(config: RetryConfig) -> Self {
        Self { config, attempt: 0 }
    }

    pub fn should_retry(&self) -> bool {
        if self.config.strategy == RetryStrategy::None {
            return false;
        }
        self.config.max_attempts < 0 || self.attempt < self.config.max_attempts as u32
    }

    pub fn next_delay(&mut self) -> Option<Duration> {
        if !self.should_retry() {
            return None;
        }

        let delay = match self.config.strategy {
            RetryStrategy::None => return None,
            RetryStrategy::Immediate => Duration::ZERO,
            RetryStrategy::Linear => self.calculate_linear_delay(),
            RetryStrategy::Exponential => self.calculate_exponential_delay(false),
            RetryStrategy::ExponentialJitter => self.calculate_exponential_delay(true),
        };
        let delay = delay.min(self.config.max_delay);

        debug!(
            attempt = self.attempt + 1,
            strategy = self.config.strategy.as_str(),
            delay_ms = delay.as_millis() as u64,
            "Scheduling connection retry"
        );

        self.attempt += 1;
        Some(delay)
    }

    pub fn current_attempt(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    fn calculate_linear_delay(&self) -> Duration {
        self.config
            .initial_delay
            .saturating_add(self.config.linear_step.saturating_mul(self.attempt))
    }

    fn calculate_exponential_delay(&self, with_jitter: bool) -> Duration {
        let base_delay = self
            .config
            .initial_delay
            .saturating_mul(2u32.saturating_pow(self.attempt))
            .min(self.config.max_delay);

        if with_jitter {
            // ±25%
            let jitter_factor = rand::rng().random_range(0.75..1.25);
            Duration::from_secs_f64(base_delay.as_secs_f64() * jitter_factor)
        } else {
            base_delay
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_from_string() {
        assert_eq!(RetryStrategy::from_string("none"), Some(RetryStrategy::None));
        assert_eq!(
            RetryStrategy::from_string("Linear"),
            Some(RetryStrategy::Linear)
        );
        assert_eq!(
            RetryStrategy::from_string("exponential-jitter"),
            Some(RetryStrategy::ExponentialJitter)
        );
        assert_eq!(RetryStrategy::from_string("first-wins"), None);
    }

    #[test]
    fn test_no_retry_strategy() {
        let config = RetryConfig {
            strategy: RetryStrategy::None,
            ..Default::default()
        };

        let mut calc = RetryCalculator::new(config);
        assert!(!calc.should_retry());
        assert_eq!(calc.next_delay(), None);
    }

    #[test]
    fn test_linear_backoff() {
        let config = RetryConfig {
            strategy: RetryStrategy::Linear,
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            linear_step: Duration::from_secs(2),
            max_delay: Duration::from_secs(4),
        };

        let mut calc = RetryCalculator::new(config);

        assert_eq!(calc.next_delay(), Some(Duration::from_secs(1)));
        assert_eq!(calc.next_delay(), Some(Duration::from_secs(3)));
        // 5s capped
        assert_eq!(calc.next_delay(), Some(Duration::from_secs(4)));
        assert_eq!(calc.next_delay(), None);

        calc.reset();
        assert_eq!(calc.current_attempt(), 0);
        assert!(calc.should_retry());
    }

    #[test]
    fn test_exponential_backoff() {
        let config = RetryConfig {
            strategy: RetryStrategy::Exponential,
            max_attempts: -1,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            ..Default::default()
        };

        let mut calc = RetryCalculator::new(config);

        assert_eq!(calc.next_delay(), Some(Duration::from_millis(100)));
        assert_eq!(calc.next_delay(), Some(Duration::from_millis(200)));
        assert_eq!(calc.next_delay(), Some(Duration::from_millis(400)));
        assert_eq!(calc.next_delay(), Some(Duration::from_millis(800)));
        assert_eq!(calc.next_delay(), Some(Duration::from_secs(1)));
        for _ in 0..50 {
            assert_eq!(calc.next_delay(), Some(Duration::from_secs(1)));
        }
    }

    #[test]
    fn test_exponential_jitter() {
        let config = RetryConfig {
            strategy: RetryStrategy::ExponentialJitter,
            max_attempts: 2,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(100),
            ..Default::default()
        };

        let mut calc = RetryCalculator::new(config);

        let delay1 = calc.next_delay().unwrap();
        assert!(delay1 >= Duration::from_millis(750));
        assert!(delay1 <= Duration::from_millis(1250));

        let delay2 = calc.next_delay().unwrap();
        assert!(delay2 >= Duration::from_millis(1500));
        assert!(delay2 <= Duration::from_millis(2500));

        assert_eq!(calc.next_delay(), None);
    }
}
