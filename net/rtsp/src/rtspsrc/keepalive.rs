// RTSP Source 2 - Session timeout and keep-alive scheduling
//
// Copyright (C) 2025 GStreamer developers
//
// This Source Code Form is subject to the terms of the Mozilla Public License, v2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at
// <https://mozilla.org/MPL/2.0/>.
//
// SPDX-License-Identifier: MPL-2.0

use std::time::Duration;

use rtsp_types::headers::Session;
use tokio::time::Instant;
use tracing::debug;

pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(60);
// Keep-alives go out at 80% of the server's session timeout
const KEEPALIVE_NUM: u32 = 4;
const KEEPALIVE_DEN: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepAliveMethod {
    GetParameter,
    Options,
}

/// Tracks the RTSP session id and when the server last heard from us.
#[derive(Debug)]
pub struct SessionTimer {
    session: Option<String>,
    timeout: Duration,
    last_activity: Instant,
}

impl Default for SessionTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionTimer {
    pub fn new() -> Self {
        Self {
            session: None,
            timeout: DEFAULT_SESSION_TIMEOUT,
            last_activity: Instant::now(),
        }
    }

    /// Takes the id and the timeout of a `Session` header.
    pub fn set_session(&mut self, session: &Session) {
        let id = session.0.trim();
        if !id.is_empty() {
            self.session = Some(id.to_string());
        }
        if let Some(secs) = session.1.filter(|secs| *secs > 0) {
            self.timeout = Duration::from_secs(secs);
            debug!("Session timeout set to {secs} seconds");
        }

        self.reset_activity();
    }

    pub fn session(&self) -> Option<&str> {
        self.session.as_deref()
    }

    pub fn reset_activity(&mut self) {
        self.last_activity = Instant::now();
    }

    fn keepalive_interval(&self) -> Duration {
        self.timeout * KEEPALIVE_NUM / KEEPALIVE_DEN
    }

    /// When the next keep-alive is due, `None` without a session.
    pub fn next_keepalive(&self) -> Option<Instant> {
        self.session
            .as_ref()
            .map(|_| self.last_activity + self.keepalive_interval())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_session_header() {
        let mut timer = SessionTimer::new();
        assert!(timer.next_keepalive().is_none());

        timer.set_session(&Session::with_timeout("12345".to_string(), 90));
        assert_eq!(timer.session(), Some("12345"));
        assert_eq!(
            timer.next_keepalive(),
            Some(Instant::now() + Duration::from_secs(72))
        );

        // The timeout sticks when a later response leaves it out
        timer.set_session(&Session::from("67890 "));
        assert_eq!(timer.session(), Some("67890"));
        assert_eq!(
            timer.next_keepalive(),
            Some(Instant::now() + Duration::from_secs(72))
        );

        timer.set_session(&Session::with_timeout("67890".to_string(), 0));
        assert_eq!(
            timer.next_keepalive(),
            Some(Instant::now() + Duration::from_secs(72))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_timing() {
        let mut timer = SessionTimer::new();
        timer.set_session(&Session::from("test"));
        let due = Instant::now() + Duration::from_secs(48);
        assert_eq!(timer.next_keepalive(), Some(due));

        tokio::time::advance(Duration::from_secs(50)).await;
        assert!(timer.next_keepalive().is_some_and(|d| d <= Instant::now()));

        timer.reset_activity();
        assert_eq!(
            timer.next_keepalive(),
            Some(Instant::now() + Duration::from_secs(48))
        );
    }
}
