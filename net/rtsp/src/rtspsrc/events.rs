// RTSP Source 2 - Notifications
//
// Copyright (C) 2025 GStreamer developers
//
// This Source Code Form is subject to the terms of the Mozilla Public License, v2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at
// <https://mozilla.org/MPL/2.0/>.
//
// SPDX-License-Identifier: MPL-2.0

use std::time::Duration;

use tokio::sync::mpsc;
use tracing::trace;

use super::caps::Caps;
use super::session::SessionState;
use super::settings::Protocols;

/// Everything the session reports to the application, in order, on a single channel.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    StreamAdded { id: u32, caps: Caps },
    NoMoreStreams,
    DurationChanged(Option<Duration>),
    StateChanged(SessionState),
    /// A media could not be set up and is left out of the session.
    StreamSkipped { id: u32, reason: String },
    TransportFallback { from: Protocols, to: Protocols },
    SegmentDone { position: Duration },
    Eos,
    Error(String),
    Warning(String),
}

#[derive(Debug, Clone)]
pub(crate) struct EventSender(mpsc::UnboundedSender<Event>);

impl EventSender {
    pub(crate) fn channel() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self(tx), rx)
    }

    pub(crate) fn post(&self, event: Event) {
        trace!("Posting {event:?}");
        // The application may have dropped the receiver
        let _ = self.0.send(event);
    }
}
