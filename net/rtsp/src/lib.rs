// Copyright (C) 2023 Tim-Philipp Müller <tim centricular com>
//
// This Source Code Form is subject to the terms of the Mozilla Public License, v2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at
// <https://mozilla.org/MPL/2.0/>.
//
// SPDX-License-Identifier: MPL-2.0
#![allow(clippy::non_send_fields_in_send_ty, unused_doc_comments)]

/*!
 * RTSP client source.
 *
 * Opens an RTSP session, negotiates lower transports for every stream announced in the
 * session description and hands the media to the application: interleaved data through
 * per-stream sinks, UDP sockets through an [`RtpSessionManager`].
 *
 * ```no_run
 * use std::sync::Arc;
 * use rtspsource::{RtspSrc, Settings, UdpSessionManager};
 *
 * # async fn run() -> Result<(), rtspsource::RtspError> {
 * let settings = Settings::default();
 * let (manager, _packets) = UdpSessionManager::new(settings.udp_timeout);
 * let (src, mut events) = RtspSrc::new(settings, Arc::new(manager))?;
 * src.open("rtsp://127.0.0.1:8554/test").await?;
 * src.play().await?;
 * while let Some(event) = events.recv().await {
 *     println!("{event:?}");
 * }
 * # Ok(())
 * # }
 * ```
 */

pub mod rtspsrc;

pub use rtspsrc::*;
