// RTSP Source v2
//
// Copyright (C) 2023 Tim-Philipp Müller <tim centricular com>
//
// This Source Code Form is subject to the terms of the Mozilla Public License, v2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at
// <https://mozilla.org/MPL/2.0/>.
//
// SPDX-License-Identifier: MPL-2.0

/*!
 * `rtspsrc` is the client side of an RTSP session: it negotiates the session with the
 * server, sets up every stream it can and then supervises delivery until the session is
 * closed.
 *
 * Implemented features:
 * * RTSP 1.0 support
 * * Lower transports: TCP, UDP, UDP-Multicast
 * * Lower transport selection and priority
 *   - Also supports different lower transports for each SETUP
 * * Basic authentication
 * * VOD support: PAUSE, seeking, `Range` and `RTP-Info`
 * * GET_PARAMETER/SET_PARAMETER, keep-alives
 * * Reconnecting over TCP when no UDP data arrives
 *
 * Some missing features:
 * * Digest authentication (detected and reported)
 * * RTSP 2.0, SRTP, ONVIF backchannel
 */

mod auth;
mod body;
mod caps;
mod connection;
mod dispatch;
pub mod error;
mod events;
mod flow;
mod keepalive;
mod manager;
mod range;
pub mod retry;
mod sdp;
mod session;
mod settings;
mod stream;
mod tcp_message;
mod transport;
mod url;

pub use auth::{basic_authorization, parse_challenges, AuthMethod, Challenge};
pub use body::Body;
pub use caps::{caps_from_media, Caps};
pub use connection::{ConnError, FlushToken, MAX_MESSAGE_SIZE};
pub use dispatch::Command;
pub use error::{
    ConfigurationError, ErrorClass, ErrorClassification, MediaError, ProtocolError, RtspError,
    TransportError,
};
pub use events::Event;
pub use flow::{combine, FlowResult};
pub use keepalive::{KeepAliveMethod, DEFAULT_SESSION_TIMEOUT};
pub use manager::{
    RtpSessionManager, StreamDescription, UdpPacket, UdpSessionManager, UdpStream,
    UdpTimeoutNotifier,
};
pub use range::{SeekFlags, Segment};
pub use retry::{RetryConfig, RetryStrategy};
pub use session::{MethodSet, RtspSrc, SessionState, StreamInfo};
pub use settings::{Protocols, Settings};
pub use stream::{looks_like_rtcp, PayloadKind, StreamSink};
pub use transport::{bind_port_pair, TransportClause, TransportConfig, TransportInfo};
pub use self::url::{Scheme, ServerUrl};
