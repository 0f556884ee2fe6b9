// RTSP Source 2 - Error types
//
// Copyright (C) 2025 GStreamer developers
//
// This Source Code Form is subject to the terms of the Mozilla Public License, v2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at
// <https://mozilla.org/MPL/2.0/>.
//
// SPDX-License-Identifier: MPL-2.0

use std::io;

use thiserror::Error;

use super::connection::ConnError;
use super::flow::FlowResult;
use super::session::SessionState;

/// Main error type returned by the session controller
#[derive(Debug, Error)]
pub enum RtspError {
    /// Control connection failures, including cancellation by flush
    #[error(transparent)]
    Connection(#[from] ConnError),

    /// RTSP protocol errors
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Lower transport negotiation and socket allocation errors
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// SDP and capability errors
    #[error(transparent)]
    Media(#[from] MediaError),

    /// Settings and URL errors
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error("Operation not allowed in state {0:?}")]
    InvalidState(SessionState),

    /// Data delivery failed for all streams
    #[error("Streaming stopped, reason {0:?}")]
    Flow(FlowResult),
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Invalid RTSP response: {details}")]
    InvalidResponse { details: String },

    #[error("Unsupported RTSP feature: {feature}")]
    UnsupportedFeature { feature: String },

    #[error("Authentication failed: {method} - {details}")]
    AuthenticationFailed { method: String, details: String },

    #[error("Session error: {details}")]
    SessionError { details: String },

    #[error("RTSP method not supported by server: {method}")]
    MethodNotAllowed { method: String },

    #[error("RTSP status {code}: {message}")]
    StatusError { code: u16, message: String },

    #[error("Missing required header: {header}")]
    MissingHeader { header: String },
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("No lower transport left to try for stream {stream}")]
    NoProtocols { stream: u32 },

    #[error("Could not allocate an RTP/RTCP port pair starting at {start} after {retries} retries")]
    PortAllocation { start: u16, retries: u16 },

    #[error("Transport negotiation failed: {reason}")]
    Negotiation { reason: String },

    #[error("No stream could be set up")]
    NoStreams,

    #[error("UDP timeout and TCP fallback is not possible: {reason}")]
    UdpTimeout { reason: String },

    #[error("Socket error: {0}")]
    Socket(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("SDP parsing failed: {details}")]
    SdpParsingFailed { details: String },

    #[error("Unexpected content type {content_type:?}, expected application/sdp")]
    NotSdp { content_type: Option<String> },

    #[error("No clock rate for payload type {pt}")]
    NoClockRate { pt: u8 },

    #[error("Invalid media format: {details}")]
    InvalidMediaFormat { details: String },

    #[error("No compatible media streams found")]
    NoCompatibleStreams,
}

#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Invalid configuration: {parameter} - {reason}")]
    InvalidParameter { parameter: String, reason: String },

    #[error("Invalid URL: {url} - {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Missing required configuration: {parameter}")]
    MissingParameter { parameter: String },
}

/// Error classification for retry logic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Errors that should be retried immediately
    Transient,
    /// Errors that should be retried with backoff
    RetryableWithBackoff,
    /// Errors that should not be retried
    Permanent,
    /// Intentional interruption through a flush
    Cancelled,
}

pub trait ErrorClassification {
    fn classify(&self) -> ErrorClass;

    fn is_retryable(&self) -> bool {
        matches!(
            self.classify(),
            ErrorClass::Transient | ErrorClass::RetryableWithBackoff
        )
    }
}

impl ErrorClassification for io::Error {
    fn classify(&self) -> ErrorClass {
        match self.kind() {
            io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::AddrNotAvailable => ErrorClass::RetryableWithBackoff,
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::TimedOut
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock => ErrorClass::Transient,
            _ => ErrorClass::Permanent,
        }
    }
}

impl ErrorClassification for ConnError {
    fn classify(&self) -> ErrorClass {
        match self {
            ConnError::Io(err) => err.classify(),
            ConnError::Timeout(_) => ErrorClass::Transient,
            ConnError::Cancelled => ErrorClass::Cancelled,
            ConnError::Closed => ErrorClass::RetryableWithBackoff,
            ConnError::Resolve(_) => ErrorClass::RetryableWithBackoff,
            ConnError::Read(_) | ConnError::InvalidMessage(_) | ConnError::NotConnected => {
                ErrorClass::Permanent
            }
        }
    }
}

impl ErrorClassification for RtspError {
    fn classify(&self) -> ErrorClass {
        match self {
            RtspError::Connection(err) => err.classify(),
            RtspError::Protocol(ProtocolError::StatusError { code, .. }) if *code >= 500 => {
                ErrorClass::RetryableWithBackoff
            }
            _ => ErrorClass::Permanent,
        }
    }
}

impl RtspError {
    pub fn is_cancelled(&self) -> bool {
        self.classify() == ErrorClass::Cancelled
    }

    pub(crate) fn status(code: u16, message: impl Into<String>) -> Self {
        ProtocolError::StatusError {
            code,
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn invalid_response(details: impl Into<String>) -> Self {
        ProtocolError::InvalidResponse {
            details: details.into(),
        }
        .into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_error_display() {
        let err = RtspError::from(ProtocolError::StatusError {
            code: 404,
            message: "Not Found".to_string(),
        });
        assert_eq!(err.to_string(), "RTSP status 404: Not Found");

        let err = RtspError::from(TransportError::PortAllocation {
            start: 5000,
            retries: 20,
        });
        assert!(err.to_string().contains("5000"));
    }

    #[test]
    fn test_classification() {
        let refused = ConnError::Io(io::Error::from(io::ErrorKind::ConnectionRefused));
        assert_eq!(refused.classify(), ErrorClass::RetryableWithBackoff);
        assert!(refused.is_retryable());

        let timeout = ConnError::Timeout(Duration::from_secs(5));
        assert_eq!(timeout.classify(), ErrorClass::Transient);

        let cancelled = RtspError::from(ConnError::Cancelled);
        assert!(cancelled.is_cancelled());
        assert!(!cancelled.is_retryable());

        let server = RtspError::status(503, "Service Unavailable");
        assert!(server.is_retryable());
        let client = RtspError::status(454, "Session Not Found");
        assert!(!client.is_retryable());
    }
}
