// RTSP Source 2 - Session description handling
//
// Copyright (C) 2023-2024 Nirbheek Chauhan <nirbheek centricular com>
//
// This Source Code Form is subject to the terms of the Mozilla Public License, v2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at
// <https://mozilla.org/MPL/2.0/>.
//
// SPDX-License-Identifier: MPL-2.0

use std::net::IpAddr;

use rtsp_types::headers::{Range, CONTENT_BASE, CONTENT_LOCATION, CONTENT_TYPE};
use rtsp_types::Response;
use tracing::{debug, info, warn};
use url::Url;

use super::body::Body;
use super::caps::{caps_from_media, Caps};
use super::error::MediaError;
use super::settings::Protocols;

const SUPPORTED_MEDIA: [&str; 3] = ["audio", "video", "application"];

/// Resolves an `a=control` value against the base URL.
pub fn parse_control_path(value: &str, base: &Url) -> Option<Url> {
    let value = value.trim();
    if value.is_empty() || value == "*" {
        return Some(base.clone());
    }
    if value.contains("://") {
        return Url::parse(value).ok();
    }

    // Relative to the base as a directory, like most servers expect
    let mut base = base.clone();
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    base.set_query(None);
    base.join(value).ok()
}

/// Lower transports implied by the `c=` lines, and whether they are IPv4.
///
/// Empty protocols mean there is no usable constraint.
pub fn parse_connections(connections: &[sdp_types::Connection]) -> (Protocols, bool) {
    let mut protocols = Protocols::empty();
    let mut is_ipv4 = true;

    for conn in connections {
        // `224.2.1.1/127` carries a TTL
        let addr = conn
            .connection_address
            .split('/')
            .next()
            .unwrap_or_default();
        let Ok(addr) = addr.parse::<IpAddr>() else {
            continue;
        };
        is_ipv4 = addr.is_ipv4();
        if addr.is_multicast() {
            protocols |= Protocols::UDP_MCAST;
        } else if !addr.is_unspecified() {
            protocols |= Protocols::UDP | Protocols::TCP;
        }
    }

    (protocols, is_ipv4)
}

/// Base URL for relative controls: `Content-Base`, then `Content-Location`, then the
/// request URL.
pub fn base_url(rsp: &Response<Body>, request_url: &Url) -> Url {
    rsp.header(&CONTENT_BASE)
        .or_else(|| rsp.header(&CONTENT_LOCATION))
        .and_then(|v| Url::parse(v.as_str().trim()).ok())
        .unwrap_or_else(|| request_url.clone())
}

pub fn check_content_type(rsp: &Response<Body>) -> Result<(), MediaError> {
    let content_type = rsp.header(&CONTENT_TYPE).map(|v| v.as_str().to_string());
    let is_sdp = content_type.as_deref().is_some_and(|ct| {
        ct.split(';')
            .next()
            .is_some_and(|mime| mime.trim().eq_ignore_ascii_case("application/sdp"))
    });
    if is_sdp {
        Ok(())
    } else {
        Err(MediaError::NotSdp { content_type })
    }
}

/// One media description that became a stream candidate.
#[derive(Debug, Clone)]
pub struct MediaDescription {
    pub index: u32,
    pub caps: Caps,
    pub control_url: Url,
    /// Transports allowed by the `c=` lines, empty when unconstrained.
    pub protocols: Protocols,
    pub is_ipv4: bool,
}

#[derive(Debug, Clone)]
pub struct SessionDescription {
    pub aggregate_control: Option<Url>,
    pub range: Option<Range>,
    pub medias: Vec<MediaDescription>,
    /// Media descriptions left out, with the reason.
    pub skipped: Vec<(u32, String)>,
}

/// Parses a DESCRIBE body into stream candidates.
pub fn parse_description(body: &[u8], base: &Url) -> Result<SessionDescription, MediaError> {
    let sdp = sdp_types::Session::parse(body).map_err(|err| MediaError::SdpParsingFailed {
        details: format!("{err:?}"),
    })?;
    debug!("{sdp:#?}");

    // No attribute and no value have the same meaning for us
    let aggregate_control = sdp
        .get_first_attribute_value("control")
        .ok()
        .flatten()
        .and_then(|v| parse_control_path(v, base));

    let range = sdp
        .get_first_attribute_value("range")
        .ok()
        .flatten()
        .and_then(|v| {
            v.parse::<Range>()
                .map_err(|_| warn!("Ignoring invalid range '{v}'"))
                .ok()
        });

    let session_conn = sdp.connection.iter().cloned().collect::<Vec<_>>();

    let mut medias = Vec::new();
    let mut skipped = Vec::new();
    for (index, m) in sdp.medias.iter().enumerate() {
        let index = index as u32;
        let media = m.media.to_ascii_lowercase();
        if !SUPPORTED_MEDIA.contains(&media.as_str()) {
            info!("Ignoring unsupported media {}", m.media);
            skipped.push((index, format!("unsupported media {}", m.media)));
            continue;
        }

        let media_control = m
            .get_first_attribute_value("control")
            .ok()
            .flatten()
            .and_then(|v| parse_control_path(v, base));
        let Some(control_url) = media_control.or_else(|| aggregate_control.clone()) else {
            warn!(
                "No session control or media control for {} fmt {}, ignoring",
                m.media, m.fmt
            );
            skipped.push((index, "no control url".to_string()));
            continue;
        };

        let caps = match caps_from_media(m, &sdp.attributes) {
            Ok(caps) => caps,
            Err(err) => {
                warn!("Skipping media {} {}: {err}", m.media, m.fmt);
                skipped.push((index, err.to_string()));
                continue;
            }
        };

        let connections = if m.connections.is_empty() {
            &session_conn
        } else {
            &m.connections
        };
        let (protocols, is_ipv4) = parse_connections(connections);

        medias.push(MediaDescription {
            index,
            caps,
            control_url,
            protocols,
            is_ipv4,
        });
    }

    Ok(SessionDescription {
        aggregate_control,
        range,
        medias,
        skipped,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rtsp_types::headers::{NptRange, NptTime};

    fn base() -> Url {
        Url::parse("rtsp://example.com/media.mp4").unwrap()
    }

    #[test]
    fn test_parse_control_path() {
        let base = base();
        assert_eq!(
            parse_control_path("trackID=1", &base).unwrap().as_str(),
            "rtsp://example.com/media.mp4/trackID=1"
        );
        assert_eq!(parse_control_path("*", &base).unwrap(), base);
        assert_eq!(
            parse_control_path("rtsp://other.com/x/track2", &base)
                .unwrap()
                .as_str(),
            "rtsp://other.com/x/track2"
        );

        let dir = Url::parse("rtsp://example.com/live/").unwrap();
        assert_eq!(
            parse_control_path("track1", &dir).unwrap().as_str(),
            "rtsp://example.com/live/track1"
        );
    }

    #[test]
    fn test_parse_description() {
        let sdp = "v=0\r\n\
o=- 0 0 IN IP4 127.0.0.1\r\n\
s=Test\r\n\
c=IN IP4 0.0.0.0\r\n\
t=0 0\r\n\
a=control:*\r\n\
a=range:npt=0-30.5\r\n\
m=audio 0 RTP/AVP 97\r\n\
a=rtpmap:97 mpeg4-generic/48000\r\n\
a=control:track1\r\n\
m=video 5000 RTP/AVP 26\r\n\
c=IN IP4 239.1.2.3/16\r\n\
a=control:track2\r\n\
m=text 0 RTP/AVP 98\r\n\
a=control:track3\r\n\
m=video 0 RTP/AVP 99\r\n\
a=control:track4\r\n";

        let desc = parse_description(sdp.as_bytes(), &base()).unwrap();
        assert_eq!(desc.aggregate_control, Some(base()));
        assert_eq!(
            desc.range,
            Some(Range::Npt(NptRange::FromTo(
                NptTime::Seconds(0, None),
                NptTime::Seconds(30, Some(500_000_000))
            )))
        );
        assert_eq!(desc.medias.len(), 2);
        assert_eq!(desc.medias[0].index, 0);
        assert!(desc.medias[0].protocols.is_empty());
        assert_eq!(
            desc.medias[0].control_url.as_str(),
            "rtsp://example.com/media.mp4/track1"
        );
        assert_eq!(desc.medias[1].protocols, Protocols::UDP_MCAST);
        assert_eq!(
            desc.skipped.iter().map(|(i, _)| *i).collect::<Vec<_>>(),
            vec![2, 3]
        );
    }

    #[test]
    fn test_parse_connections_unicast() {
        let sdp = sdp_types::Session::parse(
            b"v=0\r\no=- 0 0 IN IP6 ::1\r\ns=-\r\nc=IN IP6 2001:db8::1\r\nt=0 0\r\n",
        )
        .unwrap();
        let conns = sdp.connection.iter().cloned().collect::<Vec<_>>();
        let (protocols, is_ipv4) = parse_connections(&conns);
        assert_eq!(protocols, Protocols::UDP | Protocols::TCP);
        assert!(!is_ipv4);
    }
}
