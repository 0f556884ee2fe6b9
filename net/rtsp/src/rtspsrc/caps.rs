// RTSP Source 2 - RTP capabilities from SDP
//
// Copyright (C) 2023-2024 Nirbheek Chauhan <nirbheek centricular com>
//
// This Source Code Form is subject to the terms of the Mozilla Public License, v2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at
// <https://mozilla.org/MPL/2.0/>.
//
// SPDX-License-Identifier: MPL-2.0

use std::collections::BTreeMap;
use std::fmt;

use sdp_types::{Attribute, Media};

use super::error::MediaError;

const SKIP_ATTRIBUTES: [&str; 4] = ["control", "range", "rtpmap", "fmtp"];

/// Description of one RTP stream, as needed by depayloaders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caps {
    pub media: String,
    pub payload: u8,
    pub clock_rate: u32,
    pub encoding_name: String,
    pub encoding_params: Option<String>,
    pub fmtp: BTreeMap<String, String>,
    /// Remaining session and media level attributes, media level winning.
    pub attributes: BTreeMap<String, String>,
}

impl fmt::Display for Caps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "application/x-rtp, media={}, payload={}, clock-rate={}, encoding-name={}",
            self.media, self.payload, self.clock_rate, self.encoding_name
        )?;
        if let Some(params) = &self.encoding_params {
            write!(f, ", encoding-params={params}")?;
        }
        for (k, v) in &self.fmtp {
            write!(f, ", {k}={v}")?;
        }
        Ok(())
    }
}

struct StaticPayload {
    media: &'static str,
    encoding_name: &'static str,
    clock_rate: u32,
    channels: Option<&'static str>,
}

const fn audio(encoding_name: &'static str, clock_rate: u32) -> Option<StaticPayload> {
    Some(StaticPayload {
        media: "audio",
        encoding_name,
        clock_rate,
        channels: None,
    })
}

const fn video(encoding_name: &'static str) -> Option<StaticPayload> {
    Some(StaticPayload {
        media: "video",
        encoding_name,
        clock_rate: 90000,
        channels: None,
    })
}

// RFC 3551 section 6
fn static_payload(pt: u8) -> Option<StaticPayload> {
    match pt {
        0 => audio("PCMU", 8000),
        3 => audio("GSM", 8000),
        4 => audio("G723", 8000),
        5 => audio("DVI4", 8000),
        6 => audio("DVI4", 16000),
        7 => audio("LPC", 8000),
        8 => audio("PCMA", 8000),
        9 => audio("G722", 8000),
        10 => Some(StaticPayload {
            channels: Some("2"),
            ..audio("L16", 44100)?
        }),
        11 => audio("L16", 44100),
        12 => audio("QCELP", 8000),
        13 => audio("CN", 8000),
        14 => audio("MPA", 90000),
        15 => audio("G728", 8000),
        16 => audio("DVI4", 11025),
        17 => audio("DVI4", 22050),
        18 => audio("G729", 8000),
        25 => video("CELB"),
        26 => video("JPEG"),
        28 => video("NV"),
        31 => video("H261"),
        32 => video("MPV"),
        33 => video("MP2T"),
        34 => video("H263"),
        _ => None,
    }
}

fn find_pt_attribute<'a>(attributes: &'a [Attribute], name: &str, pt: u8) -> Option<&'a str> {
    let prefix = pt.to_string();
    attributes
        .iter()
        .filter(|a| a.attribute == name)
        .filter_map(|a| a.value.as_deref())
        .find_map(|v| {
            let (first, rest) = v.trim().split_once(char::is_whitespace)?;
            (first == prefix).then_some(rest.trim())
        })
}

/// Parses `<encoding>/<clock-rate>[/<params>]`.
fn parse_rtpmap(value: &str) -> Option<(String, u32, Option<String>)> {
    let mut parts = value.split('/');
    let name = parts.next()?.trim();
    if name.is_empty() {
        return None;
    }
    let clock_rate = parts.next()?.trim().parse::<u32>().ok()?;
    let params = parts
        .next()
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty());
    Some((name.to_ascii_uppercase(), clock_rate, params))
}

fn parse_fmtp(value: &str) -> BTreeMap<String, String> {
    value
        .split(';')
        .filter_map(|kv| {
            let (k, v) = kv.split_once('=')?;
            let k = k.trim().to_ascii_lowercase();
            (!k.is_empty()).then(|| (k, v.trim().to_string()))
        })
        .collect()
}

/// First payload type of a media description.
pub fn media_payload_type(media: &Media) -> Result<u8, MediaError> {
    media
        .fmt
        .split_whitespace()
        .next()
        .and_then(|pt| pt.parse::<u8>().ok())
        .filter(|pt| *pt < 128)
        .ok_or_else(|| MediaError::InvalidMediaFormat {
            details: format!("Invalid payload type '{}'", media.fmt),
        })
}

/// Builds the caps of one media description.
///
/// Static payload types come with a clock rate, dynamic ones need an `rtpmap`.
pub fn caps_from_media(media: &Media, session_attributes: &[Attribute]) -> Result<Caps, MediaError> {
    let pt = media_payload_type(media)?;
    let media_type = media.media.to_ascii_lowercase();

    let (encoding_name, clock_rate, encoding_params) =
        match find_pt_attribute(&media.attributes, "rtpmap", pt).and_then(parse_rtpmap) {
            Some(rtpmap) => rtpmap,
            None => {
                let s = static_payload(pt).ok_or(MediaError::NoClockRate { pt })?;
                if s.media != media_type {
                    tracing::debug!(
                        "Static payload type {pt} is {} but media is {media_type}",
                        s.media
                    );
                }
                (
                    s.encoding_name.to_string(),
                    s.clock_rate,
                    s.channels.map(str::to_string),
                )
            }
        };

    let fmtp = find_pt_attribute(&media.attributes, "fmtp", pt)
        .map(parse_fmtp)
        .unwrap_or_default();

    let attributes = session_attributes
        .iter()
        .chain(media.attributes.iter())
        .filter(|a| !SKIP_ATTRIBUTES.contains(&a.attribute.as_str()))
        .map(|a| (a.attribute.clone(), a.value.clone().unwrap_or_default()))
        .collect();

    Ok(Caps {
        media: media_type,
        payload: pt,
        clock_rate,
        encoding_name,
        encoding_params,
        fmtp,
        attributes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SDP: &str = "v=0\r\n\
o=- 0 0 IN IP4 127.0.0.1\r\n\
s=Test\r\n\
c=IN IP4 0.0.0.0\r\n\
t=0 0\r\n\
a=tool:test\r\n\
m=audio 0 RTP/AVP 97\r\n\
a=rtpmap:97 mpeg4-generic/48000/2\r\n\
a=fmtp:97 streamtype=5; profile-level-id=15; mode=AAC-hbr; config=1190\r\n\
a=control:track1\r\n\
m=video 0 RTP/AVP 26\r\n\
a=control:track2\r\n\
m=video 0 RTP/AVP 96\r\n\
a=control:track3\r\n";

    #[test]
    fn test_caps_from_media() {
        let sdp = sdp_types::Session::parse(SDP.as_bytes()).unwrap();

        let audio = caps_from_media(&sdp.medias[0], &sdp.attributes).unwrap();
        assert_eq!(audio.media, "audio");
        assert_eq!(audio.payload, 97);
        assert_eq!(audio.clock_rate, 48000);
        assert_eq!(audio.encoding_name, "MPEG4-GENERIC");
        assert_eq!(audio.encoding_params.as_deref(), Some("2"));
        assert_eq!(audio.fmtp["mode"], "AAC-hbr");
        assert_eq!(audio.fmtp["config"], "1190");
        assert_eq!(audio.attributes["tool"], "test");
        assert!(!audio.attributes.contains_key("control"));

        let video = caps_from_media(&sdp.medias[1], &sdp.attributes).unwrap();
        assert_eq!(video.payload, 26);
        assert_eq!(video.clock_rate, 90000);
        assert_eq!(video.encoding_name, "JPEG");

        assert!(matches!(
            caps_from_media(&sdp.medias[2], &sdp.attributes),
            Err(MediaError::NoClockRate { pt: 96 })
        ));
    }

    #[test]
    fn test_static_table() {
        assert_eq!(static_payload(0).unwrap().clock_rate, 8000);
        assert_eq!(static_payload(10).unwrap().channels, Some("2"));
        assert_eq!(static_payload(33).unwrap().encoding_name, "MP2T");
        assert!(static_payload(2).is_none());
        assert!(static_payload(96).is_none());
    }
}
