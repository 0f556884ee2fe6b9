// RTSP Source 2 - Stream registry
//
// Copyright (C) 2023-2024 Nirbheek Chauhan <nirbheek centricular com>
//
// This Source Code Form is subject to the terms of the Mozilla Public License, v2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at
// <https://mozilla.org/MPL/2.0/>.
//
// SPDX-License-Identifier: MPL-2.0

use std::fmt;

use bytes::Bytes;
use rtsp_types::headers::rtp_info::v1::RtpInfo;
use tokio::sync::mpsc;
use tracing::{debug, trace};
use url::Url;

use super::caps::Caps;
use super::flow::{combine, FlowResult};
use super::range::url_matches;
use super::sdp::MediaDescription;
use super::settings::Protocols;
use super::transport::TransportConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PayloadKind {
    Rtp,
    Rtcp,
}

/// Consumer of the interleaved data of one stream.
pub trait StreamSink: Send {
    fn push(&mut self, kind: PayloadKind, data: Bytes) -> FlowResult;
}

impl StreamSink for mpsc::UnboundedSender<(PayloadKind, Bytes)> {
    fn push(&mut self, kind: PayloadKind, data: Bytes) -> FlowResult {
        match self.send((kind, data)) {
            Ok(()) => FlowResult::Ok,
            Err(_) => FlowResult::NotLinked,
        }
    }
}

/// RTCP SR, RR, SDES, BYE and APP with version 2.
pub fn looks_like_rtcp(data: &[u8]) -> bool {
    data.len() >= 4 && data[0] >> 6 == 2 && (200..=204).contains(&data[1])
}

pub struct Stream {
    pub id: u32,
    pub payload_type: u8,
    pub caps: Caps,
    pub control_url: Url,
    /// URL the SETUP was sent to.
    pub setup_url: Option<Url>,
    /// Shares its payload type with an earlier stream, data goes to that stream's sink.
    pub container: bool,
    pub transport: Option<TransportConfig>,
    pub channel: Option<(u8, u8)>,
    pub seq_base: Option<u16>,
    pub time_base: Option<u32>,
    pub disabled: bool,
    pub last_flow: FlowResult,
    /// Transports allowed by the SDP connection lines, empty when unconstrained.
    pub protocols: Protocols,
    pub is_ipv4: bool,
    sink: Option<Box<dyn StreamSink>>,
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id)
            .field("payload_type", &self.payload_type)
            .field("control_url", &self.control_url.as_str())
            .field("container", &self.container)
            .field("transport", &self.transport)
            .field("channel", &self.channel)
            .field("disabled", &self.disabled)
            .field("last_flow", &self.last_flow)
            .field("has_sink", &self.sink.is_some())
            .finish()
    }
}

impl Stream {
    pub fn new(media: MediaDescription) -> Self {
        Stream {
            id: media.index,
            payload_type: media.caps.payload,
            caps: media.caps,
            control_url: media.control_url,
            setup_url: None,
            container: false,
            transport: None,
            channel: None,
            seq_base: None,
            time_base: None,
            disabled: false,
            last_flow: FlowResult::Ok,
            protocols: media.protocols,
            is_ipv4: media.is_ipv4,
            sink: None,
        }
    }

    pub fn is_active(&self) -> bool {
        !self.disabled && !self.container
    }

    fn matches_url(&self, url: &Url) -> bool {
        url_matches(url, &self.control_url)
            || self
                .setup_url
                .as_ref()
                .is_some_and(|setup| url_matches(url, setup))
    }
}

/// Single owner of all streams of a session; everyone else refers to them by id.
#[derive(Debug, Default)]
pub struct StreamRegistry {
    streams: Vec<Stream>,
}

impl StreamRegistry {
    /// Adds a stream. Returns `false` if it duplicates the dynamic payload type of an
    /// earlier stream and was marked as container.
    pub fn add(&mut self, media: MediaDescription) -> bool {
        let mut stream = Stream::new(media);
        stream.container = stream.payload_type >= 96
            && self
                .streams
                .iter()
                .any(|s| s.payload_type == stream.payload_type);
        if stream.container {
            debug!(
                "Stream {} repeats payload type {}, marking as container",
                stream.id, stream.payload_type
            );
        }
        let exposed = !stream.container;
        self.streams.push(stream);
        exposed
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    pub fn clear(&mut self) {
        self.streams.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &Stream> {
        self.streams.iter()
    }

    pub fn get(&self, id: u32) -> Option<&Stream> {
        self.streams.iter().find(|s| s.id == id)
    }

    pub fn get_mut(&mut self, id: u32) -> Option<&mut Stream> {
        self.streams.iter_mut().find(|s| s.id == id)
    }

    pub fn ids(&self) -> Vec<u32> {
        self.streams.iter().map(|s| s.id).collect()
    }

    pub fn attach_sink(&mut self, id: u32, sink: Box<dyn StreamSink>) -> bool {
        match self.get_mut(id) {
            Some(stream) => {
                stream.sink = Some(sink);
                stream.last_flow = FlowResult::Ok;
                true
            }
            None => false,
        }
    }

    /// Takes all sinks, keyed by stream id.
    pub fn take_sinks(&mut self) -> Vec<(u32, Box<dyn StreamSink>)> {
        self.streams
            .iter_mut()
            .filter_map(|s| s.sink.take().map(|sink| (s.id, sink)))
            .collect()
    }

    fn find_channel(&self, channel: u8) -> Option<(usize, PayloadKind)> {
        self.streams.iter().enumerate().find_map(|(idx, s)| {
            let (rtp, rtcp) = s.channel?;
            if channel == rtp {
                Some((idx, PayloadKind::Rtp))
            } else if channel == rtcp {
                Some((idx, PayloadKind::Rtcp))
            } else {
                None
            }
        })
    }

    fn classify(&self, channel: u8, data: &[u8]) -> Option<(usize, PayloadKind)> {
        match self.find_channel(channel) {
            Some((idx, PayloadKind::Rtp)) if looks_like_rtcp(data) => {
                Some((idx, PayloadKind::Rtcp))
            }
            Some(found) => Some(found),
            // Some servers send RTCP on rtp channel + 1 without announcing it
            None if looks_like_rtcp(data) && channel > 0 => self
                .find_channel(channel - 1)
                .filter(|(_, kind)| *kind == PayloadKind::Rtp)
                .map(|(idx, _)| (idx, PayloadKind::Rtcp)),
            None => None,
        }
    }

    /// Delivers one interleaved frame. Returns the flow of the stream that took it, `None`
    /// if the frame was dropped.
    pub fn route(&mut self, channel: u8, data: Bytes) -> Option<FlowResult> {
        let Some((mut idx, kind)) = self.classify(channel, &data) else {
            trace!(
                "Ignored data of size {}: unknown channel {channel}",
                data.len()
            );
            return None;
        };

        if self.streams[idx].container {
            let pt = self.streams[idx].payload_type;
            idx = self
                .streams
                .iter()
                .position(|s| !s.container && s.payload_type == pt)?;
        }

        let stream = &mut self.streams[idx];
        if stream.disabled {
            return None;
        }
        trace!("Received {kind:?} on channel {channel} for stream {}", stream.id);
        let flow = match stream.sink.as_mut() {
            Some(sink) => sink.push(kind, data),
            None => FlowResult::NotLinked,
        };
        stream.last_flow = flow;
        Some(flow)
    }

    pub fn combined_flow(&self) -> FlowResult {
        combine(
            self.streams
                .iter()
                .filter(|s| s.is_active())
                .map(|s| s.last_flow),
        )
    }

    /// Updates sequence and time bases from `RTP-Info` entries. Returns the ids of the
    /// updated streams.
    pub fn apply_rtp_info(&mut self, infos: &[RtpInfo]) -> Vec<u32> {
        let mut updated = Vec::new();
        for info in infos {
            let Some(stream) = self.streams.iter_mut().find(|s| s.matches_url(&info.uri)) else {
                debug!("No stream for RTP-Info url {}", info.uri);
                continue;
            };
            if info.seq.is_some() {
                stream.seq_base = info.seq;
            }
            if info.rtptime.is_some() {
                stream.time_base = info.rtptime;
            }
            updated.push(stream.id);
        }
        updated
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn media(index: u32, pt: u8, control: &str) -> MediaDescription {
        MediaDescription {
            index,
            caps: Caps {
                media: "video".to_string(),
                payload: pt,
                clock_rate: 90000,
                encoding_name: "H264".to_string(),
                encoding_params: None,
                fmtp: BTreeMap::new(),
                attributes: BTreeMap::new(),
            },
            control_url: Url::parse(control).unwrap(),
            protocols: Protocols::empty(),
            is_ipv4: true,
        }
    }

    #[test]
    fn test_duplicate_dynamic_pt_is_container() {
        let mut registry = StreamRegistry::default();
        assert!(registry.add(media(0, 96, "rtsp://h/s/track1")));
        assert!(registry.add(media(1, 26, "rtsp://h/s/track2")));
        assert!(!registry.add(media(2, 96, "rtsp://h/s/track3")));
        assert!(registry.add(media(3, 26, "rtsp://h/s/track4")));
        assert!(registry.get(2).unwrap().container);
        assert!(!registry.get(3).unwrap().container);
    }

    #[test]
    fn test_route_and_flow() {
        let mut registry = StreamRegistry::default();
        registry.add(media(0, 96, "rtsp://h/s/track1"));
        registry.add(media(1, 97, "rtsp://h/s/track2"));
        registry.get_mut(0).unwrap().channel = Some((0, 1));
        registry.get_mut(1).unwrap().channel = Some((2, 3));

        let (tx, mut rx) = mpsc::unbounded_channel();
        assert!(registry.attach_sink(0, Box::new(tx)));

        let rtp = Bytes::from_static(&[0x80, 0x60, 0x00, 0x01]);
        assert_eq!(registry.route(0, rtp.clone()), Some(FlowResult::Ok));
        assert_eq!(rx.try_recv().unwrap(), (PayloadKind::Rtp, rtp));

        // Receiver report on the RTP channel
        let rr = Bytes::from_static(&[0x81, 201, 0x00, 0x07]);
        registry.route(0, rr.clone());
        assert_eq!(rx.try_recv().unwrap(), (PayloadKind::Rtcp, rr.clone()));

        assert_eq!(registry.route(9, rr), None);
        assert_eq!(
            registry.route(2, Bytes::from_static(&[0x80, 0x61])),
            Some(FlowResult::NotLinked)
        );
        assert_eq!(registry.combined_flow(), FlowResult::Ok);

        drop(rx);
        registry.route(0, Bytes::from_static(&[0x80, 0x60]));
        assert_eq!(registry.combined_flow(), FlowResult::NotLinked);
    }

    #[test]
    fn test_unannounced_rtcp_channel() {
        let mut registry = StreamRegistry::default();
        registry.add(media(0, 96, "rtsp://h/s/track1"));
        registry.get_mut(0).unwrap().channel = Some((4, 6));

        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.attach_sink(0, Box::new(tx));
        let sr = Bytes::from_static(&[0x80, 200, 0x00, 0x06]);
        assert_eq!(registry.route(5, sr), Some(FlowResult::Ok));
        assert_eq!(rx.try_recv().unwrap().0, PayloadKind::Rtcp);
    }

    #[test]
    fn test_rtp_info_suffix_match() {
        let mut registry = StreamRegistry::default();
        registry.add(media(0, 96, "rtsp://h/s/track1"));
        registry.add(media(1, 97, "rtsp://h/s/track11"));

        let updated = registry.apply_rtp_info(&[RtpInfo {
            uri: Url::parse("rtsp://h/s/track1").unwrap(),
            seq: Some(400),
            rtptime: Some(90000),
        }]);
        assert_eq!(updated, vec![0]);
        assert_eq!(registry.get(0).unwrap().seq_base, Some(400));
        assert_eq!(registry.get(0).unwrap().time_base, Some(90000));
        assert_eq!(registry.get(1).unwrap().seq_base, None);
    }
}
