// RTSP Source 2 - Lower transport negotiation
//
// Copyright (C) 2023-2024 Nirbheek Chauhan <nirbheek centricular com>
//
// This Source Code Form is subject to the terms of the Mozilla Public License, v2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at
// <https://mozilla.org/MPL/2.0/>.
//
// SPDX-License-Identifier: MPL-2.0
//
// https://www.rfc-editor.org/rfc/rfc2326.html#section-12.39

use std::convert::TryFrom;
use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

use rtsp_types::headers::{
    RtpLowerTransport, RtpProfile, RtpTransport, RtpTransportParameters, Transport, TransportMode,
    Transports,
};
use socket2::Socket;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use super::error::{ProtocolError, TransportError};
use super::manager::UdpStream;
use super::settings::Protocols;

/// Final lower transport of a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportConfig {
    Udp {
        local_rtp_port: u16,
        local_rtcp_port: u16,
        remote_host: String,
        server_port: Option<(u16, Option<u16>)>,
    },
    UdpMulticast {
        group: IpAddr,
        port_rtp: u16,
        port_rtcp: Option<u16>,
        ttl: Option<u8>,
    },
    TcpInterleaved {
        channel_rtp: u8,
        channel_rtcp: u8,
    },
}

impl TransportConfig {
    pub fn protocol(&self) -> Protocols {
        match self {
            TransportConfig::Udp { .. } => Protocols::UDP,
            TransportConfig::UdpMulticast { .. } => Protocols::UDP_MCAST,
            TransportConfig::TcpInterleaved { .. } => Protocols::TCP,
        }
    }
}

/// Transport chosen by the server, as found in a SETUP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportInfo {
    Tcp {
        channels: (u8, Option<u8>),
    },
    Udp {
        source: Option<String>,
        server_port: Option<(u16, Option<u16>)>,
        client_port: Option<(u16, Option<u16>)>,
    },
    UdpMulticast {
        dest: IpAddr,
        port: (u16, Option<u16>),
        ttl: Option<u8>,
    },
}

impl TryFrom<&RtpTransport> for TransportInfo {
    type Error = ProtocolError;

    fn try_from(t: &RtpTransport) -> Result<Self, Self::Error> {
        let invalid = |details: String| ProtocolError::InvalidResponse { details };

        match &t.lower_transport {
            Some(RtpLowerTransport::Tcp) => match t.params.interleaved {
                Some(channels) => Ok(TransportInfo::Tcp { channels }),
                None => Err(invalid(format!("Expected interleaved channels: {t:?}"))),
            },
            Some(RtpLowerTransport::Udp) | None => {
                if t.params.multicast {
                    let dest = t
                        .params
                        .destination
                        .as_ref()
                        .ok_or_else(|| invalid(format!("Need multicast dest addr: {:?}", t.params)))?
                        .parse::<IpAddr>()
                        .map_err(|err| invalid(format!("Failed to parse multicast dest addr: {err}")))?;
                    let port = t
                        .params
                        .port
                        .ok_or_else(|| invalid(format!("Need multicast UDP port(s): {:?}", t.params)))?;
                    Ok(TransportInfo::UdpMulticast {
                        dest,
                        port,
                        ttl: t.params.ttl,
                    })
                } else {
                    Ok(TransportInfo::Udp {
                        source: t.params.source.clone(),
                        server_port: t.params.server_port,
                        client_port: t.params.client_port,
                    })
                }
            }
            Some(RtpLowerTransport::Other(token)) => Err(ProtocolError::UnsupportedFeature {
                feature: format!("RTP lower transport {token:?}"),
            }),
        }
    }
}

impl TransportInfo {
    pub fn protocol(&self) -> Protocols {
        match self {
            TransportInfo::Tcp { .. } => Protocols::TCP,
            TransportInfo::Udp { .. } => Protocols::UDP,
            TransportInfo::UdpMulticast { .. } => Protocols::UDP_MCAST,
        }
    }
}

/// One alternative offered in a SETUP `Transport` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportClause {
    Multicast,
    Udp { rtp_port: u16, rtcp_port: u16 },
    Tcp { channels: (u8, u8) },
}

impl TransportClause {
    pub fn protocol(&self) -> Protocols {
        match self {
            TransportClause::Multicast => Protocols::UDP_MCAST,
            TransportClause::Udp { .. } => Protocols::UDP,
            TransportClause::Tcp { .. } => Protocols::TCP,
        }
    }

    pub fn to_transport(&self) -> Transport {
        let mode = vec![TransportMode::Play];
        let (lower_transport, params) = match *self {
            TransportClause::Multicast => (
                RtpLowerTransport::Udp,
                RtpTransportParameters {
                    mode,
                    multicast: true,
                    ..Default::default()
                },
            ),
            TransportClause::Udp { rtp_port, rtcp_port } => (
                RtpLowerTransport::Udp,
                RtpTransportParameters {
                    mode,
                    unicast: true,
                    client_port: Some((rtp_port, Some(rtcp_port))),
                    ..Default::default()
                },
            ),
            TransportClause::Tcp { channels: (rtp, rtcp) } => (
                RtpLowerTransport::Tcp,
                RtpTransportParameters {
                    mode,
                    unicast: true,
                    interleaved: Some((rtp, Some(rtcp))),
                    ..Default::default()
                },
            ),
        };
        // RTSP 2.0 adds AVPF and more
        Transport::Rtp(RtpTransport {
            profile: RtpProfile::Avp,
            lower_transport: Some(lower_transport),
            params,
        })
    }

    /// What the server would have answered if it omitted the `Transport` header.
    fn implied_info(&self) -> Option<TransportInfo> {
        match *self {
            TransportClause::Multicast => None,
            TransportClause::Udp { rtp_port, rtcp_port } => Some(TransportInfo::Udp {
                source: None,
                server_port: None,
                client_port: Some((rtp_port, Some(rtcp_port))),
            }),
            TransportClause::Tcp { channels: (rtp, rtcp) } => Some(TransportInfo::Tcp {
                channels: (rtp, Some(rtcp)),
            }),
        }
    }
}

impl fmt::Display for TransportClause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportClause::Multicast => write!(f, "RTP/AVP;multicast"),
            TransportClause::Udp { rtp_port, rtcp_port } => {
                write!(f, "RTP/AVP;unicast;client_port={rtp_port}-{rtcp_port}")
            }
            TransportClause::Tcp {
                channels: (rtp, rtcp),
            } => write!(f, "RTP/AVP/TCP;unicast;interleaved={rtp}-{rtcp}"),
        }
    }
}

/// Hands out interleaved channel pairs for one session.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ChannelAllocator {
    next: u8,
}

impl ChannelAllocator {
    /// Next free pair, without reserving it.
    pub fn peek_pair(&self) -> Option<(u8, u8)> {
        Some((self.next, self.next.checked_add(1)?))
    }

    /// Marks the channels the server settled on as used.
    pub fn commit(&mut self, rtp: u8, rtcp: u8) {
        let after = rtp.max(rtcp).saturating_add(1);
        if after > self.next {
            self.next = after;
        }
    }

    pub fn reset(&mut self) {
        self.next = 0;
    }
}

/// Bound RTP/RTCP socket pair; RTP on an even port and RTCP on the next one.
#[derive(Debug)]
pub struct UdpPortPair {
    pub rtp: UdpSocket,
    pub rtcp: UdpSocket,
    pub rtp_port: u16,
    pub rtcp_port: u16,
}

/// Binds a UDP socket on all interfaces. Only multicast receivers share their port.
fn bind_port(port: u16, is_ipv4: bool, reuse: bool) -> io::Result<UdpSocket> {
    let domain = if is_ipv4 {
        socket2::Domain::IPV4
    } else {
        socket2::Domain::IPV6
    };
    let sock = Socket::new(domain, socket2::Type::DGRAM, Some(socket2::Protocol::UDP))?;
    if reuse {
        let _ = sock.set_reuse_address(true);
        #[cfg(unix)]
        let _ = sock.set_reuse_port(true);
    }
    sock.set_nonblocking(true)?;
    let addr: SocketAddr = if is_ipv4 {
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port))
    } else {
        SocketAddr::V6(SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, port, 0, 0))
    };
    sock.bind(&addr.into())?;

    let socket = UdpSocket::from_std(sock.into())?;
    debug!("Bound to UDP port {}", socket.local_addr()?.port());
    Ok(socket)
}

/// Binds an even RTP port and its odd RTCP companion, starting at `start` (0 lets the OS
/// pick) and giving up after `retries` failed pairs.
pub fn bind_port_pair(start: u16, retries: u16, is_ipv4: bool) -> Result<UdpPortPair, TransportError> {
    let os_chosen = start == 0;
    let mut candidate = start;

    for _ in 0..=retries {
        let rtp = match bind_port(candidate, is_ipv4, false) {
            Ok(rtp) => rtp,
            Err(err) => {
                debug!("Failed to bind to {candidate}: {err:?}, trying next");
                candidate = match candidate.checked_add(2) {
                    Some(next) if !os_chosen => next,
                    Some(_) => 0,
                    None => break,
                };
                continue;
            }
        };
        let rtp_port = rtp.local_addr()?.port();

        if rtp_port % 2 != 0 {
            debug!("Got odd RTP port {rtp_port}, retrying with the next even one");
            drop(rtp);
            candidate = match rtp_port.checked_add(1) {
                Some(next) => next,
                None => break,
            };
            continue;
        }

        let Some(rtcp_port) = rtp_port.checked_add(1) else {
            break;
        };
        match bind_port(rtcp_port, is_ipv4, false) {
            Ok(rtcp) => {
                return Ok(UdpPortPair {
                    rtp,
                    rtcp,
                    rtp_port,
                    rtcp_port,
                })
            }
            Err(err) => {
                debug!("Failed to bind RTCP port {rtcp_port}: {err:?}, trying next pair");
                candidate = match rtp_port.checked_add(2) {
                    Some(_) if os_chosen => 0,
                    Some(next) => next,
                    None => break,
                };
            }
        }
    }

    Err(TransportError::PortAllocation { start, retries })
}

/// Transports and resources prepared for one SETUP request.
#[derive(Debug)]
pub struct SetupOffer {
    pub clauses: Vec<TransportClause>,
    pub ports: Option<UdpPortPair>,
}

impl SetupOffer {
    /// Builds one clause per allowed lower transport, in priority order.
    ///
    /// UDP is dropped from the offer when no port pair can be bound.
    pub fn new(
        protocols: Protocols,
        is_ipv4: bool,
        port_start: u16,
        port_retry: u16,
        channels: &ChannelAllocator,
    ) -> Self {
        let mut clauses = Vec::new();
        let mut ports = None;

        for protocol in protocols.priority_order() {
            if protocol == Protocols::UDP_MCAST {
                clauses.push(TransportClause::Multicast);
            } else if protocol == Protocols::UDP {
                match bind_port_pair(port_start, port_retry, is_ipv4) {
                    Ok(pair) => {
                        clauses.push(TransportClause::Udp {
                            rtp_port: pair.rtp_port,
                            rtcp_port: pair.rtcp_port,
                        });
                        ports = Some(pair);
                    }
                    Err(err) => warn!("Not offering UDP: {err}"),
                }
            } else if let Some(pair) = channels.peek_pair() {
                clauses.push(TransportClause::Tcp { channels: pair });
            } else {
                warn!("Out of interleaved channels, not offering TCP");
            }
        }

        SetupOffer { clauses, ports }
    }

    pub fn transports(&self) -> Transports {
        let transports = self
            .clauses
            .iter()
            .map(TransportClause::to_transport)
            .collect::<Vec<_>>();
        transports.as_slice().into()
    }

    /// Picks the server's answer, preferring our priority order among the offered ones.
    pub fn select(&self, response: Option<&Transports>) -> Result<TransportInfo, ProtocolError> {
        let Some(transports) = response else {
            // Transport header in response is optional if only one transport was offered
            return match self.clauses.as_slice() {
                [only] => only.implied_info().ok_or_else(|| ProtocolError::MissingHeader {
                    header: "Transport".to_string(),
                }),
                _ => Err(ProtocolError::MissingHeader {
                    header: "Transport".to_string(),
                }),
            };
        };

        let mut last_error = ProtocolError::InvalidResponse {
            details: "No transport in SETUP response matches the offered ones".to_string(),
        };
        let mut parsed = Vec::new();
        for transport in transports.iter() {
            let Transport::Rtp(t) = transport else {
                last_error = ProtocolError::InvalidResponse {
                    details: format!("Expected RTP transport, got {transport:?}"),
                };
                continue;
            };
            if !t.params.mode.is_empty() && !t.params.mode.contains(&TransportMode::Play) {
                last_error = ProtocolError::InvalidResponse {
                    details: format!("Server modes {:?} don't include PLAY", t.params.mode),
                };
                continue;
            }
            match TransportInfo::try_from(t) {
                Ok(info) => parsed.push(info),
                Err(err) => last_error = err,
            }
        }

        for clause in &self.clauses {
            if let Some(pos) = parsed.iter().position(|p| p.protocol() == clause.protocol()) {
                return Ok(parsed.swap_remove(pos));
            }
        }
        Err(last_error)
    }
}

fn resolve_ip(host: Option<&str>, fallback: IpAddr) -> IpAddr {
    host.and_then(|h| h.trim_matches(|c| c == '[' || c == ']').parse::<IpAddr>().ok())
        .unwrap_or(fallback)
}

fn bind_multicast(
    group: IpAddr,
    port: (u16, Option<u16>),
    ttl: Option<u8>,
) -> Result<UdpStream, TransportError> {
    let (rtp_port, rtcp_port) = port;
    let rtp = bind_port(rtp_port, group.is_ipv4(), true)?;
    let rtcp = rtcp_port.and_then(|p| {
        bind_port(p, group.is_ipv4(), true)
            .map_err(|err| warn!("Could not bind to RTCP port: {err:?}"))
            .ok()
    });

    for socket in std::iter::once(&rtp).chain(rtcp.iter()) {
        match group {
            IpAddr::V4(addr) => {
                socket.join_multicast_v4(addr, Ipv4Addr::UNSPECIFIED)?;
                if let Some(ttl) = ttl {
                    let _ = socket.set_multicast_ttl_v4(ttl as u32);
                }
            }
            IpAddr::V6(addr) => socket.join_multicast_v6(&addr, 0)?,
        }
    }
    info!("Joined multicast group {group} on ports {port:?}");

    Ok(UdpStream {
        rtp,
        rtcp,
        rtp_source: None,
        rtcp_dest: rtcp_port.map(|p| SocketAddr::new(group, p)),
        multicast: true,
    })
}

/// Turns the server's choice into the stream's final transport and, for UDP, the sockets
/// to hand to the session manager.
pub fn finalize(
    info: TransportInfo,
    ports: Option<UdpPortPair>,
    peer: IpAddr,
    channels: &mut ChannelAllocator,
) -> Result<(TransportConfig, Option<UdpStream>), TransportError> {
    match info {
        TransportInfo::Tcp {
            channels: (rtp, rtcp),
        } => {
            let rtcp = rtcp.unwrap_or_else(|| rtp.saturating_add(1));
            if let Some((offered, _)) = channels.peek_pair() {
                if offered != rtp {
                    info!("RTP channel changed: {offered} -> {rtp}");
                }
            }
            channels.commit(rtp, rtcp);
            Ok((
                TransportConfig::TcpInterleaved {
                    channel_rtp: rtp,
                    channel_rtcp: rtcp,
                },
                None,
            ))
        }
        TransportInfo::Udp {
            source,
            server_port,
            client_port,
        } => {
            let Some(pair) = ports else {
                return Err(TransportError::Negotiation {
                    reason: "Server chose UDP but no ports were offered".to_string(),
                });
            };
            // There is no reason for the server to reject the client ports we selected, so
            // if it does, just ignore it.
            if let Some((rtp_port, _)) = client_port {
                if rtp_port != pair.rtp_port {
                    warn!("RTP port changed: {} -> {rtp_port}, ignoring", pair.rtp_port);
                }
            }

            let remote = resolve_ip(source.as_deref(), peer);
            let rtp_source = server_port.map(|(rtp, _)| SocketAddr::new(remote, rtp));
            let rtcp_dest = server_port.map(|(rtp, rtcp)| {
                SocketAddr::new(remote, rtcp.unwrap_or_else(|| rtp.saturating_add(1)))
            });

            Ok((
                TransportConfig::Udp {
                    local_rtp_port: pair.rtp_port,
                    local_rtcp_port: pair.rtcp_port,
                    remote_host: source.unwrap_or_else(|| peer.to_string()),
                    server_port,
                },
                Some(UdpStream {
                    rtp: pair.rtp,
                    rtcp: Some(pair.rtcp),
                    rtp_source,
                    rtcp_dest,
                    multicast: false,
                }),
            ))
        }
        TransportInfo::UdpMulticast { dest, port, ttl } => {
            drop(ports);
            let udp = bind_multicast(dest, port, ttl)?;
            Ok((
                TransportConfig::UdpMulticast {
                    group: dest,
                    port_rtp: port.0,
                    port_rtcp: port.1,
                    ttl,
                },
                Some(udp),
            ))
        }
    }
}
