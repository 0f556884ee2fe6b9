// RTSP Source 2 - RTP session manager interface
//
// Copyright (C) 2023-2024 Nirbheek Chauhan <nirbheek centricular com>
//
// This Source Code Form is subject to the terms of the Mozilla Public License, v2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at
// <https://mozilla.org/MPL/2.0/>.
//
// SPDX-License-Identifier: MPL-2.0

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, trace, warn};

use super::caps::Caps;
use super::stream::PayloadKind;
use super::transport::TransportConfig;

const UDP_PACKET_MAX_SIZE: usize = 65535;

/// What the session manager is told about a stream.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamDescription {
    pub id: u32,
    pub caps: Caps,
    pub transport: TransportConfig,
}

/// Sockets of a UDP stream, handed over to the session manager which owns them from then on.
#[derive(Debug)]
pub struct UdpStream {
    pub rtp: UdpSocket,
    pub rtcp: Option<UdpSocket>,
    /// Expected sender of RTP, when the server announced it.
    pub rtp_source: Option<SocketAddr>,
    /// Where to send RTCP, when known.
    pub rtcp_dest: Option<SocketAddr>,
    pub multicast: bool,
}

/// Reports that no UDP data arrived for a stream within the UDP timeout.
///
/// Reports are only delivered while the session is playing.
#[derive(Debug, Clone)]
pub struct UdpTimeoutNotifier {
    tx: mpsc::UnboundedSender<u32>,
    armed: Arc<AtomicBool>,
}

impl UdpTimeoutNotifier {
    pub(crate) fn channel() -> (Self, mpsc::UnboundedReceiver<u32>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let notifier = UdpTimeoutNotifier {
            tx,
            armed: Arc::new(AtomicBool::new(false)),
        };
        (notifier, rx)
    }

    pub(crate) fn arm(&self, armed: bool) {
        self.armed.store(armed, Ordering::SeqCst);
    }

    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::SeqCst)
    }

    pub fn notify(&self, stream_id: u32) {
        if self.is_armed() {
            let _ = self.tx.send(stream_id);
        } else {
            trace!("Dropping UDP timeout of stream {stream_id}, not playing");
        }
    }
}

/// Receives RTP/RTCP for the session, depayloads and jitter-buffers it.
pub trait RtpSessionManager: Send + Sync {
    fn register_stream(
        &self,
        stream: &StreamDescription,
        udp: Option<UdpStream>,
        timeout: UdpTimeoutNotifier,
    );
    fn update_stream(&self, id: u32, seq_base: Option<u16>, time_base: Option<u32>);
    fn unregister_stream(&self, id: u32);
    fn set_latency(&self, latency: Duration);
}

/// A packet received on a UDP socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpPacket {
    pub stream_id: u32,
    pub kind: PayloadKind,
    pub from: SocketAddr,
    pub data: Bytes,
}

/// Outgoing RTCP of one stream.
#[derive(Debug)]
enum RtcpOut {
    /// Sent from the stream's own RTCP socket by its RTCP task.
    Task(mpsc::Sender<Bytes>),
    /// Sent from the session-level socket.
    Shared(Arc<UdpSocket>, SocketAddr),
}

#[derive(Debug)]
struct ManagedStream {
    description: StreamDescription,
    seq_base: Option<u16>,
    time_base: Option<u32>,
    rtcp_out: Option<RtcpOut>,
    tasks: Vec<JoinHandle<()>>,
}

impl Drop for ManagedStream {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[derive(Debug)]
struct State {
    streams: HashMap<u32, ManagedStream>,
    latency: Duration,
    /// RTCP sender for streams without a socket of their own.
    rtcp_sender: Option<Arc<UdpSocket>>,
}

impl State {
    fn rtcp_sender(&mut self, dest: SocketAddr) -> std::io::Result<Arc<UdpSocket>> {
        if let Some(sender) = &self.rtcp_sender {
            if sender.local_addr()?.is_ipv4() == dest.is_ipv4() {
                return Ok(sender.clone());
            }
        }
        let any = if dest.is_ipv4() {
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        } else {
            IpAddr::V6(Ipv6Addr::UNSPECIFIED)
        };
        let socket = std::net::UdpSocket::bind(SocketAddr::new(any, 0))?;
        socket.set_nonblocking(true)?;
        let sender = Arc::new(UdpSocket::from_std(socket)?);
        debug!("Bound session RTCP sender to {:?}", sender.local_addr()?);
        self.rtcp_sender = Some(sender.clone());
        Ok(sender)
    }
}

/// Default session manager: reads the UDP sockets, forwards every packet on a channel and
/// reports UDP timeouts.
#[derive(Debug, Clone)]
pub struct UdpSessionManager {
    state: Arc<Mutex<State>>,
    udp_timeout: Duration,
    packets: mpsc::UnboundedSender<UdpPacket>,
}

impl UdpSessionManager {
    pub fn new(udp_timeout: Duration) -> (Self, mpsc::UnboundedReceiver<UdpPacket>) {
        let (packets, rx) = mpsc::unbounded_channel();
        let manager = UdpSessionManager {
            state: Arc::new(Mutex::new(State {
                streams: HashMap::new(),
                latency: Duration::ZERO,
                rtcp_sender: None,
            })),
            udp_timeout,
            packets,
        };
        (manager, rx)
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn registered(&self) -> Vec<u32> {
        let mut ids = self.state().streams.keys().copied().collect::<Vec<_>>();
        ids.sort_unstable();
        ids
    }

    pub fn stream_bases(&self, id: u32) -> Option<(Option<u16>, Option<u32>)> {
        self.state()
            .streams
            .get(&id)
            .map(|s| (s.seq_base, s.time_base))
    }

    pub fn latency(&self) -> Duration {
        self.state().latency
    }

    /// Queues an RTCP packet for the server. Returns false if the stream has no RTCP path.
    pub fn send_rtcp(&self, id: u32, data: Bytes) -> bool {
        let state = self.state();
        let Some(out) = state.streams.get(&id).and_then(|s| s.rtcp_out.as_ref()) else {
            return false;
        };
        match out {
            RtcpOut::Task(tx) => tx.try_send(data).is_ok(),
            RtcpOut::Shared(socket, dest) => match socket.try_send_to(&data, *dest) {
                Ok(_) => true,
                Err(err) => {
                    warn!("Failed to send RTCP for stream {id}: {err:?}");
                    false
                }
            },
        }
    }
}

impl RtpSessionManager for UdpSessionManager {
    fn register_stream(
        &self,
        stream: &StreamDescription,
        udp: Option<UdpStream>,
        timeout: UdpTimeoutNotifier,
    ) {
        let mut tasks = Vec::new();
        let mut rtcp_out = None;
        if let Some(udp) = udp {
            let id = stream.id;
            tasks.push(tokio::spawn(udp_rtp_task(
                id,
                udp.rtp,
                self.udp_timeout,
                udp.rtp_source,
                self.packets.clone(),
                timeout,
            )));
            if let Some(rtcp) = udp.rtcp {
                let (tx, rx) = mpsc::channel(1);
                rtcp_out = Some(RtcpOut::Task(tx));
                tasks.push(tokio::spawn(udp_rtcp_task(
                    id,
                    rtcp,
                    udp.rtcp_dest,
                    udp.multicast,
                    self.packets.clone(),
                    rx,
                )));
            } else if let Some(dest) = udp.rtcp_dest {
                match self.state().rtcp_sender(dest) {
                    Ok(sender) => rtcp_out = Some(RtcpOut::Shared(sender, dest)),
                    Err(err) => warn!("No RTCP sender for stream {id}: {err:?}"),
                }
            }
        }

        info!(
            "Registered stream {} ({}) with {:?}",
            stream.id, stream.caps, stream.transport
        );
        let previous = self.state().streams.insert(
            stream.id,
            ManagedStream {
                description: stream.clone(),
                seq_base: None,
                time_base: None,
                rtcp_out,
                tasks,
            },
        );
        if previous.is_some() {
            debug!("Replaced previous registration of stream {}", stream.id);
        }
    }

    fn update_stream(&self, id: u32, seq_base: Option<u16>, time_base: Option<u32>) {
        let mut state = self.state();
        let Some(stream) = state.streams.get_mut(&id) else {
            warn!("Update for unknown stream {id}");
            return;
        };
        debug!(
            "Stream {id} ({:?}) seq-base {seq_base:?} time-base {time_base:?}",
            stream.description.transport
        );
        stream.seq_base = seq_base.or(stream.seq_base);
        stream.time_base = time_base.or(stream.time_base);
    }

    fn unregister_stream(&self, id: u32) {
        if self.state().streams.remove(&id).is_some() {
            debug!("Unregistered stream {id}");
        }
    }

    fn set_latency(&self, latency: Duration) {
        debug!("Latency set to {latency:?}");
        self.state().latency = latency;
    }
}

async fn udp_rtp_task(
    stream_id: u32,
    socket: UdpSocket,
    timeout: Duration,
    sender_addr: Option<SocketAddr>,
    packets: mpsc::UnboundedSender<UdpPacket>,
    notifier: UdpTimeoutNotifier,
) {
    let mut buf = vec![0u8; UDP_PACKET_MAX_SIZE];
    let error = loop {
        match time::timeout(timeout, socket.recv_from(&mut buf)).await {
            Ok(Ok((len, addr))) => {
                // Ignore packets from the wrong sender
                if sender_addr.is_some_and(|s| s.ip() != addr.ip()) {
                    trace!("Ignoring RTP from {addr:?}");
                    continue;
                }
                trace!("received RTP packet from {addr:?}");
                let packet = UdpPacket {
                    stream_id,
                    kind: PayloadKind::Rtp,
                    from: addr,
                    data: Bytes::copy_from_slice(&buf[..len]),
                };
                if packets.send(packet).is_err() {
                    break "Packet receiver is gone".to_string();
                }
            }
            Ok(Err(err)) => break format!("UDP socket was closed: {err:?}"),
            Err(_elapsed) if notifier.is_armed() => {
                warn!("No data after {timeout:?} on stream {stream_id}");
                notifier.notify(stream_id);
            }
            Err(_elapsed) => trace!("No data on stream {stream_id} yet"),
        }
    };
    debug!("RTP task for stream {stream_id} stopped: {error}");
}

async fn udp_rtcp_task(
    stream_id: u32,
    socket: UdpSocket,
    mut sender_addr: Option<SocketAddr>,
    is_multicast: bool,
    packets: mpsc::UnboundedSender<UdpPacket>,
    mut outgoing: mpsc::Receiver<Bytes>,
) {
    let mut buf = vec![0u8; UDP_PACKET_MAX_SIZE];
    let error = loop {
        let res = tokio::select! {
            Some(data) = outgoing.recv() => {
                let Some(addr) = sender_addr else {
                    warn!("Can't send RTCP yet: don't have dest addr");
                    continue;
                };
                if let Err(err) = socket.send_to(&data, addr).await {
                    break format!("Failed to send RTCP: {err:?}");
                }
                trace!("Sent RTCP to {addr:?}");
                continue;
            }
            res = socket.recv_from(&mut buf) => res,
        };
        match res {
            Ok((len, addr)) => {
                match sender_addr {
                    // Ignore RTCP from the wrong sender
                    Some(sender) if !is_multicast && sender.ip() != addr.ip() => continue,
                    Some(_) => {}
                    None => {
                        sender_addr = Some(addr);
                        info!("Delayed RTCP UDP send address: {addr:?}");
                    }
                }
                let packet = UdpPacket {
                    stream_id,
                    kind: PayloadKind::Rtcp,
                    from: addr,
                    data: Bytes::copy_from_slice(&buf[..len]),
                };
                if packets.send(packet).is_err() {
                    break "Packet receiver is gone".to_string();
                }
            }
            Err(err) => break format!("UDP socket was closed: {err:?}"),
        }
    };
    debug!("RTCP task for stream {stream_id} stopped: {error}");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn description(id: u32, port: u16) -> StreamDescription {
        StreamDescription {
            id,
            caps: Caps {
                media: "video".to_string(),
                payload: 96,
                clock_rate: 90000,
                encoding_name: "H264".to_string(),
                encoding_params: None,
                fmtp: BTreeMap::new(),
                attributes: BTreeMap::new(),
            },
            transport: TransportConfig::Udp {
                local_rtp_port: port,
                local_rtcp_port: port + 1,
                remote_host: "127.0.0.1".to_string(),
                server_port: None,
            },
        }
    }

    #[tokio::test]
    async fn test_forward_and_timeout() {
        let (manager, mut packets) = UdpSessionManager::new(Duration::from_millis(200));
        let (notifier, mut timeouts) = UdpTimeoutNotifier::channel();
        notifier.arm(true);

        let rtp = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = rtp.local_addr().unwrap().port();
        manager.register_stream(
            &description(3, port),
            Some(UdpStream {
                rtp,
                rtcp: None,
                rtp_source: None,
                rtcp_dest: None,
                multicast: false,
            }),
            notifier,
        );
        assert_eq!(manager.registered(), vec![3]);

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender
            .send_to(&[0x80, 0x60, 0x00, 0x01], ("127.0.0.1", port))
            .await
            .unwrap();
        let packet = packets.recv().await.unwrap();
        assert_eq!(packet.stream_id, 3);
        assert_eq!(packet.kind, PayloadKind::Rtp);
        assert_eq!(packet.data.as_ref(), &[0x80, 0x60, 0x00, 0x01]);

        assert_eq!(timeouts.recv().await, Some(3));

        manager.update_stream(3, Some(400), None);
        assert_eq!(manager.stream_bases(3), Some((Some(400), None)));

        manager.unregister_stream(3);
        assert!(manager.registered().is_empty());
    }

    #[test]
    fn test_timeouts_only_while_armed() {
        let (notifier, mut timeouts) = UdpTimeoutNotifier::channel();
        notifier.notify(1);
        assert!(timeouts.try_recv().is_err());

        notifier.arm(true);
        notifier.notify(2);
        assert_eq!(timeouts.try_recv().ok(), Some(2));

        notifier.arm(false);
        notifier.notify(3);
        assert!(timeouts.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_rtcp_sent_from_stream_socket() {
        let (manager, _packets) = UdpSessionManager::new(Duration::from_secs(5));
        let (notifier, _timeouts) = UdpTimeoutNotifier::channel();
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let rtp = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let rtcp = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let rtcp_port = rtcp.local_addr().unwrap().port();
        manager.register_stream(
            &description(0, rtp.local_addr().unwrap().port()),
            Some(UdpStream {
                rtp,
                rtcp: Some(rtcp),
                rtp_source: None,
                rtcp_dest: Some(server.local_addr().unwrap()),
                multicast: false,
            }),
            notifier,
        );

        assert!(manager.send_rtcp(0, Bytes::from_static(&[0x81, 0xc9, 0x00, 0x01])));
        let mut buf = [0u8; 64];
        let (len, from) = server.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], &[0x81, 0xc9, 0x00, 0x01]);
        assert_eq!(from.port(), rtcp_port);

        assert!(!manager.send_rtcp(7, Bytes::from_static(&[0x81])));
    }

    #[tokio::test]
    async fn test_streams_share_session_rtcp_sender() {
        let (manager, _packets) = UdpSessionManager::new(Duration::from_secs(5));
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let dest = server.local_addr().unwrap();

        for id in 0..2 {
            let (notifier, _timeouts) = UdpTimeoutNotifier::channel();
            let rtp = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            manager.register_stream(
                &description(id, rtp.local_addr().unwrap().port()),
                Some(UdpStream {
                    rtp,
                    rtcp: None,
                    rtp_source: None,
                    rtcp_dest: Some(dest),
                    multicast: true,
                }),
                notifier,
            );
        }

        let mut buf = [0u8; 64];
        assert!(manager.send_rtcp(0, Bytes::from_static(&[0x81, 0xc9])));
        let (_, first) = server.recv_from(&mut buf).await.unwrap();
        assert!(manager.send_rtcp(1, Bytes::from_static(&[0x81, 0xc9])));
        let (_, second) = server.recv_from(&mut buf).await.unwrap();
        assert_eq!(first.port(), second.port());
    }
}
