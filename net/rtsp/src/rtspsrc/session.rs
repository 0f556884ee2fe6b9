// RTSP Source 2 - Session state machine
//
// Copyright (C) 2023-2024 Nirbheek Chauhan <nirbheek centricular com>
//
// This Source Code Form is subject to the terms of the Mozilla Public License, v2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at
// <https://mozilla.org/MPL/2.0/>.
//
// SPDX-License-Identifier: MPL-2.0

use std::fmt;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use bitflags::bitflags;
use rtsp_types::headers::{
    Public, Range, RtpInfos, Scale, Session, Transports, ACCEPT, CONTENT_TYPE,
};
use rtsp_types::{Method, Request, Response, StatusCode, Version};
use tokio::sync::{mpsc, watch, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use url::Url;

use super::auth::AuthState;
use super::body::Body;
use super::caps::Caps;
use super::connection::{ConnError, Connection, FlushToken};
use super::dispatch::{self, Command};
use super::error::{ConfigurationError, MediaError, ProtocolError, RtspError, TransportError};
use super::events::{Event, EventSender};
use super::flow::FlowResult;
use super::keepalive::KeepAliveMethod;
use super::manager::{RtpSessionManager, StreamDescription, UdpTimeoutNotifier};
use super::range::{play_range, SeekFlags, Segment};
use super::sdp::{base_url, check_content_type, parse_description};
use super::settings::{Protocols, Settings};
use super::stream::{StreamRegistry, StreamSink};
use super::transport::{finalize, ChannelAllocator, SetupOffer, TransportConfig};
use super::url::ServerUrl;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum SessionState {
    #[default]
    Invalid,
    Init,
    Ready,
    Playing,
    Seeking,
}

bitflags! {
    /// Methods the server accepts, from `Public` and from 501/405 replies.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MethodSet: u16 {
        const OPTIONS = 1 << 0;
        const DESCRIBE = 1 << 1;
        const SETUP = 1 << 2;
        const PLAY = 1 << 3;
        const PAUSE = 1 << 4;
        const TEARDOWN = 1 << 5;
        const GET_PARAMETER = 1 << 6;
        const SET_PARAMETER = 1 << 7;
        /// Assumed when the server sends no `Public` header.
        const ASSUMED = Self::DESCRIBE.bits() | Self::SETUP.bits() | Self::PLAY.bits() | Self::PAUSE.bits();
    }
}

impl MethodSet {
    pub fn from_method(method: &Method) -> Option<Self> {
        Some(match method {
            Method::Options => MethodSet::OPTIONS,
            Method::Describe => MethodSet::DESCRIBE,
            Method::Setup => MethodSet::SETUP,
            Method::Play => MethodSet::PLAY,
            Method::Pause => MethodSet::PAUSE,
            Method::Teardown => MethodSet::TEARDOWN,
            Method::GetParameter => MethodSet::GET_PARAMETER,
            Method::SetParameter => MethodSet::SET_PARAMETER,
            _ => return None,
        })
    }

    /// Methods of a `Public` header, ignoring the ones we never send.
    pub fn from_public(public: &Public) -> Self {
        public
            .iter()
            .filter_map(MethodSet::from_method)
            .fold(MethodSet::empty(), |acc, m| acc | m)
    }
}

fn method_name(method: &Method) -> String {
    <&str>::from(method).to_string()
}

fn not_allowed(method: Method) -> RtspError {
    ProtocolError::MethodNotAllowed {
        method: method_name(&method),
    }
    .into()
}

/// Snapshot of one stream, for the application.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamInfo {
    pub id: u32,
    pub caps: Caps,
    pub transport: Option<TransportConfig>,
    pub seq_base: Option<u16>,
    pub time_base: Option<u32>,
    pub container: bool,
    pub disabled: bool,
}

/// Everything that changes during a session; guarded by the session lock.
pub(crate) struct SessionInner {
    pub(crate) state: SessionState,
    pub(crate) url: Option<ServerUrl>,
    pub(crate) conn: Option<Connection>,
    auth: AuthState,
    pub(crate) authorization: Option<String>,
    pub(crate) methods: MethodSet,
    pub(crate) registry: StreamRegistry,
    channels: ChannelAllocator,
    /// Lower transports still allowed, narrowed by the first successful SETUP.
    pub(crate) protocols: Protocols,
    pub(crate) segment: Segment,
    seek_stop: Option<Duration>,
    /// The next PLAY starts at the segment position instead of resuming.
    pub(crate) need_range: bool,
    playing_since: Option<Instant>,
    aggregate_control: Option<Url>,
    base_url: Option<Url>,
    pub(crate) udp_timeouts: mpsc::UnboundedReceiver<u32>,
    pub(crate) ignore_timeout: bool,
    pub(crate) keepalive: KeepAliveMethod,
    errored: bool,
}

pub(crate) struct Shared {
    pub(crate) inner: Mutex<SessionInner>,
    pub(crate) command: watch::Sender<Command>,
    state: watch::Sender<SessionState>,
    pub(crate) flush: FlushToken,
    pub(crate) events: EventSender,
    pub(crate) manager: Arc<dyn RtpSessionManager>,
    pub(crate) notifier: UdpTimeoutNotifier,
    pub(crate) settings: Settings,
}

impl SessionInner {
    fn new(udp_timeouts: mpsc::UnboundedReceiver<u32>) -> Self {
        SessionInner {
            state: SessionState::Invalid,
            url: None,
            conn: None,
            auth: AuthState::default(),
            authorization: None,
            methods: MethodSet::ASSUMED,
            registry: StreamRegistry::default(),
            channels: ChannelAllocator::default(),
            protocols: Protocols::empty(),
            segment: Segment::default(),
            seek_stop: None,
            need_range: true,
            playing_since: None,
            aggregate_control: None,
            base_url: None,
            udp_timeouts,
            ignore_timeout: false,
            keepalive: KeepAliveMethod::Options,
            errored: false,
        }
    }

    pub(crate) fn set_state(&mut self, shared: &Shared, state: SessionState) {
        if self.state == state {
            return;
        }
        info!("State change {:?} -> {state:?}", self.state);
        self.state = state;
        shared.state.send_replace(state);
        shared.events.post(Event::StateChanged(state));
    }

    /// URL for aggregate operations: PLAY, PAUSE, TEARDOWN and parameters.
    pub(crate) fn control_url(&self) -> Result<Url, RtspError> {
        self.aggregate_control
            .clone()
            .or_else(|| self.base_url.clone())
            .or_else(|| self.url.as_ref().map(|u| u.request_url().clone()))
            .ok_or_else(|| ConnError::NotConnected.into())
    }

    fn connection(&mut self) -> Result<&mut Connection, RtspError> {
        self.conn.as_mut().ok_or_else(|| ConnError::NotConnected.into())
    }

    /// Sends a request and checks the response, retrying once with credentials on 401.
    async fn request(
        &mut self,
        timeout: Duration,
        req: Request<Body>,
    ) -> Result<Response<Body>, RtspError> {
        let method = req.method().clone();
        self.auth.begin_request();

        loop {
            let conn = self.conn.as_mut().ok_or(ConnError::NotConnected)?;
            let rsp = conn.send_receive(req.clone(), timeout).await?;
            if rsp.status() != StatusCode::Unauthorized {
                return self.check_response(&method, rsp);
            }

            let authorization = self.auth.handle_unauthorized(&rsp)?;
            info!("Retrying {} with credentials", method_name(&method));
            conn.set_authorization(Some(authorization.clone()));
            self.authorization = Some(authorization);
        }
    }

    fn check_response(
        &mut self,
        method: &Method,
        rsp: Response<Body>,
    ) -> Result<Response<Body>, RtspError> {
        let code = u16::from(rsp.status());
        if !(200..300).contains(&code) {
            if matches!(code, 405 | 501) {
                if let Some(m) = MethodSet::from_method(method) {
                    info!("Server does not support {}, disabling it", method_name(method));
                    self.methods.remove(m);
                }
                return Err(not_allowed(method.clone()));
            }
            return Err(RtspError::status(code, rsp.reason_phrase()));
        }

        let ours = self
            .conn
            .as_ref()
            .and_then(|c| c.timer().session())
            .map(str::to_string);
        let have = rsp
            .typed_header::<Session>()
            .map_err(|_| RtspError::invalid_response("Invalid Session header"))?;
        if let (Some(ours), Some(have)) = (ours, have) {
            let have = have.0.trim();
            if have != ours {
                return Err(ProtocolError::SessionError {
                    details: format!("Session in header {have} does not match our session {ours}"),
                }
                .into());
            }
        }
        Ok(rsp)
    }

    async fn options(&mut self, shared: &Shared, url: &Url) -> Result<(), RtspError> {
        let req = Request::builder(Method::Options, Version::V1_0)
            .request_uri(url.clone())
            .build(Body::default());

        match self.request(shared.settings.tcp_timeout, req).await {
            Ok(rsp) => {
                self.methods = match rsp.typed_header::<Public>() {
                    Ok(Some(public)) => MethodSet::from_public(&public),
                    Ok(None) => MethodSet::ASSUMED,
                    Err(_) => {
                        warn!("Invalid Public header, assuming the basic methods");
                        MethodSet::ASSUMED
                    }
                };
            }
            Err(RtspError::Protocol(ProtocolError::MethodNotAllowed { .. })) => {
                warn!("Server does not implement OPTIONS, assuming the basic methods");
                self.methods = MethodSet::ASSUMED;
            }
            Err(err) => return Err(err),
        }
        debug!("Server methods: {:?}", self.methods);

        let missing = MethodSet::DESCRIBE | MethodSet::SETUP;
        if !self.methods.contains(missing) {
            return Err(not_allowed(if self.methods.contains(MethodSet::DESCRIBE) {
                Method::Setup
            } else {
                Method::Describe
            }));
        }
        Ok(())
    }

    /// DESCRIBE, then fills the registry and the segment from the description.
    async fn describe(
        &mut self,
        shared: &Shared,
        url: &Url,
        announce: bool,
    ) -> Result<(), RtspError> {
        let req = Request::builder(Method::Describe, Version::V1_0)
            .header(ACCEPT, "application/sdp")
            .request_uri(url.clone())
            .build(Body::default());
        let rsp = self.request(shared.settings.tcp_timeout, req).await?;
        check_content_type(&rsp)?;

        let base = base_url(&rsp, url);
        let description = parse_description(rsp.body().as_ref(), &base)?;
        self.aggregate_control = description.aggregate_control.clone();
        self.base_url = Some(base);

        for media in description.medias {
            self.registry.add(media);
        }
        if self.registry.is_empty() {
            return Err(MediaError::NoCompatibleStreams.into());
        }

        if announce {
            for (id, reason) in description.skipped {
                shared.events.post(Event::StreamSkipped { id, reason });
            }
        }
        if let Some(range) = description.range {
            if self.segment.apply_range(&range) && announce {
                shared
                    .events
                    .post(Event::DurationChanged(self.segment.duration));
            }
        }
        Ok(())
    }

    async fn setup_stream(&mut self, shared: &Shared, id: u32) -> Result<(), RtspError> {
        let settings = &shared.settings;
        let (control_url, stream_protocols, is_ipv4, caps) = {
            let stream = self
                .registry
                .get(id)
                .ok_or_else(|| RtspError::invalid_response(format!("No stream {id}")))?;
            (
                stream.control_url.clone(),
                stream.protocols,
                stream.is_ipv4,
                stream.caps.clone(),
            )
        };

        let mut allowed = self.protocols;
        if !stream_protocols.is_empty() {
            allowed &= stream_protocols;
        }
        let offer = SetupOffer::new(
            allowed,
            is_ipv4,
            settings.port_start,
            settings.port_retry,
            &self.channels,
        );
        if offer.clauses.is_empty() {
            return Err(TransportError::NoProtocols { stream: id }.into());
        }
        debug!(
            "SETUP stream {id} offering {}",
            offer
                .clauses
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(",")
        );

        let req = Request::builder(Method::Setup, Version::V1_0)
            .request_uri(control_url.clone())
            .typed_header::<Transports>(&offer.transports())
            .build(Body::default());
        let rsp = self.request(settings.tcp_timeout, req).await?;

        let session = rsp
            .typed_header::<Session>()
            .map_err(|_| RtspError::invalid_response("Invalid Session header"))?;
        let conn = self.connection()?;
        if let Some(session) = session {
            conn.timer_mut().set_session(&session);
        }
        let peer = conn.peer_addr().ip();

        let transports = rsp.typed_header::<Transports>().map_err(|err| {
            RtspError::invalid_response(format!("Invalid Transport header: {err:?}"))
        })?;
        let info = offer.select(transports.as_ref())?;
        let (config, udp) = finalize(info, offer.ports, peer, &mut self.channels)?;

        let chosen = config.protocol();
        if chosen != self.protocols {
            info!("Server chose {chosen}, using it for the remaining streams");
            self.protocols = chosen;
        }
        info!("Stream {id} configured with {config:?}");

        if let Some(stream) = self.registry.get_mut(id) {
            stream.channel = match config {
                TransportConfig::TcpInterleaved {
                    channel_rtp,
                    channel_rtcp,
                } => Some((channel_rtp, channel_rtcp)),
                _ => None,
            };
            stream.transport = Some(config.clone());
            stream.setup_url = Some(control_url);
        }

        shared.manager.register_stream(
            &StreamDescription {
                id,
                caps,
                transport: config,
            },
            udp,
            shared.notifier.clone(),
        );
        Ok(())
    }

    /// Connects, then OPTIONS, DESCRIBE and SETUP of every stream.
    pub(crate) async fn establish(
        &mut self,
        shared: &Shared,
        url: &ServerUrl,
        announce: bool,
    ) -> Result<(), RtspError> {
        let settings = &shared.settings;
        let mut conn = Connection::open(
            url,
            settings.tcp_timeout,
            &settings.retry,
            &shared.flush,
            &settings.user_agent,
        )
        .await?;
        conn.set_authorization(self.authorization.clone());
        self.conn = Some(conn);

        let request_url = url.request_url().clone();
        self.options(shared, &request_url).await?;
        self.describe(shared, &request_url, announce).await?;
        self.set_state(shared, SessionState::Init);

        let mut configured = 0;
        for id in self.registry.ids() {
            match self.setup_stream(shared, id).await {
                Ok(()) => configured += 1,
                Err(
                    err @ (RtspError::Connection(_)
                    | RtspError::Protocol(ProtocolError::AuthenticationFailed { .. })),
                ) => return Err(err),
                Err(err) => {
                    warn!("Skipping stream {id}: {err}");
                    if let Some(stream) = self.registry.get_mut(id) {
                        stream.disabled = true;
                    }
                    if announce {
                        shared.events.post(Event::StreamSkipped {
                            id,
                            reason: err.to_string(),
                        });
                    }
                }
            }
        }
        if configured == 0 {
            return Err(TransportError::NoStreams.into());
        }

        if announce {
            for stream in self.registry.iter().filter(|s| s.is_active()) {
                shared.events.post(Event::StreamAdded {
                    id: stream.id,
                    caps: stream.caps.clone(),
                });
            }
            shared.events.post(Event::NoMoreStreams);
        }
        self.set_state(shared, SessionState::Ready);
        Ok(())
    }

    pub(crate) async fn do_play(&mut self, shared: &Shared) -> Result<(), RtspError> {
        if !self.methods.contains(MethodSet::PLAY) {
            return Err(not_allowed(Method::Play));
        }

        let start = self.need_range.then_some(self.segment.position);
        let range = play_range(start, self.seek_stop);
        let mut builder = Request::builder(Method::Play, Version::V1_0)
            .request_uri(self.control_url()?)
            .typed_header::<Range>(&range);
        if self.segment.rate != 1.0 {
            builder = builder.typed_header::<Scale>(&self.segment.rate.into());
        }
        let rsp = self
            .request(shared.settings.tcp_timeout, builder.build(Body::default()))
            .await?;
        self.need_range = false;

        match rsp.typed_header::<Range>() {
            Ok(Some(range)) => {
                if self.segment.apply_range(&range) {
                    shared
                        .events
                        .post(Event::DurationChanged(self.segment.duration));
                }
            }
            Ok(None) => {}
            Err(_) => warn!("Ignoring invalid Range in PLAY response"),
        }
        match rsp.typed_header::<Scale>() {
            Ok(Some(scale)) => self.segment.apply_scale(*scale),
            Ok(None) => {}
            Err(_) => warn!("Ignoring invalid Scale in PLAY response"),
        }
        match rsp.typed_header::<RtpInfos>().map(|infos| infos.map(RtpInfos::try_into_v1)) {
            Ok(Some(Ok(RtpInfos::V1(infos)))) => {
                for id in self.registry.apply_rtp_info(&infos) {
                    if let Some(stream) = self.registry.get(id) {
                        shared
                            .manager
                            .update_stream(id, stream.seq_base, stream.time_base);
                    }
                }
            }
            Ok(None) => debug!("No RTP-Info in PLAY response"),
            _ => warn!("Ignoring invalid RTP-Info in PLAY response"),
        }

        // Reports from before PLAY are stale
        while self.udp_timeouts.try_recv().is_ok() {}
        shared.notifier.arm(true);
        self.playing_since = Some(Instant::now());
        self.set_state(shared, SessionState::Playing);
        Ok(())
    }

    /// Stops supervising UDP and moves the position by the time spent playing.
    pub(crate) fn stop_playing(&mut self, shared: &Shared) {
        shared.notifier.arm(false);
        if let Some(since) = self.playing_since.take() {
            self.segment.advance(since.elapsed());
        }
    }

    /// Whether the session has been playing for at least `duration`.
    pub(crate) fn playing_for(&self, duration: Duration) -> bool {
        self.playing_since
            .is_some_and(|since| since.elapsed() >= duration)
    }

    async fn do_pause(&mut self, shared: &Shared) -> Result<(), RtspError> {
        if !self.methods.contains(MethodSet::PAUSE) {
            return Err(not_allowed(Method::Pause));
        }
        let req = Request::builder(Method::Pause, Version::V1_0)
            .request_uri(self.control_url()?)
            .build(Body::default());
        self.request(shared.settings.tcp_timeout, req).await?;
        self.stop_playing(shared);
        self.set_state(shared, SessionState::Ready);
        Ok(())
    }

    /// Best-effort TEARDOWN when there is something to tear down.
    pub(crate) async fn teardown(&mut self, shared: &Shared) {
        let has_session = self
            .conn
            .as_ref()
            .is_some_and(|c| c.timer().session().is_some());
        if !has_session || !self.methods.contains(MethodSet::PLAY) {
            return;
        }
        let Ok(url) = self.control_url() else {
            return;
        };
        let req = Request::builder(Method::Teardown, Version::V1_0)
            .request_uri(url)
            .build(Body::default());
        if let Err(err) = self.request(shared.settings.tcp_timeout, req).await {
            warn!("TEARDOWN failed: {err}");
        }
    }

    /// Closes the connection and forgets every stream.
    pub(crate) async fn release(&mut self, shared: &Shared) {
        self.stop_playing(shared);
        if let Some(conn) = self.conn.take() {
            conn.close().await;
        }
        for stream in self.registry.iter().filter(|s| s.transport.is_some()) {
            shared.manager.unregister_stream(stream.id);
        }
        self.registry.clear();
        self.channels.reset();
        self.aggregate_control = None;
        self.base_url = None;
    }

    /// Reports a fatal error once, releases everything and goes back to `Invalid`.
    pub(crate) async fn fail(&mut self, shared: &Shared, err: &RtspError) {
        if err.is_cancelled() {
            debug!("Session interrupted: {err}");
        } else {
            error!("Fatal session error: {err}");
            if !self.errored {
                self.errored = true;
                shared.events.post(Event::Error(err.to_string()));
            }
        }
        self.release(shared).await;
        self.set_state(shared, SessionState::Invalid);
    }

    /// Reports the end of the stream unless an error was already reported.
    pub(crate) fn end_of_stream(&mut self, shared: &Shared) {
        if self.errored {
            return;
        }
        if self.segment.flags.contains(SeekFlags::SEGMENT) {
            let position = self
                .segment
                .stop
                .or(self.segment.duration)
                .unwrap_or(self.segment.position);
            shared.events.post(Event::SegmentDone { position });
        } else {
            shared.events.post(Event::Eos);
        }
    }

    async fn parameters(
        &mut self,
        shared: &Shared,
        method: Method,
        body: String,
    ) -> Result<Response<Body>, RtspError> {
        if self.conn.is_none() {
            return Err(RtspError::InvalidState(self.state));
        }
        let flag = MethodSet::from_method(&method).unwrap_or(MethodSet::empty());
        if !self.methods.contains(flag) {
            return Err(not_allowed(method));
        }

        let builder = Request::builder(method, Version::V1_0).request_uri(self.control_url()?);
        let req = if body.is_empty() {
            builder.build(Body::default())
        } else {
            builder
                .header(CONTENT_TYPE, "text/parameters")
                .build(Body::from(body))
        };
        self.request(shared.settings.tcp_timeout, req).await
    }
}

/// An RTSP client session.
///
/// All methods may be called from any task; they are serialized internally. The background
/// dispatch task delivers interleaved data to the sinks attached with
/// [`RtspSrc::attach_sink`] and reports everything else on the event channel.
pub struct RtspSrc {
    shared: Arc<Shared>,
    serial: Mutex<()>,
    task: StdMutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for RtspSrc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RtspSrc")
            .field("state", &self.state())
            .field("settings", &self.shared.settings)
            .finish()
    }
}

impl Drop for RtspSrc {
    fn drop(&mut self) {
        if let Some(task) = self
            .task
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
    }
}

impl RtspSrc {
    pub fn new(
        settings: Settings,
        manager: Arc<dyn RtpSessionManager>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<Event>), ConfigurationError> {
        settings.validate()?;
        manager.set_latency(settings.latency);

        let (events, events_rx) = EventSender::channel();
        let (notifier, udp_timeouts) = UdpTimeoutNotifier::channel();
        let shared = Shared {
            inner: Mutex::new(SessionInner::new(udp_timeouts)),
            command: watch::Sender::new(Command::Wait),
            state: watch::Sender::new(SessionState::Invalid),
            flush: FlushToken::new(),
            events,
            manager,
            notifier,
            settings,
        };

        let src = RtspSrc {
            shared: Arc::new(shared),
            serial: Mutex::new(()),
            task: StdMutex::new(None),
        };
        Ok((src, events_rx))
    }

    pub fn settings(&self) -> &Settings {
        &self.shared.settings
    }

    pub fn state(&self) -> SessionState {
        *self.shared.state.borrow()
    }

    /// Lets a session manager report UDP timeouts for this session.
    pub fn udp_timeout_notifier(&self) -> UdpTimeoutNotifier {
        self.shared.notifier.clone()
    }

    /// Takes the session lock away from the dispatch loop.
    async fn lock_inner(&self) -> MutexGuard<'_, SessionInner> {
        self.shared.command.send_if_modified(|c| {
            if matches!(*c, Command::Loop | Command::Reconnect) {
                *c = Command::Wait;
                true
            } else {
                false
            }
        });
        self.shared.flush.flush(true);
        let inner = self.shared.inner.lock().await;
        self.shared.flush.flush(false);
        inner
    }

    /// Lets the dispatch loop run again if we're playing.
    fn resume(&self, inner: &SessionInner) {
        if inner.state == SessionState::Playing {
            self.shared.command.send_if_modified(|c| {
                if *c == Command::Wait {
                    *c = Command::Loop;
                    true
                } else {
                    false
                }
            });
        }
    }

    /// Connects to `location`, describes the media and sets up every stream.
    pub async fn open(&self, location: &str) -> Result<(), RtspError> {
        let _serial = self.serial.lock().await;

        let mut inner = self.lock_inner().await;
        if inner.state != SessionState::Invalid {
            let state = inner.state;
            self.resume(&inner);
            return Err(RtspError::InvalidState(state));
        }
        // Left over from a session that failed on its own
        if let Some(task) = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }

        let settings = &self.shared.settings;
        let url = ServerUrl::parse(location, settings.protocols)?;
        let credentials = match (url.user(), settings.user_id.as_deref()) {
            (Some(user), _) => Some((
                user.to_string(),
                url.password().unwrap_or_default().to_string(),
            )),
            (None, Some(user)) => Some((
                user.to_string(),
                settings.user_pw.clone().unwrap_or_default(),
            )),
            (None, None) => None,
        };
        info!("Opening {url} with {}", url.protocols());

        let inner = &mut *inner;
        inner.auth = AuthState::new(credentials);
        inner.authorization = None;
        inner.methods = MethodSet::ASSUMED;
        inner.protocols = url.protocols();
        inner.segment = Segment::default();
        inner.seek_stop = None;
        inner.need_range = true;
        inner.ignore_timeout = false;
        inner.keepalive = KeepAliveMethod::Options;
        inner.errored = false;
        while inner.udp_timeouts.try_recv().is_ok() {}
        inner.url = Some(url.clone());

        if let Err(err) = inner.establish(&self.shared, &url, true).await {
            inner.fail(&self.shared, &err).await;
            return Err(err);
        }

        self.shared.command.send_replace(Command::Wait);
        let task = tokio::spawn(dispatch::run(self.shared.clone()));
        *self.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);
        Ok(())
    }

    pub async fn play(&self) -> Result<(), RtspError> {
        let _serial = self.serial.lock().await;
        let mut inner = self.lock_inner().await;

        let res = match inner.state {
            SessionState::Playing => Ok(()),
            SessionState::Ready | SessionState::Seeking => inner.do_play(&self.shared).await,
            state => Err(RtspError::InvalidState(state)),
        };
        self.resume(&inner);
        res
    }

    pub async fn pause(&self) -> Result<(), RtspError> {
        let _serial = self.serial.lock().await;
        let mut inner = self.lock_inner().await;

        let res = match inner.state {
            SessionState::Ready => Ok(()),
            SessionState::Playing => inner.do_pause(&self.shared).await,
            state => Err(RtspError::InvalidState(state)),
        };
        self.resume(&inner);
        res
    }

    /// Seeks to `target` at the current rate.
    pub async fn seek(&self, target: Duration, flags: SeekFlags) -> Result<(), RtspError> {
        self.seek_range(target, None, None, flags).await
    }

    /// Seeks to `target`, optionally up to `stop` and at a different `rate`.
    pub async fn seek_range(
        &self,
        target: Duration,
        stop: Option<Duration>,
        rate: Option<f64>,
        flags: SeekFlags,
    ) -> Result<(), RtspError> {
        let _serial = self.serial.lock().await;
        let mut inner = self.lock_inner().await;

        let res = self.do_seek(&mut inner, target, stop, rate, flags).await;
        self.resume(&inner);
        res
    }

    async fn do_seek(
        &self,
        inner: &mut SessionInner,
        target: Duration,
        stop: Option<Duration>,
        rate: Option<f64>,
        flags: SeekFlags,
    ) -> Result<(), RtspError> {
        let was_playing = match inner.state {
            SessionState::Ready => false,
            SessionState::Playing => true,
            state => return Err(RtspError::InvalidState(state)),
        };
        if !inner.methods.contains(MethodSet::PAUSE) {
            return Err(ProtocolError::UnsupportedFeature {
                feature: "seeking in a stream that can't be paused".to_string(),
            }
            .into());
        }

        info!("Seeking to {target:?} (stop {stop:?}, rate {rate:?}, flags {flags:?})");
        if was_playing {
            inner.do_pause(&self.shared).await?;
        }

        let rate = rate.unwrap_or(inner.segment.rate);
        inner.segment.seek(target, stop, rate, flags);
        if stop.is_some() {
            inner.seek_stop = stop;
        }
        inner.need_range = true;
        inner.set_state(&self.shared, SessionState::Seeking);

        if let Err(err) = inner.do_play(&self.shared).await {
            inner.set_state(&self.shared, SessionState::Ready);
            return Err(err);
        }
        Ok(())
    }

    /// Tears the session down and releases everything. The session can be opened again
    /// afterwards.
    pub async fn close(&self) -> Result<(), RtspError> {
        let _serial = self.serial.lock().await;

        self.shared.command.send_replace(Command::Stop);
        self.shared.flush.flush(true);
        let mut inner = self.shared.inner.lock().await;
        self.shared.flush.flush(false);

        inner.teardown(&self.shared).await;
        inner.release(&self.shared).await;
        inner.set_state(&self.shared, SessionState::Invalid);
        drop(inner);

        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                if !err.is_cancelled() {
                    warn!("Dispatch task failed: {err}");
                }
            }
        }
        Ok(())
    }

    /// Sends a GET_PARAMETER with one parameter name per line and returns the response body.
    pub async fn get_parameter(&self, names: &[&str]) -> Result<String, RtspError> {
        let _serial = self.serial.lock().await;
        let mut inner = self.lock_inner().await;

        let body = names.iter().map(|n| format!("{n}\r\n")).collect::<String>();
        let res = inner
            .parameters(&self.shared, Method::GetParameter, body)
            .await
            .map(|rsp| String::from_utf8_lossy(rsp.body().as_ref()).into_owned());
        self.resume(&inner);
        res
    }

    pub async fn set_parameter(&self, params: &[(&str, &str)]) -> Result<(), RtspError> {
        let _serial = self.serial.lock().await;
        let mut inner = self.lock_inner().await;

        let body = params
            .iter()
            .map(|(name, value)| format!("{name}: {value}\r\n"))
            .collect::<String>();
        let res = inner
            .parameters(&self.shared, Method::SetParameter, body)
            .await
            .map(|_| ());
        self.resume(&inner);
        res
    }

    /// Attaches the consumer of a stream's interleaved data. Returns `false` for unknown ids.
    pub async fn attach_sink(&self, id: u32, sink: Box<dyn StreamSink>) -> bool {
        let _serial = self.serial.lock().await;
        let mut inner = self.lock_inner().await;
        let attached = inner.registry.attach_sink(id, sink);
        self.resume(&inner);
        attached
    }

    pub async fn streams(&self) -> Vec<StreamInfo> {
        let _serial = self.serial.lock().await;
        let inner = self.lock_inner().await;
        let streams = inner
            .registry
            .iter()
            .map(|s| StreamInfo {
                id: s.id,
                caps: s.caps.clone(),
                transport: s.transport.clone(),
                seq_base: s.seq_base,
                time_base: s.time_base,
                container: s.container,
                disabled: s.disabled,
            })
            .collect();
        self.resume(&inner);
        streams
    }

    pub async fn segment(&self) -> Segment {
        let _serial = self.serial.lock().await;
        let inner = self.lock_inner().await;
        let segment = inner.segment.clone();
        self.resume(&inner);
        segment
    }

    /// Combined flow of all active streams.
    pub async fn flow(&self) -> FlowResult {
        let _serial = self.serial.lock().await;
        let inner = self.lock_inner().await;
        let flow = inner.registry.combined_flow();
        self.resume(&inner);
        flow
    }

    pub async fn methods(&self) -> MethodSet {
        let _serial = self.serial.lock().await;
        let inner = self.lock_inner().await;
        let methods = inner.methods;
        self.resume(&inner);
        methods
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn public(value: &str) -> Public {
        Response::builder(Version::V1_0, StatusCode::Ok)
            .header(rtsp_types::headers::PUBLIC, value)
            .build(Body::default())
            .typed_header::<Public>()
            .unwrap()
            .unwrap()
    }

    #[test]
    fn test_methods_from_public() {
        let methods = MethodSet::from_public(&public(
            "OPTIONS, DESCRIBE, SETUP, PLAY, PAUSE, TEARDOWN, GET_PARAMETER, ANNOUNCE",
        ));
        assert!(methods.contains(MethodSet::ASSUMED));
        assert!(methods.contains(MethodSet::GET_PARAMETER));
        assert!(!methods.contains(MethodSet::SET_PARAMETER));

        let methods = MethodSet::from_public(&public("DESCRIBE,SETUP,PLAY"));
        assert!(!methods.contains(MethodSet::PAUSE));
        assert!(methods.contains(MethodSet::PLAY));
    }

    #[test]
    fn test_from_method() {
        assert_eq!(
            MethodSet::from_method(&Method::GetParameter),
            Some(MethodSet::GET_PARAMETER)
        );
        assert_eq!(MethodSet::from_method(&Method::Announce), None);
        assert_eq!(method_name(&Method::Pause), "PAUSE");
    }
}
