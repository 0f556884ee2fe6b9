// RTSP Source 2 - Dispatch loop
//
// Copyright (C) 2023-2024 Nirbheek Chauhan <nirbheek centricular com>
//
// This Source Code Form is subject to the terms of the Mozilla Public License, v2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at
// <https://mozilla.org/MPL/2.0/>.
//
// SPDX-License-Identifier: MPL-2.0

use std::sync::Arc;

use rtsp_types::{Message, Method, Request, Version};
use tracing::{debug, info, trace, warn};

use super::body::Body;
use super::connection::{not_flushing, ConnError, Connection};
use super::error::{RtspError, TransportError};
use super::events::Event;
use super::flow::FlowResult;
use super::keepalive::KeepAliveMethod;
use super::session::{MethodSet, SessionInner, Shared};
use super::settings::Protocols;

/// What the dispatch loop should be doing, written by the controller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Command {
    /// Leave the session lock alone until told otherwise.
    #[default]
    Wait,
    /// Keep dispatching.
    Loop,
    /// Reopen the session over TCP and resume playback.
    Reconnect,
    /// Exit.
    Stop,
}

enum Outcome {
    Continue,
    /// All streams stopped accepting data.
    Finished(FlowResult),
    Reconnect,
}

enum UdpEvent {
    Timeout(u32),
    Control(Result<Message<Body>, ConnError>),
}

fn switch_command(shared: &Shared, from: Command, to: Command) {
    shared.command.send_if_modified(|c| {
        if *c == from {
            *c = to;
            true
        } else {
            false
        }
    });
}

/// Background task of a session, from the end of `open()` until `close()` or a fatal error.
pub(crate) async fn run(shared: Arc<Shared>) {
    let mut command_rx = shared.command.subscribe();
    let mut flush_rx = shared.flush.subscribe();
    debug!("Dispatch loop started");

    loop {
        let command = *command_rx.borrow_and_update();
        match command {
            Command::Stop => break,
            Command::Wait => {
                if command_rx.changed().await.is_err() {
                    break;
                }
                continue;
            }
            Command::Loop | Command::Reconnect => not_flushing(&mut flush_rx).await,
        }

        let mut guard = shared.inner.lock().await;
        // The controller may have taken the lock in between
        let command = *shared.command.borrow();
        if shared.flush.is_flushing() {
            continue;
        }
        let inner = &mut *guard;

        let result = match command {
            Command::Loop => step(&shared, inner).await,
            Command::Reconnect => reconnect(&shared, inner)
                .await
                .map(|()| Outcome::Continue),
            Command::Wait => continue,
            Command::Stop => break,
        };

        match result {
            Ok(Outcome::Continue) => {
                if command == Command::Reconnect {
                    switch_command(&shared, Command::Reconnect, Command::Loop);
                }
            }
            Ok(Outcome::Reconnect) => switch_command(&shared, Command::Loop, Command::Reconnect),
            Ok(Outcome::Finished(flow)) => {
                info!("Pausing dispatch, reason {flow:?}");
                if flow == FlowResult::Eos {
                    inner.end_of_stream(&shared);
                }
                switch_command(&shared, Command::Loop, Command::Wait);
            }
            Err(err) if err.is_cancelled() && command == Command::Loop => {
                trace!("Dispatch interrupted");
            }
            Err(err) if err.is_cancelled() && *shared.command.borrow() == Command::Stop => break,
            Err(err) => {
                inner.fail(&shared, &err).await;
                break;
            }
        }
    }

    debug!("Dispatch loop stopped");
}

/// One iteration: a message from the control connection, or a UDP timeout.
async fn step(shared: &Shared, inner: &mut SessionInner) -> Result<Outcome, RtspError> {
    let interleaved = inner
        .registry
        .iter()
        .any(|s| s.is_active() && s.channel.is_some());
    let conn = inner.conn.as_mut().ok_or(ConnError::NotConnected)?;
    let deadline = conn.timer().next_keepalive();

    if interleaved {
        match conn.read_message(deadline).await {
            Ok(Message::Data(data)) => {
                let channel = data.channel_id();
                if inner
                    .registry
                    .route(channel, data.into_body().into_bytes())
                    .is_some()
                {
                    let flow = inner.registry.combined_flow();
                    if flow == FlowResult::Error {
                        return Err(RtspError::Flow(flow));
                    }
                    if flow.is_fatal() {
                        return Ok(Outcome::Finished(flow));
                    }
                }
                Ok(Outcome::Continue)
            }
            Err(ConnError::Closed) => {
                info!("Server closed the connection");
                Ok(Outcome::Finished(FlowResult::Eos))
            }
            res => handle_control(inner, res).await,
        }
    } else {
        let event = tokio::select! {
            biased;
            Some(id) = inner.udp_timeouts.recv() => UdpEvent::Timeout(id),
            res = conn.read_message(deadline) => UdpEvent::Control(res),
        };
        match event {
            UdpEvent::Timeout(id) => udp_timeout(shared, inner, id),
            UdpEvent::Control(Ok(Message::Data(data))) => {
                trace!(
                    "Ignoring {} bytes on channel {} in UDP mode",
                    data.len(),
                    data.channel_id()
                );
                Ok(Outcome::Continue)
            }
            UdpEvent::Control(Err(ConnError::Closed)) => reopen_control(shared, inner).await,
            UdpEvent::Control(res) => handle_control(inner, res).await,
        }
    }
}

async fn handle_control(
    inner: &mut SessionInner,
    res: Result<Message<Body>, ConnError>,
) -> Result<Outcome, RtspError> {
    let conn = inner.conn.as_mut().ok_or(ConnError::NotConnected)?;
    match res {
        Ok(Message::Request(req)) => conn.reply_ok(&req).await?,
        Ok(Message::Response(rsp)) => {
            debug!("<<-- {rsp:#?}");
            conn.timer_mut().reset_activity();
            let code = u16::from(rsp.status());
            if matches!(code, 405 | 501) && inner.keepalive == KeepAliveMethod::GetParameter {
                info!("GET_PARAMETER not supported, using OPTIONS for keep-alive");
                inner.methods.remove(MethodSet::GET_PARAMETER);
            } else if !(200..300).contains(&code) {
                warn!("Keep-alive failed: {code} {}", rsp.reason_phrase());
            }
        }
        Ok(Message::Data(data)) => trace!("Dropping {} bytes", data.len()),
        Err(ConnError::Timeout(_)) => send_keepalive(inner).await?,
        Err(err) => return Err(err.into()),
    }
    Ok(Outcome::Continue)
}

async fn send_keepalive(inner: &mut SessionInner) -> Result<(), RtspError> {
    let (keepalive, method) = if inner.methods.contains(MethodSet::GET_PARAMETER) {
        (KeepAliveMethod::GetParameter, Method::GetParameter)
    } else {
        (KeepAliveMethod::Options, Method::Options)
    };
    let mut req = Request::builder(method, Version::V1_0)
        .request_uri(inner.control_url()?)
        .build(Body::default());

    let conn = inner.conn.as_mut().ok_or(ConnError::NotConnected)?;
    debug!("Sending keep-alive {keepalive:?}");
    // The reply is picked up by the loop
    conn.send_request(&mut req).await?;
    conn.timer_mut().reset_activity();
    inner.keepalive = keepalive;
    Ok(())
}

fn udp_timeout(shared: &Shared, inner: &mut SessionInner, id: u32) -> Result<Outcome, RtspError> {
    // The receive timer may have started before PLAY
    if !inner.playing_for(shared.settings.udp_timeout) {
        debug!("Ignoring early UDP timeout on stream {id}");
        return Ok(Outcome::Continue);
    }
    if inner.ignore_timeout {
        debug!("Ignoring UDP timeout on stream {id}");
        return Ok(Outcome::Continue);
    }
    inner.ignore_timeout = true;

    let tcp_allowed = inner
        .url
        .as_ref()
        .is_some_and(|u| u.protocols().contains(Protocols::TCP));
    if !tcp_allowed {
        return Err(TransportError::UdpTimeout {
            reason: format!("no data on stream {id} and TCP is not allowed"),
        }
        .into());
    }
    warn!("No UDP data on stream {id}, reconnecting over TCP");
    Ok(Outcome::Reconnect)
}

/// The server closed the control connection while media flows over UDP.
async fn reopen_control(shared: &Shared, inner: &mut SessionInner) -> Result<Outcome, RtspError> {
    if !shared.settings.udp_reconnect {
        return Err(ConnError::Closed.into());
    }
    let url = inner.url.clone().ok_or(ConnError::NotConnected)?;
    let mut old = inner.conn.take().ok_or(ConnError::NotConnected)?;
    info!("Control connection closed, reopening it");

    let timer = std::mem::take(old.timer_mut());
    old.close().await;

    let settings = &shared.settings;
    let mut conn = Connection::open(
        &url,
        settings.tcp_timeout,
        &settings.retry,
        &shared.flush,
        &settings.user_agent,
    )
    .await?;
    *conn.timer_mut() = timer;
    conn.set_authorization(inner.authorization.clone());
    inner.conn = Some(conn);
    Ok(Outcome::Continue)
}

/// Sets the whole session up again over TCP and resumes from the current position.
async fn reconnect(shared: &Shared, inner: &mut SessionInner) -> Result<(), RtspError> {
    let url = inner.url.clone().ok_or(ConnError::NotConnected)?;
    let from = inner.protocols;
    inner.stop_playing(shared);
    let position = inner.segment.position;
    // Live streams can only pick up wherever the server is now
    let seekable = inner.segment.duration.is_some();
    info!("Reconnecting over TCP, resuming at {position:?}");

    inner.teardown(shared).await;
    let sinks = inner.registry.take_sinks();
    inner.release(shared).await;

    inner.protocols = Protocols::TCP;
    inner.establish(shared, &url, false).await?;
    for (id, sink) in sinks {
        if !inner.registry.attach_sink(id, sink) {
            warn!("Stream {id} is gone after reconnecting");
        }
    }

    inner.segment.start = position;
    inner.segment.position = position;
    inner.need_range = seekable;
    inner.do_play(shared).await?;

    shared.events.post(Event::TransportFallback {
        from,
        to: Protocols::TCP,
    });
    Ok(())
}
