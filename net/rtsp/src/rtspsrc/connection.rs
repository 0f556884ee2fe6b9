// RTSP Source 2 - Control connection
//
// Copyright (C) 2023-2024 Nirbheek Chauhan <nirbheek centricular com>
//
// This Source Code Form is subject to the terms of the Mozilla Public License, v2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at
// <https://mozilla.org/MPL/2.0/>.
//
// SPDX-License-Identifier: MPL-2.0

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::{Sink, SinkExt, Stream, StreamExt};
use rtsp_types::headers::{CSeq, Session, AUTHORIZATION, SESSION, USER_AGENT};
use rtsp_types::{Message, Request, Response, StatusCode};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::{self, Instant};
use tracing::{debug, trace, warn};

use super::body::Body;
use super::error::ErrorClassification;
use super::keepalive::SessionTimer;
use super::retry::{RetryCalculator, RetryConfig};
use super::tcp_message::{async_read, async_write, ReadError};
use super::url::ServerUrl;

pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

type MessageStream = Pin<Box<dyn Stream<Item = Result<Message<Body>, ReadError>> + Send>>;
type MessageSink = Pin<Box<dyn Sink<Message<Body>, Error = io::Error> + Send>>;

#[derive(Debug, Error)]
pub enum ConnError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Read(ReadError),
    #[error("No response within {0:?}")]
    Timeout(Duration),
    #[error("Operation cancelled by flush")]
    Cancelled,
    #[error("Connection closed by peer")]
    Closed,
    #[error("Could not resolve {0}")]
    Resolve(String),
    #[error("Invalid message: {0}")]
    InvalidMessage(String),
    #[error("Not connected")]
    NotConnected,
}

impl From<ReadError> for ConnError {
    fn from(err: ReadError) -> Self {
        match err {
            ReadError::Io(err) if err.kind() == io::ErrorKind::UnexpectedEof => ConnError::Closed,
            ReadError::Io(err) => ConnError::Io(err),
            ReadError::Parse => ConnError::InvalidMessage("unparsable RTSP message".to_string()),
            err => ConnError::Read(err),
        }
    }
}

/// Shared flush flag.
///
/// While set, every read or write on connections subscribed to it fails with
/// [`ConnError::Cancelled`], including the ones already waiting.
#[derive(Debug, Clone)]
pub struct FlushToken(Arc<watch::Sender<bool>>);

impl Default for FlushToken {
    fn default() -> Self {
        Self::new()
    }
}

impl FlushToken {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self(Arc::new(tx))
    }

    pub fn flush(&self, flushing: bool) {
        self.0.send_replace(flushing);
    }

    pub fn is_flushing(&self) -> bool {
        *self.0.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.0.subscribe()
    }
}

pub(crate) async fn flushing(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|f| *f).await.is_err() {
        std::future::pending::<()>().await;
    }
}

pub(crate) async fn not_flushing(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|f| !*f).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// The RTSP control connection: one TCP socket carrying requests, responses and
/// interleaved data.
pub struct Connection {
    stream: MessageStream,
    sink: MessageSink,
    flush_rx: watch::Receiver<bool>,
    broken: bool,
    cseq: u32,
    user_agent: String,
    authorization: Option<String>,
    timer: SessionTimer,
    peer: SocketAddr,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.peer)
            .field("cseq", &self.cseq)
            .field("session", &self.timer.session())
            .field("broken", &self.broken)
            .finish()
    }
}

impl Connection {
    /// Connects to the server, retrying according to `retry` within `timeout`.
    pub async fn open(
        url: &ServerUrl,
        timeout: Duration,
        retry: &RetryConfig,
        flush: &FlushToken,
        user_agent: &str,
    ) -> Result<Self, ConnError> {
        let mut flush_rx = flush.subscribe();
        let host_port = url.host_port();

        let connect = async {
            let mut calc = RetryCalculator::new(retry.clone());
            loop {
                match TcpStream::connect(&host_port).await {
                    Ok(stream) => break Ok(stream),
                    Err(err) => {
                        let err = ConnError::from(err);
                        if !err.is_retryable() {
                            break Err(err);
                        }
                        let Some(delay) = calc.next_delay() else {
                            break Err(err);
                        };
                        warn!(
                            "Failed to connect to {host_port}: {err}, attempt {}",
                            calc.current_attempt()
                        );
                        time::sleep(delay).await;
                    }
                }
            }
        };

        let stream = tokio::select! {
            biased;
            _ = flushing(&mut flush_rx) => return Err(ConnError::Cancelled),
            res = time::timeout(timeout, connect) => {
                res.map_err(|_| ConnError::Timeout(timeout))??
            }
        };
        debug!("Connected to {host_port}");

        Self::from_stream(stream, flush, user_agent)
    }

    pub(crate) fn from_stream(
        stream: TcpStream,
        flush: &FlushToken,
        user_agent: &str,
    ) -> Result<Self, ConnError> {
        let _ = stream.set_nodelay(true);
        let peer = stream.peer_addr()?;
        let (read, write) = stream.into_split();

        Ok(Connection {
            stream: Box::pin(async_read(read, MAX_MESSAGE_SIZE).fuse()),
            sink: Box::pin(async_write(write)),
            flush_rx: flush.subscribe(),
            broken: false,
            cseq: 0,
            user_agent: user_agent.to_string(),
            authorization: None,
            timer: SessionTimer::new(),
            peer,
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn timer(&self) -> &SessionTimer {
        &self.timer
    }

    pub fn timer_mut(&mut self) -> &mut SessionTimer {
        &mut self.timer
    }

    pub fn set_authorization(&mut self, authorization: Option<String>) {
        self.authorization = authorization;
    }

    fn check_usable(&mut self) -> Result<(), ConnError> {
        if *self.flush_rx.borrow_and_update() {
            return Err(ConnError::Cancelled);
        }
        if self.broken {
            return Err(ConnError::NotConnected);
        }
        Ok(())
    }

    async fn write(&mut self, msg: Message<Body>) -> Result<(), ConnError> {
        self.check_usable()?;
        let res = tokio::select! {
            biased;
            _ = flushing(&mut self.flush_rx) => return Err(ConnError::Cancelled),
            res = self.sink.send(msg) => res,
        };
        res.map_err(|err| {
            self.broken = true;
            ConnError::Io(err)
        })
    }

    /// Assigns the next CSeq, fills in the common headers and writes the request without
    /// waiting for the response.
    pub async fn send_request(&mut self, req: &mut Request<Body>) -> Result<u32, ConnError> {
        self.check_usable()?;

        self.cseq += 1;
        let cseq = self.cseq;
        req.insert_typed_header::<CSeq>(&cseq.into());
        if req.header(&USER_AGENT).is_none() {
            req.insert_header(USER_AGENT, self.user_agent.clone());
        }
        if let Some(session) = self.timer.session() {
            if req.header(&SESSION).is_none() {
                req.insert_typed_header::<Session>(&session.into());
            }
        }
        if let Some(auth) = self.authorization.as_ref() {
            if req.header(&AUTHORIZATION).is_none() {
                req.insert_header(AUTHORIZATION, auth.clone());
            }
        }

        debug!("-->> {req:#?}");
        self.write(req.clone().into()).await?;
        Ok(cseq)
    }

    /// Sends `req` and waits for its response.
    ///
    /// Server requests arriving meanwhile are answered, interleaved data is dropped and
    /// responses to earlier requests are skipped.
    pub async fn send_receive(
        &mut self,
        mut req: Request<Body>,
        timeout: Duration,
    ) -> Result<Response<Body>, ConnError> {
        let cseq = self.send_request(&mut req).await?;
        let deadline = Instant::now() + timeout;

        loop {
            match self.read_message(Some(deadline)).await? {
                Message::Response(rsp) => {
                    match rsp.typed_header::<CSeq>() {
                        Ok(Some(have)) if *have != cseq => {
                            debug!("Skipping response with CSeq {}, waiting for {cseq}", *have);
                            continue;
                        }
                        Ok(Some(_)) => {}
                        Ok(None) => warn!(
                            "No cseq in response, continuing... {:#?}",
                            rsp.headers().collect::<Vec<_>>()
                        ),
                        Err(_) => warn!(
                            "Invalid cseq in response, continuing... {:#?}",
                            rsp.headers().collect::<Vec<_>>()
                        ),
                    }
                    debug!("<<-- {rsp:#?}");
                    self.timer.reset_activity();
                    return Ok(rsp);
                }
                Message::Request(server_req) => self.reply_ok(&server_req).await?,
                Message::Data(data) => trace!(
                    "Dropping {} bytes on channel {} while waiting for a response",
                    data.len(),
                    data.channel_id()
                ),
            }
        }
    }

    /// Reads one message, giving up at `deadline` or when flushed.
    pub async fn read_message(
        &mut self,
        deadline: Option<Instant>,
    ) -> Result<Message<Body>, ConnError> {
        self.check_usable()?;

        let started = Instant::now();
        let stream = &mut self.stream;
        let next = async move {
            match deadline {
                Some(deadline) => time::timeout_at(deadline, stream.next())
                    .await
                    .map_err(|_| ConnError::Timeout(deadline.saturating_duration_since(started))),
                None => Ok(stream.next().await),
            }
        };

        let res = tokio::select! {
            biased;
            _ = flushing(&mut self.flush_rx) => return Err(ConnError::Cancelled),
            res = next => res?,
        };

        match res {
            Some(Ok(msg)) => Ok(msg),
            Some(Err(err)) => {
                self.broken = true;
                Err(err.into())
            }
            None => {
                self.broken = true;
                Err(ConnError::Closed)
            }
        }
    }

    /// Answers a server-initiated request with `200 OK`.
    pub(crate) async fn reply_ok(&mut self, req: &Request<Body>) -> Result<(), ConnError> {
        debug!("<<-- {req:#?}");
        let mut builder = Response::builder(req.version(), StatusCode::Ok);
        if let Ok(Some(cseq)) = req.typed_header::<CSeq>() {
            builder = builder.typed_header::<CSeq>(&cseq);
        }
        if let Ok(Some(session)) = req.typed_header::<Session>() {
            builder = builder.typed_header::<Session>(&session);
        }
        let rsp = builder.build(Body::default());
        debug!("-->> {rsp:#?}");
        self.write(rsp.into()).await
    }

    /// Releases the socket.
    pub async fn close(mut self) {
        if !self.broken {
            let _ = time::timeout(Duration::from_millis(100), self.sink.close()).await;
        }
        debug!("Closed connection to {}", self.peer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rtsp_types::{Method, Version};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn options() -> Request<Body> {
        Request::builder(Method::Options, Version::V1_0)
            .request_uri(url::Url::parse("rtsp://127.0.0.1/test").unwrap())
            .build(Body::default())
    }

    async fn pair() -> (Connection, TcpStream, FlushToken) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        let flush = FlushToken::new();
        let conn = Connection::from_stream(client, &flush, "test-agent").unwrap();
        (conn, server, flush)
    }

    #[tokio::test]
    async fn test_send_receive_skips_stale_and_answers_requests() {
        let (mut conn, mut server, _flush) = pair().await;

        let server_task = tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            let n = server.read(&mut buf).await.unwrap();
            let req = String::from_utf8_lossy(&buf[..n]).to_string();
            assert!(req.contains("CSeq: 1\r\n"));
            assert!(req.contains("User-Agent: test-agent\r\n"));

            server
                .write_all(
                    b"RTSP/1.0 200 OK\r\nCSeq: 0\r\n\r\n\
                      GET_PARAMETER rtsp://127.0.0.1/test RTSP/1.0\r\nCSeq: 7\r\n\r\n\
                      $\x00\x00\x02ab\
                      RTSP/1.0 200 OK\r\nCSeq: 1\r\nPublic: OPTIONS, DESCRIBE\r\n\r\n",
                )
                .await
                .unwrap();

            let n = server.read(&mut buf).await.unwrap();
            String::from_utf8_lossy(&buf[..n]).to_string()
        });

        let rsp = conn
            .send_receive(options(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(rsp.typed_header::<CSeq>().unwrap().map(u32::from), Some(1));
        assert!(rsp.header(&rtsp_types::headers::PUBLIC).is_some());

        let reply = server_task.await.unwrap();
        assert!(reply.starts_with("RTSP/1.0 200 OK\r\n"));
        assert!(reply.contains("CSeq: 7\r\n"));
    }

    #[tokio::test]
    async fn test_flush_cancels_read() {
        let (mut conn, _server, flush) = pair().await;

        let flusher = flush.clone();
        tokio::spawn(async move {
            time::sleep(Duration::from_millis(50)).await;
            flusher.flush(true);
        });

        assert!(matches!(
            conn.read_message(None).await,
            Err(ConnError::Cancelled)
        ));
        assert!(matches!(
            conn.send_request(&mut options()).await,
            Err(ConnError::Cancelled)
        ));

        flush.flush(false);
        assert!(conn.send_request(&mut options()).await.is_ok());
    }

    #[tokio::test]
    async fn test_timeout_and_close() {
        let (mut conn, server, _flush) = pair().await;

        let deadline = Instant::now() + Duration::from_millis(50);
        assert!(matches!(
            conn.read_message(Some(deadline)).await,
            Err(ConnError::Timeout(_))
        ));

        drop(server);
        assert!(matches!(conn.read_message(None).await, Err(ConnError::Closed)));
        assert!(matches!(
            conn.read_message(None).await,
            Err(ConnError::NotConnected)
        ));
    }
}
