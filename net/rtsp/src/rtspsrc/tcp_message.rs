// RTSP Source 2 - TCP message framing
//
// Copyright (C) 2023-2024 Nirbheek Chauhan <nirbheek centricular com>
//
// This Source Code Form is subject to the terms of the Mozilla Public License, v2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at
// <https://mozilla.org/MPL/2.0/>.
//
// SPDX-License-Identifier: MPL-2.0

use std::io;

use futures::{Sink, Stream};
use rtsp_types::{Message, ParseError};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::body::Body;

const READ_CHUNK_SIZE: usize = 4096;

#[derive(thiserror::Error, Debug)]
pub enum ReadError {
    #[error("I/O error while reading: {0}")]
    Io(#[from] io::Error),
    #[error("Message exceeds maximum size of {0} bytes")]
    TooBig(usize),
    #[error("Could not parse RTSP message")]
    Parse,
}

/// Turns the read half of the control connection into a stream of parsed messages.
///
/// Requests, responses and interleaved data frames are all yielded. The stream ends cleanly
/// when the peer closes the connection on a message boundary. Any framing error is the last
/// item of the stream.
pub(crate) fn async_read<R>(
    reader: R,
    max_size: usize,
) -> impl Stream<Item = Result<Message<Body>, ReadError>> + Send
where
    R: AsyncRead + Unpin + Send,
{
    futures::stream::unfold(
        Some((reader, Vec::with_capacity(READ_CHUNK_SIZE))),
        move |state| async move {
            let (mut reader, mut buf) = state?;
            loop {
                // Some servers pad keep-alive replies with stray line endings
                let skip = buf
                    .iter()
                    .take_while(|b| **b == b'\r' || **b == b'\n')
                    .count();
                if skip > 0 {
                    buf.drain(..skip);
                }

                if !buf.is_empty() {
                    match Message::<Body>::parse(&buf) {
                        Ok((msg, consumed)) => {
                            buf.drain(..consumed);
                            return Some((Ok(msg), Some((reader, buf))));
                        }
                        Err(ParseError::Incomplete(_)) => {
                            if buf.len() >= max_size {
                                return Some((Err(ReadError::TooBig(max_size)), None));
                            }
                        }
                        Err(_) => return Some((Err(ReadError::Parse), None)),
                    }
                }

                let mut chunk = [0u8; READ_CHUNK_SIZE];
                match reader.read(&mut chunk).await {
                    Ok(0) if buf.is_empty() => return None,
                    Ok(0) => {
                        let err = io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "connection closed in the middle of a message",
                        );
                        return Some((Err(err.into()), None));
                    }
                    Ok(n) => buf.extend_from_slice(&chunk[..n]),
                    Err(err) => return Some((Err(err.into()), None)),
                }
            }
        },
    )
}

/// Turns the write half of the control connection into a sink of messages.
pub(crate) fn async_write<W>(writer: W) -> impl Sink<Message<Body>, Error = io::Error> + Send
where
    W: AsyncWrite + Unpin + Send,
{
    futures::sink::unfold(writer, |mut writer, msg: Message<Body>| async move {
        let mut data = Vec::new();
        msg.write(&mut data)
            .map_err(|err| io::Error::other(format!("{err:?}")))?;
        writer.write_all(&data).await?;
        writer.flush().await?;
        Ok::<_, io::Error>(writer)
    })
}
