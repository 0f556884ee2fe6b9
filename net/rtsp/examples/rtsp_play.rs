// Plays an RTSP URL and prints what arrives
//
// Copyright (C) 2025 GStreamer developers
//
// This Source Code Form is subject to the terms of the Mozilla Public License, v2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at
// <https://mozilla.org/MPL/2.0/>.
//
// SPDX-License-Identifier: MPL-2.0

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use tokio::sync::mpsc;

use rtspsource::{Event, PayloadKind, RtspSrc, Settings, UdpSessionManager};

#[derive(Clone, Debug)]
struct Config {
    url: String,
    settings: Option<String>,
    duration: Option<Duration>,
}

fn usage() -> String {
    "Usage: rtsp_play <rtsp-url> [--settings <file.toml>] [--duration <seconds>]".to_string()
}

fn parse_args() -> Result<Config> {
    let mut args = std::env::args().skip(1);
    let mut url = None;
    let mut settings = None;
    let mut duration = None;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--settings" => settings = Some(args.next().ok_or_else(|| anyhow!(usage()))?),
            "--duration" => {
                let secs = args
                    .next()
                    .ok_or_else(|| anyhow!(usage()))?
                    .parse::<u64>()
                    .context("Invalid --duration")?;
                duration = Some(Duration::from_secs(secs));
            }
            "-h" | "--help" => return Err(anyhow!(usage())),
            _ if url.is_none() => url = Some(arg),
            other => return Err(anyhow!("Unexpected argument {other}\n{}", usage())),
        }
    }

    Ok(Config {
        url: url.ok_or_else(|| anyhow!(usage()))?,
        settings,
        duration,
    })
}

fn load_settings(path: Option<&str>) -> Result<Settings> {
    let Some(path) = path else {
        return Ok(Settings::default());
    };
    let text = std::fs::read_to_string(path).with_context(|| format!("Reading {path}"))?;
    toml::from_str(&text).with_context(|| format!("Parsing {path}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = parse_args()?;
    let settings = load_settings(config.settings.as_deref())?;

    let (manager, mut udp_packets) = UdpSessionManager::new(settings.udp_timeout);
    let (src, mut events) = RtspSrc::new(settings, Arc::new(manager))?;
    src.open(&config.url).await?;

    let (tx, mut interleaved) = mpsc::unbounded_channel::<(u32, PayloadKind, Bytes)>();
    for stream in src.streams().await.iter().filter(|s| !s.disabled) {
        println!("Stream {}: {}", stream.id, stream.caps);
        let (stream_tx, mut stream_rx) = mpsc::unbounded_channel();
        src.attach_sink(stream.id, Box::new(stream_tx)).await;
        let (id, tx) = (stream.id, tx.clone());
        tokio::spawn(async move {
            while let Some((kind, data)) = stream_rx.recv().await {
                if tx.send((id, kind, data)).is_err() {
                    break;
                }
            }
        });
    }
    drop(tx);

    src.play().await?;

    let deadline = async {
        match config.duration {
            Some(duration) => tokio::time::sleep(duration).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => break,
            _ = tokio::signal::ctrl_c() => break,
            Some(event) = events.recv() => {
                println!("{event:?}");
                if matches!(event, Event::Eos | Event::Error(_)) {
                    break;
                }
            }
            Some((id, kind, data)) = interleaved.recv() => {
                println!("Stream {id}: {kind:?} {} bytes", data.len());
            }
            Some(packet) = udp_packets.recv() => {
                println!(
                    "Stream {}: {:?} {} bytes from {}",
                    packet.stream_id,
                    packet.kind,
                    packet.data.len(),
                    packet.from
                );
            }
        }
    }

    src.close().await?;
    Ok(())
}
