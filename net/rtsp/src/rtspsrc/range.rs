// RTSP Source 2 - Range, RTP-Info and playback segment
//
// Copyright (C) 2025 GStreamer developers
//
// This Source Code Form is subject to the terms of the Mozilla Public License, v2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at
// <https://mozilla.org/MPL/2.0/>.
//
// SPDX-License-Identifier: MPL-2.0
//
// https://www.rfc-editor.org/rfc/rfc2326.html#section-3.6

use std::time::Duration;

use bitflags::bitflags;
use rtsp_types::headers::{NptRange, NptTime, Range};
use tracing::debug;
use url::Url;

/// Offset of an NPT time, `None` for `now`.
pub fn npt_offset(time: &NptTime) -> Option<Duration> {
    let (secs, nanos) = match *time {
        NptTime::Now => return None,
        NptTime::Seconds(secs, nanos) => (secs, nanos),
        NptTime::Hms(h, m, s, nanos) => (
            h.saturating_mul(3600) + u64::from(m) * 60 + u64::from(s),
            nanos,
        ),
    };
    Some(Duration::new(secs, nanos.unwrap_or(0)))
}

pub fn npt_time(offset: Duration) -> NptTime {
    let nanos = offset.subsec_nanos();
    NptTime::Seconds(offset.as_secs(), (nanos > 0).then_some(nanos))
}

/// `Range` of a PLAY request: from `start`, or from `now` to resume where the server is.
pub fn play_range(start: Option<Duration>, stop: Option<Duration>) -> Range {
    let from = start.map_or(NptTime::Now, npt_time);
    Range::Npt(match stop {
        Some(stop) => NptRange::FromTo(from, npt_time(stop)),
        None => NptRange::From(from),
    })
}

/// Whether an `RTP-Info` url designates `control`.
///
/// Servers often put their own address in `RTP-Info`, so urls are compared by path and
/// one path may end with the other.
pub fn url_matches(info: &Url, control: &Url) -> bool {
    if info == control {
        return true;
    }
    let (a, b) = (
        info.path().trim_end_matches('/'),
        control.path().trim_end_matches('/'),
    );
    if a.is_empty() || b.is_empty() {
        return false;
    }
    // Paths start with '/', so a suffix always ends on a segment boundary
    let (long, short) = if a.len() >= b.len() { (a, b) } else { (b, a) };
    long.ends_with(short)
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct SeekFlags: u8 {
        const FLUSH = 0b0001;
        /// Post `SegmentDone` instead of `Eos` at the end.
        const SEGMENT = 0b0010;
        const KEY_UNIT = 0b0100;
        const ACCURATE = 0b1000;
    }
}

/// Playback window, in NPT.
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    pub rate: f64,
    pub start: Duration,
    pub stop: Option<Duration>,
    pub position: Duration,
    pub duration: Option<Duration>,
    pub flags: SeekFlags,
}

impl Default for Segment {
    fn default() -> Self {
        Segment {
            rate: 1.0,
            start: Duration::ZERO,
            stop: None,
            position: Duration::ZERO,
            duration: None,
            flags: SeekFlags::empty(),
        }
    }
}

impl Segment {
    /// Applies a server range. Returns `true` if the duration changed.
    pub fn apply_range(&mut self, range: &Range) -> bool {
        let Range::Npt(npt) = range else {
            debug!("Ignoring non-NPT range {range}");
            return false;
        };
        let (start, end) = match npt {
            NptRange::From(start) => (npt_offset(start), None),
            NptRange::FromTo(start, end) => (npt_offset(start), npt_offset(end)),
            NptRange::To(end) => (None, npt_offset(end)),
            NptRange::Empty => (None, None),
        };

        if let Some(start) = start {
            self.start = start;
            self.position = start;
        }
        let Some(end) = end else {
            return false;
        };
        self.stop = Some(end);
        let changed = self.duration != Some(end);
        self.duration = Some(end);
        changed
    }

    pub fn apply_scale(&mut self, rate: f64) {
        if rate.is_finite() && rate != 0.0 {
            self.rate = rate;
        } else {
            tracing::warn!("Ignoring invalid Scale {rate}");
        }
    }

    /// Moves the position by `elapsed` of playback at the segment rate, clamped to the
    /// segment.
    pub fn advance(&mut self, elapsed: Duration) {
        let moved = elapsed.mul_f64(self.rate.abs());
        self.position = if self.rate > 0.0 {
            self.position.saturating_add(moved)
        } else {
            self.position.saturating_sub(moved)
        };
        if let Some(limit) = self.stop.or(self.duration) {
            self.position = self.position.min(limit);
        }
    }

    pub fn seek(&mut self, target: Duration, stop: Option<Duration>, rate: f64, flags: SeekFlags) {
        self.start = target;
        self.position = target;
        if stop.is_some() {
            self.stop = stop;
        }
        if rate.is_finite() && rate != 0.0 {
            self.rate = rate;
        }
        self.flags = flags;
    }
}
