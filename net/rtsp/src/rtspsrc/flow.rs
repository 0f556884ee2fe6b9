// RTSP Source 2 - Flow aggregation
//
// Copyright (C) 2025 GStreamer developers
//
// This Source Code Form is subject to the terms of the Mozilla Public License, v2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at
// <https://mozilla.org/MPL/2.0/>.
//
// SPDX-License-Identifier: MPL-2.0

/// Result of handing a packet to a stream sink.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum FlowResult {
    #[default]
    Ok,
    /// Nobody consumes this stream, which is not fatal on its own.
    NotLinked,
    Flushing,
    Eos,
    Error,
}

impl FlowResult {
    pub fn is_fatal(self) -> bool {
        !matches!(self, FlowResult::Ok | FlowResult::NotLinked)
    }
}

/// Combines the last results of all streams into one.
///
/// Any `Ok` wins. If every stream is `NotLinked` (or there are none) the result is
/// `NotLinked`, otherwise the first result that is neither.
pub fn combine<I>(flows: I) -> FlowResult
where
    I: IntoIterator<Item = FlowResult>,
{
    let mut first_other = None;
    for flow in flows {
        match flow {
            FlowResult::Ok => return FlowResult::Ok,
            FlowResult::NotLinked => {}
            other => {
                first_other.get_or_insert(other);
            }
        }
    }
    first_other.unwrap_or(FlowResult::NotLinked)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_combine() {
        use FlowResult::*;

        assert_eq!(combine(Vec::<FlowResult>::new()), NotLinked);
        assert_eq!(combine([NotLinked, NotLinked]), NotLinked);
        assert_eq!(combine([Eos, Ok, Error]), Ok);
        assert_eq!(combine([NotLinked, Eos, Error]), Eos);
        assert_eq!(combine([Flushing, NotLinked]), Flushing);

        assert!(!NotLinked.is_fatal());
        assert!(Eos.is_fatal());
    }
}
