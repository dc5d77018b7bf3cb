//! Text decoders for the BLE-UART sensor stream.
//!
//! Notifications arrive as raw byte chunks whose boundaries have nothing to do
//! with record boundaries.  Decoding happens in two stages:
//!
//! | Stage | Item | State |
//! |---|---|---|
//! | [`FrameDecoder::feed`] | bytes → normalized lines | buffers the unterminated tail |
//! | [`parse_reading`] | line → [`Reading`] | none (pure) |
//!
//! # Line normalization
//!
//! A record is everything before a `\n`.  Before it is handed on, every byte
//! below `0x20` (this includes `\r` and NUL padding some bridges emit) and
//! `0x7F` is removed, the rest is decoded as UTF-8 and surrounding whitespace
//! is trimmed.  Lines that end up empty are still emitted; [`parse_reading`]
//! skips them.

use std::collections::VecDeque;

use log::{debug, warn};
use nom::number::complete::recognize_float;

use crate::error::{DecodeError, ReadingError};
use crate::protocol::{DEFAULT_MAX_LINE_LEN, LINE_TERMINATOR};
use crate::types::{Reading, SensorKind};

// ── Frame decoder ────────────────────────────────────────────────────────────

/// Incrementally splits a chunked byte stream into normalized text lines.
///
/// # Usage
///
/// ```
/// # use ble_uart_sensor::parse::FrameDecoder;
/// let mut dec = FrameDecoder::new();
/// let first: Vec<_> = dec.feed(b"E1.0\nP2").collect();
/// assert_eq!(first, vec![Ok("E1.0".to_string())]);
/// let second: Vec<_> = dec.feed(b".5\n").collect();
/// assert_eq!(second, vec![Ok("P2.5".to_string())]);
/// ```
///
/// Bytes are never reordered.  Lines completed by a `feed` call but not pulled
/// from the returned iterator stay queued and come out first on the next call.
///
/// The unterminated remainder is capped at `max_pending` bytes.  Going over the
/// cap, or completing a line that is not valid UTF-8, yields a [`DecodeError`].
/// The decoder then drops everything up to and including the next terminator,
/// so the tail of a rejected record never comes out as a line of its own.
#[derive(Debug)]
pub struct FrameDecoder {
    /// Bytes after the last terminator.  Never contains [`LINE_TERMINATOR`].
    pending: Vec<u8>,
    ready: VecDeque<Result<String, DecodeError>>,
    max_pending: usize,
    /// Inside a rejected record; bytes are dropped until the next terminator.
    discarding: bool,
}

impl FrameDecoder {
    /// Create a decoder with the default remainder cap
    /// ([`DEFAULT_MAX_LINE_LEN`]).
    pub fn new() -> Self {
        Self::with_max_pending(DEFAULT_MAX_LINE_LEN)
    }

    /// Create a decoder that reports an overflow once more than `max_pending`
    /// bytes are buffered without a terminator.
    pub fn with_max_pending(max_pending: usize) -> Self {
        Self {
            pending: Vec::new(),
            ready: VecDeque::new(),
            max_pending,
            discarding: false,
        }
    }

    /// Append `chunk` and return the lines it completes.
    pub fn feed(&mut self, chunk: &[u8]) -> Lines<'_> {
        let mut chunk = chunk;
        if self.discarding {
            match chunk.iter().position(|&b| b == LINE_TERMINATOR) {
                Some(pos) => {
                    debug!("Frame decoder: resynced after {} dropped bytes", pos + 1);
                    self.discarding = false;
                    chunk = &chunk[pos + 1..];
                }
                None => {
                    return Lines {
                        ready: &mut self.ready,
                    }
                }
            }
        }
        self.pending.extend_from_slice(chunk);

        let mut start = 0;
        let mut corrupted = false;
        while let Some(pos) = self.pending[start..]
            .iter()
            .position(|&b| b == LINE_TERMINATOR)
        {
            let end = start + pos;
            let line = normalize_line(&self.pending[start..end]);
            if let Err(e) = &line {
                warn!("Frame decoder: {e}");
                corrupted = true;
            }
            self.ready.push_back(line);
            start = end + 1;
        }
        self.pending.drain(..start);

        if corrupted && !self.pending.is_empty() {
            debug!(
                "Frame decoder: dropping {} buffered bytes after a bad line",
                self.pending.len()
            );
            self.pending.clear();
            self.discarding = true;
        }

        if self.pending.len() > self.max_pending {
            let err = DecodeError::Overflow {
                len: self.pending.len(),
                cap: self.max_pending,
            };
            warn!("Frame decoder: {err}");
            self.pending.clear();
            self.discarding = true;
            self.ready.push_back(Err(err));
        }

        Lines {
            ready: &mut self.ready,
        }
    }

    /// Number of bytes buffered after the last terminator.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Drop everything buffered, including queued lines.
    pub fn reset(&mut self) {
        self.pending.clear();
        self.ready.clear();
        self.discarding = false;
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Lines completed so far, in arrival order.  Returned by [`FrameDecoder::feed`].
pub struct Lines<'a> {
    ready: &'a mut VecDeque<Result<String, DecodeError>>,
}

impl Iterator for Lines<'_> {
    type Item = Result<String, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.ready.pop_front()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.ready.len(), Some(self.ready.len()))
    }
}

/// Normalize one raw record (terminator already removed).
///
/// Strips bytes `< 0x20` and `0x7F`, decodes UTF-8, trims whitespace.
///
/// ```
/// # use ble_uart_sensor::parse::normalize_line;
/// assert_eq!(normalize_line(b"E1.0\r\0").unwrap(), "E1.0");
/// assert_eq!(normalize_line(b"  P\x072.5 ").unwrap(), "P2.5");
/// ```
pub fn normalize_line(raw: &[u8]) -> Result<String, DecodeError> {
    let kept: Vec<u8> = raw
        .iter()
        .copied()
        .filter(|&b| b >= 0x20 && b != 0x7F)
        .collect();
    let text =
        String::from_utf8(kept).map_err(|_| DecodeError::InvalidUtf8 { len: raw.len() })?;
    Ok(text.trim().to_owned())
}

// ── Reading parser ───────────────────────────────────────────────────────────

/// Classify one normalized line.
///
/// | Line | Result |
/// |---|---|
/// | `""` | `None` |
/// | `"E<number>"` | `Some(Reading::Sample { kind: Ecg, .. })` |
/// | `"P<number>"` | `Some(Reading::Sample { kind: Ppg, .. })` |
/// | `"E<garbage>"` / `"P<garbage>"` | `Some(Reading::Invalid { .. })` |
/// | `"E"`, `"P"`, any other first character | `None` (logged at debug level) |
///
/// ```
/// # use ble_uart_sensor::parse::parse_reading;
/// # use ble_uart_sensor::types::{Reading, SensorKind};
/// assert_eq!(
///     parse_reading("E37.2"),
///     Some(Reading::Sample { kind: SensorKind::Ecg, value: 37.2 })
/// );
/// assert_eq!(parse_reading("Q5"), None);
/// ```
pub fn parse_reading(line: &str) -> Option<Reading> {
    let mut chars = line.chars();
    let kind = match chars.next()? {
        'E' => SensorKind::Ecg,
        'P' => SensorKind::Ppg,
        _ => {
            debug!("Dropping line with unknown tag: {line:?}");
            return None;
        }
    };

    let number = chars.as_str();
    if number.is_empty() {
        debug!("Dropping bare {kind} tag");
        return None;
    }

    Some(match parse_decimal(number) {
        Some(value) => Reading::Sample { kind, value },
        None => Reading::Invalid {
            raw_text: line.to_owned(),
            reason: ReadingError::BadNumber(kind).to_string(),
        },
    })
}

/// Parse a decimal floating-point literal that makes up all of `text`.
///
/// Accepts an optional sign, digits, an optional fraction and an optional
/// exponent.  Rejects `inf`/`nan` spellings, embedded whitespace, locale
/// separators (`"1,5"`) and values that overflow `f64`.
fn parse_decimal(text: &str) -> Option<f64> {
    let (rest, literal) = recognize_float::<&str, nom::error::Error<&str>>(text).ok()?;
    if !rest.is_empty() {
        return None;
    }
    literal.parse::<f64>().ok().filter(|v| v.is_finite())
}
