//! Broadcast message wire model.
//!
//! Traffic is newline-delimited UTF-8 text, one message per line:
//!
//! - causal broadcast: `c1,c2,...,cN:content`
//! - sequenced: `seqNo-origin-c1,c2,...,cN:content`
//!
//! The origin of a fresh causal message is not on the wire: it is the peer
//! the line arrived from, supplied by the receiving channel. Sequenced
//! messages travel on the sequencer's channel, so the sequencer embeds the
//! origin as an explicit field. The origin-less legacy sequenced form
//! (`seqNo-clock:content`) is still accepted, recovering the origin from a
//! trailing `from Node <id>` content marker; that path is a compatibility
//! shim, not the canonical codec.

use std::cmp::Ordering;
use std::fmt;

use super::clock::{ClockParseError, NodeId, VectorClock};

/// Marker scanned by the legacy origin sniffer.
const ORIGIN_MARKER: &str = "from Node ";

/// An immutable causal broadcast message.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Message {
    /// Vector-clock snapshot taken by the sender's stamp.
    clock: VectorClock,
    /// Originating process id.
    origin: NodeId,
    /// Free-text payload. Must not contain `:` or newline.
    content: String,
}

impl Message {
    pub fn new(clock: VectorClock, origin: NodeId, content: String) -> Self {
        Message {
            clock,
            origin,
            content,
        }
    }

    pub fn clock(&self) -> &VectorClock {
        &self.clock
    }

    pub fn origin(&self) -> NodeId {
        self.origin
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    /// Serialize to the causal wire form.
    pub fn to_wire(&self) -> String {
        format!("{}:{}", self.clock, self.content)
    }

    /// Parse a causal wire line received from `origin`.
    ///
    /// `num_processes` bounds the expected clock length; a mismatched
    /// clock is rejected rather than silently truncated or padded.
    pub fn parse(line: &str, origin: NodeId, num_processes: usize) -> Result<Self, WireError> {
        let (clock_part, content) = line
            .split_once(':')
            .ok_or(WireError::MissingClockDelimiter)?;
        let clock: VectorClock = clock_part.parse().map_err(WireError::BadClock)?;
        if clock.len() != num_processes {
            return Err(WireError::ClockLength {
                expected: num_processes,
                found: clock.len(),
            });
        }
        if origin == 0 || origin as usize > num_processes {
            return Err(WireError::BadOrigin(origin.to_string()));
        }
        Ok(Message {
            clock,
            origin,
            content: content.to_string(),
        })
    }
}

// The delivery queue needs a lawful total order that refines causality:
// delivery only ever grows a clock, so a causally earlier message always
// has a strictly smaller component sum. Concurrent messages fall back to
// origin id, then to the raw clock and content so that Ord stays
// consistent with Eq.
impl Ord for Message {
    fn cmp(&self, other: &Self) -> Ordering {
        self.clock
            .weight()
            .cmp(&other.clock.weight())
            .then_with(|| self.origin.cmp(&other.origin))
            .then_with(|| self.clock.components().cmp(other.clock.components()))
            .then_with(|| self.content.cmp(&other.content))
    }
}

impl PartialOrd for Message {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_wire())
    }
}

/// A message wrapped with its sequencer-assigned position in the global
/// total order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequencedMessage {
    sequence_no: u64,
    message: Message,
}

impl SequencedMessage {
    pub fn new(sequence_no: u64, message: Message) -> Self {
        SequencedMessage {
            sequence_no,
            message,
        }
    }

    pub fn sequence_no(&self) -> u64 {
        self.sequence_no
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn into_message(self) -> Message {
        self.message
    }

    /// Serialize to the sequenced wire form, origin carried explicitly.
    pub fn to_wire(&self) -> String {
        format!(
            "{}-{}-{}",
            self.sequence_no,
            self.message.origin,
            self.message.to_wire()
        )
    }

    /// Parse a sequenced wire line.
    ///
    /// Accepts both the canonical `seq-origin-clock:content` form and the
    /// legacy `seq-clock:content` form; the latter recovers the origin
    /// from the content marker.
    pub fn parse(line: &str, num_processes: usize) -> Result<Self, WireError> {
        let (seq_part, rest) = line
            .split_once('-')
            .ok_or(WireError::MissingSequenceDelimiter)?;
        let sequence_no = seq_part
            .parse::<u64>()
            .map_err(|_| WireError::BadSequenceNumber(seq_part.to_string()))?;

        if has_leading_int_field(rest) {
            let (origin_part, causal) = rest
                .split_once('-')
                .ok_or(WireError::MissingSequenceDelimiter)?;
            let origin = origin_part
                .parse::<NodeId>()
                .map_err(|_| WireError::BadOrigin(origin_part.to_string()))?;
            let message = Message::parse(causal, origin, num_processes)?;
            Ok(SequencedMessage {
                sequence_no,
                message,
            })
        } else {
            // Legacy form: no origin field; sniff the content marker.
            let (clock_part, content) = rest
                .split_once(':')
                .ok_or(WireError::MissingClockDelimiter)?;
            let clock: VectorClock = clock_part.parse().map_err(WireError::BadClock)?;
            if clock.len() != num_processes {
                return Err(WireError::ClockLength {
                    expected: num_processes,
                    found: clock.len(),
                });
            }
            let origin = sniff_origin(content).ok_or(WireError::UnknownOrigin)?;
            if origin == 0 || origin as usize > num_processes {
                return Err(WireError::BadOrigin(origin.to_string()));
            }
            Ok(SequencedMessage {
                sequence_no,
                message: Message::new(clock, origin, content.to_string()),
            })
        }
    }
}

// Ordered by sequence number; the message tail keeps Ord total and
// consistent with Eq.
impl Ord for SequencedMessage {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sequence_no
            .cmp(&other.sequence_no)
            .then_with(|| self.message.cmp(&other.message))
    }
}

impl PartialOrd for SequencedMessage {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Classify an inbound line: `true` when it carries a sequence-number
/// prefix (`digits-`), `false` when it starts with a clock (`digits,` or
/// `digits:`).
pub fn is_sequenced_wire(line: &str) -> bool {
    has_leading_int_field(line)
}

/// `true` when the string starts with one or more ASCII digits followed
/// directly by `-`.
fn has_leading_int_field(s: &str) -> bool {
    match s.find(|c: char| !c.is_ascii_digit()) {
        Some(i) => i > 0 && s.as_bytes()[i] == b'-',
        None => false,
    }
}

/// Legacy origin recovery: a trailing `from Node <id>` marker in the
/// payload text.
fn sniff_origin(content: &str) -> Option<NodeId> {
    let idx = content.rfind(ORIGIN_MARKER)?;
    content[idx + ORIGIN_MARKER.len()..].trim().parse().ok()
}

/// Malformed wire text. Receivers log these and keep reading; one bad
/// line never takes down a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// No `:` between clock and content.
    MissingClockDelimiter,
    /// No `-` after the sequence number.
    MissingSequenceDelimiter,
    /// Clock components failed to parse.
    BadClock(ClockParseError),
    /// Clock had the wrong number of slots for this cluster.
    ClockLength { expected: usize, found: usize },
    /// Sequence number was not a non-negative integer.
    BadSequenceNumber(String),
    /// Origin id missing, unparsable, or outside 1..=N.
    BadOrigin(String),
    /// Legacy sequenced form with no recoverable origin marker.
    UnknownOrigin,
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireError::MissingClockDelimiter => {
                write!(f, "no ':' delimiter between clock and content")
            }
            WireError::MissingSequenceDelimiter => {
                write!(f, "no '-' delimiter after sequence number")
            }
            WireError::BadClock(e) => write!(f, "bad clock: {}", e),
            WireError::ClockLength { expected, found } => {
                write!(f, "clock has {} slots, expected {}", found, expected)
            }
            WireError::BadSequenceNumber(s) => write!(f, "bad sequence number {:?}", s),
            WireError::BadOrigin(s) => write!(f, "bad origin id {:?}", s),
            WireError::UnknownOrigin => write!(f, "legacy sequenced line with no origin marker"),
        }
    }
}

impl std::error::Error for WireError {}
