//! Game-sync packets and their text encoding.
//!
//! A packet is a name followed by zero or more string parameters:
//!
//! ```text
//! name PARAM_DELIM param0 PARAM_DELIM param1 ...
//! ```
//!
//! Several packets are joined into one batch with [`MSG_DELIM`]. Both
//! delimiters are Unicode noncharacters, so ordinary text never contains them;
//! encoding refuses packets which do.

use {
    bytes::Bytes,
    core::fmt,
    derive_more::{Display, Error},
    tracing::debug,
};

/// Separates messages inside a batch.
pub const MSG_DELIM: &str = "\u{FFFE}";

/// Separates a message's name from its parameters, and parameters from each
/// other.
pub const PARAM_DELIM: &str = "\u{FFFF}";

/// Name of the room-sync packet, which is flushed after every other packet.
pub const SYNC_ROOM: &str = "sr";

/// Flush class of a queued packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PacketClass {
    /// Sent in the first partition of a flush.
    #[default]
    Immediate,
    /// Sent only after all immediate packets queued in the same flush.
    Deferred,
}

impl PacketClass {
    /// Default classification of a packet by its name.
    #[must_use]
    pub fn of_name(name: &str) -> Self {
        if name == SYNC_ROOM {
            Self::Deferred
        } else {
            Self::Immediate
        }
    }
}

/// Outbound game-sync packet.
pub trait Packet {
    /// Name used by the receiver to dispatch this packet.
    fn name(&self) -> &str;

    /// Appends this packet's parameters.
    fn write_params(&self, params: &mut Params);

    /// Flush class of this packet.
    fn class(&self) -> PacketClass {
        PacketClass::of_name(self.name())
    }
}

/// Parameter list being written by [`Packet::write_params`].
#[derive(Debug, Clone, Default)]
pub struct Params(Vec<String>);

impl Params {
    /// Appends a parameter, formatted with [`Display`](fmt::Display).
    pub fn push(&mut self, value: impl fmt::Display) -> &mut Self {
        self.0.push(value.to_string());
        self
    }

    /// Appends a boolean parameter encoded as `1` or `0`.
    pub fn push_bool(&mut self, value: bool) -> &mut Self {
        self.push(u8::from(value))
    }

    /// Parameters written so far.
    #[must_use]
    pub fn as_slice(&self) -> &[String] {
        &self.0
    }
}

/// Packet names or parameters contained a delimiter sequence.
#[derive(Debug, Clone, PartialEq, Eq, Display, Error)]
#[display("packet `{name}` contains a delimiter in {field}")]
pub struct DelimiterInPayload {
    /// Name of the offending packet.
    pub name: String,
    /// Which field contained the delimiter.
    pub field: PacketField,
}

/// Part of a packet, used in [`DelimiterInPayload`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum PacketField {
    /// The packet name.
    #[display("its name")]
    Name,
    /// A parameter at the given index.
    #[display("parameter {_0}")]
    Param(usize),
}

fn contains_delim(s: &str) -> bool {
    s.contains(MSG_DELIM) || s.contains(PARAM_DELIM)
}

/// Packet encoded and classified, ready to be put into a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedPacket {
    class: PacketClass,
    payload: Bytes,
}

impl QueuedPacket {
    /// Encodes and classifies a packet.
    ///
    /// # Errors
    ///
    /// Errors if the name or a parameter contains [`MSG_DELIM`] or
    /// [`PARAM_DELIM`].
    pub fn new(packet: &(impl Packet + ?Sized)) -> Result<Self, DelimiterInPayload> {
        let name = packet.name();
        if contains_delim(name) {
            return Err(DelimiterInPayload {
                name: name.to_owned(),
                field: PacketField::Name,
            });
        }

        let mut params = Params::default();
        packet.write_params(&mut params);

        let mut buf = String::from(name);
        for (index, param) in params.0.iter().enumerate() {
            if contains_delim(param) {
                return Err(DelimiterInPayload {
                    name: name.to_owned(),
                    field: PacketField::Param(index),
                });
            }
            buf.push_str(PARAM_DELIM);
            buf.push_str(param);
        }

        Ok(Self {
            class: packet.class(),
            payload: Bytes::from(buf),
        })
    }

    /// Flush class fixed when this packet was queued.
    #[must_use]
    pub const fn class(&self) -> PacketClass {
        self.class
    }

    /// Encoded bytes of this packet.
    #[must_use]
    pub const fn payload(&self) -> &Bytes {
        &self.payload
    }
}

/// General purpose packet made of a name and string parameters.
///
/// # Examples
///
/// ```
/// use rpgsync_io::packet::{NamedPacket, PacketClass, QueuedPacket};
///
/// let packet = NamedPacket::new("m").param(3).param(4);
/// let queued = QueuedPacket::new(&packet).unwrap();
/// assert_eq!(PacketClass::Immediate, queued.class());
/// assert_eq!("m\u{FFFF}3\u{FFFF}4".as_bytes(), &queued.payload()[..]);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedPacket {
    name: String,
    params: Vec<String>,
    class: PacketClass,
}

impl NamedPacket {
    /// Creates a packet with no parameters, classified by its name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let class = PacketClass::of_name(&name);
        Self {
            name,
            params: Vec::new(),
            class,
        }
    }

    /// Appends a parameter.
    #[must_use]
    pub fn param(mut self, value: impl fmt::Display) -> Self {
        self.params.push(value.to_string());
        self
    }

    /// Overrides the flush class derived from the name.
    #[must_use]
    pub const fn with_class(mut self, class: PacketClass) -> Self {
        self.class = class;
        self
    }
}

impl Packet for NamedPacket {
    fn name(&self) -> &str {
        &self.name
    }

    fn write_params(&self, params: &mut Params) {
        for param in &self.params {
            params.push(param);
        }
    }

    fn class(&self) -> PacketClass {
        self.class
    }
}

/// Inbound message parsed out of a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message<'a> {
    /// Name the message is dispatched by.
    pub name: &'a str,
    /// Everything after the first [`PARAM_DELIM`], unsplit.
    pub raw_params: &'a str,
    /// Parameters split on [`PARAM_DELIM`].
    pub params: Vec<&'a str>,
}

/// Splits a received batch into messages.
///
/// Empty messages are skipped. If the batch is not valid UTF-8, nothing is
/// returned.
///
/// # Examples
///
/// ```
/// use rpgsync_io::packet::parse_batch;
///
/// let batch = "s\u{FFFF}1\u{FFFF}2\u{FFFE}ping".as_bytes();
/// let msgs = parse_batch(batch);
/// assert_eq!("s", msgs[0].name);
/// assert_eq!(vec!["1", "2"], msgs[0].params);
/// assert_eq!("ping", msgs[1].name);
/// assert!(msgs[1].params.is_empty());
/// ```
#[must_use]
pub fn parse_batch(batch: &[u8]) -> Vec<Message<'_>> {
    let Ok(text) = core::str::from_utf8(batch) else {
        debug!("Dropping batch of {} bytes which is not UTF-8", batch.len());
        return Vec::new();
    };

    text.split(MSG_DELIM)
        .filter(|msg| !msg.is_empty())
        .map(|msg| match msg.split_once(PARAM_DELIM) {
            Some((name, raw_params)) => Message {
                name,
                raw_params,
                params: raw_params.split(PARAM_DELIM).collect(),
            },
            None => Message {
                name: msg,
                raw_params: "",
                params: Vec::new(),
            },
        })
        .collect()
}

#[cfg(test)]
mod tests {
    #![expect(clippy::unwrap_used, reason = "testing")]

    use super::*;

    struct Move {
        x: i32,
        y: i32,
    }

    impl Packet for Move {
        fn name(&self) -> &str {
            "m"
        }

        fn write_params(&self, params: &mut Params) {
            params.push(self.x).push(self.y);
        }
    }

    #[test]
    fn sync_room_is_deferred() {
        assert_eq!(PacketClass::Deferred, PacketClass::of_name("sr"));
        assert_eq!(PacketClass::Immediate, PacketClass::of_name("s"));
        assert_eq!(PacketClass::Immediate, PacketClass::of_name("srr"));

        let queued = QueuedPacket::new(&NamedPacket::new("sr").param(12)).unwrap();
        assert_eq!(PacketClass::Deferred, queued.class());
    }

    #[test]
    fn class_override_is_kept() {
        let packet = NamedPacket::new("sr").with_class(PacketClass::Immediate);
        let queued = QueuedPacket::new(&packet).unwrap();
        assert_eq!(PacketClass::Immediate, queued.class());
    }

    #[test]
    fn encode_custom_packet() {
        let queued = QueuedPacket::new(&Move { x: -1, y: 20 }).unwrap();
        assert_eq!("m\u{FFFF}-1\u{FFFF}20".as_bytes(), &queued.payload()[..]);
    }

    #[test]
    fn encode_no_params() {
        let queued = QueuedPacket::new(&NamedPacket::new("ping")).unwrap();
        assert_eq!(b"ping", &queued.payload()[..]);
    }

    #[test]
    fn reject_delimiters() {
        let err = QueuedPacket::new(&NamedPacket::new("say").param("a\u{FFFE}b")).unwrap_err();
        assert_eq!(PacketField::Param(0), err.field);

        let err = QueuedPacket::new(&NamedPacket::new("x\u{FFFF}")).unwrap_err();
        assert_eq!(PacketField::Name, err.field);
    }

    #[test]
    fn params_bool() {
        let mut params = Params::default();
        params.push_bool(true).push_bool(false);
        assert_eq!(["1", "0"], *params.as_slice());
    }

    #[test]
    fn parse_skips_empty_messages() {
        let batch = "\u{FFFE}a\u{FFFE}\u{FFFE}b\u{FFFF}\u{FFFE}".as_bytes();
        let msgs = parse_batch(batch);
        assert_eq!(2, msgs.len());
        assert_eq!("a", msgs[0].name);
        assert_eq!("b", msgs[1].name);
        assert_eq!(vec![""], msgs[1].params);
    }

    #[test]
    fn parse_keeps_raw_params() {
        let batch = "say\u{FFFF}hello\u{FFFF}world".as_bytes();
        let msgs = parse_batch(batch);
        assert_eq!("hello\u{FFFF}world", msgs[0].raw_params);
    }

    #[test]
    fn parse_rejects_invalid_utf8() {
        assert!(parse_batch(&[0xff, 0xfe, 0x00]).is_empty());
    }
}
