//! Mailbox messages and their string encoding.
//!
//! A mailbox lives in a single `Text` shared variable. Its encoding is a
//! `|`-separated list of tagged records:
//!
//! ```text
//! |location=1#2#3#4#5|text=1#7#2#hello|
//!  └─tag──┘ └dest#src#time#payload...┘
//! ```
//!
//! Payload kinds form a closed set ([`Payload`]); decoding goes through a
//! static tag → decoder table rather than any dynamic lookup.

use crate::error::{KernelError, KernelResult};
use mwgrid_env::{EntityId, Location, Time};
use serde::{Deserialize, Serialize};

/// Encoding of an empty mailbox; the initial value of every agent's mailbox.
pub const EMPTY_MAILBOX: &str = "|";

const RECORD_SEP: char = '|';
const TAG_SEP: char = '=';
const FIELD_SEP: char = '#';

/// Routing information every message carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeader {
    pub destination: EntityId,
    pub source: EntityId,
    pub send_time: Time,
}

/// The known message kinds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    /// No body; the header alone is the message.
    Signal,
    Location(Location),
    Int(i32),
    Text(String),
}

impl Payload {
    /// Tag written in front of the record.
    pub fn tag(&self) -> &'static str {
        match self {
            Payload::Signal => "signal",
            Payload::Location(_) => "location",
            Payload::Int(_) => "int",
            Payload::Text(_) => "text",
        }
    }

    fn encode_fields(&self, out: &mut String) {
        match self {
            Payload::Signal => {}
            Payload::Location(loc) => {
                push_field(out, &loc.x.to_string());
                push_field(out, &loc.y.to_string());
            }
            Payload::Int(v) => push_field(out, &v.to_string()),
            Payload::Text(text) => push_field(out, &escape(text)),
        }
    }
}

type Decoder = fn(&[&str]) -> KernelResult<Payload>;

/// Tag → decoder registry. Adding a payload kind means adding a row here.
const DECODERS: &[(&str, Decoder)] = &[
    ("signal", decode_signal),
    ("location", decode_location),
    ("int", decode_int),
    ("text", decode_text),
];

fn decoder_for(tag: &str) -> Option<Decoder> {
    DECODERS
        .iter()
        .find(|(known, _)| *known == tag)
        .map(|(_, decoder)| *decoder)
}

fn decode_signal(fields: &[&str]) -> KernelResult<Payload> {
    match fields {
        [] => Ok(Payload::Signal),
        _ => Err(KernelError::codec("signal carries no fields")),
    }
}

fn decode_location(fields: &[&str]) -> KernelResult<Payload> {
    match fields {
        [x, y] => Ok(Payload::Location(Location::new(parse_num(x)?, parse_num(y)?))),
        _ => Err(KernelError::codec("location expects x#y")),
    }
}

fn decode_int(fields: &[&str]) -> KernelResult<Payload> {
    match fields {
        [v] => Ok(Payload::Int(parse_num(v)?)),
        _ => Err(KernelError::codec("int expects one field")),
    }
}

fn decode_text(fields: &[&str]) -> KernelResult<Payload> {
    match fields {
        [text] => Ok(Payload::Text(unescape(text)?)),
        _ => Err(KernelError::codec("text expects one field")),
    }
}

/// One message in a mailbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub header: MessageHeader,
    pub payload: Payload,
}

impl Message {
    pub fn new(destination: EntityId, source: EntityId, send_time: Time, payload: Payload) -> Self {
        Self {
            header: MessageHeader {
                destination,
                source,
                send_time,
            },
            payload,
        }
    }

    pub fn destination(&self) -> EntityId {
        self.header.destination
    }

    pub fn source(&self) -> EntityId {
        self.header.source
    }

    pub fn send_time(&self) -> Time {
        self.header.send_time
    }

    /// Encodes this message as a single record, without separators.
    pub fn encode(&self) -> String {
        let mut out = String::from(self.payload.tag());
        out.push(TAG_SEP);
        out.push_str(&self.header.destination.to_string());
        push_field(&mut out, &self.header.source.to_string());
        push_field(&mut out, &self.header.send_time.to_string());
        self.payload.encode_fields(&mut out);
        out
    }

    /// Decodes a single record produced by [`encode`](Self::encode).
    pub fn decode(record: &str) -> KernelResult<Self> {
        let (tag, body) = record
            .split_once(TAG_SEP)
            .ok_or_else(|| KernelError::codec(format!("record without tag: '{record}'")))?;
        let decoder =
            decoder_for(tag).ok_or_else(|| KernelError::codec(format!("unknown message tag '{tag}'")))?;
        let fields: Vec<&str> = body.split(FIELD_SEP).collect();
        let [destination, source, send_time, rest @ ..] = fields.as_slice() else {
            return Err(KernelError::codec(format!("truncated header: '{record}'")));
        };
        Ok(Self::new(
            EntityId(parse_num(destination)?),
            EntityId(parse_num(source)?),
            parse_num(send_time)?,
            decoder(rest)?,
        ))
    }
}

/// Decoded mailbox contents, ordered by send time.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Mailbox {
    messages: Vec<Message>,
}

impl Mailbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses the encoded mailbox string.
    pub fn decode(encoded: &str) -> KernelResult<Self> {
        let mut mailbox = Mailbox::new();
        for record in encoded.split(RECORD_SEP).filter(|r| !r.is_empty()) {
            mailbox.push(Message::decode(record)?);
        }
        Ok(mailbox)
    }

    /// Encodes the mailbox; an empty mailbox encodes as [`EMPTY_MAILBOX`].
    pub fn encode(&self) -> String {
        let mut out = String::from(RECORD_SEP);
        for message in &self.messages {
            out.push_str(&message.encode());
            out.push(RECORD_SEP);
        }
        out
    }

    /// Inserts a message after any others with the same or earlier send time.
    pub fn push(&mut self, message: Message) {
        let at = self
            .messages
            .partition_point(|m| m.send_time() <= message.send_time());
        self.messages.insert(at, message);
    }

    /// Removes the earliest message sent strictly before `now`.
    pub fn pop_before(&mut self, now: Time) -> Option<Message> {
        match self.messages.first() {
            Some(first) if first.send_time() < now => Some(self.messages.remove(0)),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Message> {
        self.messages.iter()
    }
}

fn push_field(out: &mut String, field: &str) {
    out.push(FIELD_SEP);
    out.push_str(field);
}

fn parse_num<N: std::str::FromStr>(s: &str) -> KernelResult<N> {
    s.parse()
        .map_err(|_| KernelError::codec(format!("not a number: '{s}'")))
}

// Text payloads may contain the separators or line breaks; percent-escape them.
pub(crate) fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '%' => out.push_str("%25"),
            '#' => out.push_str("%23"),
            '=' => out.push_str("%3D"),
            '|' => out.push_str("%7C"),
            '\n' => out.push_str("%0A"),
            '\r' => out.push_str("%0D"),
            c => out.push(c),
        }
    }
    out
}

pub(crate) fn unescape(text: &str) -> KernelResult<String> {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(at) = rest.find('%') {
        out.push_str(&rest[..at]);
        let code = rest
            .get(at + 1..at + 3)
            .ok_or_else(|| KernelError::codec(format!("truncated escape in '{text}'")))?;
        out.push(match code {
            "25" => '%',
            "23" => '#',
            "3D" => '=',
            "7C" => '|',
            "0A" => '\n',
            "0D" => '\r',
            other => return Err(KernelError::codec(format!("unknown escape %{other}"))),
        });
        rest = &rest[at + 3..];
    }
    out.push_str(rest);
    Ok(out)
}
