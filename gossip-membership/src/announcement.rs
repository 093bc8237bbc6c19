//! Plain-text heartbeat payload exchanged over the multicast group.
//!
//! Each datagram carries exactly one announcement, `<name>:<address>`, with no
//! framing beyond the datagram boundary. Surrounding whitespace is ignored on
//! the whole payload and on each field, so `" alice : 10.0.0.1:9999 "` is read
//! as name `alice` and address `10.0.0.1:9999`.
//!
//! The name ends at the first colon. The address may carry one more colon
//! only as a `host:port` pair with a numeric port; any other colon makes the
//! payload malformed. Names containing colons and IPv6 literals are therefore
//! unsupported.

use std::fmt;

use thiserror::Error;

use crate::membership::Identity;

const SEPARATOR: char = ':';

/// Reasons a received payload is discarded instead of merged.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedAnnouncement {
    #[error("expected <name>:<address>, found no separator")]
    MissingSeparator,
    #[error("expected 2 colon-delimited fields, found {0}")]
    TooManyFields(usize),
    #[error("name and address must not be empty")]
    EmptyField,
}

/// One node's claim of where it can be reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Announcement {
    pub name: String,
    pub address: String,
}

impl Announcement {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
        }
    }

    /// Datagram payload for this announcement.
    pub fn encode(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }

    /// Reads a raw datagram. Invalid UTF-8 is replaced rather than rejected so
    /// the caller can still log what arrived.
    pub fn decode(bytes: &[u8]) -> Result<Self, MalformedAnnouncement> {
        Self::parse(&String::from_utf8_lossy(bytes))
    }

    pub fn parse(text: &str) -> Result<Self, MalformedAnnouncement> {
        let text = text.trim();
        let (name, address) = text
            .split_once(SEPARATOR)
            .ok_or(MalformedAnnouncement::MissingSeparator)?;
        let (name, address) = (name.trim(), address.trim());

        if let Some((host, port)) = address.rsplit_once(SEPARATOR) {
            if !is_host_port(host, port) {
                return Err(MalformedAnnouncement::TooManyFields(
                    text.split(SEPARATOR).count(),
                ));
            }
        }

        if name.is_empty() || address.is_empty() {
            return Err(MalformedAnnouncement::EmptyField);
        }

        Ok(Self::new(name, address))
    }

    pub fn into_parts(self) -> (String, String) {
        (self.name, self.address)
    }
}

fn is_host_port(host: &str, port: &str) -> bool {
    !host.trim().is_empty() && !host.contains(SEPARATOR) && port.parse::<u16>().is_ok()
}

impl From<&Identity> for Announcement {
    fn from(identity: &Identity) -> Self {
        Self::new(identity.name.clone(), identity.address.clone())
    }
}

impl fmt::Display for Announcement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{SEPARATOR}{}", self.name, self.address)
    }
}
