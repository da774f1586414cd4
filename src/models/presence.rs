//! Presence records and their wire codec
//!
//! A presence record is a node's self-description: identity, current view and
//! the physical addresses peers should connect to. Records travel as a single
//! length-prefixed binary frame, both as registry values and as probe responses.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use super::{DiscoveryError, DiscoveryResult};

const CODEC_VERSION: u8 = 1;

/// A concrete host/port endpoint of a cluster member
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PhysicalAddress {
    pub host: String,
    pub port: u16,
}

impl PhysicalAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for PhysicalAddress {
    type Err = DiscoveryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| DiscoveryError::Configuration(format!("Missing port in address: {}", s)))?;

        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(DiscoveryError::Configuration(format!("Missing host in address: {}", s)));
        }

        let port = port
            .parse::<u16>()
            .map_err(|e| DiscoveryError::Configuration(format!("Invalid port in address {}: {}", s, e)))?;

        Ok(Self::new(host, port))
    }
}

/// Identifier of a membership view
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ViewId {
    /// Node id of the member that installed the view
    pub coordinator: String,
    pub id: u64,
}

/// A node's presence record
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PresenceRecord {
    pub node_id: String,
    pub logical_name: String,
    pub view_id: Option<ViewId>,
    pub is_coordinator: bool,
    pub addresses: BTreeSet<PhysicalAddress>,
    /// Opaque data owned by the membership layer
    pub payload: Bytes,
}

impl PresenceRecord {
    /// Create a record with no view and no addresses
    pub fn new(node_id: impl Into<String>, logical_name: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            logical_name: logical_name.into(),
            ..Default::default()
        }
    }

    pub fn with_address(mut self, address: PhysicalAddress) -> Self {
        self.addresses.insert(address);
        self
    }

    pub fn with_view(mut self, view_id: ViewId, is_coordinator: bool) -> Self {
        self.view_id = Some(view_id);
        self.is_coordinator = is_coordinator;
        self
    }

    pub fn with_payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = payload.into();
        self
    }

    /// Encode into a length-prefixed frame
    pub fn encode(&self) -> DiscoveryResult<Bytes> {
        let mut body = BytesMut::with_capacity(64 + self.payload.len());
        body.put_u8(CODEC_VERSION);
        put_str(&mut body, &self.node_id)?;
        put_str(&mut body, &self.logical_name)?;

        match &self.view_id {
            Some(view) => {
                body.put_u8(1);
                put_str(&mut body, &view.coordinator)?;
                body.put_u64(view.id);
            }
            None => body.put_u8(0),
        }

        body.put_u8(self.is_coordinator as u8);

        let count = u16::try_from(self.addresses.len())
            .map_err(|_| DiscoveryError::Serialization("Too many addresses".to_string()))?;
        body.put_u16(count);
        for address in &self.addresses {
            put_str(&mut body, &address.host)?;
            body.put_u16(address.port);
        }

        let payload_len = u32::try_from(self.payload.len())
            .map_err(|_| DiscoveryError::Serialization("Payload too large".to_string()))?;
        body.put_u32(payload_len);
        body.put_slice(&self.payload);

        let body_len = u32::try_from(body.len())
            .map_err(|_| DiscoveryError::Serialization("Record too large".to_string()))?;
        let mut frame = BytesMut::with_capacity(4 + body.len());
        frame.put_u32(body_len);
        frame.put_slice(&body);

        Ok(frame.freeze())
    }

    /// Decode a frame produced by [`PresenceRecord::encode`]
    pub fn decode(frame: &[u8]) -> DiscoveryResult<Self> {
        let mut reader = FrameReader { buf: frame };

        let body_len = reader.u32()? as usize;
        if reader.buf.len() != body_len {
            return Err(DiscoveryError::Malformed(format!(
                "Frame declares {} bytes, found {}",
                body_len,
                reader.buf.len()
            )));
        }

        let version = reader.u8()?;
        if version != CODEC_VERSION {
            return Err(DiscoveryError::Malformed(format!("Unknown version {}", version)));
        }

        let node_id = reader.string()?;
        let logical_name = reader.string()?;

        let view_id = if reader.flag()? {
            let coordinator = reader.string()?;
            let id = reader.u64()?;
            Some(ViewId { coordinator, id })
        } else {
            None
        };

        let is_coordinator = reader.flag()?;

        let count = reader.u16()?;
        let mut addresses = BTreeSet::new();
        for _ in 0..count {
            let host = reader.string()?;
            let port = reader.u16()?;
            addresses.insert(PhysicalAddress { host, port });
        }

        let payload_len = reader.u32()? as usize;
        let payload = Bytes::copy_from_slice(reader.take(payload_len)?);

        if !reader.buf.is_empty() {
            return Err(DiscoveryError::Malformed(format!(
                "{} trailing bytes",
                reader.buf.len()
            )));
        }

        Ok(Self {
            node_id,
            logical_name,
            view_id,
            is_coordinator,
            addresses,
            payload,
        })
    }
}

fn put_str(buf: &mut BytesMut, value: &str) -> DiscoveryResult<()> {
    let len = u16::try_from(value.len())
        .map_err(|_| DiscoveryError::Serialization(format!("String too long: {} bytes", value.len())))?;
    buf.put_u16(len);
    buf.put_slice(value.as_bytes());
    Ok(())
}

/// Bounds-checked reads over a frame
struct FrameReader<'a> {
    buf: &'a [u8],
}

impl<'a> FrameReader<'a> {
    fn ensure(&self, n: usize) -> DiscoveryResult<()> {
        if self.buf.remaining() < n {
            return Err(DiscoveryError::Malformed(format!(
                "Truncated frame: needed {} bytes, {} left",
                n,
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    fn u8(&mut self) -> DiscoveryResult<u8> {
        self.ensure(1)?;
        Ok(self.buf.get_u8())
    }

    fn u16(&mut self) -> DiscoveryResult<u16> {
        self.ensure(2)?;
        Ok(self.buf.get_u16())
    }

    fn u32(&mut self) -> DiscoveryResult<u32> {
        self.ensure(4)?;
        Ok(self.buf.get_u32())
    }

    fn u64(&mut self) -> DiscoveryResult<u64> {
        self.ensure(8)?;
        Ok(self.buf.get_u64())
    }

    fn flag(&mut self) -> DiscoveryResult<bool> {
        match self.u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(DiscoveryError::Malformed(format!("Invalid flag byte {}", other))),
        }
    }

    fn take(&mut self, n: usize) -> DiscoveryResult<&'a [u8]> {
        self.ensure(n)?;
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn string(&mut self) -> DiscoveryResult<String> {
        let len = self.u16()? as usize;
        let raw = self.take(len)?;
        String::from_utf8(raw.to_vec())
            .map_err(|e| DiscoveryError::Malformed(format!("Invalid UTF-8: {}", e)))
    }
}
