//! SLIP framing and ROM loader packets.

const END: u8 = 0xC0;
const ESC: u8 = 0xDB;
const ESC_END: u8 = 0xDC;
const ESC_ESC: u8 = 0xDD;

const DIRECTION_REQUEST: u8 = 0x00;
const DIRECTION_RESPONSE: u8 = 0x01;

/// Frame `packet` for the wire.
#[must_use]
pub fn encode(packet: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(packet.len() + 8);
    out.push(END);
    for &b in packet {
        match b {
            END => out.extend_from_slice(&[ESC, ESC_END]),
            ESC => out.extend_from_slice(&[ESC, ESC_ESC]),
            _ => out.push(b),
        }
    }
    out.push(END);
    out
}

/// Reassembles frames from a byte stream.
///
/// Bytes outside a frame (boot messages printed before the loader starts)
/// are discarded.
#[derive(Debug, Default)]
pub struct SlipDecoder {
    frame: Vec<u8>,
    in_frame: bool,
    escaped: bool,
}

impl SlipDecoder {
    /// Feed received bytes, returning every frame they complete.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        for &b in bytes {
            if b == END {
                if self.in_frame && !self.frame.is_empty() {
                    frames.push(std::mem::take(&mut self.frame));
                    self.in_frame = false;
                } else {
                    self.in_frame = true;
                }
                self.escaped = false;
                continue;
            }
            if !self.in_frame {
                continue;
            }
            if self.escaped {
                self.escaped = false;
                self.frame.push(match b {
                    ESC_END => END,
                    ESC_ESC => ESC,
                    other => other,
                });
            } else if b == ESC {
                self.escaped = true;
            } else {
                self.frame.push(b);
            }
        }
        frames
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

/// Checksum the loader expects over `FLASH_DATA` payloads.
#[must_use]
pub fn checksum(data: &[u8]) -> u32 {
    data.iter().fold(0xEF, |acc, &b| acc ^ u32::from(b))
}

/// Build a request packet (before framing).
#[must_use]
pub fn request(op: u8, data: &[u8], checksum: u32) -> Vec<u8> {
    let size = u16::try_from(data.len()).unwrap_or(u16::MAX);
    let mut packet = Vec::with_capacity(8 + data.len());
    packet.push(DIRECTION_REQUEST);
    packet.push(op);
    packet.extend_from_slice(&size.to_le_bytes());
    packet.extend_from_slice(&checksum.to_le_bytes());
    packet.extend_from_slice(data);
    packet
}

/// A loader reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub op: u8,
    pub value: u32,
    /// Body, including the trailing status bytes.
    pub data: Vec<u8>,
}

impl Response {
    /// Parse a decoded frame. Returns `None` for anything that is not a reply.
    #[must_use]
    pub fn parse(frame: &[u8]) -> Option<Self> {
        if frame.len() < 8 || frame[0] != DIRECTION_RESPONSE {
            return None;
        }
        let size = usize::from(u16::from_le_bytes([frame[2], frame[3]]));
        let value = u32::from_le_bytes([frame[4], frame[5], frame[6], frame[7]]);
        let body = &frame[8..];
        Some(Self {
            op: frame[1],
            value,
            data: body[..size.min(body.len())].to_vec(),
        })
    }
}

/// Little-endian words, the layout of every command body.
#[must_use]
pub fn words(values: &[u32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}
