//! RFC 1350 packet encode/decode, plus the RFC 2347 option extensions.

use bytes::{Buf, BufMut, BytesMut};
use indexmap::IndexMap;

use crate::error::{Result, TftpError};
use crate::{ErrorCode, Opcode};

/// A parsed TFTP datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Rrq {
        filename: String,
        mode: String,
        options: IndexMap<String, String>,
    },
    Data {
        block: u16,
        data: Vec<u8>,
    },
    Ack {
        block: u16,
    },
    Error {
        code: u16,
        message: String,
    },
    Oack {
        options: IndexMap<String, String>,
    },
}

fn read_cstr(buf: &mut impl Buf) -> Result<String> {
    let mut bytes = Vec::new();
    loop {
        if !buf.has_remaining() {
            return Err(TftpError::Malformed("unterminated string field".into()));
        }
        let b = buf.get_u8();
        if b == 0 {
            break;
        }
        bytes.push(b);
    }
    String::from_utf8(bytes).map_err(|e| TftpError::Malformed(e.to_string()))
}

fn put_cstr(buf: &mut impl BufMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

impl Packet {
    /// Decode a datagram received from the wire. Never panics on truncated
    /// or garbage input; all failure modes return `TftpError::Malformed`.
    pub fn decode(raw: &[u8]) -> Result<Self> {
        let mut buf = raw;
        if buf.remaining() < 2 {
            return Err(TftpError::Malformed("packet shorter than opcode".into()));
        }
        let opcode_raw = buf.get_u16();
        let opcode = Opcode::from_u16(opcode_raw)
            .ok_or_else(|| TftpError::Malformed(format!("unknown opcode {opcode_raw}")))?;

        match opcode {
            Opcode::Rrq => {
                let filename = read_cstr(&mut buf)?;
                let mode = read_cstr(&mut buf)?;
                let mut options = IndexMap::new();
                while buf.has_remaining() {
                    let name = read_cstr(&mut buf)?;
                    let value = read_cstr(&mut buf)?;
                    options.insert(name.to_ascii_lowercase(), value);
                }
                Ok(Packet::Rrq {
                    filename,
                    mode,
                    options,
                })
            }
            Opcode::Wrq => Err(TftpError::Malformed("WRQ not supported".into())),
            Opcode::Data => {
                if buf.remaining() < 2 {
                    return Err(TftpError::Malformed("DATA missing block number".into()));
                }
                let block = buf.get_u16();
                let data = buf.chunk().to_vec();
                Ok(Packet::Data { block, data })
            }
            Opcode::Ack => {
                if buf.remaining() < 2 {
                    return Err(TftpError::Malformed("ACK missing block number".into()));
                }
                let block = buf.get_u16();
                Ok(Packet::Ack { block })
            }
            Opcode::Error => {
                if buf.remaining() < 2 {
                    return Err(TftpError::Malformed("ERROR missing code".into()));
                }
                let code = buf.get_u16();
                let message = read_cstr(&mut buf).unwrap_or_default();
                Ok(Packet::Error { code, message })
            }
            Opcode::Oack => {
                let mut options = IndexMap::new();
                while buf.has_remaining() {
                    let name = read_cstr(&mut buf)?;
                    let value = read_cstr(&mut buf)?;
                    options.insert(name.to_ascii_lowercase(), value);
                }
                Ok(Packet::Oack { options })
            }
        }
    }

    /// Encode this packet into its wire representation.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(self.encoded_len_hint());
        match self {
            Packet::Rrq {
                filename,
                mode,
                options,
            } => {
                buf.put_u16(Opcode::Rrq as u16);
                put_cstr(&mut buf, filename);
                put_cstr(&mut buf, mode);
                for (k, v) in options {
                    put_cstr(&mut buf, k);
                    put_cstr(&mut buf, v);
                }
            }
            Packet::Data { block, data } => {
                buf.put_u16(Opcode::Data as u16);
                buf.put_u16(*block);
                buf.put_slice(data);
            }
            Packet::Ack { block } => {
                buf.put_u16(Opcode::Ack as u16);
                buf.put_u16(*block);
            }
            Packet::Error { code, message } => {
                buf.put_u16(Opcode::Error as u16);
                buf.put_u16(*code);
                put_cstr(&mut buf, message);
            }
            Packet::Oack { options } => {
                buf.put_u16(Opcode::Oack as u16);
                for (k, v) in options {
                    put_cstr(&mut buf, k);
                    put_cstr(&mut buf, v);
                }
            }
        }
        buf.to_vec()
    }

    fn encoded_len_hint(&self) -> usize {
        match self {
            Packet::Data { data, .. } => data.len() + 4,
            _ => 64,
        }
    }

    /// Build an ERROR packet from a known error code.
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Packet::Error {
            code: code as u16,
            message: message.into(),
        }
    }
}
