//! Per-request protocol engine: option negotiation and the stop-and-wait
//! ACK/retransmit state machine, one instance per accepted RRQ.
//!
//! Grounded on `fbtftp.base_handler.BaseHandler`: each session owns a
//! freshly bound, ephemeral-port socket and only the peer that sent the
//! original RRQ may drive it forward (transfer-ID binding, RFC 1350 §4).

use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;

use indexmap::IndexMap;

use crate::error::{Result, TftpError};
use crate::stats::SessionStats;
use crate::wire::Packet;
use crate::{ErrorCode, MAX_BLOCK_SIZE, MAX_PACKET_SIZE};

/// The embedder's supplier of bytes for a single transfer. Mirrors
/// `fbtftp.base_handler.ResponseData`'s three operations.
pub trait ByteSource: Send {
    /// Return up to `n` bytes, or fewer at end of stream, or an empty
    /// `Vec` exactly at EOF.
    fn read(&mut self, n: usize) -> io::Result<Vec<u8>>;

    /// Total remaining size in bytes, if known without consuming the
    /// stream. Used to answer the `tsize` option.
    fn size(&mut self) -> Option<u64>;

    /// Release any held resources (file handles, etc). Called exactly
    /// once, whether the transfer succeeded or failed.
    fn close(&mut self);
}

/// An embedder's per-request hook: resolve an incoming RRQ into a byte
/// source, or refuse it.
pub trait Handler: Send {
    fn get_response_data(&mut self) -> Result<Box<dyn ByteSource>>;
}

/// Negotiated transfer parameters (RFC 2347/2348/2349). RFC 7440
/// `windowsize` is out of scope for this framework.
#[derive(Debug, Clone)]
pub struct TftpOptions {
    pub block_size: usize,
    pub timeout: Duration,
    pub transfer_size: Option<u64>,
}

impl TftpOptions {
    /// Options as they stand before any client-requested overrides are
    /// applied: the default block size and the server's configured ACK
    /// timeout (spec.md §6 `timeout` configuration parameter).
    pub fn with_default_timeout(default_timeout: Duration) -> Self {
        Self {
            block_size: crate::DEFAULT_BLOCK_SIZE,
            timeout: default_timeout,
            transfer_size: None,
        }
    }
}

impl Default for TftpOptions {
    fn default() -> Self {
        Self::with_default_timeout(Duration::from_secs(crate::DEFAULT_TIMEOUT_SECS))
    }
}

/// Negotiate the options an RRQ requested against what this session can
/// honor. `known_size` is the size of the (possibly netascii-wrapped)
/// byte source, used to answer `tsize`. Returns the effective options
/// plus the subset to echo back in an OACK, in the order the client
/// requested them (RFC 2347 doesn't mandate an order, but spec.md §6
/// requires echoing the request order).
///
/// Keys outside the recognized set (`blksize`/`timeout`/`tsize`) —
/// including the framework-injected `mode`/`default_timeout`/`retries`
/// keys C5 adds to the options map before calling the handler factory —
/// are silently dropped from the OACK, per spec.md §4.4.2.
pub fn negotiate(
    requested: &IndexMap<String, String>,
    default_timeout: Duration,
    known_size: Option<u64>,
) -> (TftpOptions, IndexMap<String, String>) {
    let mut opts = TftpOptions::with_default_timeout(default_timeout);
    let mut negotiated = IndexMap::new();

    for (key, value) in requested {
        match key.as_str() {
            "blksize" => {
                if let Ok(n) = value.parse::<usize>() {
                    if (8..=MAX_BLOCK_SIZE).contains(&n) {
                        opts.block_size = n;
                        negotiated.insert(key.clone(), n.to_string());
                    }
                }
            }
            "timeout" => {
                if let Ok(n) = value.parse::<u64>() {
                    if (1..=255).contains(&n) {
                        opts.timeout = Duration::from_secs(n);
                        negotiated.insert(key.clone(), n.to_string());
                    }
                }
            }
            "tsize" => {
                if let Some(size) = known_size {
                    opts.transfer_size = Some(size);
                    negotiated.insert(key.clone(), size.to_string());
                }
            }
            _ => {
                // Unknown options are silently dropped, per RFC 2347 §3.
            }
        }
    }

    (opts, negotiated)
}

fn is_timeout(err: &io::Error) -> bool {
    matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

/// Send `packet` and wait for the peer to ack `expected_block`,
/// retransmitting on timeout up to `max_retries` times (spec.md §4.4.4: a
/// per-block retransmit budget, reset fresh on every call). Packets from
/// any address other than `peer` get an `UNKNOWN_TRANSFER_ID` error and
/// are otherwise ignored (spec.md P1) — only the original peer can
/// advance the session. A stale ACK (wrong block number) is ignored
/// without consuming a retry. Any other opcode — the peer replying with
/// DATA, RRQ, WRQ, or OACK — is a protocol violation (spec.md §4.4.3,
/// scenario E7): it gets `ERROR(4, "I only do reads, really")` and the
/// session ends. A peer `ERROR` is echoed back unchanged (scenario E6)
/// before the session ends.
fn send_and_await_ack(
    socket: &UdpSocket,
    peer: SocketAddr,
    packet: &Packet,
    expected_block: u16,
    opts: &TftpOptions,
    max_retries: u32,
    is_final: bool,
    stats: &mut SessionStats,
) -> Result<()> {
    let encoded = packet.encode();
    let mut retries = 0u32;

    'retry: loop {
        socket.send_to(&encoded, peer)?;
        stats.packets_sent += 1;
        socket.set_read_timeout(Some(opts.timeout))?;

        loop {
            let mut buf = [0u8; MAX_PACKET_SIZE];
            match socket.recv_from(&mut buf) {
                Ok((_n, from)) if from != peer => {
                    // A datagram from anyone but the peer that sent the RRQ is a
                    // transfer-ID violation (spec.md §4.4.3/§8 P1): terminate the
                    // session immediately, without replying to the impostor —
                    // matching `fbtftp.base_handler.BaseHandler.on_new_data`,
                    // which just sets `_should_stop` and returns.
                    tracing::warn!(%from, %peer, "datagram from foreign transfer id, terminating session");
                    return Err(TftpError::Protocol(
                        ErrorCode::UnknownTransferId,
                        "unexpected transfer id".to_string(),
                    ));
                }
                Ok((n, _from)) => {
                    match Packet::decode(&buf[..n]) {
                        Ok(Packet::Ack { block }) if block == expected_block => {
                            stats.packets_acked += 1;
                            return Ok(());
                        }
                        Ok(Packet::Ack { .. }) => continue, // stale ack, keep waiting
                        Ok(Packet::Error { code, message }) => {
                            let echo = Packet::Error {
                                code,
                                message: message.clone(),
                            };
                            let _ = socket.send_to(&echo.encode(), peer);
                            return Err(TftpError::Protocol(
                                ErrorCode::from_u16(code).unwrap_or(ErrorCode::NotDefined),
                                message,
                            ));
                        }
                        Ok(_) => {
                            let reply = Packet::error(
                                ErrorCode::IllegalOperation,
                                "I only do reads, really",
                            );
                            let _ = socket.send_to(&reply.encode(), peer);
                            return Err(TftpError::Protocol(
                                ErrorCode::IllegalOperation,
                                "I only do reads, really".into(),
                            ));
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "dropped malformed packet");
                            continue;
                        }
                    }
                }
                Err(e) if is_timeout(&e) => {
                    retries += 1;
                    if retries > max_retries {
                        let mut message =
                            format!("timeout after {} retransmits.", stats.retransmits);
                        if is_final {
                            message.push_str(" Missed last ack.");
                        }
                        return Err(TftpError::Protocol(ErrorCode::NotDefined, message));
                    }
                    stats.retransmits += 1;
                    continue 'retry;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// Run the full read-transaction state machine over `socket`, which must
/// already be bound to its own ephemeral port and must not be shared
/// with any other session.
pub fn run_session(
    socket: &UdpSocket,
    peer: SocketAddr,
    mut source: Box<dyn ByteSource>,
    negotiated: &IndexMap<String, String>,
    opts: &TftpOptions,
    max_retries: u32,
    stats: &mut SessionStats,
) -> Result<()> {
    if !negotiated.is_empty() {
        let oack = Packet::Oack {
            options: negotiated.clone(),
        };
        send_and_await_ack(socket, peer, &oack, 0, opts, max_retries, false, stats)?;
    }

    let mut block: u16 = 1;
    loop {
        let chunk = match read_full_block(source.as_mut(), opts.block_size) {
            Ok(chunk) => chunk,
            Err(_) => {
                // A local read failure is reported to the peer as a generic
                // ERROR (spec.md §4.4.3, §7 item 3), mirroring
                // `fbtftp.base_handler.BaseHandler`'s fixed message for this
                // case rather than leaking the underlying I/O error text.
                let message = "Error while reading from source".to_string();
                let err_pkt = Packet::error(ErrorCode::NotDefined, message.clone());
                let _ = socket.send_to(&err_pkt.encode(), peer);
                return Err(TftpError::Protocol(ErrorCode::NotDefined, message));
            }
        };
        let is_final = chunk.len() < opts.block_size;
        let len = chunk.len() as u64;
        let data_pkt = Packet::Data { block, data: chunk };
        send_and_await_ack(socket, peer, &data_pkt, block, opts, max_retries, is_final, stats)?;
        stats.bytes_sent += len;
        if is_final {
            break;
        }
        block = block.wrapping_add(1);
    }

    source.close();
    Ok(())
}

/// Fill a block of up to `block_size` bytes, issuing repeated `read`s
/// since a `ByteSource` may return fewer bytes than requested without
/// that meaning end-of-stream (spec.md §4.4.3): only a `read` that
/// returns nothing new signals EOF.
fn read_full_block(source: &mut dyn ByteSource, block_size: usize) -> Result<Vec<u8>> {
    let mut block = Vec::with_capacity(block_size);
    while block.len() < block_size {
        let chunk = source.read(block_size - block.len())?;
        if chunk.is_empty() {
            break;
        }
        block.extend(chunk);
    }
    Ok(block)
}
