//! RRQ listener/dispatcher and the periodic stats timer.
//!
//! Grounded on `fbtftp.base_server.BaseServer.on_new_data` for the
//! parse/dispatch order and on this crate's own teacher's
//! `create_optimized_socket` (`main.rs`) for socket2-based tuning of the
//! listening socket. Each accepted RRQ is handed to its own session
//! thread bound to a fresh ephemeral port — the idiomatic-Rust substitute
//! for `fbtftp`'s `multiprocessing.Process`-per-session isolation (see
//! `SPEC_FULL.md` §5).

use std::net::{SocketAddr, UdpSocket};
use std::panic;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use indexmap::IndexMap;
use socket2::{Domain, Protocol, Socket, Type};

use crate::config::SocketTuning;
use crate::error::{Result, TftpError};
use crate::session::{self, Handler};
use crate::stats::{ServerStats, SessionError, SessionStats};
use crate::wire::Packet;
use crate::{ErrorCode, TransferMode, MAX_PACKET_SIZE};

/// Resolves an accepted RRQ into a handler, or declines to answer it at
/// all. Mirrors `fbtftp.base_server.BaseServer.get_handler`'s signature
/// shape (spec.md §6 Embedder API): the listener's own address, the
/// peer's address, the requested filename, and the full options map C5
/// built for this request (including the framework-injected `mode`,
/// `default_timeout`, and `retries` keys, spec.md §4.5 step 3). Returning
/// `None` means the request is silently dropped — no ERROR datagram is
/// sent (spec.md §4.5 step 4); file-not-found and similar per-request
/// failures belong in `Handler::get_response_data` instead, where they
/// can still be reported to the peer once the session's own ephemeral
/// port is bound.
pub trait HandlerFactory: Send + Sync {
    fn get_handler(
        &self,
        server_addr: SocketAddr,
        peer: SocketAddr,
        filename: &str,
        options: &IndexMap<String, String>,
    ) -> Option<Box<dyn Handler>>;
}

fn bind_tuned_socket(addr: SocketAddr, tuning: &SocketTuning) -> Result<UdpSocket> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| TftpError::Tftp(format!("failed to create socket: {e}")))?;

    if tuning.reuse_address {
        socket
            .set_reuse_address(true)
            .map_err(|e| TftpError::Tftp(format!("failed to set SO_REUSEADDR: {e}")))?;
    }
    if let Err(e) = socket.set_recv_buffer_size(tuning.recv_buffer_bytes) {
        tracing::warn!(error = %e, "failed to set SO_RCVBUF");
    }
    if let Err(e) = socket.set_send_buffer_size(tuning.send_buffer_bytes) {
        tracing::warn!(error = %e, "failed to set SO_SNDBUF");
    }

    socket
        .bind(&addr.into())
        .map_err(|e| TftpError::Tftp(format!("failed to bind to {addr}: {e}")))?;

    Ok(socket.into())
}

/// A running dispatcher: owns the listening socket and spawns one
/// session thread per accepted RRQ.
pub struct TftpServer {
    listener: UdpSocket,
    local_addr: SocketAddr,
    handler_factory: Arc<dyn HandlerFactory>,
    stats: ServerStats,
    max_retries: u32,
    default_timeout: Duration,
    session_stats_callback: Option<Arc<dyn Fn(SessionStats) + Send + Sync>>,
    shutdown: Arc<AtomicBool>,
}

impl TftpServer {
    pub fn bind(
        addr: SocketAddr,
        tuning: &SocketTuning,
        handler_factory: Arc<dyn HandlerFactory>,
        max_retries: u32,
        default_timeout: Duration,
    ) -> Result<Self> {
        let listener = bind_tuned_socket(addr, tuning)?;
        let local_addr = listener.local_addr()?;
        tracing::info!(%local_addr, "tftp listener bound");
        Ok(Self {
            listener,
            local_addr,
            handler_factory,
            stats: ServerStats::new(),
            max_retries,
            default_timeout,
            session_stats_callback: None,
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn stats(&self) -> ServerStats {
        self.stats.clone()
    }

    /// The address the listener actually bound to — useful when `bind()`
    /// was given port 0 and the caller needs the OS-assigned port.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Register a callback invoked with each session's `SessionStats`
    /// once its transfer ends, successfully or not.
    pub fn on_session_complete<F>(&mut self, callback: F)
    where
        F: Fn(SessionStats) + Send + Sync + 'static,
    {
        self.session_stats_callback = Some(Arc::new(callback));
    }

    /// Start the periodic stats callback (C6), firing every `interval`
    /// on a dedicated background thread until the server shuts down.
    /// Mirrors `fbtftp.base_server.BaseServer`'s `threading.Timer`-driven
    /// `restart_stats_timer`/`_metrics_callback_wrapper`.
    pub fn start_stats_timer<F>(&self, interval: Duration, callback: F) -> thread::JoinHandle<()>
    where
        F: Fn(&ServerStats) + Send + 'static,
    {
        let stats = self.stats.clone();
        let shutdown = self.shutdown.clone();
        thread::spawn(move || loop {
            thread::sleep(interval);
            if shutdown.load(Ordering::Relaxed) {
                break;
            }
            let result = panic::catch_unwind(panic::AssertUnwindSafe(|| callback(&stats)));
            if let Err(payload) = result {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic payload".to_string());
                tracing::error!(panic = %message, "stats callback panicked");
                crate::audit::stats_callback_panicked(&message);
            }
        })
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    /// Run the accept loop on the calling thread. Returns only on a
    /// fatal socket error or once `shutdown()` has been called.
    pub fn run(&self) -> Result<()> {
        let mut buf = [0u8; MAX_PACKET_SIZE];
        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                return Ok(());
            }
            let (n, peer) = match self.listener.recv_from(&mut buf) {
                Ok(v) => v,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };

            let packet = match Packet::decode(&buf[..n]) {
                Ok(p) => p,
                Err(e) => {
                    tracing::warn!(%peer, error = %e, "dropped malformed request");
                    crate::audit::malformed_packet_dropped(peer, &e.to_string());
                    self.stats.increment("malformed_requests", 1);
                    continue;
                }
            };

            match packet {
                Packet::Rrq {
                    filename,
                    mode,
                    options: requested,
                } => {
                    self.stats.increment("rrq_received", 1);

                    // Build the options map C4 negotiates against:
                    // framework-injected keys first, then the RRQ's own
                    // options in the order the client sent them (spec.md
                    // §4.5 step 3).
                    let mut options = IndexMap::new();
                    options.insert("mode".to_string(), mode.to_ascii_lowercase());
                    options.insert(
                        "default_timeout".to_string(),
                        self.default_timeout.as_secs().to_string(),
                    );
                    options.insert("retries".to_string(), self.max_retries.to_string());
                    for (key, value) in requested {
                        options.insert(key, value);
                    }

                    let factory = &self.handler_factory;
                    let handler = match panic::catch_unwind(panic::AssertUnwindSafe(|| {
                        factory.get_handler(self.local_addr, peer, &filename, &options)
                    })) {
                        Ok(Some(handler)) => handler,
                        Ok(None) => {
                            tracing::info!(%peer, %filename, "handler factory declined request");
                            continue;
                        }
                        Err(_) => {
                            tracing::error!(%peer, %filename, "handler factory panicked");
                            crate::audit::handler_factory_failed(peer, "handler factory panicked");
                            self.stats.increment("handler_factory_failures", 1);
                            continue;
                        }
                    };

                    self.spawn_session(peer, filename, options, handler);
                }
                _ => {
                    // WRQ and anything else arriving on the listener socket
                    // is logged and dropped, not answered — matching the
                    // original `fbtftp` dispatcher, which never replies to
                    // a non-RRQ opcode.
                    tracing::warn!(%peer, "unexpected opcode on listener socket");
                    self.stats.increment("unexpected_opcode", 1);
                }
            }
        }
    }

    fn spawn_session(
        &self,
        peer: SocketAddr,
        filename: String,
        options: IndexMap<String, String>,
        mut handler: Box<dyn Handler>,
    ) {
        let stats = self.stats.clone();
        let local_addr = self.local_addr;
        let bind_addr = SocketAddr::new(local_addr.ip(), 0);
        let max_retries = self.max_retries;
        let default_timeout = self.default_timeout;
        let callback = self.session_stats_callback.clone();

        let builder = thread::Builder::new().name(format!("tftp-session-{peer}"));
        let spawn_result = builder.spawn(move || {
            stats.increment("process_count", 1);
            let mut session_stats =
                SessionStats::new(peer, local_addr, filename.clone(), options.clone());

            // The session's own ephemeral port is bound unconditionally,
            // before any option/handler validation, so that even a
            // rejected request (bad mode, missing file) is answered from
            // the session's own transfer ID rather than the listener's
            // (spec.md §4.4.1 steps 1-2).
            let socket = match UdpSocket::bind(bind_addr) {
                Ok(socket) => socket,
                Err(e) => {
                    tracing::error!(%peer, error = %e, "failed to bind session socket");
                    stats.increment("spawn_failures", 1);
                    return;
                }
            };

            let outcome = (|| -> Result<()> {
                let mode = resolve_mode(&options, &socket, peer)?;

                let mut source = match handler.get_response_data() {
                    Ok(source) => source,
                    Err(e) => {
                        let (code, message) = e.as_protocol();
                        let err_pkt = Packet::error(code, message.clone());
                        let _ = socket.send_to(&err_pkt.encode(), peer);
                        return Err(TftpError::Protocol(code, message));
                    }
                };
                if matches!(mode, TransferMode::Netascii) {
                    source = Box::new(crate::netascii::NetasciiEncoder::new(source));
                }
                // tsize is computed against the (possibly netascii-wrapped)
                // source so that, per spec.md §9, a netascii transfer can
                // still honor `tsize` against its expanded size.
                let known_size = source.size();

                let (opts, negotiated) =
                    session::negotiate(&options, default_timeout, known_size);
                session_stats.block_size = opts.block_size;
                session_stats.acknowledged_options = negotiated.clone();
                crate::audit::options_negotiated(peer, &filename, &negotiated);

                session::run_session(
                    &socket,
                    peer,
                    source,
                    &negotiated,
                    &opts,
                    max_retries,
                    &mut session_stats,
                )
            })();

            match &outcome {
                Ok(()) => {
                    tracing::info!(%peer, %filename, "transfer completed");
                    crate::audit::transfer_completed(
                        peer,
                        &filename,
                        session_stats.bytes_sent,
                        session_stats.packets_sent,
                        session_stats.packets_acked,
                    );
                    stats.increment("transfers_completed", 1);
                }
                Err(e) => {
                    let (code, message) = e.as_protocol();
                    tracing::warn!(%peer, %filename, code = code as u16, error = %message, "transfer failed");
                    crate::audit::transfer_failed(peer, &filename, &message);
                    session_stats.error = Some(SessionError::new(code, message));
                    stats.increment("transfers_failed", 1);
                }
            }
            stats.increment("bytes_sent", session_stats.bytes_sent as i64);

            if let Some(cb) = callback {
                let result = panic::catch_unwind(panic::AssertUnwindSafe(|| cb(session_stats)));
                if result.is_err() {
                    tracing::error!("session stats callback panicked");
                }
            }
        });

        if let Err(e) = spawn_result {
            tracing::error!(%peer, error = %e, "failed to spawn session thread");
            self.stats.increment("spawn_failures", 1);
        }
    }
}

/// Validate the `mode` option against the two this framework supports,
/// transmitting `ERROR(4, "Unknown mode: '...'")` over the session's own
/// socket and terminating on anything else (spec.md §4.4.2, scenario E3).
/// `mail` is recognized at the wire level (`TransferMode::parse`) but is
/// not one of the two modes this read-only framework implements, so it's
/// rejected here exactly like any other unrecognized value.
fn resolve_mode(
    options: &IndexMap<String, String>,
    socket: &UdpSocket,
    peer: SocketAddr,
) -> Result<TransferMode> {
    let raw = options
        .get("mode")
        .cloned()
        .unwrap_or_else(|| "octet".to_string());
    match TransferMode::parse(&raw) {
        Ok(TransferMode::Octet) => Ok(TransferMode::Octet),
        Ok(TransferMode::Netascii) => Ok(TransferMode::Netascii),
        _ => {
            let message = format!("Unknown mode: '{raw}'");
            let err = Packet::error(ErrorCode::IllegalOperation, message.clone());
            let _ = socket.send_to(&err.encode(), peer);
            Err(TftpError::Protocol(ErrorCode::IllegalOperation, message))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::ByteSource;
    use std::io;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration as StdDuration;

    struct MemSource(io::Cursor<Vec<u8>>);

    impl ByteSource for MemSource {
        fn read(&mut self, n: usize) -> io::Result<Vec<u8>> {
            use io::Read;
            let mut buf = vec![0u8; n];
            let got = self.0.read(&mut buf)?;
            buf.truncate(got);
            Ok(buf)
        }

        fn size(&mut self) -> Option<u64> {
            Some(self.0.get_ref().len() as u64 - self.0.position())
        }

        fn close(&mut self) {}
    }

    struct OneShotFactory {
        data: Vec<u8>,
    }

    struct OneShotHandler {
        data: Vec<u8>,
    }

    impl Handler for OneShotHandler {
        fn get_response_data(&mut self) -> Result<Box<dyn crate::session::ByteSource>> {
            Ok(Box::new(MemSource(io::Cursor::new(self.data.clone()))))
        }
    }

    impl HandlerFactory for OneShotFactory {
        fn get_handler(
            &self,
            _server_addr: SocketAddr,
            _peer: SocketAddr,
            _filename: &str,
            _options: &IndexMap<String, String>,
        ) -> Option<Box<dyn Handler>> {
            Some(Box::new(OneShotHandler {
                data: self.data.clone(),
            }))
        }
    }

    struct MissingFileFactory;

    struct MissingFileHandler;

    impl Handler for MissingFileHandler {
        fn get_response_data(&mut self) -> Result<Box<dyn crate::session::ByteSource>> {
            Err(TftpError::Protocol(
                ErrorCode::FileNotFound,
                "File not found".to_string(),
            ))
        }
    }

    impl HandlerFactory for MissingFileFactory {
        fn get_handler(
            &self,
            _server_addr: SocketAddr,
            _peer: SocketAddr,
            _filename: &str,
            _options: &IndexMap<String, String>,
        ) -> Option<Box<dyn Handler>> {
            Some(Box::new(MissingFileHandler))
        }
    }

    fn client_socket() -> UdpSocket {
        let sock = UdpSocket::bind("127.0.0.1:0").unwrap();
        sock.set_read_timeout(Some(StdDuration::from_secs(2))).unwrap();
        sock
    }

    #[test]
    fn end_to_end_transfer_serves_requested_bytes() {
        let tuning = SocketTuning::default();
        let factory = Arc::new(OneShotFactory {
            data: vec![b'a'; 1500],
        });
        let server = TftpServer::bind(
            "127.0.0.1:0".parse().unwrap(),
            &tuning,
            factory,
            3,
            StdDuration::from_secs(1),
        )
        .unwrap();
        let server_addr = server.listener.local_addr().unwrap();

        let completed = Arc::new(StdMutex::new(None));
        let completed_clone = completed.clone();
        let mut server = server;
        server.on_session_complete(move |stats| {
            *completed_clone.lock().unwrap() = Some(stats);
        });
        let server = Arc::new(server);
        let server_run = server.clone();
        let run_thread = thread::spawn(move || server_run.run());

        let client = client_socket();
        let rrq = Packet::Rrq {
            filename: "boot.bin".to_string(),
            mode: "octet".to_string(),
            options: IndexMap::new(),
        };
        client.send_to(&rrq.encode(), server_addr).unwrap();

        let mut received = Vec::new();
        let mut expected_block: u16 = 1;
        let mut session_port = None;
        loop {
            let mut buf = [0u8; MAX_PACKET_SIZE];
            let (n, from) = client.recv_from(&mut buf).unwrap();
            session_port.get_or_insert(from);
            match Packet::decode(&buf[..n]).unwrap() {
                Packet::Data { block, data } => {
                    assert_eq!(block, expected_block);
                    let is_final = data.len() < crate::DEFAULT_BLOCK_SIZE;
                    received.extend(data);
                    let ack = Packet::Ack { block };
                    client.send_to(&ack.encode(), from).unwrap();
                    if is_final {
                        break;
                    }
                    expected_block = expected_block.wrapping_add(1);
                }
                other => panic!("unexpected packet: {other:?}"),
            }
        }
        assert_eq!(received.len(), 1500);

        server.shutdown();
        let _ = client.send_to(&Packet::Rrq {
            filename: "wake".to_string(),
            mode: "octet".to_string(),
            options: IndexMap::new(),
        }.encode(), server_addr);
        let _ = run_thread.join();

        std::thread::sleep(StdDuration::from_millis(100));
        let stats = completed.lock().unwrap().clone().expect("session stats recorded");
        assert_eq!(stats.bytes_sent, 1500);
        assert!(stats.error.is_none());
    }

    #[test]
    fn unknown_mode_gets_illegal_operation_from_session_socket() {
        let tuning = SocketTuning::default();
        let factory = Arc::new(OneShotFactory { data: vec![1, 2, 3] });
        let server = Arc::new(
            TftpServer::bind(
                "127.0.0.1:0".parse().unwrap(),
                &tuning,
                factory,
                1,
                StdDuration::from_secs(1),
            )
            .unwrap(),
        );
        let server_addr = server.listener.local_addr().unwrap();
        let server_run = server.clone();
        let run_thread = thread::spawn(move || server_run.run());

        let client = client_socket();
        let mut options = IndexMap::new();
        let rrq = Packet::Rrq {
            filename: "f".to_string(),
            mode: "bogus".to_string(),
            options: std::mem::take(&mut options),
        };
        client.send_to(&rrq.encode(), server_addr).unwrap();

        let mut buf = [0u8; MAX_PACKET_SIZE];
        let (n, _) = client.recv_from(&mut buf).unwrap();
        match Packet::decode(&buf[..n]).unwrap() {
            Packet::Error { code, message } => {
                assert_eq!(code, ErrorCode::IllegalOperation as u16);
                assert_eq!(message, "Unknown mode: 'bogus'");
            }
            other => panic!("expected error, got {other:?}"),
        }

        server.shutdown();
        let _ = client.send_to(&Packet::Rrq {
            filename: "wake".to_string(),
            mode: "octet".to_string(),
            options: IndexMap::new(),
        }.encode(), server_addr);
        let _ = run_thread.join();
    }

    #[test]
    fn missing_file_gets_file_not_found_from_session_socket() {
        let tuning = SocketTuning::default();
        let factory = Arc::new(MissingFileFactory);
        let server = Arc::new(
            TftpServer::bind(
                "127.0.0.1:0".parse().unwrap(),
                &tuning,
                factory,
                1,
                StdDuration::from_secs(1),
            )
            .unwrap(),
        );
        let server_addr = server.listener.local_addr().unwrap();
        let server_run = server.clone();
        let run_thread = thread::spawn(move || server_run.run());

        let client = client_socket();
        let rrq = Packet::Rrq {
            filename: "missing.bin".to_string(),
            mode: "octet".to_string(),
            options: IndexMap::new(),
        };
        client.send_to(&rrq.encode(), server_addr).unwrap();

        let mut buf = [0u8; MAX_PACKET_SIZE];
        let (n, _) = client.recv_from(&mut buf).unwrap();
        match Packet::decode(&buf[..n]).unwrap() {
            Packet::Error { code, .. } => {
                assert_eq!(code, ErrorCode::FileNotFound as u16);
            }
            other => panic!("expected error, got {other:?}"),
        }

        server.shutdown();
        let _ = client.send_to(&Packet::Rrq {
            filename: "wake".to_string(),
            mode: "octet".to_string(),
            options: IndexMap::new(),
        }.encode(), server_addr);
        let _ = run_thread.join();
    }

    #[test]
    fn malformed_datagram_is_dropped_without_reply() {
        let tuning = SocketTuning::default();
        let factory = Arc::new(OneShotFactory { data: vec![1] });
        let server = Arc::new(
            TftpServer::bind(
                "127.0.0.1:0".parse().unwrap(),
                &tuning,
                factory,
                1,
                StdDuration::from_secs(1),
            )
            .unwrap(),
        );
        let server_addr = server.listener.local_addr().unwrap();
        let server_run = server.clone();
        let run_thread = thread::spawn(move || server_run.run());

        let client = client_socket();
        client.set_read_timeout(Some(StdDuration::from_millis(300))).unwrap();
        // Seven-byte malformed RRQ: opcode + an unterminated filename.
        client
            .send_to(&[0x00, 0x01, b's', b'o', b'm', b'e', b'_'], server_addr)
            .unwrap();

        let mut buf = [0u8; MAX_PACKET_SIZE];
        let result = client.recv_from(&mut buf);
        assert!(result.is_err(), "dispatcher must not reply to malformed input");

        server.shutdown();
        let _ = client.send_to(&Packet::Rrq {
            filename: "wake".to_string(),
            mode: "octet".to_string(),
            options: IndexMap::new(),
        }.encode(), server_addr);
        let _ = run_thread.join();
    }
}
