//! Structured, session-lifecycle audit logging.
//!
//! Trimmed from the teacher's `audit.rs`: kept is the `AuditEvent` +
//! `CommonFields` shape and the `tracing::event!` dispatch-by-severity
//! pattern, restricted to the lifecycle events this framework actually
//! emits (server started, malformed packets dropped, option negotiation,
//! transfer outcome, handler-factory failure, stats-callback panics). The
//! multicast/write/auth/rate-limit/shutdown/denial event variants have no
//! call site here and were dropped rather than kept unconstructed.

use serde::{Deserialize, Serialize};
use tracing::{event, Level};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum AuditEvent {
    ServerStarted {
        #[serde(flatten)]
        common: CommonFields,
        bind_addr: String,
        root_dir: String,
    },

    MalformedPacketDropped {
        #[serde(flatten)]
        common: CommonFields,
        peer: String,
        reason: String,
    },

    OptionsNegotiated {
        #[serde(flatten)]
        common: CommonFields,
        peer: String,
        filename: String,
        options: serde_json::Value,
    },

    TransferCompleted {
        #[serde(flatten)]
        common: CommonFields,
        peer: String,
        filename: String,
        bytes_sent: u64,
        packets_sent: u64,
        packets_acked: u64,
    },

    TransferFailed {
        #[serde(flatten)]
        common: CommonFields,
        peer: String,
        filename: String,
        error: String,
    },

    HandlerFactoryFailed {
        #[serde(flatten)]
        common: CommonFields,
        peer: String,
        error: String,
    },

    StatsCallbackPanicked {
        #[serde(flatten)]
        common: CommonFields,
        panic: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommonFields {
    pub timestamp: String,
    pub hostname: String,
    pub service: String,
    pub severity: String,
}

impl CommonFields {
    pub fn new(severity: &str) -> Self {
        Self {
            timestamp: chrono::Utc::now().to_rfc3339(),
            hostname: hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "unknown".to_string()),
            service: "snow-owl-tftp".to_string(),
            severity: severity.to_string(),
        }
    }
}

impl AuditEvent {
    pub fn log(&self) {
        let severity = self.common().severity.clone();
        let json = serde_json::to_string(self)
            .unwrap_or_else(|e| format!("{{\"error\": \"failed to serialize event: {e}\"}}"));

        match severity.as_str() {
            "error" => event!(Level::ERROR, audit_event = %json),
            "warn" => event!(Level::WARN, audit_event = %json),
            _ => event!(Level::INFO, audit_event = %json),
        }
    }

    fn common(&self) -> &CommonFields {
        match self {
            AuditEvent::ServerStarted { common, .. }
            | AuditEvent::MalformedPacketDropped { common, .. }
            | AuditEvent::OptionsNegotiated { common, .. }
            | AuditEvent::TransferCompleted { common, .. }
            | AuditEvent::TransferFailed { common, .. }
            | AuditEvent::HandlerFactoryFailed { common, .. }
            | AuditEvent::StatsCallbackPanicked { common, .. } => common,
        }
    }
}

pub fn server_started(bind_addr: &str, root_dir: &str) {
    AuditEvent::ServerStarted {
        common: CommonFields::new("info"),
        bind_addr: bind_addr.to_string(),
        root_dir: root_dir.to_string(),
    }
    .log();
}

pub fn malformed_packet_dropped(peer: std::net::SocketAddr, reason: &str) {
    AuditEvent::MalformedPacketDropped {
        common: CommonFields::new("warn"),
        peer: peer.to_string(),
        reason: reason.to_string(),
    }
    .log();
}

pub fn transfer_completed(
    peer: std::net::SocketAddr,
    filename: &str,
    bytes_sent: u64,
    packets_sent: u64,
    packets_acked: u64,
) {
    AuditEvent::TransferCompleted {
        common: CommonFields::new("info"),
        peer: peer.to_string(),
        filename: filename.to_string(),
        bytes_sent,
        packets_sent,
        packets_acked,
    }
    .log();
}

pub fn transfer_failed(peer: std::net::SocketAddr, filename: &str, error: &str) {
    AuditEvent::TransferFailed {
        common: CommonFields::new("warn"),
        peer: peer.to_string(),
        filename: filename.to_string(),
        error: error.to_string(),
    }
    .log();
}

pub fn handler_factory_failed(peer: std::net::SocketAddr, error: &str) {
    AuditEvent::HandlerFactoryFailed {
        common: CommonFields::new("error"),
        peer: peer.to_string(),
        error: error.to_string(),
    }
    .log();
}

pub fn options_negotiated(
    peer: std::net::SocketAddr,
    filename: &str,
    options: &indexmap::IndexMap<String, String>,
) {
    let options = serde_json::to_value(options.iter().collect::<std::collections::BTreeMap<_, _>>())
        .unwrap_or(serde_json::Value::Null);
    AuditEvent::OptionsNegotiated {
        common: CommonFields::new("info"),
        peer: peer.to_string(),
        filename: filename.to_string(),
        options,
    }
    .log();
}

pub fn stats_callback_panicked(panic: &str) {
    AuditEvent::StatsCallbackPanicked {
        common: CommonFields::new("error"),
        panic: panic.to_string(),
    }
    .log();
}
