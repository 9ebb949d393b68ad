//! Live statistics exposed through `GET /stats`.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::handlers::RemoveReason;

/// A monotonically growing counter.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, v: u64) {
        self.0.fetch_add(v, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

impl serde::Serialize for Counter {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(self.get())
    }
}

#[derive(Debug, Default, serde::Serialize)]
pub struct DnsStats {
    pub cache_hits: Counter,
    pub successful_lookups: Counter,
    pub failed_lookups: Counter,
}

#[derive(Debug, Default, serde::Serialize)]
pub struct AuthStats {
    pub total_count: Counter,
    pub by_ip_count: Counter,
    pub failed_by_ip_count: Counter,
    pub by_login_count: Counter,
    pub failed_by_login_count: Counter,
    pub denied_port_count: Counter,
}

/// Removal reasons of finished connections, one counter per reason.
#[derive(Debug, Default, serde::Serialize)]
pub struct RemoveReasonStats {
    pub normal_completion: Counter,
    pub io_error: Counter,
    pub current_operation_timed_out: Counter,
    pub unsupported_protocol: Counter,
    pub protocol_error: Counter,
    pub unexpected_and_unsupported_case: Counter,
    pub no_activity_for_too_long: Counter,
    pub current_operation_canceled: Counter,
    pub unhandled_exception: Counter,
    pub ip_version_mismatch: Counter,
    pub access_denied: Counter,
    pub unresolved_target: Counter,
    pub target_end_broken: Counter,
    pub user_end_broken: Counter,
    pub http_response_before_completion_of_http_request: Counter,
    pub user_end_closed_by_client: Counter,
    pub http_no_incoming_request: Counter,
}

impl RemoveReasonStats {
    pub fn inc(&self, reason: RemoveReason) {
        match reason {
            RemoveReason::NormalCompletion => self.normal_completion.inc(),
            RemoveReason::IoError => self.io_error.inc(),
            RemoveReason::CurrentOperationTimedOut => self.current_operation_timed_out.inc(),
            RemoveReason::UnsupportedProtocol => self.unsupported_protocol.inc(),
            RemoveReason::ProtocolError => self.protocol_error.inc(),
            RemoveReason::UnexpectedAndUnsupportedCase => {
                self.unexpected_and_unsupported_case.inc()
            }
            RemoveReason::NoActivityForTooLong => self.no_activity_for_too_long.inc(),
            RemoveReason::CurrentOperationCanceled => self.current_operation_canceled.inc(),
            RemoveReason::UnhandledException => self.unhandled_exception.inc(),
            RemoveReason::IpVersionMismatch => self.ip_version_mismatch.inc(),
            RemoveReason::AccessDenied => self.access_denied.inc(),
            RemoveReason::UnresolvedTarget => self.unresolved_target.inc(),
            RemoveReason::TargetEndBroken => self.target_end_broken.inc(),
            RemoveReason::UserEndBroken => self.user_end_broken.inc(),
            RemoveReason::HttpResponseBeforeCompletionOfHttpRequest => {
                self.http_response_before_completion_of_http_request.inc()
            }
            RemoveReason::UserEndClosedByClient => self.user_end_closed_by_client.inc(),
            RemoveReason::HttpNoIncomingRequest => self.http_no_incoming_request.inc(),
        }
    }
}

/// Per-ACL connection statistics.
#[derive(Debug, Default, serde::Serialize)]
pub struct AclStats {
    pub total_connections: Counter,
    pub http_connections: Counter,
    pub socks5_connections: Counter,
    pub remove_reasons: RemoveReasonStats,
}
