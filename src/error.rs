use thiserror::Error;

/// Gateway-wide error taxonomy.
///
/// Variants map to the error *kinds* from the protocol design, not to raw
/// transport errors: each one knows its client-facing `code` string and,
/// where relevant, the WS close code that must follow it.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("authentication required")]
    AuthenticationFailed,

    #[error("server at capacity")]
    ServerAtCapacity,

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("invalid payload: {reason}")]
    InvalidPayload {
        reason: &'static str,
        message: String,
        details: serde_json::Value,
    },

    #[error("rate limit exceeded ({kind})")]
    RateLimitExceeded {
        kind: &'static str,
        retry_in: f64,
        limit: u64,
        window_seconds: f64,
    },

    #[error("utterance exceeded maximum audio duration")]
    UtteranceTooLong {
        max_audio_seconds: f64,
        max_audio_bytes: u64,
        received_audio_seconds: f64,
        received_audio_bytes: u64,
    },

    #[error("inbound queue full")]
    InboundQueueFull { inbound_queue_max: usize },

    #[error("engine error: {message}")]
    Engine { code: String, message: String },

    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }

    pub fn invalid_payload<S: Into<String>>(reason: &'static str, message: S) -> Self {
        Self::InvalidPayload {
            reason,
            message: message.into(),
            details: serde_json::json!({}),
        }
    }

    pub fn invalid_payload_with_details<S: Into<String>>(
        reason: &'static str,
        message: S,
        details: serde_json::Value,
    ) -> Self {
        Self::InvalidPayload {
            reason,
            message: message.into(),
            details,
        }
    }

    /// The client-facing `error.code` string for this variant.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Config(_) => "internal_error",
            Self::AuthenticationFailed => "authentication_failed",
            Self::ServerAtCapacity => "server_at_capacity",
            Self::InvalidMessage(_) => "invalid_message",
            Self::InvalidPayload { .. } => "invalid_payload",
            Self::RateLimitExceeded { .. } => "rate_limited",
            Self::UtteranceTooLong { .. } => "utterance_too_long",
            Self::InboundQueueFull { .. } => "internal_error",
            Self::Engine { code, .. } => normalize_engine_code(code),
            Self::Internal(_) => "internal_error",
        }
    }

    /// WS close code that must follow this error, if the connection cannot
    /// continue.
    pub fn close_code(&self) -> Option<u16> {
        match self {
            Self::AuthenticationFailed => Some(4001),
            Self::ServerAtCapacity => Some(4002),
            Self::InboundQueueFull { .. } => Some(4002),
            _ => None,
        }
    }

    /// JSON `details` object for the error envelope's payload.
    pub fn details(&self) -> serde_json::Value {
        match self {
            Self::InvalidPayload { reason, details, .. } => {
                let mut obj = details.clone();
                if let Some(map) = obj.as_object_mut() {
                    map.entry("reason_code").or_insert_with(|| (*reason).into());
                }
                obj
            }
            Self::RateLimitExceeded {
                kind,
                retry_in,
                limit,
                window_seconds,
            } => serde_json::json!({
                "retry_in": retry_in.ceil().max(1.0) as u64,
                "limit": limit,
                "window_seconds": *window_seconds as u64,
                "kind": kind,
            }),
            Self::UtteranceTooLong {
                max_audio_seconds,
                max_audio_bytes,
                received_audio_seconds,
                received_audio_bytes,
            } => serde_json::json!({
                "max_audio_seconds": max_audio_seconds,
                "max_audio_bytes": max_audio_bytes,
                "received_audio_seconds": received_audio_seconds,
                "received_audio_bytes": received_audio_bytes,
            }),
            Self::InboundQueueFull { inbound_queue_max } => serde_json::json!({
                "inbound_queue_max": inbound_queue_max,
            }),
            Self::Engine { code, .. } => serde_json::json!({ "reason_code": code }),
            _ => serde_json::json!({}),
        }
    }
}

/// Engine-origin codes are forwarded verbatim when recognized, otherwise
/// collapsed to `internal_error` per the error-origin propagation rule.
pub fn normalize_engine_code(code: &str) -> &'static str {
    match code {
        "authentication_failed" => "authentication_failed",
        "server_at_capacity" => "server_at_capacity",
        "invalid_message" => "invalid_message",
        "invalid_payload" => "invalid_payload",
        "rate_limited" => "rate_limited",
        "utterance_too_long" => "utterance_too_long",
        _ => "internal_error",
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_details_round_trip() {
        let err = GatewayError::RateLimitExceeded {
            kind: "message",
            retry_in: 2.4,
            limit: 5,
            window_seconds: 1.0,
        };
        assert_eq!(err.code(), "rate_limited");
        assert_eq!(err.details()["kind"], "message");
        assert_eq!(err.details()["limit"], 5);
    }

    #[test]
    fn invalid_payload_carries_reason_code() {
        let err = GatewayError::invalid_payload("no_active_request", "no active request");
        assert_eq!(err.details()["reason_code"], "no_active_request");
    }

    #[test]
    fn close_codes_match_taxonomy() {
        assert_eq!(GatewayError::AuthenticationFailed.close_code(), Some(4001));
        assert_eq!(GatewayError::ServerAtCapacity.close_code(), Some(4002));
        assert_eq!(
            GatewayError::invalid_payload("x", "y").close_code(),
            None
        );
    }
}
