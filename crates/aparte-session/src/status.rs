//! Composite session status derivation.
//!
//! The status a caller observes is a pure function of three independent
//! inputs — the media failure slot, the queue phase, and the transport
//! state — with an explicit precedence, so it is testable without any
//! async machinery:
//!
//! | precedence | input                    | status                            |
//! |-----------:|--------------------------|-----------------------------------|
//! | 1          | media failure            | `PermissionDenied`/`NoMic`/`MediaError` |
//! | 2          | transport (when present) | `Connecting`/`Connected`/`Ended`  |
//! | 3          | queue phase              | `Idle`/`Waiting`/`Matched`/`Error`|

use serde::Serialize;

use aparte_media::{MediaFailure, TransportState};

/// The queue engine's externally visible phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueuePhase {
    Idle,
    Waiting,
    Matched,
    Error,
}

/// The composite status exposed by the session façade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Idle,
    Waiting,
    Matched,
    Connecting,
    Connected,
    Ended,
    PermissionDenied,
    NoMic,
    MediaError,
    Error,
}

pub fn derive_status(
    media: Option<MediaFailure>,
    queue: QueuePhase,
    transport: Option<TransportState>,
) -> SessionStatus {
    if let Some(failure) = media {
        return match failure {
            MediaFailure::PermissionDenied => SessionStatus::PermissionDenied,
            MediaFailure::NoMic => SessionStatus::NoMic,
            MediaFailure::Failed => SessionStatus::MediaError,
        };
    }

    if let Some(transport) = transport {
        return match transport {
            TransportState::New | TransportState::Connecting => SessionStatus::Connecting,
            TransportState::Connected => SessionStatus::Connected,
            TransportState::Disconnected | TransportState::Failed | TransportState::Closed => {
                SessionStatus::Ended
            }
        };
    }

    match queue {
        QueuePhase::Idle => SessionStatus::Idle,
        QueuePhase::Waiting => SessionStatus::Waiting,
        QueuePhase::Matched => SessionStatus::Matched,
        QueuePhase::Error => SessionStatus::Error,
    }
}
