//! The binary stream dialect: subscription protocol message schemas.
//!
//! Directionality: `C→S` messages travel from the consumer connection
//! toward producers, `S→C` back to the consumer. Subjects appear on the
//! wire once, in the [`AliasBinding`] registration; every later operation
//! references the alias.

use bytes::Bytes;

use crate::core::{Alias, CorrelationId, ServiceKey, StreamState, StreamStateTransition, Subject};

mod codec;

pub use codec::{CodecError, decode_frame, encode_frame, encode_record};

/// `C→S`. Registers `alias` as the wire handle for `subject`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AliasBinding {
    pub alias: Alias,
    pub subject: Subject,
}

/// `C→S`. Opens a subscription on a registered alias.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OpenSubscription {
    pub alias: Alias,
    pub priority_key: Option<String>,
    pub aggregation_interval_ms: u64,
}

/// `C→S`. Fire-and-forget RPC toward the producing service.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Signal {
    pub subject: Subject,
    pub payload: Bytes,
    pub expire_at_ms: u64,
    pub ordering_group: Option<String>,
    pub correlation_id: Option<CorrelationId>,
}

/// `S→C`. Outcome of a signal that carried a correlation id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignalAck {
    pub correlation_id: CorrelationId,
    pub payload: Option<Bytes>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DialectMessage {
    /// `C→S` alias registration.
    Alias(AliasBinding),
    /// `C→S` open a subscription.
    OpenSubscription(OpenSubscription),
    /// `C→S` close a subscription.
    CloseSubscription { alias: Alias },
    /// `C→S` request a full snapshot refresh.
    ResetSubscription { alias: Alias },
    /// `C→S` signal toward the producing service.
    Signal(Signal),
    /// Liveness probe, either direction.
    Ping { id: u64 },
    /// Liveness reply; must echo the ping id.
    Pong { id: u64 },
    /// `S→C` full state snapshot.
    StreamStateUpdate {
        alias: Alias,
        state: StreamState,
    },
    /// `S→C` incremental delta.
    StreamStateTransitionUpdate {
        alias: Alias,
        transition: StreamStateTransition,
    },
    /// `S→C` the producer closed the stream.
    SubscriptionClosed { alias: Alias },
    /// `S→C` no endpoint is currently bound for the service.
    ServiceNotAvailable { service: ServiceKey },
    /// `S→C` the request was rejected.
    InvalidRequest { alias: Alias },
    /// `S→C` signal acknowledged.
    SignalAckOk(SignalAck),
    /// `S→C` signal failed or expired.
    SignalAckFailed(SignalAck),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RecordKind {
    Alias,
    OpenSubscription,
    CloseSubscription,
    ResetSubscription,
    Signal,
    Ping,
    Pong,
    StreamStateUpdate,
    StreamStateTransitionUpdate,
    SubscriptionClosed,
    ServiceNotAvailable,
    InvalidRequest,
    SignalAckOk,
    SignalAckFailed,
}

impl RecordKind {
    pub(crate) fn as_u8(self) -> u8 {
        match self {
            RecordKind::Alias => 0x01,
            RecordKind::OpenSubscription => 0x02,
            RecordKind::CloseSubscription => 0x03,
            RecordKind::ResetSubscription => 0x04,
            RecordKind::Signal => 0x05,
            RecordKind::Ping => 0x06,
            RecordKind::Pong => 0x07,
            RecordKind::StreamStateUpdate => 0x10,
            RecordKind::StreamStateTransitionUpdate => 0x11,
            RecordKind::SubscriptionClosed => 0x12,
            RecordKind::ServiceNotAvailable => 0x13,
            RecordKind::InvalidRequest => 0x14,
            RecordKind::SignalAckOk => 0x15,
            RecordKind::SignalAckFailed => 0x16,
        }
    }

    pub(crate) fn parse(raw: u8) -> Option<Self> {
        match raw {
            0x01 => Some(RecordKind::Alias),
            0x02 => Some(RecordKind::OpenSubscription),
            0x03 => Some(RecordKind::CloseSubscription),
            0x04 => Some(RecordKind::ResetSubscription),
            0x05 => Some(RecordKind::Signal),
            0x06 => Some(RecordKind::Ping),
            0x07 => Some(RecordKind::Pong),
            0x10 => Some(RecordKind::StreamStateUpdate),
            0x11 => Some(RecordKind::StreamStateTransitionUpdate),
            0x12 => Some(RecordKind::SubscriptionClosed),
            0x13 => Some(RecordKind::ServiceNotAvailable),
            0x14 => Some(RecordKind::InvalidRequest),
            0x15 => Some(RecordKind::SignalAckOk),
            0x16 => Some(RecordKind::SignalAckFailed),
            _ => None,
        }
    }
}

impl DialectMessage {
    pub(crate) fn kind(&self) -> RecordKind {
        match self {
            DialectMessage::Alias(_) => RecordKind::Alias,
            DialectMessage::OpenSubscription(_) => RecordKind::OpenSubscription,
            DialectMessage::CloseSubscription { .. } => RecordKind::CloseSubscription,
            DialectMessage::ResetSubscription { .. } => RecordKind::ResetSubscription,
            DialectMessage::Signal(_) => RecordKind::Signal,
            DialectMessage::Ping { .. } => RecordKind::Ping,
            DialectMessage::Pong { .. } => RecordKind::Pong,
            DialectMessage::StreamStateUpdate { .. } => RecordKind::StreamStateUpdate,
            DialectMessage::StreamStateTransitionUpdate { .. } => {
                RecordKind::StreamStateTransitionUpdate
            }
            DialectMessage::SubscriptionClosed { .. } => RecordKind::SubscriptionClosed,
            DialectMessage::ServiceNotAvailable { .. } => RecordKind::ServiceNotAvailable,
            DialectMessage::InvalidRequest { .. } => RecordKind::InvalidRequest,
            DialectMessage::SignalAckOk(_) => RecordKind::SignalAckOk,
            DialectMessage::SignalAckFailed(_) => RecordKind::SignalAckFailed,
        }
    }
}
