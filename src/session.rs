//! Consumer connection state machine: the outer boundary where wire
//! aliases meet subject-level dispatch.
//!
//! One session exists per consumer connection. It owns the alias table,
//! translates inbound dialect records into aggregator inputs, maps
//! outbound deliveries back to alias form, answers pings, and routes
//! signals toward the producing service. Anything malformed is fatal for
//! the connection, mirroring the framing contract of the transport.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::aggregator::{AggregatorMsg, ConsumerEvent};
use crate::binding::LocationRegistry;
use crate::core::{Alias, Limits, StreamUpdate, Subject};
use crate::endpoint::{EndpointRef, SignalReply};
use crate::proto::{
    CodecError, DialectMessage, Signal, SignalAck, decode_frame,
};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("text frames are not part of the dialect")]
    TextFrame,
    #[error("unexpected server-to-consumer message {0} on the inbound path")]
    UnexpectedMessage(&'static str),
}

/// One transport frame as the session sees it.
#[derive(Clone, Copy, Debug)]
pub enum InboundFrame<'a> {
    Binary(&'a [u8]),
    Text,
}

/// Side effects of one handled frame, performed by the connection pump.
#[derive(Clone, Debug)]
pub enum SessionAction {
    /// Forward to the connection's aggregator mailbox.
    ToAggregator(AggregatorMsg),
    /// Send a dialect record back to the consumer.
    Reply(DialectMessage),
    /// Route a signal to the producing service's endpoint.
    ForwardSignal {
        endpoint: EndpointRef,
        signal: Signal,
    },
}

pub struct DialectSession {
    limits: Limits,
    registry: LocationRegistry,
    aliases: BTreeMap<Alias, Subject>,
    subjects: BTreeMap<Subject, Alias>,
    highest_alias: u32,
}

impl DialectSession {
    pub fn new(limits: Limits, registry: LocationRegistry) -> Self {
        Self {
            limits,
            registry,
            aliases: BTreeMap::new(),
            subjects: BTreeMap::new(),
            highest_alias: 0,
        }
    }

    /// Handles one transport frame. A decode failure or a text frame is
    /// fatal: the caller must terminate the connection.
    pub fn handle_frame(
        &mut self,
        frame: InboundFrame<'_>,
    ) -> Result<Vec<SessionAction>, SessionError> {
        let payload = match frame {
            InboundFrame::Binary(payload) => payload,
            InboundFrame::Text => return Err(SessionError::TextFrame),
        };
        let mut actions = Vec::new();
        for message in decode_frame(payload, &self.limits)? {
            self.handle_message(message, &mut actions)?;
        }
        Ok(actions)
    }

    fn handle_message(
        &mut self,
        message: DialectMessage,
        actions: &mut Vec<SessionAction>,
    ) -> Result<(), SessionError> {
        match message {
            DialectMessage::Alias(binding) => {
                // Aliases are client-assigned, strictly increasing, never
                // reused; a violation is a consumer bug worth surfacing.
                if binding.alias.get() <= self.highest_alias {
                    tracing::debug!(alias = %binding.alias, "non-monotonic alias registration");
                    actions.push(SessionAction::Reply(DialectMessage::InvalidRequest {
                        alias: binding.alias,
                    }));
                    return Ok(());
                }
                self.highest_alias = binding.alias.get();
                self.subjects
                    .insert(binding.subject.clone(), binding.alias);
                self.aliases.insert(binding.alias, binding.subject);
            }
            DialectMessage::OpenSubscription(open) => match self.aliases.get(&open.alias) {
                Some(subject) => actions.push(SessionAction::ToAggregator(AggregatorMsg::Open {
                    subject: subject.clone(),
                    priority_key: open.priority_key,
                    aggregation_interval_ms: open.aggregation_interval_ms,
                })),
                None => actions.push(invalid_request(open.alias)),
            },
            DialectMessage::CloseSubscription { alias } => match self.aliases.get(&alias) {
                Some(subject) => actions.push(SessionAction::ToAggregator(AggregatorMsg::Close {
                    subject: subject.clone(),
                })),
                None => actions.push(invalid_request(alias)),
            },
            DialectMessage::ResetSubscription { alias } => match self.aliases.get(&alias) {
                Some(subject) => actions.push(SessionAction::ToAggregator(AggregatorMsg::Reset {
                    subject: subject.clone(),
                })),
                None => actions.push(invalid_request(alias)),
            },
            DialectMessage::Signal(signal) => match self.registry.lookup(&signal.subject.service)
            {
                Some(endpoint) => {
                    actions.push(SessionAction::ForwardSignal { endpoint, signal });
                }
                None => {
                    // Without a binding the signal cannot be delivered; a
                    // correlated sender hears about it, others do not.
                    if let Some(correlation_id) = signal.correlation_id {
                        actions.push(SessionAction::Reply(DialectMessage::SignalAckFailed(
                            SignalAck {
                                correlation_id,
                                payload: None,
                            },
                        )));
                    }
                }
            },
            DialectMessage::Ping { id } => {
                actions.push(SessionAction::Reply(DialectMessage::Pong { id }));
            }
            DialectMessage::Pong { .. } => {}
            DialectMessage::StreamStateUpdate { .. } => {
                return Err(SessionError::UnexpectedMessage("StreamStateUpdate"));
            }
            DialectMessage::StreamStateTransitionUpdate { .. } => {
                return Err(SessionError::UnexpectedMessage("StreamStateTransitionUpdate"));
            }
            DialectMessage::SubscriptionClosed { .. } => {
                return Err(SessionError::UnexpectedMessage("SubscriptionClosed"));
            }
            DialectMessage::ServiceNotAvailable { .. } => {
                return Err(SessionError::UnexpectedMessage("ServiceNotAvailable"));
            }
            DialectMessage::InvalidRequest { .. } => {
                return Err(SessionError::UnexpectedMessage("InvalidRequest"));
            }
            DialectMessage::SignalAckOk(_) => {
                return Err(SessionError::UnexpectedMessage("SignalAckOk"));
            }
            DialectMessage::SignalAckFailed(_) => {
                return Err(SessionError::UnexpectedMessage("SignalAckFailed"));
            }
        }
        Ok(())
    }

    /// Maps an aggregator delivery to its wire form. Returns `None` when
    /// the subject has no alias (registration raced a close); the delivery
    /// is dropped rather than sent unaddressable.
    pub fn encode_event(&self, event: ConsumerEvent) -> Option<DialectMessage> {
        match event {
            ConsumerEvent::Update { subject, update } => {
                let alias = self.alias_of(&subject)?;
                Some(match update {
                    StreamUpdate::Snapshot(state) => {
                        DialectMessage::StreamStateUpdate { alias, state }
                    }
                    StreamUpdate::Transition(transition) => {
                        DialectMessage::StreamStateTransitionUpdate { alias, transition }
                    }
                })
            }
            ConsumerEvent::SubscriptionClosed { subject } => {
                let alias = self.alias_of(&subject)?;
                Some(DialectMessage::SubscriptionClosed { alias })
            }
            ConsumerEvent::ServiceNotAvailable { service } => {
                Some(DialectMessage::ServiceNotAvailable { service })
            }
            ConsumerEvent::InvalidRequest { subject } => {
                let alias = self.alias_of(&subject)?;
                Some(DialectMessage::InvalidRequest { alias })
            }
        }
    }

    /// Maps a signal acknowledgement to its wire form.
    pub fn encode_signal_reply(&self, reply: SignalReply) -> DialectMessage {
        if reply.ok {
            DialectMessage::SignalAckOk(reply.ack)
        } else {
            DialectMessage::SignalAckFailed(reply.ack)
        }
    }

    fn alias_of(&self, subject: &Subject) -> Option<Alias> {
        let alias = self.subjects.get(subject).copied();
        if alias.is_none() {
            tracing::debug!(subject = %subject, "dropping delivery for unregistered subject");
        }
        alias
    }
}

fn invalid_request(alias: Alias) -> SessionAction {
    SessionAction::Reply(DialectMessage::InvalidRequest { alias })
}
