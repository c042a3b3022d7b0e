//! Producer-side stream endpoint: the per-service hub at the node hosting
//! a service.
//!
//! Services register topics and publish snapshots/transitions in-process;
//! remote aggregators open local streams and grant demand tokens. The
//! endpoint never sends beyond a subscriber's granted window: a subject
//! that changes while the window is empty is marked dirty and flushed as a
//! fresh snapshot once demand arrives.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use bytes::Bytes;
use crossbeam::channel::Sender;

use crate::aggregator::AggregatorRef;
use crate::core::{
    Limits, ServiceKey, SetTransition, StreamState, StreamStateTransition, StreamUpdate, Subject,
    Tags, TopicKey,
};
use crate::proto::{Signal, SignalAck};

mod runtime;

pub use runtime::{EndpointHandle, TopicPublisher, spawn_endpoint};

/// Commands an aggregator sends to a producer endpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamCommand {
    OpenLocalStreamFor(Subject),
    CloseLocalStreamFor(Subject),
    OpenLocalStreamsForAll(Vec<Subject>),
    CloseAllLocalStreams,
    ResetLocalStreamFor(Subject),
    GrantDemand(u64),
}

/// Address of an endpoint mailbox. Compared by id; the channel is runtime
/// plumbing.
#[derive(Clone)]
pub struct EndpointRef {
    id: u64,
    tx: Sender<EndpointMsg>,
}

impl EndpointRef {
    pub fn new(id: u64, tx: Sender<EndpointMsg>) -> Self {
        Self { id, tx }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn send(&self, msg: EndpointMsg) -> bool {
        self.tx.send(msg).is_ok()
    }
}

impl fmt::Debug for EndpointRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EndpointRef({})", self.id)
    }
}

impl PartialEq for EndpointRef {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for EndpointRef {}

/// Outcome a signal handler reports for one signal.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SignalDisposition {
    Ack(Option<Bytes>),
    Fail(Option<Bytes>),
}

/// Producer-side signal callback, registered per service.
pub trait SignalHandler: Send {
    fn handle_signal(&mut self, signal: &Signal) -> SignalDisposition;
}

/// Acknowledgement routed back to the consumer connection that sent the
/// signal.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignalReply {
    pub ok: bool,
    pub ack: SignalAck,
}

/// Inputs accepted by the endpoint mailbox.
#[derive(Clone, Debug)]
pub enum EndpointMsg {
    /// A stream command from a subscribing aggregator.
    Command {
        from: AggregatorRef,
        command: StreamCommand,
    },
    /// In-process service registers (or re-registers) a topic.
    RegisterTopic {
        topic: TopicKey,
        tags: Tags,
        partial_updates: bool,
        initial: Option<StreamState>,
    },
    /// In-process service publishes to a topic.
    Publish {
        topic: TopicKey,
        tags: Tags,
        update: StreamUpdate,
    },
    /// In-process service withdraws a topic; open streams close.
    RetireTopic { topic: TopicKey, tags: Tags },
    /// A signal routed from a consumer connection.
    Signal {
        signal: Signal,
        reply: Option<Sender<SignalReply>>,
    },
}

/// Side effects of one handled input, performed by the runtime.
#[derive(Clone, Debug)]
pub enum EndpointAction {
    Forward {
        subscriber: AggregatorRef,
        subject: Subject,
        update: StreamUpdate,
    },
    StreamClosed {
        subscriber: AggregatorRef,
        subject: Subject,
    },
    StreamRejected {
        subscriber: AggregatorRef,
        subject: Subject,
    },
    ReplySignal {
        reply: Sender<SignalReply>,
        outcome: SignalReply,
    },
}

#[derive(Debug)]
struct TopicState {
    partial_updates: bool,
    current: Option<StreamState>,
}

struct SubscriberState {
    subscriber: AggregatorRef,
    open: BTreeSet<Subject>,
    demand: u64,
    dirty: BTreeSet<Subject>,
}

impl SubscriberState {
    fn new(subscriber: AggregatorRef) -> Self {
        Self {
            subscriber,
            open: BTreeSet::new(),
            demand: 0,
            dirty: BTreeSet::new(),
        }
    }
}

pub struct StreamEndpoint {
    service: ServiceKey,
    limits: Limits,
    topics: BTreeMap<(TopicKey, Tags), TopicState>,
    subscribers: BTreeMap<u64, SubscriberState>,
    signal_handler: Option<Box<dyn SignalHandler>>,
}

impl StreamEndpoint {
    pub fn new(service: ServiceKey, limits: Limits) -> Self {
        Self {
            service,
            limits,
            topics: BTreeMap::new(),
            subscribers: BTreeMap::new(),
            signal_handler: None,
        }
    }

    pub fn set_signal_handler(&mut self, handler: Box<dyn SignalHandler>) {
        self.signal_handler = Some(handler);
    }

    pub fn service(&self) -> &ServiceKey {
        &self.service
    }

    pub fn handle(&mut self, msg: EndpointMsg, now_ms: u64) -> Vec<EndpointAction> {
        let mut actions = Vec::new();
        match msg {
            EndpointMsg::Command { from, command } => {
                self.handle_command(from, command, &mut actions);
            }
            EndpointMsg::RegisterTopic {
                topic,
                tags,
                partial_updates,
                initial,
            } => {
                self.topics.insert(
                    (topic, tags),
                    TopicState {
                        partial_updates,
                        current: initial,
                    },
                );
            }
            EndpointMsg::Publish {
                topic,
                tags,
                update,
            } => self.handle_publish(topic, tags, update, &mut actions),
            EndpointMsg::RetireTopic { topic, tags } => {
                self.handle_retire(topic, tags, &mut actions);
            }
            EndpointMsg::Signal { signal, reply } => {
                self.handle_signal(signal, reply, now_ms, &mut actions);
            }
        }
        actions
    }

    fn handle_command(
        &mut self,
        from: AggregatorRef,
        command: StreamCommand,
        actions: &mut Vec<EndpointAction>,
    ) {
        match command {
            StreamCommand::OpenLocalStreamFor(subject) => {
                self.open_one(&from, subject, actions);
            }
            StreamCommand::OpenLocalStreamsForAll(subjects) => {
                for subject in subjects {
                    self.open_one(&from, subject, actions);
                }
            }
            StreamCommand::CloseLocalStreamFor(subject) => {
                if let Some(sub) = self.subscribers.get_mut(&from.id()) {
                    sub.open.remove(&subject);
                    sub.dirty.remove(&subject);
                }
            }
            StreamCommand::CloseAllLocalStreams => {
                self.subscribers.remove(&from.id());
            }
            StreamCommand::ResetLocalStreamFor(subject) => {
                let current = self
                    .topics
                    .get(&(subject.topic.clone(), subject.tags.clone()))
                    .and_then(|t| t.current.clone());
                if let Some(sub) = self.subscribers.get_mut(&from.id())
                    && sub.open.contains(&subject)
                    && let Some(state) = current
                {
                    send_or_mark_dirty(sub, subject, StreamUpdate::Snapshot(state), actions);
                }
            }
            StreamCommand::GrantDemand(tokens) => {
                self.handle_grant(&from, tokens, actions);
            }
        }
    }

    fn open_one(
        &mut self,
        from: &AggregatorRef,
        subject: Subject,
        actions: &mut Vec<EndpointAction>,
    ) {
        let known_topic = subject.service == self.service
            && self
                .topics
                .contains_key(&(subject.topic.clone(), subject.tags.clone()));
        if !known_topic {
            tracing::debug!(subject = %subject, "rejecting open for unknown subject");
            actions.push(EndpointAction::StreamRejected {
                subscriber: from.clone(),
                subject,
            });
            return;
        }

        if !self.subscribers.contains_key(&from.id()) {
            if self.subscribers.len() >= self.limits.max_endpoint_subscribers {
                tracing::warn!(
                    subscriber = from.id(),
                    "subscriber limit reached, rejecting open"
                );
                actions.push(EndpointAction::StreamRejected {
                    subscriber: from.clone(),
                    subject,
                });
                return;
            }
            self.subscribers
                .insert(from.id(), SubscriberState::new(from.clone()));
        }

        let current = self
            .topics
            .get(&(subject.topic.clone(), subject.tags.clone()))
            .and_then(|t| t.current.clone());
        if let Some(sub) = self.subscribers.get_mut(&from.id()) {
            sub.open.insert(subject.clone());
            // First attach delivers the current state as a snapshot.
            if let Some(state) = current {
                send_or_mark_dirty(sub, subject, StreamUpdate::Snapshot(state), actions);
            }
        }
    }

    fn handle_grant(
        &mut self,
        from: &AggregatorRef,
        tokens: u64,
        actions: &mut Vec<EndpointAction>,
    ) {
        let Some(sub) = self.subscribers.get_mut(&from.id()) else {
            return;
        };
        sub.demand = sub.demand.saturating_add(tokens);
        // Flush subjects that changed while the window was empty.
        while sub.demand > 0 {
            let Some(subject) = sub.dirty.pop_first() else {
                break;
            };
            let current = self
                .topics
                .get(&(subject.topic.clone(), subject.tags.clone()))
                .and_then(|t| t.current.clone());
            if let Some(state) = current {
                sub.demand -= 1;
                actions.push(EndpointAction::Forward {
                    subscriber: sub.subscriber.clone(),
                    subject,
                    update: StreamUpdate::Snapshot(state),
                });
            }
        }
    }

    fn handle_publish(
        &mut self,
        topic: TopicKey,
        tags: Tags,
        update: StreamUpdate,
        actions: &mut Vec<EndpointAction>,
    ) {
        let key = (topic.clone(), tags.clone());
        let Some(topic_state) = self.topics.get_mut(&key) else {
            tracing::warn!(topic = %topic, "publish to unregistered topic dropped");
            return;
        };

        let Some(next) = update.apply(topic_state.current.as_ref()) else {
            tracing::warn!(
                topic = %topic,
                "published update does not apply to current topic state, dropped"
            );
            return;
        };
        topic_state.current = Some(next.clone());

        // With partial updates disabled the stream only ever carries
        // snapshots of set state.
        let outbound = match &update {
            StreamUpdate::Transition(StreamStateTransition::Set(SetTransition::Delta {
                ..
            })) if !topic_state.partial_updates => StreamUpdate::Snapshot(next),
            _ => update,
        };

        let subject = Subject::new(self.service.clone(), topic, tags);
        for sub in self.subscribers.values_mut() {
            if !sub.open.contains(&subject) {
                continue;
            }
            if sub.dirty.contains(&subject) {
                // Still behind: a snapshot will flush on the next grant.
                continue;
            }
            send_or_mark_dirty(sub, subject.clone(), outbound.clone(), actions);
        }
    }

    fn handle_retire(&mut self, topic: TopicKey, tags: Tags, actions: &mut Vec<EndpointAction>) {
        let key = (topic.clone(), tags.clone());
        if self.topics.remove(&key).is_none() {
            return;
        }
        let subject = Subject::new(self.service.clone(), topic, tags);
        for sub in self.subscribers.values_mut() {
            if sub.open.remove(&subject) {
                sub.dirty.remove(&subject);
                actions.push(EndpointAction::StreamClosed {
                    subscriber: sub.subscriber.clone(),
                    subject: subject.clone(),
                });
            }
        }
    }

    fn handle_signal(
        &mut self,
        signal: Signal,
        reply: Option<Sender<SignalReply>>,
        now_ms: u64,
        actions: &mut Vec<EndpointAction>,
    ) {
        let disposition = if signal.expire_at_ms < now_ms {
            tracing::debug!(subject = %signal.subject, "dropping expired signal");
            SignalDisposition::Fail(None)
        } else if signal.subject.service != self.service {
            SignalDisposition::Fail(None)
        } else {
            match self.signal_handler.as_mut() {
                Some(handler) => handler.handle_signal(&signal),
                None => {
                    tracing::debug!(
                        subject = %signal.subject,
                        "no signal handler registered, failing signal"
                    );
                    SignalDisposition::Fail(None)
                }
            }
        };

        // Acknowledgements only exist for correlated signals.
        let (Some(reply), Some(correlation_id)) = (reply, signal.correlation_id) else {
            return;
        };
        let outcome = match disposition {
            SignalDisposition::Ack(payload) => SignalReply {
                ok: true,
                ack: SignalAck {
                    correlation_id,
                    payload,
                },
            },
            SignalDisposition::Fail(payload) => SignalReply {
                ok: false,
                ack: SignalAck {
                    correlation_id,
                    payload,
                },
            },
        };
        actions.push(EndpointAction::ReplySignal { reply, outcome });
    }
}

fn send_or_mark_dirty(
    sub: &mut SubscriberState,
    subject: Subject,
    update: StreamUpdate,
    actions: &mut Vec<EndpointAction>,
) {
    if sub.demand > 0 {
        sub.demand -= 1;
        actions.push(EndpointAction::Forward {
            subscriber: sub.subscriber.clone(),
            subject,
            update,
        });
    } else {
        sub.dirty.insert(subject);
    }
}

#[cfg(test)]
mod tests {
    use crossbeam::channel::unbounded;

    use crate::aggregator::AggregatorMsg;
    use crate::core::{CorrelationId, SetState, StreamState};

    use super::*;

    fn service() -> ServiceKey {
        ServiceKey::parse("svc").unwrap()
    }

    fn subject(topic: &str) -> Subject {
        Subject::new(
            service(),
            TopicKey::parse(topic).unwrap(),
            Tags::empty(),
        )
    }

    fn aggregator_ref(id: u64) -> AggregatorRef {
        let (tx, _rx) = unbounded::<AggregatorMsg>();
        AggregatorRef::new(id, tx)
    }

    fn endpoint_with_topic(topic: &str, initial: Option<StreamState>) -> StreamEndpoint {
        let mut endpoint = StreamEndpoint::new(service(), Limits::default());
        endpoint.handle(
            EndpointMsg::RegisterTopic {
                topic: TopicKey::parse(topic).unwrap(),
                tags: Tags::empty(),
                partial_updates: true,
                initial,
            },
            0,
        );
        endpoint
    }

    fn open(
        endpoint: &mut StreamEndpoint,
        from: &AggregatorRef,
        topic: &str,
    ) -> Vec<EndpointAction> {
        endpoint.handle(
            EndpointMsg::Command {
                from: from.clone(),
                command: StreamCommand::OpenLocalStreamFor(subject(topic)),
            },
            0,
        )
    }

    fn grant(
        endpoint: &mut StreamEndpoint,
        from: &AggregatorRef,
        tokens: u64,
    ) -> Vec<EndpointAction> {
        endpoint.handle(
            EndpointMsg::Command {
                from: from.clone(),
                command: StreamCommand::GrantDemand(tokens),
            },
            0,
        )
    }

    fn publish_string(
        endpoint: &mut StreamEndpoint,
        topic: &str,
        value: &str,
    ) -> Vec<EndpointAction> {
        endpoint.handle(
            EndpointMsg::Publish {
                topic: TopicKey::parse(topic).unwrap(),
                tags: Tags::empty(),
                update: StreamUpdate::Transition(StreamStateTransition::String {
                    value: value.into(),
                }),
            },
            0,
        )
    }

    fn forwards(actions: &[EndpointAction]) -> Vec<(Subject, StreamUpdate)> {
        actions
            .iter()
            .filter_map(|a| match a {
                EndpointAction::Forward {
                    subject, update, ..
                } => Some((subject.clone(), update.clone())),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn attach_forwards_current_state_as_snapshot() {
        let mut endpoint = endpoint_with_topic("t", Some(StreamState::string("v1")));
        let agg = aggregator_ref(1);
        grant(&mut endpoint, &agg, 1);

        // Grant for an unknown subscriber is ignored; open first.
        let actions = open(&mut endpoint, &agg, "t");
        assert!(forwards(&actions).is_empty());

        let actions = grant(&mut endpoint, &agg, 1);
        assert_eq!(
            forwards(&actions),
            vec![(
                subject("t"),
                StreamUpdate::Snapshot(StreamState::string("v1"))
            )]
        );
    }

    #[test]
    fn attach_with_demand_forwards_immediately() {
        let mut endpoint = endpoint_with_topic("t", Some(StreamState::string("v1")));
        let agg = aggregator_ref(1);
        open(&mut endpoint, &agg, "t");
        grant(&mut endpoint, &agg, 2);

        let actions = publish_string(&mut endpoint, "t", "v2");
        assert_eq!(
            forwards(&actions),
            vec![(
                subject("t"),
                StreamUpdate::Transition(StreamStateTransition::String { value: "v2".into() })
            )]
        );
    }

    #[test]
    fn without_demand_updates_go_dirty_and_flush_as_snapshots() {
        let mut endpoint = endpoint_with_topic("t", None);
        let agg = aggregator_ref(1);
        open(&mut endpoint, &agg, "t");

        assert!(forwards(&publish_string(&mut endpoint, "t", "v1")).is_empty());
        assert!(forwards(&publish_string(&mut endpoint, "t", "v2")).is_empty());

        // One grant flushes the latest state, once, as a snapshot.
        let actions = grant(&mut endpoint, &agg, 5);
        assert_eq!(
            forwards(&actions),
            vec![(
                subject("t"),
                StreamUpdate::Snapshot(StreamState::string("v2"))
            )]
        );
    }

    #[test]
    fn never_sends_beyond_the_granted_window() {
        let mut endpoint = endpoint_with_topic("t", None);
        let agg = aggregator_ref(1);
        open(&mut endpoint, &agg, "t");
        grant(&mut endpoint, &agg, 2);

        let mut sent = 0;
        for i in 0..5 {
            sent += forwards(&publish_string(&mut endpoint, "t", &format!("v{i}"))).len();
        }
        assert_eq!(sent, 2);
    }

    #[test]
    fn unknown_subject_is_rejected() {
        let mut endpoint = endpoint_with_topic("t", None);
        let agg = aggregator_ref(1);
        let actions = open(&mut endpoint, &agg, "missing");
        assert!(matches!(
            actions.as_slice(),
            [EndpointAction::StreamRejected { subject: s, .. }] if *s == subject("missing")
        ));
    }

    #[test]
    fn reset_replays_a_snapshot() {
        let mut endpoint = endpoint_with_topic("t", Some(StreamState::string("v1")));
        let agg = aggregator_ref(1);
        open(&mut endpoint, &agg, "t");
        grant(&mut endpoint, &agg, 5);

        let actions = endpoint.handle(
            EndpointMsg::Command {
                from: agg.clone(),
                command: StreamCommand::ResetLocalStreamFor(subject("t")),
            },
            0,
        );
        // Attach already consumed a token; the reset sends another snapshot.
        assert_eq!(
            forwards(&actions),
            vec![(
                subject("t"),
                StreamUpdate::Snapshot(StreamState::string("v1"))
            )]
        );
    }

    #[test]
    fn partial_updates_off_rewrites_set_deltas_to_snapshots() {
        let mut endpoint = StreamEndpoint::new(service(), Limits::default());
        endpoint.handle(
            EndpointMsg::RegisterTopic {
                topic: TopicKey::parse("t").unwrap(),
                tags: Tags::empty(),
                partial_updates: false,
                initial: Some(StreamState::Set(SetState::new(1, []))),
            },
            0,
        );
        let agg = aggregator_ref(1);
        open(&mut endpoint, &agg, "t");
        grant(&mut endpoint, &agg, 5);

        let actions = endpoint.handle(
            EndpointMsg::Publish {
                topic: TopicKey::parse("t").unwrap(),
                tags: Tags::empty(),
                update: StreamUpdate::Transition(StreamStateTransition::Set(
                    SetTransition::Delta {
                        base_version: 1,
                        added: [Bytes::from_static(b"x")].into_iter().collect(),
                        removed: Default::default(),
                    },
                )),
            },
            0,
        );
        let sent = forwards(&actions);
        assert_eq!(sent.len(), 1);
        // There was already one forward (the attach snapshot) before this.
        let last = sent.last().map(|(_, u)| u.clone());
        assert!(matches!(
            last,
            Some(StreamUpdate::Snapshot(StreamState::Set(s))) if s.version == 2
        ));
    }

    #[test]
    fn retire_closes_open_streams() {
        let mut endpoint = endpoint_with_topic("t", Some(StreamState::string("v1")));
        let agg = aggregator_ref(1);
        open(&mut endpoint, &agg, "t");

        let actions = endpoint.handle(
            EndpointMsg::RetireTopic {
                topic: TopicKey::parse("t").unwrap(),
                tags: Tags::empty(),
            },
            0,
        );
        assert!(matches!(
            actions.as_slice(),
            [EndpointAction::StreamClosed { subject: s, .. }] if *s == subject("t")
        ));
    }

    struct EchoHandler;

    impl SignalHandler for EchoHandler {
        fn handle_signal(&mut self, signal: &Signal) -> SignalDisposition {
            SignalDisposition::Ack(Some(signal.payload.clone()))
        }
    }

    fn signal(corr: Option<CorrelationId>, expire_at_ms: u64) -> Signal {
        Signal {
            subject: subject("t"),
            payload: Bytes::from_static(b"ping"),
            expire_at_ms,
            ordering_group: None,
            correlation_id: corr,
        }
    }

    #[test]
    fn correlated_signal_is_acknowledged_once() {
        let mut endpoint = endpoint_with_topic("t", None);
        endpoint.set_signal_handler(Box::new(EchoHandler));
        let (reply_tx, reply_rx) = unbounded();

        let corr = CorrelationId::from_bytes([7u8; 16]);
        let actions = endpoint.handle(
            EndpointMsg::Signal {
                signal: signal(Some(corr), 10_000),
                reply: Some(reply_tx),
            },
            1_000,
        );
        assert_eq!(actions.len(), 1);
        let EndpointAction::ReplySignal { outcome, .. } = &actions[0] else {
            panic!("expected reply action");
        };
        assert!(outcome.ok);
        assert_eq!(outcome.ack.correlation_id, corr);
        assert_eq!(outcome.ack.payload, Some(Bytes::from_static(b"ping")));
        drop(reply_rx);
    }

    #[test]
    fn expired_signal_fails_without_invoking_the_handler() {
        struct PanicHandler;
        impl SignalHandler for PanicHandler {
            fn handle_signal(&mut self, _signal: &Signal) -> SignalDisposition {
                panic!("handler must not run for expired signals");
            }
        }

        let mut endpoint = endpoint_with_topic("t", None);
        endpoint.set_signal_handler(Box::new(PanicHandler));
        let (reply_tx, _reply_rx) = unbounded();

        let corr = CorrelationId::from_bytes([3u8; 16]);
        let actions = endpoint.handle(
            EndpointMsg::Signal {
                signal: signal(Some(corr), 500),
                reply: Some(reply_tx),
            },
            1_000,
        );
        let EndpointAction::ReplySignal { outcome, .. } = &actions[0] else {
            panic!("expected reply action");
        };
        assert!(!outcome.ok);
    }

    #[test]
    fn uncorrelated_signal_produces_no_reply() {
        let mut endpoint = endpoint_with_topic("t", None);
        endpoint.set_signal_handler(Box::new(EchoHandler));
        let (reply_tx, _reply_rx) = unbounded();

        let actions = endpoint.handle(
            EndpointMsg::Signal {
                signal: signal(None, 10_000),
                reply: Some(reply_tx),
            },
            1_000,
        );
        assert!(actions.is_empty());
    }

    #[test]
    fn close_all_drops_the_subscriber() {
        let mut endpoint = endpoint_with_topic("t", Some(StreamState::string("v1")));
        let agg = aggregator_ref(1);
        open(&mut endpoint, &agg, "t");
        grant(&mut endpoint, &agg, 5);

        endpoint.handle(
            EndpointMsg::Command {
                from: agg.clone(),
                command: StreamCommand::CloseAllLocalStreams,
            },
            0,
        );
        let actions = publish_string(&mut endpoint, "t", "v2");
        assert!(forwards(&actions).is_empty());
    }
}
