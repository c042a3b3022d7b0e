//! Consumer-facing stream aggregator: one per consumer connection.
//!
//! The aggregator is a mailbox state machine in the style of the rest of
//! the crate: `handle` runs one input to completion and returns the
//! side effects for the runtime to perform. Downstream deliveries debit
//! exactly one demand token each; endpoint commands are free.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;

use crossbeam::channel::Sender;

use crate::core::{Limits, ServiceKey, StreamUpdate, Subject};
use crate::endpoint::{EndpointRef, StreamCommand};

mod bucket;
mod group;
mod runtime;

use bucket::{AcceptOutcome, Bucket};
use group::{PriorityBucketGroup, priority_order};

pub use runtime::{AggregatorHandle, spawn_aggregator};

/// Address of an aggregator mailbox, handed to endpoints so they can push
/// updates back. Compared by id; the channel is runtime plumbing.
#[derive(Clone)]
pub struct AggregatorRef {
    id: u64,
    tx: Sender<AggregatorMsg>,
}

impl AggregatorRef {
    pub fn new(id: u64, tx: Sender<AggregatorMsg>) -> Self {
        Self { id, tx }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn send(&self, msg: AggregatorMsg) -> bool {
        self.tx.send(msg).is_ok()
    }
}

impl fmt::Debug for AggregatorRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AggregatorRef({})", self.id)
    }
}

impl PartialEq for AggregatorRef {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for AggregatorRef {}

/// Inputs accepted by the aggregator mailbox.
#[derive(Clone, Debug)]
pub enum AggregatorMsg {
    /// Consumer opens a subscription (subject-level; aliases stay at the
    /// connection boundary).
    Open {
        subject: Subject,
        priority_key: Option<String>,
        aggregation_interval_ms: u64,
    },
    /// Consumer closes a subscription.
    Close { subject: Subject },
    /// Consumer requests a full snapshot refresh.
    Reset { subject: Subject },
    /// Downstream demand tokens from the consumer connection.
    Demand { tokens: u64 },
    /// An update pushed by a producer endpoint.
    Update {
        from_endpoint: u64,
        subject: Subject,
        update: StreamUpdate,
    },
    /// The producer closed the stream.
    StreamClosed { subject: Subject },
    /// The producer rejected the subject.
    Rejected { subject: Subject },
    /// The location registry rebound (or unbound) a service.
    LocationChanged {
        service: ServiceKey,
        endpoint: Option<EndpointRef>,
    },
    /// Periodic dispatch tick.
    SendPending,
}

/// A message bound for the downstream consumer. One demand token has
/// already been debited when the action is emitted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConsumerEvent {
    Update {
        subject: Subject,
        update: StreamUpdate,
    },
    SubscriptionClosed { subject: Subject },
    ServiceNotAvailable { service: ServiceKey },
    InvalidRequest { subject: Subject },
}

/// Side effects of one handled input, performed by the runtime.
#[derive(Clone, Debug)]
pub enum AggregatorAction {
    Deliver(ConsumerEvent),
    Command {
        endpoint: EndpointRef,
        command: StreamCommand,
    },
}

/// Unfulfilled downstream tokens. Emission takes exactly one; the counter
/// cannot go negative.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct Demand(u64);

impl Demand {
    pub(crate) fn new(tokens: u64) -> Self {
        Self(tokens)
    }

    pub(crate) fn add(&mut self, tokens: u64) {
        self.0 = self.0.saturating_add(tokens);
    }

    pub(crate) fn take(&mut self) -> bool {
        if self.0 == 0 {
            return false;
        }
        self.0 -= 1;
        true
    }

    pub(crate) fn available(&self) -> u64 {
        self.0
    }

    pub(crate) fn is_exhausted(&self) -> bool {
        self.0 == 0
    }
}

/// Collects bucket emissions during one dispatch pass.
#[derive(Debug, Default)]
pub(crate) struct DispatchSink {
    pub(crate) deliveries: Vec<(Subject, StreamUpdate)>,
    pub(crate) resets: Vec<Subject>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum ControlMessage {
    ServiceNotAvailable(ServiceKey),
    InvalidRequest(Subject),
    SubscriptionClosed(Subject),
}

impl ControlMessage {
    fn into_consumer_event(self) -> ConsumerEvent {
        match self {
            ControlMessage::ServiceNotAvailable(service) => {
                ConsumerEvent::ServiceNotAvailable { service }
            }
            ControlMessage::InvalidRequest(subject) => ConsumerEvent::InvalidRequest { subject },
            ControlMessage::SubscriptionClosed(subject) => {
                ConsumerEvent::SubscriptionClosed { subject }
            }
        }
    }
}

pub struct StreamAggregator {
    limits: Limits,
    /// Subject -> priority key of the group owning its bucket.
    subscriptions: BTreeMap<Subject, Option<String>>,
    /// Sorted by the priority comparator; `None` last.
    groups: Vec<PriorityBucketGroup>,
    group_cursor: usize,
    service_locations: BTreeMap<ServiceKey, EndpointRef>,
    pending_control: VecDeque<ControlMessage>,
    demand: Demand,
    /// Outstanding upstream token window per endpoint id.
    upstream_windows: BTreeMap<u64, u64>,
}

impl StreamAggregator {
    pub fn new(limits: Limits) -> Self {
        Self {
            limits,
            subscriptions: BTreeMap::new(),
            groups: Vec::new(),
            group_cursor: 0,
            service_locations: BTreeMap::new(),
            pending_control: VecDeque::new(),
            demand: Demand::default(),
            upstream_windows: BTreeMap::new(),
        }
    }

    pub fn handle(&mut self, msg: AggregatorMsg, now_ms: u64) -> Vec<AggregatorAction> {
        let mut actions = Vec::new();
        match msg {
            AggregatorMsg::Open {
                subject,
                priority_key,
                aggregation_interval_ms,
            } => self.handle_open(subject, priority_key, aggregation_interval_ms, &mut actions),
            AggregatorMsg::Close { subject } => {
                self.close_subscription(&subject, true, &mut actions);
            }
            AggregatorMsg::Reset { subject } => self.handle_reset(&subject, &mut actions),
            AggregatorMsg::Demand { tokens } => self.demand.add(tokens),
            AggregatorMsg::Update {
                from_endpoint,
                subject,
                update,
            } => self.handle_update(from_endpoint, &subject, update, &mut actions),
            AggregatorMsg::StreamClosed { subject } => {
                self.close_subscription(&subject, false, &mut actions);
            }
            AggregatorMsg::Rejected { subject } => {
                if self.subscriptions.contains_key(&subject) {
                    self.enqueue_control(ControlMessage::InvalidRequest(subject));
                }
            }
            AggregatorMsg::LocationChanged { service, endpoint } => {
                self.handle_location_changed(service, endpoint, &mut actions);
            }
            AggregatorMsg::SendPending => self.refresh_upstream_windows(&mut actions),
        }
        self.publish_pending(now_ms, &mut actions);
        actions
    }

    /// Closes every upstream binding; the runtime invokes this once when
    /// the consumer connection goes away.
    pub fn shutdown(&mut self) -> Vec<AggregatorAction> {
        let mut actions = Vec::new();
        let mut seen = BTreeSet::new();
        for endpoint in self.service_locations.values() {
            if seen.insert(endpoint.id()) {
                actions.push(AggregatorAction::Command {
                    endpoint: endpoint.clone(),
                    command: StreamCommand::CloseAllLocalStreams,
                });
            }
        }
        self.upstream_windows.clear();
        actions
    }

    fn handle_open(
        &mut self,
        subject: Subject,
        priority_key: Option<String>,
        aggregation_interval_ms: u64,
        actions: &mut Vec<AggregatorAction>,
    ) {
        if self.subscriptions.contains_key(&subject) {
            self.close_subscription(&subject, true, actions);
        }

        let bucket = Bucket::new(subject.clone(), priority_key.clone(), aggregation_interval_ms);
        self.subscriptions
            .insert(subject.clone(), priority_key.clone());
        self.group_for(priority_key).add(bucket);
        self.sort_groups();

        match self.service_locations.get(&subject.service).cloned() {
            Some(endpoint) => {
                *self.upstream_windows.entry(endpoint.id()).or_insert(0) += 1;
                actions.push(AggregatorAction::Command {
                    endpoint: endpoint.clone(),
                    command: StreamCommand::OpenLocalStreamFor(subject),
                });
                actions.push(AggregatorAction::Command {
                    endpoint,
                    command: StreamCommand::GrantDemand(1),
                });
            }
            None => {
                self.enqueue_control(ControlMessage::ServiceNotAvailable(
                    subject.service.clone(),
                ));
            }
        }
    }

    fn close_subscription(
        &mut self,
        subject: &Subject,
        notify_producer: bool,
        actions: &mut Vec<AggregatorAction>,
    ) {
        let Some(priority_key) = self.subscriptions.remove(subject) else {
            return;
        };
        if let Some(at) = self
            .groups
            .iter()
            .position(|g| g.priority_key() == priority_key.as_deref())
        {
            self.groups[at].remove(subject);
            if self.groups[at].is_empty() {
                self.groups.remove(at);
            }
            self.sort_groups();
        }
        if notify_producer
            && let Some(endpoint) = self.service_locations.get(&subject.service)
        {
            actions.push(AggregatorAction::Command {
                endpoint: endpoint.clone(),
                command: StreamCommand::CloseLocalStreamFor(subject.clone()),
            });
        }
        self.enqueue_control(ControlMessage::SubscriptionClosed(subject.clone()));
    }

    fn handle_reset(&mut self, subject: &Subject, actions: &mut Vec<AggregatorAction>) {
        let Some(bucket) = self.bucket_mut(subject) else {
            return;
        };
        if bucket.buffer_reset_snapshot() {
            return;
        }
        // Cache is cold; only the producer can supply the snapshot.
        if let Some(endpoint) = self.service_locations.get(&subject.service) {
            actions.push(AggregatorAction::Command {
                endpoint: endpoint.clone(),
                command: StreamCommand::ResetLocalStreamFor(subject.clone()),
            });
        }
    }

    fn handle_update(
        &mut self,
        from_endpoint: u64,
        subject: &Subject,
        update: StreamUpdate,
        actions: &mut Vec<AggregatorAction>,
    ) {
        let Some(endpoint) = self.service_locations.get(&subject.service).cloned() else {
            tracing::debug!(subject = %subject, "dropping update from unbound service");
            return;
        };
        if endpoint.id() != from_endpoint {
            tracing::debug!(
                subject = %subject,
                from_endpoint,
                "dropping update from superseded binding"
            );
            return;
        }
        actions.push(AggregatorAction::Command {
            endpoint: endpoint.clone(),
            command: StreamCommand::GrantDemand(1),
        });
        let Some(bucket) = self.bucket_mut(subject) else {
            return;
        };
        if bucket.accept(update) == AcceptOutcome::Inapplicable {
            tracing::debug!(subject = %subject, "transition inapplicable, requesting snapshot");
            actions.push(AggregatorAction::Command {
                endpoint,
                command: StreamCommand::ResetLocalStreamFor(subject.clone()),
            });
        }
    }

    fn handle_location_changed(
        &mut self,
        service: ServiceKey,
        endpoint: Option<EndpointRef>,
        actions: &mut Vec<AggregatorAction>,
    ) {
        if let Some(old) = self.service_locations.remove(&service) {
            if endpoint.as_ref().is_some_and(|new| *new == old) {
                self.service_locations.insert(service, old);
                return;
            }
            self.upstream_windows.remove(&old.id());
            actions.push(AggregatorAction::Command {
                endpoint: old,
                command: StreamCommand::CloseAllLocalStreams,
            });
        }

        let subjects: Vec<Subject> = self
            .subscriptions
            .keys()
            .filter(|s| s.service == service)
            .cloned()
            .collect();

        match endpoint {
            Some(endpoint) => {
                self.service_locations.insert(service.clone(), endpoint.clone());
                self.pending_control.retain(|control| {
                    !matches!(control, ControlMessage::ServiceNotAvailable(s) if *s == service)
                });
                if !subjects.is_empty() {
                    let window = subjects.len() as u64;
                    *self.upstream_windows.entry(endpoint.id()).or_insert(0) += window;
                    actions.push(AggregatorAction::Command {
                        endpoint: endpoint.clone(),
                        command: StreamCommand::OpenLocalStreamsForAll(subjects),
                    });
                    actions.push(AggregatorAction::Command {
                        endpoint,
                        command: StreamCommand::GrantDemand(window),
                    });
                }
            }
            None => {
                if !subjects.is_empty() {
                    self.enqueue_control(ControlMessage::ServiceNotAvailable(service));
                }
            }
        }
    }

    /// Tops upstream windows back up to one token per open bucket. Windows
    /// only grow here; consumed tokens are replaced one-for-one on update
    /// arrival, so the steady-state window equals the bucket count.
    fn refresh_upstream_windows(&mut self, actions: &mut Vec<AggregatorAction>) {
        let mut desired: BTreeMap<u64, (EndpointRef, u64)> = BTreeMap::new();
        for (service, endpoint) in &self.service_locations {
            let count = self
                .subscriptions
                .keys()
                .filter(|s| s.service == *service)
                .count() as u64;
            let entry = desired
                .entry(endpoint.id())
                .or_insert_with(|| (endpoint.clone(), 0));
            entry.1 += count;
        }
        for (id, (endpoint, want)) in desired {
            let window = self.upstream_windows.entry(id).or_insert(0);
            if want > *window {
                let grant = want - *window;
                *window = want;
                actions.push(AggregatorAction::Command {
                    endpoint,
                    command: StreamCommand::GrantDemand(grant),
                });
            } else {
                *window = want;
            }
        }
    }

    /// The dispatch loop: drains pending control messages FIFO, then makes
    /// exactly one attempt per priority group, highest priority first from
    /// the surviving cursor.
    fn publish_pending(&mut self, now_ms: u64, actions: &mut Vec<AggregatorAction>) {
        while !self.demand.is_exhausted() {
            let Some(control) = self.pending_control.pop_front() else {
                break;
            };
            self.demand.take();
            actions.push(AggregatorAction::Deliver(control.into_consumer_event()));
        }

        if self.groups.is_empty() {
            return;
        }
        let mut sink = DispatchSink::default();
        for _ in 0..self.groups.len() {
            if self.demand.is_exhausted() {
                break;
            }
            if self.group_cursor >= self.groups.len() {
                self.group_cursor = 0;
            }
            let cursor = self.group_cursor;
            self.groups[cursor].publish_pending(now_ms, &mut self.demand, &mut sink);
            self.group_cursor += 1;
        }

        for (subject, update) in sink.deliveries {
            actions.push(AggregatorAction::Deliver(ConsumerEvent::Update {
                subject,
                update,
            }));
        }
        for subject in sink.resets {
            if let Some(endpoint) = self.service_locations.get(&subject.service) {
                actions.push(AggregatorAction::Command {
                    endpoint: endpoint.clone(),
                    command: StreamCommand::ResetLocalStreamFor(subject),
                });
            }
        }
    }

    fn group_for(&mut self, priority_key: Option<String>) -> &mut PriorityBucketGroup {
        if let Some(at) = self
            .groups
            .iter()
            .position(|g| g.priority_key() == priority_key.as_deref())
        {
            return &mut self.groups[at];
        }
        self.groups.push(PriorityBucketGroup::new(priority_key));
        let last = self.groups.len() - 1;
        &mut self.groups[last]
    }

    fn sort_groups(&mut self) {
        self.groups
            .sort_by(|a, b| priority_order(a.priority_key(), b.priority_key()));
    }

    fn bucket_mut(&mut self, subject: &Subject) -> Option<&mut Bucket> {
        let priority_key = self.subscriptions.get(subject)?.clone();
        self.groups
            .iter_mut()
            .find(|g| g.priority_key() == priority_key.as_deref())?
            .bucket_mut(subject)
    }

    fn enqueue_control(&mut self, control: ControlMessage) {
        if let ControlMessage::ServiceNotAvailable(service) = &control
            && self.pending_control.iter().any(|queued| {
                matches!(queued, ControlMessage::ServiceNotAvailable(s) if s == service)
            })
        {
            return;
        }
        if self.pending_control.len() >= self.limits.max_pending_control {
            tracing::warn!(?control, "pending control queue full, dropping message");
            return;
        }
        self.pending_control.push_back(control);
    }
}
