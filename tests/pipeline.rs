//! End-to-end dispatch: endpoint unit -> aggregator unit -> consumer.

use std::time::Duration;

use bytes::Bytes;
use crossbeam::channel::{Receiver, unbounded};

use rivulet::aggregator::{AggregatorHandle, AggregatorMsg, ConsumerEvent, spawn_aggregator};
use rivulet::binding::LocationRegistry;
use rivulet::endpoint::{
    EndpointHandle, EndpointMsg, SignalDisposition, SignalHandler, SignalReply, spawn_endpoint,
};
use rivulet::proto::Signal;
use rivulet::{
    CorrelationId, Limits, ServiceKey, StreamState, StreamStateTransition, StreamUpdate, Subject,
    Tags, TopicKey,
};

const RECV_TIMEOUT: Duration = Duration::from_secs(5);
const TICK: Duration = Duration::from_millis(200);

struct Fixture {
    registry: LocationRegistry,
    aggregator: AggregatorHandle,
    consumer_rx: Receiver<ConsumerEvent>,
}

impl Fixture {
    fn new() -> Self {
        let limits = Limits::default();
        let registry = LocationRegistry::new(limits.clone());
        let (consumer_tx, consumer_rx) = unbounded();
        let aggregator = spawn_aggregator(100, limits, TICK, consumer_tx);
        registry
            .subscribe(aggregator.aggregator_ref())
            .expect("subscribe aggregator");
        Self {
            registry,
            aggregator,
            consumer_rx,
        }
    }

    fn open(&self, subject: Subject, aggregation_interval_ms: u64) {
        self.aggregator.aggregator_ref().send(AggregatorMsg::Open {
            subject,
            priority_key: None,
            aggregation_interval_ms,
        });
    }

    fn grant_demand(&self, tokens: u64) {
        self.aggregator
            .aggregator_ref()
            .send(AggregatorMsg::Demand { tokens });
    }

    fn next_event(&self) -> ConsumerEvent {
        self.consumer_rx
            .recv_timeout(RECV_TIMEOUT)
            .expect("consumer event")
    }
}

fn service() -> ServiceKey {
    ServiceKey::parse("market-data").unwrap()
}

fn topic() -> TopicKey {
    TopicKey::parse("quotes").unwrap()
}

fn subject() -> Subject {
    Subject::new(service(), topic(), Tags::empty())
}

fn spawn_producer(id: u64, initial: &str) -> (EndpointHandle, rivulet::endpoint::TopicPublisher) {
    let endpoint = spawn_endpoint(id, service(), Limits::default(), None);
    let publisher = endpoint.register_topic(
        topic(),
        Tags::empty(),
        true,
        Some(StreamState::string(initial)),
    );
    (endpoint, publisher)
}

fn update_value(event: &ConsumerEvent) -> String {
    match event {
        ConsumerEvent::Update {
            update: StreamUpdate::Snapshot(StreamState::String(s)),
            ..
        } => s.value.clone(),
        ConsumerEvent::Update {
            update: StreamUpdate::Transition(StreamStateTransition::String { value }),
            ..
        } => value.clone(),
        other => panic!("expected a string update, got {other:?}"),
    }
}

#[test]
fn snapshot_then_transitions_flow_in_order() {
    let fixture = Fixture::new();
    let (endpoint, publisher) = spawn_producer(1, "v1");
    fixture
        .registry
        .bind(service(), endpoint.endpoint_ref())
        .unwrap();

    fixture.grant_demand(10);
    fixture.open(subject(), 0);

    // First attach delivers the current state as a snapshot.
    assert_eq!(update_value(&fixture.next_event()), "v1");

    publisher.transition(StreamStateTransition::String { value: "v2".into() });
    publisher.transition(StreamStateTransition::String { value: "v3".into() });
    assert_eq!(update_value(&fixture.next_event()), "v2");
    assert_eq!(update_value(&fixture.next_event()), "v3");

    fixture.aggregator.shutdown();
    endpoint.shutdown();
}

#[test]
fn aggregation_interval_coalesces_a_burst() {
    let fixture = Fixture::new();
    let (endpoint, publisher) = spawn_producer(1, "v0");
    fixture
        .registry
        .bind(service(), endpoint.endpoint_ref())
        .unwrap();

    fixture.grant_demand(50);
    fixture.open(subject(), 800);

    // Attach snapshot opens the aggregation window.
    assert_eq!(update_value(&fixture.next_event()), "v0");

    for i in 1..=5 {
        publisher.transition(StreamStateTransition::String {
            value: format!("v{i}"),
        });
    }

    // The burst lands well inside the interval: exactly one more update
    // arrives, carrying the latest value, once the window expires.
    let event = fixture.next_event();
    assert_eq!(update_value(&event), "v5");
    assert!(
        fixture
            .consumer_rx
            .recv_timeout(Duration::from_millis(400))
            .is_err(),
        "no further updates expected after the coalesced flush"
    );

    fixture.aggregator.shutdown();
    endpoint.shutdown();
}

#[test]
fn closing_a_subscription_stops_the_stream() {
    let fixture = Fixture::new();
    let (endpoint, publisher) = spawn_producer(1, "v1");
    fixture
        .registry
        .bind(service(), endpoint.endpoint_ref())
        .unwrap();

    fixture.grant_demand(10);
    fixture.open(subject(), 0);
    assert_eq!(update_value(&fixture.next_event()), "v1");

    fixture
        .aggregator
        .aggregator_ref()
        .send(AggregatorMsg::Close { subject: subject() });
    assert!(matches!(
        fixture.next_event(),
        ConsumerEvent::SubscriptionClosed { subject: s } if s == subject()
    ));

    // Later publishes no longer reach the consumer.
    publisher.transition(StreamStateTransition::String { value: "v2".into() });
    assert!(
        fixture
            .consumer_rx
            .recv_timeout(Duration::from_millis(400))
            .is_err()
    );

    fixture.aggregator.shutdown();
    endpoint.shutdown();
}

struct EchoHandler;

impl SignalHandler for EchoHandler {
    fn handle_signal(&mut self, signal: &Signal) -> SignalDisposition {
        SignalDisposition::Ack(Some(signal.payload.clone()))
    }
}

#[test]
fn correlated_signal_round_trips_an_ack() {
    let endpoint = spawn_endpoint(7, service(), Limits::default(), Some(Box::new(EchoHandler)));
    endpoint.register_topic(topic(), Tags::empty(), true, None);

    let (reply_tx, reply_rx) = unbounded::<SignalReply>();
    let correlation_id = CorrelationId::generate();
    endpoint.endpoint_ref().send(EndpointMsg::Signal {
        signal: Signal {
            subject: subject(),
            payload: Bytes::from_static(b"refresh"),
            expire_at_ms: u64::MAX,
            ordering_group: None,
            correlation_id: Some(correlation_id),
        },
        reply: Some(reply_tx),
    });

    let reply = reply_rx.recv_timeout(RECV_TIMEOUT).expect("signal ack");
    assert!(reply.ok);
    assert_eq!(reply.ack.correlation_id, correlation_id);
    assert_eq!(reply.ack.payload, Some(Bytes::from_static(b"refresh")));

    endpoint.shutdown();
}
