//! Endpoint actor runtime and the in-process publisher surface.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};

use crate::aggregator::AggregatorMsg;
use crate::clock;
use crate::core::{
    Limits, ServiceKey, StreamState, StreamStateTransition, StreamUpdate, Tags, TopicKey,
};

use super::{EndpointAction, EndpointMsg, EndpointRef, SignalHandler, StreamEndpoint};

const MAILBOX_POLL: Duration = Duration::from_millis(50);

/// Cloneable handle a service uses to publish into one of its topics.
#[derive(Clone)]
pub struct TopicPublisher {
    topic: TopicKey,
    tags: Tags,
    tx: Sender<EndpointMsg>,
}

impl TopicPublisher {
    /// Publishes a full snapshot. Returns false once the endpoint is gone.
    pub fn snapshot(&self, state: StreamState) -> bool {
        self.tx
            .send(EndpointMsg::Publish {
                topic: self.topic.clone(),
                tags: self.tags.clone(),
                update: StreamUpdate::Snapshot(state),
            })
            .is_ok()
    }

    /// Publishes a delta. Returns false once the endpoint is gone.
    pub fn transition(&self, transition: StreamStateTransition) -> bool {
        self.tx
            .send(EndpointMsg::Publish {
                topic: self.topic.clone(),
                tags: self.tags.clone(),
                update: StreamUpdate::Transition(transition),
            })
            .is_ok()
    }

    /// Withdraws the topic; open consumer streams observe a close.
    pub fn retire(self) -> bool {
        self.tx
            .send(EndpointMsg::RetireTopic {
                topic: self.topic,
                tags: self.tags,
            })
            .is_ok()
    }
}

pub struct EndpointHandle {
    endpoint_ref: EndpointRef,
    tx: Sender<EndpointMsg>,
    shutdown: Arc<AtomicBool>,
    join: JoinHandle<()>,
}

impl EndpointHandle {
    pub fn endpoint_ref(&self) -> EndpointRef {
        self.endpoint_ref.clone()
    }

    /// Registers a topic and returns its publisher handle.
    pub fn register_topic(
        &self,
        topic: TopicKey,
        tags: Tags,
        partial_updates: bool,
        initial: Option<StreamState>,
    ) -> TopicPublisher {
        let _ = self.tx.send(EndpointMsg::RegisterTopic {
            topic: topic.clone(),
            tags: tags.clone(),
            partial_updates,
            initial,
        });
        TopicPublisher {
            topic,
            tags,
            tx: self.tx.clone(),
        }
    }

    pub fn shutdown(self) {
        self.shutdown.store(true, Ordering::Relaxed);
        let _ = self.join.join();
    }
}

/// Starts the per-service endpoint unit on its own thread.
pub fn spawn_endpoint(
    id: u64,
    service: ServiceKey,
    limits: Limits,
    signal_handler: Option<Box<dyn SignalHandler>>,
) -> EndpointHandle {
    let (tx, rx) = channel::unbounded();
    let shutdown = Arc::new(AtomicBool::new(false));
    let endpoint_ref = EndpointRef::new(id, tx.clone());

    let mut endpoint = StreamEndpoint::new(service.clone(), limits);
    if let Some(handler) = signal_handler {
        endpoint.set_signal_handler(handler);
    }

    let flag = Arc::clone(&shutdown);
    let join = thread::spawn(move || {
        tracing::debug!(endpoint = id, service = %service, "endpoint unit started");
        run_mailbox(endpoint, id, rx, flag);
        tracing::debug!(endpoint = id, "endpoint unit stopped");
    });

    EndpointHandle {
        endpoint_ref,
        tx,
        shutdown,
        join,
    }
}

fn run_mailbox(
    mut endpoint: StreamEndpoint,
    id: u64,
    rx: Receiver<EndpointMsg>,
    shutdown: Arc<AtomicBool>,
) {
    while !shutdown.load(Ordering::Relaxed) {
        match rx.recv_timeout(MAILBOX_POLL) {
            Ok(msg) => {
                let actions = endpoint.handle(msg, clock::now_ms());
                apply_actions(id, actions);
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

fn apply_actions(id: u64, actions: Vec<EndpointAction>) {
    for action in actions {
        match action {
            EndpointAction::Forward {
                subscriber,
                subject,
                update,
            } => {
                subscriber.send(AggregatorMsg::Update {
                    from_endpoint: id,
                    subject,
                    update,
                });
            }
            EndpointAction::StreamClosed {
                subscriber,
                subject,
            } => {
                subscriber.send(AggregatorMsg::StreamClosed { subject });
            }
            EndpointAction::StreamRejected {
                subscriber,
                subject,
            } => {
                subscriber.send(AggregatorMsg::Rejected { subject });
            }
            EndpointAction::ReplySignal { reply, outcome } => {
                let _ = reply.send(outcome);
            }
        }
    }
}
