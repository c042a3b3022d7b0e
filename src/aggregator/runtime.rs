//! Aggregator actor runtime: mailbox thread plus the dispatch tick.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Sender};

use crate::clock;
use crate::core::Limits;
use crate::endpoint::EndpointMsg;

use super::{
    AggregatorAction, AggregatorMsg, AggregatorRef, ConsumerEvent, StreamAggregator,
};

pub struct AggregatorHandle {
    aggregator_ref: AggregatorRef,
    shutdown: Arc<AtomicBool>,
    join: JoinHandle<()>,
}

impl AggregatorHandle {
    pub fn aggregator_ref(&self) -> AggregatorRef {
        self.aggregator_ref.clone()
    }

    /// Stops the unit. Bound endpoints observe `CloseAllLocalStreams`.
    pub fn shutdown(self) {
        self.shutdown.store(true, Ordering::Relaxed);
        let _ = self.join.join();
    }
}

/// Starts one aggregator unit for a consumer connection. Deliveries land
/// on `consumer_tx`; when the consumer side hangs up the unit shuts down
/// and closes every upstream binding.
pub fn spawn_aggregator(
    id: u64,
    limits: Limits,
    tick_interval: Duration,
    consumer_tx: Sender<ConsumerEvent>,
) -> AggregatorHandle {
    let (tx, rx) = channel::unbounded();
    let shutdown = Arc::new(AtomicBool::new(false));
    let aggregator_ref = AggregatorRef::new(id, tx);

    let self_ref = aggregator_ref.clone();
    let flag = Arc::clone(&shutdown);
    let join = thread::spawn(move || {
        tracing::debug!(aggregator = id, "aggregator unit started");
        let mut aggregator = StreamAggregator::new(limits);
        let ticker = channel::tick(tick_interval);

        while !flag.load(Ordering::Relaxed) {
            let actions = crossbeam::select! {
                recv(rx) -> msg => match msg {
                    Ok(msg) => aggregator.handle(msg, clock::now_ms()),
                    Err(_) => break,
                },
                recv(ticker) -> _ => aggregator.handle(AggregatorMsg::SendPending, clock::now_ms()),
            };
            if !apply_actions(&self_ref, &consumer_tx, actions) {
                // Consumer hung up; tear down upstream state.
                break;
            }
        }

        let actions = aggregator.shutdown();
        apply_actions(&self_ref, &consumer_tx, actions);
        tracing::debug!(aggregator = id, "aggregator unit stopped");
    });

    AggregatorHandle {
        aggregator_ref,
        shutdown,
        join,
    }
}

/// Performs the actions. Returns false when the consumer is gone.
fn apply_actions(
    self_ref: &AggregatorRef,
    consumer_tx: &Sender<ConsumerEvent>,
    actions: Vec<AggregatorAction>,
) -> bool {
    for action in actions {
        match action {
            AggregatorAction::Deliver(event) => {
                if consumer_tx.send(event).is_err() {
                    return false;
                }
            }
            AggregatorAction::Command { endpoint, command } => {
                if !endpoint.send(EndpointMsg::Command {
                    from: self_ref.clone(),
                    command,
                }) {
                    tracing::debug!(endpoint = endpoint.id(), "endpoint mailbox gone");
                }
            }
        }
    }
    true
}
