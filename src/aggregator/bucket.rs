//! Per-subscription coalescing buffer.

use crate::core::{StreamState, StreamUpdate, Subject};

use super::{Demand, DispatchSink};

/// Whether an incoming update was buffered or dropped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum AcceptOutcome {
    Buffered,
    /// The transition does not fit the projected state; the caller must
    /// schedule a snapshot refresh upstream.
    Inapplicable,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum PublishOutcome {
    Published,
    /// Coalescing dropped an intermediate delta and the buffered one no
    /// longer folds onto the cached state. Nothing was sent; the cache is
    /// cleared and the caller must schedule a snapshot refresh upstream.
    ChainBroken,
    Idle,
}

/// Holds the most recent unsent update for one subscription, plus the
/// folded state cache used to answer consumer resets locally.
///
/// Coalescing is by replacement: only the latest pending update survives.
#[derive(Debug)]
pub(crate) struct Bucket {
    subject: Subject,
    priority_key: Option<String>,
    aggregation_interval_ms: u64,
    state: Option<StreamState>,
    pending: Option<StreamUpdate>,
    last_published_at_ms: u64,
}

impl Bucket {
    pub(crate) fn new(
        subject: Subject,
        priority_key: Option<String>,
        aggregation_interval_ms: u64,
    ) -> Self {
        Self {
            subject,
            priority_key,
            aggregation_interval_ms,
            state: None,
            pending: None,
            last_published_at_ms: 0,
        }
    }

    pub(crate) fn subject(&self) -> &Subject {
        &self.subject
    }

    pub(crate) fn priority_key(&self) -> Option<&str> {
        self.priority_key.as_deref()
    }

    pub(crate) fn cached_state(&self) -> Option<&StreamState> {
        self.state.as_ref()
    }

    pub(crate) fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// The state a consumer that has received everything (including the
    /// pending update) would hold. Applicability of newly arriving
    /// transitions is judged against this, not the published cache, so a
    /// chained delta is not rejected merely because its predecessor is
    /// still buffered.
    fn projected_state(&self) -> Option<StreamState> {
        match &self.pending {
            Some(pending) => pending.apply(self.state.as_ref()),
            None => self.state.clone(),
        }
    }

    pub(crate) fn accept(&mut self, update: StreamUpdate) -> AcceptOutcome {
        let projected = self.projected_state();
        if !update.applicable_to(projected.as_ref()) {
            return AcceptOutcome::Inapplicable;
        }
        self.pending = Some(update);
        AcceptOutcome::Buffered
    }

    /// Buffers a snapshot of the cached state for re-delivery, answering a
    /// consumer-initiated reset. Returns false when no state is cached.
    pub(crate) fn buffer_reset_snapshot(&mut self) -> bool {
        match &self.state {
            Some(state) => {
                self.pending = Some(StreamUpdate::Snapshot(state.clone()));
                true
            }
            None => false,
        }
    }

    pub(crate) fn aggregation_criteria_met(&self, now_ms: u64) -> bool {
        self.aggregation_interval_ms < 1
            || now_ms.saturating_sub(self.last_published_at_ms) > self.aggregation_interval_ms
    }

    pub(crate) fn publish_pending(
        &mut self,
        now_ms: u64,
        demand: &mut Demand,
        sink: &mut DispatchSink,
    ) -> PublishOutcome {
        if demand.is_exhausted() || self.pending.is_none() || !self.aggregation_criteria_met(now_ms)
        {
            return PublishOutcome::Idle;
        }
        let Some(pending) = self.pending.take() else {
            return PublishOutcome::Idle;
        };
        match pending.apply(self.state.as_ref()) {
            Some(next) => {
                demand.take();
                self.state = Some(next);
                self.last_published_at_ms = now_ms;
                sink.deliveries.push((self.subject.clone(), pending));
                PublishOutcome::Published
            }
            None => {
                self.state = None;
                sink.resets.push(self.subject.clone());
                PublishOutcome::ChainBroken
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use bytes::Bytes;

    use crate::core::{
        ServiceKey, SetState, SetTransition, StreamState, StreamStateTransition, Subject, Tags,
        TopicKey,
    };

    use super::*;

    fn subject() -> Subject {
        Subject::new(
            ServiceKey::parse("svc").unwrap(),
            TopicKey::parse("topic").unwrap(),
            Tags::empty(),
        )
    }

    fn string_transition(value: &str) -> StreamUpdate {
        StreamUpdate::Transition(StreamStateTransition::String {
            value: value.into(),
        })
    }

    fn b(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    fn publish(bucket: &mut Bucket, now_ms: u64, demand: &mut Demand) -> (PublishOutcome, DispatchSink) {
        let mut sink = DispatchSink::default();
        let outcome = bucket.publish_pending(now_ms, demand, &mut sink);
        (outcome, sink)
    }

    #[test]
    fn latest_pending_wins() {
        let mut bucket = Bucket::new(subject(), None, 0);
        bucket.accept(string_transition("v1"));
        bucket.accept(string_transition("v2"));
        bucket.accept(string_transition("v3"));

        let mut demand = Demand::new(10);
        let (outcome, sink) = publish(&mut bucket, 1_000, &mut demand);
        assert_eq!(outcome, PublishOutcome::Published);
        assert_eq!(sink.deliveries.len(), 1);
        assert_eq!(sink.deliveries[0].1, string_transition("v3"));
        assert_eq!(demand.available(), 9);
        assert!(!bucket.has_pending());
    }

    #[test]
    fn zero_interval_publishes_every_update() {
        let mut bucket = Bucket::new(subject(), None, 0);
        let mut demand = Demand::new(10);
        for i in 0..3 {
            bucket.accept(string_transition(&format!("v{i}")));
            let (outcome, sink) = publish(&mut bucket, 1_000, &mut demand);
            assert_eq!(outcome, PublishOutcome::Published);
            assert_eq!(sink.deliveries.len(), 1);
        }
        assert_eq!(demand.available(), 7);
    }

    #[test]
    fn aggregation_interval_gates_publication() {
        let mut bucket = Bucket::new(subject(), None, 100);
        let mut demand = Demand::new(10);

        bucket.accept(string_transition("v1"));
        let (outcome, _) = publish(&mut bucket, 1_000, &mut demand);
        assert_eq!(outcome, PublishOutcome::Published);

        bucket.accept(string_transition("v2"));
        let (outcome, _) = publish(&mut bucket, 1_050, &mut demand);
        assert_eq!(outcome, PublishOutcome::Idle);
        assert!(bucket.has_pending());

        bucket.accept(string_transition("v3"));
        let (outcome, sink) = publish(&mut bucket, 1_101, &mut demand);
        assert_eq!(outcome, PublishOutcome::Published);
        assert_eq!(sink.deliveries[0].1, string_transition("v3"));
    }

    #[test]
    fn exhausted_demand_blocks_publication() {
        let mut bucket = Bucket::new(subject(), None, 0);
        bucket.accept(string_transition("v1"));
        let mut demand = Demand::new(0);
        let (outcome, sink) = publish(&mut bucket, 1_000, &mut demand);
        assert_eq!(outcome, PublishOutcome::Idle);
        assert!(sink.deliveries.is_empty());
        assert!(bucket.has_pending());
    }

    #[test]
    fn chained_set_deltas_are_accepted_while_pending() {
        let mut bucket = Bucket::new(subject(), None, 0);
        bucket.accept(StreamUpdate::Snapshot(StreamState::Set(SetState::new(
            3,
            [b("a")],
        ))));
        let mut demand = Demand::new(10);
        publish(&mut bucket, 1_000, &mut demand);

        // Base now v3; a delta to v4 sits pending while a chained delta to
        // v5 arrives. The projected state makes the second one applicable.
        let delta_4 = StreamUpdate::Transition(StreamStateTransition::Set(SetTransition::Delta {
            base_version: 3,
            added: [b("b")].into_iter().collect(),
            removed: BTreeSet::new(),
        }));
        let delta_5 = StreamUpdate::Transition(StreamStateTransition::Set(SetTransition::Delta {
            base_version: 4,
            added: [b("c")].into_iter().collect(),
            removed: BTreeSet::new(),
        }));
        assert_eq!(bucket.accept(delta_4), AcceptOutcome::Buffered);
        assert_eq!(bucket.accept(delta_5), AcceptOutcome::Buffered);

        // Coalescing replaced the v4 delta, so the buffered v5 delta no
        // longer folds onto the published v3 state.
        let (outcome, sink) = publish(&mut bucket, 1_001, &mut demand);
        assert_eq!(outcome, PublishOutcome::ChainBroken);
        assert!(sink.deliveries.is_empty());
        assert_eq!(sink.resets, vec![subject()]);
        assert_eq!(bucket.cached_state(), None);
    }

    #[test]
    fn stale_set_delta_is_inapplicable() {
        let mut bucket = Bucket::new(subject(), None, 0);
        bucket.accept(StreamUpdate::Snapshot(StreamState::Set(SetState::new(
            3,
            [b("a")],
        ))));
        let mut demand = Demand::new(10);
        publish(&mut bucket, 1_000, &mut demand);

        let stale = StreamUpdate::Transition(StreamStateTransition::Set(SetTransition::Delta {
            base_version: 5,
            added: BTreeSet::new(),
            removed: BTreeSet::new(),
        }));
        assert_eq!(bucket.accept(stale), AcceptOutcome::Inapplicable);
        assert!(!bucket.has_pending());
    }

    #[test]
    fn reset_snapshot_rebuffers_cached_state() {
        let mut bucket = Bucket::new(subject(), None, 0);
        let mut demand = Demand::new(10);
        bucket.accept(string_transition("v1"));
        publish(&mut bucket, 1_000, &mut demand);

        assert!(bucket.buffer_reset_snapshot());
        let (outcome, sink) = publish(&mut bucket, 1_001, &mut demand);
        assert_eq!(outcome, PublishOutcome::Published);
        assert_eq!(
            sink.deliveries[0].1,
            StreamUpdate::Snapshot(StreamState::string("v1"))
        );
    }

    #[test]
    fn reset_without_cache_reports_miss() {
        let mut bucket = Bucket::new(subject(), None, 0);
        assert!(!bucket.buffer_reset_snapshot());
    }
}
