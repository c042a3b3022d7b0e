//! Buckets sharing one priority key, round-robined fairly.

use std::cmp::Ordering;

use crate::core::Subject;

use super::bucket::{Bucket, PublishOutcome};
use super::{Demand, DispatchSink};

/// Sorts `None` (the un-keyed default group) after every `Some`; keyed
/// groups order lexicographically, smaller string = higher priority.
pub(crate) fn priority_order(a: Option<&str>, b: Option<&str>) -> Ordering {
    match (a, b) {
        (Some(x), Some(y)) => x.cmp(y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

#[derive(Debug)]
pub(crate) struct PriorityBucketGroup {
    priority_key: Option<String>,
    buckets: Vec<Bucket>,
    rr_index: usize,
}

impl PriorityBucketGroup {
    pub(crate) fn new(priority_key: Option<String>) -> Self {
        Self {
            priority_key,
            buckets: Vec::new(),
            rr_index: 0,
        }
    }

    pub(crate) fn priority_key(&self) -> Option<&str> {
        self.priority_key.as_deref()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.buckets.len()
    }

    pub(crate) fn add(&mut self, bucket: Bucket) {
        self.buckets.push(bucket);
    }

    pub(crate) fn remove(&mut self, subject: &Subject) -> Option<Bucket> {
        let at = self.buckets.iter().position(|b| b.subject() == subject)?;
        let bucket = self.buckets.remove(at);
        // Keep the cursor pointing at the same successor bucket.
        if at < self.rr_index {
            self.rr_index -= 1;
        }
        Some(bucket)
    }

    pub(crate) fn bucket_mut(&mut self, subject: &Subject) -> Option<&mut Bucket> {
        self.buckets.iter_mut().find(|b| b.subject() == subject)
    }

    /// One dispatch attempt for this group: scans from the cursor for a
    /// bucket that can emit, stopping after the first emission so sibling
    /// groups interleave. The cursor survives across calls; fairness is
    /// across calls, not within one.
    pub(crate) fn publish_pending(
        &mut self,
        now_ms: u64,
        demand: &mut Demand,
        sink: &mut DispatchSink,
    ) {
        for _ in 0..self.buckets.len() {
            if demand.is_exhausted() {
                return;
            }
            if self.rr_index >= self.buckets.len() {
                self.rr_index = 0;
            }
            let outcome = self.buckets[self.rr_index].publish_pending(now_ms, demand, sink);
            self.rr_index += 1;
            if outcome == PublishOutcome::Published {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::core::{ServiceKey, StreamStateTransition, StreamUpdate, Subject, Tags, TopicKey};

    use super::*;

    fn subject(topic: &str) -> Subject {
        Subject::new(
            ServiceKey::parse("svc").unwrap(),
            TopicKey::parse(topic).unwrap(),
            Tags::empty(),
        )
    }

    fn pending_bucket(topic: &str) -> Bucket {
        let mut bucket = Bucket::new(subject(topic), None, 0);
        bucket.accept(StreamUpdate::Transition(StreamStateTransition::String {
            value: format!("{topic}-value"),
        }));
        bucket
    }

    #[test]
    fn none_sorts_after_every_some() {
        assert_eq!(
            priority_order(Some("A"), Some("B")),
            Ordering::Less
        );
        assert_eq!(priority_order(Some("Z"), None), Ordering::Less);
        assert_eq!(priority_order(None, Some("A")), Ordering::Greater);
        assert_eq!(priority_order(None, None), Ordering::Equal);
    }

    #[test]
    fn emits_at_most_one_per_attempt_and_rotates() {
        let mut group = PriorityBucketGroup::new(Some("A".into()));
        group.add(pending_bucket("t0"));
        group.add(pending_bucket("t1"));

        let mut demand = Demand::new(10);
        let mut sink = DispatchSink::default();
        group.publish_pending(1_000, &mut demand, &mut sink);
        group.publish_pending(1_000, &mut demand, &mut sink);

        let topics: Vec<_> = sink
            .deliveries
            .iter()
            .map(|(s, _)| s.topic.as_str().to_string())
            .collect();
        assert_eq!(topics, vec!["t0", "t1"]);
        assert_eq!(demand.available(), 8);
    }

    #[test]
    fn skips_idle_buckets_within_one_attempt() {
        let mut group = PriorityBucketGroup::new(None);
        group.add(Bucket::new(subject("idle"), None, 0));
        group.add(pending_bucket("busy"));

        let mut demand = Demand::new(10);
        let mut sink = DispatchSink::default();
        group.publish_pending(1_000, &mut demand, &mut sink);
        assert_eq!(sink.deliveries.len(), 1);
        assert_eq!(sink.deliveries[0].0.topic.as_str(), "busy");
    }

    #[test]
    fn stops_when_demand_is_exhausted() {
        let mut group = PriorityBucketGroup::new(None);
        group.add(pending_bucket("t0"));
        let mut demand = Demand::new(0);
        let mut sink = DispatchSink::default();
        group.publish_pending(1_000, &mut demand, &mut sink);
        assert!(sink.deliveries.is_empty());
    }

    #[test]
    fn remove_keeps_cursor_on_successor() {
        let mut group = PriorityBucketGroup::new(None);
        group.add(pending_bucket("t0"));
        group.add(pending_bucket("t1"));
        group.add(pending_bucket("t2"));

        let mut demand = Demand::new(10);
        let mut sink = DispatchSink::default();
        // Cursor advances past t0.
        group.publish_pending(1_000, &mut demand, &mut sink);
        group.remove(&subject("t0"));
        group.publish_pending(1_000, &mut demand, &mut sink);

        let topics: Vec<_> = sink
            .deliveries
            .iter()
            .map(|(s, _)| s.topic.as_str().to_string())
            .collect();
        assert_eq!(topics, vec!["t0", "t1"]);
    }
}
