// In memory outbox log.
//
// Purpose
// - Hold outbox events for the in memory listing store, which keeps this log and the
//   listing rows behind a single lock so a write and its append commit together.
//
// Responsibilities
// - Assign strictly increasing sequence numbers.
// - Enforce the delivery state machine: pending -> in_flight -> delivered | pending | failed.

use std::collections::BTreeMap;

use crate::shared::infrastructure::change_outbox::{
    DeliveryState, NewOutboxEvent, OutboxError, OutboxEvent, RetrySchedule, select_claimable,
};

#[derive(Debug, Default)]
pub struct OutboxLog {
    events: BTreeMap<i64, OutboxEvent>,
    last_sequence: i64,
}

impl OutboxLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, event: NewOutboxEvent) -> i64 {
        self.last_sequence += 1;
        let sequence = self.last_sequence;
        self.events
            .insert(sequence, OutboxEvent::from_new(sequence, event));
        sequence
    }

    pub fn get(&self, sequence: i64) -> Option<&OutboxEvent> {
        self.events.get(&sequence)
    }

    pub fn events_for(&self, listing_id: &str) -> Vec<OutboxEvent> {
        self.events
            .values()
            .filter(|event| event.listing_id == listing_id)
            .cloned()
            .collect()
    }

    pub fn claim_batch(&mut self, max_count: usize, now: i64) -> Vec<OutboxEvent> {
        let sequences = select_claimable(
            self.events.values().filter(|event| event.is_undelivered()),
            max_count,
            now,
        );
        sequences
            .into_iter()
            .filter_map(|sequence| {
                let event = self.events.get_mut(&sequence)?;
                event.state = DeliveryState::InFlight;
                event.updated_at = now;
                Some(event.clone())
            })
            .collect()
    }

    pub fn mark_delivered(&mut self, sequence: i64, now: i64) -> Result<(), OutboxError> {
        let event = self.transition(sequence, DeliveryState::InFlight)?;
        event.state = DeliveryState::Delivered;
        event.updated_at = now;
        Ok(())
    }

    pub fn mark_retry(
        &mut self,
        sequence: i64,
        schedule: RetrySchedule,
        now: i64,
    ) -> Result<(), OutboxError> {
        let event = self.transition(sequence, DeliveryState::InFlight)?;
        event.state = DeliveryState::Pending;
        event.attempts = schedule.attempts;
        event.next_attempt_at = schedule.next_attempt_at;
        event.first_failed_at = Some(schedule.first_failed_at);
        event.last_error = Some(schedule.last_error);
        event.updated_at = now;
        Ok(())
    }

    pub fn release(&mut self, sequence: i64, now: i64) -> Result<(), OutboxError> {
        let event = self.transition(sequence, DeliveryState::InFlight)?;
        event.state = DeliveryState::Pending;
        event.updated_at = now;
        Ok(())
    }

    pub fn mark_failed(&mut self, sequence: i64, reason: &str, now: i64) -> Result<(), OutboxError> {
        let event = self.transition(sequence, DeliveryState::InFlight)?;
        event.state = DeliveryState::Failed;
        event.last_error = Some(reason.to_string());
        event.updated_at = now;
        Ok(())
    }

    pub fn failed(&self, limit: usize) -> Vec<OutboxEvent> {
        self.events
            .values()
            .filter(|event| event.state == DeliveryState::Failed)
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn requeue_failed(&mut self, sequence: i64, now: i64) -> Result<(), OutboxError> {
        let event = self.transition(sequence, DeliveryState::Failed)?;
        event.state = DeliveryState::Pending;
        event.attempts = 0;
        event.next_attempt_at = now;
        event.first_failed_at = None;
        event.updated_at = now;
        Ok(())
    }

    /// Settle a failed event whose snapshot a newer listing version has made stale.
    pub fn supersede_failed(&mut self, sequence: i64, now: i64) -> Result<(), OutboxError> {
        let event = self.transition(sequence, DeliveryState::Failed)?;
        event.state = DeliveryState::Delivered;
        event.updated_at = now;
        Ok(())
    }

    pub fn requeue_in_flight(&mut self, now: i64) -> usize {
        let mut requeued = 0;
        for event in self.events.values_mut() {
            if event.state == DeliveryState::InFlight {
                event.state = DeliveryState::Pending;
                event.updated_at = now;
                requeued += 1;
            }
        }
        requeued
    }

    pub fn has_undelivered(&self, listing_id: &str) -> bool {
        self.events
            .values()
            .any(|event| event.listing_id == listing_id && event.is_undelivered())
    }

    pub fn prune_delivered(&mut self, before: i64) -> usize {
        let initial = self.events.len();
        self.events.retain(|_, event| {
            !(event.state == DeliveryState::Delivered && event.updated_at < before)
        });
        initial - self.events.len()
    }

    fn transition(
        &mut self,
        sequence: i64,
        expected: DeliveryState,
    ) -> Result<&mut OutboxEvent, OutboxError> {
        let event = self
            .events
            .get_mut(&sequence)
            .ok_or(OutboxError::NotFound(sequence))?;
        if event.state != expected {
            return Err(OutboxError::InvalidState {
                sequence,
                expected,
                actual: event.state,
            });
        }
        Ok(event)
    }
}

#[cfg(test)]
mod in_memory_outbox_log_tests {
    use super::*;
    use crate::shared::infrastructure::change_outbox::EventOrigin;
    use crate::tests::fixtures::listings::ListingBuilder;
    use rstest::{fixture, rstest};

    fn new_event(listing_id: &str, version: i64) -> NewOutboxEvent {
        let listing = ListingBuilder::new()
            .listing_id(listing_id)
            .version(version)
            .build();
        NewOutboxEvent::for_listing(&listing, EventOrigin::Mutation, 1_000).unwrap()
    }

    #[fixture]
    fn before_each() -> OutboxLog {
        let mut log = OutboxLog::new();
        log.append(new_event("listing-a", 1));
        log.append(new_event("listing-b", 1));
        log.append(new_event("listing-a", 2));
        log
    }

    #[rstest]
    fn it_should_assign_increasing_sequences(before_each: OutboxLog) {
        let mut log = before_each;
        assert_eq!(log.append(new_event("listing-c", 1)), 4);
        assert_eq!(log.get(4).unwrap().state, DeliveryState::Pending);
    }

    #[rstest]
    fn it_should_claim_and_mark_events_in_flight(before_each: OutboxLog) {
        let mut log = before_each;
        let batch = log.claim_batch(10, 1_000);
        let sequences: Vec<i64> = batch.iter().map(|event| event.sequence).collect();
        assert_eq!(sequences, vec![1, 2, 3]);
        assert!(batch.iter().all(|event| event.state == DeliveryState::InFlight));
        assert!(log.claim_batch(10, 1_000).is_empty());
    }

    #[rstest]
    fn it_should_keep_a_retried_listing_out_of_the_next_batch_until_due(before_each: OutboxLog) {
        let mut log = before_each;
        log.claim_batch(10, 1_000);
        log.mark_retry(
            1,
            RetrySchedule {
                attempts: 1,
                next_attempt_at: 5_000,
                first_failed_at: 1_000,
                last_error: "offline".to_string(),
            },
            1_000,
        )
        .unwrap();
        log.release(3, 1_000).unwrap();
        log.mark_delivered(2, 1_000).unwrap();

        assert!(log.claim_batch(10, 2_000).is_empty());

        let later: Vec<i64> = log
            .claim_batch(10, 5_000)
            .iter()
            .map(|event| event.sequence)
            .collect();
        assert_eq!(later, vec![1, 3]);
        assert_eq!(log.get(1).unwrap().attempts, 1);
        assert_eq!(log.get(1).unwrap().last_error.as_deref(), Some("offline"));
    }

    #[rstest]
    fn it_should_reject_acknowledging_an_unclaimed_event(before_each: OutboxLog) {
        let mut log = before_each;
        assert_eq!(
            log.mark_delivered(1, 1_000),
            Err(OutboxError::InvalidState {
                sequence: 1,
                expected: DeliveryState::InFlight,
                actual: DeliveryState::Pending,
            })
        );
        assert_eq!(log.mark_delivered(99, 1_000), Err(OutboxError::NotFound(99)));
    }

    #[rstest]
    fn it_should_park_and_requeue_failed_events(before_each: OutboxLog) {
        let mut log = before_each;
        log.claim_batch(1, 1_000);
        log.mark_failed(1, "retry window exhausted", 2_000).unwrap();
        assert_eq!(log.failed(10).len(), 1);
        assert!(log.has_undelivered("listing-a"));

        log.requeue_failed(1, 3_000).unwrap();
        let event = log.get(1).unwrap();
        assert_eq!(event.state, DeliveryState::Pending);
        assert_eq!(event.attempts, 0);
        assert_eq!(event.next_attempt_at, 3_000);
        assert!(log.failed(10).is_empty());
    }

    #[rstest]
    fn it_should_settle_a_stale_failed_event(before_each: OutboxLog) {
        let mut log = before_each;
        log.claim_batch(1, 1_000);
        assert!(log.supersede_failed(1, 1_500).is_err());
        log.mark_failed(1, "retry window exhausted", 2_000).unwrap();
        log.supersede_failed(1, 3_000).unwrap();
        assert_eq!(log.get(1).unwrap().state, DeliveryState::Delivered);
        assert!(log.failed(10).is_empty());
    }

    #[rstest]
    fn it_should_requeue_in_flight_events_after_a_crash(before_each: OutboxLog) {
        let mut log = before_each;
        log.claim_batch(2, 1_000);
        assert_eq!(log.requeue_in_flight(1_500), 2);
        assert_eq!(log.claim_batch(10, 1_500).len(), 3);
    }

    #[rstest]
    fn it_should_prune_only_old_delivered_events(before_each: OutboxLog) {
        let mut log = before_each;
        log.claim_batch(10, 1_000);
        log.mark_delivered(1, 1_000).unwrap();
        log.mark_delivered(2, 4_000).unwrap();
        assert_eq!(log.prune_delivered(2_000), 1);
        assert!(log.get(1).is_none());
        assert!(log.get(2).is_some());
        assert!(log.get(3).is_some());
    }
}
