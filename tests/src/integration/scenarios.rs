//! # Transaction Number Scenarios
//!
//! End-to-end walks through the number lifecycle, each driven one
//! `process` step at a time against the mock notary:
//!
//! 1. **Acquisition**: a fresh relationship obtains numbers and spends the lowest first.
//! 2. **Replay**: numbers the notary hands out twice are rejected as stale.
//! 3. **Timeout**: a number survives a timed-out attempt and is spent by the retry.
//! 4. **Cancellation**: a task cancelled mid-flight is not re-queued and gives its number back.

#[cfg(test)]
mod tests {
    use crate::support::{alice, transfer, Harness};
    use ns_02_task_scheduler::{OperationError, Phase, SchedulerConfig, Task, TaskStatus};
    use shared_types::CommandKind;
    use std::collections::BTreeSet;
    use std::sync::Arc;
    use std::time::Duration;

    fn three_per_request() -> SchedulerConfig {
        SchedulerConfig {
            numbers_per_request: 3,
            ..SchedulerConfig::for_testing()
        }
    }

    async fn acquire(h: &Harness) {
        let handle = h.machine.submit(Task::GetTransactionNumbers).unwrap();
        h.drive().await;
        let result = handle.wait().await;
        assert!(result.success(), "{}", result.detail);
    }

    // =========================================================================
    // ACQUISITION
    // =========================================================================

    #[tokio::test]
    async fn test_fresh_relationship_acquires_numbers() {
        let h = Harness::new(three_per_request(), 5);
        acquire(&h).await;

        assert_eq!(h.context.issued(), BTreeSet::from([5, 6, 7]));
        assert_eq!(h.context.highest(), 7);
        assert_eq!(h.notary.issued_to(&alice()), BTreeSet::from([5, 6, 7]));

        let number = h.context.next_transaction_number("probe").unwrap();
        assert_eq!(number.number(), 5);
        assert!(h.context.is_checked_out(5));
        assert!(!h.context.issued().contains(&5));
        number.commit(false);
        assert_eq!(h.context.issued(), BTreeSet::from([5, 6, 7]));
    }

    #[tokio::test]
    async fn test_spent_numbers_leave_both_sides() {
        let h = Harness::new(three_per_request(), 5);
        acquire(&h).await;

        let handle = h.machine.submit(transfer("rent")).unwrap();
        h.drive().await;
        assert!(handle.wait().await.success());

        assert_eq!(h.context.issued(), BTreeSet::from([6, 7]));
        assert_eq!(h.notary.issued_to(&alice()), BTreeSet::from([6, 7]));
        assert!(!h.context.is_stale());
    }

    // =========================================================================
    // REPLAY
    // =========================================================================

    #[tokio::test]
    async fn test_replayed_numbers_are_rejected() {
        let h = Harness::new(three_per_request(), 5);
        acquire(&h).await;

        h.notary.replay_last_numbers();
        let handle = h.machine.submit(Task::GetTransactionNumbers).unwrap();
        h.drive().await;
        let result = handle.wait().await;

        assert!(result.success(), "{}", result.detail);
        assert!(result.detail.contains("accepted 0"), "{}", result.detail);
        assert!(result.detail.contains("rejected 3"), "{}", result.detail);
        assert_eq!(h.context.issued(), BTreeSet::from([5, 6, 7]));
        assert_eq!(h.context.highest(), 7);
        assert!(!h.context.is_unusable());
    }

    #[tokio::test]
    async fn test_replayed_set_partitions_as_bad() {
        let h = Harness::new(three_per_request(), 5);
        acquire(&h).await;

        let update = h.context.update_highest(&BTreeSet::from([5, 6, 7]));
        assert!(update.good.is_empty());
        assert_eq!(update.bad, BTreeSet::from([5, 6, 7]));
        assert!(update.is_consistent());
        assert_eq!(update.highest, 7);
    }

    // =========================================================================
    // TIMEOUT
    // =========================================================================

    #[tokio::test]
    async fn test_timeout_keeps_number_for_retry() {
        let h = Harness::new(SchedulerConfig::for_testing(), 5);
        acquire(&h).await;

        h.notary.fail_next(OperationError::Timeout);
        let handle = h.machine.submit(transfer("slow")).unwrap();
        assert!(h.machine.process().await);

        assert_eq!(h.machine.phase(), Phase::Retrying);
        assert!(h.context.is_checked_out(5));
        assert!(!h.context.issued().contains(&5));
        assert_eq!(h.machine.pending(), 1);

        tokio::time::sleep(SchedulerConfig::for_testing().retry_delay(1) + Duration::from_millis(5)).await;
        h.drive().await;
        let result = handle.wait().await;
        assert!(result.success(), "{}", result.detail);

        assert!(!h.context.is_checked_out(5));
        assert!(!h.context.issued().contains(&5));
        assert!(!h.notary.issued_to(&alice()).contains(&5));
        assert_eq!(
            h.notary.calls(),
            vec![
                CommandKind::GetTransactionNumbers,
                CommandKind::SendTransfer,
                CommandKind::SendTransfer
            ]
        );
    }

    #[tokio::test]
    async fn test_elapsed_deadline_counts_as_timeout() {
        let config = SchedulerConfig {
            operation_timeout_ms: 20,
            ..SchedulerConfig::for_testing()
        };
        let h = Harness::new(config, 5);
        acquire(&h).await;

        h.notary.delay_next(Duration::from_millis(200));
        let handle = h.machine.submit(transfer("stuck")).unwrap();
        assert!(h.machine.process().await);
        assert!(h.context.is_checked_out(5));

        tokio::time::sleep(Duration::from_millis(30)).await;
        h.drive().await;
        let result = handle.wait().await;
        assert!(result.success(), "{}", result.detail);
        assert!(!h.notary.issued_to(&alice()).contains(&5));
        assert_eq!(h.context.issued(), BTreeSet::from([6, 7, 8, 9]));
    }

    // =========================================================================
    // CANCELLATION
    // =========================================================================

    #[tokio::test]
    async fn test_cancel_in_flight_returns_number() {
        let h = Harness::new(SchedulerConfig::for_testing(), 5);
        acquire(&h).await;

        h.notary
            .fail_next_after(Duration::from_millis(50), OperationError::Timeout);
        let handle = h.machine.submit(transfer("cancel me")).unwrap();

        let machine = Arc::clone(&h.machine);
        let step = tokio::spawn(async move { machine.process().await });
        tokio::time::sleep(Duration::from_millis(15)).await;

        assert!(h.context.is_checked_out(5));
        assert!(h.machine.cancel(handle.id()));
        assert!(step.await.unwrap());

        assert_eq!(handle.wait().await.status, TaskStatus::Cancelled);
        assert_eq!(h.machine.pending(), 0);
        assert!(!h.context.is_checked_out(5));
        assert!(h.context.issued().contains(&5));

        // Nothing left to dispatch.
        assert!(!h.machine.process().await);
        assert_eq!(h.notary.call_count(), 2);
    }

    #[tokio::test]
    async fn test_resubmission_after_cancel_is_new_task() {
        let h = Harness::new(SchedulerConfig::for_testing(), 5);
        acquire(&h).await;

        let first = h.machine.submit(transfer("twice")).unwrap();
        assert!(h.machine.cancel_task(&transfer("twice")));
        let second = h.machine.submit(transfer("twice")).unwrap();
        assert_ne!(first.id(), second.id());

        h.drive().await;
        assert_eq!(first.wait().await.status, TaskStatus::Cancelled);
        assert!(second.wait().await.success());
    }
}
