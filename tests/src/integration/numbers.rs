//! # Number Pool Integration
//!
//! Offered numbers confirmed through a notary statement, duplicate issuance,
//! and partition properties of the highest-number rule.

#[cfg(test)]
mod tests {
    use crate::support::{alice, bob, notary_id, signer, transfer, Harness};
    use ns_01_consensus_context::{Context, InMemoryContextStore};
    use ns_02_task_scheduler::{SchedulerConfig, Task, TaskStatus};
    use proptest::prelude::*;
    use shared_types::{CommandKind, RelationshipId};
    use std::collections::BTreeSet;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_offered_numbers_confirmed_by_statement() {
        let h = Harness::new(SchedulerConfig::for_testing(), 5);
        let numbers = h.machine.submit(Task::GetTransactionNumbers).unwrap();
        h.drive().await;
        assert!(numbers.wait().await.success());

        let offered = h.notary.offer_numbers(&alice(), 2);
        assert_eq!(offered, BTreeSet::from([10, 11]));

        let handle = h.machine.submit(transfer("after offer")).unwrap();
        h.drive().await;
        let result = handle.wait().await;
        assert!(result.success(), "{}", result.detail);

        // The first attempt bounced on the nymbox hash and kept its number.
        assert_eq!(
            h.notary.calls(),
            vec![
                CommandKind::GetTransactionNumbers,
                CommandKind::SendTransfer,
                CommandKind::DownloadNymbox,
                CommandKind::SendTransfer
            ]
        );
        assert!(h.context.tentative().is_empty());
        assert_eq!(h.context.issued(), BTreeSet::from([6, 7, 8, 9, 10, 11]));
        assert_eq!(h.notary.issued_to(&alice()), h.context.issued());
        assert!(h.context.nymbox_hash_match());
        assert!(!h.context.is_stale());
    }

    #[tokio::test]
    async fn test_duplicate_issuance_makes_relationship_unusable() {
        let h = Harness::new(SchedulerConfig::for_testing(), 5);
        h.notary.register_nym(&bob());
        assert!(h.context.accept_issued_number(100));
        h.notary.force_next_numbers(BTreeSet::from([100]));

        let numbers = h.machine.submit(Task::GetTransactionNumbers).unwrap();
        let message = h
            .machine
            .submit(Task::SendMessage {
                recipient: bob(),
                body: "hello".into(),
            })
            .unwrap();

        assert!(h.machine.process().await);
        let result = numbers.wait().await;
        assert_eq!(result.status, TaskStatus::Failed);
        assert!(result.detail.contains("duplicate issuance"), "{}", result.detail);
        assert!(h.context.is_unusable());

        assert!(!h.machine.process().await);
        let result = message.wait().await;
        assert_eq!(result.status, TaskStatus::Failed);
        assert_eq!(result.detail, "relationship is unusable");
        assert_eq!(h.notary.calls(), vec![CommandKind::GetTransactionNumbers]);
        assert!(h.machine.snapshot().unusable);
    }

    #[tokio::test]
    async fn test_rejected_retry_marks_stale_and_resyncs() {
        let h = Harness::new(SchedulerConfig::for_testing(), 5);
        let numbers = h.machine.submit(Task::GetTransactionNumbers).unwrap();
        h.drive().await;
        assert!(numbers.wait().await.success());

        h.notary
            .fail_next(ns_02_task_scheduler::OperationError::ConnectionRefused);
        h.notary.reject_next("duplicate request");
        let handle = h.machine.submit(transfer("maybe sent")).unwrap();
        assert!(h.machine.process().await);
        tokio::time::sleep(SchedulerConfig::for_testing().retry_delay(1) * 2).await;
        h.drive().await;

        assert_eq!(handle.wait().await.status, TaskStatus::Failed);
        assert!(h.notary.calls().contains(&CommandKind::SyncContext));
        assert!(!h.context.is_stale());
        assert_eq!(h.context.issued(), h.notary.issued_to(&alice()));
    }

    fn empty_context() -> Arc<Context> {
        Context::new(
            RelationshipId::new(alice(), notary_id()),
            signer(),
            Arc::new(InMemoryContextStore::new()),
        )
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_update_highest_partitions_reported(
            first in proptest::collection::btree_set(1i64..500, 0..20),
            second in proptest::collection::btree_set(1i64..500, 0..20),
        ) {
            let context = empty_context();
            let before = context.update_highest(&first);
            prop_assert!(before.is_consistent());

            let update = context.update_highest(&second);
            let union: BTreeSet<i64> = update.good.union(&update.bad).copied().collect();
            prop_assert_eq!(&union, &second);
            prop_assert!(update.good.iter().all(|n| *n > before.highest));
            prop_assert!(update.bad.iter().all(|n| *n <= before.highest));
            prop_assert!(update.highest >= before.highest);
            prop_assert!(context.issued().is_superset(&update.good));
        }
    }
}
