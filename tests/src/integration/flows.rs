//! # Registry Flows
//!
//! Relationships driven by their own workers through the registry:
//!
//! 1. **Persistence**: contexts survive a registry restart on a file store.
//! 2. **Statement signatures**: notary statements verified with the notary's key.
//! 3. **Admin login**: attempted once per context when a password is configured.
//! 4. **Shutdown**: every pending handle resolves.

#[cfg(test)]
mod tests {
    use crate::support::{alice, bob, init_tracing, notary_id, signer, transfer};
    use ns_01_consensus_context::{Ed25519Signer, FileContextStore, InMemoryContextStore, Verifier};
    use ns_02_task_scheduler::{
        MockNotary, Registry, SchedulerConfig, Task, TaskScheduler, TaskStatus,
    };
    use shared_types::{CommandKind, NymboxNotice};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::timeout;

    fn notary() -> Arc<MockNotary> {
        let notary = Arc::new(MockNotary::new(notary_id()).with_first_number(5));
        notary.register_nym(&alice());
        notary.register_nym(&bob());
        notary
    }

    fn registry(config: SchedulerConfig) -> Registry {
        init_tracing();
        Registry::new(config, signer(), Arc::new(InMemoryContextStore::new())).unwrap()
    }

    /// Poll `check` until it holds or a second passes.
    async fn eventually(check: impl Fn() -> bool) -> bool {
        timeout(Duration::from_secs(1), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .is_ok()
    }

    // =========================================================================
    // PERSISTENCE
    // =========================================================================

    #[tokio::test]
    async fn test_context_survives_restart() {
        init_tracing();
        let dir = tempfile::tempdir().unwrap();
        let notary = notary();

        let issued = {
            let store = Arc::new(FileContextStore::open(dir.path()).unwrap());
            let registry = Registry::new(SchedulerConfig::for_testing(), signer(), store).unwrap();
            let rel = registry
                .open(alice(), notary_id(), notary.clone(), None)
                .unwrap();
            assert!(registry
                .submit(&rel, Task::GetTransactionNumbers)
                .unwrap()
                .wait()
                .await
                .success());
            assert!(registry.submit(&rel, transfer("rent")).unwrap().wait().await.success());
            let issued = registry.context_snapshot(&rel).unwrap().issued;
            registry.shutdown().await;
            issued
        };
        assert_eq!(issued.len(), 4);

        let store = Arc::new(FileContextStore::open(dir.path()).unwrap());
        let registry = Registry::new(SchedulerConfig::for_testing(), signer(), store).unwrap();
        let rel = registry.open(alice(), notary_id(), notary.clone(), None).unwrap();
        let snapshot = registry.context_snapshot(&rel).unwrap();
        assert_eq!(snapshot.issued, issued);
        assert!(snapshot.checked_out.is_empty());

        // The reloaded context spends where the old one stopped.
        let result = registry.submit(&rel, transfer("groceries")).unwrap().wait().await;
        assert!(result.success(), "{}", result.detail);
        assert!(!registry.context_snapshot(&rel).unwrap().issued.contains(&6));
        registry.shutdown().await;
    }

    // =========================================================================
    // STATEMENT SIGNATURES
    // =========================================================================

    #[tokio::test]
    async fn test_signed_statement_accepted() {
        let registry = registry(SchedulerConfig::for_testing());
        let notary_key = Arc::new(Ed25519Signer::from_seed([42u8; 32]));
        let notary = Arc::new(
            MockNotary::new(notary_id())
                .with_first_number(5)
                .with_signer(notary_key.clone()),
        );
        notary.register_nym(&alice());
        let verifier: Arc<dyn Verifier> = Arc::new(notary_key.verifier());
        let rel = registry
            .open(alice(), notary_id(), notary.clone(), Some(verifier))
            .unwrap();

        registry.submit(&rel, Task::GetTransactionNumbers).unwrap().wait().await;
        let result = registry.submit(&rel, transfer("signed")).unwrap().wait().await;
        assert!(result.success(), "{}", result.detail);
        assert!(result.reply.unwrap().statement.is_some());

        let snapshot = registry.context_snapshot(&rel).unwrap();
        assert!(!snapshot.stale);
        assert!(!notary.calls().contains(&CommandKind::SyncContext));
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_forged_statement_triggers_resync() {
        let registry = registry(SchedulerConfig::for_testing());
        let notary = Arc::new(
            MockNotary::new(notary_id())
                .with_first_number(5)
                .with_signer(Arc::new(Ed25519Signer::from_seed([42u8; 32]))),
        );
        notary.register_nym(&alice());
        let wrong_key: Arc<dyn Verifier> = Arc::new(Ed25519Signer::from_seed([43u8; 32]).verifier());
        let rel = registry
            .open(alice(), notary_id(), notary.clone(), Some(wrong_key))
            .unwrap();

        registry.submit(&rel, Task::GetTransactionNumbers).unwrap().wait().await;
        registry.submit(&rel, transfer("forged")).unwrap().wait().await;

        let resynced = eventually(|| notary.calls().contains(&CommandKind::SyncContext)).await;
        assert!(resynced);
        assert!(eventually(|| !registry.context_snapshot(&rel).unwrap().stale).await);
        assert_eq!(
            registry.context_snapshot(&rel).unwrap().issued,
            notary.issued_to(&alice())
        );
        registry.shutdown().await;
    }

    // =========================================================================
    // ADMIN LOGIN
    // =========================================================================

    #[tokio::test]
    async fn test_admin_login_once_per_context() {
        let config = SchedulerConfig {
            admin_password: Some("hunter2".into()),
            ..SchedulerConfig::for_testing()
        };
        let registry = registry(config);
        let notary = notary();
        notary.set_admin_password("hunter2");
        let rel = registry.open(alice(), notary_id(), notary.clone(), None).unwrap();

        assert!(eventually(|| registry.context_snapshot(&rel).unwrap().admin).await);
        registry.submit(&rel, Task::DownloadNymbox).unwrap().wait().await;
        let logins = notary
            .calls()
            .into_iter()
            .filter(|kind| *kind == CommandKind::AdminLogin)
            .count();
        assert_eq!(logins, 1);
        registry.shutdown().await;
    }

    // =========================================================================
    // MESSAGES AND SHUTDOWN
    // =========================================================================

    #[tokio::test]
    async fn test_message_lands_in_recipient_nymbox() {
        let registry = registry(SchedulerConfig::for_testing());
        let notary = notary();
        let alice_rel = registry.open(alice(), notary_id(), notary.clone(), None).unwrap();
        let bob_rel = registry.open(bob(), notary_id(), notary.clone(), None).unwrap();

        let sent = registry
            .submit(
                &alice_rel,
                Task::SendMessage {
                    recipient: bob(),
                    body: "lunch?".into(),
                },
            )
            .unwrap()
            .wait()
            .await;
        assert!(sent.success(), "{}", sent.detail);

        let result = registry
            .submit(&bob_rel, Task::DownloadNymbox)
            .unwrap()
            .wait()
            .await;
        assert!(result.success(), "{}", result.detail);
        let notices = match result.reply.unwrap().payload {
            shared_types::ReplyPayload::Nymbox(nymbox) => nymbox.notices,
            other => panic!("unexpected payload {:?}", other),
        };
        assert!(matches!(
            notices.as_slice(),
            [NymboxNotice::Message { from, body }] if *from == alice() && body == "lunch?"
        ));
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_resolves_every_handle() {
        let registry = registry(SchedulerConfig::for_testing());
        let notary = notary();
        notary.delay_next(Duration::from_millis(50));
        let rel = registry.open(alice(), notary_id(), notary.clone(), None).unwrap();

        let handles: Vec<_> = vec![
            registry.submit(&rel, Task::GetTransactionNumbers).unwrap(),
            registry.submit(&rel, Task::DownloadNymbox).unwrap(),
            registry.submit(&rel, transfer("late")).unwrap(),
        ];
        tokio::time::sleep(Duration::from_millis(20)).await;
        registry.shutdown().await;

        let mut statuses = Vec::new();
        for handle in handles {
            statuses.push(handle.wait().await.status);
        }
        assert_eq!(
            statuses,
            vec![TaskStatus::Succeeded, TaskStatus::ShutDown, TaskStatus::ShutDown]
        );
        assert!(registry.relationships().is_empty());
    }
}
