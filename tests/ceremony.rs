mod tests {
    use std::{
        sync::{Arc, Mutex},
        time::Duration,
    };

    use async_trait::async_trait;
    use schnorr_fun::{frost::Frost, nonce::Deterministic};
    use sha2::Sha256;
    use tokio::sync::mpsc;

    use keygen_ceremony::{
        engine::EngineMessage,
        error::{NotifyError, StorageError},
        frost::{FrostSaveData, CEREMONY_TYPE, OPERATION_TAG},
        gossip::{GossipTransport, MemoryNetwork, Payload},
        notify::Notifier,
        peers::PeerId,
        result::{KeygenResult, KeygenStatus},
        storage::{FileStore, KeyStore, PersistedRecord},
        CeremonyError, Coordinator, KeygenRequest,
    };

    type TestFrost = Frost<Sha256, Deterministic<Sha256>>;

    const CALLBACK: &str = "http://localhost:9/keygen";

    /// Remembers every result it was asked to deliver.
    #[derive(Default)]
    struct RecordingNotifier {
        delivered: Mutex<Vec<(String, KeygenResult)>>,
        fail: bool,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify(&self, address: &str, result: &KeygenResult) -> Result<(), NotifyError> {
            self.delivered
                .lock()
                .unwrap()
                .push((address.to_string(), result.clone()));
            if self.fail {
                return Err(NotifyError::Status(503));
            }
            Ok(())
        }
    }

    /// Takes its time before recording a delivery.
    struct SlowNotifier {
        delay: Duration,
        delivered: Mutex<Vec<KeygenResult>>,
    }

    #[async_trait]
    impl Notifier for SlowNotifier {
        async fn notify(&self, _: &str, result: &KeygenResult) -> Result<(), NotifyError> {
            tokio::time::sleep(self.delay).await;
            self.delivered.lock().unwrap().push(result.clone());
            Ok(())
        }
    }

    struct BrokenStore;

    #[async_trait]
    impl KeyStore for BrokenStore {
        async fn write(&self, _: &str, _: &PersistedRecord) -> Result<(), StorageError> {
            Err(StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "read-only disk",
            )))
        }

        async fn load(&self, _: &str, _: &PeerId) -> Result<Option<PersistedRecord>, StorageError> {
            Ok(None)
        }
    }

    fn peer_ids(n: u8) -> Vec<PeerId> {
        (1..=n)
            .map(|i| PeerId::new(bs58::encode([i * 7]).into_string()))
            .collect()
    }

    fn request(ids: &[PeerId], threshold: usize) -> KeygenRequest {
        KeygenRequest {
            peer_ids: ids.to_vec(),
            threshold,
            peers_count: ids.len(),
            callback_url: CALLBACK.into(),
        }
    }

    fn coordinator(
        network: &MemoryNetwork,
        id: &PeerId,
        store: Arc<dyn KeyStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Coordinator<TestFrost> {
        Coordinator::new(
            Arc::new(TestFrost::default()),
            Arc::new(network.endpoint(id.clone())),
            store,
            notifier,
        )
        .with_timeout(Duration::from_secs(30))
    }

    /// Subscribe every peer first so no broadcast is missed, then run all ceremonies.
    async fn run_all(
        coordinators: Vec<Coordinator<TestFrost>>,
        network: &MemoryNetwork,
        ids: &[PeerId],
        threshold: usize,
    ) -> Vec<Result<KeygenResult, CeremonyError>> {
        let mut inbounds = vec![];
        for id in ids {
            inbounds.push(network.endpoint(id.clone()).subscribe().await.unwrap());
        }

        let handles: Vec<_> = coordinators
            .into_iter()
            .zip(inbounds)
            .map(|(coordinator, inbound)| {
                let request = request(ids, threshold);
                tokio::spawn(async move { coordinator.run(request, inbound).await })
            })
            .collect();

        let mut results = vec![];
        for handle in handles {
            results.push(handle.await.unwrap());
        }
        results
    }

    #[tokio::test]
    async fn three_peers_generate_a_shared_key() {
        let network = MemoryNetwork::new(32);
        let ids = peer_ids(3);
        let notifier = Arc::new(RecordingNotifier::default());
        let dirs: Vec<_> = ids.iter().map(|_| tempfile::tempdir().unwrap()).collect();

        let coordinators: Vec<_> = ids
            .iter()
            .zip(&dirs)
            .map(|(id, dir)| {
                coordinator(
                    &network,
                    id,
                    Arc::new(FileStore::new(dir.path())),
                    notifier.clone(),
                )
            })
            .collect();
        let results = run_all(coordinators, &network, &ids, 2).await;

        let results: Vec<KeygenResult> = results.into_iter().map(Result::unwrap).collect();
        for (i, result) in results.iter().enumerate() {
            assert_eq!(result.status, KeygenStatus::Success);
            assert_eq!(result.public_key, results[0].public_key);
            assert_eq!(result.share_id, ((i as u64 + 1) * 7).to_string());
        }
        assert_eq!(results[0].public_key.len(), 64);

        for ((id, dir), result) in ids.iter().zip(&dirs).zip(&results) {
            let store = FileStore::new(dir.path());
            assert!(store.record_path(CEREMONY_TYPE).exists());
            let record = store.load(CEREMONY_TYPE, id).await.unwrap().unwrap();
            assert_eq!(&record.peer_id, id);
            assert_eq!(record.meta_data.peers_count, 3);
            assert_eq!(record.meta_data.threshold, 2);
            let save_data: FrostSaveData = record.keygen_data().unwrap();
            assert_eq!(hex::encode(&save_data.public_key), result.public_key);
            assert_eq!(save_data.verification_shares.len(), 3);
        }

        let delivered = notifier.delivered.lock().unwrap();
        assert_eq!(delivered.len(), 3);
        assert!(delivered.iter().all(|(address, _)| address == CALLBACK));
    }

    /// Every peer subscribes and starts on its own, in whatever order the runtime picks.
    async fn keygen_all(
        coordinators: Vec<Coordinator<TestFrost>>,
        ids: &[PeerId],
        threshold: usize,
    ) -> Vec<Result<KeygenResult, CeremonyError>> {
        let handles: Vec<_> = coordinators
            .into_iter()
            .map(|coordinator| {
                let request = request(ids, threshold);
                tokio::spawn(async move { coordinator.keygen(request).await })
            })
            .collect();

        let mut results = vec![];
        for handle in handles {
            results.push(handle.await.unwrap());
        }
        results
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_keygen_calls_complete() {
        for _ in 0..5 {
            let network = MemoryNetwork::new(32);
            let ids = peer_ids(3);
            let notifier = Arc::new(RecordingNotifier::default());
            let dirs: Vec<_> = ids.iter().map(|_| tempfile::tempdir().unwrap()).collect();
            let coordinators: Vec<_> = ids
                .iter()
                .zip(&dirs)
                .map(|(id, dir)| {
                    coordinator(
                        &network,
                        id,
                        Arc::new(FileStore::new(dir.path())),
                        notifier.clone(),
                    )
                    .with_timeout(Duration::from_secs(10))
                })
                .collect();

            let results: Vec<KeygenResult> = keygen_all(coordinators, &ids, 2)
                .await
                .into_iter()
                .map(Result::unwrap)
                .collect();
            assert!(results.iter().all(|r| r.public_key == results[0].public_key));
            assert_eq!(notifier.delivered.lock().unwrap().len(), 3);
        }
    }

    #[tokio::test]
    async fn slow_callback_outlives_the_deadline() {
        let network = MemoryNetwork::new(16);
        let ids = peer_ids(2);
        let notifier = Arc::new(SlowNotifier {
            delay: Duration::from_millis(1500),
            delivered: Mutex::default(),
        });
        let dirs: Vec<_> = ids.iter().map(|_| tempfile::tempdir().unwrap()).collect();
        let coordinators: Vec<_> = ids
            .iter()
            .zip(&dirs)
            .map(|(id, dir)| {
                coordinator(
                    &network,
                    id,
                    Arc::new(FileStore::new(dir.path())),
                    notifier.clone(),
                )
                .with_timeout(Duration::from_millis(500))
            })
            .collect();

        let results = keygen_all(coordinators, &ids, 1).await;

        for (result, dir) in results.iter().zip(&dirs) {
            assert!(result.is_ok(), "{:?}", result);
            assert!(FileStore::new(dir.path())
                .record_path(CEREMONY_TYPE)
                .exists());
        }
        assert_eq!(notifier.delivered.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn stored_key_is_found_after_keygen() {
        let network = MemoryNetwork::new(16);
        let ids = peer_ids(2);
        let notifier: Arc<dyn Notifier> = Arc::new(RecordingNotifier::default());
        let dirs: Vec<_> = ids.iter().map(|_| tempfile::tempdir().unwrap()).collect();
        let build = |i: usize| {
            coordinator(
                &network,
                &ids[i],
                Arc::new(FileStore::new(dirs[i].path())),
                notifier.clone(),
            )
        };

        assert!(build(0).stored_key().await.unwrap().is_none());
        let results = run_all(vec![build(0), build(1)], &network, &ids, 1).await;
        assert!(results.iter().all(Result::is_ok));

        let stored = build(0).stored_key().await.unwrap().unwrap();
        assert_eq!(stored.peer_id, ids[0]);
    }

    #[tokio::test]
    async fn failed_write_never_calls_back() {
        let network = MemoryNetwork::new(16);
        let ids = peer_ids(2);
        let broken_notifier = Arc::new(RecordingNotifier::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let dir = tempfile::tempdir().unwrap();

        let coordinators = vec![
            coordinator(&network, &ids[0], Arc::new(BrokenStore), broken_notifier.clone()),
            coordinator(
                &network,
                &ids[1],
                Arc::new(FileStore::new(dir.path())),
                notifier.clone(),
            ),
        ];
        let results = run_all(coordinators, &network, &ids, 1).await;

        assert!(matches!(results[0], Err(CeremonyError::Persist(_))));
        assert!(results[1].is_ok());
        assert!(broken_notifier.delivered.lock().unwrap().is_empty());
        assert_eq!(notifier.delivered.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failed_callback_keeps_the_record() {
        let network = MemoryNetwork::new(16);
        let ids = peer_ids(2);
        let notifier = Arc::new(RecordingNotifier {
            fail: true,
            ..Default::default()
        });
        let dirs: Vec<_> = ids.iter().map(|_| tempfile::tempdir().unwrap()).collect();

        let coordinators: Vec<_> = ids
            .iter()
            .zip(&dirs)
            .map(|(id, dir)| {
                coordinator(
                    &network,
                    id,
                    Arc::new(FileStore::new(dir.path())),
                    notifier.clone(),
                )
            })
            .collect();
        let results = run_all(coordinators, &network, &ids, 1).await;

        for (result, dir) in results.iter().zip(&dirs) {
            assert!(matches!(
                result,
                Err(CeremonyError::Notify { address, .. }) if address == CALLBACK
            ));
            assert!(FileStore::new(dir.path())
                .record_path(CEREMONY_TYPE)
                .exists());
        }
        assert_eq!(notifier.delivered.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn closed_channel_fails_the_ceremony() {
        let network = MemoryNetwork::new(4);
        let ids = peer_ids(2);
        let dir = tempfile::tempdir().unwrap();
        let coordinator = coordinator(
            &network,
            &ids[0],
            Arc::new(FileStore::new(dir.path())),
            Arc::new(RecordingNotifier::default()),
        );

        let (tx, rx) = mpsc::channel(1);
        drop(tx);
        assert!(matches!(
            coordinator.run(request(&ids, 1), rx).await,
            Err(CeremonyError::ChannelClosed)
        ));
    }

    #[tokio::test]
    async fn silent_peers_time_out() {
        let network = MemoryNetwork::new(4);
        let ids = peer_ids(2);
        let dir = tempfile::tempdir().unwrap();
        let notifier = Arc::new(RecordingNotifier::default());
        let coordinator = coordinator(
            &network,
            &ids[0],
            Arc::new(FileStore::new(dir.path())),
            notifier.clone(),
        )
        .with_timeout(Duration::from_millis(200));

        let (_tx, rx) = mpsc::channel(1);
        assert!(matches!(
            coordinator.run(request(&ids, 1), rx).await,
            Err(CeremonyError::Timeout(_))
        ));
        assert!(notifier.delivered.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn undecodable_message_fails_the_ceremony() {
        let network = MemoryNetwork::new(4);
        let ids = peer_ids(2);
        let dir = tempfile::tempdir().unwrap();
        let coordinator = coordinator(
            &network,
            &ids[0],
            Arc::new(FileStore::new(dir.path())),
            Arc::new(RecordingNotifier::default()),
        );

        let (tx, rx) = mpsc::channel(1);
        tx.send(Payload {
            message: "not hex".into(),
            message_id: OPERATION_TAG.into(),
            sender_id: ids[1].to_string(),
        })
        .await
        .unwrap();
        let err = coordinator.run(request(&ids, 1), rx).await.unwrap_err();
        assert!(matches!(err, CeremonyError::Decode { sender, .. } if sender == ids[1].as_str()));
    }

    #[tokio::test]
    async fn unknown_local_peer_is_rejected() {
        let network = MemoryNetwork::new(4);
        let ids = peer_ids(3);
        let dir = tempfile::tempdir().unwrap();
        let notifier = Arc::new(RecordingNotifier::default());
        let outsider = PeerId::new(bs58::encode([200u8]).into_string());
        let coordinator = coordinator(
            &network,
            &outsider,
            Arc::new(FileStore::new(dir.path())),
            notifier.clone(),
        );

        let (_tx, rx) = mpsc::channel(1);
        assert!(matches!(
            coordinator.run(request(&ids, 2), rx).await,
            Err(CeremonyError::LocalIdentityNotFound(_))
        ));
        assert!(notifier.delivered.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn first_broadcast_carries_the_operation_tag() {
        let network = MemoryNetwork::new(4);
        let ids = peer_ids(2);
        let dir = tempfile::tempdir().unwrap();
        let coordinator = coordinator(
            &network,
            &ids[0],
            Arc::new(FileStore::new(dir.path())),
            Arc::new(RecordingNotifier::default()),
        )
        .with_timeout(Duration::from_millis(300));
        let mut listener = network.endpoint(ids[1].clone()).subscribe().await.unwrap();

        let (_tx, rx) = mpsc::channel(1);
        let ceremony = tokio::spawn(async move { coordinator.run(request(&ids, 1), rx).await });

        let payload = listener.recv().await.unwrap();
        assert_eq!(payload.message_id, OPERATION_TAG);
        let message: EngineMessage =
            serde_json::from_slice(&hex::decode(&payload.message).unwrap()).unwrap();
        assert!(message.is_for_everyone());
        assert_eq!(message.from.as_str(), payload.sender_id);

        assert!(matches!(
            ceremony.await.unwrap(),
            Err(CeremonyError::Timeout(_))
        ));
    }
}
