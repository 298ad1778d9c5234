//! End-to-end fan-out tests: gateway through hub and relay

#![allow(clippy::unwrap_used)]

use async_trait::async_trait;
use callrelay_core::{
    config::Config, config::StorageConfig, AccessCode, Call, DownstreamTarget, Grant,
    TalkgroupScope,
};
use callrelay_dispatch::{Controller, DispatchError, RelayTransport};
use callrelay_ingest::SourcePayload;
use pretty_assertions::assert_eq;
use std::sync::Arc;

struct CountingTransport;

#[async_trait]
impl RelayTransport for CountingTransport {
    async fn forward(
        &self,
        _target: &DownstreamTarget,
        _call: &Call,
        _audio: &[u8],
    ) -> Result<(), DispatchError> {
        Ok(())
    }
}

fn config_in(dir: &tempfile::TempDir) -> Config {
    Config {
        storage: StorageConfig {
            base_dir: dir.path().to_path_buf(),
            database_file: "fanout.db".to_string(),
            max_connections: 4,
        },
        ..Config::default()
    }
}

fn payload(system: i64, talkgroup: i64, start: i64) -> SourcePayload {
    SourcePayload::Dirwatch {
        system,
        filename: format!("{talkgroup}-{start}_4001.mp3"),
        audio: vec![1, 2, 3],
    }
}

async fn add_code(controller: &Controller, ident: &str, system: i64) {
    controller
        .archive()
        .upsert_access_code(&AccessCode {
            ident: ident.to_string(),
            code: format!("{ident}-code"),
            grants: vec![Grant {
                system,
                talkgroups: TalkgroupScope::All,
            }],
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn listeners_only_see_their_granted_systems() {
    let dir = tempfile::tempdir().unwrap();
    let controller = Controller::start(config_in(&dir)).await.unwrap();

    add_code(&controller, "north", 1).await;
    add_code(&controller, "south", 2).await;

    let north = controller.register_listener("north-code").await.unwrap();
    let south = controller.register_listener("south-code").await.unwrap();

    let on_one = controller
        .gateway()
        .submit(payload(1, 100, 1_700_000_000))
        .await
        .unwrap();
    let on_two = controller
        .gateway()
        .submit(payload(2, 200, 1_700_000_000))
        .await
        .unwrap();

    assert_eq!(north.next().await.unwrap().id, on_one.call.id);
    assert_eq!(south.next().await.unwrap().id, on_two.call.id);

    controller.shutdown().await;
    // Streams end cleanly with nothing cross-delivered.
    assert!(north.next().await.is_none());
    assert!(south.next().await.is_none());
}

#[tokio::test]
async fn duplicate_submission_fans_out_once() {
    let dir = tempfile::tempdir().unwrap();
    let controller = Controller::start(config_in(&dir)).await.unwrap();

    add_code(&controller, "watch", 1).await;
    let client = controller.register_listener("watch-code").await.unwrap();

    let first = controller
        .gateway()
        .submit(payload(1, 10, 1000))
        .await
        .unwrap();
    // Second receiver heard the same transmission one second later.
    let second = controller
        .gateway()
        .submit(payload(1, 10, 1001))
        .await
        .unwrap();
    assert!(second.deduplicated);

    let notice = client.next().await.unwrap();
    assert_eq!(notice.id, first.call.id);

    controller.shutdown().await;
    // Exactly one notice was ever delivered.
    assert!(client.next().await.is_none());
}

#[tokio::test]
async fn per_client_order_matches_arrival_order() {
    let dir = tempfile::tempdir().unwrap();
    let controller = Controller::start(config_in(&dir)).await.unwrap();

    add_code(&controller, "tail", 1).await;
    let client = controller.register_listener("tail-code").await.unwrap();

    let mut expected = Vec::new();
    for i in 0..5 {
        let persisted = controller
            .gateway()
            .submit(payload(1, 100, 1_700_000_000 + i * 60))
            .await
            .unwrap();
        expected.push(persisted.call.id);
    }

    for id in expected {
        assert_eq!(client.next().await.unwrap().id, id);
    }

    controller.shutdown().await;
}

// Transport is injectable, so federation can be exercised without a peer.
#[tokio::test]
async fn relay_receives_granted_calls() {
    use callrelay_dispatch::RelayManager;
    use callrelay_core::config::RelayConfig;
    use chrono::Utc;
    use uuid::Uuid;

    let manager = RelayManager::new(RelayConfig::default(), Arc::new(CountingTransport));
    manager.add_target(DownstreamTarget {
        ident: "peer".to_string(),
        url: "https://peer.example.org/upload".to_string(),
        api_key: "k".to_string(),
        grants: vec![Grant {
            system: 1,
            talkgroups: TalkgroupScope::List(vec![100]),
        }],
    });

    let call = Call {
        id: Uuid::new_v4(),
        system: 1,
        talkgroup: 100,
        units: vec![],
        start: Utc::now(),
        duration_secs: 1.0,
        audio_ref: "a.mp3".to_string(),
        audio_format: "mp3".to_string(),
        source: callrelay_core::IngestSource::Upload,
        archived_at: Utc::now(),
    };
    let off_grant = Call {
        talkgroup: 101,
        id: Uuid::new_v4(),
        ..call.clone()
    };

    let audio = Arc::new(vec![0u8; 4]);
    assert_eq!(manager.dispatch(&call, &audio), 1);
    assert_eq!(manager.dispatch(&off_grant, &audio), 0);

    manager.shutdown().await;
}
