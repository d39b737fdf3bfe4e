mod common;

use bytes::Bytes;
use common::open_store;
use relay::storage::{Direction, Lookup};
use relay::{InMemoryBackend, RelayError, Sequencer};
use std::collections::BTreeSet;
use std::sync::Arc;
use tempfile::TempDir;

async fn connected_sequencer(temp: &TempDir) -> (Arc<Sequencer<InMemoryBackend>>, InMemoryBackend) {
    let backend = InMemoryBackend::new();
    let sequencer = Sequencer::new(open_store(temp.path()), Arc::new(backend.clone()), None).unwrap();
    sequencer.reconnect().await.unwrap();
    (Arc::new(sequencer), backend)
}

#[tokio::test]
async fn test_publish_stages_one_record() {
    let temp = TempDir::new().unwrap();
    let store = open_store(temp.path());
    let backend = InMemoryBackend::new();
    let sequencer = Sequencer::new(Arc::clone(&store), Arc::new(backend.clone()), None).unwrap();
    sequencer.reconnect().await.unwrap();

    let sequence = sequencer
        .publish("x1", "rk1", Bytes::from("hello"))
        .await
        .unwrap();
    assert_eq!(sequence, 1);

    let mut cursor = store.begin().unwrap();
    assert_eq!(cursor.get(1).unwrap(), Lookup::Found);
    let staged = cursor.message().unwrap();
    assert_eq!(staged.exchange, "x1");
    assert_eq!(staged.routing_key, "rk1");
    assert_eq!(staged.payload, Bytes::from("hello"));
    assert_eq!(cursor.sibling(Direction::Next).unwrap(), Lookup::NotFound);
    cursor.end(false).unwrap();

    // the first publish on a connection carries tag 1
    sequencer.confirm(1, &[1]).await.unwrap();
    assert_eq!(store.count().unwrap(), 0);
}

#[tokio::test]
async fn test_replay_skips_acknowledged_records() {
    let temp = TempDir::new().unwrap();
    let (sequencer, backend) = connected_sequencer(&temp).await;

    for payload in ["m1", "m2", "m3"] {
        sequencer.publish("x1", "rk1", Bytes::from(payload)).await.unwrap();
    }
    sequencer.confirm(1, &[2]).await.unwrap();

    backend.drop_connection().await;
    sequencer.on_connection_lost().await;
    backend.drain_published().await;

    assert_eq!(sequencer.reconnect().await.unwrap(), 2);
    let replayed = backend.drain_published().await;
    let payloads: Vec<_> = replayed.iter().map(|p| p.payload.clone()).collect();
    assert_eq!(payloads, vec![Bytes::from("m1"), Bytes::from("m3")]);

    // fresh tags on the new connection map back to sequences 1 and 3
    sequencer.confirm(2, &[1, 2]).await.unwrap();
    assert_eq!(sequencer.staged_count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_stale_tags_after_loss_are_ignored() {
    let temp = TempDir::new().unwrap();
    let (sequencer, backend) = connected_sequencer(&temp).await;

    sequencer.publish("x1", "rk1", Bytes::from("m1")).await.unwrap();
    backend.drop_connection().await;
    sequencer.on_connection_lost().await;

    // tag 1 belonged to the dropped connection
    sequencer.confirm(1, &[1]).await.unwrap();
    assert_eq!(sequencer.staged_count().await.unwrap(), 1);

    // still stale once the replay reused tag 1 on connection 2
    assert_eq!(sequencer.reconnect().await.unwrap(), 1);
    sequencer.confirm(1, &[1]).await.unwrap();
    assert_eq!(sequencer.staged_count().await.unwrap(), 1);

    sequencer.confirm(2, &[1]).await.unwrap();
    assert_eq!(sequencer.staged_count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_restart_replays_everything_in_order() {
    let temp = TempDir::new().unwrap();
    {
        let (sequencer, _backend) = connected_sequencer(&temp).await;
        for i in 1..=10 {
            sequencer
                .publish("x1", "rk1", Bytes::from(format!("m{}", i)))
                .await
                .unwrap();
        }
        // process dies without seeing a single ack
    }

    let backend = InMemoryBackend::new();
    let sequencer = Sequencer::new(open_store(temp.path()), Arc::new(backend.clone()), None).unwrap();
    assert_eq!(sequencer.reconnect().await.unwrap(), 10);

    let replayed = backend.published().await;
    let expected: Vec<_> = (1..=10).map(|i| Bytes::from(format!("m{}", i))).collect();
    let payloads: Vec<_> = replayed.iter().map(|p| p.payload.clone()).collect();
    assert_eq!(payloads, expected);
    let tags: Vec<_> = replayed.iter().map(|p| p.tag).collect();
    assert_eq!(tags, (1..=10).collect::<Vec<u64>>());
}

#[tokio::test]
async fn test_concurrent_publishes_are_gap_free() {
    let temp = TempDir::new().unwrap();
    let (sequencer, _backend) = connected_sequencer(&temp).await;

    let mut tasks = Vec::new();
    for task in 0..8 {
        let sequencer = Arc::clone(&sequencer);
        tasks.push(tokio::spawn(async move {
            let mut mine = Vec::new();
            for i in 0..25 {
                let payload = Bytes::from(format!("{}-{}", task, i));
                mine.push(sequencer.publish("x1", "rk1", payload).await.unwrap());
            }
            mine
        }));
    }

    let mut all = BTreeSet::new();
    for task in tasks {
        let mine = task.await.unwrap();
        assert!(mine.windows(2).all(|w| w[0] < w[1]));
        all.extend(mine);
    }
    assert_eq!(all, (1..=200).collect::<BTreeSet<u64>>());
    assert_eq!(sequencer.staged_count().await.unwrap(), 200);
}

#[tokio::test]
async fn test_store_busy_surfaces_as_store_error() {
    let temp = TempDir::new().unwrap();
    let store = open_store(temp.path());
    let backend = InMemoryBackend::new();
    let sequencer = Sequencer::new(Arc::clone(&store), Arc::new(backend), None).unwrap();
    sequencer.reconnect().await.unwrap();

    let held = store.begin().unwrap();
    let result = sequencer.publish("x1", "rk1", Bytes::from("m")).await;
    assert!(matches!(result, Err(RelayError::Store(_))));
    held.end(false).unwrap();

    // the failed publish did not burn a sequence
    assert_eq!(
        sequencer.publish("x1", "rk1", Bytes::from("m")).await.unwrap(),
        1
    );
}
