//! End-to-end synchronization through providers and the registry.

mod common;

use std::sync::Arc;
use std::time::Duration;

use yrs::{Doc, Map, Transact};

use common::{pair, wait_for};
use yrelay::provider::Provider;
use yrelay::registry::{Registry, RegistryOptions};
use yrelay::Awareness;
use yrelay::Transport;

fn map_string(doc: &Doc, key: &str) -> Option<String> {
    let map = doc.get_or_insert_map("map");
    let txn = doc.transact();
    map.get(&txn, key).and_then(|v| v.cast::<String>().ok())
}

fn map_number(doc: &Doc, key: &str) -> Option<f64> {
    let map = doc.get_or_insert_map("map");
    let txn = doc.transact();
    map.get(&txn, key).and_then(|v| v.cast::<f64>().ok())
}

fn registry(auto_clean_rooms: bool) -> Arc<Registry> {
    Arc::new(Registry::new(RegistryOptions {
        auto_clean_rooms,
        ..RegistryOptions::default()
    }))
}

/// Spawn a registry-side serve loop for a new in-memory connection.
fn connect(registry: &Arc<Registry>, path: &str) -> Arc<common::MemoryTransport> {
    let (client, server) = pair(path);
    let registry = registry.clone();
    tokio::spawn(async move { registry.serve(server).await });
    client
}

#[tokio::test]
async fn state_survives_a_disconnect_when_auto_clean_is_off() {
    let registry = registry(false);
    registry.start().await.unwrap();

    // client A writes one key, then leaves
    let doc_a = Doc::new();
    let provider_a = Provider::new(doc_a.clone(), connect(&registry, "/r"));
    provider_a.start().await.unwrap();
    {
        let map = doc_a.get_or_insert_map("map");
        let mut txn = doc_a.transact_mut();
        map.insert(&mut txn, "key", "value");
    }

    let room = registry.get_room("/r").await.unwrap();
    wait_for(|| map_string(room.doc(), "key").as_deref() == Some("value")).await;
    provider_a.stop().await.unwrap();

    // client B connects afterwards and still sees A's edit
    let doc_b = Doc::new();
    let provider_b = Provider::new(doc_b.clone(), connect(&registry, "/r"));
    provider_b.start().await.unwrap();
    wait_for(|| map_string(&doc_b, "key").as_deref() == Some("value")).await;

    provider_b.stop().await.unwrap();
    registry.stop().await.unwrap();
}

#[tokio::test]
async fn two_live_providers_converge() {
    let registry = registry(true);
    registry.start().await.unwrap();

    let doc_a = Doc::new();
    let provider_a = Provider::new(doc_a.clone(), connect(&registry, "/live"));
    provider_a.start().await.unwrap();

    let doc_b = Doc::new();
    let provider_b = Provider::new(doc_b.clone(), connect(&registry, "/live"));
    provider_b.start().await.unwrap();

    {
        let map = doc_a.get_or_insert_map("map");
        let mut txn = doc_a.transact_mut();
        map.insert(&mut txn, "from_a", "a");
    }
    {
        let map = doc_b.get_or_insert_map("map");
        let mut txn = doc_b.transact_mut();
        map.insert(&mut txn, "from_b", "b");
    }

    wait_for(|| {
        map_string(&doc_a, "from_b").is_some() && map_string(&doc_b, "from_a").is_some()
    })
    .await;

    provider_a.stop().await.unwrap();
    provider_b.stop().await.unwrap();
    registry.stop().await.unwrap();
}

#[tokio::test]
async fn echo_loop_between_two_peers() {
    let registry = registry(false);
    registry.start().await.unwrap();

    let doc_a = Doc::new();
    let provider_a = Provider::new(doc_a.clone(), connect(&registry, "/echo"));
    provider_a.start().await.unwrap();

    // peer B answers every `in = f` with `out = f + 1`; mutating inside an
    // observer callback is not allowed, so the observer only nudges a task
    let doc_b = Doc::new();
    let provider_b = Provider::new(doc_b.clone(), connect(&registry, "/echo"));
    provider_b.start().await.unwrap();
    let (nudge_tx, mut nudge_rx) = tokio::sync::mpsc::channel::<()>(64);
    let _sub = doc_b
        .observe_update_v1(move |_txn, _event| {
            let _ = nudge_tx.try_send(());
        })
        .unwrap();
    let responder_doc = doc_b.clone();
    let responder = tokio::spawn(async move {
        while nudge_rx.recv().await.is_some() {
            let input = map_number(&responder_doc, "in");
            if let Some(input) = input {
                if map_number(&responder_doc, "out") != Some(input + 1.0) {
                    let map = responder_doc.get_or_insert_map("map");
                    let mut txn = responder_doc.transact_mut();
                    map.insert(&mut txn, "out", input + 1.0);
                }
            }
        }
    });

    for i in 0..10 {
        let input = f64::from(i);
        {
            let map = doc_a.get_or_insert_map("map");
            let mut txn = doc_a.transact_mut();
            map.insert(&mut txn, "in", input);
        }
        wait_for(|| map_number(&doc_a, "out") == Some(input + 1.0)).await;
    }

    provider_a.stop().await.unwrap();
    provider_b.stop().await.unwrap();
    responder.abort();
    registry.stop().await.unwrap();
}

#[tokio::test]
async fn providers_can_attach_a_local_awareness() {
    let registry = registry(false);
    registry.start().await.unwrap();

    let presence = Arc::new(Awareness::new(99));
    let doc = Doc::new();
    let provider = Provider::new(doc, connect(&registry, "/aw")).with_awareness(presence.clone());
    provider.start().await.unwrap();

    // another client announces itself with a raw awareness frame
    let other = connect(&registry, "/aw");
    let announced = Awareness::new(7);
    announced.set_local_state(serde_json::json!({"name": "seven"}));
    let frame =
        yrelay::protocol::create_awareness(&announced.encode_update(&[7]).unwrap());
    // wait out the handshake so the room has both clients registered
    tokio::time::sleep(Duration::from_millis(100)).await;
    other.send(frame).await.unwrap();

    wait_for(|| presence.states().contains_key(&7)).await;
    assert_eq!(
        presence.states().get(&7),
        Some(&serde_json::json!({"name": "seven"}))
    );

    provider.stop().await.unwrap();
    registry.stop().await.unwrap();
}
