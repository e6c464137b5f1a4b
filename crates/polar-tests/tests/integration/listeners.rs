//! Tests for the per-node streaming listener cache.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use polar_core::{ChannelEvent, EndpointKey, Error, Implementation};
use polar_nodes::{ChannelEventCallback, ListenerCache, StreamTarget};
use polar_tests::{Harness, MockConnector, eventually};

fn target(url: &str) -> StreamTarget {
    StreamTarget {
        url: url.to_string(),
        headers: BTreeMap::new(),
        attempts: 1,
        opening_message: None,
    }
}

const fn key(network_id: u32, port: u16) -> EndpointKey {
    EndpointKey { network_id, port }
}

fn recorder() -> (ChannelEventCallback, Arc<Mutex<Vec<ChannelEvent>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let callback: ChannelEventCallback = Arc::new(move |event| sink.lock().unwrap().push(event));
    (callback, seen)
}

#[tokio::test]
async fn test_concurrent_get_listener_creates_one_connection() -> Result<()> {
    println!("\nTesting concurrent listener creation for one key...");
    let connector = MockConnector::with_delay(Duration::from_millis(30));
    let cache = ListenerCache::new(connector.clone());
    let target = target("ws://127.0.0.1:8081/ws");

    let handles = futures::future::join_all(
        (0..10).map(|_| cache.get_listener(key(1, 8081), &target)),
    )
    .await
    .into_iter()
    .collect::<polar_core::Result<Vec<_>>>()?;

    println!("  - {} callers, {} connections", handles.len(), connector.created());
    assert_eq!(connector.created(), 1);
    assert!(handles.iter().all(|h| h.id() == handles[0].id()));
    assert_eq!(cache.len(), 1);

    Ok(())
}

#[tokio::test]
async fn test_remove_then_get_creates_fresh_connection() -> Result<()> {
    let connector = MockConnector::new();
    let cache = ListenerCache::new(connector.clone());
    let target = target("ws://127.0.0.1:8081/ws");

    let first = cache.get_listener(key(1, 8081), &target).await?;
    cache.remove_listener(key(1, 8081)).await;
    assert!(!first.is_connected());
    assert!(!cache.contains(key(1, 8081)).await);

    let second = cache.get_listener(key(1, 8081), &target).await?;
    assert_ne!(first.id(), second.id());
    assert!(second.is_connected());
    assert_eq!(connector.created(), 2);
    assert_eq!(connector.disconnected(), 1);

    // Removing an absent key is a no-op.
    cache.remove_listener(key(9, 9999)).await;
    assert_eq!(cache.len(), 1);

    Ok(())
}

#[tokio::test]
async fn test_dropped_connection_is_replaced() -> Result<()> {
    let connector = MockConnector::new();
    let cache = ListenerCache::new(connector.clone());
    let target = target("ws://127.0.0.1:8081/ws");

    let first = cache.get_listener(key(1, 8081), &target).await?;
    assert!(cache.contains(key(1, 8081)).await);

    connector.last().unwrap().close();
    assert!(!first.is_connected());

    let second = cache.get_listener(key(1, 8081), &target).await?;
    assert_ne!(first.id(), second.id());
    assert_eq!(connector.created(), 2);

    Ok(())
}

#[tokio::test]
async fn test_clear_all_during_creation_discards_new_connection() -> Result<()> {
    println!("\nTesting eviction while a connection is being opened...");
    let connector = MockConnector::with_delay(Duration::from_millis(50));
    let cache = Arc::new(ListenerCache::new(connector.clone()));

    let creating = {
        let cache = Arc::clone(&cache);
        tokio::spawn(async move {
            cache
                .get_listener(key(1, 8081), &target("ws://127.0.0.1:8081/ws"))
                .await
        })
    };
    assert!(eventually(|| connector.attempts() == 1).await);
    cache.clear_all().await;

    let result = creating.await?;
    println!("  - creation result: {result:?}");
    assert!(matches!(result, Err(Error::Transport(_))));
    assert_eq!(connector.created(), 1);
    assert_eq!(connector.disconnected(), 1);
    assert!(cache.is_empty());

    Ok(())
}

#[tokio::test]
async fn test_same_port_on_different_networks_is_distinct() -> Result<()> {
    let connector = MockConnector::new();
    let cache = ListenerCache::new(connector.clone());

    let one = cache
        .get_listener(key(1, 8081), &target("ws://127.0.0.1:8081/ws"))
        .await?;
    let two = cache
        .get_listener(key(2, 8081), &target("ws://127.0.0.1:8081/ws"))
        .await?;

    assert_ne!(one.id(), two.id());
    assert_eq!(connector.created(), 2);

    cache.remove_listener(key(1, 8081)).await;
    assert!(!one.is_connected());
    assert!(two.is_connected());

    Ok(())
}

#[tokio::test]
async fn test_failed_connect_leaves_no_listener() -> Result<()> {
    let connector = MockConnector::new();
    connector.refuse(true);
    let cache = ListenerCache::new(connector.clone());
    let target = target("ws://127.0.0.1:8081/ws");

    let err = cache.get_listener(key(1, 8081), &target).await.unwrap_err();
    assert!(err.is_retryable());
    assert!(!cache.contains(key(1, 8081)).await);
    assert!(cache.is_empty());

    for port in 9000..9010 {
        assert!(cache.get_listener(key(1, port), &target).await.is_err());
    }
    assert!(cache.is_empty());

    connector.refuse(false);
    assert!(cache.get_listener(key(1, 8081), &target).await.is_ok());
    assert_eq!(connector.attempts(), 12);
    assert_eq!(cache.len(), 1);

    Ok(())
}

#[tokio::test]
async fn test_lnd_listener_uses_websocket_proxy() -> Result<()> {
    println!("\nTesting LND channel event listener...");
    let harness = Harness::new()?;
    let alice = harness.node(Implementation::Lnd, "alice", 8081);
    let service = harness.factory.get_service(&alice);

    service.add_listener_to_node(&alice).await?;
    service.add_listener_to_node(&alice).await?;
    assert_eq!(harness.connector.created(), 1);

    let connection = harness.connector.last().unwrap();
    assert_eq!(
        connection.target.url,
        "wss://127.0.0.1:8081/v1/channels/subscribe?method=GET"
    );
    assert_eq!(
        connection.target.headers.get("Grpc-Metadata-macaroon").map(String::as_str),
        Some(hex_macaroon().as_str())
    );
    assert_eq!(connection.target.opening_message.as_deref(), Some("{}"));

    service.remove_listener(&alice).await?;
    assert!(!connection.is_open());
    assert!(!harness.factory.listeners().contains(alice.endpoint_key()).await);

    Ok(())
}

fn hex_macaroon() -> String {
    hex::encode(polar_tests::MACAROON)
}

#[tokio::test]
async fn test_lnd_subscription_forwards_channel_events() -> Result<()> {
    let harness = Harness::new()?;
    let alice = harness.node(Implementation::Lnd, "alice", 8081);
    let service = harness.factory.get_service(&alice);
    let (callback, seen) = recorder();

    service.subscribe_channel_events(&alice, callback).await?;
    let connection = harness.connector.last().unwrap();
    connection.push(r#"{"result":{"type":"PENDING_OPEN_CHANNEL"}}"#);
    connection.push("not json");
    connection.push(r#"{"result":{"type":"OPEN_CHANNEL"}}"#);
    connection.push(r#"{"result":{"type":"FULLY_RESOLVED_CHANNEL"}}"#);

    assert!(eventually(|| seen.lock().unwrap().len() == 3).await);
    assert_eq!(
        *seen.lock().unwrap(),
        vec![ChannelEvent::Pending, ChannelEvent::Open, ChannelEvent::Closed]
    );

    Ok(())
}

#[tokio::test]
async fn test_eclair_subscription_ignores_other_events() -> Result<()> {
    let harness = Harness::new()?;
    let carol = harness.node(Implementation::Eclair, "carol", 8083);
    let service = harness.factory.get_service(&carol);
    let (callback, seen) = recorder();

    service.subscribe_channel_events(&carol, callback).await?;
    let connection = harness.connector.last().unwrap();
    assert_eq!(connection.target.url, "ws://127.0.0.1:8083/ws");
    assert!(connection.target.headers["Authorization"].starts_with("Basic "));

    connection.push(r#"{"type":"payment-received"}"#);
    connection.push(r#"{"type":"channel-opened","channelId":"ab"}"#);

    assert!(eventually(|| !seen.lock().unwrap().is_empty()).await);
    assert_eq!(*seen.lock().unwrap(), vec![ChannelEvent::Open]);

    Ok(())
}

#[tokio::test]
async fn test_clightning_listener_operations_are_unsupported() -> Result<()> {
    let harness = Harness::new()?;
    let dave = harness.node(Implementation::CLightning, "dave", 8084);
    let service = harness.factory.get_service(&dave);
    let (callback, _) = recorder();

    assert!(service.add_listener_to_node(&dave).await.unwrap_err().is_unsupported());
    assert!(service.remove_listener(&dave).await.unwrap_err().is_unsupported());
    assert!(
        service
            .subscribe_channel_events(&dave, callback)
            .await
            .unwrap_err()
            .is_unsupported()
    );
    assert_eq!(harness.connector.attempts(), 0);

    Ok(())
}
