//! Tests for service selection by implementation kind.

use std::sync::Arc;

use anyhow::Result;
use polar_core::{Implementation, LightningNode};
use polar_nodes::{ServiceKind, resolve};
use polar_tests::Harness;

#[tokio::test]
async fn test_factory_returns_same_service_for_every_call() -> Result<()> {
    println!("\nTesting service referential stability...");
    let harness = Harness::new()?;

    for (rest, implementation) in (8081..).zip(Implementation::all().iter().copied()) {
        let alice = harness.node(implementation, "alice", rest);
        let bob = harness.node(implementation, "bob", rest + 100);

        let first = harness.factory.get_service(&alice);
        let second = harness.factory.get_service(&alice);
        let other_node = harness.factory.get_service(&bob);

        println!("  - {implementation}");
        assert!(Arc::ptr_eq(&first, &second));
        assert!(Arc::ptr_eq(&first, &other_node));
        assert!(first.kind().accepts(implementation));
    }

    Ok(())
}

#[tokio::test]
async fn test_lnd_and_litd_share_one_service() -> Result<()> {
    let harness = Harness::new()?;

    let lnd = harness.factory.service_for(Implementation::Lnd);
    let litd = harness.factory.service_for(Implementation::Litd);
    let eclair = harness.factory.service_for(Implementation::Eclair);

    assert!(Arc::ptr_eq(&lnd, &litd));
    assert!(!Arc::ptr_eq(&lnd, &eclair));
    assert_eq!(litd.kind(), ServiceKind::Lnd);

    Ok(())
}

#[tokio::test]
async fn test_unknown_implementation_is_rejected() -> Result<()> {
    println!("\nTesting an unregistered implementation kind...");
    let harness = Harness::new()?;
    let mut json = serde_json::to_value(harness.node(Implementation::Lnd, "alice", 8081))?;
    json["implementation"] = "tapd".into();

    // Rejected the same way every time, never mapped to a fallback service.
    for _ in 0..3 {
        let parsed = serde_json::from_value::<LightningNode>(json.clone());
        assert!(parsed.is_err());

        let kind = "tapd".parse::<Implementation>();
        assert!(kind.is_err_and(|e| e.to_string().contains("tapd")));
    }

    Ok(())
}

#[tokio::test]
async fn test_service_rejects_node_of_other_kind() -> Result<()> {
    let harness = Harness::new()?;
    let eclair_node = harness.node(Implementation::Eclair, "carol", 8083);

    let lnd = harness.factory.service_for(Implementation::Lnd);
    let err = lnd.get_info(&eclair_node).await.unwrap_err();

    assert!(matches!(err, polar_core::Error::Configuration(_)));
    assert!(harness.transport.requests().is_empty());

    let config = polar_core::Config {
        data_dir: harness.dir.path().to_path_buf(),
        ..polar_core::Config::default()
    };
    assert!(resolve(ServiceKind::CLightning, &eclair_node, &config).is_err());

    Ok(())
}
