//! Tests for normalized values and error mapping across daemons.

use anyhow::Result;
use polar_core::{Balances, Config, Error, Implementation, LightningNode, NodePorts};
use polar_nodes::{ServiceKind, resolve};
use polar_tests::{Harness, Reply};
use serde_json::json;

const BOB: &str = "02b0b0b0b0";
const INVOICE: &str = "lnbcrt50n1pjq8test";

#[tokio::test]
async fn test_clightning_balances_in_sats() -> Result<()> {
    println!("\nTesting c-lightning balance normalization...");
    let harness = Harness::new()?;
    let dave = harness.node(Implementation::CLightning, "dave", 8084);
    harness.transport.respond(
        "/v1/listfunds",
        json!({
            "outputs": [
                { "amount_msat": 150_000_000, "status": "confirmed" },
                { "amount_msat": 50_000_000, "status": "unconfirmed" },
            ],
            "channels": [
                { "state": "CHANNELD_NORMAL", "our_amount_msat": 30_000_000 },
                { "state": "CHANNELD_AWAITING_LOCKIN", "our_amount_msat": 1_000 },
            ],
        }),
    );

    let balances = harness.factory.get_service(&dave).get_balances(&dave).await?;
    println!("  - balances: {balances:?}");
    assert_eq!(balances, Balances::from_sats(200_000, 150_000, 50_000, 30_000));

    Ok(())
}

#[tokio::test]
async fn test_rust_lightning_balances() -> Result<()> {
    let harness = Harness::new()?;
    let erin = harness.node(Implementation::RustLightning, "erin", 8085);
    harness.transport.respond(
        "/v1/balances",
        json!({
            "total_onchain_balance_sats": 300_000,
            "spendable_onchain_balance_sats": 250_000,
            "total_anchor_channels_reserve_sats": 25_000,
            "total_lightning_balance_sats": 40_000,
        }),
    );

    let balances = harness.factory.get_service(&erin).get_balances(&erin).await?;
    assert_eq!(balances.total, "300000");
    assert_eq!(balances.confirmed, "250000");
    assert_eq!(balances.unconfirmed, "50000");
    assert_eq!(balances.channel, "40000");

    Ok(())
}

#[tokio::test]
async fn test_lnd_balances_accept_string_amounts() -> Result<()> {
    let harness = Harness::new()?;
    let alice = harness.node(Implementation::Lnd, "alice", 8081);
    harness.transport.respond(
        "/v1/balance/blockchain",
        json!({ "total_balance": "1000", "confirmed_balance": "800", "unconfirmed_balance": "200" }),
    );
    harness.transport.respond(
        "/v1/balance/channels",
        json!({ "balance": "1", "local_balance": { "sat": "500", "msat": "500000" } }),
    );

    let balances = harness.factory.get_service(&alice).get_balances(&alice).await?;
    assert_eq!(balances, Balances::from_sats(1000, 800, 200, 500));

    Ok(())
}

#[tokio::test]
async fn test_empty_address_is_shape_error() -> Result<()> {
    println!("\nTesting empty new-address replies...");
    let harness = Harness::new()?;
    let erin = harness.node(Implementation::RustLightning, "erin", 8085);
    let dave = harness.node(Implementation::CLightning, "dave", 8084);
    let carol = harness.node(Implementation::Eclair, "carol", 8083);
    harness.transport.respond("/v1/new_address", json!({}));
    harness.transport.respond("/v1/newaddr", json!({ "bech32": "" }));
    harness.transport.respond("/getnewaddress", json!(""));

    for node in [&erin, &dave, &carol] {
        let err = harness
            .factory
            .get_service(node)
            .get_new_address(node)
            .await
            .unwrap_err();
        println!("  - {}: {err}", node.implementation);
        assert!(matches!(err, Error::ResponseShape(_)));
    }

    harness
        .transport
        .respond("/v1/new_address", json!({ "address": "bcrt1qerin" }));
    let address = harness.factory.get_service(&erin).get_new_address(&erin).await?;
    assert_eq!(address.address, "bcrt1qerin");

    Ok(())
}

#[tokio::test]
async fn test_daemon_error_payload_is_protocol_error() -> Result<()> {
    let harness = Harness::new()?;
    let dave = harness.node(Implementation::CLightning, "dave", 8084);
    let carol = harness.node(Implementation::Eclair, "carol", 8083);
    harness.transport.respond_status(
        "/v1/getinfo",
        500,
        json!({ "code": -32602, "message": "rune does not allow getinfo" }),
    );
    harness
        .transport
        .respond_status("/getinfo", 400, json!({ "error": "invalid password" }));

    let err = harness.factory.get_service(&dave).get_info(&dave).await.unwrap_err();
    match err {
        Error::Protocol { code, message } => {
            assert_eq!(code, "-32602");
            assert_eq!(message, "rune does not allow getinfo");
        }
        other => panic!("expected protocol error, got {other:?}"),
    }

    let err = harness.factory.get_service(&carol).get_info(&carol).await.unwrap_err();
    assert!(matches!(err, Error::Protocol { ref code, .. } if code == "400"));
    assert!(!err.is_retryable());

    Ok(())
}

#[tokio::test]
async fn test_unreachable_daemon_is_transport_error() -> Result<()> {
    let harness = Harness::new()?;
    let erin = harness.node(Implementation::RustLightning, "erin", 8085);
    harness.transport.unreachable("/v1/node_id");

    let err = harness.factory.get_service(&erin).get_info(&erin).await.unwrap_err();
    assert!(matches!(err, Error::Transport(_)));
    assert!(err.is_retryable());

    Ok(())
}

#[tokio::test]
async fn test_missing_credentials_fail_before_any_request() -> Result<()> {
    let harness = Harness::new()?;
    let bare = LightningNode::new(
        1,
        "frank",
        Implementation::CLightning,
        NodePorts {
            rest: 8086,
            grpc: None,
            p2p: 9735,
            web: None,
        },
    );

    // Configuration errors are not retried while waiting for the node.
    let err = harness
        .factory
        .get_service(&bare)
        .wait_until_online(&bare)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Configuration(_)));
    assert!(err.to_string().contains("rune"));
    assert!(harness.transport.requests().is_empty());

    Ok(())
}

#[tokio::test]
async fn test_rust_lightning_unsupported_operations() -> Result<()> {
    let harness = Harness::new()?;
    let erin = harness.node(Implementation::RustLightning, "erin", 8085);
    let service = harness.factory.get_service(&erin);

    let channels = service.get_channels(&erin).await.unwrap_err();
    let decode = service.decode_invoice(&erin, INVOICE).await.unwrap_err();
    let listener = service.add_listener_to_node(&erin).await.unwrap_err();

    assert!(channels.is_unsupported());
    assert!(decode.is_unsupported());
    assert!(listener.is_unsupported());
    assert!(decode.to_string().contains("rustlightning"));

    // Nothing to tear down, but removing stays safe.
    service.remove_listener(&erin).await?;
    assert!(harness.transport.requests().is_empty());
    assert_eq!(harness.connector.attempts(), 0);

    Ok(())
}

fn payment(extra: serde_json::Value) -> serde_json::Value {
    let mut details = json!({
        "id": "ff01",
        "direction": "Outbound",
        "status": "Succeeded",
        "amount_msat": 5_000,
        "kind": "Bolt11",
        "fee_paid_msat": 0,
    });
    if let (Some(details), Some(extra)) = (details.as_object_mut(), extra.as_object()) {
        details.extend(extra.clone());
    }
    details
}

#[tokio::test]
async fn test_rust_lightning_pay_receipt() -> Result<()> {
    println!("\nTesting rust-lightning payment receipts...");
    let harness = Harness::new()?;
    let erin = harness.node(Implementation::RustLightning, "erin", 8085);
    harness.transport.respond("/v1/pay", json!({ "payment_id": "ff01" }));
    harness.transport.respond(
        "/v1/payment",
        payment(json!({ "preimage": "abcd", "counterparty_node_id": BOB })),
    );

    let receipt = harness
        .factory
        .get_service(&erin)
        .pay_invoice(&erin, INVOICE, None)
        .await?;
    println!("  - receipt: {receipt:?}");
    assert_eq!(receipt.preimage, "abcd");
    assert_eq!(receipt.amount, 5);
    assert_eq!(receipt.destination, BOB);
    assert_eq!(
        harness.transport.last_json("/v1/payment").unwrap(),
        json!({ "payment_id": "ff01" })
    );

    Ok(())
}

#[tokio::test]
async fn test_rust_lightning_pay_waits_for_pending_payment() -> Result<()> {
    let harness = Harness::new()?;
    let erin = harness.node(Implementation::RustLightning, "erin", 8085);
    harness.transport.respond("/v1/pay", json!({ "payment_id": "ff01" }));
    harness.transport.script(
        "/v1/payment",
        vec![
            Reply::Json(200, payment(json!({ "status": "Pending" }))),
            Reply::Json(
                200,
                payment(json!({ "preimage": "abcd", "counterparty_node_id": BOB })),
            ),
        ],
    );

    let receipt = harness
        .factory
        .get_service(&erin)
        .pay_invoice(&erin, INVOICE, None)
        .await?;
    assert_eq!(receipt.preimage, "abcd");
    assert_eq!(receipt.destination, BOB);
    assert_eq!(harness.transport.requests_to("/v1/payment").len(), 2);

    Ok(())
}

#[tokio::test]
async fn test_rust_lightning_pay_without_details_is_shape_error() -> Result<()> {
    let harness = Harness::new()?;
    let erin = harness.node(Implementation::RustLightning, "erin", 8085);
    harness
        .transport
        .respond("/v1/pay_using_amount", json!({ "payment_id": "ff01" }));
    harness.transport.respond("/v1/payment", payment(json!({})));

    let err = harness
        .factory
        .get_service(&erin)
        .pay_invoice(&erin, INVOICE, Some(7))
        .await
        .unwrap_err();

    // The payment went out, so the error names it instead of inventing values.
    let message = err.to_string();
    assert!(matches!(err, Error::ResponseShape(_)));
    assert!(message.contains("ff01"));
    assert!(message.contains("preimage"));
    assert!(message.contains("counterparty_node_id"));
    assert_eq!(
        harness.transport.last_json("/v1/pay_using_amount").unwrap(),
        json!({ "invoice": INVOICE, "amount_msat": 7_000 })
    );

    Ok(())
}

#[tokio::test]
async fn test_rust_lightning_failed_payment_is_protocol_error() -> Result<()> {
    let harness = Harness::new()?;
    let erin = harness.node(Implementation::RustLightning, "erin", 8085);
    harness.transport.respond("/v1/pay", json!({ "payment_id": "ff01" }));
    harness
        .transport
        .respond("/v1/payment", payment(json!({ "status": "Failed" })));

    let err = harness
        .factory
        .get_service(&erin)
        .pay_invoice(&erin, INVOICE, None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Protocol { .. }));

    Ok(())
}

#[tokio::test]
async fn test_lnd_pay_receipt_converts_preimage() -> Result<()> {
    let harness = Harness::new()?;
    let alice = harness.node(Implementation::Lnd, "alice", 8081);
    harness.transport.respond(
        "/v1/channels/transactions",
        json!({
            "payment_error": "",
            "payment_preimage": "q80=",
            "payment_route": { "total_amt": "1010", "total_fees": "10" },
        }),
    );
    harness.transport.respond(
        &format!("/v1/payreq/{INVOICE}"),
        json!({ "payment_hash": "beef", "destination": BOB, "num_satoshis": "1000", "expiry": "3600" }),
    );

    let receipt = harness
        .factory
        .get_service(&alice)
        .pay_invoice(&alice, INVOICE, None)
        .await?;
    assert_eq!(receipt.preimage, "abcd");
    assert_eq!(receipt.amount, 1000);
    assert_eq!(receipt.destination, BOB);

    Ok(())
}

#[tokio::test]
async fn test_lnd_payment_error_is_protocol_error() -> Result<()> {
    let harness = Harness::new()?;
    let alice = harness.node(Implementation::Lnd, "alice", 8081);
    harness.transport.respond(
        "/v1/channels/transactions",
        json!({ "payment_error": "unable to find a path to destination" }),
    );

    let err = harness
        .factory
        .get_service(&alice)
        .pay_invoice(&alice, INVOICE, Some(10))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("unable to find a path"));
    assert_eq!(
        harness.transport.last_json("/v1/channels/transactions").unwrap()["amt"],
        "10"
    );

    Ok(())
}

#[tokio::test]
async fn test_eclair_failed_payment_reports_reason() -> Result<()> {
    let harness = Harness::new()?;
    let carol = harness.node(Implementation::Eclair, "carol", 8083);
    harness.transport.respond(
        "/payinvoice",
        json!({ "type": "payment-failed", "failures": [{ "t": "route not found" }] }),
    );

    let err = harness
        .factory
        .get_service(&carol)
        .pay_invoice(&carol, INVOICE, None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Protocol { ref message, .. } if message == "route not found"));
    assert_eq!(harness.transport.last_form("/payinvoice").unwrap()["blocking"], "true");

    Ok(())
}

#[tokio::test]
async fn test_clightning_info_and_decode() -> Result<()> {
    let harness = Harness::new()?;
    let dave = harness.node(Implementation::CLightning, "dave", 8084);
    harness.transport.respond(
        "/v1/getinfo",
        json!({ "id": BOB, "alias": "dave", "blockheight": 150, "num_active_channels": 2 }),
    );
    harness.transport.respond(
        "/v1/decode",
        json!({
            "type": "bolt11 invoice",
            "valid": true,
            "payment_hash": "beef",
            "amount_msat": 5_000,
            "payee": BOB,
            "expiry": 3600,
            "description": "coffee",
        }),
    );
    let service = harness.factory.get_service(&dave);

    let info = service.get_info(&dave).await?;
    assert_eq!(info.rpc_url, format!("{BOB}@dave:9735"));
    assert!(info.synced_to_chain);
    assert_eq!(info.block_height, 150);
    assert_eq!(info.num_active_channels, 2);

    let decoded = service.decode_invoice(&dave, INVOICE).await?;
    assert_eq!(decoded.amount_msat, 5_000);
    assert_eq!(decoded.destination, BOB);
    assert_eq!(decoded.description.as_deref(), Some("coffee"));

    Ok(())
}

#[tokio::test]
async fn test_lnd_info_prefers_advertised_uri() -> Result<()> {
    let harness = Harness::new()?;
    let alice = harness.node(Implementation::Lnd, "alice", 8081);
    harness.transport.respond(
        "/v1/getinfo",
        json!({
            "identity_pubkey": BOB,
            "alias": "alice",
            "uris": [format!("{BOB}@172.18.0.2:9735")],
            "synced_to_chain": true,
            "block_height": 212,
            "num_active_channels": 3,
            "num_pending_channels": 1,
            "num_inactive_channels": 0,
        }),
    );

    let info = harness.factory.get_service(&alice).get_info(&alice).await?;
    assert_eq!(info.pubkey, BOB);
    assert_eq!(info.alias, "alice");
    assert_eq!(info.rpc_url, format!("{BOB}@172.18.0.2:9735"));
    assert!(info.synced_to_chain);
    assert_eq!(info.block_height, 212);
    assert_eq!(info.num_active_channels, 3);
    assert_eq!(info.num_pending_channels, 1);

    Ok(())
}

#[tokio::test]
async fn test_eclair_info_counts_channels_by_state() -> Result<()> {
    let harness = Harness::new()?;
    let carol = harness.node(Implementation::Eclair, "carol", 8083);
    harness.transport.respond(
        "/getinfo",
        json!({ "nodeId": BOB, "alias": "carol", "blockHeight": 180 }),
    );
    harness.transport.respond(
        "/channels",
        json!([
            { "channelId": "c1", "state": "NORMAL" },
            { "channelId": "c2", "state": "NORMAL" },
            { "channelId": "c3", "state": "WAIT_FOR_FUNDING_CONFIRMED" },
            { "channelId": "c4", "state": "OFFLINE" },
        ]),
    );

    let info = harness.factory.get_service(&carol).get_info(&carol).await?;
    assert_eq!(info.rpc_url, format!("{BOB}@carol:9735"));
    assert_eq!(info.block_height, 180);
    assert_eq!(info.num_active_channels, 2);
    assert_eq!(info.num_pending_channels, 1);
    assert_eq!(info.num_inactive_channels, 1);

    Ok(())
}

#[tokio::test]
async fn test_rust_lightning_info() -> Result<()> {
    let harness = Harness::new()?;
    let erin = harness.node(Implementation::RustLightning, "erin", 8085);
    harness.transport.respond("/v1/node_id", json!({ "node_id": BOB }));
    harness.transport.respond(
        "/v1/status",
        json!({ "is_running": true, "is_listening": true, "best_block_height": 305 }),
    );
    harness.transport.respond(
        "/v1/listpeers",
        json!([
            { "node_id": "03ca0ca0ca", "address": "172.18.0.4:9735", "is_persisted": true, "is_connected": true },
            { "node_id": "03da0da0da", "address": "172.18.0.5:9735", "is_persisted": true, "is_connected": false },
        ]),
    );

    let info = harness.factory.get_service(&erin).get_info(&erin).await?;
    assert_eq!(info.pubkey, BOB);
    assert_eq!(info.alias, "erin");
    assert_eq!(info.rpc_url, format!("{BOB}@erin:9735"));
    assert!(info.synced_to_chain);
    assert_eq!(info.block_height, 305);
    assert_eq!(info.num_active_channels, 1);

    Ok(())
}

#[tokio::test]
async fn test_wait_until_online_returns_once_node_answers() -> Result<()> {
    let harness = Harness::new()?;
    let dave = harness.node(Implementation::CLightning, "dave", 8084);
    harness
        .transport
        .respond("/v1/getinfo", json!({ "id": BOB, "blockheight": 1 }));

    harness
        .factory
        .get_service(&dave)
        .wait_until_online(&dave)
        .await?;
    assert_eq!(harness.transport.requests_to("/v1/getinfo").len(), 1);

    Ok(())
}

#[tokio::test]
async fn test_wait_until_online_retries_unreachable_node() -> Result<()> {
    println!("\nTesting wait_until_online retry...");
    let harness = Harness::new()?;
    let dave = harness.node(Implementation::CLightning, "dave", 8084);
    harness.transport.script(
        "/v1/getinfo",
        vec![
            Reply::Unreachable("connection refused".into()),
            Reply::Json(200, json!({ "id": BOB, "blockheight": 1 })),
        ],
    );

    harness
        .factory
        .get_service(&dave)
        .wait_until_online(&dave)
        .await?;
    println!("  - online after {} attempts", harness.transport.requests_to("/v1/getinfo").len());
    assert_eq!(harness.transport.requests_to("/v1/getinfo").len(), 2);

    Ok(())
}

#[tokio::test]
async fn test_resolve_is_repeatable() -> Result<()> {
    let harness = Harness::new()?;
    let config = Config {
        data_dir: harness.dir.path().to_path_buf(),
        ..Config::default()
    };

    for (kind, implementation) in [
        (ServiceKind::Lnd, Implementation::Lnd),
        (ServiceKind::Lnd, Implementation::Litd),
        (ServiceKind::CLightning, Implementation::CLightning),
        (ServiceKind::Eclair, Implementation::Eclair),
        (ServiceKind::RustLightning, Implementation::RustLightning),
    ] {
        let node = harness.node(implementation, "alice", 8081);
        let first = resolve(kind, &node, &config)?;
        let second = resolve(kind, &node, &config)?;
        assert_eq!(first, second);
        assert!(first.url.ends_with(":8081"));
    }

    Ok(())
}
