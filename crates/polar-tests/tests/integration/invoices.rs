//! Tests for invoice creation across daemons.

use anyhow::Result;
use polar_core::{Error, Implementation, InvoiceRequest};
use polar_tests::Harness;
use serde_json::json;

const INVOICE: &str = "lnbcrt10n1pjq8test";

#[tokio::test]
async fn test_clightning_invoice_amount_in_msat() -> Result<()> {
    println!("\nTesting c-lightning invoice creation...");
    let harness = Harness::new()?;
    let dave = harness.node(Implementation::CLightning, "dave", 8084);
    harness.transport.respond("/v1/invoice", json!({ "bolt11": INVOICE }));
    let service = harness.factory.get_service(&dave);

    let invoice = service.create_invoice(&dave, &InvoiceRequest::new(1)).await?;
    assert_eq!(invoice, INVOICE);

    let body = harness.transport.last_json("/v1/invoice").unwrap();
    println!("  - request body: {body}");
    assert_eq!(body["amount_msat"], 1000);
    assert_eq!(body["description"], "Payment to dave");
    assert_eq!(body["expiry"], 3600);
    assert!(!body["label"].as_str().unwrap_or_default().is_empty());

    let request = harness.transport.requests_to("/v1/invoice").pop().unwrap();
    assert_eq!(request.headers.get("Rune").map(String::as_str), Some(polar_tests::RUNE));

    Ok(())
}

#[tokio::test]
async fn test_clightning_invoice_labels_are_unique() -> Result<()> {
    let harness = Harness::new()?;
    let dave = harness.node(Implementation::CLightning, "dave", 8084);
    harness.transport.respond("/v1/invoice", json!({ "bolt11": INVOICE }));
    let service = harness.factory.get_service(&dave);

    service.create_invoice(&dave, &InvoiceRequest::new(5)).await?;
    service.create_invoice(&dave, &InvoiceRequest::new(5)).await?;

    let labels: Vec<_> = harness
        .transport
        .requests_to("/v1/invoice")
        .into_iter()
        .map(|r| match r.body {
            polar_nodes::RequestBody::Json(json) => json["label"].clone(),
            _ => serde_json::Value::Null,
        })
        .collect();
    assert_ne!(labels[0], labels[1]);

    Ok(())
}

#[tokio::test]
async fn test_eclair_invoice_memo_passed_exactly() -> Result<()> {
    let harness = Harness::new()?;
    let carol = harness.node(Implementation::Eclair, "carol", 8083);
    harness
        .transport
        .respond("/createinvoice", json!({ "serialized": INVOICE }));
    let service = harness.factory.get_service(&carol);

    let request = InvoiceRequest::new(1)
        .with_memo("coffee & cake: 2x")
        .with_expiry(600);
    assert_eq!(service.create_invoice(&carol, &request).await?, INVOICE);

    let form = harness.transport.last_form("/createinvoice").unwrap();
    assert_eq!(form["amountMsat"], "1000");
    assert_eq!(form["description"], "coffee & cake: 2x");
    assert_eq!(form["expireIn"], "600");

    Ok(())
}

#[tokio::test]
async fn test_rust_lightning_invoice_amount_in_msat() -> Result<()> {
    let harness = Harness::with_config(|c| c.invoice_expiry_secs = 900)?;
    let erin = harness.node(Implementation::RustLightning, "erin", 8085);
    harness.transport.respond("/v1/receive", json!({ "invoice": INVOICE }));
    let service = harness.factory.get_service(&erin);

    assert_eq!(
        service.create_invoice(&erin, &InvoiceRequest::new(1)).await?,
        INVOICE
    );
    let body = harness.transport.last_json("/v1/receive").unwrap();
    assert_eq!(body["amount_msat"], 1000);
    assert_eq!(body["description"], "Payment to erin");
    assert_eq!(body["expiry_secs"], 900);

    Ok(())
}

#[tokio::test]
async fn test_rust_lightning_empty_invoice_is_shape_error() -> Result<()> {
    let harness = Harness::new()?;
    let erin = harness.node(Implementation::RustLightning, "erin", 8085);
    harness.transport.respond("/v1/receive", json!({ "invoice": "" }));

    let err = harness
        .factory
        .get_service(&erin)
        .create_invoice(&erin, &InvoiceRequest::new(1))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ResponseShape(_)));

    Ok(())
}

#[tokio::test]
async fn test_lnd_invoice_amount_in_sats() -> Result<()> {
    let harness = Harness::new()?;
    let alice = harness.node(Implementation::Lnd, "alice", 8081);
    harness
        .transport
        .respond("/v1/invoices", json!({ "payment_request": INVOICE }));
    let service = harness.factory.get_service(&alice);

    let request = InvoiceRequest::new(1).with_memo("rent");
    assert_eq!(service.create_invoice(&alice, &request).await?, INVOICE);

    let body = harness.transport.last_json("/v1/invoices").unwrap();
    assert_eq!(body["value"], "1");
    assert_eq!(body["memo"], "rent");
    assert_eq!(body["expiry"], "3600");

    Ok(())
}

#[tokio::test]
async fn test_empty_memo_falls_back_to_node_name() -> Result<()> {
    let harness = Harness::new()?;
    let alice = harness.node(Implementation::Litd, "alice", 8081);
    harness
        .transport
        .respond("/v1/invoices", json!({ "payment_request": INVOICE }));

    harness
        .factory
        .get_service(&alice)
        .create_invoice(&alice, &InvoiceRequest::new(10).with_memo(""))
        .await?;

    let body = harness.transport.last_json("/v1/invoices").unwrap();
    assert_eq!(body["memo"], "Payment to alice");

    Ok(())
}

#[tokio::test]
async fn test_overflowing_amount_is_rejected_before_sending() -> Result<()> {
    let harness = Harness::new()?;
    let dave = harness.node(Implementation::CLightning, "dave", 8084);

    let err = harness
        .factory
        .get_service(&dave)
        .create_invoice(&dave, &InvoiceRequest::new(u64::MAX))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)));
    assert!(harness.transport.requests().is_empty());

    Ok(())
}
