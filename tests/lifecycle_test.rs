//! Invoice lifecycle integration tests.
//!
//! Covers the draft -> sent -> paid/overdue -> voided transitions and the
//! draft-only edit operations: manual items, item removal, and adjustments.
//!
//! Run with: ./scripts/integ-tests.sh

mod common;

use common::{date, dec, utc, TestApp};
use commons_billing::error::AppError;
use commons_billing::models::{AddManualLineItem, InvoiceStatus, InvoiceWithItems};
use uuid::Uuid;

/// Seed one completed usage session and generate a draft invoice for it.
async fn draft_invoice(app: &TestApp, user_id: Uuid) -> InvoiceWithItems {
    let resource = app.hourly_resource("Tile Saw", "8.00").await;
    app.completed_usage(
        resource.resource_id,
        user_id,
        utc(2026, 3, 3, 9, 0),
        utc(2026, 3, 3, 11, 0),
        None,
        None,
    )
    .await;

    app.generator
        .generate_for_user(user_id, date(2026, 3, 1), date(2026, 3, 31), None)
        .await
        .expect("Generation failed")
        .expect("Expected an invoice")
}

#[tokio::test]
#[ignore] // Requires database - run with integ-tests.sh
async fn draft_invoices_can_be_sent_once() {
    let app = TestApp::spawn().await;
    let generated = draft_invoice(&app, Uuid::new_v4()).await;

    let sent = app
        .db
        .mark_invoice_sent(generated.invoice.invoice_id)
        .await
        .expect("Send failed")
        .expect("Invoice missing");
    assert_eq!(sent.status(), InvoiceStatus::Sent);
    assert!(sent.sent_utc.is_some());

    let again = app.db.mark_invoice_sent(generated.invoice.invoice_id).await;
    assert!(matches!(again, Err(AppError::BadRequest(_))));

    app.cleanup().await;
}

#[tokio::test]
#[ignore]
async fn sending_an_unknown_invoice_returns_none() {
    let app = TestApp::spawn().await;

    let result = app
        .db
        .mark_invoice_sent(Uuid::new_v4())
        .await
        .expect("Send failed");
    assert!(result.is_none());

    app.cleanup().await;
}

#[tokio::test]
#[ignore]
async fn sent_invoices_can_be_marked_paid() {
    let app = TestApp::spawn().await;
    let generated = draft_invoice(&app, Uuid::new_v4()).await;
    let invoice_id = generated.invoice.invoice_id;

    app.db
        .mark_invoice_sent(invoice_id)
        .await
        .expect("Send failed");

    let paid = app
        .db
        .mark_invoice_paid(invoice_id)
        .await
        .expect("Payment failed")
        .expect("Invoice missing");
    assert_eq!(paid.status(), InvoiceStatus::Paid);
    assert!(paid.paid_utc.is_some());

    app.cleanup().await;
}

#[tokio::test]
#[ignore]
async fn draft_invoices_cannot_be_marked_paid() {
    let app = TestApp::spawn().await;
    let generated = draft_invoice(&app, Uuid::new_v4()).await;

    let result = app.db.mark_invoice_paid(generated.invoice.invoice_id).await;
    assert!(matches!(result, Err(AppError::BadRequest(_))));

    app.cleanup().await;
}

#[tokio::test]
#[ignore]
async fn overdue_invoices_can_be_marked_paid() {
    let app = TestApp::spawn().await;
    let generated = draft_invoice(&app, Uuid::new_v4()).await;
    let invoice_id = generated.invoice.invoice_id;

    app.db
        .mark_invoice_sent(invoice_id)
        .await
        .expect("Send failed");
    // Due 2026-04-30; a sweep well past that moves it to overdue.
    let swept = app
        .db
        .mark_overdue_invoices(date(2026, 6, 1))
        .await
        .expect("Sweep failed");
    assert_eq!(swept.len(), 1);
    assert_eq!(swept[0].status(), InvoiceStatus::Overdue);

    let paid = app
        .db
        .mark_invoice_paid(invoice_id)
        .await
        .expect("Payment failed")
        .expect("Invoice missing");
    assert_eq!(paid.status(), InvoiceStatus::Paid);

    app.cleanup().await;
}

#[tokio::test]
#[ignore]
async fn paid_invoices_cannot_be_voided() {
    let app = TestApp::spawn().await;
    let generated = draft_invoice(&app, Uuid::new_v4()).await;
    let invoice_id = generated.invoice.invoice_id;

    app.db
        .mark_invoice_sent(invoice_id)
        .await
        .expect("Send failed");
    app.db
        .mark_invoice_paid(invoice_id)
        .await
        .expect("Payment failed");

    let result = app.db.void_invoice(invoice_id).await;
    assert!(matches!(result, Err(AppError::BadRequest(_))));

    app.cleanup().await;
}

#[tokio::test]
#[ignore]
async fn draft_and_sent_invoices_can_be_voided() {
    let app = TestApp::spawn().await;

    let draft = draft_invoice(&app, Uuid::new_v4()).await;
    let voided = app
        .db
        .void_invoice(draft.invoice.invoice_id)
        .await
        .expect("Void failed")
        .expect("Invoice missing");
    assert_eq!(voided.status(), InvoiceStatus::Voided);
    assert!(voided.voided_utc.is_some());

    let sent = draft_invoice(&app, Uuid::new_v4()).await;
    app.db
        .mark_invoice_sent(sent.invoice.invoice_id)
        .await
        .expect("Send failed");
    let voided = app
        .db
        .void_invoice(sent.invoice.invoice_id)
        .await
        .expect("Void failed")
        .expect("Invoice missing");
    assert_eq!(voided.status(), InvoiceStatus::Voided);

    app.cleanup().await;
}

#[tokio::test]
#[ignore]
async fn voiding_an_invoice_does_not_release_its_usage() {
    let app = TestApp::spawn().await;
    let user_id = Uuid::new_v4();
    let generated = draft_invoice(&app, user_id).await;

    app.db
        .void_invoice(generated.invoice.invoice_id)
        .await
        .expect("Void failed");

    // The line item still pins the usage record, so nothing comes back.
    assert!(!app
        .generator
        .has_unbilled_usage(user_id, date(2026, 3, 1), date(2026, 3, 31))
        .await
        .expect("Query failed"));
    let regenerated = app
        .generator
        .generate_for_user(user_id, date(2026, 3, 1), date(2026, 3, 31), None)
        .await
        .expect("Generation failed");
    assert!(regenerated.is_none());

    app.cleanup().await;
}

#[tokio::test]
#[ignore]
async fn removing_a_line_item_releases_its_usage() {
    let app = TestApp::spawn().await;
    let user_id = Uuid::new_v4();
    let generated = draft_invoice(&app, user_id).await;
    let invoice_id = generated.invoice.invoice_id;
    let line_item_id = generated.items[0].line_item_id;

    let removed = app
        .generator
        .remove_item(invoice_id, line_item_id)
        .await
        .expect("Removal failed");
    assert!(removed);

    let emptied = app
        .db
        .get_invoice(invoice_id)
        .await
        .expect("Fetch failed")
        .expect("Invoice missing");
    assert_eq!(emptied.subtotal, dec("0.00"));
    assert_eq!(emptied.total, dec("0.00"));

    // With the line gone the usage is billable again.
    let regenerated = app
        .generator
        .generate_for_user(user_id, date(2026, 3, 1), date(2026, 3, 31), None)
        .await
        .expect("Generation failed")
        .expect("Expected a fresh invoice");
    assert_eq!(regenerated.items.len(), 1);

    app.cleanup().await;
}

#[tokio::test]
#[ignore]
async fn removing_an_unknown_line_item_returns_false() {
    let app = TestApp::spawn().await;
    let generated = draft_invoice(&app, Uuid::new_v4()).await;

    let removed = app
        .generator
        .remove_item(generated.invoice.invoice_id, Uuid::new_v4())
        .await
        .expect("Removal failed");
    assert!(!removed);

    app.cleanup().await;
}

#[tokio::test]
#[ignore]
async fn manual_items_recalculate_draft_totals() {
    let app = TestApp::spawn().await;
    let generated = draft_invoice(&app, Uuid::new_v4()).await;
    let invoice_id = generated.invoice.invoice_id;
    assert_eq!(generated.invoice.subtotal, dec("16.00"));

    let item = app
        .generator
        .add_manual_item(&AddManualLineItem {
            invoice_id,
            description: "Lost key replacement".to_string(),
            amount: dec("12.50"),
            resource_id: None,
        })
        .await
        .expect("Manual item failed");
    assert_eq!(item.quantity, dec("1.00"));
    assert_eq!(item.unit_price, dec("12.50"));
    assert_eq!(item.amount, dec("12.50"));
    assert_eq!(item.usage_record_id, None);
    // Appended after the generated lines.
    assert_eq!(item.sort_order, 1);

    let invoice = app
        .db
        .get_invoice(invoice_id)
        .await
        .expect("Fetch failed")
        .expect("Invoice missing");
    assert_eq!(invoice.subtotal, dec("28.50"));
    assert_eq!(invoice.total, dec("28.50"));

    // Credits subtract.
    app.generator
        .add_manual_item(&AddManualLineItem {
            invoice_id,
            description: "Goodwill credit".to_string(),
            amount: dec("-10.00"),
            resource_id: None,
        })
        .await
        .expect("Manual credit failed");

    let invoice = app
        .db
        .get_invoice(invoice_id)
        .await
        .expect("Fetch failed")
        .expect("Invoice missing");
    assert_eq!(invoice.subtotal, dec("18.50"));
    assert_eq!(invoice.total, dec("18.50"));

    app.cleanup().await;
}

#[tokio::test]
#[ignore]
async fn manual_items_are_rejected_outside_draft() {
    let app = TestApp::spawn().await;
    let generated = draft_invoice(&app, Uuid::new_v4()).await;
    let invoice_id = generated.invoice.invoice_id;

    app.db
        .mark_invoice_sent(invoice_id)
        .await
        .expect("Send failed");

    let added = app
        .generator
        .add_manual_item(&AddManualLineItem {
            invoice_id,
            description: "Too late".to_string(),
            amount: dec("5.00"),
            resource_id: None,
        })
        .await;
    assert!(matches!(added, Err(AppError::BadRequest(_))));

    let removed = app
        .generator
        .remove_item(invoice_id, generated.items[0].line_item_id)
        .await;
    assert!(matches!(removed, Err(AppError::BadRequest(_))));

    app.cleanup().await;
}

#[tokio::test]
#[ignore]
async fn manual_items_on_unknown_invoices_return_not_found() {
    let app = TestApp::spawn().await;

    let added = app
        .generator
        .add_manual_item(&AddManualLineItem {
            invoice_id: Uuid::new_v4(),
            description: "Nowhere".to_string(),
            amount: dec("5.00"),
            resource_id: None,
        })
        .await;
    assert!(matches!(added, Err(AppError::NotFound(_))));

    app.cleanup().await;
}

#[tokio::test]
#[ignore]
async fn adjustments_update_the_total() {
    let app = TestApp::spawn().await;
    let generated = draft_invoice(&app, Uuid::new_v4()).await;
    let invoice_id = generated.invoice.invoice_id;

    let adjusted = app
        .generator
        .set_adjustments(invoice_id, dec("-5.005"), Some("Late checkout waived"))
        .await
        .expect("Adjustment failed")
        .expect("Invoice missing");

    // Half-up rounding to cents before storing.
    assert_eq!(adjusted.adjustments, dec("-5.01"));
    assert_eq!(adjusted.adjustment_reason.as_deref(), Some("Late checkout waived"));
    assert_eq!(adjusted.subtotal, dec("16.00"));
    assert_eq!(adjusted.total, dec("10.99"));

    app.cleanup().await;
}

#[tokio::test]
#[ignore]
async fn adjustments_are_rejected_outside_draft() {
    let app = TestApp::spawn().await;
    let generated = draft_invoice(&app, Uuid::new_v4()).await;
    let invoice_id = generated.invoice.invoice_id;

    app.db
        .mark_invoice_sent(invoice_id)
        .await
        .expect("Send failed");

    let result = app
        .generator
        .set_adjustments(invoice_id, dec("-5.00"), None)
        .await;
    assert!(matches!(result, Err(AppError::BadRequest(_))));

    app.cleanup().await;
}

#[tokio::test]
#[ignore]
async fn totals_hold_the_subtotal_plus_adjustments_invariant() {
    let app = TestApp::spawn().await;
    let generated = draft_invoice(&app, Uuid::new_v4()).await;
    let invoice_id = generated.invoice.invoice_id;

    app.generator
        .set_adjustments(invoice_id, dec("2.00"), Some("Cleaning fee"))
        .await
        .expect("Adjustment failed");
    app.generator
        .add_manual_item(&AddManualLineItem {
            invoice_id,
            description: "Fuel surcharge".to_string(),
            amount: dec("3.25"),
            resource_id: None,
        })
        .await
        .expect("Manual item failed");

    let invoice = app
        .db
        .get_invoice(invoice_id)
        .await
        .expect("Fetch failed")
        .expect("Invoice missing");
    assert_eq!(invoice.subtotal, dec("19.25"));
    assert_eq!(invoice.adjustments, dec("2.00"));
    assert_eq!(invoice.total, invoice.subtotal + invoice.adjustments);

    app.cleanup().await;
}

#[tokio::test]
#[ignore]
async fn line_items_keep_their_sort_order() {
    let app = TestApp::spawn().await;
    let generated = draft_invoice(&app, Uuid::new_v4()).await;
    let invoice_id = generated.invoice.invoice_id;

    app.generator
        .add_manual_item(&AddManualLineItem {
            invoice_id,
            description: "First extra".to_string(),
            amount: dec("1.00"),
            resource_id: None,
        })
        .await
        .expect("Manual item failed");
    app.generator
        .add_manual_item(&AddManualLineItem {
            invoice_id,
            description: "Second extra".to_string(),
            amount: dec("2.00"),
            resource_id: None,
        })
        .await
        .expect("Manual item failed");

    let items = app
        .db
        .get_line_items(invoice_id)
        .await
        .expect("Fetch failed");
    let orders: Vec<i32> = items.iter().map(|i| i.sort_order).collect();
    assert_eq!(orders, vec![0, 1, 2]);
    assert_eq!(items[2].description, "Second extra");

    app.cleanup().await;
}
