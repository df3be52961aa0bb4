//! Plain-text invoice rendering.
//!
//! Produces the fixed-width statement attached to outgoing invoice emails
//! and shown in the admin console. Rendering is pure; callers fetch the
//! invoice and items first.

use crate::models::{Invoice, LineItem};
use rust_decimal::Decimal;

const WIDTH: usize = 74;
const DESCRIPTION_WIDTH: usize = 32;

fn money(value: Decimal) -> String {
    format!("{:.2}", value)
}

fn truncate(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

/// Render an invoice and its line items as a fixed-width text statement.
pub fn render_invoice(invoice: &Invoice, items: &[LineItem]) -> String {
    let mut out = String::new();

    out.push_str(&"=".repeat(WIDTH));
    out.push('\n');
    out.push_str(&format!("INVOICE {}\n", invoice.invoice_number));
    out.push_str(&"=".repeat(WIDTH));
    out.push('\n');

    out.push_str(&format!("Member:      {}\n", invoice.user_id));
    out.push_str(&format!(
        "Period:      {} to {}\n",
        invoice.period_start, invoice.period_end
    ));
    out.push_str(&format!("Status:      {}\n", invoice.status));
    out.push_str(&format!("Due date:    {}\n", invoice.due_date));
    out.push('\n');

    out.push_str(&format!(
        "{:<desc$} {:>8} {:<5} {:>10} {:>12}\n",
        "DESCRIPTION",
        "QTY",
        "UNIT",
        "PRICE",
        "AMOUNT",
        desc = DESCRIPTION_WIDTH
    ));
    out.push_str(&"-".repeat(WIDTH));
    out.push('\n');

    for item in items {
        out.push_str(&format!(
            "{:<desc$} {:>8} {:<5} {:>10} {:>12}\n",
            truncate(&item.description, DESCRIPTION_WIDTH),
            money(item.quantity),
            item.unit.as_deref().unwrap_or(""),
            money(item.unit_price),
            money(item.amount),
            desc = DESCRIPTION_WIDTH
        ));
    }

    out.push_str(&"-".repeat(WIDTH));
    out.push('\n');

    out.push_str(&format!(
        "{:>pad$} {:>12}\n",
        "Subtotal:",
        money(invoice.subtotal),
        pad = WIDTH - 13
    ));
    if invoice.adjustments != Decimal::ZERO {
        out.push_str(&format!(
            "{:>pad$} {:>12}\n",
            "Adjustments:",
            money(invoice.adjustments),
            pad = WIDTH - 13
        ));
        if let Some(ref reason) = invoice.adjustment_reason {
            out.push_str(&format!(
                "{:>pad$}\n",
                format!("({})", truncate(reason, 40)),
                pad = WIDTH
            ));
        }
    }
    out.push_str(&format!(
        "{:>pad$} {:>12}\n",
        "Total:",
        money(invoice.total),
        pad = WIDTH - 13
    ));

    out
}
