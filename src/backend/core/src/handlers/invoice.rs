//! Invoice handler: totals, a deterministic invoice number, and the invoice email.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};

use super::InvoiceHandler;
use crate::error::{JobResult, Result, WorkerError};
use crate::jobs::JobContext;
use crate::messaging::envelope::{Envelope, JobClass};
use crate::messaging::payload::{EmailPayload, InvoiceItem, InvoicePayload};
use crate::messaging::publisher::Publisher;

/// Tolerance when comparing money amounts.
const AMOUNT_TOLERANCE: f64 = 0.01;
const TAX_RATE: f64 = 0.08;
const FREE_SHIPPING_THRESHOLD: f64 = 50.0;
const FLAT_SHIPPING: f64 = 5.99;
/// Queue priority of the invoice email.
const INVOICE_EMAIL_PRIORITY: i64 = 5;

/// A generated invoice.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Invoice {
    pub invoice_number: String,
    pub order_id: String,
    pub order_number: String,
    pub user_email: String,
    pub items: Vec<InvoiceItem>,
    pub subtotal: f64,
    pub tax: f64,
    pub shipping: f64,
    pub total: f64,
    pub issued_at: DateTime<Utc>,
}

impl Invoice {
    /// The email carrying this invoice. Its envelope id derives from the
    /// invoice number so a redelivered invoice produces the same email id.
    pub fn email(&self) -> EmailPayload {
        let lines = self
            .items
            .iter()
            .map(|item| {
                format!(
                    "{} x{} @ {:.2} = {:.2}",
                    item.product_name, item.quantity, item.unit_price, item.total_price
                )
            })
            .collect::<Vec<_>>()
            .join("\n");

        EmailPayload::new(
            &self.user_email,
            format!("Invoice {}", self.invoice_number),
            "invoice",
        )
        .with_data("InvoiceNumber", self.invoice_number.as_str())
        .with_data("OrderNumber", self.order_number.as_str())
        .with_data("Lines", lines)
        .with_data("Subtotal", format!("{:.2}", self.subtotal))
        .with_data("Tax", format!("{:.2}", self.tax))
        .with_data("Shipping", format!("{:.2}", self.shipping))
        .with_data("Total", format!("{:.2}", self.total))
        .with_priority(INVOICE_EMAIL_PRIORITY)
    }

    pub fn email_id(&self) -> String {
        format!("email_{}", self.invoice_number)
    }
}

/// `INV-<order_number>-<first 8 hex of sha256(order_id)>`.
pub fn invoice_number(order_number: &str, order_id: &str) -> String {
    let digest = Sha256::digest(order_id.as_bytes());
    format!("INV-{}-{}", order_number, &hex::encode(digest)[..8])
}

fn round_cents(amount: f64) -> f64 {
    (amount * 100.0).round() / 100.0
}

/// Computes invoice totals.
#[derive(Debug, Clone, Copy, Default)]
pub struct InvoiceGenerator;

impl InvoiceGenerator {
    /// Check the order arithmetic and build the invoice.
    pub fn generate(&self, payload: &InvoicePayload) -> Result<Invoice> {
        payload.validate()?;

        for item in &payload.items {
            let expected = f64::from(item.quantity) * item.unit_price;
            if (expected - item.total_price).abs() > AMOUNT_TOLERANCE {
                return Err(WorkerError::validation(format!(
                    "item '{}': {} x {:.2} does not equal {:.2}",
                    item.product_name, item.quantity, item.unit_price, item.total_price
                )));
            }
        }

        let subtotal: f64 = payload.items.iter().map(|item| item.total_price).sum();
        if (subtotal - payload.total_amount).abs() > AMOUNT_TOLERANCE {
            return Err(WorkerError::validation(format!(
                "order total {:.2} does not match item subtotal {:.2}",
                payload.total_amount, subtotal
            )));
        }

        let subtotal = round_cents(subtotal);
        let tax = round_cents(subtotal * TAX_RATE);
        let shipping = if subtotal >= FREE_SHIPPING_THRESHOLD {
            0.0
        } else {
            FLAT_SHIPPING
        };

        Ok(Invoice {
            invoice_number: invoice_number(&payload.order_number, &payload.order_id),
            order_id: payload.order_id.clone(),
            order_number: payload.order_number.clone(),
            user_email: payload.user_email.clone(),
            items: payload.items.clone(),
            subtotal,
            tax,
            shipping,
            total: round_cents(subtotal + tax + shipping),
            issued_at: Utc::now(),
        })
    }
}

/// Default [`InvoiceHandler`]: generate, then publish the invoice email.
pub struct PublishingInvoiceHandler {
    generator: InvoiceGenerator,
    publisher: Publisher,
}

impl PublishingInvoiceHandler {
    pub fn new(publisher: Publisher) -> Self {
        Self {
            generator: InvoiceGenerator,
            publisher,
        }
    }
}

#[async_trait]
impl InvoiceHandler for PublishingInvoiceHandler {
    async fn handle(&self, payload: &InvoicePayload, ctx: &JobContext) -> JobResult {
        let invoice = self.generator.generate(payload)?;

        let envelope = Envelope::from_record(
            JobClass::Email,
            &invoice.email(),
            self.publisher.max_retries_for(JobClass::Email),
        )?
        .with_id(invoice.email_id());
        ctx.cancellable(self.publisher.publish(&envelope)).await??;

        tracing::info!(
            job_id = %ctx.job_id(),
            invoice_number = %invoice.invoice_number,
            order_id = %invoice.order_id,
            total = invoice.total,
            email_id = %envelope.id,
            "Invoice generated"
        );
        Ok(())
    }
}
