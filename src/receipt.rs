//! Receipt formatter — `format(order, variant) -> bytes` (spec §6), a pure
//! function with no I/O. Grounded on the teacher's `escpos.rs` command
//! builder; generalized from a single kitchen-ticket formatter to the
//! kitchen/service/customer variants the print manager creates one
//! `PrintJob` per (spec §3).

use crate::config::AppConfig;
use crate::models::{JobType, Order};

const ESC: u8 = 0x1b;
const GS: u8 = 0x1d;
const LF: u8 = 0x0a;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaperWidth {
    Width58mm = 32,
    Width80mm = 48,
}

#[derive(Debug, Clone, Copy)]
pub enum Alignment {
    Left = 0,
    Center = 1,
    Right = 2,
}

/// Minimal ESC/POS command builder — just enough opcodes for receipt
/// layout (init, align, bold, size, cut, feed), not a general escpos crate.
pub struct ReceiptBuilder {
    buffer: Vec<u8>,
    width: usize,
}

impl ReceiptBuilder {
    pub fn new(paper_width: PaperWidth) -> Self {
        let mut builder = Self {
            buffer: Vec::new(),
            width: paper_width as usize,
        };
        builder.buffer.extend_from_slice(&[ESC, 0x40]);
        builder
    }

    pub fn build(self) -> Vec<u8> {
        self.buffer
    }

    pub fn align(&mut self, a: Alignment) -> &mut Self {
        self.buffer.extend_from_slice(&[ESC, 0x61, a as u8]);
        self
    }

    pub fn bold(&mut self, enabled: bool) -> &mut Self {
        self.buffer.extend_from_slice(&[ESC, 0x45, enabled as u8]);
        self
    }

    pub fn double_size(&mut self, enabled: bool) -> &mut Self {
        self.buffer
            .extend_from_slice(&[GS, 0x21, if enabled { 0x11 } else { 0x00 }]);
        self
    }

    pub fn text(&mut self, text: &str) -> &mut Self {
        self.buffer.extend_from_slice(text.as_bytes());
        self
    }

    pub fn line(&mut self, text: &str) -> &mut Self {
        self.text(text);
        self.buffer.push(LF);
        self
    }

    pub fn feed(&mut self, lines: u8) -> &mut Self {
        for _ in 0..lines {
            self.buffer.push(LF);
        }
        self
    }

    pub fn divider(&mut self) -> &mut Self {
        self.line(&"-".repeat(self.width))
    }

    pub fn justify(&mut self, left: &str, right: &str) -> &mut Self {
        let pad = self.width.saturating_sub(left.len() + right.len()).max(1);
        self.line(&format!("{left}{}{right}", " ".repeat(pad)))
    }

    pub fn cut(&mut self) -> &mut Self {
        self.buffer.extend_from_slice(&[GS, 0x56, 0x01]);
        self
    }
}

fn format_currency(amount: f64, symbol: &str) -> String {
    format!("{symbol}{amount:.2}")
}

/// Renders a kitchen ticket: item names, quantities, and notes only — no
/// prices, no customer contact details (kitchen staff don't need either).
fn format_kitchen(order: &Order, config: &AppConfig) -> Vec<u8> {
    let mut b = ReceiptBuilder::new(PaperWidth::Width80mm);
    b.align(Alignment::Center);
    b.bold(true).double_size(true).line("KITCHEN");
    b.double_size(false).bold(false);
    b.divider();
    b.align(Alignment::Left);
    b.line(&format!("Order: {}", order.external_order_id));
    if let Some(table) = order.delivery.instructions.as_deref() {
        b.line(&format!("Notes: {table}"));
    }
    b.divider();
    for item in &order.items {
        b.bold(true)
            .line(&format!("{}x {}", item.quantity, item.name));
        b.bold(false);
        if let Some(variant) = &item.variant {
            b.line(&format!("  {variant}"));
        }
        if let Some(notes) = &item.notes {
            b.line(&format!("  * {notes}"));
        }
    }
    b.divider();
    let _ = config;
    b.feed(3);
    b.cut();
    b.build()
}

/// Renders a service/driver ticket: items plus delivery details, no prices.
fn format_service(order: &Order, _config: &AppConfig) -> Vec<u8> {
    let mut b = ReceiptBuilder::new(PaperWidth::Width80mm);
    b.align(Alignment::Center);
    b.bold(true).line("SERVICE");
    b.bold(false);
    b.divider();
    b.align(Alignment::Left);
    b.line(&format!("Order: {}", order.external_order_id));
    if let Some(name) = &order.customer.name {
        b.line(&format!("Customer: {name}"));
    }
    if let Some(phone) = &order.customer.phone {
        b.line(&format!("Phone: {phone}"));
    }
    if let Some(addr) = &order.delivery.address_line1 {
        b.line(&format!("Address: {addr}"));
        if let Some(addr2) = &order.delivery.address_line2 {
            b.line(&format!("         {addr2}"));
        }
    }
    b.divider();
    for item in &order.items {
        b.line(&format!("{}x {}", item.quantity, item.name));
    }
    b.feed(3);
    b.cut();
    b.build()
}

/// Renders the customer receipt: full itemized total with tax, per §6's
/// `TAX_RATE`/`CURRENCY_*` env knobs.
fn format_customer(order: &Order, config: &AppConfig) -> Vec<u8> {
    let mut b = ReceiptBuilder::new(PaperWidth::Width80mm);
    b.align(Alignment::Center);
    b.bold(true).double_size(true).line(&config.restaurant_name);
    b.double_size(false).bold(false);
    if let Some(region) = &config.restaurant_region {
        b.line(region);
    }
    b.divider();
    b.align(Alignment::Left);
    b.line(&format!("Order: {}", order.external_order_id));
    b.line(&format!("Date: {}", order.created_at.format("%Y-%m-%d %H:%M")));
    b.divider();

    let mut subtotal = 0.0;
    for item in &order.items {
        let line_total = item.unit_price * item.quantity as f64;
        subtotal += line_total;
        b.justify(
            &format!("{}x {}", item.quantity, item.name),
            &format_currency(line_total, &config.currency_symbol),
        );
    }
    b.divider();
    let tax = subtotal * config.tax_rate;
    b.justify("Subtotal", &format_currency(subtotal, &config.currency_symbol));
    if config.tax_rate > 0.0 {
        b.justify("Tax", &format_currency(tax, &config.currency_symbol));
    }
    b.bold(true);
    b.justify(
        "Total",
        &format!(
            "{} {}",
            config.currency_code,
            format_currency(order.total_amount, &config.currency_symbol)
        ),
    );
    b.bold(false);
    b.feed(1);
    b.align(Alignment::Center);
    b.line("Thank you!");
    b.feed(3);
    b.cut();
    b.build()
}

/// Pure `format(order, variant) -> bytes` (spec §6). Bytes are opaque to
/// every other component; only this module knows their shape.
pub fn format(order: &Order, variant: JobType, config: &AppConfig) -> Vec<u8> {
    match variant {
        JobType::Kitchen => format_kitchen(order, config),
        JobType::Service | JobType::Other => format_service(order, config),
        JobType::Customer => format_customer(order, config),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Customer, Delivery, OrderItem, OrderStatus};

    fn sample_order() -> Order {
        Order {
            id: "ord-1".to_string(),
            external_order_id: "R001-20260127-0001".to_string(),
            status: OrderStatus::Pending,
            items: vec![
                OrderItem {
                    id: "1".to_string(),
                    name: "Nam Tok".to_string(),
                    quantity: 3,
                    unit_price: 18.50,
                    variant: None,
                    notes: None,
                },
                OrderItem {
                    id: "2".to_string(),
                    name: "Som Tam".to_string(),
                    quantity: 2,
                    unit_price: 15.50,
                    variant: None,
                    notes: None,
                },
            ],
            customer: Customer {
                name: Some("Jane".to_string()),
                email: None,
                phone: Some("+41791234567".to_string()),
            },
            delivery: Delivery::default(),
            total_amount: 112.50,
            currency: "CHF".to_string(),
            created_at: chrono::Utc::now(),
            raw_payload: serde_json::Value::Null,
        }
    }

    #[test]
    fn kitchen_variant_omits_prices() {
        let order = sample_order();
        let config = AppConfig::default();
        let bytes = format(&order, JobType::Kitchen, &config);
        let text = String::from_utf8_lossy(&bytes);
        assert!(text.contains("Nam Tok"));
        assert!(!text.contains("18.50"));
    }

    #[test]
    fn customer_variant_includes_total() {
        let order = sample_order();
        let mut config = AppConfig::default();
        config.currency_code = "CHF".to_string();
        let bytes = format(&order, JobType::Customer, &config);
        let text = String::from_utf8_lossy(&bytes);
        assert!(text.contains("112.50"));
        assert!(text.contains("CHF"));
    }

    #[test]
    fn every_variant_ends_with_a_cut_command() {
        let order = sample_order();
        let config = AppConfig::default();
        for variant in [JobType::Kitchen, JobType::Service, JobType::Customer] {
            let bytes = format(&order, variant, &config);
            assert_eq!(&bytes[bytes.len() - 3..], &[GS, 0x56, 0x01]);
        }
    }
}
