//! Environment-driven configuration. The daemon has no GUI and no paired
//! settings store; everything is read once at startup from the process
//! environment (optionally layered under a `--config` TOML file) and never
//! reloaded. Misconfiguration that prevents the store from opening is fatal
//! (exit code 2, see `main.rs`).

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::errors::{DaemonError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrinterInterface {
    Usb,
    Network,
    Dummy,
}

impl std::str::FromStr for PrinterInterface {
    type Err = DaemonError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "usb" => Ok(Self::Usb),
            "network" => Ok(Self::Network),
            "dummy" => Ok(Self::Dummy),
            other => Err(DaemonError::Config(format!(
                "unrecognized PRINTER_INTERFACE '{other}', expected usb|network|dummy"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiptVariants {
    pub kitchen: bool,
    pub driver: bool,
    pub customer: bool,
}

impl Default for ReceiptVariants {
    fn default() -> Self {
        Self {
            kitchen: true,
            driver: false,
            customer: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpConfig {
    pub host: Option<String>,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub from_address: Option<String>,
    pub to_addresses: Vec<String>,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: 587,
            username: None,
            password: None,
            from_address: None,
            to_addresses: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub restaurant_name: String,
    pub restaurant_region: Option<String>,

    pub db_path: PathBuf,

    pub printer_interface: PrinterInterface,
    pub printer_usb_vendor_id: Option<u16>,
    pub printer_usb_product_id: Option<u16>,
    pub printer_ip: Option<String>,
    pub printer_port: u16,

    pub receipts: ReceiptVariants,

    pub smtp: SmtpConfig,
    pub notification_enabled: bool,

    pub public_domain: Option<String>,
    pub public_url_timeout_secs: u64,
    pub public_url_check_interval_secs: u64,

    pub tax_rate: f64,
    pub currency_code: String,
    pub currency_symbol: String,

    pub api_bind_addr: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            restaurant_name: "Restaurant".to_string(),
            restaurant_region: None,
            db_path: default_db_path(),
            printer_interface: PrinterInterface::Dummy,
            printer_usb_vendor_id: None,
            printer_usb_product_id: None,
            printer_ip: None,
            printer_port: 9100,
            receipts: ReceiptVariants::default(),
            smtp: SmtpConfig::default(),
            notification_enabled: false,
            public_domain: None,
            public_url_timeout_secs: 5,
            public_url_check_interval_secs: 60,
            tax_rate: 0.0,
            currency_code: "USD".to_string(),
            currency_symbol: "$".to_string(),
            api_bind_addr: "127.0.0.1:8043".to_string(),
        }
    }
}

fn default_db_path() -> PathBuf {
    dirs::config_dir()
        .map(|p| p.join("resto-print-daemon").join("daemon.db"))
        .unwrap_or_else(|| PathBuf::from("daemon.db"))
}

fn env_u16(key: &str, default: u16) -> Result<u16> {
    match std::env::var(key) {
        Ok(v) => v
            .parse()
            .map_err(|_| DaemonError::Config(format!("{key} must be a u16, got '{v}'"))),
        Err(_) => Ok(default),
    }
}

fn env_u64(key: &str, default: u64) -> Result<u64> {
    match std::env::var(key) {
        Ok(v) => v
            .parse()
            .map_err(|_| DaemonError::Config(format!("{key} must be a u64, got '{v}'"))),
        Err(_) => Ok(default),
    }
}

fn env_f64(key: &str, default: f64) -> Result<f64> {
    match std::env::var(key) {
        Ok(v) => v
            .parse()
            .map_err(|_| DaemonError::Config(format!("{key} must be a number, got '{v}'"))),
        Err(_) => Ok(default),
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

impl AppConfig {
    /// Loads configuration from the environment, following the recognized
    /// set in spec §6. `db_path_override` wins over `$RESTO_DB_PATH` which
    /// wins over the OS-specific default.
    pub fn from_env(db_path_override: Option<PathBuf>) -> Result<Self> {
        let mut config = Self::default();
        config.apply_env(db_path_override)?;
        Ok(config)
    }

    /// Layers recognized environment variables onto an existing config —
    /// the `AppConfig::default()` base for `from_env`, or a TOML file's
    /// values when `--config` is given (env wins on every key it sets).
    pub fn apply_env(&mut self, db_path_override: Option<PathBuf>) -> Result<()> {
        let config = self;

        if let Some(path) = db_path_override {
            config.db_path = path;
        } else if let Ok(path) = std::env::var("RESTO_DB_PATH") {
            config.db_path = PathBuf::from(path);
        }

        if let Ok(v) = std::env::var("PRINTER_INTERFACE") {
            config.printer_interface = v.parse()?;
        }
        if let Ok(v) = std::env::var("PRINTER_USB_VENDOR_ID") {
            config.printer_usb_vendor_id = Some(
                u16::from_str_radix(v.trim_start_matches("0x"), 16)
                    .or_else(|_| v.parse())
                    .map_err(|_| DaemonError::Config(format!("invalid PRINTER_USB_VENDOR_ID '{v}'")))?,
            );
        }
        if let Ok(v) = std::env::var("PRINTER_USB_PRODUCT_ID") {
            config.printer_usb_product_id = Some(
                u16::from_str_radix(v.trim_start_matches("0x"), 16)
                    .or_else(|_| v.parse())
                    .map_err(|_| DaemonError::Config(format!("invalid PRINTER_USB_PRODUCT_ID '{v}'")))?,
            );
        }
        if let Ok(v) = std::env::var("PRINTER_IP") {
            config.printer_ip = Some(v);
        }
        config.printer_port = env_u16("PRINTER_PORT", config.printer_port)?;

        config.receipts.kitchen = env_bool("ENABLE_KITCHEN_RECEIPT", config.receipts.kitchen);
        config.receipts.driver = env_bool("ENABLE_DRIVER_RECEIPT", config.receipts.driver);
        config.receipts.customer = env_bool("ENABLE_CUSTOMER_RECEIPT", config.receipts.customer);

        if let Ok(v) = std::env::var("SMTP_HOST") {
            config.smtp.host = Some(v);
        }
        config.smtp.port = env_u16("SMTP_PORT", config.smtp.port)?;
        if let Ok(v) = std::env::var("SMTP_USERNAME") {
            config.smtp.username = Some(v);
        }
        if let Ok(v) = std::env::var("SMTP_PASSWORD") {
            config.smtp.password = Some(v);
        }
        if let Ok(v) = std::env::var("SMTP_FROM_ADDRESS") {
            config.smtp.from_address = Some(v);
        }
        if let Ok(v) = std::env::var("NOTIFICATION_TO_ADDRESSES") {
            config.smtp.to_addresses = v.split(',').map(|s| s.trim().to_string()).collect();
        }
        config.notification_enabled = env_bool("NOTIFICATION_ENABLED", config.notification_enabled);

        if let Ok(v) = std::env::var("PUBLIC_DOMAIN") {
            config.public_domain = Some(v);
        }
        config.public_url_timeout_secs =
            env_u64("PUBLIC_URL_TIMEOUT", config.public_url_timeout_secs)?;
        config.public_url_check_interval_secs =
            env_u64("PUBLIC_URL_CHECK_INTERVAL", config.public_url_check_interval_secs)?;

        if let Ok(v) = std::env::var("RESTAURANT_NAME") {
            config.restaurant_name = v;
        }
        if let Ok(v) = std::env::var("RESTAURANT_REGION") {
            config.restaurant_region = Some(v);
        }

        config.tax_rate = env_f64("TAX_RATE", config.tax_rate)?;
        if let Ok(v) = std::env::var("CURRENCY_CODE") {
            config.currency_code = v;
        }
        if let Ok(v) = std::env::var("CURRENCY_SYMBOL") {
            config.currency_symbol = v;
        }

        if let Ok(v) = std::env::var("RESTO_API_BIND_ADDR") {
            config.api_bind_addr = v;
        }

        if config.printer_interface == PrinterInterface::Network && config.printer_ip.is_none() {
            return Err(DaemonError::Config(
                "PRINTER_INTERFACE=network requires PRINTER_IP".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn default_config_uses_dummy_printer() {
        let config = AppConfig::default();
        assert_eq!(config.printer_interface, PrinterInterface::Dummy);
    }

    #[test]
    #[serial]
    fn network_interface_without_ip_is_rejected() {
        std::env::set_var("PRINTER_INTERFACE", "network");
        std::env::remove_var("PRINTER_IP");
        let result = AppConfig::from_env(None);
        std::env::remove_var("PRINTER_INTERFACE");
        assert!(result.is_err());
    }

    #[test]
    #[serial]
    fn network_interface_with_ip_is_accepted() {
        std::env::set_var("PRINTER_INTERFACE", "network");
        std::env::set_var("PRINTER_IP", "192.168.1.50");
        let result = AppConfig::from_env(None);
        std::env::remove_var("PRINTER_INTERFACE");
        std::env::remove_var("PRINTER_IP");
        assert!(result.is_ok());
        assert_eq!(result.unwrap().printer_ip.as_deref(), Some("192.168.1.50"));
    }
}
