//! Printer Adapter (spec §4, §6). The spec treats the physical driver as an
//! opaque external collaborator specified only by its interface —
//! `connect/disconnect/status/printReceipt/printText`. Only two concrete
//! adapters ship here: a `dummy` adapter for tests and local development,
//! and a `network` adapter for raw ESC/POS over TCP/9100, grounded on the
//! teacher's `printer.rs::print_network` connection-pool-with-keepalive
//! pattern. USB/Bluetooth transports are not carried over — the trait is
//! the contract the spec cares about, not every teacher transport.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use crate::errors::{DaemonError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrinterStatus {
    Online,
    Offline,
    Error,
    PaperOut,
    Unknown,
}

#[async_trait::async_trait]
pub trait PrinterAdapter: Send + Sync {
    async fn connect(&self) -> Result<bool>;
    async fn disconnect(&self) -> Result<()>;
    async fn status(&self) -> Result<PrinterStatus>;
    async fn print_receipt(&self, bytes: &[u8]) -> Result<bool>;
    async fn print_text(&self, bytes: &[u8]) -> Result<bool>;
}

/// In-memory adapter used for tests and `PRINTER_INTERFACE=dummy`. Captures
/// every print call so tests can assert on byte content without a real
/// printer, and exposes `set_online`/`set_should_fail` knobs mirroring the
/// teacher's `tests/common::MockPrinter` fixture.
pub struct DummyAdapter {
    online: std::sync::atomic::AtomicBool,
    should_fail: std::sync::atomic::AtomicBool,
    print_count: AtomicU32,
    last_print: Mutex<Option<Vec<u8>>>,
}

impl Default for DummyAdapter {
    fn default() -> Self {
        Self {
            online: std::sync::atomic::AtomicBool::new(true),
            should_fail: std::sync::atomic::AtomicBool::new(false),
            print_count: AtomicU32::new(0),
            last_print: Mutex::new(None),
        }
    }
}

impl DummyAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn set_should_fail(&self, fail: bool) {
        self.should_fail.store(fail, Ordering::SeqCst);
    }

    pub fn print_count(&self) -> u32 {
        self.print_count.load(Ordering::SeqCst)
    }

    pub async fn last_print(&self) -> Option<Vec<u8>> {
        self.last_print.lock().await.clone()
    }
}

#[async_trait::async_trait]
impl PrinterAdapter for DummyAdapter {
    async fn connect(&self) -> Result<bool> {
        Ok(self.online.load(Ordering::SeqCst))
    }

    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }

    async fn status(&self) -> Result<PrinterStatus> {
        Ok(if self.online.load(Ordering::SeqCst) {
            PrinterStatus::Online
        } else {
            PrinterStatus::Offline
        })
    }

    async fn print_receipt(&self, bytes: &[u8]) -> Result<bool> {
        if !self.online.load(Ordering::SeqCst) {
            return Err(DaemonError::PrinterOffline("dummy printer offline".to_string()));
        }
        if self.should_fail.load(Ordering::SeqCst) {
            return Err(DaemonError::Printer("simulated printer failure".to_string()));
        }
        *self.last_print.lock().await = Some(bytes.to_vec());
        self.print_count.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }

    async fn print_text(&self, bytes: &[u8]) -> Result<bool> {
        self.print_receipt(bytes).await
    }
}

struct PooledConnection {
    stream: Option<TcpStream>,
    consecutive_failures: u32,
}

/// Raw ESC/POS over TCP/9100, grounded on the teacher's `print_network`:
/// reuse a pooled connection, reconnect on write/flush failure, bound every
/// socket operation with an explicit timeout.
pub struct NetworkAdapter {
    address: String,
    port: u16,
    connection: Mutex<PooledConnection>,
}

impl NetworkAdapter {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
            connection: Mutex::new(PooledConnection {
                stream: None,
                consecutive_failures: 0,
            }),
        }
    }

    fn dial(&self) -> Result<TcpStream> {
        let addr = format!("{}:{}", self.address, self.port);
        let stream = TcpStream::connect(&addr)
            .map_err(|e| DaemonError::Network(format!("connect to {addr} failed: {e}")))?;
        stream
            .set_write_timeout(Some(Duration::from_secs(20)))
            .map_err(|e| DaemonError::Network(format!("set_write_timeout failed: {e}")))?;
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .map_err(|e| DaemonError::Network(format!("set_read_timeout failed: {e}")))?;

        let sock = socket2::SockRef::from(&stream);
        sock.set_keepalive(true)
            .map_err(|e| DaemonError::Network(format!("set_keepalive failed: {e}")))?;

        Ok(stream)
    }

    async fn write_bytes(&self, bytes: &[u8]) -> Result<bool> {
        let bytes = bytes.to_vec();
        let address = self.address.clone();
        let port = self.port;
        let mut guard = self.connection.lock().await;

        if guard.stream.is_none() {
            guard.stream = Some(self.dial()?);
        }

        let result = tokio::task::spawn_blocking({
            let mut stream = guard.stream.take().unwrap();
            move || -> std::result::Result<TcpStream, std::io::Error> {
                stream.write_all(&bytes)?;
                stream.flush()?;
                Ok(stream)
            }
        })
        .await
        .map_err(|e| DaemonError::Network(format!("print task join failed: {e}")));

        match result {
            Ok(Ok(stream)) => {
                guard.stream = Some(stream);
                guard.consecutive_failures = 0;
                Ok(true)
            }
            Ok(Err(io_err)) => {
                guard.consecutive_failures += 1;
                guard.stream = None;
                Err(DaemonError::Network(format!(
                    "write to {address}:{port} failed: {io_err}"
                )))
            }
            Err(e) => {
                guard.consecutive_failures += 1;
                guard.stream = None;
                Err(e)
            }
        }
    }
}

#[async_trait::async_trait]
impl PrinterAdapter for NetworkAdapter {
    async fn connect(&self) -> Result<bool> {
        let mut guard = self.connection.lock().await;
        if guard.stream.is_some() {
            return Ok(true);
        }
        guard.stream = Some(self.dial()?);
        guard.consecutive_failures = 0;
        Ok(true)
    }

    async fn disconnect(&self) -> Result<()> {
        let mut guard = self.connection.lock().await;
        guard.stream = None;
        Ok(())
    }

    /// DLE EOT real-time status poll (ESC/POS). A short read timeout keeps
    /// this from blocking the connectivity monitor's poll cycle.
    async fn status(&self) -> Result<PrinterStatus> {
        let address = self.address.clone();
        let port = self.port;
        let result = tokio::task::spawn_blocking(move || -> std::result::Result<PrinterStatus, std::io::Error> {
            let addr: std::net::SocketAddr = format!("{address}:{port}")
                .parse()
                .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "bad address"))?;
            let mut stream = TcpStream::connect_timeout(&addr, Duration::from_secs(3))?;
            stream.set_read_timeout(Some(Duration::from_secs(2)))?;
            stream.write_all(&[0x10, 0x04, 0x01])?;
            let mut buf = [0u8; 1];
            match stream.read_exact(&mut buf) {
                Ok(()) => {
                    if buf[0] & 0x08 != 0 {
                        Ok(PrinterStatus::PaperOut)
                    } else if buf[0] & 0x20 != 0 {
                        Ok(PrinterStatus::Error)
                    } else {
                        Ok(PrinterStatus::Online)
                    }
                }
                Err(_) => Ok(PrinterStatus::Unknown),
            }
        })
        .await
        .map_err(|e| DaemonError::Network(format!("status poll join failed: {e}")))?;

        match result {
            Ok(status) => Ok(status),
            Err(_) => Ok(PrinterStatus::Offline),
        }
    }

    async fn print_receipt(&self, bytes: &[u8]) -> Result<bool> {
        self.write_bytes(bytes).await
    }

    async fn print_text(&self, bytes: &[u8]) -> Result<bool> {
        self.write_bytes(bytes).await
    }
}

pub fn build_adapter(config: &crate::config::AppConfig) -> Result<Arc<dyn PrinterAdapter>> {
    use crate::config::PrinterInterface;
    match config.printer_interface {
        PrinterInterface::Dummy => Ok(Arc::new(DummyAdapter::new())),
        PrinterInterface::Network => {
            let ip = config
                .printer_ip
                .clone()
                .ok_or_else(|| DaemonError::Config("PRINTER_IP required for network interface".to_string()))?;
            Ok(Arc::new(NetworkAdapter::new(ip, config.printer_port)))
        }
        PrinterInterface::Usb => Err(DaemonError::Config(
            "USB printer interface is not implemented by this daemon build".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dummy_adapter_records_print_calls() {
        let adapter = DummyAdapter::new();
        assert!(adapter.print_receipt(b"hello").await.unwrap());
        assert_eq!(adapter.print_count(), 1);
        assert_eq!(adapter.last_print().await, Some(b"hello".to_vec()));
    }

    #[tokio::test]
    async fn dummy_adapter_honors_offline_flag() {
        let adapter = DummyAdapter::new();
        adapter.set_online(false);
        assert!(matches!(adapter.status().await.unwrap(), PrinterStatus::Offline));
        assert!(adapter.print_receipt(b"x").await.is_err());
    }

    #[tokio::test]
    async fn dummy_adapter_honors_should_fail_flag() {
        let adapter = DummyAdapter::new();
        adapter.set_should_fail(true);
        assert!(adapter.print_receipt(b"x").await.is_err());
        assert_eq!(adapter.print_count(), 0);
    }
}
