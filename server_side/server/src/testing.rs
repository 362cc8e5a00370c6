use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::anyhow;
use async_trait::async_trait;
use machine_mock::trivial_machine;
use tokio::io::{duplex, split};
use tokio_serial::{SerialPortInfo, SerialPortType, UsbPortInfo};

use crate::{
    cnc::{
        connection::{PortOpener, Transport},
        controller::ControllerOptions,
    },
    config::HubConfig,
    hub::Hub,
    multiplexer::Multiplexer,
    registry::SessionContext,
};

/// Opens in-memory ports that talk to the fake firmware.
#[derive(Default)]
pub struct MockOpener {
    opens: AtomicUsize,
    fail: bool,
}
impl MockOpener {
    pub fn failing() -> Self {
        MockOpener { opens: AtomicUsize::new(0), fail: true }
    }
    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PortOpener for MockOpener {
    async fn open(&self, path: &str, _baud_rate: u32) -> anyhow::Result<Transport> {
        if self.fail {
            return Err(anyhow!("No such device: {}", path));
        }
        self.opens.fetch_add(1, Ordering::SeqCst);
        // Give racing opens a chance to overlap.
        tokio::time::sleep(Duration::from_millis(5)).await;
        let (host, machine) = duplex(4096);
        let (machine_read, machine_write) = split(machine);
        tokio::spawn(trivial_machine(machine_read, machine_write));
        let (host_read, host_write) = split(host);
        Ok(Transport::new(host_read, host_write))
    }
    async fn list(&self) -> anyhow::Result<Vec<SerialPortInfo>> {
        Ok(vec![
            SerialPortInfo {
                port_name: "mock0".to_string(),
                port_type: SerialPortType::UsbPort(UsbPortInfo {
                    vid: 0x2341,
                    pid: 0x0043,
                    serial_number: None,
                    manufacturer: Some("Arduino".to_string()),
                    product: None,
                }),
            },
            SerialPortInfo { port_name: "ttyS0".to_string(), port_type: SerialPortType::Unknown },
        ])
    }
}

pub fn test_options() -> ControllerOptions {
    ControllerOptions { status_interval: Duration::from_millis(50), rx_buffer_size: 128 }
}

pub fn test_context(opener: Arc<MockOpener>) -> Arc<SessionContext> {
    Arc::new(SessionContext {
        opener,
        multiplexer: Arc::new(Multiplexer::new()),
        options: test_options(),
    })
}

pub fn test_hub(config: HubConfig) -> Arc<Hub> {
    let config = HubConfig { status_interval_ms: 50, ..config };
    Arc::new(Hub::new(config, Arc::new(MockOpener::default())).unwrap())
}
