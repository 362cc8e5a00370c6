use std::time::Duration;

use async_trait::async_trait;
use common::protocol::PortInfo;
use tokio::{
    io::{split, AsyncRead, AsyncWrite},
    time::sleep,
};
use tokio_serial::{DataBits, FlowControl, Parity, SerialPort, SerialPortBuilderExt, SerialPortInfo, SerialPortType, StopBits};

use crate::config::PortFilter;

pub struct Transport {
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    pub writer: Box<dyn AsyncWrite + Send + Unpin>,
}
impl Transport {
    pub fn new(reader: impl AsyncRead + Send + Unpin + 'static, writer: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        Transport { reader: Box::new(reader), writer: Box::new(writer) }
    }
}

#[async_trait]
pub trait PortOpener: Send + Sync {
    async fn open(&self, path: &str, baud_rate: u32) -> anyhow::Result<Transport>;
    async fn list(&self) -> anyhow::Result<Vec<SerialPortInfo>>;
}

pub struct SerialPortOpener;

#[async_trait]
impl PortOpener for SerialPortOpener {
    async fn open(&self, path: &str, baud_rate: u32) -> anyhow::Result<Transport> {
        let (reader, writer) = open_and_reset_arduino_like_serial(path, baud_rate).await?;
        Ok(Transport::new(reader, writer))
    }
    async fn list(&self) -> anyhow::Result<Vec<SerialPortInfo>> {
        Ok(tokio_serial::available_ports()?)
    }
}

/// Opens the port and toggles DTR, which resets Arduino based boards into a fresh greeting.
pub async fn open_and_reset_arduino_like_serial(path: &str, baud_rate: u32) -> anyhow::Result<(impl AsyncRead, impl AsyncWrite)> {
    let mut port = tokio_serial::new(path, baud_rate)
        .data_bits(DataBits::Eight)
        .flow_control(FlowControl::None)
        .timeout(Duration::from_millis(30))
        .parity(Parity::None)
        .stop_bits(StopBits::One)
        .open_native_async()?;
    port.write_data_terminal_ready(false)?;
    sleep(Duration::from_millis(2)).await;
    port.write_data_terminal_ready(true)?;
    Ok(split(port))
}

fn hex_id(id: u16) -> String {
    format!("{:04x}", id)
}

pub fn classify_port(info: &SerialPortInfo, filters: &[PortFilter], in_use: bool) -> PortInfo {
    let mut port = PortInfo {
        port: info.port_name.clone(),
        manufacturer: None,
        vendor_id: None,
        product_id: None,
        recognized: false,
        in_use,
    };
    if let SerialPortType::UsbPort(usb) = &info.port_type {
        port.manufacturer = usb.manufacturer.clone();
        port.vendor_id = Some(hex_id(usb.vid));
        port.product_id = Some(hex_id(usb.pid));
        port.recognized = filters.iter().any(|filter| filter.matches(usb.vid, usb.pid));
    }
    port
}
