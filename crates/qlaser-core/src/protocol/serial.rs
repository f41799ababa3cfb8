//! Serial port link
//!
//! [`SerialLink`] implements [`Link`] over the `serialport` crate.

use serialport::{SerialPort, SerialPortInfo, SerialPortType};
use std::io::{Read, Write};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

use super::link::{take_fragment, take_line, Link, LinkDescriptor, LinkOpener};
use super::ProtocolError;

/// USB description keyword of the FPGA board's UART interface
pub const UART_INTERFACE_KEYWORD: &str = "Interface 0";

const POLL_INTERVAL: Duration = Duration::from_millis(2);

/// Information about an available serial port
#[derive(Debug, Clone)]
pub struct PortInfo {
    /// Port name (e.g., "/dev/ttyUSB1" or "COM4")
    pub name: String,

    /// USB vendor ID (if USB device)
    pub vid: Option<u16>,

    /// USB product ID (if USB device)
    pub pid: Option<u16>,

    /// Manufacturer name (if available)
    pub manufacturer: Option<String>,

    /// Product / interface description (if available)
    pub product: Option<String>,
}

impl PortInfo {
    /// Check manufacturer and product strings for `keyword`
    pub fn describes(&self, keyword: &str) -> bool {
        [&self.manufacturer, &self.product]
            .iter()
            .any(|s| s.as_deref().is_some_and(|s| s.contains(keyword)))
    }
}

impl From<SerialPortInfo> for PortInfo {
    fn from(info: SerialPortInfo) -> Self {
        let (vid, pid, manufacturer, product) = match info.port_type {
            SerialPortType::UsbPort(usb_info) => (
                Some(usb_info.vid),
                Some(usb_info.pid),
                usb_info.manufacturer,
                usb_info.product,
            ),
            _ => (None, None, None, None),
        };

        Self {
            name: info.port_name,
            vid,
            pid,
            manufacturer,
            product,
        }
    }
}

/// List available serial ports, sorted by name
pub fn list_ports() -> Vec<PortInfo> {
    let mut ports: Vec<PortInfo> = serialport::available_ports()
        .unwrap_or_default()
        .into_iter()
        .map(PortInfo::from)
        .collect();
    ports.sort_by(|a, b| a.name.cmp(&b.name));
    ports
}

/// First port whose description contains `keyword`
pub fn find_port(keyword: &str) -> Option<PortInfo> {
    select_port(list_ports(), keyword)
}

fn select_port(ports: Vec<PortInfo>, keyword: &str) -> Option<PortInfo> {
    ports.into_iter().find(|p| p.describes(keyword))
}

/// Open and configure a serial port (8N1, no flow control)
pub fn open_port(descriptor: &LinkDescriptor) -> Result<Box<dyn SerialPort>, ProtocolError> {
    if descriptor.port_name.is_empty() {
        return Err(ProtocolError::ConnectionFailed("no port name given".to_string()));
    }
    serialport::new(&descriptor.port_name, descriptor.baud_rate)
        .data_bits(serialport::DataBits::Eight)
        .parity(serialport::Parity::None)
        .stop_bits(serialport::StopBits::One)
        .flow_control(serialport::FlowControl::None)
        .timeout(Duration::from_millis(100))
        .open()
        .map_err(|e| ProtocolError::ConnectionFailed(format!("{}: {}", descriptor.port_name, e)))
}

/// Line-oriented link over a serial port
pub struct SerialLink {
    port: Box<dyn SerialPort>,
    pending: Vec<u8>,
    quiet: Duration,
}

impl SerialLink {
    pub fn new(port: Box<dyn SerialPort>, quiet: Duration) -> Self {
        Self {
            port,
            pending: Vec::new(),
            quiet,
        }
    }

    /// Pull whatever bytes are waiting into `pending`; returns the count
    fn fill(&mut self) -> Result<usize, ProtocolError> {
        let available = self
            .port
            .bytes_to_read()
            .map_err(|e| ProtocolError::SerialError(e.to_string()))? as usize;
        if available == 0 {
            return Ok(0);
        }
        let mut buffer = vec![0u8; available.min(4096)];
        match self.port.read(&mut buffer) {
            Ok(n) => {
                trace!("serial: read {} bytes: {:02x?}", n, &buffer[..n]);
                self.pending.extend_from_slice(&buffer[..n]);
                Ok(n)
            }
            Err(ref e)
                if e.kind() == std::io::ErrorKind::TimedOut
                    || e.kind() == std::io::ErrorKind::WouldBlock =>
            {
                Ok(0)
            }
            Err(e) => Err(ProtocolError::SerialError(e.to_string())),
        }
    }
}

impl Link for SerialLink {
    fn send(&mut self, bytes: &[u8]) -> Result<(), ProtocolError> {
        debug!("serial: sending {} bytes: {:02x?}", bytes.len(), bytes);
        self.port
            .write_all(bytes)
            .map_err(|e| ProtocolError::SerialError(e.to_string()))?;
        self.port
            .flush()
            .map_err(|e| ProtocolError::SerialError(e.to_string()))
    }

    fn read_line(&mut self, timeout: Duration) -> Result<Option<String>, ProtocolError> {
        let start = Instant::now();
        loop {
            if let Some(line) = take_line(&mut self.pending) {
                return Ok(Some(line));
            }
            if start.elapsed() > timeout {
                return Ok(None);
            }
            if self.fill()? == 0 {
                std::thread::sleep(POLL_INTERVAL);
            }
        }
    }

    fn read_all_available(&mut self) -> Result<Vec<String>, ProtocolError> {
        let mut lines = Vec::new();
        while let Some(line) = self.read_line(self.quiet)? {
            lines.push(line);
        }
        // A trailing fragment without newline still counts once the link is quiet
        if let Some(line) = take_fragment(&mut self.pending) {
            lines.push(line);
        }
        Ok(lines)
    }
}

/// Opens [`SerialLink`]s
#[derive(Debug, Default, Clone, Copy)]
pub struct SerialOpener;

impl LinkOpener for SerialOpener {
    fn open(&self, descriptor: &LinkDescriptor) -> Result<Box<dyn Link>, ProtocolError> {
        let port = open_port(descriptor)?;
        port.clear(serialport::ClearBuffer::All)
            .map_err(|e| ProtocolError::SerialError(e.to_string()))?;
        debug!(
            "serial: opened {} at {} baud",
            descriptor.port_name, descriptor.baud_rate
        );
        Ok(Box::new(SerialLink::new(port, descriptor.quiet())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn port(name: &str, product: Option<&str>) -> PortInfo {
        PortInfo {
            name: name.to_string(),
            vid: None,
            pid: None,
            manufacturer: None,
            product: product.map(str::to_string),
        }
    }

    #[test]
    fn test_list_ports() {
        // Only checks that enumeration does not panic
        let ports = list_ports();
        for port in &ports {
            println!("Found port: {} - {:?}", port.name, port.product);
        }
    }

    #[test]
    fn test_select_port_by_interface_keyword() {
        let ports = vec![
            port("/dev/ttyUSB0", Some("JTAG Interface 1")),
            port("/dev/ttyUSB1", Some("ZCU Interface 0")),
            port("/dev/ttyS0", None),
        ];
        let found = select_port(ports, UART_INTERFACE_KEYWORD).unwrap();
        assert_eq!(found.name, "/dev/ttyUSB1");
    }

    #[test]
    fn test_select_port_none_found() {
        assert!(select_port(vec![port("/dev/ttyS0", None)], UART_INTERFACE_KEYWORD).is_none());
    }

    #[test]
    fn test_open_without_name_fails() {
        let err = SerialOpener.open(&LinkDescriptor::default()).err().unwrap();
        assert!(matches!(err, ProtocolError::ConnectionFailed(_)));
    }
}
