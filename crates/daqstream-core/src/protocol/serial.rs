//! Serial port handling
//!
//! Low-level port enumeration and opening for front-end communication.

use serialport::{SerialPortInfo, SerialPortType};
#[cfg(target_os = "linux")]
use std::collections::HashMap;
#[cfg(target_os = "linux")]
use std::fs;
use std::time::Duration;

use super::channel::SerialChannel;
use super::error::ProtocolError;

/// Per-read timeout on the opened port. The session's loops poll
/// `bytes_to_read` and never rely on long blocking reads, so this stays
/// short to keep the loops responsive.
const PORT_READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Information about an available serial port.
#[derive(Debug, Clone)]
pub struct PortInfo {
    /// Port name (e.g. "/dev/ttyUSB0" or "COM3").
    pub name: String,
    /// USB vendor id, when the port is a USB device.
    pub vid: Option<u16>,
    /// USB product id, when the port is a USB device.
    pub pid: Option<u16>,
    /// Product name, if the OS reports one.
    pub product: Option<String>,
    /// Serial number, if the OS reports one.
    pub serial_number: Option<String>,
}

impl From<SerialPortInfo> for PortInfo {
    fn from(info: SerialPortInfo) -> Self {
        let (vid, pid, product, serial_number) = match info.port_type {
            SerialPortType::UsbPort(usb) => {
                (Some(usb.vid), Some(usb.pid), usb.product, usb.serial_number)
            }
            _ => (None, None, None, None),
        };
        Self {
            name: info.port_name,
            vid,
            pid,
            product,
            serial_number,
        }
    }
}

/// Sort key putting ttyACM* first, then ttyUSB*, each numerically, then
/// everything else by name.
fn port_sort_key(name: &str) -> (u8, usize, String) {
    let base = name.rsplit('/').next().unwrap_or(name);
    for (rank, prefix) in [(0u8, "ttyACM"), (1, "ttyUSB")] {
        if let Some(rest) = base.strip_prefix(prefix) {
            let num = rest.parse::<usize>().unwrap_or(usize::MAX);
            return (rank, num, base.to_string());
        }
    }
    (2, 0, base.to_string())
}

/// List available serial ports in deterministic order.
pub fn list_ports() -> Vec<PortInfo> {
    let mut ports: Vec<PortInfo> = serialport::available_ports()
        .unwrap_or_default()
        .into_iter()
        .map(PortInfo::from)
        .collect();

    // USB CDC ports occasionally escape the enumeration API; pick up the
    // device nodes directly so they are still selectable.
    #[cfg(target_os = "linux")]
    {
        let mut known: HashMap<String, ()> =
            ports.iter().map(|p| (p.name.clone(), ())).collect();
        if let Ok(entries) = fs::read_dir("/dev") {
            for entry in entries.flatten() {
                if let Some(fname) = entry.file_name().to_str() {
                    if fname.starts_with("ttyACM") || fname.starts_with("ttyUSB") {
                        let full = format!("/dev/{fname}");
                        if known.insert(full.clone(), ()).is_none() {
                            ports.push(PortInfo {
                                name: full,
                                vid: None,
                                pid: None,
                                product: None,
                                serial_number: None,
                            });
                        }
                    }
                }
            }
        }
    }

    ports.sort_by_key(|p| port_sort_key(&p.name));
    ports
}

/// Open and configure a port for front-end communication: 8N1, no flow
/// control, DTR/RTS asserted so opening the port does not reset the
/// front-end's UART bridge.
pub fn open_port(name: &str, baud: u32) -> Result<SerialChannel, ProtocolError> {
    let mut port = serialport::new(name, baud)
        .timeout(PORT_READ_TIMEOUT)
        .data_bits(serialport::DataBits::Eight)
        .parity(serialport::Parity::None)
        .stop_bits(serialport::StopBits::One)
        .flow_control(serialport::FlowControl::None)
        .open()
        .map_err(|e| ProtocolError::Serial(e.to_string()))?;

    if let Err(e) = port.write_data_terminal_ready(true) {
        tracing::debug!("failed to assert DTR: {e} (continuing)");
    }
    if let Err(e) = port.write_request_to_send(true) {
        tracing::debug!("failed to assert RTS: {e} (continuing)");
    }

    port.clear(serialport::ClearBuffer::All)
        .map_err(|e| ProtocolError::Serial(e.to_string()))?;

    Ok(SerialChannel::new(port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_ports_does_not_panic() {
        for port in list_ports() {
            println!("found port: {} - {:?}", port.name, port.product);
        }
    }

    #[test]
    fn port_ordering() {
        let mut names = vec![
            "/dev/ttyUSB1",
            "/dev/ttyACM10",
            "/dev/ttyUSB0",
            "/dev/ttyACM0",
            "/dev/rfcomm0",
            "/dev/ttyACM2",
        ];
        names.sort_by_key(|n| port_sort_key(n));
        assert_eq!(
            names,
            vec![
                "/dev/ttyACM0",
                "/dev/ttyACM2",
                "/dev/ttyACM10",
                "/dev/ttyUSB0",
                "/dev/ttyUSB1",
                "/dev/rfcomm0",
            ]
        );
    }
}
