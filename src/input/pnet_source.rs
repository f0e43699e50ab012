//! pnet-based live capture source.

use std::io::ErrorKind;
use std::time::Duration;

use bytes::Bytes;
use pnet::datalink::{self, Channel, Config, DataLinkReceiver, NetworkInterface};

use super::{PacketSource, RawFrame};
use crate::error::{CaptureError, SourceError};
use crate::packet::{LinkType, Timestamp};

/// Read timeout; lets the reader notice shutdown on a quiet link.
const READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Live Ethernet capture using the pnet library.
pub struct PnetSource {
    interface: NetworkInterface,
    rx: Box<dyn DataLinkReceiver>,
}

impl PnetSource {
    /// Open a capture on the specified interface.
    pub fn open(interface_name: &str) -> Result<Self, CaptureError> {
        let interface = datalink::interfaces()
            .into_iter()
            .find(|iface| iface.name == interface_name)
            .ok_or_else(|| CaptureError::InterfaceNotFound(interface_name.to_string()))?;

        Self::on_interface(interface)
    }

    /// Open a capture on the first suitable interface.
    ///
    /// Looks for an interface that is up and not a loopback.
    pub fn on_default_interface() -> Result<Self, CaptureError> {
        let interface = datalink::interfaces()
            .into_iter()
            .find(|iface| iface.is_up() && !iface.is_loopback() && !iface.ips.is_empty())
            .ok_or_else(|| {
                CaptureError::InterfaceNotFound("no suitable interface found".to_string())
            })?;

        Self::on_interface(interface)
    }

    fn on_interface(interface: NetworkInterface) -> Result<Self, CaptureError> {
        let config = Config {
            read_timeout: Some(READ_TIMEOUT),
            ..Config::default()
        };

        let rx = match datalink::channel(&interface, config) {
            Ok(Channel::Ethernet(_tx, rx)) => rx,
            Ok(_) => {
                return Err(CaptureError::ChannelCreation(
                    "unsupported channel type".to_string(),
                ))
            }
            Err(e) => {
                let msg = e.to_string();
                if msg.contains("permission") || msg.contains("Operation not permitted") {
                    return Err(CaptureError::InsufficientPermissions);
                }
                return Err(CaptureError::ChannelCreation(msg));
            }
        };

        Ok(Self { interface, rx })
    }

    /// List all available network interfaces.
    pub fn list_interfaces() -> Vec<String> {
        datalink::interfaces()
            .into_iter()
            .map(|iface| {
                let status = if iface.is_up() { "UP" } else { "DOWN" };
                let ips: Vec<_> = iface.ips.iter().map(|ip| ip.to_string()).collect();
                format!(
                    "{}: {} [{}]",
                    iface.name,
                    status,
                    if ips.is_empty() {
                        "no IP".to_string()
                    } else {
                        ips.join(", ")
                    }
                )
            })
            .collect()
    }
}

impl PacketSource for PnetSource {
    fn read(&mut self) -> Result<Option<RawFrame>, SourceError> {
        match self.rx.next() {
            Ok(frame) => Ok(Some(RawFrame::new(
                Bytes::copy_from_slice(frame),
                Timestamp::now(),
                LinkType::Ethernet,
            ))),
            Err(e) => Err(classify_read_error(&e)),
        }
    }

    fn name(&self) -> &str {
        &self.interface.name
    }
}

fn classify_read_error(e: &std::io::Error) -> SourceError {
    match e.kind() {
        ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted => {
            SourceError::Transient(e.to_string())
        }
        _ => SourceError::Fatal(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeouts_are_transient() {
        let timeout = std::io::Error::new(ErrorKind::TimedOut, "timed out");
        assert!(matches!(
            classify_read_error(&timeout),
            SourceError::Transient(_)
        ));

        let gone = std::io::Error::new(ErrorKind::NotFound, "no such device");
        assert!(matches!(classify_read_error(&gone), SourceError::Fatal(_)));
    }

    #[test]
    fn test_open_unknown_interface() {
        let result = PnetSource::open("definitely-not-an-interface0");
        assert!(matches!(result, Err(CaptureError::InterfaceNotFound(_))));
    }
}
