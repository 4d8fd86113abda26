//! Local network facts identifying this device

use anyhow::{bail, Context, Result};
use std::fs;
use std::net::UdpSocket;
use std::path::Path;

/// Local address the host would use to reach the internet.
///
/// Connecting a UDP socket sends nothing; it only selects a route.
pub fn outbound_ip() -> Result<String> {
    let socket = UdpSocket::bind("0.0.0.0:0").context("failed to bind probe socket")?;
    socket
        .connect("8.8.8.8:80")
        .context("no route for outbound traffic")?;
    Ok(socket.local_addr()?.ip().to_string())
}

/// Hardware address of `interface`
pub fn mac_address(interface: &str) -> Result<String> {
    read_mac(&Path::new("/sys/class/net").join(interface).join("address"))
        .with_context(|| format!("can't read MAC address of {}", interface))
}

fn read_mac(path: &Path) -> Result<String> {
    let mac = fs::read_to_string(path)?.trim().to_lowercase();
    if mac.is_empty() {
        bail!("interface has no MAC address");
    }
    Ok(mac)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_mac() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("address");

        fs::write(&path, "AA:BB:CC:DD:EE:FF\n").unwrap();
        assert_eq!(read_mac(&path).unwrap(), "aa:bb:cc:dd:ee:ff");

        fs::write(&path, "\n").unwrap();
        assert!(read_mac(&path).is_err());

        assert!(read_mac(&dir.path().join("missing")).is_err());
    }

    #[test]
    fn test_missing_interface() {
        assert!(mac_address("no-such-iface0").is_err());
    }
}
