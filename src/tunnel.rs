//! WireGuard tunnel to the control plane
//!
//! The interface is rebuilt from the device descriptor on every session
//! start using the `ip` and `wg` tools.

use crate::config::TUNNEL_KEY_ENV_KEY;
use crate::registration::secret::{FirmwareEnv, SecretStore};
use crate::transport::ControlPlaneClient;
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use std::net::IpAddr;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};
use udpu_shared::{timing, DeviceDescriptor, PeerRegistration};

const DEFAULT_INTERFACE: &str = "wg0";

/// Brings up the secure tunnel for a registered device
#[async_trait]
pub trait TunnelSetup: Send + Sync {
    /// Returns the server's tunnel address when a tunnel was configured
    async fn bring_up(&self, descriptor: &DeviceDescriptor) -> Result<Option<String>>;
}

pub struct WireGuardTunnel {
    client: ControlPlaneClient,
    keys: Box<dyn SecretStore>,
}

impl WireGuardTunnel {
    pub fn new(client: ControlPlaneClient) -> Self {
        Self {
            client,
            keys: Box::new(FirmwareEnv::new(TUNNEL_KEY_ENV_KEY)),
        }
    }

    async fn private_key(&self) -> Result<String> {
        match self.keys.load().await {
            Ok(Some(key)) => return Ok(key),
            Ok(None) => debug!("No tunnel key stored, generating one"),
            Err(e) => warn!("Can't read tunnel key: {:#}", e),
        }

        let key = run("wg", &["genkey"], None).await?;
        if let Err(e) = self.keys.save(&key).await {
            warn!("Can't persist tunnel key: {:#}", e);
        }
        Ok(key)
    }
}

#[async_trait]
impl TunnelSetup for WireGuardTunnel {
    async fn bring_up(&self, descriptor: &DeviceDescriptor) -> Result<Option<String>> {
        if descriptor.wg_client_ip.trim().is_empty() {
            debug!("No tunnel address assigned");
            return Ok(None);
        }

        let iface = match descriptor.wg_interface.trim() {
            "" => DEFAULT_INTERFACE,
            name => name,
        };

        // Recreate from scratch
        if let Err(e) = run("ip", &["link", "del", iface], None).await {
            debug!("No previous interface {}: {:#}", iface, e);
        }
        run("ip", &["link", "add", iface, "type", "wireguard"], None).await?;
        run(
            "ip",
            &["address", "replace", descriptor.wg_client_ip.trim(), "dev", iface],
            None,
        )
        .await?;
        run("ip", &["link", "set", "up", "dev", iface], None).await?;

        let server_host = host_part(&descriptor.wg_server_ip);
        let mut allowed = vec![normalize_route(server_host)?];
        for route in descriptor.wg_routes.split(',').map(str::trim).filter(|r| !r.is_empty()) {
            let route = normalize_route(route)?;
            if !allowed.contains(&route) {
                allowed.push(route);
            }
        }

        let private_key = self.private_key().await?;
        let endpoint = join_host_port(descriptor.endpoint.trim(), descriptor.wg_server_port.trim());
        let keepalive = timing::TUNNEL_KEEPALIVE.as_secs().to_string();
        let allowed_ips = allowed.join(",");
        run(
            "wg",
            &[
                "set",
                iface,
                "private-key",
                "/dev/stdin",
                "peer",
                descriptor.wg_server_public_key.trim(),
                "endpoint",
                &endpoint,
                "allowed-ips",
                &allowed_ips,
                "persistent-keepalive",
                &keepalive,
            ],
            Some(&private_key),
        )
        .await?;

        for network in &allowed {
            run("ip", &["route", "replace", network, "dev", iface], None)
                .await
                .with_context(|| format!("failed to add route {}", network))?;
        }

        let public_key = run("wg", &["pubkey"], Some(&private_key)).await?;
        info!("Registering WireGuard peer");
        self.client
            .register_peer(&PeerRegistration {
                public_key,
                allowed_ips: vec![descriptor.wg_client_ip.trim().to_string()],
            })
            .await?;

        info!("WireGuard setup complete on {}", iface);
        Ok(Some(server_host.to_string()))
    }
}

/// Address part of a CIDR string
fn host_part(cidr: &str) -> &str {
    cidr.split('/').next().unwrap_or_default().trim()
}

/// Canonical network for a route: CIDRs are masked, bare hosts become /32 or /128
pub fn normalize_route(route: &str) -> Result<String> {
    let (addr, prefix) = match route.split_once('/') {
        Some((addr, prefix)) => (addr.trim(), Some(prefix.trim())),
        None => (route.trim(), None),
    };
    let ip: IpAddr = addr
        .parse()
        .map_err(|_| anyhow!("invalid IP {:?}", route))?;
    let max = if ip.is_ipv4() { 32 } else { 128 };
    let prefix = match prefix {
        Some(p) => p
            .parse::<u8>()
            .ok()
            .filter(|p| *p <= max)
            .ok_or_else(|| anyhow!("invalid CIDR {:?}", route))?,
        None => max,
    };

    let network = match ip {
        IpAddr::V4(v4) => {
            let mask = u32::MAX.checked_shl(32 - u32::from(prefix)).unwrap_or(0);
            IpAddr::from((u32::from(v4) & mask).to_be_bytes())
        }
        IpAddr::V6(v6) => {
            let mask = u128::MAX.checked_shl(128 - u32::from(prefix)).unwrap_or(0);
            IpAddr::from((u128::from(v6) & mask).to_be_bytes())
        }
    };
    Ok(format!("{}/{}", network, prefix))
}

fn join_host_port(host: &str, port: &str) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// Run a tool, optionally feeding `stdin`, returning trimmed stdout
async fn run(program: &str, args: &[&str], stdin: Option<&str>) -> Result<String> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("failed to run {}", program))?;

    if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
        pipe.write_all(input.as_bytes()).await?;
    }

    let output = child.wait_with_output().await?;
    if !output.status.success() {
        bail!(
            "{} {} failed: {}",
            program,
            args.first().copied().unwrap_or_default(),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_route() {
        assert_eq!(normalize_route("10.1.2.3/24").unwrap(), "10.1.2.0/24");
        assert_eq!(normalize_route("10.1.2.3").unwrap(), "10.1.2.3/32");
        assert_eq!(normalize_route(" 192.168.0.0/16 ").unwrap(), "192.168.0.0/16");
        assert_eq!(normalize_route("0.0.0.0/0").unwrap(), "0.0.0.0/0");
        assert_eq!(normalize_route("fd00::1").unwrap(), "fd00::1/128");
        assert_eq!(normalize_route("fd00::1/64").unwrap(), "fd00::/64");

        assert!(normalize_route("not-an-ip").is_err());
        assert!(normalize_route("10.0.0.0/33").is_err());
    }

    #[test]
    fn test_host_part() {
        assert_eq!(host_part("10.66.0.2/31"), "10.66.0.2");
        assert_eq!(host_part("10.66.0.2"), "10.66.0.2");
    }

    #[test]
    fn test_join_host_port() {
        assert_eq!(join_host_port("vpn.example.com", "51820"), "vpn.example.com:51820");
        assert_eq!(join_host_port("fd00::1", "51820"), "[fd00::1]:51820");
    }

    #[tokio::test]
    async fn test_no_client_address_is_noop() {
        let client = ControlPlaneClient::new(
            crate::config::Endpoints::local_test(),
            std::time::Duration::from_secs(1),
        )
        .unwrap();
        let tunnel = WireGuardTunnel::new(client);
        let result = tunnel.bring_up(&DeviceDescriptor::default()).await.unwrap();
        assert_eq!(result, None);
    }
}
