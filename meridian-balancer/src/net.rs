//! Network-interface operations: VIP addresses and gratuitous ARP.

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::error::NetError;
use crate::syncers::command::{args, command_line, CommandRunner};

/// Address and ARP operations on a network interface.
#[async_trait]
pub trait NetOps: Send + Sync {
    /// The VIPs currently carried on `iface`.
    async fn list_vips(&self, iface: &str) -> Result<BTreeSet<IpAddr>, NetError>;

    /// Add `addr` to `iface` as a VIP.
    async fn add_vip(&self, addr: IpAddr, iface: &str) -> Result<(), NetError>;

    /// Remove the VIP `addr` from `iface`.
    async fn del_vip(&self, addr: IpAddr, iface: &str) -> Result<(), NetError>;

    /// Remove every VIP from `iface`. Succeeds when there is nothing to
    /// remove.
    async fn del_vips(&self, iface: &str) -> Result<(), NetError>;

    /// Announce `addr` on `iface` with an unsolicited ARP reply.
    async fn send_gratuitous_arp(&self, addr: IpAddr, iface: &str) -> Result<(), NetError>;
}

/// The address label VIPs carry on `iface`.
pub fn vip_label(iface: &str) -> String {
    format!("{iface}:vip")
}

/// [`NetOps`] backed by the `ip` and `arping` tools.
pub struct IpCommandNetOps {
    runner: Arc<dyn CommandRunner>,
}

impl IpCommandNetOps {
    /// Drive the host tools through `runner`.
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }
}

/// Parse `ip -o addr show label <label>` output.
///
/// Lines look like
/// `2: eth0    inet 10.0.0.5/32 scope global eth0:vip\       valid_lft ...`.
fn parse_addresses(command: &str, output: &str) -> Result<BTreeSet<IpAddr>, NetError> {
    let mut addrs = BTreeSet::new();
    for line in output.lines().filter(|l| !l.trim().is_empty()) {
        let mut fields = line.split_whitespace();
        let cidr = fields
            .by_ref()
            .skip_while(|f| *f != "inet" && *f != "inet6")
            .nth(1);
        let addr = cidr
            .and_then(|c| c.split('/').next())
            .and_then(|a| a.parse().ok())
            .ok_or_else(|| NetError::UnexpectedOutput {
                command: command.to_string(),
                line: line.to_string(),
            })?;
        addrs.insert(addr);
    }
    Ok(addrs)
}

fn host_cidr(addr: IpAddr) -> String {
    let prefix = if addr.is_ipv4() { 32 } else { 128 };
    format!("{addr}/{prefix}")
}

#[async_trait]
impl NetOps for IpCommandNetOps {
    async fn list_vips(&self, iface: &str) -> Result<BTreeSet<IpAddr>, NetError> {
        let argv = args(["-o", "addr", "show", "label", vip_label(iface).as_str()]);
        let output = self.runner.run("ip", &argv).await?;
        parse_addresses(&command_line("ip", &argv), &output)
    }

    async fn add_vip(&self, addr: IpAddr, iface: &str) -> Result<(), NetError> {
        let argv = args([
            "addr".to_string(),
            "add".to_string(),
            host_cidr(addr),
            "dev".to_string(),
            iface.to_string(),
            "label".to_string(),
            vip_label(iface),
        ]);
        self.runner.run("ip", &argv).await?;
        info!(%addr, iface, "vip added");
        Ok(())
    }

    async fn del_vip(&self, addr: IpAddr, iface: &str) -> Result<(), NetError> {
        let argv = args([
            "addr".to_string(),
            "del".to_string(),
            host_cidr(addr),
            "dev".to_string(),
            iface.to_string(),
        ]);
        self.runner.run("ip", &argv).await?;
        info!(%addr, iface, "vip removed");
        Ok(())
    }

    async fn del_vips(&self, iface: &str) -> Result<(), NetError> {
        let vips = self.list_vips(iface).await?;
        if vips.is_empty() {
            debug!(iface, "no vips to flush");
            return Ok(());
        }
        for addr in vips {
            self.del_vip(addr, iface).await?;
        }
        Ok(())
    }

    async fn send_gratuitous_arp(&self, addr: IpAddr, iface: &str) -> Result<(), NetError> {
        let argv = args([
            "-A".to_string(),
            "-c".to_string(),
            "1".to_string(),
            "-I".to_string(),
            iface.to_string(),
            addr.to_string(),
        ]);
        self.runner.run("arping", &argv).await?;
        debug!(%addr, iface, "gratuitous arp sent");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syncers::command::testing::RecordingRunner;

    const LISTING: &str = "\
2: eth0    inet 10.0.0.5/32 scope global eth0:vip\\       valid_lft forever preferred_lft forever
2: eth0    inet 10.0.0.6/32 scope global eth0:vip\\       valid_lft forever preferred_lft forever
";

    #[test]
    fn test_parse_addresses() {
        let addrs = parse_addresses("ip", LISTING).unwrap();
        let want: BTreeSet<IpAddr> = ["10.0.0.5", "10.0.0.6"]
            .iter()
            .map(|a| a.parse().unwrap())
            .collect();
        assert_eq!(addrs, want);
        assert!(parse_addresses("ip", "").unwrap().is_empty());
        assert!(matches!(
            parse_addresses("ip", "garbage"),
            Err(NetError::UnexpectedOutput { .. })
        ));
    }

    #[tokio::test]
    async fn test_del_vips_removes_each_listed_address() {
        let runner = Arc::new(RecordingRunner::default());
        runner.respond("ip -o addr show", LISTING);
        let net = IpCommandNetOps::new(runner.clone());

        net.del_vips("eth0").await.unwrap();
        assert_eq!(
            runner.take(),
            vec![
                "ip -o addr show label eth0:vip",
                "ip addr del 10.0.0.5/32 dev eth0",
                "ip addr del 10.0.0.6/32 dev eth0",
            ]
        );
    }

    #[tokio::test]
    async fn test_flush_with_nothing_to_remove() {
        let runner = Arc::new(RecordingRunner::default());
        let net = IpCommandNetOps::new(runner.clone());
        net.del_vips("eth0").await.unwrap();
        assert_eq!(runner.take(), vec!["ip -o addr show label eth0:vip"]);
    }

    #[tokio::test]
    async fn test_add_and_announce() {
        let runner = Arc::new(RecordingRunner::default());
        let net = IpCommandNetOps::new(runner.clone());
        let addr: IpAddr = "10.0.0.7".parse().unwrap();

        net.add_vip(addr, "eth0").await.unwrap();
        net.send_gratuitous_arp(addr, "eth0").await.unwrap();
        assert_eq!(
            runner.take(),
            vec![
                "ip addr add 10.0.0.7/32 dev eth0 label eth0:vip",
                "arping -A -c 1 -I eth0 10.0.0.7",
            ]
        );
    }
}
