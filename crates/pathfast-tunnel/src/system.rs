//! OS Route Tables
//!
//! [`RouteTable`] implementations that shell out to the platform tools:
//! `ip`/`sysctl` on Linux, PowerShell/`netsh`/`route` on Windows.
//! Every command is logged at debug level before it runs.

use crate::route::{InterfaceMetric, NetworkInfo, RouteEntry, RouteError, RouteTable};
use async_trait::async_trait;
use ipnet::Ipv4Net;
use serde::Deserialize;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::process::Command;
use tracing::debug;

/// Route table for the current platform
#[cfg(windows)]
pub fn system_route_table() -> Arc<dyn RouteTable> {
    Arc::new(NetshRouteTable)
}

/// Route table for the current platform
#[cfg(not(windows))]
pub fn system_route_table() -> Arc<dyn RouteTable> {
    Arc::new(IpRouteTable)
}

async fn run(program: &str, args: &[&str]) -> Result<String, RouteError> {
    let command = format!("{} {}", program, args.join(" "));
    debug!("exec: {}", command);

    let mut cmd = Command::new(program);
    cmd.args(args).kill_on_drop(true);
    #[cfg(windows)]
    {
        const CREATE_NO_WINDOW: u32 = 0x0800_0000;
        cmd.creation_flags(CREATE_NO_WINDOW);
    }

    let output = cmd.output().await.map_err(|e| RouteError::Command {
        command: command.clone(),
        reason: e.to_string(),
    })?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(RouteError::Command {
            command,
            reason: format!("{}: {}", output.status, stderr.trim()),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn parse_json<'a, T: Deserialize<'a>>(command: &str, text: &'a str) -> Result<T, RouteError> {
    serde_json::from_str(text).map_err(|e| RouteError::Parse {
        command: command.to_string(),
        reason: e.to_string(),
    })
}

// ===== Linux =====

#[derive(Debug, Deserialize)]
struct IpRoute {
    gateway: Option<Ipv4Addr>,
    dev: String,
    #[serde(default)]
    metric: u32,
}

#[derive(Debug, Deserialize)]
struct IpLink {
    ifindex: u32,
    ifname: String,
    #[serde(default)]
    addr_info: Vec<IpAddrInfo>,
}

#[derive(Debug, Deserialize)]
struct IpAddrInfo {
    family: String,
    local: Ipv4Addr,
    prefixlen: u8,
}

/// Lowest-metric IPv4 default route from `ip -j -4 route show default`
fn parse_ip_default_route(text: &str) -> Result<(Ipv4Addr, String, u32), RouteError> {
    let routes: Vec<IpRoute> = parse_json("ip route show default", text)?;
    routes
        .into_iter()
        .filter_map(|r| r.gateway.map(|gw| (gw, r.dev, r.metric)))
        .min_by_key(|(_, _, metric)| *metric)
        .ok_or(RouteError::NoDefaultRoute)
}

/// Interface index, name and first IPv4 subnet from `ip -j -4 addr show`
fn parse_ip_addr(text: &str) -> Result<(u32, String, Ipv4Net), RouteError> {
    let links: Vec<IpLink> = parse_json("ip addr show", text)?;
    links
        .into_iter()
        .find_map(|link| {
            let info = link.addr_info.iter().find(|a| a.family == "inet")?;
            let subnet = Ipv4Net::new(info.local, info.prefixlen).ok()?;
            Some((link.ifindex, link.ifname, subnet))
        })
        .ok_or_else(|| RouteError::Parse {
            command: "ip addr show".to_string(),
            reason: "no IPv4 address".to_string(),
        })
}

/// `ip`/`sysctl` route table
#[derive(Debug, Default, Clone, Copy)]
pub struct IpRouteTable;

impl IpRouteTable {
    async fn link_name(&self, if_index: u32) -> Result<String, RouteError> {
        let text = run("ip", &["-j", "link", "show"]).await?;
        let links: Vec<IpLink> = parse_json("ip link show", &text)?;
        links
            .into_iter()
            .find(|l| l.ifindex == if_index)
            .map(|l| l.ifname)
            .ok_or_else(|| RouteError::Parse {
                command: "ip link show".to_string(),
                reason: format!("no interface with index {}", if_index),
            })
    }

    async fn route_cmd(&self, verb: &str, route: &RouteEntry) -> Result<(), RouteError> {
        let dev = self.link_name(route.if_index).await?;
        let (dst, gw, metric) = (
            route.destination.to_string(),
            route.gateway.to_string(),
            route.metric.to_string(),
        );
        run("ip", &["route", verb, &dst, "via", &gw, "dev", &dev, "metric", &metric]).await?;
        Ok(())
    }
}

#[async_trait]
impl RouteTable for IpRouteTable {
    async fn default_network(&self) -> Result<NetworkInfo, RouteError> {
        let text = run("ip", &["-j", "-4", "route", "show", "default"]).await?;
        let (gateway, dev, metric) = parse_ip_default_route(&text)?;
        let text = run("ip", &["-j", "-4", "addr", "show", "dev", &dev]).await?;
        let (if_index, if_name, local_subnet) = parse_ip_addr(&text)?;
        Ok(NetworkInfo {
            if_index,
            if_name,
            local_subnet,
            gateway,
            metric,
        })
    }

    async fn default_route_metric(&self, if_index: u32) -> Result<u32, RouteError> {
        let dev = self.link_name(if_index).await?;
        let text = run("ip", &["-j", "-4", "route", "show", "default", "dev", &dev]).await?;
        let routes: Vec<IpRoute> = parse_json("ip route show default", &text)?;
        routes
            .iter()
            .map(|r| r.metric)
            .min()
            .ok_or(RouteError::NoDefaultRoute)
    }

    async fn add_route(&self, route: &RouteEntry) -> Result<(), RouteError> {
        self.route_cmd("add", route).await
    }

    async fn delete_route(&self, route: &RouteEntry) -> Result<(), RouteError> {
        self.route_cmd("del", route).await
    }

    async fn set_interface_metric(
        &self,
        if_index: u32,
        metric: InterfaceMetric,
    ) -> Result<(), RouteError> {
        // Linux has no interface metric; route metrics carry the policy
        debug!("interface #{} metric {:?} ignored", if_index, metric);
        Ok(())
    }

    async fn set_default_route_metric(
        &self,
        network: &NetworkInfo,
        metric: u32,
    ) -> Result<(), RouteError> {
        if network.metric == metric {
            return Ok(());
        }
        let gw = network.gateway.to_string();
        let (new, old) = (metric.to_string(), network.metric.to_string());
        let dev = network.if_name.as_str();
        run("ip", &["route", "add", "default", "via", &gw, "dev", dev, "metric", &new]).await?;
        run("ip", &["route", "del", "default", "via", &gw, "dev", dev, "metric", &old]).await?;
        Ok(())
    }

    async fn set_ip_forwarding(&self, if_index: u32, enabled: bool) -> Result<(), RouteError> {
        let dev = self.link_name(if_index).await?;
        let key = format!("net.ipv4.conf.{}.forwarding={}", dev, u8::from(enabled));
        run("sysctl", &["-w", &key]).await?;
        Ok(())
    }

    async fn interface_index(&self, name: &str) -> Result<Option<u32>, RouteError> {
        let path = format!("/sys/class/net/{}/ifindex", name);
        match tokio::fs::read_to_string(&path).await {
            Ok(text) => text.trim().parse().map(Some).map_err(|_| RouteError::Parse {
                command: path,
                reason: format!("bad ifindex {:?}", text.trim()),
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

// ===== Windows =====

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PsRoute {
    #[serde(rename = "ifIndex")]
    if_index: u32,
    interface_alias: String,
    next_hop: Ipv4Addr,
    route_metric: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PsAddress {
    #[serde(rename = "IPAddress")]
    ip_address: Ipv4Addr,
    prefix_length: u8,
}

fn parse_ps_route(text: &str) -> Result<PsRoute, RouteError> {
    if text.trim().is_empty() {
        return Err(RouteError::NoDefaultRoute);
    }
    parse_json("Get-NetRoute", text.trim())
}

fn parse_ps_address(text: &str) -> Result<Ipv4Net, RouteError> {
    let addr: PsAddress = parse_json("Get-NetIPAddress", text.trim())?;
    Ipv4Net::new(addr.ip_address, addr.prefix_length).map_err(|e| RouteError::Parse {
        command: "Get-NetIPAddress".to_string(),
        reason: e.to_string(),
    })
}

fn parse_ps_number(command: &str, text: &str) -> Result<Option<u32>, RouteError> {
    let text = text.trim();
    if text.is_empty() {
        return Ok(None);
    }
    text.parse().map(Some).map_err(|_| RouteError::Parse {
        command: command.to_string(),
        reason: format!("expected a number, got {:?}", text),
    })
}

/// PowerShell / `netsh` / `route` route table
#[derive(Debug, Default, Clone, Copy)]
pub struct NetshRouteTable;

async fn powershell(script: &str) -> Result<String, RouteError> {
    run("powershell", &["-NoProfile", "-NonInteractive", "-Command", script]).await
}

#[async_trait]
impl RouteTable for NetshRouteTable {
    async fn default_network(&self) -> Result<NetworkInfo, RouteError> {
        let text = powershell(
            "Get-NetRoute -AddressFamily IPv4 -DestinationPrefix 0.0.0.0/0 \
             | Sort-Object RouteMetric | Select-Object -First 1 \
               ifIndex,InterfaceAlias,NextHop,RouteMetric | ConvertTo-Json",
        )
        .await?;
        let route = parse_ps_route(&text)?;

        let text = powershell(&format!(
            "Get-NetIPAddress -AddressFamily IPv4 -InterfaceIndex {} \
             | Select-Object -First 1 IPAddress,PrefixLength | ConvertTo-Json",
            route.if_index
        ))
        .await?;
        let local_subnet = parse_ps_address(&text)?;

        Ok(NetworkInfo {
            if_index: route.if_index,
            if_name: route.interface_alias,
            local_subnet,
            gateway: route.next_hop,
            metric: route.route_metric,
        })
    }

    async fn default_route_metric(&self, if_index: u32) -> Result<u32, RouteError> {
        let script = format!(
            "$r = (Get-NetRoute -AddressFamily IPv4 -DestinationPrefix 0.0.0.0/0 \
                   -InterfaceIndex {0} | Sort-Object RouteMetric | Select-Object -First 1).RouteMetric; \
             $i = (Get-NetIPInterface -AddressFamily IPv4 -InterfaceIndex {0}).InterfaceMetric; \
             $r + $i",
            if_index
        );
        let text = powershell(&script).await?;
        parse_ps_number("default route metric", &text)?.ok_or(RouteError::NoDefaultRoute)
    }

    async fn add_route(&self, route: &RouteEntry) -> Result<(), RouteError> {
        let (dst, mask, gw) = (
            route.destination.network().to_string(),
            route.mask().to_string(),
            route.gateway.to_string(),
        );
        let (metric, index) = (route.metric.to_string(), route.if_index.to_string());
        run("route", &["ADD", &dst, "MASK", &mask, &gw, "METRIC", &metric, "IF", &index]).await?;
        Ok(())
    }

    async fn delete_route(&self, route: &RouteEntry) -> Result<(), RouteError> {
        let (dst, mask, gw) = (
            route.destination.network().to_string(),
            route.mask().to_string(),
            route.gateway.to_string(),
        );
        let (metric, index) = (route.metric.to_string(), route.if_index.to_string());
        run("route", &["DELETE", &dst, "MASK", &mask, &gw, "METRIC", &metric, "IF", &index]).await?;
        Ok(())
    }

    async fn set_interface_metric(
        &self,
        if_index: u32,
        metric: InterfaceMetric,
    ) -> Result<(), RouteError> {
        let value = match metric {
            InterfaceMetric::Automatic => "metric=automatic".to_string(),
            InterfaceMetric::Fixed(m) => format!("metric={}", m),
        };
        let index = if_index.to_string();
        run("netsh", &["interface", "ipv4", "set", "interface", &index, &value]).await?;
        Ok(())
    }

    async fn set_default_route_metric(
        &self,
        network: &NetworkInfo,
        metric: u32,
    ) -> Result<(), RouteError> {
        powershell(&format!(
            "Set-NetRoute -InterfaceIndex {} -DestinationPrefix 0.0.0.0/0 -NextHop {} -RouteMetric {}",
            network.if_index, network.gateway, metric
        ))
        .await?;
        Ok(())
    }

    async fn set_ip_forwarding(&self, if_index: u32, enabled: bool) -> Result<(), RouteError> {
        let state = if enabled { "Enabled" } else { "Disabled" };
        powershell(&format!(
            "Set-NetIPInterface -InterfaceIndex {} -AddressFamily IPv4 -Forwarding {}",
            if_index, state
        ))
        .await?;
        Ok(())
    }

    async fn interface_index(&self, name: &str) -> Result<Option<u32>, RouteError> {
        let text = powershell(&format!(
            "(Get-NetAdapter -Name '{}' -ErrorAction SilentlyContinue).ifIndex",
            name.replace('\'', "''")
        ))
        .await?;
        parse_ps_number("Get-NetAdapter", &text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ip_default_route() {
        let text = r#"[
            {"dst":"default","gateway":"10.0.0.1","dev":"wlan0","protocol":"dhcp","metric":600,"flags":[]},
            {"dst":"default","gateway":"192.168.1.1","dev":"eth0","protocol":"dhcp","metric":100,"flags":[]},
            {"dst":"default","dev":"wg0","scope":"link","flags":[]}
        ]"#;
        let (gw, dev, metric) = parse_ip_default_route(text).unwrap();
        assert_eq!(gw, Ipv4Addr::new(192, 168, 1, 1));
        assert_eq!(dev, "eth0");
        assert_eq!(metric, 100);

        assert!(matches!(parse_ip_default_route("[]"), Err(RouteError::NoDefaultRoute)));
    }

    #[test]
    fn test_parse_ip_addr() {
        let text = r#"[{"ifindex":2,"ifname":"eth0","flags":["UP"],"mtu":1500,
            "addr_info":[{"family":"inet","local":"192.168.1.23","prefixlen":24,"scope":"global"}]}]"#;
        let (index, name, subnet) = parse_ip_addr(text).unwrap();
        assert_eq!(index, 2);
        assert_eq!(name, "eth0");
        assert_eq!(subnet.to_string(), "192.168.1.23/24");
        assert!(parse_ip_addr("[]").is_err());
    }

    #[test]
    fn test_parse_powershell_route() {
        let text = r#"{
            "ifIndex": 12,
            "InterfaceAlias": "Ethernet",
            "NextHop": "192.168.0.1",
            "RouteMetric": 25
        }"#;
        let route = parse_ps_route(text).unwrap();
        assert_eq!(route.if_index, 12);
        assert_eq!(route.interface_alias, "Ethernet");
        assert_eq!(route.next_hop, Ipv4Addr::new(192, 168, 0, 1));
        assert_eq!(route.route_metric, 25);
        assert!(matches!(parse_ps_route("  \r\n"), Err(RouteError::NoDefaultRoute)));
    }

    #[test]
    fn test_parse_powershell_address() {
        let subnet = parse_ps_address(r#"{"IPAddress":"192.168.0.40","PrefixLength":24}"#).unwrap();
        assert_eq!(subnet.to_string(), "192.168.0.40/24");
    }

    #[test]
    fn test_parse_powershell_number() {
        assert_eq!(parse_ps_number("x", "35\r\n").unwrap(), Some(35));
        assert_eq!(parse_ps_number("x", "").unwrap(), None);
        assert!(parse_ps_number("x", "n/a").is_err());
    }

    #[tokio::test]
    async fn test_missing_interface() {
        let index = IpRouteTable.interface_index("pathfast-no-such-if0").await.unwrap();
        assert_eq!(index, None);
    }
}
