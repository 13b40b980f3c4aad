//! Immutable startup configuration: interfaces, routes, NAT flag, timeouts.

use crate::rtable::RoutingTable;
use anyhow::{Context as _, Result, ensure};
use eth_frame::MacAddr;
use serde::Deserialize;
use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Internal,
    External,
}

/// One port of the router. Immutable after startup.
#[derive(Debug, Clone)]
pub struct Interface {
    pub name: String,
    pub mac: MacAddr,
    pub ip: Ipv4Addr,
    pub role: Role,
}

/// A static routing-table entry.
#[derive(Debug, Clone)]
pub struct Route {
    pub destination: Ipv4Addr,
    pub mask: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub iface: String,
}

impl Route {
    /// The address the frame is actually handed to on this route.
    ///
    /// A `0.0.0.0` gateway marks an on-link destination.
    pub fn next_hop(&self, dst: Ipv4Addr) -> Ipv4Addr {
        if self.gateway.is_unspecified() {
            dst
        } else {
            self.gateway
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    pub icmp: Duration,
    pub tcp_idle: Duration,
    pub transitory_idle: Duration,
}

#[derive(Debug)]
pub struct RouterConfig {
    pub interfaces: Vec<Interface>,
    pub routes: RoutingTable,
    pub nat_enabled: bool,
    pub timeouts: Timeouts,
}

impl RouterConfig {
    pub fn new(
        interfaces: Vec<Interface>,
        routes: Vec<Route>,
        nat_enabled: bool,
        timeouts: Timeouts,
    ) -> Result<Self> {
        ensure!(!interfaces.is_empty(), "at least one interface is required");

        for route in &routes {
            ensure!(
                interfaces.iter().any(|i| i.name == route.iface),
                "route to {} references unknown interface `{}`",
                route.destination,
                route.iface
            );
        }

        let internal = interfaces
            .iter()
            .filter(|i| i.role == Role::Internal)
            .count();

        if nat_enabled {
            ensure!(
                internal == 1,
                "NAT mode requires exactly one internal interface, found {internal}"
            );
        }

        let internal_iface = interfaces
            .iter()
            .find(|i| i.role == Role::Internal)
            .map(|i| i.name.clone());

        Ok(Self {
            interfaces,
            routes: RoutingTable::new(routes, internal_iface),
            nat_enabled,
            timeouts,
        })
    }

    pub fn interface(&self, name: &str) -> Option<&Interface> {
        self.interfaces.iter().find(|i| i.name == name)
    }

    pub fn interface_by_ip(&self, ip: Ipv4Addr) -> Option<&Interface> {
        self.interfaces.iter().find(|i| i.ip == ip)
    }

    /// Is `ip` the address of any of our interfaces?
    pub fn is_local_ip(&self, ip: Ipv4Addr) -> bool {
        self.interface_by_ip(ip).is_some()
    }
}

#[derive(Deserialize)]
struct ConfigFile {
    interfaces: Vec<InterfaceSpec>,
    routes: Vec<RouteSpec>,
}

#[derive(Deserialize)]
struct InterfaceSpec {
    name: String,
    mac: String,
    ip: Ipv4Addr,
    role: Role,
}

#[derive(Deserialize)]
struct RouteSpec {
    destination: Ipv4Addr,
    mask: Ipv4Addr,
    gateway: Ipv4Addr,
    iface: String,
}

pub fn load(path: &Path, nat_enabled: bool, timeouts: Timeouts) -> Result<RouterConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file `{}`", path.display()))?;
    let file = serde_json::from_str::<ConfigFile>(&raw)
        .with_context(|| format!("Failed to parse config file `{}`", path.display()))?;

    let interfaces = file
        .interfaces
        .into_iter()
        .map(|spec| {
            let mac = spec
                .mac
                .parse::<MacAddr>()
                .with_context(|| format!("Interface `{}`", spec.name))?;

            Ok(Interface {
                name: spec.name,
                mac,
                ip: spec.ip,
                role: spec.role,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let routes = file
        .routes
        .into_iter()
        .map(|spec| Route {
            destination: spec.destination,
            mask: spec.mask,
            gateway: spec.gateway,
            iface: spec.iface,
        })
        .collect();

    RouterConfig::new(interfaces, routes, nat_enabled, timeouts)
}
