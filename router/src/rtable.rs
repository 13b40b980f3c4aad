//! Longest-prefix-match over the static routing table.

use crate::config::Route;
use std::net::Ipv4Addr;

#[derive(Debug)]
pub struct RoutingTable {
    routes: Vec<Route>,
    internal_iface: Option<String>,
}

impl RoutingTable {
    pub fn new(routes: Vec<Route>, internal_iface: Option<String>) -> Self {
        Self {
            routes,
            internal_iface,
        }
    }

    /// Returns the most specific route for `dst`.
    ///
    /// Masks are compared as host-order integers; ties go to the earlier
    /// table entry. When nothing matches, the default route bound to the
    /// internal interface is returned if one exists, so replies to hosts
    /// that have fallen out of the table still leave on the internal link.
    pub fn lookup(&self, dst: Ipv4Addr) -> Option<&Route> {
        let mut best: Option<&Route> = None;

        for route in &self.routes {
            let mask = u32::from(route.mask);

            if u32::from(route.destination) & mask != u32::from(dst) & mask {
                continue;
            }

            match best {
                Some(current) if u32::from(current.mask) >= mask => {}
                _ => best = Some(route),
            }
        }

        best.or_else(|| self.internal_default())
    }

    fn internal_default(&self) -> Option<&Route> {
        let internal = self.internal_iface.as_deref()?;

        self.routes.iter().find(|r| r.iface == internal)
    }
}
