//! Sequential IPv4 allocation from a private subnet

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use vessel_core::{Error, Result};

/// Address allocator for one subnet
///
/// The first host address is the bridge gateway and is never handed out.
/// Allocation walks the subnet in order, wraps around at the end and skips
/// addresses still held by a container.
#[derive(Debug, Clone)]
pub struct IpAllocator {
    network: u32,
    prefix: u8,
    /// Host offset tried next
    next: u32,
    owners: BTreeMap<Ipv4Addr, String>,
}

impl IpAllocator {
    /// First host offset available to containers (`.1` is the gateway)
    const FIRST_HOST: u32 = 2;

    /// Create a new IP allocator for a subnet such as `172.18.0.0/16`
    ///
    /// # Errors
    /// Returns error for malformed subnets or prefixes outside 8..=30
    pub fn new(subnet: &str) -> Result<Self> {
        let (base, prefix) = subnet
            .split_once('/')
            .ok_or_else(|| Error::network(format!("Invalid subnet: {subnet}")))?;

        let base: Ipv4Addr = base
            .parse()
            .map_err(|_| Error::network(format!("Invalid IP: {base}")))?;
        let prefix: u8 = prefix
            .parse()
            .ok()
            .filter(|p| (8..=30).contains(p))
            .ok_or_else(|| Error::network(format!("Invalid prefix in subnet: {subnet}")))?;

        let mask = u32::MAX << (32 - prefix);
        Ok(Self {
            network: u32::from(base) & mask,
            prefix,
            next: Self::FIRST_HOST,
            owners: BTreeMap::new(),
        })
    }

    /// Prefix length of the subnet
    #[must_use]
    pub const fn prefix(&self) -> u8 {
        self.prefix
    }

    /// Gateway address assigned to the bridge
    #[must_use]
    pub fn gateway(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.network + 1)
    }

    /// Last usable host offset (the broadcast address is excluded)
    const fn last_host(&self) -> u32 {
        (1u32 << (32 - self.prefix)) - 2
    }

    /// Allocate an address for `owner`
    ///
    /// An owner that already holds an address gets the same one back.
    ///
    /// # Errors
    /// Returns error when every address in the subnet is held
    pub fn allocate(&mut self, owner: &str) -> Result<Ipv4Addr> {
        if let Some(ip) = self.address_of(owner) {
            return Ok(ip);
        }

        let capacity = self.last_host() - Self::FIRST_HOST + 1;
        for _ in 0..capacity {
            let offset = self.next;
            self.next = if offset >= self.last_host() {
                Self::FIRST_HOST
            } else {
                offset + 1
            };

            let candidate = Ipv4Addr::from(self.network + offset);
            if !self.owners.contains_key(&candidate) {
                self.owners.insert(candidate, owner.to_string());
                return Ok(candidate);
            }
        }

        Err(Error::network(format!(
            "Address pool {}/{} exhausted",
            Ipv4Addr::from(self.network),
            self.prefix
        )))
    }

    /// Release whatever address `owner` holds
    pub fn release(&mut self, owner: &str) -> Option<Ipv4Addr> {
        let ip = self.address_of(owner)?;
        self.owners.remove(&ip);
        Some(ip)
    }

    /// Address currently held by `owner`
    #[must_use]
    pub fn address_of(&self, owner: &str) -> Option<Ipv4Addr> {
        self.owners
            .iter()
            .find_map(|(ip, name)| (name == owner).then_some(*ip))
    }

    /// Number of addresses in use
    #[must_use]
    pub fn in_use(&self) -> usize {
        self.owners.len()
    }
}
