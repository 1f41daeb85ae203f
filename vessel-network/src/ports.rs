//! Host port ownership table

use serde::Serialize;
use std::collections::BTreeMap;
use vessel_core::PortMapping;

/// A host port held by a container
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortBinding {
    /// Owning container name
    pub container: String,
    /// Port inside the container
    pub container_port: u16,
}

/// Which container owns which host port
#[derive(Debug, Clone, Default)]
pub struct PortTable {
    bindings: BTreeMap<u16, PortBinding>,
}

impl PortTable {
    /// Create an empty table
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// First requested port already held by another container
    #[must_use]
    pub fn conflict(&self, container: &str, ports: &[PortMapping]) -> Option<(u16, &str)> {
        ports.iter().find_map(|mapping| {
            self.bindings
                .get(&mapping.host)
                .filter(|binding| binding.container != container)
                .map(|binding| (mapping.host, binding.container.as_str()))
        })
    }

    /// Record every mapping for `container`
    ///
    /// Callers validate with [`PortTable::conflict`] first.
    pub fn commit(&mut self, container: &str, ports: &[PortMapping]) {
        for mapping in ports {
            self.bindings.insert(
                mapping.host,
                PortBinding {
                    container: container.to_string(),
                    container_port: mapping.container,
                },
            );
        }
    }

    /// Drop every binding owned by `container`, returning the freed ports
    pub fn release(&mut self, container: &str) -> Vec<u16> {
        let freed: Vec<u16> = self
            .bindings
            .iter()
            .filter(|(_, binding)| binding.container == container)
            .map(|(port, _)| *port)
            .collect();

        for port in &freed {
            self.bindings.remove(port);
        }
        freed
    }

    /// Owner of a host port
    #[must_use]
    pub fn owner(&self, port: u16) -> Option<&PortBinding> {
        self.bindings.get(&port)
    }

    /// Every binding, ordered by host port
    #[must_use]
    pub fn mappings(&self) -> Vec<(u16, PortBinding)> {
        self.bindings
            .iter()
            .map(|(port, binding)| (*port, binding.clone()))
            .collect()
    }

    /// Ports held by `container`
    #[must_use]
    pub fn ports_of(&self, container: &str) -> Vec<u16> {
        self.bindings
            .iter()
            .filter(|(_, binding)| binding.container == container)
            .map(|(port, _)| *port)
            .collect()
    }
}
