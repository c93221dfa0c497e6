//! Topology description: which nodes to build and how they are wired.
//!
//! ```toml
//! [[nodes]]
//! name = "rtr1"
//! console_port = 65000
//! aux_port = 65001
//! management_port = 2222
//!
//! [[nodes]]
//! name = "rtr2"
//! console_port = 65002
//! aux_port = 65003
//! management_port = 2223
//!
//! [[links]]
//! kind = "point-to-point"
//! endpoints = [
//!   { node = "rtr1", interface = "GigabitEthernet0/0/0/0" },
//!   { node = "rtr2", interface = "GigabitEthernet0/0/0/0" },
//! ]
//! ```
//!
//! The build pipeline only needs each node's identity and ports; links are
//! validated and carried for the hypervisor collaborator.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

use crate::error::{Error, Result};

pub const DEFAULT_CONSOLE_PORT: u16 = 65000;
pub const DEFAULT_AUX_PORT: u16 = 65001;
pub const DEFAULT_MANAGEMENT_PORT: u16 = 2222;

fn default_cpus() -> u32 {
    2
}

fn default_console_port() -> u16 {
    DEFAULT_CONSOLE_PORT
}

fn default_aux_port() -> u16 {
    DEFAULT_AUX_PORT
}

fn default_management_port() -> u16 {
    DEFAULT_MANAGEMENT_PORT
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    /// Guest RAM. `None` lets the image name decide.
    #[serde(default)]
    pub memory_mb: Option<u32>,
    #[serde(default = "default_cpus")]
    pub cpus: u32,
    #[serde(default = "default_console_port")]
    pub console_port: u16,
    #[serde(default = "default_aux_port")]
    pub aux_port: u16,
    /// Host port forwarded to the guest management service.
    #[serde(default = "default_management_port")]
    pub management_port: u16,
}

impl Node {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            memory_mb: None,
            cpus: default_cpus(),
            console_port: DEFAULT_CONSOLE_PORT,
            aux_port: DEFAULT_AUX_PORT,
            management_port: DEFAULT_MANAGEMENT_PORT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LinkKind {
    PointToPoint,
    /// Several nodes on one broadcast segment.
    Shared,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub node: String,
    pub interface: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    pub kind: LinkKind,
    pub endpoints: Vec<Endpoint>,
    /// Address block of a shared segment.
    #[serde(default)]
    pub segment: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub links: Vec<Link>,
}

impl Topology {
    /// One node on the default ports.
    pub fn single(name: &str) -> Self {
        Self {
            nodes: vec![Node::new(name)],
            links: Vec::new(),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("reading {}: {}", path.display(), e)))?;
        Self::parse(&text).map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn parse(text: &str) -> Result<Self> {
        let topology: Self = toml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        topology.validate()?;
        Ok(topology)
    }

    pub fn validate(&self) -> Result<()> {
        if self.nodes.is_empty() {
            return Err(Error::Config("topology has no nodes".into()));
        }

        let mut names = HashSet::new();
        let mut ports = HashSet::new();
        for node in &self.nodes {
            if node.name.is_empty() {
                return Err(Error::Config("node with empty name".into()));
            }
            if !names.insert(node.name.as_str()) {
                return Err(Error::Config(format!("duplicate node '{}'", node.name)));
            }
            for port in [node.console_port, node.aux_port, node.management_port] {
                if !ports.insert(port) {
                    return Err(Error::Config(format!(
                        "node '{}' reuses host port {}",
                        node.name, port
                    )));
                }
            }
        }

        let mut interfaces = HashSet::new();
        for (i, link) in self.links.iter().enumerate() {
            match link.kind {
                LinkKind::PointToPoint if link.endpoints.len() != 2 => {
                    return Err(Error::Config(format!(
                        "link {} is point-to-point but has {} endpoints",
                        i,
                        link.endpoints.len()
                    )));
                }
                LinkKind::Shared if link.segment.is_none() => {
                    return Err(Error::Config(format!(
                        "shared link {} needs a segment address",
                        i
                    )));
                }
                LinkKind::Shared if link.endpoints.len() < 2 => {
                    return Err(Error::Config(format!("shared link {} has fewer than 2 endpoints", i)));
                }
                _ => {}
            }
            for ep in &link.endpoints {
                if !names.contains(ep.node.as_str()) {
                    return Err(Error::Config(format!(
                        "link {} references unknown node '{}'",
                        i, ep.node
                    )));
                }
                if !interfaces.insert((ep.node.as_str(), ep.interface.as_str())) {
                    return Err(Error::Config(format!(
                        "{} {} is used by more than one link",
                        ep.node, ep.interface
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn node(&self, name: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.name == name)
    }

    /// Links touching `node`.
    pub fn links_of<'a>(&'a self, node: &'a str) -> impl Iterator<Item = &'a Link> + 'a {
        self.links
            .iter()
            .filter(move |l| l.endpoints.iter().any(|e| e.node == node))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TWO_NODES: &str = r#"
        [[nodes]]
        name = "rtr1"

        [[nodes]]
        name = "rtr2"
        memory_mb = 3072
        console_port = 65002
        aux_port = 65003
        management_port = 2223

        [[links]]
        kind = "point-to-point"
        endpoints = [
          { node = "rtr1", interface = "GigabitEthernet0/0/0/0" },
          { node = "rtr2", interface = "GigabitEthernet0/0/0/0" },
        ]

        [[links]]
        kind = "shared"
        segment = "11.1.1.0/24"
        endpoints = [
          { node = "rtr1", interface = "GigabitEthernet0/0/0/1" },
          { node = "rtr2", interface = "GigabitEthernet0/0/0/1" },
        ]
    "#;

    #[test]
    fn test_parse_two_nodes() {
        let topo = Topology::parse(TWO_NODES).unwrap();
        assert_eq!(topo.nodes.len(), 2);
        assert_eq!(topo.nodes[0].console_port, DEFAULT_CONSOLE_PORT);
        assert_eq!(topo.node("rtr2").unwrap().memory_mb, Some(3072));
        assert_eq!(topo.links_of("rtr1").count(), 2);
        assert_eq!(topo.links[1].kind, LinkKind::Shared);
    }

    #[test]
    fn test_single_is_valid() {
        Topology::single("iosxrv-fullk9-x64").validate().unwrap();
    }

    #[test]
    fn test_rejects_port_clash() {
        let err = Topology::parse("[[nodes]]\nname = \"a\"\n[[nodes]]\nname = \"b\"\n").unwrap_err();
        assert!(err.to_string().contains("reuses host port 65000"));
    }

    #[test]
    fn test_rejects_unknown_link_node() {
        let text = r#"
            [[nodes]]
            name = "a"
            [[links]]
            kind = "point-to-point"
            endpoints = [
              { node = "a", interface = "Gi0" },
              { node = "ghost", interface = "Gi0" },
            ]
        "#;
        let err = Topology::parse(text).unwrap_err();
        assert!(err.to_string().contains("unknown node 'ghost'"));
    }

    #[test]
    fn test_rejects_shared_without_segment() {
        let text = TWO_NODES.replace("segment = \"11.1.1.0/24\"", "");
        assert!(Topology::parse(&text).is_err());
    }

    #[test]
    fn test_rejects_empty() {
        assert!(Topology::parse("").is_err());
    }
}
