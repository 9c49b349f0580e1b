//! Discovery of local-to-public address mappings.
//!
//! Three sources contribute [`MappingHarvester`]s: static mappings from
//! the configuration, cloud instance metadata, and STUN binding probes
//! against public servers. The [`HarvestOrchestrator`] runs all of them
//! once, prunes the results and answers lookups afterwards.

use std::fmt;
use std::net::SocketAddr;

mod cloud;
mod orchestrator;
mod static_mapping;
mod stun;

pub use cloud::MetadataProbe;
pub use orchestrator::HarvestOrchestrator;
pub use stun::{PublicAddressProbe, UdpProbe};

/// Where a mapping came from.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum HarvesterKind {
    /// Configured by the operator.
    Static,
    /// Read from cloud instance metadata.
    Cloud,
    /// Learned from a STUN binding response.
    Stun,
}

/// A local address and the public address it maps to.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct PublicMapping {
    /// Local side of the mapping.
    pub face: SocketAddr,
    /// Public side of the mapping.
    pub mask: SocketAddr,
}

/// One face/mask address mapping together with its matching rule.
///
/// A harvester fresh from discovery may still miss one of its sides;
/// the orchestrator prunes such entries before they become visible.
#[derive(Debug, Clone)]
pub struct MappingHarvester {
    name: String,
    kind: HarvesterKind,
    face: Option<SocketAddr>,
    mask: Option<SocketAddr>,
    match_port: bool,
}

impl MappingHarvester {
    pub(crate) fn new(
        name: String,
        kind: HarvesterKind,
        face: Option<SocketAddr>,
        mask: Option<SocketAddr>,
        match_port: bool,
    ) -> Self {
        Self {
            name,
            kind,
            face,
            mask,
            match_port,
        }
    }
    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn kind(&self) -> HarvesterKind {
        self.kind
    }
    pub fn face(&self) -> Option<SocketAddr> {
        self.face
    }
    pub fn mask(&self) -> Option<SocketAddr> {
        self.mask
    }
    pub fn match_port(&self) -> bool {
        self.match_port
    }

    /// Whether `address` falls on this harvester's public side.
    ///
    /// Addresses are compared by IP; the port participates only for
    /// harvesters built from port-qualified static mappings.
    pub fn matches_public(&self, address: SocketAddr) -> bool {
        match self.mask {
            Some(mask) => {
                address.ip() == mask.ip() && (!self.match_port || address.port() == mask.port())
            }
            None => false,
        }
    }
}

impl fmt::Display for MappingHarvester {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.name)?;
        match self.face {
            Some(face) => write!(f, "face={face}")?,
            None => write!(f, "face=?")?,
        }
        match self.mask {
            Some(mask) => write!(f, ", mask={mask})"),
            None => write!(f, ", mask=?)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn harvester(mask: &str, match_port: bool) -> MappingHarvester {
        MappingHarvester::new(
            "test".to_string(),
            HarvesterKind::Static,
            Some("10.0.0.5:5000".parse().unwrap()),
            Some(mask.parse().unwrap()),
            match_port,
        )
    }

    #[test]
    fn matching_ignores_ports_by_default() {
        let harvester = harvester("203.0.113.5:5000", false);
        assert!(harvester.matches_public("203.0.113.5:5000".parse().unwrap()));
        assert!(harvester.matches_public("203.0.113.5:60111".parse().unwrap()));
        assert!(!harvester.matches_public("203.0.113.6:5000".parse().unwrap()));
    }

    #[test]
    fn port_qualified_matching_checks_the_port() {
        let harvester = harvester("203.0.113.5:5000", true);
        assert!(harvester.matches_public("203.0.113.5:5000".parse().unwrap()));
        assert!(!harvester.matches_public("203.0.113.5:60111".parse().unwrap()));
    }

    #[test]
    fn missing_mask_never_matches() {
        let harvester = MappingHarvester::new(
            "test".to_string(),
            HarvesterKind::Stun,
            Some("10.0.0.5:5000".parse().unwrap()),
            None,
            false,
        );
        assert!(!harvester.matches_public("203.0.113.5:5000".parse().unwrap()));
    }
}
