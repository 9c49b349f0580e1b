use std::net::SocketAddr;

use crate::config::{StaticMapping, FILLER_PORT};

use super::{HarvesterKind, MappingHarvester};

impl MappingHarvester {
    /// Builds a harvester from one configured mapping.
    ///
    /// A mapping without ports matches by IP alone; the filler port
    /// keeps both addresses well formed without influencing lookups.
    pub(crate) fn from_static(mapping: &StaticMapping) -> Self {
        let face = SocketAddr::new(mapping.local_ip, mapping.local_port.unwrap_or(FILLER_PORT));
        let mask = SocketAddr::new(mapping.public_ip, mapping.public_port.unwrap_or(FILLER_PORT));
        MappingHarvester::new(
            mapping.name.clone(),
            HarvesterKind::Static,
            Some(face),
            Some(mask),
            mapping.local_port.is_some(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ports_carry_over_and_enable_port_matching() {
        let mapping = StaticMapping::new(
            "dmz",
            "10.0.0.5".parse().unwrap(),
            "203.0.113.5".parse().unwrap(),
        )
        .set_ports(5000, 6000);
        let harvester = MappingHarvester::from_static(&mapping);
        assert_eq!(harvester.face(), Some("10.0.0.5:5000".parse().unwrap()));
        assert_eq!(harvester.mask(), Some("203.0.113.5:6000".parse().unwrap()));
        assert!(harvester.match_port());
        assert_eq!(harvester.kind(), HarvesterKind::Static);
    }

    #[test]
    fn missing_ports_get_the_filler_and_match_by_ip() {
        let mapping = StaticMapping::new(
            "dmz",
            "10.0.0.5".parse().unwrap(),
            "203.0.113.5".parse().unwrap(),
        );
        let harvester = MappingHarvester::from_static(&mapping);
        assert_eq!(harvester.face(), Some("10.0.0.5:9".parse().unwrap()));
        assert_eq!(harvester.mask(), Some("203.0.113.5:9".parse().unwrap()));
        assert!(!harvester.match_port());
        assert!(harvester.matches_public("203.0.113.5:60111".parse().unwrap()));
    }
}
