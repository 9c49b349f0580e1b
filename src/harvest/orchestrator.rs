//! Runs every configured discovery mechanism once and serves the
//! pruned result.
//!
//! Discovery happens lazily on the first call to
//! [`HarvestOrchestrator::harvesters`]; concurrent callers share the
//! same run. Dropping the first caller's future aborts the outstanding
//! probes and a later call starts over.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use network_interface::{NetworkInterface, NetworkInterfaceConfig};
use tokio::sync::OnceCell;
use tokio::task::JoinSet;

use crate::config::HarvestConfig;

use super::cloud::{self, MetadataProbe};
use super::stun::{PublicAddressProbe, UdpProbe};
use super::{HarvesterKind, MappingHarvester};

const STUN_PORT: u16 = 3478;
const CLOUD_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(3);

pub struct HarvestOrchestrator {
    config: HarvestConfig,
    probe: Arc<dyn PublicAddressProbe>,
    metadata: Option<Arc<dyn MetadataProbe>>,
    init: OnceCell<Vec<MappingHarvester>>,
    stun_discovery_failed: AtomicBool,
}

impl HarvestOrchestrator {
    pub fn new(config: HarvestConfig) -> Self {
        let probe = Arc::new(UdpProbe::new(
            config.probe_timeout,
            config.probe_retransmits,
        ));
        Self::with_probe(config, probe)
    }

    /// Same as [`Self::new`] with the address probe swapped out.
    pub fn with_probe(config: HarvestConfig, probe: Arc<dyn PublicAddressProbe>) -> Self {
        Self {
            config,
            probe,
            metadata: None,
            init: OnceCell::new(),
            stun_discovery_failed: AtomicBool::new(false),
        }
    }

    pub fn set_metadata_probe(mut self, metadata: Arc<dyn MetadataProbe>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// The pruned harvester list, running discovery on first use.
    pub async fn harvesters(&self) -> &[MappingHarvester] {
        self.init.get_or_init(|| self.initialize()).await
    }

    /// First harvester whose public side covers `address`.
    pub async fn find_for_address(&self, address: SocketAddr) -> Option<&MappingHarvester> {
        self.harvesters()
            .await
            .iter()
            .find(|harvester| harvester.matches_public(address))
    }

    /// Whether servers were configured and none of them yielded a
    /// mapping. Callers can treat their own reachability checks as
    /// suspect while this holds. Stays `false` until discovery ran.
    pub fn stun_discovery_failed(&self) -> bool {
        self.stun_discovery_failed.load(Ordering::Relaxed)
    }

    async fn initialize(&self) -> Vec<MappingHarvester> {
        let mut harvesters = Vec::new();

        for mapping in &self.config.static_mappings {
            harvesters.push(MappingHarvester::from_static(mapping));
        }

        if self.config.enable_cloud_harvester
            && (self.config.force_cloud_harvester || cloud::looks_like_cloud_host())
        {
            harvesters.push(self.cloud_harvester().await);
        }

        let discovered = self.stun_harvesters().await;
        // The flag reflects discovery alone. Later pruning may drop a
        // discovered mapping without making the servers unreachable.
        if !self.config.stun_servers.is_empty() && discovered.is_empty() {
            self.stun_discovery_failed.store(true, Ordering::Relaxed);
        }
        harvesters.extend(discovered);

        let harvesters = prune(harvesters);
        for harvester in &harvesters {
            log::info!("using mapping harvester {harvester}");
        }
        harvesters
    }

    async fn cloud_harvester(&self) -> MappingHarvester {
        let discovered = match &self.metadata {
            Some(metadata) => {
                match tokio::time::timeout(CLOUD_DISCOVERY_TIMEOUT, metadata.discover()).await {
                    Ok(result) => result,
                    Err(_) => Err(anyhow!("discovery timed out")),
                }
            }
            None => Err(anyhow!("no metadata probe configured")),
        };
        match discovered {
            Ok(mapping) => MappingHarvester::new(
                "cloud-metadata".to_string(),
                HarvesterKind::Cloud,
                Some(mapping.face),
                Some(mapping.mask),
                false,
            ),
            Err(e) => {
                log::warn!("cloud address discovery failed: {e:?}");
                // Incomplete on purpose, the prune pass drops it.
                MappingHarvester::new(
                    "cloud-metadata".to_string(),
                    HarvesterKind::Cloud,
                    None,
                    None,
                    false,
                )
            }
        }
    }

    async fn stun_harvesters(&self) -> Vec<MappingHarvester> {
        if self.config.stun_servers.is_empty() {
            return vec![];
        }
        let servers = normalize_servers(&self.config.stun_servers);
        if servers.is_empty() {
            return vec![];
        }
        let locals = match local_candidate_addresses() {
            Ok(locals) if !locals.is_empty() => locals,
            Ok(_) => {
                log::warn!("no local addresses usable for binding discovery");
                return vec![];
            }
            Err(e) => {
                log::warn!("listing local addresses failed: {e:?}");
                return vec![];
            }
        };

        let mut tasks = JoinSet::new();
        for server in servers {
            for local in &locals {
                tasks.spawn(probe_server(self.probe.clone(), *local, server.clone()));
            }
        }
        let mut harvesters = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Some(harvester)) => harvesters.push(harvester),
                Ok(None) => {}
                // One panicking probe must not take down its siblings.
                Err(e) => log::warn!("binding discovery task failed: {e:?}"),
            }
        }
        harvesters
    }
}

async fn probe_server(
    probe: Arc<dyn PublicAddressProbe>,
    local: IpAddr,
    server: String,
) -> Option<MappingHarvester> {
    let addr = match resolve(&server).await {
        Ok(addr) => addr,
        Err(e) => {
            log::debug!("resolving {server:?} failed: {e:?}");
            return None;
        }
    };
    match probe.probe(local, addr).await {
        Ok(mapping) => Some(MappingHarvester::new(
            server,
            HarvesterKind::Stun,
            Some(mapping.face),
            Some(mapping.mask),
            false,
        )),
        Err(e) => {
            log::debug!("binding discovery via {server:?} from {local} failed: {e:?}");
            None
        }
    }
}

async fn resolve(server: &str) -> anyhow::Result<SocketAddr> {
    tokio::net::lookup_host(server)
        .await?
        .find(SocketAddr::is_ipv4)
        .with_context(|| format!("no usable address for {server:?}"))
}

/// Applies the default port to bare hosts and drops entries that still
/// do not parse, each with its own log line.
fn normalize_servers(servers: &[String]) -> Vec<String> {
    let mut normalized = Vec::with_capacity(servers.len());
    for server in servers {
        let mut server = server.clone();
        if !server.contains(':') {
            server.push_str(&format!(":{STUN_PORT}"));
        }
        match server.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {
                normalized.push(server)
            }
            _ => log::error!("malformed server entry {server:?}"),
        }
    }
    normalized
}

/// Local IPv4 addresses worth probing from. Loopback and unspecified
/// addresses never produce useful mappings; IPv6 stays out because the
/// mappings this crate serves are v4.
fn local_candidate_addresses() -> anyhow::Result<Vec<IpAddr>> {
    let interfaces =
        NetworkInterface::show().map_err(|e| anyhow!("listing interfaces failed: {e:?}"))?;
    let mut locals = Vec::new();
    for interface in interfaces {
        for addr in interface.addr {
            if let IpAddr::V4(ip) = addr.ip() {
                if ip.is_loopback() || ip.is_unspecified() {
                    continue;
                }
                let ip = IpAddr::V4(ip);
                if !locals.contains(&ip) {
                    locals.push(ip);
                }
            }
        }
    }
    Ok(locals)
}

/// Drops incomplete harvesters and ones whose two sides are the same
/// address, then deduplicates by address pair. The first harvester
/// with a given face/mask IP pair wins; later ones lose even when
/// their ports differ.
fn prune(harvesters: Vec<MappingHarvester>) -> Vec<MappingHarvester> {
    let mut kept: Vec<MappingHarvester> = Vec::with_capacity(harvesters.len());
    for harvester in harvesters {
        let (face, mask) = match (harvester.face(), harvester.mask()) {
            (Some(face), Some(mask)) if face != mask => (face, mask),
            _ => {
                log::info!("discarding mapping harvester {harvester}");
                continue;
            }
        };
        let duplicate = kept.iter().position(|h| {
            h.face().map(|f| f.ip()) == Some(face.ip())
                && h.mask().map(|m| m.ip()) == Some(mask.ip())
        });
        match duplicate {
            Some(index) => log::info!(
                "discarding duplicate mapping harvester {harvester}, kept {}",
                kept[index]
            ),
            None => kept.push(harvester),
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StaticMapping;
    use crate::harvest::PublicMapping;
    use async_trait::async_trait;
    use std::io;

    struct FixedProbe {
        mask: SocketAddr,
    }

    #[async_trait]
    impl PublicAddressProbe for FixedProbe {
        async fn probe(
            &self,
            local: IpAddr,
            _server: SocketAddr,
        ) -> crate::error::Result<PublicMapping> {
            Ok(PublicMapping {
                face: SocketAddr::new(local, 50000),
                mask: self.mask,
            })
        }
    }

    struct FailingProbe;

    #[async_trait]
    impl PublicAddressProbe for FailingProbe {
        async fn probe(
            &self,
            _local: IpAddr,
            _server: SocketAddr,
        ) -> crate::error::Result<PublicMapping> {
            Err(io::Error::from(io::ErrorKind::TimedOut).into())
        }
    }

    struct FixedMetadata {
        mapping: PublicMapping,
    }

    #[async_trait]
    impl MetadataProbe for FixedMetadata {
        async fn discover(&self) -> anyhow::Result<PublicMapping> {
            Ok(self.mapping)
        }
    }

    struct BrokenMetadata;

    #[async_trait]
    impl MetadataProbe for BrokenMetadata {
        async fn discover(&self) -> anyhow::Result<PublicMapping> {
            Err(anyhow!("metadata service unreachable"))
        }
    }

    fn harvester(name: &str, face: &str, mask: &str) -> MappingHarvester {
        MappingHarvester::new(
            name.to_string(),
            HarvesterKind::Stun,
            Some(face.parse().unwrap()),
            Some(mask.parse().unwrap()),
            false,
        )
    }

    #[test]
    fn prune_drops_incomplete_and_self_mapped_entries() {
        let incomplete = MappingHarvester::new(
            "incomplete".to_string(),
            HarvesterKind::Cloud,
            None,
            None,
            false,
        );
        let self_mapped = harvester("self", "192.0.2.1:4000", "192.0.2.1:4000");
        // Same IP on both sides but different ports is a real mapping.
        let port_mapped = harvester("ports", "192.0.2.1:4000", "192.0.2.1:4001");
        let kept = prune(vec![incomplete, self_mapped, port_mapped]);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].name(), "ports");
    }

    #[test]
    fn prune_deduplicates_by_address_pair_first_wins() {
        let first = harvester("first", "10.0.0.1:1000", "203.0.113.1:1000");
        let same_ips = harvester("second", "10.0.0.1:2222", "203.0.113.1:3333");
        let other = harvester("third", "10.0.0.2:1000", "203.0.113.1:1000");
        let kept = prune(vec![first, same_ips, other]);
        let names: Vec<&str> = kept.iter().map(|h| h.name()).collect();
        assert_eq!(names, ["first", "third"]);
    }

    #[test]
    fn malformed_server_entries_are_dropped_individually() {
        let servers = vec![
            "stun.example.org".to_string(),
            "stun.example.org:3478".to_string(),
            "stun.example.org:notaport".to_string(),
            ":3478".to_string(),
        ];
        let normalized = normalize_servers(&servers);
        assert_eq!(
            normalized,
            ["stun.example.org:3478", "stun.example.org:3478"]
        );
    }

    #[tokio::test]
    async fn no_configured_servers_is_not_a_discovery_failure() {
        let config = HarvestConfig::empty();
        let orchestrator = HarvestOrchestrator::with_probe(config, Arc::new(FailingProbe));
        assert!(orchestrator.harvesters().await.is_empty());
        assert!(!orchestrator.stun_discovery_failed());
    }

    #[tokio::test]
    async fn failed_discovery_raises_the_flag() {
        let config =
            HarvestConfig::empty().set_stun_servers(vec!["127.0.0.1:3478".to_string()]);
        let orchestrator = HarvestOrchestrator::with_probe(config, Arc::new(FailingProbe));
        assert!(orchestrator.harvesters().await.is_empty());
        assert!(orchestrator.stun_discovery_failed());
    }

    #[tokio::test]
    async fn all_malformed_servers_count_as_failed_discovery() {
        let config = HarvestConfig::empty().set_stun_servers(vec!["no port here".to_string()]);
        let orchestrator = HarvestOrchestrator::with_probe(config, Arc::new(FailingProbe));
        assert!(orchestrator.harvesters().await.is_empty());
        assert!(orchestrator.stun_discovery_failed());
    }

    #[tokio::test]
    async fn successful_discovery_keeps_the_flag_down() {
        // Needs at least one non-loopback interface to probe from.
        match local_candidate_addresses() {
            Ok(locals) if !locals.is_empty() => {}
            _ => return,
        }
        let config = HarvestConfig::empty()
            .set_stun_servers(vec!["127.0.0.1:3478".to_string(), "127.0.0.2:3478".to_string()]);
        let probe = FixedProbe {
            mask: "203.0.113.9:41000".parse().unwrap(),
        };
        let orchestrator = HarvestOrchestrator::with_probe(config, Arc::new(probe));
        let harvesters = orchestrator.harvesters().await;
        assert!(!harvesters.is_empty());
        assert!(harvesters
            .iter()
            .all(|h| h.kind() == HarvesterKind::Stun));
        assert!(!orchestrator.stun_discovery_failed());
    }

    #[tokio::test]
    async fn cloud_harvester_joins_when_forced() {
        let config = HarvestConfig::empty()
            .set_enable_cloud_harvester(true)
            .set_force_cloud_harvester(true);
        let metadata = FixedMetadata {
            mapping: PublicMapping {
                face: "10.1.2.3:9".parse().unwrap(),
                mask: "198.51.100.3:9".parse().unwrap(),
            },
        };
        let orchestrator =
            HarvestOrchestrator::new(config).set_metadata_probe(Arc::new(metadata));
        let harvesters = orchestrator.harvesters().await;
        assert_eq!(harvesters.len(), 1);
        assert_eq!(harvesters[0].kind(), HarvesterKind::Cloud);
        assert!(harvesters[0].matches_public("198.51.100.3:60000".parse().unwrap()));
    }

    #[tokio::test]
    async fn broken_metadata_leaves_only_the_other_harvesters() {
        let config = HarvestConfig::empty()
            .set_enable_cloud_harvester(true)
            .set_force_cloud_harvester(true)
            .set_static_mappings(vec![StaticMapping::new(
                "dmz",
                "10.0.0.5".parse().unwrap(),
                "203.0.113.5".parse().unwrap(),
            )]);
        let orchestrator =
            HarvestOrchestrator::new(config).set_metadata_probe(Arc::new(BrokenMetadata));
        let harvesters = orchestrator.harvesters().await;
        assert_eq!(harvesters.len(), 1);
        assert_eq!(harvesters[0].kind(), HarvesterKind::Static);
    }

    #[tokio::test]
    async fn lookup_honors_port_qualified_mappings() {
        let with_ports = StaticMapping::new(
            "pinned",
            "10.0.0.5".parse().unwrap(),
            "203.0.113.5".parse().unwrap(),
        )
        .set_ports(5000, 6000);
        let loose = StaticMapping::new(
            "loose",
            "10.0.0.6".parse().unwrap(),
            "203.0.113.6".parse().unwrap(),
        );
        let config =
            HarvestConfig::empty().set_static_mappings(vec![with_ports, loose]);
        let orchestrator = HarvestOrchestrator::new(config);

        let hit = orchestrator
            .find_for_address("203.0.113.5:6000".parse().unwrap())
            .await;
        assert_eq!(hit.map(|h| h.name().to_string()), Some("pinned".to_string()));

        let miss = orchestrator
            .find_for_address("203.0.113.5:7".parse().unwrap())
            .await;
        assert!(miss.is_none());

        let loose_hit = orchestrator
            .find_for_address("203.0.113.6:7".parse().unwrap())
            .await;
        assert_eq!(
            loose_hit.map(|h| h.name().to_string()),
            Some("loose".to_string())
        );
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_discovery_run() {
        let config =
            HarvestConfig::empty().set_stun_servers(vec!["127.0.0.1:3478".to_string()]);
        let orchestrator =
            Arc::new(HarvestOrchestrator::with_probe(config, Arc::new(FailingProbe)));
        let a = orchestrator.clone();
        let b = orchestrator.clone();
        let (left, right) =
            tokio::join!(async move { a.harvesters().await.len() }, async move {
                b.harvesters().await.len()
            });
        assert_eq!(left, right);
        assert!(orchestrator.stun_discovery_failed());
    }
}
