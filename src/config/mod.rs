use std::net::IpAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Error;

pub use crate::ice::nomination::NominationStrategy;

/// Port recorded for a static mapping when the configuration names no
/// port. The value is never used for matching, it is just a filler
/// (9, "discard").
pub(crate) const FILLER_PORT: u16 = 9;

pub(crate) const GRACE_PERIOD: Duration = Duration::from_secs(3);
pub(crate) const NOMINATION_TIMEOUT: Duration = Duration::from_secs(1);
pub(crate) const PROBE_TIMEOUT: Duration = Duration::from_millis(500);
pub(crate) const PROBE_RETRANSMITS: usize = 3;

/// One statically configured local/public address mapping.
///
/// Ports are optional: a mapping without ports matches on IP address
/// only.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticMapping {
    pub name: String,
    /// Address observed on a local interface.
    pub local_ip: IpAddr,
    /// Address the outside world sees for it.
    pub public_ip: IpAddr,
    #[serde(default)]
    pub local_port: Option<u16>,
    #[serde(default)]
    pub public_port: Option<u16>,
}

impl StaticMapping {
    pub fn new<N: Into<String>>(name: N, local_ip: IpAddr, public_ip: IpAddr) -> Self {
        Self {
            name: name.into(),
            local_ip,
            public_ip,
            local_port: None,
            public_port: None,
        }
    }

    pub fn set_ports(mut self, local_port: u16, public_port: u16) -> Self {
        self.local_port = Some(local_port);
        self.public_port = Some(public_port);
        self
    }
}

/// Configuration of the address-discovery mechanisms.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct HarvestConfig {
    pub static_mappings: Vec<StaticMapping>,
    /// Whether cloud-metadata discovery may run at all.
    pub enable_cloud_harvester: bool,
    /// Run cloud-metadata discovery even when the host does not look
    /// like a cloud instance.
    pub force_cloud_harvester: bool,
    /// STUN servers as `host` or `host:port` strings; a bare host gets
    /// the default port 3478.
    pub stun_servers: Vec<String>,
    /// Per-attempt wait for one binding response.
    pub probe_timeout: Duration,
    /// Retransmissions after the first request before a probe gives up.
    pub probe_retransmits: usize,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            static_mappings: vec![],
            enable_cloud_harvester: false,
            force_cloud_harvester: false,
            stun_servers: vec![
                "stun.miwifi.com".to_string(),
                "stun.chat.bilibili.com".to_string(),
                "stun.hitv.com".to_string(),
                "stun.l.google.com:19302".to_string(),
                "stun1.l.google.com:19302".to_string(),
                "stun2.l.google.com:19302".to_string(),
            ],
            probe_timeout: PROBE_TIMEOUT,
            probe_retransmits: PROBE_RETRANSMITS,
        }
    }
}

impl HarvestConfig {
    pub fn empty() -> Self {
        Self {
            stun_servers: vec![],
            ..Default::default()
        }
    }
    pub fn set_static_mappings(mut self, static_mappings: Vec<StaticMapping>) -> Self {
        self.static_mappings = static_mappings;
        self
    }
    pub fn set_enable_cloud_harvester(mut self, enable_cloud_harvester: bool) -> Self {
        self.enable_cloud_harvester = enable_cloud_harvester;
        self
    }
    pub fn set_force_cloud_harvester(mut self, force_cloud_harvester: bool) -> Self {
        self.force_cloud_harvester = force_cloud_harvester;
        self
    }
    pub fn set_stun_servers(mut self, stun_servers: Vec<String>) -> Self {
        self.stun_servers = stun_servers;
        self
    }
    pub fn set_probe_timeout(mut self, probe_timeout: Duration) -> Self {
        self.probe_timeout = probe_timeout;
        self
    }
    pub fn set_probe_retransmits(mut self, probe_retransmits: usize) -> Self {
        self.probe_retransmits = probe_retransmits;
        self
    }
    pub fn check(&self) -> crate::error::Result<()> {
        if self.probe_timeout.is_zero() {
            return Err(Error::InvalidArgument(
                "probe_timeout must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Configuration of a session's state machine and nomination policy.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub strategy: NominationStrategy,
    /// How long a policy's timer waits for a better pair.
    pub nomination_timeout: Duration,
    /// Delay between reaching `Completed`/`Failed` and `Terminated`.
    pub grace_period: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            strategy: NominationStrategy::default(),
            nomination_timeout: NOMINATION_TIMEOUT,
            grace_period: GRACE_PERIOD,
        }
    }
}

impl SessionConfig {
    pub fn empty() -> Self {
        Self::default()
    }
    pub fn set_strategy(mut self, strategy: NominationStrategy) -> Self {
        self.strategy = strategy;
        self
    }
    pub fn set_nomination_timeout(mut self, nomination_timeout: Duration) -> Self {
        self.nomination_timeout = nomination_timeout;
        self
    }
    pub fn set_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }
    pub fn check(&self) -> crate::error::Result<()> {
        if self.nomination_timeout.is_zero() {
            return Err(Error::InvalidArgument(
                "nomination_timeout must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Top-level configuration for a session and its harvesters.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IceConfig {
    pub harvest: HarvestConfig,
    pub session: SessionConfig,
}

impl IceConfig {
    pub fn empty() -> Self {
        Self::default()
    }
    pub fn set_harvest_config(mut self, harvest: HarvestConfig) -> Self {
        self.harvest = harvest;
        self
    }
    pub fn set_session_config(mut self, session: SessionConfig) -> Self {
        self.session = session;
        self
    }
    pub fn check(&self) -> crate::error::Result<()> {
        self.harvest.check()?;
        self.session.check()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_pass_check() {
        IceConfig::default().check().unwrap();
        IceConfig::empty().check().unwrap();
    }

    #[test]
    fn zero_timeouts_are_rejected() {
        let config = IceConfig::default()
            .set_harvest_config(HarvestConfig::default().set_probe_timeout(Duration::ZERO));
        assert!(matches!(config.check(), Err(Error::InvalidArgument(_))));

        let config = IceConfig::default().set_session_config(
            SessionConfig::default().set_nomination_timeout(Duration::ZERO),
        );
        assert!(matches!(config.check(), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn config_round_trips_through_json() {
        let config = IceConfig::default()
            .set_harvest_config(
                HarvestConfig::empty()
                    .set_stun_servers(vec!["stun.example.org:3478".to_string()])
                    .set_static_mappings(vec![StaticMapping::new(
                        "dmz",
                        "10.0.0.5".parse().unwrap(),
                        "203.0.113.5".parse().unwrap(),
                    )
                    .set_ports(5000, 5000)]),
            )
            .set_session_config(
                SessionConfig::default().set_strategy(NominationStrategy::BestRtt),
            );
        let json = serde_json::to_string(&config).unwrap();
        let parsed: IceConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.harvest.static_mappings, config.harvest.static_mappings);
        assert_eq!(parsed.harvest.stun_servers, config.harvest.stun_servers);
        assert_eq!(parsed.session.strategy, NominationStrategy::BestRtt);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let parsed: IceConfig =
            serde_json::from_str(r#"{"session":{"strategy":"FirstValid"}}"#).unwrap();
        assert_eq!(parsed.session.strategy, NominationStrategy::FirstValid);
        assert_eq!(parsed.session.grace_period, GRACE_PERIOD);
        assert!(!parsed.harvest.stun_servers.is_empty());
    }
}
