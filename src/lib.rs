pub mod config;
pub mod error;
pub mod harvest;
pub mod ice;

use std::time::Duration;

use crate::config::SessionConfig;

pub use crate::config::{HarvestConfig, IceConfig, StaticMapping};
pub use crate::error::{Error, Result};
pub use crate::harvest::{
    HarvestOrchestrator, HarvesterKind, MappingHarvester, MetadataProbe, PublicAddressProbe,
    PublicMapping, UdpProbe,
};
pub use crate::ice::nomination::NominationStrategy;
pub use crate::ice::session::IceSession;
pub use crate::ice::{
    CandidateKind, CheckList, CheckPair, IceProcessingState, PairState, ValidatedPair,
};

pub struct Builder {
    strategy: Option<NominationStrategy>,
    nomination_timeout: Option<Duration>,
    grace_period: Option<Duration>,
}
impl Builder {
    pub fn new() -> Self {
        Self {
            strategy: None,
            nomination_timeout: None,
            grace_period: None,
        }
    }
    pub fn strategy(mut self, strategy: NominationStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }
    pub fn nomination_timeout(mut self, nomination_timeout: Duration) -> Self {
        self.nomination_timeout = Some(nomination_timeout);
        self
    }
    pub fn grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = Some(grace_period);
        self
    }
    pub fn build(self) -> crate::error::Result<IceSession> {
        let mut config = SessionConfig::empty();
        if let Some(strategy) = self.strategy {
            config = config.set_strategy(strategy);
        }
        if let Some(nomination_timeout) = self.nomination_timeout {
            config = config.set_nomination_timeout(nomination_timeout);
        }
        if let Some(grace_period) = self.grace_period {
            config = config.set_grace_period(grace_period);
        }
        IceSession::new(config)
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}
