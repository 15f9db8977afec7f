//! Per-source, fail-closed firewall evaluation.
//!
//! Every source address maps to an ordered rule list supplied by a [`RuleSource`]. Lists are
//! fetched lazily the first time a source is seen and kept in a bounded [`RuleCache`]. Evaluation
//! is first-match-wins with an implicit drop at the end of the list, and a source with no known
//! rules is always denied.
#![forbid(unsafe_code)]

mod cache;
mod rule;
mod source;

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

pub use cache::{
    Cached, RuleCache, RuleCacheConfig, RuleCacheStats, DEFAULT_RULE_CACHE_CAPACITY,
    DEFAULT_RULE_TTL,
};
pub use rule::{evaluate, Action, PortConfig, PortMatch, Rule, RuleConfig, RuleProtocol};
pub use source::{RuleFile, RuleSource, StaticRules};

#[derive(Debug, thiserror::Error)]
pub enum RuleError {
    #[error("invalid port range {value:?}: {reason}")]
    InvalidPortRange { value: String, reason: String },
    #[error("invalid source address {0:?}")]
    InvalidAddress(String),
    #[error("failed to read rule file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid rule document: {0}")]
    Json(#[from] serde_json::Error),
}

pub struct Firewall {
    source: Box<dyn RuleSource>,
    cache: RuleCache,
}

impl Firewall {
    pub fn new(source: impl RuleSource + 'static, cache: RuleCacheConfig) -> Self {
        Self::from_boxed(Box::new(source), cache)
    }

    pub fn from_boxed(source: Box<dyn RuleSource>, cache: RuleCacheConfig) -> Self {
        Self {
            source,
            cache: RuleCache::new(cache),
        }
    }

    /// Decide whether a flow from `src_ip` may pass.
    ///
    /// `dst_ip` is part of the flow identity but current policies key only on the source,
    /// protocol and destination port.
    pub fn is_allowed(
        &mut self,
        src_ip: IpAddr,
        dst_ip: IpAddr,
        protocol: u8,
        dst_port: Option<u16>,
    ) -> bool {
        self.is_allowed_at(src_ip, dst_ip, protocol, dst_port, Instant::now())
    }

    pub fn is_allowed_at(
        &mut self,
        src_ip: IpAddr,
        _dst_ip: IpAddr,
        protocol: u8,
        dst_port: Option<u16>,
        now: Instant,
    ) -> bool {
        match self.rules_for(src_ip, now) {
            Some(rules) => evaluate(&rules, protocol, dst_port),
            None => false,
        }
    }

    /// Cached rules of `ip`, querying the source on a miss.
    pub fn rules_for(&mut self, ip: IpAddr, now: Instant) -> Option<Arc<[Rule]>> {
        if let Cached::Hit(rules) = self.cache.get(ip, now) {
            return rules;
        }
        let rules: Option<Arc<[Rule]>> = self.source.lookup_rules(ip).map(Arc::from);
        match &rules {
            Some(list) => tracing::debug!(%ip, rules = list.len(), "rule cache populated"),
            None => tracing::debug!(%ip, "no rules for source; denying"),
        }
        self.cache.insert(ip, rules.clone(), now);
        rules
    }

    pub fn invalidate(&mut self, ip: IpAddr) -> bool {
        self.cache.invalidate(ip)
    }

    pub fn invalidate_all(&mut self) {
        self.cache.clear();
    }

    /// Reload the source. The cache is only dropped when the reload succeeds.
    pub fn reload(&mut self) -> Result<(), RuleError> {
        self.source.reload()?;
        self.invalidate_all();
        Ok(())
    }

    pub fn cache_stats(&self) -> RuleCacheStats {
        self.cache.stats()
    }

    pub fn cached_sources(&self) -> usize {
        self.cache.len()
    }
}
