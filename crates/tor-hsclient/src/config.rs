//! Configuration for the hidden service client connector

use std::time::Duration;

use derive_builder::Builder;
use serde::{Deserialize, Serialize};

use tor_config::ConfigBuildError;

/// Configuration for [`HsClientConnector`](crate::HsClientConnector).
#[derive(Clone, Debug, Builder, Eq, PartialEq, Serialize, Deserialize)]
#[builder(build_fn(error = "ConfigBuildError"))]
#[builder(derive(Debug, Serialize, Deserialize))]
pub struct HsClientConfig {
    /// Whether this client is permitted to fetch onion service descriptors at all.
    ///
    /// Feeds directly into the Fetch-Eligibility Gate's first check
    /// (`FetchStatus::NotAllowed` when `false`).
    #[builder(default = "true")]
    pub(crate) enabled: bool,

    /// How many times an introduction point may be reported unreachable by
    /// the circuit layer before it is excluded from selection.
    #[builder(default = "self::default_max_unreachable()")]
    pub(crate) max_unreachable: u32,

    /// How long a per-introduction-point failure record stays valid before
    /// the introduction point is considered usable again.
    #[builder(default = "self::default_failure_ttl()")]
    #[builder(setter(strip_option), default)]
    pub(crate) intro_failure_ttl: Option<Duration>,
}

/// Default value for [`HsClientConfig::max_unreachable`].
///
/// Matches the glossary's "MAX_UNREACHABLE ... typically ≤ 5".
fn default_max_unreachable() -> u32 {
    5
}

/// Default value for [`HsClientConfig::intro_failure_ttl`].
///
/// Matches the glossary's "short TTL ... on the order of two minutes".
fn default_failure_ttl() -> Option<Duration> {
    Some(Duration::from_secs(2 * 60))
}

impl Default for HsClientConfig {
    fn default() -> Self {
        HsClientConfigBuilder::default()
            .build()
            .expect("default HsClientConfig failed to build")
    }
}

impl HsClientConfig {
    /// Is fetching descriptors allowed at all?
    pub(crate) fn fetch_enabled(&self) -> bool {
        self.enabled
    }

    /// The unreachable-count threshold above which an introduction point is unusable.
    pub(crate) fn max_unreachable(&self) -> u32 {
        self.max_unreachable
    }

    /// TTL for per-introduction-point failure records, if bounded.
    pub(crate) fn intro_failure_ttl(&self) -> Option<Duration> {
        self.intro_failure_ttl
    }
}

#[cfg(test)]
mod test {
    // @@ begin test lint list maintained by maint/add_warning @@
    #![allow(clippy::bool_assert_comparison)]
    #![allow(clippy::clone_on_copy)]
    #![allow(clippy::dbg_macro)]
    #![allow(clippy::print_stderr)]
    #![allow(clippy::print_stdout)]
    #![allow(clippy::unwrap_used)]
    //! <!-- @@ end test lint list maintained by maint/add_warning @@ -->
    use super::*;

    #[test]
    fn defaults() {
        let cfg = HsClientConfig::default();
        assert!(cfg.fetch_enabled());
        assert_eq!(cfg.max_unreachable(), 5);
        assert_eq!(cfg.intro_failure_ttl(), Some(Duration::from_secs(120)));
    }

    #[test]
    fn disabled() {
        let cfg = HsClientConfigBuilder::default()
            .enabled(false)
            .build()
            .unwrap();
        assert!(!cfg.fetch_enabled());
    }
}
