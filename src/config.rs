use std::{sync::OnceLock, time::Duration};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::fallback::FallbackTreatments;

/// Configuration for rule-set synchronization and evaluation.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub(crate) sdk_key: String,
    pub(crate) base_url: String,
    pub(crate) polling_interval: Duration,
    pub(crate) polling_jitter: Duration,
    pub(crate) streaming_enabled: bool,
    pub(crate) sync_enabled: bool,
    pub(crate) max_sync_period: Duration,
    pub(crate) on_demand_fetch_max_attempts: u32,
    pub(crate) cdn_bypass_threshold: u32,
    pub(crate) backoff_base: Duration,
    pub(crate) backoff_cap: Duration,
    pub(crate) streaming_reconnect_backoff_base: Duration,
    pub(crate) streaming_reconnect_backoff_cap: Duration,
    pub(crate) proxy_check_interval: Duration,
    pub(crate) cache_expiration: Duration,
    pub(crate) filter: Option<SplitFilter>,
    pub(crate) prerequisite_depth_limit: usize,
    pub(crate) fallback_treatments: FallbackTreatments,
}

impl SyncConfig {
    /// Create a default configuration using the specified SDK key.
    ///
    /// ```
    /// # use split_core::SyncConfig;
    /// SyncConfig::from_sdk_key("sdk-key");
    /// ```
    pub fn from_sdk_key(sdk_key: impl Into<String>) -> Self {
        SyncConfig {
            sdk_key: sdk_key.into(),
            base_url: SyncConfig::DEFAULT_BASE_URL.to_owned(),
            polling_interval: SyncConfig::DEFAULT_POLLING_INTERVAL,
            polling_jitter: SyncConfig::DEFAULT_POLLING_JITTER,
            streaming_enabled: true,
            sync_enabled: true,
            max_sync_period: SyncConfig::DEFAULT_MAX_SYNC_PERIOD,
            on_demand_fetch_max_attempts: SyncConfig::DEFAULT_ON_DEMAND_FETCH_MAX_ATTEMPTS,
            cdn_bypass_threshold: SyncConfig::DEFAULT_CDN_BYPASS_THRESHOLD,
            backoff_base: SyncConfig::DEFAULT_BACKOFF_BASE,
            backoff_cap: SyncConfig::DEFAULT_BACKOFF_CAP,
            streaming_reconnect_backoff_base: SyncConfig::DEFAULT_BACKOFF_BASE,
            streaming_reconnect_backoff_cap: SyncConfig::DEFAULT_STREAMING_RECONNECT_BACKOFF_CAP,
            proxy_check_interval: SyncConfig::DEFAULT_PROXY_CHECK_INTERVAL,
            cache_expiration: SyncConfig::DEFAULT_CACHE_EXPIRATION,
            filter: None,
            prerequisite_depth_limit: SyncConfig::DEFAULT_PREREQUISITE_DEPTH_LIMIT,
            fallback_treatments: FallbackTreatments::default(),
        }
    }

    /// Default base URL for API calls.
    pub const DEFAULT_BASE_URL: &'static str = "https://sdk.split.io/api";

    /// Default interval between polls while streaming is unavailable.
    pub const DEFAULT_POLLING_INTERVAL: Duration = Duration::from_secs(60 * 60);

    pub const DEFAULT_POLLING_JITTER: Duration = Duration::ZERO;

    /// Default maximum time without a successful sync while streaming before a sync is forced.
    pub const DEFAULT_MAX_SYNC_PERIOD: Duration = Duration::from_secs(30 * 60);

    pub const DEFAULT_ON_DEMAND_FETCH_MAX_ATTEMPTS: u32 = 20;

    /// Attempts after which fetches ask the CDN to bypass its cache.
    pub const DEFAULT_CDN_BYPASS_THRESHOLD: u32 = 10;

    pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(1);

    pub const DEFAULT_BACKOFF_CAP: Duration = Duration::from_secs(60);

    pub const DEFAULT_STREAMING_RECONNECT_BACKOFF_CAP: Duration = Duration::from_secs(30 * 60);

    /// Default time spent on the legacy wire spec before trying the latest one again.
    pub const DEFAULT_PROXY_CHECK_INTERVAL: Duration = Duration::from_secs(60 * 60);

    /// Default age after which a persisted rule set is discarded instead of being updated.
    pub const DEFAULT_CACHE_EXPIRATION: Duration = Duration::from_secs(10 * 24 * 60 * 60);

    pub const DEFAULT_PREREQUISITE_DEPTH_LIMIT: usize = 10;

    /// Wire spec version requested from the server.
    pub const LATEST_SPEC: &'static str = "1.3";

    /// Wire spec version used with proxies that don't support [`SyncConfig::LATEST_SPEC`].
    pub const LEGACY_SPEC: &'static str = "1.2";

    /// Override base URL for API calls. Clients should use the default setting in most cases.
    ///
    /// A base URL other than the default is assumed to point to a proxy, which enables falling
    /// back to the legacy wire spec.
    pub fn base_url(&mut self, base_url: impl Into<String>) -> &mut Self {
        self.base_url = base_url.into();
        self
    }

    /// Interval between polls while streaming is unavailable.
    pub fn polling_interval(&mut self, interval: Duration) -> &mut Self {
        self.polling_interval = interval;
        self
    }

    /// Random delay added to each polling interval, up to `jitter`.
    pub fn polling_jitter(&mut self, jitter: Duration) -> &mut Self {
        self.polling_jitter = jitter;
        self
    }

    pub fn streaming_enabled(&mut self, enabled: bool) -> &mut Self {
        self.streaming_enabled = enabled;
        self
    }

    /// Disable all synchronization. Evaluation only uses the rules already in storage.
    pub fn sync_enabled(&mut self, enabled: bool) -> &mut Self {
        self.sync_enabled = enabled;
        self
    }

    pub fn max_sync_period(&mut self, period: Duration) -> &mut Self {
        self.max_sync_period = period;
        self
    }

    pub fn on_demand_fetch_max_attempts(&mut self, attempts: u32) -> &mut Self {
        self.on_demand_fetch_max_attempts = attempts;
        self
    }

    pub fn cdn_bypass_threshold(&mut self, attempts: u32) -> &mut Self {
        self.cdn_bypass_threshold = attempts;
        self
    }

    /// Backoff between fetch attempts: `base * 2^attempt`, capped at `cap`.
    pub fn backoff(&mut self, base: Duration, cap: Duration) -> &mut Self {
        self.backoff_base = base;
        self.backoff_cap = cap;
        self
    }

    pub fn streaming_reconnect_backoff(&mut self, base: Duration, cap: Duration) -> &mut Self {
        self.streaming_reconnect_backoff_base = base;
        self.streaming_reconnect_backoff_cap = cap;
        self
    }

    pub fn proxy_check_interval(&mut self, interval: Duration) -> &mut Self {
        self.proxy_check_interval = interval;
        self
    }

    pub fn cache_expiration(&mut self, expiration: Duration) -> &mut Self {
        self.cache_expiration = expiration;
        self
    }

    /// Only synchronize the flags selected by `filter`.
    pub fn filter(&mut self, filter: SplitFilter) -> &mut Self {
        self.filter = Some(filter);
        self
    }

    /// Maximum nesting of prerequisite and dependency evaluation.
    pub fn prerequisite_depth_limit(&mut self, limit: usize) -> &mut Self {
        self.prerequisite_depth_limit = limit;
        self
    }

    /// Treatments returned instead of `control`.
    pub fn fallback_treatments(&mut self, fallback_treatments: FallbackTreatments) -> &mut Self {
        self.fallback_treatments = fallback_treatments;
        self
    }

    /// Query string appended to fetch requests for the configured filter.
    pub(crate) fn filter_query_string(&self) -> String {
        self.filter
            .as_ref()
            .map(SplitFilter::query_string)
            .unwrap_or_default()
    }

    /// Whether requests go somewhere other than the default endpoint.
    pub(crate) fn uses_custom_base_url(&self) -> bool {
        self.base_url.trim_end_matches('/') != SyncConfig::DEFAULT_BASE_URL
    }
}

/// Selects which flags are synchronized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SplitFilter {
    /// Flags belonging to any of these flag sets.
    BySets(Vec<String>),
    /// Flags with these names.
    ByNames(Vec<String>),
}

/// Flag set names must match this after being lowercased and trimmed.
const FLAG_SET_PATTERN: &str = "^[a-z0-9][_a-z0-9]{0,49}$";

fn flag_set_regex() -> Option<&'static Regex> {
    static REGEX: OnceLock<Option<Regex>> = OnceLock::new();
    REGEX.get_or_init(|| Regex::new(FLAG_SET_PATTERN).ok()).as_ref()
}

impl SplitFilter {
    /// Filter by flag sets. Names are lowercased and trimmed. Invalid names are dropped with a
    /// warning.
    pub fn by_sets(sets: impl IntoIterator<Item = impl AsRef<str>>) -> SplitFilter {
        let mut valid = Vec::new();
        for set in sets {
            let normalized = set.as_ref().trim().to_lowercase();
            if flag_set_regex().is_some_and(|regex| regex.is_match(&normalized)) {
                valid.push(normalized);
            } else {
                log::warn!(target: "split",
                           flag_set = set.as_ref();
                           "invalid flag set name, it will be ignored");
            }
        }
        valid.sort();
        valid.dedup();
        SplitFilter::BySets(valid)
    }

    /// Filter by flag names.
    pub fn by_names(names: impl IntoIterator<Item = impl AsRef<str>>) -> SplitFilter {
        let mut names: Vec<String> = names
            .into_iter()
            .map(|name| name.as_ref().trim().to_owned())
            .filter(|name| !name.is_empty())
            .collect();
        names.sort();
        names.dedup();
        SplitFilter::ByNames(names)
    }

    pub fn values(&self) -> &[String] {
        match self {
            SplitFilter::BySets(values) | SplitFilter::ByNames(values) => values,
        }
    }

    /// `&sets=...` or `&names=...`. Empty if the filter selects nothing.
    pub fn query_string(&self) -> String {
        let (param, values) = match self {
            SplitFilter::BySets(sets) => ("sets", sets),
            SplitFilter::ByNames(names) => ("names", names),
        };
        if values.is_empty() {
            return String::new();
        }
        format!("&{param}={}", values.join(","))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{SplitFilter, SyncConfig};

    #[test]
    fn sets_are_normalized() {
        let filter = SplitFilter::by_sets([" Set_3", "set_2", "set_3", "_invalid", "set-x", "set_ww"]);
        assert_eq!(filter.values(), ["set_2", "set_3", "set_ww"]);
        assert_eq!(filter.query_string(), "&sets=set_2,set_3,set_ww");
    }

    #[test]
    fn names_are_sorted() {
        let filter = SplitFilter::by_names(["split2", "ausgefüllt", "split1", "split1"]);
        assert_eq!(filter.query_string(), "&names=ausgefüllt,split1,split2");
    }

    #[test]
    fn empty_filter_has_no_query_string() {
        assert_eq!(SplitFilter::by_sets(["-"]).query_string(), "");
        assert_eq!(SyncConfig::from_sdk_key("key").filter_query_string(), "");
    }

    #[test]
    fn setters_chain() {
        let mut config = SyncConfig::from_sdk_key("key");
        config
            .base_url("https://proxy.local/api")
            .polling_interval(Duration::from_secs(30))
            .filter(SplitFilter::by_sets(["backend"]));

        assert!(config.uses_custom_base_url());
        assert_eq!(config.polling_interval, Duration::from_secs(30));
        assert_eq!(config.filter_query_string(), "&sets=backend");
        assert!(!SyncConfig::from_sdk_key("key").uses_custom_base_url());
    }
}
