//! An HTTP client that fetches rule-set changes from the server.
use std::sync::atomic::{AtomicBool, Ordering};

use reqwest::{header, StatusCode, Url};

use crate::{config::SyncConfig, rules::models::ChangeSetWire, Error, FetchError, Result};

/// Parameters of a single `splitChanges` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchParams {
    /// Wire spec version.
    pub spec: String,
    /// Flags change number to fetch changes since.
    pub since: i64,
    /// Rule-based segments change number to fetch changes since. `None` with the legacy spec.
    pub rule_based_segments_since: Option<i64>,
    /// Target change number used to bypass the CDN cache.
    pub till: Option<i64>,
    /// Ask intermediaries not to answer from cache.
    pub avoid_cache: bool,
}

/// Source of rule-set changes.
pub trait Fetch: Send + Sync {
    fn fetch(&self, params: &FetchParams) -> std::result::Result<ChangeSetWire, FetchError>;
}

const SPLIT_CHANGES_ENDPOINT: &str = "/splitChanges";

/// [`Fetch`] implementation talking to the Split API over HTTP.
pub struct HttpFetcher {
    // Client holds a connection pool internally, so we're reusing the client between requests.
    client: reqwest::blocking::Client,
    endpoint: Url,
    sdk_key: String,
    filter_query_string: String,
    /// Requests go through a proxy that may not support the latest spec.
    behind_proxy: bool,
    /// If we receive a 401 or 403 during a request, the SDK key is not valid. We cache this error
    /// so we don't issue additional requests to the server.
    unauthorized: AtomicBool,
}

impl HttpFetcher {
    /// # Errors
    ///
    /// Returns [`Error::InvalidBaseUrl`] if the configured base URL cannot be parsed.
    pub fn new(config: &SyncConfig) -> Result<HttpFetcher> {
        let endpoint = Url::parse(&format!(
            "{}{}",
            config.base_url.trim_end_matches('/'),
            SPLIT_CHANGES_ENDPOINT
        ))
        .map_err(Error::InvalidBaseUrl)?;

        Ok(HttpFetcher {
            client: reqwest::blocking::Client::new(),
            endpoint,
            sdk_key: config.sdk_key.clone(),
            filter_query_string: config.filter_query_string(),
            behind_proxy: config.uses_custom_base_url(),
            unauthorized: AtomicBool::new(false),
        })
    }

    fn request_url(&self, params: &FetchParams) -> Url {
        let mut query = format!("s={}&since={}", params.spec, params.since);
        if let Some(since) = params.rule_based_segments_since {
            query.push_str(&format!("&rbSince={since}"));
        }
        // Filter values are validated and sorted when the filter is built, and are sent verbatim.
        query.push_str(&self.filter_query_string);
        if let Some(till) = params.till {
            query.push_str(&format!("&till={till}"));
        }

        let mut url = self.endpoint.clone();
        url.set_query(Some(&query));
        url
    }

    fn status_error(&self, status: StatusCode, params: &FetchParams) -> FetchError {
        match status {
            StatusCode::URI_TOO_LONG => {
                log::warn!(target: "split",
                           "request URI is too long, the number of flag sets in the filter must be reduced");
                FetchError::UriTooLong
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                log::warn!(target: "split", "client is not authorized. Check your SDK key");
                self.unauthorized.store(true, Ordering::Relaxed);
                FetchError::Unauthorized
            }
            StatusCode::BAD_REQUEST
                if self.behind_proxy && params.spec == SyncConfig::LATEST_SPEC =>
            {
                log::warn!(target: "split",
                           spec:display = params.spec;
                           "proxy rejected the spec version, falling back to the legacy spec");
                FetchError::ProxyOutdated
            }
            status => {
                log::warn!(target: "split",
                           status = status.as_u16();
                           "received non-2xx response while fetching rule-set changes");
                FetchError::Http {
                    status: status.as_u16(),
                }
            }
        }
    }
}

impl Fetch for HttpFetcher {
    fn fetch(&self, params: &FetchParams) -> std::result::Result<ChangeSetWire, FetchError> {
        if self.unauthorized.load(Ordering::Relaxed) {
            return Err(FetchError::Unauthorized);
        }

        let url = self.request_url(params);

        log::debug!(target: "split",
                    since = params.since,
                    rule_based_segments_since:debug = params.rule_based_segments_since,
                    till:debug = params.till,
                    avoid_cache = params.avoid_cache;
                    "fetching rule-set changes");

        let mut request = self.client.get(url).bearer_auth(&self.sdk_key);
        if params.avoid_cache {
            request = request.header(header::CACHE_CONTROL, "no-cache");
        }

        let response = request.send()?;
        let status = response.status();
        if !status.is_success() {
            return Err(self.status_error(status, params));
        }

        let body = response.bytes()?;
        let change_set = serde_json::from_slice(&body).map_err(|err| {
            log::warn!(target: "split", err:display; "failed to parse rule-set changes");
            FetchError::from(err)
        })?;

        log::debug!(target: "split", "successfully fetched rule-set changes");

        Ok(change_set)
    }
}

#[cfg(test)]
mod tests {
    use reqwest::StatusCode;

    use crate::{config::SplitFilter, FetchError, SyncConfig};

    use super::{FetchParams, HttpFetcher};

    fn params(spec: &str) -> FetchParams {
        FetchParams {
            spec: spec.to_owned(),
            since: 100,
            rule_based_segments_since: Some(50),
            till: None,
            avoid_cache: false,
        }
    }

    #[test]
    fn builds_request_url() {
        let mut config = SyncConfig::from_sdk_key("key");
        config.filter(SplitFilter::by_sets(["set_x", "set_a"]));
        let fetcher = HttpFetcher::new(&config).unwrap();

        assert_eq!(
            fetcher.request_url(&params("1.3")).as_str(),
            "https://sdk.split.io/api/splitChanges?s=1.3&since=100&rbSince=50&sets=set_a,set_x"
        );

        let bypass = FetchParams {
            till: Some(120),
            ..params("1.3")
        };
        assert_eq!(
            fetcher.request_url(&bypass).as_str(),
            "https://sdk.split.io/api/splitChanges?s=1.3&since=100&rbSince=50&sets=set_a,set_x&till=120"
        );
    }

    #[test]
    fn legacy_requests_omit_rule_based_segments() {
        let fetcher = HttpFetcher::new(SyncConfig::from_sdk_key("key").base_url("https://proxy.local/api/")).unwrap();
        let legacy = FetchParams {
            rule_based_segments_since: None,
            ..params("1.2")
        };
        assert_eq!(
            fetcher.request_url(&legacy).as_str(),
            "https://proxy.local/api/splitChanges?s=1.2&since=100"
        );
    }

    #[test]
    fn invalid_base_url() {
        assert!(HttpFetcher::new(SyncConfig::from_sdk_key("key").base_url("not a url")).is_err());
    }

    #[test]
    fn classifies_statuses() {
        let direct = HttpFetcher::new(&SyncConfig::from_sdk_key("key")).unwrap();
        let proxied =
            HttpFetcher::new(SyncConfig::from_sdk_key("key").base_url("https://proxy.local/api")).unwrap();

        assert!(matches!(
            direct.status_error(StatusCode::URI_TOO_LONG, &params("1.3")),
            FetchError::UriTooLong
        ));
        assert!(matches!(
            direct.status_error(StatusCode::BAD_REQUEST, &params("1.3")),
            FetchError::Http { status: 400 }
        ));
        assert!(matches!(
            proxied.status_error(StatusCode::BAD_REQUEST, &params("1.3")),
            FetchError::ProxyOutdated
        ));
        assert!(matches!(
            proxied.status_error(StatusCode::BAD_REQUEST, &params("1.2")),
            FetchError::Http { status: 400 }
        ));
        assert!(matches!(
            direct.status_error(StatusCode::INTERNAL_SERVER_ERROR, &params("1.3")),
            FetchError::Http { status: 500 }
        ));
    }

    #[test]
    fn unauthorized_is_cached() {
        use super::Fetch;

        let fetcher = HttpFetcher::new(&SyncConfig::from_sdk_key("key")).unwrap();
        assert!(matches!(
            fetcher.status_error(StatusCode::FORBIDDEN, &params("1.3")),
            FetchError::Unauthorized
        ));
        // Fails without issuing a request.
        assert!(matches!(fetcher.fetch(&params("1.3")), Err(FetchError::Unauthorized)));
    }
}
