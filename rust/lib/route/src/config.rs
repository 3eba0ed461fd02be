use serde::Deserialize;

/// How the router encodes its location in the URL.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UrlSync {
    /// `/blog/articles/33?filter=1`
    #[default]
    History,
    /// `#{prefix}/blog/articles/33?filter=1`
    Hash,
}

/// Router options.
///
/// Can be built in code or deserialized from JSON with camelCase keys:
///
/// ```json
/// {"enableLogs": true, "notFound": "notFound", "urlSync": "hash", "hashPrefix": "!"}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RouterConfig {
    /// Trace transition computation and every step at `debug` level.
    pub enable_logs: bool,

    /// Route same-origin anchor clicks through `transition_to`.
    pub intercept_anchors: bool,

    /// Full name of the leaf state used when a target cannot be resolved.
    pub not_found: Option<String>,

    pub url_sync: UrlSync,

    /// Inserted between `#` and the path in hash mode.
    pub hash_prefix: String,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            enable_logs: false,
            intercept_anchors: true,
            not_found: None,
            url_sync: UrlSync::History,
            hash_prefix: String::new(),
        }
    }
}

impl RouterConfig {
    /// Format a `/path?query` string as the URL kept in history.
    pub fn format_url(&self, path_query: &str) -> String {
        match self.url_sync {
            UrlSync::History => path_query.to_string(),
            UrlSync::Hash => format!("#{}{path_query}", self.hash_prefix),
        }
    }

    /// Inverse of [`RouterConfig::format_url`].
    ///
    /// Returns `None` when `url` is not in this router's format (e.g. a hash
    /// URL without the configured prefix).
    pub fn parse_url<'a>(&self, url: &'a str) -> Option<&'a str> {
        match self.url_sync {
            UrlSync::History => url.starts_with('/').then_some(url),
            UrlSync::Hash => url
                .strip_prefix('#')
                .and_then(|rest| rest.strip_prefix(self.hash_prefix.as_str())),
        }
    }
}
