//! Client meta header.

/// Header carrying client and runtime versions.
pub const META_HEADER_NAME: &str = "x-opensearch-client-meta";

const HTTP_CLIENT_VERSION: &str = "0.12";

/// Helper that issued a request, reported in the meta header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Helper {
    /// Sliced scroll.
    Scroll,
    /// Bulk indexing.
    Bulk,
}

impl Helper {
    /// Short marker used in the header value.
    pub fn marker(&self) -> &'static str {
        match self {
            Self::Scroll => "s",
            Self::Bulk => "b",
        }
    }
}

/// Precomputed meta header value for one transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaHeader {
    base: String,
}

impl MetaHeader {
    /// Build the header for this crate.
    pub fn new() -> Self {
        let version = normalize(env!("CARGO_PKG_VERSION"));
        let rust = normalize(env!("CARGO_PKG_RUST_VERSION"));
        Self {
            base: format!("os={version},a=1,rs={rust},t={version},hc={HTTP_CLIENT_VERSION}"),
        }
    }

    /// Header value, tagged with `helper` when present.
    pub fn value(&self, helper: Option<Helper>) -> String {
        match helper {
            Some(helper) => format!("{},h={}", self.base, helper.marker()),
            None => self.base.clone(),
        }
    }
}

impl Default for MetaHeader {
    fn default() -> Self {
        Self::new()
    }
}

/// `1.2.3-beta.1` becomes `1.2.3p`; an empty version becomes `0`.
fn normalize(version: &str) -> String {
    if version.is_empty() {
        return "0".to_string();
    }
    match version.split_once(['-', '+']) {
        Some((release, _)) => format!("{release}p"),
        None => version.to_string(),
    }
}
