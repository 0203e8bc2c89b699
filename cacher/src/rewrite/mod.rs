//! This module provides cache key derivation and stylesheet rewriting.
//!
//! Cache keys are an external contract: replay readers rebuild them to locate mirrored assets, so their derivation must stay
//! byte-stable.

use url::Url;

mod css;
pub use css::{extract_urls, rewrite_urls};

mod utils;
pub use utils::escape_key;

const JS_PREFIX: &str = "js";

const CACHABLE_EXTENSIONS: &[&str] = &[
    // stylesheets
    "css", //
    // fonts
    "woff", "woff2", "ttf", "ttc", "otf", "eot", //
    // images
    "svg", "png", "jpg", "jpeg", "gif", "webp", "avif", "ico", "bmp", "cur",
];

/// Return the cache key of a JS source file, shared by every session.
pub fn cache_path_for_js(url: &str) -> String {
    format!("{JS_PREFIX}/{}", escape_key(url))
}

/// Return the cache key of an asset, partitioned by session.
pub fn cache_path_for_assets(session_id: u64, url: &str) -> String {
    format!("{session_id}/{}", escape_key(url))
}

/// Resolve a reference found in a stylesheet against the stylesheet URL.
///
/// Return the absolute URL (without fragment) if the referenced resource is worth caching, `None` otherwise: inline data, local
/// fragment references, non-HTTP schemes, URLs carrying credentials and unknown extensions are not cached.
pub fn resolve_cachable_url(base_url: &str, reference: &str) -> Option<String> {
    let reference = reference.trim();

    if reference.is_empty() || reference.starts_with('#') || reference.get(..5).is_some_and(|scheme| scheme.eq_ignore_ascii_case("data:")) {
        return None;
    }

    let mut url = Url::parse(base_url).and_then(|base| base.join(reference)).ok()?;

    if !matches!(url.scheme(), "http" | "https") || !url.username().is_empty() || url.password().is_some() {
        return None;
    }

    let extension = url.path_segments()?.next_back()?.rsplit_once('.')?.1.to_ascii_lowercase();
    if !CACHABLE_EXTENSIONS.contains(&extension.as_str()) {
        return None;
    }

    url.set_fragment(None);
    Some(url.into())
}

/// Stylesheet rewriter.
///
/// Points every cacheable reference of a stylesheet to its mirrored copy under the assets origin.
#[derive(Debug, Clone)]
pub struct Rewriter {
    assets_origin: String,
}

impl Rewriter {
    pub fn new(assets_origin: &Url) -> Self {
        Self {
            assets_origin: assets_origin.as_str().trim_end_matches('/').to_owned(),
        }
    }

    /// Return the mirrored URL of `reference` as found in the stylesheet at `base_url`, or `reference` itself if not cacheable.
    pub fn rewrite_url(&self, session_id: u64, base_url: &str, reference: &str) -> String {
        match resolve_cachable_url(base_url, reference) {
            Some(url) => format!("{}/{}", self.assets_origin, cache_path_for_assets(session_id, &url)),
            None => reference.to_owned(),
        }
    }

    pub fn rewrite_css(&self, session_id: u64, base_url: &str, css: &str) -> String {
        rewrite_urls(css, |reference| self.rewrite_url(session_id, base_url, reference))
    }
}
