use std::ops::Range;
use std::sync::LazyLock;

use regex::Regex;

use super::utils::unquote;

static CSS_URL: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)url\(([^)]*)\)").expect("valid url() pattern"));
static CSS_IMPORT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)@import\s+("[^"]*"|'[^']*')"#).expect("valid @import pattern"));

/// Return the byte ranges of every raw reference in `css`, in order and without overlap.
///
/// A raw reference is the inner part of a `url(...)` or the quoted string of an `@import`, quotes included.
fn reference_ranges(css: &str) -> Vec<Range<usize>> {
    let mut ranges: Vec<_> = CSS_URL
        .captures_iter(css)
        .chain(CSS_IMPORT.captures_iter(css))
        .filter_map(|captures| captures.get(1))
        .map(|reference| reference.range())
        .collect();

    ranges.sort_unstable_by_key(|range| range.start);
    ranges.dedup_by(|next, prev| next.start < prev.end);

    ranges
}

/// Extract every URL referenced by a stylesheet, unquoted, in order of appearance.
pub fn extract_urls(css: &str) -> Vec<&str> {
    reference_ranges(css)
        .into_iter()
        .map(|range| unquote(&css[range]).0)
        .filter(|url| !url.is_empty())
        .collect()
}

/// Replace every URL referenced by a stylesheet with the result of `rewrite`, preserving quotes.
pub fn rewrite_urls(css: &str, mut rewrite: impl FnMut(&str) -> String) -> String {
    let mut rewritten = String::with_capacity(css.len());
    let mut last = 0;

    for range in reference_ranges(css) {
        let (url, quote) = unquote(&css[range.clone()]);
        if url.is_empty() {
            continue;
        }

        rewritten.push_str(&css[last..range.start]);
        let quote = quote.map(String::from).unwrap_or_default();
        rewritten.push_str(&quote);
        rewritten.push_str(&rewrite(url));
        rewritten.push_str(&quote);

        last = range.end;
    }

    rewritten.push_str(&css[last..]);
    rewritten
}
