//! Link extraction for the `fetch-links` tool: a deliberately small HTML
//! anchor scanner rather than a full parser, since the only thing this
//! component needs out of a document is `href` attribute values.
use std::collections::BTreeSet;

/// Scans `html` for `<a ... href="...">` attributes, resolves them against
/// `base_url` when relative, drops fragments, dedupes, and returns at most
/// `max_links` absolute URLs in document order.
pub fn extract_links(html: &str, base_url: Option<&str>, max_links: usize) -> Vec<String> {
    let max_links = max_links.min(500);
    if max_links == 0 {
        return Vec::new();
    }
    let base = base_url.and_then(|u| url::Url::parse(u).ok());

    let mut seen = BTreeSet::new();
    let mut out = Vec::new();
    for href in iter_anchor_hrefs(html) {
        if out.len() >= max_links {
            break;
        }
        let href_lc = href.to_ascii_lowercase();
        if href_lc.starts_with("javascript:") || href_lc.starts_with("mailto:") || href_lc.starts_with("tel:") {
            continue;
        }
        let mut resolved = if let Ok(u) = url::Url::parse(href) {
            u
        } else if let Some(b) = &base {
            match b.join(href) {
                Ok(u) => u,
                Err(_) => continue,
            }
        } else {
            continue;
        };
        resolved.set_fragment(None);
        let s = resolved.to_string();
        if seen.insert(s.clone()) {
            out.push(s);
        }
    }
    out
}

/// Walks `<a ...>` tags and yields each one's `href` attribute value, in
/// document order, without allocating a DOM.
fn iter_anchor_hrefs(html: &str) -> impl Iterator<Item = &str> {
    let bytes = html.as_bytes();
    let mut pos = 0usize;
    std::iter::from_fn(move || loop {
        let rest = &html[pos..];
        let tag_start = find_ci(rest, "<a")?;
        let abs_tag_start = pos + tag_start;
        // Must be followed by whitespace or `/` or `>` to avoid matching `<article>`.
        let after = bytes.get(abs_tag_start + 2).copied();
        if !matches!(after, Some(b' ') | Some(b'\t') | Some(b'\n') | Some(b'\r') | Some(b'/') | Some(b'>')) {
            pos = abs_tag_start + 2;
            continue;
        }
        let Some(tag_end_rel) = html[abs_tag_start..].find('>') else {
            return None;
        };
        let tag_end = abs_tag_start + tag_end_rel;
        let tag = &html[abs_tag_start..tag_end];
        pos = tag_end + 1;
        if let Some(href) = extract_attr(tag, "href") {
            return Some(href);
        }
    })
}

fn find_ci(haystack: &str, needle: &str) -> Option<usize> {
    let haystack_lc = haystack.to_ascii_lowercase();
    haystack_lc.find(needle)
}

/// Extracts `name="value"` or `name='value'` (or bare `name=value`) from a
/// single tag's contents, case-insensitive on the attribute name.
fn extract_attr<'a>(tag: &'a str, name: &str) -> Option<&'a str> {
    let tag_lc = tag.to_ascii_lowercase();
    let mut search_from = 0;
    loop {
        let idx = tag_lc[search_from..].find(name)?;
        let abs = search_from + idx;
        let before_ok = abs == 0 || !tag.as_bytes()[abs - 1].is_ascii_alphanumeric();
        let after = tag.as_bytes().get(abs + name.len()).copied();
        if before_ok && after == Some(b'=') {
            let value_start = abs + name.len() + 1;
            let rest = &tag[value_start..];
            return Some(match rest.as_bytes().first() {
                Some(b'"') => rest[1..].split('"').next().unwrap_or(""),
                Some(b'\'') => rest[1..].split('\'').next().unwrap_or(""),
                _ => rest.split(|c: char| c.is_whitespace() || c == '>').next().unwrap_or(""),
            });
        }
        search_from = abs + name.len();
        if search_from >= tag_lc.len() {
            return None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_absolute_and_relative_links() {
        let html = r#"<a href="https://example.com/a">A</a><a href="/b">B</a>"#;
        let links = extract_links(html, Some("https://example.com/base"), 10);
        assert_eq!(links, vec!["https://example.com/a", "https://example.com/b"]);
    }

    #[test]
    fn drops_fragments_and_dedupes() {
        let html = r#"<a href="https://example.com/a#x">A</a><a href="https://example.com/a">A again</a>"#;
        let links = extract_links(html, None, 10);
        assert_eq!(links, vec!["https://example.com/a"]);
    }

    #[test]
    fn skips_javascript_and_mailto() {
        let html = r#"<a href="javascript:void(0)">J</a><a href="mailto:a@b.com">M</a><a href="https://example.com/ok">OK</a>"#;
        let links = extract_links(html, None, 10);
        assert_eq!(links, vec!["https://example.com/ok"]);
    }

    #[test]
    fn does_not_match_unrelated_tags_starting_with_a() {
        let html = r#"<article href="https://example.com/nope"></article><a href="https://example.com/yes"></a>"#;
        let links = extract_links(html, None, 10);
        assert_eq!(links, vec!["https://example.com/yes"]);
    }

    #[test]
    fn respects_max_links() {
        let html = (0..10).map(|i| format!(r#"<a href="https://example.com/{i}"></a>"#)).collect::<String>();
        let links = extract_links(&html, None, 3);
        assert_eq!(links.len(), 3);
    }
}
