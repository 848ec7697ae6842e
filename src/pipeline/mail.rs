//! RFC 5322 helpers: address extraction, domains, HTML stripping.
//!
//! Pure string parsing, no service calls.

use std::sync::LazyLock;

use regex::Regex;

static ADDRESS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\w.+\-]+@[\w\-]+(?:\.[\w\-]+)*").expect("valid address pattern"));

/// Extract email addresses from an optional mail_parser Address field.
///
/// Returns an empty vec if the address is None.
pub fn extract_addresses(addr: Option<&mail_parser::Address>) -> Vec<String> {
    let Some(addr) = addr else {
        return Vec::new();
    };
    match addr {
        mail_parser::Address::List(addrs) => addrs
            .iter()
            .filter_map(|a| a.address.as_ref().map(|s| s.trim().to_string()))
            .filter(|s| !s.is_empty())
            .collect(),
        mail_parser::Address::Group(groups) => groups
            .iter()
            .flat_map(|g| {
                g.addresses
                    .iter()
                    .filter_map(|a| a.address.as_ref().map(|s| s.trim().to_string()))
            })
            .filter(|s| !s.is_empty())
            .collect(),
    }
}

/// First bare address inside a header-style value such as
/// `"Acme Billing" <billing@acme.com>, other@x.com`.
pub fn first_address(raw: &str) -> Option<String> {
    ADDRESS.find(raw).map(|m| m.as_str().to_string())
}

/// Lowercased domain part of an address, or an empty string.
pub fn domain_of(address: &str) -> String {
    address
        .rsplit_once('@')
        .map(|(_, domain)| domain.trim().trim_end_matches('>').to_lowercase())
        .unwrap_or_default()
}

/// Strip HTML tags from content (basic).
pub fn strip_html(html: &str) -> String {
    let mut result = String::new();
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => {
                in_tag = false;
                result.push(' ');
            }
            _ if !in_tag => result.push(ch),
            _ => {}
        }
    }
    result.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Escape text for inclusion in an HTML body.
pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(ch),
        }
    }
    out
}
