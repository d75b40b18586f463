//! Tunnel address discovery in streamed tunnel output.
//!
//! cloudflared announces an ephemeral tunnel by printing its public URL
//! somewhere in its combined output, usually inside an ASCII box:
//!
//! ```text
//! INF |  https://random-words-here.trycloudflare.com  |
//! ```
//!
//! When the quick-tunnel service throttles the caller it prints an HTTP
//! `429 Too Many Requests` status instead.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;

/// Literal marker cloudflared prints when the quick-tunnel API throttles us.
pub const RATE_LIMIT_MARKER: &str = "429 Too Many Requests";

static ADDRESS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"https://[a-zA-Z0-9-]+\.trycloudflare\.com").expect("static regex is valid")
});

/// Public address of the tunnel.
///
/// Either discovered in tunnel output or supplied by the operator for a
/// stable tunnel. "No address" is modelled as `Option::None`, never as an
/// empty string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelAddress(String);

impl TunnelAddress {
    /// Wrap an operator-configured literal address.
    ///
    /// Returns `None` for blank input so an unset-but-present environment
    /// variable behaves like an absent one.
    pub fn configured(literal: &str) -> Option<Self> {
        let trimmed = literal.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(Self(trimmed.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TunnelAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Result of scanning the output captured so far.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanOutcome {
    /// An address was found; the attempt succeeded.
    Address(TunnelAddress),
    /// The provider throttled us; the attempt must be abandoned.
    RateLimited,
    /// Neither yet; keep polling.
    Pending,
}

/// Extract the first ephemeral tunnel address from `text`.
pub fn extract_address(text: &str) -> Option<TunnelAddress> {
    ADDRESS_RE
        .find(text)
        .map(|m| TunnelAddress(m.as_str().to_string()))
}

/// Classify the output captured so far.
///
/// An address wins over the rate-limit marker when both are present.
pub fn scan(text: &str) -> ScanOutcome {
    if let Some(address) = extract_address(text) {
        ScanOutcome::Address(address)
    } else if text.contains(RATE_LIMIT_MARKER) {
        ScanOutcome::RateLimited
    } else {
        ScanOutcome::Pending
    }
}

/// First `n` lines of `text`, for diagnostics after a failed acquisition.
pub fn head_lines(text: &str, n: usize) -> String {
    text.lines().take(n).collect::<Vec<_>>().join("\n")
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn extracts_address_from_box() {
        let text = "INF +----------------------------+\n\
                    INF |  https://random-words-here.trycloudflare.com  |\n";
        assert_eq!(
            extract_address(text).unwrap().as_str(),
            "https://random-words-here.trycloudflare.com"
        );
    }

    #[test]
    fn extracts_only_first_of_several_addresses() {
        let text = "https://first-1.trycloudflare.com then https://second-2.trycloudflare.com";
        assert_eq!(
            extract_address(text).unwrap().as_str(),
            "https://first-1.trycloudflare.com"
        );
    }

    #[test]
    fn extraction_stops_at_hostname_suffix() {
        let text = "visit https://abc-123.trycloudflare.com/path?x=1 now";
        assert_eq!(
            extract_address(text).unwrap().as_str(),
            "https://abc-123.trycloudflare.com"
        );
    }

    #[test]
    fn ignores_other_hosts_and_plain_http() {
        assert!(extract_address("http://abc.trycloudflare.com").is_none());
        assert!(extract_address("https://abc.example.com").is_none());
        assert!(extract_address("https://under_score.trycloudflare.com").is_none());
        assert!(extract_address("Requesting new quick Tunnel on trycloudflare.com...").is_none());
    }

    #[test]
    fn scan_reports_rate_limit() {
        let text = "ERR failed to request quick Tunnel: 429 Too Many Requests\n";
        assert_eq!(scan(text), ScanOutcome::RateLimited);
    }

    #[test]
    fn scan_prefers_address_over_marker() {
        let text = "429 Too Many Requests\nhttps://late-ok.trycloudflare.com\n";
        assert!(matches!(scan(text), ScanOutcome::Address(_)));
    }

    #[test]
    fn scan_pending_on_unrelated_output() {
        assert_eq!(scan("INF Starting tunnel tunnelID=\n"), ScanOutcome::Pending);
        assert_eq!(scan(""), ScanOutcome::Pending);
    }

    #[test]
    fn configured_address_rejects_blank() {
        assert!(TunnelAddress::configured("   ").is_none());
        assert_eq!(
            TunnelAddress::configured(" https://dash.example.org ")
                .unwrap()
                .to_string(),
            "https://dash.example.org"
        );
    }

    #[test]
    fn head_lines_is_bounded() {
        let text = "a\nb\nc\nd\n";
        assert_eq!(head_lines(text, 2), "a\nb");
        assert_eq!(head_lines(text, 10), "a\nb\nc\nd");
    }
}
