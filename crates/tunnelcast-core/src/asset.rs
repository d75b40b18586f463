//! Rewriting of the published address inside the static site asset.
//!
//! The asset carries a single assignment line such as
//!
//! ```text
//! const DASHBOARD_URL = "https://old-words.trycloudflare.com";
//! ```
//!
//! Only the quoted URL of a line anchored on `<identifier> = "` and `";` is
//! replaced; every other byte of the file is preserved.

use regex::{Captures, Regex};

use crate::address::TunnelAddress;
use crate::error::{Error, Result};

/// Outcome of rewriting the asset content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rewrite {
    /// The asset already embeds the address; nothing to publish.
    Unchanged,
    /// The asset content with the new address embedded.
    Updated {
        content: String,
        /// URL embedded before the rewrite (first matching line).
        previous: String,
        /// Number of assignment lines rewritten.
        lines: usize,
    },
}

/// Matcher for the assignment line of one identifier.
#[derive(Debug, Clone)]
pub struct AssetPattern {
    identifier: String,
    re: Regex,
}

impl AssetPattern {
    /// Build the matcher for `identifier`, which is matched literally.
    pub fn new(identifier: &str) -> Result<Self> {
        let identifier = identifier.trim();
        if identifier.is_empty() {
            return Err(Error::Config("asset identifier must not be empty".into()));
        }
        let pattern = format!(
            r#"(?m)^(?P<head>[ \t]*(?:(?:const|let|var)[ \t]+)?{}[ \t]*=[ \t]*")(?P<url>[^"\n]*)(?P<tail>";)"#,
            regex::escape(identifier)
        );
        let re = Regex::new(&pattern)
            .map_err(|e| Error::Config(format!("invalid asset identifier {identifier:?}: {e}")))?;
        Ok(Self {
            identifier: identifier.to_string(),
            re,
        })
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// URL currently embedded in the first assignment line, if any.
    pub fn current_address<'a>(&self, content: &'a str) -> Option<&'a str> {
        self.re
            .captures(content)
            .and_then(|caps| caps.name("url"))
            .map(|m| m.as_str())
    }

    /// Embed `address` in every assignment line of `content`.
    pub fn rewrite(&self, content: &str, address: &TunnelAddress) -> Result<Rewrite> {
        let urls: Vec<&str> = self
            .re
            .captures_iter(content)
            .filter_map(|caps| caps.name("url").map(|m| m.as_str()))
            .collect();

        let Some(previous) = urls.first() else {
            return Err(Error::Asset(format!(
                "no `{} = \"...\";` line found",
                self.identifier
            )));
        };

        if urls.iter().all(|url| *url == address.as_str()) {
            return Ok(Rewrite::Unchanged);
        }

        let content = self
            .re
            .replace_all(content, |caps: &Captures<'_>| {
                format!("{}{}{}", &caps["head"], address.as_str(), &caps["tail"])
            })
            .into_owned();

        Ok(Rewrite::Updated {
            content,
            previous: (*previous).to_string(),
            lines: urls.len(),
        })
    }
}
