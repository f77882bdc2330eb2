//! Relay URL normalization (spec §3): lowercase scheme/host, default-port
//! elided, trailing `/` removed, path preserved if non-empty, fragments and
//! default (empty) query removed. Normalization is injective on
//! semantically equivalent URLs — grounded on
//! `enostr::relay::identity::NormRelayUrl`'s `canonicalize_url`, generalized
//! to the fuller rule set spec'd here rather than delegating entirely to
//! `url::Url`'s own (looser) canonical form.

use std::fmt;

use url::Url;

use crate::error::{Error, Result};

#[derive(Clone, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct RelayUrl(String);

impl RelayUrl {
    pub fn parse(raw: &str) -> Result<Self> {
        let mut url = Url::parse(raw).map_err(|e| Error::InvalidUrl(format!("{raw}: {e}")))?;

        match url.scheme() {
            "ws" | "wss" => {}
            other => return Err(Error::InvalidUrl(format!("unsupported scheme: {other}"))),
        }

        url.set_fragment(None);
        if url.query() == Some("") {
            url.set_query(None);
        }

        // Lowercase scheme/host; url::Url already lowercases the scheme, and
        // lowercases hosts for "special" schemes, but ws/wss are non-special
        // to the WHATWG URL algorithm so we normalize the host ourselves.
        if let Some(host) = url.host_str() {
            let lowered = host.to_ascii_lowercase();
            let _ = url.set_host(Some(&lowered));
        }

        // Elide the default port for the scheme.
        let default_port = match url.scheme() {
            "ws" => Some(80),
            "wss" => Some(443),
            _ => None,
        };
        if url.port() == default_port {
            let _ = url.set_port(None);
        }

        let mut s = url.to_string();
        if s.ends_with('/') && url.path() == "/" {
            s.pop();
        }

        Ok(RelayUrl(s))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for RelayUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for RelayUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
