//! SPIFFE ID and trust domain types and validation

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use url::Url;

const SCHEME_PREFIX: &str = "spiffe://";

/// The trust domain component of a SPIFFE ID.
///
/// Trust domains compare case-insensitively, so the name is stored lowercased.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TrustDomain(String);

impl TrustDomain {
    /// Create a trust domain from its bare name
    ///
    /// # Examples
    /// ```
    /// use spiffe_mtls::TrustDomain;
    ///
    /// let td = TrustDomain::new("Example.ORG").unwrap();
    /// assert_eq!(td.as_str(), "example.org");
    /// ```
    pub fn new(name: impl AsRef<str>) -> Result<Self> {
        let name = name.as_ref();

        if name.is_empty() {
            return Err(Error::invalid_spiffe_id("Trust domain cannot be empty"));
        }

        let name = name.to_ascii_lowercase();
        if let Some(c) = name
            .chars()
            .find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '-' | '_')))
        {
            return Err(Error::invalid_spiffe_id(format!(
                "Trust domain contains invalid character '{}'",
                c
            )));
        }

        if name.starts_with('.') || name.ends_with('.') || name.contains("..") {
            return Err(Error::invalid_spiffe_id(
                "Trust domain labels cannot be empty",
            ));
        }

        Ok(TrustDomain(name))
    }

    /// Get the trust domain name
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The SPIFFE ID naming the trust domain itself (`spiffe://<td>`)
    pub fn id(&self) -> SpiffeId {
        SpiffeId {
            trust_domain: self.clone(),
            path: String::new(),
        }
    }
}

impl fmt::Display for TrustDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for TrustDomain {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl TryFrom<String> for TrustDomain {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        Self::new(s)
    }
}

impl From<TrustDomain> for String {
    fn from(td: TrustDomain) -> Self {
        td.0
    }
}

/// A SPIFFE ID uniquely identifies a workload
///
/// Equality is defined on the normalized form: the trust domain is compared
/// case-insensitively, the path case-sensitively.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SpiffeId {
    trust_domain: TrustDomain,
    path: String,
}

impl SpiffeId {
    /// Create a new SPIFFE ID from trust domain and path
    ///
    /// # Examples
    /// ```
    /// use spiffe_mtls::SpiffeId;
    ///
    /// let id = SpiffeId::new("example.org", "/service/web").unwrap();
    /// assert_eq!(id.to_string(), "spiffe://example.org/service/web");
    /// ```
    pub fn new(trust_domain: impl AsRef<str>, path: impl AsRef<str>) -> Result<Self> {
        let trust_domain = TrustDomain::new(trust_domain)?;
        let path = path.as_ref();

        let path = if path.is_empty() || path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{}", path)
        };
        validate_path(&path)?;

        Ok(SpiffeId { trust_domain, path })
    }

    /// Parse a SPIFFE ID from a string
    ///
    /// # Examples
    /// ```
    /// use spiffe_mtls::SpiffeId;
    ///
    /// let id = SpiffeId::parse("spiffe://example.org/service/web").unwrap();
    /// assert_eq!(id.trust_domain().as_str(), "example.org");
    /// assert_eq!(id.path(), "/service/web");
    /// ```
    pub fn parse(s: impl AsRef<str>) -> Result<Self> {
        let s = s.as_ref();

        let rest = s.strip_prefix(SCHEME_PREFIX).ok_or_else(|| {
            Error::invalid_spiffe_id(format!("'{}' does not use the spiffe:// scheme", s))
        })?;

        if rest.contains('?') || rest.contains('#') {
            return Err(Error::invalid_spiffe_id(
                "SPIFFE ID cannot contain a query or fragment",
            ));
        }

        // Structural sanity (userinfo, port, percent escapes) is left to the URL parser.
        let url = Url::parse(s).map_err(|e| Error::invalid_spiffe_id(e.to_string()))?;
        if !url.username().is_empty() || url.password().is_some() {
            return Err(Error::invalid_spiffe_id("SPIFFE ID cannot contain userinfo"));
        }
        if url.port().is_some() {
            return Err(Error::invalid_spiffe_id("SPIFFE ID cannot contain a port"));
        }

        let (authority, path) = match rest.find('/') {
            Some(idx) => rest.split_at(idx),
            None => (rest, ""),
        };

        let trust_domain = TrustDomain::new(authority)?;
        validate_path(path)?;

        Ok(SpiffeId {
            trust_domain,
            path: path.to_string(),
        })
    }

    /// Get the trust domain
    pub fn trust_domain(&self) -> &TrustDomain {
        &self.trust_domain
    }

    /// Get the path component (empty for a trust domain ID)
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Check if this ID belongs to the specified trust domain
    pub fn is_member_of(&self, trust_domain: &TrustDomain) -> bool {
        &self.trust_domain == trust_domain
    }
}

fn validate_path(path: &str) -> Result<()> {
    if path.is_empty() {
        return Ok(());
    }

    if !path.starts_with('/') {
        return Err(Error::invalid_spiffe_id("Path must start with '/'"));
    }

    for segment in path[1..].split('/') {
        match segment {
            "" => {
                return Err(Error::invalid_spiffe_id(
                    "Path cannot contain empty segments or a trailing '/'",
                ))
            }
            "." | ".." => {
                return Err(Error::invalid_spiffe_id(
                    "Path cannot contain '.' or '..' segments",
                ))
            }
            _ => {}
        }

        if let Some(c) = segment
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_')))
        {
            return Err(Error::invalid_spiffe_id(format!(
                "Path contains invalid character '{}'",
                c
            )));
        }
    }

    Ok(())
}

impl fmt::Display for SpiffeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", SCHEME_PREFIX, self.trust_domain, self.path)
    }
}

impl FromStr for SpiffeId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for SpiffeId {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(s)
    }
}

impl From<SpiffeId> for String {
    fn from(id: SpiffeId) -> Self {
        id.to_string()
    }
}
