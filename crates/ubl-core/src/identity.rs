//! Normalized caller identity.
//!
//! Authentication happens upstream; the core consumes an already-verified
//! identity from the request context and never parses tokens itself.

use serde::{Deserialize, Serialize};

/// A verified caller identity injected by the transport layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// User id, `u:<slug>`.
    pub user_id: String,
    /// Verified email address.
    pub email: String,
    /// Domain portion of the email, lowercased.
    pub email_domain: String,
    /// Group memberships from the identity provider.
    #[serde(default)]
    pub groups: Vec<String>,
    /// True for machine/service principals.
    #[serde(default)]
    pub is_service: bool,
}

impl Identity {
    /// Builds an identity from a user id and email, deriving the domain.
    #[must_use]
    pub fn new(user_id: impl Into<String>, email: impl Into<String>) -> Self {
        let email = email.into();
        let email_domain = email
            .rsplit_once('@')
            .map(|(_, d)| d.to_lowercase())
            .unwrap_or_default();
        Self {
            user_id: user_id.into(),
            email,
            email_domain,
            groups: Vec::new(),
            is_service: false,
        }
    }

    /// Resolves the tenant for this identity: `t:<email_domain>`, except
    /// platform domains which collapse to `t:ubl_core`.
    #[must_use]
    pub fn tenant_id(&self, platform_domains: &[String]) -> String {
        if platform_domains
            .iter()
            .any(|d| d.eq_ignore_ascii_case(&self.email_domain))
        {
            "t:ubl_core".to_string()
        } else {
            format!("t:{}", self.email_domain)
        }
    }
}
