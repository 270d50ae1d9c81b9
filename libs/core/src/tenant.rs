//! Tenant admission control.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

const ALLOW_ALL_KEYWORDS: [&str; 2] = ["allow-all", "*"];

/// Which tenants may use the gateway. Chosen once at startup.
///
/// Deserializes from either the keyword `"allow-all"` (or `"*"`) or a list of tenant ids. An
/// empty list denies every tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawPolicy", into = "RawPolicy")]
pub enum TenantPolicy {
    AllowAll,
    AllowList(BTreeSet<String>),
}

impl Default for TenantPolicy {
    fn default() -> Self {
        TenantPolicy::AllowList(BTreeSet::new())
    }
}

impl TenantPolicy {
    pub fn allow_list<I, S>(tenants: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        TenantPolicy::AllowList(
            tenants
                .into_iter()
                .map(|t| t.as_ref().trim().to_string())
                .filter(|t| !t.is_empty())
                .collect(),
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum RawPolicy {
    Keyword(String),
    List(Vec<String>),
}

impl TryFrom<RawPolicy> for TenantPolicy {
    type Error = String;

    fn try_from(raw: RawPolicy) -> Result<Self, Self::Error> {
        match raw {
            RawPolicy::Keyword(word) if ALLOW_ALL_KEYWORDS.contains(&word.trim()) => {
                Ok(TenantPolicy::AllowAll)
            }
            RawPolicy::Keyword(word) => Err(format!(
                "unsupported tenant policy `{word}`; expected \"allow-all\" or a list of tenant ids"
            )),
            RawPolicy::List(list) => Ok(TenantPolicy::allow_list(list)),
        }
    }
}

impl From<TenantPolicy> for RawPolicy {
    fn from(policy: TenantPolicy) -> Self {
        match policy {
            TenantPolicy::AllowAll => RawPolicy::Keyword(ALLOW_ALL_KEYWORDS[0].into()),
            TenantPolicy::AllowList(set) => RawPolicy::List(set.into_iter().collect()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allow,
    Deny,
}

impl Admission {
    pub fn is_allowed(self) -> bool {
        matches!(self, Admission::Allow)
    }
}

/// Read-only admission filter shared by every request.
#[derive(Debug, Clone, Default)]
pub struct TenantGate {
    policy: TenantPolicy,
}

impl TenantGate {
    pub fn new(policy: TenantPolicy) -> Self {
        Self { policy }
    }

    pub fn allow_all() -> Self {
        Self::new(TenantPolicy::AllowAll)
    }

    pub fn policy(&self) -> &TenantPolicy {
        &self.policy
    }

    pub fn check(&self, tenant: &str) -> Admission {
        match &self.policy {
            TenantPolicy::AllowAll => Admission::Allow,
            TenantPolicy::AllowList(tenants) if tenants.contains(tenant.trim()) => Admission::Allow,
            TenantPolicy::AllowList(_) => Admission::Deny,
        }
    }
}
