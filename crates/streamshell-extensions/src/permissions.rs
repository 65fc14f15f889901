//! Requested capabilities checked against the host policy.

use std::collections::BTreeSet;

use crate::error::ExtensionError;
use crate::manifest::Capability;

/// The set of capabilities the host is willing to grant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionPolicy {
    allowed: BTreeSet<Capability>,
}

impl Default for PermissionPolicy {
    fn default() -> Self {
        Self::allow_all()
    }
}

impl PermissionPolicy {
    pub fn allow_all() -> Self {
        Self {
            allowed: Capability::ALL.into_iter().collect(),
        }
    }

    pub fn deny_all() -> Self {
        Self {
            allowed: BTreeSet::new(),
        }
    }

    /// Policy granting everything except the comma-separated tokens in `denied`.
    ///
    /// Unknown tokens are logged and ignored.
    pub fn from_denied_list(denied: &str) -> Self {
        let mut policy = Self::allow_all();
        for token in denied.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            match token.parse::<Capability>() {
                Ok(cap) => policy = policy.deny(cap),
                Err(_) => tracing::warn!(token = %token, "ignoring unknown capability in policy"),
            }
        }
        policy
    }

    pub fn allow(mut self, capability: Capability) -> Self {
        self.allowed.insert(capability);
        self
    }

    pub fn deny(mut self, capability: Capability) -> Self {
        self.allowed.remove(&capability);
        self
    }

    pub fn allows(&self, capability: Capability) -> bool {
        self.allowed.contains(&capability)
    }
}

/// Check every requested capability against `policy`.
///
/// Fails on the first refused capability, in [`Capability::ALL`] order.
pub fn validate(
    requested: &BTreeSet<Capability>,
    policy: &PermissionPolicy,
) -> Result<(), ExtensionError> {
    match requested.iter().find(|cap| !policy.allows(**cap)) {
        Some(cap) => Err(ExtensionError::PermissionDenied(*cap)),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(list: &[Capability]) -> BTreeSet<Capability> {
        list.iter().copied().collect()
    }

    #[test]
    fn test_allow_all_accepts_everything() {
        let requested: BTreeSet<Capability> = Capability::ALL.into_iter().collect();
        assert!(validate(&requested, &PermissionPolicy::allow_all()).is_ok());
    }

    #[test]
    fn test_empty_request_always_ok() {
        assert!(validate(&BTreeSet::new(), &PermissionPolicy::deny_all()).is_ok());
    }

    #[test]
    fn test_denied_capability_reported() {
        let policy = PermissionPolicy::allow_all().deny(Capability::Network);
        let err = validate(&caps(&[Capability::Storage, Capability::Network]), &policy)
            .unwrap_err();
        assert!(matches!(
            err,
            ExtensionError::PermissionDenied(Capability::Network)
        ));
    }

    #[test]
    fn test_first_denied_in_enum_order() {
        let policy = PermissionPolicy::deny_all().allow(Capability::Storage);
        let err = validate(
            &caps(&[Capability::StreamMetadata, Capability::Network]),
            &policy,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ExtensionError::PermissionDenied(Capability::Network)
        ));
    }

    #[test]
    fn test_from_denied_list() {
        let policy = PermissionPolicy::from_denied_list("network, ui ,bogus,");
        assert!(!policy.allows(Capability::Network));
        assert!(!policy.allows(Capability::UiModification));
        assert!(policy.allows(Capability::Storage));
        assert!(policy.allows(Capability::ChatRead));
    }

    #[test]
    fn test_from_empty_denied_list_is_allow_all() {
        assert_eq!(
            PermissionPolicy::from_denied_list(""),
            PermissionPolicy::allow_all()
        );
    }
}
