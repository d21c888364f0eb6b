//! Behaviour attached to the generated announcement and filter types.

use ssh_key::{HashAlg, PublicKey};

use crate::v1::{Announcement, BasicFilter, Operator};

/// Errors from interpreting an announcement's key material.
#[derive(Debug, thiserror::Error)]
pub enum AnnouncementError {
    #[error("preferred host public key is not valid UTF-8")]
    InvalidEncoding,

    #[error("invalid preferred host public key: {0}")]
    InvalidHostKey(#[from] ssh_key::Error),
}

impl Announcement {
    /// The announcement's derived identity: the SHA256 fingerprint of its
    /// preferred host public key. Parse failure is the only error path.
    pub fn fingerprint(&self) -> Result<String, AnnouncementError> {
        let text = std::str::from_utf8(&self.preferred_host_public_key)
            .map_err(|_| AnnouncementError::InvalidEncoding)?;
        let key = PublicKey::from_openssh(text)?;
        Ok(key.fingerprint(HashAlg::Sha256).to_string())
    }

    /// Evaluate a filter against this announcement.
    ///
    /// Each predicate is true iff at least one corresponding element of the
    /// announcement matches literally. An unspecified predicate contributes
    /// false under `Or` and true under `And`.
    pub fn filter_accepts(&self, filter: &BasicFilter) -> bool {
        let key = filter
            .has_authorized_key
            .as_deref()
            .map(|fp| self.matches_authorized_key(fp));
        let ip = filter
            .has_ip_address
            .as_deref()
            .map(|addr| self.matches_ip_address(addr));
        let hostname = filter
            .has_hostname
            .as_deref()
            .map(|name| self.matches_hostname(name));

        match filter.operator() {
            Operator::Or => {
                key.unwrap_or(false) || ip.unwrap_or(false) || hostname.unwrap_or(false)
            }
            Operator::And => key.unwrap_or(true) && ip.unwrap_or(true) && hostname.unwrap_or(true),
        }
    }

    fn matches_authorized_key(&self, fingerprint: &str) -> bool {
        self.authorized_keys
            .iter()
            .any(|k| k.fingerprint == fingerprint)
    }

    fn matches_ip_address(&self, addr: &str) -> bool {
        let interfaces = match &self.network {
            Some(network) => &network.network_interfaces,
            None => return false,
        };
        interfaces.iter().flat_map(|i| &i.addresses).any(|a| {
            if addr.contains('/') {
                a.cidr == addr
            } else {
                a.address == addr
            }
        })
    }

    fn matches_hostname(&self, hostname: &str) -> bool {
        self.uname.as_ref().is_some_and(|u| u.hostname == hostname)
    }
}
