//! Host introspection: everything an announcement says about the machine
//! the agent is running on.

mod keys;
mod network;
mod passwd;
mod uname;

pub use keys::{authorized_keys, extra_authorized_keys, preferred_host_public_key};
pub use network::network_info;
pub use uname::uname_info;

use postfab_crypto::keys::marshal_public_key;
use postfab_proto::v1::{AuthorizedKey, NetworkInfo, UnameInfo};

/// Errors from gathering host information. All of these are fatal at agent
/// startup.
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("syscall failed: {0}")]
    Syscall(#[from] nix::Error),

    #[error("invalid key material: {0}")]
    Key(#[from] postfab_crypto::KeyError),

    #[error("no host public keys found in /etc/ssh")]
    NoHostKeys,

    #[error("no host public key matches the available host key algorithms")]
    NoMatchingHostKey,

    #[error("failed to enumerate host key algorithms: {0}")]
    HostKeyAlgorithms(String),

    #[error("cannot determine the current user")]
    UnknownUser,
}

/// The machine self-description an agent announces.
#[derive(Debug, Clone)]
pub struct HostInfo {
    pub uname: UnameInfo,
    pub network: NetworkInfo,
    /// OpenSSH authorized-key text form of the preferred host key.
    pub preferred_host_public_key: Vec<u8>,
    pub authorized_keys: Vec<AuthorizedKey>,
}

impl HostInfo {
    /// Read the live host: uname, non-loopback interfaces, the preferred
    /// host key from `/etc/ssh` and every reachable authorized_keys file.
    pub fn gather() -> Result<Self, HostError> {
        let host_key = preferred_host_public_key()?;
        Ok(Self {
            uname: uname_info()?,
            network: network_info()?,
            preferred_host_public_key: marshal_public_key(&host_key)?,
            authorized_keys: authorized_keys()?,
        })
    }
}
