//! Host key selection and authorized-key collection.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use ssh_key::PublicKey;
use tracing::{debug, error, info};

use postfab_crypto::keys::{fingerprint_sha256, parse_authorized_key};
use postfab_crypto::KeyError;
use postfab_proto::v1::AuthorizedKey;

use super::passwd;
use super::HostError;

const SSH_DIR: &str = "/etc/ssh";

/// Pick the host public key from `/etc/ssh/ssh_host_*_key.pub`, preferring
/// the first algorithm `ssh -Q HostKeyAlgorithms` lists.
pub fn preferred_host_public_key() -> Result<PublicKey, HostError> {
    let algorithms = host_key_algorithms()?;

    let mut keys = Vec::new();
    for entry in std::fs::read_dir(SSH_DIR)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !name.starts_with("ssh_host_") || !name.ends_with("_key.pub") {
            continue;
        }
        info!(file = %name, "reading host public key");
        let data = std::fs::read_to_string(entry.path())?;
        let key = PublicKey::from_openssh(data.trim()).map_err(KeyError::from)?;
        keys.push(key);
    }
    if keys.is_empty() {
        return Err(HostError::NoHostKeys);
    }

    for algorithm in &algorithms {
        if let Some(key) = keys.iter().find(|k| k.algorithm().as_str() == algorithm) {
            return Ok(key.clone());
        }
    }
    Err(HostError::NoMatchingHostKey)
}

fn host_key_algorithms() -> Result<Vec<String>, HostError> {
    let output = std::process::Command::new("ssh")
        .args(["-Q", "HostKeyAlgorithms"])
        .output()
        .map_err(|e| HostError::HostKeyAlgorithms(e.to_string()))?;
    if !output.status.success() {
        return Err(HostError::HostKeyAlgorithms(format!(
            "ssh -Q exited with {}",
            output.status
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(ToOwned::to_owned)
        .collect())
}

struct KeyFile {
    path: PathBuf,
    user: String,
}

/// The authorized_keys files to read: the current user's when unprivileged,
/// every user's when running as root.
fn authorized_key_files() -> Result<Vec<KeyFile>, HostError> {
    let euid = nix::unistd::geteuid();
    let mut files = Vec::new();
    let mut seen = HashSet::new();

    if euid.is_root() {
        let root_path = PathBuf::from("/root/.ssh/authorized_keys");
        if root_path.exists() {
            seen.insert(root_path.clone());
            files.push(KeyFile {
                path: root_path,
                user: "root".into(),
            });
        }
        for user in passwd::all_users()? {
            let path = user.home.join(".ssh/authorized_keys");
            if path.exists() && seen.insert(path.clone()) {
                files.push(KeyFile {
                    path,
                    user: user.name,
                });
            }
        }
    } else {
        let user = passwd::lookup_uid(euid.as_raw())?.ok_or(HostError::UnknownUser)?;
        let path = user.home.join(".ssh/authorized_keys");
        if path.exists() {
            files.push(KeyFile {
                path,
                user: user.name,
            });
        }
    }
    Ok(files)
}

/// Collect every readable authorized key on the system, attributed to its
/// owning user. Unreadable files and unparsable entries are skipped.
pub fn authorized_keys() -> Result<Vec<AuthorizedKey>, HostError> {
    let mut keys = Vec::new();
    for file in authorized_key_files()? {
        let contents = match std::fs::read_to_string(&file.path) {
            Ok(contents) => contents,
            Err(e) => {
                error!(path = %file.path.display(), error = %e, "failed to open authorized_keys file");
                continue;
            }
        };
        keys.extend(parse_entries(&contents, &file.user, &file.path));
    }
    Ok(keys)
}

fn parse_entries(contents: &str, user: &str, path: &Path) -> Vec<AuthorizedKey> {
    let mut keys = Vec::new();
    for line in contents.lines() {
        match parse_authorized_key(line.as_bytes()) {
            Ok(parsed) => keys.push(to_authorized_key(&parsed.key, parsed.options, user)),
            Err(KeyError::Empty) => {}
            Err(e) => {
                error!(path = %path.display(), error = %e, "error parsing authorized_keys entry");
            }
        }
    }
    keys
}

/// Parse operator-supplied extra authorized-key lines, attributed to the
/// current user. Unlike on-disk collection, a bad entry here is an error.
pub fn extra_authorized_keys(lines: &[String]) -> Result<Vec<AuthorizedKey>, HostError> {
    if lines.is_empty() {
        return Ok(Vec::new());
    }
    let user = current_username()?;
    lines
        .iter()
        .map(|line| {
            let parsed = parse_authorized_key(line.as_bytes())?;
            debug!(fingerprint = %fingerprint_sha256(&parsed.key), "adding extra authorized key");
            Ok(to_authorized_key(&parsed.key, parsed.options, &user))
        })
        .collect()
}

fn to_authorized_key(key: &PublicKey, options: Vec<String>, user: &str) -> AuthorizedKey {
    AuthorizedKey {
        user: user.to_owned(),
        key_type: key.algorithm().as_str().to_owned(),
        fingerprint: fingerprint_sha256(key),
        comment: key.comment().to_owned(),
        options,
    }
}

fn current_username() -> Result<String, HostError> {
    if let Some(user) = passwd::lookup_uid(nix::unistd::geteuid().as_raw())? {
        return Ok(user.name);
    }
    std::env::var("USER").map_err(|_| HostError::UnknownUser)
}
