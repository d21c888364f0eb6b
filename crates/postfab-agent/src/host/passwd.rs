//! `/etc/passwd` parsing for user enumeration.

use std::path::PathBuf;

use tracing::warn;

const PASSWD_PATH: &str = "/etc/passwd";

#[derive(Debug, Clone)]
pub struct PasswdEntry {
    pub name: String,
    pub uid: u32,
    pub home: PathBuf,
}

/// All users on the system. Fails only if `/etc/passwd` cannot be read;
/// malformed lines are skipped.
pub fn all_users() -> std::io::Result<Vec<PasswdEntry>> {
    Ok(parse(&std::fs::read_to_string(PASSWD_PATH)?))
}

/// Look up a single user by uid.
pub fn lookup_uid(uid: u32) -> std::io::Result<Option<PasswdEntry>> {
    Ok(all_users()?.into_iter().find(|u| u.uid == uid))
}

fn parse(contents: &str) -> Vec<PasswdEntry> {
    let mut users = Vec::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = line.split(':').collect();
        if fields.len() < 6 {
            warn!(line, "skipping malformed passwd entry");
            continue;
        }
        let Ok(uid) = fields[2].parse::<u32>() else {
            warn!(line, "skipping passwd entry with non-numeric uid");
            continue;
        };
        users.push(PasswdEntry {
            name: fields[0].to_owned(),
            uid,
            home: PathBuf::from(fields[5]),
        });
    }
    users
}
