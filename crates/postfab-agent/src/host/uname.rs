//! Kernel identification via `uname(2)`.

use postfab_proto::v1::UnameInfo;

use super::HostError;

pub fn uname_info() -> Result<UnameInfo, HostError> {
    let uts = nix::sys::utsname::uname()?;
    Ok(UnameInfo {
        kernel_name: uts.sysname().to_string_lossy().into_owned(),
        hostname: uts.nodename().to_string_lossy().into_owned(),
        kernel_release: uts.release().to_string_lossy().into_owned(),
        kernel_version: uts.version().to_string_lossy().into_owned(),
        machine: uts.machine().to_string_lossy().into_owned(),
    })
}
