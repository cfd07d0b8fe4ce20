//! Child-side identity switch. Raw syscalls only, nothing is logged.

use super::Credentials;
use nix::errno::Errno;
use nix::unistd::{getegid, geteuid, getgid, getuid, setgroups, setresgid, setresuid, Gid, Uid};

/// clear groups -> setresgid -> setresuid -> verify
pub fn switch_credentials(creds: &Credentials) -> Result<(), Errno> {
    setgroups(&[])?;

    if let Some(gid) = creds.gid {
        let gid = Gid::from_raw(gid);
        setresgid(gid, gid, gid)?;
    }

    if let Some(uid) = creds.uid {
        let uid = Uid::from_raw(uid);
        setresuid(uid, uid, uid)?;
    }

    verify(creds)
}

fn verify(creds: &Credentials) -> Result<(), Errno> {
    if let Some(uid) = creds.uid {
        if getuid().as_raw() != uid || geteuid().as_raw() != uid {
            return Err(Errno::EPERM);
        }
    }
    if let Some(gid) = creds.gid {
        if getgid().as_raw() != gid || getegid().as_raw() != gid {
            return Err(Errno::EPERM);
        }
    }
    Ok(())
}
