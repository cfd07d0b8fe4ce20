//! UID/GID switching for the child.
//!
//! The gid always changes before the uid: once the uid is dropped the
//! process can no longer change its groups.

mod transition;
mod validation;

pub use transition::switch_credentials;
pub use validation::validate_credentials;

/// Target identity for the child. Unset fields are left unchanged.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Credentials {
    pub uid: Option<u32>,
    pub gid: Option<u32>,
}

impl Credentials {
    pub fn new(uid: Option<u32>, gid: Option<u32>) -> Option<Self> {
        if uid.is_none() && gid.is_none() {
            None
        } else {
            Some(Self { uid, gid })
        }
    }
}
