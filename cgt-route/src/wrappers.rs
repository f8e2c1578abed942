use std::{ffi::CString, io, num::NonZeroU32};

/// Returns the index of the network interface `name`.
pub fn if_nametoindex(name: &str) -> io::Result<NonZeroU32> {
    let string = CString::new(name).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    let index = unsafe { nix::libc::if_nametoindex(string.as_ptr()) };
    NonZeroU32::new(index).ok_or_else(io::Error::last_os_error)
}
