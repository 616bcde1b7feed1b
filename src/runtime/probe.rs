//! Memory probes for script-driven dereferences.
//!
//! Script code can hold a pointer to anything. Before the interop layer
//! reads or writes through such a pointer it asks the OS whether the range
//! is mapped with the right access, and turns a bad address into a
//! `NativeFault` error instead of a crash.

use crate::error::{InteropError, InteropResult};

const PROBE_PAGE: usize = 4096;

/// Fail unless `[addr, addr + len)` can be read.
pub fn check_readable(addr: usize, len: usize) -> InteropResult<()> {
    check_range(addr, len, Access::Read)
}

/// Fail unless `[addr, addr + len)` can be written.
pub fn check_writable(addr: usize, len: usize) -> InteropResult<()> {
    check_range(addr, len, Access::Write)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Access {
    Read,
    Write,
}

impl Access {
    fn verb(self) -> &'static str {
        match self {
            Access::Read => "read",
            Access::Write => "write",
        }
    }
}

fn check_range(addr: usize, len: usize, access: Access) -> InteropResult<()> {
    if len == 0 {
        return Ok(());
    }
    if addr == 0 {
        return Err(InteropError::fault(format!(
            "{} of {} bytes through a null pointer",
            access.verb(),
            len
        )));
    }
    if addr.checked_add(len).is_none() {
        return Err(InteropError::fault(format!(
            "{} of {} bytes at {:#x} wraps the address space",
            access.verb(),
            len,
            addr
        )));
    }
    if os_check(addr, len, access) {
        Ok(())
    } else {
        Err(InteropError::fault(format!(
            "invalid memory {} of {} bytes at {:#x}",
            access.verb(),
            len,
            addr
        )))
    }
}

/// Probe one page-bounded chunk at a time so a long range does not need a
/// large scratch buffer.
#[cfg(target_os = "linux")]
fn os_check(addr: usize, len: usize, access: Access) -> bool {
    let pid = unsafe { libc::getpid() };
    let mut scratch = [0u8; PROBE_PAGE];
    let mut cursor = addr;
    let end = addr + len;
    while cursor < end {
        let page_end = (cursor / PROBE_PAGE + 1) * PROBE_PAGE;
        let chunk = page_end.min(end) - cursor;
        let ok = match access {
            Access::Read => {
                let local = libc::iovec {
                    iov_base: scratch.as_mut_ptr() as *mut libc::c_void,
                    iov_len: chunk,
                };
                let remote = libc::iovec {
                    iov_base: cursor as *mut libc::c_void,
                    iov_len: chunk,
                };
                let n = unsafe { libc::process_vm_readv(pid, &local, 1, &remote, 1, 0) };
                n == chunk as isize
            }
            Access::Write => {
                // Read the current bytes and write them straight back; this
                // fails on read-only or unmapped pages without changing
                // anything.
                let local = libc::iovec {
                    iov_base: scratch.as_mut_ptr() as *mut libc::c_void,
                    iov_len: chunk,
                };
                let remote = libc::iovec {
                    iov_base: cursor as *mut libc::c_void,
                    iov_len: chunk,
                };
                let read = unsafe { libc::process_vm_readv(pid, &local, 1, &remote, 1, 0) };
                read == chunk as isize
                    && unsafe { libc::process_vm_writev(pid, &local, 1, &remote, 1, 0) }
                        == chunk as isize
            }
        };
        if !ok {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EFAULT) {
                // The syscall itself is unavailable (seccomp, old kernel);
                // nothing more can be checked.
                log::debug!("probe: {} check unavailable: {}", access.verb(), err);
                return true;
            }
            log::debug!("probe: {} failed at {:#x}", access.verb(), cursor);
            return false;
        }
        cursor += chunk;
    }
    true
}

#[cfg(target_os = "windows")]
fn os_check(addr: usize, len: usize, access: Access) -> bool {
    use windows_sys::Win32::System::Memory::{
        MEM_COMMIT, MEMORY_BASIC_INFORMATION, PAGE_EXECUTE_READ, PAGE_EXECUTE_READWRITE,
        PAGE_EXECUTE_WRITECOPY, PAGE_GUARD, PAGE_NOACCESS, PAGE_READONLY, PAGE_READWRITE,
        PAGE_WRITECOPY, VirtualQuery,
    };

    let end = addr + len;
    let mut cursor = addr;
    while cursor < end {
        let mut info: MEMORY_BASIC_INFORMATION = unsafe { std::mem::zeroed() };
        let n = unsafe {
            VirtualQuery(
                cursor as *const _,
                &mut info,
                std::mem::size_of::<MEMORY_BASIC_INFORMATION>(),
            )
        };
        if n == 0 || info.State != MEM_COMMIT {
            return false;
        }
        let protect = info.Protect;
        if protect & (PAGE_GUARD | PAGE_NOACCESS) != 0 {
            return false;
        }
        let allowed = match access {
            Access::Read => {
                PAGE_READONLY
                    | PAGE_READWRITE
                    | PAGE_WRITECOPY
                    | PAGE_EXECUTE_READ
                    | PAGE_EXECUTE_READWRITE
                    | PAGE_EXECUTE_WRITECOPY
            }
            Access::Write => {
                PAGE_READWRITE | PAGE_WRITECOPY | PAGE_EXECUTE_READWRITE | PAGE_EXECUTE_WRITECOPY
            }
        };
        if protect & allowed == 0 {
            return false;
        }
        let region_end = info.BaseAddress as usize + info.RegionSize;
        if region_end <= cursor {
            return false;
        }
        cursor = region_end;
    }
    true
}

// No OS query available; only the null and wrap-around checks apply.
#[cfg(not(any(target_os = "linux", target_os = "windows")))]
fn os_check(_addr: usize, _len: usize, _access: Access) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_is_a_fault() {
        let err = check_readable(0, 4).unwrap_err();
        assert!(err.is_fault());
        assert!(check_readable(0, 0).is_ok());
    }

    #[test]
    fn test_stack_memory_is_accessible() {
        let mut buf = [7u8; 64];
        let addr = buf.as_mut_ptr() as usize;
        check_readable(addr, 64).unwrap();
        check_writable(addr, 64).unwrap();
        assert_eq!(buf[10], 7);
    }

    #[test]
    fn test_wraparound_is_a_fault() {
        assert!(check_readable(usize::MAX - 2, 8).is_err());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_unmapped_page_is_a_fault() {
        let mut probe = [0u8; 8];
        let local = libc::iovec {
            iov_base: probe.as_mut_ptr() as *mut libc::c_void,
            iov_len: 8,
        };
        let n = unsafe { libc::process_vm_readv(libc::getpid(), &local, 1, &local, 1, 0) };
        if n != 8 {
            // Sandboxed without process_vm_readv.
            return;
        }
        // The first page is never mapped on Linux.
        assert!(check_readable(0x10, 8).unwrap_err().is_fault());
    }
}
