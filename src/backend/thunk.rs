//! Executable callback trampolines.
//!
//! Native code can only call a bare code address, so every script callback
//! gets a small generated stub that loads the address of its context object
//! and forwards to one shared dispatch routine. Stubs are written from a
//! fixed template into fixed-size slots carved out of executable pages;
//! released slots go on a free list and are reused, pages are only returned
//! to the OS when the pool itself is dropped.
//!
//! x86_64 stub (Microsoft x64 convention):
//!
//! ```text
//! mov [rsp+8..32], rcx/rdx/r8/r9   ; spill register args into the shadow area
//! sub rsp, 72
//! movq [rsp+32..56], xmm0..xmm3     ; float register args
//! mov rcx, <context>
//! lea rdx, [rsp+80]                 ; argv: contiguous spilled + stack args
//! lea r8,  [rsp+32]                 ; float register copies
//! mov rax, <dispatch>
//! call rax
//! movq xmm0, rax                    ; float returns travel as raw bits
//! add rsp, 72
//! ret
//! ```
//!
//! x86 stub: `push argv; push context; call dispatch; ret n`.

use crate::error::{InteropError, InteropResult};

/// Size of one trampoline slot.
pub const THUNK_SLOT_SIZE: usize = 96;

const FILL: u8 = 0xCC;

/// Fill in the stub template for one callback.
#[cfg(target_arch = "x86_64")]
pub fn emit_thunk(context: usize, dispatch: usize, _callee_pop_bytes: u16) -> [u8; THUNK_SLOT_SIZE] {
    let mut code = [FILL; THUNK_SLOT_SIZE];
    let mut len = 0;
    let mut put = |bytes: &[u8]| {
        code[len..len + bytes.len()].copy_from_slice(bytes);
        len += bytes.len();
    };

    put(&[0x48, 0x89, 0x4C, 0x24, 0x08]); // mov [rsp+8], rcx
    put(&[0x48, 0x89, 0x54, 0x24, 0x10]); // mov [rsp+16], rdx
    put(&[0x4C, 0x89, 0x44, 0x24, 0x18]); // mov [rsp+24], r8
    put(&[0x4C, 0x89, 0x4C, 0x24, 0x20]); // mov [rsp+32], r9
    put(&[0x48, 0x83, 0xEC, 0x48]); // sub rsp, 72
    put(&[0x66, 0x0F, 0xD6, 0x44, 0x24, 0x20]); // movq [rsp+32], xmm0
    put(&[0x66, 0x0F, 0xD6, 0x4C, 0x24, 0x28]); // movq [rsp+40], xmm1
    put(&[0x66, 0x0F, 0xD6, 0x54, 0x24, 0x30]); // movq [rsp+48], xmm2
    put(&[0x66, 0x0F, 0xD6, 0x5C, 0x24, 0x38]); // movq [rsp+56], xmm3
    put(&[0x48, 0xB9]); // mov rcx, imm64
    put(&(context as u64).to_le_bytes());
    put(&[0x48, 0x8D, 0x54, 0x24, 0x50]); // lea rdx, [rsp+80]
    put(&[0x4C, 0x8D, 0x44, 0x24, 0x20]); // lea r8, [rsp+32]
    put(&[0x48, 0xB8]); // mov rax, imm64
    put(&(dispatch as u64).to_le_bytes());
    put(&[0xFF, 0xD0]); // call rax
    put(&[0x66, 0x48, 0x0F, 0x6E, 0xC0]); // movq xmm0, rax
    put(&[0x48, 0x83, 0xC4, 0x48]); // add rsp, 72
    put(&[0xC3]); // ret
    code
}

#[cfg(target_arch = "x86")]
pub fn emit_thunk(context: usize, dispatch: usize, callee_pop_bytes: u16) -> [u8; THUNK_SLOT_SIZE] {
    let mut code = [FILL; THUNK_SLOT_SIZE];
    let mut len = 0;
    let mut put = |bytes: &[u8]| {
        code[len..len + bytes.len()].copy_from_slice(bytes);
        len += bytes.len();
    };

    put(&[0x8D, 0x44, 0x24, 0x04]); // lea eax, [esp+4]
    put(&[0x50]); // push eax
    put(&[0x68]); // push imm32
    put(&(context as u32).to_le_bytes());
    put(&[0xB8]); // mov eax, imm32
    put(&(dispatch as u32).to_le_bytes());
    put(&[0xFF, 0xD0]); // call eax
    put(&[0x83, 0xC4, 0x08]); // add esp, 8
    if callee_pop_bytes > 0 {
        put(&[0xC2]); // ret imm16
        put(&callee_pop_bytes.to_le_bytes());
    } else {
        put(&[0xC3]);
    }
    code
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "x86")))]
pub fn emit_thunk(_context: usize, _dispatch: usize, _callee_pop_bytes: u16) -> [u8; THUNK_SLOT_SIZE] {
    [FILL; THUNK_SLOT_SIZE]
}

// =========================================================================
// Executable pages
// =========================================================================

struct CodePage {
    base: *mut u8,
    size: usize,
}

impl Drop for CodePage {
    fn drop(&mut self) {
        if let Err(e) = free_executable_region(self.base, self.size) {
            log::warn!("{}", e);
        }
    }
}

/// Pool of fixed-size executable trampoline slots.
pub struct CodePool {
    page_size: usize,
    pages: Vec<CodePage>,
    free: Vec<usize>,
    live: usize,
}

impl CodePool {
    pub fn new(page_size: usize) -> Self {
        Self {
            page_size: page_size.max(THUNK_SLOT_SIZE),
            pages: Vec::new(),
            free: Vec::new(),
            live: 0,
        }
    }

    /// Write a trampoline for `context` and return its entry address.
    pub fn allocate(
        &mut self,
        context: usize,
        dispatch: usize,
        callee_pop_bytes: u16,
    ) -> InteropResult<usize> {
        if !cfg!(any(target_arch = "x86_64", target_arch = "x86")) {
            return Err(InteropError::unsupported(format!(
                "callback trampolines on {}",
                std::env::consts::ARCH
            )));
        }
        if self.free.is_empty() {
            self.add_page()?;
        }
        let slot = self
            .free
            .pop()
            .ok_or_else(|| InteropError::fault("no executable code slots available"))?;

        let code = emit_thunk(context, dispatch, callee_pop_bytes);
        // Safety: `slot` is a THUNK_SLOT_SIZE region inside one of our
        // read/write/execute pages, and no other thunk uses it.
        unsafe {
            std::ptr::copy_nonoverlapping(code.as_ptr(), slot as *mut u8, THUNK_SLOT_SIZE);
        }
        self.live += 1;
        log::trace!("thunk slot {:#x} -> context {:#x}", slot, context);
        Ok(slot)
    }

    /// Return a slot to the free list.
    pub fn recycle(&mut self, slot: usize) {
        if !self.owns(slot) {
            log::warn!("ignoring recycle of foreign code address {:#x}", slot);
            return;
        }
        // Overwrite with int3 so a stale call traps instead of running the
        // previous callback.
        unsafe {
            std::ptr::write_bytes(slot as *mut u8, FILL, THUNK_SLOT_SIZE);
        }
        self.free.push(slot);
        self.live = self.live.saturating_sub(1);
    }

    pub fn owns(&self, addr: usize) -> bool {
        self.pages.iter().any(|p| {
            let base = p.base as usize;
            addr >= base && addr < base + p.size && (addr - base) % THUNK_SLOT_SIZE == 0
        })
    }

    pub fn live_slots(&self) -> usize {
        self.live
    }

    pub fn free_slots(&self) -> usize {
        self.free.len()
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    fn add_page(&mut self) -> InteropResult<()> {
        let size = self.page_size;
        let base = alloc_executable_region(size)?;
        let slots = size / THUNK_SLOT_SIZE;
        // Hand out low addresses first.
        for i in (0..slots).rev() {
            self.free.push(base as usize + i * THUNK_SLOT_SIZE);
        }
        self.pages.push(CodePage { base, size });
        log::debug!("allocated executable page {:p} ({} slots)", base, slots);
        Ok(())
    }
}

#[cfg(target_os = "windows")]
fn alloc_executable_region(len: usize) -> InteropResult<*mut u8> {
    use windows_sys::Win32::System::Memory::{
        MEM_COMMIT, MEM_RESERVE, PAGE_EXECUTE_READWRITE, VirtualAlloc,
    };

    let ptr = unsafe {
        VirtualAlloc(
            std::ptr::null_mut(),
            len,
            MEM_COMMIT | MEM_RESERVE,
            PAGE_EXECUTE_READWRITE,
        ) as *mut u8
    };
    if ptr.is_null() {
        return Err(InteropError::fault(format!(
            "VirtualAlloc failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(ptr)
}

#[cfg(target_os = "windows")]
fn free_executable_region(ptr: *mut u8, _len: usize) -> InteropResult<()> {
    use windows_sys::Win32::System::Memory::{MEM_RELEASE, VirtualFree};

    let ok = unsafe { VirtualFree(ptr as *mut _, 0, MEM_RELEASE) };
    if ok == 0 {
        return Err(InteropError::fault(format!(
            "VirtualFree failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

#[cfg(unix)]
fn alloc_executable_region(len: usize) -> InteropResult<*mut u8> {
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
            libc::MAP_ANON | libc::MAP_PRIVATE,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(InteropError::fault(format!(
            "mmap failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(ptr as *mut u8)
}

#[cfg(unix)]
fn free_executable_region(ptr: *mut u8, len: usize) -> InteropResult<()> {
    let rc = unsafe { libc::munmap(ptr as *mut _, len) };
    if rc != 0 {
        return Err(InteropError::fault(format!(
            "munmap failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

#[cfg(not(any(unix, target_os = "windows")))]
fn alloc_executable_region(_len: usize) -> InteropResult<*mut u8> {
    Err(InteropError::unsupported(
        "executable memory allocation on this platform",
    ))
}

#[cfg(not(any(unix, target_os = "windows")))]
fn free_executable_region(_ptr: *mut u8, _len: usize) -> InteropResult<()> {
    Ok(())
}

#[cfg(all(test, target_arch = "x86_64"))]
mod tests {
    use super::*;

    #[test]
    fn test_template_embeds_addresses() {
        let code = emit_thunk(0x1122_3344_5566_7788, 0x99AA_BBCC_DDEE_FF00, 0);
        assert_eq!(&code[48..50], &[0x48, 0xB9]);
        assert_eq!(&code[50..58], &0x1122_3344_5566_7788u64.to_le_bytes());
        assert_eq!(&code[68..70], &[0x48, 0xB8]);
        assert_eq!(&code[70..78], &0x99AA_BBCC_DDEE_FF00u64.to_le_bytes());
        assert_eq!(code[89], 0xC3);
        assert_eq!(code[90], FILL);
    }

    #[test]
    fn test_slots_are_recycled() {
        let mut pool = CodePool::new(4096);
        let a = pool.allocate(1, 2, 0).unwrap();
        let b = pool.allocate(3, 4, 0).unwrap();
        assert_ne!(a, b);
        assert_eq!(pool.live_slots(), 2);
        assert_eq!(pool.page_count(), 1);

        pool.recycle(a);
        assert_eq!(pool.live_slots(), 1);
        let c = pool.allocate(5, 6, 0).unwrap();
        assert_eq!(c, a);
        assert_eq!(pool.page_count(), 1);
    }

    #[test]
    fn test_pool_grows_by_pages() {
        let mut pool = CodePool::new(THUNK_SLOT_SIZE * 2);
        for i in 0..5 {
            pool.allocate(i, 0, 0).unwrap();
        }
        assert_eq!(pool.page_count(), 3);
        assert!(!pool.owns(12345));
    }
}
