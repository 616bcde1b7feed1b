//! Native heap for host-allocated buffers
//!
//! This module owns every block of native memory the host allocates on
//! script code's behalf (`create`, plus pointer targets written into such
//! blocks). Design goals:
//! - One owning table keyed by address, ordered for sub-range lookup
//! - Wrapper finalization only marks a block orphaned
//! - A stop-the-world mark/sweep over declared pointer fields decides what
//!   is actually freed
//!
//! Memory owned by native code is never entered in this table.

use std::alloc::{self, Layout};
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap};

use crate::backend::layout::{compound_layout, compute_array_layout};
use crate::error::{InteropError, InteropResult};
use crate::types::{POINTER_SIZE, SigKind, SigRef, TypeRegistry, TypeSig};

/// One tracked allocation.
pub struct NativeBuffer {
    ptr: *mut u8,
    layout: Layout,
    sig: SigRef,
    /// A script wrapper for this buffer is still alive.
    wrapper_alive: bool,
    /// Reached during the current scan.
    referenced: bool,
}

impl NativeBuffer {
    pub fn size(&self) -> usize {
        self.layout.size()
    }

    pub fn sig(&self) -> &SigRef {
        &self.sig
    }

    pub fn is_orphaned(&self) -> bool {
        !self.wrapper_alive
    }
}

/// Counters reported by a lifecycle scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub roots: usize,
    pub reached: usize,
    pub freed: usize,
    pub freed_bytes: usize,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HeapStats {
    pub live_buffers: usize,
    pub live_bytes: usize,
    pub total_allocated: usize,
    pub total_freed: usize,
    pub scans: usize,
}

/// The native heap allocator.
pub struct NativeHeap {
    buffers: RefCell<BTreeMap<usize, NativeBuffer>>,
    /// Live pointer wrappers into tracked buffers: root id -> address.
    roots: RefCell<HashMap<u64, usize>>,
    next_root: Cell<u64>,
    /// Set by finalization, cleared when a scan is scheduled.
    scan_requested: Cell<bool>,
    stats: Cell<HeapStats>,
}

impl Default for NativeHeap {
    fn default() -> Self {
        Self::new()
    }
}

impl NativeHeap {
    pub fn new() -> Self {
        Self {
            buffers: RefCell::new(BTreeMap::new()),
            roots: RefCell::new(HashMap::new()),
            next_root: Cell::new(1),
            scan_requested: Cell::new(false),
            stats: Cell::new(HeapStats::default()),
        }
    }

    /// Allocate a zeroed buffer that a wrapper is about to own.
    pub fn allocate(&self, sig: SigRef, size: usize, align: usize) -> InteropResult<usize> {
        self.allocate_inner(sig, size, align, true)
    }

    /// Allocate a zeroed buffer with no wrapper. It survives only while a
    /// pointer field of another tracked buffer refers to it.
    pub fn allocate_detached(&self, sig: SigRef, size: usize, align: usize) -> InteropResult<usize> {
        let addr = self.allocate_inner(sig, size, align, false)?;
        self.scan_requested.set(true);
        Ok(addr)
    }

    fn allocate_inner(
        &self,
        sig: SigRef,
        size: usize,
        align: usize,
        wrapper_alive: bool,
    ) -> InteropResult<usize> {
        if size == 0 {
            return Err(InteropError::marshal(format!(
                "cannot create a native object of zero size ('{}')",
                sig
            )));
        }
        let layout = Layout::from_size_align(size, align.max(1))
            .map_err(|e| InteropError::marshal(format!("invalid native layout: {}", e)))?;
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        if ptr.is_null() {
            return Err(InteropError::fault(format!(
                "out of memory allocating {} bytes",
                size
            )));
        }
        let addr = ptr as usize;
        self.buffers.borrow_mut().insert(
            addr,
            NativeBuffer {
                ptr,
                layout,
                sig,
                wrapper_alive,
                referenced: true,
            },
        );
        self.update_stats(|s| {
            s.live_buffers += 1;
            s.live_bytes += size;
            s.total_allocated += size;
        });
        log::trace!("native heap: allocated {} bytes at {:#x}", size, addr);
        Ok(addr)
    }

    /// Called when the wrapper owning `addr` is finalized.
    pub fn orphan(&self, addr: usize) {
        if let Some(buf) = self.buffers.borrow_mut().get_mut(&addr) {
            buf.wrapper_alive = false;
            self.scan_requested.set(true);
        }
    }

    /// Base address and offset of the tracked buffer containing `addr`.
    pub fn find_containing(&self, addr: usize) -> Option<(usize, usize)> {
        let buffers = self.buffers.borrow();
        let (&base, buf) = buffers.range(..=addr).next_back()?;
        if addr < base + buf.size() {
            Some((base, addr - base))
        } else {
            None
        }
    }

    /// Whether `addr` lies inside any tracked buffer.
    pub fn contains(&self, addr: usize) -> bool {
        self.find_containing(addr).is_some()
    }

    /// Check that `size` bytes at `addr` stay inside the tracked buffer
    /// holding `addr`. `Ok(false)` means the address is not host-owned and
    /// has to be probed instead.
    pub fn check_span(&self, addr: usize, size: usize) -> InteropResult<bool> {
        let Some((base, offset)) = self.find_containing(addr) else {
            return Ok(false);
        };
        let buffers = self.buffers.borrow();
        let capacity = buffers.get(&base).map_or(0, |b| b.size());
        match offset.checked_add(size) {
            Some(end) if end <= capacity => Ok(true),
            _ => Err(InteropError::fault(format!(
                "access of {} bytes at offset {} overruns the {}-byte native object at {:#x}",
                size, offset, capacity, base
            ))),
        }
    }

    pub fn is_orphaned(&self, addr: usize) -> Option<bool> {
        self.buffers.borrow().get(&addr).map(|b| b.is_orphaned())
    }

    /// Register a pointer wrapper as a root if it points into a tracked
    /// buffer.
    pub fn register_root(&self, addr: usize) -> Option<u64> {
        self.find_containing(addr)?;
        let id = self.next_root.get();
        self.next_root.set(id + 1);
        self.roots.borrow_mut().insert(id, addr);
        Some(id)
    }

    pub fn unregister_root(&self, id: u64) {
        if self.roots.borrow_mut().remove(&id).is_some() {
            self.scan_requested.set(true);
        }
    }

    pub fn scan_requested(&self) -> bool {
        self.scan_requested.get()
    }

    /// Clear and return the pending-scan flag (debounce).
    pub fn take_scan_request(&self) -> bool {
        self.scan_requested.replace(false)
    }

    pub fn stats(&self) -> HeapStats {
        self.stats.get()
    }

    fn update_stats(&self, f: impl FnOnce(&mut HeapStats)) {
        let mut stats = self.stats.get();
        f(&mut stats);
        self.stats.set(stats);
    }

    // =========================================================================
    // Lifecycle scan
    // =========================================================================

    /// Mark from every buffer with a live wrapper (and every live pointer
    /// wrapper), following declared pointer fields, then free whatever
    /// orphaned buffer was not reached.
    pub fn collect(&self, types: &TypeRegistry) -> ScanReport {
        let mut report = ScanReport::default();
        let mut worklist = Vec::new();

        {
            let mut buffers = self.buffers.borrow_mut();
            for (&base, buf) in buffers.iter_mut() {
                buf.referenced = buf.wrapper_alive;
                if buf.wrapper_alive {
                    worklist.push(base);
                }
            }
        }
        let pointer_roots: Vec<usize> = self.roots.borrow().values().copied().collect();
        for addr in pointer_roots {
            if let Some((base, _)) = self.find_containing(addr) {
                if self.mark(base) {
                    worklist.push(base);
                }
            }
        }
        report.roots = worklist.len();

        while let Some(base) = worklist.pop() {
            report.reached += 1;
            let (ptr, size, sig) = {
                let buffers = self.buffers.borrow();
                let Some(buf) = buffers.get(&base) else { continue };
                (buf.ptr, buf.size(), buf.sig.clone())
            };
            let mut offsets = Vec::new();
            if let Err(e) = pointer_offsets(&sig, types, 0, size, &mut offsets) {
                log::warn!("lifecycle scan: cannot walk '{}': {}", sig, e);
                continue;
            }
            for offset in offsets {
                if offset + POINTER_SIZE > size {
                    continue;
                }
                // Safety: offset is inside our own allocation.
                let target = unsafe { std::ptr::read_unaligned(ptr.add(offset) as *const usize) };
                if target == 0 {
                    continue;
                }
                if let Some((target_base, _)) = self.find_containing(target) {
                    if self.mark(target_base) {
                        worklist.push(target_base);
                    }
                }
            }
        }

        let dead: Vec<NativeBuffer> = {
            let mut buffers = self.buffers.borrow_mut();
            let doomed: Vec<usize> = buffers
                .iter()
                .filter(|(_, b)| !b.referenced)
                .map(|(&base, _)| base)
                .collect();
            doomed.iter().filter_map(|base| buffers.remove(base)).collect()
        };
        for buf in dead {
            report.freed += 1;
            report.freed_bytes += buf.size();
            log::trace!("native heap: freeing {} bytes at {:p}", buf.size(), buf.ptr);
            unsafe { alloc::dealloc(buf.ptr, buf.layout) };
        }

        self.update_stats(|s| {
            s.live_buffers -= report.freed;
            s.live_bytes -= report.freed_bytes;
            s.total_freed += report.freed_bytes;
            s.scans += 1;
        });
        log::debug!(
            "lifecycle scan: {} roots, {} reached, {} freed ({} bytes)",
            report.roots,
            report.reached,
            report.freed,
            report.freed_bytes
        );
        report
    }

    /// Mark a buffer; returns true the first time.
    fn mark(&self, base: usize) -> bool {
        match self.buffers.borrow_mut().get_mut(&base) {
            Some(buf) if !buf.referenced => {
                buf.referenced = true;
                true
            }
            _ => false,
        }
    }
}

impl Drop for NativeHeap {
    fn drop(&mut self) {
        let buffers = std::mem::take(self.buffers.get_mut());
        if !buffers.is_empty() {
            log::debug!("native heap: releasing {} buffers at shutdown", buffers.len());
        }
        for (_, buf) in buffers {
            unsafe { alloc::dealloc(buf.ptr, buf.layout) };
        }
    }
}

/// Offsets of every declared pointer-typed location in a value of `sig`
/// starting at `base`. `avail` bounds variable-length arrays.
fn pointer_offsets(
    sig: &TypeSig,
    types: &TypeRegistry,
    base: usize,
    avail: usize,
    out: &mut Vec<usize>,
) -> InteropResult<()> {
    let sig = types.resolve(sig)?;
    match &sig.kind {
        SigKind::Pointer(_) | SigKind::Reference(_) | SigKind::String(_) => out.push(base),
        SigKind::Array { len, elem } => {
            if !contains_pointers(elem, types, 0)? {
                return Ok(());
            }
            let layout = compute_array_layout(elem, types)?;
            let count = len.unwrap_or(avail / layout.element_size);
            for i in 0..count {
                pointer_offsets(elem, types, base + layout.element_offset(i), layout.element_size, out)?;
            }
        }
        SigKind::Struct(_) | SigKind::Union(_) => {
            let layout = compound_layout(&sig, types)?;
            for field in &layout.fields {
                pointer_offsets(&field.ty, types, base + field.offset, field.size, out)?;
            }
        }
        SigKind::Prim(_) | SigKind::Function(_) | SigKind::Named(_) => {}
    }
    Ok(())
}

fn contains_pointers(sig: &TypeSig, types: &TypeRegistry, depth: usize) -> InteropResult<bool> {
    if depth > 64 {
        return Ok(false);
    }
    let sig = types.resolve(sig)?;
    Ok(match &sig.kind {
        SigKind::Pointer(_) | SigKind::Reference(_) | SigKind::String(_) => true,
        SigKind::Array { elem, .. } => contains_pointers(elem, types, depth + 1)?,
        SigKind::Struct(fields) | SigKind::Union(fields) => {
            let mut any = false;
            for f in fields {
                if contains_pointers(&f.ty, types, depth + 1)? {
                    any = true;
                    break;
                }
            }
            any
        }
        _ => false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::parse_signature;
    use std::rc::Rc;

    fn sig(text: &str) -> SigRef {
        Rc::new(parse_signature(text).unwrap())
    }

    fn write_ptr(at: usize, value: usize) {
        unsafe { std::ptr::write_unaligned(at as *mut usize, value) };
    }

    #[test]
    fn test_allocate_is_zeroed_and_tracked() {
        let heap = NativeHeap::new();
        let addr = heap.allocate(sig("[16]C"), 16, 1).unwrap();
        let bytes = unsafe { std::slice::from_raw_parts(addr as *const u8, 16) };
        assert!(bytes.iter().all(|&b| b == 0));
        assert_eq!(heap.find_containing(addr + 5), Some((addr, 5)));
        assert_eq!(heap.find_containing(addr + 16), None);
        assert_eq!(heap.stats().live_buffers, 1);
    }

    #[test]
    fn test_zero_size_rejected() {
        let heap = NativeHeap::new();
        assert!(heap.allocate(sig("[]i"), 0, 4).is_err());
    }

    #[test]
    fn test_orphan_requests_scan() {
        let heap = NativeHeap::new();
        let addr = heap.allocate(sig("i"), 4, 4).unwrap();
        assert!(!heap.scan_requested());
        heap.orphan(addr);
        assert!(heap.take_scan_request());
        assert!(!heap.scan_requested());
        assert_eq!(heap.is_orphaned(addr), Some(true));
    }

    #[test]
    fn test_scan_keeps_referenced_orphans() {
        let types = TypeRegistry::new();
        let heap = NativeHeap::new();
        let a = heap.allocate(sig("{S value:i next:*i}"), 2 * POINTER_SIZE, POINTER_SIZE).unwrap();
        let b = heap.allocate(sig("i"), 4, 4).unwrap();
        write_ptr(a + POINTER_SIZE, b);

        heap.orphan(b);
        let report = heap.collect(&types);
        assert_eq!(report.freed, 0);
        assert!(heap.contains(b));

        heap.orphan(a);
        let report = heap.collect(&types);
        assert_eq!(report.freed, 2);
        assert!(!heap.contains(a));
        assert!(!heap.contains(b));
        assert_eq!(heap.stats().live_buffers, 0);
    }

    #[test]
    fn test_scan_ignores_non_pointer_fields() {
        let types = TypeRegistry::new();
        let heap = NativeHeap::new();
        // An integer field that happens to hold a tracked address.
        let a = heap.allocate(sig("{S n:P}"), POINTER_SIZE, POINTER_SIZE).unwrap();
        let b = heap.allocate(sig("i"), 4, 4).unwrap();
        write_ptr(a, b);
        heap.orphan(b);
        assert_eq!(heap.collect(&types).freed, 1);
        assert!(!heap.contains(b));
    }

    #[test]
    fn test_interior_pointers_and_cycles() {
        let types = TypeRegistry::new();
        let heap = NativeHeap::new();
        let s = sig("{S a:i b:i next:*v}");
        let size = 2 * POINTER_SIZE.max(4) + POINTER_SIZE;
        let a = heap.allocate(s.clone(), size, POINTER_SIZE).unwrap();
        let b = heap.allocate(s, size, POINTER_SIZE).unwrap();
        let next = 8;
        // a -> interior of b, b -> a
        write_ptr(a + next, b + 4);
        write_ptr(b + next, a);
        heap.orphan(b);
        assert_eq!(heap.collect(&types).freed, 0);
        heap.orphan(a);
        assert_eq!(heap.collect(&types).freed, 2);
    }

    #[test]
    fn test_pointer_roots() {
        let types = TypeRegistry::new();
        let heap = NativeHeap::new();
        let a = heap.allocate(sig("[4]i"), 16, 4).unwrap();
        let root = heap.register_root(a + 8).unwrap();
        heap.orphan(a);
        assert_eq!(heap.collect(&types).freed, 0);
        heap.unregister_root(root);
        assert_eq!(heap.collect(&types).freed, 1);
        assert!(heap.register_root(0x10).is_none());
    }

    #[test]
    fn test_detached_buffers_need_a_referrer() {
        let types = TypeRegistry::new();
        let heap = NativeHeap::new();
        let d = heap.allocate_detached(sig("[6]c"), 6, 1).unwrap();
        assert!(heap.take_scan_request());
        assert_eq!(heap.collect(&types).freed, 1);
        assert!(!heap.contains(d));
    }
}
