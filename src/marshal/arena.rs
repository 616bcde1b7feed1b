//! Per-call scratch memory.
//!
//! Every native call gets a fresh [`MarshalArena`] for the argument strings,
//! by-reference copies and struct-return areas it needs. Arenas are pushed on
//! an [`ArenaStack`] so a callback re-entering the invoker gets its own frame
//! while still being able to ask whether an address belongs to any enclosing
//! call. Dropping the guard releases the frame, on error paths too.

use std::cell::RefCell;

/// Arena block granularity; every allocation is 16-byte aligned.
const BLOCK_ALIGN: usize = std::mem::size_of::<u128>();

#[derive(Default)]
pub struct MarshalArena {
    blocks: Vec<Box<[u128]>>,
    bytes: usize,
}

impl MarshalArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Zeroed, 16-byte aligned block of at least `size` bytes.
    pub fn alloc(&mut self, size: usize) -> usize {
        let words = size.max(1).div_ceil(BLOCK_ALIGN);
        let block = vec![0u128; words].into_boxed_slice();
        let addr = block.as_ptr() as usize;
        self.bytes += words * BLOCK_ALIGN;
        self.blocks.push(block);
        addr
    }

    pub fn contains(&self, addr: usize) -> bool {
        self.remaining(addr).is_some()
    }

    /// Bytes from `addr` to the end of the block holding it.
    pub fn remaining(&self, addr: usize) -> Option<usize> {
        self.blocks.iter().find_map(|b| {
            let base = b.as_ptr() as usize;
            let end = base + b.len() * BLOCK_ALIGN;
            (addr >= base && addr < end).then(|| end - addr)
        })
    }

    pub fn allocated_bytes(&self) -> usize {
        self.bytes
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }
}

/// Stack of live call arenas, innermost last.
#[derive(Default)]
pub struct ArenaStack {
    frames: RefCell<Vec<MarshalArena>>,
}

impl ArenaStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a frame for one call.
    pub fn enter(&self) -> ArenaGuard<'_> {
        self.frames.borrow_mut().push(MarshalArena::new());
        ArenaGuard { stack: self }
    }

    /// Whether `addr` lies in scratch memory of the current call or any
    /// call enclosing it.
    pub fn is_local(&self, addr: usize) -> bool {
        self.frames.borrow().iter().any(|a| a.contains(addr))
    }

    /// Like `is_local`, returning how many bytes of the block remain.
    pub fn local_remaining(&self, addr: usize) -> Option<usize> {
        self.frames.borrow().iter().find_map(|a| a.remaining(addr))
    }

    pub fn depth(&self) -> usize {
        self.frames.borrow().len()
    }

    /// Run `f` with the innermost arena. The borrow must not be held across
    /// a native call.
    pub fn with_current<R>(&self, f: impl FnOnce(&mut MarshalArena) -> R) -> Option<R> {
        self.frames.borrow_mut().last_mut().map(f)
    }
}

pub struct ArenaGuard<'a> {
    stack: &'a ArenaStack,
}

impl Drop for ArenaGuard<'_> {
    fn drop(&mut self) {
        if let Some(arena) = self.stack.frames.borrow_mut().pop() {
            log::trace!(
                "released call arena: {} blocks, {} bytes",
                arena.block_count(),
                arena.allocated_bytes()
            );
        }
    }
}
