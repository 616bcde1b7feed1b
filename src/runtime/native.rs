//! Script-visible wrappers around native memory and code.
//!
//! - [`NativeObject`]: a typed view of a block of native memory. Host-owned
//!   blocks (from `create`) are tracked by the [`NativeHeap`]; dropping the
//!   last wrapper marks the block orphaned so the next lifecycle scan can
//!   decide whether to free it. Native-owned blocks are never freed here.
//! - [`NativePointer`]: an address plus the signature of what it points to.
//!   Pointers into host-owned blocks keep those blocks alive.
//! - [`NativeFunction`]: a callable entry point, either bound from a library
//!   or returned from native code as a function pointer.

use std::rc::{Rc, Weak};

use libloading::Library;

use crate::runtime::heap::NativeHeap;
use crate::types::SigRef;

/// Who is responsible for a wrapper's memory.
pub enum Storage {
    /// Allocated by the host on script's behalf; tracked by the heap.
    Host(Weak<NativeHeap>),
    /// Owned by native code; never freed by the host.
    External,
    /// A sub-range of another wrapper's storage.
    View(Rc<NativeObject>),
    /// Reached through a pointer, which pins any host block it points into.
    Pinned(Rc<NativePointer>),
}

pub struct NativeObject {
    addr: usize,
    size: usize,
    sig: SigRef,
    storage: Storage,
}

impl NativeObject {
    pub(crate) fn host(addr: usize, size: usize, sig: SigRef, heap: &Rc<NativeHeap>) -> Rc<Self> {
        Rc::new(Self {
            addr,
            size,
            sig,
            storage: Storage::Host(Rc::downgrade(heap)),
        })
    }

    pub(crate) fn external(addr: usize, size: usize, sig: SigRef) -> Rc<Self> {
        Rc::new(Self {
            addr,
            size,
            sig,
            storage: Storage::External,
        })
    }

    pub(crate) fn view(parent: &Rc<NativeObject>, offset: usize, size: usize, sig: SigRef) -> Rc<Self> {
        Rc::new(Self {
            addr: parent.addr + offset,
            size,
            sig,
            storage: Storage::View(parent.clone()),
        })
    }

    pub(crate) fn pinned(pointer: &Rc<NativePointer>, size: usize, sig: SigRef) -> Rc<Self> {
        Rc::new(Self {
            addr: pointer.address(),
            size,
            sig,
            storage: Storage::Pinned(pointer.clone()),
        })
    }

    pub fn address(&self) -> usize {
        self.addr
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn sig(&self) -> &SigRef {
        &self.sig
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// True when the memory was allocated by the host (directly or as the
    /// parent of this view).
    pub fn is_host_owned(&self) -> bool {
        match &self.storage {
            Storage::Host(_) => true,
            Storage::View(parent) => parent.is_host_owned(),
            Storage::External | Storage::Pinned(_) => false,
        }
    }
}

impl Drop for NativeObject {
    fn drop(&mut self) {
        if let Storage::Host(heap) = &self.storage {
            if let Some(heap) = heap.upgrade() {
                heap.orphan(self.addr);
            }
        }
    }
}

pub struct NativePointer {
    addr: usize,
    target: SigRef,
    root: Option<(Weak<NativeHeap>, u64)>,
}

impl NativePointer {
    /// Wrap `addr`. If it points into a host-owned block, that block is
    /// kept alive for as long as the pointer wrapper lives.
    pub(crate) fn new(addr: usize, target: SigRef, heap: &Rc<NativeHeap>) -> Rc<Self> {
        let root = heap
            .register_root(addr)
            .map(|id| (Rc::downgrade(heap), id));
        Rc::new(Self { addr, target, root })
    }

    pub fn address(&self) -> usize {
        self.addr
    }

    pub fn target(&self) -> &SigRef {
        &self.target
    }

    pub fn is_null(&self) -> bool {
        self.addr == 0
    }

    pub fn is_root(&self) -> bool {
        self.root.is_some()
    }
}

impl Drop for NativePointer {
    fn drop(&mut self) {
        if let Some((heap, id)) = &self.root {
            if let Some(heap) = heap.upgrade() {
                heap.unregister_root(*id);
            }
        }
    }
}

pub struct NativeFunction {
    addr: usize,
    library_name: String,
    symbol: String,
    /// Keeps the library mapped while the handle lives.
    _library: Option<Rc<Library>>,
    /// Declared signature for function pointers returned from native code.
    sig: Option<SigRef>,
}

impl NativeFunction {
    pub(crate) fn bound(addr: usize, library: Rc<Library>, library_name: &str, symbol: &str) -> Rc<Self> {
        Rc::new(Self {
            addr,
            library_name: library_name.to_string(),
            symbol: symbol.to_string(),
            _library: Some(library),
            sig: None,
        })
    }

    pub(crate) fn from_pointer(addr: usize, sig: SigRef) -> Rc<Self> {
        Rc::new(Self {
            addr,
            library_name: String::new(),
            symbol: format!("{:#x}", addr),
            _library: None,
            sig: Some(sig),
        })
    }

    pub fn address(&self) -> usize {
        self.addr
    }

    pub fn library_name(&self) -> &str {
        &self.library_name
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn signature(&self) -> Option<&SigRef> {
        self.sig.as_ref()
    }
}
