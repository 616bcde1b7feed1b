//! The script-facing binding surface.
//!
//! [`Interop`] owns every piece of process-wide interop state (type
//! registry, native heap, library table, call arenas, callback code pool)
//! and exposes the operations script code performs: binding and calling
//! native functions, creating and inspecting native objects, and working
//! with native pointers.
//!
//! All state lives on one thread. `RefCell` borrows are released before
//! control transfers to native code, because native code may call back into
//! script, which may use this object again.

use std::cell::{Cell, Ref, RefCell};
use std::rc::{Rc, Weak};
use std::time::Duration;

use crate::backend::invoke::CallPlan;
use crate::backend::layout::{compound_layout, compute_array_layout, type_layout};
use crate::backend::thunk::CodePool;
use crate::error::{InteropError, InteropResult};
use crate::marshal::to_native::MAX_SAFE_INTEGER;
use crate::marshal::{ArenaStack, CallbackFactory, FromNative, TempAlloc, ToNative, read_c_string};
use crate::runtime::callback::CallbackThunk;
use crate::runtime::heap::{HeapStats, NativeHeap, ScanReport};
use crate::runtime::library::LibraryTable;
use crate::runtime::native::{NativeFunction, NativeObject, NativePointer};
use crate::runtime::probe;
use crate::runtime::value::{ScriptFunction, ScriptValue};
use crate::types::{FunctionSig, Prim, SigKind, SigRef, StringKind, TypeRegistry, TypeSig};

#[derive(Debug, Clone)]
pub struct InteropConfig {
    /// Debounce between an orphaned wrapper and the lifecycle scan.
    pub scan_delay: Duration,
    /// Size of each executable page in the callback code pool.
    pub code_page_size: usize,
    /// Longest string (in code units) read from or written to native memory.
    pub max_string_len: usize,
}

impl Default for InteropConfig {
    fn default() -> Self {
        Self {
            scan_delay: Duration::from_millis(50),
            code_page_size: 4096,
            max_string_len: 1 << 20,
        }
    }
}

/// Code pool occupancy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CodePoolStats {
    pub pages: usize,
    pub live_slots: usize,
    pub free_slots: usize,
}

pub struct InteropState {
    config: InteropConfig,
    types: RefCell<TypeRegistry>,
    heap: Rc<NativeHeap>,
    libraries: RefCell<LibraryTable>,
    arenas: ArenaStack,
    code_pool: Rc<RefCell<CodePool>>,
    /// Error raised by a callback, rethrown when the native call returns.
    pending: RefCell<Option<InteropError>>,
    /// Functions that ran as callbacks during the current native call.
    deferred_drops: RefCell<Vec<ScriptFunction>>,
    call_depth: Cell<usize>,
    self_ref: Weak<InteropState>,
}

impl InteropState {
    pub fn config(&self) -> &InteropConfig {
        &self.config
    }

    pub fn types(&self) -> Ref<'_, TypeRegistry> {
        self.types.borrow()
    }

    pub fn heap(&self) -> &Rc<NativeHeap> {
        &self.heap
    }

    pub fn arenas(&self) -> &ArenaStack {
        &self.arenas
    }

    pub(crate) fn code_pool(&self) -> &Rc<RefCell<CodePool>> {
        &self.code_pool
    }

    pub(crate) fn set_pending(&self, err: InteropError) {
        let mut pending = self.pending.borrow_mut();
        // The first error wins; later callbacks are skipped anyway.
        if pending.is_none() {
            *pending = Some(err);
        }
    }

    pub(crate) fn has_pending(&self) -> bool {
        self.pending.borrow().is_some()
    }

    pub(crate) fn defer_drop(&self, func: ScriptFunction) {
        self.deferred_drops.borrow_mut().push(func);
    }

    /// Count a callback as a native frame. Returns true when no call made
    /// from script is in progress, i.e. native code fired a stored callback
    /// on its own.
    pub(crate) fn enter_callback(&self) -> bool {
        let depth = self.call_depth.get();
        self.call_depth.set(depth + 1);
        depth == 0
    }

    pub(crate) fn leave_callback(&self) {
        self.call_depth.set(self.call_depth.get().saturating_sub(1));
    }

    /// Drop functions kept alive for callbacks that have returned.
    pub(crate) fn release_deferred(&self) {
        let finished = std::mem::take(&mut *self.deferred_drops.borrow_mut());
        drop(finished);
    }
}

impl CallbackFactory for InteropState {
    fn callback_address(&self, func: &ScriptFunction, sig: &TypeSig) -> InteropResult<usize> {
        let key = sig.to_string();
        if let Some(addr) = func.find_thunk(&key) {
            return Ok(addr);
        }
        let state = self
            .self_ref
            .upgrade()
            .ok_or_else(|| InteropError::fault("interop state is shutting down"))?;
        let thunk = CallbackThunk::create(func, Rc::new(sig.clone()), &state)?;
        let addr = thunk.code_address();
        func.attach_thunk(thunk);
        Ok(addr)
    }
}

/// Handle to the interop layer. Clones share state.
#[derive(Clone)]
pub struct Interop {
    state: Rc<InteropState>,
}

impl Default for Interop {
    fn default() -> Self {
        Self::new(InteropConfig::default())
    }
}

impl Interop {
    pub fn new(config: InteropConfig) -> Self {
        let page_size = config.code_page_size;
        let state = Rc::new_cyclic(|self_ref| InteropState {
            config,
            types: RefCell::new(TypeRegistry::new()),
            heap: Rc::new(NativeHeap::new()),
            libraries: RefCell::new(LibraryTable::new()),
            arenas: ArenaStack::new(),
            code_pool: Rc::new(RefCell::new(CodePool::new(page_size))),
            pending: RefCell::new(None),
            deferred_drops: RefCell::new(Vec::new()),
            call_depth: Cell::new(0),
            self_ref: self_ref.clone(),
        });
        Self { state }
    }

    pub fn state(&self) -> &InteropState {
        &self.state
    }

    pub fn config(&self) -> &InteropConfig {
        &self.state.config
    }

    // ========================================================================
    // Types
    // ========================================================================

    pub fn define_type(&self, name: &str, signature: &str) -> InteropResult<()> {
        self.state.types.borrow_mut().define(name, signature)?;
        Ok(())
    }

    pub fn parse(&self, signature: &str) -> InteropResult<SigRef> {
        self.state.types.borrow_mut().parse(signature)
    }

    pub fn sizeof(&self, signature: &str) -> InteropResult<usize> {
        let sig = self.parse(signature)?;
        Ok(type_layout(&sig, &self.state.types())?.size)
    }

    // ========================================================================
    // Functions
    // ========================================================================

    /// Resolve `symbol` in `library`.
    pub fn bind(&self, library: &str, symbol: &str) -> InteropResult<ScriptValue> {
        let func = self.state.libraries.borrow_mut().bind(library, symbol)?;
        Ok(ScriptValue::NativeFunction(func))
    }

    /// Wrap a raw entry point with its function signature.
    pub fn bind_address(&self, addr: usize, signature: &str) -> InteropResult<ScriptValue> {
        let sig = self.parse(signature)?;
        let fsig = function_sig(&sig, &self.state.types())?;
        let sig = Rc::new(TypeSig::new(SigKind::Function(fsig)));
        Ok(ScriptValue::NativeFunction(NativeFunction::from_pointer(addr, sig)))
    }

    /// Call `func` as `signature` with `args`.
    pub fn call(
        &self,
        func: &ScriptValue,
        signature: &str,
        args: &[ScriptValue],
    ) -> InteropResult<ScriptValue> {
        let addr = function_address(func)?;
        let sig = self.parse(signature)?;
        let fsig = function_sig(&sig, &self.state.types())?;
        self.call_address(addr, &fsig, args)
    }

    /// Call a function value that carries its own signature.
    pub fn invoke(&self, func: &ScriptValue, args: &[ScriptValue]) -> InteropResult<ScriptValue> {
        let addr = function_address(func)?;
        let sig = match func {
            ScriptValue::NativeFunction(f) => f.signature().cloned(),
            ScriptValue::Pointer(p) => Some(p.target().clone()),
            _ => None,
        }
        .ok_or_else(|| {
            InteropError::marshal(format!(
                "{} has no declared signature; use call()",
                func.type_name()
            ))
        })?;
        let fsig = function_sig(&sig, &self.state.types())?;
        self.call_address(addr, &fsig, args)
    }

    fn call_address(
        &self,
        addr: usize,
        fsig: &FunctionSig,
        args: &[ScriptValue],
    ) -> InteropResult<ScriptValue> {
        let state = &self.state;
        if addr == 0 {
            return Err(InteropError::fault("call through a null function pointer"));
        }
        probe::check_readable(addr, 1)?;
        let plan = CallPlan::new(fsig, &state.types())?;

        let _arena = state.arenas.enter();
        let packed = {
            let types = state.types();
            let mut marshaller = ToNative::new(&types, TempAlloc::Arena(&state.arenas), &**state)
                .with_max_string_len(state.config.max_string_len);
            plan.pack(args, &mut marshaller, &state.heap)?
        };

        state.call_depth.set(state.call_depth.get() + 1);
        // Safety: the caller vouched for the signature; every pointer in
        // `packed` lives in the arena or the heap until this call returns.
        let raw = unsafe { plan.call(addr, &packed) };
        state.call_depth.set(state.call_depth.get() - 1);

        let pending = state.pending.borrow_mut().take();
        if state.call_depth.get() == 0 {
            state.release_deferred();
        }
        if let Some(err) = pending {
            return Err(err);
        }
        let raw = raw?;

        let types = state.types();
        let reader =
            FromNative::new(&types, &state.heap, &state.arenas).with_max_string_len(state.config.max_string_len);
        plan.decode(raw, packed, &reader, &types)
    }

    // ========================================================================
    // Native objects
    // ========================================================================

    /// Allocate a zeroed, host-owned object of type `signature`.
    pub fn create(&self, signature: &str) -> InteropResult<ScriptValue> {
        let sig = self.parse(signature)?;
        let layout = type_layout(&sig, &self.state.types())?;
        if layout.size == 0 {
            return Err(InteropError::marshal(format!(
                "cannot create zero-sized '{}'; variable arrays need an initializer",
                sig
            )));
        }
        let addr = self.state.heap.allocate(sig.clone(), layout.size, layout.align)?;
        log::debug!("created native '{}' ({} bytes) at {:#x}", sig, layout.size, addr);
        Ok(ScriptValue::NativeObject(NativeObject::host(
            addr,
            layout.size,
            sig,
            &self.state.heap,
        )))
    }

    /// Allocate an object of type `signature` initialised from `init`.
    /// Variable arrays take their length from the initializer.
    pub fn create_with(&self, signature: &str, init: &ScriptValue) -> InteropResult<ScriptValue> {
        let sig = self.parse(signature)?;
        let state = &self.state;
        let types = state.types();
        let mut writer = ToNative::new(&types, TempAlloc::Heap(&state.heap), &**state)
            .with_max_string_len(state.config.max_string_len);
        let resolved = types.resolve(&sig)?;
        let layout = writer.sized_layout(&resolved, init)?;
        let sig: SigRef = match &resolved.kind {
            SigKind::Array { len: None, elem } => {
                let count = layout.size / compute_array_layout(elem, &types)?.element_size.max(1);
                Rc::new(TypeSig::new(SigKind::Array {
                    len: Some(count),
                    elem: elem.clone(),
                }))
            }
            _ => sig.clone(),
        };
        let addr = state.heap.allocate(sig.clone(), layout.size, layout.align)?;
        let obj = NativeObject::host(addr, layout.size, sig.clone(), &state.heap);
        writer.write(&sig, init, addr)?;
        Ok(ScriptValue::NativeObject(obj))
    }

    /// Pointer to a native object's storage.
    pub fn address_of(&self, obj: &ScriptValue) -> InteropResult<ScriptValue> {
        let obj = native_object(obj)?;
        Ok(ScriptValue::Pointer(NativePointer::new(
            obj.address(),
            obj.sig().clone(),
            &self.state.heap,
        )))
    }

    /// Current contents of a native object. Aggregates come back as plain
    /// script objects and arrays.
    pub fn value_of(&self, obj: &ScriptValue) -> InteropResult<ScriptValue> {
        let obj = native_object(obj)?;
        self.check_access(obj, obj.address(), obj.size(), false)?;
        let types = self.state.types();
        let reader = self.reader(&types);
        snapshot(&reader, &types, obj.sig(), obj.address(), obj.size())
    }

    /// Overwrite a native object with `value`.
    pub fn set_value(&self, obj: &ScriptValue, value: &ScriptValue) -> InteropResult<()> {
        let obj = native_object(obj)?;
        self.write_member(obj, obj.sig(), 0, obj.size(), value)
    }

    pub fn get_field(&self, obj: &ScriptValue, name: &str) -> InteropResult<ScriptValue> {
        let obj = native_object(obj)?;
        let (sig, offset, size) = field_of(&self.state.types(), obj.sig(), name)?;
        self.read_member(obj, &sig, offset, size)
    }

    pub fn set_field(&self, obj: &ScriptValue, name: &str, value: &ScriptValue) -> InteropResult<()> {
        let obj = native_object(obj)?;
        let (sig, offset, size) = field_of(&self.state.types(), obj.sig(), name)?;
        self.write_member(obj, &sig, offset, size, value)
    }

    pub fn length(&self, obj: &ScriptValue) -> InteropResult<usize> {
        let obj = native_object(obj)?;
        let types = self.state.types();
        let (_, len, _) = array_shape(&types, obj)?;
        Ok(len)
    }

    pub fn get_index(&self, obj: &ScriptValue, index: usize) -> InteropResult<ScriptValue> {
        let obj = native_object(obj)?;
        let (sig, offset, size) = element_of(&self.state.types(), obj, index)?;
        self.read_member(obj, &sig, offset, size)
    }

    pub fn set_index(&self, obj: &ScriptValue, index: usize, value: &ScriptValue) -> InteropResult<()> {
        let obj = native_object(obj)?;
        let (sig, offset, size) = element_of(&self.state.types(), obj, index)?;
        self.write_member(obj, &sig, offset, size, value)
    }

    fn read_member(
        &self,
        obj: &Rc<NativeObject>,
        sig: &TypeSig,
        offset: usize,
        size: usize,
    ) -> InteropResult<ScriptValue> {
        let types = self.state.types();
        if types.resolve(sig)?.is_aggregate() {
            return Ok(ScriptValue::NativeObject(NativeObject::view(
                obj,
                offset,
                size,
                Rc::new(sig.clone()),
            )));
        }
        self.check_access(obj, obj.address() + offset, size, false)?;
        self.reader(&types).read(sig, obj.address() + offset)
    }

    fn write_member(
        &self,
        obj: &Rc<NativeObject>,
        sig: &TypeSig,
        offset: usize,
        size: usize,
        value: &ScriptValue,
    ) -> InteropResult<()> {
        let state = &self.state;
        let dst = obj.address() + offset;
        self.check_access(obj, dst, size, true)?;
        let temps = if obj.is_host_owned() {
            TempAlloc::Heap(&state.heap)
        } else {
            TempAlloc::Retained(&state.heap)
        };
        let types = state.types();
        ToNative::new(&types, temps, &**state)
            .with_max_string_len(state.config.max_string_len)
            .write(sig, value, dst)
    }

    /// Host-owned memory is known good; anything else is probed first.
    fn check_access(&self, obj: &NativeObject, addr: usize, len: usize, write: bool) -> InteropResult<()> {
        if obj.is_host_owned() || self.state.heap.check_span(addr, len)? {
            return Ok(());
        }
        if write {
            probe::check_writable(addr, len)
        } else {
            probe::check_readable(addr, len)
        }
    }

    fn reader<'a>(&'a self, types: &'a TypeRegistry) -> FromNative<'a> {
        FromNative::new(types, &self.state.heap, &self.state.arenas)
            .with_max_string_len(self.state.config.max_string_len)
    }

    // ========================================================================
    // Pointers
    // ========================================================================

    pub fn is_null(&self, ptr: &ScriptValue) -> InteropResult<bool> {
        Ok(pointer_address(ptr)? == 0)
    }

    /// Address as a script number; fails if it cannot be represented exactly.
    pub fn pointer_to_number(&self, ptr: &ScriptValue) -> InteropResult<f64> {
        let addr = pointer_address(ptr)?;
        if addr as f64 > MAX_SAFE_INTEGER {
            return Err(InteropError::marshal(format!(
                "address {:#x} does not fit a number; use to_uint64",
                addr
            )));
        }
        Ok(addr as f64)
    }

    pub fn pointer_to_uint64(&self, ptr: &ScriptValue) -> InteropResult<ScriptValue> {
        Ok(ScriptValue::UInt64(pointer_address(ptr)? as u64))
    }

    /// Dereference. Aggregate targets come back as views pinned by the
    /// pointer.
    pub fn pointer_at(&self, ptr: &ScriptValue) -> InteropResult<ScriptValue> {
        let p = native_pointer(ptr)?;
        if p.is_null() {
            return Err(InteropError::fault("dereference of a null pointer"));
        }
        let types = self.state.types();
        let target = types.resolve(p.target())?;
        if target.is_void() {
            return Err(InteropError::marshal("cannot dereference a void pointer"));
        }
        let layout = type_layout(&target, &types)?;
        if !self.state.heap.check_span(p.address(), layout.size.max(1))? {
            probe::check_readable(p.address(), layout.size.max(1))?;
        }
        if target.is_aggregate() {
            return Ok(ScriptValue::NativeObject(NativeObject::pinned(
                p,
                layout.size,
                p.target().clone(),
            )));
        }
        self.reader(&types).read(&target, p.address())
    }

    /// Store `value` through the pointer.
    pub fn pointer_store(&self, ptr: &ScriptValue, value: &ScriptValue) -> InteropResult<()> {
        let p = native_pointer(ptr)?;
        if p.is_null() {
            return Err(InteropError::fault("store through a null pointer"));
        }
        let state = &self.state;
        let types = state.types();
        let target = types.resolve(p.target())?;
        // A variable-length target is as long as the value stored into it.
        let size = match target.kind {
            SigKind::Array { len: None, .. } => {
                ToNative::new(&types, TempAlloc::None, &**state).sized_layout(&target, value)?.size
            }
            _ => type_layout(&target, &types)?.size,
        };
        let host = state.heap.check_span(p.address(), size.max(1))?;
        if !host {
            probe::check_writable(p.address(), size.max(1))?;
        }
        let temps = if host {
            TempAlloc::Heap(&state.heap)
        } else {
            TempAlloc::Retained(&state.heap)
        };
        ToNative::new(&types, temps, &**state)
            .with_max_string_len(state.config.max_string_len)
            .write(p.target(), value, p.address())
    }

    /// Read a NUL-terminated string at the pointer. 16-bit targets read as
    /// UTF-16, everything else as bytes.
    pub fn pointer_to_string(&self, ptr: &ScriptValue) -> InteropResult<ScriptValue> {
        let p = native_pointer(ptr)?;
        if p.is_null() {
            return Ok(ScriptValue::Null);
        }
        let kind = match self.state.types().resolve(p.target())?.kind {
            SigKind::Prim(Prim::I16 | Prim::U16) => StringKind::Wide,
            _ => StringKind::Ansi,
        };
        let s = read_c_string(p.address(), kind, self.state.config.max_string_len)?;
        Ok(ScriptValue::string(&s))
    }

    /// View `len` consecutive targets starting at the pointer.
    pub fn pointer_to_array(&self, ptr: &ScriptValue, len: usize) -> InteropResult<ScriptValue> {
        let p = native_pointer(ptr)?;
        if p.is_null() {
            return Err(InteropError::fault("array view over a null pointer"));
        }
        let types = self.state.types();
        let elem = compute_array_layout(p.target(), &types)?;
        let size = elem.size_for_length(len)?;
        if size > 0 && !self.state.heap.check_span(p.address(), size)? {
            probe::check_readable(p.address(), size)?;
        }
        let sig = Rc::new(TypeSig::new(SigKind::Array {
            len: Some(len),
            elem: Box::new((**p.target()).clone()),
        }));
        Ok(ScriptValue::NativeObject(NativeObject::pinned(p, size, sig)))
    }

    /// Reinterpret the pointer. `signature` names either the new target
    /// type or a pointer type.
    pub fn pointer_cast(&self, ptr: &ScriptValue, signature: &str) -> InteropResult<ScriptValue> {
        let addr = pointer_address(ptr)?;
        let sig = self.parse(signature)?;
        let target = match &sig.kind {
            SigKind::Pointer(t) | SigKind::Reference(t) => Rc::new((**t).clone()),
            _ => sig.clone(),
        };
        if let Some(fsig) = target.as_function() {
            if addr == 0 {
                return Ok(ScriptValue::Null);
            }
            let sig = Rc::new(TypeSig::new(SigKind::Function(fsig.clone())));
            return Ok(ScriptValue::NativeFunction(NativeFunction::from_pointer(addr, sig)));
        }
        Ok(ScriptValue::Pointer(NativePointer::new(addr, target, &self.state.heap)))
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Run a lifecycle scan now.
    pub fn collect_garbage(&self) -> ScanReport {
        self.state.heap.collect(&self.state.types())
    }

    pub fn scan_requested(&self) -> bool {
        self.state.heap.scan_requested()
    }

    pub fn take_scan_request(&self) -> bool {
        self.state.heap.take_scan_request()
    }

    pub fn heap_stats(&self) -> HeapStats {
        self.state.heap.stats()
    }

    pub fn code_pool_stats(&self) -> CodePoolStats {
        let pool = self.state.code_pool.borrow();
        CodePoolStats {
            pages: pool.page_count(),
            live_slots: pool.live_slots(),
            free_slots: pool.free_slots(),
        }
    }

    pub fn is_loaded(&self, library: &str) -> bool {
        self.state.libraries.borrow().is_loaded(library)
    }
}

fn function_address(value: &ScriptValue) -> InteropResult<usize> {
    match value {
        ScriptValue::NativeFunction(f) => Ok(f.address()),
        ScriptValue::Pointer(p) => Ok(p.address()),
        ScriptValue::Handle(h) => Ok(*h),
        other => Err(InteropError::marshal(format!(
            "cannot call {} as a native function",
            other.type_name()
        ))),
    }
}

/// Accept `(..)` or `*(..)`.
fn function_sig(sig: &TypeSig, types: &TypeRegistry) -> InteropResult<FunctionSig> {
    let sig = types.resolve(sig)?;
    let target = match &sig.kind {
        SigKind::Pointer(t) => types.resolve(t)?.as_function().cloned(),
        _ => sig.as_function().cloned(),
    };
    target.ok_or_else(|| InteropError::marshal(format!("'{}' is not a function signature", *sig)))
}

fn native_object(value: &ScriptValue) -> InteropResult<&Rc<NativeObject>> {
    match value {
        ScriptValue::NativeObject(o) => Ok(o),
        other => Err(InteropError::marshal(format!(
            "expected a native object, got {}",
            other.type_name()
        ))),
    }
}

fn native_pointer(value: &ScriptValue) -> InteropResult<&Rc<NativePointer>> {
    match value {
        ScriptValue::Pointer(p) => Ok(p),
        other => Err(InteropError::marshal(format!(
            "expected a native pointer, got {}",
            other.type_name()
        ))),
    }
}

fn pointer_address(value: &ScriptValue) -> InteropResult<usize> {
    match value {
        ScriptValue::Pointer(p) => Ok(p.address()),
        ScriptValue::NativeFunction(f) => Ok(f.address()),
        ScriptValue::Null => Ok(0),
        other => Err(InteropError::marshal(format!(
            "expected a native pointer, got {}",
            other.type_name()
        ))),
    }
}

/// (type, offset, size) of a named struct or union member.
fn field_of(types: &TypeRegistry, sig: &TypeSig, name: &str) -> InteropResult<(TypeSig, usize, usize)> {
    let resolved = types.resolve(sig)?;
    if !matches!(resolved.kind, SigKind::Struct(_) | SigKind::Union(_)) {
        return Err(InteropError::marshal(format!(
            "'{}' has no fields",
            *resolved
        )));
    }
    let layout = compound_layout(&resolved, types)?;
    let field = layout.get_field(name).ok_or_else(|| {
        InteropError::marshal(format!("'{}' has no field '{}'", *resolved, name))
    })?;
    Ok((field.ty.clone(), field.offset, field.size))
}

/// (element type, length, element stride) of an array object.
fn array_shape(types: &TypeRegistry, obj: &NativeObject) -> InteropResult<(TypeSig, usize, usize)> {
    let resolved = types.resolve(obj.sig())?;
    let SigKind::Array { len, elem } = &resolved.kind else {
        return Err(InteropError::marshal(format!(
            "'{}' is not an array",
            *resolved
        )));
    };
    let layout = compute_array_layout(elem, types)?;
    let stride = layout.element_size;
    let len = match len {
        Some(n) => *n,
        None if stride == 0 => 0,
        None => obj.size() / stride,
    };
    Ok(((**elem).clone(), len, stride))
}

fn element_of(types: &TypeRegistry, obj: &NativeObject, index: usize) -> InteropResult<(TypeSig, usize, usize)> {
    let (elem, len, stride) = array_shape(types, obj)?;
    if index >= len {
        return Err(InteropError::marshal(format!(
            "index {} out of range for length {}",
            index, len
        )));
    }
    Ok((elem, index * stride, stride))
}

/// Deep read of an aggregate into plain script values.
fn snapshot(
    reader: &FromNative<'_>,
    types: &TypeRegistry,
    sig: &TypeSig,
    addr: usize,
    size: usize,
) -> InteropResult<ScriptValue> {
    let resolved = types.resolve(sig)?;
    match &resolved.kind {
        SigKind::Struct(_) | SigKind::Union(_) => {
            let layout = compound_layout(&resolved, types)?;
            let mut props = Vec::with_capacity(layout.fields.len());
            for (i, field) in layout.fields.iter().enumerate() {
                let key = field.name.clone().unwrap_or_else(|| i.to_string());
                let value = snapshot(reader, types, &field.ty, addr + field.offset, field.size)?;
                props.push((key, value));
            }
            Ok(ScriptValue::Object(crate::runtime::value::ScriptObject::new(props)))
        }
        SigKind::Array { len, elem } => {
            let layout = compute_array_layout(elem, types)?;
            let stride = layout.element_size;
            let count = match len {
                Some(n) => *n,
                None if stride == 0 => 0,
                None => size / stride,
            };
            let items = (0..count)
                .map(|i| snapshot(reader, types, elem, addr + i * stride, stride))
                .collect::<InteropResult<Vec<_>>>()?;
            Ok(ScriptValue::array(items))
        }
        _ => reader.read(&resolved, addr),
    }
}
