//! Script-to-native marshalling.
//!
//! [`ToNative`] walks a signature and a script value together and writes the
//! native byte image of the value to a destination address: an argument
//! slot, a struct field, or a fresh temporary block for by-reference data.
//! Temporary memory comes from the current call's arena, or from the native
//! heap when the result has to outlive the call (field stores on host-owned
//! objects).
//!
//! Objects and arrays reached through pointers are recorded in a per-call
//! identity map before their contents are written, so a value that refers
//! back to itself is stored once and every pointer to it shares the block.

use std::collections::HashMap;
use std::rc::Rc;

use crate::backend::layout::{TypeLayout, compound_layout, compute_array_layout, type_layout};
use crate::error::{InteropError, InteropResult};
use crate::marshal::arena::ArenaStack;
use crate::marshal::sizer::{ArgPassing, ArgSlot};
use crate::runtime::heap::NativeHeap;
use crate::runtime::value::{ScriptFunction, ScriptValue};
use crate::types::{POINTER_SIZE, Prim, SigKind, StringKind, TypeRegistry, TypeSig};

/// Largest integer a script number holds exactly (2^53 - 1).
pub const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_991.0;

/// Turns a script function into a native code address.
pub trait CallbackFactory {
    /// `sig` is the (resolved) function type the pointer is declared with.
    fn callback_address(&self, func: &ScriptFunction, sig: &TypeSig) -> InteropResult<usize>;
}

/// Refuses every callback; for contexts where none can be created.
pub struct NoCallbacks;

impl CallbackFactory for NoCallbacks {
    fn callback_address(&self, func: &ScriptFunction, _sig: &TypeSig) -> InteropResult<usize> {
        Err(InteropError::marshal(format!(
            "cannot convert function '{}' to a native callback here",
            func.name()
        )))
    }
}

/// Where temporary buffers come from.
pub enum TempAlloc<'a> {
    /// Freed when the current native call returns.
    Arena(&'a ArenaStack),
    /// Detached heap buffers kept alive by whatever points at them.
    Heap(&'a Rc<NativeHeap>),
    /// Heap buffers that are never orphaned, for stores into native-owned
    /// memory the lifecycle scan cannot see.
    Retained(&'a Rc<NativeHeap>),
    /// Temporaries are not allowed (callback return values).
    None,
}

pub struct ToNative<'a> {
    types: &'a TypeRegistry,
    temps: TempAlloc<'a>,
    callbacks: &'a dyn CallbackFactory,
    /// Script object identity -> native block already written for it.
    by_ref: HashMap<usize, usize>,
    max_string_len: usize,
}

impl<'a> ToNative<'a> {
    pub fn new(
        types: &'a TypeRegistry,
        temps: TempAlloc<'a>,
        callbacks: &'a dyn CallbackFactory,
    ) -> Self {
        Self {
            types,
            temps,
            callbacks,
            by_ref: HashMap::new(),
            max_string_len: usize::MAX,
        }
    }

    pub fn with_max_string_len(mut self, max: usize) -> Self {
        self.max_string_len = max;
        self
    }

    /// Store one argument into the slot vector.
    pub fn write_argument(
        &mut self,
        slot: &ArgSlot,
        sig: &TypeSig,
        value: &ScriptValue,
        slots: &mut [usize],
    ) -> InteropResult<()> {
        let end = slot.first_slot + slot.slots;
        if end > slots.len() {
            return Err(InteropError::marshal("argument vector is too small"));
        }
        match slot.passing {
            ArgPassing::ByReference => {
                slots[slot.first_slot] = self.write_by_reference(sig, value)?;
                Ok(())
            }
            ArgPassing::Direct => {
                let dst = slots[slot.first_slot..end].as_mut_ptr() as usize;
                self.write(sig, value, dst)
            }
        }
    }

    /// Copy `value` into a new temporary block and return its address.
    /// Arrays passed this way decay to a pointer, so wrappers and null pass
    /// straight through.
    pub fn write_by_reference(&mut self, sig: &TypeSig, value: &ScriptValue) -> InteropResult<usize> {
        let sig = self.types.resolve(sig)?;
        if matches!(sig.kind, SigKind::Array { .. }) {
            match value {
                ScriptValue::Null | ScriptValue::Undefined => return Ok(0),
                ScriptValue::Pointer(p) => return Ok(p.address()),
                ScriptValue::NativeObject(o) => return Ok(o.address()),
                _ => {}
            }
        }
        if let Some(addr) = value.identity().and_then(|id| self.by_ref.get(&id)) {
            return Ok(*addr);
        }
        self.copy_to_temp(&sig, value)
    }

    /// Write the native image of `value` as `sig` at `dst`.
    ///
    /// `dst` must be valid for writes of the type's full size.
    pub fn write(&mut self, sig: &TypeSig, value: &ScriptValue, dst: usize) -> InteropResult<()> {
        let sig = self.types.resolve(sig)?;
        match &sig.kind {
            SigKind::Prim(p) => write_prim(*p, value, dst),
            SigKind::String(kind) => {
                let addr = self.string_pointer(*kind, value)?;
                write_usize(dst, addr);
                Ok(())
            }
            SigKind::Pointer(target) => {
                let addr = self.pointer_value(target, value, false)?;
                write_usize(dst, addr);
                Ok(())
            }
            SigKind::Reference(target) => {
                let addr = self.pointer_value(target, value, true)?;
                write_usize(dst, addr);
                Ok(())
            }
            SigKind::Array { len, elem } => self.write_array(*len, elem, value, dst),
            SigKind::Struct(_) => self.write_struct(&sig, value, dst),
            SigKind::Union(_) => self.write_union(&sig, value, dst),
            SigKind::Function(_) => Err(InteropError::marshal(
                "functions cannot be stored by value; use a function pointer",
            )),
            SigKind::Named(name) => Err(InteropError::resolution(format!(
                "type '@{}' did not resolve",
                name
            ))),
        }
    }

    fn alloc_temp(&mut self, sig: &TypeSig, size: usize, align: usize) -> InteropResult<usize> {
        match &self.temps {
            TempAlloc::Arena(stack) => stack
                .with_current(|arena| arena.alloc(size))
                .ok_or_else(|| InteropError::marshal("no native call is in progress")),
            TempAlloc::Heap(heap) => heap.allocate_detached(Rc::new(sig.clone()), size.max(1), align),
            TempAlloc::Retained(heap) => heap.allocate(Rc::new(sig.clone()), size.max(1), align),
            TempAlloc::None => Err(InteropError::marshal(format!(
                "'{}' needs temporary native memory, which cannot be allocated here",
                sig
            ))),
        }
    }

    /// Allocate a block for `value` as `target`, register it for reuse and
    /// fill it in.
    fn copy_to_temp(&mut self, target: &TypeSig, value: &ScriptValue) -> InteropResult<usize> {
        // A script array behind a plain pointer is N contiguous elements.
        if let ScriptValue::Array(arr) = value {
            if !matches!(target.kind, SigKind::Array { .. }) {
                let elem = compute_array_layout(target, self.types)?;
                let addr = self.alloc_temp(target, elem.size_for_length(arr.len())?.max(1), elem.element_align)?;
                self.by_ref.insert(arr.id(), addr);
                for (i, item) in arr.to_vec().iter().enumerate() {
                    self.write(target, item, addr + elem.element_offset(i))?;
                }
                return Ok(addr);
            }
        }
        // Likewise a string behind a pointer to characters.
        if let (ScriptValue::String(s), SigKind::Prim(p)) = (value, &target.kind) {
            if let Some(kind) = char_kind(*p) {
                return self.temp_string(kind, s);
            }
        }

        let layout = self.sized_layout(target, value)?;
        let addr = self.alloc_temp(target, layout.size, layout.align)?;
        if let Some(id) = value.identity() {
            self.by_ref.insert(id, addr);
        }
        self.write(target, value, addr)?;
        Ok(addr)
    }

    /// Layout of `sig` holding `value`; variable arrays take their length
    /// from the value.
    pub(crate) fn sized_layout(&self, sig: &TypeSig, value: &ScriptValue) -> InteropResult<TypeLayout> {
        let layout = match &sig.kind {
            SigKind::Array { len: None, elem } => {
                let elem_layout = compute_array_layout(elem, self.types)?;
                let count = match value {
                    ScriptValue::Array(arr) => arr.len(),
                    ScriptValue::String(s) => string_units(s, self.types.resolve(elem)?.kind.clone()) + 1,
                    ScriptValue::NativeObject(o) => o.size() / elem_layout.element_size.max(1),
                    other => {
                        return Err(InteropError::marshal(format!(
                            "cannot size variable array '{}' from {}",
                            sig,
                            other.type_name()
                        )));
                    }
                };
                TypeLayout {
                    size: elem_layout.size_for_length(count)?,
                    align: elem_layout.element_align,
                }
            }
            _ => type_layout(sig, self.types)?,
        };
        if layout.size == 0 {
            return Err(InteropError::marshal(format!(
                "cannot pass a zero-sized '{}' by reference",
                sig
            )));
        }
        Ok(layout)
    }

    fn pointer_value(
        &mut self,
        target: &TypeSig,
        value: &ScriptValue,
        is_reference: bool,
    ) -> InteropResult<usize> {
        let target = self.types.resolve(target)?;
        let addr = match value {
            ScriptValue::Null | ScriptValue::Undefined => 0,
            ScriptValue::Pointer(p) => p.address(),
            ScriptValue::NativeObject(o) => o.address(),
            ScriptValue::NativeFunction(f) => f.address(),
            ScriptValue::Handle(h) => *h,
            ScriptValue::Function(func) => match &target.kind {
                SigKind::Function(_) => self.callbacks.callback_address(func, &target)?,
                _ => {
                    return Err(InteropError::marshal(format!(
                        "function '{}' can only be passed as a function pointer, not '*{}'",
                        func.name(),
                        *target
                    )));
                }
            },
            _ => {
                if target.as_function().is_some() {
                    return Err(InteropError::marshal(format!(
                        "expected a function for '*{}', got {}",
                        *target,
                        value.type_name()
                    )));
                }
                if target.is_void() {
                    return Err(InteropError::marshal(format!(
                        "cannot infer the native type of {} passed as a void pointer",
                        value.type_name()
                    )));
                }
                match value.identity().and_then(|id| self.by_ref.get(&id)) {
                    Some(addr) => *addr,
                    None => self.copy_to_temp(&target, value)?,
                }
            }
        };
        if addr == 0 && is_reference {
            return Err(InteropError::marshal(format!(
                "null cannot be passed as reference '&{}'",
                *target
            )));
        }
        Ok(addr)
    }

    fn string_pointer(&mut self, kind: StringKind, value: &ScriptValue) -> InteropResult<usize> {
        match value {
            ScriptValue::Null | ScriptValue::Undefined => Ok(0),
            ScriptValue::Pointer(p) => Ok(p.address()),
            ScriptValue::NativeObject(o) => Ok(o.address()),
            ScriptValue::String(s) => self.temp_string(kind, s),
            ScriptValue::Number(_)
            | ScriptValue::Bool(_)
            | ScriptValue::Int64(_)
            | ScriptValue::UInt64(_) => self.temp_string(kind, &value.to_string()),
            other => Err(InteropError::marshal(format!(
                "cannot convert {} to a string",
                other.type_name()
            ))),
        }
    }

    /// Null-terminated copy of `s` in temporary memory.
    fn temp_string(&mut self, kind: StringKind, s: &str) -> InteropResult<usize> {
        let chars = s.chars().count();
        if chars > self.max_string_len {
            return Err(InteropError::marshal(format!(
                "string of {} characters exceeds the {} character limit",
                chars, self.max_string_len
            )));
        }
        let bytes = encode_string(kind, s, None);
        let (elem, align) = match kind {
            StringKind::Ansi => (Prim::U8, 1),
            StringKind::Wide => (Prim::U16, 2),
        };
        let sig = TypeSig::new(SigKind::Array {
            len: Some(bytes.len() / align),
            elem: Box::new(TypeSig::prim(elem)),
        });
        let addr = self.alloc_temp(&sig, bytes.len(), align)?;
        write_bytes(addr, &bytes);
        Ok(addr)
    }

    fn write_array(
        &mut self,
        len: Option<usize>,
        elem: &TypeSig,
        value: &ScriptValue,
        dst: usize,
    ) -> InteropResult<()> {
        let layout = compute_array_layout(elem, self.types)?;
        let elem_kind = self.types.resolve(elem)?.kind.clone();
        match value {
            ScriptValue::Array(arr) => {
                let items = arr.to_vec();
                let count = len.unwrap_or(items.len());
                if items.len() > count {
                    return Err(InteropError::marshal(format!(
                        "array of {} elements does not fit in [{}]{}",
                        items.len(),
                        count,
                        elem
                    )));
                }
                for (i, item) in items.iter().enumerate() {
                    self.write(elem, item, dst + layout.element_offset(i))?;
                }
                zero_fill(
                    dst + layout.element_offset(items.len()),
                    layout.size_for_length(count - items.len())?,
                );
                Ok(())
            }
            ScriptValue::String(s) => {
                let SigKind::Prim(p) = elem_kind else {
                    return Err(InteropError::marshal(format!(
                        "cannot store a string in an array of '{}'",
                        elem
                    )));
                };
                let Some(kind) = char_kind(p) else {
                    return Err(InteropError::marshal(format!(
                        "cannot store a string in an array of '{}'",
                        elem
                    )));
                };
                // Fixed arrays keep as much as fits and stay terminated.
                let units = len.map(|n| n.saturating_sub(1));
                let bytes = encode_string(kind, s, units);
                write_bytes(dst, &bytes);
                if let Some(n) = len {
                    let total = layout.size_for_length(n)?;
                    zero_fill(dst + bytes.len(), total.saturating_sub(bytes.len()));
                }
                Ok(())
            }
            ScriptValue::Null | ScriptValue::Undefined => {
                zero_fill(dst, layout.size_for_length(len.unwrap_or(0))?);
                Ok(())
            }
            ScriptValue::NativeObject(o) => {
                let size = match len {
                    Some(n) => layout.size_for_length(n)?,
                    None => o.size(),
                };
                copy_native(o.address(), o.size(), dst, size);
                Ok(())
            }
            other => Err(InteropError::marshal(format!(
                "cannot convert {} to an array of '{}'",
                other.type_name(),
                elem
            ))),
        }
    }

    fn write_struct(&mut self, sig: &TypeSig, value: &ScriptValue, dst: usize) -> InteropResult<()> {
        let layout = compound_layout(sig, self.types)?;
        match value {
            ScriptValue::Object(obj) => {
                zero_fill(dst, layout.size);
                for field in &layout.fields {
                    let Some(name) = &field.name else { continue };
                    match obj.get(name) {
                        None | Some(ScriptValue::Undefined) => {}
                        Some(v) => self.write(&field.ty, &v, dst + field.offset)?,
                    }
                }
                Ok(())
            }
            // Positional initialisation, like a C aggregate initializer.
            ScriptValue::Array(arr) => {
                let items = arr.to_vec();
                if items.len() > layout.fields.len() {
                    return Err(InteropError::marshal(format!(
                        "{} initializers for a struct with {} fields",
                        items.len(),
                        layout.fields.len()
                    )));
                }
                zero_fill(dst, layout.size);
                for (field, item) in layout.fields.iter().zip(items.iter()) {
                    self.write(&field.ty, item, dst + field.offset)?;
                }
                Ok(())
            }
            ScriptValue::NativeObject(o) => {
                copy_native(o.address(), o.size(), dst, layout.size);
                Ok(())
            }
            ScriptValue::Null | ScriptValue::Undefined => {
                zero_fill(dst, layout.size);
                Ok(())
            }
            other => Err(InteropError::marshal(format!(
                "cannot convert {} to struct '{}'",
                other.type_name(),
                sig
            ))),
        }
    }

    /// Unions are written through the first member the object names.
    fn write_union(&mut self, sig: &TypeSig, value: &ScriptValue, dst: usize) -> InteropResult<()> {
        let layout = compound_layout(sig, self.types)?;
        match value {
            ScriptValue::Object(obj) => {
                zero_fill(dst, layout.size);
                for field in &layout.fields {
                    let Some(name) = &field.name else { continue };
                    if let Some(v) = obj.get(name) {
                        if !matches!(v, ScriptValue::Undefined) {
                            return self.write(&field.ty, &v, dst);
                        }
                    }
                }
                Ok(())
            }
            ScriptValue::NativeObject(o) => {
                copy_native(o.address(), o.size(), dst, layout.size);
                Ok(())
            }
            ScriptValue::Null | ScriptValue::Undefined => {
                zero_fill(dst, layout.size);
                Ok(())
            }
            other => Err(InteropError::marshal(format!(
                "cannot convert {} to union '{}'",
                other.type_name(),
                sig
            ))),
        }
    }
}

// ============================================================================
// Scalars
// ============================================================================

fn write_prim(p: Prim, value: &ScriptValue, dst: usize) -> InteropResult<()> {
    match p {
        Prim::Void => Err(InteropError::marshal("cannot store a value of type void")),
        Prim::Bool => {
            write_bytes(dst, &[u8::from(value.truthy())]);
            Ok(())
        }
        Prim::F32 => {
            let v = to_float(value)? as f32;
            write_bytes(dst, &v.to_le_bytes());
            Ok(())
        }
        Prim::F64 => {
            write_bytes(dst, &to_float(value)?.to_le_bytes());
            Ok(())
        }
        Prim::Handle => {
            write_usize(dst, to_handle(value)?);
            Ok(())
        }
        _ => {
            let v = to_integer(p, value)?;
            write_bytes(dst, &v.to_le_bytes()[..p.size()]);
            Ok(())
        }
    }
}

pub(crate) fn prim_name(p: Prim) -> &'static str {
    match p {
        Prim::Bool => "bool",
        Prim::I8 => "int8",
        Prim::U8 => "uint8",
        Prim::I16 => "int16",
        Prim::U16 => "uint16",
        Prim::I32 => "int32",
        Prim::U32 => "uint32",
        Prim::I64 => "int64",
        Prim::U64 => "uint64",
        Prim::F32 => "float",
        Prim::F64 => "double",
        Prim::ISize => "ssize_t",
        Prim::USize => "size_t",
        Prim::IntPtr => "INT_PTR",
        Prim::Handle => "HANDLE",
        Prim::Void => "void",
        Prim::Enum => "enum",
    }
}

/// Range-checked integer conversion.
pub(crate) fn to_integer(p: Prim, value: &ScriptValue) -> InteropResult<i128> {
    let Some((min, max)) = p.int_range() else {
        return Err(InteropError::marshal(format!(
            "'{}' is not an integer type",
            prim_name(p)
        )));
    };
    let v = match value {
        ScriptValue::Number(n) => number_to_integer(p, *n)?,
        ScriptValue::Int64(v) => i128::from(*v),
        ScriptValue::UInt64(v) => i128::from(*v),
        ScriptValue::Bool(b) => i128::from(*b),
        ScriptValue::Null => 0,
        ScriptValue::Handle(h) if p.size() == POINTER_SIZE => *h as i128,
        ScriptValue::Pointer(ptr) if p.size() == POINTER_SIZE => ptr.address() as i128,
        ScriptValue::String(s) => number_to_integer(p, parse_number(s)?)?,
        other => {
            return Err(InteropError::marshal(format!(
                "cannot convert {} to {}",
                other.type_name(),
                prim_name(p)
            )));
        }
    };
    if v < min || v > max {
        return Err(InteropError::marshal(format!(
            "value {} is out of range for {} ({}..={})",
            v,
            prim_name(p),
            min,
            max
        )));
    }
    Ok(v)
}

fn number_to_integer(p: Prim, n: f64) -> InteropResult<i128> {
    if !n.is_finite() {
        return Err(InteropError::marshal(format!(
            "cannot convert {} to {}",
            n,
            prim_name(p)
        )));
    }
    if p.size() == 8 && n.abs() > MAX_SAFE_INTEGER {
        return Err(InteropError::marshal(format!(
            "number {} is beyond exact double precision for {}; pass an Int64 or UInt64",
            n,
            prim_name(p)
        )));
    }
    Ok(n.trunc() as i128)
}

fn parse_number(s: &str) -> InteropResult<f64> {
    let t = s.trim();
    if t.is_empty() {
        return Ok(0.0);
    }
    let parsed = if let Some(hex) = t.strip_prefix("0x").or_else(|| t.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).ok().map(|v| v as f64)
    } else {
        t.parse::<f64>().ok()
    };
    parsed.ok_or_else(|| InteropError::marshal(format!("'{}' is not a number", s)))
}

pub(crate) fn to_float(value: &ScriptValue) -> InteropResult<f64> {
    match value {
        ScriptValue::Number(n) => Ok(*n),
        ScriptValue::Int64(v) => Ok(*v as f64),
        ScriptValue::UInt64(v) => Ok(*v as f64),
        ScriptValue::Bool(b) => Ok(if *b { 1.0 } else { 0.0 }),
        ScriptValue::Null => Ok(0.0),
        ScriptValue::String(s) => parse_number(s),
        other => Err(InteropError::marshal(format!(
            "cannot convert {} to a floating point number",
            other.type_name()
        ))),
    }
}

fn to_handle(value: &ScriptValue) -> InteropResult<usize> {
    match value {
        ScriptValue::Handle(h) => Ok(*h),
        ScriptValue::Null | ScriptValue::Undefined => Ok(0),
        ScriptValue::Pointer(p) => Ok(p.address()),
        ScriptValue::Number(_) | ScriptValue::Int64(_) | ScriptValue::UInt64(_) => {
            // Handles such as INVALID_HANDLE_VALUE are written as -1.
            let v = to_integer(Prim::IntPtr, value).or_else(|_| to_integer(Prim::USize, value))?;
            Ok(v as usize)
        }
        other => Err(InteropError::marshal(format!(
            "cannot convert {} to a HANDLE",
            other.type_name()
        ))),
    }
}

// ============================================================================
// Strings
// ============================================================================

fn char_kind(p: Prim) -> Option<StringKind> {
    match p {
        Prim::I8 | Prim::U8 => Some(StringKind::Ansi),
        Prim::I16 | Prim::U16 => Some(StringKind::Wide),
        _ => None,
    }
}

fn string_units(s: &str, elem: SigKind) -> usize {
    match elem {
        SigKind::Prim(Prim::I16 | Prim::U16) => s.encode_utf16().count(),
        _ => s.len(),
    }
}

/// Encode with a trailing NUL, keeping at most `max_units` code units.
fn encode_string(kind: StringKind, s: &str, max_units: Option<usize>) -> Vec<u8> {
    match kind {
        StringKind::Ansi => {
            let mut bytes: Vec<u8> = s.as_bytes().to_vec();
            if let Some(max) = max_units {
                bytes.truncate(max);
            }
            bytes.push(0);
            bytes
        }
        StringKind::Wide => {
            let mut units: Vec<u16> = s.encode_utf16().collect();
            if let Some(max) = max_units {
                units.truncate(max);
            }
            units.push(0);
            units.iter().flat_map(|u| u.to_le_bytes()).collect()
        }
    }
}

// ============================================================================
// Raw stores
// ============================================================================

fn write_bytes(dst: usize, bytes: &[u8]) {
    unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), dst as *mut u8, bytes.len()) };
}

fn write_usize(dst: usize, value: usize) {
    write_bytes(dst, &value.to_le_bytes());
}

fn zero_fill(dst: usize, len: usize) {
    if len > 0 {
        unsafe { std::ptr::write_bytes(dst as *mut u8, 0, len) };
    }
}

/// Copy up to `dst_len` bytes from a wrapper, zeroing any remainder.
fn copy_native(src: usize, src_len: usize, dst: usize, dst_len: usize) {
    let n = src_len.min(dst_len);
    if src != dst && n > 0 {
        unsafe { std::ptr::copy(src as *const u8, dst as *mut u8, n) };
    }
    zero_fill(dst + n, dst_len - n);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::value::ScriptObject;
    use crate::types::parse_signature;

    fn sig(text: &str) -> TypeSig {
        parse_signature(text).unwrap()
    }

    fn read<T: Copy>(addr: usize) -> T {
        unsafe { std::ptr::read_unaligned(addr as *const T) }
    }

    #[test]
    fn test_integer_ranges() {
        let mut buf = [0u8; 8];
        let dst = buf.as_mut_ptr() as usize;
        write_prim(Prim::I8, &ScriptValue::Number(-128.0), dst).unwrap();
        assert_eq!(buf[0] as i8, -128);
        assert!(write_prim(Prim::I8, &ScriptValue::Number(128.0), dst).unwrap_err().is_marshal());
        assert!(write_prim(Prim::U16, &ScriptValue::Number(-1.0), dst).is_err());
        write_prim(Prim::U32, &ScriptValue::Number(4294967295.0), dst).unwrap();
        assert_eq!(read::<u32>(dst), u32::MAX);
        // Truncation toward zero.
        write_prim(Prim::I32, &ScriptValue::Number(-7.9), dst).unwrap();
        assert_eq!(read::<i32>(dst), -7);
        assert!(write_prim(Prim::I32, &ScriptValue::Undefined, dst).is_err());
        assert!(write_prim(Prim::I32, &ScriptValue::Number(f64::NAN), dst).is_err());
        write_prim(Prim::I32, &ScriptValue::string(" 0x10 "), dst).unwrap();
        assert_eq!(read::<i32>(dst), 16);
    }

    #[test]
    fn test_sixty_four_bit_precision() {
        let mut slot = 0u64;
        let dst = &mut slot as *mut u64 as usize;
        write_prim(Prim::I64, &ScriptValue::Int64(i64::MIN), dst).unwrap();
        assert_eq!(slot as i64, i64::MIN);
        write_prim(Prim::U64, &ScriptValue::UInt64(u64::MAX), dst).unwrap();
        assert_eq!(slot, u64::MAX);
        let err = write_prim(Prim::I64, &ScriptValue::Number(2f64.powi(60)), dst).unwrap_err();
        assert!(err.to_string().contains("Int64"));
        assert!(write_prim(Prim::U64, &ScriptValue::Int64(-1), dst).is_err());
    }

    #[test]
    fn test_floats_and_bools() {
        let mut slot = 0u64;
        let dst = &mut slot as *mut u64 as usize;
        write_prim(Prim::F64, &ScriptValue::Number(0.1), dst).unwrap();
        assert_eq!(f64::from_bits(slot), 0.1);
        write_prim(Prim::F32, &ScriptValue::Number(1.5), dst).unwrap();
        assert_eq!(read::<f32>(dst), 1.5);
        write_prim(Prim::Bool, &ScriptValue::string("yes"), dst).unwrap();
        assert_eq!(read::<u8>(dst), 1);
    }

    #[test]
    fn test_struct_from_object() {
        let types = TypeRegistry::new();
        let arenas = ArenaStack::new();
        let _guard = arenas.enter();
        let mut m = ToNative::new(&types, TempAlloc::Arena(&arenas), &NoCallbacks);

        let mut buf = [0xFFu8; 16];
        let dst = buf.as_mut_ptr() as usize;
        let value = ScriptValue::object(vec![("a", 7.into()), ("c", 2.5.into())]);
        m.write(&sig("{S a:c b:i c:d}"), &value, dst).unwrap();
        assert_eq!(buf[0], 7);
        assert_eq!(read::<i32>(dst + 4), 0);
        assert_eq!(read::<f64>(dst + 8), 2.5);
    }

    #[test]
    fn test_strings_go_to_the_arena() {
        let types = TypeRegistry::new();
        let arenas = ArenaStack::new();
        let _guard = arenas.enter();
        let mut m = ToNative::new(&types, TempAlloc::Arena(&arenas), &NoCallbacks);

        let mut slot = 0usize;
        let dst = &mut slot as *mut usize as usize;
        m.write(&sig("t"), &ScriptValue::string("hi"), dst).unwrap();
        assert!(arenas.is_local(slot));
        assert_eq!(read::<[u8; 3]>(slot), *b"hi\0");

        m.write(&sig("T"), &ScriptValue::string("hé"), dst).unwrap();
        assert_eq!(read::<[u16; 3]>(slot), [b'h' as u16, 0xE9, 0]);

        m.write(&sig("t"), &ScriptValue::Null, dst).unwrap();
        assert_eq!(slot, 0);
    }

    #[test]
    fn test_string_length_limit() {
        let types = TypeRegistry::new();
        let arenas = ArenaStack::new();
        let _guard = arenas.enter();
        let mut m =
            ToNative::new(&types, TempAlloc::Arena(&arenas), &NoCallbacks).with_max_string_len(4);
        let mut slot = 0usize;
        let dst = &mut slot as *mut usize as usize;
        assert!(m.write(&sig("t"), &ScriptValue::string("12345"), dst).is_err());
    }

    #[test]
    fn test_char_array_truncates_and_terminates() {
        let types = TypeRegistry::new();
        let mut m = ToNative::new(&types, TempAlloc::None, &NoCallbacks);
        let mut buf = [0xAAu8; 4];
        let dst = buf.as_mut_ptr() as usize;
        m.write(&sig("[4]c"), &ScriptValue::string("hello"), dst).unwrap();
        assert_eq!(&buf, b"hel\0");
        m.write(&sig("[4]c"), &ScriptValue::string("a"), dst).unwrap();
        assert_eq!(&buf, b"a\0\0\0");
    }

    #[test]
    fn test_array_elements_and_overflow() {
        let types = TypeRegistry::new();
        let mut m = ToNative::new(&types, TempAlloc::None, &NoCallbacks);
        let mut buf = [0xFFu8; 8];
        let dst = buf.as_mut_ptr() as usize;
        let arr = ScriptValue::array(vec![1.into(), 2.into()]);
        m.write(&sig("[4]s"), &arr, dst).unwrap();
        assert_eq!(read::<[i16; 4]>(dst), [1, 2, 0, 0]);
        let too_long = ScriptValue::array(vec![1.into(); 5]);
        assert!(m.write(&sig("[4]s"), &too_long, dst).is_err());
    }

    #[test]
    fn test_pointer_to_scalar_and_reference_null() {
        let types = TypeRegistry::new();
        let arenas = ArenaStack::new();
        let _guard = arenas.enter();
        let mut m = ToNative::new(&types, TempAlloc::Arena(&arenas), &NoCallbacks);
        let mut slot = 0usize;
        let dst = &mut slot as *mut usize as usize;

        m.write(&sig("*i"), &42.into(), dst).unwrap();
        assert_eq!(read::<i32>(slot), 42);
        m.write(&sig("*i"), &ScriptValue::Null, dst).unwrap();
        assert_eq!(slot, 0);
        assert!(m.write(&sig("&i"), &ScriptValue::Null, dst).unwrap_err().is_marshal());
        assert!(m.write(&sig("*v"), &1.into(), dst).is_err());
    }

    #[test]
    fn test_cycles_share_one_block() {
        let mut types = TypeRegistry::new();
        types.define("Node", "{S value:i next:*@Node}").unwrap();
        let arenas = ArenaStack::new();
        let _guard = arenas.enter();
        let mut m = ToNative::new(&types, TempAlloc::Arena(&arenas), &NoCallbacks);

        let a = ScriptObject::default();
        let b = ScriptObject::default();
        a.set("value", 1.into());
        a.set("next", ScriptValue::Object(b.clone()));
        b.set("value", 2.into());
        b.set("next", ScriptValue::Object(a.clone()));

        let mut slot = 0usize;
        let dst = &mut slot as *mut usize as usize;
        m.write(&sig("*@Node"), &ScriptValue::Object(a), dst).unwrap();
        let a_addr = slot;
        let b_addr: usize = read(a_addr + POINTER_SIZE);
        assert_eq!(read::<i32>(a_addr), 1);
        assert_eq!(read::<i32>(b_addr), 2);
        assert_eq!(read::<usize>(b_addr + POINTER_SIZE), a_addr);
    }

    #[test]
    fn test_array_behind_plain_pointer() {
        let types = TypeRegistry::new();
        let arenas = ArenaStack::new();
        let _guard = arenas.enter();
        let mut m = ToNative::new(&types, TempAlloc::Arena(&arenas), &NoCallbacks);
        let mut slot = 0usize;
        let dst = &mut slot as *mut usize as usize;
        let arr = ScriptValue::array(vec![3.into(), 4.into(), 5.into()]);
        m.write(&sig("*d"), &arr, dst).unwrap();
        assert_eq!(read::<[f64; 3]>(slot), [3.0, 4.0, 5.0]);
    }

    #[test]
    fn test_temporaries_refused_without_allocator() {
        let types = TypeRegistry::new();
        let mut m = ToNative::new(&types, TempAlloc::None, &NoCallbacks);
        let mut slot = 0usize;
        let dst = &mut slot as *mut usize as usize;
        assert!(m.write(&sig("t"), &ScriptValue::string("x"), dst).is_err());
        assert!(
            m.write(&sig("*(Cv)"), &ScriptValue::Function(ScriptFunction::new("f", |_| {
                Ok(ScriptValue::Undefined)
            })), dst)
            .is_err()
        );
    }
}
