//! Native-to-script marshalling.
//!
//! [`FromNative`] reads the native image of a value at an address and builds
//! the script value for it. Scalars convert directly; 64-bit integers come
//! back as `Int64`/`UInt64` so they never lose precision. Pointers become
//! [`NativePointer`] wrappers (or callable [`NativeFunction`]s for function
//! pointers). Aggregates are copied into a fresh host-owned buffer, since the
//! source is usually a return register image or a callback's argument frame
//! that is about to disappear.

use std::rc::Rc;

use crate::backend::layout::type_layout;
use crate::error::{InteropError, InteropResult};
use crate::marshal::arena::ArenaStack;
use crate::runtime::heap::NativeHeap;
use crate::runtime::native::{NativeFunction, NativeObject, NativePointer};
use crate::runtime::probe;
use crate::runtime::value::ScriptValue;
use crate::types::{POINTER_SIZE, Prim, SigKind, StringKind, TypeRegistry, TypeSig};

pub struct FromNative<'a> {
    types: &'a TypeRegistry,
    heap: &'a Rc<NativeHeap>,
    arenas: &'a ArenaStack,
    max_string_len: usize,
}

impl<'a> FromNative<'a> {
    pub fn new(types: &'a TypeRegistry, heap: &'a Rc<NativeHeap>, arenas: &'a ArenaStack) -> Self {
        Self {
            types,
            heap,
            arenas,
            max_string_len: usize::MAX,
        }
    }

    pub fn with_max_string_len(mut self, max: usize) -> Self {
        self.max_string_len = max;
        self
    }

    /// Read a value of type `sig` stored at `src`.
    ///
    /// `src` must be readable for the type's size; only memory reached
    /// through pointers stored there is probed.
    pub fn read(&self, sig: &TypeSig, src: usize) -> InteropResult<ScriptValue> {
        let sig = self.types.resolve(sig)?;
        match &sig.kind {
            SigKind::Prim(p) => Ok(read_prim(*p, src)),
            SigKind::String(kind) => {
                let addr = read_raw::<usize>(src);
                if addr == 0 {
                    return Ok(ScriptValue::Null);
                }
                let s = read_c_string(addr, *kind, self.max_string_len)?;
                Ok(ScriptValue::string(&s))
            }
            SigKind::Pointer(target) | SigKind::Reference(target) => {
                self.wrap_pointer(read_raw::<usize>(src), target)
            }
            SigKind::Array { len: None, .. } => Err(InteropError::marshal(format!(
                "cannot read variable-length array '{}' by value",
                *sig
            ))),
            SigKind::Array { .. } | SigKind::Struct(_) | SigKind::Union(_) => {
                self.copy_aggregate(&sig, src)
            }
            SigKind::Function(_) => Err(InteropError::marshal(
                "functions cannot be read by value; use a function pointer",
            )),
            SigKind::Named(name) => Err(InteropError::resolution(format!(
                "type '@{}' did not resolve",
                name
            ))),
        }
    }

    /// Script value for a pointer `addr` declared as pointing at `target`.
    pub fn wrap_pointer(&self, addr: usize, target: &TypeSig) -> InteropResult<ScriptValue> {
        let target = self.types.resolve(target)?;
        if target.as_function().is_some() {
            if addr == 0 {
                return Ok(ScriptValue::Null);
            }
            return Ok(ScriptValue::NativeFunction(NativeFunction::from_pointer(
                addr,
                Rc::new(target.clone()),
            )));
        }

        // Scratch memory of a call in progress is gone once the call
        // returns; hand script a host-owned copy instead.
        let remaining = if addr != 0 { self.arenas.local_remaining(addr) } else { None };
        if let Some(remaining) = remaining {
            let layout = type_layout(&target, self.types)?;
            if layout.size > 0 {
                let copy = self
                    .heap
                    .allocate_detached(Rc::new(target.clone()), layout.size, layout.align)?;
                // An interior pointer near the end of a block has fewer bytes
                // behind it than the target claims; the rest stays zeroed.
                let len = layout.size.min(remaining);
                unsafe { std::ptr::copy_nonoverlapping(addr as *const u8, copy as *mut u8, len) };
                log::trace!("copied call-local pointer target {:#x} to {:#x}", addr, copy);
                return Ok(ScriptValue::Pointer(NativePointer::new(
                    copy,
                    Rc::new(target.clone()),
                    self.heap,
                )));
            }
        }

        Ok(ScriptValue::Pointer(NativePointer::new(
            addr,
            Rc::new(target.clone()),
            self.heap,
        )))
    }

    fn copy_aggregate(&self, sig: &TypeSig, src: usize) -> InteropResult<ScriptValue> {
        let layout = type_layout(sig, self.types)?;
        if layout.size == 0 {
            return Err(InteropError::marshal(format!(
                "cannot read zero-sized '{}'",
                sig
            )));
        }
        let sig = Rc::new(sig.clone());
        let addr = self.heap.allocate(sig.clone(), layout.size, layout.align)?;
        unsafe { std::ptr::copy_nonoverlapping(src as *const u8, addr as *mut u8, layout.size) };
        Ok(ScriptValue::NativeObject(NativeObject::host(
            addr,
            layout.size,
            sig,
            self.heap,
        )))
    }
}

pub(crate) fn read_raw<T: Copy>(src: usize) -> T {
    unsafe { std::ptr::read_unaligned(src as *const T) }
}

fn read_prim(p: Prim, src: usize) -> ScriptValue {
    match p {
        Prim::Void => ScriptValue::Undefined,
        Prim::Bool => ScriptValue::Bool(read_raw::<u8>(src) != 0),
        Prim::I8 => ScriptValue::Number(f64::from(read_raw::<i8>(src))),
        Prim::U8 => ScriptValue::Number(f64::from(read_raw::<u8>(src))),
        Prim::I16 => ScriptValue::Number(f64::from(read_raw::<i16>(src))),
        Prim::U16 => ScriptValue::Number(f64::from(read_raw::<u16>(src))),
        Prim::I32 | Prim::Enum => ScriptValue::Number(f64::from(read_raw::<i32>(src))),
        Prim::U32 => ScriptValue::Number(f64::from(read_raw::<u32>(src))),
        Prim::I64 => ScriptValue::Int64(read_raw::<i64>(src)),
        Prim::U64 => ScriptValue::UInt64(read_raw::<u64>(src)),
        Prim::F32 => ScriptValue::Number(f64::from(read_raw::<f32>(src))),
        Prim::F64 => ScriptValue::Number(read_raw::<f64>(src)),
        Prim::ISize | Prim::IntPtr => {
            let v = read_raw::<isize>(src);
            if POINTER_SIZE == 8 {
                ScriptValue::Int64(v as i64)
            } else {
                ScriptValue::Number(v as f64)
            }
        }
        Prim::USize => {
            let v = read_raw::<usize>(src);
            if POINTER_SIZE == 8 {
                ScriptValue::UInt64(v as u64)
            } else {
                ScriptValue::Number(v as f64)
            }
        }
        Prim::Handle => ScriptValue::Handle(read_raw::<usize>(src)),
    }
}

/// Read a null-terminated string, probing each page before touching it.
pub fn read_c_string(addr: usize, kind: StringKind, max_len: usize) -> InteropResult<String> {
    const CHUNK: usize = 256;
    let unit = match kind {
        StringKind::Ansi => 1,
        StringKind::Wide => 2,
    };
    let mut bytes = Vec::new();
    let mut cursor = addr;
    loop {
        // Stay within the current page so an unmapped neighbour is not probed.
        let page_left = 4096 - (cursor % 4096);
        let chunk = CHUNK.min(page_left).max(unit);
        probe::check_readable(cursor, chunk)?;
        let data = unsafe { std::slice::from_raw_parts(cursor as *const u8, chunk) };
        let mut terminated = false;
        for pair in data.chunks_exact(unit) {
            if pair.iter().all(|&b| b == 0) {
                terminated = true;
                break;
            }
            bytes.extend_from_slice(pair);
        }
        if terminated {
            break;
        }
        if bytes.len() / unit >= max_len {
            log::warn!("string at {:#x} exceeds {} characters; truncated", addr, max_len);
            bytes.truncate(max_len * unit);
            break;
        }
        cursor += chunk - chunk % unit;
    }
    Ok(match kind {
        StringKind::Ansi => String::from_utf8_lossy(&bytes).into_owned(),
        StringKind::Wide => {
            let units: Vec<u16> = bytes
                .chunks_exact(2)
                .map(|c| u16::from_le_bytes([c[0], c[1]]))
                .collect();
            String::from_utf16_lossy(&units)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::parse_signature;

    fn sig(text: &str) -> TypeSig {
        parse_signature(text).unwrap()
    }

    #[test]
    fn test_scalars() {
        let v: i16 = -300;
        assert_eq!(read_prim(Prim::I16, &v as *const i16 as usize), ScriptValue::Number(-300.0));
        let big: u64 = u64::MAX - 1;
        assert_eq!(read_prim(Prim::U64, &big as *const u64 as usize), ScriptValue::UInt64(big));
        let neg: i64 = -(1 << 62);
        assert_eq!(read_prim(Prim::I64, &neg as *const i64 as usize), ScriptValue::Int64(neg));
        let h: usize = 0xDEAD;
        assert_eq!(read_prim(Prim::Handle, &h as *const usize as usize), ScriptValue::Handle(0xDEAD));
        assert_eq!(read_prim(Prim::Void, 0), ScriptValue::Undefined);
    }

    #[test]
    fn test_strings() {
        let ansi = b"native\0";
        assert_eq!(
            read_c_string(ansi.as_ptr() as usize, StringKind::Ansi, 100).unwrap(),
            "native"
        );
        let wide: Vec<u16> = "wïde\0".encode_utf16().collect();
        assert_eq!(
            read_c_string(wide.as_ptr() as usize, StringKind::Wide, 100).unwrap(),
            "wïde"
        );
        assert!(read_c_string(0, StringKind::Ansi, 100).unwrap_err().is_fault());
    }

    #[test]
    fn test_string_truncated_at_limit() {
        let long = vec![b'x'; 1000];
        let mut s = long.clone();
        s.push(0);
        let out = read_c_string(s.as_ptr() as usize, StringKind::Ansi, 300).unwrap();
        assert_eq!(out.len(), 300);
    }

    #[test]
    fn test_struct_is_copied_to_host_memory() {
        let types = TypeRegistry::new();
        let heap = Rc::new(NativeHeap::new());
        let arenas = ArenaStack::new();
        let m = FromNative::new(&types, &heap, &arenas);

        let raw: [i32; 2] = [3, 4];
        let value = m.read(&sig("{S x:i y:i}"), raw.as_ptr() as usize).unwrap();
        let ScriptValue::NativeObject(obj) = value else {
            panic!("expected a native object");
        };
        assert!(obj.is_host_owned());
        assert_ne!(obj.address(), raw.as_ptr() as usize);
        assert_eq!(read_raw::<[i32; 2]>(obj.address()), [3, 4]);
        assert_eq!(heap.stats().live_buffers, 1);
    }

    #[test]
    fn test_pointers() {
        let types = TypeRegistry::new();
        let heap = Rc::new(NativeHeap::new());
        let arenas = ArenaStack::new();
        let m = FromNative::new(&types, &heap, &arenas);

        let target = 5i32;
        let slot = &target as *const i32 as usize;
        let value = m.read(&sig("*i"), &slot as *const usize as usize).unwrap();
        let ScriptValue::Pointer(p) = value else {
            panic!("expected a pointer");
        };
        assert_eq!(p.address(), slot);
        assert!(!p.is_root());

        let null = 0usize;
        let f = m.read(&sig("*(Ci i)"), &null as *const usize as usize).unwrap();
        assert_eq!(f, ScriptValue::Null);
        let some = 0x1000usize;
        let f = m.read(&sig("*(Ci i)"), &some as *const usize as usize).unwrap();
        assert!(matches!(f, ScriptValue::NativeFunction(_)));
    }

    #[test]
    fn test_arena_targets_are_copied_out() {
        let types = TypeRegistry::new();
        let heap = Rc::new(NativeHeap::new());
        let arenas = ArenaStack::new();
        let guard = arenas.enter();
        let local = arenas.with_current(|a| a.alloc(4)).unwrap();
        unsafe { std::ptr::write(local as *mut i32, 99) };

        let m = FromNative::new(&types, &heap, &arenas);
        let ScriptValue::Pointer(p) = m.wrap_pointer(local, &sig("i")).unwrap() else {
            panic!("expected a pointer");
        };
        drop(guard);
        assert_ne!(p.address(), local);
        assert!(p.is_root());
        assert_eq!(read_raw::<i32>(p.address()), 99);
    }

    #[test]
    fn test_interior_arena_pointer_copies_only_its_block() {
        let types = TypeRegistry::new();
        let heap = Rc::new(NativeHeap::new());
        let arenas = ArenaStack::new();
        let _guard = arenas.enter();
        let local = arenas.with_current(|a| a.alloc(16)).unwrap();
        unsafe { std::ptr::write((local + 8) as *mut [i32; 2], [1, 2]) };

        // 8 bytes remain in the block, the target claims 32.
        let m = FromNative::new(&types, &heap, &arenas);
        let ScriptValue::Pointer(p) = m.wrap_pointer(local + 8, &sig("[8]i")).unwrap() else {
            panic!("expected a pointer");
        };
        assert_eq!(read_raw::<[i32; 8]>(p.address()), [1, 2, 0, 0, 0, 0, 0, 0]);
    }
}
