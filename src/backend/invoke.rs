//! Native call planning.
//!
//! A call goes through two states. Packing sizes the parameter list, checks
//! every parameter is passable, and marshals the script arguments into a
//! flat slot vector. Calling hands that vector to the platform shim in
//! [`call`](super::call) and decodes the result registers through the
//! return type. Every error is raised while packing, before control leaves
//! for native code.

use std::rc::Rc;

use crate::backend::call::{self, RawReturn};
use crate::backend::layout::type_layout;
use crate::error::{InteropError, InteropResult};
use crate::marshal::{
    ArgFrame, FromNative, StackArgSizer, ToNative, check_passable, returns_in_memory,
};
use crate::runtime::heap::NativeHeap;
use crate::runtime::native::NativeObject;
use crate::runtime::value::ScriptValue;
use crate::types::{CallConv, FunctionSig, Prim, SigKind, SigRef, TypeRegistry, TypeSig};

/// How the callee hands back its result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnKind {
    Void,
    /// RAX / EDX:EAX, or XMM0 / ST(0) when `float`.
    Register { float: bool },
    /// Through a caller-provided buffer whose address is passed in slot 0.
    Memory { size: usize, align: usize },
}

/// Everything about a function signature that does not depend on the
/// argument values.
#[derive(Debug, Clone)]
pub struct CallPlan {
    pub conv: CallConv,
    pub ret: TypeSig,
    pub params: Vec<TypeSig>,
    pub frame: ArgFrame,
    pub ret_kind: ReturnKind,
}

/// Output of the packing state.
pub struct PackedCall {
    pub slots: Vec<usize>,
    /// Host-owned buffer receiving an in-memory return value.
    pub return_area: Option<Rc<NativeObject>>,
}

impl CallPlan {
    pub fn new(fsig: &FunctionSig, types: &TypeRegistry) -> InteropResult<Self> {
        if !fsig.conv.is_implemented() {
            return Err(InteropError::unsupported(format!(
                "calling convention '{}'",
                fsig.conv.code()
            )));
        }

        let ret_kind = classify_return(&fsig.ret, types)?;
        let mut sizer = StackArgSizer::new(types);
        if matches!(ret_kind, ReturnKind::Memory { .. }) {
            sizer.add_hidden_return();
        }
        for param in &fsig.params {
            check_passable(param, types)?;
            sizer.add(param)?;
        }

        Ok(Self {
            conv: fsig.conv,
            ret: (*fsig.ret).clone(),
            params: fsig.params.clone(),
            frame: sizer.finish(),
            ret_kind,
        })
    }

    /// Bytes a stdcall callee pops on 32-bit targets.
    pub fn callee_pop_bytes(&self) -> u16 {
        if cfg!(target_arch = "x86") && self.conv == CallConv::Stdcall {
            self.frame.byte_size() as u16
        } else {
            0
        }
    }

    pub fn float_return(&self) -> bool {
        matches!(self.ret_kind, ReturnKind::Register { float: true })
    }

    /// Packing: marshal `args` into argument slots.
    pub fn pack(
        &self,
        args: &[ScriptValue],
        marshaller: &mut ToNative<'_>,
        heap: &Rc<NativeHeap>,
    ) -> InteropResult<PackedCall> {
        if args.len() > self.params.len() {
            return Err(InteropError::marshal(format!(
                "{} arguments passed to a function taking {}",
                args.len(),
                self.params.len()
            )));
        }

        let mut slots = vec![0usize; self.frame.slots];
        let return_area = match self.ret_kind {
            ReturnKind::Memory { size, align } => {
                let sig: SigRef = Rc::new(self.ret.clone());
                let addr = heap.allocate(sig.clone(), size, align)?;
                let area = NativeObject::host(addr, size, sig, heap);
                slots[0] = addr;
                Some(area)
            }
            _ => None,
        };

        let undefined = ScriptValue::Undefined;
        for (i, (param, slot)) in self.params.iter().zip(&self.frame.args).enumerate() {
            let value = args.get(i).unwrap_or(&undefined);
            marshaller
                .write_argument(slot, param, value, &mut slots)
                .map_err(|e| match e {
                    InteropError::Marshal(msg) => {
                        InteropError::marshal(format!("argument {}: {}", i + 1, msg))
                    }
                    other => other,
                })?;
        }

        Ok(PackedCall { slots, return_area })
    }

    /// Calling: transfer control to `func`.
    ///
    /// # Safety
    /// `func` must be a function with this plan's signature, and every
    /// pointer in `packed` must still be valid.
    pub unsafe fn call(&self, func: usize, packed: &PackedCall) -> InteropResult<RawReturn> {
        log::trace!(
            "calling {:#x} with {} slots ({:?})",
            func,
            packed.slots.len(),
            self.conv
        );
        unsafe { call::invoke(func, self.conv, &packed.slots, self.float_return()) }
    }

    /// Turn the result registers into a script value.
    pub fn decode(
        &self,
        raw: RawReturn,
        packed: PackedCall,
        reader: &FromNative<'_>,
        types: &TypeRegistry,
    ) -> InteropResult<ScriptValue> {
        match self.ret_kind {
            ReturnKind::Void => Ok(ScriptValue::Undefined),
            ReturnKind::Memory { .. } => match packed.return_area {
                Some(area) => Ok(ScriptValue::NativeObject(area)),
                None => Err(InteropError::fault("missing return area")),
            },
            ReturnKind::Register { float } => {
                let image = if float {
                    float_image(&self.ret, raw.float, types)?
                } else {
                    raw.int
                };
                reader.read(&self.ret, &image as *const u64 as usize)
            }
        }
    }
}

/// Convert the float return register to the in-memory image of the
/// declared type. x86 returns every float through ST(0), stored as double.
fn float_image(ret: &TypeSig, bits: u64, types: &TypeRegistry) -> InteropResult<u64> {
    let ret = types.resolve(ret)?;
    let is_f32 = matches!(ret.kind, SigKind::Prim(Prim::F32));
    Ok(if is_f32 && cfg!(target_arch = "x86") {
        u64::from((f64::from_bits(bits) as f32).to_bits())
    } else if is_f32 {
        bits & 0xFFFF_FFFF
    } else {
        bits
    })
}

fn classify_return(ret: &TypeSig, types: &TypeRegistry) -> InteropResult<ReturnKind> {
    let resolved = types.resolve(ret)?;
    if resolved.is_void() {
        return Ok(ReturnKind::Void);
    }
    if returns_in_memory(&resolved, types)? {
        let layout = type_layout(&resolved, types)?;
        return Ok(ReturnKind::Memory {
            size: layout.size,
            align: layout.align,
        });
    }
    let float = matches!(resolved.kind, SigKind::Prim(Prim::F32 | Prim::F64));
    Ok(ReturnKind::Register { float })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::marshal::{ArenaStack, NoCallbacks, TempAlloc};
    use crate::types::parse_signature;

    fn plan(text: &str, types: &TypeRegistry) -> InteropResult<CallPlan> {
        let sig = parse_signature(text)?;
        let fsig = sig.as_function().cloned().unwrap();
        CallPlan::new(&fsig, types)
    }

    #[test]
    fn test_rejects_by_value_aggregates_and_void() {
        let types = TypeRegistry::new();
        assert!(plan("(Ci {S a:i})", &types).unwrap_err().is_marshal());
        assert!(plan("(Ci v)", &types).unwrap_err().is_marshal());
        assert!(plan("(Ci *{S a:i})", &types).is_ok());
    }

    #[test]
    fn test_unimplemented_conventions() {
        let types = TypeRegistry::new();
        for conv in ["F", "T", "V"] {
            let err = plan(&format!("({}i i)", conv), &types).unwrap_err();
            assert!(matches!(err, InteropError::Unsupported(_)));
        }
    }

    #[test]
    fn test_return_classification() {
        let types = TypeRegistry::new();
        assert_eq!(plan("(Cv)", &types).unwrap().ret_kind, ReturnKind::Void);
        assert_eq!(
            plan("(Cd)", &types).unwrap().ret_kind,
            ReturnKind::Register { float: true }
        );
        assert_eq!(
            plan("(C{S a:i b:i})", &types).unwrap().ret_kind,
            ReturnKind::Register { float: false }
        );
        let p = plan("(C{S a:i b:i c:i} i)", &types).unwrap();
        assert_eq!(p.ret_kind, ReturnKind::Memory { size: 12, align: 4 });
        assert!(p.frame.hidden_return);
        assert_eq!(p.frame.args[0].first_slot, 1);
    }

    #[test]
    fn test_pack_counts_arguments() {
        let types = TypeRegistry::new();
        let heap = Rc::new(NativeHeap::new());
        let arenas = ArenaStack::new();
        let _guard = arenas.enter();
        let mut m = ToNative::new(&types, TempAlloc::Arena(&arenas), &NoCallbacks);
        let p = plan("(Ci i i)", &types).unwrap();

        let packed = p.pack(&[1.into(), 2.into()], &mut m, &heap).unwrap();
        assert_eq!(packed.slots, vec![1, 2]);
        let err = p
            .pack(&[1.into(), 2.into(), 3.into()], &mut m, &heap)
            .err()
            .unwrap();
        assert!(err.is_marshal());
        // A missing argument is undefined, which an int rejects.
        let err = p.pack(&[1.into()], &mut m, &heap).err().unwrap();
        assert!(err.to_string().contains("argument 2"));
    }

    #[cfg(target_arch = "x86_64")]
    mod native {
        use super::*;

        #[repr(C)]
        #[derive(Clone, Copy)]
        struct Triple {
            a: i32,
            b: i32,
            c: i32,
        }

        extern "win64" fn make_triple(seed: i32) -> Triple {
            Triple {
                a: seed,
                b: seed * 2,
                c: seed * 3,
            }
        }

        extern "win64" fn halve(x: f32) -> f32 {
            x / 2.0
        }

        extern "win64" fn widen(x: i64) -> i64 {
            x * 4
        }

        fn run(text: &str, func: usize, args: &[ScriptValue]) -> InteropResult<ScriptValue> {
            let types = TypeRegistry::new();
            let heap = Rc::new(NativeHeap::new());
            let arenas = ArenaStack::new();
            let _guard = arenas.enter();
            let p = plan(text, &types)?;
            let mut m = ToNative::new(&types, TempAlloc::Arena(&arenas), &NoCallbacks);
            let packed = p.pack(args, &mut m, &heap)?;
            let raw = unsafe { p.call(func, &packed)? };
            let reader = FromNative::new(&types, &heap, &arenas);
            p.decode(raw, packed, &reader, &types)
        }

        #[test]
        fn test_struct_return_through_memory() {
            let value = run("(C{S a:i b:i c:i} i)", make_triple as usize, &[5.into()]).unwrap();
            let ScriptValue::NativeObject(obj) = value else {
                panic!("expected a native object");
            };
            let t = unsafe { *(obj.address() as *const Triple) };
            assert_eq!((t.a, t.b, t.c), (5, 10, 15));
        }

        #[test]
        fn test_float_return() {
            let value = run("(Cf f)", halve as usize, &[3.0.into()]).unwrap();
            assert_eq!(value, ScriptValue::Number(1.5));
        }

        #[test]
        fn test_int64_round_trip() {
            let big = 1i64 << 58;
            let value = run("(Cl l)", widen as usize, &[ScriptValue::Int64(big)]).unwrap();
            assert_eq!(value, ScriptValue::Int64(big * 4));
        }
    }
}
