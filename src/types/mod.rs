//! Native type signatures
//!
//! A signature is a compact textual description of a C type, as produced by
//! the script-side C declaration parser:
//!
//! ```text
//! i            int32
//! *{S x:i y:i} pointer to struct { int x; int y; }
//! [16]T        array of 16 wide-string pointers
//! (Ci t)       cdecl function taking an ANSI string, returning int32
//! ```
//!
//! Signatures are parsed once into an immutable [`TypeSig`] tree and shared
//! through `Rc` from then on.

pub mod parser;
pub mod registry;

use std::fmt;
use std::rc::Rc;

pub use parser::{next_arg_end, parse_signature};
pub use registry::{SignatureCache, TypeRegistry};

// ============================================================================
// Primitive kinds
// ============================================================================

/// Scalar types, keyed by their single-letter code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Prim {
    Bool,
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
    /// `z`: signed size (ptrdiff_t / SSIZE_T).
    ISize,
    /// `Z`: size_t.
    USize,
    /// `P`: INT_PTR / LPARAM style pointer-sized integer.
    IntPtr,
    Handle,
    Void,
    /// `E`: enum, int32 sized.
    Enum,
}

impl Prim {
    pub fn from_code(c: char) -> Option<Prim> {
        Some(match c {
            'b' => Prim::Bool,
            'c' => Prim::I8,
            'C' => Prim::U8,
            's' => Prim::I16,
            'S' => Prim::U16,
            'i' => Prim::I32,
            'I' => Prim::U32,
            'l' => Prim::I64,
            'L' => Prim::U64,
            'f' => Prim::F32,
            'd' => Prim::F64,
            'z' => Prim::ISize,
            'Z' => Prim::USize,
            'P' => Prim::IntPtr,
            'H' => Prim::Handle,
            'v' => Prim::Void,
            'E' => Prim::Enum,
            _ => return None,
        })
    }

    pub fn code(self) -> char {
        match self {
            Prim::Bool => 'b',
            Prim::I8 => 'c',
            Prim::U8 => 'C',
            Prim::I16 => 's',
            Prim::U16 => 'S',
            Prim::I32 => 'i',
            Prim::U32 => 'I',
            Prim::I64 => 'l',
            Prim::U64 => 'L',
            Prim::F32 => 'f',
            Prim::F64 => 'd',
            Prim::ISize => 'z',
            Prim::USize => 'Z',
            Prim::IntPtr => 'P',
            Prim::Handle => 'H',
            Prim::Void => 'v',
            Prim::Enum => 'E',
        }
    }

    /// Native size in bytes. Void has no size.
    pub fn size(self) -> usize {
        match self {
            Prim::Bool | Prim::I8 | Prim::U8 => 1,
            Prim::I16 | Prim::U16 => 2,
            Prim::I32 | Prim::U32 | Prim::F32 | Prim::Enum => 4,
            Prim::I64 | Prim::U64 | Prim::F64 => 8,
            Prim::ISize | Prim::USize | Prim::IntPtr | Prim::Handle => POINTER_SIZE,
            Prim::Void => 0,
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, Prim::F32 | Prim::F64)
    }

    pub fn is_signed(self) -> bool {
        matches!(
            self,
            Prim::I8 | Prim::I16 | Prim::I32 | Prim::I64 | Prim::ISize | Prim::IntPtr | Prim::Enum
        )
    }

    /// Integer bounds as (min, max). `None` for non-integers.
    pub fn int_range(self) -> Option<(i128, i128)> {
        let bits = (self.size() * 8) as u32;
        match self {
            Prim::Bool | Prim::F32 | Prim::F64 | Prim::Void | Prim::Handle => None,
            _ if self.is_signed() => Some((-(1i128 << (bits - 1)), (1i128 << (bits - 1)) - 1)),
            _ => Some((0, (1i128 << bits) - 1)),
        }
    }
}

/// Size of a native pointer on this target.
pub const POINTER_SIZE: usize = std::mem::size_of::<usize>();

// ============================================================================
// Signature tree
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StringKind {
    /// `t`: 8-bit, null-terminated.
    Ansi,
    /// `T`: UTF-16, null-terminated.
    Wide,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallConv {
    Stdcall,
    Cdecl,
    Fastcall,
    Thiscall,
    Vectorcall,
}

impl CallConv {
    pub fn from_code(c: char) -> Option<CallConv> {
        Some(match c {
            'S' => CallConv::Stdcall,
            'C' => CallConv::Cdecl,
            'F' => CallConv::Fastcall,
            'T' => CallConv::Thiscall,
            'V' => CallConv::Vectorcall,
            _ => return None,
        })
    }

    pub fn code(self) -> char {
        match self {
            CallConv::Stdcall => 'S',
            CallConv::Cdecl => 'C',
            CallConv::Fastcall => 'F',
            CallConv::Thiscall => 'T',
            CallConv::Vectorcall => 'V',
        }
    }

    /// Only stdcall and cdecl have an invoker.
    pub fn is_implemented(self) -> bool {
        matches!(self, CallConv::Stdcall | CallConv::Cdecl)
    }
}

/// One struct/union member.
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub name: Option<String>,
    pub ty: TypeSig,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionSig {
    pub conv: CallConv,
    pub ret: Box<TypeSig>,
    pub params: Vec<TypeSig>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SigKind {
    Prim(Prim),
    String(StringKind),
    Pointer(Box<TypeSig>),
    Reference(Box<TypeSig>),
    /// `[N]T`, or `[]T` when `len` is `None`.
    Array { len: Option<usize>, elem: Box<TypeSig> },
    Struct(Vec<Field>),
    Union(Vec<Field>),
    Function(FunctionSig),
    /// `@Name`, resolved through the [`TypeRegistry`].
    Named(String),
}

/// A parsed signature node. `is_const` is informational only.
#[derive(Debug, Clone, PartialEq)]
pub struct TypeSig {
    pub kind: SigKind,
    pub is_const: bool,
}

impl TypeSig {
    pub fn new(kind: SigKind) -> Self {
        Self {
            kind,
            is_const: false,
        }
    }

    pub fn prim(p: Prim) -> Self {
        Self::new(SigKind::Prim(p))
    }

    pub fn pointer_to(target: TypeSig) -> Self {
        Self::new(SigKind::Pointer(Box::new(target)))
    }

    pub fn is_void(&self) -> bool {
        matches!(self.kind, SigKind::Prim(Prim::Void))
    }

    pub fn as_function(&self) -> Option<&FunctionSig> {
        match &self.kind {
            SigKind::Function(f) => Some(f),
            _ => None,
        }
    }

    /// Pointer-like kinds hold a native address in their storage.
    pub fn is_pointer_like(&self) -> bool {
        matches!(
            self.kind,
            SigKind::Pointer(_) | SigKind::Reference(_) | SigKind::String(_)
        )
    }

    pub fn is_aggregate(&self) -> bool {
        matches!(
            self.kind,
            SigKind::Struct(_) | SigKind::Union(_) | SigKind::Array { .. }
        )
    }
}

impl fmt::Display for TypeSig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_const {
            write!(f, "%")?;
        }
        match &self.kind {
            SigKind::Prim(p) => write!(f, "{}", p.code()),
            SigKind::String(StringKind::Ansi) => write!(f, "t"),
            SigKind::String(StringKind::Wide) => write!(f, "T"),
            SigKind::Pointer(t) => write!(f, "*{}", t),
            SigKind::Reference(t) => write!(f, "&{}", t),
            SigKind::Array { len, elem } => match len {
                Some(n) => write!(f, "[{}]{}", n, elem),
                None => write!(f, "[]{}", elem),
            },
            SigKind::Struct(fields) | SigKind::Union(fields) => {
                let tag = if matches!(self.kind, SigKind::Struct(_)) { 'S' } else { 'U' };
                write!(f, "{{{}", tag)?;
                for field in fields {
                    match &field.name {
                        Some(name) => write!(f, " {}:{}", name, field.ty)?,
                        None => write!(f, " {}", field.ty)?,
                    }
                }
                write!(f, "}}")
            }
            SigKind::Function(func) => {
                write!(f, "({}{}", func.conv.code(), func.ret)?;
                for p in &func.params {
                    write!(f, " {}", p)?;
                }
                write!(f, ")")
            }
            SigKind::Named(name) => write!(f, "@{}", name),
        }
    }
}

/// Shared handle to a parsed signature.
pub type SigRef = Rc<TypeSig>;
