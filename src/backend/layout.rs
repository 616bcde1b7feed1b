//! Memory layout calculation for native types
//!
//! This module computes C layouts for signatures, including:
//! - Field offsets with natural alignment
//! - Total size of structs, unions and arrays (with trailing padding)
//!
//! The rules are the platform C compiler's default (non-packed) layout:
//! every scalar is aligned to its own size, a compound is aligned to its
//! most-aligned member, and sizes are rounded up to the alignment.

use crate::error::{InteropError, InteropResult};
use crate::types::{Field, POINTER_SIZE, SigKind, TypeRegistry, TypeSig};

/// Deepest by-value nesting accepted before a type is considered unsized.
const MAX_NESTING: usize = 64;

/// Size and alignment of a type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypeLayout {
    pub size: usize,
    pub align: usize,
}

/// Layout information for a single struct or union member
#[derive(Debug, Clone)]
pub struct FieldLayout {
    /// Member name (anonymous members have none)
    pub name: Option<String>,
    /// Byte offset from struct start
    pub offset: usize,
    /// Member type
    pub ty: TypeSig,
    /// Size in bytes
    pub size: usize,
}

/// Complete layout for a struct or union
#[derive(Debug, Clone)]
pub struct StructLayout {
    /// Total size in bytes (including padding)
    pub size: usize,
    /// Required alignment in bytes
    pub align: usize,
    /// Layout for each member, in declaration order
    pub fields: Vec<FieldLayout>,
}

impl StructLayout {
    /// Get field layout by name
    pub fn get_field(&self, name: &str) -> Option<&FieldLayout> {
        self.fields.iter().find(|f| f.name.as_deref() == Some(name))
    }

    /// Get field layout by index
    pub fn get_field_by_index(&self, index: usize) -> Option<&FieldLayout> {
        self.fields.get(index)
    }
}

/// Layout for an array type
#[derive(Debug, Clone, Copy)]
pub struct ArrayLayout {
    /// Distance between consecutive elements
    pub element_size: usize,
    /// Alignment of elements
    pub element_align: usize,
}

impl ArrayLayout {
    /// Calculate total size for an array of given length
    pub fn size_for_length(&self, len: usize) -> InteropResult<usize> {
        len.checked_mul(self.element_size)
            .ok_or_else(|| InteropError::marshal(format!("array of {} elements is too large", len)))
    }

    /// Calculate offset of element at given index. Only valid for indices
    /// below a length accepted by `size_for_length`.
    pub fn element_offset(&self, index: usize) -> usize {
        index * self.element_size
    }
}

/// Size and alignment of `sig`.
pub fn type_layout(sig: &TypeSig, types: &TypeRegistry) -> InteropResult<TypeLayout> {
    layout_at_depth(sig, types, 0)
}

/// Byte size of `sig`; `[]T` and `v` are zero-sized.
pub fn size_of(sig: &TypeSig, types: &TypeRegistry) -> InteropResult<usize> {
    Ok(type_layout(sig, types)?.size)
}

fn layout_at_depth(sig: &TypeSig, types: &TypeRegistry, depth: usize) -> InteropResult<TypeLayout> {
    if depth > MAX_NESTING {
        return Err(InteropError::signature(
            &sig.to_string(),
            0,
            "type contains itself by value",
        ));
    }
    match &sig.kind {
        SigKind::Prim(p) => {
            let size = p.size();
            Ok(TypeLayout {
                size,
                align: size.max(1),
            })
        }
        SigKind::String(_) | SigKind::Pointer(_) | SigKind::Reference(_) => Ok(TypeLayout {
            size: POINTER_SIZE,
            align: POINTER_SIZE,
        }),
        SigKind::Array { len, elem } => {
            let elem = layout_at_depth(elem, types, depth + 1)?;
            let size = elem.size.checked_mul(len.unwrap_or(0)).ok_or_else(|| {
                InteropError::signature(&sig.to_string(), 0, "array size overflows")
            })?;
            Ok(TypeLayout {
                size,
                align: elem.align,
            })
        }
        SigKind::Struct(fields) => {
            let layout = struct_layout_at_depth(fields, types, depth)?;
            Ok(TypeLayout {
                size: layout.size,
                align: layout.align,
            })
        }
        SigKind::Union(fields) => {
            let layout = union_layout_at_depth(fields, types, depth)?;
            Ok(TypeLayout {
                size: layout.size,
                align: layout.align,
            })
        }
        SigKind::Function(_) => Err(InteropError::marshal(
            "function types have no size; use a function pointer",
        )),
        SigKind::Named(_) => {
            let target = types.resolve(sig)?;
            layout_at_depth(&target, types, depth + 1)
        }
    }
}

/// Compute the memory layout for a struct with given fields
pub fn compute_struct_layout(fields: &[Field], types: &TypeRegistry) -> InteropResult<StructLayout> {
    struct_layout_at_depth(fields, types, 0)
}

fn struct_layout_at_depth(
    fields: &[Field],
    types: &TypeRegistry,
    depth: usize,
) -> InteropResult<StructLayout> {
    let mut result_fields = Vec::with_capacity(fields.len());
    let mut offset = 0usize;
    let mut max_align = 1usize;

    for field in fields {
        let member = member_layout(field, types, depth)?;

        // Align offset to field alignment
        offset = align_up(offset, member.align).ok_or_else(|| too_large(field))?;
        max_align = max_align.max(member.align);

        result_fields.push(FieldLayout {
            name: field.name.clone(),
            offset,
            ty: field.ty.clone(),
            size: member.size,
        });

        offset = offset.checked_add(member.size).ok_or_else(|| too_large(field))?;
    }

    // Align total size to struct alignment
    let size = align_up(offset, max_align)
        .ok_or_else(|| InteropError::marshal("struct size overflows"))?;

    Ok(StructLayout {
        size,
        align: max_align,
        fields: result_fields,
    })
}

/// Compute the memory layout for a union: every member at offset 0
pub fn compute_union_layout(fields: &[Field], types: &TypeRegistry) -> InteropResult<StructLayout> {
    union_layout_at_depth(fields, types, 0)
}

fn union_layout_at_depth(
    fields: &[Field],
    types: &TypeRegistry,
    depth: usize,
) -> InteropResult<StructLayout> {
    let mut result_fields = Vec::with_capacity(fields.len());
    let mut max_size = 0usize;
    let mut max_align = 1usize;

    for field in fields {
        let member = member_layout(field, types, depth)?;
        max_size = max_size.max(member.size);
        max_align = max_align.max(member.align);
        result_fields.push(FieldLayout {
            name: field.name.clone(),
            offset: 0,
            ty: field.ty.clone(),
            size: member.size,
        });
    }

    Ok(StructLayout {
        size: align_up(max_size, max_align)
            .ok_or_else(|| InteropError::marshal("union size overflows"))?,
        align: max_align,
        fields: result_fields,
    })
}

/// Layout of one member. Variable-length arrays have no size of their own,
/// so they cannot sit inside a compound.
fn member_layout(field: &Field, types: &TypeRegistry, depth: usize) -> InteropResult<TypeLayout> {
    let ty = types.resolve(&field.ty)?;
    if let SigKind::Array { len: None, .. } = ty.kind {
        return Err(InteropError::signature(
            &field.ty.to_string(),
            0,
            format!(
                "member '{}' is a variable-length array; use a pointer or a fixed length",
                field.name.as_deref().unwrap_or("_")
            ),
        ));
    }
    layout_at_depth(&field.ty, types, depth + 1)
}

fn too_large(field: &Field) -> InteropError {
    InteropError::marshal(format!(
        "struct is too large at member '{}'",
        field.name.as_deref().unwrap_or("_")
    ))
}

/// Member layout of a struct or union signature (after resolving names).
pub fn compound_layout(sig: &TypeSig, types: &TypeRegistry) -> InteropResult<StructLayout> {
    let sig = types.resolve(sig)?;
    match &sig.kind {
        SigKind::Struct(fields) => compute_struct_layout(fields, types),
        SigKind::Union(fields) => compute_union_layout(fields, types),
        _ => Err(InteropError::marshal(format!(
            "'{}' is not a struct or union",
            *sig
        ))),
    }
}

/// Compute the layout for an array of `elem`
pub fn compute_array_layout(elem: &TypeSig, types: &TypeRegistry) -> InteropResult<ArrayLayout> {
    let elem = type_layout(elem, types)?;
    if elem.size == 0 {
        return Err(InteropError::marshal("array element has no size"));
    }
    Ok(ArrayLayout {
        element_size: elem.size,
        element_align: elem.align,
    })
}

/// Align a value up to the given alignment; `None` on overflow
#[inline]
pub fn align_up(value: usize, align: usize) -> Option<usize> {
    Some(value.checked_add(align - 1)? & !(align - 1))
}
