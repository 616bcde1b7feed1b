//! Stack-argument sizing.
//!
//! Every argument occupies a whole number of machine argument slots (4 bytes
//! on 32-bit targets, 8 on 64-bit). On 32-bit targets a wide value spans
//! several contiguous slots; on 64-bit targets anything wider than a slot,
//! or an aggregate whose size is not 1, 2, 4 or 8 bytes, is passed by
//! reference in a single slot, as the Microsoft x64 convention does.

use crate::backend::layout::type_layout;
use crate::error::{InteropError, InteropResult};
use crate::types::{POINTER_SIZE, Prim, SigKind, TypeRegistry, TypeSig};

/// Bytes per argument slot.
pub const SLOT_SIZE: usize = POINTER_SIZE;

const WIDE_SLOTS_BY_REFERENCE: bool = cfg!(target_pointer_width = "64");

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgPassing {
    /// The value's bytes live in the slots themselves.
    Direct,
    /// The slot holds a pointer to a temporary copy.
    ByReference,
}

/// Where one argument lives in the argument vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArgSlot {
    pub first_slot: usize,
    pub slots: usize,
    pub passing: ArgPassing,
    /// Floating point scalars are mirrored into XMM registers on x64.
    pub is_float: bool,
}

/// Slot assignment for a whole parameter list.
#[derive(Debug, Clone, Default)]
pub struct ArgFrame {
    pub slots: usize,
    pub args: Vec<ArgSlot>,
    /// Slot 0 carries a pointer to the caller-provided return area.
    pub hidden_return: bool,
}

impl ArgFrame {
    pub fn byte_size(&self) -> usize {
        self.slots * SLOT_SIZE
    }
}

/// Accumulates slot counts for an argument list.
pub struct StackArgSizer<'a> {
    types: &'a TypeRegistry,
    frame: ArgFrame,
}

impl<'a> StackArgSizer<'a> {
    pub fn new(types: &'a TypeRegistry) -> Self {
        Self {
            types,
            frame: ArgFrame::default(),
        }
    }

    /// Reserve the leading slot for a hidden struct-return pointer.
    pub fn add_hidden_return(&mut self) {
        debug_assert!(self.frame.args.is_empty());
        self.frame.hidden_return = true;
        self.frame.slots += 1;
    }

    /// Size one parameter and append it to the frame.
    pub fn add(&mut self, sig: &TypeSig) -> InteropResult<ArgSlot> {
        let sig = self.types.resolve(sig)?;
        let (slots, passing, is_float) = match &sig.kind {
            SigKind::Prim(Prim::Void) => {
                return Err(InteropError::marshal("'void' is not a valid parameter type"));
            }
            SigKind::Function(_) => {
                return Err(InteropError::marshal(
                    "functions cannot be passed by value; use a function pointer",
                ));
            }
            // Arrays decay to a pointer to their first element.
            SigKind::Array { .. } => (1, ArgPassing::ByReference, false),
            SigKind::Struct(_) | SigKind::Union(_) => {
                let size = type_layout(&sig, self.types)?.size;
                if WIDE_SLOTS_BY_REFERENCE {
                    if matches!(size, 1 | 2 | 4 | 8) {
                        (1, ArgPassing::Direct, false)
                    } else {
                        (1, ArgPassing::ByReference, false)
                    }
                } else {
                    (size.div_ceil(SLOT_SIZE).max(1), ArgPassing::Direct, false)
                }
            }
            SigKind::Prim(p) => {
                let size = p.size();
                if size <= SLOT_SIZE {
                    (1, ArgPassing::Direct, p.is_float())
                } else if WIDE_SLOTS_BY_REFERENCE {
                    (1, ArgPassing::ByReference, false)
                } else {
                    (size.div_ceil(SLOT_SIZE), ArgPassing::Direct, p.is_float())
                }
            }
            SigKind::String(_) | SigKind::Pointer(_) | SigKind::Reference(_) => {
                (1, ArgPassing::Direct, false)
            }
            SigKind::Named(_) => unreachable!("resolved above"),
        };

        let slot = ArgSlot {
            first_slot: self.frame.slots,
            slots,
            passing,
            is_float,
        };
        self.frame.slots += slots;
        self.frame.args.push(slot);
        Ok(slot)
    }

    pub fn slot_count(&self) -> usize {
        self.frame.slots
    }

    pub fn finish(self) -> ArgFrame {
        self.frame
    }
}

/// Reject parameter types that can only be passed through a pointer.
///
/// The sizer can describe aggregates, but the invoker only marshals scalars,
/// strings, pointers and decayed arrays into argument slots.
pub fn check_passable(sig: &TypeSig, types: &TypeRegistry) -> InteropResult<()> {
    let sig = types.resolve(sig)?;
    match &sig.kind {
        SigKind::Prim(Prim::Void) => Err(InteropError::marshal(
            "'void' is not a valid parameter type",
        )),
        SigKind::Struct(_) | SigKind::Union(_) => Err(InteropError::marshal(format!(
            "struct/union parameter '{}' must be passed by pointer or reference",
            *sig
        ))),
        SigKind::Function(_) => Err(InteropError::marshal(
            "functions cannot be passed by value; use a function pointer",
        )),
        _ => Ok(()),
    }
}

/// Whether a return value of this type comes back through a hidden pointer.
pub fn returns_in_memory(sig: &TypeSig, types: &TypeRegistry) -> InteropResult<bool> {
    let sig = types.resolve(sig)?;
    match &sig.kind {
        SigKind::Struct(_) | SigKind::Union(_) => {
            let size = type_layout(&sig, types)?.size;
            Ok(!matches!(size, 1 | 2 | 4 | 8))
        }
        SigKind::Array { .. } => Err(InteropError::marshal("functions cannot return arrays")),
        SigKind::Function(_) => Err(InteropError::marshal(
            "functions cannot return functions; use a function pointer",
        )),
        _ => Ok(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::parse_signature;

    fn frame_for(params: &[&str]) -> InteropResult<ArgFrame> {
        let types = TypeRegistry::new();
        let mut sizer = StackArgSizer::new(&types);
        for p in params {
            sizer.add(&parse_signature(p).unwrap())?;
        }
        Ok(sizer.finish())
    }

    #[test]
    fn test_scalars_take_one_slot() {
        let frame = frame_for(&["c", "s", "i", "f", "t", "*i", "H"]).unwrap();
        assert_eq!(frame.slots, 7);
        assert!(frame.args.iter().all(|a| a.slots == 1));
        assert!(frame.args[3].is_float);
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn test_x64_wide_aggregates_become_references() {
        let frame = frame_for(&["{S a:[9]c}", "{S a:i b:i}", "l"]).unwrap();
        assert_eq!(frame.slots, 3);
        assert_eq!(frame.args[0].slots, 1);
        assert_eq!(frame.args[0].passing, ArgPassing::ByReference);
        assert_eq!(frame.args[1].passing, ArgPassing::Direct);
        assert_eq!(frame.args[2].passing, ArgPassing::Direct);
    }

    #[cfg(target_pointer_width = "32")]
    #[test]
    fn test_x86_wide_values_span_slots() {
        let frame = frame_for(&["{S a:i b:i c:c}", "l", "d"]).unwrap();
        assert_eq!(frame.args[0].slots, 3);
        assert_eq!(frame.args[1].slots, 2);
        assert_eq!(frame.slots, 7);
    }

    #[test]
    fn test_arrays_decay() {
        let frame = frame_for(&["[16]c"]).unwrap();
        assert_eq!(frame.args[0].passing, ArgPassing::ByReference);
        assert_eq!(frame.slots, 1);
    }

    #[test]
    fn test_void_and_function_rejected() {
        assert!(frame_for(&["v"]).unwrap_err().is_marshal());
        assert!(frame_for(&["(Ci)"]).unwrap_err().is_marshal());
    }

    #[test]
    fn test_hidden_return_reserves_first_slot() {
        let types = TypeRegistry::new();
        let mut sizer = StackArgSizer::new(&types);
        sizer.add_hidden_return();
        let slot = sizer.add(&parse_signature("i").unwrap()).unwrap();
        assert_eq!(slot.first_slot, 1);
        assert!(sizer.finish().hidden_return);
    }

    #[test]
    fn test_check_passable() {
        let types = TypeRegistry::new();
        let ok = parse_signature("*{S a:i}").unwrap();
        let by_value = parse_signature("{S a:i}").unwrap();
        assert!(check_passable(&ok, &types).is_ok());
        assert!(check_passable(&by_value, &types).unwrap_err().is_marshal());
    }

    #[test]
    fn test_returns_in_memory() {
        let types = TypeRegistry::new();
        let small = parse_signature("{S a:i b:i}").unwrap();
        let large = parse_signature("{S a:d b:d c:d}").unwrap();
        assert!(!returns_in_memory(&small, &types).unwrap());
        assert!(returns_in_memory(&large, &types).unwrap());
        assert!(!returns_in_memory(&parse_signature("d").unwrap(), &types).unwrap());
    }
}
