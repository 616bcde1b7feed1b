//! Raw transfer of control to native code.
//!
//! This is the only place that builds a machine call frame by hand. The
//! caller hands over a flat slice of argument slots already filled in by the
//! marshaller; the shim copies them into registers and onto the stack and
//! returns the raw result registers.
//!
//! - x86_64: Microsoft x64 convention. Slots 0..4 go to RCX, RDX, R8, R9
//!   and are mirrored into XMM0..XMM3; the rest follow the 32-byte shadow
//!   area on the stack. Stdcall and cdecl are the same convention here.
//! - x86: the slots are pushed onto the stack. ESP is restored from a
//!   callee-saved register afterwards, so callee-pops (stdcall) and
//!   caller-pops (cdecl) both come out balanced. Float results are popped
//!   off the x87 stack as a double.

use crate::error::{InteropError, InteropResult};
use crate::types::CallConv;

/// Result registers after a native call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RawReturn {
    /// RAX, or EDX:EAX on x86.
    pub int: u64,
    /// Bit pattern of XMM0 (x64) or ST(0) stored as a double (x86).
    pub float: u64,
}

/// Call `func` with the prepared argument slots.
///
/// # Safety
/// `func` must be a function using `conv` whose parameters match the
/// layout of `slots`. Any pointers stored in `slots` must be valid for the
/// duration of the call.
pub unsafe fn invoke(
    func: usize,
    conv: CallConv,
    slots: &[usize],
    float_return: bool,
) -> InteropResult<RawReturn> {
    if !conv.is_implemented() {
        return Err(InteropError::unsupported(format!(
            "calling convention '{}'",
            conv.code()
        )));
    }
    if func == 0 {
        return Err(InteropError::fault("call through a null function pointer"));
    }
    unsafe { invoke_arch(func, slots, float_return) }
}

#[cfg(target_arch = "x86_64")]
unsafe fn invoke_arch(func: usize, slots: &[usize], _float_return: bool) -> InteropResult<RawReturn> {
    // The register loads always read four slots.
    let mut padded = [0usize; 4];
    let args: &[usize] = if slots.len() < 4 {
        padded[..slots.len()].copy_from_slice(slots);
        &padded
    } else {
        slots
    };
    let stack_args = args.len() - 4;

    let rax: u64;
    let xmm0: f64;
    unsafe {
        core::arch::asm!(
            "mov r12, rsp",
            "lea rax, [r14*8 + 47]",
            "and rax, -16",
            "sub rsp, rax",
            "and rsp, -16",
            "xor ecx, ecx",
            "2:",
            "cmp rcx, r14",
            "jae 3f",
            "mov rax, [r13 + rcx*8 + 32]",
            "mov [rsp + rcx*8 + 32], rax",
            "inc rcx",
            "jmp 2b",
            "3:",
            "mov rcx, [r13]",
            "mov rdx, [r13 + 8]",
            "mov r8, [r13 + 16]",
            "mov r9, [r13 + 24]",
            "movq xmm0, rcx",
            "movq xmm1, rdx",
            "movq xmm2, r8",
            "movq xmm3, r9",
            "call r15",
            "mov rsp, r12",
            in("r13") args.as_ptr(),
            in("r14") stack_args,
            in("r15") func,
            out("r12") _,
            lateout("rax") rax,
            lateout("xmm0") xmm0,
            clobber_abi("win64"),
        );
    }
    Ok(RawReturn {
        int: rax,
        float: xmm0.to_bits(),
    })
}

#[cfg(target_arch = "x86")]
unsafe fn invoke_arch(func: usize, slots: &[usize], float_return: bool) -> InteropResult<RawReturn> {
    let bytes = slots.len() * 4;
    let lo: u32;
    let hi: u32;
    unsafe {
        if float_return {
            core::arch::asm!(
                "mov edi, esp",
                "sub esp, ecx",
                "and esp, -16",
                "add esp, ecx",
                "2:",
                "test ecx, ecx",
                "jz 3f",
                "sub ecx, 4",
                "push dword ptr [eax + ecx]",
                "jmp 2b",
                "3:",
                "call edx",
                "mov esp, edi",
                "sub esp, 8",
                "fstp qword ptr [esp]",
                "pop eax",
                "pop edx",
                inout("eax") slots.as_ptr() => lo,
                inout("ecx") bytes => _,
                inout("edx") func => hi,
                out("edi") _,
                clobber_abi("C"),
            );
        } else {
            core::arch::asm!(
                "mov edi, esp",
                "sub esp, ecx",
                "and esp, -16",
                "add esp, ecx",
                "2:",
                "test ecx, ecx",
                "jz 3f",
                "sub ecx, 4",
                "push dword ptr [eax + ecx]",
                "jmp 2b",
                "3:",
                "call edx",
                "mov esp, edi",
                inout("eax") slots.as_ptr() => lo,
                inout("ecx") bytes => _,
                inout("edx") func => hi,
                out("edi") _,
                clobber_abi("C"),
            );
        }
    }
    let bits = (u64::from(hi) << 32) | u64::from(lo);
    Ok(RawReturn {
        int: bits,
        float: if float_return { bits } else { 0 },
    })
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "x86")))]
unsafe fn invoke_arch(_func: usize, _slots: &[usize], _float_return: bool) -> InteropResult<RawReturn> {
    Err(InteropError::unsupported(format!(
        "native calls on {}",
        std::env::consts::ARCH
    )))
}

#[cfg(all(test, target_arch = "x86_64"))]
mod tests {
    use super::*;

    extern "win64" fn add3(a: i32, b: i32, c: i32) -> i32 {
        a + b + c
    }

    extern "win64" fn sum6(a: i64, b: i64, c: i64, d: i64, e: i64, f: i64) -> i64 {
        a + 2 * b + 3 * c + 4 * d + 5 * e + 6 * f
    }

    extern "win64" fn scale(x: f64, factor: f64) -> f64 {
        x * factor
    }

    extern "win64" fn mixed(a: i32, x: f64, b: i32, y: f32, c: i64) -> f64 {
        a as f64 + x + b as f64 + y as f64 + c as f64
    }

    #[test]
    fn test_register_arguments() {
        let r = unsafe { invoke(add3 as usize, CallConv::Cdecl, &[1, 2, 3], false) }.unwrap();
        assert_eq!(r.int as i32, 6);
    }

    #[test]
    fn test_stack_arguments() {
        let r = unsafe { invoke(sum6 as usize, CallConv::Stdcall, &[1, 1, 1, 1, 1, 1], false) }
            .unwrap();
        assert_eq!(r.int as i64, 21);
    }

    #[test]
    fn test_float_registers() {
        let slots = [2.5f64.to_bits() as usize, 4.0f64.to_bits() as usize];
        let r = unsafe { invoke(scale as usize, CallConv::Cdecl, &slots, true) }.unwrap();
        assert_eq!(f64::from_bits(r.float), 10.0);
    }

    #[test]
    fn test_mixed_arguments() {
        let slots = [
            1usize,
            0.5f64.to_bits() as usize,
            2,
            1.5f32.to_bits() as usize,
            10,
        ];
        let r = unsafe { invoke(mixed as usize, CallConv::Cdecl, &slots, true) }.unwrap();
        assert_eq!(f64::from_bits(r.float), 15.0);
    }

    #[test]
    fn test_unimplemented_convention() {
        let err = unsafe { invoke(add3 as usize, CallConv::Fastcall, &[], false) }.unwrap_err();
        assert!(matches!(err, InteropError::Unsupported(_)));
    }

    #[test]
    fn test_null_function() {
        let err = unsafe { invoke(0, CallConv::Cdecl, &[], false) }.unwrap_err();
        assert!(err.is_fault());
    }
}
