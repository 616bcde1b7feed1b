//! Script functions as native callbacks.
//!
//! A [`CallbackThunk`] ties one script function to one function-pointer
//! signature. Its trampoline (from the shared [`CodePool`]) bakes in the
//! thunk's own address, so the dispatch routine below can find the script
//! function, read the native arguments through the declared parameter
//! types, call the function, and write its result back in the form the
//! native caller expects.
//!
//! Thunks are owned by the script function they serve. When the function is
//! dropped its thunks are dropped too and their code slots return to the
//! pool.

use std::cell::{Cell, RefCell};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::rc::{Rc, Weak};

use crate::backend::invoke::{CallPlan, ReturnKind};
use crate::backend::thunk::CodePool;
use crate::error::{InteropError, InteropResult};
use crate::marshal::from_native::read_raw;
use crate::marshal::{ArgPassing, FromNative, SLOT_SIZE, TempAlloc, ToNative};
use crate::runtime::interop::InteropState;
use crate::runtime::value::{ScriptFunction, WeakFunction};
use crate::types::{SigKind, SigRef};

pub struct CallbackThunk {
    func: WeakFunction,
    /// Signature text; one thunk per (function, signature) pair.
    key: String,
    sig: SigRef,
    plan: CallPlan,
    code: Cell<usize>,
    pool: Weak<RefCell<CodePool>>,
    state: Weak<InteropState>,
}

impl CallbackThunk {
    /// Build the context object and its trampoline.
    pub(crate) fn create(
        func: &ScriptFunction,
        sig: SigRef,
        state: &Rc<InteropState>,
    ) -> InteropResult<Rc<Self>> {
        let Some(fsig) = sig.as_function() else {
            return Err(InteropError::marshal(format!(
                "callback signature '{}' is not a function type",
                sig
            )));
        };
        let plan = CallPlan::new(fsig, &state.types())?;
        if cfg!(target_arch = "x86") && plan.float_return() {
            return Err(InteropError::unsupported(
                "callbacks returning floating point values on x86",
            ));
        }

        let thunk = Rc::new(Self {
            func: func.downgrade(),
            key: sig.to_string(),
            sig,
            plan,
            code: Cell::new(0),
            pool: Rc::downgrade(state.code_pool()),
            state: Rc::downgrade(state),
        });
        let context = Rc::as_ptr(&thunk) as usize;
        let code = state.code_pool().borrow_mut().allocate(
            context,
            dispatch_address(),
            thunk.plan.callee_pop_bytes(),
        )?;
        thunk.code.set(code);
        log::debug!(
            "created callback thunk {:#x} for '{}' as {}",
            code,
            func.name(),
            thunk.key
        );
        Ok(thunk)
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn code_address(&self) -> usize {
        self.code.get()
    }

    pub fn signature(&self) -> &SigRef {
        &self.sig
    }

    /// Marshal the native frame into script arguments, run the function and
    /// marshal its result back.
    fn run(&self, state: &InteropState, argv: usize, fregs: usize) -> InteropResult<u64> {
        let func = self.func.upgrade().ok_or_else(|| {
            InteropError::fault("native code called a callback whose function is gone")
        })?;
        // The function must outlive this frame even if the script drops it,
        // because the trampoline still has to return through its slot.
        state.defer_drop(func.clone());
        if state.has_pending() {
            log::debug!("skipping callback '{}': an exception is pending", func.name());
            return Ok(0);
        }

        let frame = &self.plan.frame;
        let mut image: Vec<usize> = (0..frame.slots)
            .map(|i| read_raw::<usize>(argv + i * SLOT_SIZE))
            .collect();
        if cfg!(target_arch = "x86_64") {
            // Float arguments in the first four positions arrive in XMM0-3.
            for arg in frame.args.iter().filter(|a| a.is_float && a.first_slot < 4) {
                image[arg.first_slot] = read_raw::<usize>(fregs + arg.first_slot * SLOT_SIZE);
            }
        }

        let _arena = state.arenas().enter();
        let args = {
            let types = state.types();
            let reader = FromNative::new(&types, state.heap(), state.arenas())
                .with_max_string_len(state.config().max_string_len);
            let mut args = Vec::with_capacity(self.plan.params.len());
            for (param, slot) in self.plan.params.iter().zip(&frame.args) {
                let raw = image[slot.first_slot];
                let value = match slot.passing {
                    ArgPassing::Direct => {
                        reader.read(param, image[slot.first_slot..].as_ptr() as usize)?
                    }
                    ArgPassing::ByReference => {
                        let resolved = types.resolve(param)?;
                        match &resolved.kind {
                            // Decayed arrays arrive as a pointer to the first element.
                            SigKind::Array { elem, .. } => reader.wrap_pointer(raw, elem)?,
                            _ => {
                                crate::runtime::probe::check_readable(raw, 1)?;
                                reader.read(param, raw)?
                            }
                        }
                    }
                };
                args.push(value);
            }
            args
        };

        let result = func.call(&args)?;

        let types = state.types();
        let mut writer = ToNative::new(&types, TempAlloc::None, state);
        match self.plan.ret_kind {
            ReturnKind::Void => Ok(0),
            ReturnKind::Memory { .. } => {
                let dst = image[0];
                writer.write(&self.plan.ret, &result, dst)?;
                Ok(dst as u64)
            }
            ReturnKind::Register { .. } => {
                let mut out = 0u64;
                writer.write(&self.plan.ret, &result, &mut out as *mut u64 as usize)?;
                Ok(out)
            }
        }
    }
}

impl Drop for CallbackThunk {
    fn drop(&mut self) {
        let code = self.code.get();
        if code == 0 {
            return;
        }
        if let Some(pool) = self.pool.upgrade() {
            match pool.try_borrow_mut() {
                Ok(mut pool) => pool.recycle(code),
                Err(_) => log::warn!("code pool busy; leaking thunk slot {:#x}", code),
            }
        }
    }
}

fn dispatch_common(ctx: *const CallbackThunk, argv: usize, fregs: usize) -> u64 {
    // Safety: the trampoline only exists while its thunk does.
    let thunk = unsafe { &*ctx };
    let Some(state) = thunk.state.upgrade() else {
        log::warn!("callback invoked after the interop layer was dropped");
        return 0;
    };
    // Holds this thunk alive while older deferred functions are released.
    let _current = thunk.func.upgrade();
    let detached = state.enter_callback();
    if detached {
        // Callbacks fired earlier outside any call have all returned.
        state.release_deferred();
    }
    let result = catch_unwind(AssertUnwindSafe(|| thunk.run(&state, argv, fregs)));
    state.leave_callback();

    let err = match result {
        Ok(Ok(value)) => return value,
        Ok(Err(err)) => err,
        Err(_) => InteropError::fault("callback panicked"),
    };
    if detached {
        // No script call is waiting to rethrow it.
        log::warn!("callback raised outside a native call: {}", err);
    } else {
        log::debug!("callback raised: {}", err);
        state.set_pending(err);
    }
    0
}

#[cfg(target_arch = "x86_64")]
extern "win64" fn dispatch(ctx: *const CallbackThunk, argv: *const u64, fregs: *const u64) -> u64 {
    dispatch_common(ctx, argv as usize, fregs as usize)
}

#[cfg(target_arch = "x86_64")]
fn dispatch_address() -> usize {
    dispatch as usize
}

#[cfg(target_arch = "x86")]
extern "C" fn dispatch(ctx: *const CallbackThunk, argv: *const usize) -> u64 {
    dispatch_common(ctx, argv as usize, 0)
}

#[cfg(target_arch = "x86")]
fn dispatch_address() -> usize {
    dispatch as usize
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "x86")))]
fn dispatch_address() -> usize {
    dispatch_common as usize
}
