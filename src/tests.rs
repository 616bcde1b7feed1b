use std::cell::{Cell, RefCell};
use std::fs;
use std::path::Path;
use std::rc::Rc;
use std::time::{Duration, Instant};

use tempfile::TempDir;

use crate::engine::{Engine, EngineConfig, ScriptHost};
use crate::error::{InteropError, InteropResult};
use crate::module::{ModuleError, ModuleRecord, ModuleState};
use crate::runtime::{Interop, ScriptFunction, ScriptValue, TaskId};

/// Host that records what the engine asked it to do.
#[derive(Default)]
struct TestHost {
    evaluated: RefCell<Vec<String>>,
    errors: RefCell<Vec<String>>,
}

impl ScriptHost for TestHost {
    fn evaluate_module(&self, module: &ModuleRecord) -> InteropResult<()> {
        let name = module
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.evaluated.borrow_mut().push(name);
        Ok(())
    }

    fn module_error(&self, _module: Option<&ModuleRecord>, error: &ModuleError) {
        self.errors.borrow_mut().push(error.to_string());
    }

    fn report_error(&self, error: &InteropError) {
        self.errors.borrow_mut().push(error.to_string());
    }
}

fn write(dir: &Path, name: &str, source: &str) {
    fs::write(dir.join(name), source).unwrap();
}

fn later(millis: u64) -> Instant {
    Instant::now() + Duration::from_millis(millis)
}

// ============================================================================
// Modules
// ============================================================================

#[test]
fn test_diamond_imports_load_each_module_once() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "main.js", "import './left.js';\nimport { r } from './right';\n");
    write(dir.path(), "left.js", "import { s } from './shared.js';\nexport const l = s;\n");
    write(dir.path(), "right.js", "export * from './shared';\nexport const r = 2;\n");
    write(dir.path(), "shared.js", "export const s = 1;\n");

    let engine = Engine::new(TestHost::default(), EngineConfig::default());
    let entry = dir.path().join("main.js");
    let root = engine.load_entry(entry.to_str().unwrap()).unwrap();
    engine.run_event_loop();

    let modules = engine.modules();
    assert_eq!(modules.len(), 4);
    assert_eq!(modules.parse_count(), 4);
    assert!(modules.records().iter().all(|r| r.state == ModuleState::Evaluated));
    assert_eq!(modules.get(root).unwrap().imports.len(), 2);

    let evaluated = engine.host().evaluated.borrow();
    assert_eq!(evaluated.len(), 4);
    assert_eq!(evaluated.first().map(String::as_str), Some("shared.js"));
    assert_eq!(evaluated.last().map(String::as_str), Some("main.js"));
    assert!(engine.host().errors.borrow().is_empty());
}

#[test]
fn test_second_load_reuses_records() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "a.js", "import './b.js';\n");
    write(dir.path(), "b.js", "export default 1;\n");

    let engine = Engine::new(TestHost::default(), EngineConfig::default());
    let entry = dir.path().join("a.js");
    let first = engine.load_entry(entry.to_str().unwrap()).unwrap();
    engine.run_event_loop();
    let second = engine.load_entry(entry.to_str().unwrap()).unwrap();
    engine.run_event_loop();

    assert_eq!(first, second);
    assert_eq!(engine.modules().parse_count(), 2);
    assert_eq!(engine.host().evaluated.borrow().len(), 2);
}

#[test]
fn test_syntax_error_fails_the_graph() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "main.js", "import './broken.js';\n");
    write(dir.path(), "broken.js", "export const = ;\n");

    let engine = Engine::new(TestHost::default(), EngineConfig::default());
    let entry = dir.path().join("main.js");
    engine.load_entry(entry.to_str().unwrap()).unwrap();
    engine.run_event_loop();

    assert!(engine.host().evaluated.borrow().is_empty());
    let errors = engine.host().errors.borrow();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains("broken.js"));
}

#[test]
fn test_missing_import_is_reported() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "main.js", "import './nowhere';\n");

    let engine = Engine::new(TestHost::default(), EngineConfig::default());
    let entry = dir.path().join("main.js");
    engine.load_entry(entry.to_str().unwrap()).unwrap();
    engine.run_event_loop();

    assert!(engine.host().evaluated.borrow().is_empty());
    assert!(engine.host().errors.borrow()[0].contains("nowhere"));
    assert!(engine.load_entry("./definitely-not-here.js").unwrap_err().is_not_found());
}

// ============================================================================
// Timers
// ============================================================================

#[test]
fn test_interval_cancels_itself() {
    let engine = Engine::new(TestHost::default(), EngineConfig::default());
    let fired = Rc::new(Cell::new(0));
    let own_id: Rc<Cell<Option<TaskId>>> = Rc::new(Cell::new(None));

    let scheduler = engine.scheduler().clone();
    let (f, id) = (fired.clone(), own_id.clone());
    let tick = ScriptFunction::new("tick", move |_| {
        f.set(f.get() + 1);
        if f.get() == 3 {
            if let Some(id) = id.get() {
                scheduler.cancel(id);
            }
        }
        Ok(ScriptValue::Undefined)
    });
    own_id.set(Some(engine.set_interval(tick, 1.0, vec![])));

    engine.run_event_loop();
    assert_eq!(fired.get(), 3);
    assert!(!engine.scheduler().has_work());
}

#[test]
fn test_timeouts_run_in_deadline_order() {
    let engine = Engine::new(TestHost::default(), EngineConfig::default());
    let order = Rc::new(RefCell::new(Vec::new()));
    let record = |label: &'static str| {
        let order = order.clone();
        ScriptFunction::new(label, move |_| {
            order.borrow_mut().push(label);
            Ok(ScriptValue::Undefined)
        })
    };

    engine.set_timeout(record("slow"), 20.0, vec![]);
    engine.set_timeout(record("fast"), 0.0, vec![]);
    engine.enqueue_promise_job(record("promise"), vec![]);
    engine.run_event_loop();

    assert_eq!(*order.borrow(), ["fast", "promise", "slow"]);
}

#[test]
fn test_timeout_cancels_interval_due_in_same_sweep() {
    let engine = Engine::new(TestHost::default(), EngineConfig::default());
    let fired = Rc::new(Cell::new(0));
    let f = fired.clone();
    let tick = ScriptFunction::new("tick", move |_| {
        f.set(f.get() + 1);
        Ok(ScriptValue::Undefined)
    });
    let interval = engine.set_interval(tick, 10.0, vec![]);

    let scheduler = engine.scheduler().clone();
    let stopped = Rc::new(Cell::new(false));
    let s = stopped.clone();
    let stop = ScriptFunction::new("stop", move |_| {
        s.set(scheduler.cancel(interval));
        Ok(ScriptValue::Undefined)
    });
    engine.set_timeout(stop, 10.0, vec![]);

    // Both are due in the first sweep; the interval runs first.
    engine.run_ready(later(1_000));
    assert!(stopped.get());
    engine.run_ready(later(2_000));
    engine.run_ready(later(3_000));
    assert_eq!(fired.get(), 1);
    assert!(!engine.scheduler().is_pending(interval));
}

#[test]
fn test_task_errors_reach_the_host() {
    let engine = Engine::new(TestHost::default(), EngineConfig::default());
    let boom = ScriptFunction::new("boom", |_| Err(InteropError::thrown("boom")));
    engine.set_timeout(boom, 0.0, vec![]);
    engine.run_event_loop();
    assert_eq!(engine.host().errors.borrow().len(), 1);
}

// ============================================================================
// Native heap lifecycle
// ============================================================================

#[test]
fn test_pointer_field_keeps_target_alive() {
    let engine = Engine::new(TestHost::default(), EngineConfig::default());
    let interop = engine.interop();
    interop.define_type("Node", "{S value:i next:*@Node}").unwrap();

    let a = interop.create("@Node").unwrap();
    let b = interop.create("@Node").unwrap();
    interop.set_field(&b, "value", &ScriptValue::Number(7.0)).unwrap();
    interop.set_field(&a, "next", &b).unwrap();

    // B's wrapper goes away, but A still points at it.
    drop(b);
    engine.run_ready(later(1_000));
    assert_eq!(interop.heap_stats().live_buffers, 2);

    let next = interop.get_field(&a, "next").unwrap();
    let node = interop.pointer_at(&next).unwrap();
    assert_eq!(interop.get_field(&node, "value").unwrap(), ScriptValue::Number(7.0));
    drop(node);
    drop(next);

    drop(a);
    engine.run_ready(later(2_000));
    assert_eq!(interop.heap_stats().live_buffers, 0);
    assert!(interop.heap_stats().scans >= 2);
}

#[test]
fn test_plain_object_stored_into_pointer_field() {
    let interop = Interop::default();
    interop.define_type("Node", "{S value:i next:*@Node}").unwrap();
    let head = interop.create("@Node").unwrap();

    let tail = ScriptValue::object(vec![("value", 3.into()), ("next", ScriptValue::Null)]);
    interop.set_field(&head, "next", &tail).unwrap();
    assert_eq!(interop.heap_stats().live_buffers, 2);

    // The detached copy survives scans while the head refers to it.
    interop.collect_garbage();
    assert_eq!(interop.heap_stats().live_buffers, 2);
    let next = interop.get_field(&head, "next").unwrap();
    let node = interop.pointer_at(&next).unwrap();
    assert_eq!(interop.get_field(&node, "value").unwrap(), ScriptValue::Number(3.0));

    interop.set_field(&head, "next", &ScriptValue::Null).unwrap();
    drop(node);
    drop(next);
    interop.collect_garbage();
    assert_eq!(interop.heap_stats().live_buffers, 1);
}

#[test]
fn test_pointer_wrapper_is_a_root() {
    let interop = Interop::default();
    let obj = interop.create("[4]i").unwrap();
    interop.set_index(&obj, 3, &ScriptValue::Number(12.0)).unwrap();
    let ptr = interop.address_of(&obj).unwrap();
    drop(obj);

    assert_eq!(interop.collect_garbage().freed, 0);
    let view = interop.pointer_cast(&ptr, "i").unwrap();
    let items = interop.pointer_to_array(&view, 4).unwrap();
    assert_eq!(interop.get_index(&items, 3).unwrap(), ScriptValue::Number(12.0));

    drop(items);
    drop(view);
    drop(ptr);
    assert_eq!(interop.collect_garbage().freed, 1);
}

#[test]
fn test_pointer_access_stays_inside_its_object() {
    let interop = Interop::default();
    let byte = interop.create("c").unwrap();
    let ptr = interop.address_of(&byte).unwrap();
    let wide = interop.pointer_cast(&ptr, "d").unwrap();

    let err = interop.pointer_store(&wide, &ScriptValue::Number(1e300)).unwrap_err();
    assert!(err.is_fault());
    assert!(interop.pointer_at(&wide).unwrap_err().is_fault());
    assert!(interop.pointer_to_array(&ptr, 2).unwrap_err().is_fault());
    assert_eq!(interop.pointer_at(&ptr).unwrap(), ScriptValue::Number(0.0));

    // Interior pointers get the bytes left after their offset.
    let ints = interop.create("[4]i").unwrap();
    let base = interop.pointer_cast(&interop.address_of(&ints).unwrap(), "i").unwrap();
    let items = interop.pointer_to_array(&base, 4).unwrap();
    interop.set_index(&items, 3, &ScriptValue::Number(9.0)).unwrap();
    assert!(interop.pointer_to_array(&base, 5).unwrap_err().is_fault());

    let text = interop.create("[4]c").unwrap();
    let chars = interop.pointer_cast(&interop.address_of(&text).unwrap(), "[]C").unwrap();
    interop.pointer_store(&chars, &ScriptValue::string("abc")).unwrap();
    let err = interop.pointer_store(&chars, &ScriptValue::string("abcdefgh")).unwrap_err();
    assert!(err.is_fault());
}

#[test]
fn test_variable_array_member_is_rejected() {
    let interop = Interop::default();
    assert!(interop.sizeof("{S n:i data:[]C}").unwrap_err().is_signature());

    let init = ScriptValue::object(vec![("n", 1.into()), ("data", ScriptValue::string(&"A".repeat(64)))]);
    assert!(interop.create_with("{S n:i data:[]C}", &init).is_err());
    assert_eq!(interop.heap_stats().live_buffers, 0);

    // A top-level variable array still takes its length from the value.
    let text = interop.create_with("[]C", &ScriptValue::string("hello")).unwrap();
    assert_eq!(interop.sizeof("[]C").unwrap(), 0);
    drop(text);
}

// ============================================================================
// Native calls and callbacks
// ============================================================================

#[cfg(target_arch = "x86_64")]
mod native {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[repr(C)]
    struct Point {
        x: i32,
        y: i32,
    }

    extern "win64" fn scale(p: *mut Point, k: i32) {
        let p = unsafe { &mut *p };
        p.x *= k;
        p.y *= k;
    }

    extern "win64" fn echo(p: *mut Point) -> *mut Point {
        p
    }

    extern "win64" fn length(s: *const u8) -> i32 {
        let mut n = 0;
        while unsafe { *s.add(n) } != 0 {
            n += 1;
        }
        n as i32
    }

    extern "win64" fn mix(a: f64, b: i32, c: f32) -> f64 {
        a * b as f64 + c as f64
    }

    extern "win64" fn add64(a: u64, b: u64) -> u64 {
        a.wrapping_add(b)
    }

    extern "win64" fn apply(cb: extern "win64" fn(i32) -> i32, x: i32) -> i32 {
        cb(x) + 1
    }

    extern "win64" fn apply_twice(cb: extern "win64" fn(i32) -> i32, x: i32) -> i32 {
        cb(x) + cb(x)
    }

    extern "win64" fn apply_float(cb: extern "win64" fn(f64, i32) -> f64, x: f64) -> f64 {
        cb(x, 4)
    }

    extern "win64" fn visit(cb: extern "win64" fn(*mut Point) -> i32, p: *mut Point) -> i32 {
        cb(p)
    }

    static STORED_CALLBACK: AtomicUsize = AtomicUsize::new(0);

    extern "win64" fn remember(cb: extern "win64" fn(i32) -> i32) {
        STORED_CALLBACK.store(cb as usize, Ordering::SeqCst);
    }

    fn bind(interop: &Interop, addr: usize, sig: &str) -> ScriptValue {
        interop.bind_address(addr, sig).unwrap()
    }

    #[test]
    fn test_scalar_calls() {
        let interop = Interop::default();
        let f = bind(&interop, length as usize, "(Ci t)");
        assert_eq!(
            interop.invoke(&f, &[ScriptValue::string("hello")]).unwrap(),
            ScriptValue::Number(5.0)
        );

        let f = bind(&interop, mix as usize, "(Cd d i f)");
        let out = interop.invoke(&f, &[1.5.into(), 4.into(), 0.25.into()]).unwrap();
        assert_eq!(out, ScriptValue::Number(6.25));

        let f = bind(&interop, add64 as usize, "(CL L L)");
        let out = interop
            .invoke(&f, &[ScriptValue::UInt64(u64::MAX - 1), ScriptValue::UInt64(1)])
            .unwrap();
        assert_eq!(out, ScriptValue::UInt64(u64::MAX));
    }

    #[test]
    fn test_struct_through_pointer() {
        let interop = Interop::default();
        interop.define_type("Point", "{S x:i y:i}").unwrap();
        let p = interop.create("@Point").unwrap();
        interop.set_field(&p, "x", &3.into()).unwrap();
        interop.set_field(&p, "y", &(-4).into()).unwrap();

        let f = bind(&interop, scale as usize, "(Cv *@Point i)");
        assert_eq!(interop.invoke(&f, &[p.clone(), 10.into()]).unwrap(), ScriptValue::Undefined);
        assert_eq!(interop.get_field(&p, "x").unwrap(), ScriptValue::Number(30.0));
        assert_eq!(interop.get_field(&p, "y").unwrap(), ScriptValue::Number(-40.0));

        let f = bind(&interop, echo as usize, "(C*@Point *@Point)");
        let back = interop.invoke(&f, &[p.clone()]).unwrap();
        let view = interop.pointer_at(&back).unwrap();
        assert_eq!(interop.get_field(&view, "y").unwrap(), ScriptValue::Number(-40.0));
    }

    #[test]
    fn test_call_with_explicit_signature() {
        let interop = Interop::default();
        let f = ScriptValue::Handle(length as usize);
        let out = interop.call(&f, "(Ci t)", &[ScriptValue::string("abc")]).unwrap();
        assert_eq!(out, ScriptValue::Number(3.0));
        assert!(interop.invoke(&f, &[]).unwrap_err().is_marshal());
    }

    #[test]
    fn test_callback_round_trip() {
        let interop = Interop::default();
        let double = ScriptFunction::new("double", |args| {
            let n = args[0].as_number().unwrap_or(0.0);
            Ok(ScriptValue::Number(n * 2.0))
        });
        let f = bind(&interop, apply as usize, "(Ci *(Ci i) i)");

        let out = interop
            .invoke(&f, &[ScriptValue::Function(double.clone()), 20.into()])
            .unwrap();
        assert_eq!(out, ScriptValue::Number(41.0));
        let out = interop
            .invoke(&f, &[ScriptValue::Function(double.clone()), (-3).into()])
            .unwrap();
        assert_eq!(out, ScriptValue::Number(-5.0));

        // One trampoline per (function, signature).
        assert_eq!(double.thunk_count(), 1);
        assert_eq!(interop.code_pool_stats().live_slots, 1);

        drop(double);
        assert_eq!(interop.code_pool_stats().live_slots, 0);
    }

    #[test]
    fn test_float_callback() {
        let interop = Interop::default();
        let scale = ScriptFunction::new("scale", |args| {
            let x = args[0].as_number().unwrap_or(0.0);
            let k = args[1].as_number().unwrap_or(0.0);
            Ok(ScriptValue::Number(x * k))
        });
        let f = bind(&interop, apply_float as usize, "(Cd *(Cd d i) d)");
        let out = interop.invoke(&f, &[ScriptValue::Function(scale), 2.5.into()]).unwrap();
        assert_eq!(out, ScriptValue::Number(10.0));
    }

    #[test]
    fn test_callback_reads_struct_argument() {
        let interop = Interop::default();
        interop.define_type("Point", "{S x:i y:i}").unwrap();
        let p = interop.create("@Point").unwrap();
        interop.set_field(&p, "x", &6.into()).unwrap();
        interop.set_field(&p, "y", &7.into()).unwrap();

        let inner = interop.clone();
        let sum = ScriptFunction::new("sum", move |args| {
            let point = inner.pointer_at(&args[0])?;
            let x = inner.get_field(&point, "x")?.as_number().unwrap_or(0.0);
            let y = inner.get_field(&point, "y")?.as_number().unwrap_or(0.0);
            Ok(ScriptValue::Number(x + y))
        });
        let f = bind(&interop, visit as usize, "(Ci *(Ci *@Point) *@Point)");
        let out = interop.invoke(&f, &[ScriptValue::Function(sum), p]).unwrap();
        assert_eq!(out, ScriptValue::Number(13.0));
    }

    #[test]
    fn test_callback_exception_propagates() {
        let interop = Interop::default();
        let calls = Rc::new(Cell::new(0));
        let c = calls.clone();
        let fail = ScriptFunction::new("fail", move |_| {
            c.set(c.get() + 1);
            Err(InteropError::thrown("boom"))
        });
        let f = bind(&interop, apply_twice as usize, "(Ci *(Ci i) i)");

        let err = interop
            .invoke(&f, &[ScriptValue::Function(fail.clone()), 1.into()])
            .unwrap_err();
        match err {
            InteropError::Thrown(value) => assert_eq!(value, ScriptValue::string("boom")),
            other => panic!("expected a thrown value, got {:?}", other),
        }
        // The second callback is skipped while the first error is pending.
        assert_eq!(calls.get(), 1);

        // The error does not leak into the next call.
        let ok = ScriptFunction::new("ok", |_| Ok(ScriptValue::Number(1.0)));
        let out = interop.invoke(&f, &[ScriptValue::Function(ok), 1.into()]).unwrap();
        assert_eq!(out, ScriptValue::Number(2.0));
    }

    #[test]
    fn test_stored_callback_error_stays_with_its_firing() {
        let interop = Interop::default();
        let late = ScriptFunction::new("late", |_| Err(InteropError::thrown("late")));
        let keep = bind(&interop, remember as usize, "(Cv *(Ci i))");
        interop.invoke(&keep, &[ScriptValue::Function(late.clone())]).unwrap();

        // Native code fires the callback later, outside any script call.
        let stored: extern "win64" fn(i32) -> i32 =
            unsafe { std::mem::transmute(STORED_CALLBACK.load(Ordering::SeqCst)) };
        assert_eq!(stored(5), 0);

        let f = bind(&interop, add64 as usize, "(CL L L)");
        let out = interop
            .invoke(&f, &[ScriptValue::UInt64(1), ScriptValue::UInt64(2)])
            .unwrap();
        assert_eq!(out, ScriptValue::UInt64(3));
        drop(late);
    }

    #[test]
    fn test_callback_requires_function_pointer_type() {
        let interop = Interop::default();
        let f = bind(&interop, apply as usize, "(Ci *i i)");
        let noop = ScriptFunction::new("noop", |_| Ok(ScriptValue::Undefined));
        let err = interop
            .invoke(&f, &[ScriptValue::Function(noop), 1.into()])
            .unwrap_err();
        assert!(err.is_marshal());
    }
}
