// Script-side values as seen by the interop layer.
//
// The guest engine owns the real objects; this enum is the boundary model the
// marshallers consume and produce. Reference types share storage through `Rc`
// so identity (needed for per-call by-reference reuse) is the `Rc` address.

use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

use crate::error::InteropResult;
use crate::runtime::callback::CallbackThunk;
use crate::runtime::native::{NativeFunction, NativeObject, NativePointer};

/// Object properties in insertion order.
pub type PropertyMap = Vec<(String, ScriptValue)>;

pub type NativeFn = dyn Fn(&[ScriptValue]) -> InteropResult<ScriptValue>;

#[derive(Clone)]
pub enum ScriptValue {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(Rc<str>),
    Array(ScriptArray),
    Object(ScriptObject),
    Function(ScriptFunction),
    /// Full-precision signed 64-bit integer.
    Int64(i64),
    /// Full-precision unsigned 64-bit integer.
    UInt64(u64),
    Handle(usize),
    Pointer(Rc<NativePointer>),
    NativeObject(Rc<NativeObject>),
    NativeFunction(Rc<NativeFunction>),
}

impl ScriptValue {
    pub fn string(s: &str) -> Self {
        ScriptValue::String(Rc::from(s))
    }

    pub fn array(items: Vec<ScriptValue>) -> Self {
        ScriptValue::Array(ScriptArray::new(items))
    }

    pub fn object(props: Vec<(&str, ScriptValue)>) -> Self {
        ScriptValue::Object(ScriptObject::new(
            props.into_iter().map(|(k, v)| (k.to_string(), v)).collect(),
        ))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            ScriptValue::Undefined => "undefined",
            ScriptValue::Null => "null",
            ScriptValue::Bool(_) => "boolean",
            ScriptValue::Number(_) => "number",
            ScriptValue::String(_) => "string",
            ScriptValue::Array(_) => "array",
            ScriptValue::Object(_) => "object",
            ScriptValue::Function(_) => "function",
            ScriptValue::Int64(_) => "Int64",
            ScriptValue::UInt64(_) => "UInt64",
            ScriptValue::Handle(_) => "HANDLE",
            ScriptValue::Pointer(_) => "NativePointer",
            ScriptValue::NativeObject(_) => "NativeObject",
            ScriptValue::NativeFunction(_) => "NativeFunction",
        }
    }

    pub fn is_nullish(&self) -> bool {
        matches!(self, ScriptValue::Undefined | ScriptValue::Null)
    }

    /// ECMAScript ToBoolean.
    pub fn truthy(&self) -> bool {
        match self {
            ScriptValue::Undefined | ScriptValue::Null => false,
            ScriptValue::Bool(b) => *b,
            ScriptValue::Number(n) => *n != 0.0 && !n.is_nan(),
            ScriptValue::String(s) => !s.is_empty(),
            ScriptValue::Int64(v) => *v != 0,
            ScriptValue::UInt64(v) => *v != 0,
            ScriptValue::Handle(h) => *h != 0,
            ScriptValue::Pointer(p) => !p.is_null(),
            _ => true,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            ScriptValue::Number(n) => Some(*n),
            ScriptValue::Int64(v) => Some(*v as f64),
            ScriptValue::UInt64(v) => Some(*v as f64),
            ScriptValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ScriptValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Identity of a reference value, used to detect repeated objects.
    pub fn identity(&self) -> Option<usize> {
        match self {
            ScriptValue::Array(a) => Some(a.id()),
            ScriptValue::Object(o) => Some(o.id()),
            ScriptValue::Function(f) => Some(f.id()),
            ScriptValue::Pointer(p) => Some(Rc::as_ptr(p) as usize),
            ScriptValue::NativeObject(o) => Some(Rc::as_ptr(o) as usize),
            ScriptValue::NativeFunction(f) => Some(Rc::as_ptr(f) as usize),
            _ => None,
        }
    }
}

// Primitives compare by value, everything else by identity.
impl PartialEq for ScriptValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (ScriptValue::Undefined, ScriptValue::Undefined) => true,
            (ScriptValue::Null, ScriptValue::Null) => true,
            (ScriptValue::Bool(a), ScriptValue::Bool(b)) => a == b,
            (ScriptValue::Number(a), ScriptValue::Number(b)) => a == b,
            (ScriptValue::String(a), ScriptValue::String(b)) => a == b,
            (ScriptValue::Int64(a), ScriptValue::Int64(b)) => a == b,
            (ScriptValue::UInt64(a), ScriptValue::UInt64(b)) => a == b,
            (ScriptValue::Handle(a), ScriptValue::Handle(b)) => a == b,
            _ => match (self.identity(), other.identity()) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            },
        }
    }
}

fn format_number(n: f64, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if n.is_nan() {
        write!(f, "NaN")
    } else if n.is_infinite() {
        write!(f, "{}Infinity", if n < 0.0 { "-" } else { "" })
    } else if n.fract() == 0.0 && n.abs() < 1e21 {
        write!(f, "{}", n as i128)
    } else {
        write!(f, "{}", n)
    }
}

impl fmt::Display for ScriptValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScriptValue::Undefined => write!(f, "undefined"),
            ScriptValue::Null => write!(f, "null"),
            ScriptValue::Bool(b) => write!(f, "{}", b),
            ScriptValue::Number(n) => format_number(*n, f),
            ScriptValue::String(s) => write!(f, "{}", s),
            ScriptValue::Array(a) => {
                let items = a.0.borrow();
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    if !item.is_nullish() {
                        write!(f, "{}", item)?;
                    }
                }
                Ok(())
            }
            ScriptValue::Object(_) => write!(f, "[object Object]"),
            ScriptValue::Function(func) => write!(f, "function {}() {{ [native code] }}", func.name()),
            ScriptValue::Int64(v) => write!(f, "{}", v),
            ScriptValue::UInt64(v) => write!(f, "{}", v),
            ScriptValue::Handle(h) => write!(f, "HANDLE({:#x})", h),
            ScriptValue::Pointer(p) => write!(f, "NativePointer({:#x})", p.address()),
            ScriptValue::NativeObject(o) => write!(f, "[NativeObject {}]", o.sig()),
            ScriptValue::NativeFunction(func) => write!(f, "[NativeFunction {}]", func.symbol()),
        }
    }
}

impl fmt::Debug for ScriptValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScriptValue::String(s) => write!(f, "{:?}", s),
            ScriptValue::Array(a) => f.debug_list().entries(a.0.borrow().iter()).finish(),
            ScriptValue::Object(o) => {
                let props = o.0.borrow();
                f.debug_map()
                    .entries(props.iter().map(|(k, v)| (k, v)))
                    .finish()
            }
            ScriptValue::Number(n) => write!(f, "{:?}", n),
            other => write!(f, "{}", other),
        }
    }
}

impl From<f64> for ScriptValue {
    fn from(n: f64) -> Self {
        ScriptValue::Number(n)
    }
}

impl From<i32> for ScriptValue {
    fn from(n: i32) -> Self {
        ScriptValue::Number(n as f64)
    }
}

impl From<bool> for ScriptValue {
    fn from(b: bool) -> Self {
        ScriptValue::Bool(b)
    }
}

impl From<&str> for ScriptValue {
    fn from(s: &str) -> Self {
        ScriptValue::string(s)
    }
}

// ============================================================================
// Reference types
// ============================================================================

#[derive(Clone, Default)]
pub struct ScriptObject(Rc<RefCell<PropertyMap>>);

impl ScriptObject {
    pub fn new(props: PropertyMap) -> Self {
        Self(Rc::new(RefCell::new(props)))
    }

    pub fn get(&self, key: &str) -> Option<ScriptValue> {
        self.0
            .borrow()
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
    }

    pub fn set(&self, key: &str, value: ScriptValue) {
        let mut props = self.0.borrow_mut();
        match props.iter_mut().find(|(k, _)| k == key) {
            Some(slot) => slot.1 = value,
            None => props.push((key.to_string(), value)),
        }
    }

    pub fn keys(&self) -> Vec<String> {
        self.0.borrow().iter().map(|(k, _)| k.clone()).collect()
    }

    pub fn id(&self) -> usize {
        Rc::as_ptr(&self.0) as *const u8 as usize
    }
}

#[derive(Clone, Default)]
pub struct ScriptArray(Rc<RefCell<Vec<ScriptValue>>>);

impl ScriptArray {
    pub fn new(items: Vec<ScriptValue>) -> Self {
        Self(Rc::new(RefCell::new(items)))
    }

    pub fn len(&self) -> usize {
        self.0.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.borrow().is_empty()
    }

    pub fn get(&self, index: usize) -> Option<ScriptValue> {
        self.0.borrow().get(index).cloned()
    }

    pub fn push(&self, value: ScriptValue) {
        self.0.borrow_mut().push(value);
    }

    /// Snapshot of the elements.
    pub fn to_vec(&self) -> Vec<ScriptValue> {
        self.0.borrow().clone()
    }

    pub fn id(&self) -> usize {
        Rc::as_ptr(&self.0) as *const u8 as usize
    }
}

pub struct FunctionData {
    name: String,
    body: Box<NativeFn>,
    /// Trampolines generated for this function, one per callback signature.
    thunks: RefCell<Vec<Rc<CallbackThunk>>>,
}

/// A callable script function.
#[derive(Clone)]
pub struct ScriptFunction(Rc<FunctionData>);

impl ScriptFunction {
    pub fn new<F>(name: &str, body: F) -> Self
    where
        F: Fn(&[ScriptValue]) -> InteropResult<ScriptValue> + 'static,
    {
        Self(Rc::new(FunctionData {
            name: name.to_string(),
            body: Box::new(body),
            thunks: RefCell::new(Vec::new()),
        }))
    }

    pub fn call(&self, args: &[ScriptValue]) -> InteropResult<ScriptValue> {
        (self.0.body)(args)
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn id(&self) -> usize {
        Rc::as_ptr(&self.0) as usize
    }

    pub fn downgrade(&self) -> WeakFunction {
        WeakFunction(Rc::downgrade(&self.0))
    }

    /// Entry address of an existing trampoline for `key`.
    pub(crate) fn find_thunk(&self, key: &str) -> Option<usize> {
        self.0
            .thunks
            .borrow()
            .iter()
            .find(|t| t.key() == key)
            .map(|t| t.code_address())
    }

    pub(crate) fn attach_thunk(&self, thunk: Rc<CallbackThunk>) {
        self.0.thunks.borrow_mut().push(thunk);
    }

    pub fn thunk_count(&self) -> usize {
        self.0.thunks.borrow().len()
    }
}

/// Non-owning function reference held by trampolines.
#[derive(Clone)]
pub struct WeakFunction(Weak<FunctionData>);

impl WeakFunction {
    pub fn upgrade(&self) -> Option<ScriptFunction> {
        self.0.upgrade().map(ScriptFunction)
    }
}
