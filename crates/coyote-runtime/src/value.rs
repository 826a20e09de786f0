//! Runtime values
//!
//! Only as much of the object model as calling, closing and coroutines need.
//! Everything with identity is reference counted and compared by pointer.

use crate::status::{Status, VmResult};
use crate::vm::{ThreadId, Vm};
use std::fmt;
use std::sync::Arc;

/// A host function. Arguments are on the stack above the function slot;
/// returns how many values on top of the stack are its results.
pub type NativeFn = fn(&mut Vm) -> VmResult<usize>;

/// Opaque context handed back to a continuation.
pub type KContext = isize;

/// Continuation of a native function interrupted by a yield or a recovered error.
pub type ContinuationFn = fn(&mut Vm, Status, KContext) -> VmResult<usize>;

/// A continuation together with its context.
#[derive(Clone, Copy)]
pub struct Continuation {
    pub func: ContinuationFn,
    pub ctx: KContext,
}

impl Continuation {
    pub fn new(func: ContinuationFn, ctx: KContext) -> Self {
        Self { func, ctx }
    }
}

impl fmt::Debug for Continuation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Continuation")
            .field("func", &(self.func as usize as *const ()))
            .field("ctx", &self.ctx)
            .finish()
    }
}

/// Host function with captured values.
pub struct NativeClosure {
    pub func: NativeFn,
    pub upvalues: Vec<Value>,
}

/// Compiled function prototype. The instruction encoding is owned by the dispatcher.
#[derive(Debug, Clone)]
pub struct Proto {
    pub name: Arc<str>,
    /// Number of fixed parameters.
    pub num_params: usize,
    pub is_vararg: bool,
    /// Registers needed by one activation.
    pub max_stack_size: usize,
    pub code: Vec<u32>,
    pub constants: Vec<Value>,
}

impl Proto {
    pub fn new(name: &str) -> Self {
        Self {
            name: Arc::from(name),
            num_params: 0,
            is_vararg: false,
            max_stack_size: 2,
            code: Vec::new(),
            constants: Vec::new(),
        }
    }
}

/// Interpreted closure.
#[derive(Debug)]
pub struct Closure {
    pub proto: Arc<Proto>,
    pub upvalues: Vec<Value>,
}

/// Host object. Only the metamethods the call machinery consults are modelled.
#[derive(Debug)]
pub struct Object {
    pub name: Arc<str>,
    /// `__call`
    pub call: Option<Value>,
    /// `__close`
    pub close: Option<Value>,
}

impl Object {
    pub fn new(name: &str) -> Self {
        Self {
            name: Arc::from(name),
            call: None,
            close: None,
        }
    }

    pub fn with_call(mut self, handler: Value) -> Self {
        self.call = Some(handler);
        self
    }

    pub fn with_close(mut self, handler: Value) -> Self {
        self.close = Some(handler);
        self
    }
}

#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Nil,
    Bool(bool),
    Integer(i64),
    Number(f64),
    Str(Arc<str>),
    LightNative(NativeFn),
    NativeClosure(Arc<NativeClosure>),
    Closure(Arc<Closure>),
    Thread(ThreadId),
    Object(Arc<Object>),
}

impl Value {
    pub fn native(func: NativeFn) -> Self {
        Value::LightNative(func)
    }

    pub fn native_closure(func: NativeFn, upvalues: Vec<Value>) -> Self {
        Value::NativeClosure(Arc::new(NativeClosure { func, upvalues }))
    }

    pub fn closure(proto: Proto) -> Self {
        Value::Closure(Arc::new(Closure {
            proto: Arc::new(proto),
            upvalues: Vec::new(),
        }))
    }

    pub fn object(object: Object) -> Self {
        Value::Object(Arc::new(object))
    }

    /// Type name as reported in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Bool(_) => "boolean",
            Value::Integer(_) | Value::Number(_) => "number",
            Value::Str(_) => "string",
            Value::LightNative(_) | Value::NativeClosure(_) | Value::Closure(_) => "function",
            Value::Thread(_) => "thread",
            Value::Object(_) => "userdata",
        }
    }

    /// `nil` and `false` are the only false values.
    pub fn is_falsy(&self) -> bool {
        matches!(self, Value::Nil | Value::Bool(false))
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub(crate) fn call_handler(&self) -> Option<Value> {
        match self {
            Value::Object(obj) => obj.call.clone(),
            _ => None,
        }
    }

    pub(crate) fn close_handler(&self) -> Option<Value> {
        match self {
            Value::Object(obj) => obj.close.clone(),
            _ => None,
        }
    }

    fn identity(&self) -> usize {
        match self {
            Value::LightNative(f) => *f as usize,
            Value::NativeClosure(c) => Arc::as_ptr(c) as usize,
            Value::Closure(c) => Arc::as_ptr(c) as usize,
            Value::Object(o) => Arc::as_ptr(o) as usize,
            Value::Str(s) => Arc::as_ptr(s) as *const u8 as usize,
            _ => 0,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Integer(a), Value::Integer(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::Integer(a), Value::Number(b)) | (Value::Number(b), Value::Integer(a)) => {
                (*a as f64) == *b
            }
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Thread(a), Value::Thread(b)) => a == b,
            (Value::LightNative(_), Value::LightNative(_))
            | (Value::NativeClosure(_), Value::NativeClosure(_))
            | (Value::Closure(_), Value::Closure(_))
            | (Value::Object(_), Value::Object(_)) => self.identity() == other.identity(),
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Str(s) => write!(f, "{:?}", s),
            Value::Object(o) => write!(f, "userdata<{}>", o.name),
            Value::Closure(c) => write!(f, "function<{}>", c.proto.name),
            _ => write!(f, "{}", self),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Integer(i) => write!(f, "{}", i),
            Value::Number(n) => write!(f, "{}", n),
            Value::Str(s) => write!(f, "{}", s),
            Value::Thread(id) => write!(f, "thread: {}", id),
            Value::Object(o) => write!(f, "{}: {:#x}", o.name, self.identity()),
            _ => write!(f, "function: {:#x}", self.identity()),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(Arc::from(s))
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(Arc::from(s))
    }
}

impl From<ThreadId> for Value {
    fn from(id: ThreadId) -> Self {
        Value::Thread(id)
    }
}
