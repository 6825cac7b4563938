//! The tagged value model.
//!
//! Values are small `Copy` data; vectors, maps, coroutines and userdata live
//! in the heap pools and are referenced by `u32` handles. The collector is
//! the sole authority on the lifetime of referenced heap objects.

use crate::error::RuntimeError;
use crate::runtime::vm::Vm;

/// Host callback signature. A callback runs on the current coroutine's
/// subframe: its arguments are the subframe values, and whatever it leaves
/// above the mark becomes its results.
pub type Callback = fn(&mut Vm) -> Result<(), RuntimeError>;

macro_rules! handle {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u32);
    };
}

handle!(
    /// Interned string handle; equal ids are equal strings.
    StrId
);
handle!(
    /// Handle into the vector pool.
    VecId
);
handle!(
    /// Handle into the map pool.
    MapId
);
handle!(
    /// Handle into the coroutine pool.
    CorId
);
handle!(
    /// Handle into the userdata pool.
    DataId
);

/// A subroutine value: an entry point into the bytecode plus an optional
/// by-value capture snapshot for functions that escape their defining call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sub {
    pub entry: u32,
    pub captures: Option<MapId>,
}

impl Sub {
    pub fn new(entry: u32) -> Self {
        Self {
            entry,
            captures: None,
        }
    }
}

/// A rill value.
#[derive(Debug, Clone, Copy, Default)]
pub enum Value {
    #[default]
    Nil,
    Int(i64),
    Float(f64),
    Str(StrId),
    Bool(bool),
    Vector(VecId),
    Map(MapId),
    Subroutine(Sub),
    Coroutine(CorId),
    Callback(Callback),
    Userdata(DataId),
}

impl Value {
    /// Rank used by the total value order: types compare before contents.
    pub fn type_rank(&self) -> u8 {
        match self {
            Value::Nil => 0,
            Value::Int(_) => 1,
            Value::Float(_) => 2,
            Value::Str(_) => 3,
            Value::Bool(_) => 4,
            Value::Vector(_) => 5,
            Value::Map(_) => 6,
            Value::Subroutine(_) => 7,
            Value::Coroutine(_) => 8,
            Value::Callback(_) => 9,
            Value::Userdata(_) => 10,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Int(_) => "integer",
            Value::Float(_) => "number",
            Value::Str(_) => "string",
            Value::Bool(_) => "boolean",
            Value::Vector(_) => "vector",
            Value::Map(_) => "map",
            Value::Subroutine(_) => "subroutine",
            Value::Coroutine(_) => "coroutine",
            Value::Callback(_) => "callback",
            Value::Userdata(_) => "userdata",
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    pub fn is_callable(&self) -> bool {
        matches!(self, Value::Subroutine(_) | Value::Callback(_))
    }

    /// Integer content, if this value is an integer.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }
}
