//! Typed host accessors for the callback ABI.
//!
//! A callback receives `&mut Vm` with its arguments on the current
//! subframe (`depth`, `item`, `pick`); it converts them with the `to_*`
//! accessors, builds results with `make_*`, and leaves them on the stack.

use std::any::Any;

use crate::error::RuntimeError;
use crate::runtime::value::Value;
use crate::runtime::vm::{RunResult, Vm};

impl Vm {
    pub fn is_nil(&self, value: Value) -> bool {
        matches!(value, Value::Nil)
    }

    pub fn is_bool(&self, value: Value) -> bool {
        matches!(value, Value::Bool(_))
    }

    pub fn is_int(&self, value: Value) -> bool {
        matches!(value, Value::Int(_))
    }

    pub fn is_float(&self, value: Value) -> bool {
        matches!(value, Value::Float(_))
    }

    /// Either numeric variant.
    pub fn is_number(&self, value: Value) -> bool {
        matches!(value, Value::Int(_) | Value::Float(_))
    }

    pub fn is_string(&self, value: Value) -> bool {
        matches!(value, Value::Str(_))
    }

    pub fn is_vector(&self, value: Value) -> bool {
        matches!(value, Value::Vector(_))
    }

    pub fn is_map(&self, value: Value) -> bool {
        matches!(value, Value::Map(_))
    }

    pub fn is_userdata(&self, value: Value) -> bool {
        matches!(value, Value::Userdata(_))
    }

    pub fn to_bool(&self, value: Value) -> RunResult<bool> {
        match value {
            Value::Bool(b) => Ok(b),
            other => Err(conversion("boolean", other)),
        }
    }

    pub fn to_int(&self, value: Value) -> RunResult<i64> {
        match value {
            Value::Int(n) => Ok(n),
            other => Err(conversion("integer", other)),
        }
    }

    /// Numeric content, widening integers.
    pub fn to_number(&self, value: Value) -> RunResult<f64> {
        match value {
            Value::Int(n) => Ok(n as f64),
            Value::Float(n) => Ok(n),
            other => Err(conversion("number", other)),
        }
    }

    pub fn to_str(&self, value: Value) -> RunResult<&str> {
        match value {
            Value::Str(id) => Ok(self.strings.get(id)),
            other => Err(conversion("string", other)),
        }
    }

    pub fn userdata(&self, value: Value) -> RunResult<&dyn Any> {
        match value {
            Value::Userdata(id) => Ok(self.heap.data(id).data.as_ref()),
            other => Err(conversion("userdata", other)),
        }
    }

    pub fn userdata_mut(&mut self, value: Value) -> RunResult<&mut dyn Any> {
        match value {
            Value::Userdata(id) => Ok(self.heap.data_mut(id).data.as_mut()),
            other => Err(conversion("userdata", other)),
        }
    }

    /// `container[key]`, with the same semantics scripts see.
    pub fn container_get(&mut self, container: Value, key: Value) -> RunResult<Value> {
        self.get_value(container, key)
    }

    /// `container[key] = value`; assigning nil to a map key deletes it.
    pub fn container_set(&mut self, container: Value, key: Value, value: Value) -> RunResult<()> {
        self.set_value(container, key, value)
    }

    /// The n-th key of an ordered map.
    pub fn map_key(&self, map: Value, index: usize) -> RunResult<Value> {
        match map {
            Value::Map(id) => Ok(self.heap.map(id).keys.get(index).copied().unwrap_or(Value::Nil)),
            other => Err(conversion("map", other)),
        }
    }

    /// Attach a meta value to a vector, map or userdata.
    pub fn set_meta(&mut self, target: Value, meta: Value) -> RunResult<()> {
        match target {
            Value::Vector(id) => {
                self.heap.vector_mut(id).meta = meta;
                Ok(())
            }
            Value::Map(id) => {
                self.heap.map_mut(id).meta = meta;
                Ok(())
            }
            Value::Userdata(id) => {
                self.heap.data_mut(id).meta = meta;
                Ok(())
            }
            other => Err(RuntimeError::type_error(format!(
                "cannot set meta on {}",
                other.type_name()
            ))),
        }
    }

    pub fn get_meta(&self, target: Value) -> Value {
        match target {
            Value::Vector(id) => self.heap.vector(id).meta,
            Value::Map(id) => self.heap.map(id).meta,
            Value::Userdata(id) => self.heap.data(id).meta,
            _ => Value::Nil,
        }
    }

    /// The core scope map, where callbacks and the library live.
    pub fn core_scope(&self) -> Value {
        Value::Map(self.scope_core)
    }

    /// The current run's global scope map.
    pub fn global_scope(&self) -> Option<Value> {
        self.scope_global.map(Value::Map)
    }
}

fn conversion(wanted: &str, found: Value) -> RuntimeError {
    RuntimeError::type_error(format!("item is not a {}: {}", wanted, found.type_name()))
}
