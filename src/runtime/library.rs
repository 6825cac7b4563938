//! The built-in library.
//!
//! Everything here is a native callback registered through the same
//! convention hosts use: `lib.<name>` entries in the core scope, plus a
//! bare `print`. Coroutine entries delegate to the VM's own opcode
//! handlers so scripts and bytecode share one implementation.

use std::io::Write;

use crate::error::RuntimeError;
use crate::runtime::value::{Callback, Value, VecId};
use crate::runtime::vm::{RunResult, Vm};

const ENTRIES: &[(&str, Callback)] = &[
    ("print", lib_print),
    ("coroutine", lib_coroutine),
    ("resume", lib_resume),
    ("yield", lib_yield),
    ("setmeta", lib_setmeta),
    ("getmeta", lib_getmeta),
    ("sort", lib_sort),
    ("assert", lib_assert),
    ("type", lib_type),
    ("collect", lib_collect),
    ("min", lib_min),
    ("max", lib_max),
    // math
    ("sin", lib_sin),
    ("cos", lib_cos),
    ("tan", lib_tan),
    ("asin", lib_asin),
    ("acos", lib_acos),
    ("atan", lib_atan),
    ("sinh", lib_sinh),
    ("cosh", lib_cosh),
    ("tanh", lib_tanh),
    ("ceil", lib_ceil),
    ("floor", lib_floor),
    ("sqrt", lib_sqrt),
    ("abs", lib_abs),
    ("atan2", lib_atan2),
    ("log", lib_log),
    ("log10", lib_log10),
    ("pow", lib_pow),
];

/// Populate the core scope: the `lib` map and the bare `print`.
pub(crate) fn install(vm: &mut Vm) -> RunResult<()> {
    let lib = vm.heap.alloc_map();
    let lib_key = vm.make_string("lib");
    vm.map_set(vm.scope_core, lib_key, Value::Map(lib))?;

    for (name, callback) in ENTRIES {
        let key = vm.make_string(name);
        vm.map_set(lib, key, Value::Callback(*callback))?;
    }

    let print_key = vm.make_string("print");
    vm.map_set(vm.scope_core, print_key, Value::Callback(lib_print))?;
    Ok(())
}

fn lib_print(vm: &mut Vm) -> RunResult<()> {
    let items = vm.depth();
    if items == 0 {
        return Ok(());
    }
    let mut parts = Vec::with_capacity(items);
    for i in 0..items {
        let value = vm.item(i)?;
        parts.push(vm.text(value)?);
    }
    writeln!(vm.out, "{}", parts.join("\t"))?;
    vm.out.flush()?;
    Ok(())
}

fn lib_coroutine(vm: &mut Vm) -> RunResult<()> {
    vm.op_coroutine()
}

fn lib_resume(vm: &mut Vm) -> RunResult<()> {
    vm.op_resume()
}

fn lib_yield(vm: &mut Vm) -> RunResult<()> {
    vm.op_yield()
}

fn lib_setmeta(vm: &mut Vm) -> RunResult<()> {
    vm.op_meta_set()
}

fn lib_getmeta(vm: &mut Vm) -> RunResult<()> {
    vm.op_meta_get()
}

fn lib_sort(vm: &mut Vm) -> RunResult<()> {
    let Value::Vector(id) = vm.pop()? else {
        return Err(RuntimeError::type_error("sort expects a vector"));
    };
    let len = vm.heap.vector(id).items.len();
    if len > 0 {
        sort_range(vm, id, 0, len as isize - 1)?;
    }
    vm.push(Value::Vector(id));
    Ok(())
}

/// In-place quicksort under the VM's value order (meta `<` included).
fn sort_range(vm: &mut Vm, vec: VecId, low: isize, high: isize) -> RunResult<()> {
    if low >= high {
        return Ok(());
    }
    let pivot = vec_item(vm, vec, low + (high - low) / 2)?;
    let mut left = low;
    let mut right = high;
    while left <= right {
        while vm.value_lt(vec_item(vm, vec, left)?, pivot)? {
            left += 1;
        }
        while vm.value_lt(pivot, vec_item(vm, vec, right)?)? {
            right -= 1;
        }
        if left <= right {
            let items = &mut vm.heap.vector_mut(vec).items;
            items.swap(left as usize, right as usize);
            left += 1;
            right -= 1;
        }
    }
    sort_range(vm, vec, low, right)?;
    sort_range(vm, vec, left, high)
}

fn vec_item(vm: &Vm, vec: VecId, index: isize) -> RunResult<Value> {
    vm.heap
        .vector(vec)
        .items
        .get(index as usize)
        .copied()
        .ok_or_else(|| RuntimeError::internal("sort index out of range"))
}

fn lib_assert(vm: &mut Vm) -> RunResult<()> {
    if vm.depth() == 0 || !vm.truth(vm.top()?) {
        return Err(RuntimeError::AssertFailed);
    }
    Ok(())
}

fn lib_type(vm: &mut Vm) -> RunResult<()> {
    let value = vm.pop()?;
    let name = vm.make_string(value.type_name());
    vm.push(name);
    Ok(())
}

fn lib_collect(vm: &mut Vm) -> RunResult<()> {
    vm.collect();
    Ok(())
}

fn lib_min(vm: &mut Vm) -> RunResult<()> {
    let mut best = vm.pop()?;
    while vm.depth() > 0 {
        let next = vm.pop()?;
        if best.type_rank() != next.type_rank() {
            return Err(RuntimeError::type_error("min mixed types"));
        }
        if !vm.value_lt(best, next)? {
            best = next;
        }
    }
    vm.push(best);
    Ok(())
}

fn lib_max(vm: &mut Vm) -> RunResult<()> {
    let mut best = vm.pop()?;
    while vm.depth() > 0 {
        let next = vm.pop()?;
        if best.type_rank() != next.type_rank() {
            return Err(RuntimeError::type_error("max mixed types"));
        }
        if vm.value_lt(best, next)? {
            best = next;
        }
    }
    vm.push(best);
    Ok(())
}

macro_rules! math1 {
    ($name:ident, $method:ident) => {
        fn $name(vm: &mut Vm) -> RunResult<()> {
            let a = vm.pop_float()?;
            vm.push(Value::Float(a.$method()));
            Ok(())
        }
    };
}

math1!(lib_sin, sin);
math1!(lib_cos, cos);
math1!(lib_tan, tan);
math1!(lib_asin, asin);
math1!(lib_acos, acos);
math1!(lib_atan, atan);
math1!(lib_sinh, sinh);
math1!(lib_cosh, cosh);
math1!(lib_tanh, tanh);
math1!(lib_ceil, ceil);
math1!(lib_floor, floor);
math1!(lib_sqrt, sqrt);
math1!(lib_log, ln);
math1!(lib_log10, log10);

fn lib_abs(vm: &mut Vm) -> RunResult<()> {
    let value = match vm.pop()? {
        Value::Int(n) => Value::Int(n.wrapping_abs()),
        Value::Float(n) => Value::Float(n.abs()),
        other => {
            return Err(RuntimeError::type_error(format!(
                "cannot abs {}",
                other.type_name()
            )))
        }
    };
    vm.push(value);
    Ok(())
}

fn lib_atan2(vm: &mut Vm) -> RunResult<()> {
    let y = vm.pop_float()?;
    let x = vm.pop_float()?;
    vm.push(Value::Float(x.atan2(y)));
    Ok(())
}

fn lib_pow(vm: &mut Vm) -> RunResult<()> {
    let y = vm.pop_float()?;
    let x = vm.pop_float()?;
    vm.push(Value::Float(x.powf(y)));
    Ok(())
}
