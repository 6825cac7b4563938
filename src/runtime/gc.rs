//! Deferred mark-and-sweep collection.
//!
//! Collection never fires during opcode dispatch; it runs at creation end,
//! run end, drop, and whenever a script or host calls the collect
//! primitive. Marking uses an explicit grey worklist so heap borrows stay
//! disjoint from mark-bit updates.

use std::collections::HashSet;

use crate::runtime::value::{StrId, Value};
use crate::runtime::vm::Vm;

impl Vm {
    /// Mark from the roots, sweep every pool, compact the young strings.
    pub fn collect(&mut self) {
        self.heap.vectors.clear_marks();
        self.heap.maps.clear_marks();
        self.heap.cors.clear_marks();
        self.heap.datas.clear_marks();

        let mut live_strings: HashSet<StrId> = HashSet::new();
        let mut grey: Vec<Value> = Vec::new();

        // roots: scopes, module names, the routine chain, bytecode
        // literals, and the inline call cache
        grey.push(Value::Map(self.scope_core));
        if let Some(global) = self.scope_global {
            grey.push(Value::Map(global));
        }
        for (name, _) in &self.modules {
            grey.push(Value::Str(*name));
        }
        for routine in &self.routines {
            grey.push(Value::Coroutine(*routine));
        }
        for cell in &self.code {
            grey.push(cell.item);
        }
        for cached in &self.cfunc_cache {
            grey.push(*cached);
        }

        while let Some(value) = grey.pop() {
            self.mark_value(value, &mut grey, &mut live_strings);
        }

        self.heap.vectors.sweep();
        self.heap.maps.sweep();
        self.heap.cors.sweep();
        self.heap.datas.sweep();
        self.strings.sweep(&live_strings);
    }

    fn mark_value(&mut self, value: Value, grey: &mut Vec<Value>, live: &mut HashSet<StrId>) {
        match value {
            Value::Str(id) => {
                if self.strings.is_young(id) {
                    live.insert(id);
                }
            }
            Value::Vector(id) => {
                if self.heap.vectors.mark(id.0) {
                    let vector = self.heap.vector(id);
                    grey.push(vector.meta);
                    grey.extend(vector.items.iter().copied());
                }
            }
            Value::Map(id) => {
                if self.heap.maps.mark(id.0) {
                    let map = self.heap.map(id);
                    grey.push(map.meta);
                    grey.extend(map.keys.iter().copied());
                    grey.extend(map.vals.iter().copied());
                }
            }
            Value::Coroutine(id) => {
                if self.heap.cors.mark(id.0) {
                    let cor = self.heap.cor(id);
                    grey.extend(cor.stack.iter().copied());
                    grey.extend(cor.other.iter().copied());
                    grey.push(cor.map);
                    for frame in &cor.frames {
                        grey.push(frame.map);
                        if let Some(captures) = frame.captures {
                            grey.push(Value::Map(captures));
                        }
                        for (name, local) in &frame.locals {
                            grey.push(Value::Str(*name));
                            grey.push(*local);
                        }
                    }
                }
            }
            Value::Subroutine(sub) => {
                if let Some(captures) = sub.captures {
                    grey.push(Value::Map(captures));
                }
            }
            Value::Userdata(id) => {
                if self.heap.datas.mark(id.0) {
                    grey.push(self.heap.data(id).meta);
                }
            }
            Value::Nil | Value::Int(_) | Value::Float(_) | Value::Bool(_) | Value::Callback(_) => {}
        }
    }
}
