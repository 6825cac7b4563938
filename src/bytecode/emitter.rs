//! Lowering of parse nodes to flat bytecode.
//!
//! Every node that does not yield "all values" is wrapped in a
//! `MARK ... LIMIT n` envelope: MARK records the operand-stack depth, the
//! node's values are placed above it, and LIMIT truncates or nil-pads the
//! region to exactly n values (n = -1 pops only the mark). Marks nest;
//! LIMIT always pops exactly one.
//!
//! Peephole fusions run inside [`Emitter::emit`], so jump targets recorded
//! by callers always point at post-fusion cells.

use std::collections::HashMap;

use crate::ast::{FnDef, InterpPart, Node, NodeKind, RESULTS_ALL};
use crate::bytecode::{Code, Opcode};
use crate::error::CompileError;
use crate::runtime::heap::Heap;
use crate::runtime::value::Value;

pub type EmitResult<T> = Result<T, CompileError>;

pub struct Emitter<'a> {
    code: &'a mut Vec<Code>,
    heap: &'a mut Heap,
    /// Ancestor function ids per subroutine entry point, used at runtime to
    /// snapshot captures for escaping functions.
    fn_paths: &'a mut HashMap<u32, Vec<u32>>,
}

impl<'a> Emitter<'a> {
    pub fn new(
        code: &'a mut Vec<Code>,
        heap: &'a mut Heap,
        fn_paths: &'a mut HashMap<u32, Vec<u32>>,
    ) -> Self {
        Self {
            code,
            heap,
            fn_paths,
        }
    }

    /// Lower a module's top-level nodes, terminated by STOP.
    pub fn emit_module(&mut self, nodes: &[Node]) -> EmitResult<()> {
        for node in nodes {
            self.process(node, false, 0, -1)?;
        }
        self.emit(Opcode::Stop, Value::Nil);
        Ok(())
    }

    // ===== Emission with peephole fusion =====

    fn emit(&mut self, op: Opcode, item: Value) -> usize {
        use Opcode::*;

        let len = self.code.len();
        if len > 0 {
            let back1 = self.code[len - 1];
            let back2 = (len > 1).then(|| self.code[len - 2]);
            let back3 = (len > 2).then(|| self.code[len - 3]);

            // implicit-return dead code
            if op == Clean && back1.op == Clean {
                return len - 1;
            }
            if op == Clean && back1.op == Return {
                return len - 1;
            }
            if op == Return && back1.op == Return {
                return len - 1;
            }

            // lit,find -> fname; repeated lookups of one name fold to copies
            if op == Find && back1.op == Lit {
                if let (Some(b2), Some(b3)) = (back2, back3) {
                    if b2.op == Copies && b3.op == Fname && lit_eq(back1.item, b3.item) {
                        if let Value::Int(n) = b2.item {
                            self.code[len - 2].item = Value::Int(n + 1);
                        }
                        self.code.pop();
                        return self.code.len() - 1;
                    }
                }
                if let Some(b2) = back2 {
                    if b2.op == Fname && lit_eq(back1.item, b2.item) {
                        self.code[len - 1] = Code::new(Copies, Value::Int(1));
                        return len - 1;
                    }
                }
                self.code[len - 1].op = Fname;
                return len - 1;
            }

            // lit,get -> gname
            if op == Get && back1.op == Lit {
                self.code[len - 1].op = Gname;
                return len - 1;
            }

            // fname,call -> cfunc
            if op == Call && back1.op == Fname {
                self.code[len - 1].op = Cfunc;
                return len - 1;
            }

            // fname[x],litadd/litmul,lit[x],assign0 -> update[x],op
            if op == Assign && matches!(item, Value::Int(0)) && back1.op == Lit {
                if let (Some(b2), Some(b3)) = (back2, back3) {
                    let same_name = b3.op == Fname && lit_eq(back1.item, b3.item);
                    let simple_op = b2.op == Addl || b2.op == Mull;
                    if same_name && simple_op {
                        self.code[len - 3] = Code::new(Update, back1.item);
                        self.code.pop();
                        return self.code.len() - 1;
                    }
                }
            }

            // mark,update,op,limit0 -> update,op
            if op == Limit && matches!(item, Value::Int(0)) {
                if let (Some(b2), Some(b3)) = (back2, back3) {
                    if b3.op == Mark && b2.op == Update {
                        self.code[len - 3] = b2;
                        self.code[len - 2] = back1;
                        self.code.pop();
                        return self.code.len() - 1;
                    }
                }
            }

            // lit,assign0 -> assignl
            if op == Assign && matches!(item, Value::Int(0)) && back1.op == Lit {
                self.code[len - 1].op = Assignl;
                return len - 1;
            }

            // mark,lit,assignl,limit0 -> lit,assignp
            if op == Limit && matches!(item, Value::Int(0)) {
                if let (Some(b2), Some(b3)) = (back2, back3) {
                    if b3.op == Mark && b2.op == Lit && back1.op == Assignl {
                        let key = back1.item;
                        self.code[len - 3] = b2;
                        self.code[len - 2] = Code::new(Assignp, key);
                        self.code.pop();
                        return self.code.len() - 1;
                    }
                }
            }

            // constant-fold literal negation
            if op == Neg && back1.op == Lit {
                if let Value::Int(n) = back1.item {
                    self.code[len - 1].item = Value::Int(-n);
                    return len - 1;
                }
                if let Value::Float(n) = back1.item {
                    self.code[len - 1].item = Value::Float(-n);
                    return len - 1;
                }
            }

            // lit,add -> litadd ; lit,mul -> litmul
            if op == Add && back1.op == Lit {
                self.code[len - 1].op = Addl;
                return len - 1;
            }
            if op == Mul && back1.op == Lit {
                self.code[len - 1].op = Mull;
                return len - 1;
            }
        }

        self.code.push(Code::new(op, item));
        self.code.len() - 1
    }

    fn patch(&mut self, at: usize, target: usize) {
        self.code[at].item = Value::Int(target as i64);
    }

    // ===== Node lowering =====

    fn process(&mut self, node: &Node, flag_assign: bool, index: i64, limit: i64) -> EmitResult<()> {
        use Opcode::*;

        // with chained expressions, only the last link assigns
        let assigning = flag_assign && node.chain.is_none();

        match &node.kind {
            // a[,b,...] = node[,node,...]
            NodeKind::Multi => {
                if node.results != RESULTS_ALL {
                    self.emit(Mark, Value::Nil);
                }

                for val in &node.vals {
                    self.process(val, false, 0, -1)?;
                }

                // assignment targets index values from the subframe base
                for (i, key) in node.keys.iter().enumerate() {
                    self.process(key, true, i as i64, -1)?;
                }

                if node.results != RESULTS_ALL {
                    self.emit(Limit, Value::Int(node.results));
                }
            }

            NodeKind::Name(name) => {
                let item = Value::Str(*name);

                if node.call {
                    if assigning {
                        return Err(CompileError::new("cannot assign to call", node.span));
                    }

                    if node.index {
                        // vecmap[fn()]
                        self.emit(Mark, Value::Nil);
                        if let Some(args) = &node.args {
                            self.process(args, false, 0, -1)?;
                        }
                        self.emit(Lit, item);
                        self.emit(Find, Value::Nil);
                        self.emit(Call, Value::Nil);
                        self.emit(Limit, Value::Int(1));
                        self.emit(Get, Value::Nil);
                    } else if node.field && node.method {
                        // :fn()
                        self.emit(Copy, Value::Nil);
                        self.emit(Lit, item);
                        self.emit(Get, Value::Nil);
                        self.emit(Shunt, Value::Nil);
                        self.emit(Shunt, Value::Nil);
                        self.emit(Mark, Value::Nil);
                        self.emit(Shift, Value::Nil);
                        if let Some(args) = &node.args {
                            self.process(args, false, 0, -1)?;
                        }
                        self.emit(Shift, Value::Nil);
                        self.emit(Call, Value::Nil);
                        self.emit(Limit, Value::Int(limit));
                    } else if node.field {
                        // .fn()
                        self.emit(Lit, item);
                        self.emit(Get, Value::Nil);
                        self.emit(Shunt, Value::Nil);
                        self.emit(Mark, Value::Nil);
                        if let Some(args) = &node.args {
                            self.process(args, false, 0, -1)?;
                        }
                        self.emit(Shift, Value::Nil);
                        self.emit(Call, Value::Nil);
                        self.emit(Limit, Value::Int(limit));
                    } else {
                        // fn()
                        self.emit(Mark, Value::Nil);
                        if let Some(args) = &node.args {
                            self.process(args, false, 0, -1)?;
                        }
                        self.emit(Lit, item);
                        self.emit(Find, Value::Nil);
                        self.emit(Call, Value::Nil);
                        self.emit(Limit, Value::Int(limit));
                    }
                } else {
                    // variable reference
                    self.emit(Lit, item);

                    if assigning {
                        if node.index {
                            self.emit(Find, Value::Nil);
                            self.emit(Set, Value::Nil);
                        } else if node.field {
                            self.emit(Set, Value::Nil);
                        } else {
                            self.emit(Assign, Value::Int(index));
                        }
                    } else if node.index {
                        self.emit(Find, Value::Nil);
                        self.emit(Get, Value::Nil);
                    } else if node.field {
                        self.emit(Get, Value::Nil);
                    } else {
                        self.emit(Find, Value::Nil);
                    }
                }

                if let Some(chain) = &node.chain {
                    self.process(chain, flag_assign, 0, 1)?;
                }
            }

            // function with optional name assignment
            NodeKind::Function(def) => {
                self.emit_function(node, def, limit)?;
            }

            // extra call applied to the value on top of the stack
            NodeKind::CallChain => {
                self.emit(Shunt, Value::Nil);
                self.emit(Mark, Value::Nil);
                if let Some(args) = &node.args {
                    self.process(args, false, 0, -1)?;
                }
                self.emit(Shift, Value::Nil);
                for val in &node.vals {
                    self.process(val, false, 0, -1)?;
                }
                self.emit(Call, Value::Nil);
                self.emit(Limit, Value::Int(limit));

                if node.index {
                    self.emit(if assigning { Set } else { Get }, Value::Nil);
                }
                if let Some(chain) = &node.chain {
                    self.process(chain, flag_assign, 0, 1)?;
                }
            }

            // inline opcode: keywords and unary modifiers
            NodeKind::Inline(op) => {
                if let Some(args) = &node.args {
                    self.process(args, false, 0, -1)?;
                }
                for val in &node.vals {
                    self.process(val, false, 0, -1)?;
                }
                self.emit(*op, Value::Nil);

                if node.index {
                    self.emit(if assigning { Set } else { Get }, Value::Nil);
                }
                if let Some(chain) = &node.chain {
                    self.process(chain, flag_assign, 0, 1)?;
                }
            }

            NodeKind::Operator(Opcode::And) => {
                self.process(&node.vals[0], false, 0, 1)?;
                let jump = self.emit(And, Value::Nil);
                self.process(&node.vals[1], false, 0, 1)?;
                let after = self.code.len();
                self.patch(jump, after);
            }

            NodeKind::Operator(Opcode::Or) => {
                self.process(&node.vals[0], false, 0, 1)?;
                let jump = self.emit(Or, Value::Nil);
                self.process(&node.vals[1], false, 0, 1)?;
                let after = self.code.len();
                self.patch(jump, after);
            }

            NodeKind::Operator(op) => {
                for val in &node.vals {
                    self.process(val, false, 0, 1)?;
                }
                self.emit(*op, Value::Nil);

                if node.index {
                    self.emit(if assigning { Set } else { Get }, Value::Nil);
                }
                if let Some(chain) = &node.chain {
                    self.process(chain, flag_assign, 0, 1)?;
                }
            }

            // literal, optionally part of a chain a[b]["c"]
            NodeKind::Literal(value) => {
                self.emit(Lit, *value);

                if node.index {
                    self.emit(if assigning { Set } else { Get }, Value::Nil);
                }
                if let Some(chain) = &node.chain {
                    self.process(chain, flag_assign, 0, 1)?;
                }

                if assigning && !matches!(value, Value::Str(_)) {
                    return Err(CompileError::new(
                        format!("cannot assign {}", value.type_name()),
                        node.span,
                    ));
                }
                // allows: "complex key" = value in map literals
                if !node.index && assigning && matches!(value, Value::Str(_)) {
                    self.emit(Assign, Value::Int(index));
                }
            }

            NodeKind::Interp(parts) => {
                let mut started = false;
                for part in parts {
                    match part {
                        InterpPart::Text(id) => {
                            self.emit(Lit, Value::Str(*id));
                        }
                        InterpPart::Expr(expr) => {
                            self.process(expr, false, 0, -1)?;
                        }
                    }
                    if started {
                        self.emit(Concat, Value::Nil);
                    }
                    started = true;
                }

                if node.index {
                    self.emit(if assigning { Set } else { Get }, Value::Nil);
                }
                if let Some(chain) = &node.chain {
                    self.process(chain, flag_assign, 0, 1)?;
                }
                if !node.index && assigning {
                    self.emit(Assign, Value::Int(index));
                }
            }

            // if expression ... [else ...] end
            // (returns a value for ternary style assignment)
            NodeKind::If => {
                if let Some(args) = &node.args {
                    self.process(args, false, 0, -1)?;
                }

                let jump = self.emit(Jfalse, Value::Nil);
                self.emit(Drop, Value::Nil);

                for val in &node.vals {
                    self.process(val, false, 0, 0)?;
                }

                if !node.keys.is_empty() {
                    let jump2 = self.emit(Jmp, Value::Nil);
                    let at_else = self.code.len();
                    self.patch(jump, at_else);
                    self.emit(Drop, Value::Nil);

                    for key in &node.keys {
                        self.process(key, false, 0, 0)?;
                    }

                    let after = self.code.len();
                    self.patch(jump2, after);
                } else {
                    let after = self.code.len();
                    self.patch(jump, after);
                }

                if assigning {
                    return Err(CompileError::new("cannot assign to if block", node.span));
                }
            }

            NodeKind::While => {
                self.emit(Mark, Value::Nil);
                let enter = self.emit(Loop, Value::Nil);
                let begin = self.code.len();

                if let Some(args) = &node.args {
                    self.process(args, false, 0, -1)?;
                }

                let leave = self.emit(Jfalse, Value::Nil);
                self.emit(Drop, Value::Nil);

                for val in &node.vals {
                    self.process(val, false, 0, 0)?;
                }

                self.emit(Jmp, Value::Int(begin as i64));
                let after = self.code.len();
                self.patch(leave, after);
                self.patch(enter, after);
                self.emit(Unloop, Value::Nil);
                self.emit(Limit, Value::Int(0));

                if assigning {
                    return Err(CompileError::new("cannot assign to while block", node.span));
                }
            }

            NodeKind::For(names) => {
                self.emit(Mark, Value::Nil);

                // the iterable
                if let Some(args) = &node.args {
                    self.process(args, false, 0, -1)?;
                }

                let enter = self.emit(Loop, Value::Nil);
                let begin = self.code.len();

                // FOR carries the key[,val] variable names
                let vars = self.heap.alloc_vector();
                self.heap.vector_mut(vars).items =
                    names.iter().map(|n| Value::Str(*n)).collect();
                self.emit(For, Value::Vector(vars));

                for val in &node.vals {
                    self.process(val, false, 0, 0)?;
                }

                self.emit(Jmp, Value::Int(begin as i64));
                let after = self.code.len();
                self.patch(enter, after);
                self.emit(Unloop, Value::Nil);
                self.emit(Limit, Value::Int(0));

                if assigning {
                    return Err(CompileError::new("cannot assign to for block", node.span));
                }
            }

            NodeKind::Return => {
                self.emit(Clean, Value::Nil);

                if let Some(args) = &node.args {
                    self.process(args, false, 0, -1)?;
                }

                self.emit(Return, Value::Nil);

                if assigning {
                    return Err(CompileError::new("cannot assign to return", node.span));
                }
            }

            // literal vector [1,2,3]
            NodeKind::VecLit => {
                self.emit(Vector, Value::Nil);
                self.emit(Mark, Value::Nil);

                for val in &node.vals {
                    self.process(val, false, 0, -1)?;
                    self.emit(Vpush, Value::Nil);
                }

                self.emit(Limit, Value::Int(0));
                self.emit(Shift, Value::Nil);

                if node.index {
                    self.emit(if assigning { Set } else { Get }, Value::Nil);
                }
                if let Some(chain) = &node.chain {
                    self.process(chain, flag_assign, 0, 1)?;
                }
            }

            // literal map { a = 1, b = 2, c = nil }
            NodeKind::MapLit => {
                self.emit(Mark, Value::Nil);
                self.emit(Map, Value::Nil);

                for val in &node.vals {
                    self.process(val, false, 0, 0)?;
                }

                self.emit(Unmap, Value::Nil);
                self.emit(Limit, Value::Int(1));

                if node.index {
                    self.emit(if assigning { Set } else { Get }, Value::Nil);
                }
                if let Some(chain) = &node.chain {
                    self.process(chain, flag_assign, 0, 1)?;
                }
            }
        }

        Ok(())
    }

    fn emit_function(&mut self, node: &Node, def: &FnDef, limit: i64) -> EmitResult<()> {
        use Opcode::*;

        self.emit(Mark, Value::Nil);
        let entry_lit = self.emit(Lit, Value::Nil);

        if let Some(name) = def.name {
            self.emit(Lit, Value::Str(name));
            self.emit(Assign, Value::Int(0));
        }

        let jump = self.emit(Jmp, Value::Nil);
        let entry = self.code.len() as u32;
        self.code[entry_lit].item = Value::Subroutine(crate::runtime::value::Sub::new(entry));
        self.fn_paths.insert(entry, def.path.ancestors.clone());

        // scope path prelude: own id, then lexical ancestors
        self.emit(Pid, Value::Int(def.path.id as i64));
        for ancestor in &def.path.ancestors {
            self.emit(Pid, Value::Int(*ancestor as i64));
        }

        for (i, param) in def.params.iter().enumerate() {
            self.emit(Lit, Value::Str(*param));
            self.emit(Assign, Value::Int(i as i64));
        }

        self.emit(Clean, Value::Nil);

        for val in &node.vals {
            self.process(val, false, 0, 0)?;
        }

        // dead code when the body ends in an explicit return
        self.emit(Clean, Value::Nil);
        self.emit(Return, Value::Nil);
        let after = self.code.len();
        self.patch(jump, after);

        // the value only remains for anonymous function expressions
        self.emit(
            Limit,
            Value::Int(if def.name.is_some() { 0 } else { 1 }),
        );

        // function() ... end(...)
        if node.call {
            self.emit(Shunt, Value::Nil);
            self.emit(Mark, Value::Nil);
            if let Some(args) = &node.args {
                self.process(args, false, 0, -1)?;
            }
            self.emit(Shift, Value::Nil);
            self.emit(Call, Value::Nil);
            self.emit(Limit, Value::Int(limit));
        }

        Ok(())
    }
}

/// Compile-time literal equality: ids for strings, bits for numbers.
fn lit_eq(a: Value, b: Value) -> bool {
    match (a, b) {
        (Value::Nil, Value::Nil) => true,
        (Value::Int(x), Value::Int(y)) => x == y,
        (Value::Float(x), Value::Float(y)) => x == y,
        (Value::Str(x), Value::Str(y)) => x == y,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        _ => false,
    }
}
