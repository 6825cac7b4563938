//! Bytecode disassembler for debugging.

use std::fmt::Write;

use crate::bytecode::Code;
use crate::runtime::strings::Interner;
use crate::runtime::value::Value;

/// Render compiled code as one line per cell: offset, cache slot, mnemonic
/// and inline literal.
pub fn disassemble(code: &[Code], strings: &Interner) -> String {
    let mut output = String::new();
    for (offset, cell) in code.iter().enumerate() {
        writeln!(
            &mut output,
            "{:04}  {:3}  {:<10}  {}",
            offset,
            cell.cache,
            cell.op.name(),
            literal_str(cell.item, strings),
        )
        .unwrap();
    }
    output
}

fn literal_str(item: Value, strings: &Interner) -> String {
    match item {
        Value::Nil => String::new(),
        Value::Int(n) => n.to_string(),
        Value::Float(n) => format!("{:.6}", n),
        Value::Str(id) => format!("\"{}\"", strings.get(id)),
        Value::Bool(b) => b.to_string(),
        Value::Subroutine(sub) => format!("subroutine({})", sub.entry),
        Value::Vector(_) => "vector".to_string(),
        Value::Map(_) => "map".to_string(),
        Value::Coroutine(_) => "coroutine".to_string(),
        Value::Callback(_) => "callback".to_string(),
        Value::Userdata(_) => "userdata".to_string(),
    }
}
