use crate::ast::{InterpPart, Node, NodeKind};
use crate::bytecode::Opcode;
use crate::lexer::Scanner;
use crate::parser::Parser;
use crate::runtime::strings::Interner;

fn parse(source: &str) -> Vec<Node> {
    let tokens = Scanner::new(source).scan_tokens().expect("scan failed");
    let mut interner = Interner::new();
    Parser::new(tokens, &mut interner)
        .parse()
        .expect("parse failed")
}

fn parse_err(source: &str) -> bool {
    let Ok(tokens) = Scanner::new(source).scan_tokens() else {
        return true;
    };
    let mut interner = Interner::new();
    Parser::new(tokens, &mut interner).parse().is_err()
}

#[test]
fn assignment_splits_targets_and_values() {
    let nodes = parse("a, b = 1, 2");
    assert_eq!(nodes.len(), 1);
    let node = &nodes[0];
    assert!(matches!(node.kind, NodeKind::Multi));
    assert_eq!(node.keys.len(), 2);
    assert_eq!(node.vals.len(), 2);
}

#[test]
fn precedence_binds_multiplication_tighter() {
    let nodes = parse("x = 1 + 2 * 3");
    let value = &nodes[0].vals[0];
    let NodeKind::Operator(Opcode::Add) = value.kind else {
        panic!("expected + at the root, got {:?}", value.kind);
    };
    assert!(matches!(
        value.vals[1].kind,
        NodeKind::Operator(Opcode::Mul)
    ));
}

#[test]
fn and_or_precedence_is_lowest() {
    let nodes = parse("x = 1 < 2 and 3 < 4");
    let value = &nodes[0].vals[0];
    assert!(matches!(value.kind, NodeKind::Operator(Opcode::And)));
}

#[test]
fn unary_modifiers_wrap_their_operand() {
    let nodes = parse("x = #v");
    let value = &nodes[0].vals[0];
    let NodeKind::Inline(Opcode::Count) = value.kind else {
        panic!("expected count modifier");
    };
    assert!(value.args.is_some());
}

#[test]
fn field_and_index_chains() {
    let nodes = parse("x = a.b[0]");
    let value = &nodes[0].vals[0];
    assert!(matches!(value.kind, NodeKind::Name(_)));
    let field = value.chain.as_ref().expect("field link");
    assert!(field.field);
    let index = field.chain.as_ref().expect("index link");
    assert!(index.index);
}

#[test]
fn method_call_marks_field_and_method() {
    let nodes = parse("x = obj:name(1)");
    let value = &nodes[0].vals[0];
    let link = value.chain.as_ref().expect("method link");
    assert!(link.field && link.method && link.call);
}

#[test]
fn nested_functions_record_scope_paths() {
    let nodes = parse("function outer() function inner() end end");
    let NodeKind::Function(outer) = &nodes[0].kind else {
        panic!("expected function");
    };
    assert!(outer.path.ancestors.is_empty());
    let NodeKind::Function(inner) = &nodes[0].vals[0].kind else {
        panic!("expected nested function");
    };
    assert_eq!(inner.path.ancestors, vec![outer.path.id]);
}

#[test]
fn for_loop_collects_variable_names() {
    let nodes = parse("for k, v in m end");
    let NodeKind::For(names) = &nodes[0].kind else {
        panic!("expected for node");
    };
    assert_eq!(names.len(), 2);
}

#[test]
fn interpolation_splits_into_parts() {
    let nodes = parse("x = \"$a-$(b + 1)\"");
    let NodeKind::Interp(parts) = &nodes[0].vals[0].kind else {
        panic!("expected interpolation");
    };
    assert_eq!(parts.len(), 3);
    assert!(matches!(parts[0], InterpPart::Expr(_)));
    assert!(matches!(parts[1], InterpPart::Text(_)));
    assert!(matches!(parts[2], InterpPart::Expr(_)));
}

#[test]
fn plain_string_stays_a_literal() {
    let nodes = parse("x = \"plain\"");
    assert!(matches!(nodes[0].vals[0].kind, NodeKind::Literal(_)));
}

#[test]
fn map_literal_requires_pairs() {
    assert!(parse_err("{ 1 }"));
}

#[test]
fn unclosed_block_is_an_error() {
    assert!(parse_err("while x"));
    assert!(parse_err("if x then y"));
}

#[test]
fn function_nesting_is_bounded() {
    let mut source = String::new();
    for _ in 0..10 {
        source.push_str("function() ");
    }
    assert!(parse_err(&source));
}

#[test]
fn if_else_bodies_split() {
    let nodes = parse("if c a = 1 else a = 2 end");
    let node = &nodes[0];
    assert!(matches!(node.kind, NodeKind::If));
    assert_eq!(node.vals.len(), 1);
    assert_eq!(node.keys.len(), 1);
}
