//! Expression parsing: shunting yard, operands, postfix chains and string
//! interpolation.

use crate::ast::{InterpPart, Node, NodeKind, RESULTS_ALL, RESULTS_DISCARD, RESULTS_FIRST};
use crate::bytecode::Opcode;
use crate::error::ParserError;
use crate::lexer::scanner::is_name;
use crate::lexer::{Scanner, TokenKind};
use crate::parser::precedence::{self, OperatorInfo};
use crate::parser::{ParseResult, Parser};
use crate::runtime::value::Value;
use crate::span::Span;

impl Parser<'_> {
    /// Parse an expression list `a[,b,...] = v[,v,...]`, reconciling its
    /// result count through the MARK/LIMIT envelope recorded on the node.
    pub(crate) fn parse_multi(&mut self, results: i64, commas: bool) -> ParseResult<Node> {
        let span = self.current_span();
        let mut keys: Vec<Node> = Vec::new();
        let mut vals: Vec<Node> = Vec::new();

        loop {
            // shunting yard
            let mut ops: Vec<OperatorInfo> = Vec::new();
            let mut args: Vec<Node> = Vec::new();

            loop {
                if self.match_token(&TokenKind::LParen) {
                    let mut inner = self.parse_multi(RESULTS_FIRST, true)?;
                    self.expect(&TokenKind::RParen)?;
                    inner.results = RESULTS_FIRST;
                    args.push(inner);
                } else {
                    args.push(self.parse_node()?);
                }

                let Some(op) = precedence::operator(&self.peek().kind) else {
                    break;
                };
                self.advance();

                while ops
                    .last()
                    .is_some_and(|top| top.precedence >= op.precedence)
                {
                    let consume = ops.pop().ok_or_else(|| {
                        ParserError::UnbalancedExpression(self.current_span())
                    })?;
                    self.reduce(&mut args, consume)?;
                }

                let unary = op.argc == 1;
                ops.push(op);
                if unary && !args.is_empty() {
                    break;
                }
            }

            while let Some(consume) = ops.pop() {
                self.reduce(&mut args, consume)?;
            }

            if args.len() != 1 {
                return Err(ParserError::UnbalancedExpression(self.current_span()));
            }
            vals.extend(args);

            if self.match_token(&TokenKind::Assign) {
                if vals.is_empty() {
                    return Err(ParserError::general(
                        "missing assignment name",
                        self.current_span(),
                    ));
                }
                keys.append(&mut vals);
                continue;
            }

            if commas && self.match_token(&TokenKind::Comma) {
                continue;
            }

            break;
        }

        if vals.is_empty() {
            return Err(ParserError::general(
                "missing assignment value",
                self.current_span(),
            ));
        }

        let solo = keys.is_empty() && vals.len() == 1;

        // control nodes handle their own result limits
        if solo && vals[0].control {
            return Ok(vals.remove(0));
        }

        // nodes guaranteed to produce one value need no envelope
        if solo && results != RESULTS_DISCARD && vals[0].single {
            return Ok(vals.remove(0));
        }

        let mut node = Node::new(NodeKind::Multi, span);
        node.keys = keys;
        node.vals = vals;
        node.results = results;
        Ok(node)
    }

    fn reduce(&self, args: &mut Vec<Node>, op: OperatorInfo) -> ParseResult<()> {
        if args.len() < op.argc {
            return Err(ParserError::general(
                format!("operator {} insufficient arguments", op.opcode),
                self.current_span(),
            ));
        }
        let children = args.split_off(args.len() - op.argc);
        let mut node = Node::new(NodeKind::Operator(op.opcode), self.previous_span());
        node.single = op.single;
        node.vals = children;
        args.push(node);
        Ok(())
    }

    /// Parse one operand: an optional modifier prefix, a primary, and its
    /// postfix chain of calls, indexes, fields and method calls.
    pub(crate) fn parse_node(&mut self) -> ParseResult<Node> {
        let span = self.current_span();

        let modifier = match self.peek().kind {
            TokenKind::Hash => Some(Opcode::Count),
            TokenKind::Minus => Some(Opcode::Neg),
            TokenKind::Bang => Some(Opcode::Not),
            _ => None,
        };
        if let Some(op) = modifier {
            self.advance();
            let inner = self.parse_node()?;
            let mut node = Node::new(NodeKind::Inline(op), span);
            node.single = true;
            node.args = Some(Box::new(inner));
            return Ok(node);
        }

        let mut node = match self.peek().kind.clone() {
            TokenKind::Name(name) => {
                self.advance();
                Node::new(NodeKind::Name(self.interner.intern(&name)), span)
            }
            TokenKind::Global => {
                self.advance();
                Node::new(NodeKind::Inline(Opcode::Global), span)
            }
            TokenKind::True => {
                self.advance();
                literal(Value::Bool(true), span)
            }
            TokenKind::False => {
                self.advance();
                literal(Value::Bool(false), span)
            }
            TokenKind::Nil => {
                self.advance();
                literal(Value::Nil, span)
            }
            TokenKind::Int(n) => {
                self.advance();
                literal(Value::Int(n), span)
            }
            TokenKind::Float(n) => {
                self.advance();
                literal(Value::Float(n), span)
            }
            TokenKind::Str(s) => {
                self.advance();
                self.string_node(&s, span)?
            }
            TokenKind::LongStr(s) => {
                self.advance();
                literal(Value::Str(self.interner.intern(&s)), span)
            }
            TokenKind::Break => {
                self.advance();
                let mut node = Node::new(NodeKind::Inline(Opcode::Break), span);
                node.control = true;
                node
            }
            TokenKind::Continue => {
                self.advance();
                let mut node = Node::new(NodeKind::Inline(Opcode::Continue), span);
                node.control = true;
                node
            }
            TokenKind::If => self.parse_if()?,
            TokenKind::While => self.parse_while()?,
            TokenKind::For => self.parse_for()?,
            TokenKind::Function => self.parse_function()?,
            TokenKind::Return => self.parse_return()?,
            TokenKind::LBracket => self.parse_vector()?,
            TokenKind::LBrace => self.parse_map()?,
            other => {
                return Err(ParserError::unexpected_token(
                    "expression",
                    format!("{}", other),
                    span,
                ))
            }
        };

        // postfix chains
        loop {
            match self.peek().kind {
                TokenKind::LParen => {
                    let args = self.parse_arglist()?;
                    let prev = node.chain_tail();
                    if prev.index || prev.call || prev.args.is_some() {
                        let mut call = Node::new(NodeKind::CallChain, self.previous_span());
                        call.args = args;
                        prev.chain = Some(Box::new(call));
                    } else {
                        prev.call = true;
                        prev.args = args;
                    }
                    // further calls chain through CallChain links on re-entry
                    break;
                }
                TokenKind::LBracket => {
                    self.advance();
                    let mut inner = self.parse_node()?;
                    self.expect(&TokenKind::RBracket)?;
                    inner.index = true;
                    node.chain_tail().chain = Some(Box::new(inner));
                }
                TokenKind::Dot if matches!(self.peek_nth(1).kind, TokenKind::Name(_)) => {
                    self.advance();
                    let mut inner = self.parse_node()?;
                    inner.field = true;
                    node.chain_tail().chain = Some(Box::new(inner));
                }
                TokenKind::Colon if matches!(self.peek_nth(1).kind, TokenKind::Name(_)) => {
                    self.advance();
                    let mut inner = self.parse_node()?;
                    inner.field = true;
                    inner.method = true;
                    node.chain_tail().chain = Some(Box::new(inner));
                }
                _ => break,
            }
        }

        Ok(node)
    }

    /// Parse a parenthesized argument list; `None` for empty parens.
    pub(crate) fn parse_arglist(&mut self) -> ParseResult<Option<Box<Node>>> {
        self.expect(&TokenKind::LParen)?;
        if self.match_token(&TokenKind::RParen) {
            return Ok(None);
        }
        let node = self.parse_multi(RESULTS_ALL, true)?;
        self.expect(&TokenKind::RParen)?;
        Ok(Some(Box::new(node)))
    }

    /// Build a node for a double-quoted string, splitting `$name` and
    /// `$(expr)` interpolation into sub-expressions.
    fn string_node(&mut self, s: &str, span: Span) -> ParseResult<Node> {
        if !s.contains('$') {
            let mut node = literal(Value::Str(self.interner.intern(s)), span);
            node.single = true;
            return Ok(node);
        }

        let mut parts: Vec<InterpPart> = Vec::new();
        let mut left: &str = s;

        while let Some(pos) = left.find('$') {
            let start = &left[pos + 1..];
            let (expr_text, consumed) = if let Some(inner) = start.strip_prefix('(') {
                let close = matching_paren(inner).ok_or_else(|| {
                    ParserError::general("string interpolation missing closing paren", span)
                })?;
                (Some(&inner[..close]), pos + 2 + close + 1)
            } else {
                let end = start
                    .char_indices()
                    .find(|(_, c)| !is_name(*c))
                    .map(|(i, _)| i)
                    .unwrap_or(start.len());
                if end > 0 {
                    (Some(&start[..end]), pos + 1 + end)
                } else {
                    (None, pos + 1)
                }
            };

            // a bare '$' stays in the literal text
            let text_end = if expr_text.is_some() { pos } else { pos + 1 };
            if text_end > 0 {
                parts.push(InterpPart::Text(self.interner.intern(&left[..text_end])));
            }
            if let Some(text) = expr_text {
                let node = self.parse_embedded(text, span)?;
                parts.push(InterpPart::Expr(Box::new(node)));
            }
            left = &left[consumed..];
        }
        if !left.is_empty() {
            parts.push(InterpPart::Text(self.interner.intern(left)));
        }

        // interpolation that degenerated to plain text
        if parts.len() == 1 {
            if let InterpPart::Text(id) = parts[0] {
                let mut node = literal(Value::Str(id), span);
                node.single = true;
                return Ok(node);
            }
        }
        if parts.is_empty() {
            let mut node = literal(Value::Str(self.interner.intern("")), span);
            node.single = true;
            return Ok(node);
        }

        let mut node = Node::new(NodeKind::Interp(parts), span);
        node.single = true;
        Ok(node)
    }

    /// Parse an interpolation sub-expression with a temporary token stream.
    fn parse_embedded(&mut self, text: &str, span: Span) -> ParseResult<Node> {
        let sub_tokens = Scanner::new(text).scan_tokens().map_err(ParserError::from)?;
        let saved_tokens = std::mem::replace(&mut self.tokens, sub_tokens);
        let saved_current = std::mem::replace(&mut self.current, 0);

        let result = self.parse_multi(RESULTS_FIRST, true);
        let consumed = self.is_at_end();

        self.tokens = saved_tokens;
        self.current = saved_current;

        let node = result?;
        if !consumed {
            return Err(ParserError::general(
                "string interpolation parsing failed",
                span,
            ));
        }
        Ok(node)
    }
}

fn literal(value: Value, span: Span) -> Node {
    let mut node = Node::new(NodeKind::Literal(value), span);
    node.single = true;
    node
}

/// Byte index of the `)` matching an implicit opening paren before `s`.
fn matching_paren(s: &str) -> Option<usize> {
    let mut depth = 1usize;
    for (i, c) in s.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}
