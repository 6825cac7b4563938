//! Control-structure parsing: blocks, branches, loops, functions.

use crate::ast::{FnDef, FnPath, Node, NodeKind, RESULTS_ALL, RESULTS_DISCARD, RESULTS_FIRST};
use crate::error::ParserError;
use crate::lexer::TokenKind;
use crate::parser::{ParseResult, Parser};
use crate::runtime::heap::MAX_PATH;
use crate::runtime::value::StrId;

impl Parser<'_> {
    /// Parse statements up to `end` into `vals`.
    fn parse_block_into(&mut self, vals: &mut Vec<Node>) -> ParseResult<()> {
        // Lua habits
        self.match_token(&TokenKind::Do);

        loop {
            if self.match_token(&TokenKind::End) {
                return Ok(());
            }
            if self.is_at_end() {
                return Err(ParserError::unexpected_token(
                    "'end'",
                    "end of input",
                    self.current_span(),
                ));
            }
            vals.push(self.parse_multi(RESULTS_DISCARD, true)?);
        }
    }

    /// Parse an `if` body with an optional `else` arm. The last statement of
    /// each arm yields its value, which is what makes `if` usable as a
    /// ternary expression.
    fn parse_branch(&mut self, node: &mut Node) -> ParseResult<()> {
        // Lua habits
        self.match_token(&TokenKind::Then);

        let mut found_else = false;
        loop {
            if self.match_token(&TokenKind::End) {
                break;
            }
            if self.match_token(&TokenKind::Else) {
                found_else = true;
                break;
            }
            if self.is_at_end() {
                return Err(ParserError::unexpected_token(
                    "'else' or 'end'",
                    "end of input",
                    self.current_span(),
                ));
            }
            node.vals.push(self.parse_multi(RESULTS_DISCARD, true)?);
        }

        if found_else {
            loop {
                if self.match_token(&TokenKind::End) {
                    break;
                }
                if self.is_at_end() {
                    return Err(ParserError::unexpected_token(
                        "'end'",
                        "end of input",
                        self.current_span(),
                    ));
                }
                node.keys.push(self.parse_multi(RESULTS_DISCARD, true)?);
            }
        }

        if let Some(last) = node.vals.last_mut() {
            set_results_first(last);
        }
        if let Some(last) = node.keys.last_mut() {
            set_results_first(last);
        }
        Ok(())
    }

    pub(crate) fn parse_if(&mut self) -> ParseResult<Node> {
        let span = self.current_span();
        self.advance();
        let mut node = Node::new(NodeKind::If, span);
        // control stays false so `if` works in ternary position
        node.args = Some(Box::new(self.parse_multi(RESULTS_FIRST, true)?));
        self.parse_branch(&mut node)?;
        Ok(node)
    }

    pub(crate) fn parse_while(&mut self) -> ParseResult<Node> {
        let span = self.current_span();
        self.advance();
        let mut node = Node::new(NodeKind::While, span);
        node.control = true;
        node.args = Some(Box::new(self.parse_multi(RESULTS_FIRST, true)?));
        self.parse_block_into(&mut node.vals)?;
        Ok(node)
    }

    pub(crate) fn parse_for(&mut self) -> ParseResult<Node> {
        let span = self.current_span();
        self.advance();

        // [key[,val]] loop variable names
        let mut names: Vec<StrId> = Vec::new();
        if !self.check(&TokenKind::In) {
            names.push(self.expect_name()?);
            if self.match_token(&TokenKind::Comma) {
                names.push(self.expect_name()?);
            }
        }
        self.expect(&TokenKind::In)?;

        let mut node = Node::new(NodeKind::For(names), span);
        node.control = true;
        node.args = Some(Box::new(self.parse_multi(RESULTS_FIRST, true)?));
        self.parse_block_into(&mut node.vals)?;
        Ok(node)
    }

    pub(crate) fn parse_function(&mut self) -> ParseResult<Node> {
        let span = self.current_span();
        self.advance();

        if self.fn_stack.len() >= MAX_PATH {
            return Err(ParserError::NestingLimit(MAX_PATH, span));
        }
        self.next_fn_id += 1;
        let id = self.next_fn_id;
        let ancestors = self.fn_stack.clone();
        self.fn_stack.push(id);

        // optional function name
        let name = if matches!(self.peek().kind, TokenKind::Name(_)) {
            Some(self.expect_name()?)
        } else {
            None
        };

        let mut params: Vec<StrId> = Vec::new();
        if self.match_token(&TokenKind::LParen) {
            loop {
                if self.match_token(&TokenKind::RParen) {
                    break;
                }
                if self.match_token(&TokenKind::Comma) {
                    continue;
                }
                params.push(self.expect_name()?);
            }
        }

        let mut node = Node::new(
            NodeKind::Function(FnDef {
                name,
                params,
                path: FnPath { id, ancestors },
            }),
            span,
        );
        node.control = true;
        self.parse_block_into(&mut node.vals)?;

        self.fn_stack.pop();
        Ok(node)
    }

    pub(crate) fn parse_return(&mut self) -> ParseResult<Node> {
        let span = self.current_span();
        self.advance();
        let mut node = Node::new(NodeKind::Return, span);
        node.control = true;
        if !self.check(&TokenKind::End) && !self.is_at_end() {
            node.args = Some(Box::new(self.parse_multi(RESULTS_ALL, true)?));
        }
        Ok(node)
    }

    pub(crate) fn parse_vector(&mut self) -> ParseResult<Node> {
        let span = self.current_span();
        self.advance();
        let mut node = Node::new(NodeKind::VecLit, span);
        node.single = true;
        loop {
            if self.match_token(&TokenKind::RBracket) {
                break;
            }
            if self.match_token(&TokenKind::Comma) {
                continue;
            }
            if self.is_at_end() {
                return Err(ParserError::unexpected_token(
                    "']'",
                    "end of input",
                    self.current_span(),
                ));
            }
            node.vals.push(self.parse_multi(RESULTS_ALL, false)?);
        }
        Ok(node)
    }

    pub(crate) fn parse_map(&mut self) -> ParseResult<Node> {
        let span = self.current_span();
        self.advance();
        let mut node = Node::new(NodeKind::MapLit, span);
        node.single = true;
        loop {
            if self.match_token(&TokenKind::RBrace) {
                break;
            }
            if self.match_token(&TokenKind::Comma) {
                continue;
            }
            if self.is_at_end() {
                return Err(ParserError::unexpected_token(
                    "'}'",
                    "end of input",
                    self.current_span(),
                ));
            }
            let pair_span = self.current_span();
            let pair = self.parse_multi(RESULTS_DISCARD, false)?;
            let well_formed = matches!(pair.kind, NodeKind::Multi)
                && pair.keys.len() == 1
                && pair.vals.len() == 1;
            if !well_formed {
                return Err(ParserError::general("expected key/val pair", pair_span));
            }
            node.vals.push(pair);
        }
        Ok(node)
    }

    fn expect_name(&mut self) -> ParseResult<StrId> {
        match self.peek().kind.clone() {
            TokenKind::Name(name) => {
                self.advance();
                Ok(self.interner.intern(&name))
            }
            other => Err(ParserError::unexpected_token(
                "name",
                format!("{}", other),
                self.current_span(),
            )),
        }
    }
}

fn set_results_first(node: &mut Node) {
    if matches!(node.kind, NodeKind::Multi) {
        node.results = RESULTS_FIRST;
    }
}
