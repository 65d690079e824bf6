//! Injection-safe full-text query parser
//!
//! This is the only path from user text into the storage engine's MATCH
//! syntax. Input is parsed into a small AST and re-emitted with every leaf
//! quoted, so nothing the user typed is ever interpreted as query syntax.
//! Anything that looks like an attempt to break out of the query language
//! is rejected outright rather than cleaned up.
//!
//! Grammar:
//!
//! ```text
//! query   := or
//! or      := and ("OR" and)*
//! and     := unary (["AND"] unary)*
//! unary   := "NOT" unary | primary
//! primary := "(" or ")" | PHRASE | TERM
//! ```

use crate::config::QueryConfig;
use crate::error::{PatternError, Result};
use serde::{Deserialize, Serialize};

/// Sequences that are never allowed anywhere in a query
const FORBIDDEN: [&str; 6] = [";", "`", "\\", "--", "/*", "*/"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum QueryNode {
    Term(String),
    Phrase(String),
    And(Vec<QueryNode>),
    Or(Vec<QueryNode>),
    Not(Box<QueryNode>),
}

impl QueryNode {
    /// Leaf texts in order
    pub fn leaves(&self) -> Vec<&str> {
        let mut out = Vec::new();
        let mut stack = vec![self];
        while let Some(node) = stack.pop() {
            match node {
                QueryNode::Term(t) | QueryNode::Phrase(t) => out.push(t.as_str()),
                QueryNode::And(children) | QueryNode::Or(children) => {
                    stack.extend(children.iter().rev());
                }
                QueryNode::Not(child) => stack.push(child),
            }
        }
        out
    }

    /// Leaf texts that are not under a negation
    pub fn positive_leaves(&self) -> Vec<&str> {
        match self {
            QueryNode::Term(t) | QueryNode::Phrase(t) => vec![t.as_str()],
            QueryNode::And(children) | QueryNode::Or(children) => {
                children.iter().flat_map(|c| c.positive_leaves()).collect()
            }
            QueryNode::Not(_) => Vec::new(),
        }
    }

    pub fn leaf_count(&self) -> usize {
        self.leaves().len()
    }

    /// Canonical form: quoted and bare leaves are the same leaf, nested
    /// same-kind groups are flattened, single-child groups are unwrapped.
    pub fn normalized(&self) -> QueryNode {
        match self {
            QueryNode::Term(t) | QueryNode::Phrase(t) => QueryNode::Phrase(t.clone()),
            QueryNode::Not(child) => QueryNode::Not(Box::new(child.normalized())),
            QueryNode::And(children) => flatten(children, true),
            QueryNode::Or(children) => flatten(children, false),
        }
    }

    pub fn is_equivalent(&self, other: &QueryNode) -> bool {
        self.normalized() == other.normalized()
    }
}

fn flatten(children: &[QueryNode], is_and: bool) -> QueryNode {
    let mut flat = Vec::with_capacity(children.len());
    for child in children {
        match (child.normalized(), is_and) {
            (QueryNode::And(inner), true) | (QueryNode::Or(inner), false) => flat.extend(inner),
            (other, _) => flat.push(other),
        }
    }
    if flat.len() == 1 {
        return flat.remove(0);
    }
    if is_and {
        QueryNode::And(flat)
    } else {
        QueryNode::Or(flat)
    }
}

/// A query string produced by [`ast_to_fts_query`]. The storage search
/// primitive only accepts this type, never raw text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SafeFtsQuery {
    query: String,
    ast: QueryNode,
}

impl SafeFtsQuery {
    pub(crate) fn from_ast(ast: QueryNode) -> Self {
        Self {
            query: ast_to_fts_query(&ast),
            ast,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.query
    }

    pub fn ast(&self) -> &QueryNode {
        &self.ast
    }
}

impl std::fmt::Display for SafeFtsQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.query)
    }
}

/// Quote a leaf, doubling embedded quotes
pub fn quote_leaf(text: &str) -> String {
    format!("\"{}\"", text.replace('"', "\"\""))
}

/// Emit the safe query string for an AST.
///
/// Conjunctions are written with an explicit `AND`: the index does not
/// implicitly join a parenthesized group with a neighbouring leaf. A negated
/// conjunct is written as the binary `a NOT b`.
pub fn ast_to_fts_query(node: &QueryNode) -> String {
    match node {
        QueryNode::And(children) => {
            let mut out = String::new();
            for (i, child) in children.iter().enumerate() {
                match child {
                    QueryNode::Not(inner) if i > 0 => {
                        out.push_str(" NOT ");
                        out.push_str(&emit_operand(inner));
                    }
                    other => {
                        if i > 0 {
                            out.push_str(" AND ");
                        }
                        out.push_str(&emit_operand(other));
                    }
                }
            }
            out
        }
        other => emit_operand(other),
    }
}

/// Emit a node that must read as a single operand
fn emit_operand(node: &QueryNode) -> String {
    match node {
        QueryNode::Term(t) | QueryNode::Phrase(t) => quote_leaf(t),
        QueryNode::And(items) if items.len() > 1 => format!("({})", ast_to_fts_query(node)),
        QueryNode::And(items) => items.first().map(emit_operand).unwrap_or_default(),
        QueryNode::Or(children) => format!(
            "({})",
            children
                .iter()
                .map(ast_to_fts_query)
                .collect::<Vec<_>>()
                .join(" OR ")
        ),
        QueryNode::Not(child) => format!("NOT {}", emit_operand(child)),
    }
}

/// Reject any forbidden sequence in `text`
pub fn check_forbidden(text: &str) -> Result<()> {
    for seq in FORBIDDEN {
        if text.contains(seq) {
            return Err(PatternError::validation(format!(
                "query contains forbidden sequence '{}'",
                seq
            )));
        }
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Word(String),
    Quoted(String),
    And,
    Or,
    Not,
    LParen,
    RParen,
}

#[derive(Debug, Clone)]
pub struct ParsedQuery {
    pub ast: QueryNode,
    pub safe: SafeFtsQuery,
}

/// Recursive-descent parser with hard input limits
#[derive(Debug, Clone)]
pub struct FtsQueryParser {
    max_chars: usize,
    max_tokens: usize,
    max_depth: usize,
}

impl FtsQueryParser {
    pub fn new(config: &QueryConfig) -> Self {
        Self {
            max_chars: config.max_query_chars,
            max_tokens: config.max_tokens,
            max_depth: config.max_depth,
        }
    }

    pub fn parse(&self, input: &str) -> Result<ParsedQuery> {
        let char_count = input.chars().count();
        if char_count > self.max_chars {
            return Err(PatternError::validation(format!(
                "query is {} characters, limit is {}",
                char_count, self.max_chars
            )));
        }
        check_forbidden(input)?;

        let tokens = self.tokenize(input)?;
        if tokens.is_empty() {
            return Err(PatternError::validation("query is empty"));
        }

        let mut cursor = Cursor {
            tokens: &tokens,
            pos: 0,
            max_depth: self.max_depth,
        };
        let ast = cursor.parse_or(0)?;
        if let Some(extra) = cursor.peek() {
            return Err(PatternError::validation(match extra {
                Token::RParen => "unbalanced parentheses: unexpected ')'".to_string(),
                other => format!("unexpected token {:?}", other),
            }));
        }

        Ok(ParsedQuery {
            safe: SafeFtsQuery::from_ast(ast.clone()),
            ast,
        })
    }

    fn tokenize(&self, input: &str) -> Result<Vec<Token>> {
        let mut tokens = Vec::new();
        let mut chars = input.chars().peekable();
        // Parentheses are structure, not content, and do not count toward the limit
        let mut counted = 0usize;

        while let Some(&c) = chars.peek() {
            if c.is_whitespace() {
                chars.next();
                continue;
            }

            let token = match c {
                '(' => {
                    chars.next();
                    Token::LParen
                }
                ')' => {
                    chars.next();
                    Token::RParen
                }
                '"' => {
                    chars.next();
                    let mut phrase = String::new();
                    let mut closed = false;
                    while let Some(ch) = chars.next() {
                        if ch == '"' {
                            if chars.peek() == Some(&'"') {
                                chars.next();
                                phrase.push('"');
                                continue;
                            }
                            closed = true;
                            break;
                        }
                        phrase.push(ch);
                    }
                    if !closed {
                        return Err(PatternError::validation("unbalanced quotes"));
                    }
                    if phrase.trim().is_empty() {
                        return Err(PatternError::validation("empty phrase"));
                    }
                    Token::Quoted(phrase)
                }
                _ => {
                    let mut word = String::new();
                    while let Some(&ch) = chars.peek() {
                        if ch.is_whitespace() || matches!(ch, '(' | ')' | '"') {
                            break;
                        }
                        word.push(ch);
                        chars.next();
                    }
                    match word.as_str() {
                        "AND" => Token::And,
                        "OR" => Token::Or,
                        "NOT" => Token::Not,
                        _ => Token::Word(word),
                    }
                }
            };

            if !matches!(token, Token::LParen | Token::RParen) {
                counted += 1;
                if counted > self.max_tokens {
                    return Err(PatternError::validation(format!(
                        "query has more than {} tokens",
                        self.max_tokens
                    )));
                }
            }
            tokens.push(token);
        }

        Ok(tokens)
    }
}

impl Default for FtsQueryParser {
    fn default() -> Self {
        Self::new(&QueryConfig::default())
    }
}

struct Cursor<'a> {
    tokens: &'a [Token],
    pos: usize,
    max_depth: usize,
}

impl Cursor<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<&Token> {
        let token = self.tokens.get(self.pos);
        self.pos += 1;
        token
    }

    fn check_depth(&self, depth: usize) -> Result<()> {
        if depth > self.max_depth {
            return Err(PatternError::validation(format!(
                "query nesting exceeds depth {}",
                self.max_depth
            )));
        }
        Ok(())
    }

    fn starts_operand(token: Option<&Token>) -> bool {
        matches!(
            token,
            Some(Token::Word(_) | Token::Quoted(_) | Token::Not | Token::LParen)
        )
    }

    fn parse_or(&mut self, depth: usize) -> Result<QueryNode> {
        let mut items = vec![self.parse_and(depth)?];
        while self.peek() == Some(&Token::Or) {
            self.advance();
            if !Self::starts_operand(self.peek()) {
                return Err(PatternError::validation("operator OR is missing its right operand"));
            }
            items.push(self.parse_and(depth)?);
        }
        Ok(if items.len() == 1 {
            items.remove(0)
        } else {
            QueryNode::Or(items)
        })
    }

    fn parse_and(&mut self, depth: usize) -> Result<QueryNode> {
        let mut items = vec![self.parse_unary(depth)?];
        loop {
            match self.peek() {
                Some(Token::And) => {
                    self.advance();
                    if !Self::starts_operand(self.peek()) {
                        return Err(PatternError::validation(
                            "operator AND is missing its right operand",
                        ));
                    }
                    items.push(self.parse_unary(depth)?);
                }
                next if Self::starts_operand(next) => items.push(self.parse_unary(depth)?),
                _ => break,
            }
        }
        Ok(if items.len() == 1 {
            items.remove(0)
        } else {
            QueryNode::And(items)
        })
    }

    fn parse_unary(&mut self, depth: usize) -> Result<QueryNode> {
        // NOT chains are bounded by the token limit, only groups count as depth
        if self.peek() == Some(&Token::Not) {
            self.advance();
            if !Self::starts_operand(self.peek()) {
                return Err(PatternError::validation("operator NOT is missing its operand"));
            }
            return Ok(QueryNode::Not(Box::new(self.parse_unary(depth)?)));
        }
        self.parse_primary(depth)
    }

    fn parse_primary(&mut self, depth: usize) -> Result<QueryNode> {
        match self.advance().cloned() {
            Some(Token::Word(w)) => Ok(QueryNode::Term(w)),
            Some(Token::Quoted(p)) => Ok(QueryNode::Phrase(p)),
            Some(Token::LParen) => {
                self.check_depth(depth + 1)?;
                if self.peek() == Some(&Token::RParen) {
                    return Err(PatternError::validation("empty group '()'"));
                }
                let inner = self.parse_or(depth + 1)?;
                match self.advance() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(PatternError::validation("unbalanced parentheses: missing ')'")),
                }
            }
            Some(Token::RParen) => Err(PatternError::validation("unbalanced parentheses: unexpected ')'")),
            Some(op @ (Token::And | Token::Or | Token::Not)) => Err(PatternError::validation(format!(
                "operator {:?} is missing its left operand",
                op
            ))),
            None => Err(PatternError::validation("query ended unexpectedly")),
        }
    }
}
