//! Filter / weight / field expressions over event columns.
//!
//! Grammar: numbers, column identifiers, `+ - * /`, comparisons
//! (`== != < <= > >=`), `&& || !`, parentheses and the functions
//! `abs sqrt log exp pow min max`. Booleans are 1.0 / 0.0 and any value
//! `> 0` counts as true.

use std::collections::HashMap;

use hc_core::{Error, Result};

// ── AST ────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum Node {
    Const(f64),
    Column(usize),
    Neg(Box<Node>),
    Not(Box<Node>),
    Binary(Op, Box<Node>, Box<Node>),
    Call(Func, Vec<Node>),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Op {
    Or,
    And,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
    Sub,
    Mul,
    Div,
}

impl Op {
    /// Left binding power; higher binds tighter.
    fn precedence(self) -> u8 {
        match self {
            Op::Or => 1,
            Op::And => 2,
            Op::Eq | Op::Ne | Op::Lt | Op::Le | Op::Gt | Op::Ge => 3,
            Op::Add | Op::Sub => 4,
            Op::Mul | Op::Div => 5,
        }
    }

    fn apply(self, a: f64, b: f64) -> f64 {
        let truth = |c: bool| if c { 1.0 } else { 0.0 };
        match self {
            Op::Or => truth(a > 0.0 || b > 0.0),
            Op::And => truth(a > 0.0 && b > 0.0),
            Op::Eq => truth((a - b).abs() < f64::EPSILON),
            Op::Ne => truth((a - b).abs() >= f64::EPSILON),
            Op::Lt => truth(a < b),
            Op::Le => truth(a <= b),
            Op::Gt => truth(a > b),
            Op::Ge => truth(a >= b),
            Op::Add => a + b,
            Op::Sub => a - b,
            Op::Mul => a * b,
            Op::Div => a / b,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Func {
    Abs,
    Sqrt,
    Log,
    Exp,
    Pow,
    Min,
    Max,
}

impl Func {
    fn lookup(name: &str) -> Option<Self> {
        Some(match name {
            "abs" => Func::Abs,
            "sqrt" => Func::Sqrt,
            "log" => Func::Log,
            "exp" => Func::Exp,
            "pow" => Func::Pow,
            "min" => Func::Min,
            "max" => Func::Max,
            _ => return None,
        })
    }

    fn arity(self) -> usize {
        match self {
            Func::Abs | Func::Sqrt | Func::Log | Func::Exp => 1,
            Func::Pow | Func::Min | Func::Max => 2,
        }
    }
}

fn eval(node: &Node, row: &[f64]) -> f64 {
    match node {
        Node::Const(c) => *c,
        Node::Column(i) => row[*i],
        Node::Neg(a) => -eval(a, row),
        Node::Not(a) => {
            if eval(a, row) > 0.0 {
                0.0
            } else {
                1.0
            }
        }
        Node::Binary(op, a, b) => op.apply(eval(a, row), eval(b, row)),
        Node::Call(f, args) => {
            let x = eval(&args[0], row);
            match f {
                Func::Abs => x.abs(),
                Func::Sqrt => x.sqrt(),
                Func::Log => x.ln(),
                Func::Exp => x.exp(),
                Func::Pow => x.powf(eval(&args[1], row)),
                Func::Min => x.min(eval(&args[1], row)),
                Func::Max => x.max(eval(&args[1], row)),
            }
        }
    }
}

// ── Compiled expression ────────────────────────────────────────

/// A parsed expression ready to evaluate against column data.
#[derive(Debug, Clone)]
pub struct CompiledExpr {
    root: Node,
    source: String,
    /// Column names referenced, in order of first occurrence.
    pub columns: Vec<String>,
}

impl CompiledExpr {
    /// Parse an expression string.
    pub fn compile(input: &str) -> Result<Self> {
        let tokens = tokenize(input)?;
        if tokens.is_empty() {
            return Err(Error::Expression("empty expression".into()));
        }
        let mut parser = Parser { tokens: &tokens, pos: 0, columns: Vec::new() };
        let root = parser.expression(0)?;
        if let Some(tok) = parser.tokens.get(parser.pos) {
            return Err(Error::Expression(format!(
                "unexpected {tok:?} after expression in '{input}'"
            )));
        }
        Ok(Self { root, source: input.to_string(), columns: parser.columns })
    }

    /// Whether the expression references no columns.
    pub fn is_constant(&self) -> bool {
        self.columns.is_empty()
    }

    /// Evaluate one row; `row` follows the order of [`CompiledExpr::columns`].
    pub fn eval_row(&self, row: &[f64]) -> f64 {
        eval(&self.root, row)
    }

    /// Evaluate `n_entries` rows from a column map.
    pub fn eval_columns(
        &self,
        columns: &HashMap<String, Vec<f64>>,
        n_entries: usize,
    ) -> Result<Vec<f64>> {
        if self.is_constant() {
            return Ok(vec![self.eval_row(&[]); n_entries]);
        }
        let inputs: Vec<&[f64]> = self
            .columns
            .iter()
            .map(|name| {
                columns.get(name).map(Vec::as_slice).ok_or_else(|| {
                    Error::Expression(format!("missing column '{name}' for '{}'", self.source))
                })
            })
            .collect::<Result<_>>()?;

        if let Some(short) = inputs.iter().position(|c| c.len() < n_entries) {
            return Err(Error::Expression(format!(
                "column '{}' has {} entries, expected {n_entries}",
                self.columns[short],
                inputs[short].len()
            )));
        }

        let mut row = vec![0.0; inputs.len()];
        Ok((0..n_entries)
            .map(|i| {
                for (slot, col) in row.iter_mut().zip(&inputs) {
                    *slot = col[i];
                }
                self.eval_row(&row)
            })
            .collect())
    }
}

// ── Tokenizer ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Num(f64),
    Ident(String),
    Op(Op),
    Minus,
    Bang,
    LParen,
    RParen,
    Comma,
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let bytes = input.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i] as char;
        if c.is_ascii_whitespace() {
            i += 1;
            continue;
        }

        let pair = input.get(i..i + 2).unwrap_or("");
        let two = match pair {
            "&&" => Some(Op::And),
            "||" => Some(Op::Or),
            "==" => Some(Op::Eq),
            "!=" => Some(Op::Ne),
            "<=" => Some(Op::Le),
            ">=" => Some(Op::Ge),
            _ => None,
        };
        if let Some(op) = two {
            tokens.push(Token::Op(op));
            i += 2;
            continue;
        }

        let single = match c {
            '+' => Some(Token::Op(Op::Add)),
            '-' => Some(Token::Minus),
            '*' => Some(Token::Op(Op::Mul)),
            '/' => Some(Token::Op(Op::Div)),
            '<' => Some(Token::Op(Op::Lt)),
            '>' => Some(Token::Op(Op::Gt)),
            '!' => Some(Token::Bang),
            '(' => Some(Token::LParen),
            ')' => Some(Token::RParen),
            ',' => Some(Token::Comma),
            _ => None,
        };
        if let Some(tok) = single {
            tokens.push(tok);
            i += 1;
            continue;
        }

        if c.is_ascii_digit() || c == '.' {
            let start = i;
            while i < bytes.len() {
                let d = bytes[i] as char;
                let exp_sign = (d == '+' || d == '-') && matches!(bytes[i - 1], b'e' | b'E');
                if d.is_ascii_digit() || d == '.' || d == 'e' || d == 'E' || exp_sign {
                    i += 1;
                } else {
                    break;
                }
            }
            let text = &input[start..i];
            let n = text
                .parse::<f64>()
                .map_err(|_| Error::Expression(format!("invalid number '{text}'")))?;
            tokens.push(Token::Num(n));
            continue;
        }

        if c.is_ascii_alphabetic() || c == '_' {
            let start = i;
            while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                i += 1;
            }
            tokens.push(Token::Ident(input[start..i].to_string()));
            continue;
        }

        return Err(Error::Expression(format!("unexpected character '{c}' in '{input}'")));
    }

    Ok(tokens)
}

// ── Parser (precedence climbing) ───────────────────────────────

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
    columns: Vec<String>,
}

impl Parser<'_> {
    fn next(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn peek_op(&self) -> Option<Op> {
        match self.tokens.get(self.pos) {
            Some(Token::Op(op)) => Some(*op),
            Some(Token::Minus) => Some(Op::Sub),
            _ => None,
        }
    }

    fn expect(&mut self, want: Token) -> Result<()> {
        match self.next() {
            Some(t) if t == want => Ok(()),
            got => Err(Error::Expression(format!("expected {want:?}, got {got:?}"))),
        }
    }

    fn column(&mut self, name: String) -> usize {
        match self.columns.iter().position(|c| *c == name) {
            Some(i) => i,
            None => {
                self.columns.push(name);
                self.columns.len() - 1
            }
        }
    }

    /// Parse a (left-associative) expression whose operators bind tighter than `min_prec`.
    fn expression(&mut self, min_prec: u8) -> Result<Node> {
        let mut lhs = self.unary()?;
        while let Some(op) = self.peek_op() {
            let prec = op.precedence();
            if prec <= min_prec {
                break;
            }
            self.pos += 1;
            let rhs = self.expression(prec)?;
            lhs = Node::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Node> {
        match self.tokens.get(self.pos) {
            Some(Token::Minus) => {
                self.pos += 1;
                Ok(Node::Neg(Box::new(self.unary()?)))
            }
            Some(Token::Bang) => {
                self.pos += 1;
                Ok(Node::Not(Box::new(self.unary()?)))
            }
            _ => self.atom(),
        }
    }

    fn atom(&mut self) -> Result<Node> {
        match self.next() {
            Some(Token::Num(n)) => Ok(Node::Const(n)),
            Some(Token::LParen) => {
                let inner = self.expression(0)?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some(Token::Ident(name)) => {
                if self.tokens.get(self.pos) != Some(&Token::LParen) {
                    return Ok(Node::Column(self.column(name)));
                }
                self.pos += 1;
                let func = Func::lookup(&name)
                    .ok_or_else(|| Error::Expression(format!("unknown function '{name}'")))?;
                let mut args = vec![self.expression(0)?];
                while self.tokens.get(self.pos) == Some(&Token::Comma) {
                    self.pos += 1;
                    args.push(self.expression(0)?);
                }
                self.expect(Token::RParen)?;
                if args.len() != func.arity() {
                    return Err(Error::Expression(format!(
                        "'{name}' takes {} argument(s), got {}",
                        func.arity(),
                        args.len()
                    )));
                }
                Ok(Node::Call(func, args))
            }
            got => Err(Error::Expression(format!(
                "expected number, column or '(', got {got:?}"
            ))),
        }
    }
}
