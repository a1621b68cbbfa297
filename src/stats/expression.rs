//! Calculated-column expressions.
//!
//! Two dialects share one parser. `Dialect::Algebraic` covers plain
//! arithmetic over column references; `Dialect::Numeric` adds powers, modulo,
//! comparisons and a small function library. `evaluate` tries the algebraic
//! dialect first and falls back to the numeric one.
//!
//! Columns are bare identifiers (`turnout`) or back-quoted names
//! (`` `Labour votes` ``). A null cell evaluates to NaN, and a NaN or
//! infinite result is reported as `None`.

use super::typing::cell_f64;
use crate::errors::AppError;
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Algebraic,
    Numeric,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Ident(String),
    Column(String),
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Power,
    LParen,
    RParen,
    Comma,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Number(f64),
    Column(String),
    Neg(Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    Call(String, Vec<Expr>),
}

fn tokenize(source: &str, dialect: Dialect) -> Result<Vec<Token>, String> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        let token = match c {
            ' ' | '\t' | '\n' | '\r' => {
                i += 1;
                continue;
            }
            '0'..='9' | '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                if i < chars.len() && matches!(chars[i], 'e' | 'E') {
                    let mut j = i + 1;
                    if j < chars.len() && matches!(chars[j], '+' | '-') {
                        j += 1;
                    }
                    if j < chars.len() && chars[j].is_ascii_digit() {
                        i = j;
                        while i < chars.len() && chars[i].is_ascii_digit() {
                            i += 1;
                        }
                    }
                }
                let literal: String = chars[start..i].iter().collect();
                let value = literal
                    .parse::<f64>()
                    .map_err(|_| format!("invalid number '{}'", literal))?;
                tokens.push(Token::Number(value));
                continue;
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
                continue;
            }
            '`' => {
                let start = i + 1;
                let end = chars[start..]
                    .iter()
                    .position(|&ch| ch == '`')
                    .map(|offset| start + offset)
                    .ok_or_else(|| "unterminated back-quoted column name".to_string())?;
                tokens.push(Token::Column(chars[start..end].iter().collect()));
                i = end + 1;
                continue;
            }
            '+' => Token::Plus,
            '-' => Token::Minus,
            '*' if next == Some('*') => {
                i += 1;
                Token::Power
            }
            '*' => Token::Star,
            '/' => Token::Slash,
            '(' => Token::LParen,
            ')' => Token::RParen,
            '%' => Token::Percent,
            '^' => Token::Power,
            ',' => Token::Comma,
            '<' if next == Some('=') => {
                i += 1;
                Token::Le
            }
            '<' => Token::Lt,
            '>' if next == Some('=') => {
                i += 1;
                Token::Ge
            }
            '>' => Token::Gt,
            '=' if next == Some('=') => {
                i += 1;
                Token::Eq
            }
            '!' if next == Some('=') => {
                i += 1;
                Token::Ne
            }
            other => return Err(format!("unexpected character '{}'", other)),
        };

        if dialect == Dialect::Algebraic
            && !matches!(
                token,
                Token::Plus
                    | Token::Minus
                    | Token::Star
                    | Token::Slash
                    | Token::LParen
                    | Token::RParen
            )
        {
            return Err(format!("operator {:?} is not supported", token));
        }
        tokens.push(token);
        i += 1;
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    dialect: Dialect,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn expect(&mut self, expected: Token) -> Result<(), String> {
        match self.advance() {
            Some(token) if token == expected => Ok(()),
            Some(token) => Err(format!("expected {:?}, found {:?}", expected, token)),
            None => Err(format!("expected {:?}, found end of expression", expected)),
        }
    }

    fn parse(mut self) -> Result<Expr, String> {
        let expr = self.comparison()?;
        match self.peek() {
            None => Ok(expr),
            Some(token) => Err(format!("unexpected {:?}", token)),
        }
    }

    fn comparison(&mut self) -> Result<Expr, String> {
        let left = self.additive()?;
        let op = match self.peek() {
            Some(Token::Lt) => BinOp::Lt,
            Some(Token::Le) => BinOp::Le,
            Some(Token::Gt) => BinOp::Gt,
            Some(Token::Ge) => BinOp::Ge,
            Some(Token::Eq) => BinOp::Eq,
            Some(Token::Ne) => BinOp::Ne,
            _ => return Ok(left),
        };
        self.pos += 1;
        let right = self.additive()?;
        Ok(Expr::Binary(op, Box::new(left), Box::new(right)))
    }

    fn additive(&mut self) -> Result<Expr, String> {
        let mut left = self.term()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinOp::Add,
                Some(Token::Minus) => BinOp::Sub,
                _ => return Ok(left),
            };
            self.pos += 1;
            let right = self.term()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn term(&mut self) -> Result<Expr, String> {
        let mut left = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinOp::Mul,
                Some(Token::Slash) => BinOp::Div,
                Some(Token::Percent) => BinOp::Mod,
                _ => return Ok(left),
            };
            self.pos += 1;
            let right = self.unary()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn unary(&mut self) -> Result<Expr, String> {
        match self.peek() {
            Some(Token::Minus) => {
                self.pos += 1;
                Ok(Expr::Neg(Box::new(self.unary()?)))
            }
            Some(Token::Plus) => {
                self.pos += 1;
                self.unary()
            }
            _ => self.power(),
        }
    }

    fn power(&mut self) -> Result<Expr, String> {
        let base = self.atom()?;
        if self.peek() == Some(&Token::Power) {
            self.pos += 1;
            let exponent = self.unary()?;
            return Ok(Expr::Binary(BinOp::Pow, Box::new(base), Box::new(exponent)));
        }
        Ok(base)
    }

    fn atom(&mut self) -> Result<Expr, String> {
        match self.advance() {
            Some(Token::Number(n)) => Ok(Expr::Number(n)),
            Some(Token::Column(name)) => Ok(Expr::Column(name)),
            Some(Token::Ident(name)) => {
                if self.peek() != Some(&Token::LParen) {
                    return Ok(Expr::Column(name));
                }
                if self.dialect == Dialect::Algebraic {
                    return Err(format!("function calls such as {}() are not supported", name));
                }
                self.pos += 1;
                let mut args = Vec::new();
                if self.peek() != Some(&Token::RParen) {
                    loop {
                        args.push(self.comparison()?);
                        if self.peek() == Some(&Token::Comma) {
                            self.pos += 1;
                        } else {
                            break;
                        }
                    }
                }
                self.expect(Token::RParen)?;
                Ok(Expr::Call(name.to_lowercase(), args))
            }
            Some(Token::LParen) => {
                let inner = self.comparison()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some(token) => Err(format!("unexpected {:?}", token)),
            None => Err("unexpected end of expression".to_string()),
        }
    }
}

fn truth(value: bool) -> f64 {
    if value {
        1.0
    } else {
        0.0
    }
}

fn arity(name: &str, args: &[f64], expected: usize) -> Result<(), String> {
    if args.len() != expected {
        return Err(format!(
            "{}() takes {} argument(s), got {}",
            name,
            expected,
            args.len()
        ));
    }
    Ok(())
}

fn call(name: &str, args: &[f64]) -> Result<f64, String> {
    match name {
        "abs" | "sqrt" | "floor" | "ceil" | "log" | "exp" => {
            arity(name, args, 1)?;
            let x = args[0];
            Ok(match name {
                "abs" => x.abs(),
                "sqrt" => x.sqrt(),
                "floor" => x.floor(),
                "ceil" => x.ceil(),
                "log" => x.ln(),
                _ => x.exp(),
            })
        }
        "round" => match args {
            [x] => Ok(x.round()),
            [x, places] => {
                let factor = 10f64.powi(*places as i32);
                Ok((x * factor).round() / factor)
            }
            _ => Err(format!("round() takes 1 or 2 arguments, got {}", args.len())),
        },
        "min" | "max" if args.is_empty() => Err(format!("{}() needs at least one argument", name)),
        "min" => Ok(args.iter().copied().fold(f64::INFINITY, f64::min)),
        "max" => Ok(args.iter().copied().fold(f64::NEG_INFINITY, f64::max)),
        "where" => {
            arity(name, args, 3)?;
            Ok(if args[0] != 0.0 && !args[0].is_nan() {
                args[1]
            } else {
                args[2]
            })
        }
        other => Err(format!("unknown function {}()", other)),
    }
}

fn eval(expr: &Expr, row: &Map<String, Value>) -> Result<f64, String> {
    match expr {
        Expr::Number(n) => Ok(*n),
        Expr::Column(name) => match row.get(name) {
            None => Err(format!("unknown column '{}'", name)),
            Some(Value::Null) => Ok(f64::NAN),
            Some(value) => {
                cell_f64(value).ok_or_else(|| format!("column '{}' is not numeric", name))
            }
        },
        Expr::Neg(inner) => Ok(-eval(inner, row)?),
        Expr::Binary(op, left, right) => {
            let a = eval(left, row)?;
            let b = eval(right, row)?;
            Ok(match op {
                BinOp::Add => a + b,
                BinOp::Sub => a - b,
                BinOp::Mul => a * b,
                BinOp::Div => a / b,
                BinOp::Mod => a - b * (a / b).floor(),
                BinOp::Pow => a.powf(b),
                BinOp::Lt => truth(a < b),
                BinOp::Le => truth(a <= b),
                BinOp::Gt => truth(a > b),
                BinOp::Ge => truth(a >= b),
                BinOp::Eq => truth(a == b),
                BinOp::Ne => truth(a != b),
            })
        }
        Expr::Call(name, args) => {
            let values = args
                .iter()
                .map(|arg| eval(arg, row))
                .collect::<Result<Vec<_>, _>>()?;
            call(name, &values)
        }
    }
}

/// Evaluates `source` against one row in a single dialect.
pub fn evaluate_with(
    source: &str,
    row: &Map<String, Value>,
    dialect: Dialect,
) -> Result<Option<f64>, String> {
    let tokens = tokenize(source, dialect)?;
    let expr = Parser {
        tokens,
        pos: 0,
        dialect,
    }
    .parse()?;
    let value = eval(&expr, row)?;
    Ok(value.is_finite().then_some(value))
}

/// Evaluates with the algebraic dialect, falling back to the numeric one.
/// Fails only when both reject the expression.
pub fn evaluate(source: &str, row: &Map<String, Value>) -> Result<Option<f64>, AppError> {
    match evaluate_with(source, row, Dialect::Algebraic) {
        Ok(value) => Ok(value),
        Err(first) => {
            tracing::debug!("Algebraic evaluation of '{}' failed: {}", source, first);
            evaluate_with(source, row, Dialect::Numeric).map_err(|second| {
                AppError::Expression(format!(
                    "could not evaluate '{}': {}; {}",
                    source, first, second
                ))
            })
        }
    }
}
