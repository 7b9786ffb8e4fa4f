//! 沙箱表达式语言
//!
//! 只支持字段访问、字面量、比较、布尔运算与少量过滤器。
//! 表达式在加载配置时编译一次，求值无副作用、无循环。

use std::cmp::Ordering;
use std::fmt;

use serde_json::Value;

use crate::error::{RenderError, RenderResult};

/// 编译后的表达式
#[derive(Debug, Clone)]
pub struct Expr {
    source: String,
    node: Node,
}

impl Expr {
    /// 编译表达式
    pub fn compile(source: &str) -> RenderResult<Self> {
        let tokens = lex(source)?;
        let mut parser = Parser { tokens, pos: 0 };
        let node = parser.parse_or()?;
        if let Some(token) = parser.peek() {
            return Err(RenderError::Syntax(format!(
                "unexpected {} in `{}`",
                token, source
            )));
        }
        Ok(Self {
            source: source.to_string(),
            node,
        })
    }

    /// 在给定上下文中求值
    pub fn eval(&self, ctx: &Context<'_>) -> RenderResult<Value> {
        self.node.eval(ctx)
    }

    /// 求值并取真值
    pub fn eval_truthy(&self, ctx: &Context<'_>) -> RenderResult<bool> {
        Ok(truthy(&self.eval(ctx)?))
    }

    /// 原始表达式文本
    pub fn source(&self) -> &str {
        &self.source
    }
}

/// 求值上下文：载荷本身绑定为 `data`，顶层字段同时作为变量暴露
pub struct Context<'a> {
    payload: &'a Value,
}

impl<'a> Context<'a> {
    pub fn new(payload: &'a Value) -> Self {
        Self { payload }
    }

    fn lookup(&self, name: &str) -> Value {
        if name == "data" {
            return self.payload.clone();
        }
        self.payload.get(name).cloned().unwrap_or(Value::Null)
    }
}

/// 值的文本形式 (null 渲染为空串)
pub fn stringify(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// 真值判定
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

// =============================================================================
// Lexer
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Num(Value),
    Dot,
    Comma,
    Pipe,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Op(CmpOp),
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Ident(s) => write!(f, "identifier `{}`", s),
            Token::Str(s) => write!(f, "string {:?}", s),
            Token::Num(n) => write!(f, "number {}", n),
            Token::Dot => f.write_str("`.`"),
            Token::Comma => f.write_str("`,`"),
            Token::Pipe => f.write_str("`|`"),
            Token::LParen => f.write_str("`(`"),
            Token::RParen => f.write_str("`)`"),
            Token::LBracket => f.write_str("`[`"),
            Token::RBracket => f.write_str("`]`"),
            Token::Op(op) => write!(f, "`{}`", op.as_str()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    NotIn,
}

impl CmpOp {
    fn as_str(&self) -> &'static str {
        match self {
            CmpOp::Eq => "==",
            CmpOp::Ne => "!=",
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
            CmpOp::In => "in",
            CmpOp::NotIn => "not in",
        }
    }
}

fn lex(source: &str) -> RenderResult<Vec<Token>> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '|' => {
                tokens.push(Token::Pipe);
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '[' => {
                tokens.push(Token::LBracket);
                i += 1;
            }
            ']' => {
                tokens.push(Token::RBracket);
                i += 1;
            }
            '=' | '!' | '<' | '>' => {
                let next = chars.get(i + 1).copied();
                let (op, width) = match (c, next) {
                    ('=', Some('=')) => (CmpOp::Eq, 2),
                    ('!', Some('=')) => (CmpOp::Ne, 2),
                    ('<', Some('=')) => (CmpOp::Le, 2),
                    ('>', Some('=')) => (CmpOp::Ge, 2),
                    ('<', _) => (CmpOp::Lt, 1),
                    ('>', _) => (CmpOp::Gt, 1),
                    _ => {
                        return Err(RenderError::Syntax(format!(
                            "unexpected character `{}` in `{}`",
                            c, source
                        )))
                    }
                };
                tokens.push(Token::Op(op));
                i += width;
            }
            '\'' | '"' => {
                let quote = c;
                let mut out = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => {
                            return Err(RenderError::Syntax(format!(
                                "unterminated string in `{}`",
                                source
                            )))
                        }
                        Some('\\') => {
                            match chars.get(i + 1) {
                                Some('n') => out.push('\n'),
                                Some('t') => out.push('\t'),
                                Some(other) => out.push(*other),
                                None => {
                                    return Err(RenderError::Syntax(format!(
                                        "unterminated string in `{}`",
                                        source
                                    )))
                                }
                            }
                            i += 2;
                        }
                        Some(ch) if *ch == quote => {
                            i += 1;
                            break;
                        }
                        Some(ch) => {
                            out.push(*ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(out));
            }
            c if c.is_ascii_digit() || (c == '-' && chars.get(i + 1).map_or(false, |n| n.is_ascii_digit())) => {
                let start = i;
                i += 1;
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
                let mut is_float = false;
                if i + 1 < chars.len() && chars[i] == '.' && chars[i + 1].is_ascii_digit() {
                    is_float = true;
                    i += 1;
                    while i < chars.len() && chars[i].is_ascii_digit() {
                        i += 1;
                    }
                }
                let text: String = chars[start..i].iter().collect();
                let value = if is_float {
                    text.parse::<f64>()
                        .ok()
                        .and_then(serde_json::Number::from_f64)
                        .map(Value::Number)
                } else {
                    text.parse::<i64>().ok().map(Value::from)
                };
                match value {
                    Some(v) => tokens.push(Token::Num(v)),
                    None => {
                        return Err(RenderError::Syntax(format!(
                            "invalid number `{}` in `{}`",
                            text, source
                        )))
                    }
                }
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                if word == "in" {
                    // `not in` 由解析器组合
                    tokens.push(Token::Op(CmpOp::In));
                } else {
                    tokens.push(Token::Ident(word));
                }
            }
            other => {
                return Err(RenderError::Syntax(format!(
                    "unexpected character `{}` in `{}`",
                    other, source
                )))
            }
        }
    }

    Ok(tokens)
}

// =============================================================================
// Parser
// =============================================================================

#[derive(Debug, Clone)]
enum Node {
    Literal(Value),
    Var(String),
    Attr(Box<Node>, String),
    Index(Box<Node>, Box<Node>),
    Not(Box<Node>),
    And(Box<Node>, Box<Node>),
    Or(Box<Node>, Box<Node>),
    Compare(CmpOp, Box<Node>, Box<Node>),
    Filter(Box<Node>, Filter, Vec<Node>),
}

/// 支持的过滤器
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Filter {
    Default,
    Lower,
    Upper,
    Trim,
    Length,
    Join,
    Truncate,
    Replace,
    First,
    Last,
    ToJson,
    String,
}

impl Filter {
    fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "default" | "d" => Filter::Default,
            "lower" => Filter::Lower,
            "upper" => Filter::Upper,
            "trim" => Filter::Trim,
            "length" | "count" => Filter::Length,
            "join" => Filter::Join,
            "truncate" => Filter::Truncate,
            "replace" => Filter::Replace,
            "first" => Filter::First,
            "last" => Filter::Last,
            "tojson" => Filter::ToJson,
            "string" => Filter::String,
            _ => return None,
        })
    }

    /// 允许的参数个数区间
    fn arity(&self) -> (usize, usize) {
        match self {
            Filter::Default => (1, 1),
            Filter::Join => (0, 1),
            Filter::Truncate => (1, 1),
            Filter::Replace => (2, 2),
            _ => (0, 0),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Filter::Default => "default",
            Filter::Lower => "lower",
            Filter::Upper => "upper",
            Filter::Trim => "trim",
            Filter::Length => "length",
            Filter::Join => "join",
            Filter::Truncate => "truncate",
            Filter::Replace => "replace",
            Filter::First => "first",
            Filter::Last => "last",
            Filter::ToJson => "tojson",
            Filter::String => "string",
        }
    }
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn is_keyword(&self, word: &str) -> bool {
        matches!(self.peek(), Some(Token::Ident(w)) if w == word)
    }

    fn expect(&mut self, expected: Token) -> RenderResult<()> {
        match self.next() {
            Some(token) if token == expected => Ok(()),
            Some(token) => Err(RenderError::Syntax(format!(
                "expected {}, found {}",
                expected, token
            ))),
            None => Err(RenderError::Syntax(format!(
                "expected {}, found end of expression",
                expected
            ))),
        }
    }

    fn parse_or(&mut self) -> RenderResult<Node> {
        let mut left = self.parse_and()?;
        while self.is_keyword("or") {
            self.pos += 1;
            let right = self.parse_and()?;
            left = Node::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> RenderResult<Node> {
        let mut left = self.parse_not()?;
        while self.is_keyword("and") {
            self.pos += 1;
            let right = self.parse_not()?;
            left = Node::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> RenderResult<Node> {
        if self.is_keyword("not") {
            self.pos += 1;
            let inner = self.parse_not()?;
            return Ok(Node::Not(Box::new(inner)));
        }
        self.parse_compare()
    }

    fn parse_compare(&mut self) -> RenderResult<Node> {
        let left = self.parse_filtered()?;

        let op = match self.peek() {
            Some(Token::Op(op)) => {
                let op = *op;
                self.pos += 1;
                op
            }
            Some(Token::Ident(w)) if w == "not" => {
                if matches!(self.tokens.get(self.pos + 1), Some(Token::Op(CmpOp::In))) {
                    self.pos += 2;
                    CmpOp::NotIn
                } else {
                    return Ok(left);
                }
            }
            _ => return Ok(left),
        };

        let right = self.parse_filtered()?;
        Ok(Node::Compare(op, Box::new(left), Box::new(right)))
    }

    fn parse_filtered(&mut self) -> RenderResult<Node> {
        let mut node = self.parse_postfix()?;
        while matches!(self.peek(), Some(Token::Pipe)) {
            self.pos += 1;
            let name = match self.next() {
                Some(Token::Ident(name)) => name,
                Some(token) => {
                    return Err(RenderError::Syntax(format!(
                        "expected filter name, found {}",
                        token
                    )))
                }
                None => {
                    return Err(RenderError::Syntax(
                        "expected filter name, found end of expression".to_string(),
                    ))
                }
            };
            let filter = Filter::parse(&name)
                .ok_or_else(|| RenderError::Syntax(format!("unknown filter `{}`", name)))?;

            let mut args = Vec::new();
            if matches!(self.peek(), Some(Token::LParen)) {
                self.pos += 1;
                if !matches!(self.peek(), Some(Token::RParen)) {
                    loop {
                        args.push(self.parse_or()?);
                        if matches!(self.peek(), Some(Token::Comma)) {
                            self.pos += 1;
                            continue;
                        }
                        break;
                    }
                }
                self.expect(Token::RParen)?;
            }

            let (min, max) = filter.arity();
            if args.len() < min || args.len() > max {
                return Err(RenderError::Syntax(format!(
                    "filter `{}` takes {} argument(s), got {}",
                    filter.name(),
                    if min == max {
                        min.to_string()
                    } else {
                        format!("{}..={}", min, max)
                    },
                    args.len()
                )));
            }
            node = Node::Filter(Box::new(node), filter, args);
        }
        Ok(node)
    }

    fn parse_postfix(&mut self) -> RenderResult<Node> {
        let mut node = self.parse_primary()?;
        loop {
            match self.peek() {
                Some(Token::Dot) => {
                    self.pos += 1;
                    match self.next() {
                        Some(Token::Ident(name)) => node = Node::Attr(Box::new(node), name),
                        Some(Token::Num(Value::Number(n))) if n.is_u64() => {
                            node = Node::Index(
                                Box::new(node),
                                Box::new(Node::Literal(Value::Number(n))),
                            )
                        }
                        Some(token) => {
                            return Err(RenderError::Syntax(format!(
                                "expected attribute name after `.`, found {}",
                                token
                            )))
                        }
                        None => {
                            return Err(RenderError::Syntax(
                                "expected attribute name after `.`".to_string(),
                            ))
                        }
                    }
                }
                Some(Token::LBracket) => {
                    self.pos += 1;
                    let index = self.parse_or()?;
                    self.expect(Token::RBracket)?;
                    node = Node::Index(Box::new(node), Box::new(index));
                }
                _ => return Ok(node),
            }
        }
    }

    fn parse_primary(&mut self) -> RenderResult<Node> {
        match self.next() {
            Some(Token::Str(s)) => Ok(Node::Literal(Value::String(s))),
            Some(Token::Num(n)) => Ok(Node::Literal(n)),
            Some(Token::Ident(word)) => Ok(match word.as_str() {
                "true" | "True" => Node::Literal(Value::Bool(true)),
                "false" | "False" => Node::Literal(Value::Bool(false)),
                "none" | "None" | "null" => Node::Literal(Value::Null),
                "and" | "or" | "not" => {
                    return Err(RenderError::Syntax(format!(
                        "unexpected keyword `{}`",
                        word
                    )))
                }
                _ => Node::Var(word),
            }),
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some(token) => Err(RenderError::Syntax(format!("unexpected {}", token))),
            None => Err(RenderError::Syntax(
                "unexpected end of expression".to_string(),
            )),
        }
    }
}

// =============================================================================
// Evaluation
// =============================================================================

impl Node {
    fn eval(&self, ctx: &Context<'_>) -> RenderResult<Value> {
        match self {
            Node::Literal(v) => Ok(v.clone()),
            Node::Var(name) => Ok(ctx.lookup(name)),
            Node::Attr(base, name) => Ok(base.eval(ctx)?.get(name).cloned().unwrap_or(Value::Null)),
            Node::Index(base, index) => {
                let base = base.eval(ctx)?;
                let index = index.eval(ctx)?;
                Ok(index_value(&base, &index))
            }
            Node::Not(inner) => Ok(Value::Bool(!truthy(&inner.eval(ctx)?))),
            Node::And(l, r) => {
                let left = l.eval(ctx)?;
                if !truthy(&left) {
                    return Ok(left);
                }
                r.eval(ctx)
            }
            Node::Or(l, r) => {
                let left = l.eval(ctx)?;
                if truthy(&left) {
                    return Ok(left);
                }
                r.eval(ctx)
            }
            Node::Compare(op, l, r) => {
                let left = l.eval(ctx)?;
                let right = r.eval(ctx)?;
                compare(*op, &left, &right).map(Value::Bool)
            }
            Node::Filter(base, filter, args) => {
                let value = base.eval(ctx)?;
                let args = args
                    .iter()
                    .map(|a| a.eval(ctx))
                    .collect::<RenderResult<Vec<_>>>()?;
                apply_filter(*filter, value, &args)
            }
        }
    }
}

fn index_value(base: &Value, index: &Value) -> Value {
    match (base, index) {
        (Value::Object(map), Value::String(key)) => map.get(key).cloned().unwrap_or(Value::Null),
        (Value::Array(items), Value::Number(n)) => {
            let idx = match n.as_i64() {
                Some(i) if i < 0 => items.len() as i64 + i,
                Some(i) => i,
                None => return Value::Null,
            };
            if idx < 0 {
                return Value::Null;
            }
            items.get(idx as usize).cloned().unwrap_or(Value::Null)
        }
        _ => Value::Null,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        _ => left == right,
    }
}

fn order(left: &Value, right: &Value) -> RenderResult<Option<Ordering>> {
    match (left, right) {
        (Value::Null, _) | (_, Value::Null) => Ok(None),
        (Value::Number(a), Value::Number(b)) => Ok(a
            .as_f64()
            .zip(b.as_f64())
            .and_then(|(a, b)| a.partial_cmp(&b))),
        (Value::String(a), Value::String(b)) => Ok(Some(a.cmp(b))),
        _ => Err(RenderError::Eval(format!(
            "cannot compare {} with {}",
            type_name(left),
            type_name(right)
        ))),
    }
}

fn contains(haystack: &Value, needle: &Value) -> RenderResult<bool> {
    match haystack {
        Value::Null => Ok(false),
        Value::String(s) => match needle {
            Value::String(n) => Ok(s.contains(n.as_str())),
            Value::Null => Ok(false),
            other => Ok(s.contains(&stringify(other))),
        },
        Value::Array(items) => Ok(items.iter().any(|item| values_equal(item, needle))),
        Value::Object(map) => Ok(match needle {
            Value::String(key) => map.contains_key(key),
            _ => false,
        }),
        other => Err(RenderError::Eval(format!(
            "`in` is not supported on {}",
            type_name(other)
        ))),
    }
}

fn compare(op: CmpOp, left: &Value, right: &Value) -> RenderResult<bool> {
    Ok(match op {
        CmpOp::Eq => values_equal(left, right),
        CmpOp::Ne => !values_equal(left, right),
        CmpOp::Lt => order(left, right)? == Some(Ordering::Less),
        CmpOp::Le => matches!(order(left, right)?, Some(Ordering::Less | Ordering::Equal)),
        CmpOp::Gt => order(left, right)? == Some(Ordering::Greater),
        CmpOp::Ge => matches!(order(left, right)?, Some(Ordering::Greater | Ordering::Equal)),
        CmpOp::In => contains(right, left)?,
        CmpOp::NotIn => !contains(right, left)?,
    })
}

fn apply_filter(filter: Filter, value: Value, args: &[Value]) -> RenderResult<Value> {
    match filter {
        Filter::Default => Ok(if value.is_null() {
            args[0].clone()
        } else {
            value
        }),
        Filter::Lower => Ok(Value::String(stringify(&value).to_lowercase())),
        Filter::Upper => Ok(Value::String(stringify(&value).to_uppercase())),
        Filter::Trim => Ok(Value::String(stringify(&value).trim().to_string())),
        Filter::String => Ok(Value::String(stringify(&value))),
        Filter::ToJson => Ok(Value::String(value.to_string())),
        Filter::Length => match &value {
            Value::String(s) => Ok(Value::from(s.chars().count())),
            Value::Array(a) => Ok(Value::from(a.len())),
            Value::Object(o) => Ok(Value::from(o.len())),
            Value::Null => Ok(Value::from(0)),
            other => Err(RenderError::Eval(format!(
                "length is not supported on {}",
                type_name(other)
            ))),
        },
        Filter::Join => {
            let sep = args.first().map(stringify).unwrap_or_default();
            match &value {
                Value::Array(items) => Ok(Value::String(
                    items.iter().map(stringify).collect::<Vec<_>>().join(&sep),
                )),
                Value::Null => Ok(Value::String(String::new())),
                other => Err(RenderError::Eval(format!(
                    "join is not supported on {}",
                    type_name(other)
                ))),
            }
        }
        Filter::Truncate => {
            let limit = args[0].as_u64().ok_or_else(|| {
                RenderError::Eval(format!(
                    "truncate expects a non-negative integer, got {}",
                    type_name(&args[0])
                ))
            })? as usize;
            let text = stringify(&value);
            if text.chars().count() <= limit {
                return Ok(Value::String(text));
            }
            let mut cut: String = text.chars().take(limit).collect();
            cut.push_str("...");
            Ok(Value::String(cut))
        }
        Filter::Replace => {
            let from = stringify(&args[0]);
            let to = stringify(&args[1]);
            let text = stringify(&value);
            if from.is_empty() {
                return Ok(Value::String(text));
            }
            Ok(Value::String(text.replace(&from, &to)))
        }
        Filter::First | Filter::Last => {
            let first = filter == Filter::First;
            match value {
                Value::Array(items) => Ok(if first {
                    items.into_iter().next()
                } else {
                    items.into_iter().last()
                }
                .unwrap_or(Value::Null)),
                Value::String(s) => Ok(if first {
                    s.chars().next()
                } else {
                    s.chars().last()
                }
                .map(|c| Value::String(c.to_string()))
                .unwrap_or(Value::Null)),
                Value::Null => Ok(Value::Null),
                other => Err(RenderError::Eval(format!(
                    "{} is not supported on {}",
                    filter.name(),
                    type_name(&other)
                ))),
            }
        }
    }
}
