//! 字符串插值模板: 字面文本 + `{{ expression }}`

use serde_json::Value;

use crate::error::{RenderError, RenderResult};
use crate::expr::{stringify, Context, Expr};

#[derive(Debug, Clone)]
enum Segment {
    Text(String),
    Hole(Expr),
}

/// 编译后的模板
#[derive(Debug, Clone)]
pub struct Template {
    source: String,
    segments: Vec<Segment>,
}

impl Template {
    /// 编译模板
    pub fn compile(source: &str) -> RenderResult<Self> {
        let mut segments = Vec::new();
        let mut rest = source;

        while let Some(start) = rest.find("{{") {
            if start > 0 {
                segments.push(Segment::Text(rest[..start].to_string()));
            }
            let body = &rest[start + 2..];
            let end = find_close(body).ok_or_else(|| {
                RenderError::Syntax(format!("unterminated `{{{{` in template `{}`", source))
            })?;
            let expr_src = body[..end].trim();
            if expr_src.is_empty() {
                return Err(RenderError::Syntax(format!(
                    "empty expression in template `{}`",
                    source
                )));
            }
            segments.push(Segment::Hole(Expr::compile(expr_src)?));
            rest = &body[end + 2..];
        }
        if !rest.is_empty() {
            segments.push(Segment::Text(rest.to_string()));
        }

        Ok(Self {
            source: source.to_string(),
            segments,
        })
    }

    /// 渲染载荷
    pub fn render(&self, payload: &Value) -> RenderResult<String> {
        let ctx = Context::new(payload);
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Text(text) => out.push_str(text),
                Segment::Hole(expr) => out.push_str(&stringify(&expr.eval(&ctx)?)),
            }
        }
        Ok(out)
    }

    /// 原始模板文本
    pub fn source(&self) -> &str {
        &self.source
    }
}

/// 查找 `}}`，跳过引号内的内容
fn find_close(body: &str) -> Option<usize> {
    let bytes = body.as_bytes();
    let mut quote: Option<u8> = None;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            Some(q) => {
                if b == b'\\' {
                    i += 1;
                } else if b == q {
                    quote = None;
                }
            }
            None => {
                if b == b'\'' || b == b'"' {
                    quote = Some(b);
                } else if b == b'}' && bytes.get(i + 1) == Some(&b'}') {
                    return Some(i);
                }
            }
        }
        i += 1;
    }
    None
}
