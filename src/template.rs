//! SQL templates.
//!
//! A [`SqlTemplate`] is a sequence of tokens: literal SQL text, values,
//! identifiers, raw SQL and nested templates. Rendering turns values into
//! quoted literals and identifiers into quoted names, producing one SQL
//! string for the simple query protocol.
//!
//! ```
//! use pg_nano::{sql, template::{id, render}};
//!
//! let query = sql!("SELECT * FROM {} WHERE id = {} AND tag = {}", id("users"), 7, "a'b");
//! assert_eq!(
//!     render(&query).unwrap(),
//!     r#"SELECT * FROM "users" WHERE id = 7 AND tag = 'a''b'"#,
//! );
//! ```

use crate::error::{Error, Result};
use crate::raw::{escape_identifier, escape_literal};
use crate::value::encode::{encode_to_string, float_text};
use crate::value::Value;

/// One piece of a template.
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    /// SQL text copied as-is.
    Text(String),
    /// A value rendered as a literal.
    Value(Value),
    /// An identifier rendered with double quotes.
    Id(String),
    /// Caller-supplied SQL copied as-is.
    Raw(String),
    /// Another template rendered in place.
    Nested(SqlTemplate),
}

/// A SQL statement assembled from tokens.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SqlTemplate {
    tokens: Vec<Token>,
    error: Option<String>,
}

impl SqlTemplate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Plain SQL with no interpolation.
    pub fn text(sql: impl Into<String>) -> Self {
        Self {
            tokens: vec![Token::Text(sql.into())],
            error: None,
        }
    }

    /// Build from a format string where each `{}` takes the next argument.
    /// `{{` and `}}` stand for literal braces. Used by [`sql!`](crate::sql).
    pub fn format(fmt: &str, args: Vec<Token>) -> Self {
        let mut template = Self::new();
        let mut args = args.into_iter();
        let mut text = String::new();
        let mut chars = fmt.chars().peekable();
        let mut expected = 0_usize;
        while let Some(c) = chars.next() {
            match (c, chars.peek()) {
                ('{', Some('{')) | ('}', Some('}')) => {
                    chars.next();
                    text.push(c);
                }
                ('{', Some('}')) => {
                    chars.next();
                    expected += 1;
                    if !text.is_empty() {
                        template.tokens.push(Token::Text(std::mem::take(&mut text)));
                    }
                    if let Some(arg) = args.next() {
                        template.tokens.push(arg);
                    }
                }
                _ => text.push(c),
            }
        }
        if !text.is_empty() {
            template.tokens.push(Token::Text(text));
        }

        let extra = args.count();
        let given = template.tokens.iter().filter(|t| !matches!(t, Token::Text(_))).count() + extra;
        if given != expected {
            template.error = Some(format!(
                "template has {expected} placeholders but {given} arguments"
            ));
        }
        template
    }

    /// Append a token.
    pub fn push(&mut self, token: impl Into<Token>) -> &mut Self {
        self.tokens.push(token.into());
        self
    }

    /// Append SQL text.
    pub fn push_sql(&mut self, sql: impl Into<String>) -> &mut Self {
        self.tokens.push(Token::Text(sql.into()));
        self
    }

    pub fn tokens(&self) -> &[Token] {
        &self.tokens
    }

    /// Join templates with a separator, e.g. a list of values with `", "`.
    pub fn join(parts: impl IntoIterator<Item = impl Into<Token>>, separator: &str) -> Self {
        let mut template = Self::new();
        for (i, part) in parts.into_iter().enumerate() {
            if i > 0 {
                template.push_sql(separator);
            }
            template.push(part);
        }
        template
    }
}

/// A value token.
pub fn val(value: impl Into<Value>) -> Token {
    Token::Value(value.into())
}

/// An identifier token.
pub fn id(name: impl Into<String>) -> Token {
    Token::Id(name.into())
}

/// A raw SQL token. The text is not escaped.
pub fn raw(sql: impl Into<String>) -> Token {
    Token::Raw(sql.into())
}

/// Render a template as a single SQL string.
pub fn render(template: &SqlTemplate) -> Result<String> {
    let mut out = String::new();
    render_into(template, &mut out)?;
    Ok(out)
}

fn render_into(template: &SqlTemplate, out: &mut String) -> Result<()> {
    if let Some(error) = &template.error {
        return Err(Error::Encode(error.clone()));
    }
    for token in &template.tokens {
        match token {
            Token::Text(text) | Token::Raw(text) => out.push_str(text),
            Token::Value(value) => out.push_str(&render_value(value)?),
            Token::Id(name) => out.push_str(&escape_identifier(name)),
            Token::Nested(nested) => render_into(nested, out)?,
        }
    }
    Ok(())
}

/// Render one value as a SQL literal.
///
/// NULL and booleans become keywords and finite numbers are inlined, in
/// parentheses when the sign bit is set (including `-0.0`). Everything else is encoded and quoted.
pub fn render_value(value: &Value) -> Result<String> {
    Ok(match value {
        Value::Null => "NULL".into(),
        Value::Bool(b) => if *b { "true" } else { "false" }.into(),
        Value::Int(n) if *n < 0 => format!("({n})"),
        Value::Int(n) => n.to_string(),
        Value::Float(f) if f.is_finite() && f.is_sign_negative() => format!("({})", float_text(*f)),
        Value::Float(f) if f.is_finite() => float_text(*f),
        Value::Float(f) => format!("{}::float8", escape_literal(&float_text(*f))),
        other => escape_literal(&encode_to_string(other)?),
    })
}

impl From<&str> for SqlTemplate {
    fn from(sql: &str) -> Self {
        SqlTemplate::text(sql)
    }
}

impl From<String> for SqlTemplate {
    fn from(sql: String) -> Self {
        SqlTemplate::text(sql)
    }
}

impl From<Value> for Token {
    fn from(value: Value) -> Self {
        Token::Value(value)
    }
}

impl From<SqlTemplate> for Token {
    fn from(template: SqlTemplate) -> Self {
        Token::Nested(template)
    }
}

macro_rules! impl_token_from_value {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for Token {
                fn from(value: $ty) -> Self {
                    Token::Value(value.into())
                }
            }
        )*
    };
}

impl_token_from_value!(
    bool,
    i8,
    i16,
    i32,
    i64,
    u8,
    u16,
    u32,
    f32,
    f64,
    &str,
    String,
    &String,
    &[u8],
    chrono::DateTime<chrono::Utc>,
    chrono::NaiveDateTime,
    chrono::NaiveDate,
    crate::value::Interval,
    crate::value::Range,
    serde_json::Value
);

impl<T: Into<Value>> From<Option<T>> for Token {
    fn from(value: Option<T>) -> Self {
        Token::Value(value.into())
    }
}

impl<T: Into<Value>> From<Vec<T>> for Token {
    fn from(value: Vec<T>) -> Self {
        Token::Value(value.into())
    }
}

/// Build a [`SqlTemplate`] from a format string and arguments.
///
/// Each `{}` is replaced by the next argument: plain values become quoted
/// literals, [`id`](crate::template::id) quotes an identifier,
/// [`raw`](crate::template::raw) inserts SQL verbatim and a nested template
/// is rendered in place.
#[macro_export]
macro_rules! sql {
    ($fmt:literal $(, $arg:expr)* $(,)?) => {
        $crate::template::SqlTemplate::format(
            $fmt,
            vec![$($crate::template::Token::from($arg)),*],
        )
    };
}
