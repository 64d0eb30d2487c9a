//! Statement parameters: positional values, named maps, and serializable structs.
//!
//! Named statements use `:name` placeholders, which are rewritten to MySQL's
//! positional `?` before the statement is sent:
//!
//! ```text
//! SELECT * FROM users WHERE email = :email AND org = :org
//!    becomes
//! SELECT * FROM users WHERE email = ? AND org = ?     bind: [email, org]
//! ```
//!
//! Placeholders inside quoted strings, identifiers and comments are left
//! alone, `::` is an escaped literal colon, and `:=` (assignment) is passed
//! through.

use std::iter::Peekable;
use std::str::Chars;

use indexmap::IndexMap;
use serde::Serialize;
use serde_json::Value as JsonValue;
use sqlx::Arguments;
use sqlx::mysql::MySqlArguments;
use sqlx::types::Json;

use crate::{Error, Result};

/// Values bound to a statement.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Params {
   /// No parameters.
   #[default]
   None,
   /// Values bound to `?` placeholders, in order.
   Positional(Vec<JsonValue>),
   /// Values bound to `:name` placeholders.
   Named(IndexMap<String, JsonValue>),
}

impl Params {
   /// Positional parameters.
   pub fn positional(values: impl IntoIterator<Item = JsonValue>) -> Self {
      Params::Positional(values.into_iter().collect())
   }

   /// Named parameters from `(name, value)` pairs.
   pub fn named<K, I>(pairs: I) -> Self
   where
      K: Into<String>,
      I: IntoIterator<Item = (K, JsonValue)>,
   {
      Params::Named(pairs.into_iter().map(|(k, v)| (k.into(), v)).collect())
   }

   /// Named parameters taken from the fields of a serializable struct.
   ///
   /// Field names (after any `#[serde(rename)]`) become placeholder names.
   pub fn from_struct<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
      match serde_json::to_value(value)? {
         JsonValue::Object(map) => Ok(Params::Named(map.into_iter().collect())),
         JsonValue::Null => Err(Error::InvalidNamedParameters("null")),
         JsonValue::Bool(_) => Err(Error::InvalidNamedParameters("a boolean")),
         JsonValue::Number(_) => Err(Error::InvalidNamedParameters("a number")),
         JsonValue::String(_) => Err(Error::InvalidNamedParameters("a string")),
         JsonValue::Array(_) => Err(Error::InvalidNamedParameters("an array")),
      }
   }

   /// Resolve placeholders and encode values for the statement.
   pub(crate) fn prepare(self, query: &str) -> Result<(String, MySqlArguments)> {
      let (sql, values) = match self {
         Params::None => (query.to_string(), Vec::new()),
         Params::Positional(values) => (query.to_string(), values),
         Params::Named(map) => {
            let (sql, names) = compile_named(query);
            let mut values = Vec::with_capacity(names.len());
            for name in names {
               let value = map
                  .get(&name)
                  .ok_or_else(|| Error::MissingNamedParameter(name.clone()))?;
               values.push(value.clone());
            }
            (sql, values)
         }
      };

      Ok((sql, to_arguments(values)?))
   }
}

impl From<Vec<JsonValue>> for Params {
   fn from(values: Vec<JsonValue>) -> Self {
      Params::Positional(values)
   }
}

impl From<IndexMap<String, JsonValue>> for Params {
   fn from(map: IndexMap<String, JsonValue>) -> Self {
      Params::Named(map)
   }
}

impl From<serde_json::Map<String, JsonValue>> for Params {
   fn from(map: serde_json::Map<String, JsonValue>) -> Self {
      Params::Named(map.into_iter().collect())
   }
}

/// Rewrite `:name` placeholders to `?`, returning the names in bind order.
fn compile_named(query: &str) -> (String, Vec<String>) {
   let mut sql = String::with_capacity(query.len());
   let mut names = Vec::new();
   let mut quote: Option<char> = None;
   let mut chars = query.chars().peekable();

   while let Some(c) = chars.next() {
      if let Some(q) = quote {
         sql.push(c);
         if c == '\\' && q != '`' {
            // Escaped character inside a string literal
            if let Some(escaped) = chars.next() {
               sql.push(escaped);
            }
         } else if c == q {
            quote = None;
         }
         continue;
      }

      match c {
         '\'' | '"' | '`' => {
            quote = Some(c);
            sql.push(c);
         }
         '#' => {
            sql.push(c);
            copy_line_comment(&mut chars, &mut sql);
         }
         '-' if starts_dash_comment(&chars) => {
            sql.push(c);
            copy_line_comment(&mut chars, &mut sql);
         }
         '/' if chars.peek() == Some(&'*') => {
            sql.push(c);
            sql.push('*');
            chars.next();
            let mut prev = None;
            for n in chars.by_ref() {
               sql.push(n);
               if prev == Some('*') && n == '/' {
                  break;
               }
               prev = Some(n);
            }
         }
         ':' => match chars.peek() {
            Some(':') => {
               chars.next();
               sql.push(':');
            }
            Some(&next) if next.is_ascii_alphabetic() || next == '_' => {
               let mut name = String::new();
               while let Some(&n) = chars.peek() {
                  if n.is_ascii_alphanumeric() || n == '_' || n == '.' {
                     name.push(n);
                     chars.next();
                  } else {
                     break;
                  }
               }
               names.push(name);
               sql.push('?');
            }
            _ => sql.push(':'),
         },
         _ => sql.push(c),
      }
   }

   (sql, names)
}

/// `--` opens a comment only when followed by whitespace or the end of input.
fn starts_dash_comment(chars: &Peekable<Chars<'_>>) -> bool {
   let mut ahead = chars.clone();
   ahead.next() == Some('-') && ahead.next().is_none_or(char::is_whitespace)
}

/// Copy the rest of a `#` or `-- ` comment, up to and including the newline.
fn copy_line_comment(chars: &mut Peekable<Chars<'_>>, sql: &mut String) {
   for n in chars.by_ref() {
      sql.push(n);
      if n == '\n' {
         break;
      }
   }
}

/// Encode JSON values as MySQL arguments.
fn to_arguments(values: Vec<JsonValue>) -> Result<MySqlArguments> {
   let mut args = MySqlArguments::default();
   for value in values {
      bind_value(&mut args, value)?;
   }
   Ok(args)
}

/// Helper function to bind a JSON value to MySQL arguments
fn bind_value(args: &mut MySqlArguments, value: JsonValue) -> Result<()> {
   let added = match value {
      JsonValue::Null => args.add(None::<String>),
      JsonValue::Bool(b) => args.add(b),
      JsonValue::Number(number) => {
         // Preserve integer precision by binding as an integer when possible
         if let Some(int_val) = number.as_i64() {
            args.add(int_val)
         } else if let Some(uint_val) = number.as_u64() {
            args.add(uint_val)
         } else {
            args.add(number.as_f64().unwrap_or_default())
         }
      }
      JsonValue::String(s) => args.add(s),
      other @ (JsonValue::Array(_) | JsonValue::Object(_)) => args.add(Json(other)),
   };

   added.map_err(|e| Error::Sqlx(sqlx::Error::Encode(e)))
}
