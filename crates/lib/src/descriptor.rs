//! Build descriptor synthesis.
//!
//! The build-configuration document handed to the toolchain is rendered from
//! a template carried by the formula. Templates use `$${name}` placeholders;
//! a single `$` passes through unchanged, so build-tool variables like
//! `${CMAKE_CURRENT_SOURCE_DIR}` survive verbatim without escaping. Use
//! `$$${` for a literal `$${` in output.
//!
//! Rendering is all-or-nothing: a placeholder that names an undefined binding
//! fails before anything is written, it is never silently substituted with an
//! empty value.

use std::collections::{BTreeMap, BTreeSet};

use thiserror::Error;

/// A parsed piece of a template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
  /// Literal text (no placeholders).
  Literal(String),

  /// A `$${name}` placeholder to be resolved from the bindings.
  Binding(String),
}

/// Errors from template parsing or rendering.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
  #[error("unclosed placeholder at byte {0}")]
  Unclosed(usize),

  #[error("malformed placeholder '{0}': names are alphanumeric with '_' and '.'")]
  Malformed(String),

  #[error("template references undefined binding '{0}'")]
  UnknownBinding(String),
}

/// Parse a template into literal and placeholder segments.
pub fn parse(input: &str) -> Result<Vec<Segment>, TemplateError> {
  let mut segments = Vec::new();
  let mut literal = String::new();
  let mut chars = input.char_indices().peekable();

  while let Some((pos, ch)) = chars.next() {
    if ch != '$' {
      literal.push(ch);
      continue;
    }

    match chars.peek() {
      Some((_, '$')) => {
        chars.next(); // consume the second $

        match chars.peek() {
          Some((_, '$')) => {
            // "$$$": escape if followed by '{', otherwise literal
            chars.next();
            match chars.peek() {
              Some((_, '{')) => {
                literal.push_str("$${");
                chars.next();
              }
              _ => literal.push_str("$$$"),
            }
          }
          Some((_, '{')) => {
            chars.next(); // consume the {

            if !literal.is_empty() {
              segments.push(Segment::Literal(std::mem::take(&mut literal)));
            }

            let mut name = String::new();
            let mut found_close = false;
            for (_, c) in chars.by_ref() {
              if c == '}' {
                found_close = true;
                break;
              }
              name.push(c);
            }

            if !found_close {
              return Err(TemplateError::Unclosed(pos));
            }

            if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.') {
              return Err(TemplateError::Malformed(name));
            }

            segments.push(Segment::Binding(name));
          }
          _ => literal.push_str("$$"),
        }
      }
      // A lone $ passes through so `${VAR}` in the build tool's own syntax
      // survives untouched.
      _ => literal.push('$'),
    }
  }

  if !literal.is_empty() {
    segments.push(Segment::Literal(literal));
  }

  Ok(segments)
}

/// The set of binding names a template references.
pub fn referenced_bindings(template: &str) -> Result<BTreeSet<String>, TemplateError> {
  let mut names = BTreeSet::new();
  for segment in parse(template)? {
    if let Segment::Binding(name) = segment {
      names.insert(name);
    }
  }
  Ok(names)
}

/// Render a template against a binding map.
///
/// Fails with [`TemplateError::UnknownBinding`] if any referenced binding is
/// absent; in that case nothing is produced.
pub fn render(template: &str, bindings: &BTreeMap<String, String>) -> Result<String, TemplateError> {
  let mut out = String::with_capacity(template.len());

  for segment in parse(template)? {
    match segment {
      Segment::Literal(text) => out.push_str(&text),
      Segment::Binding(name) => {
        let value = bindings
          .get(&name)
          .ok_or_else(|| TemplateError::UnknownBinding(name.clone()))?;
        out.push_str(value);
      }
    }
  }

  Ok(out)
}
