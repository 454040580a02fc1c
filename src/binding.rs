//! Template binding engine.
//!
//! A named query or update is stored as SPARQL text plus a declaration of its
//! *forced bindings*: variables whose values the caller supplies when the
//! template is rendered, each declared either as a literal or as an IRI.
//!
//! Rendering works on the template as text, never as a parsed query:
//! * a literal value becomes `'value'`;
//! * an IRI value that already reads as `prefix:suffix` for a known namespace
//!   prefix is used verbatim, anything else becomes `<value>`;
//! * the `PREFIX` clauses of every namespace are put in front of the body.
//!
//! Two substitution strategies are available, see [`SubstitutionMode`].
//! [`SubstitutionMode::Legacy`] applies three anchored regular expressions per
//! variable (marker followed by whitespace, by `}` or by `.`) and leaves every
//! other occurrence alone. [`SubstitutionMode::Tokenized`] scans the template
//! once, skips string literals, IRI references and comments, and replaces
//! every occurrence of the variable whatever follows it.

use indexmap::IndexMap;
use lazy_static::lazy_static;
use regex::{NoExpand, Regex};
use serde::Deserialize;
use std::fmt;
use tracing::debug;

use crate::error::{Result, SepaError};

lazy_static! {
    // PN_PREFIX, or the empty prefix
    static ref PREFIX_NAME: Regex = Regex::new(r"^(?:[A-Za-z](?:[\w\-.]*[\w\-])?)?$").unwrap();
}

// ------------- Namespaces -------------
/// Ordered prefix to IRI mapping, with one compiled `prefix:.+` pattern per prefix.
#[derive(Debug, Clone, Default)]
pub struct Namespaces {
    entries: IndexMap<String, String>,
    patterns: Vec<Regex>,
}

impl Namespaces {
    pub fn new() -> Self {
        Self::default()
    }
    /// Adds (or re-points) a prefix. Prefix names follow SPARQL's PN_PREFIX.
    pub fn insert(&mut self, prefix: impl Into<String>, iri: impl Into<String>) -> Result<()> {
        let prefix = prefix.into();
        if !PREFIX_NAME.is_match(&prefix) {
            return Err(SepaError::ConfigParsing(format!("invalid namespace prefix '{prefix}'")));
        }
        if self.entries.insert(prefix.clone(), iri.into()).is_none() {
            let pattern = Regex::new(&format!("^{}:.+", regex::escape(&prefix)))
                .map_err(|e| SepaError::ConfigParsing(format!("namespace prefix '{prefix}': {e}")))?;
            self.patterns.push(pattern);
        }
        Ok(())
    }
    pub fn get(&self, prefix: &str) -> Option<&str> {
        self.entries.get(prefix).map(String::as_str)
    }
    pub fn len(&self) -> usize {
        self.entries.len()
    }
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(p, i)| (p.as_str(), i.as_str()))
    }
    /// The `PREFIX p: <iri> ` clauses, in insertion order, with no separator between them.
    pub fn prologue(&self) -> String {
        self.entries
            .iter()
            .map(|(prefix, iri)| format!("PREFIX {prefix}: <{iri}> "))
            .collect()
    }
    /// First prefix (in insertion order) whose `prefix:.+` pattern matches the value.
    pub fn matching_prefix(&self, value: &str) -> Option<&str> {
        self.entries
            .keys()
            .zip(&self.patterns)
            .find(|(_, pattern)| pattern.is_match(value))
            .map(|(prefix, _)| prefix.as_str())
    }
    pub fn is_prefixed_node(&self, value: &str) -> bool {
        self.matching_prefix(value).is_some()
    }
}

impl TryFrom<IndexMap<String, String>> for Namespaces {
    type Error = SepaError;
    fn try_from(map: IndexMap<String, String>) -> Result<Self> {
        let mut namespaces = Namespaces::new();
        for (prefix, iri) in map {
            namespaces.insert(prefix, iri)?;
        }
        Ok(namespaces)
    }
}

// ------------- Forced bindings -------------
/// Declared kind of a forced binding. Only `literal` is special, any other
/// declared type string is treated as an IRI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(from = "String")]
pub enum BindingKind {
    Literal,
    Iri,
}

impl From<String> for BindingKind {
    fn from(kind: String) -> Self {
        if kind == "literal" { BindingKind::Literal } else { BindingKind::Iri }
    }
}

impl fmt::Display for BindingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BindingKind::Literal => write!(f, "literal"),
            BindingKind::Iri => write!(f, "iri"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BindingSpec {
    #[serde(rename = "type")]
    pub kind: BindingKind,
}

impl BindingSpec {
    pub fn literal() -> Self {
        Self { kind: BindingKind::Literal }
    }
    pub fn iri() -> Self {
        Self { kind: BindingKind::Iri }
    }
}

/// Declared slots of one template, variable name to expected kind.
pub type ForcedBindingSpec = IndexMap<String, BindingSpec>;

/// Caller supplied values, applied in the order they were bound.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bindings(IndexMap<String, String>);

impl Bindings {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn bind(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(name, value);
        self
    }
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.insert(name.into(), value.into());
    }
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }
    pub fn len(&self) -> usize {
        self.0.len()
    }
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Bindings {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut bindings = Bindings::new();
        for (name, value) in iter {
            bindings.insert(name, value);
        }
        bindings
    }
}

// ------------- Rendering -------------
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubstitutionMode {
    /// One pass over the template, every occurrence of a bound variable is replaced.
    #[default]
    Tokenized,
    /// Marker followed by whitespace, `}` or `.` only.
    Legacy,
}

/// Text that stands in for a variable of the given kind.
pub fn replacement(kind: BindingKind, value: &str, namespaces: &Namespaces) -> String {
    match kind {
        BindingKind::Literal => format!("'{value}'"),
        BindingKind::Iri if namespaces.is_prefixed_node(value) => value.to_string(),
        BindingKind::Iri => format!("<{value}>"),
    }
}

/// Renders a template: substitutes the variables that are both declared and
/// supplied, then prepends the namespace prologue.
///
/// `declared == None` means the template has no forced bindings block, in
/// which case nothing is substituted. Supplied names that are not declared
/// are ignored.
pub fn render(
    template: &str,
    declared: Option<&ForcedBindingSpec>,
    user: &Bindings,
    namespaces: &Namespaces,
    mode: SubstitutionMode,
) -> Result<String> {
    let mut replacements: IndexMap<&str, String> = IndexMap::new();
    if let Some(declared) = declared {
        for (name, value) in user.iter() {
            let Some(spec) = declared.get(name) else {
                debug!(variable = name, "not a forced binding, ignored");
                continue;
            };
            let text = replacement(spec.kind, value, namespaces);
            debug!(variable = name, kind = %spec.kind, replacement = %text, "replacing variable");
            replacements.insert(name, text);
        }
    }
    let body = match mode {
        SubstitutionMode::Legacy => substitute_legacy(template, &replacements)?,
        SubstitutionMode::Tokenized => substitute_tokens(template, &replacements),
    };
    let mut sparql = namespaces.prologue();
    sparql.push_str(&body);
    Ok(sparql)
}

/// The three anchored substitutions per variable, applied in binding order.
fn substitute_legacy(template: &str, replacements: &IndexMap<&str, String>) -> Result<String> {
    let mut sparql = template.to_string();
    for (name, value) in replacements {
        let marker = format!(r"[?$]{}", regex::escape(name));
        let contexts = [(r"\s+", " "), (r"\}", " } "), (r"\.", " . ")];
        for (trailing, separator) in contexts {
            let pattern = Regex::new(&format!("{marker}{trailing}"))
                .map_err(|e| SepaError::ConfigParsing(format!("variable '{name}': {e}")))?;
            let with = format!("{value}{separator}");
            sparql = pattern.replace_all(&sparql, NoExpand(&with)).into_owned();
        }
    }
    Ok(sparql)
}

fn is_varname_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '\u{00B7}'
}

/// Single scan substitution. String literals, IRI references and comments are
/// copied untouched.
fn substitute_tokens(template: &str, replacements: &IndexMap<&str, String>) -> String {
    if replacements.is_empty() {
        return template.to_string();
    }
    let mut sparql = String::with_capacity(template.len());
    let mut position = 0;
    while let Some(c) = template[position..].chars().next() {
        let rest = &template[position..];
        let consumed = match c {
            '\'' | '"' => {
                let end = literal_end(rest, c);
                sparql.push_str(&rest[..end]);
                end
            }
            '<' => {
                let end = iri_end(rest).unwrap_or(1);
                sparql.push_str(&rest[..end]);
                end
            }
            '#' if starts_comment(&template[..position]) => {
                let end = rest.find('\n').unwrap_or(rest.len());
                sparql.push_str(&rest[..end]);
                end
            }
            '?' | '$' => {
                let name_len = rest[1..]
                    .char_indices()
                    .find(|(_, ch)| !is_varname_char(*ch))
                    .map_or(rest.len() - 1, |(j, _)| j);
                let name = &rest[1..1 + name_len];
                match replacements.get(name) {
                    Some(value) if !name.is_empty() => sparql.push_str(value),
                    _ => sparql.push_str(&rest[..1 + name_len]),
                }
                1 + name_len
            }
            _ => {
                sparql.push(c);
                c.len_utf8()
            }
        };
        position += consumed;
    }
    sparql
}

/// Byte length of the string literal at the start of `rest`, quotes included.
/// An unterminated short literal stops at the end of its line.
fn literal_end(rest: &str, quote: char) -> usize {
    let triple = if quote == '\'' { "'''" } else { "\"\"\"" };
    let long = rest.starts_with(triple);
    let opening = if long { 3 } else { 1 };
    let mut escaped = false;
    for (j, c) in rest.char_indices().skip(opening) {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' => escaped = true,
            '\n' if !long => return j,
            c if c == quote => {
                if !long {
                    return j + 1;
                }
                if rest[j..].starts_with(triple) {
                    return j + 3;
                }
            }
            _ => {}
        }
    }
    rest.len()
}

/// A `#` glued to a name, as in the escaped local name `ex:a\#b`, does not
/// open a comment.
fn starts_comment(before: &str) -> bool {
    !before
        .chars()
        .next_back()
        .is_some_and(|c| c == '\\' || c == ':' || c == '-' || is_varname_char(c))
}

/// Byte length of the IRI reference at the start of `rest`, if it is one.
/// `<?`, `<$` and `<=` are comparisons, so is anything containing `&&`.
fn iri_end(rest: &str) -> Option<usize> {
    if rest[1..].starts_with(['?', '$', '=']) {
        return None;
    }
    for (j, c) in rest.char_indices().skip(1) {
        match c {
            '>' => return Some(j + 1),
            '&' if rest[j..].starts_with("&&") => return None,
            '<' | '"' | '{' | '}' | '|' | '^' | '`' | '\\' => return None,
            c if c <= ' ' => return None,
            _ => {}
        }
    }
    None
}
