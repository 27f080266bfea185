//! Parameter value forms carried by command and declaration nodes.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Characters allowed in an unquoted string token.
static BARE_STRING: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z0-9\-._:/+;~@<>*]+$").expect("bare string pattern"));

/// A resolved value: what holes are filled with and what commands receive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// Signed integer literal.
    Int(i64),
    /// Floating-point literal.
    Float(f64),
    /// UTF-8 string literal.
    String(String),
    /// Ordered list of values.
    List(Vec<Value>),
}

impl Value {
    /// Borrow the string payload, if this is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Render a scalar as plain text (no quoting). Lists are joined with commas.
    pub fn to_plain_string(&self) -> String {
        match self {
            Value::Int(n) => n.to_string(),
            Value::Float(f) => format_float(*f),
            Value::String(s) => s.clone(),
            Value::List(items) => items
                .iter()
                .map(Value::to_plain_string)
                .collect::<Vec<_>>()
                .join(","),
        }
    }

    /// Flatten into a list of scalars (a scalar yields itself).
    pub fn to_list(&self) -> Vec<Value> {
        match self {
            Value::List(items) => items.iter().flat_map(Value::to_list).collect(),
            other => vec![other.clone()],
        }
    }

    /// Convert into JSON.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Int(n) => serde_json::Value::from(*n),
            Value::Float(f) => serde_json::Value::from(*f),
            Value::String(s) => serde_json::Value::from(s.clone()),
            Value::List(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
        }
    }

    /// Convert from JSON scalars and arrays; objects, nulls and booleans become strings.
    pub fn from_json(value: &serde_json::Value) -> Value {
        match value {
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or_default()),
            },
            serde_json::Value::String(s) => Value::String(s.clone()),
            serde_json::Value::Array(items) => {
                Value::List(items.iter().map(Value::from_json).collect())
            }
            serde_json::Value::Bool(b) => Value::String(b.to_string()),
            serde_json::Value::Null => Value::String(String::new()),
            other => Value::String(other.to_string()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(n) => write!(f, "{}", n),
            Value::Float(v) => write!(f, "{}", format_float(*v)),
            Value::String(s) => write!(f, "{}", quote_if_needed(s)),
            Value::List(items) => {
                let rendered: Vec<String> = items.iter().map(|v| v.to_string()).collect();
                write!(f, "[{}]", rendered.join(","))
            }
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

fn format_float(f: f64) -> String {
    if f.fract() == 0.0 && f.is_finite() {
        format!("{:.1}", f)
    } else {
        format!("{}", f)
    }
}

/// Quote a string only when printing it bare would change how it parses.
///
/// Numeric-looking strings are single-quoted so they stay strings; strings made
/// of the bare alphabet print as-is; anything else is single-quoted, or
/// double-quoted when it contains a single quote.
///
/// The language has no escape sequence, so a string holding both quote kinds
/// (only reachable by concatenation or fillers) prints double-quoted and does
/// not parse back.
pub fn quote_if_needed(s: &str) -> String {
    if s.parse::<i64>().is_ok() || s.parse::<f64>().is_ok() {
        return format!("'{}'", s);
    }
    if BARE_STRING.is_match(s) {
        return s.to_string();
    }
    if s.contains('\'') {
        format!("\"{}\"", s)
    } else {
        format!("'{}'", s)
    }
}

/// Whether a string can be printed without quotes.
pub fn is_bare_string(s: &str) -> bool {
    BARE_STRING.is_match(s)
}

/// A `{key}` placeholder awaiting a caller-supplied value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hole {
    /// Dotted hole key, e.g. `instance.type`.
    pub key: String,
    /// Optional holes come from suggested parameters; prompts may skip them.
    pub optional: bool,
}

impl Hole {
    /// Mandatory hole.
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            optional: false,
        }
    }

    /// Optional (suggested) hole.
    pub fn optional(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            optional: true,
        }
    }
}

/// A parameter value as written in a template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ParamValue {
    /// Resolved scalar literal (never a list; lists use [`ParamValue::List`]).
    Literal(Value),
    /// `$ident` reference to an earlier declaration.
    Reference(String),
    /// `{key}` placeholder.
    Hole(Hole),
    /// `@name` handle into the resource graph.
    Alias(String),
    /// `[a, b, c]`
    List(Vec<ParamValue>),
    /// `a+{b}+$c`
    Concat(Vec<ParamValue>),
}

impl ParamValue {
    /// String literal shorthand.
    pub fn string(s: impl Into<String>) -> Self {
        ParamValue::Literal(Value::String(s.into()))
    }

    /// Build the parameter form of a resolved value.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::List(items) => {
                ParamValue::List(items.into_iter().map(ParamValue::from_value).collect())
            }
            scalar => ParamValue::Literal(scalar),
        }
    }

    /// Holes still present, in order of appearance.
    pub fn holes(&self) -> Vec<&Hole> {
        let mut out = Vec::new();
        self.collect_holes(&mut out);
        out
    }

    fn collect_holes<'a>(&'a self, out: &mut Vec<&'a Hole>) {
        match self {
            ParamValue::Hole(h) => out.push(h),
            ParamValue::List(items) | ParamValue::Concat(items) => {
                for item in items {
                    item.collect_holes(out);
                }
            }
            _ => {}
        }
    }

    /// Aliases still present, in order of appearance.
    pub fn aliases(&self) -> Vec<&str> {
        match self {
            ParamValue::Alias(a) => vec![a.as_str()],
            ParamValue::List(items) | ParamValue::Concat(items) => {
                items.iter().flat_map(|i| i.aliases()).collect()
            }
            _ => Vec::new(),
        }
    }

    /// References still present, in order of appearance.
    pub fn references(&self) -> Vec<&str> {
        match self {
            ParamValue::Reference(r) => vec![r.as_str()],
            ParamValue::List(items) | ParamValue::Concat(items) => {
                items.iter().flat_map(|i| i.references()).collect()
            }
            _ => Vec::new(),
        }
    }

    /// True when no hole, alias or reference remains.
    pub fn is_resolved(&self) -> bool {
        match self {
            ParamValue::Literal(_) => true,
            ParamValue::List(items) | ParamValue::Concat(items) => {
                items.iter().all(ParamValue::is_resolved)
            }
            _ => false,
        }
    }

    /// The resolved value, when fully resolved.
    pub fn to_value(&self) -> Option<Value> {
        match self {
            ParamValue::Literal(v) => Some(v.clone()),
            ParamValue::List(items) => items
                .iter()
                .map(ParamValue::to_value)
                .collect::<Option<Vec<_>>>()
                .map(Value::List),
            ParamValue::Concat(items) => {
                let mut buf = String::new();
                for item in items {
                    buf.push_str(&item.to_value()?.to_plain_string());
                }
                Some(Value::String(buf))
            }
            _ => None,
        }
    }

    /// Fill holes whose key is in `fillers`; returns the fillers consumed.
    pub fn fill_holes(&mut self, fillers: &BTreeMap<String, Value>) -> BTreeMap<String, Value> {
        let mut processed = BTreeMap::new();
        self.fill_holes_into(fillers, &mut processed);
        self.normalize();
        processed
    }

    fn fill_holes_into(
        &mut self,
        fillers: &BTreeMap<String, Value>,
        processed: &mut BTreeMap<String, Value>,
    ) {
        match self {
            ParamValue::Hole(h) => {
                if let Some(v) = fillers.get(&h.key) {
                    processed.insert(h.key.clone(), v.clone());
                    *self = ParamValue::from_value(v.clone());
                }
            }
            ParamValue::List(items) | ParamValue::Concat(items) => {
                for item in items.iter_mut() {
                    item.fill_holes_into(fillers, processed);
                }
            }
            _ => {}
        }
    }

    /// Resolve aliases through `resolve`; unresolved aliases stay in place.
    pub fn resolve_aliases(&mut self, resolve: &mut dyn FnMut(&str) -> Option<String>) {
        match self {
            ParamValue::Alias(a) => {
                if let Some(actual) = resolve(a) {
                    *self = ParamValue::string(actual);
                }
            }
            ParamValue::List(items) | ParamValue::Concat(items) => {
                for item in items.iter_mut() {
                    item.resolve_aliases(resolve);
                }
            }
            _ => {}
        }
        self.normalize();
    }

    /// Substitute every `$name` with `value`.
    pub fn replace_reference(&mut self, name: &str, value: &ParamValue) {
        match self {
            ParamValue::Reference(r) if r.as_str() == name => *self = value.clone(),
            ParamValue::List(items) | ParamValue::Concat(items) => {
                for item in items.iter_mut() {
                    item.replace_reference(name, value);
                }
            }
            _ => {}
        }
        self.normalize();
    }

    /// Materialise references from `vars`, yielding a resolved value.
    ///
    /// Returns the first unbound reference name on failure.
    pub fn materialize(&self, vars: &BTreeMap<String, Value>) -> Result<Value, String> {
        match self {
            ParamValue::Literal(v) => Ok(v.clone()),
            ParamValue::Reference(r) => vars.get(r).cloned().ok_or_else(|| r.clone()),
            ParamValue::List(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    match item.materialize(vars)? {
                        Value::List(nested) => out.extend(nested),
                        scalar => out.push(scalar),
                    }
                }
                Ok(Value::List(out))
            }
            ParamValue::Concat(items) => {
                let mut buf = String::new();
                for item in items {
                    buf.push_str(&item.materialize(vars)?.to_plain_string());
                }
                Ok(Value::String(buf))
            }
            ParamValue::Hole(h) => Err(format!("{{{}}}", h.key)),
            ParamValue::Alias(a) => Err(format!("@{}", a)),
        }
    }

    /// Flatten nested lists and collapse fully resolved concatenations.
    pub fn normalize(&mut self) {
        match self {
            ParamValue::List(items) => {
                let mut flat = Vec::with_capacity(items.len());
                for mut item in items.drain(..) {
                    item.normalize();
                    match item {
                        ParamValue::List(nested) => flat.extend(nested),
                        other => flat.push(other),
                    }
                }
                *items = flat;
            }
            ParamValue::Concat(items) => {
                let mut merged: Vec<ParamValue> = Vec::with_capacity(items.len());
                for mut item in items.drain(..) {
                    item.normalize();
                    if let (Some(ParamValue::Literal(prev)), ParamValue::Literal(next)) =
                        (merged.last_mut(), &item)
                    {
                        if !matches!(prev, Value::List(_)) && !matches!(next, Value::List(_)) {
                            *prev = Value::String(format!(
                                "{}{}",
                                prev.to_plain_string(),
                                next.to_plain_string()
                            ));
                            continue;
                        }
                    }
                    merged.push(item);
                }
                *items = merged;
                if items.iter().all(ParamValue::is_resolved) {
                    if let Some(v) = self.to_value() {
                        *self = ParamValue::Literal(v);
                    }
                }
            }
            _ => {}
        }
    }

    /// Collect resolved parameters keyed by name, e.g. for run-time binding.
    pub fn resolved_map(params: &BTreeMap<String, ParamValue>) -> HashMap<String, Value> {
        params
            .iter()
            .filter_map(|(k, v)| v.to_value().map(|val| (k.clone(), val)))
            .collect()
    }

    fn fmt_piece(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Literal(Value::String(s)) => write!(f, "{}", quote_if_needed(s)),
            other => write!(f, "{}", other),
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Literal(v) => write!(f, "{}", v),
            ParamValue::Reference(r) => write!(f, "${}", r),
            ParamValue::Hole(h) => write!(f, "{{{}}}", h.key),
            ParamValue::Alias(a) => {
                if is_bare_string(a) {
                    write!(f, "@{}", a)
                } else if a.contains('\'') {
                    write!(f, "@\"{}\"", a)
                } else {
                    write!(f, "@'{}'", a)
                }
            }
            ParamValue::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            ParamValue::Concat(items) => {
                if let Some(v) = self.to_value() {
                    return write!(f, "{}", v);
                }
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, "+")?;
                    }
                    item.fmt_piece(f)?;
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quoting_follows_bare_alphabet() {
        assert_eq!(quote_if_needed("t2.micro"), "t2.micro");
        assert_eq!(quote_if_needed("42"), "'42'");
        assert_eq!(quote_if_needed("0123"), "'0123'");
        assert_eq!(quote_if_needed("1.5"), "'1.5'");
        assert_eq!(quote_if_needed("my test instance"), "'my test instance'");
        assert_eq!(quote_if_needed("it's"), "\"it's\"");
        assert_eq!(quote_if_needed("10.0.0.0/24"), "10.0.0.0/24");
        assert_eq!(quote_if_needed("it's \"x\""), "\"it's \"x\"\"");
    }

    #[test]
    fn lists_print_without_spaces() {
        let v = ParamValue::List(vec![
            ParamValue::string("sub-1"),
            ParamValue::Alias("x".into()),
            ParamValue::Reference("r".into()),
        ]);
        assert_eq!(v.to_string(), "[sub-1,@x,$r]");
    }

    #[test]
    fn concat_collapses_once_resolved() {
        let mut v = ParamValue::Concat(vec![
            ParamValue::string("subnet-"),
            ParamValue::Hole(Hole::new("version")),
        ]);
        assert_eq!(v.to_string(), "subnet-+{version}");
        let fillers = BTreeMap::from([("version".to_string(), Value::Int(10))]);
        let processed = v.fill_holes(&fillers);
        assert_eq!(processed.len(), 1);
        assert_eq!(v, ParamValue::string("subnet-10"));
    }

    #[test]
    fn filling_a_listed_hole_with_a_list_flattens() {
        let mut v = ParamValue::List(vec![
            ParamValue::string("a"),
            ParamValue::Hole(Hole::new("more")),
        ]);
        let fillers = BTreeMap::from([(
            "more".to_string(),
            Value::List(vec!["b".into(), "c".into()]),
        )]);
        v.fill_holes(&fillers);
        assert_eq!(v.to_string(), "[a,b,c]");
    }

    #[test]
    fn materialize_reports_unbound_reference() {
        let v = ParamValue::Concat(vec![
            ParamValue::string("x-"),
            ParamValue::Reference("id".into()),
        ]);
        assert_eq!(v.materialize(&BTreeMap::new()), Err("id".to_string()));
        let vars = BTreeMap::from([("id".to_string(), Value::from("42"))]);
        assert_eq!(v.materialize(&vars), Ok(Value::from("x-42")));
    }

    #[test]
    fn floats_keep_a_fraction_when_printed() {
        assert_eq!(Value::Float(2.0).to_string(), "2.0");
        assert_eq!(Value::Float(1.25).to_string(), "1.25");
    }
}
