//! Parameter specifications: a predicate tree over parameter keys plus value
//! validators and key reducers.
//!
//! ```text
//! all_of([only_one_of([key("distro"), key("image")]), key("count"), opt(["ip"])])
//! ```
//!
//! renders as `(distro | image) + count + [ip]` in help output.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::value::Value;

/// Which optional parameters the compiler asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SuggestionMode {
    /// Never ask.
    None,
    /// Ask only for optional parameters marked as suggested.
    #[default]
    RequiredOnly,
    /// Ask for every optional parameter.
    AllSuggested,
}

/// Predicate tree over parameter keys.
#[derive(Debug, Clone, PartialEq)]
pub enum Rule {
    /// The key must be present.
    Key {
        /// Parameter key.
        key: String,
        /// Offered by the suggestion pass when absent.
        suggested: bool,
    },
    /// Keys that may be present.
    Opt {
        /// Optional keys.
        keys: Vec<String>,
        /// Offered by the suggestion pass in [`SuggestionMode::RequiredOnly`].
        suggested: bool,
    },
    /// Every child must hold.
    AllOf(Vec<Rule>),
    /// Exactly one child must hold.
    OnlyOneOf(Vec<Rule>),
    /// At least one child must hold.
    AtLeastOneOf(Vec<Rule>),
    /// No parameter at all.
    None,
}

/// Required key.
pub fn key(k: &str) -> Rule {
    Rule::Key {
        key: k.to_string(),
        suggested: false,
    }
}

/// Required key offered by the suggestion pass.
pub fn suggested_key(k: &str) -> Rule {
    Rule::Key {
        key: k.to_string(),
        suggested: true,
    }
}

/// Optional keys.
pub fn opt(keys: &[&str]) -> Rule {
    Rule::Opt {
        keys: keys.iter().map(|k| k.to_string()).collect(),
        suggested: false,
    }
}

/// Optional keys the suggestion pass asks for by default.
pub fn suggested(keys: &[&str]) -> Rule {
    Rule::Opt {
        keys: keys.iter().map(|k| k.to_string()).collect(),
        suggested: true,
    }
}

/// Every rule must hold.
pub fn all_of(rules: Vec<Rule>) -> Rule {
    Rule::AllOf(rules)
}

/// Exactly one rule must hold.
pub fn only_one_of(rules: Vec<Rule>) -> Rule {
    Rule::OnlyOneOf(rules)
}

/// At least one rule must hold.
pub fn at_least_one_of(rules: Vec<Rule>) -> Rule {
    Rule::AtLeastOneOf(rules)
}

#[derive(Debug, PartialEq)]
enum Outcome {
    Pass,
    Optional,
    Fail,
}

impl Rule {
    fn run(&self, input: &BTreeSet<String>) -> Outcome {
        match self {
            Rule::Key { key, .. } => {
                if input.contains(key) {
                    Outcome::Pass
                } else {
                    Outcome::Fail
                }
            }
            Rule::Opt { .. } => Outcome::Optional,
            Rule::None => Outcome::Pass,
            Rule::AllOf(rules) => {
                if rules.iter().any(|r| r.run(input) == Outcome::Fail) {
                    Outcome::Fail
                } else {
                    Outcome::Pass
                }
            }
            Rule::OnlyOneOf(rules) => {
                if rules.is_empty() {
                    return Outcome::Pass;
                }
                let passed = rules
                    .iter()
                    .filter(|r| r.run(input) == Outcome::Pass)
                    .count();
                if passed == 1 {
                    Outcome::Pass
                } else {
                    Outcome::Fail
                }
            }
            Rule::AtLeastOneOf(rules) => {
                if rules.is_empty() || rules.iter().any(|r| r.run(input) != Outcome::Fail) {
                    Outcome::Pass
                } else {
                    Outcome::Fail
                }
            }
        }
    }

    /// Whether the keys in `input` satisfy the rule.
    pub fn holds(&self, input: &BTreeSet<String>) -> bool {
        self.run(input) != Outcome::Fail
    }

    /// Keys that must be added for the rule to hold.
    ///
    /// Exclusive groups report the first alternative.
    pub fn missing(&self, input: &BTreeSet<String>) -> Vec<String> {
        match self {
            Rule::Key { key, .. } if !input.contains(key) => vec![key.clone()],
            Rule::AllOf(rules) => rules.iter().flat_map(|r| r.missing(input)).collect(),
            Rule::OnlyOneOf(rules) | Rule::AtLeastOneOf(rules) => {
                match rules.first() {
                    Some(first) if self.run(input) == Outcome::Fail => first.missing(input),
                    _ => Vec::new(),
                }
            }
            _ => Vec::new(),
        }
    }

    /// Exclusive groups given more than one alternative, as
    /// `only one of [a, b]`.
    pub fn conflicts(&self, input: &BTreeSet<String>) -> Vec<String> {
        match self {
            Rule::AllOf(rules) | Rule::AtLeastOneOf(rules) => {
                rules.iter().flat_map(|r| r.conflicts(input)).collect()
            }
            Rule::OnlyOneOf(rules) => {
                let passed = rules
                    .iter()
                    .filter(|r| r.run(input) == Outcome::Pass)
                    .count();
                if passed > 1 {
                    let names: Vec<String> = rules.iter().map(|r| r.to_string()).collect();
                    vec![format!("only one of [{}]", names.join(", "))]
                } else {
                    rules.iter().flat_map(|r| r.conflicts(input)).collect()
                }
            }
            _ => Vec::new(),
        }
    }

    /// Keys required when nothing is provided.
    pub fn required(&self) -> Vec<String> {
        match self {
            Rule::Key { key, .. } => vec![key.clone()],
            Rule::AllOf(rules) => rules.iter().flat_map(Rule::required).collect(),
            Rule::OnlyOneOf(rules) | Rule::AtLeastOneOf(rules) => {
                rules.first().map(Rule::required).unwrap_or_default()
            }
            _ => Vec::new(),
        }
    }

    /// Absent keys worth proposing under `mode`.
    pub fn suggested(&self, input: &BTreeSet<String>, mode: SuggestionMode) -> Vec<String> {
        if mode == SuggestionMode::None {
            return Vec::new();
        }
        match self {
            Rule::Key { key, suggested } if *suggested && !input.contains(key) => {
                vec![key.clone()]
            }
            Rule::Opt { keys, suggested } => {
                let wanted = mode == SuggestionMode::AllSuggested || *suggested;
                if !wanted {
                    return Vec::new();
                }
                keys.iter()
                    .filter(|k| !input.contains(*k))
                    .cloned()
                    .collect()
            }
            Rule::AllOf(rules) | Rule::OnlyOneOf(rules) | Rule::AtLeastOneOf(rules) => rules
                .iter()
                .flat_map(|r| r.suggested(input, mode))
                .collect(),
            _ => Vec::new(),
        }
    }

    fn collect(&self, keys: &mut Vec<String>, opts: &mut Vec<String>) {
        match self {
            Rule::Key { key, .. } => keys.push(key.clone()),
            Rule::Opt { keys: o, .. } => opts.extend(o.iter().cloned()),
            Rule::AllOf(rules) | Rule::OnlyOneOf(rules) | Rule::AtLeastOneOf(rules) => {
                for r in rules {
                    r.collect(keys, opts);
                }
            }
            Rule::None => {}
        }
    }

    /// Flattened view: every key mentioned as required and every optional key.
    pub fn view(&self) -> RuleView {
        let mut required = Vec::new();
        let mut extra = Vec::new();
        self.collect(&mut required, &mut extra);
        required.sort();
        required.dedup();
        extra.sort();
        extra.dedup();
        RuleView { required, extra }
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let join = |rules: &[Rule], sep: &str| {
            rules
                .iter()
                .map(|r| r.to_string())
                .collect::<Vec<_>>()
                .join(sep)
        };
        match self {
            Rule::Key { key, .. } => write!(f, "{}", key),
            Rule::Opt { keys, .. } => write!(f, "[{}]", keys.join(" ")),
            Rule::AllOf(rules) => write!(f, "{}", join(rules, " + ")),
            Rule::OnlyOneOf(rules) => write!(f, "({})", join(rules, " | ")),
            Rule::AtLeastOneOf(rules) => write!(f, "({})", join(rules, " / ")),
            Rule::None => write!(f, "none"),
        }
    }
}

/// Flattened key lists of a rule.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RuleView {
    /// Keys appearing as [`Rule::Key`], sorted.
    pub required: Vec<String>,
    /// Keys appearing in [`Rule::Opt`], sorted.
    pub extra: Vec<String>,
}

impl RuleView {
    /// Whether `key` appears anywhere in the rule.
    pub fn knows(&self, key: &str) -> bool {
        self.required.iter().any(|k| k == key) || self.extra.iter().any(|k| k == key)
    }
}

/// Value validator attached to a parameter key.
#[derive(Debug, Clone, PartialEq)]
pub enum Validator {
    /// Anything goes.
    Any,
    /// Case-insensitive member of a fixed set.
    Enum(Vec<String>),
    /// Integer within an inclusive range.
    IntRange(i64, i64),
    /// IPv4 network in CIDR notation.
    Cidr,
    /// IPv4 or IPv6 address.
    Ip,
    /// Path to an existing regular file.
    FileExists,
    /// `true` or `false`.
    Bool,
    /// String of at least n characters.
    MinLength(usize),
    /// String of at most n characters.
    MaxLength(usize),
}

/// Enum validator shorthand.
pub fn one_of(items: &[&str]) -> Validator {
    Validator::Enum(items.iter().map(|s| s.to_string()).collect())
}

impl Validator {
    /// Check one value; lists are checked element by element.
    pub fn check(&self, value: &Value) -> Result<(), String> {
        if let Value::List(items) = value {
            return items.iter().try_for_each(|item| self.check(item));
        }
        let text = value.to_plain_string();
        match self {
            Validator::Any => Ok(()),
            Validator::Enum(items) => {
                if items.iter().any(|i| i.eq_ignore_ascii_case(&text)) {
                    Ok(())
                } else {
                    Err(format!(
                        "expected any of [{}] but got '{}'",
                        items.join(" "),
                        text
                    ))
                }
            }
            Validator::IntRange(min, max) => {
                let n = match value {
                    Value::Int(n) => Some(*n),
                    _ => text.parse::<i64>().ok(),
                };
                match n {
                    Some(n) if n >= *min && n <= *max => Ok(()),
                    _ => Err(format!(
                        "expected integer between {} and {} but got '{}'",
                        min, max, text
                    )),
                }
            }
            Validator::Cidr => {
                let valid = text.split_once('/').is_some_and(|(ip, prefix)| {
                    ip.parse::<Ipv4Addr>().is_ok()
                        && prefix.parse::<u8>().is_ok_and(|p| p <= 32)
                });
                if valid {
                    Ok(())
                } else {
                    Err(format!("expected valid CIDR but got '{}'", text))
                }
            }
            Validator::Ip => {
                if text.parse::<IpAddr>().is_ok() {
                    Ok(())
                } else {
                    Err(format!("expected valid IP address but got '{}'", text))
                }
            }
            Validator::FileExists => {
                let path = Path::new(&text);
                match std::fs::metadata(path) {
                    Err(_) => Err(format!("cannot find file '{}'", text)),
                    Ok(meta) if meta.is_dir() => Err(format!("'{}' is a directory", text)),
                    Ok(_) => Ok(()),
                }
            }
            Validator::Bool => match text.to_ascii_lowercase().as_str() {
                "true" | "false" => Ok(()),
                _ => Err(format!("expected true or false but got '{}'", text)),
            },
            Validator::MinLength(l) => {
                let actual = text.chars().count();
                if actual < *l {
                    Err(format!("expected min length of {} but got {}", l, actual))
                } else {
                    Ok(())
                }
            }
            Validator::MaxLength(l) => {
                let actual = text.chars().count();
                if actual > *l {
                    Err(format!("expected max length of {} but got {}", l, actual))
                } else {
                    Ok(())
                }
            }
        }
    }
}

/// Rewrites a set of input keys into other keys before validation and execution.
pub type ReducerFn =
    Arc<dyn Fn(&BTreeMap<String, Value>) -> Result<BTreeMap<String, Value>, String> + Send + Sync>;

/// A key rewrite, e.g. `id` into `ids` or `distro` into `image`.
#[derive(Clone)]
pub struct Reducer {
    /// Keys consumed.
    pub inputs: Vec<String>,
    /// Keys produced.
    pub outputs: Vec<String>,
    func: ReducerFn,
}

impl fmt::Debug for Reducer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reducer")
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .finish()
    }
}

impl Reducer {
    /// Build a reducer from `inputs` to `outputs`.
    pub fn new(
        inputs: &[&str],
        outputs: &[&str],
        func: impl Fn(&BTreeMap<String, Value>) -> Result<BTreeMap<String, Value>, String>
        + Send
        + Sync
        + 'static,
    ) -> Self {
        Self {
            inputs: inputs.iter().map(|s| s.to_string()).collect(),
            outputs: outputs.iter().map(|s| s.to_string()).collect(),
            func: Arc::new(func),
        }
    }

    fn applies_to(&self, keys: &BTreeSet<String>) -> bool {
        self.inputs.iter().any(|k| keys.contains(k))
    }
}

/// Outcome of validating a parameter bag.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Validation {
    /// Required keys absent.
    pub missing: Vec<String>,
    /// Keys the specification does not mention.
    pub unexpected: Vec<String>,
    /// Exclusive groups given several alternatives.
    pub conflicts: Vec<String>,
    /// Validator failures, as `param 'key': message`.
    pub type_errors: Vec<String>,
}

impl Validation {
    /// No problem found.
    pub fn is_ok(&self) -> bool {
        self.missing.is_empty()
            && self.unexpected.is_empty()
            && self.conflicts.is_empty()
            && self.type_errors.is_empty()
    }
}

/// Parameter specification attached to a command.
#[derive(Debug, Clone)]
pub struct Spec {
    rule: Rule,
    validators: BTreeMap<String, Validator>,
    reducers: Vec<Reducer>,
}

impl Spec {
    /// Specification with no validator.
    pub fn new(rule: Rule) -> Self {
        Self {
            rule,
            validators: BTreeMap::new(),
            reducers: Vec::new(),
        }
    }

    /// Attach a validator to `key`.
    pub fn validator(mut self, key: &str, validator: Validator) -> Self {
        self.validators.insert(key.to_string(), validator);
        self
    }

    /// Attach a reducer.
    pub fn reducer(mut self, reducer: Reducer) -> Self {
        self.reducers.push(reducer);
        self
    }

    /// The predicate tree.
    pub fn rule(&self) -> &Rule {
        &self.rule
    }

    /// Flattened key lists.
    pub fn view(&self) -> RuleView {
        self.rule.view()
    }

    /// Keys present in `keys` but unknown to the specification, in input order.
    pub fn unexpected<'k>(&self, keys: impl IntoIterator<Item = &'k String>) -> Vec<String> {
        let view = self.view();
        keys.into_iter()
            .filter(|k| !view.knows(k))
            .cloned()
            .collect()
    }

    /// Required keys absent from `keys`.
    pub fn missing(&self, keys: &BTreeSet<String>) -> Vec<String> {
        self.rule.missing(keys)
    }

    /// Optional keys worth proposing under `mode`.
    pub fn suggested(&self, keys: &BTreeSet<String>, mode: SuggestionMode) -> Vec<String> {
        let mut out = self.rule.suggested(keys, mode);
        out.dedup();
        out
    }

    /// Key set after reducers, so reduced keys count as provided.
    pub fn reduce_keys(&self, keys: &BTreeSet<String>) -> BTreeSet<String> {
        let mut out = keys.clone();
        for reducer in &self.reducers {
            if reducer.applies_to(&out) {
                for k in &reducer.inputs {
                    out.remove(k);
                }
                out.extend(reducer.outputs.iter().cloned());
            }
        }
        out
    }

    /// Apply reducers to resolved values.
    pub fn reduce(&self, values: &BTreeMap<String, Value>) -> Result<BTreeMap<String, Value>, String> {
        let mut out = values.clone();
        for reducer in &self.reducers {
            let present: BTreeSet<String> = out.keys().cloned().collect();
            if !reducer.applies_to(&present) {
                continue;
            }
            let mut consumed = BTreeMap::new();
            for k in &reducer.inputs {
                if let Some(v) = out.remove(k) {
                    consumed.insert(k.clone(), v);
                }
            }
            out.extend((reducer.func)(&consumed)?);
        }
        Ok(out)
    }

    /// Validate a parameter bag.
    ///
    /// `keys` is every provided key, including those whose value is not yet
    /// known (references); `values` holds the resolved ones.
    pub fn validate(&self, keys: &BTreeSet<String>, values: &BTreeMap<String, Value>) -> Validation {
        let unexpected = self.unexpected(keys.iter());
        // Reducers may fold one alternative into another, so conflicts are
        // read off the keys as written.
        let mut conflicts = self.rule.conflicts(keys);
        let reduced_keys = self.reduce_keys(keys);
        for conflict in self.rule.conflicts(&reduced_keys) {
            if !conflicts.contains(&conflict) {
                conflicts.push(conflict);
            }
        }
        let mut missing = Vec::new();
        if !self.rule.holds(&reduced_keys) {
            missing = self.rule.missing(&reduced_keys);
        }
        let mut type_errors = Vec::new();
        match self.reduce(values) {
            Ok(reduced) => {
                for (k, validator) in &self.validators {
                    if let Some(v) = reduced.get(k) {
                        if let Err(e) = validator.check(v) {
                            type_errors.push(format!("param '{}': {}", k, e));
                        }
                    }
                }
            }
            Err(e) => type_errors.push(e),
        }
        Validation {
            missing,
            unexpected,
            conflicts,
            type_errors,
        }
    }

    /// One-line usage summary.
    pub fn help(&self) -> String {
        self.rule.to_string()
    }
}
