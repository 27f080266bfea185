//! Execution records.
//!
//! A [`TemplateExecution`] is what gets persisted after a run: the executed
//! template with per-command results and errors, plus who ran it, where and
//! with which fillers. On disk each command is stored as its rendered line;
//! loading re-parses the lines.

use std::collections::BTreeMap;
use std::io::{self, Write};

use chrono::{DateTime, Utc};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::ast::{Statement, Template};
use super::parser::parse;
use super::revert;
use super::ulid;
use super::value::Value;
use super::{Result, TemplateError};

/// Longest message kept on a record.
pub const MAX_MESSAGE_LEN: usize = 140;

/// Persisted outcome of a template run.
#[derive(Debug, Clone, PartialEq)]
pub struct TemplateExecution {
    /// Executed template; its id is the record id.
    pub template: Template,
    /// Who ran it.
    pub author: String,
    /// Template text as submitted.
    pub source: String,
    /// Region, or `global`.
    pub locale: String,
    /// Credential profile.
    pub profile: String,
    /// Free-form message, at most [`MAX_MESSAGE_LEN`] characters.
    pub message: String,
    /// File the template was read from.
    pub path: String,
    /// Fillers consumed while compiling.
    pub fillers: BTreeMap<String, Value>,
}

impl TemplateExecution {
    /// Record for `template` with empty metadata.
    pub fn new(template: Template) -> Self {
        Self {
            template,
            author: String::new(),
            source: String::new(),
            locale: String::new(),
            profile: String::new(),
            message: String::new(),
            path: String::new(),
            fillers: BTreeMap::new(),
        }
    }

    /// Record id.
    pub fn id(&self) -> &str {
        &self.template.id
    }

    /// Creation date carried by the id.
    pub fn date(&self) -> Option<DateTime<Utc>> {
        ulid::parse_time(&self.template.id)
    }

    /// Whether the template held a single command.
    pub fn is_one_liner(&self) -> bool {
        self.template.command_nodes().count() == 1
    }

    /// Set the message, trimmed and cut to [`MAX_MESSAGE_LEN`] characters.
    pub fn set_message(&mut self, message: &str) {
        let trimmed = message.trim();
        if trimmed.chars().count() > MAX_MESSAGE_LEN {
            let kept: String = trimmed.chars().take(MAX_MESSAGE_LEN - 3).collect();
            self.message = format!("{}...", kept);
        } else {
            self.message = trimmed.to_string();
        }
    }

    /// Command counts.
    pub fn stats(&self) -> ExecutionStats {
        let mut stats = ExecutionStats::default();
        for cmd in self.template.command_nodes() {
            stats.total += 1;
            if cmd.has_error() {
                stats.ko += 1;
            } else {
                stats.ok += 1;
            }
            *stats.action_entity_count.entry(cmd.key()).or_default() += 1;
        }
        if self.is_one_liner() {
            stats.one_liner = self.template.command_nodes().next().map(|c| c.to_string());
        }
        stats
    }

    /// Whether reverting would emit at least one command.
    pub fn is_revertible(&self) -> bool {
        revert::is_revertible(&self.template)
    }

    /// Undo template.
    pub fn revert(&self) -> Result<Template> {
        revert::revert(&self.template)
    }

    /// Pretty JSON form.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Load a record from JSON.
    pub fn from_json(text: &str) -> Result<Self> {
        let wire: ExecutionWire = serde_json::from_str(text)?;
        wire.into_execution()
    }
}

/// Command counts of an execution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionStats {
    /// Succeeded commands.
    pub ok: usize,
    /// Failed commands.
    pub ko: usize,
    /// All commands.
    pub total: usize,
    /// Count per `action entity`.
    pub action_entity_count: BTreeMap<String, usize>,
    /// The single command line, for one-liners.
    pub one_liner: Option<String>,
}

impl ExecutionStats {
    /// Every command failed.
    pub fn all_ko(&self) -> bool {
        self.total > 0 && self.ko == self.total
    }
}

#[derive(Serialize, Deserialize)]
struct ExecutionWire {
    id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    author: String,
    #[serde(default)]
    source: String,
    #[serde(default)]
    locale: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    profile: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    message: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    path: String,
    #[serde(default)]
    fillers: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    commands: Vec<CommandWire>,
}

#[derive(Serialize, Deserialize)]
struct CommandWire {
    line: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    errors: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    results: Vec<String>,
}

impl From<&TemplateExecution> for ExecutionWire {
    fn from(exec: &TemplateExecution) -> Self {
        let commands = exec
            .template
            .command_nodes()
            .map(|cmd| CommandWire {
                line: cmd.to_string(),
                errors: cmd.error.iter().cloned().collect(),
                results: cmd.result.iter().filter(|r| !r.is_empty()).cloned().collect(),
            })
            .collect();
        Self {
            id: exec.template.id.clone(),
            author: exec.author.clone(),
            source: exec.source.clone(),
            locale: exec.locale.clone(),
            profile: exec.profile.clone(),
            message: exec.message.clone(),
            path: exec.path.clone(),
            fillers: exec
                .fillers
                .iter()
                .map(|(k, v)| (k.clone(), v.to_json()))
                .collect(),
            commands,
        }
    }
}

impl ExecutionWire {
    fn into_execution(self) -> Result<TemplateExecution> {
        let mut statements: Vec<Statement> = Vec::with_capacity(self.commands.len());
        for wire in self.commands {
            let parsed = parse(&wire.line)?;
            let Some(mut st) = parsed.statements.into_iter().next() else {
                return Err(TemplateError::Parse {
                    line: 1,
                    message: format!("empty command line in record {}", self.id),
                });
            };
            if let Some(cmd) = st.command_mut() {
                cmd.result = wire.results.into_iter().next();
                cmd.error = wire.errors.into_iter().next();
            }
            statements.push(st);
        }
        Ok(TemplateExecution {
            template: Template::with_id(self.id, statements),
            author: self.author,
            source: self.source,
            locale: self.locale,
            profile: self.profile,
            message: self.message,
            path: self.path,
            fillers: self
                .fillers
                .iter()
                .map(|(k, v)| (k.clone(), Value::from_json(v)))
                .collect(),
        })
    }
}

impl Serialize for TemplateExecution {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        ExecutionWire::from(self).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for TemplateExecution {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        ExecutionWire::deserialize(deserializer)?
            .into_execution()
            .map_err(D::Error::custom)
    }
}

/// Renders an execution for humans.
pub trait Printer {
    /// Write `exec` to `w`.
    fn print(&self, w: &mut dyn Write, exec: &TemplateExecution) -> io::Result<()>;
}

/// One line per command: `OK  entity = result` or `KO  action entity`.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultPrinter;

impl Printer for DefaultPrinter {
    fn print(&self, w: &mut dyn Write, exec: &TemplateExecution) -> io::Result<()> {
        for cmd in exec.template.command_nodes() {
            let status = if cmd.has_error() { "KO" } else { "OK" };
            match cmd.result.as_deref().filter(|r| !r.is_empty()) {
                Some(result) => writeln!(w, "    {}\t{} = {}", status, cmd.entity, result)?,
                None => writeln!(w, "    {}\t{} {}", status, cmd.action, cmd.entity)?,
            }
            if let Some(err) = &cmd.error {
                write_error_lines(w, err)?;
            }
        }
        Ok(())
    }
}

/// Header line with id, date, author and region, then every command line.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogPrinter;

impl Printer for LogPrinter {
    fn print(&self, w: &mut dyn Write, exec: &TemplateExecution) -> io::Result<()> {
        let date = exec
            .date()
            .map(|d| d.format("%b %e %H:%M:%S").to_string())
            .unwrap_or_default();
        write!(w, "ID: {}, Date: {}", exec.id(), date)?;
        if !exec.author.is_empty() {
            write!(w, ", Author: {}", exec.author)?;
        }
        if !exec.locale.is_empty() {
            write!(w, ", Region: {}", exec.locale)?;
        }
        if !exec.is_revertible() {
            write!(w, " (not revertible)")?;
        }
        writeln!(w)?;
        for cmd in exec.template.command_nodes() {
            let status = if cmd.has_error() { "KO" } else { "OK" };
            match cmd.result.as_deref().filter(|r| !r.is_empty()) {
                Some(result) => writeln!(w, "    {}\t{}\t[{}]", status, cmd, result)?,
                None => writeln!(w, "    {}\t{}", status, cmd)?,
            }
            if let Some(err) = &cmd.error {
                write_error_lines(w, err)?;
            }
        }
        Ok(())
    }
}

fn write_error_lines(w: &mut dyn Write, err: &str) -> io::Result<()> {
    for line in err.replace('\t', "").lines() {
        writeln!(w, "\t    {}", line)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn executed() -> TemplateExecution {
        let mut tpl = parse("sub = create subnet cidr=10.0.0.0/24 vpc=vpc-1\ncreate instance subnet=$sub type=t2.micro").unwrap();
        {
            let mut nodes = tpl.command_nodes_mut();
            nodes.next().unwrap().result = Some("sub-1".into());
            nodes.next().unwrap().error = Some("InsufficientCapacity: none left\nretry later".into());
        }
        let mut exec = TemplateExecution::new(tpl);
        exec.author = "alice".into();
        exec.locale = "us-east-1".into();
        exec.fillers.insert("instance.type".into(), Value::from("t2.micro"));
        exec
    }

    #[test]
    fn json_keeps_lines_results_and_errors() {
        let exec = executed();
        let json = exec.to_json().unwrap();
        let raw: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(raw["commands"][0]["line"], "create subnet cidr=10.0.0.0/24 vpc=vpc-1");
        assert_eq!(raw["commands"][0]["results"][0], "sub-1");
        assert!(raw["commands"][0].get("errors").is_none());
        assert!(raw.get("profile").is_none());

        let loaded = TemplateExecution::from_json(&json).unwrap();
        assert_eq!(loaded.id(), exec.id());
        assert_eq!(loaded.author, "alice");
        assert_eq!(loaded.fillers, exec.fillers);
        let nodes: Vec<_> = loaded.template.command_nodes().collect();
        assert_eq!(nodes[0].result.as_deref(), Some("sub-1"));
        assert!(nodes[1].error.as_deref().unwrap().starts_with("InsufficientCapacity"));
        assert_eq!(nodes[1].to_string(), "create instance subnet=$sub type=t2.micro");
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let json = r#"{"id":"01BX5ZZKBKACTAV9WEVGEMMVRZ","future":{"a":1},"fillers":{"on":true},
            "commands":[{"line":"create vpc cidr=10.0.0.0/16","results":["vpc-1"]}]}"#;
        let exec = TemplateExecution::from_json(json).unwrap();
        assert_eq!(exec.fillers["on"], Value::from("true"));
        assert!(exec.is_one_liner());
        assert!(exec.date().is_some());
    }

    #[test]
    fn stats_and_message() {
        let mut exec = executed();
        let stats = exec.stats();
        assert_eq!((stats.ok, stats.ko, stats.total), (1, 1, 2));
        assert_eq!(stats.action_entity_count["create subnet"], 1);
        assert!(stats.one_liner.is_none());
        assert!(!stats.all_ko());

        exec.set_message(&format!("  {}  ", "x".repeat(200)));
        assert_eq!(exec.message.chars().count(), MAX_MESSAGE_LEN);
        assert!(exec.message.ends_with("..."));
        exec.set_message(" deploy ");
        assert_eq!(exec.message, "deploy");
    }

    #[test]
    fn printers() {
        let exec = executed();
        let mut out = Vec::new();
        DefaultPrinter.print(&mut out, &exec).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("    OK\tsubnet = sub-1\n"));
        assert!(text.contains("    KO\tcreate instance\n"));
        assert!(text.contains("\t    retry later\n"));

        let mut out = Vec::new();
        LogPrinter.print(&mut out, &exec).unwrap();
        let text = String::from_utf8(out).unwrap();
        let header = text.lines().next().unwrap();
        assert!(header.starts_with(&format!("ID: {}, Date: ", exec.id())));
        assert!(header.ends_with(", Author: alice, Region: us-east-1"));
        assert!(text.contains("    OK\tcreate subnet cidr=10.0.0.0/24 vpc=vpc-1\t[sub-1]\n"));
    }
}
