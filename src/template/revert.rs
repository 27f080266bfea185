//! Undo template synthesis.
//!
//! Walks an executed template backwards and emits, for every command that
//! succeeded and can be undone, the command undoing it. Some undo commands
//! need the cloud to settle first, so `check` commands are inserted around
//! them. The assembled text is parsed again before being handed back.

use tracing::debug;

use super::ast::{CommandNode, Template};
use super::parser::parse;
use super::value::{ParamValue, Value};
use super::Result;

/// Timeout, in seconds, of the inserted `check` commands.
pub const CHECK_TIMEOUT_SECS: i64 = 180;
/// Timeout, in seconds, for databases to disappear.
pub const DATABASE_CHECK_TIMEOUT_SECS: i64 = 900;

/// Whether reverting `template` would emit at least one command.
pub fn is_revertible(template: &Template) -> bool {
    template.command_nodes().any(is_revertible_command)
}

/// Whether `cmd` gets an undo command.
pub fn is_revertible_command(cmd: &CommandNode) -> bool {
    if cmd.has_error() || cmd.action == "check" {
        return false;
    }
    match (cmd.action.as_str(), cmd.entity.as_str()) {
        ("detach", "routetable") => false,
        ("create" | "delete", "record" | "instanceprofile") => true,
        ("start" | "stop", "alarm" | "database") => true,
        ("create", "tag") => true,
        ("attach" | "detach", _) => true,
        ("create" | "start" | "stop" | "copy", _) => result_of(cmd).is_some(),
        _ => false,
    }
}

/// Build the template undoing `template`.
pub fn revert(template: &Template) -> Result<Template> {
    let eligible: Vec<&CommandNode> = template
        .command_nodes()
        .filter(|cmd| is_revertible_command(cmd))
        .collect();
    let mut lines: Vec<CommandNode> = Vec::new();
    for (i, cmd) in eligible.iter().rev().enumerate() {
        let last = i + 1 == eligible.len();
        lines.extend(prechecks(cmd));
        lines.push(undo(cmd));
        if !last {
            lines.extend(postchecks(cmd));
        }
    }
    let text = lines
        .iter()
        .map(|l| l.to_string())
        .collect::<Vec<_>>()
        .join("\n");
    debug!(template = %template.id, "revert:\n{}", text);
    parse(&text)
}

fn result_of(cmd: &CommandNode) -> Option<&str> {
    cmd.result.as_deref().filter(|r| !r.is_empty())
}

fn result_param(cmd: &CommandNode) -> ParamValue {
    ParamValue::string(result_of(cmd).unwrap_or_default())
}

fn undo_action(action: &str) -> &'static str {
    match action {
        "create" | "copy" => "delete",
        "delete" => "create",
        "start" => "stop",
        "stop" => "start",
        "attach" => "detach",
        "detach" => "attach",
        _ => "none",
    }
}

fn copy_params(cmd: &CommandNode, skip: &[&str]) -> CommandNode {
    let mut node = CommandNode::new(undo_action(&cmd.action), cmd.entity.clone());
    for (k, v) in &cmd.params {
        if !skip.contains(&k.as_str()) {
            node.params.insert(k.clone(), v.clone());
        }
    }
    node
}

fn original(cmd: &CommandNode, key: &str) -> ParamValue {
    cmd.params
        .get(key)
        .cloned()
        .unwrap_or_else(|| ParamValue::string(""))
}

fn undo(cmd: &CommandNode) -> CommandNode {
    let node = CommandNode::new(undo_action(&cmd.action), cmd.entity.clone());
    let yes = || ParamValue::string("true");
    match (cmd.action.as_str(), cmd.entity.as_str()) {
        ("attach", "routetable") => node.with_param("association", result_param(cmd)),
        ("detach", "volume") => copy_params(cmd, &["force"]),
        ("attach" | "detach" | "start" | "stop", _) => copy_params(cmd, &[]),
        ("create", "tag") => copy_params(cmd, &[]),
        ("create", "record") => copy_params(cmd, &["comment"]),
        ("delete", "record") => copy_params(cmd, &[]),
        ("delete", "instanceprofile") => node.with_param("name", original(cmd, "name")),
        ("create", "database") => node
            .with_param("id", result_param(cmd))
            .with_param("skipsnapshot", yes()),
        ("create", "policy") => node
            .with_param("arn", result_param(cmd))
            .with_param("all-versions", yes()),
        ("create", "role" | "group" | "user" | "instanceprofile") => {
            node.with_param("name", original(cmd, "name"))
        }
        ("create", "accesskey") => node
            .with_param("id", result_param(cmd))
            .with_param("user", original(cmd, "user")),
        ("create", "s3object") => node
            .with_param("name", result_param(cmd))
            .with_param("bucket", original(cmd, "bucket")),
        ("create", "scalinggroup") => node
            .with_param("name", result_param(cmd))
            .with_param("force", yes()),
        ("create", "bucket" | "launchconfiguration" | "alarm" | "dbsubnetgroup" | "keypair") => {
            node.with_param("name", result_param(cmd))
        }
        ("copy", "image") => node
            .with_param("id", result_param(cmd))
            .with_param("delete-snapshots", yes()),
        _ => node.with_param("id", result_param(cmd)),
    }
}

fn check(entity: &str, id: ParamValue, state: &str, timeout: i64) -> CommandNode {
    CommandNode::new("check", entity)
        .with_param("id", id)
        .with_param("state", ParamValue::string(state))
        .with_param("timeout", ParamValue::Literal(Value::Int(timeout)))
}

/// Every id named by the `id` param, one per list element.
fn ids_of(cmd: &CommandNode) -> Vec<ParamValue> {
    match cmd.params.get("id") {
        Some(ParamValue::List(items)) => items.clone(),
        Some(value) => match value.to_value() {
            Some(Value::List(items)) => items.into_iter().map(ParamValue::from_value).collect(),
            _ => vec![value.clone()],
        },
        None => Vec::new(),
    }
}

fn prechecks(cmd: &CommandNode) -> Vec<CommandNode> {
    match (cmd.action.as_str(), cmd.entity.as_str()) {
        ("create", "securitygroup") => vec![check(
            "securitygroup",
            result_param(cmd),
            "unused",
            CHECK_TIMEOUT_SECS,
        )],
        ("start", "instance") => ids_of(cmd)
            .into_iter()
            .map(|id| check("instance", id, "running", CHECK_TIMEOUT_SECS))
            .collect(),
        ("stop", "instance") => ids_of(cmd)
            .into_iter()
            .map(|id| check("instance", id, "stopped", CHECK_TIMEOUT_SECS))
            .collect(),
        _ => Vec::new(),
    }
}

fn postchecks(cmd: &CommandNode) -> Vec<CommandNode> {
    let checked = match (cmd.action.as_str(), cmd.entity.as_str()) {
        ("create", "instance") => check("instance", result_param(cmd), "terminated", CHECK_TIMEOUT_SECS),
        ("create", "loadbalancer") => {
            check("loadbalancer", result_param(cmd), "not-found", CHECK_TIMEOUT_SECS)
        }
        ("create", "database") => check(
            "database",
            result_param(cmd),
            "not-found",
            DATABASE_CHECK_TIMEOUT_SECS,
        ),
        ("create", "natgateway") => {
            check("natgateway", result_param(cmd), "deleted", CHECK_TIMEOUT_SECS)
        }
        ("attach", "volume") => check("volume", original(cmd, "id"), "available", CHECK_TIMEOUT_SECS),
        _ => return Vec::new(),
    };
    vec![checked]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn executed(text: &str, results: &[Option<&str>]) -> Template {
        let mut tpl = parse(text).unwrap();
        for (cmd, result) in tpl.command_nodes_mut().zip(results) {
            cmd.result = result.map(str::to_string);
        }
        tpl
    }

    #[test]
    fn instance_gets_a_termination_check_when_not_last() {
        let tpl = executed(
            "create subnet\ncreate instance type=t2.micro",
            &[Some("sub-12345"), Some("i-54321")],
        );
        assert_eq!(
            revert(&tpl).unwrap().to_string(),
            "delete instance id=i-54321\ncheck instance id=i-54321 state=terminated timeout=180\ndelete subnet id=sub-12345"
        );
    }

    #[test]
    fn securitygroup_waits_until_unused() {
        let tpl = executed("create securitygroup", &[Some("sg-54321")]);
        assert_eq!(
            revert(&tpl).unwrap().to_string(),
            "check securitygroup id=sg-54321 state=unused timeout=180\ndelete securitygroup id=sg-54321"
        );
    }

    #[test]
    fn eligibility() {
        let mut tpl = executed(
            "create vpc cidr=10.0.0.0/16\ncheck instance id=i-1 state=running timeout=10\ndetach routetable association=rtbassoc-1\nupdate subnet id=sub-1 public=true",
            &[Some("vpc-1"), Some("i-1"), None, None],
        );
        assert!(is_revertible(&tpl));
        let nodes: Vec<_> = tpl.command_nodes().collect();
        assert!(is_revertible_command(nodes[0]));
        assert!(!is_revertible_command(nodes[1]));
        assert!(!is_revertible_command(nodes[2]));
        assert!(!is_revertible_command(nodes[3]));

        tpl.command_nodes_mut().next().unwrap().error = Some("boom".into());
        assert!(!is_revertible(&tpl));
        assert!(!is_revertible(&executed("create subnet", &[None])));
    }

    #[test]
    fn parameter_picking() {
        let tpl = executed(
            "create database engine=postgres\nattach routetable id=rtb-1 subnet=sub-1\ncreate user name=bob\ncreate tag key=env resource=i-1 value=prod\ndelete record name=www ttl=60 type=A value=1.2.3.4 zone=Z1\ncreate bucket name=logs\nstop instance id=[i-1,i-2]",
            &[Some("db-1"), Some("rtbassoc-1"), Some("bob"), None, None, Some("logs"), Some("i-1")],
        );
        let reverted = revert(&tpl).unwrap().to_string();
        let lines: Vec<&str> = reverted.lines().collect();
        assert_eq!(
            lines,
            vec![
                "check instance id=i-1 state=stopped timeout=180",
                "check instance id=i-2 state=stopped timeout=180",
                "start instance id=[i-1,i-2]",
                "delete bucket name=logs",
                "create record name=www ttl=60 type=A value=1.2.3.4 zone=Z1",
                "delete tag key=env resource=i-1 value=prod",
                "delete user name=bob",
                "detach routetable association=rtbassoc-1",
                "delete database id=db-1 skipsnapshot=true",
            ]
        );
    }

    #[test]
    fn empty_when_nothing_to_undo() {
        let tpl = executed("delete subnet id=sub-1", &[None]);
        assert!(revert(&tpl).unwrap().statements.is_empty());
    }
}
