//! Multi-pass template compiler.
//!
//! Each pass takes ownership of a template and its [`CompileEnv`] and hands
//! back rewritten versions of both. [`compile`] never touches the caller's
//! template: it works on a clone. Within a pass every violation is collected
//! before failing; the first failing pass stops the pipeline.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tracing::{debug, trace};

use super::ast::{CommandNode, DeclarationNode, Expression, Statement, Template};
use super::env::{CompileEnv, EnvSlot, SuggestionMode};
use super::value::{Hole, ParamValue, Value};
use super::{Result, TemplateError};
use crate::command::Command;

/// A compiler pass.
pub type Pass = fn(Template, CompileEnv) -> Result<(Template, CompileEnv)>;

/// Which pipeline to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompileMode {
    /// Full pipeline, prompts included.
    #[default]
    Runner,
    /// Pipeline for templates rebuilt from an execution record: no prompt and
    /// no suggestion.
    Replay,
}

impl CompileMode {
    /// Named passes of the pipeline, in order.
    pub fn passes(self) -> Vec<(&'static str, Pass)> {
        let mut passes: Vec<(&'static str, Pass)> = vec![
            ("inject-commands", inject_commands),
            ("verify-params-expected", verify_params_expected),
            ("check-invalid-references", check_invalid_references),
            ("inline-variable-values", inline_variable_values),
            ("resolve-holes", resolve_holes),
            ("normalize-missing-required", normalize_missing_required_as_holes),
            ("resolve-aliases", resolve_aliases),
        ];
        if self == CompileMode::Runner {
            passes.push(("ask-missing-holes", ask_missing_holes));
            passes.push(("ask-suggested-params", ask_suggested_params));
        }
        passes.extend([
            ("resolve-aliases-again", resolve_aliases as Pass),
            ("inline-resolved-values", inline_variable_values as Pass),
            ("fail-on-unresolved", fail_on_unresolved as Pass),
            ("fail-on-declaration-with-no-result", fail_on_declaration_with_no_result as Pass),
            ("validate-params", validate_params as Pass),
        ]);
        passes
    }
}

/// Compile `template` with the pipeline of `mode`.
pub fn compile(template: &Template, env: CompileEnv, mode: CompileMode) -> Result<(Template, CompileEnv)> {
    compile_with(template, env, &mode.passes())
}

/// Compile `template` with an explicit list of passes.
pub fn compile_with(
    template: &Template,
    env: CompileEnv,
    passes: &[(&'static str, Pass)],
) -> Result<(Template, CompileEnv)> {
    let mut tpl = template.clone();
    let mut env = env;
    for (name, pass) in passes {
        debug!(pass = name, template = %tpl.id, "compile pass");
        (tpl, env) = pass(tpl, env)?;
        trace!(pass = name, "after pass:\n{}", tpl);
    }
    Ok((tpl, env))
}

fn command_of(node: &CommandNode) -> Result<Arc<Command>> {
    node.command
        .clone()
        .ok_or_else(|| TemplateError::UnknownCommand(node.key()))
}

fn keys_of(node: &CommandNode) -> BTreeSet<String> {
    node.params.keys().cloned().collect()
}

/// Attach the registered command object to every command node.
pub fn inject_commands(mut tpl: Template, env: CompileEnv) -> Result<(Template, CompileEnv)> {
    let mut errors = Vec::new();
    for node in tpl.command_nodes_mut() {
        match env.lookup_command(&[&node.action, &node.entity]) {
            Some(cmd) => node.command = Some(cmd),
            None => errors.push(TemplateError::UnknownCommand(node.key())),
        }
    }
    TemplateError::aggregate(errors)?;
    Ok((tpl, env))
}

/// Reject parameter keys the command specification does not mention.
pub fn verify_params_expected(tpl: Template, env: CompileEnv) -> Result<(Template, CompileEnv)> {
    let mut errors = Vec::new();
    for node in tpl.command_nodes() {
        let cmd = command_of(node)?;
        let unexpected = cmd.params_spec().unexpected(node.params.keys());
        if !unexpected.is_empty() {
            errors.push(TemplateError::UnexpectedParams {
                command: node.key(),
                keys: unexpected,
            });
        }
    }
    TemplateError::aggregate(errors)?;
    Ok((tpl, env))
}

/// Forbid forward, undefined, self and duplicate references.
pub fn check_invalid_references(tpl: Template, env: CompileEnv) -> Result<(Template, CompileEnv)> {
    let mut known: BTreeSet<&str> = BTreeSet::new();
    let mut errors = Vec::new();
    for st in &tpl.statements {
        for reference in st.references() {
            if !known.contains(reference) {
                errors.push(TemplateError::InvalidReference(format!(
                    "using reference '${}' but '{}' is undefined in template",
                    reference, reference
                )));
            }
        }
        if let Some(ident) = st.declared_ident() {
            if !known.insert(ident) {
                errors.push(TemplateError::InvalidReference(format!(
                    "cannot assign '{}': '{}' has already been assigned in template",
                    ident, ident
                )));
            }
        }
    }
    TemplateError::aggregate(errors)?;
    Ok((tpl, env))
}

/// Substitute value declarations into the statements referencing them.
///
/// A declaration is dropped once its value carries no hole, and no alias
/// unless the alias was substituted into a later statement. Declarations
/// still waiting on a hole stay so a later run of this pass can bind them.
/// Resolved values are recorded in [`EnvSlot::ResolvedVars`].
pub fn inline_variable_values(mut tpl: Template, mut env: CompileEnv) -> Result<(Template, CompileEnv)> {
    let mut dropped = vec![false; tpl.statements.len()];
    for i in 0..tpl.statements.len() {
        let (head, tail) = tpl.statements.split_at_mut(i + 1);
        let Statement::Declaration(DeclarationNode {
            ident,
            expr: Expression::Value(value),
        }) = &head[i]
        else {
            continue;
        };
        if let Some(resolved) = value.to_value() {
            env.push(EnvSlot::ResolvedVars, ident.clone(), resolved);
        }
        let mut substituted = false;
        for st in tail.iter_mut() {
            if st.references().contains(&ident.as_str()) {
                st.visit_values_mut(&mut |_, _, _, v| v.replace_reference(ident, value));
                substituted = true;
            }
        }
        if substituted {
            debug!(%ident, "inlined value declaration");
        }
        dropped[i] = value.holes().is_empty() && (substituted || value.aliases().is_empty());
    }
    let mut index = 0;
    tpl.statements.retain(|_| {
        let keep = !dropped[index];
        index += 1;
        keep
    });
    Ok((tpl, env))
}

fn fill_from(tpl: &mut Template, env: &mut CompileEnv, fillers: &BTreeMap<String, Value>) {
    if fillers.is_empty() {
        return;
    }
    let mut processed = BTreeMap::new();
    tpl.visit_values_mut(|_, _, _, v| processed.extend(v.fill_holes(fillers)));
    if !processed.is_empty() {
        debug!(keys = ?processed.keys().collect::<Vec<_>>(), "filled holes");
    }
    env.extend(EnvSlot::ProcessedFillers, processed.clone());
    env.extend(EnvSlot::ResolvedVars, processed);
}

/// Fill holes from [`EnvSlot::Fillers`].
pub fn resolve_holes(mut tpl: Template, mut env: CompileEnv) -> Result<(Template, CompileEnv)> {
    let fillers = env.fillers();
    fill_from(&mut tpl, &mut env, &fillers);
    Ok((tpl, env))
}

/// Turn missing required params into `{entity.key}` holes.
pub fn normalize_missing_required_as_holes(mut tpl: Template, env: CompileEnv) -> Result<(Template, CompileEnv)> {
    for node in tpl.command_nodes_mut() {
        let cmd = command_of(node)?;
        let spec = cmd.params_spec();
        let keys = spec.reduce_keys(&keys_of(node));
        if spec.rule().holds(&keys) {
            continue;
        }
        for missing in spec.missing(&keys) {
            let hole = format!("{}.{}", node.entity, missing);
            debug!(command = %node.key(), key = %missing, %hole, "missing required param");
            node.params.insert(missing, ParamValue::Hole(Hole::new(hole)));
        }
    }
    Ok((tpl, env))
}

/// Resolve aliases through the configured resolver; unresolved ones stay.
pub fn resolve_aliases(mut tpl: Template, env: CompileEnv) -> Result<(Template, CompileEnv)> {
    if !env.has_alias_resolver() {
        return Ok((tpl, env));
    }
    tpl.visit_values_mut(|_, entity, key, v| {
        if v.aliases().is_empty() {
            return;
        }
        v.resolve_aliases(&mut |alias| {
            let resolved = env.resolve_alias(entity, key, alias);
            match &resolved {
                Some(actual) => debug!(%alias, %actual, %key, "alias resolved"),
                None => debug!(%alias, %key, "alias unresolved"),
            }
            resolved
        });
    });
    Ok((tpl, env))
}

/// Prompt for every hole still open, then fill the answers.
///
/// Fillers are consulted first so values produced by earlier passes (e.g.
/// normalised required params) pick them up.
pub fn ask_missing_holes(mut tpl: Template, mut env: CompileEnv) -> Result<(Template, CompileEnv)> {
    let fillers = env.fillers();
    fill_from(&mut tpl, &mut env, &fillers);
    let mut answers = BTreeMap::new();
    for (key, (paths, optional)) in tpl.holes() {
        if let Some(answer) = env.ask_missing_hole(&key, &paths, optional) {
            answers.insert(key, answer);
        }
    }
    fill_from(&mut tpl, &mut env, &answers);
    let missing: BTreeMap<String, Value> = tpl
        .holes()
        .into_iter()
        .map(|(key, (paths, _))| {
            let paths = paths.into_iter().map(Value::String).collect();
            (key, Value::List(paths))
        })
        .collect();
    env.set(EnvSlot::MissingHoles, missing);
    Ok((tpl, env))
}

/// Offer optional params according to the suggestion mode.
///
/// A filler named `entity.key` answers without prompting.
pub fn ask_suggested_params(mut tpl: Template, mut env: CompileEnv) -> Result<(Template, CompileEnv)> {
    let mode = env.suggestion_mode();
    if mode == SuggestionMode::None {
        return Ok((tpl, env));
    }
    let fillers = env.fillers();
    let mut processed = BTreeMap::new();
    for node in tpl.command_nodes_mut() {
        let cmd = command_of(node)?;
        let spec = cmd.params_spec();
        let keys = spec.reduce_keys(&keys_of(node));
        for key in spec.suggested(&keys, mode) {
            if node.params.contains_key(&key) {
                continue;
            }
            let hole = format!("{}.{}", node.entity, key);
            let answer = match fillers.get(&hole) {
                Some(v) => {
                    processed.insert(hole.clone(), v.clone());
                    Some(v.clone())
                }
                None => {
                    let path = format!("{}.{}.{}", node.action, node.entity, key);
                    env.ask_missing_hole(&hole, &[path], true)
                }
            };
            if let Some(value) = answer {
                debug!(command = %node.key(), %key, "suggested param answered");
                node.params.insert(key, ParamValue::from_value(value));
            }
        }
    }
    env.extend(EnvSlot::ProcessedFillers, processed);
    Ok((tpl, env))
}

/// Fail when holes or aliases remain.
pub fn fail_on_unresolved(tpl: Template, env: CompileEnv) -> Result<(Template, CompileEnv)> {
    let mut errors = Vec::new();
    let holes: Vec<String> = tpl.holes().into_keys().collect();
    if !holes.is_empty() {
        errors.push(TemplateError::UnresolvedHoles(holes));
    }
    let aliases: BTreeSet<String> = tpl.aliases().into_iter().collect();
    if !aliases.is_empty() {
        errors.push(TemplateError::UnresolvedAliases(aliases.into_iter().collect()));
    }
    TemplateError::aggregate(errors)?;
    Ok((tpl, env))
}

/// Declarations may only bind commands that extract a result.
pub fn fail_on_declaration_with_no_result(tpl: Template, env: CompileEnv) -> Result<(Template, CompileEnv)> {
    let mut errors = Vec::new();
    for decl in tpl.declarations() {
        if let Expression::Command(node) = &decl.expr {
            if !command_of(node)?.extracts_result() {
                errors.push(TemplateError::CannotAssign {
                    ident: decl.ident.clone(),
                    command: node.key(),
                });
            }
        }
    }
    TemplateError::aggregate(errors)?;
    Ok((tpl, env))
}

/// Run every specification validator on the resolved params.
pub fn validate_params(tpl: Template, env: CompileEnv) -> Result<(Template, CompileEnv)> {
    let mut errors = Vec::new();
    for node in tpl.command_nodes() {
        let cmd = command_of(node)?;
        let validation = cmd
            .params_spec()
            .validate(&keys_of(node), &node.resolved_params());
        if !validation.missing.is_empty() {
            errors.push(TemplateError::MissingRequired {
                command: node.key(),
                keys: validation.missing,
            });
        }
        for message in validation.conflicts.into_iter().chain(validation.type_errors) {
            errors.push(TemplateError::InvalidParam {
                command: node.key(),
                message,
            });
        }
    }
    TemplateError::aggregate(errors)?;
    Ok((tpl, env))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::parser::parse;

    fn run(passes: &[(&'static str, Pass)], text: &str, env: CompileEnv) -> Result<(Template, CompileEnv)> {
        compile_with(&parse(text).unwrap(), env, passes)
    }

    #[test]
    fn unknown_commands_are_aggregated() {
        let env = CompileEnv::builder().lookup(|_| None).build();
        let err = run(&[("inject", inject_commands)], "create vpc\ndelete vpc", env).unwrap_err();
        assert_eq!(err.to_string(), "unknown command 'create vpc'\nunknown command 'delete vpc'");
    }

    #[test]
    fn invalid_references() {
        let cases = [
            ("sub = create subnet\ninst = create instance subnet=$sub\nip = 127.0.0.1\ncreate instance subnet=$inst ip=$ip", None),
            ("sub = create subnet\ninst = create instance subnet=$sub\ninst = create instance", Some("'inst' has already been assigned in template")),
            ("sub = create subnet\ncreate instance subnet=$inst_2", Some("'inst_2' is undefined in template")),
            ("create instance subnet=$sub\nsub = create subnet", Some("'sub' is undefined in template")),
            ("new_inst = create instance autoref=$new_inst", Some("'new_inst' is undefined in template")),
            ("a = $test", Some("'test' is undefined in template")),
            ("b = [test1,$test2,{test4}]", Some("'test2' is undefined in template")),
        ];
        for (text, expected) in cases {
            let res = run(&[("refs", check_invalid_references)], text, CompileEnv::default());
            match expected {
                None => assert!(res.is_ok(), "{}", text),
                Some(msg) => assert!(res.unwrap_err().to_string().contains(msg), "{}", text),
            }
        }
    }

    #[test]
    fn inlines_and_drops_resolved_values() {
        let (tpl, env) = run(
            &[("inline", inline_variable_values)],
            "ip = 127.0.0.1\nunused = hello\ncreate instance ip=$ip name=$ip+-x",
            CompileEnv::default(),
        )
        .unwrap();
        assert_eq!(tpl.to_string(), "create instance ip=127.0.0.1 name=127.0.0.1-x");
        assert_eq!(env.resolved_vars()["ip"], Value::from("127.0.0.1"));
        assert_eq!(env.resolved_vars()["unused"], Value::from("hello"));
    }

    #[test]
    fn declarations_with_holes_wait_for_their_fillers() {
        let text = "size = {instance.size}\nlonely = @vpc\ncreate instance type=$size";
        let (tpl, env) = run(&[("inline", inline_variable_values)], text, CompileEnv::default()).unwrap();
        assert_eq!(
            tpl.to_string(),
            "size = {instance.size}\nlonely = @vpc\ncreate instance type={instance.size}"
        );
        assert!(!env.resolved_vars().contains_key("size"));

        let env = CompileEnv::builder()
            .fillers(BTreeMap::from([("instance.size".to_string(), Value::from("t2.nano"))]))
            .build();
        let (tpl, env) = run(
            &[
                ("inline", inline_variable_values as Pass),
                ("holes", resolve_holes as Pass),
                ("inline-again", inline_variable_values as Pass),
            ],
            text,
            env,
        )
        .unwrap();
        assert_eq!(tpl.to_string(), "lonely = @vpc\ncreate instance type=t2.nano");
        assert_eq!(env.resolved_vars()["size"], Value::from("t2.nano"));
    }

    #[test]
    fn unresolved_holes_and_aliases_are_sorted() {
        let err = run(
            &[("fail", fail_on_unresolved)],
            "create subnet name={subnet.name} vpc=@zvpc\ncreate instance name={instance.name} subnet=@asub",
            CompileEnv::default(),
        )
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "template contains unresolved holes: [instance.name, subnet.name]\n\
             template contains unresolved alias: [asub, zvpc]"
        );
    }

    #[test]
    fn prompts_once_per_hole_with_paths() {
        use parking_lot::Mutex;
        let asked = Arc::new(Mutex::new(Vec::new()));
        let log = asked.clone();
        let env = CompileEnv::builder()
            .missing_holes(move |key, paths, optional| {
                log.lock().push((key.to_string(), paths.to_vec(), optional));
                (key == "name").then(|| Value::from("answered"))
            })
            .build();
        let (tpl, env) = run(
            &[("ask", ask_missing_holes)],
            "create instance name={name} type={name}\ncreate subnet name={name} vpc={vpc}",
            env,
        )
        .unwrap();
        assert_eq!(
            tpl.to_string(),
            "create instance name=answered type=answered\ncreate subnet name=answered vpc={vpc}"
        );
        let asked = asked.lock();
        assert_eq!(asked.len(), 2);
        assert_eq!(asked[0].0, "name");
        assert_eq!(asked[0].1.len(), 3);
        assert!(env.get(EnvSlot::MissingHoles).contains_key("vpc"));
        assert_eq!(env.processed_fillers()["name"], Value::from("answered"));
    }

    #[test]
    fn suggestions_follow_mode() {
        let env = |mode| {
            CompileEnv::builder()
                .suggestion(mode)
                .missing_holes(|key, _, optional| {
                    assert!(optional);
                    Some(Value::from(format!("{}-answer", key)))
                })
                .build()
        };
        let text = "create instance image=ami-1 count=1 type=t2.micro name=x subnet=s";
        let passes: &[(&'static str, Pass)] = &[("inject", inject_commands), ("suggest", ask_suggested_params)];

        let (tpl, _) = run(passes, text, env(SuggestionMode::None)).unwrap();
        assert_eq!(tpl.command_nodes().next().unwrap().params.len(), 5);

        let (tpl, _) = run(passes, text, env(SuggestionMode::RequiredOnly)).unwrap();
        let keys = tpl.command_nodes().next().unwrap().keys();
        assert!(keys.contains(&"keypair".to_string()));
        assert!(keys.contains(&"securitygroup".to_string()));
        assert!(!keys.contains(&"ip".to_string()));

        let (tpl, _) = run(passes, text, env(SuggestionMode::AllSuggested)).unwrap();
        let node = tpl.command_nodes().next().unwrap();
        assert!(node.params.contains_key("ip"));
        assert_eq!(node.params["lock"], ParamValue::string("instance.lock-answer"));
    }

    #[test]
    fn replay_mode_skips_prompts() {
        let names: Vec<&str> = CompileMode::Replay.passes().iter().map(|(n, _)| *n).collect();
        assert!(!names.contains(&"ask-missing-holes"));
        assert!(!names.contains(&"ask-suggested-params"));
        assert_eq!(CompileMode::Runner.passes().len(), names.len() + 2);
    }
}
