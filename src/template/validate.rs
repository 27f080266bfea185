//! Advisory checks run on compiled templates.
//!
//! Validators never block a run; they return warnings the caller shows
//! before asking for confirmation.

use std::sync::Arc;

use super::ast::Template;
use crate::graph::Graph;

/// Inspects a compiled template and reports warnings.
pub trait TemplateValidator: Send + Sync {
    /// Warnings for `template`, empty when everything looks fine.
    fn validate(&self, template: &Template) -> Vec<String>;
}

/// Finds the local graph holding resources of an entity.
pub type GraphLookup = Arc<dyn Fn(&str) -> Option<Arc<Graph>> + Send + Sync>;

/// Warns when a `create` reuses the name of an existing resource.
pub struct UniqueNameValidator {
    lookup: GraphLookup,
}

impl UniqueNameValidator {
    /// Validator reading graphs through `lookup`.
    pub fn new(lookup: impl Fn(&str) -> Option<Arc<Graph>> + Send + Sync + 'static) -> Self {
        Self {
            lookup: Arc::new(lookup),
        }
    }
}

impl TemplateValidator for UniqueNameValidator {
    fn validate(&self, template: &Template) -> Vec<String> {
        let mut warnings = Vec::new();
        for cmd in template.command_nodes().filter(|c| c.action == "create") {
            let Some(name) = cmd.params.get("name").and_then(|v| v.to_value()) else {
                continue;
            };
            let Some(name) = name.as_str() else {
                continue;
            };
            let Some(graph) = (self.lookup)(&cmd.entity) else {
                continue;
            };
            for existing in graph.get_all_resources(&[&cmd.entity]) {
                if existing.name() == Some(name) {
                    warnings.push(format!(
                        "{}: a {} named '{}' already exists ({})",
                        cmd.key(),
                        cmd.entity,
                        name,
                        existing.id
                    ));
                }
            }
        }
        warnings
    }
}

/// Warns when commands of one kind omit a param.
#[derive(Debug, Clone)]
pub struct ParamIsSetValidator {
    /// Action to inspect.
    pub action: String,
    /// Entity to inspect.
    pub entity: String,
    /// Param expected to be present.
    pub param: String,
    /// Message shown when it is not.
    pub warning: String,
}

impl ParamIsSetValidator {
    /// Validator for `action entity` missing `param`.
    pub fn new(action: &str, entity: &str, param: &str, warning: &str) -> Self {
        Self {
            action: action.to_string(),
            entity: entity.to_string(),
            param: param.to_string(),
            warning: warning.to_string(),
        }
    }
}

impl TemplateValidator for ParamIsSetValidator {
    fn validate(&self, template: &Template) -> Vec<String> {
        template
            .command_nodes()
            .filter(|c| c.action == self.action && c.entity == self.entity)
            .filter(|c| !c.params.contains_key(&self.param))
            .map(|_| self.warning.clone())
            .collect()
    }
}

/// Validators used by the CLI runner.
pub fn default_validators(lookup: GraphLookup) -> Vec<Box<dyn TemplateValidator>> {
    vec![
        Box::new(UniqueNameValidator { lookup }),
        Box::new(ParamIsSetValidator::new(
            "create",
            "instance",
            "keypair",
            "This instance has no access keypair. You might not be able to connect to it. Use `create instance keypair=my-keypair ...`",
        )),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Resource;
    use crate::template::parser::parse;
    use serde_json::json;

    #[test]
    fn unique_names() {
        let graph = Arc::new(Graph::new());
        graph.add_resource(Resource::new("subnet", "sub-1").with_property("Name", json!("front")));
        let validator = UniqueNameValidator::new(move |_| Some(graph.clone()));
        let tpl = parse("create subnet name=front cidr=10.0.0.0/24\ncreate subnet name=back\ndelete subnet id=front").unwrap();
        let warnings = validator.validate(&tpl);
        assert_eq!(warnings, vec!["create subnet: a subnet named 'front' already exists (sub-1)"]);
    }

    #[test]
    fn param_is_set() {
        let graph_less: GraphLookup = Arc::new(|_| None);
        let validators = default_validators(graph_less);
        let tpl = parse("create instance name=a\ncreate instance name=b keypair=k").unwrap();
        let warnings: Vec<String> = validators.iter().flat_map(|v| v.validate(&tpl)).collect();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("no access keypair"));
    }
}
