//! Resource graph.
//!
//! Resources are keyed by `(type, id)` and carry the provider payload as a
//! property map. Edges are labelled with a [`Relation`]. The whole graph sits
//! behind one mutex so fetch tasks can insert concurrently; reads hand back
//! owned copies.

use std::collections::{BTreeMap, BTreeSet};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Property holding a resource's human name.
pub const NAME_PROPERTY: &str = "Name";

/// A typed resource node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    /// Provider id.
    pub id: String,
    /// Resource type, e.g. `instance`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Provider fields.
    #[serde(default)]
    pub properties: BTreeMap<String, serde_json::Value>,
}

impl Resource {
    /// Resource without properties.
    pub fn new(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            properties: BTreeMap::new(),
        }
    }

    /// Builder-style property insertion.
    pub fn with_property(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.properties.insert(key.into(), value);
        self
    }

    /// `(type, id)`
    pub fn key(&self) -> ResourceKey {
        ResourceKey(self.kind.clone(), self.id.clone())
    }

    /// String property.
    pub fn property_str(&self, key: &str) -> Option<&str> {
        self.properties.get(key).and_then(serde_json::Value::as_str)
    }

    /// Human name, if any.
    pub fn name(&self) -> Option<&str> {
        self.property_str(NAME_PROPERTY)
    }
}

/// `(type, id)` identity of a resource.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceKey(pub String, pub String);

/// Edge labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Relation {
    /// Containment, e.g. vpc → subnet.
    ParentOf,
    /// Attachment, e.g. securitygroup → instance.
    AppliesOn,
    /// Usage, e.g. instance → keypair.
    DependsOn,
}

/// `from --relation--> to`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Edge {
    /// Source node.
    pub from: ResourceKey,
    /// Target node.
    pub to: ResourceKey,
    /// Label.
    pub relation: Relation,
}

#[derive(Debug, Clone, Default)]
struct GraphData {
    resources: BTreeMap<ResourceKey, Resource>,
    edges: BTreeSet<Edge>,
}

/// On-disk form: map keys must be strings, so nodes are a plain list.
#[derive(Serialize, Deserialize)]
struct GraphWire {
    #[serde(default)]
    resources: Vec<Resource>,
    #[serde(default)]
    edges: Vec<Edge>,
}

/// Thread-safe resource graph.
#[derive(Debug, Default)]
pub struct Graph {
    data: Mutex<GraphData>,
}

impl Clone for Graph {
    fn clone(&self) -> Self {
        Self {
            data: Mutex::new(self.data.lock().clone()),
        }
    }
}

impl Graph {
    /// Empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace resources.
    pub fn add_resources(&self, resources: impl IntoIterator<Item = Resource>) {
        let mut data = self.data.lock();
        for res in resources {
            data.resources.insert(res.key(), res);
        }
    }

    /// Insert or replace one resource.
    pub fn add_resource(&self, resource: Resource) {
        self.add_resources([resource]);
    }

    /// Merge every node and edge of `other`.
    pub fn add_graph(&self, other: &Graph) {
        let theirs = other.data.lock().clone();
        let mut data = self.data.lock();
        data.resources.extend(theirs.resources);
        data.edges.extend(theirs.edges);
    }

    /// Label `from → to`.
    pub fn add_relation(&self, from: &Resource, to: &Resource, relation: Relation) {
        self.data.lock().edges.insert(Edge {
            from: from.key(),
            to: to.key(),
            relation,
        });
    }

    /// `parent` contains `child`.
    pub fn add_parent_relation(&self, parent: &Resource, child: &Resource) {
        self.add_relation(parent, child, Relation::ParentOf);
    }

    /// `from` applies on `to`.
    pub fn add_applies_on_relation(&self, from: &Resource, to: &Resource) {
        self.add_relation(from, to, Relation::AppliesOn);
    }

    /// `from` depends on `to`.
    pub fn add_depends_on_relation(&self, from: &Resource, to: &Resource) {
        self.add_relation(from, to, Relation::DependsOn);
    }

    /// Resource by type and id.
    pub fn get_resource(&self, kind: &str, id: &str) -> Option<Resource> {
        self.data
            .lock()
            .resources
            .get(&ResourceKey(kind.to_string(), id.to_string()))
            .cloned()
    }

    /// First resource with `id`, whatever its type.
    pub fn find_resource(&self, id: &str) -> Option<Resource> {
        self.data
            .lock()
            .resources
            .values()
            .find(|r| r.id == id)
            .cloned()
    }

    /// Resources of the given types; every resource when `kinds` is empty.
    pub fn get_all_resources(&self, kinds: &[&str]) -> Vec<Resource> {
        self.data
            .lock()
            .resources
            .values()
            .filter(|r| kinds.is_empty() || kinds.contains(&r.kind.as_str()))
            .cloned()
            .collect()
    }

    /// Resources of `kind` whose `key` property equals `value`.
    pub fn find_resources_by_property(
        &self,
        kind: Option<&str>,
        key: &str,
        value: &serde_json::Value,
    ) -> Vec<Resource> {
        self.data
            .lock()
            .resources
            .values()
            .filter(|r| kind.is_none_or(|k| r.kind == k))
            .filter(|r| r.properties.get(key) == Some(value))
            .cloned()
            .collect()
    }

    fn targets(&self, from: &ResourceKey, relation: Relation) -> Vec<Resource> {
        let data = self.data.lock();
        data.edges
            .iter()
            .filter(|e| e.relation == relation && &e.from == from)
            .filter_map(|e| data.resources.get(&e.to).cloned())
            .collect()
    }

    fn sources(&self, to: &ResourceKey, relation: Relation) -> Vec<Resource> {
        let data = self.data.lock();
        data.edges
            .iter()
            .filter(|e| e.relation == relation && &e.to == to)
            .filter_map(|e| data.resources.get(&e.from).cloned())
            .collect()
    }

    /// Direct children.
    pub fn children_of(&self, res: &Resource) -> Vec<Resource> {
        self.targets(&res.key(), Relation::ParentOf)
    }

    /// Direct parent.
    pub fn parent_of(&self, res: &Resource) -> Option<Resource> {
        self.sources(&res.key(), Relation::ParentOf).into_iter().next()
    }

    /// Closest ancestor of type `kind`.
    pub fn find_ancestor(&self, res: &Resource, kind: &str) -> Option<Resource> {
        let mut seen = BTreeSet::new();
        let mut current = self.parent_of(res);
        while let Some(parent) = current {
            if parent.kind == kind {
                return Some(parent);
            }
            if !seen.insert(parent.key()) {
                return None;
            }
            current = self.parent_of(&parent);
        }
        None
    }

    /// Resources `res` applies on.
    pub fn list_resources_applied_on(&self, res: &Resource) -> Vec<Resource> {
        self.targets(&res.key(), Relation::AppliesOn)
    }

    /// Resources depending on `res`.
    pub fn list_resources_depending_on(&self, res: &Resource) -> Vec<Resource> {
        self.sources(&res.key(), Relation::DependsOn)
    }

    /// Every edge.
    pub fn edges(&self) -> Vec<Edge> {
        self.data.lock().edges.iter().cloned().collect()
    }

    /// Resource types present.
    pub fn resource_types(&self) -> BTreeSet<String> {
        self.data
            .lock()
            .resources
            .keys()
            .map(|k| k.0.clone())
            .collect()
    }

    /// Number of resources.
    pub fn len(&self) -> usize {
        self.data.lock().resources.len()
    }

    /// Whether the graph has no resource.
    pub fn is_empty(&self) -> bool {
        self.data.lock().resources.is_empty()
    }

    /// Resolve an alias used as param `key` of a command on `entity`.
    ///
    /// Keys naming an id (`id`, `instanceid`, ...) designate the command's own
    /// entity; other keys designate a resource type, singularised (`subnets`
    /// → `subnet`). The alias matches a resource name first, then an id.
    pub fn resolve_alias(&self, entity: &str, key: &str, alias: &str) -> Option<String> {
        let kind = alias_resource_type(entity, key);
        let data = self.data.lock();
        let of_kind = || data.resources.values().filter(|r| r.kind == kind);
        of_kind()
            .find(|r| r.name() == Some(alias))
            .or_else(|| of_kind().find(|r| r.id == alias))
            .map(|r| r.id.clone())
    }

    /// JSON form.
    pub fn to_json(&self) -> serde_json::Result<String> {
        let data = self.data.lock();
        serde_json::to_string(&GraphWire {
            resources: data.resources.values().cloned().collect(),
            edges: data.edges.iter().cloned().collect(),
        })
    }

    /// Graph from its JSON form.
    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        let wire: GraphWire = serde_json::from_str(text)?;
        let graph = Self::new();
        graph.add_resources(wire.resources);
        graph.data.lock().edges.extend(wire.edges);
        Ok(graph)
    }
}

/// Resource type a param key refers to.
pub fn alias_resource_type(entity: &str, key: &str) -> String {
    if key.contains("id") {
        return entity.to_string();
    }
    match key {
        "subnets" => "subnet".to_string(),
        "securitygroups" => "securitygroup".to_string(),
        "instances" => "instance".to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Graph {
        let g = Graph::new();
        let vpc = Resource::new("vpc", "vpc-1").with_property("Name", json!("main"));
        let sub = Resource::new("subnet", "sub-1").with_property("Name", json!("front"));
        let inst = Resource::new("instance", "i-1").with_property("Name", json!("web"));
        g.add_resources([vpc.clone(), sub.clone(), inst.clone()]);
        g.add_parent_relation(&vpc, &sub);
        g.add_parent_relation(&sub, &inst);
        g
    }

    #[test]
    fn ancestors_and_children() {
        let g = sample();
        let inst = g.get_resource("instance", "i-1").unwrap();
        assert_eq!(g.find_ancestor(&inst, "vpc").unwrap().id, "vpc-1");
        let vpc = g.get_resource("vpc", "vpc-1").unwrap();
        assert_eq!(g.children_of(&vpc).len(), 1);
        assert!(g.find_ancestor(&vpc, "subnet").is_none());
        assert_eq!(g.resource_types().len(), 3);
    }

    #[test]
    fn aliases_resolve_by_name_then_id() {
        let g = sample();
        assert_eq!(g.resolve_alias("subnet", "vpc", "main").as_deref(), Some("vpc-1"));
        assert_eq!(g.resolve_alias("loadbalancer", "subnets", "front").as_deref(), Some("sub-1"));
        assert_eq!(g.resolve_alias("instance", "id", "web").as_deref(), Some("i-1"));
        assert_eq!(g.resolve_alias("instance", "id", "i-1").as_deref(), Some("i-1"));
        assert!(g.resolve_alias("subnet", "vpc", "front").is_none());
    }

    #[test]
    fn json_round_trip_keeps_edges() {
        let g = sample();
        let back = Graph::from_json(&g.to_json().unwrap()).unwrap();
        assert_eq!(back.len(), 3);
        assert_eq!(back.edges(), g.edges());
        let found = back.find_resources_by_property(Some("instance"), "Name", &json!("web"));
        assert_eq!(found.len(), 1);
    }
}
