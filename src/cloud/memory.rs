//! A provider simulated in memory.
//!
//! Methods are dispatched on their verb prefix (`Create`, `Describe`,
//! `Terminate`, ...) and on the noun that follows it, which selects a resource
//! kind within the called api. Resources are plain JSON objects carrying at
//! least an `Id` field. The whole state serializes so the CLI can keep it
//! between invocations.

use std::collections::{BTreeMap, BTreeSet};

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json, json};
use tracing::debug;
use uuid::Uuid;

use super::{ControlPlane, DRY_RUN_OPERATION, ProviderError};

const DEFAULT_PAGE_SIZE: usize = 1000;
const ACCOUNT: &str = "000000000000";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verb {
    Create,
    Delete,
    List,
    Update,
    Start,
    Stop,
    Attach,
    Detach,
    Copy,
    Change,
}

const VERBS: &[(&str, Verb)] = &[
    ("Create", Verb::Create),
    ("Run", Verb::Create),
    ("Allocate", Verb::Create),
    ("Put", Verb::Create),
    ("Import", Verb::Create),
    ("Delete", Verb::Delete),
    ("Terminate", Verb::Delete),
    ("Release", Verb::Delete),
    ("Deregister", Verb::Delete),
    ("Describe", Verb::List),
    ("List", Verb::List),
    ("Get", Verb::List),
    ("Modify", Verb::Update),
    ("Update", Verb::Update),
    ("Start", Verb::Start),
    ("Enable", Verb::Start),
    ("Stop", Verb::Stop),
    ("Disable", Verb::Stop),
    ("Attach", Verb::Attach),
    ("Associate", Verb::Attach),
    ("Detach", Verb::Detach),
    ("Disassociate", Verb::Detach),
    ("Copy", Verb::Copy),
    ("Change", Verb::Change),
];

#[derive(Debug, Clone, Copy)]
enum IdStyle {
    /// `<prefix>-<8 hex>`
    Prefix(&'static str),
    /// Taken from an input field.
    Name(&'static str),
    /// `arn:aws:<api>:<region>:<account>:<entity>/<name or hex>`
    Arn,
    /// Input fields joined with `:`.
    Composite(&'static [&'static str]),
}

#[derive(Debug, Clone)]
struct Kind {
    api: &'static str,
    nouns: &'static [&'static str],
    entity: &'static str,
    id: IdStyle,
    initial: Option<&'static str>,
    stopped: Option<&'static str>,
    deleted: Option<&'static str>,
}

impl Kind {
    fn new(
        api: &'static str,
        nouns: &'static [&'static str],
        entity: &'static str,
        id: IdStyle,
    ) -> Self {
        Self {
            api,
            nouns,
            entity,
            id,
            initial: None,
            stopped: None,
            deleted: None,
        }
    }

    fn states(mut self, initial: &'static str, stopped: Option<&'static str>) -> Self {
        self.initial = Some(initial);
        self.stopped = stopped;
        self
    }

    fn soft_delete(mut self, state: &'static str) -> Self {
        self.deleted = Some(state);
        self
    }
}

static KINDS: Lazy<Vec<Kind>> = Lazy::new(|| {
    use IdStyle::*;
    vec![
        Kind::new("ec2", &["Vpc"], "vpc", Prefix("vpc")).states("available", None),
        Kind::new("ec2", &["Subnet", "SubnetAttribute"], "subnet", Prefix("subnet"))
            .states("available", None),
        Kind::new("ec2", &["Instance", "InstanceAttribute"], "instance", Prefix("i"))
            .states("running", Some("stopped"))
            .soft_delete("terminated"),
        Kind::new("ec2", &["SecurityGroup"], "securitygroup", Prefix("sg")),
        Kind::new("ec2", &["InternetGateway"], "internetgateway", Prefix("igw"))
            .states("available", None),
        Kind::new("ec2", &["RouteTable"], "routetable", Prefix("rtb")),
        Kind::new("ec2", &["KeyPair"], "keypair", Name("KeyName")),
        Kind::new("ec2", &["Volume"], "volume", Prefix("vol")).states("available", None),
        Kind::new("ec2", &["Address"], "elasticip", Prefix("eipalloc")),
        Kind::new("ec2", &["NatGateway"], "natgateway", Prefix("nat"))
            .states("available", None),
        Kind::new("ec2", &["Image"], "image", Prefix("ami")).states("available", None),
        Kind::new("ec2", &["Snapshot"], "snapshot", Prefix("snap")).states("completed", None),
        Kind::new("ec2", &["Tags", "Tag"], "tag", Composite(&["Resource", "Key"])),
        Kind::new("elbv2", &["LoadBalancer"], "loadbalancer", Arn).states("active", None),
        Kind::new("elbv2", &["TargetGroup"], "targetgroup", Arn),
        Kind::new("elbv2", &["Listener"], "listener", Arn),
        Kind::new("rds", &["DBInstance"], "database", Name("DBInstanceIdentifier"))
            .states("available", Some("stopped")),
        Kind::new("rds", &["DBSubnetGroup"], "dbsubnetgroup", Name("DBSubnetGroupName")),
        Kind::new(
            "autoscaling",
            &["LaunchConfiguration"],
            "launchconfiguration",
            Name("LaunchConfigurationName"),
        ),
        Kind::new(
            "autoscaling",
            &["AutoScalingGroup"],
            "scalinggroup",
            Name("AutoScalingGroupName"),
        ),
        Kind::new("autoscaling", &["ScalingPolicy", "Policy"], "scalingpolicy", Arn),
        Kind::new("iam", &["User"], "user", Name("UserName")),
        Kind::new("iam", &["Group"], "group", Name("GroupName")),
        Kind::new("iam", &["Role"], "role", Name("RoleName")),
        Kind::new(
            "iam",
            &["Policy", "UserPolicy", "RolePolicy", "GroupPolicy"],
            "policy",
            Arn,
        ),
        Kind::new("iam", &["AccessKey"], "accesskey", Prefix("AKIA")),
        Kind::new(
            "iam",
            &["InstanceProfile"],
            "instanceprofile",
            Name("InstanceProfileName"),
        ),
        Kind::new("s3", &["Bucket"], "bucket", Name("Bucket")),
        Kind::new("s3", &["Object"], "s3object", Name("Key")),
        Kind::new("route53", &["HostedZone"], "zone", Prefix("Z")),
        Kind::new(
            "route53",
            &["ResourceRecordSets", "ResourceRecordSet"],
            "record",
            Composite(&["Zone", "Name", "Type"]),
        ),
        Kind::new("sns", &["Topic"], "topic", Arn),
        Kind::new("sns", &["Subscription"], "subscription", Arn),
        Kind::new("sqs", &["Queue"], "queue", Name("QueueName")),
        Kind::new("lambda", &["Function"], "function", Arn),
        Kind::new(
            "cloudwatch",
            &["MetricAlarm", "Alarm", "AlarmActions"],
            "alarm",
            Name("AlarmName"),
        )
        .states("enabled", Some("disabled")),
    ]
});

/// Resolve a method into its verb and resource kind.
fn route(api: &str, method: &str) -> Option<(Verb, &'static Kind)> {
    let (verb, noun) = match method {
        "Subscribe" => (Verb::Create, "Subscription"),
        "Unsubscribe" => (Verb::Delete, "Subscription"),
        _ => {
            let (prefix, verb) = VERBS.iter().find(|(p, _)| method.starts_with(p))?;
            (*verb, &method[prefix.len()..])
        }
    };
    let mut candidates = vec![noun.to_string()];
    if let Some(s) = noun.strip_suffix("ies") {
        candidates.push(format!("{}y", s));
    }
    if let Some(s) = noun.strip_suffix("es") {
        candidates.push(s.to_string());
    }
    if let Some(s) = noun.strip_suffix('s') {
        candidates.push(s.to_string());
    }
    KINDS
        .iter()
        .filter(|k| k.api == api)
        .find(|k| candidates.iter().any(|c| k.nouns.contains(&c.as_str())))
        .map(|k| (verb, k))
}

/// Serializable state of a [`MemoryCloud`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CloudState {
    /// Objects per entity, keyed by id.
    #[serde(default)]
    pub resources: BTreeMap<String, BTreeMap<String, Json>>,
    /// Apis answering with access denied.
    #[serde(default)]
    pub denied: BTreeSet<String>,
}

/// In-memory [`ControlPlane`].
#[derive(Debug)]
pub struct MemoryCloud {
    region: String,
    profile: String,
    state: Mutex<CloudState>,
    calls: Mutex<Vec<String>>,
}

impl MemoryCloud {
    /// Empty cloud in `region`.
    pub fn new(region: impl Into<String>) -> Self {
        Self::from_state(region, CloudState::default())
    }

    /// Cloud restored from a previous state.
    pub fn from_state(region: impl Into<String>, state: CloudState) -> Self {
        Self {
            region: region.into(),
            profile: "default".to_string(),
            state: Mutex::new(state),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Builder-style profile name.
    pub fn with_profile(mut self, profile: impl Into<String>) -> Self {
        self.profile = profile.into();
        self
    }

    /// Copy of the current state.
    pub fn snapshot(&self) -> CloudState {
        self.state.lock().clone()
    }

    /// Make every call to `api` fail with access denied.
    pub fn deny_api(&self, api: &str) {
        self.state.lock().denied.insert(api.to_string());
    }

    /// Undo [`MemoryCloud::deny_api`].
    pub fn allow_api(&self, api: &str) {
        self.state.lock().denied.remove(api);
    }

    /// Insert a raw object; an `Id` is generated when absent.
    pub fn insert(&self, entity: &str, object: Json) -> String {
        let mut object = match object {
            Json::Object(map) => map,
            _ => Map::new(),
        };
        let id = match object.get("Id").and_then(Json::as_str) {
            Some(id) => id.to_string(),
            None => {
                let id = format!("{}-{}", entity, short_hex());
                object.insert("Id".into(), Json::from(id.clone()));
                id
            }
        };
        self.state
            .lock()
            .resources
            .entry(entity.to_string())
            .or_default()
            .insert(id.clone(), Json::Object(object));
        id
    }

    /// Objects of one entity, with derived fields.
    pub fn objects(&self, entity: &str) -> Vec<Json> {
        let state = self.state.lock();
        state
            .resources
            .get(entity)
            .map(|objs| {
                objs.values()
                    .map(|o| with_derived_fields(&state, entity, o))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Object by id.
    pub fn object(&self, entity: &str, id: &str) -> Option<Json> {
        let state = self.state.lock();
        let obj = state.resources.get(entity)?.get(id)?;
        Some(with_derived_fields(&state, entity, obj))
    }

    /// Methods called so far, as `api:method`.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    fn create(&self, kind: &Kind, input: &Map<String, Json>) -> Result<Json, ProviderError> {
        let mut state = self.state.lock();
        let id = self.new_id(kind, input)?;
        let objects = state.resources.entry(kind.entity.to_string()).or_default();
        if objects.contains_key(&id) {
            return Err(ProviderError::new(
                "EntityAlreadyExists",
                format!("{} '{}' already exists", kind.entity, id),
            ));
        }
        let mut object = input.clone();
        object.insert("Id".into(), Json::from(id.clone()));
        if matches!(kind.id, IdStyle::Arn) {
            object.insert("Arn".into(), Json::from(id.clone()));
        }
        if let Some(initial) = kind.initial {
            object.insert("State".into(), Json::from(initial));
        }
        let object = Json::Object(object);
        objects.insert(id.clone(), object.clone());
        debug!(entity = kind.entity, id = %id, "created");
        Ok(object)
    }

    fn new_id(&self, kind: &Kind, input: &Map<String, Json>) -> Result<String, ProviderError> {
        match kind.id {
            IdStyle::Prefix(prefix) => Ok(format!("{}-{}", prefix, short_hex())),
            IdStyle::Name(field) => input
                .get(field)
                .and_then(Json::as_str)
                .map(str::to_string)
                .ok_or_else(|| {
                    ProviderError::new("ValidationError", format!("missing required field {}", field))
                }),
            IdStyle::Arn => {
                let name = input
                    .get("Name")
                    .and_then(Json::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(short_hex);
                Ok(format!(
                    "arn:aws:{}:{}:{}:{}/{}",
                    kind.api, self.region, ACCOUNT, kind.entity, name
                ))
            }
            IdStyle::Composite(fields) => {
                let parts: Option<Vec<String>> = fields
                    .iter()
                    .map(|f| input.get(*f).map(json_text))
                    .collect();
                parts.map(|p| p.join(":")).ok_or_else(|| {
                    ProviderError::new(
                        "ValidationError",
                        format!("missing one of required fields {}", fields.join(", ")),
                    )
                })
            }
        }
    }

    fn targets(&self, state: &CloudState, kind: &Kind, input: &Map<String, Json>) -> Vec<String> {
        let Some(objects) = state.resources.get(kind.entity) else {
            return Vec::new();
        };
        let mut found: Vec<String> = input
            .values()
            .flat_map(strings_of)
            .filter(|s| objects.contains_key(s))
            .collect();
        if found.is_empty() {
            if let IdStyle::Composite(_) = kind.id {
                if let Ok(id) = self.new_id(kind, input) {
                    if objects.contains_key(&id) {
                        found.push(id);
                    }
                }
            }
        }
        if let Some(deleted) = kind.deleted {
            found.retain(|id| {
                objects.get(id).and_then(|o| o.get("State")).and_then(Json::as_str)
                    != Some(deleted)
            });
        }
        found.dedup();
        found
    }

    fn not_found(kind: &Kind, method: &str) -> ProviderError {
        ProviderError::new(
            format!("{}.NotFound", kind.nouns[0]),
            format!("{}: no such {}", method, kind.entity),
        )
    }

    fn apply(
        &self,
        verb: Verb,
        kind: &Kind,
        method: &str,
        input: &Map<String, Json>,
    ) -> Result<Json, ProviderError> {
        match verb {
            Verb::Create => self.create(kind, input),
            Verb::Change => {
                let action = input.get("Action").and_then(Json::as_str).unwrap_or("CREATE");
                let mut fields = input.clone();
                fields.remove("Action");
                if action.eq_ignore_ascii_case("DELETE") {
                    self.apply(Verb::Delete, kind, method, &fields)
                } else {
                    self.create(kind, &fields)
                }
            }
            Verb::List => Ok(self.list(kind, input)),
            Verb::Delete => {
                let mut state = self.state.lock();
                let ids = self.targets(&state, kind, input);
                if ids.is_empty() {
                    return Err(Self::not_found(kind, method));
                }
                if kind.entity == "securitygroup" {
                    if let Some(id) = ids.iter().find(|id| is_referenced(&state, id)) {
                        return Err(ProviderError::new(
                            "DependencyViolation",
                            format!("resource {} has a dependent object", id),
                        ));
                    }
                }
                let objects = state.resources.entry(kind.entity.to_string()).or_default();
                for id in &ids {
                    match kind.deleted {
                        Some(deleted) => {
                            if let Some(Json::Object(o)) = objects.get_mut(id) {
                                o.insert("State".into(), Json::from(deleted));
                            }
                        }
                        None => {
                            objects.remove(id);
                        }
                    }
                }
                debug!(entity = kind.entity, ids = ?ids, "deleted");
                Ok(json!({ "Ids": ids }))
            }
            Verb::Start | Verb::Stop => {
                let mut state = self.state.lock();
                let ids = self.targets(&state, kind, input);
                if ids.is_empty() {
                    return Err(Self::not_found(kind, method));
                }
                let target_state = if verb == Verb::Start {
                    kind.initial
                } else {
                    kind.stopped
                };
                let objects = state.resources.entry(kind.entity.to_string()).or_default();
                for id in &ids {
                    if let (Some(Json::Object(o)), Some(s)) = (objects.get_mut(id), target_state) {
                        o.insert("State".into(), Json::from(s));
                    }
                }
                Ok(json!({ "Ids": ids }))
            }
            Verb::Update => {
                let mut state = self.state.lock();
                let ids = self.targets(&state, kind, input);
                let Some(id) = ids.first() else {
                    return Err(Self::not_found(kind, method));
                };
                let objects = state.resources.entry(kind.entity.to_string()).or_default();
                if let Some(Json::Object(o)) = objects.get_mut(id) {
                    for (k, v) in input {
                        if strings_of(v).iter().any(|s| s == id) {
                            continue;
                        }
                        o.insert(k.clone(), v.clone());
                    }
                }
                Ok(json!({ "Id": id }))
            }
            Verb::Attach => self.attach(kind, method, input),
            Verb::Detach => self.detach(kind, method, input),
            Verb::Copy => {
                let source = {
                    let state = self.state.lock();
                    let ids = self.targets(&state, kind, input);
                    ids.first().and_then(|id| {
                        state
                            .resources
                            .get(kind.entity)
                            .and_then(|objs| objs.get(id))
                            .cloned()
                    })
                };
                let Some(Json::Object(mut fields)) = source else {
                    return Err(Self::not_found(kind, method));
                };
                fields.remove("Id");
                fields.extend(input.clone());
                self.create(kind, &fields)
            }
        }
    }

    fn list(&self, kind: &Kind, input: &Map<String, Json>) -> Json {
        let state = self.state.lock();
        let wanted: Option<BTreeSet<String>> = input
            .get("Ids")
            .map(|ids| strings_of(ids).into_iter().collect());
        let all: Vec<Json> = state
            .resources
            .get(kind.entity)
            .map(|objs| {
                objs.iter()
                    .filter(|(id, _)| wanted.as_ref().is_none_or(|w| w.contains(*id)))
                    .filter(|(_, o)| matches_filters(o, input.get("Filters")))
                    .map(|(_, o)| with_derived_fields(&state, kind.entity, o))
                    .collect()
            })
            .unwrap_or_default();
        let offset = input
            .get("NextToken")
            .and_then(Json::as_str)
            .and_then(|t| t.parse::<usize>().ok())
            .unwrap_or(0);
        let size = input
            .get("MaxResults")
            .and_then(Json::as_u64)
            .map(|n| n.max(1) as usize)
            .unwrap_or(DEFAULT_PAGE_SIZE);
        let page: Vec<Json> = all.iter().skip(offset).take(size).cloned().collect();
        let next = offset + page.len();
        let mut out = Map::new();
        out.insert("Items".into(), Json::Array(page));
        if next < all.len() {
            out.insert("NextToken".into(), Json::from(next.to_string()));
        }
        Json::Object(out)
    }

    fn attach(&self, kind: &Kind, method: &str, input: &Map<String, Json>) -> Result<Json, ProviderError> {
        let mut state = self.state.lock();
        let ids = self.targets(&state, kind, input);
        let Some(id) = ids.first().cloned() else {
            return Err(Self::not_found(kind, method));
        };
        let others: Vec<String> = input
            .values()
            .flat_map(strings_of)
            .filter(|s| *s != id)
            .collect();
        let objects = state.resources.entry(kind.entity.to_string()).or_default();
        let Some(Json::Object(object)) = objects.get_mut(&id) else {
            return Err(Self::not_found(kind, method));
        };
        match kind.entity {
            "routetable" => {
                let assoc = format!("rtbassoc-{}", short_hex());
                let associations = object
                    .entry("Associations")
                    .or_insert_with(|| Json::Object(Map::new()));
                if let Json::Object(map) = associations {
                    map.insert(assoc.clone(), Json::from(others.join(",")));
                }
                Ok(json!({ "AssociationId": assoc }))
            }
            _ => {
                let attachments = object
                    .entry("Attachments")
                    .or_insert_with(|| Json::Array(Vec::new()));
                if let Json::Array(list) = attachments {
                    for other in others {
                        if !list.iter().any(|v| v.as_str() == Some(other.as_str())) {
                            list.push(Json::from(other));
                        }
                    }
                }
                Ok(json!({ "Id": id }))
            }
        }
    }

    fn detach(&self, kind: &Kind, method: &str, input: &Map<String, Json>) -> Result<Json, ProviderError> {
        let mut state = self.state.lock();
        if let Some(assoc) = input.get("AssociationId").and_then(Json::as_str) {
            let objects = state.resources.entry(kind.entity.to_string()).or_default();
            for object in objects.values_mut() {
                if let Some(Json::Object(map)) = object.get_mut("Associations") {
                    if map.remove(assoc).is_some() {
                        return Ok(json!({ "AssociationId": assoc }));
                    }
                }
            }
            return Err(ProviderError::new(
                "InvalidAssociationID.NotFound",
                format!("{}: no association {}", method, assoc),
            ));
        }
        let ids = self.targets(&state, kind, input);
        let Some(id) = ids.first().cloned() else {
            return Err(Self::not_found(kind, method));
        };
        let others: BTreeSet<String> = input
            .values()
            .flat_map(strings_of)
            .filter(|s| *s != id)
            .collect();
        let objects = state.resources.entry(kind.entity.to_string()).or_default();
        if let Some(Json::Object(object)) = objects.get_mut(&id) {
            if let Some(Json::Array(list)) = object.get_mut("Attachments") {
                list.retain(|v| v.as_str().is_none_or(|s| !others.contains(s)));
            }
        }
        Ok(json!({ "Id": id }))
    }
}

impl ControlPlane for MemoryCloud {
    fn region(&self) -> String {
        self.region.clone()
    }

    fn profile(&self) -> String {
        self.profile.clone()
    }

    fn call(
        &self,
        api: &str,
        method: &str,
        input: &Json,
        dry_run: bool,
    ) -> Result<Json, ProviderError> {
        self.calls.lock().push(format!("{}:{}", api, method));
        if self.state.lock().denied.contains(api) {
            return Err(ProviderError::new(
                "AccessDenied",
                format!("User is not authorized to perform: {}:{}", api, method),
            ));
        }
        let Some((verb, kind)) = route(api, method) else {
            return Err(ProviderError::new(
                "InvalidAction",
                format!("unknown method {}:{}", api, method),
            ));
        };
        let empty = Map::new();
        let fields = input.as_object().unwrap_or(&empty);
        if dry_run {
            if !matches!(verb, Verb::Create | Verb::List | Verb::Change) {
                let state = self.state.lock();
                if self.targets(&state, kind, fields).is_empty() {
                    return Err(Self::not_found(kind, method));
                }
            }
            return Err(ProviderError::new(
                DRY_RUN_OPERATION,
                "Request would have succeeded, but DryRun flag is set.",
            ));
        }
        self.apply(verb, kind, method, fields)
    }
}

fn short_hex() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

fn json_text(value: &Json) -> String {
    match value {
        Json::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// String leaves of a value (top level or array elements).
fn strings_of(value: &Json) -> Vec<String> {
    match value {
        Json::String(s) => vec![s.clone()],
        Json::Array(items) => items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    }
}

/// Whether `object` carries every `field: value` pair of `filters`.
fn matches_filters(object: &Json, filters: Option<&Json>) -> bool {
    let Some(Json::Object(filters)) = filters else {
        return true;
    };
    filters.iter().all(|(field, value)| object.get(field) == Some(value))
}

/// Whether a live object other than `id` itself mentions `id`.
fn is_referenced(state: &CloudState, id: &str) -> bool {
    state.resources.iter().any(|(entity, objects)| {
        let deleted = KINDS
            .iter()
            .find(|k| k.entity == entity.as_str())
            .and_then(|k| k.deleted);
        objects.iter().any(|(other, obj)| {
            if other == id {
                return false;
            }
            let Json::Object(fields) = obj else {
                return false;
            };
            if deleted.is_some() && fields.get("State").and_then(Json::as_str) == deleted {
                return false;
            }
            fields
                .values()
                .any(|v| strings_of(v).iter().any(|s| s == id))
        })
    })
}

fn with_derived_fields(state: &CloudState, entity: &str, object: &Json) -> Json {
    let mut object = object.clone();
    if entity == "securitygroup" {
        let id = object.get("Id").and_then(Json::as_str).map(str::to_string);
        if let (Some(id), Json::Object(map)) = (id, &mut object) {
            let derived = if is_referenced(state, &id) {
                "in-use"
            } else {
                "unused"
            };
            map.insert("State".into(), Json::from(derived));
        }
    }
    object
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routes_methods_to_kinds() {
        let (verb, kind) = route("ec2", "RunInstances").unwrap();
        assert_eq!((verb, kind.entity), (Verb::Create, "instance"));
        let (verb, kind) = route("ec2", "DescribeAddresses").unwrap();
        assert_eq!((verb, kind.entity), (Verb::List, "elasticip"));
        let (verb, kind) = route("iam", "ListPolicies").unwrap();
        assert_eq!((verb, kind.entity), (Verb::List, "policy"));
        let (verb, kind) = route("autoscaling", "DeletePolicy").unwrap();
        assert_eq!((verb, kind.entity), (Verb::Delete, "scalingpolicy"));
        let (verb, kind) = route("sns", "Unsubscribe").unwrap();
        assert_eq!((verb, kind.entity), (Verb::Delete, "subscription"));
        assert!(route("ec2", "FlyToTheMoon").is_none());
    }

    #[test]
    fn create_describe_and_terminate() {
        let cloud = MemoryCloud::new("us-east-1");
        let out = cloud
            .call("ec2", "RunInstances", &json!({"ImageId": "ami-1", "SubnetId": "s"}), false)
            .unwrap();
        let id = out["Id"].as_str().unwrap().to_string();
        assert!(id.starts_with("i-"));
        let listed = cloud
            .call("ec2", "DescribeInstances", &json!({"Ids": [id.clone()]}), false)
            .unwrap();
        assert_eq!(listed["Items"][0]["State"], "running");
        cloud
            .call("ec2", "TerminateInstances", &json!({"InstanceIds": [id.clone()]}), false)
            .unwrap();
        assert_eq!(cloud.object("instance", &id).unwrap()["State"], "terminated");
        let err = cloud
            .call("ec2", "TerminateInstances", &json!({"InstanceIds": [id]}), false)
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn dry_run_answers_with_codes() {
        let cloud = MemoryCloud::new("us-east-1");
        let err = cloud
            .call("ec2", "CreateVpc", &json!({"CidrBlock": "10.0.0.0/16"}), true)
            .unwrap_err();
        assert!(err.is_dry_run_success());
        assert!(cloud.objects("vpc").is_empty());
        let err = cloud
            .call("ec2", "DeleteVpc", &json!({"VpcId": "vpc-nope"}), true)
            .unwrap_err();
        assert!(err.is_not_found());
        cloud.deny_api("ec2");
        let err = cloud.call("ec2", "DescribeVpcs", &json!({}), false).unwrap_err();
        assert!(err.is_access_denied());
    }

    #[test]
    fn pages_follow_next_token() {
        let cloud = MemoryCloud::new("eu-west-1");
        for i in 0..5 {
            cloud.insert("vpc", json!({ "Id": format!("vpc-{}", i) }));
        }
        let mut token: Option<String> = None;
        let mut sizes = Vec::new();
        loop {
            let mut input = json!({"MaxResults": 2});
            if let Some(t) = &token {
                input["NextToken"] = Json::from(t.clone());
            }
            let page = cloud.call("ec2", "DescribeVpcs", &input, false).unwrap();
            sizes.push(page["Items"].as_array().unwrap().len());
            match page.get("NextToken").and_then(Json::as_str) {
                Some(t) => token = Some(t.to_string()),
                None => break,
            }
        }
        assert_eq!(sizes, vec![2, 2, 1]);
    }

    #[test]
    fn securitygroup_state_is_derived() {
        let cloud = MemoryCloud::new("us-east-1");
        let sg = cloud.call("ec2", "CreateSecurityGroup", &json!({"GroupName": "web"}), false).unwrap();
        let sg = sg["Id"].as_str().unwrap().to_string();
        assert_eq!(cloud.object("securitygroup", &sg).unwrap()["State"], "unused");
        let inst = cloud
            .call("ec2", "RunInstances", &json!({"SecurityGroupIds": [sg.clone()]}), false)
            .unwrap();
        assert_eq!(cloud.object("securitygroup", &sg).unwrap()["State"], "in-use");
        let err = cloud
            .call("ec2", "DeleteSecurityGroup", &json!({"GroupId": sg.clone()}), false)
            .unwrap_err();
        assert_eq!(err.code, "DependencyViolation");
        cloud
            .call("ec2", "TerminateInstances", &json!({"InstanceIds": [inst["Id"].clone()]}), false)
            .unwrap();
        assert_eq!(cloud.object("securitygroup", &sg).unwrap()["State"], "unused");
    }

    #[test]
    fn route_table_associations() {
        let cloud = MemoryCloud::new("us-east-1");
        let rtb = cloud.call("ec2", "CreateRouteTable", &json!({"VpcId": "vpc-1"}), false).unwrap();
        let out = cloud
            .call(
                "ec2",
                "AssociateRouteTable",
                &json!({"RouteTableId": rtb["Id"].clone(), "SubnetId": "subnet-1"}),
                false,
            )
            .unwrap();
        let assoc = out["AssociationId"].as_str().unwrap().to_string();
        assert!(assoc.starts_with("rtbassoc-"));
        cloud
            .call("ec2", "DisassociateRouteTable", &json!({"AssociationId": assoc.clone()}), false)
            .unwrap();
        assert!(cloud
            .call("ec2", "DisassociateRouteTable", &json!({"AssociationId": assoc}), false)
            .is_err());
    }
}
