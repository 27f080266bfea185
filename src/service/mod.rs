//! Services.
//!
//! A [`Service`] groups the resource types and commands of a few provider
//! apis under a human name (`infra`, `access`, ...). Each one owns a
//! [`Fetcher`] built from its [`ServiceDef`]: list methods are called through
//! the [`ControlPlane`] on blocking tasks, answers become graph resources, and
//! declared links become edges once every type has been fetched.

/// Declarative service tables.
pub mod definitions;

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::join_all;
use once_cell::sync::Lazy;
use serde_json::{Value as Json, json};
use tracing::{debug, info};

use crate::cloud::ControlPlane;
use crate::command::{Command, CommandRegistry};
use crate::config::Config;
use crate::fetch::{
    self, FetchCache, FetchContext, FetchError, FetchFunc, FetchOutput, Fetcher, PageLayout,
    ParentBuilder, paginate,
};
use crate::graph::{Graph, NAME_PROPERTY, Relation, Resource};

pub use definitions::{Link, ResourceDef, SERVICES, ServiceDef};

/// Region reported by global services.
pub const GLOBAL_REGION: &str = "global";

/// Resource type of region nodes.
pub const REGION_TYPE: &str = "region";

const BUCKETS_KEY: &str = "buckets";

struct Lookups {
    service_per_api: BTreeMap<&'static str, &'static str>,
    service_per_type: BTreeMap<&'static str, &'static str>,
    api_per_type: BTreeMap<&'static str, &'static str>,
}

static LOOKUPS: Lazy<Lookups> = Lazy::new(|| {
    let mut lookups = Lookups {
        service_per_api: BTreeMap::new(),
        service_per_type: BTreeMap::new(),
        api_per_type: BTreeMap::new(),
    };
    for service in SERVICES.iter() {
        for api in service.apis {
            lookups.service_per_api.insert(*api, service.name);
        }
        for r in &service.resources {
            lookups.service_per_type.insert(r.resource_type, service.name);
            lookups.api_per_type.insert(r.resource_type, r.api);
        }
    }
    lookups
});

/// Name of the service owning `api`.
pub fn service_name_for_api(api: &str) -> Option<&'static str> {
    LOOKUPS.service_per_api.get(api).copied()
}

/// Name of the service fetching `resource_type`.
pub fn service_name_for_type(resource_type: &str) -> Option<&'static str> {
    LOOKUPS.service_per_type.get(resource_type).copied()
}

/// Api listing `resource_type`.
pub fn api_for_type(resource_type: &str) -> Option<&'static str> {
    LOOKUPS.api_per_type.get(resource_type).copied()
}

/// Resource types fetched by the service `name`, in declaration order.
pub fn resource_types_for_service(name: &str) -> Vec<&'static str> {
    SERVICES
        .iter()
        .find(|s| s.name == name)
        .map(|s| s.resources.iter().map(|r| r.resource_type).collect())
        .unwrap_or_default()
}

/// Graph resource from a raw provider object.
///
/// The `Id` field becomes the resource id; a `Name` tag becomes the name.
pub fn to_resource(kind: &str, object: &Json) -> fetch::Result<Resource> {
    let conversion = |message: &str| FetchError::Conversion {
        kind: kind.to_string(),
        message: message.to_string(),
    };
    let Json::Object(fields) = object else {
        return Err(conversion("not an object"));
    };
    let id = fields
        .get("Id")
        .and_then(Json::as_str)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| conversion("missing Id"))?;
    let mut res = Resource::new(kind, id);
    for (k, v) in fields.iter().filter(|(k, _)| k.as_str() != "Id") {
        res.properties.insert(k.clone(), v.clone());
    }
    if let Some(name) = fields.get("Tags").and_then(|t| t.get(NAME_PROPERTY)) {
        res.properties.insert(NAME_PROPERTY.to_string(), name.clone());
    }
    Ok(res)
}

async fn call(
    cloud: Arc<dyn ControlPlane>,
    api: &'static str,
    method: &'static str,
    input: Json,
) -> fetch::Result<Json> {
    tokio::task::spawn_blocking(move || cloud.call(api, method, &input, false))
        .await
        .map_err(|e| FetchError::Task(e.to_string()))?
        .map_err(FetchError::from)
}

fn list_input(mut base: Json, marker: Option<String>, page_size: Option<u64>, layout: PageLayout) -> Json {
    if layout.next_marker.is_some() {
        if let Some(size) = page_size {
            base["MaxResults"] = Json::from(size);
        }
        if let Some(marker) = marker {
            base["NextToken"] = Json::from(marker);
        }
    }
    base
}

fn list_func(def: &ResourceDef, cloud: Arc<dyn ControlPlane>, page_size: Option<u64>) -> FetchFunc {
    let (api, method, kind) = (def.api, def.api_method, def.resource_type);
    let layout = def.layout();
    Arc::new(move |ctx: FetchContext, _cache: Arc<FetchCache>| {
        let cloud = cloud.clone();
        async move {
            paginate(
                &ctx,
                layout,
                |marker| {
                    let input = list_input(json!({}), marker, page_size, layout);
                    call(cloud.clone(), api, method, input)
                },
                |object| to_resource(kind, object),
            )
            .await
        }
        .boxed()
    })
}

async fn list_buckets(cloud: Arc<dyn ControlPlane>, cache: &FetchCache) -> fetch::Result<Vec<Json>> {
    let buckets = cache
        .get_or_init(BUCKETS_KEY, || async move {
            let out = call(cloud, "s3", "ListBuckets", json!({})).await?;
            Ok::<Json, FetchError>(out.get("Items").cloned().unwrap_or_else(|| json!([])))
        })
        .await?;
    Ok(buckets.as_array().cloned().unwrap_or_default())
}

fn bucket_func(cloud: Arc<dyn ControlPlane>) -> FetchFunc {
    Arc::new(move |_ctx: FetchContext, cache: Arc<FetchCache>| {
        let cloud = cloud.clone();
        async move {
            let buckets = match list_buckets(cloud, &cache).await {
                Ok(buckets) => buckets,
                Err(err) => return FetchOutput::failed(err),
            };
            let mut out = FetchOutput::default();
            for bucket in buckets {
                match to_resource("bucket", &bucket) {
                    Ok(res) => {
                        out.resources.push(res);
                        out.objects.push(bucket);
                    }
                    Err(err) => {
                        out.error = Some(err);
                        break;
                    }
                }
            }
            out
        }
        .boxed()
    })
}

fn s3object_func(def: &ResourceDef, cloud: Arc<dyn ControlPlane>, page_size: Option<u64>) -> FetchFunc {
    let layout = PageLayout {
        next_marker: Some("NextToken"),
        ..def.layout()
    };
    Arc::new(move |ctx: FetchContext, cache: Arc<FetchCache>| {
        let cloud = cloud.clone();
        async move {
            let buckets = match list_buckets(cloud.clone(), &cache).await {
                Ok(buckets) => buckets,
                Err(err) => return FetchOutput::failed(err),
            };
            let mut out = FetchOutput::default();
            for bucket in buckets {
                let Some(name) = bucket.get("Id").and_then(Json::as_str) else {
                    continue;
                };
                let filter = json!({ "Filters": { "Bucket": name } });
                let page = paginate(
                    &ctx,
                    layout,
                    |marker| {
                        let input = list_input(filter.clone(), marker, page_size, layout);
                        call(cloud.clone(), "s3", "ListObjects", input)
                    },
                    |object| to_resource("s3object", object),
                )
                .await;
                out.resources.extend(page.resources);
                out.objects.extend(page.objects);
                if page.error.is_some() {
                    out.error = page.error;
                    break;
                }
            }
            out
        }
        .boxed()
    })
}

fn linked_ids(value: Option<&Json>) -> Vec<String> {
    let strings: Vec<&str> = match value {
        Some(Json::String(s)) => vec![s.as_str()],
        Some(Json::Array(items)) => items.iter().filter_map(Json::as_str).collect(),
        Some(Json::Object(map)) => map.values().filter_map(Json::as_str).collect(),
        _ => Vec::new(),
    };
    strings
        .into_iter()
        .flat_map(|s| s.split(','))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn object_resource(kind: &str, object: &Json) -> fetch::Result<Resource> {
    object
        .get("Id")
        .and_then(Json::as_str)
        .map(|id| Resource::new(kind, id))
        .ok_or_else(|| FetchError::Conversion {
            kind: kind.to_string(),
            message: "add parent: missing Id".to_string(),
        })
}

fn link_builder(kind: &'static str, links: Vec<Link>) -> ParentBuilder {
    Arc::new(move |graph: &Graph, object: &Json| -> fetch::Result<()> {
        let res = object_resource(kind, object)?;
        for link in &links {
            for id in linked_ids(object.get(link.field)) {
                let linked = Resource::new(link.kind, id);
                match link.relation {
                    Relation::ParentOf => graph.add_parent_relation(&linked, &res),
                    Relation::AppliesOn => graph.add_applies_on_relation(&linked, &res),
                    Relation::DependsOn => graph.add_depends_on_relation(&res, &linked),
                }
            }
        }
        Ok(())
    })
}

fn region_builder(kind: &'static str, region: String) -> ParentBuilder {
    Arc::new(move |graph: &Graph, object: &Json| -> fetch::Result<()> {
        let res = object_resource(kind, object)?;
        graph.add_parent_relation(&Resource::new(REGION_TYPE, region.clone()), &res);
        Ok(())
    })
}

/// Fetchers and commands of a group of apis.
pub struct Service {
    def: &'static ServiceDef,
    region: String,
    profile: String,
    config: Config,
    fetcher: Fetcher,
    commands: Vec<Arc<Command>>,
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("name", &self.def.name)
            .field("region", &self.region)
            .field("profile", &self.profile)
            .field("commands", &self.commands.len())
            .finish()
    }
}

impl Service {
    /// Assemble `def` against `cloud`.
    pub fn new(
        def: &'static ServiceDef,
        cloud: Arc<dyn ControlPlane>,
        config: Config,
        commands: &CommandRegistry,
    ) -> Self {
        let region = cloud.region();
        let page_size = config.page_size();
        let mut fetcher = Fetcher::new(def.name, config.clone());
        for r in &def.resources {
            let func = match (r.manual, r.resource_type) {
                (true, "bucket") => bucket_func(cloud.clone()),
                (true, "s3object") => s3object_func(r, cloud.clone(), page_size),
                _ => list_func(r, cloud.clone(), page_size),
            };
            fetcher = fetcher.with_func(r.resource_type, func);
            if r.region_parent && !def.global {
                fetcher = fetcher
                    .with_parent_builder(r.resource_type, region_builder(r.resource_type, region.clone()));
            }
            if !r.links.is_empty() {
                fetcher = fetcher
                    .with_parent_builder(r.resource_type, link_builder(r.resource_type, r.links.clone()));
            }
        }
        let commands = commands
            .commands()
            .filter(|c| def.apis.contains(&c.api.as_str()))
            .cloned()
            .collect();
        Self {
            def,
            region,
            profile: cloud.profile(),
            config,
            fetcher,
            commands,
        }
    }

    /// Service name.
    pub fn name(&self) -> &'static str {
        self.def.name
    }

    /// Region, or `global` for global services.
    pub fn region(&self) -> String {
        if self.def.global {
            GLOBAL_REGION.to_string()
        } else {
            self.region.clone()
        }
    }

    /// Credential profile.
    pub fn profile(&self) -> &str {
        &self.profile
    }

    /// Whether the service ignores regions.
    pub fn is_global(&self) -> bool {
        self.def.global
    }

    /// Provider apis.
    pub fn apis(&self) -> &'static [&'static str] {
        self.def.apis
    }

    /// Fetched resource types, in declaration order.
    pub fn resource_types(&self) -> Vec<&'static str> {
        self.def.resources.iter().map(|r| r.resource_type).collect()
    }

    /// Commands talking to one of the service apis.
    pub fn commands(&self) -> &[Arc<Command>] {
        &self.commands
    }

    /// Whether `aws.<name>.sync` is off and `FORCE_<NAME>` is not set.
    pub fn is_sync_disabled(&self) -> bool {
        self.config.is_service_sync_disabled(self.def.name)
    }

    /// Fetch every enabled resource type.
    ///
    /// A disabled service yields an empty graph unless `ctx` is forced.
    pub async fn fetch(&self, ctx: &FetchContext) -> (Graph, fetch::Result<()>) {
        if !ctx.is_forced() && self.is_sync_disabled() {
            debug!(service = self.name(), "sync disabled");
            return (Graph::new(), Ok(()));
        }
        info!(service = self.name(), region = %self.region(), "sync");
        let (graph, result) = self.fetcher.fetch(ctx).await;
        self.fetcher.reset();
        if !self.def.global {
            graph.add_resource(Resource::new(REGION_TYPE, self.region.clone()));
        }
        (graph, result)
    }

    /// Fetch one resource type.
    pub async fn fetch_by_type(&self, ctx: &FetchContext, resource_type: &str) -> (Graph, fetch::Result<()>) {
        debug!(service = self.name(), resource_type, "fetch by type");
        let out = self.fetcher.fetch_by_type(ctx, resource_type).await;
        self.fetcher.reset();
        out
    }
}

/// Every service assembled against one control plane.
#[derive(Debug, Default)]
pub struct ServiceRegistry {
    services: BTreeMap<&'static str, Arc<Service>>,
}

impl ServiceRegistry {
    /// Assemble every built-in service.
    pub fn new(cloud: Arc<dyn ControlPlane>, config: &Config, commands: &CommandRegistry) -> Self {
        let services = SERVICES
            .iter()
            .map(|def| {
                let service = Service::new(def, cloud.clone(), config.clone(), commands);
                (def.name, Arc::new(service))
            })
            .collect();
        Self { services }
    }

    /// Service by name.
    pub fn get(&self, name: &str) -> Option<Arc<Service>> {
        self.services.get(name).cloned()
    }

    /// Every service, sorted by name.
    pub fn services(&self) -> impl Iterator<Item = &Arc<Service>> {
        self.services.values()
    }

    /// Service owning `api`.
    pub fn service_for_api(&self, api: &str) -> Option<Arc<Service>> {
        service_name_for_api(api).and_then(|name| self.get(name))
    }

    /// Service fetching `resource_type`.
    pub fn service_for_type(&self, resource_type: &str) -> Option<Arc<Service>> {
        service_name_for_type(resource_type).and_then(|name| self.get(name))
    }

    /// Distinct services owning the given apis.
    pub fn services_for_apis(&self, apis: &[&str]) -> Vec<Arc<Service>> {
        self.distinct(apis.iter().filter_map(|a| service_name_for_api(a)))
    }

    /// Distinct services fetching the given types.
    pub fn services_for_types(&self, types: &[&str]) -> Vec<Arc<Service>> {
        self.distinct(types.iter().filter_map(|t| service_name_for_type(t)))
    }

    fn distinct(&self, names: impl Iterator<Item = &'static str>) -> Vec<Arc<Service>> {
        let mut names: Vec<&str> = names.collect();
        names.sort_unstable();
        names.dedup();
        names.into_iter().filter_map(|n| self.get(n)).collect()
    }

    /// Fetch the given services concurrently and merge their graphs.
    pub async fn fetch(&self, ctx: &FetchContext, services: &[Arc<Service>]) -> (Graph, fetch::Result<()>) {
        let results = join_all(services.iter().map(|s| s.fetch(ctx))).await;
        let graph = Graph::new();
        let mut errors = Vec::new();
        for (fetched, result) in results {
            graph.add_graph(&fetched);
            if let Err(err) = result {
                errors.push(err);
            }
        }
        (graph, FetchError::aggregate(errors))
    }

    /// Fetch every service.
    pub async fn fetch_all(&self, ctx: &FetchContext) -> (Graph, fetch::Result<()>) {
        let services: Vec<Arc<Service>> = self.services.values().cloned().collect();
        self.fetch(ctx, &services).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::MemoryCloud;
    use crate::command::CommandCatalog;

    fn registry(cloud: &Arc<MemoryCloud>, config: Config) -> ServiceRegistry {
        let cloud: Arc<dyn ControlPlane> = cloud.clone();
        ServiceRegistry::new(cloud, &config, &CommandCatalog::global().snapshot())
    }

    #[test]
    fn lookups() {
        assert_eq!(service_name_for_api("elbv2"), Some("infra"));
        assert_eq!(service_name_for_type("record"), Some("dns"));
        assert_eq!(api_for_type("database"), Some("rds"));
        assert_eq!(resource_types_for_service("messaging"), vec!["topic", "subscription", "queue"]);
        assert!(service_name_for_type("spaceship").is_none());
    }

    #[test]
    fn conversion_reads_name_tag() {
        let res = to_resource("subnet", &json!({"Id": "subnet-1", "Tags": {"Name": "front"}, "VpcId": "vpc-1"})).unwrap();
        assert_eq!(res.name(), Some("front"));
        assert_eq!(res.property_str("VpcId"), Some("vpc-1"));
        assert!(!res.properties.contains_key("Id"));
        assert!(to_resource("subnet", &json!({"VpcId": "vpc-1"})).is_err());
        assert_eq!(
            linked_ids(Some(&json!({"rtbassoc-1": "subnet-1,subnet-2"}))),
            vec!["subnet-1", "subnet-2"]
        );
    }

    #[tokio::test]
    async fn infra_fetch_builds_relations() {
        let cloud = Arc::new(MemoryCloud::new("eu-west-1"));
        let vpc = cloud.insert("vpc", json!({"Id": "vpc-1", "Tags": {"Name": "main"}}));
        cloud.insert("subnet", json!({"Id": "subnet-1", "VpcId": vpc}));
        cloud.insert(
            "instance",
            json!({"Id": "i-1", "SubnetId": "subnet-1", "SecurityGroupIds": ["sg-1"], "State": "running"}),
        );
        cloud.insert("securitygroup", json!({"Id": "sg-1", "VpcId": "vpc-1"}));

        let services = registry(&cloud, Config::new());
        let infra = services.get("infra").unwrap();
        assert_eq!(infra.region(), "eu-west-1");
        assert!(infra.commands().iter().all(|c| infra.apis().contains(&c.api.as_str())));
        assert!(infra.commands().iter().any(|c| c.name() == "create instance"));

        let (graph, result) = infra.fetch(&FetchContext::new()).await;
        assert!(result.is_ok(), "{:?}", result);
        let inst = graph.get_resource("instance", "i-1").unwrap();
        assert_eq!(graph.find_ancestor(&inst, "vpc").unwrap().id, "vpc-1");
        assert_eq!(graph.find_ancestor(&inst, REGION_TYPE).unwrap().id, "eu-west-1");
        let sg = graph.get_resource("securitygroup", "sg-1").unwrap();
        assert_eq!(graph.list_resources_applied_on(&sg)[0].id, "i-1");
        assert_eq!(graph.resolve_alias("subnet", "vpc", "main").as_deref(), Some("vpc-1"));
    }

    #[tokio::test]
    async fn pages_follow_the_configured_size() {
        let cloud = Arc::new(MemoryCloud::new("eu-west-1"));
        for i in 0..5 {
            cloud.insert("instance", json!({"Id": format!("i-{}", i)}));
        }
        let config = Config::from_pairs([("aws.fetch.page_size", json!(2))]);
        let services = registry(&cloud, config);
        let infra = services.get("infra").unwrap();
        let (graph, result) = infra.fetch_by_type(&FetchContext::new(), "instance").await;
        assert!(result.is_ok());
        assert_eq!(graph.get_all_resources(&["instance"]).len(), 5);
        let pages = cloud
            .calls()
            .iter()
            .filter(|c| c.as_str() == "ec2:DescribeInstances")
            .count();
        assert_eq!(pages, 3);
    }

    #[tokio::test]
    async fn buckets_are_listed_once_for_objects() {
        let cloud = Arc::new(MemoryCloud::new("eu-west-1"));
        cloud.insert("bucket", json!({"Id": "logs"}));
        cloud.insert("bucket", json!({"Id": "assets"}));
        cloud.insert("s3object", json!({"Id": "a.txt", "Bucket": "logs"}));
        cloud.insert("s3object", json!({"Id": "b.txt", "Bucket": "assets"}));
        let services = registry(&cloud, Config::new());
        let storage = services.get("storage").unwrap();
        let (graph, result) = storage.fetch(&FetchContext::new()).await;
        assert!(result.is_ok());
        assert_eq!(graph.get_all_resources(&["bucket"]).len(), 2);
        let object = graph.get_resource("s3object", "a.txt").unwrap();
        assert_eq!(graph.parent_of(&object).unwrap().id, "logs");
        let listings = cloud
            .calls()
            .iter()
            .filter(|c| c.as_str() == "s3:ListBuckets")
            .count();
        assert_eq!(listings, 1);
    }

    #[tokio::test]
    async fn disabled_service_yields_empty_graph() {
        let cloud = Arc::new(MemoryCloud::new("eu-west-1"));
        cloud.insert("queue", json!({"Id": "jobs"}));
        let config = Config::from_pairs([("aws.messaging.sync", json!(false))]);
        let services = registry(&cloud, config);
        let messaging = services.get("messaging").unwrap();
        assert!(messaging.is_sync_disabled());
        let (graph, result) = messaging.fetch(&FetchContext::new()).await;
        assert!(result.is_ok());
        assert!(graph.is_empty());
    }

    #[test]
    fn registry_lookups() {
        let cloud = Arc::new(MemoryCloud::new("eu-west-1"));
        let services = registry(&cloud, Config::new());
        assert_eq!(services.get("access").unwrap().region(), GLOBAL_REGION);
        assert_eq!(services.service_for_api("sqs").unwrap().name(), "messaging");
        assert_eq!(services.service_for_type("alarm").unwrap().name(), "monitoring");
        let names: Vec<_> = services
            .services_for_types(&["instance", "subnet", "user"])
            .iter()
            .map(|s| s.name())
            .collect();
        assert_eq!(names, vec!["access", "infra"]);
        assert_eq!(services.services_for_apis(&["sns", "sqs"]).len(), 1);
    }
}
