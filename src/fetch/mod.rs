//! Concurrent resource fetcher.
//!
//! A [`Fetcher`] owns one fetch function per resource type. [`Fetcher::fetch`]
//! runs every function on its own tokio task, merges what comes back into a
//! [`Graph`], then runs the parent builders registered for each type over the
//! raw objects captured during the first phase. Errors never abort a fetch:
//! they are collected into one [`FetchError`], with access denied failures
//! collapsed into a single entry.

/// Per-fetch cache.
pub mod cache;

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::Value as Json;
use thiserror::Error;
use tracing::{debug, warn};

use crate::cloud::ProviderError;
use crate::config::Config;
use crate::graph::{Graph, Resource};

pub use cache::{FetchCache, objects_key};

/// Convenience result alias for fetch operations.
pub type Result<T> = std::result::Result<T, FetchError>;

/// Errors surfaced while fetching.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    /// The credentials may not read some resources.
    #[error("access denied to cloud resource")]
    AccessDenied,

    /// The provider rejected a call.
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// A raw object could not become a graph resource.
    #[error("cannot convert {kind}: {message}")]
    Conversion {
        /// Resource type.
        kind: String,
        /// What was wrong with the object.
        message: String,
    },

    /// Failure of one resource type of one service.
    #[error("sync aws.{path}: {message}")]
    Sync {
        /// `<service>.<type>`
        path: String,
        /// Underlying error.
        message: String,
    },

    /// No fetch function registered for the type.
    #[error("no fetch func defined for resource type '{0}'")]
    UnknownType(String),

    /// The context was cancelled.
    #[error("fetch cancelled")]
    Cancelled,

    /// A fetch task panicked or was aborted.
    #[error("fetch task failed: {0}")]
    Task(String),

    /// Several failures.
    #[error("{}", .0.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("\n"))]
    Multiple(Vec<FetchError>),
}

impl FetchError {
    /// Whether the error is, or wraps, an access denied answer.
    pub fn is_access_denied(&self) -> bool {
        match self {
            FetchError::AccessDenied => true,
            FetchError::Provider(e) => e.is_access_denied(),
            _ => false,
        }
    }

    /// Leaf errors, with nested [`FetchError::Multiple`] flattened.
    pub fn flatten(self) -> Vec<FetchError> {
        match self {
            FetchError::Multiple(list) => list.into_iter().flat_map(FetchError::flatten).collect(),
            other => vec![other],
        }
    }

    /// Fold errors into one, keeping a single [`FetchError::AccessDenied`].
    pub fn aggregate(errors: Vec<FetchError>) -> Result<()> {
        let mut folded = Vec::new();
        let mut denied = false;
        for err in errors.into_iter().flat_map(FetchError::flatten) {
            if err.is_access_denied() {
                if !denied {
                    folded.push(FetchError::AccessDenied);
                    denied = true;
                }
                continue;
            }
            folded.push(err);
        }
        match folded.len() {
            0 => Ok(()),
            1 => Err(folded.remove(0)),
            _ => Err(FetchError::Multiple(folded)),
        }
    }

    /// Number of access denied entries once flattened.
    pub fn access_denied_count(&self) -> usize {
        self.clone()
            .flatten()
            .iter()
            .filter(|e| e.is_access_denied())
            .count()
    }
}

/// What one fetch function produced.
#[derive(Debug, Default)]
pub struct FetchOutput {
    /// Graph resources.
    pub resources: Vec<Resource>,
    /// Provider payloads, kept for the parent builders.
    pub objects: Vec<Json>,
    /// Failure met along the way; earlier items are kept.
    pub error: Option<FetchError>,
}

impl FetchOutput {
    /// Output carrying only an error.
    pub fn failed(error: FetchError) -> Self {
        Self {
            error: Some(error),
            ..Self::default()
        }
    }
}

/// Fetches every resource of one type.
pub type FetchFunc =
    Arc<dyn Fn(FetchContext, Arc<FetchCache>) -> BoxFuture<'static, FetchOutput> + Send + Sync>;

/// Adds the edges of one raw object to the graph.
pub type ParentBuilder = Arc<dyn Fn(&Graph, &Json) -> Result<()> + Send + Sync>;

/// Flags shared by every task of a fetch.
#[derive(Debug, Clone, Default)]
pub struct FetchContext {
    cancelled: Arc<AtomicBool>,
    force: bool,
    by_type: Option<String>,
}

impl FetchContext {
    /// Fresh context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style force flag: fetch types whose sync is disabled.
    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    /// Whether disabled types are fetched anyway.
    pub fn is_forced(&self) -> bool {
        self.force
    }

    /// Type fetched alone, when in fetch-by-type mode.
    pub fn fetching_by_type(&self) -> Option<&str> {
        self.by_type.as_deref()
    }

    fn for_type(&self, kind: &str) -> Self {
        Self {
            by_type: Some(kind.to_string()),
            ..self.clone()
        }
    }

    /// Cancel every task sharing this context.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Whether [`FetchContext::cancel`] was called.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Shape of a paginated list answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageLayout {
    /// Field holding a list of wrappers around the items, if any.
    pub container: Option<&'static str>,
    /// Field holding the items.
    pub extractor: &'static str,
    /// Field holding the next page token; `None` when not paginated.
    pub next_marker: Option<&'static str>,
}

fn page_items<'a>(layout: &PageLayout, page: &'a Json) -> Vec<&'a Json> {
    let items_of = |v: &'a Json| -> Vec<&'a Json> {
        v.get(layout.extractor)
            .and_then(Json::as_array)
            .map(|a| a.iter().collect())
            .unwrap_or_default()
    };
    match layout.container {
        Some(container) => page
            .get(container)
            .and_then(Json::as_array)
            .map(|wrappers| wrappers.iter().flat_map(items_of).collect())
            .unwrap_or_default(),
        None => items_of(page),
    }
}

/// Walk pages until the next marker is absent.
///
/// `fetch_page` receives the marker of the page to fetch (`None` first).
/// Conversion stops at the first item `convert` rejects; the items gathered
/// before it are kept and the error is reported in the output.
pub async fn paginate<P, Fut, C>(
    ctx: &FetchContext,
    layout: PageLayout,
    mut fetch_page: P,
    convert: C,
) -> FetchOutput
where
    P: FnMut(Option<String>) -> Fut,
    Fut: Future<Output = Result<Json>>,
    C: Fn(&Json) -> Result<Resource>,
{
    let mut out = FetchOutput::default();
    let mut marker: Option<String> = None;
    loop {
        if ctx.is_cancelled() {
            out.error = Some(FetchError::Cancelled);
            return out;
        }
        let page = match fetch_page(marker.take()).await {
            Ok(page) => page,
            Err(err) => {
                out.error = Some(err);
                return out;
            }
        };
        for item in page_items(&layout, &page) {
            match convert(item) {
                Ok(res) => {
                    out.resources.push(res);
                    out.objects.push(item.clone());
                }
                Err(err) => {
                    out.error = Some(err);
                    return out;
                }
            }
        }
        marker = layout
            .next_marker
            .and_then(|field| page.get(field))
            .and_then(Json::as_str)
            .map(str::to_string);
        if marker.is_none() {
            return out;
        }
    }
}

/// Per-service fetch coordinator.
pub struct Fetcher {
    service: String,
    funcs: BTreeMap<String, FetchFunc>,
    parents: BTreeMap<String, Vec<ParentBuilder>>,
    cache: Arc<FetchCache>,
    config: Config,
}

impl std::fmt::Debug for Fetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fetcher")
            .field("service", &self.service)
            .field("types", &self.funcs.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Fetcher {
    /// Fetcher for `service`, reading disable knobs from `config`.
    pub fn new(service: impl Into<String>, config: Config) -> Self {
        Self {
            service: service.into(),
            funcs: BTreeMap::new(),
            parents: BTreeMap::new(),
            cache: Arc::new(FetchCache::new()),
            config,
        }
    }

    /// Register the fetch function of `kind`.
    pub fn with_func(mut self, kind: impl Into<String>, func: FetchFunc) -> Self {
        self.funcs.insert(kind.into(), func);
        self
    }

    /// Register a parent builder run over each raw object of `kind`.
    pub fn with_parent_builder(mut self, kind: impl Into<String>, builder: ParentBuilder) -> Self {
        self.parents.entry(kind.into()).or_default().push(builder);
        self
    }

    /// Registered resource types, sorted.
    pub fn resource_types(&self) -> Vec<String> {
        self.funcs.keys().cloned().collect()
    }

    /// Shared cache.
    pub fn cache(&self) -> Arc<FetchCache> {
        self.cache.clone()
    }

    /// Cached value, e.g. `instance_objects` after a fetch.
    pub fn get(&self, key: &str) -> Option<Json> {
        self.cache.get(key)
    }

    /// Clear the cache; call once a fetch has been consumed.
    pub fn reset(&self) {
        self.cache.reset();
    }

    fn sync_error(&self, kind: &str, err: FetchError) -> FetchError {
        if err.is_access_denied() {
            return FetchError::AccessDenied;
        }
        FetchError::Sync {
            path: format!("{}.{}", self.service, kind),
            message: err.to_string(),
        }
    }

    fn collect(&self, graph: &Graph, kind: &str, out: FetchOutput, errors: &mut Vec<FetchError>) {
        debug!(
            service = %self.service,
            kind,
            resources = out.resources.len(),
            "fetched"
        );
        graph.add_resources(out.resources);
        self.cache.store(objects_key(kind), Json::Array(out.objects));
        if let Some(err) = out.error {
            warn!(service = %self.service, kind, error = %err, "fetch failed");
            errors.push(self.sync_error(kind, err));
        }
    }

    /// Fetch every enabled type, then build parent links.
    pub async fn fetch(&self, ctx: &FetchContext) -> (Graph, Result<()>) {
        let graph = Arc::new(Graph::new());
        let mut errors = Vec::new();

        let mut tasks = FuturesUnordered::new();
        for (kind, func) in &self.funcs {
            if !ctx.is_forced() && self.config.is_type_sync_disabled(&self.service, kind) {
                debug!(service = %self.service, kind = %kind, "sync disabled");
                continue;
            }
            let kind = kind.clone();
            let func = func.clone();
            let task_ctx = ctx.clone();
            let cache = self.cache.clone();
            tasks.push(tokio::spawn(async move {
                let out = func(task_ctx, cache).await;
                (kind, out)
            }));
        }

        while let Some(joined) = tasks.next().await {
            match joined {
                Ok((kind, out)) => {
                    if ctx.is_cancelled() {
                        debug!(service = %self.service, kind = %kind, "discarding result of cancelled fetch");
                        continue;
                    }
                    self.collect(&graph, &kind, out, &mut errors);
                }
                Err(e) => errors.push(FetchError::Task(e.to_string())),
            }
        }

        if ctx.is_cancelled() {
            errors.push(FetchError::Cancelled);
            return (unwrap_graph(graph), FetchError::aggregate(errors));
        }

        let mut builders = FuturesUnordered::new();
        for (kind, list) in &self.parents {
            for object in self.cache.objects(kind) {
                for builder in list {
                    let builder = builder.clone();
                    let graph = graph.clone();
                    let object = object.clone();
                    let kind = kind.clone();
                    builders.push(tokio::spawn(async move {
                        builder(graph.as_ref(), &object).map_err(|e| (kind, e))
                    }));
                }
            }
        }
        while let Some(joined) = builders.next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err((kind, err))) => errors.push(self.sync_error(&kind, err)),
                Err(e) => errors.push(FetchError::Task(e.to_string())),
            }
        }

        (unwrap_graph(graph), FetchError::aggregate(errors))
    }

    /// Fetch `kind` alone, whatever its sync setting.
    pub async fn fetch_by_type(&self, ctx: &FetchContext, kind: &str) -> (Graph, Result<()>) {
        let Some(func) = self.funcs.get(kind).cloned() else {
            return (Graph::new(), Err(FetchError::UnknownType(kind.to_string())));
        };
        let graph = Graph::new();
        let mut errors = Vec::new();
        let task_ctx = ctx.for_type(kind);
        let cache = self.cache.clone();
        match tokio::spawn(async move { func(task_ctx, cache).await }).await {
            Ok(out) if !ctx.is_cancelled() => self.collect(&graph, kind, out, &mut errors),
            Ok(_) => errors.push(FetchError::Cancelled),
            Err(e) => errors.push(FetchError::Task(e.to_string())),
        }
        (graph, FetchError::aggregate(errors))
    }
}

fn unwrap_graph(graph: Arc<Graph>) -> Graph {
    Arc::try_unwrap(graph).unwrap_or_else(|shared| (*shared).clone())
}
