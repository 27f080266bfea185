//! Cloudplan CLI - run, revert and inspect templates against the simulated cloud
//!
//! State (config, cloud, graph, history) lives under `$CLOUDPLAN_HOME`.

use std::collections::BTreeMap;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use cloudplan::cloud::{ControlPlane, MemoryCloud};
use cloudplan::command::CommandCatalog;
use cloudplan::config::{PROFILE_KEY, REGION_KEY};
use cloudplan::fetch::FetchContext;
use cloudplan::graph::Graph;
use cloudplan::service::ServiceRegistry;
use cloudplan::template::record::{DefaultPrinter, LogPrinter, Printer};
use cloudplan::template::validate::default_validators;
use cloudplan::template::{CompileEnv, CompileMode, Runner, Template, TemplateExecution, Value, parse, parse_params};
use cloudplan::{Config, Store};
use tracing::{info, warn};

/// Region global services are reached through.
const GLOBAL_SERVICES_REGION: &str = "us-east-1";

#[derive(Parser)]
#[command(name = "cloudplan")]
#[command(about = "Template-driven cloud orchestration", long_about = None)]
struct Cli {
    /// Compile and dry-run only
    #[arg(long, global = true)]
    dry_run: bool,

    /// Sync services and types even when their sync is disabled
    #[arg(long, global = true)]
    force: bool,

    /// Do not sync the local graph after a run
    #[arg(long, global = true)]
    no_sync: bool,

    /// Credential profile
    #[arg(long, global = true)]
    profile: Option<String>,

    /// Region
    #[arg(long, global = true)]
    region: Option<String>,

    /// Run against the region global services live in
    #[arg(long, global = true)]
    force_global_region: bool,

    /// Debug logs
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Trace logs
    #[arg(long, global = true)]
    extra_verbose: bool,

    /// Run without asking for confirmation
    #[arg(short, long, global = true)]
    yes: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a template file
    Run {
        /// Template file
        file: PathBuf,

        /// Hole values as key=value
        #[arg(trailing_var_arg = true)]
        fillers: Vec<String>,
    },

    /// Undo a previous run
    Revert {
        /// Execution id
        id: String,
    },

    /// Show execution history
    Log {
        /// Show one execution in full
        id: Option<String>,
    },

    /// Fetch every service into the local graph
    Sync,

    /// List resources of a type
    List {
        /// Resource type, e.g. `instance`
        resource_type: String,
    },

    /// Show a resource of the local graph
    Show {
        /// Resource id or name
        id: String,
    },

    /// One-liner: `<action> <entity> [key=value ...]`
    #[command(external_subcommand)]
    OneLiner(Vec<String>),
}

/// Everything a subcommand needs.
struct App {
    store: Store,
    config: Config,
    cloud: Arc<MemoryCloud>,
    cli_flags: Flags,
}

#[derive(Clone, Copy)]
struct Flags {
    dry_run: bool,
    force: bool,
    no_sync: bool,
    yes: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.extra_verbose {
        tracing::Level::TRACE
    } else if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()),
        )
        .with_writer(io::stderr)
        .init();

    let store = Store::from_env();
    store.init()?;
    let mut config = store.load_config()?;
    if let Some(region) = &cli.region {
        config.set(REGION_KEY, region.as_str());
    }
    if cli.force_global_region {
        config.set(REGION_KEY, GLOBAL_SERVICES_REGION);
    }
    if let Some(profile) = &cli.profile {
        config.set(PROFILE_KEY, profile.as_str());
    }

    let state = store.load_cloud_state()?;
    let cloud = Arc::new(MemoryCloud::from_state(config.region(), state).with_profile(config.profile()));
    let app = App {
        store,
        config,
        cloud,
        cli_flags: Flags {
            dry_run: cli.dry_run,
            force: cli.force,
            no_sync: cli.no_sync,
            yes: cli.yes,
        },
    };

    let ok = match cli.command {
        Commands::Run { file, fillers } => {
            let text = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read template {:?}", file))?;
            let template = parse(&text)?;
            let fillers = parse_fillers(&fillers)?;
            app.run_template(template, fillers, CompileMode::Runner, &file.display().to_string(), "")?
        }

        Commands::Revert { id } => {
            let exec = app.store.load_execution(&id)?;
            if !exec.is_revertible() {
                bail!("execution {} is not revertible", id);
            }
            let template = exec.revert()?;
            let message = format!("revert {}", id);
            app.run_template(template, BTreeMap::new(), CompileMode::Replay, "", &message)?
        }

        Commands::Log { id } => {
            app.log(id.as_deref())?;
            true
        }

        Commands::Sync => {
            app.sync()?;
            true
        }

        Commands::List { resource_type } => {
            app.list(&resource_type)?;
            true
        }

        Commands::Show { id } => {
            app.show(&id)?;
            true
        }

        Commands::OneLiner(args) => {
            let template = parse(&one_liner_text(&args)?)?;
            app.run_template(template, BTreeMap::new(), CompileMode::Runner, "", "")?
        }
    };

    if !ok {
        std::process::exit(1);
    }
    Ok(())
}

impl App {
    /// Compile, confirm, run, record and sync. Returns whether every command
    /// succeeded.
    fn run_template(
        &self,
        template: Template,
        fillers: BTreeMap<String, Value>,
        mode: CompileMode,
        path: &str,
        message: &str,
    ) -> Result<bool> {
        let graph = Arc::new(self.store.load_graph()?);
        let alias_graph = graph.clone();
        let cenv = CompileEnv::builder()
            .fillers(fillers)
            .alias_resolver(move |entity, key, alias| alias_graph.resolve_alias(entity, key, alias))
            .missing_holes(prompt_hole)
            .build();

        let lookup_graph = graph.clone();
        let flags = self.cli_flags;
        let mut runner = Runner::new(template, self.cloud.clone())
            .compile_env(cenv)
            .mode(mode)
            .author(std::env::var("USER").unwrap_or_default())
            .path(path)
            .message(message)
            .before_run(move |exec: &TemplateExecution| {
                println!("{}", exec.template);
                if flags.dry_run {
                    println!("Dry run OK");
                    return Ok(false);
                }
                if flags.yes {
                    return Ok(true);
                }
                confirm("Confirm?")
            });
        for validator in default_validators(Arc::new(move |_entity: &str| Some(lookup_graph.clone()))) {
            runner = runner.validator(validator);
        }

        let Some(exec) = runner.run()? else {
            return Ok(true);
        };

        let mut stdout = io::stdout();
        DefaultPrinter.print(&mut stdout, &exec)?;
        let saved = self.store.save_execution(&exec)?;
        info!(id = exec.id(), path = ?saved, "execution saved");
        self.store.save_cloud_state(&self.cloud.snapshot())?;

        let stats = exec.stats();
        if stats.ko == 0 && exec.is_revertible() {
            println!("\nRevert this run with `cloudplan revert {}`", exec.id());
        }
        if !self.cli_flags.no_sync {
            self.sync()?;
        }
        Ok(stats.ko == 0)
    }

    fn services(&self) -> ServiceRegistry {
        let commands = CommandCatalog::global().snapshot();
        let cloud: Arc<dyn ControlPlane> = self.cloud.clone();
        ServiceRegistry::new(cloud, &self.config, &commands)
    }

    fn fetch_context(&self) -> FetchContext {
        FetchContext::new().with_force(self.cli_flags.force)
    }

    fn sync(&self) -> Result<()> {
        let services = self.services();
        let ctx = self.fetch_context();
        let runtime = tokio::runtime::Runtime::new().context("Failed to start tokio runtime")?;
        let (graph, result) = runtime.block_on(async {
            tokio::select! {
                out = services.fetch_all(&ctx) => out,
                _ = tokio::signal::ctrl_c() => {
                    ctx.cancel();
                    (Graph::new(), Err(cloudplan::fetch::FetchError::Cancelled))
                }
            }
        });
        if let Err(err) = &result {
            warn!("sync: {}", err);
        }
        if ctx.is_cancelled() {
            return Ok(());
        }
        info!(resources = graph.len(), "sync done");
        self.store.save_graph(&graph)
    }

    fn list(&self, resource_type: &str) -> Result<()> {
        let services = self.services();
        let service = services
            .service_for_type(resource_type)
            .ok_or_else(|| anyhow!("unknown resource type '{}'", resource_type))?;
        let ctx = self.fetch_context();
        let runtime = tokio::runtime::Runtime::new().context("Failed to start tokio runtime")?;
        let (graph, result) = runtime.block_on(service.fetch_by_type(&ctx, resource_type));
        result?;
        let mut stdout = io::stdout().lock();
        for res in graph.get_all_resources(&[resource_type]) {
            writeln!(stdout, "{}\t{}", res.id, res.name().unwrap_or(""))?;
        }
        Ok(())
    }

    fn show(&self, id: &str) -> Result<()> {
        let graph = self.store.load_graph()?;
        let res = graph
            .find_resource(id)
            .or_else(|| {
                graph
                    .find_resources_by_property(None, "Name", &serde_json::Value::from(id))
                    .into_iter()
                    .next()
            })
            .ok_or_else(|| anyhow!("resource '{}' not found in local graph", id))?;
        let mut stdout = io::stdout().lock();
        writeln!(stdout, "{} {}", res.kind, res.id)?;
        for (key, value) in &res.properties {
            writeln!(stdout, "    {}\t{}", key, value)?;
        }
        if let Some(parent) = graph.parent_of(&res) {
            writeln!(stdout, "parent: {} {}", parent.kind, parent.id)?;
        }
        for child in graph.children_of(&res) {
            writeln!(stdout, "child: {} {}", child.kind, child.id)?;
        }
        for applied in graph.list_resources_applied_on(&res) {
            writeln!(stdout, "applied on: {} {}", applied.kind, applied.id)?;
        }
        for dependent in graph.list_resources_depending_on(&res) {
            writeln!(stdout, "depending on: {} {}", dependent.kind, dependent.id)?;
        }
        Ok(())
    }

    fn log(&self, id: Option<&str>) -> Result<()> {
        let mut stdout = io::stdout();
        match id {
            Some(id) => {
                let exec = self.store.load_execution(id)?;
                LogPrinter.print(&mut stdout, &exec)?;
                writeln!(stdout, "\n{}", exec.template)?;
            }
            None => {
                for exec in self.store.list_executions()? {
                    LogPrinter.print(&mut stdout, &exec)?;
                }
            }
        }
        Ok(())
    }
}

/// Template text of `<action> <entity> [key=value ...]` arguments.
fn one_liner_text(args: &[String]) -> Result<String> {
    if args.len() < 2 {
        bail!("expected `<action> <entity> [key=value ...]`");
    }
    let mut line = format!("{} {}", args[0], args[1]);
    for arg in &args[2..] {
        line.push(' ');
        match arg.split_once('=') {
            Some((key, value)) if value.chars().any(char::is_whitespace) => {
                line.push_str(&format!("{}=\"{}\"", key, value));
            }
            _ => line.push_str(arg),
        }
    }
    Ok(line)
}

fn parse_fillers(args: &[String]) -> Result<BTreeMap<String, Value>> {
    let params = parse_params(&args.join(" "))?;
    params
        .into_iter()
        .map(|(key, value)| {
            value
                .to_value()
                .map(|v| (key.clone(), v))
                .ok_or_else(|| anyhow!("filler '{}' must be a plain value", key))
        })
        .collect()
}

fn prompt_hole(key: &str, paths: &[String], optional: bool) -> Option<Value> {
    let hint = if optional { " (optional)" } else { "" };
    eprint!("{}{} [{}]? ", key, hint, paths.join(", "));
    io::stderr().flush().ok()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line).ok()?;
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    parse_params(&format!("v={}", line))
        .ok()?
        .remove("v")
        .and_then(|v| v.to_value())
}

fn confirm(question: &str) -> Result<bool> {
    eprint!("{} (y/N) ", question);
    io::stderr().flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    Ok(matches!(line.trim(), "y" | "Y" | "yes"))
}
