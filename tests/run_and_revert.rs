use std::sync::Arc;

use cloudplan::cloud::{ControlPlane, MemoryCloud};
use cloudplan::command::CommandCatalog;
use cloudplan::fetch::FetchContext;
use cloudplan::service::ServiceRegistry;
use cloudplan::template::{CompileMode, Runner, parse};
use cloudplan::{Config, Store};
use parking_lot::Mutex;
use tempfile::TempDir;

const INFRA: &str = "vpc = create vpc cidr=10.0.0.0/16 name=main
create subnet cidr=10.0.1.0/24 vpc=$vpc name=front";

#[test]
fn run_record_and_revert() {
    let temp = TempDir::new().unwrap();
    let store = Store::new(temp.path());
    store.init().unwrap();
    let cloud = Arc::new(MemoryCloud::new("eu-west-1").with_profile("ops"));

    let exec = Runner::new(parse(INFRA).unwrap(), cloud.clone())
        .author("alice")
        .message("network for the front")
        .run()
        .unwrap()
        .unwrap();
    let stats = exec.stats();
    assert_eq!((stats.ok, stats.ko, stats.total), (2, 0, 2));
    assert_eq!(exec.locale, "eu-west-1");
    assert_eq!(exec.profile, "ops");
    assert!(exec.is_revertible());

    let nodes: Vec<_> = exec.template.command_nodes().collect();
    let vpc_id = nodes[0].result.clone().unwrap();
    let subnet_id = nodes[1].result.clone().unwrap();
    assert_eq!(nodes[1].params["vpc"].to_string(), vpc_id);
    assert!(cloud.object("subnet", &subnet_id).is_some());

    let path = store.save_execution(&exec).unwrap();
    assert!(path.ends_with(format!("{}.json", exec.id())));
    let loaded = store.load_execution(exec.id()).unwrap();
    assert_eq!(loaded.template.to_string(), exec.template.to_string());
    assert_eq!(loaded.author, "alice");

    let undo = loaded.revert().unwrap();
    assert_eq!(
        undo.to_string(),
        format!("delete subnet id={}\ndelete vpc id={}", subnet_id, vpc_id)
    );

    let reverted = Runner::new(undo, cloud.clone())
        .mode(CompileMode::Replay)
        .message(format!("revert {}", exec.id()))
        .run()
        .unwrap()
        .unwrap();
    assert_eq!(reverted.stats().ko, 0);
    assert!(cloud.objects("vpc").is_empty());
    assert!(cloud.objects("subnet").is_empty());

    store.save_execution(&reverted).unwrap();
    let ids: Vec<String> = store
        .list_executions()
        .unwrap()
        .iter()
        .map(|e| e.id().to_string())
        .collect();
    assert_eq!(ids.len(), 2);
    assert!(ids[0] < ids[1]);
}

#[test]
fn failed_commands_are_recorded_and_block_revert() {
    let cloud = Arc::new(MemoryCloud::new("eu-west-1"));
    let exec = Runner::new(
        parse("create vpc cidr=10.0.0.0/16\ndelete subnet id=subnet-404").unwrap(),
        cloud.clone(),
    )
    .run()
    .unwrap()
    .unwrap();
    let stats = exec.stats();
    assert_eq!((stats.ok, stats.ko), (1, 1));
    assert!(!stats.all_ko());
    assert!(!exec.is_revertible());
    let failed = exec.template.command_nodes().nth(1).unwrap();
    assert!(failed.error.as_deref().unwrap().contains("no such subnet"));
}

#[test]
fn dry_run_failure_stops_before_anything_runs() {
    let cloud = Arc::new(MemoryCloud::new("eu-west-1"));
    let asked = Arc::new(Mutex::new(0));
    let counter = asked.clone();
    let outcome = Runner::new(
        parse("create instance userdata=/does-not-exist count=1 image=ami-123456 name=x subnet=y type=t2.micro")
            .unwrap(),
        cloud.clone(),
    )
    .before_run(move |_| {
        *counter.lock() += 1;
        Ok(true)
    })
    .run();
    let err = outcome.unwrap_err();
    assert!(format!("{:#}", err).contains("/does-not-exist"), "{:#}", err);
    assert_eq!(*asked.lock(), 0);
    assert!(cloud.objects("instance").is_empty());
}

#[test]
fn declined_confirmation_runs_nothing() {
    let cloud = Arc::new(MemoryCloud::new("eu-west-1"));
    let outcome = Runner::new(parse("create vpc cidr=10.0.0.0/16").unwrap(), cloud.clone())
        .before_run(|exec| {
            assert!(exec.template.to_string().starts_with("create vpc"));
            Ok(false)
        })
        .run()
        .unwrap();
    assert!(outcome.is_none());
    assert!(cloud.objects("vpc").is_empty());
}

#[tokio::test]
async fn synced_graph_resolves_aliases_after_a_run() {
    let temp = TempDir::new().unwrap();
    let store = Store::new(temp.path());
    let cloud = Arc::new(MemoryCloud::new("eu-west-1"));
    Runner::new(parse(INFRA).unwrap(), cloud.clone())
        .run()
        .unwrap()
        .unwrap();

    let plane: Arc<dyn ControlPlane> = cloud.clone();
    let services = ServiceRegistry::new(plane, &Config::new(), &CommandCatalog::global().snapshot());
    let (graph, result) = services.fetch_all(&FetchContext::new()).await;
    assert!(result.is_ok(), "{:?}", result);
    store.save_graph(&graph).unwrap();

    let graph = store.load_graph().unwrap();
    let vpc_id = graph.resolve_alias("subnet", "vpc", "main").unwrap();
    let subnet = graph.get_all_resources(&["subnet"]).remove(0);
    assert_eq!(graph.parent_of(&subnet).unwrap().id, vpc_id);
    assert_eq!(graph.resolve_alias("instance", "subnet", "front"), Some(subnet.id.clone()));
}
