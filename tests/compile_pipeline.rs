use std::collections::BTreeMap;

use cloudplan::template::compile::{
    check_invalid_references, compile_with, inject_commands, inline_variable_values,
    normalize_missing_required_as_holes, resolve_holes, Pass,
};
use cloudplan::template::{CompileEnv, CompileMode, EnvSlot, Value, compile, parse};

fn fillers(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

fn references_env() -> CompileEnv {
    CompileEnv::builder()
        .fillers(fillers(&[
            ("test.cidr", Value::from("10.0.2.0/24")),
            ("instance.type", Value::from("t2.micro")),
            ("instance.count", Value::from(42i64)),
        ]))
        .alias_resolver(|_, _, alias| (alias == "vpc").then(|| "vpc-1234".to_string()))
        .build()
}

const REFERENCES: &str = "subnetname = my-subnet
vpcref = @vpc
testsubnet = create subnet cidr={test.cidr} vpc=$vpcref name=$subnetname
update subnet id=$testsubnet public=true
instancecount = {instance.count}
create instance subnet=$testsubnet image=ami-12345 count=$instancecount name='my test instance'";

#[test]
fn references_values_and_holes_are_resolved() {
    let tpl = parse(REFERENCES).unwrap();
    let (compiled, env) = compile(&tpl, references_env(), CompileMode::Runner).unwrap();
    assert_eq!(
        compiled.to_string(),
        "testsubnet = create subnet cidr=10.0.2.0/24 name=my-subnet vpc=vpc-1234\n\
         update subnet id=$testsubnet public=true\n\
         create instance count=42 image=ami-12345 name='my test instance' subnet=$testsubnet type=t2.micro"
    );
    let processed: Vec<String> = env.get(EnvSlot::ProcessedFillers).into_keys().collect();
    assert_eq!(processed, vec!["instance.count", "instance.type", "test.cidr"]);
}

#[test]
fn resolved_declarations_are_dropped_even_when_unused() {
    let tpl = parse("unused = foo\nsize = {instance.type}\ncreate vpc cidr=10.0.0.0/16 name=$size").unwrap();
    let (compiled, env) = compile(&tpl, references_env(), CompileMode::Runner).unwrap();
    assert_eq!(compiled.to_string(), "create vpc cidr=10.0.0.0/16 name=t2.micro");
    let vars = env.resolved_vars();
    assert_eq!(vars["unused"], Value::from("foo"));
    assert_eq!(vars["size"], Value::from("t2.micro"));
}

#[test]
fn exclusive_params_reject_several_alternatives() {
    let tpl = parse("attach policy arn=arn:aws:iam::aws:policy/Admin user=alice group=admins").unwrap();
    let err = compile(&tpl, CompileEnv::default(), CompileMode::Runner).unwrap_err();
    assert!(
        err.to_string().contains("attach policy: only one of [user, group, role]"),
        "{}",
        err
    );

    let tpl = parse("create instance distro=ubuntu image=ami-1234 count=1 type=t2.micro name=web subnet=subnet-1").unwrap();
    let err = compile(&tpl, CompileEnv::default(), CompileMode::Runner).unwrap_err();
    assert!(err.to_string().contains("only one of [distro, image]"), "{}", err);
}

#[test]
fn compiling_twice_changes_nothing() {
    let tpl = parse(REFERENCES).unwrap();
    let (once, _) = compile(&tpl, references_env(), CompileMode::Runner).unwrap();
    let (twice, _) = compile(&once, references_env(), CompileMode::Runner).unwrap();
    assert_eq!(once.to_string(), twice.to_string());
    assert_eq!(once, twice);
}

#[test]
fn unexpected_param_is_named() {
    let tpl = parse("create instance invalid=any").unwrap();
    let err = compile(&tpl, CompileEnv::default(), CompileMode::Runner).unwrap_err();
    assert!(
        err.to_string().contains("unexpected param(s): invalid"),
        "{}",
        err
    );
}

#[test]
fn missing_required_params_become_holes() {
    let tpl = parse("create instance image=ami-123456").unwrap();
    let (normalized, _) = compile_with(
        &tpl,
        CompileEnv::default(),
        &[
            ("inject", inject_commands as Pass),
            ("normalize", normalize_missing_required_as_holes as Pass),
        ],
    )
    .unwrap();
    assert_eq!(
        normalized.to_string(),
        "create instance count={instance.count} image=ami-123456 name={instance.name} subnet={instance.subnet} type={instance.type}"
    );

    let err = compile(&tpl, CompileEnv::default(), CompileMode::Runner).unwrap_err();
    assert_eq!(
        err.to_string(),
        "template contains unresolved holes: [instance.count, instance.name, instance.subnet, instance.type]"
    );
}

#[test]
fn enum_validation_lists_the_choices() {
    let tpl = parse("check instance state=woot id=i-45678 timeout=180").unwrap();
    let err = compile(&tpl, CompileEnv::default(), CompileMode::Runner).unwrap_err();
    assert!(err.to_string().contains("expected any of"), "{}", err);
    assert!(err.to_string().starts_with("check instance: "), "{}", err);
}

#[test]
fn list_aliases_resolve_in_place() {
    let tpl = parse("create loadbalancer subnets=[sub-1234, sub-2345, @subalias, @subalias] name=mylb").unwrap();
    let env = CompileEnv::builder()
        .alias_resolver(|_, _, alias| (alias == "subalias").then(|| "sub-1111".to_string()))
        .build();
    let (compiled, _) = compile(&tpl, env, CompileMode::Runner).unwrap();
    assert_eq!(
        compiled.to_string(),
        "create loadbalancer name=mylb subnets=[sub-1234,sub-2345,sub-1111,sub-1111]"
    );
}

#[test]
fn concatenations_collapse_once_filled() {
    let tpl = parse(
        "name = \"ins$\\ta{nce}-\"+{instance.name}+{version}\ncreate instance image=ami-1234 name=$name subnet=subnet-{version}",
    )
    .unwrap();
    let env = CompileEnv::builder()
        .fillers(fillers(&[
            ("instance.name", Value::from("myinstance")),
            ("version", Value::from(10i64)),
        ]))
        .build();
    let (compiled, _) = compile_with(
        &tpl,
        env,
        &[
            ("inject", inject_commands as Pass),
            ("refs", check_invalid_references as Pass),
            ("inline", inline_variable_values as Pass),
            ("holes", resolve_holes as Pass),
            ("inline-again", inline_variable_values as Pass),
        ],
    )
    .unwrap();
    assert_eq!(
        compiled.to_string(),
        "create instance image=ami-1234 name='ins$\\ta{nce}-myinstance10' subnet=subnet-10"
    );
}

#[test]
fn unknown_command_fails_compile() {
    let tpl = parse("attach vpc id=vpc-1").unwrap();
    let err = compile(&tpl, CompileEnv::default(), CompileMode::Runner).unwrap_err();
    assert_eq!(err.to_string(), "unknown command 'attach vpc'");
}
