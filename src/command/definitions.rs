//! Built-in command tables.
//!
//! Every `action entity` pair is declared once as a [`CommandDef`]: which api
//! and method it maps to, how template keys bind onto provider input fields
//! and where the result lives in the output. [`build`] turns a definition into
//! a runnable [`Command`] backed by one of two generic executors:
//!
//! - a *call* executor binding params into a JSON input for the control plane,
//! - a *check* executor polling a describe method until a resource reaches a
//!   wanted state.

use std::collections::BTreeMap;
use std::thread;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use serde_json::{Map, json};
use tracing::{debug, info, warn};

use super::registry::CommandCatalog;
use super::{Command, CommandError, Output, Params};
use crate::template::env::RunEnv;
use crate::template::params::{
    Reducer, Rule, Spec, Validator, all_of, key, one_of, only_one_of, opt, suggested,
};
use crate::template::value::Value;

/// First delay between two polls of a `check` command.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_secs(1);
/// Upper bound of the doubling poll delay.
pub const MAX_POLL_INTERVAL: Duration = Duration::from_secs(8);

/// Provider-side type of a bound parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AwsType {
    /// Plain string.
    Str,
    /// 64-bit integer.
    Int,
    /// Boolean parsed from `true` / `false`.
    Bool,
    /// Floating-point number.
    Float,
    /// List of strings; a scalar becomes a one-element list.
    StrList,
    /// Path whose file content is sent instead.
    FileContent,
}

/// Binding of one template key onto a provider input field.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamDef {
    /// Key as written in templates.
    pub template_key: &'static str,
    /// Input field name.
    pub aws_field: &'static str,
    /// Conversion applied before sending.
    pub aws_type: AwsType,
    /// Sent as a resource tag (`Tags.<field>`) instead of a plain field.
    pub as_tag: bool,
}

/// Executor family of a definition.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandKind {
    /// One control-plane call.
    Call,
    /// Poll `Describe*` until `state` is observed.
    Check {
        /// States accepted by the `state` param.
        states: &'static [&'static str],
    },
}

/// Declarative description of a command.
#[derive(Debug, Clone)]
pub struct CommandDef {
    /// Provider api, e.g. `ec2`.
    pub api: &'static str,
    /// Action token.
    pub action: &'static str,
    /// Entity token.
    pub entity: &'static str,
    /// Control-plane method.
    pub api_method: &'static str,
    /// Params that must be present.
    pub required: Vec<ParamDef>,
    /// Params that may be present.
    pub extra: Vec<ParamDef>,
    /// Dotted path of the result in the output; `None` when nothing is returned.
    pub output_extractor: Option<&'static str>,
    /// Whether the provider accepts a dry-run of this call.
    pub dry_run_supported: bool,
    /// Executor family.
    pub kind: CommandKind,
    /// Constant input fields.
    pub fixed: Vec<(&'static str, &'static str)>,
    validators: Vec<(&'static str, Validator)>,
    spec_override: Option<fn() -> Spec>,
}

fn def(api: &'static str, action: &'static str, entity: &'static str, method: &'static str) -> CommandDef {
    CommandDef {
        api,
        action,
        entity,
        api_method: method,
        required: Vec::new(),
        extra: Vec::new(),
        output_extractor: None,
        dry_run_supported: true,
        kind: CommandKind::Call,
        fixed: Vec::new(),
        validators: Vec::new(),
        spec_override: None,
    }
}

fn params(list: &[(&'static str, &'static str, AwsType)]) -> Vec<ParamDef> {
    list.iter()
        .map(|&(template_key, aws_field, aws_type)| ParamDef {
            template_key,
            aws_field,
            aws_type,
            as_tag: false,
        })
        .collect()
}

impl CommandDef {
    fn req(mut self, list: &[(&'static str, &'static str, AwsType)]) -> Self {
        self.required.extend(params(list));
        self
    }

    fn extra(mut self, list: &[(&'static str, &'static str, AwsType)]) -> Self {
        self.extra.extend(params(list));
        self
    }

    fn tag(mut self, template_key: &'static str, tag: &'static str) -> Self {
        self.extra.push(ParamDef {
            template_key,
            aws_field: tag,
            aws_type: AwsType::Str,
            as_tag: true,
        });
        self
    }

    fn output(mut self, path: &'static str) -> Self {
        self.output_extractor = Some(path);
        self
    }

    fn no_dry_run(mut self) -> Self {
        self.dry_run_supported = false;
        self
    }

    fn fixed(mut self, field: &'static str, value: &'static str) -> Self {
        self.fixed.push((field, value));
        self
    }

    fn validate(mut self, key: &'static str, validator: Validator) -> Self {
        self.validators.push((key, validator));
        self
    }

    fn spec_with(mut self, f: fn() -> Spec) -> Self {
        self.spec_override = Some(f);
        self
    }

    fn check(mut self, states: &'static [&'static str]) -> Self {
        self.kind = CommandKind::Check { states };
        self.dry_run_supported = false;
        self.req(&[
            ("id", "Ids", AwsType::StrList),
            ("state", "State", AwsType::Str),
            ("timeout", "Timeout", AwsType::Int),
        ])
        .validate("state", Validator::Enum(states.iter().map(|s| s.to_string()).collect()))
        .validate("timeout", Validator::IntRange(0, 86_400))
    }

    /// `action entity`
    pub fn name(&self) -> String {
        format!("{} {}", self.action, self.entity)
    }

    fn param(&self, template_key: &str) -> Option<&ParamDef> {
        self.required
            .iter()
            .chain(self.extra.iter())
            .find(|p| p.template_key == template_key)
    }

    /// Parameter specification: either the override or `required + opt(extra)`.
    pub fn spec(&self) -> Spec {
        let mut spec = match self.spec_override {
            Some(f) => f(),
            None => {
                let mut rules: Vec<Rule> = self.required.iter().map(|p| key(p.template_key)).collect();
                if !self.extra.is_empty() {
                    let extra: Vec<&str> = self.extra.iter().map(|p| p.template_key).collect();
                    rules.push(opt(&extra));
                }
                let rule = match rules.len() {
                    0 => opt(&[]),
                    1 => rules.remove(0),
                    _ => all_of(rules),
                };
                Spec::new(rule)
            }
        };
        for (k, v) in &self.validators {
            spec = spec.validator(k, v.clone());
        }
        spec
    }
}

fn bool_of(value: &Value) -> Result<bool, String> {
    match value.to_plain_string().to_ascii_lowercase().as_str() {
        "true" => Ok(true),
        "false" => Ok(false),
        other => Err(format!("expected true or false but got '{}'", other)),
    }
}

fn convert(p: &ParamDef, value: &Value) -> Result<serde_json::Value, String> {
    let err = |e: String| format!("param '{}': {}", p.template_key, e);
    Ok(match p.aws_type {
        AwsType::Str => json!(value.to_plain_string()),
        AwsType::Int => match value {
            Value::Int(n) => json!(n),
            other => json!(
                other
                    .to_plain_string()
                    .parse::<i64>()
                    .map_err(|e| err(e.to_string()))?
            ),
        },
        AwsType::Float => match value {
            Value::Float(f) => json!(f),
            Value::Int(n) => json!(*n as f64),
            other => json!(
                other
                    .to_plain_string()
                    .parse::<f64>()
                    .map_err(|e| err(e.to_string()))?
            ),
        },
        AwsType::Bool => json!(bool_of(value).map_err(err)?),
        AwsType::StrList => json!(
            value
                .to_list()
                .iter()
                .map(Value::to_plain_string)
                .collect::<Vec<_>>()
        ),
        AwsType::FileContent => {
            let path = value.to_plain_string();
            let content = std::fs::read_to_string(&path)
                .map_err(|e| err(format!("cannot read file '{}': {}", path, e)))?;
            json!(content)
        }
    })
}

/// Build the provider input for `params`.
///
/// Keys the definition does not know are skipped; validation reports them
/// before a template ever runs.
pub fn bind_input(def: &CommandDef, params: &Params) -> Result<serde_json::Value, CommandError> {
    let mut input = Map::new();
    let mut tags = Map::new();
    for (k, v) in params {
        let Some(p) = def.param(k) else {
            debug!(command = %def.name(), key = %k, "skipping unbound param");
            continue;
        };
        let converted = convert(p, v).map_err(CommandError::InvalidParams)?;
        if p.as_tag {
            tags.insert(p.aws_field.to_string(), converted);
        } else {
            input.insert(p.aws_field.to_string(), converted);
        }
    }
    if !tags.is_empty() {
        input.insert("Tags".to_string(), serde_json::Value::Object(tags));
    }
    for (field, value) in &def.fixed {
        input.insert(field.to_string(), json!(value));
    }
    Ok(serde_json::Value::Object(input))
}

/// Value at a dotted `path`; arrays yield their first element.
pub fn extract_path(output: &Output, path: &str) -> Option<String> {
    let mut current = output;
    for segment in path.split('.') {
        current = current.get(segment)?;
        if let serde_json::Value::Array(items) = current {
            current = items.first()?;
        }
    }
    match current {
        serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn run_call(def: &CommandDef, env: &RunEnv, params: &Params) -> Result<Output, CommandError> {
    let input = bind_input(def, params)?;
    debug!(command = %def.name(), method = def.api_method, dry_run = env.is_dry_run(), "calling provider");
    let output = env
        .cloud()
        .call(def.api, def.api_method, &input, env.is_dry_run())?;
    Ok(output)
}

/// Current state of a resource, `not-found` when it does not exist.
fn current_state(def: &CommandDef, env: &RunEnv, id: &str) -> Result<String, CommandError> {
    match env
        .cloud()
        .call(def.api, def.api_method, &json!({ "Ids": [id] }), false)
    {
        Ok(out) => Ok(out["Items"]
            .get(0)
            .and_then(|item| item["State"].as_str())
            .map(str::to_string)
            .unwrap_or_else(|| "not-found".to_string())),
        Err(e) if e.is_not_found() => Ok("not-found".to_string()),
        Err(e) => Err(e.into()),
    }
}

fn run_check(def: &CommandDef, env: &RunEnv, params: &Params) -> Result<Output, CommandError> {
    let param = |k: &str| {
        params
            .get(k)
            .ok_or_else(|| CommandError::InvalidParams(format!("missing required param '{}'", k)))
    };
    let id = param("id")?.to_plain_string();
    let wanted = param("state")?.to_plain_string();
    let secs = match param("timeout")? {
        Value::Int(n) if *n >= 0 => *n as u64,
        other => other
            .to_plain_string()
            .parse::<u64>()
            .map_err(|e| CommandError::InvalidParams(format!("param 'timeout': {}", e)))?,
    };
    let deadline = Instant::now() + Duration::from_secs(secs);
    let mut interval = MIN_POLL_INTERVAL;
    loop {
        let state = current_state(def, env, &id)?;
        if state.eq_ignore_ascii_case(&wanted) {
            info!(entity = def.entity, %id, %state, "check done");
            return Ok(json!({ "Id": id, "State": state }));
        }
        if Instant::now() >= deadline {
            return Err(CommandError::Timeout {
                description: format!("waiting for {} {} to be {}", def.entity, id, wanted),
                secs,
            });
        }
        info!(entity = def.entity, %id, %state, wanted = %wanted, "check: waiting");
        thread::sleep(interval);
        interval = (interval * 2).min(MAX_POLL_INTERVAL);
    }
}

/// Turn a definition into a runnable command.
pub fn build(def: &CommandDef) -> Command {
    let owned = def.clone();
    let cmd = match def.kind {
        CommandKind::Call => Command::new(def.action, def.entity, def.api, def.spec(), move |env, params| {
            run_call(&owned, env, params)
        }),
        CommandKind::Check { .. } => Command::new(def.action, def.entity, def.api, def.spec(), move |env, params| {
            run_check(&owned, env, params)
        }),
    };
    let cmd = if def.dry_run_supported {
        cmd
    } else {
        cmd.without_dry_run()
    };
    match def.output_extractor {
        Some(path) => cmd.with_extract(move |out| extract_path(out, path)),
        None => cmd,
    }
}

/// Image ids for the distro queries understood by `distro=`.
///
/// A query reads `owner[:distro[:variant]]`.
static DISTROS: &[(&str, &str)] = &[
    ("amazonlinux", "ami-amzn2"),
    ("canonical", "ami-ubuntu"),
    ("ubuntu", "ami-ubuntu"),
    ("debian", "ami-debian"),
    ("redhat", "ami-rhel"),
    ("centos", "ami-centos"),
    ("suse", "ami-sles"),
    ("coreos", "ami-coreos"),
    ("windows", "ami-windows"),
];

/// Resolve a distro query to an image id.
pub fn image_for_distro(query: &str) -> Result<String, String> {
    let mut parts = query.split(':');
    let owner = parts.next().unwrap_or_default().to_ascii_lowercase();
    let base = DISTROS
        .iter()
        .find(|(name, _)| *name == owner)
        .map(|(_, image)| *image)
        .ok_or_else(|| format!("unknown distro '{}'", query))?;
    let suffix: Vec<String> = parts
        .filter(|p| !p.is_empty())
        .map(|p| {
            p.chars()
                .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
                .collect()
        })
        .collect();
    if suffix.is_empty() {
        Ok(base.to_string())
    } else {
        Ok(format!("{}-{}", base, suffix.join("-")))
    }
}

fn distro_reducer() -> Reducer {
    Reducer::new(&["distro"], &["image"], |values| {
        let distro = values
            .get("distro")
            .map(Value::to_plain_string)
            .unwrap_or_default();
        let image = image_for_distro(&distro)?;
        Ok(BTreeMap::from([("image".to_string(), Value::from(image))]))
    })
}

fn create_instance_spec() -> Spec {
    Spec::new(all_of(vec![
        only_one_of(vec![key("distro"), key("image")]),
        key("count"),
        key("type"),
        key("name"),
        key("subnet"),
        suggested(&["keypair", "securitygroup"]),
        opt(&["ip", "userdata", "lock", "role"]),
    ]))
    .reducer(distro_reducer())
    .validator("ip", Validator::Ip)
    .validator("userdata", Validator::FileExists)
    .validator("count", Validator::IntRange(1, 1000))
}

fn create_launchconfiguration_spec() -> Spec {
    Spec::new(all_of(vec![
        only_one_of(vec![key("distro"), key("image")]),
        key("name"),
        key("type"),
        suggested(&["keypair", "securitygroups"]),
        opt(&["public", "role", "spotprice", "userdata"]),
    ]))
    .reducer(distro_reducer())
    .validator("userdata", Validator::FileExists)
}

fn policy_attachment_spec() -> Spec {
    Spec::new(all_of(vec![
        key("arn"),
        only_one_of(vec![key("user"), key("group"), key("role")]),
    ]))
}

const INSTANCE_STATES: &[&str] = &[
    "pending",
    "running",
    "shutting-down",
    "terminated",
    "stopping",
    "stopped",
    "not-found",
];
const SECURITYGROUP_STATES: &[&str] = &["in-use", "unused", "not-found"];
const VOLUME_STATES: &[&str] = &["available", "in-use", "creating", "deleting", "not-found"];
const LOADBALANCER_STATES: &[&str] = &["provisioning", "active", "failed", "not-found"];
const DATABASE_STATES: &[&str] = &[
    "available",
    "backing-up",
    "creating",
    "deleting",
    "failed",
    "modifying",
    "rebooting",
    "starting",
    "stopped",
    "stopping",
    "not-found",
];
const NATGATEWAY_STATES: &[&str] = &["pending", "available", "deleting", "deleted", "failed", "not-found"];

/// Every built-in definition.
pub static DEFINITIONS: Lazy<Vec<CommandDef>> = Lazy::new(|| {
    let mut defs = Vec::new();
    defs.extend(infra());
    defs.extend(access());
    defs.extend(storage());
    defs.extend(messaging());
    defs.extend(dns());
    defs.extend(lambda());
    defs.extend(monitoring());
    defs
});

fn infra() -> Vec<CommandDef> {
    use AwsType::*;
    vec![
        def("ec2", "create", "vpc", "CreateVpc")
            .req(&[("cidr", "CidrBlock", Str)])
            .tag("name", "Name")
            .validate("cidr", Validator::Cidr)
            .output("Id"),
        def("ec2", "delete", "vpc", "DeleteVpc").req(&[("id", "VpcId", Str)]),
        def("ec2", "create", "subnet", "CreateSubnet")
            .req(&[("cidr", "CidrBlock", Str), ("vpc", "VpcId", Str)])
            .extra(&[("availabilityzone", "AvailabilityZone", Str)])
            .tag("name", "Name")
            .validate("cidr", Validator::Cidr)
            .output("Id"),
        def("ec2", "update", "subnet", "ModifySubnetAttribute")
            .req(&[("id", "SubnetId", Str)])
            .extra(&[("public", "MapPublicIpOnLaunch", Bool)])
            .validate("public", Validator::Bool),
        def("ec2", "delete", "subnet", "DeleteSubnet").req(&[("id", "SubnetId", Str)]),
        def("ec2", "create", "instance", "RunInstances")
            .req(&[
                ("image", "ImageId", Str),
                ("count", "MaxCount", Int),
                ("type", "InstanceType", Str),
                ("subnet", "SubnetId", Str),
            ])
            .extra(&[
                ("keypair", "KeyName", Str),
                ("securitygroup", "SecurityGroupIds", StrList),
                ("ip", "PrivateIpAddress", Str),
                ("userdata", "UserData", FileContent),
                ("lock", "DisableApiTermination", Bool),
                ("role", "IamInstanceProfile", Str),
            ])
            .tag("name", "Name")
            .spec_with(create_instance_spec)
            .output("Id"),
        def("ec2", "update", "instance", "ModifyInstanceAttribute")
            .req(&[("id", "InstanceId", Str)])
            .extra(&[("type", "InstanceType", Str), ("lock", "DisableApiTermination", Bool)]),
        def("ec2", "delete", "instance", "TerminateInstances").req(&[("id", "InstanceIds", StrList)]),
        def("ec2", "start", "instance", "StartInstances")
            .req(&[("id", "InstanceIds", StrList)])
            .output("Ids"),
        def("ec2", "stop", "instance", "StopInstances")
            .req(&[("id", "InstanceIds", StrList)])
            .output("Ids"),
        def("ec2", "check", "instance", "DescribeInstances").check(INSTANCE_STATES),
        def("ec2", "create", "securitygroup", "CreateSecurityGroup")
            .req(&[
                ("name", "GroupName", Str),
                ("vpc", "VpcId", Str),
                ("description", "Description", Str),
            ])
            .output("Id"),
        def("ec2", "delete", "securitygroup", "DeleteSecurityGroup").req(&[("id", "GroupId", Str)]),
        def("ec2", "check", "securitygroup", "DescribeSecurityGroups").check(SECURITYGROUP_STATES),
        def("ec2", "attach", "securitygroup", "AttachSecurityGroup")
            .req(&[("id", "GroupId", Str), ("instance", "InstanceId", Str)]),
        def("ec2", "detach", "securitygroup", "DetachSecurityGroup")
            .req(&[("id", "GroupId", Str), ("instance", "InstanceId", Str)]),
        def("ec2", "create", "internetgateway", "CreateInternetGateway")
            .tag("name", "Name")
            .output("Id"),
        def("ec2", "delete", "internetgateway", "DeleteInternetGateway")
            .req(&[("id", "InternetGatewayId", Str)]),
        def("ec2", "attach", "internetgateway", "AttachInternetGateway")
            .req(&[("id", "InternetGatewayId", Str), ("vpc", "VpcId", Str)]),
        def("ec2", "detach", "internetgateway", "DetachInternetGateway")
            .req(&[("id", "InternetGatewayId", Str), ("vpc", "VpcId", Str)]),
        def("ec2", "create", "routetable", "CreateRouteTable")
            .req(&[("vpc", "VpcId", Str)])
            .output("Id"),
        def("ec2", "delete", "routetable", "DeleteRouteTable").req(&[("id", "RouteTableId", Str)]),
        def("ec2", "attach", "routetable", "AssociateRouteTable")
            .req(&[("id", "RouteTableId", Str), ("subnet", "SubnetId", Str)])
            .output("AssociationId"),
        def("ec2", "detach", "routetable", "DisassociateRouteTable")
            .req(&[("association", "AssociationId", Str)]),
        def("ec2", "create", "keypair", "CreateKeyPair")
            .req(&[("name", "KeyName", Str)])
            .extra(&[("encrypted", "Encrypted", Bool)])
            .output("Id"),
        def("ec2", "delete", "keypair", "DeleteKeyPair").req(&[("name", "KeyName", Str)]),
        def("ec2", "create", "volume", "CreateVolume")
            .req(&[("availabilityzone", "AvailabilityZone", Str), ("size", "Size", Int)])
            .output("Id"),
        def("ec2", "delete", "volume", "DeleteVolume").req(&[("id", "VolumeId", Str)]),
        def("ec2", "attach", "volume", "AttachVolume").req(&[
            ("id", "VolumeId", Str),
            ("instance", "InstanceId", Str),
            ("device", "Device", Str),
        ]),
        def("ec2", "detach", "volume", "DetachVolume")
            .req(&[
                ("id", "VolumeId", Str),
                ("instance", "InstanceId", Str),
                ("device", "Device", Str),
            ])
            .extra(&[("force", "Force", Bool)]),
        def("ec2", "check", "volume", "DescribeVolumes").check(VOLUME_STATES),
        def("ec2", "create", "elasticip", "AllocateAddress")
            .req(&[("domain", "Domain", Str)])
            .validate("domain", one_of(&["vpc", "standard"]))
            .output("Id"),
        def("ec2", "delete", "elasticip", "ReleaseAddress").req(&[("id", "AllocationId", Str)]),
        def("ec2", "attach", "elasticip", "AssociateAddress")
            .req(&[("id", "AllocationId", Str), ("instance", "InstanceId", Str)]),
        def("ec2", "detach", "elasticip", "DisassociateAddress")
            .req(&[("id", "AllocationId", Str), ("instance", "InstanceId", Str)]),
        def("ec2", "create", "natgateway", "CreateNatGateway")
            .req(&[("elasticip-id", "AllocationId", Str), ("subnet", "SubnetId", Str)])
            .output("Id"),
        def("ec2", "delete", "natgateway", "DeleteNatGateway").req(&[("id", "NatGatewayId", Str)]),
        def("ec2", "check", "natgateway", "DescribeNatGateways").check(NATGATEWAY_STATES),
        def("ec2", "create", "image", "CreateImage")
            .req(&[("instance", "InstanceId", Str), ("name", "Name", Str)])
            .extra(&[("description", "Description", Str), ("reboot", "Reboot", Bool)])
            .output("Id"),
        def("ec2", "delete", "image", "DeregisterImage")
            .req(&[("id", "ImageId", Str)])
            .extra(&[("delete-snapshots", "DeleteSnapshots", Bool)]),
        def("ec2", "copy", "image", "CopyImage")
            .req(&[
                ("name", "Name", Str),
                ("source-id", "SourceImageId", Str),
                ("source-region", "SourceRegion", Str),
            ])
            .extra(&[("description", "Description", Str)])
            .output("Id"),
        def("ec2", "create", "snapshot", "CreateSnapshot")
            .req(&[("volume", "VolumeId", Str)])
            .extra(&[("description", "Description", Str)])
            .output("Id"),
        def("ec2", "delete", "snapshot", "DeleteSnapshot").req(&[("id", "SnapshotId", Str)]),
        def("ec2", "copy", "snapshot", "CopySnapshot")
            .req(&[("source-id", "SourceSnapshotId", Str), ("source-region", "SourceRegion", Str)])
            .extra(&[("description", "Description", Str)])
            .output("Id"),
        def("ec2", "create", "tag", "CreateTags")
            .req(&[("resource", "Resource", Str), ("key", "Key", Str), ("value", "Value", Str)])
            .no_dry_run(),
        def("ec2", "delete", "tag", "DeleteTags")
            .req(&[("resource", "Resource", Str), ("key", "Key", Str), ("value", "Value", Str)])
            .no_dry_run(),
        def("elbv2", "create", "loadbalancer", "CreateLoadBalancer")
            .req(&[("name", "Name", Str), ("subnets", "Subnets", StrList)])
            .extra(&[
                ("iptype", "IpAddressType", Str),
                ("scheme", "Scheme", Str),
                ("securitygroups", "SecurityGroups", StrList),
            ])
            .validate("iptype", one_of(&["ipv4", "dualstack"]))
            .validate("scheme", one_of(&["internet-facing", "internal"]))
            .no_dry_run()
            .output("Id"),
        def("elbv2", "delete", "loadbalancer", "DeleteLoadBalancer")
            .req(&[("id", "LoadBalancerArn", Str)])
            .no_dry_run(),
        def("elbv2", "check", "loadbalancer", "DescribeLoadBalancers").check(LOADBALANCER_STATES),
        def("elbv2", "create", "targetgroup", "CreateTargetGroup")
            .req(&[
                ("name", "Name", Str),
                ("port", "Port", Int),
                ("protocol", "Protocol", Str),
                ("vpc", "VpcId", Str),
            ])
            .extra(&[("healthcheckpath", "HealthCheckPath", Str)])
            .validate("protocol", one_of(&["HTTP", "HTTPS"]))
            .no_dry_run()
            .output("Id"),
        def("elbv2", "delete", "targetgroup", "DeleteTargetGroup")
            .req(&[("id", "TargetGroupArn", Str)])
            .no_dry_run(),
        def("elbv2", "create", "listener", "CreateListener")
            .req(&[
                ("actiontype", "ActionType", Str),
                ("loadbalancer", "LoadBalancerArn", Str),
                ("port", "Port", Int),
                ("protocol", "Protocol", Str),
                ("targetgroup", "TargetGroupArn", Str),
            ])
            .extra(&[("certificate", "CertificateArn", Str)])
            .validate("actiontype", one_of(&["forward"]))
            .validate("protocol", one_of(&["HTTP", "HTTPS"]))
            .no_dry_run()
            .output("Id"),
        def("elbv2", "delete", "listener", "DeleteListener")
            .req(&[("id", "ListenerArn", Str)])
            .no_dry_run(),
        def("rds", "create", "database", "CreateDBInstance")
            .req(&[
                ("type", "DBInstanceClass", Str),
                ("id", "DBInstanceIdentifier", Str),
                ("engine", "Engine", Str),
                ("password", "MasterUserPassword", Str),
                ("username", "MasterUsername", Str),
                ("size", "AllocatedStorage", Int),
            ])
            .extra(&[
                ("dbname", "DBName", Str),
                ("subnetgroup", "DBSubnetGroupName", Str),
                ("public", "PubliclyAccessible", Bool),
            ])
            .validate(
                "engine",
                one_of(&["mysql", "mariadb", "postgres", "aurora", "oracle-se", "sqlserver-ex"]),
            )
            .validate("password", Validator::MinLength(8))
            .no_dry_run()
            .output("Id"),
        def("rds", "delete", "database", "DeleteDBInstance")
            .req(&[("id", "DBInstanceIdentifier", Str)])
            .extra(&[
                ("skipsnapshot", "SkipFinalSnapshot", Bool),
                ("snapshot", "FinalDBSnapshotIdentifier", Str),
            ])
            .no_dry_run(),
        def("rds", "start", "database", "StartDBInstance")
            .req(&[("id", "DBInstanceIdentifier", Str)])
            .no_dry_run()
            .output("Id"),
        def("rds", "stop", "database", "StopDBInstance")
            .req(&[("id", "DBInstanceIdentifier", Str)])
            .no_dry_run()
            .output("Id"),
        def("rds", "check", "database", "DescribeDBInstances").check(DATABASE_STATES),
        def("rds", "create", "dbsubnetgroup", "CreateDBSubnetGroup")
            .req(&[
                ("name", "DBSubnetGroupName", Str),
                ("description", "DBSubnetGroupDescription", Str),
                ("subnets", "SubnetIds", StrList),
            ])
            .no_dry_run()
            .output("Id"),
        def("rds", "delete", "dbsubnetgroup", "DeleteDBSubnetGroup")
            .req(&[("name", "DBSubnetGroupName", Str)])
            .no_dry_run(),
        def("autoscaling", "create", "launchconfiguration", "CreateLaunchConfiguration")
            .req(&[
                ("image", "ImageId", Str),
                ("name", "LaunchConfigurationName", Str),
                ("type", "InstanceType", Str),
            ])
            .extra(&[
                ("keypair", "KeyName", Str),
                ("public", "AssociatePublicIpAddress", Bool),
                ("role", "IamInstanceProfile", Str),
                ("securitygroups", "SecurityGroups", StrList),
                ("spotprice", "SpotPrice", Str),
                ("userdata", "UserData", FileContent),
            ])
            .spec_with(create_launchconfiguration_spec)
            .no_dry_run()
            .output("Id"),
        def("autoscaling", "delete", "launchconfiguration", "DeleteLaunchConfiguration")
            .req(&[("name", "LaunchConfigurationName", Str)])
            .no_dry_run(),
        def("autoscaling", "create", "scalinggroup", "CreateAutoScalingGroup")
            .req(&[
                ("launchconfiguration", "LaunchConfigurationName", Str),
                ("max-size", "MaxSize", Int),
                ("min-size", "MinSize", Int),
                ("name", "AutoScalingGroupName", Str),
                ("subnets", "VPCZoneIdentifier", StrList),
            ])
            .extra(&[
                ("cooldown", "DefaultCooldown", Int),
                ("desired-capacity", "DesiredCapacity", Int),
                ("healthcheck-grace-period", "HealthCheckGracePeriod", Int),
                ("healthcheck-type", "HealthCheckType", Str),
                ("new-instances-protected", "NewInstancesProtectedFromScaleIn", Bool),
                ("targetgroups", "TargetGroupARNs", StrList),
            ])
            .validate("healthcheck-type", one_of(&["EC2", "ELB"]))
            .no_dry_run()
            .output("Id"),
        def("autoscaling", "update", "scalinggroup", "UpdateAutoScalingGroup")
            .req(&[("name", "AutoScalingGroupName", Str)])
            .extra(&[
                ("desired-capacity", "DesiredCapacity", Int),
                ("launchconfiguration", "LaunchConfigurationName", Str),
                ("max-size", "MaxSize", Int),
                ("min-size", "MinSize", Int),
            ])
            .no_dry_run(),
        def("autoscaling", "delete", "scalinggroup", "DeleteAutoScalingGroup")
            .req(&[("name", "AutoScalingGroupName", Str)])
            .extra(&[("force", "ForceDelete", Bool)])
            .no_dry_run(),
        def("autoscaling", "create", "scalingpolicy", "PutScalingPolicy")
            .req(&[
                ("adjustment-type", "AdjustmentType", Str),
                ("scalinggroup", "AutoScalingGroupName", Str),
                ("name", "PolicyName", Str),
                ("adjustment-scaling", "ScalingAdjustment", Int),
            ])
            .extra(&[("cooldown", "Cooldown", Int)])
            .validate(
                "adjustment-type",
                one_of(&["ChangeInCapacity", "ExactCapacity", "PercentChangeInCapacity"]),
            )
            .no_dry_run()
            .output("Id"),
        def("autoscaling", "delete", "scalingpolicy", "DeletePolicy")
            .req(&[("id", "PolicyARN", Str)])
            .no_dry_run(),
    ]
}

fn access() -> Vec<CommandDef> {
    use AwsType::*;
    vec![
        def("iam", "create", "user", "CreateUser")
            .req(&[("name", "UserName", Str)])
            .no_dry_run()
            .output("Id"),
        def("iam", "delete", "user", "DeleteUser")
            .req(&[("name", "UserName", Str)])
            .no_dry_run(),
        def("iam", "create", "group", "CreateGroup")
            .req(&[("name", "GroupName", Str)])
            .no_dry_run()
            .output("Id"),
        def("iam", "delete", "group", "DeleteGroup")
            .req(&[("name", "GroupName", Str)])
            .no_dry_run(),
        def("iam", "create", "role", "CreateRole")
            .req(&[("name", "RoleName", Str)])
            .extra(&[
                ("principal-account", "PrincipalAccount", Str),
                ("principal-service", "PrincipalService", Str),
                ("principal-user", "PrincipalUser", Str),
            ])
            .no_dry_run()
            .output("Id"),
        def("iam", "delete", "role", "DeleteRole")
            .req(&[("name", "RoleName", Str)])
            .no_dry_run(),
        def("iam", "create", "policy", "CreatePolicy")
            .req(&[
                ("name", "Name", Str),
                ("effect", "Effect", Str),
                ("action", "Action", StrList),
                ("resource", "Resource", StrList),
            ])
            .extra(&[("description", "Description", Str), ("conditions", "Conditions", StrList)])
            .validate("effect", one_of(&["Allow", "Deny"]))
            .no_dry_run()
            .output("Arn"),
        def("iam", "delete", "policy", "DeletePolicy")
            .req(&[("arn", "PolicyArn", Str)])
            .extra(&[("all-versions", "AllVersions", Bool)])
            .no_dry_run(),
        def("iam", "attach", "policy", "AttachPolicy")
            .req(&[("arn", "PolicyArn", Str)])
            .extra(&[("user", "UserName", Str), ("group", "GroupName", Str), ("role", "RoleName", Str)])
            .spec_with(policy_attachment_spec)
            .no_dry_run(),
        def("iam", "detach", "policy", "DetachPolicy")
            .req(&[("arn", "PolicyArn", Str)])
            .extra(&[("user", "UserName", Str), ("group", "GroupName", Str), ("role", "RoleName", Str)])
            .spec_with(policy_attachment_spec)
            .no_dry_run(),
        def("iam", "create", "accesskey", "CreateAccessKey")
            .req(&[("user", "UserName", Str)])
            .no_dry_run()
            .output("Id"),
        def("iam", "delete", "accesskey", "DeleteAccessKey")
            .req(&[("id", "AccessKeyId", Str)])
            .extra(&[("user", "UserName", Str)])
            .no_dry_run(),
        def("iam", "create", "instanceprofile", "CreateInstanceProfile")
            .req(&[("name", "InstanceProfileName", Str)])
            .no_dry_run()
            .output("Id"),
        def("iam", "delete", "instanceprofile", "DeleteInstanceProfile")
            .req(&[("name", "InstanceProfileName", Str)])
            .no_dry_run(),
    ]
}

fn storage() -> Vec<CommandDef> {
    use AwsType::*;
    vec![
        def("s3", "create", "bucket", "CreateBucket")
            .req(&[("name", "Bucket", Str)])
            .extra(&[("acl", "ACL", Str)])
            .validate("acl", one_of(&["private", "public-read", "public-read-write", "authenticated-read"]))
            .no_dry_run()
            .output("Id"),
        def("s3", "delete", "bucket", "DeleteBucket")
            .req(&[("name", "Bucket", Str)])
            .no_dry_run(),
        def("s3", "create", "s3object", "PutObject")
            .req(&[("bucket", "Bucket", Str), ("file", "Body", FileContent), ("name", "Key", Str)])
            .validate("file", Validator::FileExists)
            .no_dry_run()
            .output("Id"),
        def("s3", "delete", "s3object", "DeleteObject")
            .req(&[("bucket", "Bucket", Str), ("name", "Key", Str)])
            .no_dry_run(),
    ]
}

fn messaging() -> Vec<CommandDef> {
    use AwsType::*;
    vec![
        def("sns", "create", "topic", "CreateTopic")
            .req(&[("name", "Name", Str)])
            .no_dry_run()
            .output("Id"),
        def("sns", "delete", "topic", "DeleteTopic")
            .req(&[("id", "TopicArn", Str)])
            .no_dry_run(),
        def("sns", "create", "subscription", "Subscribe")
            .req(&[("endpoint", "Endpoint", Str), ("protocol", "Protocol", Str), ("topic", "TopicArn", Str)])
            .validate(
                "protocol",
                one_of(&["http", "https", "email", "email-json", "sms", "sqs", "application", "lambda"]),
            )
            .no_dry_run()
            .output("Id"),
        def("sns", "delete", "subscription", "Unsubscribe")
            .req(&[("id", "SubscriptionArn", Str)])
            .no_dry_run(),
        def("sqs", "create", "queue", "CreateQueue")
            .req(&[("name", "QueueName", Str)])
            .extra(&[
                ("delay", "DelaySeconds", Int),
                ("max-msg-size", "MaximumMessageSize", Int),
                ("retention-period", "MessageRetentionPeriod", Int),
                ("policy", "Policy", Str),
                ("msg-wait", "ReceiveMessageWaitTimeSeconds", Int),
                ("redrive-policy", "RedrivePolicy", Str),
                ("visibility-timeout", "VisibilityTimeout", Int),
            ])
            .no_dry_run()
            .output("Id"),
        def("sqs", "delete", "queue", "DeleteQueue")
            .req(&[("id", "QueueUrl", Str)])
            .no_dry_run(),
    ]
}

fn dns() -> Vec<CommandDef> {
    use AwsType::*;
    let record = |action: &'static str, change: &'static str| {
        def("route53", action, "record", "ChangeResourceRecordSets")
            .req(&[
                ("name", "Name", Str),
                ("ttl", "TTL", Int),
                ("type", "Type", Str),
                ("value", "Value", Str),
                ("zone", "Zone", Str),
            ])
            .extra(&[("comment", "Comment", Str)])
            .fixed("Action", change)
            .validate(
                "type",
                one_of(&["A", "AAAA", "CNAME", "MX", "NS", "PTR", "SOA", "SPF", "SRV", "TXT"]),
            )
            .no_dry_run()
    };
    vec![
        def("route53", "create", "zone", "CreateHostedZone")
            .req(&[("callerreference", "CallerReference", Str), ("name", "Name", Str)])
            .extra(&[
                ("comment", "Comment", Str),
                ("delegationsetid", "DelegationSetId", Str),
                ("isprivate", "PrivateZone", Bool),
                ("vpcid", "VPCId", Str),
                ("vpcregion", "VPCRegion", Str),
            ])
            .no_dry_run()
            .output("Id"),
        def("route53", "delete", "zone", "DeleteHostedZone")
            .req(&[("id", "Id", Str)])
            .no_dry_run(),
        record("create", "CREATE"),
        record("delete", "DELETE"),
    ]
}

fn lambda() -> Vec<CommandDef> {
    use AwsType::*;
    vec![
        def("lambda", "create", "function", "CreateFunction")
            .req(&[
                ("name", "Name", Str),
                ("handler", "Handler", Str),
                ("role", "Role", Str),
                ("runtime", "Runtime", Str),
            ])
            .extra(&[
                ("bucket", "S3Bucket", Str),
                ("object", "S3Key", Str),
                ("zipfile", "ZipFile", FileContent),
                ("description", "Description", Str),
                ("memory", "MemorySize", Int),
                ("timeout", "Timeout", Int),
                ("publish", "Publish", Bool),
            ])
            .no_dry_run()
            .output("Id"),
        def("lambda", "delete", "function", "DeleteFunction")
            .req(&[("id", "FunctionName", Str)])
            .no_dry_run(),
    ]
}

fn monitoring() -> Vec<CommandDef> {
    use AwsType::*;
    vec![
        def("cloudwatch", "create", "alarm", "PutMetricAlarm")
            .req(&[
                ("name", "AlarmName", Str),
                ("operator", "ComparisonOperator", Str),
                ("metric", "MetricName", Str),
                ("namespace", "Namespace", Str),
                ("evaluation-periods", "EvaluationPeriods", Int),
                ("period", "Period", Int),
                ("statistic-function", "Statistic", Str),
                ("threshold", "Threshold", Float),
            ])
            .extra(&[
                ("enabled", "ActionsEnabled", Bool),
                ("alarm-actions", "AlarmActions", StrList),
                ("insufficientdata-actions", "InsufficientDataActions", StrList),
                ("ok-actions", "OKActions", StrList),
                ("description", "AlarmDescription", Str),
                ("unit", "Unit", Str),
                ("dimensions", "Dimensions", StrList),
            ])
            .validate(
                "operator",
                one_of(&[
                    "GreaterThanOrEqualToThreshold",
                    "GreaterThanThreshold",
                    "LessThanThreshold",
                    "LessThanOrEqualToThreshold",
                ]),
            )
            .validate("statistic-function", one_of(&["SampleCount", "Average", "Sum", "Minimum", "Maximum"]))
            .no_dry_run()
            .output("Id"),
        def("cloudwatch", "delete", "alarm", "DeleteAlarms")
            .req(&[("name", "AlarmNames", StrList)])
            .no_dry_run(),
        def("cloudwatch", "start", "alarm", "EnableAlarmActions")
            .req(&[("names", "AlarmNames", StrList)])
            .no_dry_run()
            .output("Ids"),
        def("cloudwatch", "stop", "alarm", "DisableAlarmActions")
            .req(&[("names", "AlarmNames", StrList)])
            .no_dry_run()
            .output("Ids"),
    ]
}

/// Hooks layered on top of the generic executors.
fn with_hooks(def: &CommandDef, cmd: Command) -> Command {
    match (def.action, def.entity) {
        ("create", "accesskey") => cmd.with_after_run(|_, out| {
            if let Some(id) = out["Id"].as_str() {
                warn!(access_key = id, "secret access key is only shown once");
            }
            Ok(())
        }),
        ("delete", "instance") => cmd.with_before_run(|env, params| {
            let Some(id) = params.get("id") else {
                return Ok(());
            };
            if env.is_dry_run() {
                return Ok(());
            }
            for id in id.to_list() {
                let id = id.to_plain_string();
                let out = env
                    .cloud()
                    .call("ec2", "DescribeInstances", &json!({ "Ids": [id] }), false)?;
                let locked = out["Items"]
                    .get(0)
                    .is_some_and(|item| item["DisableApiTermination"].as_bool() == Some(true));
                if locked {
                    return Err(CommandError::Other(format!(
                        "instance {} is locked against termination",
                        id
                    )));
                }
            }
            Ok(())
        }),
        _ => cmd,
    }
}

/// Register every built-in command into `catalog`.
pub fn register_all(catalog: &CommandCatalog) {
    for def in DEFINITIONS.iter() {
        catalog.register(with_hooks(def, build(def)));
    }
    debug!(count = DEFINITIONS.len(), "registered built-in commands");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::MemoryCloud;
    use std::collections::BTreeSet;
    use std::sync::Arc;

    fn find(action: &str, entity: &str) -> &'static CommandDef {
        DEFINITIONS
            .iter()
            .find(|d| d.action == action && d.entity == entity)
            .unwrap()
    }

    fn keys(list: &[&str]) -> BTreeSet<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn definitions_are_unique() {
        let names: BTreeSet<String> = DEFINITIONS.iter().map(CommandDef::name).collect();
        assert_eq!(names.len(), DEFINITIONS.len());
    }

    #[test]
    fn default_spec_is_required_plus_extra() {
        let spec = find("create", "subnet").spec();
        assert_eq!(spec.missing(&keys(&["cidr"])), vec!["vpc"]);
        assert!(spec.unexpected(keys(&["cidr", "vpc", "name"]).iter()).is_empty());
        assert_eq!(spec.unexpected(keys(&["cidr", "vpc", "bogus"]).iter()), vec!["bogus"]);
    }

    #[test]
    fn create_instance_accepts_distro() {
        let spec = find("create", "instance").spec();
        let provided = keys(&["distro", "count", "type", "name", "subnet"]);
        let values = BTreeMap::from([
            ("distro".to_string(), Value::from("canonical:ubuntu:xenial")),
            ("count".to_string(), Value::Int(1)),
        ]);
        assert!(spec.validate(&provided, &values).is_ok());
        let reduced = spec.reduce(&values).unwrap();
        assert_eq!(reduced["image"], Value::from("ami-ubuntu-ubuntu-xenial"));
        assert!(image_for_distro("plan9").is_err());
    }

    #[test]
    fn binds_tags_lists_and_fixed_fields() {
        let input = bind_input(
            find("create", "subnet"),
            &Params::from([
                ("cidr".to_string(), Value::from("10.0.0.0/24")),
                ("vpc".to_string(), Value::from("vpc-1")),
                ("name".to_string(), Value::from("web")),
            ]),
        )
        .unwrap();
        assert_eq!(input, json!({"CidrBlock": "10.0.0.0/24", "VpcId": "vpc-1", "Tags": {"Name": "web"}}));

        let input = bind_input(
            find("delete", "record"),
            &Params::from([("ttl".to_string(), Value::from("60"))]),
        )
        .unwrap();
        assert_eq!(input, json!({"TTL": 60, "Action": "DELETE"}));

        let err = bind_input(
            find("update", "subnet"),
            &Params::from([("public".to_string(), Value::from("maybe"))]),
        )
        .unwrap_err();
        assert!(err.to_string().contains("expected true or false"));
    }

    #[test]
    fn extracts_dotted_paths() {
        let out = json!({"Id": "i-1", "Ids": ["a", "b"], "Nested": {"Arn": "arn:x"}});
        assert_eq!(extract_path(&out, "Id").as_deref(), Some("i-1"));
        assert_eq!(extract_path(&out, "Ids").as_deref(), Some("a"));
        assert_eq!(extract_path(&out, "Nested.Arn").as_deref(), Some("arn:x"));
        assert_eq!(extract_path(&out, "Missing"), None);
    }

    #[test]
    fn check_returns_once_state_is_reached() {
        let cloud = Arc::new(MemoryCloud::new("us-east-1"));
        let env = RunEnv::new(cloud);
        let sg = env
            .cloud()
            .call("ec2", "CreateSecurityGroup", &json!({"GroupName": "web", "VpcId": "vpc-1"}), false)
            .unwrap();
        let id = sg["Id"].as_str().unwrap().to_string();
        let cmd = build(find("check", "securitygroup"));
        let params = Params::from([
            ("id".to_string(), Value::from(id.clone())),
            ("state".to_string(), Value::from("unused")),
            ("timeout".to_string(), Value::Int(0)),
        ]);
        let out = cmd.run(&env, &params).unwrap();
        assert_eq!(out["State"], "unused");

        let params = Params::from([
            ("id".to_string(), Value::from(id.clone())),
            ("state".to_string(), Value::from("in-use")),
            ("timeout".to_string(), Value::Int(0)),
        ]);
        let err = cmd.run(&env, &params).unwrap_err();
        assert_eq!(
            err.to_string(),
            format!("timeout of 0s expired waiting for securitygroup {} to be in-use", id)
        );
    }

    #[test]
    fn check_state_is_validated() {
        let cmd = build(find("check", "instance"));
        let params = Params::from([
            ("id".to_string(), Value::from("i-1")),
            ("state".to_string(), Value::from("woot")),
            ("timeout".to_string(), Value::Int(180)),
        ]);
        let validation = cmd.validate_params(&params);
        assert_eq!(validation.type_errors.len(), 1);
        assert!(validation.type_errors[0].contains("expected any of"));
        assert!(!cmd.supports_dry_run());
    }
}
