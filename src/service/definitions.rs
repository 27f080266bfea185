//! Built-in fetcher tables.
//!
//! One [`ServiceDef`] per service, each listing the resource types it syncs:
//! which list method returns them, where the items sit in the answer and
//! which fields link an object to other resources of the graph.

use once_cell::sync::Lazy;

use crate::fetch::PageLayout;
use crate::graph::Relation;

/// Edge built from a field of a raw object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Link {
    /// Field holding the linked id(s): a string, a list or a map of strings.
    pub field: &'static str,
    /// Type of the linked resource.
    pub kind: &'static str,
    /// How the linked resource relates to the object.
    ///
    /// `ParentOf` and `AppliesOn` point from the linked resource to the
    /// object; `DependsOn` points from the object to the linked resource.
    pub relation: Relation,
}

fn parent(field: &'static str, kind: &'static str) -> Link {
    Link {
        field,
        kind,
        relation: Relation::ParentOf,
    }
}

fn applies(field: &'static str, kind: &'static str) -> Link {
    Link {
        field,
        kind,
        relation: Relation::AppliesOn,
    }
}

fn depends(field: &'static str, kind: &'static str) -> Link {
    Link {
        field,
        kind,
        relation: Relation::DependsOn,
    }
}

/// Declarative description of one fetched resource type.
#[derive(Debug, Clone)]
pub struct ResourceDef {
    /// Provider api.
    pub api: &'static str,
    /// Graph type.
    pub resource_type: &'static str,
    /// List method.
    pub api_method: &'static str,
    /// Field holding the items.
    pub outputs_extractor: &'static str,
    /// Field holding wrappers around the items, if any.
    pub outputs_container: Option<&'static str>,
    /// Whether the method is paginated.
    pub paginated: bool,
    /// Next page token field.
    pub next_page_marker: Option<&'static str>,
    /// Fetched by a hand-written function instead of the generic list.
    pub manual: bool,
    /// Whether the region is the parent of every object.
    pub region_parent: bool,
    /// Edges built after the primary fetch.
    pub links: Vec<Link>,
}

impl ResourceDef {
    /// Shape of the list answers.
    pub fn layout(&self) -> PageLayout {
        PageLayout {
            container: self.outputs_container,
            extractor: self.outputs_extractor,
            next_marker: if self.paginated {
                self.next_page_marker
            } else {
                None
            },
        }
    }

    fn manual(mut self) -> Self {
        self.manual = true;
        self
    }

    fn in_region(mut self) -> Self {
        self.region_parent = true;
        self
    }

    fn single_page(mut self) -> Self {
        self.paginated = false;
        self.next_page_marker = None;
        self
    }

    fn links(mut self, links: Vec<Link>) -> Self {
        self.links = links;
        self
    }
}

fn res(api: &'static str, resource_type: &'static str, api_method: &'static str) -> ResourceDef {
    ResourceDef {
        api,
        resource_type,
        api_method,
        outputs_extractor: "Items",
        outputs_container: None,
        paginated: true,
        next_page_marker: Some("NextToken"),
        manual: false,
        region_parent: false,
        links: Vec::new(),
    }
}

/// Declarative description of a service.
#[derive(Debug, Clone)]
pub struct ServiceDef {
    /// Human name, e.g. `infra`.
    pub name: &'static str,
    /// Whether the service ignores regions.
    pub global: bool,
    /// Provider apis grouped under the service.
    pub apis: &'static [&'static str],
    /// Fetched resource types.
    pub resources: Vec<ResourceDef>,
}

impl ServiceDef {
    /// Definition of `resource_type`.
    pub fn resource(&self, resource_type: &str) -> Option<&ResourceDef> {
        self.resources
            .iter()
            .find(|r| r.resource_type == resource_type)
    }
}

/// Every built-in service.
pub static SERVICES: Lazy<Vec<ServiceDef>> = Lazy::new(|| {
    vec![
        ServiceDef {
            name: "infra",
            global: false,
            apis: &["ec2", "elbv2", "rds", "autoscaling"],
            resources: infra(),
        },
        ServiceDef {
            name: "access",
            global: true,
            apis: &["iam"],
            resources: access(),
        },
        ServiceDef {
            name: "storage",
            global: false,
            apis: &["s3"],
            resources: vec![
                res("s3", "bucket", "ListBuckets")
                    .single_page()
                    .manual()
                    .in_region(),
                res("s3", "s3object", "ListObjects")
                    .manual()
                    .links(vec![parent("Bucket", "bucket")]),
            ],
        },
        ServiceDef {
            name: "messaging",
            global: false,
            apis: &["sns", "sqs"],
            resources: vec![
                res("sns", "topic", "ListTopics").in_region(),
                res("sns", "subscription", "ListSubscriptions")
                    .links(vec![parent("TopicArn", "topic")]),
                res("sqs", "queue", "ListQueues").single_page().in_region(),
            ],
        },
        ServiceDef {
            name: "dns",
            global: true,
            apis: &["route53"],
            resources: vec![
                res("route53", "zone", "ListHostedZones"),
                res("route53", "record", "ListResourceRecordSets")
                    .links(vec![parent("Zone", "zone")]),
            ],
        },
        ServiceDef {
            name: "lambda",
            global: false,
            apis: &["lambda"],
            resources: vec![res("lambda", "function", "ListFunctions").in_region()],
        },
        ServiceDef {
            name: "monitoring",
            global: false,
            apis: &["cloudwatch"],
            resources: vec![res("cloudwatch", "alarm", "DescribeAlarms").in_region()],
        },
    ]
});

fn infra() -> Vec<ResourceDef> {
    vec![
        res("ec2", "vpc", "DescribeVpcs").single_page().in_region(),
        res("ec2", "subnet", "DescribeSubnets")
            .single_page()
            .links(vec![parent("VpcId", "vpc")]),
        res("ec2", "instance", "DescribeInstances").links(vec![
            parent("SubnetId", "subnet"),
            applies("SecurityGroupIds", "securitygroup"),
            applies("KeyName", "keypair"),
        ]),
        res("ec2", "securitygroup", "DescribeSecurityGroups")
            .single_page()
            .links(vec![parent("VpcId", "vpc")]),
        res("ec2", "internetgateway", "DescribeInternetGateways")
            .single_page()
            .in_region()
            .links(vec![depends("Attachments", "vpc")]),
        res("ec2", "natgateway", "DescribeNatGateways")
            .in_region()
            .links(vec![depends("SubnetId", "subnet")]),
        res("ec2", "routetable", "DescribeRouteTables")
            .single_page()
            .links(vec![parent("VpcId", "vpc"), depends("Associations", "subnet")]),
        res("ec2", "keypair", "DescribeKeyPairs").single_page().in_region(),
        res("ec2", "volume", "DescribeVolumes").links(vec![depends("Attachments", "instance")]),
        res("ec2", "elasticip", "DescribeAddresses")
            .single_page()
            .in_region()
            .links(vec![depends("InstanceId", "instance")]),
        res("ec2", "image", "DescribeImages").single_page().in_region(),
        res("ec2", "snapshot", "DescribeSnapshots")
            .in_region()
            .links(vec![depends("VolumeId", "volume")]),
        res("elbv2", "loadbalancer", "DescribeLoadBalancers").links(vec![
            depends("Subnets", "subnet"),
            applies("SecurityGroups", "securitygroup"),
        ]),
        res("elbv2", "targetgroup", "DescribeTargetGroups").links(vec![parent("VpcId", "vpc")]),
        res("elbv2", "listener", "DescribeListeners")
            .links(vec![parent("LoadBalancerArn", "loadbalancer")]),
        res("rds", "database", "DescribeDBInstances")
            .links(vec![depends("DBSubnetGroupName", "dbsubnetgroup")]),
        res("rds", "dbsubnetgroup", "DescribeDBSubnetGroups")
            .links(vec![depends("SubnetIds", "subnet")]),
        res("autoscaling", "launchconfiguration", "DescribeLaunchConfigurations")
            .in_region()
            .links(vec![applies("KeyName", "keypair")]),
        res("autoscaling", "scalinggroup", "DescribeAutoScalingGroups")
            .in_region()
            .links(vec![
                depends("LaunchConfigurationName", "launchconfiguration"),
                depends("VPCZoneIdentifier", "subnet"),
            ]),
        res("autoscaling", "scalingpolicy", "DescribePolicies")
            .links(vec![parent("AutoScalingGroupName", "scalinggroup")]),
    ]
}

fn access() -> Vec<ResourceDef> {
    vec![
        res("iam", "user", "ListUsers"),
        res("iam", "group", "ListGroups"),
        res("iam", "role", "ListRoles"),
        res("iam", "policy", "ListPolicies"),
        res("iam", "accesskey", "ListAccessKeys").links(vec![parent("UserName", "user")]),
        res("iam", "instanceprofile", "ListInstanceProfiles"),
    ]
}
