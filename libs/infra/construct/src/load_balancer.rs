//! Application load balancer, listeners and target groups.

use serde_json::{Map, Value, json};
use std::collections::BTreeSet;
use strum::{Display, EnumString};

use crate::error::{SynthError, SynthResult};
use crate::network::{SubnetSelection, SubnetType, VpcHandle};
use crate::security_group::{IngressRule, Peer, Port, SecurityGroupHandle};
use crate::stack::{Construct, Stack, logical_id};
use crate::template::{Expr, Resource};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Default)]
#[strum(serialize_all = "kebab-case", ascii_case_insensitive)]
pub enum IpAddressType {
    #[default]
    Ipv4,
    Dualstack,
    DualstackWithoutPublicIpv4,
}

impl IpAddressType {
    pub fn is_dual_stack(&self) -> bool {
        !matches!(self, IpAddressType::Ipv4)
    }
}

#[derive(Debug, Clone)]
pub struct ApplicationLoadBalancer {
    id: String,
    vpc: VpcHandle,
    security_group: SecurityGroupHandle,
    internet_facing: bool,
    ip_address_type: IpAddressType,
    subnets: Option<SubnetSelection>,
}

impl ApplicationLoadBalancer {
    pub fn new(id: &str, vpc: &VpcHandle, security_group: &SecurityGroupHandle) -> Self {
        Self {
            id: logical_id(&[id]),
            vpc: vpc.clone(),
            security_group: security_group.clone(),
            internet_facing: false,
            ip_address_type: IpAddressType::Ipv4,
            subnets: None,
        }
    }

    pub fn internet_facing(mut self, internet_facing: bool) -> Self {
        self.internet_facing = internet_facing;
        self
    }

    pub fn ip_address_type(mut self, ip_address_type: IpAddressType) -> Self {
        self.ip_address_type = ip_address_type;
        self
    }

    pub fn subnets(mut self, selection: SubnetSelection) -> Self {
        self.subnets = Some(selection);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadBalancerHandle {
    pub logical_id: String,
    pub arn: Expr,
    pub dns_name: Expr,
    pub ip_address_type: IpAddressType,
    pub security_group: SecurityGroupHandle,
}

impl Construct for ApplicationLoadBalancer {
    type Handle = LoadBalancerHandle;

    fn declare(self, stack: &mut Stack) -> SynthResult<LoadBalancerHandle> {
        if self.ip_address_type.is_dual_stack() && !self.vpc.is_dual_stack() {
            return Err(SynthError::property(
                &self.id,
                format!("{} load balancers need a dual-stack VPC", self.ip_address_type),
            ));
        }
        let selection = self.subnets.clone().unwrap_or(if self.internet_facing {
            SubnetSelection::Type(SubnetType::Public)
        } else {
            SubnetSelection::Type(SubnetType::PrivateIsolated)
        });
        let subnets = self.vpc.select(&selection)?;
        if self.internet_facing && subnets.iter().any(|s| s.subnet_type != SubnetType::Public) {
            return Err(SynthError::property(
                &self.id,
                "internet-facing load balancers must be placed in public subnets",
            ));
        }
        let zones: BTreeSet<u32> = subnets.iter().map(|s| s.az_index).collect();
        if zones.len() < 2 {
            return Err(SynthError::property(
                &self.id,
                "load balancers need subnets in at least two availability zones",
            ));
        }

        let scheme = if self.internet_facing { "internet-facing" } else { "internal" };
        stack.add_resource(
            &self.id,
            Resource::new(
                "AWS::ElasticLoadBalancingV2::LoadBalancer",
                json!({
                    "IpAddressType": self.ip_address_type.to_string(),
                    "LoadBalancerAttributes": [
                        { "Key": "deletion_protection.enabled", "Value": "false" }
                    ],
                    "Scheme": scheme,
                    "SecurityGroups": [self.security_group.group_id.to_json()],
                    "Subnets": subnets.iter().map(|s| s.subnet_id.to_json()).collect::<Vec<_>>(),
                    "Type": "application",
                }),
            ),
        )?;

        Ok(LoadBalancerHandle {
            arn: Expr::reference(&self.id),
            dns_name: Expr::get_att(&self.id, "DNSName"),
            logical_id: self.id,
            ip_address_type: self.ip_address_type,
            security_group: self.security_group,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Default)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum TargetType {
    #[default]
    Instance,
    Ip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Default)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum TargetGroupIpAddressType {
    #[default]
    Ipv4,
    Ipv6,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthCheck {
    pub path: String,
    pub interval_secs: u32,
    pub timeout_secs: u32,
}

impl Default for HealthCheck {
    fn default() -> Self {
        Self {
            path: "/".to_string(),
            interval_secs: 30,
            timeout_secs: 5,
        }
    }
}

impl HealthCheck {
    pub fn path(path: &str) -> Self {
        Self {
            path: path.to_string(),
            ..Self::default()
        }
    }

    fn validate(&self, construct: &str) -> SynthResult<()> {
        if !self.path.starts_with('/') {
            return Err(SynthError::property(
                construct,
                format!("health check path '{}' must start with '/'", self.path),
            ));
        }
        if !(5..=300).contains(&self.interval_secs) {
            return Err(SynthError::property(
                construct,
                "health check interval must be between 5 and 300 seconds",
            ));
        }
        if !(2..=120).contains(&self.timeout_secs) || self.timeout_secs >= self.interval_secs {
            return Err(SynthError::property(
                construct,
                format!(
                    "health check timeout {}s must be between 2 and 120 and below the interval {}s",
                    self.timeout_secs, self.interval_secs
                ),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct TargetGroup {
    id: String,
    vpc: VpcHandle,
    port: u16,
    target_type: TargetType,
    ip_address_type: TargetGroupIpAddressType,
    health_check: HealthCheck,
    targets: Vec<Expr>,
}

impl TargetGroup {
    pub fn new(id: &str, vpc: &VpcHandle, port: u16) -> Self {
        Self {
            id: logical_id(&[id]),
            vpc: vpc.clone(),
            port,
            target_type: TargetType::Instance,
            ip_address_type: TargetGroupIpAddressType::Ipv4,
            health_check: HealthCheck::default(),
            targets: Vec::new(),
        }
    }

    pub fn target_type(mut self, target_type: TargetType) -> Self {
        self.target_type = target_type;
        self
    }

    pub fn ip_address_type(mut self, ip_address_type: TargetGroupIpAddressType) -> Self {
        self.ip_address_type = ip_address_type;
        self
    }

    pub fn health_check(mut self, health_check: HealthCheck) -> Self {
        self.health_check = health_check;
        self
    }

    /// Register a target by id (instance id or IP, per the target type)
    pub fn target(mut self, id: Expr) -> Self {
        self.targets.push(id);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetGroupHandle {
    pub logical_id: String,
    pub arn: Expr,
    pub port: u16,
}

impl Construct for TargetGroup {
    type Handle = TargetGroupHandle;

    fn declare(self, stack: &mut Stack) -> SynthResult<TargetGroupHandle> {
        if self.port == 0 {
            return Err(SynthError::property(&self.id, "target port must be non-zero"));
        }
        self.health_check.validate(&self.id)?;
        if self.ip_address_type == TargetGroupIpAddressType::Ipv6 && !self.vpc.is_dual_stack() {
            return Err(SynthError::property(
                &self.id,
                "IPv6 target groups need a dual-stack VPC",
            ));
        }

        let mut props = Map::new();
        props.insert("HealthCheckIntervalSeconds".into(), json!(self.health_check.interval_secs));
        props.insert("HealthCheckPath".into(), json!(self.health_check.path));
        props.insert("HealthCheckTimeoutSeconds".into(), json!(self.health_check.timeout_secs));
        props.insert("IpAddressType".into(), json!(self.ip_address_type.to_string()));
        props.insert("Port".into(), json!(self.port));
        props.insert("Protocol".into(), json!("HTTP"));
        props.insert(
            "TargetGroupAttributes".into(),
            json!([{ "Key": "stickiness.enabled", "Value": "false" }]),
        );
        props.insert("TargetType".into(), json!(self.target_type.to_string()));
        props.insert("VpcId".into(), self.vpc.vpc_id.to_json());
        if !self.targets.is_empty() {
            props.insert(
                "Targets".into(),
                Value::Array(
                    self.targets
                        .iter()
                        .map(|t| json!({ "Id": t.to_json(), "Port": self.port }))
                        .collect(),
                ),
            );
        }
        stack.add_resource(
            &self.id,
            Resource::new("AWS::ElasticLoadBalancingV2::TargetGroup", Value::Object(props)),
        )?;

        Ok(TargetGroupHandle {
            arn: Expr::reference(&self.id),
            logical_id: self.id,
            port: self.port,
        })
    }
}

/// HTTP listener forwarding to one or more target groups
#[derive(Debug, Clone)]
pub struct Listener {
    id: String,
    load_balancer: LoadBalancerHandle,
    port: u16,
    open: bool,
    target_groups: Vec<TargetGroupHandle>,
}

impl Listener {
    pub fn new(id: &str, load_balancer: &LoadBalancerHandle, port: u16) -> Self {
        Self {
            id: logical_id(&[&load_balancer.logical_id, id]),
            load_balancer: load_balancer.clone(),
            port,
            open: false,
            target_groups: Vec::new(),
        }
    }

    /// Allow the whole internet to reach the listener port
    pub fn open(mut self, open: bool) -> Self {
        self.open = open;
        self
    }

    pub fn forward_to(mut self, target_group: &TargetGroupHandle) -> Self {
        self.target_groups.push(target_group.clone());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerHandle {
    pub logical_id: String,
    pub arn: Expr,
}

impl Construct for Listener {
    type Handle = ListenerHandle;

    fn declare(self, stack: &mut Stack) -> SynthResult<ListenerHandle> {
        if self.port == 0 {
            return Err(SynthError::property(&self.id, "listener port must be non-zero"));
        }
        let action = match self.target_groups.as_slice() {
            [] => {
                return Err(SynthError::property(
                    &self.id,
                    "listener needs at least one target group",
                ));
            }
            [single] => json!({ "TargetGroupArn": single.arn.to_json(), "Type": "forward" }),
            many => json!({
                "ForwardConfig": {
                    "TargetGroups": many
                        .iter()
                        .map(|tg| json!({ "TargetGroupArn": tg.arn.to_json(), "Weight": 1 }))
                        .collect::<Vec<_>>(),
                },
                "Type": "forward",
            }),
        };

        if self.open {
            let description = format!("Allow from anyone on port {}", self.port);
            let group = &self.load_balancer.security_group;
            stack.add_ingress_rule(
                group,
                IngressRule::new(Peer::AnyIpv4, Port::Tcp(self.port), &description),
            )?;
            if self.load_balancer.ip_address_type.is_dual_stack() {
                stack.add_ingress_rule(
                    group,
                    IngressRule::new(Peer::AnyIpv6, Port::Tcp(self.port), &description),
                )?;
            }
        }

        stack.add_resource(
            &self.id,
            Resource::new(
                "AWS::ElasticLoadBalancingV2::Listener",
                json!({
                    "DefaultActions": [action],
                    "LoadBalancerArn": self.load_balancer.arn.to_json(),
                    "Port": self.port,
                    "Protocol": "HTTP",
                }),
            ),
        )?;

        Ok(ListenerHandle {
            arn: Expr::reference(&self.id),
            logical_id: self.id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{IpProtocol, SubnetConfiguration, Vpc};
    use crate::security_group::SecurityGroup;
    use core_config::deploy::DeployTarget;

    fn setup() -> (Stack, VpcHandle, SecurityGroupHandle) {
        let mut stack = Stack::new("Lb", DeployTarget::default());
        let vpc = stack
            .add(
                Vpc::new("Vpc")
                    .cidr("10.0.0.0/22".parse().unwrap())
                    .max_azs(2)
                    .ip_protocol(IpProtocol::DualStack)
                    .subnet_configuration(vec![
                        SubnetConfiguration::new("Public", SubnetType::Public).with_mask(24),
                        SubnetConfiguration::new("Private", SubnetType::PrivateIsolated)
                            .with_mask(24),
                    ]),
            )
            .unwrap();
        let sg = stack
            .add(SecurityGroup::new("AlbSg", vpc.vpc_id.clone()).allow_all_ipv6_outbound(true))
            .unwrap();
        (stack, vpc, sg)
    }

    #[test]
    fn test_open_listener_adds_world_ingress_once() {
        let (mut stack, vpc, sg) = setup();
        let alb = stack
            .add(
                ApplicationLoadBalancer::new("ALB", &vpc, &sg)
                    .internet_facing(true)
                    .ip_address_type(IpAddressType::DualstackWithoutPublicIpv4),
            )
            .unwrap();
        let tg = stack
            .add(
                TargetGroup::new("TargetGroup", &vpc, 80)
                    .health_check(HealthCheck::path("/api/health"))
                    .target(Expr::reference("Vpc")),
            )
            .unwrap();
        // rule already present from an explicit declaration is not duplicated
        stack
            .add_ingress_rule(
                &sg,
                IngressRule::new(Peer::AnyIpv4, Port::Tcp(80), "Allow from anyone on port 80"),
            )
            .unwrap();
        stack
            .add(Listener::new("Listener", &alb, 80).open(true).forward_to(&tg))
            .unwrap();

        let rules = stack.effective_ingress(&[&sg]).unwrap();
        assert_eq!(rules.len(), 2);
        assert!(rules.iter().all(IngressRule::is_unrestricted));

        let template = stack.synth().unwrap();
        let lb = &template.resources["ALB"].properties;
        assert_eq!(lb["Scheme"], "internet-facing");
        assert_eq!(lb["IpAddressType"], "dualstack-without-public-ipv4");
        let listener = &template.resources["ALBListener"].properties;
        assert_eq!(listener["DefaultActions"][0]["TargetGroupArn"], json!({ "Ref": "TargetGroup" }));
        let tg = &template.resources["TargetGroup"].properties;
        assert_eq!(tg["HealthCheckPath"], "/api/health");
        assert_eq!(tg["Targets"][0]["Port"], 80);
    }

    #[test]
    fn test_health_check_timeout_must_be_below_interval() {
        let (mut stack, vpc, _) = setup();
        let check = HealthCheck {
            path: "/".into(),
            interval_secs: 10,
            timeout_secs: 10,
        };
        let err = stack
            .add(TargetGroup::new("Tg", &vpc, 80).health_check(check))
            .unwrap_err();
        assert!(err.to_string().contains("below the interval"));
    }

    #[test]
    fn test_listener_requires_target_group() {
        let (mut stack, vpc, sg) = setup();
        let alb = stack
            .add(ApplicationLoadBalancer::new("ALB", &vpc, &sg).internet_facing(true))
            .unwrap();
        assert!(stack.add(Listener::new("Listener", &alb, 80)).is_err());
    }

    #[test]
    fn test_internet_facing_alb_rejects_private_subnets() {
        let (mut stack, vpc, sg) = setup();
        let result = stack.add(
            ApplicationLoadBalancer::new("ALB", &vpc, &sg)
                .internet_facing(true)
                .subnets(SubnetSelection::Type(SubnetType::PrivateIsolated)),
        );
        assert!(result.is_err());
    }
}
