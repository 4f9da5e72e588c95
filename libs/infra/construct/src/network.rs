//! VPC construct: subnet planning across availability zones, routing,
//! internet/NAT gateways and the optional S3 gateway endpoint.

use serde_json::{Map, Value, json};
use std::collections::BTreeSet;
use strum::{Display, EnumString};
use tracing::debug;

use crate::cidr::{CidrPlanner, Ipv4Cidr, verify_disjoint_within};
use crate::error::{SynthError, SynthResult};
use crate::stack::{Construct, Stack, logical_id};
use crate::template::{Expr, Resource};

pub const MIN_SUBNET_MASK: u8 = 16;
pub const MAX_SUBNET_MASK: u8 = 28;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
#[strum(serialize_all = "kebab-case", ascii_case_insensitive)]
pub enum SubnetType {
    Public,
    PrivateIsolated,
    PrivateWithEgress,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Default)]
#[strum(serialize_all = "kebab-case", ascii_case_insensitive)]
pub enum IpProtocol {
    #[default]
    Ipv4Only,
    DualStack,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubnetConfiguration {
    pub name: String,
    pub subnet_type: SubnetType,
    pub cidr_mask: Option<u8>,
    pub ipv6_assign_address_on_creation: bool,
}

impl SubnetConfiguration {
    pub fn new(name: impl Into<String>, subnet_type: SubnetType) -> Self {
        Self {
            name: name.into(),
            subnet_type,
            cidr_mask: None,
            ipv6_assign_address_on_creation: false,
        }
    }

    pub fn with_mask(mut self, mask: u8) -> Self {
        self.cidr_mask = Some(mask);
        self
    }

    pub fn with_ipv6_assign(mut self) -> Self {
        self.ipv6_assign_address_on_creation = true;
        self
    }
}

/// One subnet of the computed plan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedSubnet {
    pub group: String,
    pub subnet_type: SubnetType,
    pub az_index: u32,
    pub cidr: Ipv4Cidr,
    pub ipv6_assign: bool,
}

#[derive(Debug, Clone)]
pub struct Vpc {
    id: String,
    cidr: Ipv4Cidr,
    max_azs: u32,
    nat_gateways: u32,
    ip_protocol: IpProtocol,
    subnets: Vec<SubnetConfiguration>,
    s3_gateway_endpoint: bool,
}

impl Vpc {
    /// Defaults: `10.0.0.0/16`, 3 AZs, no NAT, one public and one isolated group
    pub fn new(id: &str) -> Self {
        Self {
            id: logical_id(&[id]),
            cidr: Ipv4Cidr::new(std::net::Ipv4Addr::new(10, 0, 0, 0), 16)
                .unwrap_or_else(|_| Ipv4Cidr::any()),
            max_azs: 3,
            nat_gateways: 0,
            ip_protocol: IpProtocol::Ipv4Only,
            subnets: vec![
                SubnetConfiguration::new("Public", SubnetType::Public),
                SubnetConfiguration::new("Private", SubnetType::PrivateIsolated),
            ],
            s3_gateway_endpoint: false,
        }
    }

    pub fn cidr(mut self, cidr: Ipv4Cidr) -> Self {
        self.cidr = cidr;
        self
    }

    pub fn max_azs(mut self, max_azs: u32) -> Self {
        self.max_azs = max_azs;
        self
    }

    pub fn nat_gateways(mut self, count: u32) -> Self {
        self.nat_gateways = count;
        self
    }

    pub fn ip_protocol(mut self, protocol: IpProtocol) -> Self {
        self.ip_protocol = protocol;
        self
    }

    pub fn subnet_configuration(mut self, subnets: Vec<SubnetConfiguration>) -> Self {
        self.subnets = subnets;
        self
    }

    pub fn s3_gateway_endpoint(mut self, enabled: bool) -> Self {
        self.s3_gateway_endpoint = enabled;
        self
    }

    fn validate(&self) -> SynthResult<()> {
        if self.max_azs == 0 {
            return Err(SynthError::network(&self.id, "max_azs must be at least 1"));
        }
        if self.subnets.is_empty() {
            return Err(SynthError::network(&self.id, "at least one subnet group is required"));
        }
        let mut names = BTreeSet::new();
        for subnet in &self.subnets {
            if !names.insert(subnet.name.as_str()) {
                return Err(SynthError::network(
                    &self.id,
                    format!("duplicate subnet group name '{}'", subnet.name),
                ));
            }
            if let Some(mask) = subnet.cidr_mask {
                if !(MIN_SUBNET_MASK..=MAX_SUBNET_MASK).contains(&mask) {
                    return Err(SynthError::network(
                        &self.id,
                        format!(
                            "subnet group '{}' mask /{} must be between /{} and /{}",
                            subnet.name, mask, MIN_SUBNET_MASK, MAX_SUBNET_MASK
                        ),
                    ));
                }
            }
        }
        let has_public = self.subnets.iter().any(|s| s.subnet_type == SubnetType::Public);
        let has_egress = self
            .subnets
            .iter()
            .any(|s| s.subnet_type == SubnetType::PrivateWithEgress);
        if has_egress && (!has_public || self.nat_gateways == 0) {
            return Err(SynthError::network(
                &self.id,
                "private-with-egress subnets need public subnets and at least one NAT gateway",
            ));
        }
        if self.nat_gateways > 0 && !has_public {
            return Err(SynthError::network(&self.id, "NAT gateways need public subnets"));
        }
        if self.nat_gateways > self.max_azs {
            return Err(SynthError::network(
                &self.id,
                "cannot place more NAT gateways than availability zones",
            ));
        }
        Ok(())
    }

    /// Compute subnet ranges.
    ///
    /// Groups with an explicit mask are allocated first, in declaration
    /// order; the groups without one then split the remaining space evenly.
    /// Within a group, one subnet per AZ.
    pub fn plan(&self) -> SynthResult<Vec<PlannedSubnet>> {
        self.validate()?;
        let mut planner = CidrPlanner::new(self.cidr);
        let mut planned = Vec::new();

        let mut allocate_group = |config: &SubnetConfiguration,
                                  mask: u8,
                                  planner: &mut CidrPlanner|
         -> SynthResult<()> {
            for az_index in 0..self.max_azs {
                planned.push(PlannedSubnet {
                    group: config.name.clone(),
                    subnet_type: config.subnet_type,
                    az_index,
                    cidr: planner.allocate(mask)?,
                    ipv6_assign: config.ipv6_assign_address_on_creation,
                });
            }
            Ok(())
        };

        let mut unsized_groups = Vec::new();
        for config in &self.subnets {
            match config.cidr_mask {
                Some(mask) => allocate_group(config, mask, &mut planner)?,
                None => unsized_groups.push(config),
            }
        }

        if !unsized_groups.is_empty() {
            let count = unsized_groups.len() * self.max_azs as usize;
            let mut mask = planner.mask_for_remaining(count)?.max(MIN_SUBNET_MASK);
            // alignment after sized groups can waste space; shrink until it fits
            loop {
                if mask > MAX_SUBNET_MASK {
                    return Err(SynthError::AddressSpaceExhausted {
                        parent: self.cidr.to_string(),
                        mask,
                    });
                }
                let mut trial = planner.clone();
                let fits = (0..count).all(|_| trial.allocate(mask).is_ok());
                if fits {
                    break;
                }
                mask += 1;
            }
            for config in unsized_groups {
                allocate_group(config, mask, &mut planner)?;
            }
        }

        // Restore declaration order (sized groups were allocated first)
        let order: Vec<&str> = self.subnets.iter().map(|s| s.name.as_str()).collect();
        planned.sort_by_key(|p| {
            (
                order.iter().position(|n| *n == p.group).unwrap_or(usize::MAX),
                p.az_index,
            )
        });

        let blocks: Vec<Ipv4Cidr> = planned.iter().map(|p| p.cidr).collect();
        verify_disjoint_within(&self.cidr, &blocks)?;
        Ok(planned)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubnetHandle {
    pub logical_id: String,
    pub group: String,
    pub subnet_type: SubnetType,
    pub az_index: u32,
    pub cidr: Ipv4Cidr,
    pub subnet_id: Expr,
    pub availability_zone: Expr,
    pub route_table_id: Expr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubnetSelection {
    Type(SubnetType),
    Group(String),
}

impl From<SubnetType> for SubnetSelection {
    fn from(value: SubnetType) -> Self {
        SubnetSelection::Type(value)
    }
}

#[derive(Debug, Clone)]
pub struct VpcHandle {
    pub logical_id: String,
    pub vpc_id: Expr,
    pub cidr: Ipv4Cidr,
    pub ip_protocol: IpProtocol,
    pub subnets: Vec<SubnetHandle>,
}

impl VpcHandle {
    pub fn is_dual_stack(&self) -> bool {
        self.ip_protocol == IpProtocol::DualStack
    }

    pub fn select(&self, selection: &SubnetSelection) -> SynthResult<Vec<&SubnetHandle>> {
        let selected: Vec<&SubnetHandle> = self
            .subnets
            .iter()
            .filter(|s| match selection {
                SubnetSelection::Type(t) => s.subnet_type == *t,
                SubnetSelection::Group(name) => s.group == *name,
            })
            .collect();
        if selected.is_empty() {
            return Err(SynthError::network(
                &self.logical_id,
                format!("no subnets match {:?}", selection),
            ));
        }
        Ok(selected)
    }

    pub fn subnet_ids(&self, selection: &SubnetSelection) -> SynthResult<Vec<Expr>> {
        Ok(self
            .select(selection)?
            .into_iter()
            .map(|s| s.subnet_id.clone())
            .collect())
    }
}

fn name_tag(value: String) -> Value {
    json!([{ "Key": "Name", "Value": value }])
}

impl Construct for Vpc {
    type Handle = VpcHandle;

    fn declare(self, stack: &mut Stack) -> SynthResult<VpcHandle> {
        let plan = self.plan()?;
        let vpc = self.id.clone();
        let vpc_ref = Expr::reference(&vpc);
        let dual_stack = self.ip_protocol == IpProtocol::DualStack;
        let tag_prefix = format!("{}/{}", stack.name(), vpc);

        stack.add_resource(
            &vpc,
            Resource::new(
                "AWS::EC2::VPC",
                json!({
                    "CidrBlock": self.cidr.to_string(),
                    "EnableDnsHostnames": true,
                    "EnableDnsSupport": true,
                    "InstanceTenancy": "default",
                    "Tags": name_tag(tag_prefix.clone()),
                }),
            ),
        )?;

        let ipv6_block = logical_id(&[&vpc, "Ipv6Cidr"]);
        if dual_stack {
            stack.add_resource(
                &ipv6_block,
                Resource::new(
                    "AWS::EC2::VPCCidrBlock",
                    json!({ "AmazonProvidedIpv6CidrBlock": true, "VpcId": vpc_ref.to_json() }),
                ),
            )?;
        }

        let has_public = plan.iter().any(|p| p.subnet_type == SubnetType::Public);
        let igw = logical_id(&[&vpc, "IGW"]);
        let igw_attachment = logical_id(&[&vpc, "VPCGW"]);
        if has_public {
            stack.add_resource(
                &igw,
                Resource::new(
                    "AWS::EC2::InternetGateway",
                    json!({ "Tags": name_tag(tag_prefix.clone()) }),
                ),
            )?;
            stack.add_resource(
                &igw_attachment,
                Resource::new(
                    "AWS::EC2::VPCGatewayAttachment",
                    json!({
                        "InternetGatewayId": Expr::reference(&igw).to_json(),
                        "VpcId": vpc_ref.to_json(),
                    }),
                ),
            )?;
        }

        let has_egress = plan
            .iter()
            .any(|p| p.subnet_type == SubnetType::PrivateWithEgress);
        let eigw = logical_id(&[&vpc, "EIGW"]);
        if dual_stack && has_egress {
            stack.add_resource(
                &eigw,
                Resource::new(
                    "AWS::EC2::EgressOnlyInternetGateway",
                    json!({ "VpcId": vpc_ref.to_json() }),
                ),
            )?;
        }

        let mut handles = Vec::with_capacity(plan.len());
        let mut nat_gateways: Vec<String> = Vec::new();

        for (index, planned) in plan.iter().enumerate() {
            let base = logical_id(&[
                &vpc,
                &planned.group,
                "Subnet",
                &(planned.az_index + 1).to_string(),
            ]);
            let subnet_id = logical_id(&[&base, "Subnet"]);
            let route_table = logical_id(&[&base, "RouteTable"]);
            let public = planned.subnet_type == SubnetType::Public;

            let mut props = Map::new();
            props.insert("VpcId".into(), vpc_ref.to_json());
            props.insert("CidrBlock".into(), json!(planned.cidr.to_string()));
            props.insert(
                "AvailabilityZone".into(),
                Expr::availability_zone(planned.az_index).to_json(),
            );
            props.insert("MapPublicIpOnLaunch".into(), json!(public));
            props.insert(
                "Tags".into(),
                json!([
                    { "Key": "Name", "Value": format!("{}/{}", tag_prefix, base) },
                    { "Key": "aws-cdk:subnet-name", "Value": planned.group },
                    { "Key": "aws-cdk:subnet-type", "Value": planned.subnet_type.to_string() },
                ]),
            );
            let subnet = if dual_stack {
                let block = Expr::Select(
                    index as u32,
                    Box::new(Expr::Cidr(
                        Box::new(Expr::Select(
                            0,
                            Box::new(Expr::get_att(&vpc, "Ipv6CidrBlocks")),
                        )),
                        256,
                        64,
                    )),
                );
                props.insert("Ipv6CidrBlock".into(), block.to_json());
                props.insert(
                    "AssignIpv6AddressOnCreation".into(),
                    json!(planned.ipv6_assign),
                );
                Resource::new("AWS::EC2::Subnet", Value::Object(props)).depends_on(&ipv6_block)
            } else {
                Resource::new("AWS::EC2::Subnet", Value::Object(props))
            };
            stack.add_resource(&subnet_id, subnet)?;

            stack.add_resource(
                &route_table,
                Resource::new(
                    "AWS::EC2::RouteTable",
                    json!({
                        "VpcId": vpc_ref.to_json(),
                        "Tags": name_tag(format!("{}/{}", tag_prefix, base)),
                    }),
                ),
            )?;
            stack.add_resource(
                &logical_id(&[&base, "RouteTableAssociation"]),
                Resource::new(
                    "AWS::EC2::SubnetRouteTableAssociation",
                    json!({
                        "RouteTableId": Expr::reference(&route_table).to_json(),
                        "SubnetId": Expr::reference(&subnet_id).to_json(),
                    }),
                ),
            )?;

            match planned.subnet_type {
                SubnetType::Public => {
                    stack.add_resource(
                        &logical_id(&[&base, "DefaultRoute"]),
                        Resource::new(
                            "AWS::EC2::Route",
                            json!({
                                "DestinationCidrBlock": "0.0.0.0/0",
                                "GatewayId": Expr::reference(&igw).to_json(),
                                "RouteTableId": Expr::reference(&route_table).to_json(),
                            }),
                        )
                        .depends_on(&igw_attachment),
                    )?;
                    if dual_stack {
                        stack.add_resource(
                            &logical_id(&[&base, "DefaultRoute6"]),
                            Resource::new(
                                "AWS::EC2::Route",
                                json!({
                                    "DestinationIpv6CidrBlock": "::/0",
                                    "GatewayId": Expr::reference(&igw).to_json(),
                                    "RouteTableId": Expr::reference(&route_table).to_json(),
                                }),
                            )
                            .depends_on(&igw_attachment),
                        )?;
                    }
                    if (nat_gateways.len() as u32) < self.nat_gateways {
                        let eip = logical_id(&[&base, "EIP"]);
                        let nat = logical_id(&[&base, "NATGateway"]);
                        stack.add_resource(
                            &eip,
                            Resource::new("AWS::EC2::EIP", json!({ "Domain": "vpc" })),
                        )?;
                        stack.add_resource(
                            &nat,
                            Resource::new(
                                "AWS::EC2::NatGateway",
                                json!({
                                    "AllocationId": Expr::get_att(&eip, "AllocationId").to_json(),
                                    "SubnetId": Expr::reference(&subnet_id).to_json(),
                                }),
                            )
                            .depends_on(&igw_attachment),
                        )?;
                        nat_gateways.push(nat);
                    }
                }
                SubnetType::PrivateWithEgress => {
                    // public groups are not always declared first, so
                    // egress routes are added once every NAT exists
                }
                SubnetType::PrivateIsolated => {}
            }

            handles.push(SubnetHandle {
                logical_id: subnet_id.clone(),
                group: planned.group.clone(),
                subnet_type: planned.subnet_type,
                az_index: planned.az_index,
                cidr: planned.cidr,
                subnet_id: Expr::reference(&subnet_id),
                availability_zone: Expr::availability_zone(planned.az_index),
                route_table_id: Expr::reference(&route_table),
            });
        }

        for subnet in handles
            .iter()
            .filter(|s| s.subnet_type == SubnetType::PrivateWithEgress)
        {
            let base = subnet.logical_id.trim_end_matches("Subnet").to_string();
            let nat = nat_gateways
                .get(subnet.az_index as usize % nat_gateways.len().max(1))
                .ok_or_else(|| {
                    SynthError::network(&vpc, "private-with-egress subnet has no NAT gateway")
                })?;
            stack.add_resource(
                &logical_id(&[&base, "DefaultRoute"]),
                Resource::new(
                    "AWS::EC2::Route",
                    json!({
                        "DestinationCidrBlock": "0.0.0.0/0",
                        "NatGatewayId": Expr::reference(nat).to_json(),
                        "RouteTableId": subnet.route_table_id.to_json(),
                    }),
                ),
            )?;
            if dual_stack {
                stack.add_resource(
                    &logical_id(&[&base, "DefaultRoute6"]),
                    Resource::new(
                        "AWS::EC2::Route",
                        json!({
                            "DestinationIpv6CidrBlock": "::/0",
                            "EgressOnlyInternetGatewayId": Expr::reference(&eigw).to_json(),
                            "RouteTableId": subnet.route_table_id.to_json(),
                        }),
                    ),
                )?;
            }
        }

        if self.s3_gateway_endpoint {
            let private: Vec<Value> = handles
                .iter()
                .filter(|s| s.subnet_type != SubnetType::Public)
                .map(|s| s.route_table_id.to_json())
                .collect();
            let route_tables = if private.is_empty() {
                handles.iter().map(|s| s.route_table_id.to_json()).collect()
            } else {
                private
            };
            stack.add_resource(
                &logical_id(&[&vpc, "S3Endpoint"]),
                Resource::new(
                    "AWS::EC2::VPCEndpoint",
                    json!({
                        "RouteTableIds": route_tables,
                        "ServiceName": Expr::join(
                            "",
                            vec![Expr::str("com.amazonaws."), Expr::region(), Expr::str(".s3")],
                        )
                        .to_json(),
                        "VpcEndpointType": "Gateway",
                        "VpcId": vpc_ref.to_json(),
                    }),
                ),
            )?;
        }

        debug!(
            stack = %stack.name(),
            vpc = %vpc,
            subnets = handles.len(),
            nat_gateways = nat_gateways.len(),
            "Declared VPC"
        );

        Ok(VpcHandle {
            logical_id: vpc,
            vpc_id: vpc_ref,
            cidr: self.cidr,
            ip_protocol: self.ip_protocol,
            subnets: handles,
        })
    }
}
