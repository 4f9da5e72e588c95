//! Security groups: named sets of allow-rules.
//!
//! Rules accumulate in the stack after the group is declared and are
//! rendered at synth time. CIDR and prefix-list rules stay inline on the
//! group; rules whose source is another security group become standalone
//! `AWS::EC2::SecurityGroupIngress` resources so groups can reference each
//! other without a circular dependency.

use serde_json::{Map, Value, json};

use crate::cidr::{Ipv4Cidr, Ipv6Cidr};
use crate::error::{SynthError, SynthResult};
use crate::stack::{Construct, Stack, logical_id};
use crate::template::{Expr, Resource, import_name, target_logical_id};

/// Traffic source of an allow-rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Peer {
    AnyIpv4,
    AnyIpv6,
    Ipv4(Ipv4Cidr),
    Ipv6(Ipv6Cidr),
    PrefixList(String),
    SecurityGroup(Expr),
}

impl Peer {
    /// Whether the rule admits traffic from the whole internet
    pub fn is_unrestricted(&self) -> bool {
        match self {
            Peer::AnyIpv4 | Peer::AnyIpv6 => true,
            Peer::Ipv4(cidr) => cidr.is_any(),
            Peer::Ipv6(cidr) => cidr.is_any(),
            Peer::PrefixList(_) | Peer::SecurityGroup(_) => false,
        }
    }

    fn source_fields(&self) -> Map<String, Value> {
        let mut map = Map::new();
        match self {
            Peer::AnyIpv4 => {
                map.insert("CidrIp".into(), json!("0.0.0.0/0"));
            }
            Peer::AnyIpv6 => {
                map.insert("CidrIpv6".into(), json!("::/0"));
            }
            Peer::Ipv4(cidr) => {
                map.insert("CidrIp".into(), json!(cidr.to_string()));
            }
            Peer::Ipv6(cidr) => {
                map.insert("CidrIpv6".into(), json!(cidr.to_string()));
            }
            Peer::PrefixList(id) => {
                map.insert("SourcePrefixListId".into(), json!(id));
            }
            Peer::SecurityGroup(group_id) => {
                map.insert("SourceSecurityGroupId".into(), group_id.to_json());
            }
        }
        map
    }

    fn id_fragment(&self) -> String {
        match self {
            Peer::AnyIpv4 => "AnyIpv4".to_string(),
            Peer::AnyIpv6 => "AnyIpv6".to_string(),
            Peer::Ipv4(cidr) => logical_id(&[&cidr.to_string()]),
            Peer::Ipv6(cidr) => logical_id(&[&cidr.to_string()]),
            Peer::PrefixList(id) => logical_id(&[id]),
            Peer::SecurityGroup(expr) => {
                let value = expr.to_json();
                target_logical_id(&value)
                    .or_else(|| import_name(&value))
                    .map(|s| logical_id(&[s]))
                    .unwrap_or_else(|| "Group".to_string())
            }
        }
    }
}

/// Protocol and port range of an allow-rule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Port {
    Tcp(u16),
    TcpRange(u16, u16),
    Udp(u16),
    AllTcp,
    AllTraffic,
}

impl Port {
    pub fn protocol(&self) -> &'static str {
        match self {
            Port::Tcp(_) | Port::TcpRange(..) | Port::AllTcp => "tcp",
            Port::Udp(_) => "udp",
            Port::AllTraffic => "-1",
        }
    }

    /// Inclusive port range, `None` for all traffic
    pub fn range(&self) -> Option<(u16, u16)> {
        match self {
            Port::Tcp(p) | Port::Udp(p) => Some((*p, *p)),
            Port::TcpRange(from, to) => Some((*from, *to)),
            Port::AllTcp => Some((0, 65535)),
            Port::AllTraffic => None,
        }
    }

    /// Whether TCP traffic to `port` is admitted
    pub fn covers_tcp(&self, port: u16) -> bool {
        match self {
            Port::Udp(_) => false,
            Port::AllTraffic => true,
            _ => self
                .range()
                .is_some_and(|(from, to)| from <= port && port <= to),
        }
    }

    fn id_fragment(&self) -> String {
        match self.range() {
            Some((from, to)) if from == to => format!("{}{}", self.protocol(), from),
            Some((from, to)) => format!("{}{}to{}", self.protocol(), from, to),
            None => "AllTraffic".to_string(),
        }
    }

    fn fields(&self) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("IpProtocol".into(), json!(self.protocol()));
        if let Some((from, to)) = self.range() {
            map.insert("FromPort".into(), json!(from));
            map.insert("ToPort".into(), json!(to));
        }
        map
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngressRule {
    pub peer: Peer,
    pub port: Port,
    pub description: String,
}

impl IngressRule {
    pub fn new(peer: Peer, port: Port, description: impl Into<String>) -> Self {
        Self {
            peer,
            port,
            description: description.into(),
        }
    }

    pub fn is_unrestricted(&self) -> bool {
        self.peer.is_unrestricted()
    }

    fn inline_json(&self) -> Value {
        let mut map = self.port.fields();
        map.extend(self.peer.source_fields());
        map.insert("Description".into(), json!(self.description));
        Value::Object(map)
    }

    fn standalone_json(&self, group_id: &Expr) -> Value {
        let mut map = self.port.fields();
        map.extend(self.peer.source_fields());
        map.insert("GroupId".into(), group_id.to_json());
        map.insert("Description".into(), json!(self.description));
        Value::Object(map)
    }
}

#[derive(Debug, Clone)]
pub(crate) struct SecurityGroupState {
    description: String,
    vpc_id: Expr,
    allow_all_outbound: bool,
    allow_all_ipv6_outbound: bool,
    pub(crate) rules: Vec<IngressRule>,
}

impl SecurityGroupState {
    pub(crate) fn render(&self, group_logical_id: &str) -> SynthResult<Vec<(String, Resource)>> {
        let group_id = Expr::get_att(group_logical_id, "GroupId");
        let mut inline = Vec::new();
        let mut resources = Vec::new();

        for rule in &self.rules {
            match rule.peer {
                Peer::SecurityGroup(_) => {
                    let id = format!(
                        "{}From{}{}",
                        group_logical_id,
                        rule.peer.id_fragment(),
                        rule.port.id_fragment()
                    );
                    resources.push((
                        logical_id(&[&id]),
                        Resource::new(
                            "AWS::EC2::SecurityGroupIngress",
                            rule.standalone_json(&group_id),
                        ),
                    ));
                }
                _ => inline.push(rule.inline_json()),
            }
        }

        let mut egress = Vec::new();
        if self.allow_all_outbound {
            egress.push(json!({
                "CidrIp": "0.0.0.0/0",
                "Description": "Allow all outbound traffic by default",
                "IpProtocol": "-1"
            }));
        }
        if self.allow_all_ipv6_outbound {
            egress.push(json!({
                "CidrIpv6": "::/0",
                "Description": "Allow all outbound ipv6 traffic by default",
                "IpProtocol": "-1"
            }));
        }
        if egress.is_empty() {
            egress.push(json!({
                "CidrIp": "255.255.255.255/32",
                "Description": "Disallow all traffic",
                "FromPort": 252,
                "IpProtocol": "icmp",
                "ToPort": 86
            }));
        }

        let mut properties = Map::new();
        properties.insert("GroupDescription".into(), json!(self.description));
        properties.insert("VpcId".into(), self.vpc_id.to_json());
        properties.insert("SecurityGroupEgress".into(), Value::Array(egress));
        if !inline.is_empty() {
            properties.insert("SecurityGroupIngress".into(), Value::Array(inline));
        }

        resources.push((
            group_logical_id.to_string(),
            Resource::new("AWS::EC2::SecurityGroup", Value::Object(properties)),
        ));
        Ok(resources)
    }
}

/// Declares an `AWS::EC2::SecurityGroup`
#[derive(Debug, Clone)]
pub struct SecurityGroup {
    id: String,
    vpc_id: Expr,
    description: String,
    allow_all_outbound: bool,
    allow_all_ipv6_outbound: bool,
    rules: Vec<IngressRule>,
}

impl SecurityGroup {
    pub fn new(id: &str, vpc_id: Expr) -> Self {
        Self {
            id: logical_id(&[id]),
            vpc_id,
            description: id.to_string(),
            allow_all_outbound: true,
            allow_all_ipv6_outbound: false,
            rules: Vec::new(),
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn allow_all_outbound(mut self, allow: bool) -> Self {
        self.allow_all_outbound = allow;
        self
    }

    pub fn allow_all_ipv6_outbound(mut self, allow: bool) -> Self {
        self.allow_all_ipv6_outbound = allow;
        self
    }

    pub fn ingress(mut self, rule: IngressRule) -> Self {
        if !self.rules.contains(&rule) {
            self.rules.push(rule);
        }
        self
    }
}

/// Reference to a declared security group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityGroupHandle {
    pub logical_id: String,
    pub group_id: Expr,
}

impl SecurityGroupHandle {
    /// This group as a traffic source for another group's rule
    pub fn as_peer(&self) -> Peer {
        Peer::SecurityGroup(self.group_id.clone())
    }
}

impl Construct for SecurityGroup {
    type Handle = SecurityGroupHandle;

    fn declare(self, stack: &mut Stack) -> SynthResult<SecurityGroupHandle> {
        if self.description.len() > 255 {
            return Err(SynthError::property(
                &self.id,
                "group description must be at most 255 characters",
            ));
        }
        let state = SecurityGroupState {
            description: self.description,
            vpc_id: self.vpc_id,
            allow_all_outbound: self.allow_all_outbound,
            allow_all_ipv6_outbound: self.allow_all_ipv6_outbound,
            rules: self.rules,
        };
        stack.register_security_group(&self.id, state)?;
        Ok(SecurityGroupHandle {
            group_id: Expr::get_att(&self.id, "GroupId"),
            logical_id: self.id,
        })
    }
}

/// An allow-rule attached to a group owned by another stack (usually an
/// imported group id).
#[derive(Debug, Clone)]
pub struct IngressOnGroup {
    id: String,
    group_id: Expr,
    rule: IngressRule,
}

impl IngressOnGroup {
    pub fn new(id: &str, group_id: Expr, rule: IngressRule) -> Self {
        Self {
            id: logical_id(&[id]),
            group_id,
            rule,
        }
    }
}

impl Construct for IngressOnGroup {
    type Handle = ();

    fn declare(self, stack: &mut Stack) -> SynthResult<()> {
        stack.add_resource(
            &self.id,
            Resource::new(
                "AWS::EC2::SecurityGroupIngress",
                self.rule.standalone_json(&self.group_id),
            ),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_config::deploy::DeployTarget;

    fn stack() -> Stack {
        Stack::new("SgStack", DeployTarget::default())
    }

    #[test]
    fn test_port_coverage() {
        assert!(Port::Tcp(5432).covers_tcp(5432));
        assert!(!Port::Tcp(80).covers_tcp(5432));
        assert!(Port::TcpRange(5000, 6000).covers_tcp(5432));
        assert!(Port::AllTcp.covers_tcp(5432));
        assert!(Port::AllTraffic.covers_tcp(5432));
        assert!(!Port::Udp(5432).covers_tcp(5432));
    }

    #[test]
    fn test_unrestricted_peers() {
        assert!(Peer::AnyIpv4.is_unrestricted());
        assert!(Peer::AnyIpv6.is_unrestricted());
        assert!(Peer::Ipv4(Ipv4Cidr::any()).is_unrestricted());
        assert!(Peer::Ipv6("::/0".parse().unwrap()).is_unrestricted());
        assert!(Peer::Ipv6("0::/0".parse().unwrap()).is_unrestricted());
        assert!(!Peer::Ipv6("2001:db8::/32".parse().unwrap()).is_unrestricted());
        assert!(!Peer::Ipv4("10.0.0.0/16".parse().unwrap()).is_unrestricted());
        assert!(!Peer::PrefixList("pl-123".into()).is_unrestricted());
    }

    #[test]
    fn test_cidr_rules_render_inline_and_group_rules_standalone() {
        let mut stack = stack();
        let alb = stack
            .add(SecurityGroup::new("AlbSg", Expr::reference("Vpc")))
            .unwrap();
        let web = stack
            .add(
                SecurityGroup::new("WebSg", Expr::reference("Vpc"))
                    .description("web")
                    .ingress(IngressRule::new(
                        Peer::PrefixList("pl-1".into()),
                        Port::Tcp(22),
                        "ssh",
                    )),
            )
            .unwrap();
        stack
            .add_ingress_rule(&web, IngressRule::new(alb.as_peer(), Port::Tcp(80), "from alb"))
            .unwrap();

        stack
            .add_resource(
                "Vpc",
                Resource::new("AWS::EC2::VPC", json!({ "CidrBlock": "10.0.0.0/16" })),
            )
            .unwrap();
        let template = stack.synth().unwrap();

        let web_props = &template.resources["WebSg"].properties;
        assert_eq!(web_props["SecurityGroupIngress"][0]["SourcePrefixListId"], "pl-1");
        assert_eq!(web_props["SecurityGroupIngress"].as_array().unwrap().len(), 1);

        let rule = &template.resources["WebSgFromAlbSgtcp80"];
        assert_eq!(rule.resource_type, "AWS::EC2::SecurityGroupIngress");
        assert_eq!(
            rule.properties["SourceSecurityGroupId"],
            json!({ "Fn::GetAtt": ["AlbSg", "GroupId"] })
        );
        assert_eq!(rule.properties["FromPort"], 80);
    }

    #[test]
    fn test_outbound_rendering() {
        let state = SecurityGroupState {
            description: "d".into(),
            vpc_id: Expr::str("vpc-1"),
            allow_all_outbound: false,
            allow_all_ipv6_outbound: false,
            rules: vec![],
        };
        let rendered = state.render("Locked").unwrap();
        let egress = &rendered[0].1.properties["SecurityGroupEgress"];
        assert_eq!(egress[0]["CidrIp"], "255.255.255.255/32");

        let state = SecurityGroupState {
            allow_all_outbound: true,
            allow_all_ipv6_outbound: true,
            ..state
        };
        let rendered = state.render("Open").unwrap();
        let egress = rendered[0].1.properties["SecurityGroupEgress"].as_array().unwrap();
        assert_eq!(egress.len(), 2);
        assert_eq!(egress[1]["CidrIpv6"], "::/0");
    }

    #[test]
    fn test_effective_ingress_is_union_without_duplicates() {
        let mut stack = stack();
        let ssh = IngressRule::new(Peer::Ipv4("10.0.0.0/8".parse().unwrap()), Port::Tcp(22), "ssh");
        let http = IngressRule::new(Peer::AnyIpv4, Port::Tcp(80), "http");
        let a = stack
            .add(SecurityGroup::new("A", Expr::str("vpc")).ingress(ssh.clone()))
            .unwrap();
        let b = stack
            .add(
                SecurityGroup::new("B", Expr::str("vpc"))
                    .ingress(ssh.clone())
                    .ingress(http.clone()),
            )
            .unwrap();
        let rules = stack.effective_ingress(&[&a, &b]).unwrap();
        assert_eq!(rules, vec![ssh, http]);
    }

    #[test]
    fn test_ingress_on_imported_group() {
        let mut stack = stack();
        stack
            .add(IngressOnGroup::new(
                "DbFromJob",
                Expr::import("BaseDbSecurityGroupId"),
                IngressRule::new(Peer::SecurityGroup(Expr::str("sg-1")), Port::Tcp(5432), "job"),
            ))
            .unwrap();
        let template = stack.synth().unwrap();
        assert!(template.imported_names().contains("BaseDbSecurityGroupId"));
        assert_eq!(template.resources["DbFromJob"].properties["ToPort"], 5432);
    }
}
