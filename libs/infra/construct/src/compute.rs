//! EC2 compute: instance types, machine images, block devices, single
//! instances and autoscaling groups.

use serde_json::{Map, Value, json};
use std::fmt;
use std::str::FromStr;
use strum::{Display, EnumString};
use tracing::debug;

use crate::error::{SynthError, SynthResult};
use crate::iam::{
    EC2_SERVICE, InstanceProfile, InstanceProfileHandle, PolicyStatement, Role, RoleHandle,
};
use crate::load_balancer::TargetGroupHandle;
use crate::network::{SubnetSelection, SubnetType, VpcHandle};
use crate::security_group::SecurityGroupHandle;
use crate::stack::{Construct, Stack, logical_id};
use crate::template::{Expr, Parameter, Resource};
use crate::user_data::UserData;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
#[strum(ascii_case_insensitive)]
pub enum InstanceClass {
    #[strum(to_string = "t3", serialize = "burstable3")]
    Burstable3,
    #[strum(to_string = "t3a", serialize = "burstable3-amd")]
    Burstable3Amd,
    #[strum(to_string = "t4g", serialize = "burstable4-graviton")]
    Burstable4Graviton,
    #[strum(to_string = "m5", serialize = "standard5")]
    Standard5,
    #[strum(to_string = "c5", serialize = "compute5")]
    Compute5,
    #[strum(to_string = "r5", serialize = "memory5")]
    Memory5,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display, EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum InstanceSize {
    Nano,
    Micro,
    Small,
    Medium,
    Large,
    Xlarge,
    #[strum(serialize = "2xlarge")]
    Xlarge2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstanceType {
    pub class: InstanceClass,
    pub size: InstanceSize,
}

impl InstanceType {
    pub fn of(class: InstanceClass, size: InstanceSize) -> Self {
        Self { class, size }
    }

    /// RDS spelling, `db.t3.micro`
    pub fn db_class(&self) -> String {
        format!("db.{}", self)
    }

    pub fn is_graviton(&self) -> bool {
        self.class == InstanceClass::Burstable4Graviton
    }
}

impl fmt::Display for InstanceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.class, self.size)
    }
}

impl FromStr for InstanceType {
    type Err = SynthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || SynthError::property("InstanceType", format!("unknown instance type '{}'", s));
        let s = s.trim().trim_start_matches("db.");
        let (class, size) = s.split_once('.').ok_or_else(invalid)?;
        Ok(Self {
            class: class.parse().map_err(|_| invalid())?,
            size: size.parse().map_err(|_| invalid())?,
        })
    }
}

const AMAZON_LINUX_2_SSM: &str = "/aws/service/ami-amazon-linux-latest/amzn2-ami-hvm-x86_64-gp2";
const AMAZON_LINUX_2023_SSM: &str =
    "/aws/service/ami-amazon-linux-latest/al2023-ami-kernel-default-x86_64";
const AMAZON_LINUX_2023_ARM_SSM: &str =
    "/aws/service/ami-amazon-linux-latest/al2023-ami-kernel-default-arm64";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MachineImage {
    /// Latest Amazon Linux 2, resolved at deploy time through SSM
    LatestAmazonLinux2,
    LatestAmazonLinux2023,
    LatestAmazonLinux2023Arm,
    Fixed(String),
}

impl MachineImage {
    pub fn ssm_parameter(&self) -> Option<&'static str> {
        match self {
            MachineImage::LatestAmazonLinux2 => Some(AMAZON_LINUX_2_SSM),
            MachineImage::LatestAmazonLinux2023 => Some(AMAZON_LINUX_2023_SSM),
            MachineImage::LatestAmazonLinux2023Arm => Some(AMAZON_LINUX_2023_ARM_SSM),
            MachineImage::Fixed(_) => None,
        }
    }

    /// Image id expression; SSM-backed images register a template parameter.
    pub fn resolve(&self, stack: &mut Stack) -> SynthResult<Expr> {
        match self {
            MachineImage::Fixed(ami) => {
                if !ami.starts_with("ami-") {
                    return Err(SynthError::property(
                        "MachineImage",
                        format!("'{}' is not an AMI id", ami),
                    ));
                }
                Ok(Expr::str(ami.clone()))
            }
            other => {
                let path = other.ssm_parameter().unwrap_or(AMAZON_LINUX_2_SSM);
                let id = logical_id(&["SsmParameterValue", path]);
                stack.add_parameter(
                    &id,
                    Parameter {
                        parameter_type: "AWS::SSM::Parameter::Value<AWS::EC2::Image::Id>".to_string(),
                        default: Some(path.to_string()),
                        description: None,
                    },
                )
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Default)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum EbsVolumeType {
    Gp2,
    #[default]
    Gp3,
    Io1,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockDevice {
    pub device_name: String,
    pub volume_size: u32,
    pub volume_type: EbsVolumeType,
    pub iops: Option<u32>,
    pub encrypted: bool,
}

impl BlockDevice {
    pub fn ebs(device_name: &str, volume_size: u32, volume_type: EbsVolumeType) -> Self {
        Self {
            device_name: device_name.to_string(),
            volume_size,
            volume_type,
            iops: None,
            encrypted: false,
        }
    }

    pub fn with_iops(mut self, iops: u32) -> Self {
        self.iops = Some(iops);
        self
    }

    pub fn encrypted(mut self) -> Self {
        self.encrypted = true;
        self
    }

    fn validate(&self, construct: &str) -> SynthResult<()> {
        if !(1..=16384).contains(&self.volume_size) {
            return Err(SynthError::property(
                construct,
                format!("volume size {} GiB must be between 1 and 16384", self.volume_size),
            ));
        }
        if self.volume_type == EbsVolumeType::Io1 && self.iops.is_none() {
            return Err(SynthError::property(construct, "io1 volumes require iops"));
        }
        Ok(())
    }

    fn to_json(&self) -> Value {
        let mut ebs = Map::new();
        ebs.insert("VolumeSize".into(), json!(self.volume_size));
        ebs.insert("VolumeType".into(), json!(self.volume_type.to_string()));
        ebs.insert("DeleteOnTermination".into(), json!(true));
        if self.encrypted {
            ebs.insert("Encrypted".into(), json!(true));
        }
        if let Some(iops) = self.iops {
            ebs.insert("Iops".into(), json!(iops));
        }
        json!({ "DeviceName": self.device_name, "Ebs": ebs })
    }
}

/// Shared launch settings of [`Instance`] and [`AutoScalingGroup`]
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub instance_type: InstanceType,
    pub machine_image: MachineImage,
    pub security_group: SecurityGroupHandle,
    pub user_data: UserData,
    pub block_devices: Vec<BlockDevice>,
    pub subnets: SubnetSelection,
    pub managed_policies: Vec<String>,
    pub statements: Vec<PolicyStatement>,
}

impl LaunchSpec {
    pub fn new(
        instance_type: InstanceType,
        machine_image: MachineImage,
        security_group: &SecurityGroupHandle,
    ) -> Self {
        Self {
            instance_type,
            machine_image,
            security_group: security_group.clone(),
            user_data: UserData::for_linux(),
            block_devices: Vec::new(),
            subnets: SubnetSelection::Type(SubnetType::Public),
            managed_policies: Vec::new(),
            statements: Vec::new(),
        }
    }

    pub fn user_data(mut self, user_data: UserData) -> Self {
        self.user_data = user_data;
        self
    }

    pub fn block_device(mut self, device: BlockDevice) -> Self {
        self.block_devices.push(device);
        self
    }

    pub fn subnets(mut self, selection: SubnetSelection) -> Self {
        self.subnets = selection;
        self
    }

    pub fn managed_policy(mut self, name: &str) -> Self {
        self.managed_policies.push(name.to_string());
        self
    }

    /// Inline permission for the instance role
    pub fn statement(mut self, statement: PolicyStatement) -> Self {
        self.statements.push(statement);
        self
    }

    fn validate(&self, construct: &str) -> SynthResult<()> {
        for device in &self.block_devices {
            device.validate(construct)?;
        }
        let arm_image = match self.machine_image {
            MachineImage::Fixed(_) => self.instance_type.is_graviton(),
            MachineImage::LatestAmazonLinux2023Arm => true,
            _ => false,
        };
        if arm_image != self.instance_type.is_graviton() {
            return Err(SynthError::property(
                construct,
                format!(
                    "machine image architecture does not match instance type {}",
                    self.instance_type
                ),
            ));
        }
        Ok(())
    }

    fn declare_identity(
        &self,
        stack: &mut Stack,
        id: &str,
    ) -> SynthResult<(RoleHandle, InstanceProfileHandle)> {
        let mut role = Role::new(&format!("{}InstanceRole", id), EC2_SERVICE);
        for policy in &self.managed_policies {
            role = role.managed_policy(policy);
        }
        for statement in &self.statements {
            role = role.statement(statement.clone());
        }
        let role = stack.add(role)?;
        let profile = stack.add(InstanceProfile::new(&format!("{}InstanceProfile", id), &role))?;
        Ok((role, profile))
    }

    fn block_device_json(&self) -> Option<Value> {
        if self.block_devices.is_empty() {
            None
        } else {
            Some(Value::Array(self.block_devices.iter().map(BlockDevice::to_json).collect()))
        }
    }
}

/// A single EC2 instance
#[derive(Debug, Clone)]
pub struct Instance {
    id: String,
    vpc: VpcHandle,
    spec: LaunchSpec,
    ipv6_address_count: u32,
}

impl Instance {
    pub fn new(id: &str, vpc: &VpcHandle, spec: LaunchSpec) -> Self {
        Self {
            id: logical_id(&[id]),
            vpc: vpc.clone(),
            spec,
            ipv6_address_count: 0,
        }
    }

    pub fn ipv6_address_count(mut self, count: u32) -> Self {
        self.ipv6_address_count = count;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceHandle {
    pub logical_id: String,
    pub instance_id: Expr,
    pub private_ip: Expr,
    pub role: RoleHandle,
}

impl Construct for Instance {
    type Handle = InstanceHandle;

    fn declare(self, stack: &mut Stack) -> SynthResult<InstanceHandle> {
        self.spec.validate(&self.id)?;
        if self.ipv6_address_count > 0 && !self.vpc.is_dual_stack() {
            return Err(SynthError::property(
                &self.id,
                "IPv6 addresses need a dual-stack VPC",
            ));
        }
        let subnet = self
            .vpc
            .select(&self.spec.subnets)?
            .into_iter()
            .next()
            .cloned()
            .ok_or_else(|| SynthError::property(&self.id, "no subnet selected"))?;

        let image = self.spec.machine_image.resolve(stack)?;
        let (role, profile) = self.spec.declare_identity(stack, &self.id)?;

        let mut props = Map::new();
        props.insert("AvailabilityZone".into(), subnet.availability_zone.to_json());
        props.insert("IamInstanceProfile".into(), profile.name.to_json());
        props.insert("ImageId".into(), image.to_json());
        props.insert("InstanceType".into(), json!(self.spec.instance_type.to_string()));
        props.insert(
            "SecurityGroupIds".into(),
            json!([self.spec.security_group.group_id.to_json()]),
        );
        props.insert("SubnetId".into(), subnet.subnet_id.to_json());
        props.insert("UserData".into(), self.spec.user_data.to_expr().to_json());
        props.insert(
            "Tags".into(),
            json!([{ "Key": "Name", "Value": format!("{}/{}", stack.name(), self.id) }]),
        );
        if let Some(devices) = self.spec.block_device_json() {
            props.insert("BlockDeviceMappings".into(), devices);
        }
        if self.ipv6_address_count > 0 {
            props.insert("Ipv6AddressCount".into(), json!(self.ipv6_address_count));
        }

        stack.add_resource(
            &self.id,
            Resource::new("AWS::EC2::Instance", Value::Object(props)).depends_on(&role.logical_id),
        )?;
        debug!(stack = %stack.name(), instance = %self.id, instance_type = %self.spec.instance_type, "Declared instance");

        Ok(InstanceHandle {
            instance_id: Expr::reference(&self.id),
            private_ip: Expr::get_att(&self.id, "PrivateIp"),
            logical_id: self.id,
            role,
        })
    }
}

/// Launch template + autoscaling group
#[derive(Debug, Clone)]
pub struct AutoScalingGroup {
    id: String,
    vpc: VpcHandle,
    spec: LaunchSpec,
    min_capacity: u32,
    max_capacity: u32,
    desired_capacity: Option<u32>,
    target_groups: Vec<Expr>,
}

impl AutoScalingGroup {
    pub fn new(id: &str, vpc: &VpcHandle, spec: LaunchSpec) -> Self {
        Self {
            id: logical_id(&[id]),
            vpc: vpc.clone(),
            spec,
            min_capacity: 1,
            max_capacity: 1,
            desired_capacity: None,
            target_groups: Vec::new(),
        }
    }

    pub fn capacity(mut self, min: u32, max: u32, desired: Option<u32>) -> Self {
        self.min_capacity = min;
        self.max_capacity = max;
        self.desired_capacity = desired;
        self
    }

    pub fn attach_to(mut self, target_group: &TargetGroupHandle) -> Self {
        self.target_groups.push(target_group.arn.clone());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutoScalingGroupHandle {
    pub logical_id: String,
    pub group_name: Expr,
    pub launch_template_id: Expr,
    pub role: RoleHandle,
}

impl Construct for AutoScalingGroup {
    type Handle = AutoScalingGroupHandle;

    fn declare(self, stack: &mut Stack) -> SynthResult<AutoScalingGroupHandle> {
        self.spec.validate(&self.id)?;
        if self.max_capacity == 0 || self.min_capacity > self.max_capacity {
            return Err(SynthError::property(
                &self.id,
                format!(
                    "capacity bounds min={} max={} are invalid",
                    self.min_capacity, self.max_capacity
                ),
            ));
        }
        if let Some(desired) = self.desired_capacity {
            if desired < self.min_capacity || desired > self.max_capacity {
                return Err(SynthError::property(
                    &self.id,
                    format!(
                        "desired capacity {} must be between {} and {}",
                        desired, self.min_capacity, self.max_capacity
                    ),
                ));
            }
        }
        let subnets: Vec<Value> = self
            .vpc
            .subnet_ids(&self.spec.subnets)?
            .iter()
            .map(Expr::to_json)
            .collect();

        let image = self.spec.machine_image.resolve(stack)?;
        let (role, profile) = self.spec.declare_identity(stack, &self.id)?;

        let template_id = format!("{}LaunchTemplate", self.id);
        let mut data = Map::new();
        data.insert("IamInstanceProfile".into(), json!({ "Arn": profile.arn.to_json() }));
        data.insert("ImageId".into(), image.to_json());
        data.insert("InstanceType".into(), json!(self.spec.instance_type.to_string()));
        data.insert(
            "SecurityGroupIds".into(),
            json!([self.spec.security_group.group_id.to_json()]),
        );
        data.insert("UserData".into(), self.spec.user_data.to_expr().to_json());
        data.insert(
            "TagSpecifications".into(),
            json!([
                { "ResourceType": "instance", "Tags": [{ "Key": "Name", "Value": format!("{}/{}", stack.name(), self.id) }] },
                { "ResourceType": "volume", "Tags": [{ "Key": "Name", "Value": format!("{}/{}", stack.name(), self.id) }] },
            ]),
        );
        if let Some(devices) = self.spec.block_device_json() {
            data.insert("BlockDeviceMappings".into(), devices);
        }
        stack.add_resource(
            &template_id,
            Resource::new(
                "AWS::EC2::LaunchTemplate",
                json!({ "LaunchTemplateData": Value::Object(data) }),
            )
            .depends_on(&role.logical_id),
        )?;

        let group_id = format!("{}ASG", self.id);
        let mut props = Map::new();
        props.insert("MinSize".into(), json!(self.min_capacity.to_string()));
        props.insert("MaxSize".into(), json!(self.max_capacity.to_string()));
        if let Some(desired) = self.desired_capacity {
            props.insert("DesiredCapacity".into(), json!(desired.to_string()));
        }
        props.insert(
            "LaunchTemplate".into(),
            json!({
                "LaunchTemplateId": Expr::reference(&template_id).to_json(),
                "Version": Expr::get_att(&template_id, "LatestVersionNumber").to_json(),
            }),
        );
        props.insert("VPCZoneIdentifier".into(), Value::Array(subnets));
        if !self.target_groups.is_empty() {
            props.insert(
                "TargetGroupARNs".into(),
                Value::Array(self.target_groups.iter().map(Expr::to_json).collect()),
            );
        }
        stack.add_resource(
            &group_id,
            Resource::new("AWS::AutoScaling::AutoScalingGroup", Value::Object(props)),
        )?;
        debug!(stack = %stack.name(), group = %group_id, min = self.min_capacity, max = self.max_capacity, "Declared autoscaling group");

        Ok(AutoScalingGroupHandle {
            group_name: Expr::reference(&group_id),
            launch_template_id: Expr::reference(&template_id),
            logical_id: group_id,
            role,
        })
    }
}
