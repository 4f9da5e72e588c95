//! The base stack: network, load balancer, dashboard host, Postgres and the
//! training bucket. Everything a dependent stack needs is published under
//! the names in [`ExportNames`].

use core_config::deploy::DeployTarget;
use infra_construct::compute::{
    AutoScalingGroup, BlockDevice, EbsVolumeType, Instance, LaunchSpec, MachineImage,
};
use infra_construct::database::{DatabaseEngine, DatabaseHandle, DatabaseInstance};
use infra_construct::iam::PolicyStatement;
use infra_construct::load_balancer::{
    ApplicationLoadBalancer, HealthCheck, IpAddressType, Listener, LoadBalancerHandle,
    TargetGroup, TargetType,
};
use infra_construct::network::{
    IpProtocol, SubnetConfiguration, SubnetSelection, SubnetType, Vpc, VpcHandle,
};
use infra_construct::security_group::{IngressRule, Peer, Port, SecurityGroup, SecurityGroupHandle};
use infra_construct::storage::{Bucket, BucketEncryption, BucketHandle};
use infra_construct::template::Output;
use infra_construct::user_data::UserData;
use infra_construct::{Expr, RemovalPolicy, Stack};
use tracing::info;
use validator::Validate;

use crate::config::{BaseStackConfig, ComputeMode};
use crate::error::StacksResult;
use crate::exports::ExportNames;

const SETUP_METABASE: &str = include_str!("../scripts/setup-metabase.sh");
const SETUP_METABASE_PATH: &str = "/home/ec2-user/setup-metabase.sh";
const HTTP_PORT: u16 = 80;

/// Handles of the resources other code may want to inspect
#[derive(Debug, Clone)]
pub struct BaseStack {
    pub vpc: VpcHandle,
    pub alb: LoadBalancerHandle,
    pub alb_security_group: SecurityGroupHandle,
    pub ec2_security_group: SecurityGroupHandle,
    pub db_security_group: SecurityGroupHandle,
    pub bucket: BucketHandle,
    pub database: DatabaseHandle,
}

fn bootstrap_script(dual_stack: bool) -> StacksResult<UserData> {
    let mut user_data = UserData::for_linux();
    user_data.add_commands([
        "yum update -y",
        "amazon-linux-extras enable postgresql14",
        "yum install -y postgresql",
        "amazon-linux-extras install docker -y",
        "service docker start",
        "usermod -a -G docker ec2-user",
    ]);
    user_data.add_file(SETUP_METABASE_PATH, SETUP_METABASE, "+x")?;
    if dual_stack {
        user_data.add_commands(["aws configure set default.s3.use_dualstack_endpoint true"]);
    }
    Ok(user_data)
}

fn subnet_configuration(config: &BaseStackConfig) -> Vec<SubnetConfiguration> {
    let public = SubnetConfiguration::new("Public", SubnetType::Public).with_mask(config.subnet_mask);
    let private =
        SubnetConfiguration::new("Private", SubnetType::PrivateIsolated).with_mask(config.subnet_mask);
    if config.dual_stack {
        vec![public.with_ipv6_assign(), private.with_ipv6_assign()]
    } else {
        vec![public, private]
    }
}

impl BaseStack {
    /// Declare the base stack into a fresh [`Stack`]
    pub fn build(
        config: &BaseStackConfig,
        exports: &ExportNames,
        target: &DeployTarget,
    ) -> StacksResult<(Stack, BaseStack)> {
        config.validate()?;
        let mut stack = Stack::new(&config.stack_name, target.clone()).with_description(
            "Network, load balancer, dashboard host, Postgres and bucket for data engineering training",
        );

        let protocol = if config.dual_stack {
            IpProtocol::DualStack
        } else {
            IpProtocol::Ipv4Only
        };
        let vpc = stack.add(
            Vpc::new("MyVPC")
                .cidr(config.vpc_cidr)
                .max_azs(config.max_azs)
                .nat_gateways(0)
                .ip_protocol(protocol)
                .s3_gateway_endpoint(config.s3_gateway_endpoint)
                .subnet_configuration(subnet_configuration(config)),
        )?;

        let alb_security_group = stack.add(
            SecurityGroup::new("ALBSecurityGroup", vpc.vpc_id.clone())
                .description("Security group for Application Load Balancer")
                .allow_all_ipv6_outbound(config.dual_stack),
        )?;

        let mut ec2_group = SecurityGroup::new("EC2SecurityGroup", vpc.vpc_id.clone())
            .description("Security group for EC2 instances")
            .allow_all_ipv6_outbound(config.dual_stack);
        if let Some(prefix_list) = &config.instance_connect_prefix_list {
            ec2_group = ec2_group.ingress(IngressRule::new(
                Peer::PrefixList(prefix_list.clone()),
                Port::Tcp(22),
                "Allow SSH access from EC2 Instance Connect",
            ));
        }
        let ec2_security_group = stack.add(ec2_group)?;
        stack.add_ingress_rule(
            &ec2_security_group,
            IngressRule::new(
                alb_security_group.as_peer(),
                Port::Tcp(HTTP_PORT),
                "Allow HTTP access from ALB",
            ),
        )?;

        let db_security_group = stack.add(
            SecurityGroup::new("DatabaseSecurityGroup", vpc.vpc_id.clone())
                .description("Security group for RDS instance"),
        )?;

        let mut bucket = Bucket::new("DataEngineerTrainingBucket")
            .versioned(true)
            .encryption(BucketEncryption::S3Managed)
            .block_public_access(true)
            .removal_policy(config.removal_policy)
            .auto_delete_objects(config.bucket_auto_delete);
        if let Some(name) = &config.bucket_name {
            bucket = bucket.bucket_name(name);
        }
        let bucket = stack.add(bucket)?;

        let db_removal = match config.removal_policy {
            RemovalPolicy::Destroy => RemovalPolicy::Destroy,
            _ => RemovalPolicy::Snapshot,
        };
        let database = stack.add(
            DatabaseInstance::new(
                "Database",
                &vpc,
                DatabaseEngine::postgres(config.db_postgres_version),
                config.db_instance_type,
            )
            .storage(config.db_allocated_storage, Some(config.db_max_allocated_storage))
            .subnets(SubnetSelection::Type(SubnetType::PrivateIsolated))
            .security_group(&db_security_group)
            .publicly_accessible(false)
            .removal_policy(db_removal)
            .deletion_protection(db_removal != RemovalPolicy::Destroy)
            .database_name(&config.db_name),
        )?;
        database.allow_default_port_from(
            &mut stack,
            ec2_security_group.as_peer(),
            "Allow PostgreSQL access from the EC2 security group",
        )?;

        let launch = LaunchSpec::new(
            config.instance_type,
            MachineImage::LatestAmazonLinux2,
            &ec2_security_group,
        )
        .user_data(bootstrap_script(config.dual_stack)?)
        .block_device(BlockDevice::ebs(
            "/dev/xvda",
            config.root_volume_gib,
            EbsVolumeType::Gp3,
        ))
        .subnets(SubnetSelection::Type(SubnetType::Public))
        .statement(PolicyStatement::allow(
            ["secretsmanager:GetSecretValue", "secretsmanager:DescribeSecret"],
            vec![database.secret_arn.clone()],
        ))
        .statement(PolicyStatement::allow(
            ["s3:GetObject", "s3:PutObject", "s3:ListBucket"],
            vec![bucket.arn.clone(), bucket.arn_for_objects("*")],
        ));

        let health_check = HealthCheck::path(&config.health_check_path);
        let target_group = match config.compute {
            ComputeMode::Instance => {
                let instance = Instance::new("MetabaseInstance", &vpc, launch)
                    .ipv6_address_count(u32::from(config.dual_stack));
                let instance = stack.add(instance)?;
                stack.add(
                    TargetGroup::new("TargetGroup", &vpc, HTTP_PORT)
                        .target_type(TargetType::Instance)
                        .health_check(health_check)
                        .target(instance.instance_id),
                )?
            }
            ComputeMode::Asg => {
                let target_group = stack.add(
                    TargetGroup::new("TargetGroup", &vpc, HTTP_PORT)
                        .target_type(TargetType::Instance)
                        .health_check(health_check),
                )?;
                stack.add(
                    AutoScalingGroup::new("MetabaseFleet", &vpc, launch)
                        .capacity(config.asg_min, config.asg_max, Some(config.asg_desired))
                        .attach_to(&target_group),
                )?;
                target_group
            }
        };

        let ip_address_type = if config.dual_stack {
            IpAddressType::DualstackWithoutPublicIpv4
        } else {
            IpAddressType::Ipv4
        };
        let alb = stack.add(
            ApplicationLoadBalancer::new("ALB", &vpc, &alb_security_group)
                .internet_facing(true)
                .ip_address_type(ip_address_type),
        )?;
        stack.add(
            Listener::new("Listener", &alb, HTTP_PORT)
                .open(true)
                .forward_to(&target_group),
        )?;

        let isolated = vpc
            .select(&SubnetSelection::Type(SubnetType::PrivateIsolated))?
            .into_iter()
            .next()
            .cloned();

        stack.export("VpcId", vpc.vpc_id.clone(), &exports.vpc_id)?;
        stack.export("BucketName", bucket.name.clone(), &exports.bucket_name)?;
        stack.export(
            "DatabaseEndpoint",
            database.endpoint_address.clone(),
            &exports.database_endpoint,
        )?;
        stack.export(
            "DatabaseName",
            Expr::str(&config.db_name),
            &exports.database_name,
        )?;
        stack.export(
            "Ec2SecurityGroupId",
            ec2_security_group.group_id.clone(),
            &exports.ec2_security_group_id,
        )?;
        stack.export(
            "DbSecurityGroupId",
            db_security_group.group_id.clone(),
            &exports.db_security_group_id,
        )?;
        stack.export(
            "DatabaseSecretArn",
            database.secret_arn.clone(),
            &exports.database_secret_arn,
        )?;
        if let Some(subnet) = isolated {
            stack.export("IsolatedSubnetId", subnet.subnet_id, &exports.isolated_subnet_id)?;
            stack.export(
                "IsolatedSubnetAz",
                subnet.availability_zone,
                &exports.isolated_subnet_az,
            )?;
        }
        stack.add_output(
            "LoadBalancerDnsName",
            Output::new(alb.dns_name.clone()).with_description("Public DNS name of the dashboard"),
        )?;

        info!(stack = %config.stack_name, compute = %config.compute, dual_stack = config.dual_stack, "Declared base stack");

        Ok((
            stack,
            BaseStack {
                vpc,
                alb,
                alb_security_group,
                ec2_security_group,
                db_security_group,
                bucket,
                database,
            },
        ))
    }
}
