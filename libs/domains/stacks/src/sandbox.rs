//! Stand-alone Postgres in a public subnet, reachable from one trusted block.

use core_config::deploy::DeployTarget;
use infra_construct::database::{DatabaseEngine, DatabaseHandle, DatabaseInstance};
use infra_construct::network::{SubnetConfiguration, SubnetSelection, SubnetType, Vpc};
use infra_construct::security_group::{Peer, SecurityGroup};
use infra_construct::template::Output;
use infra_construct::{RemovalPolicy, Stack};
use tracing::info;
use validator::Validate;

use crate::config::SandboxConfig;
use crate::error::StacksResult;

pub struct SandboxDatabaseStack;

impl SandboxDatabaseStack {
    /// `None` when no trusted CIDR is configured
    pub fn build(
        config: &SandboxConfig,
        target: &DeployTarget,
    ) -> StacksResult<Option<(Stack, DatabaseHandle)>> {
        config.validate()?;
        let Some(trusted) = config.trusted_cidr else {
            return Ok(None);
        };
        let mut stack = Stack::new(&config.stack_name, target.clone())
            .with_description("Publicly reachable Postgres sandbox");

        // A DB subnet group spans at least two zones
        let vpc = stack.add(
            Vpc::new("MyVPC")
                .max_azs(2)
                .nat_gateways(0)
                .subnet_configuration(vec![SubnetConfiguration::new("Public", SubnetType::Public)]),
        )?;
        let db_security_group = stack.add(
            SecurityGroup::new("DatabaseSecurityGroup", vpc.vpc_id.clone())
                .description("Security group for RDS instance"),
        )?;

        let database = stack.add(
            DatabaseInstance::new(
                "Database",
                &vpc,
                DatabaseEngine::postgres(config.db_postgres_version),
                config.db_instance_type,
            )
            .storage(20, Some(100))
            .subnets(SubnetSelection::Type(SubnetType::Public))
            .security_group(&db_security_group)
            .publicly_accessible(true)
            .removal_policy(RemovalPolicy::Destroy),
        )?;
        database.allow_default_port_from(
            &mut stack,
            Peer::Ipv4(trusted),
            "Allow PostgreSQL access",
        )?;

        stack.add_output(
            "DatabaseEndpoint",
            Output::new(database.endpoint_address.clone()),
        )?;
        stack.add_output(
            "DatabaseSecretArn",
            Output::new(database.secret_arn.clone()),
        )?;

        info!(stack = %config.stack_name, trusted = %trusted, "Declared sandbox database stack");
        Ok(Some((stack, database)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_without_trusted_cidr() {
        let built = SandboxDatabaseStack::build(&SandboxConfig::default(), &DeployTarget::default())
            .unwrap();
        assert!(built.is_none());
    }

    #[test]
    fn test_public_database_restricted_to_trusted_block() {
        let config = SandboxConfig {
            trusted_cidr: Some("203.0.113.0/24".parse().unwrap()),
            ..Default::default()
        };
        let (stack, database) = SandboxDatabaseStack::build(&config, &DeployTarget::default())
            .unwrap()
            .unwrap();
        let template = stack.synth().unwrap();
        let db = &template.resources[&database.logical_id].properties;
        assert_eq!(db["PubliclyAccessible"], true);
        let rules = template.resources["DatabaseSecurityGroup"].properties["SecurityGroupIngress"]
            .as_array()
            .unwrap()
            .clone();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0]["CidrIp"], "203.0.113.0/24");
        assert_eq!(rules[0]["FromPort"], 5432);
    }
}
