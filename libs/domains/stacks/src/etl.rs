//! Glue ETL stack consuming the base stack's exports.

use core_config::deploy::DeployTarget;
use infra_construct::glue::{GlueConnection, GlueConnectionHandle, GlueJob, GlueJobHandle, JobCapacity};
use infra_construct::iam::{GLUE_SERVICE, PolicyStatement, Role, RoleHandle};
use infra_construct::security_group::{
    IngressOnGroup, IngressRule, Port, SecurityGroup, SecurityGroupHandle,
};
use infra_construct::template::Output;
use infra_construct::{Expr, Stack};
use tracing::info;
use validator::Validate;

use crate::config::EtlStackConfig;
use crate::error::StacksResult;
use crate::exports::ExportNames;

/// Python shell launcher that fetches and runs the `chinook-etl` binary
pub const LAUNCHER_SCRIPT: &str = include_str!("../scripts/run_chinook_etl.py");
/// Bucket key of [`LAUNCHER_SCRIPT`] unless a script location is configured
pub const SCRIPT_KEY: &str = "scripts/run_chinook_etl.py";
/// Bucket key of the `chinook-etl` binary unless a binary location is configured
pub const BINARY_KEY: &str = "bin/chinook-etl";

#[derive(Debug, Clone)]
pub struct EtlStack {
    pub job: GlueJobHandle,
    pub role: RoleHandle,
    pub security_group: SecurityGroupHandle,
    pub connection: GlueConnectionHandle,
}

fn object_url(bucket_name: &Expr, key: &str) -> Expr {
    Expr::join(
        "",
        vec![Expr::str("s3://"), bucket_name.clone(), Expr::str(format!("/{}", key))],
    )
}

fn bucket_arn(bucket_name: &Expr, suffix: &str) -> Expr {
    Expr::join(
        "",
        vec![
            Expr::str("arn:"),
            Expr::partition(),
            Expr::str(":s3:::"),
            bucket_name.clone(),
            Expr::str(suffix),
        ],
    )
}

impl EtlStack {
    pub fn build(
        config: &EtlStackConfig,
        exports: &ExportNames,
        target: &DeployTarget,
    ) -> StacksResult<(Stack, EtlStack)> {
        config.validate()?;
        let mut stack = Stack::new(&config.stack_name, target.clone())
            .with_description("Glue job extracting the Chinook tables into the training bucket");

        let vpc_id = stack.import_value(&exports.vpc_id);
        let bucket_name = stack.import_value(&exports.bucket_name);
        let db_endpoint = stack.import_value(&exports.database_endpoint);
        let db_name = stack.import_value(&exports.database_name);
        let db_security_group = stack.import_value(&exports.db_security_group_id);
        let db_secret = stack.import_value(&exports.database_secret_arn);

        let security_group = stack.add(
            SecurityGroup::new("GlueJobSecurityGroup", vpc_id)
                .description("Security group for the Glue ETL job"),
        )?;
        // Glue requires a self-referencing rule on every connection group
        stack.add_ingress_rule(
            &security_group,
            IngressRule::new(
                security_group.as_peer(),
                Port::AllTcp,
                "Allow Glue workers to reach each other",
            ),
        )?;
        stack.add(IngressOnGroup::new(
            "DatabaseIngressFromGlueJob",
            db_security_group,
            IngressRule::new(
                security_group.as_peer(),
                Port::Tcp(config.db_port),
                "Allow PostgreSQL access from the Glue job",
            ),
        ))?;

        let subnet_id = stack.import_value(&exports.isolated_subnet_id);
        let availability_zone = stack.import_value(&exports.isolated_subnet_az);
        let connection = stack.add(
            GlueConnection::network("DatabaseConnection", subnet_id, availability_zone)
                .security_group(security_group.group_id.clone()),
        )?;

        let role = stack.add(
            Role::new("GlueJobRole", GLUE_SERVICE)
                .description("Role assumed by the Chinook ETL job")
                .managed_policy("service-role/AWSGlueServiceRole")
                .statement(PolicyStatement::allow(
                    ["s3:GetObject", "s3:PutObject", "s3:ListBucket"],
                    vec![bucket_arn(&bucket_name, ""), bucket_arn(&bucket_name, "/*")],
                ))
                .statement(PolicyStatement::allow(
                    ["secretsmanager:GetSecretValue"],
                    vec![db_secret.clone()],
                )),
        )?;

        let script_location = match &config.script_location {
            Some(location) => Expr::str(location),
            None => object_url(&bucket_name, SCRIPT_KEY),
        };
        let binary_location = match &config.binary_location {
            Some(location) => Expr::str(location),
            None => object_url(&bucket_name, BINARY_KEY),
        };

        let mut job = GlueJob::python_shell("ChinookEtlJob", role.arn.clone(), script_location)
            .name(&config.job_name)
            .description("Extract Chinook tables to CSV in the training bucket")
            .capacity(JobCapacity::MaxCapacity(config.max_capacity))
            .timeout_minutes(config.timeout_minutes)
            .max_retries(config.max_retries)
            .argument("ETL_BINARY_URI", binary_location)
            .argument("DB_ENDPOINT", db_endpoint)
            .argument("DB_PORT", Expr::str(config.db_port.to_string()))
            .argument("DB_NAME", db_name)
            .argument("DB_USER", Expr::secret_field(db_secret.clone(), "username"))
            .argument("DB_PASSWORD", Expr::secret_field(db_secret, "password"))
            .argument("OUTPUT_BUCKET", bucket_name)
            .argument("KEY_PREFIX", Expr::str(&config.key_prefix))
            .connection(connection.name.clone());
        if !config.tables.is_empty() {
            job = job.argument("TABLES", Expr::str(config.tables.join(",")));
        }
        let job = stack.add(job)?;

        stack.add_output(
            "JobName",
            Output::new(job.name.clone()).with_description("Name of the Chinook ETL job"),
        )?;

        info!(stack = %config.stack_name, job = %config.job_name, "Declared ETL stack");

        Ok((
            stack,
            EtlStack {
                job,
                role,
                security_group,
                connection,
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn synth(config: &EtlStackConfig) -> infra_construct::Template {
        let (stack, _) =
            EtlStack::build(config, &ExportNames::default(), &DeployTarget::default()).unwrap();
        stack.synth().unwrap()
    }

    #[test]
    fn test_imports_base_exports() {
        let template = synth(&EtlStackConfig::default());
        let imports = template.imported_names();
        for name in [
            "BaseVpcId",
            "BaseBucketName",
            "BaseDatabaseEndpoint",
            "BaseDatabaseName",
            "BaseDbSecurityGroupId",
        ] {
            assert!(imports.contains(name), "missing import {}", name);
        }
        assert!(template.export_names().is_empty());
    }

    #[test]
    fn test_job_arguments() {
        let template = synth(&EtlStackConfig::default());
        let props = &template.resources["ChinookEtlJob"].properties;
        let args = props["DefaultArguments"].as_object().unwrap();
        for key in [
            "--DB_ENDPOINT",
            "--DB_NAME",
            "--DB_USER",
            "--DB_PASSWORD",
            "--OUTPUT_BUCKET",
        ] {
            assert!(args.contains_key(key), "missing argument {}", key);
        }
        assert!(!args.contains_key("--TABLES"));
        assert_eq!(args["--DB_NAME"]["Fn::ImportValue"], "BaseDatabaseName");
        assert_eq!(props["Name"], "chinook-etl");
        let password = serde_json::to_string(&args["--DB_PASSWORD"]).unwrap();
        assert!(password.contains("{{resolve:secretsmanager:"));
        assert!(password.contains(":SecretString:password::}}"));
    }

    #[test]
    fn test_database_ingress_on_imported_group() {
        let template = synth(&EtlStackConfig::default());
        let rule = &template.resources["DatabaseIngressFromGlueJob"].properties;
        assert_eq!(rule["GroupId"]["Fn::ImportValue"], "BaseDbSecurityGroupId");
        assert_eq!(rule["FromPort"], 5432);
        assert_eq!(
            rule["SourceSecurityGroupId"]["Fn::GetAtt"][0],
            "GlueJobSecurityGroup"
        );
    }

    #[test]
    fn test_default_job_runs_launcher_for_binary() {
        let template = synth(&EtlStackConfig::default());
        let props = &template.resources["ChinookEtlJob"].properties;
        assert_eq!(props["Command"]["Name"], "pythonshell");

        let script = &props["Command"]["ScriptLocation"]["Fn::Join"][1];
        assert_eq!(script[1]["Fn::ImportValue"], "BaseBucketName");
        assert_eq!(script[2], "/scripts/run_chinook_etl.py");

        let binary = &props["DefaultArguments"]["--ETL_BINARY_URI"]["Fn::Join"][1];
        assert_eq!(binary[0], "s3://");
        assert_eq!(binary[1]["Fn::ImportValue"], "BaseBucketName");
        assert_eq!(binary[2], "/bin/chinook-etl");

        assert!(LAUNCHER_SCRIPT.contains("--ETL_BINARY_URI"));
        assert!(LAUNCHER_SCRIPT.contains("subprocess.call([BINARY_PATH] + sys.argv[1:]"));
    }

    #[test]
    fn test_custom_script_and_tables() {
        let config = EtlStackConfig {
            script_location: Some("s3://artifacts/etl/chinook.py".into()),
            binary_location: Some("s3://artifacts/bin/chinook-etl".into()),
            tables: vec!["Album".into(), "Track".into()],
            ..Default::default()
        };
        let template = synth(&config);
        let props = &template.resources["ChinookEtlJob"].properties;
        assert_eq!(props["Command"]["ScriptLocation"], "s3://artifacts/etl/chinook.py");
        assert_eq!(props["DefaultArguments"]["--TABLES"], "Album,Track");
        assert_eq!(
            props["DefaultArguments"]["--ETL_BINARY_URI"],
            "s3://artifacts/bin/chinook-etl"
        );
    }
}
