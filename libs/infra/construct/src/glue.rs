//! AWS Glue jobs and network connections.

use serde_json::{Map, Value, json};
use std::collections::BTreeMap;
use strum::{Display, EnumString};
use tracing::debug;

use crate::error::{SynthError, SynthResult};
use crate::stack::{Construct, Stack, logical_id};
use crate::template::{Expr, Resource};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(ascii_case_insensitive)]
pub enum GlueCommand {
    #[strum(serialize = "pythonshell")]
    PythonShell,
    #[strum(serialize = "glueetl")]
    Etl,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
pub enum WorkerType {
    #[strum(serialize = "G.1X")]
    G1X,
    #[strum(serialize = "G.2X")]
    G2X,
}

/// Compute allotted to a job run
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum JobCapacity {
    /// DPUs for python shell jobs: 0.0625 or 1
    MaxCapacity(f64),
    Workers { worker_type: WorkerType, count: u32 },
}

#[derive(Debug, Clone)]
pub struct GlueJob {
    id: String,
    name: Option<String>,
    description: Option<String>,
    role_arn: Expr,
    command: GlueCommand,
    script_location: Expr,
    python_version: String,
    glue_version: Option<String>,
    capacity: JobCapacity,
    timeout_minutes: u32,
    max_retries: u32,
    max_concurrent_runs: u32,
    default_arguments: BTreeMap<String, Expr>,
    connections: Vec<Expr>,
}

impl GlueJob {
    /// Python shell job with 1/16 DPU, no retries and a one hour timeout
    pub fn python_shell(id: &str, role_arn: Expr, script_location: Expr) -> Self {
        Self {
            id: logical_id(&[id]),
            name: None,
            description: None,
            role_arn,
            command: GlueCommand::PythonShell,
            script_location,
            python_version: "3.9".to_string(),
            glue_version: Some("3.0".to_string()),
            capacity: JobCapacity::MaxCapacity(0.0625),
            timeout_minutes: 60,
            max_retries: 0,
            max_concurrent_runs: 1,
            default_arguments: BTreeMap::new(),
            connections: Vec::new(),
        }
    }

    pub fn etl(id: &str, role_arn: Expr, script_location: Expr) -> Self {
        Self {
            command: GlueCommand::Etl,
            python_version: "3".to_string(),
            glue_version: Some("4.0".to_string()),
            capacity: JobCapacity::Workers {
                worker_type: WorkerType::G1X,
                count: 2,
            },
            ..Self::python_shell(id, role_arn, script_location)
        }
    }

    pub fn name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    pub fn description(mut self, description: &str) -> Self {
        self.description = Some(description.to_string());
        self
    }

    pub fn capacity(mut self, capacity: JobCapacity) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn timeout_minutes(mut self, minutes: u32) -> Self {
        self.timeout_minutes = minutes;
        self
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Default job argument; the key is given without the leading `--`
    pub fn argument(mut self, key: &str, value: Expr) -> Self {
        self.default_arguments
            .insert(format!("--{}", key.trim_start_matches("--")), value);
        self
    }

    pub fn connection(mut self, connection_name: Expr) -> Self {
        self.connections.push(connection_name);
        self
    }

    fn validate(&self) -> SynthResult<()> {
        if let Some(name) = &self.name {
            if name.is_empty() || name.len() > 255 {
                return Err(SynthError::property(&self.id, "job name must be 1 to 255 characters"));
            }
        }
        if let Expr::Str(location) = &self.script_location {
            if !location.starts_with("s3://") {
                return Err(SynthError::property(
                    &self.id,
                    format!("script location '{}' must be an s3:// URL", location),
                ));
            }
        }
        if self.timeout_minutes == 0 {
            return Err(SynthError::property(&self.id, "timeout must be at least one minute"));
        }
        if self.max_retries > 10 {
            return Err(SynthError::property(&self.id, "max retries must be at most 10"));
        }
        match (self.command, self.capacity) {
            (GlueCommand::PythonShell, JobCapacity::MaxCapacity(dpu))
                if dpu == 0.0625 || dpu == 1.0 => {}
            (GlueCommand::PythonShell, _) => {
                return Err(SynthError::property(
                    &self.id,
                    "python shell jobs take a max capacity of 0.0625 or 1 DPU",
                ));
            }
            (GlueCommand::Etl, JobCapacity::Workers { count, .. }) if count >= 2 => {}
            (GlueCommand::Etl, _) => {
                return Err(SynthError::property(
                    &self.id,
                    "glueetl jobs need a worker type and at least 2 workers",
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlueJobHandle {
    pub logical_id: String,
    pub name: Expr,
}

impl Construct for GlueJob {
    type Handle = GlueJobHandle;

    fn declare(self, stack: &mut Stack) -> SynthResult<GlueJobHandle> {
        self.validate()?;

        let mut command = Map::new();
        command.insert("Name".into(), json!(self.command.to_string()));
        command.insert("PythonVersion".into(), json!(self.python_version));
        command.insert("ScriptLocation".into(), self.script_location.to_json());

        let mut props = Map::new();
        props.insert("Command".into(), Value::Object(command));
        props.insert("Role".into(), self.role_arn.to_json());
        props.insert(
            "ExecutionProperty".into(),
            json!({ "MaxConcurrentRuns": self.max_concurrent_runs }),
        );
        props.insert("MaxRetries".into(), json!(self.max_retries));
        props.insert("Timeout".into(), json!(self.timeout_minutes));
        match self.capacity {
            JobCapacity::MaxCapacity(dpu) => {
                props.insert("MaxCapacity".into(), json!(dpu));
            }
            JobCapacity::Workers { worker_type, count } => {
                props.insert("WorkerType".into(), json!(worker_type.to_string()));
                props.insert("NumberOfWorkers".into(), json!(count));
            }
        }
        if let Some(version) = &self.glue_version {
            props.insert("GlueVersion".into(), json!(version));
        }
        if let Some(name) = &self.name {
            props.insert("Name".into(), json!(name));
        }
        if let Some(description) = &self.description {
            props.insert("Description".into(), json!(description));
        }
        if !self.default_arguments.is_empty() {
            let args: Map<String, Value> = self
                .default_arguments
                .iter()
                .map(|(k, v)| (k.clone(), v.to_json()))
                .collect();
            props.insert("DefaultArguments".into(), Value::Object(args));
        }
        if !self.connections.is_empty() {
            props.insert(
                "Connections".into(),
                json!({ "Connections": self.connections.iter().map(Expr::to_json).collect::<Vec<_>>() }),
            );
        }

        stack.add_resource(&self.id, Resource::new("AWS::Glue::Job", Value::Object(props)))?;
        debug!(stack = %stack.name(), job = %self.id, command = %self.command, arguments = self.default_arguments.len(), "Declared glue job");
        Ok(GlueJobHandle {
            name: Expr::reference(&self.id),
            logical_id: self.id,
        })
    }
}

/// `NETWORK` connection that runs a job inside a VPC subnet
#[derive(Debug, Clone)]
pub struct GlueConnection {
    id: String,
    name: Option<String>,
    subnet_id: Expr,
    availability_zone: Expr,
    security_groups: Vec<Expr>,
}

impl GlueConnection {
    pub fn network(id: &str, subnet_id: Expr, availability_zone: Expr) -> Self {
        Self {
            id: logical_id(&[id]),
            name: None,
            subnet_id,
            availability_zone,
            security_groups: Vec::new(),
        }
    }

    pub fn name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    pub fn security_group(mut self, group_id: Expr) -> Self {
        self.security_groups.push(group_id);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlueConnectionHandle {
    pub logical_id: String,
    pub name: Expr,
}

impl Construct for GlueConnection {
    type Handle = GlueConnectionHandle;

    fn declare(self, stack: &mut Stack) -> SynthResult<GlueConnectionHandle> {
        if self.security_groups.is_empty() {
            return Err(SynthError::property(
                &self.id,
                "network connections need at least one security group",
            ));
        }
        let name = self
            .name
            .clone()
            .unwrap_or_else(|| format!("{}-{}", stack.name(), self.id).to_ascii_lowercase());
        stack.add_resource(
            &self.id,
            Resource::new(
                "AWS::Glue::Connection",
                json!({
                    "CatalogId": Expr::account_id().to_json(),
                    "ConnectionInput": {
                        "ConnectionProperties": {},
                        "ConnectionType": "NETWORK",
                        "Name": name,
                        "PhysicalConnectionRequirements": {
                            "AvailabilityZone": self.availability_zone.to_json(),
                            "SecurityGroupIdList": self.security_groups.iter().map(Expr::to_json).collect::<Vec<_>>(),
                            "SubnetId": self.subnet_id.to_json(),
                        },
                    },
                }),
            ),
        )?;
        Ok(GlueConnectionHandle {
            name: Expr::reference(&self.id),
            logical_id: self.id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_config::deploy::DeployTarget;

    fn job() -> GlueJob {
        GlueJob::python_shell(
            "ChinookEtl",
            Expr::str("arn:aws:iam::123456789012:role/job"),
            Expr::str("s3://bucket/scripts/chinook_etl.py"),
        )
    }

    #[test]
    fn test_python_shell_job_renders_sorted_arguments() {
        let mut stack = Stack::new("Etl", DeployTarget::default());
        stack
            .add(
                job()
                    .argument("OUTPUT_BUCKET", Expr::import("BaseBucketName"))
                    .argument("--DB_ENDPOINT", Expr::import("BaseDatabaseEndpoint")),
            )
            .unwrap();
        let template = stack.synth().unwrap();
        let props = &template.resources["ChinookEtl"].properties;
        assert_eq!(props["Command"]["Name"], "pythonshell");
        assert_eq!(props["MaxCapacity"], 0.0625);
        let keys: Vec<&String> = props["DefaultArguments"].as_object().unwrap().keys().collect();
        assert_eq!(keys, vec!["--DB_ENDPOINT", "--OUTPUT_BUCKET"]);
    }

    #[test]
    fn test_job_validation() {
        let mut stack = Stack::new("Etl", DeployTarget::default());
        assert!(stack
            .add(job().capacity(JobCapacity::MaxCapacity(2.0)))
            .is_err());
        assert!(stack.add(job().timeout_minutes(0)).is_err());
        let local = GlueJob::python_shell("J", Expr::str("arn"), Expr::str("/tmp/script.py"));
        assert!(stack.add(local).is_err());
        let etl = GlueJob::etl("E", Expr::str("arn"), Expr::str("s3://b/s.py")).capacity(
            JobCapacity::Workers {
                worker_type: WorkerType::G1X,
                count: 1,
            },
        );
        assert!(stack.add(etl).is_err());
    }

    #[test]
    fn test_network_connection() {
        let mut stack = Stack::new("Etl", DeployTarget::default());
        let conn = stack
            .add(
                GlueConnection::network(
                    "DbConnection",
                    Expr::import("BaseIsolatedSubnetId"),
                    Expr::import("BaseIsolatedSubnetAz"),
                )
                .security_group(Expr::str("sg-123")),
            )
            .unwrap();
        let template = stack.synth().unwrap();
        let input = &template.resources[&conn.logical_id].properties["ConnectionInput"];
        assert_eq!(input["ConnectionType"], "NETWORK");
        assert_eq!(input["Name"], "etl-dbconnection");
        assert!(stack
            .add(GlueConnection::network("Other", Expr::str("s"), Expr::str("az")))
            .is_err());
    }
}
