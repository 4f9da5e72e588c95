//! IAM roles, inline policy statements and instance profiles.

use serde_json::{Value, json};

use crate::error::{SynthError, SynthResult};
use crate::stack::{Construct, Stack, logical_id};
use crate::template::{Expr, Resource};

pub const EC2_SERVICE: &str = "ec2.amazonaws.com";
pub const GLUE_SERVICE: &str = "glue.amazonaws.com";
pub const LAMBDA_SERVICE: &str = "lambda.amazonaws.com";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyStatement {
    pub actions: Vec<String>,
    pub resources: Vec<Expr>,
}

impl PolicyStatement {
    pub fn allow<I, S>(actions: I, resources: Vec<Expr>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            actions: actions.into_iter().map(Into::into).collect(),
            resources,
        }
    }

    fn to_json(&self) -> Value {
        let action = match self.actions.as_slice() {
            [single] => json!(single),
            many => json!(many),
        };
        let resource = match self.resources.as_slice() {
            [single] => single.to_json(),
            many => Value::Array(many.iter().map(Expr::to_json).collect()),
        };
        json!({ "Action": action, "Effect": "Allow", "Resource": resource })
    }
}

/// An IAM role assumable by one AWS service
#[derive(Debug, Clone)]
pub struct Role {
    id: String,
    service: String,
    description: Option<String>,
    managed_policies: Vec<String>,
    statements: Vec<PolicyStatement>,
}

impl Role {
    pub fn new(id: &str, service: &str) -> Self {
        Self {
            id: logical_id(&[id]),
            service: service.to_string(),
            description: None,
            managed_policies: Vec::new(),
            statements: Vec::new(),
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Attach an AWS-managed policy by path name, e.g. `service-role/AWSGlueServiceRole`
    pub fn managed_policy(mut self, name: &str) -> Self {
        self.managed_policies.push(name.to_string());
        self
    }

    pub fn statement(mut self, statement: PolicyStatement) -> Self {
        self.statements.push(statement);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleHandle {
    pub logical_id: String,
    pub name: Expr,
    pub arn: Expr,
}

impl Construct for Role {
    type Handle = RoleHandle;

    fn declare(self, stack: &mut Stack) -> SynthResult<RoleHandle> {
        if !self.service.ends_with(".amazonaws.com") {
            return Err(SynthError::property(
                &self.id,
                format!("'{}' is not a service principal", self.service),
            ));
        }
        if let Some(stmt) = self
            .statements
            .iter()
            .find(|s| s.actions.is_empty() || s.resources.is_empty())
        {
            return Err(SynthError::property(
                &self.id,
                format!("policy statement {:?} needs actions and resources", stmt.actions),
            ));
        }

        let mut properties = json!({
            "AssumeRolePolicyDocument": {
                "Statement": [{
                    "Action": "sts:AssumeRole",
                    "Effect": "Allow",
                    "Principal": { "Service": self.service },
                }],
                "Version": "2012-10-17",
            },
        });
        if let Some(description) = &self.description {
            properties["Description"] = json!(description);
        }
        if !self.managed_policies.is_empty() {
            properties["ManagedPolicyArns"] = Value::Array(
                self.managed_policies
                    .iter()
                    .map(|name| Expr::managed_policy_arn(name).to_json())
                    .collect(),
            );
        }
        if !self.statements.is_empty() {
            properties["Policies"] = json!([{
                "PolicyName": format!("{}DefaultPolicy", self.id),
                "PolicyDocument": {
                    "Statement": self.statements.iter().map(PolicyStatement::to_json).collect::<Vec<_>>(),
                    "Version": "2012-10-17",
                },
            }]);
        }

        stack.add_resource(&self.id, Resource::new("AWS::IAM::Role", properties))?;
        Ok(RoleHandle {
            name: Expr::reference(&self.id),
            arn: Expr::get_att(&self.id, "Arn"),
            logical_id: self.id,
        })
    }
}

/// Wraps a role so EC2 instances can assume it
#[derive(Debug, Clone)]
pub struct InstanceProfile {
    id: String,
    role: RoleHandle,
}

impl InstanceProfile {
    pub fn new(id: &str, role: &RoleHandle) -> Self {
        Self {
            id: logical_id(&[id]),
            role: role.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceProfileHandle {
    pub logical_id: String,
    pub name: Expr,
    pub arn: Expr,
}

impl Construct for InstanceProfile {
    type Handle = InstanceProfileHandle;

    fn declare(self, stack: &mut Stack) -> SynthResult<InstanceProfileHandle> {
        stack.add_resource(
            &self.id,
            Resource::new(
                "AWS::IAM::InstanceProfile",
                json!({ "Roles": [self.role.name.to_json()] }),
            ),
        )?;
        Ok(InstanceProfileHandle {
            name: Expr::reference(&self.id),
            arn: Expr::get_att(&self.id, "Arn"),
            logical_id: self.id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_config::deploy::DeployTarget;

    #[test]
    fn test_role_renders_trust_and_policies() {
        let mut stack = Stack::new("Iam", DeployTarget::default());
        let role = stack
            .add(
                Role::new("JobRole", GLUE_SERVICE)
                    .managed_policy("service-role/AWSGlueServiceRole")
                    .statement(PolicyStatement::allow(
                        ["s3:PutObject"],
                        vec![Expr::str("arn:aws:s3:::bucket/*")],
                    )),
            )
            .unwrap();
        assert_eq!(role.arn, Expr::get_att("JobRole", "Arn"));

        let template = stack.synth().unwrap();
        let props = &template.resources["JobRole"].properties;
        assert_eq!(
            props["AssumeRolePolicyDocument"]["Statement"][0]["Principal"]["Service"],
            "glue.amazonaws.com"
        );
        assert_eq!(
            props["Policies"][0]["PolicyDocument"]["Statement"][0]["Action"],
            "s3:PutObject"
        );
        assert_eq!(props["ManagedPolicyArns"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_role_rejects_empty_statement() {
        let mut stack = Stack::new("Iam", DeployTarget::default());
        let err = stack
            .add(Role::new("R", EC2_SERVICE).statement(PolicyStatement::allow(
                Vec::<String>::new(),
                vec![Expr::str("*")],
            )))
            .unwrap_err();
        assert!(matches!(err, SynthError::InvalidProperty { .. }));
        assert!(stack.add(Role::new("R2", "example.com")).is_err());
    }

    #[test]
    fn test_instance_profile_references_role() {
        let mut stack = Stack::new("Iam", DeployTarget::default());
        let role = stack.add(Role::new("InstanceRole", EC2_SERVICE)).unwrap();
        let profile = stack
            .add(InstanceProfile::new("InstanceProfile", &role))
            .unwrap();
        let template = stack.synth().unwrap();
        assert_eq!(
            template.resources[&profile.logical_id].properties["Roles"][0],
            json!({ "Ref": "InstanceRole" })
        );
    }
}
