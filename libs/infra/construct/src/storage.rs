//! S3 buckets.

use regex::Regex;
use serde_json::{Map, Value, json};
use std::net::Ipv4Addr;
use std::sync::LazyLock;
use strum::{Display, EnumString};

use crate::error::{SynthError, SynthResult};
use crate::iam::{LAMBDA_SERVICE, Role};
use crate::stack::{Construct, Stack, logical_id};
use crate::template::{Expr, RemovalPolicy, Resource};

static BUCKET_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9][a-z0-9.-]{1,61}[a-z0-9]$").unwrap());

const AUTO_DELETE_PROVIDER: &str = "CustomS3AutoDeleteObjectsCustomResourceProvider";
const AUTO_DELETE_HANDLER_CODE: &str = include_str!("../assets/auto_delete_objects.py");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Default)]
#[strum(serialize_all = "kebab-case", ascii_case_insensitive)]
pub enum BucketEncryption {
    #[default]
    S3Managed,
    KmsManaged,
    Unencrypted,
}

/// Check an S3 bucket name against the naming rules
pub fn validate_bucket_name(name: &str) -> SynthResult<()> {
    let invalid = |reason: &str| SynthError::InvalidBucketName {
        name: name.to_string(),
        reason: reason.to_string(),
    };
    if name.len() < 3 || name.len() > 63 {
        return Err(invalid("must be between 3 and 63 characters"));
    }
    if !BUCKET_NAME.is_match(name) {
        return Err(invalid(
            "only lowercase letters, digits, dots and hyphens; must start and end with a letter or digit",
        ));
    }
    if name.contains("..") || name.contains(".-") || name.contains("-.") {
        return Err(invalid("dots may not be adjacent to dots or hyphens"));
    }
    if name.parse::<Ipv4Addr>().is_ok() {
        return Err(invalid("must not be formatted as an IP address"));
    }
    if name.starts_with("xn--") || name.starts_with("sthree-") {
        return Err(invalid("uses a reserved prefix"));
    }
    if name.ends_with("-s3alias") || name.ends_with("--ol-s3") {
        return Err(invalid("uses a reserved suffix"));
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct Bucket {
    id: String,
    bucket_name: Option<String>,
    versioned: bool,
    encryption: BucketEncryption,
    block_public_access: bool,
    removal_policy: RemovalPolicy,
    auto_delete_objects: bool,
}

impl Bucket {
    /// Private by default: all public access blocked, S3-managed encryption
    pub fn new(id: &str) -> Self {
        Self {
            id: logical_id(&[id]),
            bucket_name: None,
            versioned: false,
            encryption: BucketEncryption::S3Managed,
            block_public_access: true,
            removal_policy: RemovalPolicy::Retain,
            auto_delete_objects: false,
        }
    }

    pub fn bucket_name(mut self, name: &str) -> Self {
        self.bucket_name = Some(name.to_string());
        self
    }

    pub fn versioned(mut self, versioned: bool) -> Self {
        self.versioned = versioned;
        self
    }

    pub fn encryption(mut self, encryption: BucketEncryption) -> Self {
        self.encryption = encryption;
        self
    }

    pub fn block_public_access(mut self, block: bool) -> Self {
        self.block_public_access = block;
        self
    }

    pub fn removal_policy(mut self, policy: RemovalPolicy) -> Self {
        self.removal_policy = policy;
        self
    }

    /// Empty the bucket when it is deleted. Needs `RemovalPolicy::Destroy`.
    pub fn auto_delete_objects(mut self, enabled: bool) -> Self {
        self.auto_delete_objects = enabled;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketHandle {
    pub logical_id: String,
    pub name: Expr,
    pub arn: Expr,
}

impl BucketHandle {
    /// ARN of the objects matching `pattern`, e.g. `*` or `chinook/*`
    pub fn arn_for_objects(&self, pattern: &str) -> Expr {
        Expr::join("", vec![self.arn.clone(), Expr::str(format!("/{}", pattern))])
    }
}

/// Lambda-backed provider shared by every auto-deleting bucket of a stack
fn ensure_auto_delete_provider(stack: &mut Stack) -> SynthResult<(String, String)> {
    let role_id = format!("{}Role", AUTO_DELETE_PROVIDER);
    let handler_id = format!("{}Handler", AUTO_DELETE_PROVIDER);
    if !stack.contains(&handler_id) {
        let role = stack.add(
            Role::new(&role_id, LAMBDA_SERVICE)
                .managed_policy("service-role/AWSLambdaBasicExecutionRole"),
        )?;
        stack.add_resource(
            &handler_id,
            Resource::new(
                "AWS::Lambda::Function",
                json!({
                    "Code": { "ZipFile": AUTO_DELETE_HANDLER_CODE },
                    "Description": "Empties S3 buckets on stack deletion",
                    "Handler": "index.handler",
                    "MemorySize": 128,
                    "Role": role.arn.to_json(),
                    "Runtime": "python3.12",
                    "Timeout": 900,
                }),
            )
            .depends_on(&role.logical_id),
        )?;
    }
    Ok((role_id, handler_id))
}

impl Construct for Bucket {
    type Handle = BucketHandle;

    fn declare(self, stack: &mut Stack) -> SynthResult<BucketHandle> {
        if let Some(name) = &self.bucket_name {
            validate_bucket_name(name)?;
        }
        if self.auto_delete_objects && self.removal_policy != RemovalPolicy::Destroy {
            return Err(SynthError::property(
                &self.id,
                "auto_delete_objects requires RemovalPolicy::Destroy",
            ));
        }

        let mut props = Map::new();
        if let Some(name) = &self.bucket_name {
            props.insert("BucketName".into(), json!(name));
        }
        match self.encryption {
            BucketEncryption::S3Managed | BucketEncryption::KmsManaged => {
                let algorithm = if self.encryption == BucketEncryption::S3Managed {
                    "AES256"
                } else {
                    "aws:kms"
                };
                props.insert(
                    "BucketEncryption".into(),
                    json!({
                        "ServerSideEncryptionConfiguration": [{
                            "ServerSideEncryptionByDefault": { "SSEAlgorithm": algorithm }
                        }]
                    }),
                );
            }
            BucketEncryption::Unencrypted => {}
        }
        if self.block_public_access {
            props.insert(
                "PublicAccessBlockConfiguration".into(),
                json!({
                    "BlockPublicAcls": true,
                    "BlockPublicPolicy": true,
                    "IgnorePublicAcls": true,
                    "RestrictPublicBuckets": true,
                }),
            );
        }
        if self.versioned {
            props.insert("VersioningConfiguration".into(), json!({ "Status": "Enabled" }));
        }
        if self.auto_delete_objects {
            props.insert(
                "Tags".into(),
                json!([{ "Key": "aws-cdk:auto-delete-objects", "Value": "true" }]),
            );
        }
        stack.add_resource(
            &self.id,
            Resource::new("AWS::S3::Bucket", Value::Object(props))
                .with_removal_policy(self.removal_policy),
        )?;

        let handle = BucketHandle {
            name: Expr::reference(&self.id),
            arn: Expr::get_att(&self.id, "Arn"),
            logical_id: self.id.clone(),
        };

        if self.auto_delete_objects {
            let (role_id, handler_id) = ensure_auto_delete_provider(stack)?;
            let policy_id = format!("{}Policy", self.id);
            stack.add_resource(
                &policy_id,
                Resource::new(
                    "AWS::S3::BucketPolicy",
                    json!({
                        "Bucket": handle.name.to_json(),
                        "PolicyDocument": {
                            "Statement": [{
                                "Action": ["s3:DeleteObject*", "s3:GetBucket*", "s3:List*", "s3:PutBucketPolicy"],
                                "Effect": "Allow",
                                "Principal": { "AWS": Expr::get_att(&role_id, "Arn").to_json() },
                                "Resource": [handle.arn.to_json(), handle.arn_for_objects("*").to_json()],
                            }],
                            "Version": "2012-10-17",
                        },
                    }),
                ),
            )?;
            stack.add_resource(
                &format!("{}AutoDeleteObjectsCustomResource", self.id),
                Resource::new(
                    "Custom::S3AutoDeleteObjects",
                    json!({
                        "BucketName": handle.name.to_json(),
                        "ServiceToken": Expr::get_att(&handler_id, "Arn").to_json(),
                    }),
                )
                .depends_on(&policy_id)
                .with_removal_policy(RemovalPolicy::Destroy),
            )?;
        }

        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_config::deploy::DeployTarget;

    #[test]
    fn test_bucket_name_rules() {
        assert!(validate_bucket_name("vinh.dataengineertraining").is_ok());
        assert!(validate_bucket_name("my-bucket-01").is_ok());
        for bad in [
            "ab",
            "UpperCase",
            "-leading",
            "trailing-",
            "double..dot",
            "dot.-hyphen",
            "192.168.5.4",
            "xn--punycode",
            "name-s3alias",
            "under_score",
        ] {
            assert!(validate_bucket_name(bad).is_err(), "{} should be rejected", bad);
        }
    }

    #[test]
    fn test_private_versioned_bucket() {
        let mut stack = Stack::new("Storage", DeployTarget::default());
        let bucket = stack
            .add(Bucket::new("Data").bucket_name("data.bucket").versioned(true))
            .unwrap();
        let template = stack.synth().unwrap();
        let resource = &template.resources[&bucket.logical_id];
        let block = &resource.properties["PublicAccessBlockConfiguration"];
        assert_eq!(block["BlockPublicAcls"], true);
        assert_eq!(block["RestrictPublicBuckets"], true);
        assert_eq!(resource.properties["VersioningConfiguration"]["Status"], "Enabled");
        assert_eq!(resource.deletion_policy.as_deref(), Some("Retain"));
    }

    #[test]
    fn test_auto_delete_requires_destroy() {
        let mut stack = Stack::new("Storage", DeployTarget::default());
        assert!(stack.add(Bucket::new("Data").auto_delete_objects(true)).is_err());
    }

    #[test]
    fn test_auto_delete_shares_one_provider() {
        let mut stack = Stack::new("Storage", DeployTarget::default());
        for id in ["A", "B"] {
            stack
                .add(
                    Bucket::new(id)
                        .removal_policy(RemovalPolicy::Destroy)
                        .auto_delete_objects(true),
                )
                .unwrap();
        }
        let template = stack.synth().unwrap();
        assert_eq!(template.resources_of_type("AWS::Lambda::Function").count(), 1);
        assert_eq!(template.resources_of_type("Custom::S3AutoDeleteObjects").count(), 2);
        let custom = &template.resources["AAutoDeleteObjectsCustomResource"];
        assert!(custom.depends_on.contains("APolicy"));
        assert_eq!(custom.deletion_policy.as_deref(), Some("Delete"));
    }
}
