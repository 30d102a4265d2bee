use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::iam::{self, Statement, StorageCredentials};
use crate::error::{Result, SynthError};
use crate::stack::{get_att, get_ref, join, RemovalPolicy, Resource, Stack};

pub const PUBLIC_READ_ACTIONS: &[&str] = &["s3:GetObject", "s3:ListBucket"];

const AUTO_DELETE_HANDLER: &str = r#"import boto3
import cfnresponse
from botocore.exceptions import ClientError


def handler(event, context):
    status = cfnresponse.SUCCESS
    if event["RequestType"] == "Delete":
        name = event["ResourceProperties"]["BucketName"]
        try:
            boto3.resource("s3").Bucket(name).object_versions.delete()
        except ClientError as e:
            if e.response["Error"]["Code"] != "NoSuchBucket":
                print(f"failed to empty {name}: {e}")
                status = cfnresponse.FAILED
    cfnresponse.send(event, context, status, {})
"#;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Input {
    /// physical name of the bucket. leave empty to let cloudformation pick one.
    pub bucket_name: String,
    /// anyone can read and list objects. a bucket policy granting exactly that is created with it.
    pub public_read: bool,
    /// deny every request that is not made over TLS.
    pub enforce_ssl: bool,
    pub removal_policy: RemovalPolicy,
    /// empty the bucket before cloudformation deletes it. without this, deleting
    /// a stack whose bucket still holds objects fails.
    pub auto_delete_objects: bool,
    pub credentials: StorageCredentials,
}

impl Default for Input {
    fn default() -> Self {
        Self {
            bucket_name: String::new(),
            public_read: true,
            enforce_ssl: true,
            removal_policy: RemovalPolicy::Destroy,
            auto_delete_objects: true,
            credentials: StorageCredentials::AccessKey,
        }
    }
}

impl Input {
    pub fn validate(&self) -> Result<()> {
        if !self.bucket_name.is_empty() {
            validate_bucket_name(&self.bucket_name)?;
        }
        if self.auto_delete_objects && self.removal_policy != RemovalPolicy::Destroy {
            return Err(SynthError::config(
                "storage.auto_delete_objects requires storage.removal_policy = \"destroy\"",
            ));
        }
        if self.removal_policy == RemovalPolicy::Snapshot {
            return Err(SynthError::config("buckets cannot be snapshotted, use destroy or retain"));
        }
        Ok(())
    }
}

pub fn validate_bucket_name(name: &str) -> Result<()> {
    let invalid = |why: &str| SynthError::config(format!("invalid bucket name {name:?}. {why}"));
    if name.len() < 3 || name.len() > 63 {
        return Err(invalid("Must be between 3 and 63 characters"));
    }
    if !name.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '.' || c == '-') {
        return Err(invalid("May only contain lowercase letters, numbers, dots and hyphens"));
    }
    let edge_ok = |c: Option<char>| c.map(|c| c.is_ascii_lowercase() || c.is_ascii_digit()).unwrap_or(false);
    if !edge_ok(name.chars().next()) || !edge_ok(name.chars().last()) {
        return Err(invalid("Must begin and end with a letter or number"));
    }
    if name.contains("..") {
        return Err(invalid("May not contain two consecutive dots"));
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct ObjectStore {
    pub bucket: String,
    pub policy: Option<String>,
    pub public_read: bool,
    pub statements: Vec<Statement>,
}

impl ObjectStore {
    pub fn bucket_name(&self) -> Value {
        get_ref(&self.bucket)
    }

    pub fn arn(&self) -> Value {
        get_att(&self.bucket, "Arn")
    }

    pub fn objects_arn(&self) -> Value {
        join("", vec![self.arn(), json!("/*")])
    }

    /// true if the bucket policy lets the anonymous principal read and list.
    pub fn anonymous_read_granted(&self) -> bool {
        self.statements.iter().any(|s| {
            s.is_anonymous()
                && s.effect == iam::Effect::Allow
                && PUBLIC_READ_ACTIONS.iter().all(|a| s.actions.iter().any(|x| x == a))
        })
    }
}

pub fn config(input: &Input, stack: &mut Stack) -> Result<ObjectStore> {
    input.validate()?;
    let logical_bucket_name = "MediaBucket";

    let mut bucket = json!({
        "PublicAccessBlockConfiguration": {
            "BlockPublicAcls": true,
            "IgnorePublicAcls": true,
            // a public bucket policy is only accepted if these two are off
            "BlockPublicPolicy": !input.public_read,
            "RestrictPublicBuckets": !input.public_read,
        },
        "Tags": [{ "Key": "fargate-rds:auto-delete-objects", "Value": input.auto_delete_objects.to_string() }],
    });
    if !input.bucket_name.is_empty() {
        bucket["BucketName"] = json!(input.bucket_name);
    }
    let bucket = stack.add(
        Resource::new(logical_bucket_name, "AWS::S3::Bucket", bucket).removal_policy(input.removal_policy),
    )?;

    let mut store = ObjectStore {
        bucket,
        policy: None,
        public_read: input.public_read,
        statements: vec![],
    };
    let both_arns = vec![store.arn(), store.objects_arn()];
    if input.enforce_ssl {
        store.statements.push(
            Statement::deny(&["s3:*"])
                .anyone()
                .resources(both_arns.clone())
                .condition(json!({ "Bool": { "aws:SecureTransport": "false" } })),
        );
    }
    if input.public_read {
        store.statements.push(Statement::allow(PUBLIC_READ_ACTIONS).anyone().resources(both_arns));
    }
    if !store.statements.is_empty() {
        let policy = stack.add(Resource::new(format!("{logical_bucket_name}Policy"), "AWS::S3::BucketPolicy", json!({
            "Bucket": store.bucket_name(),
            "PolicyDocument": iam::policy_document(&store.statements),
        })))?;
        store.policy = Some(policy);
    }

    if input.auto_delete_objects {
        add_auto_delete(stack, &store)?;
    }
    tracing::info!(public_read = input.public_read, enforce_ssl = input.enforce_ssl, "media bucket declared");
    Ok(store)
}

/// custom resource backed by an inline lambda that empties the bucket when the stack deletes it.
fn add_auto_delete(stack: &mut Stack, store: &ObjectStore) -> Result<()> {
    let prefix = format!("{}AutoDeleteObjects", store.bucket);
    let role = iam::service_role(
        stack,
        &format!("{prefix}Role"),
        "lambda.amazonaws.com",
        &[iam::LAMBDA_BASIC_EXECUTION],
        &[Statement::allow(&["s3:ListBucket", "s3:ListBucketVersions", "s3:DeleteObject", "s3:DeleteObjectVersion"])
            .resources(vec![store.arn(), store.objects_arn()])],
    )?;
    let function = stack.add(Resource::new(format!("{prefix}Handler"), "AWS::Lambda::Function", json!({
        "Runtime": "python3.12",
        "Handler": "index.handler",
        "Timeout": 900,
        "MemorySize": 128,
        "Role": get_att(&role, "Arn"),
        "Description": format!("empties {} before it is deleted", store.bucket),
        "Code": { "ZipFile": AUTO_DELETE_HANDLER },
    })))?;
    let mut cleanup = Resource::new(prefix, "Custom::S3AutoDeleteObjects", json!({
        "ServiceToken": get_att(&function, "Arn"),
        "BucketName": store.bucket_name(),
    }))
    .removal_policy(RemovalPolicy::Destroy);
    // the policy has to outlive the cleanup so the handler can still reach the bucket
    if let Some(policy) = &store.policy {
        cleanup = cleanup.depends_on(policy);
    }
    stack.add(cleanup)?;
    Ok(())
}
