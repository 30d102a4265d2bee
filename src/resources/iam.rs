use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::Result;
use crate::stack::{get_att, get_ref, sub, Resource, Stack};

pub const S3_FULL_ACCESS: &str = "AmazonS3FullAccess";
pub const ECS_TASK_EXECUTION: &str = "service-role/AmazonECSTaskExecutionRolePolicy";
pub const LAMBDA_BASIC_EXECUTION: &str = "service-role/AWSLambdaBasicExecutionRole";

/// How the application container authenticates against the media bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StorageCredentials {
    /// a long lived IAM user access key, injected as plain environment variables.
    /// only acceptable for development deployments.
    #[default]
    AccessKey,
    /// no key material at all: the sdk in the container picks up the task role.
    TaskRole,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    Allow,
    Deny,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub effect: Effect,
    pub principal: Option<Value>,
    pub actions: Vec<String>,
    pub resources: Vec<Value>,
    pub condition: Option<Value>,
}

impl Statement {
    pub fn allow(actions: &[&str]) -> Self {
        Self::new(Effect::Allow, actions)
    }

    pub fn deny(actions: &[&str]) -> Self {
        Self::new(Effect::Deny, actions)
    }

    fn new(effect: Effect, actions: &[&str]) -> Self {
        Self {
            effect,
            principal: None,
            actions: actions.iter().map(|a| a.to_string()).collect(),
            resources: vec![],
            condition: None,
        }
    }

    pub fn resources(mut self, resources: Vec<Value>) -> Self {
        self.resources = resources;
        self
    }

    /// the anonymous principal
    pub fn anyone(mut self) -> Self {
        self.principal = Some(json!({ "AWS": "*" }));
        self
    }

    pub fn condition(mut self, condition: Value) -> Self {
        self.condition = Some(condition);
        self
    }

    pub fn is_anonymous(&self) -> bool {
        self.principal == Some(json!({ "AWS": "*" }))
    }

    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        let effect = match self.effect {
            Effect::Allow => "Allow",
            Effect::Deny => "Deny",
        };
        map.insert("Effect".to_string(), Value::String(effect.to_string()));
        if let Some(principal) = &self.principal {
            map.insert("Principal".to_string(), principal.clone());
        }
        map.insert("Action".to_string(), one_or_many(self.actions.iter().map(|a| Value::String(a.clone())).collect()));
        if !self.resources.is_empty() {
            map.insert("Resource".to_string(), one_or_many(self.resources.clone()));
        }
        if let Some(condition) = &self.condition {
            map.insert("Condition".to_string(), condition.clone());
        }
        Value::Object(map)
    }
}

fn one_or_many(mut values: Vec<Value>) -> Value {
    if values.len() == 1 {
        values.remove(0)
    } else {
        Value::Array(values)
    }
}

pub fn policy_document(statements: &[Statement]) -> Value {
    json!({
        "Version": "2012-10-17",
        "Statement": statements.iter().map(|s| s.to_value()).collect::<Vec<_>>(),
    })
}

pub fn assume_role_policy(service: &str) -> Value {
    json!({
        "Version": "2012-10-17",
        "Statement": [{
            "Effect": "Allow",
            "Principal": { "Service": service },
            "Action": "sts:AssumeRole",
        }],
    })
}

pub fn managed_policy_arn(name: &str) -> Value {
    sub(format!("arn:${{AWS::Partition}}:iam::aws:policy/{name}"))
}

/// creates a role that `service` can assume.
pub fn service_role(
    stack: &mut Stack,
    logical_id: &str,
    service: &str,
    managed_policies: &[&str],
    inline_statements: &[Statement],
) -> Result<String> {
    let mut properties = json!({
        "AssumeRolePolicyDocument": assume_role_policy(service),
    });
    if !managed_policies.is_empty() {
        properties["ManagedPolicyArns"] = Value::Array(managed_policies.iter().map(|p| managed_policy_arn(p)).collect());
    }
    if !inline_statements.is_empty() {
        properties["Policies"] = json!([{
            "PolicyName": format!("{logical_id}DefaultPolicy"),
            "PolicyDocument": policy_document(inline_statements),
        }]);
    }
    stack.add(Resource::new(logical_id, "AWS::IAM::Role", properties))
}

#[derive(Debug, Clone)]
pub struct StorageIdentity {
    pub group: String,
    pub user: String,
    pub access_key: String,
}

impl StorageIdentity {
    pub fn access_key_id(&self) -> Value {
        get_ref(&self.access_key)
    }

    pub fn secret_access_key(&self) -> Value {
        get_att(&self.access_key, "SecretAccessKey")
    }
}

/// group with full s3 access, a user in it and a long lived access key for that user.
pub fn storage_identity(stack: &mut Stack) -> Result<StorageIdentity> {
    let group = stack.add(Resource::new("MediaGroup", "AWS::IAM::Group", json!({
        "ManagedPolicyArns": [managed_policy_arn(S3_FULL_ACCESS)],
    })))?;
    let user = stack.add(Resource::new("MediaUser", "AWS::IAM::User", json!({
        "Groups": [get_ref(&group)],
    })))?;
    let access_key = stack.add(Resource::new("MediaUserAccessKey", "AWS::IAM::AccessKey", json!({
        "UserName": get_ref(&user),
    })))?;
    stack.warn(
        "media storage uses a long lived access key that is passed to the container in plain text. \
         set storage.credentials = \"task-role\" for anything beyond development",
    );
    Ok(StorageIdentity {
        group,
        user,
        access_key,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::SynthContext;

    #[test]
    fn statements_collapse_single_values() {
        let s = Statement::allow(&["s3:GetObject"]).resources(vec![json!("arn:aws:s3:::b/*")]);
        assert_eq!(s.to_value(), json!({
            "Effect": "Allow",
            "Action": "s3:GetObject",
            "Resource": "arn:aws:s3:::b/*",
        }));
        let s = Statement::deny(&["s3:*"]).anyone()
            .resources(vec![json!("a"), json!("b")])
            .condition(json!({ "Bool": { "aws:SecureTransport": "false" } }));
        let v = s.to_value();
        assert_eq!(v["Effect"], "Deny");
        assert_eq!(v["Principal"], json!({ "AWS": "*" }));
        assert_eq!(v["Resource"], json!(["a", "b"]));
        assert!(s.is_anonymous());
    }

    #[test]
    fn identity_is_a_group_user_key_triple() {
        let mut stack = Stack::new("FargateRdsStack", SynthContext::for_tests()).unwrap();
        let identity = storage_identity(&mut stack).unwrap();
        let group = stack.resource(&identity.group).unwrap();
        assert_eq!(group.properties["ManagedPolicyArns"][0], managed_policy_arn(S3_FULL_ACCESS));
        let user = stack.resource(&identity.user).unwrap();
        assert_eq!(user.properties["Groups"][0], get_ref("MediaGroup"));
        assert_eq!(identity.secret_access_key(), get_att("MediaUserAccessKey", "SecretAccessKey"));
        assert_eq!(stack.warnings().len(), 1);
    }

    #[test]
    fn service_roles_carry_trust_and_policies() {
        let mut stack = Stack::new("FargateRdsStack", SynthContext::for_tests()).unwrap();
        let role = service_role(
            &mut stack,
            "TaskRole",
            "ecs-tasks.amazonaws.com",
            &[S3_FULL_ACCESS],
            &[Statement::allow(&["secretsmanager:GetSecretValue"]).resources(vec![json!("*")])],
        ).unwrap();
        let role = stack.resource(&role).unwrap();
        assert_eq!(role.properties["AssumeRolePolicyDocument"]["Statement"][0]["Principal"]["Service"], "ecs-tasks.amazonaws.com");
        assert_eq!(role.properties["Policies"][0]["PolicyName"], "TaskRoleDefaultPolicy");
        assert_eq!(role.properties["ManagedPolicyArns"].as_array().unwrap().len(), 1);
    }
}
