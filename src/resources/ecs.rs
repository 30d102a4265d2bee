use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::iam::{self, Statement, StorageIdentity};
use super::rds::DatabaseSecret;
use super::s3_bucket::ObjectStore;
use crate::asset::ImageAsset;
use crate::error::{Result, SynthError};
use crate::stack::{get_att, get_ref, RemovalPolicy, Resource, Stack};

pub const CONTAINER_NAME: &str = "container";

/// environment variables this module fills in itself.
const RESERVED_ENVIRONMENT: &[&str] = &["AWS_BUCKET_NAME", "AWS_REGION", "AWS_ACCESS_KEY_ID", "AWS_SECRET_KEY"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Input {
    /// cpu units, 1024 = 1 vCPU
    pub cpu: u32,
    pub memory_mib: u32,
    pub container_port: u16,
    /// docker build context, relative to the config file
    pub image_context: PathBuf,
    pub dockerfile: String,
    /// ECR repository the deploy script pushes the image to
    pub image_repository: String,
    pub log_stream_prefix: String,
    /// container variable -> field of the database secret
    pub secrets: BTreeMap<String, String>,
    /// extra plain variables
    pub environment: BTreeMap<String, String>,
}

impl Default for Input {
    fn default() -> Self {
        let secrets = [
            ("DATABASE_HOST", "host"),
            ("DATABASE_USERNAME", "username"),
            ("DATABASE_PASSWORD", "password"),
            ("DATABASE_NAME", "dbname"),
            ("DATABASE_PORT", "port"),
        ];
        Self {
            cpu: 512,
            memory_mib: 2048,
            container_port: 1337,
            image_context: PathBuf::from("app"),
            dockerfile: "Dockerfile".to_string(),
            image_repository: "fargate-rds-app".to_string(),
            log_stream_prefix: "app-logs".to_string(),
            secrets: secrets.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            environment: [("NODE_ENV".to_string(), "development".to_string())].into_iter().collect(),
        }
    }
}

impl Input {
    pub fn validate(&self) -> Result<()> {
        validate_fargate_size(self.cpu, self.memory_mib)?;
        if self.container_port == 0 {
            return Err(SynthError::config("service.container_port must not be 0"));
        }
        let repo_ok = !self.image_repository.is_empty()
            && self.image_repository.len() <= 256
            && self.image_repository.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || "-_./".contains(c));
        if !repo_ok {
            return Err(SynthError::config(format!("invalid image repository {:?}", self.image_repository)));
        }
        for key in self.secrets.keys().chain(self.environment.keys()) {
            let valid = key.chars().next().map(|c| c.is_ascii_alphabetic() || c == '_').unwrap_or(false)
                && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
            if !valid {
                return Err(SynthError::config(format!("invalid environment variable name {key:?}")));
            }
        }
        for key in self.environment.keys() {
            if self.secrets.contains_key(key) {
                return Err(SynthError::config(format!("{key} is set both as a secret and as a plain variable")));
            }
            if RESERVED_ENVIRONMENT.contains(&key.as_str()) {
                return Err(SynthError::config(format!("{key} is filled in by the stack and cannot be overridden")));
            }
        }
        if self.secrets.keys().any(|k| RESERVED_ENVIRONMENT.contains(&k.as_str())) {
            return Err(SynthError::config("service.secrets may not use a reserved variable name"));
        }
        Ok(())
    }
}

/// valid Fargate task sizes: cpu -> (min memory, max memory, step), all MiB.
const FARGATE_SIZES: &[(u32, u32, u32, u32)] = &[
    (256, 512, 2048, 512),
    (512, 1024, 4096, 1024),
    (1024, 2048, 8192, 1024),
    (2048, 4096, 16384, 1024),
    (4096, 8192, 30720, 1024),
    (8192, 16384, 61440, 4096),
    (16384, 32768, 122880, 8192),
];

pub fn validate_fargate_size(cpu: u32, memory_mib: u32) -> Result<()> {
    let fits = FARGATE_SIZES.iter().any(|(c, min, max, step)| {
        *c == cpu && memory_mib >= *min && memory_mib <= *max && (memory_mib - min) % step == 0
    });
    if !fits {
        return Err(SynthError::config(format!(
            "{cpu} cpu units with {memory_mib} MiB is not a valid Fargate task size"
        )));
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct ComputeTask {
    pub cluster: String,
    pub task_definition: String,
    pub execution_role: String,
    pub task_role: String,
    pub log_group: String,
    pub container_name: String,
    pub container_port: u16,
    /// container variable -> secret field
    pub secret_keys: BTreeMap<String, String>,
    pub environment_keys: Vec<String>,
}

pub fn cluster(stack: &mut Stack) -> Result<String> {
    stack.add(Resource::new("Cluster", "AWS::ECS::Cluster", json!({
        "ClusterSettings": [{ "Name": "containerInsights", "Value": "disabled" }],
    })))
}

pub struct TaskInputs<'a> {
    pub asset: &'a ImageAsset,
    pub database_secret: &'a DatabaseSecret,
    pub storage: &'a ObjectStore,
    /// present when the container authenticates with an access key
    pub identity: Option<&'a StorageIdentity>,
}

pub fn config(input: &Input, cluster: &str, inputs: TaskInputs<'_>, stack: &mut Stack) -> Result<ComputeTask> {
    input.validate()?;

    // resolve every secret before anything is added to the stack
    let mut secrets = vec![];
    for (name, field) in input.secrets.iter() {
        let value_from = inputs.database_secret.value_from(name, field)?;
        secrets.push(json!({ "Name": name, "ValueFrom": value_from }));
    }

    let mut environment: Vec<(String, Value)> = vec![
        ("AWS_BUCKET_NAME".to_string(), inputs.storage.bucket_name()),
        ("AWS_REGION".to_string(), get_ref("AWS::Region")),
    ];
    if let Some(identity) = inputs.identity {
        environment.push(("AWS_ACCESS_KEY_ID".to_string(), identity.access_key_id()));
        environment.push(("AWS_SECRET_KEY".to_string(), identity.secret_access_key()));
    }
    for (name, value) in input.environment.iter() {
        environment.push((name.clone(), json!(value)));
    }

    let log_group = stack.add(Resource::new("TaskLogGroup", "AWS::Logs::LogGroup", json!({}))
        .removal_policy(RemovalPolicy::Retain))?;
    let execution_role = iam::service_role(
        stack,
        "TaskExecutionRole",
        "ecs-tasks.amazonaws.com",
        &[iam::ECS_TASK_EXECUTION],
        &[Statement::allow(&["secretsmanager:GetSecretValue", "secretsmanager:DescribeSecret"])
            .resources(vec![inputs.database_secret.arn()])],
    )?;
    let task_role = iam::service_role(stack, "TaskRole", "ecs-tasks.amazonaws.com", &[iam::S3_FULL_ACCESS], &[])?;

    let container = json!({
        "Name": CONTAINER_NAME,
        "Image": inputs.asset.image_uri(),
        "Essential": true,
        "PortMappings": [{ "ContainerPort": input.container_port, "Protocol": "tcp" }],
        "Secrets": secrets,
        "Environment": environment.iter().map(|(k, v)| json!({ "Name": k, "Value": v })).collect::<Vec<_>>(),
        "LogConfiguration": {
            "LogDriver": "awslogs",
            "Options": {
                "awslogs-group": get_ref(&log_group),
                "awslogs-stream-prefix": input.log_stream_prefix,
                "awslogs-region": get_ref("AWS::Region"),
            },
        },
    });
    let task_definition = stack.add(Resource::new("TaskDefinition", "AWS::ECS::TaskDefinition", json!({
        "Family": format!("{}Task", stack.name()),
        "Cpu": input.cpu.to_string(),
        "Memory": input.memory_mib.to_string(),
        "NetworkMode": "awsvpc",
        "RequiresCompatibilities": ["FARGATE"],
        "ExecutionRoleArn": get_att(&execution_role, "Arn"),
        "TaskRoleArn": get_att(&task_role, "Arn"),
        "ContainerDefinitions": [container],
    })))?;
    tracing::info!(cpu = input.cpu, memory = input.memory_mib, image = %inputs.asset.image_name(), "task definition declared");

    Ok(ComputeTask {
        cluster: cluster.to_string(),
        task_definition,
        execution_role,
        task_role,
        log_group,
        container_name: CONTAINER_NAME.to_string(),
        container_port: input.container_port,
        secret_keys: input.secrets.clone(),
        environment_keys: environment.into_iter().map(|(k, _)| k).collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::SynthContext;
    use crate::resources::{iam, rds, s3_bucket, vpc};

    struct Fixture {
        stack: Stack,
        asset: ImageAsset,
        db: rds::DatabaseInstance,
        store: ObjectStore,
        identity: StorageIdentity,
    }

    fn fixture() -> Fixture {
        let mut stack = Stack::new("FargateRdsStack", SynthContext::for_tests()).unwrap();
        let network = vpc::config(&vpc::Input::default(), &mut stack).unwrap();
        let identity = iam::storage_identity(&mut stack).unwrap();
        let store = s3_bucket::config(&s3_bucket::Input::default(), &mut stack).unwrap();
        let db = rds::config(&rds::Input::default(), &network, &mut stack).unwrap();
        let asset = ImageAsset {
            directory: PathBuf::from("app"),
            dockerfile: "Dockerfile".into(),
            repository: "fargate-rds-app".into(),
            tag: "0badcafe".into(),
        };
        Fixture { stack, asset, db, store, identity }
    }

    fn container(stack: &Stack, task: &ComputeTask) -> Value {
        stack.resource(&task.task_definition).unwrap().properties["ContainerDefinitions"][0].clone()
    }

    #[test]
    fn fargate_sizes() {
        assert!(validate_fargate_size(512, 2048).is_ok());
        assert!(validate_fargate_size(256, 512).is_ok());
        assert!(validate_fargate_size(256, 1536).is_ok());
        assert!(validate_fargate_size(8192, 20480).is_ok());
        assert!(validate_fargate_size(512, 512).is_err());
        assert!(validate_fargate_size(512, 1500).is_err());
        assert!(validate_fargate_size(300, 1024).is_err());
        assert!(validate_fargate_size(8192, 18432).is_err());
    }

    #[test]
    fn task_wires_secrets_and_plain_configuration() {
        let mut f = fixture();
        let cluster = cluster(&mut f.stack).unwrap();
        let inputs = TaskInputs {
            asset: &f.asset,
            database_secret: f.db.secret().unwrap(),
            storage: &f.store,
            identity: Some(&f.identity),
        };
        let task = config(&Input::default(), &cluster, inputs, &mut f.stack).unwrap();
        let def = &f.stack.resource(&task.task_definition).unwrap().properties;
        assert_eq!(def["Cpu"], "512");
        assert_eq!(def["Memory"], "2048");
        assert_eq!(def["RequiresCompatibilities"], json!(["FARGATE"]));

        let c = container(&f.stack, &task);
        assert_eq!(c["PortMappings"][0]["ContainerPort"], 1337);
        assert_eq!(c["Image"], f.asset.image_uri());
        let secret_names: Vec<&str> = c["Secrets"].as_array().unwrap().iter().map(|s| s["Name"].as_str().unwrap()).collect();
        assert_eq!(secret_names, vec!["DATABASE_HOST", "DATABASE_NAME", "DATABASE_PASSWORD", "DATABASE_PORT", "DATABASE_USERNAME"]);
        let name = c["Secrets"].as_array().unwrap().iter().find(|s| s["Name"] == "DATABASE_NAME").unwrap();
        assert_eq!(name["ValueFrom"]["Fn::Join"][1][1], ":dbname::");

        let env = c["Environment"].as_array().unwrap();
        let find = |k: &str| env.iter().find(|e| e["Name"] == k).map(|e| e["Value"].clone());
        assert_eq!(find("AWS_BUCKET_NAME"), Some(get_ref("MediaBucket")));
        assert_eq!(find("AWS_REGION"), Some(get_ref("AWS::Region")));
        assert_eq!(find("AWS_ACCESS_KEY_ID"), Some(get_ref("MediaUserAccessKey")));
        assert_eq!(find("AWS_SECRET_KEY"), Some(get_att("MediaUserAccessKey", "SecretAccessKey")));
        assert_eq!(find("NODE_ENV"), Some(json!("development")));
        // secrets never show up as plain values
        assert!(find("DATABASE_PASSWORD").is_none());

        let exec = &f.stack.resource(&task.execution_role).unwrap().properties;
        assert_eq!(exec["Policies"][0]["PolicyDocument"]["Statement"][0]["Resource"], get_ref("DatabaseSecretAttachment"));
        assert!(f.stack.plan().is_ok());
    }

    #[test]
    fn task_role_credentials_inject_no_keys() {
        let mut f = fixture();
        let inputs = TaskInputs {
            asset: &f.asset,
            database_secret: f.db.secret().unwrap(),
            storage: &f.store,
            identity: None,
        };
        let task = config(&Input::default(), "Cluster", inputs, &mut f.stack).unwrap();
        assert!(!task.environment_keys.contains(&"AWS_ACCESS_KEY_ID".to_string()));
        assert!(task.environment_keys.contains(&"AWS_BUCKET_NAME".to_string()));
    }

    #[test]
    fn unknown_secret_field_adds_nothing() {
        let mut f = fixture();
        let before = f.stack.resources().len();
        let mut input = Input::default();
        input.secrets.insert("DATABASE_SCHEMA".into(), "schema".into());
        let inputs = TaskInputs {
            asset: &f.asset,
            database_secret: f.db.secret().unwrap(),
            storage: &f.store,
            identity: None,
        };
        let err = config(&input, "Cluster", inputs, &mut f.stack).unwrap_err();
        assert_eq!(
            err.to_string(),
            "configuration key DATABASE_SCHEMA references field 'schema' which does not exist in secret DatabaseSecret"
        );
        assert_eq!(f.stack.resources().len(), before);
    }

    #[test]
    fn reserved_and_conflicting_variables_are_rejected() {
        let mut input = Input::default();
        input.environment.insert("AWS_REGION".into(), "eu-west-1".into());
        assert!(input.validate().is_err());
        let mut input = Input::default();
        input.environment.insert("DATABASE_HOST".into(), "localhost".into());
        assert!(input.validate().is_err());
        let mut input = Input::default();
        input.environment.insert("1BAD".into(), "x".into());
        assert!(input.validate().is_err());
    }
}
