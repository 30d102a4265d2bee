use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::security;
use super::vpc::{NetworkFabric, SubnetKind};
use crate::error::{Result, SynthError};
use crate::stack::{get_att, get_ref, join, RemovalPolicy, Resource, Stack};

/// fields of the generated secret once the instance has been attached to it.
pub const SECRET_FIELDS: &[&str] = &["dbname", "engine", "host", "password", "port", "username"];

const EXCLUDED_PASSWORD_CHARACTERS: &str = " %+~`#$&*()|[]{}:;<>?!'/@\"\\";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Input {
    /// postgres major (or major.minor) version
    pub engine_version: String,
    /// instance class without the `db.` prefix, eg: t3.micro
    pub instance_type: String,
    /// GiB
    pub allocated_storage: u32,
    /// upper bound for storage autoscaling, GiB
    pub max_allocated_storage: u32,
    pub multi_az: bool,
    pub publicly_accessible: bool,
    pub subnet_tier: SubnetKind,
    pub backup_retention_days: u32,
    pub delete_automated_backups: bool,
    pub deletion_protection: bool,
    pub allow_major_version_upgrade: bool,
    pub auto_minor_version_upgrade: bool,
    pub removal_policy: RemovalPolicy,
    pub database_name: String,
    pub username: String,
    /// generate the master password into a Secrets Manager secret. when false, RDS
    /// manages the password itself and nothing in the stack can reference it.
    pub generate_secret: bool,
    pub port: u16,
}

impl Default for Input {
    fn default() -> Self {
        Self {
            engine_version: "14".to_string(),
            instance_type: "t3.micro".to_string(),
            allocated_storage: 100,
            max_allocated_storage: 105,
            multi_az: false,
            publicly_accessible: false,
            subnet_tier: SubnetKind::Isolated,
            backup_retention_days: 0,
            delete_automated_backups: true,
            deletion_protection: false,
            allow_major_version_upgrade: false,
            auto_minor_version_upgrade: true,
            removal_policy: RemovalPolicy::Destroy,
            database_name: "dbName".to_string(),
            username: "dbUser".to_string(),
            generate_secret: true,
            port: 5432,
        }
    }
}

impl Input {
    pub fn validate(&self) -> Result<()> {
        if self.max_allocated_storage < self.allocated_storage {
            return Err(SynthError::config(format!(
                "database.max_allocated_storage ({}) must be at least database.allocated_storage ({})",
                self.max_allocated_storage, self.allocated_storage
            )));
        }
        if !(20..=65536).contains(&self.allocated_storage) {
            return Err(SynthError::config("database.allocated_storage must be between 20 and 65536 GiB"));
        }
        if self.publicly_accessible && self.subnet_tier == SubnetKind::Isolated {
            return Err(SynthError::config(
                "database.publicly_accessible cannot be true for an instance in an isolated subnet tier",
            ));
        }
        validate_identifier("database.username", &self.username, 16)?;
        validate_identifier("database.database_name", &self.database_name, 63)?;
        if self.engine_version.is_empty() {
            return Err(SynthError::config("database.engine_version must not be empty"));
        }
        if self.instance_type.split('.').count() != 2 {
            return Err(SynthError::config(format!(
                "database.instance_type {:?} must look like t3.micro",
                self.instance_type
            )));
        }
        if self.port == 0 {
            return Err(SynthError::config("database.port must not be 0"));
        }
        Ok(())
    }
}

fn validate_identifier(key: &str, value: &str, max: usize) -> Result<()> {
    let starts_alpha = value.chars().next().map(|c| c.is_ascii_alphabetic()).unwrap_or(false);
    if !starts_alpha || value.len() > max || !value.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(SynthError::config(format!(
            "{key} {value:?} must start with a letter, contain only letters, digits and underscores and be at most {max} characters"
        )));
    }
    Ok(())
}

/// the secrets manager entry holding the generated credentials.
#[derive(Debug, Clone)]
pub struct DatabaseSecret {
    pub secret: String,
    /// referencing the attachment instead of the secret itself guarantees that
    /// host and port are already written into the secret.
    pub attachment: String,
    pub fields: BTreeSet<&'static str>,
}

impl DatabaseSecret {
    pub fn arn(&self) -> Value {
        get_ref(&self.attachment)
    }

    pub fn has_field(&self, field: &str) -> bool {
        self.fields.contains(field)
    }

    /// `valueFrom` of an ecs container secret for one json key of this secret.
    pub fn value_from(&self, key: &str, field: &str) -> Result<Value> {
        if !self.has_field(field) {
            return Err(SynthError::UnknownSecretField {
                key: key.to_string(),
                field: field.to_string(),
                secret: self.secret.clone(),
            });
        }
        Ok(join("", vec![self.arn(), json!(format!(":{field}::"))]))
    }
}

#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    /// None when the password is not generated into a secret this stack can reference.
    pub secret: Option<DatabaseSecret>,
}

#[derive(Debug, Clone)]
pub struct DatabaseInstance {
    pub logical_id: String,
    pub security_group: String,
    pub subnet_group: String,
    pub port: u16,
    pub publicly_accessible: bool,
    pub subnet_tier: SubnetKind,
    pub allocated_storage: u32,
    pub max_allocated_storage: u32,
    pub credentials: Credentials,
}

impl DatabaseInstance {
    pub fn endpoint_address(&self) -> Value {
        get_att(&self.logical_id, "Endpoint.Address")
    }

    pub fn secret(&self) -> Option<&DatabaseSecret> {
        self.credentials.secret.as_ref()
    }
}

fn resolve_secret_field(secret: &str, field: &str) -> Value {
    join("", vec![
        json!("{{resolve:secretsmanager:"),
        get_ref(secret),
        json!(format!(":SecretString:{field}::}}}}")),
    ])
}

pub fn config(input: &Input, network: &NetworkFabric, stack: &mut Stack) -> Result<DatabaseInstance> {
    input.validate()?;
    let subnets = network.subnet_refs(input.subnet_tier);
    let zones: BTreeSet<&str> = network
        .subnets_of(input.subnet_tier)
        .map(|s| s.availability_zone.as_str())
        .collect();
    if zones.len() < 2 {
        return Err(SynthError::config(format!(
            "a database subnet group needs subnets in at least 2 availability zones, the {:?} tier has {}",
            input.subnet_tier,
            zones.len()
        )));
    }

    let subnet_group = stack.add(Resource::new("DatabaseSubnetGroup", "AWS::RDS::DBSubnetGroup", json!({
        "DBSubnetGroupDescription": format!("Subnet group for {} database", stack.name()),
        "SubnetIds": subnets,
    })).removal_policy(input.removal_policy_for_dependents()))?;
    let security_group = security::security_group(stack, "DatabaseSecurityGroup", "Database", network.vpc_ref())?;

    let secret = if input.generate_secret {
        let template = json!({ "username": input.username, "dbname": input.database_name }).to_string();
        Some(stack.add(Resource::new("DatabaseSecret", "AWS::SecretsManager::Secret", json!({
            "Description": format!("Generated credentials for the {} database", stack.name()),
            "GenerateSecretString": {
                "SecretStringTemplate": template,
                "GenerateStringKey": "password",
                "PasswordLength": 30,
                "ExcludeCharacters": EXCLUDED_PASSWORD_CHARACTERS,
            },
        })).removal_policy(RemovalPolicy::Destroy))?)
    } else {
        stack.warn("database.generate_secret is false: the master password is managed by RDS and cannot be injected into the task");
        None
    };

    let mut properties = json!({
        "Engine": "postgres",
        "EngineVersion": input.engine_version,
        "DBInstanceClass": format!("db.{}", input.instance_type),
        "AllocatedStorage": input.allocated_storage.to_string(),
        "MaxAllocatedStorage": input.max_allocated_storage,
        "StorageType": "gp2",
        "MultiAZ": input.multi_az,
        "PubliclyAccessible": input.publicly_accessible,
        "DBSubnetGroupName": get_ref(&subnet_group),
        "VPCSecurityGroups": [get_att(&security_group, "GroupId")],
        "Port": input.port.to_string(),
        "DBName": input.database_name,
        "BackupRetentionPeriod": input.backup_retention_days,
        "DeleteAutomatedBackups": input.delete_automated_backups,
        "DeletionProtection": input.deletion_protection,
        "AllowMajorVersionUpgrade": input.allow_major_version_upgrade,
        "AutoMinorVersionUpgrade": input.auto_minor_version_upgrade,
        "CopyTagsToSnapshot": true,
    });
    match &secret {
        Some(secret) => {
            properties["MasterUsername"] = resolve_secret_field(secret, "username");
            properties["MasterUserPassword"] = resolve_secret_field(secret, "password");
        }
        None => {
            properties["MasterUsername"] = json!(input.username);
            properties["ManageMasterUserPassword"] = json!(true);
        }
    }
    let logical_id = stack.add(
        Resource::new("Database", "AWS::RDS::DBInstance", properties).removal_policy(input.removal_policy),
    )?;

    let secret = match secret {
        Some(secret) => {
            let attachment = stack.add(Resource::new("DatabaseSecretAttachment", "AWS::SecretsManager::SecretTargetAttachment", json!({
                "SecretId": get_ref(&secret),
                "TargetId": get_ref(&logical_id),
                "TargetType": "AWS::RDS::DBInstance",
            })))?;
            Some(DatabaseSecret {
                secret,
                attachment,
                fields: SECRET_FIELDS.iter().copied().collect(),
            })
        }
        None => None,
    };
    tracing::info!(
        instance = %format!("db.{}", input.instance_type),
        storage = %format!("{}..{}GiB", input.allocated_storage, input.max_allocated_storage),
        "database declared"
    );

    Ok(DatabaseInstance {
        logical_id,
        security_group,
        subnet_group,
        port: input.port,
        publicly_accessible: input.publicly_accessible,
        subnet_tier: input.subnet_tier,
        allocated_storage: input.allocated_storage,
        max_allocated_storage: input.max_allocated_storage,
        credentials: Credentials {
            username: input.username.clone(),
            secret,
        },
    })
}

impl Input {
    /// a subnet group cannot be snapshotted; it follows the instance otherwise.
    fn removal_policy_for_dependents(&self) -> RemovalPolicy {
        match self.removal_policy {
            RemovalPolicy::Snapshot => RemovalPolicy::Retain,
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::SynthContext;
    use crate::resources::vpc;

    fn network_stack() -> (Stack, NetworkFabric) {
        let mut stack = Stack::new("FargateRdsStack", SynthContext::for_tests()).unwrap();
        let network = vpc::config(&vpc::Input::default(), &mut stack).unwrap();
        (stack, network)
    }

    #[test]
    fn defaults_match_the_development_profile() {
        let (mut stack, network) = network_stack();
        let db = config(&Input::default(), &network, &mut stack).unwrap();
        let props = &stack.resource(&db.logical_id).unwrap().properties;
        assert_eq!(props["Engine"], "postgres");
        assert_eq!(props["EngineVersion"], "14");
        assert_eq!(props["DBInstanceClass"], "db.t3.micro");
        assert_eq!(props["AllocatedStorage"], "100");
        assert_eq!(props["MaxAllocatedStorage"], 105);
        assert_eq!(props["MultiAZ"], false);
        assert_eq!(props["PubliclyAccessible"], false);
        assert_eq!(props["BackupRetentionPeriod"], 0);
        assert_eq!(props["DBName"], "dbName");
        assert_eq!(stack.resource(&db.logical_id).unwrap().removal_policy, Some(RemovalPolicy::Destroy));

        let group = &stack.resource(&db.subnet_group).unwrap().properties;
        assert_eq!(group["SubnetIds"], json!([get_ref("VpcIsolatedSubnet1"), get_ref("VpcIsolatedSubnet2")]));
    }

    #[test]
    fn isolated_databases_are_never_public() {
        let input = Input { publicly_accessible: true, ..Default::default() };
        let err = input.validate().unwrap_err();
        assert!(err.to_string().contains("cannot be true for an instance in an isolated subnet tier"));

        let (mut stack, network) = network_stack();
        let db = config(&Input::default(), &network, &mut stack).unwrap();
        assert_eq!(db.subnet_tier, SubnetKind::Isolated);
        assert!(!db.publicly_accessible);
    }

    #[test]
    fn storage_band_must_not_shrink() {
        for (allocated, max, ok) in [(100, 105, true), (100, 100, true), (100, 99, false), (20, 65536, true), (10, 100, false)] {
            let input = Input { allocated_storage: allocated, max_allocated_storage: max, ..Default::default() };
            assert_eq!(input.validate().is_ok(), ok, "{allocated}..{max}");
        }
    }

    #[test]
    fn generated_secret_exposes_connection_fields() {
        let (mut stack, network) = network_stack();
        let db = config(&Input::default(), &network, &mut stack).unwrap();
        let secret = db.secret().unwrap();
        for field in ["host", "username", "password", "dbname", "port"] {
            assert!(secret.has_field(field), "{field}");
        }
        let generated = &stack.resource(&secret.secret).unwrap().properties["GenerateSecretString"];
        let template: Value = serde_json::from_str(generated["SecretStringTemplate"].as_str().unwrap()).unwrap();
        assert_eq!(template, json!({ "username": "dbUser", "dbname": "dbName" }));

        let props = &stack.resource(&db.logical_id).unwrap().properties;
        assert_eq!(props["MasterUserPassword"]["Fn::Join"][1][0], "{{resolve:secretsmanager:");
        assert_eq!(props["MasterUserPassword"]["Fn::Join"][1][2], ":SecretString:password::}}");

        let attachment = &stack.resource(&secret.attachment).unwrap().properties;
        assert_eq!(attachment["TargetId"], get_ref("Database"));
        assert_eq!(stack.resources_of_type("AWS::SecretsManager::Secret").count(), 1);
    }

    #[test]
    fn unknown_secret_fields_are_rejected() {
        let (mut stack, network) = network_stack();
        let db = config(&Input::default(), &network, &mut stack).unwrap();
        let secret = db.secret().unwrap();
        let ok = secret.value_from("DATABASE_HOST", "host").unwrap();
        assert_eq!(ok, json!({ "Fn::Join": ["", [get_ref("DatabaseSecretAttachment"), ":host::"]] }));
        let err = secret.value_from("DATABASE_SCHEMA", "schema").unwrap_err();
        assert!(matches!(err, SynthError::UnknownSecretField { .. }));
    }

    #[test]
    fn rds_managed_password_leaves_no_secret_reference() {
        let (mut stack, network) = network_stack();
        let input = Input { generate_secret: false, ..Default::default() };
        let db = config(&input, &network, &mut stack).unwrap();
        assert!(db.secret().is_none());
        assert_eq!(stack.resources_of_type("AWS::SecretsManager::Secret").count(), 0);
        let props = &stack.resource(&db.logical_id).unwrap().properties;
        assert_eq!(props["ManageMasterUserPassword"], true);
        assert_eq!(props["MasterUsername"], "dbUser");
    }

    #[test]
    fn identifiers_are_checked() {
        assert!(Input { username: "1user".into(), ..Default::default() }.validate().is_err());
        assert!(Input { database_name: "my-db".into(), ..Default::default() }.validate().is_err());
        assert!(Input { instance_type: "micro".into(), ..Default::default() }.validate().is_err());
    }
}
