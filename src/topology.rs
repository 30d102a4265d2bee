//! Wires every layer into one stack. The order of the calls below is the order
//! in which handles become available; the provisioning order itself is derived
//! from the references afterwards by `Stack::plan`.

use crate::asset::ImageAsset;
use crate::config::TopologyConfig;
use crate::context::SynthContext;
use crate::error::{Result, SynthError};
use crate::resources::{acm_cert, ecs, iam, load_balancer, rds, route53, s3_bucket, security, vpc};
use crate::stack::Stack;

pub fn synthesize(config: &TopologyConfig, context: SynthContext, asset: &ImageAsset) -> Result<Stack> {
    config.validate()?;
    let mut stack = Stack::new(&config.stack_name, context)?;
    tracing::info!(stack = %stack.name(), region = %stack.region(), "synthesizing");

    let network = vpc::config(&config.network, &mut stack)?;

    let identity = match config.storage.credentials {
        iam::StorageCredentials::AccessKey => Some(iam::storage_identity(&mut stack)?),
        iam::StorageCredentials::TaskRole => None,
    };
    let storage = s3_bucket::config(&config.storage, &mut stack)?;

    let database = rds::config(&config.database, &network, &mut stack)?;
    // nothing that consumes the credentials may be declared without them
    let Some(database_secret) = database.secret() else {
        return Err(SynthError::MissingDatabaseSecret);
    };

    let zone = route53::lookup(&config.dns, &stack)?;
    let certificate = acm_cert::config(&config.dns.domain_name, &zone, &mut stack)?;

    let cluster = ecs::cluster(&mut stack)?;
    let task = ecs::config(
        &config.service,
        &cluster,
        ecs::TaskInputs {
            asset,
            database_secret,
            storage: &storage,
            identity: identity.as_ref(),
        },
        &mut stack,
    )?;

    let edge = load_balancer::config(
        &config.edge,
        load_balancer::EdgeInputs {
            network: &network,
            task: &task,
            certificate: &certificate,
            zone: &zone,
        },
        &mut stack,
    )?;

    security::allow_from(
        &mut stack,
        "DatabaseFromService",
        &database.security_group,
        &edge.service_security_group,
        security::Port::tcp(database.port),
        &[database.logical_id.as_str(), edge.service.as_str()],
    )?;
    stack.add_output("DatabaseEndpoint", "Address of the database instance", database.endpoint_address())?;
    stack.add_output("MediaBucketName", "Name of the media bucket", storage.bucket_name())?;

    let plan = stack.plan()?;
    tracing::info!(resources = stack.resources().len(), waves = plan.waves().len(), "topology synthesized");
    Ok(stack)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack::{get_att, get_ref};
    use serde_json::{json, Value};
    use std::path::PathBuf;

    fn asset() -> ImageAsset {
        ImageAsset {
            directory: PathBuf::from("app"),
            dockerfile: "Dockerfile".into(),
            repository: "fargate-rds-app".into(),
            tag: "0badcafe".into(),
        }
    }

    fn synth(config: &TopologyConfig) -> Result<Stack> {
        synthesize(config, SynthContext::for_tests(), &asset())
    }

    fn default_stack() -> Stack {
        synth(&TopologyConfig::default()).unwrap()
    }

    fn ingress_rules(stack: &Stack) -> Vec<&Value> {
        stack.resources_of_type("AWS::EC2::SecurityGroupIngress").map(|r| &r.properties).collect()
    }

    #[test]
    fn two_azs_yield_four_subnets_with_isolated_pair_unrouted() {
        let stack = default_stack();
        let subnets: Vec<_> = stack.resources_of_type("AWS::EC2::Subnet").collect();
        assert_eq!(subnets.len(), 4);
        let cidrs: Vec<&str> = subnets.iter().map(|s| s.properties["CidrBlock"].as_str().unwrap()).collect();
        assert_eq!(cidrs, vec!["10.0.0.0/24", "10.0.1.0/24", "10.0.2.0/28", "10.0.2.16/28"]);

        let routes: Vec<_> = stack.resources_of_type("AWS::EC2::Route").collect();
        assert_eq!(routes.len(), 2);
        for route in routes {
            let table = route.properties["RouteTableId"]["Ref"].as_str().unwrap();
            assert!(table.starts_with("VpcPublicSubnet"), "{table}");
        }
    }

    #[test]
    fn database_is_private_and_isolated() {
        let stack = default_stack();
        let db = stack.resource("Database").unwrap();
        assert_eq!(db.properties["PubliclyAccessible"], false);
        let group = stack.resource("DatabaseSubnetGroup").unwrap();
        assert_eq!(group.properties["SubnetIds"], json!([get_ref("VpcIsolatedSubnet1"), get_ref("VpcIsolatedSubnet2")]));
        assert_eq!(db.properties["MaxAllocatedStorage"], 105);
        assert_eq!(db.properties["AllocatedStorage"], "100");
    }

    #[test]
    fn missing_secret_aborts_before_dependents() {
        let mut config = TopologyConfig::default();
        config.database.generate_secret = false;
        let err = synth(&config).unwrap_err();
        assert_eq!(err.to_string(), "No Secret on RDS database");
        assert!(matches!(err, SynthError::MissingDatabaseSecret));
    }

    #[test]
    fn missing_secret_leaves_no_task_or_policy() {
        // replay the layers up to the guard to look at the partial stack
        let config = TopologyConfig { database: rds::Input { generate_secret: false, ..Default::default() }, ..Default::default() };
        let mut stack = Stack::new(&config.stack_name, SynthContext::for_tests()).unwrap();
        let network = vpc::config(&config.network, &mut stack).unwrap();
        let database = rds::config(&config.database, &network, &mut stack).unwrap();
        assert!(database.secret().is_none());
        assert_eq!(stack.resources_of_type("AWS::ECS::TaskDefinition").count(), 0);
        assert_eq!(stack.resources_of_type("AWS::EC2::SecurityGroupIngress").count(), 0);
    }

    #[test]
    fn bucket_policy_matches_public_read() {
        let stack = default_stack();
        let policy = &stack.resource("MediaBucketPolicy").unwrap().properties["PolicyDocument"]["Statement"];
        let anonymous_read = policy.as_array().unwrap().iter().any(|s| {
            s["Effect"] == "Allow" && s["Principal"] == json!({ "AWS": "*" }) && s["Action"] == json!(["s3:GetObject", "s3:ListBucket"])
        });
        assert!(anonymous_read);

        let mut config = TopologyConfig::default();
        config.storage.public_read = false;
        let stack = synth(&config).unwrap();
        let policy = &stack.resource("MediaBucketPolicy").unwrap().properties["PolicyDocument"]["Statement"];
        assert!(policy.as_array().unwrap().iter().all(|s| s["Effect"] == "Deny"));
    }

    #[test]
    fn network_policy_has_one_source_and_one_port() {
        let stack = default_stack();
        let rule = stack.resource("DatabaseFromService").unwrap();
        assert_eq!(rule.properties["GroupId"], get_att("DatabaseSecurityGroup", "GroupId"));
        assert_eq!(rule.properties["SourceSecurityGroupId"], get_att("ServiceSecurityGroup", "GroupId"));
        assert_eq!(rule.properties["FromPort"], 5432);
        assert_eq!(rule.properties["ToPort"], 5432);
        assert!(rule.properties.get("CidrIp").is_none());
        assert_eq!(rule.depends_on, vec!["Database".to_string(), "Service".to_string()]);

        let into_db: Vec<_> = ingress_rules(&stack)
            .into_iter()
            .filter(|r| r["GroupId"] == get_att("DatabaseSecurityGroup", "GroupId"))
            .collect();
        assert_eq!(into_db.len(), 1);
        assert!(stack.resource("DatabaseSecurityGroup").unwrap().properties.get("SecurityGroupIngress").is_none());
    }

    #[test]
    fn edge_redirects_and_forwards_to_1337() {
        let stack = default_stack();
        let http = stack.resource("HttpRedirectListener").unwrap();
        assert_eq!(http.properties["DefaultActions"][0]["RedirectConfig"]["Port"], "443");
        let https = stack.resource("HttpsListener").unwrap();
        let tg_ref = &https.properties["DefaultActions"][0]["TargetGroupArn"];
        let service = stack.resource("Service").unwrap();
        assert_eq!(&service.properties["LoadBalancers"][0]["TargetGroupArn"], tg_ref);
        assert_eq!(service.properties["LoadBalancers"][0]["ContainerPort"], 1337);
    }

    #[test]
    fn task_role_credentials_drop_the_iam_user() {
        let mut config = TopologyConfig::default();
        config.storage.credentials = iam::StorageCredentials::TaskRole;
        let stack = synth(&config).unwrap();
        assert_eq!(stack.resources_of_type("AWS::IAM::User").count(), 0);
        assert_eq!(stack.resources_of_type("AWS::IAM::AccessKey").count(), 0);
        assert!(stack.warnings().is_empty());

        let default = default_stack();
        assert_eq!(default.resources_of_type("AWS::IAM::AccessKey").count(), 1);
        assert_eq!(default.warnings().len(), 1);
    }

    #[test]
    fn plan_orders_network_before_database_before_policy() {
        let stack = default_stack();
        let plan = stack.plan().unwrap();
        let wave = |id: &str| plan.wave_of(id).unwrap();
        assert_eq!(wave("Vpc"), 0);
        assert!(wave("Vpc") < wave("DatabaseSubnetGroup"));
        assert!(wave("DatabaseSubnetGroup") < wave("Database"));
        assert!(wave("Database") < wave("DatabaseSecretAttachment"));
        assert!(wave("DatabaseSecretAttachment") < wave("TaskDefinition"));
        assert!(wave("SiteCertificate") < wave("HttpsListener"));
        assert!(wave("HttpsListener") < wave("Service"));
        assert!(wave("Service") < wave("DatabaseFromService"));
        assert_eq!(plan.order().count(), stack.resources().len());
    }

    #[test]
    fn unknown_zone_needs_a_lookup() {
        let mut config = TopologyConfig::default();
        config.dns = route53::Input { zone_name: "other.org".into(), domain_name: "app.other.org".into() };
        assert!(matches!(synth(&config), Err(SynthError::MissingContext(_))));
    }

    #[test]
    fn template_is_valid_json_with_outputs() {
        let stack = default_stack();
        let json: Value = serde_json::from_str(&stack.to_json_pretty().unwrap()).unwrap();
        assert_eq!(json["AWSTemplateFormatVersion"], "2010-09-09");
        for key in ["LoadBalancerDNS", "ServiceURL", "DatabaseEndpoint", "MediaBucketName"] {
            assert!(json["Outputs"].get(key).is_some(), "{key}");
        }
        assert_eq!(json["Resources"]["MediaBucket"]["DeletionPolicy"], "Delete");
    }
}
