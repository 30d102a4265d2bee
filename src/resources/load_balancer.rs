//! The public edge: an internet facing application load balancer terminating TLS,
//! the Fargate service registered behind it and the alias record for the domain.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::acm_cert::Certificate;
use super::ecs::ComputeTask;
use super::route53::{self, HostedZone};
use super::security::{self, Port};
use super::vpc::{NetworkFabric, SubnetKind};
use crate::error::{Result, SynthError};
use crate::stack::{get_att, get_ref, Resource, Stack};

pub const HTTPS_PORT: u16 = 443;
pub const HTTP_PORT: u16 = 80;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Input {
    /// listen on port 80 and answer with a permanent redirect to https
    pub redirect_http: bool,
    /// tasks run in public subnets and pull their image through the internet
    /// gateway, so they need a public address.
    pub assign_public_ip: bool,
    pub desired_count: u32,
    pub health_check_path: String,
    pub health_check_grace_period_seconds: u32,
}

impl Default for Input {
    fn default() -> Self {
        Self {
            redirect_http: true,
            assign_public_ip: true,
            desired_count: 1,
            health_check_path: "/".to_string(),
            health_check_grace_period_seconds: 60,
        }
    }
}

impl Input {
    pub fn validate(&self) -> Result<()> {
        if !self.assign_public_ip {
            return Err(SynthError::config(
                "edge.assign_public_ip must be true: tasks run in public subnets without a NAT gateway",
            ));
        }
        if !self.health_check_path.starts_with('/') {
            return Err(SynthError::config("edge.health_check_path must start with /"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct Edge {
    pub load_balancer: String,
    pub security_group: String,
    pub target_group: String,
    pub https_listener: String,
    pub http_listener: Option<String>,
    pub service: String,
    pub service_security_group: String,
    pub record: String,
    pub url: String,
}

impl Edge {
    pub fn dns_name(&self) -> Value {
        get_att(&self.load_balancer, "DNSName")
    }
}

pub struct EdgeInputs<'a> {
    pub network: &'a NetworkFabric,
    pub task: &'a ComputeTask,
    pub certificate: &'a Certificate,
    pub zone: &'a HostedZone,
}

pub fn config(input: &Input, inputs: EdgeInputs<'_>, stack: &mut Stack) -> Result<Edge> {
    input.validate()?;
    let EdgeInputs { network, task, certificate, zone } = inputs;
    let public: Vec<_> = network.subnets_of(SubnetKind::Public).collect();
    let zones: BTreeSet<&str> = public.iter().map(|s| s.availability_zone.as_str()).collect();
    if zones.len() < 2 {
        return Err(SynthError::config(
            "an application load balancer needs public subnets in at least 2 availability zones",
        ));
    }

    let mut ingress = vec![security::ingress_from_anywhere(Port::tcp(HTTPS_PORT), "Allow from anyone on port 443")];
    if input.redirect_http {
        ingress.push(security::ingress_from_anywhere(Port::tcp(HTTP_PORT), "Allow from anyone on port 80"));
    }
    let security_group = security::security_group_with_ingress(
        stack,
        "LoadBalancerSecurityGroup",
        "LoadBalancer",
        network.vpc_ref(),
        ingress,
    )?;

    // the load balancer is only usable once the public subnets route to the internet
    let mut lb = Resource::new("LoadBalancer", "AWS::ElasticLoadBalancingV2::LoadBalancer", json!({
        "Type": "application",
        "Scheme": "internet-facing",
        "Subnets": network.subnet_refs(SubnetKind::Public),
        "SecurityGroups": [get_att(&security_group, "GroupId")],
        "LoadBalancerAttributes": [{ "Key": "deletion_protection.enabled", "Value": "false" }],
    }));
    for subnet in public.iter().filter(|s| s.has_public_route) {
        lb = lb.depends_on(format!("{}DefaultRoute", subnet.logical_id));
    }
    let load_balancer = stack.add(lb)?;

    let target_group = stack.add(Resource::new("TargetGroup", "AWS::ElasticLoadBalancingV2::TargetGroup", json!({
        "Port": task.container_port,
        "Protocol": "HTTP",
        "TargetType": "ip",
        "VpcId": network.vpc_ref(),
        "HealthCheckPath": input.health_check_path,
        "TargetGroupAttributes": [{ "Key": "stickiness.enabled", "Value": "false" }],
    })))?;

    let https_listener = stack.add(Resource::new("HttpsListener", "AWS::ElasticLoadBalancingV2::Listener", json!({
        "LoadBalancerArn": get_ref(&load_balancer),
        "Port": HTTPS_PORT,
        "Protocol": "HTTPS",
        "Certificates": [{ "CertificateArn": certificate.arn() }],
        "DefaultActions": [{ "Type": "forward", "TargetGroupArn": get_ref(&target_group) }],
    })))?;

    let http_listener = if input.redirect_http {
        Some(stack.add(Resource::new("HttpRedirectListener", "AWS::ElasticLoadBalancingV2::Listener", json!({
            "LoadBalancerArn": get_ref(&load_balancer),
            "Port": HTTP_PORT,
            "Protocol": "HTTP",
            "DefaultActions": [{
                "Type": "redirect",
                "RedirectConfig": {
                    "Protocol": "HTTPS",
                    "Port": HTTPS_PORT.to_string(),
                    "StatusCode": "HTTP_301",
                },
            }],
        })))?)
    } else {
        None
    };

    let service_security_group = security::security_group(stack, "ServiceSecurityGroup", "Service", network.vpc_ref())?;
    security::allow_from(
        stack,
        "ServiceFromLoadBalancer",
        &service_security_group,
        &security_group,
        Port::tcp(task.container_port),
        &[],
    )?;

    let assign_public_ip = if input.assign_public_ip { "ENABLED" } else { "DISABLED" };
    let mut service = Resource::new("Service", "AWS::ECS::Service", json!({
        "Cluster": get_ref(&task.cluster),
        "TaskDefinition": get_ref(&task.task_definition),
        "LaunchType": "FARGATE",
        "DesiredCount": input.desired_count,
        "HealthCheckGracePeriodSeconds": input.health_check_grace_period_seconds,
        "DeploymentConfiguration": { "MaximumPercent": 200, "MinimumHealthyPercent": 50 },
        "NetworkConfiguration": {
            "AwsvpcConfiguration": {
                "AssignPublicIp": assign_public_ip,
                "SecurityGroups": [get_att(&service_security_group, "GroupId")],
                "Subnets": network.subnet_refs(SubnetKind::Public),
            },
        },
        "LoadBalancers": [{
            "ContainerName": task.container_name,
            "ContainerPort": task.container_port,
            "TargetGroupArn": get_ref(&target_group),
        }],
    }))
    // a target group can only be used once it is attached to a listener
    .depends_on(&https_listener);
    if let Some(listener) = &http_listener {
        service = service.depends_on(listener);
    }
    let service = stack.add(service)?;

    let record = route53::alias_record(
        stack,
        "SiteAliasRecord",
        zone,
        &certificate.domain_name,
        get_att(&load_balancer, "DNSName"),
        get_att(&load_balancer, "CanonicalHostedZoneID"),
    )?;

    let url = format!("https://{}", certificate.domain_name);
    stack.add_output("LoadBalancerDNS", "DNS name of the load balancer", get_att(&load_balancer, "DNSName"))?;
    stack.add_output("ServiceURL", "Public url of the service", json!(url))?;
    tracing::info!(%url, redirect_http = input.redirect_http, "edge declared");

    Ok(Edge {
        load_balancer,
        security_group,
        target_group,
        https_listener,
        http_listener,
        service,
        service_security_group,
        record,
        url,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::SynthContext;
    use crate::resources::{acm_cert, vpc};
    use std::collections::BTreeMap;

    fn fixture() -> (Stack, NetworkFabric, ComputeTask, Certificate, HostedZone) {
        let mut stack = Stack::new("FargateRdsStack", SynthContext::for_tests()).unwrap();
        let network = vpc::config(&vpc::Input::default(), &mut stack).unwrap();
        let zone = HostedZone { name: "example.com".into(), id: "Z1".into() };
        let certificate = acm_cert::config("app.example.com", &zone, &mut stack).unwrap();
        stack.add(Resource::new("Cluster", "AWS::ECS::Cluster", json!({}))).unwrap();
        stack.add(Resource::new("TaskDefinition", "AWS::ECS::TaskDefinition", json!({}))).unwrap();
        let task = ComputeTask {
            cluster: "Cluster".into(),
            task_definition: "TaskDefinition".into(),
            execution_role: "TaskExecutionRole".into(),
            task_role: "TaskRole".into(),
            log_group: "TaskLogGroup".into(),
            container_name: "container".into(),
            container_port: 1337,
            secret_keys: BTreeMap::new(),
            environment_keys: vec![],
        };
        (stack, network, task, certificate, zone)
    }

    fn build(input: &Input) -> (Stack, Edge) {
        let (mut stack, network, task, certificate, zone) = fixture();
        let inputs = EdgeInputs { network: &network, task: &task, certificate: &certificate, zone: &zone };
        let edge = config(input, inputs, &mut stack).unwrap();
        (stack, edge)
    }

    #[test]
    fn https_forwards_to_the_container_port() {
        let (stack, edge) = build(&Input::default());
        let listener = &stack.resource(&edge.https_listener).unwrap().properties;
        assert_eq!(listener["Port"], 443);
        assert_eq!(listener["Certificates"][0]["CertificateArn"], get_ref("SiteCertificate"));
        assert_eq!(listener["DefaultActions"][0]["TargetGroupArn"], get_ref(&edge.target_group));
        let tg = &stack.resource(&edge.target_group).unwrap().properties;
        assert_eq!(tg["Port"], 1337);
        assert_eq!(tg["TargetType"], "ip");

        let service = stack.resource(&edge.service).unwrap();
        assert_eq!(service.properties["LoadBalancers"][0]["ContainerPort"], 1337);
        assert_eq!(service.properties["LoadBalancers"][0]["ContainerName"], "container");
        assert_eq!(service.properties["NetworkConfiguration"]["AwsvpcConfiguration"]["AssignPublicIp"], "ENABLED");
        assert_eq!(
            service.properties["NetworkConfiguration"]["AwsvpcConfiguration"]["Subnets"],
            json!([get_ref("VpcPublicSubnet1"), get_ref("VpcPublicSubnet2")])
        );
        assert!(service.depends_on.contains(&edge.https_listener));
    }

    #[test]
    fn http_redirects_permanently_to_https() {
        let (stack, edge) = build(&Input::default());
        let listener = &stack.resource(edge.http_listener.as_deref().unwrap()).unwrap().properties;
        assert_eq!(listener["Port"], 80);
        let redirect = &listener["DefaultActions"][0]["RedirectConfig"];
        assert_eq!(redirect["Protocol"], "HTTPS");
        assert_eq!(redirect["Port"], "443");
        assert_eq!(redirect["StatusCode"], "HTTP_301");
        let sg = &stack.resource(&edge.security_group).unwrap().properties;
        assert_eq!(sg["SecurityGroupIngress"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn no_redirect_listener_when_disabled() {
        let (stack, edge) = build(&Input { redirect_http: false, ..Default::default() });
        assert!(edge.http_listener.is_none());
        assert_eq!(stack.resources_of_type("AWS::ElasticLoadBalancingV2::Listener").count(), 1);
        let sg = &stack.resource(&edge.security_group).unwrap().properties;
        assert_eq!(sg["SecurityGroupIngress"][0]["FromPort"], 443);
    }

    #[test]
    fn service_only_accepts_the_load_balancer() {
        let (stack, edge) = build(&Input::default());
        let rule = &stack.resource("ServiceFromLoadBalancer").unwrap().properties;
        assert_eq!(rule["GroupId"], get_att(&edge.service_security_group, "GroupId"));
        assert_eq!(rule["SourceSecurityGroupId"], get_att(&edge.security_group, "GroupId"));
        assert_eq!(rule["FromPort"], 1337);
    }

    #[test]
    fn alias_record_and_outputs() {
        let (stack, edge) = build(&Input::default());
        let record = &stack.resource(&edge.record).unwrap().properties;
        assert_eq!(record["Name"], "app.example.com.");
        assert_eq!(record["AliasTarget"]["DNSName"], edge.dns_name());
        assert_eq!(stack.outputs()["ServiceURL"].value, json!("https://app.example.com"));
        assert!(stack.outputs().contains_key("LoadBalancerDNS"));
        let lb = stack.resource(&edge.load_balancer).unwrap();
        assert_eq!(lb.depends_on, vec!["VpcPublicSubnet1DefaultRoute".to_string(), "VpcPublicSubnet2DefaultRoute".to_string()]);
        assert!(stack.plan().is_ok());
    }

    #[test]
    fn private_tasks_are_rejected() {
        let input = Input { assign_public_ip: false, ..Default::default() };
        assert!(input.validate().is_err());
    }
}
