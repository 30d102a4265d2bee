use serde_json::{json, Value};

use crate::error::Result;
use crate::stack::{get_att, Resource, Stack};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Port {
    pub protocol: &'static str,
    pub from: u16,
    pub to: u16,
}

impl Port {
    pub fn tcp(port: u16) -> Self {
        Self { protocol: "tcp", from: port, to: port }
    }
}

/// a security group that allows all outbound traffic and nothing inbound.
pub fn security_group(stack: &mut Stack, logical_id: &str, description: &str, vpc: Value) -> Result<String> {
    security_group_with_ingress(stack, logical_id, description, vpc, vec![])
}

pub fn security_group_with_ingress(
    stack: &mut Stack,
    logical_id: &str,
    description: &str,
    vpc: Value,
    ingress: Vec<Value>,
) -> Result<String> {
    let mut properties = json!({
        "GroupDescription": format!("{}/{}", stack.name(), description),
        "VpcId": vpc,
        "SecurityGroupEgress": [{
            "CidrIp": "0.0.0.0/0",
            "Description": "Allow all outbound traffic by default",
            "IpProtocol": "-1",
        }],
    });
    if !ingress.is_empty() {
        properties["SecurityGroupIngress"] = Value::Array(ingress);
    }
    stack.add(Resource::new(logical_id, "AWS::EC2::SecurityGroup", properties))
}

pub fn ingress_from_anywhere(port: Port, description: &str) -> Value {
    json!({
        "CidrIp": "0.0.0.0/0",
        "Description": description,
        "FromPort": port.from,
        "ToPort": port.to,
        "IpProtocol": port.protocol,
    })
}

/// a standalone ingress rule on `target` allowing `source`. standalone rules avoid
/// reference cycles between groups and let the rule carry its own dependencies.
pub fn allow_from(
    stack: &mut Stack,
    logical_id: &str,
    target_group: &str,
    source_group: &str,
    port: Port,
    depends_on: &[&str],
) -> Result<String> {
    let mut resource = Resource::new(logical_id, "AWS::EC2::SecurityGroupIngress", json!({
        "IpProtocol": port.protocol,
        "Description": format!("from {source_group}:{}", port.from),
        "FromPort": port.from,
        "ToPort": port.to,
        "GroupId": get_att(target_group, "GroupId"),
        "SourceSecurityGroupId": get_att(source_group, "GroupId"),
    }));
    for dep in depends_on {
        resource = resource.depends_on(*dep);
    }
    stack.add(resource)
}
