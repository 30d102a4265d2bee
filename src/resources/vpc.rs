use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::pascal_case;
use crate::error::{Result, SynthError};
use crate::stack::{get_ref, name_tag, Resource, Stack};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SubnetKind {
    /// routed to an internet gateway
    Public,
    /// no route out of the vpc at all
    Isolated,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SubnetTier {
    pub name: String,
    pub kind: SubnetKind,
    /// mask of every subnet of this tier, one per availability zone.
    pub cidr_mask: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Input {
    pub cidr: String,
    pub max_azs: usize,
    pub subnets: Vec<SubnetTier>,
}

impl Default for Input {
    fn default() -> Self {
        Self {
            cidr: "10.0.0.0/16".to_string(),
            max_azs: 2,
            subnets: vec![
                SubnetTier {
                    name: "public".to_string(),
                    kind: SubnetKind::Public,
                    cidr_mask: 24,
                },
                SubnetTier {
                    name: "isolated".to_string(),
                    kind: SubnetKind::Isolated,
                    cidr_mask: 28,
                },
            ],
        }
    }
}

impl Input {
    pub fn validate(&self) -> Result<CidrBlock> {
        let block: CidrBlock = self.cidr.parse()?;
        if !(16..=28).contains(&block.mask) {
            return Err(SynthError::InvalidCidr(format!(
                "{} (vpc block must be between /16 and /28)",
                self.cidr
            )));
        }
        if self.max_azs == 0 {
            return Err(SynthError::config("network.max_azs must be at least 1"));
        }
        if self.subnets.is_empty() {
            return Err(SynthError::config("network.subnets must contain at least one tier"));
        }
        let mut seen = vec![];
        for tier in self.subnets.iter() {
            let name = pascal_case(&tier.name);
            if name.is_empty() || seen.contains(&name) {
                return Err(SynthError::config(format!(
                    "subnet tier names must be unique and alphanumeric. '{}' is invalid",
                    tier.name
                )));
            }
            if tier.cidr_mask < block.mask || tier.cidr_mask > 28 {
                return Err(SynthError::InvalidCidr(format!(
                    "/{} for tier {} (must be between /{} and /28)",
                    tier.cidr_mask, tier.name, block.mask
                )));
            }
            seen.push(name);
        }
        Ok(block)
    }

    pub fn has_tier(&self, kind: SubnetKind) -> bool {
        self.subnets.iter().any(|t| t.kind == kind)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CidrBlock {
    network: u32,
    mask: u8,
}

impl CidrBlock {
    pub fn mask(&self) -> u8 {
        self.mask
    }

    pub fn size(&self) -> u64 {
        1u64 << (32 - self.mask as u32)
    }

    fn start(&self) -> u64 {
        self.network as u64
    }

    fn end(&self) -> u64 {
        self.start() + self.size()
    }

    pub fn contains(&self, other: &CidrBlock) -> bool {
        other.start() >= self.start() && other.end() <= self.end()
    }
}

impl FromStr for CidrBlock {
    type Err = SynthError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || SynthError::InvalidCidr(s.to_string());
        let (addr, mask) = s.split_once('/').ok_or_else(invalid)?;
        let addr: Ipv4Addr = addr.parse().map_err(|_| invalid())?;
        let mask: u8 = mask.parse().map_err(|_| invalid())?;
        if mask > 32 {
            return Err(invalid());
        }
        let network = u32::from(addr);
        let host_bits = if mask == 0 { u32::MAX } else { (1u32 << (32 - mask as u32)).wrapping_sub(1) };
        if network & host_bits != 0 {
            return Err(invalid());
        }
        Ok(Self { network, mask })
    }
}

impl fmt::Display for CidrBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", Ipv4Addr::from(self.network), self.mask)
    }
}

/// hands out aligned, non-overlapping subnets from a block in allocation order.
pub struct NetworkBuilder {
    block: CidrBlock,
    next: u64,
}

impl NetworkBuilder {
    pub fn new(block: CidrBlock) -> Self {
        Self { block, next: block.start() }
    }

    pub fn allocate(&mut self, mask: u8) -> Result<CidrBlock> {
        let exhausted = || SynthError::AddressSpaceExhausted {
            block: self.block.to_string(),
            mask,
        };
        if mask < self.block.mask || mask > 32 {
            return Err(exhausted());
        }
        let size = 1u64 << (32 - mask as u32);
        let start = (self.next + size - 1) / size * size;
        if start + size > self.block.end() {
            return Err(exhausted());
        }
        self.next = start + size;
        Ok(CidrBlock {
            network: start as u32,
            mask,
        })
    }
}

#[derive(Debug, Clone)]
pub struct Subnet {
    pub logical_id: String,
    pub tier: String,
    pub kind: SubnetKind,
    pub availability_zone: String,
    pub cidr: CidrBlock,
    pub route_table: String,
    pub has_public_route: bool,
}

#[derive(Debug, Clone)]
pub struct NetworkFabric {
    pub vpc: String,
    pub internet_gateway: Option<String>,
    pub subnets: Vec<Subnet>,
}

impl NetworkFabric {
    pub fn subnets_of(&self, kind: SubnetKind) -> impl Iterator<Item = &Subnet> {
        self.subnets.iter().filter(move |s| s.kind == kind)
    }

    pub fn subnet_refs(&self, kind: SubnetKind) -> Vec<Value> {
        self.subnets_of(kind).map(|s| get_ref(&s.logical_id)).collect()
    }

    pub fn vpc_ref(&self) -> Value {
        get_ref(&self.vpc)
    }
}

pub fn config(input: &Input, stack: &mut Stack) -> Result<NetworkFabric> {
    let block = input.validate()?;
    let available = stack.context().availability_zones.clone();
    if input.max_azs > available.len() {
        return Err(SynthError::NotEnoughAvailabilityZones {
            requested: input.max_azs,
            available: available.len(),
            region: stack.region().to_string(),
        });
    }
    let azs = &available[..input.max_azs];

    let vpc = stack.add(Resource::new("Vpc", "AWS::EC2::VPC", json!({
        "CidrBlock": block.to_string(),
        "EnableDnsHostnames": true,
        "EnableDnsSupport": true,
        "InstanceTenancy": "default",
        "Tags": name_tag(stack, "Vpc"),
    })))?;

    let mut internet_gateway = None;
    let mut attachment = None;
    if input.has_tier(SubnetKind::Public) {
        let igw = stack.add(Resource::new("VpcIgw", "AWS::EC2::InternetGateway", json!({
            "Tags": name_tag(stack, "Vpc"),
        })))?;
        attachment = Some(stack.add(Resource::new("VpcGatewayAttachment", "AWS::EC2::VPCGatewayAttachment", json!({
            "VpcId": get_ref(&vpc),
            "InternetGatewayId": get_ref(&igw),
        })))?);
        internet_gateway = Some(igw);
    }

    let mut builder = NetworkBuilder::new(block);
    let mut subnets = vec![];
    for tier in input.subnets.iter() {
        let tier_name = pascal_case(&tier.name);
        for (i, az) in azs.iter().enumerate() {
            let cidr = builder.allocate(tier.cidr_mask)?;
            let logical_id = format!("Vpc{tier_name}Subnet{}", i + 1);
            let path = format!("Vpc/{tier_name}Subnet{}", i + 1);
            let is_public = tier.kind == SubnetKind::Public;
            stack.add(Resource::new(&logical_id, "AWS::EC2::Subnet", json!({
                "VpcId": get_ref(&vpc),
                "AvailabilityZone": az,
                "CidrBlock": cidr.to_string(),
                "MapPublicIpOnLaunch": is_public,
                "Tags": name_tag(stack, &path),
            })))?;
            let route_table = stack.add(Resource::new(format!("{logical_id}RouteTable"), "AWS::EC2::RouteTable", json!({
                "VpcId": get_ref(&vpc),
                "Tags": name_tag(stack, &path),
            })))?;
            stack.add(Resource::new(format!("{logical_id}RouteTableAssociation"), "AWS::EC2::SubnetRouteTableAssociation", json!({
                "RouteTableId": get_ref(&route_table),
                "SubnetId": get_ref(&logical_id),
            })))?;
            let mut has_public_route = false;
            if let (true, Some(igw), Some(attachment)) = (is_public, &internet_gateway, &attachment) {
                stack.add(Resource::new(format!("{logical_id}DefaultRoute"), "AWS::EC2::Route", json!({
                    "RouteTableId": get_ref(&route_table),
                    "DestinationCidrBlock": "0.0.0.0/0",
                    "GatewayId": get_ref(igw),
                })).depends_on(attachment))?;
                has_public_route = true;
            }
            subnets.push(Subnet {
                logical_id,
                tier: tier.name.clone(),
                kind: tier.kind,
                availability_zone: az.clone(),
                cidr,
                route_table,
                has_public_route,
            });
        }
    }
    tracing::info!(vpc = %block, azs = azs.len(), subnets = subnets.len(), "network fabric declared");

    Ok(NetworkFabric {
        vpc,
        internet_gateway,
        subnets,
    })
}
