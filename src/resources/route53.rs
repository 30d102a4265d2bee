use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{Result, SynthError};
use crate::stack::{Resource, Stack};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Input {
    /// the pre-existing public hosted zone. if empty we guess it from the last
    /// two labels of `domain_name`.
    pub zone_name: String,
    /// fully qualified name the application is published under.
    pub domain_name: String,
}

impl Default for Input {
    fn default() -> Self {
        Self {
            zone_name: "example.com".to_string(),
            domain_name: "app.example.com".to_string(),
        }
    }
}

impl Input {
    /// the hosted zone name, lowercased and without the trailing dot.
    pub fn zone(&self) -> Result<String> {
        if !self.zone_name.is_empty() {
            return Ok(self.zone_name.trim_end_matches('.').to_ascii_lowercase());
        }
        // try to guess hosted zone name based on the record name
        let name_components: Vec<&str> = self.domain_name.split('.').collect();
        if name_components.len() < 2 || name_components.iter().any(|c| c.is_empty()) {
            return Err(SynthError::InvalidDomain(format!(
                "{} (cannot guess a hosted zone, set dns.zone_name)",
                self.domain_name
            )));
        }
        Ok(name_components[name_components.len() - 2..].join(".").to_ascii_lowercase())
    }

    pub fn validate(&self) -> Result<()> {
        let zone = self.zone()?;
        // dns names compare case-insensitively
        let domain = self.domain_name.trim_start_matches("*.").to_ascii_lowercase();
        if domain != zone && !domain.ends_with(&format!(".{zone}")) {
            return Err(SynthError::InvalidDomain(format!(
                "{} is not part of hosted zone {zone}",
                self.domain_name
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostedZone {
    pub name: String,
    pub id: String,
}

/// resolves the hosted zone from the synthesis context.
pub fn lookup(input: &Input, stack: &Stack) -> Result<HostedZone> {
    input.validate()?;
    let name = input.zone()?;
    let id = stack.context().hosted_zone_id(&name)?.to_string();
    Ok(HostedZone { name, id })
}

/// an `A` alias record pointing `domain_name` at a load balancer or distribution.
pub fn alias_record(
    stack: &mut Stack,
    logical_id: &str,
    zone: &HostedZone,
    domain_name: &str,
    alias_target_dns_name: Value,
    alias_target_hosted_zone_id: Value,
) -> Result<String> {
    let mut name = domain_name.to_string();
    if !name.ends_with('.') {
        name.push('.'); // record names are fully qualified
    }
    stack.add(Resource::new(logical_id, "AWS::Route53::RecordSet", json!({
        "HostedZoneId": zone.id,
        "Name": name,
        "Type": "A",
        "Comment": format!("{} ({})", domain_name, stack.name()),
        "AliasTarget": {
            "DNSName": alias_target_dns_name,
            "HostedZoneId": alias_target_hosted_zone_id,
            "EvaluateTargetHealth": false,
        },
    })))
}
