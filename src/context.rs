//! Values that have to be looked up in the target account before synthesis
//! (availability zones, hosted zone ids). They are cached in a json file so
//! repeated synthesis is deterministic and works offline.

use std::collections::BTreeMap;
use std::path::Path;

use aws_types::region::Region;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SynthError};
use crate::regions::verify_region;

pub const DEFAULT_CONTEXT_FILE: &str = "fargate-rds.context.json";

/// Everything a builder step may need to know about the target environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SynthContext {
    pub account: Option<String>,
    pub region: String,
    pub availability_zones: Vec<String>,
    /// zone name (without the trailing dot) -> hosted zone id (without the `/hostedzone/` prefix)
    pub hosted_zones: BTreeMap<String, String>,
}

impl SynthContext {
    pub fn hosted_zone_id(&self, zone_name: &str) -> Result<&str> {
        self.hosted_zones
            .get(&zone_name.trim_end_matches('.').to_ascii_lowercase())
            .map(|s| s.as_str())
            .ok_or_else(|| SynthError::MissingContext(format!("hosted zone {zone_name}")))
    }

    #[cfg(test)]
    pub fn for_tests() -> Self {
        let mut hosted_zones = BTreeMap::new();
        hosted_zones.insert("example.com".to_string(), "Z0123456789ABCDEFGHIJ".to_string());
        Self {
            account: Some("123456789012".to_string()),
            region: "us-east-1".to_string(),
            availability_zones: vec![
                "us-east-1a".to_string(),
                "us-east-1b".to_string(),
                "us-east-1c".to_string(),
            ],
            hosted_zones,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ContextCache {
    #[serde(default)]
    pub availability_zones: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub hosted_zones: BTreeMap<String, String>,
}

impl ContextCache {
    /// a missing file is an empty cache.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(SynthError::io(path, e)),
        };
        Ok(serde_json::from_str(&contents)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents).map_err(|e| SynthError::io(path, e))
    }

    pub fn az_key(account: Option<&str>, region: &str) -> String {
        format!("account={}:region={}", account.unwrap_or("unknown"), region)
    }

    pub fn is_missing(&self, account: Option<&str>, region: &str, zones: &[String]) -> bool {
        !self.availability_zones.contains_key(&Self::az_key(account, region))
            || zones.iter().any(|z| !self.hosted_zones.contains_key(z.trim_end_matches('.')))
    }

    pub fn resolve(&self, account: Option<&str>, region: &str, zones: &[String]) -> Result<SynthContext> {
        verify_region(region)?;
        let key = Self::az_key(account, region);
        let availability_zones = self
            .availability_zones
            .get(&key)
            .cloned()
            .ok_or_else(|| SynthError::MissingContext(format!("availability zones of {key}")))?;
        let mut hosted_zones = BTreeMap::new();
        for zone in zones {
            let zone = zone.trim_end_matches('.');
            let id = self
                .hosted_zones
                .get(zone)
                .ok_or_else(|| SynthError::MissingContext(format!("hosted zone {zone}")))?;
            hosted_zones.insert(zone.to_string(), id.clone());
        }
        Ok(SynthContext {
            account: account.map(|a| a.to_string()),
            region: region.to_string(),
            availability_zones,
            hosted_zones,
        })
    }
}

pub async fn load_aws_config(region: &str) -> aws_config::SdkConfig {
    aws_config::from_env()
        .region(Region::new(region.to_string()))
        .load()
        .await
}

/// fills in whatever the cache does not know yet by asking EC2 and Route 53.
pub async fn lookup_missing(
    cache: &mut ContextCache,
    account: Option<&str>,
    region: &str,
    zones: &[String],
) -> Result<()> {
    verify_region(region)?;
    let shared_config = load_aws_config(region).await;

    let key = ContextCache::az_key(account, region);
    if !cache.availability_zones.contains_key(&key) {
        tracing::info!(%region, "looking up availability zones");
        let azs = lookup_availability_zones(&aws_sdk_ec2::Client::new(&shared_config)).await?;
        cache.availability_zones.insert(key, azs);
    }

    let route53 = aws_sdk_route53::Client::new(&shared_config);
    for zone in zones {
        let zone = zone.trim_end_matches('.');
        if cache.hosted_zones.contains_key(zone) {
            continue;
        }
        tracing::info!(%zone, "looking up hosted zone");
        let id = lookup_hosted_zone(&route53, zone).await?;
        cache.hosted_zones.insert(zone.to_string(), id);
    }
    Ok(())
}

async fn lookup_availability_zones(client: &aws_sdk_ec2::Client) -> Result<Vec<String>> {
    use aws_sdk_ec2::types::Filter;

    let resp = client
        .describe_availability_zones()
        .filters(Filter::builder().name("state").values("available").build())
        .filters(Filter::builder().name("zone-type").values("availability-zone").build())
        .send()
        .await
        .map_err(|e| SynthError::Lookup(format!("{:#?}", e)))?;
    let mut out: Vec<String> = resp
        .availability_zones()
        .unwrap_or_default()
        .iter()
        .filter_map(|az| az.zone_name().map(|n| n.to_string()))
        .collect();
    out.sort();
    if out.is_empty() {
        return Err(SynthError::Lookup("region reported no available zones".to_string()));
    }
    Ok(out)
}

async fn lookup_hosted_zone(client: &aws_sdk_route53::Client, zone: &str) -> Result<String> {
    let dns_name = format!("{zone}.");
    let resp = client
        .list_hosted_zones_by_name()
        .dns_name(&dns_name)
        .send()
        .await
        .map_err(|e| SynthError::Lookup(format!("{:#?}", e)))?;
    for hosted in resp.hosted_zones().unwrap_or_default() {
        let is_private = hosted.config().map(|c| c.private_zone()).unwrap_or(false);
        if hosted.name() != Some(dns_name.as_str()) || is_private {
            continue;
        }
        if let Some(id) = hosted.id() {
            return Ok(id.trim_start_matches("/hostedzone/").to_string());
        }
    }
    Err(SynthError::Lookup(format!("no public hosted zone named {zone} in this account")))
}
