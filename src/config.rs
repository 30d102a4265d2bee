//! `topology.toml`. Every section is optional and every field defaults to the
//! development profile, so an empty file describes the whole default topology.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, SynthError};
use crate::resources::vpc::SubnetKind;
use crate::resources::{acm_cert, ecs, load_balancer, rds, route53, s3_bucket, vpc};
use crate::stack::validate_stack_name;

pub const DEFAULT_CONFIG_FILE: &str = "topology.toml";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TopologyConfig {
    pub stack_name: String,
    pub network: vpc::Input,
    pub database: rds::Input,
    pub storage: s3_bucket::Input,
    pub dns: route53::Input,
    pub service: ecs::Input,
    pub edge: load_balancer::Input,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            stack_name: "FargateRdsStack".to_string(),
            network: Default::default(),
            database: Default::default(),
            storage: Default::default(),
            dns: Default::default(),
            service: Default::default(),
            edge: Default::default(),
        }
    }
}

impl TopologyConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| SynthError::io(path, e))?;
        Self::from_toml(&contents, path)
    }

    pub fn from_toml(contents: &str, path: &Path) -> Result<Self> {
        let config: TopologyConfig = toml::from_str(contents).map_err(|source| SynthError::ConfigParse {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::debug!(?path, stack = %config.stack_name, "loaded config");
        Ok(config)
    }

    /// checks each section, then the constraints between sections.
    pub fn validate(&self) -> Result<()> {
        validate_stack_name(&self.stack_name)?;
        self.network.validate()?;
        self.database.validate()?;
        self.storage.validate()?;
        self.dns.validate()?;
        acm_cert::validate_domain_name(&self.dns.domain_name)?;
        self.service.validate()?;
        self.edge.validate()?;

        if !self.network.has_tier(self.database.subnet_tier) {
            return Err(SynthError::config(format!(
                "database.subnet_tier is {:?} but the network has no such tier",
                self.database.subnet_tier
            )));
        }
        if !self.network.has_tier(SubnetKind::Public) {
            return Err(SynthError::config("the network needs a public tier for the load balancer and the service"));
        }
        if self.network.max_azs < 2 {
            return Err(SynthError::config(
                "network.max_azs must be at least 2: the load balancer and the database subnet group span two zones",
            ));
        }
        Ok(())
    }

    /// docker context of the service image. relative paths are relative to the config file.
    pub fn image_context(&self, config_dir: &Path) -> PathBuf {
        if self.service.image_context.is_absolute() {
            self.service.image_context.clone()
        } else {
            config_dir.join(&self.service.image_context)
        }
    }

    /// hosted zones the topology needs ids for.
    pub fn hosted_zones(&self) -> Result<Vec<String>> {
        Ok(vec![self.dns.zone()?])
    }
}

/// loads `KEY=value` lines into the process environment. variables that are
/// already set win. a missing file is not an error.
pub fn load_dot_env(path: &Path) -> Result<usize> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(SynthError::io(path, e)),
    };
    let mut loaded = 0;
    for (key, val) in parse_dot_env(&contents) {
        if std::env::var_os(&key).is_some() {
            continue;
        }
        std::env::set_var(&key, val);
        loaded += 1;
    }
    tracing::debug!(?path, loaded, "loaded .env");
    Ok(loaded)
}

pub fn parse_dot_env(contents: &str) -> Vec<(String, String)> {
    let mut out = vec![];
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);
        if let Some((key, val)) = line.split_once('=') {
            let val = val.trim();
            let val = val
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .or_else(|| val.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))
                .unwrap_or(val);
            out.push((key.trim().to_string(), val.to_string()));
        }
    }
    out
}
