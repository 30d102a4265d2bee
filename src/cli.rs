//! Command line surface of the `fargate-rds` binary.
//!
//! - `fargate-rds synth` - write `deploy.json` and `deploy.sh`
//! - `fargate-rds plan` - print the provisioning waves
//! - `fargate-rds lookup` - refresh the context cache
//! - `fargate-rds deploy` - build and push the image, then create or update the
//!   stack and wait for it
//!
//! `DEPLOY_REGION` and `DEPLOY_ACCOUNT` can be set in the environment or in a
//! `.env` file next to the config. Variables already in the environment win.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};

use crate::asset::ImageAsset;
use crate::config::{TopologyConfig, DEFAULT_CONFIG_FILE};
use crate::context::{self, ContextCache, SynthContext, DEFAULT_CONTEXT_FILE};
use crate::stack::{deploy, output, Stack};
use crate::topology;

#[derive(Debug, Parser)]
#[command(name = "fargate-rds")]
#[command(version, about = "Synthesizes and deploys a Fargate + RDS topology to CloudFormation", long_about = None)]
pub struct Cli {
    /// Topology config file. A missing default file means the default topology.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,

    /// Cache of looked up availability zones and hosted zones.
    #[arg(long, global = true, default_value = DEFAULT_CONTEXT_FILE)]
    pub context_file: PathBuf,

    /// Region to deploy to.
    #[arg(long, global = true, env = "DEPLOY_REGION", default_value = "us-east-1")]
    pub region: String,

    /// Account to deploy to. Only used to key the context cache.
    #[arg(long, global = true, env = "DEPLOY_ACCOUNT")]
    pub account: Option<String>,

    /// Fail instead of asking AWS for missing context values.
    #[arg(long, global = true)]
    pub no_lookups: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Write the template and the deploy script.
    Synth(SynthArgs),
    /// Print the order in which resources get provisioned.
    Plan,
    /// Look up availability zones and hosted zones and cache them.
    Lookup,
    /// Synthesize, then create or update the stack through the CloudFormation API.
    Deploy(SynthArgs),
}

#[derive(Debug, Args)]
pub struct SynthArgs {
    /// Directory that receives deploy.json and deploy.sh.
    #[arg(long, default_value = ".")]
    pub out_dir: PathBuf,
}

impl Cli {
    pub fn config_dir(&self) -> PathBuf {
        match self.config.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }

    pub fn dot_env_path(&self) -> PathBuf {
        self.config_dir().join(".env")
    }

    pub fn load_config(&self) -> Result<TopologyConfig> {
        if !self.config.exists() && self.config.as_path() == Path::new(DEFAULT_CONFIG_FILE) {
            tracing::info!("no {DEFAULT_CONFIG_FILE} found, using the default topology");
            return Ok(TopologyConfig::default());
        }
        let config = TopologyConfig::load(&self.config)?;
        Ok(config)
    }

    pub async fn execute(self) -> Result<()> {
        match &self.command {
            Commands::Synth(args) => {
                let (stack, asset) = self.synthesize().await?;
                let written = output::write_outputs(&stack, &asset, &args.out_dir)?;
                println!("wrote {} and {}", written.template.display(), written.script.display());
                print_warnings(&stack);
            }
            Commands::Plan => {
                let (stack, _) = self.synthesize().await?;
                let plan = stack.plan()?;
                print!("{plan}");
                print_warnings(&stack);
            }
            Commands::Lookup => {
                let config = self.load_config()?;
                config.validate()?;
                let zones = config.hosted_zones()?;
                let mut cache = ContextCache::load(&self.context_file)?;
                // forget what we know about this target so every value is fetched again
                cache.availability_zones.remove(&ContextCache::az_key(self.account.as_deref(), &self.region));
                for zone in zones.iter() {
                    cache.hosted_zones.remove(zone);
                }
                context::lookup_missing(&mut cache, self.account.as_deref(), &self.region, &zones).await?;
                cache.save(&self.context_file)?;
                println!("{}", serde_json::to_string_pretty(&cache)?);
            }
            Commands::Deploy(args) => {
                let (stack, asset) = self.synthesize().await?;
                let written = output::write_outputs(&stack, &asset, &args.out_dir)?;
                print_warnings(&stack);
                let outputs = deploy::deploy(&stack, &written.deploy_script)
                    .await
                    .with_context(|| format!("Failed to deploy {}", stack.name()))?;
                println!("{} deployed", stack.name());
                for (key, value) in outputs.iter() {
                    println!("  {key}: {value}");
                }
            }
        }
        Ok(())
    }

    async fn resolve_context(&self, config: &TopologyConfig) -> Result<SynthContext> {
        let zones = config.hosted_zones()?;
        let account = self.account.as_deref();
        let mut cache = ContextCache::load(&self.context_file)?;
        if cache.is_missing(account, &self.region, &zones) && !self.no_lookups {
            context::lookup_missing(&mut cache, account, &self.region, &zones).await?;
            cache.save(&self.context_file)?;
        }
        let ctx = cache.resolve(account, &self.region, &zones)?;
        Ok(ctx)
    }

    async fn synthesize(&self) -> Result<(Stack, ImageAsset)> {
        let config = self.load_config()?;
        config.validate()?;
        let ctx = self.resolve_context(&config).await?;
        let asset_dir = config.image_context(&self.config_dir());
        let asset = ImageAsset::from_directory(&asset_dir, &config.service.dockerfile, &config.service.image_repository)
            .with_context(|| "the service image is built from service.image_context")?;
        let stack = topology::synthesize(&config, ctx, &asset)?;
        Ok((stack, asset))
    }
}

fn print_warnings(stack: &Stack) {
    for warning in stack.warnings() {
        eprintln!("warning: {warning}");
    }
}
