//! Writes the synthesized template and the script that builds, packages and
//! deploys it.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use super::Stack;
use crate::asset::ImageAsset;
use crate::error::{Result, SynthError};

pub const TEMPLATE_FILE: &str = "deploy.json";
pub const DEPLOY_FILE: &str = "deploy.sh";
pub const STEP_BUILD: &str = "# 1. build:";
pub const STEP_PACKAGE: &str = "# 2. package:";
pub const STEP_DEPLOY: &str = "# 3. deploy:";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeployScript {
    pub preamble: Vec<String>,
    pub build: Vec<String>,
    pub package: Vec<String>,
    pub deploy: Vec<String>,
}

impl DeployScript {
    pub fn new(stack: &Stack, asset: &ImageAsset, asset_dir: &Path) -> Self {
        let region = stack.region();
        let image = asset.image_name();
        let repository = &asset.repository;
        let dockerfile = asset_dir.join(&asset.dockerfile);

        let preamble = vec![
            format!("REGION=\"${{DEPLOY_REGION:-{region}}}\""),
            "ACCOUNT=\"${DEPLOY_ACCOUNT:-$(aws sts get-caller-identity --query Account --output text)}\"".to_string(),
            "case \"$REGION\" in cn-*) DOMAIN_SUFFIX=\"amazonaws.com.cn\" ;; *) DOMAIN_SUFFIX=\"amazonaws.com\" ;; esac".to_string(),
            "REGISTRY=\"$ACCOUNT.dkr.ecr.$REGION.$DOMAIN_SUFFIX\"".to_string(),
        ];
        let build = vec![format!(
            "docker build -t {image} -f {} {}",
            shell_quote(&dockerfile.to_string_lossy()),
            shell_quote(&asset_dir.to_string_lossy()),
        )];
        let package = vec![
            format!(
                "aws --region \"$REGION\" ecr describe-repositories --repository-names {repository} >/dev/null 2>&1 \
                 || aws --region \"$REGION\" ecr create-repository --repository-name {repository} >/dev/null"
            ),
            "aws --region \"$REGION\" ecr get-login-password | docker login --username AWS --password-stdin \"$REGISTRY\"".to_string(),
            format!("docker tag {image} \"$REGISTRY/{image}\""),
            format!("docker push \"$REGISTRY/{image}\""),
        ];
        let deploy = vec![format!(
            "AWS_REGION=\"$REGION\" aws --region \"$REGION\" cloudformation deploy --stack-name {} \
             --template-file ./{TEMPLATE_FILE} --capabilities CAPABILITY_IAM CAPABILITY_NAMED_IAM",
            stack.name()
        )];
        Self { preamble, build, package, deploy }
    }

    pub fn render(&self) -> String {
        let mut out = String::from("#!/usr/bin/env bash\nset -euo pipefail\ncd \"$(dirname \"$0\")\"\n\n");
        for line in self.preamble.iter() {
            out.push_str(line);
            out.push('\n');
        }
        for (step, commands) in [(STEP_BUILD, &self.build), (STEP_PACKAGE, &self.package), (STEP_DEPLOY, &self.deploy)] {
            out.push('\n');
            out.push_str(step);
            out.push('\n');
            for cmd in commands.iter() {
                out.push_str(cmd);
                out.push('\n');
            }
        }
        out
    }

    /// the preamble, build and package steps. the deploy step is left out.
    pub fn image_steps(&self) -> String {
        let mut out = String::from("set -euo pipefail\n");
        for line in self.preamble.iter().chain(self.build.iter()).chain(self.package.iter()) {
            out.push_str(line);
            out.push('\n');
        }
        out
    }

    /// builds the service image and pushes it to the registry.
    pub fn push_image(&self, stack_name: &str) -> Result<()> {
        let out = Command::new("bash")
            .arg("-c")
            .arg(self.image_steps())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .stdin(Stdio::null())
            .output()
            .map_err(|e| SynthError::Deploy {
                stack: stack_name.to_string(),
                message: format!("Failed to invoke bash\n{:?}", e),
            })?;
        if !out.status.success() {
            return Err(SynthError::Deploy {
                stack: stack_name.to_string(),
                message: format!("Failed to build and push the service image ({})", out.status),
            });
        }
        Ok(())
    }
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

#[derive(Debug, Clone)]
pub struct WrittenFiles {
    pub template: PathBuf,
    pub script: PathBuf,
    pub deploy_script: DeployScript,
}

pub fn write_outputs(stack: &Stack, asset: &ImageAsset, out_dir: &Path) -> Result<WrittenFiles> {
    std::fs::create_dir_all(out_dir).map_err(|e| SynthError::io(out_dir, e))?;

    let template = out_dir.join(TEMPLATE_FILE);
    std::fs::write(&template, stack.to_json_pretty()?).map_err(|e| SynthError::io(&template, e))?;

    // the script cds into its own directory, so the docker context must not be relative
    let asset_dir = std::fs::canonicalize(&asset.directory).unwrap_or_else(|_| asset.directory.clone());
    let script = out_dir.join(DEPLOY_FILE);
    let deploy_script = DeployScript::new(stack, asset, &asset_dir);
    std::fs::write(&script, deploy_script.render()).map_err(|e| SynthError::io(&script, e))?;
    make_executable(&script)?;

    tracing::info!(template = ?template, script = ?script, "wrote deployment files");
    Ok(WrittenFiles { template, script, deploy_script })
}

#[cfg(unix)]
fn make_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = std::fs::metadata(path).map_err(|e| SynthError::io(path, e))?.permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(path, perms).map_err(|e| SynthError::io(path, e))
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> Result<()> {
    Ok(())
}
