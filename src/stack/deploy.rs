//! Creates or updates the stack through the CloudFormation API and polls until
//! it settles. Certificate validation, rollback and resource waits all happen
//! inside CloudFormation; this only reports the outcome. A failed create rolls
//! back and keeps the stack around so its failure reason can be read.

use std::collections::BTreeMap;

use aws_sdk_cloudformation::types::{Capability, OnFailure, Stack as CfnStack, StackStatus};
use aws_sdk_cloudformation::Client;

use super::output::DeployScript;
use super::Stack;
use crate::context::load_aws_config;
use crate::error::{Result, SynthError};

const POLL_INTERVAL_MS: u64 = 5000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StackState {
    Settled,
    InProgress,
    Failed(String),
}

pub fn classify(status: &StackStatus, reason: Option<&str>) -> StackState {
    match status {
        StackStatus::CreateComplete
        | StackStatus::UpdateComplete
        | StackStatus::ImportComplete => StackState::Settled,

        StackStatus::CreateInProgress
        | StackStatus::ImportInProgress
        | StackStatus::ImportRollbackInProgress
        | StackStatus::ReviewInProgress
        | StackStatus::RollbackInProgress
        | StackStatus::UpdateCompleteCleanupInProgress
        | StackStatus::UpdateInProgress
        | StackStatus::UpdateRollbackCompleteCleanupInProgress
        | StackStatus::UpdateRollbackInProgress => StackState::InProgress,

        // nothing here deletes stacks, so a delete means someone else removed it mid-deploy.
        // a rolled back update leaves the previous version running, but the new one did not apply
        _ => StackState::Failed(format!(
            "{}: {}",
            status.as_str(),
            reason.unwrap_or("Failed to get stack failure reason")
        )),
    }
}

fn deploy_error(stack: &str, message: impl Into<String>) -> SynthError {
    SynthError::Deploy {
        stack: stack.to_string(),
        message: message.into(),
    }
}

pub async fn does_stack_exist(client: &Client, name: &str) -> Result<bool> {
    match client.describe_stacks().stack_name(name).send().await {
        Ok(_) => Ok(true),
        Err(e) => {
            let e_str = format!("{:#?}", e);
            if e_str.contains("does not exist") {
                return Ok(false);
            }
            Err(deploy_error(name, e_str))
        }
    }
}

pub async fn describe_stack(client: &Client, name: &str) -> Result<CfnStack> {
    let resp = client
        .describe_stacks()
        .stack_name(name)
        .send()
        .await
        .map_err(|e| deploy_error(name, format!("{:#?}", e)))?;
    resp.stacks()
        .and_then(|stacks| stacks.first())
        .cloned()
        .ok_or_else(|| deploy_error(name, format!("Stack {name} not found")))
}

/// polls until the stack settles and returns its outputs.
pub async fn wait_for_output(client: &Client, name: &str) -> Result<BTreeMap<String, String>> {
    loop {
        tokio::time::sleep(tokio::time::Duration::from_millis(POLL_INTERVAL_MS)).await;
        let stack = describe_stack(client, name).await?;
        let Some(status) = stack.stack_status() else {
            return Err(deploy_error(name, format!("Stack {name} has no status")));
        };
        match classify(status, stack.stack_status_reason()) {
            StackState::InProgress => {
                tracing::info!(stack = name, status = status.as_str(), "waiting");
            }
            StackState::Failed(reason) => return Err(deploy_error(name, reason)),
            StackState::Settled => return Ok(describe_outputs(&stack)),
        }
    }
}

/// a create that rolled back leaves a stack that can only be deleted.
pub fn blocks_update(status: &StackStatus) -> bool {
    matches!(status, StackStatus::RollbackComplete | StackStatus::RollbackFailed)
}

/// returns false if there was nothing to update.
pub async fn create_or_update_stack(client: &Client, name: &str, body: &str) -> Result<bool> {
    if does_stack_exist(client, name).await? {
        let current = describe_stack(client, name).await?;
        if let Some(status) = current.stack_status().filter(|s| blocks_update(s)) {
            return Err(deploy_error(
                name,
                format!(
                    "Stack {name} is {} after a failed create ({}). Delete it before deploying again",
                    status.as_str(),
                    current.stack_status_reason().unwrap_or("no reason given")
                ),
            ));
        }
        tracing::info!(stack = name, "updating");
        let sent = client
            .update_stack()
            .capabilities(Capability::CapabilityNamedIam)
            .capabilities(Capability::CapabilityIam)
            .stack_name(name)
            .template_body(body)
            .send()
            .await;
        if let Err(e) = sent {
            let e_str = format!("{:#?}", e);
            if e_str.contains("No updates are to be performed") {
                return Ok(false);
            }
            return Err(deploy_error(name, e_str));
        }
    } else {
        tracing::info!(stack = name, "creating");
        client
            .create_stack()
            .on_failure(OnFailure::Rollback)
            .capabilities(Capability::CapabilityNamedIam)
            .capabilities(Capability::CapabilityIam)
            .stack_name(name)
            .template_body(body)
            .send()
            .await
            .map_err(|e| deploy_error(name, format!("{:#?}", e)))?;
    }
    Ok(true)
}

/// builds and pushes the service image, then deploys the synthesized template
/// and waits for it.
pub async fn deploy(stack: &Stack, script: &DeployScript) -> Result<BTreeMap<String, String>> {
    script.push_image(stack.name())?;
    let shared_config = load_aws_config(stack.region()).await;
    let client = Client::new(&shared_config);
    let body = stack.to_json_pretty()?;
    let name = stack.name();
    if !create_or_update_stack(&client, name, &body).await? {
        tracing::info!(stack = name, "no changes");
        return Ok(describe_outputs(&describe_stack(&client, name).await?));
    }
    wait_for_output(&client, name).await
}

fn describe_outputs(stack: &CfnStack) -> BTreeMap<String, String> {
    stack
        .outputs()
        .unwrap_or_default()
        .iter()
        .filter_map(|o| Some((o.output_key()?.to_string(), o.output_value()?.to_string())))
        .collect()
}
