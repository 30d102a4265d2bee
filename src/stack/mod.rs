//! The stack is the explicit synthesis context: every builder step receives
//! `&mut Stack`, pushes its resources into it and reads the lookup context from it.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::context::SynthContext;
use crate::error::{Result, SynthError};

pub mod deploy;
pub mod output;
pub mod plan;

pub use plan::ProvisioningPlan;

pub const TEMPLATE_VERSION: &str = "2010-09-09";

/// What happens to a resource when it is removed from the stack or the stack is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemovalPolicy {
    Destroy,
    Retain,
    Snapshot,
}

impl RemovalPolicy {
    pub fn as_cfn(&self) -> &'static str {
        match self {
            RemovalPolicy::Destroy => "Delete",
            RemovalPolicy::Retain => "Retain",
            RemovalPolicy::Snapshot => "Snapshot",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Resource {
    /// logical id in the template. alphanumeric only.
    pub name: String,
    pub ty: &'static str,
    pub properties: Value,
    pub depends_on: Vec<String>,
    pub removal_policy: Option<RemovalPolicy>,
}

impl Resource {
    pub fn new(name: impl Into<String>, ty: &'static str, properties: Value) -> Self {
        Self {
            name: name.into(),
            ty,
            properties,
            depends_on: vec![],
            removal_policy: None,
        }
    }

    pub fn depends_on(mut self, logical_id: impl Into<String>) -> Self {
        let logical_id = logical_id.into();
        if !self.depends_on.contains(&logical_id) {
            self.depends_on.push(logical_id);
        }
        self
    }

    pub fn removal_policy(mut self, policy: RemovalPolicy) -> Self {
        self.removal_policy = Some(policy);
        self
    }

    pub fn property(&self, key: &str) -> Option<&Value> {
        self.properties.get(key)
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct SavedResource {
    #[serde(rename = "Type")]
    pub ty: String,
    #[serde(rename = "Properties")]
    pub properties: Value,
    #[serde(rename = "DependsOn", default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(rename = "DeletionPolicy", default, skip_serializing_if = "Option::is_none")]
    pub deletion_policy: Option<String>,
    #[serde(rename = "UpdateReplacePolicy", default, skip_serializing_if = "Option::is_none")]
    pub update_replace_policy: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceOutput {
    #[serde(rename = "Description")]
    pub description: String,
    #[serde(rename = "Value")]
    pub value: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavedTemplate {
    #[serde(rename = "AWSTemplateFormatVersion")]
    pub version: String,
    #[serde(rename = "Description", default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(rename = "Resources")]
    pub resources: BTreeMap<String, SavedResource>,
    #[serde(rename = "Outputs", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub outputs: BTreeMap<String, ResourceOutput>,
}

impl Default for SavedTemplate {
    fn default() -> Self {
        Self {
            version: TEMPLATE_VERSION.to_string(),
            description: String::new(),
            resources: Default::default(),
            outputs: Default::default(),
        }
    }
}

#[derive(Debug)]
pub struct Stack {
    name: String,
    context: SynthContext,
    resources: Vec<Resource>,
    outputs: BTreeMap<String, ResourceOutput>,
    warnings: Vec<String>,
}

impl Stack {
    pub fn new(name: &str, context: SynthContext) -> Result<Self> {
        let name = validate_stack_name(name)?;
        Ok(Self {
            name,
            context,
            resources: vec![],
            outputs: BTreeMap::new(),
            warnings: vec![],
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn context(&self) -> &SynthContext {
        &self.context
    }

    pub fn region(&self) -> &str {
        &self.context.region
    }

    /// adds a resource and returns its logical id.
    pub fn add(&mut self, resource: Resource) -> Result<String> {
        verify_resource_name(&resource.name)?;
        if self.resource(&resource.name).is_some() {
            return Err(SynthError::DuplicateResource(resource.name));
        }
        tracing::debug!(logical_id = %resource.name, ty = resource.ty, "adding resource");
        let name = resource.name.clone();
        self.resources.push(resource);
        Ok(name)
    }

    pub fn resource(&self, logical_id: &str) -> Option<&Resource> {
        self.resources.iter().find(|r| r.name == logical_id)
    }

    pub fn resources(&self) -> &[Resource] {
        &self.resources
    }

    pub fn resources_of_type<'a>(&'a self, ty: &'a str) -> impl Iterator<Item = &'a Resource> + 'a {
        self.resources.iter().filter(move |r| r.ty == ty)
    }

    pub fn add_output(&mut self, key: &str, description: &str, value: Value) -> Result<()> {
        verify_resource_name(key)?;
        self.outputs.insert(
            key.to_string(),
            ResourceOutput {
                description: description.to_string(),
                value,
            },
        );
        Ok(())
    }

    pub fn outputs(&self) -> &BTreeMap<String, ResourceOutput> {
        &self.outputs
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!("{message}");
        self.warnings.push(message);
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    /// orders every resource by its dependencies. fails on dangling references or cycles.
    pub fn plan(&self) -> Result<ProvisioningPlan> {
        ProvisioningPlan::from_resources(&self.resources)
    }

    pub fn to_template(&self) -> SavedTemplate {
        let mut template = SavedTemplate {
            description: format!("{} (synthesized by fargate-rds)", self.name),
            ..Default::default()
        };
        for resource in self.resources.iter() {
            let policy = resource.removal_policy.map(|p| p.as_cfn().to_string());
            let saved = SavedResource {
                ty: resource.ty.to_string(),
                properties: resource.properties.clone(),
                depends_on: resource.depends_on.clone(),
                deletion_policy: policy.clone(),
                update_replace_policy: policy,
            };
            template.resources.insert(resource.name.clone(), saved);
        }
        template.outputs = self.outputs.clone();
        template
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.to_template())?)
    }
}

pub fn get_ref(logical_id: &str) -> Value {
    json!({ "Ref": logical_id })
}

pub fn get_att(logical_id: &str, attribute: &str) -> Value {
    json!({ "Fn::GetAtt": [logical_id, attribute] })
}

pub fn sub(template: impl Into<String>) -> Value {
    json!({ "Fn::Sub": template.into() })
}

pub fn join(delimiter: &str, parts: Vec<Value>) -> Value {
    json!({ "Fn::Join": [delimiter, parts] })
}

pub fn name_tag(stack: &Stack, path: &str) -> Value {
    json!([{ "Key": "Name", "Value": format!("{}/{}", stack.name(), path) }])
}

pub fn verify_resource_name(resource_name: &str) -> Result<()> {
    let valid = !resource_name.is_empty()
        && resource_name.len() <= 255
        && resource_name.chars().all(|c| c.is_ascii_alphanumeric());
    if !valid {
        return Err(SynthError::InvalidResourceName(resource_name.to_string()));
    }
    Ok(())
}

pub fn validate_stack_name(stack_name: &str) -> Result<String> {
    // A stack name can contain only alphanumeric characters (case sensitive) and hyphens.
    // It must start with an alphabetical character and can't be longer than 128 characters.
    let mut chars = stack_name.chars();
    let starts_alpha = chars.next().map(|c| c.is_ascii_alphabetic()).unwrap_or(false);
    if !starts_alpha
        || stack_name.len() > 128
        || !stack_name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    {
        return Err(SynthError::InvalidStackName(stack_name.to_string()));
    }
    Ok(stack_name.to_string())
}
