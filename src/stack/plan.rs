use std::collections::{BTreeSet, HashMap};
use std::fmt;

use serde_json::Value;

use super::Resource;
use crate::error::{Result, SynthError};

/// Resources grouped into waves. Every resource in a wave depends only on
/// resources in earlier waves, so a wave can be provisioned in parallel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisioningPlan {
    waves: Vec<Vec<String>>,
}

impl ProvisioningPlan {
    pub fn from_resources(resources: &[Resource]) -> Result<Self> {
        let index: HashMap<&str, usize> = resources
            .iter()
            .enumerate()
            .map(|(i, r)| (r.name.as_str(), i))
            .collect();

        let mut dependencies: Vec<BTreeSet<usize>> = Vec::with_capacity(resources.len());
        for resource in resources.iter() {
            let mut names = BTreeSet::new();
            collect_references(&resource.properties, &mut names);
            names.extend(resource.depends_on.iter().cloned());
            let mut deps = BTreeSet::new();
            for name in names {
                match index.get(name.as_str()) {
                    Some(i) => {
                        deps.insert(*i);
                    }
                    None => {
                        return Err(SynthError::DanglingReference {
                            from: resource.name.clone(),
                            to: name,
                        });
                    }
                }
            }
            dependencies.push(deps);
        }

        let mut placed = vec![false; resources.len()];
        let mut remaining = resources.len();
        let mut waves = vec![];
        while remaining > 0 {
            let wave: Vec<usize> = (0..resources.len())
                .filter(|i| !placed[*i])
                .filter(|i| dependencies[*i].iter().all(|d| placed[*d]))
                .collect();
            if wave.is_empty() {
                let stuck = (0..resources.len())
                    .filter(|i| !placed[*i])
                    .map(|i| resources[i].name.clone())
                    .collect();
                return Err(SynthError::DependencyCycle(stuck));
            }
            for i in wave.iter() {
                placed[*i] = true;
            }
            remaining -= wave.len();
            waves.push(wave.into_iter().map(|i| resources[i].name.clone()).collect());
        }
        Ok(Self { waves })
    }

    pub fn waves(&self) -> &[Vec<String>] {
        &self.waves
    }

    pub fn order(&self) -> impl Iterator<Item = &String> {
        self.waves.iter().flatten()
    }

    /// index of the wave that provisions `logical_id`.
    pub fn wave_of(&self, logical_id: &str) -> Option<usize> {
        self.waves.iter().position(|w| w.iter().any(|n| n == logical_id))
    }
}

impl fmt::Display for ProvisioningPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, wave) in self.waves.iter().enumerate() {
            writeln!(f, "wave {}: {}", i + 1, wave.join(", "))?;
        }
        Ok(())
    }
}

/// collects the logical ids referenced through Ref, Fn::GetAtt and Fn::Sub.
/// pseudo parameters (AWS::Region etc.) are skipped.
pub fn collect_references(value: &Value, out: &mut BTreeSet<String>) {
    match value {
        Value::Object(map) => {
            if map.len() == 1 {
                if let Some(Value::String(target)) = map.get("Ref") {
                    if !target.starts_with("AWS::") {
                        out.insert(target.clone());
                    }
                    return;
                }
                if let Some(att) = map.get("Fn::GetAtt") {
                    match att {
                        Value::Array(parts) => {
                            if let Some(Value::String(target)) = parts.first() {
                                out.insert(target.clone());
                            }
                        }
                        Value::String(s) => {
                            if let Some(target) = s.split('.').next() {
                                out.insert(target.to_string());
                            }
                        }
                        _ => {}
                    }
                    return;
                }
                if let Some(sub) = map.get("Fn::Sub") {
                    match sub {
                        Value::String(s) => out.extend(sub_references(s)),
                        Value::Array(parts) => {
                            let variables = parts.get(1).and_then(|v| v.as_object());
                            if let Some(Value::String(s)) = parts.first() {
                                for name in sub_references(s) {
                                    if !variables.map(|v| v.contains_key(&name)).unwrap_or(false) {
                                        out.insert(name);
                                    }
                                }
                            }
                            if let Some(variables) = variables {
                                for v in variables.values() {
                                    collect_references(v, out);
                                }
                            }
                        }
                        _ => {}
                    }
                    return;
                }
            }
            for v in map.values() {
                collect_references(v, out);
            }
        }
        Value::Array(items) => {
            for v in items {
                collect_references(v, out);
            }
        }
        _ => {}
    }
}

fn sub_references(template: &str) -> Vec<String> {
    let mut out = vec![];
    let mut rest = template;
    while let Some(start) = rest.find("${") {
        let after = &rest[start + 2..];
        let end = match after.find('}') {
            Some(e) => e,
            None => break,
        };
        let inner = &after[..end];
        // ${!Literal} is an escaped literal
        if !inner.starts_with('!') && !inner.starts_with("AWS::") {
            if let Some(name) = inner.split('.').next() {
                if !name.is_empty() {
                    out.push(name.to_string());
                }
            }
        }
        rest = &after[end + 1..];
    }
    out
}
