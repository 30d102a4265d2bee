//! DNS validated ACM certificates. This only works if:
//! - the domain is hosted in Route 53 in the same account
//! - the hosted zone id is known at synthesis time, so CloudFormation can insert
//!   the validation records itself.
//!
//! Stack creation blocks until the certificate is issued. If validation does not
//! finish in time CloudFormation fails and rolls the stack back.

use serde_json::{json, Value};

use super::route53::HostedZone;
use crate::error::{Result, SynthError};
use crate::stack::{get_ref, Resource, Stack};

#[derive(Debug, Clone)]
pub struct Certificate {
    pub logical_id: String,
    pub domain_name: String,
}

impl Certificate {
    pub fn arn(&self) -> Value {
        get_ref(&self.logical_id)
    }
}

/// Must be fully qualified. Can have 1 optional wildcard.
/// Examples of valid values:
/// - www.mysite.com
/// - multiple.sub.domains.mysite.com
/// - mysite.com
/// - *.mysite.com
/// Examples of invalid values:
/// - *.something.*.mysite.com
/// - cannotendwithdot.com.
pub fn validate_domain_name(domain_name: &str) -> Result<()> {
    if domain_name.is_empty() {
        return Err(SynthError::InvalidDomain("Must provide a domain name".to_string()));
    }
    if domain_name.ends_with('.') || !domain_name.contains('.') {
        return Err(SynthError::InvalidDomain(format!("{domain_name} must be fully qualified without a trailing dot")));
    }
    if domain_name.contains('*') {
        if domain_name.matches('*').count() > 1 {
            return Err(SynthError::InvalidDomain(format!("Must only provide 1 wildcard. {domain_name} is invalid.")));
        }
        if !domain_name.starts_with("*.") {
            return Err(SynthError::InvalidDomain(format!(
                "If using a wildcard, it must be the first component of your domain, eg: \"*.something.com\". {domain_name} is invalid."
            )));
        }
    }
    if domain_name.len() > 253 || domain_name.split('.').any(|label| label.is_empty() || label.len() > 63) {
        return Err(SynthError::InvalidDomain(format!("{domain_name} has an empty or oversized label")));
    }
    Ok(())
}

pub fn config(domain_name: &str, zone: &HostedZone, stack: &mut Stack) -> Result<Certificate> {
    validate_domain_name(domain_name)?;
    let logical_id = stack.add(Resource::new("SiteCertificate", "AWS::CertificateManager::Certificate", json!({
        "DomainName": domain_name,
        "ValidationMethod": "DNS",
        "DomainValidationOptions": [{
            "DomainName": domain_name,
            "HostedZoneId": zone.id,
        }],
        "Tags": [{ "Key": "Name", "Value": format!("{}/SiteCertificate", stack.name()) }],
    })))?;
    tracing::info!(domain = domain_name, zone = %zone.name, "dns validated certificate declared");
    Ok(Certificate {
        logical_id,
        domain_name: domain_name.to_string(),
    })
}
