//! Every module here follows the same shape: an `Input` with the knobs that can be
//! set from the config file, and a `config` function that validates the input and
//! adds the resources to the stack, returning handles the next layer refers to.

pub mod acm_cert;
pub mod ecs;
pub mod iam;
pub mod rds;
pub mod route53;
pub mod s3_bucket;
pub mod security;
pub mod vpc;

// higher level resources:
pub mod load_balancer;

/// `public-web_tier` -> `PublicWebTier`. keeps only alphanumerics so the result is
/// usable inside logical ids.
pub fn pascal_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper_next = true;
    for c in name.chars() {
        if !c.is_ascii_alphanumeric() {
            upper_next = true;
            continue;
        }
        if upper_next {
            out.push(c.to_ascii_uppercase());
            upper_next = false;
        } else {
            out.push(c);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pascal_case_works() {
        assert_eq!(pascal_case("public"), "Public");
        assert_eq!(pascal_case("public-web_tier"), "PublicWebTier");
        assert_eq!(pascal_case("db tier 2"), "DbTier2");
        assert_eq!(pascal_case("--"), "");
    }
}
