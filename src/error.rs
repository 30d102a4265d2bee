//! Errors raised while building, validating or deploying the topology.

use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, SynthError>;

#[derive(Debug, thiserror::Error)]
pub enum SynthError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to parse config file {path:?}\n{source}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("failed to access {path:?}\n{source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid region code {region:?}\nMust be one of {valid:?}")]
    InvalidRegion {
        region: String,
        valid: &'static [&'static str],
    },

    #[error("invalid cidr {0}")]
    InvalidCidr(String),

    #[error("cannot allocate a /{mask} subnet: address space of {block} is exhausted")]
    AddressSpaceExhausted { block: String, mask: u8 },

    #[error("requested {requested} availability zones but region {region} only has {available}")]
    NotEnoughAvailabilityZones {
        requested: usize,
        available: usize,
        region: String,
    },

    #[error("no context value for {0}. Run `fargate-rds lookup` or allow lookups")]
    MissingContext(String),

    #[error("invalid domain {0}")]
    InvalidDomain(String),

    #[error("No Secret on RDS database")]
    MissingDatabaseSecret,

    #[error("configuration key {key} references field '{field}' which does not exist in secret {secret}")]
    UnknownSecretField {
        key: String,
        field: String,
        secret: String,
    },

    #[error("Invalid resource name {0:?}\nMust contain only alphanumeric characters [A-Za-z0-9] and be 1 to 255 characters long")]
    InvalidResourceName(String),

    #[error("Duplicate resource '{0}'")]
    DuplicateResource(String),

    #[error("Invalid stack name {0}\nMust only consist of alphanumeric characters and hyphens, Must start with an alphabetical character, and cannot be longer than 128 characters.")]
    InvalidStackName(String),

    #[error("resource '{from}' references '{to}' which is not part of the stack")]
    DanglingReference { from: String, to: String },

    #[error("dependency cycle between resources {0:?}")]
    DependencyCycle(Vec<String>),

    #[error("image asset {0:?} does not exist")]
    MissingAsset(PathBuf),

    #[error("failed to serialize template\n{0}")]
    Serialization(#[from] serde_json::Error),

    #[error("context lookup failed: {0}")]
    Lookup(String),

    #[error("failed to deploy stack {stack}\n{message}")]
    Deploy { stack: String, message: String },
}

impl SynthError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        SynthError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        SynthError::InvalidConfig(msg.into())
    }
}
