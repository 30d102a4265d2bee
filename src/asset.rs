//! Container image assets. The image is built from a local docker context by the
//! deploy script and pushed to ECR under a tag derived from the context contents,
//! so an unchanged context never triggers a new task definition revision.

use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::error::{Result, SynthError};
use crate::stack::sub;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageAsset {
    pub directory: PathBuf,
    pub dockerfile: String,
    pub repository: String,
    pub tag: String,
}

impl ImageAsset {
    pub fn from_directory(directory: &Path, dockerfile: &str, repository: &str) -> Result<Self> {
        let dockerfile_path = directory.join(dockerfile);
        if !directory.is_dir() {
            return Err(SynthError::MissingAsset(directory.to_path_buf()));
        }
        if !dockerfile_path.is_file() {
            return Err(SynthError::MissingAsset(dockerfile_path));
        }
        let tag = hash_directory(directory)?;
        tracing::debug!(?directory, %tag, "hashed image asset");
        Ok(Self {
            directory: directory.to_path_buf(),
            dockerfile: dockerfile.to_string(),
            repository: repository.to_string(),
            tag,
        })
    }

    /// repository:tag, without the registry
    pub fn image_name(&self) -> String {
        format!("{}:{}", self.repository, self.tag)
    }

    pub fn image_uri(&self) -> Value {
        sub(format!(
            "${{AWS::AccountId}}.dkr.ecr.${{AWS::Region}}.${{AWS::URLSuffix}}/{}",
            self.image_name()
        ))
    }
}

fn iter_files_recursively(start_dir: &Path, callback: &mut impl FnMut(PathBuf) -> Result<()>) -> Result<()> {
    let readdir = std::fs::read_dir(start_dir).map_err(|e| SynthError::io(start_dir, e))?;
    for entry in readdir {
        let direntry = entry.map_err(|e| SynthError::io(start_dir, e))?;
        let path = direntry.path();
        let fp = direntry.file_type().map_err(|e| SynthError::io(&path, e))?;
        if fp.is_dir() {
            iter_files_recursively(&path, callback)?;
        } else {
            callback(path)?;
        }
    }
    Ok(())
}

/// adler32 over every (relative path, contents) pair in path order.
pub fn hash_directory(directory: &Path) -> Result<String> {
    let mut files = vec![];
    iter_files_recursively(directory, &mut |p| {
        files.push(p);
        Ok(())
    })?;
    let mut relative: Vec<(String, PathBuf)> = files
        .into_iter()
        .map(|p| {
            let rel = p.strip_prefix(directory).unwrap_or(&p).to_string_lossy().replace('\\', "/");
            (rel, p)
        })
        .collect();
    relative.sort();

    let mut hasher = adler::Adler32::new();
    for (rel, path) in relative.iter() {
        let contents = std::fs::read(path).map_err(|e| SynthError::io(path, e))?;
        hasher.write_slice(rel.as_bytes());
        hasher.write_slice(&[0]);
        hasher.write_slice(&contents);
        hasher.write_slice(&[0]);
    }
    Ok(format!("{:08x}", hasher.checksum()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("fargate-rds-asset-{}-{}", name, std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(dir.join("src")).unwrap();
        std::fs::write(dir.join("Dockerfile"), "FROM node:18\nEXPOSE 1337\n").unwrap();
        std::fs::write(dir.join("src/index.js"), "console.log('hi')\n").unwrap();
        dir
    }

    #[test]
    fn hash_is_stable_and_content_sensitive() {
        let dir = scratch_dir("hash");
        let first = ImageAsset::from_directory(&dir, "Dockerfile", "app").unwrap();
        let second = ImageAsset::from_directory(&dir, "Dockerfile", "app").unwrap();
        assert_eq!(first.tag, second.tag);
        assert_eq!(first.tag.len(), 8);

        std::fs::write(dir.join("src/index.js"), "console.log('bye')\n").unwrap();
        let third = ImageAsset::from_directory(&dir, "Dockerfile", "app").unwrap();
        assert_ne!(first.tag, third.tag);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn missing_dockerfile_fails() {
        let dir = scratch_dir("missing");
        let err = ImageAsset::from_directory(&dir, "Dockerfile.prod", "app").unwrap_err();
        assert!(matches!(err, SynthError::MissingAsset(p) if p.ends_with("Dockerfile.prod")));
        let err = ImageAsset::from_directory(&dir.join("nope"), "Dockerfile", "app").unwrap_err();
        assert!(matches!(err, SynthError::MissingAsset(_)));
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn uri_points_at_the_stack_account_registry() {
        let asset = ImageAsset {
            directory: PathBuf::from("app"),
            dockerfile: "Dockerfile".into(),
            repository: "fargate-rds-app".into(),
            tag: "0badcafe".into(),
        };
        assert_eq!(asset.image_uri(), serde_json::json!({
            "Fn::Sub": "${AWS::AccountId}.dkr.ecr.${AWS::Region}.${AWS::URLSuffix}/fargate-rds-app:0badcafe"
        }));
    }
}
