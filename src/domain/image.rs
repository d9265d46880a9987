//! 镜像引用 `author/name[:version]`

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{DeployError, DeployResult};

/// 省略版本时使用的默认版本
pub const DEFAULT_VERSION: &str = "latest";

const MAX_TOKEN_LEN: usize = 128;

/// 镜像名称，唯一对应一个注册表条目和一个镜像制品
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageName {
    pub author: String,
    pub name: String,
    pub version: String,
}

impl ImageName {
    /// 校验并创建
    pub fn new(
        author: impl Into<String>,
        name: impl Into<String>,
        version: impl Into<String>,
    ) -> DeployResult<Self> {
        let image = Self {
            author: author.into(),
            name: name.into(),
            version: version.into(),
        };

        if !is_path_token(&image.author) {
            return Err(DeployError::validation(format!(
                "invalid author '{}'",
                image.author
            )));
        }
        if !is_path_token(&image.name) {
            return Err(DeployError::validation(format!(
                "invalid name '{}'",
                image.name
            )));
        }
        if !is_version_token(&image.version) {
            return Err(DeployError::validation(format!(
                "invalid version '{}'",
                image.version
            )));
        }

        Ok(image)
    }

    /// 解析 `<author>/<name>[:<version>]`
    pub fn parse_from(reference: &str) -> DeployResult<Self> {
        let malformed = || {
            DeployError::validation(format!(
                "invalid image reference '{}', expected <author>/<name>[:<version>]",
                reference
            ))
        };

        let (author, rest) = reference.trim().split_once('/').ok_or_else(malformed)?;
        if rest.contains('/') {
            return Err(malformed());
        }

        let (name, version) = match rest.split_once(':') {
            Some((name, version)) => (name, version),
            None => (rest, DEFAULT_VERSION),
        };

        Self::new(author, name, version).map_err(|_| malformed())
    }

    /// 镜像仓库路径（不含 tag）
    pub fn repository(&self, image_registry: &str) -> String {
        format!(
            "{}/{}/{}",
            image_registry.trim_end_matches('/'),
            self.author,
            self.name
        )
    }

    /// 完整的镜像制品地址
    pub fn artifact(&self, image_registry: &str) -> String {
        format!("{}:{}", self.repository(image_registry), self.version)
    }
}

impl fmt::Display for ImageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.author, self.name, self.version)
    }
}

impl FromStr for ImageName {
    type Err = DeployError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_from(s)
    }
}

/// 作者、名称：小写字母数字开头，可含 `.`、`_`、`-`
pub(crate) fn is_path_token(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() || c.is_ascii_digit() => {}
        _ => return false,
    }
    s.len() <= MAX_TOKEN_LEN
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-'))
}

/// 版本：遵循镜像 tag 的字符集
pub(crate) fn is_version_token(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphanumeric() => {}
        _ => return false,
    }
    s.len() <= MAX_TOKEN_LEN
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_reference() {
        let image = ImageName::parse_from("alice/hello:1.0").unwrap();
        assert_eq!(
            image,
            ImageName {
                author: "alice".into(),
                name: "hello".into(),
                version: "1.0".into(),
            }
        );
        assert_eq!(image.to_string(), "alice/hello:1.0");
    }

    #[test]
    fn test_parse_default_version() {
        let image: ImageName = "alice/hello".parse().unwrap();
        assert_eq!(image.version, DEFAULT_VERSION);
    }

    #[test]
    fn test_parse_malformed() {
        for bad in [
            "bad",
            "",
            "alice/",
            "/hello",
            "alice/hello:",
            "a/b/c",
            "Alice/hello",
            "alice/hel lo",
            "alice/hello:1.0:2",
            "../hello:1",
        ] {
            let err = ImageName::parse_from(bad).unwrap_err();
            assert!(
                matches!(err, DeployError::Validation(_)),
                "expected validation error for {:?}",
                bad
            );
        }
    }

    #[test]
    fn test_artifact_reference() {
        let image = ImageName::parse_from("alice/hello:1.0").unwrap();
        assert_eq!(
            image.artifact("registry.example.com/apis/"),
            "registry.example.com/apis/alice/hello:1.0"
        );
        assert_eq!(
            image.repository("registry.example.com/apis"),
            "registry.example.com/apis/alice/hello"
        );
    }
}
