//! 租户命名空间
//!
//! 命名空间只能由 `NamespaceResolver` 创建，持有 `Namespace` 即表示请求已通过鉴权。

use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fmt;

/// DNS-1123 label 最大长度
const MAX_LEN: usize = 63;
/// 哈希后缀长度（十六进制字符）
const SUFFIX_LEN: usize = 12;
/// 不允许租户直接占用的集群命名空间
const RESERVED: &[&str] = &["default", "kube-system", "kube-public", "kube-node-lease"];

/// 租户隔离的集群命名空间
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Namespace(String);

impl Namespace {
    /// 由身份提供方返回的租户 ID 生成命名空间
    ///
    /// 已是合法 label 且不含 `--` 的租户 ID 原样使用；其余的规整后追加
    /// `--<sha256 前缀>`。原样使用的结果永远不含 `--`，两类结果不会相交。
    pub(crate) fn from_tenant(tenant_id: &str) -> Option<Self> {
        let tenant_id = tenant_id.trim();
        if tenant_id.is_empty() {
            return None;
        }

        if is_plain_label(tenant_id) {
            return Some(Self(tenant_id.to_string()));
        }

        let mut base = String::with_capacity(tenant_id.len());
        for c in tenant_id.chars() {
            let c = c.to_ascii_lowercase();
            let c = if c.is_ascii_lowercase() || c.is_ascii_digit() {
                c
            } else {
                '-'
            };
            if c == '-' && base.ends_with('-') {
                continue;
            }
            base.push(c);
        }

        let digest = format!("{:x}", Sha256::digest(tenant_id.as_bytes()));
        let suffix = &digest[..SUFFIX_LEN];
        let base: String = base
            .trim_matches('-')
            .chars()
            .take(MAX_LEN - SUFFIX_LEN - 2)
            .collect();
        let base = base.trim_end_matches('-');

        let label = if base.is_empty() {
            format!("t--{}", suffix)
        } else {
            format!("{}--{}", base, suffix)
        };
        Some(Self(label))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn is_plain_label(s: &str) -> bool {
    s.len() <= MAX_LEN
        && !RESERVED.contains(&s)
        && !s.contains("--")
        && !s.starts_with('-')
        && !s.ends_with('-')
        && s.chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}
