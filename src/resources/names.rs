//! Deterministic object names
//!
//! Every name is an RFC 1123 label: lowercase alphanumerics and hyphens,
//! at most 63 characters. Longer names keep a readable prefix and end in a
//! short digest of the full name, so distinct inputs stay distinct.

use std::sync::LazyLock;

use regex::Regex;
use sha2::{Digest, Sha256};

/// Maximum length of an RFC 1123 label
pub const MAX_NAME_LEN: usize = 63;

const DIGEST_LEN: usize = 8;

static INVALID_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^a-z0-9-]+").expect("static pattern"));
static REPEATED_HYPHENS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"-{2,}").expect("static pattern"));

/// Lowercase, map `.` and `_` to `-`, drop anything else outside `[a-z0-9-]`
pub fn sanitize(raw: &str) -> String {
    let lowered = raw.to_lowercase().replace(['.', '_', ' '], "-");
    let cleaned = INVALID_CHARS.replace_all(&lowered, "");
    let collapsed = REPEATED_HYPHENS.replace_all(&cleaned, "-");
    collapsed.trim_matches('-').to_string()
}

/// Join sanitized parts with `-` and fit the result into a label
pub fn object_name(parts: &[&str]) -> String {
    let joined = parts
        .iter()
        .map(|p| sanitize(p))
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    fit(&joined)
}

fn fit(name: &str) -> String {
    if name.len() <= MAX_NAME_LEN {
        return name.to_string();
    }
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    let digest = format!("{:x}", hasher.finalize());

    let keep = MAX_NAME_LEN - DIGEST_LEN - 1;
    let prefix = name[..keep].trim_end_matches('-');
    format!("{}-{}", prefix, &digest[..DIGEST_LEN])
}

/// `<product>-<version>`, the prefix of every version-scoped object
pub fn version_prefix(product_id: &str, version_name: &str) -> String {
    object_name(&[product_id, version_name])
}

pub fn pipeline_config_map(product_id: &str, version_name: &str) -> String {
    object_name(&[product_id, version_name, "config"])
}

pub fn conf_files_config_map(product_id: &str, version_name: &str) -> String {
    object_name(&[product_id, version_name, "conf-files"])
}

pub fn node_workload(product_id: &str, version_name: &str, workflow: &str, node: &str) -> String {
    object_name(&[product_id, version_name, workflow, node])
}

pub fn entrypoint_workload(product_id: &str, version_name: &str) -> String {
    object_name(&[product_id, version_name, "entrypoint"])
}

/// Private service of one version's entrypoint
pub fn version_service(product_id: &str, version_name: &str) -> String {
    object_name(&[product_id, version_name, "entrypoint"])
}

/// Stable product-scoped service the ingress targets
pub fn active_service(product_id: &str) -> String {
    object_name(&[product_id, "active-entrypoint"])
}

pub fn ingress(product_id: &str) -> String {
    object_name(&[product_id, "entrypoint-ingress"])
}

/// Key of a node's file inside the conf-files config map
pub fn node_conf_file(workflow: &str, node: &str) -> String {
    format!("{}-{}.yaml", sanitize(workflow), sanitize(node))
}
