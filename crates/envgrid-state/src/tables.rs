//! redb table definitions for the envgrid state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized documents).
//! Environment-scoped keys are `{project}/{name}`; group documents append
//! `#{group_index:04}` so a prefix scan returns them in group order.

use redb::TableDefinition;

/// Environment headers keyed by `{project}/{name}`.
pub const ENVIRONMENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("environments");

/// Service group documents keyed by `{project}/{name}#{group_index:04}`.
pub const SERVICE_GROUPS: TableDefinition<&str, &[u8]> = TableDefinition::new("service_groups");

/// Global variable sets keyed by `{project}/{name}`.
pub const GLOBAL_VARIABLES: TableDefinition<&str, &[u8]> =
    TableDefinition::new("global_variables");

/// Deploy strategy maps keyed by `{project}/{name}`.
pub const DEPLOY_STRATEGIES: TableDefinition<&str, &[u8]> =
    TableDefinition::new("deploy_strategies");

/// Key of the group document at `index` for an environment key.
pub fn group_key(env_key: &str, index: usize) -> String {
    format!("{env_key}#{index:04}")
}

/// Prefix shared by every group document of an environment.
pub fn group_prefix(env_key: &str) -> String {
    format!("{env_key}#")
}

/// Group index encoded in `key` if it is a group document of `env_key`.
///
/// The prefix alone is not enough: `shop/dev#0005#0000` starts with
/// `shop/dev#` but belongs to another environment.
pub fn group_index(env_key: &str, key: &str) -> Option<usize> {
    let suffix = key.strip_prefix(env_key)?.strip_prefix('#')?;
    if suffix.is_empty() || !suffix.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    suffix.parse().ok()
}
