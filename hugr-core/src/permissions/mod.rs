//! Role-based permissions: visibility, row filters and mutation defaults.
//!
//! The overlay is consulted during compilation, not as a separate rewrite
//! pass: every occurrence of a type — root fields, nested relations,
//! aggregation subqueries — picks up the same filter, and mutation inputs
//! merge the role's defaults before lowering.

use indexmap::IndexMap;
use serde::Deserialize;
use serde::Serialize;
use serde_json_bytes::Value;

use crate::error::HugrError;
use crate::error::SingleHugrError;

/// The wildcard matching any type or field name in a permission row.
pub const WILDCARD: &str = "*";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub disabled: bool,
}

/// One `role_permissions` row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Permission {
    pub role: String,
    pub type_name: String,
    pub field_name: String,
    #[serde(default)]
    pub hidden: bool,
    #[serde(default)]
    pub disabled: bool,
    /// Semantic filter value matching the type's filter input.
    #[serde(default)]
    pub filter: Option<Value>,
    /// Semantic default value matching the mutation input.
    #[serde(default)]
    pub data: Option<Value>,
}

impl Permission {
    /// Specificity rank: exact/exact > exact/* > */exact > */*.
    fn specificity(&self) -> u8 {
        let type_exact = self.type_name != WILDCARD;
        let field_exact = self.field_name != WILDCARD;
        match (type_exact, field_exact) {
            (true, true) => 3,
            (true, false) => 2,
            (false, true) => 1,
            (false, false) => 0,
        }
    }

    fn matches(&self, role: &str, type_name: &str, field_name: &str) -> bool {
        self.role == role
            && (self.type_name == WILDCARD || self.type_name == type_name)
            && (self.field_name == WILDCARD || self.field_name == field_name)
    }
}

/// Per-field access decision after overlay resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldAccess {
    Allowed,
    /// Elided from wildcard selections; an explicit selection still fails.
    Hidden,
    Denied,
}

/// An immutable set of roles and permissions with a monotonically increasing
/// version, folded into cache fingerprints.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PermissionSet {
    version: u64,
    roles: IndexMap<String, Role>,
    permissions: Vec<Permission>,
}

impl PermissionSet {
    pub fn new(
        version: u64,
        roles: impl IntoIterator<Item = Role>,
        permissions: impl IntoIterator<Item = Permission>,
    ) -> Self {
        Self {
            version,
            roles: roles.into_iter().map(|r| (r.name.clone(), r)).collect(),
            permissions: permissions.into_iter().collect(),
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn role(&self, name: &str) -> Option<&Role> {
        self.roles.get(name)
    }

    /// The most specific permission for `(role, type, field)`; `None` when no
    /// row matches. Equally specific rows resolve to the first declared.
    pub fn lookup(&self, role: &str, type_name: &str, field_name: &str) -> Option<&Permission> {
        self.permissions
            .iter()
            .filter(|p| p.matches(role, type_name, field_name))
            .max_by_key(|p| p.specificity())
    }

    pub fn field_access(&self, role: &str, type_name: &str, field_name: &str) -> FieldAccess {
        if self.roles.get(role).is_some_and(|r| r.disabled) {
            return FieldAccess::Denied;
        }
        match self.lookup(role, type_name, field_name) {
            Some(permission) if permission.disabled => FieldAccess::Denied,
            Some(permission) if permission.hidden => FieldAccess::Hidden,
            _ => FieldAccess::Allowed,
        }
    }

    /// The row filter a role carries for a type, if any. Applied at every
    /// occurrence of the type in an operation.
    pub fn type_filter(&self, role: &str, type_name: &str) -> Option<&Value> {
        self.lookup(role, type_name, WILDCARD)
            .and_then(|p| p.filter.as_ref())
    }

    /// Default values merged into insert/update inputs for a role.
    pub fn data_defaults(&self, role: &str, type_name: &str) -> Option<&Value> {
        self.lookup(role, type_name, WILDCARD)
            .and_then(|p| p.data.as_ref())
    }
}

/// Per-request authentication context.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthContext {
    pub user_id: Option<String>,
    pub user_name: Option<String>,
    pub role: String,
    pub auth_type: Option<String>,
    pub provider: Option<String>,
    #[serde(default)]
    pub claims: IndexMap<String, Value>,
}

impl AuthContext {
    pub fn anonymous(role: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            ..Self::default()
        }
    }

    /// Resolves a claim name, built-ins first.
    pub fn claim(&self, name: &str) -> Option<Value> {
        match name {
            "user_id" => self.user_id.clone().map(Value::from),
            "user_name" => self.user_name.clone().map(Value::from),
            "role" => Some(Value::from(self.role.clone())),
            "auth_type" => self.auth_type.clone().map(Value::from),
            "provider" => self.provider.clone().map(Value::from),
            other => self.claims.get(other).cloned(),
        }
    }

    /// Whether binding this context makes responses user-specific; folded into
    /// the cache fingerprint when true.
    pub fn is_user_scoped(&self) -> bool {
        self.user_id.is_some()
    }
}

/// Context for `[$auth.<claim>]` / `[$catalog]` substitution.
#[derive(Debug, Clone)]
pub struct BindContext<'a> {
    pub auth: &'a AuthContext,
    pub catalog: Option<&'a str>,
}

const AUTH_PREFIX: &str = "[$auth.";
const CATALOG_PLACEHOLDER: &str = "[$catalog]";

/// Substitutes permission placeholders with typed values.
///
/// A string that consists of exactly one placeholder is replaced by the
/// claim's typed value (a numeric claim stays numeric); placeholders inside a
/// longer string substitute textually. A missing claim fails the bind.
pub fn bind_placeholders(value: &Value, ctx: &BindContext<'_>) -> Result<Value, HugrError> {
    match value {
        Value::String(s) => bind_string(s.as_str(), ctx),
        Value::Array(items) => items
            .iter()
            .map(|item| bind_placeholders(item, ctx))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(fields) => {
            let mut out = serde_json_bytes::Map::new();
            for (key, item) in fields {
                out.insert(key.clone(), bind_placeholders(item, ctx)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

fn bind_string(s: &str, ctx: &BindContext<'_>) -> Result<Value, HugrError> {
    if let Some(claim) = s
        .strip_prefix(AUTH_PREFIX)
        .and_then(|rest| rest.strip_suffix(']'))
    {
        if !claim.contains('[') {
            return ctx.auth.claim(claim).ok_or_else(|| {
                SingleHugrError::PermissionBind {
                    placeholder: s.to_owned(),
                    message: format!("claim \"{claim}\" is not present in the auth context"),
                }
                .into()
            });
        }
    }
    if s == CATALOG_PLACEHOLDER {
        return match ctx.catalog {
            Some(catalog) => Ok(Value::from(catalog.to_owned())),
            None => Err(SingleHugrError::PermissionBind {
                placeholder: s.to_owned(),
                message: "no catalog in scope".to_owned(),
            }
            .into()),
        };
    }
    if !s.contains(AUTH_PREFIX) && !s.contains(CATALOG_PLACEHOLDER) {
        return Ok(Value::from(s.to_owned()));
    }
    // Placeholders embedded in a longer string substitute textually.
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(start) = rest.find("[$") {
        let Some(len) = rest[start..].find(']') else {
            break;
        };
        out.push_str(&rest[..start]);
        let placeholder = &rest[start..=start + len];
        let bound = bind_string(placeholder, ctx)?;
        match bound {
            Value::String(value) => out.push_str(value.as_str()),
            other => out.push_str(&other.to_string()),
        }
        rest = &rest[start + len + 1..];
    }
    out.push_str(rest);
    Ok(Value::from(out))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json_bytes::json;

    use super::*;

    fn tenant_permissions() -> PermissionSet {
        PermissionSet::new(
            7,
            [Role {
                name: "tenant_user".to_owned(),
                description: String::new(),
                disabled: false,
            }],
            [
                Permission {
                    role: "tenant_user".to_owned(),
                    type_name: "customers".to_owned(),
                    field_name: WILDCARD.to_owned(),
                    hidden: false,
                    disabled: false,
                    filter: Some(json!({"tenant_id": {"eq": "[$auth.tenant_id]"}})),
                    data: None,
                },
                Permission {
                    role: "tenant_user".to_owned(),
                    type_name: "customers".to_owned(),
                    field_name: "internal_notes".to_owned(),
                    hidden: true,
                    disabled: false,
                    filter: None,
                    data: None,
                },
                Permission {
                    role: "tenant_user".to_owned(),
                    type_name: WILDCARD.to_owned(),
                    field_name: WILDCARD.to_owned(),
                    hidden: false,
                    disabled: true,
                    filter: None,
                    data: None,
                },
            ],
        )
    }

    #[test]
    fn most_specific_permission_wins() {
        let set = tenant_permissions();
        // The wildcard row disables everything the specific rows do not allow.
        assert_eq!(
            set.field_access("tenant_user", "orders", "id"),
            FieldAccess::Denied
        );
        // The type-level row overrides the wildcard.
        assert_eq!(
            set.field_access("tenant_user", "customers", "id"),
            FieldAccess::Allowed
        );
        // The field-level row overrides the type-level row.
        assert_eq!(
            set.field_access("tenant_user", "customers", "internal_notes"),
            FieldAccess::Hidden
        );
    }

    #[test]
    fn disabled_role_denies_everything() {
        let set = PermissionSet::new(
            1,
            [Role {
                name: "blocked".to_owned(),
                description: String::new(),
                disabled: true,
            }],
            [],
        );
        assert_eq!(
            set.field_access("blocked", "customers", "id"),
            FieldAccess::Denied
        );
    }

    #[test]
    fn binds_typed_claims() {
        let mut auth = AuthContext::anonymous("tenant_user");
        auth.claims.insert("tenant_id".to_owned(), json!(42));
        let ctx = BindContext {
            auth: &auth,
            catalog: None,
        };
        let set = tenant_permissions();
        let filter = set.type_filter("tenant_user", "customers").expect("filter");
        let bound = bind_placeholders(filter, &ctx).expect("bind should succeed");
        assert_eq!(bound, json!({"tenant_id": {"eq": 42}}));
    }

    #[test]
    fn missing_claim_fails_bind() {
        let auth = AuthContext::anonymous("tenant_user");
        let ctx = BindContext {
            auth: &auth,
            catalog: None,
        };
        let set = tenant_permissions();
        let filter = set.type_filter("tenant_user", "customers").expect("filter");
        let err = bind_placeholders(filter, &ctx).expect_err("bind should fail");
        assert!(err.to_string().contains("tenant_id"));
    }

    #[test]
    fn embedded_placeholder_substitutes_textually() {
        let mut auth = AuthContext::anonymous("user");
        auth.user_id = Some("9".to_owned());
        let ctx = BindContext {
            auth: &auth,
            catalog: Some("shop"),
        };
        let bound = bind_placeholders(
            &json!("owner-[$auth.user_id]-in-[$catalog]"),
            &ctx,
        )
        .expect("bind should succeed");
        assert_eq!(bound, json!("owner-9-in-shop"));
    }
}
