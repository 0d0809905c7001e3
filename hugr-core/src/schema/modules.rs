//! Module namespaces: dotted paths that nest generated query/mutation fields.

use serde::Deserialize;
use serde::Serialize;

/// What a module root type is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum_macros::Display)]
pub enum ModuleRootKind {
    #[strum(to_string = "query")]
    Query,
    #[strum(to_string = "mutation")]
    Mutation,
    #[strum(to_string = "function")]
    Function,
    #[strum(to_string = "function_mutation")]
    MutationFunction,
}

/// An ordered, possibly empty list of module segments. The empty path is the
/// default module whose roots are plain `Query`/`Mutation`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ModulePath {
    segments: Vec<String>,
}

impl ModulePath {
    pub fn root() -> Self {
        Self::default()
    }

    /// Parses a dotted module name such as `crm.billing`.
    pub fn parse(dotted: &str) -> Self {
        if dotted.is_empty() {
            return Self::root();
        }
        Self {
            segments: dotted.split('.').map(str::to_owned).collect(),
        }
    }

    pub fn from_segments(segments: Vec<String>) -> Self {
        Self { segments }
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn parent(&self) -> Option<ModulePath> {
        if self.segments.is_empty() {
            None
        } else {
            Some(Self {
                segments: self.segments[..self.segments.len() - 1].to_vec(),
            })
        }
    }

    pub fn last_segment(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    /// Every prefix of the path from the first segment down to the full path,
    /// shortest first. The root is not included.
    pub fn ancestry(&self) -> impl Iterator<Item = ModulePath> + '_ {
        (1..=self.segments.len()).map(|len| ModulePath {
            segments: self.segments[..len].to_vec(),
        })
    }

    /// The generated root type name for this module: the default module uses
    /// `Query`/`Mutation`/`Function`/`MutationFunction`, a named module `crm`
    /// uses `_module_crm_query` and friends, dots become underscores.
    pub fn root_type_name(&self, kind: ModuleRootKind) -> String {
        if self.segments.is_empty() {
            return match kind {
                ModuleRootKind::Query => "Query".to_owned(),
                ModuleRootKind::Mutation => "Mutation".to_owned(),
                ModuleRootKind::Function => "Function".to_owned(),
                ModuleRootKind::MutationFunction => "MutationFunction".to_owned(),
            };
        }
        format!("_module_{}_{kind}", self.segments.join("_"))
    }
}

impl std::fmt::Display for ModulePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.segments.join("."))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn default_module_uses_bare_roots() {
        assert_eq!(ModulePath::root().root_type_name(ModuleRootKind::Query), "Query");
        assert_eq!(
            ModulePath::root().root_type_name(ModuleRootKind::MutationFunction),
            "MutationFunction"
        );
    }

    #[test]
    fn named_module_type_names() {
        let crm = ModulePath::parse("crm");
        assert_eq!(crm.root_type_name(ModuleRootKind::Query), "_module_crm_query");
        assert_eq!(
            crm.root_type_name(ModuleRootKind::Mutation),
            "_module_crm_mutation"
        );
        assert_eq!(
            crm.root_type_name(ModuleRootKind::Function),
            "_module_crm_function"
        );
        assert_eq!(
            crm.root_type_name(ModuleRootKind::MutationFunction),
            "_module_crm_function_mutation"
        );
    }

    #[test]
    fn dots_become_underscores() {
        let nested = ModulePath::parse("crm.billing");
        assert_eq!(
            nested.root_type_name(ModuleRootKind::Query),
            "_module_crm_billing_query"
        );
        assert_eq!(
            nested.ancestry().collect::<Vec<_>>(),
            vec![ModulePath::parse("crm"), ModulePath::parse("crm.billing")]
        );
    }
}
