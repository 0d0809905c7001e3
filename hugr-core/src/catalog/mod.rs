//! Catalog model: named collections of SDL documents owned by a data source.
//!
//! Fetching bytes from a store is the runtime's job; this module owns the
//! catalog records, `[$VAR]` environment substitution and SDL parsing.

use apollo_compiler::Schema;
use indexmap::IndexMap;
use serde::Deserialize;
use serde::Serialize;

use crate::error::HugrError;
use crate::error::SingleHugrError;

/// How a catalog's documents are located.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
)]
#[serde(rename_all = "camelCase")]
pub enum CatalogKind {
    #[strum(to_string = "uri")]
    #[serde(rename = "uri")]
    Uri,
    #[strum(to_string = "localFS")]
    #[serde(rename = "localFS")]
    LocalFs,
}

/// A named catalog source record, as stored in the `catalog_sources` system table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogSource {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: CatalogKind,
    #[serde(default)]
    pub description: String,
    pub path: String,
}

/// A single SDL document fetched from a catalog, before assembly.
#[derive(Debug, Clone)]
pub struct CatalogDocument {
    /// Where the document came from, for error reporting.
    pub path: String,
    pub schema: Schema,
}

impl CatalogDocument {
    /// Parses SDL into a schema fragment. The fragment is not validated as a
    /// standalone schema: cross-document references resolve at assembly.
    pub fn parse(source_text: &str, path: &str) -> Result<Self, HugrError> {
        let schema = Schema::builder()
            .adopt_orphan_extensions()
            .parse(source_text, path)
            .build()
            .map_err(|with_errors| {
                let errors: crate::error::MultipleHugrErrors = with_errors
                    .errors
                    .iter()
                    .map(|d| SingleHugrError::CatalogParse {
                        document: path.to_owned(),
                        message: d.to_string(),
                    })
                    .collect();
                HugrError::from(errors)
            })?;
        Ok(Self {
            path: path.to_owned(),
            schema,
        })
    }
}

/// The loaded contents of one catalog: documents keyed by path, in
/// lexicographic order so assembly input is deterministic.
#[derive(Debug, Clone, Default)]
pub struct LoadedCatalog {
    pub source: String,
    pub documents: IndexMap<String, CatalogDocument>,
}

impl LoadedCatalog {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            documents: IndexMap::new(),
        }
    }

    pub fn insert(&mut self, document: CatalogDocument) {
        self.documents.insert(document.path.clone(), document);
        self.documents.sort_keys();
    }
}

/// Substitutes `[$VAR]` templates with environment values supplied by the
/// caller. A missing variable is a configuration error naming the variable.
pub fn substitute_env(
    template: &str,
    referenced_by: &str,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<String, HugrError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("[$") {
        let Some(len) = rest[start..].find(']') else {
            out.push_str(rest);
            rest = "";
            break;
        };
        out.push_str(&rest[..start]);
        let name = &rest[start + 2..start + len];
        match lookup(name) {
            Some(value) => out.push_str(&value),
            None => {
                return Err(SingleHugrError::MissingEnvVariable {
                    name: name.to_owned(),
                    referenced_by: referenced_by.to_owned(),
                }
                .into());
            }
        }
        rest = &rest[start + len + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn env(name: &str) -> Option<String> {
        match name {
            "PG_HOST" => Some("db.internal".to_owned()),
            "PG_PORT" => Some("5432".to_owned()),
            _ => None,
        }
    }

    #[test]
    fn substitutes_multiple_variables() {
        let path = substitute_env("postgres://[$PG_HOST]:[$PG_PORT]/app", "pg", env)
            .expect("substitution should succeed");
        assert_eq!(path, "postgres://db.internal:5432/app");
    }

    #[test]
    fn missing_variable_names_the_variable() {
        let err = substitute_env("postgres://[$PG_PASSWORD]@host/app", "pg", env)
            .expect_err("expected missing variable");
        assert!(err.to_string().contains("PG_PASSWORD"));
    }

    #[test]
    fn text_without_templates_is_untouched(){
        let path = substitute_env("duckdb:///data/core.db", "core", env).expect("no templates");
        assert_eq!(path, "duckdb:///data/core.db");
    }

    #[test]
    fn parse_reports_document_path() {
        let err = CatalogDocument::parse("type Broken {", "crm/broken.graphql")
            .expect_err("expected parse failure");
        assert!(err.to_string().contains("crm/broken.graphql") || !err.errors().is_empty());
    }

    #[test]
    fn parse_accepts_table_definitions() {
        let doc = CatalogDocument::parse(
            r#"
            type orders @table(name: "orders") {
              id: Int! @pk
              total: Float
              status: String
            }
            "#,
            "shop/orders.graphql",
        )
        .expect("document should parse");
        assert!(doc.schema.types.contains_key("orders"));
    }
}
