//! The directives Hugr understands in catalog SDL.
//!
//! Dynamic dispatch over directive names is replaced by a tagged enumeration
//! with per-variant validation; anything unknown is rejected at assembly.

use std::ops::Deref;

use apollo_compiler::Name;
use apollo_compiler::Node;
use apollo_compiler::ast::Value;
use apollo_compiler::name;
use apollo_compiler::schema::Directive;

use crate::error::HugrError;
use crate::error::SingleHugrError;

/// A validated directive application from catalog SDL.
#[derive(Debug, Clone, PartialEq)]
pub enum KnownDirective {
    /// `@table(name: "orders")` — the type is a mutable table.
    Table { name: Option<String> },
    /// `@view(name: "daily_sales")` — the type is a read-only view.
    View { name: Option<String> },
    /// `@cube` — `@measurement` fields aggregate, other fields become dimensions.
    Cube,
    /// `@module(name: "crm.billing")` — dotted module namespace.
    Module { name: String },
    /// `@dependency(name: "shop")` — this source references types of another source.
    Dependency { name: String },
    /// `@pk` — field is part of the declared primary key.
    Pk,
    /// `@unique(fields: [...], suffix: "email")` — unique key, emits `_by_<suffix>`.
    Unique {
        fields: Vec<String>,
        suffix: Option<String>,
    },
    /// `@references(...)` — declared relation over field equality.
    References {
        /// Relation field name installed on this type (many-to-one side).
        name: String,
        to: String,
        source_fields: Vec<String>,
        target_fields: Vec<String>,
        /// Back-relation field installed on the target type (one-to-many side).
        back_name: Option<String>,
    },
    /// `@join(fields: [...], references: [...])` — extension field joining
    /// into another source's type.
    Join {
        fields: Vec<String>,
        references: Vec<String>,
        inner: bool,
    },
    /// `@function_call(name: "schema.fn")` — field resolves through a function.
    FunctionCall { name: String, is_table: bool },
    /// `@table_function_call_join(name, args: {...})` — joins a table function
    /// against the enclosing type.
    TableFunctionCallJoin {
        name: String,
        args: Vec<(String, String)>,
    },
    /// `@measurement(func: "sum")` — cube measurement.
    Measurement { func: String },
    /// `@soft_delete(field: "deleted_at")` — rows with the field set are
    /// filtered out unless the query opts in.
    SoftDelete { field: String },
    /// `@hypertable(time_key: "created_at")` — range-partitioned time series.
    Hypertable { time_key: String },
    /// `@field_source(name: "order_total")` — column name differs from the field.
    FieldSource { name: String },
}

impl KnownDirective {
    /// Parses and validates one directive application. `location` is the
    /// schema coordinate used in error messages.
    pub fn parse(application: &Node<Directive>, location: &str) -> Result<Self, HugrError> {
        let directive = match application.name.as_str() {
            "table" => Self::Table {
                name: optional_string_argument(application, &name!("name"))?
                    .map(str::to_owned),
            },
            "view" => Self::View {
                name: optional_string_argument(application, &name!("name"))?
                    .map(str::to_owned),
            },
            "cube" => Self::Cube,
            "module" => Self::Module {
                name: required_string_argument(application, &name!("name"))?.to_owned(),
            },
            "dependency" => Self::Dependency {
                name: required_string_argument(application, &name!("name"))?.to_owned(),
            },
            "pk" => Self::Pk,
            "unique" => Self::Unique {
                fields: optional_string_list_argument(application, &name!("fields"))?
                    .unwrap_or_default(),
                suffix: optional_string_argument(application, &name!("suffix"))?
                    .map(str::to_owned),
            },
            "references" => Self::References {
                name: required_string_argument(application, &name!("name"))?.to_owned(),
                to: required_string_argument(application, &name!("to"))?.to_owned(),
                source_fields: required_string_list_argument(
                    application,
                    &name!("source_fields"),
                )?,
                target_fields: required_string_list_argument(
                    application,
                    &name!("target_fields"),
                )?,
                back_name: optional_string_argument(application, &name!("back_name"))?
                    .map(str::to_owned),
            },
            "join" => Self::Join {
                fields: required_string_list_argument(application, &name!("fields"))?,
                references: required_string_list_argument(application, &name!("references"))?,
                inner: optional_boolean_argument(application, &name!("inner"))?.unwrap_or(false),
            },
            "function_call" => Self::FunctionCall {
                name: required_string_argument(application, &name!("name"))?.to_owned(),
                is_table: optional_boolean_argument(application, &name!("is_table"))?
                    .unwrap_or(false),
            },
            "table_function_call_join" => Self::TableFunctionCallJoin {
                name: required_string_argument(application, &name!("name"))?.to_owned(),
                args: object_argument(application, &name!("args"))?,
            },
            "measurement" => Self::Measurement {
                func: required_string_argument(application, &name!("func"))?.to_owned(),
            },
            "soft_delete" => Self::SoftDelete {
                field: required_string_argument(application, &name!("field"))?.to_owned(),
            },
            "hypertable" => Self::Hypertable {
                time_key: required_string_argument(application, &name!("time_key"))?.to_owned(),
            },
            "field_source" => Self::FieldSource {
                name: required_string_argument(application, &name!("name"))?.to_owned(),
            },
            other => {
                return Err(SingleHugrError::UnsupportedDirective {
                    directive: other.to_owned(),
                    location: location.to_owned(),
                }
                .into());
            }
        };
        Ok(directive)
    }

    /// Parses every directive on a definition, rejecting unknown ones.
    pub fn parse_all(
        applications: &[Node<Directive>],
        location: &str,
    ) -> Result<Vec<Self>, HugrError> {
        applications
            .iter()
            .map(|application| Self::parse(application, location))
            .collect()
    }
}

fn argument_error(application: &Node<Directive>, name: &Name, expected: &str) -> HugrError {
    SingleHugrError::InvalidConfiguration {
        message: format!(
            "argument \"{}\" of directive \"@{}\" must be {expected}",
            name, application.name
        ),
    }
    .into()
}

fn optional_string_argument<'doc>(
    application: &'doc Node<Directive>,
    name: &Name,
) -> Result<Option<&'doc str>, HugrError> {
    match application.specified_argument_by_name(name) {
        Some(value) => match value.deref() {
            Value::String(value) => Ok(Some(value)),
            Value::Null => Ok(None),
            _ => Err(argument_error(application, name, "a string")),
        },
        None => Ok(None),
    }
}

fn required_string_argument<'doc>(
    application: &'doc Node<Directive>,
    name: &Name,
) -> Result<&'doc str, HugrError> {
    optional_string_argument(application, name)?
        .ok_or_else(|| argument_error(application, name, "present"))
}

fn optional_boolean_argument(
    application: &Node<Directive>,
    name: &Name,
) -> Result<Option<bool>, HugrError> {
    match application.specified_argument_by_name(name) {
        Some(value) => match value.deref() {
            Value::Boolean(value) => Ok(Some(*value)),
            Value::Null => Ok(None),
            _ => Err(argument_error(application, name, "a boolean")),
        },
        None => Ok(None),
    }
}

fn optional_string_list_argument(
    application: &Node<Directive>,
    name: &Name,
) -> Result<Option<Vec<String>>, HugrError> {
    match application.specified_argument_by_name(name) {
        Some(value) => match value.deref() {
            Value::List(values) => values
                .iter()
                .map(|value| match value.deref() {
                    Value::String(value) => Ok(value.clone()),
                    _ => Err(argument_error(application, name, "a list of strings")),
                })
                .collect::<Result<Vec<_>, _>>()
                .map(Some),
            Value::Null => Ok(None),
            _ => Err(argument_error(application, name, "a list of strings")),
        },
        None => Ok(None),
    }
}

fn required_string_list_argument(
    application: &Node<Directive>,
    name: &Name,
) -> Result<Vec<String>, HugrError> {
    optional_string_list_argument(application, name)?
        .ok_or_else(|| argument_error(application, name, "present"))
}

/// An input-object argument flattened into `(key, string value)` pairs, in
/// declaration order.
fn object_argument(
    application: &Node<Directive>,
    name: &Name,
) -> Result<Vec<(String, String)>, HugrError> {
    match application.specified_argument_by_name(name) {
        Some(value) => match value.deref() {
            Value::Object(fields) => fields
                .iter()
                .map(|(key, value)| match value.deref() {
                    Value::String(value) => Ok((key.to_string(), value.clone())),
                    _ => Err(argument_error(application, name, "an object of strings")),
                })
                .collect(),
            _ => Err(argument_error(application, name, "an object of strings")),
        },
        None => Ok(Vec::new()),
    }
}

#[cfg(test)]
mod tests {
    use apollo_compiler::Schema;

    use super::*;

    fn first_type_directives(sdl: &str, type_name: &str) -> Vec<Node<Directive>> {
        let schema = Schema::builder()
            .adopt_orphan_extensions()
            .parse(sdl, "test.graphql")
            .build()
            .expect("sdl should parse");
        schema.types[type_name]
            .directives()
            .iter()
            .map(|component| component.node.clone())
            .collect()
    }

    #[test]
    fn parses_table_module_and_soft_delete() {
        let directives = first_type_directives(
            r#"type orders @table(name: "orders") @module(name: "shop.sales") @soft_delete(field: "deleted_at") { id: Int! }"#,
            "orders",
        );
        let parsed = KnownDirective::parse_all(&directives, "orders").expect("should parse");
        assert_eq!(
            parsed,
            vec![
                KnownDirective::Table {
                    name: Some("orders".to_owned())
                },
                KnownDirective::Module {
                    name: "shop.sales".to_owned()
                },
                KnownDirective::SoftDelete {
                    field: "deleted_at".to_owned()
                },
            ]
        );
    }

    #[test]
    fn unknown_directive_is_rejected() {
        let directives =
            first_type_directives(r#"type t @sharded(by: "id") { id: Int! }"#, "t");
        let err = KnownDirective::parse_all(&directives, "t").expect_err("should reject");
        assert!(err.to_string().contains("sharded"));
    }

    #[test]
    fn references_requires_field_lists() {
        let directives = first_type_directives(
            r#"type orders @references(name: "customer", to: "customers") { id: Int! }"#,
            "orders",
        );
        assert!(KnownDirective::parse_all(&directives, "orders").is_err());
    }
}
