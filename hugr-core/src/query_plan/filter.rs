//! Lowering of semantic filter values to SQL boolean expressions.
//!
//! Scalar operators become comparisons on parameters; relation filters become
//! EXISTS-style semijoins; `_and`/`_or`/`_not` compose. The same lowering is
//! used for user-supplied filters and for permission overlay filters, so a
//! type's filter applies identically at every occurrence.

use serde_json_bytes::Value;

use crate::error::HugrError;
use crate::error::SingleHugrError;
use crate::permissions::BindContext;
use crate::permissions::PermissionSet;
use crate::permissions::bind_placeholders;
use crate::scalars::GeometryInput;
use crate::scalars::Interval;
use crate::schema::ObjectMeta;
use crate::schema::Relation;
use crate::schema::RelationKind;
use crate::schema::ScalarClass;
use crate::schema::SchemaMetadata;
use crate::sql::BinaryOp;
use crate::sql::SqlExpr;
use crate::sql::SqlFrom;
use crate::sql::SqlSelect;

/// Shared state for filter lowering within one statement.
pub(crate) struct FilterContext<'a> {
    pub metadata: &'a SchemaMetadata,
    pub permissions: &'a PermissionSet,
    pub bind: &'a BindContext<'a>,
    pub role: &'a str,
    pub params: &'a mut Vec<Value>,
    pub alias_counter: &'a mut usize,
}

impl FilterContext<'_> {
    pub(crate) fn next_alias(&mut self) -> String {
        let alias = format!("f{}", self.alias_counter);
        *self.alias_counter += 1;
        alias
    }

    pub(crate) fn push_param(&mut self, value: Value) -> SqlExpr {
        self.params.push(value);
        SqlExpr::Param(self.params.len() - 1)
    }
}

/// The combined row condition for one occurrence of a type: permission
/// overlay filter, user filter and soft-delete, AND-ed.
pub(crate) fn scan_conditions(
    ctx: &mut FilterContext<'_>,
    meta: &ObjectMeta,
    alias: &str,
    user_filter: Option<&Value>,
    with_deleted: bool,
) -> Result<Option<SqlExpr>, HugrError> {
    let mut conditions = Vec::new();
    if let Some(overlay) = ctx.permissions.type_filter(ctx.role, meta.name.as_str()).cloned() {
        let bound = bind_placeholders(&overlay, ctx.bind)?;
        if let Some(expr) = compile_filter(ctx, meta, alias, &bound)? {
            conditions.push(expr);
        }
    }
    if let Some(filter) = user_filter {
        if let Some(expr) = compile_filter(ctx, meta, alias, filter)? {
            conditions.push(expr);
        }
    }
    if !with_deleted {
        if let Some(expr) = soft_delete_condition(meta, alias) {
            conditions.push(expr);
        }
    }
    Ok(SqlExpr::and(conditions))
}

/// Rows with the soft-delete marker set are filtered out by default.
pub(crate) fn soft_delete_condition(meta: &ObjectMeta, alias: &str) -> Option<SqlExpr> {
    let field_name = meta.soft_delete_field.as_ref()?;
    let field = meta.field(field_name.as_str())?;
    let column = SqlExpr::column(alias, field.column.clone());
    Some(match field.scalar {
        Some(ScalarClass::Boolean) => SqlExpr::Not(Box::new(column)),
        _ => SqlExpr::IsNull(Box::new(column)),
    })
}

/// Lowers one filter value against `meta` rows aliased `alias`.
pub(crate) fn compile_filter(
    ctx: &mut FilterContext<'_>,
    meta: &ObjectMeta,
    alias: &str,
    value: &Value,
) -> Result<Option<SqlExpr>, HugrError> {
    let Value::Object(fields) = value else {
        return Err(SingleHugrError::InvalidArgumentValue {
            field: meta.name.to_string(),
            argument: "filter".to_owned(),
            message: "filter must be an object".to_owned(),
        }
        .into());
    };

    let mut conditions = Vec::new();
    for (key, entry) in fields {
        let key = key.as_str();
        match key {
            "_and" | "_or" => {
                let Value::Array(items) = entry else {
                    return Err(wrong_operator(meta, key));
                };
                let mut children = Vec::new();
                for item in items {
                    if let Some(expr) = compile_filter(ctx, meta, alias, item)? {
                        children.push(expr);
                    }
                }
                if children.is_empty() {
                    continue;
                }
                conditions.push(if key == "_and" {
                    SqlExpr::And(children)
                } else {
                    SqlExpr::Or(children)
                });
            }
            "_not" => {
                if let Some(expr) = compile_filter(ctx, meta, alias, entry)? {
                    conditions.push(SqlExpr::Not(Box::new(expr)));
                }
            }
            _ => {
                let Some(field) = meta.field(key) else {
                    return Err(SingleHugrError::InvalidFieldName {
                        type_name: meta.name.to_string(),
                        field_name: key.to_owned(),
                    }
                    .into());
                };
                if let Some(relation) = field.relation.clone() {
                    if let Some(expr) = relation_filter(ctx, meta, alias, &relation, entry)? {
                        conditions.push(expr);
                    }
                } else if let Some(scalar) = field.scalar {
                    let column = SqlExpr::column(alias, field.column.clone());
                    if let Some(expr) = scalar_filter(ctx, meta, scalar, column, entry)? {
                        conditions.push(expr);
                    }
                }
            }
        }
    }
    Ok(SqlExpr::and(conditions))
}

fn scalar_filter(
    ctx: &mut FilterContext<'_>,
    meta: &ObjectMeta,
    scalar: ScalarClass,
    column: SqlExpr,
    value: &Value,
) -> Result<Option<SqlExpr>, HugrError> {
    let Value::Object(operators) = value else {
        return Err(SingleHugrError::InvalidArgumentValue {
            field: meta.name.to_string(),
            argument: "filter".to_owned(),
            message: "scalar filters must be operator objects".to_owned(),
        }
        .into());
    };

    let mut conditions = Vec::new();
    for (op, operand) in operators {
        let op = op.as_str();
        let expr = match op {
            "eq" => match operand {
                Value::Null => SqlExpr::IsNull(Box::new(column.clone())),
                _ => SqlExpr::binary(
                    column.clone(),
                    BinaryOp::Eq,
                    scalar_operand(ctx, scalar, operand)?,
                ),
            },
            "in" => {
                let Value::Array(items) = operand else {
                    return Err(wrong_operator(meta, op));
                };
                let list = items
                    .iter()
                    .map(|item| scalar_operand(ctx, scalar, item))
                    .collect::<Result<Vec<_>, _>>()?;
                SqlExpr::InList {
                    expr: Box::new(column.clone()),
                    list,
                }
            }
            "is_null" => match operand.as_bool() {
                Some(true) => SqlExpr::IsNull(Box::new(column.clone())),
                Some(false) => SqlExpr::IsNotNull(Box::new(column.clone())),
                None => return Err(wrong_operator(meta, op)),
            },
            "gt" | "gte" | "lt" | "lte" => {
                if !(scalar.is_numeric() || scalar.is_temporal() || scalar == ScalarClass::Interval)
                {
                    return Err(wrong_operator(meta, op));
                }
                let op = match op {
                    "gt" => BinaryOp::Gt,
                    "gte" => BinaryOp::Gte,
                    "lt" => BinaryOp::Lt,
                    _ => BinaryOp::Lte,
                };
                SqlExpr::binary(column.clone(), op, scalar_operand(ctx, scalar, operand)?)
            }
            "like" | "ilike" | "regex" if scalar == ScalarClass::String => {
                let op = match op {
                    "like" => BinaryOp::Like,
                    "ilike" => BinaryOp::ILike,
                    _ => BinaryOp::Regex,
                };
                SqlExpr::binary(column.clone(), op, scalar_operand(ctx, scalar, operand)?)
            }
            "has" if scalar == ScalarClass::Json => SqlExpr::func(
                "json_exists",
                vec![column.clone(), scalar_operand(ctx, ScalarClass::String, operand)?],
            ),
            "has_all" if scalar == ScalarClass::Json => {
                let Value::Array(items) = operand else {
                    return Err(wrong_operator(meta, op));
                };
                let mut all = Vec::new();
                for item in items {
                    all.push(SqlExpr::func(
                        "json_exists",
                        vec![
                            column.clone(),
                            scalar_operand(ctx, ScalarClass::String, item)?,
                        ],
                    ));
                }
                match SqlExpr::and(all) {
                    Some(expr) => expr,
                    None => continue,
                }
            }
            "contains" if scalar == ScalarClass::Json => SqlExpr::func(
                "json_contains",
                vec![column.clone(), ctx.push_param(operand.clone())],
            ),
            "intersects" if scalar == ScalarClass::Geometry => SqlExpr::func(
                "ST_Intersects",
                vec![column.clone(), geometry_operand(ctx, operand)?],
            ),
            "contains" if scalar == ScalarClass::Geometry => SqlExpr::func(
                "ST_Contains",
                vec![column.clone(), geometry_operand(ctx, operand)?],
            ),
            "upper" | "lower" if scalar.is_range() => SqlExpr::binary(
                SqlExpr::func(op, vec![column.clone()]),
                BinaryOp::Eq,
                scalar_operand(ctx, range_element_class(scalar), operand)?,
            ),
            "upper_inf" | "lower_inf" | "upper_inclusive" | "lower_inclusive"
                if scalar.is_range() =>
            {
                let func = match op {
                    "upper_inf" => "upper_inf",
                    "lower_inf" => "lower_inf",
                    "upper_inclusive" => "upper_inc",
                    _ => "lower_inc",
                };
                let wanted = operand.as_bool().ok_or_else(|| wrong_operator(meta, op))?;
                let call = SqlExpr::func(func, vec![column.clone()]);
                if wanted {
                    call
                } else {
                    SqlExpr::Not(Box::new(call))
                }
            }
            "intersects" if scalar.is_range() => SqlExpr::binary(
                column.clone(),
                BinaryOp::Overlaps,
                scalar_operand(ctx, scalar, operand)?,
            ),
            "includes" if scalar.is_range() => SqlExpr::binary(
                column.clone(),
                BinaryOp::Contains,
                scalar_operand(ctx, range_element_class(scalar), operand)?,
            ),
            _ => return Err(wrong_operator(meta, op)),
        };
        conditions.push(expr);
    }
    Ok(SqlExpr::and(conditions))
}

/// A relation filter becomes a semijoin: `any_of` is EXISTS, `all_of` is
/// NOT EXISTS over the negated condition, `none_of` is NOT EXISTS. A
/// many-to-one filter is an EXISTS over the single related row.
fn relation_filter(
    ctx: &mut FilterContext<'_>,
    meta: &ObjectMeta,
    alias: &str,
    relation: &Relation,
    value: &Value,
) -> Result<Option<SqlExpr>, HugrError> {
    let target = ctx
        .metadata
        .object(relation.target.as_str())
        .ok_or_else(|| SingleHugrError::TypeNotResolvable {
            type_name: relation.target.to_string(),
            referenced_by: meta.name.to_string(),
        })?
        .clone();

    match relation.kind {
        RelationKind::ManyToOne => {
            let subquery_alias = ctx.next_alias();
            let inner =
                relation_subquery_condition(ctx, meta, alias, &target, &subquery_alias, relation, Some(value))?;
            Ok(Some(SqlExpr::Exists(Box::new(semijoin_select(
                &target,
                &subquery_alias,
                inner,
            )))))
        }
        RelationKind::OneToMany => {
            let Value::Object(quantifiers) = value else {
                return Err(wrong_operator(meta, "list filter"));
            };
            let mut conditions = Vec::new();
            for (quantifier, condition) in quantifiers {
                let subquery_alias = ctx.next_alias();
                match quantifier.as_str() {
                    "any_of" => {
                        let inner = relation_subquery_condition(
                            ctx,
                            meta,
                            alias,
                            &target,
                            &subquery_alias,
                            relation,
                            Some(condition),
                        )?;
                        conditions.push(SqlExpr::Exists(Box::new(semijoin_select(
                            &target,
                            &subquery_alias,
                            inner,
                        ))));
                    }
                    "none_of" => {
                        let inner = relation_subquery_condition(
                            ctx,
                            meta,
                            alias,
                            &target,
                            &subquery_alias,
                            relation,
                            Some(condition),
                        )?;
                        conditions.push(SqlExpr::NotExists(Box::new(semijoin_select(
                            &target,
                            &subquery_alias,
                            inner,
                        ))));
                    }
                    "all_of" => {
                        // No related row may violate the condition.
                        let join = relation_subquery_condition(
                            ctx,
                            meta,
                            alias,
                            &target,
                            &subquery_alias,
                            relation,
                            None,
                        )?;
                        let violated = compile_filter(ctx, &target, &subquery_alias, condition)?
                            .map(|expr| SqlExpr::Not(Box::new(expr)));
                        let inner = SqlExpr::and(join.into_iter().chain(violated));
                        conditions.push(SqlExpr::NotExists(Box::new(semijoin_select(
                            &target,
                            &subquery_alias,
                            inner,
                        ))));
                    }
                    other => {
                        return Err(SingleHugrError::WrongOperator {
                            type_name: target.name.to_string(),
                            operator: other.to_owned(),
                        }
                        .into());
                    }
                }
            }
            Ok(SqlExpr::and(conditions))
        }
    }
}

/// Join condition + target overlay/soft-delete + optional nested condition.
fn relation_subquery_condition(
    ctx: &mut FilterContext<'_>,
    meta: &ObjectMeta,
    alias: &str,
    target: &ObjectMeta,
    subquery_alias: &str,
    relation: &Relation,
    condition: Option<&Value>,
) -> Result<Option<SqlExpr>, HugrError> {
    let mut conditions: Vec<SqlExpr> = join_condition(meta, alias, target, subquery_alias, relation);
    if let Some(expr) = scan_conditions(ctx, target, subquery_alias, condition, false)? {
        conditions.push(expr);
    }
    Ok(SqlExpr::and(conditions))
}

/// Equality conditions pairing the relation's field lists.
pub(crate) fn join_condition(
    meta: &ObjectMeta,
    alias: &str,
    target: &ObjectMeta,
    target_alias: &str,
    relation: &Relation,
) -> Vec<SqlExpr> {
    relation
        .source_fields
        .iter()
        .zip(&relation.target_fields)
        .filter_map(|(source_field, target_field)| {
            let source_column = meta.field(source_field.as_str())?.column.clone();
            let target_column = target.field(target_field.as_str())?.column.clone();
            Some(SqlExpr::binary(
                SqlExpr::column(alias, source_column),
                BinaryOp::Eq,
                SqlExpr::column(target_alias, target_column),
            ))
        })
        .collect()
}

pub(crate) fn semijoin_select(
    target: &ObjectMeta,
    alias: &str,
    condition: Option<SqlExpr>,
) -> SqlSelect {
    SqlSelect {
        projection: vec![("one".to_owned(), SqlExpr::Verbatim("1".to_owned()))],
        from: Some(SqlFrom::Table {
            source: target.source.clone(),
            name: target.sql_name.clone(),
            alias: alias.to_owned(),
        }),
        r#where: condition,
        ..Default::default()
    }
}

fn scalar_operand(
    ctx: &mut FilterContext<'_>,
    scalar: ScalarClass,
    value: &Value,
) -> Result<SqlExpr, HugrError> {
    match scalar {
        ScalarClass::Geometry => geometry_operand(ctx, value),
        ScalarClass::Interval => {
            let Value::String(text) = value else {
                return Err(SingleHugrError::TypeMismatch {
                    expected: "Interval".to_owned(),
                    actual: value.to_string(),
                }
                .into());
            };
            let interval = Interval::parse(text.as_str())?;
            Ok(SqlExpr::Verbatim(interval.to_sql()))
        }
        _ => Ok(ctx.push_param(value.clone())),
    }
}

fn geometry_operand(ctx: &mut FilterContext<'_>, value: &Value) -> Result<SqlExpr, HugrError> {
    let geometry = GeometryInput::from_value(value)?;
    let (constructor, payload) = geometry.to_sql_constructor();
    let param = ctx.push_param(Value::from(payload));
    Ok(SqlExpr::func(constructor, vec![param]))
}

fn range_element_class(scalar: ScalarClass) -> ScalarClass {
    match scalar {
        ScalarClass::IntRange => ScalarClass::Int,
        ScalarClass::BigIntRange => ScalarClass::BigInt,
        ScalarClass::TimestampRange => ScalarClass::Timestamp,
        ScalarClass::DateRange => ScalarClass::Date,
        other => other,
    }
}

fn wrong_operator(meta: &ObjectMeta, op: &str) -> HugrError {
    SingleHugrError::WrongOperator {
        type_name: meta.name.to_string(),
        operator: op.to_owned(),
    }
    .into()
}
