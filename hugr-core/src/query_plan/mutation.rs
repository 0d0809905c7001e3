//! Mutation compilation: inserts with RETURNING, filtered updates and
//! deletes with affected-row counts, and role default merging.

use apollo_compiler::executable::Field;
use indexmap::IndexMap;
use serde_json_bytes::Value;

use crate::error::HugrError;
use crate::error::SingleHugrError;
use crate::permissions::bind_placeholders;
use crate::query_plan::ObjectShape;
use crate::query_plan::PlanNode;
use crate::query_plan::RootPlan;
use crate::query_plan::ScanNode;
use crate::query_plan::ShapeNode;
use crate::query_plan::compile::RootRun;
use crate::query_plan::compile::flatten_selections;
use crate::query_plan::filter;
use crate::scalars::GeometryInput;
use crate::scalars::Interval;
use crate::schema::ObjectMeta;
use crate::schema::RootFieldMeta;
use crate::schema::ScalarClass;
use crate::sql::JoinKind;
use crate::sql::MUTATION_CTE;
use crate::sql::SqlExpr;
use crate::sql::SqlFrom;
use crate::sql::SqlJoin;
use crate::sql::SqlSelect;
use crate::sql::SqlStatement;

pub(crate) fn compile_insert(
    run: &mut RootRun<'_>,
    root: &RootFieldMeta,
    field: &Field,
    path: Vec<String>,
    depth: usize,
) -> Result<RootPlan, HugrError> {
    let meta = mutable_meta(run, root, "insert")?;
    run.touch(&meta);

    let data = run
        .argument_value(field, "data")?
        .ok_or_else(|| SingleHugrError::InvalidArgumentValue {
            field: field.name.to_string(),
            argument: "data".to_owned(),
            message: "insert data is required".to_owned(),
        })?;
    let merged = merge_defaults(run, &meta, &data)?;

    let mut columns = Vec::new();
    let mut values = Vec::new();
    for (key, value) in &merged {
        let column_meta = meta
            .field(key)
            .filter(|f| f.is_scalar())
            .ok_or_else(|| SingleHugrError::InvalidFieldName {
                type_name: meta.name.to_string(),
                field_name: key.clone(),
            })?;
        columns.push(column_meta.column.clone());
        values.push(scalar_value_expr(run, column_meta.scalar, value)?);
    }

    // RETURNING every scalar column so the selection can be shaped from the CTE.
    let returning: Vec<String> = meta
        .fields
        .values()
        .filter(|f| f.is_scalar())
        .map(|f| f.column.clone())
        .collect();

    let mut select = SqlSelect {
        from: Some(SqlFrom::Table {
            source: String::new(),
            name: MUTATION_CTE.to_owned(),
            alias: MUTATION_CTE.to_owned(),
        }),
        ..Default::default()
    };
    let mut plan: PlanNode = scan_of(&meta).into();
    let shape = run.project_object(
        &meta,
        MUTATION_CTE,
        &field.selection_set,
        &mut select,
        &mut plan,
        depth + 1,
        false,
    )?;

    Ok(RootPlan {
        response_key: field.response_key().to_string(),
        path,
        plan,
        statement: SqlStatement::Insert {
            source: meta.source.clone(),
            table: meta.sql_name.clone(),
            columns,
            values,
            returning,
            select,
        },
        params: std::mem::take(&mut run.params),
        shape: ShapeNode::Object(shape),
        tags: std::mem::take(&mut run.tags),
    })
}

pub(crate) fn compile_update(
    run: &mut RootRun<'_>,
    root: &RootFieldMeta,
    field: &Field,
    path: Vec<String>,
    depth: usize,
) -> Result<RootPlan, HugrError> {
    let meta = mutable_meta(run, root, "update")?;
    run.touch(&meta);

    let data = run
        .argument_value(field, "data")?
        .ok_or_else(|| SingleHugrError::InvalidArgumentValue {
            field: field.name.to_string(),
            argument: "data".to_owned(),
            message: "update data is required".to_owned(),
        })?;
    let merged = merge_defaults(run, &meta, &data)?;
    let mut assignments = Vec::new();
    for (key, value) in &merged {
        let column_meta = meta
            .field(key)
            .filter(|f| f.is_scalar())
            .ok_or_else(|| SingleHugrError::InvalidFieldName {
                type_name: meta.name.to_string(),
                field_name: key.clone(),
            })?;
        assignments.push((
            column_meta.column.clone(),
            scalar_value_expr(run, column_meta.scalar, value)?,
        ));
    }

    let condition = mutation_condition(run, &meta, field)?;
    let (select, shape) = mutation_result_select(run, &meta, field, depth)?;

    Ok(RootPlan {
        response_key: field.response_key().to_string(),
        path,
        plan: scan_of(&meta).into(),
        statement: SqlStatement::Update {
            source: meta.source.clone(),
            table: meta.sql_name.clone(),
            assignments,
            r#where: condition,
            returning: scalar_columns(&meta),
            select,
        },
        params: std::mem::take(&mut run.params),
        shape,
        tags: std::mem::take(&mut run.tags),
    })
}

pub(crate) fn compile_delete(
    run: &mut RootRun<'_>,
    root: &RootFieldMeta,
    field: &Field,
    path: Vec<String>,
    depth: usize,
) -> Result<RootPlan, HugrError> {
    let meta = mutable_meta(run, root, "delete")?;
    run.touch(&meta);

    let condition = mutation_condition(run, &meta, field)?;
    let (select, shape) = mutation_result_select(run, &meta, field, depth)?;

    Ok(RootPlan {
        response_key: field.response_key().to_string(),
        path,
        plan: scan_of(&meta).into(),
        statement: SqlStatement::Delete {
            source: meta.source.clone(),
            table: meta.sql_name.clone(),
            r#where: condition,
            returning: scalar_columns(&meta),
            select,
        },
        params: std::mem::take(&mut run.params),
        shape,
        tags: std::mem::take(&mut run.tags),
    })
}

fn mutable_meta(
    run: &RootRun<'_>,
    root: &RootFieldMeta,
    operation: &str,
) -> Result<ObjectMeta, HugrError> {
    let meta = run.object_meta(root.object.as_ref().ok_or_else(|| {
        crate::internal_error!("mutation root without a backing object")
    })?)?;
    if !meta.kind.is_mutable() {
        return Err(SingleHugrError::UnsupportedOnView {
            type_name: meta.name.to_string(),
            operation: operation.to_owned(),
        }
        .into());
    }
    Ok(meta)
}

/// The combined overlay + user condition, compiled against the bare table
/// (UPDATE/DELETE cannot alias their target).
fn mutation_condition(
    run: &mut RootRun<'_>,
    meta: &ObjectMeta,
    field: &Field,
) -> Result<Option<SqlExpr>, HugrError> {
    let user_filter = run.argument_value(field, "filter")?;
    let meta_for_filter = meta.clone();
    let table_alias = meta.sql_name.clone();
    run.with_filter_ctx(|ctx| {
        filter::scan_conditions(ctx, &meta_for_filter, &table_alias, user_filter.as_ref(), false)
    })
}

/// Role `data` defaults merged into the user payload. A user-supplied field
/// that the role also pins is a conflict, not an override.
fn merge_defaults(
    run: &mut RootRun<'_>,
    meta: &ObjectMeta,
    data: &Value,
) -> Result<IndexMap<String, Value>, HugrError> {
    let Value::Object(user_fields) = data else {
        return Err(SingleHugrError::InvalidArgumentValue {
            field: meta.name.to_string(),
            argument: "data".to_owned(),
            message: "mutation data must be an object".to_owned(),
        }
        .into());
    };
    let mut merged: IndexMap<String, Value> = user_fields
        .iter()
        .map(|(k, v)| (k.as_str().to_owned(), v.clone()))
        .collect();

    if let Some(defaults) = run
        .permissions
        .data_defaults(&run.auth.role, meta.name.as_str())
        .cloned()
    {
        let bound = bind_placeholders(&defaults, &run.bind_context())?;
        let Value::Object(default_fields) = bound else {
            return Err(crate::internal_error!(
                "role defaults for \"{}\" are not an object",
                meta.name
            ));
        };
        for (key, value) in default_fields {
            let key = key.as_str().to_owned();
            if merged.contains_key(&key) {
                return Err(SingleHugrError::PermissionConflict {
                    type_name: meta.name.to_string(),
                    field_name: key,
                }
                .into());
            }
            merged.insert(key, value);
        }
    }
    Ok(merged)
}

/// `{ affected_rows, returning }`: an always-present count row left-joined to
/// the RETURNING rows, so zero affected rows still shape a result.
fn mutation_result_select(
    run: &mut RootRun<'_>,
    meta: &ObjectMeta,
    field: &Field,
    depth: usize,
) -> Result<(SqlSelect, ShapeNode), HugrError> {
    let count_alias = "_m".to_owned();
    let count_select = SqlSelect {
        projection: vec![("_count".to_owned(), SqlExpr::CountStar)],
        from: Some(SqlFrom::Table {
            source: String::new(),
            name: MUTATION_CTE.to_owned(),
            alias: "_c".to_owned(),
        }),
        ..Default::default()
    };
    let mut select = SqlSelect {
        from: Some(SqlFrom::Subquery {
            select: Box::new(count_select),
            alias: count_alias.clone(),
        }),
        ..Default::default()
    };

    let mut fields: IndexMap<String, ShapeNode> = IndexMap::new();
    let mut joined_returning = false;
    for (result_field, via_fragment) in flatten_selections(run.document, &field.selection_set)? {
        match result_field.name.as_str() {
            "__typename" => continue,
            "affected_rows" => {
                let handle = run.next_handle();
                select
                    .projection
                    .push((handle.clone(), SqlExpr::column(&count_alias, "_count")));
                fields.insert(
                    result_field.response_key().to_string(),
                    ShapeNode::Scalar { handle },
                );
            }
            "returning" => {
                if !run.check_field_access(
                    meta.name.as_str(),
                    "returning",
                    via_fragment,
                )? {
                    continue;
                }
                if !joined_returning {
                    select.joins.push(SqlJoin {
                        kind: JoinKind::Left,
                        from: SqlFrom::Table {
                            source: String::new(),
                            name: MUTATION_CTE.to_owned(),
                            alias: MUTATION_CTE.to_owned(),
                        },
                        on: SqlExpr::Verbatim("TRUE".to_owned()),
                    });
                    joined_returning = true;
                }
                let mut plan: PlanNode = scan_of(meta).into();
                let shape = run.project_object(
                    meta,
                    MUTATION_CTE,
                    &result_field.selection_set,
                    &mut select,
                    &mut plan,
                    depth + 1,
                    true,
                )?;
                fields.insert(result_field.response_key().to_string(), ShapeNode::List(shape));
            }
            other => {
                return Err(SingleHugrError::InvalidFieldName {
                    type_name: format!("{}_mutation_result", meta.name),
                    field_name: other.to_owned(),
                }
                .into());
            }
        }
    }

    let shape = ShapeNode::Object(ObjectShape {
        key: Vec::new(),
        fields,
        nullable: false,
    });
    Ok((select, shape))
}

fn scalar_columns(meta: &ObjectMeta) -> Vec<String> {
    meta.fields
        .values()
        .filter(|f| f.is_scalar())
        .map(|f| f.column.clone())
        .collect()
}

fn scan_of(meta: &ObjectMeta) -> ScanNode {
    ScanNode {
        source: meta.source.clone(),
        object: meta.name.to_string(),
        relation: meta.sql_name.clone(),
        alias: meta.sql_name.clone(),
        has_filter: true,
        has_sort: false,
        has_limit: false,
    }
}

fn scalar_value_expr(
    run: &mut RootRun<'_>,
    scalar: Option<ScalarClass>,
    value: &Value,
) -> Result<SqlExpr, HugrError> {
    match scalar {
        Some(ScalarClass::Geometry) => {
            let geometry = GeometryInput::from_value(value)?;
            let (constructor, payload) = geometry.to_sql_constructor();
            run.params.push(Value::from(payload));
            Ok(SqlExpr::func(
                constructor,
                vec![SqlExpr::Param(run.params.len() - 1)],
            ))
        }
        Some(ScalarClass::Interval) => {
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
        _ => {
            run.params.push(value.clone());
            Ok(SqlExpr::Param(run.params.len() - 1))
        }
    }
}
