//! Aggregation compilation: single-row aggregations, bucket aggregations with
//! time buckets, and relation sub-aggregations.

use apollo_compiler::executable::Field;
use indexmap::IndexMap;
use serde_json_bytes::Value;

use crate::error::HugrError;
use crate::error::SingleHugrError;
use crate::query_plan::AggregateNode;
use crate::query_plan::BucketAggregateNode;
use crate::query_plan::ObjectShape;
use crate::query_plan::PlanNode;
use crate::query_plan::RootPlan;
use crate::query_plan::ScanNode;
use crate::query_plan::ShapeNode;
use crate::query_plan::SubAggregateNode;
use crate::query_plan::compile::RootRun;
use crate::query_plan::compile::flatten_selections;
use crate::query_plan::filter;
use crate::query_plan::filter::semijoin_select;
use crate::scalars::Interval;
use crate::schema::ObjectMeta;
use crate::schema::Relation;
use crate::schema::RootFieldMeta;
use crate::schema::ScalarClass;
use crate::sql::JoinKind;
use crate::sql::SqlExpr;
use crate::sql::SqlFrom;
use crate::sql::SqlJoin;
use crate::sql::SqlOrderBy;
use crate::sql::SqlSelect;
use crate::sql::SqlStatement;

/// `<T>_aggregation` returns exactly one row.
pub(crate) fn compile_root_aggregate(
    run: &mut RootRun<'_>,
    root: &RootFieldMeta,
    field: &Field,
    path: Vec<String>,
    depth: usize,
) -> Result<RootPlan, HugrError> {
    let meta = run.object_meta(root.object.as_ref().ok_or_else(|| {
        crate::internal_error!("aggregate root without a backing object")
    })?)?;
    run.touch(&meta);

    let alias = run.next_alias();
    let user_filter = run.argument_value(field, "filter")?;
    let meta_for_filter = meta.clone();
    let alias_for_filter = alias.clone();
    let condition = run.with_filter_ctx(|ctx| {
        filter::scan_conditions(
            ctx,
            &meta_for_filter,
            &alias_for_filter,
            user_filter.as_ref(),
            false,
        )
    })?;

    let mut select = SqlSelect {
        from: Some(SqlFrom::Table {
            source: meta.source.clone(),
            name: meta.sql_name.clone(),
            alias: alias.clone(),
        }),
        r#where: condition.clone(),
        ..Default::default()
    };

    let mut aggregations = Vec::new();
    let shape = project_aggregations(
        run,
        &meta,
        &alias,
        field,
        &mut select,
        &mut aggregations,
        AggregationContext::Root {
            parent_filter: user_filter.clone(),
        },
        depth + 1,
    )?;

    let plan = PlanNode::Aggregate(Box::new(AggregateNode {
        input: ScanNode {
            source: meta.source.clone(),
            object: meta.name.to_string(),
            relation: meta.sql_name.clone(),
            alias,
            has_filter: condition.is_some(),
            has_sort: false,
            has_limit: false,
        }
        .into(),
        aggregations,
    }));

    Ok(RootPlan {
        response_key: field.response_key().to_string(),
        path,
        plan,
        statement: SqlStatement::Select(select),
        params: std::mem::take(&mut run.params),
        shape: ShapeNode::Object(shape),
        tags: std::mem::take(&mut run.tags),
    })
}

/// `<T>_bucket_aggregation`: key selections define the GROUP BY; requested
/// aggregations must be selected to be sortable.
pub(crate) fn compile_bucket_aggregate(
    run: &mut RootRun<'_>,
    root: &RootFieldMeta,
    field: &Field,
    path: Vec<String>,
    depth: usize,
) -> Result<RootPlan, HugrError> {
    let meta = run.object_meta(root.object.as_ref().ok_or_else(|| {
        crate::internal_error!("bucket aggregate root without a backing object")
    })?)?;
    run.touch(&meta);

    let alias = run.next_alias();
    let user_filter = run.argument_value(field, "filter")?;
    let meta_for_filter = meta.clone();
    let alias_for_filter = alias.clone();
    let condition = run.with_filter_ctx(|ctx| {
        filter::scan_conditions(
            ctx,
            &meta_for_filter,
            &alias_for_filter,
            user_filter.as_ref(),
            false,
        )
    })?;

    let mut select = SqlSelect {
        from: Some(SqlFrom::Table {
            source: meta.source.clone(),
            name: meta.sql_name.clone(),
            alias: alias.clone(),
        }),
        r#where: condition.clone(),
        ..Default::default()
    };

    let mut key_fields: IndexMap<String, ShapeNode> = IndexMap::new();
    let mut key_handles = Vec::new();
    let mut keys = Vec::new();
    // Sortable expressions by dotted path: `key.<alias>`, `aggregations.<field>.<op>`.
    let mut sortable: IndexMap<String, SqlExpr> = IndexMap::new();
    let mut aggregations_shape = None;
    let mut aggregations = Vec::new();

    for (section, _via_fragment) in flatten_selections(run.document, &field.selection_set)? {
        match section.name.as_str() {
            "__typename" => continue,
            "key" => {
                for (key_field, _) in flatten_selections(run.document, &section.selection_set)? {
                    if key_field.name.as_str() == "__typename" {
                        continue;
                    }
                    let field_meta = meta
                        .field(key_field.name.as_str())
                        .cloned()
                        .ok_or_else(|| SingleHugrError::InvalidFieldName {
                            type_name: meta.name.to_string(),
                            field_name: key_field.name.to_string(),
                        })?;
                    let column = SqlExpr::column(&alias, field_meta.column.clone());
                    let expr = bucket_key_expr(run, key_field, column)?;
                    let handle = run.next_handle();
                    select.projection.push((handle.clone(), expr.clone()));
                    select.group_by.push(expr.clone());
                    keys.push(key_field.response_key().to_string());
                    sortable.insert(format!("key.{}", key_field.response_key()), expr);
                    key_handles.push(handle.clone());
                    key_fields.insert(
                        key_field.response_key().to_string(),
                        ShapeNode::Scalar { handle },
                    );
                }
            }
            "aggregations" => {
                let shape = project_aggregations(
                    run,
                    &meta,
                    &alias,
                    section,
                    &mut select,
                    &mut aggregations,
                    AggregationContext::Grouped {
                        sortable: &mut sortable,
                    },
                    depth + 1,
                )?;
                aggregations_shape = Some(shape);
            }
            other => {
                return Err(SingleHugrError::InvalidFieldName {
                    type_name: format!("{}_bucket_aggregation", meta.name),
                    field_name: other.to_owned(),
                }
                .into());
            }
        }
    }

    // Sorting on `key.<path>` and `aggregations.<path>`; anything else must
    // have been selected in the projection.
    if let Some(order_by) = run.argument_value(field, "order_by")? {
        let Value::Array(items) = &order_by else {
            return Err(SingleHugrError::InvalidArgumentValue {
                field: field.name.to_string(),
                argument: "order_by".to_owned(),
                message: "expected a list of { field, direction } objects".to_owned(),
            }
            .into());
        };
        for item in items {
            let (Some(sort_path), descending) = (
                item.as_object().and_then(|o| o.get("field")).and_then(|v| v.as_str()),
                item.as_object()
                    .and_then(|o| o.get("direction"))
                    .and_then(|v| v.as_str())
                    .map(|d| d.eq_ignore_ascii_case("DESC"))
                    .unwrap_or(false),
            ) else {
                return Err(SingleHugrError::InvalidArgumentValue {
                    field: field.name.to_string(),
                    argument: "order_by".to_owned(),
                    message: "expected a list of { field, direction } objects".to_owned(),
                }
                .into());
            };
            let expr = sortable.get(sort_path).cloned().ok_or_else(|| {
                SingleHugrError::SortByUnselected {
                    path: sort_path.to_owned(),
                }
            })?;
            select.order_by.push(SqlOrderBy { expr, descending });
        }
    } else {
        // Buckets come back in key order so equal queries paginate stably.
        select.order_by = select
            .group_by
            .iter()
            .map(|expr| SqlOrderBy {
                expr: expr.clone(),
                descending: false,
            })
            .collect();
    }
    select.limit = run.u64_argument(field, "limit")?;
    select.offset = run.u64_argument(field, "offset")?;

    let mut fields = IndexMap::new();
    fields.insert(
        "key".to_owned(),
        ShapeNode::Object(ObjectShape {
            key: key_handles.clone(),
            fields: key_fields,
            nullable: false,
        }),
    );
    if let Some(shape) = aggregations_shape {
        fields.insert("aggregations".to_owned(), ShapeNode::Object(shape));
    }

    let plan = PlanNode::BucketAggregate(Box::new(BucketAggregateNode {
        input: ScanNode {
            source: meta.source.clone(),
            object: meta.name.to_string(),
            relation: meta.sql_name.clone(),
            alias,
            has_filter: condition.is_some(),
            has_sort: !select.order_by.is_empty(),
            has_limit: select.limit.is_some(),
        }
        .into(),
        keys,
        aggregations,
        has_having: false,
    }));

    Ok(RootPlan {
        response_key: field.response_key().to_string(),
        path,
        plan,
        statement: SqlStatement::Select(select),
        params: std::mem::take(&mut run.params),
        shape: ShapeNode::List(ObjectShape {
            key: key_handles,
            fields,
            nullable: false,
        }),
        tags: std::mem::take(&mut run.tags),
    })
}

/// `bucket:`/`bucket_interval:` arguments on temporal key fields.
fn bucket_key_expr(
    run: &mut RootRun<'_>,
    key_field: &Field,
    column: SqlExpr,
) -> Result<SqlExpr, HugrError> {
    if let Some(bucket) = run.argument_value(key_field, "bucket")? {
        let unit = bucket.as_str().unwrap_or_default().to_ascii_lowercase();
        const UNITS: &[&str] = &["minute", "hour", "day", "week", "month", "quarter", "year"];
        if !UNITS.contains(&unit.as_str()) {
            return Err(SingleHugrError::InvalidArgumentValue {
                field: key_field.name.to_string(),
                argument: "bucket".to_owned(),
                message: format!("unknown bucket unit \"{unit}\""),
            }
            .into());
        }
        return Ok(SqlExpr::func(
            "date_trunc",
            vec![SqlExpr::Verbatim(format!("'{unit}'")), column],
        ));
    }
    if let Some(interval) = run.argument_value(key_field, "bucket_interval")? {
        let text = interval.as_str().ok_or_else(|| {
            HugrError::from(SingleHugrError::InvalidArgumentValue {
                field: key_field.name.to_string(),
                argument: "bucket_interval".to_owned(),
                message: "expected an interval string".to_owned(),
            })
        })?;
        let interval = Interval::parse(text)?;
        return Ok(SqlExpr::func(
            "time_bucket",
            vec![SqlExpr::Verbatim(interval.to_sql()), column],
        ));
    }
    Ok(column)
}

/// Whether sub-aggregations correlate through an EXISTS over the filtered
/// parent set (root aggregates) or contribute sortable grouped expressions
/// (bucket aggregates).
enum AggregationContext<'s> {
    Root {
        parent_filter: Option<Value>,
    },
    Grouped {
        sortable: &'s mut IndexMap<String, SqlExpr>,
    },
    /// Correlated to a parent row by column equality (`_join` aggregations).
    Correlated,
}

/// Projects one `<T>_aggregations` selection into aggregate expressions.
#[allow(clippy::too_many_arguments)]
fn project_aggregations(
    run: &mut RootRun<'_>,
    meta: &ObjectMeta,
    alias: &str,
    field: &Field,
    select: &mut SqlSelect,
    aggregations: &mut Vec<String>,
    mut context: AggregationContext<'_>,
    depth: usize,
) -> Result<ObjectShape, HugrError> {
    run.depth_seen = run.depth_seen.max(depth);
    if depth > run.options.max_depth {
        return Err(SingleHugrError::DepthExceeded {
            depth,
            max_depth: run.options.max_depth,
        }
        .into());
    }
    let mut fields: IndexMap<String, ShapeNode> = IndexMap::new();

    for (agg_field, via_fragment) in flatten_selections(run.document, &field.selection_set)? {
        let name = agg_field.name.as_str();
        if name == "__typename" {
            continue;
        }
        if !run.check_field_access(meta.name.as_str(), name, via_fragment)? {
            continue;
        }
        if name == "_rows_count" {
            let handle = run.next_handle();
            select.projection.push((handle.clone(), SqlExpr::CountStar));
            aggregations.push("_rows_count".to_owned());
            if let AggregationContext::Grouped { sortable } = &mut context {
                sortable.insert("aggregations._rows_count".to_owned(), SqlExpr::CountStar);
            }
            fields.insert(
                agg_field.response_key().to_string(),
                ShapeNode::Scalar { handle },
            );
            continue;
        }

        let field_meta = meta.field(name).cloned().ok_or_else(|| {
            SingleHugrError::InvalidFieldName {
                type_name: format!("{}_aggregations", meta.name),
                field_name: name.to_owned(),
            }
        })?;

        if let Some(relation) = &field_meta.relation {
            match &context {
                AggregationContext::Root { parent_filter } => {
                    let shape = relation_aggregate_exists(
                        run,
                        meta,
                        parent_filter.clone(),
                        agg_field,
                        relation,
                        select,
                        aggregations,
                    )?;
                    fields.insert(agg_field.response_key().to_string(), shape);
                    continue;
                }
                AggregationContext::Grouped { .. } | AggregationContext::Correlated => {
                    return Err(SingleHugrError::UnsupportedAggregation {
                        type_name: meta.name.to_string(),
                        function: name.to_owned(),
                    }
                    .into());
                }
            }
        }

        let scalar = field_meta.scalar.ok_or_else(|| {
            SingleHugrError::UnsupportedAggregation {
                type_name: meta.name.to_string(),
                function: name.to_owned(),
            }
        })?;
        let column = SqlExpr::column(alias, field_meta.column.clone());
        let mut op_fields: IndexMap<String, ShapeNode> = IndexMap::new();
        for (op_field, _) in flatten_selections(run.document, &agg_field.selection_set)? {
            let op = op_field.name.as_str();
            if op == "__typename" {
                continue;
            }
            let expr = aggregate_expr(run, scalar, op, column.clone(), op_field)?;
            let handle = run.next_handle();
            select.projection.push((handle.clone(), expr.clone()));
            aggregations.push(format!("{name}.{op}"));
            if let AggregationContext::Grouped { sortable } = &mut context {
                sortable.insert(format!("aggregations.{name}.{op}"), expr);
            }
            op_fields.insert(op_field.response_key().to_string(), ShapeNode::Scalar { handle });
        }
        fields.insert(
            agg_field.response_key().to_string(),
            ShapeNode::Object(ObjectShape {
                key: Vec::new(),
                fields: op_fields,
                nullable: true,
            }),
        );
    }

    Ok(ObjectShape {
        key: Vec::new(),
        fields,
        nullable: false,
    })
}

/// One aggregation function application, validated against the scalar class.
fn aggregate_expr(
    run: &mut RootRun<'_>,
    scalar: ScalarClass,
    op: &str,
    column: SqlExpr,
    op_field: &Field,
) -> Result<SqlExpr, HugrError> {
    let unsupported = || {
        HugrError::from(SingleHugrError::UnsupportedAggregation {
            type_name: scalar.to_string(),
            function: op.to_owned(),
        })
    };
    let expr = match op {
        "count" => SqlExpr::func("count", vec![column]),
        "sum" | "avg" if scalar.is_numeric() => SqlExpr::func(op, vec![column]),
        "min" | "max"
            if scalar.is_numeric()
                || scalar.is_temporal()
                || matches!(scalar, ScalarClass::String | ScalarClass::Interval) =>
        {
            SqlExpr::func(op, vec![column])
        }
        "sum" | "min" | "max" if scalar == ScalarClass::Json => {
            let path = run
                .argument_value(op_field, "path")?
                .and_then(|v| v.as_str().map(str::to_owned))
                .ok_or_else(|| {
                    HugrError::from(SingleHugrError::InvalidArgumentValue {
                        field: op.to_owned(),
                        argument: "path".to_owned(),
                        message: "a JSON path is required".to_owned(),
                    })
                })?;
            run.params.push(Value::from(path));
            let extracted = SqlExpr::func(
                "json_extract",
                vec![column, SqlExpr::Param(run.params.len() - 1)],
            );
            SqlExpr::func(op, vec![extracted])
        }
        "string_agg" if scalar == ScalarClass::String => {
            let separator = run
                .argument_value(op_field, "separator")?
                .and_then(|v| v.as_str().map(str::to_owned))
                .unwrap_or_else(|| ",".to_owned());
            run.params.push(Value::from(separator));
            SqlExpr::func(
                "string_agg",
                vec![column, SqlExpr::Param(run.params.len() - 1)],
            )
        }
        "bool_and" | "bool_or" if scalar == ScalarClass::Boolean => {
            SqlExpr::func(op, vec![column])
        }
        "union" if scalar == ScalarClass::Geometry => SqlExpr::func("ST_Union_Agg", vec![column]),
        "intersection" if scalar == ScalarClass::Geometry => {
            SqlExpr::func("ST_Intersection_Agg", vec![column])
        }
        "extent" if scalar == ScalarClass::Geometry => SqlExpr::func("ST_Extent_Agg", vec![column]),
        "list" if scalar != ScalarClass::Geometry => SqlExpr::func("list", vec![column]),
        "any" if scalar != ScalarClass::Geometry => SqlExpr::func("any_value", vec![column]),
        "last" if scalar != ScalarClass::Geometry => SqlExpr::func("last", vec![column]),
        _ => return Err(unsupported()),
    };
    Ok(expr)
}

/// A sub-aggregation inside a root aggregate: aggregate over every child row
/// whose parent passes the root filter.
fn relation_aggregate_exists(
    run: &mut RootRun<'_>,
    parent: &ObjectMeta,
    parent_filter: Option<Value>,
    field: &Field,
    relation: &Relation,
    select: &mut SqlSelect,
    aggregations: &mut Vec<String>,
) -> Result<ShapeNode, HugrError> {
    let target = run.object_meta(&relation.target)?;
    run.touch(&target);
    let child_alias = run.next_alias();
    let parent_alias = run.next_alias();

    // EXISTS over the filtered parent set, joined back to the child.
    let parent_for_filter = parent.clone();
    let parent_alias_for_filter = parent_alias.clone();
    let parent_condition = run.with_filter_ctx(|ctx| {
        filter::scan_conditions(
            ctx,
            &parent_for_filter,
            &parent_alias_for_filter,
            parent_filter.as_ref(),
            false,
        )
    })?;
    // The relation's field lists are parent-side first; swap for the child.
    let join = filter::join_condition(
        parent,
        &parent_alias,
        &target,
        &child_alias,
        relation,
    );
    let exists_condition = SqlExpr::and(join.into_iter().chain(parent_condition));
    let exists = SqlExpr::Exists(Box::new(semijoin_select(
        parent,
        &parent_alias,
        exists_condition,
    )));

    let child_filter = run.argument_value(field, "filter")?;
    let target_for_filter = target.clone();
    let child_alias_for_filter = child_alias.clone();
    let child_condition = run.with_filter_ctx(|ctx| {
        filter::scan_conditions(
            ctx,
            &target_for_filter,
            &child_alias_for_filter,
            child_filter.as_ref(),
            false,
        )
    })?;

    let mut child_select = SqlSelect {
        from: Some(SqlFrom::Table {
            source: target.source.clone(),
            name: target.sql_name.clone(),
            alias: child_alias.clone(),
        }),
        r#where: SqlExpr::and([exists].into_iter().chain(child_condition)),
        ..Default::default()
    };

    let mut sub_aggregations = Vec::new();
    let shape = project_aggregations(
        run,
        &target,
        &child_alias,
        field,
        &mut child_select,
        &mut sub_aggregations,
        AggregationContext::Correlated,
        0,
    )?;
    aggregations.extend(
        sub_aggregations
            .iter()
            .map(|agg| format!("{}.{agg}", field.name)),
    );

    // The lateral join exposes the child aggregates under their handles.
    let agg_alias = run.next_alias();
    let handles: Vec<String> = child_select
        .projection
        .iter()
        .map(|(handle, _)| handle.clone())
        .collect();
    select.joins.push(SqlJoin {
        kind: JoinKind::LeftLateral,
        from: SqlFrom::Subquery {
            select: Box::new(child_select),
            alias: agg_alias.clone(),
        },
        on: SqlExpr::Verbatim("TRUE".to_owned()),
    });
    for handle in handles {
        select
            .projection
            .push((handle.clone(), SqlExpr::column(&agg_alias, handle.clone())));
    }

    Ok(ShapeNode::Object(shape))
}

/// `_join { <t>_aggregation(fields: [...]) }` — aggregation correlated to the
/// current parent row by field equality.
#[allow(clippy::too_many_arguments)]
pub(crate) fn compile_relation_aggregate(
    run: &mut RootRun<'_>,
    parent: &ObjectMeta,
    parent_alias: &str,
    field: &Field,
    relation: &Relation,
    select: &mut SqlSelect,
    plan: &mut PlanNode,
    depth: usize,
) -> Result<ShapeNode, HugrError> {
    let target = run.object_meta(&relation.target)?;
    run.touch(&target);
    let child_alias = run.next_alias();

    let join = filter::join_condition(parent, parent_alias, &target, &child_alias, relation);
    let child_filter = run.argument_value(field, "filter")?;
    let target_for_filter = target.clone();
    let child_alias_for_filter = child_alias.clone();
    let child_condition = run.with_filter_ctx(|ctx| {
        filter::scan_conditions(
            ctx,
            &target_for_filter,
            &child_alias_for_filter,
            child_filter.as_ref(),
            false,
        )
    })?;

    let mut child_select = SqlSelect {
        from: Some(SqlFrom::Table {
            source: target.source.clone(),
            name: target.sql_name.clone(),
            alias: child_alias.clone(),
        }),
        r#where: SqlExpr::and(join.into_iter().chain(child_condition)),
        ..Default::default()
    };

    let mut sub_aggregations = Vec::new();
    let shape = project_aggregations(
        run,
        &target,
        &child_alias,
        field,
        &mut child_select,
        &mut sub_aggregations,
        AggregationContext::Correlated,
        depth,
    )?;

    let agg_alias = run.next_alias();
    let handles: Vec<String> = child_select
        .projection
        .iter()
        .map(|(handle, _)| handle.clone())
        .collect();
    select.joins.push(SqlJoin {
        kind: JoinKind::LeftLateral,
        from: SqlFrom::Subquery {
            select: Box::new(child_select),
            alias: agg_alias.clone(),
        },
        on: SqlExpr::Verbatim("TRUE".to_owned()),
    });
    for handle in handles {
        select
            .projection
            .push((handle.clone(), SqlExpr::column(&agg_alias, handle.clone())));
    }

    let current = crate::query_plan::compile::take_plan(plan);
    *plan = PlanNode::SubAggregate(Box::new(SubAggregateNode {
        relation: field.name.to_string(),
        child: current,
    }));

    Ok(ShapeNode::Object(shape))
}
