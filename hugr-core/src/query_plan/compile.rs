//! Compilation of a validated GraphQL operation into per-root SQL statements
//! and result shapes.
//!
//! The permission overlay is applied inline while compiling — field
//! visibility, row filters and mutation defaults are resolved at the point
//! each type occurrence is lowered, so no separate rewrite pass runs.

use std::collections::BTreeSet;

use apollo_compiler::ExecutableDocument;
use apollo_compiler::Name;
use apollo_compiler::ast;
use apollo_compiler::executable::Field;
use apollo_compiler::executable::Selection;
use apollo_compiler::executable::SelectionSet;
use indexmap::IndexMap;
use serde_json_bytes::ByteString;
use serde_json_bytes::Map;
use serde_json_bytes::Value;

use crate::error::HugrError;
use crate::error::SingleHugrError;
use crate::permissions::AuthContext;
use crate::permissions::BindContext;
use crate::permissions::FieldAccess;
use crate::permissions::PermissionSet;
use crate::query_plan::CompiledQuery;
use crate::query_plan::ColumnHandle;
use crate::query_plan::DistinctOnNode;
use crate::query_plan::FunctionScanNode;
use crate::query_plan::H3OverlayNode;
use crate::query_plan::JoinClass;
use crate::query_plan::JoinNode;
use crate::query_plan::LimitOffsetNode;
use crate::query_plan::ObjectShape;
use crate::query_plan::OperationKind;
use crate::query_plan::PlanNode;
use crate::query_plan::RootPlan;
use crate::query_plan::ScanNode;
use crate::query_plan::ShapeNode;
use crate::query_plan::SpatialJoinNode;
use crate::query_plan::aggregate;
use crate::query_plan::filter;
use crate::query_plan::filter::FilterContext;
use crate::query_plan::mutation;
use crate::schema::FieldMeta;
use crate::schema::ObjectKind;
use crate::schema::ObjectMeta;
use crate::schema::Relation;
use crate::schema::RelationKind;
use crate::schema::RootOperationKind;
use crate::schema::ScalarClass;
use crate::schema::SchemaMetadata;
use crate::schema::SchemaSnapshot;
use crate::sql::BinaryOp;
use crate::sql::JoinKind;
use crate::sql::SqlExpr;
use crate::sql::SqlFrom;
use crate::sql::SqlJoin;
use crate::sql::SqlOrderBy;
use crate::sql::SqlSelect;
use crate::sql::SqlStatement;

#[derive(Debug, Clone)]
pub struct CompilerOptions {
    pub max_depth: usize,
}

impl Default for CompilerOptions {
    fn default() -> Self {
        Self { max_depth: 10 }
    }
}

/// Compiles operations against one schema snapshot for one request.
pub struct Compiler<'a> {
    snapshot: &'a SchemaSnapshot,
    permissions: &'a PermissionSet,
    auth: &'a AuthContext,
    options: CompilerOptions,
}

impl<'a> Compiler<'a> {
    pub fn new(
        snapshot: &'a SchemaSnapshot,
        permissions: &'a PermissionSet,
        auth: &'a AuthContext,
        options: CompilerOptions,
    ) -> Self {
        Self {
            snapshot,
            permissions,
            auth,
            options,
        }
    }

    #[tracing::instrument(skip_all, fields(operation = operation_name))]
    pub fn compile(
        &self,
        document_text: &str,
        operation_name: Option<&str>,
        variables: &Map<ByteString, Value>,
    ) -> Result<CompiledQuery, HugrError> {
        let document = ExecutableDocument::parse_and_validate(
            self.snapshot.schema(),
            document_text,
            "operation.graphql",
        )?;
        let operation = document.operations.get(operation_name).map_err(|_| {
            HugrError::from(SingleHugrError::InvalidGraphQl {
                message: match operation_name {
                    Some(name) => format!("operation \"{name}\" not found in document"),
                    None => "the document must contain exactly one anonymous operation".to_owned(),
                },
            })
        })?;

        let kind = match operation.operation_type {
            ast::OperationType::Query => OperationKind::Query,
            ast::OperationType::Mutation => OperationKind::Mutation,
            ast::OperationType::Subscription => {
                return Err(SingleHugrError::InvalidGraphQl {
                    message: "subscriptions are not supported".to_owned(),
                }
                .into());
            }
        };

        let root_type = match kind {
            OperationKind::Query => "Query",
            OperationKind::Mutation => "Mutation",
        };

        let mut run = OperationRun {
            metadata: self.snapshot.metadata(),
            snapshot: self.snapshot,
            permissions: self.permissions,
            auth: self.auth,
            options: &self.options,
            document: &document,
            variables,
            depth_seen: 0,
            roots: Vec::new(),
        };
        run.walk_root(root_type, &operation.selection_set, &mut Vec::new(), 1)?;

        Ok(CompiledQuery {
            kind,
            roots: run.roots,
            depth: run.depth_seen,
        })
    }
}

struct OperationRun<'c> {
    metadata: &'c SchemaMetadata,
    snapshot: &'c SchemaSnapshot,
    permissions: &'c PermissionSet,
    auth: &'c AuthContext,
    options: &'c CompilerOptions,
    document: &'c ExecutableDocument,
    variables: &'c Map<ByteString, Value>,
    depth_seen: usize,
    roots: Vec<RootPlan>,
}

impl OperationRun<'_> {
    /// Walks module mounts until reaching operation fields, compiling one
    /// [`RootPlan`] per leaf.
    fn walk_root(
        &mut self,
        parent_type: &str,
        selection_set: &SelectionSet,
        path: &mut Vec<String>,
        depth: usize,
    ) -> Result<(), HugrError> {
        self.check_depth(depth)?;
        for (field, _via_fragment) in flatten_selections(self.document, selection_set)? {
            let field_name = field.name.as_str();
            if field_name == "__typename" {
                continue;
            }
            if parent_type == "Query" && field_name == "_version" {
                path.push(field.response_key().to_string());
                self.roots.push(version_root(self.snapshot, field, path));
                path.pop();
                continue;
            }
            let Some(root) = self.metadata.root_field(parent_type, field_name).cloned() else {
                return Err(SingleHugrError::InvalidFieldName {
                    type_name: parent_type.to_owned(),
                    field_name: field_name.to_owned(),
                }
                .into());
            };
            path.push(field.response_key().to_string());
            match &root.kind {
                RootOperationKind::ModuleMount => {
                    let mounted_type = field.ty().inner_named_type().to_string();
                    self.walk_root(&mounted_type, &field.selection_set, path, depth + 1)?;
                }
                _ => {
                    let mut root_run = RootRun::new(self);
                    let compiled = root_run.compile_root(&root, field, path.clone(), depth)?;
                    self.depth_seen = self.depth_seen.max(root_run.depth_seen);
                    self.roots.push(compiled);
                }
            }
            path.pop();
        }
        Ok(())
    }

    fn check_depth(&self, depth: usize) -> Result<(), HugrError> {
        if depth > self.options.max_depth {
            return Err(SingleHugrError::DepthExceeded {
                depth,
                max_depth: self.options.max_depth,
            }
            .into());
        }
        Ok(())
    }
}

/// Per-root compilation state: parameters, aliases, handles and tags are
/// scoped to a single statement.
pub(crate) struct RootRun<'c> {
    pub(crate) metadata: &'c SchemaMetadata,
    pub(crate) permissions: &'c PermissionSet,
    pub(crate) auth: &'c AuthContext,
    pub(crate) options: &'c CompilerOptions,
    pub(crate) document: &'c ExecutableDocument,
    pub(crate) variables: &'c Map<ByteString, Value>,
    pub(crate) params: Vec<Value>,
    pub(crate) handles: usize,
    pub(crate) aliases: usize,
    pub(crate) tags: BTreeSet<String>,
    pub(crate) depth_seen: usize,
}

impl<'c> RootRun<'c> {
    fn new(run: &OperationRun<'c>) -> Self {
        Self {
            metadata: run.metadata,
            permissions: run.permissions,
            auth: run.auth,
            options: run.options,
            document: run.document,
            variables: run.variables,
            params: Vec::new(),
            handles: 0,
            aliases: 0,
            tags: BTreeSet::new(),
            depth_seen: 0,
        }
    }

    pub(crate) fn next_handle(&mut self) -> ColumnHandle {
        let handle = format!("c{}", self.handles);
        self.handles += 1;
        handle
    }

    pub(crate) fn next_alias(&mut self) -> String {
        let alias = format!("t{}", self.aliases);
        self.aliases += 1;
        alias
    }

    pub(crate) fn bind_context(&self) -> BindContext<'_> {
        BindContext {
            auth: self.auth,
            catalog: None,
        }
    }

    /// Runs `f` with a filter-lowering context sharing this root's parameters
    /// and alias counter.
    pub(crate) fn with_filter_ctx<T>(
        &mut self,
        f: impl FnOnce(&mut FilterContext<'_>) -> Result<T, HugrError>,
    ) -> Result<T, HugrError> {
        let bind = BindContext {
            auth: self.auth,
            catalog: None,
        };
        let mut ctx = FilterContext {
            metadata: self.metadata,
            permissions: self.permissions,
            bind: &bind,
            role: &self.auth.role,
            params: &mut self.params,
            alias_counter: &mut self.aliases,
        };
        f(&mut ctx)
    }

    pub(crate) fn touch(&mut self, meta: &ObjectMeta) {
        self.tags.insert(meta.source.clone());
        self.tags.insert(meta.name.to_string());
    }

    pub(crate) fn check_field_access(
        &self,
        type_name: &str,
        field_name: &str,
        via_fragment: bool,
    ) -> Result<bool, HugrError> {
        match self
            .permissions
            .field_access(&self.auth.role, type_name, field_name)
        {
            FieldAccess::Allowed => Ok(true),
            FieldAccess::Hidden if via_fragment => Ok(false),
            FieldAccess::Hidden => Ok(true),
            FieldAccess::Denied => Err(SingleHugrError::PermissionDenied.into()),
        }
    }

    fn compile_root(
        &mut self,
        root: &crate::schema::RootFieldMeta,
        field: &Field,
        path: Vec<String>,
        depth: usize,
    ) -> Result<RootPlan, HugrError> {
        self.depth_seen = self.depth_seen.max(depth);
        match &root.kind {
            RootOperationKind::Select => self.compile_select_root(root, field, path, depth, true),
            RootOperationKind::SelectByPk | RootOperationKind::SelectByUnique { .. } => {
                self.compile_select_root(root, field, path, depth, false)
            }
            RootOperationKind::Aggregate => {
                aggregate::compile_root_aggregate(self, root, field, path, depth)
            }
            RootOperationKind::BucketAggregate => {
                aggregate::compile_bucket_aggregate(self, root, field, path, depth)
            }
            RootOperationKind::Insert => mutation::compile_insert(self, root, field, path, depth),
            RootOperationKind::Update => mutation::compile_update(self, root, field, path, depth),
            RootOperationKind::Delete => mutation::compile_delete(self, root, field, path, depth),
            RootOperationKind::Function { sql_name }
            | RootOperationKind::MutationFunction { sql_name } => {
                self.compile_function_root(root, field, sql_name, path, depth)
            }
            RootOperationKind::H3 => self.compile_h3_root(field, path, depth),
            RootOperationKind::ModuleMount => {
                Err(crate::internal_error!("module mounts are walked, not compiled"))
            }
        }
    }

    pub(crate) fn object_meta(&self, name: &Name) -> Result<ObjectMeta, HugrError> {
        self.metadata
            .object(name.as_str())
            .cloned()
            .ok_or_else(|| SingleHugrError::TypeNotResolvable {
                type_name: name.to_string(),
                referenced_by: "operation".to_owned(),
            }
            .into())
    }

    fn compile_select_root(
        &mut self,
        root: &crate::schema::RootFieldMeta,
        field: &Field,
        path: Vec<String>,
        depth: usize,
        list: bool,
    ) -> Result<RootPlan, HugrError> {
        let meta = self.object_meta(root.object.as_ref().ok_or_else(|| {
            crate::internal_error!("select root without a backing object")
        })?)?;
        self.touch(&meta);

        let alias = self.next_alias();
        let mut select = SqlSelect {
            from: Some(SqlFrom::Table {
                source: meta.source.clone(),
                name: meta.sql_name.clone(),
                alias: alias.clone(),
            }),
            ..Default::default()
        };
        let mut plan: PlanNode = ScanNode {
            source: meta.source.clone(),
            object: meta.name.to_string(),
            relation: meta.sql_name.clone(),
            alias: alias.clone(),
            has_filter: false,
            has_sort: false,
            has_limit: false,
        }
        .into();

        // Row conditions: by-pk/by-unique key arguments or the filter argument.
        let mut key_condition = None;
        match &root.kind {
            RootOperationKind::SelectByPk => {
                let keys = meta.pk.clone();
                key_condition = Some(self.key_argument_condition(&meta, &alias, field, &keys)?);
            }
            RootOperationKind::SelectByUnique { suffix } => {
                let unique = meta
                    .uniques
                    .iter()
                    .find(|u| &u.suffix == suffix)
                    .cloned()
                    .ok_or_else(|| crate::internal_error!("unique key \"{suffix}\" disappeared"))?;
                key_condition = Some(self.key_argument_condition(&meta, &alias, field, &unique.fields)?);
            }
            _ => {}
        }

        let user_filter = self.argument_value(field, "filter")?;
        let with_deleted = self
            .argument_value(field, "with_deleted")?
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        let meta_for_filter = meta.clone();
        let mut condition = self.with_filter_ctx(|ctx| {
            filter::scan_conditions(
                ctx,
                &meta_for_filter,
                &alias,
                user_filter.as_ref(),
                with_deleted,
            )
        })?;
        if let Some(key) = key_condition {
            condition = SqlExpr::and(condition.into_iter().chain([key]));
        }
        if condition.is_some() {
            if let PlanNode::Scan(scan) = &mut plan {
                scan.has_filter = true;
            }
        }
        select.r#where = condition;

        // Projection and joins from the selection set.
        let shape = self.project_object(
            &meta,
            &alias,
            &field.selection_set,
            &mut select,
            &mut plan,
            depth,
            !list,
        )?;

        if list {
            let order_by = self.argument_value(field, "order_by")?;
            if let Some(order_by) = order_by {
                select.order_by = self.compile_order_by(&meta, &alias, &order_by)?;
                mark_sort(&mut plan);
            }
            let limit = self.u64_argument(field, "limit")?;
            let offset = self.u64_argument(field, "offset")?;
            if limit.is_some() || offset.is_some() {
                select.limit = limit;
                select.offset = offset;
                mark_limit(&mut plan);
                plan = PlanNode::LimitOffset(Box::new(LimitOffsetNode {
                    limit,
                    offset,
                    input: plan,
                }));
            }
            if let Some(distinct) = self.argument_value(field, "distinct_on")? {
                let keys = string_list(&distinct).ok_or_else(|| {
                    SingleHugrError::InvalidArgumentValue {
                        field: field.name.to_string(),
                        argument: "distinct_on".to_owned(),
                        message: "expected a list of field names".to_owned(),
                    }
                })?;
                let mut exprs = Vec::new();
                for key in &keys {
                    let column = meta
                        .field(key)
                        .filter(|f| f.is_scalar())
                        .map(|f| f.column.clone())
                        .ok_or_else(|| SingleHugrError::InvalidFieldName {
                            type_name: meta.name.to_string(),
                            field_name: key.clone(),
                        })?;
                    exprs.push(SqlExpr::column(&alias, column));
                }
                // DISTINCT ON requires its keys to lead the ordering.
                let mut order_by: Vec<SqlOrderBy> = exprs
                    .iter()
                    .map(|expr| SqlOrderBy {
                        expr: expr.clone(),
                        descending: false,
                    })
                    .collect();
                order_by.append(&mut select.order_by);
                select.order_by = order_by;
                select.distinct_on = exprs;
                plan = PlanNode::DistinctOn(Box::new(DistinctOnNode { keys, input: plan }));
            }
        }

        let shape = if list {
            ShapeNode::List(shape)
        } else {
            ShapeNode::Object(shape)
        };
        Ok(RootPlan {
            response_key: field.response_key().to_string(),
            path,
            plan,
            statement: SqlStatement::Select(select),
            params: std::mem::take(&mut self.params),
            shape,
            tags: std::mem::take(&mut self.tags),
        })
    }

    /// `<pk/unique args> → AND of equality conditions`.
    fn key_argument_condition(
        &mut self,
        meta: &ObjectMeta,
        alias: &str,
        field: &Field,
        keys: &[Name],
    ) -> Result<SqlExpr, HugrError> {
        let mut conditions = Vec::new();
        for key in keys {
            let value = self.argument_value(field, key.as_str())?.ok_or_else(|| {
                SingleHugrError::InvalidArgumentValue {
                    field: field.name.to_string(),
                    argument: key.to_string(),
                    message: "key argument is required".to_owned(),
                }
            })?;
            let column = meta
                .field(key.as_str())
                .map(|f| f.column.clone())
                .ok_or_else(|| SingleHugrError::MissingPrimaryKey {
                    type_name: meta.name.to_string(),
                })?;
            self.params.push(value);
            let param = SqlExpr::Param(self.params.len() - 1);
            conditions.push(SqlExpr::binary(
                SqlExpr::column(alias, column),
                BinaryOp::Eq,
                param,
            ));
        }
        SqlExpr::and(conditions)
            .ok_or_else(|| SingleHugrError::MissingPrimaryKey {
                type_name: meta.name.to_string(),
            }
            .into())
    }

    /// Projects one object level: scalar columns, relation joins, `_join`,
    /// `_spatial` and function-backed fields. Primary key columns are always
    /// projected so the shaper can group rows.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn project_object(
        &mut self,
        meta: &ObjectMeta,
        alias: &str,
        selection_set: &SelectionSet,
        select: &mut SqlSelect,
        plan: &mut PlanNode,
        depth: usize,
        nullable: bool,
    ) -> Result<ObjectShape, HugrError> {
        self.depth_seen = self.depth_seen.max(depth);
        if depth > self.options.max_depth {
            return Err(SingleHugrError::DepthExceeded {
                depth,
                max_depth: self.options.max_depth,
            }
            .into());
        }

        let mut fields: IndexMap<String, ShapeNode> = IndexMap::new();
        let mut key: Vec<ColumnHandle> = Vec::new();
        let mut scalar_handles: Vec<ColumnHandle> = Vec::new();
        let mut projected_columns: IndexMap<String, ColumnHandle> = IndexMap::new();
        let mut group_dimensions: Vec<SqlExpr> = Vec::new();
        let is_cube = meta.kind == ObjectKind::Cube;

        // Identity first: pk columns are projected whether selected or not.
        if !is_cube {
            for pk in &meta.pk {
                if let Some(field_meta) = meta.field(pk.as_str()) {
                    let handle = self.next_handle();
                    select.projection.push((
                        handle.clone(),
                        SqlExpr::column(alias, field_meta.column.clone()),
                    ));
                    projected_columns.insert(pk.to_string(), handle.clone());
                    key.push(handle);
                }
            }
        }

        for (field, via_fragment) in flatten_selections(self.document, selection_set)? {
            let field_name = field.name.as_str();
            if field_name == "__typename" {
                continue;
            }
            if !self.check_field_access(meta.name.as_str(), field_name, via_fragment)? {
                continue;
            }
            let response_key = field.response_key().to_string();

            if field_name == "_join" {
                let shape =
                    self.compile_join_namespace(meta, alias, field, select, plan, depth + 1)?;
                fields.insert(response_key, shape);
                continue;
            }
            if field_name == "_spatial" {
                let shape =
                    self.compile_spatial_namespace(meta, alias, field, select, plan, depth + 1)?;
                fields.insert(response_key, shape);
                continue;
            }

            let Some(field_meta) = meta.field(field_name).cloned() else {
                return Err(SingleHugrError::InvalidFieldName {
                    type_name: meta.name.to_string(),
                    field_name: field_name.to_owned(),
                }
                .into());
            };

            if let Some(relation) = &field_meta.relation {
                let shape = self.compile_relation_field(
                    meta,
                    alias,
                    field,
                    &field_meta,
                    relation,
                    select,
                    plan,
                    depth + 1,
                )?;
                fields.insert(response_key, shape);
                continue;
            }

            // Scalar column, possibly computed through a function call.
            let expr = if let Some(binding) = &field_meta.function {
                let args = binding
                    .args
                    .iter()
                    .filter_map(|(_, parent_column)| {
                        meta.field(parent_column)
                            .map(|f| SqlExpr::column(alias, f.column.clone()))
                    })
                    .collect();
                SqlExpr::func(binding.sql_name.clone(), args)
            } else if is_cube {
                if let Some(measurement) = &field_meta.measurement {
                    SqlExpr::func(
                        measurement.clone(),
                        vec![SqlExpr::column(alias, field_meta.column.clone())],
                    )
                } else {
                    let expr = SqlExpr::column(alias, field_meta.column.clone());
                    group_dimensions.push(expr.clone());
                    expr
                }
            } else {
                SqlExpr::column(alias, field_meta.column.clone())
            };

            let handle = match projected_columns.get(field_name) {
                Some(handle) if field.alias.is_none() => handle.clone(),
                _ => {
                    let handle = self.next_handle();
                    select.projection.push((handle.clone(), expr));
                    handle
                }
            };
            projected_columns.entry(field_name.to_owned()).or_insert_with(|| handle.clone());
            scalar_handles.push(handle.clone());
            fields.insert(response_key, ShapeNode::Scalar { handle });
        }

        if is_cube {
            select.group_by.extend(group_dimensions);
        }
        if key.is_empty() {
            key = scalar_handles;
        }
        Ok(ObjectShape {
            key,
            fields,
            nullable,
        })
    }

    /// A declared or extension relation selected as a nested field.
    #[allow(clippy::too_many_arguments)]
    fn compile_relation_field(
        &mut self,
        meta: &ObjectMeta,
        alias: &str,
        field: &Field,
        field_meta: &FieldMeta,
        relation: &Relation,
        select: &mut SqlSelect,
        plan: &mut PlanNode,
        depth: usize,
    ) -> Result<ShapeNode, HugrError> {
        let target = self.object_meta(&relation.target)?;
        self.touch(&target);
        let child_alias = self.next_alias();

        let user_filter = self.argument_value(field, "filter")?;
        let with_deleted = self
            .argument_value(field, "with_deleted")?
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        let join_kind = if relation.inner {
            JoinKind::Inner
        } else {
            JoinKind::Left
        };

        let nested_limit = self.u64_argument(field, "nested_limit")?;
        let nested_offset = self.u64_argument(field, "nested_offset")?;
        let windowed = nested_limit.is_some() || nested_offset.is_some();

        // In the windowed case the row condition moves inside the subquery so
        // ROW_NUMBER only counts surviving rows.
        let extra = if windowed {
            None
        } else {
            let target_for_filter = target.clone();
            let child_alias_for_filter = child_alias.clone();
            self.with_filter_ctx(|ctx| {
                filter::scan_conditions(
                    ctx,
                    &target_for_filter,
                    &child_alias_for_filter,
                    user_filter.as_ref(),
                    with_deleted,
                )
            })?
        };

        let child_scan: PlanNode = ScanNode {
            source: target.source.clone(),
            object: target.name.to_string(),
            relation: target.sql_name.clone(),
            alias: child_alias.clone(),
            has_filter: extra.is_some() || (windowed && user_filter.is_some()),
            has_sort: false,
            has_limit: windowed,
        }
        .into();

        let join_from = if let Some(binding) = field_meta.function.as_ref().filter(|b| b.is_table)
        {
            // Table function join: LATERAL call with parent columns as args.
            let args = binding
                .args
                .iter()
                .filter_map(|(_, parent_column)| {
                    meta.field(parent_column)
                        .map(|f| SqlExpr::column(alias, f.column.clone()))
                })
                .collect();
            SqlFrom::Function {
                name: binding.sql_name.clone(),
                args,
                alias: child_alias.clone(),
            }
        } else if windowed {
            self.windowed_child(
                &target,
                relation,
                field,
                &child_alias,
                user_filter.as_ref(),
                with_deleted,
            )?
        } else {
            SqlFrom::Table {
                source: target.source.clone(),
                name: target.sql_name.clone(),
                alias: child_alias.clone(),
            }
        };

        let join_cond = filter::join_condition(meta, alias, &target, &child_alias, relation);
        let window_cond = window_bounds(&child_alias, windowed, nested_limit, nested_offset);
        let on = SqlExpr::and(join_cond.into_iter().chain(extra).chain(window_cond))
            .unwrap_or(SqlExpr::Verbatim("TRUE".to_owned()));
        select.joins.push(SqlJoin {
            kind: join_kind,
            from: join_from,
            on,
        });

        // Nested projection reuses the same SELECT: flat rows, shaped later.
        let shape = self.project_object(
            &target,
            &child_alias,
            &field.selection_set,
            select,
            plan,
            depth,
            true,
        )?;

        let current = take_plan(plan);
        *plan = PlanNode::Join(Box::new(JoinNode {
            parent: current,
            child: child_scan,
            kind: if relation.inner {
                JoinClass::Inner
            } else {
                JoinClass::Left
            },
            cross_source: relation.cross_source,
        }));

        Ok(match relation.kind {
            RelationKind::ManyToOne => ShapeNode::Object(shape),
            RelationKind::OneToMany => ShapeNode::List(shape),
        })
    }

    /// Per-parent windows: the child becomes a subquery with a ROW_NUMBER
    /// partitioned by the join keys; the window bounds become join conditions.
    fn windowed_child(
        &mut self,
        target: &ObjectMeta,
        relation: &Relation,
        field: &Field,
        child_alias: &str,
        user_filter: Option<&Value>,
        with_deleted: bool,
    ) -> Result<SqlFrom, HugrError> {
        let inner_alias = self.next_alias();
        let mut projection: Vec<(String, SqlExpr)> = target
            .fields
            .values()
            .filter(|f| f.is_scalar())
            .map(|f| {
                (
                    f.column.clone(),
                    SqlExpr::column(&inner_alias, f.column.clone()),
                )
            })
            .collect();

        let partition: Vec<String> = relation
            .target_fields
            .iter()
            .filter_map(|f| target.field(f.as_str()).map(|f| f.column.clone()))
            .collect();
        let order_by = self.argument_value(field, "order_by")?;
        let order_columns: Vec<(String, bool)> = match order_by {
            Some(value) => order_by_columns(target, &value)?,
            None => target
                .pk
                .iter()
                .filter_map(|f| target.field(f.as_str()).map(|f| (f.column.clone(), false)))
                .collect(),
        };
        projection.push((
            "_rn".to_owned(),
            window_row_number(&inner_alias, &partition, &order_columns),
        ));

        let target_for_filter = target.clone();
        let inner_alias_for_filter = inner_alias.clone();
        let condition = self.with_filter_ctx(|ctx| {
            filter::scan_conditions(
                ctx,
                &target_for_filter,
                &inner_alias_for_filter,
                user_filter,
                with_deleted,
            )
        })?;

        let inner = SqlSelect {
            projection,
            from: Some(SqlFrom::Table {
                source: target.source.clone(),
                name: target.sql_name.clone(),
                alias: inner_alias,
            }),
            r#where: condition,
            ..Default::default()
        };
        Ok(SqlFrom::Subquery {
            select: Box::new(inner),
            alias: child_alias.to_owned(),
        })
    }

    /// `_join(fields: [...])` — ad-hoc joins by field equality. Types must
    /// match exactly on both sides; no implicit coercion.
    fn compile_join_namespace(
        &mut self,
        meta: &ObjectMeta,
        alias: &str,
        field: &Field,
        select: &mut SqlSelect,
        plan: &mut PlanNode,
        depth: usize,
    ) -> Result<ShapeNode, HugrError> {
        let parent_fields = self
            .argument_value(field, "fields")?
            .as_ref()
            .and_then(string_list)
            .ok_or_else(|| SingleHugrError::InvalidArgumentValue {
                field: "_join".to_owned(),
                argument: "fields".to_owned(),
                message: "expected a list of field names".to_owned(),
            })?;

        let mut fields = IndexMap::new();
        for (target_field, via_fragment) in flatten_selections(self.document, &field.selection_set)? {
            let target_name = target_field.name.as_str();
            if target_name == "__typename" {
                continue;
            }
            let (object_name, is_aggregation) = match target_name.strip_suffix("_aggregation") {
                Some(base) if self.metadata.object(base).is_some() => (base, true),
                _ => (target_name, false),
            };
            if !self.check_field_access(meta.name.as_str(), target_name, via_fragment)? {
                continue;
            }
            let target = self
                .metadata
                .object(object_name)
                .cloned()
                .ok_or_else(|| SingleHugrError::InvalidFieldName {
                    type_name: format!("{}_join", meta.name),
                    field_name: target_name.to_owned(),
                })?;
            self.touch(&target);

            let target_fields = self
                .argument_value(target_field, "fields")?
                .as_ref()
                .and_then(string_list)
                .ok_or_else(|| SingleHugrError::InvalidArgumentValue {
                    field: target_name.to_owned(),
                    argument: "fields".to_owned(),
                    message: "expected a list of field names".to_owned(),
                })?;
            if parent_fields.len() != target_fields.len() {
                return Err(SingleHugrError::InvalidArgumentValue {
                    field: target_name.to_owned(),
                    argument: "fields".to_owned(),
                    message: "both sides of _join must list the same number of fields".to_owned(),
                }
                .into());
            }
            // Strict type equality between the joined columns.
            for (parent_field, child_field) in parent_fields.iter().zip(&target_fields) {
                let parent_class = meta
                    .field(parent_field)
                    .and_then(|f| f.scalar)
                    .ok_or_else(|| SingleHugrError::InvalidFieldName {
                        type_name: meta.name.to_string(),
                        field_name: parent_field.clone(),
                    })?;
                let child_class = target
                    .field(child_field)
                    .and_then(|f| f.scalar)
                    .ok_or_else(|| SingleHugrError::InvalidFieldName {
                        type_name: target.name.to_string(),
                        field_name: child_field.clone(),
                    })?;
                if parent_class != child_class {
                    return Err(SingleHugrError::TypeMismatch {
                        expected: parent_class.to_string(),
                        actual: child_class.to_string(),
                    }
                    .into());
                }
            }

            let relation = Relation {
                target: target.name.clone(),
                kind: RelationKind::OneToMany,
                source_fields: parent_fields
                    .iter()
                    .filter_map(|f| Name::new(f).ok())
                    .collect(),
                target_fields: target_fields
                    .iter()
                    .filter_map(|f| Name::new(f).ok())
                    .collect(),
                inner: self
                    .argument_value(target_field, "inner")?
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false),
                cross_source: meta.source != target.source,
            };
            let field_meta = FieldMeta {
                name: target.name.clone(),
                column: String::new(),
                scalar: None,
                nullable: true,
                has_default: false,
                relation: Some(relation.clone()),
                measurement: None,
                function: None,
            };
            let shape = if is_aggregation {
                aggregate::compile_relation_aggregate(
                    self,
                    meta,
                    alias,
                    target_field,
                    &relation,
                    select,
                    plan,
                    depth,
                )?
            } else {
                self.compile_relation_field(
                    meta,
                    alias,
                    target_field,
                    &field_meta,
                    &relation,
                    select,
                    plan,
                    depth,
                )?
            };
            fields.insert(target_field.response_key().to_string(), shape);
        }

        Ok(ShapeNode::Object(ObjectShape {
            key: Vec::new(),
            fields,
            // The namespace object itself always resolves; only its joined
            // lists can be empty.
            nullable: false,
        }))
    }

    /// `_spatial(field:, type:, buffer:)` — joins geometry-bearing types by a
    /// spatial predicate.
    fn compile_spatial_namespace(
        &mut self,
        meta: &ObjectMeta,
        alias: &str,
        field: &Field,
        select: &mut SqlSelect,
        plan: &mut PlanNode,
        depth: usize,
    ) -> Result<ShapeNode, HugrError> {
        let parent_field = self
            .argument_value(field, "field")?
            .and_then(|v| v.as_str().map(str::to_owned))
            .ok_or_else(|| SingleHugrError::InvalidArgumentValue {
                field: "_spatial".to_owned(),
                argument: "field".to_owned(),
                message: "a geometry field name is required".to_owned(),
            })?;
        let relation_kind = self
            .argument_value(field, "type")?
            .and_then(|v| v.as_str().map(str::to_owned))
            .unwrap_or_else(|| "INTERSECTS".to_owned());
        let buffer = self
            .argument_value(field, "buffer")?
            .and_then(|v| v.as_f64());
        let parent_geometry = meta
            .field(&parent_field)
            .filter(|f| f.scalar == Some(ScalarClass::Geometry))
            .map(|f| f.column.clone())
            .ok_or_else(|| SingleHugrError::InvalidFieldName {
                type_name: meta.name.to_string(),
                field_name: parent_field.clone(),
            })?;

        let mut fields = IndexMap::new();
        for (target_field, via_fragment) in flatten_selections(self.document, &field.selection_set)? {
            let target_name = target_field.name.as_str();
            if target_name == "__typename" {
                continue;
            }
            if !self.check_field_access(meta.name.as_str(), target_name, via_fragment)? {
                continue;
            }
            let target = self
                .metadata
                .object(target_name)
                .cloned()
                .ok_or_else(|| SingleHugrError::InvalidFieldName {
                    type_name: format!("{}_spatial", meta.name),
                    field_name: target_name.to_owned(),
                })?;
            self.touch(&target);
            let child_field = self
                .argument_value(target_field, "field")?
                .and_then(|v| v.as_str().map(str::to_owned))
                .ok_or_else(|| SingleHugrError::InvalidArgumentValue {
                    field: target_name.to_owned(),
                    argument: "field".to_owned(),
                    message: "a geometry field name is required".to_owned(),
                })?;
            let child_geometry = target
                .field(&child_field)
                .filter(|f| f.scalar == Some(ScalarClass::Geometry))
                .map(|f| f.column.clone())
                .ok_or_else(|| SingleHugrError::InvalidFieldName {
                    type_name: target.name.to_string(),
                    field_name: child_field.clone(),
                })?;

            let child_alias = self.next_alias();
            let inner = self
                .argument_value(target_field, "inner")?
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            let user_filter = self.argument_value(target_field, "filter")?;
            let target_for_filter = target.clone();
            let child_alias_for_filter = child_alias.clone();
            let extra = self.with_filter_ctx(|ctx| {
                filter::scan_conditions(
                    ctx,
                    &target_for_filter,
                    &child_alias_for_filter,
                    user_filter.as_ref(),
                    false,
                )
            })?;

            let predicate = spatial_predicate(
                &relation_kind,
                SqlExpr::column(alias, parent_geometry.clone()),
                SqlExpr::column(&child_alias, child_geometry),
                buffer,
            );
            let on = SqlExpr::and([predicate].into_iter().chain(extra))
                .unwrap_or(SqlExpr::Verbatim("TRUE".to_owned()));
            select.joins.push(SqlJoin {
                kind: if inner { JoinKind::Inner } else { JoinKind::Left },
                from: SqlFrom::Table {
                    source: target.source.clone(),
                    name: target.sql_name.clone(),
                    alias: child_alias.clone(),
                },
                on,
            });

            let child_scan: PlanNode = ScanNode {
                source: target.source.clone(),
                object: target.name.to_string(),
                relation: target.sql_name.clone(),
                alias: child_alias.clone(),
                has_filter: user_filter.is_some(),
                has_sort: false,
                has_limit: false,
            }
            .into();
            let current = take_plan(plan);
            *plan = PlanNode::SpatialJoin(Box::new(SpatialJoinNode {
                parent: current,
                child: child_scan,
                relation: relation_kind.clone(),
                buffer,
                cross_source: meta.source != target.source,
            }));

            let shape = self.project_object(
                &target,
                &child_alias,
                &target_field.selection_set,
                select,
                plan,
                depth,
                true,
            )?;
            fields.insert(
                target_field.response_key().to_string(),
                ShapeNode::List(shape),
            );
        }

        Ok(ShapeNode::Object(ObjectShape {
            key: Vec::new(),
            fields,
            nullable: false,
        }))
    }

    fn compile_function_root(
        &mut self,
        root: &crate::schema::RootFieldMeta,
        field: &Field,
        sql_name: &str,
        path: Vec<String>,
        depth: usize,
    ) -> Result<RootPlan, HugrError> {
        let function = self
            .metadata
            .functions
            .get(field.name.as_str())
            .cloned()
            .ok_or_else(|| SingleHugrError::InvalidFieldName {
                type_name: "Function".to_owned(),
                field_name: field.name.to_string(),
            })?;
        self.tags.insert(function.source.clone());

        let mut args = Vec::new();
        for (arg_name, _class) in &function.args {
            if let Some(value) = self.argument_value(field, arg_name.as_str())? {
                self.params.push(value);
                args.push(SqlExpr::Param(self.params.len() - 1));
            }
        }

        let plan: PlanNode = FunctionScanNode {
            source: function.source.clone(),
            function: sql_name.to_owned(),
            returns_set: function.returns_set,
        }
        .into();

        let (select, shape) = match &root.object {
            Some(object_name) => {
                let meta = self.object_meta(object_name)?;
                let alias = self.next_alias();
                let mut select = SqlSelect {
                    from: Some(SqlFrom::Function {
                        name: sql_name.to_owned(),
                        args,
                        alias: alias.clone(),
                    }),
                    ..Default::default()
                };
                let mut inner_plan = plan.clone();
                let shape = self.project_object(
                    &meta,
                    &alias,
                    &field.selection_set,
                    &mut select,
                    &mut inner_plan,
                    depth + 1,
                    !function.returns_set,
                )?;
                let shape = if function.returns_set {
                    ShapeNode::List(shape)
                } else {
                    ShapeNode::Object(shape)
                };
                (select, shape)
            }
            None => {
                let handle = self.next_handle();
                let select = SqlSelect {
                    projection: vec![(handle.clone(), SqlExpr::func(sql_name, args))],
                    ..Default::default()
                };
                (select, ShapeNode::Scalar { handle })
            }
        };

        Ok(RootPlan {
            response_key: field.response_key().to_string(),
            path,
            plan,
            statement: SqlStatement::Select(select),
            params: std::mem::take(&mut self.params),
            shape,
            tags: std::mem::take(&mut self.tags),
        })
    }

    /// `h3(resolution:)` — hex cells covering the union of geometry-bearing
    /// scans, each cell carrying the rows intersecting it.
    fn compile_h3_root(
        &mut self,
        field: &Field,
        path: Vec<String>,
        depth: usize,
    ) -> Result<RootPlan, HugrError> {
        let resolution = self
            .argument_value(field, "resolution")?
            .and_then(|v| v.as_i64())
            .ok_or_else(|| SingleHugrError::InvalidArgumentValue {
                field: "h3".to_owned(),
                argument: "resolution".to_owned(),
                message: "an integer resolution is required".to_owned(),
            })? as i32;
        let inner = self
            .argument_value(field, "inner")?
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        let geometry_objects: Vec<ObjectMeta> = self
            .metadata
            .objects
            .values()
            .filter(|o| o.has_geometry())
            .cloned()
            .collect();

        // One cell-set select per geometry source, unioned.
        let mut cell_selects = Vec::new();
        for meta in &geometry_objects {
            let alias = self.next_alias();
            let geometry = meta
                .geometry_fields()
                .next()
                .map(|f| f.column.clone())
                .ok_or_else(|| crate::internal_error!("geometry object without geometry"))?;
            cell_selects.push(SqlSelect {
                projection: vec![(
                    "cell".to_owned(),
                    SqlExpr::func(
                        "unnest",
                        vec![SqlExpr::func(
                            "h3_polygon_wkt_to_cells",
                            vec![
                                SqlExpr::func(
                                    "ST_AsText",
                                    vec![SqlExpr::column(&alias, geometry)],
                                ),
                                SqlExpr::Verbatim(resolution.to_string()),
                            ],
                        )],
                    ),
                )],
                from: Some(SqlFrom::Table {
                    source: meta.source.clone(),
                    name: meta.sql_name.clone(),
                    alias,
                }),
                ..Default::default()
            });
        }

        let cells_alias = "cells".to_owned();
        let mut select = SqlSelect {
            from: Some(SqlFrom::Union {
                selects: cell_selects,
                alias: cells_alias.clone(),
            }),
            ..Default::default()
        };

        let cell_handle = self.next_handle();
        select.projection.push((
            cell_handle.clone(),
            SqlExpr::column(&cells_alias, "cell"),
        ));
        let resolution_handle = self.next_handle();
        select.projection.push((
            resolution_handle.clone(),
            SqlExpr::Verbatim(resolution.to_string()),
        ));
        let boundary_handle = self.next_handle();
        select.projection.push((
            boundary_handle.clone(),
            SqlExpr::func(
                "ST_GeomFromText",
                vec![SqlExpr::func(
                    "h3_cell_to_boundary_wkt",
                    vec![SqlExpr::column(&cells_alias, "cell")],
                )],
            ),
        ));

        let mut fields: IndexMap<String, ShapeNode> = IndexMap::new();
        let mut inputs: Vec<PlanNode> = Vec::new();
        let mut plan_stub: PlanNode = ScanNode {
            source: String::new(),
            object: "_h3_cell".to_owned(),
            relation: "_h3_cell".to_owned(),
            alias: cells_alias.clone(),
            has_filter: false,
            has_sort: false,
            has_limit: false,
        }
        .into();

        for (cell_field, via_fragment) in flatten_selections(self.document, &field.selection_set)? {
            let name = cell_field.name.as_str();
            match name {
                "__typename" => continue,
                "cell" => {
                    fields.insert(
                        cell_field.response_key().to_string(),
                        ShapeNode::Scalar {
                            handle: cell_handle.clone(),
                        },
                    );
                }
                "resolution" => {
                    fields.insert(
                        cell_field.response_key().to_string(),
                        ShapeNode::Scalar {
                            handle: resolution_handle.clone(),
                        },
                    );
                }
                "boundary" => {
                    fields.insert(
                        cell_field.response_key().to_string(),
                        ShapeNode::Scalar {
                            handle: boundary_handle.clone(),
                        },
                    );
                }
                _ => {
                    if !self.check_field_access("_h3_cell", name, via_fragment)? {
                        continue;
                    }
                    let Some(root) = self.metadata.root_field("_h3_cell", name).cloned() else {
                        return Err(SingleHugrError::InvalidFieldName {
                            type_name: "_h3_cell".to_owned(),
                            field_name: name.to_owned(),
                        }
                        .into());
                    };
                    let meta = self.object_meta(root.object.as_ref().ok_or_else(|| {
                        crate::internal_error!("h3 data field without a backing object")
                    })?)?;
                    self.touch(&meta);
                    let child_alias = self.next_alias();
                    let geometry = meta
                        .geometry_fields()
                        .next()
                        .map(|f| f.column.clone())
                        .ok_or_else(|| crate::internal_error!("geometry object without geometry"))?;
                    let user_filter = self.argument_value(cell_field, "filter")?;
                    let meta_for_filter = meta.clone();
                    let child_alias_for_filter = child_alias.clone();
                    let extra = self.with_filter_ctx(|ctx| {
                        filter::scan_conditions(
                            ctx,
                            &meta_for_filter,
                            &child_alias_for_filter,
                            user_filter.as_ref(),
                            false,
                        )
                    })?;
                    let boundary = SqlExpr::func(
                        "ST_GeomFromText",
                        vec![SqlExpr::func(
                            "h3_cell_to_boundary_wkt",
                            vec![SqlExpr::column(&cells_alias, "cell")],
                        )],
                    );
                    let predicate = SqlExpr::func(
                        "ST_Intersects",
                        vec![boundary, SqlExpr::column(&child_alias, geometry)],
                    );
                    let on = SqlExpr::and([predicate].into_iter().chain(extra))
                        .unwrap_or(SqlExpr::Verbatim("TRUE".to_owned()));
                    select.joins.push(SqlJoin {
                        kind: if inner { JoinKind::Inner } else { JoinKind::Left },
                        from: SqlFrom::Table {
                            source: meta.source.clone(),
                            name: meta.sql_name.clone(),
                            alias: child_alias.clone(),
                        },
                        on,
                    });
                    inputs.push(
                        ScanNode {
                            source: meta.source.clone(),
                            object: meta.name.to_string(),
                            relation: meta.sql_name.clone(),
                            alias: child_alias.clone(),
                            has_filter: user_filter.is_some(),
                            has_sort: false,
                            has_limit: false,
                        }
                        .into(),
                    );
                    let shape = self.project_object(
                        &meta,
                        &child_alias,
                        &cell_field.selection_set,
                        &mut select,
                        &mut plan_stub,
                        depth + 1,
                        true,
                    )?;
                    fields.insert(cell_field.response_key().to_string(), ShapeNode::List(shape));
                }
            }
        }

        let plan = PlanNode::H3Overlay(Box::new(H3OverlayNode {
            resolution,
            inner,
            inputs,
        }));
        let shape = ShapeNode::List(ObjectShape {
            key: vec![cell_handle],
            fields,
            nullable: false,
        });
        Ok(RootPlan {
            response_key: field.response_key().to_string(),
            path,
            plan,
            statement: SqlStatement::Select(select),
            params: std::mem::take(&mut self.params),
            shape,
            tags: std::mem::take(&mut self.tags),
        })
    }

    pub(crate) fn compile_order_by(
        &mut self,
        meta: &ObjectMeta,
        alias: &str,
        value: &Value,
    ) -> Result<Vec<SqlOrderBy>, HugrError> {
        order_by_columns(meta, value).map(|columns| {
            columns
                .into_iter()
                .map(|(column, descending)| SqlOrderBy {
                    expr: SqlExpr::column(alias, column),
                    descending,
                })
                .collect()
        })
    }

    /// Resolves one argument, substituting variables, and returns `None` for
    /// absent or explicit-null arguments.
    pub(crate) fn argument_value(
        &self,
        field: &Field,
        name: &str,
    ) -> Result<Option<Value>, HugrError> {
        let Some(argument) = field.arguments.iter().find(|a| a.name.as_str() == name) else {
            return Ok(None);
        };
        let value = graphql_value_to_json(&argument.value, self.variables)?;
        Ok(match value {
            Value::Null => None,
            other => Some(other),
        })
    }

    pub(crate) fn u64_argument(&self, field: &Field, name: &str) -> Result<Option<u64>, HugrError> {
        match self.argument_value(field, name)? {
            None => Ok(None),
            Some(value) => value
                .as_i64()
                .filter(|v| *v >= 0)
                .map(|v| Some(v as u64))
                .ok_or_else(|| {
                    SingleHugrError::InvalidArgumentValue {
                        field: field.name.to_string(),
                        argument: name.to_owned(),
                        message: "expected a non-negative integer".to_owned(),
                    }
                    .into()
                }),
        }
    }
}

fn version_root(snapshot: &SchemaSnapshot, field: &Field, path: &[String]) -> RootPlan {
    RootPlan {
        response_key: field.response_key().to_string(),
        path: path.to_vec(),
        plan: PlanNode::Scan(ScanNode {
            source: String::new(),
            object: "_version".to_owned(),
            relation: "_version".to_owned(),
            alias: String::new(),
            has_filter: false,
            has_sort: false,
            has_limit: false,
        }),
        statement: SqlStatement::Select(SqlSelect::default()),
        params: Vec::new(),
        shape: ShapeNode::Constant {
            value: Value::from(format!("{}:{}", snapshot.version(), snapshot.hash())),
        },
        tags: BTreeSet::new(),
    }
}

/// Flattens a selection set, resolving fragment spreads and inline fragments.
/// The flag records whether the field arrived through a fragment.
pub(crate) fn flatten_selections<'d>(
    document: &'d ExecutableDocument,
    selection_set: &'d SelectionSet,
) -> Result<Vec<(&'d Field, bool)>, HugrError> {
    let mut fields = Vec::new();
    collect_selections(document, selection_set, false, &mut fields)?;
    Ok(fields)
}

fn collect_selections<'d>(
    document: &'d ExecutableDocument,
    selection_set: &'d SelectionSet,
    via_fragment: bool,
    out: &mut Vec<(&'d Field, bool)>,
) -> Result<(), HugrError> {
    for selection in &selection_set.selections {
        match selection {
            Selection::Field(field) => out.push((field, via_fragment)),
            Selection::FragmentSpread(spread) => {
                let fragment = document
                    .fragments
                    .get(&spread.fragment_name)
                    .ok_or_else(|| SingleHugrError::InvalidGraphQl {
                        message: format!("unknown fragment \"{}\"", spread.fragment_name),
                    })?;
                collect_selections(document, &fragment.selection_set, true, out)?;
            }
            Selection::InlineFragment(inline) => {
                collect_selections(document, &inline.selection_set, true, out)?;
            }
        }
    }
    Ok(())
}

/// Converts a GraphQL argument value into JSON, resolving variables.
pub(crate) fn graphql_value_to_json(
    value: &ast::Value,
    variables: &Map<ByteString, Value>,
) -> Result<Value, HugrError> {
    Ok(match value {
        ast::Value::Null => Value::Null,
        ast::Value::Boolean(b) => Value::from(*b),
        ast::Value::Enum(name) => Value::from(name.to_string()),
        ast::Value::String(s) => Value::from(s.clone()),
        ast::Value::Int(i) => Value::from(i.try_to_i32().map_err(|_| {
            HugrError::from(SingleHugrError::InvalidGraphQl {
                message: "integer literal out of range".to_owned(),
            })
        })?),
        ast::Value::Float(f) => Value::from(f.try_to_f64().map_err(|_| {
            HugrError::from(SingleHugrError::InvalidGraphQl {
                message: "float literal out of range".to_owned(),
            })
        })?),
        ast::Value::Variable(name) => variables
            .get(name.as_str())
            .cloned()
            .unwrap_or(Value::Null),
        ast::Value::List(items) => Value::Array(
            items
                .iter()
                .map(|item| graphql_value_to_json(item, variables))
                .collect::<Result<Vec<_>, _>>()?,
        ),
        ast::Value::Object(fields) => {
            let mut map = Map::new();
            for (key, item) in fields {
                map.insert(
                    ByteString::from(key.to_string()),
                    graphql_value_to_json(item, variables)?,
                );
            }
            Value::Object(map)
        }
    })
}

pub(crate) fn string_list(value: &Value) -> Option<Vec<String>> {
    match value {
        Value::Array(items) => items
            .iter()
            .map(|item| item.as_str().map(str::to_owned))
            .collect(),
        Value::String(s) => Some(vec![s.as_str().to_owned()]),
        _ => None,
    }
}

/// `order_by: [{field, direction}]` resolved to `(column, descending)` pairs.
pub(crate) fn order_by_columns(
    meta: &ObjectMeta,
    value: &Value,
) -> Result<Vec<(String, bool)>, HugrError> {
    let Value::Array(items) = value else {
        return Err(order_by_error(meta));
    };
    let mut columns = Vec::new();
    for item in items {
        let Value::Object(entry) = item else {
            return Err(order_by_error(meta));
        };
        let field_name = entry
            .get("field")
            .and_then(|v| v.as_str())
            .ok_or_else(|| order_by_error(meta))?;
        let descending = entry
            .get("direction")
            .and_then(|v| v.as_str())
            .map(|d| d.eq_ignore_ascii_case("DESC"))
            .unwrap_or(false);
        let column = meta
            .field(field_name)
            .filter(|f| f.is_scalar())
            .map(|f| f.column.clone())
            .ok_or_else(|| SingleHugrError::InvalidFieldName {
                type_name: meta.name.to_string(),
                field_name: field_name.to_owned(),
            })?;
        columns.push((column, descending));
    }
    Ok(columns)
}

fn order_by_error(meta: &ObjectMeta) -> HugrError {
    SingleHugrError::InvalidArgumentValue {
        field: meta.name.to_string(),
        argument: "order_by".to_owned(),
        message: "expected a list of { field, direction } objects".to_owned(),
    }
    .into()
}

fn spatial_predicate(
    relation: &str,
    parent: SqlExpr,
    child: SqlExpr,
    buffer: Option<f64>,
) -> SqlExpr {
    match relation {
        "DWITHIN" => SqlExpr::func(
            "ST_DWithin",
            vec![
                parent,
                child,
                SqlExpr::Verbatim(buffer.unwrap_or(0.0).to_string()),
            ],
        ),
        "CONTAINS" => SqlExpr::func("ST_Contains", vec![parent, child]),
        "TOUCHES" => SqlExpr::func("ST_Touches", vec![parent, child]),
        "WITHIN" => SqlExpr::func("ST_Within", vec![parent, child]),
        _ => match buffer {
            // With a buffer, intersection tests against the buffered parent;
            // for EPSG:4326 geometries buffer units are meters.
            Some(buffer) => SqlExpr::func(
                "ST_Intersects",
                vec![
                    SqlExpr::func(
                        "ST_Buffer",
                        vec![parent, SqlExpr::Verbatim(buffer.to_string())],
                    ),
                    child,
                ],
            ),
            None => SqlExpr::func("ST_Intersects", vec![parent, child]),
        },
    }
}

/// ROW_NUMBER() OVER (PARTITION BY ... ORDER BY ...), built from validated
/// column names only.
fn window_row_number(alias: &str, partition: &[String], order: &[(String, bool)]) -> SqlExpr {
    let mut over = String::from("ROW_NUMBER() OVER (");
    if !partition.is_empty() {
        over.push_str("PARTITION BY ");
        over.push_str(
            &partition
                .iter()
                .map(|c| format!("{}.{}", crate::sql::quote_ident(alias), crate::sql::quote_ident(c)))
                .collect::<Vec<_>>()
                .join(", "),
        );
    }
    if !order.is_empty() {
        over.push_str(" ORDER BY ");
        over.push_str(
            &order
                .iter()
                .map(|(c, desc)| {
                    format!(
                        "{}.{}{}",
                        crate::sql::quote_ident(alias),
                        crate::sql::quote_ident(c),
                        if *desc { " DESC" } else { "" }
                    )
                })
                .collect::<Vec<_>>()
                .join(", "),
        );
    }
    over.push(')');
    SqlExpr::Verbatim(over)
}

/// Window bounds become join conditions on the `_rn` column of the subquery:
/// `_rn > offset AND _rn <= offset + limit`.
fn window_bounds(
    child_alias: &str,
    windowed: bool,
    nested_limit: Option<u64>,
    nested_offset: Option<u64>,
) -> Option<SqlExpr> {
    if !windowed {
        return None;
    }
    let offset = nested_offset.unwrap_or(0);
    let mut conditions = Vec::new();
    if offset > 0 {
        conditions.push(SqlExpr::binary(
            SqlExpr::column(child_alias, "_rn"),
            BinaryOp::Gt,
            SqlExpr::Verbatim(offset.to_string()),
        ));
    }
    if let Some(limit) = nested_limit {
        conditions.push(SqlExpr::binary(
            SqlExpr::column(child_alias, "_rn"),
            BinaryOp::Lte,
            SqlExpr::Verbatim((offset + limit).to_string()),
        ));
    }
    SqlExpr::and(conditions)
}

fn mark_sort(plan: &mut PlanNode) {
    if let PlanNode::Scan(scan) = plan {
        scan.has_sort = true;
    } else if let PlanNode::LimitOffset(node) = plan {
        mark_sort(&mut node.input);
    }
}

fn mark_limit(plan: &mut PlanNode) {
    if let PlanNode::Scan(scan) = plan {
        scan.has_limit = true;
    }
}

pub(crate) fn take_plan(plan: &mut PlanNode) -> PlanNode {
    std::mem::replace(
        plan,
        PlanNode::Scan(ScanNode {
            source: String::new(),
            object: String::new(),
            relation: String::new(),
            alias: String::new(),
            has_filter: false,
            has_sort: false,
            has_limit: false,
        }),
    )
}
