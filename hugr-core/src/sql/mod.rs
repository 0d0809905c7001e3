//! A small SQL AST rendered to the central engine's dialect.
//!
//! User values never splice into the statement text: every literal becomes a
//! positional parameter (`$1`, `$2`, ...) collected alongside the rendered
//! string.

use serde_json_bytes::Value;

/// Binary comparison and logical operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum BinaryOp {
    #[strum(to_string = "=")]
    Eq,
    #[strum(to_string = "<>")]
    NotEq,
    #[strum(to_string = "<")]
    Lt,
    #[strum(to_string = "<=")]
    Lte,
    #[strum(to_string = ">")]
    Gt,
    #[strum(to_string = ">=")]
    Gte,
    #[strum(to_string = "LIKE")]
    Like,
    #[strum(to_string = "ILIKE")]
    ILike,
    #[strum(to_string = "~")]
    Regex,
    /// Range intersection.
    #[strum(to_string = "&&")]
    Overlaps,
    /// Range containment of an element or range.
    #[strum(to_string = "@>")]
    Contains,
}

/// A SQL expression. Construction is infallible; rendering walks the tree.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlExpr {
    /// A column reference, qualified by a table alias.
    Column { table: String, column: String },
    /// A positional parameter (0-based index into the parameter list).
    Param(usize),
    /// A literal the compiler itself produced (never user input).
    Verbatim(String),
    Binary {
        left: Box<SqlExpr>,
        op: BinaryOp,
        right: Box<SqlExpr>,
    },
    And(Vec<SqlExpr>),
    Or(Vec<SqlExpr>),
    Not(Box<SqlExpr>),
    IsNull(Box<SqlExpr>),
    IsNotNull(Box<SqlExpr>),
    InList {
        expr: Box<SqlExpr>,
        list: Vec<SqlExpr>,
    },
    Func {
        name: String,
        args: Vec<SqlExpr>,
    },
    /// `COUNT(*)`.
    CountStar,
    Exists(Box<SqlSelect>),
    NotExists(Box<SqlSelect>),
    /// A parenthesized scalar subquery.
    Subquery(Box<SqlSelect>),
}

impl SqlExpr {
    pub fn column(table: impl Into<String>, column: impl Into<String>) -> Self {
        SqlExpr::Column {
            table: table.into(),
            column: column.into(),
        }
    }

    pub fn binary(left: SqlExpr, op: BinaryOp, right: SqlExpr) -> Self {
        SqlExpr::Binary {
            left: Box::new(left),
            op,
            right: Box::new(right),
        }
    }

    pub fn func(name: impl Into<String>, args: Vec<SqlExpr>) -> Self {
        SqlExpr::Func {
            name: name.into(),
            args,
        }
    }

    /// Conjunction that collapses trivial cases.
    pub fn and(exprs: impl IntoIterator<Item = SqlExpr>) -> Option<Self> {
        let mut flat = Vec::new();
        for expr in exprs {
            match expr {
                SqlExpr::And(inner) => flat.extend(inner),
                other => flat.push(other),
            }
        }
        match flat.len() {
            0 => None,
            1 => Some(flat.into_iter().next().expect("just checked the length")),
            _ => Some(SqlExpr::And(flat)),
        }
    }
}

/// What a SELECT reads from.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlFrom {
    /// A source-qualified relation: rendered `"source"."name"`.
    Table {
        source: String,
        name: String,
        alias: String,
    },
    Subquery {
        select: Box<SqlSelect>,
        alias: String,
    },
    /// A table-valued function call.
    Function {
        name: String,
        args: Vec<SqlExpr>,
        alias: String,
    },
    /// A UNION of selects, parenthesized and aliased.
    Union {
        selects: Vec<SqlSelect>,
        alias: String,
    },
}

impl SqlFrom {
    pub fn alias(&self) -> &str {
        match self {
            SqlFrom::Table { alias, .. }
            | SqlFrom::Subquery { alias, .. }
            | SqlFrom::Function { alias, .. }
            | SqlFrom::Union { alias, .. } => alias,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum JoinKind {
    #[strum(to_string = "LEFT JOIN")]
    Left,
    #[strum(to_string = "INNER JOIN")]
    Inner,
    #[strum(to_string = "LEFT JOIN LATERAL")]
    LeftLateral,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SqlJoin {
    pub kind: JoinKind,
    pub from: SqlFrom,
    pub on: SqlExpr,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SqlOrderBy {
    pub expr: SqlExpr,
    pub descending: bool,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SqlSelect {
    /// `(alias, expression)` pairs; aliases are the shape tree's column handles.
    pub projection: Vec<(String, SqlExpr)>,
    pub from: Option<SqlFrom>,
    pub joins: Vec<SqlJoin>,
    pub r#where: Option<SqlExpr>,
    pub group_by: Vec<SqlExpr>,
    pub having: Option<SqlExpr>,
    pub order_by: Vec<SqlOrderBy>,
    pub distinct_on: Vec<SqlExpr>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

/// A data-modifying statement wrapped in a CTE so the RETURNING shape can be
/// selected and joined like any other relation.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlStatement {
    Select(SqlSelect),
    Insert {
        source: String,
        table: String,
        columns: Vec<String>,
        /// One row of parameter expressions.
        values: Vec<SqlExpr>,
        returning: Vec<String>,
        /// Shapes the RETURNING rows; reads from the `_ins` CTE.
        select: SqlSelect,
    },
    Update {
        source: String,
        table: String,
        assignments: Vec<(String, SqlExpr)>,
        r#where: Option<SqlExpr>,
        returning: Vec<String>,
        select: SqlSelect,
    },
    Delete {
        source: String,
        table: String,
        r#where: Option<SqlExpr>,
        returning: Vec<String>,
        select: SqlSelect,
    },
}

/// The alias mutations expose their RETURNING rows under.
pub const MUTATION_CTE: &str = "_mut";

/// A rendered statement plus its positional parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedSql {
    pub text: String,
    pub params: Vec<Value>,
}

pub fn render_statement(statement: &SqlStatement, params: &[Value]) -> RenderedSql {
    let mut out = String::new();
    match statement {
        SqlStatement::Select(select) => write_select(&mut out, select),
        SqlStatement::Insert {
            source,
            table,
            columns,
            values,
            returning,
            select,
        } => {
            out.push_str(&format!(
                "WITH {MUTATION_CTE} AS (INSERT INTO {}.{} (",
                quote_ident(source),
                quote_ident(table)
            ));
            out.push_str(
                &columns
                    .iter()
                    .map(|c| quote_ident(c))
                    .collect::<Vec<_>>()
                    .join(", "),
            );
            out.push_str(") VALUES (");
            for (i, value) in values.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                write_expr(&mut out, value);
            }
            out.push(')');
            write_returning(&mut out, returning);
            out.push_str(") ");
            write_select(&mut out, select);
        }
        SqlStatement::Update {
            source,
            table,
            assignments,
            r#where,
            returning,
            select,
        } => {
            out.push_str(&format!(
                "WITH {MUTATION_CTE} AS (UPDATE {}.{} SET ",
                quote_ident(source),
                quote_ident(table)
            ));
            for (i, (column, value)) in assignments.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                out.push_str(&quote_ident(column));
                out.push_str(" = ");
                write_expr(&mut out, value);
            }
            if let Some(condition) = r#where {
                out.push_str(" WHERE ");
                write_expr(&mut out, condition);
            }
            write_returning(&mut out, returning);
            out.push_str(") ");
            write_select(&mut out, select);
        }
        SqlStatement::Delete {
            source,
            table,
            r#where,
            returning,
            select,
        } => {
            out.push_str(&format!(
                "WITH {MUTATION_CTE} AS (DELETE FROM {}.{}",
                quote_ident(source),
                quote_ident(table)
            ));
            if let Some(condition) = r#where {
                out.push_str(" WHERE ");
                write_expr(&mut out, condition);
            }
            write_returning(&mut out, returning);
            out.push_str(") ");
            write_select(&mut out, select);
        }
    }
    RenderedSql {
        text: out,
        params: params.to_vec(),
    }
}

pub fn render_select(select: &SqlSelect, params: &[Value]) -> RenderedSql {
    let mut out = String::new();
    write_select(&mut out, select);
    RenderedSql {
        text: out,
        params: params.to_vec(),
    }
}

fn write_returning(out: &mut String, returning: &[String]) {
    if !returning.is_empty() {
        out.push_str(" RETURNING ");
        out.push_str(
            &returning
                .iter()
                .map(|c| quote_ident(c))
                .collect::<Vec<_>>()
                .join(", "),
        );
    }
}

fn write_select(out: &mut String, select: &SqlSelect) {
    out.push_str("SELECT ");
    if !select.distinct_on.is_empty() {
        out.push_str("DISTINCT ON (");
        for (i, expr) in select.distinct_on.iter().enumerate() {
            if i > 0 {
                out.push_str(", ");
            }
            write_expr(out, expr);
        }
        out.push_str(") ");
    }
    for (i, (alias, expr)) in select.projection.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        write_expr(out, expr);
        out.push_str(" AS ");
        out.push_str(&quote_ident(alias));
    }
    if let Some(from) = &select.from {
        out.push_str(" FROM ");
        write_from(out, from);
    }
    for join in &select.joins {
        out.push(' ');
        out.push_str(&join.kind.to_string());
        out.push(' ');
        write_from(out, &join.from);
        out.push_str(" ON ");
        write_expr(out, &join.on);
    }
    if let Some(condition) = &select.r#where {
        out.push_str(" WHERE ");
        write_expr(out, condition);
    }
    if !select.group_by.is_empty() {
        out.push_str(" GROUP BY ");
        for (i, expr) in select.group_by.iter().enumerate() {
            if i > 0 {
                out.push_str(", ");
            }
            write_expr(out, expr);
        }
    }
    if let Some(having) = &select.having {
        out.push_str(" HAVING ");
        write_expr(out, having);
    }
    if !select.order_by.is_empty() {
        out.push_str(" ORDER BY ");
        for (i, order) in select.order_by.iter().enumerate() {
            if i > 0 {
                out.push_str(", ");
            }
            write_expr(out, &order.expr);
            if order.descending {
                out.push_str(" DESC");
            }
        }
    }
    if let Some(limit) = select.limit {
        out.push_str(&format!(" LIMIT {limit}"));
    }
    if let Some(offset) = select.offset {
        out.push_str(&format!(" OFFSET {offset}"));
    }
}

fn write_from(out: &mut String, from: &SqlFrom) {
    match from {
        SqlFrom::Table {
            source,
            name,
            alias,
        } => {
            if source.is_empty() {
                out.push_str(&quote_ident(name));
            } else {
                out.push_str(&format!("{}.{}", quote_ident(source), quote_ident(name)));
            }
            out.push_str(" AS ");
            out.push_str(&quote_ident(alias));
        }
        SqlFrom::Subquery { select, alias } => {
            out.push('(');
            write_select(out, select);
            out.push_str(") AS ");
            out.push_str(&quote_ident(alias));
        }
        SqlFrom::Function { name, args, alias } => {
            out.push_str(name);
            out.push('(');
            for (i, arg) in args.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                write_expr(out, arg);
            }
            out.push_str(") AS ");
            out.push_str(&quote_ident(alias));
        }
        SqlFrom::Union { selects, alias } => {
            out.push('(');
            for (i, select) in selects.iter().enumerate() {
                if i > 0 {
                    out.push_str(" UNION ");
                }
                write_select(out, select);
            }
            out.push_str(") AS ");
            out.push_str(&quote_ident(alias));
        }
    }
}

fn write_expr(out: &mut String, expr: &SqlExpr) {
    match expr {
        SqlExpr::Column { table, column } => {
            if table.is_empty() {
                out.push_str(&quote_ident(column));
            } else {
                out.push_str(&format!("{}.{}", quote_ident(table), quote_ident(column)));
            }
        }
        SqlExpr::Param(index) => out.push_str(&format!("${}", index + 1)),
        SqlExpr::Verbatim(text) => out.push_str(text),
        SqlExpr::Binary { left, op, right } => {
            write_expr(out, left);
            out.push(' ');
            out.push_str(&op.to_string());
            out.push(' ');
            write_expr(out, right);
        }
        SqlExpr::And(exprs) => write_logical(out, exprs, " AND "),
        SqlExpr::Or(exprs) => write_logical(out, exprs, " OR "),
        SqlExpr::Not(inner) => {
            out.push_str("NOT (");
            write_expr(out, inner);
            out.push(')');
        }
        SqlExpr::IsNull(inner) => {
            write_expr(out, inner);
            out.push_str(" IS NULL");
        }
        SqlExpr::IsNotNull(inner) => {
            write_expr(out, inner);
            out.push_str(" IS NOT NULL");
        }
        SqlExpr::InList { expr, list } => {
            write_expr(out, expr);
            out.push_str(" IN (");
            for (i, item) in list.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                write_expr(out, item);
            }
            out.push(')');
        }
        SqlExpr::Func { name, args } => {
            out.push_str(name);
            out.push('(');
            for (i, arg) in args.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                write_expr(out, arg);
            }
            out.push(')');
        }
        SqlExpr::CountStar => out.push_str("count(*)"),
        SqlExpr::Exists(select) => {
            out.push_str("EXISTS (");
            write_select(out, select);
            out.push(')');
        }
        SqlExpr::NotExists(select) => {
            out.push_str("NOT EXISTS (");
            write_select(out, select);
            out.push(')');
        }
        SqlExpr::Subquery(select) => {
            out.push('(');
            write_select(out, select);
            out.push(')');
        }
    }
}

fn write_logical(out: &mut String, exprs: &[SqlExpr], separator: &str) {
    out.push('(');
    for (i, expr) in exprs.iter().enumerate() {
        if i > 0 {
            out.push_str(separator);
        }
        write_expr(out, expr);
    }
    out.push(')');
}

pub(crate) fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json_bytes::json;

    use super::*;

    #[test]
    fn renders_filtered_sorted_paginated_select() {
        let select = SqlSelect {
            projection: vec![
                ("c0".to_owned(), SqlExpr::column("t0", "id")),
                ("c1".to_owned(), SqlExpr::column("t0", "total")),
            ],
            from: Some(SqlFrom::Table {
                source: "shop".to_owned(),
                name: "orders".to_owned(),
                alias: "t0".to_owned(),
            }),
            r#where: Some(SqlExpr::binary(
                SqlExpr::column("t0", "status"),
                BinaryOp::Eq,
                SqlExpr::Param(0),
            )),
            order_by: vec![SqlOrderBy {
                expr: SqlExpr::column("t0", "total"),
                descending: true,
            }],
            limit: Some(1),
            ..Default::default()
        };
        let rendered = render_select(&select, &[json!("pending")]);
        assert_eq!(
            rendered.text,
            "SELECT \"t0\".\"id\" AS \"c0\", \"t0\".\"total\" AS \"c1\" \
             FROM \"shop\".\"orders\" AS \"t0\" \
             WHERE \"t0\".\"status\" = $1 \
             ORDER BY \"t0\".\"total\" DESC LIMIT 1"
        );
        assert_eq!(rendered.params, vec![json!("pending")]);
    }

    #[test]
    fn renders_exists_semijoin() {
        let subquery = SqlSelect {
            projection: vec![("one".to_owned(), SqlExpr::Verbatim("1".to_owned()))],
            from: Some(SqlFrom::Table {
                source: "shop".to_owned(),
                name: "orders".to_owned(),
                alias: "t1".to_owned(),
            }),
            r#where: SqlExpr::and([
                SqlExpr::binary(
                    SqlExpr::column("t1", "customer_id"),
                    BinaryOp::Eq,
                    SqlExpr::column("t0", "id"),
                ),
                SqlExpr::binary(
                    SqlExpr::column("t1", "status"),
                    BinaryOp::Eq,
                    SqlExpr::Param(0),
                ),
            ]),
            ..Default::default()
        };
        let mut out = String::new();
        write_expr(&mut out, &SqlExpr::Exists(Box::new(subquery)));
        assert_eq!(
            out,
            "EXISTS (SELECT 1 AS \"one\" FROM \"shop\".\"orders\" AS \"t1\" \
             WHERE (\"t1\".\"customer_id\" = \"t0\".\"id\" AND \"t1\".\"status\" = $1))"
        );
    }

    #[test]
    fn renders_insert_with_returning_select() {
        let statement = SqlStatement::Insert {
            source: "shop".to_owned(),
            table: "articles".to_owned(),
            columns: vec!["title".to_owned(), "author_id".to_owned()],
            values: vec![SqlExpr::Param(0), SqlExpr::Param(1)],
            returning: vec!["id".to_owned(), "title".to_owned(), "author_id".to_owned()],
            select: SqlSelect {
                projection: vec![
                    ("c0".to_owned(), SqlExpr::column(MUTATION_CTE, "id")),
                    ("c1".to_owned(), SqlExpr::column(MUTATION_CTE, "author_id")),
                ],
                from: Some(SqlFrom::Table {
                    source: String::new(),
                    name: MUTATION_CTE.to_owned(),
                    alias: MUTATION_CTE.to_owned(),
                }),
                ..Default::default()
            },
        };
        let rendered = render_statement(&statement, &[json!("X"), json!(9)]);
        assert_eq!(
            rendered.text,
            "WITH _mut AS (INSERT INTO \"shop\".\"articles\" (\"title\", \"author_id\") \
             VALUES ($1, $2) RETURNING \"id\", \"title\", \"author_id\") \
             SELECT \"_mut\".\"id\" AS \"c0\", \"_mut\".\"author_id\" AS \"c1\" FROM \"_mut\" AS \"_mut\""
        );
    }

    #[test]
    fn identifier_quoting_escapes_quotes() {
        assert_eq!(quote_ident("weird\"name"), "\"weird\"\"name\"");
    }
}
