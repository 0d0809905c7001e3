//! Shaping flat row streams into nested GraphQL response JSON.
//!
//! Rows arrive as handle-keyed maps. Object levels group rows by their
//! identity handles in encounter order; nullable objects collapse to `null`
//! when nothing below them resolved.

use indexmap::IndexMap;
use serde_json_bytes::ByteString;
use serde_json_bytes::Map;
use serde_json_bytes::Value;

use crate::query_plan::ObjectShape;
use crate::query_plan::ShapeNode;

/// One flat result row: projection handle to cell value.
pub type Row = Map<ByteString, Value>;

/// Shapes the rows of one root statement into its response value.
pub fn shape_rows(shape: &ShapeNode, rows: &[Row]) -> Value {
    let row_refs: Vec<&Row> = rows.iter().collect();
    shape_node(shape, &row_refs)
}

fn shape_node(shape: &ShapeNode, rows: &[&Row]) -> Value {
    match shape {
        ShapeNode::Constant { value } => value.clone(),
        ShapeNode::Scalar { handle } => rows
            .first()
            .and_then(|row| row.get(handle.as_str()))
            .cloned()
            .unwrap_or(Value::Null),
        ShapeNode::Object(object) => shape_object(object, rows),
        ShapeNode::List(object) => shape_list(object, rows),
    }
}

fn shape_list(object: &ObjectShape, rows: &[&Row]) -> Value {
    let mut groups: IndexMap<String, Vec<&Row>> = IndexMap::new();
    for row in rows {
        let Some(key) = group_key(object, row) else {
            // No identity resolved: the joined side produced no row.
            continue;
        };
        groups.entry(key).or_default().push(row);
    }
    Value::Array(
        groups
            .values()
            .map(|group| shape_object(object, group))
            .collect(),
    )
}

fn shape_object(object: &ObjectShape, rows: &[&Row]) -> Value {
    let Some(first) = rows.first() else {
        return Value::Null;
    };
    if object.nullable && !object_resolved(object, first) {
        return Value::Null;
    }
    let mut out = Map::new();
    for (response_key, field) in &object.fields {
        out.insert(
            ByteString::from(response_key.clone()),
            shape_node(field, rows),
        );
    }
    Value::Object(out)
}

/// The grouping key of one row at an object level, or `None` when the level
/// did not resolve for this row.
fn group_key(object: &ObjectShape, row: &Row) -> Option<String> {
    let handles: Vec<&String> = if object.key.is_empty() {
        object.subtree_handles()
    } else {
        object.key.iter().collect()
    };
    let mut any_present = false;
    let mut key = String::new();
    for handle in handles {
        let value = row.get(handle.as_str()).cloned().unwrap_or(Value::Null);
        if !value.is_null() {
            any_present = true;
        }
        key.push_str(&value.to_string());
        key.push('\u{1f}');
    }
    any_present.then_some(key)
}

/// A nullable object resolves iff any projected column below it is non-null.
fn object_resolved(object: &ObjectShape, row: &Row) -> bool {
    object
        .subtree_handles()
        .iter()
        .any(|handle| row.get(handle.as_str()).is_some_and(|v| !v.is_null()))
}

/// Nests per-root response values by their module-mount paths into the final
/// `data` object.
pub fn assemble_response(values: Vec<(Vec<String>, Value)>) -> Value {
    let mut data = Map::new();
    for (path, value) in values {
        insert_at_path(&mut data, &path, value);
    }
    Value::Object(data)
}

fn insert_at_path(target: &mut Map<ByteString, Value>, path: &[String], value: Value) {
    match path {
        [] => {}
        [leaf] => {
            target.insert(ByteString::from(leaf.clone()), value);
        }
        [head, rest @ ..] => {
            let entry = target
                .entry(ByteString::from(head.clone()))
                .or_insert_with(|| Value::Object(Map::new()));
            if let Value::Object(nested) = entry {
                insert_at_path(nested, rest, value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json_bytes::json;

    use super::*;
    use crate::query_plan::ObjectShape;

    fn row(pairs: &[(&str, Value)]) -> Row {
        pairs
            .iter()
            .map(|(k, v)| (ByteString::from(k.to_owned()), v.clone()))
            .collect()
    }

    fn scalar(handle: &str) -> ShapeNode {
        ShapeNode::Scalar {
            handle: handle.to_owned(),
        }
    }

    #[test]
    fn shapes_flat_list() {
        let shape = ShapeNode::List(ObjectShape {
            key: vec!["c0".to_owned()],
            fields: [
                ("id".to_owned(), scalar("c0")),
                ("total".to_owned(), scalar("c1")),
            ]
            .into_iter()
            .collect(),
            nullable: false,
        });
        let rows = vec![
            row(&[("c0", json!(3)), ("c1", json!(200.0))]),
        ];
        assert_eq!(
            shape_rows(&shape, &rows),
            json!([{"id": 3, "total": 200.0}])
        );
    }

    #[test]
    fn groups_child_rows_under_parent() {
        // customers(id) -> orders(id, status), joined flat.
        let shape = ShapeNode::List(ObjectShape {
            key: vec!["c0".to_owned()],
            fields: [
                ("id".to_owned(), scalar("c0")),
                (
                    "orders".to_owned(),
                    ShapeNode::List(ObjectShape {
                        key: vec!["c1".to_owned()],
                        fields: [
                            ("id".to_owned(), scalar("c1")),
                            ("status".to_owned(), scalar("c2")),
                        ]
                        .into_iter()
                        .collect(),
                        nullable: true,
                    }),
                ),
            ]
            .into_iter()
            .collect(),
            nullable: false,
        });
        let rows = vec![
            row(&[("c0", json!(1)), ("c1", json!(10)), ("c2", json!("pending"))]),
            row(&[("c0", json!(1)), ("c1", json!(11)), ("c2", json!("done"))]),
            row(&[("c0", json!(2)), ("c1", Value::Null), ("c2", Value::Null)]),
        ];
        assert_eq!(
            shape_rows(&shape, &rows),
            json!([
                {"id": 1, "orders": [
                    {"id": 10, "status": "pending"},
                    {"id": 11, "status": "done"},
                ]},
                {"id": 2, "orders": []},
            ])
        );
    }

    #[test]
    fn nullable_object_collapses_when_unresolved() {
        let shape = ShapeNode::List(ObjectShape {
            key: vec!["c0".to_owned()],
            fields: [
                ("id".to_owned(), scalar("c0")),
                (
                    "customer".to_owned(),
                    ShapeNode::Object(ObjectShape {
                        key: vec!["c1".to_owned()],
                        fields: [("name".to_owned(), scalar("c2"))].into_iter().collect(),
                        nullable: true,
                    }),
                ),
            ]
            .into_iter()
            .collect(),
            nullable: false,
        });
        let rows = vec![row(&[
            ("c0", json!(7)),
            ("c1", Value::Null),
            ("c2", Value::Null),
        ])];
        assert_eq!(
            shape_rows(&shape, &rows),
            json!([{"id": 7, "customer": null}])
        );
    }

    #[test]
    fn duplicate_parent_rows_collapse() {
        let shape = ShapeNode::List(ObjectShape {
            key: vec!["c0".to_owned()],
            fields: [("id".to_owned(), scalar("c0"))].into_iter().collect(),
            nullable: false,
        });
        let rows = vec![
            row(&[("c0", json!(1))]),
            row(&[("c0", json!(1))]),
            row(&[("c0", json!(2))]),
        ];
        assert_eq!(shape_rows(&shape, &rows), json!([{"id": 1}, {"id": 2}]));
    }

    #[test]
    fn assembles_module_mounted_roots() {
        let response = assemble_response(vec![
            (
                vec!["crm".to_owned(), "customers".to_owned()],
                json!([{"id": 1}]),
            ),
            (vec!["_version".to_owned()], json!("3:abc")),
        ]);
        assert_eq!(
            response,
            json!({"crm": {"customers": [{"id": 1}]}, "_version": "3:abc"})
        );
    }
}
