//! Generation of derived schema types: shared scalar filter inputs and
//! aggregation objects, and the per-type filters, aggregations, bucket keys
//! and mutation inputs.

use apollo_compiler::Name;
use apollo_compiler::Node;
use apollo_compiler::ast::EnumValueDefinition;
use apollo_compiler::ast::FieldDefinition;
use apollo_compiler::ast::InputValueDefinition;
use apollo_compiler::ast::Type;
use apollo_compiler::name;
use apollo_compiler::schema::Component;
use apollo_compiler::schema::EnumType;
use apollo_compiler::schema::ExtendedType;
use apollo_compiler::schema::InputObjectType;
use apollo_compiler::schema::ObjectType;
use apollo_compiler::schema::ScalarType;
use indexmap::IndexMap;

use crate::error::HugrError;
use crate::schema::FieldMeta;
use crate::schema::ObjectMeta;
use crate::schema::RelationKind;
use crate::schema::ScalarClass;

pub(crate) const ROWS_COUNT_FIELD: Name = name!("_rows_count");
pub(crate) const AND_FIELD: Name = name!("_and");
pub(crate) const OR_FIELD: Name = name!("_or");
pub(crate) const NOT_FIELD: Name = name!("_not");
pub(crate) const ANY_OF_FIELD: Name = name!("any_of");
pub(crate) const ALL_OF_FIELD: Name = name!("all_of");
pub(crate) const NONE_OF_FIELD: Name = name!("none_of");

const ALL_SCALAR_CLASSES: &[ScalarClass] = &[
    ScalarClass::Int,
    ScalarClass::BigInt,
    ScalarClass::Float,
    ScalarClass::String,
    ScalarClass::Boolean,
    ScalarClass::Timestamp,
    ScalarClass::Date,
    ScalarClass::Time,
    ScalarClass::Interval,
    ScalarClass::Json,
    ScalarClass::Geometry,
    ScalarClass::IntRange,
    ScalarClass::BigIntRange,
    ScalarClass::TimestampRange,
    ScalarClass::DateRange,
];

pub(crate) fn named(name: &str) -> Type {
    Type::Named(Name::new(name).expect("derived type names are valid GraphQL names"))
}

pub(crate) fn non_null(name: &str) -> Type {
    Type::NonNullNamed(Name::new(name).expect("derived type names are valid GraphQL names"))
}

pub(crate) fn list_of_non_null(name: &str) -> Type {
    Type::List(Box::new(non_null(name)))
}

pub(crate) fn non_null_list_of_non_null(name: &str) -> Type {
    Type::NonNullList(Box::new(non_null(name)))
}

pub(crate) fn input_field(name: Name, ty: Type) -> (Name, Component<InputValueDefinition>) {
    (
        name.clone(),
        Component::new(InputValueDefinition {
            description: None,
            name,
            ty: ty.into(),
            default_value: None,
            directives: Default::default(),
        }),
    )
}

pub(crate) fn output_field(name: Name, ty: Type) -> (Name, Component<FieldDefinition>) {
    output_field_with_args(name, ty, Vec::new())
}

pub(crate) fn output_field_with_args(
    name: Name,
    ty: Type,
    arguments: Vec<Node<InputValueDefinition>>,
) -> (Name, Component<FieldDefinition>) {
    (
        name.clone(),
        Component::new(FieldDefinition {
            description: None,
            name,
            arguments,
            ty,
            directives: Default::default(),
        }),
    )
}

pub(crate) fn argument(name: Name, ty: Type) -> Node<InputValueDefinition> {
    Node::new(InputValueDefinition {
        description: None,
        name,
        ty: ty.into(),
        default_value: None,
        directives: Default::default(),
    })
}

pub(crate) fn input_object(name: &str, fields: Vec<(Name, Component<InputValueDefinition>)>) -> ExtendedType {
    ExtendedType::InputObject(Node::new(InputObjectType {
        description: None,
        name: Name::new(name).expect("derived type names are valid GraphQL names"),
        directives: Default::default(),
        fields: fields.into_iter().collect(),
    }))
}

pub(crate) fn object(name: &str, fields: Vec<(Name, Component<FieldDefinition>)>) -> ExtendedType {
    ExtendedType::Object(Node::new(ObjectType {
        description: None,
        name: Name::new(name).expect("derived type names are valid GraphQL names"),
        implements_interfaces: Default::default(),
        directives: Default::default(),
        fields: fields.into_iter().collect(),
    }))
}

/// The scalars, enums and shared inputs every assembled schema carries.
pub(crate) fn core_definitions() -> IndexMap<Name, ExtendedType> {
    let mut types = IndexMap::new();

    for scalar in [
        "BigInt",
        "Timestamp",
        "Date",
        "Time",
        "Interval",
        "JSON",
        "Geometry",
        "IntRange",
        "BigIntRange",
        "TimestampRange",
        "DateRange",
        "H3Cell",
    ] {
        let name = Name::new(scalar).expect("core scalar names are valid");
        types.insert(
            name.clone(),
            ExtendedType::Scalar(Node::new(ScalarType {
                description: None,
                name,
                directives: Default::default(),
            })),
        );
    }

    types.insert(
        name!("OrderDirection"),
        enum_type("OrderDirection", &["ASC", "DESC"]),
    );
    types.insert(
        name!("SpatialRelation"),
        enum_type(
            "SpatialRelation",
            &["CONTAINS", "INTERSECTS", "DWITHIN", "TOUCHES", "WITHIN"],
        ),
    );
    types.insert(
        name!("DateBucket"),
        enum_type(
            "DateBucket",
            &["minute", "hour", "day", "week", "month", "quarter", "year"],
        ),
    );

    types.insert(
        name!("OrderBy"),
        input_object(
            "OrderBy",
            vec![
                input_field(name!("field"), non_null("String")),
                input_field(name!("direction"), named("OrderDirection")),
            ],
        ),
    );

    for class in ALL_SCALAR_CLASSES {
        let filter = scalar_filter_input(*class);
        let filter_name =
            Name::new(&class.filter_input_name()).expect("filter input names are valid");
        types.insert(filter_name, filter);

        let aggregation = scalar_aggregation_object(*class);
        let aggregation_name =
            Name::new(&class.aggregation_type_name()).expect("aggregation type names are valid");
        types.insert(aggregation_name, aggregation);
    }

    types
}

pub(crate) fn enum_type(name: &str, values: &[&str]) -> ExtendedType {
    ExtendedType::Enum(Node::new(EnumType {
        description: None,
        name: Name::new(name).expect("enum names are valid"),
        directives: Default::default(),
        values: values
            .iter()
            .map(|value| {
                let value_name = Name::new(value).expect("enum value names are valid");
                (
                    value_name.clone(),
                    Component::new(EnumValueDefinition {
                        description: None,
                        value: value_name,
                        directives: Default::default(),
                    }),
                )
            })
            .collect(),
    }))
}

/// The filter input for one scalar class, e.g. `String_filter_input` with
/// `eq, in, like, ilike, regex, is_null`.
fn scalar_filter_input(class: ScalarClass) -> ExtendedType {
    let scalar = class.to_string();
    let mut fields = vec![
        input_field(name!("eq"), named(&scalar)),
        input_field(name!("in"), list_of_non_null(&scalar)),
        input_field(name!("is_null"), named("Boolean")),
    ];
    if class.is_numeric() || class.is_temporal() || class == ScalarClass::Interval {
        fields.extend([
            input_field(name!("gt"), named(&scalar)),
            input_field(name!("gte"), named(&scalar)),
            input_field(name!("lt"), named(&scalar)),
            input_field(name!("lte"), named(&scalar)),
        ]);
    }
    match class {
        ScalarClass::String => {
            fields.extend([
                input_field(name!("like"), named("String")),
                input_field(name!("ilike"), named("String")),
                input_field(name!("regex"), named("String")),
            ]);
        }
        ScalarClass::Json => {
            fields.extend([
                input_field(name!("has"), named("String")),
                input_field(name!("has_all"), list_of_non_null("String")),
                input_field(name!("contains"), named("JSON")),
            ]);
        }
        ScalarClass::Geometry => {
            fields.extend([
                input_field(name!("intersects"), named("Geometry")),
                input_field(name!("contains"), named("Geometry")),
            ]);
        }
        _ if class.is_range() => {
            fields.extend([
                input_field(name!("upper"), named(&range_element(class))),
                input_field(name!("lower"), named(&range_element(class))),
                input_field(name!("upper_inf"), named("Boolean")),
                input_field(name!("lower_inf"), named("Boolean")),
                input_field(name!("upper_inclusive"), named("Boolean")),
                input_field(name!("lower_inclusive"), named("Boolean")),
                input_field(name!("intersects"), named(&scalar)),
                input_field(name!("includes"), named(&range_element(class))),
            ]);
        }
        _ => {}
    }
    input_object(&class.filter_input_name(), fields)
}

fn range_element(class: ScalarClass) -> String {
    match class {
        ScalarClass::IntRange => "Int",
        ScalarClass::BigIntRange => "BigInt",
        ScalarClass::TimestampRange => "Timestamp",
        ScalarClass::DateRange => "Date",
        _ => "Int",
    }
    .to_owned()
}

/// The aggregation object for one scalar class, e.g. `Float_aggregation`
/// offering `sum/avg/min/max/count/list/any/last`.
fn scalar_aggregation_object(class: ScalarClass) -> ExtendedType {
    let scalar = class.to_string();
    let mut fields = vec![output_field(name!("count"), non_null("BigInt"))];
    match class {
        _ if class.is_numeric() => {
            fields.extend([
                output_field(name!("sum"), named(&scalar)),
                output_field(name!("avg"), named("Float")),
                output_field(name!("min"), named(&scalar)),
                output_field(name!("max"), named(&scalar)),
            ]);
        }
        ScalarClass::String => {
            fields.extend([
                output_field_with_args(
                    name!("string_agg"),
                    named("String"),
                    vec![argument(name!("separator"), named("String"))],
                ),
                output_field(name!("min"), named("String")),
                output_field(name!("max"), named("String")),
            ]);
        }
        ScalarClass::Boolean => {
            fields.extend([
                output_field(name!("bool_and"), named("Boolean")),
                output_field(name!("bool_or"), named("Boolean")),
            ]);
        }
        ScalarClass::Geometry => {
            fields.extend([
                output_field(name!("union"), named("Geometry")),
                output_field(name!("intersection"), named("Geometry")),
                output_field(name!("extent"), named("Geometry")),
            ]);
        }
        ScalarClass::Json => {
            // Path-parameterized: aggregate the value at a JSON path.
            for func in [name!("sum"), name!("min"), name!("max")] {
                fields.push(output_field_with_args(
                    func,
                    named("JSON"),
                    vec![argument(name!("path"), non_null("String"))],
                ));
            }
        }
        _ if class.is_temporal() || class == ScalarClass::Interval => {
            fields.extend([
                output_field(name!("min"), named(&scalar)),
                output_field(name!("max"), named(&scalar)),
            ]);
        }
        _ => {}
    }
    if !matches!(class, ScalarClass::Geometry) {
        fields.extend([
            output_field(name!("list"), list_of_non_null(&scalar)),
            output_field(name!("any"), named(&scalar)),
            output_field(name!("last"), named(&scalar)),
        ]);
    }
    object(&class.aggregation_type_name(), fields)
}

/// `<T>_filter`: scalar fields use their class filter input, many-to-one
/// relations nest the target filter, one-to-many relations use the target's
/// list filter with quantifiers, and `_and/_or/_not` compose.
pub(crate) fn object_filter_input(meta: &ObjectMeta) -> ExtendedType {
    let filter_name = format!("{}_filter", meta.name);
    let mut fields = Vec::new();
    for field in meta.fields.values() {
        if let Some(scalar) = field.scalar {
            fields.push(input_field(
                field.name.clone(),
                named(&scalar.filter_input_name()),
            ));
        } else if let Some(relation) = &field.relation {
            let target_filter = match relation.kind {
                RelationKind::ManyToOne => format!("{}_filter", relation.target),
                RelationKind::OneToMany => format!("{}_list_filter", relation.target),
            };
            fields.push(input_field(field.name.clone(), named(&target_filter)));
        }
    }
    fields.extend([
        input_field(AND_FIELD, list_of_non_null(&filter_name)),
        input_field(OR_FIELD, list_of_non_null(&filter_name)),
        input_field(NOT_FIELD, named(&filter_name)),
    ]);
    input_object(&filter_name, fields)
}

/// `<T>_list_filter`: quantified filters for one-to-many relation fields.
pub(crate) fn object_list_filter_input(meta: &ObjectMeta) -> ExtendedType {
    let filter_name = format!("{}_filter", meta.name);
    input_object(
        &format!("{}_list_filter", meta.name),
        vec![
            input_field(ANY_OF_FIELD, named(&filter_name)),
            input_field(ALL_OF_FIELD, named(&filter_name)),
            input_field(NONE_OF_FIELD, named(&filter_name)),
        ],
    )
}

/// `<T>_aggregations`: `_rows_count` plus per-field aggregation objects and
/// sub-aggregations over one-to-many relations.
pub(crate) fn object_aggregations(meta: &ObjectMeta) -> ExtendedType {
    let mut fields = vec![output_field(ROWS_COUNT_FIELD, non_null("BigInt"))];
    for field in meta.fields.values() {
        if let Some(scalar) = field.scalar {
            fields.push(output_field(
                field.name.clone(),
                named(&scalar.aggregation_type_name()),
            ));
        } else if let Some(relation) = &field.relation {
            if relation.kind == RelationKind::OneToMany {
                fields.push(output_field_with_args(
                    field.name.clone(),
                    named(&format!("{}_aggregations", relation.target)),
                    vec![argument(
                        name!("filter"),
                        named(&format!("{}_filter", relation.target)),
                    )],
                ));
            }
        }
    }
    object(&format!("{}_aggregations", meta.name), fields)
}

/// `<T>_bucket_aggregation_key`: dimension fields; temporal dimensions take
/// `bucket` / `bucket_interval` arguments.
pub(crate) fn object_bucket_key(meta: &ObjectMeta) -> ExtendedType {
    let mut fields = Vec::new();
    for field in meta.dimension_fields() {
        let scalar = field.scalar.expect("dimension fields are scalar");
        if matches!(scalar, ScalarClass::Timestamp | ScalarClass::Date) {
            fields.push(output_field_with_args(
                field.name.clone(),
                named(&scalar.to_string()),
                vec![
                    argument(name!("bucket"), named("DateBucket")),
                    argument(name!("bucket_interval"), named("String")),
                ],
            ));
        } else {
            fields.push(output_field(field.name.clone(), named(&scalar.to_string())));
        }
    }
    object(&format!("{}_bucket_aggregation_key", meta.name), fields)
}

/// `<T>_bucket_aggregation`: one row per group.
pub(crate) fn object_bucket_aggregation(meta: &ObjectMeta) -> ExtendedType {
    object(
        &format!("{}_bucket_aggregation", meta.name),
        vec![
            output_field(
                name!("key"),
                non_null(&format!("{}_bucket_aggregation_key", meta.name)),
            ),
            output_field(
                name!("aggregations"),
                non_null(&format!("{}_aggregations", meta.name)),
            ),
        ],
    )
}

/// `insert_<T>_input`: non-null fields without a default are required.
/// Primary key columns stay optional since the source may generate them.
pub(crate) fn insert_input(meta: &ObjectMeta) -> ExtendedType {
    let fields = meta
        .fields
        .values()
        .filter(|f| f.is_scalar())
        .map(|field| {
            let scalar = field.scalar.expect("just filtered to scalar fields");
            let required =
                !field.nullable && !field.has_default && !meta.pk.contains(&field.name);
            let ty = if required {
                non_null(&scalar.to_string())
            } else {
                named(&scalar.to_string())
            };
            input_field(field.name.clone(), ty)
        })
        .collect();
    input_object(&format!("insert_{}_input", meta.name), fields)
}

/// `update_<T>_input`: every scalar field optional.
pub(crate) fn update_input(meta: &ObjectMeta) -> ExtendedType {
    let fields = meta
        .fields
        .values()
        .filter(|f| f.is_scalar())
        .map(|field| {
            let scalar = field.scalar.expect("just filtered to scalar fields");
            input_field(field.name.clone(), named(&scalar.to_string()))
        })
        .collect();
    input_object(&format!("update_{}_input", meta.name), fields)
}

/// `<T>_mutation_result`: affected rows plus the RETURNING shape.
pub(crate) fn mutation_result(meta: &ObjectMeta) -> ExtendedType {
    object(
        &format!("{}_mutation_result", meta.name),
        vec![
            output_field(name!("affected_rows"), non_null("BigInt")),
            output_field(
                name!("returning"),
                non_null_list_of_non_null(meta.name.as_str()),
            ),
        ],
    )
}

/// `<T>_join`: the ad-hoc join namespace — one field per queryable object,
/// matched by field-equality lists on both sides.
pub(crate) fn join_namespace(
    meta: &ObjectMeta,
    all_objects: &IndexMap<Name, ObjectMeta>,
) -> ExtendedType {
    let mut fields = Vec::new();
    for other in all_objects.values() {
        fields.push(output_field_with_args(
            other.name.clone(),
            list_of_non_null(other.name.as_str()),
            vec![
                argument(name!("fields"), non_null_list_of_non_null("String")),
                argument(name!("filter"), named(&format!("{}_filter", other.name))),
                argument(name!("inner"), named("Boolean")),
                argument(name!("nested_limit"), named("Int")),
                argument(name!("nested_offset"), named("Int")),
            ],
        ));
        fields.push(output_field_with_args(
            Name::new(&format!("{}_aggregation", other.name))
                .expect("aggregation field names are valid"),
            named(&format!("{}_aggregations", other.name)),
            vec![
                argument(name!("fields"), non_null_list_of_non_null("String")),
                argument(name!("filter"), named(&format!("{}_filter", other.name))),
            ],
        ));
    }
    object(&format!("{}_join", meta.name), fields)
}

/// `<T>_spatial`: the spatial join namespace over geometry-bearing objects.
pub(crate) fn spatial_namespace(
    meta: &ObjectMeta,
    all_objects: &IndexMap<Name, ObjectMeta>,
) -> ExtendedType {
    let mut fields = Vec::new();
    for other in all_objects.values().filter(|o| o.has_geometry()) {
        fields.push(output_field_with_args(
            other.name.clone(),
            list_of_non_null(other.name.as_str()),
            vec![
                argument(name!("field"), non_null("String")),
                argument(name!("filter"), named(&format!("{}_filter", other.name))),
                argument(name!("inner"), named("Boolean")),
                argument(name!("nested_limit"), named("Int")),
                argument(name!("nested_offset"), named("Int")),
            ],
        ));
    }
    object(&format!("{}_spatial", meta.name), fields)
}

/// The selectable object type for `T` itself: declared fields plus relation
/// arguments, `_join` and (for geometry-bearing types) `_spatial`.
pub(crate) fn data_object(
    meta: &ObjectMeta,
    all_objects: &IndexMap<Name, ObjectMeta>,
) -> Result<ExtendedType, HugrError> {
    let mut fields = Vec::new();
    for field in meta.fields.values() {
        fields.push(data_field(meta, field)?);
    }
    fields.push(output_field_with_args(
        name!("_join"),
        named(&format!("{}_join", meta.name)),
        vec![argument(name!("fields"), non_null_list_of_non_null("String"))],
    ));
    if all_objects.values().any(|o| o.has_geometry()) && meta.has_geometry() {
        fields.push(output_field_with_args(
            name!("_spatial"),
            named(&format!("{}_spatial", meta.name)),
            vec![
                argument(name!("field"), non_null("String")),
                argument(name!("type"), non_null("SpatialRelation")),
                argument(name!("buffer"), named("Float")),
            ],
        ));
    }
    Ok(object(meta.name.as_str(), fields))
}

fn data_field(
    meta: &ObjectMeta,
    field: &FieldMeta,
) -> Result<(Name, Component<FieldDefinition>), HugrError> {
    if let Some(scalar) = field.scalar {
        let ty = if field.nullable {
            named(&scalar.to_string())
        } else {
            non_null(&scalar.to_string())
        };
        return Ok(output_field(field.name.clone(), ty));
    }
    let relation = field.relation.as_ref().ok_or_else(|| {
        crate::internal_error!(
            "field \"{}.{}\" is neither scalar nor relation",
            meta.name,
            field.name
        )
    })?;
    Ok(match relation.kind {
        RelationKind::ManyToOne => output_field_with_args(
            field.name.clone(),
            named(relation.target.as_str()),
            vec![argument(
                name!("filter"),
                named(&format!("{}_filter", relation.target)),
            )],
        ),
        RelationKind::OneToMany => output_field_with_args(
            field.name.clone(),
            list_of_non_null(relation.target.as_str()),
            vec![
                argument(
                    name!("filter"),
                    named(&format!("{}_filter", relation.target)),
                ),
                argument(name!("order_by"), list_of_non_null("OrderBy")),
                argument(name!("nested_limit"), named("Int")),
                argument(name!("nested_offset"), named("Int")),
                argument(name!("with_deleted"), named("Boolean")),
            ],
        ),
    })
}

/// Arguments of the generated list query for `T`.
pub(crate) fn select_arguments(meta: &ObjectMeta) -> Vec<Node<InputValueDefinition>> {
    let mut args = vec![
        argument(name!("filter"), named(&format!("{}_filter", meta.name))),
        argument(name!("order_by"), list_of_non_null("OrderBy")),
        argument(name!("limit"), named("Int")),
        argument(name!("offset"), named("Int")),
        argument(name!("distinct_on"), list_of_non_null("String")),
    ];
    if meta.soft_delete_field.is_some() {
        args.push(argument(name!("with_deleted"), named("Boolean")));
    }
    args
}

