//! Deterministic schema assembly.
//!
//! Sources are processed in dependency order with an alphabetical tie-break,
//! documents in lexicographic path order and types in declaration order, so
//! two assemblies of the same inputs produce byte-identical schemas.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use apollo_compiler::Name;
use apollo_compiler::Node;
use apollo_compiler::Schema;
use apollo_compiler::ast::FieldDefinition;
use apollo_compiler::name;
use apollo_compiler::schema::Component;
use apollo_compiler::schema::ComponentName;
use apollo_compiler::schema::ExtendedType;
use apollo_compiler::schema::ObjectType;
use indexmap::IndexMap;
use indexmap::IndexSet;
use itertools::Itertools;
use petgraph::algo::tarjan_scc;
use petgraph::graph::DiGraph;

use crate::catalog::LoadedCatalog;
use crate::error::ErrorSink;
use crate::error::HugrError;
use crate::error::SingleHugrError;
use crate::schema::FieldMeta;
use crate::schema::FunctionBinding;
use crate::schema::FunctionMeta;
use crate::schema::ModulePath;
use crate::schema::ModuleRootKind;
use crate::schema::ObjectKind;
use crate::schema::ObjectMeta;
use crate::schema::Relation;
use crate::schema::RelationKind;
use crate::schema::RootFieldMeta;
use crate::schema::RootOperationKind;
use crate::schema::ScalarClass;
use crate::schema::SchemaMetadata;
use crate::schema::SchemaSnapshot;
use crate::schema::UniqueKey;
use crate::schema::derive;
use crate::schema::directives::KnownDirective;
use crate::source::DataSource;

/// One attached source with its loaded catalogs, ready for assembly.
#[derive(Debug, Clone)]
pub struct AttachedSource {
    pub source: DataSource,
    pub catalogs: Vec<LoadedCatalog>,
}

/// Builds a [`SchemaSnapshot`] from attached sources.
#[derive(Debug, Default)]
pub struct Assembler {
    sources: Vec<AttachedSource>,
}

impl Assembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_source(&mut self, source: DataSource, catalogs: Vec<LoadedCatalog>) -> &mut Self {
        self.sources.push(AttachedSource { source, catalogs });
        self
    }

    pub fn assemble(mut self, version: u64) -> Result<SchemaSnapshot, HugrError> {
        self.sources.retain(|s| !s.source.disabled);
        self.sources
            .sort_by(|a, b| a.source.name.cmp(&b.source.name));
        AssemblyRun::new(&self.sources).assemble(version)
    }
}

struct AssemblyRun<'a> {
    sources: &'a [AttachedSource],
    errors: ErrorSink,
    /// Final name -> owning source, for collision checks.
    owners: IndexMap<Name, String>,
    objects: IndexMap<Name, ObjectMeta>,
    functions: IndexMap<Name, FunctionMeta>,
    /// Back-relations to install once every base type is known:
    /// (target type, field name, relation).
    pending_back_relations: Vec<(Name, Name, Relation)>,
}

impl<'a> AssemblyRun<'a> {
    fn new(sources: &'a [AttachedSource]) -> Self {
        Self {
            sources,
            errors: ErrorSink::new(),
            owners: IndexMap::new(),
            objects: IndexMap::new(),
            functions: IndexMap::new(),
            pending_back_relations: Vec::new(),
        }
    }

    fn assemble(mut self, version: u64) -> Result<SchemaSnapshot, HugrError> {
        let order = self.dependency_order()?;

        // First pass: register every base table/view/cube so later sources can
        // extend and reference them.
        for idx in &order {
            self.collect_source_types(*idx);
        }
        // Second pass: extensions and back-relations, now that every base type
        // exists.
        for idx in &order {
            self.install_extensions(*idx);
        }
        self.install_back_relations();

        std::mem::take(&mut self.errors).into_result()?;

        let mut metadata = self.build_metadata();
        let (schema, roots) = build_schema(&metadata)?;
        metadata.roots = roots;
        SchemaSnapshot::new(schema, metadata, version)
    }

    /// Kahn's algorithm with an alphabetical ready-queue: dependencies first,
    /// names as tie-break. Cycles are reported through Tarjan's SCCs so the
    /// error names the whole cycle.
    fn dependency_order(&mut self) -> Result<Vec<usize>, HugrError> {
        let by_name: BTreeMap<&str, usize> = self
            .sources
            .iter()
            .enumerate()
            .map(|(idx, s)| (s.source.name.as_str(), idx))
            .collect();

        let mut dependents: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        let mut in_degree: BTreeMap<usize, usize> =
            (0..self.sources.len()).map(|i| (i, 0)).collect();
        for (idx, attached) in self.sources.iter().enumerate() {
            for dependency in attached.source.dependencies.iter().sorted() {
                match by_name.get(dependency.as_str()) {
                    Some(dep_idx) => {
                        dependents.entry(*dep_idx).or_default().push(idx);
                        *in_degree.entry(idx).or_default() += 1;
                    }
                    None => self.errors.push(SingleHugrError::UnknownDependency {
                        source_name: attached.source.name.clone(),
                        dependency: dependency.clone(),
                    }),
                }
            }
        }

        let mut ready: BTreeSet<(String, usize)> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(idx, _)| (self.sources[*idx].source.name.clone(), *idx))
            .collect();
        let mut order = Vec::with_capacity(self.sources.len());
        while let Some((_, idx)) = ready.pop_first() {
            order.push(idx);
            for dependent in dependents.remove(&idx).unwrap_or_default() {
                let degree = in_degree
                    .get_mut(&dependent)
                    .expect("every source has an in-degree entry");
                *degree -= 1;
                if *degree == 0 {
                    ready.insert((self.sources[dependent].source.name.clone(), dependent));
                }
            }
        }

        if order.len() < self.sources.len() {
            let mut graph = DiGraph::<usize, ()>::new();
            let nodes: Vec<_> = (0..self.sources.len()).map(|i| graph.add_node(i)).collect();
            for (idx, attached) in self.sources.iter().enumerate() {
                for dependency in &attached.source.dependencies {
                    if let Some(dep_idx) = by_name.get(dependency.as_str()) {
                        graph.add_edge(nodes[*dep_idx], nodes[idx], ());
                    }
                }
            }
            for scc in tarjan_scc(&graph) {
                if scc.len() > 1 {
                    let mut path: Vec<String> = scc
                        .iter()
                        .map(|n| self.sources[graph[*n]].source.name.clone())
                        .collect();
                    path.sort();
                    self.errors.push(SingleHugrError::CycleDetected { path });
                }
            }
        }
        std::mem::take(&mut self.errors).into_result()?;
        Ok(order)
    }

    fn apply_prefix(source: &DataSource, name: &str) -> String {
        if source.prefix.is_empty() {
            name.to_owned()
        } else {
            format!("{}{}", source.prefix, name)
        }
    }

    fn collect_source_types(&mut self, idx: usize) {
        let attached = &self.sources[idx];
        let source = &attached.source;
        if !source.is_valid_extension() {
            self.errors.push(SingleHugrError::InvalidConfiguration {
                message: format!(
                    "extension source \"{}\" must have an empty path and declared dependencies",
                    source.name
                ),
            });
        }

        for catalog in &attached.catalogs {
            for document in catalog.documents.values() {
                for (type_name, ty) in &document.schema.types {
                    if ty.is_built_in() {
                        continue;
                    }
                    let ExtendedType::Object(object) = ty else {
                        // Enums, inputs and scalars in catalogs do not join
                        // the data graph; columns typed by them read as
                        // strings.
                        continue;
                    };
                    if type_name == "Function" || type_name == "MutationFunction" {
                        self.collect_functions(idx, object, type_name == "MutationFunction");
                        continue;
                    }
                    let directives = match parse_type_directives(object, type_name.as_str()) {
                        Ok(directives) => directives,
                        Err(err) => {
                            for error in err.errors() {
                                self.errors.push(error.clone());
                            }
                            continue;
                        }
                    };
                    let Some(kind) = object_kind(&directives, source) else {
                        // No table directive: either an extension of a foreign
                        // type (second pass) or a plain shape.
                        continue;
                    };
                    self.register_table(idx, type_name, object, directives, kind);
                }
            }
        }
    }

    fn register_table(
        &mut self,
        idx: usize,
        original_name: &Name,
        object: &Node<ObjectType>,
        directives: Vec<KnownDirective>,
        kind: ObjectKind,
    ) {
        let source = &self.sources[idx].source;
        let final_name = match Name::new(&Self::apply_prefix(source, original_name.as_str())) {
            Ok(name) => name,
            Err(err) => {
                self.errors.push(err.into());
                return;
            }
        };
        if let Some(owner) = self.owners.get(&final_name) {
            if owner == &source.name {
                self.errors.push(SingleHugrError::DuplicateType {
                    type_name: final_name.to_string(),
                    source_name: source.name.clone(),
                });
            } else {
                self.errors.push(SingleHugrError::PrefixCollision {
                    type_name: final_name.to_string(),
                    first: owner.clone(),
                    second: source.name.clone(),
                });
            }
            return;
        }

        let mut sql_name = original_name.to_string();
        let mut module = if source.as_module {
            ModulePath::parse(&source.name)
        } else {
            ModulePath::root()
        };
        let mut soft_delete_field = None;
        let mut hypertable_time_key = None;
        let mut uniques = Vec::new();
        for directive in &directives {
            match directive {
                KnownDirective::Table { name: Some(name) }
                | KnownDirective::View { name: Some(name) } => sql_name = name.clone(),
                KnownDirective::Module { name } => module = ModulePath::parse(name),
                KnownDirective::SoftDelete { field } => {
                    soft_delete_field = Name::new(field).ok();
                }
                KnownDirective::Hypertable { time_key } => {
                    hypertable_time_key = Name::new(time_key).ok();
                }
                KnownDirective::Unique { fields, suffix } => {
                    let fields: Vec<Name> =
                        fields.iter().filter_map(|f| Name::new(f).ok()).collect();
                    let suffix = suffix
                        .clone()
                        .unwrap_or_else(|| fields.iter().map(Name::as_str).join("_"));
                    uniques.push(UniqueKey { suffix, fields });
                }
                _ => {}
            }
        }

        let mut meta = ObjectMeta {
            name: final_name.clone(),
            source: source.name.clone(),
            module,
            kind,
            sql_name,
            fields: IndexMap::new(),
            pk: Vec::new(),
            uniques,
            soft_delete_field,
            hypertable_time_key,
        };
        self.collect_table_fields(original_name, object, &mut meta, idx);

        self.owners.insert(final_name.clone(), source.name.clone());
        self.objects.insert(final_name, meta);
    }

    fn collect_table_fields(
        &mut self,
        type_name: &Name,
        object: &Node<ObjectType>,
        meta: &mut ObjectMeta,
        idx: usize,
    ) {
        for (field_name, field) in &object.fields {
            let location = format!("{type_name}.{field_name}");
            let directives = match KnownDirective::parse_all(&field.directives, &location) {
                Ok(directives) => directives,
                Err(err) => {
                    for error in err.errors() {
                        self.errors.push(error.clone());
                    }
                    continue;
                }
            };

            let inner = field.ty.inner_named_type();
            // Enum-typed columns read and filter as strings.
            let scalar =
                Some(ScalarClass::from_type_name(inner.as_str()).unwrap_or(ScalarClass::String));
            let mut field_meta = FieldMeta {
                name: field_name.clone(),
                column: field_name.to_string(),
                scalar,
                nullable: !field.ty.is_non_null(),
                has_default: false,
                relation: None,
                measurement: None,
                function: None,
            };

            for directive in &directives {
                match directive {
                    KnownDirective::Pk => meta.pk.push(field_name.clone()),
                    KnownDirective::Unique { .. } => meta.uniques.push(UniqueKey {
                        suffix: field_name.to_string(),
                        fields: vec![field_name.clone()],
                    }),
                    KnownDirective::FieldSource { name } => field_meta.column = name.clone(),
                    KnownDirective::Measurement { func } => {
                        field_meta.measurement = Some(func.clone());
                    }
                    KnownDirective::References {
                        name,
                        to,
                        source_fields,
                        target_fields,
                        back_name,
                    } => {
                        self.install_declared_relation(
                            idx,
                            meta,
                            name,
                            to,
                            source_fields,
                            target_fields,
                            back_name.as_deref(),
                        );
                    }
                    _ => {}
                }
            }
            meta.fields.insert(field_name.clone(), field_meta);
        }
    }

    /// A `@references` directive on a foreign-key column: the column itself
    /// stays a scalar field, and a relation field is added next to it.
    fn install_declared_relation(
        &mut self,
        idx: usize,
        meta: &mut ObjectMeta,
        relation_name: &str,
        to: &str,
        source_fields: &[String],
        target_fields: &[String],
        back_name: Option<&str>,
    ) {
        let source = &self.sources[idx].source;
        let target_final = Self::apply_prefix(source, to);
        let (Ok(relation_name), Ok(target)) = (Name::new(relation_name), Name::new(&target_final))
        else {
            self.errors.push(SingleHugrError::TypeNotResolvable {
                type_name: to.to_owned(),
                referenced_by: format!("{}.{relation_name}", meta.name),
            });
            return;
        };
        let source_fields: Vec<Name> = source_fields
            .iter()
            .filter_map(|f| Name::new(f).ok())
            .collect();
        let target_fields: Vec<Name> = target_fields
            .iter()
            .filter_map(|f| Name::new(f).ok())
            .collect();

        meta.fields.insert(
            relation_name.clone(),
            FieldMeta {
                name: relation_name,
                column: String::new(),
                scalar: None,
                nullable: true,
                has_default: false,
                relation: Some(Relation {
                    target: target.clone(),
                    kind: RelationKind::ManyToOne,
                    source_fields: source_fields.clone(),
                    target_fields: target_fields.clone(),
                    inner: false,
                    cross_source: false,
                }),
                measurement: None,
                function: None,
            },
        );

        if let Some(back_name) = back_name {
            if let Ok(back_name) = Name::new(back_name) {
                self.pending_back_relations.push((
                    target,
                    back_name,
                    Relation {
                        target: meta.name.clone(),
                        kind: RelationKind::OneToMany,
                        // Swapped: the back-relation joins target columns to ours.
                        source_fields: target_fields,
                        target_fields: source_fields,
                        inner: false,
                        cross_source: false,
                    },
                ));
            }
        }
    }

    fn install_back_relations(&mut self) {
        for (target, field_name, relation) in std::mem::take(&mut self.pending_back_relations) {
            if !self.objects.contains_key(&relation.target) {
                self.errors.push(SingleHugrError::TypeNotResolvable {
                    type_name: relation.target.to_string(),
                    referenced_by: format!("{target}.{field_name}"),
                });
                continue;
            }
            let Some(target_meta) = self.objects.get_mut(&target) else {
                self.errors.push(SingleHugrError::TypeNotResolvable {
                    type_name: target.to_string(),
                    referenced_by: relation.target.to_string(),
                });
                continue;
            };
            if target_meta.fields.contains_key(&field_name) {
                self.errors.push(SingleHugrError::DuplicateField {
                    type_name: target.to_string(),
                    field_name: field_name.to_string(),
                });
                continue;
            }
            target_meta.fields.insert(
                field_name.clone(),
                FieldMeta {
                    name: field_name,
                    column: String::new(),
                    scalar: None,
                    nullable: true,
                    has_default: false,
                    relation: Some(relation),
                    measurement: None,
                    function: None,
                },
            );
        }
    }

    /// Second pass: types without a table directive whose name resolves to a
    /// base type of another source are extensions; their fields join across
    /// sources or bind function calls.
    fn install_extensions(&mut self, idx: usize) {
        let attached = &self.sources[idx];
        let source = attached.source.clone();
        let mut declared_deps: BTreeSet<String> = source.dependencies.iter().cloned().collect();

        let mut extension_fields: Vec<(Name, Name, FieldMeta)> = Vec::new();
        for catalog in &attached.catalogs {
            for document in catalog.documents.values() {
                for (type_name, ty) in &document.schema.types {
                    if ty.is_built_in() {
                        continue;
                    }
                    let ExtendedType::Object(object) = ty else {
                        continue;
                    };
                    if type_name == "Function" || type_name == "MutationFunction" {
                        continue;
                    }
                    let Ok(directives) = parse_type_directives(object, type_name.as_str()) else {
                        // Reported in the first pass.
                        continue;
                    };
                    if object_kind(&directives, &source).is_some() {
                        continue;
                    }
                    for directive in &directives {
                        if let KnownDirective::Dependency { name } = directive {
                            declared_deps.insert(name.clone());
                        }
                    }

                    let Some(base_name) = self.resolve_extension_target(&source, type_name) else {
                        continue;
                    };
                    let base_source = self.owners[&base_name].clone();
                    if base_source != source.name && !declared_deps.contains(&base_source) {
                        self.errors.push(SingleHugrError::UnknownDependency {
                            source_name: source.name.clone(),
                            dependency: base_source.clone(),
                        });
                        continue;
                    }
                    for (field_name, field) in &object.fields {
                        if let Some(field_meta) =
                            self.build_extension_field(idx, &base_name, field_name, field)
                        {
                            extension_fields.push((
                                base_name.clone(),
                                field_name.clone(),
                                field_meta,
                            ));
                        }
                    }
                }
            }
        }

        for (base_name, field_name, field_meta) in extension_fields {
            let base = self
                .objects
                .get_mut(&base_name)
                .expect("extension target was resolved above");
            if base.fields.contains_key(&field_name) {
                self.errors.push(SingleHugrError::DuplicateField {
                    type_name: base_name.to_string(),
                    field_name: field_name.to_string(),
                });
                continue;
            }
            base.fields.insert(field_name, field_meta);
        }
    }

    /// An extension target is looked up first as a foreign final name, then
    /// with this source's own prefix applied.
    fn resolve_extension_target(&self, source: &DataSource, type_name: &Name) -> Option<Name> {
        if self.objects.contains_key(type_name) {
            return Some(type_name.clone());
        }
        let prefixed = Name::new(&Self::apply_prefix(source, type_name.as_str())).ok()?;
        self.objects.contains_key(&prefixed).then_some(prefixed)
    }

    fn build_extension_field(
        &mut self,
        idx: usize,
        base_name: &Name,
        field_name: &Name,
        field: &FieldDefinition,
    ) -> Option<FieldMeta> {
        let source = &self.sources[idx].source;
        let location = format!("{base_name}.{field_name}");
        let directives = match KnownDirective::parse_all(&field.directives, &location) {
            Ok(directives) => directives,
            Err(err) => {
                for error in err.errors() {
                    self.errors.push(error.clone());
                }
                return None;
            }
        };

        let inner = field.ty.inner_named_type();
        let base_source = self.owners[base_name].clone();
        for directive in &directives {
            match directive {
                KnownDirective::Join {
                    fields,
                    references,
                    inner: inner_join,
                } => {
                    let target = self.resolve_local(source, inner.as_str(), &location)?;
                    let kind = if field.ty.is_list() {
                        RelationKind::OneToMany
                    } else {
                        RelationKind::ManyToOne
                    };
                    return Some(FieldMeta {
                        name: field_name.clone(),
                        column: String::new(),
                        scalar: None,
                        nullable: true,
                        has_default: false,
                        relation: Some(Relation {
                            target,
                            kind,
                            source_fields: fields
                                .iter()
                                .filter_map(|f| Name::new(f).ok())
                                .collect(),
                            target_fields: references
                                .iter()
                                .filter_map(|f| Name::new(f).ok())
                                .collect(),
                            inner: *inner_join,
                            cross_source: source.name != base_source,
                        }),
                        measurement: None,
                        function: None,
                    });
                }
                KnownDirective::FunctionCall { name, is_table } => {
                    return Some(FieldMeta {
                        name: field_name.clone(),
                        column: String::new(),
                        scalar: ScalarClass::from_type_name(inner.as_str()),
                        nullable: true,
                        has_default: false,
                        relation: None,
                        measurement: None,
                        function: Some(FunctionBinding {
                            sql_name: name.clone(),
                            args: Vec::new(),
                            is_table: *is_table,
                        }),
                    });
                }
                KnownDirective::TableFunctionCallJoin { name, args } => {
                    let target = self.resolve_local(source, inner.as_str(), &location)?;
                    return Some(FieldMeta {
                        name: field_name.clone(),
                        column: String::new(),
                        scalar: None,
                        nullable: true,
                        has_default: false,
                        relation: Some(Relation {
                            target,
                            kind: if field.ty.is_list() {
                                RelationKind::OneToMany
                            } else {
                                RelationKind::ManyToOne
                            },
                            source_fields: Vec::new(),
                            target_fields: Vec::new(),
                            inner: false,
                            cross_source: source.name != base_source,
                        }),
                        measurement: None,
                        function: Some(FunctionBinding {
                            sql_name: name.clone(),
                            args: args.clone(),
                            is_table: true,
                        }),
                    });
                }
                _ => {}
            }
        }
        self.errors.push(SingleHugrError::UnsupportedDirective {
            directive: "<extension field without @join or @function_call>".to_owned(),
            location,
        });
        None
    }

    fn resolve_local(&mut self, source: &DataSource, name: &str, location: &str) -> Option<Name> {
        let final_name = Name::new(&Self::apply_prefix(source, name)).ok()?;
        if self.objects.contains_key(&final_name) {
            return Some(final_name);
        }
        // Fall back to an already-final name from a dependency source.
        if let Ok(as_written) = Name::new(name) {
            if self.objects.contains_key(&as_written) {
                return Some(as_written);
            }
        }
        self.errors.push(SingleHugrError::TypeNotResolvable {
            type_name: name.to_owned(),
            referenced_by: location.to_owned(),
        });
        None
    }

    fn collect_functions(&mut self, idx: usize, object: &Node<ObjectType>, is_mutation: bool) {
        let source = &self.sources[idx].source;
        let module = if source.as_module {
            ModulePath::parse(&source.name)
        } else {
            ModulePath::root()
        };
        for (field_name, field) in &object.fields {
            let location = format!(
                "{}.{field_name}",
                if is_mutation { "MutationFunction" } else { "Function" }
            );
            let directives = match KnownDirective::parse_all(&field.directives, &location) {
                Ok(directives) => directives,
                Err(err) => {
                    for error in err.errors() {
                        self.errors.push(error.clone());
                    }
                    continue;
                }
            };
            let Some(sql_name) = directives.iter().find_map(|d| match d {
                KnownDirective::FunctionCall { name, .. } => Some(name.clone()),
                _ => None,
            }) else {
                self.errors.push(SingleHugrError::UnsupportedDirective {
                    directive: "function_call".to_owned(),
                    location,
                });
                continue;
            };
            let module = directives
                .iter()
                .find_map(|d| match d {
                    KnownDirective::Module { name } => Some(ModulePath::parse(name)),
                    _ => None,
                })
                .unwrap_or_else(|| module.clone());

            let final_name = match Name::new(&Self::apply_prefix(source, field_name.as_str())) {
                Ok(name) => name,
                Err(err) => {
                    self.errors.push(err.into());
                    continue;
                }
            };
            let args = field
                .arguments
                .iter()
                .filter_map(|arg| {
                    ScalarClass::from_type_name(arg.ty.inner_named_type().as_str())
                        .map(|class| (arg.name.clone(), class))
                })
                .collect();
            let inner = field.ty.inner_named_type();
            let returns_object = if ScalarClass::from_type_name(inner.as_str()).is_none() {
                Name::new(&Self::apply_prefix(source, inner.as_str())).ok()
            } else {
                None
            };
            self.functions.insert(
                final_name.clone(),
                FunctionMeta {
                    name: final_name,
                    source: source.name.clone(),
                    module,
                    sql_name,
                    is_mutation,
                    args,
                    returns_object,
                    returns_set: field.ty.is_list(),
                },
            );
        }
    }

    fn build_metadata(&mut self) -> SchemaMetadata {
        let mut metadata = SchemaMetadata {
            objects: std::mem::take(&mut self.objects),
            roots: IndexMap::new(),
            functions: std::mem::take(&mut self.functions),
            sources: self
                .sources
                .iter()
                .map(|s| (s.source.name.clone(), s.source.kind))
                .collect(),
            modules: IndexSet::new(),
        };
        metadata.modules.insert(ModulePath::root());
        for module in metadata
            .objects
            .values()
            .map(|o| &o.module)
            .chain(metadata.functions.values().map(|f| &f.module))
        {
            for ancestor in module.ancestry() {
                metadata.modules.insert(ancestor);
            }
        }
        metadata.modules.sort();
        metadata
    }
}

type SchemaFields = Vec<(Name, Component<FieldDefinition>)>;

fn build_schema(
    metadata: &SchemaMetadata,
) -> Result<(apollo_compiler::validation::Valid<Schema>, IndexMap<String, RootFieldMeta>), HugrError>
{
    let mut roots: IndexMap<String, RootFieldMeta> = IndexMap::new();
    let mut schema = Schema::new();
    for (name, ty) in derive::core_definitions() {
        schema.types.insert(name, ty);
    }

    for meta in metadata.objects.values() {
        for ty in [
            derive::data_object(meta, &metadata.objects)?,
            derive::object_filter_input(meta),
            derive::object_list_filter_input(meta),
            derive::object_aggregations(meta),
            derive::object_bucket_key(meta),
            derive::object_bucket_aggregation(meta),
            derive::join_namespace(meta, &metadata.objects),
        ] {
            insert_type(&mut schema, ty)?;
        }
        if meta.has_geometry() {
            insert_type(
                &mut schema,
                derive::spatial_namespace(meta, &metadata.objects),
            )?;
        }
        if meta.kind.is_mutable() {
            insert_type(&mut schema, derive::insert_input(meta))?;
            insert_type(&mut schema, derive::update_input(meta))?;
            insert_type(&mut schema, derive::mutation_result(meta))?;
        }
    }

    for ty in build_module_roots(metadata, &mut roots) {
        insert_type(&mut schema, ty)?;
    }
    if metadata.has_h3_capable_source() {
        insert_type(&mut schema, h3_cell_type(metadata, &mut roots))?;
    }

    schema.schema_definition.make_mut().query = Some(ComponentName::from(name!("Query")));
    if schema.types.contains_key("Mutation") {
        schema.schema_definition.make_mut().mutation = Some(ComponentName::from(name!("Mutation")));
    }

    let valid = schema.validate()?;
    Ok((valid, roots))
}

fn build_module_roots(
    metadata: &SchemaMetadata,
    roots: &mut IndexMap<String, RootFieldMeta>,
) -> Vec<ExtendedType> {
    let mut types = Vec::new();

    for module in &metadata.modules {
        let query_name = module.root_type_name(ModuleRootKind::Query);
        let mutation_name = module.root_type_name(ModuleRootKind::Mutation);
        let mut query_fields: SchemaFields = Vec::new();
        let mut mutation_fields: SchemaFields = Vec::new();

        for meta in metadata.objects.values().filter(|o| &o.module == module) {
            add_object_roots(
                meta,
                &query_name,
                &mutation_name,
                roots,
                &mut query_fields,
                &mut mutation_fields,
            );
        }

        add_function_roots(
            metadata,
            module,
            &query_name,
            &mutation_name,
            roots,
            &mut types,
            &mut query_fields,
            &mut mutation_fields,
        );

        // Mount child modules.
        for child in metadata
            .modules
            .iter()
            .filter(|m| m.parent().as_ref() == Some(module))
        {
            let segment = child
                .last_segment()
                .expect("a child module has at least one segment");
            let Ok(segment_name) = Name::new(segment) else {
                continue;
            };
            query_fields.push(derive::output_field(
                segment_name.clone(),
                derive::non_null(&child.root_type_name(ModuleRootKind::Query)),
            ));
            roots.insert(
                format!("{query_name}.{segment}"),
                RootFieldMeta {
                    object: None,
                    kind: RootOperationKind::ModuleMount,
                    module: child.clone(),
                },
            );
            if module_has_mutations(metadata, child) {
                mutation_fields.push(derive::output_field(
                    segment_name,
                    derive::non_null(&child.root_type_name(ModuleRootKind::Mutation)),
                ));
                roots.insert(
                    format!("{mutation_name}.{segment}"),
                    RootFieldMeta {
                        object: None,
                        kind: RootOperationKind::ModuleMount,
                        module: child.clone(),
                    },
                );
            }
        }

        if module.is_root() {
            query_fields.push(derive::output_field(
                name!("_version"),
                derive::non_null("String"),
            ));
            if metadata.has_h3_capable_source() {
                query_fields.push(derive::output_field_with_args(
                    name!("h3"),
                    derive::non_null_list_of_non_null("_h3_cell"),
                    vec![
                        derive::argument(name!("resolution"), derive::non_null("Int")),
                        derive::argument(name!("inner"), derive::named("Boolean")),
                    ],
                ));
                roots.insert(
                    "Query.h3".to_owned(),
                    RootFieldMeta {
                        object: None,
                        kind: RootOperationKind::H3,
                        module: ModulePath::root(),
                    },
                );
            }
        }

        if !query_fields.is_empty() {
            types.push(derive::object(&query_name, query_fields));
        }
        if !mutation_fields.is_empty() {
            types.push(derive::object(&mutation_name, mutation_fields));
        }
    }

    types
}

#[allow(clippy::too_many_arguments)]
fn add_function_roots(
    metadata: &SchemaMetadata,
    module: &ModulePath,
    query_name: &str,
    mutation_name: &str,
    roots: &mut IndexMap<String, RootFieldMeta>,
    types: &mut Vec<ExtendedType>,
    query_fields: &mut SchemaFields,
    mutation_fields: &mut SchemaFields,
) {
    let function_name = module.root_type_name(ModuleRootKind::Function);
    let mutation_function_name = module.root_type_name(ModuleRootKind::MutationFunction);
    let mut function_fields: SchemaFields = Vec::new();
    let mut mutation_function_fields: SchemaFields = Vec::new();

    for function in metadata.functions.values().filter(|f| &f.module == module) {
        let (fields, parent, kind) = if function.is_mutation {
            (
                &mut mutation_function_fields,
                &mutation_function_name,
                RootOperationKind::MutationFunction {
                    sql_name: function.sql_name.clone(),
                },
            )
        } else {
            (
                &mut function_fields,
                &function_name,
                RootOperationKind::Function {
                    sql_name: function.sql_name.clone(),
                },
            )
        };
        let args = function
            .args
            .iter()
            .map(|(name, class)| derive::argument(name.clone(), derive::named(&class.to_string())))
            .collect();
        fields.push(derive::output_field_with_args(
            function.name.clone(),
            function_return_type(function),
            args,
        ));
        roots.insert(
            format!("{parent}.{}", function.name),
            RootFieldMeta {
                object: function.returns_object.clone(),
                kind,
                module: module.clone(),
            },
        );
    }

    if !function_fields.is_empty() {
        types.push(derive::object(&function_name, function_fields));
        query_fields.push(derive::output_field(
            name!("function"),
            derive::non_null(&function_name),
        ));
        roots.insert(
            format!("{query_name}.function"),
            RootFieldMeta {
                object: None,
                kind: RootOperationKind::ModuleMount,
                module: module.clone(),
            },
        );
    }
    if !mutation_function_fields.is_empty() {
        types.push(derive::object(
            &mutation_function_name,
            mutation_function_fields,
        ));
        mutation_fields.push(derive::output_field(
            name!("function"),
            derive::non_null(&mutation_function_name),
        ));
        roots.insert(
            format!("{mutation_name}.function"),
            RootFieldMeta {
                object: None,
                kind: RootOperationKind::ModuleMount,
                module: module.clone(),
            },
        );
    }
}

fn add_object_roots(
    meta: &ObjectMeta,
    query_name: &str,
    mutation_name: &str,
    roots: &mut IndexMap<String, RootFieldMeta>,
    query_fields: &mut SchemaFields,
    mutation_fields: &mut SchemaFields,
) {
    let module = meta.module.clone();
    let object_name = meta.name.as_str();

    query_fields.push(derive::output_field_with_args(
        meta.name.clone(),
        derive::non_null_list_of_non_null(object_name),
        derive::select_arguments(meta),
    ));
    roots.insert(
        format!("{query_name}.{object_name}"),
        RootFieldMeta {
            object: Some(meta.name.clone()),
            kind: RootOperationKind::Select,
            module: module.clone(),
        },
    );

    if !meta.pk.is_empty() {
        if let Ok(field_name) = Name::new(&format!("{object_name}_by_pk")) {
            let args = meta
                .pk
                .iter()
                .filter_map(|pk| {
                    meta.field(pk.as_str())
                        .and_then(|f| f.scalar)
                        .map(|class| derive::argument(pk.clone(), derive::non_null(&class.to_string())))
                })
                .collect();
            query_fields.push(derive::output_field_with_args(
                field_name.clone(),
                derive::named(object_name),
                args,
            ));
            roots.insert(
                format!("{query_name}.{field_name}"),
                RootFieldMeta {
                    object: Some(meta.name.clone()),
                    kind: RootOperationKind::SelectByPk,
                    module: module.clone(),
                },
            );
        }
    }

    for unique in &meta.uniques {
        let Ok(field_name) = Name::new(&format!("{object_name}_by_{}", unique.suffix)) else {
            continue;
        };
        let args = unique
            .fields
            .iter()
            .filter_map(|f| {
                meta.field(f.as_str())
                    .and_then(|f| f.scalar)
                    .map(|class| derive::argument(f.clone(), derive::non_null(&class.to_string())))
            })
            .collect();
        query_fields.push(derive::output_field_with_args(
            field_name.clone(),
            derive::named(object_name),
            args,
        ));
        roots.insert(
            format!("{query_name}.{field_name}"),
            RootFieldMeta {
                object: Some(meta.name.clone()),
                kind: RootOperationKind::SelectByUnique {
                    suffix: unique.suffix.clone(),
                },
                module: module.clone(),
            },
        );
    }

    if let Ok(field_name) = Name::new(&format!("{object_name}_aggregation")) {
        query_fields.push(derive::output_field_with_args(
            field_name.clone(),
            derive::non_null(&format!("{object_name}_aggregations")),
            vec![derive::argument(
                name!("filter"),
                derive::named(&format!("{object_name}_filter")),
            )],
        ));
        roots.insert(
            format!("{query_name}.{field_name}"),
            RootFieldMeta {
                object: Some(meta.name.clone()),
                kind: RootOperationKind::Aggregate,
                module: module.clone(),
            },
        );
    }

    if let Ok(field_name) = Name::new(&format!("{object_name}_bucket_aggregation")) {
        query_fields.push(derive::output_field_with_args(
            field_name.clone(),
            derive::non_null_list_of_non_null(&format!("{object_name}_bucket_aggregation")),
            vec![
                derive::argument(
                    name!("filter"),
                    derive::named(&format!("{object_name}_filter")),
                ),
                derive::argument(name!("order_by"), derive::list_of_non_null("OrderBy")),
                derive::argument(name!("limit"), derive::named("Int")),
                derive::argument(name!("offset"), derive::named("Int")),
            ],
        ));
        roots.insert(
            format!("{query_name}.{field_name}"),
            RootFieldMeta {
                object: Some(meta.name.clone()),
                kind: RootOperationKind::BucketAggregate,
                module: module.clone(),
            },
        );
    }

    if meta.kind.is_mutable() {
        let ops: [(&str, RootOperationKind); 3] = [
            ("insert", RootOperationKind::Insert),
            ("update", RootOperationKind::Update),
            ("delete", RootOperationKind::Delete),
        ];
        for (op, kind) in ops {
            let Ok(field_name) = Name::new(&format!("{op}_{object_name}")) else {
                continue;
            };
            let (args, return_type) = match op {
                "insert" => (
                    vec![derive::argument(
                        name!("data"),
                        derive::non_null(&format!("insert_{object_name}_input")),
                    )],
                    derive::named(object_name),
                ),
                "update" => (
                    vec![
                        derive::argument(
                            name!("filter"),
                            derive::named(&format!("{object_name}_filter")),
                        ),
                        derive::argument(
                            name!("data"),
                            derive::non_null(&format!("update_{object_name}_input")),
                        ),
                    ],
                    derive::non_null(&format!("{object_name}_mutation_result")),
                ),
                _ => (
                    vec![derive::argument(
                        name!("filter"),
                        derive::named(&format!("{object_name}_filter")),
                    )],
                    derive::non_null(&format!("{object_name}_mutation_result")),
                ),
            };
            mutation_fields.push(derive::output_field_with_args(
                field_name.clone(),
                return_type,
                args,
            ));
            roots.insert(
                format!("{mutation_name}.{field_name}"),
                RootFieldMeta {
                    object: Some(meta.name.clone()),
                    kind,
                    module: module.clone(),
                },
            );
        }
    }
}

fn parse_type_directives(
    object: &Node<ObjectType>,
    location: &str,
) -> Result<Vec<KnownDirective>, HugrError> {
    KnownDirective::parse_all(
        &object
            .directives
            .iter()
            .map(|component| component.node.clone())
            .collect::<Vec<_>>(),
        location,
    )
}

fn object_kind(directives: &[KnownDirective], source: &DataSource) -> Option<ObjectKind> {
    directives.iter().find_map(|directive| match directive {
        KnownDirective::Table { .. } => Some(ObjectKind::Table {
            read_only: source.read_only,
        }),
        KnownDirective::View { .. } => Some(ObjectKind::View),
        KnownDirective::Cube => Some(ObjectKind::Cube),
        _ => None,
    })
}

fn module_has_mutations(metadata: &SchemaMetadata, module: &ModulePath) -> bool {
    metadata
        .objects
        .values()
        .any(|o| o.kind.is_mutable() && o.module.segments().starts_with(module.segments()))
        || metadata
            .functions
            .values()
            .any(|f| f.is_mutation && f.module.segments().starts_with(module.segments()))
}

fn function_return_type(function: &FunctionMeta) -> apollo_compiler::ast::Type {
    let inner = function
        .returns_object
        .as_ref()
        .map(|o| o.to_string())
        .unwrap_or_else(|| "JSON".to_owned());
    if function.returns_set {
        derive::list_of_non_null(&inner)
    } else {
        derive::named(&inner)
    }
}

fn h3_cell_type(
    metadata: &SchemaMetadata,
    roots: &mut IndexMap<String, RootFieldMeta>,
) -> ExtendedType {
    let mut fields = vec![
        derive::output_field(name!("cell"), derive::non_null("H3Cell")),
        derive::output_field(name!("resolution"), derive::non_null("Int")),
        derive::output_field(name!("boundary"), derive::non_null("Geometry")),
    ];
    for meta in metadata.objects.values().filter(|o| o.has_geometry()) {
        fields.push(derive::output_field_with_args(
            meta.name.clone(),
            derive::non_null_list_of_non_null(meta.name.as_str()),
            vec![derive::argument(
                name!("filter"),
                derive::named(&format!("{}_filter", meta.name)),
            )],
        ));
        roots.insert(
            format!("_h3_cell.{}", meta.name),
            RootFieldMeta {
                object: Some(meta.name.clone()),
                kind: RootOperationKind::Select,
                module: ModulePath::root(),
            },
        );
        if let Ok(field_name) = Name::new(&format!("{}_aggregation", meta.name)) {
            fields.push(derive::output_field_with_args(
                field_name.clone(),
                derive::non_null(&format!("{}_aggregations", meta.name)),
                vec![derive::argument(
                    name!("filter"),
                    derive::named(&format!("{}_filter", meta.name)),
                )],
            ));
            roots.insert(
                format!("_h3_cell.{field_name}"),
                RootFieldMeta {
                    object: Some(meta.name.clone()),
                    kind: RootOperationKind::Aggregate,
                    module: ModulePath::root(),
                },
            );
        }
    }
    derive::object("_h3_cell", fields)
}

fn insert_type(schema: &mut Schema, ty: ExtendedType) -> Result<(), HugrError> {
    let name = match &ty {
        ExtendedType::Scalar(t) => t.name.clone(),
        ExtendedType::Object(t) => t.name.clone(),
        ExtendedType::Interface(t) => t.name.clone(),
        ExtendedType::Union(t) => t.name.clone(),
        ExtendedType::Enum(t) => t.name.clone(),
        ExtendedType::InputObject(t) => t.name.clone(),
    };
    if schema.types.insert(name.clone(), ty).is_some() {
        return Err(crate::internal_error!(
            "derived type \"{name}\" was generated twice"
        ));
    }
    Ok(())
}
