//! Dependency ordering for pre-data objects
//!
//! Linearizes relations, views, functions and types so that every object is
//! emitted after the objects it depends on.

use std::collections::{HashMap, VecDeque};

use tracing::debug;

use crate::catalog::{CatalogObject, Function, ObjectType, Relation, TypeDef, View};
use crate::errors::{BackupError, Result};

/// An object that takes part in dependency ordering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sortable {
    Relation(Relation),
    View(View),
    Function(Function),
    Type(TypeDef),
}

impl Sortable {
    pub fn fqn(&self) -> String {
        match self {
            Sortable::Relation(r) => r.fqn(),
            Sortable::View(v) => v.fqn(),
            Sortable::Function(f) => f.fqn(),
            Sortable::Type(t) => t.fqn(),
        }
    }

    pub fn dependencies(&self) -> &[String] {
        match self {
            Sortable::Relation(r) => &r.dependencies,
            Sortable::View(v) => &v.dependencies,
            Sortable::Function(f) => &f.dependencies,
            Sortable::Type(t) => &t.dependencies,
        }
    }

    pub fn catalog_object(&self) -> CatalogObject {
        match self {
            Sortable::Relation(r) => r.catalog_object(),
            Sortable::View(v) => CatalogObject::new(ObjectType::View, &v.schema, &v.name, v.oid),
            Sortable::Function(f) => {
                CatalogObject::new(ObjectType::Function, &f.schema, &f.name, f.oid)
                    .with_reference(&f.arguments)
            }
            Sortable::Type(t) => CatalogObject::new(ObjectType::Type, &t.schema, &t.name, t.oid),
        }
    }
}

/// Orders `objects` so each one follows all of its dependencies present in the input.
///
/// Objects that become ready together keep their input order. Dependencies on
/// names outside the input are treated as satisfied. A cycle is an error naming
/// every object that could not be placed.
pub fn topological_sort(objects: Vec<Sortable>) -> Result<Vec<Sortable>> {
    let names: Vec<String> = objects.iter().map(Sortable::fqn).collect();

    let mut by_name: HashMap<&str, Vec<usize>> = HashMap::new();
    for (index, name) in names.iter().enumerate() {
        by_name.entry(name.as_str()).or_default().push(index);
    }

    let mut in_degree = vec![0usize; objects.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); objects.len()];
    for (index, object) in objects.iter().enumerate() {
        for dependency in object.dependencies() {
            if let Some(providers) = by_name.get(dependency.as_str()) {
                for &provider in providers {
                    in_degree[index] += 1;
                    dependents[provider].push(index);
                }
            }
        }
    }

    let mut queue: VecDeque<usize> = (0..objects.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(objects.len());

    while let Some(index) = queue.pop_front() {
        order.push(index);
        // Built in input order, so simultaneous readiness keeps original order
        for &dependent in &dependents[index] {
            in_degree[dependent] -= 1;
            if in_degree[dependent] == 0 {
                queue.push_back(dependent);
            }
        }
    }

    if order.len() != objects.len() {
        let stuck: Vec<String> = (0..objects.len())
            .filter(|&i| in_degree[i] > 0)
            .map(|i| names[i].clone())
            .collect();
        return Err(BackupError::DependencyCycle(stuck));
    }

    debug!("Sorted {} objects by dependency", order.len());

    let mut slots: Vec<Option<Sortable>> = objects.into_iter().map(Some).collect();
    Ok(order
        .into_iter()
        .filter_map(|index| slots[index].take())
        .collect())
}
