//! Project scoping for entity queries.
//!
//! A [`ProjectScope`] injects a mandatory `project_id` predicate into every
//! query it is applied to, preventing cross-project access. Loads without a
//! scope are the privileged path and are reserved for the worker loops that
//! operate across projects.

use sea_orm::{ColumnTrait, EntityTrait, QueryFilter, Select};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProjectScope {
    project_id: Uuid,
}

impl ProjectScope {
    pub fn new(project_id: Uuid) -> Self {
        Self { project_id }
    }

    pub fn project_id(&self) -> Uuid {
        self.project_id
    }

    /// Adds the scope predicate to a select, given the entity's project id
    /// column.
    pub fn apply<E, C>(&self, select: Select<E>, project_column: C) -> Select<E>
    where
        E: EntityTrait,
        C: ColumnTrait,
    {
        select.filter(project_column.eq(self.project_id))
    }

    /// Checks that a loaded row belongs to this scope.
    pub fn contains(&self, project_id: Uuid) -> bool {
        self.project_id == project_id
    }
}

/// Applies an optional scope to a select.
pub fn apply_scope<E, C>(
    select: Select<E>,
    scope: Option<&ProjectScope>,
    project_column: C,
) -> Select<E>
where
    E: EntityTrait,
    C: ColumnTrait,
{
    match scope {
        Some(scope) => scope.apply(select, project_column),
        None => select,
    }
}
