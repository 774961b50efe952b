//! Generic persistence over JSON-document entity tables.
//!
//! Entities opt into capabilities (soft delete, audit logging) through
//! their [`EntityDescriptor`]; [`Repository`] provides the CRUD, query
//! and bulk surface, and [`UnitOfWork`] spans several repositories over
//! one transaction with savepoint support.

mod audit;
mod cache;
mod entity;
#[allow(clippy::module_inception)]
mod repository;
mod unit_of_work;

pub use audit::{AuditAction, AuditContext, AuditEntry, entries_for, purge_older_than};
pub use cache::StateCache;
pub use entity::{Entity, EntityDescriptor, Stored};
pub use repository::{Filters, Page, Repository};
pub use unit_of_work::{Savepoint, UnitOfWork};
