//! Database access for famtree-ingest
//!
//! The pool itself is opened by `famtree_common::db::init_database`; this
//! module holds the import service's queries.

pub mod sessions;
pub mod settings;
pub mod tree_store;

pub use sessions::SqliteSessionBackend;
pub use tree_store::{
    IndividualFieldUpdate, NewIndividual, NewRelationship, SqliteTreeStore, StoredIndividual, TreeStore,
    TreeTransaction,
};
