//! Convergence engine for hash-linked collaborative object trees.
//!
//! A document's history is an [`ObjectTree`](objecttree::ObjectTree): a
//! content-addressed DAG of [`Change`](change::Change)s. Each change names its
//! parents, the ACL record that was current when it was authored, and the
//! snapshot it descends from; its payload is encrypted under the ACL's current
//! symmetric read key. Ids are CIDv1 hashes over the marshalled payload, so
//! two nodes that hold the same changes hold the same tree.
//!
//! Convergence is eventual and causal: there is no total order on changes and
//! the engine never inspects payload semantics. Incoming batches are verified,
//! attached (or parked until their parents arrive), validated against the
//! [ACL state machine](acl::AclState), and persisted; batches that descend
//! from an older snapshot trigger a rebuild from storage, and invalid batches
//! are rolled back without a trace.
//!
//! Storage is a consumed contract ([`store::TreeStorage`]); an in-memory
//! implementation backs tests and the default wiring.

pub mod acl;
pub mod builder;
pub mod change;
pub mod keychain;
pub mod keys;
pub mod objecttree;
pub mod store;
pub mod tree;
pub mod validator;

pub use self::change::{Change, ChangeId, ChangePayload, RawChange};
pub use self::keys::{AccountKeys, Author, AuthorId, EncryptionKey, EncryptionPublicKey, ReadKey};
pub use self::objecttree::{
    AddOutcome, AddResult, ObjectTree, SignableContent, TreeError, TreeUpdateListener,
};
