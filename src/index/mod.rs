//! On-disk index collaborators.
//!
//! The index manager drives these as opaque batch components: the
//! [`DataStore`] collects raw vectors during uploads, the builder turns a
//! datastore into a queryable `.idx` file, and the [`IndexReader`] answers
//! k-NN queries through a shared [`DiskCache`].

pub mod builder;
pub mod datastore;
pub mod diskcache;
pub mod distance;
pub mod reader;

pub use builder::build_index;
pub use datastore::DataStore;
pub use diskcache::DiskCache;
pub use distance::Distance;
pub use reader::IndexReader;
