pub mod bitmap;
pub mod error;
pub mod hostlist;
pub mod node;
pub mod pack;
pub mod protocol;
pub mod resources;

#[cfg(test)]
pub(crate) mod tests;

pub use crate::bitmap::Bitmap;
pub use crate::node::{CoreLayout, NodeRecord, NodeTable};
pub use crate::resources::{CrType, JobResources, NodeReq};

pub type Error = error::JrError;
pub type Result<T> = std::result::Result<T, Error>;

pub type Map<K, V> = hashbrown::HashMap<K, V, fxhash::FxBuildHasher>;
