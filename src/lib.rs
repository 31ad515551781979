#![warn(
    rust_2018_idioms,
    trivial_casts,
    trivial_numeric_casts,
    unreachable_pub,
    unused_qualifications
)]

pub mod archive;
pub mod cli;
pub mod eol;
pub mod errors;
pub mod hash_tree;
pub mod loader;
pub mod objects;
pub mod params_file;
mod pipe;
pub mod replay;
pub mod revision;
pub mod svn;
pub mod working_tree;

pub(crate) type FHashMap<K, V> = std::collections::HashMap<K, V, rustc_hash::FxBuildHasher>;
