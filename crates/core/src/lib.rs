pub mod backend;
pub mod config;
pub mod conformance;
pub mod crypto;
pub mod error;
pub mod key;
pub mod object;

pub use backend::{Encryption, ObjectStore};
pub use config::StoreConfig;
pub use error::{StoreError, StoreResult};
pub use key::KeyCodec;
pub use object::{Object, ObjectDiff, diff_listings};
