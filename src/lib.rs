mod bptree;
mod errors;
mod node;
mod pack;
mod paths;
mod property;
mod storage;
mod ttl;
mod volume;
mod volume_file;

pub use errors::{Result, StoreError};
pub use node::Node;
pub use property::{FromValue, PropertyValue, Value};
pub use storage::Storage;
pub use volume::Volume;
pub use volume_file::{NodeId, RecordId};
