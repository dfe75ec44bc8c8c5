//! Value objects, the registry that owns them, and the typed accessor API

mod accessor;
mod object;
mod registry;
mod value;

pub use object::{ChangeHook, SyncState, ValueObject, Wait};
pub use registry::{validate_key, Registry};
pub use value::{format_pg_array, parse_pg_array, Value, ValueKind};
