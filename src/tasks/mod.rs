//! Task registration and the namespace tree
//!
//! Tasks are registered into a [`collection::CollectionBuilder`], which may nest further
//! builders as sub-collections. Freezing the builder validates the whole tree at once:
//! default tasks, pre/post references and the absence of cycles. The frozen
//! [`collection::Collection`] is read-only and answers dotted-path lookups.

pub mod collection;
pub mod command;
pub mod params;
pub mod task;

pub use collection::{Collection, CollectionBuilder, CollectionError, LookupError, MatchPolicy, TaskRef};
pub use params::{Arguments, ParamKind, Parameter, Value};
pub use task::{Task, TaskBody, TaskFailure, TaskOutput};
