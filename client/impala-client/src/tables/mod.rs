//! Table lifecycle: existence checks, creation and range partition upkeep

mod coordinator;
mod registry;

pub use coordinator::{AddRangeOutcome, TableHandle, TableState};
pub use registry::TableEntry;

pub(crate) use coordinator::TableSettings;
pub(crate) use registry::{RegistryHandle, TableRegistration, TableRegistry};
