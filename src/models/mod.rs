pub mod descriptor;
pub mod inventory;
pub mod reconcile;
pub mod registry;
pub mod status;

pub use descriptor::{split_identifier, Collection, ModelDescriptor};
pub use inventory::{InstalledModel, Inventory};
pub use reconcile::{directory_size, scan_installed};
pub use registry::RecommendedModel;
pub use status::ModelStatus;
