pub mod error;
pub mod json_bridge;
pub mod paths;
pub mod registry;
pub mod schema;
pub mod store;

pub use error::{Result, StoreError};
pub use json_bridge::{audit_export_file, read_export};
pub use paths::{default_base_dir, default_config_path, default_ledger_path, default_rights_path};
pub use registry::{load_registry, parse_registry};
pub use store::{LedgerStore, open_ledger};
