pub mod config;
pub mod context;
pub mod id;
pub mod patch;
pub mod types;
pub mod validate;

pub use config::ShipyardConfig;
pub use context::{Clock, Context, ManualClock, SystemClock};
pub use id::new_id;
pub use patch::Patch;
pub use types::*;
