pub mod classify;
pub mod config;
pub mod core;
pub mod error;
pub mod events;
pub mod hints;
pub mod intake;
pub mod parsers;
pub mod pipeline;
pub mod process;
pub mod rules;
pub mod state;
pub mod store;

pub use crate::config::Config;
pub use crate::core::Core;
pub use crate::error::{ReforgeError, Result};
pub use crate::events::{Event, EventBus};
pub use crate::state::VideoState;
pub use crate::store::{Store, Video, Vmaf};
