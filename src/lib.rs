pub mod config;
pub mod connection;
pub mod context;
pub mod engine;
pub mod error;
pub mod executor;
pub mod group;
pub mod host;
pub mod lifecycle;
pub mod once;
pub mod ssh;
pub mod target;
pub mod template;
pub mod transfer;
pub mod utils;

pub use config::Config;
pub use context::{Context, Overrides, RunOptions, TaskRegistry};
pub use engine::Engine;
pub use error::{ConnectivityKind, Error, Result};
pub use executor::{ExecutionResult, ShOptions};
pub use group::{HostGroup, HostMap};
pub use host::Host;
pub use target::{GroupTarget, HostTarget, Operations};
pub use template::{TemplateRenderer, VariableRenderer};
pub use transfer::{CopyOptions, Source};
