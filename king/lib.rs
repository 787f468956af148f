#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]
pub mod assemble;
pub mod config;
pub mod container;
pub mod io;
pub mod kernel;
pub mod matrix;
pub mod pack;
pub mod pipeline;
pub mod pool;
#[path = "../shared/files.rs"]
pub mod shared_files;
pub mod types;
pub mod shared {
    pub use super::shared_files as files;
}
