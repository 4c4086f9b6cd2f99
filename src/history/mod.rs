pub mod dummy;
pub mod file;
pub mod flusher;
pub mod gc;
#[allow(clippy::module_inception)]
mod history;
pub mod json_backend;
pub mod lazy_json;
pub mod show;
pub mod sqlite_backend;

pub use history::*;
