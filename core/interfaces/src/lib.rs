mod config;
mod store;

pub use config::*;
pub use store::*;

pub mod types {
    pub use vt_types::*;
}
