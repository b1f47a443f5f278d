//! CLI command implementations.
//!
//! | Module    | Commands handled  |
//! |-----------|-------------------|
//! | `serve`   | `Serve`           |
//! | `up`      | `Up`              |
//! | `config`  | `Config`          |

pub mod config;
pub mod serve;
pub mod up;

pub use config::cmd_config;
pub use serve::cmd_serve;
pub use up::cmd_up;
