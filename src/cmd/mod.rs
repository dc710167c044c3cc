//! CLI command implementations.
//!
//! Each submodule owns one `Commands` variant:
//!
//! | Module   | Commands handled        |
//! |----------|-------------------------|
//! | `run`    | `Run`, `Phase`          |
//! | `status` | `Status`                |

pub mod run;
pub mod status;

pub use run::{cmd_run_phase, cmd_run_pipeline};
pub use status::cmd_status;
