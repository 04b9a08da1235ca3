//! Host environment preflight checks.

mod tool;

pub use tool::{check_exec_capable, check_tool, ToolStatus};
