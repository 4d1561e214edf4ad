//! Built-in tool implementations for Turnstile.
//!
//! Tools give the agent the ability to interact with the world:
//! run shell commands, read/write files, ask the user, and keep memories.
//! Additional tools are described by TOML command manifests and loaded
//! from a directory at startup.
//!
//! The [`patch::PatchApplier`] output handler also lives here.

pub mod ask_user;
pub mod external;
pub mod file_read;
pub mod file_write;
pub mod memory;
pub mod patch;
pub mod shell;

use std::path::Path;
use std::sync::Arc;
use tracing::info;
use turnstile_core::human::HumanInput;
use turnstile_core::tool::ToolRegistry;

pub use external::{CommandManifest, CommandTool, load_external_tools};
pub use memory::{MemoryStore, MemoryType};
pub use patch::PatchApplier;

/// What the built-in tools need from their environment.
pub struct BuiltinTools {
    /// If non-empty, `execute_shell` only runs these base commands.
    pub shell_allowlist: Vec<String>,
    /// Answers `ask_user`.
    pub human: Arc<dyn HumanInput>,
    /// Enables `save_memory` / `retrieve_memory` when set.
    pub memory: Option<Arc<MemoryStore>>,
}

/// Create a tool registry with all built-in tools.
pub fn builtin_registry(builtins: BuiltinTools) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(Box::new(shell::ShellTool::new(builtins.shell_allowlist)));
    registry.register(Box::new(file_read::FileReadTool::new()));
    registry.register(Box::new(file_write::FileWriteTool::new()));
    registry.register(Box::new(ask_user::AskUserTool::new(builtins.human)));
    if let Some(store) = builtins.memory {
        registry.register(Box::new(memory::SaveMemoryTool::new(store.clone())));
        registry.register(Box::new(memory::RetrieveMemoryTool::new(store)));
    }
    registry
}

/// Register every external tool found in `dir`. A manifest whose name matches
/// an existing tool replaces it. Returns how many were registered.
pub fn register_external(registry: &mut ToolRegistry, dir: &Path) -> usize {
    let tools = load_external_tools(dir);
    let count = tools.len();
    for tool in tools {
        if registry.register(tool).is_some() {
            info!("External tool replaced a built-in of the same name");
        }
    }
    count
}
