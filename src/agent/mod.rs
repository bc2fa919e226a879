pub mod engine;
pub mod tools;

pub use engine::AgentEngine;
pub use tools::ToolRegistry;
