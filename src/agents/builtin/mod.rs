pub mod http_agent;
pub mod scripted_agent;

pub use http_agent::HttpAgentInvoker;
pub use scripted_agent::ScriptedInvoker;
