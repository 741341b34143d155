// MCP tool-call proxy: stdio server toward the agent client, HTTP client
// toward the IDE's built-in server.

pub mod dispatcher;
pub mod pending;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod tools;
pub mod upstream;

pub use dispatcher::Dispatcher;
pub use server::McpServer;
pub use upstream::UpstreamClient;
