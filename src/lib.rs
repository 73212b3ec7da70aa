pub mod chunker;
pub mod config;
pub mod dispatch;
pub mod io;
pub mod llm;
pub mod pipeline;
pub mod render;
pub mod retry;
