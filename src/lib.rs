//! scriptgrade library
//!
//! This crate provides the core functionality of the grading assistant:
//! - Execution engine that runs submissions and captures text and plots
//! - Rendering of captured output into displayable blocks
//! - Submission discovery and grade annotations
//! - MCP server implementation using rmcp

pub mod config;
pub mod engine;
pub mod grading;
pub mod mcp;
pub mod render;
pub mod submissions;
pub mod transport;
