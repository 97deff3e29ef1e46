//! HTTP transport: client wrapper, wire dumps, pipelined and raw clients

pub mod client;
pub mod dump;
pub mod pipeline;
pub mod raw;
pub mod signer;

pub use client::{HttpClient, RequestSpec, ResponseChain, ResponseHop};
pub use pipeline::{PipelineClient, PipelineClientPool};
