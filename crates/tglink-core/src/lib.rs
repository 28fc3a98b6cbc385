//! # tglink-core
//!
//! Foundation types for the tglink client transport.
//!
//! This crate provides the shared vocabulary the transport crates depend on:
//!
//! - **Errors**: [`errors::LinkError`] taxonomy via `thiserror`
//! - **Frame codec**: [`frame::FrameCodec`] optional-compression envelope
//! - **Wire envelope**: [`wire::RpcRequest`] / [`wire::RpcResult`] JSON-RPC 2.0
//!   types and [`wire::StreamMessage`] streaming units
//! - **Events**: [`events::LinkEvent`] and the broadcast [`events::EventEmitter`]
//! - **Logging**: [`logging::init`] tracing setup
//!
//! ## Crate Position
//!
//! Foundation crate. Depended on by `tglink-client`.

#![deny(unsafe_code)]

pub mod errors;
pub mod events;
pub mod frame;
pub mod logging;
pub mod wire;
