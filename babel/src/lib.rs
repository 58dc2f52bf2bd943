// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

//! Core runtime of the Babel polyglot call gateway: a process-resident
//! coordinator letting programs in several host languages invoke
//! functions exported by one another through a common in-process
//! boundary.
//!
//! The [`gateway`] is the only component exposed to external callers for
//! cross-language invocation; everything else is reached through the
//! [`core::CoreContext`]'s typed accessors or its service registry.
//!
//! ## Logging
//!
//! This package emits logs using the log façade. Configure the logging
//! backend of your choice during the initialization of the consuming
//! application.

pub use bridge::{Bridge, NativeBridge};
pub use gateway::{DefaultGateway, Gateway};

pub mod bridge;
pub mod call;
pub mod command;
pub mod core;
pub mod errsys;
pub mod externs;
pub mod gateway;
pub mod policy;
pub mod resource;
pub mod topology;

pub mod errors;
