// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

//! The command surface the core answers for the external CLI.
//!
//! The CLI itself lives outside the core; it parses argv, builds a
//! [`Command`], dispatches it here and maps the outcome to a process exit
//! code. Exit code 0 is success; failures map one-for-one onto the stable
//! error codes.

use babel_shared::payload::Value;
use babel_shared::topology::Layer;

use crate::bridge::NativeBridge;
use crate::call::CallContext;
use crate::core::{CoreContext, StatusReport};
use crate::errors::Result;
use crate::gateway::Gateway;

/// Caller identity attributed to CLI-driven calls.
const CLI_CALLER: &str = "cli";

/// A command accepted by the core.
#[derive(Debug, Clone)]
pub enum Command {
    Init,
    Cleanup,
    RegisterBridge { language: String },
    Call {
        language: String,
        function: String,
        args: Vec<Value>,
    },
    Status,
    Version,
}

/// The successful outcome of a command.
#[derive(Debug)]
pub enum CommandOutput {
    Done,
    Value(Value),
    Status(StatusReport),
    Version(String),
}

/// Map a command outcome to the CLI's process exit code.
pub fn exit_code(result: &Result<CommandOutput>) -> i32 {
    match result {
        Ok(_) => 0,
        Err(e) => e.code().exit_code() as i32,
    }
}

/// Default layer binding for languages the CLI registers by name alone.
fn layer_for(language: &str) -> Option<Layer> {
    match language {
        "py" | "python" => Some(Layer::Python),
        "go" => Some(Layer::Go),
        "js" | "node" => Some(Layer::Node),
        _ => None,
    }
}

impl CoreContext {
    /// Answer one command.
    pub fn dispatch(&self, command: Command) -> Result<CommandOutput> {
        match command {
            Command::Init => {
                self.gateway().initialize()?;
                Ok(CommandOutput::Done)
            }
            Command::Cleanup => {
                self.gateway().cleanup()?;
                Ok(CommandOutput::Done)
            }
            Command::RegisterBridge { language } => {
                let mut bridge = NativeBridge::new(&language);
                if let Some(layer) = layer_for(&language) {
                    bridge = bridge.with_layer(layer);
                }
                self.gateway().register_bridge(Box::new(bridge))?;
                Ok(CommandOutput::Done)
            }
            Command::Call {
                language,
                function,
                args,
            } => {
                let payload = match args.len() {
                    1 => args.into_iter().next().expect("len checked"),
                    _ => Value::Array(args),
                };
                let ctx = CallContext::new(CLI_CALLER, language, function, payload);
                let value = self.gateway().call(ctx)?;
                Ok(CommandOutput::Value(value))
            }
            Command::Status => Ok(CommandOutput::Status(self.status())),
            Command::Version => Ok(CommandOutput::Version(
                env!("CARGO_PKG_VERSION").to_owned(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use babel_shared::error::ErrorCode;

    use crate::core::CoreConfig;
    use crate::externs::NoopExterns;

    use super::*;

    fn context() -> CoreContext {
        CoreContext::new(CoreConfig::default(), NoopExterns).unwrap()
    }

    #[test]
    fn exit_codes_map_onto_the_taxonomy() {
        let ctx = context();
        // Calling before init fails with NotInitialized, exit code 2.
        let result = ctx.dispatch(Command::Call {
            language: "py".into(),
            function: "echo".into(),
            args: vec![Value::from("hello")],
        });
        assert_eq!(exit_code(&result), ErrorCode::NotInitialized as i32);

        assert_eq!(exit_code(&ctx.dispatch(Command::Init)), 0);
        assert_eq!(exit_code(&ctx.dispatch(Command::Version)), 0);
    }

    #[test]
    fn register_and_call_through_the_command_surface() {
        let ctx = context();
        ctx.dispatch(Command::Init).unwrap();
        ctx.dispatch(Command::RegisterBridge {
            language: "native".into(),
        })
        .unwrap();

        // The CLI-registered bridge starts empty; an unknown function is a
        // bridge call failure, not an unknown language.
        let result = ctx.dispatch(Command::Call {
            language: "native".into(),
            function: "echo".into(),
            args: vec![Value::from("hello")],
        });
        assert_eq!(exit_code(&result), ErrorCode::BridgeCallFailed as i32);

        let result = ctx.dispatch(Command::Call {
            language: "rb".into(),
            function: "echo".into(),
            args: vec![],
        });
        assert_eq!(exit_code(&result), ErrorCode::UnknownLanguage as i32);

        match ctx.dispatch(Command::Status).unwrap() {
            CommandOutput::Status(status) => {
                assert_eq!(status.bridges, ["native"]);
            }
            other => panic!("expected status, got {other:?}"),
        }
    }
}
