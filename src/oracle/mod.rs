//! Oracle boundary
//!
//! The oracle is an external, unreliable text generator: text in, text out,
//! may fail. Everything protocol-specific lives in an `Oracle` implementation.

pub mod client;
pub mod command;
pub mod parse;
pub mod prompts;
pub mod repair;

use crate::error::OracleError;
use std::future::Future;
use std::pin::Pin;

pub use client::OpenRouterOracle;
pub use command::CommandOracle;
pub use prompts::{Prompt, PromptBuilder};

/// Desired output shape for one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputShape {
    Text,
    Structured,
}

pub type OracleFuture<'a> = Pin<Box<dyn Future<Output = Result<String, OracleError>> + Send + 'a>>;

pub trait Oracle: Send + Sync {
    /// Run one request and return the raw response text.
    fn invoke<'a>(&'a self, request: &'a str, shape: OutputShape) -> OracleFuture<'a>;

    /// Short label used in logs.
    fn name(&self) -> &str;
}

impl<T: Oracle + ?Sized> Oracle for std::sync::Arc<T> {
    fn invoke<'a>(&'a self, request: &'a str, shape: OutputShape) -> OracleFuture<'a> {
        (**self).invoke(request, shape)
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

/// Build the configured oracle.
pub fn from_config(config: &crate::config::Config) -> anyhow::Result<Box<dyn Oracle>> {
    use crate::config::OracleKind;
    let ai = &config.ai_settings;
    match ai.oracle {
        OracleKind::Command => Ok(Box::new(CommandOracle::new(
            ai.command.clone(),
            ai.model.clone(),
            ai.call_timeout_secs,
        ))),
        OracleKind::Openrouter => {
            let key = config.openrouter_api_key().ok_or_else(|| {
                anyhow::anyhow!(
                    "No OpenRouter API key configured. Set OPENROUTER_API_KEY or store one in the system keychain."
                )
            })?;
            Ok(Box::new(OpenRouterOracle::new(
                key,
                ai.model.clone(),
                ai.call_timeout_secs,
            )?))
        }
    }
}
