//! Core types, configuration, credentials and error handling for opsmux.
//!
//! This crate provides the foundational abstractions used across all opsmux components.

pub mod config;
pub mod credentials;
pub mod error;
pub mod types;

pub use config::{Config, ProviderConfig, Settings, TransportConfig, TransportKind};
pub use credentials::{CredentialCheck, CredentialValidator, EnvCredentialValidator};
pub use error::{Error, Result};
pub use types::{
    PromptArgument, PromptDescriptor, ProviderStatus, ResourceDescriptor, ToolDescriptor,
};
