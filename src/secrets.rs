//! Secret resolution
//!
//! Passwords and plugin arguments may be stored as secret references
//! instead of plaintext. Resolution is an external capability; the engine
//! only defines the interface and a resolver backed by process environment
//! variables for `env:NAME` references.

use std::collections::HashMap;

use anyhow::{Context, Result};

pub trait SecretResolver: Send + Sync {
    /// Resolve one reference to plaintext. Plain values pass through
    /// unchanged.
    fn resolve(&self, reference: &str) -> Result<String>;
}

/// Resolves `env:NAME` references from the process environment.
#[derive(Debug, Default, Clone)]
pub struct EnvSecrets;

impl SecretResolver for EnvSecrets {
    fn resolve(&self, reference: &str) -> Result<String> {
        match reference.strip_prefix("env:") {
            Some(name) => std::env::var(name)
                .with_context(|| format!("secret environment variable {name} is not set")),
            None => Ok(reference.to_string()),
        }
    }
}

/// Resolve every value of an argument map in place.
pub fn merge_secrets(
    args: &mut HashMap<String, String>,
    resolver: &dyn SecretResolver,
) -> Result<()> {
    for value in args.values_mut() {
        *value = resolver.resolve(value)?;
    }
    Ok(())
}
