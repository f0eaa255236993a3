//! Per-component configuration read from the environment.
//!
//! Callers identify themselves with a component name (for example `"QP"` or
//! `"CQ"`). For a component `<C>` the following variables are consulted on
//! every allocation request:
//!
//! | Variable                    | Meaning                                     |
//! |-----------------------------|---------------------------------------------|
//! | `<C>_ALLOC_TYPE`            | `ANON`, `HUGE`, `CONTIG`, `PREFER_CONTIG`, `PREFER_HUGE` or `ALL` |
//! | `<C>_MAX_LOG2_CONTIG_BSIZE` | Largest contiguous block order to request   |
//! | `<C>_MIN_LOG2_CONTIG_BSIZE` | Smallest block order before giving up       |
//!
//! Invalid values are ignored with a warning; the defaults stay in effect.
//!
//! The environment is abstracted behind [`EnvSource`] so embedders and tests
//! can supply their own map instead of the process environment.

use crate::memory::AllocationType;
use crate::memory::defaults::{MAX_LOG2_CONTIG_BLOCK_SIZE, MIN_LOG2_CONTIG_BLOCK_SIZE};
use std::collections::HashMap;

/// Key/value lookup used for configuration overrides.
pub trait EnvSource: Send + Sync {
    /// Value of `name`, if set.
    fn var(&self, name: &str) -> Option<String>;
}

/// Reads the process environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn var(&self, name: &str) -> Option<String> {
        std::env::var(name).ok()
    }
}

/// Fixed in-memory environment.
///
/// # Example
///
/// ```rust
/// use devbuf::config::{AllocConfig, MapEnv};
/// use devbuf::memory::AllocationType;
///
/// let env = MapEnv::new().with("QP_ALLOC_TYPE", "huge");
/// let config = AllocConfig::load(&env, "QP");
/// assert_eq!(config.alloc_type, Some(AllocationType::Huge));
/// ```
#[derive(Debug, Clone, Default)]
pub struct MapEnv {
    vars: HashMap<String, String>,
}

impl MapEnv {
    /// Empty environment.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a variable.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(name.into(), value.into());
        self
    }
}

impl EnvSource for MapEnv {
    fn var(&self, name: &str) -> Option<String> {
        self.vars.get(name).cloned()
    }
}

/// Range of log2 block sizes to try for contiguous pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockOrderBounds {
    /// Smallest order tried before giving up.
    pub min: u32,
    /// Largest order requested.
    pub max: u32,
}

impl Default for BlockOrderBounds {
    fn default() -> Self {
        Self {
            min: MIN_LOG2_CONTIG_BLOCK_SIZE,
            max: MAX_LOG2_CONTIG_BLOCK_SIZE,
        }
    }
}

/// Configuration for one component, resolved from an [`EnvSource`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocConfig {
    /// Allocation type override, if one is set and valid.
    pub alloc_type: Option<AllocationType>,
    /// Contiguous page block order bounds.
    pub block_orders: BlockOrderBounds,
}

impl AllocConfig {
    /// Resolve the configuration for `component`.
    pub fn load(env: &dyn EnvSource, component: &str) -> Self {
        Self {
            alloc_type: load_alloc_type(env, component),
            block_orders: load_block_orders(env, component),
        }
    }
}

fn load_alloc_type(env: &dyn EnvSource, component: &str) -> Option<AllocationType> {
    let name = format!("{}_ALLOC_TYPE", component);
    let value = env.var(&name)?;
    match value.trim().parse() {
        Ok(ty) => Some(ty),
        Err(e) => {
            tracing::debug!(variable = %name, error = %e, "ignoring allocation type override");
            None
        }
    }
}

fn load_block_orders(env: &dyn EnvSource, component: &str) -> BlockOrderBounds {
    let mut bounds = BlockOrderBounds::default();

    let name = format!("{}_MAX_LOG2_CONTIG_BSIZE", component);
    if let Some(value) = read_order(env, &name) {
        if (MIN_LOG2_CONTIG_BLOCK_SIZE..=MAX_LOG2_CONTIG_BLOCK_SIZE).contains(&value) {
            bounds.max = value;
        } else {
            tracing::warn!(variable = %name, value, "block order out of range, ignored");
        }
    }

    // The minimum is validated against the maximum just resolved.
    let name = format!("{}_MIN_LOG2_CONTIG_BSIZE", component);
    if let Some(value) = read_order(env, &name) {
        if (MIN_LOG2_CONTIG_BLOCK_SIZE..=bounds.max).contains(&value) {
            bounds.min = value;
        } else {
            tracing::warn!(variable = %name, value, "block order out of range, ignored");
        }
    }

    bounds
}

fn read_order(env: &dyn EnvSource, name: &str) -> Option<u32> {
    let raw = env.var(name)?;
    match raw.trim().parse::<u32>() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(variable = %name, value = %raw, "block order is not a number, ignored");
            None
        }
    }
}
