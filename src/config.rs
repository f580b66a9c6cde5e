/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Runtime tunables for the data plane. A [`Config`] is attached to a
//! worker's context and consulted wherever a default block size or the
//! self-verify mode is needed.

use serde::Deserialize;
use serde::Serialize;

use crate::block::DEFAULT_BLOCK_SIZE;

/// Data-plane configuration. Values can be overridden from the
/// environment via [`Config::from_env`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Size in bytes of newly allocated byte blocks.
    pub block_size: usize,

    /// When true, every serialized item is prefixed with a 64-bit type
    /// fingerprint that is checked again on read.
    pub self_verify: bool,

    /// Optional upper bound, in bytes, on the total size of live byte
    /// blocks per pool.
    pub pool_limit: Option<usize>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            self_verify: cfg!(debug_assertions),
            pool_limit: None,
        }
    }
}

impl Config {
    /// Build a configuration from the defaults, applying any
    /// `BLOCKMESH_*` environment overrides. Malformed values are logged
    /// and ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(value) = read_env::<usize>("BLOCKMESH_BLOCK_SIZE") {
            config.block_size = value;
        }
        if let Some(value) = read_env::<bool>("BLOCKMESH_SELF_VERIFY") {
            config.self_verify = value;
        }
        if let Some(value) = read_env::<usize>("BLOCKMESH_POOL_LIMIT") {
            config.pool_limit = Some(value);
        }
        config
    }
}

fn read_env<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(name, raw, "ignoring malformed environment override");
            None
        }
    }
}
