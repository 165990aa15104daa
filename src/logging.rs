// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Console logging for applications embedding the agent
//!
//! The library only emits `tracing` events. Binaries and tests that want to
//! see them call [`init_logging`] once.

use tracing_subscriber::EnvFilter;

/// Environment variable holding the filter directives, e.g. `nixl_agent=trace`
pub const LOG_LEVEL_ENV: &str = "NIXL_LOG_LEVEL";

const DEFAULT_DIRECTIVES: &str = "warn";

/// Installs a global fmt subscriber
///
/// `directives` takes precedence over `NIXL_LOG_LEVEL`; without either the
/// level is `warn`. Returns false if a global subscriber was already set.
pub fn init_logging(directives: Option<&str>) -> bool {
    let filter = match directives {
        Some(directives) => EnvFilter::new(directives),
        None => EnvFilter::try_from_env(LOG_LEVEL_ENV)
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVES)),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_line_number(false)
        .try_init()
        .is_ok()
}
