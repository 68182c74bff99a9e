// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

pub const NAME: &str = env!("CARGO_PKG_NAME");
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
/// Default number of repositories synced at once
pub const DEFAULT_REPO_CONCURRENCY: usize = 4;
/// Default per-repository worker count for downloads and header parsing
pub const DEFAULT_WORKERS: usize = 8;
/// Grace window between cancellation and forced shutdown
pub const SHUTDOWN_GRACE_MS: u64 = 2000;
