// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

pub use self::engine::Engine;
pub use self::package::Package;
pub use self::progress::{Event, Sink};
pub use self::repository::Repository;

pub mod config;
pub mod engine;
pub mod environment;
pub mod metadata;
pub mod package;
pub mod progress;
pub mod repository;
mod request;
pub mod source;
pub mod stager;
pub mod sync;
pub mod util;
