// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::io;
use std::path::Path;

use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use thiserror::Error;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use url::Url;

use crate::request;

#[derive(Debug, Clone, Copy)]
pub struct Progress {
    pub delta: u64,
    pub completed: u64,
    pub total: u64,
}

impl Progress {
    pub fn pct(&self) -> f32 {
        self.completed as f32 / self.total as f32
    }
}

/// Retrieval of a single package file. The engine only ever talks to
/// this interface, the transport lives behind it.
pub trait Fetcher: Send + Sync {
    fn fetch<'a>(
        &'a self,
        url: &'a Url,
        dest: &'a Path,
        expected_size: Option<u64>,
        on_progress: &'a (dyn Fn(Progress) + Send + Sync),
    ) -> BoxFuture<'a, Result<(), Error>>;
}

/// [`Fetcher`] over the shared http client
#[derive(Debug, Clone, Copy, Default)]
pub struct HttpFetcher;

impl Fetcher for HttpFetcher {
    fn fetch<'a>(
        &'a self,
        url: &'a Url,
        dest: &'a Path,
        expected_size: Option<u64>,
        on_progress: &'a (dyn Fn(Progress) + Send + Sync),
    ) -> BoxFuture<'a, Result<(), Error>> {
        async move {
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent).await?;
            }

            let mut bytes = request::get(url.clone()).await?;
            let mut out = File::create(dest).await?;

            let mut total = 0;

            while let Some(chunk) = bytes.next().await {
                let bytes = chunk?;
                let delta = bytes.len() as u64;
                total += delta;
                out.write_all(&bytes).await?;

                (on_progress)(Progress {
                    delta,
                    completed: total,
                    total: expected_size.unwrap_or(total),
                });
            }

            out.flush().await?;

            Ok(())
        }
        .boxed()
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("request")]
    Request(#[from] request::Error),
    #[error("io")]
    Io(#[from] io::Error),
}
