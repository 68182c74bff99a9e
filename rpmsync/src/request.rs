// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::sync::LazyLock;

use bytes::Bytes;
use futures::{stream, Stream, StreamExt};
use thiserror::Error;
use tokio::fs;
use url::Url;

/// Shared client for tcp socket reuse and connection limit
static CLIENT: LazyLock<reqwest::Client> = LazyLock::new(|| {
    reqwest::ClientBuilder::new()
        .user_agent(concat!(
            env!("CARGO_PKG_NAME"),
            "/",
            env!("CARGO_PKG_VERSION")
        ))
        .build()
        .expect("build reqwest client")
});

/// Fetch a resource at the provided [`Url`] and stream its response
/// bytes. `file://` urls resolve against the local filesystem so repo
/// sources can point at already-mirrored trees.
pub async fn get(url: Url) -> Result<impl Stream<Item = Result<Bytes, Error>>, Error> {
    match url.scheme() {
        "file" => {
            let path = url
                .to_file_path()
                .map_err(|_| Error::UnsupportedScheme(url.clone()))?;
            let bytes = fs::read(&path).await.map_err(Error::File)?;

            Ok(stream::iter([Ok(Bytes::from(bytes))]).left_stream())
        }
        "http" | "https" => {
            let response = CLIENT.get(url).send().await?.error_for_status()?;

            Ok(response
                .bytes_stream()
                .map(|result| result.map_err(Error::Request))
                .right_stream())
        }
        _ => Err(Error::UnsupportedScheme(url)),
    }
}

/// Fetch a resource fully into memory
pub async fn get_bytes(url: Url) -> Result<Vec<u8>, Error> {
    let mut stream = get(url).await?;
    let mut bytes = vec![];

    while let Some(chunk) = stream.next().await {
        bytes.extend_from_slice(&chunk?);
    }

    Ok(bytes)
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("unsupported url scheme: {0}")]
    UnsupportedScheme(Url),
    #[error("request")]
    Request(#[from] reqwest::Error),
    #[error("read local file")]
    File(#[source] std::io::Error),
}
