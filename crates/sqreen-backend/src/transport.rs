// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! reqwest client construction shared by every backend call.

use crate::client::BackendError;
use reqwest::ClientBuilder;
use std::time::Duration;
use tracing::debug;

/// Creates a reqwest client builder using rustls.
pub fn create_reqwest_client_builder() -> ClientBuilder {
    reqwest::Client::builder().use_rustls_tls()
}

/// Builds the HTTP client with the per-request timeout and an optional HTTPS proxy.
///
/// Without an explicit proxy, reqwest still honors the standard proxy
/// environment variables. HTTPS traffic through a proxy is tunneled with CONNECT.
pub fn build_client(
    proxy_url: Option<&str>,
    timeout: Duration,
) -> Result<reqwest::Client, BackendError> {
    let mut builder = create_reqwest_client_builder().timeout(timeout);
    if let Some(proxy) = proxy_url {
        debug!(proxy, "backend requests go through an https proxy");
        let proxy = reqwest::Proxy::https(proxy)
            .map_err(|e| BackendError::ClientConfig(format!("invalid proxy url: {e}")))?;
        builder = builder.proxy(proxy);
    }
    builder
        .build()
        .map_err(|e| BackendError::ClientConfig(e.to_string()))
}
