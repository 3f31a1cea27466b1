// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::{EncodedBatch, SendError};
use async_trait::async_trait;
use ddtail_common::MutexExt;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::{Method, Request, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Outcome of one send attempt, as the destination reported it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Ok,
    /// Permanent client error; the batch is dropped with an alarm.
    Discard,
    NetworkFail,
    QuotaFail,
}

/// The seam to the remote ingestion service. The concrete wire protocol
/// lives behind this trait; the pipeline only cares about the four outcomes.
#[async_trait]
pub trait BatchTransport: Send + Sync {
    async fn send(&self, batch: &EncodedBatch) -> SendOutcome;
}

/// Authenticated POST of the length-delimited batch body.
pub struct HttpTransport {
    client: Client<HttpConnector, Full<Bytes>>,
    endpoint: Uri,
}

impl HttpTransport {
    pub fn new(endpoint: &str) -> Result<HttpTransport, SendError> {
        let endpoint: Uri = endpoint
            .parse()
            .map_err(|_| SendError::Endpoint(endpoint.to_owned()))?;
        Ok(HttpTransport {
            client: Client::builder(TokioExecutor::new()).build_http(),
            endpoint,
        })
    }
}

#[async_trait]
impl BatchTransport for HttpTransport {
    async fn send(&self, batch: &EncodedBatch) -> SendOutcome {
        let request = Request::builder()
            .method(Method::POST)
            .uri(self.endpoint.clone())
            .header(hyper::header::CONTENT_TYPE, "application/octet-stream")
            .header("x-batch-sequence", batch.sequence)
            .header("x-batch-count", batch.record_count)
            .header(
                "content-encoding",
                if batch.compressed { "lz4" } else { "identity" },
            )
            .body(Full::new(batch.body.clone()));
        let request = match request {
            Ok(request) => request,
            Err(e) => {
                debug!(error = %e, "request build failed");
                return SendOutcome::Discard;
            }
        };
        match self.client.request(request).await {
            Ok(response) => match response.status() {
                status if status.is_success() => SendOutcome::Ok,
                hyper::StatusCode::TOO_MANY_REQUESTS => SendOutcome::QuotaFail,
                status if status.is_client_error() => SendOutcome::Discard,
                _ => SendOutcome::NetworkFail,
            },
            Err(e) => {
                debug!(error = %e, "send transport error");
                SendOutcome::NetworkFail
            }
        }
    }
}

/// Routes each batch to the transport of its destination. The agent builds
/// one HTTP transport per configured endpoint and wraps them in this.
#[derive(Default)]
pub struct RoutingTransport {
    routes: std::collections::HashMap<String, Arc<dyn BatchTransport>>,
}

impl RoutingTransport {
    pub fn new() -> RoutingTransport {
        RoutingTransport::default()
    }

    pub fn insert(&mut self, destination: String, transport: Arc<dyn BatchTransport>) {
        self.routes.insert(destination, transport);
    }
}

#[async_trait]
impl BatchTransport for RoutingTransport {
    async fn send(&self, batch: &EncodedBatch) -> SendOutcome {
        match self.routes.get(&batch.destination) {
            Some(transport) => transport.send(batch).await,
            None => {
                debug!(destination = %batch.destination, "no route for destination");
                SendOutcome::Discard
            }
        }
    }
}

/// In-memory transport for tests: replays a script of outcomes (then `Ok`
/// forever) and records every delivered batch.
#[derive(Default)]
pub struct MemoryTransport {
    script: Mutex<VecDeque<SendOutcome>>,
    delivered: Mutex<Vec<EncodedBatch>>,
    attempts: Mutex<u64>,
}

impl MemoryTransport {
    pub fn new() -> Arc<MemoryTransport> {
        Arc::new(MemoryTransport::default())
    }

    pub fn scripted(outcomes: impl IntoIterator<Item = SendOutcome>) -> Arc<MemoryTransport> {
        let transport = MemoryTransport::new();
        transport
            .script
            .lock_or_panic()
            .extend(outcomes);
        transport
    }

    pub fn delivered(&self) -> Vec<EncodedBatch> {
        self.delivered.lock_or_panic().clone()
    }

    pub fn attempts(&self) -> u64 {
        *self.attempts.lock_or_panic()
    }
}

#[async_trait]
impl BatchTransport for MemoryTransport {
    async fn send(&self, batch: &EncodedBatch) -> SendOutcome {
        *self.attempts.lock_or_panic() += 1;
        let outcome = self
            .script
            .lock_or_panic()
            .pop_front()
            .unwrap_or(SendOutcome::Ok);
        if outcome == SendOutcome::Ok {
            self.delivered.lock_or_panic().push(batch.clone());
        }
        outcome
    }
}
