//! Shared fakes for engine tests

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use media_downloader::downloader::{DownloadError, HttpClient, HttpResponse};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// How a fake URL answers
#[derive(Debug, Clone)]
pub enum Route {
    /// Full body, announced with its length
    Body(Vec<u8>),
    /// Body served in `chunk` sized pieces with `delay` before each one
    Slow {
        body: Vec<u8>,
        chunk: usize,
        delay: Duration,
    },
    /// Error status on every call
    Status(u16),
    /// Error status for the first `times` calls, then the body
    FlakyThen { times: usize, body: Vec<u8> },
    /// Announces more bytes than it sends
    Truncated { body: Vec<u8>, announced: u64 },
}

/// Counts transfers whose body is still being read
struct InFlight {
    current: Arc<AtomicUsize>,
}

impl InFlight {
    fn enter(current: Arc<AtomicUsize>, peak: &AtomicUsize) -> Self {
        let now = current.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(now, Ordering::SeqCst);
        Self { current }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }
}

/// In-memory [`HttpClient`] answering per URL
#[derive(Default)]
pub struct RoutedClient {
    routes: Mutex<HashMap<String, Route>>,
    calls: Mutex<HashMap<String, usize>>,
    in_flight: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl RoutedClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(self, url: &str, route: Route) -> Self {
        self.routes.lock().unwrap().insert(url.to_string(), route);
        self
    }

    pub fn calls(&self, url: &str) -> usize {
        self.calls.lock().unwrap().get(url).copied().unwrap_or(0)
    }

    /// Transfers whose body is still held by someone
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Most transfers ever open at once
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn body_response(
        &self,
        body: Vec<u8>,
        announced: u64,
        chunk: usize,
        delay: Duration,
    ) -> HttpResponse {
        let guard = InFlight::enter(self.in_flight.clone(), &self.peak);
        let pieces: Vec<Bytes> = body
            .chunks(chunk.max(1))
            .map(Bytes::copy_from_slice)
            .collect();
        let body = stream::iter(pieces)
            .then(move |piece| async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                Ok::<_, DownloadError>(piece)
            })
            .map(move |piece| {
                let _held = &guard;
                piece
            })
            .boxed();
        HttpResponse {
            content_length: Some(announced),
            body,
        }
    }
}

#[async_trait]
impl HttpClient for RoutedClient {
    async fn get(&self, url: &str) -> Result<HttpResponse, DownloadError> {
        let call = {
            let mut calls = self.calls.lock().unwrap();
            let entry = calls.entry(url.to_string()).or_insert(0);
            *entry += 1;
            *entry
        };
        let route = self.routes.lock().unwrap().get(url).cloned();
        let status = |status| DownloadError::HttpStatus {
            status,
            url: url.to_string(),
        };

        match route {
            None => Err(status(404)),
            Some(Route::Status(code)) => Err(status(code)),
            Some(Route::Body(body)) => {
                let len = body.len() as u64;
                Ok(self.body_response(body, len, 4096, Duration::ZERO))
            }
            Some(Route::Slow { body, chunk, delay }) => {
                let len = body.len() as u64;
                Ok(self.body_response(body, len, chunk, delay))
            }
            Some(Route::FlakyThen { times, body }) => {
                if call <= times {
                    Err(status(503))
                } else {
                    let len = body.len() as u64;
                    Ok(self.body_response(body, len, 4096, Duration::ZERO))
                }
            }
            Some(Route::Truncated { body, announced }) => {
                Ok(self.body_response(body, announced, 4096, Duration::ZERO))
            }
        }
    }
}

/// `n` bytes of a repeating pattern
pub fn payload(n: usize) -> Vec<u8> {
    (0..n).map(|i| (i % 251) as u8).collect()
}
