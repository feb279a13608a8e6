//! Blocking HTTP facade over reqwest for the worker threads

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::de::DeserializeOwned;

use crate::error::{BridgeError, Result, TransportError};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const STREAM_POLL: Duration = Duration::from_millis(250);
const STREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

pub type Headers = [(String, String)];

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_str(&self.body).map_err(|e| BridgeError::parse(e.to_string()))
    }
}

pub trait HttpClient: Send + Sync {
    /// GET; non-2xx statuses are errors.
    fn get(&self, url: &str, headers: &Headers) -> Result<HttpResponse>;

    fn post(&self, url: &str, headers: &Headers, body: Option<&serde_json::Value>)
        -> Result<HttpResponse>;

    /// Streams the body into `on_chunk` until the server closes, an error
    /// occurs, or `stop` is set. Returns `Ok(())` only when stopped.
    fn stream_get(
        &self,
        url: &str,
        headers: &Headers,
        stop: &AtomicBool,
        on_chunk: &mut dyn FnMut(&[u8]),
    ) -> Result<()>;
}

fn map_reqwest_error(e: reqwest::Error) -> BridgeError {
    if e.is_timeout() {
        TransportError::Timeout(e.to_string()).into()
    } else if e.is_connect() {
        TransportError::ConnectFailed(e.to_string()).into()
    } else {
        TransportError::Request(e.to_string()).into()
    }
}

fn check_status(url: &str, status: reqwest::StatusCode) -> Result<()> {
    if status.is_success() {
        Ok(())
    } else {
        Err(TransportError::Status {
            status: status.as_u16(),
            url: url.to_string(),
        }
        .into())
    }
}

/// Owns its own tokio runtime; calls block the calling (non-runtime) thread.
pub struct ReqwestHttpClient {
    runtime: tokio::runtime::Runtime,
    client: reqwest::Client,
    stream_client: reqwest::Client,
}

impl ReqwestHttpClient {
    pub fn new(user_agent: &str) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("http-runtime")
            .enable_all()
            .build()?;

        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(REQUEST_TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(map_reqwest_error)?;

        // No total timeout: event streams stay open indefinitely
        let stream_client = reqwest::Client::builder()
            .user_agent(user_agent)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(map_reqwest_error)?;

        Ok(Self {
            runtime,
            client,
            stream_client,
        })
    }

    pub fn runtime_handle(&self) -> tokio::runtime::Handle {
        self.runtime.handle().clone()
    }

    fn execute(&self, url: &str, request: reqwest::RequestBuilder) -> Result<HttpResponse> {
        self.runtime.block_on(send_request(url, request))
    }
}

async fn send_request(url: &str, request: reqwest::RequestBuilder) -> Result<HttpResponse> {
    let response = request.send().await.map_err(map_reqwest_error)?;
    let status = response.status();
    check_status(url, status)?;
    let body = response.text().await.map_err(map_reqwest_error)?;
    Ok(HttpResponse {
        status: status.as_u16(),
        body,
    })
}

async fn stream_response(
    url: &str,
    request: reqwest::RequestBuilder,
    stop: &AtomicBool,
    on_chunk: &mut dyn FnMut(&[u8]),
) -> Result<()> {
    let send = request.send();
    tokio::pin!(send);
    let mut waited = Duration::ZERO;

    let mut response = loop {
        tokio::select! {
            result = &mut send => break result.map_err(map_reqwest_error)?,
            () = tokio::time::sleep(STREAM_POLL) => {
                if stop.load(Ordering::SeqCst) {
                    return Ok(());
                }
                waited = waited.saturating_add(STREAM_POLL);
                if waited >= CONNECT_TIMEOUT {
                    return Err(TransportError::Timeout(format!("connecting to {url}")).into());
                }
            }
        }
    };
    check_status(url, response.status())?;

    let mut idle = Duration::ZERO;
    loop {
        if stop.load(Ordering::SeqCst) {
            return Ok(());
        }

        match tokio::time::timeout(STREAM_POLL, response.chunk()).await {
            Ok(Ok(Some(chunk))) => {
                idle = Duration::ZERO;
                on_chunk(&chunk);
            }
            Ok(Ok(None)) => return Err(TransportError::Closed.into()),
            Ok(Err(e)) => return Err(map_reqwest_error(e)),
            Err(_) => {
                idle = idle.saturating_add(STREAM_POLL);
                if idle >= STREAM_IDLE_TIMEOUT {
                    return Err(TransportError::Timeout(format!("no data from {url}")).into());
                }
            }
        }
    }
}

impl HttpClient for ReqwestHttpClient {
    fn get(&self, url: &str, headers: &Headers) -> Result<HttpResponse> {
        let mut request = self.client.get(url);
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }
        self.execute(url, request)
    }

    fn post(
        &self,
        url: &str,
        headers: &Headers,
        body: Option<&serde_json::Value>,
    ) -> Result<HttpResponse> {
        let mut request = self.client.post(url);
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(body) = body {
            request = request.json(body);
        }
        self.execute(url, request)
    }

    fn stream_get(
        &self,
        url: &str,
        headers: &Headers,
        stop: &AtomicBool,
        on_chunk: &mut dyn FnMut(&[u8]),
    ) -> Result<()> {
        let mut request = self.stream_client.get(url);
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }

        self.runtime
            .block_on(stream_response(url, request, stop, on_chunk))
    }
}

#[cfg(test)]
pub mod testing {
    //! Scripted [`HttpClient`] for unit tests

    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::time::Instant;

    #[derive(Clone)]
    pub struct ScriptedStream {
        /// Time before the first chunk arrives
        pub connect_delay: Duration,
        pub chunks: Vec<Vec<u8>>,
        /// Pause between consecutive chunks
        pub chunk_gap: Duration,
        /// Keep the stream open after the chunks run out
        pub hold_open: bool,
    }

    #[derive(Default)]
    pub struct FakeHttpClient {
        responses: Mutex<HashMap<String, String>>,
        streams: Mutex<HashMap<String, ScriptedStream>>,
        requests: Mutex<Vec<(String, Vec<(String, String)>)>>,
    }

    impl FakeHttpClient {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn respond(&self, url: &str, body: &str) {
            self.responses.lock().insert(url.to_string(), body.to_string());
        }

        pub fn stream(&self, url: &str, stream: ScriptedStream) {
            self.streams.lock().insert(url.to_string(), stream);
        }

        pub fn requests_to(&self, url: &str) -> usize {
            self.requests.lock().iter().filter(|(u, _)| u == url).count()
        }

        pub fn headers_for(&self, url: &str) -> Option<Vec<(String, String)>> {
            self.requests
                .lock()
                .iter()
                .find(|(u, _)| u == url)
                .map(|(_, h)| h.clone())
        }
    }

    impl HttpClient for FakeHttpClient {
        fn get(&self, url: &str, headers: &Headers) -> Result<HttpResponse> {
            self.requests.lock().push((url.to_string(), headers.to_vec()));
            match self.responses.lock().get(url) {
                Some(body) => Ok(HttpResponse {
                    status: 200,
                    body: body.clone(),
                }),
                None => Err(TransportError::Status {
                    status: 404,
                    url: url.to_string(),
                }
                .into()),
            }
        }

        fn post(
            &self,
            url: &str,
            headers: &Headers,
            _body: Option<&serde_json::Value>,
        ) -> Result<HttpResponse> {
            self.get(url, headers)
        }

        fn stream_get(
            &self,
            url: &str,
            headers: &Headers,
            stop: &AtomicBool,
            on_chunk: &mut dyn FnMut(&[u8]),
        ) -> Result<()> {
            self.requests.lock().push((url.to_string(), headers.to_vec()));
            let Some(script) = self.streams.lock().get(url).cloned() else {
                std::thread::sleep(Duration::from_millis(20));
                return Err(TransportError::ConnectFailed(url.to_string()).into());
            };

            let started = Instant::now();
            while started.elapsed() < script.connect_delay {
                if stop.load(Ordering::SeqCst) {
                    return Ok(());
                }
                std::thread::sleep(Duration::from_millis(5));
            }

            for (i, chunk) in script.chunks.iter().enumerate() {
                if i > 0 {
                    let gap_start = Instant::now();
                    while gap_start.elapsed() < script.chunk_gap {
                        if stop.load(Ordering::SeqCst) {
                            return Ok(());
                        }
                        std::thread::sleep(Duration::from_millis(5));
                    }
                }
                if stop.load(Ordering::SeqCst) {
                    return Ok(());
                }
                on_chunk(chunk);
            }

            if !script.hold_open {
                return Err(TransportError::Closed.into());
            }
            while !stop.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(5));
            }
            Ok(())
        }
    }
}
