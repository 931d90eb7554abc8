// HLS Segment Loader: downloads fragments and init segments, optionally handing
// out chunks as they arrive so transmuxing can start before the body completes.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use reqwest::Client;
use tracing::{debug, instrument, trace};
use transmux::ChunkCache;

use crate::config::CascadeConfig;
use crate::error::LoadError;
use crate::fragment::{ByteRange, Fragment};

/// Receives progressive chunks of at least the high-water mark, in order.
pub type ProgressCallback = Box<dyn FnMut(Bytes) + Send>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadRequest {
    pub url: String,
    pub byte_range: Option<ByteRange>,
    pub timeout: Duration,
    /// Bytes to accumulate before a progress chunk is emitted. `None` delivers
    /// the whole body on completion.
    pub high_water_mark: Option<usize>,
}

impl LoadRequest {
    pub fn for_fragment(frag: &Fragment, config: &CascadeConfig, progressive: bool) -> Self {
        Self {
            url: frag.url.clone(),
            byte_range: frag.byte_range,
            timeout: config.fragment.load_timeout,
            high_water_mark: progressive.then_some(config.transmux.high_water_mark.max(1)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadStats {
    pub loaded: usize,
    /// Content length announced by the server.
    pub total: Option<usize>,
    /// Progress chunks delivered before completion.
    pub chunks: u32,
}

#[derive(Debug, Clone)]
pub struct LoadResponse {
    /// Bytes not already handed to the progress callback.
    pub data: Bytes,
    pub stats: LoadStats,
}

#[async_trait]
pub trait SegmentLoader: Send + Sync {
    async fn load(
        &self,
        request: LoadRequest,
        on_progress: Option<ProgressCallback>,
    ) -> Result<LoadResponse, LoadError>;
}

pub struct HttpSegmentLoader {
    client: Client,
}

impl HttpSegmentLoader {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

impl fmt::Debug for HttpSegmentLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpSegmentLoader").finish_non_exhaustive()
    }
}

#[async_trait]
impl SegmentLoader for HttpSegmentLoader {
    #[instrument(skip(self, request, on_progress), fields(url = %request.url))]
    async fn load(
        &self,
        request: LoadRequest,
        on_progress: Option<ProgressCallback>,
    ) -> Result<LoadResponse, LoadError> {
        let mut builder = self.client.get(&request.url);
        if let Some(range) = request.byte_range {
            builder = builder.header(reqwest::header::RANGE, range.header_value());
        }
        let response = builder
            .timeout(request.timeout)
            .send()
            .await
            .map_err(|e| LoadError::from_reqwest(&request.url, &e))?;

        let status = response.status();
        if !status.is_success() {
            debug!(%status, "Segment request rejected");
            return Err(LoadError::HttpStatus {
                status: status.as_u16(),
                url: request.url,
            });
        }
        let total = response.content_length().map(|len| len as usize);
        trace!(?total, version = ?response.version(), "Segment response");

        let url = request.url.clone();
        let body = response
            .bytes_stream()
            .map(move |chunk| chunk.map_err(|e| LoadError::from_reqwest(&url, &e)));
        let mut response = read_body(body, request.high_water_mark, on_progress).await?;
        response.stats.total = total;
        Ok(response)
    }
}

/// Drain a body stream, emitting a progress chunk each time `high_water_mark`
/// bytes have accumulated.
pub async fn read_body<S>(
    body: S,
    high_water_mark: Option<usize>,
    mut on_progress: Option<ProgressCallback>,
) -> Result<LoadResponse, LoadError>
where
    S: Stream<Item = Result<Bytes, LoadError>>,
{
    let mut body = std::pin::pin!(body);
    let mut cache = ChunkCache::new();
    let mut stats = LoadStats::default();

    while let Some(chunk) = body.next().await {
        let chunk = chunk?;
        stats.loaded += chunk.len();
        cache.push(chunk);
        if let (Some(mark), Some(callback)) = (high_water_mark, on_progress.as_mut())
            && cache.len() >= mark
        {
            stats.chunks += 1;
            callback(cache.flush());
        }
    }

    Ok(LoadResponse {
        data: cache.flush(),
        stats,
    })
}
