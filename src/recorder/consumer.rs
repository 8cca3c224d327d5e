use futures::StreamExt;
use log::{debug, error, info, warn};
use reqwest::Client;
use url::Url;

use std::fs::File;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::{
    CompletionReason, RecorderOptions, RecordingError, RecordingRequest, SessionState, StateCell,
    StopSignal,
};

/**
 * Performs one streaming GET and copies the body into the destination file
 * until the remote closes the stream or a stop is requested.
 */
pub(crate) struct StreamConsumer {
    client: Client,
    url: Url,
    destination: PathBuf,
    chunk_size: usize,
    bytes_written: Arc<AtomicU64>,
    state: StateCell,
}

impl StreamConsumer {
    pub(crate) fn new(
        request: &RecordingRequest,
        options: &RecorderOptions,
        bytes_written: Arc<AtomicU64>,
        state: StateCell,
    ) -> Result<Self, RecordingError> {
        let client = Client::builder()
            .connect_timeout(options.connect_timeout)
            .build()?;
        Ok(StreamConsumer {
            client,
            url: request.url().clone(),
            destination: request.destination().to_path_buf(),
            chunk_size: options.chunk_size,
            bytes_written,
            state,
        })
    }

    pub(crate) async fn run(
        self,
        mut stop: StopSignal,
    ) -> Result<CompletionReason, RecordingError> {
        debug!("Connecting to {}", self.url);
        let response = tokio::select! {
            biased;
            cause = stop.wait() => {
                info!("Stopped before {} answered", self.url);
                return Ok(cause.into());
            }
            response = self.client.get(self.url.clone()).send() => response,
        };

        // Nothing is created on disk unless the stream actually answered.
        let response = match response.and_then(|r| r.error_for_status()) {
            Ok(response) => response,
            Err(e) => {
                error!("Not able to connect to url {}: {}", self.url, e);
                self.state
                    .transition(SessionState::Terminated(CompletionReason::ConnectionFailed));
                return Ok(CompletionReason::ConnectionFailed);
            }
        };

        info!("Recording from URL: {}", self.url);
        info!("Writing to file: {}", self.destination.display());
        let mut file = match tokio::fs::File::create(&self.destination).await {
            Ok(file) => file.into_std().await,
            Err(e) => {
                error!("Error creating file {}: {}", self.destination.display(), e);
                return Err(e.into());
            }
        };

        let mut stream = response.bytes_stream();
        let mut chunks = 0u64;
        let reason = loop {
            let next = tokio::select! {
                biased;
                cause = stop.wait() => break cause.into(),
                next = stream.next() => next,
            };
            match next {
                Some(Ok(bytes)) => {
                    file = self.write_blocks(file, bytes).await?;
                    chunks += 1;
                }
                Some(Err(e)) => {
                    warn!("Connection to {} broke: {}", self.url, e);
                    break CompletionReason::StreamFailed;
                }
                None => {
                    info!("Remote closed the stream {}", self.url);
                    break CompletionReason::StreamEnded;
                }
            }
        };

        file.flush()?;
        drop(file);
        debug!(
            "Capture of {} done after {} network chunks",
            self.url, chunks
        );
        if matches!(
            reason,
            CompletionReason::StreamEnded | CompletionReason::StreamFailed
        ) {
            self.state.transition(SessionState::Terminated(reason));
        }
        Ok(reason)
    }

    /**
     * Writes one network chunk in blocks of at most `chunk_size` bytes, in
     * order, on the blocking pool. A block is counted only after the write
     * call for it has returned. The file is handed back for the next chunk.
     *
     * If the session aborts this task mid-write, the blocking call still
     * runs to completion and holds the file until then.
     */
    async fn write_blocks<B>(&self, mut file: File, bytes: B) -> Result<File, RecordingError>
    where
        B: AsRef<[u8]> + Send + 'static,
    {
        let chunk_size = self.chunk_size;
        let counter = Arc::clone(&self.bytes_written);
        let state = self.state.clone();

        let written = tokio::task::spawn_blocking(move || {
            for block in bytes.as_ref().chunks(chunk_size) {
                file.write_all(block)?;
                let before = counter.fetch_add(block.len() as u64, Ordering::SeqCst);
                if before == 0 {
                    state.advance(SessionState::Connecting, SessionState::Recording);
                }
            }
            Ok::<File, io::Error>(file)
        })
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
        .and_then(|written| written);

        written.map_err(|e| {
            error!("Error writing to file {}: {}", self.destination.display(), e);
            e.into()
        })
    }
}
