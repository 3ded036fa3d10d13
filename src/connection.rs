//! Per-connection request loop and the hijackable request object.
//!
//! The completion signal is a `tokio::sync::watch<bool>` rather than a
//! bare closed-channel flag, so that both the connection handler and
//! the container actor's idle-timer watcher can observe completion
//! without racing: `watch` always returns the current value regardless
//! of when a reader starts waiting.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::WriteHalf;
use tokio::net::UnixStream;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tracing::{error, warn};

use crate::container::ContainerHandle;
use crate::protocol::{
    EchoResponse, FrameReader, FrameWriter, ListResponse, PingResponse, Request, Response,
};
use crate::registry::Registry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HijackState {
    Fresh,
    Hijacked,
    Done,
}

/// Wraps one decoded request together with the means to answer it.
/// `write_response` implies completion unless the request has been
/// hijacked, in which case the hijacking handler must call
/// `mark_done` itself once its asynchronous work is finished.
pub struct PendingRequest {
    writer: Arc<AsyncMutex<FrameWriter<WriteHalf<UnixStream>>>>,
    state: Mutex<HijackState>,
    done_tx: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,
}

impl PendingRequest {
    pub fn new(writer: Arc<AsyncMutex<FrameWriter<WriteHalf<UnixStream>>>>) -> Arc<Self> {
        let (done_tx, done_rx) = watch::channel(false);
        Arc::new(Self {
            writer,
            state: Mutex::new(HijackState::Fresh),
            done_tx,
            done_rx,
        })
    }

    /// Write a response frame. If the request hasn't been hijacked,
    /// this also marks it done.
    pub async fn write_response(&self, response: &Response) -> std::io::Result<()> {
        {
            let mut w = self.writer.lock().await;
            w.write_response(response)
                .await
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        }

        let mut state = self.state.lock();
        if *state == HijackState::Fresh {
            *state = HijackState::Done;
            let _ = self.done_tx.send(true);
        }
        Ok(())
    }

    /// Disable the "write implies done" behaviour. Exactly-once;
    /// calling this twice, or after the request is already done, is a
    /// programming error.
    pub fn hijack(&self) {
        let mut state = self.state.lock();
        match *state {
            HijackState::Fresh => *state = HijackState::Hijacked,
            other => panic!("hijack on a request in state {:?}, expected Fresh", other),
        }
    }

    /// Explicitly complete a hijacked request. A programming error if
    /// called on a request that wasn't hijacked, or was already done.
    pub fn mark_done(&self) {
        let mut state = self.state.lock();
        match *state {
            HijackState::Hijacked => {
                *state = HijackState::Done;
                let _ = self.done_tx.send(true);
            }
            other => panic!("mark_done on a request in state {:?}, expected Hijacked", other),
        }
    }

    /// Resolve once this request is marked done, whether that
    /// happened before or after this call started.
    pub async fn wait_done(&self) {
        let mut rx = self.done_rx.clone();
        if *rx.borrow() {
            return;
        }
        let _ = rx.changed().await;
    }
}

/// Drive one accepted connection: read a request, dispatch it, wait
/// for completion, repeat until the peer closes the socket.
pub async fn handle_connection(
    stream: UnixStream,
    registry: Arc<Registry<ContainerHandle>>,
    create: impl Fn() -> Arc<ContainerHandle> + Send + Sync + 'static,
) {
    let (read_half, write_half) = tokio::io::split(stream);
    let mut reader = FrameReader::new(read_half);
    let writer = Arc::new(AsyncMutex::new(FrameWriter::new(write_half)));

    loop {
        let request = match reader.read_request().await {
            Ok(req) => req,
            Err(e) => {
                warn!("connection closed or protocol error: {}", e);
                return;
            }
        };

        let pending = PendingRequest::new(Arc::clone(&writer));

        match &request {
            Request::Ping(_) => {
                let _ = pending.write_response(&Response::Ping(PingResponse {})).await;
            }
            Request::Echo(echo) => {
                let resp = Response::Echo(EchoResponse {
                    message: echo.message.clone(),
                });
                let _ = pending.write_response(&resp).await;
            }
            Request::List(_) => {
                let resp = Response::List(ListResponse {
                    handles: registry.handles(),
                });
                let _ = pending.write_response(&resp).await;
            }
            Request::Create(_) => {
                let container = create();
                if let Err(e) = container.execute(request, Arc::clone(&pending)).await {
                    error!("container actor rejected create: {}", e);
                    let _ = pending
                        .write_response(&Response::error(format!("internal error: {}", e)))
                        .await;
                }
            }
            other => {
                if let Some(handle) = other.handle() {
                    match registry.find(handle) {
                        Some(container) => {
                            if let Err(e) = container.execute(request, Arc::clone(&pending)).await
                            {
                                let _ = pending
                                    .write_response(&Response::error(format!(
                                        "container no longer accepting requests: {}",
                                        e
                                    )))
                                    .await;
                            }
                        }
                        None => {
                            let _ = pending
                                .write_response(&Response::error(format!(
                                    "unknown handle: {}",
                                    handle
                                )))
                                .await;
                        }
                    }
                } else {
                    let _ = pending
                        .write_response(&Response::error("unknown request"))
                        .await;
                }
            }
        }

        pending.wait_done().await;
    }
}
