// SPDX-License-Identifier: MIT OR Apache-2.0
//! The worker host: drives one execution inside a child process.
//!
//! Generic over the pipe halves so tests can run it over in-memory duplex
//! streams; the agent binary connects it to stdin/stdout.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, warn};
use weft_blob::BlobStore;
use weft_codec::SerialiserRegistry;
use weft_core::{Data, ErrorDetail, TargetError};

use crate::channel::Channel;
use crate::context;
use crate::frame::{encode_line, ChildFrame, ParentFrame, StartExecution};
use crate::registry::Registry;
use crate::WorkerError;

/// Hosts a single execution: pumps the parent pipe, materialises arguments,
/// runs the target on a blocking thread, and reports exactly one terminal
/// frame.
pub struct WorkerHost {
    registry: Arc<Registry>,
    store: Arc<dyn BlobStore>,
    serialisers: SerialiserRegistry,
    threshold: usize,
    process_scoped: bool,
}

impl WorkerHost {
    /// A host over the given registry, blob store, and codec registry.
    pub fn new(
        registry: Arc<Registry>,
        store: Arc<dyn BlobStore>,
        serialisers: SerialiserRegistry,
        threshold: usize,
    ) -> Self {
        Self {
            registry,
            store,
            serialisers,
            threshold,
            process_scoped: true,
        }
    }

    /// Whether the host owns its process: sets the working directory and
    /// hooks SIGINT. Disable when embedding in another process (tests).
    pub fn process_scoped(mut self, scoped: bool) -> Self {
        self.process_scoped = scoped;
        self
    }

    /// Run one execution over the given pipe halves until its terminal
    /// frame is flushed.
    pub async fn run<R, W>(&self, reader: R, writer: W) -> Result<(), WorkerError>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let mut lines = BufReader::new(reader).lines();
        let start = match lines.next_line().await? {
            Some(line) => match crate::frame::decode_line::<ParentFrame>(&line)? {
                ParentFrame::Start { execution } => execution,
                other => {
                    return Err(WorkerError::Protocol(format!(
                        "expected start frame, got {other:?}"
                    )))
                }
            },
            None => return Err(WorkerError::Protocol("pipe closed before start".into())),
        };
        debug!(
            target: "weft_worker",
            execution_id = start.execution_id,
            target_name = %start.target,
            "starting execution"
        );

        // Fresh ephemeral working directory, removed when the guard drops.
        let scratch = tempfile::tempdir()?;
        let working_dir = scratch.path().canonicalize()?;
        if self.process_scoped {
            std::env::set_current_dir(&working_dir)?;
        }

        let (channel, mut frame_rx) = Channel::new(
            start.execution_id,
            working_dir,
            tokio::runtime::Handle::current(),
            self.store.clone(),
            self.serialisers.clone(),
            self.threshold,
        );

        // Writer pump: child frames out as JSONL.
        let mut writer = writer;
        let writer_task = tokio::spawn(async move {
            while let Some(frame) = frame_rx.recv().await {
                let line = match encode_line(&frame) {
                    Ok(line) => line,
                    Err(err) => {
                        warn!(target: "weft_worker", %err, "dropping unencodable frame");
                        continue;
                    }
                };
                if writer.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
                if writer.flush().await.is_err() {
                    break;
                }
            }
        });

        // Reader pump: parent responses back into the channel.
        let reader_task = {
            let channel = channel.clone();
            tokio::spawn(async move {
                while let Ok(Some(line)) = lines.next_line().await {
                    match crate::frame::decode_line::<ParentFrame>(&line) {
                        Ok(ParentFrame::Response { id, result }) => {
                            channel.complete_request(id, Ok(result));
                        }
                        Ok(ParentFrame::ResponseError { id, error }) => {
                            channel.complete_request(id, Err(error));
                        }
                        Ok(ParentFrame::Start { .. }) => {
                            warn!(target: "weft_worker", "duplicate start frame ignored");
                        }
                        Err(err) => {
                            warn!(target: "weft_worker", %err, "dropping malformed frame");
                        }
                    }
                }
                // Unblock anything still waiting on the dead pipe.
                channel.fail_pending("parent pipe closed");
            })
        };

        #[cfg(unix)]
        let signal_task = if self.process_scoped {
            let channel = channel.clone();
            Some(tokio::spawn(async move {
                let mut interrupt =
                    match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
                    {
                        Ok(interrupt) => interrupt,
                        Err(_) => return,
                    };
                interrupt.recv().await;
                channel.mark_aborted();
            }))
        } else {
            None
        };

        self.execute(&start, &channel).await;

        // Release every channel clone so the writer pump drains the
        // terminal frame and exits; the timeout covers stray user threads
        // still holding handles.
        context::teardown();
        reader_task.abort();
        let _ = reader_task.await;
        #[cfg(unix)]
        if let Some(task) = signal_task {
            task.abort();
            let _ = task.await;
        }
        drop(channel);
        let _ = tokio::time::timeout(Duration::from_secs(2), writer_task).await;
        Ok(())
    }

    /// Materialise arguments, run the target, and emit the terminal frame.
    async fn execute(&self, start: &StartExecution, channel: &Channel) {
        let Some(registered) = self.registry.get(&start.repository, &start.target) else {
            channel.send_terminal(ChildFrame::Error {
                error: ErrorDetail::new(
                    "unknown_target",
                    format!("unknown target {}:{}", start.repository, start.target),
                ),
            });
            return;
        };

        if let Err(err) =
            Registry::check_arguments(&registered.definition, start.arguments.len())
        {
            self.report_error(channel, err);
            return;
        }

        // Arguments are processed once, before the executing signal; a
        // failure here is a user error and the target is not invoked.
        let capabilities = channel.capabilities();
        let mut arguments = Vec::with_capacity(start.arguments.len());
        for value in &start.arguments {
            match weft_codec::deserialise(
                value,
                &self.serialisers,
                self.store.as_ref(),
                &capabilities,
            )
            .await
            {
                Ok(data) => arguments.push(data),
                Err(err) => {
                    channel.send_terminal(ChildFrame::Error {
                        error: ErrorDetail::new("argument_error", err.to_string()),
                    });
                    return;
                }
            }
        }

        channel.send_frame(ChildFrame::Executing);

        context::install(channel.clone());
        let handler = registered.handler.clone();
        let outcome = tokio::task::spawn_blocking(move || {
            std::panic::catch_unwind(AssertUnwindSafe(|| handler.run(arguments)))
        })
        .await;

        match outcome {
            Ok(Ok(Ok(data))) => match self.serialise_result(&data).await {
                Ok(value) => {
                    channel.send_terminal(ChildFrame::Result { value });
                }
                Err(err) => self.report_error(channel, err),
            },
            Ok(Ok(Err(err))) => self.report_error(channel, err),
            Ok(Err(panic)) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "target panicked".to_string());
                channel.send_terminal(ChildFrame::Error {
                    error: ErrorDetail::new("panic", message),
                });
            }
            Err(join) => {
                channel.send_terminal(ChildFrame::Error {
                    error: ErrorDetail::new("panic", join.to_string()),
                });
            }
        }
    }

    async fn serialise_result(&self, data: &Data) -> Result<weft_core::Value, TargetError> {
        weft_codec::serialise(data, &self.serialisers, self.store.as_ref(), self.threshold)
            .await
            .map_err(|err| TargetError::failure("serialisation_error", err.to_string()))
    }

    fn report_error(&self, channel: &Channel, err: TargetError) {
        match err {
            TargetError::Suspended {
                execute_after_ms,
                waiting_on,
            } => {
                channel.send_terminal(ChildFrame::Suspend {
                    execute_after_ms,
                    waiting_on,
                });
            }
            failure => {
                let detail = failure.detail().expect("failure carries a detail");
                channel.send_terminal(ChildFrame::Error { error: detail });
            }
        }
    }
}
