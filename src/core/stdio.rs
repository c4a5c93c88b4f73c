/// STDIO Transport
///
/// Line-delimited JSON-RPC over any async reader/writer pair (stdin/stdout in
/// production, in-memory pipes in tests). Every line is decoded and
/// dispatched as its own task, so a slow tool never blocks requests behind
/// it. One writer task owns the output and writes whole lines, flushing after
/// each response.
///
/// A line that fails to decode is answered with a parse-error envelope and
/// the loop keeps going. End of input waits for in-flight requests and then
/// returns. Write failures end the loop with an error.

use std::sync::Arc;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::core::dispatcher::Dispatcher;
use crate::core::envelope::{ParseError, Request, Response};

/// Queue depth between dispatch tasks and the writer.
const OUTPUT_QUEUE: usize = 256;

/// One input line as read by `read_frame`.
#[derive(Debug, PartialEq, Eq)]
enum Frame {
    Line,
    /// Longer than the limit; its bytes were discarded up to the newline.
    Oversized,
}

/// Run the MCP server on the process's stdin/stdout.
pub async fn run_server_stdio(
    dispatcher: Arc<Dispatcher>,
    max_line_bytes: usize,
) -> std::io::Result<()> {
    info!(
        name = %dispatcher.info().name,
        version = %dispatcher.info().version,
        max_line_bytes,
        "MCP server starting (STDIO mode)"
    );
    // 8KB buffers balance memory usage with I/O efficiency
    let stdin = BufReader::with_capacity(8192, tokio::io::stdin());
    let stdout = BufWriter::with_capacity(8192, tokio::io::stdout());
    serve_lines(dispatcher, stdin, stdout, max_line_bytes).await
}

/// Serve requests from `input` until end of input.
///
/// Lines are handled as raw bytes: invalid UTF-8 and lines longer than
/// `max_line_bytes` are answered with a parse error like any other
/// malformed payload.
pub async fn serve_lines<R, W>(
    dispatcher: Arc<Dispatcher>,
    mut input: R,
    output: W,
    max_line_bytes: usize,
) -> std::io::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel::<String>(OUTPUT_QUEUE);
    let writer = tokio::spawn(write_lines(output, rx));
    let mut in_flight = JoinSet::new();
    let mut buf = Vec::new();

    let read_result = loop {
        let frame = match read_frame(&mut input, &mut buf, max_line_bytes).await {
            Ok(Some(frame)) => frame,
            Ok(None) => break Ok(()),
            Err(e) => break Err(e),
        };
        // Writer stopped on an output error; it is reported below.
        if tx.is_closed() {
            break Ok(());
        }
        // Reap finished tasks so the set does not grow with the session.
        while in_flight.try_join_next().is_some() {}

        let decoded = match frame {
            Frame::Oversized => Err(ParseError {
                id: None,
                message: format!("line exceeds {max_line_bytes} bytes"),
            }),
            Frame::Line => match std::str::from_utf8(&buf) {
                Ok(line) if line.trim().is_empty() => continue,
                Ok(line) => Request::decode(line),
                Err(e) => Err(ParseError {
                    id: None,
                    message: e.to_string(),
                }),
            },
        };
        let request = match decoded {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "stdio: undecodable line");
                if tx.send(e.into_response().encode()).await.is_err() {
                    break Ok(());
                }
                continue;
            }
        };

        let dispatcher = Arc::clone(&dispatcher);
        let tx = tx.clone();
        in_flight.spawn(async move {
            let notification = request.is_notification();
            let response: Response = dispatcher.handle(request).await;
            if notification {
                debug!("stdio: notification handled, no response");
                return;
            }
            // Writer gone means output already failed; the result is dropped.
            let _ = tx.send(response.encode()).await;
        });
    };

    while in_flight.join_next().await.is_some() {}
    drop(tx);

    let write_result = writer
        .await
        .map_err(|e| std::io::Error::other(format!("stdio writer task failed: {e}")))?;
    read_result.and(write_result)
}

/// Read one newline-terminated line into `buf` (newline excluded), holding
/// at most `max` bytes. `None` at end of input.
async fn read_frame<R>(input: &mut R, buf: &mut Vec<u8>, max: usize) -> std::io::Result<Option<Frame>>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    let mut oversized = false;
    let mut read_any = false;
    loop {
        let available = input.fill_buf().await?;
        if available.is_empty() {
            break;
        }
        read_any = true;
        let (chunk, used, done) = match available.iter().position(|b| *b == b'\n') {
            Some(i) => (&available[..i], i + 1, true),
            None => (available, available.len(), false),
        };
        if !oversized {
            if buf.len() + chunk.len() > max {
                oversized = true;
                buf.clear();
            } else {
                buf.extend_from_slice(chunk);
            }
        }
        input.consume(used);
        if done {
            break;
        }
    }
    if !read_any {
        return Ok(None);
    }
    if oversized {
        return Ok(Some(Frame::Oversized));
    }
    if buf.last() == Some(&b'\r') {
        buf.pop();
    }
    Ok(Some(Frame::Line))
}

async fn write_lines<W>(mut output: W, mut rx: mpsc::Receiver<String>) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(line) = rx.recv().await {
        output.write_all(line.as_bytes()).await?;
        output.write_all(b"\n").await?;
        // Flush after each response for low latency
        output.flush().await?;
    }
    Ok(())
}
