use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    porcelain::{is_closed_stream, BlamePorcelainParser},
    BlameError, BlameLine, HandlerError,
};

/// Destination for a verbatim copy of the porcelain stream.
pub type DynRawSink<'a> = &'a mut (dyn AsyncWrite + Unpin + Send);

/// Totals from a single pass over a porcelain stream.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub(crate) struct ParseSummary {
    pub(crate) lines: usize,
    pub(crate) records: usize,
    pub(crate) cancelled: bool,
}

struct RawSink<'a> {
    writer: BufWriter<DynRawSink<'a>>,
}

impl<'a> RawSink<'a> {
    fn new(sink: DynRawSink<'a>) -> Self {
        Self {
            writer: BufWriter::new(sink),
        }
    }

    async fn write_line(&mut self, line: &[u8]) -> Result<(), std::io::Error> {
        self.writer.write_all(line).await?;
        self.writer.write_all(b"\n").await
    }

    async fn flush(&mut self) -> Result<(), std::io::Error> {
        self.writer.flush().await
    }
}

/// Parses `git blame --line-porcelain` output from `reader`, calling `handler` once per
/// blamed line.
///
/// When `sink` is provided every raw line is copied to it (newline terminated) before it is
/// interpreted, so the sink can later be replayed through this function or
/// [`crate::BlamePorcelainReader`] without running git again. End of stream is success.
pub async fn parse_porcelain<R, F, E>(
    reader: R,
    handler: F,
    sink: Option<DynRawSink<'_>>,
) -> Result<(), BlameError>
where
    R: AsyncRead + Unpin,
    F: FnMut(BlameLine) -> Result<(), E>,
    E: Into<HandlerError>,
{
    parse_porcelain_with_cancellation(&CancellationToken::new(), reader, handler, sink).await
}

/// Cancellable variant of [`parse_porcelain`].
///
/// `cancel` is checked once per line; after it fires no further handler calls are made and
/// the function returns `Ok(())`.
pub async fn parse_porcelain_with_cancellation<R, F, E>(
    cancel: &CancellationToken,
    reader: R,
    mut handler: F,
    sink: Option<DynRawSink<'_>>,
) -> Result<(), BlameError>
where
    R: AsyncRead + Unpin,
    F: FnMut(BlameLine) -> Result<(), E>,
    E: Into<HandlerError>,
{
    drive_porcelain(cancel, reader, &mut handler, sink)
        .await
        .map(|_| ())
}

pub(crate) async fn drive_porcelain<R, F, E>(
    cancel: &CancellationToken,
    reader: R,
    handler: &mut F,
    sink: Option<DynRawSink<'_>>,
) -> Result<ParseSummary, BlameError>
where
    R: AsyncRead + Unpin,
    F: FnMut(BlameLine) -> Result<(), E>,
    E: Into<HandlerError>,
{
    let mut sink = sink.map(RawSink::new);
    let result = forward_lines(cancel, reader, handler, sink.as_mut()).await;

    match (result, sink.as_mut()) {
        (Ok(summary), Some(sink)) => {
            sink.flush().await.map_err(BlameError::SinkWrite)?;
            Ok(summary)
        }
        (Err(err), Some(sink)) => {
            let _ = sink.flush().await;
            Err(err)
        }
        (result, None) => result,
    }
}

async fn forward_lines<R, F, E>(
    cancel: &CancellationToken,
    reader: R,
    handler: &mut F,
    mut sink: Option<&mut RawSink<'_>>,
) -> Result<ParseSummary, BlameError>
where
    R: AsyncRead + Unpin,
    F: FnMut(BlameLine) -> Result<(), E>,
    E: Into<HandlerError>,
{
    let mut reader = BufReader::new(reader);
    let mut parser = BlamePorcelainParser::new();
    let mut buffer = Vec::new();
    let mut summary = ParseSummary::default();

    loop {
        buffer.clear();
        match reader.read_until(b'\n', &mut buffer).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(err) if is_closed_stream(&err) => {
                debug!(error = %err, "blame stream closed while reading; treating as end of output");
                break;
            }
            Err(err) => return Err(BlameError::StreamRead(err)),
        }

        if cancel.is_cancelled() {
            debug!(
                lines = summary.lines,
                records = summary.records,
                "blame parse cancelled"
            );
            summary.cancelled = true;
            break;
        }
        summary.lines += 1;

        if let Some(sink) = sink.as_mut() {
            let raw = buffer.strip_suffix(b"\n").unwrap_or(&buffer[..]);
            sink.write_line(raw).await.map_err(BlameError::SinkWrite)?;
        }

        if let Some(record) = parser.parse_line(&buffer)? {
            summary.records += 1;
            handler(record).map_err(|err| BlameError::Handler {
                line_number: parser.line_number(),
                source: err.into(),
            })?;
        }
    }

    Ok(summary)
}
