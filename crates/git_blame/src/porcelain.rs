use std::{
    fs::File,
    io::{self, BufRead, BufReader},
    path::Path,
};

use chrono::{DateTime, Utc};

use crate::BlameError;

const AUTHOR_PREFIX: &[u8] = b"author ";
const AUTHOR_MAIL_PREFIX: &[u8] = b"author-mail ";
const AUTHOR_TIME_PREFIX: &[u8] = b"author-time ";
const CONTENT_MARKER: u8 = b'\t';

/// Authorship of a single line of the blamed file.
///
/// Records are assembled from the metadata lines that precede each content line in
/// `git blame --line-porcelain` output. A record that was never given an `author-time`
/// carries the Unix epoch.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BlameLine {
    /// Display name of the last author to touch the line.
    pub author_name: String,
    /// Author email without the surrounding `<` and `>`.
    pub author_email: String,
    /// Author timestamp, second resolution.
    pub author_time: DateTime<Utc>,
    /// Source text of the line, without the leading tab or trailing newline.
    pub content: String,
}

#[derive(Debug, PartialEq, Eq)]
enum PorcelainLine<'a> {
    AuthorName(&'a [u8]),
    AuthorMail(&'a [u8]),
    AuthorTime(&'a [u8]),
    Content(&'a [u8]),
    Other,
}

fn classify(line: &[u8]) -> PorcelainLine<'_> {
    if let Some(rest) = line.strip_prefix(AUTHOR_PREFIX) {
        PorcelainLine::AuthorName(rest)
    } else if let Some(rest) = line.strip_prefix(AUTHOR_MAIL_PREFIX) {
        PorcelainLine::AuthorMail(rest)
    } else if let Some(rest) = line.strip_prefix(AUTHOR_TIME_PREFIX) {
        PorcelainLine::AuthorTime(rest)
    } else if let Some(rest) = line.strip_prefix(&[CONTENT_MARKER]) {
        PorcelainLine::Content(rest)
    } else {
        PorcelainLine::Other
    }
}

fn strip_email_delimiters(raw: &str) -> &str {
    let raw = raw.strip_prefix('<').unwrap_or(raw);
    raw.strip_suffix('>').unwrap_or(raw)
}

fn parse_author_time(raw: &[u8]) -> Option<DateTime<Utc>> {
    let seconds: i64 = std::str::from_utf8(raw).ok()?.parse().ok()?;
    DateTime::<Utc>::from_timestamp(seconds, 0)
}

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

/// Read errors that only mean the other end of the pipe already went away.
pub(crate) fn is_closed_stream(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe | io::ErrorKind::UnexpectedEof
    )
}

/// Line-oriented state machine for `git blame --line-porcelain` output.
///
/// Metadata fields are sticky: a field keeps its last value until a later line overwrites
/// it, so content lines whose metadata git elided inherit it from the previous record.
#[derive(Clone, Debug, Default)]
pub struct BlamePorcelainParser {
    current: BlameLine,
    line_number: usize,
}

impl BlamePorcelainParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forgets all accumulated metadata and restarts line numbering.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Number of lines consumed so far (1-based number of the last line).
    pub fn line_number(&self) -> usize {
        self.line_number
    }

    /// Feeds one porcelain line (a trailing `\n` is ignored).
    ///
    /// Returns `Ok(Some(_))` when the line is a content line, which completes a record.
    /// Unknown and blank lines are ignored. The only rejected input is an `author-time`
    /// value that is not a valid Unix timestamp.
    pub fn parse_line(&mut self, line: &[u8]) -> Result<Option<BlameLine>, BlameError> {
        self.line_number += 1;
        let line = line.strip_suffix(b"\n").unwrap_or(line);

        match classify(line) {
            PorcelainLine::AuthorName(name) => self.current.author_name = lossy(name),
            PorcelainLine::AuthorMail(mail) => {
                self.current.author_email = strip_email_delimiters(&lossy(mail)).to_string();
            }
            PorcelainLine::AuthorTime(raw) => {
                self.current.author_time =
                    parse_author_time(raw).ok_or_else(|| BlameError::MalformedTimestamp {
                        line_number: self.line_number,
                        value: lossy(raw),
                    })?;
            }
            PorcelainLine::Content(text) => {
                self.current.content = lossy(text);
                return Ok(Some(self.current.clone()));
            }
            PorcelainLine::Other => {}
        }
        Ok(None)
    }
}

/// Iterator over blame records read from previously captured porcelain output.
///
/// Yields at most one error, after which iteration stops.
pub struct BlamePorcelainReader<R: BufRead> {
    reader: R,
    parser: BlamePorcelainParser,
    buffer: Vec<u8>,
    done: bool,
}

impl<R: BufRead> BlamePorcelainReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            parser: BlamePorcelainParser::new(),
            buffer: Vec::new(),
            done: false,
        }
    }

    /// Consumes the iterator and returns the wrapped reader.
    pub fn into_inner(self) -> R {
        self.reader
    }
}

impl<R: BufRead> Iterator for BlamePorcelainReader<R> {
    type Item = Result<BlameLine, BlameError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        loop {
            self.buffer.clear();
            match self.reader.read_until(b'\n', &mut self.buffer) {
                Ok(0) => {
                    self.done = true;
                    return None;
                }
                Ok(_) => match self.parser.parse_line(&self.buffer) {
                    Ok(None) => continue,
                    Ok(Some(line)) => return Some(Ok(line)),
                    Err(err) => {
                        self.done = true;
                        return Some(Err(err));
                    }
                },
                Err(err) if is_closed_stream(&err) => {
                    self.done = true;
                    return None;
                }
                Err(err) => {
                    self.done = true;
                    return Some(Err(BlameError::StreamRead(err)));
                }
            }
        }
    }
}

pub type BlamePorcelainFileReader = BlamePorcelainReader<BufReader<File>>;

/// Opens porcelain output previously teed to a file for offline replay.
pub fn blame_porcelain_file(
    path: impl AsRef<Path>,
) -> Result<BlamePorcelainFileReader, BlameError> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|source| BlameError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(BlamePorcelainReader::new(BufReader::new(file)))
}
