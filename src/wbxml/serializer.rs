use std::io::{self, Read, Write};

use tracing::trace;

use super::{control, header};
use crate::error::{Error, Result};
use crate::tags::{self, Tag};

/// Writes a WBXML document.
///
/// Element tokens are held back until it is known whether the element has
/// content, so `start(t)` immediately followed by `end()` collapses into a
/// single degenerate token without the with-content bit. Builder calls chain:
///
/// ```no_run
/// # use eas_client::wbxml::Serializer;
/// # use eas_client::tags;
/// # fn build() -> eas_client::error::Result<Vec<u8>> {
/// let mut s = Serializer::new(Vec::new())?;
/// s.start(tags::SYNC_SYNC)?
///     .data(tags::SYNC_STATUS, "1")?
///     .end()?
///     .done()?;
/// # Ok(s.into_inner())
/// # }
/// ```
pub struct Serializer<W: Write> {
    out: W,
    page: u8,
    pending: Option<Tag>,
    open: Vec<Tag>,
}

impl<W: Write> Serializer<W> {
    /// Starts a new document on `out`, writing the WBXML header.
    pub fn new(mut out: W) -> Result<Serializer<W>> {
        out.write_all(&[
            header::VERSION_1_3,
            header::PUBLIC_ID_UNKNOWN,
            header::CHARSET_UTF8,
            header::EMPTY_STRING_TABLE,
        ])?;
        Ok(Serializer {
            out,
            page: 0,
            pending: None,
            open: Vec::new(),
        })
    }

    /// Opens an element.
    pub fn start(&mut self, tag: Tag) -> Result<&mut Self> {
        self.flush_pending(false)?;
        self.pending = Some(tag);
        self.open.push(tag);
        Ok(self)
    }

    /// Closes the innermost open element.
    pub fn end(&mut self) -> Result<&mut Self> {
        let closed = self.open.last().copied().ok_or_else(|| {
            Error::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                "end() without a matching start()",
            ))
        })?;
        if self.pending.is_some() {
            // Nothing was written inside; emit the degenerate form.
            self.flush_pending(true)?;
        } else {
            self.out.write_all(&[control::END])?;
        }
        self.open.pop();
        trace!(depth = self.open.len(), "</{}>", closed);
        Ok(self)
    }

    /// Writes an element with no content.
    pub fn tag(&mut self, tag: Tag) -> Result<&mut Self> {
        self.start(tag)?.end()
    }

    /// Writes an element wrapping a single text value.
    pub fn data(&mut self, tag: Tag, value: &str) -> Result<&mut Self> {
        self.start(tag)?.text(value)?.end()
    }

    /// Writes an inline string into the current element.
    pub fn text(&mut self, value: &str) -> Result<&mut Self> {
        self.flush_pending(false)?;
        self.out.write_all(&[control::STR_I])?;
        self.out.write_all(value.as_bytes())?;
        self.out.write_all(&[0])?;
        trace!(depth = self.open.len(), "text: {:?}", value);
        Ok(self)
    }

    /// Writes `length` bytes from `source` as an opaque block. A zero-length
    /// block writes nothing at all, leaving the surrounding element empty.
    pub fn opaque<R: Read>(&mut self, source: &mut R, length: usize) -> Result<&mut Self> {
        self.write_opaque_header(length)?;
        let mut remaining = length;
        let mut buf = [0u8; 8192];
        while remaining > 0 {
            let want = remaining.min(buf.len());
            let n = source.read(&mut buf[..want])?;
            if n == 0 {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "opaque source ended before the promised length",
                )));
            }
            self.out.write_all(&buf[..n])?;
            remaining -= n;
        }
        trace!(depth = self.open.len(), "opaque: {} bytes", length);
        Ok(self)
    }

    /// Writes only the opaque marker and length, leaving the caller to stream
    /// the payload bytes directly to the output. Useful when the payload is
    /// large and its length is known up front. A zero length is a no-op.
    pub fn write_opaque_header(&mut self, length: usize) -> Result<&mut Self> {
        if length == 0 {
            return Ok(self);
        }
        self.flush_pending(false)?;
        self.out.write_all(&[control::OPAQUE])?;
        write_integer(&mut self.out, length as u32)?;
        Ok(self)
    }

    /// Finishes the document. Fails if any element is still open.
    pub fn done(&mut self) -> Result<()> {
        if let Some(&unclosed) = self.open.last() {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("document finished with <{}> still open", unclosed),
            )));
        }
        self.out.flush()?;
        Ok(())
    }

    /// Consumes the serializer, returning the underlying writer.
    pub fn into_inner(self) -> W {
        self.out
    }

    fn flush_pending(&mut self, degenerate: bool) -> Result<()> {
        let Some(tag) = self.pending.take() else {
            return Ok(());
        };
        if tag.page() != self.page {
            self.page = tag.page();
            self.out.write_all(&[control::SWITCH_PAGE, self.page])?;
            trace!(
                "switch page -> {}",
                tags::page_name(self.page).unwrap_or("?")
            );
        }
        let token = if degenerate {
            tag.code()
        } else {
            tag.code() | control::WITH_CONTENT
        };
        self.out.write_all(&[token])?;
        if degenerate {
            trace!(depth = self.open.len().saturating_sub(1), "<{}/>", tag);
        } else {
            trace!(depth = self.open.len().saturating_sub(1), "<{}>", tag);
        }
        Ok(())
    }
}

impl Serializer<Vec<u8>> {
    /// The document bytes written so far. Only meaningful after `done()`.
    pub fn as_bytes(&self) -> &[u8] {
        &self.out
    }
}

/// Writes a multi-byte integer: base-128 groups, most significant first, the
/// continuation bit set on every byte but the last.
pub fn write_integer<W: Write>(out: &mut W, mut value: u32) -> io::Result<()> {
    let mut groups = [0u8; 5];
    let mut n = 0;
    loop {
        groups[n] = (value & 0x7f) as u8;
        value >>= 7;
        n += 1;
        if value == 0 {
            break;
        }
    }
    while n > 1 {
        n -= 1;
        out.write_all(&[groups[n] | 0x80])?;
    }
    out.write_all(&[groups[0]])
}
