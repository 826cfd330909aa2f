use std::io::Read;

use tracing::trace;

use super::control;
use crate::error::{Error, Result};
use crate::tags::Tag;

/// One step of the token stream, as surfaced to command parsers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Token {
    /// An element opened. The element may still turn out to be empty; an
    /// empty element yields its `End` on the next call.
    Start(Tag),
    /// The element a parser was scanning closed.
    End,
    /// The document ended. Only returned at document level.
    EndDocument,
}

/// Reads a WBXML document as a stream of [`Token`]s.
///
/// The reading discipline mirrors the element structure: after
/// `Token::Start(t)`, a parser either reads the element's value with one of
/// the `value*` methods, descends with `next_tag(t)`, or discards the whole
/// subtree with `skip_tag()`. Unknown elements must be skipped, never
/// treated as fatal, so newer servers keep working.
pub struct Parser<R: Read> {
    input: R,
    page: u8,
    /// Elements currently open, innermost last.
    stack: Vec<Tag>,
    /// Set when the most recent start token had no content; the matching
    /// `End` is synthesized on the next read.
    no_content: bool,
}

impl<R: Read> Parser<R> {
    /// Wraps `input` and consumes the document header.
    ///
    /// Returns [`Error::EmptyStream`] if `input` yields no bytes at all;
    /// several commands use an empty body as a valid "nothing to report"
    /// response, and callers tell that apart from a truncated document.
    pub fn new(input: R) -> Result<Parser<R>> {
        let mut parser = Parser {
            input,
            page: 0,
            stack: Vec::new(),
            no_content: false,
        };
        let version = match parser.read_byte()? {
            Some(b) => b,
            None => return Err(Error::EmptyStream),
        };
        trace!("wbxml version byte 0x{:02x}", version);
        let _public_id = parser.read_int()?;
        let _charset = parser.read_int()?;
        let string_table_len = parser.read_int()?;
        if string_table_len != 0 {
            return Err(Error::MalformedProtocol(
                "unexpected string table in document header".into(),
            ));
        }
        Ok(parser)
    }

    /// Advances to the next element inside `ending`, returning
    /// [`Token::End`] once `ending` itself closes. Intervening text, opaque
    /// data, and ends of other (empty) elements are passed over.
    pub fn next_tag(&mut self, ending: Tag) -> Result<Token> {
        self.advance(Some(ending))
    }

    /// Advances to the next element at document level.
    pub fn next_tag_in_document(&mut self) -> Result<Token> {
        self.advance(None)
    }

    /// Consumes the document start and requires the root element to be
    /// `root`.
    pub fn expect_document_start(&mut self, root: Tag) -> Result<()> {
        match self.next_tag_in_document()? {
            Token::Start(tag) if tag == root => Ok(()),
            Token::Start(tag) => Err(Error::MalformedProtocol(format!(
                "expected <{}> as document root, found <{}>",
                root, tag
            ))),
            _ => Err(Error::MalformedProtocol(format!(
                "expected <{}> as document root, found nothing",
                root
            ))),
        }
    }

    /// Reads the current element's content as a UTF-8 string and consumes
    /// its end. An empty element yields an empty string.
    pub fn value(&mut self) -> Result<String> {
        let bytes = self.value_bytes()?;
        String::from_utf8(bytes)
            .map_err(|_| Error::MalformedProtocol("element text is not valid UTF-8".into()))
    }

    /// Reads the current element's content as a non-negative integer. An
    /// empty element yields 0, which some servers send for counters.
    pub fn value_int(&mut self) -> Result<u32> {
        let text = self.value()?;
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Ok(0);
        }
        trimmed
            .parse()
            .map_err(|_| Error::MalformedProtocol(format!("expected an integer, got {:?}", text)))
    }

    /// Reads the current element's content as raw bytes (inline string
    /// bytes without the terminator, or an opaque block) and consumes its
    /// end.
    pub fn value_bytes(&mut self) -> Result<Vec<u8>> {
        if self.no_content {
            self.no_content = false;
            self.stack.pop();
            return Ok(Vec::new());
        }
        let mut data = Vec::new();
        loop {
            match self.require_byte("element value")? {
                control::SWITCH_PAGE => {
                    self.page = self.require_byte("codepage after SWITCH_PAGE")?;
                }
                control::END => {
                    self.stack.pop();
                    trace!(depth = self.stack.len(), "value: {} bytes", data.len());
                    return Ok(data);
                }
                control::STR_I => loop {
                    match self.require_byte("inline string")? {
                        0 => break,
                        b => data.push(b),
                    }
                },
                control::OPAQUE => {
                    let len = self.read_int()? as usize;
                    let start = data.len();
                    data.resize(start + len, 0);
                    self.input.read_exact(&mut data[start..])?;
                }
                other => {
                    return Err(Error::MalformedProtocol(format!(
                        "expected element value, found token 0x{:02x}",
                        other
                    )));
                }
            }
        }
    }

    /// Discards the current element and everything inside it.
    pub fn skip_tag(&mut self) -> Result<()> {
        let target = self.stack.len().saturating_sub(1);
        while self.stack.len() > target {
            // A degenerate element never produces an END token on the wire;
            // close it here or the skip runs past the subtree.
            if self.no_content {
                self.no_content = false;
                self.stack.pop();
                continue;
            }
            self.step("skipped subtree")?;
        }
        Ok(())
    }

    fn advance(&mut self, ending: Option<Tag>) -> Result<Token> {
        if self.no_content {
            self.no_content = false;
            let closed = self.stack.pop();
            if closed.is_some() && closed == ending {
                return Ok(Token::End);
            }
        }
        loop {
            match self.step_token(ending.is_none())? {
                Step::Start(tag) => return Ok(Token::Start(tag)),
                Step::End(tag) => {
                    if Some(tag) == ending {
                        return Ok(Token::End);
                    }
                }
                Step::Data => {}
                Step::Eof => return Ok(Token::EndDocument),
            }
        }
    }

    fn step(&mut self, context: &'static str) -> Result<()> {
        match self.step_token(false)? {
            Step::Eof => Err(Error::MalformedProtocol(format!(
                "unexpected end of document in {}",
                context
            ))),
            _ => Ok(()),
        }
    }

    /// Reads one raw token. Text and opaque payloads are consumed and
    /// discarded; value extraction goes through `value_bytes` instead.
    fn step_token(&mut self, at_document_level: bool) -> Result<Step> {
        loop {
            let byte = match self.read_byte()? {
                Some(b) => b,
                None if self.stack.is_empty() && at_document_level => return Ok(Step::Eof),
                None => {
                    return Err(Error::MalformedProtocol(
                        "document ended with elements still open".into(),
                    ));
                }
            };
            match byte {
                control::SWITCH_PAGE => {
                    self.page = self.require_byte("codepage after SWITCH_PAGE")?;
                }
                control::END => {
                    let closed = self.stack.pop().ok_or_else(|| {
                        Error::MalformedProtocol("END token with no open element".into())
                    })?;
                    trace!(depth = self.stack.len(), "</{}>", closed);
                    return Ok(Step::End(closed));
                }
                control::STR_I => {
                    while self.require_byte("inline string")? != 0 {}
                    return Ok(Step::Data);
                }
                control::OPAQUE => {
                    let len = self.read_int()? as usize;
                    self.skip_bytes(len)?;
                    return Ok(Step::Data);
                }
                token => {
                    let tag = Tag::new(self.page, token & 0x3f);
                    self.no_content = token & control::WITH_CONTENT == 0;
                    self.stack.push(tag);
                    if self.no_content {
                        trace!(depth = self.stack.len() - 1, "<{}/>", tag);
                    } else {
                        trace!(depth = self.stack.len() - 1, "<{}>", tag);
                    }
                    return Ok(Step::Start(tag));
                }
            }
        }
    }

    fn read_byte(&mut self) -> Result<Option<u8>> {
        let mut buf = [0u8; 1];
        loop {
            match self.input.read(&mut buf) {
                Ok(0) => return Ok(None),
                Ok(_) => return Ok(Some(buf[0])),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn require_byte(&mut self, context: &'static str) -> Result<u8> {
        self.read_byte()?.ok_or_else(|| {
            Error::MalformedProtocol(format!("unexpected end of document in {}", context))
        })
    }

    /// Reads a multi-byte integer: base-128 groups, most significant first.
    fn read_int(&mut self) -> Result<u32> {
        let mut value = 0u32;
        for _ in 0..5 {
            let b = self.require_byte("multi-byte integer")?;
            value = (value << 7) | u32::from(b & 0x7f);
            if b & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(Error::MalformedProtocol(
            "multi-byte integer too long".into(),
        ))
    }

    fn skip_bytes(&mut self, mut len: usize) -> Result<()> {
        let mut buf = [0u8; 8192];
        while len > 0 {
            let want = len.min(buf.len());
            self.input.read_exact(&mut buf[..want])?;
            len -= want;
        }
        Ok(())
    }
}

enum Step {
    Start(Tag),
    End(Tag),
    /// Inline text or an opaque block, consumed and discarded.
    Data,
    Eof,
}
