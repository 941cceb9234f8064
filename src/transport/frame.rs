//! 定义了在 WebSocket 上传输的 STOMP 1.2 文本帧。
//! Defines the STOMP 1.2 text frames carried over the WebSocket.

use crate::error::{Error, Result};
use bytes::{BufMut, Bytes, BytesMut};

/// Frame commands used by the client.
pub mod command {
    pub const CONNECT: &str = "CONNECT";
    pub const CONNECTED: &str = "CONNECTED";
    pub const SUBSCRIBE: &str = "SUBSCRIBE";
    pub const UNSUBSCRIBE: &str = "UNSUBSCRIBE";
    pub const SEND: &str = "SEND";
    pub const DISCONNECT: &str = "DISCONNECT";
    pub const MESSAGE: &str = "MESSAGE";
    pub const RECEIPT: &str = "RECEIPT";
    pub const ERROR: &str = "ERROR";
}

/// A single STOMP frame.
/// 单个 STOMP 帧。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StompFrame {
    pub command: String,
    /// Headers in wire order. Repeated headers are kept; the first one wins on lookup.
    /// 按线路顺序排列的头部。重复的头部会保留；查找时以第一个为准。
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl StompFrame {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Looks up a header. STOMP 1.2 says only the first occurrence counts.
    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// The body as UTF-8 text, with invalid sequences replaced.
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// CONNECT and CONNECTED frames are exempt from header escaping.
    fn escapes_headers(command: &str) -> bool {
        command != command::CONNECT && command != command::CONNECTED
    }

    /// 将帧编码为线路格式。
    /// Encodes the frame into its wire format, adding `content-length` when a
    /// body is present and the header was not set explicitly.
    pub fn encode(&self) -> Bytes {
        let escape = Self::escapes_headers(&self.command);
        let mut buf = BytesMut::with_capacity(64 + self.body.len());

        buf.put_slice(self.command.as_bytes());
        buf.put_u8(b'\n');
        for (name, value) in &self.headers {
            put_header_part(&mut buf, name, escape);
            buf.put_u8(b':');
            put_header_part(&mut buf, value, escape);
            buf.put_u8(b'\n');
        }
        if !self.body.is_empty() && self.get_header("content-length").is_none() {
            buf.put_slice(format!("content-length:{}\n", self.body.len()).as_bytes());
        }
        buf.put_u8(b'\n');
        buf.put_slice(&self.body);
        buf.put_u8(0);
        buf.freeze()
    }

    /// 从一条 WebSocket 消息中解码所有帧。
    /// Decodes every frame contained in one WebSocket message. Heart-beat EOLs
    /// between or around frames are skipped, so a pure heart-beat yields an
    /// empty vector.
    pub fn decode_all(data: &[u8]) -> Result<Vec<StompFrame>> {
        let mut frames = Vec::new();
        let mut pos = 0;
        loop {
            while pos < data.len() && (data[pos] == b'\n' || data[pos] == b'\r') {
                pos += 1;
            }
            if pos >= data.len() {
                break;
            }
            let (frame, consumed) = Self::decode_one(&data[pos..])?;
            frames.push(frame);
            pos += consumed;
        }
        Ok(frames)
    }

    /// Decodes one frame from the start of `data`, returning it and the
    /// number of bytes consumed including the NUL terminator.
    fn decode_one(data: &[u8]) -> Result<(StompFrame, usize)> {
        let mut pos = 0;

        let command = utf8(read_line(data, &mut pos)?)?.to_string();
        if command.is_empty() {
            return Err(Error::InvalidFrame("missing command".into()));
        }
        let escape = Self::escapes_headers(&command);

        let mut headers = Vec::new();
        loop {
            let line = read_line(data, &mut pos)?;
            if line.is_empty() {
                break;
            }
            let line = utf8(line)?;
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| Error::InvalidFrame(format!("header without colon: {line:?}")))?;
            if escape {
                headers.push((unescape(name)?, unescape(value)?));
            } else {
                headers.push((name.to_string(), value.to_string()));
            }
        }

        let content_length = headers
            .iter()
            .find(|(name, _)| name == "content-length")
            .map(|(_, value)| {
                value
                    .trim()
                    .parse::<usize>()
                    .map_err(|_| Error::InvalidFrame(format!("bad content-length: {value:?}")))
            })
            .transpose()?;

        let body_end = match content_length {
            Some(len) => {
                let end = pos
                    .checked_add(len)
                    .ok_or_else(|| Error::InvalidFrame(format!("content-length {len} too large")))?;
                if data.get(end) != Some(&0) {
                    return Err(Error::InvalidFrame(
                        "body does not match content-length".into(),
                    ));
                }
                end
            }
            None => data[pos..]
                .iter()
                .position(|&b| b == 0)
                .map(|offset| pos + offset)
                .ok_or_else(|| Error::InvalidFrame("missing NUL terminator".into()))?,
        };

        let frame = StompFrame {
            command,
            headers,
            body: Bytes::copy_from_slice(&data[pos..body_end]),
        };
        Ok((frame, body_end + 1))
    }
}

fn read_line<'a>(data: &'a [u8], pos: &mut usize) -> Result<&'a [u8]> {
    let rest = &data[*pos..];
    let newline = rest
        .iter()
        .position(|&b| b == b'\n')
        .ok_or_else(|| Error::InvalidFrame("truncated frame".into()))?;
    *pos += newline + 1;
    let line = &rest[..newline];
    Ok(line.strip_suffix(b"\r").unwrap_or(line))
}

fn utf8(bytes: &[u8]) -> Result<&str> {
    std::str::from_utf8(bytes).map_err(|e| Error::InvalidFrame(e.to_string()))
}

fn put_header_part(buf: &mut BytesMut, text: &str, escape: bool) {
    if !escape {
        buf.put_slice(text.as_bytes());
        return;
    }
    for ch in text.chars() {
        match ch {
            '\\' => buf.put_slice(b"\\\\"),
            '\n' => buf.put_slice(b"\\n"),
            '\r' => buf.put_slice(b"\\r"),
            ':' => buf.put_slice(b"\\c"),
            other => {
                let mut tmp = [0u8; 4];
                buf.put_slice(other.encode_utf8(&mut tmp).as_bytes());
            }
        }
    }
}

fn unescape(text: &str) -> Result<String> {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('c') => out.push(':'),
            other => {
                return Err(Error::InvalidFrame(format!(
                    "undefined escape sequence \\{}",
                    other.map(String::from).unwrap_or_default()
                )));
            }
        }
    }
    Ok(out)
}
