use crate::llm::ChatError;

/// Turns raw body chunks into text. One decoder lives for one stream.
pub trait ChunkDecoder: Send + Sync {
    fn decode(&mut self, chunk: &[u8]) -> Result<String, ChatError>;

    /// Called once after the last chunk.
    fn finish(&mut self) -> Result<String, ChatError> {
        Ok(String::new())
    }
}

/// UTF-8 decoder that carries a split multi-byte sequence over to the next
/// chunk. Invalid bytes become U+FFFD unless built with [`strict`](Self::strict).
#[derive(Clone, Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
    strict: bool,
}

impl Utf8Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails with [`ChatError::Decode`] on invalid bytes.
    pub fn strict() -> Self {
        Self {
            pending: Vec::new(),
            strict: true,
        }
    }
}

impl ChunkDecoder for Utf8Decoder {
    fn decode(&mut self, chunk: &[u8]) -> Result<String, ChatError> {
        let mut buf = std::mem::take(&mut self.pending);
        buf.extend_from_slice(chunk);

        let mut out = String::with_capacity(buf.len());
        let mut rest = &buf[..];
        loop {
            match std::str::from_utf8(rest) {
                Ok(s) => {
                    out.push_str(s);
                    return Ok(out);
                }
                Err(e) => {
                    let (valid, tail) = rest.split_at(e.valid_up_to());
                    out.push_str(
                        std::str::from_utf8(valid).map_err(|e| ChatError::Decode(e.to_string()))?,
                    );
                    match e.error_len() {
                        None => {
                            self.pending = tail.to_vec();
                            return Ok(out);
                        }
                        Some(n) if !self.strict => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &tail[n..];
                        }
                        Some(_) => {
                            return Err(ChatError::Decode(format!(
                                "invalid utf-8 sequence after {} bytes",
                                out.len()
                            )));
                        }
                    }
                }
            }
        }
    }

    fn finish(&mut self) -> Result<String, ChatError> {
        if self.pending.is_empty() {
            return Ok(String::new());
        }
        self.pending.clear();
        if self.strict {
            Err(ChatError::Decode(
                "incomplete utf-8 sequence at end of stream".into(),
            ))
        } else {
            Ok(char::REPLACEMENT_CHARACTER.to_string())
        }
    }
}
