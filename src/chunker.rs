use thiserror::Error;
use tiktoken_rs::{CoreBPE, get_bpe_from_model};

/// How far a window may shrink to avoid ending inside a multi-byte character.
const MAX_BOUNDARY_BACKOFF: usize = 3;

#[derive(Debug, Error)]
pub enum ChunkError {
    #[error("unsupported model: no encoding registered for '{0}'")]
    UnsupportedModel(String),
    #[error("chunk size must be at least one token")]
    ZeroChunkSize,
}

/// One token-bounded slice of the input document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub index: usize,
    pub text: String,
    pub tokens: usize,
}

/// Minimal encode/decode surface the chunker needs from a tokenizer.
pub trait TokenEncoding {
    fn encode(&self, text: &str) -> Vec<u32>;
    fn decode(&self, tokens: &[u32]) -> Result<String, String>;
    /// Decode without validation; invalid UTF-8 becomes U+FFFD.
    fn decode_lossy(&self, tokens: &[u32]) -> String;
}

impl TokenEncoding for CoreBPE {
    fn encode(&self, text: &str) -> Vec<u32> {
        self.encode_ordinary(text)
    }

    fn decode(&self, tokens: &[u32]) -> Result<String, String> {
        CoreBPE::decode(self, tokens.to_vec()).map_err(|e| e.to_string())
    }

    fn decode_lossy(&self, tokens: &[u32]) -> String {
        let bytes: Vec<u8> = self._decode_native_and_split(tokens.to_vec()).flatten().collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

/// Resolve the tiktoken encoding registered for `model`.
pub fn encoding_for_model(model: &str) -> Result<CoreBPE, ChunkError> {
    get_bpe_from_model(model.trim()).map_err(|_| ChunkError::UnsupportedModel(model.to_string()))
}

/// Split `text` into chunks of at most `tokens` tokens using the encoding for `model`.
pub fn split_into_chunks(text: &str, model: &str, tokens: usize) -> Result<Vec<Chunk>, ChunkError> {
    let bpe = encoding_for_model(model)?;
    split_with_encoding(&bpe, text, tokens)
}

/// Encode once, then decode consecutive windows of at most `max_tokens`.
///
/// A window that cuts through a multi-byte character will not decode on its
/// own; it is shortened by up to [`MAX_BOUNDARY_BACKOFF`] tokens and the rest
/// is carried into the next window. When no shorter window decodes (a single
/// character wider than `max_tokens`), the full window is decoded lossily.
pub fn split_with_encoding<E: TokenEncoding + ?Sized>(
    encoding: &E,
    text: &str,
    max_tokens: usize,
) -> Result<Vec<Chunk>, ChunkError> {
    if max_tokens == 0 {
        return Err(ChunkError::ZeroChunkSize);
    }
    let ids = encoding.encode(text);
    let mut chunks = Vec::with_capacity(ids.len().div_ceil(max_tokens));
    let mut start = 0usize;
    while start < ids.len() {
        let full_end = (start + max_tokens).min(ids.len());
        let (end, decoded) = decode_window(encoding, &ids, start, full_end);
        chunks.push(Chunk {
            index: chunks.len(),
            text: decoded,
            tokens: end - start,
        });
        start = end;
    }
    Ok(chunks)
}

fn decode_window<E: TokenEncoding + ?Sized>(
    encoding: &E,
    ids: &[u32],
    start: usize,
    full_end: usize,
) -> (usize, String) {
    let mut last_err = String::new();
    for backoff in 0..=MAX_BOUNDARY_BACKOFF {
        let end = full_end.saturating_sub(backoff);
        if end <= start {
            break;
        }
        match encoding.decode(&ids[start..end]) {
            Ok(text) => return (end, text),
            Err(e) => last_err = e,
        }
    }
    tracing::debug!(start, end = full_end, reason = %last_err, "no clean boundary, decoding window lossily");
    (full_end, encoding.decode_lossy(&ids[start..full_end]))
}
