//! Re-chunk a text stream into words.

use crate::llm::TextStream;
use futures_util::StreamExt;

/// Turn arbitrary text fragments into whole words.
///
/// Every word after the first carries a single leading space, so
/// concatenating the output reproduces the text with whitespace runs
/// collapsed. A trailing partial word is yielded when the input ends.
pub fn rechunk_to_words(mut input: TextStream) -> TextStream {
    Box::pin(async_stream::try_stream! {
        let mut buffer = String::new();
        let mut prefix = "";
        while let Some(fragment) = input.next().await {
            let fragment: String = fragment?;
            buffer.push_str(&fragment);
            while let Some((word, rest)) = split_first_word(&buffer) {
                if !word.is_empty() {
                    yield format!("{prefix}{word}");
                }
                prefix = " ";
                buffer = rest;
            }
        }
        if !buffer.is_empty() {
            yield format!("{prefix}{buffer}");
        }
    })
}

/// Split at the first whitespace run. Returns `None` if there is none yet.
fn split_first_word(buffer: &str) -> Option<(String, String)> {
    let start = buffer.find(char::is_whitespace)?;
    let after = &buffer[start..];
    let ws_len = after
        .find(|c: char| !c.is_whitespace())
        .unwrap_or(after.len());
    Some((
        buffer[..start].to_owned(),
        buffer[start + ws_len..].to_owned(),
    ))
}
