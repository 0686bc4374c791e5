//! Sentence boundary scanning for incremental speech synthesis
//!
//! Generated text arrives as arbitrary increments. Synthesis sounds best when
//! fed whole sentences, so the response task buffers increments and drains a
//! sentence as soon as a terminator appears.

/// A sentence ends at punctuation followed by a space or newline. Bare
/// punctuation at the end of the buffer is not a boundary; the rest of the
/// sentence may still be on the way.
const TERMINATORS: [&str; 6] = [". ", "! ", "? ", ".\n", "!\n", "?\n"];

/// Byte offset just past the earliest sentence terminator in `buffer`, or
/// `None` if no complete sentence is present. When several terminators occur,
/// the lowest offset wins.
pub fn sentence_boundary(buffer: &str) -> Option<usize> {
    TERMINATORS
        .iter()
        .filter_map(|t| buffer.find(t).map(|i| i + t.len()))
        .min()
}

/// Drain every complete sentence from the front of `buffer`, leaving any
/// unterminated tail in place. Sentences keep their trailing punctuation and
/// whitespace.
pub fn drain_sentences(buffer: &mut String) -> Vec<String> {
    let mut sentences = Vec::new();
    while let Some(end) = sentence_boundary(buffer) {
        sentences.push(buffer.drain(..end).collect());
    }
    sentences
}
