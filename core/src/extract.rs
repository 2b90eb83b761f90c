//! Extraction of actionable artifacts from model output.
//!
//! Only fenced code blocks are ever considered. A block tagged `diff` or
//! `patch` is a candidate patch; a block with any other tag can become a
//! whole-file write when a filename with an allow-listed extension can be
//! inferred from the surrounding conversation. Unfenced text is never mined.

use std::sync::LazyLock;

use regex_lite::Regex;

/// Extensions eligible for inferred file writes.
const WRITE_EXTENSION_ALLOW_LIST: &[&str] = &[
    "c", "cpp", "css", "go", "h", "html", "java", "js", "json", "jsx", "md", "py", "rb", "rs",
    "sh", "sql", "toml", "ts", "tsx", "txt", "yaml", "yml",
];

#[derive(Debug, Clone, PartialEq)]
pub struct FencedBlock {
    pub tag: String,
    pub body: String,
}

/// Scan `text` for fenced code blocks. An unterminated fence is ignored.
pub fn fenced_blocks(text: &str) -> Vec<FencedBlock> {
    let mut blocks = Vec::new();
    let mut tag: Option<String> = None;
    let mut body = String::new();

    for line in text.lines() {
        let trimmed = line.trim_start();
        if let Some(rest) = trimmed.strip_prefix("```") {
            match tag.take() {
                Some(open_tag) => {
                    blocks.push(FencedBlock {
                        tag: open_tag,
                        body: std::mem::take(&mut body),
                    });
                }
                None => {
                    tag = Some(rest.trim().to_ascii_lowercase());
                }
            }
            continue;
        }
        if tag.is_some() {
            body.push_str(line);
            body.push('\n');
        }
    }

    blocks
}

/// Patches found in `text`: the bodies of ```diff and ```patch fences, in
/// order, each no larger than `max_bytes`. Pure function of its inputs, so
/// running it twice yields the same patch set.
pub fn extract_patches(text: &str, max_bytes: usize) -> Vec<String> {
    fenced_blocks(text)
        .into_iter()
        .filter(|block| block.tag == "diff" || block.tag == "patch")
        .filter(|block| block.body.len() <= max_bytes)
        .map(|block| block.body)
        .collect()
}

static FILENAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::expect_used)]
    let re = Regex::new(r"[A-Za-z0-9_./-]+\.[A-Za-z0-9]+").expect("filename pattern must compile");
    re
});

/// Infer the file a response is talking about. The first allow-listed
/// filename mentioned in the prompt wins, then the response is searched.
pub fn infer_filename(prompt: &str, response: &str) -> Option<String> {
    for haystack in [prompt, response] {
        for candidate in FILENAME_RE.find_iter(haystack) {
            let name = candidate.as_str().trim_matches('.');
            if let Some((_, ext)) = name.rsplit_once('.')
                && WRITE_EXTENSION_ALLOW_LIST.contains(&ext.to_ascii_lowercase().as_str())
            {
                return Some(name.to_string());
            }
        }
    }
    None
}

/// A whole-file write proposed by a response: requires both an inferable
/// filename and a fenced, non-patch code block. Absent either, the response
/// is conversational and nothing is mutated.
pub fn propose_file_write(prompt: &str, response: &str) -> Option<(String, String)> {
    let filename = infer_filename(prompt, response)?;
    let block = fenced_blocks(response)
        .into_iter()
        .find(|block| block.tag != "diff" && block.tag != "patch")?;
    Some((filename, block.body))
}
