//! Turning page text into the plain-text document we deliver.

use std::sync::LazyLock;

use regex::Regex;

use crate::decider::OcrPage;

/// Lines with fewer than three alphanumerics are OCR noise.
static MEANINGFUL_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[[:alnum:]].*[[:alnum:]].*[[:alnum:]]").expect("failed to compile regex")
});

static EXTRA_NEWLINES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n{2,}").expect("failed to compile regex"));

/// Drop noise lines and squeeze blank lines.
pub fn clean_text(text: &str) -> String {
    let kept = text
        .lines()
        .filter_map(|line| {
            if line.trim().is_empty() {
                Some("")
            } else if MEANINGFUL_LINE.is_match(line) {
                Some(line)
            } else {
                None
            }
        })
        .collect::<Vec<_>>()
        .join("\n");
    EXTRA_NEWLINES.replace_all(&kept, "\n\n").into_owned()
}

/// Build the document for a list of pages, in the order given.
pub fn format_document(pages: &[OcrPage]) -> String {
    let total = pages.len();
    pages
        .iter()
        .enumerate()
        .map(|(i, page)| {
            format!(
                "========\nPage {} of {total}\n========\n\n{}",
                i + 1,
                clean_text(&page.text)
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}
