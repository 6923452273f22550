//! HTML → Markdown conversion preserving structure and code fences.
//!
//! ATX headings, `-` bullets, `1.` ordered style, fenced code blocks with
//! the language carried over from `language-X` classes. Output is
//! post-processed: trailing whitespace stripped per line, runs of 3+
//! blank lines collapsed to 2, whole string trimmed.

use crate::extractors::scrub;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use std::sync::LazyLock;

static BODY_SELECTOR: LazyLock<Selector> = LazyLock::new(|| Selector::parse("body").unwrap());
static CODE_SELECTOR: LazyLock<Selector> = LazyLock::new(|| Selector::parse("code").unwrap());
static LI_SELECTOR: LazyLock<Selector> = LazyLock::new(|| Selector::parse("li").unwrap());
static TR_SELECTOR: LazyLock<Selector> = LazyLock::new(|| Selector::parse("tr").unwrap());
static CELL_SELECTOR: LazyLock<Selector> = LazyLock::new(|| Selector::parse("td, th").unwrap());

static EXCESSIVE_BLANK_LINES_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n{3,}").unwrap());
static TRAILING_WHITESPACE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)[ \t]+$").unwrap());

fn heading_level(tag: &str) -> Option<usize> {
    match tag {
        "h1" => Some(1),
        "h2" => Some(2),
        "h3" => Some(3),
        "h4" => Some(4),
        "h5" => Some(5),
        "h6" => Some(6),
        _ => None,
    }
}

fn code_language(el: ElementRef) -> String {
    let mut candidates: Vec<ElementRef> = vec![el];
    if let Some(code) = el.select(&CODE_SELECTOR).next() {
        candidates.push(code);
    }
    for candidate in candidates {
        if let Some(classes) = candidate.value().attr("class") {
            for class in classes.split_whitespace() {
                if let Some(lang) = class.strip_prefix("language-") {
                    if !lang.is_empty() {
                        return lang.to_string();
                    }
                }
            }
        }
    }
    String::new()
}

/// Render inline content: links, emphasis, inline code, images, breaks.
/// `skip_lists` keeps nested list text out of its parent `<li>` line.
fn inline_text(el: ElementRef, skip_lists: bool) -> String {
    let mut out = String::new();
    for child in el.children() {
        if let Some(text) = child.value().as_text() {
            out.push_str(text);
            continue;
        }
        let Some(inner) = ElementRef::wrap(child) else {
            continue;
        };
        match inner.value().name() {
            "a" => {
                let label = inline_text(inner, skip_lists);
                let label = label.trim();
                let href = inner.value().attr("href").unwrap_or("");
                if label.is_empty() {
                    continue;
                }
                if href.is_empty() {
                    out.push_str(label);
                } else {
                    out.push_str(&format!("[{label}]({href})"));
                }
            }
            "strong" | "b" => {
                let label = inline_text(inner, skip_lists);
                let label = label.trim();
                if !label.is_empty() {
                    out.push_str(&format!("**{label}**"));
                }
            }
            "em" | "i" => {
                let label = inline_text(inner, skip_lists);
                let label = label.trim();
                if !label.is_empty() {
                    out.push_str(&format!("*{label}*"));
                }
            }
            "code" => {
                let label = inline_text(inner, skip_lists);
                if !label.trim().is_empty() {
                    out.push_str(&format!("`{}`", label.trim()));
                }
            }
            "img" => {
                let alt = inner.value().attr("alt").unwrap_or("");
                let src = inner.value().attr("src").unwrap_or("");
                if !src.is_empty() {
                    out.push_str(&format!("![{alt}]({src})"));
                }
            }
            "br" => out.push('\n'),
            "ul" | "ol" if skip_lists => {}
            _ => out.push_str(&inline_text(inner, skip_lists)),
        }
    }
    out
}

fn push_block(out: &mut String, block: &str) {
    let block = block.trim_end();
    if block.is_empty() {
        return;
    }
    if !out.is_empty() {
        out.push_str("\n\n");
    }
    out.push_str(block);
}

fn render_list(el: ElementRef, ordered: bool, out: &mut String) {
    let direct: Vec<ElementRef> = el
        .children()
        .filter_map(ElementRef::wrap)
        .filter(|c| c.value().name() == "li")
        .collect();
    let items: Vec<ElementRef> = if direct.is_empty() {
        el.select(&LI_SELECTOR).collect()
    } else {
        direct
    };

    let mut lines = Vec::new();
    let mut n = 0usize;
    for li in items {
        let text = scrub::normalize_whitespace(&inline_text(li, true));
        if text.is_empty() {
            continue;
        }
        n += 1;
        if ordered {
            lines.push(format!("{n}. {text}"));
        } else {
            lines.push(format!("- {text}"));
        }
    }
    push_block(out, &lines.join("\n"));
}

fn render_table(el: ElementRef, out: &mut String) {
    let mut lines = Vec::new();
    for (i, tr) in el.select(&TR_SELECTOR).enumerate() {
        let cells: Vec<String> = tr
            .select(&CELL_SELECTOR)
            .map(|cell| scrub::normalize_whitespace(&inline_text(cell, false)))
            .collect();
        if cells.is_empty() {
            continue;
        }
        lines.push(format!("| {} |", cells.join(" | ")));
        if i == 0 {
            lines.push(format!(
                "| {} |",
                cells.iter().map(|_| "---").collect::<Vec<_>>().join(" | ")
            ));
        }
    }
    push_block(out, &lines.join("\n"));
}

fn render_block(el: ElementRef, out: &mut String) {
    let tag = el.value().name();

    if let Some(level) = heading_level(tag) {
        let text = scrub::normalize_whitespace(&inline_text(el, false));
        if !text.is_empty() {
            push_block(out, &format!("{} {}", "#".repeat(level), text));
        }
        return;
    }

    match tag {
        "p" => {
            let text = inline_text(el, false);
            push_block(out, text.trim());
        }
        "pre" => {
            let text = match el.select(&CODE_SELECTOR).next() {
                Some(code) => code.text().collect::<String>(),
                None => el.text().collect::<String>(),
            };
            let fence = format!("```{}\n{}\n```", code_language(el), text.trim_end_matches('\n'));
            push_block(out, &fence);
        }
        "ul" => render_list(el, false, out),
        "ol" => render_list(el, true, out),
        "blockquote" => {
            let mut inner = String::new();
            render_flow(el, &mut inner);
            if inner.trim().is_empty() {
                inner = inline_text(el, false);
            }
            let quoted: Vec<String> = inner
                .trim()
                .lines()
                .map(|l| format!("> {}", l.trim()))
                .collect();
            push_block(out, &quoted.join("\n"));
        }
        "table" => render_table(el, out),
        "img" => {
            let alt = el.value().attr("alt").unwrap_or("");
            let src = el.value().attr("src").unwrap_or("");
            if !src.is_empty() {
                push_block(out, &format!("![{alt}]({src})"));
            }
        }
        "hr" => push_block(out, "---"),
        _ => render_flow(el, out),
    }
}

const FLOW_BLOCK_TAGS: &[&str] = &[
    "h1",
    "h2",
    "h3",
    "h4",
    "h5",
    "h6",
    "p",
    "pre",
    "ul",
    "ol",
    "blockquote",
    "table",
    "img",
    "figure",
    "hr",
];

/// Walk container elements, flushing loose inline text as paragraphs
/// between recognised block children.
fn render_flow(el: ElementRef, out: &mut String) {
    let mut loose = String::new();
    for child in el.children() {
        if let Some(text) = child.value().as_text() {
            loose.push_str(text);
            continue;
        }
        let Some(inner) = ElementRef::wrap(child) else {
            continue;
        };
        let tag = inner.value().name();
        if FLOW_BLOCK_TAGS.contains(&tag) || heading_level(tag).is_some() {
            let flushed = scrub::normalize_whitespace(&loose);
            if !flushed.is_empty() {
                push_block(out, &flushed);
            }
            loose.clear();
            if tag == "figure" {
                render_flow(inner, out);
            } else {
                render_block(inner, out);
            }
        } else if matches!(tag, "a" | "strong" | "b" | "em" | "i" | "code" | "span" | "br") {
            loose.push_str(&inline_text_of_one(inner));
        } else {
            let flushed = scrub::normalize_whitespace(&loose);
            if !flushed.is_empty() {
                push_block(out, &flushed);
            }
            loose.clear();
            render_flow(inner, out);
        }
    }
    let flushed = scrub::normalize_whitespace(&loose);
    if !flushed.is_empty() {
        push_block(out, &flushed);
    }
}

fn inline_text_of_one(el: ElementRef) -> String {
    // Wrap a single inline element by rendering it through a synthetic pass.
    let mut s = String::new();
    match el.value().name() {
        "a" => {
            let label = inline_text(el, false);
            let label = label.trim();
            let href = el.value().attr("href").unwrap_or("");
            if !label.is_empty() {
                if href.is_empty() {
                    s.push_str(label);
                } else {
                    s.push_str(&format!("[{label}]({href})"));
                }
            }
        }
        "strong" | "b" => {
            let label = inline_text(el, false);
            if !label.trim().is_empty() {
                s.push_str(&format!("**{}**", label.trim()));
            }
        }
        "em" | "i" => {
            let label = inline_text(el, false);
            if !label.trim().is_empty() {
                s.push_str(&format!("*{}*", label.trim()));
            }
        }
        "code" => {
            let label = inline_text(el, false);
            if !label.trim().is_empty() {
                s.push_str(&format!("`{}`", label.trim()));
            }
        }
        "br" => s.push('\n'),
        _ => s.push_str(&inline_text(el, false)),
    }
    s
}

/// Convert `html` to clean Markdown.
///
/// Falls back to stripped-tags plaintext with newline separators when the
/// structural pass yields nothing but the page still carries visible text.
pub fn html_to_markdown(html: &str) -> String {
    if html.trim().is_empty() {
        return String::new();
    }

    let cleaned = scrub::strip_block_noise(html);
    let document = Html::parse_document(&cleaned);
    let root = document
        .select(&BODY_SELECTOR)
        .next()
        .unwrap_or_else(|| document.root_element());

    let mut out = String::new();
    render_flow(root, &mut out);

    if out.trim().is_empty() {
        // Plaintext fallback.
        out = document
            .root_element()
            .text()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join("\n");
    }

    let out = TRAILING_WHITESPACE_RE.replace_all(&out, "");
    let out = EXCESSIVE_BLANK_LINES_RE.replace_all(&out, "\n\n");
    out.trim().to_string()
}

/// Render a complete article document with a front-matter-style header.
pub fn format_markdown_article(
    title: &str,
    author: Option<&str>,
    published_at: Option<&str>,
    tags: &[String],
    summary: Option<&str>,
    content_markdown: &str,
) -> String {
    let mut lines: Vec<String> = Vec::new();

    lines.push(format!("# {title}"));
    lines.push(String::new());

    let mut meta_parts: Vec<String> = Vec::new();
    if let Some(author) = author {
        meta_parts.push(format!("**Author:** {author}"));
    }
    if let Some(published_at) = published_at {
        meta_parts.push(format!("**Published:** {published_at}"));
    }
    if !tags.is_empty() {
        meta_parts.push(format!("**Tags:** {}", tags.join(", ")));
    }
    if !meta_parts.is_empty() {
        lines.extend(meta_parts);
        lines.push(String::new());
    }

    if let Some(summary) = summary {
        lines.push(format!("> {summary}"));
        lines.push(String::new());
    }

    lines.push("---".to_string());
    lines.push(String::new());
    lines.push(content_markdown.to_string());

    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atx_headings_and_paragraphs() {
        let md = html_to_markdown("<h1>Top</h1><h3>Sub</h3><p>Body text.</p>");
        assert_eq!(md, "# Top\n\n### Sub\n\nBody text.");
    }

    #[test]
    fn code_fence_preserves_language() {
        let md = html_to_markdown(
            r#"<pre><code class="language-python">print("hi")</code></pre>"#,
        );
        assert_eq!(md, "```python\nprint(\"hi\")\n```");
    }

    #[test]
    fn code_fence_without_language() {
        let md = html_to_markdown("<pre>raw\ncode</pre>");
        assert_eq!(md, "```\nraw\ncode\n```");
    }

    #[test]
    fn bullet_and_ordered_lists() {
        let md = html_to_markdown("<ul><li>a</li><li>b</li></ul><ol><li>x</li><li>y</li></ol>");
        assert_eq!(md, "- a\n- b\n\n1. x\n2. y");
    }

    #[test]
    fn links_emphasis_and_inline_code() {
        let md = html_to_markdown(
            r#"<p>See <a href="https://example.com">the docs</a> for <strong>bold</strong> and <code>inline()</code>.</p>"#,
        );
        assert_eq!(
            md,
            "See [the docs](https://example.com) for **bold** and `inline()`."
        );
    }

    #[test]
    fn blockquote_prefixed() {
        let md = html_to_markdown("<blockquote><p>Wise words.</p></blockquote>");
        assert_eq!(md, "> Wise words.");
    }

    #[test]
    fn table_rendered_with_separator() {
        let md = html_to_markdown(
            "<table><tr><th>A</th><th>B</th></tr><tr><td>1</td><td>2</td></tr></table>",
        );
        assert_eq!(md, "| A | B |\n| --- | --- |\n| 1 | 2 |");
    }

    #[test]
    fn script_and_nav_stripped() {
        let md = html_to_markdown("<nav><p>Menu</p></nav><script>x()</script><p>Kept</p>");
        assert_eq!(md, "Kept");
    }

    #[test]
    fn empty_input_and_plaintext_fallback() {
        assert_eq!(html_to_markdown("   "), "");
        // Loose text inside an unknown container still surfaces.
        let md = html_to_markdown("<div><span>loose words</span></div>");
        assert_eq!(md, "loose words");
    }

    #[test]
    fn excessive_blank_lines_collapsed() {
        let md = html_to_markdown("<p>a</p><div></div><div></div><p>b</p>");
        assert_eq!(md, "a\n\nb");
    }

    #[test]
    fn article_header_format() {
        let doc = format_markdown_article(
            "Title",
            Some("Author"),
            Some("2024-01-01"),
            &["rust".to_string()],
            Some("A summary."),
            "Body.",
        );
        assert!(doc.starts_with("# Title\n"));
        assert!(doc.contains("**Author:** Author"));
        assert!(doc.contains("> A summary."));
        assert!(doc.ends_with("---\n\nBody."));
    }
}
