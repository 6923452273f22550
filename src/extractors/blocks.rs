//! Convert extracted HTML into a flat sequence of typed content blocks.
//!
//! Block types: heading | paragraph | image | code | list | quote | table

use crate::core::types::Block;
use crate::extractors::scrub;
use scraper::{ElementRef, Html, Selector};
use std::sync::LazyLock;
use url::Url;

const BLOCK_TAGS: &[&str] = &[
    "h1",
    "h2",
    "h3",
    "h4",
    "h5",
    "h6",
    "p",
    "img",
    "figure",
    "pre",
    "ul",
    "ol",
    "blockquote",
    "table",
];

// Handled as a unit; never traversed into.
const LEAF_CONTAINERS: &[&str] = &["pre", "table", "ul", "ol", "blockquote"];

static BODY_SELECTOR: LazyLock<Selector> = LazyLock::new(|| Selector::parse("body").unwrap());
static IMG_SELECTOR: LazyLock<Selector> = LazyLock::new(|| Selector::parse("img").unwrap());
static CODE_SELECTOR: LazyLock<Selector> = LazyLock::new(|| Selector::parse("code").unwrap());
static LI_SELECTOR: LazyLock<Selector> = LazyLock::new(|| Selector::parse("li").unwrap());
static TR_SELECTOR: LazyLock<Selector> = LazyLock::new(|| Selector::parse("tr").unwrap());
static CELL_SELECTOR: LazyLock<Selector> = LazyLock::new(|| Selector::parse("td, th").unwrap());
static FIGCAPTION_SELECTOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("figcaption").unwrap());

fn heading_level(tag: &str) -> Option<u8> {
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

fn element_text(el: ElementRef) -> String {
    el.text().collect::<String>()
}

/// Language from `class="language-X"` on the element or its `<code>` child.
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

fn image_block(img: ElementRef, base: Option<&Url>) -> Block {
    let v = img.value();
    let mut src = v.attr("src").map(str::trim).unwrap_or("").to_string();
    if src.is_empty() {
        if let Some(srcset) = v.attr("srcset") {
            src = srcset
                .split(',')
                .next()
                .and_then(|c| c.trim().split(' ').next())
                .unwrap_or("")
                .to_string();
        }
    }
    if !src.is_empty() {
        if let Some(b) = base {
            if let Ok(resolved) = b.join(&src) {
                src = resolved.to_string();
            }
        }
    }

    let caption = img
        .parent()
        .and_then(ElementRef::wrap)
        .filter(|p| p.value().name() == "figure")
        .and_then(|figure| figure.select(&FIGCAPTION_SELECTOR).next())
        .map(|c| element_text(c).trim().to_string())
        .unwrap_or_default();

    Block::Image {
        url: src,
        alt: v.attr("alt").unwrap_or("").trim().to_string(),
        caption,
    }
}

fn direct_children_named<'a>(el: ElementRef<'a>, name: &str) -> Vec<ElementRef<'a>> {
    el.children()
        .filter_map(ElementRef::wrap)
        .filter(|c| c.value().name() == name)
        .collect()
}

fn process_element(el: ElementRef, base: Option<&Url>, blocks: &mut Vec<Block>) {
    let tag = el.value().name();

    if let Some(level) = heading_level(tag) {
        let text = element_text(el).trim().to_string();
        if !text.is_empty() {
            blocks.push(Block::Heading { level, text });
        }
        return;
    }

    match tag {
        "p" => {
            let imgs: Vec<ElementRef> = el.select(&IMG_SELECTOR).collect();
            let text = element_text(el).trim().to_string();
            if !imgs.is_empty() && text.is_empty() {
                for img in imgs {
                    blocks.push(image_block(img, base));
                }
                return;
            }
            if !text.is_empty() {
                blocks.push(Block::Paragraph { text });
            }
        }
        "img" => blocks.push(image_block(el, base)),
        "figure" => {
            if let Some(img) = el.select(&IMG_SELECTOR).next() {
                blocks.push(image_block(img, base));
            }
        }
        "pre" => {
            let text = match el.select(&CODE_SELECTOR).next() {
                Some(code) => element_text(code),
                None => element_text(el),
            };
            blocks.push(Block::Code {
                language: code_language(el),
                text,
            });
        }
        "ul" | "ol" => {
            let mut items: Vec<String> = direct_children_named(el, "li")
                .into_iter()
                .map(|li| element_text(li).trim().to_string())
                .collect();
            if items.is_empty() {
                items = el
                    .select(&LI_SELECTOR)
                    .map(|li| element_text(li).trim().to_string())
                    .collect();
            }
            items.retain(|i| !i.is_empty());
            if !items.is_empty() {
                blocks.push(Block::List {
                    ordered: tag == "ol",
                    items,
                });
            }
        }
        "blockquote" => {
            let text = element_text(el).trim().to_string();
            if !text.is_empty() {
                blocks.push(Block::Quote { text });
            }
        }
        "table" => {
            let rows: Vec<Vec<String>> = el
                .select(&TR_SELECTOR)
                .map(|tr| {
                    tr.select(&CELL_SELECTOR)
                        .map(|cell| element_text(cell).trim().to_string())
                        .collect::<Vec<_>>()
                })
                .filter(|cells: &Vec<String>| !cells.is_empty())
                .collect();
            if !rows.is_empty() {
                blocks.push(Block::Table { rows });
            }
        }
        _ => {}
    }
}

fn walk(node: ElementRef, base: Option<&Url>, blocks: &mut Vec<Block>) {
    for child in node.children() {
        let Some(el) = ElementRef::wrap(child) else {
            continue;
        };
        let tag = el.value().name();
        if BLOCK_TAGS.contains(&tag) {
            process_element(el, base, blocks);
        } else if !LEAF_CONTAINERS.contains(&tag) {
            walk(el, base, blocks);
        }
    }
}

/// Parse `html` into a flat list of typed content blocks.
///
/// Depth-first over the body: block-level tags are emitted and not
/// recursed into; leaf containers (pre, list, quote, table) are atomic.
pub fn html_to_blocks(html: &str, base_url: &str) -> Vec<Block> {
    let cleaned = scrub::strip_block_noise(html);
    let document = Html::parse_document(&cleaned);
    let base = Url::parse(base_url).ok();

    let root = document
        .select(&BODY_SELECTOR)
        .next()
        .unwrap_or_else(|| document.root_element());

    let mut blocks = Vec::new();
    walk(root, base.as_ref(), &mut blocks);
    blocks
}
