use anyhow::Result;
use headless_chrome::Tab;
use serde::Deserialize;
use std::sync::Arc;

use crate::types::DomElement;

/// Upper bound on elements handed to the planner per snapshot.
pub const MAX_SNAPSHOT_ELEMENTS: usize = 120;

/// JavaScript injected into the page to index interactable elements.
/// NON-DESTRUCTIVE: reads the DOM without modifying styles or layout.
///
/// The script:
///   1. Skips script, style, noscript, svg elements (does NOT remove them).
///   2. Walks the visible DOM tree (max depth 15).
///   3. Assigns sequential indices to interactive elements
///      (a, button, input, textarea, select) via data-eid attributes.
///   4. Emits a JSON array of element records.
const SNAPSHOT_JS: &str = r#"
(() => {
  const SKIP = new Set(['SCRIPT','STYLE','NOSCRIPT','SVG','LINK']);
  let id = 0;
  const records = [];
  const seen = new Set();

  function isVisible(el) {
    if (el.offsetParent === null && el.tagName !== 'BODY' && el.tagName !== 'HTML') return false;
    const s = getComputedStyle(el);
    return s.display !== 'none' && s.visibility !== 'hidden' && s.opacity !== '0';
  }

  function walk(node, depth) {
    if (depth > 15) return;
    for (const child of node.children) {
      if (SKIP.has(child.tagName)) continue;
      if (!isVisible(child)) continue;
      const tag = child.tagName.toLowerCase();
      const interactive = ['a','button','input','textarea','select'].includes(tag);

      if (interactive) {
        const eid = 'e' + (id++);
        child.setAttribute('data-eid', eid);
        const attrs = [];
        if (tag === 'input' || tag === 'textarea') {
          attrs.push(['type', child.type || 'text']);
          if (child.placeholder) attrs.push(['placeholder', child.placeholder]);
          if (child.name) attrs.push(['name', child.name]);
          if (child.value) attrs.push(['value', child.value.slice(0, 30)]);
        } else if (tag === 'a' && child.href) {
          attrs.push(['href', child.href.slice(0, 120)]);
        } else if (tag === 'select') {
          const opts = [...child.options].map(o => o.text.trim().slice(0, 20)).join('|');
          attrs.push(['options', opts]);
        }
        const text = (child.textContent || '').trim().slice(0, 60);
        const key = tag + '|' + text + '|' + JSON.stringify(attrs);
        if (!seen.has(key)) {
          seen.add(key);
          records.push({
            index: id - 1,
            tag: tag,
            text: text,
            attributes: attrs,
            selector: '[data-eid="' + eid + '"]',
            is_visible: true,
            is_interactive: true,
          });
        }
      }
      walk(child, depth + 1);
    }
  }

  walk(document.body, 0);
  return JSON.stringify(records);
})()
"#;

#[derive(Deserialize)]
struct RawElement {
    index: usize,
    tag: String,
    #[serde(default)]
    text: String,
    #[serde(default)]
    attributes: Vec<(String, String)>,
    #[serde(default)]
    selector: String,
    #[serde(default)]
    is_visible: bool,
    #[serde(default)]
    is_interactive: bool,
}

/// Capture the indexed interactable elements of the current page.
pub fn capture_elements(tab: &Arc<Tab>) -> Result<Vec<DomElement>> {
    let result = tab.evaluate(SNAPSHOT_JS, false)?;
    let raw = result
        .value
        .and_then(|v| v.as_str().map(String::from))
        .unwrap_or_else(|| "[]".to_string());

    let parsed: Vec<RawElement> = serde_json::from_str(&raw)?;
    Ok(parsed
        .into_iter()
        .take(MAX_SNAPSHOT_ELEMENTS)
        .map(|r| DomElement {
            index: r.index,
            tag: r.tag,
            text: r.text,
            attributes: r.attributes,
            selector: r.selector,
            is_visible: r.is_visible,
            is_interactive: r.is_interactive,
        })
        .collect())
}

/// Get the current page URL.
pub fn get_current_url(tab: &Arc<Tab>) -> Result<String> {
    let result = tab.evaluate("window.location.href", false)?;
    Ok(result
        .value
        .and_then(|v| v.as_str().map(String::from))
        .unwrap_or_else(|| "unknown".to_string()))
}

/// Get the current page title.
pub fn get_page_title(tab: &Arc<Tab>) -> Result<String> {
    let result = tab.evaluate("document.title", false)?;
    Ok(result
        .value
        .and_then(|v| v.as_str().map(String::from))
        .unwrap_or_else(|| "untitled".to_string()))
}

/// Whether `text` is visible anywhere in the rendered page body.
pub fn is_text_visible(tab: &Arc<Tab>, text: &str) -> Result<bool> {
    let needle = serde_json::to_string(text)?;
    let result = tab.evaluate(
        &format!("(document.body.innerText || '').includes({needle})"),
        false,
    )?;
    Ok(result.value.and_then(|v| v.as_bool()).unwrap_or(false))
}
