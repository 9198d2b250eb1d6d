//! Lightweight HTML-to-text extraction.
//!
//! Strips tags, drops script and style bodies, and breaks lines at block
//! elements. Good enough for ranking and prompt excerpts; not a renderer.

const BLOCK_TAGS: &[&str] = &[
    "p", "br", "div", "section", "article", "h1", "h2", "h3", "h4", "h5", "h6", "li", "tr",
    "blockquote", "pre", "table", "ul", "ol",
];

const SKIPPED_TAGS: &[&str] = &["script", "style", "noscript", "svg", "head"];

/// Extract readable text from an HTML document.
pub fn extract_text(html: &str) -> String {
    let mut text = String::with_capacity(html.len() / 2);
    let mut in_tag = false;
    let mut tag_name = String::new();
    let mut building_tag = false;
    let mut skip_until: Option<String> = None;

    for ch in html.chars() {
        if ch == '<' {
            in_tag = true;
            building_tag = true;
            tag_name.clear();
            continue;
        }
        if in_tag && ch == '>' {
            in_tag = false;
            building_tag = false;
            let tag = tag_name.to_lowercase();
            let (closing, name) = match tag.strip_prefix('/') {
                Some(name) => (true, name),
                None => (false, tag.trim_end_matches('/')),
            };

            if let Some(skipped) = &skip_until {
                if closing && name == skipped.as_str() {
                    skip_until = None;
                }
                continue;
            }
            if !closing && SKIPPED_TAGS.contains(&name) {
                skip_until = Some(name.to_string());
                continue;
            }
            if BLOCK_TAGS.contains(&name) {
                text.push('\n');
            }
            continue;
        }
        if in_tag {
            if building_tag && (ch.is_alphanumeric() || ch == '/') {
                tag_name.push(ch);
            } else {
                building_tag = false;
            }
            continue;
        }
        if skip_until.is_none() {
            text.push(ch);
        }
    }

    let text = decode_entities(&text);
    let mut lines: Vec<String> = text
        .lines()
        .map(|l| l.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|l| !l.is_empty())
        .collect();
    lines.dedup();
    lines.join("\n")
}

/// Contents of the first `<title>` element, whitespace collapsed.
pub fn extract_title(html: &str) -> Option<String> {
    let lower = html.to_ascii_lowercase();
    let open = lower.find("<title")?;
    let start = open + lower[open..].find('>')? + 1;
    let end = start + lower[start..].find("</title")?;
    let title = decode_entities(&html[start..end])
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    (!title.is_empty()).then_some(title)
}

/// Decode the handful of entities common in body text.
pub fn decode_entities(text: &str) -> String {
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&#x27;", "'")
        .replace("&mdash;", "-")
        .replace("&ndash;", "-")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_text() {
        let html = r#"
        <html>
        <head><title>Test</title><style>.foo { color: red; }</style></head>
        <body>
            <h1>Hello World</h1>
            <p>This is a <b>test</b> paragraph.</p>
            <script>var x = 1;</script>
            <ul>
                <li>Item 1</li>
                <li>Item 2</li>
            </ul>
        </body>
        </html>"#;

        let text = extract_text(html);
        assert!(text.contains("Hello World"));
        assert!(text.contains("This is a test paragraph."));
        assert!(text.contains("Item 1\nItem 2"));
        assert!(!text.contains("var x = 1"));
        assert!(!text.contains("color: red"));
        assert!(!text.contains("Test"));
    }

    #[test]
    fn test_entities() {
        let text = extract_text("<p>A &amp; B &lt; C &gt; D &quot;E&quot;</p>");
        assert_eq!(text, "A & B < C > D \"E\"");
        assert_eq!(decode_entities("&amp;lt;"), "&lt;");
    }

    #[test]
    fn test_block_tags_match_whole_names() {
        assert_eq!(extract_text("one<param>two"), "onetwo");
        assert_eq!(extract_text("one<br/>two"), "one\ntwo");
    }

    #[test]
    fn test_extract_title() {
        let html = "<html><head><TITLE>\n  Grid   storage &amp; batteries </TITLE></head></html>";
        assert_eq!(extract_title(html).as_deref(), Some("Grid storage & batteries"));
        assert_eq!(extract_title("<p>no title</p>"), None);
        assert_eq!(extract_title("<title>  </title>"), None);
    }
}
