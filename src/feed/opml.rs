use anyhow::{Context, Result};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;
use std::io::Cursor;
use std::path::Path;

use crate::storage::Feed;
use crate::util::write_atomic;

/// Exports the feed list as an OPML 2.0 XML string.
///
/// Each feed becomes an `<outline type="rss">` with `text`, `title` and
/// `xmlUrl`, plus `htmlUrl` once a fetched document has named the feed's
/// homepage. Feeds without a title fall back to their domain, then their link.
pub fn export_opml(feeds: &[Feed]) -> Result<String> {
    let mut writer = Writer::new_with_indent(Cursor::new(Vec::new()), b' ', 2);

    writer
        .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
        .context("Failed to write XML declaration")?;

    let mut opml = BytesStart::new("opml");
    opml.push_attribute(("version", "2.0"));
    writer
        .write_event(Event::Start(opml))
        .context("Failed to write opml element")?;

    writer
        .write_event(Event::Start(BytesStart::new("head")))
        .context("Failed to write head element")?;
    writer
        .write_event(Event::Start(BytesStart::new("title")))
        .context("Failed to write title element")?;
    writer
        .write_event(Event::Text(BytesText::new("gazette feeds")))
        .context("Failed to write title text")?;
    writer
        .write_event(Event::End(BytesEnd::new("title")))
        .context("Failed to write title end")?;
    writer
        .write_event(Event::End(BytesEnd::new("head")))
        .context("Failed to write head end")?;

    writer
        .write_event(Event::Start(BytesStart::new("body")))
        .context("Failed to write body element")?;

    for feed in feeds {
        let label = display_name(feed);
        let mut outline = BytesStart::new("outline");
        outline.push_attribute(("type", "rss"));
        outline.push_attribute(("text", label));
        outline.push_attribute(("title", label));
        outline.push_attribute(("xmlUrl", feed.link.as_str()));
        if let Some(site_link) = &feed.site_link {
            outline.push_attribute(("htmlUrl", site_link.as_str()));
        }
        writer
            .write_event(Event::Empty(outline))
            .context("Failed to write outline element")?;
    }

    writer
        .write_event(Event::End(BytesEnd::new("body")))
        .context("Failed to write body end")?;
    writer
        .write_event(Event::End(BytesEnd::new("opml")))
        .context("Failed to write opml end")?;

    let result = writer.into_inner().into_inner();
    String::from_utf8(result).context("Generated OPML contains invalid UTF-8")
}

/// Exports the feed list to an OPML file, replacing it atomically.
pub fn export_to_file(feeds: &[Feed], path: &Path) -> Result<()> {
    let content = export_opml(feeds)?;
    write_atomic(path, content.as_bytes())
        .with_context(|| format!("Failed to write OPML to '{}'", path.display()))
}

fn display_name(feed: &Feed) -> &str {
    [&feed.title, &feed.domain]
        .into_iter()
        .find(|s| !s.is_empty())
        .map_or(feed.link.as_str(), String::as_str)
}
