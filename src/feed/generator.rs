use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use quick_xml::events::{BytesCData, BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;
use std::io::Cursor;

const CONTENT_NS: &str = "http://purl.org/rss/1.0/modules/content/";

/// Channel-level data for [`generate_rss`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RssChannel {
    pub title: String,
    pub link: String,
    pub description: String,
    pub language: Option<String>,
    /// Written as `<lastBuildDate>`; never read from the clock
    pub last_build_date: Option<DateTime<Utc>>,
    pub items: Vec<RssItem>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RssItem {
    pub title: String,
    pub link: String,
    /// Plain summary, written as CDATA `<description>`
    pub description: Option<String>,
    /// Full HTML, written as CDATA `<content:encoded>`
    pub content: Option<String>,
    pub author: Option<String>,
    pub pub_date: Option<DateTime<Utc>>,
    /// Distinct identifier; when absent (or equal to the link) the link is
    /// the permalink guid
    pub guid: Option<String>,
}

/// Serializes a channel as RSS 2.0.
///
/// Output depends only on the input, so identical channels produce
/// byte-identical documents. Text is escaped by quick-xml, dates use
/// RFC 822 form, and description/content bodies are wrapped in CDATA.
///
/// # Errors
///
/// Returns an error only if the underlying writer fails.
pub fn generate_rss(channel: &RssChannel) -> Result<String> {
    let mut writer = Writer::new_with_indent(Cursor::new(Vec::new()), b' ', 2);

    writer
        .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
        .context("Failed to write XML declaration")?;

    let mut rss = BytesStart::new("rss");
    rss.push_attribute(("version", "2.0"));
    rss.push_attribute(("xmlns:content", CONTENT_NS));
    writer
        .write_event(Event::Start(rss))
        .context("Failed to write rss element")?;
    writer
        .write_event(Event::Start(BytesStart::new("channel")))
        .context("Failed to write channel element")?;

    write_text_element(&mut writer, "title", &channel.title)?;
    write_text_element(&mut writer, "link", &channel.link)?;
    write_text_element(&mut writer, "description", &channel.description)?;
    if let Some(language) = &channel.language {
        write_text_element(&mut writer, "language", language)?;
    }
    if let Some(built) = channel.last_build_date {
        write_text_element(&mut writer, "lastBuildDate", &built.to_rfc2822())?;
    }

    for item in &channel.items {
        write_item(&mut writer, item)?;
    }

    writer
        .write_event(Event::End(BytesEnd::new("channel")))
        .context("Failed to write channel end")?;
    writer
        .write_event(Event::End(BytesEnd::new("rss")))
        .context("Failed to write rss end")?;

    let bytes = writer.into_inner().into_inner();
    String::from_utf8(bytes).context("Generated RSS contains invalid UTF-8")
}

fn write_item(writer: &mut Writer<Cursor<Vec<u8>>>, item: &RssItem) -> Result<()> {
    writer
        .write_event(Event::Start(BytesStart::new("item")))
        .context("Failed to write item element")?;

    write_text_element(writer, "title", &item.title)?;
    write_text_element(writer, "link", &item.link)?;

    if let Some(description) = &item.description {
        write_cdata_element(writer, "description", description)?;
    }
    if let Some(content) = &item.content {
        write_cdata_element(writer, "content:encoded", content)?;
    }
    if let Some(author) = &item.author {
        write_text_element(writer, "author", author)?;
    }
    if let Some(published) = item.pub_date {
        write_text_element(writer, "pubDate", &published.to_rfc2822())?;
    }

    let (guid, permalink) = match item.guid.as_deref() {
        Some(guid) if !guid.is_empty() && guid != item.link => (guid, "false"),
        _ => (item.link.as_str(), "true"),
    };
    let mut guid_start = BytesStart::new("guid");
    guid_start.push_attribute(("isPermaLink", permalink));
    writer
        .write_event(Event::Start(guid_start))
        .context("Failed to write guid element")?;
    writer
        .write_event(Event::Text(BytesText::new(guid)))
        .context("Failed to write guid text")?;
    writer
        .write_event(Event::End(BytesEnd::new("guid")))
        .context("Failed to write guid end")?;

    writer
        .write_event(Event::End(BytesEnd::new("item")))
        .context("Failed to write item end")?;
    Ok(())
}

fn write_text_element(
    writer: &mut Writer<Cursor<Vec<u8>>>,
    name: &str,
    text: &str,
) -> Result<()> {
    writer
        .write_event(Event::Start(BytesStart::new(name)))
        .with_context(|| format!("Failed to write {name} element"))?;
    writer
        .write_event(Event::Text(BytesText::new(text)))
        .with_context(|| format!("Failed to write {name} text"))?;
    writer
        .write_event(Event::End(BytesEnd::new(name)))
        .with_context(|| format!("Failed to write {name} end"))?;
    Ok(())
}

fn write_cdata_element(
    writer: &mut Writer<Cursor<Vec<u8>>>,
    name: &str,
    text: &str,
) -> Result<()> {
    writer
        .write_event(Event::Start(BytesStart::new(name)))
        .with_context(|| format!("Failed to write {name} element"))?;
    for section in cdata_sections(text) {
        writer
            .write_event(Event::CData(BytesCData::new(section)))
            .with_context(|| format!("Failed to write {name} CDATA"))?;
    }
    writer
        .write_event(Event::End(BytesEnd::new(name)))
        .with_context(|| format!("Failed to write {name} end"))?;
    Ok(())
}

/// Splits text so no section contains `]]>`.
///
/// `a]]>b` becomes `a]]` and `>b`, which serialize as adjacent CDATA
/// sections that readers concatenate back to the original.
fn cdata_sections(text: &str) -> Vec<&str> {
    let mut sections = Vec::new();
    let mut rest = text;
    while let Some(pos) = rest.find("]]>") {
        sections.push(&rest[..pos + 2]);
        rest = &rest[pos + 2..];
    }
    sections.push(rest);
    sections
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    fn sample_channel() -> RssChannel {
        RssChannel {
            title: "Tom & Jerry's <News>".to_owned(),
            link: "https://example.com".to_owned(),
            description: "Cartoon \"news\"".to_owned(),
            language: Some("en".to_owned()),
            last_build_date: Some(Utc.with_ymd_and_hms(2025, 11, 24, 12, 0, 0).unwrap()),
            items: vec![
                RssItem {
                    title: "First & foremost".to_owned(),
                    link: "https://example.com/a?x=1&y=2".to_owned(),
                    description: Some("<p>Summary</p>".to_owned()),
                    content: Some("<div>Body with ]]> inside</div>".to_owned()),
                    author: Some("Jane Doe".to_owned()),
                    pub_date: Some(Utc.with_ymd_and_hms(2025, 11, 24, 10, 30, 0).unwrap()),
                    guid: None,
                },
                RssItem {
                    title: "Second".to_owned(),
                    link: "https://example.com/b".to_owned(),
                    guid: Some("urn:uuid:1234".to_owned()),
                    ..RssItem::default()
                },
            ],
        }
    }

    #[test]
    fn test_output_is_deterministic() {
        let channel = sample_channel();
        assert_eq!(
            generate_rss(&channel).unwrap(),
            generate_rss(&channel.clone()).unwrap()
        );
    }

    #[test]
    fn test_escapes_text() {
        let xml = generate_rss(&sample_channel()).unwrap();
        assert!(xml.contains("<title>Tom &amp; Jerry&apos;s &lt;News&gt;</title>"));
        assert!(xml.contains("https://example.com/a?x=1&amp;y=2"));
        assert!(xml.contains("Cartoon &quot;news&quot;"));
    }

    #[test]
    fn test_cdata_and_dates() {
        let xml = generate_rss(&sample_channel()).unwrap();
        assert!(xml.contains("<description><![CDATA[<p>Summary</p>]]></description>"));
        assert!(xml.contains("<![CDATA[<div>Body with ]]]]><![CDATA[> inside</div>]]>"));
        assert!(xml.contains("<pubDate>Mon, 24 Nov 2025 10:30:00 +0000</pubDate>"));
        assert!(xml.contains("<lastBuildDate>Mon, 24 Nov 2025 12:00:00 +0000</lastBuildDate>"));
        assert!(xml.contains("xmlns:content=\"http://purl.org/rss/1.0/modules/content/\""));
    }

    #[test]
    fn test_guid_permalink_rules() {
        let xml = generate_rss(&sample_channel()).unwrap();
        assert!(xml.contains(
            "<guid isPermaLink=\"true\">https://example.com/a?x=1&amp;y=2</guid>"
        ));
        assert!(xml.contains("<guid isPermaLink=\"false\">urn:uuid:1234</guid>"));
    }

    #[test]
    fn test_guid_equal_to_link_is_permalink() {
        let channel = RssChannel {
            items: vec![RssItem {
                title: "Same".to_owned(),
                link: "https://example.com/same".to_owned(),
                guid: Some("https://example.com/same".to_owned()),
                ..RssItem::default()
            }],
            ..RssChannel::default()
        };
        let xml = generate_rss(&channel).unwrap();
        assert!(xml.contains("<guid isPermaLink=\"true\">https://example.com/same</guid>"));
    }

    #[test]
    fn test_output_parses_back() {
        let xml = generate_rss(&sample_channel()).unwrap();
        let feed = feed_rs::parser::parse(xml.as_bytes()).unwrap();

        assert_eq!(feed.title.unwrap().content, "Tom & Jerry's <News>");
        assert_eq!(feed.entries.len(), 2);

        let first = &feed.entries[0];
        assert_eq!(first.title.as_ref().unwrap().content, "First & foremost");
        assert_eq!(first.links[0].href, "https://example.com/a?x=1&y=2");
        assert_eq!(
            first.published,
            Some(Utc.with_ymd_and_hms(2025, 11, 24, 10, 30, 0).unwrap())
        );
        assert_eq!(first.authors[0].name, "Jane Doe");
        assert_eq!(
            first.content.as_ref().and_then(|c| c.body.as_deref()),
            Some("<div>Body with ]]> inside</div>")
        );
    }

    #[test]
    fn test_cdata_sections() {
        assert_eq!(cdata_sections("plain"), vec!["plain"]);
        assert_eq!(cdata_sections("a]]>b"), vec!["a]]", ">b"]);
        assert_eq!(cdata_sections("]]>]]>"), vec!["]]", ">]]", ">"]);
    }
}
