//! XMLTV-style program guide
//!
//! Programmes carry no start/stop: the player times them from the
//! playback file, so the guide is just the ordered list per channel.

use crate::error::{Error, Result};
use crate::models::{Channel, PlaybackEntry};
use crate::xml::{decode_entities, get_attribute, resolve_entity};
use flate2::write::GzEncoder;
use flate2::Compression;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::reader::Reader;
use quick_xml::Writer;
use std::io::Write;
use std::path::Path;

pub const GENERATOR: &str = "linearcast";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GuideProgramme {
    pub title: String,
    pub description: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GuideChannel {
    pub id: String,
    pub display_name: String,
    pub programmes: Vec<GuideProgramme>,
}

pub fn display_name(channel: &Channel) -> String {
    format!("{}. {}", channel.number, channel.name)
}

fn programme_title(entry: &PlaybackEntry) -> String {
    match &entry.season_episode_label {
        Some(label) => format!("{} - {} ({})", entry.group_key, entry.title, label),
        None if entry.group_key != entry.title => format!("{} - {}", entry.group_key, entry.title),
        None => entry.title.clone(),
    }
}

fn text_element<W: Write>(writer: &mut Writer<W>, name: &str, text: &str) -> std::io::Result<()> {
    writer.write_event(Event::Start(BytesStart::new(name)))?;
    writer.write_event(Event::Text(BytesText::new(text)))?;
    writer.write_event(Event::End(BytesEnd::new(name)))
}

fn write_guide<W: Write>(writer: &mut Writer<W>, channels: &[(&Channel, &[PlaybackEntry])]) -> std::io::Result<()> {
    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
    writer.write_event(Event::DocType(BytesText::from_escaped(r#"tv SYSTEM "xmltv.dtd""#)))?;

    let mut root = BytesStart::new("tv");
    root.push_attribute(("generator-info-name", GENERATOR));
    writer.write_event(Event::Start(root))?;

    for (channel, entries) in channels {
        let mut element = BytesStart::new("channel");
        element.push_attribute(("id", channel.id.as_str()));
        writer.write_event(Event::Start(element))?;
        text_element(writer, "display-name", &display_name(channel))?;
        writer.write_event(Event::End(BytesEnd::new("channel")))?;

        for entry in entries.iter() {
            let mut programme = BytesStart::new("programme");
            programme.push_attribute(("channel", channel.id.as_str()));
            writer.write_event(Event::Start(programme))?;
            text_element(writer, "title", &programme_title(entry))?;
            text_element(writer, "desc", &entry.description)?;
            writer.write_event(Event::End(BytesEnd::new("programme")))?;
        }
    }

    writer.write_event(Event::End(BytesEnd::new("tv")))
}

/// Guide document for `channels`, in the order given
pub fn render_guide(channels: &[(&Channel, &[PlaybackEntry])]) -> Result<Vec<u8>> {
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
    write_guide(&mut writer, channels).map_err(|e| Error::io(GENERATOR, e))?;
    let mut bytes = writer.into_inner();
    bytes.push(b'\n');
    Ok(bytes)
}

pub fn compress(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes).map_err(|e| Error::io("gzip", e))?;
    encoder.finish().map_err(|e| Error::io("gzip", e))
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ParserState {
    Root,
    Channel,
    DisplayName,
    Programme,
    Title,
    Desc,
}

/// Parse a guide document back into channels and their programmes
pub fn parse_guide(xml: &str) -> Result<Vec<GuideChannel>> {
    let mut reader = Reader::from_str(xml);
    let mut channels: Vec<GuideChannel> = Vec::new();
    let mut state = ParserState::Root;
    let mut text_buf = String::new();
    let mut programme = GuideProgramme::default();
    let mut programme_channel = String::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) | Ok(Event::Empty(ref e)) => match e.name().as_ref() {
                b"channel" => {
                    state = ParserState::Channel;
                    channels.push(GuideChannel {
                        id: get_attribute(e, b"id").unwrap_or_default(),
                        ..Default::default()
                    });
                }
                b"programme" => {
                    state = ParserState::Programme;
                    programme = GuideProgramme::default();
                    programme_channel = get_attribute(e, b"channel").unwrap_or_default();
                }
                b"display-name" if state == ParserState::Channel => {
                    state = ParserState::DisplayName;
                    text_buf.clear();
                }
                b"title" if state == ParserState::Programme => {
                    state = ParserState::Title;
                    text_buf.clear();
                }
                b"desc" if state == ParserState::Programme => {
                    state = ParserState::Desc;
                    text_buf.clear();
                }
                _ => {}
            },
            Ok(Event::Text(e)) => {
                if matches!(state, ParserState::DisplayName | ParserState::Title | ParserState::Desc) {
                    text_buf.push_str(&decode_entities(&String::from_utf8_lossy(&e)));
                }
            }
            Ok(Event::GeneralRef(e)) => {
                if matches!(state, ParserState::DisplayName | ParserState::Title | ParserState::Desc) {
                    text_buf.push_str(&resolve_entity(&String::from_utf8_lossy(&e)));
                }
            }
            Ok(Event::End(ref e)) => match e.name().as_ref() {
                b"display-name" => {
                    if let Some(channel) = channels.last_mut() {
                        channel.display_name = text_buf.trim().to_string();
                    }
                    state = ParserState::Channel;
                }
                b"title" if state == ParserState::Title => {
                    programme.title = text_buf.trim().to_string();
                    state = ParserState::Programme;
                }
                b"desc" if state == ParserState::Desc => {
                    programme.description = text_buf.trim().to_string();
                    state = ParserState::Programme;
                }
                b"channel" => state = ParserState::Root,
                b"programme" => {
                    let owner = channels.iter_mut().rev().find(|c| c.id == programme_channel);
                    match owner {
                        Some(channel) => channel.programmes.push(std::mem::take(&mut programme)),
                        None => tracing::debug!("Programme for unknown channel {}", programme_channel),
                    }
                    state = ParserState::Root;
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(Error::InvalidChannelState(format!(
                    "guide XML error at byte {}: {}",
                    reader.buffer_position(),
                    e
                )))
            }
            _ => {}
        }
    }

    Ok(channels)
}

/// Read a guide file, `None` when it has not been written yet
pub fn read_guide(path: &Path) -> Result<Option<Vec<GuideChannel>>> {
    match crate::storage::read_optional(path)? {
        Some(xml) => parse_guide(&xml).map(Some),
        None => Ok(None),
    }
}
