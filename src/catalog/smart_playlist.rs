//! Smart playlist (.xsp) reader
//!
//! Kodi smart playlists are small XML documents:
//!
//! ```xml
//! <smartplaylist type="episodes">
//!     <name>Sitcoms</name>
//!     <match>one</match>
//!     <rule field="tvshow" operator="is"><value>Frasier</value><value>Cheers</value></rule>
//!     <order direction="ascending">random</order>
//! </smartplaylist>
//! ```
//!
//! Older files put the rule value directly inside `<rule>`.

use crate::error::{Error, Result};
use crate::models::{GroupKey, SourceKind};
use crate::xml::{decode_entities, get_attribute, resolve_entity};
use quick_xml::events::Event;
use quick_xml::reader::Reader;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub field: String,
    pub operator: String,
    pub values: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SmartPlaylist {
    /// Location the playlist was read from, as the catalog knows it
    pub location: String,
    /// `episodes`, `movies`, `tvshows`, ...
    pub media_type: String,
    pub name: Option<String>,
    /// `<match>one</match>`: any rule may match instead of all
    pub match_one: bool,
    pub rules: Vec<Rule>,
    pub order: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ParserState {
    Root,
    Name,
    Match,
    Order,
    Limit,
    Rule,
    Value,
}

impl SmartPlaylist {
    pub fn load(path: &Path, location: &str) -> Result<Self> {
        let xml = std::fs::read_to_string(path)
            .map_err(|e| Error::InvalidSource(format!("cannot read {}: {}", path.display(), e)))?;
        let mut playlist = Self::parse(&xml)?;
        playlist.location = location.to_string();
        Ok(playlist)
    }

    pub fn parse(xml: &str) -> Result<Self> {
        // No text trimming: entity references split text into several events
        let mut reader = Reader::from_str(xml);

        let mut playlist = SmartPlaylist::default();
        let mut seen_root = false;
        let mut state = ParserState::Root;
        let mut text_buf = String::new();
        let mut current_rule: Option<Rule> = None;

        loop {
            match reader.read_event() {
                Ok(Event::Start(ref e)) | Ok(Event::Empty(ref e)) => match e.name().as_ref() {
                    b"smartplaylist" => {
                        seen_root = true;
                        playlist.media_type = get_attribute(e, b"type").unwrap_or_default();
                    }
                    b"name" => { state = ParserState::Name; text_buf.clear(); }
                    b"match" => { state = ParserState::Match; text_buf.clear(); }
                    b"order" => { state = ParserState::Order; text_buf.clear(); }
                    b"limit" => { state = ParserState::Limit; text_buf.clear(); }
                    b"rule" => {
                        state = ParserState::Rule;
                        text_buf.clear();
                        current_rule = Some(Rule {
                            field: get_attribute(e, b"field").unwrap_or_default().to_lowercase(),
                            operator: get_attribute(e, b"operator").unwrap_or_default().to_lowercase(),
                            values: Vec::new(),
                        });
                    }
                    b"value" if state == ParserState::Rule => {
                        state = ParserState::Value;
                        text_buf.clear();
                    }
                    _ => {}
                },
                Ok(Event::Text(e)) => {
                    if state != ParserState::Root {
                        text_buf.push_str(&decode_entities(&String::from_utf8_lossy(&e)));
                    }
                }
                Ok(Event::GeneralRef(e)) => {
                    if state != ParserState::Root {
                        text_buf.push_str(&resolve_entity(&String::from_utf8_lossy(&e)));
                    }
                }
                Ok(Event::End(ref e)) => {
                    let text = text_buf.trim().to_string();
                    match e.name().as_ref() {
                        b"name" => { playlist.name = Some(text); state = ParserState::Root; }
                        b"match" => { playlist.match_one = text.eq_ignore_ascii_case("one"); state = ParserState::Root; }
                        b"order" => { playlist.order = Some(text); state = ParserState::Root; }
                        b"limit" => { playlist.limit = text.parse().ok(); state = ParserState::Root; }
                        b"value" => {
                            if let Some(rule) = current_rule.as_mut() {
                                if !text.is_empty() {
                                    rule.values.push(text);
                                }
                            }
                            text_buf.clear();
                            state = ParserState::Rule;
                        }
                        b"rule" => {
                            if let Some(mut rule) = current_rule.take() {
                                if rule.values.is_empty() && !text.is_empty() {
                                    rule.values.push(text);
                                }
                                playlist.rules.push(rule);
                            }
                            state = ParserState::Root;
                        }
                        _ => {}
                    }
                }
                Ok(Event::Eof) => break,
                Err(e) => {
                    return Err(Error::InvalidSource(format!(
                        "smart playlist XML error at byte {}: {}",
                        reader.buffer_position(),
                        e
                    )))
                }
                _ => {}
            }
        }

        if !seen_root {
            return Err(Error::InvalidSource("not a smart playlist".into()));
        }
        Ok(playlist)
    }

    pub fn is_random(&self) -> bool {
        self.order.as_deref().is_some_and(|o| o.eq_ignore_ascii_case("random"))
    }

    /// Whether the playlist's declared type fits a source of `kind`
    pub fn matches_kind(&self, kind: SourceKind) -> bool {
        self.media_type == kind.label()
    }

    /// Groups named by the rules, in rule order: shows for episodic
    /// playlists, titles for flat ones, and studios for both
    pub fn group_order_hint(&self, kind: SourceKind) -> Vec<GroupKey> {
        let mut hint: Vec<GroupKey> = Vec::new();
        for rule in &self.rules {
            let wanted = match rule.field.as_str() {
                "tvshow" => kind == SourceKind::Episodic,
                "title" => kind == SourceKind::Flat,
                "studio" => true,
                _ => false,
            };
            if !wanted {
                continue;
            }
            for value in &rule.values {
                if !hint.contains(value) {
                    hint.push(value.clone());
                }
            }
        }
        hint
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_modern_playlist() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes" ?>
<smartplaylist type="episodes">
    <name>Sitcoms</name>
    <match>one</match>
    <rule field="tvshow" operator="is">
        <value>Frasier</value>
        <value>Cheers</value>
    </rule>
    <rule field="studio" operator="is"><value>NBC</value></rule>
    <limit>250</limit>
    <order direction="ascending">random</order>
</smartplaylist>"#;
        let playlist = SmartPlaylist::parse(xml).unwrap();
        assert_eq!(playlist.media_type, "episodes");
        assert_eq!(playlist.name.as_deref(), Some("Sitcoms"));
        assert!(playlist.match_one);
        assert!(playlist.is_random());
        assert_eq!(playlist.limit, Some(250));
        assert_eq!(playlist.rules.len(), 2);
        assert_eq!(playlist.rules[0].values, vec!["Frasier", "Cheers"]);
        assert!(playlist.matches_kind(SourceKind::Episodic));
        assert!(!playlist.matches_kind(SourceKind::Flat));
        assert_eq!(
            playlist.group_order_hint(SourceKind::Episodic),
            vec!["Frasier", "Cheers", "NBC"]
        );
    }

    #[test]
    fn test_parse_legacy_rule_text_and_entities() {
        let xml = r#"<smartplaylist type="movies">
    <match>all</match>
    <rule field="title" operator="contains">Tom &amp; Jerry</rule>
    <rule field="tvshow" operator="is">Ignored For Movies</rule>
    <order direction="ascending">title</order>
</smartplaylist>"#;
        let playlist = SmartPlaylist::parse(xml).unwrap();
        assert!(!playlist.match_one);
        assert!(!playlist.is_random());
        assert_eq!(playlist.rules[0].values, vec!["Tom & Jerry"]);
        assert_eq!(playlist.group_order_hint(SourceKind::Flat), vec!["Tom & Jerry"]);
    }

    #[test]
    fn test_rejects_non_playlist() {
        assert!(SmartPlaylist::parse("<playlist><trackList/></playlist>").is_err());
        assert!(SmartPlaylist::parse("<smartplaylist type=\"episodes\"><name>x</smartplaylist>").is_err());
    }
}
