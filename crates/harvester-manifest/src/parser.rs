//! Streaming resource-list parser (`quick-xml`).
//!
//! The document is a sitemap `urlset`; each `url` carries a `loc` (whose last
//! path segment is the permId), a `lastmod`, and one `x:xd` element describing
//! the entity with its properties and outgoing connections. Namespace prefixes
//! are ignored: elements are matched on their local names.

use crate::error::{ManifestError, Result};
use crate::model::*;
use crate::resource_list::ResourceList;
use chrono::{DateTime, Utc};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::collections::{BTreeMap, HashMap};
use std::io::BufRead;

/// Parses a resource list into the candidate graph for one local namespace.
#[derive(Debug, Clone)]
pub struct ResourceListParser {
    local_space: String,
    watermark: DateTime<Utc>,
}

impl ResourceListParser {
    pub fn new(local_space: impl Into<String>, watermark: DateTime<Utc>) -> Self {
        Self {
            local_space: local_space.into(),
            watermark,
        }
    }

    pub fn parse_bytes(&self, bytes: &[u8]) -> Result<ResourceList> {
        self.parse(bytes)
    }

    pub fn parse<R: BufRead>(&self, input: R) -> Result<ResourceList> {
        let mut reader = Reader::from_reader(input);
        reader.trim_text(true);

        let mut state = ParseState::new(ResourceList::new(
            self.local_space.clone(),
            self.watermark,
        ));
        let mut buf = Vec::new();

        loop {
            match reader.read_event_into(&mut buf) {
                Ok(Event::Start(e)) => {
                    let attrs = read_attributes(&e, reader.buffer_position())?;
                    state.open(&local_name(&e), attrs)?;
                }
                Ok(Event::Empty(e)) => {
                    let name = local_name(&e);
                    let attrs = read_attributes(&e, reader.buffer_position())?;
                    state.open(&name, attrs)?;
                    state.close(&name)?;
                }
                Ok(Event::End(e)) => {
                    let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                    state.close(&name)?;
                }
                Ok(Event::Text(t)) => {
                    let text = t.unescape().map_err(|err| ManifestError::Xml {
                        position: reader.buffer_position(),
                        message: err.to_string(),
                    })?;
                    state.text.push_str(&text);
                }
                Ok(Event::CData(c)) => {
                    state.text.push_str(&String::from_utf8_lossy(&c));
                }
                Ok(Event::Eof) => {
                    if state.url.is_some() {
                        return Err(ManifestError::Xml {
                            position: reader.buffer_position(),
                            message: "document ends inside <url>".to_string(),
                        });
                    }
                    break;
                }
                Err(err) => {
                    return Err(ManifestError::Xml {
                        position: reader.buffer_position(),
                        message: err.to_string(),
                    })
                }
                _ => {}
            }
            buf.clear();
        }

        state.finish()
    }
}

fn local_name(e: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(e.local_name().as_ref()).into_owned()
}

fn read_attributes(e: &BytesStart<'_>, position: usize) -> Result<HashMap<String, String>> {
    let mut out = HashMap::new();
    for attr in e.attributes() {
        let attr = attr.map_err(|err| ManifestError::Xml {
            position,
            message: err.to_string(),
        })?;
        let key = String::from_utf8_lossy(attr.key.local_name().as_ref()).into_owned();
        let value = attr
            .unescape_value()
            .map_err(|err| ManifestError::Xml {
                position,
                message: err.to_string(),
            })?
            .into_owned();
        out.insert(key, value);
    }
    Ok(out)
}

/// Last path segment of `loc`, ignoring a trailing `M` (metadata) segment.
pub fn perm_id_from_loc(loc: &str) -> Option<String> {
    let mut segments: Vec<&str> = loc.split('/').filter(|s| !s.is_empty()).collect();
    if segments.last() == Some(&"M") {
        segments.pop();
    }
    let last = segments.last()?;
    if last.ends_with(':') {
        return None;
    }
    Some((*last).to_string())
}

pub fn parse_timestamp(value: &str) -> std::result::Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(value.trim())
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| e.to_string())
}

// ============================================================================
// Parse state
// ============================================================================

#[derive(Default)]
struct UrlDraft {
    loc: Option<String>,
    lastmod: Option<String>,
    xd: Option<XdDraft>,
}

struct XdDraft {
    attrs: HashMap<String, String>,
    properties: Properties,
    connections: Vec<(Option<String>, Option<String>)>,
}

#[derive(Default)]
struct PropertyDraft {
    code: Option<String>,
    value: Option<String>,
}

struct UrlContext {
    index: usize,
    loc: String,
}

impl XdDraft {
    fn required(&self, attribute: &'static str, ctx: &UrlContext) -> Result<String> {
        match self.attrs.get(attribute) {
            Some(v) if !v.trim().is_empty() => Ok(v.trim().to_string()),
            _ => Err(ManifestError::MissingAttribute {
                index: ctx.index,
                loc: ctx.loc.clone(),
                attribute,
            }),
        }
    }

    fn optional(&self, attribute: &str) -> Option<String> {
        self.attrs
            .get(attribute)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn connections(&self, from: &str, ctx: &UrlContext) -> Result<Vec<Connection>> {
        let mut out = Vec::with_capacity(self.connections.len());
        for (to, kind) in &self.connections {
            let to = to.as_deref().ok_or_else(|| ManifestError::DanglingConnection {
                index: ctx.index,
                loc: ctx.loc.clone(),
            })?;
            let label = kind.as_deref().unwrap_or_default();
            let kind = ConnectionKind::from_label(label).ok_or_else(|| {
                ManifestError::UnknownConnectionType {
                    index: ctx.index,
                    loc: ctx.loc.clone(),
                    kind: label.to_string(),
                }
            })?;
            out.push(Connection::new(from, to, kind));
        }
        Ok(out)
    }
}

struct ParseState {
    list: ResourceList,
    saw_root: bool,
    text: String,
    url_index: usize,
    url: Option<UrlDraft>,
    property: Option<PropertyDraft>,
}

impl ParseState {
    fn new(list: ResourceList) -> Self {
        Self {
            list,
            saw_root: false,
            text: String::new(),
            url_index: 0,
            url: None,
            property: None,
        }
    }

    fn open(&mut self, name: &str, attrs: HashMap<String, String>) -> Result<()> {
        self.text.clear();
        match name {
            "urlset" => self.saw_root = true,
            "md" if self.url.is_none() => {
                if let Some(at) = attrs.get("at") {
                    let ts = parse_timestamp(at).map_err(|message| {
                        ManifestError::InvalidDocumentTimestamp {
                            value: at.clone(),
                            message,
                        }
                    })?;
                    self.list.resource_list_timestamp = Some(ts);
                }
            }
            "url" => {
                if !self.saw_root {
                    return Err(ManifestError::MissingRoot);
                }
                self.url_index += 1;
                self.url = Some(UrlDraft::default());
            }
            "xd" => {
                if let Some(url) = self.url.as_mut() {
                    url.xd = Some(XdDraft {
                        attrs,
                        properties: BTreeMap::new(),
                        connections: Vec::new(),
                    });
                }
            }
            "property" => self.property = Some(PropertyDraft::default()),
            "connection" => {
                if let Some(xd) = self.url.as_mut().and_then(|u| u.xd.as_mut()) {
                    xd.connections
                        .push((attrs.get("to").cloned(), attrs.get("type").cloned()));
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn close(&mut self, name: &str) -> Result<()> {
        let text = std::mem::take(&mut self.text).trim().to_string();
        match name {
            "loc" => {
                if let Some(url) = self.url.as_mut() {
                    url.loc = Some(text);
                }
            }
            "lastmod" => {
                if let Some(url) = self.url.as_mut() {
                    url.lastmod = Some(text);
                }
            }
            "code" => {
                if let Some(p) = self.property.as_mut() {
                    p.code = Some(text);
                }
            }
            "value" => {
                if let Some(p) = self.property.as_mut() {
                    p.value = Some(text);
                }
            }
            "property" => {
                let property = self.property.take();
                let xd = self.url.as_mut().and_then(|u| u.xd.as_mut());
                if let (Some(property), Some(xd)) = (property, xd) {
                    match property.code {
                        Some(code) if !code.is_empty() => {
                            xd.properties
                                .insert(code, property.value.unwrap_or_default());
                        }
                        _ => tracing::warn!(url = self.url_index, "property without code ignored"),
                    }
                }
            }
            "url" => {
                if let Some(draft) = self.url.take() {
                    self.finish_url(draft)?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn finish_url(&mut self, draft: UrlDraft) -> Result<()> {
        let index = self.url_index;
        let loc = draft.loc.ok_or(ManifestError::MissingElement {
            index,
            element: "loc",
        })?;
        let lastmod = draft.lastmod.ok_or(ManifestError::MissingElement {
            index,
            element: "lastmod",
        })?;
        let xd = draft.xd.ok_or(ManifestError::MissingElement {
            index,
            element: "x:xd",
        })?;
        let ctx = UrlContext { index, loc };

        let last_modified =
            parse_timestamp(&lastmod).map_err(|message| ManifestError::InvalidTimestamp {
                index,
                loc: ctx.loc.clone(),
                value: lastmod.clone(),
                message,
            })?;

        let kind_label = xd.required("kind", &ctx)?;
        let kind = EntityKind::from_label(&kind_label).ok_or_else(|| ManifestError::UnknownKind {
            index,
            loc: ctx.loc.clone(),
            kind: kind_label.clone(),
        })?;

        if kind == EntityKind::Material {
            self.list.materials.push(IncomingMaterial {
                last_modified,
                material: NewMaterial {
                    code: xd.required("code", &ctx)?,
                    material_type: xd.required("type", &ctx)?,
                    properties: xd.properties.clone(),
                },
            });
            return Ok(());
        }

        let perm_id = perm_id_from_loc(&ctx.loc).ok_or_else(|| ManifestError::InvalidLoc {
            index,
            loc: ctx.loc.clone(),
        })?;
        let connections = xd.connections(&perm_id, &ctx)?;
        let has_attachments = xd.optional("attachments").as_deref() == Some("true");
        let space = self.list.local_space.clone();
        let code = xd.required("code", &ctx)?;

        match kind {
            EntityKind::Project => {
                let entity = NewProject {
                    perm_id: perm_id.clone(),
                    identifier: format!("/{space}/{code}"),
                    code,
                    space,
                    description: xd.optional("desc"),
                };
                insert_unique(
                    &mut self.list.projects,
                    kind,
                    Incoming {
                        perm_id,
                        last_modified,
                        entity,
                        connections,
                        has_attachments,
                    },
                )
            }
            EntityKind::Experiment => {
                let identifier = match xd.optional("project") {
                    Some(project) => format!("/{space}/{project}/{code}"),
                    None => format!("/{space}/{code}"),
                };
                let entity = NewExperiment {
                    perm_id: perm_id.clone(),
                    code,
                    experiment_type: xd.required("type", &ctx)?,
                    identifier,
                    properties: xd.properties,
                };
                insert_unique(
                    &mut self.list.experiments,
                    kind,
                    Incoming {
                        perm_id,
                        last_modified,
                        entity,
                        connections,
                        has_attachments,
                    },
                )
            }
            EntityKind::Sample => {
                let entity = NewSample {
                    perm_id: perm_id.clone(),
                    identifier: format!("/{space}/{code}"),
                    code,
                    sample_type: xd.required("type", &ctx)?,
                    properties: xd.properties,
                    experiment_identifier: None,
                    container_identifier: None,
                    parent_identifiers: None,
                };
                insert_unique(
                    &mut self.list.samples,
                    kind,
                    Incoming {
                        perm_id,
                        last_modified,
                        entity,
                        connections,
                        has_attachments,
                    },
                )
            }
            EntityKind::DataSet => {
                let data_set_kind = match xd.optional("dsKind").as_deref() {
                    None | Some("PHYSICAL") => DataSetKind::Physical,
                    Some("CONTAINER") => DataSetKind::Container {
                        contained_codes: Vec::new(),
                    },
                    Some(other) => {
                        return Err(ManifestError::UnknownDataSetKind {
                            index,
                            loc: ctx.loc.clone(),
                            value: other.to_string(),
                        })
                    }
                };
                let entity = NewDataSet {
                    perm_id: perm_id.clone(),
                    code,
                    data_set_type: xd.required("type", &ctx)?,
                    kind: data_set_kind,
                    properties: xd.properties,
                    sample_identifier: None,
                    experiment_identifier: None,
                    parent_codes: Vec::new(),
                };
                insert_unique(
                    &mut self.list.data_sets,
                    kind,
                    Incoming {
                        perm_id,
                        last_modified,
                        entity,
                        connections,
                        has_attachments: false,
                    },
                )
            }
            EntityKind::Material => unreachable!("materials are handled above"),
        }
    }

    fn finish(self) -> Result<ResourceList> {
        if !self.saw_root {
            return Err(ManifestError::MissingRoot);
        }
        let list = self.list;
        tracing::debug!(
            space = %list.local_space,
            projects = list.projects.len(),
            experiments = list.experiments.len(),
            samples = list.samples.len(),
            data_sets = list.data_sets.len(),
            materials = list.materials.len(),
            "parsed resource list"
        );
        Ok(list)
    }
}

fn insert_unique<T>(
    map: &mut BTreeMap<PermId, Incoming<T>>,
    kind: EntityKind,
    incoming: Incoming<T>,
) -> Result<()> {
    if map.contains_key(&incoming.perm_id) {
        return Err(ManifestError::DuplicatePermId {
            kind,
            perm_id: incoming.perm_id,
        });
    }
    map.insert(incoming.perm_id.clone(), incoming);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn perm_id_is_last_segment_before_metadata_marker() {
        assert_eq!(
            perm_id_from_loc("https://h/re-sync/SAMPLE/20160630-7/M").as_deref(),
            Some("20160630-7")
        );
        assert_eq!(
            perm_id_from_loc("https://h/re-sync/SAMPLE/20160630-7").as_deref(),
            Some("20160630-7")
        );
        assert_eq!(perm_id_from_loc("20160630-7").as_deref(), Some("20160630-7"));
        assert_eq!(perm_id_from_loc("https://M"), None);
        assert_eq!(perm_id_from_loc(""), None);
    }

    #[test]
    fn timestamps_are_normalized_to_utc() {
        let ts = parse_timestamp("2016-06-30T12:38:51.000+02:00").unwrap();
        assert_eq!(ts.to_rfc3339(), "2016-06-30T10:38:51+00:00");
        assert!(parse_timestamp("30-06-16 10-38-51").is_err());
    }

    #[test]
    fn url_before_root_is_rejected() {
        let parser = ResourceListParser::new("DST", crate::epoch());
        let err = parser
            .parse_bytes(b"<url><loc>x</loc></url>")
            .unwrap_err();
        assert!(matches!(err, ManifestError::MissingRoot));
    }

    #[test]
    fn empty_document_has_no_root() {
        let parser = ResourceListParser::new("DST", crate::epoch());
        assert!(matches!(
            parser.parse_bytes(b"").unwrap_err(),
            ManifestError::MissingRoot
        ));
    }
}
