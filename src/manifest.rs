use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use serde::Serialize;
use std::collections::HashMap;
use thiserror::Error;

use crate::cmi::ScormVersion;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ScoRef {
    pub identifier: String,
    pub href: String,
    pub parameters: Option<String>,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct ParsedManifest {
    pub identifier: Option<String>,
    pub version: Option<ScormVersion>,
    /// Raw `<schemaversion>` text, kept for diagnostics.
    pub schema_version: Option<String>,
    pub title: Option<String>,
    /// href of the default organization's first launchable item; may point at
    /// a file that does not exist, callers must verify it against storage.
    pub default_launch: Option<String>,
    pub scos: Vec<ScoRef>,
    /// Every href and `<file>` listed by any resource.
    pub resources: Vec<String>,
}

#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("imsmanifest.xml not found")]
    Missing,
    #[error("failed to parse manifest: {0}")]
    Parse(String),
}

#[derive(Default, Debug, Clone)]
struct ResourceInfo {
    href: Option<String>,
    files: Vec<String>,
}

#[derive(Default)]
struct Walk {
    out: ParsedManifest,
    // resource identifier -> info, plus declaration order for deterministic fallbacks
    resources: HashMap<String, ResourceInfo>,
    resource_order: Vec<String>,
    // (identifier, identifierref, parameters)
    items: Vec<(String, String, Option<String>)>,
    current_res_id: Option<String>,
    default_org_id: Option<String>,
    current_org_id: Option<String>,
    first_item_ref_in_default_org: Option<String>,
    first_item_ref_any: Option<String>,
    // element path, used to attribute text nodes
    path: Vec<String>,
}

pub fn parse_manifest(xml: &str) -> Result<ParsedManifest, ManifestError> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut buf = Vec::new();
    let mut w = Walk::default();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                let name = local_name(&e);
                w.open(&name, &e);
                w.path.push(name);
            }
            Ok(Event::Empty(e)) => {
                let name = local_name(&e);
                w.open(&name, &e);
                // self-closing <resource/> has no children
                if name == "resource" {
                    w.current_res_id = None;
                }
            }
            Ok(Event::Text(t)) => {
                let text = t
                    .unescape()
                    .map_err(|e| ManifestError::Parse(e.to_string()))?
                    .trim()
                    .to_string();
                w.text(text);
            }
            Ok(Event::End(e)) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).to_string();
                match name.rsplit(':').next().unwrap_or(&name) {
                    "organization" => w.current_org_id = None,
                    "resource" => w.current_res_id = None,
                    _ => {}
                }
                w.path.pop();
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(ManifestError::Parse(e.to_string())),
            _ => {}
        }
        buf.clear();
    }

    let mut out = w.out;
    let resources = w.resources;

    let chosen_item_ref = w.first_item_ref_in_default_org.or(w.first_item_ref_any);
    out.default_launch = chosen_item_ref
        .and_then(|r| resolve_launch_href(&resources, &r))
        .or_else(|| first_resource_href(&resources, &w.resource_order));

    out.scos = w
        .items
        .into_iter()
        .filter_map(|(identifier, identifierref, parameters)| {
            resolve_launch_href(&resources, &identifierref).map(|href| ScoRef {
                identifier,
                href,
                parameters,
            })
        })
        .collect();

    for id in &w.resource_order {
        if let Some(r) = resources.get(id) {
            for f in r.href.iter().chain(r.files.iter()) {
                if !out.resources.contains(f) {
                    out.resources.push(f.clone());
                }
            }
        }
    }

    if out.version.is_none() {
        out.version = classify_namespaces(xml);
    }
    Ok(out)
}

impl Walk {
    fn open(&mut self, name: &str, e: &BytesStart<'_>) {
        match name {
            "manifest" => {
                if self.out.identifier.is_none() {
                    self.out.identifier = get_attr(e, "identifier");
                }
            }
            "organizations" => {
                self.default_org_id = get_attr(e, "default");
            }
            "organization" => {
                self.current_org_id = get_attr(e, "identifier");
            }
            "item" => {
                let identifier = get_attr(e, "identifier");
                let identifierref = get_attr(e, "identifierref");
                let parameters = get_attr(e, "parameters");
                if let (Some(id), Some(iref)) = (identifier, identifierref) {
                    if self.first_item_ref_any.is_none() {
                        self.first_item_ref_any = Some(iref.clone());
                    }
                    let is_default_org = match (&self.default_org_id, &self.current_org_id) {
                        (Some(def), Some(cur)) => def == cur,
                        // no default declared: the first organization wins
                        (None, Some(_)) => true,
                        _ => false,
                    };
                    if is_default_org && self.first_item_ref_in_default_org.is_none() {
                        self.first_item_ref_in_default_org = Some(iref.clone());
                    }
                    self.items.push((id, iref, parameters));
                }
            }
            "resource" => {
                if let Some(id) = get_attr(e, "identifier") {
                    let info = self.resources.entry(id.clone()).or_default();
                    if let Some(h) = get_attr(e, "href") {
                        info.href = Some(h);
                    }
                    if !self.resource_order.contains(&id) {
                        self.resource_order.push(id.clone());
                    }
                    self.current_res_id = Some(id);
                }
            }
            "file" => {
                if let (Some(res_id), Some(href)) = (self.current_res_id.clone(), get_attr(e, "href")) {
                    self.resources.entry(res_id).or_default().files.push(href);
                }
            }
            _ => {}
        }
    }

    fn text(&mut self, text: String) {
        let parent = self.path.iter().rev().nth(1).map(String::as_str);
        match self.path.last().map(String::as_str) {
            Some("schemaversion") if self.out.schema_version.is_none() => {
                self.out.version = classify_schema_version(&text);
                self.out.schema_version = Some(text);
            }
            Some("title") if self.out.title.is_none() && parent == Some("organization") => {
                self.out.title = Some(text);
            }
            _ => {}
        }
    }
}

fn classify_schema_version(text: &str) -> Option<ScormVersion> {
    let t = text.to_ascii_lowercase();
    if t.contains("2004") || t.contains("1.3") {
        Some(ScormVersion::Scorm2004)
    } else if t.contains("1.2") {
        Some(ScormVersion::Scorm12)
    } else {
        None
    }
}

fn classify_namespaces(xml: &str) -> Option<ScormVersion> {
    if xml.contains("adlcp_v1p3") || xml.contains("imsss") {
        Some(ScormVersion::Scorm2004)
    } else if xml.contains("adlcp_rootv1p2") {
        Some(ScormVersion::Scorm12)
    } else {
        None
    }
}

// ------------- helpers -------------

fn local_name(tag: &BytesStart<'_>) -> String {
    let full = String::from_utf8_lossy(tag.name().as_ref()).to_string();
    full.rsplit(':').next().unwrap_or(&full).to_string()
}

fn get_attr(e: &BytesStart<'_>, key_local: &str) -> Option<String> {
    for a in e.attributes().flatten() {
        let key = std::str::from_utf8(a.key.as_ref()).unwrap_or_default();
        let key = key.rsplit(':').next().unwrap_or(key);
        if key == key_local {
            return Some(a.unescape_value().ok()?.into_owned());
        }
    }
    None
}

fn resolve_launch_href(resources: &HashMap<String, ResourceInfo>, identifierref: &str) -> Option<String> {
    // <file> entries list assets, not launch pages
    resources.get(identifierref)?.href.clone()
}

fn first_resource_href(resources: &HashMap<String, ResourceInfo>, order: &[String]) -> Option<String> {
    order
        .iter()
        .filter_map(|id| resources.get(id))
        .find_map(|r| r.href.clone())
}
