//! Package processing: manifest resolution, storage-verified entry point, and
//! the pending → processing → ready | failed lifecycle.

use chrono::{DateTime, Utc};
use percent_encoding::percent_decode_str;
use serde::Serialize;
use std::{io, path::Path};
use thiserror::Error;
use uuid::Uuid;

use crate::{
    cmi::ScormVersion,
    manifest::{parse_manifest, ManifestError, ParsedManifest},
    models::{Package, PackageStatus},
    storage::{extract_zip_to_dir, find_manifest, DirStorage, PackageFiles},
};

/// Conventional launch files, tried in order when the manifest href is
/// missing or points at nothing.
pub const ENTRY_POINT_CANDIDATES: &[&str] = &[
    "index_lms.html",
    "index_lms_html5.html",
    "story.html",
    "story_html5.html",
    "index.html",
    "index.htm",
    "scormcontent/index.html",
    "launch.html",
    "default.html",
    "a001index.html",
    "res/index.html",
    "scormdriver/indexAPI.html",
];

#[derive(Error, Debug)]
pub enum PackageError {
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    #[error("no launchable entry point: manifest href {manifest_href:?} missing from storage and none of the {tried} conventional names exist")]
    NoEntryPoint {
        manifest_href: Option<String>,
        tried: usize,
    },
    #[error("package is {from}, cannot move to {to}")]
    Lifecycle {
        from: &'static str,
        to: &'static str,
    },
    #[error("invalid package archive: {0}")]
    Archive(String),
    #[error("storage error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthoringTool {
    ArticulateStoryline,
    ArticulateRise,
    AdobeCaptivate,
    Ispring,
    Lectora,
    Elucidat,
    DominKnow,
    Unknown,
}

impl AuthoringTool {
    pub fn as_str(self) -> &'static str {
        match self {
            AuthoringTool::ArticulateStoryline => "articulate_storyline",
            AuthoringTool::ArticulateRise => "articulate_rise",
            AuthoringTool::AdobeCaptivate => "adobe_captivate",
            AuthoringTool::Ispring => "ispring",
            AuthoringTool::Lectora => "lectora",
            AuthoringTool::Elucidat => "elucidat",
            AuthoringTool::DominKnow => "dominknow",
            AuthoringTool::Unknown => "unknown",
        }
    }
}

/// Heuristic tag for diagnostics. Never consulted for completion.
pub fn classify_authoring_tool(entry_href: &str, manifest_text: &str) -> AuthoringTool {
    let entry = entry_href.to_ascii_lowercase();
    let text = manifest_text.to_ascii_lowercase();
    if entry.starts_with("scormcontent/") || text.contains("articulate rise") {
        AuthoringTool::ArticulateRise
    } else if entry.contains("story.html") || entry.contains("story_html5") || text.contains("storyline") {
        AuthoringTool::ArticulateStoryline
    } else if text.contains("captivate") || entry.contains("index_scorm.html") {
        AuthoringTool::AdobeCaptivate
    } else if text.contains("ispring") || entry.contains("index_lms.html") {
        AuthoringTool::Ispring
    } else if text.contains("lectora") || entry.contains("a001index.html") {
        AuthoringTool::Lectora
    } else if text.contains("elucidat") {
        AuthoringTool::Elucidat
    } else if text.contains("dominknow") {
        AuthoringTool::DominKnow
    } else {
        AuthoringTool::Unknown
    }
}

#[derive(Debug, Clone)]
pub struct Resolution {
    pub version: ScormVersion,
    /// Relative to the package root; keeps any query string from the manifest.
    pub entry_point_href: String,
    pub authoring_tool: AuthoringTool,
    pub manifest: ParsedManifest,
    pub resources: Vec<String>,
}

/// `index.html?x=1#top` -> `index.html`, percent-decoded.
fn href_path(href: &str) -> String {
    let path = href.split(['?', '#']).next().unwrap_or(href);
    percent_decode_str(path).decode_utf8_lossy().into_owned()
}

pub fn resolve(files: &impl PackageFiles) -> Result<Resolution, PackageError> {
    let manifest_path = find_manifest(files).ok_or(ManifestError::Missing)?;
    // hrefs are relative to the directory holding the manifest
    let base = manifest_path
        .rsplit_once('/')
        .map(|(dir, _)| format!("{dir}/"))
        .unwrap_or_default();
    let xml = files.read_to_string(&manifest_path)?;
    let manifest = parse_manifest(&xml)?;

    let verified = |href: &str| {
        let full = format!("{base}{}", href_path(href));
        files.exists(&full).then(|| format!("{base}{href}"))
    };
    let entry_point_href = match manifest.default_launch.as_deref().and_then(verified) {
        Some(href) => href,
        None => {
            if let Some(h) = &manifest.default_launch {
                tracing::warn!(href = %h, "manifest launch href not found in storage, probing");
            }
            ENTRY_POINT_CANDIDATES
                .iter()
                .find_map(|&c| verified(c))
                .ok_or_else(|| PackageError::NoEntryPoint {
                    manifest_href: manifest.default_launch.clone(),
                    tried: ENTRY_POINT_CANDIDATES.len(),
                })?
        }
    };

    let version = manifest.version.unwrap_or_else(|| {
        tracing::warn!("manifest does not declare a SCORM version, assuming 1.2");
        ScormVersion::Scorm12
    });
    let resources = manifest
        .resources
        .iter()
        .map(|r| format!("{base}{r}"))
        .collect();
    Ok(Resolution {
        version,
        authoring_tool: classify_authoring_tool(&entry_point_href, &xml),
        entry_point_href,
        manifest,
        resources,
    })
}

impl Package {
    pub fn new(unit_id: Uuid, title: String, base_path: String, now: DateTime<Utc>) -> Self {
        Package {
            id: Uuid::new_v4(),
            unit_id,
            title,
            scorm_version: None,
            entry_point_href: None,
            authoring_tool: None,
            manifest_data: serde_json::Value::Null,
            resource_list: Vec::new(),
            processing_status: PackageStatus::Pending,
            processing_error: None,
            base_path,
            created_at: now,
            updated_at: now,
        }
    }

    fn transition(&mut self, allowed: &[PackageStatus], to: PackageStatus, now: DateTime<Utc>) -> Result<(), PackageError> {
        if !allowed.contains(&self.processing_status) {
            return Err(PackageError::Lifecycle {
                from: self.processing_status.as_str(),
                to: to.as_str(),
            });
        }
        self.processing_status = to;
        self.updated_at = now;
        Ok(())
    }

    pub fn begin_processing(&mut self, now: DateTime<Utc>) -> Result<(), PackageError> {
        self.transition(&[PackageStatus::Pending], PackageStatus::Processing, now)
    }

    pub fn mark_ready(&mut self, r: Resolution, now: DateTime<Utc>) -> Result<(), PackageError> {
        self.transition(&[PackageStatus::Processing], PackageStatus::Ready, now)?;
        self.scorm_version = Some(r.version);
        self.entry_point_href = Some(r.entry_point_href);
        self.authoring_tool = Some(r.authoring_tool.as_str().to_string());
        if self.title.is_empty() {
            self.title = r.manifest.title.clone().unwrap_or_default();
        }
        self.manifest_data = serde_json::to_value(&r.manifest).unwrap_or(serde_json::Value::Null);
        self.resource_list = r.resources;
        self.processing_error = None;
        Ok(())
    }

    pub fn mark_failed(&mut self, err: &PackageError, now: DateTime<Utc>) -> Result<(), PackageError> {
        self.transition(&[PackageStatus::Processing], PackageStatus::Failed, now)?;
        self.processing_error = Some(err.to_string());
        Ok(())
    }

    /// The only way back into processing; there is no automatic retry. A ready
    /// package is immutable, so only failed ones can be reset.
    pub fn reset(&mut self, now: DateTime<Utc>) -> Result<(), PackageError> {
        self.transition(&[PackageStatus::Failed], PackageStatus::Pending, now)?;
        self.processing_error = None;
        Ok(())
    }

    /// Unpacks an uploaded archive under `out_dir` and processes it. A broken
    /// archive fails the package rather than the request.
    pub fn ingest(&mut self, archive: &[u8], out_dir: &Path, now: DateTime<Utc>) -> Result<PackageStatus, PackageError> {
        if let Err(e) = extract_zip_to_dir(archive, out_dir) {
            let err = PackageError::Archive(e.to_string());
            tracing::warn!(package_id = %self.id, error = %err, "package upload rejected");
            self.begin_processing(now)?;
            self.mark_failed(&err, now)?;
            return Ok(self.processing_status);
        }
        self.process(&DirStorage::new(out_dir), now)
    }

    /// Runs resolution for a pending package, recording the outcome on it.
    pub fn process(&mut self, files: &impl PackageFiles, now: DateTime<Utc>) -> Result<PackageStatus, PackageError> {
        self.begin_processing(now)?;
        match resolve(files) {
            Ok(r) => {
                tracing::info!(
                    package_id = %self.id,
                    entry = %r.entry_point_href,
                    version = %r.version,
                    tool = r.authoring_tool.as_str(),
                    "package ready"
                );
                self.mark_ready(r, now)?;
            }
            Err(e) => {
                tracing::warn!(package_id = %self.id, error = %e, "package processing failed");
                self.mark_failed(&e, now)?;
            }
        }
        Ok(self.processing_status)
    }
}
