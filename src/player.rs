//! Host page for one launch.
//!
//! The page carries two JSON blocks and the in-page adapter script. The
//! `scorm-launch` block is the [`LaunchConfig`] handoff. The `scorm-schema`
//! block is generated from the CMI tables, so the script enforces the same
//! access rules and reports the same error strings as [`crate::runtime::RuntimeApi`].

use serde::Serialize;
use std::collections::BTreeMap;

use crate::{
    cmi::{
        schema::{self, Access, Kind},
        ScormVersion,
    },
    runtime::{error::error_string, LaunchConfig},
};

const ADAPTER_JS: &str = include_str!("player.js");

const ERROR_CODES: &[u16] = &[
    0, 101, 102, 103, 104, 111, 112, 113, 122, 123, 132, 133, 142, 143, 201, 202, 203, 301, 351, 391,
    401, 402, 403, 404, 405, 406, 407, 408,
];

#[derive(Serialize, Debug)]
struct PageSchema {
    /// Element pattern to `ro`, `wo`, `rw` or `kw`.
    access: BTreeMap<&'static str, &'static str>,
    children: BTreeMap<&'static str, &'static str>,
    errors: BTreeMap<u16, &'static str>,
}

fn page_schema(version: ScormVersion) -> PageSchema {
    let mut access = BTreeMap::new();
    let mut children = BTreeMap::new();
    for def in schema::table(version) {
        let mode = match def.access {
            Access::ReadOnly => "ro",
            Access::WriteOnly => "wo",
            Access::ReadWrite => "rw",
            Access::Keyword => "kw",
        };
        access.insert(def.pattern, mode);
        if let Kind::Children(list) = def.kind {
            children.insert(def.pattern, list);
        }
    }
    let errors = ERROR_CODES
        .iter()
        .map(|&code| (code, error_string(version, code)))
        .filter(|(_, text)| !text.is_empty())
        .collect();
    PageSchema {
        access,
        children,
        errors,
    }
}

/// Serializes `value` so it can sit inside a `<script>` block: a `</script>`
/// in suspend data must not end the block.
fn inline_json<T: Serialize>(value: &T) -> serde_json::Result<String> {
    Ok(serde_json::to_string(value)?.replace("</", "<\\/"))
}

pub fn render(config: &LaunchConfig) -> serde_json::Result<String> {
    let handoff = inline_json(config)?;
    let schema = inline_json(&page_schema(config.scorm_version))?;
    let launch_url = config.content_url.as_deref().unwrap_or_default();

    Ok(format!(
        r#"<!DOCTYPE html>
<html>
<head>
  <meta charset='utf-8'/>
  <title>SCORM Player</title>
  <style>
    html,body,iframe{{height:100%;width:100%;margin:0;padding:0;border:0}}
  </style>
  <script type="application/json" id="scorm-launch">{handoff}</script>
  <script type="application/json" id="scorm-schema">{schema}</script>
  <script>
{ADAPTER_JS}
  </script>
</head>
<body>
<iframe id='sco' src='{launch_url}'></iframe>
</body>
</html>"#
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{models::PriorProgress, runtime::RuntimeSettings};
    use uuid::Uuid;

    fn launch(version: ScormVersion) -> LaunchConfig {
        LaunchConfig {
            session_id: Uuid::new_v4(),
            scorm_version: version,
            learner_id: "learner-1".into(),
            learner_name: None,
            sync_url: "http://lms.example.com/api/units/u/learners/learner-1/progress".into(),
            content_url: Some("/content/packages/p/index.html".into()),
            prior: Some(PriorProgress {
                suspend_data: Some("</script><script>alert(1)</script>".into()),
                ..Default::default()
            }),
            settings: RuntimeSettings::default(),
        }
    }

    #[test]
    fn schema_block_mirrors_the_cmi_table() {
        let s12 = page_schema(ScormVersion::Scorm12);
        assert_eq!(s12.access["cmi.core.student_id"], "ro");
        assert_eq!(s12.access["cmi.core.session_time"], "wo");
        assert_eq!(s12.access["cmi.core.lesson_location"], "rw");
        assert_eq!(s12.access["cmi.interactions._count"], "kw");
        assert_eq!(s12.children["cmi.core.score._children"], "raw,min,max");
        assert_eq!(s12.errors[&301], "Not initialized");
        assert!(!s12.errors.contains_key(&122));

        let s2004 = page_schema(ScormVersion::Scorm2004);
        assert_eq!(s2004.access["cmi.location"], "rw");
        assert_eq!(s2004.errors[&403], "Data Model Element Value Not Initialized");
        assert!(!s2004.access.contains_key("cmi.core.lesson_location"));
    }

    #[test]
    fn page_exposes_the_api_for_its_version() {
        let page = render(&launch(ScormVersion::Scorm12)).unwrap();
        assert!(page.contains(r#"id="scorm-launch""#));
        assert!(page.contains(r#"id="scorm-schema""#));
        assert!(page.contains("window.API = {"));
        assert!(page.contains("LMSInitialize: initialize"));
        assert!(page.contains("window.API_1484_11 = {"));
        assert!(page.contains("src='/content/packages/p/index.html'"));

        let page = render(&launch(ScormVersion::Scorm2004)).unwrap();
        assert!(page.contains(r#""scorm_version":"2004""#));
    }

    #[test]
    fn inlined_suspend_data_cannot_close_the_block() {
        let page = render(&launch(ScormVersion::Scorm12)).unwrap();
        assert!(!page.contains("</script><script>alert(1)"));
        assert!(page.contains(r"<\/script><script>alert(1)<\/script>"));
        // the script blocks themselves still close
        assert_eq!(page.matches("</script>").count(), 3);
    }
}
