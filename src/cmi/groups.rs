//! Flattens indexed CMI collections into ordered, typed rows.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::ScormVersion;

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Interaction {
    pub index: usize,
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub timestamp: Option<String>,
    pub weighting: Option<f64>,
    pub learner_response: Option<String>,
    pub result: Option<String>,
    pub latency: Option<String>,
    pub description: Option<String>,
    pub objective_ids: Vec<String>,
    pub correct_responses: Vec<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Objective {
    pub index: usize,
    pub id: Option<String>,
    pub success_status: Option<String>,
    pub completion_status: Option<String>,
    pub score_raw: Option<f64>,
    pub score_min: Option<f64>,
    pub score_max: Option<f64>,
    pub score_scaled: Option<f64>,
    pub progress_measure: Option<f64>,
    pub description: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Comment {
    pub index: usize,
    pub comment: String,
    pub location: Option<String>,
    pub timestamp: Option<String>,
}

/// Collects `prefix.N.rest = value` entries as `N -> [(rest, value)]`.
fn indexed<'a>(cmi: &'a BTreeMap<String, String>, prefix: &str) -> BTreeMap<usize, Vec<(&'a str, &'a str)>> {
    let mut out: BTreeMap<usize, Vec<(&str, &str)>> = BTreeMap::new();
    for (k, v) in cmi.range(prefix.to_string()..) {
        let Some(tail) = k.strip_prefix(prefix) else {
            break;
        };
        let Some((idx, rest)) = tail.split_once('.') else {
            continue;
        };
        if let Ok(i) = idx.parse::<usize>() {
            out.entry(i).or_default().push((rest, v.as_str()));
        }
    }
    out
}

/// Values of `sub.N.field` within one row, ordered by `N`.
fn nested(fields: &[(&str, &str)], sub: &str, field: &str) -> Vec<String> {
    let mut rows: BTreeMap<usize, String> = BTreeMap::new();
    for (rest, v) in fields {
        let Some(tail) = rest.strip_prefix(sub).and_then(|t| t.strip_prefix('.')) else {
            continue;
        };
        if let Some((idx, f)) = tail.split_once('.') {
            if f == field {
                if let Ok(i) = idx.parse() {
                    rows.insert(i, v.to_string());
                }
            }
        }
    }
    rows.into_values().collect()
}

fn num(v: &str) -> Option<f64> {
    v.trim().parse().ok().filter(|f: &f64| f.is_finite())
}

pub fn interactions(version: ScormVersion, cmi: &BTreeMap<String, String>) -> Vec<Interaction> {
    let response_key = match version {
        ScormVersion::Scorm12 => "student_response",
        ScormVersion::Scorm2004 => "learner_response",
    };
    let time_key = match version {
        ScormVersion::Scorm12 => "time",
        ScormVersion::Scorm2004 => "timestamp",
    };
    indexed(cmi, "cmi.interactions.")
        .into_iter()
        .map(|(index, fields)| {
            let mut row = Interaction {
                index,
                objective_ids: nested(&fields, "objectives", "id"),
                correct_responses: nested(&fields, "correct_responses", "pattern"),
                ..Default::default()
            };
            for (field, v) in &fields {
                let v = v.to_string();
                match *field {
                    "id" => row.id = Some(v),
                    "type" => row.kind = Some(v),
                    "weighting" => row.weighting = num(&v),
                    "result" => row.result = Some(v),
                    "latency" => row.latency = Some(v),
                    "description" => row.description = Some(v),
                    f if f == response_key => row.learner_response = Some(v),
                    f if f == time_key => row.timestamp = Some(v),
                    _ => {}
                }
            }
            row
        })
        .collect()
}

pub fn objectives(version: ScormVersion, cmi: &BTreeMap<String, String>) -> Vec<Objective> {
    indexed(cmi, "cmi.objectives.")
        .into_iter()
        .map(|(index, fields)| {
            let mut row = Objective {
                index,
                ..Default::default()
            };
            for (field, v) in fields {
                match (version, field) {
                    (_, "id") => row.id = Some(v.to_string()),
                    (_, "score.raw") => row.score_raw = num(v),
                    (_, "score.min") => row.score_min = num(v),
                    (_, "score.max") => row.score_max = num(v),
                    (ScormVersion::Scorm2004, "score.scaled") => row.score_scaled = num(v),
                    // 1.2 folds success and completion into one status vocabulary
                    (ScormVersion::Scorm12, "status") => match v {
                        "passed" | "failed" => row.success_status = Some(v.to_string()),
                        _ => row.completion_status = Some(v.to_string()),
                    },
                    (ScormVersion::Scorm2004, "success_status") => {
                        row.success_status = Some(v.to_string())
                    }
                    (ScormVersion::Scorm2004, "completion_status") => {
                        row.completion_status = Some(v.to_string())
                    }
                    (ScormVersion::Scorm2004, "progress_measure") => row.progress_measure = num(v),
                    (ScormVersion::Scorm2004, "description") => row.description = Some(v.to_string()),
                    _ => {}
                }
            }
            row
        })
        .collect()
}

pub fn comments(version: ScormVersion, cmi: &BTreeMap<String, String>) -> Vec<Comment> {
    match version {
        ScormVersion::Scorm12 => cmi
            .get("cmi.comments")
            .filter(|c| !c.is_empty())
            .map(|c| {
                vec![Comment {
                    index: 0,
                    comment: c.clone(),
                    ..Default::default()
                }]
            })
            .unwrap_or_default(),
        ScormVersion::Scorm2004 => indexed(cmi, "cmi.comments_from_learner.")
            .into_iter()
            .map(|(index, fields)| {
                let mut row = Comment {
                    index,
                    ..Default::default()
                };
                for (field, v) in fields {
                    match field {
                        "comment" => row.comment = v.to_string(),
                        "location" => row.location = Some(v.to_string()),
                        "timestamp" => row.timestamp = Some(v.to_string()),
                        _ => {}
                    }
                }
                row
            })
            .collect(),
    }
}
