//! Decisions about what counts as an alert and who or what a spoken
//! filter refers to.

use crate::config::{CameraConfig, FaceConfig};
use crate::detection::Label;

/// Spoken token meaning "any face the database does not know".
pub const STRANGER: &str = "stranger";
pub const UNKNOWN_FACE: &str = "Unknown";

/// What a spoken "who or what" token filters on. At most one is set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PersonOrThing {
    pub face: Option<String>,
    pub object: Option<String>,
}

/// Resolve a spoken token against the known faces.
pub fn determine_person_or_thing(token: &str, faces: &[FaceConfig]) -> PersonOrThing {
    let token = token.trim();
    if token.eq_ignore_ascii_case(STRANGER) {
        return PersonOrThing {
            face: Some(UNKNOWN_FACE.to_string()),
            object: None,
        };
    }

    let hit = faces.iter().find(|face| {
        face.database_name.eq_ignore_ascii_case(token)
            || face.aliases.iter().any(|a| a.eq_ignore_ascii_case(token))
    });
    match hit {
        Some(face) if face.as_object => PersonOrThing {
            face: None,
            object: Some(face.database_name.to_lowercase()),
        },
        Some(face) => PersonOrThing {
            face: Some(face.database_name.clone()),
            object: None,
        },
        None => PersonOrThing {
            face: None,
            object: Some(token.to_lowercase()),
        },
    }
}

/// Canonical camera name for a spoken alias, or `""` when nothing matches.
pub fn map_camera_alias(token: &str, cameras: &[CameraConfig]) -> String {
    let token = token.trim();
    cameras
        .iter()
        .find(|camera| {
            camera.name.eq_ignore_ascii_case(token)
                || camera.aliases.iter().any(|a| a.eq_ignore_ascii_case(token))
        })
        .map(|camera| camera.name.clone())
        .unwrap_or_default()
}

/// True if any label name contains any trigger word, ignoring case.
pub fn evaluate_labels(labels: &[Label], trigger_words: &[String]) -> bool {
    let words: Vec<String> =
        trigger_words.iter().map(|w| w.to_lowercase()).collect();
    labels.iter().any(|label| {
        let name = label.name.to_lowercase();
        words.iter().any(|w| !w.is_empty() && name.contains(w.as_str()))
    })
}

/// Labels from local detection that make a frame an alert. An empty
/// `alert_labels` list accepts every label name.
pub fn qualifying_labels<'a>(
    labels: &'a [Label],
    alert_labels: &[String],
    min_score: f64,
) -> Vec<&'a Label> {
    labels
        .iter()
        .filter(|label| label.score >= min_score)
        .filter(|label| {
            alert_labels.is_empty()
                || alert_labels.iter().any(|a| a.eq_ignore_ascii_case(&label.name))
        })
        .collect()
}
