use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Cursor;
use tracing::debug;

/// Raw EXIF tags of an image. Missing metadata is reported, not judged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExifReport {
    pub tool: String,
    pub image_path: String,
    pub generated_at: DateTime<Utc>,
    pub has_exif: bool,
    pub message: String,
    pub exif_raw: BTreeMap<String, String>,
}

pub fn analyze(bytes: &[u8], image_path: &str) -> ExifReport {
    let tags = extract(bytes);
    let has_exif = !tags.is_empty();
    ExifReport {
        tool: "exif_analysis".into(),
        image_path: image_path.to_string(),
        generated_at: Utc::now(),
        has_exif,
        message: if has_exif {
            "EXIF exists".into()
        } else {
            "EXIF does not exist".into()
        },
        exif_raw: tags,
    }
}

fn extract(bytes: &[u8]) -> BTreeMap<String, String> {
    let exif = match exif::Reader::new().read_from_container(&mut Cursor::new(bytes)) {
        Ok(exif) => exif,
        Err(err) => {
            debug!(target = "auction.authenticity", error = %err, "exif_not_found");
            return BTreeMap::new();
        }
    };

    let mut tags = BTreeMap::new();
    // Primary IFD wins over the thumbnail IFD for repeated tags.
    let mut fields: Vec<_> = exif.fields().collect();
    fields.sort_by_key(|field| field.ifd_num.index());
    for field in fields {
        tags.entry(field.tag.to_string()).or_insert_with(|| {
            field
                .display_value()
                .with_unit(&exif)
                .to_string()
                .trim_matches('"')
                .to_string()
        });
    }
    tags
}
