use crate::config::{env_parse, env_string};
use crate::imaging::{self, ImagingError};
use crate::models::{DocumentRecord, ImageRecord};
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use image::ImageFormat;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

const ACCEPTED_FORMATS: [ImageFormat; 3] = [ImageFormat::Jpeg, ImageFormat::Png, ImageFormat::WebP];
const MAX_EXTENSION_LEN: usize = 8;

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("at least one image file is required")]
    NoFiles,
    #[error("unsupported image format; use JPEG, PNG or WEBP")]
    UnsupportedFormat,
    #[error("image resolution too low: {width}x{height}, minimum is {min}x{min}")]
    TooSmall { width: u32, height: u32, min: u32 },
    #[error("image too blurry: sharpness {variance:.1} is below {threshold}")]
    TooBlurry { variance: f64, threshold: f64 },
    #[error(transparent)]
    Imaging(#[from] ImagingError),
    #[error("file storage failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("image processing task failed: {0}")]
    Task(String),
}

impl UploadError {
    /// Whether the problem lies with what the client sent.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            UploadError::NoFiles
                | UploadError::UnsupportedFormat
                | UploadError::TooSmall { .. }
                | UploadError::TooBlurry { .. }
                | UploadError::Imaging(ImagingError::Decode(_))
        )
    }
}

#[derive(Debug, Clone)]
pub struct UploadSettings {
    pub dir: PathBuf,
    pub inline_max_bytes: usize,
    pub min_dimension: u32,
    pub blur_threshold: f64,
    pub max_side: u32,
    pub jpeg_quality: u8,
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("uploads"),
            inline_max_bytes: 256 * 1024,
            min_dimension: 1000,
            blur_threshold: 100.0,
            max_side: 1600,
            jpeg_quality: 85,
        }
    }
}

impl UploadSettings {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            dir: env_string("UPLOAD_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.dir),
            inline_max_bytes: env_parse("IMAGE_INLINE_MAX_BYTES")
                .unwrap_or(defaults.inline_max_bytes),
            min_dimension: env_parse("UPLOAD_MIN_DIMENSION").unwrap_or(defaults.min_dimension),
            blur_threshold: env_parse("UPLOAD_BLUR_THRESHOLD").unwrap_or(defaults.blur_threshold),
            ..defaults
        }
    }

    pub fn with_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Self::default()
        }
    }
}

/// One `file` or `documents` part of an upload request.
#[derive(Debug, Clone)]
pub struct IncomingFile {
    pub original_name: String,
    pub bytes: Vec<u8>,
}

/// A validated image ready to be written: hash of the original bytes plus
/// the recompressed JPEG.
#[derive(Debug)]
pub struct ProcessedImage {
    pub original_name: String,
    pub sha256: String,
    pub jpeg: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// Format, resolution and sharpness checks.
pub fn validate(bytes: &[u8], settings: &UploadSettings) -> Result<image::DynamicImage, UploadError> {
    let format = imaging::sniff_format(bytes).ok_or(UploadError::UnsupportedFormat)?;
    if !ACCEPTED_FORMATS.contains(&format) {
        return Err(UploadError::UnsupportedFormat);
    }
    let img = imaging::decode(bytes)?;
    let (width, height) = (img.width(), img.height());
    if width < settings.min_dimension || height < settings.min_dimension {
        return Err(UploadError::TooSmall {
            width,
            height,
            min: settings.min_dimension,
        });
    }
    let variance = imaging::laplacian_variance(&img.to_luma8());
    if variance < settings.blur_threshold {
        return Err(UploadError::TooBlurry {
            variance,
            threshold: settings.blur_threshold,
        });
    }
    Ok(img)
}

pub fn process(file: &IncomingFile, settings: &UploadSettings) -> Result<ProcessedImage, UploadError> {
    let img = validate(&file.bytes, settings)?;
    let sha256 = hex::encode(Sha256::digest(&file.bytes));
    let resized = imaging::fit_within(img, settings.max_side);
    let jpeg = imaging::encode_jpeg(&resized, settings.jpeg_quality)?;
    Ok(ProcessedImage {
        original_name: file.original_name.clone(),
        sha256,
        jpeg,
        width: resized.width(),
        height: resized.height(),
    })
}

/// Validates and compresses every file, then writes them as
/// `{listing_id}_{index}.jpg`. Nothing is written unless all files pass.
pub async fn store_images(
    settings: &UploadSettings,
    listing_id: &str,
    files: Vec<IncomingFile>,
) -> Result<Vec<ImageRecord>, UploadError> {
    if files.is_empty() {
        return Err(UploadError::NoFiles);
    }

    let worker_settings = settings.clone();
    let processed = tokio::task::spawn_blocking(move || {
        files
            .iter()
            .map(|file| process(file, &worker_settings))
            .collect::<Result<Vec<_>, _>>()
    })
    .await
    .map_err(|err| UploadError::Task(err.to_string()))??;

    tokio::fs::create_dir_all(&settings.dir).await?;
    let mut records = Vec::with_capacity(processed.len());
    for (index, image) in processed.into_iter().enumerate() {
        let filename = format!("{listing_id}_{index}.jpg");
        let path = settings.dir.join(&filename);
        if let Err(err) = tokio::fs::write(&path, &image.jpeg).await {
            remove_files(&records).await;
            return Err(err.into());
        }
        let inline_data =
            (image.jpeg.len() <= settings.inline_max_bytes).then(|| BASE64.encode(&image.jpeg));
        records.push(ImageRecord {
            filename,
            original_name: image.original_name,
            local_path: path.to_string_lossy().into_owned(),
            mime_type: "image/jpeg".into(),
            sha256: image.sha256,
            size_bytes: image.jpeg.len() as u64,
            width: image.width,
            height: image.height,
            inline_data,
            external_ref: None,
        });
    }

    info!(
        target = "auction.upload",
        listing_id,
        count = records.len(),
        "images stored"
    );
    Ok(records)
}

/// Writes supporting documents unchanged as `{listing_id}_doc_{index}.{ext}`.
/// A failed write removes the documents already written.
pub async fn store_documents(
    settings: &UploadSettings,
    listing_id: &str,
    files: Vec<IncomingFile>,
) -> Result<Vec<DocumentRecord>, UploadError> {
    if files.is_empty() {
        return Ok(Vec::new());
    }
    tokio::fs::create_dir_all(&settings.dir).await?;
    let mut records = Vec::with_capacity(files.len());
    for (index, file) in files.into_iter().enumerate() {
        let filename = format!(
            "{listing_id}_doc_{index}.{}",
            document_extension(&file.original_name)
        );
        let path = settings.dir.join(&filename);
        if let Err(err) = tokio::fs::write(&path, &file.bytes).await {
            remove_documents(&records).await;
            return Err(err.into());
        }
        records.push(DocumentRecord {
            filename,
            original_name: file.original_name,
            local_path: path.to_string_lossy().into_owned(),
            sha256: hex::encode(Sha256::digest(&file.bytes)),
            size_bytes: file.bytes.len() as u64,
        });
    }

    info!(
        target = "auction.upload",
        listing_id,
        count = records.len(),
        "documents stored"
    );
    Ok(records)
}

/// Lowercase alphanumeric extension of the client's file name, `bin` when
/// there is none worth keeping.
fn document_extension(original_name: &str) -> String {
    Path::new(original_name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .filter(|ext| {
            !ext.is_empty()
                && ext.len() <= MAX_EXTENSION_LEN
                && ext.chars().all(|c| c.is_ascii_alphanumeric())
        })
        .unwrap_or_else(|| "bin".to_string())
}

/// Best-effort removal of already written images.
pub async fn remove_files(records: &[ImageRecord]) {
    for record in records {
        remove_path(&record.local_path).await;
    }
}

pub async fn remove_documents(records: &[DocumentRecord]) {
    for record in records {
        remove_path(&record.local_path).await;
    }
}

async fn remove_path(path: &str) {
    if let Err(err) = tokio::fs::remove_file(Path::new(path)).await {
        warn!(
            target = "auction.upload",
            path,
            error = %err,
            "failed to remove uploaded file"
        );
    }
}

/// Image bytes for analysis: the inline payload when present, the file on
/// disk otherwise.
pub async fn load_image(record: &ImageRecord) -> Result<Vec<u8>, UploadError> {
    if let Some(inline) = &record.inline_data
        && let Ok(bytes) = BASE64.decode(inline)
    {
        return Ok(bytes);
    }
    Ok(tokio::fs::read(&record.local_path).await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imaging::tests::{detailed_rgb, encode};
    use image::{Rgb, RgbImage};

    fn file(bytes: Vec<u8>) -> IncomingFile {
        IncomingFile {
            original_name: "item.png".into(),
            bytes,
        }
    }

    fn sharp_png() -> Vec<u8> {
        encode(&detailed_rgb(1000, 1000, 3), ImageFormat::Png)
    }

    #[test]
    fn rejects_small_images() {
        let small = encode(&detailed_rgb(500, 1200, 0), ImageFormat::Png);
        let err = validate(&small, &UploadSettings::default()).expect_err("too small");
        assert!(matches!(err, UploadError::TooSmall { width: 500, .. }));
        assert!(err.is_rejection());
    }

    #[test]
    fn rejects_blurry_images() {
        let flat = encode(
            &RgbImage::from_pixel(1000, 1000, Rgb([120, 120, 120])),
            ImageFormat::Png,
        );
        let err = validate(&flat, &UploadSettings::default()).expect_err("blurry");
        assert!(matches!(err, UploadError::TooBlurry { .. }));
    }

    #[test]
    fn rejects_other_formats() {
        let bmp = encode(&detailed_rgb(1000, 1000, 0), ImageFormat::Bmp);
        let err = validate(&bmp, &UploadSettings::default()).expect_err("bmp");
        assert!(matches!(err, UploadError::UnsupportedFormat));
        assert!(matches!(
            validate(b"plain text", &UploadSettings::default()),
            Err(UploadError::UnsupportedFormat)
        ));
    }

    #[test]
    fn process_hashes_original_and_recompresses() {
        let bytes = sharp_png();
        let processed = process(&file(bytes.clone()), &UploadSettings::default()).expect("process");
        assert_eq!(processed.sha256, hex::encode(Sha256::digest(&bytes)));
        assert_eq!(imaging::sniff_format(&processed.jpeg), Some(ImageFormat::Jpeg));
        assert_eq!((processed.width, processed.height), (1000, 1000));
    }

    #[tokio::test]
    async fn stores_files_and_inlines_small_payloads() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut settings = UploadSettings::with_dir(dir.path());
        settings.inline_max_bytes = usize::MAX;

        let records = store_images(&settings, "lst", vec![file(sharp_png()), file(sharp_png())])
            .await
            .expect("store");
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].filename, "lst_1.jpg");
        assert!(dir.path().join("lst_0.jpg").exists());
        assert!(records[0].inline_data.is_some());

        let loaded = load_image(&records[0]).await.expect("load");
        assert_eq!(loaded.len() as u64, records[0].size_bytes);

        remove_files(&records).await;
        assert!(!dir.path().join("lst_0.jpg").exists());
    }

    #[tokio::test]
    async fn documents_are_stored_verbatim() {
        let dir = tempfile::tempdir().expect("tempdir");
        let settings = UploadSettings::with_dir(dir.path());
        let documents = vec![
            IncomingFile {
                original_name: "Certificate.PDF".into(),
                bytes: b"%PDF-1.4 provenance".to_vec(),
            },
            IncomingFile {
                original_name: "../../etc/passwd".into(),
                bytes: b"receipt".to_vec(),
            },
        ];

        let records = store_documents(&settings, "lst", documents)
            .await
            .expect("store");
        assert_eq!(records[0].filename, "lst_doc_0.pdf");
        assert_eq!(records[1].filename, "lst_doc_1.bin");
        assert_eq!(records[1].original_name, "../../etc/passwd");
        assert_eq!(
            std::fs::read(dir.path().join("lst_doc_0.pdf")).expect("read"),
            b"%PDF-1.4 provenance"
        );
        assert_eq!(records[1].sha256, hex::encode(Sha256::digest(b"receipt")));

        remove_documents(&records).await;
        assert!(!dir.path().join("lst_doc_1.bin").exists());
        assert!(
            store_documents(&settings, "lst", Vec::new())
                .await
                .expect("none")
                .is_empty()
        );
    }

    #[tokio::test]
    async fn one_bad_file_writes_nothing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut settings = UploadSettings::with_dir(dir.path());
        settings.inline_max_bytes = 0;
        let small = encode(&detailed_rgb(200, 200, 0), ImageFormat::Png);

        let err = store_images(&settings, "lst", vec![file(sharp_png()), file(small)])
            .await
            .expect_err("rejected");
        assert!(err.is_rejection());
        assert!(!dir.path().join("lst_0.jpg").exists());
        assert!(matches!(
            store_images(&settings, "lst", Vec::new()).await,
            Err(UploadError::NoFiles)
        ));
    }
}
