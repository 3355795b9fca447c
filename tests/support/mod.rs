//! Shared fixtures for pipeline integration tests: archive/image/DICOM
//! builders and a harness wiring a mock-served pipeline to an in-memory
//! catalog.

#![allow(dead_code)]

use std::io::{Cursor, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use datascan_core::analyze::UniformClassifier;
use datascan_core::store::{Catalog, DatasetRecord, NewDataset, ensure_catalog_indexes};
use datascan_core::{
    Database, DatasetPipeline, PipelineContext, Settings, build_default_provider_registry,
};
use dicom_core::{DataElement, PrimitiveValue, VR, dicom_value};
use dicom_dictionary_std::tags;
use dicom_object::{FileMetaTableBuilder, InMemDicomObject};
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Explicit VR little endian.
const TRANSFER_SYNTAX: &str = "1.2.840.10008.1.2.1";

/// Secondary capture SOP class.
const SOP_CLASS: &str = "1.2.840.10008.5.1.4.1.1.7";

/// Encodes a grayscale PNG of the given size.
pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let img = image::DynamicImage::ImageLuma8(image::GrayImage::from_pixel(
        width,
        height,
        image::Luma([90]),
    ));
    let mut cursor = Cursor::new(Vec::new());
    img.write_to(&mut cursor, image::ImageFormat::Png).unwrap();
    cursor.into_inner()
}

/// Builds a zip archive in memory from (member name, contents) pairs.
pub fn zip_bytes(members: &[(&str, Vec<u8>)]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options =
        zip::write::SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored);
    for (name, contents) in members {
        writer.start_file(*name, options).unwrap();
        writer.write_all(contents).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

/// Encodes a minimal DICOM instance with the given modality and series UID.
pub fn dicom_bytes(modality: &str, series_uid: &str, instance: u32) -> Vec<u8> {
    let sop_instance_uid = format!("{series_uid}.{instance}");

    let mut obj = InMemDicomObject::new_empty();
    obj.put(DataElement::new(
        tags::SOP_CLASS_UID,
        VR::UI,
        PrimitiveValue::from(SOP_CLASS),
    ));
    obj.put(DataElement::new(
        tags::SOP_INSTANCE_UID,
        VR::UI,
        PrimitiveValue::from(sop_instance_uid.as_str()),
    ));
    obj.put(DataElement::new(
        tags::MODALITY,
        VR::CS,
        PrimitiveValue::from(modality),
    ));
    obj.put(DataElement::new(
        tags::SERIES_INSTANCE_UID,
        VR::UI,
        PrimitiveValue::from(series_uid),
    ));
    obj.put(DataElement::new(
        tags::STUDY_INSTANCE_UID,
        VR::UI,
        PrimitiveValue::from("1.2.0.1"),
    ));
    obj.put(DataElement::new(tags::ROWS, VR::US, dicom_value!(U16, 16)));
    obj.put(DataElement::new(tags::COLUMNS, VR::US, dicom_value!(U16, 16)));

    let file_obj = obj
        .with_meta(
            FileMetaTableBuilder::new()
                .transfer_syntax(TRANSFER_SYNTAX)
                .media_storage_sop_class_uid(SOP_CLASS)
                .media_storage_sop_instance_uid(sop_instance_uid),
        )
        .unwrap();

    let mut cursor = Cursor::new(Vec::new());
    file_obj.write_all(&mut cursor).unwrap();
    cursor.into_inner()
}

/// Writes a little-endian NIfTI-1 header with the given shape.
pub fn nifti_bytes(dims: &[i16]) -> Vec<u8> {
    let mut header = vec![0u8; 348];
    header[0..4].copy_from_slice(&348i32.to_le_bytes());
    header[40..42].copy_from_slice(&(dims.len() as i16).to_le_bytes());
    for (i, dim) in dims.iter().enumerate() {
        let offset = 42 + 2 * i;
        header[offset..offset + 2].copy_from_slice(&dim.to_le_bytes());
    }
    header
}

/// A pipeline wired to a throwaway workspace and in-memory catalog.
pub struct Harness {
    pub temp: TempDir,
    pub settings: Arc<Settings>,
    pub catalog: Catalog,
    pub pipeline: DatasetPipeline,
    pub server: MockServer,
}

impl Harness {
    /// Builds the harness with default test settings (fast flush timeout).
    pub async fn new() -> Self {
        Self::with_settings(|_| {}).await
    }

    /// Builds the harness, letting the test tweak settings first.
    pub async fn with_settings(configure: impl FnOnce(&mut Settings)) -> Self {
        let temp = TempDir::new().unwrap();
        let mut settings = Settings::with_data_root(temp.path());
        settings.pipeline_batch_flush = Duration::from_millis(100);
        settings.pipeline_file_concurrency = 4;
        configure(&mut settings);
        let settings = Arc::new(settings);

        let db = Database::in_memory().await.unwrap();
        ensure_catalog_indexes(&db).await;
        let catalog = Catalog::new(db);

        let pipeline = DatasetPipeline::new(PipelineContext {
            settings: Arc::clone(&settings),
            catalog: catalog.clone(),
            providers: Arc::new(build_default_provider_registry(&settings)),
            classifier: Arc::new(UniformClassifier),
            prediction_log: None,
        });

        let server = MockServer::start().await;
        Self {
            temp,
            settings,
            catalog,
            pipeline,
            server,
        }
    }

    /// Serves `body` at `route` on the mock server and returns the full URL.
    pub async fn serve(&self, route: &str, body: Vec<u8>) -> String {
        Mock::given(method("GET"))
            .and(path(route))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body))
            .mount(&self.server)
            .await;
        format!("{}{route}", self.server.uri())
    }

    /// Creates the dataset row, enqueues the job, and runs it to a terminal
    /// status.
    pub async fn ingest(&self, dataset_id: &str, url: &str) -> DatasetRecord {
        self.catalog
            .insert_dataset(&NewDataset::new(dataset_id, dataset_id, url))
            .await
            .unwrap();
        self.run_existing(dataset_id, url).await
    }

    /// Enqueues a job for an already-created dataset row and waits for it.
    pub async fn run_existing(&self, dataset_id: &str, url: &str) -> DatasetRecord {
        self.pipeline.enqueue(dataset_id, url).unwrap();
        self.pipeline.start().await;
        self.wait_terminal(dataset_id).await
    }

    /// Polls until the dataset reaches `ready` or `failed`.
    pub async fn wait_terminal(&self, dataset_id: &str) -> DatasetRecord {
        for _ in 0..600 {
            let record = self
                .catalog
                .get_dataset(dataset_id)
                .await
                .unwrap()
                .unwrap_or_else(|| panic!("dataset {dataset_id} missing"));
            if record.status.is_terminal() {
                return record;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("dataset {dataset_id} never reached a terminal status");
    }

    /// Workspace directory for a dataset.
    pub fn dataset_dir(&self, dataset_id: &str) -> std::path::PathBuf {
        self.settings.data_root.join(dataset_id)
    }
}

/// Recursively lists file paths under a directory (for escape checks).
pub fn list_files_under(root: &Path) -> Vec<std::path::PathBuf> {
    walk(root)
}

fn walk(dir: &Path) -> Vec<std::path::PathBuf> {
    let mut found = Vec::new();
    let Ok(entries) = std::fs::read_dir(dir) else {
        return found;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            found.extend(walk(&path));
        } else {
            found.push(path);
        }
    }
    found
}
