//! End-to-end pipeline scenarios against a mock HTTP server: archive
//! ingestion, DICOM series aggregation, traversal defence, byte caps,
//! duplicate detection, and restart idempotence.

mod support;

use datascan_core::store::{DatasetStatus, FileKind, Stage};
use support::{Harness, dicom_bytes, list_files_under, nifti_bytes, png_bytes, zip_bytes};

#[tokio::test]
async fn test_single_image_zip_reaches_ready() {
    let harness = Harness::new().await;
    let archive = zip_bytes(&[("a.png", png_bytes(128, 128))]);
    let url = harness.serve("/tiny.zip", archive).await;

    let record = harness.ingest("ds-tiny", &url).await;

    assert_eq!(record.status, DatasetStatus::Ready);
    assert_eq!(record.stage, Stage::Finalize);
    assert_eq!(record.provider.as_deref(), Some("http"));
    assert_eq!(record.resolved_url.as_deref(), Some(url.as_str()));

    let summary = record.summary.unwrap();
    assert_eq!(summary.total_files, 1);
    assert_eq!(summary.scheduled_files, 1);
    assert_eq!(summary.kind_counts["image"], 1);
    assert_eq!(summary.image_2d_count, 1);
    assert_eq!(summary.volume_3d_count, 0);
    assert_eq!(summary.ext_counts[".png"], 1);
    assert_eq!(summary.scheduled_ext_counts[".png"], 1);
    assert_eq!(summary.duplicate_basename_count, 0);
    assert_eq!(summary.outliers, 0);

    let files = harness.catalog.list_files("ds-tiny").await.unwrap();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].relpath, "a.png");
    assert_eq!(files[0].kind, FileKind::Image);
    assert_eq!(files[0].dims, Some(vec![128, 128]));
}

#[tokio::test]
async fn test_dicom_series_counts_as_volume() {
    let harness = Harness::new().await;
    let archive = zip_bytes(&[
        ("series/s1.dcm", dicom_bytes("CT", "1.2.3", 1)),
        ("series/s2.dcm", dicom_bytes("CT", "1.2.3", 2)),
        ("series/s3.dcm", dicom_bytes("CT", "1.2.3", 3)),
    ]);
    let url = harness.serve("/series.zip", archive).await;

    let record = harness.ingest("ds-dicom", &url).await;
    assert_eq!(record.status, DatasetStatus::Ready);

    let summary = record.summary.unwrap();
    assert_eq!(summary.total_files, 3);
    assert_eq!(summary.kind_counts["dicom"], 3);
    assert_eq!(summary.image_2d_count, 3);
    // Three instances sharing one SeriesInstanceUID form one 3D volume.
    assert_eq!(summary.volume_3d_count, 1);
    assert_eq!(summary.modality_counts["CT"], 3);
    assert!(!summary.mixed_modality);

    let files = harness.catalog.list_files("ds-dicom").await.unwrap();
    assert_eq!(files.len(), 3);
    for file in &files {
        assert_eq!(file.kind, FileKind::Dicom);
        assert_eq!(file.modality, "CT");
        assert_eq!(file.meta.series_instance_uid(), Some("1.2.3"));
        assert_eq!(file.dims, Some(vec![16, 16]));
    }
}

#[tokio::test]
async fn test_zip_slip_member_is_skipped_not_fatal() {
    let harness = Harness::new().await;
    let archive = zip_bytes(&[
        ("ok.png", png_bytes(32, 32)),
        ("../evil.sh", b"#!/bin/sh\n".to_vec()),
    ]);
    let url = harness.serve("/evil.zip", archive).await;

    let record = harness.ingest("ds-slip", &url).await;
    assert_eq!(record.status, DatasetStatus::Ready);
    assert_eq!(record.summary.unwrap().total_files, 1);

    // Nothing may land outside extracted/.
    let dataset_dir = harness.dataset_dir("ds-slip");
    let extracted = dataset_dir.join("extracted");
    for path in list_files_under(&harness.settings.data_root) {
        let inside_extracted = path.starts_with(&extracted);
        let is_download = path == dataset_dir.join("download.bin");
        assert!(
            inside_extracted || is_download,
            "unexpected file outside extracted/: {}",
            path.display()
        );
    }
    assert!(extracted.join("ok.png").exists());
}

#[tokio::test]
async fn test_oversize_download_fails_dataset() {
    let harness = Harness::with_settings(|settings| {
        settings.max_download_bytes = 1000;
    })
    .await;
    let url = harness.serve("/big.zip", vec![0u8; 2000]).await;

    let record = harness.ingest("ds-big", &url).await;

    assert_eq!(record.status, DatasetStatus::Failed);
    assert_eq!(record.stage, Stage::Failed);
    assert!(record.last_error.unwrap().contains("Download too large"));
    assert!(record.summary.is_none());
    assert_eq!(harness.catalog.count_files("ds-big").await.unwrap(), 0);
}

#[tokio::test]
async fn test_download_exactly_at_cap_succeeds() {
    let harness = Harness::with_settings(|settings| {
        settings.max_download_bytes = 2000;
    })
    .await;
    // Not a zip: ingested as a single opaque file.
    let url = harness.serve("/exact.bin", vec![7u8; 2000]).await;

    let record = harness.ingest("ds-exact", &url).await;
    assert_eq!(record.status, DatasetStatus::Ready);
    let summary = record.summary.unwrap();
    assert_eq!(summary.total_files, 1);
    assert_eq!(summary.kind_counts["unknown"], 1);
}

#[tokio::test]
async fn test_duplicate_basenames_across_subdirectories() {
    let harness = Harness::new().await;
    let archive = zip_bytes(&[
        ("train/x.png", png_bytes(32, 32)),
        ("val/x.png", png_bytes(32, 32)),
    ]);
    let url = harness.serve("/dup.zip", archive).await;

    let record = harness.ingest("ds-dup", &url).await;
    assert_eq!(record.status, DatasetStatus::Ready);

    let summary = record.summary.unwrap();
    assert_eq!(summary.total_files, 2);
    assert_eq!(summary.duplicate_basename_count, 1);
    assert_eq!(summary.duplicate_basename_ext_counts[".png"], 1);
}

#[tokio::test]
async fn test_file_cap_truncates_but_dataset_still_ready() {
    let harness = Harness::with_settings(|settings| {
        settings.max_files_per_dataset = 2;
    })
    .await;
    let archive = zip_bytes(&[
        ("a.png", png_bytes(16, 16)),
        ("b.png", png_bytes(16, 16)),
        ("c.png", png_bytes(16, 16)),
        ("d.png", png_bytes(16, 16)),
    ]);
    let url = harness.serve("/many.zip", archive).await;

    let record = harness.ingest("ds-cap", &url).await;
    assert_eq!(record.status, DatasetStatus::Ready);

    let summary = record.summary.unwrap();
    assert_eq!(summary.total_files, 2);
    assert_eq!(summary.scheduled_files, 2);
    assert_eq!(harness.catalog.count_files("ds-cap").await.unwrap(), 2);
}

#[tokio::test]
async fn test_mixed_archive_counts_every_kind() {
    let harness = Harness::new().await;
    let archive = zip_bytes(&[
        ("img/photo.png", png_bytes(64, 32)),
        ("vols/brain.nii", nifti_bytes(&[32, 32, 20])),
        ("dicom/slice.dcm", dicom_bytes("MR", "9.9.9", 1)),
        ("README", b"docs".to_vec()),
    ]);
    let url = harness.serve("/mixed.zip", archive).await;

    let record = harness.ingest("ds-mixed", &url).await;
    assert_eq!(record.status, DatasetStatus::Ready);

    let summary = record.summary.unwrap();
    assert_eq!(summary.total_files, 4);
    assert_eq!(summary.kind_counts["image"], 1);
    assert_eq!(summary.kind_counts["nifti"], 1);
    assert_eq!(summary.kind_counts["dicom"], 1);
    assert_eq!(summary.kind_counts["unknown"], 1);
    // The 3D NIfTI volume counts directly; the single-instance series does not.
    assert_eq!(summary.volume_3d_count, 1);
    assert_eq!(summary.image_2d_count, 2);
    assert_eq!(summary.ext_counts["none"], 1);

    // Counter identities hold.
    let modality_total: u64 = summary.modality_counts.values().sum();
    let kind_total: u64 = summary.kind_counts.values().sum();
    assert_eq!(modality_total, summary.total_files);
    assert_eq!(kind_total, summary.total_files);
    assert!(summary.scheduled_files >= summary.total_files);

    // Modality percentages cover 100%.
    let percent_total: f64 = summary.modalities.values().map(|m| m.percent).sum();
    assert!((percent_total - 100.0).abs() < 1e-6);
}

#[tokio::test]
async fn test_single_file_url_is_staged_under_safe_name() {
    let harness = Harness::new().await;
    let url = harness.serve("/volume.nii", nifti_bytes(&[8, 8, 8])).await;

    let record = harness.ingest("ds-one", &url).await;
    assert_eq!(record.status, DatasetStatus::Ready);

    let summary = record.summary.unwrap();
    assert_eq!(summary.total_files, 1);
    assert_eq!(summary.kind_counts["nifti"], 1);
    assert_eq!(summary.volume_3d_count, 1);

    let files = harness.catalog.list_files("ds-one").await.unwrap();
    assert_eq!(files[0].relpath, "volume.nii");
}

#[tokio::test]
async fn test_rerun_converges_to_identical_catalog() {
    let harness = Harness::new().await;
    let archive = zip_bytes(&[
        ("a.png", png_bytes(32, 32)),
        ("b/scan.dcm", dicom_bytes("US", "5.5.5", 1)),
    ]);
    let url = harness.serve("/rerun.zip", archive).await;

    let first = harness.ingest("ds-rerun", &url).await;
    let first_summary = first.summary.unwrap();
    let first_files = harness.catalog.list_files("ds-rerun").await.unwrap();
    let first_run_ts = first_files.iter().map(|f| f.created_at).max().unwrap();

    // Second run over the same dataset id and URL. The dataset is already
    // terminal, so completion is detected by the rows being rewritten with
    // the second run's analysis timestamp.
    harness.pipeline.enqueue("ds-rerun", &url).unwrap();
    let mut second_files = Vec::new();
    for _ in 0..600 {
        let record = harness.catalog.get_dataset("ds-rerun").await.unwrap().unwrap();
        let files = harness.catalog.list_files("ds-rerun").await.unwrap();
        if record.status == DatasetStatus::Ready
            && !files.is_empty()
            && files.iter().all(|f| f.created_at > first_run_ts)
        {
            second_files = files;
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
    assert!(!second_files.is_empty(), "second run never completed");
    let second = harness.catalog.get_dataset("ds-rerun").await.unwrap().unwrap();
    let second_summary = second.summary.unwrap();

    assert_eq!(first_summary, second_summary);
    assert_eq!(first_files.len(), second_files.len());
    for (a, b) in first_files.iter().zip(second_files.iter()) {
        // Byte-identical modulo created_at.
        assert_eq!(a.relpath, b.relpath);
        assert_eq!(a.kind, b.kind);
        assert_eq!(a.modality, b.modality);
        assert_eq!(a.dims, b.dims);
        assert_eq!(a.size_bytes, b.size_bytes);
        assert_eq!(a.meta, b.meta);
    }
}

#[tokio::test]
async fn test_restart_after_partial_analyze_recovers_cleanly() {
    let harness = Harness::new().await;
    let archive = zip_bytes(&[
        ("a.png", png_bytes(32, 32)),
        ("b.png", png_bytes(32, 32)),
        ("c.png", png_bytes(32, 32)),
    ]);
    let url = harness.serve("/restart.zip", archive).await;

    // Simulate a crashed run: the dataset row is stuck in processing and a
    // partial (stale) file catalog is left behind.
    harness
        .catalog
        .insert_dataset(&datascan_core::store::NewDataset::new(
            "ds-restart",
            "ds-restart",
            &url,
        ))
        .await
        .unwrap();
    let stale = datascan_core::store::FileRecord {
        dataset_id: "ds-restart".to_string(),
        relpath: "ghost.png".to_string(),
        abspath: "/gone/ghost.png".to_string(),
        kind: FileKind::Image,
        modality: "unknown".to_string(),
        modality_model: datascan_core::store::ModalityModel::fallback("unknown"),
        ndim: Some(2),
        dims: None,
        size_bytes: 1,
        created_at: chrono::Utc::now(),
        meta: datascan_core::store::FileMeta::Image,
    };
    harness.catalog.bulk_upsert_files(&[stale]).await;
    assert_eq!(harness.catalog.count_files("ds-restart").await.unwrap(), 1);

    // Startup recovery re-enqueues the stuck dataset and replays analyze.
    let recovered = datascan_core::pipeline::requeue_processing_datasets(&harness.pipeline)
        .await
        .unwrap();
    assert_eq!(recovered, 1);
    harness.pipeline.start().await;
    let record = harness.wait_terminal("ds-restart").await;

    assert_eq!(record.status, DatasetStatus::Ready);
    let summary = record.summary.unwrap();
    assert_eq!(summary.total_files, 3);
    assert_eq!(harness.catalog.count_files("ds-restart").await.unwrap(), 3);

    // The stale row from the interrupted run is gone.
    let files = harness.catalog.list_files("ds-restart").await.unwrap();
    assert!(files.iter().all(|f| f.relpath != "ghost.png"));
}

#[tokio::test]
async fn test_corrupt_member_produces_descriptor_not_failure() {
    let harness = Harness::new().await;
    let archive = zip_bytes(&[
        ("fine.png", png_bytes(16, 16)),
        ("broken.png", b"definitely not a png".to_vec()),
    ]);
    let url = harness.serve("/corrupt.zip", archive).await;

    let record = harness.ingest("ds-corrupt", &url).await;
    assert_eq!(record.status, DatasetStatus::Ready);

    let summary = record.summary.unwrap();
    assert_eq!(summary.total_files, 2);
    // Undecodable images are still catalogued (as image-kind fallback).
    assert_eq!(summary.kind_counts["image"], 2);

    let files = harness.catalog.list_files("ds-corrupt").await.unwrap();
    let broken = files.iter().find(|f| f.relpath == "broken.png").unwrap();
    assert_eq!(broken.modality_model.method, "fallback");
    assert_eq!(broken.dims, None);
}

#[tokio::test]
async fn test_no_provider_match_fails_dataset_with_diagnostic() {
    let harness = Harness::new().await;
    let record = harness.ingest("ds-nope", "ftp://nowhere.invalid/data.zip").await;

    assert_eq!(record.status, DatasetStatus::Failed);
    assert!(record.last_error.unwrap().contains("no provider found"));
}
