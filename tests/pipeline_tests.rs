use std::path::Path;
use std::sync::Arc;

use tanjing_core::config::Config;
use tanjing_core::evidence::{EvidenceAttributes, EvidenceState, EvidenceType};
use tanjing_core::ingest::{ingest_batch, FileOutcome, Upload, UploadRequest};
use tanjing_core::store::{EvidenceStore, MemEvidenceStore, SledEvidenceStore};
use tanjing_core::task::{
    attach_evidence, BulkExtractorConfig, BulkExtractorTask, GrepConfig, GrepTask, TaskRunner,
    WorkerPool,
};

const FAKE_REPORT: &str = "<dfxml>\
<creator><program>BULK_EXTRACTOR</program><version>2.0.3</version></creator>\
<feature_files>\
<feature_file><name>email</name><count>2</count></feature_file>\
<feature_file><name>url</name><count>12</count></feature_file>\
</feature_files></dfxml>";

fn test_config(dir: &Path) -> Config {
    Config {
        output_dir: dir.join("uploads"),
        chunk_size: 1024,
        max_upload_size: 1024 * 1024,
        upload_concurrency: 4,
        ..Config::default()
    }
}

fn request<'a>(evidence_type: EvidenceType, files: Vec<(&str, &'a [u8])>) -> UploadRequest<&'a [u8]> {
    UploadRequest {
        ticket_id: "T-100".into(),
        calculate_hash: true,
        evidence_type,
        attributes: EvidenceAttributes::default(),
        files: files
            .into_iter()
            .map(|(name, data)| Upload::new(name, data))
            .collect(),
    }
}

/// 写一个假的 bulk_extractor：在 `-o` 目录里留下 report.xml 和一个特征文件
#[cfg(unix)]
fn fake_bulk_extractor(dir: &Path) -> String {
    use std::os::unix::fs::PermissionsExt;

    let script = dir.join("bulk_extractor");
    let body = format!(
        "#!/bin/sh\n\
         out=\"\"\n\
         while [ $# -gt 0 ]; do\n\
           if [ \"$1\" = \"-o\" ]; then out=\"$2\"; shift; fi\n\
           shift\n\
         done\n\
         mkdir -p \"$out\"\n\
         printf '%s' '{}' > \"$out/report.xml\"\n\
         echo 'root@example.com' > \"$out/email.txt\"\n",
        FAKE_REPORT
    );
    std::fs::write(&script, body).unwrap();
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
    script.display().to_string()
}

#[cfg(unix)]
#[tokio::test]
async fn upload_attach_and_extract() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let store = Arc::new(MemEvidenceStore::new());

    let outcomes = ingest_batch(
        store.as_ref(),
        &config,
        request(EvidenceType::RawDisk, vec![("disk.dd", &b"raw sectors and root@example.com"[..])]),
    )
    .await;
    let FileOutcome::Created { evidence_id, file, .. } = &outcomes[0] else {
        panic!("unexpected outcome {:?}", outcomes[0]);
    };
    assert!(file.path.starts_with(dir.path().join("uploads").join("T-100")));

    let evidence = attach_evidence(store.as_ref(), evidence_id).unwrap();
    assert_eq!(evidence.state, EvidenceState::Attached);

    let runner = TaskRunner::new(dir.path().join("tasks"))
        .with_chunk_size(config.chunk_size)
        .with_store(store.clone());
    let pool = WorkerPool::new(1, runner);
    let task = BulkExtractorTask::new(BulkExtractorConfig::default())
        .with_executable(fake_bulk_extractor(dir.path()));
    let attributes = EvidenceAttributes {
        project: Some("case-100".into()),
        ..Default::default()
    };

    let result = pool.submit_with(Arc::new(task), evidence, attributes).await;
    assert!(result.successful(), "status: {}", result.status());
    assert_eq!(result.status(), "14 artifacts have been extracted.");
    assert!(result.report_data().unwrap().contains("url | 12"));

    let output = &result.evidence()[0];
    assert_eq!(output.evidence_type, EvidenceType::BulkExtractorOutput);
    assert!(output.local_path.to_string_lossy().ends_with(".dd.tar.gz"));
    assert!(output.local_path.exists());
    assert_eq!(output.attributes.project.as_deref(), Some("case-100"));
    assert_eq!(output.attributes.source.as_deref(), Some(evidence_id.as_str()));

    let report_md = output.local_path.parent().unwrap().join("report.md");
    let report_text = std::fs::read_to_string(report_md).unwrap();
    assert!(report_text.contains("* Program: BULK_EXTRACTOR - 2.0.3"));

    let stored = store.get(output.id.as_ref().unwrap()).unwrap().unwrap();
    assert_eq!(stored.text_data.as_deref(), Some(report_text.as_str()));
    assert!(store.get_task(result.task_id()).unwrap().is_some());
}

#[tokio::test]
async fn identical_files_in_one_batch_are_stored_once() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let store = SledEvidenceStore::temporary().unwrap();

    let outcomes = ingest_batch(
        &store,
        &config,
        request(
            EvidenceType::RawDisk,
            vec![("a.dd", &b"same image"[..]), ("b.dd", &b"same image"[..]), ("c.dd", &b"other"[..])],
        ),
    )
    .await;

    // 前两个谁先写入不确定，但只能有一个成功
    let created: Vec<_> = outcomes[..2]
        .iter()
        .filter_map(|o| match o {
            FileOutcome::Created { evidence_id, .. } => Some(evidence_id.clone()),
            _ => None,
        })
        .collect();
    let duplicates: Vec<_> = outcomes[..2]
        .iter()
        .filter_map(|o| match o {
            FileOutcome::Duplicate { existing_id, .. } => Some(existing_id.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(created.len(), 1);
    assert_eq!(duplicates, created);
    assert!(matches!(outcomes[2], FileOutcome::Created { .. }));
    assert_eq!(outcomes[2].file_name(), "c.dd");

    let summary = store.summary().unwrap();
    assert_eq!(summary["RawDisk"].len(), 2);
}

#[tokio::test]
async fn grep_filters_uploaded_log() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let store = Arc::new(MemEvidenceStore::new());

    let log = b"session opened\nFailed password for admin\nsession closed\n";
    let outcomes = ingest_batch(
        store.as_ref(),
        &config,
        request(EvidenceType::FilteredTextFile, vec![("auth.log", &log[..])]),
    )
    .await;
    let FileOutcome::Created { evidence_id, .. } = &outcomes[0] else {
        panic!("unexpected outcome {:?}", outcomes[0]);
    };
    let evidence = attach_evidence(store.as_ref(), evidence_id).unwrap();

    let pool = WorkerPool::new(1, TaskRunner::new(dir.path().join("tasks")).with_store(store.clone()));
    let task = GrepTask::new(GrepConfig {
        filter_patterns: vec!["Failed password".into()],
    });
    let result = pool.submit(Arc::new(task), evidence).await;

    assert!(result.successful(), "status: {}", result.status());
    let filtered = &result.evidence()[0];
    assert_eq!(std::fs::read_to_string(&filtered.local_path).unwrap(), "2:15:Failed password for admin\n");
    assert!(store.get(filtered.id.as_ref().unwrap()).unwrap().is_some());
}
