use csv::Writer;
use entity_dedup_service::dto::{AnnotatedRecord, DataFile, FIELDS};
use entity_dedup_service::error::ServiceError;
use entity_dedup_service::util::{upload_object_to_s3, ID_COLUMN};
use rusoto_s3::S3Client;
use serde_json::{json, Value};

const RESULT_COLUMNS: [&str; 5] = [
    "cluster_id",
    "confidence",
    "matching_score_percent",
    "dedupe_category",
    "role",
];

/// Renders the annotated records as CSV, one row per record in the order
/// given.
pub fn write_result_csv(annotated: &[AnnotatedRecord]) -> Result<Vec<u8>, ServiceError> {
    let mut writer = Writer::from_writer(vec![]);
    let header: Vec<&str> = std::iter::once(ID_COLUMN)
        .chain(FIELDS.iter().copied())
        .chain(RESULT_COLUMNS.iter().copied())
        .collect();
    writer
        .write_record(&header)
        .map_err(ServiceError::internal_server_error)?;
    for row in annotated {
        let mut line: Vec<String> = Vec::with_capacity(header.len());
        line.push(row.record.id.clone());
        line.extend(
            FIELDS
                .iter()
                .map(|field| row.record.get(field).unwrap_or("").to_string()),
        );
        line.push(row.cluster_id.to_string());
        line.push(row.confidence.map(|c| c.to_string()).unwrap_or_default());
        line.push(
            row.matching_score_percent
                .map(|p| p.to_string())
                .unwrap_or_default(),
        );
        line.push(
            row.dedupe_category
                .map(|c| c.to_string())
                .unwrap_or_default(),
        );
        line.push(row.role.as_str().to_string());
        writer
            .write_record(&line)
            .map_err(ServiceError::internal_server_error)?;
    }
    writer
        .into_inner()
        .map_err(ServiceError::internal_server_error)
}

pub async fn push_result_file(
    client: &S3Client,
    data: &DataFile,
    annotated: &[AnnotatedRecord],
) -> Result<Value, ServiceError> {
    let object = write_result_csv(annotated)?;
    let output_bucket = data.bucket.replace("/input", "/output");
    let key = data.key.clone();
    upload_object_to_s3(client, object, output_bucket.clone(), key.clone()).await?;
    let clusters = annotated.last().map_or(0, |a| a.cluster_id + 1);
    Ok(json!({
        "bucket": output_bucket,
        "key": key,
        "records": annotated.len(),
        "clusters": clusters,
    }))
}
