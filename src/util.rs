use crate::dto::{DataFile, Record};
use crate::error::ServiceError;
use crate::model::ScoringModel;
use crate::response::Status;
use csv::Reader;
use futures::stream::TryStreamExt;
use log::info;
use rusoto_core::Region;
use rusoto_s3::{GetObjectRequest, PutObjectRequest, S3Client, S3};
use std::env;
use std::str::FromStr;

/// Name of the identifier column in record CSV files.
pub const ID_COLUMN: &str = "id";

pub fn get_region() -> Result<Region, ServiceError> {
    match env::var("REGION") {
        Ok(val) => Region::from_str(val.as_str()).map_err(|_| ServiceError {
            kind: String::from("ConfigurationError"),
            msg: format!("Unable to parse region {}", val),
            status: Status::InternalServerError,
        }),
        _ => Err(ServiceError::internal_server_error(
            "Environment variable 'REGION' not found",
        )),
    }
}

pub fn get_env_var(name: &str) -> Result<String, ServiceError> {
    env::var(name).map_err(|_| {
        ServiceError::internal_server_error(&format!("Environment variable '{}' not found", name))
    })
}

/// Worker count from `WORKERS`, falling back to the available parallelism.
pub fn get_workers(requested: Option<usize>) -> usize {
    requested
        .or_else(|| env::var("WORKERS").ok().and_then(|v| v.parse().ok()))
        .or_else(|| std::thread::available_parallelism().ok().map(|n| n.get()))
        .unwrap_or(1)
}

pub async fn download_object_from_s3(
    client: &S3Client,
    bucket: String,
    key: String,
) -> Result<Vec<u8>, ServiceError> {
    let request = GetObjectRequest {
        bucket,
        key,
        ..Default::default()
    };
    let mut object = client
        .get_object(request)
        .await
        .map_err(ServiceError::internal_server_error)?;
    let body = object
        .body
        .take()
        .ok_or(ServiceError::internal_server_error(
            "Unable to extract body",
        ))?;
    body.map_ok(|b| b.to_vec())
        .try_concat()
        .await
        .map_err(ServiceError::internal_server_error)
}

pub async fn upload_object_to_s3(
    client: &S3Client,
    object: Vec<u8>,
    bucket: String,
    key: String,
) -> Result<(), ServiceError> {
    let request = PutObjectRequest {
        bucket,
        key,
        body: Some(object.into()),
        ..Default::default()
    };
    client
        .put_object(request)
        .await
        .map(|_| ())
        .map_err(ServiceError::internal_server_error)
}

/// Fetches and validates the scoring model artifact. Any failure here is a
/// model-unavailable condition.
pub async fn load_model(client: &S3Client, file: &DataFile) -> Result<ScoringModel, ServiceError> {
    let bytes = download_object_from_s3(client, file.bucket.clone(), file.key.clone())
        .await
        .map_err(|err| {
            log::error!("Model download failed for {}/{}: {}", file.bucket, file.key, err.msg);
            ServiceError::service_unavailable("Scoring model is not available")
        })?;
    let model = ScoringModel::from_json(&bytes)?;
    info!("Loaded scoring model {} from {}/{}", model.version, file.bucket, file.key);
    Ok(model)
}

pub async fn load_records(client: &S3Client, file: &DataFile) -> Result<Vec<Record>, ServiceError> {
    let bytes = download_object_from_s3(client, file.bucket.clone(), file.key.clone()).await?;
    let records = parse_records(bytes.as_slice())?;
    info!("Loaded {} records from {}/{}", records.len(), file.bucket, file.key);
    Ok(records)
}

/// Parses a record CSV: an `id` column plus one column per field. Empty
/// cells become absent values.
pub fn parse_records(bytes: &[u8]) -> Result<Vec<Record>, ServiceError> {
    let mut reader = Reader::from_reader(bytes);
    let headers = reader
        .headers()
        .map_err(ServiceError::internal_server_error)?
        .clone();
    let id_pos = headers
        .iter()
        .position(|h| h == ID_COLUMN)
        .ok_or_else(|| ServiceError::bad_request("file must contain column 'id'"))?;
    reader
        .records()
        .enumerate()
        .map(|(row, record)| {
            let record = record.map_err(ServiceError::internal_server_error)?;
            let id = record.get(id_pos).unwrap_or("").trim();
            if id.is_empty() {
                return Err(ServiceError::bad_request(format!(
                    "row {} has no '{}' value",
                    row + 1,
                    ID_COLUMN
                )));
            }
            let fields = headers
                .iter()
                .zip(record.iter())
                .filter(|(name, _)| *name != ID_COLUMN)
                .map(|(name, value)| {
                    let value = if value.is_empty() {
                        None
                    } else {
                        Some(value.to_string())
                    };
                    (name.to_string(), value)
                })
                .collect();
            Ok(Record {
                id: id.to_string(),
                fields,
            })
        })
        .collect()
}
