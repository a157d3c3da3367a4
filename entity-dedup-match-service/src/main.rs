use entity_dedup_service::dto::{require_fields, DataFile, MatchRequest, Record, RequestMode};
use entity_dedup_service::engine::Engine;
use entity_dedup_service::error::{EngineError, ServiceError};
use entity_dedup_service::response::{make_response_payload, success_body};
use entity_dedup_service::util::{self, get_workers, load_model, load_records};

use lambda_runtime::{run, service_fn, Error, LambdaEvent};
use log::info;
use rusoto_core::Client;
use rusoto_s3::S3Client;
use serde_json::{json, Map, Value};
use std::time::Instant;

const QUERY_ID: &str = "__INPUT__";

/// Everything a request needs, created once at cold start.
struct State {
    engine: Engine,
    client: S3Client,
    model_file: DataFile,
    reference_file: DataFile,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    env_logger::init();
    let region = util::get_region()?;
    let client = S3Client::new_with_client(Client::shared(), region);
    let model_file = DataFile {
        bucket: util::get_env_var("MODEL_BUCKET")?,
        key: util::get_env_var("MODEL_KEY")?,
    };
    let reference_file = DataFile {
        bucket: util::get_env_var("REFERENCE_BUCKET")?,
        key: util::get_env_var("REFERENCE_KEY")?,
    };

    let start = Instant::now();
    let model = load_model(&client, &model_file).await?;
    let records = load_records(&client, &reference_file).await?;
    let engine = Engine::new(model, get_workers(None)).map_err(ServiceError::from)?;
    engine
        .index_reference(&records)
        .map_err(ServiceError::from)?;
    info!(
        "Match service ready in {:.4} secs",
        start.elapsed().as_secs_f64()
    );

    let state = State {
        engine,
        client,
        model_file,
        reference_file,
    };
    let state = &state;
    run(service_fn(move |event: LambdaEvent<MatchRequest>| async move {
        process(event, state).await
    }))
    .await?;
    Ok(())
}

async fn process(event: LambdaEvent<MatchRequest>, state: &State) -> Result<Value, Error> {
    let (request, _context) = event.into_parts();
    let result = handle(request, state).await;
    make_response_payload(result)
}

async fn handle(request: MatchRequest, state: &State) -> Result<Value, ServiceError> {
    let started = Instant::now();
    if !(0.0..=1.0).contains(&request.threshold) {
        return Err(ServiceError::bad_request(
            "Invalid threshold; must be a float between 0 and 1",
        ));
    }
    let fields = match request.mode {
        RequestMode::RecordMatch => record_match(&state.engine, &request)?,
        RequestMode::BlockingInfo => blocking_info(&state.engine, &request)?,
        RequestMode::Reload => reload(state).await?,
    };
    Ok(success_body(
        request.mode.as_str(),
        request.threshold,
        started,
        fields,
    ))
}

fn validation_error(err: EngineError, location: &str) -> ServiceError {
    match err {
        EngineError::Validation { missing } => ServiceError::bad_request(format!(
            "Missing required fields: {} in {}",
            missing.join(", "),
            location
        )),
        other => other.into(),
    }
}

fn match_one(
    engine: &Engine,
    object: &Map<String, Value>,
    request: &MatchRequest,
    location: &str,
) -> Result<Value, ServiceError> {
    let record = Record::from_json(QUERY_ID, object);
    require_fields(&record).map_err(|err| validation_error(err, location))?;
    let outcome = engine.find_matches(&record, request.threshold, request.limit)?;
    Ok(json!({
        "input_record": object,
        "duplicates_found": outcome.matching_count > 0,
        "possible_duplicates": outcome,
    }))
}

fn record_match(engine: &Engine, request: &MatchRequest) -> Result<Map<String, Value>, ServiceError> {
    let mut fields = Map::new();
    if let Some(object) = &request.record {
        if let Value::Object(result) = match_one(engine, object, request, "'record'")? {
            fields.extend(result);
        }
    } else if let Some(objects) = &request.records {
        let bulk_results = objects
            .iter()
            .enumerate()
            .map(|(idx, object)| match_one(engine, object, request, &format!("record #{}", idx + 1)))
            .collect::<Result<Vec<_>, _>>()?;
        fields.insert("bulk_results".into(), Value::Array(bulk_results));
        fields.insert("total_records_processed".into(), json!(objects.len()));
    } else {
        return Err(ServiceError::bad_request("Missing 'record' or 'records'"));
    }
    Ok(fields)
}

fn blocking_info(engine: &Engine, request: &MatchRequest) -> Result<Map<String, Value>, ServiceError> {
    let object = request
        .record
        .as_ref()
        .ok_or_else(|| ServiceError::bad_request("Missing 'record' in request"))?;
    let info = engine.blocking_info(&Record::from_json(QUERY_ID, object))?;
    let mut fields = Map::new();
    fields.insert("input".into(), json!(info.input));
    fields.insert("block_keys".into(), json!(info.block_keys));
    fields.insert("candidate_count".into(), json!(info.candidate_count));
    fields.insert("blocking_rules".into(), json!(engine.describe_rules()?));
    Ok(fields)
}

async fn reload(state: &State) -> Result<Map<String, Value>, ServiceError> {
    let model = load_model(&state.client, &state.model_file).await?;
    let version = model.version.clone();
    let records = load_records(&state.client, &state.reference_file).await?;
    state.engine.reload(model, &records)?;
    info!("Reloaded model {} with {} reference records", version, records.len());
    let mut fields = Map::new();
    fields.insert("model_version".into(), json!(version));
    fields.insert("reference_records".into(), json!(records.len()));
    Ok(fields)
}

#[cfg(test)]
mod tests {
    use super::*;
    use entity_dedup_service::blocking::{BlockingConfig, BlockingRule};
    use entity_dedup_service::dto::REQUIRED_FIELDS;
    use entity_dedup_service::model::{Comparator, FieldWeight, ScoringModel};
    use entity_dedup_service::response::Status;

    fn engine() -> Engine {
        let model = ScoringModel {
            version: "svc".into(),
            bias: -4.0,
            fields: REQUIRED_FIELDS
                .iter()
                .map(|f| FieldWeight {
                    field: f.to_string(),
                    comparator: Comparator::Exact,
                    weight: 2.0,
                    missing_weight: 0.0,
                })
                .collect(),
            blocking: BlockingConfig {
                rules: vec![BlockingRule::Exact {
                    field: "EMAIL".into(),
                }],
                max_block_size: None,
            },
        };
        let engine = Engine::new(model, 1).unwrap();
        let reference = REQUIRED_FIELDS
            .iter()
            .fold(Record::new("1"), |r, f| r.with_field(f, "same"));
        engine.index_reference(&[reference]).unwrap();
        engine
    }

    fn request(value: Value) -> MatchRequest {
        serde_json::from_value(value).unwrap()
    }

    fn full_record() -> Value {
        let object: Map<String, Value> = REQUIRED_FIELDS
            .iter()
            .map(|f| (f.to_string(), json!("same")))
            .collect();
        Value::Object(object)
    }

    #[test]
    fn single_record_match() {
        let req = request(json!({"mode": "record-match", "record": full_record()}));
        let fields = record_match(&engine(), &req).unwrap();
        assert_eq!(fields["duplicates_found"], json!(true));
        assert_eq!(fields["possible_duplicates"]["total_cases"], json!(1));
        assert_eq!(
            fields["possible_duplicates"]["matches"][0]["matching_record_id"],
            json!("1")
        );
    }

    #[test]
    fn missing_fields_are_named() {
        let mut record = full_record();
        record.as_object_mut().unwrap().remove("EMAIL");
        let req = request(json!({"mode": "record-match", "record": record}));
        let err = record_match(&engine(), &req).unwrap_err();
        assert!(matches!(err.status, Status::BadRequest));
        assert_eq!(err.msg, "Missing required fields: EMAIL in 'record'");
    }

    #[test]
    fn batch_reports_failing_record_index() {
        let req = request(json!({
            "mode": "record-match",
            "records": [full_record(), {"EMAIL": "x"}]
        }));
        let err = record_match(&engine(), &req).unwrap_err();
        assert!(err.msg.contains("record #2"));
    }

    #[test]
    fn batch_results_are_counted() {
        let req = request(json!({
            "mode": "record-match",
            "records": [full_record(), full_record()]
        }));
        let fields = record_match(&engine(), &req).unwrap();
        assert_eq!(fields["total_records_processed"], json!(2));
        assert_eq!(fields["bulk_results"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn request_without_records_is_rejected() {
        let req = request(json!({"mode": "record-match"}));
        let err = record_match(&engine(), &req).unwrap_err();
        assert_eq!(err.msg, "Missing 'record' or 'records'");
    }

    #[test]
    fn blocking_info_lists_keys_and_rules() {
        let req = request(json!({"mode": "blocking-info", "record": {"EMAIL": "Same"}}));
        let fields = blocking_info(&engine(), &req).unwrap();
        assert_eq!(fields["block_keys"], json!(["0:same"]));
        assert_eq!(fields["candidate_count"], json!(1));
        assert_eq!(fields["blocking_rules"], json!(["exact(EMAIL)"]));
    }
}
