mod util;

use entity_dedup_service::dto::DedupConfig;
use entity_dedup_service::engine::{Cancellation, Engine};
use entity_dedup_service::error::ServiceError;
use entity_dedup_service::response::make_response_payload;
use entity_dedup_service::util::{get_region, get_workers, load_model, load_records};
use lambda_runtime::{run, service_fn, Context, Error, LambdaEvent};
use log::info;
use rusoto_core::{Client, Region};
use rusoto_s3::S3Client;
use serde_json::Value;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

// Time reserved after scoring for clustering and the result upload
const UPLOAD_MARGIN: Duration = Duration::from_secs(20);

#[tokio::main]
async fn main() -> Result<(), Error> {
    env_logger::init();
    let region = get_region()?;
    let region = &region;
    run(service_fn(move |event: LambdaEvent<DedupConfig>| async move {
        process(event, region).await
    }))
    .await?;
    Ok(())
}

async fn process(event: LambdaEvent<DedupConfig>, region: &Region) -> Result<Value, Error> {
    let (config, context) = event.into_parts();
    let result = dedup(config, &context, region).await;
    make_response_payload(result)
}

fn time_budget(context: &Context) -> Option<Duration> {
    let now = SystemTime::now().duration_since(UNIX_EPOCH).ok()?;
    let deadline = Duration::from_millis(context.deadline);
    deadline.checked_sub(now)?.checked_sub(UPLOAD_MARGIN)
}

async fn dedup(config: DedupConfig, context: &Context, region: &Region) -> Result<Value, ServiceError> {
    if !(0.0..=1.0).contains(&config.threshold) {
        return Err(ServiceError::bad_request(
            "Invalid threshold; must be a float between 0 and 1",
        ));
    }
    let start = Instant::now();
    let client = S3Client::new_with_client(Client::shared(), region.clone());
    let model = load_model(&client, &config.model).await?;
    let records = load_records(&client, &config.data).await?;
    info!(
        "Inputs downloaded in {:.4} secs",
        start.elapsed().as_secs_f64()
    );

    let engine = Engine::new(model, get_workers(config.workers))?;
    let cancel = match time_budget(context) {
        Some(budget) => Cancellation::with_timeout(budget),
        None if context.deadline == 0 => Cancellation::new(),
        None => Cancellation::with_timeout(Duration::ZERO),
    };
    let start = Instant::now();
    let annotated = engine.resolve_duplicates(&records, config.threshold, &cancel)?;
    info!(
        "Dedupe completed in {:.4} secs",
        start.elapsed().as_secs_f64()
    );
    util::push_result_file(&client, &config.data, &annotated).await
}
