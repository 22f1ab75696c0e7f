use std::sync::Arc;

use actix_web::{HttpResponse, Responder, get, post, web};
use serde::Serialize;

use super::submit_error_response;
use crate::scheduler::{Scheduler, Submission};

#[post("/run")]
pub async fn post_run_handler(
    scheduler: web::Data<Arc<Scheduler>>,
    body: web::Json<Submission>,
) -> impl Responder {
    let submission = body.into_inner();
    let language = submission.language.clone();

    match scheduler.submit(submission).await {
        Ok(result) => {
            log::info!("Submission for {language} finished: {}", result.verdict);
            HttpResponse::Ok().json(result)
        }
        Err(e) => {
            log::debug!("Submission for {language} rejected: {e}");
            submit_error_response(&e)
        }
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    queued: usize,
    languages: Vec<String>,
}

#[get("/health")]
pub async fn health_handler(scheduler: web::Data<Arc<Scheduler>>) -> impl Responder {
    let mut languages: Vec<String> = scheduler
        .registry()
        .languages()
        .map(str::to_string)
        .collect();
    languages.sort();

    HttpResponse::Ok().json(HealthResponse {
        status: "ok",
        queued: scheduler.queued(),
        languages,
    })
}
