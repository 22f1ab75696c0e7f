use std::sync::Arc;

use actix_web::{App, HttpServer, dev::Server, middleware, web};

use crate::config::ServerConfig;
use crate::routes::{health_handler, json_error_handler, post_run_handler};
use crate::scheduler::Scheduler;

/// Registers every route of the service on an app
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.app_data(web::JsonConfig::default().error_handler(json_error_handler))
        .service(post_run_handler)
        .service(health_handler);
}

pub fn build_server(config: &ServerConfig, scheduler: Arc<Scheduler>) -> std::io::Result<Server> {
    let scheduler = web::Data::new(scheduler);

    let server = HttpServer::new(move || {
        App::new()
            .app_data(scheduler.clone())
            .wrap(middleware::Logger::default())
            .configure(configure)
    })
    .bind((config.bind_address.as_str(), config.bind_port))?
    .run();

    log::info!("Listening on {}:{}", config.bind_address, config.bind_port);
    Ok(server)
}
