use actix_cors::Cors;
use actix_web::{middleware::Logger, web, App, HttpServer};
use std::io;

mod config;
mod database;
mod identity;
mod models;
mod routes;

use crate::config::ChoiceConfig;

#[actix_web::main]
async fn main() -> io::Result<()> {
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));

    let config_path: String = std::env::var("SHARED_CONFIG_PATH")
        .unwrap_or_else(|_| String::from("./config/shared-config.json"));
    let choices: ChoiceConfig = match ChoiceConfig::load(&config_path) {
        Ok(choices) => choices,
        Err(error) => {
            log::error!("{error}");
            panic!("Failed to load shared config");
        }
    };

    let db_uri: String =
        std::env::var("MONGODB_URI").unwrap_or_else(|_| String::from("mongodb://localhost:27017"));

    database::connect(db_uri).await;
    identity::load_keys();

    let choices: web::Data<ChoiceConfig> = web::Data::new(choices);

    log::info!("listening on 127.0.0.1:8000");

    HttpServer::new(move || {
        App::new()
            .app_data(choices.clone())
            .wrap(Logger::default())
            .wrap(Cors::permissive())
            .wrap(identity::ActorMiddlewareFactory)
            .service(routes::incident::get_incident_statistics)
            .service(routes::incident::get_critical_incidents)
            .service(routes::incident::get_incidents)
            .service(routes::incident::create_incident)
            .service(routes::incident::get_incident)
            .service(routes::incident::update_incident)
            .service(routes::incident::patch_incident)
            .service(routes::incident::delete_incident)
            .service(routes::incident::update_incident_status)
            .service(routes::incident::get_incident_timeline)
            .service(routes::incident::get_incident_updates)
            .service(routes::incident::create_incident_update)
            .service(routes::incident_document::get_incident_documents)
            .service(routes::incident_document::create_incident_document)
            .service(routes::incident_document::get_incident_document)
            .service(routes::incident_document::update_incident_document)
            .service(routes::incident_document::patch_incident_document)
            .service(routes::incident_document::delete_incident_document)
    })
    .bind(("127.0.0.1", 8000))?
    .run()
    .await
}
