//! zdns-api: the decision HTTP API (C7), operational admin surface (C10),
//! local TAXII 2.1 server and STIX/feed sync routes (C4, C5, C6), RPZ export
//! (C9), and sinkhole/block-page rendering. `zdns-resolver` is the only
//! caller of `/dns/query`; everything else is administrative.

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use dotenv::dotenv;

use zdns_core::classifier::Classifier;
use zdns_core::{config, store};

mod blockpage;
mod decision;
mod error_response;
mod feed_routes;
mod model;
mod operational;
mod rpz_route;
mod state;
mod sync_timer;
mod taxii;

use state::AppState;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenv().ok();
    env_logger::init();

    let pool = store::open_store(&config::database_path())
        .await
        .expect("failed to open store");

    let loaded_model = config::classifier_model_path()
        .as_deref()
        .and_then(model::load_classifier_model);
    let classifier = Classifier::new(loaded_model);

    sync_timer::spawn(pool.clone());

    let state = web::Data::new(AppState::new(pool, classifier));

    let listen_addr = config::http_listen_addr();
    log::info!("[api] starting zdns-api on {listen_addr}");

    HttpServer::new(move || {
        App::new()
            .wrap(actix_web::middleware::Logger::default())
            .wrap(Cors::permissive())
            .app_data(state.clone())
            .service(decision::dns_query)
            .service(model::model_status)
            .service(model::train_model)
            .service(operational::metrics)
            .service(operational::events)
            .service(operational::devices)
            .service(operational::analytics)
            .service(operational::list_rules)
            .service(operational::create_rule)
            .service(operational::update_rule)
            .service(operational::delete_rule)
            .service(operational::list_lists)
            .service(operational::create_list)
            .service(operational::update_list)
            .service(operational::delete_list)
            .service(operational::list_status)
            .service(operational::pull_lists)
            .service(rpz_route::export)
            .service(taxii::discovery)
            .service(taxii::api_root)
            .service(taxii::collections)
            .service(taxii::collection)
            .service(taxii::manifest)
            .service(taxii::list_objects)
            .service(taxii::add_objects)
            .service(taxii::import_bundle)
            .service(taxii::pull)
            .service(taxii::stix_objects)
            .service(taxii::sync)
            .service(feed_routes::otx_pull)
            .service(feed_routes::misp_pull)
            .service(blockpage::malicious)
            .service(blockpage::warning)
            .service(blockpage::error)
            .service(blockpage::maintenance)
            .service(blockpage::root)
            .default_service(web::route().to(blockpage::catch_all))
    })
    .bind(&listen_addr)?
    .run()
    .await
}
