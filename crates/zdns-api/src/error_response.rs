//! Maps `ZdnsError` to the status codes in spec §7. A free function rather
//! than an `actix_web::ResponseError` impl — `ZdnsError` lives in
//! `zdns-core`, so a trait impl here would need the orphan-rule workaround
//! of a newtype; the teacher's handlers just match on the error and build
//! the `HttpResponse` inline (see `virustotal::get_cached_or_fetch`
//! callers), so we follow that instead.

use actix_web::HttpResponse;
use zdns_core::error::ZdnsError;

pub fn to_response(err: &ZdnsError) -> HttpResponse {
    let body = serde_json::json!({ "error": err.to_string() });
    match err {
        ZdnsError::InputInvalid(_) => HttpResponse::BadRequest().json(body),
        ZdnsError::AuthMissing => HttpResponse::Unauthorized().json(body),
        ZdnsError::NotFound(_) => HttpResponse::NotFound().json(body),
        ZdnsError::PatternInvalid(_) => HttpResponse::BadRequest().json(body),
        ZdnsError::ExternalTimeout(_)
        | ZdnsError::ExternalMalformed(_)
        | ZdnsError::ModelUnavailable(_)
        | ZdnsError::StoreError(_) => HttpResponse::InternalServerError().json(body),
    }
}
